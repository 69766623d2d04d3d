//! Resimulation bookkeeping: phases, per-particle policy and desync classification.

use crate::islands::IslandGraph;
use crate::particle::{Particle, ParticleId, ParticleStore};
use crate::rewind::HistoryWindow;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResimPhase {
    #[default]
    Idle,
    /// Rewound; corrections may be applied before stepping resumes
    RewoundPendingCorrection,
    Resimulating,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResimType {
    /// Everything is recomputed from the corrected state
    #[default]
    FullResim,
    /// Replays the recorded trajectory and only acts on other particles
    ResimAsSlave,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DesyncState {
    #[default]
    InSync,
    SoftDesync,
    HardDesync,
}

/// Answer to a query about a frame that has not been re-simulated yet.
#[derive(Clone, Debug, PartialEq)]
pub enum FutureState {
    Valid(Particle),
    /// The recorded state can no longer be trusted
    Desynced,
}

/// Particles out of sync after stepping one frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameDesync {
    /// Frame whose start state was compared
    pub frame: u64,
    pub states: BTreeMap<ParticleId, DesyncState>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResimReport {
    pub rewind_frame: u64,
    pub head: u64,
    pub frames: u64,
    pub per_frame: Vec<FrameDesync>,
    /// Classification at the end of the last resimulated frame
    pub final_states: BTreeMap<ParticleId, DesyncState>,
    /// Every particle that was hard desynced at some point
    pub hard_desynced: BTreeSet<ParticleId>,
}

impl ResimReport {
    pub fn state_at(&self, id: ParticleId, frame: u64) -> DesyncState {
        self.per_frame
            .iter()
            .find(|f| f.frame == frame)
            .and_then(|f| f.states.get(&id).copied())
            .unwrap_or_default()
    }
}

/// Component-wise comparison of the simulated state.
pub fn differs(live: &Particle, recorded: &Particle, tolerance: f32) -> bool {
    live.disabled != recorded.disabled
        || live.object_state != recorded.object_state
        || !live.position.abs_diff_eq(recorded.position, tolerance)
        || !live.rotation.abs_diff_eq(recorded.rotation, tolerance)
        || !live.velocity.abs_diff_eq(recorded.velocity, tolerance)
        || !live.angular_velocity.abs_diff_eq(recorded.angular_velocity, tolerance)
}

/// Per-particle classification for one frame.
///
/// Hard: corrected full-resim particles, and divergent full-resim particles whose
/// island holds no corrected particle. Anything else sharing an island with a hard
/// particle is soft, or (without the optimization) hard for full-resim particles.
/// Slaves are never hard.
pub fn classify(
    candidates: &[(ParticleId, ResimType, bool)],
    corrected: &BTreeSet<ParticleId>,
    islands: &mut IslandGraph,
    use_resim_optimization: bool,
) -> BTreeMap<ParticleId, DesyncState> {
    let corrected_islands: BTreeSet<usize> = corrected
        .iter()
        .filter_map(|id| islands.island_of(*id))
        .collect();

    let mut states = BTreeMap::new();
    let mut hard_islands = BTreeSet::new();
    for &(id, kind, diverged) in candidates {
        if kind == ResimType::ResimAsSlave {
            continue;
        }
        let island = islands.island_of(id);
        let explained = island.map(|i| corrected_islands.contains(&i)).unwrap_or(false);
        if corrected.contains(&id) || (diverged && !explained) {
            states.insert(id, DesyncState::HardDesync);
            hard_islands.extend(island);
        }
    }

    for &(id, kind, _) in candidates {
        if states.contains_key(&id) {
            continue;
        }
        let Some(island) = islands.island_of(id) else {
            continue;
        };
        if !hard_islands.contains(&island) {
            continue;
        }
        let state = match (use_resim_optimization, kind) {
            (true, _) => DesyncState::SoftDesync,
            (false, ResimType::FullResim) => DesyncState::HardDesync,
            (false, ResimType::ResimAsSlave) => continue,
        };
        states.insert(id, state);
    }
    states
}

/// State of one rewind/resimulate cycle plus the persistent per-particle policy.
#[derive(Debug, Default)]
pub struct ResimController {
    phase: ResimPhase,
    resim_types: BTreeMap<ParticleId, ResimType>,
    window: Option<HistoryWindow>,
    corrected: BTreeSet<ParticleId>,
    desync_since: BTreeMap<ParticleId, u64>,
    current: BTreeMap<ParticleId, DesyncState>,
    report: ResimReport,
}

impl ResimController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> ResimPhase {
        self.phase
    }

    pub fn is_idle(&self) -> bool {
        self.phase == ResimPhase::Idle
    }

    pub fn is_resimulating(&self) -> bool {
        self.phase == ResimPhase::Resimulating
    }

    pub fn resim_type(&self, id: ParticleId) -> ResimType {
        self.resim_types.get(&id).copied().unwrap_or_default()
    }

    pub fn set_resim_type(&mut self, id: ParticleId, kind: ResimType) {
        match kind {
            ResimType::FullResim => self.resim_types.remove(&id),
            ResimType::ResimAsSlave => self.resim_types.insert(id, kind),
        };
    }

    /// Slaves in id order.
    pub fn slaves(&self) -> Vec<ParticleId> {
        self.resim_types
            .iter()
            .filter(|(_, k)| **k == ResimType::ResimAsSlave)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn window(&self) -> Option<&HistoryWindow> {
        self.window.as_ref()
    }

    pub fn window_mut(&mut self) -> Option<&mut HistoryWindow> {
        self.window.as_mut()
    }

    pub fn corrected(&self) -> &BTreeSet<ParticleId> {
        &self.corrected
    }

    pub fn current_state(&self, id: ParticleId) -> DesyncState {
        self.current.get(&id).copied().unwrap_or_default()
    }

    // ========== Cycle ==========

    pub fn begin(&mut self, window: HistoryWindow) {
        assert!(self.is_idle(), "rewind requested while {:?}", self.phase);
        self.report = ResimReport {
            rewind_frame: window.start,
            head: window.end,
            ..ResimReport::default()
        };
        self.window = Some(window);
        self.corrected.clear();
        self.desync_since.clear();
        self.current.clear();
        self.phase = ResimPhase::RewoundPendingCorrection;
    }

    /// Marks `ids` as corrected: they are hard desynced from the rewind frame on.
    pub fn mark_corrected(&mut self, ids: impl IntoIterator<Item = ParticleId>) {
        assert_eq!(
            self.phase,
            ResimPhase::RewoundPendingCorrection,
            "corrections are only accepted right after a rewind"
        );
        let start = self.report.rewind_frame;
        for id in ids {
            if self.resim_type(id) == ResimType::ResimAsSlave {
                continue;
            }
            self.corrected.insert(id);
            self.desync_since.entry(id).or_insert(start);
            self.current.insert(id, DesyncState::HardDesync);
        }
    }

    pub fn start_resimulating(&mut self) {
        if self.phase == ResimPhase::RewoundPendingCorrection {
            self.phase = ResimPhase::Resimulating;
        }
    }

    /// Compares the state after stepping into `frame` with the recording.
    pub fn classify_frame(
        &mut self,
        frame: u64,
        particles: &ParticleStore,
        islands: &mut IslandGraph,
        use_resim_optimization: bool,
        tolerance: f32,
    ) {
        let Some(window) = self.window.as_ref() else {
            return;
        };
        let candidates: Vec<(ParticleId, ResimType, bool)> = particles
            .iter()
            .filter(|(_, p)| p.registered)
            .map(|(id, live)| {
                let diverged = window
                    .state_at(id, frame)
                    .map(|recorded| differs(live, recorded, tolerance))
                    .unwrap_or(true);
                (id, self.resim_type(id), diverged)
            })
            .collect();

        let states = classify(&candidates, &self.corrected, islands, use_resim_optimization);
        for (id, state) in &states {
            if *state == DesyncState::HardDesync {
                self.desync_since.entry(*id).or_insert(frame);
                self.report.hard_desynced.insert(*id);
            }
        }
        self.current = states.clone();
        self.report.per_frame.push(FrameDesync { frame, states });
        self.report.frames += 1;
    }

    /// Recorded state of `id` at `frame` unless the particle desynced before it.
    pub fn future_state(&self, id: ParticleId, frame: u64) -> Option<FutureState> {
        let window = self.window.as_ref()?;
        if self.desync_since.get(&id).is_some_and(|since| *since <= frame) {
            return Some(FutureState::Desynced);
        }
        window
            .state_at(id, frame)
            .map(|state| FutureState::Valid(state.clone()))
    }

    /// Ends the cycle and hands back the report.
    pub fn finish(&mut self) -> ResimReport {
        self.report.final_states = std::mem::take(&mut self.current);
        self.report.hard_desynced.extend(self.corrected.iter().copied());
        self.window = None;
        self.corrected.clear();
        self.desync_since.clear();
        self.phase = ResimPhase::Idle;
        std::mem::take(&mut self.report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particle::Particle;
    use glam::Vec3;

    fn world(n: usize) -> ParticleStore {
        let mut store = ParticleStore::new();
        for i in 0..n {
            store.add(Particle::empty(Vec3::X * i as f32));
        }
        store
    }

    fn islands(store: &ParticleStore, pairs: &[(u32, u32)]) -> IslandGraph {
        let contacts: Vec<_> = pairs
            .iter()
            .map(|(a, b)| (ParticleId(*a), Some(ParticleId(*b))))
            .collect();
        let mut graph = IslandGraph::new();
        graph.rebuild(store, &contacts, &[]);
        graph
    }

    // ========== Classification Tests ==========

    #[test]
    fn test_corrected_neighbours_go_soft() {
        let store = world(3);
        let mut graph = islands(&store, &[(0, 1)]);
        let corrected: BTreeSet<_> = [ParticleId(0)].into();
        let candidates = [
            (ParticleId(0), ResimType::FullResim, true),
            (ParticleId(1), ResimType::FullResim, true),
            (ParticleId(2), ResimType::FullResim, false),
        ];
        let states = classify(&candidates, &corrected, &mut graph, true);
        assert_eq!(states.get(&ParticleId(0)), Some(&DesyncState::HardDesync));
        assert_eq!(states.get(&ParticleId(1)), Some(&DesyncState::SoftDesync));
        assert_eq!(states.get(&ParticleId(2)), None);
    }

    #[test]
    fn test_without_optimization_neighbours_go_hard() {
        let store = world(3);
        let mut graph = islands(&store, &[(0, 1), (1, 2)]);
        let corrected: BTreeSet<_> = [ParticleId(0)].into();
        let candidates = [
            (ParticleId(0), ResimType::FullResim, true),
            (ParticleId(1), ResimType::FullResim, false),
            (ParticleId(2), ResimType::ResimAsSlave, false),
        ];
        let states = classify(&candidates, &corrected, &mut graph, false);
        assert_eq!(states.get(&ParticleId(1)), Some(&DesyncState::HardDesync));
        assert_eq!(states.get(&ParticleId(2)), None);
    }

    #[test]
    fn test_unexplained_divergence_is_hard() {
        let store = world(2);
        let mut graph = islands(&store, &[]);
        let candidates = [(ParticleId(1), ResimType::FullResim, true)];
        let states = classify(&candidates, &BTreeSet::new(), &mut graph, true);
        assert_eq!(states.get(&ParticleId(1)), Some(&DesyncState::HardDesync));
    }

    #[test]
    fn test_slave_is_never_hard() {
        let store = world(2);
        let mut graph = islands(&store, &[(0, 1)]);
        let corrected: BTreeSet<_> = [ParticleId(0)].into();
        let candidates = [
            (ParticleId(0), ResimType::FullResim, true),
            (ParticleId(1), ResimType::ResimAsSlave, true),
        ];
        let states = classify(&candidates, &corrected, &mut graph, true);
        assert_eq!(states.get(&ParticleId(1)), Some(&DesyncState::SoftDesync));
    }

    #[test]
    fn test_differs_respects_tolerance() {
        let a = Particle::empty(Vec3::ZERO);
        let mut b = a.clone();
        b.position.x = 1.0e-7;
        assert!(!differs(&a, &b, 1.0e-5));
        b.velocity.y = 0.1;
        assert!(differs(&a, &b, 1.0e-5));
    }

    // ========== Controller Tests ==========

    #[test]
    fn test_resim_type_defaults_to_full() {
        let mut controller = ResimController::new();
        assert_eq!(controller.resim_type(ParticleId(3)), ResimType::FullResim);
        controller.set_resim_type(ParticleId(3), ResimType::ResimAsSlave);
        assert_eq!(controller.slaves(), vec![ParticleId(3)]);
        controller.set_resim_type(ParticleId(3), ResimType::FullResim);
        assert!(controller.slaves().is_empty());
    }
}
