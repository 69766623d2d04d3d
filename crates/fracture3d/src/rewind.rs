//! Ring-buffered history of particle state, cluster topology and frame inputs.
//!
//! Slot `F % capacity` describes frame `F`: the state at the start of the frame, the
//! commands that were applied while stepping it and the `dt` it was stepped with.
//! Particle state is stored sparsely; a particle only gets a record in frames where it
//! differs from its previous record. Records pushed out of the ring are folded into a
//! per-particle baseline so the last known state of a long-idle particle survives.

use crate::cluster::ClusterManager;
use crate::commands::SolverCommand;
use crate::config::RewindConfig;
use crate::particle::{Particle, ParticleId, ParticleStore};
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct FrameRecord {
    pub frame: u64,
    /// Step size used for `frame -> frame + 1`; `None` until the frame is stepped
    pub dt: Option<f32>,
    pub inputs: Vec<SolverCommand>,
    pub time: f64,
    pub num_particles: usize,
    pub topology: Arc<ClusterManager>,
    /// Changed particles, sorted by id
    pub records: Vec<(ParticleId, Particle)>,
}

impl FrameRecord {
    pub fn record(&self, id: ParticleId) -> Option<&Particle> {
        self.records
            .binary_search_by_key(&id, |(i, _)| *i)
            .ok()
            .map(|i| &self.records[i].1)
    }
}

/// Recorded frames handed out when the store rewinds: the rewind frame up to the old
/// head, plus the full state at the rewind frame.
#[derive(Clone, Debug)]
pub struct HistoryWindow {
    pub start: u64,
    pub end: u64,
    frames: Vec<FrameRecord>,
    base: Vec<Option<Particle>>,
}

impl HistoryWindow {
    pub fn contains(&self, frame: u64) -> bool {
        (self.start..=self.end).contains(&frame)
    }

    pub fn frame(&self, frame: u64) -> Option<&FrameRecord> {
        if !self.contains(frame) {
            return None;
        }
        self.frames.get((frame - self.start) as usize)
    }

    /// Originally recorded state of `id` at the start of `frame`.
    pub fn state_at(&self, id: ParticleId, frame: u64) -> Option<&Particle> {
        if !self.contains(frame) {
            return None;
        }
        let upto = (frame - self.start) as usize;
        self.frames[1..=upto]
            .iter()
            .rev()
            .find_map(|f| f.record(id))
            .or_else(|| self.base.get(id.index()).and_then(Option::as_ref))
    }

    pub fn inputs(&self, frame: u64) -> &[SolverCommand] {
        self.frame(frame).map(|f| f.inputs.as_slice()).unwrap_or(&[])
    }

    pub fn dt(&self, frame: u64) -> Option<f32> {
        self.frame(frame).and_then(|f| f.dt)
    }

    pub fn replace_inputs(&mut self, frame: u64, inputs: Vec<SolverCommand>) -> bool {
        if !self.contains(frame) || frame == self.end {
            return false;
        }
        let index = (frame - self.start) as usize;
        self.frames[index].inputs = inputs;
        true
    }

    /// Distinct particles recorded after the rewind frame.
    pub fn dirty_particles(&self) -> BTreeSet<ParticleId> {
        self.frames
            .iter()
            .skip(1)
            .flat_map(|f| f.records.iter().map(|(id, _)| *id))
            .collect()
    }
}

#[derive(Debug)]
pub struct RewindData {
    capacity: usize,
    use_resim_optimization: bool,
    desync_tolerance: f32,
    slots: Vec<Option<FrameRecord>>,
    head: u64,
    enabled_frame: u64,
    baseline: Vec<Option<Particle>>,
    last_recorded: Vec<Option<Particle>>,
    last_topology: Arc<ClusterManager>,
}

impl RewindData {
    /// Starts capture at `frame` with every particle recorded.
    pub fn new(
        config: &RewindConfig,
        frame: u64,
        time: f64,
        particles: &ParticleStore,
        clusters: &ClusterManager,
    ) -> Self {
        assert!(config.capacity > 0, "rewind capacity must be positive");
        let mut data = Self {
            capacity: config.capacity,
            use_resim_optimization: config.use_resim_optimization,
            desync_tolerance: config.desync_tolerance,
            slots: vec![None; config.capacity],
            head: frame,
            enabled_frame: frame,
            baseline: Vec::new(),
            last_recorded: Vec::new(),
            last_topology: Arc::new(clusters.clone()),
        };
        data.write_slot(frame, time, particles, clusters);
        log::info!(
            "rewind capture enabled at frame {frame} (capacity {})",
            config.capacity
        );
        data
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn use_resim_optimization(&self) -> bool {
        self.use_resim_optimization
    }

    pub fn desync_tolerance(&self) -> f32 {
        self.desync_tolerance
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn enabled_frame(&self) -> u64 {
        self.enabled_frame
    }

    pub fn oldest_frame(&self) -> u64 {
        (self.head + 1)
            .saturating_sub(self.capacity as u64)
            .max(self.enabled_frame)
    }

    fn slot(&self, frame: u64) -> Option<&FrameRecord> {
        if frame < self.oldest_frame() || frame > self.head {
            return None;
        }
        self.slots[(frame % self.capacity as u64) as usize]
            .as_ref()
            .filter(|r| r.frame == frame)
    }

    /// Records the state at the start of `frame`, which must directly follow the head.
    pub fn record_frame(
        &mut self,
        frame: u64,
        time: f64,
        particles: &ParticleStore,
        clusters: &ClusterManager,
    ) {
        assert_eq!(frame, self.head + 1, "rewind frames must be recorded in order");
        self.head = frame;
        self.write_slot(frame, time, particles, clusters);
    }

    fn write_slot(&mut self, frame: u64, time: f64, particles: &ParticleStore, clusters: &ClusterManager) {
        let index = (frame % self.capacity as u64) as usize;
        if let Some(evicted) = self.slots[index].take() {
            for (id, particle) in evicted.records {
                if self.baseline.len() <= id.index() {
                    self.baseline.resize(id.index() + 1, None);
                }
                self.baseline[id.index()] = Some(particle);
            }
        }

        self.last_recorded.resize(particles.len(), None);
        let mut records = Vec::new();
        for (id, particle) in particles.iter() {
            let slot = &mut self.last_recorded[id.index()];
            if slot.as_ref() != Some(particle) {
                *slot = Some(particle.clone());
                records.push((id, particle.clone()));
            }
        }

        if self.last_topology.generation() != clusters.generation() {
            self.last_topology = Arc::new(clusters.clone());
        }

        log::trace!("rewind: frame {frame} recorded {} dirty particles", records.len());
        self.slots[index] = Some(FrameRecord {
            frame,
            dt: None,
            inputs: Vec::new(),
            time,
            num_particles: particles.len(),
            topology: self.last_topology.clone(),
            records,
        });
    }

    /// Attaches the step inputs of `frame` to its slot.
    pub fn record_step_inputs(&mut self, frame: u64, dt: f32, inputs: Vec<SolverCommand>) {
        let capacity = self.capacity as u64;
        match self.slots[(frame % capacity) as usize].as_mut() {
            Some(record) if record.frame == frame => {
                record.dt = Some(dt);
                record.inputs = inputs;
            }
            _ => log::warn!("rewind: no slot for frame {frame} inputs"),
        }
    }

    /// Re-records `ids` in the head slot after they were edited in place.
    pub fn amend_head(&mut self, particles: &ParticleStore, ids: &[ParticleId]) {
        let head = self.head;
        let capacity = self.capacity as u64;
        let Some(record) = self.slots[(head % capacity) as usize]
            .as_mut()
            .filter(|r| r.frame == head)
        else {
            return;
        };
        for &id in ids {
            let Some(particle) = particles.try_get(id) else {
                continue;
            };
            match record.records.binary_search_by_key(&id, |(i, _)| *i) {
                Ok(i) => record.records[i].1 = particle.clone(),
                Err(i) => record.records.insert(i, (id, particle.clone())),
            }
            if let Some(slot) = self.last_recorded.get_mut(id.index()) {
                *slot = Some(particle.clone());
            }
        }
    }

    // ========== Queries ==========

    pub fn past_state_at_frame(&self, id: ParticleId, frame: u64) -> Option<&Particle> {
        let record = self.slot(frame)?;
        if id.index() >= record.num_particles {
            return None;
        }
        (self.oldest_frame()..=frame)
            .rev()
            .filter_map(|f| self.slot(f))
            .find_map(|f| f.record(id))
            .or_else(|| self.baseline.get(id.index()).and_then(Option::as_ref))
    }

    pub fn delta_time_for_frame(&self, frame: u64) -> Option<f32> {
        self.slot(frame).and_then(|r| r.dt)
    }

    pub fn inputs_for_frame(&self, frame: u64) -> Option<&[SolverCommand]> {
        self.slot(frame).map(|r| r.inputs.as_slice())
    }

    pub fn time_at_frame(&self, frame: u64) -> Option<f64> {
        self.slot(frame).map(|r| r.time)
    }

    pub fn topology_at_frame(&self, frame: u64) -> Option<&Arc<ClusterManager>> {
        self.slot(frame).map(|r| &r.topology)
    }

    pub fn dirty_particles(&self, frame: u64) -> Vec<ParticleId> {
        self.slot(frame)
            .map(|r| r.records.iter().map(|(id, _)| *id).collect())
            .unwrap_or_default()
    }

    /// Distinct particles with at least one record in the retained window.
    pub fn num_dirty_particles(&self) -> usize {
        (self.oldest_frame()..=self.head)
            .filter_map(|f| self.slot(f))
            .flat_map(|r| r.records.iter().map(|(id, _)| *id))
            .collect::<BTreeSet<_>>()
            .len()
    }

    // ========== Rewind ==========

    /// Whether the live world can be restored to the start of `frame`. Particles
    /// allocated after `frame` must all be internal cluster parents.
    pub fn can_rewind_to(&self, frame: u64, particles: &ParticleStore) -> bool {
        let Some(record) = self.slot(frame) else {
            return false;
        };
        (record.num_particles..particles.len())
            .all(|i| particles.list[i].internal)
    }

    /// Restores particles and topology to the start of `frame` and makes it the head.
    /// Returns the history that was recorded from `frame` to the old head.
    pub fn rewind(
        &mut self,
        frame: u64,
        particles: &mut ParticleStore,
        clusters: &mut ClusterManager,
    ) -> Option<HistoryWindow> {
        if !self.can_rewind_to(frame, particles) {
            return None;
        }
        let record = self.slot(frame)?;
        let num_particles = record.num_particles;
        let topology = record.topology.clone();

        let base: Vec<Option<Particle>> = (0..num_particles)
            .map(|i| self.past_state_at_frame(ParticleId::from_index(i), frame).cloned())
            .collect();
        let frames: Vec<FrameRecord> = (frame..=self.head)
            .filter_map(|f| self.slot(f).cloned())
            .collect();
        let window = HistoryWindow {
            start: frame,
            end: self.head,
            frames,
            base: base.clone(),
        };

        particles.truncate(num_particles);
        for (i, state) in base.iter().enumerate() {
            if let Some(state) = state {
                particles.list[i] = state.clone();
            }
        }
        *clusters = (*topology).clone();

        let capacity = self.capacity as u64;
        for f in (frame + 1)..=self.head {
            self.slots[(f % capacity) as usize] = None;
        }
        self.head = frame;
        self.last_recorded = base;
        self.last_topology = topology;

        log::debug!("rewound to frame {frame} ({} particles restored)", num_particles);
        Some(window)
    }
}
