//! The solver: owns the particles and clusters of one world and advances them a frame
//! at a time, recording history for rewind when capture is on.

use crate::cluster::{ClusterCreationParameters, ClusterManager};
use crate::collection::{self, CollectionHandle, CollectionParams, RestCollection};
use crate::commands::{CommandQueue, SolverCommand};
use crate::config::{RewindConfig, SolverConfig};
use crate::constants::DEFAULT_DT;
use crate::events::{BreakingEvent, CollisionEvent, EventManager};
use crate::evolution::{ConstraintSolver, Contact, ImpulseSolver, SolveView};
use crate::field::apply_field_command;
use crate::islands::IslandGraph;
use crate::particle::{Particle, ParticleId, ParticleStore};
use crate::resim::{DesyncState, FutureState, ResimController, ResimPhase, ResimReport, ResimType};
use crate::rewind::RewindData;
use crate::scope::assert_physics_scope;
use crate::strain::StrainModel;
use crate::threading::{ParticleView, SolverResults};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SolverId(pub u32);

impl fmt::Display for SolverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "solver{}", self.0)
    }
}

pub struct Solver {
    id: SolverId,
    config: SolverConfig,
    particles: ParticleStore,
    clusters: ClusterManager,
    evolution: Box<dyn ConstraintSolver>,
    strain: StrainModel,
    islands: IslandGraph,
    events: EventManager,
    commands: CommandQueue,
    /// Outstanding queued registrations per union group. Not part of rewound state.
    pending_cluster_groups: BTreeMap<i32, u32>,
    collections: BTreeMap<u64, CollectionHandle>,
    next_collection_key: u64,
    frame: u64,
    time: f64,
    rewind: Option<RewindData>,
    resim: ResimController,
    last_desync: BTreeMap<ParticleId, DesyncState>,
    last_contacts: Vec<Contact>,
}

impl Solver {
    pub fn new(config: SolverConfig) -> Self {
        Self::with_id(SolverId::default(), config)
    }

    pub fn with_id(id: SolverId, config: SolverConfig) -> Self {
        let clusters = ClusterManager::new(&config.clustering);
        let mut solver = Self {
            id,
            evolution: Box::new(ImpulseSolver::from_config(&config)),
            strain: StrainModel::from_config(&config.clustering),
            events: EventManager::new(config.collision_filter.clone(), config.breaking_filter.clone()),
            particles: ParticleStore::new(),
            clusters,
            islands: IslandGraph::new(),
            commands: CommandQueue::new(),
            pending_cluster_groups: BTreeMap::new(),
            collections: BTreeMap::new(),
            next_collection_key: 0,
            frame: 0,
            time: 0.0,
            rewind: None,
            resim: ResimController::new(),
            last_desync: BTreeMap::new(),
            last_contacts: Vec::new(),
            config,
        };
        if let Some(rewind) = solver.config.rewind.clone() {
            solver.enable_rewind_capture_with(&rewind);
        }
        log::debug!("{id} created");
        solver
    }

    /// Replaces the built-in impulse solver.
    pub fn with_evolution(mut self, evolution: Box<dyn ConstraintSolver>) -> Self {
        self.evolution = evolution;
        self
    }

    // ========== Accessors ==========

    pub fn id(&self) -> SolverId {
        self.id
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn particles(&self) -> &ParticleStore {
        &self.particles
    }

    pub fn particle(&self, id: ParticleId) -> &Particle {
        &self.particles[id]
    }

    /// Direct access for setup code. Changes made here bypass the command queue.
    pub fn particles_mut(&mut self) -> &mut ParticleStore {
        &mut self.particles
    }

    pub fn clusters(&self) -> &ClusterManager {
        &self.clusters
    }

    pub fn events(&self) -> &EventManager {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut EventManager {
        &mut self.events
    }

    pub fn last_contacts(&self) -> &[Contact] {
        &self.last_contacts
    }

    pub fn commands(&self) -> &CommandQueue {
        &self.commands
    }

    pub fn collection(&self, key: u64) -> Option<&CollectionHandle> {
        self.collections.get(&key)
    }

    pub fn pending_registrations(&self, group: i32) -> u32 {
        self.pending_cluster_groups.get(&group).copied().unwrap_or(0)
    }

    pub fn resim_phase(&self) -> ResimPhase {
        self.resim.phase()
    }

    // ========== Registration ==========

    pub fn register_particle(&mut self, mut particle: Particle) -> ParticleId {
        particle.spawn_frame = self.frame;
        particle.registered = true;
        particle.internal = false;
        self.particles.add(particle)
    }

    pub fn register_collection(&mut self, rest: &RestCollection, params: &CollectionParams) -> CollectionHandle {
        collection::register_collection(&mut self.particles, &mut self.clusters, rest, params, self.frame)
    }

    /// Queues a collection for registration at the start of the current frame's step.
    /// Its union group does not merge until every queued member has registered.
    pub fn queue_collection(&mut self, rest: Arc<RestCollection>, params: CollectionParams) -> u64 {
        let key = self.next_collection_key;
        self.next_collection_key += 1;
        self.schedule(self.frame, SolverCommand::RegisterCollection { key, rest, params });
        key
    }

    pub fn unregister_collection(&mut self, handle: &CollectionHandle) {
        collection::unregister_collection(&mut self.particles, &mut self.clusters, handle);
    }

    // ========== Commands ==========

    pub fn enqueue(&mut self, command: SolverCommand) {
        self.schedule(self.frame, command);
    }

    pub fn enqueue_at(&mut self, frame: u64, command: SolverCommand) {
        if frame < self.frame {
            log::warn!("command for past frame {frame} runs at frame {}", self.frame);
        }
        self.schedule(frame.max(self.frame), command);
    }

    /// Queues `command` for `frame`. While rewound the resimulation replays recorded
    /// inputs only, so new commands wait for the head frame. Group registrations are
    /// counted until they run.
    fn schedule(&mut self, frame: u64, command: SolverCommand) {
        let frame = match self.resim.window().map(|w| w.end) {
            Some(head) if frame < head => {
                log::warn!(
                    "{}: command for frame {frame} queued while {:?}, runs at head frame {head}",
                    self.id,
                    self.resim.phase()
                );
                head
            }
            _ => frame,
        };
        if let SolverCommand::RegisterCollection { params, .. } = &command {
            if params.cluster_group_index > 0 {
                *self
                    .pending_cluster_groups
                    .entry(params.cluster_group_index)
                    .or_insert(0) += 1;
            }
        }
        self.commands.push(frame, command);
    }

    // ========== Clustering ==========

    pub fn create_cluster_particle(
        &mut self,
        children: &[ParticleId],
        params: &ClusterCreationParameters,
    ) -> Option<ParticleId> {
        let created = self
            .clusters
            .create_cluster_particle(&mut self.particles, children, params)?;
        // Caller-made parents are not re-created by resimulation, so rewind must not
        // truncate them.
        let parent = &mut self.particles[created];
        parent.spawn_frame = self.frame;
        parent.internal = false;
        Some(created)
    }

    pub fn deactivate_cluster_particle(&mut self, id: ParticleId) -> Vec<ParticleId> {
        if !self.particles.contains(id) {
            return Vec::new();
        }
        self.clusters.deactivate_cluster_particle(&mut self.particles, id)
    }

    pub fn release_cluster_particles(&mut self, ids: &[ParticleId]) -> Vec<ParticleId> {
        self.clusters.release_cluster_particles(&mut self.particles, ids)
    }

    // ========== Stepping ==========

    /// Runs one frame with the commands queued for it.
    pub fn step(&mut self, dt: f32) {
        assert!(
            self.resim.is_idle(),
            "{}: cannot step forward while {:?}",
            self.id,
            self.resim.phase()
        );
        let inputs = self.commands.drain_frame(self.frame);
        self.advance_frame(dt, inputs);
    }

    fn advance_frame(&mut self, dt: f32, inputs: Vec<SolverCommand>) {
        let frame = self.frame;
        let resimulating = self.resim.is_resimulating();

        let mut recorded = Vec::with_capacity(inputs.len());
        let mut strain_fields = Vec::new();
        for command in inputs {
            if command.is_recorded_input() {
                recorded.push(command.clone());
            }
            if command.is_strain_field() {
                strain_fields.push(command);
            } else {
                self.apply_command(command);
            }
        }

        let pending = &self.pending_cluster_groups;
        self.clusters.union_cluster_groups(
            &mut self.particles,
            self.config.clustering.union_damage_threshold,
            |group| pending.get(&group).copied().unwrap_or(0) == 0,
        );

        let slaves: Vec<ParticleId> = if resimulating {
            self.resim
                .slaves()
                .into_iter()
                .filter(|id| self.particles.contains(*id))
                .collect()
        } else {
            Vec::new()
        };
        let view = SolveView {
            kinematic_override: &slaves,
        };
        let contacts = self.evolution.advance(&mut self.particles, &view, dt);

        if resimulating {
            self.force_slaves(&slaves, frame + 1);
        }

        self.strain
            .accumulate_collision_strain(&mut self.particles, &self.clusters, &contacts);
        for command in strain_fields {
            if let SolverCommand::Field(field) = command {
                apply_field_command(&field, &mut self.particles, &mut self.clusters, frame);
            }
        }

        let plan = self.strain.evaluate(&self.particles, &self.clusters);
        if !plan.is_empty() {
            let detached = self.strain.execute(&plan, &mut self.particles, &mut self.clusters);
            for (parent, pieces) in detached {
                for piece in pieces {
                    let p = &self.particles[piece];
                    self.events.push_breaking(BreakingEvent {
                        frame,
                        particle: piece,
                        parent,
                        position: p.position,
                        velocity: p.velocity,
                        angular_velocity: p.angular_velocity,
                        mass: p.mass,
                        volume: p.volume(),
                    });
                }
            }
        }
        StrainModel::reset(&mut self.particles);

        let pairs: Vec<_> = contacts.iter().map(|c| (c.particle, c.other)).collect();
        self.islands.rebuild(&self.particles, &pairs, &slaves);

        for contact in &contacts {
            let p = &self.particles[contact.particle];
            self.events.push_collision(CollisionEvent {
                frame,
                particle: contact.particle,
                other: contact.other,
                position: contact.point,
                normal: contact.normal,
                impulse: contact.impulse,
                mass: p.mass,
                velocity: p.velocity,
                volume: p.volume(),
            });
        }
        self.events.dispatch(!resimulating);

        self.frame = frame + 1;
        self.time += f64::from(dt);

        if let Some(rewind) = self.rewind.as_mut() {
            rewind.record_step_inputs(frame, dt, recorded);
            rewind.record_frame(self.frame, self.time, &self.particles, &self.clusters);
        }
        if resimulating {
            let (optimization, tolerance) = self
                .rewind
                .as_ref()
                .map(|r| (r.use_resim_optimization(), r.desync_tolerance()))
                .unwrap_or((false, 0.0));
            self.resim
                .classify_frame(self.frame, &self.particles, &mut self.islands, optimization, tolerance);
        }
        self.last_contacts = contacts;
        log::trace!("{} stepped frame {frame} (dt {dt:.4})", self.id);
    }

    /// Puts slaves back on their recorded trajectory for `frame`.
    fn force_slaves(&mut self, slaves: &[ParticleId], frame: u64) {
        let Some(window) = self.resim.window() else {
            return;
        };
        for &id in slaves {
            let Some(recorded) = window.state_at(id, frame) else {
                continue;
            };
            let particle = &mut self.particles[id];
            particle.set_object_state(recorded.object_state);
            particle.position = recorded.position;
            particle.rotation = recorded.rotation;
            particle.velocity = recorded.velocity;
            particle.angular_velocity = recorded.angular_velocity;
            particle.sleep_counter = recorded.sleep_counter;
        }
    }

    fn apply_command(&mut self, command: SolverCommand) {
        match command {
            SolverCommand::Field(field) => {
                apply_field_command(&field, &mut self.particles, &mut self.clusters, self.frame);
            }
            SolverCommand::DeactivateCluster(id) => {
                self.deactivate_cluster_particle(id);
            }
            SolverCommand::ReleaseClusterParticles(ids) => {
                self.release_cluster_particles(&ids);
            }
            SolverCommand::SetPosition(id, position) => self.with_particle(id, |p| p.position = position),
            SolverCommand::SetRotation(id, rotation) => {
                self.with_particle(id, |p| p.rotation = rotation.normalize())
            }
            SolverCommand::SetLinearVelocity(id, velocity) => {
                self.with_particle(id, |p| p.velocity = velocity)
            }
            SolverCommand::SetAngularVelocity(id, angular_velocity) => {
                self.with_particle(id, |p| p.angular_velocity = angular_velocity)
            }
            SolverCommand::AddForce(id, force) => self.with_particle(id, |p| p.force += force),
            SolverCommand::AddTorque(id, torque) => self.with_particle(id, |p| p.torque += torque),
            SolverCommand::ApplyImpulse {
                particle,
                impulse,
                point,
            } => self.with_particle(particle, |p| {
                let r = point - p.position;
                p.velocity += impulse * p.inv_mass;
                p.angular_velocity += p.world_inv_inertia() * r.cross(impulse);
            }),
            SolverCommand::SetObjectState(id, state) => {
                if let Some(particle) = self.particles.try_get_mut(id) {
                    particle.set_object_state(state);
                    let mut cursor = self.clusters.parent(id);
                    while let Some(parent) = cursor {
                        self.clusters.update_kinematic_properties(&mut self.particles, parent);
                        cursor = self.clusters.parent(parent);
                    }
                } else {
                    log::warn!("set state ignored: unknown particle {id}");
                }
            }
            SolverCommand::RegisterCollection { key, rest, params } => {
                let handle = self.register_collection(&rest, &params);
                let group = params.cluster_group_index;
                if let Some(count) = self.pending_cluster_groups.get_mut(&group) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        self.pending_cluster_groups.remove(&group);
                    }
                }
                self.collections.insert(key, handle);
            }
        }
    }

    /// Wakes an existing particle and applies an edit to it.
    fn with_particle(&mut self, id: ParticleId, edit: impl FnOnce(&mut Particle)) {
        match self.particles.try_get_mut(id) {
            Some(particle) => {
                particle.wake();
                particle.sleep_counter = 0;
                edit(particle);
            }
            None => log::warn!("command ignored: unknown particle {id}"),
        }
    }

    // ========== Rewind ==========

    pub fn enable_rewind_capture(&mut self, capacity: usize, use_resim_optimization: bool) {
        let config = RewindConfig {
            capacity,
            use_resim_optimization,
            ..self.config.rewind.clone().unwrap_or_default()
        };
        self.enable_rewind_capture_with(&config);
    }

    fn enable_rewind_capture_with(&mut self, config: &RewindConfig) {
        self.rewind = Some(RewindData::new(
            config,
            self.frame,
            self.time,
            &self.particles,
            &self.clusters,
        ));
        self.config.rewind = Some(config.clone());
    }

    pub fn rewind_data(&self) -> Option<&RewindData> {
        self.rewind.as_ref()
    }

    pub fn past_state_at_frame(&self, id: ParticleId, frame: u64) -> Option<&Particle> {
        self.rewind.as_ref()?.past_state_at_frame(id, frame)
    }

    /// Restores the world to the start of `frame`. Returns `false`, leaving the
    /// simulation untouched, when the frame is outside the retained history.
    pub fn rewind_to_frame(&mut self, frame: u64) -> bool {
        assert_physics_scope("rewind_to_frame");
        if !self.resim.is_idle() {
            log::warn!("{}: rewind to {frame} refused while {:?}", self.id, self.resim.phase());
            return false;
        }
        let Some(rewind) = self.rewind.as_mut() else {
            log::warn!("{}: rewind to {frame} refused, capture is off", self.id);
            return false;
        };
        let Some(window) = rewind.rewind(frame, &mut self.particles, &mut self.clusters) else {
            log::debug!(
                "{}: rewind to {frame} refused (history {}..={})",
                self.id,
                rewind.oldest_frame(),
                rewind.head()
            );
            return false;
        };
        if let Some(time) = window.frame(frame).map(|f| f.time) {
            self.time = time;
        }
        self.frame = frame;
        self.last_contacts.clear();
        self.islands = IslandGraph::new();
        log::info!("{}: rewound {} frames to {frame}", self.id, window.end - frame);
        self.resim.begin(window);
        true
    }

    /// Edits the restored state before resimulation. Every particle the edit changes
    /// is marked corrected and its new state replaces the recorded one.
    pub fn correct<R>(&mut self, edit: impl FnOnce(&mut ParticleStore) -> R) -> R {
        assert_eq!(
            self.resim.phase(),
            ResimPhase::RewoundPendingCorrection,
            "{}: corrections need a pending rewind",
            self.id
        );
        let before = self.particles.list.clone();
        let result = edit(&mut self.particles);
        let changed: Vec<ParticleId> = self
            .particles
            .iter()
            .filter(|(id, p)| before.get(id.index()) != Some(*p))
            .map(|(id, _)| id)
            .collect();
        if let Some(rewind) = self.rewind.as_mut() {
            rewind.amend_head(&self.particles, &changed);
        }
        log::debug!("{}: {} particles corrected", self.id, changed.len());
        self.resim.mark_corrected(changed);
        result
    }

    /// Swaps the recorded inputs used when resimulating `frame`.
    pub fn replace_frame_inputs(&mut self, frame: u64, inputs: Vec<SolverCommand>) -> bool {
        if self.resim.is_idle() || frame < self.frame {
            return false;
        }
        self.resim
            .window_mut()
            .map(|w| w.replace_inputs(frame, inputs))
            .unwrap_or(false)
    }

    pub fn set_resim_type(&mut self, id: ParticleId, kind: ResimType) {
        self.resim.set_resim_type(id, kind);
    }

    pub fn resim_type(&self, id: ParticleId) -> ResimType {
        self.resim.resim_type(id)
    }

    /// Steps from the rewind frame back to the original head with the recorded inputs.
    pub fn complete_resim(&mut self) -> ResimReport {
        assert_physics_scope("complete_resim");
        assert!(!self.resim.is_idle(), "{}: complete_resim without a rewind", self.id);
        self.resim.start_resimulating();

        let end = self.resim.window().map(|w| w.end).unwrap_or(self.frame);
        while self.frame < end {
            let frame = self.frame;
            let (dt, inputs) = match self.resim.window() {
                Some(window) => (window.dt(frame), window.inputs(frame).to_vec()),
                None => (None, Vec::new()),
            };
            let dt = dt.unwrap_or_else(|| {
                log::warn!("{}: no recorded dt for frame {frame}", self.id);
                DEFAULT_DT
            });
            self.advance_frame(dt, inputs);
        }

        let report = self.resim.finish();
        self.last_desync = report.final_states.clone();
        log::info!(
            "{}: resimulated {} frames from {} ({} hard desyncs)",
            self.id,
            report.frames,
            report.rewind_frame,
            report.hard_desynced.len()
        );
        report
    }

    /// Rewinds, applies `corrections` and resimulates to the head in one call.
    pub fn resimulate_from(
        &mut self,
        frame: u64,
        corrections: impl FnOnce(&mut ParticleStore),
    ) -> Option<ResimReport> {
        assert_physics_scope("resimulate_from");
        if !self.rewind_to_frame(frame) {
            return None;
        }
        self.correct(corrections);
        Some(self.complete_resim())
    }

    /// Desync classification of `id` in the current (or last) resimulation.
    pub fn desync_state(&self, id: ParticleId) -> DesyncState {
        assert_physics_scope("desync_state");
        if self.resim.is_idle() {
            self.last_desync.get(&id).copied().unwrap_or_default()
        } else {
            self.resim.current_state(id)
        }
    }

    /// Recorded state of `id` at a frame ahead of the rewound position.
    pub fn future_state_at_frame(&self, id: ParticleId, frame: u64) -> Option<FutureState> {
        assert_physics_scope("future_state_at_frame");
        if frame <= self.frame {
            return None;
        }
        self.resim.future_state(id, frame)
    }

    // ========== Results ==========

    pub fn snapshot(&self) -> SolverResults {
        SolverResults {
            solver: self.id,
            frame: self.frame,
            time: self.time,
            particles: self
                .particles
                .iter()
                .filter(|(_, p)| p.registered)
                .map(|(id, p)| ParticleView::of(id, p))
                .collect(),
            cluster_map: self.clusters.cluster_map().clone(),
            num_active: self.particles.num_enabled(),
        }
    }
}

impl fmt::Debug for Solver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Solver")
            .field("id", &self.id)
            .field("frame", &self.frame)
            .field("particles", &self.particles.len())
            .field("clusters", &self.clusters.cluster_map().len())
            .field("resim", &self.resim.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{FieldCommand, FieldNode, FieldTarget};
    use crate::geometry::Geometry;
    use crate::scope::PhysicsThreadScope;
    use glam::Vec3;

    fn cube_at(solver: &mut Solver, position: Vec3) -> ParticleId {
        solver.register_particle(Particle::new(position, Some(Arc::new(Geometry::cube(1.0))), 1.0))
    }

    // ========== Step Tests ==========

    #[test]
    fn test_step_advances_frame_and_time() {
        let mut solver = Solver::new(SolverConfig::default());
        let id = cube_at(&mut solver, Vec3::new(0.0, 5.0, 0.0));
        solver.step(0.1);
        solver.step(0.1);
        assert_eq!(solver.frame(), 2);
        assert!((solver.time() - 0.2).abs() < 1.0e-6);
        assert!(solver.particle(id).position.y < 5.0);
    }

    #[test]
    fn test_queued_command_runs_on_its_frame() {
        let mut solver = Solver::new(SolverConfig::default());
        let id = cube_at(&mut solver, Vec3::new(0.0, 5.0, 0.0));
        solver.enqueue_at(2, SolverCommand::SetLinearVelocity(id, Vec3::new(3.0, 0.0, 0.0)));
        solver.step(1.0 / 60.0);
        assert_eq!(solver.particle(id).velocity.x, 0.0);
        solver.step(1.0 / 60.0);
        solver.step(1.0 / 60.0);
        assert!(solver.particle(id).velocity.x > 2.9);
    }

    #[test]
    fn test_deactivate_command_breaks_cluster() {
        let mut solver = Solver::new(SolverConfig::default());
        let a = cube_at(&mut solver, Vec3::new(-0.5, 5.0, 0.0));
        let b = cube_at(&mut solver, Vec3::new(0.5, 5.0, 0.0));
        let root = solver
            .create_cluster_particle(&[a, b], &ClusterCreationParameters::default())
            .unwrap();
        solver.enqueue(SolverCommand::DeactivateCluster(root));
        solver.step(1.0 / 60.0);
        assert!(solver.clusters().cluster_map().is_empty());
        assert!(solver.particle(a).is_enabled());
        assert!(!solver.particle(root).is_enabled());
    }

    #[test]
    fn test_strain_field_breaks_same_frame() {
        let mut solver = Solver::new(SolverConfig::default());
        let a = cube_at(&mut solver, Vec3::new(-0.5, 5.0, 0.0));
        let b = cube_at(&mut solver, Vec3::new(0.5, 5.0, 0.0));
        solver
            .create_cluster_particle(&[a, b], &ClusterCreationParameters::with_thresholds(&[1.0]))
            .unwrap();
        solver.enqueue(SolverCommand::Field(FieldCommand::new(
            FieldTarget::ExternalClusterStrain,
            FieldNode::UniformScalar { magnitude: 5.0 },
        )));
        solver.step(1.0 / 60.0);
        assert!(solver.clusters().cluster_map().is_empty());
        assert_eq!(solver.events().last_breaks().len(), 2);
    }

    // ========== Rewind Tests ==========

    #[test]
    fn test_rewind_without_capture_fails() {
        let _scope = PhysicsThreadScope::enter();
        let mut solver = Solver::new(SolverConfig::default());
        solver.step(1.0 / 60.0);
        assert!(!solver.rewind_to_frame(0));
    }

    #[test]
    fn test_rewind_restores_position() {
        let _scope = PhysicsThreadScope::enter();
        let mut solver = Solver::new(SolverConfig::default());
        let id = cube_at(&mut solver, Vec3::new(0.0, 5.0, 0.0));
        solver.enable_rewind_capture(16, false);
        for _ in 0..5 {
            solver.step(1.0 / 60.0);
        }
        let at_two = solver.past_state_at_frame(id, 2).unwrap().position;
        assert!(solver.rewind_to_frame(2));
        assert_eq!(solver.frame(), 2);
        assert_eq!(solver.particle(id).position, at_two);
        assert_eq!(solver.resim_phase(), ResimPhase::RewoundPendingCorrection);

        let report = solver.complete_resim();
        assert_eq!(report.frames, 3);
        assert_eq!(solver.frame(), 5);
        assert_eq!(solver.resim_phase(), ResimPhase::Idle);
    }

    #[test]
    fn test_command_sent_while_rewound_waits_for_head() {
        let _scope = PhysicsThreadScope::enter();
        let mut solver = Solver::new(SolverConfig::default().with_rewind(16, false));
        let id = cube_at(&mut solver, Vec3::new(0.0, 5.0, 0.0));
        for _ in 0..5 {
            solver.step(1.0 / 60.0);
        }
        assert!(solver.rewind_to_frame(2));
        solver.enqueue(SolverCommand::SetLinearVelocity(id, Vec3::new(3.0, 0.0, 0.0)));
        assert_eq!(solver.commands().pending(2), 0);
        assert_eq!(solver.commands().pending(5), 1);

        solver.complete_resim();
        assert_eq!(solver.particle(id).velocity.x, 0.0);
        solver.step(1.0 / 60.0);
        assert!(solver.particle(id).velocity.x > 2.9);
    }

    #[test]
    #[should_panic(expected = "cannot step forward")]
    fn test_step_while_rewound_panics() {
        let _scope = PhysicsThreadScope::enter();
        let mut solver = Solver::new(SolverConfig::default().with_rewind(8, false));
        solver.step(1.0 / 60.0);
        assert!(solver.rewind_to_frame(0));
        solver.step(1.0 / 60.0);
    }
}
