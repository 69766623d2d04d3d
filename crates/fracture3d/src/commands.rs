//! Commands queued by producers and drained by the solver one frame at a time.

use crate::collection::{CollectionParams, RestCollection};
use crate::field::FieldCommand;
use crate::particle::{ObjectState, ParticleId};
use glam::{Quat, Vec3};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq)]
pub enum SolverCommand {
    Field(FieldCommand),
    DeactivateCluster(ParticleId),
    ReleaseClusterParticles(Vec<ParticleId>),
    SetPosition(ParticleId, Vec3),
    SetRotation(ParticleId, Quat),
    SetLinearVelocity(ParticleId, Vec3),
    SetAngularVelocity(ParticleId, Vec3),
    AddForce(ParticleId, Vec3),
    AddTorque(ParticleId, Vec3),
    /// Impulse applied at a world point
    ApplyImpulse {
        particle: ParticleId,
        impulse: Vec3,
        point: Vec3,
    },
    SetObjectState(ParticleId, ObjectState),
    /// Registers a collection queued through `Solver::queue_collection`
    RegisterCollection {
        key: u64,
        rest: Arc<RestCollection>,
        params: CollectionParams,
    },
}

impl SolverCommand {
    /// Strain fields are applied after collision strain rather than at drain time.
    pub fn is_strain_field(&self) -> bool {
        matches!(
            self,
            SolverCommand::Field(FieldCommand {
                target: crate::field::FieldTarget::ExternalClusterStrain,
                ..
            })
        )
    }

    /// Registrations are bookkeeping of the world, not recorded inputs.
    pub fn is_recorded_input(&self) -> bool {
        !matches!(self, SolverCommand::RegisterCollection { .. })
    }
}

/// Per-frame command queues.
#[derive(Clone, Debug, Default)]
pub struct CommandQueue {
    frames: BTreeMap<u64, Vec<SolverCommand>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: u64, command: SolverCommand) {
        self.frames.entry(frame).or_default().push(command);
    }

    /// Removes and returns the commands for `frame`, preceded by any left over from
    /// earlier frames, in frame then submission order.
    pub fn drain_frame(&mut self, frame: u64) -> Vec<SolverCommand> {
        let later = self.frames.split_off(&(frame + 1));
        let drained = std::mem::replace(&mut self.frames, later);
        drained.into_values().flatten().collect()
    }

    pub fn pending(&self, frame: u64) -> usize {
        self.frames.get(&frame).map(Vec::len).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.frames.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Drops everything queued for frames after `frame`.
    pub fn clear_after(&mut self, frame: u64) {
        self.frames.split_off(&(frame + 1));
    }
}
