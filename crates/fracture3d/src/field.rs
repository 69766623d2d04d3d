//! Spatial field commands: evaluated per particle, then written to a target attribute.

use crate::cluster::ClusterManager;
use crate::particle::{ObjectState, ParticleId, ParticleStore};
use glam::Vec3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldOutput {
    Scalar,
    Vector,
    Integer,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Scalar(f32),
    Vector(#[serde(with = "crate::serde_utils::vec3")] Vec3),
    Integer(i32),
}

/// Attribute a field writes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldTarget {
    ExternalClusterStrain,
    DynamicState,
    LinearVelocity,
    AngularVelocity,
    LinearForce,
    AngularTorque,
    Kill,
    CollisionGroup,
    /// Only affects particles registered in the current frame
    InitialLinearVelocity,
    InitialAngularVelocity,
}

impl FieldTarget {
    pub fn output(self) -> FieldOutput {
        match self {
            FieldTarget::ExternalClusterStrain | FieldTarget::Kill => FieldOutput::Scalar,
            FieldTarget::DynamicState | FieldTarget::CollisionGroup => FieldOutput::Integer,
            FieldTarget::LinearVelocity
            | FieldTarget::AngularVelocity
            | FieldTarget::LinearForce
            | FieldTarget::AngularTorque
            | FieldTarget::InitialLinearVelocity
            | FieldTarget::InitialAngularVelocity => FieldOutput::Vector,
        }
    }
}

/// Which particles a field is evaluated on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingResolution {
    /// Enabled particles plus the direct children of enabled clusters
    #[default]
    Minimal,
    /// Every particle without a cluster parent
    DisabledParents,
    /// Every registered particle
    Maximum,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Falloff {
    #[default]
    None,
    Linear,
    Inverse,
    Squared,
    Logarithmic,
}

impl Falloff {
    /// `delta` runs from 0 at the edge of the field to 1 at its origin.
    fn scale(self, delta: f32) -> f32 {
        match self {
            Falloff::None => 1.0,
            Falloff::Linear => delta,
            Falloff::Inverse => {
                if delta > 1.0e-6 {
                    1.0 / delta
                } else {
                    0.0
                }
            }
            Falloff::Squared => delta * delta,
            Falloff::Logarithmic => (delta + 1.0).log2(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetMaskCondition {
    #[default]
    Always,
    /// Keep the current value when it already equals the interior value
    IfNotInterior,
    /// Keep the current value when it already equals the exterior value
    IfNotExterior,
}

/// Where a field is evaluated, plus the target's current integer value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FieldSample {
    pub position: Vec3,
    pub current: i32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FieldNode {
    UniformScalar {
        magnitude: f32,
    },
    UniformInteger {
        magnitude: i32,
    },
    UniformVector {
        magnitude: f32,
        #[serde(with = "crate::serde_utils::vec3")]
        direction: Vec3,
    },
    /// Points away from `position`
    RadialVector {
        magnitude: f32,
        #[serde(with = "crate::serde_utils::vec3")]
        position: Vec3,
    },
    RadialFalloff {
        magnitude: f32,
        min_range: f32,
        max_range: f32,
        default: f32,
        radius: f32,
        #[serde(with = "crate::serde_utils::vec3")]
        position: Vec3,
        falloff: Falloff,
    },
    /// Non-zero below the plane, within `distance` of it (`distance <= 0` = unbounded)
    PlaneFalloff {
        magnitude: f32,
        min_range: f32,
        max_range: f32,
        default: f32,
        distance: f32,
        #[serde(with = "crate::serde_utils::vec3")]
        position: Vec3,
        #[serde(with = "crate::serde_utils::vec3")]
        normal: Vec3,
        falloff: Falloff,
    },
    RadialIntMask {
        radius: f32,
        #[serde(with = "crate::serde_utils::vec3")]
        position: Vec3,
        interior_value: i32,
        exterior_value: i32,
        condition: SetMaskCondition,
    },
}

impl FieldNode {
    /// Constant-strength sphere; the usual way to apply strain around an impact.
    pub fn radial_falloff(position: Vec3, radius: f32, magnitude: f32) -> Self {
        FieldNode::RadialFalloff {
            magnitude,
            min_range: 0.0,
            max_range: 1.0,
            default: 0.0,
            radius,
            position,
            falloff: Falloff::None,
        }
    }

    pub fn output(&self) -> FieldOutput {
        match self {
            FieldNode::UniformScalar { .. }
            | FieldNode::RadialFalloff { .. }
            | FieldNode::PlaneFalloff { .. } => FieldOutput::Scalar,
            FieldNode::UniformInteger { .. } | FieldNode::RadialIntMask { .. } => {
                FieldOutput::Integer
            }
            FieldNode::UniformVector { .. } | FieldNode::RadialVector { .. } => {
                FieldOutput::Vector
            }
        }
    }

    pub fn evaluate(&self, sample: &FieldSample) -> FieldValue {
        match self {
            FieldNode::UniformScalar { magnitude } => FieldValue::Scalar(*magnitude),
            FieldNode::UniformInteger { magnitude } => FieldValue::Integer(*magnitude),
            FieldNode::UniformVector {
                magnitude,
                direction,
            } => FieldValue::Vector(direction.normalize_or_zero() * *magnitude),
            FieldNode::RadialVector {
                magnitude,
                position,
            } => FieldValue::Vector((sample.position - *position).normalize_or_zero() * *magnitude),
            FieldNode::RadialFalloff {
                magnitude,
                min_range,
                max_range,
                default,
                radius,
                position,
                falloff,
            } => {
                let distance = sample.position.distance(*position);
                if *radius > 0.0 && distance < *radius {
                    let delta = 1.0 - distance / radius;
                    FieldValue::Scalar(
                        magnitude * (min_range + (max_range - min_range) * falloff.scale(delta)),
                    )
                } else {
                    FieldValue::Scalar(*default)
                }
            }
            FieldNode::PlaneFalloff {
                magnitude,
                min_range,
                max_range,
                default,
                distance,
                position,
                normal,
                falloff,
            } => {
                let depth = -normal.normalize_or_zero().dot(sample.position - *position);
                if depth > 0.0 && (*distance <= 0.0 || depth < *distance) {
                    let delta = if *distance > 0.0 {
                        1.0 - depth / distance
                    } else {
                        1.0
                    };
                    FieldValue::Scalar(
                        magnitude * (min_range + (max_range - min_range) * falloff.scale(delta)),
                    )
                } else {
                    FieldValue::Scalar(*default)
                }
            }
            FieldNode::RadialIntMask {
                radius,
                position,
                interior_value,
                exterior_value,
                condition,
            } => {
                let inside = sample.position.distance_squared(*position) < radius * radius;
                let value = if inside {
                    *interior_value
                } else {
                    *exterior_value
                };
                let keep = match condition {
                    SetMaskCondition::Always => false,
                    SetMaskCondition::IfNotInterior => sample.current == *interior_value,
                    SetMaskCondition::IfNotExterior => sample.current == *exterior_value,
                };
                FieldValue::Integer(if keep { sample.current } else { value })
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldCommand {
    pub target: FieldTarget,
    pub node: FieldNode,
    #[serde(default)]
    pub resolution: ProcessingResolution,
}

impl FieldCommand {
    pub fn new(target: FieldTarget, node: FieldNode) -> Self {
        Self {
            target,
            node,
            resolution: ProcessingResolution::Minimal,
        }
    }

    pub fn with_resolution(mut self, resolution: ProcessingResolution) -> Self {
        self.resolution = resolution;
        self
    }
}

/// Particles selected by `resolution`, in id order.
pub fn sample_particles(
    particles: &ParticleStore,
    clusters: &ClusterManager,
    resolution: ProcessingResolution,
) -> Vec<ParticleId> {
    particles
        .iter()
        .filter(|(id, p)| {
            p.registered
                && match resolution {
                    ProcessingResolution::Minimal => {
                        p.is_enabled()
                            || clusters
                                .parent(*id)
                                .map(|parent| particles[parent].is_enabled())
                                .unwrap_or(false)
                    }
                    ProcessingResolution::DisabledParents => clusters.parent(*id).is_none(),
                    ProcessingResolution::Maximum => true,
                }
        })
        .map(|(id, _)| id)
        .collect()
}

/// Evaluates `command` and writes the result. Returns the particles it changed.
pub fn apply_field_command(
    command: &FieldCommand,
    particles: &mut ParticleStore,
    clusters: &mut ClusterManager,
    frame: u64,
) -> Vec<ParticleId> {
    if command.node.output() != command.target.output() {
        log::warn!(
            "field command ignored: {:?} yields {:?} values, {:?} expects {:?}",
            command.node,
            command.node.output(),
            command.target,
            command.target.output()
        );
        return Vec::new();
    }

    let ids = sample_particles(particles, clusters, command.resolution);
    let samples: Vec<FieldSample> = ids
        .iter()
        .map(|id| FieldSample {
            position: clusters.world_transform(particles, *id).translation,
            current: match command.target {
                FieldTarget::DynamicState => particles[*id].object_state.field_value(),
                FieldTarget::CollisionGroup => particles[*id].collision_group,
                _ => 0,
            },
        })
        .collect();
    let values: Vec<FieldValue> = samples.par_iter().map(|s| command.node.evaluate(s)).collect();

    let mut affected = Vec::new();
    let mut refresh: BTreeSet<ParticleId> = BTreeSet::new();
    for (&id, value) in ids.iter().zip(values) {
        let changed = match (command.target, value) {
            (FieldTarget::ExternalClusterStrain, FieldValue::Scalar(v)) => {
                if v > 0.0 {
                    particles[id].strain += v;
                }
                v > 0.0
            }
            (FieldTarget::DynamicState, FieldValue::Integer(v)) => {
                match ObjectState::from_field_value(v) {
                    Some(state) if state != particles[id].object_state => {
                        particles[id].set_object_state(state);
                        if clusters.parent(id).is_some() {
                            refresh.insert(id);
                        }
                        true
                    }
                    _ => false,
                }
            }
            (FieldTarget::LinearVelocity, FieldValue::Vector(v)) => {
                drive(particles, id, |p| p.velocity = v)
            }
            (FieldTarget::AngularVelocity, FieldValue::Vector(v)) => {
                drive(particles, id, |p| p.angular_velocity = v)
            }
            (FieldTarget::LinearForce, FieldValue::Vector(v)) => {
                drive(particles, id, |p| p.force += v)
            }
            (FieldTarget::AngularTorque, FieldValue::Vector(v)) => {
                drive(particles, id, |p| p.torque += v)
            }
            (FieldTarget::InitialLinearVelocity, FieldValue::Vector(v)) => {
                particles[id].spawn_frame == frame && drive(particles, id, |p| p.velocity = v)
            }
            (FieldTarget::InitialAngularVelocity, FieldValue::Vector(v)) => {
                particles[id].spawn_frame == frame
                    && drive(particles, id, |p| p.angular_velocity = v)
            }
            (FieldTarget::Kill, FieldValue::Scalar(v)) => {
                if v > 0.0 && particles[id].is_enabled() {
                    let removed = clusters.remove_subtree(particles, id);
                    if removed.len() > 1 {
                        log::debug!("kill {id}: removed {} clustered particles", removed.len() - 1);
                    }
                    true
                } else {
                    false
                }
            }
            (FieldTarget::CollisionGroup, FieldValue::Integer(v)) => {
                let changed = particles[id].collision_group != v;
                particles[id].collision_group = v;
                changed
            }
            _ => false,
        };
        if changed {
            affected.push(id);
        }
    }

    let roots: BTreeSet<ParticleId> = refresh
        .into_iter()
        .map(|id| clusters.top_level_ancestor(id))
        .collect();
    for root in roots {
        refresh_ancestry(particles, clusters, root);
    }

    log::trace!("field {:?} touched {} particles", command.target, affected.len());
    affected
}

/// Applies a motion change to an enabled, non-static particle and wakes it.
fn drive(
    particles: &mut ParticleStore,
    id: ParticleId,
    apply: impl FnOnce(&mut crate::particle::Particle),
) -> bool {
    let particle = &mut particles[id];
    if particle.disabled || particle.object_state == ObjectState::Static {
        return false;
    }
    particle.wake();
    particle.sleep_counter = 0;
    apply(particle);
    true
}

/// Re-derives kinematic state bottom-up below `root` after a leaf changed state.
fn refresh_ancestry(particles: &mut ParticleStore, clusters: &ClusterManager, root: ParticleId) {
    for child in clusters.children(root).to_vec() {
        refresh_ancestry(particles, clusters, child);
    }
    clusters.update_kinematic_properties(particles, root);
}
