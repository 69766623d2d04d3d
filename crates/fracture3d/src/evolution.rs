//! Rigid-body integration and contact resolution.
//!
//! The clustering layer only needs "advance these particles by dt and tell me what
//! touched"; `ConstraintSolver` is that seam. `ImpulseSolver` is the built-in
//! implementation: semi-implicit Euler plus sequential impulses against a ground plane
//! and between sphere proxies.

use crate::config::{SleepConfig, SolverConfig};
use crate::constants::{CONTACT_SLOP, CORRECTION_PERCENT, RESTITUTION_VELOCITY_THRESHOLD};
use crate::geometry::SupportPoint;
use crate::particle::{ObjectState, Particle, ParticleId, ParticleStore};
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Accumulated contact between a particle and another particle or the ground.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub particle: ParticleId,
    /// `None` for the ground plane
    pub other: Option<ParticleId>,
    #[serde(with = "crate::serde_utils::vec3")]
    pub point: Vec3,
    /// Points from `particle` towards `other` (down for the ground)
    #[serde(with = "crate::serde_utils::vec3")]
    pub normal: Vec3,
    /// Total normal impulse over all passes (kg m/s)
    pub impulse: f32,
}

/// Per-step inputs besides the particles themselves.
#[derive(Clone, Copy, Debug, Default)]
pub struct SolveView<'a> {
    /// Particles moved kinematically this step regardless of their state (sorted)
    pub kinematic_override: &'a [ParticleId],
}

impl SolveView<'_> {
    fn is_forced(&self, id: ParticleId) -> bool {
        self.kinematic_override.binary_search(&id).is_ok()
    }
}

pub trait ConstraintSolver: Send {
    /// Advances every enabled particle by `dt` and reports the contacts it resolved.
    /// Must be deterministic for identical inputs.
    fn advance(&mut self, particles: &mut ParticleStore, view: &SolveView<'_>, dt: f32) -> Vec<Contact>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Motion {
    Dynamic,
    Kinematic,
    Static,
    Sleeping,
}

#[derive(Default)]
struct ContactAccum {
    point_sum: Vec3,
    samples: u32,
    normal: Vec3,
    impulse: f32,
}

#[derive(Clone, Debug)]
pub struct ImpulseSolver {
    pub gravity: Vec3,
    pub floor_height: Option<f32>,
    pub restitution: f32,
    pub friction: f32,
    pub iterations: usize,
    pub linear_damping: f32,
    pub angular_damping: f32,
    pub sleep: SleepConfig,
}

impl ImpulseSolver {
    pub fn from_config(config: &SolverConfig) -> Self {
        Self {
            gravity: config.gravity,
            floor_height: config.floor_height,
            restitution: config.restitution,
            friction: config.friction,
            iterations: config.solver_iterations.max(1),
            linear_damping: config.linear_damping,
            angular_damping: config.angular_damping,
            sleep: config.sleep.clone(),
        }
    }

    fn integrate(&self, particle: &mut Particle, motion: Motion, dt: f32) {
        match motion {
            Motion::Dynamic => {
                particle.velocity += (self.gravity + particle.force * particle.inv_mass) * dt;
                particle.angular_velocity += particle.world_inv_inertia() * particle.torque * dt;
                particle.velocity *= (1.0 - self.linear_damping * dt).max(0.0);
                particle.angular_velocity *= (1.0 - self.angular_damping * dt).max(0.0);
            }
            Motion::Kinematic => {}
            Motion::Static | Motion::Sleeping => {
                particle.force = Vec3::ZERO;
                particle.torque = Vec3::ZERO;
                return;
            }
        }
        particle.position += particle.velocity * dt;
        let delta = Quat::from_scaled_axis(particle.angular_velocity * dt);
        particle.rotation = (delta * particle.rotation).normalize();
        particle.force = Vec3::ZERO;
        particle.torque = Vec3::ZERO;
    }

    /// Resolves the support points below the floor as one contact at their centroid.
    /// Returns that point and the normal impulse.
    fn resolve_floor(
        &self,
        particle: &mut Particle,
        floor: f32,
        points: &mut Vec<SupportPoint>,
    ) -> Option<(Vec3, f32)> {
        let geometry = particle.geometry.clone()?;
        points.clear();
        geometry.floor_points(&particle.transform(), points);

        let normal = Vec3::Y;
        let mut point_sum = Vec3::ZERO;
        let mut touching = 0;
        let mut deepest = 0.0_f32;
        for support in points.iter() {
            let contact = support.center - normal * support.radius;
            let penetration = floor - contact.y;
            if penetration > 0.0 {
                touching += 1;
                point_sum += contact;
                deepest = deepest.max(penetration);
            }
        }
        if touching == 0 {
            return None;
        }

        let contact = point_sum / touching as f32;
        let r = contact - particle.position;
        let vel = particle.point_velocity(contact);
        let v_n = vel.dot(normal);
        let mut total = 0.0;
        if v_n < 0.0 {
            let inv_mass = particle.inv_mass;
            let inv_inertia = particle.world_inv_inertia();
            let rn = r.cross(normal);
            let denom = inv_mass + normal.dot((inv_inertia * rn).cross(r));
            if denom > 1.0e-6 {
                let e = if v_n < -RESTITUTION_VELOCITY_THRESHOLD {
                    self.restitution
                } else {
                    0.0
                };
                let j = -(1.0 + e) * v_n / denom;
                let mut impulse = normal * j;

                let vt = vel - normal * v_n;
                if vt.length_squared() > 1.0e-10 {
                    let t = vt.normalize();
                    let rt = r.cross(t);
                    let denom_t = inv_mass + t.dot((inv_inertia * rt).cross(r));
                    if denom_t > 1.0e-6 {
                        let limit = self.friction * j;
                        let jt = (-vel.dot(t) / denom_t).clamp(-limit, limit);
                        impulse += t * jt;
                    }
                }

                particle.velocity += impulse * inv_mass;
                particle.angular_velocity += inv_inertia * r.cross(impulse);
                total = j;
            }
        }

        particle.position.y += (deepest - CONTACT_SLOP).max(0.0) * CORRECTION_PERCENT;
        Some((contact, total))
    }

    /// Sphere-proxy contacts between two bodies. Returns mean point, normal (a to b)
    /// and the total normal impulse.
    #[allow(clippy::too_many_arguments)]
    fn resolve_pair(
        &self,
        a: &mut Particle,
        inv_mass_a: f32,
        b: &mut Particle,
        inv_mass_b: f32,
        spheres_a: &[SupportPoint],
        spheres_b: &[SupportPoint],
    ) -> Option<(Vec3, Vec3, f32)> {
        let inv_inertia_a = if inv_mass_a > 0.0 { a.world_inv_inertia() } else { glam::Mat3::ZERO };
        let inv_inertia_b = if inv_mass_b > 0.0 { b.world_inv_inertia() } else { glam::Mat3::ZERO };
        let inv_mass_sum = inv_mass_a + inv_mass_b;

        let mut total = 0.0;
        let mut point_sum = Vec3::ZERO;
        let mut normal_sum = Vec3::ZERO;
        let mut touching = 0;

        for sa in spheres_a {
            for sb in spheres_b {
                let diff = sb.center - sa.center;
                let contact_dist = sa.radius + sb.radius;
                let dist_sq = diff.length_squared();
                if dist_sq >= contact_dist * contact_dist || dist_sq <= 1.0e-10 {
                    continue;
                }
                let dist = dist_sq.sqrt();
                let normal = diff / dist;
                let penetration = contact_dist - dist;
                let point = sa.center + normal * (sa.radius - penetration * 0.5);
                touching += 1;
                point_sum += point;
                normal_sum += normal;

                let ra = point - a.position;
                let rb = point - b.position;
                let rel_vel = b.point_velocity(point) - a.point_velocity(point);
                let rel_normal = rel_vel.dot(normal);
                if rel_normal < 0.0 {
                    let ang_a = (inv_inertia_a * ra.cross(normal)).cross(ra);
                    let ang_b = (inv_inertia_b * rb.cross(normal)).cross(rb);
                    let denom = inv_mass_sum + normal.dot(ang_a + ang_b);
                    if denom > 1.0e-6 {
                        let e = if rel_normal < -RESTITUTION_VELOCITY_THRESHOLD {
                            self.restitution
                        } else {
                            0.0
                        };
                        let j = -(1.0 + e) * rel_normal / denom;
                        let mut impulse = normal * j;

                        let vt = rel_vel - normal * rel_normal;
                        if vt.length_squared() > 1.0e-10 {
                            let t = vt.normalize();
                            let ang_ta = (inv_inertia_a * ra.cross(t)).cross(ra);
                            let ang_tb = (inv_inertia_b * rb.cross(t)).cross(rb);
                            let denom_t = inv_mass_sum + t.dot(ang_ta + ang_tb);
                            if denom_t > 1.0e-6 {
                                let limit = self.friction * j;
                                let jt = (-rel_vel.dot(t) / denom_t).clamp(-limit, limit);
                                impulse += t * jt;
                            }
                        }

                        a.velocity -= impulse * inv_mass_a;
                        b.velocity += impulse * inv_mass_b;
                        a.angular_velocity -= inv_inertia_a * ra.cross(impulse);
                        b.angular_velocity += inv_inertia_b * rb.cross(impulse);
                        total += j;
                    }
                }

                let correction_mag = (penetration - CONTACT_SLOP).max(0.0) * CORRECTION_PERCENT / inv_mass_sum;
                let correction = normal * correction_mag;
                a.position -= correction * inv_mass_a;
                b.position += correction * inv_mass_b;
            }
        }

        (touching > 0).then(|| {
            let n = touching as f32;
            (point_sum / n, normal_sum.normalize_or_zero(), total)
        })
    }

    fn update_sleep(&self, particle: &mut Particle) {
        if particle.velocity.length() < self.sleep.linear_threshold
            && particle.angular_velocity.length() < self.sleep.angular_threshold
        {
            particle.sleep_counter += 1;
            if particle.sleep_counter >= self.sleep.frames_to_sleep {
                particle.set_object_state(ObjectState::Sleeping);
            }
        } else {
            particle.sleep_counter = 0;
        }
    }
}

/// Collision group 0 collides with everything, negative groups with nothing, and
/// positive groups only with the same group.
pub fn groups_collide(a: i32, b: i32) -> bool {
    if a < 0 || b < 0 {
        return false;
    }
    a == 0 || b == 0 || a == b
}

fn motion_of(particle: &Particle, forced: bool) -> Motion {
    if forced {
        return Motion::Kinematic;
    }
    match particle.object_state {
        ObjectState::Dynamic => Motion::Dynamic,
        ObjectState::Kinematic => Motion::Kinematic,
        ObjectState::Static => Motion::Static,
        ObjectState::Sleeping => Motion::Sleeping,
    }
}

impl ConstraintSolver for ImpulseSolver {
    fn advance(&mut self, particles: &mut ParticleStore, view: &SolveView<'_>, dt: f32) -> Vec<Contact> {
        let mut bodies: Vec<(ParticleId, Motion)> = particles
            .iter()
            .filter(|(_, p)| p.is_enabled() && p.registered)
            .map(|(id, p)| (id, motion_of(p, view.is_forced(id))))
            .collect();

        for &(id, motion) in &bodies {
            self.integrate(&mut particles[id], motion, dt);
        }

        let mut accum: BTreeMap<(u32, u32), ContactAccum> = BTreeMap::new();
        let mut points = Vec::new();
        let mut spheres_a = Vec::new();
        let mut spheres_b = Vec::new();

        for _ in 0..self.iterations {
            if let Some(floor) = self.floor_height {
                for &(id, motion) in &bodies {
                    if motion != Motion::Dynamic {
                        continue;
                    }
                    if let Some((point, impulse)) = self.resolve_floor(&mut particles[id], floor, &mut points) {
                        let entry = accum.entry((id.0, u32::MAX)).or_default();
                        entry.point_sum += point;
                        entry.samples += 1;
                        entry.normal = -Vec3::Y;
                        entry.impulse += impulse;
                    }
                }
            }

            for i in 0..bodies.len() {
                for j in (i + 1)..bodies.len() {
                    let (id_a, motion_a) = bodies[i];
                    let (id_b, motion_b) = bodies[j];
                    if !matches!(motion_a, Motion::Dynamic) && !matches!(motion_b, Motion::Dynamic) {
                        // Sleeping bodies may still be struck by moving kinematic ones.
                        let kinematic_hits_sleeper = matches!(
                            (motion_a, motion_b),
                            (Motion::Kinematic, Motion::Sleeping) | (Motion::Sleeping, Motion::Kinematic)
                        );
                        if !kinematic_hits_sleeper {
                            continue;
                        }
                    }

                    let (pa, pb) = particles.pair_mut(id_a, id_b);
                    if !groups_collide(pa.collision_group, pb.collision_group) {
                        continue;
                    }
                    let (Some(geom_a), Some(geom_b)) = (pa.geometry.clone(), pb.geometry.clone()) else {
                        continue;
                    };
                    let reach = geom_a.bounding_radius() + geom_b.bounding_radius();
                    if pa.position.distance_squared(pb.position) > reach * reach {
                        continue;
                    }

                    spheres_a.clear();
                    spheres_b.clear();
                    geom_a.collision_spheres(&pa.transform(), &mut spheres_a);
                    geom_b.collision_spheres(&pb.transform(), &mut spheres_b);

                    // A moving body wakes a sleeper it overlaps.
                    let overlapping = spheres_a.iter().any(|sa| {
                        spheres_b.iter().any(|sb| {
                            sa.center.distance_squared(sb.center) < (sa.radius + sb.radius).powi(2)
                        })
                    });
                    if !overlapping {
                        continue;
                    }
                    let wake_threshold = self.sleep.linear_threshold;
                    if motion_a == Motion::Sleeping && pb.velocity.length() > wake_threshold {
                        pa.wake();
                        bodies[i].1 = Motion::Dynamic;
                    }
                    if motion_b == Motion::Sleeping && pa.velocity.length() > wake_threshold {
                        pb.wake();
                        bodies[j].1 = Motion::Dynamic;
                    }

                    let inv_a = if bodies[i].1 == Motion::Dynamic { pa.inv_mass } else { 0.0 };
                    let inv_b = if bodies[j].1 == Motion::Dynamic { pb.inv_mass } else { 0.0 };
                    if inv_a + inv_b <= 0.0 {
                        continue;
                    }

                    if let Some((point, normal, impulse)) =
                        self.resolve_pair(pa, inv_a, pb, inv_b, &spheres_a, &spheres_b)
                    {
                        let entry = accum.entry((id_a.0, id_b.0)).or_default();
                        entry.point_sum += point;
                        entry.samples += 1;
                        entry.normal = normal;
                        entry.impulse += impulse;
                    }
                }
            }
        }

        if self.sleep.enabled {
            for &(id, motion) in &bodies {
                if motion == Motion::Dynamic && !view.is_forced(id) {
                    self.update_sleep(&mut particles[id]);
                }
            }
        }

        accum
            .into_iter()
            .map(|((a, b), c)| Contact {
                particle: ParticleId(a),
                other: (b != u32::MAX).then_some(ParticleId(b)),
                point: c.point_sum / c.samples.max(1) as f32,
                normal: c.normal,
                impulse: c.impulse,
            })
            .collect()
    }
}
