//! Rigid transforms and the implicit shapes attached to particles.

use crate::mass_properties::{box_inertia, parallel_axis, rotate_inertia, sphere_inertia};
use glam::{Mat3, Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;
use std::ops::Mul;
use std::sync::Arc;

/// Rotation followed by translation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RigidTransform {
    #[serde(with = "crate::serde_utils::vec3")]
    pub translation: Vec3,
    #[serde(with = "crate::serde_utils::quat")]
    pub rotation: Quat,
}

impl Default for RigidTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl RigidTransform {
    pub const IDENTITY: Self = Self {
        translation: Vec3::ZERO,
        rotation: Quat::IDENTITY,
    };

    pub fn new(translation: Vec3, rotation: Quat) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    pub fn from_translation(translation: Vec3) -> Self {
        Self::new(translation, Quat::IDENTITY)
    }

    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.translation + self.rotation * point
    }

    pub fn transform_vector(&self, vector: Vec3) -> Vec3 {
        self.rotation * vector
    }

    pub fn inverse(&self) -> Self {
        let inv = self.rotation.inverse();
        Self {
            translation: inv * -self.translation,
            rotation: inv,
        }
    }
}

/// `a * b` maps from `b`'s local space through `a`.
impl Mul for RigidTransform {
    type Output = RigidTransform;

    fn mul(self, rhs: RigidTransform) -> RigidTransform {
        RigidTransform {
            translation: self.transform_point(rhs.translation),
            rotation: (self.rotation * rhs.rotation).normalize(),
        }
    }
}

/// A sphere used by collision queries (radius 0 for box corners).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SupportPoint {
    pub center: Vec3,
    pub radius: f32,
}

/// A shape placed inside a union.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShapeInstance {
    pub transform: RigidTransform,
    pub geometry: Arc<Geometry>,
}

/// Implicit collision geometry, centred on the owning particle's origin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Geometry {
    Sphere {
        radius: f32,
    },
    Box {
        #[serde(with = "crate::serde_utils::vec3")]
        half_extents: Vec3,
    },
    Union(Vec<ShapeInstance>),
}

impl Geometry {
    pub fn sphere(radius: f32) -> Self {
        Geometry::Sphere { radius }
    }

    /// Axis-aligned cube with edge length `size`.
    pub fn cube(size: f32) -> Self {
        Geometry::Box {
            half_extents: Vec3::splat(size * 0.5),
        }
    }

    pub fn cuboid(half_extents: Vec3) -> Self {
        Geometry::Box { half_extents }
    }

    pub fn volume(&self) -> f32 {
        match self {
            Geometry::Sphere { radius } => 4.0 / 3.0 * PI * radius * radius * radius,
            Geometry::Box { half_extents } => {
                8.0 * half_extents.x * half_extents.y * half_extents.z
            }
            Geometry::Union(instances) => instances.iter().map(|i| i.geometry.volume()).sum(),
        }
    }

    /// Radius of a sphere around the local origin enclosing the whole shape.
    pub fn bounding_radius(&self) -> f32 {
        match self {
            Geometry::Sphere { radius } => *radius,
            Geometry::Box { half_extents } => half_extents.length(),
            Geometry::Union(instances) => instances
                .iter()
                .map(|i| i.transform.translation.length() + i.geometry.bounding_radius())
                .fold(0.0_f32, f32::max),
        }
    }

    /// Inertia tensor about the local origin for a body of `mass`.
    ///
    /// Unions split the mass between their members by volume.
    pub fn inertia(&self, mass: f32) -> Mat3 {
        match self {
            Geometry::Sphere { radius } => sphere_inertia(mass, *radius),
            Geometry::Box { half_extents } => box_inertia(mass, *half_extents),
            Geometry::Union(instances) => {
                if instances.is_empty() {
                    return Mat3::ZERO;
                }
                let total_volume = self.volume();
                let mut inertia = Mat3::ZERO;
                for instance in instances {
                    let share = if total_volume > 0.0 {
                        instance.geometry.volume() / total_volume
                    } else {
                        1.0 / instances.len() as f32
                    };
                    let m = mass * share;
                    let local = instance.geometry.inertia(m);
                    inertia += rotate_inertia(local, instance.transform.rotation);
                    inertia += parallel_axis(m, instance.transform.translation);
                }
                inertia
            }
        }
    }

    /// Points tested against the ground plane: sphere centres and box corners.
    pub fn floor_points(&self, tm: &RigidTransform, out: &mut Vec<SupportPoint>) {
        match self {
            Geometry::Sphere { radius } => out.push(SupportPoint {
                center: tm.translation,
                radius: *radius,
            }),
            Geometry::Box { half_extents } => {
                for &x in &[-1.0, 1.0] {
                    for &y in &[-1.0, 1.0] {
                        for &z in &[-1.0, 1.0] {
                            let corner = *half_extents * Vec3::new(x, y, z);
                            out.push(SupportPoint {
                                center: tm.transform_point(corner),
                                radius: 0.0,
                            });
                        }
                    }
                }
            }
            Geometry::Union(instances) => {
                for instance in instances {
                    instance
                        .geometry
                        .floor_points(&(*tm * instance.transform), out);
                }
            }
        }
    }

    /// Signed distance from a point in local space to the surface.
    pub fn signed_distance(&self, point: Vec3) -> f32 {
        match self {
            Geometry::Sphere { radius } => point.length() - radius,
            Geometry::Box { half_extents } => {
                let q = point.abs() - *half_extents;
                q.max(Vec3::ZERO).length() + q.max_element().min(0.0)
            }
            Geometry::Union(instances) => instances
                .iter()
                .map(|i| {
                    let local = i.transform.inverse().transform_point(point);
                    i.geometry.signed_distance(local)
                })
                .fold(f32::MAX, f32::min),
        }
    }

    /// Sphere proxies for body-body contacts. Boxes use their inscribed sphere.
    pub fn collision_spheres(&self, tm: &RigidTransform, out: &mut Vec<SupportPoint>) {
        match self {
            Geometry::Sphere { radius } => out.push(SupportPoint {
                center: tm.translation,
                radius: *radius,
            }),
            Geometry::Box { half_extents } => out.push(SupportPoint {
                center: tm.translation,
                radius: half_extents.min_element(),
            }),
            Geometry::Union(instances) => {
                for instance in instances {
                    instance
                        .geometry
                        .collision_spheres(&(*tm * instance.transform), out);
                }
            }
        }
    }
}
