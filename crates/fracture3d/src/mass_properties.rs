//! Mass, centre of mass and inertia aggregation for cluster parents.

use crate::geometry::RigidTransform;
use glam::{Mat3, Quat, Vec3};

/// One contributor to a combined body: its pose, mass and local inertia.
#[derive(Clone, Copy, Debug)]
pub struct MassElement {
    pub transform: RigidTransform,
    pub mass: f32,
    pub inertia: Mat3,
}

/// Combined mass properties. `inertia` is about the centre of mass in world axes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MassProperties {
    pub mass: f32,
    pub center_of_mass: Vec3,
    pub inertia: Mat3,
}

impl MassProperties {
    /// Inertia expressed in a body frame rotated by `rotation`.
    pub fn local_inertia(&self, rotation: Quat) -> Mat3 {
        let rot = Mat3::from_quat(rotation);
        rot.transpose() * self.inertia * rot
    }
}

pub fn combine(elements: &[MassElement]) -> MassProperties {
    let mass: f32 = elements.iter().map(|e| e.mass).sum();
    let center_of_mass = if mass > 0.0 {
        elements
            .iter()
            .fold(Vec3::ZERO, |acc, e| acc + e.transform.translation * e.mass)
            / mass
    } else if elements.is_empty() {
        Vec3::ZERO
    } else {
        elements
            .iter()
            .fold(Vec3::ZERO, |acc, e| acc + e.transform.translation)
            / elements.len() as f32
    };

    let mut inertia = Mat3::ZERO;
    for element in elements {
        inertia += rotate_inertia(element.inertia, element.transform.rotation);
        inertia += parallel_axis(element.mass, element.transform.translation - center_of_mass);
    }

    MassProperties {
        mass,
        center_of_mass,
        inertia,
    }
}

/// Inertia of a point mass at offset `r`: m (|r|^2 E - r r^T).
pub fn parallel_axis(mass: f32, r: Vec3) -> Mat3 {
    let r2 = r.length_squared();
    let diag = Mat3::from_diagonal(Vec3::splat(r2));
    let outer = Mat3::from_cols(r * r.x, r * r.y, r * r.z);
    (diag - outer) * mass
}

pub fn rotate_inertia(inertia: Mat3, rotation: Quat) -> Mat3 {
    let rot = Mat3::from_quat(rotation);
    rot * inertia * rot.transpose()
}

pub fn box_inertia(mass: f32, half_extents: Vec3) -> Mat3 {
    let h2 = half_extents * half_extents;
    Mat3::from_diagonal(Vec3::new(h2.y + h2.z, h2.x + h2.z, h2.x + h2.y) * (mass / 3.0))
}

pub fn sphere_inertia(mass: f32, radius: f32) -> Mat3 {
    Mat3::from_diagonal(Vec3::splat(0.4 * mass * radius * radius))
}

/// Inverse inertia, falling back to per-axis inversion for degenerate tensors.
pub fn invert_inertia(inertia: Mat3) -> Mat3 {
    let det = inertia.determinant();
    if det.abs() > 1.0e-12 {
        return inertia.inverse();
    }
    let diag = Vec3::new(inertia.x_axis.x, inertia.y_axis.y, inertia.z_axis.z);
    let inv = Vec3::new(
        if diag.x > 1.0e-12 { 1.0 / diag.x } else { 0.0 },
        if diag.y > 1.0e-12 { 1.0 / diag.y } else { 0.0 },
        if diag.z > 1.0e-12 { 1.0 / diag.z } else { 0.0 },
    );
    Mat3::from_diagonal(inv)
}
