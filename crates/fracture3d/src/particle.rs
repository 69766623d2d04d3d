//! Rigid particles and the flat store that owns them.

use crate::geometry::{Geometry, RigidTransform};
use crate::mass_properties::{invert_inertia, rotate_inertia};
use glam::{Mat3, Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Index, IndexMut};
use std::sync::Arc;

/// Stable index of a particle inside its solver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticleId(pub u32);

impl ParticleId {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn from_index(index: usize) -> Self {
        Self(index as u32)
    }
}

impl fmt::Display for ParticleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How the solver moves a particle.
///
/// Integer codes match the dynamic-state field protocol.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectState {
    Sleeping,
    Kinematic,
    Static,
    #[default]
    Dynamic,
}

impl ObjectState {
    pub fn from_field_value(value: i32) -> Option<Self> {
        match value {
            1 => Some(ObjectState::Sleeping),
            2 => Some(ObjectState::Kinematic),
            3 => Some(ObjectState::Static),
            4 => Some(ObjectState::Dynamic),
            _ => None,
        }
    }

    pub fn field_value(self) -> i32 {
        match self {
            ObjectState::Sleeping => 1,
            ObjectState::Kinematic => 2,
            ObjectState::Static => 3,
            ObjectState::Dynamic => 4,
        }
    }

    /// Dynamic and sleeping bodies respond to impulses.
    pub fn has_mass_response(self) -> bool {
        matches!(self, ObjectState::Dynamic | ObjectState::Sleeping)
    }

    /// Ordering used when a cluster inherits state from its leaves.
    pub fn restrictiveness(self) -> u8 {
        match self {
            ObjectState::Static => 2,
            ObjectState::Kinematic => 1,
            ObjectState::Dynamic | ObjectState::Sleeping => 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    #[serde(with = "crate::serde_utils::vec3")]
    pub position: Vec3,
    #[serde(with = "crate::serde_utils::quat")]
    pub rotation: Quat,
    #[serde(with = "crate::serde_utils::vec3")]
    pub velocity: Vec3,
    #[serde(with = "crate::serde_utils::vec3")]
    pub angular_velocity: Vec3,
    /// Force accumulated for the next step, cleared after integration
    #[serde(with = "crate::serde_utils::vec3")]
    pub force: Vec3,
    #[serde(with = "crate::serde_utils::vec3")]
    pub torque: Vec3,
    pub mass: f32,
    /// Zero unless the body responds to impulses
    pub inv_mass: f32,
    /// Body-frame inertia about the centre of mass
    #[serde(with = "crate::serde_utils::mat3")]
    pub inertia: Mat3,
    #[serde(with = "crate::serde_utils::mat3")]
    pub inv_inertia: Mat3,
    pub object_state: ObjectState,
    pub disabled: bool,
    pub collision_group: i32,
    /// Strain gathered during the current step
    pub strain: f32,
    pub geometry: Option<Arc<Geometry>>,
    pub sleep_counter: u32,
    /// Frame during which the particle was registered
    pub spawn_frame: u64,
    pub registered: bool,
    /// Allocated by the cluster manager rather than by a caller
    pub internal: bool,
}

impl Particle {
    /// A dynamic body whose inertia is derived from its geometry.
    pub fn new(position: Vec3, geometry: Option<Arc<Geometry>>, mass: f32) -> Self {
        let inertia = geometry
            .as_ref()
            .map(|g| g.inertia(mass))
            .unwrap_or(Mat3::ZERO);
        let mut particle = Self {
            position,
            rotation: Quat::IDENTITY,
            velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            force: Vec3::ZERO,
            torque: Vec3::ZERO,
            mass,
            inv_mass: 0.0,
            inertia,
            inv_inertia: Mat3::ZERO,
            object_state: ObjectState::Dynamic,
            disabled: false,
            collision_group: 0,
            strain: 0.0,
            geometry,
            sleep_counter: 0,
            spawn_frame: 0,
            registered: true,
            internal: false,
        };
        particle.refresh_inverse_mass();
        particle
    }

    /// A massless placeholder, used for cluster parents before aggregation.
    pub fn empty(position: Vec3) -> Self {
        Self::new(position, None, 0.0)
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_velocity(mut self, velocity: Vec3) -> Self {
        self.velocity = velocity;
        self
    }

    pub fn with_angular_velocity(mut self, angular_velocity: Vec3) -> Self {
        self.angular_velocity = angular_velocity;
        self
    }

    pub fn with_object_state(mut self, state: ObjectState) -> Self {
        self.set_object_state(state);
        self
    }

    pub fn transform(&self) -> RigidTransform {
        RigidTransform::new(self.position, self.rotation)
    }

    pub fn set_transform(&mut self, tm: RigidTransform) {
        self.position = tm.translation;
        self.rotation = tm.rotation;
    }

    pub fn is_enabled(&self) -> bool {
        !self.disabled
    }

    pub fn set_mass_properties(&mut self, mass: f32, inertia: Mat3) {
        self.mass = mass;
        self.inertia = inertia;
        self.refresh_inverse_mass();
    }

    pub fn set_object_state(&mut self, state: ObjectState) {
        self.object_state = state;
        if state != ObjectState::Sleeping {
            self.sleep_counter = 0;
        }
        if matches!(state, ObjectState::Static | ObjectState::Sleeping) {
            self.velocity = Vec3::ZERO;
            self.angular_velocity = Vec3::ZERO;
        }
        self.refresh_inverse_mass();
    }

    fn refresh_inverse_mass(&mut self) {
        if self.object_state.has_mass_response() && self.mass > 0.0 {
            self.inv_mass = 1.0 / self.mass;
            self.inv_inertia = invert_inertia(self.inertia);
        } else {
            self.inv_mass = 0.0;
            self.inv_inertia = Mat3::ZERO;
        }
    }

    pub fn world_inv_inertia(&self) -> Mat3 {
        rotate_inertia(self.inv_inertia, self.rotation)
    }

    pub fn point_velocity(&self, world_point: Vec3) -> Vec3 {
        self.velocity + self.angular_velocity.cross(world_point - self.position)
    }

    pub fn volume(&self) -> f32 {
        self.geometry.as_ref().map(|g| g.volume()).unwrap_or(0.0)
    }

    pub fn bounding_radius(&self) -> f32 {
        self.geometry
            .as_ref()
            .map(|g| g.bounding_radius())
            .unwrap_or(0.0)
    }

    /// Wake a sleeping body so the next step integrates it.
    pub fn wake(&mut self) {
        if self.object_state == ObjectState::Sleeping {
            self.set_object_state(ObjectState::Dynamic);
        }
    }
}

/// Collection of all particles owned by one solver.
#[derive(Clone, Debug, Default)]
pub struct ParticleStore {
    pub list: Vec<Particle>,
}

impl ParticleStore {
    pub fn new() -> Self {
        Self { list: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            list: Vec::with_capacity(capacity),
        }
    }

    pub fn add(&mut self, particle: Particle) -> ParticleId {
        self.list.push(particle);
        ParticleId::from_index(self.list.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn contains(&self, id: ParticleId) -> bool {
        id.index() < self.list.len()
    }

    /// Panics on an id this store never issued.
    pub fn get(&self, id: ParticleId) -> &Particle {
        &self.list[id.index()]
    }

    pub fn get_mut(&mut self, id: ParticleId) -> &mut Particle {
        &mut self.list[id.index()]
    }

    pub fn try_get(&self, id: ParticleId) -> Option<&Particle> {
        self.list.get(id.index())
    }

    pub fn try_get_mut(&mut self, id: ParticleId) -> Option<&mut Particle> {
        self.list.get_mut(id.index())
    }

    pub fn ids(&self) -> impl Iterator<Item = ParticleId> + '_ {
        (0..self.list.len()).map(ParticleId::from_index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParticleId, &Particle)> + '_ {
        self.list
            .iter()
            .enumerate()
            .map(|(i, p)| (ParticleId::from_index(i), p))
    }

    pub fn enabled_ids(&self) -> Vec<ParticleId> {
        self.iter()
            .filter(|(_, p)| p.is_enabled())
            .map(|(id, _)| id)
            .collect()
    }

    pub fn num_enabled(&self) -> usize {
        self.list.iter().filter(|p| p.is_enabled()).count()
    }

    /// Drops particles allocated after a rewind point.
    pub fn truncate(&mut self, len: usize) {
        self.list.truncate(len);
    }

    /// Two distinct particles borrowed mutably at once.
    pub fn pair_mut(&mut self, a: ParticleId, b: ParticleId) -> (&mut Particle, &mut Particle) {
        assert_ne!(a, b, "pair_mut needs two distinct particles");
        let (i, j) = (a.index(), b.index());
        if i < j {
            let (left, right) = self.list.split_at_mut(j);
            (&mut left[i], &mut right[0])
        } else {
            let (left, right) = self.list.split_at_mut(i);
            (&mut right[0], &mut left[j])
        }
    }
}

impl Index<ParticleId> for ParticleStore {
    type Output = Particle;

    fn index(&self, id: ParticleId) -> &Particle {
        &self.list[id.index()]
    }
}

impl IndexMut<ParticleId> for ParticleStore {
    fn index_mut(&mut self, id: ParticleId) -> &mut Particle {
        &mut self.list[id.index()]
    }
}
