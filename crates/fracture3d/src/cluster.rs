//! Cluster hierarchy over the particle store.
//!
//! A cluster parent is an ordinary particle whose mass, inertia and geometry are
//! aggregated from its children. Children stay in the store, disabled, with a fixed
//! frame relative to the parent. Only the top level of every hierarchy is simulated.
//!
//! The manager is `Clone`; the rewind store keeps shared snapshots of it and restores
//! one when a rewind crosses a break.

use crate::config::ClusteringConfig;
use crate::geometry::{Geometry, RigidTransform, ShapeInstance, SupportPoint};
use crate::mass_properties::{combine, MassElement};
use crate::particle::{ObjectState, Particle, ParticleId, ParticleStore};
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// How children of a cluster are connected to each other.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionMethod {
    /// Children are rigidly held together until released
    #[default]
    None,
    /// Children touching within `connection_distance` are connected; a partial
    /// release splits the remainder along those connections
    PointImplicit,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterCreationParameters {
    pub connection_method: ConnectionMethod,
    /// Union group the new parent joins (0 = none)
    pub group_index: i32,
    /// Strain thresholds per depth; the last entry repeats
    pub damage_thresholds: Vec<f32>,
    /// Overrides the state inherited from the leaves
    pub object_state: Option<ObjectState>,
    /// Existing particle to turn into the parent
    #[serde(skip)]
    pub parent: Option<ParticleId>,
    /// Marks a union parent, which does not count towards depth
    pub internal: bool,
}

impl ClusterCreationParameters {
    pub fn with_thresholds(thresholds: &[f32]) -> Self {
        Self {
            damage_thresholds: thresholds.to_vec(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug)]
struct ClusterInfo {
    internal: bool,
    connection_method: ConnectionMethod,
    state_override: Option<ObjectState>,
    connections: Vec<(ParticleId, ParticleId)>,
}

/// Motion of the simulated body a released child inherits from.
#[derive(Clone, Copy)]
struct Anchor {
    position: Vec3,
    velocity: Vec3,
    angular_velocity: Vec3,
}

impl Anchor {
    fn of(particle: &Particle) -> Self {
        Self {
            position: particle.position,
            velocity: particle.velocity,
            angular_velocity: particle.angular_velocity,
        }
    }

    fn velocity_at(&self, point: Vec3) -> Vec3 {
        self.velocity + self.angular_velocity.cross(point - self.position)
    }
}

#[derive(Clone, Debug)]
pub struct ClusterManager {
    children: BTreeMap<ParticleId, Vec<ParticleId>>,
    info: BTreeMap<ParticleId, ClusterInfo>,
    parent: Vec<Option<ParticleId>>,
    child_to_parent: Vec<RigidTransform>,
    group_index: Vec<i32>,
    profiles: Vec<Option<Arc<[f32]>>>,
    max_cluster_level: usize,
    connection_distance: f32,
    generation: u64,
}

impl ClusterManager {
    pub fn new(config: &ClusteringConfig) -> Self {
        Self {
            children: BTreeMap::new(),
            info: BTreeMap::new(),
            parent: Vec::new(),
            child_to_parent: Vec::new(),
            group_index: Vec::new(),
            profiles: Vec::new(),
            max_cluster_level: config.max_cluster_level,
            connection_distance: config.connection_distance,
            generation: 0,
        }
    }

    fn sync_len(&mut self, len: usize) {
        if self.parent.len() < len {
            self.parent.resize(len, None);
            self.child_to_parent.resize(len, RigidTransform::IDENTITY);
            self.group_index.resize(len, 0);
            self.profiles.resize(len, None);
        }
    }

    /// Bumped on every structural change; snapshots compare it to detect reuse.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn max_cluster_level(&self) -> usize {
        self.max_cluster_level
    }

    // ========== Queries ==========

    /// Parent id to its direct children, ordered by parent id.
    pub fn cluster_map(&self) -> &BTreeMap<ParticleId, Vec<ParticleId>> {
        &self.children
    }

    pub fn children(&self, id: ParticleId) -> &[ParticleId] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn parent(&self, id: ParticleId) -> Option<ParticleId> {
        self.parent.get(id.index()).copied().flatten()
    }

    pub fn is_cluster(&self, id: ParticleId) -> bool {
        self.children.contains_key(&id)
    }

    pub fn is_internal(&self, id: ParticleId) -> bool {
        self.info.get(&id).map(|i| i.internal).unwrap_or(false)
    }

    pub fn connection_method(&self, id: ParticleId) -> ConnectionMethod {
        self.info
            .get(&id)
            .map(|i| i.connection_method)
            .unwrap_or_default()
    }

    pub fn connections(&self, id: ParticleId) -> &[(ParticleId, ParticleId)] {
        self.info
            .get(&id)
            .map(|i| i.connections.as_slice())
            .unwrap_or(&[])
    }

    pub fn child_to_parent(&self, id: ParticleId) -> Option<RigidTransform> {
        self.parent(id).map(|_| self.child_to_parent[id.index()])
    }

    pub fn group_index(&self, id: ParticleId) -> i32 {
        self.group_index.get(id.index()).copied().unwrap_or(0)
    }

    pub fn set_group_index(&mut self, id: ParticleId, group: i32) {
        self.sync_len(id.index() + 1);
        self.group_index[id.index()] = group;
        self.generation += 1;
    }

    /// Attaches a damage profile to a particle that is not (yet) a parent.
    pub fn set_damage_thresholds(&mut self, id: ParticleId, thresholds: &[f32]) {
        self.sync_len(id.index() + 1);
        self.profiles[id.index()] = if thresholds.is_empty() {
            None
        } else {
            Some(Arc::from(thresholds))
        };
        self.generation += 1;
    }

    /// Number of non-union ancestors.
    pub fn depth(&self, id: ParticleId) -> usize {
        let mut depth = 0;
        let mut cursor = self.parent(id);
        while let Some(parent) = cursor {
            if !self.is_internal(parent) {
                depth += 1;
            }
            cursor = self.parent(parent);
        }
        depth
    }

    /// Levels below `id`; a leaf has height 0.
    pub fn height(&self, id: ParticleId) -> usize {
        self.children(id)
            .iter()
            .map(|c| 1 + self.height(*c))
            .max()
            .unwrap_or(0)
    }

    /// Strain needed to break `id`: its profile indexed by depth, inherited from the
    /// nearest ancestor with a profile. Particles without any profile never break.
    pub fn damage_threshold(&self, id: ParticleId) -> f32 {
        let depth = self.depth(id);
        let mut cursor = Some(id);
        while let Some(node) = cursor {
            if let Some(profile) = self.profiles.get(node.index()).and_then(Option::as_ref) {
                return profile
                    .get(depth)
                    .or_else(|| profile.last())
                    .copied()
                    .unwrap_or(f32::MAX);
            }
            cursor = self.parent(node);
        }
        f32::MAX
    }

    pub fn top_level_ancestor(&self, id: ParticleId) -> ParticleId {
        let mut current = id;
        while let Some(parent) = self.parent(current) {
            current = parent;
        }
        current
    }

    /// World pose, composed through disabled ancestors for nested particles.
    pub fn world_transform(&self, particles: &ParticleStore, id: ParticleId) -> RigidTransform {
        match self.parent(id) {
            Some(parent) => self.world_transform(particles, parent) * self.child_to_parent[id.index()],
            None => particles[id].transform(),
        }
    }

    pub fn leaf_descendants(&self, id: ParticleId) -> Vec<ParticleId> {
        let mut out = Vec::new();
        self.collect_leaves(id, &mut out);
        out
    }

    fn collect_leaves(&self, id: ParticleId, out: &mut Vec<ParticleId>) {
        match self.children.get(&id) {
            Some(children) => {
                for child in children {
                    self.collect_leaves(*child, out);
                }
            }
            None => out.push(id),
        }
    }

    // ========== Creation ==========

    /// Groups `children` under a parent particle.
    ///
    /// Returns `None` without touching anything when the new hierarchy would be deeper
    /// than `max_cluster_level`.
    pub fn create_cluster_particle(
        &mut self,
        particles: &mut ParticleStore,
        children: &[ParticleId],
        params: &ClusterCreationParameters,
    ) -> Option<ParticleId> {
        assert!(!children.is_empty(), "a cluster needs at least one child");
        self.sync_len(particles.len());

        let unique: BTreeSet<ParticleId> = children.iter().copied().collect();
        assert_eq!(unique.len(), children.len(), "duplicate child in {children:?}");
        for &child in children {
            assert!(particles.contains(child), "unknown particle {child}");
            assert!(
                self.parent(child).is_none(),
                "{child} already has cluster parent {:?}",
                self.parent(child)
            );
            assert_ne!(Some(child), params.parent, "{child} cannot parent itself");
        }

        let height = 1 + children.iter().map(|c| self.height(*c)).max().unwrap_or(0);
        if height > self.max_cluster_level {
            log::warn!(
                "cluster of {} children would reach level {height} (max {})",
                children.len(),
                self.max_cluster_level
            );
            return None;
        }

        let parent_id = match params.parent {
            Some(id) => {
                assert!(
                    !self.is_cluster(id) && self.parent(id).is_none(),
                    "{id} is already part of a hierarchy"
                );
                id
            }
            None => {
                let mut particle = Particle::empty(Vec3::ZERO);
                particle.internal = true;
                particle.spawn_frame = children
                    .iter()
                    .map(|c| particles[*c].spawn_frame)
                    .max()
                    .unwrap_or(0);
                particles.add(particle)
            }
        };
        self.sync_len(particles.len());

        let child_worlds: Vec<(ParticleId, RigidTransform)> = children
            .iter()
            .map(|c| (*c, particles[*c].transform()))
            .collect();

        let (mass, momentum, angular) = children.iter().fold(
            (0.0_f32, Vec3::ZERO, Vec3::ZERO),
            |(m, p, l), c| {
                let child = &particles[*c];
                (
                    m + child.mass,
                    p + child.velocity * child.mass,
                    l + child.angular_velocity * child.mass,
                )
            },
        );
        let (velocity, angular_velocity) = if mass > 0.0 {
            (momentum / mass, angular / mass)
        } else {
            let n = children.len() as f32;
            let sum_v = children.iter().fold(Vec3::ZERO, |a, c| a + particles[*c].velocity);
            let sum_w = children
                .iter()
                .fold(Vec3::ZERO, |a, c| a + particles[*c].angular_velocity);
            (sum_v / n, sum_w / n)
        };
        let any_enabled = children.iter().any(|c| particles[*c].is_enabled());

        self.assemble_parent(particles, parent_id, Quat::IDENTITY, &child_worlds);
        {
            let parent = &mut particles[parent_id];
            parent.velocity = velocity;
            parent.angular_velocity = angular_velocity;
            parent.force = Vec3::ZERO;
            parent.torque = Vec3::ZERO;
            parent.strain = 0.0;
            parent.sleep_counter = 0;
            parent.disabled = !any_enabled;
        }

        for &child in children {
            self.parent[child.index()] = Some(parent_id);
            self.group_index[child.index()] = 0;
            let particle = &mut particles[child];
            particle.disabled = true;
            particle.strain = 0.0;
        }

        let connections = match params.connection_method {
            ConnectionMethod::None => Vec::new(),
            ConnectionMethod::PointImplicit => {
                self.point_implicit_connections(particles, &child_worlds)
            }
        };

        self.children.insert(parent_id, children.to_vec());
        self.info.insert(
            parent_id,
            ClusterInfo {
                internal: params.internal,
                connection_method: params.connection_method,
                state_override: params.object_state,
                connections,
            },
        );
        if !params.damage_thresholds.is_empty() {
            self.profiles[parent_id.index()] = Some(Arc::from(params.damage_thresholds.as_slice()));
        }
        self.group_index[parent_id.index()] = params.group_index;

        let state = params
            .object_state
            .unwrap_or_else(|| self.restrictive_state(particles, parent_id));
        particles[parent_id].set_object_state(state);
        self.generation += 1;

        log::debug!(
            "created cluster {parent_id} over {} children (mass {:.3}, state {state:?})",
            children.len(),
            particles[parent_id].mass
        );
        Some(parent_id)
    }

    /// Recomputes mass, pose, geometry and child frames of `parent`.
    fn assemble_parent(
        &mut self,
        particles: &mut ParticleStore,
        parent: ParticleId,
        rotation: Quat,
        child_worlds: &[(ParticleId, RigidTransform)],
    ) {
        let elements: Vec<MassElement> = child_worlds
            .iter()
            .map(|(id, tm)| MassElement {
                transform: *tm,
                mass: particles[*id].mass,
                inertia: particles[*id].inertia,
            })
            .collect();
        let props = combine(&elements);
        let parent_tm = RigidTransform::new(props.center_of_mass, rotation);
        let to_local = parent_tm.inverse();

        let mut instances = Vec::new();
        let mut collision_group = i32::MAX;
        for (id, tm) in child_worlds {
            let local = to_local * *tm;
            self.child_to_parent[id.index()] = local;
            let child = &particles[*id];
            collision_group = collision_group.min(child.collision_group);
            if let Some(geometry) = &child.geometry {
                instances.push(ShapeInstance {
                    transform: local,
                    geometry: geometry.clone(),
                });
            }
        }

        let particle = &mut particles[parent];
        particle.set_transform(parent_tm);
        particle.set_mass_properties(props.mass, props.local_inertia(rotation));
        particle.geometry = if instances.is_empty() {
            None
        } else {
            Some(Arc::new(Geometry::Union(instances)))
        };
        particle.collision_group = if child_worlds.is_empty() { 0 } else { collision_group };
    }

    fn point_implicit_connections(
        &self,
        particles: &ParticleStore,
        child_worlds: &[(ParticleId, RigidTransform)],
    ) -> Vec<(ParticleId, ParticleId)> {
        let mut edges = Vec::new();
        let mut points = Vec::new();
        for (i, (a, tm_a)) in child_worlds.iter().enumerate() {
            let Some(geom_a) = particles[*a].geometry.as_ref() else {
                continue;
            };
            points.clear();
            geom_a.floor_points(tm_a, &mut points);
            for (b, tm_b) in child_worlds.iter().skip(i + 1) {
                let Some(geom_b) = particles[*b].geometry.as_ref() else {
                    continue;
                };
                let to_b = tm_b.inverse();
                let touching = points.iter().any(|SupportPoint { center, radius }| {
                    geom_b.signed_distance(to_b.transform_point(*center)) - radius
                        <= self.connection_distance
                });
                if touching {
                    edges.push((*a.min(b), *a.max(b)));
                }
            }
        }
        edges
    }

    // ========== Kinematic state ==========

    fn restrictive_state(&self, particles: &ParticleStore, id: ParticleId) -> ObjectState {
        self.leaf_descendants(id)
            .iter()
            .map(|leaf| particles[*leaf].object_state)
            .max_by_key(|state| state.restrictiveness())
            .filter(|state| state.restrictiveness() > 0)
            .unwrap_or(ObjectState::Dynamic)
    }

    /// Re-derives a parent's object state from its leaves (or its override).
    pub fn update_kinematic_properties(&self, particles: &mut ParticleStore, id: ParticleId) {
        let Some(info) = self.info.get(&id) else {
            return;
        };
        let state = info
            .state_override
            .unwrap_or_else(|| self.restrictive_state(particles, id));
        let current = particles[id].object_state;
        let keep_sleeping = state == ObjectState::Dynamic && current == ObjectState::Sleeping;
        if current != state && !keep_sleeping {
            particles[id].set_object_state(state);
        }
    }

    // ========== Breaking ==========

    fn release_child(
        &mut self,
        particles: &mut ParticleStore,
        child: ParticleId,
        world: RigidTransform,
        anchor: Anchor,
    ) {
        self.parent[child.index()] = None;
        self.child_to_parent[child.index()] = RigidTransform::IDENTITY;
        let particle = &mut particles[child];
        particle.set_transform(world);
        particle.velocity = anchor.velocity_at(world.translation);
        particle.angular_velocity = anchor.angular_velocity;
        particle.force = Vec3::ZERO;
        particle.torque = Vec3::ZERO;
        particle.disabled = false;
        particle.strain = 0.0;
        particle.sleep_counter = 0;
    }

    /// Deactivates an enabled parent and activates all of its children.
    ///
    /// Returns the activated children; empty when `id` is not an enabled parent.
    pub fn deactivate_cluster_particle(
        &mut self,
        particles: &mut ParticleStore,
        id: ParticleId,
    ) -> Vec<ParticleId> {
        if !self.is_cluster(id) {
            log::warn!("deactivate ignored: {id} is not a cluster parent");
            return Vec::new();
        }
        if particles[id].disabled {
            log::warn!("deactivate ignored: cluster {id} is not enabled");
            return Vec::new();
        }
        self.break_cluster(particles, id)
    }

    /// Dissolves `id`, releasing its children with world poses composed through any
    /// still-present ancestors and motion from the top-level ancestor.
    fn break_cluster(&mut self, particles: &mut ParticleStore, id: ParticleId) -> Vec<ParticleId> {
        self.sync_len(particles.len());
        let world = self.world_transform(particles, id);
        let anchor = Anchor::of(&particles[self.top_level_ancestor(id)]);
        let children = self.children.remove(&id).unwrap_or_default();
        self.info.remove(&id);

        for &child in &children {
            let child_world = world * self.child_to_parent[child.index()];
            self.release_child(particles, child, child_world, anchor);
        }
        if let Some(parent) = self.parent[id.index()].take() {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.retain(|c| *c != id);
            }
        }
        particles[id].disabled = true;

        for &child in &children {
            self.update_kinematic_properties(particles, child);
        }
        self.generation += 1;
        log::debug!("cluster {id} broke into {} pieces", children.len());
        children
    }

    /// Breaks every listed cluster, innermost first. `nodes` must be closed under
    /// ancestry (every nested node's parent is listed too).
    pub fn fracture(
        &mut self,
        particles: &mut ParticleStore,
        nodes: &[ParticleId],
    ) -> Vec<(ParticleId, Vec<ParticleId>)> {
        let mut ordered: Vec<(usize, ParticleId)> =
            nodes.iter().map(|n| (self.depth(*n), *n)).collect();
        ordered.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        ordered.dedup();

        let mut broken = Vec::new();
        for (_, node) in ordered {
            if !self.is_cluster(node) {
                continue;
            }
            let activated = self.break_cluster(particles, node);
            broken.push((node, activated));
        }
        broken
    }

    /// Detaches the listed children from their parents.
    ///
    /// Ids are grouped by parent; ids without a parent are ignored. Remaining children
    /// stay under their parent, whose mass properties are recomputed. A parent left
    /// without children is deactivated. Returns every particle that became enabled.
    pub fn release_cluster_particles(
        &mut self,
        particles: &mut ParticleStore,
        ids: &[ParticleId],
    ) -> Vec<ParticleId> {
        self.sync_len(particles.len());
        let mut by_parent: BTreeMap<ParticleId, Vec<ParticleId>> = BTreeMap::new();
        for &id in ids {
            if !particles.contains(id) {
                continue;
            }
            match self.parent(id) {
                Some(parent) => {
                    let entry = by_parent.entry(parent).or_default();
                    if !entry.contains(&id) {
                        entry.push(id);
                    }
                }
                None => log::trace!("release ignored: {id} has no cluster parent"),
            }
        }

        let mut activated = Vec::new();
        for (parent, released) in by_parent {
            if particles[parent].disabled {
                log::warn!("release ignored: parent {parent} is not enabled");
                continue;
            }
            activated.extend(self.release_from_parent(particles, parent, &released));
        }
        activated
    }

    fn release_from_parent(
        &mut self,
        particles: &mut ParticleStore,
        parent: ParticleId,
        released: &[ParticleId],
    ) -> Vec<ParticleId> {
        let parent_world = particles[parent].transform();
        let anchor = Anchor::of(&particles[parent]);

        if let Some(children) = self.children.get_mut(&parent) {
            children.retain(|c| !released.contains(c));
        }
        if let Some(info) = self.info.get_mut(&parent) {
            info.connections
                .retain(|(a, b)| !released.contains(a) && !released.contains(b));
        }

        let mut activated = Vec::with_capacity(released.len());
        for &child in released {
            let child_world = parent_world * self.child_to_parent[child.index()];
            self.release_child(particles, child, child_world, anchor);
            activated.push(child);
        }

        if self.children(parent).is_empty() {
            self.children.remove(&parent);
            self.info.remove(&parent);
            particles[parent].disabled = true;
            log::debug!("cluster {parent} emptied by release");
        } else {
            if self.connection_method(parent) == ConnectionMethod::PointImplicit {
                activated.extend(self.split_disconnected(particles, parent, anchor));
            }
            self.refit_parent(particles, parent);
            self.update_kinematic_properties(particles, parent);
        }

        for &child in &activated {
            self.update_kinematic_properties(particles, child);
        }
        self.generation += 1;
        activated
    }

    /// Moves the parent to the centre of mass of its remaining children.
    fn refit_parent(&mut self, particles: &mut ParticleStore, parent: ParticleId) {
        let old = particles[parent].transform();
        let child_worlds: Vec<(ParticleId, RigidTransform)> = self
            .children(parent)
            .iter()
            .map(|c| (*c, old * self.child_to_parent[c.index()]))
            .collect();
        let anchor = Anchor::of(&particles[parent]);
        self.assemble_parent(particles, parent, old.rotation, &child_worlds);
        let particle = &mut particles[parent];
        particle.velocity = anchor.velocity_at(particle.position);
    }

    /// Splits the remaining children along their connections. The component holding
    /// the lowest id stays; other components become new clusters, lone pieces go free.
    fn split_disconnected(
        &mut self,
        particles: &mut ParticleStore,
        parent: ParticleId,
        anchor: Anchor,
    ) -> Vec<ParticleId> {
        let children = self.children(parent).to_vec();
        let components = connected_components(&children, self.connections(parent));
        if components.len() <= 1 {
            return Vec::new();
        }

        let parent_world = particles[parent].transform();
        let profile: Vec<f32> = self.profiles[parent.index()]
            .as_ref()
            .map(|p| p.to_vec())
            .unwrap_or_default();
        let kept = &components[0];
        let kept_edges: Vec<(ParticleId, ParticleId)> = self
            .connections(parent)
            .iter()
            .copied()
            .filter(|(a, _)| kept.contains(a))
            .collect();

        if let Some(list) = self.children.get_mut(&parent) {
            list.retain(|c| kept.contains(c));
        }
        if let Some(info) = self.info.get_mut(&parent) {
            info.connections = kept_edges;
        }

        let mut activated = Vec::new();
        for component in components.iter().skip(1) {
            for &child in component {
                let child_world = parent_world * self.child_to_parent[child.index()];
                self.release_child(particles, child, child_world, anchor);
            }
            if component.len() == 1 {
                activated.push(component[0]);
                continue;
            }
            let params = ClusterCreationParameters {
                connection_method: ConnectionMethod::PointImplicit,
                damage_thresholds: profile.clone(),
                ..ClusterCreationParameters::default()
            };
            match self.create_cluster_particle(particles, component, &params) {
                Some(piece) => activated.push(piece),
                None => activated.extend(component.iter().copied()),
            }
        }
        log::debug!(
            "cluster {parent} split into {} connected pieces",
            components.len()
        );
        activated
    }

    // ========== Union ==========

    /// Merges the top-level members of every ready group under a new internal parent.
    ///
    /// `ready` reports whether a group has no outstanding registrations. A group with a
    /// single top-level member waits for a second one.
    pub fn union_cluster_groups(
        &mut self,
        particles: &mut ParticleStore,
        union_damage_threshold: f32,
        ready: impl Fn(i32) -> bool,
    ) -> Vec<ParticleId> {
        self.sync_len(particles.len());
        let mut groups: BTreeMap<i32, Vec<ParticleId>> = BTreeMap::new();
        for (id, particle) in particles.iter() {
            let group = self.group_index(id);
            if group > 0 && self.parent(id).is_none() && particle.registered && particle.is_enabled() {
                groups.entry(group).or_default().push(id);
            }
        }

        let mut unions = Vec::new();
        for (group, members) in groups {
            if members.len() < 2 || !ready(group) {
                continue;
            }
            let params = ClusterCreationParameters {
                damage_thresholds: vec![union_damage_threshold],
                internal: true,
                ..ClusterCreationParameters::default()
            };
            match self.create_cluster_particle(particles, &members, &params) {
                Some(id) => {
                    log::info!("union group {group}: {} members under {id}", members.len());
                    unions.push(id);
                }
                None => {
                    log::warn!("union group {group} dropped: exceeds max cluster level");
                    for member in members {
                        self.group_index[member.index()] = 0;
                    }
                    self.generation += 1;
                }
            }
        }
        unions
    }

    // ========== Removal ==========

    /// Disables `id` and everything clustered under it and drops their cluster
    /// entries. Returns the removed ids, `id` first.
    pub fn remove_subtree(&mut self, particles: &mut ParticleStore, id: ParticleId) -> Vec<ParticleId> {
        let mut removed = vec![id];
        let mut next = 0;
        while next < removed.len() {
            let children = self.children(removed[next]).to_vec();
            removed.extend(children);
            next += 1;
        }
        for &member in removed.iter().rev() {
            self.remove_cluster(member);
            particles[member].disabled = true;
        }
        removed
    }

    /// Drops the cluster entry of `id` without enabling its children.
    pub fn remove_cluster(&mut self, id: ParticleId) {
        let Some(children) = self.children.remove(&id) else {
            return;
        };
        self.info.remove(&id);
        for child in children {
            self.parent[child.index()] = None;
            self.child_to_parent[child.index()] = RigidTransform::IDENTITY;
        }
        if let Some(parent) = self.parent.get_mut(id.index()).and_then(Option::take) {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.retain(|c| *c != id);
            }
        }
        self.generation += 1;
    }
}

fn connected_components(
    nodes: &[ParticleId],
    edges: &[(ParticleId, ParticleId)],
) -> Vec<Vec<ParticleId>> {
    let mut sorted = nodes.to_vec();
    sorted.sort();
    let index_of = |id: ParticleId| sorted.binary_search(&id).ok();
    let mut roots: Vec<usize> = (0..sorted.len()).collect();

    fn find(roots: &mut [usize], mut i: usize) -> usize {
        while roots[i] != i {
            roots[i] = roots[roots[i]];
            i = roots[i];
        }
        i
    }

    for (a, b) in edges {
        if let (Some(ia), Some(ib)) = (index_of(*a), index_of(*b)) {
            let (ra, rb) = (find(&mut roots, ia), find(&mut roots, ib));
            if ra != rb {
                roots[ra.max(rb)] = ra.min(rb);
            }
        }
    }

    let mut components: BTreeMap<usize, Vec<ParticleId>> = BTreeMap::new();
    for i in 0..sorted.len() {
        let root = find(&mut roots, i);
        components.entry(root).or_default().push(sorted[i]);
    }
    components.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube(store: &mut ParticleStore, position: Vec3, mass: f32) -> ParticleId {
        store.add(Particle::new(position, Some(Arc::new(Geometry::cube(1.0))), mass))
    }

    fn manager() -> ClusterManager {
        ClusterManager::new(&ClusteringConfig::default())
    }

    // ========== Creation Tests ==========

    #[test]
    fn test_create_aggregates_mass_and_com() {
        let mut store = ParticleStore::new();
        let a = cube(&mut store, Vec3::new(-1.0, 2.0, 0.0), 1.0);
        let b = cube(&mut store, Vec3::new(1.0, 2.0, 0.0), 3.0);
        let mut clusters = manager();

        let parent = clusters
            .create_cluster_particle(&mut store, &[a, b], &ClusterCreationParameters::default())
            .unwrap();

        assert!((store[parent].mass - 4.0).abs() < 1.0e-6);
        assert!(store[parent].position.abs_diff_eq(Vec3::new(0.5, 2.0, 0.0), 1.0e-6));
        assert!(store[a].disabled && store[b].disabled);
        assert!(store[parent].is_enabled());
        assert_eq!(clusters.children(parent), &[a, b]);
        assert_eq!(clusters.parent(a), Some(parent));
        assert!(store[parent].internal);
    }

    #[test]
    fn test_create_reuses_given_parent() {
        let mut store = ParticleStore::new();
        let a = cube(&mut store, Vec3::ZERO, 1.0);
        let b = cube(&mut store, Vec3::X, 1.0);
        let root = store.add(Particle::empty(Vec3::ZERO));
        let mut clusters = manager();
        let params = ClusterCreationParameters {
            parent: Some(root),
            ..ClusterCreationParameters::default()
        };
        assert_eq!(clusters.create_cluster_particle(&mut store, &[a, b], &params), Some(root));
        assert_eq!(store.len(), 3);
        assert!(!store[root].internal);
    }

    #[test]
    #[should_panic(expected = "already has cluster parent")]
    fn test_create_rejects_parented_child() {
        let mut store = ParticleStore::new();
        let a = cube(&mut store, Vec3::ZERO, 1.0);
        let b = cube(&mut store, Vec3::X, 1.0);
        let mut clusters = manager();
        let params = ClusterCreationParameters::default();
        clusters.create_cluster_particle(&mut store, &[a, b], &params);
        clusters.create_cluster_particle(&mut store, &[a], &params);
    }

    #[test]
    fn test_create_respects_max_cluster_level() {
        let mut store = ParticleStore::new();
        let a = cube(&mut store, Vec3::ZERO, 1.0);
        let b = cube(&mut store, Vec3::X, 1.0);
        let mut clusters = ClusterManager::new(&ClusteringConfig {
            max_cluster_level: 1,
            ..ClusteringConfig::default()
        });
        let params = ClusterCreationParameters::default();
        let inner = clusters.create_cluster_particle(&mut store, &[a], &params).unwrap();
        let len = store.len();
        assert_eq!(clusters.create_cluster_particle(&mut store, &[inner, b], &params), None);
        assert_eq!(store.len(), len);
        assert!(clusters.parent(b).is_none());
    }

    #[test]
    fn test_static_leaf_makes_cluster_static() {
        let mut store = ParticleStore::new();
        let a = cube(&mut store, Vec3::ZERO, 1.0);
        let b = cube(&mut store, Vec3::X, 1.0);
        store[b].set_object_state(ObjectState::Static);
        let mut clusters = manager();
        let parent = clusters
            .create_cluster_particle(&mut store, &[a, b], &ClusterCreationParameters::default())
            .unwrap();
        assert_eq!(store[parent].object_state, ObjectState::Static);
        assert_eq!(store[parent].inv_mass, 0.0);
    }

    // ========== Threshold Tests ==========

    #[test]
    fn test_threshold_profile_by_depth() {
        let mut store = ParticleStore::new();
        let leaves: Vec<_> = (0..4).map(|i| cube(&mut store, Vec3::X * i as f32, 1.0)).collect();
        let mut clusters = manager();
        let params = ClusterCreationParameters::with_thresholds(&[10.0, 5.0]);
        let left = clusters.create_cluster_particle(&mut store, &leaves[0..2], &params).unwrap();
        let right = clusters.create_cluster_particle(&mut store, &leaves[2..4], &params).unwrap();
        let root = clusters.create_cluster_particle(&mut store, &[left, right], &params).unwrap();

        assert_eq!(clusters.depth(root), 0);
        assert_eq!(clusters.depth(leaves[0]), 2);
        assert_eq!(clusters.damage_threshold(root), 10.0);
        assert_eq!(clusters.damage_threshold(left), 5.0);
        // Leaves inherit the profile and the last entry repeats.
        assert_eq!(clusters.damage_threshold(leaves[0]), 5.0);
        assert_eq!(clusters.height(root), 2);
    }

    #[test]
    fn test_union_parent_does_not_count_towards_depth() {
        let mut store = ParticleStore::new();
        let a = cube(&mut store, Vec3::ZERO, 1.0);
        let b = cube(&mut store, Vec3::X, 1.0);
        let mut clusters = manager();
        clusters.set_group_index(a, 3);
        clusters.set_group_index(b, 3);
        let unions = clusters.union_cluster_groups(&mut store, 42.0, |_| true);
        assert_eq!(unions.len(), 1);
        assert!(clusters.is_internal(unions[0]));
        assert_eq!(clusters.depth(a), 0);
        assert_eq!(clusters.group_index(a), 0);
        assert_eq!(clusters.damage_threshold(unions[0]), 42.0);
    }

    #[test]
    fn test_union_waits_until_ready() {
        let mut store = ParticleStore::new();
        let a = cube(&mut store, Vec3::ZERO, 1.0);
        let mut clusters = manager();
        clusters.set_group_index(a, 1);
        assert!(clusters.union_cluster_groups(&mut store, f32::MAX, |_| false).is_empty());
        assert_eq!(clusters.group_index(a), 1);
    }

    #[test]
    fn test_single_member_group_waits_for_partner() {
        let mut store = ParticleStore::new();
        let a = cube(&mut store, Vec3::ZERO, 1.0);
        let mut clusters = manager();
        clusters.set_group_index(a, 2);
        assert!(clusters.union_cluster_groups(&mut store, f32::MAX, |_| true).is_empty());
        assert!(clusters.parent(a).is_none());

        let b = cube(&mut store, Vec3::X * 3.0, 1.0);
        clusters.set_group_index(b, 2);
        let unions = clusters.union_cluster_groups(&mut store, f32::MAX, |_| true);
        assert_eq!(unions.len(), 1);
        assert_eq!(clusters.children(unions[0]), &[a, b]);
    }

    // ========== Release Tests ==========

    #[test]
    fn test_deactivate_inherits_rigid_motion() {
        let mut store = ParticleStore::new();
        let a = cube(&mut store, Vec3::new(-1.0, 0.0, 0.0), 1.0);
        let b = cube(&mut store, Vec3::new(1.0, 0.0, 0.0), 1.0);
        let mut clusters = manager();
        let parent = clusters
            .create_cluster_particle(&mut store, &[a, b], &ClusterCreationParameters::default())
            .unwrap();
        store[parent].velocity = Vec3::new(0.0, 0.0, 2.0);
        store[parent].angular_velocity = Vec3::new(0.0, 1.0, 0.0);
        store[parent].position += Vec3::Y;

        let activated = clusters.deactivate_cluster_particle(&mut store, parent);
        assert_eq!(activated, vec![a, b]);
        assert!(store[parent].disabled);
        assert!(!clusters.is_cluster(parent));
        assert!(store[b].position.abs_diff_eq(Vec3::new(1.0, 1.0, 0.0), 1.0e-5));
        // v + w x r with r = +X gives an extra -Z component.
        assert!(store[b].velocity.abs_diff_eq(Vec3::new(0.0, 0.0, 1.0), 1.0e-5));
        assert_eq!(store[b].angular_velocity, Vec3::new(0.0, 1.0, 0.0));
    }

    #[test]
    fn test_deactivate_non_parent_is_noop() {
        let mut store = ParticleStore::new();
        let a = cube(&mut store, Vec3::ZERO, 1.0);
        let mut clusters = manager();
        assert!(clusters.deactivate_cluster_particle(&mut store, a).is_empty());
        assert!(store[a].is_enabled());
    }

    #[test]
    fn test_release_subset_refits_parent() {
        let mut store = ParticleStore::new();
        let a = cube(&mut store, Vec3::new(0.0, 0.0, 0.0), 1.0);
        let b = cube(&mut store, Vec3::new(1.0, 0.0, 0.0), 1.0);
        let c = cube(&mut store, Vec3::new(2.0, 0.0, 0.0), 1.0);
        let mut clusters = manager();
        let parent = clusters
            .create_cluster_particle(&mut store, &[a, b, c], &ClusterCreationParameters::default())
            .unwrap();

        let activated = clusters.release_cluster_particles(&mut store, &[c]);
        assert_eq!(activated, vec![c]);
        assert!(store[c].is_enabled());
        assert!(store[parent].is_enabled());
        assert!((store[parent].mass - 2.0).abs() < 1.0e-6);
        assert!(store[parent].position.abs_diff_eq(Vec3::new(0.5, 0.0, 0.0), 1.0e-5));
        let world_b = clusters.world_transform(&store, b);
        assert!(world_b.translation.abs_diff_eq(Vec3::new(1.0, 0.0, 0.0), 1.0e-5));
    }

    #[test]
    fn test_release_all_children_deactivates_parent() {
        let mut store = ParticleStore::new();
        let a = cube(&mut store, Vec3::ZERO, 1.0);
        let b = cube(&mut store, Vec3::X, 1.0);
        let mut clusters = manager();
        let parent = clusters
            .create_cluster_particle(&mut store, &[a, b], &ClusterCreationParameters::default())
            .unwrap();
        clusters.release_cluster_particles(&mut store, &[a, b, parent]);
        assert!(store[parent].disabled);
        assert!(clusters.cluster_map().is_empty());
    }

    #[test]
    fn test_point_implicit_release_splits_chain() {
        let mut store = ParticleStore::new();
        let ids: Vec<_> = (0..5).map(|i| cube(&mut store, Vec3::X * i as f32, 1.0)).collect();
        let mut clusters = manager();
        let params = ClusterCreationParameters {
            connection_method: ConnectionMethod::PointImplicit,
            ..ClusterCreationParameters::default()
        };
        let parent = clusters.create_cluster_particle(&mut store, &ids, &params).unwrap();
        assert_eq!(clusters.connections(parent).len(), 4);

        // Removing the middle cube leaves {0,1} under the parent and {3,4} as a new cluster.
        let activated = clusters.release_cluster_particles(&mut store, &[ids[2]]);
        assert_eq!(clusters.children(parent), &ids[0..2]);
        assert_eq!(activated.len(), 2);
        let piece = activated[1];
        assert_eq!(clusters.children(piece), &ids[3..5]);
        assert!(store[piece].is_enabled());
    }

    #[test]
    fn test_fracture_nested_innermost_first() {
        let mut store = ParticleStore::new();
        let leaves: Vec<_> = (0..4).map(|i| cube(&mut store, Vec3::X * i as f32, 1.0)).collect();
        let mut clusters = manager();
        let params = ClusterCreationParameters::default();
        let left = clusters.create_cluster_particle(&mut store, &leaves[0..2], &params).unwrap();
        let right = clusters.create_cluster_particle(&mut store, &leaves[2..4], &params).unwrap();
        let root = clusters.create_cluster_particle(&mut store, &[left, right], &params).unwrap();
        store[root].position += Vec3::Y * 3.0;

        let broken = clusters.fracture(&mut store, &[root, left]);
        assert_eq!(broken[0].0, left);
        assert_eq!(broken[1], (root, vec![right]));
        assert!(store[leaves[0]].is_enabled());
        assert!(store[leaves[0]].position.abs_diff_eq(Vec3::new(0.0, 3.0, 0.0), 1.0e-5));
        assert!(store[right].is_enabled());
        assert!(store[left].disabled);
        assert_eq!(clusters.cluster_map().keys().copied().collect::<Vec<_>>(), vec![right]);
    }

    #[test]
    fn test_connected_components_orders_by_lowest_id() {
        let ids: Vec<_> = (0..4).map(ParticleId).collect();
        let components = connected_components(&ids, &[(ids[3], ids[2]), (ids[0], ids[1])]);
        assert_eq!(components, vec![vec![ids[0], ids[1]], vec![ids[2], ids[3]]]);
    }
}
