//! Rest collections: the authored description of a fracturable object, and the code
//! that turns one into particles and clusters.

use crate::cluster::{ClusterCreationParameters, ClusterManager, ConnectionMethod};
use crate::geometry::{Geometry, RigidTransform};
use crate::particle::{ObjectState, Particle, ParticleId, ParticleStore};
use glam::Vec3;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One node of a rest collection. Bones with children become cluster parents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bone {
    pub parent: Option<usize>,
    /// World pose at rest
    pub transform: RigidTransform,
    pub geometry: Option<Arc<Geometry>>,
    pub mass: f32,
    /// Leaves default to dynamic; on a cluster bone this overrides the derived state
    pub object_state: Option<ObjectState>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RestCollection {
    pub bones: Vec<Bone>,
}

impl RestCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bones.is_empty()
    }

    pub fn add_rigid(&mut self, transform: RigidTransform, geometry: Arc<Geometry>, mass: f32) -> usize {
        self.bones.push(Bone {
            parent: None,
            transform,
            geometry: Some(geometry),
            mass,
            object_state: None,
        });
        self.bones.len() - 1
    }

    pub fn add_cube(&mut self, center: Vec3, size: f32, mass: f32) -> usize {
        self.add_rigid(
            RigidTransform::from_translation(center),
            Arc::new(Geometry::cube(size)),
            mass,
        )
    }

    /// Adds a cluster bone over `children`, which must not have a parent yet.
    pub fn add_cluster(&mut self, children: &[usize]) -> usize {
        assert!(!children.is_empty(), "a cluster bone needs children");
        let index = self.bones.len();
        for &child in children {
            assert!(child < index, "unknown bone {child}");
            assert!(
                self.bones[child].parent.is_none(),
                "bone {child} already has parent {:?}",
                self.bones[child].parent
            );
            self.bones[child].parent = Some(index);
        }
        let center = children
            .iter()
            .fold(Vec3::ZERO, |acc, c| acc + self.bones[*c].transform.translation)
            / children.len() as f32;
        self.bones.push(Bone {
            parent: None,
            transform: RigidTransform::from_translation(center),
            geometry: None,
            mass: 0.0,
            object_state: None,
        });
        index
    }

    /// Puts every current root under one new cluster bone.
    pub fn cluster_all_under_new_root(&mut self) -> usize {
        let roots: Vec<usize> = (0..self.bones.len())
            .filter(|i| self.bones[*i].parent.is_none())
            .collect();
        self.add_cluster(&roots)
    }

    pub fn set_object_state(&mut self, bone: usize, state: ObjectState) {
        self.bones[bone].object_state = Some(state);
    }

    pub fn children(&self, bone: usize) -> Vec<usize> {
        (0..self.bones.len())
            .filter(|i| self.bones[*i].parent == Some(bone))
            .collect()
    }

    pub fn roots(&self) -> Vec<usize> {
        (0..self.bones.len())
            .filter(|i| self.bones[*i].parent.is_none())
            .collect()
    }

    fn height(&self, bone: usize) -> usize {
        self.children(bone)
            .into_iter()
            .map(|c| 1 + self.height(c))
            .max()
            .unwrap_or(0)
    }
}

/// Per-registration settings for a rest collection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionParams {
    pub damage_thresholds: Vec<f32>,
    /// Union group the roots join (0 = none)
    pub cluster_group_index: i32,
    pub connection_method: ConnectionMethod,
    pub collision_group: i32,
    #[serde(with = "crate::serde_utils::vec3")]
    pub initial_linear_velocity: Vec3,
    #[serde(with = "crate::serde_utils::vec3")]
    pub initial_angular_velocity: Vec3,
}

impl Default for CollectionParams {
    fn default() -> Self {
        Self {
            damage_thresholds: Vec::new(),
            cluster_group_index: 0,
            connection_method: ConnectionMethod::None,
            collision_group: 0,
            initial_linear_velocity: Vec3::ZERO,
            initial_angular_velocity: Vec3::ZERO,
        }
    }
}

impl CollectionParams {
    pub fn with_thresholds(thresholds: &[f32]) -> Self {
        Self {
            damage_thresholds: thresholds.to_vec(),
            ..Self::default()
        }
    }
}

/// Particles created for a registered collection, indexed by bone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionHandle {
    pub particles: Vec<ParticleId>,
    pub roots: Vec<ParticleId>,
}

impl CollectionHandle {
    pub fn particle(&self, bone: usize) -> ParticleId {
        self.particles[bone]
    }
}

/// Creates one particle per bone, in bone order, then builds the clusters bottom-up
/// using the cluster bones' particles as parents.
pub fn register_collection(
    particles: &mut ParticleStore,
    clusters: &mut ClusterManager,
    rest: &RestCollection,
    params: &CollectionParams,
    frame: u64,
) -> CollectionHandle {
    let ids: Vec<ParticleId> = rest
        .bones
        .iter()
        .map(|bone| {
            let mut particle = Particle::new(bone.transform.translation, bone.geometry.clone(), bone.mass)
                .with_rotation(bone.transform.rotation)
                .with_velocity(params.initial_linear_velocity)
                .with_angular_velocity(params.initial_angular_velocity);
            if bone.geometry.is_some() {
                particle.set_object_state(bone.object_state.unwrap_or_default());
            }
            particle.collision_group = params.collision_group;
            particle.spawn_frame = frame;
            particles.add(particle)
        })
        .collect();

    for &id in &ids {
        clusters.set_damage_thresholds(id, &params.damage_thresholds);
    }

    let mut cluster_bones: Vec<(usize, usize)> = (0..rest.len())
        .map(|b| (rest.height(b), b))
        .filter(|(h, _)| *h > 0)
        .collect();
    cluster_bones.sort_unstable();

    for (_, bone) in cluster_bones {
        let children: Vec<ParticleId> = rest.children(bone).into_iter().map(|c| ids[c]).collect();
        let cluster_params = ClusterCreationParameters {
            connection_method: params.connection_method,
            group_index: 0,
            damage_thresholds: params.damage_thresholds.clone(),
            object_state: rest.bones[bone].object_state,
            parent: Some(ids[bone]),
            internal: false,
        };
        if clusters
            .create_cluster_particle(particles, &children, &cluster_params)
            .is_none()
        {
            log::warn!("collection bone {bone} left unclustered");
            particles[ids[bone]].disabled = true;
        }
    }

    let roots: Vec<ParticleId> = rest.roots().into_iter().map(|b| ids[b]).collect();
    if params.cluster_group_index != 0 {
        for &root in &roots {
            clusters.set_group_index(root, params.cluster_group_index);
        }
    }

    log::info!(
        "registered collection: {} particles, {} roots at frame {frame}",
        ids.len(),
        roots.len()
    );
    CollectionHandle { particles: ids, roots }
}

/// Detaches the collection from any union, dissolves its clusters without freeing the
/// pieces and disables every particle it owns.
pub fn unregister_collection(
    particles: &mut ParticleStore,
    clusters: &mut ClusterManager,
    handle: &CollectionHandle,
) {
    let owned: FxHashSet<ParticleId> = handle.particles.iter().copied().collect();
    let in_union: Vec<ParticleId> = handle
        .particles
        .iter()
        .copied()
        .filter(|id| {
            clusters
                .parent(*id)
                .map(|p| clusters.is_internal(p) && !owned.contains(&p))
                .unwrap_or(false)
        })
        .collect();
    if !in_union.is_empty() {
        clusters.release_cluster_particles(particles, &in_union);
    }

    for &id in handle.particles.iter().rev() {
        clusters.remove_cluster(id);
        clusters.set_group_index(id, 0);
        let particle = &mut particles[id];
        particle.disabled = true;
        particle.registered = false;
        particle.velocity = Vec3::ZERO;
        particle.angular_velocity = Vec3::ZERO;
    }
    log::info!("unregistered collection of {} particles", handle.particles.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusteringConfig;

    fn two_cubes() -> RestCollection {
        let mut rest = RestCollection::new();
        rest.add_cube(Vec3::new(-0.5, 10.0, 0.0), 1.0, 1.0);
        rest.add_cube(Vec3::new(0.5, 10.0, 0.0), 1.0, 1.0);
        rest.cluster_all_under_new_root();
        rest
    }

    // ========== Authoring Tests ==========

    #[test]
    fn test_cluster_all_under_new_root() {
        let rest = two_cubes();
        assert_eq!(rest.len(), 3);
        assert_eq!(rest.roots(), vec![2]);
        assert_eq!(rest.children(2), vec![0, 1]);
        assert!(rest.bones[2].transform.translation.abs_diff_eq(Vec3::new(0.0, 10.0, 0.0), 1.0e-6));
    }

    #[test]
    #[should_panic]
    fn test_add_cluster_rejects_parented_bone() {
        let mut rest = two_cubes();
        rest.add_cluster(&[0]);
    }

    // ========== Registration Tests ==========

    #[test]
    fn test_register_builds_cluster_from_bones() {
        let mut store = ParticleStore::new();
        let mut clusters = ClusterManager::new(&ClusteringConfig::default());
        let handle = register_collection(
            &mut store,
            &mut clusters,
            &two_cubes(),
            &CollectionParams::with_thresholds(&[0.1]),
            7,
        );

        assert_eq!(handle.particles, vec![ParticleId(0), ParticleId(1), ParticleId(2)]);
        assert_eq!(handle.roots, vec![ParticleId(2)]);
        assert_eq!(clusters.children(ParticleId(2)), &[ParticleId(0), ParticleId(1)]);
        assert!((store[ParticleId(2)].mass - 2.0).abs() < 1.0e-6);
        assert!(store[ParticleId(2)].is_enabled());
        assert!(!store[ParticleId(0)].is_enabled());
        assert_eq!(store[ParticleId(2)].spawn_frame, 7);
        assert!((clusters.damage_threshold(ParticleId(2)) - 0.1).abs() < 1.0e-6);
    }

    #[test]
    fn test_nested_bones_register_bottom_up() {
        let mut rest = RestCollection::new();
        for i in 0..4 {
            rest.add_cube(Vec3::new(i as f32, 0.5, 0.0), 1.0, 1.0);
        }
        let left = rest.add_cluster(&[0, 1]);
        let right = rest.add_cluster(&[2, 3]);
        let root = rest.add_cluster(&[left, right]);

        let mut store = ParticleStore::new();
        let mut clusters = ClusterManager::new(&ClusteringConfig::default());
        let handle = register_collection(&mut store, &mut clusters, &rest, &CollectionParams::default(), 0);

        assert_eq!(clusters.cluster_map().len(), 3);
        assert_eq!(clusters.parent(handle.particle(left)), Some(handle.particle(root)));
        assert_eq!(clusters.depth(handle.particle(0)), 2);
        assert!((store[handle.particle(root)].mass - 4.0).abs() < 1.0e-5);
    }

    #[test]
    fn test_unregister_disables_everything() {
        let mut store = ParticleStore::new();
        let mut clusters = ClusterManager::new(&ClusteringConfig::default());
        let handle = register_collection(
            &mut store,
            &mut clusters,
            &two_cubes(),
            &CollectionParams::default(),
            0,
        );
        unregister_collection(&mut store, &mut clusters, &handle);
        assert!(clusters.cluster_map().is_empty());
        assert_eq!(store.num_enabled(), 0);
        assert!(handle.particles.iter().all(|id| !store[*id].registered));
    }
}
