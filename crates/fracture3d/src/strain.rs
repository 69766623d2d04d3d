//! Strain accumulation and threshold evaluation for cluster parents.
//!
//! Strain lives on `Particle::strain` and only for the duration of one step: contacts
//! and strain fields add to it, `evaluate` turns it into a `BreakPlan`, and `reset`
//! clears it again before the next step.

use crate::cluster::ClusterManager;
use crate::config::ClusteringConfig;
use crate::evolution::Contact;
use crate::particle::{ParticleId, ParticleStore};

/// Breaks decided for one step.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BreakPlan {
    /// Clusters that dissolve entirely, closed under ancestry
    pub fractured: Vec<ParticleId>,
    /// Union members to detach from their internal parent
    pub releases: Vec<ParticleId>,
}

impl BreakPlan {
    pub fn is_empty(&self) -> bool {
        self.fractured.is_empty() && self.releases.is_empty()
    }
}

/// Outcome of executing a plan: every parent that lost children and what it lost.
pub type Detachment = (ParticleId, Vec<ParticleId>);

#[derive(Clone, Debug, PartialEq)]
pub struct StrainModel {
    pub collision_strain_factor: f32,
    pub min_impulse_for_strain_eval: f32,
    pub cluster_distance_threshold: f32,
}

impl StrainModel {
    pub fn from_config(config: &ClusteringConfig) -> Self {
        Self {
            collision_strain_factor: config.collision_strain_factor,
            min_impulse_for_strain_eval: config.min_impulse_for_strain_eval,
            cluster_distance_threshold: config.cluster_distance_threshold,
        }
    }

    /// Spreads contact impulses over the children of the clusters they hit.
    ///
    /// Every direct child whose proxy sphere reaches within
    /// `cluster_distance_threshold` of the contact point receives the scaled impulse.
    /// Returns how many child strains were raised.
    pub fn accumulate_collision_strain(
        &self,
        particles: &mut ParticleStore,
        clusters: &ClusterManager,
        contacts: &[Contact],
    ) -> usize {
        let mut strained = 0;
        for contact in contacts {
            if contact.impulse < self.min_impulse_for_strain_eval {
                continue;
            }
            let amount = contact.impulse * self.collision_strain_factor;
            for body in std::iter::once(contact.particle).chain(contact.other) {
                if !clusters.is_cluster(body) || !particles[body].is_enabled() {
                    continue;
                }
                let world = particles[body].transform();
                for &child in clusters.children(body) {
                    let Some(local) = clusters.child_to_parent(child) else {
                        continue;
                    };
                    let center = (world * local).translation;
                    let reach = particles[child].bounding_radius() + self.cluster_distance_threshold;
                    if center.distance_squared(contact.point) <= reach * reach {
                        particles[child].strain += amount;
                        strained += 1;
                    }
                }
            }
        }
        strained
    }

    /// Compares the accumulated strain against each cluster's damage threshold.
    pub fn evaluate(&self, particles: &ParticleStore, clusters: &ClusterManager) -> BreakPlan {
        let mut plan = BreakPlan::default();
        for (&parent, children) in clusters.cluster_map() {
            if clusters.parent(parent).is_some() || !particles[parent].is_enabled() {
                continue;
            }
            if clusters.is_internal(parent) {
                if own_strain_breaks(particles, clusters, parent) {
                    plan.fractured.push(parent);
                    collect_nested(particles, clusters, parent, &mut plan.fractured);
                    continue;
                }
                plan.releases.extend(
                    children
                        .iter()
                        .copied()
                        .filter(|c| own_strain_breaks(particles, clusters, *c)),
                );
            } else if exceeds(particles, clusters, parent) {
                plan.fractured.push(parent);
                collect_nested(particles, clusters, parent, &mut plan.fractured);
            }
        }
        if !plan.is_empty() {
            log::debug!(
                "strain: {} fractures, {} union releases",
                plan.fractured.len(),
                plan.releases.len()
            );
        }
        plan
    }

    /// Applies `plan`: union releases first, then fractures innermost first.
    pub fn execute(
        &self,
        plan: &BreakPlan,
        particles: &mut ParticleStore,
        clusters: &mut ClusterManager,
    ) -> Vec<Detachment> {
        let mut detached = Vec::new();
        let mut by_union: Vec<(ParticleId, Vec<ParticleId>)> = Vec::new();
        for &member in &plan.releases {
            let Some(union) = clusters.parent(member) else {
                continue;
            };
            match by_union.iter_mut().find(|(u, _)| *u == union) {
                Some((_, members)) => members.push(member),
                None => by_union.push((union, vec![member])),
            }
        }
        for (union, members) in by_union {
            let activated = clusters.release_cluster_particles(particles, &members);
            if !activated.is_empty() {
                detached.push((union, activated));
            }
        }
        detached.extend(clusters.fracture(particles, &plan.fractured));
        detached
    }

    pub fn reset(particles: &mut ParticleStore) {
        for particle in &mut particles.list {
            particle.strain = 0.0;
        }
    }
}

/// A node breaks when it, or any of its direct children, carries enough strain.
fn exceeds(particles: &ParticleStore, clusters: &ClusterManager, id: ParticleId) -> bool {
    let strain = clusters
        .children(id)
        .iter()
        .map(|c| particles[*c].strain)
        .fold(particles[id].strain, f32::max);
    strain > 0.0 && strain >= clusters.damage_threshold(id)
}

fn own_strain_breaks(particles: &ParticleStore, clusters: &ClusterManager, id: ParticleId) -> bool {
    let strain = particles[id].strain;
    strain > 0.0 && strain >= clusters.damage_threshold(id)
}

fn collect_nested(
    particles: &ParticleStore,
    clusters: &ClusterManager,
    id: ParticleId,
    out: &mut Vec<ParticleId>,
) {
    for &child in clusters.children(id) {
        if clusters.is_cluster(child) && exceeds(particles, clusters, child) {
            out.push(child);
            collect_nested(particles, clusters, child, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterCreationParameters;
    use crate::geometry::Geometry;
    use crate::particle::Particle;
    use glam::Vec3;
    use std::sync::Arc;

    fn cube(store: &mut ParticleStore, x: f32) -> ParticleId {
        store.add(Particle::new(
            Vec3::new(x, 0.5, 0.0),
            Some(Arc::new(Geometry::cube(1.0))),
            1.0,
        ))
    }

    fn setup() -> (ParticleStore, ClusterManager, StrainModel) {
        let config = ClusteringConfig::default();
        (
            ParticleStore::new(),
            ClusterManager::new(&config),
            StrainModel::from_config(&config),
        )
    }

    fn contact(particle: ParticleId, point: Vec3, impulse: f32) -> Contact {
        Contact {
            particle,
            other: None,
            point,
            normal: -Vec3::Y,
            impulse,
        }
    }

    // ========== Collision Strain Tests ==========

    #[test]
    fn test_small_impulse_adds_no_strain() {
        let (mut store, mut clusters, model) = setup();
        let a = cube(&mut store, 0.0);
        let b = cube(&mut store, 1.0);
        let root = clusters
            .create_cluster_particle(&mut store, &[a, b], &ClusterCreationParameters::with_thresholds(&[0.1]))
            .unwrap();
        let strained =
            model.accumulate_collision_strain(&mut store, &clusters, &[contact(root, Vec3::ZERO, 0.01)]);
        assert_eq!(strained, 0);
        assert_eq!(store[a].strain, 0.0);
    }

    #[test]
    fn test_impulse_reaches_only_nearby_children() {
        let (mut store, mut clusters, mut model) = setup();
        model.cluster_distance_threshold = 0.1;
        let a = cube(&mut store, 0.0);
        let b = cube(&mut store, 1.0);
        let far = cube(&mut store, 6.0);
        let root = clusters
            .create_cluster_particle(&mut store, &[a, b, far], &ClusterCreationParameters::default())
            .unwrap();
        model.accumulate_collision_strain(&mut store, &clusters, &[contact(root, Vec3::new(0.5, 0.0, 0.0), 5.0)]);
        assert_eq!(store[a].strain, 5.0);
        assert_eq!(store[b].strain, 5.0);
        assert_eq!(store[far].strain, 0.0);
    }

    // ========== Evaluation Tests ==========

    #[test]
    fn test_exceeding_children_break_parent_once() {
        let (mut store, mut clusters, model) = setup();
        let a = cube(&mut store, 0.0);
        let b = cube(&mut store, 1.0);
        let root = clusters
            .create_cluster_particle(&mut store, &[a, b], &ClusterCreationParameters::with_thresholds(&[1.0]))
            .unwrap();
        store[a].strain = 2.0;
        store[b].strain = 3.0;
        let plan = model.evaluate(&store, &clusters);
        assert_eq!(plan.fractured, vec![root]);
        assert!(plan.releases.is_empty());
    }

    #[test]
    fn test_below_threshold_keeps_cluster() {
        let (mut store, mut clusters, model) = setup();
        let a = cube(&mut store, 0.0);
        let b = cube(&mut store, 1.0);
        clusters
            .create_cluster_particle(&mut store, &[a, b], &ClusterCreationParameters::with_thresholds(&[10.0]))
            .unwrap();
        store[a].strain = 2.0;
        assert!(model.evaluate(&store, &clusters).is_empty());
    }

    #[test]
    fn test_no_profile_never_breaks() {
        let (mut store, mut clusters, model) = setup();
        let a = cube(&mut store, 0.0);
        let b = cube(&mut store, 1.0);
        clusters
            .create_cluster_particle(&mut store, &[a, b], &ClusterCreationParameters::default())
            .unwrap();
        store[a].strain = 1.0e6;
        assert!(model.evaluate(&store, &clusters).is_empty());
    }

    #[test]
    fn test_nested_break_is_bottom_up() {
        let (mut store, mut clusters, model) = setup();
        let leaves: Vec<ParticleId> = (0..4).map(|i| cube(&mut store, i as f32)).collect();
        let params = ClusterCreationParameters::with_thresholds(&[1.0, 1.0]);
        let left = clusters.create_cluster_particle(&mut store, &leaves[0..2], &params).unwrap();
        let right = clusters.create_cluster_particle(&mut store, &leaves[2..4], &params).unwrap();
        let root = clusters.create_cluster_particle(&mut store, &[left, right], &params).unwrap();

        store[left].strain = 5.0;
        let plan = model.evaluate(&store, &clusters);
        assert_eq!(plan.fractured, vec![root, left]);

        let detached = model.execute(&plan, &mut store, &mut clusters);
        assert_eq!(detached[0].0, left);
        assert_eq!(detached[1].0, root);
        assert!(clusters.is_cluster(right));
        assert!(store[right].is_enabled());
        assert!(store[leaves[0]].is_enabled());
        assert!(!store[leaves[2]].is_enabled());
    }

    #[test]
    fn test_union_releases_only_exceeding_member() {
        let (mut store, mut clusters, model) = setup();
        let params = ClusterCreationParameters::with_thresholds(&[1.0]);
        let a = cube(&mut store, 0.0);
        let b = cube(&mut store, 1.0);
        let c = cube(&mut store, 2.0);
        let d = cube(&mut store, 3.0);
        let left = clusters.create_cluster_particle(&mut store, &[a, b], &params).unwrap();
        let right = clusters.create_cluster_particle(&mut store, &[c, d], &params).unwrap();
        let union = clusters
            .create_cluster_particle(
                &mut store,
                &[left, right],
                &ClusterCreationParameters {
                    internal: true,
                    damage_thresholds: vec![f32::MAX],
                    ..ClusterCreationParameters::default()
                },
            )
            .unwrap();

        store[left].strain = 2.0;
        let plan = model.evaluate(&store, &clusters);
        assert!(plan.fractured.is_empty());
        assert_eq!(plan.releases, vec![left]);

        let detached = model.execute(&plan, &mut store, &mut clusters);
        assert_eq!(detached, vec![(union, vec![left])]);
        assert!(clusters.is_cluster(left));
        assert_eq!(clusters.children(union), &[right]);
    }

    #[test]
    fn test_reset_clears_strain() {
        let (mut store, _, _) = setup();
        let a = cube(&mut store, 0.0);
        store[a].strain = 4.0;
        StrainModel::reset(&mut store);
        assert_eq!(store[a].strain, 0.0);
    }
}
