//! Contact islands: groups of simulated bodies connected through contacts.

use crate::particle::{ObjectState, ParticleId, ParticleStore};
use std::collections::BTreeMap;

/// One contact pair handed to the island builder.
pub type ContactPair = (ParticleId, Option<ParticleId>);

#[derive(Clone, Debug, Default)]
pub struct IslandGraph {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl IslandGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }

    /// Rebuilds islands from this step's contacts.
    ///
    /// Static and kinematic bodies do not join islands. Ids in `forced` join regardless
    /// of their state.
    pub fn rebuild(&mut self, particles: &ParticleStore, contacts: &[ContactPair], forced: &[ParticleId]) {
        let n = particles.len();
        self.parent.clear();
        self.parent.extend(0..n);
        self.rank.clear();
        self.rank.resize(n, 0);

        let joins = |id: ParticleId| {
            forced.contains(&id)
                || matches!(
                    particles[id].object_state,
                    ObjectState::Dynamic | ObjectState::Sleeping
                )
        };
        for &(a, b) in contacts {
            let Some(b) = b else { continue };
            if a.index() < n && b.index() < n && joins(a) && joins(b) {
                self.union(a.index(), b.index());
            }
        }
    }

    /// Representative of the island holding `id`.
    pub fn island_of(&mut self, id: ParticleId) -> Option<usize> {
        (id.index() < self.parent.len()).then(|| self.find(id.index()))
    }

    pub fn same_island(&mut self, a: ParticleId, b: ParticleId) -> bool {
        match (self.island_of(a), self.island_of(b)) {
            (Some(ra), Some(rb)) => ra == rb,
            _ => false,
        }
    }

    /// Islands with more than one member, each sorted by id.
    pub fn islands(&mut self) -> Vec<Vec<ParticleId>> {
        let mut groups: BTreeMap<usize, Vec<ParticleId>> = BTreeMap::new();
        for i in 0..self.parent.len() {
            let root = self.find(i);
            groups.entry(root).or_default().push(ParticleId::from_index(i));
        }
        groups.into_values().filter(|g| g.len() > 1).collect()
    }
}
