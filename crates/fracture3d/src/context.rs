//! Owner of solver ids. Create one per world (or per test) and pass it around.

use crate::config::SolverConfig;
use crate::solver::{Solver, SolverId};
use crate::threading::SolverHandle;
use std::collections::BTreeSet;

#[derive(Debug, Default)]
pub struct SolverContext {
    /// Configuration for solvers created without one
    pub defaults: SolverConfig,
    next_id: u32,
    live: BTreeSet<SolverId>,
}

impl SolverContext {
    pub fn new(defaults: SolverConfig) -> Self {
        Self {
            defaults,
            next_id: 0,
            live: BTreeSet::new(),
        }
    }

    pub fn create_solver(&mut self) -> Solver {
        self.create_solver_with(self.defaults.clone())
    }

    pub fn create_solver_with(&mut self, config: SolverConfig) -> Solver {
        let id = SolverId(self.next_id);
        self.next_id += 1;
        self.live.insert(id);
        Solver::with_id(id, config)
    }

    /// Starts `solver` in the threading mode of its configuration.
    pub fn spawn(&self, solver: Solver) -> SolverHandle {
        debug_assert!(
            self.live.contains(&solver.id()),
            "{} was not created by this context",
            solver.id()
        );
        SolverHandle::new(solver)
    }

    pub fn destroy_solver(&mut self, solver: Solver) -> bool {
        let removed = self.live.remove(&solver.id());
        if !removed {
            log::warn!("{} is not owned by this context", solver.id());
        }
        log::debug!("{} destroyed at frame {}", solver.id(), solver.frame());
        removed
    }

    pub fn num_solvers(&self) -> usize {
        self.live.len()
    }

    pub fn contains(&self, id: SolverId) -> bool {
        self.live.contains(&id)
    }
}
