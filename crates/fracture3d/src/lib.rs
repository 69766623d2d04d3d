//! Hierarchical rigid-body clustering with strain fracture
//!
//! Rigid particles are grouped into clusters: a parent particle that owns disabled
//! children and moves as one body. Collision impulses and strain fields load the
//! children; once the strain reaches a cluster's damage threshold the cluster breaks
//! and its children continue as independent bodies (or smaller clusters). Every step can
//! be recorded so the world can be rewound a few frames, corrected and resimulated
//! deterministically.
//!
//! # Example
//!
//! ```
//! use fracture3d::{CollectionParams, RestCollection, Solver, SolverConfig};
//! use glam::Vec3;
//!
//! let mut solver = Solver::new(SolverConfig::default());
//!
//! // Two unit cubes held together, breaking at the first real impact
//! let mut rest = RestCollection::new();
//! rest.add_cube(Vec3::new(-0.5, 10.0, 0.0), 1.0, 1.0);
//! rest.add_cube(Vec3::new(0.5, 10.0, 0.0), 1.0, 1.0);
//! rest.cluster_all_under_new_root();
//! solver.register_collection(&rest, &CollectionParams::with_thresholds(&[0.1]));
//!
//! for _ in 0..120 {
//!     solver.step(1.0 / 60.0);
//! }
//! assert!(solver.clusters().cluster_map().is_empty());
//! ```

pub mod cluster;
pub mod collection;
pub mod commands;
pub mod config;
pub mod constants;
pub mod context;
pub mod events;
pub mod evolution;
pub mod field;
pub mod geometry;
pub mod islands;
pub mod mass_properties;
pub mod particle;
pub mod resim;
pub mod rewind;
pub mod scope;
pub mod serde_utils;
pub mod solver;
pub mod strain;
pub mod threading;

pub use cluster::{ClusterCreationParameters, ClusterManager, ConnectionMethod};
pub use collection::{Bone, CollectionHandle, CollectionParams, RestCollection};
pub use commands::{CommandQueue, SolverCommand};
pub use config::{
    ClusteringConfig, RewindConfig, SleepConfig, SolverConfig, ThreadingConfig, ThreadingMode,
};
pub use context::SolverContext;
pub use events::{BreakingEvent, CollisionEvent, EventFilter, EventManager, HandlerId};
pub use evolution::{ConstraintSolver, Contact, ImpulseSolver, SolveView};
pub use field::{
    Falloff, FieldCommand, FieldNode, FieldTarget, FieldValue, ProcessingResolution,
    SetMaskCondition,
};
pub use geometry::{Geometry, RigidTransform};
pub use glam::{Mat3, Quat, Vec3};
pub use islands::IslandGraph;
pub use particle::{ObjectState, Particle, ParticleId, ParticleStore};
pub use resim::{DesyncState, FutureState, ResimPhase, ResimReport, ResimType};
pub use rewind::{HistoryWindow, RewindData};
pub use scope::PhysicsThreadScope;
pub use solver::{Solver, SolverId};
pub use strain::{BreakPlan, StrainModel};
pub use threading::{ParticleView, SolverHandle, SolverResults, StepPlanner};
