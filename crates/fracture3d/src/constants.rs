//! Default tuning constants for the rigid-body clustering solver.
//!
//! Units are SI (metres, kilograms, seconds) with +Y up. Every value here is the
//! default for the matching `SolverConfig` field and can be overridden per solver.

/// Gravity acceleration (m/s^2) - negative Y direction
pub const GRAVITY: f32 = -9.81;

/// Default simulation tick (s)
pub const DEFAULT_DT: f32 = 1.0 / 60.0;

// =============================================================================
// CONTACT SOLVER
// =============================================================================

/// Coefficient of restitution for rigid contacts
pub const RESTITUTION: f32 = 0.1;

/// Coulomb friction coefficient
pub const FRICTION: f32 = 0.6;

/// Sequential impulse passes per step
pub const SOLVER_ITERATIONS: usize = 4;

/// Penetration allowed before positional correction kicks in (m)
pub const CONTACT_SLOP: f32 = 0.001;

/// Fraction of the remaining penetration removed per pass
pub const CORRECTION_PERCENT: f32 = 0.4;

/// Approach speed below which restitution is ignored (m/s)
pub const RESTITUTION_VELOCITY_THRESHOLD: f32 = 0.5;

// =============================================================================
// SLEEPING
// =============================================================================

/// Linear speed under which a body counts as resting (m/s)
pub const SLEEP_LINEAR_THRESHOLD: f32 = 0.05;

/// Angular speed under which a body counts as resting (rad/s)
pub const SLEEP_ANGULAR_THRESHOLD: f32 = 0.05;

/// Consecutive resting frames before a body is put to sleep
pub const FRAMES_TO_SLEEP: u32 = 30;

// =============================================================================
// CLUSTERING
// =============================================================================

/// Deepest hierarchy a cluster (or union) may create
pub const MAX_CLUSTER_LEVEL: usize = 100;

/// Collision impulses below this do not feed cluster strain (kg m/s).
/// Resting contact under gravity stays well below it for bodies of a few kilograms.
pub const MIN_IMPULSE_FOR_STRAIN_EVAL: f32 = 980.0 * 2.0 / 30.0 / 100.0;

/// Scale applied to collision impulses before they are added as strain
pub const COLLISION_STRAIN_FACTOR: f32 = 1.0;

/// Extra reach around a child's proxy sphere when attributing contact strain (m)
pub const CLUSTER_DISTANCE_THRESHOLD: f32 = 1.0;

/// Strain needed to break an internal union cluster as a whole
pub const UNION_DAMAGE_THRESHOLD: f32 = f32::MAX;

/// Gap under which two children are connected by `ConnectionMethod::PointImplicit` (m)
pub const CONNECTION_DISTANCE: f32 = 0.05;

// =============================================================================
// REWIND
// =============================================================================

/// Frames of history kept when rewind capture is enabled without a size
pub const DEFAULT_REWIND_CAPACITY: usize = 64;

/// Largest per-component difference still counted as in sync
pub const DESYNC_TOLERANCE: f32 = 1.0e-5;

// =============================================================================
// THREADING
// =============================================================================

/// Upper bound on internal steps taken for one external tick
pub const MAX_SUBSTEPS: usize = 4;
