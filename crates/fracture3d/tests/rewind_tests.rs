//! Integration tests for rewind capture and resimulation.
//!
//! Tests cover:
//! - History retention limits and refusals
//! - Bit-exact determinism of an uncorrected resimulation
//! - Slave particles replaying their recording
//! - Hard and soft desync classification around a correction
//! - Future state queries and input replacement

use fracture3d::{
    DesyncState, FutureState, Geometry, ObjectState, Particle, ParticleId, PhysicsThreadScope,
    ResimPhase, ResimType, Solver, SolverCommand, SolverConfig,
};
use glam::{Quat, Vec3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

const DT: f32 = 1.0 / 60.0;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn sphere(position: Vec3) -> Particle {
    Particle::new(position, Some(Arc::new(Geometry::sphere(0.5))), 1.0)
}

fn cube(position: Vec3) -> Particle {
    Particle::new(position, Some(Arc::new(Geometry::cube(1.0))), 1.0)
}

/// No gravity, no floor and no sleeping: bodies only move when pushed.
fn drifting(capacity: usize) -> SolverConfig {
    let mut config = SolverConfig {
        gravity: Vec3::ZERO,
        floor_height: None,
        ..SolverConfig::default()
    }
    .with_rewind(capacity, true);
    config.sleep.enabled = false;
    config
}

fn run(solver: &mut Solver, steps: usize) {
    for _ in 0..steps {
        solver.step(DT);
    }
}

fn poses(solver: &Solver) -> Vec<(Vec3, Quat, Vec3)> {
    solver
        .particles()
        .iter()
        .map(|(_, p)| (p.position, p.rotation, p.velocity))
        .collect()
}

// =============================================================================
// HISTORY LIMITS
// =============================================================================

#[test]
fn test_history_keeps_capacity_frames() {
    init_logging();
    let _scope = PhysicsThreadScope::enter();
    let capacity = 8;
    let mut solver = Solver::new(SolverConfig::default());
    let id = solver.register_particle(sphere(Vec3::new(0.0, 20.0, 0.0)));
    solver.enable_rewind_capture(capacity, true);
    run(&mut solver, capacity + 10);

    let head = solver.frame();
    let rewind = solver.rewind_data().expect("capture on");
    assert_eq!(rewind.head(), head);
    assert_eq!(rewind.oldest_frame(), head + 1 - capacity as u64);
    assert!(solver.past_state_at_frame(id, head - capacity as u64).is_none());
    assert!(solver.past_state_at_frame(id, head + 1 - capacity as u64).is_some());

    assert!(!solver.rewind_to_frame(head - capacity as u64));
    assert_eq!(solver.frame(), head);
    assert!(solver.rewind_to_frame(head + 1 - capacity as u64));
    assert_eq!(solver.frame(), head + 1 - capacity as u64);
}

#[test]
fn test_rewind_refused_before_registration() {
    init_logging();
    let _scope = PhysicsThreadScope::enter();
    let mut solver = Solver::new(SolverConfig::default().with_rewind(32, true));
    solver.register_particle(sphere(Vec3::new(0.0, 20.0, 0.0)));
    run(&mut solver, 3);
    let late = solver.register_particle(sphere(Vec3::new(3.0, 20.0, 0.0)));
    run(&mut solver, 2);

    assert!(!solver.rewind_to_frame(2));
    assert!(!solver.rewind_to_frame(3));
    assert_eq!(solver.frame(), 5);
    assert!(solver.rewind_to_frame(4));
    assert!(solver.particles().contains(late));
    solver.complete_resim();
    assert_eq!(solver.frame(), 5);
}

#[test]
fn test_untouched_particles_are_not_dirty() {
    init_logging();
    let mut solver = Solver::new(SolverConfig::default());
    let falling = solver.register_particle(sphere(Vec3::new(0.0, 20.0, 0.0)));
    solver.register_particle(sphere(Vec3::new(5.0, 5.0, 0.0)).with_object_state(ObjectState::Static));
    solver.enable_rewind_capture(4, true);
    run(&mut solver, 10);

    let rewind = solver.rewind_data().expect("capture on");
    assert_eq!(rewind.num_dirty_particles(), 1);
    assert_eq!(rewind.dirty_particles(solver.frame()), vec![falling]);
}

#[test]
#[should_panic(expected = "outside a PhysicsThreadScope")]
fn test_rewind_outside_scope_panics() {
    let mut solver = Solver::new(SolverConfig::default().with_rewind(8, true));
    solver.step(DT);
    solver.rewind_to_frame(0);
}

// =============================================================================
// DETERMINISM
// =============================================================================

#[test]
fn test_uncorrected_resim_is_bit_exact() {
    init_logging();
    let _scope = PhysicsThreadScope::enter();
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let mut solver = Solver::new(SolverConfig::default().with_rewind(64, true));
    for _ in 0..8 {
        let position = Vec3::new(
            rng.gen_range(-3.0..3.0),
            rng.gen_range(1.0..6.0),
            rng.gen_range(-3.0..3.0),
        );
        let velocity = Vec3::new(
            rng.gen_range(-2.0..2.0),
            rng.gen_range(-2.0..2.0),
            rng.gen_range(-2.0..2.0),
        );
        let spin = Vec3::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0), 0.0);
        solver.register_particle(cube(position).with_velocity(velocity).with_angular_velocity(spin));
    }
    run(&mut solver, 40);
    let recorded = poses(&solver);

    assert!(solver.rewind_to_frame(10));
    let report = solver.complete_resim();
    assert_eq!(report.frames, 30);
    assert_eq!(solver.frame(), 40);
    assert!(report.hard_desynced.is_empty(), "{:?}", report.hard_desynced);
    assert_eq!(poses(&solver), recorded);
}

#[test]
fn test_resimulate_from_matches_stepwise_rewind() {
    init_logging();
    let _scope = PhysicsThreadScope::enter();
    let mut solver = Solver::new(SolverConfig::default().with_rewind(32, true));
    let id = solver.register_particle(cube(Vec3::new(0.0, 3.0, 0.0)));
    run(&mut solver, 20);
    let recorded = solver.particle(id).position;

    let report = solver.resimulate_from(5, |_| {}).expect("rewindable");
    assert_eq!(report.rewind_frame, 5);
    assert_eq!(report.head, 20);
    assert_eq!(solver.particle(id).position, recorded);
    assert!(solver.resimulate_from(100, |_| {}).is_none());
}

// =============================================================================
// SLAVES
// =============================================================================

#[test]
fn test_slave_replays_recorded_trajectory() {
    init_logging();
    let _scope = PhysicsThreadScope::enter();
    let mut solver = Solver::new(SolverConfig::default().with_rewind(32, true));
    let master = solver.register_particle(sphere(Vec3::new(-5.0, 5.0, 0.0)));
    let slave = solver.register_particle(sphere(Vec3::new(5.0, 5.0, 0.0)));
    run(&mut solver, 20);
    let slave_head = solver.particle(slave).clone();
    let master_head = solver.particle(master).position;

    assert!(solver.rewind_to_frame(5));
    solver.set_resim_type(slave, ResimType::ResimAsSlave);
    solver.correct(|store| {
        store[master].velocity.x += 3.0;
        store[slave].velocity.x += 3.0;
    });
    solver.complete_resim();

    let replayed = solver.particle(slave);
    assert_eq!(replayed.position, slave_head.position);
    assert_eq!(replayed.velocity, slave_head.velocity);
    assert!(solver.particle(master).position.x > master_head.x + 0.5);
    assert_eq!(solver.desync_state(slave), DesyncState::InSync);
    assert_eq!(solver.desync_state(master), DesyncState::HardDesync);
    assert_eq!(solver.resim_type(slave), ResimType::ResimAsSlave);
}

#[test]
fn test_slave_holds_trajectory_when_corrected_sibling_hits_it() {
    init_logging();
    let _scope = PhysicsThreadScope::enter();
    let mut solver = Solver::new(drifting(64));
    let master = solver.register_particle(sphere(Vec3::new(-3.0, 0.0, 0.0)));
    let slave = solver.register_particle(sphere(Vec3::ZERO));
    run(&mut solver, 60);
    let slave_head = solver.particle(slave).clone();

    // The recorded run never touches; the corrected master now reaches the slave.
    assert!(solver.rewind_to_frame(1));
    solver.set_resim_type(slave, ResimType::ResimAsSlave);
    solver.correct(|store| store[master].velocity = Vec3::new(6.0, 0.0, 0.0));
    let report = solver.complete_resim();

    let replayed = solver.particle(slave);
    assert_eq!(replayed.position, slave_head.position);
    assert_eq!(replayed.velocity, slave_head.velocity);
    assert_eq!(solver.desync_state(slave), DesyncState::InSync);
    assert!(!report.hard_desynced.contains(&slave));

    let bounced = solver.particle(master);
    assert!(bounced.velocity.x < 0.0, "master = {:?}", bounced.velocity);
    assert!(bounced.position.x < 0.0);
    assert_eq!(solver.desync_state(master), DesyncState::HardDesync);
}

// =============================================================================
// DESYNC CLASSIFICATION
// =============================================================================

#[test]
fn test_struck_neighbour_is_soft_desynced() {
    init_logging();
    let _scope = PhysicsThreadScope::enter();
    let mut solver = Solver::new(drifting(64));
    let striker = solver.register_particle(sphere(Vec3::new(-3.0, 0.0, 0.0)));
    let target = solver.register_particle(sphere(Vec3::ZERO));
    let bystander = solver.register_particle(sphere(Vec3::new(0.0, 0.0, 10.0)));
    run(&mut solver, 60);
    let bystander_head = solver.particle(bystander).position;

    assert!(solver.rewind_to_frame(1));
    solver.correct(|store| store[striker].velocity = Vec3::new(6.0, 0.0, 0.0));
    let report = solver.complete_resim();

    let first_seen = report
        .per_frame
        .iter()
        .find_map(|f| f.states.get(&target).copied())
        .expect("target never desynced");
    assert_eq!(first_seen, DesyncState::SoftDesync);
    assert_ne!(solver.desync_state(target), DesyncState::InSync);
    assert_eq!(solver.desync_state(striker), DesyncState::HardDesync);
    assert_eq!(solver.desync_state(bystander), DesyncState::InSync);
    assert!(!report.hard_desynced.contains(&bystander));
    assert_eq!(solver.particle(bystander).position, bystander_head);
    assert!(solver.particle(target).velocity.x > 0.5);
}

#[test]
fn test_future_state_reports_desynced_particles() {
    init_logging();
    let _scope = PhysicsThreadScope::enter();
    let mut solver = Solver::new(drifting(64));
    let moved = solver.register_particle(sphere(Vec3::new(-3.0, 0.0, 0.0)));
    let still = solver.register_particle(sphere(Vec3::new(0.0, 0.0, 10.0)));
    solver.enqueue_at(2, SolverCommand::SetLinearVelocity(still, Vec3::Y));
    run(&mut solver, 12);
    let still_at_ten = solver.past_state_at_frame(still, 10).expect("recorded").clone();

    assert!(solver.rewind_to_frame(4));
    assert_eq!(solver.resim_phase(), ResimPhase::RewoundPendingCorrection);
    solver.correct(|store| store[moved].velocity = Vec3::X);

    assert_eq!(solver.future_state_at_frame(moved, 10), Some(FutureState::Desynced));
    assert_eq!(solver.future_state_at_frame(still, 10), Some(FutureState::Valid(still_at_ten)));
    assert_eq!(solver.future_state_at_frame(still, 4), None);
    assert_eq!(solver.future_state_at_frame(still, 40), None);
    solver.complete_resim();
    assert_eq!(solver.resim_phase(), ResimPhase::Idle);
}

#[test]
fn test_replaced_inputs_change_the_outcome() {
    init_logging();
    let _scope = PhysicsThreadScope::enter();
    let mut solver = Solver::new(drifting(64));
    let id = solver.register_particle(sphere(Vec3::ZERO));
    solver.enqueue_at(3, SolverCommand::SetLinearVelocity(id, Vec3::new(2.0, 0.0, 0.0)));
    run(&mut solver, 10);
    assert!(solver.particle(id).position.x > 0.1);
    assert_eq!(
        solver.rewind_data().and_then(|r| r.inputs_for_frame(3)).map(<[_]>::len),
        Some(1)
    );

    assert!(solver.rewind_to_frame(2));
    assert!(solver.replace_frame_inputs(3, Vec::new()));
    assert!(!solver.replace_frame_inputs(10, Vec::new()));
    let report = solver.complete_resim();

    assert_eq!(solver.particle(id).position, Vec3::ZERO);
    assert!(report.hard_desynced.contains(&id));
    assert_eq!(solver.desync_state(ParticleId(0)), DesyncState::HardDesync);
}
