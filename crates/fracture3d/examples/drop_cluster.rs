//! Drop Cluster - a nested block wall falls, shatters, and is replayed
//!
//! Builds a 2x2 wall of cubes (two clustered columns under one root), drops it on
//! the floor from a dedicated physics thread, then rewinds and resimulates the
//! last frames with a sideways nudge to show which pieces desync.
//!
//! Run with: RUST_LOG=info cargo run --example drop_cluster --release

use fracture3d::{
    CollectionParams, RestCollection, SolverConfig, SolverContext, SolverHandle, ThreadingMode,
};
use glam::Vec3;
use std::sync::{Arc, Mutex};

const DT: f32 = 1.0 / 60.0;
const DROP_HEIGHT: f32 = 6.0;
const FRAMES: usize = 180;
const REWIND_BACK: u64 = 20;

fn wall() -> RestCollection {
    let mut rest = RestCollection::new();
    let mut columns = Vec::new();
    for x in 0..2 {
        let bottom = rest.add_cube(Vec3::new(x as f32, DROP_HEIGHT, 0.0), 1.0, 1.0);
        let top = rest.add_cube(Vec3::new(x as f32, DROP_HEIGHT + 1.0, 0.0), 1.0, 1.0);
        columns.push(rest.add_cluster(&[bottom, top]));
    }
    rest.add_cluster(&columns);
    rest
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut context = SolverContext::new(
        SolverConfig::default()
            .with_threading(ThreadingMode::DedicatedThread)
            .with_rewind(64, true),
    );
    let mut solver = context.create_solver();
    let handle = solver.register_collection(&wall(), &CollectionParams::with_thresholds(&[0.5, 4.0]));

    let breaks = Arc::new(Mutex::new(Vec::new()));
    let sink = breaks.clone();
    solver
        .events_mut()
        .register_breaking_handler(Box::new(move |events| {
            if let Ok(mut log) = sink.lock() {
                log.extend(events.iter().map(|e| (e.frame, e.parent, e.particle)));
            }
        }));

    let mut physics = context.spawn(solver);
    run(&mut physics);

    let results = physics.results();
    log::info!(
        "frame {}: {} active bodies, {} clusters left",
        results.frame,
        results.num_active,
        results.cluster_map.len()
    );
    if let Ok(log) = breaks.lock() {
        for (frame, parent, piece) in log.iter() {
            log::info!("  frame {frame}: {parent} released {piece}");
        }
    }

    let nudged = handle.particle(0);
    let rewind_frame = results.frame.saturating_sub(REWIND_BACK);
    match physics.resimulate(rewind_frame, move |store| {
        if store.contains(nudged) && store[nudged].is_enabled() {
            store[nudged].velocity.x += 2.0;
        }
    }) {
        Some(report) => log::info!(
            "resimulated {} frames from {}: {} hard desynced {:?}",
            report.frames,
            report.rewind_frame,
            report.hard_desynced.len(),
            report.hard_desynced
        ),
        None => log::warn!("frame {rewind_frame} is no longer rewindable"),
    }

    let solver = physics.shutdown();
    for (id, particle) in solver.particles().iter().filter(|(_, p)| p.is_enabled()) {
        log::info!(
            "  {id}: pos ({:.2}, {:.2}, {:.2})",
            particle.position.x,
            particle.position.y,
            particle.position.z
        );
    }
    context.destroy_solver(solver);
}

fn run(physics: &mut SolverHandle) {
    for _ in 0..FRAMES {
        physics.advance(DT);
    }
    physics.sync();
}
