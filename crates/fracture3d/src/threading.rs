//! Running a solver inline, on its own thread, or as jobs on the rayon pool.
//!
//! Producers talk to the solver only through a `SolverHandle`: commands and ticks go in,
//! snapshots come out through an `ArcSwap` that the physics side flips after each
//! step.

use crate::commands::SolverCommand;
use crate::config::{ThreadingConfig, ThreadingMode};
use crate::particle::{ObjectState, Particle, ParticleId, ParticleStore};
use crate::resim::ResimReport;
use crate::scope::PhysicsThreadScope;
use crate::solver::{Solver, SolverId};
use arc_swap::ArcSwap;
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

// =============================================================================
// RESULTS
// =============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticleView {
    pub id: ParticleId,
    #[serde(with = "crate::serde_utils::vec3")]
    pub position: Vec3,
    #[serde(with = "crate::serde_utils::quat")]
    pub rotation: Quat,
    #[serde(with = "crate::serde_utils::vec3")]
    pub velocity: Vec3,
    #[serde(with = "crate::serde_utils::vec3")]
    pub angular_velocity: Vec3,
    pub object_state: ObjectState,
    pub disabled: bool,
    pub mass: f32,
}

impl ParticleView {
    pub fn of(id: ParticleId, particle: &Particle) -> Self {
        Self {
            id,
            position: particle.position,
            rotation: particle.rotation,
            velocity: particle.velocity,
            angular_velocity: particle.angular_velocity,
            object_state: particle.object_state,
            disabled: particle.disabled,
            mass: particle.mass,
        }
    }
}

/// Read-only copy of a solver's state after a step.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SolverResults {
    pub solver: SolverId,
    pub frame: u64,
    pub time: f64,
    pub particles: Vec<ParticleView>,
    pub cluster_map: BTreeMap<ParticleId, Vec<ParticleId>>,
    pub num_active: usize,
}

impl SolverResults {
    pub fn particle(&self, id: ParticleId) -> Option<&ParticleView> {
        self.particles
            .binary_search_by_key(&id, |p| p.id)
            .ok()
            .map(|i| &self.particles[i])
    }
}

fn send(id: SolverId, sender: &mpsc::Sender<Message>, message: Message) {
    if sender.send(message).is_err() {
        panic!("{id}: physics thread has exited");
    }
}

fn publish(results: &ArcSwap<SolverResults>, solver: &Solver) {
    results.store(Arc::new(solver.snapshot()));
}

// =============================================================================
// STEP PLANNING
// =============================================================================

/// Turns external ticks into internal step sizes.
///
/// With a fixed internal `dt` the tick time accumulates and whole steps are taken.
/// At most `max_substeps` steps run per tick; any excess is folded into the last one.
#[derive(Clone, Debug, PartialEq)]
pub struct StepPlanner {
    fixed_dt: Option<f32>,
    max_substeps: usize,
    accumulator: f32,
}

impl StepPlanner {
    pub fn new(fixed_dt: Option<f32>, max_substeps: usize) -> Self {
        Self {
            fixed_dt: fixed_dt.filter(|h| *h > 0.0),
            max_substeps: max_substeps.max(1),
            accumulator: 0.0,
        }
    }

    pub fn from_config(config: &ThreadingConfig) -> Self {
        Self::new(config.fixed_dt, config.max_substeps)
    }

    pub fn accumulator(&self) -> f32 {
        self.accumulator
    }

    pub fn plan(&mut self, dt: f32) -> Vec<f32> {
        let Some(h) = self.fixed_dt else {
            return if dt > 0.0 { vec![dt] } else { Vec::new() };
        };
        self.accumulator += dt.max(0.0);
        let n = (self.accumulator / h).floor() as usize;
        if n == 0 {
            return Vec::new();
        }
        self.accumulator = (self.accumulator - n as f32 * h).max(0.0);
        if n <= self.max_substeps {
            return vec![h; n];
        }
        let collapsed = (n - self.max_substeps + 1) as f32 * h;
        log::debug!("collapsing {n} steps into {}", self.max_substeps);
        let mut steps = vec![h; self.max_substeps - 1];
        steps.push(collapsed);
        steps
    }
}

// =============================================================================
// HANDLE
// =============================================================================

type Job = Box<dyn FnOnce(&mut Solver) + Send>;

enum Message {
    Enqueue(SolverCommand),
    Advance(Vec<f32>),
    Execute(Job),
    Sync(mpsc::Sender<()>),
    Shutdown,
}

#[derive(Default)]
struct TaskQueue {
    jobs: VecDeque<Job>,
    pumping: bool,
}

struct TaskShared {
    solver: Mutex<Option<Solver>>,
    queue: Mutex<TaskQueue>,
    drained: Condvar,
    results: Arc<ArcSwap<SolverResults>>,
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string payload")
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TaskShared {
    fn submit(self: &Arc<Self>, job: Job) {
        let mut queue = lock(&self.queue);
        queue.jobs.push_back(job);
        if !queue.pumping {
            queue.pumping = true;
            let shared = Arc::clone(self);
            rayon::spawn(move || shared.pump());
        }
    }

    /// Runs queued jobs one after another; only one pump is alive at a time.
    fn pump(&self) {
        let _scope = PhysicsThreadScope::enter();
        loop {
            let job = {
                let mut queue = lock(&self.queue);
                match queue.jobs.pop_front() {
                    Some(job) => job,
                    None => {
                        queue.pumping = false;
                        self.drained.notify_all();
                        return;
                    }
                }
            };
            let mut solver = lock(&self.solver);
            if let Some(solver) = solver.as_mut() {
                // A panic escaping a rayon job aborts the process.
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    job(solver);
                    publish(&self.results, solver);
                }));
                if let Err(payload) = outcome {
                    log::error!("{}: job panicked: {}", solver.id(), panic_message(&*payload));
                }
            }
        }
    }

    fn wait_drained(&self) {
        let mut queue = lock(&self.queue);
        while queue.pumping || !queue.jobs.is_empty() {
            queue = self
                .drained
                .wait(queue)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

enum Backend {
    Inline(Box<Solver>),
    Dedicated {
        sender: mpsc::Sender<Message>,
        thread: Option<JoinHandle<Solver>>,
    },
    TaskGraph(Arc<TaskShared>),
    Closed,
}

/// Producer-side handle to a solver running in one of the `ThreadingMode`s.
pub struct SolverHandle {
    id: SolverId,
    mode: ThreadingMode,
    planner: StepPlanner,
    results: Arc<ArcSwap<SolverResults>>,
    backend: Backend,
}

impl SolverHandle {
    /// Takes ownership of `solver` and starts it in its configured mode.
    pub fn new(solver: Solver) -> Self {
        let id = solver.id();
        let threading = solver.config().threading.clone();
        let results = Arc::new(ArcSwap::from_pointee(solver.snapshot()));
        let backend = match threading.mode {
            ThreadingMode::SingleThreaded => Backend::Inline(Box::new(solver)),
            ThreadingMode::DedicatedThread => Self::spawn_dedicated(solver, Arc::clone(&results)),
            ThreadingMode::TaskGraph => Backend::TaskGraph(Arc::new(TaskShared {
                solver: Mutex::new(Some(solver)),
                queue: Mutex::new(TaskQueue::default()),
                drained: Condvar::new(),
                results: Arc::clone(&results),
            })),
        };
        log::info!("{id} running {:?}", threading.mode);
        Self {
            id,
            mode: threading.mode,
            planner: StepPlanner::from_config(&threading),
            results,
            backend,
        }
    }

    fn spawn_dedicated(mut solver: Solver, results: Arc<ArcSwap<SolverResults>>) -> Backend {
        let (sender, receiver) = mpsc::channel::<Message>();
        let name = format!("physics-{}", solver.id());
        let spawned = std::thread::Builder::new().name(name).spawn(move || {
            let _scope = PhysicsThreadScope::enter();
            while let Ok(message) = receiver.recv() {
                match message {
                    Message::Enqueue(command) => solver.enqueue(command),
                    Message::Advance(steps) => {
                        for dt in steps {
                            solver.step(dt);
                        }
                        publish(&results, &solver);
                    }
                    Message::Execute(job) => {
                        job(&mut solver);
                        publish(&results, &solver);
                    }
                    Message::Sync(reply) => {
                        let _ = reply.send(());
                    }
                    Message::Shutdown => break,
                }
            }
            solver
        });
        match spawned {
            Ok(thread) => Backend::Dedicated {
                sender,
                thread: Some(thread),
            },
            Err(err) => panic!("failed to start physics thread: {err}"),
        }
    }

    pub fn id(&self) -> SolverId {
        self.id
    }

    pub fn mode(&self) -> ThreadingMode {
        self.mode
    }

    pub fn enqueue(&mut self, command: SolverCommand) {
        match &mut self.backend {
            Backend::Inline(solver) => solver.enqueue(command),
            Backend::Dedicated { sender, .. } => send(self.id, sender, Message::Enqueue(command)),
            Backend::TaskGraph(shared) => shared.submit(Box::new(move |s| s.enqueue(command))),
            Backend::Closed => log::warn!("{}: enqueue after shutdown", self.id),
        }
    }

    /// Feeds one external tick of `dt` seconds. Returns the number of steps started.
    pub fn advance(&mut self, dt: f32) -> usize {
        let steps = self.planner.plan(dt);
        let count = steps.len();
        if count == 0 {
            return 0;
        }
        match &mut self.backend {
            Backend::Inline(solver) => {
                let _scope = PhysicsThreadScope::enter();
                for h in steps {
                    solver.step(h);
                }
                publish(&self.results, solver);
            }
            Backend::Dedicated { sender, .. } => send(self.id, sender, Message::Advance(steps)),
            Backend::TaskGraph(shared) => shared.submit(Box::new(move |s| {
                for h in steps {
                    s.step(h);
                }
            })),
            Backend::Closed => return 0,
        }
        count
    }

    /// Latest published results. Never blocks.
    pub fn results(&self) -> Arc<SolverResults> {
        self.results.load_full()
    }

    /// Blocks until everything sent so far has run.
    pub fn sync(&self) {
        match &self.backend {
            Backend::Dedicated { sender, .. } => {
                let (reply, done) = mpsc::channel();
                send(self.id, sender, Message::Sync(reply));
                if done.recv().is_err() {
                    panic!("{}: physics thread has exited", self.id);
                }
            }
            Backend::TaskGraph(shared) => shared.wait_drained(),
            Backend::Inline(_) | Backend::Closed => {}
        }
    }

    /// Runs `f` on the physics side, after all earlier work, and waits for its result.
    pub fn with_solver<R, F>(&mut self, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce(&mut Solver) -> R + Send + 'static,
    {
        let (reply, result) = mpsc::channel();
        let job: Job = Box::new(move |solver| {
            let _ = reply.send(f(solver));
        });
        match &mut self.backend {
            Backend::Inline(solver) => {
                let _scope = PhysicsThreadScope::enter();
                job(solver);
                publish(&self.results, solver);
            }
            Backend::Dedicated { sender, .. } => send(self.id, sender, Message::Execute(job)),
            Backend::TaskGraph(shared) => shared.submit(job),
            Backend::Closed => panic!("{}: with_solver after shutdown", self.id),
        }
        match result.recv() {
            Ok(value) => value,
            Err(_) => panic!("{}: physics side dropped a job", self.id),
        }
    }

    /// Rewinds to `frame`, applies `corrections` and resimulates back to the head as one
    /// uninterruptible unit. `None` when the frame is not rewindable.
    pub fn resimulate<F>(&mut self, frame: u64, corrections: F) -> Option<ResimReport>
    where
        F: FnOnce(&mut ParticleStore) + Send + 'static,
    {
        self.with_solver(move |solver| solver.resimulate_from(frame, corrections))
    }

    /// Stops the backend and hands the solver back.
    pub fn shutdown(mut self) -> Solver {
        match std::mem::replace(&mut self.backend, Backend::Closed) {
            Backend::Inline(solver) => *solver,
            Backend::Dedicated { sender, mut thread } => {
                let _ = sender.send(Message::Shutdown);
                match thread.take().map(JoinHandle::join) {
                    Some(Ok(solver)) => solver,
                    _ => panic!("{}: physics thread panicked", self.id),
                }
            }
            Backend::TaskGraph(shared) => {
                shared.wait_drained();
                match lock(&shared.solver).take() {
                    Some(solver) => solver,
                    None => panic!("{}: solver already taken", self.id),
                }
            }
            Backend::Closed => panic!("{}: shut down twice", self.id),
        }
    }
}

impl Drop for SolverHandle {
    fn drop(&mut self) {
        if let Backend::Dedicated { sender, thread } = &mut self.backend {
            let _ = sender.send(Message::Shutdown);
            if let Some(thread) = thread.take() {
                let _ = thread.join();
            }
        }
    }
}

impl std::fmt::Debug for SolverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolverHandle")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("frame", &self.results.load().frame)
            .finish()
    }
}
