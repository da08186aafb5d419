//! A pool of pinned worker threads driving traversals concurrently.
//!
//! Lifecycle of a pool:
//!
//! 1. Every worker is spawned, pins itself, applies the requested realtime
//!    priority, and prepares its workload (for thread-local workloads this
//!    means mapping a private region and building chains in it).
//! 2. Workers report readiness and wait for a start gate. Once all of them are
//!    ready the supervisor opens the gate, optionally handing out a barrier so
//!    they begin the measured loop together. A pool that fails to start
//!    closes the gate instead, and every worker returns without running.
//! 3. Each worker runs batches, adding to its own counter as work completes,
//!    until the shared [`StopToken`] is cancelled or its bound is reached.
//!    Batches are split into chunks and the token is checked between chunks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use thread_priority::{
    RealtimeThreadSchedulePolicy, ThreadPriority, ThreadPriorityValue,
    ThreadSchedulePolicy,
};

use crate::chain::PartitionBuilder;
use crate::env;
use crate::error::{PchaseError, Result};
use crate::pagemap::AddressResolver;
use crate::region::{Region, RegionOptions};
use crate::timing::{RunSummary, Stopwatch};
use crate::traverse::{self, AccessKind};

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Chase steps between checks of the stop flag.
const CHASE_CHUNK: u64 = 1 << 14;

/// Spin iterations between checks of the stop flag.
const SPIN_CHUNK: u64 = 1 << 16;

/// Shared cancellation flag.
#[derive(Clone, Debug, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self { Self::default() }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Cancel this token on SIGINT, SIGTERM and SIGHUP.
    pub fn install_signal_handlers(&self) -> Result<()> {
        use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
        for sig in [SIGINT, SIGTERM, SIGHUP] {
            signal_hook::flag::register(sig, Arc::clone(&self.0))?;
        }
        Ok(())
    }

    /// Block until the token is cancelled or `limit` elapses. When the limit
    /// is hit, the token is cancelled. Returns `true` on timeout.
    pub fn wait(&self, limit: Option<Duration>) -> bool {
        let deadline = limit.map(|d| Instant::now() + d);
        loop {
            if self.is_cancelled() {
                return false;
            }
            let nap = match deadline {
                Some(t) => {
                    let now = Instant::now();
                    if now >= t {
                        self.cancel();
                        return true;
                    }
                    (t - now).min(POLL_INTERVAL)
                },
                None => POLL_INTERVAL,
            };
            thread::sleep(nap);
        }
    }
}

/// What a worker does in each batch.
#[derive(Debug)]
pub enum Workload {
    /// Follow `cursors` through a shared region, `batch` steps per batch.
    Chase { region: Arc<Region>, cursors: Vec<u32> },
    /// Map a private region and build chains in it before starting.
    LocalChase { region: RegionOptions, builder: PartitionBuilder },
    /// Sweep a shared region `batch` times per batch.
    Sweep(Arc<Region>),
    /// Map a private region and sweep it.
    LocalSweep(RegionOptions),
    /// Spin without touching memory, counting `batch` per batch.
    Spin,
}

/// How long a worker keeps going.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bound {
    /// Until the pool is cancelled.
    Unbounded,
    /// At most this many batches.
    Batches(u64),
}

/// Description of one worker.
#[derive(Debug)]
pub struct WorkerSpec {
    pub name: String,
    pub cpu: Option<usize>,
    pub workload: Workload,
    pub kind: AccessKind,
    pub batch: u64,
    pub bound: Bound,
}

impl WorkerSpec {
    pub fn new(name: impl Into<String>, workload: Workload) -> Self {
        Self {
            name: name.into(),
            cpu: None,
            workload,
            kind: AccessKind::Read,
            batch: 1,
            bound: Bound::Unbounded,
        }
    }

    pub fn cpu(mut self, x: usize) -> Self {
        self.cpu = Some(x);
        self
    }

    pub fn kind(mut self, x: AccessKind) -> Self {
        self.kind = x;
        self
    }

    pub fn batch(mut self, x: u64) -> Self {
        self.batch = x;
        self
    }

    pub fn bound(mut self, x: Bound) -> Self {
        self.bound = x;
        self
    }
}

/// A workload after per-thread preparation.
enum Job {
    Chase { region: Arc<Region>, cursors: Vec<u32> },
    Sweep(Arc<Region>),
    Spin,
}

impl Job {
    fn prepare(name: &str, workload: Workload) -> Result<Self> {
        Ok(match workload {
            Workload::Chase { region, cursors } => {
                traverse::check_cursors(&region, &cursors)?;
                Self::Chase { region, cursors }
            },
            Workload::LocalChase { region, builder } => {
                let mut region = region.map()?;
                let mut resolver = AddressResolver::detect();
                let chains = builder.build(&mut region, &mut resolver)?;
                debug!("worker '{}': private region {:?}, {} chain(s) of {}",
                    name, region, chains.num_chains(), chains.chain_len());
                Self::Chase { region: Arc::new(region), cursors: chains.cursors() }
            },
            Workload::Sweep(region) => Self::Sweep(region),
            Workload::LocalSweep(opts) => Self::Sweep(Arc::new(opts.map()?)),
            Workload::Spin => Self::Spin,
        })
    }

    /// Run one batch, adding to `counter` after every chunk. Returns `false`
    /// when `stop` cut the batch short.
    fn run_batch(&mut self, kind: AccessKind, batch: u64, stop: &StopToken,
        counter: &AtomicU64) -> Result<bool>
    {
        let chunk = match self {
            Self::Chase { .. } => CHASE_CHUNK,
            Self::Sweep(_) => 1,
            Self::Spin => SPIN_CHUNK,
        };
        let mut left = batch;
        while left > 0 {
            let n = left.min(chunk);
            let work = match self {
                Self::Chase { region, cursors } => traverse::traverse(region, cursors, n, kind)?,
                Self::Sweep(region) => (0..n).map(|_| traverse::sweep(region, kind)).sum(),
                Self::Spin => {
                    let mut x = 0u64;
                    for _ in 0..n {
                        x = std::hint::black_box(x + 1);
                    }
                    x
                },
            };
            counter.fetch_add(work, Ordering::Relaxed);
            left -= n;
            if left > 0 && stop.is_cancelled() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn pin(name: &str, cpu: usize) {
    let id = cpu % env::num_cpus();
    if core_affinity::set_for_current(core_affinity::CoreId { id }) {
        debug!("worker '{}' pinned to cpu {}", name, id);
    } else {
        warn!("Couldn't pin worker '{}' to cpu {}", name, id);
    }
}

/// Switch the calling thread to `SCHED_FIFO` at priority `prio`.
fn apply_realtime(name: &str, prio: u8) {
    let value = match ThreadPriorityValue::try_from(prio) {
        Ok(v) => v,
        Err(e) => {
            warn!("worker '{}': bad realtime priority {}: {}", name, prio, e);
            return;
        },
    };
    let res = thread_priority::set_thread_priority_and_policy(
        thread_priority::thread_native_id(),
        ThreadPriority::Crossplatform(value),
        ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
    );
    match res {
        Ok(()) => debug!("worker '{}' runs SCHED_FIFO at {}", name, prio),
        Err(e) => warn!("Couldn't set worker '{}' to SCHED_FIFO {}: {:?}", name, prio, e),
    }
}

/// Builder for a set of workers sharing one [`StopToken`].
pub struct WorkerPool {
    stop: StopToken,
    synchronized: bool,
    realtime: Option<u8>,
    specs: Vec<WorkerSpec>,
}

impl WorkerPool {
    pub fn new(stop: StopToken) -> Self {
        Self { stop, synchronized: true, realtime: None, specs: Vec::new() }
    }

    /// Whether workers meet at a barrier before their first batch.
    pub fn synchronized(mut self, x: bool) -> Self {
        self.synchronized = x;
        self
    }

    /// `SCHED_FIFO` priority (1..=99) applied by every worker to itself.
    pub fn realtime(mut self, x: Option<u8>) -> Self {
        self.realtime = x;
        self
    }

    pub fn add(&mut self, spec: WorkerSpec) -> &mut Self {
        self.specs.push(spec);
        self
    }

    pub fn len(&self) -> usize { self.specs.len() }
    pub fn is_empty(&self) -> bool { self.specs.is_empty() }

    /// Spawn every worker and return once all of them are running.
    ///
    /// If a thread can't be spawned or a worker fails to prepare its
    /// workload, the pool is cancelled, every spawned worker is joined
    /// without having run, and the first failure is returned.
    pub fn start(self) -> Result<RunningPool> {
        if self.specs.is_empty() {
            return Err(PchaseError::invalid("worker pool has no workers"));
        }
        let n = self.specs.len();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

        let mut names = Vec::with_capacity(n);
        let mut counters = Vec::with_capacity(n);
        let mut gates = Vec::with_capacity(n);
        let mut handles = Vec::with_capacity(n);
        for spec in self.specs {
            let counter = Arc::new(AtomicU64::new(0));
            let (gate_tx, gate_rx) = mpsc::channel();
            let ctx = WorkerCtx {
                stop: self.stop.clone(),
                counter: Arc::clone(&counter),
                gate: gate_rx,
                ready: ready_tx.clone(),
                realtime: self.realtime,
            };
            let name = spec.name.clone();
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || ctx.run(spec));
            match handle {
                Ok(h) => handles.push(h),
                Err(source) => {
                    error!("couldn't spawn worker '{}': {}", name, source);
                    abort(&self.stop, gates, handles, &names);
                    return Err(PchaseError::Spawn { name, source });
                },
            }
            names.push(name);
            counters.push(counter);
            gates.push(gate_tx);
        }
        drop(ready_tx);

        let mut failure = None;
        let mut ready = 0;
        while let Ok(res) = ready_rx.recv() {
            ready += 1;
            if let Err(e) = res {
                failure.get_or_insert(e);
            }
        }
        if failure.is_some() || ready < n {
            let panicked = abort(&self.stop, gates, handles, &names);
            return Err(match (failure, panicked) {
                (Some(e), _) => e,
                (None, Some(name)) => PchaseError::WorkerPanicked(name),
                (None, None) => PchaseError::WorkerPanicked("<setup>".to_string()),
            });
        }

        let barrier = self.synchronized.then(|| Arc::new(Barrier::new(n + 1)));
        for gate in &gates {
            let _ = gate.send(barrier.clone());
        }
        if let Some(b) = &barrier {
            b.wait();
        }
        info!("{} worker(s) running", n);
        Ok(RunningPool {
            stop: self.stop,
            names,
            counters,
            handles,
            stopwatch: Stopwatch::start(),
        })
    }
}

/// Close the start gate of every worker and wait for all of them to return.
/// Returns the name of the first worker that panicked.
fn abort(stop: &StopToken, gates: Vec<mpsc::Sender<Option<Arc<Barrier>>>>,
    handles: Vec<JoinHandle<Result<()>>>, names: &[String]) -> Option<String>
{
    stop.cancel();
    drop(gates);
    let mut panicked = None;
    for (name, h) in names.iter().zip(handles) {
        if h.join().is_err() {
            error!("worker '{}' panicked during setup", name);
            panicked.get_or_insert_with(|| name.clone());
        }
    }
    panicked
}

/// State moved into each worker thread.
struct WorkerCtx {
    stop: StopToken,
    counter: Arc<AtomicU64>,
    gate: mpsc::Receiver<Option<Arc<Barrier>>>,
    ready: mpsc::Sender<Result<()>>,
    realtime: Option<u8>,
}

impl WorkerCtx {
    fn run(self, spec: WorkerSpec) -> Result<()> {
        let Self { stop, counter, gate, ready, realtime } = self;
        let WorkerSpec { name, cpu, workload, kind, batch, bound } = spec;
        if let Some(cpu) = cpu {
            pin(&name, cpu);
        }
        if let Some(prio) = realtime {
            apply_realtime(&name, prio);
        }

        let mut job = match Job::prepare(&name, workload) {
            Ok(job) => job,
            Err(e) => {
                error!("worker '{}' setup failed: {}", name, e);
                let _ = ready.send(Err(e));
                return Ok(());
            },
        };
        let _ = ready.send(Ok(()));
        drop(ready);
        match gate.recv() {
            Ok(Some(b)) => {
                b.wait();
            },
            Ok(None) => {},
            Err(_) => {
                debug!("worker '{}' released before starting", name);
                return Ok(());
            },
        }

        debug!("worker '{}' begins ({} x {})", name, kind, batch);
        let mut done = 0u64;
        while job.run_batch(kind, batch, &stop, &counter)? {
            done += 1;
            if stop.is_cancelled() {
                break;
            }
            if let Bound::Batches(max) = bound {
                if done >= max {
                    break;
                }
            }
        }
        debug!("worker '{}' finished after {} full batch(es), {} accesses",
            name, done, counter.load(Ordering::Relaxed));
        Ok(())
    }
}

/// A started pool.
pub struct RunningPool {
    stop: StopToken,
    names: Vec<String>,
    counters: Vec<Arc<AtomicU64>>,
    handles: Vec<JoinHandle<Result<()>>>,
    stopwatch: Stopwatch,
}

impl RunningPool {
    /// Current value of every worker's counter.
    pub fn counts(&self) -> Vec<u64> {
        self.counters.iter().map(|c| c.load(Ordering::Relaxed)).collect()
    }

    pub fn cancel(&self) {
        self.stop.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handles.iter().all(|h| h.is_finished())
    }

    /// Wait until the pool is cancelled, every worker has finished, or
    /// `limit` elapses (which cancels the pool). Returns `true` on timeout.
    pub fn wait(&self, limit: Option<Duration>) -> bool {
        let deadline = limit.map(|d| Instant::now() + d);
        while !self.stop.is_cancelled() && !self.is_finished() {
            if let Some(t) = deadline {
                if Instant::now() >= t {
                    self.stop.cancel();
                    return true;
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
        false
    }

    /// Stop the clock, cancel every worker and collect the counts.
    ///
    /// Counts are read when the clock stops, so work the workers finish
    /// while winding down is not attributed to the measured interval.
    pub fn join(mut self) -> Result<PoolReport> {
        let elapsed = self.stopwatch.stop();
        let counts = self.counts();
        self.stop.cancel();
        let mut first_err = None;
        for (name, h) in self.names.iter().zip(self.handles.drain(..)) {
            match h.join() {
                Ok(Ok(())) => {},
                Ok(Err(e)) => {
                    error!("worker '{}' failed: {}", name, e);
                    first_err.get_or_insert(e);
                },
                Err(_) => {
                    error!("worker '{}' panicked", name);
                    first_err.get_or_insert(PchaseError::WorkerPanicked(name.clone()));
                },
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }
        Ok(PoolReport { elapsed, names: self.names, counts })
    }
}

/// Final per-worker counts of a joined pool.
#[derive(Clone, Debug)]
pub struct PoolReport {
    pub elapsed: Duration,
    pub names: Vec<String>,
    pub counts: Vec<u64>,
}

impl PoolReport {
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn summaries(&self, bytes_per_access: u64) -> Vec<RunSummary> {
        self.counts.iter()
            .map(|&c| RunSummary::new(self.elapsed, c, bytes_per_access))
            .collect()
    }

    pub fn summary(&self, bytes_per_access: u64) -> RunSummary {
        RunSummary::new(self.elapsed, self.total(), bytes_per_access)
    }
}
