//! Thread pool executor and a [Runtime] owning it.

use std::cell::Cell;
use std::collections::VecDeque;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::{fmt, ptr, thread};

use ignore_result::Ignore;
use static_assertions::assert_impl_all;
use tracing::debug;

use crate::coroutine::{Co, Continuation};
use crate::error::JoinError;
use crate::executor::{Executor, ExecutorRef};
use crate::task::{self, JoinHandle};

thread_local! {
    static POOL: Cell<*const ThreadPool> = Cell::new(ptr::null());
}

struct Scope {}

impl Scope {
    fn enter(pool: &ThreadPool) -> Scope {
        POOL.with(|cell| {
            assert!(cell.get().is_null(), "runtime pool existed");
            cell.set(pool);
        });
        Scope {}
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        POOL.with(|cell| {
            assert!(!cell.get().is_null(), "runtime pool does not exist");
            cell.set(ptr::null());
        });
    }
}

/// Builder for [Runtime].
#[derive(Default)]
pub struct Builder {
    parallelism: Option<usize>,
    name: Option<String>,
}

impl Builder {
    /// Specifies the number of parallel threads for scheduling.
    pub fn parallelism(&mut self, n: usize) -> &mut Self {
        assert!(n > 0, "parallelism must not be zero");
        self.parallelism = Some(n);
        self
    }

    /// Specifies name prefix of worker threads.
    pub fn name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = Some(name.into());
        self
    }

    /// Constructs an [Runtime] to spawn and schedule tasks.
    pub fn build(&mut self) -> Runtime {
        let parallelism =
            self.parallelism.unwrap_or_else(|| thread::available_parallelism().map_or(4, NonZeroUsize::get));
        let name = self.name.clone().unwrap_or_else(|| "unstuck".to_string());
        let pool = ThreadPool::new(name, parallelism);
        let workers = ThreadPool::start(&pool);
        Runtime { pool, workers }
    }
}

struct PoolState {
    runq: VecDeque<Continuation>,
    stopped: bool,
    // Workers not yet exited. Nothing is queued once it drops to zero.
    serving: usize,
}

/// Executor which resumes continuations on a fixed set of worker threads.
///
/// Continuations are resumed in no particular order.
pub struct ThreadPool {
    name: String,
    parallelism: usize,
    state: Mutex<PoolState>,
    waker: Condvar,
}

assert_impl_all!(ThreadPool: Send, Sync);

impl ThreadPool {
    fn new(name: String, parallelism: usize) -> Arc<ThreadPool> {
        Arc::new(ThreadPool {
            name,
            parallelism,
            state: Mutex::new(PoolState { runq: VecDeque::with_capacity(256), stopped: false, serving: parallelism }),
            waker: Condvar::new(),
        })
    }

    /// Starts threads to serve scheduled continuations.
    fn start(self: &Arc<ThreadPool>) -> Vec<thread::JoinHandle<()>> {
        (0..self.parallelism)
            .map(|index| {
                let pool = self.clone();
                thread::Builder::new()
                    .name(format!("{}-{}", self.name, index))
                    .spawn(move || pool.serve(index))
                    .unwrap_or_else(|err| panic!("runtime: fail to spawn worker thread: {}", err))
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Continuations never run under lock.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stops workers after they drain pending continuations.
    fn stop(&self) {
        let mut state = self.lock();
        state.stopped = true;
        self.waker.notify_all();
    }

    /// Name prefix of worker threads.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of worker threads.
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Checks whether calling thread is a worker of this pool.
    pub fn in_worker(&self) -> bool {
        POOL.with(|cell| ptr::eq(cell.get(), self))
    }

    fn serve(&self, index: usize) {
        let _scope = Scope::enter(self);
        debug!(pool = %self.name, worker = index, "worker started");
        let mut state = self.lock();
        loop {
            if let Some(continuation) = state.runq.pop_front() {
                drop(state);
                continuation.resume();
                state = self.lock();
            } else if state.stopped {
                state.serving -= 1;
                break;
            } else {
                state = self.waker.wait(state).unwrap_or_else(PoisonError::into_inner);
            }
        }
        debug!(pool = %self.name, worker = index, "worker stopped");
    }
}

impl Executor for ThreadPool {
    fn schedule(&self, continuation: Continuation) {
        let mut state = self.lock();
        if state.serving != 0 {
            state.runq.push_back(continuation);
            self.waker.notify_one();
            return;
        }
        drop(state);
        debug!(pool = %self.name, "pool stopped, dropping continuation");
        // Dropping a frame could schedule, so drop outside lock.
        drop(continuation);
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool").field("name", &self.name).field("parallelism", &self.parallelism).finish()
    }
}

/// Runtime encapsulates a [ThreadPool] to serve spawned coroutines.
///
/// [Runtime::drop] will stop and join all serving threads after they drain pending continuations.
/// Continuations scheduled after that are dropped without being resumed, releasing their frames.
pub struct Runtime {
    pool: Arc<ThreadPool>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl Runtime {
    /// Constructs an runtime to serve spawned coroutines.
    pub fn new() -> Runtime {
        Builder::default().build()
    }

    /// Returns pool of this runtime.
    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    /// Returns reference to pool of this runtime.
    pub fn executor(&self) -> ExecutorRef {
        ExecutorRef::new(self.pool.clone())
    }

    /// Spawns a coroutine on this runtime and returns a [JoinHandle] for it.
    pub fn spawn<F, Fut, T>(&self, body: F) -> JoinHandle<T>
    where
        F: FnOnce(Co) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        task::task(body).start_on(self.executor())
    }

    /// Spawns a coroutine and blocks current thread until it completes.
    ///
    /// # Panics
    /// Panic if called from worker thread of this runtime.
    pub fn block_on<F, Fut, T>(&self, body: F) -> Result<T, JoinError>
    where
        F: FnOnce(Co) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        assert!(!self.pool.in_worker(), "runtime: block_on in worker thread");
        self.spawn(body).join()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime::new()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.pool.stop();
        for handle in self.workers.drain(..) {
            handle.join().ignore();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::coroutine::suspension;

    thread_local! {
        static LOCAL_SECRET: Cell<usize> = Cell::new(0);
    }

    #[test]
    #[should_panic]
    fn runtime_builder_parallelism_zero() {
        Builder::default().parallelism(0).build();
    }

    #[test]
    fn runtime_builder_parallelism_one() {
        let runtime = Builder::default().parallelism(1).build();
        let secret = 333;
        let set_secret = runtime.spawn(move |_| async move {
            thread::sleep(Duration::from_millis(200));
            LOCAL_SECRET.with(|cell| cell.set(secret));
        });
        let get_secret = runtime.spawn(move |_| async move { LOCAL_SECRET.with(|cell| cell.get()) });
        set_secret.join().unwrap();
        assert_eq!(secret, get_secret.join().unwrap());
    }

    #[test]
    fn runtime_builder_parallelism_multiple() {
        let runtime = Builder::default().parallelism(2).build();
        let secret = 111;
        let (sender, receiver) = mpsc::channel::<()>();
        // Occupies one worker until `get_secret` completes on the other.
        let set_secret = runtime.spawn(move |_| async move {
            receiver.recv().unwrap();
            LOCAL_SECRET.with(|cell| cell.set(secret));
        });
        let get_secret = runtime.spawn(move |_| async move { LOCAL_SECRET.with(|cell| cell.get()) });
        assert_ne!(secret, get_secret.join().unwrap());
        sender.send(()).unwrap();
        set_secret.join().unwrap();
    }

    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn runtime_stopped_drops_continuation() {
        let runtime = Builder::default().parallelism(1).build();
        let pool = Arc::downgrade(runtime.pool());
        let dropped = Arc::new(AtomicUsize::new(0));
        let (suspension, resumption) = suspension::<()>();
        let (sender, receiver) = mpsc::channel::<()>();
        let handle = runtime.spawn({
            let dropped = dropped.clone();
            move |co: Co| async move {
                let tracked = Tracked(dropped);
                sender.send(()).unwrap();
                co.suspend_on(suspension).await;
                drop(tracked);
            }
        });
        receiver.recv().unwrap();
        drop(handle);
        drop(runtime);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
        // Resumption hops to stopped pool which drops it along with the frame.
        assert_eq!(resumption.resume(()), true);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(pool.upgrade().is_none(), true);
    }

    #[test]
    fn runtime_builder_name() {
        let runtime = Builder::default().name("pool").parallelism(1).build();
        assert_eq!(runtime.pool().name(), "pool");
        assert_eq!(runtime.pool().parallelism(), 1);
        let name = runtime.block_on(|_| async { thread::current().name().map(|s| s.to_string()) }).unwrap();
        assert_eq!(name.as_deref(), Some("pool-0"));
    }

    #[test]
    fn runtime_in_worker() {
        let runtime = Runtime::new();
        let other = Runtime::new();
        assert_eq!(runtime.pool().in_worker(), false);
        let pool = runtime.pool().clone();
        let other_pool = other.pool().clone();
        let (mine, theirs) =
            runtime.block_on(move |_| async move { (pool.in_worker(), other_pool.in_worker()) }).unwrap();
        assert_eq!(mine, true);
        assert_eq!(theirs, false);
    }

    #[test]
    fn runtime_block_on_panic() {
        let runtime = Runtime::new();
        let err = runtime.block_on(|_| async { panic!("oooooops") }).map(|_: ()| ()).unwrap_err();
        assert!(err.to_string().contains("oooooops"));
    }

    #[test]
    fn runtime_executor_identity() {
        let runtime = Runtime::new();
        let executor = runtime.executor();
        assert_eq!(executor, runtime.executor());
        let bound = runtime.block_on(|co: Co| async move { co.executor().clone() }).unwrap();
        assert_eq!(bound, executor);
    }

    #[test]
    fn runtime_drop_drains_queue() {
        let runtime = Builder::default().parallelism(1).build();
        let handles: Vec<_> = (0..10).map(|i| runtime.spawn(move |_| async move { i })).collect();
        drop(runtime);
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.is_finished(), true);
            assert_eq!(handle.join().unwrap(), i);
        }
    }
}
