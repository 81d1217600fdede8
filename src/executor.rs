//! Scheduling targets for suspended coroutines.
//!
//! An [Executor] exposes exactly one operation: [Executor::schedule] a [Continuation] to be resumed
//! eventually on one of its workers. Coroutine frames are bound to an [ExecutorRef] and every
//! resumption decision consults it.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use static_assertions::assert_impl_all;

use crate::coroutine::Continuation;

/// Scheduling target which runs continuations on its own worker(s).
///
/// No ordering is assumed across distinct [Executor::schedule] calls.
pub trait Executor: Send + Sync {
    /// Resumes given continuation eventually on a worker of this executor.
    fn schedule(&self, continuation: Continuation);
}

/// Shared reference to an [Executor].
///
/// Two references are equal if and only if they refer to the same executor instance.
#[derive(Clone)]
pub struct ExecutorRef {
    executor: Arc<dyn Executor>,
}

assert_impl_all!(ExecutorRef: Send, Sync);

impl ExecutorRef {
    /// Constructs a reference to given executor.
    pub fn new<E: Executor + 'static>(executor: Arc<E>) -> ExecutorRef {
        ExecutorRef { executor }
    }

    /// Schedules continuation on referenced executor.
    pub fn schedule(&self, continuation: Continuation) {
        self.executor.schedule(continuation);
    }

    fn address(&self) -> *const () {
        Arc::as_ptr(&self.executor) as *const ()
    }
}

impl<E: Executor + 'static> From<Arc<E>> for ExecutorRef {
    fn from(executor: Arc<E>) -> ExecutorRef {
        ExecutorRef::new(executor)
    }
}

impl PartialEq for ExecutorRef {
    fn eq(&self, other: &Self) -> bool {
        // Compare data pointers only, vtables of one type could be duplicated across codegen units.
        self.address() == other.address()
    }
}

impl Eq for ExecutorRef {}

impl fmt::Debug for ExecutorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExecutorRef({:p})", self.address())
    }
}

/// Executor which resumes continuations immediately on the scheduling thread.
#[derive(Default, Debug)]
pub struct InlineExecutor {}

impl InlineExecutor {
    /// Constructs a reference to a new inline executor.
    pub fn new() -> ExecutorRef {
        ExecutorRef::new(Arc::new(InlineExecutor {}))
    }
}

impl Executor for InlineExecutor {
    fn schedule(&self, continuation: Continuation) {
        continuation.resume();
    }
}

/// Executor which queues continuations until explicitly drained.
///
/// Useful to step through interleavings deterministically.
#[derive(Default)]
pub struct ManualExecutor {
    runq: Mutex<VecDeque<Continuation>>,
    scheduled: AtomicUsize,
}

impl ManualExecutor {
    /// Constructs a new manual executor.
    pub fn new() -> Arc<ManualExecutor> {
        Arc::new(ManualExecutor::default())
    }

    fn pop(&self) -> Option<Continuation> {
        self.runq.lock().unwrap_or_else(PoisonError::into_inner).pop_front()
    }

    /// Returns number of queued continuations.
    pub fn pending(&self) -> usize {
        self.runq.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns number of continuations ever scheduled.
    pub fn scheduled(&self) -> usize {
        self.scheduled.load(Ordering::Relaxed)
    }

    /// Resumes continuations queued before this call, returns how many ran.
    pub fn run_pending(&self) -> usize {
        let n = self.pending();
        for _ in 0..n {
            match self.pop() {
                Some(continuation) => continuation.resume(),
                None => break,
            }
        }
        n
    }

    /// Resumes continuations until the queue is empty, returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut n = 0;
        while let Some(continuation) = self.pop() {
            continuation.resume();
            n += 1;
        }
        n
    }
}

impl Executor for ManualExecutor {
    fn schedule(&self, continuation: Continuation) {
        self.scheduled.fetch_add(1, Ordering::Relaxed);
        self.runq.lock().unwrap_or_else(PoisonError::into_inner).push_back(continuation);
    }
}

impl fmt::Debug for ManualExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualExecutor")
            .field("pending", &self.pending())
            .field("scheduled", &self.scheduled())
            .finish()
    }
}
