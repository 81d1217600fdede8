use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use num_enum::{IntoPrimitive, UnsafeFromPrimitive};

use super::Continuation;
use crate::error::PanicError;
use crate::executor::ExecutorRef;

/// Lifecycle of a coroutine result.
///
/// Legal edges: `Empty -> Detached`, `Empty -> HasAwaiter`, `HasAwaiter -> HasResult` and
/// `Empty -> HasResult`. `Detached` and `HasResult` are terminal.
#[repr(usize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, UnsafeFromPrimitive)]
pub(crate) enum LifecycleState {
    // Coroutine has not completed, nobody observes it.
    Empty = 0,
    // Owning handle was dropped before observing result.
    Detached = 1,
    // Some consumer is waiting for result.
    HasAwaiter = 2,
    // Coroutine completed, result is stored.
    HasResult = 3,
}

impl LifecycleState {
    fn from_bits(bits: usize) -> LifecycleState {
        debug_assert!(bits <= usize::from(LifecycleState::HasResult));
        unsafe { LifecycleState::from_unchecked(bits) }
    }
}

/// Outcome of [Promise::finalize].
#[derive(Debug)]
pub(crate) enum Finalize {
    // Consumer is gone, nothing to resume and result should be discarded.
    Detached,
    // Result is stored for later pickup.
    Stored,
    // Consumer is waiting, resume it.
    Resume(Continuation),
}

/// Outcome of [Promise::mark_detached].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Detach {
    // Producer will discard result on finalization.
    Detached,
    // Result is there already, detacher owns it.
    Completed,
}

/// Single-producer single-consumer completion cell of a coroutine.
///
/// Producer calls [Promise::record] then [Promise::finalize] exactly once. At most one consumer
/// calls either [Promise::register_awaiter] or [Promise::mark_detached] exactly once, and
/// [Promise::take_result] at most once after observing completion.
pub(crate) struct Promise<T> {
    state: AtomicUsize,
    result: UnsafeCell<Option<Result<T, PanicError>>>,
    awaiter: UnsafeCell<Option<Continuation>>,
    executor: UnsafeCell<Option<ExecutorRef>>,
}

// SAFETY: Cells are handed over through `state` with release/acquire pairs.
unsafe impl<T: Send> Send for Promise<T> {}
unsafe impl<T: Send> Sync for Promise<T> {}

impl<T> Promise<T> {
    pub fn new() -> Promise<T> {
        Promise {
            state: AtomicUsize::new(LifecycleState::Empty.into()),
            result: UnsafeCell::new(None),
            awaiter: UnsafeCell::new(None),
            executor: UnsafeCell::new(None),
        }
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_bits(self.state.load(Ordering::Acquire))
    }

    pub fn is_complete(&self) -> bool {
        self.state() == LifecycleState::HasResult
    }

    /// Binds executor.
    ///
    /// # Safety
    /// Caller must own the only access to this promise, that is, its coroutine has not been resumed
    /// and no other thread could observe it.
    pub unsafe fn bind(&self, executor: ExecutorRef) {
        *self.executor.get() = Some(executor);
    }

    pub fn executor(&self) -> Option<&ExecutorRef> {
        // SAFETY: Executor is written only before first resumption which happens before all reads.
        unsafe { &*self.executor.get() }.as_ref()
    }

    /// Records coroutine result, value or captured panic alike.
    ///
    /// # Panics
    /// Panic if result was recorded already.
    pub fn record(&self, result: Result<T, PanicError>) {
        // SAFETY: Only producer writes result and it does so before finalize publishes it.
        let cell = unsafe { &mut *self.result.get() };
        assert!(cell.is_none(), "promise: result recorded twice");
        *cell = Some(result);
    }

    /// Abandons result.
    pub fn mark_detached(&self) -> Detach {
        match self.state.compare_exchange(
            LifecycleState::Empty.into(),
            LifecycleState::Detached.into(),
            // Nothing to publish, but pair with finalize which will drop result on our behalf.
            Ordering::Release,
            // Acquire result if producer won.
            Ordering::Acquire,
        ) {
            Ok(_) => Detach::Detached,
            Err(bits) => match LifecycleState::from_bits(bits) {
                LifecycleState::HasResult => Detach::Completed,
                state => unreachable!("promise: detach in state {:?}", state),
            },
        }
    }

    /// Registers continuation to be resumed on completion.
    ///
    /// Returns continuation back if result is available already, so caller could proceed
    /// synchronously.
    pub fn register_awaiter(&self, continuation: Continuation) -> Result<(), Continuation> {
        // SAFETY: Only consumer writes awaiter and it does so before publishing `HasAwaiter`.
        let slot = unsafe { &mut *self.awaiter.get() };
        assert!(slot.is_none(), "promise: awaiter registered twice");
        *slot = Some(continuation);
        let err = match self.state.compare_exchange(
            LifecycleState::Empty.into(),
            LifecycleState::HasAwaiter.into(),
            // Release continuation to finalize.
            Ordering::Release,
            // Acquire result if producer won.
            Ordering::Acquire,
        ) {
            Ok(_) => return Ok(()),
            Err(bits) => LifecycleState::from_bits(bits),
        };
        match (err, slot.take()) {
            (LifecycleState::HasResult, Some(continuation)) => Err(continuation),
            (state, _) => unreachable!("promise: register awaiter in state {:?}", state),
        }
    }

    /// Publishes recorded result and arbitrates with consumer.
    pub fn finalize(&self) -> Finalize {
        let mut state = self.state();
        loop {
            match state {
                LifecycleState::Detached => return Finalize::Detached,
                LifecycleState::HasResult => panic!("promise: finalized twice"),
                LifecycleState::Empty | LifecycleState::HasAwaiter => {},
            }
            match self.state.compare_exchange_weak(
                state.into(),
                LifecycleState::HasResult.into(),
                // * Release result to consumer
                // * Acquire continuation from consumer
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(bits) => state = LifecycleState::from_bits(bits),
            }
        }
        if state == LifecycleState::Empty {
            return Finalize::Stored;
        }
        // SAFETY: Consumer published awaiter before `HasAwaiter` and will not touch it again.
        match unsafe { &mut *self.awaiter.get() }.take() {
            Some(continuation) => Finalize::Resume(continuation),
            None => unreachable!("promise: no awaiter in state {:?}", state),
        }
    }

    /// Takes result after observing completion.
    ///
    /// # Panics
    /// Panic if not completed or taken already.
    pub fn take_result(&self) -> Result<T, PanicError> {
        let state = self.state();
        assert!(state == LifecycleState::HasResult, "promise: take result in state {:?}", state);
        // SAFETY: Acquired `HasResult`, producer is done with result.
        match unsafe { &mut *self.result.get() }.take() {
            Some(result) => result,
            None => panic!("promise: result taken twice"),
        }
    }

    /// Drops result on behalf of vanished consumer.
    ///
    /// # Safety
    /// Either [Promise::finalize] returned [Finalize::Detached] to caller or [Promise::mark_detached]
    /// returned [Detach::Completed] to caller.
    pub unsafe fn discard(&self) {
        drop(self.reclaim());
    }

    /// Takes result back on behalf of vanished consumer.
    ///
    /// # Safety
    /// Same as [Promise::discard].
    pub unsafe fn reclaim(&self) -> Result<T, PanicError> {
        match (*self.result.get()).take() {
            Some(result) => result,
            None => panic!("promise: result taken twice"),
        }
    }
}
