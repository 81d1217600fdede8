use std::panic;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use derive_where::derive_where;
use ignore_result::Ignore;
use static_assertions::{assert_impl_all, assert_not_impl_any};
use tracing::debug;

use super::promise::{Detach, Finalize, Promise};
use super::{Awaitable, Continuation};
use crate::error::PanicError;

struct SuspensionJoint<T> {
    promise: Promise<T>,
    resumptions: AtomicUsize,
    resumed: AtomicBool,
}

impl<T> SuspensionJoint<T> {
    fn new() -> Arc<SuspensionJoint<T>> {
        Arc::new(SuspensionJoint {
            promise: Promise::new(),
            resumptions: AtomicUsize::new(1),
            resumed: AtomicBool::new(false),
        })
    }

    // Claims the only chance to publish result.
    fn claim(&self) -> bool {
        !self.resumed.swap(true, Ordering::AcqRel)
    }

    // Hands result back if suspension was gone.
    fn publish(&self, result: Result<T, PanicError>) -> Result<(), Result<T, PanicError>> {
        self.promise.record(result);
        match self.promise.finalize() {
            Finalize::Resume(continuation) => continuation.resume(),
            Finalize::Stored => {},
            // SAFETY: Finalize tells so.
            Finalize::Detached => return Err(unsafe { self.promise.reclaim() }),
        }
        Ok(())
    }
}

/// Suspension provides method to suspend calling coroutine.
///
/// It is an [Awaitable], suspend on it through [super::Co::suspend_on] or [super::Co::wait].
#[derive_where(Debug)]
pub struct Suspension<T> {
    #[derive_where(skip)]
    joint: Arc<SuspensionJoint<T>>,
    registered: bool,
    taken: bool,
}

/// Resumption provides method to resume suspending coroutine.
///
/// It could be cloned and sent across threads, the first [Resumption::send] wins. Dropping all
/// resumptions without sending fails the suspending coroutine.
#[derive_where(Debug)]
pub struct Resumption<T> {
    #[derive_where(skip)]
    joint: Arc<SuspensionJoint<T>>,
}

assert_impl_all!(Suspension<()>: Send);
assert_impl_all!(Resumption<()>: Send, Sync, Clone);
assert_not_impl_any!(Suspension<()>: Clone);

impl<T: Send> Awaitable for Suspension<T> {
    type Output = T;

    fn is_ready(&self) -> bool {
        self.joint.promise.is_complete()
    }

    fn register(&mut self, continuation: Continuation) -> Result<(), Continuation> {
        self.registered = true;
        self.joint.promise.register_awaiter(continuation)
    }

    /// # Panics
    /// Panic if no resume from [Resumption].
    fn take(&mut self) -> T {
        self.taken = true;
        match self.joint.promise.take_result() {
            Ok(value) => value,
            Err(err) => panic::resume_unwind(err),
        }
    }
}

impl<T> Drop for Suspension<T> {
    fn drop(&mut self) {
        if self.registered || self.taken {
            return;
        }
        match self.joint.promise.mark_detached() {
            Detach::Detached => debug!("suspension dropped before resumption"),
            // SAFETY: We own result now.
            Detach::Completed => unsafe { self.joint.promise.discard() },
        }
    }
}

impl<T> Resumption<T> {
    /// Resumes suspending coroutine.
    ///
    /// Returns false if value was not delivered, either suspension was dropped or other resumption
    /// won.
    pub fn resume(self, value: T) -> bool {
        self.send(value).is_ok()
    }

    /// Sends and wakes peer if not waked.
    ///
    /// Returns value back if it was not delivered, same as [Resumption::resume].
    pub fn send(self, value: T) -> Result<(), T> {
        if !self.joint.claim() {
            return Err(value);
        }
        match self.joint.publish(Ok(value)) {
            Ok(()) => Ok(()),
            Err(Ok(value)) => Err(value),
            Err(Err(_)) => unreachable!("suspension: value published as error"),
        }
    }
}

impl<T> Clone for Resumption<T> {
    fn clone(&self) -> Self {
        self.joint.resumptions.fetch_add(1, Ordering::Relaxed);
        Resumption { joint: self.joint.clone() }
    }
}

impl<T> Drop for Resumption<T> {
    fn drop(&mut self) {
        if self.joint.resumptions.fetch_sub(1, Ordering::AcqRel) == 1 && self.joint.claim() {
            self.joint.publish(Err(Box::new("suspend: no resumption"))).ignore();
        }
    }
}

/// Constructs facilities to suspend a coroutine and resume it from anywhere.
pub fn suspension<T>() -> (Suspension<T>, Resumption<T>) {
    let joint = SuspensionJoint::new();
    let suspension = Suspension { joint: joint.clone(), registered: false, taken: false };
    (suspension, Resumption { joint })
}
