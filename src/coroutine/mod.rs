//! Stackless coroutine frames, their completion protocol and await dispatch.

mod dispatch;
pub(crate) mod frame;
pub(crate) mod promise;
mod suspension;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::Waker;

use static_assertions::{assert_impl_all, assert_not_impl_any};

pub use self::dispatch::{Awaitable, Awaited, Dispatch};
pub use self::suspension::{suspension, Resumption, Suspension};
use crate::error::JoinError;
use crate::executor::ExecutorRef;
use crate::task::{self, JoinHandle, Task};

/// Resumable reference to a suspended coroutine.
///
/// A continuation is resumed at most once as [Continuation::resume] consumes it. A continuation
/// bound to an executor through [Continuation::via] hops to that executor before resuming.
pub struct Continuation {
    waker: Waker,
    executor: Option<ExecutorRef>,
}

assert_impl_all!(Continuation: Send, Sync);
assert_not_impl_any!(Continuation: Clone);

impl Continuation {
    /// Constructs a continuation which resumes by waking given waker on the resuming thread.
    pub fn new(waker: Waker) -> Continuation {
        Continuation { waker, executor: None }
    }

    /// Binds this continuation to given executor so resumption lands there.
    pub fn via(self, executor: ExecutorRef) -> Continuation {
        Continuation { waker: self.waker, executor: Some(executor) }
    }

    /// Returns executor this continuation hops to, if any.
    pub fn executor(&self) -> Option<&ExecutorRef> {
        self.executor.as_ref()
    }

    /// Resumes suspended coroutine.
    pub fn resume(self) {
        match self.executor {
            None => self.waker.wake(),
            Some(executor) => executor.schedule(Continuation::new(self.waker)),
        }
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation").field("executor", &self.executor).finish()
    }
}

/// Coroutine context passed to coroutine body on its first resumption.
///
/// It carries executor the coroutine is bound to, and transforms awaited values so that the
/// coroutine always resumes on that executor.
///
/// Only values awaited through [Co::wait] and its shortcuts are transformed. A plain `.await` in
/// coroutine body resumes it on whatever thread wakes the awaited future, use [Co::via] to stay on
/// bound executor.
#[derive(Clone, Debug)]
pub struct Co {
    executor: ExecutorRef,
}

assert_impl_all!(Co: Send, Sync);

impl Co {
    pub(crate) fn new(executor: ExecutorRef) -> Co {
        Co { executor }
    }

    /// Returns executor this coroutine is bound to.
    pub fn executor(&self) -> &ExecutorRef {
        &self.executor
    }

    /// Transforms awaited value into an awaitable which resumes on bound executor.
    pub fn wait<'a, U: 'a>(&self, awaited: impl Into<Awaited<'a, U>>) -> Dispatch<'a, U> {
        Dispatch::new(awaited.into(), self.executor.clone())
    }

    /// Runs nested task inline on bound executor and waits for its result.
    pub fn run<T: Send + 'static>(&self, task: Task<T>) -> Dispatch<'static, Result<T, JoinError>> {
        self.wait(task)
    }

    /// Waits for peer task which runs independently.
    pub fn join<T: Send + 'static>(&self, handle: JoinHandle<T>) -> Dispatch<'static, Result<T, JoinError>> {
        self.wait(handle)
    }

    /// Waits for future, waking from anywhere resumes coroutine on bound executor.
    pub fn via<'a, F>(&self, future: F) -> Dispatch<'a, F::Output>
    where
        F: Future + Send + 'a,
        F::Output: 'a,
    {
        self.wait(Awaited::future(future))
    }

    /// Same as [Co::via] except that future is borrowed.
    pub fn via_ref<'a, F>(&self, future: Pin<&'a mut F>) -> Dispatch<'a, F::Output>
    where
        F: Future + Send + ?Sized + 'a,
        F::Output: 'a,
    {
        self.wait(Awaited::future_ref(future))
    }

    /// Suspends on given awaitable.
    pub fn suspend_on<'a, A>(&self, awaitable: A) -> Dispatch<'a, A::Output>
    where
        A: Awaitable + 'a,
        A::Output: 'a,
    {
        self.wait(Awaited::awaitable(awaitable))
    }

    /// Spawns peer task on bound executor.
    pub fn spawn<F, Fut, T>(&self, body: F) -> JoinHandle<T>
    where
        F: FnOnce(Co) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        task::task(body).start_on(self.executor.clone())
    }
}
