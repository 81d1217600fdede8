//! Handles to coroutine frames.
//!
//! * [Task] is a move-only handle to a coroutine which has not started yet. It either runs inline
//!   inside an awaiting coroutine through [Co::run], sharing its executor, or is started on an
//!   executor through [Task::start_on].
//! * [JoinHandle] is a handle to a started coroutine. It could be awaited by another coroutine
//!   through [Co::join], joined from a plain thread, or dropped to detach the coroutine.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::task::{Wake, Waker};
use std::thread;

use static_assertions::{assert_impl_all, assert_not_impl_any};
use tracing::debug;

use crate::coroutine::frame::Frame;
use crate::coroutine::promise::Detach;
use crate::coroutine::{Awaitable, Co, Continuation};
use crate::error::JoinError;
use crate::executor::ExecutorRef;

/// Constructs a coroutine from given body.
///
/// The coroutine is initially suspended, `body` is not called until the coroutine is resumed the
/// first time, at which point it receives a [Co] bound to the coroutine's executor.
pub fn task<F, Fut, T>(body: F) -> Task<T>
where
    F: FnOnce(Co) -> Fut + Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    Task { frame: Frame::new(body) }
}

/// Move-only handle to a coroutine which has not started.
///
/// Dropping it drops the coroutine without running it.
pub struct Task<T: Send + 'static> {
    frame: Arc<Frame<T>>,
}

assert_impl_all!(Task<()>: Send);
assert_not_impl_any!(Task<()>: Clone);

impl<T: Send + 'static> Task<T> {
    /// Returns bound executor.
    pub fn executor(&self) -> Option<&ExecutorRef> {
        self.frame.executor()
    }

    /// Binds executor this task will run on, replacing the previous one.
    pub fn bind(&mut self, executor: ExecutorRef) -> &mut Self {
        self.frame.bind(executor);
        self
    }

    /// Schedules this task on given executor.
    pub fn start_on(self, executor: ExecutorRef) -> JoinHandle<T> {
        self.frame.bind(executor.clone());
        executor.schedule(self.frame.continuation());
        JoinHandle::new(self.frame)
    }

    /// Schedules this task on bound executor.
    ///
    /// # Panics
    /// Panic if no executor bound.
    pub fn start(self) -> JoinHandle<T> {
        match self.frame.executor().cloned() {
            Some(executor) => self.start_on(executor),
            None => panic!("task: no executor bound"),
        }
    }

    // Runs this task on current thread till its first suspension.
    pub(crate) fn launch(self, executor: ExecutorRef) -> JoinHandle<T> {
        self.frame.bind(executor);
        self.frame.resume();
        JoinHandle::new(self.frame)
    }
}

impl<T: Send + 'static> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("id", &self.frame.id()).field("executor", &self.executor()).finish()
    }
}

struct Parker {
    thread: thread::Thread,
}

impl Wake for Parker {
    fn wake(self: Arc<Self>) {
        self.thread.unpark();
    }
}

/// Handle to a started coroutine.
///
/// Dropping it before consuming the result detaches the coroutine: it keeps running, and its result
/// is discarded once it completes.
pub struct JoinHandle<T: Send + 'static> {
    frame: Option<Arc<Frame<T>>>,
    registered: bool,
}

assert_impl_all!(JoinHandle<()>: Send);
assert_not_impl_any!(JoinHandle<()>: Clone);

impl<T: Send + 'static> JoinHandle<T> {
    fn new(frame: Arc<Frame<T>>) -> JoinHandle<T> {
        JoinHandle { frame: Some(frame), registered: false }
    }

    fn frame(&self) -> &Arc<Frame<T>> {
        match self.frame.as_ref() {
            Some(frame) => frame,
            None => panic!("JoinHandle: already consumed"),
        }
    }

    /// Returns executor the coroutine is bound to.
    pub fn executor(&self) -> &ExecutorRef {
        match self.frame().executor() {
            Some(executor) => executor,
            None => unreachable!("JoinHandle: coroutine started with no executor"),
        }
    }

    /// Checks whether the coroutine has completed.
    pub fn is_finished(&self) -> bool {
        self.frame().promise().is_complete()
    }

    /// Blocks current thread until the coroutine completes and returns its result.
    ///
    /// This must not be called from coroutine, use [Co::join] instead.
    pub fn join(mut self) -> Result<T, JoinError> {
        let frame = self.frame().clone();
        if !frame.promise().is_complete() {
            let parker = Arc::new(Parker { thread: thread::current() });
            self.registered = true;
            if frame.promise().register_awaiter(Continuation::new(Waker::from(parker))).is_ok() {
                while !frame.promise().is_complete() {
                    thread::park();
                }
            }
        }
        self.consume()
    }

    fn consume(&mut self) -> Result<T, JoinError> {
        match self.frame.take() {
            Some(frame) => frame.promise().take_result().map_err(JoinError::new),
            None => panic!("JoinHandle: already consumed"),
        }
    }
}

impl<T: Send + 'static> Awaitable for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn is_ready(&self) -> bool {
        self.frame().promise().is_complete()
    }

    fn register(&mut self, continuation: Continuation) -> Result<(), Continuation> {
        self.registered = true;
        self.frame().promise().register_awaiter(continuation)
    }

    fn take(&mut self) -> Self::Output {
        self.consume()
    }
}

impl<T: Send + 'static> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        let Some(frame) = self.frame.take() else {
            return;
        };
        // Awaiter registered, result goes with frame.
        if self.registered {
            return;
        }
        match frame.promise().mark_detached() {
            Detach::Detached => debug!(frame = frame.id(), "coroutine detached"),
            // SAFETY: We own result now.
            Detach::Completed => unsafe { frame.promise().discard() },
        }
    }
}

impl<T: Send + 'static> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.frame.as_ref() {
            None => f.write_str("JoinHandle(consumed)"),
            Some(frame) => f
                .debug_struct("JoinHandle")
                .field("id", &frame.id())
                .field("executor", &frame.executor())
                .field("finished", &frame.promise().is_complete())
                .finish(),
        }
    }
}
