use std::cell::UnsafeCell;
use std::future::Future;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use tracing::{debug, trace};

use super::promise::{Finalize, Promise};
use super::{Co, Continuation};
use crate::error::PanicError;
use crate::executor::ExecutorRef;

static FRAME_COUNTER: AtomicU64 = AtomicU64::new(1);

// Frame is neither running nor queued for running.
const IDLE: usize = 0;

// Frame is being polled by some thread. At most one thread observes this.
const RUNNING: usize = 1;

// Frame was resumed while running and should be polled again.
const NOTIFIED: usize = 2;

// Body completed, later resumptions are no-op.
const COMPLETED: usize = 3;

pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

type Start<T> = Box<dyn FnOnce(Co) -> BoxFuture<T> + Send>;

enum Body<T> {
    // Initial suspension. Body is constructed once executor is known.
    Suspended(Start<T>),
    Running(BoxFuture<T>),
    Finished,
}

impl<T> Body<T> {
    fn poll(&mut self, executor: Option<&ExecutorRef>, cx: &mut Context<'_>) -> Poll<T> {
        if let Body::Suspended(_) = self {
            let Body::Suspended(start) = mem::replace(self, Body::Finished) else { unreachable!() };
            let executor = match executor {
                Some(executor) => executor.clone(),
                None => panic!("coroutine: resumed with no executor bound"),
            };
            *self = Body::Running(start(Co::new(executor)));
        }
        match self {
            Body::Running(future) => future.as_mut().poll(cx),
            _ => unreachable!("coroutine: poll finished body"),
        }
    }
}

/// Heap frame of a stackless coroutine.
///
/// A frame starts suspended and is resumed through its [Waker] on whatever thread wakes it. Resumed
/// concurrently or reentrantly, it is polled by one thread at a time and repolled once for all
/// missed resumptions.
pub(crate) struct Frame<T> {
    id: u64,
    run: AtomicUsize,
    body: UnsafeCell<Body<T>>,
    promise: Promise<T>,
}

// SAFETY: Body is accessed only by the thread which owns `RUNNING` or the unique owner before start.
unsafe impl<T: Send> Send for Frame<T> {}
unsafe impl<T: Send> Sync for Frame<T> {}

impl<T: Send + 'static> Frame<T> {
    pub fn new<F, Fut>(body: F) -> Arc<Frame<T>>
    where
        F: FnOnce(Co) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let start: Start<T> = Box::new(move |co| Box::pin(body(co)));
        Arc::new(Frame {
            id: FRAME_COUNTER.fetch_add(1, Ordering::Relaxed),
            run: AtomicUsize::new(IDLE),
            body: UnsafeCell::new(Body::Suspended(start)),
            promise: Promise::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn promise(&self) -> &Promise<T> {
        &self.promise
    }

    pub fn executor(&self) -> Option<&ExecutorRef> {
        self.promise.executor()
    }

    /// Binds executor before first resumption.
    ///
    /// # Panics
    /// Panic if frame has been resumed.
    pub fn bind(&self, executor: ExecutorRef) {
        assert!(self.run.load(Ordering::Relaxed) == IDLE, "coroutine: bind executor after started");
        // SAFETY: Caller owns this frame exclusively before start, see `Task`.
        let started = !matches!(unsafe { &*self.body.get() }, Body::Suspended(_));
        assert!(!started, "coroutine: bind executor after started");
        unsafe { self.promise.bind(executor) };
    }

    /// Continuation which resumes this frame on the resuming thread.
    pub fn continuation(self: &Arc<Self>) -> Continuation {
        Continuation::new(Waker::from(self.clone()))
    }

    /// Polls this frame on current thread.
    pub fn resume(self: &Arc<Self>) {
        let mut state = self.run.load(Ordering::Acquire);
        loop {
            let next = match state {
                IDLE => RUNNING,
                RUNNING => NOTIFIED,
                _ => return,
            };
            match self.run.compare_exchange_weak(state, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) if next == RUNNING => break,
                Ok(_) => return,
                Err(current) => state = current,
            }
        }
        trace!(frame = self.id, "coroutine resumed");
        let waker = Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);
        // SAFETY: We own `RUNNING`.
        let body = unsafe { &mut *self.body.get() };
        let result: Result<T, PanicError> = loop {
            let executor = self.promise.executor();
            match panic::catch_unwind(AssertUnwindSafe(|| body.poll(executor, &mut cx))) {
                Ok(Poll::Ready(value)) => break Ok(value),
                Err(err) => break Err(err),
                Ok(Poll::Pending) => {},
            }
            if self.run.compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                return;
            }
            // Resumed while polling, no one else could have changed `NOTIFIED`.
            self.run.store(RUNNING, Ordering::Relaxed);
        };
        // Body locals go before completion is published, as in a returning function.
        let body = mem::replace(body, Body::Finished);
        let result = match panic::catch_unwind(AssertUnwindSafe(move || drop(body))) {
            Ok(()) => result,
            // First failure wins.
            Err(err) if result.is_err() => {
                debug!(frame = self.id, "coroutine panicked while dropping failed body");
                drop(err);
                result
            },
            Err(err) => {
                debug!(frame = self.id, "coroutine panicked while dropping body");
                drop(result);
                Err(err)
            },
        };
        self.run.store(COMPLETED, Ordering::Release);
        self.complete(result);
    }

    fn complete(&self, result: Result<T, PanicError>) {
        self.promise.record(result);
        match self.promise.finalize() {
            Finalize::Resume(continuation) => {
                trace!(frame = self.id, "coroutine completed, resuming awaiter");
                continuation.resume();
            },
            Finalize::Stored => trace!(frame = self.id, "coroutine completed"),
            Finalize::Detached => {
                debug!(frame = self.id, "coroutine completed after detached, discarding result");
                // SAFETY: Finalize tells so.
                unsafe { self.promise.discard() };
            },
        }
    }
}

// Resumes inline. Awaits through `Co` redirect wakeups to bound executor before they get here.
impl<T: Send + 'static> Wake for Frame<T> {
    fn wake(self: Arc<Self>) {
        self.resume();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.resume();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::Poll;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::coroutine::promise::LifecycleState;
    use crate::executor::{InlineExecutor, ManualExecutor};

    struct Yield(bool);

    impl Future for Yield {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.0 {
                return Poll::Ready(());
            }
            self.0 = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }

    #[test]
    fn initial_suspension() {
        let constructed = Arc::new(AtomicUsize::new(0));
        let frame = Frame::new({
            let constructed = constructed.clone();
            move |_| {
                constructed.fetch_add(1, Ordering::Relaxed);
                async { 5 }
            }
        });
        assert_eq!(constructed.load(Ordering::Relaxed), 0);
        frame.bind(InlineExecutor::new());
        frame.resume();
        assert_eq!(constructed.load(Ordering::Relaxed), 1);
        assert_eq!(frame.promise().state(), LifecycleState::HasResult);
        assert_eq!(frame.promise().take_result().unwrap(), 5);
    }

    #[test]
    fn body_sees_bound_executor() {
        let manual = ManualExecutor::new();
        let executor = ExecutorRef::new(manual);
        let frame = Frame::new(|co| async move { co.executor().clone() });
        frame.bind(InlineExecutor::new());
        frame.bind(executor.clone());
        frame.resume();
        assert_eq!(frame.promise().take_result().unwrap(), executor);
    }

    #[test]
    fn reentrant_wake_repolls() {
        let polls = Arc::new(AtomicUsize::new(0));
        let frame = Frame::new({
            let polls = polls.clone();
            move |_| async move {
                polls.fetch_add(1, Ordering::Relaxed);
                Yield(false).await;
                polls.fetch_add(1, Ordering::Relaxed);
            }
        });
        frame.bind(InlineExecutor::new());
        frame.resume();
        assert_eq!(polls.load(Ordering::Relaxed), 2);
        assert_eq!(frame.promise().state(), LifecycleState::HasResult);
    }

    #[test]
    fn panic_captured() {
        let frame = Frame::<()>::new(|_| async { panic!("oooooops") });
        frame.bind(InlineExecutor::new());
        frame.resume();
        let err = frame.promise().take_result().unwrap_err();
        assert_eq!(*err.downcast_ref::<&str>().unwrap(), "oooooops");
    }

    struct PanicOnDrop;

    impl Future for PanicOnDrop {
        type Output = i32;

        fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<i32> {
            Poll::Ready(5)
        }
    }

    impl Drop for PanicOnDrop {
        fn drop(&mut self) {
            panic!("body dropping");
        }
    }

    #[test]
    fn panic_dropping_body_captured() {
        let frame = Frame::new(|_| PanicOnDrop);
        frame.bind(InlineExecutor::new());
        frame.resume();
        let err = frame.promise().take_result().unwrap_err();
        assert_eq!(*err.downcast_ref::<&str>().unwrap(), "body dropping");
    }

    struct Failing;

    impl Future for Failing {
        type Output = i32;

        fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<i32> {
            panic!("body failed");
        }
    }

    impl Drop for Failing {
        fn drop(&mut self) {
            panic!("body dropping");
        }
    }

    #[test]
    fn panic_dropping_failed_body_keeps_first() {
        let frame = Frame::new(|_| Failing);
        frame.bind(InlineExecutor::new());
        frame.resume();
        let err = frame.promise().take_result().unwrap_err();
        assert_eq!(*err.downcast_ref::<&str>().unwrap(), "body failed");
    }

    #[test]
    fn resume_after_completion_is_noop() {
        let frame = Frame::new(|_| async { 1 });
        frame.bind(InlineExecutor::new());
        frame.resume();
        frame.resume();
        assert_eq!(frame.promise().take_result().unwrap(), 1);
    }

    #[test]
    #[should_panic(expected = "coroutine: bind executor after started")]
    fn bind_after_started() {
        let frame = Frame::new(|_| std::future::pending::<()>());
        frame.bind(InlineExecutor::new());
        frame.resume();
        frame.bind(InlineExecutor::new());
    }

    #[test]
    fn unbound_resume_captured() {
        let frame = Frame::new(|_| async { 1 });
        frame.resume();
        let err = frame.promise().take_result().unwrap_err();
        assert!(err.downcast_ref::<&str>().unwrap().contains("no executor bound"));
    }
}
