use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use strum::EnumDiscriminants;
use tracing::trace;

use super::Continuation;
use crate::error::JoinError;
use crate::executor::ExecutorRef;
use crate::task::{JoinHandle, Task};

/// Value which could be suspended on through an explicit register-then-take protocol.
///
/// [Awaitable::take] is called once, either after [Awaitable::is_ready] reports true or after
/// [Awaitable::register] hands continuation back.
pub trait Awaitable: Send {
    type Output;

    /// Checks whether output is available.
    fn is_ready(&self) -> bool;

    /// Registers continuation to be resumed once output is available.
    ///
    /// Returns continuation back if output is available already.
    fn register(&mut self, continuation: Continuation) -> Result<(), Continuation>;

    /// Takes output.
    fn take(&mut self) -> Self::Output;
}

impl<A: Awaitable + ?Sized> Awaitable for Box<A> {
    type Output = A::Output;

    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }

    fn register(&mut self, continuation: Continuation) -> Result<(), Continuation> {
        (**self).register(continuation)
    }

    fn take(&mut self) -> Self::Output {
        (**self).take()
    }
}

type BoxAwaitable<'a, U> = Box<dyn Awaitable<Output = U> + 'a>;

type Launch<'a, U> = Box<dyn FnOnce(&ExecutorRef) -> BoxAwaitable<'a, U> + Send + 'a>;

type BoxFuture<'a, U> = Pin<Box<dyn Future<Output = U> + Send + 'a>>;

#[derive(EnumDiscriminants)]
#[strum_discriminants(name(AwaitKind))]
enum Kind<'a, U> {
    Task(Launch<'a, U>),
    Future(BoxFuture<'a, U>),
    FutureRef(BoxFuture<'a, U>),
    Peer { awaitable: BoxAwaitable<'a, U>, executor: ExecutorRef },
    CurrentExecutor(fn(ExecutorRef) -> U),
    Awaitable(BoxAwaitable<'a, U>),
}

/// Value a coroutine is about to suspend on.
///
/// This is a closed set of nested tasks, future-style values (owned or borrowed), peer tasks,
/// current executor query and generic [Awaitable]s. [super::Co::wait] resolves it into a [Dispatch].
pub struct Awaited<'a, U> {
    kind: Kind<'a, U>,
}

impl<'a, U: 'a> Awaited<'a, U> {
    /// Future-style value, its wakeups are redirected to bound executor.
    pub fn future<F>(future: F) -> Awaited<'a, U>
    where
        F: Future<Output = U> + Send + 'a,
    {
        Awaited { kind: Kind::Future(Box::pin(future)) }
    }

    /// Same as [Awaited::future] except that future is borrowed.
    pub fn future_ref<F>(future: Pin<&'a mut F>) -> Awaited<'a, U>
    where
        F: Future<Output = U> + Send + ?Sized + 'a,
    {
        Awaited { kind: Kind::FutureRef(Box::pin(future)) }
    }

    /// Generic awaitable, resumption is redirected to bound executor.
    pub fn awaitable<A>(awaitable: A) -> Awaited<'a, U>
    where
        A: Awaitable<Output = U> + 'a,
    {
        Awaited { kind: Kind::Awaitable(Box::new(awaitable)) }
    }
}

impl Awaited<'static, ExecutorRef> {
    /// Query for executor the awaiting coroutine is bound to. It never suspends.
    pub fn current_executor() -> Awaited<'static, ExecutorRef> {
        Awaited { kind: Kind::CurrentExecutor(|executor| executor) }
    }
}

impl<'a, T: Send + 'static> From<Task<T>> for Awaited<'a, Result<T, JoinError>> {
    fn from(task: Task<T>) -> Self {
        let launch: Launch<'a, Result<T, JoinError>> =
            Box::new(move |executor: &ExecutorRef| -> BoxAwaitable<'a, Result<T, JoinError>> {
                Box::new(task.launch(executor.clone()))
            });
        Awaited { kind: Kind::Task(launch) }
    }
}

impl<'a, T: Send + 'static> From<JoinHandle<T>> for Awaited<'a, Result<T, JoinError>> {
    fn from(handle: JoinHandle<T>) -> Self {
        let executor = handle.executor().clone();
        Awaited { kind: Kind::Peer { awaitable: Box::new(handle), executor } }
    }
}

// Redirects wakeups of a future to an executor.
struct ViaWaker {
    executor: ExecutorRef,
    waker: Waker,
}

impl Wake for ViaWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        Continuation::new(self.waker.clone()).via(self.executor.clone()).resume();
    }
}

enum State<'a, U> {
    Ready(Option<U>),
    Launch(Launch<'a, U>),
    Attach {
        awaitable: BoxAwaitable<'a, U>,
        // Hop to bound executor on resumption.
        hop: bool,
        registered: bool,
    },
    Future {
        future: BoxFuture<'a, U>,
        // Awaiting coroutine's waker and the redirecting one built from it.
        wakers: Option<(Waker, Waker)>,
    },
    Done,
}

/// Awaitable produced by [super::Co::wait].
///
/// Awaiting it resumes the coroutine on executor it is bound to, no matter which thread completes
/// the awaited operation.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Dispatch<'a, U> {
    executor: ExecutorRef,
    state: State<'a, U>,
}

// Output is never pinned.
impl<U> Unpin for Dispatch<'_, U> {}

impl<'a, U: 'a> Dispatch<'a, U> {
    pub(super) fn new(awaited: Awaited<'a, U>, executor: ExecutorRef) -> Dispatch<'a, U> {
        let kind = AwaitKind::from(&awaited.kind);
        let state = match awaited.kind {
            Kind::Task(launch) => State::Launch(launch),
            Kind::Future(future) | Kind::FutureRef(future) => State::Future { future, wakers: None },
            Kind::Peer { awaitable, executor: peer } => {
                State::Attach { awaitable, hop: peer != executor, registered: false }
            },
            Kind::CurrentExecutor(f) => State::Ready(Some(f(executor.clone()))),
            Kind::Awaitable(awaitable) => State::Attach { awaitable, hop: true, registered: false },
        };
        trace!(?kind, ?executor, hop = matches!(state, State::Attach { hop: true, .. }), "dispatch awaited value");
        Dispatch { executor, state }
    }

    fn via_waker(executor: &ExecutorRef, wakers: &mut Option<(Waker, Waker)>, waker: &Waker) -> Waker {
        if let Some((outer, via)) = wakers {
            if outer.will_wake(waker) {
                return via.clone();
            }
        }
        let via = Waker::from(Arc::new(ViaWaker { executor: executor.clone(), waker: waker.clone() }));
        *wakers = Some((waker.clone(), via.clone()));
        via
    }
}

impl<'a, U: 'a> Future for Dispatch<'a, U> {
    type Output = U;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<U> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                State::Ready(value) => match value.take() {
                    Some(value) => {
                        this.state = State::Done;
                        return Poll::Ready(value);
                    },
                    None => unreachable!(),
                },
                State::Launch(_) => {
                    let State::Launch(launch) = std::mem::replace(&mut this.state, State::Done) else {
                        unreachable!()
                    };
                    let awaitable = launch(&this.executor);
                    this.state = State::Attach { awaitable, hop: false, registered: false };
                },
                State::Attach { awaitable, hop, registered } => {
                    if !*registered && !awaitable.is_ready() {
                        let continuation = Continuation::new(cx.waker().clone());
                        let continuation =
                            if *hop { continuation.via(this.executor.clone()) } else { continuation };
                        *registered = true;
                        if awaitable.register(continuation).is_ok() {
                            return Poll::Pending;
                        }
                    } else if *registered && !awaitable.is_ready() {
                        return Poll::Pending;
                    }
                    let value = awaitable.take();
                    this.state = State::Done;
                    return Poll::Ready(value);
                },
                State::Future { future, wakers } => {
                    let waker = Self::via_waker(&this.executor, wakers, cx.waker());
                    let mut context = Context::from_waker(&waker);
                    let value = match future.as_mut().poll(&mut context) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(value) => value,
                    };
                    this.state = State::Done;
                    return Poll::Ready(value);
                },
                State::Done => panic!("`Dispatch` polled after completion"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::coroutine::{suspension, Co};
    use crate::executor::{ExecutorRef, InlineExecutor, ManualExecutor};
    use crate::task::{self, Task};

    fn run<T: Send + 'static>(manual: &Arc<ManualExecutor>, task: Task<T>) -> JoinHandle<T> {
        let handle = task.start_on(ExecutorRef::new(manual.clone()));
        manual.run_until_idle();
        handle
    }

    #[test]
    fn current_executor_is_ready() {
        let manual = ManualExecutor::new();
        let executor = ExecutorRef::new(manual.clone());
        let handle = run(&manual, task::task(|co: Co| async move { co.wait(Awaited::current_executor()).await }));
        assert_eq!(handle.join().unwrap(), executor);
        assert_eq!(manual.scheduled(), 1);
    }

    #[test]
    fn nested_task_runs_inline() {
        let manual = ManualExecutor::new();
        let handle = run(
            &manual,
            task::task(|co: Co| async move {
                let nested = task::task(|co: Co| async move { co.executor().clone() });
                let executor = co.run(nested).await.unwrap();
                (executor == *co.executor(), 5)
            }),
        );
        assert_eq!(handle.join().unwrap(), (true, 5));
        // Only the initial scheduling of outer task.
        assert_eq!(manual.scheduled(), 1);
    }

    #[test]
    fn nested_task_panic_resurfaced() {
        let manual = ManualExecutor::new();
        let handle = run(
            &manual,
            task::task(|co: Co| async move {
                let nested = task::task(|_| async { panic!("nested oooooops") });
                let err: JoinError = co.run::<()>(nested).await.unwrap_err();
                err.to_string()
            }),
        );
        assert!(handle.join().unwrap().contains("nested oooooops"));
    }

    #[test]
    fn peer_on_same_executor_attaches_directly() {
        let manual = ManualExecutor::new();
        let (suspension, resumption) = suspension::<i32>();
        let handle = run(
            &manual,
            task::task(move |co: Co| async move {
                let peer = co.spawn(move |co: Co| async move { co.suspend_on(suspension).await });
                co.join(peer).await.unwrap()
            }),
        );
        // outer, peer
        assert_eq!(manual.scheduled(), 2);
        resumption.resume(7);
        // peer hops back to its executor, then resumes outer inline
        assert_eq!(manual.run_until_idle(), 1);
        assert_eq!(manual.scheduled(), 3);
        assert_eq!(handle.join().unwrap(), 7);
    }

    #[test]
    fn peer_on_other_executor_hops_once() {
        let manual = ManualExecutor::new();
        let other = ManualExecutor::new();
        let peer = task::task(|_| async { 9 }).start_on(ExecutorRef::new(other.clone()));
        let handle = run(&manual, task::task(move |co: Co| async move { co.join(peer).await.unwrap() }));
        assert_eq!(manual.scheduled(), 1);
        assert_eq!(other.run_until_idle(), 1);
        // Completion hops to awaiting coroutine's executor.
        assert_eq!(handle.is_finished(), false);
        assert_eq!(manual.run_until_idle(), 1);
        assert_eq!(manual.scheduled(), 2);
        assert_eq!(handle.join().unwrap(), 9);
    }

    #[test]
    fn completed_peer_takes_fast_path() {
        let manual = ManualExecutor::new();
        let other = ManualExecutor::new();
        let peer = task::task(|_| async { 9 }).start_on(ExecutorRef::new(other.clone()));
        other.run_until_idle();
        let handle = run(&manual, task::task(move |co: Co| async move { co.join(peer).await.unwrap() }));
        assert_eq!(manual.scheduled(), 1);
        assert_eq!(handle.join().unwrap(), 9);
    }

    struct Signal {
        fired: AtomicBool,
        waker: Mutex<Option<Waker>>,
    }

    impl Signal {
        fn fire(&self) {
            self.fired.store(true, Ordering::Release);
            if let Some(waker) = self.waker.lock().unwrap().take() {
                waker.wake();
            }
        }
    }

    impl Future for &Signal {
        type Output = ();

        fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            *self.waker.lock().unwrap() = Some(cx.waker().clone());
            if self.fired.load(Ordering::Acquire) {
                return Poll::Ready(());
            }
            Poll::Pending
        }
    }

    #[test]
    fn future_rebound_to_executor() {
        let manual = ManualExecutor::new();
        let signal = Arc::new(Signal { fired: AtomicBool::new(false), waker: Mutex::new(None) });
        let handle = run(
            &manual,
            task::task({
                let signal = signal.clone();
                move |co: Co| async move { co.via(&*signal).await }
            }),
        );
        thread::spawn({
            let signal = signal.clone();
            move || signal.fire()
        })
        .join()
        .unwrap();
        assert_eq!(handle.is_finished(), false);
        assert_eq!(manual.run_until_idle(), 1);
        handle.join().unwrap();
    }

    #[test]
    fn plain_await_resumes_on_waking_thread() {
        let manual = ManualExecutor::new();
        let signal = Arc::new(Signal { fired: AtomicBool::new(false), waker: Mutex::new(None) });
        let handle = run(
            &manual,
            task::task({
                let signal = signal.clone();
                move |_| async move {
                    (&*signal).await;
                    thread::current().id()
                }
            }),
        );
        let waking = thread::spawn({
            let signal = signal.clone();
            move || {
                signal.fire();
                thread::current().id()
            }
        })
        .join()
        .unwrap();
        // No hop through bound executor.
        assert_eq!(handle.is_finished(), true);
        assert_eq!(manual.scheduled(), 1);
        assert_eq!(handle.join().unwrap(), waking);
    }

    #[test]
    fn borrowed_future() {
        let executor = InlineExecutor::new();
        let handle = task::task(|co: Co| async move {
            let mut future = Box::pin(async { 3 });
            let three = co.via_ref(future.as_mut()).await;
            three + co.wait(Awaited::future(async { 4 })).await
        })
        .start_on(executor);
        assert_eq!(handle.join().unwrap(), 7);
    }

    #[test]
    fn awaitable_resumed_on_executor() {
        let manual = ManualExecutor::new();
        let (suspension, resumption) = suspension::<&'static str>();
        let handle = run(&manual, task::task(move |co: Co| async move { co.suspend_on(suspension).await }));
        thread::spawn(move || resumption.resume("resumed")).join().unwrap();
        assert_eq!(handle.is_finished(), false);
        assert_eq!(manual.run_until_idle(), 1);
        assert_eq!(handle.join().unwrap(), "resumed");
    }

    #[test]
    fn await_kinds() {
        let executor = InlineExecutor::new();
        let task: Awaited<'_, Result<(), JoinError>> = task::task(|_| async {}).into();
        assert_eq!(AwaitKind::from(&task.kind), AwaitKind::Task);
        let peer: Awaited<'_, Result<(), JoinError>> = task::task(|_| async {}).start_on(executor).into();
        assert_eq!(AwaitKind::from(&peer.kind), AwaitKind::Peer);
        assert_eq!(AwaitKind::from(&Awaited::current_executor().kind), AwaitKind::CurrentExecutor);
        assert_eq!(AwaitKind::from(&Awaited::future(async {}).kind), AwaitKind::Future);
    }
}
