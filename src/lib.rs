#![allow(clippy::needless_doctest_main)]

//! # Stackless coroutine runtime with executor affinity
//! `unstuck` runs coroutines written as `async` bodies on [executor::Executor]s. Every coroutine is
//! bound to one executor and, whatever it awaits, resumes on that executor.
//!
//! ## Usage
//! Construct an [runtime::Runtime] to [runtime::Runtime::spawn] or [runtime::Runtime::block_on]
//! initial coroutine.
//!
//! ### Task
//! * Use [task()] to construct a lazily started coroutine.
//! * Use [Co::run] to run it inline inside current coroutine.
//! * Use [task::Task::start_on] or [Co::spawn] to start it independently, and [Co::join] or
//!   [task::JoinHandle::join] to join its result. Dropping [task::JoinHandle] detaches it.
//!
//! ### Coroutine
//! * Use [Co::wait] to await anything listed in [coroutine::Awaited].
//! * Use [Co::via] to await plain futures, they are woken onto bound executor. A plain `.await`
//!   resumes coroutine on the thread which wakes it, not necessarily bound executor.
//! * Use [coroutine::suspension] to create facilities to resume suspending coroutine from anywhere.
//!
//! ## Example
//! ```rust
//! use unstuck::runtime::Builder;
//! use unstuck::{coroutine, task, Co};
//!
//! #[unstuck::main]
//! async fn main(co: Co) {
//!     let compute = Builder::default().name("compute").parallelism(2).build();
//!     let (suspension, resumption) = coroutine::suspension::<i32>();
//!
//!     let peer = compute.spawn(move |co: Co| async move {
//!         let value = co.suspend_on(suspension).await;
//!         value * 2
//!     });
//!     std::thread::spawn(move || resumption.resume(3));
//!
//!     let doubled = co.join(peer).await.unwrap();
//!     let sum = co.run(task(move |_| async move { doubled + 4 })).await.unwrap();
//!     assert_eq!(sum, 10);
//! }
//! ```

pub mod coroutine;
mod error;
pub mod executor;
pub mod runtime;
pub mod task;

pub use coroutine::Co;
pub use error::JoinError;
pub use task::task;
#[cfg(not(test))]
pub use unstuck_macros::main;
pub use unstuck_macros::test;
