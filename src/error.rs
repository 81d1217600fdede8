use std::any::Any;
use std::{fmt, panic};

use static_assertions::assert_impl_all;

/// Error captured from a coroutine body, carried opaquely until observed.
pub(crate) type PanicError = Box<dyn Any + Send + 'static>;

/// Wraps panic of a coroutine as [std::error::Error].
pub struct JoinError {
    panicked: PanicError,
}

assert_impl_all!(JoinError: Send);

impl JoinError {
    pub(crate) fn new(err: PanicError) -> Self {
        JoinError { panicked: err }
    }

    fn as_str(&self) -> Option<&str> {
        let panicked = self.panicked.as_ref();
        if let Some(s) = panicked.downcast_ref::<&str>() {
            Some(s)
        } else {
            panicked.downcast_ref::<String>().map(|s| s.as_str())
        }
    }

    /// Converts this error to panicked object.
    pub fn into_panic(self) -> Box<dyn Any + Send + 'static> {
        self.panicked
    }

    /// Resumes the captured panic on current thread.
    pub fn resume_unwind(self) -> ! {
        panic::resume_unwind(self.panicked)
    }
}

impl fmt::Debug for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            None => write!(f, "JoinError::Panic({:?})", self.panicked.as_ref().type_id()),
            Some(s) => write!(f, "JoinError::Panic({:?})", s),
        }
    }
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panic({:?})", self.as_str().unwrap_or(".."))
    }
}

impl std::error::Error for JoinError {}
