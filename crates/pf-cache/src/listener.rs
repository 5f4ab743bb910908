//! Exactly-once completion callbacks.
//!
//! A [`OnceListener`] is completed with either a value or a single error;
//! completing it twice is impossible by construction. [`CompletionGroup`]
//! joins several child completions into one parent listener.

use parking_lot::Mutex;
use pf_error::{CacheError, Result};
use std::sync::Arc;

type Callback<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// Single-use completion callback.
pub struct OnceListener<T> {
    callback: Option<Callback<T>>,
}

impl<T> OnceListener<T> {
    pub fn new(callback: impl FnOnce(Result<T>) + Send + 'static) -> Self {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    /// Listener that discards its completion.
    #[must_use]
    pub fn noop() -> Self {
        Self { callback: None }
    }

    pub fn complete(mut self, result: Result<T>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }

    pub fn on_response(self, value: T) {
        self.complete(Ok(value));
    }

    pub fn on_failure(self, error: CacheError) {
        self.complete(Err(error));
    }
}

impl<T> std::fmt::Debug for OnceListener<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnceListener")
            .field("armed", &self.callback.is_some())
            .finish()
    }
}

struct GroupState<T> {
    pending: usize,
    listener: Option<OnceListener<T>>,
    value: Option<T>,
}

/// Joins `count` child completions into one listener.
///
/// The parent completes with `value` once every child has responded, or with
/// the first failure as soon as it arrives; late children are ignored after
/// a failure. With `count == 0` the parent completes immediately.
pub struct CompletionGroup;

impl CompletionGroup {
    pub fn split<T: Send + 'static>(
        count: usize,
        value: T,
        listener: OnceListener<T>,
    ) -> Vec<OnceListener<()>> {
        if count == 0 {
            listener.on_response(value);
            return Vec::new();
        }
        let state = Arc::new(Mutex::new(GroupState {
            pending: count,
            listener: Some(listener),
            value: Some(value),
        }));
        (0..count)
            .map(|_| {
                let state = Arc::clone(&state);
                OnceListener::new(move |result: Result<()>| {
                    let mut guard = state.lock();
                    match result {
                        Ok(()) => {
                            guard.pending -= 1;
                            if guard.pending == 0 {
                                if let (Some(listener), Some(value)) =
                                    (guard.listener.take(), guard.value.take())
                                {
                                    drop(guard);
                                    listener.on_response(value);
                                }
                            }
                        }
                        Err(error) => {
                            if let Some(listener) = guard.listener.take() {
                                guard.value = None;
                                drop(guard);
                                listener.on_failure(error);
                            }
                        }
                    }
                })
            })
            .collect()
    }
}
