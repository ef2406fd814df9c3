//! Single-slot back-pressure: at most one work item in flight per task,
//! with newer inputs displacing older unseen ones rather than queuing
//! (spec.md §4.6/§4.7/§4.8 — "drop-and-replace semantics for non-final
//! inputs").
//!
//! Grounded in the same `ownedWorkItem` vocabulary as
//! [`crate::task::Task`]'s doc comments; factored out because
//! `DecodeImage`, `ProcessImage`, and `Decompress` all need exactly this
//! shape and differ only in what the work function does.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

struct Inner<I> {
    pending: Mutex<Option<I>>,
    busy: AtomicBool,
}

/// Coalesces a stream of submissions down to "run the work function on the
/// most recent input not yet started", one at a time.
pub struct SingleSlot<I> {
    inner: Arc<Inner<I>>,
}

impl<I> Clone for SingleSlot<I> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I: Send + 'static> SingleSlot<I> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(None),
                busy: AtomicBool::new(false),
            }),
        }
    }

    /// Submit `input` for processing via `run`. If a work item is already
    /// in flight, `input` replaces whatever was previously pending
    /// (non-final chunks do not enqueue new work — the latest unseen
    /// buffer is processed once the in-flight one completes). If nothing
    /// is in flight, spawns a drain loop that keeps consuming the pending
    /// slot until it's empty.
    pub fn submit<F, Fut>(&self, input: I, run: F)
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut pending = self.inner.pending.lock().unwrap();
        *pending = Some(input);
        drop(pending);

        if self
            .inner
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let inner = self.inner.clone();
            let run = Arc::new(run);
            tokio::spawn(async move {
                loop {
                    let next = inner.pending.lock().unwrap().take();
                    match next {
                        Some(item) => run(item).await,
                        None => break,
                    }
                }
                inner.busy.store(false, Ordering::SeqCst);
            });
        }
    }
}

impl<I: Send + 'static> Default for SingleSlot<I> {
    fn default() -> Self {
        Self::new()
    }
}
