use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::sync::mpsc;
use tracing::warn;

type MainJob = Box<dyn FnOnce(&MainToken) + Send + 'static>;

/// Proof of executing on the designated context.
///
/// Only [`MainContextDriver`] mints tokens, and the type is `!Send`, so a
/// token can never leave the designated thread. State that must only be
/// mutated on that thread should take `&MainToken` as a parameter; presenting
/// one then becomes a checked precondition instead of a runtime diagnostic.
pub struct MainToken {
    _not_send: PhantomData<*const ()>,
}

/// Submission side of the designated-context queue. Cloneable, usable from
/// any thread.
///
/// This is the degenerate serial case of [`TaskQueue`]: one slot, no
/// suspension, no cancellation. Work runs on whichever thread drives the
/// matching [`MainContextDriver`], in submission order.
///
/// [`TaskQueue`]: crate::queue::TaskQueue
#[derive(Clone)]
pub struct MainContext {
    tx: mpsc::UnboundedSender<MainJob>,
}

/// Drain side of the designated-context queue. Held by the one thread that
/// acts as the designated context.
pub struct MainContextDriver {
    rx: mpsc::UnboundedReceiver<MainJob>,
}

impl MainContext {
    pub fn new() -> (MainContext, MainContextDriver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MainContext { tx }, MainContextDriver { rx })
    }

    /// Enqueue work to run on the designated context. Always succeeds; if the
    /// driver is gone the work is dropped with a warning.
    pub fn submit<F>(&self, work: F)
    where
        F: FnOnce(&MainToken) + Send + 'static,
    {
        if self.tx.send(Box::new(work)).is_err() {
            warn!("Main context driver is gone, dropping submitted work");
        }
    }
}

impl MainContextDriver {
    /// Claim the calling thread as the designated context and drain work
    /// until every [`MainContext`] handle has been dropped.
    ///
    /// Must not be called from inside an async runtime; the designated
    /// context is expected to be a plain thread (typically the process main
    /// thread).
    pub fn run(mut self) {
        let token = MainToken {
            _not_send: PhantomData,
        };
        while let Some(job) = self.rx.blocking_recv() {
            dispatch(job, &token);
        }
    }

    /// Drain the work queued so far, then return. For callers that interleave
    /// the designated context with their own loop.
    pub fn run_until_idle(&mut self) {
        let token = MainToken {
            _not_send: PhantomData,
        };
        while let Ok(job) = self.rx.try_recv() {
            dispatch(job, &token);
        }
    }
}

// A panicking job must not take the designated thread down with it.
fn dispatch(job: MainJob, token: &MainToken) {
    if catch_unwind(AssertUnwindSafe(|| job(token))).is_err() {
        warn!("Main context task panicked");
    }
}
