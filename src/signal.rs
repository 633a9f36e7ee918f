//! Notification that a required pyramid does not exist yet.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

/// Raised when a pyramid is required but absent.
///
/// A listener that can arrange for the pyramid to appear (for example by
/// queueing its generation) calls [MissingPyramidSignal::set_retry]; the
/// requester then backs off and looks again instead of failing.
#[derive(Debug)]
pub struct MissingPyramidSignal {
    image_id: u64,
    attempted_path: PathBuf,
    retry: AtomicBool,
}

impl MissingPyramidSignal {
    pub fn new(image_id: u64, attempted_path: impl Into<PathBuf>) -> Self {
        Self {
            image_id,
            attempted_path: attempted_path.into(),
            retry: AtomicBool::new(false),
        }
    }

    pub fn image_id(&self) -> u64 {
        self.image_id
    }

    pub fn attempted_path(&self) -> &Path {
        &self.attempted_path
    }

    pub fn set_retry(&self) {
        self.retry.store(true, Ordering::SeqCst);
    }

    pub fn is_retry(&self) -> bool {
        self.retry.load(Ordering::SeqCst)
    }
}

pub trait MissingPyramidListener: Send + Sync {
    fn on_missing_pyramid(&self, signal: &MissingPyramidSignal);
}

impl<F> MissingPyramidListener for F
where
    F: Fn(&MissingPyramidSignal) + Send + Sync,
{
    fn on_missing_pyramid(&self, signal: &MissingPyramidSignal) {
        self(signal)
    }
}

/// The listeners a service publishes signals to. May be empty.
#[derive(Clone, Default)]
pub struct SignalBus {
    listeners: Vec<Arc<dyn MissingPyramidListener>>,
}

impl fmt::Debug for SignalBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalBus")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl SignalBus {
    pub fn subscribe(&mut self, listener: Arc<dyn MissingPyramidListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Deliver `signal` to every listener, returning whether any asked for a retry.
    pub fn publish(&self, signal: &MissingPyramidSignal) -> bool {
        for listener in &self.listeners {
            listener.on_missing_pyramid(signal);
        }
        signal.is_retry()
    }
}
