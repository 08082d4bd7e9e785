use std::any::Any;
use std::error::Error as StdError;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

/// The boxed error type a processing function may return.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors surfaced by [`Waiter::wait`](crate::Waiter::wait).
///
/// Only one of these is ever retained per pipeline: the first worker fault
/// to reach the error slot wins and later faults are dropped.
#[derive(Error, Debug)]
pub enum ConsumeError {
  #[error("processing function failed on worker {worker_id}: {source}")]
  Task {
    worker_id: usize,
    #[source]
    source: BoxError,
  },

  #[error("processing function panicked on worker {worker_id}: {message}")]
  TaskPanicked { worker_id: usize, message: String },
}

impl ConsumeError {
  /// Returns the id of the worker that produced this error.
  pub fn worker_id(&self) -> usize {
    match self {
      ConsumeError::Task { worker_id, .. } | ConsumeError::TaskPanicked { worker_id, .. } => *worker_id,
    }
  }

  /// Returns `true` if the error came from a caught panic.
  pub fn is_panic(&self) -> bool {
    matches!(self, ConsumeError::TaskPanicked { .. })
  }

  pub(crate) fn from_panic(worker_id: usize, payload: Box<dyn Any + Send>) -> Self {
    let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
      (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
      s.clone()
    } else {
      "non-string panic payload".to_string()
    };
    ConsumeError::TaskPanicked { worker_id, message }
  }
}

/// Holds at most one [`ConsumeError`]. First writer wins.
#[derive(Debug, Default)]
pub(crate) struct ErrorSlot {
  slot: Mutex<Option<ConsumeError>>,
}

impl ErrorSlot {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  /// Stores `err` unless the slot is already occupied, in which case `err` is dropped.
  /// Never blocks on the slot's owner; returns whether the write won.
  pub(crate) fn record(&self, err: ConsumeError) -> bool {
    let mut guard = self.slot.lock();
    if guard.is_some() {
      debug!(worker_id = err.worker_id(), "Error slot already occupied, dropping error: {}", err);
      return false;
    }
    warn!(worker_id = err.worker_id(), "Recording first worker error: {}", err);
    *guard = Some(err);
    true
  }

  pub(crate) fn is_set(&self) -> bool {
    self.slot.lock().is_some()
  }

  pub(crate) fn take(&self) -> Option<ConsumeError> {
    self.slot.lock().take()
  }
}
