use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::trace;

/// Counts values that have been accepted but not yet fully processed.
///
/// `wait_idle` resolves once the count is observed at zero.
#[derive(Debug, Default)]
pub(crate) struct CompletionTracker {
  in_flight: AtomicUsize,
  idle: Notify,
}

impl CompletionTracker {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  pub(crate) fn add(&self) {
    self.in_flight.fetch_add(1, Ordering::AcqRel);
  }

  /// Marks one value as finished and wakes every idle waiter on reaching zero.
  pub(crate) fn done(&self) {
    let previous = self.in_flight.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(previous > 0, "completion counter underflow");
    if previous == 1 {
      trace!("Completion counter reached zero, waking waiters.");
      self.idle.notify_waiters();
    }
  }

  /// Counts `value` as in flight until the returned wrapper, or the
  /// ticket split off from it, is dropped.
  pub(crate) fn track<T>(self: &Arc<Self>, value: T) -> Tracked<T> {
    self.add();
    Tracked {
      value,
      ticket: Ticket {
        tracker: self.clone(),
      },
    }
  }

  pub(crate) fn in_flight(&self) -> usize {
    self.in_flight.load(Ordering::Acquire)
  }

  pub(crate) async fn wait_idle(&self) {
    loop {
      let notified = self.idle.notified();
      tokio::pin!(notified);
      // Register before checking so a `done` racing with the load is not missed.
      notified.as_mut().enable();
      if self.in_flight() == 0 {
        return;
      }
      notified.await;
    }
  }
}

/// One unit of the completion counter. Dropping it marks the value done.
#[derive(Debug)]
pub(crate) struct Ticket {
  tracker: Arc<CompletionTracker>,
}

impl Drop for Ticket {
  fn drop(&mut self) {
    self.tracker.done();
  }
}

/// A value travelling from `put` to a worker together with its ticket.
///
/// Wherever the value is dropped on the way (a cancelled or abandoned
/// submission, a failed flush), the count goes with it.
#[derive(Debug)]
pub(crate) struct Tracked<T> {
  value: T,
  ticket: Ticket,
}

impl<T> Tracked<T> {
  pub(crate) fn into_parts(self) -> (T, Ticket) {
    (self.value, self.ticket)
  }
}
