use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

lazy_static::lazy_static! {
  static ref NEXT_PIPELINE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Configuration for [`consume`](crate::consume).
///
/// ```
/// use futures_backlog::ConsumeOptions;
///
/// let options = ConsumeOptions::new().backlog_size(16).name("ingest");
/// assert_eq!(options.get_backlog_size(), 16);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
  backlog_size: usize,
  name: Option<String>,
}

impl Default for ConsumeOptions {
  fn default() -> Self {
    Self {
      backlog_size: usize::MAX,
      name: None,
    }
  }
}

impl ConsumeOptions {
  pub fn new() -> Self {
    Self::default()
  }

  /// Soft cap on values queued inside the buffering stage but not yet
  /// handed to a worker. Input is gated off while the queue holds more
  /// than `n` values, so the queue can reach `n + 1` at most.
  pub fn backlog_size(mut self, n: usize) -> Self {
    self.backlog_size = n;
    self
  }

  /// Name used in log spans. Defaults to `consume-<id>`.
  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  pub fn get_backlog_size(&self) -> usize {
    self.backlog_size
  }

  pub(crate) fn resolve_name(&self) -> String {
    match &self.name {
      Some(name) => name.clone(),
      None => {
        let id = NEXT_PIPELINE_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
        format!("consume-{}", id)
      }
    }
  }
}
