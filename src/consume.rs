use std::fmt;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, trace, Instrument};

use crate::error::{BoxError, ConsumeError, ErrorSlot};
use crate::options::ConsumeOptions;
use crate::stage::{BufferingStage, StageGauges};
use crate::tracker::{CompletionTracker, Tracked};
use crate::worker::{run_worker, WorkerContext};

struct Shared<T: Send + 'static> {
  name: Arc<String>,
  token: CancellationToken,
  /// `None` once the submission side has been closed.
  input: RwLock<Option<flume::Sender<Tracked<T>>>>,
  tracker: Arc<CompletionTracker>,
  errors: Arc<ErrorSlot>,
  tasks: TaskTracker,
  gauges: Arc<StageGauges>,
}

impl<T: Send + 'static> Shared<T> {
  async fn close_input(&self) {
    let mut input = self.input.write().await;
    if input.take().is_some() {
      info!(name = %*self.name, "Submission side closed.");
    }
  }
}

/// Submission half returned by [`consume`]. Cheap to clone.
pub struct Putter<T: Send + 'static> {
  shared: Arc<Shared<T>>,
}

/// Drain half returned by [`consume`]. Cheap to clone.
pub struct Waiter<T: Send + 'static> {
  shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Clone for Putter<T> {
  fn clone(&self) -> Self {
    Self {
      shared: self.shared.clone(),
    }
  }
}

impl<T: Send + 'static> Clone for Waiter<T> {
  fn clone(&self) -> Self {
    Self {
      shared: self.shared.clone(),
    }
  }
}

impl<T: Send + 'static> fmt::Debug for Putter<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Putter").field("name", &self.shared.name).finish_non_exhaustive()
  }
}

impl<T: Send + 'static> fmt::Debug for Waiter<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Waiter")
      .field("name", &self.shared.name)
      .field("in_flight", &self.in_flight())
      .field("queued", &self.queued())
      .finish_non_exhaustive()
  }
}

/// Starts a buffering stage and `num_workers` workers that run `f` on every
/// value submitted through the returned [`Putter`].
///
/// `f` receives the id of the worker running it (`0..num_workers`) and the
/// value. A worker count of zero is treated as one. Must be called from
/// within a Tokio runtime.
///
/// Firing `token` stops new submissions but everything already accepted is
/// still handed to `f`.
///
/// ```
/// use futures_backlog::{consume, ConsumeOptions};
/// use std::sync::atomic::{AtomicU64, Ordering};
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() {
/// let sum = Arc::new(AtomicU64::new(0));
/// let acc = sum.clone();
/// let (put, wait) = consume(
///   CancellationToken::new(),
///   4,
///   move |_worker, v: u64| {
///     let acc = acc.clone();
///     async move {
///       acc.fetch_add(v, Ordering::SeqCst);
///       Ok::<(), std::io::Error>(())
///     }
///   },
///   ConsumeOptions::new().backlog_size(8),
/// );
///
/// for v in 1..=10 {
///   assert!(put.put(v).await);
/// }
/// wait.wait(true).await.unwrap();
/// assert_eq!(sum.load(Ordering::SeqCst), 55);
/// # }
/// ```
pub fn consume<T, F, Fut, E>(
  token: CancellationToken,
  num_workers: usize,
  f: F,
  options: ConsumeOptions,
) -> (Putter<T>, Waiter<T>)
where
  T: Send + 'static,
  F: Fn(usize, T) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<(), E>> + Send + 'static,
  E: Into<BoxError> + 'static,
{
  let name = Arc::new(options.resolve_name());
  let num_workers = num_workers.max(1);
  // Rendezvous on both sides: a value always has exactly one holder.
  let (in_tx, in_rx) = flume::bounded::<Tracked<T>>(0);
  let (out_tx, out_rx) = flume::bounded::<Tracked<T>>(0);

  let tracker = Arc::new(CompletionTracker::new());
  let errors = Arc::new(ErrorSlot::new());
  let gauges = Arc::new(StageGauges::default());
  let tasks = TaskTracker::new();

  info!(
    name = %*name,
    num_workers,
    backlog_size = options.get_backlog_size(),
    "Starting consume pipeline."
  );

  let stage = BufferingStage::new(
    name.clone(),
    options.get_backlog_size(),
    in_rx,
    out_tx,
    token.clone(),
    gauges.clone(),
  );
  tasks.spawn(stage.run().instrument(info_span!("consume_stage", name = %*name)));

  let f = Arc::new(f);
  for worker_id in 0..num_workers {
    let ctx = WorkerContext {
      name: name.clone(),
      worker_id,
      output: out_rx.clone(),
      errors: errors.clone(),
    };
    tasks.spawn(
      run_worker(ctx, f.clone()).instrument(info_span!("consume_worker", name = %*name, worker_id)),
    );
  }

  let shared = Arc::new(Shared {
    name,
    token,
    input: RwLock::new(Some(in_tx)),
    tracker,
    errors,
    tasks,
    gauges,
  });

  (
    Putter {
      shared: shared.clone(),
    },
    Waiter { shared },
  )
}

impl<T: Send + 'static> Putter<T> {
  /// Submits `value`, waiting while the backlog is full.
  ///
  /// Returns `false` without accepting the value if the submission side is
  /// closed, the token has fired, or a worker has already failed and its
  /// error has not yet been collected by [`Waiter::wait`].
  ///
  /// Dropping the returned future before it completes abandons the value;
  /// it is then not counted as in flight.
  pub async fn put(&self, value: T) -> bool {
    let shared = &*self.shared;
    if shared.token.is_cancelled() {
      trace!(name = %*shared.name, "Put rejected: cancelled.");
      return false;
    }

    let input = shared.input.read().await;
    let Some(tx) = input.as_ref() else {
      trace!(name = %*shared.name, "Put rejected: submission closed.");
      return false;
    };

    if shared.errors.is_set() {
      debug!(name = %*shared.name, "Put rejected: a worker error is pending.");
      return false;
    }

    // Counted from here on. If the value never reaches a worker, its
    // ticket is dropped with it and the count is given back.
    let job = shared.tracker.track(value);
    let accepted = tokio::select! {
      biased;
      sent = tx.send_async(job) => sent.is_ok(),
      _ = shared.token.cancelled() => false,
    };
    if !accepted {
      trace!(name = %*shared.name, "Put rejected: cancelled or stage gone.");
    }
    accepted
  }

  /// Returns `true` once [`Waiter::wait`] has been called with `close_first`.
  pub async fn is_closed(&self) -> bool {
    self.shared.input.read().await.is_none()
  }

  pub fn name(&self) -> &str {
    &self.shared.name
  }
}

impl<T: Send + 'static> Waiter<T> {
  /// Waits for accepted values to be processed and returns the recorded
  /// worker error, if any.
  ///
  /// With `close_first`, the submission side is closed and this waits for
  /// the stage and every worker to exit. Without it, this only waits for
  /// the values currently in flight and the pipeline stays open, so it can
  /// be used as a repeated barrier. Safe to call concurrently.
  pub async fn wait(&self, close_first: bool) -> Result<(), ConsumeError> {
    let shared = &*self.shared;

    if close_first {
      shared.close_input().await;
      shared.tasks.close();
      shared.tasks.wait().await;
      debug!(name = %*shared.name, "Stage and workers have exited.");
    }

    shared.tracker.wait_idle().await;

    match shared.errors.take() {
      Some(err) => Err(err),
      None => Ok(()),
    }
  }

  /// Values accepted by `put` that a worker has not finished with yet.
  pub fn in_flight(&self) -> usize {
    self.shared.tracker.in_flight()
  }

  /// `true` while a worker error is recorded and not yet returned by `wait`.
  /// `Putter::put` rejects values during that time.
  pub fn failed(&self) -> bool {
    self.shared.errors.is_set()
  }

  /// Values held in the stage backlog, not yet handed to a worker.
  /// Never more than the backlog size plus one.
  pub fn queued(&self) -> usize {
    self.shared.gauges.queued.load(Ordering::Acquire)
  }

  /// Values the stage passed straight to an idle worker without queueing.
  pub fn direct_handoffs(&self) -> usize {
    self.shared.gauges.direct_handoffs.load(Ordering::Relaxed)
  }

  pub fn name(&self) -> &str {
    &self.shared.name
  }
}
