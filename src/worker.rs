use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{error, info, trace};

use crate::error::{BoxError, ConsumeError, ErrorSlot};
use crate::tracker::Tracked;

/// State each worker needs besides the processing function.
pub(crate) struct WorkerContext<T> {
  pub(crate) name: Arc<String>,
  pub(crate) worker_id: usize,
  /// Receiving half of the stage output. Every worker holds a clone.
  pub(crate) output: flume::Receiver<Tracked<T>>,
  pub(crate) errors: Arc<ErrorSlot>,
}

/// Pulls values until the stage closes its output, running `f` on each.
///
/// Errors and panics from `f` go to the error slot; neither ends the loop.
pub(crate) async fn run_worker<T, F, Fut, E>(ctx: WorkerContext<T>, f: Arc<F>)
where
  T: Send + 'static,
  F: Fn(usize, T) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<(), E>> + Send,
  E: Into<BoxError>,
{
  let WorkerContext {
    name,
    worker_id,
    output,
    errors,
  } = ctx;
  trace!(name = %*name, worker_id, "Worker started.");
  let mut processed = 0usize;

  while let Ok(job) = output.recv_async().await {
    let (value, ticket) = job.into_parts();

    // The closure call itself sits inside the async block so a panic raised
    // before the first await is caught as well.
    let outcome = AssertUnwindSafe(async { f(worker_id, value).await })
      .catch_unwind()
      .await;

    match outcome {
      Ok(Ok(())) => trace!(name = %*name, worker_id, "Value processed."),
      Ok(Err(source)) => {
        errors.record(ConsumeError::Task {
          worker_id,
          source: source.into(),
        });
      }
      Err(payload) => {
        error!(name = %*name, worker_id, "Processing function panicked.");
        errors.record(ConsumeError::from_panic(worker_id, payload));
      }
    }

    processed += 1;
    // The error, if any, is recorded before the value stops counting.
    drop(ticket);
  }

  info!(name = %*name, worker_id, processed, "Worker stopped, output closed.");
}
