use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

/// An in-progress offer of the backlog's front value to the workers.
type Dispatch<M> = Pin<Box<dyn Future<Output = Result<(), flume::SendError<M>>> + Send>>;

/// Counters the stage publishes for observers outside its task.
#[derive(Debug, Default)]
pub(crate) struct StageGauges {
  /// Accepted values not yet taken by a worker, including the one on offer.
  pub(crate) queued: AtomicUsize,
  /// Values handed straight to an idle worker without being queued.
  pub(crate) direct_handoffs: AtomicUsize,
}

enum Event<M> {
  Cancelled,
  Dispatched(bool),
  Incoming(Option<M>),
}

/// The single task sitting between submitters and workers.
///
/// Both of its channels are rendezvous channels, so a value is either held
/// by a submitter, by this stage, or by a worker. The backlog counts the
/// queued values plus the one currently offered downstream. Input is gated
/// off while the backlog exceeds `backlog_size`, which makes
/// `Putter::put` wait until a worker takes a value.
///
/// Whether input closes normally or the token fires, everything already
/// received is flushed to the workers before the output side is dropped.
pub(crate) struct BufferingStage<M: Send + 'static> {
  name: Arc<String>,
  backlog_size: usize,
  input: flume::Receiver<M>,
  output: flume::Sender<M>,
  token: CancellationToken,
  gauges: Arc<StageGauges>,
}

impl<M: Send + 'static> fmt::Debug for BufferingStage<M> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BufferingStage")
      .field("name", &self.name)
      .field("backlog_size", &self.backlog_size)
      .field("queued", &self.gauges.queued.load(Ordering::Relaxed))
      .finish_non_exhaustive()
  }
}

/// Resolves when the current offer completes; never resolves without one.
async fn dispatched<M: Send + 'static>(sending: &mut Option<Dispatch<M>>) -> bool {
  match sending {
    Some(offer) => offer.await.is_ok(),
    None => std::future::pending().await,
  }
}

impl<M: Send + 'static> BufferingStage<M> {
  pub(crate) fn new(
    name: Arc<String>,
    backlog_size: usize,
    input: flume::Receiver<M>,
    output: flume::Sender<M>,
    token: CancellationToken,
    gauges: Arc<StageGauges>,
  ) -> Self {
    Self {
      name,
      backlog_size,
      input,
      output,
      token,
      gauges,
    }
  }

  pub(crate) async fn run(self) {
    let BufferingStage {
      name,
      backlog_size,
      input,
      output,
      token,
      gauges,
    } = self;
    info!(name = %*name, backlog_size, "Buffering stage started.");

    let mut queue: VecDeque<M> = VecDeque::new();
    let mut sending: Option<Dispatch<M>> = None;

    loop {
      if sending.is_none() {
        if let Some(front) = queue.pop_front() {
          sending = Some(Box::pin(output.clone().into_send_async(front)));
        }
      }
      let backlog = queue.len() + usize::from(sending.is_some());
      gauges.queued.store(backlog, Ordering::Release);
      let accepting = backlog <= backlog_size;

      let event = tokio::select! {
        biased;
        _ = token.cancelled() => Event::Cancelled,
        delivered = dispatched(&mut sending) => Event::Dispatched(delivered),
        incoming = input.recv_async(), if accepting => Event::Incoming(incoming.ok()),
      };

      match event {
        Event::Cancelled => {
          debug!(name = %*name, backlog, "Cancellation observed, no longer accepting input.");
          break;
        }
        Event::Dispatched(true) => {
          sending = None;
          trace!(name = %*name, remaining = queue.len(), "Dispatched queued value.");
        }
        Event::Dispatched(false) => {
          sending = None;
          error!(name = %*name, "All workers are gone while values are still queued.");
          break;
        }
        Event::Incoming(Some(value)) => {
          if backlog == 0 {
            // Succeeds only when a worker is already waiting to receive.
            match output.try_send(value) {
              Ok(()) => {
                gauges.direct_handoffs.fetch_add(1, Ordering::Relaxed);
                trace!(name = %*name, "Fast-path handoff to an idle worker.");
                continue;
              }
              Err(flume::TrySendError::Full(value) | flume::TrySendError::Disconnected(value)) => {
                trace!(name = %*name, "No idle worker, queueing value.");
                queue.push_back(value);
              }
            }
          } else {
            queue.push_back(value);
          }
          if backlog + 1 > backlog_size {
            debug!(name = %*name, backlog = backlog + 1, "Backlog full, gating input.");
          }
        }
        Event::Incoming(None) => {
          info!(name = %*name, backlog, "Input closed.");
          break;
        }
      }
    }

    // Submitters still blocked now get a send error and their put fails.
    drop(input);

    let pending = queue.len() + usize::from(sending.is_some());
    if pending > 0 {
      info!(name = %*name, pending, "Flushing queued values to workers.");
    }

    let mut delivered = true;
    if let Some(offer) = sending.take() {
      delivered = offer.await.is_ok();
    }
    while delivered {
      gauges.queued.store(queue.len(), Ordering::Release);
      let Some(value) = queue.pop_front() else {
        break;
      };
      delivered = output.send_async(value).await.is_ok();
    }
    if !delivered {
      error!(name = %*name, dropped = queue.len() + 1, "Output closed during flush, values lost.");
    }
    gauges.queued.store(0, Ordering::Release);

    info!(name = %*name, "Buffering stage stopped, closing output.");
  }
}
