use futures_backlog::{consume, ConsumeOptions, Pool};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();
  info!("--- Basic Usage Example ---");

  // Scratch buffers shared by the workers.
  let buffers = Arc::new(Pool::new(4, || String::with_capacity(64)));

  let worker_buffers = buffers.clone();
  let (put, wait) = consume(
    CancellationToken::new(),
    3, // Workers
    move |worker_id, n: u64| {
      let buffers = worker_buffers.clone();
      async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut buf = buffers.get();
        buf.clear();
        buf.push_str(&format!("square of {} is {}", n, n * n));
        info!("Worker {}: {}", worker_id, *buf);
        if n == 7 {
          return Err(format!("refusing to process {}", n));
        }
        Ok(())
      }
    },
    ConsumeOptions::new().backlog_size(2).name("squares"),
  );

  for n in 1..=10u64 {
    if !put.put(n).await {
      info!("Value {} rejected (pipeline closed or failed).", n);
    }
  }

  match wait.wait(true).await {
    Ok(()) => info!("All values processed."),
    Err(e) => info!("Pipeline reported an error: {}", e),
  }
  info!("Buffers in use after drain: {}", buffers.in_use());
  info!("--- Basic Usage Example End ---");
}
