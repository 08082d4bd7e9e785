use futures_backlog::{consume, BoxError, ConsumeError, ConsumeOptions};
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

// Helper to initialize tracing for tests (call once per test run, not per test function)
fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,futures_backlog=debug"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

#[derive(Debug, PartialEq)]
struct RejectedValue(u32);

impl fmt::Display for RejectedValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "value {} rejected", self.0)
  }
}

impl std::error::Error for RejectedValue {}

fn rejected_value(err: &ConsumeError) -> Option<&RejectedValue> {
  match err {
    ConsumeError::Task { source, .. } => source.downcast_ref::<RejectedValue>(),
    ConsumeError::TaskPanicked { .. } => None,
  }
}

// Collects every processed value into a shared list after a short delay.
fn collecting_fn(
  seen: Arc<Mutex<Vec<u32>>>,
  fail_on: Option<u32>,
) -> impl Fn(usize, u32) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), RejectedValue>> + Send>>
     + Send
     + Sync
     + 'static {
  move |_worker, v| {
    let seen = seen.clone();
    Box::pin(async move {
      sleep(Duration::from_millis(10)).await;
      if Some(v) == fail_on {
        return Err(RejectedValue(v));
      }
      seen.lock().push(v);
      Ok(())
    })
  }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
  tokio::time::timeout(Duration::from_secs(2), async {
    while !condition() {
      sleep(Duration::from_millis(5)).await;
    }
  })
  .await
  .expect("condition not reached in time");
}

#[tokio::test]
async fn test_all_values_processed_before_close_returns() {
  setup_tracing_for_test();
  let seen = Arc::new(Mutex::new(Vec::new()));
  let (put, wait) = consume(
    CancellationToken::new(),
    2,
    collecting_fn(seen.clone(), None),
    ConsumeOptions::new().backlog_size(1).name("end_to_end"),
  );

  for v in 1..=5 {
    assert!(put.put(v).await, "value {} should be accepted", v);
  }
  assert_eq!(wait.wait(true).await.ok(), Some(()));
  assert_eq!(wait.in_flight(), 0);

  let mut seen = seen.lock().clone();
  seen.sort_unstable();
  assert_eq!(seen, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_worker_error_is_returned_and_blocks_new_work() {
  setup_tracing_for_test();
  let seen = Arc::new(Mutex::new(Vec::new()));
  let (put, wait) = consume(
    CancellationToken::new(),
    2,
    collecting_fn(seen.clone(), Some(3)),
    ConsumeOptions::new().backlog_size(1).name("error_variant"),
  );

  for v in 1..=3 {
    assert!(put.put(v).await);
  }
  wait_until(|| wait.failed()).await;

  assert!(!put.put(4).await, "puts must be rejected once a worker failed");
  assert!(!put.put(5).await);

  let err = wait.wait(true).await.expect_err("the failure on value 3 should surface");
  assert_eq!(rejected_value(&err), Some(&RejectedValue(3)));

  let mut seen = seen.lock().clone();
  seen.sort_unstable();
  assert_eq!(seen, vec![1, 2]);
}

#[tokio::test]
async fn test_panicking_worker_is_reported_and_pipeline_keeps_draining() {
  setup_tracing_for_test();
  let processed = Arc::new(AtomicUsize::new(0));
  let counter = processed.clone();
  let (put, wait) = consume(
    CancellationToken::new(),
    1,
    move |_worker, v: u32| {
      let counter = counter.clone();
      async move {
        if v == 2 {
          panic!("cannot handle {}", v);
        }
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<(), BoxError>(())
      }
    },
    ConsumeOptions::new().name("panic_pipeline"),
  );

  for v in 1..=2 {
    assert!(put.put(v).await);
  }

  match wait.wait(false).await {
    Err(ConsumeError::TaskPanicked { worker_id, message }) => {
      assert_eq!(worker_id, 0);
      assert_eq!(message, "cannot handle 2");
    }
    other => panic!("expected a panic error, got {:?}", other),
  }

  // The error has been collected, so the single worker takes new values again.
  assert!(put.put(3).await);
  wait.wait(true).await.unwrap();
  assert_eq!(processed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_only_one_error_surfaces() {
  setup_tracing_for_test();
  let (put, wait) = consume(
    CancellationToken::new(),
    4,
    |_worker, v: u32| async move { Err::<(), RejectedValue>(RejectedValue(v)) },
    ConsumeOptions::new().name("many_errors"),
  );

  let mut accepted = Vec::new();
  for v in 0..20 {
    if put.put(v).await {
      accepted.push(v);
    }
  }
  assert!(!accepted.is_empty());

  let err = wait.wait(false).await.expect_err("at least one value failed");
  let failed = rejected_value(&err).expect("task error").0;
  assert!(accepted.contains(&failed));

  assert!(wait.wait(true).await.is_ok(), "later errors are dropped, not queued");
}

#[tokio::test]
async fn test_cancellation_stops_puts_but_delivers_accepted_values() {
  setup_tracing_for_test();
  let token = CancellationToken::new();
  let seen = Arc::new(Mutex::new(Vec::new()));
  let (put, wait) = consume(
    token.clone(),
    2,
    collecting_fn(seen.clone(), None),
    ConsumeOptions::new().name("cancel_pipeline"),
  );

  for v in 0..10 {
    assert!(put.put(v).await);
  }
  token.cancel();
  assert!(!put.put(10).await);
  assert!(!put.put(11).await);

  wait.wait(true).await.unwrap();
  let mut seen = seen.lock().clone();
  seen.sort_unstable();
  assert_eq!(seen, (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_cancel_unblocks_put_waiting_on_backlog() {
  setup_tracing_for_test();
  let token = CancellationToken::new();
  let gate = Arc::new(Notify::new());
  let worker_gate = gate.clone();
  let (put, wait) = consume(
    token.clone(),
    1,
    move |_worker, _v: u32| {
      let gate = worker_gate.clone();
      async move {
        gate.notified().await;
        Ok::<(), BoxError>(())
      }
    },
    ConsumeOptions::new().backlog_size(0).name("cancel_blocked"),
  );

  let producer = {
    let put = put.clone();
    tokio::spawn(async move {
      let mut accepted = 0;
      for v in 0..100 {
        if !put.put(v).await {
          break;
        }
        accepted += 1;
      }
      accepted
    })
  };

  sleep(Duration::from_millis(50)).await;
  assert!(!producer.is_finished(), "producer should be held back by the backlog");

  token.cancel();
  let accepted = tokio::time::timeout(Duration::from_secs(1), producer)
    .await
    .expect("cancellation should unblock the producer")
    .unwrap();
  assert!(accepted < 100);

  // Let every accepted value through.
  let releaser = tokio::spawn({
    let gate = gate.clone();
    async move {
      loop {
        gate.notify_one();
        sleep(Duration::from_millis(1)).await;
      }
    }
  });
  wait.wait(true).await.unwrap();
  releaser.abort();
  assert_eq!(wait.in_flight(), 0);
}

#[tokio::test]
async fn test_backlog_bound_is_respected() {
  setup_tracing_for_test();
  let gate = Arc::new(Notify::new());
  let worker_gate = gate.clone();
  let processed = Arc::new(AtomicUsize::new(0));
  let counter = processed.clone();
  let backlog = 2;
  let (put, wait) = consume(
    CancellationToken::new(),
    1,
    move |_worker, _v: u32| {
      let gate = worker_gate.clone();
      let counter = counter.clone();
      async move {
        gate.notified().await;
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<(), BoxError>(())
      }
    },
    ConsumeOptions::new().backlog_size(backlog).name("backlog_bound"),
  );

  let producer = {
    let put = put.clone();
    tokio::spawn(async move {
      for v in 0..20 {
        assert!(put.put(v).await);
      }
    })
  };

  sleep(Duration::from_millis(50)).await;
  assert!(!producer.is_finished());
  assert_eq!(wait.queued(), backlog + 1);

  for _ in 0..20 {
    gate.notify_one();
    sleep(Duration::from_millis(2)).await;
    assert!(wait.queued() <= backlog + 1);
  }

  let releaser = tokio::spawn({
    let gate = gate.clone();
    async move {
      loop {
        gate.notify_one();
        sleep(Duration::from_millis(1)).await;
      }
    }
  });
  producer.await.unwrap();
  wait.wait(true).await.unwrap();
  releaser.abort();
  assert_eq!(processed.load(Ordering::SeqCst), 20);
}

// A gated single worker that counts how many values it has started on.
fn gated_fn(
  gate: Arc<Notify>,
  started: Arc<AtomicUsize>,
) -> impl Fn(usize, u32) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), BoxError>> + Send>>
     + Send
     + Sync
     + 'static {
  move |_worker, _v| {
    let gate = gate.clone();
    let started = started.clone();
    Box::pin(async move {
      started.fetch_add(1, Ordering::SeqCst);
      gate.notified().await;
      Ok(())
    })
  }
}

fn open_gate(gate: Arc<Notify>) -> tokio::task::JoinHandle<()> {
  tokio::spawn(async move {
    loop {
      gate.notify_one();
      sleep(Duration::from_millis(1)).await;
    }
  })
}

// Puts one value at a time until a put is still blocked after `patience`.
async fn put_until_blocked(put: &futures_backlog::Putter<u32>, patience: Duration) -> usize {
  let mut accepted = 0;
  for v in 0..1000 {
    match tokio::time::timeout(patience, put.put(v)).await {
      Ok(ok) => {
        assert!(ok);
        accepted += 1;
      }
      Err(_) => return accepted,
    }
  }
  panic!("put never blocked");
}

#[tokio::test]
async fn test_abandoned_put_does_not_hang_wait() {
  setup_tracing_for_test();
  let gate = Arc::new(Notify::new());
  let started = Arc::new(AtomicUsize::new(0));
  let (put, wait) = consume(
    CancellationToken::new(),
    1,
    gated_fn(gate.clone(), started.clone()),
    ConsumeOptions::new().backlog_size(0).name("abandoned_put"),
  );

  // The last put is dropped by the timeout while waiting on the backlog.
  let accepted = put_until_blocked(&put, Duration::from_millis(50)).await;
  assert_eq!(wait.in_flight(), accepted);

  let releaser = open_gate(gate);
  tokio::time::timeout(Duration::from_secs(2), wait.wait(true))
    .await
    .expect("wait should not count a value whose put was dropped")
    .unwrap();
  releaser.abort();
  assert_eq!(wait.in_flight(), 0);
  assert_eq!(started.load(Ordering::SeqCst), accepted);
}

#[tokio::test]
async fn test_undispatched_values_stay_within_backlog_plus_one() {
  setup_tracing_for_test();
  let gate = Arc::new(Notify::new());
  let started = Arc::new(AtomicUsize::new(0));
  let backlog = 3;
  let (put, wait) = consume(
    CancellationToken::new(),
    1,
    gated_fn(gate.clone(), started.clone()),
    ConsumeOptions::new().backlog_size(backlog).name("undispatched_bound"),
  );

  let accepted = put_until_blocked(&put, Duration::from_millis(50)).await;
  let started_now = started.load(Ordering::SeqCst);
  assert_eq!(started_now, 1, "the only worker is stuck on its first value");
  assert!(
    accepted - started_now <= backlog + 1,
    "{} accepted but only {} started",
    accepted,
    started_now
  );
  assert_eq!(wait.queued(), backlog + 1);

  let releaser = open_gate(gate);
  wait.wait(true).await.unwrap();
  releaser.abort();
  assert_eq!(started.load(Ordering::SeqCst), accepted);
}

#[tokio::test]
async fn test_idle_worker_gets_value_without_queueing() {
  setup_tracing_for_test();
  let gate = Arc::new(Notify::new());
  let started = Arc::new(AtomicUsize::new(0));
  let (put, wait) = consume(
    CancellationToken::new(),
    1,
    gated_fn(gate.clone(), started.clone()),
    ConsumeOptions::new().backlog_size(4).name("fast_path"),
  );

  // Give the worker time to start waiting for input.
  sleep(Duration::from_millis(20)).await;
  assert!(put.put(1).await);
  sleep(Duration::from_millis(20)).await;
  assert_eq!(wait.direct_handoffs(), 1);
  assert_eq!(started.load(Ordering::SeqCst), 1);
  assert_eq!(wait.queued(), 0);

  // The worker is busy now, so the next value goes through the backlog.
  assert!(put.put(2).await);
  sleep(Duration::from_millis(20)).await;
  assert_eq!(wait.direct_handoffs(), 1);
  assert_eq!(wait.queued(), 1);

  let releaser = open_gate(gate);
  wait.wait(true).await.unwrap();
  releaser.abort();
  assert_eq!(started.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_wait_without_close_acts_as_barrier() {
  setup_tracing_for_test();
  let processed = Arc::new(AtomicUsize::new(0));
  let counter = processed.clone();
  let (put, wait) = consume(
    CancellationToken::new(),
    3,
    move |_worker, _v: u32| {
      let counter = counter.clone();
      async move {
        sleep(Duration::from_millis(5)).await;
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<(), BoxError>(())
      }
    },
    ConsumeOptions::new().backlog_size(2).name("barrier"),
  );

  for round in 1..=3 {
    for v in 0..10 {
      assert!(put.put(v).await);
    }
    wait.wait(false).await.unwrap();
    assert_eq!(processed.load(Ordering::SeqCst), round * 10);
    assert_eq!(wait.in_flight(), 0);
    assert!(!put.is_closed().await);
  }

  wait.wait(true).await.unwrap();
  assert!(!put.put(99).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_each_value_processed_once() {
  setup_tracing_for_test();
  let counts: Arc<Mutex<HashMap<u32, usize>>> = Arc::new(Mutex::new(HashMap::new()));
  let workers_seen = Arc::new(Mutex::new(std::collections::HashSet::new()));
  let (put, wait) = consume(
    CancellationToken::new(),
    4,
    {
      let counts = counts.clone();
      let workers_seen = workers_seen.clone();
      move |worker, v: u32| {
        let counts = counts.clone();
        let workers_seen = workers_seen.clone();
        async move {
          let jitter = rand::rng().random_range(0..3u64);
          sleep(Duration::from_millis(jitter)).await;
          *counts.lock().entry(v).or_insert(0) += 1;
          workers_seen.lock().insert(worker);
          Ok::<(), BoxError>(())
        }
      }
    },
    ConsumeOptions::new().backlog_size(4).name("stress"),
  );

  let mut producers = Vec::new();
  for p in 0..8u32 {
    let put = put.clone();
    producers.push(tokio::spawn(async move {
      for i in 0..50u32 {
        assert!(put.put(p * 1000 + i).await);
      }
    }));
  }
  for producer in producers {
    producer.await.unwrap();
  }

  wait.wait(true).await.unwrap();

  let counts = counts.lock();
  assert_eq!(counts.len(), 400);
  assert!(counts.values().all(|&n| n == 1));
  assert!(workers_seen.lock().iter().all(|&w| w < 4));
}
