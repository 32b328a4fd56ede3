//! Parallelism bounds, per-output exclusion and cancellation.

use std::time::Duration;

use kiln_lib::{BuildEvent, BuildStep, CancelCause, Locator, NodeState, ResultStatus};

use super::common::{Concat, OverlapGauge, TestEnv, runs};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallelism_is_bounded() {
  let env = TestEnv::new();
  let gauge = OverlapGauge::new();
  let steps: Vec<BuildStep> = (0..6)
    .map(|i| {
      BuildStep::command(
        Concat::new(&format!("/out/{i}"), &i.to_string())
          .slow(Duration::from_millis(30))
          .gauged(&gauge),
      )
    })
    .collect();
  let builder = kiln_lib::Builder::new(env.config().with_parallelism(2)).unwrap();

  let result = builder.run(&steps).await.unwrap();

  assert!(result.is_success());
  assert_eq!(result.count(NodeState::Succeeded), 6);
  assert!(gauge.max() <= 2, "observed {} concurrent commands", gauge.max());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn independent_commands_run_in_parallel() {
  let env = TestEnv::new();
  let gauge = OverlapGauge::new();
  let steps: Vec<BuildStep> = (0..4)
    .map(|i| {
      BuildStep::command(
        Concat::new(&format!("/p/{i}"), "x")
          .slow(Duration::from_millis(200))
          .gauged(&gauge),
      )
    })
    .collect();

  env.builder().run(&steps).await.unwrap();

  assert!(gauge.max() >= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_sessions_never_write_the_same_output_concurrently() {
  let env = TestEnv::new();
  let gauge = OverlapGauge::new();
  let first = Concat::new("/shared", "one").slow(Duration::from_millis(100)).gauged(&gauge);
  let second = Concat::new("/shared", "two").slow(Duration::from_millis(100)).gauged(&gauge);
  let (first_runs, second_runs) = (first.counter(), second.counter());
  let builder = env.builder();

  let steps_one = vec![BuildStep::command(first)];
  let steps_two = vec![BuildStep::command(second)];
  let (one, two) = tokio::join!(builder.run(&steps_one), builder.run(&steps_two));

  assert!(one.unwrap().is_success());
  assert!(two.unwrap().is_success());
  assert_eq!(runs(&first_runs), 1);
  assert_eq!(runs(&second_runs), 1);
  assert_eq!(gauge.max(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn differently_spelled_outputs_share_one_lock() {
  let env = TestEnv::new();
  let gauge = OverlapGauge::new();
  let first = Concat::new("/shared", "one").slow(Duration::from_millis(100)).gauged(&gauge);
  let second = Concat::new("shared/", "two").slow(Duration::from_millis(100)).gauged(&gauge);
  let builder = env.builder();

  let steps_one = vec![BuildStep::command(first)];
  let steps_two = vec![BuildStep::command(second)];
  let (one, two) = tokio::join!(builder.run(&steps_one), builder.run(&steps_two));

  assert!(one.unwrap().is_success());
  assert!(two.unwrap().is_success());
  assert_eq!(gauge.max(), 1);
}

#[tokio::test]
async fn cancellation_stops_dispatch_and_lets_running_commands_finish() {
  let env = TestEnv::new();
  let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
  let builder = env.builder().with_events(tx);
  let cancel = builder.cancel_handle();

  let downstream = Concat::new("/b", "b").reads("/a");
  let downstream_runs = downstream.counter();
  let steps = vec![
    BuildStep::command(Concat::new("/a", "a").slow(Duration::from_millis(200))),
    BuildStep::command(downstream),
  ];

  let watcher = tokio::spawn(async move {
    while let Some(event) = rx.recv().await {
      if let BuildEvent::CommandStarted { title } = event
        && title == "concat -> url:/a"
      {
        cancel.cancel();
      }
    }
  });

  let result = builder.run(&steps).await.unwrap();
  drop(builder);
  watcher.await.unwrap();

  assert!(result.cancelled);
  assert!(!result.is_success());
  assert_eq!(result.status(), ResultStatus::Cancelled);
  assert_eq!(runs(&downstream_runs), 0);

  let a = result.result_for(&Locator::url("/a")).unwrap();
  assert_eq!(a.state, NodeState::Succeeded);
  assert!(a.messages.iter().any(|m| m.text.contains("after the session was cancelled")));
  let b = result.result_for(&Locator::url("/b")).unwrap();
  assert_eq!(b.cause, Some(CancelCause::SessionCancelled));
}
