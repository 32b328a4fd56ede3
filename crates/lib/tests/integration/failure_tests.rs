//! Failure containment and configuration errors.

use kiln_lib::{BuildError, BuildStep, CancelCause, GraphError, ImportFile, Locator, NodeState, ResultStatus, Severity};

use super::common::{Concat, TestEnv, runs};

#[tokio::test]
async fn failed_producer_cancels_consumer() {
  let env = TestEnv::new();
  let consumer = Concat::new("/d", "d:").reads("/c");
  let consumer_runs = consumer.counter();
  let steps = vec![
    BuildStep::command(Concat::new("/c", "c").failing()),
    BuildStep::command(consumer),
  ];

  let result = env.builder().run(&steps).await.unwrap();

  assert!(!result.is_success());
  assert!(result.has_errors());
  assert_eq!(result.status(), ResultStatus::Failed);
  assert_eq!(runs(&consumer_runs), 0);

  let c = result.result_for(&Locator::url("/c")).unwrap();
  assert_eq!(c.state, NodeState::Failed);
  let d = result.result_for(&Locator::url("/d")).unwrap();
  assert_eq!(d.state, NodeState::Cancelled);
  assert_eq!(
    d.cause,
    Some(CancelCause::DependencyFailed {
      root: "concat -> url:/c".to_string()
    })
  );
  assert!(!env.output_path("/d").exists());
}

#[tokio::test]
async fn failure_is_contained_to_descendants() {
  let env = TestEnv::new();
  let steps = vec![
    BuildStep::command(Concat::new("/root", "r")),
    BuildStep::command(Concat::new("/bad", "x").reads("/root").failing()),
    BuildStep::command(Concat::new("/child", "c").reads("/bad")),
    BuildStep::command(Concat::new("/grandchild", "g").reads("/child")),
    BuildStep::command(Concat::new("/sibling", "s").reads("/root")),
  ];

  let result = env.builder().run(&steps).await.unwrap();

  let state = |url: &str| result.result_for(&Locator::url(url)).unwrap().state;
  assert_eq!(state("/root"), NodeState::Succeeded);
  assert_eq!(state("/bad"), NodeState::Failed);
  assert_eq!(state("/child"), NodeState::Cancelled);
  assert_eq!(state("/grandchild"), NodeState::Cancelled);
  assert_eq!(state("/sibling"), NodeState::Succeeded);
  assert_eq!(env.read_output("/sibling"), "sr");
}

#[tokio::test]
async fn failure_is_retried_next_session() {
  let env = TestEnv::new();
  let source = env.temp.path().join("src").join("late.txt");
  let steps = vec![BuildStep::command(ImportFile::new(&source, "/late"))];
  let builder = env.builder();

  let first = builder.run(&steps).await.unwrap();
  assert_eq!(first.results[0].state, NodeState::Failed);
  assert!(first.log.iter().any(|m| m.severity == Severity::Error));

  env.write_source("late.txt", "now here");
  let second = builder.run(&steps).await.unwrap();
  assert_eq!(second.results[0].state, NodeState::Succeeded);
  assert_eq!(env.read_output("/late"), "now here");
}

#[tokio::test]
async fn cycle_is_rejected_before_execution() {
  let env = TestEnv::new();
  let a = Concat::new("/a", "a").reads("/b");
  let b = Concat::new("/b", "b").reads("/a");
  let (a_runs, b_runs) = (a.counter(), b.counter());

  let err = env
    .builder()
    .run(&[BuildStep::command(a), BuildStep::command(b)])
    .await
    .unwrap_err();

  match err {
    BuildError::Configuration(GraphError::CycleDetected { cycle }) => {
      assert!(cycle.contains(&"concat -> url:/a".to_string()));
      assert!(cycle.contains(&"concat -> url:/b".to_string()));
    }
    other => panic!("expected cycle error, got {other}"),
  }
  assert_eq!(runs(&a_runs) + runs(&b_runs), 0);
}

#[tokio::test]
async fn duplicate_output_is_rejected() {
  let env = TestEnv::new();
  let err = env
    .builder()
    .run(&[
      BuildStep::command(Concat::new("/a", "1")),
      BuildStep::command(Concat::new("/a", "2")),
    ])
    .await
    .unwrap_err();

  assert!(matches!(
    err,
    BuildError::Configuration(GraphError::DuplicateOutput { .. })
  ));
  assert!(!env.output_path("/a").exists());
}

#[tokio::test]
async fn differently_spelled_duplicate_output_is_rejected() {
  let env = TestEnv::new();
  let err = env
    .builder()
    .run(&[
      BuildStep::command(Concat::new("/a", "1")),
      BuildStep::command(Concat::new("a", "2")),
    ])
    .await
    .unwrap_err();

  assert!(matches!(
    err,
    BuildError::Configuration(GraphError::DuplicateOutput { .. })
  ));
}
