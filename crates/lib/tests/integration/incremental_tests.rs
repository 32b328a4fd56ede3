//! Incremental rebuild behaviour across sessions.

use kiln_lib::{BuildStep, Builder, ImportFile, Locator, NodeState, ResultStatus};

use super::common::{Concat, TestEnv, runs};

#[tokio::test]
async fn unchanged_inputs_are_all_cache_hits() {
  let env = TestEnv::new();
  let source = env.write_source("a.txt", "alpha");
  let consumer = Concat::new("/b", "b:").reads("/a");
  let consumer_runs = consumer.counter();
  let steps = vec![BuildStep::command(ImportFile::new(&source, "/a")), BuildStep::command(consumer)];
  let builder = env.builder();

  let first = builder.run(&steps).await.unwrap();
  assert!(first.is_success());
  assert_eq!(first.count(NodeState::Succeeded), 2);
  assert_eq!(env.read_output("/b"), "b:alpha");

  let second = builder.run(&steps).await.unwrap();
  assert_eq!(second.status(), ResultStatus::NotTriggeredWasSuccessful);
  assert_eq!(second.count(NodeState::CacheHit), 2);
  assert_eq!(second.executed(), 0);
  assert_eq!(runs(&consumer_runs), 1);
}

#[tokio::test]
async fn changed_source_rebuilds_the_chain() {
  let env = TestEnv::new();
  let source = env.write_source("a.txt", "alpha");
  let consumer = Concat::new("/b", "b:").reads("/a");
  let consumer_runs = consumer.counter();
  let steps = vec![BuildStep::command(ImportFile::new(&source, "/a")), BuildStep::command(consumer)];
  let builder = env.builder();

  builder.run(&steps).await.unwrap();
  env.write_source("a.txt", "omega");
  let second = builder.run(&steps).await.unwrap();

  assert!(second.is_success());
  assert_eq!(second.count(NodeState::Succeeded), 2);
  assert_eq!(runs(&consumer_runs), 2);
  assert_eq!(env.read_output("/b"), "b:omega");
}

#[tokio::test]
async fn identical_rewrite_is_not_a_change() {
  let env = TestEnv::new();
  let source = env.write_source("a.txt", "alpha");
  let steps = vec![BuildStep::command(ImportFile::new(&source, "/a"))];
  let builder = env.builder();

  builder.run(&steps).await.unwrap();
  env.write_source("a.txt", "alpha");
  let second = builder.run(&steps).await.unwrap();

  assert_eq!(second.count(NodeState::CacheHit), 1);
}

#[tokio::test]
async fn changed_parameters_rebuild_only_the_changed_command() {
  let env = TestEnv::new();
  let builder = env.builder();

  let first = vec![
    BuildStep::command(Concat::new("/a", "a1")),
    BuildStep::command(Concat::new("/c", "c")),
  ];
  builder.run(&first).await.unwrap();

  let second = vec![
    BuildStep::command(Concat::new("/a", "a2")),
    BuildStep::command(Concat::new("/c", "c")),
  ];
  let result = builder.run(&second).await.unwrap();

  assert_eq!(result.result_for(&Locator::url("/a")).unwrap().state, NodeState::Succeeded);
  assert_eq!(result.result_for(&Locator::url("/c")).unwrap().state, NodeState::CacheHit);
  assert_eq!(env.read_output("/a"), "a2");
}

#[tokio::test]
async fn changed_producer_parameters_rebuild_the_consumer() {
  let env = TestEnv::new();
  let builder = env.builder();

  let consumer = Concat::new("/b", "b:").reads("/a");
  let consumer_runs = consumer.counter();
  let consumer = BuildStep::command(consumer);

  let first = vec![BuildStep::command(Concat::new("/a", "a1")), consumer.clone()];
  builder.run(&first).await.unwrap();
  assert_eq!(runs(&consumer_runs), 1);

  let second = vec![BuildStep::command(Concat::new("/a", "a2")), consumer];
  let result = builder.run(&second).await.unwrap();

  assert_eq!(result.result_for(&Locator::url("/a")).unwrap().state, NodeState::Succeeded);
  assert_eq!(result.result_for(&Locator::url("/b")).unwrap().state, NodeState::Succeeded);
  assert_eq!(runs(&consumer_runs), 2);
  assert_eq!(env.read_output("/b"), "b:a2");
}

#[tokio::test]
async fn rebuilding_is_idempotent() {
  let env = TestEnv::new();
  let source = env.write_source("a.txt", "alpha");
  let steps = vec![
    BuildStep::command(ImportFile::new(&source, "/a")),
    BuildStep::command(Concat::new("/b", "b:").reads("/a")),
  ];

  let first = env.builder().run(&steps).await.unwrap();
  let first_bytes = std::fs::read(env.output_path("/b")).unwrap();

  let forced = Builder::new(env.config().with_force(true)).unwrap();
  let second = forced.run(&steps).await.unwrap();
  let second_bytes = std::fs::read(env.output_path("/b")).unwrap();

  assert_eq!(second.count(NodeState::Succeeded), 2);
  assert_eq!(first_bytes, second_bytes);
  for result in &first.results {
    let again = second.result_for(&result.output).unwrap();
    assert_eq!(again.fingerprint, result.fingerprint);
    assert_eq!(again.output_hash, result.output_hash);
  }
}

#[tokio::test]
async fn fingerprints_survive_a_new_builder() {
  let env = TestEnv::new();
  let source = env.write_source("a.txt", "alpha");
  let steps = vec![BuildStep::command(ImportFile::new(&source, "/a"))];

  let first = env.builder().run(&steps).await.unwrap();
  let second = env.builder().run(&steps).await.unwrap();

  assert_eq!(second.results[0].state, NodeState::CacheHit);
  assert_eq!(second.results[0].fingerprint, first.results[0].fingerprint);
}

#[tokio::test]
async fn sequential_group_orders_unrelated_commands() {
  let env = TestEnv::new();
  let steps = vec![BuildStep::sequence(vec![
    BuildStep::command(Concat::new("/first", "1").slow(std::time::Duration::from_millis(50))),
    BuildStep::command(Concat::new("/second", "2")),
  ])];

  let result = env.builder().run(&steps).await.unwrap();

  let first = result.result_for(&Locator::url("/first")).unwrap();
  let second = result.result_for(&Locator::url("/second")).unwrap();
  assert!(second.started.unwrap() >= first.finished.unwrap());
}

#[tokio::test]
async fn asset_names_are_reported() {
  let env = TestEnv::new();
  let steps = vec![BuildStep::asset("stone", vec![BuildStep::command(Concat::new("/stone", "s"))])];

  let result = env.builder().run(&steps).await.unwrap();

  assert_eq!(result.results[0].asset.as_deref(), Some("stone"));
}

#[tokio::test]
async fn direct_file_inputs_are_tracked() {
  let env = TestEnv::new();
  let source = env.write_source("notes.txt", "v1");
  let reader = Concat::new("/notes", "n:").reads_file(&source);
  let reader_runs = reader.counter();
  let steps = vec![BuildStep::command(reader)];
  let builder = env.builder();

  builder.run(&steps).await.unwrap();
  let unchanged = builder.run(&steps).await.unwrap();
  assert_eq!(unchanged.count(NodeState::CacheHit), 1);

  env.write_source("notes.txt", "v2");
  let changed = builder.run(&steps).await.unwrap();
  assert_eq!(changed.count(NodeState::Succeeded), 1);
  assert_eq!(runs(&reader_runs), 2);
  assert_eq!(env.read_output("/notes"), "n:v2");
}

#[tokio::test]
async fn consumer_may_spell_its_input_differently() {
  let env = TestEnv::new();
  let consumer = Concat::new("/b", "b:").reads("a");
  let steps = vec![
    BuildStep::command(Concat::new("/a", "a")),
    BuildStep::command(consumer),
  ];

  let result = env.builder().run(&steps).await.unwrap();

  assert!(result.is_success());
  assert_eq!(result.count(NodeState::Succeeded), 2);
  assert_eq!(env.read_output("/b"), "b:a");
}
