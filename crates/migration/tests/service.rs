use migration::stubs::{InMemoryCheckpointStore, InMemoryDocumentStore};
use migration::{CheckpointStatus, MigrationEngineConfig, MigrationError, MigrationPlan, MigrationService, PlanDefinition, RunOptions,
                TransformRule, SCHEDULE_TIMES_PLAN};
use serde_json::{json, Value};
use std::sync::Arc;

fn service() -> (Arc<InMemoryDocumentStore>, MigrationService<InMemoryDocumentStore, InMemoryCheckpointStore>) {
  let docs = Arc::new(InMemoryDocumentStore::new());
  let mut svc = MigrationService::new(docs.clone(), Arc::new(InMemoryCheckpointStore::new()), MigrationEngineConfig::default());
  svc.register_builtins().expect("builtins");
  (docs, svc)
}

#[test]
fn builtin_plan_runs_on_its_default_collection() {
  let (docs, svc) = service();
  docs.insert("syncerconf", "1", json!({"sync_rules": {"schedule_time": "02:00"}})).unwrap();

  let report = svc.run(SCHEDULE_TIMES_PLAN, None, 50, &RunOptions::default()).expect("run");
  assert_eq!(report.collection, "syncerconf");
  assert_eq!(report.migrated_count, 1);

  let status = svc.status(SCHEDULE_TIMES_PLAN).unwrap().expect("checkpoint");
  assert_eq!(status.status, CheckpointStatus::Completed);
  assert!(svc.history(SCHEDULE_TIMES_PLAN).unwrap().len() > 1);
}

#[test]
fn explicit_collection_overrides_default() {
  let (docs, svc) = service();
  docs.insert("staging", "1", json!({"sync_rules": {"schedule_time": "02:00"}})).unwrap();
  let report = svc.run(SCHEDULE_TIMES_PLAN, Some("staging"), 50, &RunOptions::default()).unwrap();
  assert_eq!(report.collection, "staging");
  assert_eq!(report.migrated_count, 1);
}

#[test]
fn unknown_plan_and_missing_collection_are_rejected() {
  let (_docs, mut svc) = service();
  let failure = svc.run("nope", None, 50, &RunOptions::default()).expect_err("unknown");
  assert!(matches!(failure.error, MigrationError::InvalidArgument(_)));

  let plan = MigrationPlan::new("no-default").rule(TransformRule::new(1, "r", |b: &Value| b.get("x").is_some(), |_: &Value| json!({})));
  svc.register(plan, None).unwrap();
  let failure = svc.run("no-default", None, 50, &RunOptions::default()).expect_err("no collection");
  assert!(matches!(failure.error, MigrationError::InvalidArgument(_)));
}

#[test]
fn duplicate_registration_is_rejected() {
  let (_docs, mut svc) = service();
  let def = PlanDefinition::from_json(&format!(r#"{{"name": "{}", "rules": [
      {{"version": 1, "name": "x", "op": "remove_field", "path": "x"}}]}}"#,
                                               SCHEDULE_TIMES_PLAN)).unwrap();
  assert!(matches!(svc.register_definition(def), Err(MigrationError::InvalidPlan(_))));
  assert_eq!(svc.plans().count(), 1);
}
