#![cfg(not(feature = "pg"))]

use diesel::prelude::*;
use migration::{builtin_plan, Checkpoint, CheckpointStatus, CheckpointStore, ConditionalWrite, DocumentStore, MigrationEngine,
                MigrationEngineConfig, MigrationError, PersistResult, ResumeToken, RunOptions, WriteOutcome, SCHEDULE_TIMES_PLAN};
use migration_persistence::{DieselCheckpointStore, DieselDocumentStore, SqlPool};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn open() -> (TempDir, String, DieselDocumentStore, DieselCheckpointStore) {
  let dir = tempfile::tempdir().expect("tempdir");
  let path = dir.path().join("migrator.db").to_string_lossy().to_string();
  let pool = SqlPool::connect(&path, Duration::from_secs(5)).expect("pool");
  (dir, path, DieselDocumentStore::new(pool.clone()), DieselCheckpointStore::new(pool))
}

#[test]
fn scan_is_ordered_and_resumable() {
  let (_dir, _path, docs, _) = open();
  for key in ["c", "a", "b", "d"] {
    docs.insert("things", key, &json!({"k": key})).unwrap();
  }
  docs.insert("other", "a", &json!({})).unwrap();

  let page = docs.scan("things", None, 3).unwrap();
  assert_eq!(page.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), vec!["a", "b", "c"]);
  let rest = docs.scan("things", Some(&ResumeToken("c".into())), 3).unwrap();
  assert_eq!(rest.len(), 1);
  assert_eq!(rest[0].id, "d");
  assert_eq!(rest[0].body, json!({"k": "d"}));
}

#[test]
fn conditional_writes_report_each_outcome() {
  let (_dir, _path, docs, _) = open();
  assert_eq!(docs.insert("things", "a", &json!({"v": 1})).unwrap(), 1);
  assert_eq!(docs.insert("things", "b", &json!({"v": 1})).unwrap(), 1);
  // una reescritura externa sube la revisión de "b"
  assert_eq!(docs.insert("things", "b", &json!({"v": 2})).unwrap(), 2);

  let writes = vec![ConditionalWrite { id: "a".into(),
                                       expected_revision: 1,
                                       body: json!({"v": 10}) },
                    ConditionalWrite { id: "b".into(),
                                       expected_revision: 1,
                                       body: json!({"v": 10}) },
                    ConditionalWrite { id: "gone".into(),
                                       expected_revision: 1,
                                       body: json!({}) }];
  let outcomes = docs.write_batch("things", &writes).unwrap();
  assert_eq!(outcomes,
             vec![WriteOutcome::Written { new_revision: 2 }, WriteOutcome::Conflict, WriteOutcome::Missing]);

  let fetched = docs.fetch("things", &["a".to_string(), "b".to_string()]).unwrap();
  assert_eq!(fetched.len(), 2);
  let a = docs.get("things", "a").unwrap().unwrap();
  assert_eq!((a.body, a.revision), (json!({"v": 10}), 2));
  assert_eq!(docs.get("things", "b").unwrap().unwrap().body, json!({"v": 2}));
}

#[test]
fn checkpoint_save_is_compare_and_set_with_history() {
  let (_dir, _path, _, checkpoints) = open();
  let mut cp = Checkpoint::new("m");
  assert_eq!(checkpoints.save(&cp, 0).unwrap(), PersistResult::Ok { new_version: 1 });
  assert_eq!(checkpoints.save(&cp, 0).unwrap(), PersistResult::Conflict);

  cp.revision = 1;
  cp.status = CheckpointStatus::Running;
  cp.active_version = Some(1);
  cp.resume_token = Some(ResumeToken("k9".into()));
  cp.lease_owner = Some(uuid::Uuid::new_v4());
  cp.lease_renewed_at = Some(chrono::Utc::now());
  assert_eq!(checkpoints.save(&cp, 1).unwrap(), PersistResult::Ok { new_version: 2 });
  assert_eq!(checkpoints.save(&cp, 1).unwrap(), PersistResult::Conflict);

  let loaded = checkpoints.load("m").unwrap().unwrap();
  assert_eq!(loaded.revision, 2);
  assert_eq!(loaded.status, CheckpointStatus::Running);
  assert_eq!(loaded.resume_token, cp.resume_token);
  assert_eq!(loaded.lease_owner, cp.lease_owner);

  // liberar el lease debe escribir NULL
  cp.revision = 2;
  cp.lease_owner = None;
  cp.lease_renewed_at = None;
  assert!(matches!(checkpoints.save(&cp, 2).unwrap(), PersistResult::Ok { .. }));
  assert!(checkpoints.load("m").unwrap().unwrap().lease_owner.is_none());

  let history = checkpoints.history("m").unwrap();
  assert_eq!(history.iter().map(|c| c.revision).collect::<Vec<_>>(), vec![1, 2, 3]);
  assert_eq!(history[0].status, CheckpointStatus::Idle);
}

#[test]
fn unreadable_checkpoint_row_is_corrupt() {
  let (_dir, path, _, checkpoints) = open();
  checkpoints.save(&Checkpoint::new("m"), 0).unwrap();

  let mut conn = SqliteConnection::establish(&path).expect("establish");
  diesel::sql_query("UPDATE migration_checkpoints SET status = 'paused' WHERE name = 'm'").execute(&mut conn)
                                                                                          .unwrap();
  let err = checkpoints.load("m").unwrap_err();
  assert!(matches!(err, MigrationError::CorruptCheckpoint { .. }));
}

#[test]
fn engine_runs_end_to_end_on_sqlite() {
  let (_dir, _path, docs, checkpoints) = open();
  docs.insert("syncerconf", "1", &json!({"_id": 1, "sync_rules": {"schedule_time": "02:00"}})).unwrap();
  docs.insert("syncerconf", "2", &json!({"_id": 2, "sync_rules": {"schedule_times": ["05:00"]}})).unwrap();
  docs.insert("syncerconf", "3", &json!({"_id": 3, "sync_rules": {"schedule_time": "07:30"}})).unwrap();

  let docs = Arc::new(docs);
  let checkpoints = Arc::new(checkpoints);
  let engine = MigrationEngine::new(docs.clone(), checkpoints.clone(), MigrationEngineConfig::default());
  let plan = builtin_plan(SCHEDULE_TIMES_PLAN).unwrap().unwrap().plan;

  let report = engine.run(&plan, "syncerconf", 2, &RunOptions::default()).expect("run");
  assert_eq!(report.migrated_count, 2);
  assert_eq!(report.skipped_count, 1);
  assert_eq!(report.final_status, CheckpointStatus::Completed);
  assert_eq!(docs.get("syncerconf", "3").unwrap().unwrap().body,
             json!({"_id": 3, "sync_rules": {"schedule_times": ["07:30"]}}));

  let again = engine.run(&plan, "syncerconf", 2, &RunOptions::default()).expect("second run");
  assert_eq!(again.migrated_count, 0);
  assert_eq!(again.skipped_count, 3);

  let history = checkpoints.history(SCHEDULE_TIMES_PLAN).unwrap();
  assert_eq!(history.last().unwrap().status, CheckpointStatus::Completed);
}

#[test]
fn new_from_env_reads_migrator_db_url() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("env.db").to_string_lossy().to_string();
  std::env::set_var("MIGRATOR_DB_URL", &path);
  std::env::set_var("MIGRATOR_STORE_TIMEOUT_SECS", "2");
  let (docs, checkpoints) = migration_persistence::stores_from_env().expect("stores");
  docs.insert("c", "a", &json!({})).unwrap();
  assert!(checkpoints.load("none").unwrap().is_none());
  std::env::remove_var("MIGRATOR_DB_URL");
  std::env::remove_var("MIGRATOR_STORE_TIMEOUT_SECS");
}
