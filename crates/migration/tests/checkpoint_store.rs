use migration::stubs::InMemoryCheckpointStore;
use migration::{Checkpoint, CheckpointStatus, CheckpointStore, MigrationError, PersistResult};

#[test]
fn save_is_compare_and_set_on_revision() {
  let store = InMemoryCheckpointStore::new();
  let mut cp = Checkpoint::new("m");

  match store.save(&cp, 0).unwrap() {
    PersistResult::Ok { new_version } => cp.revision = new_version,
    PersistResult::Conflict => panic!("unexpected conflict on create"),
  }
  assert_eq!(cp.revision, 1);

  // crear otra vez con 0 es conflicto
  assert_eq!(store.save(&Checkpoint::new("m"), 0).unwrap(), PersistResult::Conflict);

  cp.status = CheckpointStatus::Running;
  assert_eq!(store.save(&cp, 1).unwrap(), PersistResult::Ok { new_version: 2 });
  // revisión obsoleta
  assert_eq!(store.save(&cp, 1).unwrap(), PersistResult::Conflict);

  let loaded = store.load("m").unwrap().unwrap();
  assert_eq!(loaded.revision, 2);
  assert_eq!(loaded.status, CheckpointStatus::Running);
}

#[test]
fn history_keeps_every_revision() {
  let store = InMemoryCheckpointStore::new();
  let mut cp = Checkpoint::new("m");
  for expected in 0..4 {
    cp.migrated_count = expected as u64 * 10;
    assert_eq!(store.save(&cp, expected).unwrap(), PersistResult::Ok { new_version: expected + 1 });
  }
  let history = store.history("m").unwrap();
  assert_eq!(history.len(), 4);
  assert_eq!(history.iter().map(|c| c.revision).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
  assert_eq!(history[3].migrated_count, 30);
  assert!(store.history("other").unwrap().is_empty());
  assert!(store.load("other").unwrap().is_none());
}

#[test]
fn injected_save_failure_is_store_unavailable() {
  let store = InMemoryCheckpointStore::new();
  store.fail_saves_after(0);
  let err = store.save(&Checkpoint::new("m"), 0).unwrap_err();
  assert!(matches!(err, MigrationError::StoreUnavailable { .. }));
  assert!(store.load("m").unwrap().is_none());
  store.clear_faults();
  assert!(matches!(store.save(&Checkpoint::new("m"), 0).unwrap(), PersistResult::Ok { .. }));
}

#[test]
fn checkpoint_serializes_as_json() {
  let mut cp = Checkpoint::new("m");
  cp.status = CheckpointStatus::Failed;
  cp.last_error = Some("boom".into());
  let raw = serde_json::to_value(&cp).unwrap();
  assert_eq!(raw["status"], "failed");
  let back: Checkpoint = serde_json::from_value(raw).unwrap();
  assert_eq!(back, cp);
}
