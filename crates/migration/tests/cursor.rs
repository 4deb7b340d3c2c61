use migration::stubs::InMemoryDocumentStore;
use migration::{DocumentCursor, MigrationError, ResumeToken};
use serde_json::json;

fn seeded(n: usize) -> InMemoryDocumentStore {
  let store = InMemoryDocumentStore::new();
  for i in 0..n {
    store.insert("c", &format!("k{:02}", i), json!({"i": i})).unwrap();
  }
  store
}

fn drain(cursor: &mut DocumentCursor<'_, InMemoryDocumentStore>) -> Vec<String> {
  let mut ids = Vec::new();
  while let Some(doc) = cursor.next().expect("next") {
    ids.push(doc.id);
  }
  ids
}

#[test]
fn resuming_from_token_yields_same_suffix() {
  let store = seeded(10);
  let all = drain(&mut DocumentCursor::open(&store, "c", None, 3));
  assert_eq!(all.len(), 10);

  let mut resumed = DocumentCursor::open(&store, "c", Some(ResumeToken("k04".into())), 3);
  assert_eq!(drain(&mut resumed), all[5..].to_vec());
  assert_eq!(resumed.position(), Some(&ResumeToken("k09".into())));
}

#[test]
fn documents_inserted_behind_position_are_not_revisited() {
  let store = seeded(4);
  let mut cursor = DocumentCursor::open(&store, "c", None, 2);
  assert_eq!(cursor.next().unwrap().unwrap().id, "k00");
  assert_eq!(cursor.next().unwrap().unwrap().id, "k01");

  store.insert("c", "a0", json!({})).unwrap();
  store.insert("c", "zz", json!({})).unwrap();
  assert_eq!(drain(&mut cursor), vec!["k02", "k03", "zz"]);
}

#[test]
fn empty_collection_ends_immediately() {
  let store = InMemoryDocumentStore::new();
  let mut cursor = DocumentCursor::open(&store, "missing", None, 5);
  assert!(cursor.next().unwrap().is_none());
  assert!(cursor.position().is_none());
}

#[test]
fn scan_failure_propagates() {
  let store = seeded(5);
  store.fail_scans_after(1);
  let mut cursor = DocumentCursor::open(&store, "c", None, 2);
  assert!(cursor.next().unwrap().is_some());
  assert!(cursor.next().unwrap().is_some());
  let err = cursor.next().unwrap_err();
  assert!(matches!(err, MigrationError::StoreUnavailable { .. }));
  // la posición sigue en el último documento entregado
  assert_eq!(cursor.position(), Some(&ResumeToken("k01".into())));
}
