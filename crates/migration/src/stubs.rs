// Archivo: stubs.rs
// Propósito: implementaciones en memoria para pruebas y wiring rápido.
//
// Incluye un almacén de documentos (`InMemoryDocumentStore`) y uno de
// checkpoints (`InMemoryCheckpointStore`), ambos con inyección de fallos.
// No son durables y se usan en demos o pruebas locales.
use crate::domain::{Checkpoint, ConditionalWrite, Document, PersistResult, ResumeToken, WriteOutcome};
use crate::errors::{MigrationError, Result};
use crate::repository::{CheckpointStore, DocumentStore};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

type Collection = BTreeMap<String, Document>;
type FetchHook = Box<dyn FnOnce(&mut ExternalWriter<'_>) + Send>;

/// Helper para mapear `Mutex::lock()` en un `Result` con
/// `MigrationError::StoreUnavailable`.
fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock().map_err(|e| MigrationError::store(format!("mutex poisoned: {:?}", e)))
}

/// Contadores para simular caídas del almacén tras N llamadas correctas.
#[derive(Debug, Default)]
struct Faults {
    fail_scans_after: Option<u64>,
    fail_writes_after: Option<u64>,
    fail_saves_after: Option<u64>,
    scans: u64,
    writes: u64,
    saves: u64,
}

fn trip(limit: Option<u64>, count: &mut u64, op: &str) -> Result<()> {
    if let Some(limit) = limit {
        if *count >= limit {
            return Err(MigrationError::store(format!("fallo inyectado en {}", op)));
        }
    }
    *count += 1;
    Ok(())
}

/// Vista de una colección para simular un escritor externo concurrente.
pub struct ExternalWriter<'a> {
    docs: &'a mut Collection,
}

impl ExternalWriter<'_> {
    /// Reemplaza el cuerpo del documento e incrementa su revisión.
    pub fn replace(&mut self, id: &str, body: JsonValue) {
        if let Some(doc) = self.docs.get_mut(id) {
            doc.body = body;
            doc.revision += 1;
        }
    }

    /// Elimina el documento.
    pub fn remove(&mut self, id: &str) {
        self.docs.remove(id);
    }
}

/// Almacén de documentos en memoria, ordenado por clave.
pub struct InMemoryDocumentStore {
    collections: Mutex<HashMap<String, Collection>>,
    faults: Mutex<Faults>,
    /// Se ejecuta una vez al inicio del siguiente `fetch` (justo antes de
    /// la re-verificación previa a escribir).
    fetch_hook: Mutex<Option<(String, FetchHook)>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self { collections: Mutex::new(HashMap::new()),
               faults: Mutex::new(Faults::default()),
               fetch_hook: Mutex::new(None) }
    }

    /// Inserta o reemplaza un documento. Devuelve la nueva revisión.
    pub fn insert(&self, collection: &str, id: &str, body: JsonValue) -> Result<i64> {
        let mut cols = lock(&self.collections)?;
        let docs = cols.entry(collection.to_string()).or_default();
        let revision = docs.get(id).map(|d| d.revision + 1).unwrap_or(1);
        docs.insert(id.to_string(), Document::new(id, body, revision));
        Ok(revision)
    }

    pub fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let cols = lock(&self.collections)?;
        Ok(cols.get(collection).and_then(|docs| docs.get(id)).cloned())
    }

    /// Copia de todos los documentos de la colección, en orden de clave.
    pub fn documents(&self, collection: &str) -> Result<Vec<Document>> {
        let cols = lock(&self.collections)?;
        Ok(cols.get(collection).map(|docs| docs.values().cloned().collect()).unwrap_or_default())
    }

    /// Hace fallar los `scan` posteriores a los `n` primeros.
    pub fn fail_scans_after(&self, n: u64) {
        let mut f = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        f.fail_scans_after = Some(f.scans + n);
    }

    /// Hace fallar los `write_batch` posteriores a los `n` primeros.
    pub fn fail_writes_after(&self, n: u64) {
        let mut f = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        f.fail_writes_after = Some(f.writes + n);
    }

    pub fn clear_faults(&self) {
        let mut f = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        f.fail_scans_after = None;
        f.fail_writes_after = None;
    }

    /// Número de lotes escritos hasta ahora.
    pub fn write_batches(&self) -> u64 {
        self.faults.lock().unwrap_or_else(|e| e.into_inner()).writes
    }

    /// Registra un escritor externo que actuará sobre `collection` justo
    /// antes del siguiente `fetch`.
    pub fn before_next_fetch<F>(&self, collection: &str, f: F)
        where F: FnOnce(&mut ExternalWriter<'_>) + Send + 'static
    {
        let hook: FetchHook = Box::new(f);
        *self.fetch_hook.lock().unwrap_or_else(|e| e.into_inner()) = Some((collection.to_string(), hook));
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn scan(&self, collection: &str, after: Option<&ResumeToken>, limit: usize) -> Result<Vec<Document>> {
        {
            let mut f = lock(&self.faults)?;
            let limit = f.fail_scans_after;
            trip(limit, &mut f.scans, "scan")?;
        }
        let cols = lock(&self.collections)?;
        let docs = match cols.get(collection) {
            Some(d) => d,
            None => return Ok(Vec::new()),
        };
        let page = match after {
            Some(token) => docs.range::<str, _>((std::ops::Bound::Excluded(token.as_str()), std::ops::Bound::Unbounded))
                               .take(limit)
                               .map(|(_, d)| d.clone())
                               .collect(),
            None => docs.values().take(limit).cloned().collect(),
        };
        Ok(page)
    }

    fn fetch(&self, collection: &str, ids: &[String]) -> Result<Vec<Document>> {
        let hook = {
            let mut slot = self.fetch_hook.lock().unwrap_or_else(|e| e.into_inner());
            match slot.take() {
                Some((target, hook)) if target == collection => Some(hook),
                other => {
                    *slot = other;
                    None
                }
            }
        };
        let mut cols = lock(&self.collections)?;
        let docs = cols.entry(collection.to_string()).or_default();
        if let Some(hook) = hook {
            hook(&mut ExternalWriter { docs: &mut *docs });
        }
        Ok(ids.iter().filter_map(|id| docs.get(id).cloned()).collect())
    }

    fn write_batch(&self, collection: &str, writes: &[ConditionalWrite]) -> Result<Vec<WriteOutcome>> {
        {
            let mut f = lock(&self.faults)?;
            let limit = f.fail_writes_after;
            trip(limit, &mut f.writes, "write_batch")?;
        }
        let mut cols = lock(&self.collections)?;
        let docs = cols.entry(collection.to_string()).or_default();
        let outcomes = writes.iter()
                             .map(|w| match docs.get_mut(&w.id) {
                                 None => WriteOutcome::Missing,
                                 Some(doc) if doc.revision != w.expected_revision => WriteOutcome::Conflict,
                                 Some(doc) => {
                                     doc.body = w.body.clone();
                                     doc.revision += 1;
                                     WriteOutcome::Written { new_revision: doc.revision }
                                 }
                             })
                             .collect();
        Ok(outcomes)
    }
}

/// Almacén de checkpoints en memoria. Conserva todas las revisiones.
pub struct InMemoryCheckpointStore {
    records: Mutex<HashMap<String, Vec<Checkpoint>>>,
    faults: Mutex<Faults>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self { records: Mutex::new(HashMap::new()),
               faults: Mutex::new(Faults::default()) }
    }

    /// Escribe un checkpoint sin control de versión (para preparar
    /// escenarios de prueba). Devuelve la revisión asignada.
    pub fn put(&self, checkpoint: Checkpoint) -> Result<i64> {
        let mut records = lock(&self.records)?;
        let history = records.entry(checkpoint.name.clone()).or_default();
        let mut cp = checkpoint;
        cp.revision = history.len() as i64 + 1;
        let revision = cp.revision;
        history.push(cp);
        Ok(revision)
    }

    /// Hace fallar los `save` posteriores a los `n` primeros.
    pub fn fail_saves_after(&self, n: u64) {
        let mut f = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        f.fail_saves_after = Some(f.saves + n);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().unwrap_or_else(|e| e.into_inner()).fail_saves_after = None;
    }
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn load(&self, name: &str) -> Result<Option<Checkpoint>> {
        let records = lock(&self.records)?;
        Ok(records.get(name).and_then(|h| h.last()).cloned())
    }

    fn save(&self, checkpoint: &Checkpoint, expected_revision: i64) -> Result<PersistResult> {
        {
            let mut f = lock(&self.faults)?;
            let limit = f.fail_saves_after;
            trip(limit, &mut f.saves, "save")?;
        }
        let mut records = lock(&self.records)?;
        let history = records.entry(checkpoint.name.clone()).or_default();
        let current = history.last().map(|c| c.revision).unwrap_or(0);
        if current != expected_revision {
            return Ok(PersistResult::Conflict);
        }
        let mut cp = checkpoint.clone();
        cp.revision = current + 1;
        history.push(cp);
        Ok(PersistResult::Ok { new_version: current + 1 })
    }

    fn history(&self, name: &str) -> Result<Vec<Checkpoint>> {
        let records = lock(&self.records)?;
        Ok(records.get(name).cloned().unwrap_or_default())
    }
}
