// Archivo: repository.rs
// Propósito: definir los contratos que deben implementar los almacenes
// externos (`DocumentStore`, `CheckpointStore`). El motor sólo habla con el
// almacén a través de estos traits.
use crate::domain::{Checkpoint, ConditionalWrite, Document, PersistResult, ResumeToken, WriteOutcome};
use crate::errors::Result;

/// Contrato mínimo del almacén de documentos.
///
/// Las implementaciones deben aplicar un timeout explícito a cada llamada y
/// devolver `MigrationError::StoreUnavailable` al vencer, sin reintentar.
pub trait DocumentStore: Send + Sync {
    /// Devuelve hasta `limit` documentos de `collection` con clave
    /// estrictamente mayor que `after`, en orden ascendente de clave.
    fn scan(&self, collection: &str, after: Option<&ResumeToken>, limit: usize) -> Result<Vec<Document>>;

    /// Lee la versión actual de los documentos indicados. Los que no
    /// existan se omiten del resultado.
    fn fetch(&self, collection: &str, ids: &[String]) -> Result<Vec<Document>>;

    /// Aplica un lote de escrituras condicionales. Cada escritura sólo se
    /// aplica si el documento sigue en `expected_revision`. Devuelve un
    /// resultado por escritura, en el mismo orden.
    fn write_batch(&self, collection: &str, writes: &[ConditionalWrite]) -> Result<Vec<WriteOutcome>>;
}

/// Slot durable clave/valor para los checkpoints de migración.
pub trait CheckpointStore: Send + Sync {
    /// Último checkpoint guardado para `name`, si existe.
    fn load(&self, name: &str) -> Result<Option<Checkpoint>>;

    /// Guarda una nueva revisión del checkpoint sólo si la revisión
    /// almacenada es `expected_revision` (0 cuando no existe). La revisión
    /// anterior pasa al historial; nunca se borra.
    fn save(&self, checkpoint: &Checkpoint, expected_revision: i64) -> Result<PersistResult>;

    /// Historial completo de revisiones, de la más antigua a la actual.
    fn history(&self, name: &str) -> Result<Vec<Checkpoint>>;
}
