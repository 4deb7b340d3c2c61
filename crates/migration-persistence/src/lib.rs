//! Persistencia Diesel para el motor de migraciones.
//! Este crate expone el módulo `schema`, el pool compartido y los almacenes
//! que implementan `DocumentStore` y `CheckpointStore` sobre SQLite (por
//! defecto) o Postgres (feature `pg`). Las tablas se crean con migraciones
//! embebidas al abrir el pool.

mod checkpoint_store;
mod document_store;
mod pool;
pub mod schema;

pub use checkpoint_store::DieselCheckpointStore;
pub use document_store::DieselDocumentStore;
pub use pool::{new_from_env, SqlPool, DEFAULT_STORE_TIMEOUT, MIGRATIONS};

/// Abre ambos almacenes sobre el mismo pool configurado desde el entorno.
pub fn stores_from_env() -> migration::Result<(DieselDocumentStore, DieselCheckpointStore)> {
  let pool = new_from_env()?;
  Ok((DieselDocumentStore::new(pool.clone()), DieselCheckpointStore::new(pool)))
}
