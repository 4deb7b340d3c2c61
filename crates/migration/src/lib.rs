//! Crate `migration`: motor de migraciones reanudables sobre almacenes de
//! documentos
//!
//! Este crate define los tipos de dominio (`Document`, `Checkpoint`,
//! `RunReport`), los contratos de almacenamiento `DocumentStore` y
//! `CheckpointStore`, implementaciones en memoria útiles para pruebas y el
//! motor `MigrationEngine`, que aplica un `MigrationPlan` de reglas
//! versionadas sobre una colección.
//!
//! Diseño resumido:
//! - Reglas con guarda: cada `TransformRule` tiene un predicado y una
//!   transformación pura; tras aplicarla el predicado deja de cumplirse.
//! - Reanudación: el recorrido usa un cursor con token ordenado y guarda un
//!   checkpoint tras cada lote confirmado.
//! - Un único escritor por migración mediante un lease en el checkpoint,
//!   adquirido con locking optimista (`PersistResult::Conflict`).
//! - Escrituras condicionales por revisión: los escritores concurrentes
//!   nunca se pisan.
//!
//! Ejemplo rápido:
//! ```rust
//! use migration::stubs::{InMemoryCheckpointStore, InMemoryDocumentStore};
//! use migration::{MigrationEngine, MigrationEngineConfig, RunOptions};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let docs = Arc::new(InMemoryDocumentStore::new());
//! docs.insert("syncerconf", "a", json!({"sync_rules": {"schedule_time": "02:00"}})).unwrap();
//! let engine = MigrationEngine::new(docs.clone(), Arc::new(InMemoryCheckpointStore::new()), MigrationEngineConfig::default());
//! let plan = migration::builtin_plan(migration::SCHEDULE_TIMES_PLAN).unwrap().unwrap().plan;
//! let report = engine.run(&plan, "syncerconf", 100, &RunOptions::default()).unwrap();
//! assert_eq!(report.migrated_count, 1);
//! ```
pub mod builtin;
pub mod cursor;
pub mod declarative;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod plan;
pub mod repository;
pub mod rule;
pub mod service;
pub mod stubs;

pub use builtin::*;
pub use cursor::*;
pub use declarative::*;
pub use domain::*;
pub use engine::*;
pub use errors::*;
pub use plan::*;
pub use repository::*;
pub use rule::*;
pub use service::*;
pub use stubs::*;
