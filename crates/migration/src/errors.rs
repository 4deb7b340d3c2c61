// Archivo: errors.rs
// Propósito: definir los errores del motor de migraciones y el alias
// Result<T> usado por las APIs del crate.
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Errores del motor de migraciones.
///
/// - `StoreUnavailable`: fallo transitorio del almacén (reintentable).
/// - `AlreadyRunning`: otra instancia mantiene el lease de la migración.
/// - `RuleInvariantViolation`: una regla no converge (error de programación).
/// - `CorruptCheckpoint`: el checkpoint persistido no tiene una forma válida.
#[derive(Error, Debug)]
pub enum MigrationError {
    /// El almacén (documentos o checkpoints) no respondió o falló.
    #[error("Almacén no disponible ({context}): {reason}")]
    StoreUnavailable { context: String, reason: String },

    /// Hay otra ejecución activa con un lease vigente.
    #[error("La migración '{name}' ya está en ejecución (owner: {owner:?}, renovado: {renewed_at:?})")]
    AlreadyRunning {
        name: String,
        owner: Option<Uuid>,
        renewed_at: Option<DateTime<Utc>>,
    },

    /// `predicate(apply(d))` sigue siendo verdadero para un documento.
    #[error("La regla '{rule}' (v{version}) no converge para el documento {document}")]
    RuleInvariantViolation { rule: String, version: i64, document: String },

    /// El checkpoint no supera la validación de forma. Nunca se reinicia
    /// automáticamente.
    #[error("Checkpoint corrupto para '{name}': {reason}")]
    CorruptCheckpoint { name: String, reason: String },

    /// Plan mal formado (versiones repetidas, reglas sin inversa, etc.).
    #[error("Plan inválido: {0}")]
    InvalidPlan(String),

    /// Parámetros de invocación inválidos.
    #[error("Argumento inválido: {0}")]
    InvalidArgument(String),

    /// Escrituras condicionales rechazadas repetidamente por escritores
    /// concurrentes.
    #[error("Contención al escribir el documento {document} ({context})")]
    Contention { context: String, document: String },

    /// Error de serialización/deserialización JSON.
    #[error("Error de serialización: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MigrationError {
    /// Construye un `StoreUnavailable` sin contexto adicional.
    pub fn store(reason: impl Into<String>) -> Self {
        MigrationError::StoreUnavailable { context: "almacén".into(),
                                           reason: reason.into() }
    }

    /// Construye un `CorruptCheckpoint`.
    pub fn corrupt(name: impl Into<String>, reason: impl Into<String>) -> Self {
        MigrationError::CorruptCheckpoint { name: name.into(),
                                            reason: reason.into() }
    }

    /// Añade contexto (regla, token) a los errores de almacén conservando
    /// su tipo. El resto de variantes se devuelve intacto.
    pub fn context(self, ctx: impl AsRef<str>) -> Self {
        match self {
            MigrationError::StoreUnavailable { context, reason } => {
                MigrationError::StoreUnavailable { context: format!("{}: {}", ctx.as_ref(), context),
                                                   reason }
            }
            MigrationError::Contention { context, document } => {
                MigrationError::Contention { context: format!("{}: {}", ctx.as_ref(), context),
                                             document }
            }
            other => other,
        }
    }

    /// Indica si el llamador puede reintentar `run` tal cual.
    pub fn is_retryable(&self) -> bool {
        matches!(self,
                 MigrationError::StoreUnavailable { .. } | MigrationError::Contention { .. } | MigrationError::AlreadyRunning { .. })
    }

    /// Indica si el error requiere corregir el plan o intervenir a mano.
    pub fn is_fatal(&self) -> bool {
        matches!(self,
                 MigrationError::RuleInvariantViolation { .. }
                 | MigrationError::CorruptCheckpoint { .. }
                 | MigrationError::InvalidPlan(_))
    }
}

/// Alias de resultado usado por las APIs del crate.
pub type Result<T> = std::result::Result<T, MigrationError>;
