// Archivo: domain.rs
// Propósito: tipos de dominio del motor (documentos, tokens de reanudación,
// checkpoints, resultados de escritura y el informe de ejecución).
use crate::errors::{MigrationError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Copia transitoria de un documento del almacén.
///
/// `id` es la clave inmutable asignada por el almacén y `revision` su
/// versión optimista (cada escritura la incrementa).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub body: JsonValue,
    pub revision: i64,
}

impl Document {
    pub fn new(id: impl Into<String>, body: JsonValue, revision: i64) -> Self {
        Self { id: id.into(),
               body,
               revision }
    }

    /// Token que apunta justo detrás de este documento.
    pub fn token(&self) -> ResumeToken {
        ResumeToken(self.id.clone())
    }
}

/// Posición opaca del cursor: la clave del último documento procesado en
/// el orden natural (ascendente) del almacén.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(pub String);

impl ResumeToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Estado de una migración con nombre.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Idle => "idle",
            CheckpointStatus::Running => "running",
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "idle" => Ok(CheckpointStatus::Idle),
            "running" => Ok(CheckpointStatus::Running),
            "completed" => Ok(CheckpointStatus::Completed),
            "failed" => Ok(CheckpointStatus::Failed),
            other => Err(format!("status desconocido '{}'", other)),
        }
    }
}

/// Sentido en que se aplican las reglas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Backward => "backward",
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "forward" => Ok(Direction::Forward),
            "backward" => Ok(Direction::Backward),
            other => Err(format!("dirección desconocida '{}'", other)),
        }
    }
}

/// Registro durable del progreso de una migración con nombre.
///
/// Existe exactamente uno por nombre; cada `save` lo sustituye por una
/// nueva revisión y la anterior queda en el historial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    /// Versión optimista del registro persistido (0 = nunca guardado).
    pub revision: i64,
    /// Última regla aplicada por completo (0 = ninguna).
    pub plan_version: i64,
    /// Regla en curso, si la ejecución quedó a medias.
    pub active_version: Option<i64>,
    pub direction: Direction,
    pub resume_token: Option<ResumeToken>,
    pub status: CheckpointStatus,
    pub lease_owner: Option<Uuid>,
    pub lease_renewed_at: Option<DateTime<Utc>>,
    /// Totales acumulados a lo largo de todas las ejecuciones.
    pub migrated_count: u64,
    pub skipped_count: u64,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Checkpoint inicial (`idle`) para una migración nueva.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(),
               revision: 0,
               plan_version: 0,
               active_version: None,
               direction: Direction::Forward,
               resume_token: None,
               status: CheckpointStatus::Idle,
               lease_owner: None,
               lease_renewed_at: None,
               migrated_count: 0,
               skipped_count: 0,
               last_error: None,
               updated_at: Utc::now() }
    }

    /// Validación básica de forma. Un checkpoint que no la supera nunca se
    /// reinicia en silencio: requiere intervención del operador.
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: &str| Err(MigrationError::corrupt(&self.name, reason));
        if self.name.trim().is_empty() {
            return fail("nombre vacío");
        }
        if self.revision < 0 || self.plan_version < 0 {
            return fail("versiones negativas");
        }
        match self.active_version {
            Some(v) if v <= 0 => return fail("versión activa no positiva"),
            Some(v) if self.direction == Direction::Forward && v <= self.plan_version => {
                return fail("la regla activa no es posterior a la versión aplicada");
            }
            Some(v) if self.direction == Direction::Backward && v > self.plan_version => {
                return fail("la regla en reversión no está aplicada");
            }
            None if self.resume_token.is_some() => return fail("token de reanudación sin regla activa"),
            _ => {}
        }
        if self.status == CheckpointStatus::Completed && self.active_version.is_some() {
            return fail("checkpoint completado con una regla en curso");
        }
        if self.lease_owner.is_some() != self.lease_renewed_at.is_some() {
            return fail("lease incompleto");
        }
        Ok(())
    }

    /// Verdadero si el lease fue renovado hace menos de `ttl`.
    pub fn lease_is_fresh(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        match (self.lease_owner, self.lease_renewed_at) {
            (Some(_), Some(at)) => now.signed_duration_since(at) < ttl,
            _ => false,
        }
    }
}

/// Resultado de persistir con control optimista de versión.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistResult {
    Ok { new_version: i64 },
    Conflict,
}

/// Escritura condicionada a que el documento siga en `expected_revision`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalWrite {
    pub id: String,
    pub expected_revision: i64,
    pub body: JsonValue,
}

/// Resultado de una escritura condicional individual dentro de un lote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written { new_revision: i64 },
    /// El documento cambió desde que se leyó.
    Conflict,
    /// El documento ya no existe.
    Missing,
}

/// Cambio que una ejecución `dry_run` habría escrito.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedChange {
    pub rule_version: i64,
    pub document_id: String,
    pub before: JsonValue,
    pub after: JsonValue,
}

/// Resumen de una ejecución. Se devuelve siempre, también en fallos, para
/// que el operador vea el progreso hecho.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub plan: String,
    pub collection: String,
    pub migrated_count: u64,
    pub skipped_count: u64,
    /// Documentos que aún requieren migración en un plan ya completado
    /// (sólo en el escaneo de verificación).
    pub pending_count: u64,
    pub batches: u64,
    pub plan_version: i64,
    pub final_status: CheckpointStatus,
    pub dry_run: bool,
    pub cancelled: bool,
    pub intended_changes: Vec<PlannedChange>,
}

impl RunReport {
    pub fn new(plan: &str, collection: &str, dry_run: bool) -> Self {
        Self { plan: plan.to_string(),
               collection: collection.to_string(),
               migrated_count: 0,
               skipped_count: 0,
               pending_count: 0,
               batches: 0,
               plan_version: 0,
               final_status: CheckpointStatus::Idle,
               dry_run,
               cancelled: false,
               intended_changes: Vec::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_through_str() {
        for s in [CheckpointStatus::Idle,
                  CheckpointStatus::Running,
                  CheckpointStatus::Completed,
                  CheckpointStatus::Failed]
        {
            assert_eq!(s.as_str().parse::<CheckpointStatus>().unwrap(), s);
        }
        assert!("paused".parse::<CheckpointStatus>().is_err());
    }

    #[test]
    fn validate_rejects_token_without_active_rule() {
        let mut cp = Checkpoint::new("m");
        cp.resume_token = Some(ResumeToken("k".into()));
        assert!(matches!(cp.validate(), Err(MigrationError::CorruptCheckpoint { .. })));
    }

    #[test]
    fn validate_rejects_stale_active_version() {
        let mut cp = Checkpoint::new("m");
        cp.plan_version = 2;
        cp.active_version = Some(2);
        assert!(cp.validate().is_err());
        cp.active_version = Some(3);
        assert!(cp.validate().is_ok());
    }

    #[test]
    fn lease_freshness_uses_ttl() {
        let mut cp = Checkpoint::new("m");
        let now = Utc::now();
        assert!(!cp.lease_is_fresh(now, chrono::Duration::seconds(30)));
        cp.lease_owner = Some(Uuid::new_v4());
        cp.lease_renewed_at = Some(now - chrono::Duration::seconds(10));
        assert!(cp.lease_is_fresh(now, chrono::Duration::seconds(30)));
        assert!(!cp.lease_is_fresh(now, chrono::Duration::seconds(5)));
    }
}
