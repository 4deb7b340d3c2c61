// Archivo: checkpoint_store.rs
// Propósito: `CheckpointStore` sobre `migration_checkpoints` con control
// optimista por `revision`. Cada guardado añade además una fila a
// `checkpoint_history` con la instantánea completa en JSON.
use crate::pool::{map_db_err, SqlPool};
use crate::schema::{checkpoint_history, migration_checkpoints};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use log::debug;
use migration::{Checkpoint, CheckpointStore, MigrationError, PersistResult, ResumeToken, Result};
use uuid::Uuid;

#[derive(Debug, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = migration_checkpoints)]
#[diesel(primary_key(name))]
#[diesel(treat_none_as_null = true)]
struct CheckpointRow {
  name: String,
  revision: i64,
  plan_version: i64,
  active_version: Option<i64>,
  direction: String,
  resume_token: Option<String>,
  status: String,
  lease_owner: Option<String>,
  lease_renewed_at_ts: Option<i64>,
  migrated_count: i64,
  skipped_count: i64,
  last_error: Option<String>,
  updated_at_ts: i64,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = checkpoint_history)]
struct HistoryRow {
  id: String,
  name: String,
  revision: i64,
  snapshot: String,
  recorded_at_ts: i64,
}

impl CheckpointRow {
  fn from_checkpoint(cp: &Checkpoint, revision: i64) -> Self {
    CheckpointRow { name: cp.name.clone(),
                    revision,
                    plan_version: cp.plan_version,
                    active_version: cp.active_version,
                    direction: cp.direction.as_str().to_string(),
                    resume_token: cp.resume_token.as_ref().map(|t| t.0.clone()),
                    status: cp.status.as_str().to_string(),
                    lease_owner: cp.lease_owner.map(|u| u.to_string()),
                    lease_renewed_at_ts: cp.lease_renewed_at.map(|t| t.timestamp_millis()),
                    migrated_count: cp.migrated_count as i64,
                    skipped_count: cp.skipped_count as i64,
                    last_error: cp.last_error.clone(),
                    updated_at_ts: cp.updated_at.timestamp_millis() }
  }

  /// Una fila que no se puede interpretar es un checkpoint corrupto.
  fn into_checkpoint(self) -> Result<Checkpoint> {
    let name = self.name;
    let corrupt = |reason: String| MigrationError::corrupt(name.clone(), reason);
    let lease_owner = self.lease_owner
                          .map(|raw| Uuid::parse_str(&raw).map_err(|e| corrupt(format!("lease_owner inválido: {}", e))))
                          .transpose()?;
    let lease_renewed_at = self.lease_renewed_at_ts.map(|ms| from_millis(ms).ok_or_else(|| corrupt("lease_renewed_at_ts".into())))
                               .transpose()?;
    let cp = Checkpoint { revision: self.revision,
                          plan_version: self.plan_version,
                          active_version: self.active_version,
                          direction: self.direction.parse().map_err(corrupt)?,
                          resume_token: self.resume_token.map(ResumeToken),
                          status: self.status.parse().map_err(corrupt)?,
                          lease_owner,
                          lease_renewed_at,
                          migrated_count: u64::try_from(self.migrated_count).map_err(|_| corrupt("migrated_count negativo".into()))?,
                          skipped_count: u64::try_from(self.skipped_count).map_err(|_| corrupt("skipped_count negativo".into()))?,
                          last_error: self.last_error,
                          updated_at: from_millis(self.updated_at_ts).ok_or_else(|| corrupt("updated_at_ts".into()))?,
                          name: name.clone() };
    Ok(cp)
  }
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
  DateTime::<Utc>::from_timestamp_millis(ms)
}

/// Almacén de checkpoints respaldado por Diesel.
#[derive(Clone)]
pub struct DieselCheckpointStore {
  pool: SqlPool,
}

impl DieselCheckpointStore {
  pub fn new(pool: SqlPool) -> Self {
    Self { pool }
  }
}

impl CheckpointStore for DieselCheckpointStore {
  fn load(&self, name: &str) -> Result<Option<Checkpoint>> {
    let mut conn = self.pool.conn()?;
    let row = map_db_err(migration_checkpoints::table.filter(migration_checkpoints::name.eq(name))
                                                     .select(CheckpointRow::as_select())
                                                     .first(&mut conn)
                                                     .optional())?;
    row.map(CheckpointRow::into_checkpoint).transpose()
  }

  fn save(&self, checkpoint: &Checkpoint, expected_revision: i64) -> Result<PersistResult> {
    let new_revision = expected_revision + 1;
    let row = CheckpointRow::from_checkpoint(checkpoint, new_revision);
    let mut snapshot = checkpoint.clone();
    snapshot.revision = new_revision;
    let history = HistoryRow { id: Uuid::new_v4().to_string(),
                               name: checkpoint.name.clone(),
                               revision: new_revision,
                               snapshot: serde_json::to_string(&snapshot)?,
                               recorded_at_ts: Utc::now().timestamp_millis() };

    let mut conn = self.pool.conn()?;
    let res = conn.transaction::<_, DieselError, _>(|conn| {
                    if expected_revision == 0 {
                      diesel::insert_into(migration_checkpoints::table).values(&row).execute(conn)?;
                    } else {
                      let updated = diesel::update(migration_checkpoints::table.filter(migration_checkpoints::name.eq(&checkpoint.name))
                                                                               .filter(migration_checkpoints::revision.eq(expected_revision)))
                        .set(&row)
                        .execute(conn)?;
                      if updated == 0 {
                        return Ok(PersistResult::Conflict);
                      }
                    }
                    diesel::insert_into(checkpoint_history::table).values(&history).execute(conn)?;
                    Ok(PersistResult::Ok { new_version: new_revision })
                  });
    match res {
      // otro escritor creó el checkpoint antes
      Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => Ok(PersistResult::Conflict),
      other => {
        let result = map_db_err(other)?;
        debug!("checkpoint '{}' rev {}: {:?}", checkpoint.name, new_revision, result);
        Ok(result)
      }
    }
  }

  fn history(&self, name: &str) -> Result<Vec<Checkpoint>> {
    let mut conn = self.pool.conn()?;
    let snapshots = map_db_err(checkpoint_history::table.filter(checkpoint_history::name.eq(name))
                                                        .order(checkpoint_history::revision.asc())
                                                        .select(checkpoint_history::snapshot)
                                                        .load::<String>(&mut conn))?;
    snapshots.iter()
             .map(|raw| {
               serde_json::from_str::<Checkpoint>(raw).map_err(|e| MigrationError::corrupt(name, format!("historial: {}", e)))
             })
             .collect()
  }
}
