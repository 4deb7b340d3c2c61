// Archivo: engine.rs
// Propósito: implementar `MigrationEngine`, el motor que recorre una
// colección con un cursor reanudable, aplica las reglas del plan, escribe
// por lotes condicionales y registra checkpoints.
//
// Nota: el checkpoint de un lote se guarda siempre *después* de que sus
// escrituras se confirmen. Si el proceso muere entre ambas cosas, la
// siguiente ejecución vuelve a evaluar el predicado y no encuentra nada
// que hacer.
use crate::cursor::DocumentCursor;
use crate::domain::{Checkpoint, CheckpointStatus, ConditionalWrite, Direction, Document, PersistResult, PlannedChange,
                    ResumeToken, RunReport, WriteOutcome};
use crate::errors::{MigrationError, Result};
use crate::plan::MigrationPlan;
use crate::repository::{CheckpointStore, DocumentStore};
use crate::rule::{Transform, TransformRule};
use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Configuración del motor.
#[derive(Debug, Clone)]
pub struct MigrationEngineConfig {
    /// Tiempo tras el cual un lease sin renovar se considera abandonado.
    pub lease_ttl: chrono::Duration,
    /// Fuera del modo estricto se auto-verifica el primer documento
    /// transformado y uno de cada `self_check_every`.
    pub self_check_every: u64,
    /// Intentos de escritura condicional por documento antes de rendirse.
    pub max_write_attempts: u32,
    /// Identidad de esta instancia en el lease.
    pub owner: Uuid,
}

impl Default for MigrationEngineConfig {
    fn default() -> Self {
        Self { lease_ttl: chrono::Duration::seconds(60),
               self_check_every: 100,
               max_write_attempts: 3,
               owner: Uuid::new_v4() }
    }
}

/// Señal de cancelación cooperativa compartida entre hilos.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Opciones de una ejecución.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Calcula e informa los cambios sin escribir ni guardar checkpoints.
    pub dry_run: bool,
    /// Auto-verifica la convergencia en cada documento transformado.
    pub strict: bool,
    /// Vuelve a recorrer todas las reglas aunque el plan esté completado.
    pub force_rescan: bool,
    pub cancel: Option<CancelToken>,
}

/// Fallo de una ejecución. Conserva el informe con el progreso hecho.
#[derive(Debug, Error)]
#[error("{error} (migrados: {}, omitidos: {}, estado: {})", .report.migrated_count, .report.skipped_count, .report.final_status)]
pub struct RunFailure {
    pub report: RunReport,
    #[source]
    pub error: MigrationError,
}

pub type RunResult = std::result::Result<RunReport, RunFailure>;

/// Estado de una ejecución en curso.
struct Session<'a> {
    collection: &'a str,
    batch_size: usize,
    options: &'a RunOptions,
    checkpoint: Checkpoint,
    initial_status: CheckpointStatus,
    lease_held: bool,
    transformed: u64,
    report: RunReport,
}

impl Session<'_> {
    fn cancelled(&self) -> bool {
        self.options.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    fn skip(&mut self, n: u64) {
        self.report.skipped_count += n;
        self.checkpoint.skipped_count += n;
    }

    fn migrated(&mut self, n: u64) {
        self.report.migrated_count += n;
        self.checkpoint.migrated_count += n;
    }
}

/// Escritura preparada a partir de la copia leída por el cursor.
struct Staged {
    id: String,
    revision: i64,
    after: JsonValue,
}

#[derive(Default)]
struct Batch {
    staged: Vec<Staged>,
    pulled: usize,
    last: Option<ResumeToken>,
}

/// Motor de migraciones reanudable.
///
/// Responsabilidades principales:
/// - Garantizar un único escritor por migración con nombre (lease)
/// - Recorrer la colección por lotes y aplicar las reglas pendientes
/// - Re-verificar cada documento justo antes de escribirlo
/// - Guardar checkpoints tras cada lote confirmado
pub struct MigrationEngine<D, C>
    where D: DocumentStore + ?Sized,
          C: CheckpointStore + ?Sized
{
    documents: Arc<D>,
    checkpoints: Arc<C>,
    config: MigrationEngineConfig,
}

impl<D, C> MigrationEngine<D, C>
    where D: DocumentStore + ?Sized,
          C: CheckpointStore + ?Sized
{
    pub fn new(documents: Arc<D>, checkpoints: Arc<C>, config: MigrationEngineConfig) -> Self {
        Self { documents,
               checkpoints,
               config }
    }

    pub fn config(&self) -> &MigrationEngineConfig {
        &self.config
    }

    /// Checkpoint actual de la migración `name`.
    pub fn status(&self, name: &str) -> Result<Option<Checkpoint>> {
        self.checkpoints.load(name)
    }

    /// Historial de revisiones del checkpoint de `name`.
    pub fn history(&self, name: &str) -> Result<Vec<Checkpoint>> {
        self.checkpoints.history(name)
    }

    /// Aplica el plan sobre `collection` hasta completarlo, fallar o ser
    /// cancelado.
    ///
    /// Output:
    /// - `Ok(RunReport)` con `final_status = completed` (o `running` si se
    ///   canceló, o el estado intacto en `dry_run`).
    /// - `Err(RunFailure)` con el error y los contadores alcanzados.
    pub fn run(&self, plan: &MigrationPlan, collection: &str, batch_size: usize, options: &RunOptions) -> RunResult {
        let report = RunReport::new(&plan.name, collection, options.dry_run);
        let checkpoint = match self.prepare(plan, collection, batch_size, options) {
            Ok(cp) => cp,
            Err(error) => return Err(RunFailure { report, error }),
        };
        let mut session = Session { collection,
                                    batch_size,
                                    options,
                                    initial_status: checkpoint.status,
                                    checkpoint,
                                    lease_held: false,
                                    transformed: 0,
                                    report };
        info!("migración '{}' sobre '{}': inicio (v{}, estado {}, dry_run={})",
              plan.name, collection, session.checkpoint.plan_version, session.checkpoint.status, options.dry_run);
        let outcome = self.drive_forward(plan, &mut session);
        self.finish(session, outcome)
    }

    /// Revierte las reglas con versión mayor que `target_version` usando
    /// sus transformaciones inversas, de la más reciente a la más antigua.
    pub fn rollback(&self,
                    plan: &MigrationPlan,
                    collection: &str,
                    target_version: i64,
                    batch_size: usize,
                    options: &RunOptions)
                    -> RunResult {
        let report = RunReport::new(&plan.name, collection, options.dry_run);
        if target_version < 0 {
            let error = MigrationError::InvalidArgument("la versión objetivo no puede ser negativa".into());
            return Err(RunFailure { report, error });
        }
        let checkpoint = match self.prepare(plan, collection, batch_size, options) {
            Ok(cp) => cp,
            Err(error) => return Err(RunFailure { report, error }),
        };
        let mut session = Session { collection,
                                    batch_size,
                                    options,
                                    initial_status: checkpoint.status,
                                    checkpoint,
                                    lease_held: false,
                                    transformed: 0,
                                    report };
        info!("rollback de '{}' sobre '{}': v{} -> v{}",
              plan.name, collection, session.checkpoint.plan_version, target_version);
        let outcome = self.drive_backward(plan, target_version, &mut session);
        self.finish(session, outcome)
    }

    /// Valida argumentos y carga (o crea) el checkpoint.
    fn prepare(&self, plan: &MigrationPlan, collection: &str, batch_size: usize, options: &RunOptions) -> Result<Checkpoint> {
        plan.validate()?;
        if collection.trim().is_empty() {
            return Err(MigrationError::InvalidArgument("colección vacía".into()));
        }
        if batch_size == 0 {
            return Err(MigrationError::InvalidArgument("batch_size debe ser mayor que cero".into()));
        }
        let checkpoint = match self.checkpoints.load(&plan.name)? {
            Some(cp) => cp,
            None if options.dry_run => Checkpoint::new(&plan.name),
            None => {
                let mut cp = Checkpoint::new(&plan.name);
                match self.checkpoints.save(&cp, 0)? {
                    PersistResult::Ok { new_version } => cp.revision = new_version,
                    // otra instancia lo creó a la vez
                    PersistResult::Conflict => {
                        cp = self.checkpoints
                                 .load(&plan.name)?
                                 .ok_or_else(|| MigrationError::corrupt(&plan.name, "checkpoint desaparecido"))?;
                    }
                }
                cp
            }
        };
        checkpoint.validate()?;
        Ok(checkpoint)
    }

    fn drive_forward(&self, plan: &MigrationPlan, s: &mut Session<'_>) -> Result<()> {
        if s.checkpoint.direction == Direction::Backward && s.checkpoint.active_version.is_some() {
            return Err(MigrationError::InvalidArgument(format!("hay un rollback en curso para '{}'; complételo primero",
                                                               plan.name)));
        }
        let start = if s.options.force_rescan {
            s.checkpoint.plan_version = 0;
            s.checkpoint.active_version = None;
            s.checkpoint.resume_token = None;
            Some((0, None))
        } else if let Some(v) = s.checkpoint.active_version {
            let idx = plan.position(v)
                          .ok_or_else(|| MigrationError::corrupt(&plan.name, format!("la regla en curso v{} no existe en el plan", v)))?;
            Some((idx, s.checkpoint.resume_token.clone()))
        } else {
            plan.first_after(s.checkpoint.plan_version).map(|i| (i, None))
        };

        let (start_idx, mut token) = match start {
            Some(start) => start,
            None if s.checkpoint.status == CheckpointStatus::Completed => return self.verify(plan, s),
            None => {
                // nada pendiente, pero la ejecución anterior no llegó a cerrar
                self.begin(s)?;
                return self.complete(s);
            }
        };

        self.begin(s)?;
        for rule in &plan.rules()[start_idx..] {
            if !self.migrate_rule(rule, rule.forward(), Direction::Forward, token.take(), s)? {
                return self.pause(s);
            }
            s.checkpoint.plan_version = rule.version;
            s.checkpoint.active_version = None;
            s.checkpoint.resume_token = None;
            self.commit_checkpoint(s)?;
            info!("regla '{}' (v{}) completada", rule.name, rule.version);
        }
        self.complete(s)
    }

    fn drive_backward(&self, plan: &MigrationPlan, target: i64, s: &mut Session<'_>) -> Result<()> {
        let (direction, active) = (s.checkpoint.direction, s.checkpoint.active_version);
        let resume = match (direction, active) {
            (Direction::Backward, Some(v)) => Some((v, s.checkpoint.resume_token.clone())),
            _ => None,
        };
        // una regla aplicada a medias también se revierte
        let partial = match (direction, active) {
            (Direction::Forward, Some(v)) => Some(v),
            _ => None,
        };
        let applied = s.checkpoint.plan_version;
        let rules: Vec<&TransformRule> = plan.rules()
                                             .iter()
                                             .rev()
                                             .filter(|r| r.version > target && (r.version <= applied || Some(r.version) == partial))
                                             .collect();
        if let Some(rule) = rules.iter().find(|r| r.backward().is_none()) {
            return Err(MigrationError::InvalidPlan(format!("la regla '{}' (v{}) no tiene transformación inversa",
                                                           rule.name, rule.version)));
        }
        if rules.is_empty() {
            if s.checkpoint.status == CheckpointStatus::Completed && applied <= target {
                return Ok(());
            }
            self.begin(s)?;
            s.checkpoint.plan_version = applied.min(target);
            return self.complete(s);
        }

        self.begin(s)?;
        for (i, rule) in rules.iter().enumerate() {
            let token = match &resume {
                Some((v, t)) if *v == rule.version => t.clone(),
                _ => None,
            };
            if rule.version > s.checkpoint.plan_version {
                s.checkpoint.plan_version = rule.version;
            }
            let backward = match rule.backward() {
                Some(b) => b,
                None => continue,
            };
            if !self.migrate_rule(rule, backward, Direction::Backward, token, s)? {
                return self.pause(s);
            }
            s.checkpoint.plan_version = rules.get(i + 1).map(|r| r.version).unwrap_or(target);
            s.checkpoint.active_version = None;
            s.checkpoint.resume_token = None;
            self.commit_checkpoint(s)?;
            info!("regla '{}' (v{}) revertida", rule.name, rule.version);
        }
        self.complete(s)
    }

    /// Recorre una regla desde `token` hasta agotar el cursor. Devuelve
    /// `false` si se canceló entre lotes.
    fn migrate_rule(&self,
                    rule: &TransformRule,
                    transform: &Transform,
                    direction: Direction,
                    token: Option<ResumeToken>,
                    s: &mut Session<'_>)
                    -> Result<bool> {
        let ctx = |position: Option<&ResumeToken>| {
            format!("regla '{}' v{} ({}), token {:?}", rule.name, rule.version, direction.as_str(), position)
        };
        s.checkpoint.active_version = Some(rule.version);
        s.checkpoint.direction = direction;
        debug!("regla '{}' (v{}, {}): desde {:?}", rule.name, rule.version, direction.as_str(), token);

        let mut cursor = DocumentCursor::open(self.documents.as_ref(), s.collection, token, s.batch_size);
        let mut batch = Batch::default();
        loop {
            if batch.pulled == 0 && s.cancelled() {
                return Ok(false);
            }
            let doc = match cursor.next().map_err(|e| e.context(ctx(cursor.position())))? {
                Some(doc) => doc,
                None => break,
            };
            batch.pulled += 1;
            batch.last = Some(doc.token());
            self.stage(rule, transform, doc, &mut batch, s)?;
            if batch.pulled >= s.batch_size {
                let position = batch.last.clone();
                self.commit_batch(rule, transform, std::mem::take(&mut batch), s)
                    .map_err(|e| e.context(ctx(position.as_ref())))?;
            }
        }
        if batch.pulled > 0 {
            let position = batch.last.clone();
            self.commit_batch(rule, transform, batch, s).map_err(|e| e.context(ctx(position.as_ref())))?;
        }
        Ok(true)
    }

    /// Evalúa el predicado y, si aplica, prepara la escritura.
    fn stage(&self,
             rule: &TransformRule,
             transform: &Transform,
             doc: Document,
             batch: &mut Batch,
             s: &mut Session<'_>)
             -> Result<()> {
        if !transform.matches(&doc.body) {
            s.skip(1);
            return Ok(());
        }
        let after = transform.apply(&doc.body);
        s.transformed += 1;
        let sampled = s.options.strict
                      || s.transformed == 1
                      || (self.config.self_check_every > 0 && s.transformed % self.config.self_check_every == 0);
        // sin cambios y con el predicado aún verdadero: no converge
        if after == doc.body || (sampled && transform.matches(&after)) {
            return Err(MigrationError::RuleInvariantViolation { rule: rule.name.clone(),
                                                                version: rule.version,
                                                                document: doc.id });
        }
        if s.options.dry_run {
            s.report.intended_changes.push(PlannedChange { rule_version: rule.version,
                                                           document_id: doc.id,
                                                           before: doc.body,
                                                           after });
        } else {
            batch.staged.push(Staged { id: doc.id,
                                       revision: doc.revision,
                                       after });
        }
        Ok(())
    }

    /// Confirma un lote: escribe y, sólo después, guarda el checkpoint.
    fn commit_batch(&self, rule: &TransformRule, transform: &Transform, batch: Batch, s: &mut Session<'_>) -> Result<()> {
        s.report.batches += 1;
        if s.options.dry_run {
            return Ok(());
        }
        let staged = batch.staged.len();
        self.write_staged(rule, transform, batch.staged, s)?;
        let previous = std::mem::replace(&mut s.checkpoint.resume_token, batch.last);
        if let Err(e) = self.commit_checkpoint(s) {
            s.checkpoint.resume_token = previous;
            return Err(e);
        }
        debug!("lote {} confirmado: {} leídos, {} preparados, token {:?}",
               s.report.batches, batch.pulled, staged, s.checkpoint.resume_token);
        Ok(())
    }

    /// Lectura-verificación-escritura por documento: relee cada documento,
    /// descarta los que ya no coinciden y escribe el resto en un único lote
    /// condicional. Los conflictos se reintentan hasta
    /// `max_write_attempts`.
    fn write_staged(&self,
                    rule: &TransformRule,
                    transform: &Transform,
                    staged: Vec<Staged>,
                    s: &mut Session<'_>)
                    -> Result<()> {
        let mut pending = staged;
        let mut attempt = 0u32;
        while !pending.is_empty() {
            attempt += 1;
            let ids: Vec<String> = pending.iter().map(|p| p.id.clone()).collect();
            let fresh: HashMap<String, Document> = self.documents
                                                       .fetch(s.collection, &ids)?
                                                       .into_iter()
                                                       .map(|d| (d.id.clone(), d))
                                                       .collect();
            let mut writes = Vec::with_capacity(pending.len());
            for p in pending {
                let current = match fresh.get(&p.id) {
                    Some(c) => c,
                    None => {
                        debug!("documento {} eliminado antes de escribir", p.id);
                        s.skip(1);
                        continue;
                    }
                };
                if !transform.matches(&current.body) {
                    debug!("documento {} ya no requiere migración (escritor concurrente)", p.id);
                    s.skip(1);
                    continue;
                }
                let body = if current.revision == p.revision {
                    p.after
                } else {
                    let after = transform.apply(&current.body);
                    if after == current.body || (s.options.strict && transform.matches(&after)) {
                        return Err(MigrationError::RuleInvariantViolation { rule: rule.name.clone(),
                                                                            version: rule.version,
                                                                            document: p.id });
                    }
                    after
                };
                writes.push(ConditionalWrite { id: p.id,
                                               expected_revision: current.revision,
                                               body });
            }
            if writes.is_empty() {
                break;
            }
            let outcomes = self.documents.write_batch(s.collection, &writes)?;
            if outcomes.len() != writes.len() {
                return Err(MigrationError::store(format!("el almacén devolvió {} resultados para {} escrituras",
                                                         outcomes.len(),
                                                         writes.len())));
            }
            let mut retry = Vec::new();
            for (w, outcome) in writes.into_iter().zip(outcomes) {
                match outcome {
                    WriteOutcome::Written { .. } => s.migrated(1),
                    WriteOutcome::Missing => s.skip(1),
                    WriteOutcome::Conflict => retry.push(Staged { id: w.id,
                                                                  revision: w.expected_revision,
                                                                  after: w.body }),
                }
            }
            if !retry.is_empty() {
                if attempt >= self.config.max_write_attempts {
                    return Err(MigrationError::Contention { context: format!("{} intentos", attempt),
                                                            document: retry[0].id.clone() });
                }
                warn!("{} escrituras en conflicto; reintento {}", retry.len(), attempt + 1);
            }
            pending = retry;
        }
        Ok(())
    }

    /// Escaneo de sólo lectura sobre un plan completado: cuenta los
    /// documentos ya convergidos y los que aún coinciden con alguna regla.
    fn verify(&self, plan: &MigrationPlan, s: &mut Session<'_>) -> Result<()> {
        let mut cursor = DocumentCursor::open(self.documents.as_ref(), s.collection, None, s.batch_size);
        while let Some(doc) = cursor.next().map_err(|e| e.context("verificación"))? {
            if plan.rules().iter().any(|r| r.predicate(&doc)) {
                s.report.pending_count += 1;
            } else {
                s.report.skipped_count += 1;
            }
        }
        if s.report.pending_count > 0 {
            warn!("plan '{}' completado pero {} documentos aún coinciden; use force_rescan",
                  plan.name, s.report.pending_count);
        } else {
            info!("plan '{}' ya completado; nada que hacer", plan.name);
        }
        Ok(())
    }

    /// Toma el lease y marca el checkpoint como `running`.
    fn begin(&self, s: &mut Session<'_>) -> Result<()> {
        if s.options.dry_run {
            return Ok(());
        }
        let now = Utc::now();
        let cp = &mut s.checkpoint;
        // un lease vigente bloquea incluso a su propio owner: la otra
        // ejecución puede seguir en curso sobre este mismo motor
        if cp.status == CheckpointStatus::Running && cp.lease_owner.is_some() {
            if cp.lease_is_fresh(now, self.config.lease_ttl) {
                return Err(MigrationError::AlreadyRunning { name: cp.name.clone(),
                                                            owner: cp.lease_owner,
                                                            renewed_at: cp.lease_renewed_at });
            }
            warn!("lease de {:?} vencido (renovado {:?}); se retoma '{}'",
                  cp.lease_owner, cp.lease_renewed_at, cp.name);
        }
        cp.status = CheckpointStatus::Running;
        cp.lease_owner = Some(self.config.owner);
        cp.lease_renewed_at = Some(now);
        cp.last_error = None;
        self.persist(cp)?;
        s.lease_held = true;
        Ok(())
    }

    /// Renueva el lease y guarda el checkpoint con control optimista.
    fn commit_checkpoint(&self, s: &mut Session<'_>) -> Result<()> {
        if s.options.dry_run {
            return Ok(());
        }
        s.checkpoint.lease_renewed_at = Some(Utc::now());
        self.persist(&mut s.checkpoint)
    }

    fn complete(&self, s: &mut Session<'_>) -> Result<()> {
        s.report.plan_version = s.checkpoint.plan_version;
        if s.options.dry_run {
            return Ok(());
        }
        let cp = &mut s.checkpoint;
        cp.status = CheckpointStatus::Completed;
        cp.direction = Direction::Forward;
        cp.active_version = None;
        cp.resume_token = None;
        cp.lease_owner = None;
        cp.lease_renewed_at = None;
        self.persist(cp)?;
        s.lease_held = false;
        info!("migración '{}' completada en v{}", cp.name, cp.plan_version);
        Ok(())
    }

    /// Cancelación: el lote en curso ya se confirmó; se libera el lease y
    /// el checkpoint queda `running` con su token.
    fn pause(&self, s: &mut Session<'_>) -> Result<()> {
        s.report.cancelled = true;
        s.report.plan_version = s.checkpoint.plan_version;
        if s.options.dry_run {
            return Ok(());
        }
        let cp = &mut s.checkpoint;
        cp.lease_owner = None;
        cp.lease_renewed_at = None;
        self.persist(cp)?;
        s.lease_held = false;
        info!("migración '{}' cancelada en {:?}", cp.name, cp.resume_token);
        Ok(())
    }

    fn finish(&self, mut s: Session<'_>, outcome: Result<()>) -> RunResult {
        match outcome {
            Ok(()) => {
                s.report.final_status = if s.options.dry_run { s.initial_status } else { s.checkpoint.status };
                s.report.plan_version = s.checkpoint.plan_version;
                Ok(s.report)
            }
            Err(error) => {
                if s.lease_held && !matches!(error, MigrationError::AlreadyRunning { .. }) {
                    self.mark_failed(&mut s, &error);
                }
                error!("migración '{}' falló: {}", s.checkpoint.name, error);
                s.report.final_status = if s.options.dry_run { s.initial_status } else { s.checkpoint.status };
                s.report.plan_version = s.checkpoint.plan_version;
                Err(RunFailure { report: s.report,
                                 error })
            }
        }
    }

    /// `running -> failed`, conservando el último token confirmado.
    fn mark_failed(&self, s: &mut Session<'_>, err: &MigrationError) {
        let cp = &mut s.checkpoint;
        cp.status = CheckpointStatus::Failed;
        cp.lease_owner = None;
        cp.lease_renewed_at = None;
        cp.last_error = Some(err.to_string());
        if let Err(e) = self.persist(cp) {
            warn!("no se pudo registrar el fallo de '{}': {}", cp.name, e);
        }
        s.lease_held = false;
    }

    fn persist(&self, cp: &mut Checkpoint) -> Result<()> {
        cp.updated_at = Utc::now();
        match self.checkpoints.save(cp, cp.revision)? {
            PersistResult::Ok { new_version } => {
                cp.revision = new_version;
                Ok(())
            }
            PersistResult::Conflict => {
                let current = self.checkpoints.load(&cp.name).ok().flatten();
                Err(MigrationError::AlreadyRunning { name: cp.name.clone(),
                                                     owner: current.as_ref().and_then(|c| c.lease_owner),
                                                     renewed_at: current.and_then(|c| c.lease_renewed_at) })
            }
        }
    }
}
