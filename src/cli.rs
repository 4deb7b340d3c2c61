// Archivo: cli.rs
// Propósito: definición de la línea de comandos de `docmigrate` y ejecución
// de cada subcomando sobre los almacenes Diesel.
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use migration::{builtin_plans, CancelToken, Checkpoint, MigrationEngineConfig, MigrationError, MigrationService, PlanDefinition,
                RunFailure, RunOptions, RunReport, RunResult};
use migration_persistence::{DieselCheckpointStore, DieselDocumentStore};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

type Service = MigrationService<DieselDocumentStore, DieselCheckpointStore>;

pub const EXIT_OK: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONTENTION: u8 = 2;
pub const EXIT_CANCELLED: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "docmigrate")]
#[command(about = "Migraciones reanudables de documentos JSON")]
pub struct Cli {
    /// Filtro de logs (sintaxis de RUST_LOG)
    #[arg(long, global = true, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,
    /// Imprime el resultado como JSON
    #[arg(long, global = true)]
    pub json: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Aplica las reglas pendientes de un plan
    Run {
        #[command(flatten)]
        source: PlanSource,
        #[command(flatten)]
        batch: BatchArgs,
        /// Vuelve a escanear un plan ya completado
        #[arg(long)]
        force_rescan: bool,
    },
    /// Revierte un plan hasta la versión indicada
    Rollback {
        #[command(flatten)]
        source: PlanSource,
        #[command(flatten)]
        batch: BatchArgs,
        #[arg(long)]
        to: i64,
    },
    /// Muestra el checkpoint actual de un plan
    Status {
        #[arg(long)]
        plan: String,
    },
    /// Muestra el historial de checkpoints de un plan
    History {
        #[arg(long)]
        plan: String,
    },
    /// Lista los planes incluidos
    Plans,
}

#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = false)]
pub struct PlanSource {
    /// Nombre de un plan incluido
    #[arg(long)]
    pub plan: Option<String>,
    /// Fichero JSON con un plan declarativo
    #[arg(long)]
    pub plan_file: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct BatchArgs {
    #[arg(long, env = "MIGRATOR_COLLECTION")]
    pub collection: Option<String>,
    #[arg(long, env = "MIGRATOR_BATCH_SIZE", default_value_t = 500)]
    pub batch_size: usize,
    #[arg(long, env = "MIGRATOR_LEASE_TTL_SECS", default_value_t = 60)]
    pub lease_ttl_secs: i64,
    /// Calcula los cambios sin escribir nada
    #[arg(long)]
    pub dry_run: bool,
    /// Autocomprobación de convergencia en cada documento
    #[arg(long)]
    pub strict: bool,
}

impl BatchArgs {
    fn options(&self, cancel: CancelToken) -> RunOptions {
        RunOptions { dry_run: self.dry_run,
                     strict: self.strict,
                     force_rescan: false,
                     cancel: Some(cancel) }
    }

    fn config(&self) -> MigrationEngineConfig {
        MigrationEngineConfig { lease_ttl: chrono::Duration::seconds(self.lease_ttl_secs),
                                ..MigrationEngineConfig::default() }
    }
}

#[derive(Serialize)]
struct FailureSummary<'a> {
    error: String,
    report: &'a RunReport,
}

#[derive(Serialize)]
struct PlanSummary {
    name: String,
    collection: Option<String>,
    versions: Vec<i64>,
}

/// Ejecuta el subcomando y devuelve el código de salida.
pub fn execute(cli: Cli, cancel: CancelToken) -> u8 {
    let json = cli.json;
    match cli.command {
        Command::Plans => list_plans(json),
        Command::Status { plan } => show(json, |svc| svc.status(&plan).map(|cp| cp.into_iter().collect())),
        Command::History { plan } => show(json, |svc| svc.history(&plan)),
        Command::Run { source, batch, force_rescan } => {
            let options = RunOptions { force_rescan,
                                       ..batch.options(cancel) };
            match prepare(&source, &batch) {
                Ok((svc, name)) => {
                    info!("ejecutando plan '{}' (lote {}, dry_run {})", name, batch.batch_size, options.dry_run);
                    report(json, svc.run(&name, batch.collection.as_deref(), batch.batch_size, &options))
                }
                Err(e) => setup_failed(&e),
            }
        }
        Command::Rollback { source, batch, to } => {
            let options = batch.options(cancel);
            match prepare(&source, &batch) {
                Ok((svc, name)) => {
                    info!("revirtiendo plan '{}' hasta v{}", name, to);
                    report(json, svc.rollback(&name, batch.collection.as_deref(), to, batch.batch_size, &options))
                }
                Err(e) => setup_failed(&e),
            }
        }
    }
}

fn prepare(source: &PlanSource, batch: &BatchArgs) -> migration::Result<(Service, String)> {
    let mut svc = open(batch.config())?;
    let name = register(&mut svc, source)?;
    Ok((svc, name))
}

/// Abre los almacenes del entorno y registra los planes incluidos.
fn open(config: MigrationEngineConfig) -> migration::Result<Service> {
    let (documents, checkpoints) = migration_persistence::stores_from_env()?;
    let mut svc = MigrationService::new(Arc::new(documents), Arc::new(checkpoints), config);
    svc.register_builtins()?;
    Ok(svc)
}

/// Resuelve el plan pedido; un `--plan-file` se registra junto a los incluidos.
fn register(svc: &mut Service, source: &PlanSource) -> migration::Result<String> {
    match (&source.plan, &source.plan_file) {
        (Some(name), _) => Ok(name.clone()),
        (None, Some(path)) => {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                                                        MigrationError::InvalidArgument(format!("no se pudo leer {}: {}",
                                                                                                path.display(),
                                                                                                e))
                                                    })?;
            svc.register_definition(PlanDefinition::from_json(&raw)?)
        }
        (None, None) => Err(MigrationError::InvalidArgument("indique --plan o --plan-file".into())),
    }
}

fn show<F>(json: bool, query: F) -> u8
    where F: FnOnce(&Service) -> migration::Result<Vec<Checkpoint>>
{
    let checkpoints = match open(MigrationEngineConfig::default()).and_then(|svc| query(&svc)) {
        Ok(cps) => cps,
        Err(e) => return setup_failed(&e),
    };
    if json {
        match serde_json::to_string_pretty(&checkpoints) {
            Ok(text) => println!("{}", text),
            Err(e) => return setup_failed(&e.into()),
        }
    } else if checkpoints.is_empty() {
        println!("sin checkpoint");
    } else {
        for cp in &checkpoints {
            println!("rev {:>4}  {:<9}  v{}  activa {:?}  {}  token {}  migrados {}  omitidos {}{}",
                     cp.revision,
                     cp.status.as_str(),
                     cp.plan_version,
                     cp.active_version,
                     cp.direction.as_str(),
                     cp.resume_token.as_ref().map(|t| t.as_str()).unwrap_or("-"),
                     cp.migrated_count,
                     cp.skipped_count,
                     cp.last_error.as_ref().map(|e| format!("  error: {}", e)).unwrap_or_default());
        }
    }
    EXIT_OK
}

fn list_plans(json: bool) -> u8 {
    let plans = match builtin_plans() {
        Ok(plans) => plans,
        Err(e) => return setup_failed(&e),
    };
    if json {
        let summaries: Vec<PlanSummary> = plans.iter()
                                               .map(|b| PlanSummary { name: b.plan.name.clone(),
                                                                      collection: Some(b.collection.to_string()),
                                                                      versions: b.plan.rules().iter().map(|r| r.version).collect() })
                                               .collect();
        match serde_json::to_string_pretty(&summaries) {
            Ok(text) => println!("{}", text),
            Err(e) => return setup_failed(&e.into()),
        }
    } else {
        for b in &plans {
            println!("{}  (colección {}, v{})  {}", b.plan.name, b.collection, b.plan.latest_version(), b.description);
        }
    }
    EXIT_OK
}

fn report(json: bool, result: RunResult) -> u8 {
    let code = exit_code(&result);
    match &result {
        Ok(report) => {
            if json {
                match serde_json::to_string_pretty(report) {
                    Ok(text) => println!("{}", text),
                    Err(e) => warn!("no se pudo serializar el informe: {}", e),
                }
            } else {
                print_report(report);
            }
        }
        Err(RunFailure { report, error }) => {
            if json {
                let summary = FailureSummary { error: error.to_string(),
                                               report };
                match serde_json::to_string_pretty(&summary) {
                    Ok(text) => println!("{}", text),
                    Err(e) => warn!("no se pudo serializar el informe: {}", e),
                }
            } else {
                print_report(report);
            }
            eprintln!("Error: {}", error);
        }
    }
    code
}

fn print_report(report: &RunReport) {
    println!("plan {} sobre '{}'", report.plan, report.collection);
    println!("  migrated_count: {}", report.migrated_count);
    println!("  skipped_count:  {}", report.skipped_count);
    println!("  final_status:   {}", report.final_status);
    println!("  plan_version:   {}", report.plan_version);
    if report.pending_count > 0 {
        println!("  pendientes:     {}", report.pending_count);
    }
    if report.dry_run {
        println!("  dry-run: {} cambios previstos", report.intended_changes.len());
        for change in &report.intended_changes {
            println!("    v{} {}: {} -> {}", change.rule_version, change.document_id, change.before, change.after);
        }
    }
    if report.cancelled {
        println!("  cancelado; se reanudará desde el último checkpoint");
    }
}

/// 0 completado, 1 fallo, 2 contención, 3 cancelado.
pub fn exit_code(result: &RunResult) -> u8 {
    match result {
        Ok(report) if report.cancelled => EXIT_CANCELLED,
        Ok(report) if report.dry_run || report.final_status == migration::CheckpointStatus::Completed => EXIT_OK,
        Ok(_) => EXIT_FAILURE,
        Err(failure) => match failure.error {
            MigrationError::AlreadyRunning { .. } | MigrationError::Contention { .. } => EXIT_CONTENTION,
            _ => EXIT_FAILURE,
        },
    }
}

fn setup_failed(error: &MigrationError) -> u8 {
    eprintln!("Error: {}", error);
    match error {
        MigrationError::AlreadyRunning { .. } | MigrationError::Contention { .. } => EXIT_CONTENTION,
        _ => EXIT_FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration::CheckpointStatus;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("argumentos válidos")
    }

    #[test]
    fn run_accepts_builtin_plan_and_flags() {
        let cli = parse(&["docmigrate", "run", "--plan", "syncerconf-schedule-times", "--collection", "c", "--batch-size", "10",
                          "--dry-run", "--json"]);
        assert!(cli.json);
        match cli.command {
            Command::Run { source, batch, force_rescan } => {
                assert_eq!(source.plan.as_deref(), Some("syncerconf-schedule-times"));
                assert_eq!(batch.collection.as_deref(), Some("c"));
                assert_eq!(batch.batch_size, 10);
                assert!(batch.dry_run);
                assert!(!batch.strict);
                assert!(!force_rescan);
            }
            other => panic!("subcomando inesperado: {:?}", other),
        }
    }

    #[test]
    fn plan_and_plan_file_are_exclusive() {
        assert!(Cli::try_parse_from(["docmigrate", "run", "--plan", "a", "--plan-file", "b.json"]).is_err());
        assert!(Cli::try_parse_from(["docmigrate", "run"]).is_err());
    }

    #[test]
    fn rollback_requires_target_version() {
        assert!(Cli::try_parse_from(["docmigrate", "rollback", "--plan", "a"]).is_err());
        match parse(&["docmigrate", "rollback", "--plan-file", "p.json", "--to", "0"]).command {
            Command::Rollback { source, to, .. } => {
                assert_eq!(to, 0);
                assert_eq!(source.plan_file, Some(PathBuf::from("p.json")));
            }
            other => panic!("subcomando inesperado: {:?}", other),
        }
    }

    fn report_with(status: CheckpointStatus) -> RunReport {
        let mut report = RunReport::new("p", "c", false);
        report.final_status = status;
        report
    }

    #[test]
    fn exit_codes_follow_outcome() {
        assert_eq!(exit_code(&Ok(report_with(CheckpointStatus::Completed))), EXIT_OK);
        assert_eq!(exit_code(&Ok(report_with(CheckpointStatus::Running))), EXIT_FAILURE);

        let mut cancelled = report_with(CheckpointStatus::Running);
        cancelled.cancelled = true;
        assert_eq!(exit_code(&Ok(cancelled)), EXIT_CANCELLED);

        let mut dry = RunReport::new("p", "c", true);
        dry.final_status = CheckpointStatus::Idle;
        assert_eq!(exit_code(&Ok(dry)), EXIT_OK);

        let busy = RunFailure { report: report_with(CheckpointStatus::Running),
                                error: MigrationError::AlreadyRunning { name: "p".into(),
                                                                        owner: None,
                                                                        renewed_at: None } };
        assert_eq!(exit_code(&Err(busy)), EXIT_CONTENTION);

        let broken = RunFailure { report: report_with(CheckpointStatus::Failed),
                                  error: MigrationError::corrupt("p", "token sin regla") };
        assert_eq!(exit_code(&Err(broken)), EXIT_FAILURE);
    }
}
