// Archivo: pool.rs
// Propósito: pool r2d2 compartido por los almacenes Diesel, con timeout
// explícito en cada conexión y migraciones de esquema embebidas.
use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::result::Error as DieselError;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::{debug, info};
use migration::{MigrationError, Result};
use std::sync::Arc;
use std::time::Duration;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");

/// Timeout por defecto de cada llamada al almacén.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(feature = "pg")]
pub(crate) type DbConn = diesel::pg::PgConnection;
#[cfg(not(feature = "pg"))]
pub(crate) type DbConn = diesel::sqlite::SqliteConnection;

type DbPool = Pool<ConnectionManager<DbConn>>;
pub(crate) type PooledConn = PooledConnection<ConnectionManager<DbConn>>;

/// Aplica el timeout a cada conexión nueva del pool.
#[derive(Debug, Clone, Copy)]
struct StoreTimeout(Duration);

impl CustomizeConnection<DbConn, diesel::r2d2::Error> for StoreTimeout {
  fn on_acquire(&self, conn: &mut DbConn) -> std::result::Result<(), diesel::r2d2::Error> {
    let ms = self.0.as_millis();
    #[cfg(not(feature = "pg"))]
    let sql = format!("PRAGMA busy_timeout = {}; PRAGMA journal_mode = WAL;", ms);
    #[cfg(feature = "pg")]
    let sql = format!("SET statement_timeout = {};", ms);
    conn.batch_execute(&sql).map_err(diesel::r2d2::Error::QueryError)
  }
}

/// Pool de conexiones. Se clona barato y se comparte entre
/// `DieselDocumentStore` y `DieselCheckpointStore`.
#[derive(Clone)]
pub struct SqlPool {
  pool: Arc<DbPool>,
}

impl SqlPool {
  /// Crea el pool y aplica las migraciones pendientes.
  pub fn connect(database_url: &str, timeout: Duration) -> Result<Self> {
    let manager = ConnectionManager::<DbConn>::new(database_url);
    let pool = Pool::builder().max_size(4)
                              .connection_timeout(timeout)
                              .connection_customizer(Box::new(StoreTimeout(timeout)))
                              .build(manager)
                              .map_err(|e| MigrationError::store(format!("pool: {}", e)))?;
    let sql = SqlPool { pool: Arc::new(pool) };
    sql.migrate()?;
    debug!("pool listo (timeout {:?})", timeout);
    Ok(sql)
  }

  fn migrate(&self) -> Result<()> {
    let mut conn = self.conn()?;
    let applied = conn.run_pending_migrations(MIGRATIONS)
                      .map_err(|e| MigrationError::store(format!("migraciones: {}", e)))?;
    if !applied.is_empty() {
      info!("{} migraciones de esquema aplicadas", applied.len());
    }
    Ok(())
  }

  fn conn_raw(&self) -> std::result::Result<PooledConn, r2d2::Error> {
    self.pool.get()
  }

  pub(crate) fn conn(&self) -> Result<PooledConn> {
    self.conn_raw().map_err(|e| MigrationError::store(format!("pool: {}", e)))
  }
}

pub(crate) fn map_db_err<T>(res: std::result::Result<T, DieselError>) -> Result<T> {
  res.map_err(|e| MigrationError::store(format!("db: {}", e)))
}

/// Construye el pool desde el entorno (`.env` incluido):
/// `MIGRATOR_DB_URL` (o `DATABASE_URL`) y `MIGRATOR_STORE_TIMEOUT_SECS`.
pub fn new_from_env() -> Result<SqlPool> {
  dotenvy::dotenv().ok();
  let url = std::env::var("MIGRATOR_DB_URL").or_else(|_| std::env::var("DATABASE_URL"))
                                            .map_err(|_| {
                                              MigrationError::InvalidArgument("MIGRATOR_DB_URL / DATABASE_URL no definida".into())
                                            })?;
  let timeout = match std::env::var("MIGRATOR_STORE_TIMEOUT_SECS") {
    Ok(raw) => raw.trim()
                  .parse::<u64>()
                  .map(Duration::from_secs)
                  .map_err(|_| MigrationError::InvalidArgument(format!("MIGRATOR_STORE_TIMEOUT_SECS inválido: '{}'", raw)))?,
    Err(_) => DEFAULT_STORE_TIMEOUT,
  };
  check_url(&url)?;
  SqlPool::connect(&url, timeout)
}

#[cfg(feature = "pg")]
fn check_url(url: &str) -> Result<()> {
  if url.starts_with("postgres://") || url.starts_with("postgresql://") || url.contains('@') {
    return Ok(());
  }
  Err(MigrationError::InvalidArgument("la URL no parece de Postgres".into()))
}

#[cfg(not(feature = "pg"))]
fn check_url(url: &str) -> Result<()> {
  if url.starts_with("postgres://") || url.starts_with("postgresql://") {
    return Err(MigrationError::InvalidArgument("compilado sin el feature 'pg'; habilítelo para usar Postgres".into()));
  }
  Ok(())
}
