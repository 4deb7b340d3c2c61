// Archivo: main.rs
// Propósito: punto de entrada de `docmigrate`. Configura el logging, instala
// el manejador de Ctrl-C y ejecuta el subcomando en un hilo bloqueante.
mod cli;

use clap::Parser;
use log::{error, warn};
use migration::CancelToken;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = cli::Cli::parse();
    env_logger::Builder::new().parse_filters(&cli.log_level).init();

    // Ctrl-C pide una cancelación cooperativa: el lote en curso se confirma
    let cancel = CancelToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C recibido; se detiene tras el lote en curso");
            signal.cancel();
        }
    });

    match tokio::task::spawn_blocking(move || cli::execute(cli, cancel)).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("la ejecución terminó de forma inesperada: {}", e);
            ExitCode::from(cli::EXIT_FAILURE)
        }
    }
}
