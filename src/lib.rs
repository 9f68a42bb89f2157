mod errors;
mod models;
mod repository;
mod service;
mod store;
pub mod timer;

pub use errors::{AppError, AppResult};
pub use models::{validate_label, Record};
pub use repository::RecordRepository;
pub use service::TimerService;
pub use store::RecordStore;

use once_cell::sync::OnceCell;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Daily-rolling JSON log under `<data_dir>/logs`. Call once at startup;
/// `RUST_LOG` overrides the default `info` filter.
pub fn init_tracing(data_dir: &Path) -> Result<(), String> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "stackwatch.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}
