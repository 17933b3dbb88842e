use anyhow::{anyhow, Result};
use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static INSTALLED: OnceCell<()> = OnceCell::new();

/// Installs the stderr subscriber. `RUST_LOG` wins over `level` when set.
/// Later calls are no-ops.
pub fn init(level: &str) -> Result<()> {
    INSTALLED
        .get_or_try_init(|| {
            let filter = match EnvFilter::try_from_default_env() {
                Ok(filter) => filter,
                Err(_) => EnvFilter::try_new(filter_directive(level))
                    .map_err(|err| anyhow!("logging: invalid level {level:?}: {err}"))?,
            };
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .try_init()
                .map_err(|err| anyhow!("logging: {err}"))
        })
        .map(|_| ())
}

/// A bare level applies to this crate only; anything else is taken as a
/// full filter directive.
fn filter_directive(level: &str) -> String {
    let level = level.trim();
    match level.to_ascii_lowercase().as_str() {
        "" => "confession_board=warn".to_string(),
        "trace" | "debug" | "info" | "warn" | "error" | "off" => {
            format!("confession_board={}", level.to_ascii_lowercase())
        }
        _ => level.to_string(),
    }
}
