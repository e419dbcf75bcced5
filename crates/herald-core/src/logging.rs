use crate::{Error, Result};

/// Initialize tracing for a Herald process.
///
/// Default: info for our crates, warn for everything else. `RUST_LOG` overrides.
pub fn init(service_name: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let crate_target = service_name.replace('-', "_");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,herald=info,herald_core=info,herald_x=info,herald_openai=info,herald_sqlite=info,{crate_target}=info"
        ))
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialized: {e}")))
}
