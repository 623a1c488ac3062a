//! Log output for the `infraflow` binary.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber, writing to stderr so stdout carries only
/// the run record. `RUST_LOG` overrides `level`. Only the first call in a
/// process has any effect.
pub fn init_tracing(json: bool, level: Level) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.ok();
}
