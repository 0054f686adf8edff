//! Log output for hosts embedding the runtime.
//!
//! The runtime only emits `tracing` events. Hosts that do not install their
//! own subscriber can call [`init`].

use tracing_subscriber::EnvFilter;

use crate::config::env_vars;

/// Install a global fmt subscriber.
///
/// The filter comes from `RUST_LOG`, falling back to `default_directive`
/// (for example `"apf_core=info"`). Output is JSON when `APF_LOG_JSON=true`.
/// Returns `false` when a global subscriber was already installed.
pub fn init(default_directive: &str) -> bool {
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(default_directive).unwrap_or_else(|_| EnvFilter::new("info"))
    });

    let installed = if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .try_init()
    };
    installed.is_ok()
}
