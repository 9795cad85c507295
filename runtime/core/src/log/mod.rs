//! Process logging bootstrap.
//!
//! Library code logs through the `log` facade; binaries call [`init`]
//! once to wire it to the environment.

use once_cell::sync::OnceCell;

static INIT: OnceCell<()> = OnceCell::new();

/// Initializes the global logger from the `TRACEMUX_LOG` environment
/// variable (same syntax as `RUST_LOG`; defaults to `warn`).
///
/// Idempotent: only the first call has an effect.
pub fn init() {
    INIT.get_or_init(|| {
        let env = env_logger::Env::new().filter_or("TRACEMUX_LOG", "warn");
        let _ = env_logger::Builder::from_env(env)
            .format_timestamp_micros()
            .try_init();
    });
}
