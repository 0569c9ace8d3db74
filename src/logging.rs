//! Logger set-up for the daemon binary
//!
//! Library code only talks to the `log` facade. The binary installs
//! `env_logger` here; the filter comes from `TAPESERVERD_LOG` and defaults to
//! `info`.

use std::io::Write;

/// Environment variable holding the log filter, e.g. `debug` or `tapeserver=trace`
pub const LOG_ENV: &str = "TAPESERVERD_LOG";

pub const DEFAULT_FILTER: &str = "info";

/// Install the global logger. Later calls are ignored.
pub fn init() {
    let env = env_logger::Env::new().filter_or(LOG_ENV, DEFAULT_FILTER);
    let _ = env_logger::Builder::from_env(env)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {} pid={} {}",
                buf.timestamp_millis(),
                record.level(),
                std::process::id(),
                record.args()
            )
        })
        .try_init();
}
