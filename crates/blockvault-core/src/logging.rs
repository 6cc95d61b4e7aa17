//! Log setup for the `blockvault` CLI and the system adapters.
//!
//! Lifecycle steps log mapping names, paths and key fingerprints; key text
//! itself never reaches a log record.

use env_logger::Env;
use serde_json::json;
use std::env;
use std::io::Write;
use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

const FORMAT_ENV: &str = "BLOCKVAULT_LOG_FORMAT";
const LEVEL_ENV: &str = "BLOCKVAULT_LOG_LEVEL";

/// Install the process-wide logger used by every lifecycle step.
///
/// The first caller wins; subsequent calls are no-ops. If `RUST_LOG` is
/// unset, the `default_level` argument is used, overridable via
/// `BLOCKVAULT_LOG_LEVEL`. `BLOCKVAULT_LOG_FORMAT` can be set to `plain` to
/// disable JSON output.
pub fn init(default_level: &str) {
    let _ = INIT.get_or_init(|| configure(default_level));
}

fn configure(default_level: &str) {
    let level = env::var(LEVEL_ENV).unwrap_or_else(|_| default_level.to_string());
    let env = Env::default().default_filter_or(level);

    let mut builder = env_logger::Builder::from_env(env);
    if json_format() {
        builder.format(|buf, record| {
            let payload = json!({
                "timestamp": buf.timestamp().to_string(),
                "level": record.level().to_string().to_lowercase(),
                "target": record.target(),
                "message": record.args().to_string(),
            });
            writeln!(buf, "{}", payload)
        });
    } else {
        builder.format(|buf, record| {
            writeln!(
                buf,
                "{} {} {} - {}",
                buf.timestamp(),
                record.level().to_string().to_lowercase(),
                record.target(),
                record.args()
            )
        });
    }

    if let Err(err) = builder.try_init() {
        eprintln!("failed to initialize logger: {}", err);
    }
}

fn json_format() -> bool {
    env::var(FORMAT_ENV)
        .map(|value| !value.eq_ignore_ascii_case("plain"))
        .unwrap_or(true)
}
