//! Structured logging.
//!
//! Every record is written as a single JSON object per line:
//!
//! ```text
//! {"time":"2024-05-01T10:00:00.000Z","level":"warning","category":"watcher","message":"..."}
//! ```
//!
//! `category` is the module that emitted the line.  Filtering follows the
//! usual `RUST_LOG` syntax and defaults to `info`.

use std::io::Write;

use env_logger::Env;
use log::{Level, Record};
use serde_json::json;

/// Install the JSON formatter as the global logger.
pub fn init() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format(|buf, record| {
            let line = json!({
                "time": buf.timestamp_millis().to_string(),
                "level": level_name(record.level()),
                "category": category(record),
                "message": record.args().to_string(),
            });
            writeln!(buf, "{}", line)
        })
        .init();
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::Error => "error",
        Level::Warn => "warning",
        Level::Info => "info",
        Level::Debug => "debug",
        Level::Trace => "trace",
    }
}

fn category<'a>(record: &'a Record<'_>) -> &'a str {
    let target = record.target();
    target.rsplit("::").next().unwrap_or(target)
}
