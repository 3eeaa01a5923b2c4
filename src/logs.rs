// src/logs.rs
//
// =============================================================================
// REPX-LAB: LOGGING
// =============================================================================
//
// env_logger front end for the binary. The library only talks to the `log`
// facade.
//
// Format: `[HH:MM:SS target] message`, target trimmed to its last segment
// (e.g. "repx_lab::scatter" -> "scatter").

use chrono::Local;
use env_logger::{Builder, Env};
use log::LevelFilter;
use std::io::Write;

/// Default level for a `-v` count: 0 -> info, 1 -> debug, 2+ -> trace.
pub fn level_for(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Installs the global logger. `RUST_LOG` wins over `verbosity`.
/// Calling it twice is harmless (the second call is ignored).
pub fn init(verbosity: u8) {
    let default = level_for(verbosity).to_string().to_lowercase();
    let _ = Builder::from_env(Env::default().default_filter_or(default))
        .format(|buf, record| {
            let timestamp = Local::now().format("%H:%M:%S");
            let target_full = record.target();
            let target = target_full.rsplit("::").next().unwrap_or(target_full);
            writeln!(buf, "[{} {}] {}", timestamp, target, record.args())
        })
        .try_init();
}
