//! Logger setup shared by the binaries

use console::style;
use env_logger::{Builder, Env};
use log::Level;
use std::io::Write;

/// Styled, fixed-width level tag
pub fn level_tag(level: Level) -> String {
    match level {
        Level::Error => format!("{}", style("ERROR").red().bold()),
        Level::Warn => format!("{}", style("WARN ").yellow().bold()),
        Level::Info => format!("{}", style("INFO ").green()),
        Level::Debug => format!("{}", style("DEBUG").cyan()),
        Level::Trace => format!("{}", style("TRACE").dim()),
    }
}

/// Default filter when `RUST_LOG` is unset
pub fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "info"
    }
}

/// Initialize logger based on verbose flag; `RUST_LOG` takes precedence.
/// Calling it again is harmless.
pub fn init_logger(verbose: bool) {
    let env = Env::default().filter_or("RUST_LOG", default_filter(verbose));

    let _ = Builder::from_env(env)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {} {} {}",
                style(chrono::Local::now().format("%H:%M:%S%.3f")).dim(),
                level_tag(record.level()),
                style(record.target()).dim(),
                record.args()
            )
        })
        .try_init();
}
