use colored::{ColoredString, Colorize};
use env_logger::{Builder, Env, Target};
use log::{Level, Record};
use std::io::Write;

/// Environment variable holding the log filter, in `env_logger` directive syntax
pub const LOG_ENV: &str = "CARDSYNC_LOG";

// Our own messages at info, the HTTP and TLS stack only when something goes wrong
const DEFAULT_FILTER: &str = "warn,cardsync=info";

/// Sets up colored logging on stderr, leaving stdout to tables and JSON.
///
/// `CARDSYNC_LOG` replaces the default filter, e.g. `CARDSYNC_LOG=cardsync::sync=trace`.
pub fn setup_log() {
    let mut builder = Builder::from_env(Env::new().filter_or(LOG_ENV, DEFAULT_FILTER));
    builder
        .target(Target::Stderr)
        .format(|buf, record| writeln!(buf, "{}", render(record)));

    // A second call, e.g. from tests, keeps the first logger
    let _ = builder.try_init();
}

fn level_label(level: Level) -> ColoredString {
    let label = format!("{level:<5}");
    match level {
        Level::Error => label.red().bold(),
        Level::Warn => label.yellow().bold(),
        Level::Info => label.green().bold(),
        Level::Debug => label.blue().bold(),
        Level::Trace => label.purple().bold(),
    }
}

// Debug and trace lines name the module they came from
fn render(record: &Record<'_>) -> String {
    let level = record.level();
    match level {
        Level::Debug | Level::Trace => {
            format!("{} {}: {}", level_label(level), record.target(), record.args())
        }
        _ => format!("{} {}", level_label(level), record.args()),
    }
}
