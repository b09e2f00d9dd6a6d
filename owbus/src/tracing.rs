//! Logging for owbus.
//!
//! Binaries call [`init_journald_or_stdout`] once at startup. Library code
//! uses `crate::tracing::prelude::*` for the event macros; everything that
//! happens on a bus runs inside that bus's [`bus_span`], so events carry the
//! bus index and adapter name without repeating them.

use std::env;
use time::OffsetDateTime;
use tracing::Span;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Filter directives, e.g. `OWBUS_LOG=owbus::transaction=trace`.
pub const LOG_ENV: &str = "OWBUS_LOG";

/// Identifier journald files our entries under.
const SYSLOG_IDENTIFIER: &str = "owbus";

/// Initialize logging.
///
/// Under systemd, entries go to journald; otherwise to stdout.
pub fn init_journald_or_stdout() {
    if env::var_os("JOURNAL_STREAM").is_none() {
        use_stdout();
        return;
    }
    match tracing_journald::layer() {
        Ok(layer) => {
            tracing_subscriber::registry()
                .with(filter())
                .with(layer.with_syslog_identifier(SYSLOG_IDENTIFIER.to_string()))
                .init();
        }
        Err(e) => {
            use_stdout();
            error!(error = %e, "journald unavailable, logging to stdout");
        }
    }
}

/// Span for work on one bus.
pub fn bus_span(index: usize, adapter: &str) -> Span {
    tracing::debug_span!("bus", index, adapter)
}

fn use_stdout() {
    tracing_subscriber::registry()
        .with(filter())
        .with(tracing_subscriber::fmt::layer().with_timer(LocalTimer))
        .init();
}

/// `OWBUS_LOG` if set, else `RUST_LOG`.
fn filter_var() -> &'static str {
    if env::var_os(LOG_ENV).is_some() {
        LOG_ENV
    } else {
        "RUST_LOG"
    }
}

fn filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(filter_var())
        .from_env_lossy()
}

// Local time to the nearest second, to line up with notes taken at the bench.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or(OffsetDateTime::now_utc());
        let stamp = now
            .format(time::macros::format_description!(
                "[hour]:[minute]:[second]"
            ))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{stamp}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_owbus_log_takes_precedence() {
        env::set_var(LOG_ENV, "owbus=trace");
        let chosen = filter_var();
        env::remove_var(LOG_ENV);
        assert_eq!(chosen, LOG_ENV);
        assert_eq!(filter_var(), "RUST_LOG");
    }

    #[test]
    fn test_timer_formats_clock_time() {
        let mut text = String::new();
        LocalTimer.format_time(&mut Writer::new(&mut text)).unwrap();
        assert_eq!(text.len(), "12:34:56".len());
        assert_eq!(text.matches(':').count(), 2);
    }
}
