//! This crate configures diagnostics for txbench. Everything the benchmark reports about its own
//! operation (connection failures, aborted clients, `debug()` output from scripts) goes through
//! the [tracing] family of crates; this crate only deals with installing a subscriber.
//!
//! Benchmark *results* are not diagnostics: the progress lines, the final report and the
//! per-transaction log are written directly by the `txbench` crate and never pass through here.
//!
//! Diagnostics are written to stderr, or to a rolling file when `--log-path` is set.

use std::path::Path;

use clap::{Args, ValueEnum};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

mod error;
pub use error::Error;
mod logformat;
pub use logformat::LogFormat;

fn warn_if_debug_build() {
    #[cfg(debug_assertions)]
    tracing::warn!("Running a debug build, timings will not be representative")
}

#[derive(Debug, Clone, Args)]
#[group(id = "logging")]
pub struct Options {
    /// Optional directory to write diagnostics to instead of stderr. Files rollover based on
    /// the chosen `log_rotation` policy and are named `txbench.log` within this path.
    #[arg(long, env = "TXBENCH_LOG_PATH")]
    pub log_path: Option<std::path::PathBuf>,

    /// Rotation to use if a log directory is set. Does nothing otherwise.
    #[arg(long, env = "TXBENCH_LOG_ROTATION", default_value = "never", value_enum)]
    pub log_rotation: RotationCadence,

    /// Format to use when emitting diagnostics.
    #[arg(long, env = "TXBENCH_LOG_FORMAT", default_value = "compact", value_enum)]
    pub log_format: LogFormat,

    /// Disable colors in all diagnostic output
    #[arg(long, env = "NO_COLOR")]
    pub no_color: bool,

    /// Log level filter for spans and events, as a comma separated list of directives.
    /// See [`tracing_subscriber::EnvFilter`] for the directive syntax.
    ///
    /// Example: `TXBENCH_LOG_LEVEL=info,txbench::client=debug`
    #[arg(long, env = "TXBENCH_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            log_path: None,
            log_rotation: RotationCadence::Never,
            log_format: LogFormat::Compact,
            no_color: false,
            log_level: "info".to_owned(),
        }
    }
}

/// The rotation policy for diagnostic log files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum RotationCadence {
    /// Rotate logs daily
    Daily,
    /// Rotate logs hourly
    Hourly,
    /// Rotate logs minutely
    Minutely,
    /// Never rotate logs
    Never,
}

impl From<RotationCadence> for Rotation {
    fn from(value: RotationCadence) -> Self {
        match value {
            RotationCadence::Daily => Rotation::DAILY,
            RotationCadence::Hourly => Rotation::HOURLY,
            RotationCadence::Minutely => Rotation::MINUTELY,
            RotationCadence::Never => Rotation::NEVER,
        }
    }
}

/// Installs the global subscriber with the given format.
// This is a macro rather than a fn because the fmt layer embeds its writer and formatter in its
// type, so each combination is a distinct type.
macro_rules! log_format_init {
    ($self:expr, $filter:expr, $fmt_layer:expr) => {
        match $self.log_format {
            LogFormat::Compact => tracing_subscriber::registry()
                .with($filter)
                .with($fmt_layer.compact())
                .try_init(),
            LogFormat::Full => tracing_subscriber::registry()
                .with($filter)
                .with($fmt_layer)
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with($filter)
                .with($fmt_layer.pretty())
                .try_init(),
            LogFormat::Json => tracing_subscriber::registry()
                .with($filter)
                .with($fmt_layer.json().with_current_span(true))
                .try_init(),
        }
    };
}

impl Options {
    /// Returns the filter directive string to install. `debug` raises the default level for the
    /// txbench crates without touching any directives the user gave for other targets.
    pub fn filter_directives(&self, debug: bool) -> String {
        if debug {
            format!(
                "{},txbench=debug,txbench_client=debug,txbench_script=debug",
                self.log_level
            )
        } else {
            self.log_level.clone()
        }
    }

    /// Sets up a non-blocking file appender with the configured rotation policy.
    fn setup_file_appender(&self, log_path: &Path) -> (NonBlocking, WorkerGuard) {
        tracing_appender::non_blocking(RollingFileAppender::new(
            self.log_rotation.into(),
            log_path,
            "txbench.log",
        ))
    }

    /// This is the primary entrypoint to the logging subsystem.
    ///
    /// When a log path is configured the returned [`WorkerGuard`] **must** be kept alive for the
    /// duration of the program; dropping it flushes pending log lines.
    pub fn init(&self, debug: bool) -> Result<Option<WorkerGuard>, Error> {
        let filter = EnvFilter::try_new(self.filter_directives(debug))?;

        let guard = match &self.log_path {
            Some(log_path) => {
                let (non_blocking, guard) = self.setup_file_appender(log_path);
                let fmt_layer = fmt::layer().with_ansi(false).with_writer(non_blocking);
                log_format_init!(self, filter, fmt_layer)?;
                Some(guard)
            }
            None => {
                let fmt_layer = fmt::layer()
                    .with_ansi(!self.no_color)
                    .with_writer(std::io::stderr);
                log_format_init!(self, filter, fmt_layer)?;
                None
            }
        };

        warn_if_debug_build();

        Ok(guard)
    }
}

/// Installs a subscriber for tests that writes through the test harness' captured output.
/// Safe to call multiple times; only the first call has any effect.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("warn"))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn rotation_cadence_maps_to_rotation() {
        assert_eq!(
            RotationCadence::from_str("hourly", false).map(Rotation::from),
            Ok(Rotation::HOURLY)
        );
        assert!(RotationCadence::from_str("weekly", false).is_err());
    }

    #[test]
    fn debug_raises_txbench_targets() {
        let opts = Options {
            log_level: "warn".into(),
            ..Default::default()
        };
        assert_eq!(opts.filter_directives(false), "warn");
        assert_eq!(
            opts.filter_directives(true),
            "warn,txbench=debug,txbench_client=debug,txbench_script=debug"
        );
        EnvFilter::try_new(opts.filter_directives(true)).unwrap();
    }

    #[test]
    fn bad_directive_is_reported() {
        let opts = Options {
            log_level: "txbench=notalevel".into(),
            ..Default::default()
        };
        assert!(matches!(opts.init(false), Err(Error::Parse(_))));
    }
}
