//! Per-transaction log, one file per thread.
//!
//! In raw mode every transaction (or a random sample of them) gets a line:
//!
//! ```text
//! client cnt latency|status script unix_s unix_us [lag] [retries]
//! ```
//!
//! With an aggregation interval, one line summarizes each interval instead:
//!
//! ```text
//! unix_s cnt lat_sum lat_sum2 lat_min lat_max [lag_sum lag_sum2 lag_min lag_max] skipped retried retries serialization deadlock
//! ```
//!
//! Failures other than serialization and deadlock errors have no column of their own: an
//! interval's `cnt`, `skipped`, `serialization` and `deadlock` add up to its transactions minus
//! those failures.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use txbench_script::BenchRng;

use crate::clock::{Micros, MICROS_PER_SEC};
use crate::stats::{ErrorStatus, StatsData};

pub const DEFAULT_PREFIX: &str = "txbench_log";

/// What to log and where.
#[derive(Debug, Clone, PartialEq)]
pub struct LogSettings {
    pub prefix: String,
    /// Fraction of transactions to log in raw mode
    pub sampling_rate: Option<f64>,
    /// Aggregation interval in seconds
    pub aggregate_interval: Option<u64>,
    pub failures_detailed: bool,
    /// Whether transactions are throttled, which adds lag columns
    pub throttled: bool,
    /// Whether transactions may be tried more than once, which adds a retries column
    pub retries: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_owned(),
            sampling_rate: None,
            aggregate_interval: None,
            failures_detailed: false,
            throttled: false,
            retries: false,
        }
    }
}

impl LogSettings {
    /// `<prefix>.<pid>` for the first thread, `<prefix>.<pid>.<thread>` for the others.
    pub fn path(&self, pid: u32, thread: usize) -> PathBuf {
        if thread == 0 {
            format!("{}.{pid}", self.prefix).into()
        } else {
            format!("{}.{pid}.{thread}", self.prefix).into()
        }
    }
}

/// A finished (or skipped) transaction. Times are Unix microseconds.
#[derive(Debug, Clone, Copy)]
pub struct LogEntry {
    pub client: usize,
    /// Transactions the client has finished, including this one
    pub cnt: u64,
    pub script: usize,
    pub now: Micros,
    pub latency: f64,
    pub lag: f64,
    pub skipped: bool,
    pub status: ErrorStatus,
    pub tries: u32,
}

pub struct TxLogger<W: Write = BufWriter<File>> {
    out: W,
    settings: LogSettings,
    aggregate: Option<StatsData>,
}

impl TxLogger {
    /// Creates the log file of `thread`.
    pub fn create(settings: &LogSettings, thread: usize, start: Micros) -> io::Result<Self> {
        let file = File::create(settings.path(std::process::id(), thread))?;
        Ok(Self::new(BufWriter::new(file), settings.clone(), start))
    }
}

impl<W: Write> TxLogger<W> {
    /// `start` is the Unix time the first aggregation interval begins at.
    pub fn new(out: W, settings: LogSettings, start: Micros) -> Self {
        let aggregate = settings
            .aggregate_interval
            .map(|_| StatsData::new(start));
        Self {
            out,
            settings,
            aggregate,
        }
    }

    fn status_word(&self, entry: &LogEntry) -> &'static str {
        if entry.skipped {
            return "skipped";
        }
        if !self.settings.failures_detailed {
            return "failed";
        }
        match entry.status {
            ErrorStatus::Serialization => "serialization",
            ErrorStatus::Deadlock => "deadlock",
            _ => "other",
        }
    }

    pub fn log(&mut self, rng: &mut BenchRng, entry: &LogEntry) -> io::Result<()> {
        if let Some(interval) = self.settings.aggregate_interval {
            let interval = interval as Micros * MICROS_PER_SEC;
            // emit every interval that ended before this transaction, even empty ones
            while let Some(agg) = &self.aggregate {
                let next = agg.start_time + interval;
                if next > entry.now {
                    break;
                }
                self.write_aggregate()?;
                self.aggregate = Some(StatsData::new(next));
            }
            if let Some(agg) = &mut self.aggregate {
                agg.accumulate(
                    entry.skipped,
                    entry.latency,
                    self.settings.throttled.then_some(entry.lag),
                    entry.status,
                    entry.tries,
                );
            }
            return Ok(());
        }

        if let Some(rate) = self.settings.sampling_rate {
            if rng.double() > rate {
                return Ok(());
            }
        }

        let (secs, micros) = (entry.now / MICROS_PER_SEC, entry.now % MICROS_PER_SEC);
        if !entry.skipped && entry.status == ErrorStatus::NoError {
            write!(
                self.out,
                "{} {} {:.0} {} {secs} {micros}",
                entry.client, entry.cnt, entry.latency, entry.script
            )?;
        } else {
            let status = self.status_word(entry);
            write!(
                self.out,
                "{} {} {status} {} {secs} {micros}",
                entry.client, entry.cnt, entry.script
            )?;
        }
        if self.settings.throttled {
            write!(self.out, " {:.0}", entry.lag)?;
        }
        if self.settings.retries {
            write!(self.out, " {}", entry.tries.saturating_sub(1))?;
        }
        writeln!(self.out)
    }

    fn write_aggregate(&mut self) -> io::Result<()> {
        let Some(agg) = &self.aggregate else {
            return Ok(());
        };
        write!(
            self.out,
            "{} {} {:.0} {:.0} {:.0} {:.0}",
            agg.start_time / MICROS_PER_SEC,
            agg.cnt,
            agg.latency.sum,
            agg.latency.sum2,
            agg.latency.min,
            agg.latency.max
        )?;
        if self.settings.throttled {
            write!(
                self.out,
                " {:.0} {:.0} {:.0} {:.0}",
                agg.lag.sum, agg.lag.sum2, agg.lag.min, agg.lag.max
            )?;
        }
        writeln!(
            self.out,
            " {} {} {} {} {}",
            agg.skipped,
            agg.retried,
            agg.retries,
            agg.serialization_failures,
            agg.deadlock_failures
        )
    }

    /// Writes the last, partial, aggregation interval if anything happened in it, and flushes.
    pub fn finish(&mut self) -> io::Result<()> {
        if self
            .aggregate
            .as_ref()
            .is_some_and(|agg| agg.total() + agg.retried > 0)
        {
            self.write_aggregate()?;
        }
        self.aggregate = None;
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
