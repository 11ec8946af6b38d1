//! Transaction statistics: per thread, per script and per command.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use txbench_client::{DEADLOCK_DETECTED, SERIALIZATION_FAILURE};

use crate::clock::Micros;

/// Running count, sum, sum of squares, minimum and maximum of a series of values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SimpleStats {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub sum2: f64,
}

impl SimpleStats {
    pub fn add(&mut self, value: f64) {
        if self.count == 0 || value < self.min {
            self.min = value;
        }
        if self.count == 0 || value > self.max {
            self.max = value;
        }
        self.count += 1;
        self.sum += value;
        self.sum2 += value * value;
    }

    pub fn merge(&mut self, other: &SimpleStats) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 || other.min < self.min {
            self.min = other.min;
        }
        if self.count == 0 || other.max > self.max {
            self.max = other.max;
        }
        self.count += other.count;
        self.sum += other.sum;
        self.sum2 += other.sum2;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Population standard deviation.
    pub fn stddev(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let mean = self.mean();
        (self.sum2 / self.count as f64 - mean * mean).max(0.0).sqrt()
    }
}

/// How the current try of a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStatus {
    #[default]
    NoError,
    /// A meta-command failed; the client is aborted
    MetaCommand,
    Serialization,
    Deadlock,
    OtherSql,
}

impl ErrorStatus {
    /// Classifies an SQL error by its SQLSTATE.
    pub fn from_sqlstate(sqlstate: Option<&str>) -> Self {
        match sqlstate {
            Some(SERIALIZATION_FAILURE) => ErrorStatus::Serialization,
            Some(DEADLOCK_DETECTED) => ErrorStatus::Deadlock,
            _ => ErrorStatus::OtherSql,
        }
    }

    pub fn is_retriable(self) -> bool {
        matches!(self, ErrorStatus::Serialization | ErrorStatus::Deadlock)
    }

    /// Whether the server reported an error, as opposed to the client failing on its own.
    pub fn is_sql_error(self) -> bool {
        matches!(
            self,
            ErrorStatus::Serialization | ErrorStatus::Deadlock | ErrorStatus::OtherSql
        )
    }
}

/// Transaction counters over some span of time. Latency and lag are in microseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsData {
    #[serde(skip)]
    pub start_time: Micros,
    /// Successful transactions
    pub cnt: u64,
    /// Transactions skipped for being too late to meet the latency limit
    pub skipped: u64,
    /// Tries beyond the first, over all transactions
    pub retries: u64,
    /// Transactions that needed more than one try
    pub retried: u64,
    pub serialization_failures: u64,
    pub deadlock_failures: u64,
    pub other_sql_failures: u64,
    pub latency: SimpleStats,
    pub lag: SimpleStats,
}

impl StatsData {
    pub fn new(start_time: Micros) -> Self {
        Self {
            start_time,
            ..Default::default()
        }
    }

    pub fn failures(&self) -> u64 {
        self.serialization_failures + self.deadlock_failures + self.other_sql_failures
    }

    /// Every transaction accounted for: successful, skipped or failed.
    pub fn total(&self) -> u64 {
        self.cnt + self.skipped + self.failures()
    }

    /// Records one finished transaction. Latency samples are only taken for successful ones,
    /// lag only when it is given (under throttling).
    pub fn accumulate(
        &mut self,
        skipped: bool,
        latency: f64,
        lag: Option<f64>,
        status: ErrorStatus,
        tries: u32,
    ) {
        if skipped {
            self.skipped += 1;
            return;
        }

        // retries count regardless of the outcome
        if tries > 1 {
            self.retries += u64::from(tries - 1);
            self.retried += 1;
        }

        match status {
            ErrorStatus::NoError => {
                self.cnt += 1;
                self.latency.add(latency);
                if let Some(lag) = lag {
                    self.lag.add(lag);
                }
            }
            ErrorStatus::Serialization => self.serialization_failures += 1,
            ErrorStatus::Deadlock => self.deadlock_failures += 1,
            ErrorStatus::OtherSql | ErrorStatus::MetaCommand => self.other_sql_failures += 1,
        }
    }

    pub fn merge(&mut self, other: &StatsData) {
        self.cnt += other.cnt;
        self.skipped += other.skipped;
        self.retries += other.retries;
        self.retried += other.retried;
        self.serialization_failures += other.serialization_failures;
        self.deadlock_failures += other.deadlock_failures;
        self.other_sql_failures += other.other_sql_failures;
        self.latency.merge(&other.latency);
        self.lag.merge(&other.lag);
    }
}

/// Timing and error counts of one script command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CommandStats {
    /// Execution time in microseconds
    pub latency: SimpleStats,
    /// Retries of transactions that failed at this command
    pub retries: u64,
    /// Failed transactions that ended at this command
    pub failures: u64,
}

impl CommandStats {
    pub fn merge(&mut self, other: &CommandStats) {
        self.latency.merge(&other.latency);
        self.retries += other.retries;
        self.failures += other.failures;
    }
}

/// A thread's running totals, published for the progress reporter on another thread.
///
/// Each field is written only by the owning thread, with relaxed stores; a reader may observe
/// fields from different publications, which is acceptable for progress lines. Final totals are
/// taken from the threads' own [`StatsData`] after they are joined.
#[derive(Debug, Default)]
pub struct SharedStats {
    cnt: AtomicU64,
    skipped: AtomicU64,
    retries: AtomicU64,
    retried: AtomicU64,
    serialization_failures: AtomicU64,
    deadlock_failures: AtomicU64,
    other_sql_failures: AtomicU64,
    latency_sum: AtomicU64,
    latency_sum2: AtomicU64,
    lag_sum: AtomicU64,
}

impl SharedStats {
    pub fn publish(&self, stats: &StatsData) {
        let store = |field: &AtomicU64, v: u64| field.store(v, Ordering::Relaxed);
        store(&self.cnt, stats.cnt);
        store(&self.skipped, stats.skipped);
        store(&self.retries, stats.retries);
        store(&self.retried, stats.retried);
        store(&self.serialization_failures, stats.serialization_failures);
        store(&self.deadlock_failures, stats.deadlock_failures);
        store(&self.other_sql_failures, stats.other_sql_failures);
        store(&self.latency_sum, stats.latency.sum.to_bits());
        store(&self.latency_sum2, stats.latency.sum2.to_bits());
        store(&self.lag_sum, stats.lag.sum.to_bits());
    }

    /// The last published totals. Minimum and maximum are not tracked.
    pub fn snapshot(&self) -> StatsData {
        let load = |field: &AtomicU64| field.load(Ordering::Relaxed);
        let cnt = load(&self.cnt);
        StatsData {
            start_time: 0,
            cnt,
            skipped: load(&self.skipped),
            retries: load(&self.retries),
            retried: load(&self.retried),
            serialization_failures: load(&self.serialization_failures),
            deadlock_failures: load(&self.deadlock_failures),
            other_sql_failures: load(&self.other_sql_failures),
            latency: SimpleStats {
                count: cnt,
                sum: f64::from_bits(load(&self.latency_sum)),
                sum2: f64::from_bits(load(&self.latency_sum2)),
                ..Default::default()
            },
            lag: SimpleStats {
                count: cnt,
                sum: f64::from_bits(load(&self.lag_sum)),
                ..Default::default()
            },
        }
    }
}
