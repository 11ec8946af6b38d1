//! Benchmark threads.
//!
//! Each thread owns a group of clients and drives them with a single `poll(2)` loop: clients
//! waiting for the server are woken by their sockets, sleeping or throttled clients by the
//! earliest of their deadlines. Thread 0 additionally prints progress reports.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Barrier;

use hdrhistogram::Histogram;
use metrics::{counter, histogram, Counter};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use tracing::{debug, error, warn};
use txbench_client::Connector;
use txbench_script::{BenchRng, ScriptSet};

use crate::client::{Client, ClientState};
use crate::clock::{self, Micros, MICROS_PER_SEC};
use crate::config::BenchConfig;
use crate::logger::{LogEntry, TxLogger};
use crate::recorded;
use crate::stats::{CommandStats, ErrorStatus, SharedStats, StatsData};

/// State shared by every thread of a run.
pub struct RunContext<'a> {
    pub config: &'a BenchConfig,
    pub scripts: &'a ScriptSet,
    pub connector: &'a dyn Connector,
    /// Set when the run duration is over
    pub timer_exceeded: &'a AtomicBool,
    /// Set to make every thread stop right away
    pub stop: &'a AtomicBool,
    /// Set by threads that could not connect their clients
    pub startup_failed: &'a AtomicBool,
    pub start: &'a Barrier,
    pub go: &'a Barrier,
    /// One per thread, indexed by thread id
    pub shared: &'a [SharedStats],
}

/// A thread's own random streams.
pub struct ThreadRngs {
    /// Picks scripts
    pub choose: BenchRng,
    /// Draws throttling delays
    pub throttle: BenchRng,
    /// Samples transactions to log
    pub sample: BenchRng,
}

/// A transaction that ended, successfully or not, or was skipped.
#[derive(Debug, Clone, Copy)]
pub struct TxOutcome {
    pub client: usize,
    /// Transactions the client finished, including this one
    pub client_cnt: u64,
    pub script: usize,
    pub now: Micros,
    /// Microseconds from the scheduled start, for successful transactions
    pub latency: f64,
    pub lag: f64,
    pub skipped: bool,
    pub status: ErrorStatus,
    pub tries: u32,
}

struct ScriptMetrics {
    success: Counter,
    failed: Counter,
    skipped: Counter,
    retries: Counter,
    latency: metrics::Histogram,
}

impl ScriptMetrics {
    fn new(script: &str) -> Self {
        let script = script.to_owned();
        Self {
            success: counter!(recorded::TRANSACTIONS, "script" => script.clone(), "status" => "success"),
            failed: counter!(recorded::TRANSACTIONS, "script" => script.clone(), "status" => "failed"),
            skipped: counter!(recorded::TRANSACTIONS, "script" => script.clone(), "status" => "skipped"),
            retries: counter!(recorded::RETRIES, "script" => script.clone()),
            latency: histogram!(recorded::LATENCY, "script" => script),
        }
    }
}

/// What a thread's clients share: configuration, random streams and statistics.
pub struct Worker<'a> {
    pub tid: usize,
    pub config: &'a BenchConfig,
    pub scripts: &'a ScriptSet,
    pub connector: &'a dyn Connector,
    timer: &'a AtomicBool,
    /// When a timed run ends
    pub end_time: Option<Micros>,
    pub choose_rng: BenchRng,
    pub throttle_rng: BenchRng,
    sample_rng: BenchRng,
    /// Scheduled start of the most recently scheduled transaction
    pub throttle_trigger: Micros,
    pub stats: StatsData,
    pub script_stats: Vec<StatsData>,
    pub command_stats: Vec<Vec<CommandStats>>,
    pub histogram: Histogram<u64>,
    /// Transactions slower than the latency limit
    pub latency_late: u64,
    /// Time spent connecting and disconnecting
    pub conn_time: Micros,
    logger: Option<TxLogger>,
    log_error: Option<io::Error>,
    metrics: Vec<ScriptMetrics>,
}

impl<'a> Worker<'a> {
    pub fn new(
        tid: usize,
        ctx: &RunContext<'a>,
        rngs: ThreadRngs,
        logger: Option<TxLogger>,
    ) -> Result<Self, hdrhistogram::CreationError> {
        let scripts = ctx.scripts.scripts();
        Ok(Self {
            tid,
            config: ctx.config,
            scripts: ctx.scripts,
            connector: ctx.connector,
            timer: ctx.timer_exceeded,
            end_time: None,
            choose_rng: rngs.choose,
            throttle_rng: rngs.throttle,
            sample_rng: rngs.sample,
            throttle_trigger: 0,
            stats: StatsData::new(0),
            script_stats: vec![StatsData::new(0); scripts.len()],
            command_stats: scripts
                .iter()
                .map(|s| vec![CommandStats::default(); s.commands.len()])
                .collect(),
            histogram: Histogram::new(3)?,
            latency_late: 0,
            conn_time: 0,
            logger,
            log_error: None,
            metrics: scripts
                .iter()
                .map(|s| ScriptMetrics::new(&s.description))
                .collect(),
        })
    }

    pub fn timer_exceeded(&self) -> bool {
        self.timer.load(Ordering::Relaxed)
    }

    /// Accounts for an ended transaction in every statistic and the transaction log.
    pub fn record_transaction(&mut self, tx: TxOutcome) {
        let lag = self.config.throttle_delay.map(|_| tx.lag);
        self.stats
            .accumulate(tx.skipped, tx.latency, lag, tx.status, tx.tries);
        self.script_stats[tx.script].accumulate(tx.skipped, tx.latency, lag, tx.status, tx.tries);

        let metrics = &self.metrics[tx.script];
        if tx.tries > 1 {
            metrics.retries.increment(u64::from(tx.tries - 1));
        }
        if tx.skipped {
            metrics.skipped.increment(1);
        } else if tx.status == ErrorStatus::NoError {
            metrics.success.increment(1);
            metrics.latency.record(tx.latency);
            self.histogram.saturating_record(tx.latency as u64);
        } else {
            metrics.failed.increment(1);
        }

        if self
            .config
            .latency_limit
            .is_some_and(|limit| tx.latency > limit as f64)
        {
            self.latency_late += 1;
        }

        if let Some(logger) = &mut self.logger {
            let entry = LogEntry {
                client: tx.client,
                cnt: tx.client_cnt,
                script: tx.script,
                now: clock::to_unix(tx.now),
                latency: tx.latency,
                lag: tx.lag,
                skipped: tx.skipped,
                status: tx.status,
                tries: tx.tries,
            };
            if let Err(e) = logger.log(&mut self.sample_rng, &entry) {
                error!(tid = self.tid, "could not write to the transaction log: {e}");
                self.logger = None;
                self.log_error = Some(e);
            }
        }
    }
}

/// Final state of one client.
#[derive(Debug, Clone, Copy)]
pub struct ClientSummary {
    pub id: usize,
    pub state: ClientState,
    pub transactions: u64,
}

/// Everything a thread measured.
#[derive(Debug)]
pub struct ThreadResult {
    pub tid: usize,
    /// When the thread's clients were let go
    pub bench_start: Micros,
    pub stats: StatsData,
    pub script_stats: Vec<StatsData>,
    pub command_stats: Vec<Vec<CommandStats>>,
    pub histogram: Histogram<u64>,
    pub latency_late: u64,
    pub conn_time: Micros,
    pub clients: Vec<ClientSummary>,
}

#[derive(Debug, thiserror::Error)]
pub enum ThreadError {
    #[error("could not create connection for client {0}")]
    Connect(usize),

    #[error("another thread could not connect its clients")]
    StartupFailed,

    #[error("could not write to the transaction log: {0}")]
    Log(#[source] io::Error),

    #[error("poll() failed: {0}")]
    Poll(#[source] Errno),

    #[error(transparent)]
    Histogram(#[from] hdrhistogram::CreationError),
}

/// Totals at the previous progress report.
struct ProgressState {
    next: Micros,
    last_time: Micros,
    last: StatsData,
}

/// Runs `clients` to completion on the calling thread.
pub fn run_thread(
    tid: usize,
    ctx: &RunContext<'_>,
    mut clients: Vec<Client>,
    rngs: ThreadRngs,
    logger: Option<TxLogger>,
) -> Result<ThreadResult, ThreadError> {
    let config = ctx.config;
    let worker = Worker::new(tid, ctx, rngs, logger);

    ctx.start.wait();

    let mut connect_error = None;
    let mut conn_time = 0;
    if worker.is_ok() && !config.connect_per_tx {
        let start = clock::now();
        for client in &mut clients {
            match ctx.connector.connect() {
                Ok(conn) => client.set_connection(conn, ctx.scripts),
                Err(e) => {
                    error!("could not create connection for client {}: {e}", client.id);
                    connect_error = Some(client.id);
                    ctx.startup_failed.store(true, Ordering::Relaxed);
                    break;
                }
            }
        }
        conn_time = clock::now() - start;
    }

    // everyone waits here even after a failure, or the other threads would hang
    ctx.go.wait();

    let mut worker = worker?;
    if let Some(id) = connect_error {
        return Err(ThreadError::Connect(id));
    }
    if ctx.startup_failed.load(Ordering::Relaxed) {
        return Err(ThreadError::StartupFailed);
    }

    let bench_start = clock::now();
    worker.conn_time = conn_time;
    worker.throttle_trigger = bench_start;
    worker.end_time = config
        .duration()
        .map(|d| bench_start + d as Micros * MICROS_PER_SEC);
    worker.stats.start_time = bench_start;
    debug!(tid, clients = clients.len(), "thread started");

    let mut progress = match config.progress {
        Some(interval) if tid == 0 => Some(ProgressState {
            next: bench_start + interval as Micros * MICROS_PER_SEC,
            last_time: bench_start,
            last: StatsData::new(bench_start),
        }),
        _ => None,
    };

    let mut fds: Vec<(usize, RawFd)> = vec![];
    loop {
        if ctx.stop.load(Ordering::Relaxed) {
            break;
        }

        // work out how long nothing needs to happen
        let mut remaining = 0;
        let mut ready = false;
        let mut fdless = false;
        let mut deadline: Option<Micros> = None;
        fds.clear();
        for (i, client) in clients.iter().enumerate() {
            let state = client.state();
            if state.is_done() {
                continue;
            }
            remaining += 1;
            if let Some(wake) = client.wake_time() {
                deadline = Some(deadline.map_or(wake, |d| d.min(wake)));
            } else if state.is_waiting_for_server() {
                match client.socket_fd() {
                    Some(fd) => fds.push((i, fd)),
                    None => fdless = true,
                }
            } else {
                ready = true;
            }
        }
        if remaining == 0 {
            break;
        }
        if let Some(p) = &progress {
            deadline = Some(deadline.map_or(p.next, |d| d.min(p.next)));
        }

        let mut readable = vec![false; clients.len()];
        let now = clock::now();
        let mut timeout_us = if ready {
            0
        } else {
            deadline.map_or(Micros::MAX, |d| (d - now).max(0))
        };
        if fdless {
            timeout_us = timeout_us.min(1000);
        }
        if timeout_us > 0 || !fds.is_empty() {
            // round up so a wakeup never comes early
            let timeout_ms = if timeout_us == Micros::MAX {
                -1
            } else {
                ((timeout_us + 999) / 1000).min(i32::MAX as Micros) as i32
            };
            let mut pollfds = fds
                .iter()
                .map(|(_, fd)| PollFd::new(*fd, PollFlags::POLLIN))
                .collect::<Vec<_>>();
            match poll(&mut pollfds, timeout_ms) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(ThreadError::Poll(e)),
            }
            let wakeup = PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP;
            for ((i, _), pfd) in fds.iter().zip(&pollfds) {
                readable[*i] = pfd.revents().is_some_and(|r| r.intersects(wakeup));
            }
        }

        let mut aborted = false;
        for (i, client) in clients.iter_mut().enumerate() {
            let state = client.state();
            if state.is_done() {
                continue;
            }
            if state.is_waiting_for_server() && client.socket_fd().is_some() && !readable[i] {
                continue;
            }
            client.advance(&mut worker);
            aborted |= client.state() == ClientState::Aborted;
        }

        if aborted && config.exit_on_abort {
            warn!(tid, "client aborted, stopping the benchmark");
            ctx.stop.store(true, Ordering::Relaxed);
            break;
        }

        ctx.shared[tid].publish(&worker.stats);

        if let Some(p) = &mut progress {
            let now = clock::now();
            if now >= p.next {
                p.last = print_progress(ctx, bench_start, now, p);
                p.last_time = now;
                let interval = config.progress.unwrap_or(1) as Micros * MICROS_PER_SEC;
                while now >= p.next {
                    p.next += interval;
                }
            }
        }
    }

    for client in &mut clients {
        client.disconnect();
    }
    if let Some(mut logger) = worker.logger.take() {
        if let Err(e) = logger.finish() {
            worker.log_error.get_or_insert(e);
        }
    }
    if let Some(e) = worker.log_error.take() {
        return Err(ThreadError::Log(e));
    }

    Ok(ThreadResult {
        tid,
        bench_start,
        stats: worker.stats,
        script_stats: worker.script_stats,
        command_stats: worker.command_stats,
        histogram: worker.histogram,
        latency_late: worker.latency_late,
        conn_time: worker.conn_time,
        clients: clients
            .iter()
            .map(|c| ClientSummary {
                id: c.id,
                state: c.state(),
                transactions: c.transactions(),
            })
            .collect(),
    })
}

/// Prints one progress line covering the time since the last one, and returns the totals it
/// was computed from.
fn print_progress(
    ctx: &RunContext<'_>,
    bench_start: Micros,
    now: Micros,
    p: &ProgressState,
) -> StatsData {
    let mut cur = StatsData::new(now);
    for shared in ctx.shared {
        cur.merge(&shared.snapshot());
    }
    eprintln!(
        "{}",
        progress_line(ctx.config, &cur, &p.last, now - bench_start, now - p.last_time, now)
    );
    cur
}

/// Formats a progress report for the transactions between `last` and `cur`. `elapsed` is the
/// time since the run started, `interval` the time since the previous report.
pub fn progress_line(
    config: &BenchConfig,
    cur: &StatsData,
    last: &StatsData,
    elapsed: Micros,
    interval: Micros,
    now: Micros,
) -> String {
    let ntx = cur.cnt.saturating_sub(last.cnt);
    let tps = if interval > 0 {
        MICROS_PER_SEC as f64 * ntx as f64 / interval as f64
    } else {
        0.0
    };
    let (latency, stddev, lag) = if ntx > 0 {
        let n = ntx as f64;
        let latency = 0.001 * (cur.latency.sum - last.latency.sum) / n;
        let sqlat = (cur.latency.sum2 - last.latency.sum2) / n;
        let stddev = 0.001 * (sqlat - 1_000_000.0 * latency * latency).max(0.0).sqrt();
        let lag = 0.001 * (cur.lag.sum - last.lag.sum) / n;
        (latency, stddev, lag)
    } else {
        (0.0, 0.0, 0.0)
    };

    let time = if config.progress_timestamp {
        format!("{:.3} s", clock::as_secs_f64(clock::to_unix(now)))
    } else {
        format!("{:.1} s", clock::as_secs_f64(elapsed))
    };
    let mut line = format!(
        "progress: {time}, {tps:.1} tps, lat {latency:.3} ms stddev {stddev:.3}, {} failed",
        cur.failures().saturating_sub(last.failures())
    );
    if config.throttle_delay.is_some() {
        line.push_str(&format!(", lag {lag:.3} ms"));
        if config.latency_limit.is_some() {
            line.push_str(&format!(
                ", {} skipped",
                cur.skipped.saturating_sub(last.skipped)
            ));
        }
    }
    if config.max_tries != 1 {
        line.push_str(&format!(
            ", {} retried, {} retries",
            cur.retried.saturating_sub(last.retried),
            cur.retries.saturating_sub(last.retries)
        ));
    }
    line
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn progress_line_plain() {
        let config = BenchConfig::default();
        let mut cur = StatsData::new(0);
        for latency in [1000.0, 3000.0] {
            cur.accumulate(false, latency, None, ErrorStatus::NoError, 1);
        }
        cur.accumulate(false, 0.0, None, ErrorStatus::OtherSql, 1);
        let line = progress_line(
            &config,
            &cur,
            &StatsData::new(0),
            5 * MICROS_PER_SEC,
            MICROS_PER_SEC,
            0,
        );
        assert_eq!(
            line,
            "progress: 5.0 s, 2.0 tps, lat 2.000 ms stddev 1.000, 1 failed"
        );
    }

    #[test]
    fn progress_line_throttled_with_retries() {
        let config = BenchConfig {
            throttle_delay: Some(1000.0),
            latency_limit: Some(10_000),
            max_tries: 3,
            ..Default::default()
        };
        let mut last = StatsData::new(0);
        last.accumulate(true, 0.0, None, ErrorStatus::NoError, 1);
        let mut cur = last.clone();
        cur.accumulate(false, 2000.0, Some(500.0), ErrorStatus::NoError, 2);
        cur.accumulate(true, 0.0, None, ErrorStatus::NoError, 1);
        let line = progress_line(
            &config,
            &cur,
            &last,
            2 * MICROS_PER_SEC,
            2 * MICROS_PER_SEC,
            0,
        );
        assert_eq!(
            line,
            "progress: 2.0 s, 0.5 tps, lat 2.000 ms stddev 0.000, 0 failed, lag 0.500 ms, \
             1 skipped, 1 retried, 1 retries"
        );
    }
}
