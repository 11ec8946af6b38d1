//! Sets up a run: seeds every random stream, distributes clients over threads, starts the
//! threads and the duration timer, and merges what the threads measured.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Barrier;
use std::time::Duration;

use anyhow::{anyhow, Context};
use hdrhistogram::Histogram;
use tracing::{debug, info};
use txbench_client::Connector;
use txbench_script::{BenchRng, ScriptSet, Variables};

use crate::client::Client;
use crate::clock;
use crate::config::BenchConfig;
use crate::logger::TxLogger;
use crate::report::Summary;
use crate::stats::{CommandStats, SharedStats, StatsData};
use crate::thread::{run_thread, RunContext, ThreadError, ThreadResult, ThreadRngs};

/// How a run ended.
#[derive(Debug)]
pub struct RunOutcome {
    pub summary: Summary,
    /// Whether the run was cut short by `--exit-on-abort`
    pub stopped_on_abort: bool,
}

impl RunOutcome {
    /// 0 if every client finished, 1 if some aborted, 2 if the run was stopped because of one.
    pub fn exit_code(&self) -> i32 {
        if self.stopped_on_abort {
            2
        } else if self.summary.aborted_clients() > 0 {
            1
        } else {
            0
        }
    }
}

/// The initial variables of a client.
fn client_variables(
    config: &BenchConfig,
    client_id: usize,
    default_seed: u64,
) -> anyhow::Result<Variables> {
    let mut vars = Variables::new();
    for (name, value) in &config.variables {
        vars.set_string(name, value.as_str())?;
    }
    // defined unless -D says otherwise
    if !vars.contains("scale") {
        vars.set_int("scale", config.scale)?;
    }
    if !vars.contains("default_seed") {
        vars.set_int("default_seed", default_seed as i64)?;
    }
    if !vars.contains("random_seed") {
        vars.set_int("random_seed", config.seed as i64)?;
    }
    vars.set_int("client_id", client_id as i64)?;
    Ok(vars)
}

/// Splits `clients` into `threads` contiguous groups, the first groups taking one extra
/// client each when they do not divide evenly.
fn split_clients(clients: Vec<Client>, threads: usize) -> Vec<Vec<Client>> {
    let n = clients.len();
    let mut groups = Vec::with_capacity(threads);
    let mut iter = clients.into_iter();
    for t in 0..threads {
        let size = n / threads + usize::from(t < n % threads);
        groups.push(iter.by_ref().take(size).collect());
    }
    groups
}

/// Runs the benchmark described by `config` against the servers `connector` connects to.
pub fn run(
    config: &BenchConfig,
    scripts: &ScriptSet,
    connector: &dyn Connector,
) -> anyhow::Result<RunOutcome> {
    let threads = config.threads.clamp(1, config.clients.max(1));
    info!(
        seed = config.seed,
        clients = config.clients,
        threads,
        "starting benchmark"
    );

    let mut base = BenchRng::seed(config.seed);
    let default_seed = base.uniform64();
    let clients = (0..config.clients)
        .map(|id| {
            let vars = client_variables(config, id, default_seed)?;
            Ok(Client::new(id, base.fork(), vars, scripts))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let rngs = (0..threads)
        .map(|_| ThreadRngs {
            choose: base.fork(),
            throttle: base.fork(),
            sample: base.fork(),
        })
        .collect::<Vec<_>>();

    let log_start = clock::to_unix(clock::now());
    let loggers = (0..threads)
        .map(|tid| {
            config
                .log
                .as_ref()
                .map(|settings| {
                    TxLogger::create(settings, tid, log_start).with_context(|| {
                        let path = settings.path(std::process::id(), tid);
                        format!("could not open log file {}", path.display())
                    })
                })
                .transpose()
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let timer_exceeded = AtomicBool::new(false);
    let stop = AtomicBool::new(false);
    let startup_failed = AtomicBool::new(false);
    let start = Barrier::new(threads);
    let duration = config.duration().map(Duration::from_secs);
    // the timer starts along with the clients
    let go = Barrier::new(threads + usize::from(duration.is_some()));
    let shared = (0..threads)
        .map(|_| SharedStats::default())
        .collect::<Vec<_>>();
    let ctx = RunContext {
        config,
        scripts,
        connector,
        timer_exceeded: &timer_exceeded,
        stop: &stop,
        startup_failed: &startup_failed,
        start: &start,
        go: &go,
        shared: &shared,
    };

    let results = std::thread::scope(|s| {
        let ctx = &ctx;
        let (cancel_timer, timer_rx) = mpsc::channel::<()>();
        if let Some(duration) = duration {
            let go = &go;
            let timer_exceeded = &timer_exceeded;
            s.spawn(move || {
                go.wait();
                if let Err(RecvTimeoutError::Timeout) = timer_rx.recv_timeout(duration) {
                    debug!("duration elapsed");
                    timer_exceeded.store(true, Ordering::Relaxed);
                }
            });
        }

        let mut groups = split_clients(clients, threads)
            .into_iter()
            .zip(rngs)
            .zip(loggers);
        let first = groups.next();
        let handles = groups
            .enumerate()
            .map(|(i, ((clients, rngs), logger))| {
                s.spawn(move || run_thread(i + 1, ctx, clients, rngs, logger))
            })
            .collect::<Vec<_>>();

        let mut results = vec![];
        if let Some(((clients, rngs), logger)) = first {
            results.push(run_thread(0, ctx, clients, rngs, logger));
        }
        for handle in handles {
            match handle.join() {
                Ok(result) => results.push(result),
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
        drop(cancel_timer);
        results
    });
    let end = clock::now();

    let stopped_on_abort = stop.load(Ordering::Relaxed);
    let mut ok = vec![];
    let mut first_error = None;
    for result in results {
        match result {
            Ok(result) => ok.push(result),
            // a connection failure is more telling than the failure it causes elsewhere
            Err(ThreadError::StartupFailed) => {
                first_error.get_or_insert(ThreadError::StartupFailed);
            }
            Err(e) => {
                if matches!(first_error, None | Some(ThreadError::StartupFailed)) {
                    first_error = Some(e);
                }
            }
        }
    }
    if let Some(e) = first_error {
        return Err(anyhow!(e));
    }
    let summary = merge(ok, end)?;
    Ok(RunOutcome {
        summary,
        stopped_on_abort,
    })
}

fn merge(results: Vec<ThreadResult>, end: clock::Micros) -> anyhow::Result<Summary> {
    let mut summary = Summary {
        total: StatsData::new(0),
        script_stats: vec![],
        command_stats: vec![],
        histogram: Histogram::new(3)?,
        latency_late: 0,
        conn_time: 0,
        duration: 0,
        clients: vec![],
    };
    let mut bench_start = None::<clock::Micros>;
    for result in results {
        bench_start = Some(bench_start.map_or(result.bench_start, |b| b.min(result.bench_start)));
        summary.total.merge(&result.stats);
        if summary.script_stats.is_empty() {
            summary.script_stats = result.script_stats;
            summary.command_stats = result.command_stats;
        } else {
            for (into, from) in summary.script_stats.iter_mut().zip(&result.script_stats) {
                into.merge(from);
            }
            for (into, from) in summary
                .command_stats
                .iter_mut()
                .flatten()
                .zip(result.command_stats.iter().flatten())
            {
                CommandStats::merge(into, from);
            }
        }
        summary.histogram.add(&result.histogram)?;
        summary.latency_late += result.latency_late;
        summary.conn_time += result.conn_time;
        summary.clients.extend(result.clients);
    }
    summary.duration = bench_start.map_or(0, |start| end - start);
    Ok(summary)
}
