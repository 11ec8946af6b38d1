//! The end-of-run report: a human-readable summary, and optionally the same numbers as JSON.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::Path;

use anyhow::Context;
use hdrhistogram::Histogram;
use serde::Serialize;
use tracing::info;
use txbench_script::ScriptSet;

use crate::client::ClientState;
use crate::clock::{self, Micros};
use crate::config::{BenchConfig, RunLimit};
use crate::stats::{CommandStats, SimpleStats, StatsData};
use crate::thread::ClientSummary;

/// Results of a whole run, merged from every thread.
#[derive(Debug)]
pub struct Summary {
    pub total: StatsData,
    pub script_stats: Vec<StatsData>,
    pub command_stats: Vec<Vec<CommandStats>>,
    /// Latencies of successful transactions, in microseconds
    pub histogram: Histogram<u64>,
    pub latency_late: u64,
    /// Time spent connecting, summed over threads
    pub conn_time: Micros,
    /// From the earliest thread start to the end of the last thread
    pub duration: Micros,
    pub clients: Vec<ClientSummary>,
}

impl Summary {
    pub fn aborted_clients(&self) -> usize {
        self.clients
            .iter()
            .filter(|c| c.state == ClientState::Aborted)
            .count()
    }

    /// Successful transactions per second.
    pub fn tps(&self) -> f64 {
        let secs = clock::as_secs_f64(self.duration);
        if secs > 0.0 {
            self.total.cnt as f64 / secs
        } else {
            0.0
        }
    }

    /// Latency quantile in milliseconds.
    pub fn percentile(&self, quantile: f64) -> f64 {
        us_to_ms(self.histogram.value_at_quantile(quantile))
    }
}

fn us_to_ms(us: u64) -> f64 {
    us as f64 / 1000.
}

fn pct(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        100.0 * part as f64 / whole as f64
    }
}

fn simple_stats(out: &mut String, prefix: &str, stats: &SimpleStats) {
    if stats.count > 0 {
        let _ = writeln!(out, "{prefix} average = {:.3} ms", 0.001 * stats.mean());
        let _ = writeln!(out, "{prefix} stddev = {:.3} ms", 0.001 * stats.stddev());
    }
}

fn failure_lines(out: &mut String, prefix: &str, config: &BenchConfig, stats: &StatsData) {
    let total = stats.total();
    let _ = writeln!(
        out,
        "{prefix}number of failed transactions: {} ({:.3}%)",
        stats.failures(),
        pct(stats.failures(), total)
    );
    if config.failures_detailed {
        let _ = writeln!(
            out,
            "{prefix}number of serialization failures: {} ({:.3}%)",
            stats.serialization_failures,
            pct(stats.serialization_failures, total)
        );
        let _ = writeln!(
            out,
            "{prefix}number of deadlock failures: {} ({:.3}%)",
            stats.deadlock_failures,
            pct(stats.deadlock_failures, total)
        );
        let _ = writeln!(
            out,
            "{prefix}number of other failures: {} ({:.3}%)",
            stats.other_sql_failures,
            pct(stats.other_sql_failures, total)
        );
    }
    if config.max_tries != 1 {
        let _ = writeln!(
            out,
            "{prefix}number of transactions retried: {} ({:.3}%)",
            stats.retried,
            pct(stats.retried, total)
        );
        let _ = writeln!(out, "{prefix}total number of retries: {}", stats.retries);
    }
}

/// Renders the summary printed at the end of a run.
pub fn render(config: &BenchConfig, scripts: &ScriptSet, summary: &Summary) -> String {
    let mut out = String::new();
    let total = &summary.total;
    let failures = total.failures();
    let total_cnt = total.total();

    let _ = writeln!(
        out,
        "transaction type: {}",
        if scripts.len() == 1 {
            scripts.get(0).description.as_str()
        } else {
            "multiple scripts"
        }
    );
    let _ = writeln!(out, "scaling factor: {}", config.scale);
    let _ = writeln!(out, "query mode: {}", config.mode);
    let _ = writeln!(out, "number of clients: {}", config.clients);
    let _ = writeln!(out, "number of threads: {}", config.threads);
    if config.max_tries != 0 {
        let _ = writeln!(out, "maximum number of tries: {}", config.max_tries);
    }
    match config.limit {
        RunLimit::Transactions(n) => {
            let _ = writeln!(out, "number of transactions per client: {n}");
            let _ = writeln!(
                out,
                "number of transactions actually processed: {}/{}",
                total.cnt,
                n * config.clients as u64
            );
        }
        RunLimit::Duration(d) => {
            let _ = writeln!(out, "duration: {d} s");
            let _ = writeln!(
                out,
                "number of transactions actually processed: {}",
                total.cnt
            );
        }
    }
    failure_lines(&mut out, "", config, total);

    // nothing more to say without any transaction
    if total.cnt + total.skipped == 0 {
        return out;
    }

    if config.throttle_delay.is_some() && config.latency_limit.is_some() {
        let _ = writeln!(
            out,
            "number of transactions skipped: {} ({:.3}%)",
            total.skipped,
            pct(total.skipped, total_cnt)
        );
    }
    if let Some(limit) = config.latency_limit {
        let _ = writeln!(
            out,
            "number of transactions above the {:.1} ms latency limit: {}/{} ({:.3}%)",
            limit as f64 / 1000.0,
            summary.latency_late,
            total.cnt,
            pct(summary.latency_late, total.cnt)
        );
    }

    if config.throttle_delay.is_some() || config.progress.is_some() || config.latency_limit.is_some()
    {
        simple_stats(&mut out, "latency", &total.latency);
    } else if total_cnt > 0 {
        let _ = writeln!(
            out,
            "latency average = {:.3} ms{}",
            0.001 * summary.duration as f64 * config.clients as f64 / total_cnt as f64,
            if failures > 0 {
                " (including failures)"
            } else {
                ""
            }
        );
    }
    if !summary.histogram.is_empty() {
        let _ = writeln!(
            out,
            "latency percentiles: p50 = {:.3} ms, p90 = {:.3} ms, p99 = {:.3} ms, p99.9 = {:.3} ms",
            summary.percentile(0.5),
            summary.percentile(0.9),
            summary.percentile(0.99),
            summary.percentile(0.999)
        );
    }

    if config.throttle_delay.is_some() && total.cnt > 0 {
        let _ = writeln!(
            out,
            "rate limit schedule lag: avg {:.3} (max {:.3}) ms",
            0.001 * total.lag.sum / total.cnt as f64,
            0.001 * total.lag.max
        );
    }

    if config.connect_per_tx {
        let _ = writeln!(
            out,
            "average connection time = {:.3} ms",
            0.001 * summary.conn_time as f64 / (total.cnt + failures).max(1) as f64
        );
        let _ = writeln!(out, "tps = {:.6} (including reconnection times)", summary.tps());
    } else {
        let _ = writeln!(
            out,
            "initial connection time = {:.3} ms",
            0.001 * summary.conn_time as f64 / config.threads.max(1) as f64
        );
        let _ = writeln!(out, "tps = {:.6} (without initial connection time)", summary.tps());
    }

    let per_script = scripts.len() > 1;
    if per_script || config.report_per_command {
        let total_weight = scripts.total_weight();
        let secs = clock::as_secs_f64(summary.duration);
        for (i, script) in scripts.scripts().iter().enumerate() {
            let stats = &summary.script_stats[i];
            if per_script {
                let _ = writeln!(out, "SQL script {}: {}", i + 1, script.description);
                let _ = writeln!(
                    out,
                    " - weight: {} (targets {:.1}% of total)",
                    script.weight,
                    pct(script.weight as u64, total_weight)
                );
                let _ = writeln!(
                    out,
                    " - {} transactions ({:.1}% of total, tps = {:.6})",
                    stats.cnt,
                    pct(stats.cnt, total.cnt),
                    if secs > 0.0 { stats.cnt as f64 / secs } else { 0.0 }
                );
                failure_lines(&mut out, " - ", config, stats);
                if config.throttle_delay.is_some()
                    && config.latency_limit.is_some()
                    && stats.total() > 0
                {
                    let _ = writeln!(
                        out,
                        " - number of transactions skipped: {} ({:.3}%)",
                        stats.skipped,
                        pct(stats.skipped, stats.total())
                    );
                }
                simple_stats(&mut out, " - latency", &stats.latency);
            }

            if config.report_per_command {
                let _ = writeln!(
                    out,
                    "{}statement latencies in milliseconds{}:",
                    if per_script { " - " } else { "" },
                    if config.max_tries == 1 {
                        " and failures"
                    } else {
                        ", failures and retries"
                    }
                );
                for (command, stats) in script.commands.iter().zip(&summary.command_stats[i]) {
                    let latency = 0.001 * stats.latency.mean();
                    if config.max_tries == 1 {
                        let _ = writeln!(
                            out,
                            "   {latency:11.3}  {:10}  {}",
                            stats.failures, command.first_line
                        );
                    } else {
                        let _ = writeln!(
                            out,
                            "   {latency:11.3}  {:10}  {:10}  {}",
                            stats.failures, stats.retries, command.first_line
                        );
                    }
                }
            }
        }
    }

    out
}

/// Logs the headline numbers.
pub fn log_summary(summary: &Summary) {
    info!(
        "overall -\ttps: {:.0}\tp50: {:.1} ms\tp90: {:.1} ms\tp99: {:.1} ms\tp99.9: {:.1} ms",
        summary.tps(),
        summary.percentile(0.5),
        summary.percentile(0.9),
        summary.percentile(0.99),
        summary.percentile(0.999)
    );
}

#[derive(Debug, Serialize)]
struct Percentiles {
    p50: f64,
    p90: f64,
    p95: f64,
    p99: f64,
    #[serde(rename = "p99.9")]
    p99_9: f64,
}

#[derive(Debug, Serialize)]
struct CommandReport<'a> {
    command: &'a str,
    #[serde(flatten)]
    stats: &'a CommandStats,
}

#[derive(Debug, Serialize)]
struct ScriptReport<'a> {
    description: &'a str,
    weight: u32,
    stats: &'a StatsData,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    commands: Vec<CommandReport<'a>>,
}

#[derive(Debug, Serialize)]
struct JsonReport<'a> {
    query_mode: String,
    scale: i64,
    clients: usize,
    threads: usize,
    max_tries: u32,
    transactions_per_client: Option<u64>,
    duration_s: Option<u64>,
    elapsed_s: f64,
    tps: f64,
    failures: u64,
    latency_late: u64,
    aborted_clients: usize,
    totals: &'a StatsData,
    latency_ms: Percentiles,
    scripts: Vec<ScriptReport<'a>>,
}

fn json_report<'a>(
    config: &BenchConfig,
    scripts: &'a ScriptSet,
    summary: &'a Summary,
) -> JsonReport<'a> {
    JsonReport {
        query_mode: config.mode.to_string(),
        scale: config.scale,
        clients: config.clients,
        threads: config.threads,
        max_tries: config.max_tries,
        transactions_per_client: config.transactions(),
        duration_s: config.duration(),
        elapsed_s: clock::as_secs_f64(summary.duration),
        tps: summary.tps(),
        failures: summary.total.failures(),
        latency_late: summary.latency_late,
        aborted_clients: summary.aborted_clients(),
        totals: &summary.total,
        latency_ms: Percentiles {
            p50: summary.percentile(0.5),
            p90: summary.percentile(0.9),
            p95: summary.percentile(0.95),
            p99: summary.percentile(0.99),
            p99_9: summary.percentile(0.999),
        },
        scripts: scripts
            .scripts()
            .iter()
            .enumerate()
            .map(|(i, script)| ScriptReport {
                description: &script.description,
                weight: script.weight,
                stats: &summary.script_stats[i],
                commands: if config.report_per_command {
                    script
                        .commands
                        .iter()
                        .zip(&summary.command_stats[i])
                        .map(|(c, stats)| CommandReport {
                            command: &c.first_line,
                            stats,
                        })
                        .collect()
                } else {
                    vec![]
                },
            })
            .collect(),
    }
}

/// Renders the report as a JSON document.
pub fn to_json(
    config: &BenchConfig,
    scripts: &ScriptSet,
    summary: &Summary,
) -> serde_json::Result<serde_json::Value> {
    serde_json::to_value(json_report(config, scripts, summary))
}

pub fn write_json(
    path: &Path,
    config: &BenchConfig,
    scripts: &ScriptSet,
    summary: &Summary,
) -> anyhow::Result<()> {
    let file = File::create(path)
        .with_context(|| format!("could not create report file {}", path.display()))?;
    let mut out = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut out, &json_report(config, scripts, summary))?;
    out.flush()
        .with_context(|| format!("could not write report file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use txbench_script::{QueryMode, ScriptParser};

    use super::*;
    use crate::clock::MICROS_PER_SEC;
    use crate::stats::ErrorStatus;

    fn scripts(texts: &[(&str, u32)]) -> ScriptSet {
        let mut parser = ScriptParser::new(QueryMode::Simple);
        ScriptSet::new(
            texts
                .iter()
                .enumerate()
                .map(|(i, (text, weight))| {
                    parser
                        .parse(&format!("script{i}.sql"), text, *weight)
                        .unwrap()
                })
                .collect(),
        )
    }

    fn summary(scripts: &ScriptSet, total: StatsData) -> Summary {
        let mut histogram = Histogram::new(3).unwrap();
        for _ in 0..total.latency.count {
            histogram.record(2000).unwrap();
        }
        Summary {
            script_stats: vec![total.clone(); scripts.len()],
            command_stats: scripts
                .scripts()
                .iter()
                .map(|s| vec![CommandStats::default(); s.commands.len()])
                .collect(),
            total,
            histogram,
            latency_late: 0,
            conn_time: 3000,
            duration: 2 * MICROS_PER_SEC,
            clients: vec![ClientSummary {
                id: 0,
                state: ClientState::Finished,
                transactions: 4,
            }],
        }
    }

    fn four_transactions() -> StatsData {
        let mut total = StatsData::new(0);
        for _ in 0..3 {
            total.accumulate(false, 2000.0, None, ErrorStatus::NoError, 1);
        }
        total.accumulate(false, 0.0, None, ErrorStatus::OtherSql, 1);
        total
    }

    #[test]
    fn plain_report() {
        let scripts = scripts(&[("SELECT 1;", 1)]);
        let config = BenchConfig {
            limit: RunLimit::Transactions(4),
            ..Default::default()
        };
        let text = render(&config, &scripts, &summary(&scripts, four_transactions()));
        assert_eq!(
            text,
            "transaction type: script0.sql\n\
             scaling factor: 1\n\
             query mode: simple\n\
             number of clients: 1\n\
             number of threads: 1\n\
             maximum number of tries: 1\n\
             number of transactions per client: 4\n\
             number of transactions actually processed: 3/4\n\
             number of failed transactions: 1 (25.000%)\n\
             latency average = 500.000 ms (including failures)\n\
             latency percentiles: p50 = 2.000 ms, p90 = 2.000 ms, p99 = 2.000 ms, p99.9 = 2.000 ms\n\
             initial connection time = 3.000 ms\n\
             tps = 1.500000 (without initial connection time)\n"
        );
    }

    #[test]
    fn per_script_and_command_report() {
        let scripts = scripts(&[("SELECT 1;", 1), ("SELECT 2;\nSELECT 3;", 3)]);
        let config = BenchConfig {
            limit: RunLimit::Duration(2),
            report_per_command: true,
            max_tries: 2,
            ..Default::default()
        };
        let text = render(&config, &scripts, &summary(&scripts, four_transactions()));
        assert!(text.starts_with("transaction type: multiple scripts\n"));
        assert!(text.contains("duration: 2 s\n"));
        assert!(text.contains("number of transactions retried: 0 (0.000%)\ntotal number of retries: 0\n"));
        assert!(text.contains("SQL script 2: script1.sql\n - weight: 3 (targets 75.0% of total)\n"));
        assert!(text.contains(" - statement latencies in milliseconds, failures and retries:\n"));
        assert!(text.contains("         0.000           0           0  SELECT 3;\n"));
    }

    #[test]
    fn json_has_percentiles() {
        let scripts = scripts(&[("SELECT 1;", 1)]);
        let config = BenchConfig::default();
        let json = to_json(&config, &scripts, &summary(&scripts, four_transactions())).unwrap();
        assert_eq!(json["totals"]["cnt"], 3);
        assert_eq!(json["totals"]["other_sql_failures"], 1);
        assert_eq!(json["latency_ms"]["p99.9"], 2.0);
        assert_eq!(json["aborted_clients"], 0);
        assert_eq!(json["scripts"][0]["description"], "script0.sql");
    }
}
