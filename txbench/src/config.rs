//! Command-line options and the validated run configuration derived from them.

use std::fs;
use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context};
use clap::{ArgAction, ArgMatches, CommandFactory, FromArgMatches, Parser};
use txbench_client::PgConfig;
use txbench_script::variables::is_valid_name;
use txbench_script::{find_builtin, parse_weight, QueryMode, ScriptParser, ScriptSet};

use crate::clock::Micros;
use crate::logger::{LogSettings, DEFAULT_PREFIX};

/// A TPC-B-like database benchmark
///
/// Runs SQL scripts in a loop from many concurrent clients and reports throughput, latency
/// and failures.
#[derive(Debug, Parser)]
#[command(name = "txbench", version, disable_help_flag = true)]
pub struct Options {
    /// Print help
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,

    #[command(flatten)]
    pub database: PgConfig,

    #[command(flatten)]
    pub tracing: txbench_tracing::Options,

    /// Number of concurrent database clients
    #[arg(short = 'c', long = "client", default_value_t = 1)]
    pub clients: usize,

    /// Number of threads
    #[arg(short = 'j', long = "jobs", default_value_t = 1)]
    pub threads: usize,

    /// Number of transactions each client runs [default: 10]
    #[arg(short = 't', long = "transactions")]
    pub transactions: Option<u64>,

    /// Duration of the benchmark in seconds
    #[arg(short = 'T', long = "time")]
    pub duration: Option<u64>,

    /// Establish a new connection for each transaction
    #[arg(short = 'C', long)]
    pub connect: bool,

    /// Protocol for submitting queries: simple, extended or prepared
    #[arg(short = 'M', long = "protocol", default_value = "simple")]
    pub mode: QueryMode,

    /// Target rate in transactions per second
    #[arg(short = 'R', long)]
    pub rate: Option<f64>,

    /// Count transactions lasting more than this many milliseconds as late
    #[arg(short = 'L', long)]
    pub latency_limit: Option<f64>,

    /// Maximum number of tries to run a transaction (0 for unlimited)
    #[arg(long, default_value_t = 1)]
    pub max_tries: u32,

    /// Report failures per error type
    #[arg(long)]
    pub failures_detailed: bool,

    /// Write transaction times to log files
    #[arg(short = 'l', long = "log")]
    pub log: bool,

    /// Fraction of transactions to log, e.g. 0.01 for 1%
    #[arg(long)]
    pub sampling_rate: Option<f64>,

    /// Aggregate log data over this many seconds
    #[arg(long)]
    pub aggregate_interval: Option<u64>,

    /// Prefix for transaction log file names
    #[arg(long)]
    pub log_prefix: Option<String>,

    /// Show a progress report every this many seconds
    #[arg(short = 'P', long)]
    pub progress: Option<u64>,

    /// Use Unix epoch timestamps for progress reports
    #[arg(long)]
    pub progress_timestamp: bool,

    /// Seed for random number generation: `time`, `rand` or an integer
    #[arg(long, env = "TXBENCH_RANDOM_SEED", default_value = "time")]
    pub random_seed: SeedSource,

    /// Add a script from FILE, with an optional relative weight
    #[arg(short = 'f', long = "file", value_name = "FILE[@W]")]
    pub files: Vec<String>,

    /// Add a builtin script, with an optional relative weight; `-b list` lists them
    #[arg(short = 'b', long = "builtin", value_name = "NAME[@W]")]
    pub builtins: Vec<String>,

    /// Skip updates of tellers and branches (same as `-b simple-update`)
    #[arg(short = 'N', long = "skip-some-updates", action = ArgAction::Count)]
    pub skip_some_updates: u8,

    /// Run a select-only script (same as `-b select-only`)
    #[arg(short = 'S', long = "select-only", action = ArgAction::Count)]
    pub select_only: u8,

    /// Define a variable for use by custom scripts
    #[arg(short = 'D', long = "define", value_name = "NAME=VALUE", value_parser = parse_define)]
    pub defines: Vec<(String, String)>,

    /// Value of the `scale` variable
    #[arg(short = 's', long, default_value_t = 1)]
    pub scale: i64,

    /// Report average latency per command
    #[arg(short = 'r', long = "report-per-command")]
    pub report_per_command: bool,

    /// Print a message for every error, retried or not
    #[arg(long)]
    pub verbose_errors: bool,

    /// Stop the benchmark as soon as any client aborts
    #[arg(long)]
    pub exit_on_abort: bool,

    /// Print debugging output
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Also write the final report as JSON to this file
    #[arg(long, value_name = "PATH")]
    pub report_json: Option<PathBuf>,

    /// Serve Prometheus metrics on this address while the benchmark runs
    #[arg(long, value_name = "ADDR")]
    pub metrics_address: Option<SocketAddr>,
}

fn parse_define(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid variable definition: \"{s}\""))?;
    if !is_valid_name(name) {
        return Err(format!("invalid variable name: \"{name}\""));
    }
    Ok((name.to_owned(), value.to_owned()))
}

/// Where the base random seed comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedSource {
    /// The current time
    Time,
    /// A strong random source
    Rand,
    Value(u64),
}

impl FromStr for SeedSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "time" => Ok(SeedSource::Time),
            "rand" => Ok(SeedSource::Rand),
            _ => s
                .parse::<u64>()
                .map(SeedSource::Value)
                .map_err(|_| format!("unrecognized random seed option \"{s}\"")),
        }
    }
}

impl SeedSource {
    pub fn resolve(self) -> u64 {
        match self {
            SeedSource::Time => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_micros() as u64),
            SeedSource::Rand => rand::random(),
            SeedSource::Value(seed) => seed,
        }
    }
}

/// Where a script comes from, in command line order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSource {
    File { path: String, weight: u32 },
    Builtin { name: String, weight: u32 },
}

impl ScriptSource {
    fn file(spec: &str) -> Result<Self, String> {
        let (path, weight) = parse_weight(spec)?;
        Ok(ScriptSource::File {
            path: path.to_owned(),
            weight,
        })
    }

    fn builtin(spec: &str) -> Result<Self, String> {
        let (name, weight) = parse_weight(spec)?;
        Ok(ScriptSource::Builtin {
            name: name.to_owned(),
            weight,
        })
    }
}

/// What the command line asks for.
#[derive(Debug)]
pub enum Invocation {
    Run {
        options: Box<Options>,
        sources: Vec<ScriptSource>,
    },
    /// `-b list`
    ListBuiltins,
}

impl Options {
    /// Parses `args` (including the program name), keeping `-f`, `-b`, `-N` and `-S` in the
    /// order they were given.
    pub fn parse_invocation<I, T>(args: I) -> Result<Invocation, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let matches = Self::command().try_get_matches_from(args)?;
        let options = Self::from_arg_matches(&matches)?;
        if options.builtins.iter().any(|b| b == "list") {
            return Ok(Invocation::ListBuiltins);
        }
        let sources = script_sources(&options, &matches).map_err(|e| {
            Self::command().error(clap::error::ErrorKind::ValueValidation, e)
        })?;
        Ok(Invocation::Run {
            options: Box::new(options),
            sources,
        })
    }
}

fn indices(matches: &ArgMatches, id: &str) -> Vec<usize> {
    matches
        .indices_of(id)
        .map(|i| i.collect())
        .unwrap_or_default()
}

fn script_sources(options: &Options, matches: &ArgMatches) -> Result<Vec<ScriptSource>, String> {
    let mut sources: Vec<(usize, ScriptSource)> = vec![];
    for (spec, index) in options.files.iter().zip(indices(matches, "files")) {
        sources.push((index, ScriptSource::file(spec)?));
    }
    for (spec, index) in options.builtins.iter().zip(indices(matches, "builtins")) {
        sources.push((index, ScriptSource::builtin(spec)?));
    }
    for (id, name) in [
        ("skip_some_updates", "simple-update"),
        ("select_only", "select-only"),
    ] {
        for index in indices(matches, id) {
            sources.push((
                index,
                ScriptSource::Builtin {
                    name: name.to_owned(),
                    weight: 1,
                },
            ));
        }
    }
    sources.sort_by_key(|(index, _)| *index);
    Ok(sources.into_iter().map(|(_, s)| s).collect())
}

/// Reads and parses every script, defaulting to the TPC-B-like builtin.
pub fn load_scripts(sources: &[ScriptSource], mode: QueryMode) -> anyhow::Result<ScriptSet> {
    let default = [ScriptSource::Builtin {
        name: "tpcb-like".to_owned(),
        weight: 1,
    }];
    let sources = if sources.is_empty() {
        &default[..]
    } else {
        sources
    };

    let mut parser = ScriptParser::new(mode);
    let mut scripts = vec![];
    for source in sources {
        let script = match source {
            ScriptSource::File { path, weight } => {
                let text = if path == "-" {
                    let mut text = String::new();
                    std::io::stdin()
                        .read_to_string(&mut text)
                        .context("could not read script from stdin")?;
                    text
                } else {
                    fs::read_to_string(path)
                        .with_context(|| format!("could not read file \"{path}\""))?
                };
                parser.parse(path, &text, *weight)?
            }
            ScriptSource::Builtin { name, weight } => {
                let builtin = find_builtin(name)?;
                parser.parse(builtin.description, builtin.script, *weight)?
            }
        };
        if script.commands.is_empty() {
            return Err(anyhow!("script \"{}\" is empty", script.description));
        }
        scripts.push(script);
    }

    let set = ScriptSet::new(scripts);
    if set.total_weight() == 0 {
        return Err(anyhow!("total script weight must not be zero"));
    }
    Ok(set)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be positive")]
    NotPositive(&'static str),

    #[error("specify either a number of transactions (-t) or a duration (-T), not both")]
    TransactionsAndDuration,

    #[error("log sampling (--sampling-rate) and aggregation (--aggregate-interval) cannot be used at the same time")]
    SamplingWithAggregation,

    #[error("{0} is allowed only when actually logging transactions")]
    RequiresLog(&'static str),

    #[error("invalid sampling rate, expecting 0.0 < rate <= 1.0")]
    SamplingRate,

    #[error("duration ({duration}) must be a multiple of aggregation interval ({interval})")]
    AggregateInterval { duration: u64, interval: u64 },

    #[error(
        "an unlimited number of transaction tries can only be used with --latency-limit or a \
         duration (-T)"
    )]
    UnlimitedTries,
}

/// How a run ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunLimit {
    /// Each client runs this many transactions
    Transactions(u64),
    /// The run lasts this many seconds
    Duration(u64),
}

/// Everything a run needs, validated. Shared read-only by all threads.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub clients: usize,
    pub threads: usize,
    pub limit: RunLimit,
    /// Connect anew for each transaction
    pub connect_per_tx: bool,
    pub mode: QueryMode,
    /// Target transactions per second over all clients
    pub rate: Option<f64>,
    /// Mean delay between transaction starts on one thread, in microseconds
    pub throttle_delay: Option<f64>,
    pub latency_limit: Option<Micros>,
    /// 0 means unlimited
    pub max_tries: u32,
    pub failures_detailed: bool,
    pub log: Option<LogSettings>,
    /// Seconds between progress reports
    pub progress: Option<u64>,
    pub progress_timestamp: bool,
    pub report_per_command: bool,
    pub verbose_errors: bool,
    pub exit_on_abort: bool,
    pub seed: u64,
    pub scale: i64,
    /// Variables defined with `-D`
    pub variables: Vec<(String, String)>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            clients: 1,
            threads: 1,
            limit: RunLimit::Transactions(10),
            connect_per_tx: false,
            mode: QueryMode::Simple,
            rate: None,
            throttle_delay: None,
            latency_limit: None,
            max_tries: 1,
            failures_detailed: false,
            log: None,
            progress: None,
            progress_timestamp: false,
            report_per_command: false,
            verbose_errors: false,
            exit_on_abort: false,
            seed: 0,
            scale: 1,
            variables: vec![],
        }
    }
}

impl BenchConfig {
    pub fn from_options(options: &Options) -> Result<Self, ConfigError> {
        if options.clients == 0 {
            return Err(ConfigError::NotPositive("number of clients (-c)"));
        }
        if options.threads == 0 {
            return Err(ConfigError::NotPositive("number of threads (-j)"));
        }
        if options.rate.is_some_and(|r| r <= 0.0) {
            return Err(ConfigError::NotPositive("rate (-R)"));
        }
        if options.latency_limit.is_some_and(|l| l <= 0.0) {
            return Err(ConfigError::NotPositive("latency limit (-L)"));
        }
        if options.progress == Some(0) {
            return Err(ConfigError::NotPositive("progress interval (-P)"));
        }
        if options.transactions == Some(0) {
            return Err(ConfigError::NotPositive("number of transactions (-t)"));
        }
        if options.duration == Some(0) {
            return Err(ConfigError::NotPositive("duration (-T)"));
        }
        if options.aggregate_interval == Some(0) {
            return Err(ConfigError::NotPositive("aggregation interval"));
        }

        let limit = match (options.transactions, options.duration) {
            (Some(_), Some(_)) => return Err(ConfigError::TransactionsAndDuration),
            (_, Some(d)) => RunLimit::Duration(d),
            (Some(n), None) => RunLimit::Transactions(n),
            (None, None) => RunLimit::Transactions(10),
        };

        if !options.log {
            if options.sampling_rate.is_some() {
                return Err(ConfigError::RequiresLog("log sampling (--sampling-rate)"));
            }
            if options.aggregate_interval.is_some() {
                return Err(ConfigError::RequiresLog(
                    "log aggregation (--aggregate-interval)",
                ));
            }
            if options.log_prefix.is_some() {
                return Err(ConfigError::RequiresLog("log file prefix (--log-prefix)"));
            }
        }
        if options.sampling_rate.is_some() && options.aggregate_interval.is_some() {
            return Err(ConfigError::SamplingWithAggregation);
        }
        if options
            .sampling_rate
            .is_some_and(|r| r <= 0.0 || r > 1.0)
        {
            return Err(ConfigError::SamplingRate);
        }
        if let (Some(interval), RunLimit::Duration(duration)) = (options.aggregate_interval, limit)
        {
            if duration % interval != 0 {
                return Err(ConfigError::AggregateInterval { duration, interval });
            }
        }

        let latency_limit = options.latency_limit.map(|ms| (ms * 1000.0) as Micros);
        if options.max_tries == 0
            && latency_limit.is_none()
            && !matches!(limit, RunLimit::Duration(_))
        {
            return Err(ConfigError::UnlimitedTries);
        }

        let threads = options.threads.min(options.clients);
        let log = options.log.then(|| LogSettings {
            prefix: options
                .log_prefix
                .clone()
                .unwrap_or_else(|| DEFAULT_PREFIX.to_owned()),
            sampling_rate: options.sampling_rate,
            aggregate_interval: options.aggregate_interval,
            failures_detailed: options.failures_detailed,
            throttled: options.rate.is_some(),
            retries: options.max_tries != 1,
        });

        Ok(Self {
            clients: options.clients,
            threads,
            limit,
            connect_per_tx: options.connect,
            mode: options.mode,
            rate: options.rate,
            throttle_delay: options.rate.map(|r| 1_000_000.0 * threads as f64 / r),
            latency_limit,
            max_tries: options.max_tries,
            failures_detailed: options.failures_detailed,
            log,
            progress: options.progress,
            progress_timestamp: options.progress_timestamp,
            report_per_command: options.report_per_command,
            verbose_errors: options.verbose_errors,
            exit_on_abort: options.exit_on_abort,
            seed: options.random_seed.resolve(),
            scale: options.scale,
            variables: options.defines.clone(),
        })
    }

    /// The per-client transaction quota, if the run is bounded by one.
    pub fn transactions(&self) -> Option<u64> {
        match self.limit {
            RunLimit::Transactions(n) => Some(n),
            RunLimit::Duration(_) => None,
        }
    }

    /// The run duration in seconds, if the run is bounded by time.
    pub fn duration(&self) -> Option<u64> {
        match self.limit {
            RunLimit::Duration(d) => Some(d),
            RunLimit::Transactions(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn invocation(args: &[&str]) -> Invocation {
        Options::parse_invocation(std::iter::once("txbench").chain(args.iter().copied())).unwrap()
    }

    fn run(args: &[&str]) -> (Options, Vec<ScriptSource>) {
        match invocation(args) {
            Invocation::Run { options, sources } => (*options, sources),
            Invocation::ListBuiltins => panic!("expected a run"),
        }
    }

    fn config(args: &[&str]) -> Result<BenchConfig, ConfigError> {
        BenchConfig::from_options(&run(args).0)
    }

    #[test]
    fn defaults() {
        let config = config(&["--random-seed", "7"]).unwrap();
        assert_eq!(config.clients, 1);
        assert_eq!(config.limit, RunLimit::Transactions(10));
        assert_eq!(config.mode, QueryMode::Simple);
        assert_eq!(config.max_tries, 1);
        assert_eq!(config.seed, 7);
        assert!(config.log.is_none());
    }

    #[test]
    fn script_sources_keep_command_line_order() {
        let (_, sources) = run(&["-b", "select@3", "-f", "a.sql", "-N", "-f", "b.sql@0"]);
        assert_eq!(
            sources,
            vec![
                ScriptSource::Builtin {
                    name: "select".into(),
                    weight: 3
                },
                ScriptSource::File {
                    path: "a.sql".into(),
                    weight: 1
                },
                ScriptSource::Builtin {
                    name: "simple-update".into(),
                    weight: 1
                },
                ScriptSource::File {
                    path: "b.sql".into(),
                    weight: 0
                },
            ]
        );
    }

    #[test]
    fn builtin_list() {
        assert!(matches!(
            invocation(&["-b", "list"]),
            Invocation::ListBuiltins
        ));
    }

    #[test]
    fn threads_capped_at_clients() {
        let config = config(&["-c", "2", "-j", "8"]).unwrap();
        assert_eq!(config.threads, 2);
    }

    #[test]
    fn throttle_delay_per_thread() {
        let config = config(&["-c", "4", "-j", "2", "-R", "100", "-L", "2.5"]).unwrap();
        assert_eq!(config.throttle_delay, Some(20_000.0));
        assert_eq!(config.latency_limit, Some(2500));
    }

    #[test]
    fn validation_errors() {
        assert_eq!(
            config(&["-t", "5", "-T", "5"]).unwrap_err(),
            ConfigError::TransactionsAndDuration
        );
        assert_eq!(
            config(&["--sampling-rate", "0.5"]).unwrap_err(),
            ConfigError::RequiresLog("log sampling (--sampling-rate)")
        );
        assert_eq!(
            config(&["-l", "--sampling-rate", "1.5"]).unwrap_err(),
            ConfigError::SamplingRate
        );
        assert_eq!(
            config(&["-l", "--sampling-rate", "0.5", "--aggregate-interval", "1"]).unwrap_err(),
            ConfigError::SamplingWithAggregation
        );
        assert_eq!(
            config(&["-l", "-T", "10", "--aggregate-interval", "3"]).unwrap_err(),
            ConfigError::AggregateInterval {
                duration: 10,
                interval: 3
            }
        );
        assert_eq!(
            config(&["--max-tries", "0"]).unwrap_err(),
            ConfigError::UnlimitedTries
        );
        assert!(config(&["--max-tries", "0", "-T", "1"]).is_ok());
        assert_eq!(
            config(&["-c", "0"]).unwrap_err(),
            ConfigError::NotPositive("number of clients (-c)")
        );
    }

    #[test]
    fn log_settings() {
        let config = config(&["-l", "--log-prefix", "run", "-R", "5", "--max-tries", "3"]).unwrap();
        let log = config.log.unwrap();
        assert_eq!(log.prefix, "run");
        assert!(log.throttled);
        assert!(log.retries);
    }

    #[test]
    fn defines() {
        let (options, _) = run(&["-D", "a=1", "-D", "b=x=y"]);
        assert_eq!(
            options.defines,
            vec![("a".into(), "1".into()), ("b".into(), "x=y".into())]
        );
        assert!(Options::parse_invocation(["txbench", "-D", "1a=2"]).is_err());
        assert!(Options::parse_invocation(["txbench", "-D", "novalue"]).is_err());
    }

    #[test]
    fn seed_sources() {
        assert_eq!("time".parse::<SeedSource>(), Ok(SeedSource::Time));
        assert_eq!("rand".parse::<SeedSource>(), Ok(SeedSource::Rand));
        assert_eq!("42".parse::<SeedSource>(), Ok(SeedSource::Value(42)));
        assert!("-1".parse::<SeedSource>().is_err());
    }

    #[test]
    fn loads_builtin_by_default() {
        let scripts = load_scripts(&[], QueryMode::Simple).unwrap();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts.get(0).description, "<builtin: TPC-B (sort of)>");
    }

    #[test]
    fn zero_total_weight() {
        let err = load_scripts(
            &[ScriptSource::Builtin {
                name: "select-only".into(),
                weight: 0,
            }],
            QueryMode::Simple,
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "total script weight must not be zero");
    }
}
