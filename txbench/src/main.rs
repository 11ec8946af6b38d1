use std::process::ExitCode;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};
use txbench::config::load_scripts;
use txbench::report;
use txbench::{BenchConfig, Invocation, Options};
use txbench_client::PgConnector;

/// Exit status for bad options and anything else that stops a run from starting.
const EXIT_FATAL: u8 = 2;

fn run(options: Options, sources: Vec<txbench::config::ScriptSource>) -> anyhow::Result<u8> {
    let config = BenchConfig::from_options(&options)?;
    let scripts = load_scripts(&sources, config.mode)?;

    if let Some(addr) = options.metrics_address {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .with_context(|| format!("could not serve metrics on {addr}"))?;
        info!(%addr, "serving metrics");
    }

    let connector = PgConnector::new(options.database.clone());
    let outcome = txbench::run(&config, &scripts, &connector)?;

    print!("{}", report::render(&config, &scripts, &outcome.summary));
    report::log_summary(&outcome.summary);
    if let Some(path) = &options.report_json {
        report::write_json(path, &config, &scripts, &outcome.summary)?;
    }

    let aborted = outcome.summary.aborted_clients();
    if aborted > 0 {
        error!("Run was aborted; the above results are incomplete.");
        info!(aborted, "clients aborted");
    }
    Ok(outcome.exit_code() as u8)
}

fn main() -> ExitCode {
    let (options, sources) = match Options::parse_invocation(std::env::args_os()) {
        Ok(Invocation::Run { options, sources }) => (*options, sources),
        Ok(Invocation::ListBuiltins) => {
            eprint!("{}", txbench_script::builtin::listing());
            return ExitCode::SUCCESS;
        }
        // prints help and version too
        Err(e) => e.exit(),
    };

    let _guard = match options.tracing.init(options.debug) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("could not set up logging: {e}");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    match run(options, sources) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}
