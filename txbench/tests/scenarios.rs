//! End-to-end runs against the in-process mock backend.

use std::time::Duration;

use pretty_assertions::assert_eq;
use txbench::client::ClientState;
use txbench::config::RunLimit;
use txbench::logger::LogSettings;
use txbench::{run, BenchConfig};
use txbench_client::mock::{MockBackend, Protocol, TraceEvent};
use txbench_client::QueryResult;
use txbench_script::{QueryMode, ScriptParser, ScriptSet};

fn scripts(mode: QueryMode, text: &str) -> ScriptSet {
    ScriptSet::new(vec![ScriptParser::new(mode)
        .parse("test", text, 1)
        .unwrap()])
}

fn config(mode: QueryMode, transactions: u64) -> BenchConfig {
    BenchConfig {
        mode,
        limit: RunLimit::Transactions(transactions),
        seed: 1,
        ..Default::default()
    }
}

#[test]
fn substitutes_variables() {
    let backend = MockBackend::new();
    let outcome = run(
        &config(QueryMode::Simple, 1),
        &scripts(QueryMode::Simple, "\\set x 5\nSELECT :x;"),
        &backend.connector(),
    )
    .unwrap();

    assert_eq!(backend.sql(), vec!["SELECT 5;"]);
    assert_eq!(outcome.summary.total.cnt, 1);
    assert_eq!(outcome.exit_code(), 0);
}

#[test]
fn captures_into_variables() {
    let backend = MockBackend::with_responder(|s| {
        if s.sql.starts_with("SELECT 7") {
            vec![QueryResult::tuples(
                vec!["seven".into()],
                vec![vec![Some("7".into())]],
            )]
        } else {
            vec![QueryResult::command_ok()]
        }
    });
    run(
        &config(QueryMode::Simple, 1),
        &scripts(
            QueryMode::Simple,
            "SELECT 7 AS seven \\gset\nSELECT :seven + 1;",
        ),
        &backend.connector(),
    )
    .unwrap();

    assert_eq!(backend.sql()[1], "SELECT 7 + 1;");
}

#[test]
fn other_errors_fail_the_transaction_without_retrying() {
    txbench_tracing::init_test_logging();
    let backend = MockBackend::with_responder(|s| {
        if s.sql.contains("1/0") {
            vec![QueryResult::error("22012", "division by zero")]
        } else {
            vec![QueryResult::command_ok()]
        }
    });
    let config = BenchConfig {
        max_tries: 5,
        ..config(QueryMode::Simple, 1)
    };
    let outcome = run(
        &config,
        &scripts(QueryMode::Simple, "BEGIN;\nSELECT 1/0;\nEND;"),
        &backend.connector(),
    )
    .unwrap();

    assert_eq!(backend.sql(), vec!["BEGIN;", "SELECT 1/0;", "ROLLBACK"]);
    let total = &outcome.summary.total;
    assert_eq!(total.cnt, 0);
    assert_eq!(total.other_sql_failures, 1);
    assert_eq!(total.retries, 0);
    assert_eq!(outcome.summary.command_stats[0][1].failures, 1);
    // a failed transaction is not an aborted client
    assert_eq!(outcome.exit_code(), 0);
}

#[test]
fn retries_serialization_failures() {
    let mut calls = 0;
    let backend = MockBackend::with_responder(move |_| {
        calls += 1;
        if calls <= 2 {
            vec![QueryResult::error(
                "40001",
                "could not serialize access due to concurrent update",
            )]
        } else {
            vec![QueryResult::command_ok()]
        }
    });
    let config = BenchConfig {
        max_tries: 5,
        ..config(QueryMode::Simple, 1)
    };
    let outcome = run(
        &config,
        &scripts(QueryMode::Simple, "UPDATE t SET v = v + 1;"),
        &backend.connector(),
    )
    .unwrap();

    let total = &outcome.summary.total;
    assert_eq!(backend.sql().len(), 3);
    assert_eq!(total.cnt, 1);
    assert_eq!(total.retries, 2);
    assert_eq!(total.retried, 1);
    assert_eq!(total.serialization_failures, 0);
}

#[test]
fn serializable_block_is_rolled_back_and_retried() {
    let mut selects = 0;
    let backend = MockBackend::with_responder(move |s| {
        if s.sql == "SELECT 1;" {
            selects += 1;
            if selects <= 2 {
                return vec![QueryResult::error(
                    "40001",
                    "could not serialize access due to read/write dependencies among transactions",
                )];
            }
        }
        vec![QueryResult::command_ok()]
    });
    let config = BenchConfig {
        max_tries: 5,
        ..config(QueryMode::Simple, 1)
    };
    let outcome = run(
        &config,
        &scripts(
            QueryMode::Simple,
            "BEGIN ISOLATION LEVEL SERIALIZABLE;\nSELECT 1;\nCOMMIT;",
        ),
        &backend.connector(),
    )
    .unwrap();

    let begin = "BEGIN ISOLATION LEVEL SERIALIZABLE;";
    assert_eq!(
        backend.sql(),
        vec![
            begin, "SELECT 1;", "ROLLBACK", begin, "SELECT 1;", "ROLLBACK", begin, "SELECT 1;",
            "COMMIT;",
        ]
    );
    let total = &outcome.summary.total;
    assert_eq!(total.cnt, 1);
    assert_eq!(total.retries, 2);
    assert_eq!(total.retried, 1);
    assert_eq!(total.failures(), 0);
    assert_eq!(outcome.summary.command_stats[0][1].retries, 2);
    assert_eq!(outcome.exit_code(), 0);
}

#[test]
fn every_started_transaction_is_accounted_for() {
    txbench_tracing::init_test_logging();
    let mut calls = 0;
    let backend = MockBackend::with_responder(move |_| {
        calls += 1;
        match calls % 4 {
            0 => vec![QueryResult::command_ok()],
            1 => vec![QueryResult::error("40001", "could not serialize access")],
            2 => vec![QueryResult::error("40P01", "deadlock detected")],
            _ => vec![QueryResult::error("22012", "division by zero")],
        }
    });
    let mut parser = ScriptParser::new(QueryMode::Simple);
    let scripts = ScriptSet::new(vec![
        parser.parse("a", "UPDATE a SET v = v + 1;", 1).unwrap(),
        parser.parse("b", "UPDATE b SET v = v + 1;", 3).unwrap(),
    ]);
    let config = BenchConfig {
        clients: 2,
        threads: 2,
        max_tries: 1,
        ..config(QueryMode::Simple, 8)
    };
    let outcome = run(&config, &scripts, &backend.connector()).unwrap();

    let summary = &outcome.summary;
    let total = &summary.total;
    assert_eq!(backend.sql().len(), 16);
    assert_eq!(total.total(), 16);
    assert_eq!(total.cnt, 4);
    assert_eq!(total.serialization_failures, 4);
    assert_eq!(total.deadlock_failures, 4);
    assert_eq!(total.other_sql_failures, 4);
    assert_eq!(total.retries, 0);
    assert_eq!(
        summary.script_stats.iter().map(|s| s.total()).sum::<u64>(),
        16
    );
    assert!(summary.clients.iter().all(|c| c.transactions == 8));
    assert_eq!(outcome.exit_code(), 0);

    // without throttling every transaction starts when it is scheduled
    assert_eq!(total.lag.count, 0);
    assert_eq!(total.lag.max, 0.0);
    assert_eq!(total.lag.sum, 0.0);
}

#[test]
fn retries_are_bounded_by_max_tries() {
    txbench_tracing::init_test_logging();
    let backend = MockBackend::with_responder(|_| {
        vec![QueryResult::error("40P01", "deadlock detected")]
    });
    let config = BenchConfig {
        max_tries: 3,
        ..config(QueryMode::Simple, 2)
    };
    let outcome = run(
        &config,
        &scripts(QueryMode::Simple, "UPDATE t SET v = v + 1;"),
        &backend.connector(),
    )
    .unwrap();

    let total = &outcome.summary.total;
    assert_eq!(backend.sql().len(), 6);
    assert_eq!(total.cnt, 0);
    assert_eq!(total.deadlock_failures, 2);
    assert_eq!(total.retries, 4);
    assert_eq!(total.retried, 2);
}

#[test]
fn skips_inactive_branches() {
    let backend = MockBackend::new();
    let outcome = run(
        &config(QueryMode::Simple, 1),
        &scripts(
            QueryMode::Simple,
            "\\if 0\nSELECT 'skip';\n\\else\nSELECT 'run';\n\\endif",
        ),
        &backend.connector(),
    )
    .unwrap();

    assert_eq!(backend.sql(), vec!["SELECT 'run';"]);
    assert_eq!(outcome.summary.clients[0].state, ClientState::Finished);
    assert_eq!(outcome.exit_code(), 0);
}

#[test]
fn conditionals_start_over_with_each_transaction() {
    let backend = MockBackend::new();
    let outcome = run(
        &config(QueryMode::Simple, 3),
        &scripts(
            QueryMode::Simple,
            "\\if 1\n\\if 0\nSELECT 'inner';\n\\elif 1\nSELECT 'elif';\n\\endif\n\\else\nSELECT 'outer';\n\\endif\nSELECT 'after';",
        ),
        &backend.connector(),
    )
    .unwrap();

    assert_eq!(backend.sql(), ["SELECT 'elif';", "SELECT 'after';"].repeat(3));
    assert_eq!(outcome.summary.clients[0].state, ClientState::Finished);
    assert_eq!(outcome.summary.clients[0].transactions, 3);
    assert_eq!(outcome.exit_code(), 0);
}

#[test]
fn prepares_pipelined_statements_up_front() {
    let backend = MockBackend::new();
    let outcome = run(
        &config(QueryMode::Prepared, 1),
        &scripts(
            QueryMode::Prepared,
            "\\startpipeline\nSELECT 1;\nSELECT 2;\n\\endpipeline",
        ),
        &backend.connector(),
    )
    .unwrap();
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.summary.total.cnt, 1);

    let trace = backend.trace();
    let first_execute = trace
        .iter()
        .position(|e| matches!(e, TraceEvent::Execute(_)))
        .unwrap();
    let prepares = trace
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, TraceEvent::Prepare { .. }))
        .map(|(i, _)| i)
        .collect::<Vec<_>>();
    assert_eq!(prepares.len(), 2);
    assert!(prepares.iter().all(|i| *i < first_execute), "{trace:?}");
    assert_eq!(
        trace
            .iter()
            .filter(|e| matches!(e, TraceEvent::PipelineSync(_)))
            .count(),
        1
    );
    assert!(backend
        .statements()
        .iter()
        .all(|s| s.protocol == Protocol::Prepared));
}

#[test]
fn gset_in_pipeline_aborts_the_client() {
    txbench_tracing::init_test_logging();
    let backend = MockBackend::new();
    let outcome = run(
        &config(QueryMode::Extended, 1),
        &scripts(
            QueryMode::Extended,
            "\\startpipeline\nSELECT 1 AS one \\gset\n\\endpipeline",
        ),
        &backend.connector(),
    )
    .unwrap();

    assert!(backend.sql().is_empty());
    assert_eq!(outcome.summary.aborted_clients(), 1);
    assert_eq!(outcome.exit_code(), 1);
}

#[test]
fn pipelines_are_rejected_with_the_simple_protocol() {
    let backend = MockBackend::new();
    let outcome = run(
        &config(QueryMode::Simple, 1),
        &scripts(QueryMode::Simple, "\\startpipeline\nSELECT 1;\n\\endpipeline"),
        &backend.connector(),
    )
    .unwrap();
    assert_eq!(outcome.exit_code(), 1);
}

#[test]
fn late_transactions_are_skipped_under_a_latency_limit() {
    let backend = MockBackend::new().with_latency(Duration::from_millis(250));
    let config = BenchConfig {
        limit: RunLimit::Duration(1),
        rate: Some(10.0),
        throttle_delay: Some(100_000.0),
        latency_limit: Some(100_000),
        ..config(QueryMode::Simple, 0)
    };
    let outcome = run(
        &config,
        &scripts(QueryMode::Simple, "SELECT 1;"),
        &backend.connector(),
    )
    .unwrap();

    let total = &outcome.summary.total;
    // about 10 slots in the second, of which about 4 fit behind 250 ms responses
    assert!((4..=8).contains(&total.skipped), "{total:?}");
    assert!((8..=12).contains(&(total.cnt + total.skipped)), "{total:?}");
    assert_eq!(total.failures(), 0);
    // skipped transactions never reach the server and record no latency
    assert_eq!(backend.sql().len() as u64, total.cnt);
    assert_eq!(total.latency.count, total.cnt);
    // every transaction that ran took longer than the limit
    assert_eq!(outcome.summary.latency_late, total.cnt);
    assert_eq!(outcome.exit_code(), 0);
}

#[test]
fn same_seed_binds_same_values() {
    let run_once = || {
        let backend = MockBackend::new();
        let config = BenchConfig {
            clients: 2,
            threads: 2,
            seed: 42,
            ..config(QueryMode::Extended, 5)
        };
        run(
            &config,
            &scripts(
                QueryMode::Extended,
                "\\set a random(1, 100000)\n\\set b random_exponential(1, 1000, 2.5)\nSELECT :a, :b;",
            ),
            &backend.connector(),
        )
        .unwrap();
        // threads interleave and number their connections in any order
        let mut params = backend
            .statements()
            .into_iter()
            .map(|s| s.params)
            .collect::<Vec<_>>();
        params.sort();
        params
    };

    let first = run_once();
    assert_eq!(first.len(), 10);
    assert_eq!(first, run_once());
}

#[test]
fn connects_per_transaction() {
    let backend = MockBackend::new();
    let config = BenchConfig {
        connect_per_tx: true,
        ..config(QueryMode::Simple, 3)
    };
    let outcome = run(
        &config,
        &scripts(QueryMode::Simple, "SELECT 1;"),
        &backend.connector(),
    )
    .unwrap();

    assert_eq!(backend.connections(), 3);
    let disconnects = backend
        .trace()
        .iter()
        .filter(|e| matches!(e, TraceEvent::Disconnect(_)))
        .count();
    assert_eq!(disconnects, 3);
    assert_eq!(outcome.summary.total.cnt, 3);
}

#[test]
fn failing_to_connect_fails_the_run() {
    txbench_tracing::init_test_logging();
    let backend = MockBackend::new().refusing_connections();
    let config = BenchConfig {
        clients: 3,
        threads: 2,
        ..config(QueryMode::Simple, 1)
    };
    let result = run(
        &config,
        &scripts(QueryMode::Simple, "SELECT 1;"),
        &backend.connector(),
    );
    assert!(result.is_err());
    assert!(backend.sql().is_empty());
}

#[test]
fn exit_on_abort_stops_everyone() {
    txbench_tracing::init_test_logging();
    let backend = MockBackend::new();
    let config = BenchConfig {
        clients: 2,
        exit_on_abort: true,
        ..config(QueryMode::Simple, 1000)
    };
    let outcome = run(
        &config,
        &scripts(
            QueryMode::Simple,
            "\\if :client_id = 0\n\\set x 1 / 0\n\\endif\nSELECT 1;",
        ),
        &backend.connector(),
    )
    .unwrap();

    assert_eq!(outcome.exit_code(), 2);
    let states = outcome
        .summary
        .clients
        .iter()
        .map(|c| c.state)
        .collect::<Vec<_>>();
    assert_eq!(states[0], ClientState::Aborted);
    assert_ne!(states[1], ClientState::Finished);
    assert!(outcome.summary.clients[1].transactions < 1000);
}

#[test]
fn writes_one_log_line_per_transaction() {
    let dir = std::env::temp_dir();
    let prefix = dir
        .join(format!("txbench_scenario_{}", std::process::id()))
        .to_string_lossy()
        .into_owned();
    let settings = LogSettings {
        prefix,
        ..Default::default()
    };
    let config = BenchConfig {
        clients: 2,
        threads: 2,
        log: Some(settings.clone()),
        ..config(QueryMode::Simple, 3)
    };
    let backend = MockBackend::new();
    run(
        &config,
        &scripts(QueryMode::Simple, "SELECT 1;"),
        &backend.connector(),
    )
    .unwrap();

    for tid in 0..2 {
        let path = settings.path(std::process::id(), tid);
        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        let lines = contents.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 3, "{contents}");
        for (i, line) in lines.iter().enumerate() {
            let fields = line.split(' ').collect::<Vec<_>>();
            assert_eq!(fields[0], tid.to_string());
            assert_eq!(fields[1], (i + 1).to_string());
        }
    }
}
