//! Documents the set of metrics recorded by the benchmark driver. They are only exported when
//! `--metrics-address` is given.

/// Counter: The number of transactions that ended, by outcome.
///
/// | Tag | Description |
/// | --- | ----------- |
/// | script | Description of the script the transaction ran |
/// | status | `success`, `failed` or `skipped` |
pub const TRANSACTIONS: &str = "txbench_transactions_total";

/// Counter: The number of times a transaction was tried again after a serialization failure or
/// deadlock.
///
/// | Tag | Description |
/// | --- | ----------- |
/// | script | Description of the script the transaction ran |
pub const RETRIES: &str = "txbench_retries_total";

/// Histogram: Latency in microseconds of successful transactions, measured from their scheduled
/// start.
///
/// | Tag | Description |
/// | --- | ----------- |
/// | script | Description of the script the transaction ran |
pub const LATENCY: &str = "txbench_latency_us";
