//! A multi-threaded transactional benchmark client.
//!
//! Many simulated clients run scripts of SQL statements and meta-commands in a loop against a
//! database server, optionally throttled to a target rate, retrying serialization failures and
//! deadlocks. Each benchmark thread multiplexes its clients over a single `poll(2)` loop, and the
//! measurements of all threads are merged into a final report.
//!
//! The entry point is [`coordinator::run`], which takes a validated [`BenchConfig`], the parsed
//! scripts and a [`Connector`](txbench_client::Connector).

#![deny(macro_use_extern_crate)]

pub mod client;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod logger;
pub mod recorded;
pub mod report;
pub mod shell;
pub mod stats;
pub mod thread;

pub use crate::config::{BenchConfig, Invocation, Options, RunLimit};
pub use crate::coordinator::{run, RunOutcome};
