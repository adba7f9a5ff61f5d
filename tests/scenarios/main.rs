//! Scenario tests: whole runs through the engine with a scripted executor

mod helpers;

mod allow_failure;
mod artifacts;
mod cancellation;
mod concurrency_groups;
mod diamond;
mod ledger_stream;
mod retry;
mod triggers;
