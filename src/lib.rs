// ABOUTME: Root library module for the spool binary
// ABOUTME: Re-exports the delivery core and adds the CLI, logging setup, and process wiring

pub mod cli;
pub mod logging;
pub mod runtime;

pub use spool_core::{
    agent, bus, config, conversation, db, event, ledger, metrics, paths, queue, rate_limit,
    router, scheduler, serial, tasks, time,
};
