//! Declarative provisioning of OnWatch appliances.
//!
//! A YAML config is loaded and validated (`config`), then `stages::run`
//! walks the fixed stage sequence over an authenticated `api::Gateway`,
//! reconciling each declared entity against what the appliance already
//! holds and recording the outcome in a `ledger::RunLedger` that is
//! exported as YAML at the end of the run.
pub mod api;
pub mod cli;
pub mod config;
pub mod ledger;
pub mod poll;
pub mod rancher;
pub mod reconcile;
pub mod remote;
pub mod stages;
pub mod util;
pub mod verify;
pub mod workflow;

#[cfg(test)]
mod testing;
