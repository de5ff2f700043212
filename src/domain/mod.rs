//! Polling, presence tracking and the host-facing actions built on top.

pub mod actions;
pub mod coordinator;
pub mod entities;
pub mod entry;
pub mod ledger;
pub mod ledger_store;
pub mod registry;
pub mod snapshot;
#[cfg(test)]
pub mod testing;
