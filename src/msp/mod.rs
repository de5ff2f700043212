//! Firewalla MSP API: transport, canonical records and endpoint fetchers.

pub mod error;
pub mod fetch;
pub mod gateway;
pub mod records;
#[cfg(test)]
pub mod testing;
