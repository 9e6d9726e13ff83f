pub mod balances;
pub mod config;
pub mod desk;
pub mod domain;
pub mod error;
pub mod logger;
pub mod orchestrator;
pub mod pricing;
pub mod quotes;
pub mod rpc;
pub mod units;
pub mod wallet;

#[cfg(test)]
pub(crate) mod testing;

pub use desk::{DeskSnapshot, TradeDesk};
pub use domain::{Quote, TradeAction, TradeIntent};
pub use error::TradeError;
pub use orchestrator::TradeStatus;
