//! MetaTrader 5 terminal adapter.
//!
//! Communicates with MT5 through a socket bridge (an MQL5 EA or Python
//! script running next to the terminal) using length-prefixed JSON.

pub mod client;
pub mod protocol;

pub use client::{MetaTraderConfig, MetaTraderTerminal};
