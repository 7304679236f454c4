//! External market-data acquisition.

pub mod binance;
