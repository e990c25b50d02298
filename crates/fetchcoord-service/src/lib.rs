#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod coordinator;
pub mod decode;
pub mod error;
pub mod logging;
pub mod transport;
pub mod utils;
