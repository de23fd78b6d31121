pub mod cache;
pub mod config;
pub mod credential;
pub mod error;
pub mod models;
pub mod preprocess;
pub mod protocol;
pub mod proxy;
pub mod rate_limit;
pub mod router;
pub mod server;
pub mod stream;
pub mod telemetry;
pub mod translate;

pub use error::{Error, Result};
