pub mod config;
pub mod driver;
pub mod error;
pub mod event;
pub mod frame;
pub mod http_client;
pub mod merger;
pub mod model;
pub mod normalizer;
pub mod provider_factory;
pub mod providers;
pub mod stream;
pub mod telemetry;
pub mod transport;

pub use driver::StreamDriver;
pub use error::{CoreResult, StreamError};
pub use model::{AccumulatedMessage, Delta};
