pub mod affinity;
pub mod bootstrap;
pub mod breaker;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod headers;
pub mod keystore;
pub mod pricing;
pub mod quota;
pub mod router;
pub mod state;
pub mod upstream_client;
pub mod upstreams;

pub use engine::{GatewayBody, GatewayResponse, ProxyCall, ProxyEngine};
pub use error::{ErrorKind, GatewayError};
pub use state::AppState;
