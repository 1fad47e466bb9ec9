//! The `ProviderAdapter` contract (§4.6) plus a reference `EchoProvider`
//! used by tests and as a safe default configuration.

pub mod contract;
pub mod echo;

pub use contract::{
    AdapterCapabilities, OpenedSession, ProviderAdapter, ProviderError, ProviderErrorKind, ProviderEvent,
};
pub use echo::EchoProvider;
