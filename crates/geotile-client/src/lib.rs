//! Authenticated, retrying HTTP client for the geotile platform.
//!
//! Requests are sent through a pluggable [`Network`]; [`ReqwestNetwork`] is
//! the default on native targets. Blocking calls retry with backdown and stop
//! early when their [`CancellationContext`](geotile_core::CancellationContext)
//! is cancelled. Asynchronous calls run on the configured
//! [`TaskScheduler`](geotile_core::thread::TaskScheduler) and are tracked
//! until they complete, so dropping the client cancels whatever is in flight.
//! Shared calls merge concurrent `GET`s for the same URL into one network
//! call through [`PendingUrlRequests`].

mod client;
pub mod network;
mod pending_url_requests;
mod settings;

pub use client::{ApiClient, ApiRequest};
#[cfg(not(target_family = "wasm"))]
pub use network::ReqwestNetwork;
pub use network::{HttpResponse, Method, Network, NetworkCallback, NetworkRequest, RequestId};
pub use pending_url_requests::{Appended, CallbackId, PendingUrlRequest, PendingUrlRequests};
pub use settings::{
    AuthenticationSettings, ClientSettings, RetryCondition, RetryConfig, RetrySettings,
    TokenProvider, default_retry_condition,
};
