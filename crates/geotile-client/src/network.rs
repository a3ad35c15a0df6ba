//! The transport the client sends requests through.
//!
//! [`Network`] is callback based: `send` returns as soon as the request is
//! queued and the callback fires once with the outcome. [`ReqwestNetwork`] is
//! the default implementation on native targets.

use std::fmt;
use std::time::Duration;

use geotile_core::ApiResponse;
#[cfg(not(target_family = "wasm"))]
use geotile_core::{ApiError, ErrorCode};

/// Identifier of an in-flight request, issued by [`Network::send`].
pub type RequestId = u64;

/// Receives the outcome of one request.
pub type NetworkCallback = Box<dyn FnOnce(ApiResponse<HttpResponse>) + Send + 'static>;

/// Default transfer timeout of a request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Head,
}

impl Method {
    /// The method name as sent on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully resolved request handed to a [`Network`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRequest {
    url: String,
    method: Method,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    timeout: Duration,
}

impl NetworkRequest {
    /// A `GET` request for `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::Get,
            headers: Vec::new(),
            body: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Append a header. Repeated names are sent repeatedly.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Limit the time the whole transfer may take.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn method(&self) -> Method {
        self.method
    }

    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Value of the first header called `name`, compared case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    #[must_use]
    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Status, headers and body of a completed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// A response with no headers.
    #[must_use]
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Whether the status is below 400.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status < 400
    }

    /// The body decoded as UTF-8, with invalid sequences replaced.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends requests and reports their outcome through a callback.
///
/// The callback passed to [`send`](Self::send) fires exactly once, unless
/// `send` itself returns an error, in which case it never fires. After
/// [`cancel`](Self::cancel) the callback receives a cancellation error if
/// the request had not completed yet.
pub trait Network: Send + Sync {
    fn send(&self, request: NetworkRequest, callback: NetworkCallback) -> ApiResponse<RequestId>;

    /// Abort a request. Unknown or completed ids are ignored.
    fn cancel(&self, id: RequestId);
}

#[cfg(not(target_family = "wasm"))]
pub use native::ReqwestNetwork;

#[cfg(not(target_family = "wasm"))]
mod native {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

    use super::{
        ApiError, ApiResponse, ErrorCode, HttpResponse, Method, Network, NetworkCallback,
        NetworkRequest, RequestId,
    };

    type CallbackSlot = Arc<Mutex<Option<NetworkCallback>>>;

    struct InFlight {
        abort: tokio::task::AbortHandle,
        callback: CallbackSlot,
    }

    /// [`Network`] backed by `reqwest` on an owned tokio runtime.
    ///
    /// Dropping it aborts every in-flight request; their callbacks receive a
    /// cancellation error.
    pub struct ReqwestNetwork {
        http: reqwest::Client,
        runtime: Option<tokio::runtime::Runtime>,
        next_id: AtomicU64,
        in_flight: Arc<Mutex<HashMap<RequestId, InFlight>>>,
    }

    impl ReqwestNetwork {
        /// Create a network with a default `reqwest` client.
        pub fn new() -> ApiResponse<Self> {
            let http = reqwest::Client::builder().build().map_err(|e| {
                ApiError::new(
                    ErrorCode::InternalFailure,
                    format!("failed to build http client: {e}"),
                )
            })?;
            Self::with_http(http)
        }

        /// Create a network around an existing `reqwest` client.
        pub fn with_http(http: reqwest::Client) -> ApiResponse<Self> {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .thread_name("geotile-network")
                .enable_all()
                .build()
                .map_err(|e| {
                    ApiError::new(
                        ErrorCode::InternalFailure,
                        format!("failed to start network runtime: {e}"),
                    )
                })?;

            Ok(Self {
                http,
                runtime: Some(runtime),
                next_id: AtomicU64::new(1),
                in_flight: Arc::default(),
            })
        }

        /// Number of requests that have not completed yet.
        #[must_use]
        pub fn in_flight_count(&self) -> usize {
            lock(&self.in_flight).len()
        }
    }

    impl Network for ReqwestNetwork {
        fn send(&self, request: NetworkRequest, callback: NetworkCallback) -> ApiResponse<RequestId> {
            let Some(runtime) = &self.runtime else {
                return Err(ApiError::new(
                    ErrorCode::ServiceUnavailable,
                    "network is shut down",
                ));
            };

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let slot: CallbackSlot = Arc::new(Mutex::new(Some(callback)));
            let http = self.http.clone();
            let in_flight = Arc::clone(&self.in_flight);
            let task_slot = Arc::clone(&slot);

            tracing::debug!(id, url = request.url(), method = %request.method(), "sending request");

            // Registered under the lock so the task cannot finish unregistered.
            let mut registry = lock(&self.in_flight);
            let handle = runtime.spawn(async move {
                let response = perform(&http, request).await;
                lock(&in_flight).remove(&id);
                if let Some(callback) = take(&task_slot) {
                    callback(response);
                }
            });
            registry.insert(
                id,
                InFlight {
                    abort: handle.abort_handle(),
                    callback: slot,
                },
            );
            Ok(id)
        }

        fn cancel(&self, id: RequestId) {
            let Some(entry) = lock(&self.in_flight).remove(&id) else {
                return;
            };
            tracing::debug!(id, "cancelling request");
            entry.abort.abort();
            if let Some(callback) = take(&entry.callback) {
                callback(Err(ApiError::cancelled()));
            }
        }
    }

    impl Drop for ReqwestNetwork {
        fn drop(&mut self) {
            let entries: Vec<InFlight> = lock(&self.in_flight).drain().map(|(_, entry)| entry).collect();
            for entry in entries {
                entry.abort.abort();
                if let Some(callback) = take(&entry.callback) {
                    callback(Err(ApiError::cancelled()));
                }
            }
            // May run on a runtime thread when a callback owns the last handle.
            if let Some(runtime) = self.runtime.take() {
                runtime.shutdown_background();
            }
        }
    }

    async fn perform(http: &reqwest::Client, request: NetworkRequest) -> ApiResponse<HttpResponse> {
        let method = match request.method() {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
            Method::Head => reqwest::Method::HEAD,
        };

        let mut builder = http.request(method, request.url()).timeout(request.timeout());
        for (name, value) in request.headers() {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body() {
            builder = builder.body(body.to_vec());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| transport_error(request.url(), &e))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_owned(), value.to_owned()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(request.url(), &e))?
            .to_vec();

        tracing::debug!(url = request.url(), status, "request completed");
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    fn transport_error(url: &str, error: &reqwest::Error) -> ApiError {
        let code = if error.is_timeout() {
            ErrorCode::RequestTimeout
        } else if error.is_connect() {
            ErrorCode::NetworkConnection
        } else {
            ErrorCode::Unknown
        };
        ApiError::new(code, format!("http request to {url} failed: {error}"))
    }

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take(slot: &CallbackSlot) -> Option<NetworkCallback> {
        lock(slot).take()
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = NetworkRequest::new("https://example.com/tiles")
            .with_method(Method::Post)
            .with_header("Content-Type", "application/json")
            .with_body(b"{}".to_vec())
            .with_timeout(Duration::from_secs(5));

        assert_eq!(request.url(), "https://example.com/tiles");
        assert_eq!(request.method(), Method::Post);
        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(request.header("accept"), None);
        assert_eq!(request.body(), Some(&b"{}"[..]));
        assert_eq!(request.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_request_defaults() {
        let request = NetworkRequest::new("https://example.com");
        assert_eq!(request.method(), Method::Get);
        assert!(request.headers().is_empty());
        assert_eq!(request.body(), None);
        assert_eq!(request.timeout(), DEFAULT_REQUEST_TIMEOUT);
    }

    #[test]
    fn test_response_success() {
        assert!(HttpResponse::new(200, "ok").is_success());
        assert!(HttpResponse::new(304, Vec::new()).is_success());
        assert!(!HttpResponse::new(404, "missing").is_success());
        assert_eq!(HttpResponse::new(200, "ok").text(), "ok");
    }

    #[test]
    fn test_method_names() {
        assert_eq!(Method::Get.to_string(), "GET");
        assert_eq!(Method::Delete.as_str(), "DELETE");
    }
}
