//! HTTP client for platform APIs.
//!
//! The client resolves [`ApiRequest`]s against a base URL, authenticates them
//! and sends them through the configured [`Network`], retrying failed
//! attempts according to [`RetrySettings`](crate::RetrySettings).

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::time::Duration;

use geotile_core::thread::execute_or_schedule;
use geotile_core::{
    ApiError, ApiResponse, CancellationContext, CancellationToken, Condition, ErrorCode,
    PendingRequests, TaskContext,
};

use crate::network::{HttpResponse, Method, Network, NetworkCallback, NetworkRequest};
use crate::pending_url_requests::PendingUrlRequests;
use crate::settings::ClientSettings;

const USER_AGENT: &str = concat!("geotile-client/", env!("CARGO_PKG_VERSION"));

/// A request relative to the client's base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    path: String,
    method: Method,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
}

impl ApiRequest {
    /// A `GET` request for `path`.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: Method::Get,
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    #[must_use]
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Append a query parameter. Names and values are percent-encoded.
    #[must_use]
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

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

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Client for one platform service.
///
/// Every asynchronous call is tracked until it completes. Dropping the client
/// cancels the calls still in flight; their callbacks receive a cancellation
/// error.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use geotile_client::{ApiClient, ApiRequest, ClientSettings, ReqwestNetwork};
/// use geotile_core::CancellationContext;
///
/// let network = Arc::new(ReqwestNetwork::new()?);
/// let client = ApiClient::new("https://tiles.example.com/v1", ClientSettings::new(network));
///
/// let request = ApiRequest::new("/tiles/12/2200/1343").with_query("format", "png");
/// let response = client.call_api(&request, &CancellationContext::new())?;
/// println!("{} bytes", response.body.len());
/// # Ok::<(), geotile_core::ApiError>(())
/// ```
pub struct ApiClient {
    inner: Arc<ClientInner>,
    pending: Arc<PendingRequests>,
    pending_urls: Arc<PendingUrlRequests>,
}

#[derive(Clone)]
struct ClientInner {
    base_url: String,
    default_headers: Vec<(String, String)>,
    settings: ClientSettings,
}

impl ApiClient {
    /// Create a client for the service at `base_url`.
    pub fn new(base_url: impl Into<String>, settings: ClientSettings) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                base_url: base_url.into(),
                default_headers: Vec::new(),
                settings,
            }),
            pending: Arc::new(PendingRequests::new()),
            pending_urls: Arc::new(PendingUrlRequests::new()),
        }
    }

    /// Send `name: value` with every request.
    #[must_use]
    pub fn with_default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.inner)
            .default_headers
            .push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    #[must_use]
    pub fn settings(&self) -> &ClientSettings {
        &self.inner.settings
    }

    /// Send `request` and block until it succeeds, fails for good, or
    /// `context` is cancelled.
    ///
    /// Responses with a status of 400 or above are returned as errors
    /// carrying the status.
    pub fn call_api(
        &self,
        request: &ApiRequest,
        context: &CancellationContext,
    ) -> ApiResponse<HttpResponse> {
        self.inner.call_api(request, context)
    }

    /// Send `request` on the configured scheduler and deliver the outcome to
    /// `callback`.
    ///
    /// Without a scheduler the call runs on the calling thread before this
    /// returns. The returned token cancels the call.
    pub fn call_api_async<F>(&self, request: ApiRequest, callback: F) -> CancellationToken
    where
        F: FnOnce(ApiResponse<HttpResponse>) + Send + 'static,
    {
        let key = self.pending.generate_request_placeholder();
        let inner = Arc::clone(&self.inner);
        let pending: Weak<PendingRequests> = Arc::downgrade(&self.pending);

        let task = TaskContext::new(
            move |context: CancellationContext| inner.call_api(&request, &context),
            move |response: ApiResponse<HttpResponse>| {
                if let Some(pending) = pending.upgrade() {
                    pending.remove(key);
                }
                callback(response);
            },
        );

        if !self.pending.insert_task(task.clone(), key) {
            tracing::debug!(key, "client is shutting down, not starting request");
            task.cancel_token().cancel();
            task.execute();
            return task.cancel_token();
        }

        let runner = task.clone();
        execute_or_schedule(self.inner.settings.scheduler.as_deref(), move || {
            runner.execute();
        });
        task.cancel_token()
    }

    /// Like [`call_api_async`](Self::call_api_async), but concurrent `GET`
    /// calls for the same URL share one network call.
    ///
    /// Every caller receives a copy of the response. The returned token
    /// withdraws only this caller, who then receives a cancellation error;
    /// the network call is cancelled once every caller has withdrawn. Calls
    /// with another method or with a body are not shared.
    pub fn call_api_shared<F>(&self, request: ApiRequest, callback: F) -> CancellationToken
    where
        F: FnOnce(ApiResponse<HttpResponse>) + Send + 'static,
    {
        if request.method != Method::Get || request.body.is_some() {
            return self.call_api_async(request, callback);
        }

        let url = self.inner.url(&request);
        let appended = self.pending_urls.append(&url, Box::new(callback));
        let callback_id = appended.callback_id;
        let pending_urls: Weak<PendingUrlRequests> = Arc::downgrade(&self.pending_urls);

        if appended.is_new {
            let inner = Arc::clone(&self.inner);
            let pending_urls = Weak::clone(&pending_urls);
            let url = url.clone();
            let shared = appended.request;
            execute_or_schedule(self.inner.settings.scheduler.as_deref(), move || {
                let response = inner.call_api(&request, shared.cancellation_context());
                match pending_urls.upgrade() {
                    Some(pending_urls) => pending_urls.on_request_completed(&url, &shared, response),
                    None => shared.on_request_completed(response),
                }
            });
        } else {
            tracing::debug!(url = %url, callback_id, "joined pending request");
        }

        CancellationToken::new(move || {
            if let Some(pending_urls) = pending_urls.upgrade() {
                pending_urls.cancel(&url, callback_id);
            }
        })
    }

    /// Cancel every asynchronous call in flight without waiting for them.
    pub fn cancel_pending_requests(&self) -> bool {
        let tasks = self.pending.cancel_all();
        let shared = self.pending_urls.cancel_all();
        tasks && shared
    }

    /// Number of asynchronous calls that have not completed.
    #[must_use]
    pub fn pending_request_count(&self) -> usize {
        self.pending.task_count()
    }

    /// Number of shared network calls that have not completed.
    #[must_use]
    pub fn shared_request_count(&self) -> usize {
        self.pending_urls.size()
    }
}

impl Drop for ApiClient {
    fn drop(&mut self) {
        self.pending.cancel_all();
        self.pending_urls.cancel_all();
    }
}

impl ClientInner {
    fn call_api(
        &self,
        request: &ApiRequest,
        context: &CancellationContext,
    ) -> ApiResponse<HttpResponse> {
        if context.is_cancelled() {
            return Err(ApiError::cancelled());
        }

        let network_request = self.build_request(request)?;
        let retry = &self.settings.retry_settings;
        let max_wait = retry.timeout;
        let mut backdown = retry.initial_backdown_period;
        let mut waited = Duration::ZERO;
        let mut retries = 0;

        let mut response = self.send_once(&network_request, context);
        while retries < retry.max_attempts && waited < max_wait {
            if context.is_cancelled() {
                return Err(ApiError::cancelled());
            }
            let wait = backdown.min(max_wait - waited);
            match &response {
                Ok(_) => break,
                Err(error) if error.is_cancelled() || !(retry.retry_condition)(error) => break,
                Err(error) => tracing::debug!(
                    url = network_request.url(),
                    retry = retries + 1,
                    wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                    %error,
                    "retrying request"
                ),
            }

            waited += wait;
            if !wait_for_retry(context, wait) {
                return Err(ApiError::cancelled());
            }

            retries += 1;
            backdown = retry
                .backdown_strategy
                .wait_time(retry.initial_backdown_period, retries);
            response = self.send_once(&network_request, context);
        }

        if response.is_err() && context.is_cancelled() {
            return Err(ApiError::cancelled());
        }
        response
    }

    fn url(&self, request: &ApiRequest) -> String {
        let mut url = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            request.path.trim_start_matches('/')
        );
        for (index, (name, value)) in request.query.iter().enumerate() {
            url.push(if index == 0 { '?' } else { '&' });
            url.push_str(&urlencoding::encode(name));
            url.push('=');
            url.push_str(&urlencoding::encode(value));
        }
        url
    }

    fn build_request(&self, request: &ApiRequest) -> ApiResponse<NetworkRequest> {
        let mut network_request = NetworkRequest::new(self.url(request))
            .with_method(request.method)
            .with_timeout(self.settings.retry_settings.timeout);
        for (name, value) in self.default_headers.iter().chain(&request.headers) {
            network_request = network_request.with_header(name.as_str(), value.as_str());
        }
        if network_request.header("user-agent").is_none() {
            network_request = network_request.with_header("User-Agent", USER_AGENT);
        }
        if let Some(authentication) = &self.settings.authentication {
            let token = authentication.token()?;
            network_request = network_request.with_header("Authorization", format!("Bearer {token}"));
        }
        if let Some(body) = &request.body {
            network_request = network_request.with_body(body.clone());
        }
        Ok(network_request)
    }

    /// One attempt, bounded by the request timeout.
    fn send_once(
        &self,
        request: &NetworkRequest,
        context: &CancellationContext,
    ) -> ApiResponse<HttpResponse> {
        let network = &self.settings.network;
        let (sender, receiver) = mpsc::channel();
        let mut sent = None;

        let started = context.execute_or_cancelled(
            || {
                let cancel_sender = sender.clone();
                let callback: NetworkCallback = Box::new(move |response| {
                    let _ = sender.send(response);
                });
                match network.send(request.clone(), callback) {
                    Ok(id) => {
                        sent = Some(Ok(id));
                        let network = Arc::clone(network);
                        CancellationToken::new(move || {
                            network.cancel(id);
                            let _ = cancel_sender.send(Err(ApiError::cancelled()));
                        })
                    }
                    Err(error) => {
                        sent = Some(Err(error));
                        CancellationToken::default()
                    }
                }
            },
            || {},
        );
        if !started {
            return Err(ApiError::cancelled());
        }

        let id = match sent {
            Some(Ok(id)) => id,
            Some(Err(error)) => {
                context.release_token();
                return Err(error);
            }
            None => return Err(ApiError::cancelled()),
        };

        let outcome = receiver.recv_timeout(request.timeout());
        context.release_token();
        let response = match outcome {
            Ok(response) => response,
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(url = request.url(), id, "request timed out");
                network.cancel(id);
                return Err(ApiError::timeout());
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(ApiError::new(
                    ErrorCode::Unknown,
                    "network dropped the request callback",
                ));
            }
        };

        if context.is_cancelled() {
            return Err(ApiError::cancelled());
        }
        let response = response?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(ApiError::from_http_status(response.status, response.text()))
        }
    }
}

/// Sleep for `wait`, waking early on cancellation. False if cancelled.
fn wait_for_retry(context: &CancellationContext, wait: Duration) -> bool {
    let condition = Arc::new(Condition::new());
    let notifier = Arc::clone(&condition);
    let waiting = context.execute_or_cancelled(
        move || CancellationToken::new(move || notifier.notify()),
        || {},
    );
    if !waiting {
        return false;
    }

    condition.wait(wait);
    context.release_token();
    !context.is_cancelled()
}
