//! Sharing one network call between concurrent requests for the same URL.
//!
//! The first caller for a URL creates a [`PendingUrlRequest`] and performs
//! the call under its [`CancellationContext`]; later callers only append a
//! callback. When the call completes every callback receives a copy of the
//! response. A caller that cancels gets the cancellation error, and the
//! network call itself is cancelled once no caller is left waiting for it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use geotile_core::{ApiError, ApiResponse, CancellationContext, Condition, DEFAULT_WAIT_TIMEOUT};

use crate::network::{HttpResponse, NetworkCallback};

/// Identifies one callback appended to a [`PendingUrlRequests`] map.
pub type CallbackId = u64;

/// One network call and the callbacks waiting for it.
pub struct PendingUrlRequest {
    callbacks: Mutex<Callbacks>,
    context: CancellationContext,
    condition: Condition,
}

#[derive(Default)]
struct Callbacks {
    waiting: BTreeMap<CallbackId, NetworkCallback>,
    cancelled: Vec<NetworkCallback>,
}

impl PendingUrlRequest {
    fn new() -> Self {
        Self {
            callbacks: Mutex::new(Callbacks::default()),
            context: CancellationContext::new(),
            condition: Condition::new(),
        }
    }

    /// Context the shared network call runs under.
    #[must_use]
    pub fn cancellation_context(&self) -> &CancellationContext {
        &self.context
    }

    /// Whether the network call was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.context.is_cancelled()
    }

    /// Number of callbacks still waiting for the response.
    #[must_use]
    pub fn callback_count(&self) -> usize {
        self.lock().waiting.len()
    }

    fn append(&self, id: CallbackId, callback: NetworkCallback) {
        self.lock().waiting.insert(id, callback);
    }

    /// Withdraw one callback, cancelling the network call if it was the last.
    ///
    /// The withdrawn callback receives the cancellation error once the call
    /// completes. False if `id` is not waiting on this request.
    fn cancel(&self, id: CallbackId) -> bool {
        let exhausted = {
            let mut callbacks = self.lock();
            let Some(callback) = callbacks.waiting.remove(&id) else {
                tracing::warn!(id, "cancel of unknown callback");
                return false;
            };
            callbacks.cancelled.push(callback);
            callbacks.waiting.is_empty()
        };

        if exhausted {
            tracing::debug!(id, "last callback cancelled, cancelling network call");
            self.context.cancel_operation();
        }
        true
    }

    /// Cancel the network call and wait up to `timeout` for it to complete.
    pub fn cancel_and_wait(&self, timeout: Duration) -> bool {
        self.context.cancel_operation();
        self.condition.wait(timeout)
    }

    /// Deliver `response` to every callback.
    ///
    /// Waiting callbacks get the response, or the cancellation error if the
    /// call was cancelled. Withdrawn callbacks always get the cancellation
    /// error.
    pub fn on_request_completed(&self, response: ApiResponse<HttpResponse>) {
        let Callbacks { waiting, cancelled } = std::mem::take(&mut *self.lock());
        tracing::debug!(
            callbacks = waiting.len(),
            cancelled = cancelled.len(),
            "shared request completed"
        );

        let response = if self.context.is_cancelled() {
            Err(ApiError::cancelled())
        } else {
            response
        };

        for callback in waiting.into_values() {
            callback(response.clone());
        }
        for callback in cancelled {
            callback(Err(ApiError::cancelled()));
        }

        self.condition.notify();
    }

    fn lock(&self) -> MutexGuard<'_, Callbacks> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// URL-keyed map of shared network calls.
///
/// Dropping the map cancels every call and waits for each up to
/// [`DEFAULT_WAIT_TIMEOUT`].
#[derive(Default)]
pub struct PendingUrlRequests {
    requests: Mutex<Requests>,
    next_callback: AtomicU64,
}

#[derive(Default)]
struct Requests {
    pending: HashMap<String, Arc<PendingUrlRequest>>,
    /// Cancelled calls whose network call is still running. A new call for
    /// the same URL starts a fresh entry in `pending`.
    cancelled: Vec<(String, Arc<PendingUrlRequest>)>,
}

/// Outcome of [`PendingUrlRequests::append`].
pub struct Appended {
    pub callback_id: CallbackId,
    pub request: Arc<PendingUrlRequest>,
    /// The callback created the request; its caller performs the network call.
    pub is_new: bool,
}

impl Requests {
    fn retire(&mut self, url: &str) {
        if let Some(request) = self.pending.remove(url) {
            self.cancelled.push((url.to_string(), request));
        }
    }
}

impl PendingUrlRequests {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked calls, cancelled ones still running included.
    #[must_use]
    pub fn size(&self) -> usize {
        let requests = self.lock();
        requests.pending.len() + requests.cancelled.len()
    }

    /// Attach `callback` to the call for `url`, creating the call if none is
    /// pending or the pending one was cancelled.
    pub fn append(&self, url: &str, callback: NetworkCallback) -> Appended {
        let callback_id = self.next_callback.fetch_add(1, Ordering::Relaxed) + 1;
        let mut requests = self.lock();
        if requests.pending.get(url).is_some_and(|request| request.is_cancelled()) {
            requests.retire(url);
        }

        let (request, is_new) = match requests.pending.get(url) {
            Some(request) => (Arc::clone(request), false),
            None => {
                let request = Arc::new(PendingUrlRequest::new());
                requests.pending.insert(url.to_string(), Arc::clone(&request));
                (request, true)
            }
        };
        request.append(callback_id, callback);
        Appended {
            callback_id,
            request,
            is_new,
        }
    }

    /// Withdraw one callback from the call for `url`.
    ///
    /// True if nothing is pending for `url`. False if the callback is not
    /// waiting on the pending call.
    pub fn cancel(&self, url: &str, callback_id: CallbackId) -> bool {
        let Some(request) = self.lock().pending.get(url).cloned() else {
            tracing::debug!(url, callback_id, "cancel, nothing pending");
            return true;
        };

        let cancelled = request.cancel(callback_id);
        if request.is_cancelled() {
            let mut requests = self.lock();
            let still_pending = requests
                .pending
                .get(url)
                .is_some_and(|entry| Arc::ptr_eq(entry, &request));
            if still_pending {
                requests.retire(url);
            }
        }
        cancelled
    }

    /// Cancel every pending network call without waiting.
    pub fn cancel_all(&self) -> bool {
        let pending: Vec<_> = self.lock().pending.values().cloned().collect();
        for request in pending {
            request.context.cancel_operation();
        }
        true
    }

    /// Cancel every call and wait up to [`DEFAULT_WAIT_TIMEOUT`] for each.
    pub fn cancel_all_and_wait(&self) -> bool {
        self.cancel_all_and_wait_for(DEFAULT_WAIT_TIMEOUT)
    }

    /// Cancel every call and wait up to `timeout` for each to complete.
    ///
    /// The entries stay in the map until their call completes. Returns false
    /// if any wait timed out.
    pub fn cancel_all_and_wait_for(&self, timeout: Duration) -> bool {
        let requests: Vec<_> = {
            let requests = self.lock();
            requests
                .pending
                .iter()
                .chain(requests.cancelled.iter().map(|(url, request)| (url, request)))
                .map(|(url, request)| (url.clone(), Arc::clone(request)))
                .collect()
        };

        let mut all_completed = true;
        for (url, request) in requests {
            if !request.cancel_and_wait(timeout) {
                tracing::warn!(url = %url, ?timeout, "shared request did not finish after cancel");
                all_completed = false;
            }
        }
        all_completed
    }

    /// Remove `request` from the map and deliver `response` to its callbacks.
    ///
    /// Nothing is delivered if `request` is no longer tracked under `url`.
    pub fn on_request_completed(
        &self,
        url: &str,
        request: &Arc<PendingUrlRequest>,
        response: ApiResponse<HttpResponse>,
    ) {
        let removed = {
            let mut requests = self.lock();
            if requests
                .pending
                .get(url)
                .is_some_and(|entry| Arc::ptr_eq(entry, request))
            {
                requests.pending.remove(url);
                true
            } else if let Some(index) = requests
                .cancelled
                .iter()
                .position(|(_, entry)| Arc::ptr_eq(entry, request))
            {
                requests.cancelled.swap_remove(index);
                true
            } else {
                false
            }
        };

        if removed {
            request.on_request_completed(response);
        } else {
            tracing::debug!(url, "completed request is not tracked");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Requests> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PendingUrlRequests {
    fn drop(&mut self) {
        self.cancel_all_and_wait();
    }
}
