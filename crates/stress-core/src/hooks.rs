//! User-injectable lifecycle hooks.
//!
//! A step may carry a [`RequestHook`] that runs right before the request is
//! sent and a [`ResponseHook`] that runs once the response has been read.
//! Both receive the iteration's [`Share`], which is how one step passes data
//! to the next. Closures with the matching signature implement the traits.
//!
//! Hooks are plain synchronous calls and may block. On a multi-threaded
//! runtime the step runs them under `block_in_place`.

use bytes::Bytes;
use http::header::IntoHeaderName;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Version};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::result::TransactionResult;
use crate::share::Share;

/// The cloned outgoing request of one step, open for rewriting by a hook.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Bytes,
    worker: usize,
    iteration: usize,
}

impl RequestHandle {
    pub(crate) fn new(
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: Bytes,
        worker: usize,
        iteration: usize,
    ) -> Self {
        Self {
            method,
            url,
            headers,
            body,
            worker,
            iteration,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Replaces every value of `name`.
    pub fn set_header<K: IntoHeaderName>(&mut self, name: K, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    /// Appends a value, keeping existing ones.
    pub fn add_header<K: IntoHeaderName>(&mut self, name: K, value: HeaderValue) {
        self.headers.append(name, value);
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    /// Number of the worker executing this iteration.
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Index of this iteration within its worker.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub(crate) fn into_parts(self) -> (Method, Url, HeaderMap, Bytes) {
        (self.method, self.url, self.headers, self.body)
    }
}

/// A fully read response, handed read-only to [`ResponseHook`]s.
#[derive(Debug, Clone)]
pub struct ResponseHandle {
    pub(crate) url: Url,
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
}

impl ResponseHandle {
    /// Final URL, after any followed redirects.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Value of the `Content-Length` header, or the number of body bytes read.
    pub fn content_length(&self) -> u64 {
        self.headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.body.len() as u64)
    }
}

/// Runs before a step's request is sent; may rewrite method, headers and body.
pub trait RequestHook: Send + Sync {
    fn before_request(&self, request: &mut RequestHandle, share: &mut Share);
}

/// Runs after a step's response has been read.
pub trait ResponseHook: Send + Sync {
    fn after_response(&self, response: &ResponseHandle, share: &mut Share);
}

impl<F> RequestHook for F
where
    F: Fn(&mut RequestHandle, &mut Share) + Send + Sync,
{
    fn before_request(&self, request: &mut RequestHandle, share: &mut Share) {
        self(request, share)
    }
}

impl<F> ResponseHook for F
where
    F: Fn(&ResponseHandle, &mut Share) + Send + Sync,
{
    fn after_response(&self, response: &ResponseHandle, share: &mut Share) {
        self(response, share)
    }
}

/// The hook used when a step has none.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHook;

impl RequestHook for NoHook {
    fn before_request(&self, _request: &mut RequestHandle, _share: &mut Share) {}
}

impl ResponseHook for NoHook {
    fn after_response(&self, _response: &ResponseHandle, _share: &mut Share) {}
}

/// The pair of lifecycle hooks of a step.
#[derive(Clone)]
pub struct Hooks {
    before: Arc<dyn RequestHook>,
    after: Arc<dyn ResponseHook>,
    has_before: bool,
    has_after: bool,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before_request(mut self, hook: impl RequestHook + 'static) -> Self {
        self.before = Arc::new(hook);
        self.has_before = true;
        self
    }

    pub fn after_response(mut self, hook: impl ResponseHook + 'static) -> Self {
        self.after = Arc::new(hook);
        self.has_after = true;
        self
    }

    pub fn has_before(&self) -> bool {
        self.has_before
    }

    pub fn has_after(&self) -> bool {
        self.has_after
    }

    pub(crate) fn run_before(&self, request: &mut RequestHandle, share: &mut Share) {
        self.before.before_request(request, share)
    }

    pub(crate) fn run_after(&self, response: &ResponseHandle, share: &mut Share) {
        self.after.after_response(response, share)
    }
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            before: Arc::new(NoHook),
            after: Arc::new(NoHook),
            has_before: false,
            has_after: false,
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("before_request", &self.has_before)
            .field("after_response", &self.has_after)
            .finish()
    }
}

/// Takes over result rendering when supplied to a task.
pub trait ReportHandler: Send + Sync {
    fn handle(&self, results: &[TransactionResult], elapsed: Duration);
}

impl<F> ReportHandler for F
where
    F: Fn(&[TransactionResult], Duration) + Send + Sync,
{
    fn handle(&self, results: &[TransactionResult], elapsed: Duration) {
        self(results, elapsed)
    }
}
