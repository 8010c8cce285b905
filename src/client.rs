//! Client facade: the public submission surface bound to one origin.
//!
//! [`HttpClient`] accepts requests from any thread, queues them, and wakes
//! the dispatcher on the event-loop thread. Submission methods return `true`
//! when the request was accepted — a promise that its callbacks will fire
//! exactly once — and `false` when a bounded queue is full, in which case
//! nothing was consumed and no callback will ever fire.
//!
//! # Example
//!
//! ```ignore
//! let mut el = EventLoop::new()?;
//! let client = HttpClient::new(&el.handle(), "http://127.0.0.1:8080",
//!                              HttpClientConfig::default())?;
//! let handle = el.handle();
//! let cbs = Arc::new(SimpleCallbacks::new(move |_req, outcome, status, _headers, body| {
//!     println!("{outcome}: {status} ({} bytes)", body.len());
//!     handle.stop();
//! }));
//! client.get("/coucou", cbs, RequestOpts::default());
//! el.run()?;
//! ```

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::dispatcher::Dispatcher;
use crate::event_loop::{DriverId, LoopHandle};
use crate::outcome::Outcome;
use crate::queue::PendingQueue;
use crate::request::{Content, Method, Request, RequestOpts};

/// Errors raised when constructing a client.
#[derive(Debug)]
pub enum ClientError {
    /// The base URL could not be parsed or uses an unsupported scheme.
    InvalidUrl(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUrl(url) => write!(f, "invalid URL: {url}"),
        }
    }
}

impl std::error::Error for ClientError {}

/// Completion notifications for submitted requests.
///
/// Implementations are invoked exactly once per accepted request, on the
/// event-loop thread, after the connection has committed its post-finish
/// state. The callback must not block; it may submit further requests to
/// the same facade (typically captured behind an `Arc<HttpClient>`).
pub trait Callbacks: Send + Sync {
    /// Delivers the terminal result of one request.
    ///
    /// `status` is `0` for every outcome other than [`Outcome::None`].
    /// `headers` is the raw response head block; `body` is owned by the
    /// callee — the connection retains no reference to either.
    fn on_response(
        &self,
        request: &Request,
        outcome: Outcome,
        status: u16,
        headers: String,
        body: Vec<u8>,
    );
}

/// Adapts a closure into [`Callbacks`].
pub struct SimpleCallbacks<F> {
    on_response: F,
}

impl<F> SimpleCallbacks<F>
where
    F: Fn(&Request, Outcome, u16, String, Vec<u8>) + Send + Sync,
{
    /// Wraps the closure.
    pub fn new(on_response: F) -> Self {
        Self { on_response }
    }
}

impl<F> Callbacks for SimpleCallbacks<F>
where
    F: Fn(&Request, Outcome, u16, String, Vec<u8>) + Send + Sync,
{
    fn on_response(
        &self,
        request: &Request,
        outcome: Outcome,
        status: u16,
        headers: String,
        body: Vec<u8>,
    ) {
        (self.on_response)(request, outcome, status, headers, body);
    }
}

/// A request bound to its callbacks while queued or in flight.
pub(crate) struct RequestHandle {
    pub(crate) request: Request,
    pub(crate) callbacks: Arc<dyn Callbacks>,
    pub(crate) submitted_at: Instant,
}

/// The origin a client is bound to.
#[derive(Debug)]
pub(crate) struct Origin {
    pub(crate) host: String,
    pub(crate) port: u16,
    authority: String,
}

impl Origin {
    /// Parses `http://host[:port]`; a trailing path is tolerated and
    /// ignored. Only the `http` scheme is supported — TLS wrapping is an
    /// external concern.
    fn parse(base_url: &str) -> Result<Self, ClientError> {
        let rest = base_url.strip_prefix("http://").ok_or_else(|| {
            ClientError::InvalidUrl(format!("unsupported scheme in: {base_url}"))
        })?;
        let authority = rest.split('/').next().unwrap_or("");

        let (host, port) = if let Some(i) = authority.rfind(':') {
            let port_str = &authority[i + 1..];
            let port: u16 = port_str.parse().map_err(|_| {
                ClientError::InvalidUrl(format!("invalid port: {port_str}"))
            })?;
            (authority[..i].to_owned(), port)
        } else {
            (authority.to_owned(), 80)
        };

        if host.is_empty() {
            return Err(ClientError::InvalidUrl("empty host".into()));
        }

        let authority = if port == 80 {
            host.clone()
        } else {
            format!("{host}:{port}")
        };
        Ok(Self {
            host,
            port,
            authority,
        })
    }

    /// Value of the `Host` header: `host`, or `host:port` for a
    /// non-default port.
    pub(crate) fn authority(&self) -> &str {
        &self.authority
    }
}

/// Configuration for a client facade.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Number of connections in the pool. Bounds concurrency against the
    /// origin.
    pub pool_size: usize,
    /// Maximum pending requests; zero means unbounded.
    pub queue_capacity: usize,
    /// Enables per-facade developer diagnostics from the start.
    pub debug: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            queue_capacity: 0,
            debug: false,
        }
    }
}

impl HttpClientConfig {
    /// Sets the connection pool size.
    #[must_use]
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Sets the pending-queue capacity; zero means unbounded.
    #[must_use]
    pub fn queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// Enables developer diagnostics from construction.
    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

/// State shared between the facade (any thread) and the dispatcher (loop
/// thread). The pending queue is the only cross-thread mutable structure.
pub(crate) struct ClientShared {
    pub(crate) queue: PendingQueue<RequestHandle>,
    driver: Mutex<Option<DriverId>>,
    debug: Arc<AtomicBool>,
}

impl ClientShared {
    fn new(queue_capacity: usize, debug: bool) -> Self {
        Self {
            queue: PendingQueue::new(queue_capacity),
            driver: Mutex::new(None),
            debug: Arc::new(AtomicBool::new(debug)),
        }
    }

    pub(crate) fn set_driver(&self, id: DriverId) {
        *self.driver.lock() = Some(id);
    }

    fn driver(&self) -> Option<DriverId> {
        *self.driver.lock()
    }

    pub(crate) fn debug_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.debug)
    }

    pub(crate) fn debug_enabled(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }
}

/// Asynchronous HTTP/1.1 client bound to a single origin.
///
/// Owns a fixed-size pool of persistent connections living inside the event
/// loop. The facade may be moved between owners while the loop is not
/// advancing; it is deliberately not `Clone`. Dropping the facade makes
/// further submissions impossible and retires the pool once all queued and
/// in-flight requests have completed — their callbacks still fire.
pub struct HttpClient {
    handle: LoopHandle,
    shared: Arc<ClientShared>,
}

impl HttpClient {
    /// Creates a client for the given `http://host[:port]` base URL and
    /// installs its connection pool into the event loop.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidUrl`] when the base URL cannot be
    /// parsed or does not use the `http` scheme.
    pub fn new(
        handle: &LoopHandle,
        base_url: &str,
        config: HttpClientConfig,
    ) -> Result<Self, ClientError> {
        let origin = Arc::new(Origin::parse(base_url)?);
        let shared = Arc::new(ClientShared::new(config.queue_capacity, config.debug));

        let dispatcher = Dispatcher::new(Arc::clone(&shared), origin, config.pool_size);
        let install_shared = Arc::clone(&shared);
        handle.post(move |core| {
            let id = core.install(Box::new(dispatcher));
            install_shared.set_driver(id);
        });

        Ok(Self {
            handle: handle.clone(),
            shared,
        })
    }

    /// Toggles per-facade developer diagnostics.
    pub fn enable_debug(&self, enabled: bool) {
        self.shared.debug.store(enabled, Ordering::Relaxed);
    }

    /// Submits a GET request.
    pub fn get(&self, resource: &str, callbacks: Arc<dyn Callbacks>, opts: RequestOpts) -> bool {
        self.submit(Method::Get, resource, None, callbacks, opts)
    }

    /// Submits a DELETE request.
    pub fn del(&self, resource: &str, callbacks: Arc<dyn Callbacks>, opts: RequestOpts) -> bool {
        self.submit(Method::Delete, resource, None, callbacks, opts)
    }

    /// Submits a POST request carrying `content`.
    pub fn post(
        &self,
        resource: &str,
        callbacks: Arc<dyn Callbacks>,
        content: Content,
        opts: RequestOpts,
    ) -> bool {
        self.submit(Method::Post, resource, Some(content), callbacks, opts)
    }

    /// Submits a PUT request carrying `content`.
    pub fn put(
        &self,
        resource: &str,
        callbacks: Arc<dyn Callbacks>,
        content: Content,
        opts: RequestOpts,
    ) -> bool {
        self.submit(Method::Put, resource, Some(content), callbacks, opts)
    }

    fn submit(
        &self,
        method: Method,
        resource: &str,
        content: Option<Content>,
        callbacks: Arc<dyn Callbacks>,
        opts: RequestOpts,
    ) -> bool {
        let handle = RequestHandle {
            request: Request::new(method, resource, content, opts),
            callbacks,
            submitted_at: Instant::now(),
        };
        if !self.shared.queue.push(handle) {
            return false;
        }
        let shared = Arc::clone(&self.shared);
        self.handle.post(move |core| {
            if let Some(id) = shared.driver() {
                core.wake(id);
            }
        });
        true
    }
}

impl Drop for HttpClient {
    fn drop(&mut self) {
        let shared = Arc::clone(&self.shared);
        self.handle.post(move |core| {
            if let Some(id) = shared.driver() {
                core.retire(id);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Base URL parsing
    // =========================================================================

    #[test]
    fn parse_base_url_with_port() {
        let origin = Origin::parse("http://127.0.0.1:8080").unwrap();
        assert_eq!(origin.host, "127.0.0.1");
        assert_eq!(origin.port, 8080);
        assert_eq!(origin.authority(), "127.0.0.1:8080");
    }

    #[test]
    fn parse_base_url_default_port() {
        let origin = Origin::parse("http://example.com").unwrap();
        assert_eq!(origin.port, 80);
        assert_eq!(origin.authority(), "example.com");
    }

    #[test]
    fn parse_base_url_tolerates_trailing_slash() {
        let origin = Origin::parse("http://example.com:81/").unwrap();
        assert_eq!(origin.host, "example.com");
        assert_eq!(origin.port, 81);
    }

    #[test]
    fn parse_rejects_https() {
        assert!(Origin::parse("https://example.com").is_err());
    }

    #[test]
    fn parse_rejects_missing_scheme() {
        assert!(Origin::parse("example.com").is_err());
    }

    #[test]
    fn parse_rejects_empty_host() {
        assert!(Origin::parse("http://").is_err());
        assert!(Origin::parse("http://:8080").is_err());
    }

    #[test]
    fn parse_rejects_bad_port() {
        assert!(Origin::parse("http://example.com:http").is_err());
    }

    #[test]
    fn client_error_display() {
        let err = ClientError::InvalidUrl("nope".into());
        assert!(format!("{err}").contains("nope"));
    }
}
