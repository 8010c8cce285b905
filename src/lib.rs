//! httpool: pooled asynchronous HTTP/1.1 client driven by a shared
//! readiness event loop.
//!
//! # Overview
//!
//! One [`HttpClient`] is bound to one origin and owns a fixed-size pool of
//! persistent connections living inside an [`EventLoop`]. Producers on any
//! thread submit GET/POST/PUT/DELETE requests; each accepted request is
//! matched to an available connection, driven through a non-blocking HTTP
//! state machine, and resolved to exactly one [`Callbacks::on_response`]
//! invocation carrying an [`Outcome`], the HTTP status, the raw response
//! head, and the body.
//!
//! # Core Guarantees
//!
//! - **One callback per request**: every accepted submission resolves to
//!   exactly one callback invocation, on the event-loop thread
//! - **Closed outcome set**: failures are classified at the point of
//!   detection; nothing is raised out of a submission call
//! - **Self-healing pool**: a broken connection is rebuilt on its next
//!   assignment — the first request after a failure succeeds if the origin
//!   is reachable
//! - **Bounded backpressure**: with a bounded queue, a full queue rejects
//!   the submission synchronously and consumes nothing
//!
//! # Module Structure
//!
//! - [`client`]: facade, callbacks, configuration
//! - [`event_loop`]: readiness loop, timers, cross-thread post
//! - [`outcome`]: terminal request classification
//! - [`request`]: request records, parameters, per-request options
//! - `codec`: HTTP/1.1 request serialization and response decoding
//! - `conn`: per-connection HTTP state machine
//! - `dispatcher`: queue draining and pool scheduling
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use httpool::{EventLoop, HttpClient, HttpClientConfig, RequestOpts, SimpleCallbacks};
//!
//! let mut el = EventLoop::new()?;
//! let client = HttpClient::new(&el.handle(), "http://127.0.0.1:8080",
//!                              HttpClientConfig::default().pool_size(8))?;
//! let stopper = el.handle();
//! let cbs = Arc::new(SimpleCallbacks::new(move |_req, outcome, status, _head, body| {
//!     println!("{outcome}: {status}, {} bytes", body.len());
//!     stopper.stop();
//! }));
//! assert!(client.get("/", cbs, RequestOpts::default()));
//! el.run()?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod client;
mod codec;
mod conn;
mod dispatcher;
pub mod event_loop;
pub mod outcome;
mod queue;
pub mod request;
mod timer;

pub use client::{Callbacks, ClientError, HttpClient, HttpClientConfig, SimpleCallbacks};
pub use event_loop::{Driver, DriverId, EventLoop, LoopCore, LoopCtx, LoopHandle, SourceToken};
pub use outcome::Outcome;
pub use request::{Content, Method, Params, Request, RequestOpts};
pub use timer::TimerToken;
