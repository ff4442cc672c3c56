#![allow(clippy::return_self_not_must_use)]

//! # Ferrule
//!
//! A single-threaded reactor with composable continuations, and a pooled
//! HTTP/1.1 client built on top of it.
//!
//! ## Features
//! - Priority-ordered dispatch of readers, writers, timers and processes
//! - Suspending the running handle and resuming it later, with timeouts
//! - Coroutine-style composition of async code on the reactor
//! - A connection pool with per-destination and total limits
//! - HTTP/1.1 over plain TCP or TLS, with keep-alive and one retry on stale
//!   pooled connections
//!
//! ## Example
//! ```no_run
//! use ferrule::{ClientConfig, HttpRequest1_1, Reactor, Request};
//!
//! fn main() -> ferrule::Result<()> {
//!     let reactor = Reactor::new()?;
//!     let client = HttpRequest1_1::from_config(&reactor, &ClientConfig::new()?)?;
//!
//!     let (head, body) = reactor.block_on(async move {
//!         client.httprequest1_1(Request::get("example.org", 80, "/")).await
//!     })??;
//!     println!("{} {} bytes", head.status_code, body.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//! - `Reactor`: event loop over `mio`, dispatching one ready handle per step
//!   in priority order
//! - `Suspend`: a continuation settled once, from anywhere, with a value or
//!   an error
//! - `Task`: async code driven by reactor processes
//! - `SocketPool`: idle connections keyed by destination
//! - `HttpRequest1_1`: the request engine
//!
//! ## Configuration
//! Client settings can be configured via:
//! - Environment variables (prefixed with `FERRULE_`)
//! - Configuration file (`ferrule.toml`)
//! - Builder pattern API on [`Request`]

pub use crate::compose::{compose, spawn, spawn_with_prio, yield_now, Emitter, Task};
pub use crate::config::ClientConfig;
pub use crate::error::{Error, FramingError, ProtocolError, ReactorError, ReactorResult, Result};
pub use crate::framing::{ByteSource, Framing, StatusAndHeaders};
pub use crate::http::{Bytes, HttpRequest1_1, HttpSettings, Request, Response};
pub use crate::net::{ConnectSettings, Connection, KeepAlive};
pub use crate::pool::{ConnectionPool, EmptySocketPool, PoolLimits, Poolable, SocketPool};
pub use crate::reactor::{Handle, Reactor, TimerToken, DEFAULT_PRIO, MAX_PRIO};
pub use crate::suspend::Suspend;

mod compose;
mod config;
mod error;
mod framing;
mod http;
mod net;
mod pool;
mod reactor;
mod suspend;

// Re-export common types
pub use hyper::http::{Method, StatusCode};
