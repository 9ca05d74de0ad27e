//! # Wire Bus
//!
//! A small async message bus connecting a core process to platform
//! adapters over WebSocket, HTTP, or a shared process boundary. A
//! dispatcher ([`runtime::MessageRuntime`]) routes JSON envelopes
//! ([`envelope::Envelope`]) through hooks, middleware, and registered
//! routes; bidirectional sinks ([`sink::CoreSink`]) carry traffic between
//! an adapter and the core, in-process or across a POSIX message queue
//! pair; an adapter base ([`adapter::AdapterBase`]) supervises the
//! platform-facing transport; and a router ([`router::Router`]) dispatches
//! outgoing envelopes to per-platform WebSocket clients with live
//! configuration reload.

pub mod adapter;
pub mod binding;
pub mod callable;
pub mod config;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod route;
pub mod runtime;
pub mod sink;

pub mod router;

pub use adapter::{AdapterBase, AdapterHooks, HttpIntake, WebSocketTarget};
pub use binding::RouteBinder;
pub use callable::Callable;
pub use envelope::Envelope;
pub use error::{BusResult, ConfigurationError, ProcessingError, TransportError};
pub use route::{Route, RouteId, RouteRegistry, RouteSpec};
pub use router::{RouteConfig, Router, TargetConfig};
pub use runtime::MessageRuntime;
pub use sink::{CoreHandler, CoreSink, InProcessCoreSink, OutgoingHandler};

/// The current version of the wire bus crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
