//! stackd reverse proxy
//!
//! One listener per external route. Each listener terminates TLS when the
//! route asks for it, speaks HTTP/1.1 to the client and forwards requests to
//! the target service's internal port, switching to a raw byte relay after a
//! `101 Switching Protocols` handshake.
//!
//! Traffic only reaches a target while its route is `Routed`; the
//! [`RouteTable`] is flipped by the orchestrator's readiness callback.

pub mod error;
pub mod forward;
pub mod listener;
pub mod routes;
pub mod tls;

pub use error::{ProxyError, Result};
pub use listener::{Listener, ProxyServer};
pub use routes::{RouteEntry, RouteReader, RouteSnapshot, RouteState, RouteTable};
