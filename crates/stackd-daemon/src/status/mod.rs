//! HTTP status endpoint.

pub mod routes;

pub use routes::{RouteView, StatusReport, StatusState, router, serve};
