//! Routegate - a configurable-http-proxy compatible route API for Istio
//!
//! JupyterHub manages its proxy through a small REST API. This library
//! implements that API and publishes every route as a rule inside a shared
//! Istio `VirtualService` instead of proxying traffic itself:
//! - Keeps the authoritative table of route id -> target + metadata
//! - Projects routes onto routing resources, one per host/gateway pair
//! - Serializes writes per resource and retries on version conflicts
//! - Optionally waits for a backend to answer before publishing it
//! - Drains in-flight operations on shutdown

pub mod api;
pub mod codec;
pub mod config;
pub mod error;
pub mod locks;
pub mod reconciler;
pub mod route;
pub mod store;
pub mod table;
pub mod warmup;
