//! HTTP API: server, routing, and request/response mapping over the job coordinator.

pub mod app;
