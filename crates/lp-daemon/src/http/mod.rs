//! HTTP surface: envelope types, the session gateway, and routing.

pub mod envelope;
pub mod gateway;
pub mod query;
pub mod routes;
