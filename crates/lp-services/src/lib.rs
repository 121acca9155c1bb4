//! Orchestration layer between the HTTP surface and the host.
//!
//! Each module owns one administrative domain (virtual hosts, SSL,
//! databases, firewall, ...) and follows the same shape: a service struct
//! holding the pool, the panel configuration, a [`ProcessRunner`] for
//! anything that shells out, and an [`AuditLogger`]. Operations validate
//! their inputs first, take a named lock when they mutate shared host
//! state, perform the external change before the panel record, and audit
//! the outcome.
//!
//! [`ProcessRunner`]: lp_core::process::ProcessRunner
//! [`AuditLogger`]: lp_core::security::audit::AuditLogger

pub mod audit;
pub mod auth;
pub mod backup;
pub mod context;
pub mod database;
pub mod firewall;
pub mod locks;
pub mod phpext;
pub mod ratelimit;
pub mod redis;
pub mod settings;
pub mod ssl;
pub mod system;
pub mod vhost;

pub use context::RequestIdentity;
pub use locks::LockRegistry;
pub use ratelimit::{RateLimiter, RateStatus};
