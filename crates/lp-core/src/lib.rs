//! Core primitives for the LitePanel control daemon.
//!
//! This crate holds everything that does not need a database or an HTTP
//! server: strict input validation, password policy and hashing, audit
//! event types, subprocess execution, atomic file writes, tar.gz archive
//! handling, OpenLiteSpeed configuration parsing, and host statistics
//! collection. The higher-level crates (`lp-db`, `lp-services`,
//! `lp-daemon`) build on these primitives.

pub mod conf;
pub mod config;
pub mod fs;
pub mod process;
pub mod security;
pub mod system;
