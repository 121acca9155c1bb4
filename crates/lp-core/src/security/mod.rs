//! Security utilities: input validation, password policy and hashing,
//! token generation, and audit event logging.
//!
//! Every external input that reaches a subprocess argument, a SQL
//! identifier, a configuration file, or a filesystem path goes through
//! `input` first. `password` owns the bcrypt wrapping and the login
//! password policy. `audit` records administrative actions.

pub mod audit;
pub mod input;
pub mod password;
