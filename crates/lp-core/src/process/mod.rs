//! External command execution behind the [`runner::ProcessRunner`] seam.
//!
//! The panel's integration mechanism with the host is shelling out to OS
//! tools (lswsctrl, ufw, certbot, redis-cli, mysqldump, systemctl).
//! Orchestration code never touches `tokio::process` directly; it builds
//! a [`runner::CommandSpec`] and hands it to a runner, so multi-step
//! sequencing is testable against [`runner::FakeRunner`] without a live
//! host.

pub mod runner;

pub use runner::{
    binary_exists, version_probe, CommandOutput, CommandSpec, FakeRunner, ProcessRunner,
    RunnerError, SystemRunner,
};
