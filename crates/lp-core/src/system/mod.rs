//! Host-level observation: sysinfo snapshots and process sampling.

pub mod stats;

pub use stats::{
    collect_stats, host_info, top_processes, CpuStats, DiskStats, HostInfo, MemoryStats,
    NetworkStats, ProcessSample, ProcessStats, SystemStats,
};
