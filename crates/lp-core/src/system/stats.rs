use std::cmp::Ordering;

use serde::Serialize;
use sysinfo::{Disks, Networks, ProcessesToUpdate, System};

/// CPU usage, aggregate and per core, with load averages.
#[derive(Debug, Clone, Serialize)]
pub struct CpuStats {
    pub usage_percent: f32,
    pub per_core_usage: Vec<f32>,
    pub load_avg_1: f64,
    pub load_avg_5: f64,
    pub load_avg_15: f64,
}

/// Memory usage statistics
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub swap_total_bytes: u64,
    pub swap_used_bytes: u64,
}

/// Disk usage for a single mount point
#[derive(Debug, Clone, Serialize)]
pub struct DiskStats {
    pub mount_point: String,
    pub device: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub filesystem: String,
}

/// Network usage for a single interface
#[derive(Debug, Clone, Serialize)]
pub struct NetworkStats {
    pub interface: String,
    pub bytes_received: u64,
    pub bytes_transmitted: u64,
}

/// Aggregated system statistics
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub cpu: CpuStats,
    pub memory: MemoryStats,
    pub disks: Vec<DiskStats>,
    pub network: Vec<NetworkStats>,
}

/// Static host identity plus uptime.
#[derive(Debug, Clone, Serialize)]
pub struct HostInfo {
    pub hostname: String,
    pub os_version: String,
    pub kernel_version: String,
    pub cpu_count: usize,
    pub uptime_secs: u64,
}

/// One sampled process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStats {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

/// The same sample ranked two ways.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSample {
    pub by_cpu: Vec<ProcessStats>,
    pub by_memory: Vec<ProcessStats>,
}

/// Collect current system statistics using the sysinfo crate.
///
/// Blocks for `MINIMUM_CPU_UPDATE_INTERVAL` between the two CPU
/// refreshes usage deltas require; callers on the async path should
/// wrap this in `spawn_blocking`.
pub fn collect_stats() -> SystemStats {
    let mut sys = System::new();

    // CPU usage needs two refreshes with a delay between them.
    sys.refresh_cpu_usage();
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_cpu_usage();

    sys.refresh_memory();

    let per_core_usage: Vec<f32> = sys.cpus().iter().map(|cpu| cpu.cpu_usage()).collect();
    let load_avg = System::load_average();
    let cpu = CpuStats {
        usage_percent: sys.global_cpu_usage(),
        per_core_usage,
        load_avg_1: load_avg.one,
        load_avg_5: load_avg.five,
        load_avg_15: load_avg.fifteen,
    };

    let memory = MemoryStats {
        total_bytes: sys.total_memory(),
        used_bytes: sys.used_memory(),
        available_bytes: sys.available_memory(),
        swap_total_bytes: sys.total_swap(),
        swap_used_bytes: sys.used_swap(),
    };

    let disks_info = Disks::new_with_refreshed_list();
    let disks: Vec<DiskStats> = disks_info
        .iter()
        .map(|disk| {
            let total = disk.total_space();
            let available = disk.available_space();
            DiskStats {
                mount_point: disk.mount_point().to_string_lossy().to_string(),
                device: disk.name().to_string_lossy().to_string(),
                total_bytes: total,
                used_bytes: total.saturating_sub(available),
                available_bytes: available,
                filesystem: disk.file_system().to_string_lossy().to_string(),
            }
        })
        .collect();

    let networks = Networks::new_with_refreshed_list();
    let network: Vec<NetworkStats> = networks
        .iter()
        .map(|(name, data)| NetworkStats {
            interface: name.clone(),
            bytes_received: data.total_received(),
            bytes_transmitted: data.total_transmitted(),
        })
        .collect();

    SystemStats {
        cpu,
        memory,
        disks,
        network,
    }
}

/// Hostname, OS, kernel, core count, uptime.
pub fn host_info() -> HostInfo {
    let mut sys = System::new();
    sys.refresh_cpu_usage();

    HostInfo {
        hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
        os_version: System::long_os_version().unwrap_or_else(|| "unknown".to_string()),
        kernel_version: System::kernel_version().unwrap_or_else(|| "unknown".to_string()),
        cpu_count: sys.cpus().len(),
        uptime_secs: System::uptime(),
    }
}

/// Sample all processes and return the top `limit` by CPU and by
/// resident memory. Blocks like [`collect_stats`] for the CPU delta.
pub fn top_processes(limit: usize) -> ProcessSample {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let mut procs: Vec<ProcessStats> = sys
        .processes()
        .values()
        .map(|p| ProcessStats {
            pid: p.pid().as_u32(),
            name: p.name().to_string_lossy().to_string(),
            cpu_percent: p.cpu_usage(),
            memory_bytes: p.memory(),
        })
        .collect();

    procs.sort_by(|a, b| {
        b.cpu_percent
            .partial_cmp(&a.cpu_percent)
            .unwrap_or(Ordering::Equal)
    });
    let by_cpu: Vec<ProcessStats> = procs.iter().take(limit).cloned().collect();

    procs.sort_by(|a, b| b.memory_bytes.cmp(&a.memory_bytes));
    procs.truncate(limit);

    ProcessSample {
        by_cpu,
        by_memory: procs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_stats_has_memory_and_cores() {
        let stats = collect_stats();
        assert!(stats.memory.total_bytes > 0);
        assert!(!stats.cpu.per_core_usage.is_empty());
        for disk in &stats.disks {
            assert!(disk.used_bytes <= disk.total_bytes);
        }
    }

    #[test]
    fn test_host_info_populated() {
        let info = host_info();
        assert!(!info.hostname.is_empty());
        assert!(info.cpu_count >= 1);
    }

    #[test]
    fn test_top_processes_limit_and_order() {
        let sample = top_processes(5);
        assert!(sample.by_cpu.len() <= 5);
        assert!(sample.by_memory.len() <= 5);
        for pair in sample.by_memory.windows(2) {
            assert!(pair[0].memory_bytes >= pair[1].memory_bytes);
        }
    }
}
