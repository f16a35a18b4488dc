//! OS-level sampling helpers

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use super::SystemMetrics;

/// Refresh and read (cpu%, memory bytes) for a set of PIDs in one batch.
/// PIDs that are gone or unreadable are skipped.
pub fn sample_processes(system: &mut System, pids: &[(i64, u32)]) -> Vec<(i64, f32, u64)> {
    if pids.is_empty() {
        return Vec::new();
    }

    let targets: Vec<Pid> = pids.iter().map(|(_, pid)| Pid::from_u32(*pid)).collect();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&targets),
        true,
        ProcessRefreshKind::everything(),
    );

    pids.iter()
        .filter_map(|(id, pid)| {
            system
                .process(Pid::from_u32(*pid))
                .map(|process| (*id, process.cpu_usage(), process.memory()))
        })
        .collect()
}

/// Refresh and read a host-wide snapshot.
pub fn sample_system(system: &mut System, process_count: usize) -> SystemMetrics {
    system.refresh_cpu_usage();
    system.refresh_memory();

    SystemMetrics {
        cpu: round2(system.global_cpu_usage() as f64),
        memory_used: system.used_memory(),
        memory_total: system.total_memory(),
        load_average: System::load_average().one,
        process_count,
        timestamp: chrono::Utc::now().timestamp(),
    }
}

/// Round to two decimals.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
