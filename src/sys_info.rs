//! Host CPU and memory report for the overview endpoint.

use serde::Serialize;
use sysinfo::System;

#[derive(Serialize, Debug, Clone)]
pub struct CpuInfo {
    pub model: String,
    pub physical_cores: usize,
    pub total_cores: usize,
    pub frequency_ghz: f64,
    pub usage_percent: f32,
}

#[derive(Serialize, Debug, Clone)]
pub struct MemoryInfo {
    pub total: String,
    pub available: String,
    pub used_percent: f32,
}

#[derive(Serialize, Debug, Clone)]
pub struct HostInfo {
    pub cpu: CpuInfo,
    pub memory: MemoryInfo,
}

const BINARY_UNITS: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];

/// Renders a byte count with binary unit prefixes, e.g. `"1.50 KB"`.
pub fn human_bytes(bytes: u64) -> String {
    let mut scaled = bytes as f64;
    let mut units = BINARY_UNITS.iter().peekable();
    let mut unit = BINARY_UNITS[0];
    while let Some(next) = units.next() {
        unit = *next;
        if scaled < 1024.0 || units.peek().is_none() {
            break;
        }
        scaled /= 1024.0;
    }
    format!("{scaled:.2} {unit}")
}

/// Samples the host. Blocks for one CPU measurement interval, so call it
/// from a blocking task.
pub fn gather_host_info() -> HostInfo {
    let mut sys = System::new_all();
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpus = sys.cpus();
    let frequencies: Vec<u64> = cpus
        .iter()
        .map(|cpu| cpu.frequency())
        .filter(|mhz| *mhz > 0)
        .collect();
    let frequency_ghz = if frequencies.is_empty() {
        0.0
    } else {
        frequencies.iter().sum::<u64>() as f64 / frequencies.len() as f64 / 1000.0
    };

    let total = sys.total_memory();
    let available = sys.available_memory();
    let used_percent = if total == 0 {
        0.0
    } else {
        (total.saturating_sub(available) as f32 / total as f32) * 100.0
    };

    HostInfo {
        cpu: CpuInfo {
            model: cpus
                .first()
                .map(|cpu| cpu.brand().trim().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            physical_cores: num_cpus::get_physical(),
            total_cores: num_cpus::get(),
            frequency_ghz,
            usage_percent: sys.global_cpu_usage(),
        },
        memory: MemoryInfo {
            total: human_bytes(total),
            available: human_bytes(available),
            used_percent,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_scaled() {
        assert_eq!(human_bytes(0), "0.00 B");
        assert_eq!(human_bytes(512), "512.00 B");
        assert_eq!(human_bytes(1536), "1.50 KB");
        assert_eq!(human_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
        assert_eq!(human_bytes(u64::MAX), "16.00 EB");
    }
}
