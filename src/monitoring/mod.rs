// System monitoring - host, CPU, memory and process state for `observe`

use serde::Serialize;
use sysinfo::System;

/// Memory usage information
#[derive(Debug, Clone, Serialize)]
pub struct MemoryInfo {
    /// Total system RAM in bytes
    pub total_memory: u64,
    /// Available system RAM in bytes
    pub available_memory: u64,
    /// Used system RAM in bytes
    pub used_memory: u64,
    /// Daemon process memory usage in bytes
    pub process_memory: u64,
}

impl MemoryInfo {
    fn from_system(system: &System) -> Self {
        let process_memory = sysinfo::get_current_pid()
            .ok()
            .and_then(|pid| system.process(pid))
            .map(|p| p.memory())
            .unwrap_or(0);

        Self {
            total_memory: system.total_memory(),
            available_memory: system.available_memory(),
            used_memory: system.used_memory(),
            process_memory,
        }
    }

    pub fn total_gb(&self) -> f64 {
        self.total_memory as f64 / 1_073_741_824.0 // bytes to GB
    }

    pub fn used_gb(&self) -> f64 {
        self.used_memory as f64 / 1_073_741_824.0
    }

    pub fn process_mb(&self) -> f64 {
        self.process_memory as f64 / 1_048_576.0 // bytes to MB
    }

    pub fn usage_percent(&self) -> f64 {
        if self.total_memory == 0 {
            return 0.0;
        }
        (self.used_memory as f64 / self.total_memory as f64) * 100.0
    }

    /// Less than 10% available
    pub fn is_critical(&self) -> bool {
        self.available_memory < self.total_memory / 10
    }

    /// Less than 20% available
    pub fn is_low(&self) -> bool {
        self.available_memory < self.total_memory / 5
    }

    pub fn format_status(&self) -> String {
        let status = format!(
            "Memory: {:.1}GB / {:.1}GB ({:.0}%) | Daemon: {:.0}MB",
            self.used_gb(),
            self.total_gb(),
            self.usage_percent(),
            self.process_mb()
        );
        if self.is_critical() {
            format!("{} (CRITICAL)", status)
        } else if self.is_low() {
            format!("{} (LOW)", status)
        } else {
            status
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub memory_bytes: u64,
    pub cpu_percent: f32,
}

/// Point-in-time view of the host
#[derive(Debug, Clone, Serialize)]
pub struct SystemSnapshot {
    pub hostname: String,
    pub os: Option<String>,
    pub kernel: Option<String>,
    pub uptime_secs: u64,
    pub load_average: [f64; 3],
    pub cpu_count: usize,
    pub cpu_usage_percent: f32,
    pub memory: MemoryInfo,
    pub top_processes: Vec<ProcessInfo>,
}

impl SystemSnapshot {
    /// Collect a snapshot. Blocking (sysinfo reads /proc); call from
    /// `spawn_blocking` inside async code.
    pub fn collect(top_n: usize) -> Self {
        let mut system = System::new_all();
        system.refresh_all();

        let mut processes: Vec<ProcessInfo> = system
            .processes()
            .iter()
            .map(|(pid, p)| ProcessInfo {
                pid: pid.as_u32(),
                name: p.name().to_string_lossy().into_owned(),
                memory_bytes: p.memory(),
                cpu_percent: p.cpu_usage(),
            })
            .collect();
        processes.sort_by(|a, b| b.memory_bytes.cmp(&a.memory_bytes));
        processes.truncate(top_n);

        let load = System::load_average();
        let hostname = System::host_name()
            .or_else(|| hostname::get().ok().map(|h| h.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            hostname,
            os: System::long_os_version(),
            kernel: System::kernel_version(),
            uptime_secs: System::uptime(),
            load_average: [load.one, load.five, load.fifteen],
            cpu_count: system.cpus().len(),
            cpu_usage_percent: system.global_cpu_usage(),
            memory: MemoryInfo::from_system(&system),
            top_processes: processes,
        }
    }

    /// One-paragraph human summary
    pub fn summary(&self) -> String {
        let uptime = format!("{}h{:02}m", self.uptime_secs / 3600, (self.uptime_secs % 3600) / 60);
        let top = self
            .top_processes
            .iter()
            .take(3)
            .map(|p| format!("{} ({:.0}MB)", p.name, p.memory_bytes as f64 / 1_048_576.0))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "Host: {} | Uptime: {} | Load: {:.2} {:.2} {:.2} | CPUs: {} ({:.0}%) | {} | Top: {}",
            self.hostname,
            uptime,
            self.load_average[0],
            self.load_average[1],
            self.load_average[2],
            self.cpu_count,
            self.cpu_usage_percent,
            self.memory.format_status(),
            if top.is_empty() { "-".to_string() } else { top }
        )
    }
}
