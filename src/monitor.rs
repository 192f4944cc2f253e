use serde::Serialize;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessExt, System, SystemExt};
use tracing::info;

pub const LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct ResourceUsage {
    pub cpu_percent: f32,
    pub memory_kb: u64,
    pub disk_read_kb: u64,
    pub disk_written_kb: u64,
}

pub struct ResourceMonitor {
    system: System,
    pid: Option<Pid>,
    last_logged: Instant,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        ResourceMonitor {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
            last_logged: Instant::now(),
        }
    }

    pub fn sample(&mut self) -> Option<ResourceUsage> {
        let pid = self.pid?;
        if !self.system.refresh_process(pid) {
            return None;
        }
        let proc = self.system.process(pid)?;
        let disk = proc.disk_usage();
        Some(ResourceUsage {
            cpu_percent: proc.cpu_usage(),
            memory_kb: proc.memory(),
            disk_read_kb: disk.read_bytes / 1_000,
            disk_written_kb: disk.written_bytes / 1_000,
        })
    }

    /// Emit a resource line at most once per [`LOG_INTERVAL`].
    pub fn log_if_due(&mut self) {
        if self.last_logged.elapsed() < LOG_INTERVAL {
            return;
        }
        self.last_logged = Instant::now();
        if let Some(usage) = self.sample() {
            info!(
                "[CPU]: {:.2}%, [Disk In]: {} KB, [Disk Out] {} KB, Mem: {} KB",
                usage.cpu_percent, usage.disk_read_kb, usage.disk_written_kb, usage.memory_kb,
            );
        }
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_own_process() {
        let mut monitor = ResourceMonitor::new();
        let usage = monitor.sample().expect("current process is visible");
        assert!(usage.memory_kb > 0);
    }
}
