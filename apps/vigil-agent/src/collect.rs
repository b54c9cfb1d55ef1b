use std::path::Path;

use sysinfo::{Disks, System, MINIMUM_CPU_UPDATE_INTERVAL};
use vigil_core::{StatusSnapshot, UsageFigures};

/// Reads CPU, memory and disk figures for the host. Best-effort and
/// near-real-time; sizes are reported in gigabytes with two decimals.
pub struct Sampler {
    system: System,
    disks: Disks,
}

impl Sampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_all();
        system.refresh_memory();
        Self {
            system,
            disks: Disks::new_with_refreshed_list(),
        }
    }

    pub async fn sample(&mut self) -> StatusSnapshot {
        // CPU usage is the delta between two refreshes; the second one must
        // not follow the first too closely to measure anything.
        self.system.refresh_cpu_all();
        tokio::time::sleep(MINIMUM_CPU_UPDATE_INTERVAL).await;
        self.system.refresh_cpu_all();
        self.system.refresh_memory();
        self.disks.refresh();

        let (disk_used, disk_total) = self.disk_figures();
        StatusSnapshot {
            cpu: round2(f64::from(self.system.global_cpu_usage())),
            memory: usage_figures(self.system.used_memory(), self.system.total_memory()),
            disk: usage_figures(disk_used, disk_total),
        }
    }

    /// The root filesystem where there is one; otherwise the sum over all
    /// mounted disks.
    fn disk_figures(&self) -> (u64, u64) {
        if let Some(disk) = self
            .disks
            .iter()
            .find(|disk| disk.mount_point() == Path::new("/"))
        {
            let total = disk.total_space();
            return (total.saturating_sub(disk.available_space()), total);
        }

        self.disks.iter().fold((0, 0), |(used, total), disk| {
            (
                used + disk
                    .total_space()
                    .saturating_sub(disk.available_space()),
                total + disk.total_space(),
            )
        })
    }
}

fn usage_figures(used: u64, total: u64) -> UsageFigures {
    let percent = if total > 0 {
        round2(used as f64 / total as f64 * 100.0)
    } else {
        0.0
    };
    UsageFigures {
        total: format_gb(total),
        used: format_gb(used),
        percent,
    }
}

fn format_gb(bytes: u64) -> String {
    format!("{:.2}", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
