use std::fs;
use serde::{Serialize, Deserialize};
use sysinfo::System;

use crate::core::cpus::{self, CpuList};
use crate::core::error::{Result, RtevalError};
use crate::core::report::ReportNode;

const CLOCKSOURCE_PATH: &str = "/sys/devices/system/clocksource/clocksource0/current_clocksource";
const ISOLATED_CPUS_PATH: &str = "/sys/devices/system/cpu/isolated";
const CMDLINE_PATH: &str = "/proc/cmdline";

/// Static identity of the host, recorded at the top of every report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub os_name: String,
    pub os_version: String,
    pub kernel_version: String,
    pub cpu: CpuInfo,
    pub memory_bytes: u64,
    pub clocksource: Option<String>,
    pub cmdline: Option<String>,
    pub isolated_cpus: CpuList,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuInfo {
    pub model_name: String,
    pub vendor: String,
    pub physical_cores: Option<usize>,
    pub logical_cores: usize,
    pub frequency_mhz: u64,
    pub online: CpuList,
}

/// Supplier of host identity facts.
pub trait SystemInfoSource: Send + Sync {
    fn collect(&self) -> Result<SystemInfo>;
}

/// Reads identity from the running host via `sysinfo` and sysfs.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostInfo;

fn read_trimmed(path: &str) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

impl SystemInfoSource for HostInfo {
    fn collect(&self) -> Result<SystemInfo> {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();

        let global = system.global_cpu_info();
        if system.cpus().is_empty() {
            return Err(RtevalError::Unexpected("no CPUs reported by the host".to_string()));
        }

        Ok(SystemInfo {
            hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
            os_name: System::name().unwrap_or_else(|| "unknown".to_string()),
            os_version: System::os_version().unwrap_or_else(|| "unknown".to_string()),
            kernel_version: System::kernel_version().unwrap_or_else(|| "unknown".to_string()),
            cpu: CpuInfo {
                model_name: global.brand().trim().to_string(),
                vendor: global.vendor_id().to_string(),
                physical_cores: system.physical_core_count(),
                logical_cores: system.cpus().len(),
                frequency_mhz: global.frequency(),
                online: cpus::online_cpus(),
            },
            memory_bytes: system.total_memory(),
            clocksource: read_trimmed(CLOCKSOURCE_PATH),
            cmdline: read_trimmed(CMDLINE_PATH),
            isolated_cpus: read_trimmed(ISOLATED_CPUS_PATH)
                .and_then(|text| CpuList::parse(&text).ok())
                .unwrap_or_default(),
        })
    }
}

impl SystemInfo {
    pub fn to_report_node(&self) -> ReportNode {
        let mut cpu = ReportNode::new("cpu")
            .attr("logical_cores", self.cpu.logical_cores)
            .attr("frequency_mhz", self.cpu.frequency_mhz)
            .child(ReportNode::value("model", &self.cpu.model_name))
            .child(ReportNode::value("vendor", &self.cpu.vendor))
            .child(ReportNode::value("online", &self.cpu.online));
        if let Some(physical) = self.cpu.physical_cores {
            cpu.set_attr("physical_cores", physical);
        }

        let mut node = ReportNode::new("SystemInfo")
            .child(ReportNode::value("hostname", &self.hostname))
            .child(
                ReportNode::new("os")
                    .attr("name", &self.os_name)
                    .attr("version", &self.os_version),
            )
            .child(ReportNode::value("kernel", &self.kernel_version))
            .child(cpu)
            .child(
                ReportNode::value("memory", bytesize::ByteSize::b(self.memory_bytes))
                    .attr("bytes", self.memory_bytes),
            );
        if let Some(clocksource) = &self.clocksource {
            node.push(ReportNode::value("clocksource", clocksource));
        }
        if let Some(cmdline) = &self.cmdline {
            node.push(ReportNode::value("cmdline", cmdline));
        }
        if !self.isolated_cpus.is_empty() {
            node.push(ReportNode::value("isolated_cpus", &self.isolated_cpus));
        }
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SystemInfo {
        SystemInfo {
            hostname: "rt-node-01".into(),
            os_name: "Fedora".into(),
            os_version: "40".into(),
            kernel_version: "6.8.0-rt8".into(),
            cpu: CpuInfo {
                model_name: "Test CPU".into(),
                vendor: "GenuineTest".into(),
                physical_cores: Some(4),
                logical_cores: 8,
                frequency_mhz: 3000,
                online: CpuList::new(0..8),
            },
            memory_bytes: 16 * 1024 * 1024 * 1024,
            clocksource: Some("tsc".into()),
            cmdline: None,
            isolated_cpus: CpuList::new([6, 7]),
        }
    }

    #[test]
    fn test_host_info_collects() {
        let info = HostInfo.collect().unwrap();
        assert!(info.cpu.logical_cores > 0);
        assert!(!info.cpu.online.is_empty());
    }

    #[test]
    fn test_report_node_layout() {
        let node = sample().to_report_node();
        assert!(node.validate().is_ok());
        assert_eq!(node.child_text("hostname"), Some("rt-node-01"));
        assert_eq!(node.child_text("kernel"), Some("6.8.0-rt8"));
        assert_eq!(node.find("cpu").unwrap().child_text("online"), Some("0-7"));
        assert_eq!(node.child_text("isolated_cpus"), Some("6-7"));
        assert!(node.find("cmdline").is_none());
    }
}
