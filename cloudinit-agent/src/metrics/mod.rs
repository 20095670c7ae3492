//! Host telemetry for the management endpoint
//!
//! Provides:
//! - `HostMetrics`, the wire snapshot reported every cycle
//! - `PowerState`, the VM power-state table with its stable wire names
//! - `MetricsSource`, the sampling seam, and `SysinfoSource` behind it
//!
//! Sizes are reported in MB. `flu_usage`, `network_u` and `network_d` are
//! cumulative counters here; the delta tracker turns them into per-cycle values.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use sysinfo::{Disks, Networks, System};
use tracing::debug;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Seconds in one report window, used to turn MB into average Mbit/s
const REPORT_WINDOW_SECS: f64 = 60.0;

/// VM power state as understood by the management plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PowerState {
    #[serde(rename = "STOPPED")]
    Stopped,
    #[serde(rename = "STARTED")]
    Started,
    #[serde(rename = "SUSPEND")]
    Suspended,
    #[serde(rename = "ON_STOP")]
    Stopping,
    #[serde(rename = "ON_OPEN")]
    Opening,
    #[serde(rename = "ON_SAVE")]
    Saving,
    #[serde(rename = "ON_WAKE")]
    Waking,
    #[serde(rename = "S_START")]
    StartRequested,
    // Soft and hard reset share one code; H_RESET decodes to this variant.
    #[serde(rename = "S_RESET", alias = "H_RESET")]
    ResetRequested,
    #[serde(rename = "S_CLOSE")]
    SoftCloseRequested,
    #[serde(rename = "H_CLOSE")]
    HardCloseRequested,
    #[serde(rename = "A_PAUSE")]
    PauseRequested,
    #[serde(rename = "A_WAKED")]
    WakeRequested,
    #[serde(rename = "CRASHED")]
    Crashed,
    #[default]
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl PowerState {
    /// Numeric code used by the hypervisor side
    pub fn code(self) -> u8 {
        match self {
            PowerState::Stopped => 0x0,
            PowerState::Started => 0x1,
            PowerState::Suspended => 0x2,
            PowerState::Stopping => 0x3,
            PowerState::Opening => 0x4,
            PowerState::Saving => 0x5,
            PowerState::Waking => 0x6,
            PowerState::StartRequested => 0x7,
            PowerState::ResetRequested => 0x8,
            PowerState::SoftCloseRequested => 0x9,
            PowerState::HardCloseRequested => 0xa,
            PowerState::PauseRequested => 0xb,
            PowerState::WakeRequested => 0xc,
            PowerState::Crashed => 0xe,
            PowerState::Unknown => 0xf,
        }
    }
}

/// Point-in-time host resource reading (field names are the wire names)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostMetrics {
    pub ac_status: PowerState,
    pub cpu_model: String,
    pub cpu_total: u64,
    pub cpu_usage: u32,
    pub mem_total: u64,
    pub mem_usage: u64,
    pub hdd_total: u64,
    pub hdd_usage: u64,
    /// mount point -> [total MB, used MB]
    pub ext_usage: BTreeMap<String, [u64; 2]>,
    pub flu_total: u64,
    pub flu_usage: u64,
    pub nat_total: u64,
    pub nat_usage: u64,
    pub web_total: u64,
    pub web_usage: u64,
    /// GPU id -> utilization percent
    pub gpu_usage: BTreeMap<u32, u32>,
    pub gpu_total: u64,
    pub network_u: u64,
    pub network_d: u64,
    pub cpu_heats: u64,
    pub cpu_power: u64,
}

/// Produces raw host readings. Errors abort the current cycle.
#[async_trait]
pub trait MetricsSource: Send {
    async fn sample(&mut self) -> Result<HostMetrics>;
}

/// `MetricsSource` backed by the sysinfo crate
pub struct SysinfoSource {
    sys: System,
    root: PathBuf,
}

impl SysinfoSource {
    pub fn new() -> Self {
        Self {
            sys: System::new_all(),
            root: root_mount_point(),
        }
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricsSource for SysinfoSource {
    async fn sample(&mut self) -> Result<HostMetrics> {
        debug!("Collecting host metrics...");

        self.sys.refresh_cpu();
        self.sys.refresh_memory();

        // Wait a moment for accurate CPU readings
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL.max(
            std::time::Duration::from_millis(200),
        ))
        .await;
        self.sys.refresh_cpu_usage();

        let mut metrics = HostMetrics {
            ac_status: PowerState::Started,
            cpu_model: self
                .sys
                .cpus()
                .first()
                .map(|cpu| cpu.brand().trim().to_string())
                .unwrap_or_default(),
            cpu_total: self.sys.cpus().len() as u64,
            cpu_usage: self.sys.global_cpu_info().cpu_usage().round() as u32,
            mem_total: self.sys.total_memory() / BYTES_PER_MB,
            mem_usage: self.sys.used_memory() / BYTES_PER_MB,
            ..HostMetrics::default()
        };

        let disks = Disks::new_with_refreshed_list();
        let mounts = disks.list().iter().map(|disk| DiskUsage {
            mount_point: disk.mount_point().to_string_lossy().to_string(),
            total_mb: disk.total_space() / BYTES_PER_MB,
            used_mb: disk.total_space().saturating_sub(disk.available_space()) / BYTES_PER_MB,
        });
        apply_disk_usage(&mut metrics, &self.root, mounts);

        let networks = Networks::new_with_refreshed_list();
        let counters = networks.iter().map(|(name, data)| InterfaceTraffic {
            name: name.clone(),
            bytes_sent: data.total_transmitted(),
            bytes_recv: data.total_received(),
        });
        if let Some(busiest) = busiest_interface(counters) {
            debug!(
                interface = %busiest.name,
                sent_mb = busiest.bytes_sent / BYTES_PER_MB,
                recv_mb = busiest.bytes_recv / BYTES_PER_MB,
                "Selected busiest interface for traffic counters"
            );
            apply_traffic(&mut metrics, &busiest);
        }

        Ok(metrics)
    }
}

/// Usage of one mounted filesystem, already in MB
#[derive(Debug, Clone)]
struct DiskUsage {
    mount_point: String,
    total_mb: u64,
    used_mb: u64,
}

/// Cumulative byte counters of one interface
#[derive(Debug, Clone)]
struct InterfaceTraffic {
    name: String,
    bytes_sent: u64,
    bytes_recv: u64,
}

fn root_mount_point() -> PathBuf {
    if cfg!(target_os = "windows") {
        let drive = std::env::var("SystemDrive").unwrap_or_else(|_| "C:".to_string());
        PathBuf::from(format!("{}\\", drive))
    } else {
        PathBuf::from("/")
    }
}

/// Root filesystem fills `hdd_*`; every other mount point lands in `ext_usage`
fn apply_disk_usage(
    metrics: &mut HostMetrics,
    root: &Path,
    mounts: impl IntoIterator<Item = DiskUsage>,
) {
    for disk in mounts {
        if Path::new(&disk.mount_point) == root {
            metrics.hdd_total = disk.total_mb;
            metrics.hdd_usage = disk.used_mb;
        } else {
            metrics
                .ext_usage
                .insert(disk.mount_point, [disk.total_mb, disk.used_mb]);
        }
    }
}

/// Interface with the most bytes sent; ties keep the first seen, all-zero yields none
fn busiest_interface(
    interfaces: impl IntoIterator<Item = InterfaceTraffic>,
) -> Option<InterfaceTraffic> {
    let mut busiest: Option<InterfaceTraffic> = None;
    for iface in interfaces {
        let current_max = busiest.as_ref().map(|b| b.bytes_sent).unwrap_or(0);
        if iface.bytes_sent > current_max {
            busiest = Some(iface);
        }
    }
    busiest
}

fn apply_traffic(metrics: &mut HostMetrics, iface: &InterfaceTraffic) {
    let sent_mb = iface.bytes_sent as f64 / BYTES_PER_MB as f64;
    let recv_mb = iface.bytes_recv as f64 / BYTES_PER_MB as f64;

    metrics.flu_usage = (sent_mb + recv_mb) as u64;
    metrics.network_u = (sent_mb / REPORT_WINDOW_SECS * 8.0) as u64;
    metrics.network_d = (recv_mb / REPORT_WINDOW_SECS * 8.0) as u64;
}
