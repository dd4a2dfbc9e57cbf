//! Host resource probes.
//!
//! Storage and memory floors guard dispatch and serving start, and the
//! telemetry job reports the host inventory to the record store. All probes
//! are best-effort reads of the live system; nothing here is cached.

use serde::{Deserialize, Serialize};
use std::path::Path;
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};
use tracing::debug;

const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

/// Host inventory pushed to the record store by the telemetry job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareInfo {
    /// CPU model name.
    pub cpu: String,
    /// Comma-joined accelerator inventory, or `"-"` when none found.
    pub gpu: String,
}

/// Collects the host inventory: CPU brand from sysinfo, accelerators from
/// the `/dev/dri` render nodes the serving containers mount.
pub fn collect_hardware_info() -> HardwareInfo {
    let system = System::new_with_specifics(
        RefreshKind::new().with_cpu(CpuRefreshKind::new().with_cpu_usage()),
    );
    let cpu = system
        .cpus()
        .first()
        .map(|cpu| cpu.brand().trim().to_string())
        .unwrap_or_else(|| "Unknown CPU".to_string());

    let gpus = render_nodes(Path::new("/dev/dri"));
    let gpu = if gpus.is_empty() {
        "-".to_string()
    } else {
        gpus.join(", ")
    };

    HardwareInfo { cpu, gpu }
}

/// Lists render node device names (`renderD*`) under the given directory.
pub fn render_nodes(dri_dir: &Path) -> Vec<String> {
    let mut nodes = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dri_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("renderD") {
                nodes.push(name);
            }
        }
    }
    nodes.sort();
    nodes
}

/// Free space in whole gigabytes on the disk holding `path`.
///
/// Picks the mounted disk with the longest mount-point prefix of `path` so
/// a dedicated data volume is measured rather than the root filesystem.
pub fn available_storage_gb(path: &Path) -> u64 {
    let disks = Disks::new_with_refreshed_list();
    let mut best: Option<(usize, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if path.starts_with(mount) {
            let depth = mount.as_os_str().len();
            if best.map_or(true, |(d, _)| depth >= d) {
                best = Some((depth, disk.available_space()));
            }
        }
    }
    let bytes = best.map(|(_, space)| space).unwrap_or(0);
    debug!(path = %path.display(), available_gb = bytes / BYTES_PER_GB, "storage probe");
    bytes / BYTES_PER_GB
}

/// Free memory in whole gigabytes.
pub fn available_memory_gb() -> u64 {
    let system = System::new_with_specifics(
        RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
    );
    system.available_memory() / BYTES_PER_GB
}

/// Returns whether the data volume has at least `min_free_gb` free.
pub fn storage_available(data_root: &Path, min_free_gb: u64) -> bool {
    available_storage_gb(data_root) >= min_free_gb
}
