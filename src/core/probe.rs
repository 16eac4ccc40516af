use crate::core::DeviceId;
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::Nvml;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    /// The vendor query facility could not be reached at all.
    #[error("GPU query backend unavailable: {0}")]
    Unavailable(String),
    #[error("device {0} is not known to the probe")]
    UnknownDevice(DeviceId),
    #[error("query failed for device {device}: {reason}")]
    Query { device: DeviceId, reason: String },
}

/// One compute process observed on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuProcess {
    pub pid: u32,
    pub username: String,
    pub used_mib: u64,
}

/// A single consistent observation of one device. All fields come from the
/// same probe call; callers never see values mixed from two reads.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    pub index: DeviceId,
    pub name: String,
    pub temperature_c: u32,
    pub utilization_pct: u32,
    pub memory_total_mib: u64,
    pub memory_used_mib: u64,
    pub memory_free_mib: u64,
    pub power_draw_mw: u32,
    pub power_limit_mw: u32,
    pub processes: Vec<GpuProcess>,
}

impl DeviceSnapshot {
    /// Whether the device currently has `gb` gibibytes of free memory.
    pub fn has_free_gb(&self, gb: u64) -> bool {
        self.memory_free_mib >= gb * 1024
    }
}

/// Backend-neutral device query seam. The production backend wraps NVML;
/// tests substitute a scripted mock.
pub trait GpuProbe: Send + Sync {
    /// Indices of all devices visible to the backend. An unavailable
    /// backend yields an empty list, not an error.
    fn list_devices(&self) -> Vec<DeviceId>;

    fn snapshot(&self, device: DeviceId) -> Result<DeviceSnapshot, ProbeError>;

    /// Pids of interpreter workloads on `device` that the scheduler must
    /// not run over: any process whose command line names a `python`-
    /// prefixed interpreter, whoever owns it.
    fn foreign_python_processes(
        &self,
        device: DeviceId,
        my_username: &str,
    ) -> Result<Vec<u32>, ProbeError>;
}

/// NVML-backed probe. Initialization failure is tolerated here and turns
/// every snapshot into `ProbeError::Unavailable`; the scheduler instance
/// decides whether that is fatal.
pub struct NvmlProbe {
    nvml: Option<Nvml>,
}

impl NvmlProbe {
    pub fn new() -> Self {
        let nvml = match Nvml::init() {
            Ok(nvml) => Some(nvml),
            Err(e) => {
                tracing::warn!("Failed to initialize NVML: {e}. Running without GPU support.");
                None
            }
        };
        Self { nvml }
    }
}

impl Default for NvmlProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuProbe for NvmlProbe {
    fn list_devices(&self) -> Vec<DeviceId> {
        let Some(nvml) = &self.nvml else {
            return Vec::new();
        };
        let count = nvml.device_count().unwrap_or(0);
        (0..count).collect()
    }

    fn snapshot(&self, device: DeviceId) -> Result<DeviceSnapshot, ProbeError> {
        let nvml = self
            .nvml
            .as_ref()
            .ok_or_else(|| ProbeError::Unavailable("NVML not initialized".into()))?;

        let handle = nvml
            .device_by_index(device)
            .map_err(|_| ProbeError::UnknownDevice(device))?;

        let memory = handle.memory_info().map_err(|e| ProbeError::Query {
            device,
            reason: e.to_string(),
        })?;
        let utilization = handle.utilization_rates().map_err(|e| ProbeError::Query {
            device,
            reason: e.to_string(),
        })?;

        let processes = handle
            .running_compute_processes()
            .unwrap_or_default()
            .into_iter()
            .map(|p| GpuProcess {
                pid: p.pid,
                username: proc_username(p.pid).unwrap_or_else(|| "unknown".into()),
                used_mib: match p.used_gpu_memory {
                    UsedGpuMemory::Used(bytes) => bytes / (1024 * 1024),
                    UsedGpuMemory::Unavailable => 0,
                },
            })
            .collect();

        Ok(DeviceSnapshot {
            index: device,
            name: handle.name().unwrap_or_default(),
            temperature_c: handle.temperature(TemperatureSensor::Gpu).unwrap_or(0),
            utilization_pct: utilization.gpu,
            memory_total_mib: memory.total / (1024 * 1024),
            memory_used_mib: memory.used / (1024 * 1024),
            memory_free_mib: memory.free / (1024 * 1024),
            power_draw_mw: handle.power_usage().unwrap_or(0),
            power_limit_mw: handle.enforced_power_limit().unwrap_or(0),
            processes,
        })
    }

    fn foreign_python_processes(
        &self,
        device: DeviceId,
        my_username: &str,
    ) -> Result<Vec<u32>, ProbeError> {
        let snapshot = self.snapshot(device)?;
        let mut pids = Vec::new();
        for proc in &snapshot.processes {
            if !is_python_cmdline(proc.pid) {
                continue;
            }
            let owner = if proc.username == my_username {
                "own"
            } else {
                "other user's"
            };
            tracing::debug!(
                "GPU {device}: {owner} python workload pid={} user={}",
                proc.pid,
                proc.username
            );
            pids.push(proc.pid);
        }
        Ok(pids)
    }
}

/// Username of the user the scheduler runs as.
pub fn current_username() -> String {
    if let Ok(user) = std::env::var("USER") {
        if !user.is_empty() {
            return user;
        }
    }
    std::fs::metadata("/proc/self")
        .ok()
        .and_then(|m| {
            use std::os::unix::fs::MetadataExt;
            username_for_uid(m.uid())
        })
        .unwrap_or_else(|| "unknown".into())
}

/// Owner of a pid, resolved through /proc ownership and /etc/passwd.
fn proc_username(pid: u32) -> Option<String> {
    use std::os::unix::fs::MetadataExt;
    let uid = std::fs::metadata(format!("/proc/{pid}")).ok()?.uid();
    username_for_uid(uid)
}

fn username_for_uid(uid: u32) -> Option<String> {
    let passwd = std::fs::read_to_string("/etc/passwd").ok()?;
    for line in passwd.lines() {
        let mut fields = line.split(':');
        let (Some(name), _, Some(entry_uid)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if entry_uid.parse::<u32>() == Ok(uid) {
            return Some(name.to_string());
        }
    }
    None
}

/// Whether argv[0] of `pid` is a `python`-prefixed interpreter
/// (`python`, `python3`, `python3.12`, ...).
fn is_python_cmdline(pid: u32) -> bool {
    let Ok(raw) = std::fs::read_to_string(format!("/proc/{pid}/cmdline")) else {
        return false;
    };
    let argv0 = raw.split('\0').next().unwrap_or("");
    let base = argv0.rsplit('/').next().unwrap_or(argv0);
    base.starts_with("python")
}


#[cfg(test)]
mod tests {
    use super::mock::MockProbe;
    use super::*;

    #[test]
    fn unavailable_backend_lists_no_devices() {
        let probe = MockProbe::empty();
        assert!(probe.list_devices().is_empty());
    }

    #[test]
    fn snapshot_free_memory_threshold() {
        let probe = MockProbe::new(&[0]);
        probe.set_free_mib(0, 20 * 1024);
        let snap = probe.snapshot(0).unwrap();
        assert!(snap.has_free_gb(20));
        assert!(!snap.has_free_gb(21));
    }

    #[test]
    fn unknown_device_is_an_error() {
        let probe = MockProbe::new(&[0, 1]);
        assert!(matches!(
            probe.snapshot(7),
            Err(ProbeError::UnknownDevice(7))
        ));
    }

    #[test]
    fn python_prefix_match() {
        // Our own test runner is never a python interpreter.
        assert!(!is_python_cmdline(std::process::id()));
    }
}
