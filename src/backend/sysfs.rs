//! Linux sysfs capability backend
//!
//! Knobs map onto files below a sysfs root:
//! - `cpu_freq.*` on hwthreads: `devices/system/cpu/cpu<N>/cpufreq/`
//! - `cpu_freq.boost` on the node: `devices/system/cpu/cpufreq/boost`
//! - `rapl.*` on sockets: `class/powercap/intel-rapl:<N>/`

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::{find_feature, BackendError, BackendResult, CapabilityBackend, Device, DeviceType, SysFeature};

struct SysfsKnob {
    category: &'static str,
    name: &'static str,
    device_type: DeviceType,
    file: &'static str,
    description: &'static str,
    read_only: bool,
}

const SYSFS_KNOBS: &[SysfsKnob] = &[
    SysfsKnob {
        category: "cpu_freq",
        name: "cur_cpu_freq",
        device_type: DeviceType::HwThread,
        file: "scaling_cur_freq",
        description: "Current CPU frequency (kHz)",
        read_only: true,
    },
    SysfsKnob {
        category: "cpu_freq",
        name: "min_cpu_freq",
        device_type: DeviceType::HwThread,
        file: "scaling_min_freq",
        description: "Minimal CPU frequency (kHz)",
        read_only: false,
    },
    SysfsKnob {
        category: "cpu_freq",
        name: "max_cpu_freq",
        device_type: DeviceType::HwThread,
        file: "scaling_max_freq",
        description: "Maximal CPU frequency (kHz)",
        read_only: false,
    },
    SysfsKnob {
        category: "cpu_freq",
        name: "hw_max_cpu_freq",
        device_type: DeviceType::HwThread,
        file: "cpuinfo_max_freq",
        description: "Hardware maximal CPU frequency (kHz)",
        read_only: true,
    },
    SysfsKnob {
        category: "cpu_freq",
        name: "governor",
        device_type: DeviceType::HwThread,
        file: "scaling_governor",
        description: "CPU frequency governor",
        read_only: false,
    },
    SysfsKnob {
        category: "cpu_freq",
        name: "boost",
        device_type: DeviceType::Node,
        file: "boost",
        description: "Frequency boost (1 = enabled)",
        read_only: false,
    },
    SysfsKnob {
        category: "rapl",
        name: "pkg_limit_1",
        device_type: DeviceType::Socket,
        file: "constraint_0_power_limit_uw",
        description: "Long-term package power limit (uW)",
        read_only: false,
    },
    SysfsKnob {
        category: "rapl",
        name: "pkg_limit_2",
        device_type: DeviceType::Socket,
        file: "constraint_1_power_limit_uw",
        description: "Short-term package power limit (uW)",
        read_only: false,
    },
    SysfsKnob {
        category: "rapl",
        name: "pkg_max_limit",
        device_type: DeviceType::Socket,
        file: "constraint_0_max_power_uw",
        description: "Maximum package power limit (uW)",
        read_only: true,
    },
    SysfsKnob {
        category: "rapl",
        name: "pkg_energy",
        device_type: DeviceType::Socket,
        file: "energy_uj",
        description: "Package energy counter (uJ)",
        read_only: true,
    },
];

/// Capability backend reading and writing sysfs files
pub struct SysfsBackend {
    root: PathBuf,
    features: Vec<SysFeature>,
    open_devices: Mutex<HashMap<u64, Device>>,
    next_handle: AtomicU64,
}

impl SysfsBackend {
    /// Probe the knobs available below `root` (normally `/sys`)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let features = SYSFS_KNOBS
            .iter()
            .filter(|k| {
                device_dir(&root, k.device_type, "0")
                    .map(|dir| dir.join(k.file).exists())
                    .unwrap_or(false)
            })
            .map(|k| SysFeature {
                name: k.name.to_string(),
                category: k.category.to_string(),
                description: k.description.to_string(),
                device_type: k.device_type,
                read_only: k.read_only,
                write_only: false,
            })
            .collect::<Vec<_>>();
        tracing::debug!("Found {} sysfs controls below {}", features.len(), root.display());

        Self {
            root,
            features,
            open_devices: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn control_path(&self, name: &str, device: &Device) -> BackendResult<(PathBuf, &SysFeature)> {
        {
            let open = self.open_devices.lock().map_err(|_| BackendError::Poisoned)?;
            if open.get(&device.handle) != Some(device) {
                return Err(BackendError::DeviceNotOpen(device.clone()));
            }
        }

        let feature = find_feature(&self.features, name)?;
        if feature.device_type != device.device_type {
            return Err(BackendError::WrongDevice {
                name: name.to_string(),
                device_type: device.device_type,
            });
        }
        let knob = SYSFS_KNOBS
            .iter()
            .find(|k| k.category == feature.category && k.name == feature.name)
            .ok_or_else(|| BackendError::UnknownControl(name.to_string()))?;
        let dir = device_dir(&self.root, device.device_type, &device.type_id)
            .ok_or_else(|| BackendError::UnknownControl(name.to_string()))?;
        Ok((dir.join(knob.file), feature))
    }
}

/// Directory holding the files of one device instance
fn device_dir(root: &Path, device_type: DeviceType, type_id: &str) -> Option<PathBuf> {
    match device_type {
        DeviceType::Node if type_id == "0" => Some(root.join("devices/system/cpu/cpufreq")),
        DeviceType::HwThread => Some(root.join(format!("devices/system/cpu/cpu{}/cpufreq", type_id))),
        DeviceType::Socket => Some(root.join(format!("class/powercap/intel-rapl:{}", type_id))),
        _ => None,
    }
}

impl CapabilityBackend for SysfsBackend {
    fn list(&self) -> BackendResult<Vec<SysFeature>> {
        Ok(self.features.clone())
    }

    fn create_device(&self, device_type: DeviceType, type_id: &str) -> BackendResult<Device> {
        let creation_error = |reason: &str| BackendError::DeviceCreation {
            device_type,
            type_id: type_id.to_string(),
            reason: reason.to_string(),
        };
        if type_id.is_empty() || !type_id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(creation_error("id is not a device index"));
        }
        let dir = device_dir(&self.root, device_type, type_id)
            .ok_or_else(|| creation_error("no sysfs controls for this device"))?;
        if !dir.is_dir() {
            return Err(creation_error("device not present"));
        }

        let device = Device {
            device_type,
            type_id: type_id.to_string(),
            handle: self.next_handle.fetch_add(1, Ordering::Relaxed),
        };
        self.open_devices
            .lock()
            .map_err(|_| BackendError::Poisoned)?
            .insert(device.handle, device.clone());
        Ok(device)
    }

    fn get_by_device(&self, name: &str, device: &Device) -> BackendResult<String> {
        let (path, _) = self.control_path(name, device)?;
        let content = fs::read_to_string(&path).map_err(|source| BackendError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(content.trim().to_string())
    }

    fn set_by_device(&self, name: &str, device: &Device, value: &str) -> BackendResult<()> {
        let (path, feature) = self.control_path(name, device)?;
        if feature.read_only {
            return Err(BackendError::ReadOnly(name.to_string()));
        }
        tracing::debug!("Writing {} to {}", value, path.display());
        fs::write(&path, value).map_err(|source| BackendError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    fn close_device(&self, device: Device) {
        if let Ok(mut open) = self.open_devices.lock() {
            open.remove(&device.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn fake_sysfs() -> TempDir {
        let dir = TempDir::new().unwrap();
        for cpu in 0..2 {
            let base = format!("devices/system/cpu/cpu{}/cpufreq", cpu);
            write(dir.path(), &format!("{}/scaling_cur_freq", base), "2400000\n");
            write(dir.path(), &format!("{}/scaling_max_freq", base), "3600000\n");
            write(dir.path(), &format!("{}/scaling_governor", base), "performance\n");
        }
        write(dir.path(), "class/powercap/intel-rapl:0/constraint_0_power_limit_uw", "150000000\n");
        write(dir.path(), "class/powercap/intel-rapl:0/energy_uj", "123456\n");
        dir
    }

    #[test]
    fn test_list_only_present_files() {
        let dir = fake_sysfs();
        let backend = SysfsBackend::new(dir.path());
        let names: Vec<String> = backend.list().unwrap().iter().map(|f| f.full_name()).collect();
        assert!(names.contains(&"cpu_freq.max_cpu_freq".to_string()));
        assert!(names.contains(&"rapl.pkg_limit_1".to_string()));
        assert!(!names.contains(&"cpu_freq.min_cpu_freq".to_string()));
        assert!(!names.contains(&"cpu_freq.boost".to_string()));
    }

    #[test]
    fn test_get_and_set() {
        let dir = fake_sysfs();
        let backend = SysfsBackend::new(dir.path());
        let socket = backend.create_device(DeviceType::Socket, "0").unwrap();
        assert_eq!(backend.get_by_device("rapl.pkg_limit_1", &socket).unwrap(), "150000000");

        backend.set_by_device("rapl.pkg_limit_1", &socket, "200000000").unwrap();
        let on_disk = fs::read_to_string(
            dir.path().join("class/powercap/intel-rapl:0/constraint_0_power_limit_uw"),
        )
        .unwrap();
        assert_eq!(on_disk, "200000000");

        assert!(matches!(
            backend.set_by_device("rapl.pkg_energy", &socket, "0"),
            Err(BackendError::ReadOnly(_))
        ));
    }

    #[test]
    fn test_missing_device() {
        let dir = fake_sysfs();
        let backend = SysfsBackend::new(dir.path());
        assert!(backend.create_device(DeviceType::HwThread, "1").is_ok());
        assert!(matches!(
            backend.create_device(DeviceType::HwThread, "7"),
            Err(BackendError::DeviceCreation { .. })
        ));
        assert!(backend.create_device(DeviceType::HwThread, "../0").is_err());
        assert!(backend.create_device(DeviceType::Die, "0").is_err());
    }

    #[test]
    fn test_io_error_is_reported() {
        let dir = fake_sysfs();
        let backend = SysfsBackend::new(dir.path());
        let thread = backend.create_device(DeviceType::HwThread, "1").unwrap();
        fs::remove_file(dir.path().join("devices/system/cpu/cpu1/cpufreq/scaling_governor")).unwrap();
        assert!(matches!(
            backend.get_by_device("cpu_freq.governor", &thread),
            Err(BackendError::Io { .. })
        ));
    }
}
