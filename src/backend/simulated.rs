//! Simulated capability backend
//!
//! Keeps knob values in memory, one value per (control, device) pair.
//! Device ids are decimal indices checked against the node topology.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::{find_feature, BackendError, BackendResult, CapabilityBackend, Device, DeviceType, SysFeature};
use crate::topology::CpuInformation;

struct Knob {
    category: &'static str,
    name: &'static str,
    device_type: DeviceType,
    description: &'static str,
    read_only: bool,
    write_only: bool,
    initial: &'static str,
}

const KNOBS: &[Knob] = &[
    Knob {
        category: "rapl",
        name: "pkg_limit_1",
        device_type: DeviceType::Socket,
        description: "Long-term package power limit (uW)",
        read_only: false,
        write_only: false,
        initial: "150000000",
    },
    Knob {
        category: "rapl",
        name: "pkg_limit_2",
        device_type: DeviceType::Socket,
        description: "Short-term package power limit (uW)",
        read_only: false,
        write_only: false,
        initial: "180000000",
    },
    Knob {
        category: "rapl",
        name: "pkg_max_limit",
        device_type: DeviceType::Socket,
        description: "Maximum package power limit (uW)",
        read_only: true,
        write_only: false,
        initial: "250000000",
    },
    Knob {
        category: "rapl",
        name: "pkg_energy",
        device_type: DeviceType::Socket,
        description: "Package energy counter (uJ)",
        read_only: true,
        write_only: false,
        initial: "0",
    },
    Knob {
        category: "cpu_freq",
        name: "cur_cpu_freq",
        device_type: DeviceType::HwThread,
        description: "Current CPU frequency (kHz)",
        read_only: true,
        write_only: false,
        initial: "2400000",
    },
    Knob {
        category: "cpu_freq",
        name: "min_cpu_freq",
        device_type: DeviceType::HwThread,
        description: "Minimal CPU frequency (kHz)",
        read_only: false,
        write_only: false,
        initial: "800000",
    },
    Knob {
        category: "cpu_freq",
        name: "max_cpu_freq",
        device_type: DeviceType::HwThread,
        description: "Maximal CPU frequency (kHz)",
        read_only: false,
        write_only: false,
        initial: "3600000",
    },
    Knob {
        category: "cpu_freq",
        name: "governor",
        device_type: DeviceType::HwThread,
        description: "CPU frequency governor",
        read_only: false,
        write_only: false,
        initial: "performance",
    },
    Knob {
        category: "prefetch",
        name: "l2_hwpf",
        device_type: DeviceType::Core,
        description: "L2 hardware prefetcher (1 = enabled)",
        read_only: false,
        write_only: false,
        initial: "1",
    },
    Knob {
        category: "uncore_freq",
        name: "reset",
        device_type: DeviceType::Socket,
        description: "Reset uncore frequency limits to defaults",
        read_only: false,
        write_only: true,
        initial: "",
    },
];

/// In-memory capability backend
pub struct SimulatedBackend {
    features: Vec<SysFeature>,
    counts: HashMap<DeviceType, usize>,
    values: Mutex<HashMap<(String, DeviceType, String), String>>,
    open_devices: Mutex<HashMap<u64, Device>>,
    next_handle: AtomicU64,
}

impl SimulatedBackend {
    /// Backend for a node with the given CPU layout
    pub fn new(info: &CpuInformation) -> Self {
        let counts = HashMap::from([
            (DeviceType::Node, 1),
            (DeviceType::Socket, info.num_sockets),
            (DeviceType::Die, info.num_dies),
            (DeviceType::Numa, info.num_numa_domains),
            (DeviceType::Llc, info.num_sockets),
            (DeviceType::Core, info.num_cores),
            (DeviceType::HwThread, info.num_hwthreads),
        ]);
        let features = KNOBS
            .iter()
            .map(|k| SysFeature {
                name: k.name.to_string(),
                category: k.category.to_string(),
                description: k.description.to_string(),
                device_type: k.device_type,
                read_only: k.read_only,
                write_only: k.write_only,
            })
            .collect();

        Self {
            features,
            counts,
            values: Mutex::new(HashMap::new()),
            open_devices: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Number of device handles not yet closed
    pub fn open_device_count(&self) -> usize {
        self.open_devices.lock().map(|d| d.len()).unwrap_or(0)
    }

    fn check_open(&self, device: &Device) -> BackendResult<()> {
        let open = self.open_devices.lock().map_err(|_| BackendError::Poisoned)?;
        if open.get(&device.handle) == Some(device) {
            Ok(())
        } else {
            Err(BackendError::DeviceNotOpen(device.clone()))
        }
    }

    fn feature_for(&self, name: &str, device: &Device) -> BackendResult<&SysFeature> {
        let feature = find_feature(&self.features, name)?;
        if feature.device_type != device.device_type {
            return Err(BackendError::WrongDevice {
                name: name.to_string(),
                device_type: device.device_type,
            });
        }
        Ok(feature)
    }
}

impl CapabilityBackend for SimulatedBackend {
    fn list(&self) -> BackendResult<Vec<SysFeature>> {
        Ok(self.features.clone())
    }

    fn create_device(&self, device_type: DeviceType, type_id: &str) -> BackendResult<Device> {
        let creation_error = |reason: String| BackendError::DeviceCreation {
            device_type,
            type_id: type_id.to_string(),
            reason,
        };
        let index: usize = type_id
            .parse()
            .map_err(|_| creation_error("id is not a device index".to_string()))?;
        let count = self.counts.get(&device_type).copied().unwrap_or(0);
        if index >= count {
            return Err(creation_error(format!("only {} devices of this type", count)));
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
        self.check_open(device)?;
        let feature = self.feature_for(name, device)?;
        if feature.write_only {
            return Err(BackendError::WriteOnly(name.to_string()));
        }
        let values = self.values.lock().map_err(|_| BackendError::Poisoned)?;
        let key = (name.to_string(), device.device_type, device.type_id.clone());
        Ok(values.get(&key).cloned().unwrap_or_else(|| {
            KNOBS
                .iter()
                .find(|k| k.category == feature.category && k.name == feature.name)
                .map(|k| k.initial.to_string())
                .unwrap_or_default()
        }))
    }

    fn set_by_device(&self, name: &str, device: &Device, value: &str) -> BackendResult<()> {
        self.check_open(device)?;
        let feature = self.feature_for(name, device)?;
        if feature.read_only {
            return Err(BackendError::ReadOnly(name.to_string()));
        }
        if feature.write_only {
            return Ok(());
        }
        let mut values = self.values.lock().map_err(|_| BackendError::Poisoned)?;
        values.insert(
            (name.to_string(), device.device_type, device.type_id.clone()),
            value.to_string(),
        );
        Ok(())
    }

    fn close_device(&self, device: Device) {
        if let Ok(mut open) = self.open_devices.lock() {
            open.remove(&device.handle);
        }
    }
}
