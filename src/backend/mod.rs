//! Capability backend module
//!
//! The hardware side of the node agent: lists controllable knobs and reads
//! or writes them on a specific device. Implementations:
//! - `SysfsBackend` for Linux cpufreq and powercap files
//! - `SimulatedBackend`, an in-memory knob table

mod simulated;
mod sysfs;

pub use simulated::*;
pub use sysfs::*;

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Backend errors
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Invalid device type {0}")]
    UnknownDeviceType(String),

    #[error("Failed to create device (type {device_type}, id {type_id}): {reason}")]
    DeviceCreation {
        device_type: DeviceType,
        type_id: String,
        reason: String,
    },

    #[error("Unknown control '{0}'")]
    UnknownControl(String),

    #[error("Control '{name}' is not available for device type {device_type}")]
    WrongDevice { name: String, device_type: DeviceType },

    #[error("Control '{0}' is read-only")]
    ReadOnly(String),

    #[error("Control '{0}' is write-only")]
    WriteOnly(String),

    #[error("Device {0} is not open")]
    DeviceNotOpen(Device),

    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Backend state lock poisoned")]
    Poisoned,
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Device classes a control can address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceType {
    Node,
    Socket,
    Die,
    Numa,
    Llc,
    Core,
    HwThread,
}

impl DeviceType {
    pub const ALL: [DeviceType; 7] = [
        DeviceType::Node,
        DeviceType::Socket,
        DeviceType::Die,
        DeviceType::Numa,
        DeviceType::Llc,
        DeviceType::Core,
        DeviceType::HwThread,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Node => "node",
            DeviceType::Socket => "socket",
            DeviceType::Die => "die",
            DeviceType::Numa => "numa",
            DeviceType::Llc => "LLC",
            DeviceType::Core => "core",
            DeviceType::HwThread => "hwthread",
        }
    }
}

impl FromStr for DeviceType {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| BackendError::UnknownDeviceType(s.to_string()))
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open device handle
///
/// `type_id` is the opaque instance identifier from the request; only the
/// backend that created the device interprets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub device_type: DeviceType,
    pub type_id: String,
    pub handle: u64,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_type, self.type_id)
    }
}

/// A controllable knob as advertised by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysFeature {
    pub name: String,
    pub category: String,
    pub description: String,
    pub device_type: DeviceType,
    pub read_only: bool,
    pub write_only: bool,
}

impl SysFeature {
    /// Name used on the wire: `<category>.<name>`
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.category, self.name)
    }

    /// Allowed methods in catalog notation
    pub fn methods(&self) -> &'static str {
        match (self.read_only, self.write_only) {
            (true, true) => "ERROR",
            (true, false) => "GET",
            (false, true) => "PUT",
            (false, false) => "ALL",
        }
    }
}

impl fmt::Display for SysFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} for type={} ({}): {}",
            self.full_name(),
            self.device_type,
            self.methods(),
            self.description
        )
    }
}

/// Hardware capability interface consumed by the dispatcher
pub trait CapabilityBackend: Send + Sync {
    /// All knobs this node offers
    fn list(&self) -> BackendResult<Vec<SysFeature>>;

    /// Open a device of the given class and instance
    fn create_device(&self, device_type: DeviceType, type_id: &str) -> BackendResult<Device>;

    /// Read a knob (`<category>.<name>`) on an open device
    fn get_by_device(&self, name: &str, device: &Device) -> BackendResult<String>;

    /// Write a knob on an open device
    fn set_by_device(&self, name: &str, device: &Device, value: &str) -> BackendResult<()>;

    /// Release a device handle
    fn close_device(&self, device: Device);
}

/// Open device that is closed again when dropped
pub struct DeviceGuard<'a> {
    backend: &'a dyn CapabilityBackend,
    device: Device,
}

impl<'a> DeviceGuard<'a> {
    pub fn open(
        backend: &'a dyn CapabilityBackend,
        device_type: DeviceType,
        type_id: &str,
    ) -> BackendResult<Self> {
        let device = backend.create_device(device_type, type_id)?;
        Ok(Self { backend, device })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn get(&self, name: &str) -> BackendResult<String> {
        self.backend.get_by_device(name, &self.device)
    }

    pub fn set(&self, name: &str, value: &str) -> BackendResult<()> {
        self.backend.set_by_device(name, &self.device, value)
    }
}

impl Drop for DeviceGuard<'_> {
    fn drop(&mut self) {
        tracing::trace!("Closing device {}", self.device);
        self.backend.close_device(self.device.clone());
    }
}

/// Find a feature by its wire name
pub(crate) fn find_feature<'a>(features: &'a [SysFeature], name: &str) -> BackendResult<&'a SysFeature> {
    features
        .iter()
        .find(|f| f.full_name() == name)
        .ok_or_else(|| BackendError::UnknownControl(name.to_string()))
}
