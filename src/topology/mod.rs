//! Topology module - CPU/socket/NUMA layout of the local node
//!
//! The snapshot is serialized as-is for `topology` queries, so the JSON
//! field names follow the collector's naming (`CpuID`, `NumSockets`, ...).

mod sysfs;

pub use sysfs::*;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Topology errors
#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("No hardware threads found below {0}")]
    Empty(String),
}

pub type TopologyResult<T> = Result<T, TopologyError>;

/// One hardware thread and its position in the hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HwthreadEntry {
    #[serde(rename = "CpuID")]
    pub cpu_id: usize,
    #[serde(rename = "SMT")]
    pub smt: usize,
    #[serde(rename = "Core")]
    pub core: usize,
    #[serde(rename = "Socket")]
    pub socket: usize,
    #[serde(rename = "Die")]
    pub die: usize,
    #[serde(rename = "NumaDomain")]
    pub numa_domain: usize,
}

/// Aggregate counts derived from the hwthread list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuInformation {
    #[serde(rename = "NumHWthreads")]
    pub num_hwthreads: usize,
    #[serde(rename = "SMTWidth")]
    pub smt_width: usize,
    #[serde(rename = "NumSockets")]
    pub num_sockets: usize,
    #[serde(rename = "NumDies")]
    pub num_dies: usize,
    #[serde(rename = "NumCores")]
    pub num_cores: usize,
    #[serde(rename = "NumNumaDomains")]
    pub num_numa_domains: usize,
}

impl CpuInformation {
    pub fn from_hwthreads(hwthreads: &[HwthreadEntry]) -> Self {
        let count = |key: fn(&HwthreadEntry) -> (usize, usize)| {
            hwthreads.iter().map(key).collect::<BTreeSet<_>>().len()
        };
        Self {
            num_hwthreads: hwthreads.len(),
            smt_width: hwthreads.iter().map(|h| h.smt + 1).max().unwrap_or(0),
            num_sockets: count(|h| (h.socket, 0)),
            num_dies: count(|h| (h.socket, h.die)),
            num_cores: count(|h| (h.socket, h.core)),
            num_numa_domains: count(|h| (h.numa_domain, 0)),
        }
    }
}

/// Full snapshot returned for `topology` queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub hwthreads: Vec<HwthreadEntry>,
    pub cpu_info: CpuInformation,
}

impl Topology {
    pub fn new(mut hwthreads: Vec<HwthreadEntry>) -> Self {
        hwthreads.sort_by_key(|h| h.cpu_id);
        let cpu_info = CpuInformation::from_hwthreads(&hwthreads);
        Self { hwthreads, cpu_info }
    }
}

/// Source of topology snapshots
pub trait TopologyProvider: Send + Sync {
    fn snapshot(&self) -> TopologyResult<Topology>;
}

/// Provider returning a fixed snapshot
#[derive(Debug, Clone)]
pub struct StaticTopology {
    topology: Topology,
}

impl StaticTopology {
    pub fn new(topology: Topology) -> Self {
        Self { topology }
    }

    /// Symmetric node numbered the way Linux enumerates CPUs: all first
    /// threads of every core, then all second threads, and so on.
    /// Each socket is one die and one NUMA domain.
    pub fn uniform(sockets: usize, cores_per_socket: usize, threads_per_core: usize) -> Self {
        let cores = sockets * cores_per_socket;
        let mut hwthreads = Vec::with_capacity(cores * threads_per_core);
        for smt in 0..threads_per_core {
            for core in 0..cores {
                let socket = core / cores_per_socket.max(1);
                hwthreads.push(HwthreadEntry {
                    cpu_id: smt * cores + core,
                    smt,
                    core,
                    socket,
                    die: 0,
                    numa_domain: socket,
                });
            }
        }
        Self::new(Topology::new(hwthreads))
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }
}

impl TopologyProvider for StaticTopology {
    fn snapshot(&self) -> TopologyResult<Topology> {
        Ok(self.topology.clone())
    }
}
