//! Topology read from Linux sysfs

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use super::{HwthreadEntry, Topology, TopologyError, TopologyProvider, TopologyResult};

/// Reads `devices/system/cpu/cpuN/topology/*` and
/// `devices/system/node/nodeN/cpulist` below a sysfs root
#[derive(Debug, Clone)]
pub struct SysfsTopology {
    root: PathBuf,
}

impl SysfsTopology {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn numa_domains(&self) -> TopologyResult<HashMap<usize, usize>> {
        let mut domains = HashMap::new();
        let node_dir = self.root.join("devices/system/node");
        for (node, path) in numbered_entries(&node_dir, "node")? {
            let cpulist = path.join("cpulist");
            for cpu in parse_cpulist(&read_trimmed(&cpulist)?).map_err(|message| TopologyError::Parse {
                path: cpulist.display().to_string(),
                message,
            })? {
                domains.insert(cpu, node);
            }
        }
        Ok(domains)
    }
}

impl TopologyProvider for SysfsTopology {
    fn snapshot(&self) -> TopologyResult<Topology> {
        let cpu_dir = self.root.join("devices/system/cpu");
        let numa = self.numa_domains()?;

        let mut hwthreads = Vec::new();
        for (cpu_id, path) in numbered_entries(&cpu_dir, "cpu")? {
            let topology = path.join("topology");
            // offline CPUs have no topology directory
            if !topology.is_dir() {
                continue;
            }
            let socket = read_number(&topology.join("physical_package_id"))?;
            let core = read_number(&topology.join("core_id"))?;
            let die_path = topology.join("die_id");
            let die = if die_path.exists() { read_number(&die_path)? } else { 0 };
            hwthreads.push(HwthreadEntry {
                cpu_id,
                smt: 0,
                core,
                socket,
                die,
                numa_domain: numa.get(&cpu_id).copied().unwrap_or(0),
            });
        }
        if hwthreads.is_empty() {
            return Err(TopologyError::Empty(cpu_dir.display().to_string()));
        }

        hwthreads.sort_by_key(|h| h.cpu_id);
        let mut siblings: BTreeMap<(usize, usize), usize> = BTreeMap::new();
        for hwthread in &mut hwthreads {
            let seen = siblings.entry((hwthread.socket, hwthread.core)).or_insert(0);
            hwthread.smt = *seen;
            *seen += 1;
        }

        Ok(Topology::new(hwthreads))
    }
}

/// Directory entries named `<prefix><N>`, sorted by N
fn numbered_entries(dir: &Path, prefix: &str) -> TopologyResult<Vec<(usize, PathBuf)>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(dir).map_err(|source| TopologyError::Io {
        path: dir.display().to_string(),
        source,
    })?;
    let mut numbered: Vec<(usize, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name();
            let index = name.to_str()?.strip_prefix(prefix)?.parse().ok()?;
            Some((index, entry.path()))
        })
        .collect();
    numbered.sort();
    Ok(numbered)
}

fn read_trimmed(path: &Path) -> TopologyResult<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|source| TopologyError::Io {
            path: path.display().to_string(),
            source,
        })
}

fn read_number(path: &Path) -> TopologyResult<usize> {
    let content = read_trimmed(path)?;
    content.parse().map_err(|_| TopologyError::Parse {
        path: path.display().to_string(),
        message: format!("'{}' is not a number", content),
    })
}

/// Parse a kernel cpulist such as `0-3,8,10-11`
pub fn parse_cpulist(list: &str) -> Result<Vec<usize>, String> {
    let mut cpus = Vec::new();
    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let number = |s: &str| s.parse::<usize>().map_err(|_| format!("invalid cpu '{}'", s));
        match part.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (number(start)?, number(end)?);
                if start > end {
                    return Err(format!("invalid range '{}'", part));
                }
                cpus.extend(start..=end);
            }
            None => cpus.push(number(part)?),
        }
    }
    Ok(cpus)
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

    #[test]
    fn test_parse_cpulist() {
        assert_eq!(parse_cpulist("0-3,8,10-11").unwrap(), vec![0, 1, 2, 3, 8, 10, 11]);
        assert_eq!(parse_cpulist("5\n").unwrap(), vec![5]);
        assert!(parse_cpulist("").unwrap().is_empty());
        assert!(parse_cpulist("3-1").is_err());
        assert!(parse_cpulist("a").is_err());
    }

    #[test]
    fn test_snapshot_from_fake_sysfs() {
        let dir = TempDir::new().unwrap();
        // 1 socket, 2 cores, 2 threads: cpu0/cpu2 on core 0, cpu1/cpu3 on core 1
        for cpu in 0..4 {
            let base = format!("devices/system/cpu/cpu{}/topology", cpu);
            write(dir.path(), &format!("{}/physical_package_id", base), "0\n");
            write(dir.path(), &format!("{}/core_id", base), &format!("{}\n", cpu % 2));
        }
        fs::create_dir_all(dir.path().join("devices/system/cpu/cpufreq")).unwrap();
        write(dir.path(), "devices/system/node/node0/cpulist", "0-3\n");

        let topology = SysfsTopology::new(dir.path()).snapshot().unwrap();
        assert_eq!(topology.hwthreads.len(), 4);
        assert_eq!(topology.hwthreads[2].core, 0);
        assert_eq!(topology.hwthreads[2].smt, 1);
        assert_eq!(topology.cpu_info.num_cores, 2);
        assert_eq!(topology.cpu_info.smt_width, 2);
        assert_eq!(topology.cpu_info.num_numa_domains, 1);
    }

    #[test]
    fn test_empty_root() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            SysfsTopology::new(dir.path()).snapshot(),
            Err(TopologyError::Empty(_))
        ));
    }
}
