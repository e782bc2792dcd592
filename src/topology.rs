// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Topology
//!
//! A point-in-time view of the CPUs an interrupt planner may spread vectors
//! over.
//!
//! A Topology is comprised of one or more Node objects, each spanning the
//! online CPUs of one NUMA domain, and a set of Core objects grouping SMT
//! siblings:
//!
//!```text
//!                               Topology
//!                                  |
//!              o-------------------o-------------------o
//!              |                                       |
//!   o----------------------o              o----------------------o
//!   |  Node                |     ...      |  Node                |
//!   |  ID    0             |              |  ID    1             |
//!   |  Span  0x0f          |              |  Span  0xf0          |
//!   o----------------------o              o----------------------o
//!
//!   o----------------------o              o----------------------o
//!   |  Core                |     ...      |  Core                |
//!   |  ID    0             |              |  ID    6             |
//!   |  Span  0x03          |              |  Span  0xc0          |
//!   o----------------------o              o----------------------o
//!```
//!
//! Every object contains a Cpumask. Node spans only ever contain online CPUs,
//! core spans contain every sibling regardless of hotplug state.
//!
//! Creating Topology
//! -----------------
//!
//! The host topology is read from sysfs:
//!
//!```no_run
//!     use scx_irq_affinity::Topology;
//!     let top = Topology::new().unwrap();
//!```
//!
//! Synthetic topologies are put together with [`TopologyBuilder`]:
//!
//!```
//!     use scx_irq_affinity::TopologyBuilder;
//!     let top = TopologyBuilder::new(4)
//!         .cpu(0, 0, 0)
//!         .cpu(1, 0, 0)
//!         .cpu(2, 1, 1)
//!         .cpu(3, 1, 1)
//!         .offline(3)
//!         .build()
//!         .unwrap();
//!     assert_eq!(top.nr_online_nodes(), 2);
//!     assert_eq!(top.online().weight(), 3);
//!```
//!
//! All objects are read-only once built. Hotplug transitions go through
//! [`crate::CpuHotplug`], which holds the write side of the lock planners
//! read the topology under.

use crate::cpumask::read_cpulist;
use crate::Cpumask;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use glob::glob;
use sscanf::sscanf;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;

lazy_static::lazy_static! {
    /// Number of possible CPU IDs on the host, zero if sysfs can't be read.
    pub static ref NR_CPU_IDS: usize =
        read_cpulist_file(Path::new("/sys/devices/system/cpu/possible"))
            .ok()
            .and_then(|cpus| cpus.iter().max().map(|max| max + 1))
            .unwrap_or(0);
}

#[derive(Debug, Clone)]
pub struct Cpu {
    id: usize,
    node_id: usize,
    core_id: usize,
    online: bool,
}

impl Cpu {
    /// Get the ID of this Cpu
    pub fn id(&self) -> usize {
        self.id
    }

    /// Get the ID of the NUMA node this Cpu belongs to
    pub fn node_id(&self) -> usize {
        self.node_id
    }

    /// Get the ID of the Core this Cpu belongs to
    pub fn core_id(&self) -> usize {
        self.core_id
    }

    /// Is this CPU online?
    pub fn online(&self) -> bool {
        self.online
    }
}

#[derive(Debug, Clone)]
pub struct Core {
    id: usize,
    span: Cpumask,
}

impl Core {
    /// Get the ID of this Core
    pub fn id(&self) -> usize {
        self.id
    }

    /// Get a Cpumask of all SMT siblings in this Core
    pub fn span(&self) -> &Cpumask {
        &self.span
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    id: usize,
    span: Cpumask,
}

impl Node {
    /// Get the ID of this NUMA node
    pub fn id(&self) -> usize {
        self.id
    }

    /// Get a Cpumask of all online CPUs in this NUMA node
    pub fn span(&self) -> &Cpumask {
        &self.span
    }
}

#[derive(Debug, Clone)]
pub struct Topology {
    nr_cpu_ids: usize,
    nodes: BTreeMap<usize, Node>,
    cores: BTreeMap<usize, Core>,
    cpus: BTreeMap<usize, Cpu>,
    span: Cpumask,
}

/// Placement of a single CPU while a Topology is being assembled.
#[derive(Debug, Clone, Copy)]
struct CpuEntry {
    cpu: usize,
    node_id: usize,
    core_id: usize,
}

impl Topology {
    /// Build a complete host Topology
    pub fn new() -> Result<Topology> {
        Self::from_sysfs(Path::new("/"))
    }

    /// Build a Topology from a sysfs tree mounted below `root`.
    pub fn from_sysfs(root: &Path) -> Result<Topology> {
        let cpu_root = root.join("sys/devices/system/cpu");
        let possible = read_cpulist_file(&cpu_root.join("possible"))?;
        let nr_cpu_ids = match possible.iter().max() {
            Some(max) => max + 1,
            None => bail!("No possible CPUs found under {:?}", cpu_root),
        };

        let online_ids = read_cpulist_file(&cpu_root.join("online"))?;
        let mut online = Cpumask::new(nr_cpu_ids);
        for cpu in online_ids {
            online
                .set_cpu(cpu)
                .with_context(|| format!("Online CPU {cpu} is not possible"))?;
        }

        let node_of = read_numa_nodes(root)?;

        // Cores are keyed by their lowest sibling. Offline CPUs may have no
        // topology directory, so also pick up membership from the lists of
        // their online siblings.
        let mut core_of: BTreeMap<usize, usize> = BTreeMap::new();
        for cpu in possible.iter() {
            let siblings_path = cpu_root.join(format!("cpu{cpu}/topology/thread_siblings_list"));
            let siblings = match std::fs::read_to_string(&siblings_path) {
                Ok(list) => read_cpulist(&list)
                    .with_context(|| format!("Failed to parse {:?}", siblings_path))?,
                Err(_) => continue,
            };
            let core_id = siblings.iter().copied().min().unwrap_or(*cpu);
            for sibling in siblings {
                core_of.entry(sibling).or_insert(core_id);
            }
        }

        let entries: Vec<CpuEntry> = possible
            .iter()
            .map(|&cpu| CpuEntry {
                cpu,
                node_id: node_of.get(&cpu).copied().unwrap_or(0),
                core_id: core_of.get(&cpu).copied().unwrap_or(cpu),
            })
            .collect();

        Self::assemble(nr_cpu_ids, &entries, &online)
    }

    fn assemble(nr_cpu_ids: usize, entries: &[CpuEntry], online: &Cpumask) -> Result<Topology> {
        let mut nodes: BTreeMap<usize, Node> = BTreeMap::new();
        let mut cores: BTreeMap<usize, Core> = BTreeMap::new();
        let mut cpus: BTreeMap<usize, Cpu> = BTreeMap::new();
        let mut span = Cpumask::new(nr_cpu_ids);

        for entry in entries.iter() {
            if entry.cpu >= nr_cpu_ids {
                bail!("Invalid CPU {} passed, max {}", entry.cpu, nr_cpu_ids);
            }
            let is_online = online.test_cpu(entry.cpu);

            let cpu = Cpu {
                id: entry.cpu,
                node_id: entry.node_id,
                core_id: entry.core_id,
                online: is_online,
            };
            if cpus.insert(entry.cpu, cpu).is_some() {
                bail!("Found duplicate CPU ID {}", entry.cpu);
            }

            let node = nodes.entry(entry.node_id).or_insert_with(|| Node {
                id: entry.node_id,
                span: Cpumask::new(nr_cpu_ids),
            });
            let core = cores.entry(entry.core_id).or_insert_with(|| Core {
                id: entry.core_id,
                span: Cpumask::new(nr_cpu_ids),
            });

            core.span.set_cpu(entry.cpu)?;
            if is_online {
                node.span.set_cpu(entry.cpu)?;
                span.set_cpu(entry.cpu)?;
            }
        }

        Ok(Topology {
            nr_cpu_ids,
            nodes,
            cores,
            cpus,
            span,
        })
    }

    /// Width of every Cpumask derived from this Topology.
    pub fn nr_cpu_ids(&self) -> usize {
        self.nr_cpu_ids
    }

    /// Get the map of NUMA nodes, ascending by ID.
    pub fn nodes(&self) -> &BTreeMap<usize, Node> {
        &self.nodes
    }

    /// Get the map of Cores. Cores read from sysfs are keyed by their lowest
    /// CPU ID.
    pub fn cores(&self) -> &BTreeMap<usize, Core> {
        &self.cores
    }

    /// Get a map of <CPU ID, Cpu> for all possible Cpus.
    pub fn cpus(&self) -> &BTreeMap<usize, Cpu> {
        &self.cpus
    }

    /// Get a cpumask of all the online CPUs
    pub fn online(&self) -> &Cpumask {
        &self.span
    }

    /// Number of online CPUs.
    pub fn nr_online_cpus(&self) -> usize {
        self.span.weight()
    }

    /// NUMA node of `cpu`.
    pub fn node_of(&self, cpu: usize) -> Option<usize> {
        self.cpus.get(&cpu).map(|cpu| cpu.node_id)
    }

    /// Online CPUs of `node`.
    pub fn units_of(&self, node: usize) -> Option<&Cpumask> {
        self.nodes.get(&node).map(|node| &node.span)
    }

    /// SMT siblings of `cpu`, `cpu` included.
    pub fn siblings_of(&self, cpu: usize) -> Option<&Cpumask> {
        let core_id = self.cpus.get(&cpu)?.core_id;
        self.cores.get(&core_id).map(|core| &core.span)
    }

    /// Nodes which have at least one online CPU, ascending by ID.
    pub fn online_nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.nodes
            .values()
            .filter(|node| node.span.intersects(&self.span))
    }

    /// Number of nodes which have at least one online CPU.
    pub fn nr_online_nodes(&self) -> usize {
        self.online_nodes().count()
    }

    /// Flip the hotplug state of `cpu`. Only reachable through the write
    /// side of [`crate::CpuHotplug`].
    pub(crate) fn set_cpu_online(&mut self, cpu: usize, online: bool) -> Result<()> {
        let (node_id, was_online) = match self.cpus.get_mut(&cpu) {
            Some(entry) => {
                let was_online = entry.online;
                entry.online = online;
                (entry.node_id, was_online)
            }
            None => bail!("CPU {} is not present", cpu),
        };
        if was_online == online {
            return Ok(());
        }

        let node = match self.nodes.get_mut(&node_id) {
            Some(node) => node,
            None => bail!("CPU {} belongs to missing node {}", cpu, node_id),
        };
        if online {
            node.span.set_cpu(cpu)?;
            self.span.set_cpu(cpu)?;
        } else {
            node.span.clear_cpu(cpu)?;
            self.span.clear_cpu(cpu)?;
        }

        Ok(())
    }
}

/// Assemble a Topology from explicit CPU placements, e.g. to plan for a
/// machine other than the host.
#[derive(Debug, Clone)]
pub struct TopologyBuilder {
    nr_cpu_ids: usize,
    entries: Vec<CpuEntry>,
    offline: BTreeSet<usize>,
}

impl TopologyBuilder {
    pub fn new(nr_cpu_ids: usize) -> TopologyBuilder {
        TopologyBuilder {
            nr_cpu_ids,
            entries: Vec::new(),
            offline: BTreeSet::new(),
        }
    }

    /// Add `cpu` on NUMA node `node_id`. CPUs passing the same `core_id`
    /// are SMT siblings.
    pub fn cpu(mut self, cpu: usize, node_id: usize, core_id: usize) -> TopologyBuilder {
        self.entries.push(CpuEntry {
            cpu,
            node_id,
            core_id,
        });
        self
    }

    /// Mark an already added CPU as offline.
    pub fn offline(mut self, cpu: usize) -> TopologyBuilder {
        self.offline.insert(cpu);
        self
    }

    pub fn build(self) -> Result<Topology> {
        let mut online = Cpumask::new(self.nr_cpu_ids);
        for entry in self.entries.iter() {
            if !self.offline.contains(&entry.cpu) {
                online.set_cpu(entry.cpu)?;
            }
        }
        for cpu in self.offline.iter() {
            if !self.entries.iter().any(|entry| entry.cpu == *cpu) {
                bail!("Offline CPU {} was never added", cpu);
            }
        }

        Topology::assemble(self.nr_cpu_ids, &self.entries, &online)
    }
}

/**********************************************
 * Helper functions for creating the Topology *
 **********************************************/

fn read_cpulist_file(path: &Path) -> Result<Vec<usize>> {
    let val = match std::fs::read_to_string(path) {
        Ok(val) => val,
        Err(_) => {
            bail!("Failed to open or read file {:?}", path);
        }
    };

    read_cpulist(&val).with_context(|| format!("Failed to parse {:?}", path))
}

fn read_numa_nodes(root: &Path) -> Result<BTreeMap<usize, usize>> {
    let mut node_of = BTreeMap::new();

    let node_root = root.join("sys/devices/system/node");
    let pattern = node_root.join("node[0-9]*");
    let numa_paths = glob(pattern.to_string_lossy().as_ref())?;
    for numa_path in numa_paths.filter_map(Result::ok) {
        let name = match numa_path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => continue,
        };
        let node_id = match sscanf!(name.as_str(), "node{usize}") {
            Ok(val) => val,
            Err(_) => {
                bail!("Failed to parse NUMA node ID {}", name);
            }
        };

        for cpu in read_cpulist_file(&numa_path.join("cpulist"))? {
            if let Some(prev) = node_of.insert(cpu, node_id) {
                bail!("CPU {} found in both node {} and node {}", cpu, prev, node_id);
            }
        }
    }

    Ok(node_of)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn two_node_sysfs(root: &Path) {
        write(root, "sys/devices/system/cpu/possible", "0-7\n");
        write(root, "sys/devices/system/cpu/online", "0-6\n");
        write(root, "sys/devices/system/node/node0/cpulist", "0-1,4-5\n");
        write(root, "sys/devices/system/node/node1/cpulist", "2-3,6-7\n");
        for cpu in 0..7 {
            let sibling = if cpu < 4 { cpu + 4 } else { cpu - 4 };
            let (lo, hi) = (cpu.min(sibling), cpu.max(sibling));
            write(
                root,
                &format!("sys/devices/system/cpu/cpu{cpu}/topology/thread_siblings_list"),
                &format!("{lo},{hi}\n"),
            );
        }
    }

    #[test]
    fn test_from_sysfs() {
        let dir = tempfile::tempdir().unwrap();
        two_node_sysfs(dir.path());

        let top = Topology::from_sysfs(dir.path()).unwrap();
        assert_eq!(top.nr_cpu_ids(), 8);
        assert_eq!(top.online().to_cpulist(), "0-6");
        assert_eq!(top.nr_online_nodes(), 2);
        assert_eq!(top.units_of(0).unwrap().to_cpulist(), "0-1,4-5");
        assert_eq!(top.units_of(1).unwrap().to_cpulist(), "2-3,6");
        assert_eq!(top.node_of(6), Some(1));
        assert_eq!(top.siblings_of(1).unwrap().to_cpulist(), "1,5");
        assert_eq!(top.siblings_of(5).unwrap().to_cpulist(), "1,5");
        // cpu7 is offline and has no topology directory
        assert_eq!(top.siblings_of(7).unwrap().to_cpulist(), "3,7");
        assert!(!top.cpus()[&7].online());
    }

    #[test]
    fn test_from_sysfs_without_numa() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "sys/devices/system/cpu/possible", "0-3");
        write(dir.path(), "sys/devices/system/cpu/online", "0-3");

        let top = Topology::from_sysfs(dir.path()).unwrap();
        assert_eq!(top.nr_online_nodes(), 1);
        assert_eq!(top.units_of(0).unwrap().weight(), 4);
        assert_eq!(top.siblings_of(2).unwrap().to_cpulist(), "2");
    }

    #[test]
    fn test_from_sysfs_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Topology::from_sysfs(dir.path()).is_err());

        write(dir.path(), "sys/devices/system/cpu/possible", "0-3");
        write(dir.path(), "sys/devices/system/cpu/online", "0-4");
        assert!(Topology::from_sysfs(dir.path()).is_err());

        write(dir.path(), "sys/devices/system/cpu/online", "0-3");
        write(dir.path(), "sys/devices/system/node/node0/cpulist", "0-2");
        write(dir.path(), "sys/devices/system/node/node1/cpulist", "2-3");
        assert!(Topology::from_sysfs(dir.path()).is_err());
    }

    #[test]
    fn test_builder() {
        let top = TopologyBuilder::new(6)
            .cpu(0, 0, 0)
            .cpu(1, 0, 0)
            .cpu(2, 0, 2)
            .cpu(4, 3, 4)
            .offline(2)
            .build()
            .unwrap();

        assert_eq!(top.online().to_cpulist(), "0-1,4");
        assert_eq!(top.nr_online_nodes(), 2);
        let ids: Vec<usize> = top.online_nodes().map(|n| n.id()).collect();
        assert_eq!(ids, vec![0, 3]);
        assert_eq!(top.units_of(0).unwrap().to_cpulist(), "0-1");
        assert!(top.units_of(1).is_none());
        assert_eq!(top.node_of(3), None);
        assert_eq!(top.cores()[&0].span().to_cpulist(), "0-1");
    }

    #[test]
    fn test_builder_errors() {
        assert!(TopologyBuilder::new(2).cpu(0, 0, 0).cpu(0, 0, 0).build().is_err());
        assert!(TopologyBuilder::new(2).cpu(2, 0, 0).build().is_err());
        assert!(TopologyBuilder::new(2).cpu(0, 0, 0).offline(1).build().is_err());
    }

    #[test]
    fn test_nr_cpu_ids_matches_host() {
        // Hosts without a readable sysfs leave nothing to compare against.
        if let Ok(topo) = Topology::new() {
            assert_eq!(*NR_CPU_IDS, topo.nr_cpu_ids());
        }
    }

    #[test]
    fn test_set_cpu_online() {
        let mut top = TopologyBuilder::new(4)
            .cpu(0, 0, 0)
            .cpu(1, 0, 1)
            .cpu(2, 1, 2)
            .build()
            .unwrap();

        top.set_cpu_online(2, false).unwrap();
        assert_eq!(top.online().to_cpulist(), "0-1");
        assert_eq!(top.nr_online_nodes(), 1);
        assert!(top.units_of(1).unwrap().is_empty());

        top.set_cpu_online(2, true).unwrap();
        top.set_cpu_online(2, true).unwrap();
        assert_eq!(top.nr_online_nodes(), 2);
        assert_eq!(top.nr_online_cpus(), 3);

        assert!(top.set_cpu_online(3, true).is_err());
    }
}
