//! NUMA topology model.
//!
//! # Purpose
//!
//! Enumerates the machine's NUMA nodes, the CPUs belonging to each, and the
//! pairwise node distances, and precomputes a "near-first" node ordering per
//! node. The scheduler consults this to decide which worker to wake and where
//! to steal from; the allocator facade consults it to bind pages.
//!
//! # Source of truth
//!
//! Linux sysfs:
//!
//! ```text
//! /sys/devices/system/node/node<N>/cpulist    e.g. "0-3,8-11"
//! /sys/devices/system/node/node<N>/distance   e.g. "10 21"
//! ```
//!
//! When sysfs is absent (non-Linux, stripped containers) the model collapses
//! to a single node 0 owning every allowed CPU. Callers cannot tell the
//! difference; a one-node topology simply makes every destination "local".
//!
//! # Tie-breaking
//!
//! `near_node_ids(n)` sorts all nodes by distance from `n`. Equal distances
//! are ordered by the rotational offset `(other - n) mod N` so that two
//! different source nodes spread their traffic over different neighbours
//! instead of both hammering the lowest-numbered one.
//!
//! Read-only after construction.

use std::fs;
use std::path::Path;

const SYSFS_NODE_ROOT: &str = "/sys/devices/system/node";

/// One NUMA node: its id, the CPUs it owns, and all node ids sorted near-first.
#[derive(Clone, Debug)]
pub struct NodeInfo {
    pub id: usize,
    pub cpu_ids: Vec<usize>,
    pub near_node_ids: Vec<usize>,
}

/// Immutable topology snapshot taken at construction.
#[derive(Debug)]
pub struct Topology {
    nodes: Vec<NodeInfo>,
    distances: Vec<Vec<u32>>,
    cpu_to_node: Vec<usize>,
    /// Node ids are kernel-backed (sysfs) and valid for page binding.
    physical: bool,
}

impl Topology {
    /// Detect the machine topology, falling back to a single node.
    pub fn detect() -> Self {
        match Self::from_sysfs(Path::new(SYSFS_NODE_ROOT)) {
            Some(topo) if !topo.nodes.is_empty() => topo,
            _ => Self::single_node(),
        }
    }

    /// Single-node fallback: node 0 owns every CPU the process may run on.
    pub fn single_node() -> Self {
        let ncpus = available_cpus();
        let node = NodeInfo {
            id: 0,
            cpu_ids: (0..ncpus).collect(),
            near_node_ids: vec![0],
        };
        Self {
            nodes: vec![node],
            distances: vec![vec![10]],
            cpu_to_node: vec![0; ncpus],
            physical: false,
        }
    }

    /// Synthetic topology: one node per CPU list, uniform remote distances.
    /// Lets multi-node behavior run on machines without NUMA hardware.
    pub fn synthetic(cpu_lists: &[Vec<usize>]) -> Self {
        assert!(!cpu_lists.is_empty());
        let n = cpu_lists.len();
        let distances: Vec<Vec<u32>> = (0..n)
            .map(|a| (0..n).map(|b| if a == b { 10 } else { 20 }).collect())
            .collect();
        let mut nodes: Vec<NodeInfo> = cpu_lists
            .iter()
            .enumerate()
            .map(|(id, cpus)| NodeInfo {
                id,
                cpu_ids: cpus.clone(),
                near_node_ids: Vec::new(),
            })
            .collect();
        for node in &mut nodes {
            let me = node.id;
            let mut order: Vec<usize> = (0..n).collect();
            order.sort_by_key(|&other| (distances[me][other], (other + n - me) % n));
            node.near_node_ids = order;
        }
        let max_cpu = nodes
            .iter()
            .flat_map(|node| node.cpu_ids.iter().copied())
            .max()
            .unwrap_or(0);
        let mut cpu_to_node = vec![0usize; max_cpu + 1];
        for node in &nodes {
            for &cpu in &node.cpu_ids {
                cpu_to_node[cpu] = node.id;
            }
        }
        Self {
            nodes,
            distances,
            cpu_to_node,
            physical: false,
        }
    }

    fn from_sysfs(root: &Path) -> Option<Self> {
        let mut node_ids = Vec::new();
        for entry in fs::read_dir(root).ok()? {
            let entry = entry.ok()?;
            let name = entry.file_name();
            let name = name.to_str()?;
            if let Some(rest) = name.strip_prefix("node") {
                if let Ok(id) = rest.parse::<usize>() {
                    node_ids.push(id);
                }
            }
        }
        if node_ids.is_empty() {
            return None;
        }
        node_ids.sort_unstable();

        let mut nodes = Vec::with_capacity(node_ids.len());
        let mut distances = Vec::with_capacity(node_ids.len());
        for (dense, &id) in node_ids.iter().enumerate() {
            let cpulist = fs::read_to_string(root.join(format!("node{id}/cpulist"))).ok()?;
            let cpu_ids = parse_cpulist(cpulist.trim());
            let dist_line = fs::read_to_string(root.join(format!("node{id}/distance"))).ok()?;
            let row: Vec<u32> = dist_line
                .split_whitespace()
                .filter_map(|tok| tok.parse().ok())
                .collect();
            if row.len() < node_ids.len() {
                return None;
            }
            // Sysfs rows cover all configured nodes; keep only the ones we saw.
            let row: Vec<u32> = node_ids.iter().map(|&other| row[other]).collect();
            distances.push(row);
            nodes.push(NodeInfo {
                id: dense,
                cpu_ids,
                near_node_ids: Vec::new(),
            });
        }

        let n = nodes.len();
        for node in &mut nodes {
            let me = node.id;
            let mut order: Vec<usize> = (0..n).collect();
            order.sort_by_key(|&other| {
                (
                    distances[me][other],
                    (other + n - me) % n, // rotational tie-break
                )
            });
            node.near_node_ids = order;
        }

        let max_cpu = nodes
            .iter()
            .flat_map(|node| node.cpu_ids.iter().copied())
            .max()
            .unwrap_or(0);
        let mut cpu_to_node = vec![0usize; max_cpu + 1];
        for node in &nodes {
            for &cpu in &node.cpu_ids {
                cpu_to_node[cpu] = node.id;
            }
        }

        Some(Self {
            nodes,
            distances,
            cpu_to_node,
            physical: true,
        })
    }

    /// True when node ids come from sysfs and can back `mbind` requests.
    #[inline]
    pub fn is_physical(&self) -> bool {
        self.physical
    }

    /// Ordered node records.
    #[inline]
    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn node(&self, id: usize) -> &NodeInfo {
        &self.nodes[id]
    }

    /// Node owning `cpu`. CPUs unknown to the snapshot map to node 0.
    #[inline]
    pub fn cpu_to_node(&self, cpu: usize) -> usize {
        self.cpu_to_node.get(cpu).copied().unwrap_or(0)
    }

    /// Symmetric distance between nodes; self-distance is minimal.
    #[inline]
    pub fn node_distance(&self, a: usize, b: usize) -> u32 {
        self.distances[a][b]
    }

    /// All node ids sorted by distance from `n` (self first).
    #[inline]
    pub fn near_node_ids(&self, n: usize) -> &[usize] {
        &self.nodes[n].near_node_ids
    }

    /// Total CPUs across all nodes.
    pub fn total_cpus(&self) -> usize {
        self.nodes.iter().map(|node| node.cpu_ids.len()).sum()
    }

    /// CPU ids in node order (node 0's CPUs first). The scheduler fills
    /// worker threads in this order so low thread counts stay on one node.
    pub fn cpus_node_major(&self) -> Vec<usize> {
        let mut cpus = Vec::with_capacity(self.total_cpus());
        for node in &self.nodes {
            cpus.extend_from_slice(&node.cpu_ids);
        }
        cpus
    }
}

/// Parse a sysfs cpulist such as `0-3,8,10-11`.
fn parse_cpulist(list: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for part in list.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                if let (Ok(lo), Ok(hi)) = (lo.parse::<usize>(), hi.parse::<usize>()) {
                    cpus.extend(lo..=hi);
                }
            }
            None => {
                if let Ok(cpu) = part.parse::<usize>() {
                    cpus.push(cpu);
                }
            }
        }
    }
    cpus
}

/// CPUs available to this process (cgroup-aware).
pub fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cpulist_ranges_and_singles() {
        assert_eq!(parse_cpulist("0-3"), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpulist("0,2,4"), vec![0, 2, 4]);
        assert_eq!(parse_cpulist("0-1,8,10-11"), vec![0, 1, 8, 10, 11]);
        assert_eq!(parse_cpulist(""), Vec::<usize>::new());
    }

    #[test]
    fn single_node_covers_all_cpus() {
        let topo = Topology::single_node();
        assert_eq!(topo.node_count(), 1);
        assert_eq!(topo.total_cpus(), available_cpus());
        assert_eq!(topo.near_node_ids(0), &[0]);
        for cpu in 0..topo.total_cpus() {
            assert_eq!(topo.cpu_to_node(cpu), 0);
        }
    }

    #[test]
    fn detect_never_returns_empty() {
        let topo = Topology::detect();
        assert!(topo.node_count() >= 1);
        assert!(topo.total_cpus() >= 1);
        // Every node must list itself first in its near ordering.
        for node in topo.nodes() {
            assert_eq!(topo.near_node_ids(node.id)[0], node.id);
        }
    }

    #[test]
    fn cpus_node_major_is_a_permutation() {
        let topo = Topology::detect();
        let mut cpus = topo.cpus_node_major();
        assert_eq!(cpus.len(), topo.total_cpus());
        cpus.sort_unstable();
        cpus.dedup();
        assert_eq!(cpus.len(), topo.total_cpus());
    }

    #[test]
    fn distance_is_self_minimal() {
        let topo = Topology::detect();
        for a in 0..topo.node_count() {
            for b in 0..topo.node_count() {
                assert!(topo.node_distance(a, a) <= topo.node_distance(a, b));
            }
        }
    }

    #[test]
    fn rotational_tie_break_spreads_neighbours() {
        // Synthetic four-node mesh where every remote distance is equal:
        // node 1 must prefer node 2 while node 3 prefers node 0.
        let n = 4;
        let mut nodes: Vec<NodeInfo> = (0..n)
            .map(|id| NodeInfo {
                id,
                cpu_ids: vec![id],
                near_node_ids: Vec::new(),
            })
            .collect();
        let distances: Vec<Vec<u32>> = (0..n)
            .map(|a| (0..n).map(|b| if a == b { 10 } else { 20 }).collect())
            .collect();
        for node in &mut nodes {
            let me = node.id;
            let mut order: Vec<usize> = (0..n).collect();
            order.sort_by_key(|&other| (distances[me][other], (other + n - me) % n));
            node.near_node_ids = order;
        }
        assert_eq!(nodes[1].near_node_ids, vec![1, 2, 3, 0]);
        assert_eq!(nodes[3].near_node_ids, vec![3, 0, 1, 2]);
    }
}
