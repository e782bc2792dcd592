// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Interrupt vector affinity planning
//!
//! Multi-queue devices get one interrupt vector per queue. To keep interrupt
//! handling local and evenly loaded, the vectors' affinity masks should
//! partition the online CPUs along the machine's NUMA and SMT topology.
//!
//! A request is described by the total number of vectors and how many of
//! them are reserved at the beginning (`pre_vectors`) and end
//! (`post_vectors`) of the vector table, e.g. for admin or config queues.
//! Reserved vectors get the default affinity. The vectors in between are
//! spread:
//!
//! - With at least as many online NUMA nodes as spreadable vectors, each
//!   vector gets all online CPUs of one node, in ascending node order.
//!
//! - Otherwise the vectors are distributed over the nodes proportionally.
//!   Each node gets `remaining_vectors / remaining_nodes` vectors, capped by
//!   its number of online CPUs, so rounding leftovers carry over to the next
//!   node. The node's CPUs are then split evenly between its vectors, the
//!   first `ncpus % nvecs` vectors taking one extra CPU, with SMT siblings
//!   kept together where the split allows it.
//!
//! The topology is stabilized against hotplug for the whole computation,
//! making plans deterministic for a given topology and request.
//!
//! ```
//! use scx_irq_affinity::{AffinityPlanner, CpuHotplug, TopologyBuilder};
//! use std::sync::Arc;
//!
//! let mut builder = TopologyBuilder::new(8);
//! for cpu in 0..8 {
//!     builder = builder.cpu(cpu, 0, cpu / 2);
//! }
//! let hotplug = Arc::new(CpuHotplug::new(builder.build().unwrap()));
//! let planner = AffinityPlanner::new(hotplug);
//!
//! let nvecs = planner.feasible_vectors(16, 1, 0);
//! assert_eq!(nvecs, 9);
//!
//! let plan = planner.build_masks(nvecs, 1, 0).unwrap();
//! assert_eq!(plan.nr_spread(), 8);
//! assert_eq!(plan.get(0).unwrap().weight(), 8);
//! assert_eq!(plan.get(1).unwrap().to_cpulist(), "0");
//! ```

use crate::spread::spread_into;
use crate::CpuHotplug;
use crate::Cpumask;
use crate::Topology;
use anyhow::Result;
use log::debug;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

/// Backing storage for a mask or the mask array couldn't be obtained.
///
/// This is the only failure a planning call reports. It is returned inside
/// an `anyhow::Error` and can be told apart with
/// `err.downcast_ref::<AllocationFailure>()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationFailure {
    what: &'static str,
    count: usize,
}

impl AllocationFailure {
    pub(crate) fn cpumask(nr_cpu_ids: usize) -> Self {
        Self {
            what: "cpumask bits",
            count: nr_cpu_ids,
        }
    }

    pub(crate) fn mask_array(nvecs: usize) -> Self {
        Self {
            what: "affinity masks",
            count: nvecs,
        }
    }
}

impl fmt::Display for AllocationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Failed to allocate {} {}", self.count, self.what)
    }
}

impl std::error::Error for AllocationFailure {}

/// Shape of a device's vector table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinityRequest {
    pub total_vectors: usize,
    /// Vectors at the start of the table which don't need spreading.
    #[serde(default)]
    pub pre_vectors: usize,
    /// Vectors at the end of the table which don't need spreading.
    #[serde(default)]
    pub post_vectors: usize,
}

impl AffinityRequest {
    pub fn reserved(&self) -> usize {
        self.pre_vectors.saturating_add(self.post_vectors)
    }

    /// Number of vectors to spread, zero if the reserved vectors use up the
    /// whole table.
    pub fn spreadable(&self) -> usize {
        self.total_vectors.saturating_sub(self.reserved())
    }
}

/// Per-vector affinity masks, indexed by vector slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityPlan {
    masks: Vec<Cpumask>,
    pre_vectors: usize,
    post_vectors: usize,
    nr_spread: usize,
}

impl AffinityPlan {
    pub fn len(&self) -> usize {
        self.masks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    pub fn get(&self, slot: usize) -> Option<&Cpumask> {
        self.masks.get(slot)
    }

    pub fn masks(&self) -> &[Cpumask] {
        &self.masks
    }

    pub fn into_masks(self) -> Vec<Cpumask> {
        self.masks
    }

    pub fn pre_vectors(&self) -> usize {
        self.pre_vectors
    }

    pub fn post_vectors(&self) -> usize {
        self.post_vectors
    }

    /// Number of slots holding a spread mask. Falls short of the spreadable
    /// vector count when the topology ran out of CPUs to hand out, in which
    /// case the trailing unspread slots hold the default affinity.
    pub fn nr_spread(&self) -> usize {
        self.nr_spread
    }

    /// Slots holding spread masks. These are pairwise disjoint.
    pub fn spread_range(&self) -> Range<usize> {
        let start = self.pre_vectors.min(self.masks.len());
        start..start + self.nr_spread
    }

    pub fn spread_masks(&self) -> &[Cpumask] {
        &self.masks[self.spread_range()]
    }

    pub fn is_spread(&self, slot: usize) -> bool {
        self.spread_range().contains(&slot)
    }
}

pub struct AffinityPlanner {
    hotplug: Arc<CpuHotplug>,
    default_affinity: Option<Cpumask>,
}

impl AffinityPlanner {
    /// Plan against the topology guarded by `hotplug`. Reserved and
    /// unspreadable vectors default to all CPUs of the topology.
    pub fn new(hotplug: Arc<CpuHotplug>) -> AffinityPlanner {
        AffinityPlanner {
            hotplug,
            default_affinity: None,
        }
    }

    /// Use `mask` as the default affinity. CPUs beyond the topology's width
    /// are ignored.
    pub fn with_default_affinity(mut self, mask: Cpumask) -> AffinityPlanner {
        self.default_affinity = Some(mask);
        self
    }

    pub fn hotplug(&self) -> &Arc<CpuHotplug> {
        &self.hotplug
    }

    pub(crate) fn default_mask(&self, topo: &Topology) -> Result<Cpumask> {
        let mut mask = Cpumask::try_new(topo.nr_cpu_ids())?;
        match &self.default_affinity {
            Some(default) => {
                for cpu in default.iter().filter(|&cpu| cpu < topo.nr_cpu_ids()) {
                    mask.set_cpu(cpu)?;
                }
            }
            None => {
                for cpu in topo.cpus().keys() {
                    mask.set_cpu(*cpu)?;
                }
            }
        }
        Ok(mask)
    }

    /// How many vectors are worth allocating for a device supporting up to
    /// `maxvec` of them. Spreading more vectors than there are online CPUs
    /// is pointless, so the spreadable part is capped by the online CPU
    /// count. Never exceeds `maxvec`.
    pub fn feasible_vectors(&self, maxvec: usize, pre_vectors: usize, post_vectors: usize) -> usize {
        let resv = pre_vectors.saturating_add(post_vectors);
        let cpus = self.hotplug.read().nr_online_cpus();

        match maxvec.checked_sub(resv) {
            Some(vecs) => cpus.min(vecs) + resv,
            None => {
                debug!("{} reserved vectors exceed maximum {}", resv, maxvec);
                maxvec
            }
        }
    }

    /// [`AffinityPlanner::build_masks`] for a request struct.
    pub fn build_plan(&self, req: &AffinityRequest) -> Result<AffinityPlan> {
        self.build_masks(req.total_vectors, req.pre_vectors, req.post_vectors)
    }

    /// Build `nvecs` affinity masks, spreading the vectors between the
    /// reserved ones across the online CPUs.
    ///
    /// Fails only with [`AllocationFailure`], in which case nothing is
    /// returned.
    pub fn build_masks(
        &self,
        nvecs: usize,
        pre_vectors: usize,
        post_vectors: usize,
    ) -> Result<AffinityPlan> {
        let req = AffinityRequest {
            total_vectors: nvecs,
            pre_vectors,
            post_vectors,
        };
        let affv = req.spreadable();

        let mut masks: Vec<Cpumask> = Vec::new();
        masks
            .try_reserve_exact(nvecs)
            .map_err(|_| AllocationFailure::mask_array(nvecs))?;

        // Stabilize the cpumasks
        let topo = self.hotplug.read();
        let default = self.default_mask(&topo)?;

        if affv == 0 {
            while masks.len() < nvecs {
                masks.push(default.try_clone()?);
            }
            return Ok(AffinityPlan {
                masks,
                pre_vectors,
                post_vectors,
                nr_spread: 0,
            });
        }

        let mut nmsk = Cpumask::try_new(topo.nr_cpu_ids())?;
        let last_affv = pre_vectors + affv;

        // Fill out vectors at the beginning that don't need affinity
        while masks.len() < pre_vectors {
            masks.push(default.try_clone()?);
        }

        let mut nodes = topo.nr_online_nodes();
        if affv <= nodes {
            // Enough nodes to give every vector a node of its own.
            for node in topo.online_nodes() {
                if masks.len() == last_affv {
                    break;
                }
                masks.push(node.span().try_clone()?);
            }
        } else {
            for node in topo.online_nodes() {
                if masks.len() >= last_affv || nodes == 0 {
                    break;
                }

                // Spread the vectors per node
                let assigned = masks.len() - pre_vectors;
                let vecs_per_node = (affv - assigned) / nodes;

                // Get the cpus on this node which are online
                nmsk.copy_from(topo.online());
                nmsk &= node.span();

                let ncpus = nmsk.weight();
                let vecs_to_assign = vecs_per_node.min(ncpus);
                nodes -= 1;
                if vecs_to_assign == 0 {
                    continue;
                }

                // Account for rounding errors
                let cpus_per_vec = ncpus / vecs_to_assign;
                let mut extra_vecs = ncpus - vecs_to_assign * cpus_per_vec;

                debug!(
                    "node{}: {} cpus for {} vectors, {} cpus/vec, {} with one extra",
                    node.id(),
                    ncpus,
                    vecs_to_assign,
                    cpus_per_vec,
                    extra_vecs
                );

                for _ in 0..vecs_to_assign {
                    if masks.len() >= last_affv {
                        break;
                    }

                    let mut nr_cpus = cpus_per_vec;
                    if extra_vecs > 0 {
                        nr_cpus += 1;
                        extra_vecs -= 1;
                    }

                    let mut irqmsk = Cpumask::try_new(topo.nr_cpu_ids())?;
                    spread_into(&topo, &mut irqmsk, &mut nmsk, nr_cpus);
                    masks.push(irqmsk);
                }
            }
        }

        let nr_spread = masks.len() - pre_vectors;
        drop(topo);

        if nr_spread < affv {
            debug!(
                "spread {} of {} vectors, the rest use the default affinity",
                nr_spread, affv
            );
        }

        // Fill out vectors at the end that don't need affinity
        while masks.len() < nvecs {
            masks.push(default.try_clone()?);
        }

        Ok(AffinityPlan {
            masks,
            pre_vectors,
            post_vectors,
            nr_spread,
        })
    }
}
