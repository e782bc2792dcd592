// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Single mask spreading for vector tables without reserved vectors.
//!
//! Instead of one mask per vector, a single mask holds at most one CPU per
//! vector. Vector `n` is serviced by the `n`th CPU of the mask, wrapping
//! around when there are more vectors than CPUs.

use crate::AffinityPlanner;
use crate::Cpumask;
use anyhow::Result;
use log::debug;

impl AffinityPlanner {
    /// Build a mask with one CPU for each of `nr_vecs` vectors.
    ///
    /// Returns `None` when no mask is needed because a single vector (or
    /// none) just uses the default affinity. With at least as many vectors
    /// as online CPUs, all online CPUs are used. Otherwise the lowest online
    /// CPU of each core is picked, spreading the vectors over cores before
    /// doubling up on SMT siblings.
    pub fn build_single_mask(&self, nr_vecs: usize) -> Result<Option<Cpumask>> {
        if nr_vecs <= 1 {
            return Ok(None);
        }

        let topo = self.hotplug().read();
        let mut mask = Cpumask::try_new(topo.nr_cpu_ids())?;

        if nr_vecs >= topo.nr_online_cpus() {
            mask.copy_from(topo.online());
            return Ok(Some(mask));
        }

        let mut left = nr_vecs;
        for cpu in topo.online().iter() {
            let first_sibling = topo
                .siblings_of(cpu)
                .and_then(|siblings| siblings.iter().find(|s| topo.online().test_cpu(*s)))
                .unwrap_or(cpu);
            if first_sibling != cpu {
                continue;
            }

            mask.set_cpu(cpu)?;
            left -= 1;
            if left == 0 {
                break;
            }
        }

        debug!("single mask {} for {} vectors", mask.to_cpulist(), nr_vecs);
        Ok(Some(mask))
    }
}

/// CPU servicing vector `vec` under a mask from
/// [`AffinityPlanner::build_single_mask`]. Vectors beyond the mask's weight
/// wrap around to its start.
pub fn vector_cpu(mask: &Cpumask, vec: usize) -> Option<usize> {
    match mask.weight() {
        0 => None,
        nr_cpus => mask.nth_cpu(vec % nr_cpus),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CpuHotplug;
    use crate::Topology;
    use crate::TopologyBuilder;
    use std::sync::Arc;

    fn planner(topo: Topology) -> AffinityPlanner {
        AffinityPlanner::new(Arc::new(CpuHotplug::new(topo)))
    }

    // 2 nodes x 2 cores x SMT2. Siblings are n and n+4.
    fn smt_topo() -> Topology {
        let mut builder = TopologyBuilder::new(8);
        for cpu in 0..8 {
            builder = builder.cpu(cpu, (cpu % 4) / 2, cpu % 4);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_single_vector_needs_no_mask() {
        let planner = planner(smt_topo());
        assert!(planner.build_single_mask(1).unwrap().is_none());
        assert!(planner.build_single_mask(0).unwrap().is_none());
    }

    #[test]
    fn test_enough_vectors_for_all_cpus() {
        let planner = planner(smt_topo());
        let mask = planner.build_single_mask(8).unwrap().unwrap();
        assert_eq!(mask.to_cpulist(), "0-7");
        let mask = planner.build_single_mask(32).unwrap().unwrap();
        assert_eq!(mask.to_cpulist(), "0-7");
    }

    #[test]
    fn test_one_cpu_per_core() {
        let planner = planner(smt_topo());
        let mask = planner.build_single_mask(2).unwrap().unwrap();
        assert_eq!(mask.to_cpulist(), "0-1");

        // Only 4 cores, so 6 vectors still get one CPU per core.
        let mask = planner.build_single_mask(6).unwrap().unwrap();
        assert_eq!(mask.to_cpulist(), "0-3");
    }

    #[test]
    fn test_mutual_siblings() {
        let topo = TopologyBuilder::new(2)
            .cpu(0, 0, 0)
            .cpu(1, 0, 0)
            .build()
            .unwrap();
        let mask = planner(topo).build_single_mask(5).unwrap().unwrap();
        assert_eq!(mask.to_cpulist(), "0-1");
    }

    #[test]
    fn test_offline_first_sibling() {
        let mut builder = TopologyBuilder::new(8);
        for cpu in 0..8 {
            builder = builder.cpu(cpu, 0, cpu % 4);
        }
        let topo = builder.offline(0).build().unwrap();

        // cpu4 stands in for its offline sibling cpu0.
        let mask = planner(topo).build_single_mask(4).unwrap().unwrap();
        assert_eq!(mask.to_cpulist(), "1-4");
    }

    #[test]
    fn test_vector_cpu() {
        let mask = Cpumask::from_cpulist("1,3,5", 8).unwrap();
        assert_eq!(vector_cpu(&mask, 0), Some(1));
        assert_eq!(vector_cpu(&mask, 2), Some(5));
        assert_eq!(vector_cpu(&mask, 3), Some(1));
        assert_eq!(vector_cpu(&Cpumask::new(8), 0), None);
    }
}
