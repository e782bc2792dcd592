// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use crate::Cpumask;
use crate::Topology;
use log::warn;

/// Move up to `cpus_per_vec` CPUs from `nmsk` into `irqmsk`.
///
/// CPUs are picked lowest first. Once a CPU is picked, its SMT siblings still
/// left in `nmsk` are taken before moving on, so a vector's CPUs share cores
/// where possible. Returns the number of CPUs actually moved, which is only
/// less than `cpus_per_vec` when `nmsk` runs dry.
pub fn spread_into(
    topo: &Topology,
    irqmsk: &mut Cpumask,
    nmsk: &mut Cpumask,
    cpus_per_vec: usize,
) -> usize {
    let mut left = cpus_per_vec;

    while left > 0 {
        let cpu = match nmsk.first() {
            Some(cpu) => cpu,
            None => {
                // Per-node accounting hands out exactly the node's weight.
                warn!(
                    "ran out of CPUs spreading vector, {} of {} unassigned",
                    left, cpus_per_vec
                );
                break;
            }
        };

        if !nmsk.move_cpu(cpu, irqmsk) {
            break;
        }
        left -= 1;

        let siblings = match topo.siblings_of(cpu) {
            Some(siblings) => siblings,
            None => continue,
        };
        for sibl in siblings.iter() {
            if left == 0 {
                break;
            }
            if nmsk.move_cpu(sibl, irqmsk) {
                left -= 1;
            }
        }
    }

    cpus_per_vec - left
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TopologyBuilder;

    // 8 CPUs, SMT2 with siblings n and n+4.
    fn smt_topo() -> Topology {
        let mut builder = TopologyBuilder::new(8);
        for cpu in 0..8 {
            builder = builder.cpu(cpu, 0, cpu % 4);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_siblings_first() {
        let topo = smt_topo();
        let mut nmsk = topo.online().clone();
        let mut irqmsk = Cpumask::new(8);

        assert_eq!(spread_into(&topo, &mut irqmsk, &mut nmsk, 2), 2);
        assert_eq!(irqmsk.to_cpulist(), "0,4");
        assert_eq!(nmsk.to_cpulist(), "1-3,5-7");
    }

    #[test]
    fn test_odd_capacity_spills_to_next_core() {
        let topo = smt_topo();
        let mut nmsk = topo.online().clone();
        let mut irqmsk = Cpumask::new(8);

        assert_eq!(spread_into(&topo, &mut irqmsk, &mut nmsk, 3), 3);
        assert_eq!(irqmsk.to_cpulist(), "0-1,4");

        let mut second = Cpumask::new(8);
        assert_eq!(spread_into(&topo, &mut second, &mut nmsk, 3), 3);
        assert_eq!(second.to_cpulist(), "2-3,6");
        assert_eq!(nmsk.to_cpulist(), "5,7");
    }

    #[test]
    fn test_sibling_outside_working_set() {
        let topo = smt_topo();
        let mut nmsk = Cpumask::from_cpulist("0-3", 8).unwrap();
        let mut irqmsk = Cpumask::new(8);

        assert_eq!(spread_into(&topo, &mut irqmsk, &mut nmsk, 2), 2);
        assert_eq!(irqmsk.to_cpulist(), "0-1");
    }

    #[test]
    fn test_exhausted() {
        let topo = smt_topo();
        let mut nmsk = Cpumask::from_cpulist("6", 8).unwrap();
        let mut irqmsk = Cpumask::new(8);

        assert_eq!(spread_into(&topo, &mut irqmsk, &mut nmsk, 4), 1);
        assert_eq!(irqmsk.to_cpulist(), "6");
        assert!(nmsk.is_empty());

        assert_eq!(spread_into(&topo, &mut irqmsk, &mut nmsk, 0), 0);
    }
}
