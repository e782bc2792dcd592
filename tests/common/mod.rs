#![allow(dead_code)]

use std::sync::Arc;

use scx_irq_affinity::{AffinityPlan, AffinityPlanner, CpuHotplug, Cpumask, Topology, TopologyBuilder};

/// Route planner logs through the test harness' captured output.
///
/// `TestLogger::init()` fails once a logger is installed, so every test can
/// call this.
pub fn setup_test() {
    let _ = simplelog::TestLogger::init(simplelog::LevelFilter::Debug, simplelog::Config::default());
}

/// One node per entry of `node_cpus`, holding that many CPUs with
/// consecutive IDs. Every `smt` consecutive CPUs of a node form a core.
pub fn topology(node_cpus: &[usize], smt: usize) -> Topology {
    let nr_cpus: usize = node_cpus.iter().sum();
    let mut builder = TopologyBuilder::new(nr_cpus);
    let mut cpu = 0;
    for (node, &ncpus) in node_cpus.iter().enumerate() {
        for i in 0..ncpus {
            let core = cpu - i + (i / smt) * smt;
            builder = builder.cpu(cpu, node, core);
            cpu += 1;
        }
    }
    builder.build().unwrap()
}

pub fn planner(topo: Topology) -> AffinityPlanner {
    AffinityPlanner::new(Arc::new(CpuHotplug::new(topo)))
}

pub fn cpulists(masks: &[Cpumask]) -> Vec<String> {
    masks.iter().map(|m| m.to_cpulist()).collect()
}

/// Check the structural guarantees every plan gives: spread masks are
/// non-empty and pairwise disjoint and only hold online CPUs, everything
/// else holds `default`.
pub fn assert_valid(plan: &AffinityPlan, online: &Cpumask, default: &Cpumask) {
    let mut seen = Cpumask::new(online.len());
    for (slot, mask) in plan.masks().iter().enumerate() {
        if !plan.is_spread(slot) {
            assert_eq!(mask, default, "slot {slot} should hold the default mask");
            continue;
        }
        assert!(mask.weight() >= 1, "spread slot {slot} is empty");
        assert!(
            !mask.intersects(&seen),
            "spread slot {slot} ({}) overlaps earlier slots ({})",
            mask.to_cpulist(),
            seen.to_cpulist()
        );
        assert!(mask.and_not(online).is_empty(), "slot {slot} holds offline CPUs");
        seen |= mask;
    }
}

/// Union of all spread masks of `plan`.
pub fn spread_union(plan: &AffinityPlan, nr_cpu_ids: usize) -> Cpumask {
    let mut union = Cpumask::new(nr_cpu_ids);
    for mask in plan.spread_masks() {
        union |= mask;
    }
    union
}
