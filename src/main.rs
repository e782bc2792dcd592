// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::debug;
use log::info;
use scx_irq_affinity::vector_cpu;
use scx_irq_affinity::AffinityPlanner;
use scx_irq_affinity::AffinityRequest;
use scx_irq_affinity::CpuHotplug;
use scx_irq_affinity::Cpumask;
use scx_irq_affinity::Topology;
use scx_irq_affinity::NR_CPU_IDS;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Show how interrupt vectors of a multi-queue device would be spread over
/// the CPUs of this machine.
///
/// The device's vector table is sized to what's useful on the current
/// topology and each vector gets an affinity mask. Reserved vectors at the
/// start and end of the table keep the default affinity.
#[derive(Debug, Parser)]
struct Opts {
    /// Maximum number of vectors the device supports.
    #[clap(short = 'n', long, default_value = "32")]
    vectors: usize,

    /// Reserved vectors at the start of the table.
    #[clap(long, default_value = "0")]
    pre: usize,

    /// Reserved vectors at the end of the table.
    #[clap(long, default_value = "0")]
    post: usize,

    /// Plan a single mask with one CPU per vector instead of one mask per
    /// vector.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    single: bool,

    /// Default affinity for reserved and unspread vectors as a hex mask.
    /// Defaults to all CPUs.
    #[clap(long)]
    default_affinity: Option<String>,

    /// Read the topology from a sysfs tree mounted under this directory.
    #[clap(long, default_value = "/")]
    sysfs_root: PathBuf,

    /// Print the plan as JSON.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    json: bool,

    /// Enable verbose output, including debug messages from the planner.
    /// Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Serialize)]
struct VectorReport {
    vector: usize,
    spread: bool,
    cpus: String,
    mask: String,
}

#[derive(Debug, Serialize)]
struct PlanReport {
    request: AffinityRequest,
    online_cpus: usize,
    nodes: usize,
    vectors: Vec<VectorReport>,
}

fn report_masks(planner: &AffinityPlanner, opts: &Opts) -> Result<PlanReport> {
    let (online_cpus, nodes) = {
        let topo = planner.hotplug().read();
        (topo.nr_online_cpus(), topo.nr_online_nodes())
    };

    let total_vectors = planner.feasible_vectors(opts.vectors, opts.pre, opts.post);
    let request = AffinityRequest {
        total_vectors,
        pre_vectors: opts.pre,
        post_vectors: opts.post,
    };
    info!(
        "{} of {} vectors usable on {} CPUs in {} nodes",
        total_vectors, opts.vectors, online_cpus, nodes
    );

    let plan = planner.build_plan(&request)?;
    let vectors = plan
        .masks()
        .iter()
        .enumerate()
        .map(|(vector, mask)| VectorReport {
            vector,
            spread: plan.is_spread(vector),
            cpus: mask.to_cpulist(),
            mask: format!("{mask:x}"),
        })
        .collect();

    Ok(PlanReport {
        request,
        online_cpus,
        nodes,
        vectors,
    })
}

fn report_single(planner: &AffinityPlanner, opts: &Opts) -> Result<PlanReport> {
    let (online_cpus, nodes) = {
        let topo = planner.hotplug().read();
        (topo.nr_online_cpus(), topo.nr_online_nodes())
    };

    let mask = planner.build_single_mask(opts.vectors)?;
    let vectors = match &mask {
        None => {
            info!("single vector, using the default affinity");
            vec![]
        }
        // Vectors past the mask's weight wrap around to the same CPUs.
        Some(mask) => (0..opts.vectors.min(mask.weight()))
            .filter_map(|vector| {
                vector_cpu(mask, vector).map(|cpu| VectorReport {
                    vector,
                    spread: true,
                    cpus: cpu.to_string(),
                    mask: format!("{mask:x}"),
                })
            })
            .collect(),
    };

    Ok(PlanReport {
        request: AffinityRequest {
            total_vectors: opts.vectors,
            ..Default::default()
        },
        online_cpus,
        nodes,
        vectors,
    })
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let topo = Topology::from_sysfs(&opts.sysfs_root)
        .with_context(|| format!("Failed to read topology under {:?}", opts.sysfs_root))?;

    let nr_cpu_ids = topo.nr_cpu_ids();
    if nr_cpu_ids != *NR_CPU_IDS {
        debug!(
            "topology under {:?} has {} CPU IDs, this host has {}",
            opts.sysfs_root, nr_cpu_ids, *NR_CPU_IDS
        );
    }
    let mut planner = AffinityPlanner::new(Arc::new(CpuHotplug::new(topo)));
    if let Some(default) = &opts.default_affinity {
        let mask = Cpumask::from_str(default, nr_cpu_ids)?;
        planner = planner.with_default_affinity(mask);
    }

    let report = if opts.single {
        report_single(&planner, &opts)?
    } else {
        report_masks(&planner, &opts)?
    };

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for vec in report.vectors.iter() {
        println!(
            "vec{:<4} {:<8} {:<24} {}",
            vec.vector,
            if vec.spread { "spread" } else { "default" },
            vec.cpus,
            vec.mask
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use scx_irq_affinity::TopologyBuilder;

    fn planner(nr_cpus: usize) -> AffinityPlanner {
        let mut builder = TopologyBuilder::new(nr_cpus);
        for cpu in 0..nr_cpus {
            builder = builder.cpu(cpu, 0, cpu);
        }
        AffinityPlanner::new(Arc::new(CpuHotplug::new(builder.build().unwrap())))
    }

    #[test]
    fn test_report_single_capped_by_mask() {
        let opts = Opts::parse_from(["scx_irq_affinity", "--single", "-n", "100000"]);
        let report = report_single(&planner(4), &opts).unwrap();
        assert_eq!(report.request.total_vectors, 100000);
        let cpus: Vec<&str> = report.vectors.iter().map(|v| v.cpus.as_str()).collect();
        assert_eq!(cpus, vec!["0", "1", "2", "3"]);
    }

    #[test]
    fn test_report_single_fewer_vectors() {
        let opts = Opts::parse_from(["scx_irq_affinity", "--single", "-n", "2"]);
        let report = report_single(&planner(4), &opts).unwrap();
        assert_eq!(report.vectors.len(), 2);

        let opts = Opts::parse_from(["scx_irq_affinity", "--single", "-n", "1"]);
        assert!(report_single(&planner(4), &opts).unwrap().vectors.is_empty());
    }

    #[test]
    fn test_report_masks() {
        let opts = Opts::parse_from(["scx_irq_affinity", "-n", "64", "--pre", "1"]);
        let report = report_masks(&planner(4), &opts).unwrap();
        assert_eq!(report.request.total_vectors, 5);
        assert!(!report.vectors[0].spread);
        assert_eq!(report.vectors[1].cpus, "0");
        assert_eq!(report.vectors[1].mask, "1");
    }
}
