// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Interrupt vector affinity planning
//!
//! Devices with multiple queues, e.g. NVMe controllers and multi-queue NICs,
//! get one MSI/MSI-X vector per queue. How those vectors are pointed at CPUs
//! decides whether interrupt handling stays local to the submitting CPU and
//! how evenly it is spread over the machine.
//!
//! This crate plans those affinities. Given the number of vectors a device
//! wants and a snapshot of the CPU topology, it partitions the online CPUs
//! into disjoint per-vector masks along NUMA node and SMT core boundaries.
//!
//! ## Topology
//!
//! [`Topology`] is a read-only view of online CPUs, their NUMA nodes and
//! SMT siblings, read from sysfs or assembled with [`TopologyBuilder`].
//! [`CpuHotplug`] keeps the live topology stable while plans are computed.
//!
//! ## Planning
//!
//! [`AffinityPlanner`] sizes the vector table ([`AffinityPlanner::feasible_vectors`]),
//! builds one mask per vector ([`AffinityPlanner::build_masks`]) or a single
//! mask with one CPU per vector ([`AffinityPlanner::build_single_mask`]).
//! Resulting [`AffinityPlan`]s can be handed to an [`IrqChip`].

mod cpumask;
pub use cpumask::read_cpulist;
pub use cpumask::Cpumask;
pub use cpumask::CpumaskIterator;

mod topology;
pub use topology::Core;
pub use topology::Cpu;
pub use topology::Node;
pub use topology::Topology;
pub use topology::TopologyBuilder;
pub use topology::NR_CPU_IDS;

mod hotplug;
pub use hotplug::CpuHotplug;
pub use hotplug::HotplugReadGuard;

mod spread;
pub use spread::spread_into;

mod affinity;
pub use affinity::AffinityPlan;
pub use affinity::AffinityPlanner;
pub use affinity::AffinityRequest;
pub use affinity::AllocationFailure;

mod single;
pub use single::vector_cpu;

mod irq;
pub use irq::irq_affinity_set;
pub use irq::IrqChip;
pub use irq::SetAffinity;
