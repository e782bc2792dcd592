// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Hotplug stabilization of the live topology.
//!
//! Planners hold a [`HotplugReadGuard`] for the whole computation, so the set
//! of online CPUs can't change under them. Any number of planners may hold
//! the read side at once. CPU online/offline transitions take the write side
//! and therefore wait for in-flight plans to finish.

use crate::Topology;
use anyhow::Result;
use log::debug;
use std::ops::Deref;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;

#[derive(Debug)]
pub struct CpuHotplug {
    topo: RwLock<Topology>,
}

/// Pins the topology against hotplug transitions until dropped.
pub struct HotplugReadGuard<'a> {
    guard: RwLockReadGuard<'a, Topology>,
}

impl Deref for HotplugReadGuard<'_> {
    type Target = Topology;

    fn deref(&self) -> &Topology {
        &self.guard
    }
}

impl CpuHotplug {
    pub fn new(topo: Topology) -> CpuHotplug {
        CpuHotplug {
            topo: RwLock::new(topo),
        }
    }

    /// Stabilize the topology. Released when the guard is dropped.
    pub fn read(&self) -> HotplugReadGuard<'_> {
        // Writers either finish an update or bail before touching the
        // topology, so a poisoned lock still guards a consistent value.
        let guard = self.topo.read().unwrap_or_else(PoisonError::into_inner);
        HotplugReadGuard { guard }
    }

    /// Bring `cpu` online or take it offline.
    pub fn set_cpu_online(&self, cpu: usize, online: bool) -> Result<()> {
        let mut topo = self.topo.write().unwrap_or_else(PoisonError::into_inner);
        topo.set_cpu_online(cpu, online)?;
        debug!(
            "cpu{} {}, {} CPUs online",
            cpu,
            if online { "up" } else { "down" },
            topo.nr_online_cpus()
        );
        Ok(())
    }

    /// Swap in a freshly read topology, e.g. after rescanning sysfs.
    pub fn replace(&self, new_topo: Topology) -> Topology {
        let mut topo = self.topo.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *topo, new_topo)
    }
}
