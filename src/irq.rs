// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Handing affinity masks to an interrupt controller.

use crate::AffinityPlan;
use crate::Cpumask;
use anyhow::bail;
use anyhow::Result;
use log::error;

/// Outcome of a controller's affinity update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetAffinity {
    Applied,
    /// The controller has no vector left on the target CPUs.
    NoSpace,
}

/// Interrupt controller operations needed to retarget a line.
pub trait IrqChip {
    /// Whether `irq` can be retargeted while it's live. Lines which can't are
    /// masked around the update.
    fn can_move_in_process_context(&self, _irq: u32) -> bool {
        true
    }

    /// Whether the line is masked by the interrupt core, e.g. lazily
    /// disabled. Such lines stay masked after the update.
    fn masked_by_core(&self, _irq: u32) -> bool {
        false
    }

    fn mask(&mut self, _irq: u32) {}

    fn unmask(&mut self, _irq: u32) {}

    /// Retarget `irq` to `mask`. `None` if the controller doesn't support
    /// affinity at all.
    fn set_affinity(&mut self, _irq: u32, _mask: &Cpumask) -> Option<SetAffinity> {
        None
    }
}

/// Retarget `irq` to `mask`, masking the line around the update if needed.
/// Returns whether the controller supports setting affinity.
pub fn irq_affinity_set<C: IrqChip + ?Sized>(chip: &mut C, irq: u32, mask: &Cpumask) -> bool {
    let must_mask = !chip.can_move_in_process_context(irq);
    if must_mask {
        chip.mask(irq);
    }

    let ret = match chip.set_affinity(irq, mask) {
        Some(SetAffinity::Applied) => true,
        Some(SetAffinity::NoSpace) => {
            error!(
                "IRQ {} set affinity failed because there are no available vectors. The device assigned to this IRQ is unstable.",
                irq
            );
            true
        }
        None => false,
    };

    if must_mask && !chip.masked_by_core(irq) {
        chip.unmask(irq);
    }

    ret
}

impl AffinityPlan {
    /// Hand slot `n`'s mask to `irqs[n]`, one controller call per slot.
    /// Returns the number of lines the controller accepted an affinity for.
    pub fn apply<C: IrqChip + ?Sized>(&self, irqs: &[u32], chip: &mut C) -> Result<usize> {
        if irqs.len() != self.len() {
            bail!(
                "{} IRQs passed for a plan of {} vectors",
                irqs.len(),
                self.len()
            );
        }

        let mut applied = 0;
        for (irq, mask) in irqs.iter().zip(self.masks()) {
            if irq_affinity_set(chip, *irq, mask) {
                applied += 1;
            }
        }
        Ok(applied)
    }
}
