// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cpumask
//!
//! Fixed-width CPU sets used both to describe the topology and to carry the
//! per-vector affinity masks produced by the planner.
//!
//! A Cpumask is a BitVec of u64's whose width is the `nr_cpu_ids` of the
//! topology it was derived from. All masks flowing through one planning call
//! share that width, so the set operations below never have to reconcile
//! differently sized operands.
//!
//!```
//!     use scx_irq_affinity::Cpumask;
//!     let mut mask = Cpumask::new(8);
//!     assert!(!mask.test_cpu(0));
//!     mask.set_cpu(0).unwrap();
//!     assert!(mask.test_cpu(0));
//!     assert_eq!(mask.weight(), 1);
//!
//!     let other = Cpumask::from_cpulist("0-3", 8).unwrap();
//!     assert_eq!(format!("{other}"), "0f");
//!```
//!
//! Masks used as working sets or handed out in a plan are allocated with
//! [`Cpumask::try_new`] / [`Cpumask::try_clone`], which report exhaustion as
//! [`AllocationFailure`] instead of aborting.

use crate::AllocationFailure;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use bitvec::prelude::*;
use sscanf::sscanf;
use std::fmt;
use std::ops::BitAndAssign;
use std::ops::BitOrAssign;
use std::ops::BitXorAssign;

#[derive(Debug, Eq, Clone, Hash, Ord, PartialEq, PartialOrd)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu >= self.len() {
            bail!("Invalid CPU {} passed, max {}", cpu, self.len());
        }

        Ok(())
    }

    /// Build a new empty Cpumask able to hold CPUs `0..nr_cpu_ids`.
    pub fn new(nr_cpu_ids: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 0; nr_cpu_ids],
        }
    }

    /// Build a new empty Cpumask, reporting allocation failure instead of
    /// aborting.
    pub fn try_new(nr_cpu_ids: usize) -> Result<Cpumask, AllocationFailure> {
        let nr_words = nr_cpu_ids.div_ceil(u64::BITS as usize);
        let mut words: Vec<u64> = Vec::new();
        words
            .try_reserve_exact(nr_words)
            .map_err(|_| AllocationFailure::cpumask(nr_cpu_ids))?;
        words.resize(nr_words, 0);

        let mut mask = BitVec::from_vec(words);
        mask.truncate(nr_cpu_ids);
        Ok(Self { mask })
    }

    /// Fallible counterpart of `clone()`.
    pub fn try_clone(&self) -> Result<Cpumask, AllocationFailure> {
        let src = self.as_raw_slice();
        let mut words: Vec<u64> = Vec::new();
        words
            .try_reserve_exact(src.len())
            .map_err(|_| AllocationFailure::cpumask(self.len()))?;
        words.extend_from_slice(src);

        let mut mask = BitVec::from_vec(words);
        mask.truncate(self.len());
        Ok(Self { mask })
    }

    /// Build a Cpumask object from a hexadecimal string. Comma separated
    /// 32bit groups as found in /proc/irq/*/smp_affinity are accepted.
    pub fn from_str(cpumask: &str, nr_cpu_ids: usize) -> Result<Cpumask> {
        match cpumask {
            "none" => return Ok(Self::new(nr_cpu_ids)),
            "all" => {
                let mask = bitvec![u64, Lsb0; 1; nr_cpu_ids];
                return Ok(Self { mask });
            }
            _ => {}
        }
        let hex_str = {
            let mut tmp_str = cpumask
                .trim()
                .strip_prefix("0x")
                .unwrap_or(cpumask.trim())
                .replace(['_', ','], "");
            if tmp_str.len() % 2 != 0 {
                tmp_str = "0".to_string() + &tmp_str;
            }
            tmp_str
        };
        let byte_vec =
            hex::decode(&hex_str).with_context(|| format!("Failed to parse cpumask: {cpumask}"))?;

        let mut mask = bitvec![u64, Lsb0; 0; nr_cpu_ids];
        for (index, &val) in byte_vec.iter().rev().enumerate() {
            let mut v = val;
            while v != 0 {
                let lsb = v.trailing_zeros() as usize;
                v &= !(1 << lsb);
                let cpu = index * 8 + lsb;
                if cpu >= nr_cpu_ids {
                    bail!(
                        concat!(
                            "Found cpu ({}) in cpumask ({}) which is larger",
                            " than the number of cpus on the machine ({})"
                        ),
                        cpu,
                        cpumask,
                        nr_cpu_ids
                    );
                }
                mask.set(cpu, true);
            }
        }

        Ok(Self { mask })
    }

    pub fn from_cpulist(cpulist: &str, nr_cpu_ids: usize) -> Result<Cpumask> {
        let mut mask = Cpumask::new(nr_cpu_ids);
        for cpu_id in read_cpulist(cpulist)? {
            mask.set_cpu(cpu_id)
                .with_context(|| format!("Failed to parse cpulist {cpulist}"))?;
        }

        Ok(mask)
    }

    /// Return a slice of u64's whose bits reflect the Cpumask.
    pub fn as_raw_slice(&self) -> &[u64] {
        self.mask.as_raw_slice()
    }

    /// Return the raw BitVec object backing the Cpumask.
    pub fn as_raw_bitvec(&self) -> &BitVec<u64, Lsb0> {
        &self.mask
    }

    /// Set all bits in the Cpumask to 1
    pub fn set_all(&mut self) {
        self.mask.fill(true);
    }

    /// Set all bits in the Cpumask to 0
    pub fn clear_all(&mut self) {
        self.mask.fill(false);
    }

    /// Set a bit in the Cpumask. Returns an error if the specified CPU exceeds
    /// the size of the Cpumask.
    pub fn set_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, true);
        Ok(())
    }

    /// Clear a bit from the Cpumask. Returns an error if the specified CPU
    /// exceeds the size of the Cpumask.
    pub fn clear_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, false);
        Ok(())
    }

    /// Test whether the specified CPU bit is set in the Cpumask. If the CPU
    /// exceeds the width of the mask, false is returned.
    pub fn test_cpu(&self, cpu: usize) -> bool {
        match self.mask.get(cpu) {
            Some(bit) => *bit,
            None => false,
        }
    }

    /// Clear `cpu` and return whether it was set.
    pub fn test_and_clear_cpu(&mut self, cpu: usize) -> bool {
        if cpu >= self.len() {
            return false;
        }
        self.mask.replace(cpu, false)
    }

    /// Move `cpu` from this mask into `dst`. Returns false, leaving both
    /// masks untouched, if `cpu` wasn't set here or doesn't fit in `dst`.
    pub fn move_cpu(&mut self, cpu: usize, dst: &mut Cpumask) -> bool {
        if cpu >= dst.len() || !self.test_and_clear_cpu(cpu) {
            return false;
        }
        dst.mask.set(cpu, true);
        true
    }

    /// Lowest CPU set in the mask.
    pub fn first(&self) -> Option<usize> {
        self.mask.first_one()
    }

    /// The `n`th set CPU in ascending order.
    pub fn nth_cpu(&self, n: usize) -> Option<usize> {
        self.mask.iter_ones().nth(n)
    }

    /// Count the number of bits set in the Cpumask.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    /// Return true if the Cpumask has no bit set, false otherwise.
    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    /// Return true if the Cpumask has all bits set, false otherwise.
    pub fn is_full(&self) -> bool {
        self.mask.all()
    }

    /// The total size of the cpumask.
    pub fn len(&self) -> usize {
        self.mask.len()
    }

    /// Whether the two masks share at least one CPU.
    pub fn intersects(&self, other: &Cpumask) -> bool {
        self.mask
            .iter_ones()
            .any(|cpu| other.test_cpu(cpu))
    }

    /// Overwrite this mask with the contents of `src` without reallocating
    /// when the widths match.
    pub fn copy_from(&mut self, src: &Cpumask) {
        if self.len() == src.len() {
            self.mask.copy_from_bitslice(&src.mask);
        } else {
            self.mask.clone_from(&src.mask);
        }
    }

    /// Create a Cpumask that is the negation of the current Cpumask.
    pub fn not(&self) -> Cpumask {
        let mut new = self.clone();
        new.mask = !new.mask;
        new
    }

    /// Create a Cpumask that is the AND of the current Cpumask and another.
    pub fn and(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask &= other.mask.clone();
        new
    }

    /// Create a Cpumask holding the CPUs of the current Cpumask which are not
    /// in `other`.
    pub fn and_not(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask &= !other.mask.clone();
        new
    }

    /// Create a Cpumask that is the OR of the current Cpumask and another.
    pub fn or(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask |= other.mask.clone();
        new
    }

    /// Create a Cpumask that is the XOR of the current Cpumask and another.
    pub fn xor(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask ^= other.mask.clone();
        new
    }

    /// Iterate over each element of a Cpumask, and return the indices with bits
    /// set in ascending order.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use scx_irq_affinity::Cpumask;
    /// let mask = Cpumask::from_str("all", 4).unwrap();
    /// let cpus: Vec<usize> = mask.iter().collect();
    /// assert_eq!(cpus, vec![0, 1, 2, 3]);
    /// ```
    pub fn iter(&self) -> CpumaskIterator<'_> {
        CpumaskIterator {
            mask: self,
            index: 0,
        }
    }

    /// Format the mask in kernel cpulist syntax, e.g. "0-3,8,10-11".
    pub fn to_cpulist(&self) -> String {
        let mut groups: Vec<String> = Vec::new();
        let mut run: Option<(usize, usize)> = None;

        for cpu in self.iter() {
            run = match run {
                Some((first, last)) if last + 1 == cpu => Some((first, cpu)),
                Some(prev) => {
                    groups.push(fmt_cpu_range(prev));
                    Some((cpu, cpu))
                }
                None => Some((cpu, cpu)),
            };
        }
        if let Some(prev) = run {
            groups.push(fmt_cpu_range(prev));
        }

        groups.join(",")
    }

    fn fmt_with(&self, f: &mut fmt::Formatter<'_>, case: char) -> fmt::Result {
        let nr_cpu_ids = self.len();
        let mut masks: Vec<u32> = self
            .as_raw_slice()
            .iter()
            .flat_map(|x| [*x as u32, (x >> 32) as u32])
            .collect();

        // Throw out possible stray from u64 -> u32.
        masks.truncate(nr_cpu_ids.div_ceil(32).max(1));

        // Print the highest 32bit. Trim digits beyond nr_cpu_ids.
        let width = match nr_cpu_ids.div_ceil(4) % 8 {
            0 => 8,
            v => v,
        };
        let top = masks.pop().unwrap_or(0);
        match case {
            'x' => write!(f, "{:0width$x}", top, width = width)?,
            'X' => write!(f, "{:0width$X}", top, width = width)?,
            _ => unreachable!(),
        }

        // The rest in descending order.
        for submask in masks.iter().rev() {
            match case {
                'x' => write!(f, ",{submask:08x}")?,
                'X' => write!(f, ",{submask:08X}")?,
                _ => unreachable!(),
            }
        }
        Ok(())
    }
}

fn fmt_cpu_range((first, last): (usize, usize)) -> String {
    if first == last {
        format!("{first}")
    } else {
        format!("{first}-{last}")
    }
}

pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim_end_matches('\0').trim();
    let mut cpu_ids = vec![];
    if cpulist.is_empty() {
        return Ok(cpu_ids);
    }

    for group in cpulist.split(',') {
        let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
            Ok((x, y)) => (x, y),
            Err(_) => match sscanf!(group.trim(), "{usize}") {
                Ok(x) => (x, x),
                Err(_) => {
                    bail!("Failed to parse cpulist {}", group.trim());
                }
            },
        };
        for i in min..(max + 1) {
            cpu_ids.push(i);
        }
    }

    Ok(cpu_ids)
}

pub struct CpumaskIterator<'a> {
    mask: &'a Cpumask,
    index: usize,
}

impl Iterator for CpumaskIterator<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.mask.len() {
            let index = self.index;
            self.index += 1;
            if self.mask.test_cpu(index) {
                return Some(index);
            }
        }

        None
    }
}

impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'x')
    }
}

impl fmt::LowerHex for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'x')
    }
}

impl fmt::UpperHex for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'X')
    }
}

impl BitAndAssign<&Self> for Cpumask {
    fn bitand_assign(&mut self, rhs: &Self) {
        self.mask &= &rhs.mask;
    }
}

impl BitOrAssign<&Self> for Cpumask {
    fn bitor_assign(&mut self, rhs: &Self) {
        self.mask |= &rhs.mask;
    }
}

impl BitXorAssign<&Self> for Cpumask {
    fn bitxor_assign(&mut self, rhs: &Self) {
        self.mask ^= &rhs.mask;
    }
}
