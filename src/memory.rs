// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Contiguous memory allocator
//!
//! Processes are admitted only once they hold a contiguous block of the
//! simulated address space. The address space `[0, capacity)` is kept as an
//! ordered list of blocks, each either free or owned by exactly one process:
//!
//! ```text
//!   0        30        50   60                       100
//!   o--------o---------o----o-------------------------o
//!   |   P1   |   P2    | P3 |          free           |
//!   o--------o---------o----o-------------------------o
//! ```
//!
//! Allocation is best-fit: the smallest free block large enough wins, and
//! the block is split into an owned prefix and a free remainder. Releasing a
//! block coalesces it with free neighbours, so no two adjacent blocks are
//! ever both free.

use std::fmt;
use std::sync::Mutex;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::trace;

use crate::process::ProcessRecord;
use crate::types::lock;
use crate::types::Pid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBlock {
    pub start: u64,
    pub size: u64,
    pub owner: Option<Pid>,
}

impl MemoryBlock {
    pub fn is_free(&self) -> bool {
        self.owner.is_none()
    }

    pub fn end(&self) -> u64 {
        self.start + self.size
    }
}

impl fmt::Display for MemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.owner {
            Some(pid) => write!(f, "[{} | {}-{}KB]", pid, self.start, self.end()),
            None => write!(f, "[free | {}-{}KB]", self.start, self.end()),
        }
    }
}

/// A consistent copy of the allocator state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub total_capacity: u64,
    pub used_capacity: u64,
    pub blocks: Vec<MemoryBlock>,
}

impl MemorySnapshot {
    /// Check that the blocks partition the address space and that no two
    /// neighbours are both free.
    pub fn validate(&self) -> Result<()> {
        let mut offset = 0;
        let mut used = 0;
        for (idx, block) in self.blocks.iter().enumerate() {
            if block.start != offset {
                bail!("block {} starts at {} instead of {}", idx, block.start, offset);
            }
            if block.size == 0 {
                bail!("block {} at {} is empty", idx, block.start);
            }
            if idx > 0 && block.is_free() && self.blocks[idx - 1].is_free() {
                bail!(
                    "free blocks at {} and {} were not coalesced",
                    self.blocks[idx - 1].start,
                    block.start
                );
            }
            if !block.is_free() {
                used += block.size;
            }
            offset = block.end();
        }

        if offset != self.total_capacity {
            bail!("blocks cover {}KB of {}KB", offset, self.total_capacity);
        }
        if used != self.used_capacity {
            bail!(
                "used capacity {}KB does not match blocks ({}KB)",
                self.used_capacity,
                used
            );
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryAllocator {
    capacity: u64,
    blocks: Mutex<Vec<MemoryBlock>>,
}

impl MemoryAllocator {
    pub fn new(capacity: u64) -> Self {
        let blocks = if capacity > 0 {
            vec![MemoryBlock {
                start: 0,
                size: capacity,
                owner: None,
            }]
        } else {
            Vec::new()
        };

        Self {
            capacity,
            blocks: Mutex::new(blocks),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Best-fit allocation of the process' memory requirement. Returns
    /// false, leaving everything untouched, if no free block is big enough.
    pub fn try_allocate(&self, process: &ProcessRecord) -> bool {
        let need = process.memory_kb();
        if need == 0 {
            return true;
        }

        let mut blocks = lock(&self.blocks);

        // min_by_key keeps the first of equal candidates, i.e. the lowest
        // offset.
        let best = blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_free() && b.size >= need)
            .min_by_key(|(_, b)| b.size)
            .map(|(idx, _)| idx);

        let idx = match best {
            Some(idx) => idx,
            None => return false,
        };

        let block = blocks[idx];
        blocks[idx].owner = Some(process.pid());
        if block.size > need {
            blocks[idx].size = need;
            blocks.insert(
                idx + 1,
                MemoryBlock {
                    start: block.start + need,
                    size: block.size - need,
                    owner: None,
                },
            );
        }

        trace!("{} allocated {}KB at {}KB", process.pid(), need, block.start);
        true
    }

    /// Free the block owned by `process` and coalesce free neighbours.
    ///
    /// A process with no memory requirement owns nothing and releasing it is
    /// a no-op. Any other process must own exactly one block.
    pub fn release(&self, process: &ProcessRecord) -> Result<()> {
        if process.memory_kb() == 0 {
            return Ok(());
        }

        let mut blocks = lock(&self.blocks);
        let owned = blocks
            .iter()
            .position(|b| b.owner == Some(process.pid()));

        debug_assert!(owned.is_some(), "{} owns no block", process.pid());
        let idx = match owned {
            Some(idx) => idx,
            None => bail!("{} owns no block", process.pid()),
        };

        blocks[idx].owner = None;
        Self::coalesce(&mut blocks);

        trace!("{} released {}KB", process.pid(), process.memory_kb());
        Ok(())
    }

    fn coalesce(blocks: &mut Vec<MemoryBlock>) {
        let mut i = 0;
        while i + 1 < blocks.len() {
            if blocks[i].is_free() && blocks[i + 1].is_free() {
                blocks[i].size += blocks[i + 1].size;
                blocks.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }

    pub fn blocks(&self) -> Vec<MemoryBlock> {
        lock(&self.blocks).clone()
    }

    pub fn used_capacity(&self) -> u64 {
        Self::used(&lock(&self.blocks))
    }

    fn used(blocks: &[MemoryBlock]) -> u64 {
        blocks.iter().filter(|b| !b.is_free()).map(|b| b.size).sum()
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        let blocks = lock(&self.blocks);
        MemorySnapshot {
            total_capacity: self.capacity,
            used_capacity: Self::used(&blocks),
            blocks: blocks.clone(),
        }
    }
}

/// Parse a memory size in KB. Accepts a bare number of KB or a number with
/// a `kb` or `mb` suffix, case-insensitive: `512`, `256kb`, `2MB`.
pub fn parse_mem_kb(token: &str) -> Result<u64> {
    let token = token.trim().to_ascii_lowercase();
    let (digits, scale) = if let Some(kb) = token.strip_suffix("kb") {
        (kb, 1)
    } else if let Some(mb) = token.strip_suffix("mb") {
        (mb, 1024)
    } else {
        (token.as_str(), 1)
    };

    let value = digits
        .trim()
        .parse::<u64>()
        .with_context(|| format!("invalid memory size {:?}", token))?;
    value
        .checked_mul(scale)
        .with_context(|| format!("memory size {:?} overflows", token))
}
