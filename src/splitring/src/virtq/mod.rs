/*
Copyright 2026 The Splitring Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Split Virtqueue Implementation
//!
//! A split virtqueue is three areas in shared memory: the descriptor table,
//! the available ring written by the driver, and the used ring written by the
//! device. Both rings are indexed by free-running 16-bit counters; a slot is
//! `idx mod N`, and the number of pending entries is the wrapping difference
//! of two counters.
//!
//! # Memory Layout
//!
//! ```text
//! base ─> ┌──────────────────────────────┐
//!         │ descriptor table   16 * N    │
//!         ├──────────────────────────────┤
//!         │ avail.flags        u16       │
//!         │ avail.idx          u16       │
//!         │ avail.ring[N]      u16 * N   │
//!         │ used_event         u16       │  <- avail.ring[N]
//!         ├──────────────────────────────┤
//!         │ padding up to `align`        │
//! used ─> ├──────────────────────────────┤
//!         │ used.flags         u16       │
//!         │ used.idx           u16       │
//!         │ used.ring[N]  (u32, u32) * N │
//!         │ avail_event        u16       │  <- used.ring[N]
//!         └──────────────────────────────┘
//! ```
//!
//! The two event fields are cross placed: `used_event` lives at the tail of the
//! available ring, `avail_event` at the tail of the used ring. Both sides
//! compute the same addresses from `(base, N, align)`, so [`Layout`] is the only
//! place where offsets are derived.
//!
//! # Usage
//!
//! ```ignore
//! let layout = Layout::from_base(base, 256, LEGACY_ALIGN)?;
//! let opts = RingOptions::from_features(&features, &limits);
//!
//! let mut producer = RingProducer::new(layout, mem, opts)?;
//! let chain = BufferChainBuilder::new()
//!     .readable(header_addr, header_len)
//!     .writable(status_addr, 1)
//!     .build()?;
//!
//! let result = producer.submit_available_with_notify(&chain)?;
//! if result.notify {
//!     kick_device();
//! }
//! ```

mod access;
mod chain;
mod desc;
mod event;
mod ring;

pub use access::*;
pub use chain::*;
pub use desc::*;
pub use event::*;
pub use ring::*;

use crate::endian::ByteOrder;
use crate::features::{FeatureSet, RING_EVENT_IDX, RING_INDIRECT_DESC};
use crate::limits::QueueLimits;

/// Minimum alignment of the descriptor table.
pub const DESC_ALIGN: usize = 16;
/// Minimum alignment of the available ring.
pub const AVAIL_ALIGN: usize = 2;
/// Minimum alignment of the used ring.
pub const USED_ALIGN: usize = 4;
/// Used ring alignment of legacy (pre `VERSION_1`) devices.
pub const LEGACY_ALIGN: usize = 4096;
/// Largest queue size representable by the 16-bit index space.
pub const MAX_QUEUE_SIZE: u16 = 32768;

const AVAIL_HEADER: usize = 4;
const USED_HEADER: usize = 4;
const AVAIL_ELEM_SIZE: usize = 2;

#[inline]
const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

#[inline]
const fn align_up_u64(val: u64, align: u64) -> u64 {
    (val + align - 1) & !(align - 1)
}

/// Layout of a split virtqueue in shared memory.
///
/// Use [`from_base`](Self::from_base) to compute the areas of a queue placed
/// at `base`, or [`query_size`](Self::query_size) to find out how much memory
/// a queue needs before allocating it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    /// Descriptor table base in shared memory.
    pub desc_table_addr: u64,
    /// Available ring base (its `flags` field).
    pub avail_addr: u64,
    /// Used ring base (its `flags` field).
    pub used_addr: u64,
    /// Number of descriptors and ring slots (power of 2).
    pub num_descs: u16,
    /// Alignment of the used ring.
    pub align: usize,
}

impl Layout {
    /// Compute the layout of a queue of `num_descs` entries placed at `base`.
    ///
    /// `num_descs` must be a non-zero power of two no larger than
    /// [`MAX_QUEUE_SIZE`], `align` a non-zero power of two, and `base` aligned
    /// to both [`DESC_ALIGN`] and `align`. The region starting at `base` must
    /// span at least [`query_size`](Self::query_size) bytes.
    pub const fn from_base(base: u64, num_descs: u16, align: usize) -> Result<Self, RingError> {
        if !Self::valid_params(num_descs as usize, align) {
            return Err(RingError::InvalidLayout);
        }

        let base_align = if align > DESC_ALIGN { align } else { DESC_ALIGN };
        if !base.is_multiple_of(base_align as u64) {
            return Err(RingError::InvalidLayout);
        }

        let n = num_descs as u64;
        let avail_addr = base + n * Descriptor::SIZE as u64;
        // used_event is the last field of the available ring
        let avail_end = avail_addr + (AVAIL_HEADER + AVAIL_ELEM_SIZE) as u64 + n * 2;
        let used_addr = align_up_u64(avail_end, align as u64);

        Ok(Self {
            desc_table_addr: base,
            avail_addr,
            used_addr,
            num_descs,
            align,
        })
    }

    /// Memory needed for a queue of `num_descs` entries whose used ring is
    /// aligned to `align`.
    ///
    /// Returns 0 when the parameters could never form a valid layout.
    pub const fn query_size(num_descs: usize, align: usize) -> usize {
        if !Self::valid_params(num_descs, align) {
            return 0;
        }

        let desc = num_descs * Descriptor::SIZE;
        let avail = AVAIL_ELEM_SIZE * (num_descs + 3);
        let used = USED_HEADER + 2 + UsedElem::SIZE * num_descs;

        align_up(desc + avail, align) + used
    }

    /// Size of a queue with a capacity and alignment known at compile time.
    pub const fn for_capacity<const N: usize, const ALIGN: usize>() -> usize {
        const {
            assert!(N.is_power_of_two(), "queue size must be a power of two");
            assert!(N <= MAX_QUEUE_SIZE as usize, "queue size exceeds 32768");
            assert!(ALIGN.is_power_of_two(), "alignment must be a power of two");
        }

        Self::query_size(N, ALIGN)
    }

    const fn valid_params(num_descs: usize, align: usize) -> bool {
        num_descs.is_power_of_two()
            && num_descs <= MAX_QUEUE_SIZE as usize
            && align.is_power_of_two()
    }

    /// Total size of this queue in bytes.
    pub const fn size(&self) -> usize {
        Self::query_size(self.num_descs as usize, self.align)
    }

    /// Descriptor table view of this queue.
    pub const fn desc_table(&self) -> DescTable {
        DescTable::new(self.desc_table_addr, self.num_descs as usize)
    }

    #[inline]
    const fn slot(&self, idx: u16) -> u64 {
        (idx & (self.num_descs - 1)) as u64
    }

    /// Address of `avail.flags`.
    #[inline]
    pub const fn avail_flags_addr(&self) -> u64 {
        self.avail_addr
    }

    /// Address of `avail.idx`.
    #[inline]
    pub const fn avail_idx_addr(&self) -> u64 {
        self.avail_addr + 2
    }

    /// Address of the available ring slot for free-running index `idx`.
    #[inline]
    pub const fn avail_slot_addr(&self, idx: u16) -> u64 {
        self.avail_addr + AVAIL_HEADER as u64 + self.slot(idx) * AVAIL_ELEM_SIZE as u64
    }

    /// Address of `used_event`, stored at `avail.ring[N]`.
    #[inline]
    pub const fn used_event_addr(&self) -> u64 {
        self.avail_addr + AVAIL_HEADER as u64 + self.num_descs as u64 * AVAIL_ELEM_SIZE as u64
    }

    /// Address of `used.flags`.
    #[inline]
    pub const fn used_flags_addr(&self) -> u64 {
        self.used_addr
    }

    /// Address of `used.idx`.
    #[inline]
    pub const fn used_idx_addr(&self) -> u64 {
        self.used_addr + 2
    }

    /// Address of the used ring element for free-running index `idx`.
    #[inline]
    pub const fn used_elem_addr(&self, idx: u16) -> u64 {
        self.used_addr + USED_HEADER as u64 + self.slot(idx) * UsedElem::SIZE as u64
    }

    /// Address of `avail_event`, stored at `used.ring[N]`.
    #[inline]
    pub const fn avail_event_addr(&self) -> u64 {
        self.used_addr + USED_HEADER as u64 + self.num_descs as u64 * UsedElem::SIZE as u64
    }
}

/// Negotiated parameters that change how ring memory is interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingOptions {
    /// Byte order of every multi-byte field in the queue.
    pub order: ByteOrder,
    /// `used_event` / `avail_event` replace the flag hints.
    pub event_idx: bool,
    /// Descriptors may point at indirect tables.
    pub indirect_desc: bool,
    /// Longest accepted indirect table, in descriptors.
    pub max_indirect_len: u16,
}

impl Default for RingOptions {
    fn default() -> Self {
        Self {
            order: ByteOrder::Little,
            event_idx: false,
            indirect_desc: false,
            max_indirect_len: QueueLimits::DEFAULT_MAX_INDIRECT_LEN,
        }
    }
}

impl RingOptions {
    /// Derive ring options from a finalized feature set.
    pub fn from_features(features: &FeatureSet, limits: &QueueLimits) -> Self {
        Self {
            order: features.byte_order(),
            event_idx: features.has_bit::<RING_EVENT_IDX>(),
            indirect_desc: features.has_bit::<RING_INDIRECT_DESC>(),
            max_indirect_len: limits.max_indirect_len(),
        }
    }
}
