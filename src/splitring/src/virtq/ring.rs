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

//! Split Virtqueue Ring Implementation
//!
//! The producer (driver) owns the descriptor table and the available ring;
//! the consumer (device) owns the used ring. Each ring carries a free-running
//! 16-bit index that only its owner advances.
//!
//! # Cursor Protocol
//!
//! ```text
//!  producer                                   consumer
//!  ────────                                   ────────
//!  write descriptors
//!  avail.ring[avail_idx % N] = head
//!  store_release(avail.idx, avail_idx + 1) ─> load_acquire(avail.idx)
//!                                             pending = avail.idx - last_avail
//!                                             head = avail.ring[last_avail % N]
//!                                             resolve chain, process
//!                                             used.ring[used_idx % N] = (head, len)
//!  load_acquire(used.idx)                 <─ store_release(used.idx, used_idx + 1)
//!  pending = used.idx - last_used
//!  reclaim chain of used.ring[last_used % N]
//! ```
//!
//! All index arithmetic wraps at 2^16. A pending count above `N` can only
//! come from a corrupted or hostile peer and is reported as
//! [`RingError::BadIndex`].
//!
//! # Free List
//!
//! The producer keeps its own stack of free descriptor ids and a private copy
//! of every `next` link it wrote. Reclaiming a chain walks that copy, never
//! the shared table, so a consumer scribbling over descriptors cannot corrupt
//! the free list.
//!
//! # Notification Suppression
//!
//! After publishing, each side issues a full fence and reads the peer's wish:
//! the peer's event index when `EVENT_IDX` was negotiated, its flag hint
//! otherwise. See [`ring_need_event`].

use smallvec::SmallVec;
use thiserror::Error;

use super::chain::{BufferChain, ChainError, resolve_chain};
use super::desc::{DescFlags, DescTable, Descriptor, UsedElem};
use super::event::{AvailFlags, UsedFlags, notify_needed};
use super::{Layout, MemOps, RingOptions};

/// A buffer returned from the ring after being used by the device.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UsedBuffer {
    /// Head descriptor id returned when the chain was submitted
    pub id: u16,
    /// Number of bytes written by the device to writable buffers.
    pub len: u32,
}

/// Result of submitting a buffer to the ring.
///
/// Contains the assigned descriptor ID and whether the other side
/// needs to be notified about the new buffer.
#[derive(Debug, Copy, Clone)]
pub struct SubmitResult {
    /// Head descriptor id of the submitted chain.
    /// Use this ID to correlate completions with submissions.
    pub id: u16,
    /// Whether the device should be notified immediately based on the other
    /// side's suppression settings.
    pub notify: bool,
}

/// Result of publishing several chains with a single index update.
#[derive(Debug, Clone)]
pub struct BatchResult {
    /// Head ids in submission order.
    pub ids: SmallVec<[u16; 16]>,
    /// Whether the device should be notified once for the whole batch.
    pub notify: bool,
}

#[derive(Error, Debug)]
pub enum RingError {
    #[error("Buffer chain is empty")]
    EmptyChain,
    #[error("Buffer chain is malformed: {0}")]
    BadChain(#[from] ChainError),
    #[error("Operation would block")]
    WouldBlock,
    #[error("Invalid state")]
    InvalidState,
    #[error("Invalid memory layout")]
    InvalidLayout,
    #[error("Peer index is {pending} entries ahead of the ring size")]
    BadIndex { pending: u16 },
    #[error("Backend memory error")]
    MemError,
}

const DEFAULT_LEN: usize = DescTable::DEFAULT_LEN;

fn read_u16<M: MemOps>(mem: &M, addr: u64, opts: &RingOptions) -> Result<u16, RingError> {
    mem.read_int::<u16>(addr, opts.order)
        .map_err(|_| RingError::MemError)
}

fn write_u16<M: MemOps>(mem: &M, addr: u64, val: u16, opts: &RingOptions) -> Result<(), RingError> {
    mem.write_int(addr, val, opts.order)
        .map_err(|_| RingError::MemError)
}

fn load_index<M: MemOps>(mem: &M, addr: u64, opts: &RingOptions) -> Result<u16, RingError> {
    mem.load_index(addr, opts.order)
        .map_err(|_| RingError::MemError)
}

fn store_index<M: MemOps>(mem: &M, addr: u64, val: u16, opts: &RingOptions) -> Result<(), RingError> {
    mem.store_index(addr, val, opts.order)
        .map_err(|_| RingError::MemError)
}

/// Producer (driver) side of a split virtqueue.
///
/// The producer submits buffer chains for the device to process and polls
/// for completions. This is typically used by the driver/guest side.
///
/// # Lifecycle
///
/// 1. Submit: Call [`submit_available`](Self::submit_available) or
///    [`submit_batch`](Self::submit_batch) to make buffers available to device
/// 2. Notify: If `SubmitResult::notify` is true, signal the device
/// 3. Poll: Call [`poll_used`](Self::poll_used) to check for completions
/// 4. Process: Handle completed buffers; their descriptors are free again
#[derive(Debug)]
pub struct RingProducer<M> {
    /// Memory accessor
    mem: M,
    layout: Layout,
    opts: RingOptions,
    /// Descriptor table in shared memory
    desc_table: DescTable,
    /// Shadow of avail.idx (last published value)
    avail_idx: u16,
    /// Next used ring entry to reclaim
    last_used: u16,
    /// Shadow of avail.flags
    avail_flags_shadow: AvailFlags,
    /// stack of free descriptor ids
    id_free: SmallVec<[u16; DEFAULT_LEN]>,
    /// private copy of the next links written, index = descriptor id
    next: SmallVec<[u16; DEFAULT_LEN]>,
    /// chain length per head id, 0 when the id is not an outstanding head
    chain_len: SmallVec<[u16; DEFAULT_LEN]>,
}

impl<M: MemOps> RingProducer<M> {
    /// Create a new producer and reset the producer-owned ring fields.
    pub fn new(layout: Layout, mem: M, opts: RingOptions) -> Result<Self, RingError> {
        let size = layout.num_descs as usize;

        write_u16(&mem, layout.avail_flags_addr(), 0, &opts)?;
        write_u16(&mem, layout.used_event_addr(), 0, &opts)?;
        store_index(&mem, layout.avail_idx_addr(), 0, &opts)?;

        // Popped from the back, so low ids are handed out first
        let id_free = (0..size as u16).rev().collect::<SmallVec<[_; DEFAULT_LEN]>>();

        Ok(Self {
            mem,
            layout,
            opts,
            desc_table: layout.desc_table(),
            avail_idx: 0,
            last_used: 0,
            avail_flags_shadow: AvailFlags::empty(),
            id_free,
            next: SmallVec::from_elem(0, size),
            chain_len: SmallVec::from_elem(0, size),
        })
    }

    /// Submit a buffer chain to the ring.
    ///
    /// Writes all descriptors of the chain, linking them with NEXT flags, then
    /// publishes the head id with a release store of `avail.idx`.
    ///
    /// # Returns
    ///
    /// The head descriptor id of the chain, for matching with completions.
    ///
    /// # Errors
    ///
    /// - [`RingError::EmptyChain`] - Chain has no buffers
    /// - [`RingError::WouldBlock`] - Not enough free descriptors
    pub fn submit_available(&mut self, chain: &BufferChain) -> Result<u16, RingError> {
        let total_descs = chain.len();
        if total_descs == 0 {
            return Err(RingError::EmptyChain);
        }

        if self.id_free.len() < total_descs {
            return Err(RingError::WouldBlock);
        }

        let head = self.write_chain(chain)?;
        self.publish(&[head])?;
        Ok(head)
    }

    /// Submit a buffer chain to the ring, returning whether to notify the device.
    pub fn submit_available_with_notify(
        &mut self,
        chain: &BufferChain,
    ) -> Result<SubmitResult, RingError> {
        let old = self.avail_idx;
        let id = self.submit_available(chain)?;
        let notify = self.should_notify_since(old)?;

        Ok(SubmitResult { id, notify })
    }

    /// Submit several chains and expose them with a single `avail.idx` store.
    ///
    /// Either every chain is published or none is: if the free descriptors do
    /// not cover the whole batch, nothing is written and
    /// [`RingError::WouldBlock`] is returned.
    pub fn submit_batch(&mut self, chains: &[BufferChain]) -> Result<BatchResult, RingError> {
        let mut total_descs = 0;
        for chain in chains {
            if chain.len() == 0 {
                return Err(RingError::EmptyChain);
            }
            total_descs += chain.len();
        }

        if self.id_free.len() < total_descs {
            return Err(RingError::WouldBlock);
        }

        let old = self.avail_idx;
        let mut ids = SmallVec::new();
        for chain in chains {
            ids.push(self.write_chain(chain)?);
        }

        self.publish(&ids)?;
        let notify = if ids.is_empty() {
            false
        } else {
            self.should_notify_since(old)?
        };

        Ok(BatchResult { ids, notify })
    }

    /// Submit a chain through an indirect table at `table_addr`.
    ///
    /// The chain's descriptors are written to the indirect table, which must
    /// have room for `chain.len()` descriptors; only one descriptor of the
    /// queue's own table is consumed.
    pub fn submit_indirect(
        &mut self,
        chain: &BufferChain,
        table_addr: u64,
    ) -> Result<u16, RingError> {
        if !self.opts.indirect_desc {
            return Err(ChainError::IndirectNotNegotiated.into());
        }

        let count = chain.len();
        if count == 0 {
            return Err(RingError::EmptyChain);
        }
        if count > self.opts.max_indirect_len as usize {
            return Err(ChainError::IndirectTooLong(count).into());
        }

        let head = *self.id_free.last().ok_or(RingError::WouldBlock)?;

        let table = DescTable::new(table_addr, count);
        for (i, elem) in chain.elems().iter().enumerate() {
            let is_next = i + 1 < count;
            let mut flags = DescFlags::empty();
            flags.set(DescFlags::NEXT, is_next);
            flags.set(DescFlags::WRITE, elem.writable);

            let next = if is_next { i as u16 + 1 } else { 0 };
            let addr = table.desc_addr(i as u16).ok_or(RingError::InvalidState)?;
            Descriptor::new(elem.addr, elem.len, flags, next)
                .write(&self.mem, addr, self.opts.order)
                .map_err(|_| RingError::MemError)?;
        }

        let len = (count * Descriptor::SIZE) as u32;
        let desc = Descriptor::new(table_addr, len, DescFlags::INDIRECT, 0);
        self.write_desc(head, &desc)?;

        self.id_free.pop();
        self.next[head as usize] = 0;
        self.chain_len[head as usize] = 1;

        self.publish(&[head])?;
        Ok(head)
    }

    /// Poll the used ring for a completed chain.
    ///
    /// Reclaims the chain's descriptors on success.
    ///
    /// # Returns
    ///
    /// - `Ok(UsedBuffer)` - A buffer chain was completed
    /// - `Err(RingError::WouldBlock)` - No completions available
    /// - `Err(RingError::BadIndex)` - `used.idx` ran more than a ring ahead
    /// - `Err(RingError::InvalidState)` - The entry names an id that is not
    ///   an outstanding head. The entry has been consumed; the next call
    ///   moves on to the following one.
    pub fn poll_used(&mut self) -> Result<UsedBuffer, RingError> {
        let used_idx = load_index(&self.mem, self.layout.used_idx_addr(), &self.opts)?;
        let pending = used_idx.wrapping_sub(self.last_used);

        if pending == 0 {
            return Err(RingError::WouldBlock);
        }

        if pending > self.layout.num_descs {
            log::warn!(
                "used.idx {} is {} entries past last_used {}",
                used_idx,
                pending,
                self.last_used
            );
            return Err(RingError::BadIndex { pending });
        }

        let addr = self.layout.used_elem_addr(self.last_used);
        let elem = UsedElem::read(&self.mem, addr, self.opts.order)
            .map_err(|_| RingError::MemError)?;

        // the entry is consumed even if it turns out to be bogus
        self.last_used = self.last_used.wrapping_add(1);

        if self.opts.event_idx && !self.avail_flags_shadow.contains(AvailFlags::NO_INTERRUPT) {
            write_u16(
                &self.mem,
                self.layout.used_event_addr(),
                self.last_used,
                &self.opts,
            )?;
        }

        let id = u16::try_from(elem.id)
            .ok()
            .filter(|id| (*id as usize) < self.chain_len.len())
            .ok_or_else(|| {
                log::warn!("used element names out of range id {}", elem.id);
                RingError::InvalidState
            })?;

        self.reclaim(id)?;

        Ok(UsedBuffer { id, len: elem.len })
    }

    /// Get number of free descriptors
    pub fn num_free(&self) -> usize {
        self.id_free.len()
    }

    /// Get number of descriptors currently owned by the device
    pub fn num_inflight(&self) -> usize {
        self.len() - self.num_free()
    }

    /// Is the descriptor table exhausted?
    pub fn is_full(&self) -> bool {
        self.id_free.is_empty()
    }

    /// Get queue size
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.desc_table.len()
    }

    /// Get memory accessor reference
    pub fn mem(&self) -> &M {
        &self.mem
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Last published value of `avail.idx`.
    pub fn avail_idx(&self) -> u16 {
        self.avail_idx
    }

    /// Next used ring index to reclaim.
    pub fn last_used(&self) -> u16 {
        self.last_used
    }

    /// Decide whether the device must be notified after `avail.idx` moved
    /// from `old` to its current value.
    pub fn should_notify_since(&self, old: u16) -> Result<bool, RingError> {
        self.mem.fence();

        let (suppressed, event) = if self.opts.event_idx {
            let event = read_u16(&self.mem, self.layout.avail_event_addr(), &self.opts)?;
            (false, event)
        } else {
            let raw = read_u16(&self.mem, self.layout.used_flags_addr(), &self.opts)?;
            let flags = UsedFlags::from_bits_truncate(raw);
            (flags.contains(UsedFlags::NO_NOTIFY), 0)
        };

        Ok(notify_needed(
            self.opts.event_idx,
            suppressed,
            event,
            self.avail_idx,
            old,
        ))
    }

    /// Ask the device not to interrupt on completions.
    pub fn disable_used_notifications(&mut self) -> Result<(), RingError> {
        self.avail_flags_shadow.insert(AvailFlags::NO_INTERRUPT);
        self.write_avail_flags()
    }

    /// Ask the device to interrupt on the next completion.
    ///
    /// Returns true if completions are already pending, in which case the
    /// caller should poll instead of waiting for an interrupt.
    pub fn enable_used_notifications(&mut self) -> Result<bool, RingError> {
        self.enable_used_notifications_at(self.last_used)
    }

    /// Ask the device to interrupt once the used entry at `idx` is written.
    ///
    /// Without `EVENT_IDX` this is the same as
    /// [`enable_used_notifications`](Self::enable_used_notifications).
    pub fn enable_used_notifications_at(&mut self, idx: u16) -> Result<bool, RingError> {
        self.avail_flags_shadow.remove(AvailFlags::NO_INTERRUPT);
        self.write_avail_flags()?;

        if self.opts.event_idx {
            write_u16(&self.mem, self.layout.used_event_addr(), idx, &self.opts)?;
        }

        self.mem.fence();
        let used_idx = load_index(&self.mem, self.layout.used_idx_addr(), &self.opts)?;
        Ok(used_idx != self.last_used)
    }

    fn write_avail_flags(&self) -> Result<(), RingError> {
        write_u16(
            &self.mem,
            self.layout.avail_flags_addr(),
            self.avail_flags_shadow.bits(),
            &self.opts,
        )
    }

    fn write_desc(&self, id: u16, desc: &Descriptor) -> Result<(), RingError> {
        let addr = self
            .desc_table
            .desc_addr(id)
            .ok_or(RingError::InvalidState)?;

        desc.write(&self.mem, addr, self.opts.order)
            .map_err(|_| RingError::MemError)
    }

    /// Write the chain's descriptors and take their ids off the free stack.
    fn write_chain(&mut self, chain: &BufferChain) -> Result<u16, RingError> {
        let total_descs = chain.len();
        let ids: SmallVec<[u16; 16]> = self
            .id_free
            .iter()
            .rev()
            .take(total_descs)
            .copied()
            .collect();

        if ids.len() < total_descs {
            return Err(RingError::WouldBlock);
        }

        for (i, elem) in chain.elems().iter().enumerate() {
            let next = ids.get(i + 1).copied();
            let mut flags = DescFlags::empty();
            flags.set(DescFlags::NEXT, next.is_some());
            flags.set(DescFlags::WRITE, elem.writable);

            let desc = Descriptor::new(elem.addr, elem.len, flags, next.unwrap_or(0));
            self.write_desc(ids[i], &desc)?;
            self.next[ids[i] as usize] = next.unwrap_or(0);
        }

        let remaining = self.id_free.len() - total_descs;
        self.id_free.truncate(remaining);

        let head = ids[0];
        self.chain_len[head as usize] = total_descs as u16;
        Ok(head)
    }

    /// Write heads into consecutive available slots, then publish them.
    fn publish(&mut self, heads: &[u16]) -> Result<(), RingError> {
        let mut idx = self.avail_idx;
        for &head in heads {
            write_u16(&self.mem, self.layout.avail_slot_addr(idx), head, &self.opts)?;
            idx = idx.wrapping_add(1);
        }

        store_index(&self.mem, self.layout.avail_idx_addr(), idx, &self.opts)?;
        self.avail_idx = idx;
        Ok(())
    }

    /// Return an outstanding chain's descriptors to the free stack.
    fn reclaim(&mut self, head: u16) -> Result<(), RingError> {
        let count = self.chain_len[head as usize];
        if count == 0 {
            log::warn!("used element names id {} which is not outstanding", head);
            return Err(RingError::InvalidState);
        }

        self.chain_len[head as usize] = 0;

        let mut id = head;
        for i in 0..count {
            self.id_free.push(id);
            if i + 1 < count {
                id = self.next[id as usize];
            }
        }

        Ok(())
    }
}

/// Consumer (device) side of a split virtqueue.
///
/// The consumer polls for available chains, processes them, and returns
/// completions through the used ring. This is typically used by the
/// device/host side.
#[derive(Debug)]
pub struct RingConsumer<M> {
    mem: M,
    layout: Layout,
    opts: RingOptions,
    desc_table: DescTable,
    /// Next available ring entry to consume
    last_avail: u16,
    /// Shadow of used.idx (last published value)
    used_idx: u16,
    /// Shadow of used.flags
    used_flags_shadow: UsedFlags,
    /// heads handed out by poll_available and not yet completed
    inflight: SmallVec<[bool; DEFAULT_LEN]>,
    num_inflight: usize,
}

impl<M: MemOps> RingConsumer<M> {
    /// Create a new consumer and reset the consumer-owned ring fields.
    pub fn new(layout: Layout, mem: M, opts: RingOptions) -> Result<Self, RingError> {
        let size = layout.num_descs as usize;

        write_u16(&mem, layout.used_flags_addr(), 0, &opts)?;
        write_u16(&mem, layout.avail_event_addr(), 0, &opts)?;
        store_index(&mem, layout.used_idx_addr(), 0, &opts)?;

        Ok(Self {
            mem,
            layout,
            opts,
            desc_table: layout.desc_table(),
            last_avail: 0,
            used_idx: 0,
            used_flags_shadow: UsedFlags::empty(),
            inflight: SmallVec::from_elem(false, size),
            num_inflight: 0,
        })
    }

    /// Poll the available ring for the next chain.
    ///
    /// # Returns
    ///
    /// - `Ok((id, chain))` - The chain's head id and its resolved buffers
    /// - `Err(RingError::WouldBlock)` - No new chains
    /// - `Err(RingError::BadIndex)` - `avail.idx` ran more than a ring ahead
    /// - `Err(RingError::BadChain)` - The chain is malformed. The entry has
    ///   been consumed; the next call moves on to the following one.
    pub fn poll_available(&mut self) -> Result<(u16, BufferChain), RingError> {
        let avail_idx = load_index(&self.mem, self.layout.avail_idx_addr(), &self.opts)?;
        let pending = avail_idx.wrapping_sub(self.last_avail);

        if pending == 0 {
            return Err(RingError::WouldBlock);
        }

        if pending > self.layout.num_descs {
            log::warn!(
                "avail.idx {} is {} entries past last_avail {}",
                avail_idx,
                pending,
                self.last_avail
            );
            return Err(RingError::BadIndex { pending });
        }

        let head = read_u16(
            &self.mem,
            self.layout.avail_slot_addr(self.last_avail),
            &self.opts,
        )?;
        self.last_avail = self.last_avail.wrapping_add(1);

        if self.opts.event_idx && !self.used_flags_shadow.contains(UsedFlags::NO_NOTIFY) {
            write_u16(
                &self.mem,
                self.layout.avail_event_addr(),
                self.last_avail,
                &self.opts,
            )?;
        }

        let chain = resolve_chain(&self.mem, &self.desc_table, head, &self.opts).map_err(|e| {
            log::warn!("dropping malformed chain at head {}: {}", head, e);
            RingError::BadChain(e)
        })?;

        let slot = self
            .inflight
            .get_mut(head as usize)
            .ok_or(RingError::InvalidState)?;
        if *slot {
            log::warn!("head {} published again while in flight", head);
            return Err(RingError::InvalidState);
        }
        *slot = true;
        self.num_inflight += 1;

        Ok((head, chain))
    }

    /// Is there at least one unconsumed available entry?
    pub fn peek_available(&self) -> Result<bool, RingError> {
        let avail_idx = load_index(&self.mem, self.layout.avail_idx_addr(), &self.opts)?;
        Ok(avail_idx != self.last_avail)
    }

    /// Complete the chain `id`, recording `written_len` bytes written.
    pub fn submit_used(&mut self, id: u16, written_len: u32) -> Result<(), RingError> {
        self.write_used(id, written_len)?;
        store_index(&self.mem, self.layout.used_idx_addr(), self.used_idx, &self.opts)
    }

    /// Complete a chain, returning whether to notify the driver.
    pub fn submit_used_with_notify(&mut self, id: u16, written_len: u32) -> Result<bool, RingError> {
        let old = self.used_idx;
        self.submit_used(id, written_len)?;
        self.should_notify_since(old)
    }

    /// Complete several chains with a single `used.idx` store.
    ///
    /// Returns whether the driver should be notified once for all of them.
    pub fn submit_used_batch(&mut self, completions: &[(u16, u32)]) -> Result<bool, RingError> {
        if completions.is_empty() {
            return Ok(false);
        }

        for (i, &(id, _)) in completions.iter().enumerate() {
            let repeated = completions[..i].iter().any(|&(prev, _)| prev == id);
            if repeated || !self.is_inflight(id) {
                return Err(RingError::InvalidState);
            }
        }

        let old = self.used_idx;
        for &(id, len) in completions {
            self.write_used(id, len)?;
        }
        store_index(&self.mem, self.layout.used_idx_addr(), self.used_idx, &self.opts)?;
        self.should_notify_since(old)
    }

    /// Get number of chains taken from the ring and not yet completed
    pub fn num_inflight(&self) -> usize {
        self.num_inflight
    }

    /// Get queue size
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.desc_table.len()
    }

    /// Get memory accessor reference
    pub fn mem(&self) -> &M {
        &self.mem
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Next available ring index to consume.
    pub fn last_avail(&self) -> u16 {
        self.last_avail
    }

    /// Last published value of `used.idx`.
    pub fn used_idx(&self) -> u16 {
        self.used_idx
    }

    /// Decide whether the driver must be notified after `used.idx` moved
    /// from `old` to its current value.
    pub fn should_notify_since(&self, old: u16) -> Result<bool, RingError> {
        self.mem.fence();

        let (suppressed, event) = if self.opts.event_idx {
            let event = read_u16(&self.mem, self.layout.used_event_addr(), &self.opts)?;
            (false, event)
        } else {
            let raw = read_u16(&self.mem, self.layout.avail_flags_addr(), &self.opts)?;
            let flags = AvailFlags::from_bits_truncate(raw);
            (flags.contains(AvailFlags::NO_INTERRUPT), 0)
        };

        Ok(notify_needed(
            self.opts.event_idx,
            suppressed,
            event,
            self.used_idx,
            old,
        ))
    }

    /// Ask the driver not to notify about new chains.
    pub fn disable_avail_notifications(&mut self) -> Result<(), RingError> {
        self.used_flags_shadow.insert(UsedFlags::NO_NOTIFY);
        self.write_used_flags()
    }

    /// Ask the driver to notify about the next chain.
    ///
    /// Returns true if chains are already pending.
    pub fn enable_avail_notifications(&mut self) -> Result<bool, RingError> {
        self.enable_avail_notifications_at(self.last_avail)
    }

    /// Ask the driver to notify once the available entry at `idx` is published.
    pub fn enable_avail_notifications_at(&mut self, idx: u16) -> Result<bool, RingError> {
        self.used_flags_shadow.remove(UsedFlags::NO_NOTIFY);
        self.write_used_flags()?;

        if self.opts.event_idx {
            write_u16(&self.mem, self.layout.avail_event_addr(), idx, &self.opts)?;
        }

        self.mem.fence();
        self.peek_available()
    }

    fn write_used_flags(&self) -> Result<(), RingError> {
        write_u16(
            &self.mem,
            self.layout.used_flags_addr(),
            self.used_flags_shadow.bits(),
            &self.opts,
        )
    }

    fn is_inflight(&self, id: u16) -> bool {
        self.inflight.get(id as usize).copied().unwrap_or(false)
    }

    /// Fill the next used element without publishing it.
    fn write_used(&mut self, id: u16, written_len: u32) -> Result<(), RingError> {
        if !self.is_inflight(id) {
            return Err(RingError::InvalidState);
        }

        let elem = UsedElem {
            id: id as u32,
            len: written_len,
        };
        elem.write(
            &self.mem,
            self.layout.used_elem_addr(self.used_idx),
            self.opts.order,
        )
        .map_err(|_| RingError::MemError)?;

        self.inflight[id as usize] = false;
        self.num_inflight -= 1;
        self.used_idx = self.used_idx.wrapping_add(1);
        Ok(())
    }
}


#[cfg(test)]
mod fuzz {
    use alloc::rc::Rc;
    use alloc::vec::Vec;

    use quickcheck::{Arbitrary, Gen, QuickCheck};

    use super::tests::{OwnedRing, TestMem, make_consumer, make_producer};
    use super::*;
    use crate::virtq::{BufferChainBuilder, BufferElement};

    const MAX_RING_SHIFT: usize = 6;
    const MAX_OPS: usize = 128;
    const MAX_CHAIN_LEN: usize = 8;

    #[allow(clippy::large_enum_variant)]
    #[derive(Clone, Debug)]
    enum Op {
        /// submit one chain
        Submit(BufferChain),
        /// submit several chains with one index update
        Batch(Vec<BufferChain>),
        /// poll up to N chains
        PollAvail(u8),
        /// driver reclaims up to N completions
        PollUsed(u8),
        /// complete one previously polled chain
        CompleteOne,
    }

    impl Arbitrary for Op {
        fn arbitrary(g: &mut Gen) -> Self {
            let choice = u8::arbitrary(g) % 5;
            match choice {
                0 => Op::Submit(BufferChain::arbitrary(g)),
                1 => {
                    let n = usize::arbitrary(g) % 4;
                    Op::Batch((0..n).map(|_| BufferChain::arbitrary(g)).collect())
                }
                2 => Op::PollAvail(u8::arbitrary(g) % 8 + 1),
                3 => Op::PollUsed(u8::arbitrary(g) % 8 + 1),
                4 => Op::CompleteOne,
                _ => unreachable!(),
            }
        }
    }

    #[derive(Clone, Debug)]
    struct Scenario {
        table_size: usize,
        start: u16,
        ops: Vec<Op>,
    }

    impl Arbitrary for Scenario {
        fn arbitrary(g: &mut Gen) -> Self {
            let table_size = 1 << (usize::arbitrary(g) % (MAX_RING_SHIFT + 1));
            let num_ops = usize::arbitrary(g) % MAX_OPS + 1;
            // bias towards the wrap point
            let start = if bool::arbitrary(g) {
                u16::MAX - (u16::arbitrary(g) % 64)
            } else {
                u16::arbitrary(g)
            };

            let ops = (0..num_ops).map(|_| Op::arbitrary(g)).collect();
            Scenario {
                table_size,
                start,
                ops,
            }
        }
    }

    impl Arbitrary for BufferElement {
        fn arbitrary(g: &mut Gen) -> Self {
            BufferElement {
                addr: u64::arbitrary(g),
                len: u32::arbitrary(g) | 1,
                writable: bool::arbitrary(g),
            }
        }
    }

    impl Arbitrary for BufferChain {
        fn arbitrary(g: &mut Gen) -> Self {
            let chain_len = usize::arbitrary(g) % MAX_CHAIN_LEN + 1;

            let (writables, readables): (Vec<_>, Vec<_>) = (0..chain_len)
                .map(|_| BufferElement::arbitrary(g))
                .partition(|e| e.writable);

            let mut builder = BufferChainBuilder::new();
            for r in &readables {
                builder = builder.readable(r.addr, r.len);
            }

            let chain = match writables.split_first() {
                None => builder.build(),
                Some((first, rest)) => {
                    let mut builder = builder.writable(first.addr, first.len);
                    for w in rest {
                        builder = builder.writable(w.addr, w.len);
                    }
                    builder.build()
                }
            };

            chain.unwrap()
        }
    }

    fn free_list_consistent(ring: &OwnedRing, producer: &RingProducer<Rc<TestMem>>) -> bool {
        let outstanding: usize = producer.chain_len.iter().map(|&n| n as usize).sum();
        if outstanding + producer.num_free() != ring.len() {
            return false;
        }

        producer
            .id_free
            .iter()
            .all(|id| producer.chain_len[*id as usize] == 0)
    }

    fn run_scenario(s: Scenario) -> bool {
        let ring = OwnedRing::new(s.table_size);
        let mut producer = make_producer(&ring);
        let mut consumer = make_consumer(&ring);

        producer.avail_idx = s.start;
        producer.last_used = s.start;
        consumer.last_avail = s.start;
        consumer.used_idx = s.start;
        ring.write_u16(ring.layout().avail_idx_addr(), s.start);
        ring.write_u16(ring.layout().used_idx_addr(), s.start);

        // Submitted chains by head id, compared against what the consumer sees
        let mut submitted: Vec<Option<BufferChain>> = alloc::vec![None; s.table_size];
        // Device-tracked polled-but-not-completed IDs
        let mut dev_ready: Vec<(u16, u32)> = Vec::new();

        for op in &s.ops {
            match op {
                Op::Submit(chain) => match producer.submit_available(chain) {
                    Ok(id) => submitted[id as usize] = Some(chain.clone()),
                    Err(RingError::WouldBlock) => {}
                    Err(_) => return false,
                },
                Op::Batch(chains) => match producer.submit_batch(chains) {
                    Ok(res) => {
                        for (id, chain) in res.ids.iter().zip(chains) {
                            submitted[*id as usize] = Some(chain.clone());
                        }
                    }
                    Err(RingError::WouldBlock) => {}
                    Err(_) => return false,
                },
                Op::PollAvail(n) => {
                    for _ in 0..*n {
                        match consumer.poll_available() {
                            Ok((id, chain)) => {
                                if submitted[id as usize].as_ref() != Some(&chain) {
                                    return false;
                                }
                                dev_ready.push((id, chain.len() as u32));
                            }
                            Err(RingError::WouldBlock) => break,
                            Err(_) => return false,
                        }
                    }
                }
                Op::PollUsed(n) => {
                    for _ in 0..*n {
                        match producer.poll_used() {
                            Ok(u) => {
                                if submitted[u.id as usize].take().map(|c| c.len() as u32)
                                    != Some(u.len)
                                {
                                    return false;
                                }
                                if !producer.id_free.contains(&u.id) {
                                    return false;
                                }
                            }
                            Err(RingError::WouldBlock) => break,
                            Err(_) => return false,
                        }
                    }
                }
                Op::CompleteOne => {
                    if let Some((id, len)) = dev_ready.pop()
                        && consumer.submit_used(id, len).is_err()
                    {
                        return false;
                    }
                }
            }

            if !free_list_consistent(&ring, &producer) {
                return false;
            }
        }

        // Drain remaining completions and reclaims
        while let Some((id, len)) = dev_ready.pop() {
            if consumer.submit_used(id, len).is_err() {
                return false;
            }
        }

        loop {
            match producer.poll_used() {
                Ok(_) => {}
                Err(RingError::WouldBlock) => break,
                Err(_) => return false,
            }
        }

        // whatever was never polled by the device is still outstanding
        let unpolled = consumer.peek_available().unwrap_or(false);
        unpolled || producer.num_free() == ring.len()
    }

    #[test]
    fn prop_interleaved_preserves_free_list() {
        #[cfg(miri)]
        let tests = 1;
        #[cfg(not(miri))]
        let tests = 100;

        QuickCheck::new()
            .tests(tests)
            .quickcheck(run_scenario as fn(Scenario) -> bool);
    }
}
