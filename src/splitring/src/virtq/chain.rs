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

//! Descriptor Chains
//!
//! A transfer request is a chain of descriptors linked through `next`. The
//! producer builds chains with [`BufferChainBuilder`]; the consumer turns a
//! head id back into a [`BufferChain`] with [`resolve_chain`], which treats
//! every descriptor as untrusted input.
//!
//! ```text
//! head=3                                   indirect table at 0x9000
//! ┌──────────────┐    ┌──────────────┐     ┌─────────────┐
//! │ desc[3]      │    │ desc[0]      │ ──> │ [0] R  NEXT │
//! │ R  NEXT -> 0 │───>│ INDIRECT     │     │ [1] W       │
//! └──────────────┘    │ len = 2 * 16 │     └─────────────┘
//!                     └──────────────┘
//! ```

use core::marker::PhantomData;

use bytemuck::Zeroable;
use smallvec::SmallVec;
use thiserror::Error;

use super::desc::{DescTable, Descriptor};
use super::{MemOps, RingError, RingOptions};

/// A single buffer element in a scatter-gather list.
///
/// Represents one contiguous memory region that the device will read from
/// or write to. Multiple elements can be chained together to form a
/// [`BufferChain`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Zeroable)]
pub struct BufferElement {
    /// Address of buffer
    pub addr: u64,
    /// Length of the buffer in bytes
    pub len: u32,
    /// Is this buffer writable
    pub writable: bool,
}

impl From<&Descriptor> for BufferElement {
    fn from(desc: &Descriptor) -> Self {
        Self {
            addr: desc.addr,
            len: desc.len,
            writable: desc.is_writeable(),
        }
    }
}

/// Ways a descriptor chain published by the producer can be malformed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainError {
    #[error("descriptor index {0} is out of range")]
    OutOfRange(u16),
    #[error("chain is longer than its descriptor table")]
    ChainTooLong,
    #[error("descriptor {0} has zero length but is not the last in its chain")]
    ZeroLength(u16),
    #[error("descriptor {0} sets both INDIRECT and NEXT")]
    IndirectWithNext(u16),
    #[error("indirect table length {0} is not a non-zero multiple of 16")]
    BadIndirectLen(u32),
    #[error("indirect table contains an INDIRECT descriptor")]
    NestedIndirect,
    #[error("INDIRECT descriptor without indirect descriptor support")]
    IndirectNotNegotiated,
    #[error("indirect table of {0} descriptors exceeds the limit")]
    IndirectTooLong(usize),
    #[error("readable descriptor after a writable one")]
    BadOrdering,
    #[error("Backend memory error")]
    MemError,
}

/// Type-state: Can add readable buffers
pub struct Readable;

/// Type-state: Can add writable buffers (no more readables allowed)
pub struct Writable;

/// A builder for buffer chains using type-state to enforce readable/writable order.
///
/// Upholds invariants: at least one buffer must be present in the chain,
/// and readable buffers must be added before writable buffers.
#[derive(Debug, Default)]
pub struct BufferChainBuilder<T> {
    elems: SmallVec<[BufferElement; 16]>,
    split: usize,
    marker: PhantomData<T>,
}

impl BufferChainBuilder<Readable> {
    /// Create a new builder in the [`Readable`] state.
    pub fn new() -> Self {
        Self {
            elems: Default::default(),
            split: 0,
            marker: PhantomData,
        }
    }

    /// Add a readable buffer (device reads from this).
    pub fn readable(mut self, addr: u64, len: u32) -> Self {
        self.elems.push(BufferElement {
            addr,
            len,
            writable: false,
        });
        self.split += 1;
        self
    }

    /// Add a writable buffer (device writes to this).
    ///
    /// This transitions to Writable state so no more readable buffers can be added.
    pub fn writable(mut self, addr: u64, len: u32) -> BufferChainBuilder<Writable> {
        self.elems.push(BufferElement {
            addr,
            len,
            writable: true,
        });

        BufferChainBuilder {
            elems: self.elems,
            split: self.split,
            marker: PhantomData,
        }
    }

    /// Build a buffer chain with only readable buffers.
    pub fn build(self) -> Result<BufferChain, RingError> {
        BufferChain::from_parts(self.elems, self.split)
    }
}

impl BufferChainBuilder<Writable> {
    /// Add writable buffer
    pub fn writable(mut self, addr: u64, len: u32) -> Self {
        self.elems.push(BufferElement {
            addr,
            len,
            writable: true,
        });
        self
    }

    /// Build the buffer chain.
    pub fn build(self) -> Result<BufferChain, RingError> {
        BufferChain::from_parts(self.elems, self.split)
    }
}

/// A chain of buffers, readable elements first.
///
/// On the producer side this is what gets submitted; on the consumer side it
/// is what a published head id resolves to.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BufferChain {
    /// All buffer elements (readable followed by writable)
    elems: SmallVec<[BufferElement; 16]>,
    /// Split index between readable and writable buffers
    split: usize,
}

impl BufferChain {
    fn from_parts(elems: SmallVec<[BufferElement; 16]>, split: usize) -> Result<Self, RingError> {
        if elems.is_empty() {
            return Err(RingError::EmptyChain);
        }

        Ok(Self { elems, split })
    }

    /// Get all buffer elements in the chain.
    pub fn elems(&self) -> &[BufferElement] {
        self.elems.as_slice()
    }

    /// Get readable buffers in chain
    pub fn readables(&self) -> &[BufferElement] {
        &self.elems[..self.split]
    }

    /// Get writable buffers in chain
    pub fn writables(&self) -> &[BufferElement] {
        &self.elems[self.split..]
    }

    /// Get total number of buffers in chain
    // Note: buffer chain cannot be empty by construction
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.elems.len()
    }

    /// Total capacity of the writable buffers.
    pub fn writable_len(&self) -> u64 {
        self.writables().iter().map(|e| e.len as u64).sum()
    }
}

/// Chain under construction during resolution.
struct Walk {
    elems: SmallVec<[BufferElement; 16]>,
    split: usize,
}

impl Walk {
    fn push(&mut self, desc: &Descriptor) -> Result<(), ChainError> {
        let elem = BufferElement::from(desc);
        if !elem.writable {
            if self.split != self.elems.len() {
                return Err(ChainError::BadOrdering);
            }
            self.split += 1;
        }
        self.elems.push(elem);
        Ok(())
    }
}

/// Resolve the chain starting at `head` into its buffer list.
///
/// Follows `next` links through `table` and expands at most one level of
/// indirect table. Descriptor contents come from the producer and are not
/// trusted: every structural violation is reported as a [`ChainError`], and
/// the walk never visits more descriptors than the table holds.
pub fn resolve_chain<M: MemOps>(
    mem: &M,
    table: &DescTable,
    head: u16,
    opts: &RingOptions,
) -> Result<BufferChain, ChainError> {
    let mut walk = Walk {
        elems: SmallVec::new(),
        split: 0,
    };

    let mut idx = head;
    let mut steps = 0usize;

    loop {
        steps += 1;
        if steps > table.len() {
            return Err(ChainError::ChainTooLong);
        }

        let desc = read_desc(mem, table, idx, opts)?;

        if desc.is_indirect() {
            if desc.is_next() {
                return Err(ChainError::IndirectWithNext(idx));
            }
            resolve_indirect(mem, &desc, opts, &mut walk)?;
            break;
        }

        if desc.len == 0 && desc.is_next() {
            return Err(ChainError::ZeroLength(idx));
        }

        walk.push(&desc)?;

        if !desc.is_next() {
            break;
        }
        idx = desc.next;
    }

    Ok(BufferChain {
        elems: walk.elems,
        split: walk.split,
    })
}

fn resolve_indirect<M: MemOps>(
    mem: &M,
    desc: &Descriptor,
    opts: &RingOptions,
    walk: &mut Walk,
) -> Result<(), ChainError> {
    if !opts.indirect_desc {
        return Err(ChainError::IndirectNotNegotiated);
    }

    if desc.len == 0 || !(desc.len as usize).is_multiple_of(Descriptor::SIZE) {
        return Err(ChainError::BadIndirectLen(desc.len));
    }

    let count = desc.len as usize / Descriptor::SIZE;
    if count > opts.max_indirect_len as usize {
        return Err(ChainError::IndirectTooLong(count));
    }

    let table = DescTable::new(desc.addr, count);
    let mut idx = 0u16;

    for _ in 0..count {
        let desc = read_desc(mem, &table, idx, opts)?;

        if desc.is_indirect() {
            return Err(ChainError::NestedIndirect);
        }

        if desc.len == 0 && desc.is_next() {
            return Err(ChainError::ZeroLength(idx));
        }

        walk.push(&desc)?;

        if !desc.is_next() {
            return Ok(());
        }
        idx = desc.next;
    }

    Err(ChainError::ChainTooLong)
}

fn read_desc<M: MemOps>(
    mem: &M,
    table: &DescTable,
    idx: u16,
    opts: &RingOptions,
) -> Result<Descriptor, ChainError> {
    let addr = table.desc_addr(idx).ok_or(ChainError::OutOfRange(idx))?;
    Descriptor::read(mem, addr, opts.order).map_err(|_| ChainError::MemError)
}

#[cfg(test)]
mod tests {
    use alloc::vec;
    use alloc::vec::Vec;
    use core::cell::RefCell;
    use core::convert::Infallible;

    use super::*;
    use crate::endian::ByteOrder;
    use crate::virtq::DescFlags;

    /// Flat little memory starting at address 0.
    struct FlatMem(RefCell<Vec<u8>>);

    impl FlatMem {
        fn new(size: usize) -> Self {
            Self(RefCell::new(vec![0; size]))
        }

        fn put(&self, table: u64, idx: u16, desc: Descriptor) {
            desc.write(self, table + idx as u64 * 16, ByteOrder::Little)
                .unwrap();
        }
    }

    impl MemOps for FlatMem {
        type Error = Infallible;

        fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error> {
            let a = addr as usize;
            dst.copy_from_slice(&self.0.borrow()[a..a + dst.len()]);
            Ok(dst.len())
        }

        fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error> {
            let a = addr as usize;
            self.0.borrow_mut()[a..a + src.len()].copy_from_slice(src);
            Ok(src.len())
        }

        fn load_acquire(&self, addr: u64) -> Result<u16, Self::Error> {
            self.read_val(addr)
        }

        fn store_release(&self, addr: u64, val: u16) -> Result<(), Self::Error> {
            self.write_val(addr, val)
        }
    }

    const TABLE: u64 = 0;
    const INDIRECT: u64 = 0x800;

    fn desc(addr: u64, len: u32, flags: DescFlags, next: u16) -> Descriptor {
        Descriptor::new(addr, len, flags, next)
    }

    fn opts() -> RingOptions {
        RingOptions {
            indirect_desc: true,
            ..RingOptions::default()
        }
    }

    fn table() -> DescTable {
        DescTable::new(TABLE, 8)
    }

    #[test]
    fn builder_enforces_non_empty() {
        assert!(matches!(
            BufferChainBuilder::new().build(),
            Err(RingError::EmptyChain)
        ));
    }

    #[test]
    fn builder_keeps_readables_first() {
        let chain = BufferChainBuilder::new()
            .readable(0x1000, 10)
            .readable(0x2000, 20)
            .writable(0x3000, 30)
            .writable(0x4000, 40)
            .build()
            .unwrap();

        assert_eq!(chain.len(), 4);
        assert_eq!(chain.readables().len(), 2);
        assert_eq!(chain.writables().len(), 2);
        assert_eq!(chain.writable_len(), 70);
        assert!(chain.writables().iter().all(|e| e.writable));
    }

    #[test]
    fn builder_chains_writables_after_the_first() {
        let chain = BufferChainBuilder::new()
            .readable(0x1000, 1)
            .writable(0x2000, 2)
            .writable(0x3000, 3)
            .build()
            .unwrap();
        assert_eq!(chain.readables().len(), 1);
        assert_eq!(chain.writables().len(), 2);
        assert_eq!(chain.writables()[1].addr, 0x3000);
        assert!(chain.writables().iter().all(|e| e.writable));

        let only_writes = BufferChainBuilder::new()
            .writable(0x1000, 8)
            .writable(0x2000, 8)
            .writable(0x3000, 8)
            .build()
            .unwrap();
        assert!(only_writes.readables().is_empty());
        assert_eq!(only_writes.writable_len(), 24);
    }

    #[test]
    fn resolves_read_then_write_chain() {
        let mem = FlatMem::new(0x1000);
        mem.put(TABLE, 0, desc(0xA000, 10, DescFlags::NEXT, 5));
        mem.put(TABLE, 5, desc(0xB000, 20, DescFlags::WRITE, 0));

        let chain = resolve_chain(&mem, &table(), 0, &opts()).unwrap();
        assert_eq!(
            chain.elems(),
            &[
                BufferElement {
                    addr: 0xA000,
                    len: 10,
                    writable: false
                },
                BufferElement {
                    addr: 0xB000,
                    len: 20,
                    writable: true
                },
            ]
        );
        assert_eq!(chain.readables().len(), 1);
    }

    #[test]
    fn rejects_cycle() {
        let mem = FlatMem::new(0x1000);
        mem.put(TABLE, 0, desc(0xA000, 10, DescFlags::NEXT, 1));
        mem.put(TABLE, 1, desc(0xB000, 10, DescFlags::NEXT, 0));

        assert_eq!(
            resolve_chain(&mem, &table(), 0, &opts()),
            Err(ChainError::ChainTooLong)
        );
    }

    #[test]
    fn rejects_self_loop() {
        let mem = FlatMem::new(0x1000);
        mem.put(TABLE, 2, desc(0xA000, 10, DescFlags::NEXT, 2));

        assert_eq!(
            resolve_chain(&mem, &table(), 2, &opts()),
            Err(ChainError::ChainTooLong)
        );
    }

    #[test]
    fn rejects_out_of_range_ids() {
        let mem = FlatMem::new(0x1000);
        assert_eq!(
            resolve_chain(&mem, &table(), 8, &opts()),
            Err(ChainError::OutOfRange(8))
        );

        mem.put(TABLE, 0, desc(0xA000, 10, DescFlags::NEXT, 9));
        assert_eq!(
            resolve_chain(&mem, &table(), 0, &opts()),
            Err(ChainError::OutOfRange(9))
        );
    }

    #[test]
    fn zero_length_allowed_only_at_tail() {
        let mem = FlatMem::new(0x1000);
        mem.put(TABLE, 0, desc(0xA000, 10, DescFlags::NEXT, 1));
        mem.put(TABLE, 1, desc(0xB000, 0, DescFlags::WRITE, 0));
        assert!(resolve_chain(&mem, &table(), 0, &opts()).is_ok());

        mem.put(TABLE, 1, desc(0xB000, 0, DescFlags::NEXT, 2));
        mem.put(TABLE, 2, desc(0xC000, 4, DescFlags::WRITE, 0));
        assert_eq!(
            resolve_chain(&mem, &table(), 0, &opts()),
            Err(ChainError::ZeroLength(1))
        );
    }

    #[test]
    fn rejects_readable_after_writable() {
        let mem = FlatMem::new(0x1000);
        mem.put(TABLE, 0, desc(0xA000, 10, DescFlags::WRITE | DescFlags::NEXT, 1));
        mem.put(TABLE, 1, desc(0xB000, 10, DescFlags::empty(), 0));

        assert_eq!(
            resolve_chain(&mem, &table(), 0, &opts()),
            Err(ChainError::BadOrdering)
        );
    }

    #[test]
    fn resolves_indirect_table() {
        let mem = FlatMem::new(0x1000);
        mem.put(TABLE, 3, desc(0xA000, 8, DescFlags::NEXT, 0));
        mem.put(TABLE, 0, desc(INDIRECT, 32, DescFlags::INDIRECT, 0));
        mem.put(INDIRECT, 0, desc(0xB000, 16, DescFlags::NEXT, 1));
        mem.put(INDIRECT, 1, desc(0xC000, 64, DescFlags::WRITE, 0));

        let chain = resolve_chain(&mem, &table(), 3, &opts()).unwrap();
        let addrs: Vec<u64> = chain.elems().iter().map(|e| e.addr).collect();
        assert_eq!(addrs, vec![0xA000, 0xB000, 0xC000]);
        assert_eq!(chain.readables().len(), 2);
        assert_eq!(chain.writable_len(), 64);
    }

    #[test]
    fn rejects_indirect_without_feature() {
        let mem = FlatMem::new(0x1000);
        mem.put(TABLE, 0, desc(INDIRECT, 16, DescFlags::INDIRECT, 0));

        assert_eq!(
            resolve_chain(&mem, &table(), 0, &RingOptions::default()),
            Err(ChainError::IndirectNotNegotiated)
        );
    }

    #[test]
    fn rejects_indirect_with_next() {
        let mem = FlatMem::new(0x1000);
        mem.put(TABLE, 0, desc(INDIRECT, 16, DescFlags::INDIRECT | DescFlags::NEXT, 1));

        assert_eq!(
            resolve_chain(&mem, &table(), 0, &opts()),
            Err(ChainError::IndirectWithNext(0))
        );
    }

    #[test]
    fn rejects_bad_indirect_lengths() {
        let mem = FlatMem::new(0x1000);
        mem.put(TABLE, 0, desc(INDIRECT, 0, DescFlags::INDIRECT, 0));
        assert_eq!(
            resolve_chain(&mem, &table(), 0, &opts()),
            Err(ChainError::BadIndirectLen(0))
        );

        mem.put(TABLE, 0, desc(INDIRECT, 24, DescFlags::INDIRECT, 0));
        assert_eq!(
            resolve_chain(&mem, &table(), 0, &opts()),
            Err(ChainError::BadIndirectLen(24))
        );

        let small = RingOptions {
            max_indirect_len: 2,
            ..opts()
        };
        mem.put(TABLE, 0, desc(INDIRECT, 48, DescFlags::INDIRECT, 0));
        assert_eq!(
            resolve_chain(&mem, &table(), 0, &small),
            Err(ChainError::IndirectTooLong(3))
        );
    }

    #[test]
    fn rejects_nested_indirect() {
        let mem = FlatMem::new(0x1000);
        mem.put(TABLE, 0, desc(INDIRECT, 32, DescFlags::INDIRECT, 0));
        mem.put(INDIRECT, 0, desc(0xB000, 16, DescFlags::NEXT, 1));
        mem.put(INDIRECT, 1, desc(INDIRECT, 16, DescFlags::INDIRECT, 0));

        assert_eq!(
            resolve_chain(&mem, &table(), 0, &opts()),
            Err(ChainError::NestedIndirect)
        );
    }

    #[test]
    fn indirect_table_bounds_its_own_walk() {
        let mem = FlatMem::new(0x1000);
        mem.put(TABLE, 0, desc(INDIRECT, 32, DescFlags::INDIRECT, 0));
        mem.put(INDIRECT, 0, desc(0xB000, 16, DescFlags::NEXT, 2));
        assert_eq!(
            resolve_chain(&mem, &table(), 0, &opts()),
            Err(ChainError::OutOfRange(2))
        );

        mem.put(INDIRECT, 0, desc(0xB000, 16, DescFlags::NEXT, 1));
        mem.put(INDIRECT, 1, desc(0xC000, 16, DescFlags::NEXT, 0));
        assert_eq!(
            resolve_chain(&mem, &table(), 0, &opts()),
            Err(ChainError::ChainTooLong)
        );
    }
}
