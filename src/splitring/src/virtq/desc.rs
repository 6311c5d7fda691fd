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

//! Virtqueue Descriptor Types
//!
//! Wire structures of the split ring: the 16-byte descriptor and the 8-byte
//! used ring element. Values held in these structs are host values; the
//! `read`/`write` helpers convert to and from the negotiated byte order.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use super::MemOps;
use crate::endian::{ByteOrder, WireInt};

bitflags! {
    /// Descriptor flags.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct DescFlags: u16 {
        /// This marks a buffer as continuing via the next field.
        const NEXT     = 1 << 0;
        /// This marks a buffer as device write-only (otherwise device read-only).
        const WRITE    = 1 << 1;
        /// This means the buffer contains a table of descriptors.
        const INDIRECT = 1 << 2;
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "fuzzing", derive(arbitrary::Arbitrary))]
pub struct Descriptor {
    /// Address of the buffer.
    pub addr: u64,
    /// Length of the buffer in bytes.
    pub len: u32,
    /// Flags (NEXT, WRITE, INDIRECT).
    pub flags: u16,
    /// Index of the next descriptor when NEXT is set.
    pub next: u16,
}

const _: () = assert!(core::mem::size_of::<Descriptor>() == 16);
const _: () = assert!(Descriptor::ADDR_OFFSET == 0);
const _: () = assert!(Descriptor::LEN_OFFSET == 8);
const _: () = assert!(Descriptor::FLAGS_OFFSET == 12);
const _: () = assert!(Descriptor::NEXT_OFFSET == 14);

impl Descriptor {
    pub const SIZE: usize = core::mem::size_of::<Self>();
    pub const ALIGN: usize = core::mem::align_of::<Self>();

    pub const ADDR_OFFSET: usize = core::mem::offset_of!(Self, addr);
    pub const LEN_OFFSET: usize = core::mem::offset_of!(Self, len);
    pub const FLAGS_OFFSET: usize = core::mem::offset_of!(Self, flags);
    pub const NEXT_OFFSET: usize = core::mem::offset_of!(Self, next);

    pub fn new(addr: u64, len: u32, flags: DescFlags, next: u16) -> Self {
        Self {
            addr,
            len,
            flags: flags.bits(),
            next,
        }
    }

    /// Get flags as a [`DescFlags`] bitfield.
    #[inline]
    pub fn flags(&self) -> DescFlags {
        DescFlags::from_bits_truncate(self.flags)
    }

    /// Is this descriptor writeable by the device?
    #[inline]
    pub fn is_writeable(&self) -> bool {
        self.flags().contains(DescFlags::WRITE)
    }

    /// Does this descriptor point to a next descriptor in the chain?
    #[inline]
    pub fn is_next(&self) -> bool {
        self.flags().contains(DescFlags::NEXT)
    }

    /// Does this descriptor point to an indirect table?
    #[inline]
    pub fn is_indirect(&self) -> bool {
        self.flags().contains(DescFlags::INDIRECT)
    }

    /// Read a descriptor stored in `order`.
    pub fn read<M: MemOps>(mem: &M, addr: u64, order: ByteOrder) -> Result<Self, M::Error> {
        let raw: Self = mem.read_val(addr)?;
        Ok(Self {
            addr: raw.addr.from_wire(order),
            len: raw.len.from_wire(order),
            flags: raw.flags.from_wire(order),
            next: raw.next.from_wire(order),
        })
    }

    /// Write a descriptor in `order`.
    pub fn write<M: MemOps>(&self, mem: &M, addr: u64, order: ByteOrder) -> Result<(), M::Error> {
        let raw = Self {
            addr: self.addr.to_wire(order),
            len: self.len.to_wire(order),
            flags: self.flags.to_wire(order),
            next: self.next.to_wire(order),
        };
        mem.write_val(addr, raw)
    }
}

/// Element of the used ring: head id of a completed chain and the number of
/// bytes the device wrote into it.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct UsedElem {
    pub id: u32,
    pub len: u32,
}

const _: () = assert!(core::mem::size_of::<UsedElem>() == 8);

impl UsedElem {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn read<M: MemOps>(mem: &M, addr: u64, order: ByteOrder) -> Result<Self, M::Error> {
        let raw: Self = mem.read_val(addr)?;
        Ok(Self {
            id: raw.id.from_wire(order),
            len: raw.len.from_wire(order),
        })
    }

    pub fn write<M: MemOps>(&self, mem: &M, addr: u64, order: ByteOrder) -> Result<(), M::Error> {
        let raw = Self {
            id: self.id.to_wire(order),
            len: self.len.to_wire(order),
        };
        mem.write_val(addr, raw)
    }
}

/// A table of descriptors stored in shared memory.
///
/// Used both for the queue's own table and for indirect tables pointed to by
/// an `INDIRECT` descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescTable {
    base_addr: u64,
    size: usize,
}

impl DescTable {
    pub const DEFAULT_LEN: usize = 256;

    /// Describe `size` descriptors starting at `base_addr`.
    pub const fn new(base_addr: u64, size: usize) -> Self {
        Self { base_addr, size }
    }

    /// Address of descriptor `idx`, or None if idx is out of bounds.
    pub fn desc_addr(&self, idx: u16) -> Option<u64> {
        if idx as usize >= self.size {
            return None;
        }

        self.base_addr
            .checked_add(idx as u64 * Descriptor::SIZE as u64)
    }

    /// Get number of descriptors in table
    pub fn len(&self) -> usize {
        self.size
    }

    /// Is the descriptor table empty?
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn base_addr(&self) -> u64 {
        self.base_addr
    }
}
