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

//! Memory Access Traits for Virtqueue Operations
//!
//! This module defines the [`MemOps`] trait that abstracts memory access patterns
//! required by the split ring. The same ring code then runs over a guest-physical
//! window on the device side, over the driver's own DMA memory, or over a plain
//! buffer in tests.

use alloc::sync::Arc;
use core::sync::atomic::{Ordering, fence};

use bytemuck::Pod;

use crate::endian::{ByteOrder, WireInt};

/// Backend-provided memory access for virtqueue.
///
/// # Safety
///
/// Implementations must ensure that:
/// - Pointers passed to methods are valid for the duration of the call
/// - Memory ordering guarantees are upheld as documented
/// - Reads and writes don't cause undefined behavior (alignment, validity)
///
/// Addresses come from the peer and are untrusted; implementations must
/// return an error rather than touch memory outside the shared region.
///
/// [`RingProducer`]: super::RingProducer
/// [`RingConsumer`]: super::RingConsumer
pub trait MemOps {
    type Error;

    /// Read bytes from shared memory.
    ///
    /// Used for descriptor table entries, ring slots, and indirect tables.
    ///
    /// # Returns
    ///
    /// Number of bytes actually read (should equal `dst.len()` on success).
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error>;

    /// Write bytes to shared memory.
    ///
    /// # Returns
    ///
    /// Number of bytes actually written (should equal `src.len()` on success).
    fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error>;

    /// Load a u16 with acquire semantics.
    ///
    /// Every read issued after this load observes the writes the peer made
    /// before its matching [`store_release`](Self::store_release).
    ///
    /// `addr` must translate to a valid, 2-byte aligned location.
    fn load_acquire(&self, addr: u64) -> Result<u16, Self::Error>;

    /// Store a u16 with release semantics.
    ///
    /// Every write issued before this store is visible to a peer that
    /// observes the stored value with [`load_acquire`](Self::load_acquire).
    fn store_release(&self, addr: u64, val: u16) -> Result<(), Self::Error>;

    /// Full memory barrier.
    ///
    /// Orders the publication of an index against the subsequent read of the
    /// peer's event field or flags.
    fn fence(&self) {
        fence(Ordering::SeqCst);
    }

    /// Read a Pod type at the given address.
    fn read_val<T: Pod>(&self, addr: u64) -> Result<T, Self::Error> {
        let mut val = T::zeroed();
        let bytes = bytemuck::bytes_of_mut(&mut val);

        self.read(addr, bytes)?;
        Ok(val)
    }

    /// Write a Pod type at the given address.
    fn write_val<T: Pod>(&self, addr: u64, val: T) -> Result<(), Self::Error> {
        let bytes = bytemuck::bytes_of(&val);
        self.write(addr, bytes)?;
        Ok(())
    }

    /// Read an integer field stored in `order`.
    fn read_int<T: WireInt>(&self, addr: u64, order: ByteOrder) -> Result<T, Self::Error> {
        Ok(self.read_val::<T>(addr)?.from_wire(order))
    }

    /// Write an integer field in `order`.
    fn write_int<T: WireInt>(&self, addr: u64, val: T, order: ByteOrder) -> Result<(), Self::Error> {
        self.write_val(addr, val.to_wire(order))
    }

    /// Acquire-load a ring index stored in `order`.
    fn load_index(&self, addr: u64, order: ByteOrder) -> Result<u16, Self::Error> {
        Ok(self.load_acquire(addr)?.from_wire(order))
    }

    /// Release-store a ring index in `order`.
    fn store_index(&self, addr: u64, val: u16, order: ByteOrder) -> Result<(), Self::Error> {
        self.store_release(addr, val.to_wire(order))
    }
}

impl<M: MemOps + ?Sized> MemOps for &M {
    type Error = M::Error;

    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error> {
        (**self).read(addr, dst)
    }

    fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error> {
        (**self).write(addr, src)
    }

    fn load_acquire(&self, addr: u64) -> Result<u16, Self::Error> {
        (**self).load_acquire(addr)
    }

    fn store_release(&self, addr: u64, val: u16) -> Result<(), Self::Error> {
        (**self).store_release(addr, val)
    }

    fn fence(&self) {
        (**self).fence()
    }
}

impl<M: MemOps + ?Sized> MemOps for Arc<M> {
    type Error = M::Error;

    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error> {
        (**self).read(addr, dst)
    }

    fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error> {
        (**self).write(addr, src)
    }

    fn load_acquire(&self, addr: u64) -> Result<u16, Self::Error> {
        (**self).load_acquire(addr)
    }

    fn store_release(&self, addr: u64, val: u16) -> Result<(), Self::Error> {
        (**self).store_release(addr, val)
    }

    fn fence(&self) {
        (**self).fence()
    }
}
