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

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};

use anyhow::{Result, bail};
use splitring::virtq::MemOps;

/// A flat region standing in for guest memory shared by driver and device.
///
/// Addresses start at `guest_base`, not at the host pointer, so ring code is
/// exercised with addresses it cannot dereference directly. Every access is
/// bounds checked; a bad peer address is an error, never a crash.
pub struct SharedMemory {
    storage: Box<[UnsafeCell<u64>]>,
    guest_base: u64,
    len: usize,
    next_free: AtomicUsize,
}

// SAFETY: plain byte copies only happen on memory the ring protocol hands
// from one side to the other through the acquire/release index accesses,
// which are real atomics.
unsafe impl Sync for SharedMemory {}
// SAFETY: the storage is owned and only reached through `&self`.
unsafe impl Send for SharedMemory {}

impl SharedMemory {
    /// Zeroed region of `len` bytes visible at `guest_base`.
    ///
    /// `guest_base` must be 8-byte aligned so guest alignment carries over
    /// to the host storage.
    pub fn new(guest_base: u64, len: usize) -> Self {
        assert!(guest_base % 8 == 0, "guest base {guest_base:#x} is not 8-byte aligned");
        let words = len.div_ceil(8);
        let storage = (0..words).map(|_| UnsafeCell::new(0u64)).collect();
        Self {
            storage,
            guest_base,
            len,
            next_free: AtomicUsize::new(0),
        }
    }

    pub fn guest_base(&self) -> u64 {
        self.guest_base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Carve `size` bytes aligned to `align` out of the region.
    ///
    /// The region is a bump allocator; nothing is ever returned.
    pub fn alloc(&self, size: usize, align: usize) -> Result<u64> {
        if !align.is_power_of_two() {
            bail!("alignment {align} is not a power of two");
        }

        let mut cur = self.next_free.load(Ordering::Relaxed);
        loop {
            let addr = (self.guest_base as usize + cur).next_multiple_of(align);
            let start = addr - self.guest_base as usize;
            let end = start + size;
            if end > self.len {
                bail!("out of shared memory: {size} bytes at {align} alignment");
            }
            match self.next_free.compare_exchange(cur, end, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => {
                    self.fill(addr as u64, size, 0)?;
                    return Ok(addr as u64);
                }
                Err(actual) => cur = actual,
            }
        }
    }

    /// Set `len` bytes at `addr` to `byte`.
    pub fn fill(&self, addr: u64, len: usize, byte: u8) -> Result<()> {
        let dst = self.ptr_for(addr, len)?;
        // SAFETY: ptr_for checked that [addr, addr + len) is inside storage
        unsafe { ptr::write_bytes(dst, byte, len) };
        Ok(())
    }

    fn ptr_for(&self, addr: u64, len: usize) -> Result<*mut u8> {
        let Some(offset) = addr.checked_sub(self.guest_base) else {
            bail!("address {addr:#x} below shared memory");
        };
        let offset = offset as usize;
        match offset.checked_add(len) {
            Some(end) if end <= self.len => {}
            _ => bail!("access of {len} bytes at {addr:#x} outside shared memory"),
        }
        let base = self.storage.as_ptr() as *mut u8;
        Ok(base.wrapping_add(offset))
    }

    fn atomic_u16(&self, addr: u64) -> Result<&AtomicU16> {
        if addr % 2 != 0 {
            bail!("index address {addr:#x} is not 2-byte aligned");
        }
        let ptr = self.ptr_for(addr, 2)?;
        // SAFETY: in bounds, 2-byte aligned since storage is 8-byte aligned,
        // and the storage outlives the returned reference
        Ok(unsafe { AtomicU16::from_ptr(ptr.cast()) })
    }
}

impl MemOps for SharedMemory {
    type Error = anyhow::Error;

    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize> {
        let src = self.ptr_for(addr, dst.len())?;
        // SAFETY: bounds checked above, dst is a distinct host buffer
        unsafe { ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
        Ok(dst.len())
    }

    fn write(&self, addr: u64, src: &[u8]) -> Result<usize> {
        let dst = self.ptr_for(addr, src.len())?;
        // SAFETY: bounds checked above, src is a distinct host buffer
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
        Ok(src.len())
    }

    fn load_acquire(&self, addr: u64) -> Result<u16> {
        Ok(self.atomic_u16(addr)?.load(Ordering::Acquire))
    }

    fn store_release(&self, addr: u64, val: u16) -> Result<()> {
        self.atomic_u16(addr)?.store(val, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_are_checked() {
        let mem = SharedMemory::new(0x10000, 64);
        let mut buf = [0u8; 8];
        assert!(mem.read(0x10000, &mut buf).is_ok());
        assert!(mem.read(0x10038, &mut buf).is_ok());
        assert!(mem.read(0x10039, &mut buf).is_err());
        assert!(mem.read(0xffff, &mut buf).is_err());
        assert!(mem.load_acquire(0x10001).is_err());
    }

    #[test]
    fn alloc_aligns_and_exhausts() {
        let mem = SharedMemory::new(0x10000, 8192);
        let a = mem.alloc(10, 16).unwrap();
        let b = mem.alloc(10, 4096).unwrap();
        assert_eq!(a, 0x10000);
        assert_eq!(b, 0x11000);
        assert!(mem.alloc(8192, 16).is_err());
    }
}
