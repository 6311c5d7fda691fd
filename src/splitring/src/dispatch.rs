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

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;
use thiserror::Error;

/// Guest address window a handler serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRange {
    pub base: u64,
    pub len: u64,
}

impl IoRange {
    pub const fn new(base: u64, len: u64) -> Self {
        Self { base, len }
    }

    /// Does `[addr, addr + len)` lie fully inside this range?
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        let Some(end) = addr.checked_add(len as u64) else {
            return false;
        };
        let Some(limit) = self.base.checked_add(self.len) else {
            return false;
        };
        addr >= self.base && end <= limit
    }
}

/// Why a handler did not complete an access.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    #[error("operation not supported by this handler")]
    Unsupported,
    #[error("handler failed with errno {0}")]
    Failed(i32),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no handler accepted the access at {addr:#x} ({len} bytes)")]
    Unsupported { addr: u64, len: usize },
}

/// A device model reachable through an [`IoBus`].
///
/// Both operations default to [`IoError::Unsupported`]; an `Err` of either
/// kind passes the access on to the next handler.
pub trait IoHandler: Send + Sync {
    fn range(&self) -> IoRange;

    fn read(&self, _addr: u64, _out: &mut [u8]) -> Result<(), IoError> {
        Err(IoError::Unsupported)
    }

    fn write(&self, _addr: u64, _data: &[u8]) -> Result<(), IoError> {
        Err(IoError::Unsupported)
    }
}

/// Registration token returned by [`IoBus::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Inner {
    next_id: u64,
    handlers: Vec<(HandlerId, Arc<dyn IoHandler>)>,
}

/// Ordered first-match chain of [`IoHandler`]s.
///
/// Registration, removal and dispatch all take the same lock, so a handler
/// never runs while the chain changes.
pub struct IoBus {
    inner: Mutex<Inner>,
}

impl IoBus {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 0,
                handlers: Vec::new(),
            }),
        }
    }

    /// Append `handler` to the end of the chain.
    pub fn register(&self, handler: Arc<dyn IoHandler>) -> HandlerId {
        let mut inner = self.inner.lock();
        let id = HandlerId(inner.next_id);
        inner.next_id += 1;
        log::debug!("registered io handler {:?} at {:x?}", id, handler.range());
        inner.handlers.push((id, handler));
        id
    }

    /// Remove a handler from the chain and hand it back.
    ///
    /// The caller drops it after the lock is released.
    pub fn unregister(&self, id: HandlerId) -> Option<Arc<dyn IoHandler>> {
        let mut inner = self.inner.lock();
        let pos = inner.handlers.iter().position(|(h, _)| *h == id)?;
        Some(inner.handlers.remove(pos).1)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offer a read to each handler covering it until one handles it.
    pub fn read(&self, addr: u64, out: &mut [u8]) -> Result<(), DispatchError> {
        self.dispatch(addr, out.len(), |h| h.read(addr, out))
    }

    /// Offer a write to each handler covering it until one handles it.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), DispatchError> {
        self.dispatch(addr, data.len(), |h| h.write(addr, data))
    }

    fn dispatch(
        &self,
        addr: u64,
        len: usize,
        mut op: impl FnMut(&dyn IoHandler) -> Result<(), IoError>,
    ) -> Result<(), DispatchError> {
        let inner = self.inner.lock();
        for (id, handler) in inner.handlers.iter() {
            if !handler.range().contains(addr, len) {
                continue;
            }
            match op(handler.as_ref()) {
                Ok(()) => return Ok(()),
                Err(e) => log::trace!("io handler {:?} passed on {:#x}: {}", id, addr, e),
            }
        }
        Err(DispatchError::Unsupported { addr, len })
    }
}

impl Default for IoBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Reg {
        range: IoRange,
        value: u8,
        reads: AtomicUsize,
    }

    impl Reg {
        fn new(base: u64, len: u64, value: u8) -> Arc<Self> {
            Arc::new(Self {
                range: IoRange::new(base, len),
                value,
                reads: AtomicUsize::new(0),
            })
        }
    }

    impl IoHandler for Reg {
        fn range(&self) -> IoRange {
            self.range
        }

        fn read(&self, _addr: u64, out: &mut [u8]) -> Result<(), IoError> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            out.fill(self.value);
            Ok(())
        }
    }

    #[test]
    fn range_contains() {
        let r = IoRange::new(0x1000, 0x10);
        assert!(r.contains(0x1000, 0x10));
        assert!(r.contains(0x100c, 4));
        assert!(!r.contains(0x100d, 4));
        assert!(!r.contains(0xfff, 2));
        assert!(!r.contains(u64::MAX, 2));
    }

    #[test]
    fn first_registered_wins() {
        let bus = IoBus::new();
        let a = Reg::new(0x1000, 0x100, 0xaa);
        let b = Reg::new(0x1000, 0x100, 0xbb);
        bus.register(a.clone());
        bus.register(b.clone());

        let mut buf = [0u8; 4];
        bus.read(0x1010, &mut buf).unwrap();
        assert_eq!(buf, [0xaa; 4]);
        assert_eq!(b.reads.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn unsupported_write_falls_through_to_miss() {
        let bus = IoBus::new();
        bus.register(Reg::new(0x1000, 0x100, 0));
        assert_eq!(
            bus.write(0x1000, &[1]),
            Err(DispatchError::Unsupported {
                addr: 0x1000,
                len: 1
            })
        );
    }

    #[test]
    fn unregister_returns_handler() {
        let bus = IoBus::new();
        let a = Reg::new(0, 8, 1);
        let id = bus.register(a.clone());
        assert_eq!(bus.len(), 1);

        let removed = bus.unregister(id).unwrap();
        assert_eq!(removed.range(), a.range);
        assert!(bus.is_empty());
        assert!(bus.unregister(id).is_none());

        let mut buf = [0u8; 1];
        assert!(bus.read(0, &mut buf).is_err());
    }
}
