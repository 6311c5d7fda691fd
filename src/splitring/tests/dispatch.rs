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

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use splitring::dispatch::{DispatchError, IoBus, IoError, IoHandler, IoRange};

/// A bank of 32-bit registers.
struct Registers {
    range: IoRange,
    regs: [AtomicU32; 4],
    accesses: AtomicUsize,
}

impl Registers {
    fn new(base: u64) -> Arc<Self> {
        Arc::new(Self {
            range: IoRange::new(base, 16),
            regs: Default::default(),
            accesses: AtomicUsize::new(0),
        })
    }

    fn reg(&self, addr: u64) -> &AtomicU32 {
        &self.regs[((addr - self.range.base) / 4) as usize]
    }
}

impl IoHandler for Registers {
    fn range(&self) -> IoRange {
        self.range
    }

    fn read(&self, addr: u64, out: &mut [u8]) -> Result<(), IoError> {
        self.accesses.fetch_add(1, Ordering::SeqCst);
        if out.len() != 4 {
            return Err(IoError::Unsupported);
        }
        out.copy_from_slice(&self.reg(addr).load(Ordering::SeqCst).to_le_bytes());
        Ok(())
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<(), IoError> {
        self.accesses.fetch_add(1, Ordering::SeqCst);
        let bytes: [u8; 4] = data.try_into().map_err(|_| IoError::Unsupported)?;
        self.reg(addr).store(u32::from_le_bytes(bytes), Ordering::SeqCst);
        Ok(())
    }
}

/// Read-only byte window overlapping the register bank.
struct Rom {
    range: IoRange,
}

impl IoHandler for Rom {
    fn range(&self) -> IoRange {
        self.range
    }

    fn read(&self, addr: u64, out: &mut [u8]) -> Result<(), IoError> {
        for (i, b) in out.iter_mut().enumerate() {
            *b = (addr - self.range.base) as u8 + i as u8;
        }
        Ok(())
    }
}

fn read_u32(bus: &IoBus, addr: u64) -> Result<u32, DispatchError> {
    let mut buf = [0u8; 4];
    bus.read(addr, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

#[test]
fn disjoint_handlers_each_see_their_range() {
    let bus = IoBus::new();
    let a = Registers::new(0x1000);
    let b = Registers::new(0x2000);
    bus.register(a.clone());
    bus.register(b.clone());

    bus.write(0x1004, &7u32.to_le_bytes()).unwrap();
    bus.write(0x2008, &9u32.to_le_bytes()).unwrap();
    assert_eq!(read_u32(&bus, 0x1004).unwrap(), 7);
    assert_eq!(read_u32(&bus, 0x2008).unwrap(), 9);
    assert_eq!(a.accesses.load(Ordering::SeqCst), 2);
    assert_eq!(b.accesses.load(Ordering::SeqCst), 2);
}

#[test]
fn overlapping_handlers_are_tried_in_order() {
    let bus = IoBus::new();
    let regs = Registers::new(0x1000);
    bus.register(regs.clone());
    bus.register(Arc::new(Rom {
        range: IoRange::new(0x1000, 0x100),
    }));
    bus.register(Registers::new(0x3000));

    // full-width register reads stop at the first handler
    bus.write(0x1000, &0xdead_beefu32.to_le_bytes()).unwrap();
    assert_eq!(read_u32(&bus, 0x1000).unwrap(), 0xdead_beef);

    // a byte read is declined by the registers and served by the rom
    let mut byte = [0u8; 1];
    bus.read(0x1002, &mut byte).unwrap();
    assert_eq!(byte, [2]);

    // beyond the registers only the rom covers the access
    let mut buf = [0u8; 2];
    bus.read(0x1020, &mut buf).unwrap();
    assert_eq!(buf, [0x20, 0x21]);

    // nobody writes a byte at 0x1002
    assert_eq!(
        bus.write(0x1002, &[1]),
        Err(DispatchError::Unsupported {
            addr: 0x1002,
            len: 1
        })
    );
}

#[test]
fn misses_are_errors_not_crashes() {
    let bus = IoBus::new();
    assert!(read_u32(&bus, 0).is_err());

    bus.register(Registers::new(0x1000));
    assert_eq!(
        read_u32(&bus, 0x100e),
        Err(DispatchError::Unsupported {
            addr: 0x100e,
            len: 4
        })
    );
    assert!(read_u32(&bus, 0x5000).is_err());
}

#[test]
fn unregistered_handler_is_dropped_by_the_caller() {
    let bus = IoBus::new();
    let regs = Registers::new(0x1000);
    let weak: Weak<Registers> = Arc::downgrade(&regs);
    let id = bus.register(regs);

    let handler = bus.unregister(id).unwrap();
    assert!(weak.upgrade().is_some());
    drop(handler);
    assert!(weak.upgrade().is_none());
    assert!(read_u32(&bus, 0x1000).is_err());
}

#[test]
fn concurrent_dispatch() {
    let bus = Arc::new(IoBus::new());
    let regs = Registers::new(0x1000);
    bus.register(regs.clone());

    let workers: Vec<_> = (0..4u32)
        .map(|t| {
            let bus = bus.clone();
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    bus.write(0x1000 + 4 * t as u64, &t.to_le_bytes()).unwrap();
                    assert_eq!(read_u32(&bus, 0x1000 + 4 * t as u64).unwrap(), t);
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(regs.accesses.load(Ordering::SeqCst), 8000);
}
