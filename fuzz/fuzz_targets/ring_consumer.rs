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

#![no_main]

use libfuzzer_sys::fuzz_target;
use splitring::virtq::{Layout, MemOps, RingConsumer, RingError, RingOptions};
use splitring_testing::SharedMemory;

const BASE: u64 = 0x10000;
const SIZE: u16 = 16;
const ALIGN: usize = 64;

// A hostile driver controls every byte of the descriptor table and the
// available ring. The device must survive whatever it finds there.
fuzz_target!(|data: (Vec<u8>, u16, bool)| {
    let (bytes, avail_idx, event_idx) = data;
    let len = Layout::query_size(SIZE as usize, ALIGN);
    let mem = SharedMemory::new(BASE, len);
    let layout = Layout::from_base(BASE, SIZE, ALIGN).unwrap();
    let opts = RingOptions {
        event_idx,
        ..Default::default()
    };
    let mut consumer = RingConsumer::new(layout, &mem, opts).unwrap();

    // driver-owned area: descriptor table and available ring
    let driver_len = (layout.used_addr - BASE) as usize;
    let n = bytes.len().min(driver_len);
    mem.write(BASE, &bytes[..n]).unwrap();
    mem.store_release(layout.avail_idx_addr(), avail_idx).unwrap();

    let mut taken = Vec::new();
    for _ in 0..2 * SIZE {
        match consumer.poll_available() {
            Ok((head, chain)) => {
                assert!(chain.len() > 0);
                taken.push((head, chain.writable_len() as u32));
            }
            Err(RingError::WouldBlock | RingError::BadIndex { .. }) => break,
            Err(_) => {}
        }
    }

    assert_eq!(consumer.num_inflight(), taken.len());
    if !taken.is_empty() {
        consumer.submit_used_batch(&taken).unwrap();
    }
    assert_eq!(consumer.num_inflight(), 0);
});
