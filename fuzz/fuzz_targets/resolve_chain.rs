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
use splitring::virtq::{DescTable, Descriptor, MemOps, RingOptions, resolve_chain};
use splitring_testing::SharedMemory;

const BASE: u64 = 0x10000;
const TABLE_LEN: usize = 64;

// Arbitrary descriptor tables must resolve or fail cleanly, never panic or
// loop: entries whose addr falls inside the region double as indirect tables.
fuzz_target!(|data: (Vec<Descriptor>, u16, bool, u16)| {
    let (descs, head, indirect, max_indirect_len) = data;
    let mem = SharedMemory::new(BASE, TABLE_LEN * Descriptor::SIZE * 2);
    for (i, desc) in descs.iter().take(TABLE_LEN * 2).enumerate() {
        mem.write_val(BASE + (i * Descriptor::SIZE) as u64, *desc).unwrap();
    }

    let opts = RingOptions {
        indirect_desc: indirect,
        max_indirect_len: max_indirect_len.max(1),
        ..Default::default()
    };
    let table = DescTable::new(BASE, TABLE_LEN);
    if let Ok(chain) = resolve_chain(&mem, &table, head, &opts) {
        assert!(chain.len() > 0);
        assert!(chain.readables().iter().all(|e| !e.writable));
        assert!(chain.writables().iter().all(|e| e.writable));
    }
});
