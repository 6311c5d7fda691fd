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

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use splitring::config::ConfigSpace;
use splitring::device::Transport;
use splitring::errno;
use splitring::status::DeviceStatus;
use splitring::virtq::Layout;

use crate::SharedMemory;

/// Guest address the mock's shared memory starts at.
pub const GUEST_BASE: u64 = 0x1_0000;
/// Size of the mock's shared memory.
pub const MEMORY_SIZE: usize = 1 << 20;

/// Config change applied by the device behind the driver's back.
struct Mutation {
    after_gets: usize,
    offset: usize,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct State {
    config: Vec<u8>,
    generation: u32,
    has_generation: bool,
    gets: usize,
    mutation: Option<Mutation>,

    status: DeviceStatus,
    offered: u64,
    accepted: Option<u64>,
    reject_features: Option<i32>,
    refuse_features_ok: bool,

    queue_sizes: Vec<u16>,
    fail_activate: Option<u16>,
    active: BTreeMap<u16, Layout>,
    supports_affinity: bool,
    affinity: Vec<(u16, usize)>,
    notifications: Vec<u16>,
    resets: usize,
}

/// Scriptable in-memory transport.
///
/// Configure it with the builder methods, hand it to a
/// [`Device`](splitring::device::Device), then inspect what the driver did
/// through `device.transport()`.
pub struct MockTransport {
    state: Mutex<State>,
    mem: Arc<SharedMemory>,
}

impl MockTransport {
    /// A device offering `features` with one queue of `queue_size` entries.
    pub fn new(features: u64, queue_size: u16) -> Self {
        Self {
            state: Mutex::new(State {
                offered: features,
                queue_sizes: vec![queue_size],
                ..Default::default()
            }),
            mem: Arc::new(SharedMemory::new(GUEST_BASE, MEMORY_SIZE)),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Maximum sizes of queues 0, 1, ...; a 0 entry means no such queue.
    pub fn with_queue_sizes(self, sizes: &[u16]) -> Self {
        self.state().queue_sizes = sizes.to_vec();
        self
    }

    pub fn with_config(self, bytes: &[u8]) -> Self {
        self.state().config = bytes.to_vec();
        self
    }

    /// Expose a configuration generation counter.
    pub fn with_generation(self) -> Self {
        self.state().has_generation = true;
        self
    }

    /// Make `finalize_features` fail with `errno`.
    pub fn rejecting_features(self, errno: i32) -> Self {
        self.state().reject_features = Some(errno);
        self
    }

    /// Never let `FEATURES_OK` stick in the status byte.
    pub fn refusing_features_ok(self) -> Self {
        self.state().refuse_features_ok = true;
        self
    }

    /// Make activation of queue `index` fail.
    pub fn failing_activation_of(self, index: u16) -> Self {
        self.state().fail_activate = Some(index);
        self
    }

    pub fn with_affinity_support(self) -> Self {
        self.state().supports_affinity = true;
        self
    }

    /// After `after_gets` more config reads, overwrite config bytes at
    /// `offset` and bump the generation.
    pub fn mutate_config_after(&self, after_gets: usize, offset: usize, bytes: &[u8]) {
        let mut state = self.state();
        state.mutation = Some(Mutation {
            after_gets: state.gets + after_gets,
            offset,
            bytes: bytes.to_vec(),
        });
    }

    /// Features the driver handed to `finalize_features`.
    pub fn accepted_features(&self) -> Option<u64> {
        self.state().accepted
    }

    /// Layout of queue `index` if it is active.
    pub fn active_queue(&self, index: u16) -> Option<Layout> {
        self.state().active.get(&index).copied()
    }

    pub fn num_active_queues(&self) -> usize {
        self.state().active.len()
    }

    pub fn affinity(&self) -> Vec<(u16, usize)> {
        self.state().affinity.clone()
    }

    /// Doorbells rung so far, oldest first.
    pub fn notifications(&self) -> Vec<u16> {
        self.state().notifications.clone()
    }

    /// Config reads served so far.
    pub fn config_gets(&self) -> usize {
        self.state().gets
    }

    pub fn resets(&self) -> usize {
        self.state().resets
    }

    /// The queue memory, for building the device side of a ring.
    pub fn shared_memory(&self) -> Arc<SharedMemory> {
        self.mem.clone()
    }
}

impl ConfigSpace for MockTransport {
    fn get(&self, offset: usize, buf: &mut [u8]) {
        let mut state = self.state();
        buf.copy_from_slice(&state.config[offset..offset + buf.len()]);
        state.gets += 1;

        let due = state
            .mutation
            .as_ref()
            .is_some_and(|m| state.gets >= m.after_gets);
        if due && let Some(m) = state.mutation.take() {
            state.config[m.offset..m.offset + m.bytes.len()].copy_from_slice(&m.bytes);
            state.generation = state.generation.wrapping_add(1);
        }
    }

    fn set(&self, offset: usize, buf: &[u8]) {
        let mut state = self.state();
        state.config[offset..offset + buf.len()].copy_from_slice(buf);
    }

    fn generation(&self) -> Option<u32> {
        let state = self.state();
        state.has_generation.then_some(state.generation)
    }

    fn size(&self) -> Option<usize> {
        Some(self.state().config.len())
    }
}

impl Transport for MockTransport {
    type Mem = Arc<SharedMemory>;

    fn get_status(&self) -> DeviceStatus {
        self.state().status
    }

    fn set_status(&self, status: DeviceStatus) {
        let mut state = self.state();
        state.status = status;
        if state.refuse_features_ok {
            state.status.remove(DeviceStatus::FEATURES_OK);
        }
    }

    fn reset(&self) {
        let mut state = self.state();
        state.status = DeviceStatus::empty();
        state.accepted = None;
        state.active.clear();
        state.resets += 1;
    }

    fn get_features(&self) -> u64 {
        self.state().offered
    }

    fn finalize_features(&self, features: u64) -> Result<(), i32> {
        let mut state = self.state();
        if let Some(errno) = state.reject_features {
            return Err(errno);
        }
        state.accepted = Some(features);
        Ok(())
    }

    fn max_queue_size(&self, index: u16) -> u16 {
        self.state()
            .queue_sizes
            .get(index as usize)
            .copied()
            .unwrap_or(0)
    }

    fn alloc_queue(&self, _index: u16, size: usize, align: usize) -> Result<u64, i32> {
        self.mem
            .alloc(size, align.max(16))
            .map_err(|_| -errno::ENOMEM)
    }

    fn activate_queue(&self, index: u16, layout: &Layout) -> Result<(), i32> {
        let mut state = self.state();
        if state.fail_activate == Some(index) {
            return Err(-errno::EINVAL);
        }
        state.active.insert(index, *layout);
        Ok(())
    }

    fn deactivate_queue(&self, index: u16) {
        self.state().active.remove(&index);
    }

    fn memory(&self) -> Self::Mem {
        self.mem.clone()
    }

    fn notify(&self, index: u16) {
        self.state().notifications.push(index);
    }

    fn set_queue_affinity(&self, index: u16, cpu: usize) -> Result<(), i32> {
        let mut state = self.state();
        if !state.supports_affinity {
            return Err(-errno::EOPNOTSUPP);
        }
        state.affinity.push((index, cpu));
        Ok(())
    }

    fn queue_affinity(&self, index: u16) -> Option<usize> {
        let state = self.state();
        if !state.supports_affinity {
            return None;
        }
        state
            .affinity
            .iter()
            .rev()
            .find(|(q, _)| *q == index)
            .map(|&(_, cpu)| cpu)
    }

    fn bus_name(&self) -> &str {
        "mock"
    }
}
