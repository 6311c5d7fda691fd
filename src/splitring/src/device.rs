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

//! Driver-side device lifecycle.
//!
//! ```text
//! reset ─> ACKNOWLEDGE ─> DRIVER ─> negotiate ─> FEATURES_OK ─> find_queues ─> DRIVER_OK
//!                                      │              │              │
//!                                      └──────────────┴──────────────┴──> FAILED
//! ```
//!
//! The bus specific parts (status register, feature words, queue memory,
//! doorbells) sit behind [`Transport`]; [`Device`] drives the sequence.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use thiserror::Error;
#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use crate::config::{self, ConfigError, ConfigSpace, ConfigValue};
use crate::errno;
use crate::features::{FeatureError, FeatureSet};
use crate::limits::QueueLimits;
use crate::status::DeviceStatus;
use crate::virtq::{Layout, MemOps, RingOptions, RingProducer};

/// Bus specific device access.
///
/// Fallible operations report a negative errno.
pub trait Transport: ConfigSpace {
    /// Accessor for queue memory handed out by [`alloc_queue`](Self::alloc_queue).
    type Mem: MemOps + Clone;

    fn get_status(&self) -> DeviceStatus;

    fn set_status(&self, status: DeviceStatus);

    /// Reset the device. Afterwards the status reads as empty.
    fn reset(&self);

    /// Feature bits the device offers.
    fn get_features(&self) -> u64;

    /// Hand the negotiated features to the device.
    fn finalize_features(&self, features: u64) -> Result<(), i32>;

    /// Largest size the device supports for queue `index`, 0 if the queue
    /// does not exist.
    fn max_queue_size(&self, index: u16) -> u16;

    /// Allocate `size` zeroed bytes of queue memory aligned to `align`.
    fn alloc_queue(&self, index: u16, size: usize, align: usize) -> Result<u64, i32>;

    /// Tell the device where queue `index` lives and enable it.
    fn activate_queue(&self, index: u16, layout: &Layout) -> Result<(), i32>;

    /// Disable queue `index` and release its memory.
    fn deactivate_queue(&self, index: u16);

    /// Memory accessor for the queue areas.
    fn memory(&self) -> Self::Mem;

    /// Ring the doorbell of queue `index`.
    fn notify(&self, index: u16);

    /// Route the interrupt of queue `index` to `cpu`.
    fn set_queue_affinity(&self, _index: u16, _cpu: usize) -> Result<(), i32> {
        Err(-errno::EOPNOTSUPP)
    }

    /// CPU the interrupt of queue `index` is routed to, if the bus tracks it.
    fn queue_affinity(&self, _index: u16) -> Option<usize> {
        None
    }

    fn bus_name(&self) -> &str {
        "virtio"
    }
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("feature negotiation failed: {0}")]
    Negotiation(#[from] FeatureError),
    #[error("queue setup failed with errno {0}")]
    QueueSetup(i32),
    #[error("device is not ready")]
    NotReady,
    #[error("configuration access failed: {0}")]
    Config(#[from] ConfigError),
}

/// Called with the queue index when the device signals a queue.
pub type QueueCallback = Box<dyn FnMut(u16) + Send>;

/// Request for one queue in [`Device::find_queues`].
pub struct QueueSpec {
    name: String,
    callback: Option<QueueCallback>,
    affinity: Option<usize>,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            callback: None,
            affinity: None,
        }
    }

    /// Run `callback` when the device signals this queue.
    pub fn with_callback(mut self, callback: impl FnMut(u16) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Prefer delivering this queue's interrupts to `cpu`. A hint only.
    pub fn with_affinity(mut self, cpu: usize) -> Self {
        self.affinity = Some(cpu);
        self
    }
}

impl core::fmt::Debug for QueueSpec {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueueSpec")
            .field("name", &self.name)
            .field("callback", &self.callback.is_some())
            .field("affinity", &self.affinity)
            .finish()
    }
}

/// A queue set up by [`Device::find_queues`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub index: u16,
    pub name: String,
    pub size: u16,
    pub layout: Layout,
}

struct Queue<M> {
    info: QueueInfo,
    ring: RingProducer<M>,
    callback: Option<QueueCallback>,
}

/// Driver view of one device.
pub struct Device<T: Transport> {
    transport: T,
    limits: QueueLimits,
    features: FeatureSet,
    queues: Vec<Queue<T::Mem>>,
}

impl<T: Transport> Device<T> {
    pub fn new(transport: T, limits: QueueLimits) -> Self {
        Self {
            transport,
            limits,
            features: FeatureSet::default(),
            queues: Vec::new(),
        }
    }

    /// Reset the device and negotiate features.
    ///
    /// Keeps the offered bits that are also in `driver_features`. On success
    /// the device is in `FEATURES_OK` and queues may be set up. Any failure
    /// leaves the device marked `FAILED`.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn initialize(&mut self, driver_features: u64) -> Result<u64, DeviceError> {
        self.delete_queues();
        self.transport.reset();
        self.features.reset();

        self.add_status(DeviceStatus::ACKNOWLEDGE);
        self.add_status(DeviceStatus::DRIVER);

        self.negotiate(driver_features).inspect_err(|e| {
            log::warn!("{} device: {}", self.transport.bus_name(), e);
            self.add_status(DeviceStatus::FAILED);
        })
    }

    fn negotiate(&mut self, driver_features: u64) -> Result<u64, DeviceError> {
        let offered = self.transport.get_features();
        self.features = FeatureSet::negotiate(offered, driver_features);
        let bits = self.features.finalize()?;

        self.transport
            .finalize_features(bits)
            .map_err(FeatureError::Rejected)?;

        self.add_status(DeviceStatus::FEATURES_OK);
        if !self.status().contains(DeviceStatus::FEATURES_OK) {
            return Err(FeatureError::NotAccepted.into());
        }

        log::debug!("negotiated features {:#018x} of {:#018x}", bits, offered);
        Ok(bits)
    }

    /// Set up one queue per spec, indices in spec order.
    ///
    /// On failure every queue set up by this call is torn down again.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn find_queues(&mut self, specs: Vec<QueueSpec>) -> Result<Vec<QueueInfo>, DeviceError> {
        if !self.features.is_finalized() || !self.status().contains(DeviceStatus::FEATURES_OK) {
            return Err(DeviceError::NotReady);
        }

        let first = self.queues.len();
        let mut infos = Vec::with_capacity(specs.len());

        for spec in specs {
            let index = self.queues.len() as u16;
            match self.setup_queue(index, spec) {
                Ok(info) => infos.push(info),
                Err(e) => {
                    log::warn!("queue {} setup failed: {}", index, e);
                    for queue in self.queues.drain(first..) {
                        self.transport.deactivate_queue(queue.info.index);
                    }
                    self.add_status(DeviceStatus::FAILED);
                    return Err(e);
                }
            }
        }

        Ok(infos)
    }

    /// [`find_queues`](Self::find_queues) for a single queue.
    pub fn find_single_queue(&mut self, spec: QueueSpec) -> Result<QueueInfo, DeviceError> {
        self.find_queues(alloc::vec![spec])?
            .pop()
            .ok_or(DeviceError::QueueSetup(-errno::ENOENT))
    }

    fn setup_queue(&mut self, index: u16, spec: QueueSpec) -> Result<QueueInfo, DeviceError> {
        let max = self.transport.max_queue_size(index);
        let size = self
            .limits
            .queue_size_for(max)
            .ok_or(DeviceError::QueueSetup(-errno::ENOENT))?;
        let align = self.limits.default_alignment();

        let bytes = Layout::query_size(size as usize, align);
        let base = self
            .transport
            .alloc_queue(index, bytes, align)
            .map_err(DeviceError::QueueSetup)?;

        let layout = Layout::from_base(base, size, align).map_err(|_| {
            self.transport.deactivate_queue(index);
            DeviceError::QueueSetup(-errno::EINVAL)
        })?;

        let ring = RingProducer::new(layout, self.transport.memory(), self.ring_options())
            .map_err(|_| {
                self.transport.deactivate_queue(index);
                DeviceError::QueueSetup(-errno::ENOMEM)
            })?;

        if let Err(e) = self.transport.activate_queue(index, &layout) {
            self.transport.deactivate_queue(index);
            return Err(DeviceError::QueueSetup(e));
        }

        if let Some(cpu) = spec.affinity
            && let Err(e) = self.transport.set_queue_affinity(index, cpu)
        {
            log::debug!("queue {} affinity to cpu {} ignored: {}", index, cpu, e);
        }

        let info = QueueInfo {
            index,
            name: spec.name,
            size,
            layout,
        };

        self.queues.push(Queue {
            info: info.clone(),
            ring,
            callback: spec.callback,
        });

        Ok(info)
    }

    /// Tear down every queue.
    pub fn delete_queues(&mut self) {
        for queue in self.queues.drain(..) {
            self.transport.deactivate_queue(queue.info.index);
        }
    }

    /// Mark the driver ready. Buffers may be exposed to the device from now on.
    ///
    /// A device marked `FAILED` or `NEEDS_RESET` must be reset first.
    ///
    /// # Panics
    ///
    /// If `DRIVER_OK` is already set.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn ready(&mut self) -> Result<(), DeviceError> {
        let status = self.status();
        assert!(
            !status.contains(DeviceStatus::DRIVER_OK),
            "device is already DRIVER_OK"
        );

        if !status.contains(DeviceStatus::FEATURES_OK)
            || status.intersects(DeviceStatus::FAILED | DeviceStatus::NEEDS_RESET)
            || self.queues.is_empty()
        {
            return Err(DeviceError::NotReady);
        }

        self.add_status(DeviceStatus::DRIVER_OK);
        Ok(())
    }

    /// Reset the device and forget all negotiated state.
    pub fn reset(&mut self) {
        self.delete_queues();
        self.transport.reset();
        self.features.reset();
    }

    /// Give up on the device.
    pub fn fail(&mut self) {
        self.add_status(DeviceStatus::FAILED);
    }

    /// Dispatch a queue interrupt to its callback.
    ///
    /// Returns false if the queue does not exist or has no callback.
    pub fn handle_queue_interrupt(&mut self, index: u16) -> bool {
        let Some(queue) = self.queues.iter_mut().find(|q| q.info.index == index) else {
            return false;
        };

        match queue.callback.as_mut() {
            Some(callback) => {
                callback(index);
                true
            }
            None => false,
        }
    }

    /// Ring of queue `index`.
    pub fn queue_mut(&mut self, index: u16) -> Option<&mut RingProducer<T::Mem>> {
        self.queues
            .iter_mut()
            .find(|q| q.info.index == index)
            .map(|q| &mut q.ring)
    }

    pub fn queue_info(&self, index: u16) -> Option<&QueueInfo> {
        self.queues
            .iter()
            .find(|q| q.info.index == index)
            .map(|q| &q.info)
    }

    /// Ring the doorbell of queue `index`.
    pub fn notify(&self, index: u16) {
        self.transport.notify(index);
    }

    pub fn status(&self) -> DeviceStatus {
        self.transport.get_status()
    }

    fn add_status(&self, status: DeviceStatus) {
        self.transport.set_status(self.transport.get_status() | status);
    }

    pub fn features(&self) -> &FeatureSet {
        &self.features
    }

    /// Is feature `bit` negotiated? See [`FeatureSet::has`].
    pub fn has_feature(&self, bit: u32) -> bool {
        self.features.has(bit)
    }

    pub fn ring_options(&self) -> RingOptions {
        RingOptions::from_features(&self.features, &self.limits)
    }

    pub fn limits(&self) -> &QueueLimits {
        &self.limits
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn bus_name(&self) -> &str {
        self.transport.bus_name()
    }

    pub fn queue_affinity(&self, index: u16) -> Option<usize> {
        self.transport.queue_affinity(index)
    }

    /// Read a configuration field in the negotiated byte order.
    pub fn read_config<V: ConfigValue>(&self, offset: usize) -> Result<V, DeviceError> {
        Ok(config::read(&self.transport, offset, self.features.byte_order())?)
    }

    /// Read consecutive configuration fields as one consistent snapshot.
    pub fn read_config_many<V: ConfigValue>(
        &self,
        offset: usize,
        out: &mut [V],
    ) -> Result<(), DeviceError> {
        Ok(config::read_many(
            &self.transport,
            offset,
            out,
            self.features.byte_order(),
        )?)
    }

    /// Read configuration bytes as one consistent snapshot.
    pub fn read_config_bytes(&self, offset: usize, out: &mut [u8]) -> Result<(), DeviceError> {
        Ok(config::read_bytes(&self.transport, offset, out)?)
    }

    /// Read a configuration field that depends on feature `bit`.
    pub fn read_config_feature<V: ConfigValue>(
        &self,
        bit: u32,
        offset: usize,
    ) -> Result<V, DeviceError> {
        Ok(config::read_feature(
            &self.transport,
            &self.features,
            bit,
            offset,
        )?)
    }

    /// Write a configuration field in the negotiated byte order.
    pub fn write_config<V: ConfigValue>(&self, offset: usize, value: V) -> Result<(), DeviceError> {
        Ok(config::write(
            &self.transport,
            offset,
            value,
            self.features.byte_order(),
        )?)
    }
}

impl<T: Transport> Drop for Device<T> {
    fn drop(&mut self) {
        self.delete_queues();
    }
}
