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

//! Feature Negotiation
//!
//! Features are a 64-bit set. Bits below [`TRANSPORT_START`] belong to the
//! device type; the rest describe the transport and the ring format.
//!
//! The handshake runs once per device reset: the device offers a set, the
//! driver keeps the subset it understands, and [`FeatureSet::finalize`]
//! freezes the result.

use thiserror::Error;

use crate::endian::ByteOrder;

/// First transport feature bit.
pub const TRANSPORT_START: u32 = 28;
/// One past the last feature bit.
pub const TRANSPORT_END: u32 = 64;

/// Descriptors may point to indirect descriptor tables.
pub const RING_INDIRECT_DESC: u32 = 28;
/// `used_event` / `avail_event` are in use.
pub const RING_EVENT_IDX: u32 = 29;
/// Modern device: little-endian fields everywhere.
pub const VERSION_1: u32 = 32;
/// Device addresses go through the platform's translation.
pub const ACCESS_PLATFORM: u32 = 33;

/// Mask with only `bit` set.
pub const fn feature(bit: u32) -> u64 {
    1 << bit
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureError {
    #[error("feature set is already finalized")]
    AlreadyFinalized,
    #[error("feature bit {0} was not offered by the device")]
    NotOffered(u32),
    #[error("transport rejected the feature set with errno {0}")]
    Rejected(i32),
    #[error("device did not accept the feature set")]
    NotAccepted,
}

/// Outcome of feature negotiation for one device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeatureSet {
    /// Bits the device offered.
    device: u64,
    /// Bits the driver declared it understands.
    driver: u64,
    /// Selected bits.
    bits: u64,
    finalized: bool,
}

impl FeatureSet {
    /// Keep the offered bits the driver understands.
    pub fn negotiate(device: u64, driver: u64) -> Self {
        Self {
            device,
            driver,
            bits: device & driver,
            finalized: false,
        }
    }

    /// Select an additional offered bit before finalizing.
    pub fn select(&mut self, bit: u32) -> Result<(), FeatureError> {
        self.check_mutable()?;
        if bit >= TRANSPORT_END || self.device & feature(bit) == 0 {
            return Err(FeatureError::NotOffered(bit));
        }
        self.bits |= feature(bit);
        Ok(())
    }

    /// Drop a bit before finalizing.
    pub fn clear(&mut self, bit: u32) -> Result<(), FeatureError> {
        self.check_mutable()?;
        if bit < TRANSPORT_END {
            self.bits &= !feature(bit);
        }
        Ok(())
    }

    /// Freeze the selection and return it.
    ///
    /// The set stays frozen until [`reset`](Self::reset).
    pub fn finalize(&mut self) -> Result<u64, FeatureError> {
        self.check_mutable()?;
        self.finalized = true;
        log::debug!("features finalized: {:#018x}", self.bits);
        Ok(self.bits)
    }

    /// Forget the negotiation, as a device reset does.
    pub fn reset(&mut self) {
        self.bits = 0;
        self.finalized = false;
    }

    fn check_mutable(&self) -> Result<(), FeatureError> {
        if self.finalized {
            return Err(FeatureError::AlreadyFinalized);
        }
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Selected bits.
    pub fn bits(&self) -> u64 {
        self.bits
    }

    /// Bits the device offered.
    pub fn offered(&self) -> u64 {
        self.device
    }

    /// Is feature `bit` selected?
    ///
    /// # Panics
    ///
    /// If `bit` is 64 or above, or if `bit` is a device feature the driver
    /// never declared. Asking for either is a driver bug.
    pub fn has(&self, bit: u32) -> bool {
        assert!(bit < TRANSPORT_END, "feature bit {bit} out of range");
        if bit < TRANSPORT_START {
            assert!(
                self.driver & feature(bit) != 0,
                "device feature bit {bit} was never declared by the driver"
            );
        }
        self.bits & feature(bit) != 0
    }

    /// [`has`](Self::has) for a bit known at compile time.
    pub fn has_bit<const BIT: u32>(&self) -> bool {
        const { assert!(BIT < TRANSPORT_END, "feature bit out of range") };
        self.has(BIT)
    }

    /// Byte order of ring and configuration fields.
    pub fn byte_order(&self) -> ByteOrder {
        if self.has_bit::<VERSION_1>() {
            ByteOrder::Little
        } else {
            ByteOrder::Native
        }
    }

    /// Does the device bypass platform address translation?
    ///
    /// True when `ACCESS_PLATFORM` was not negotiated.
    pub fn has_iommu_quirk(&self) -> bool {
        !self.has_bit::<ACCESS_PLATFORM>()
    }
}
