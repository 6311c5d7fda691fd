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

use bitflags::bitflags;

bitflags! {
    /// Device status byte.
    ///
    /// The driver only ever adds bits; writing 0 resets the device.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DeviceStatus: u8 {
        /// Driver has noticed the device.
        const ACKNOWLEDGE = 1;
        /// Driver knows how to drive the device.
        const DRIVER = 2;
        /// Driver is set up and ready to drive the device.
        const DRIVER_OK = 4;
        /// Feature negotiation is complete.
        const FEATURES_OK = 8;
        /// Device hit an error it cannot recover from without a reset.
        const NEEDS_RESET = 64;
        /// Driver gave up on the device.
        const FAILED = 128;
    }
}

impl DeviceStatus {
    /// Has the device reached `DRIVER_OK` and not failed since?
    pub fn is_live(self) -> bool {
        self.contains(Self::DRIVER_OK) && !self.intersects(Self::FAILED | Self::NEEDS_RESET)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values() {
        assert_eq!(DeviceStatus::ACKNOWLEDGE.bits(), 1);
        assert_eq!(DeviceStatus::DRIVER.bits(), 2);
        assert_eq!(DeviceStatus::DRIVER_OK.bits(), 4);
        assert_eq!(DeviceStatus::FEATURES_OK.bits(), 8);
        assert_eq!(DeviceStatus::NEEDS_RESET.bits(), 64);
        assert_eq!(DeviceStatus::FAILED.bits(), 128);
    }

    #[test]
    fn liveness() {
        let ok = DeviceStatus::ACKNOWLEDGE
            | DeviceStatus::DRIVER
            | DeviceStatus::FEATURES_OK
            | DeviceStatus::DRIVER_OK;
        assert!(ok.is_live());
        assert!(!(ok | DeviceStatus::NEEDS_RESET).is_live());
        assert!(!DeviceStatus::empty().is_live());
    }
}
