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

use core::cmp::{max, min};

use crate::virtq::MAX_QUEUE_SIZE;

/// Tunables for queue setup and chain resolution.
///
/// Handed to [`Device`](crate::device::Device) and, through
/// [`RingOptions`](crate::virtq::RingOptions), to chain resolution. Every
/// setter clamps its input to the documented bounds; 0 selects the default.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct QueueLimits {
    /// Largest queue the driver will set up, a power of two.
    max_queue_size: u16,
    /// Used ring alignment requested from the transport, a power of two.
    default_alignment: usize,
    /// Longest indirect table accepted, in descriptors.
    max_indirect_len: u16,
}

impl QueueLimits {
    /// The default value for max queue size
    pub const DEFAULT_MAX_QUEUE_SIZE: u16 = 256;
    /// The minimum value for max queue size
    pub const MIN_MAX_QUEUE_SIZE: u16 = 1;
    /// The maximum value for max queue size
    pub const MAX_MAX_QUEUE_SIZE: u16 = MAX_QUEUE_SIZE;
    /// The default used ring alignment (legacy page alignment)
    pub const DEFAULT_ALIGNMENT: usize = 4096;
    /// The minimum used ring alignment
    pub const MIN_ALIGNMENT: usize = 4;
    /// The maximum used ring alignment
    pub const MAX_ALIGNMENT: usize = 65536;
    /// The default value for max indirect table length
    pub const DEFAULT_MAX_INDIRECT_LEN: u16 = 1024;
    /// The minimum value for max indirect table length
    pub const MIN_MAX_INDIRECT_LEN: u16 = 1;
    /// The maximum value for max indirect table length
    pub const MAX_MAX_INDIRECT_LEN: u16 = MAX_QUEUE_SIZE;

    /// Create limits, clamping each value like the matching setter does.
    pub fn new(max_queue_size: u16, default_alignment: usize, max_indirect_len: u16) -> Self {
        let mut limits = Self::default();
        limits.set_max_queue_size(max_queue_size);
        limits.set_default_alignment(default_alignment);
        limits.set_max_indirect_len(max_indirect_len);
        limits
    }

    /// Set the largest queue size. Values that are not a power of two are
    /// rounded down to one, 0 selects `DEFAULT_MAX_QUEUE_SIZE`.
    pub fn set_max_queue_size(&mut self, max_queue_size: u16) {
        self.max_queue_size = match max_queue_size {
            0 => Self::DEFAULT_MAX_QUEUE_SIZE,
            1.. => {
                let clamped = min(
                    Self::MAX_MAX_QUEUE_SIZE,
                    max(max_queue_size, Self::MIN_MAX_QUEUE_SIZE),
                );
                1 << (u16::BITS - 1 - clamped.leading_zeros())
            }
        }
    }

    pub fn max_queue_size(&self) -> u16 {
        self.max_queue_size
    }

    /// Set the used ring alignment. Values that are not a power of two are
    /// rounded up to one, 0 selects `DEFAULT_ALIGNMENT`.
    pub fn set_default_alignment(&mut self, alignment: usize) {
        self.default_alignment = match alignment {
            0 => Self::DEFAULT_ALIGNMENT,
            1.. => min(
                Self::MAX_ALIGNMENT,
                max(alignment, Self::MIN_ALIGNMENT),
            )
            .next_power_of_two(),
        }
    }

    pub fn default_alignment(&self) -> usize {
        self.default_alignment
    }

    /// Set the longest accepted indirect table, 0 selects
    /// `DEFAULT_MAX_INDIRECT_LEN`.
    pub fn set_max_indirect_len(&mut self, max_indirect_len: u16) {
        self.max_indirect_len = match max_indirect_len {
            0 => Self::DEFAULT_MAX_INDIRECT_LEN,
            1.. => min(
                Self::MAX_MAX_INDIRECT_LEN,
                max(max_indirect_len, Self::MIN_MAX_INDIRECT_LEN),
            ),
        }
    }

    pub fn max_indirect_len(&self) -> u16 {
        self.max_indirect_len
    }

    /// Queue size to set up given the transport's maximum for a queue.
    ///
    /// Returns the largest power of two that fits both bounds, or None when
    /// the transport reports no usable size.
    pub fn queue_size_for(&self, transport_max: u16) -> Option<u16> {
        let size = min(self.max_queue_size, transport_max);
        if size == 0 {
            return None;
        }
        Some(1 << (u16::BITS - 1 - size.leading_zeros()))
    }
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_queue_size: Self::DEFAULT_MAX_QUEUE_SIZE,
            default_alignment: Self::DEFAULT_ALIGNMENT,
            max_indirect_len: Self::DEFAULT_MAX_INDIRECT_LEN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::QueueLimits;

    #[test]
    fn overrides() {
        let limits = QueueLimits::new(1024, 64, 16);
        assert_eq!(limits.max_queue_size(), 1024);
        assert_eq!(limits.default_alignment(), 64);
        assert_eq!(limits.max_indirect_len(), 16);
    }

    #[test]
    fn zero_selects_defaults() {
        let limits = QueueLimits::new(0, 0, 0);
        assert_eq!(limits, QueueLimits::default());
    }

    #[test]
    fn clamps_and_rounds() {
        let limits = QueueLimits::new(u16::MAX, usize::MAX, u16::MAX);
        assert_eq!(limits.max_queue_size(), QueueLimits::MAX_MAX_QUEUE_SIZE);
        assert_eq!(limits.default_alignment(), QueueLimits::MAX_ALIGNMENT);
        assert_eq!(limits.max_indirect_len(), QueueLimits::MAX_MAX_INDIRECT_LEN);

        let limits = QueueLimits::new(300, 1, 1);
        assert_eq!(limits.max_queue_size(), 256);
        assert_eq!(limits.default_alignment(), QueueLimits::MIN_ALIGNMENT);
        assert_eq!(limits.max_indirect_len(), 1);

        let mut limits = QueueLimits::default();
        limits.set_default_alignment(100);
        assert_eq!(limits.default_alignment(), 128);
    }

    #[test]
    fn queue_size_for_transport() {
        let limits = QueueLimits::default();
        assert_eq!(limits.queue_size_for(1024), Some(256));
        assert_eq!(limits.queue_size_for(100), Some(64));
        assert_eq!(limits.queue_size_for(1), Some(1));
        assert_eq!(limits.queue_size_for(0), None);
    }
}
