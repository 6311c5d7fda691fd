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

//! Notification Suppression
//!
//! Each side may tell the other when it wants to be signalled. Without
//! `EVENT_IDX` this is a single flag bit in the ring header the peer writes.
//! With `EVENT_IDX` the peer publishes the index value it waits for, and the
//! notifier signals only if its last publication moved its index past that
//! value.

use bitflags::bitflags;

bitflags! {
    /// Flags of the available ring header, written by the driver.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct AvailFlags: u16 {
        /// Driver does not want an interrupt when buffers are used.
        const NO_INTERRUPT = 1 << 0;
    }
}

bitflags! {
    /// Flags of the used ring header, written by the device.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct UsedFlags: u16 {
        /// Device does not want a notification when buffers are added.
        const NO_NOTIFY = 1 << 0;
    }
}

/// Does moving an index from `old` to `new` cross `event_idx`?
///
/// True iff `event_idx` lies in the half-open window `[old, new)`, evaluated
/// with wrapping 16-bit arithmetic so it stays correct across index wrap.
#[inline]
pub const fn ring_need_event(event_idx: u16, new: u16, old: u16) -> bool {
    new.wrapping_sub(event_idx).wrapping_sub(1) < new.wrapping_sub(old)
}

/// Notification decision shared by both sides.
///
/// `suppressed` is the peer's flag hint; it is only consulted when event
/// indices were not negotiated.
#[inline]
pub(crate) fn notify_needed(
    event_idx: bool,
    suppressed: bool,
    event: u16,
    new: u16,
    old: u16,
) -> bool {
    if event_idx {
        ring_need_event(event, new, old)
    } else {
        !suppressed
    }
}

#[cfg(test)]
mod tests {
    use quickcheck::quickcheck;

    use super::*;

    #[test]
    fn ring_need_event_basic_cases() {
        // event_idx == new-1: the last entry published is the one waited for
        assert!(ring_need_event(4, 5, 2));
        // no progress
        assert!(!ring_need_event(4, 5, 5));
        // event equal to new is not crossed yet
        assert!(!ring_need_event(5, 5, 1));
        // event before old was already crossed earlier
        assert!(!ring_need_event(0, 5, 1));
        assert!(ring_need_event(1, 5, 1));
    }

    #[test]
    fn ring_need_event_window_is_old_inclusive() {
        assert!(ring_need_event(5, 6, 5));
        assert!(!ring_need_event(6, 6, 5));
        // new=1, old=5 is a step of 65532 entries; both 5 and 6 lie inside it
        assert!(ring_need_event(5, 1, 5));
        assert!(ring_need_event(6, 1, 5));
        assert!(!ring_need_event(1, 1, 5));
    }

    #[test]
    fn ring_need_event_across_wrap() {
        assert!(ring_need_event(0xFFFF, 1, 0xFFFE));
        assert!(ring_need_event(0, 1, 0xFFFE));
        assert!(ring_need_event(0xFFFE, 1, 0xFFFE));
        assert!(!ring_need_event(1, 1, 0xFFFE));
        assert!(!ring_need_event(0xFFFD, 1, 0xFFFE));
    }

    #[test]
    fn flags_only_without_event_idx() {
        assert!(notify_needed(false, false, 0, 0, 0));
        assert!(!notify_needed(false, true, 0, 5, 1));
        // event index mode ignores the flag
        assert!(notify_needed(true, true, 3, 5, 1));
        assert!(!notify_needed(true, false, 7, 5, 1));
    }

    fn in_window(event: u16, new: u16, old: u16) -> bool {
        let span = new.wrapping_sub(old) as u32;
        (0..span).any(|i| old.wrapping_add(i as u16) == event)
    }

    quickcheck! {
        fn matches_interval_test(event: u16, old: u16, step: u8) -> bool {
            let new = old.wrapping_add(step as u16);
            ring_need_event(event, new, old) == in_window(event, new, old)
        }

        fn matches_interval_test_near_event(old: u16, step: u8, delta: i8) -> bool {
            let new = old.wrapping_add(step as u16);
            let event = old.wrapping_add(delta as i16 as u16);
            ring_need_event(event, new, old) == in_window(event, new, old)
        }
    }
}
