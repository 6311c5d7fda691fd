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

#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]
// We use Arbitrary during fuzzing, which requires std
#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

/// Split virtqueues: ring layout, descriptor chains, producer and consumer
/// cursors, and the event-index notification policy.
///
/// The producer (driver) and the consumer (device) share nothing but the ring
/// memory. Every access to that memory goes through [`virtq::MemOps`], which
/// also carries the ordering points the protocol depends on.
pub mod virtq;

/// Device configuration space access guarded by the generation counter.
pub mod config;

/// Device lifecycle: status byte, feature handshake, queue discovery.
pub mod device;

/// Ordered registry of address-range handlers for trapped accesses.
pub mod dispatch;

/// Wire byte order and width-generic integer conversion.
pub mod endian;

/// Feature bits and the one-time negotiation handshake.
pub mod features;

/// Tunable queue limits, passed explicitly to the device and the rings.
pub mod limits;

/// Device status byte.
pub mod status;

/// Negative errno values reported by transports.
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const ENOMEM: i32 = 12;
    pub const EINVAL: i32 = 22;
    pub const EOPNOTSUPP: i32 = 95;
}
