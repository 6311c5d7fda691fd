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

//! Byte order of multi-byte ring and configuration fields.
//!
//! Devices that negotiated `VERSION_1` use little-endian fields everywhere.
//! Legacy devices use the byte order of the host that runs the driver. The
//! order is a property of the negotiated feature set, so every field access
//! takes it explicitly rather than assuming one.

use core::fmt::Debug;

use bytemuck::Pod;

/// Byte order used for fields in shared memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ByteOrder {
    /// Fixed little-endian order (`VERSION_1` negotiated).
    #[default]
    Little,
    /// Host-native order (legacy devices).
    Native,
}

impl ByteOrder {
    /// Is this order little-endian on the current host?
    #[inline]
    pub const fn is_little_endian(self) -> bool {
        match self {
            ByteOrder::Little => true,
            ByteOrder::Native => cfg!(target_endian = "little"),
        }
    }
}

/// Integers that can be stored in shared memory.
///
/// The width is fixed by the implementing type, so picking an accessor for
/// an 8, 16, 32 or 64 bit field is resolved at compile time.
pub trait WireInt: Pod + Eq + Debug {
    /// Convert a host value into its representation in shared memory.
    fn to_wire(self, order: ByteOrder) -> Self;

    /// Convert a value read from shared memory into a host value.
    fn from_wire(self, order: ByteOrder) -> Self;
}

macro_rules! impl_wire_int {
    ($($ty:ty),*) => {
        $(
            impl WireInt for $ty {
                #[inline]
                fn to_wire(self, order: ByteOrder) -> Self {
                    match order {
                        ByteOrder::Little => self.to_le(),
                        ByteOrder::Native => self,
                    }
                }

                #[inline]
                fn from_wire(self, order: ByteOrder) -> Self {
                    match order {
                        ByteOrder::Little => <$ty>::from_le(self),
                        ByteOrder::Native => self,
                    }
                }
            }
        )*
    };
}

impl_wire_int!(u8, u16, u32, u64);
