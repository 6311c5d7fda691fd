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

//! Configuration Space Access
//!
//! The device owns a small configuration window and may change it at any
//! time. A device that can change more than one field at once exposes a
//! generation counter, bumped on every change. Readers that need several
//! fields, or a field wider than a single access, read the counter, read the
//! fields, read the counter again, and retry until both counter reads agree.
//!
//! Single 1, 2 and 4 byte reads are atomic on every transport and skip the
//! retry loop.

use bytemuck::Pod;
use thiserror::Error;
#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use crate::endian::{ByteOrder, WireInt};
use crate::features::FeatureSet;

/// Raw access to a device's configuration window.
pub trait ConfigSpace {
    /// Copy `buf.len()` bytes starting at `offset` into `buf`.
    fn get(&self, offset: usize, buf: &mut [u8]);

    /// Copy `buf` into the window starting at `offset`.
    fn set(&self, offset: usize, buf: &[u8]);

    /// Current configuration generation, if the transport has one.
    fn generation(&self) -> Option<u32> {
        None
    }

    /// Size of the window in bytes, if the transport knows it.
    fn size(&self) -> Option<usize> {
        None
    }
}

/// Field types readable from configuration space.
pub trait ConfigValue: WireInt {
    /// Can the transport read this width in one atomic access?
    const SINGLE_ACCESS: bool;
}

impl ConfigValue for u8 {
    const SINGLE_ACCESS: bool = true;
}

impl ConfigValue for u16 {
    const SINGLE_ACCESS: bool = true;
}

impl ConfigValue for u32 {
    const SINGLE_ACCESS: bool = true;
}

impl ConfigValue for u64 {
    const SINGLE_ACCESS: bool = false;
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("configuration field is not present")]
    NotFound,
    #[error("access of {len} bytes at offset {offset} is outside the configuration window")]
    OutOfBounds { offset: usize, len: usize },
}

fn check_bounds<C: ConfigSpace + ?Sized>(
    cfg: &C,
    offset: usize,
    len: usize,
) -> Result<(), ConfigError> {
    let end = offset
        .checked_add(len)
        .ok_or(ConfigError::OutOfBounds { offset, len })?;

    match cfg.size() {
        Some(size) if end > size => Err(ConfigError::OutOfBounds { offset, len }),
        _ => Ok(()),
    }
}

/// Run `read_all` until the generation counter is the same before and after.
fn consistent<C: ConfigSpace + ?Sized>(cfg: &C, mut read_all: impl FnMut()) {
    let mut current = cfg.generation().unwrap_or(0);
    loop {
        let before = current;
        read_all();
        current = cfg.generation().unwrap_or(0);
        if current == before {
            return;
        }
        log::trace!("config generation moved {before} -> {current}, retrying");
    }
}

fn get_value<T: ConfigValue, C: ConfigSpace + ?Sized>(cfg: &C, offset: usize, order: ByteOrder) -> T {
    let mut val = T::zeroed();
    cfg.get(offset, bytemuck::bytes_of_mut(&mut val));
    val.from_wire(order)
}

/// Read one field of width `size_of::<T>()` at `offset`.
pub fn read<T: ConfigValue, C: ConfigSpace + ?Sized>(
    cfg: &C,
    offset: usize,
    order: ByteOrder,
) -> Result<T, ConfigError> {
    check_bounds(cfg, offset, size_of::<T>())?;

    if T::SINGLE_ACCESS {
        return Ok(get_value(cfg, offset, order));
    }

    let mut val = T::zeroed();
    consistent(cfg, || val = get_value(cfg, offset, order));
    Ok(val)
}

/// Read `out.len()` consecutive fields starting at `offset` as one
/// consistent snapshot.
#[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
pub fn read_many<T: ConfigValue, C: ConfigSpace + ?Sized>(
    cfg: &C,
    offset: usize,
    out: &mut [T],
    order: ByteOrder,
) -> Result<(), ConfigError> {
    let width = size_of::<T>();
    let len = out.len().saturating_mul(width);
    check_bounds(cfg, offset, len)?;

    consistent(cfg, || {
        for (i, field) in out.iter_mut().enumerate() {
            *field = get_value(cfg, offset + i * width, order);
        }
    });
    Ok(())
}

/// Read a byte array, such as a name or a MAC address, as one consistent
/// snapshot.
#[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
pub fn read_bytes<C: ConfigSpace + ?Sized>(
    cfg: &C,
    offset: usize,
    out: &mut [u8],
) -> Result<(), ConfigError> {
    check_bounds(cfg, offset, out.len())?;
    consistent(cfg, || cfg.get(offset, out));
    Ok(())
}

/// Read a plain struct laid out in device byte order as one consistent
/// snapshot. Fields are left in wire order.
pub fn read_struct<T: Pod, C: ConfigSpace + ?Sized>(cfg: &C, offset: usize) -> Result<T, ConfigError> {
    let mut val = T::zeroed();
    read_bytes(cfg, offset, bytemuck::bytes_of_mut(&mut val))?;
    Ok(val)
}

/// Write one field at `offset`.
pub fn write<T: ConfigValue, C: ConfigSpace + ?Sized>(
    cfg: &C,
    offset: usize,
    value: T,
    order: ByteOrder,
) -> Result<(), ConfigError> {
    check_bounds(cfg, offset, size_of::<T>())?;
    cfg.set(offset, bytemuck::bytes_of(&value.to_wire(order)));
    Ok(())
}

/// Read a field that only exists when feature `bit` was negotiated.
///
/// # Panics
///
/// Under the same conditions as [`FeatureSet::has`].
pub fn read_feature<T: ConfigValue, C: ConfigSpace + ?Sized>(
    cfg: &C,
    features: &FeatureSet,
    bit: u32,
    offset: usize,
) -> Result<T, ConfigError> {
    if !features.has(bit) {
        return Err(ConfigError::NotFound);
    }
    read(cfg, offset, features.byte_order())
}
