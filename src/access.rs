// NFB Peer-to-Peer DMA Tooling
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Register access.
//!
//! [`RegisterAccess`] is the seam between this crate and whatever transport
//! reaches the hardware: an mmap'ed BAR ([`crate::bar::BarMapping`]), the
//! in-memory simulator ([`crate::sim::SimBus`]) or a caller's own backend.
//! Implementors only provide raw little-endian byte transfers; fixed-width
//! accessors, bit manipulation and polling are built on top.
//!
//! Accessors take `&self` like MMIO does. No locking is performed; callers
//! must not issue overlapping operations on one device.

use crate::devtree::RegSpec;
use crate::error::{P2pError, P2pResult};
use std::time::Duration;

/// Default number of status polls before a wait gives up.
const DEFAULT_POLL_ATTEMPTS: u32 = 1000;

/// Default pause between two status polls.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_micros(20);

/// Bounds for [`RegisterAccess::wait_for_bit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Number of reads of the polled register (at least one is always made).
    pub attempts: u32,
    /// Pause between two reads. Zero spins instead of sleeping.
    pub interval: Duration,
}

impl PollConfig {
    /// Poll configuration with the given bounds.
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Upper bound of the wall-clock time spent sleeping in one wait.
    pub fn max_wait(&self) -> Duration {
        self.interval.saturating_mul(self.attempts.saturating_sub(1))
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_ATTEMPTS, DEFAULT_POLL_INTERVAL)
    }
}

/// Check that `width` bytes at `offset` fit in a window of `size` bytes.
#[inline]
pub fn check_range(size: u64, offset: u64, width: usize) -> P2pResult<()> {
    match offset.checked_add(width as u64) {
        Some(end) if end <= size => Ok(()),
        _ => Err(P2pError::OutOfRange {
            offset,
            width,
            size,
        }),
    }
}

/// Fixed-width register access at byte offsets within an address window.
pub trait RegisterAccess {
    /// Size of the accessible window in bytes.
    fn size(&self) -> u64;

    /// Read `buf.len()` bytes starting at `offset`.
    fn read_into(&self, offset: u64, buf: &mut [u8]) -> P2pResult<()>;

    /// Write `data` starting at `offset`.
    fn write_from(&self, offset: u64, data: &[u8]) -> P2pResult<()>;

    /// Read `len` bytes starting at `offset`.
    fn read_bytes(&self, offset: u64, len: usize) -> P2pResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_into(offset, &mut buf)?;
        Ok(buf)
    }

    fn read_u8(&self, offset: u64) -> P2pResult<u8> {
        let mut b = [0u8; 1];
        self.read_into(offset, &mut b)?;
        Ok(b[0])
    }

    fn read_u16(&self, offset: u64) -> P2pResult<u16> {
        let mut b = [0u8; 2];
        self.read_into(offset, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    fn read_u32(&self, offset: u64) -> P2pResult<u32> {
        let mut b = [0u8; 4];
        self.read_into(offset, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn read_u64(&self, offset: u64) -> P2pResult<u64> {
        let mut b = [0u8; 8];
        self.read_into(offset, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    fn write_u8(&self, offset: u64, value: u8) -> P2pResult<()> {
        self.write_from(offset, &[value])
    }

    fn write_u16(&self, offset: u64, value: u16) -> P2pResult<()> {
        self.write_from(offset, &value.to_le_bytes())
    }

    fn write_u32(&self, offset: u64, value: u32) -> P2pResult<()> {
        self.write_from(offset, &value.to_le_bytes())
    }

    fn write_u64(&self, offset: u64, value: u64) -> P2pResult<()> {
        self.write_from(offset, &value.to_le_bytes())
    }

    /// Read-modify-write setting `bit` of the 32-bit register at `offset`.
    fn set_bit(&self, offset: u64, bit: u32) -> P2pResult<()> {
        let mask = bit_mask(bit)?;
        let value = self.read_u32(offset)?;
        self.write_u32(offset, value | mask)
    }

    /// Read-modify-write clearing `bit` of the 32-bit register at `offset`.
    fn clear_bit(&self, offset: u64, bit: u32) -> P2pResult<()> {
        let mask = bit_mask(bit)?;
        let value = self.read_u32(offset)?;
        self.write_u32(offset, value & !mask)
    }

    /// Poll `bit` of the 32-bit register at `offset` until it equals `level`.
    ///
    /// Returns `Ok(false)` once `poll.attempts` reads did not observe the
    /// requested level. Used both for waiting on a bit to set and to clear.
    fn wait_for_bit(
        &self,
        offset: u64,
        bit: u32,
        level: bool,
        poll: &PollConfig,
    ) -> P2pResult<bool> {
        let mask = bit_mask(bit)?;
        let attempts = poll.attempts.max(1);

        for attempt in 0..attempts {
            let value = self.read_u32(offset)?;
            if (value & mask != 0) == level {
                return Ok(true);
            }
            if attempt + 1 == attempts {
                break;
            }
            if poll.interval.is_zero() {
                core::hint::spin_loop();
            } else {
                std::thread::sleep(poll.interval);
            }
        }

        Ok(false)
    }
}

fn bit_mask(bit: u32) -> P2pResult<u32> {
    1u32.checked_shl(bit)
        .ok_or_else(|| P2pError::InvalidArgument(format!("bit {} exceeds 32-bit register", bit)))
}

/// A bounded register window on a bus, e.g. one DMA controller on the MI bus.
///
/// Offsets passed to a component are relative to its base; accesses past
/// its size fail with [`P2pError::OutOfRange`] instead of reaching the
/// neighbouring component.
#[derive(Clone, Copy)]
pub struct Component<'a> {
    bus: &'a dyn RegisterAccess,
    base: u64,
    size: u64,
}

impl<'a> Component<'a> {
    /// Open the window `[base, base + size)` on `bus`.
    pub fn new(bus: &'a dyn RegisterAccess, base: u64, size: u64) -> P2pResult<Self> {
        check_range(bus.size(), base, size as usize)?;
        Ok(Self { bus, base, size })
    }

    /// Open the window described by a device-tree `reg` spec.
    pub fn from_reg(bus: &'a dyn RegisterAccess, reg: RegSpec) -> P2pResult<Self> {
        Self::new(bus, reg.offset, reg.size)
    }

    /// Offset of the window on the bus.
    pub fn base(&self) -> u64 {
        self.base
    }
}

impl std::fmt::Debug for Component<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Component")
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}

impl RegisterAccess for Component<'_> {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) -> P2pResult<()> {
        check_range(self.size, offset, buf.len())?;
        self.bus.read_into(self.base + offset, buf)
    }

    fn write_from(&self, offset: u64, data: &[u8]) -> P2pResult<()> {
        check_range(self.size, offset, data.len())?;
        self.bus.write_from(self.base + offset, data)
    }
}
