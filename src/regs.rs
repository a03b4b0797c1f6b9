// NFB Peer-to-Peer DMA Tooling
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! DMA controller register map.
//!
//! Offsets are relative to the controller node's `reg` offset on the MI bus
//! and match the NDP/Calypte controller layout used by both the RX and the
//! TX side of the DMA engine.

use bitflags::bitflags;

/// Control register, bit 0 starts the channel.
pub const REG_CONTROL: u64 = 0x00;
/// Status register, bit 0 reports a running channel.
pub const REG_STATUS: u64 = 0x04;
/// Experimental mode register, bit 0 enables peer-to-peer operation.
pub const REG_EXPER: u64 = 0x08;
/// Software descriptor (status) pointer.
pub const REG_SDP: u64 = 0x10;
/// Software header pointer.
pub const REG_SHP: u64 = 0x14;
/// Pointer update timeout.
pub const REG_TIMEOUT: u64 = 0x20;
/// Descriptor (data buffer) base address.
pub const REG_DESC_BASE: u64 = 0x40;
/// Header buffer base address.
pub const REG_HDR_BASE: u64 = 0x48;
/// Remote update pointer: address the controller writes its progress to.
pub const REG_UPDATE_BASE: u64 = 0x50;
/// Maximum data pointer (buffer mask).
pub const REG_MDP: u64 = 0x58;
/// Maximum header pointer (buffer mask).
pub const REG_MHP: u64 = 0x5C;

/// Size of one controller register block.
pub const REGS_SIZE: u64 = 0x80;

/// Block size the Calypte controllers advance their data pointer in.
pub const CALYPTE_BLOCK_SIZE: u32 = 128;

/// Default value written to the timeout register.
pub const DEFAULT_UPDATE_TIMEOUT: u32 = 0x4000;

bitflags! {
    /// Control register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControlFlags: u32 {
        /// Start the channel.
        const START = 1 << 0;
    }
}

bitflags! {
    /// Status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusFlags: u32 {
        /// Channel is running.
        const RUNNING = 1 << 0;
    }
}

bitflags! {
    /// Experimental mode register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExperFlags: u32 {
        /// Peer-to-peer mode.
        const P2P = 1 << 0;
    }
}

/// Bit index of a single-bit flag value.
#[inline]
pub const fn bit_index(mask: u32) -> u32 {
    mask.trailing_zeros()
}

/// Bit index of [`ControlFlags::START`].
pub const CONTROL_START_BIT: u32 = bit_index(ControlFlags::START.bits());
/// Bit index of [`StatusFlags::RUNNING`].
pub const STATUS_RUNNING_BIT: u32 = bit_index(StatusFlags::RUNNING.bits());
/// Bit index of [`ExperFlags::P2P`].
pub const EXPER_P2P_BIT: u32 = bit_index(ExperFlags::P2P.bits());

/// Human-readable name of a controller register.
pub const fn reg_name(offset: u64) -> &'static str {
    match offset {
        REG_CONTROL => "CONTROL",
        REG_STATUS => "STATUS",
        REG_EXPER => "EXPER",
        REG_SDP => "SDP",
        REG_SHP => "SHP",
        REG_TIMEOUT => "TIMEOUT",
        REG_DESC_BASE => "DESC_BASE",
        REG_HDR_BASE => "HDR_BASE",
        REG_UPDATE_BASE => "UPDATE_BASE",
        REG_MDP => "MDP",
        REG_MHP => "MHP",
        _ => "UNKNOWN",
    }
}
