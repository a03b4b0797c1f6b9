// NFB Peer-to-Peer DMA Tooling
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Error types for feature discovery and P2P channel operations.

use crate::p2p::{Direction, Side};
use thiserror::Error;

/// Errors that can occur during discovery, BAR resolution or channel setup.
#[derive(Debug, Error)]
pub enum P2pError {
    /// Feature header chain does not terminate or has an unrecognised structure.
    #[error("corrupt feature chain in BAR{bar} at offset {offset:#x}: {reason}")]
    CorruptChain { bar: u8, offset: u64, reason: String },

    /// Device identifier is not a `DDDD:BB:DD.F` PCI address.
    #[error("invalid PCI device identifier: {0:?}")]
    InvalidDeviceId(String),

    /// Resource table for the device could not be located.
    #[error("device {0} not found in sysfs")]
    DeviceNotFound(String),

    /// Resource table line could not be parsed.
    #[error("malformed resource table for {device} at line {line}")]
    MalformedResource { device: String, line: usize },

    /// A BAR needed for address computation is not assigned.
    #[error("BAR{index} not present on {device}")]
    MissingBar { device: String, index: usize },

    /// Fewer DMA node pairs than required.
    #[error("insufficient DMA channels: requested {requested}, available {available}")]
    InsufficientChannels { requested: usize, available: usize },

    /// A configured channel never reported running.
    #[error("{direction} channel {channel}: {side} did not report running")]
    ChannelStartTimeout {
        channel: usize,
        direction: Direction,
        side: Side,
    },

    /// A channel never reported stopped.
    #[error("{direction} channel {channel}: {side} did not report stopped")]
    ChannelStopTimeout {
        channel: usize,
        direction: Direction,
        side: Side,
    },

    /// Start requested on a chain with a channel already running.
    #[error("{direction} channel {channel} is already started")]
    AlreadyStarted { channel: usize, direction: Direction },

    /// Node or property missing from the device tree.
    #[error("device tree: {0}")]
    DeviceTree(String),

    /// Register access outside of the accessible window.
    #[error("register access out of range: offset {offset:#x}, width {width}, window size {size:#x}")]
    OutOfRange { offset: u64, width: usize, size: u64 },

    /// Invalid argument provided.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O error from system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Permission denied accessing a device resource.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Memory mapping failed.
    #[error("mmap failed: {0}")]
    MmapFailed(String),

    /// Platform not supported.
    #[error("platform not supported: BAR mapping requires Linux sysfs")]
    PlatformNotSupported,
}

/// Result type alias for P2P operations.
pub type P2pResult<T> = Result<T, P2pError>;
