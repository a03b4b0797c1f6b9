// NFB Peer-to-Peer DMA Tooling
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! # NFB Peer-to-Peer DMA Tooling
//!
//! This crate connects the DMA engines of two NFB FPGA cards so that one card
//! writes packet data directly into the buffers of the other, without the
//! payload passing through host memory. It also walks Device Feature Lists
//! (DFL), the linked lists of capability headers found in the BARs of
//! OFS-style FPGA designs.
//!
//! ## Components
//!
//! - [`dfl`]: feature header decoding and DFL traversal across BARs
//! - [`resource`]: BAR base addresses from the sysfs resource table
//! - [`p2p`]: queue pair resolution, start with rollback, best-effort stop
//! - [`access`]: the [`RegisterAccess`] seam and bounded [`Component`] windows
//! - [`devtree`]: device-tree lookups the orchestrator needs
//! - [`bar`], [`device`]: mapped BARs and real PCI devices (Linux)
//! - [`sim`]: simulated cards for tests and dry runs
//!
//! ## Platform Support
//!
//! | Platform | BAR mapping | Discovery / simulation |
//! |----------|-------------|------------------------|
//! | Linux    | Supported   | Supported              |
//! | Other    | Not available | Supported            |
//!
//! On other platforms [`BarMapping::open`] returns
//! [`P2pError::PlatformNotSupported`]; everything that runs against a
//! [`RegisterAccess`] implementation works unchanged.
//!
//! ## Example
//!
//! ```rust
//! use nfb_p2p::{discover, FeatureHeader, HeaderKind, RegisterAccess, SimBus};
//!
//! fn main() -> Result<(), nfb_p2p::P2pError> {
//!     let bar = SimBus::new(0x1000);
//!     let header = FeatureHeader {
//!         id: 0x12,
//!         kind: HeaderKind::Private,
//!         version: 0,
//!         next_offset: 0,
//!         end_of_list: true,
//!     };
//!     bar.write_u64(0, header.encode())?;
//!
//!     let features = discover(&bar, 0)?;
//!     assert_eq!(features.get(0x12).map(|f| f.offset), Some(0));
//!     Ok(())
//! }
//! ```
//!
//! ## Requirements
//!
//! ### Hardware
//! - Two NFB cards with DMA Calypte controllers in firmware
//! - A PCIe topology that routes peer-to-peer transactions between them
//!
//! ### Software
//! - Read/write access to `/sys/bus/pci/devices/<bdf>/resource*`
//! - The cards' device trees, decoded by the caller

// Module declarations
pub mod access;
pub mod bar;
pub mod device;
pub mod devtree;
pub mod dfl;
pub mod error;
pub mod p2p;
pub mod regs;
pub mod resource;
pub mod sim;

// Re-exports for convenient access
pub use access::{Component, PollConfig, RegisterAccess};
pub use bar::BarMapping;
pub use device::{P2pDevice, PciDevice, DEFAULT_ENDPOINT_PATH};
pub use devtree::{DeviceTree, NodeId, Property, RegSpec, StaticTree};
pub use dfl::{
    discover, DflWalker, DiscoverOptions, FeatureCollision, FeatureHeader, FeatureLocation,
    FeatureMap, Guid, HeaderKind,
};
pub use error::{P2pError, P2pResult};
pub use p2p::{
    ChainConfig, ChannelState, ChannelStopStatus, Direction, P2pChain, QueuePair, Side,
    StopReport,
};
pub use resource::{resolve_bars, BarResolver, BarTable, PciAddress};
pub use sim::{SimBus, SimCard, SimDevice, StatusBehavior};
