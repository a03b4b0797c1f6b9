// NFB Peer-to-Peer DMA Tooling
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Device handles.
//!
//! A [`P2pDevice`] bundles what the orchestrator needs from one card: the
//! device tree that describes its firmware, and register access to its MI
//! bus. [`PciDevice`] is the real-hardware implementation: the MI bus is
//! BAR0 of the PCI endpoint named by the tree's `pci-slot` property, mapped
//! through sysfs.

use crate::access::RegisterAccess;
use crate::bar::BarMapping;
use crate::devtree::DeviceTree;
use crate::error::{P2pError, P2pResult};
use crate::resource::{BarResolver, PciAddress};

/// Device-tree node carrying the endpoint's `pci-slot` property.
pub const DEFAULT_ENDPOINT_PATH: &str = "/system/device/endpoint0";

/// A card taking part in a peer-to-peer chain.
pub trait P2pDevice {
    /// Name used in log messages.
    fn name(&self) -> &str;

    fn tree(&self) -> &dyn DeviceTree;

    /// MI bus accessor; device-tree `reg` offsets are relative to it.
    fn bus(&self) -> &dyn RegisterAccess;

    /// PCI address from the `pci-slot` property of the node at `endpoint_path`.
    fn pci_slot(&self, endpoint_path: &str) -> P2pResult<&str> {
        let tree = self.tree();
        let node = tree.find_path(endpoint_path).ok_or_else(|| {
            P2pError::DeviceTree(format!(
                "{}: no endpoint node {}",
                self.name(),
                endpoint_path
            ))
        })?;
        tree.string_property(node, "pci-slot")
    }
}

/// A card reached through its PCI endpoint.
pub struct PciDevice<T> {
    name: String,
    address: PciAddress,
    tree: T,
    bus: BarMapping,
}

impl<T: DeviceTree> PciDevice<T> {
    /// Map BAR0 of the endpoint described by `tree`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The tree has no endpoint node or `pci-slot` property
    /// - The slot is not a valid PCI address
    /// - The BAR cannot be mapped (permissions, not found, non-Linux)
    pub fn open(name: &str, tree: T, resolver: &BarResolver) -> P2pResult<Self> {
        Self::open_at(name, tree, resolver, DEFAULT_ENDPOINT_PATH)
    }

    /// Like [`PciDevice::open`], with the endpoint node at `endpoint_path`.
    pub fn open_at(
        name: &str,
        tree: T,
        resolver: &BarResolver,
        endpoint_path: &str,
    ) -> P2pResult<Self> {
        let node = tree.find_path(endpoint_path).ok_or_else(|| {
            P2pError::DeviceTree(format!("{}: no endpoint node {}", name, endpoint_path))
        })?;
        let address: PciAddress = tree.string_property(node, "pci-slot")?.parse()?;

        let path = resolver.resource_path(&address, 0);
        let bus = BarMapping::open(&path)?;
        log::info!("{}: opened {} ({:#x} bytes MI bus)", name, address, bus.size());

        Ok(Self {
            name: name.to_string(),
            address,
            tree,
            bus,
        })
    }

    pub fn address(&self) -> &PciAddress {
        &self.address
    }
}

impl<T: DeviceTree> P2pDevice for PciDevice<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn tree(&self) -> &dyn DeviceTree {
        &self.tree
    }

    fn bus(&self) -> &dyn RegisterAccess {
        &self.bus
    }
}

impl<T> std::fmt::Debug for PciDevice<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PciDevice")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("bus", &self.bus)
            .finish()
    }
}
