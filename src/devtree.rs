// NFB Peer-to-Peer DMA Tooling
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Device-tree metadata lookup.
//!
//! NFB cards describe their firmware components in a flattened device tree.
//! This crate only consumes it: [`DeviceTree`] is the lookup interface
//! (compatible string, path, phandle, properties) and [`StaticTree`] is an
//! in-memory implementation for callers that decode the blob themselves and
//! for the simulator.
//!
//! `reg` properties are read with one address cell and one size cell.

use crate::error::{P2pError, P2pResult};

/// Index of a node within a [`DeviceTree`].
pub type NodeId = usize;

/// A device-tree property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Property {
    /// A single string.
    String(String),
    /// A string list (e.g. multiple compatible entries).
    Strings(Vec<String>),
    /// 32-bit cells.
    Cells(Vec<u32>),
}

impl Property {
    /// First string of a string or string-list property.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            Self::Strings(list) => list.first().map(String::as_str),
            Self::Cells(_) => None,
        }
    }

    /// Cells of a cell property.
    pub fn as_cells(&self) -> Option<&[u32]> {
        match self {
            Self::Cells(cells) => Some(cells),
            _ => None,
        }
    }

    /// Value of a single-cell property.
    pub fn as_u32(&self) -> Option<u32> {
        match self.as_cells()? {
            [value] => Some(*value),
            _ => None,
        }
    }

    /// Whether a string or string-list property contains `value`.
    pub fn contains_str(&self, value: &str) -> bool {
        match self {
            Self::String(s) => s == value,
            Self::Strings(list) => list.iter().any(|s| s == value),
            Self::Cells(_) => false,
        }
    }
}

/// Offset and size of a node within its bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegSpec {
    pub offset: u64,
    pub size: u64,
}

/// Read-only device-tree lookups.
pub trait DeviceTree {
    /// Nodes whose `compatible` property contains `compatible`, in tree order.
    fn find_compatible(&self, compatible: &str) -> Vec<NodeId>;

    /// Node at the absolute `path`.
    fn find_path(&self, path: &str) -> Option<NodeId>;

    /// Node carrying `phandle`.
    fn resolve_phandle(&self, phandle: u32) -> Option<NodeId>;

    /// Property `name` of `node`.
    fn property(&self, node: NodeId, name: &str) -> Option<&Property>;

    /// Full path of `node`.
    fn node_path(&self, node: NodeId) -> Option<&str>;

    /// Last path component of `node`.
    fn node_name(&self, node: NodeId) -> &str {
        self.node_path(node)
            .and_then(|p| p.rsplit('/').next())
            .unwrap_or("?")
    }

    /// The `reg` spec of `node`.
    fn reg_spec(&self, node: NodeId) -> P2pResult<RegSpec> {
        let cells = self
            .property(node, "reg")
            .and_then(Property::as_cells)
            .ok_or_else(|| missing(self.node_name(node), "reg"))?;
        match cells {
            [offset, size, ..] => Ok(RegSpec {
                offset: u64::from(*offset),
                size: u64::from(*size),
            }),
            _ => Err(P2pError::DeviceTree(format!(
                "node {} has a malformed reg property",
                self.node_name(node)
            ))),
        }
    }

    /// String property `name` of `node`.
    fn string_property(&self, node: NodeId, name: &str) -> P2pResult<&str> {
        self.property(node, name)
            .and_then(Property::as_str)
            .ok_or_else(|| missing(self.node_name(node), name))
    }

    /// Node referenced by the phandle property `name` of `node`.
    fn phandle_property(&self, node: NodeId, name: &str) -> P2pResult<NodeId> {
        let phandle = self
            .property(node, name)
            .and_then(Property::as_u32)
            .ok_or_else(|| missing(self.node_name(node), name))?;
        self.resolve_phandle(phandle).ok_or_else(|| {
            P2pError::DeviceTree(format!(
                "phandle {:#x} referenced by {}.{} does not resolve",
                phandle,
                self.node_name(node),
                name
            ))
        })
    }
}

fn missing(node: &str, property: &str) -> P2pError {
    P2pError::DeviceTree(format!("node {} has no {} property", node, property))
}

#[derive(Debug, Clone)]
struct TreeNode {
    path: String,
    properties: Vec<(String, Property)>,
}

/// In-memory device tree.
#[derive(Debug, Clone, Default)]
pub struct StaticTree {
    nodes: Vec<TreeNode>,
}

impl StaticTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node at `path` and return a builder for its properties.
    pub fn add_node(&mut self, path: &str) -> NodeBuilder<'_> {
        self.nodes.push(TreeNode {
            path: path.to_string(),
            properties: Vec::new(),
        });
        let id = self.nodes.len() - 1;
        NodeBuilder { tree: self, id }
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn set(&mut self, node: NodeId, name: &str, value: Property) {
        let props = &mut self.nodes[node].properties;
        match props.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => *slot = value,
            None => props.push((name.to_string(), value)),
        }
    }
}

impl DeviceTree for StaticTree {
    fn find_compatible(&self, compatible: &str) -> Vec<NodeId> {
        (0..self.nodes.len())
            .filter(|&id| {
                self.property(id, "compatible")
                    .is_some_and(|p| p.contains_str(compatible))
            })
            .collect()
    }

    fn find_path(&self, path: &str) -> Option<NodeId> {
        self.nodes.iter().position(|n| n.path == path)
    }

    fn resolve_phandle(&self, phandle: u32) -> Option<NodeId> {
        (0..self.nodes.len())
            .find(|&id| self.property(id, "phandle").and_then(Property::as_u32) == Some(phandle))
    }

    fn property(&self, node: NodeId, name: &str) -> Option<&Property> {
        self.nodes
            .get(node)?
            .properties
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p)
    }

    fn node_path(&self, node: NodeId) -> Option<&str> {
        self.nodes.get(node).map(|n| n.path.as_str())
    }
}

/// Builder returned by [`StaticTree::add_node`].
pub struct NodeBuilder<'t> {
    tree: &'t mut StaticTree,
    id: NodeId,
}

impl NodeBuilder<'_> {
    pub fn compatible(self, compatible: &str) -> Self {
        self.string("compatible", compatible)
    }

    pub fn reg(self, offset: u32, size: u32) -> Self {
        self.cells("reg", &[offset, size])
    }

    pub fn phandle(self, phandle: u32) -> Self {
        self.cells("phandle", &[phandle])
    }

    pub fn string(self, name: &str, value: &str) -> Self {
        self.tree.set(self.id, name, Property::String(value.to_string()));
        self
    }

    pub fn cells(self, name: &str, cells: &[u32]) -> Self {
        self.tree.set(self.id, name, Property::Cells(cells.to_vec()));
        self
    }

    /// Finish the node and return its id.
    pub fn id(self) -> NodeId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> StaticTree {
        let mut tree = StaticTree::new();
        tree.add_node("/system/device/endpoint0")
            .string("pci-slot", "0000:03:00.0");
        tree.add_node("/firmware/mi_bus0/dma_ctrl_rx0")
            .compatible("cesnet,dma_ctrl_calypte_rx")
            .reg(0x8000, 0x80);
        tree.add_node("/firmware/mi_bus0/dma_ctrl_tx0")
            .compatible("cesnet,dma_ctrl_calypte_tx")
            .reg(0xC000, 0x80)
            .cells("data_buff", &[0x10]);
        tree.add_node("/firmware/mi_bus0/dma_ctrl_rx1")
            .compatible("cesnet,dma_ctrl_calypte_rx")
            .reg(0x8080, 0x80);
        tree.add_node("/firmware/pcie2/tx_data_buff0")
            .compatible("cesnet,dma_calypte_tx_data_buff")
            .reg(0x0, 0x4000)
            .phandle(0x10);
        tree
    }

    #[test]
    fn test_find_compatible_in_tree_order() {
        let tree = sample_tree();
        let rx = tree.find_compatible("cesnet,dma_ctrl_calypte_rx");
        assert_eq!(rx, vec![1, 3]);
        assert_eq!(tree.node_name(rx[1]), "dma_ctrl_rx1");
        assert!(tree.find_compatible("cesnet,nothing").is_empty());
    }

    #[test]
    fn test_find_path_and_string_property() {
        let tree = sample_tree();
        let ep = tree.find_path("/system/device/endpoint0").unwrap();
        assert_eq!(tree.string_property(ep, "pci-slot").unwrap(), "0000:03:00.0");
        assert!(matches!(
            tree.string_property(ep, "missing"),
            Err(P2pError::DeviceTree(_))
        ));
    }

    #[test]
    fn test_reg_spec() {
        let tree = sample_tree();
        assert_eq!(
            tree.reg_spec(2).unwrap(),
            RegSpec {
                offset: 0xC000,
                size: 0x80
            }
        );
        assert!(tree.reg_spec(0).is_err());
    }

    #[test]
    fn test_phandle_property() {
        let mut tree = sample_tree();
        assert_eq!(tree.phandle_property(2, "data_buff").unwrap(), 4);
        assert!(tree.phandle_property(2, "hdr_buff").is_err());

        tree.add_node("/firmware/broken").cells("data_buff", &[0x99]);
        assert!(matches!(
            tree.phandle_property(5, "data_buff"),
            Err(P2pError::DeviceTree(msg)) if msg.contains("does not resolve")
        ));
    }

    #[test]
    fn test_property_accessors() {
        let list = Property::Strings(vec!["a,b".into(), "c,d".into()]);
        assert!(list.contains_str("c,d"));
        assert_eq!(list.as_str(), Some("a,b"));
        assert_eq!(Property::Cells(vec![7]).as_u32(), Some(7));
        assert_eq!(Property::Cells(vec![7, 8]).as_u32(), None);
        assert_eq!(Property::String("x".into()).as_cells(), None);
    }

    #[test]
    fn test_builder_overwrites_property() {
        let mut tree = StaticTree::new();
        let id = tree.add_node("/n").reg(1, 2).reg(3, 4).id();
        assert_eq!(tree.reg_spec(id).unwrap().offset, 3);
        assert_eq!(tree.len(), 1);
    }
}
