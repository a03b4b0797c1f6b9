// NFB Peer-to-Peer DMA Tooling
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! In-memory simulation of NFB cards.
//!
//! [`SimBus`] is a byte-addressed register file implementing
//! [`RegisterAccess`]. It records every write and counts reads, and its
//! controller status registers can be linked to their control registers so
//! the running bit follows the start bit like real DMA controllers do (or
//! gets stuck, to exercise timeout paths).
//!
//! [`SimCard`] builds a [`SimDevice`]: a bus populated with Calypte RX/TX
//! controllers plus the device tree that describes them.

use crate::access::{check_range, RegisterAccess};
use crate::device::P2pDevice;
use crate::devtree::{DeviceTree, StaticTree};
use crate::error::P2pResult;
use crate::regs::{
    CONTROL_START_BIT, REGS_SIZE, REG_CONTROL, REG_MDP, REG_MHP, REG_STATUS, STATUS_RUNNING_BIT,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;

/// How a linked status register reacts to writes of its control register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusBehavior {
    /// Running bit mirrors the start bit.
    Follow,
    /// Running bit never sets.
    StuckLow,
    /// Running bit sets with the start bit and never clears.
    StuckHigh,
}

#[derive(Debug, Clone, Copy)]
struct StatusLink {
    control: u64,
    status: u64,
    behavior: StatusBehavior,
}

/// One recorded write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub offset: u64,
    pub data: Vec<u8>,
}

impl WriteRecord {
    /// Written bytes as a little-endian integer (first 8 bytes).
    pub fn value(&self) -> u64 {
        let mut buf = [0u8; 8];
        let n = self.data.len().min(8);
        buf[..n].copy_from_slice(&self.data[..n]);
        u64::from_le_bytes(buf)
    }

    pub fn width(&self) -> usize {
        self.data.len()
    }
}

/// Simulated register file.
#[derive(Debug)]
pub struct SimBus {
    mem: RefCell<Vec<u8>>,
    reads: RefCell<HashMap<u64, usize>>,
    writes: RefCell<Vec<WriteRecord>>,
    links: RefCell<Vec<StatusLink>>,
}

impl SimBus {
    /// Zero-filled bus of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            mem: RefCell::new(vec![0; size]),
            reads: RefCell::new(HashMap::new()),
            writes: RefCell::new(Vec::new()),
            links: RefCell::new(Vec::new()),
        }
    }

    /// Number of reads that started at `offset`.
    pub fn read_count(&self, offset: u64) -> usize {
        self.reads.borrow().get(&offset).copied().unwrap_or(0)
    }

    /// All writes so far, in order.
    pub fn write_log(&self) -> Vec<WriteRecord> {
        self.writes.borrow().clone()
    }

    /// Values written at exactly `offset`, in order.
    pub fn writes_to(&self, offset: u64) -> Vec<u64> {
        self.writes
            .borrow()
            .iter()
            .filter(|w| w.offset == offset)
            .map(WriteRecord::value)
            .collect()
    }

    pub fn clear_log(&self) {
        self.writes.borrow_mut().clear();
        self.reads.borrow_mut().clear();
    }

    /// Make the running bit of `status` react to the start bit of `control`.
    /// Relinking a control register replaces its behaviour.
    pub fn link_status(&self, control: u64, status: u64, behavior: StatusBehavior) {
        let mut links = self.links.borrow_mut();
        links.retain(|l| l.control != control);
        links.push(StatusLink {
            control,
            status,
            behavior,
        });
    }

    /// Store `data` at `offset` without logging a write or touching linked
    /// status registers. Bytes past the end of the bus are dropped.
    pub fn preload(&self, offset: u64, data: &[u8]) {
        let mut mem = self.mem.borrow_mut();
        let at = offset as usize;
        if let Some(slot) = mem.get_mut(at..at + data.len()) {
            slot.copy_from_slice(data);
        }
    }

    fn word(mem: &[u8], offset: u64) -> u32 {
        let at = offset as usize;
        match mem.get(at..at + 4) {
            Some(b) => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            None => 0,
        }
    }

    fn set_word(mem: &mut [u8], offset: u64, value: u32) {
        let at = offset as usize;
        if let Some(b) = mem.get_mut(at..at + 4) {
            b.copy_from_slice(&value.to_le_bytes());
        }
    }

    fn update_status(&self, offset: u64, len: usize) {
        let links = self.links.borrow();
        let mut mem = self.mem.borrow_mut();
        for link in links.iter() {
            let touched = offset < link.control + 4 && link.control < offset + len as u64;
            if !touched {
                continue;
            }
            let start = Self::word(&mem, link.control) & (1 << CONTROL_START_BIT) != 0;
            let status = Self::word(&mem, link.status);
            let running = 1u32 << STATUS_RUNNING_BIT;
            let next = match link.behavior {
                StatusBehavior::Follow if start => status | running,
                StatusBehavior::Follow => status & !running,
                StatusBehavior::StuckLow => status & !running,
                StatusBehavior::StuckHigh if start => status | running,
                StatusBehavior::StuckHigh => status,
            };
            Self::set_word(&mut mem, link.status, next);
        }
    }
}

impl RegisterAccess for SimBus {
    fn size(&self) -> u64 {
        self.mem.borrow().len() as u64
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) -> P2pResult<()> {
        let mem = self.mem.borrow();
        check_range(mem.len() as u64, offset, buf.len())?;
        let at = offset as usize;
        buf.copy_from_slice(&mem[at..at + buf.len()]);
        *self.reads.borrow_mut().entry(offset).or_insert(0) += 1;
        Ok(())
    }

    fn write_from(&self, offset: u64, data: &[u8]) -> P2pResult<()> {
        {
            let mut mem = self.mem.borrow_mut();
            check_range(mem.len() as u64, offset, data.len())?;
            let at = offset as usize;
            mem[at..at + data.len()].copy_from_slice(data);
        }
        self.writes.borrow_mut().push(WriteRecord {
            offset,
            data: data.to_vec(),
        });
        self.update_status(offset, data.len());
        Ok(())
    }
}

/// Size of the simulated MI bus.
pub const SIM_BUS_SIZE: usize = 0x1_0000;
/// MI bus offset of the first RX (`cesnet,dma_ctrl_calypte_rx`) controller.
pub const SIM_RX_CTRL_BASE: u64 = 0x4000;
/// MI bus offset of the first TX (`cesnet,dma_ctrl_calypte_tx`) controller.
pub const SIM_TX_CTRL_BASE: u64 = 0x6000;
/// BAR2 offset of the first TX data buffer.
pub const SIM_DATA_BUFF_BASE: u64 = 0x0;
/// Distance between two TX data buffers.
pub const SIM_DATA_BUFF_SIZE: u64 = 0x1_0000;
/// BAR2 offset of the first TX header buffer.
pub const SIM_HDR_BUFF_BASE: u64 = 0x80_0000;
/// Distance between two TX header buffers.
pub const SIM_HDR_BUFF_SIZE: u64 = 0x1000;

const DATA_PHANDLE_BASE: u32 = 0x100;
const HDR_PHANDLE_BASE: u32 = 0x200;

/// Builder for a simulated card.
#[derive(Debug, Clone)]
pub struct SimCard {
    name: String,
    pci_slot: String,
    bars: Vec<u64>,
    rx_channels: usize,
    tx_channels: usize,
    mdp: u16,
    mhp: u16,
    block_size: Option<u32>,
}

impl SimCard {
    /// Card `name` at PCI address `pci_slot` with 4 RX and 4 TX controllers
    /// and BAR0/BAR2 assigned.
    pub fn new(name: &str, pci_slot: &str) -> Self {
        Self {
            name: name.to_string(),
            pci_slot: pci_slot.to_string(),
            bars: vec![0xF000_0000, 0, 0xE000_0000],
            rx_channels: 4,
            tx_channels: 4,
            mdp: 0x7FFF,
            mhp: 0x01FF,
            block_size: None,
        }
    }

    /// BAR base addresses in index order; zero marks an unassigned BAR.
    pub fn with_bars(mut self, bars: &[u64]) -> Self {
        self.bars = bars.to_vec();
        self
    }

    pub fn with_channels(mut self, rx: usize, tx: usize) -> Self {
        self.rx_channels = rx;
        self.tx_channels = tx;
        self
    }

    /// MDP and MHP limits preloaded into every TX controller.
    pub fn with_limits(mut self, mdp: u16, mhp: u16) -> Self {
        self.mdp = mdp;
        self.mhp = mhp;
        self
    }

    /// Publish a `block-size` property on the TX controller nodes.
    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = Some(block_size);
        self
    }

    pub fn build(self) -> SimDevice {
        let bus = SimBus::new(SIM_BUS_SIZE);
        let mut tree = StaticTree::new();

        tree.add_node("/system/device/endpoint0")
            .string("pci-slot", &self.pci_slot);

        for i in 0..self.rx_channels {
            let base = SimDevice::rx_ctrl(i);
            tree.add_node(&format!("/firmware/mi_bus0/dma_ctrl_calypte_rx{}", i))
                .compatible("cesnet,dma_ctrl_calypte_rx")
                .reg(base as u32, REGS_SIZE as u32);
            bus.link_status(base + REG_CONTROL, base + REG_STATUS, StatusBehavior::Follow);
        }

        for i in 0..self.tx_channels {
            let base = SimDevice::tx_ctrl(i);
            let data = DATA_PHANDLE_BASE + i as u32;
            let hdr = HDR_PHANDLE_BASE + i as u32;
            let node = tree
                .add_node(&format!("/firmware/mi_bus0/dma_ctrl_calypte_tx{}", i))
                .compatible("cesnet,dma_ctrl_calypte_tx")
                .reg(base as u32, REGS_SIZE as u32)
                .cells("data_buff", &[data])
                .cells("hdr_buff", &[hdr]);
            if let Some(block_size) = self.block_size {
                node.cells("block-size", &[block_size]);
            }

            tree.add_node(&format!("/firmware/pcie0/tx_data_buff{}", i))
                .compatible("cesnet,dma_calypte_tx_data_buff")
                .reg(SimDevice::data_buff(i) as u32, SIM_DATA_BUFF_SIZE as u32)
                .phandle(data);
            tree.add_node(&format!("/firmware/pcie0/tx_hdr_buff{}", i))
                .compatible("cesnet,dma_calypte_tx_hdr_buff")
                .reg(SimDevice::hdr_buff(i) as u32, SIM_HDR_BUFF_SIZE as u32)
                .phandle(hdr);

            bus.link_status(base + REG_CONTROL, base + REG_STATUS, StatusBehavior::Follow);
            bus.preload(base + REG_MDP, &self.mdp.to_le_bytes());
            bus.preload(base + REG_MHP, &self.mhp.to_le_bytes());
        }

        SimDevice {
            name: self.name,
            pci_slot: self.pci_slot,
            bars: self.bars,
            tree,
            bus,
        }
    }
}

/// A simulated card: device tree plus MI bus.
#[derive(Debug)]
pub struct SimDevice {
    name: String,
    pci_slot: String,
    bars: Vec<u64>,
    tree: StaticTree,
    bus: SimBus,
}

impl SimDevice {
    /// MI bus offset of RX controller `index`.
    pub const fn rx_ctrl(index: usize) -> u64 {
        SIM_RX_CTRL_BASE + index as u64 * REGS_SIZE
    }

    /// MI bus offset of TX controller `index`.
    pub const fn tx_ctrl(index: usize) -> u64 {
        SIM_TX_CTRL_BASE + index as u64 * REGS_SIZE
    }

    /// BAR2 offset of the data buffer of TX controller `index`.
    pub const fn data_buff(index: usize) -> u64 {
        SIM_DATA_BUFF_BASE + index as u64 * SIM_DATA_BUFF_SIZE
    }

    /// BAR2 offset of the header buffer of TX controller `index`.
    pub const fn hdr_buff(index: usize) -> u64 {
        SIM_HDR_BUFF_BASE + index as u64 * SIM_HDR_BUFF_SIZE
    }

    pub fn sim_bus(&self) -> &SimBus {
        &self.bus
    }

    /// Change how the controller at `ctrl` reports its running state.
    pub fn set_status_behavior(&self, ctrl: u64, behavior: StatusBehavior) {
        self.bus
            .link_status(ctrl + REG_CONTROL, ctrl + REG_STATUS, behavior);
    }

    /// Write `<root>/<pci-slot>/resource` in the kernel's sysfs format.
    pub fn write_sysfs(&self, root: &Path) -> std::io::Result<()> {
        let dir = root.join(&self.pci_slot);
        std::fs::create_dir_all(&dir)?;
        let mut table = String::new();
        for base in &self.bars {
            let (end, flags) = if *base == 0 {
                (0, 0)
            } else {
                (base + 0x00FF_FFFF, 0x0014_220c)
            };
            table.push_str(&format!("{:#018x} {:#018x} {:#018x}\n", base, end, flags));
        }
        std::fs::write(dir.join("resource"), table)
    }
}

impl P2pDevice for SimDevice {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::REG_EXPER;

    #[test]
    fn test_write_log_and_read_count() {
        let bus = SimBus::new(0x100);
        bus.write_u32(0x10, 0xAABB_CCDD).unwrap();
        bus.write_u16(0x20, 0x1234).unwrap();
        let log = bus.write_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].value(), 0xAABB_CCDD);
        assert_eq!(log[1].width(), 2);
        assert_eq!(bus.writes_to(0x20), vec![0x1234]);

        bus.read_u64(0x10).unwrap();
        bus.read_u64(0x10).unwrap();
        assert_eq!(bus.read_count(0x10), 2);
        assert_eq!(bus.read_count(0x14), 0);

        bus.clear_log();
        assert!(bus.write_log().is_empty());
        assert_eq!(bus.read_count(0x10), 0);
    }

    #[test]
    fn test_out_of_range() {
        let bus = SimBus::new(0x10);
        assert!(bus.write_u64(0xC, 0).is_err());
        assert!(bus.read_u32(0x10).is_err());
        assert!(bus.write_log().is_empty());
    }

    #[test]
    fn test_status_follows_control() {
        let bus = SimBus::new(0x100);
        bus.link_status(0x0, 0x4, StatusBehavior::Follow);
        bus.set_bit(0x0, 0).unwrap();
        assert_eq!(bus.read_u32(0x4).unwrap() & 1, 1);
        bus.clear_bit(0x0, 0).unwrap();
        assert_eq!(bus.read_u32(0x4).unwrap() & 1, 0);
        // Unrelated writes leave the status alone.
        bus.write_u32(0x8, 1).unwrap();
        assert_eq!(bus.read_u32(0x4).unwrap() & 1, 0);
    }

    #[test]
    fn test_stuck_status() {
        let bus = SimBus::new(0x100);
        bus.link_status(0x0, 0x4, StatusBehavior::StuckLow);
        bus.set_bit(0x0, 0).unwrap();
        assert_eq!(bus.read_u32(0x4).unwrap() & 1, 0);

        bus.link_status(0x0, 0x4, StatusBehavior::StuckHigh);
        bus.set_bit(0x0, 0).unwrap();
        bus.clear_bit(0x0, 0).unwrap();
        assert_eq!(bus.read_u32(0x4).unwrap() & 1, 1);
    }

    #[test]
    fn test_card_layout() {
        let card = SimCard::new("card0", "0000:03:00.0")
            .with_channels(2, 3)
            .with_limits(0x0FFF, 0x00FF)
            .build();
        let tree = card.tree();
        assert_eq!(tree.find_compatible("cesnet,dma_ctrl_calypte_rx").len(), 2);
        let tx = tree.find_compatible("cesnet,dma_ctrl_calypte_tx");
        assert_eq!(tx.len(), 3);
        assert_eq!(tree.reg_spec(tx[1]).unwrap().offset, SimDevice::tx_ctrl(1));

        let data = tree.phandle_property(tx[2], "data_buff").unwrap();
        assert_eq!(tree.reg_spec(data).unwrap().offset, SimDevice::data_buff(2));
        let hdr = tree.phandle_property(tx[2], "hdr_buff").unwrap();
        assert_eq!(tree.reg_spec(hdr).unwrap().offset, SimDevice::hdr_buff(2));

        let bus = card.bus();
        assert_eq!(bus.read_u16(SimDevice::tx_ctrl(0) + REG_MDP).unwrap(), 0x0FFF);
        assert_eq!(bus.read_u16(SimDevice::tx_ctrl(0) + REG_MHP).unwrap(), 0x00FF);
        assert!(card.sim_bus().write_log().is_empty());

        let ctrl = SimDevice::rx_ctrl(1);
        bus.set_bit(ctrl + REG_CONTROL, 0).unwrap();
        assert_eq!(bus.read_u32(ctrl + REG_STATUS).unwrap() & 1, 1);
        bus.set_bit(ctrl + REG_EXPER, 0).unwrap();
    }

    #[test]
    fn test_write_sysfs() {
        let dir = tempfile::tempdir().unwrap();
        let card = SimCard::new("card0", "0000:03:00.0")
            .with_bars(&[0x1000, 0, 0x3000])
            .build();
        card.write_sysfs(dir.path()).unwrap();
        let text = std::fs::read_to_string(dir.path().join("0000:03:00.0/resource")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("0x0000000000001000 "));
        assert!(lines[1].starts_with("0x0000000000000000 "));
    }
}
