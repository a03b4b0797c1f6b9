// NFB Peer-to-Peer DMA Tooling
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Peer-to-peer DMA channel orchestration.
//!
//! A [`P2pChain`] connects DMA controllers of two cards so the transmitting
//! card writes packet data straight into the receiving card's buffers. Each
//! [`QueuePair`] pairs, by index, a transmit-capable controller
//! (`cesnet,dma_ctrl_calypte_rx`, which moves data out of the card) on one
//! device with a receive-capable controller (`cesnet,dma_ctrl_calypte_tx`)
//! on the other. Under full duplex every channel also gets an ingress pair
//! with the roles of the two cards swapped.
//!
//! All bus addresses are resolved once in [`P2pChain::build`]; `start` and
//! `stop` only program registers.
//!
//! # Example
//!
//! ```no_run
//! use nfb_p2p::{BarResolver, ChainConfig, P2pChain, PciDevice, StaticTree};
//!
//! # fn trees() -> (StaticTree, StaticTree) { unimplemented!() }
//! # fn main() -> Result<(), nfb_p2p::P2pError> {
//! let (tree_a, tree_b) = trees();
//! let resolver = BarResolver::default();
//! let a = PciDevice::open("card0", tree_a, &resolver)?;
//! let b = PciDevice::open("card1", tree_b, &resolver)?;
//!
//! let mut chain = P2pChain::build(&a, &b, 4, false, ChainConfig::default())?;
//! chain.start()?;
//! // ... traffic flows card0 -> card1 ...
//! chain.stop().into_result()?;
//! # Ok(())
//! # }
//! ```

use crate::access::{Component, PollConfig, RegisterAccess};
use crate::device::{P2pDevice, DEFAULT_ENDPOINT_PATH};
use crate::devtree::{NodeId, Property, RegSpec};
use crate::error::{P2pError, P2pResult};
use crate::regs::{
    CALYPTE_BLOCK_SIZE, CONTROL_START_BIT, DEFAULT_UPDATE_TIMEOUT, EXPER_P2P_BIT, REG_CONTROL,
    REG_DESC_BASE, REG_EXPER, REG_HDR_BASE, REG_MDP, REG_MHP, REG_SDP, REG_STATUS, REG_TIMEOUT,
    REG_UPDATE_BASE, STATUS_RUNNING_BIT, reg_name,
};
use crate::resource::{BarResolver, BarTable, SYSFS_PCI_DEVICES_PATH};
use std::fmt;
use std::path::PathBuf;

/// Compatible string of transmit-capable controllers.
pub const DEFAULT_TRANS_COMPATIBLE: &str = "cesnet,dma_ctrl_calypte_rx";
/// Compatible string of receive-capable controllers.
pub const DEFAULT_RECV_COMPATIBLE: &str = "cesnet,dma_ctrl_calypte_tx";

/// BAR holding the MI bus (controller registers).
const MI_BAR: usize = 0;
/// BAR holding the DMA data and header buffers.
const BUFFER_BAR: usize = 2;

/// Direction of a queue pair relative to the chain's transmitting device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Transmitting device to receiving device.
    Egress,
    /// Receiving device back to transmitting device (full duplex only).
    Ingress,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Egress => "egress",
            Self::Ingress => "ingress",
        })
    }
}

/// One end of a queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Transmitter,
    Receiver,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Transmitter => "transmitter",
            Self::Receiver => "receiver",
        })
    }
}

/// Lifecycle of a queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Addresses resolved, never started.
    Configured,
    /// Registers being programmed by `start`.
    Configuring,
    Started,
    /// Being shut down by `stop` or a rollback.
    Stopping,
    Stopped,
}

/// Chain configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    /// Bounds for every start/stop wait.
    pub poll: PollConfig,
    /// Value programmed into the timeout register of both controllers.
    pub update_timeout: u32,
    /// Receiver block size, used when a receiver node has no `block-size`
    /// property.
    pub block_size: u32,
    pub trans_compatible: String,
    pub recv_compatible: String,
    /// Device-tree node with the `pci-slot` property.
    pub endpoint_path: String,
    /// sysfs PCI device directory the BAR tables are read from.
    pub sysfs_root: PathBuf,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            update_timeout: DEFAULT_UPDATE_TIMEOUT,
            block_size: CALYPTE_BLOCK_SIZE,
            trans_compatible: DEFAULT_TRANS_COMPATIBLE.to_string(),
            recv_compatible: DEFAULT_RECV_COMPATIBLE.to_string(),
            endpoint_path: DEFAULT_ENDPOINT_PATH.to_string(),
            sysfs_root: PathBuf::from(SYSFS_PCI_DEVICES_PATH),
        }
    }
}

impl ChainConfig {
    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_update_timeout(mut self, timeout: u32) -> Self {
        self.update_timeout = timeout;
        self
    }

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_compatibles(mut self, trans: &str, recv: &str) -> Self {
        self.trans_compatible = trans.to_string();
        self.recv_compatible = recv.to_string();
        self
    }

    pub fn with_endpoint_path(mut self, path: &str) -> Self {
        self.endpoint_path = path.to_string();
        self
    }

    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }
}

/// One transmitter/receiver controller pair with its resolved addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePair {
    pub channel: usize,
    pub direction: Direction,
    pub trans_node: NodeId,
    pub recv_node: NodeId,
    /// Transmitter controller window on its device's MI bus.
    pub trans_reg: RegSpec,
    /// Receiver controller window on its device's MI bus.
    pub recv_reg: RegSpec,
    /// Bus address of the transmitter's SDP register.
    pub trans_sdp_addr: u64,
    /// Bus address of the receiver's SDP register.
    pub recv_sdp_addr: u64,
    /// Bus address of the receiver's data buffer.
    pub data_buff_addr: u64,
    /// Bus address of the receiver's header buffer.
    pub hdr_buff_addr: u64,
    /// Receiver block size MDP is scaled by.
    pub block_size: u32,
    state: ChannelState,
}

impl QueuePair {
    pub fn state(&self) -> ChannelState {
        self.state
    }
}

/// Outcome of stopping one queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStopStatus {
    pub channel: usize,
    pub direction: Direction,
    pub transmitter_stopped: bool,
    pub receiver_stopped: bool,
}

impl ChannelStopStatus {
    pub fn stopped(&self) -> bool {
        self.transmitter_stopped && self.receiver_stopped
    }
}

/// Per-pair results of [`P2pChain::stop`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    channels: Vec<ChannelStopStatus>,
}

impl StopReport {
    /// Results in queue pair order.
    pub fn channels(&self) -> &[ChannelStopStatus] {
        &self.channels
    }

    pub fn all_stopped(&self) -> bool {
        self.channels.iter().all(ChannelStopStatus::stopped)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ChannelStopStatus> {
        self.channels.iter().filter(|c| !c.stopped())
    }

    /// `Err(ChannelStopTimeout)` naming the first pair that did not stop.
    pub fn into_result(self) -> P2pResult<()> {
        match self.failures().next() {
            None => Ok(()),
            Some(c) => Err(P2pError::ChannelStopTimeout {
                channel: c.channel,
                direction: c.direction,
                side: if c.receiver_stopped {
                    Side::Transmitter
                } else {
                    Side::Receiver
                },
            }),
        }
    }
}

/// A peer-to-peer session between two devices.
pub struct P2pChain<'d> {
    trans: &'d dyn P2pDevice,
    recv: &'d dyn P2pDevice,
    trans_bars: BarTable,
    recv_bars: BarTable,
    pairs: Vec<QueuePair>,
    channel_count: usize,
    full_duplex: bool,
    config: ChainConfig,
}

/// Controllers of one direction, as found in the two device trees.
struct NodeSets {
    trans: Vec<NodeId>,
    recv: Vec<NodeId>,
}

impl<'d> P2pChain<'d> {
    /// Resolve a chain of `channel_count` channels from `trans` to `recv`.
    ///
    /// The count is clamped to the number of controller pairs available in
    /// every requested direction.
    ///
    /// # Errors
    ///
    /// - [`P2pError::InsufficientChannels`] if the clamped count is zero
    /// - [`P2pError::MissingBar`] if BAR0 or BAR2 of a device is unassigned
    /// - [`P2pError::DeviceTree`] if a node lacks `reg`, `data_buff` or
    ///   `hdr_buff`, or the endpoint node is missing
    /// - BAR resolution errors from [`BarResolver::resolve`]
    pub fn build(
        trans: &'d dyn P2pDevice,
        recv: &'d dyn P2pDevice,
        channel_count: usize,
        full_duplex: bool,
        config: ChainConfig,
    ) -> P2pResult<Self> {
        let (egress, ingress) = Self::enumerate(trans, recv, full_duplex, &config);
        let available = available(&egress, ingress.as_ref());
        let count = channel_count.min(available);

        if count == 0 {
            return Err(P2pError::InsufficientChannels {
                requested: channel_count,
                available,
            });
        }
        if count < channel_count {
            log::warn!(
                "requested {} channels, only {} controller pairs available",
                channel_count,
                available
            );
        }

        let channels: Vec<usize> = (0..count).collect();
        Self::assemble(trans, recv, &channels, full_duplex, config, egress, ingress)
    }

    /// Resolve a chain over an explicit list of channel indices.
    ///
    /// Indices are used in ascending order.
    ///
    /// # Errors
    ///
    /// As [`P2pChain::build`]; additionally [`P2pError::InsufficientChannels`]
    /// for an index with no controller pair and [`P2pError::InvalidArgument`]
    /// for a repeated index.
    pub fn build_selected(
        trans: &'d dyn P2pDevice,
        recv: &'d dyn P2pDevice,
        channels: &[usize],
        full_duplex: bool,
        config: ChainConfig,
    ) -> P2pResult<Self> {
        let (egress, ingress) = Self::enumerate(trans, recv, full_duplex, &config);
        let available = available(&egress, ingress.as_ref());

        let mut sorted = channels.to_vec();
        sorted.sort_unstable();
        if let Some(w) = sorted.windows(2).find(|w| w[0] == w[1]) {
            return Err(P2pError::InvalidArgument(format!(
                "channel {} selected twice",
                w[0]
            )));
        }
        match sorted.last() {
            None => {
                return Err(P2pError::InsufficientChannels {
                    requested: 0,
                    available,
                })
            }
            Some(&last) if last >= available => {
                return Err(P2pError::InsufficientChannels {
                    requested: last + 1,
                    available,
                })
            }
            Some(_) => {}
        }

        Self::assemble(trans, recv, &sorted, full_duplex, config, egress, ingress)
    }

    fn enumerate(
        trans: &dyn P2pDevice,
        recv: &dyn P2pDevice,
        full_duplex: bool,
        config: &ChainConfig,
    ) -> (NodeSets, Option<NodeSets>) {
        let egress = NodeSets {
            trans: trans.tree().find_compatible(&config.trans_compatible),
            recv: recv.tree().find_compatible(&config.recv_compatible),
        };
        let ingress = full_duplex.then(|| NodeSets {
            trans: recv.tree().find_compatible(&config.trans_compatible),
            recv: trans.tree().find_compatible(&config.recv_compatible),
        });
        (egress, ingress)
    }

    fn assemble(
        trans: &'d dyn P2pDevice,
        recv: &'d dyn P2pDevice,
        channels: &[usize],
        full_duplex: bool,
        config: ChainConfig,
        egress: NodeSets,
        ingress: Option<NodeSets>,
    ) -> P2pResult<Self> {
        if config.block_size == 0 {
            return Err(P2pError::InvalidArgument("block size must not be zero".into()));
        }

        let resolver = BarResolver::new(&config.sysfs_root);
        let trans_bars = resolver.resolve(trans.pci_slot(&config.endpoint_path)?)?;
        let recv_bars = resolver.resolve(recv.pci_slot(&config.endpoint_path)?)?;
        log::info!("{} BARs: {:?}", trans.name(), trans_bars);
        log::info!("{} BARs: {:?}", recv.name(), recv_bars);

        let mut pairs = Vec::new();
        for &channel in channels {
            pairs.push(resolve_pair(
                channel,
                Direction::Egress,
                (trans, &trans_bars, egress.trans[channel]),
                (recv, &recv_bars, egress.recv[channel]),
                &config,
            )?);
            if let Some(ingress) = &ingress {
                pairs.push(resolve_pair(
                    channel,
                    Direction::Ingress,
                    (recv, &recv_bars, ingress.trans[channel]),
                    (trans, &trans_bars, ingress.recv[channel]),
                    &config,
                )?);
            }
        }

        log::info!(
            "P2P chain {} -> {}: {} channel(s){}",
            trans.name(),
            recv.name(),
            channels.len(),
            if full_duplex { ", full duplex" } else { "" }
        );

        Ok(Self {
            trans,
            recv,
            trans_bars,
            recv_bars,
            pairs,
            channel_count: channels.len(),
            full_duplex,
            config,
        })
    }

    /// Start every queue pair, in order.
    ///
    /// If a pair fails to start, it and every pair started by this call are
    /// stopped again (latest first) before the error is returned.
    ///
    /// # Errors
    ///
    /// - [`P2pError::AlreadyStarted`] if a pair is already running
    /// - [`P2pError::ChannelStartTimeout`] naming the pair and side that never
    ///   reported running
    /// - register access errors
    pub fn start(&mut self) -> P2pResult<()> {
        if let Some(pair) = self.pairs.iter().find(|p| p.state == ChannelState::Started) {
            return Err(P2pError::AlreadyStarted {
                channel: pair.channel,
                direction: pair.direction,
            });
        }

        let (trans, recv) = (self.trans, self.recv);
        let config = &self.config;

        let mut rollback = scopeguard::guard(
            (&mut self.pairs, Vec::<usize>::new()),
            move |(pairs, started)| {
                for &index in started.iter().rev() {
                    if let Some(pair) = pairs.get_mut(index) {
                        log::warn!(
                            "rolling back {} channel {}",
                            pair.direction,
                            pair.channel
                        );
                        stop_pair(endpoints(trans, recv, pair.direction), config, pair);
                    }
                }
            },
        );

        for index in 0..rollback.0.len() {
            let (pairs, started) = &mut *rollback;
            let Some(pair) = pairs.get_mut(index) else {
                break;
            };

            let devices = endpoints(trans, recv, pair.direction);
            pair.state = ChannelState::Configuring;
            match start_pair(devices, config, pair) {
                Ok(()) => {
                    pair.state = ChannelState::Started;
                    started.push(index);
                }
                Err(err) => {
                    log::warn!(
                        "failed to start {} channel {}: {}",
                        pair.direction,
                        pair.channel,
                        err
                    );
                    stop_pair(devices, config, pair);
                    return Err(err);
                }
            }
        }

        scopeguard::ScopeGuard::into_inner(rollback);
        Ok(())
    }

    /// Stop every queue pair.
    ///
    /// Never stops early: every pair is attempted and the outcome of each is
    /// in the report.
    pub fn stop(&mut self) -> StopReport {
        let (trans, recv) = (self.trans, self.recv);
        let config = &self.config;
        let channels = self
            .pairs
            .iter_mut()
            .map(|pair| stop_pair(endpoints(trans, recv, pair.direction), config, pair))
            .collect();
        StopReport { channels }
    }

    /// Number of channels (per direction).
    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn full_duplex(&self) -> bool {
        self.full_duplex
    }

    /// Queue pairs in start order: by channel, egress before ingress.
    pub fn pairs(&self) -> &[QueuePair] {
        &self.pairs
    }

    pub fn trans_bars(&self) -> &BarTable {
        &self.trans_bars
    }

    pub fn recv_bars(&self) -> &BarTable {
        &self.recv_bars
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// State of the pair for `channel` in `direction`.
    pub fn state(&self, channel: usize, direction: Direction) -> Option<ChannelState> {
        self.pairs
            .iter()
            .find(|p| p.channel == channel && p.direction == direction)
            .map(QueuePair::state)
    }
}

impl fmt::Debug for P2pChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("P2pChain")
            .field("trans", &self.trans.name())
            .field("recv", &self.recv.name())
            .field("trans_bars", &self.trans_bars)
            .field("recv_bars", &self.recv_bars)
            .field("pairs", &self.pairs)
            .field("full_duplex", &self.full_duplex)
            .finish()
    }
}

fn available(egress: &NodeSets, ingress: Option<&NodeSets>) -> usize {
    let mut n = egress.trans.len().min(egress.recv.len());
    if let Some(ingress) = ingress {
        n = n.min(ingress.trans.len()).min(ingress.recv.len());
    }
    n
}

/// `(transmitting device, receiving device)` of a pair in `direction`.
fn endpoints<'a>(
    trans: &'a dyn P2pDevice,
    recv: &'a dyn P2pDevice,
    direction: Direction,
) -> (&'a dyn P2pDevice, &'a dyn P2pDevice) {
    match direction {
        Direction::Egress => (trans, recv),
        Direction::Ingress => (recv, trans),
    }
}

fn bar(device: &dyn P2pDevice, bars: &BarTable, index: usize) -> P2pResult<u64> {
    bars.get(index).ok_or_else(|| P2pError::MissingBar {
        device: device.name().to_string(),
        index,
    })
}

fn resolve_pair(
    channel: usize,
    direction: Direction,
    (tx_dev, tx_bars, tx_node): (&dyn P2pDevice, &BarTable, NodeId),
    (rx_dev, rx_bars, rx_node): (&dyn P2pDevice, &BarTable, NodeId),
    config: &ChainConfig,
) -> P2pResult<QueuePair> {
    let tx_tree = tx_dev.tree();
    let rx_tree = rx_dev.tree();

    let trans_reg = tx_tree.reg_spec(tx_node)?;
    let recv_reg = rx_tree.reg_spec(rx_node)?;
    // Fail now rather than mid-start if a window exceeds its bus.
    Component::from_reg(tx_dev.bus(), trans_reg)?;
    Component::from_reg(rx_dev.bus(), recv_reg)?;

    let tx_bar0 = bar(tx_dev, tx_bars, MI_BAR)?;
    let rx_bar0 = bar(rx_dev, rx_bars, MI_BAR)?;
    let rx_bar2 = bar(rx_dev, rx_bars, BUFFER_BAR)?;

    let data_node = rx_tree.phandle_property(rx_node, "data_buff")?;
    let hdr_node = rx_tree.phandle_property(rx_node, "hdr_buff")?;
    let data_off = rx_tree.reg_spec(data_node)?.offset;
    let hdr_off = rx_tree.reg_spec(hdr_node)?.offset;

    let block_size = match rx_tree.property(rx_node, "block-size").map(Property::as_u32) {
        None => config.block_size,
        Some(Some(size)) if size > 0 => size,
        Some(_) => {
            return Err(P2pError::DeviceTree(format!(
                "node {} has an invalid block-size property",
                rx_tree.node_name(rx_node)
            )))
        }
    };

    Ok(QueuePair {
        channel,
        direction,
        trans_node: tx_node,
        recv_node: rx_node,
        trans_reg,
        recv_reg,
        trans_sdp_addr: tx_bar0 + trans_reg.offset + REG_SDP,
        recv_sdp_addr: rx_bar0 + recv_reg.offset + REG_SDP,
        data_buff_addr: rx_bar2 + data_off,
        hdr_buff_addr: rx_bar2 + hdr_off,
        block_size,
        state: ChannelState::Configured,
    })
}

fn start_channel(
    ctrl: &Component<'_>,
    poll: &PollConfig,
    pair: &QueuePair,
    side: Side,
) -> P2pResult<()> {
    ctrl.set_bit(REG_CONTROL, CONTROL_START_BIT)?;
    if ctrl.wait_for_bit(REG_STATUS, STATUS_RUNNING_BIT, true, poll)? {
        Ok(())
    } else {
        log::warn!(
            "{} channel {}: {} at {:#x} never set RUNNING in {}",
            pair.direction,
            pair.channel,
            side,
            ctrl.base(),
            reg_name(REG_STATUS)
        );
        Err(P2pError::ChannelStartTimeout {
            channel: pair.channel,
            direction: pair.direction,
            side,
        })
    }
}

fn start_pair(
    (tx_dev, rx_dev): (&dyn P2pDevice, &dyn P2pDevice),
    config: &ChainConfig,
    pair: &QueuePair,
) -> P2pResult<()> {
    let tx = Component::from_reg(tx_dev.bus(), pair.trans_reg)?;
    let rx = Component::from_reg(rx_dev.bus(), pair.recv_reg)?;

    // Receiver first, so it is running before the transmitter pushes data.
    log::info!(
        "{} channel {}: RX update address {:#x} -> {} {}",
        pair.direction,
        pair.channel,
        pair.trans_sdp_addr,
        rx_dev.name(),
        rx_dev.tree().node_name(pair.recv_node)
    );
    rx.write_u64(REG_UPDATE_BASE, pair.trans_sdp_addr)?;
    rx.set_bit(REG_EXPER, EXPER_P2P_BIT)?;
    rx.write_u32(REG_TIMEOUT, config.update_timeout)?;
    rx.write_u64(REG_SDP, 0)?;
    start_channel(&rx, &config.poll, pair, Side::Receiver)?;

    log::info!(
        "{} channel {}: TX update {:#x}, data {:#x}, header {:#x} -> {} {}",
        pair.direction,
        pair.channel,
        pair.recv_sdp_addr,
        pair.data_buff_addr,
        pair.hdr_buff_addr,
        tx_dev.name(),
        tx_dev.tree().node_name(pair.trans_node)
    );
    tx.write_u64(REG_UPDATE_BASE, pair.recv_sdp_addr)?;
    tx.write_u64(REG_DESC_BASE, pair.data_buff_addr)?;
    tx.write_u64(REG_HDR_BASE, pair.hdr_buff_addr)?;

    let mhp = rx.read_u16(REG_MHP)?;
    let mdp = rx.read_u16(REG_MDP)?;
    tx.write_u16(REG_MHP, mhp)?;
    // The receiver's MDP counts bytes, the transmitter's counts blocks.
    tx.write_u16(REG_MDP, (u32::from(mdp) / pair.block_size) as u16)?;

    tx.set_bit(REG_EXPER, EXPER_P2P_BIT)?;
    tx.write_u32(REG_TIMEOUT, config.update_timeout)?;
    tx.write_u64(REG_SDP, 0)?;
    start_channel(&tx, &config.poll, pair, Side::Transmitter)
}

/// Wait for one side to report stopped after its start bit was cleared,
/// then leave peer-to-peer mode.
fn finish_stop(
    ctrl: &Component<'_>,
    cleared: P2pResult<()>,
    poll: &PollConfig,
    pair: &QueuePair,
    side: Side,
) -> bool {
    let waited =
        cleared.and_then(|()| ctrl.wait_for_bit(REG_STATUS, STATUS_RUNNING_BIT, false, poll));
    match waited {
        Ok(true) => {
            if let Err(err) = ctrl.clear_bit(REG_EXPER, EXPER_P2P_BIT) {
                log::warn!(
                    "{} channel {}: {} left in P2P mode: {}",
                    pair.direction,
                    pair.channel,
                    side,
                    err
                );
            }
            true
        }
        Ok(false) => {
            log::warn!(
                "{} channel {}: {} at {:#x} did not stop, RUNNING still set in {}",
                pair.direction,
                pair.channel,
                side,
                ctrl.base(),
                reg_name(REG_STATUS)
            );
            false
        }
        Err(err) => {
            log::warn!(
                "{} channel {}: failed to stop {}: {}",
                pair.direction,
                pair.channel,
                side,
                err
            );
            false
        }
    }
}

fn stop_pair(
    (tx_dev, rx_dev): (&dyn P2pDevice, &dyn P2pDevice),
    config: &ChainConfig,
    pair: &mut QueuePair,
) -> ChannelStopStatus {
    pair.state = ChannelState::Stopping;
    let mut status = ChannelStopStatus {
        channel: pair.channel,
        direction: pair.direction,
        transmitter_stopped: false,
        receiver_stopped: false,
    };

    let windows = (
        Component::from_reg(tx_dev.bus(), pair.trans_reg),
        Component::from_reg(rx_dev.bus(), pair.recv_reg),
    );
    let (tx, rx) = match windows {
        (Ok(tx), Ok(rx)) => (tx, rx),
        (Err(err), _) | (_, Err(err)) => {
            log::warn!(
                "{} channel {}: cannot reach controllers: {}",
                pair.direction,
                pair.channel,
                err
            );
            pair.state = ChannelState::Stopped;
            return status;
        }
    };

    // Transmitter first so nothing is pushed at a receiver that is going away.
    let tx_cleared = tx.clear_bit(REG_CONTROL, CONTROL_START_BIT);
    let rx_cleared = rx.clear_bit(REG_CONTROL, CONTROL_START_BIT);

    status.receiver_stopped = finish_stop(&rx, rx_cleared, &config.poll, pair, Side::Receiver);
    status.transmitter_stopped =
        finish_stop(&tx, tx_cleared, &config.poll, pair, Side::Transmitter);

    pair.state = ChannelState::Stopped;
    status
}
