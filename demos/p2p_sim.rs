// NFB Peer-to-Peer DMA Tooling
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Peer-to-peer chain on two simulated cards.
//!
//! Run with: `cargo run --example p2p_sim`

use nfb_p2p::{
    ChainConfig, Direction, P2pChain, P2pError, PollConfig, SimCard, SimDevice, StatusBehavior,
};
use std::time::Duration;

fn main() {
    println!("NFB P2P Simulation Example");
    println!("==========================\n");

    // The chain reads BAR tables from sysfs; give it a private one.
    let sysfs = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(e) => {
            println!("  Failed to create sysfs directory: {}", e);
            return;
        }
    };

    let card0 = SimCard::new("card0", "0000:03:00.0")
        .with_bars(&[0xF000_0000, 0, 0xE000_0000])
        .build();
    let card1 = SimCard::new("card1", "0000:04:00.0")
        .with_bars(&[0xD000_0000, 0, 0xC000_0000])
        .with_channels(4, 2)
        .build();

    for card in [&card0, &card1] {
        if let Err(e) = card.write_sysfs(sysfs.path()) {
            println!("  Failed to write resource table: {}", e);
            return;
        }
    }

    let config = ChainConfig::default()
        .with_sysfs_root(sysfs.path())
        .with_poll(PollConfig::new(100, Duration::from_micros(1)));

    println!("Building full-duplex chain card0 <-> card1 with 4 channels...");
    let mut chain = match P2pChain::build(&card0, &card1, 4, true, config) {
        Ok(chain) => chain,
        Err(e) => {
            println!("  Failed to build chain: {}", e);
            return;
        }
    };
    println!("  Channels after clamping: {}", chain.channel_count());
    println!("  Receiver block size: {}", chain.config().block_size);
    println!("  card0 BARs: {:?}", chain.trans_bars());
    println!("  card1 BARs: {:?}", chain.recv_bars());
    for pair in chain.pairs() {
        println!(
            "    {} {}: update {:#x}/{:#x}, data {:#x}, header {:#x}",
            pair.direction,
            pair.channel,
            pair.trans_sdp_addr,
            pair.recv_sdp_addr,
            pair.data_buff_addr,
            pair.hdr_buff_addr
        );
    }
    println!();

    println!("Starting channels...");
    match chain.start() {
        Ok(()) => println!("  All channels running"),
        Err(e) => {
            println!("  Start failed: {}", e);
            return;
        }
    }
    match chain.start() {
        Err(P2pError::AlreadyStarted { channel, direction }) => {
            println!("  Second start rejected ({} channel {})", direction, channel)
        }
        other => println!("  Unexpected second start result: {:?}", other),
    }
    println!();

    // card1's receiver of channel 1 refuses to stop.
    card1.set_status_behavior(SimDevice::tx_ctrl(1), StatusBehavior::StuckHigh);

    println!("Stopping channels...");
    let report = chain.stop();
    for status in report.channels() {
        println!(
            "  {} {}: transmitter {}, receiver {}",
            status.direction,
            status.channel,
            if status.transmitter_stopped { "stopped" } else { "STUCK" },
            if status.receiver_stopped { "stopped" } else { "STUCK" }
        );
    }
    println!("  All stopped: {}", report.all_stopped());
    if let Err(e) = report.into_result() {
        println!("  {}", e);
    }
    println!(
        "  Egress channel 0 state: {:?}",
        chain.state(0, Direction::Egress)
    );
    println!();

    println!("Done!");
}
