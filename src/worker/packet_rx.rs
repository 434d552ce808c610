// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Packet RX core.
//!
//! Drives RX on one NIC port: answers ARP and ICMP echo requests for the
//! configured device address inline, fans UDP detector packets out to the
//! packet processors by frame number, and drains the release ring to
//! recycle packet buffers copied downstream.

use crate::decoder::ProtocolDecoder;
use crate::logging::{Facility, Logger};
use crate::net;
use crate::nic::NetDevice;
use crate::packet::Packet;
use crate::ring::{self, Ring};
use crate::status::{StatusReport, StatusSource};
use crate::worker::{CoreRefs, StageSpec, WorkerCore};
use anyhow::{bail, Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct PacketRxStats {
    label: String,
    pub total_packets: AtomicU64,
    pub dropped_packets: AtomicU64,
}

impl StatusSource for PacketRxStats {
    fn status(&self, report: &mut StatusReport, path: &str) {
        let prefix = format!("{}/{}", path, self.label);
        report.set_param(
            format!("{}/total_packets", prefix),
            self.total_packets.load(Ordering::Relaxed),
        );
    }
}

pub struct PacketRxCore {
    proc_idx: usize,
    socket_id: u32,
    stage: Arc<StageSpec>,
    device: Arc<dyn NetDevice>,
    decoder: Arc<dyn ProtocolDecoder>,
    dev_mac: [u8; 6],
    dev_ip: [u8; 4],
    forward_rings: Vec<Ring<Packet>>,
    release_ring: Ring<Packet>,
    run_lcore: Arc<AtomicBool>,
    stats: Arc<PacketRxStats>,
    logger: Logger,
}

impl PacketRxCore {
    pub fn new(proc_idx: usize, socket_id: u32, refs: CoreRefs) -> Result<Self> {
        let stage = refs.stage;
        let config = &stage.config;

        // The runtime implements no IP stack, so the address used to answer
        // ARP requests must come from configuration.
        let device_ip = config
            .device_ip
            .with_context(|| format!("packet_rx '{}' has no device_ip", stage.stage_name))?;
        let dev_mac = refs.device.mac_addr();

        if config.rx_ports.is_empty() {
            bail!("packet_rx '{}' defines no rx_ports", stage.stage_name);
        }

        refs.logger.info(
            Facility::PacketRx,
            &format!(
                "{} : {} receiving on ports {:?}, device {} ({})",
                stage.stage_name,
                proc_idx,
                config.rx_ports,
                device_ip,
                mac_addr_str(&dev_mac),
            ),
        );

        // One forwarding ring per downstream processor.
        let ring_size = ring::nearest_power_of_two(config.fwd_ring_size);
        let mut forward_rings = Vec::with_capacity(stage.num_downstream_cores);
        for core_idx in 0..stage.num_downstream_cores {
            let name = ring::data_ring_name(&config.core_name, core_idx, socket_id);
            let (fwd_ring, created) = refs
                .rings
                .packets
                .lookup_or_create(&name, ring_size)
                .with_context(|| format!("creating forward ring {}", name))?;
            if created {
                refs.logger.info(
                    Facility::PacketRx,
                    &format!("created packet forward ring {} of size {}", name, ring_size),
                );
            }
            forward_rings.push(fwd_ring);
        }

        let release_name = ring::packet_release_ring_name(socket_id);
        let release_size = ring::nearest_power_of_two(config.release_ring_size);
        let (release_ring, _) = refs
            .rings
            .packets
            .lookup_or_create(&release_name, release_size)
            .with_context(|| format!("creating release ring {}", release_name))?;

        Ok(Self {
            proc_idx,
            socket_id,
            device: refs.device,
            decoder: refs.decoder,
            dev_mac,
            dev_ip: device_ip.octets(),
            forward_rings,
            release_ring,
            run_lcore: Arc::new(AtomicBool::new(true)),
            stats: Arc::new(PacketRxStats {
                label: format!("{}_{}", stage.stage_name, proc_idx),
                total_packets: AtomicU64::new(0),
                dropped_packets: AtomicU64::new(0),
            }),
            logger: refs.logger,
            stage,
        })
    }

    /// Handle one received UDP packet: match the destination port, read the
    /// frame number from the protocol header and enqueue onto the forward
    /// ring for `frame_number mod num_downstream`. Ownership of forwarded
    /// packets passes to the ring; everything else is freed by drop.
    fn handle_udp_packet(&self, pkt: Packet) {
        let Ok(dst_port) = net::udp_dst_port(&pkt) else {
            return;
        };
        if !self.stage.config.rx_ports.contains(&dst_port) {
            return;
        }

        let frame_number = {
            let Ok(payload) = net::udp_payload(&pkt) else {
                return;
            };
            if payload.len() < self.decoder.packet_header_size() {
                return;
            }
            self.decoder.frame_number(payload)
        };

        self.stats.total_packets.fetch_add(1, Ordering::Relaxed);

        let ring_idx = (frame_number % self.forward_rings.len() as u64) as usize;
        let target = &self.forward_rings[ring_idx];

        match target.enqueue(pkt) {
            Ok(()) => {}
            Err(mut returned) => {
                let max_retries = self.stage.config.max_packet_queue_retries;
                let mut retry = 0;
                loop {
                    if retry >= max_retries {
                        self.stats.dropped_packets.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                    retry += 1;
                    std::thread::sleep(Duration::from_micros(1));
                    match target.enqueue(returned) {
                        Ok(()) => break,
                        Err(pkt) => returned = pkt,
                    }
                }
            }
        }
    }

    /// Transmit reply packets with bounded retry; leftovers are freed.
    fn transmit_replies(&self, replies: &mut Vec<Packet>) {
        let tx_queue = self.stage.config.tx_queue_id;
        self.device.tx_burst(tx_queue, replies);

        let mut retry = 0;
        while !replies.is_empty() && retry < self.stage.config.max_packet_tx_retries {
            retry += 1;
            std::thread::sleep(Duration::from_micros(1));
            self.device.tx_burst(tx_queue, replies);
        }
        // Anything still queued after the retries is dropped back to the
        // pool.
        replies.clear();
    }
}

impl WorkerCore for PacketRxCore {
    fn core_name(&self) -> &'static str {
        "packet_rx"
    }

    fn socket_id(&self) -> u32 {
        self.socket_id
    }

    fn connect(&mut self) -> Result<()> {
        self.logger.info(
            Facility::PacketRx,
            &format!(
                "{} : {} has no upstream resources",
                self.stage.stage_name, self.proc_idx
            ),
        );
        Ok(())
    }

    fn run(&mut self, lcore_id: u32) {
        self.logger.info(
            Facility::PacketRx,
            &format!("packet_rx core {} starting on lcore {}", self.proc_idx, lcore_id),
        );

        let burst_size = self.stage.config.rx_burst_size;
        let rx_queue = self.stage.config.rx_queue_id;
        let mut burst: Vec<Packet> = Vec::with_capacity(burst_size);
        let mut replies: Vec<Packet> = Vec::with_capacity(burst_size);

        while self.run_lcore.load(Ordering::Relaxed) {
            self.device.rx_burst(rx_queue, &mut burst, burst_size);

            for mut pkt in burst.drain(..) {
                match net::ether_type(&pkt) {
                    Ok(net::ETHERTYPE_ARP) => {
                        if net::arp_reply_in_place(&mut pkt, &self.dev_mac, &self.dev_ip) {
                            replies.push(pkt);
                        }
                    }
                    Ok(net::ETHERTYPE_IPV4) => match net::ipv4_protocol(&pkt) {
                        Ok(net::IPPROTO_ICMP) => {
                            if net::icmp_echo_reply_in_place(&mut pkt) {
                                replies.push(pkt);
                            }
                        }
                        Ok(net::IPPROTO_UDP) => self.handle_udp_packet(pkt),
                        _ => {}
                    },
                    _ => {}
                }
                // Unhandled packets free on drop.
            }

            if !replies.is_empty() {
                self.transmit_replies(&mut replies);
            }

            // Free packets fed back on the release ring by downstream cores.
            for _ in 0..burst_size {
                if self.release_ring.dequeue().is_none() {
                    break;
                }
            }
        }

        self.logger.info(
            Facility::PacketRx,
            &format!("packet_rx core {} on lcore {} exiting", self.proc_idx, lcore_id),
        );
    }

    fn run_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.run_lcore)
    }

    fn stats(&self) -> Arc<dyn StatusSource> {
        Arc::clone(&self.stats) as Arc<dyn StatusSource>
    }
}

fn mac_addr_str(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}
