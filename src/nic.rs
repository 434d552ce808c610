// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Black-box NIC device boundary.
//!
//! The pipeline treats the poll-mode driver as an opaque provider of burst
//! RX/TX primitives. [`RingDevice`] is the bundled loopback implementation:
//! bounded queues stand in for the hardware descriptor rings, with an
//! inject side-door for test traffic and soak runs.

use crate::packet::{Packet, PacketPool};
use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Burst-mode ethernet device, one per port.
pub trait NetDevice: Send + Sync {
    fn port_id(&self) -> u16;

    /// NUMA socket the device is attached to.
    fn socket_id(&self) -> u32;

    fn mac_addr(&self) -> [u8; 6];

    fn start(&self) -> anyhow::Result<()>;

    fn stop(&self);

    /// Receive up to `max` packets into `out`. Returns the number received.
    fn rx_burst(&self, queue_id: u16, out: &mut Vec<Packet>, max: usize) -> usize;

    /// Transmit packets from the front of `pkts`, draining the ones sent.
    /// May be partial when the TX queue is full.
    fn tx_burst(&self, queue_id: u16, pkts: &mut Vec<Packet>) -> usize;

    /// Packet buffer pool backing this device's RX path.
    fn packet_pool(&self) -> &Arc<PacketPool>;
}

/// Queue-backed loopback device.
pub struct RingDevice {
    port_id: u16,
    socket_id: u32,
    mac: [u8; 6],
    rx_queue: ArrayQueue<Packet>,
    tx_queue: ArrayQueue<Packet>,
    started: AtomicBool,
    pool: Arc<PacketPool>,
}

impl RingDevice {
    pub fn new(
        port_id: u16,
        socket_id: u32,
        mac: [u8; 6],
        pool: Arc<PacketPool>,
        rx_capacity: usize,
        tx_capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            port_id,
            socket_id,
            mac,
            rx_queue: ArrayQueue::new(rx_capacity),
            tx_queue: ArrayQueue::new(tx_capacity),
            started: AtomicBool::new(false),
            pool,
        })
    }

    /// Queue a raw frame for reception. Returns false when the RX queue or
    /// the packet pool is exhausted (the frame is lost, as on real wire).
    pub fn inject(&self, frame: &[u8]) -> bool {
        match self.pool.alloc_from(frame) {
            Some(pkt) => self.rx_queue.push(pkt).is_ok(),
            None => false,
        }
    }

    /// Take one transmitted packet, if any (test-side observation point).
    pub fn transmitted(&self) -> Option<Packet> {
        self.tx_queue.pop()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

impl NetDevice for RingDevice {
    fn port_id(&self) -> u16 {
        self.port_id
    }

    fn socket_id(&self) -> u32 {
        self.socket_id
    }

    fn mac_addr(&self) -> [u8; 6] {
        self.mac
    }

    fn start(&self) -> anyhow::Result<()> {
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&self) {
        self.started.store(false, Ordering::Release);
    }

    fn rx_burst(&self, _queue_id: u16, out: &mut Vec<Packet>, max: usize) -> usize {
        if !self.started.load(Ordering::Acquire) {
            return 0;
        }
        let mut received = 0;
        while received < max {
            match self.rx_queue.pop() {
                Some(pkt) => {
                    out.push(pkt);
                    received += 1;
                }
                None => break,
            }
        }
        received
    }

    fn tx_burst(&self, _queue_id: u16, pkts: &mut Vec<Packet>) -> usize {
        let mut sent = 0;
        while !pkts.is_empty() {
            let pkt = pkts.remove(0);
            match self.tx_queue.push(pkt) {
                Ok(()) => sent += 1,
                Err(pkt) => {
                    pkts.insert(0, pkt);
                    break;
                }
            }
        }
        sent
    }

    fn packet_pool(&self) -> &Arc<PacketPool> {
        &self.pool
    }
}
