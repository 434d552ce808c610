// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Shared fixtures for the integration suite: wire-frame builders, a
//! pipeline harness over the loopback device, and polling helpers.
#![allow(dead_code)] // not every test binary uses every fixture

use framepipe::config::{PipelineConfig, WorkerCoreConfig};
use framepipe::decoder::{BitDepth, GridDecoder, GridGeometry, ProtocolDecoder};
use framepipe::frame::{FrameCallback, SharedBufferFrame};
use framepipe::logging::null_logger;
use framepipe::runtime::RuntimeOptions;
use framepipe::{CoreManager, PacketPool, RingDevice};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const DEVICE_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 5, 1);
pub const DEVICE_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0xaa, 0xbb, 0xcc];
pub const PEER_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x11, 0x22, 0x33];
pub const PEER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 5, 2);
pub const DATA_PORT: u16 = 61649;

/// Production-scale geometry: 1000 frames per super-frame, 4 packets of
/// 4 KiB per frame (128x128 8-bit images).
pub fn large_geometry() -> GridGeometry {
    GridGeometry {
        x_resolution: 128,
        y_resolution: 128,
        bit_depth: BitDepth::Depth8,
        frames_per_super_frame: 1000,
        packets_per_sub_frame: 4,
        payload_size: 4096,
    }
}

/// Small geometry for fast tests: 4 frames per super-frame, 4 packets of
/// 1 KiB per frame (64x64 8-bit images).
pub fn small_geometry() -> GridGeometry {
    GridGeometry {
        x_resolution: 64,
        y_resolution: 64,
        bit_depth: BitDepth::Depth8,
        frames_per_super_frame: 4,
        packets_per_sub_frame: 4,
        payload_size: 1024,
    }
}

fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += word as u32;
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !sum as u16
}

/// Ethernet/IPv4/UDP detector packet carrying a grid protocol header.
pub fn detector_packet(
    frame_number: u64,
    packet_number: u32,
    payload_size: usize,
    fill: u8,
) -> Vec<u8> {
    let header = GridDecoder::encode_packet_header(frame_number, packet_number);
    let udp_payload_len = header.len() + payload_size;

    let mut frame = Vec::with_capacity(42 + udp_payload_len);
    frame.extend_from_slice(&DEVICE_MAC);
    frame.extend_from_slice(&PEER_MAC);
    frame.extend_from_slice(&0x0800u16.to_be_bytes());

    let total_len = (20 + 8 + udp_payload_len) as u16;
    let ip_start = frame.len();
    frame.push(0x45);
    frame.push(0x00);
    frame.extend_from_slice(&total_len.to_be_bytes());
    frame.extend_from_slice(&[0, 1, 0, 0]);
    frame.push(64);
    frame.push(17);
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&PEER_IP.octets());
    frame.extend_from_slice(&DEVICE_IP.octets());
    let ip_cksum = internet_checksum(&frame[ip_start..ip_start + 20]);
    frame[ip_start + 10..ip_start + 12].copy_from_slice(&ip_cksum.to_be_bytes());

    frame.extend_from_slice(&9000u16.to_be_bytes());
    frame.extend_from_slice(&DATA_PORT.to_be_bytes());
    frame.extend_from_slice(&((8 + udp_payload_len) as u16).to_be_bytes());
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&header);
    frame.extend(std::iter::repeat(fill).take(payload_size));
    frame
}

/// ARP request for `target_ip`, broadcast from the peer.
pub fn arp_request(target_ip: Ipv4Addr) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&[0xff; 6]);
    frame.extend_from_slice(&PEER_MAC);
    frame.extend_from_slice(&0x0806u16.to_be_bytes());
    frame.extend_from_slice(&1u16.to_be_bytes());
    frame.extend_from_slice(&0x0800u16.to_be_bytes());
    frame.push(6);
    frame.push(4);
    frame.extend_from_slice(&1u16.to_be_bytes());
    frame.extend_from_slice(&PEER_MAC);
    frame.extend_from_slice(&PEER_IP.octets());
    frame.extend_from_slice(&[0u8; 6]);
    frame.extend_from_slice(&target_ip.octets());
    frame
}

/// ICMP echo request to the device with the given payload.
pub fn icmp_echo_request(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&DEVICE_MAC);
    frame.extend_from_slice(&PEER_MAC);
    frame.extend_from_slice(&0x0800u16.to_be_bytes());

    let total_len = (20 + 8 + payload.len()) as u16;
    let ip_start = frame.len();
    frame.push(0x45);
    frame.push(0x00);
    frame.extend_from_slice(&total_len.to_be_bytes());
    frame.extend_from_slice(&[0, 2, 0, 0]);
    frame.push(64);
    frame.push(1);
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&PEER_IP.octets());
    frame.extend_from_slice(&DEVICE_IP.octets());
    let ip_cksum = internet_checksum(&frame[ip_start..ip_start + 20]);
    frame[ip_start + 10..ip_start + 12].copy_from_slice(&ip_cksum.to_be_bytes());

    let icmp_start = frame.len();
    frame.push(8);
    frame.push(0);
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&[0x42, 0x99]); // identifier
    frame.extend_from_slice(&[0x00, 0x07]); // sequence
    frame.extend_from_slice(payload);
    let icmp_cksum = internet_checksum(&frame[icmp_start..]);
    frame[icmp_start + 2..icmp_start + 4].copy_from_slice(&icmp_cksum.to_be_bytes());
    frame
}

/// Frames captured by the harness callback, retained until the test drops
/// them (slot reclamation is observable through the clear-frames ring).
pub type CapturedFrames = Arc<Mutex<Vec<SharedBufferFrame>>>;

pub struct PipelineHarness {
    pub manager: CoreManager,
    pub device: Arc<RingDevice>,
    pub decoder: Arc<GridDecoder>,
    pub captured: CapturedFrames,
}

/// Options for building a pipeline harness.
pub struct HarnessOptions {
    pub geometry: GridGeometry,
    pub num_processors: usize,
    pub num_builders: usize,
    pub with_compressor: bool,
    pub compress_shuffle: u32,
    pub frame_timeout_ms: u64,
    pub num_slots: usize,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            geometry: small_geometry(),
            num_processors: 1,
            num_builders: 1,
            with_compressor: false,
            compress_shuffle: 0,
            frame_timeout_ms: 1000,
            num_slots: 8,
        }
    }
}

pub fn build_pipeline(opts: HarnessOptions) -> PipelineHarness {
    let decoder = Arc::new(GridDecoder::new(opts.geometry.clone()).expect("valid geometry"));

    let mut config = PipelineConfig {
        shared_buffer_size: decoder.super_frame_buffer_size() * opts.num_slots,
        enable_compression: opts.with_compressor,
        runtime: RuntimeOptions {
            corelist: Some("0-12".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };

    config.worker_cores.insert(
        "packet_rx".to_string(),
        WorkerCoreConfig {
            core_name: "packet_rx".to_string(),
            num_cores: 1,
            device_ip: Some(DEVICE_IP),
            rx_ports: vec![DATA_PORT],
            rx_burst_size: 64,
            ..Default::default()
        },
    );
    config.worker_cores.insert(
        "packet_processor".to_string(),
        WorkerCoreConfig {
            core_name: "packet_processor".to_string(),
            connect: Some("packet_rx".to_string()),
            num_cores: opts.num_processors,
            frame_timeout: opts.frame_timeout_ms,
            ..Default::default()
        },
    );
    config.worker_cores.insert(
        "frame_builder".to_string(),
        WorkerCoreConfig {
            core_name: "frame_builder".to_string(),
            connect: Some("packet_processor".to_string()),
            num_cores: opts.num_builders,
            ..Default::default()
        },
    );
    let wrapper_upstream = if opts.with_compressor {
        config.worker_cores.insert(
            "frame_compressor".to_string(),
            WorkerCoreConfig {
                core_name: "frame_compressor".to_string(),
                connect: Some("frame_builder".to_string()),
                num_cores: 1,
                compress_shuffle: opts.compress_shuffle,
                ..Default::default()
            },
        );
        "frame_compressor"
    } else {
        "frame_builder"
    };
    config.worker_cores.insert(
        "frame_wrapper".to_string(),
        WorkerCoreConfig {
            core_name: "frame_wrapper".to_string(),
            connect: Some(wrapper_upstream.to_string()),
            num_cores: 1,
            dataset_name: Some("data".to_string()),
            ..Default::default()
        },
    );

    let pool = PacketPool::new("mbuf_pool_00", 1024, 9600);
    let device = RingDevice::new(0, 0, DEVICE_MAC, pool, 4096, 256);

    let captured: CapturedFrames = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&captured);
    let callback: FrameCallback = Arc::new(move |frame| {
        sink.lock().unwrap().push(frame);
    });

    let manager = CoreManager::new(
        "fp",
        config,
        vec![device.clone() as Arc<dyn framepipe::NetDevice>],
        decoder.clone() as Arc<dyn ProtocolDecoder>,
        callback,
        null_logger(),
    )
    .expect("manager construction");

    PipelineHarness {
        manager,
        device,
        decoder,
        captured,
    }
}

impl PipelineHarness {
    /// Inject a wire frame, retrying while the RX queue or pool is full.
    pub fn inject(&self, frame: &[u8]) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !self.device.inject(frame) {
            assert!(Instant::now() < deadline, "injection stalled");
            std::thread::sleep(Duration::from_micros(50));
        }
    }

    /// Inject every packet of super-frames `first..first + count`.
    pub fn inject_super_frames(&self, first: u64, count: u64, fill: u8) {
        let geometry = self.geometry();
        let frames_per_super = geometry.frames_per_super_frame as u64;
        for super_frame in first..first + count {
            for sub in 0..frames_per_super {
                let frame_number = super_frame * frames_per_super + sub;
                for packet in 0..geometry.packets_per_sub_frame as u32 {
                    let wire = detector_packet(
                        frame_number,
                        packet,
                        geometry.payload_size,
                        fill,
                    );
                    self.inject(&wire);
                }
            }
        }
    }

    pub fn geometry(&self) -> GridGeometry {
        GridGeometry {
            x_resolution: self.decoder.x_resolution(),
            y_resolution: self.decoder.y_resolution(),
            bit_depth: self.decoder.bit_depth(),
            frames_per_super_frame: self.decoder.frames_per_super_frame(),
            packets_per_sub_frame: self.decoder.packets_per_sub_frame(),
            payload_size: self.decoder.payload_size(),
        }
    }

    pub fn captured_count(&self) -> usize {
        self.captured.lock().unwrap().len()
    }

    /// Wait until `count` frames have reached the callback.
    pub fn wait_for_frames(&self, count: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.captured_count() >= count)
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Poll the status surface until `path` reports `expected`. Counters are
/// incremented just after the corresponding ring handoff, so a freshly
/// delivered frame can race a direct read.
pub fn wait_for_counter(manager: &CoreManager, path: &str, expected: u64) -> bool {
    wait_until(Duration::from_secs(5), || {
        manager.status().get_u64(path) == Some(expected)
    })
}
