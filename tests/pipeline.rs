// SPDX-License-Identifier: Apache-2.0 OR MIT
//! End-to-end pipeline scenarios over the loopback device: in-order
//! capture, missing-packet timeout, slot exhaustion, control-plane
//! replies, rebase reset, compression and slot conservation.

mod common;

use common::*;
use framepipe::config::ConfigUpdate;
use framepipe::decoder::ProtocolDecoder;
use framepipe::frame::CompressionType;
use framepipe::ring::clear_frames_ring_name;
use framepipe::worker::byte_unshuffle;
use std::time::Duration;

#[test]
fn s1_in_order_super_frames_complete() {
    let mut harness = build_pipeline(HarnessOptions {
        geometry: large_geometry(),
        num_builders: 2,
        ..Default::default()
    });
    harness.manager.start().expect("pipeline start");

    // Frames 0..1999, packets 0..3 each: two complete super-frames.
    harness.inject_super_frames(0, 2, 0xab);

    assert!(
        harness.wait_for_frames(2, Duration::from_secs(20)),
        "both super-frames should reach the callback"
    );

    assert!(
        wait_for_counter(&harness.manager, "fp/packet_rx_0/total_packets", 8000),
        "every injected UDP packet should be counted"
    );
    assert!(wait_for_counter(
        &harness.manager,
        "fp/packet_processor_0/frames_complete_total",
        2
    ));

    let report = harness.manager.status();
    assert_eq!(
        report.get_u64("fp/packet_processor_0/frames_incomplete"),
        Some(0)
    );
    assert_eq!(
        report.get_u64("fp/packet_processor_0/dropped_frames"),
        Some(0)
    );
    assert_eq!(
        report.get_u64("fp/packet_processor_0/dropped_packets"),
        Some(0)
    );

    // Mod-routing: super-frame 0 built by consumer 0, super-frame 1 by
    // consumer 1.
    assert!(wait_for_counter(
        &harness.manager,
        "fp/frame_builder_0/frames_built",
        1
    ));
    assert!(wait_for_counter(
        &harness.manager,
        "fp/frame_builder_1/frames_built",
        1
    ));

    {
        let frames = harness.captured.lock().unwrap();
        let mut numbers: Vec<u64> = frames.iter().map(|f| f.frame_number()).collect();
        numbers.sort_unstable();
        assert_eq!(numbers, vec![0, 1]);

        let uncompressed = harness.decoder.super_frame_data_size() as u64;
        for frame in frames.iter() {
            assert_eq!(frame.meta().compression, CompressionType::None);
            assert_eq!(frame.image_size(), uncompressed);
            assert_eq!(
                harness.decoder.sub_frames_received(frame.raw()),
                harness.decoder.frames_per_super_frame() as u32
            );
            assert!(frame.data().iter().all(|&b| b == 0xab));
        }
    }
    harness.captured.lock().unwrap().clear();
    harness.manager.stop();
}

#[test]
fn s2_missing_packet_times_out_and_zeroes_payload() {
    let mut harness = build_pipeline(HarnessOptions {
        geometry: large_geometry(),
        frame_timeout_ms: 1000,
        ..Default::default()
    });
    harness.manager.start().expect("pipeline start");

    let geometry = harness.geometry();
    let frames_per_super = geometry.frames_per_super_frame as u64;
    for super_frame in 0..2u64 {
        for sub in 0..frames_per_super {
            let frame_number = super_frame * frames_per_super + sub;
            for packet in 0..geometry.packets_per_sub_frame as u32 {
                if frame_number == 1500 && packet == 2 {
                    continue;
                }
                let wire =
                    detector_packet(frame_number, packet, geometry.payload_size, 0xab);
                harness.inject(&wire);
            }
        }
    }

    // Super-frame 0 completes normally; super-frame 1 arrives only after
    // the timeout sweep evicts it.
    assert!(
        harness.wait_for_frames(2, Duration::from_secs(20)),
        "incomplete super-frame should still be delivered after timeout"
    );

    assert!(wait_for_counter(
        &harness.manager,
        "fp/packet_processor_0/frames_incomplete",
        1
    ));

    {
        let frames = harness.captured.lock().unwrap();
        let incomplete = frames
            .iter()
            .find(|f| f.frame_number() == 1)
            .expect("super-frame 1 delivered");
        assert_eq!(
            harness.decoder.sub_frames_received(incomplete.raw()),
            (frames_per_super - 1) as u32
        );

        // Frame 1500 packet 2 lands at sub-frame 500 of this super-frame;
        // its payload region must be zeroed, the neighbours untouched.
        let sub_data = geometry.packets_per_sub_frame * geometry.payload_size;
        let missing = 500 * sub_data + 2 * geometry.payload_size;
        let data = incomplete.data();
        assert!(
            data[missing..missing + geometry.payload_size]
                .iter()
                .all(|&b| b == 0),
            "missing packet payload must be zeroed"
        );
        assert!(data[missing - 1] == 0xab && data[missing + geometry.payload_size] == 0xab);
    }
    harness.captured.lock().unwrap().clear();
    harness.manager.stop();
}

#[test]
fn s3_slot_exhaustion_drops_frame_and_recovers() {
    let mut harness = build_pipeline(HarnessOptions {
        num_slots: 2,
        frame_timeout_ms: 300,
        ..Default::default()
    });
    harness.manager.start().expect("pipeline start");

    // One slot is the builder's reorder spare, leaving one for assembly.
    harness.inject_super_frames(0, 1, 1);
    assert!(harness.wait_for_frames(1, Duration::from_secs(10)));

    // The callback retains the frame, so the free list is now empty; the
    // next super-frame diverts to scratch and is never delivered.
    harness.inject_super_frames(1, 1, 2);
    assert!(
        wait_until(Duration::from_secs(10), || {
            harness
                .manager
                .status()
                .get_u64("fp/packet_processor_0/dropped_frames")
                == Some(1)
        }),
        "out-of-slots super-frame should be counted as dropped"
    );
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(harness.captured_count(), 1, "dropped frame never delivered");

    // Releasing the held frame returns its slot; the pipeline is live for
    // the next super-frame.
    harness.captured.lock().unwrap().clear();
    harness.inject_super_frames(2, 1, 3);
    assert!(
        harness.wait_for_frames(1, Duration::from_secs(10)),
        "pipeline should recover once a slot returns"
    );
    assert_eq!(
        harness.captured.lock().unwrap()[0].frame_number(),
        2,
        "recovered super-frame keeps its number"
    );

    harness.captured.lock().unwrap().clear();
    harness.manager.stop();
}

#[test]
fn s4_arp_request_for_device_ip_gets_one_reply() {
    let mut harness = build_pipeline(HarnessOptions::default());
    harness.manager.start().expect("pipeline start");

    harness.inject(&arp_request(DEVICE_IP));

    let mut reply = None;
    assert!(wait_until(Duration::from_secs(5), || {
        reply = harness.device.transmitted();
        reply.is_some()
    }));
    let reply = reply.unwrap();

    assert_eq!(&reply[0..6], &PEER_MAC, "reply addressed to requester");
    assert_eq!(&reply[6..12], &DEVICE_MAC, "reply from device MAC");
    assert_eq!(u16::from_be_bytes([reply[20], reply[21]]), 2, "ARP reply opcode");
    assert_eq!(&reply[22..28], &DEVICE_MAC, "sender hardware address");
    assert_eq!(&reply[28..32], &DEVICE_IP.octets(), "sender protocol address");
    assert_eq!(&reply[32..38], &PEER_MAC, "target hardware address");
    assert_eq!(&reply[38..42], &PEER_IP.octets(), "target protocol address");
    drop(reply);

    // A request for some other address is ignored.
    harness.inject(&arp_request("10.0.5.200".parse().unwrap()));
    std::thread::sleep(Duration::from_millis(200));
    assert!(harness.device.transmitted().is_none(), "exactly one reply");

    harness.manager.stop();
}

#[test]
fn s5_icmp_echo_reply_is_bit_exact() {
    let mut harness = build_pipeline(HarnessOptions::default());
    harness.manager.start().expect("pipeline start");

    let payload: Vec<u8> = (0..64u8).collect();
    harness.inject(&icmp_echo_request(&payload));

    let mut reply = None;
    assert!(wait_until(Duration::from_secs(5), || {
        reply = harness.device.transmitted();
        reply.is_some()
    }));
    let reply = reply.unwrap();

    // MAC and IP swapped back toward the peer.
    assert_eq!(&reply[0..6], &PEER_MAC);
    assert_eq!(&reply[6..12], &DEVICE_MAC);
    assert_eq!(&reply[26..30], &DEVICE_IP.octets());
    assert_eq!(&reply[30..34], &PEER_IP.octets());

    // Echo reply with identical payload and a checksum that verifies.
    let icmp = 34;
    assert_eq!(reply[icmp], 0, "echo reply type");
    assert_eq!(&reply[icmp + 8..], &payload[..], "payload bit-identical");
    assert_eq!(
        framepipe::net::internet_checksum(&reply[icmp..]),
        0,
        "ICMP checksum verifies"
    );
    drop(reply);

    std::thread::sleep(Duration::from_millis(200));
    assert!(harness.device.transmitted().is_none(), "exactly one reply");

    harness.manager.stop();
}

#[test]
fn s6_proc_enable_reanchors_numbering() {
    let mut harness = build_pipeline(HarnessOptions::default());
    harness.manager.start().expect("pipeline start");

    let geometry = harness.geometry();
    let frames_per_super = geometry.frames_per_super_frame as u64;

    // First run anchors at raw frame 5000: the observed super-frame is 0.
    for sub in 0..frames_per_super {
        for packet in 0..geometry.packets_per_sub_frame as u32 {
            harness.inject(&detector_packet(5000 + sub, packet, geometry.payload_size, 1));
        }
    }
    assert!(harness.wait_for_frames(1, Duration::from_secs(10)));
    assert_eq!(harness.captured.lock().unwrap()[0].frame_number(), 0);

    // Re-anchor, then feed a stream from a completely different raw base;
    // the latch resets so numbering starts at 0 again.
    harness.manager.apply_update(&ConfigUpdate { proc_enable: true });
    std::thread::sleep(Duration::from_millis(50));

    for sub in 0..frames_per_super {
        for packet in 0..geometry.packets_per_sub_frame as u32 {
            harness.inject(&detector_packet(9000 + sub, packet, geometry.payload_size, 2));
        }
    }
    assert!(harness.wait_for_frames(2, Duration::from_secs(10)));
    assert_eq!(
        harness.captured.lock().unwrap()[1].frame_number(),
        0,
        "re-anchored stream restarts at super-frame 0"
    );

    harness.captured.lock().unwrap().clear();
    harness.manager.stop();
}

#[test]
fn compressor_shuffled_payload_roundtrips() {
    let mut harness = build_pipeline(HarnessOptions {
        with_compressor: true,
        compress_shuffle: 1,
        ..Default::default()
    });
    harness.manager.start().expect("pipeline start");

    harness.inject_super_frames(0, 1, 0x5a);
    assert!(harness.wait_for_frames(1, Duration::from_secs(10)));

    let uncompressed = harness.decoder.super_frame_data_size();
    {
        let frames = harness.captured.lock().unwrap();
        let frame = &frames[0];
        assert_eq!(frame.meta().compression, CompressionType::Lz4Block);
        assert!(
            (frame.image_size() as usize) < uncompressed,
            "constant payload must compress"
        );

        let shuffled = lz4_flex::block::decompress(frame.data(), uncompressed)
            .expect("payload decompresses");
        let mut restored = vec![0u8; uncompressed];
        byte_unshuffle(
            &shuffled,
            &mut restored,
            harness.decoder.bit_depth().bytes(),
        );
        assert!(restored.iter().all(|&b| b == 0x5a));
    }

    harness.captured.lock().unwrap().clear();
    harness.manager.stop();
}

#[test]
fn slots_conserved_across_a_full_run() {
    let mut harness = build_pipeline(HarnessOptions::default());
    let num_buffers = harness
        .manager
        .shared_buffer(0)
        .expect("socket 0 buffer")
        .num_buffers();
    harness.manager.start().expect("pipeline start");

    harness.inject_super_frames(0, 3, 7);
    assert!(harness.wait_for_frames(3, Duration::from_secs(10)));

    harness.captured.lock().unwrap().clear();
    harness.manager.stop();

    // With every wrapper frame released and the cores drained, the whole
    // slot population is back on the free list.
    let rings = harness.manager.rings();
    let clear = rings
        .slots
        .lookup(&clear_frames_ring_name(0))
        .expect("clear frames ring");
    assert_eq!(clear.len(), num_buffers);
}
