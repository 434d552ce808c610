// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Wire-format handling for the RX core.
//!
//! The pipeline carries no general-purpose IP stack: the RX core answers
//! ARP requests and ICMP echo requests for its configured address inline,
//! forwards UDP detector data, and frees everything else. Parsing is
//! slice-based with explicit bounds checks; replies are generated by
//! rewriting the request packet in place, exactly mirroring what the
//! detector-facing hardware expects.
//!
//! Offsets assume Ethernet II framing and a 20-byte IPv4 header; detector
//! electronics do not emit IP options, so packets with a longer header are
//! treated as malformed and freed silently.

use thiserror::Error;

/// Errors from wire-format parsing. On the data path these only ever cause
/// a silent drop; the typed errors exist for tests and diagnostics.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("unsupported IPv4 header (version {version}, ihl {ihl})")]
    UnsupportedIpHeader { version: u8, ihl: u8 },

    #[error("UDP length field {claimed} exceeds packet bounds {available}")]
    BadUdpLength { claimed: usize, available: usize },
}

pub const ETHER_HDR_LEN: usize = 14;
pub const IPV4_HDR_LEN: usize = 20;
pub const UDP_HDR_LEN: usize = 8;
pub const ARP_FRAME_LEN: usize = ETHER_HDR_LEN + 28;
pub const ICMP_HDR_LEN: usize = 8;

/// Offset of the UDP payload in an Ethernet/IPv4/UDP frame.
pub const UDP_PAYLOAD_OFFSET: usize = ETHER_HDR_LEN + IPV4_HDR_LEN + UDP_HDR_LEN;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_UDP: u8 = 17;

pub const ARP_OP_REQUEST: u16 = 1;
pub const ARP_OP_REPLY: u16 = 2;

pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_ECHO_REPLY: u8 = 0;

/// EtherType of a frame.
pub fn ether_type(frame: &[u8]) -> Result<u16, WireError> {
    if frame.len() < ETHER_HDR_LEN {
        return Err(WireError::TooShort {
            expected: ETHER_HDR_LEN,
            actual: frame.len(),
        });
    }
    Ok(u16::from_be_bytes([frame[12], frame[13]]))
}

/// IPv4 protocol number, validating version and header length.
pub fn ipv4_protocol(frame: &[u8]) -> Result<u8, WireError> {
    if frame.len() < ETHER_HDR_LEN + IPV4_HDR_LEN {
        return Err(WireError::TooShort {
            expected: ETHER_HDR_LEN + IPV4_HDR_LEN,
            actual: frame.len(),
        });
    }
    let version = frame[ETHER_HDR_LEN] >> 4;
    let ihl = frame[ETHER_HDR_LEN] & 0x0f;
    if version != 4 || ihl != 5 {
        return Err(WireError::UnsupportedIpHeader { version, ihl });
    }
    Ok(frame[ETHER_HDR_LEN + 9])
}

/// UDP destination port.
pub fn udp_dst_port(frame: &[u8]) -> Result<u16, WireError> {
    let off = ETHER_HDR_LEN + IPV4_HDR_LEN;
    if frame.len() < off + UDP_HDR_LEN {
        return Err(WireError::TooShort {
            expected: off + UDP_HDR_LEN,
            actual: frame.len(),
        });
    }
    Ok(u16::from_be_bytes([frame[off + 2], frame[off + 3]]))
}

/// UDP payload slice, bounded by the UDP length field.
pub fn udp_payload(frame: &[u8]) -> Result<&[u8], WireError> {
    let off = ETHER_HDR_LEN + IPV4_HDR_LEN;
    if frame.len() < UDP_PAYLOAD_OFFSET {
        return Err(WireError::TooShort {
            expected: UDP_PAYLOAD_OFFSET,
            actual: frame.len(),
        });
    }
    let udp_len = u16::from_be_bytes([frame[off + 4], frame[off + 5]]) as usize;
    let payload_len = udp_len.saturating_sub(UDP_HDR_LEN);
    let available = frame.len() - UDP_PAYLOAD_OFFSET;
    if payload_len > available {
        return Err(WireError::BadUdpLength {
            claimed: payload_len,
            available,
        });
    }
    Ok(&frame[UDP_PAYLOAD_OFFSET..UDP_PAYLOAD_OFFSET + payload_len])
}

/// Rewrite an ARP request for `dev_ip` into a reply in place.
///
/// Returns true when the packet became a reply and should be transmitted;
/// false leaves the packet untouched (wrong opcode or target).
pub fn arp_reply_in_place(frame: &mut [u8], dev_mac: &[u8; 6], dev_ip: &[u8; 4]) -> bool {
    if frame.len() < ARP_FRAME_LEN {
        return false;
    }
    let arp = ETHER_HDR_LEN;

    let opcode = u16::from_be_bytes([frame[arp + 6], frame[arp + 7]]);
    if opcode != ARP_OP_REQUEST {
        return false;
    }
    // Target protocol address must match this device.
    if &frame[arp + 24..arp + 28] != dev_ip {
        return false;
    }

    // Opcode becomes reply.
    frame[arp + 6..arp + 8].copy_from_slice(&ARP_OP_REPLY.to_be_bytes());

    // Ethernet: requester becomes destination, device MAC the source.
    let requester_mac: [u8; 6] = frame[6..12].try_into().unwrap();
    frame[0..6].copy_from_slice(&requester_mac);
    frame[6..12].copy_from_slice(dev_mac);

    // ARP payload: sender -> target, device fills the sender fields.
    let sender_hw: [u8; 6] = frame[arp + 8..arp + 14].try_into().unwrap();
    let sender_ip: [u8; 4] = frame[arp + 14..arp + 18].try_into().unwrap();
    frame[arp + 18..arp + 24].copy_from_slice(&sender_hw);
    frame[arp + 24..arp + 28].copy_from_slice(&sender_ip);
    frame[arp + 8..arp + 14].copy_from_slice(dev_mac);
    frame[arp + 14..arp + 18].copy_from_slice(dev_ip);

    true
}

/// Rewrite an ICMP echo request into an echo reply in place.
///
/// Swaps MAC and IP addresses, flips the ICMP type and folds the type
/// change into the existing checksum incrementally (RFC 1624), so the
/// payload is returned bit-identical without a full recompute. The IPv4
/// checksum is unchanged by the address swap.
pub fn icmp_echo_reply_in_place(frame: &mut [u8]) -> bool {
    let icmp = ETHER_HDR_LEN + IPV4_HDR_LEN;
    if frame.len() < icmp + ICMP_HDR_LEN {
        return false;
    }
    let icmp_type = frame[icmp];
    let icmp_code = frame[icmp + 1];
    if icmp_type != ICMP_ECHO_REQUEST || icmp_code != 0 {
        return false;
    }

    // Swap Ethernet addresses.
    for i in 0..6 {
        frame.swap(i, i + 6);
    }

    // Swap IPv4 source and destination.
    for i in 0..4 {
        frame.swap(ETHER_HDR_LEN + 12 + i, ETHER_HDR_LEN + 16 + i);
    }

    frame[icmp] = ICMP_ECHO_REPLY;

    // Incremental checksum update over the changed 16-bit word.
    let old_word = u16::from_be_bytes([ICMP_ECHO_REQUEST, icmp_code]);
    let new_word = u16::from_be_bytes([ICMP_ECHO_REPLY, icmp_code]);
    let old_cksum = u16::from_be_bytes([frame[icmp + 2], frame[icmp + 3]]);

    let mut sum: u32 = (!old_cksum & 0xffff) as u32;
    sum += (!old_word & 0xffff) as u32;
    sum += new_word as u32;
    sum = (sum & 0xffff) + (sum >> 16);
    sum = (sum & 0xffff) + (sum >> 16);
    let new_cksum = !(sum as u16);
    frame[icmp + 2..icmp + 4].copy_from_slice(&new_cksum.to_be_bytes());

    true
}

/// Internet checksum (one's complement sum of 16-bit big-endian words).
pub fn internet_checksum(data: &[u8]) -> u16 {
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

#[cfg(test)]
mod tests {
    use super::*;

    const DEV_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0xaa, 0xbb, 0xcc];
    const DEV_IP: [u8; 4] = [10, 0, 5, 1];
    const PEER_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x11, 0x22, 0x33];
    const PEER_IP: [u8; 4] = [10, 0, 5, 2];

    fn arp_request(target_ip: [u8; 4]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&[0xff; 6]); // broadcast
        frame.extend_from_slice(&PEER_MAC);
        frame.extend_from_slice(&ETHERTYPE_ARP.to_be_bytes());
        frame.extend_from_slice(&1u16.to_be_bytes()); // htype: ethernet
        frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes()); // ptype
        frame.push(6); // hlen
        frame.push(4); // plen
        frame.extend_from_slice(&ARP_OP_REQUEST.to_be_bytes());
        frame.extend_from_slice(&PEER_MAC); // sender hw
        frame.extend_from_slice(&PEER_IP); // sender ip
        frame.extend_from_slice(&[0u8; 6]); // target hw (unknown)
        frame.extend_from_slice(&target_ip);
        frame
    }

    fn icmp_echo_request(payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&DEV_MAC);
        frame.extend_from_slice(&PEER_MAC);
        frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

        let total_len = (IPV4_HDR_LEN + ICMP_HDR_LEN + payload.len()) as u16;
        let ip_start = frame.len();
        frame.push(0x45);
        frame.push(0x00);
        frame.extend_from_slice(&total_len.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x01, 0x00, 0x00]); // id, flags/frag
        frame.push(64); // ttl
        frame.push(IPPROTO_ICMP);
        frame.extend_from_slice(&[0x00, 0x00]); // checksum placeholder
        frame.extend_from_slice(&PEER_IP);
        frame.extend_from_slice(&DEV_IP);
        let ip_cksum = internet_checksum(&frame[ip_start..ip_start + IPV4_HDR_LEN]);
        frame[ip_start + 10..ip_start + 12].copy_from_slice(&ip_cksum.to_be_bytes());

        let icmp_start = frame.len();
        frame.push(ICMP_ECHO_REQUEST);
        frame.push(0); // code
        frame.extend_from_slice(&[0x00, 0x00]); // checksum placeholder
        frame.extend_from_slice(&[0x12, 0x34]); // identifier
        frame.extend_from_slice(&[0x00, 0x01]); // sequence
        frame.extend_from_slice(payload);
        let icmp_cksum = internet_checksum(&frame[icmp_start..]);
        frame[icmp_start + 2..icmp_start + 4].copy_from_slice(&icmp_cksum.to_be_bytes());

        frame
    }

    #[test]
    fn test_arp_reply_fields() {
        let mut frame = arp_request(DEV_IP);
        assert!(arp_reply_in_place(&mut frame, &DEV_MAC, &DEV_IP));

        let arp = ETHER_HDR_LEN;
        // Ethernet: back to the requester, from the device.
        assert_eq!(&frame[0..6], &PEER_MAC);
        assert_eq!(&frame[6..12], &DEV_MAC);
        // Opcode is reply.
        assert_eq!(
            u16::from_be_bytes([frame[arp + 6], frame[arp + 7]]),
            ARP_OP_REPLY
        );
        // Sender fields are the device, target fields the original requester.
        assert_eq!(&frame[arp + 8..arp + 14], &DEV_MAC);
        assert_eq!(&frame[arp + 14..arp + 18], &DEV_IP);
        assert_eq!(&frame[arp + 18..arp + 24], &PEER_MAC);
        assert_eq!(&frame[arp + 24..arp + 28], &PEER_IP);
    }

    #[test]
    fn test_arp_request_for_other_ip_ignored() {
        let mut frame = arp_request([10, 0, 5, 99]);
        let before = frame.clone();
        assert!(!arp_reply_in_place(&mut frame, &DEV_MAC, &DEV_IP));
        assert_eq!(frame, before);
    }

    #[test]
    fn test_arp_reply_opcode_not_answered() {
        let mut frame = arp_request(DEV_IP);
        let arp = ETHER_HDR_LEN;
        frame[arp + 6..arp + 8].copy_from_slice(&ARP_OP_REPLY.to_be_bytes());
        assert!(!arp_reply_in_place(&mut frame, &DEV_MAC, &DEV_IP));
    }

    #[test]
    fn test_truncated_arp_ignored() {
        let mut frame = arp_request(DEV_IP);
        frame.truncate(30);
        assert!(!arp_reply_in_place(&mut frame, &DEV_MAC, &DEV_IP));
    }

    #[test]
    fn test_icmp_echo_reply_roundtrip() {
        let payload = [0xa5u8; 56];
        let mut frame = icmp_echo_request(&payload);
        assert!(icmp_echo_reply_in_place(&mut frame));

        let icmp = ETHER_HDR_LEN + IPV4_HDR_LEN;
        // MAC and IP swapped.
        assert_eq!(&frame[0..6], &PEER_MAC);
        assert_eq!(&frame[6..12], &DEV_MAC);
        assert_eq!(&frame[ETHER_HDR_LEN + 12..ETHER_HDR_LEN + 16], &DEV_IP);
        assert_eq!(&frame[ETHER_HDR_LEN + 16..ETHER_HDR_LEN + 20], &PEER_IP);
        // Type flipped, payload untouched.
        assert_eq!(frame[icmp], ICMP_ECHO_REPLY);
        assert_eq!(&frame[icmp + ICMP_HDR_LEN..], &payload);
        // Incrementally updated checksum verifies over the full ICMP region.
        assert_eq!(internet_checksum(&frame[icmp..]), 0);
    }

    #[test]
    fn test_icmp_non_echo_ignored() {
        let mut frame = icmp_echo_request(&[0u8; 8]);
        let icmp = ETHER_HDR_LEN + IPV4_HDR_LEN;
        frame[icmp] = 13; // timestamp request
        assert!(!icmp_echo_reply_in_place(&mut frame));
    }

    #[test]
    fn test_udp_accessors() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&DEV_MAC);
        frame.extend_from_slice(&PEER_MAC);
        frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        frame.push(0x45);
        frame.push(0x00);
        let payload = b"detector data";
        let total_len = (IPV4_HDR_LEN + UDP_HDR_LEN + payload.len()) as u16;
        frame.extend_from_slice(&total_len.to_be_bytes());
        frame.extend_from_slice(&[0, 0, 0, 0]);
        frame.push(64);
        frame.push(IPPROTO_UDP);
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(&PEER_IP);
        frame.extend_from_slice(&DEV_IP);
        frame.extend_from_slice(&9999u16.to_be_bytes()); // src port
        frame.extend_from_slice(&61649u16.to_be_bytes()); // dst port
        frame.extend_from_slice(&((UDP_HDR_LEN + payload.len()) as u16).to_be_bytes());
        frame.extend_from_slice(&[0, 0]); // checksum optional
        frame.extend_from_slice(payload);

        assert_eq!(ether_type(&frame), Ok(ETHERTYPE_IPV4));
        assert_eq!(ipv4_protocol(&frame), Ok(IPPROTO_UDP));
        assert_eq!(udp_dst_port(&frame), Ok(61649));
        assert_eq!(udp_payload(&frame), Ok(&payload[..]));
    }

    #[test]
    fn test_udp_length_beyond_frame_rejected() {
        let mut frame = vec![0u8; UDP_PAYLOAD_OFFSET + 4];
        frame[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        frame[ETHER_HDR_LEN] = 0x45;
        frame[ETHER_HDR_LEN + 9] = IPPROTO_UDP;
        let off = ETHER_HDR_LEN + IPV4_HDR_LEN;
        // Claim 100 payload bytes with only 4 present.
        frame[off + 4..off + 6].copy_from_slice(&(108u16).to_be_bytes());
        assert!(matches!(
            udp_payload(&frame),
            Err(WireError::BadUdpLength { .. })
        ));
    }

    #[test]
    fn test_ip_options_rejected() {
        let mut frame = vec![0u8; 64];
        frame[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        frame[ETHER_HDR_LEN] = 0x46; // ihl = 6
        assert!(matches!(
            ipv4_protocol(&frame),
            Err(WireError::UnsupportedIpHeader { ihl: 6, .. })
        ));
    }

    #[test]
    fn test_short_frames() {
        assert!(matches!(
            ether_type(&[0u8; 6]),
            Err(WireError::TooShort { .. })
        ));
        assert!(matches!(
            ipv4_protocol(&[0u8; 20]),
            Err(WireError::TooShort { .. })
        ));
        assert!(matches!(
            udp_dst_port(&[0u8; 36]),
            Err(WireError::TooShort { .. })
        ));
    }
}
