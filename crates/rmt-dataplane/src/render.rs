//! Human-readable frame summaries for logs and the CLI.

use std::fmt::Write as _;

/// `AA:BB:CC:DD:EE:FF` rendering of a MAC address.
#[must_use]
pub fn mac_string(mac: &[u8; 6]) -> String {
    let mut s = String::with_capacity(17);
    for (i, b) in mac.iter().enumerate() {
        if i > 0 {
            s.push(':');
        }
        let _ = write!(s, "{b:02X}");
    }
    s
}

/// One-line summary of an Ethernet frame, descending into IPv4 when the
/// ethertype says so.
#[must_use]
pub fn frame_summary(frame: &[u8]) -> String {
    if frame.len() < 14 {
        return format!("short frame ({} bytes)", frame.len());
    }
    let dst: [u8; 6] = frame[0..6].try_into().expect("length checked");
    let src: [u8; 6] = frame[6..12].try_into().expect("length checked");
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    let mut s = format!(
        "ether {} -> {} type 0x{ethertype:04X}",
        mac_string(&src),
        mac_string(&dst)
    );
    if ethertype == 0x0800 && frame.len() >= 34 {
        let ttl = frame[22];
        let src_ip = &frame[26..30];
        let dst_ip = &frame[30..34];
        let _ = write!(
            s,
            " | ipv4 {}.{}.{}.{} -> {}.{}.{}.{} ttl {ttl}",
            src_ip[0], src_ip[1], src_ip[2], src_ip[3], dst_ip[0], dst_ip[1], dst_ip[2], dst_ip[3]
        );
    }
    s
}
