/*! Fixed-offset protocol fields used by the VPN heuristics.

None of this is protocol dissection. Each extractor reads a byte or
two at a known offset and leaves interpretation to the classifiers and
fingerprints. A payload too short for an extractor's offset yields the
zero value.
*/

use crate::frame::Transport;

/// The OpenVPN opcode sits in the high 5 bits of its byte; the low 3
/// bits are the key ID.
pub const OPCODE_SHIFT: u32 = 3;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct OpenvpnFields {
    pub opcode: u8,
    /// The 2-byte big-endian record length OpenVPN prefixes to every
    /// TCP segment; 0 for UDP, which has no such framing.
    pub length_hint: u16,
    /// Observed payload size minus the TCP length prefix.
    pub payload_length: u16,
}

impl OpenvpnFields {
    pub fn extract(payload: &[u8], payload_len: u16, transport: Transport) -> OpenvpnFields {
        let opcode_byte = match transport {
            Transport::Tcp => payload.get(2),
            Transport::Udp => payload.first(),
        };
        let length_hint = match (transport, payload) {
            (Transport::Tcp, [hi, lo, ..]) => u16::from_be_bytes([*hi, *lo]),
            _ => 0,
        };
        OpenvpnFields {
            opcode: opcode_byte.copied().unwrap_or(0) >> OPCODE_SHIFT,
            length_hint,
            payload_length: payload_len.saturating_sub(2),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct WireguardFields {
    /// Low byte of the little-endian message type word. UDP only.
    pub opcode: u8,
}

impl WireguardFields {
    pub fn extract(payload: &[u8], transport: Transport) -> WireguardFields {
        let opcode = match transport {
            Transport::Udp => payload.first().copied().unwrap_or(0),
            Transport::Tcp => 0,
        };
        WireguardFields { opcode }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Ikev2Fields {
    /// IKEv2 Exchange Type: header offset 18, after both SPIs, the
    /// next-payload byte and the version byte.
    pub opcode: u8,
    /// First four bytes as a little-endian word. Zero is the non-ESP
    /// marker that separates IKE from ESP on a shared port.
    pub marker: u32,
}

impl Ikev2Fields {
    pub fn extract(payload: &[u8], transport: Transport) -> Ikev2Fields {
        if transport != Transport::Udp {
            return Ikev2Fields::default();
        }
        let marker = match payload {
            [a, b, c, d, ..] => u32::from_le_bytes([*a, *b, *c, *d]),
            _ => 0,
        };
        Ikev2Fields {
            opcode: payload.get(18).copied().unwrap_or(0),
            marker,
        }
    }
}

/// Wire name of an OpenVPN opcode, for debug output.
pub fn opcode_to_string(opcode: u8) -> Option<&'static str> {
    const NAMES: [&str; 10] = [
        "NONE",
        "P_CONTROL_HARD_RESET_CLIENT_V1",
        "P_CONTROL_HARD_RESET_SERVER_V1",
        "P_CONTROL_SOFT_RESET_V1",
        "P_CONTROL_V1",
        "P_ACK_V1",
        "P_DATA_V1",
        "P_CONTROL_HARD_RESET_CLIENT_V2",
        "P_CONTROL_HARD_RESET_SERVER_V2",
        "P_DATA_V2",
    ];
    NAMES.get(usize::from(opcode)).copied()
}
