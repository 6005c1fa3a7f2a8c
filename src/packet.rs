use crate::err::CodecError;

/// Fixed header size (seq + ack + flags + length), before the payload.
const HEADER_LEN: usize = 11;

const FLAG_SYN: u8 = 0b001;
const FLAG_ACK: u8 = 0b010;
const FLAG_FIN: u8 = 0b100;

/// Single-byte payload a pure SYN or FIN carries so its flag consumes
/// exactly one sequence number without needing a dedicated wire field for it.
pub(crate) const CONTROL_FILLER: [u8; 1] = [0xAC];

/// The on-wire unit exchanged between two instances of this library.
///
/// `LEN` is never stored explicitly; it is always `payload.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub seq: u32,
    pub ack: u32,
    pub syn: bool,
    pub ack_flag: bool,
    pub fin: bool,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn len(&self) -> u32 {
        self.payload.len() as u32
    }

    pub fn is_control(&self) -> bool {
        self.syn || self.fin
    }

    /// True for a FIN whose only payload is the one-byte sequence filler,
    /// i.e. one carrying no real application data alongside the flag.
    pub(crate) fn is_bare_fin(&self) -> bool {
        self.fin && self.payload == CONTROL_FILLER
    }

    /// Sequence number one past the last byte this packet occupies.
    pub fn end_seq(&self) -> u32 {
        self.seq.wrapping_add(self.len())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.ack.to_be_bytes());

        let mut flags = 0u8;
        if self.syn {
            flags |= FLAG_SYN;
        }
        if self.ack_flag {
            flags |= FLAG_ACK;
        }
        if self.fin {
            flags |= FLAG_FIN;
        }
        buf.push(flags);

        let len = self.payload.len() as u16;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&self.payload);

        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Packet, CodecError> {
        if bytes.len() < HEADER_LEN {
            return Err(CodecError::Truncated(bytes.len()));
        }

        let seq = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let ack = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
        let flags = bytes[8];
        let declared = u16::from_be_bytes(bytes[9..11].try_into().unwrap()) as usize;
        let payload = &bytes[HEADER_LEN..];

        if payload.len() != declared {
            return Err(CodecError::LengthMismatch {
                declared,
                actual: payload.len(),
            });
        }

        Ok(Packet {
            seq,
            ack,
            syn: flags & FLAG_SYN != 0,
            ack_flag: flags & FLAG_ACK != 0,
            fin: flags & FLAG_FIN != 0,
            payload: payload.to_vec(),
        })
    }
}

/// `lhs` precedes `rhs` under 32-bit sequence-number wraparound (RFC 1323).
pub(crate) fn wrapping_lt(lhs: u32, rhs: u32) -> bool {
    lhs.wrapping_sub(rhs) > (1 << 31)
}

pub(crate) fn wrapping_max(a: u32, b: u32) -> u32 {
    if wrapping_lt(a, b) {
        b
    } else {
        a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(payload: &[u8]) -> Packet {
        Packet {
            seq: 42,
            ack: 7,
            syn: true,
            ack_flag: false,
            fin: true,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn round_trip_with_payload() {
        let p = sample(b"hello");
        assert_eq!(Packet::decode(&p.encode()).unwrap(), p);
    }

    #[test]
    fn round_trip_empty_payload() {
        let p = sample(b"");
        assert_eq!(Packet::decode(&p.encode()).unwrap(), p);
    }

    #[test]
    fn decode_rejects_truncated_header() {
        let bytes = [0u8; 5];
        assert!(matches!(
            Packet::decode(&bytes),
            Err(CodecError::Truncated(5))
        ));
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let mut bytes = sample(b"abc").encode();
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            Packet::decode(&bytes),
            Err(CodecError::LengthMismatch {
                declared: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn flags_roundtrip_independently() {
        let mut p = sample(b"");
        for (syn, ack_flag, fin) in [
            (true, true, false),
            (false, true, true),
            (false, false, false),
            (true, false, true),
        ] {
            p.syn = syn;
            p.ack_flag = ack_flag;
            p.fin = fin;
            assert_eq!(Packet::decode(&p.encode()).unwrap(), p);
        }
    }

    #[test]
    fn wrapping_lt_handles_wraparound() {
        assert!(wrapping_lt(u32::MAX, 0));
        assert!(wrapping_lt(0, 1));
        assert!(!wrapping_lt(1, 0));
    }
}
