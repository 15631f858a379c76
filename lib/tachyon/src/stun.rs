//! RFC 8489 STUN codec, restricted to the message types and attributes the
//! ICE session needs.

use crate::shared::{ErrorType, NetworkError, NetworkResult};
use byteorder::{BigEndian, ByteOrder};
use flare::crypto;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
pub const FINGERPRINT_XOR: u32 = 0x5354_554e;
pub const HEADER_SIZE: usize = 20;
pub const TRANSACTION_ID_SIZE: usize = 12;

pub const METHOD_BINDING: u16 = 0x0001;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_USERNAME: u16 = 0x0006;
const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
const ATTR_MESSAGE_INTEGRITY_SHA256: u16 = 0x001C;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_PRIORITY: u16 = 0x0024;
const ATTR_USE_CANDIDATE: u16 = 0x0025;
const ATTR_FINGERPRINT: u16 = 0x8028;
const ATTR_ICE_CONTROLLED: u16 = 0x8029;
const ATTR_ICE_CONTROLLING: u16 = 0x802A;

const INTEGRITY_SHA1_SIZE: usize = 20;
const INTEGRITY_SHA256_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MessageClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl MessageClass {
    #[inline]
    fn bits(self) -> u16 {
        match self {
            MessageClass::Request => 0b00,
            MessageClass::Indication => 0b01,
            MessageClass::SuccessResponse => 0b10,
            MessageClass::ErrorResponse => 0b11,
        }
    }

    #[inline]
    fn from_bits(bits: u16) -> MessageClass {
        match bits {
            0b00 => MessageClass::Request,
            0b01 => MessageClass::Indication,
            0b10 => MessageClass::SuccessResponse,
            _ => MessageClass::ErrorResponse,
        }
    }
}

/// Packs class and method into the 14-bit message type field. The class bits
/// sit at positions 4 and 8, interleaved with the method bits.
#[inline]
fn pack_type(class: MessageClass, method: u16) -> u16 {
    let c = class.bits();
    (method & 0x000F)
        | ((method & 0x0070) << 1)
        | ((method & 0x0F80) << 2)
        | ((c & 0b01) << 4)
        | ((c & 0b10) << 7)
}

#[inline]
fn unpack_type(raw: u16) -> (MessageClass, u16) {
    let class = MessageClass::from_bits(((raw >> 4) & 0b01) | ((raw >> 7) & 0b10));
    let method = (raw & 0x000F) | ((raw >> 1) & 0x0070) | ((raw >> 2) & 0x0F80);
    (class, method)
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Attribute {
    MappedAddress(SocketAddr),
    XorMappedAddress(SocketAddr),
    Username(String),
    Priority(u32),
    UseCandidate,
    IceControlling(u64),
    IceControlled(u64),
    /// Preserved but not interpreted.
    Unknown(u16, Vec<u8>),
}

/// A decoded STUN message. Integrity and fingerprint are handled by the
/// codec, not stored as attributes.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StunMessage {
    pub class: MessageClass,
    pub method: u16,
    pub transaction_id: [u8; TRANSACTION_ID_SIZE],
    pub attributes: Vec<Attribute>,
}

/// Result of authenticating an inbound message.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Integrity {
    /// No MESSAGE-INTEGRITY attribute present.
    Absent,
    /// Present and verified against the supplied password.
    Verified,
    /// Present but did not verify.
    Failed,
}

impl StunMessage {
    pub fn new(class: MessageClass, method: u16) -> StunMessage {
        let mut transaction_id = [0u8; TRANSACTION_ID_SIZE];
        crypto::random_bytes(&mut transaction_id);

        StunMessage {
            class,
            method,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    pub fn binding_request() -> StunMessage {
        Self::new(MessageClass::Request, METHOD_BINDING)
    }

    pub fn binding_response(transaction_id: [u8; TRANSACTION_ID_SIZE]) -> StunMessage {
        let mut msg = Self::new(MessageClass::SuccessResponse, METHOD_BINDING);
        msg.transaction_id = transaction_id;
        msg
    }

    #[inline]
    pub fn attr(mut self, attribute: Attribute) -> StunMessage {
        self.attributes.push(attribute);
        self
    }

    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn username(&self) -> Option<&str> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::Username(name) => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn priority(&self) -> Option<u32> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::Priority(p) => Some(*p),
            _ => None,
        })
    }

    #[inline]
    pub fn has_use_candidate(&self) -> bool {
        self.attributes
            .iter()
            .any(|attr| *attr == Attribute::UseCandidate)
    }

    /// Serializes the message. When a password is supplied, appends
    /// MESSAGE-INTEGRITY (HMAC-SHA1) computed with the header length adjusted
    /// to cover the integrity attribute itself, then FINGERPRINT over
    /// everything before it, as RFC 8489 prescribes.
    pub fn encode(&self, password: Option<&[u8]>) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_SIZE];

        BigEndian::write_u16(&mut buf[0..2], pack_type(self.class, self.method));
        BigEndian::write_u32(&mut buf[4..8], MAGIC_COOKIE);
        buf[8..20].copy_from_slice(&self.transaction_id);

        for attribute in &self.attributes {
            write_attribute(&mut buf, attribute, &self.transaction_id);
        }

        if let Some(password) = password {
            let claimed = (buf.len() - HEADER_SIZE + 4 + INTEGRITY_SHA1_SIZE) as u16;
            BigEndian::write_u16(&mut buf[2..4], claimed);

            let mac = hmac_sha1(password, &buf);
            write_attr_header(&mut buf, ATTR_MESSAGE_INTEGRITY, INTEGRITY_SHA1_SIZE);
            buf.extend_from_slice(&mac);
        }

        let claimed = (buf.len() - HEADER_SIZE + 8) as u16;
        BigEndian::write_u16(&mut buf[2..4], claimed);

        let crc = {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&buf);
            hasher.finalize() ^ FINGERPRINT_XOR
        };
        write_attr_header(&mut buf, ATTR_FINGERPRINT, 4);
        let mut crc_bytes = [0u8; 4];
        BigEndian::write_u32(&mut crc_bytes, crc);
        buf.extend_from_slice(&crc_bytes);

        buf
    }

    /// Parses and authenticates a datagram. Check order: header sanity,
    /// FINGERPRINT, then MESSAGE-INTEGRITY against the claimed password.
    pub fn decode(datagram: &[u8], password: Option<&[u8]>) -> NetworkResult<(StunMessage, Integrity)> {
        if !is_stun_packet(datagram) {
            return Err(NetworkError::Fatal(ErrorType::BadPacket));
        }

        let claimed_len = BigEndian::read_u16(&datagram[2..4]) as usize;
        if claimed_len + HEADER_SIZE != datagram.len() || claimed_len % 4 != 0 {
            return Err(NetworkError::Fatal(ErrorType::BadPacket));
        }

        let (class, method) = unpack_type(BigEndian::read_u16(&datagram[0..2]));

        let mut transaction_id = [0u8; TRANSACTION_ID_SIZE];
        transaction_id.copy_from_slice(&datagram[8..20]);

        let mut attributes = Vec::new();
        let mut integrity_span: Option<(usize, Vec<u8>, bool)> = None;
        let mut fingerprint_span: Option<(usize, u32)> = None;

        let mut offset = HEADER_SIZE;
        while offset < datagram.len() {
            if offset + 4 > datagram.len() {
                return Err(NetworkError::Fatal(ErrorType::BadPacket));
            }

            let attr_type = BigEndian::read_u16(&datagram[offset..offset + 2]);
            let attr_len = BigEndian::read_u16(&datagram[offset + 2..offset + 4]) as usize;
            let value_start = offset + 4;

            if value_start + attr_len > datagram.len() {
                return Err(NetworkError::Fatal(ErrorType::BadPacket));
            }

            let value = &datagram[value_start..value_start + attr_len];

            match attr_type {
                ATTR_MESSAGE_INTEGRITY => {
                    if attr_len != INTEGRITY_SHA1_SIZE {
                        return Err(NetworkError::Fatal(ErrorType::BadPacket));
                    }
                    integrity_span = Some((offset, value.to_vec(), false));
                }
                ATTR_MESSAGE_INTEGRITY_SHA256 => {
                    if attr_len != INTEGRITY_SHA256_SIZE {
                        return Err(NetworkError::Fatal(ErrorType::BadPacket));
                    }
                    integrity_span = Some((offset, value.to_vec(), true));
                }
                ATTR_FINGERPRINT => {
                    if attr_len != 4 {
                        return Err(NetworkError::Fatal(ErrorType::BadPacket));
                    }
                    fingerprint_span = Some((offset, BigEndian::read_u32(value)));
                }
                _ => attributes.push(parse_attribute(attr_type, value, &transaction_id)?),
            }

            offset = value_start + (attr_len + 3) / 4 * 4;
        }

        // FINGERPRINT first: cheap rejection of corruption and non-STUN noise
        if let Some((fp_offset, claimed_crc)) = fingerprint_span {
            let mut scratch = datagram[..fp_offset].to_vec();
            BigEndian::write_u16(&mut scratch[2..4], (fp_offset - HEADER_SIZE + 8) as u16);

            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&scratch);
            let crc = hasher.finalize() ^ FINGERPRINT_XOR;

            if crc != claimed_crc {
                return Err(NetworkError::Fatal(ErrorType::BadPacket));
            }
        }

        let message = StunMessage {
            class,
            method,
            transaction_id,
            attributes,
        };

        let integrity = match (integrity_span, password) {
            (None, _) => Integrity::Absent,
            (Some(_), None) => Integrity::Failed,
            (Some((mi_offset, claimed_mac, is_sha256)), Some(password)) => {
                let attr_size = match is_sha256 {
                    true => 4 + INTEGRITY_SHA256_SIZE,
                    false => 4 + INTEGRITY_SHA1_SIZE,
                };

                let mut scratch = datagram[..mi_offset].to_vec();
                BigEndian::write_u16(
                    &mut scratch[2..4],
                    (mi_offset - HEADER_SIZE + attr_size) as u16,
                );

                let matches = match is_sha256 {
                    true => crypto::hmac_sha256(password, &scratch)[..] == claimed_mac[..],
                    false => hmac_sha1(password, &scratch)[..] == claimed_mac[..],
                };

                match matches {
                    true => Integrity::Verified,
                    false => Integrity::Failed,
                }
            }
        };

        Ok((message, integrity))
    }
}

/// Cheap demux check: a datagram that might be STUN. Data frames always have
/// the top bit of the first byte set, so the two-zero-bit rule cleanly
/// separates the streams.
#[inline]
pub fn is_stun_packet(datagram: &[u8]) -> bool {
    datagram.len() >= HEADER_SIZE
        && datagram[0] & 0xC0 == 0
        && BigEndian::read_u32(&datagram[4..8]) == MAGIC_COOKIE
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; INTEGRITY_SHA1_SIZE] {
    let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);

    let mut out = [0u8; INTEGRITY_SHA1_SIZE];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn write_attr_header(buf: &mut Vec<u8>, attr_type: u16, len: usize) {
    let mut header = [0u8; 4];
    BigEndian::write_u16(&mut header[0..2], attr_type);
    BigEndian::write_u16(&mut header[2..4], len as u16);
    buf.extend_from_slice(&header);
}

fn write_address(buf: &mut Vec<u8>, addr: SocketAddr, xor: bool, transaction_id: &[u8]) {
    let mut value = Vec::with_capacity(20);
    value.push(0);

    let port = match xor {
        true => addr.port() ^ (MAGIC_COOKIE >> 16) as u16,
        false => addr.port(),
    };

    let mut port_bytes = [0u8; 2];
    BigEndian::write_u16(&mut port_bytes, port);

    match addr.ip() {
        IpAddr::V4(ip) => {
            value.push(0x01);
            value.extend_from_slice(&port_bytes);

            let mut octets = ip.octets();
            if xor {
                let mut cookie = [0u8; 4];
                BigEndian::write_u32(&mut cookie, MAGIC_COOKIE);
                for i in 0..4 {
                    octets[i] ^= cookie[i];
                }
            }
            value.extend_from_slice(&octets);
        }
        IpAddr::V6(ip) => {
            value.push(0x02);
            value.extend_from_slice(&port_bytes);

            let mut octets = ip.octets();
            if xor {
                let mut mask = [0u8; 16];
                BigEndian::write_u32(&mut mask[0..4], MAGIC_COOKIE);
                mask[4..16].copy_from_slice(transaction_id);
                for i in 0..16 {
                    octets[i] ^= mask[i];
                }
            }
            value.extend_from_slice(&octets);
        }
    }

    let attr_type = match xor {
        true => ATTR_XOR_MAPPED_ADDRESS,
        false => ATTR_MAPPED_ADDRESS,
    };
    write_attr_header(buf, attr_type, value.len());
    buf.extend_from_slice(&value);
}

fn parse_address(value: &[u8], xor: bool, transaction_id: &[u8]) -> NetworkResult<SocketAddr> {
    if value.len() < 8 {
        return Err(NetworkError::Fatal(ErrorType::BadPacket));
    }

    let family = value[1];
    let mut port = BigEndian::read_u16(&value[2..4]);
    if xor {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    match family {
        0x01 => {
            if value.len() != 8 {
                return Err(NetworkError::Fatal(ErrorType::BadPacket));
            }

            let mut octets = [0u8; 4];
            octets.copy_from_slice(&value[4..8]);
            if xor {
                let mut cookie = [0u8; 4];
                BigEndian::write_u32(&mut cookie, MAGIC_COOKIE);
                for i in 0..4 {
                    octets[i] ^= cookie[i];
                }
            }

            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        0x02 => {
            if value.len() != 20 {
                return Err(NetworkError::Fatal(ErrorType::BadPacket));
            }

            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            if xor {
                let mut mask = [0u8; 16];
                BigEndian::write_u32(&mut mask[0..4], MAGIC_COOKIE);
                mask[4..16].copy_from_slice(transaction_id);
                for i in 0..16 {
                    octets[i] ^= mask[i];
                }
            }

            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => Err(NetworkError::Fatal(ErrorType::BadPacket)),
    }
}

fn write_attribute(buf: &mut Vec<u8>, attribute: &Attribute, transaction_id: &[u8]) {
    match attribute {
        Attribute::MappedAddress(addr) => write_address(buf, *addr, false, transaction_id),
        Attribute::XorMappedAddress(addr) => write_address(buf, *addr, true, transaction_id),
        Attribute::Username(name) => {
            write_attr_header(buf, ATTR_USERNAME, name.len());
            buf.extend_from_slice(name.as_bytes());
        }
        Attribute::Priority(priority) => {
            write_attr_header(buf, ATTR_PRIORITY, 4);
            let mut bytes = [0u8; 4];
            BigEndian::write_u32(&mut bytes, *priority);
            buf.extend_from_slice(&bytes);
        }
        Attribute::UseCandidate => write_attr_header(buf, ATTR_USE_CANDIDATE, 0),
        Attribute::IceControlling(tiebreaker) => {
            write_attr_header(buf, ATTR_ICE_CONTROLLING, 8);
            let mut bytes = [0u8; 8];
            BigEndian::write_u64(&mut bytes, *tiebreaker);
            buf.extend_from_slice(&bytes);
        }
        Attribute::IceControlled(tiebreaker) => {
            write_attr_header(buf, ATTR_ICE_CONTROLLED, 8);
            let mut bytes = [0u8; 8];
            BigEndian::write_u64(&mut bytes, *tiebreaker);
            buf.extend_from_slice(&bytes);
        }
        Attribute::Unknown(attr_type, value) => {
            write_attr_header(buf, *attr_type, value.len());
            buf.extend_from_slice(value);
        }
    }

    // 4-byte alignment with zero pad
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn parse_attribute(
    attr_type: u16,
    value: &[u8],
    transaction_id: &[u8],
) -> NetworkResult<Attribute> {
    Ok(match attr_type {
        ATTR_MAPPED_ADDRESS => {
            Attribute::MappedAddress(parse_address(value, false, transaction_id)?)
        }
        ATTR_XOR_MAPPED_ADDRESS => {
            Attribute::XorMappedAddress(parse_address(value, true, transaction_id)?)
        }
        ATTR_USERNAME => Attribute::Username(
            String::from_utf8(value.to_vec())
                .map_err(|_| NetworkError::Fatal(ErrorType::BadPacket))?,
        ),
        ATTR_PRIORITY => {
            if value.len() != 4 {
                return Err(NetworkError::Fatal(ErrorType::BadPacket));
            }
            Attribute::Priority(BigEndian::read_u32(value))
        }
        ATTR_USE_CANDIDATE => {
            if !value.is_empty() {
                return Err(NetworkError::Fatal(ErrorType::BadPacket));
            }
            Attribute::UseCandidate
        }
        ATTR_ICE_CONTROLLING => {
            if value.len() != 8 {
                return Err(NetworkError::Fatal(ErrorType::BadPacket));
            }
            Attribute::IceControlling(BigEndian::read_u64(value))
        }
        ATTR_ICE_CONTROLLED => {
            if value.len() != 8 {
                return Err(NetworkError::Fatal(ErrorType::BadPacket));
            }
            Attribute::IceControlled(BigEndian::read_u64(value))
        }
        _ => Attribute::Unknown(attr_type, value.to_vec()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_packing() {
        assert_eq!(pack_type(MessageClass::Request, METHOD_BINDING), 0x0001);
        assert_eq!(
            pack_type(MessageClass::SuccessResponse, METHOD_BINDING),
            0x0101
        );
        assert_eq!(pack_type(MessageClass::ErrorResponse, METHOD_BINDING), 0x0111);

        for &class in &[
            MessageClass::Request,
            MessageClass::Indication,
            MessageClass::SuccessResponse,
            MessageClass::ErrorResponse,
        ] {
            let (decoded_class, method) = unpack_type(pack_type(class, METHOD_BINDING));
            assert_eq!(decoded_class, class);
            assert_eq!(method, METHOD_BINDING);
        }
    }

    #[test]
    fn test_roundtrip_with_integrity_and_fingerprint() {
        let msg = StunMessage::binding_request()
            .attr(Attribute::Username("remote:local".to_owned()))
            .attr(Attribute::Priority(0x6e_0001_ff))
            .attr(Attribute::IceControlling(0x1122334455667788));

        let wire = msg.encode(Some(b"swordfish"));

        let (decoded, integrity) = StunMessage::decode(&wire, Some(b"swordfish")).unwrap();
        assert_eq!(integrity, Integrity::Verified);
        assert_eq!(decoded.class, MessageClass::Request);
        assert_eq!(decoded.method, METHOD_BINDING);
        assert_eq!(decoded.username(), Some("remote:local"));
        assert_eq!(decoded.priority(), Some(0x6e_0001_ff));
        assert_eq!(decoded.transaction_id, msg.transaction_id);
    }

    #[test]
    fn test_wrong_password_fails_integrity() {
        let msg = StunMessage::binding_request().attr(Attribute::Username("a:b".to_owned()));
        let wire = msg.encode(Some(b"correct"));

        let (_, integrity) = StunMessage::decode(&wire, Some(b"wrong")).unwrap();
        assert_eq!(integrity, Integrity::Failed);
    }

    #[test]
    fn test_corrupted_packet_fails_fingerprint() {
        let msg = StunMessage::binding_request();
        let mut wire = msg.encode(Some(b"pwd"));

        // Flip a bit in the transaction id; CRC must catch it before HMAC runs
        wire[9] ^= 0x40;
        assert!(StunMessage::decode(&wire, Some(b"pwd")).is_err());
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let msg = StunMessage::binding_request();
        let mut wire = msg.encode(None);

        wire.push(0);
        assert!(StunMessage::decode(&wire, None).is_err());
    }

    #[test]
    fn test_xor_mapped_address_v4() {
        let addr: SocketAddr = "192.0.2.1:3478".parse().unwrap();
        let msg = StunMessage::binding_response([7u8; TRANSACTION_ID_SIZE])
            .attr(Attribute::XorMappedAddress(addr));

        let wire = msg.encode(None);

        // The raw bytes on the wire must differ from the plain address
        let plain = StunMessage::binding_response([7u8; TRANSACTION_ID_SIZE])
            .attr(Attribute::MappedAddress(addr));
        assert_ne!(wire, plain.encode(None));

        let (decoded, _) = StunMessage::decode(&wire, None).unwrap();
        assert_eq!(decoded.xor_mapped_address(), Some(addr));
    }

    #[test]
    fn test_xor_mapped_address_v6() {
        let addr: SocketAddr = "[2001:db8::7]:49152".parse().unwrap();
        let msg = StunMessage::binding_response([9u8; TRANSACTION_ID_SIZE])
            .attr(Attribute::XorMappedAddress(addr));

        let wire = msg.encode(None);
        let (decoded, _) = StunMessage::decode(&wire, None).unwrap();
        assert_eq!(decoded.xor_mapped_address(), Some(addr));
    }

    #[test]
    fn test_use_candidate_flag() {
        let with = StunMessage::binding_request().attr(Attribute::UseCandidate);
        let without = StunMessage::binding_request();

        let (decoded, _) = StunMessage::decode(&with.encode(None), None).unwrap();
        assert!(decoded.has_use_candidate());

        let (decoded, _) = StunMessage::decode(&without.encode(None), None).unwrap();
        assert!(!decoded.has_use_candidate());
    }

    #[test]
    fn test_is_stun_packet_demux() {
        let stun = StunMessage::binding_request().encode(None);
        assert!(is_stun_packet(&stun));

        // Data frames lead with the top bit set
        assert!(!is_stun_packet(&[0x80; 32]));
        // Wrong cookie
        let mut bogus = stun.clone();
        bogus[4] ^= 1;
        assert!(!is_stun_packet(&bogus));
        // Too short
        assert!(!is_stun_packet(&[0u8; 8]));
    }

    #[test]
    fn test_unknown_attribute_preserved() {
        let msg = StunMessage::binding_request().attr(Attribute::Unknown(0x7777, vec![1, 2, 3]));
        let wire = msg.encode(None);

        let (decoded, _) = StunMessage::decode(&wire, None).unwrap();
        assert_eq!(
            decoded.attributes,
            vec![Attribute::Unknown(0x7777, vec![1, 2, 3])]
        );
    }

    #[test]
    fn test_username_padding_alignment() {
        // 5-byte username forces 3 bytes of pad; length field must stay 5
        let msg = StunMessage::binding_request().attr(Attribute::Username("ab:cd".to_owned()));
        let wire = msg.encode(Some(b"k"));

        let (decoded, integrity) = StunMessage::decode(&wire, Some(b"k")).unwrap();
        assert_eq!(integrity, Integrity::Verified);
        assert_eq!(decoded.username(), Some("ab:cd"));
        assert_eq!(wire.len() % 4, 0);
    }
}
