//! Datagram framing. Every UDP payload starts with a one-byte message id;
//! ids with the top bit set are encrypted data frames, everything else is a
//! connectionless handshake or control message.

use crate::shared::{ErrorType, NetworkError, NetworkResult, MAX_UDP_PAYLOAD, MIN_HANDSHAKE_PACKET};
use byteorder::{ByteOrder, LittleEndian};
use flare::cert::NONCE_SEED_SIZE;
use flare::crypto;
use prost::Message;

pub const ID_CHALLENGE_REQUEST: u8 = 0x01;
pub const ID_CHALLENGE_REPLY: u8 = 0x02;
pub const ID_CONNECT_REQUEST: u8 = 0x03;
pub const ID_CONNECT_OK: u8 = 0x04;
pub const ID_CONNECTION_CLOSED: u8 = 0x05;
pub const ID_NO_CONNECTION: u8 = 0x06;
pub const ID_ICE_PING_CHECK: u8 = 0x07;

/// Top bit marks a data frame; the remaining bits are flags.
pub const DATA_FRAME_BIT: u8 = 0x80;

/// Data frame flag: a varint-prefixed stats blob precedes the ciphertext.
pub const DATA_FLAG_STATS: u8 = 0x01;

/// Size of the cleartext data frame header: flags, connection id, wire seq.
pub const DATA_HEADER_SIZE: usize = 1 + 4 + 2;

/// Requests from unknown sources are padded so we never amplify: the reply is
/// not allowed to be larger than what the asker spent.
#[inline]
fn is_padded(id: u8) -> bool {
    match id {
        ID_CHALLENGE_REQUEST | ID_CONNECT_REQUEST | ID_CONNECTION_CLOSED => true,
        _ => false,
    }
}

/// Frames a connectionless message: `{u8 id, u16 len_le}` + protobuf payload,
/// zero-padded to the handshake minimum when the id calls for it.
pub fn write_handshake<M: Message>(id: u8, msg: &M) -> Vec<u8> {
    let body_len = msg.encoded_len();
    let framed_len = 3 + body_len;

    if framed_len > MAX_UDP_PAYLOAD {
        panic!(
            "Handshake message too large for a datagram: {} > {}",
            framed_len, MAX_UDP_PAYLOAD
        );
    }

    let total = match is_padded(id) {
        true => framed_len.max(MIN_HANDSHAKE_PACKET),
        false => framed_len,
    };

    let mut out = vec![0u8; total];
    out[0] = id;
    LittleEndian::write_u16(&mut out[1..3], body_len as u16);
    msg.encode(&mut &mut out[3..3 + body_len])
        .expect("Sized buffer write cannot fail");

    out
}

/// Splits a connectionless message into (id, protobuf payload). Rejects short
/// packets and under-padded packets for ids that require padding.
pub fn parse_handshake(datagram: &[u8]) -> NetworkResult<(u8, &[u8])> {
    if datagram.len() < 3 {
        return Err(NetworkError::Fatal(ErrorType::BadPacket));
    }

    let id = datagram[0];
    let body_len = LittleEndian::read_u16(&datagram[1..3]) as usize;

    if 3 + body_len > datagram.len() {
        return Err(NetworkError::Fatal(ErrorType::BadPacket));
    }

    if is_padded(id) && datagram.len() < MIN_HANDSHAKE_PACKET {
        return Err(NetworkError::Fatal(ErrorType::BadPacket));
    }

    Ok((id, &datagram[3..3 + body_len]))
}

/// Cleartext header of a data frame.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DataHeader {
    pub flags: u8,
    pub to_connection_id: u32,
    pub wire_seq: u16,
}

impl DataHeader {
    #[inline]
    pub fn write(&self, out: &mut [u8]) {
        out[0] = DATA_FRAME_BIT | self.flags;
        LittleEndian::write_u32(&mut out[1..5], self.to_connection_id);
        LittleEndian::write_u16(&mut out[5..7], self.wire_seq);
    }

    #[inline]
    pub fn parse(datagram: &[u8]) -> NetworkResult<DataHeader> {
        if datagram.len() < DATA_HEADER_SIZE || datagram[0] & DATA_FRAME_BIT == 0 {
            return Err(NetworkError::Fatal(ErrorType::BadPacket));
        }

        Ok(DataHeader {
            flags: datagram[0] & !DATA_FRAME_BIT,
            to_connection_id: LittleEndian::read_u32(&datagram[1..5]),
            wire_seq: LittleEndian::read_u16(&datagram[5..7]),
        })
    }
}

/// Reconstructs the full 64-bit sequence number from its low 16 wire bits,
/// choosing the value nearest to `expected + 1` (the next in-order packet).
pub fn reconstruct_sequence(expected: u64, wire_seq: u16) -> u64 {
    let reference = expected.wrapping_add(1);
    let mut full = (reference & !0xFFFFu64) | wire_seq as u64;

    if full > reference.wrapping_add(0x8000) {
        full = full.saturating_sub(0x1_0000);
    } else if full.wrapping_add(0x8000) < reference {
        full += 0x1_0000;
    }

    full
}

/// Builds the 12-byte AEAD nonce for a packet: bytes 4..12 carry the full
/// sequence number little-endian, bytes 0..4 are XORed with the head of the
/// connection's nonce seed. Sequence numbers are single-use, so a (key,
/// nonce) pair can never repeat within a session.
#[inline]
pub fn build_nonce(nonce_seed: &[u8; NONCE_SEED_SIZE], full_seq: u64) -> [u8; crypto::NONCE_SIZE] {
    let mut nonce = [0u8; crypto::NONCE_SIZE];
    LittleEndian::write_u64(&mut nonce[4..12], full_seq);

    for i in 0..4 {
        nonce[i] ^= nonce_seed[i];
    }

    nonce
}

/// LEB128 varint write.
pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;

        match value {
            0 => {
                out.push(byte);
                return;
            }
            _ => out.push(byte | 0x80),
        }
    }
}

/// LEB128 varint read; returns (value, bytes consumed).
pub fn read_varint(data: &[u8]) -> NetworkResult<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0;

    for (i, &byte) in data.iter().enumerate() {
        if shift >= 64 {
            return Err(NetworkError::Fatal(ErrorType::BadPacket));
        }

        value |= ((byte & 0x7F) as u64) << shift;

        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }

        shift += 7;
    }

    Err(NetworkError::Fatal(ErrorType::BadPacket))
}

/// Writes a varint-length-prefixed blob.
pub fn write_blob(out: &mut Vec<u8>, blob: &[u8]) {
    write_varint(out, blob.len() as u64);
    out.extend_from_slice(blob);
}

/// Reads a varint-length-prefixed blob; returns (blob, bytes consumed).
pub fn read_blob(data: &[u8]) -> NetworkResult<(&[u8], usize)> {
    let (len, len_size) = read_varint(data)?;
    let len = len as usize;

    if len_size + len > data.len() {
        return Err(NetworkError::Fatal(ErrorType::BadPacket));
    }

    Ok((&data[len_size..len_size + len], len_size + len))
}
