//! RTP packet framing.
//!
//! Fixed 12-byte header plus CSRC list, optional padding trailer. The codec
//! here is stateless; sequence assignment and peer lookup live with the
//! session that owns the sockets.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

pub const RTP_VERSION: u8 = 2;
/// Dynamic payload type conventionally used for RTP-MIDI streams.
pub const PAYLOAD_TYPE_MIDI: u8 = 97;
pub const MAX_CSRC: usize = 15;
pub const HEADER_LEN: usize = 12;

/// Descriptor shared between the framing and payload layers.
///
/// On send the session fills sequence number and timestamp; on receive they
/// are read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketInfo {
    /// Total padding bytes appended after the payload, 0 for none. The last
    /// padding byte carries the count.
    pub padding: u8,
    pub extension: bool,
    pub csrc: Vec<u32>,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl PacketInfo {
    pub fn new(ssrc: u32, sequence_number: u16, timestamp: u32) -> Self {
        Self {
            padding: 0,
            extension: false,
            csrc: Vec::new(),
            marker: true,
            payload_type: PAYLOAD_TYPE_MIDI,
            sequence_number,
            timestamp,
            ssrc,
        }
    }
}

/// A parsed inbound packet: header fields, the payload with padding already
/// stripped, and the datagram size on the wire.
#[derive(Debug, Clone)]
pub struct ReceivedPacket {
    pub info: PacketInfo,
    pub payload: Bytes,
    pub total_size: usize,
}

/// Serializes header and payload into one datagram buffer.
pub fn encode_packet(info: &PacketInfo, payload: &[u8]) -> Result<BytesMut> {
    if info.csrc.len() > MAX_CSRC {
        return Err(Error::BadProperty("csrc list exceeds 15 entries"));
    }
    if info.payload_type > 0x7F {
        return Err(Error::BadProperty("payload type exceeds 7 bits"));
    }

    let mut buf =
        BytesMut::with_capacity(HEADER_LEN + info.csrc.len() * 4 + payload.len() + info.padding as usize);

    let byte0 = (RTP_VERSION << 6)
        | (u8::from(info.padding > 0) << 5)
        | (u8::from(info.extension) << 4)
        | info.csrc.len() as u8;
    buf.put_u8(byte0);
    buf.put_u8((u8::from(info.marker) << 7) | info.payload_type);
    buf.put_u16(info.sequence_number);
    buf.put_u32(info.timestamp);
    buf.put_u32(info.ssrc);
    for csrc in &info.csrc {
        buf.put_u32(*csrc);
    }
    buf.put_slice(payload);
    if info.padding > 0 {
        buf.put_bytes(0, usize::from(info.padding) - 1);
        buf.put_u8(info.padding);
    }
    Ok(buf)
}

/// Parses one datagram. Fails with [`Error::Decode`] on a bad header and
/// [`Error::Truncated`] when the buffer is shorter than the header promises.
pub fn decode_packet(data: &[u8]) -> Result<ReceivedPacket> {
    if data.len() < HEADER_LEN {
        return Err(Error::Truncated);
    }
    let total_size = data.len();
    let mut reader = Bytes::copy_from_slice(data);

    let byte0 = reader.get_u8();
    if byte0 >> 6 != RTP_VERSION {
        return Err(Error::Decode("unsupported RTP version"));
    }
    let padded = byte0 & 0x20 != 0;
    let extension = byte0 & 0x10 != 0;
    let csrc_count = usize::from(byte0 & 0x0F);

    let byte1 = reader.get_u8();
    let marker = byte1 & 0x80 != 0;
    let payload_type = byte1 & 0x7F;

    let sequence_number = reader.get_u16();
    let timestamp = reader.get_u32();
    let ssrc = reader.get_u32();

    if reader.remaining() < csrc_count * 4 {
        return Err(Error::Decode("csrc list exceeds packet size"));
    }
    let mut csrc = Vec::with_capacity(csrc_count);
    for _ in 0..csrc_count {
        csrc.push(reader.get_u32());
    }

    let mut payload = reader;
    let padding = if padded {
        let count = *payload.last().ok_or(Error::Decode("padded packet without trailer"))?;
        if count == 0 || usize::from(count) > payload.len() {
            return Err(Error::Decode("padding count exceeds payload"));
        }
        payload.truncate(payload.len() - usize::from(count));
        count
    } else {
        0
    };

    Ok(ReceivedPacket {
        info: PacketInfo {
            padding,
            extension,
            csrc,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
        },
        payload,
        total_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_header_roundtrip() {
        let info = PacketInfo::new(0xDEADBEEF, 0x1234, 0xCAFE0000);
        let wire = encode_packet(&info, &[1, 2, 3, 4]).unwrap();
        let packet = decode_packet(&wire).unwrap();
        assert_eq!(packet.info, info);
        assert_eq!(&packet.payload[..], &[1, 2, 3, 4]);
        assert_eq!(packet.total_size, wire.len());
    }

    #[test]
    fn csrc_and_padding_roundtrip() {
        for padding in [0u8, 1, 2, 17, 255] {
            let mut info = PacketInfo::new(1, 2, 3);
            info.marker = false;
            info.extension = true;
            info.padding = padding;
            info.csrc = vec![0x8070_6050, 0x0403_0201];
            let payload: Vec<u8> = (0..32).collect();
            let wire = encode_packet(&info, &payload).unwrap();
            assert_eq!(
                wire.len(),
                HEADER_LEN + 8 + payload.len() + usize::from(padding)
            );
            let packet = decode_packet(&wire).unwrap();
            assert_eq!(packet.info, info);
            assert_eq!(&packet.payload[..], &payload[..]);
        }
    }

    #[test]
    fn header_byte_layout() {
        let mut info = PacketInfo::new(0x0102_0304, 0x0001, 7);
        info.csrc = vec![0xAABBCCDD];
        let wire = encode_packet(&info, &[]).unwrap();
        // V=2, P=0, X=0, CC=1
        assert_eq!(wire[0], 0b1000_0001);
        // M=1, PT=97
        assert_eq!(wire[1], 0x80 | 97);
        assert_eq!(&wire[2..4], &[0x00, 0x01]);
        assert_eq!(&wire[12..16], &[0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn rejects_wrong_version() {
        let mut wire = encode_packet(&PacketInfo::new(1, 2, 3), &[]).unwrap();
        wire[0] = (wire[0] & 0x3F) | (1 << 6);
        assert!(matches!(decode_packet(&wire), Err(Error::Decode(_))));
    }

    #[test]
    fn rejects_overlong_csrc_list() {
        let mut wire = encode_packet(&PacketInfo::new(1, 2, 3), &[]).unwrap();
        wire[0] |= 0x0F; // claim 15 CSRC entries that are not present
        assert!(matches!(decode_packet(&wire), Err(Error::Decode(_))));
    }

    #[test]
    fn rejects_bad_padding_trailer() {
        let mut info = PacketInfo::new(1, 2, 3);
        info.padding = 4;
        let mut wire = encode_packet(&info, &[9]).unwrap();
        let last = wire.len() - 1;
        wire[last] = 200; // count larger than the payload
        assert!(matches!(decode_packet(&wire), Err(Error::Decode(_))));
    }

    #[test]
    fn short_buffer_is_truncated() {
        assert!(matches!(decode_packet(&[0x80; 5]), Err(Error::Truncated)));
    }

    #[test]
    fn encode_rejects_out_of_range_fields() {
        let mut info = PacketInfo::new(1, 2, 3);
        info.csrc = vec![0; 16];
        assert!(encode_packet(&info, &[]).is_err());
        let mut info = PacketInfo::new(1, 2, 3);
        info.payload_type = 0x80;
        assert!(encode_packet(&info, &[]).is_err());
    }
}
