//! Implements the framing of the BitTorrent wire protocol: the fixed 68 byte
//! handshake and the length-prefixed peer messages that follow it.
//!
//! A connection starts out with a [`HandshakeCodec`] and is switched to a
//! [`PeerCodec`] once the handshakes are exchanged, reusing the read and
//! write buffers of the framed stream. The peer codec validates every frame
//! against the torrent's geometry so that nothing out of range ever reaches
//! the swarm manager.

use std::{convert::TryFrom, sync::Arc};

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::*, torrent::TorrentInfo, Bitfield, BlockInfo, PeerId, PieceIndex,
    Sha1Hash,
};

/// The protocol string of the standard BitTorrent handshake, exactly 19
/// bytes.
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The fixed 68 byte message that starts every connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handshake {
    /// The protocol string, must equal [`PROTOCOL_STRING`].
    pub prot: [u8; 19],
    /// Reserved for extensions, all zeros until a feature is negotiated.
    pub reserved: [u8; 8],
    /// The torrent's SHA-1 info hash.
    pub info_hash: Sha1Hash,
    /// The peer's arbitrary 20 byte id, accepted verbatim.
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

/// The length of the wire handshake: 1 + 19 + 8 + 20 + 20.
const HANDSHAKE_LEN: usize = 68;

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<()> {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(handshake.prot.len() as u8);
        buf.put_slice(&handshake.prot);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // the first byte fixes the protocol string length; peek it without
        // consuming so partial reads can resume
        if buf[0] as usize != PROTOCOL_STRING.len() {
            return Err(Error::HandshakeFailed);
        }
        if buf.len() < HANDSHAKE_LEN {
            buf.reserve(HANDSHAKE_LEN - buf.len());
            return Ok(None);
        }

        let mut frame = buf.split_to(HANDSHAKE_LEN);
        frame.advance(1);

        let mut prot = [0; 19];
        frame.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::HandshakeFailed);
        }

        let mut reserved = [0; 8];
        frame.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        frame.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        frame.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The id of a peer message, the first payload byte after the length prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(id: u8) -> Result<Self> {
        use MessageId::*;
        match id {
            0 => Ok(Choke),
            1 => Ok(Unchoke),
            2 => Ok(Interested),
            3 => Ok(NotInterested),
            4 => Ok(Have),
            5 => Ok(Bitfield),
            6 => Ok(Request),
            7 => Ok(Block),
            8 => Ok(Cancel),
            _ => Err(Error::Protocol("unknown message id")),
        }
    }
}

/// A peer message, the tagged sum of everything that can travel on an
/// established connection.
///
/// The variants are matched exhaustively in both the codec and the swarm
/// manager so no message can be silently dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// An empty frame sent to keep an otherwise idle connection open.
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Bitfield(Bitfield),
    Request(BlockInfo),
    /// The protocol calls this message `piece` but it carries a single block
    /// of one, so in the source code we call it a block.
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
}

impl Message {
    /// Returns the message's wire id, or `None` for a keep-alive, which has
    /// no id.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield(_) => Some(MessageId::Bitfield),
            Message::Request(_) => Some(MessageId::Request),
            Message::Block { .. } => Some(MessageId::Block),
            Message::Cancel(_) => Some(MessageId::Cancel),
        }
    }
}

/// Codec for the messages that follow the handshake.
///
/// The decoder is streaming: it accepts arbitrary byte chunks and yields
/// whole messages, keeping its buffer bounded by the largest legal frame.
pub struct PeerCodec {
    torrent: Arc<TorrentInfo>,
    max_block_len: u32,
}

impl PeerCodec {
    pub fn new(torrent: Arc<TorrentInfo>, max_block_len: u32) -> Self {
        Self {
            torrent,
            max_block_len,
        }
    }

    /// The largest frame a compliant peer can send us: a block message
    /// carrying `max_block_len` bytes, or the bitfield, whichever is larger.
    fn max_frame_len(&self) -> usize {
        (9 + self.max_block_len as usize)
            .max(1 + self.torrent.bitfield_byte_len())
    }

    /// Checks that a block reference fits its piece and the block length
    /// cap. Used for request, block, and cancel messages alike.
    fn check_block(
        &self,
        piece_index: PieceIndex,
        offset: u32,
        len: u32,
    ) -> Result<()> {
        if piece_index >= self.torrent.piece_count() {
            return Err(Error::Protocol("piece index out of range"));
        }
        if len == 0 {
            return Err(Error::Protocol("zero length block"));
        }
        if len > self.max_block_len {
            return Err(Error::Protocol("block length exceeds maximum"));
        }
        // the piece index was checked above so this cannot fail
        let piece_len = self.torrent.piece_len(piece_index)?;
        if offset as u64 + len as u64 > piece_len as u64 {
            return Err(Error::Protocol("block exceeds piece boundary"));
        }
        Ok(())
    }

    fn decode_bitfield(&self, frame: &mut BytesMut) -> Result<Bitfield> {
        if frame.len() != self.torrent.bitfield_byte_len() {
            return Err(Error::Protocol("bitfield length mismatch"));
        }

        // The bitfield raw data that is sent over the wire may be longer
        // than the logical pieces it represents, if the number of pieces in
        // torrent is not a multiple of 8. The spare low bits of the last
        // byte must be zero.
        let piece_count = self.torrent.piece_count();
        let spare_bits = frame.len() * 8 - piece_count;
        if spare_bits > 0 {
            let spare_mask = (1u8 << spare_bits) - 1;
            if frame[frame.len() - 1] & spare_mask != 0 {
                return Err(Error::Protocol("bitfield spare bits not zero"));
            }
        }

        let mut bitfield = Bitfield::from_vec(frame.to_vec());
        bitfield.truncate(piece_count);
        Ok(bitfield)
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }

        // peek at the length prefix without consuming it so that partial
        // frames can resume on the next read
        let mut prefix = [0; 4];
        prefix.copy_from_slice(&buf[0..4]);
        let msg_len = u32::from_be_bytes(prefix) as usize;

        // refuse frames no compliant peer would produce before buffering them
        if msg_len > self.max_frame_len() {
            return Err(Error::Protocol("frame length exceeds maximum"));
        }

        if buf.len() < 4 + msg_len {
            buf.reserve(4 + msg_len - buf.len());
            return Ok(None);
        }
        buf.advance(4);

        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let mut frame = buf.split_to(msg_len);
        let id = MessageId::try_from(frame.get_u8())?;

        fn expect_payload_len(frame: &BytesMut, expected: usize) -> Result<()> {
            if frame.len() == expected {
                Ok(())
            } else {
                Err(Error::Protocol("wrong payload length for message id"))
            }
        }

        let msg = match id {
            MessageId::Choke => {
                expect_payload_len(&frame, 0)?;
                Message::Choke
            }
            MessageId::Unchoke => {
                expect_payload_len(&frame, 0)?;
                Message::Unchoke
            }
            MessageId::Interested => {
                expect_payload_len(&frame, 0)?;
                Message::Interested
            }
            MessageId::NotInterested => {
                expect_payload_len(&frame, 0)?;
                Message::NotInterested
            }
            MessageId::Have => {
                expect_payload_len(&frame, 4)?;
                let piece_index = frame.get_u32() as PieceIndex;
                if piece_index >= self.torrent.piece_count() {
                    return Err(Error::Protocol("piece index out of range"));
                }
                Message::Have { piece_index }
            }
            MessageId::Bitfield => {
                Message::Bitfield(self.decode_bitfield(&mut frame)?)
            }
            MessageId::Request => {
                expect_payload_len(&frame, 12)?;
                let piece_index = frame.get_u32() as PieceIndex;
                let offset = frame.get_u32();
                let len = frame.get_u32();
                self.check_block(piece_index, offset, len)?;
                Message::Request(BlockInfo {
                    piece_index,
                    offset,
                    len,
                })
            }
            MessageId::Block => {
                if frame.len() < 8 {
                    return Err(Error::Protocol(
                        "wrong payload length for message id",
                    ));
                }
                let piece_index = frame.get_u32() as PieceIndex;
                let offset = frame.get_u32();
                self.check_block(piece_index, offset, frame.len() as u32)?;
                Message::Block {
                    piece_index,
                    offset,
                    data: frame.to_vec(),
                }
            }
            MessageId::Cancel => {
                expect_payload_len(&frame, 12)?;
                let piece_index = frame.get_u32() as PieceIndex;
                let offset = frame.get_u32();
                let len = frame.get_u32();
                self.check_block(piece_index, offset, len)?;
                Message::Cancel(BlockInfo {
                    piece_index,
                    offset,
                    len,
                })
            }
        };

        Ok(Some(msg))
    }
}

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<()> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {
                buf.put_u32(1);
                // the id is total for these variants
                buf.put_u8(msg.id().unwrap() as u8);
            }
            Message::Have { piece_index } => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let raw = bitfield.as_raw_slice();
                debug_assert_eq!(raw.len(), self.torrent.bitfield_byte_len());
                buf.put_u32(1 + raw.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(raw);
            }
            Message::Request(block) => {
                buf.put_u32(1 + 12);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(1 + 8 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            Message::Cancel(block) => {
                buf.put_u32(1 + 12);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn torrent(piece_count: usize, piece_len: u32) -> Arc<TorrentInfo> {
        Arc::new(
            TorrentInfo::new(
                [0x21; 20],
                piece_len,
                piece_len as u64 * piece_count as u64,
                vec![[0; 20]; piece_count],
            )
            .unwrap(),
        )
    }

    fn codec(piece_count: usize, piece_len: u32) -> PeerCodec {
        PeerCodec::new(torrent(piece_count, piece_len), 0x2_0000)
    }

    fn roundtrip(codec: &mut PeerCodec, msg: Message) -> Message {
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty(), "decoder must consume the whole frame");
        decoded
    }

    #[test]
    fn test_handshake_roundtrip() {
        let hs = Handshake::new([0xfe; 20], *b"swt-0000000000000000");
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(hs, &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);
        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, hs);
    }

    #[test]
    fn test_handshake_rejects_bad_length_prefix() {
        let hs = Handshake::new([0xfe; 20], [1; 20]);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(hs, &mut buf).unwrap();
        buf[0] ^= 0x01;
        assert!(matches!(
            HandshakeCodec.decode(&mut buf),
            Err(Error::HandshakeFailed)
        ));
    }

    #[test]
    fn test_handshake_rejects_bad_protocol_string() {
        let hs = Handshake::new([0xfe; 20], [1; 20]);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(hs, &mut buf).unwrap();
        // flip a bit in the middle of the protocol string
        buf[5] ^= 0x10;
        assert!(matches!(
            HandshakeCodec.decode(&mut buf),
            Err(Error::HandshakeFailed)
        ));
    }

    #[test]
    fn test_handshake_partial_input() {
        let hs = Handshake::new([0xfe; 20], [1; 20]);
        let mut full = BytesMut::new();
        HandshakeCodec.encode(hs, &mut full).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&full[..30]);
        assert!(HandshakeCodec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[30..]);
        assert_eq!(HandshakeCodec.decode(&mut buf).unwrap().unwrap(), hs);
    }

    #[test]
    fn test_message_roundtrips() {
        let mut codec = codec(9, 0x8000);
        let mut bitfield = Bitfield::repeat(false, 9);
        bitfield.set(0, true);
        bitfield.set(8, true);

        let msgs = vec![
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { piece_index: 8 },
            Message::Bitfield(bitfield),
            Message::Request(BlockInfo {
                piece_index: 1,
                offset: 0x4000,
                len: 0x4000,
            }),
            Message::Block {
                piece_index: 2,
                offset: 0,
                data: vec![0xab; 0x4000],
            },
            Message::Cancel(BlockInfo {
                piece_index: 1,
                offset: 0x4000,
                len: 0x4000,
            }),
        ];
        for msg in msgs {
            assert_eq!(roundtrip(&mut codec, msg.clone()), msg);
        }
    }

    #[test]
    fn test_bitfield_roundtrip_all_lengths() {
        // every piece count from a single byte to a few, with only valid
        // (zero) spare bits
        for piece_count in 1..=24 {
            let mut codec = codec(piece_count, 16);
            let mut bitfield = Bitfield::repeat(false, piece_count);
            for index in (0..piece_count).step_by(3) {
                bitfield.set(index, true);
            }
            let msg = Message::Bitfield(bitfield);
            assert_eq!(roundtrip(&mut codec, msg.clone()), msg);
        }
    }

    #[test]
    fn test_streaming_decode_across_chunks() {
        let mut codec = codec(4, 0x8000);
        let msg = Message::Block {
            piece_index: 3,
            offset: 0x4000,
            data: vec![0x77; 0x1000],
        };
        let mut full = BytesMut::new();
        codec.encode(msg.clone(), &mut full).unwrap();

        // everything but the last byte is not enough for a frame
        let mut partial = BytesMut::new();
        partial.extend_from_slice(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[full.len() - 1..]);
        assert_eq!(codec.decode(&mut partial).unwrap().unwrap(), msg);
    }

    #[test]
    fn test_unknown_message_id() {
        let mut codec = codec(4, 16);
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(9);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::Protocol("unknown message id"))
        ));
    }

    #[test]
    fn test_wrong_fixed_payload_length() {
        let mut codec = codec(4, 16);
        // a choke with a stray payload byte
        let mut buf = BytesMut::new();
        buf.put_u32(2);
        buf.put_u8(MessageId::Choke as u8);
        buf.put_u8(0);
        assert!(matches!(codec.decode(&mut buf), Err(Error::Protocol(_))));

        // a have with a short payload
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u8(MessageId::Have as u8);
        buf.put_u16(0);
        assert!(matches!(codec.decode(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_bitfield_length_mismatch() {
        // 9 pieces need 2 bytes; send 1
        let mut codec = codec(9, 16);
        let mut buf = BytesMut::new();
        buf.put_u32(2);
        buf.put_u8(MessageId::Bitfield as u8);
        buf.put_u8(0xff);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::Protocol("bitfield length mismatch"))
        ));
    }

    #[test]
    fn test_bitfield_spare_bits_must_be_zero() {
        // 9 pieces, 2 byte bitfield: the lowest 7 bits of the second byte
        // are spare and any of them being set is a protocol error
        let mut codec = codec(9, 16);
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u8(MessageId::Bitfield as u8);
        buf.put_u8(0xff);
        buf.put_u8(0b1000_0001);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::Protocol("bitfield spare bits not zero"))
        ));
    }

    #[test]
    fn test_request_out_of_range_piece() {
        let mut codec = codec(4, 16);
        let mut buf = BytesMut::new();
        buf.put_u32(13);
        buf.put_u8(MessageId::Request as u8);
        buf.put_u32(4);
        buf.put_u32(0);
        buf.put_u32(16);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::Protocol("piece index out of range"))
        ));
    }

    #[test]
    fn test_request_past_piece_boundary() {
        let mut codec = codec(4, 16);
        let mut buf = BytesMut::new();
        buf.put_u32(13);
        buf.put_u8(MessageId::Request as u8);
        buf.put_u32(0);
        buf.put_u32(8);
        buf.put_u32(16);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::Protocol("block exceeds piece boundary"))
        ));
    }

    #[test]
    fn test_block_exceeding_max_length() {
        let torrent = torrent(4, 0x4_0000);
        let mut codec = PeerCodec::new(torrent, 0x2_0000);
        let mut buf = BytesMut::new();
        let data_len = 0x2_0000 + 1;
        buf.put_u32(9 + data_len);
        buf.put_u8(MessageId::Block as u8);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_slice(&vec![0; data_len as usize]);
        assert!(matches!(codec.decode(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_oversized_frame_rejected_before_buffering() {
        let mut codec = codec(4, 16);
        let mut buf = BytesMut::new();
        // an absurd length prefix alone must already fail
        buf.put_u32(0x7fff_ffff);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::Protocol("frame length exceeds maximum"))
        ));
    }

    #[test]
    fn test_keep_alive() {
        let mut codec = codec(4, 16);
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            Message::KeepAlive
        );
    }
}
