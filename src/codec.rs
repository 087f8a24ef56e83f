use crate::protocol::Envelope;
use bytes::BytesMut;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Initial capacity of the reassembly buffer
const BUFFER_CAPACITY: usize = 64 * 1024;

/// Outcome of decoding one inbound WebSocket message
#[derive(Debug)]
pub enum Decoded {
    /// A complete packet
    Packet(Envelope),
    /// The peer closed the connection; never decoded as payload
    Close(Option<CloseFrame<'static>>),
    /// Control frame or a fragment that does not finish a packet yet
    Skip,
}

/// Encodes outbound envelopes and decodes inbound frames.
///
/// Packets that arrive in a single receive are decoded in place. Packets
/// split across several receives are accumulated until the final fragment
/// and decoded from the concatenation. The buffer lives in the codec, so a
/// read that is cancelled between fragments does not lose data.
#[derive(Debug)]
pub struct PacketCodec {
    buffer: BytesMut,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketCodec {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(BUFFER_CAPACITY),
        }
    }

    /// Serialize an envelope as one text message
    pub fn encode(&self, envelope: &Envelope) -> serde_json::Result<Message> {
        serde_json::to_string(envelope).map(Message::Text)
    }

    /// Decode one inbound message
    pub fn decode(&mut self, message: Message) -> serde_json::Result<Decoded> {
        match message {
            Message::Text(text) => self.packet(text.as_bytes(), true),
            Message::Binary(data) => self.packet(&data, true),
            Message::Frame(frame) => {
                let fin = frame.header().is_final;
                self.packet(frame.payload(), fin)
            }
            Message::Close(frame) => {
                self.reset();
                Ok(Decoded::Close(frame))
            }
            Message::Ping(_) | Message::Pong(_) => Ok(Decoded::Skip),
        }
    }

    /// Feed one received fragment.
    ///
    /// Returns the decoded envelope once `fin` is observed, `None` while
    /// more fragments are expected.
    pub fn push_fragment(&mut self, data: &[u8], fin: bool) -> serde_json::Result<Option<Envelope>> {
        if fin && self.buffer.is_empty() {
            return serde_json::from_slice(data).map(Some);
        }

        self.buffer.extend_from_slice(data);
        if !fin {
            return Ok(None);
        }

        let packet = self.buffer.split();
        serde_json::from_slice(&packet).map(Some)
    }

    /// Bytes of an unfinished packet currently buffered
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partially received packet
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    fn packet(&mut self, data: &[u8], fin: bool) -> serde_json::Result<Decoded> {
        Ok(match self.push_fragment(data, fin)? {
            Some(envelope) => Decoded::Packet(envelope),
            None => Decoded::Skip,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Opcode;
    use serde_json::json;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    fn decode_packet(codec: &mut PacketCodec, message: Message) -> Envelope {
        match codec.decode(message).expect("valid packet") {
            Decoded::Packet(envelope) => envelope,
            other => panic!("expected a packet, got {:?}", other),
        }
    }

    #[test]
    fn test_round_trip_single_message() {
        let mut codec = PacketCodec::new();
        let samples = vec![
            Envelope::heartbeat(Some(7)),
            Envelope::new(Opcode::Hello, json!({"heartbeat_interval": 41250})),
            Envelope::dispatch("MESSAGE_CREATE", 12, json!({"id": "1", "content": "hi"})),
        ];

        for envelope in samples {
            let message = codec.encode(&envelope).unwrap();
            assert_eq!(decode_packet(&mut codec, message), envelope);
        }
    }

    #[test]
    fn test_binary_message_decodes() {
        let mut codec = PacketCodec::new();
        let bytes = br#"{"op":11,"d":null}"#.to_vec();
        let envelope = decode_packet(&mut codec, Message::Binary(bytes));
        assert_eq!(envelope.op, Opcode::HeartbeatAck);
    }

    #[test]
    fn test_fragmented_packet_reassembles() {
        let mut codec = PacketCodec::new();
        let envelope = Envelope::dispatch("GUILD_CREATE", 3, json!({"id": "99", "name": "x".repeat(300)}));
        let wire = serde_json::to_vec(&envelope).unwrap();
        let (a, rest) = wire.split_at(100);
        let (b, c) = rest.split_at(150);

        assert!(codec.push_fragment(a, false).unwrap().is_none());
        assert!(codec.push_fragment(b, false).unwrap().is_none());
        assert_eq!(codec.pending(), 250);
        let decoded = codec.push_fragment(c, true).unwrap();

        assert_eq!(decoded, Some(envelope));
        assert_eq!(codec.pending(), 0);
    }

    #[test]
    fn test_close_frame_is_not_payload() {
        let mut codec = PacketCodec::new();
        codec.push_fragment(b"{\"op\":", false).unwrap();

        let frame = CloseFrame {
            code: CloseCode::from(4004),
            reason: "Authentication failed".into(),
        };
        match codec.decode(Message::Close(Some(frame))).unwrap() {
            Decoded::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 4004),
            other => panic!("expected close, got {:?}", other),
        }
        assert_eq!(codec.pending(), 0);
    }

    #[test]
    fn test_invalid_payload_errors_and_recovers() {
        let mut codec = PacketCodec::new();
        assert!(codec.decode(Message::Text("{not json".to_string())).is_err());

        assert!(codec.push_fragment(b"{\"op\":99", false).unwrap().is_none());
        assert!(codec.push_fragment(b",\"d\":null}", true).is_err());
        assert_eq!(codec.pending(), 0);

        let envelope = decode_packet(&mut codec, Message::Text(r#"{"op":11}"#.to_string()));
        assert_eq!(envelope.op, Opcode::HeartbeatAck);
    }

    #[test]
    fn test_ping_is_skipped() {
        let mut codec = PacketCodec::new();
        assert!(matches!(
            codec.decode(Message::Ping(vec![1, 2])).unwrap(),
            Decoded::Skip
        ));
    }
}
