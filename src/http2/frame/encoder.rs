//! # HTTP/2 フレームエンコーダ
//!
//! 送信側のペイロード分割 (MAX_FRAME_SIZE) は呼び出し側 (コネクション層) が
//! 行い、ここでは単一フレームのワイヤ形式を組み立てます。

use super::types::{Frame, FrameFlags, FrameHeader, FrameType, PrioritySpec};

/// フレームエンコーダ
pub struct FrameEncoder {
    /// ピアが広告した最大ペイロード長 (送信側の分割単位)
    max_frame_size: u32,
}

impl FrameEncoder {
    pub fn new(max_frame_size: u32) -> Self {
        Self { max_frame_size }
    }

    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    fn frame(header: FrameHeader, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FrameHeader::SIZE + payload.len());
        let mut head = [0u8; 9];
        header.write_to(&mut head);
        buf.extend_from_slice(&head);
        buf.extend_from_slice(payload);
        buf
    }

    /// DATA フレーム
    pub fn data(&self, stream_id: u32, data: &[u8], end_stream: bool) -> Vec<u8> {
        debug_assert!(data.len() <= self.max_frame_size as usize);
        let flags = if end_stream { FrameFlags::END_STREAM } else { 0 };
        Self::frame(
            FrameHeader::new(FrameType::Data, flags, stream_id, data.len() as u32),
            data,
        )
    }

    /// HEADERS フレーム (ヘッダーブロック断片)
    pub fn headers(
        &self,
        stream_id: u32,
        fragment: &[u8],
        end_stream: bool,
        end_headers: bool,
    ) -> Vec<u8> {
        let mut flags = 0u8;
        if end_stream {
            flags |= FrameFlags::END_STREAM;
        }
        if end_headers {
            flags |= FrameFlags::END_HEADERS;
        }
        Self::frame(
            FrameHeader::new(FrameType::Headers, flags, stream_id, fragment.len() as u32),
            fragment,
        )
    }

    /// CONTINUATION フレーム
    pub fn continuation(&self, stream_id: u32, fragment: &[u8], end_headers: bool) -> Vec<u8> {
        let flags = if end_headers { FrameFlags::END_HEADERS } else { 0 };
        Self::frame(
            FrameHeader::new(
                FrameType::Continuation,
                flags,
                stream_id,
                fragment.len() as u32,
            ),
            fragment,
        )
    }

    /// SETTINGS フレーム
    pub fn settings(&self, settings: &[(u16, u32)]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(settings.len() * 6);
        for &(id, value) in settings {
            payload.extend_from_slice(&id.to_be_bytes());
            payload.extend_from_slice(&value.to_be_bytes());
        }
        Self::frame(
            FrameHeader::new(FrameType::Settings, 0, 0, payload.len() as u32),
            &payload,
        )
    }

    /// SETTINGS ACK フレーム
    pub fn settings_ack(&self) -> Vec<u8> {
        Self::frame(
            FrameHeader::new(FrameType::Settings, FrameFlags::ACK, 0, 0),
            &[],
        )
    }

    /// WINDOW_UPDATE フレーム
    pub fn window_update(&self, stream_id: u32, increment: u32) -> Vec<u8> {
        Self::frame(
            FrameHeader::new(FrameType::WindowUpdate, 0, stream_id, 4),
            &(increment & 0x7FFF_FFFF).to_be_bytes(),
        )
    }

    /// PING フレーム
    pub fn ping(&self, data: &[u8; 8], ack: bool) -> Vec<u8> {
        let flags = if ack { FrameFlags::ACK } else { 0 };
        Self::frame(FrameHeader::new(FrameType::Ping, flags, 0, 8), data)
    }

    /// RST_STREAM フレーム
    pub fn rst_stream(&self, stream_id: u32, error_code: u32) -> Vec<u8> {
        Self::frame(
            FrameHeader::new(FrameType::RstStream, 0, stream_id, 4),
            &error_code.to_be_bytes(),
        )
    }

    /// GOAWAY フレーム
    pub fn goaway(&self, last_stream_id: u32, error_code: u32, debug_data: &[u8]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(8 + debug_data.len());
        payload.extend_from_slice(&(last_stream_id & 0x7FFF_FFFF).to_be_bytes());
        payload.extend_from_slice(&error_code.to_be_bytes());
        payload.extend_from_slice(debug_data);
        Self::frame(
            FrameHeader::new(FrameType::GoAway, 0, 0, payload.len() as u32),
            &payload,
        )
    }

    /// PRIORITY フレーム
    pub fn priority(&self, stream_id: u32, spec: PrioritySpec) -> Vec<u8> {
        let mut payload = [0u8; 5];
        let dep = if spec.exclusive {
            spec.dependency | 0x8000_0000
        } else {
            spec.dependency
        };
        payload[..4].copy_from_slice(&dep.to_be_bytes());
        payload[4] = (spec.weight.saturating_sub(1)).min(255) as u8;
        Self::frame(FrameHeader::new(FrameType::Priority, 0, stream_id, 5), &payload)
    }

    /// Frame 値からエンコード
    pub fn encode(&self, frame: &Frame) -> Vec<u8> {
        match frame {
            Frame::Data {
                stream_id,
                end_stream,
                data,
                ..
            } => self.data(*stream_id, data, *end_stream),
            Frame::Headers {
                stream_id,
                end_stream,
                end_headers,
                fragment,
                ..
            } => self.headers(*stream_id, fragment, *end_stream, *end_headers),
            Frame::Continuation {
                stream_id,
                end_headers,
                fragment,
            } => self.continuation(*stream_id, fragment, *end_headers),
            Frame::Settings { ack, settings } => {
                if *ack {
                    self.settings_ack()
                } else {
                    self.settings(settings)
                }
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => self.window_update(*stream_id, *increment),
            Frame::Ping { ack, data } => self.ping(data, *ack),
            Frame::RstStream {
                stream_id,
                error_code,
            } => self.rst_stream(*stream_id, *error_code),
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => self.goaway(*last_stream_id, *error_code, debug_data),
            Frame::Priority {
                stream_id,
                priority,
            } => self.priority(*stream_id, *priority),
            // サーバーは PUSH_PROMISE を送信しない (ENABLE_PUSH=0)
            Frame::PushPromise { .. } | Frame::Unknown { .. } => Vec::new(),
        }
    }
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new(16384)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http2::frame::decoder::FrameDecoder;

    #[test]
    fn test_encode_data_wire_format() {
        let encoder = FrameEncoder::new(16384);
        let bytes = encoder.data(1, b"hello", true);

        assert_eq!(bytes.len(), 9 + 5);
        let header = FrameHeader::parse(bytes[..9].try_into().unwrap());
        assert_eq!(header.length, 5);
        assert_eq!(header.frame_type, FrameType::Data as u8);
        assert!(header.is_end_stream());
        assert_eq!(header.stream_id, 1);
        assert_eq!(&bytes[9..], b"hello");
    }

    #[test]
    fn test_settings_ack_is_empty() {
        let encoder = FrameEncoder::new(16384);
        let bytes = encoder.settings_ack();
        assert_eq!(bytes.len(), 9);
        let header = FrameHeader::parse(bytes[..9].try_into().unwrap());
        assert!(header.is_ack());
        assert_eq!(header.length, 0);
    }

    #[test]
    fn test_goaway_wire_format() {
        let encoder = FrameEncoder::new(16384);
        let bytes = encoder.goaway(7, 0x1, b"bye");
        let header = FrameHeader::parse(bytes[..9].try_into().unwrap());
        assert_eq!(header.length, 8 + 3);
        assert_eq!(header.stream_id, 0);
        assert_eq!(&bytes[9..13], &7u32.to_be_bytes());
        assert_eq!(&bytes[13..17], &1u32.to_be_bytes());
        assert_eq!(&bytes[17..], b"bye");
    }

    #[test]
    fn test_roundtrip_via_decoder() {
        let encoder = FrameEncoder::new(16384);
        let decoder = FrameDecoder::new(16384);

        let frames = [
            encoder.settings(&[(0x3, 100), (0x4, 65535)]),
            encoder.window_update(5, 1024),
            encoder.rst_stream(5, 0x8),
            encoder.ping(&[9; 8], false),
            encoder.headers(7, b"\x82\x84", false, true),
            encoder.continuation(7, b"\x86", true),
        ];

        for bytes in frames {
            let header = decoder
                .decode_header(bytes[..9].try_into().unwrap())
                .unwrap();
            let frame = decoder.decode(&header, &bytes[9..]).unwrap();
            let re = encoder.encode(&frame);
            assert_eq!(re, bytes, "re-encode mismatch for {}", frame.name());
        }
    }
}
