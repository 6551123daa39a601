//! # HTTP/2 フレームデコーダ
//!
//! フレームヘッダーとペイロードをデコードし、フレームレベルの不変条件を
//! 検証します。受信サイズ上限は自分が広告した MAX_FRAME_SIZE です。

use crate::http2::error::{ErrorCode, Http2Error, Http2Result};

use super::types::{Frame, FrameHeader, FrameType, PrioritySpec};

/// フレームデコーダ
pub struct FrameDecoder {
    /// 受信を許可する最大ペイロード長 (自分の SETTINGS_MAX_FRAME_SIZE)
    max_frame_size: u32,
}

impl FrameDecoder {
    pub fn new(max_frame_size: u32) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// フレームヘッダーをデコードし、サイズ上限を検証
    ///
    /// RFC 7540 Section 4.2: 広告した上限の 1 オクテット超過でも
    /// FRAME_SIZE_ERROR (コネクションエラー) です。
    pub fn decode_header(&self, buf: &[u8; 9]) -> Http2Result<FrameHeader> {
        let header = FrameHeader::parse(buf);
        if header.length > self.max_frame_size {
            return Err(Http2Error::frame_size(format!(
                "frame of {} bytes exceeds SETTINGS_MAX_FRAME_SIZE {}",
                header.length, self.max_frame_size
            )));
        }
        Ok(header)
    }

    /// ペイロードをデコード
    pub fn decode(&self, header: &FrameHeader, payload: &[u8]) -> Http2Result<Frame> {
        debug_assert_eq!(payload.len(), header.length as usize);

        match header.frame_type() {
            Some(FrameType::Data) => self.decode_data(header, payload),
            Some(FrameType::Headers) => self.decode_headers(header, payload),
            Some(FrameType::Priority) => self.decode_priority(header, payload),
            Some(FrameType::RstStream) => self.decode_rst_stream(header, payload),
            Some(FrameType::Settings) => self.decode_settings(header, payload),
            Some(FrameType::PushPromise) => self.decode_push_promise(header, payload),
            Some(FrameType::Ping) => self.decode_ping(header, payload),
            Some(FrameType::GoAway) => self.decode_goaway(header, payload),
            Some(FrameType::WindowUpdate) => self.decode_window_update(header, payload),
            Some(FrameType::Continuation) => self.decode_continuation(header, payload),
            // 未知のフレームタイプは破棄対象として返す (RFC 7540 Section 4.1)
            None => Ok(Frame::Unknown {
                frame_type: header.frame_type,
                stream_id: header.stream_id,
            }),
        }
    }

    fn decode_data(&self, header: &FrameHeader, payload: &[u8]) -> Http2Result<Frame> {
        if header.stream_id == 0 {
            return Err(Http2Error::protocol("DATA frame on stream 0"));
        }

        let (data, pad_len) = strip_padding(header, payload)?;

        Ok(Frame::Data {
            stream_id: header.stream_id,
            end_stream: header.is_end_stream(),
            data: data.to_vec(),
            pad_len,
        })
    }

    fn decode_headers(&self, header: &FrameHeader, payload: &[u8]) -> Http2Result<Frame> {
        if header.stream_id == 0 {
            return Err(Http2Error::protocol("HEADERS frame on stream 0"));
        }

        let (body, pad_len) = strip_padding(header, payload)?;

        let (priority, fragment) = if header.has_priority() {
            if body.len() < 5 {
                return Err(Http2Error::frame_size(
                    "HEADERS with PRIORITY flag shorter than 5 bytes",
                ));
            }
            (Some(parse_priority(&body[..5])), &body[5..])
        } else {
            (None, body)
        };

        Ok(Frame::Headers {
            stream_id: header.stream_id,
            end_stream: header.is_end_stream(),
            end_headers: header.is_end_headers(),
            priority,
            fragment: fragment.to_vec(),
            pad_len,
        })
    }

    fn decode_priority(&self, header: &FrameHeader, payload: &[u8]) -> Http2Result<Frame> {
        if header.stream_id == 0 {
            return Err(Http2Error::protocol("PRIORITY frame on stream 0"));
        }
        if payload.len() != 5 {
            // PRIORITY の長さ違反はストリームエラー (RFC 7540 Section 6.3)
            return Err(Http2Error::stream(
                header.stream_id,
                ErrorCode::FrameSizeError,
                "PRIORITY frame must be 5 bytes",
            ));
        }

        Ok(Frame::Priority {
            stream_id: header.stream_id,
            priority: parse_priority(payload),
        })
    }

    fn decode_rst_stream(&self, header: &FrameHeader, payload: &[u8]) -> Http2Result<Frame> {
        if header.stream_id == 0 {
            return Err(Http2Error::protocol("RST_STREAM frame on stream 0"));
        }
        if payload.len() != 4 {
            return Err(Http2Error::frame_size("RST_STREAM frame must be 4 bytes"));
        }

        Ok(Frame::RstStream {
            stream_id: header.stream_id,
            error_code: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
        })
    }

    fn decode_settings(&self, header: &FrameHeader, payload: &[u8]) -> Http2Result<Frame> {
        if header.stream_id != 0 {
            return Err(Http2Error::protocol("SETTINGS frame on non-zero stream"));
        }

        if header.is_ack() {
            if !payload.is_empty() {
                return Err(Http2Error::frame_size("SETTINGS ACK with payload"));
            }
            return Ok(Frame::Settings {
                ack: true,
                settings: Vec::new(),
            });
        }

        if payload.len() % 6 != 0 {
            return Err(Http2Error::frame_size(
                "SETTINGS payload not a multiple of 6",
            ));
        }

        let settings = payload
            .chunks_exact(6)
            .map(|c| {
                (
                    u16::from_be_bytes([c[0], c[1]]),
                    u32::from_be_bytes([c[2], c[3], c[4], c[5]]),
                )
            })
            .collect();

        Ok(Frame::Settings {
            ack: false,
            settings,
        })
    }

    fn decode_push_promise(&self, header: &FrameHeader, payload: &[u8]) -> Http2Result<Frame> {
        if header.stream_id == 0 {
            return Err(Http2Error::protocol("PUSH_PROMISE frame on stream 0"));
        }

        let (body, _pad) = strip_padding(header, payload)?;
        if body.len() < 4 {
            return Err(Http2Error::frame_size("PUSH_PROMISE too short"));
        }

        let promised =
            u32::from_be_bytes([body[0], body[1], body[2], body[3]]) & 0x7FFF_FFFF;

        Ok(Frame::PushPromise {
            stream_id: header.stream_id,
            promised_stream_id: promised,
            end_headers: header.is_end_headers(),
            fragment: body[4..].to_vec(),
        })
    }

    fn decode_ping(&self, header: &FrameHeader, payload: &[u8]) -> Http2Result<Frame> {
        if header.stream_id != 0 {
            return Err(Http2Error::protocol("PING frame on non-zero stream"));
        }
        if payload.len() != 8 {
            return Err(Http2Error::frame_size("PING frame must be 8 bytes"));
        }

        let mut data = [0u8; 8];
        data.copy_from_slice(payload);

        Ok(Frame::Ping {
            ack: header.is_ack(),
            data,
        })
    }

    fn decode_goaway(&self, header: &FrameHeader, payload: &[u8]) -> Http2Result<Frame> {
        if header.stream_id != 0 {
            return Err(Http2Error::protocol("GOAWAY frame on non-zero stream"));
        }
        if payload.len() < 8 {
            return Err(Http2Error::frame_size("GOAWAY frame shorter than 8 bytes"));
        }

        Ok(Frame::GoAway {
            last_stream_id: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
                & 0x7FFF_FFFF,
            error_code: u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
            debug_data: payload[8..].to_vec(),
        })
    }

    fn decode_window_update(&self, header: &FrameHeader, payload: &[u8]) -> Http2Result<Frame> {
        if payload.len() != 4 {
            return Err(Http2Error::frame_size(
                "WINDOW_UPDATE frame must be 4 bytes",
            ));
        }

        let increment =
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7FFF_FFFF;

        // 増分 0 は PROTOCOL_ERROR (RFC 7540 Section 6.9)
        if increment == 0 {
            return if header.stream_id == 0 {
                Err(Http2Error::protocol("WINDOW_UPDATE with zero increment"))
            } else {
                Err(Http2Error::stream(
                    header.stream_id,
                    ErrorCode::ProtocolError,
                    "WINDOW_UPDATE with zero increment",
                ))
            };
        }

        Ok(Frame::WindowUpdate {
            stream_id: header.stream_id,
            increment,
        })
    }

    fn decode_continuation(&self, header: &FrameHeader, payload: &[u8]) -> Http2Result<Frame> {
        if header.stream_id == 0 {
            return Err(Http2Error::protocol("CONTINUATION frame on stream 0"));
        }

        Ok(Frame::Continuation {
            stream_id: header.stream_id,
            end_headers: header.is_end_headers(),
            fragment: payload.to_vec(),
        })
    }
}

/// PADDED フラグを処理してパディングを除去
///
/// 戻り値はフロー制御用に (データ, パディング消費分) を返します。
/// パディング長がペイロードを超える場合は PROTOCOL_ERROR (RFC 7540 Section 6.1)。
fn strip_padding<'a>(header: &FrameHeader, payload: &'a [u8]) -> Http2Result<(&'a [u8], u32)> {
    if !header.is_padded() {
        return Ok((payload, 0));
    }

    let Some(&pad) = payload.first() else {
        return Err(Http2Error::protocol("PADDED frame without pad length"));
    };
    let pad = pad as usize;

    if pad + 1 > payload.len() {
        return Err(Http2Error::protocol("pad length exceeds frame payload"));
    }

    Ok((&payload[1..payload.len() - pad], pad as u32 + 1))
}

fn parse_priority(body: &[u8]) -> PrioritySpec {
    let word = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    PrioritySpec {
        dependency: word & 0x7FFF_FFFF,
        exclusive: word & 0x8000_0000 != 0,
        weight: body[4] as u16 + 1,
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(16384)
    }
}
