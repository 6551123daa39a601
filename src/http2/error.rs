//! # HTTP/2 エラー定義 (RFC 7540 Section 7)
//!
//! エラーコードと、ストリームエラー / コネクションエラーの二分類を提供します。
//! ストリームエラーは RST_STREAM を送信してストリームを破棄し、
//! コネクションエラーは GOAWAY を送信してコネクションを閉じます。

use std::fmt;
use std::io;

/// エラーコード (RFC 7540 Section 7)
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x2 => Self::InternalError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            // 未知のコードは内部エラー扱い (RFC 7540 Section 7)
            _ => Self::InternalError,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoError => "NO_ERROR",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
            Self::FlowControlError => "FLOW_CONTROL_ERROR",
            Self::SettingsTimeout => "SETTINGS_TIMEOUT",
            Self::StreamClosed => "STREAM_CLOSED",
            Self::FrameSizeError => "FRAME_SIZE_ERROR",
            Self::RefusedStream => "REFUSED_STREAM",
            Self::Cancel => "CANCEL",
            Self::CompressionError => "COMPRESSION_ERROR",
            Self::ConnectError => "CONNECT_ERROR",
            Self::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            Self::InadequateSecurity => "INADEQUATE_SECURITY",
            Self::Http11Required => "HTTP_1_1_REQUIRED",
        };
        f.write_str(name)
    }
}

/// HTTP/2 処理エラー
#[derive(Debug)]
pub enum Http2Error {
    /// コネクションエラー (GOAWAY を送信して終了)
    Connection(ErrorCode, String),
    /// ストリームエラー (RST_STREAM を送信)
    Stream(u32, ErrorCode, String),
    /// トランスポート I/O エラー
    Io(io::Error),
    /// クライアントプリフェース不正
    BadPreface,
    /// 読み書きタイムアウト
    Timeout(&'static str),
    /// ピアがコネクションを閉じた
    ConnectionClosed,
}

impl fmt::Display for Http2Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(code, msg) => write!(f, "connection error {}: {}", code, msg),
            Self::Stream(id, code, msg) => {
                write!(f, "stream {} error {}: {}", id, code, msg)
            }
            Self::Io(e) => write!(f, "io error: {}", e),
            Self::BadPreface => f.write_str("invalid connection preface"),
            Self::Timeout(what) => write!(f, "timeout: {}", what),
            Self::ConnectionClosed => f.write_str("connection closed by peer"),
        }
    }
}

impl std::error::Error for Http2Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Http2Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl Http2Error {
    pub fn conn<S: Into<String>>(code: ErrorCode, msg: S) -> Self {
        Self::Connection(code, msg.into())
    }

    pub fn stream<S: Into<String>>(stream_id: u32, code: ErrorCode, msg: S) -> Self {
        Self::Stream(stream_id, code, msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::Connection(ErrorCode::ProtocolError, msg.into())
    }

    pub fn frame_size<S: Into<String>>(msg: S) -> Self {
        Self::Connection(ErrorCode::FrameSizeError, msg.into())
    }

    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Connection(ErrorCode::CompressionError, msg.into())
    }

    pub fn flow_control<S: Into<String>>(msg: S) -> Self {
        Self::Connection(ErrorCode::FlowControlError, msg.into())
    }

    /// GOAWAY を送るべきエラーか
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection(..) | Self::BadPreface | Self::Timeout(_)
        )
    }

    /// RST_STREAM を送るべきストリーム ID
    pub fn rst_stream_id(&self) -> Option<u32> {
        match self {
            Self::Stream(id, _, _) => Some(*id),
            _ => None,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Connection(code, _) | Self::Stream(_, code, _) => *code,
            Self::Io(_) => ErrorCode::InternalError,
            Self::BadPreface => ErrorCode::ProtocolError,
            Self::Timeout(_) => ErrorCode::ProtocolError,
            Self::ConnectionClosed => ErrorCode::NoError,
        }
    }
}

pub type Http2Result<T> = Result<T, Http2Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_roundtrip() {
        for code in 0u32..=0xd {
            assert_eq!(ErrorCode::from_u32(code) as u32, code);
        }
        // 未知のコードは INTERNAL_ERROR に落ちる
        assert_eq!(ErrorCode::from_u32(0xFF), ErrorCode::InternalError);
    }

    #[test]
    fn test_classification() {
        let ce = Http2Error::protocol("bad frame");
        assert!(ce.is_connection_error());
        assert_eq!(ce.rst_stream_id(), None);
        assert_eq!(ce.error_code(), ErrorCode::ProtocolError);

        let se = Http2Error::stream(5, ErrorCode::StreamClosed, "late frame");
        assert!(!se.is_connection_error());
        assert_eq!(se.rst_stream_id(), Some(5));
        assert_eq!(se.error_code(), ErrorCode::StreamClosed);
    }

    #[test]
    fn test_display_names() {
        assert_eq!(ErrorCode::EnhanceYourCalm.to_string(), "ENHANCE_YOUR_CALM");
        assert_eq!(ErrorCode::FlowControlError.to_string(), "FLOW_CONTROL_ERROR");
    }
}
