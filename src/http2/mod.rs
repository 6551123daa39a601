//! # HTTP/2 サーバーエンジン (RFC 7540 / RFC 7541)
//!
//! フレーム層・HPACK・ストリーム状態機械・コネクション駆動からなる
//! 自前の HTTP/2 実装です。

pub mod connection;
pub mod error;
pub mod frame;
pub mod hpack;
pub mod settings;
pub mod stream;

pub use connection::{ConnAction, Http2Connection, Http2Handler};
pub use error::{ErrorCode, Http2Error, Http2Result};
pub use settings::Http2Settings;
