//! # プロキシ層
//!
//! リクエスト文脈・転送パイプライン・バックエンドトランスポート・
//! HTTP/1.1 エッジ・ステータスエンドポイント。

pub mod http1;
pub mod pipeline;
pub mod request;
pub mod response;
pub mod status;
pub mod upstream;

pub use pipeline::{Gateway, GatewayConn};
pub use request::GatewayRequest;
pub use response::GatewayResponse;
