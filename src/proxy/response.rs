//! # ゲートウェイレスポンス
//!
//! フィルタと内部生成 (5xx / リダイレクト) が扱うレスポンス表現。
//! バックエンドからのボディはパイプラインがストリームで中継するため、
//! ここに現れるボディは内部生成分だけです。

/// サーバー名ヘッダーの値
pub const SERVER_NAME: &[u8] = b"sekisho";

/// レスポンス (ヘッダー部 + 内部生成ボディ)
pub struct GatewayResponse {
    pub status: u16,
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
    pub body: Vec<u8>,
}

impl GatewayResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: vec![(b"server".to_vec(), SERVER_NAME.to_vec())],
            body: Vec::new(),
        }
    }

    pub fn with_body(status: u16, body: impl Into<Vec<u8>>) -> Self {
        let mut res = Self::new(status);
        res.body = body.into();
        res
    }

    /// ルーティング・バックエンド失敗時の 500
    pub fn internal_error() -> Self {
        Self::new(500)
    }

    /// 502 Bad Gateway
    pub fn bad_gateway() -> Self {
        Self::new(502)
    }

    /// 504 Gateway Timeout
    pub fn gateway_timeout() -> Self {
        Self::new(504)
    }

    /// リダイレクト応答
    pub fn redirect(code: u16, url: &str) -> Self {
        let mut res = Self::new(code);
        res.headers.push((b"location".to_vec(), url.as_bytes().to_vec()));
        res
    }

    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.as_slice() == name)
            .map(|(_, v)| v.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_header_present() {
        let res = GatewayResponse::internal_error();
        assert_eq!(res.status, 500);
        assert_eq!(res.header(b"server"), Some(SERVER_NAME));
    }

    #[test]
    fn test_redirect_location() {
        let res = GatewayResponse::redirect(302, "https://example.com/next");
        assert_eq!(res.status, 302);
        assert_eq!(
            res.header(b"location"),
            Some(b"https://example.com/next".as_ref())
        );
    }
}
