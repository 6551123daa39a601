//! # ゲートウェイリクエスト
//!
//! プロトコル層 (HTTP/1, HTTP/2) からデコード済みのリクエストを受け取り、
//! ルーティング・バランシング・転送の全段が参照する 1 つの文脈として
//! 持ち回ります。

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::balance::backend::Backend;
use crate::http2::hpack::HeaderField;

/// 転送系ヘッダー名
pub const HEADER_FORWARDED_FOR: &str = "X-Forwarded-For";
pub const HEADER_FORWARDED_PORT: &str = "X-Forwarded-Port";
pub const HEADER_REAL_IP: &str = "X-Real-Ip";
pub const HEADER_REAL_PORT: &str = "X-Real-Port";
pub const HEADER_BFE_IP: &str = "X-Bfe-Ip";
pub const HEADER_BFE_LOG_ID: &str = "X-Bfe-Log-Id";

static NEXT_LOG_ID: AtomicU64 = AtomicU64::new(1);

/// リクエストの終端エラーコード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqErr {
    /// プロダクトが見つからない
    NoProduct,
    /// プロダクトにルール表が無い
    NoProductRule,
    /// どのルールにも一致しない
    NoRuleMatch,
    /// クラスタ記述子が無い
    NoCluster,
    /// バランサが選択できない
    NoBalance,
    /// バックエンド接続失敗
    ConnectBackend,
    /// リクエスト書き込み失敗
    WriteRequest,
    /// レスポンスヘッダー読み取り失敗
    ReadRespHeader,
    /// レスポンスヘッダータイムアウト
    RespHeaderTimeout,
    /// トランスポート切断
    TransportBroken,
    /// クライアントへの書き込み失敗
    ClientWrite,
}

impl std::fmt::Display for ReqErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NoProduct => "NO_PRODUCT",
            Self::NoProductRule => "NO_PRODUCT_RULE",
            Self::NoRuleMatch => "NO_RULE_MATCH",
            Self::NoCluster => "NO_CLUSTER",
            Self::NoBalance => "NO_BALANCE",
            Self::ConnectBackend => "CONNECT_BACKEND",
            Self::WriteRequest => "WRITE_REQUEST",
            Self::ReadRespHeader => "READ_RESP_HEADER",
            Self::RespHeaderTimeout => "RESP_HEADER_TIMEOUT",
            Self::TransportBroken => "TRANSPORT_BROKEN",
            Self::ClientWrite => "CLIENT_WRITE",
        };
        f.write_str(s)
    }
}

/// ルーティング結果
#[derive(Debug, Default, Clone)]
pub struct RouteInfo {
    pub host_tag: String,
    pub product: String,
    pub cluster_name: String,
}

/// 時刻マーク
#[derive(Debug, Clone)]
pub struct RequestStat {
    pub request_start: Instant,
    /// 最初のバックエンド試行開始
    pub backend_first: Option<Instant>,
    /// 最後のバックエンド応答 (またはエラー) 時刻
    pub backend_end: Option<Instant>,
    /// クライアントへの応答送出開始
    pub response_start: Option<Instant>,
    /// クラスタ跨ぎのリトライが発生したか
    pub cross_cluster: bool,
}

impl Default for RequestStat {
    fn default() -> Self {
        Self {
            request_start: Instant::now(),
            backend_first: None,
            backend_end: None,
            response_start: None,
            cross_cluster: false,
        }
    }
}

/// ゲートウェイを通過する 1 リクエスト
pub struct GatewayRequest {
    /// リクエストメソッド (大文字)
    pub method: String,
    /// パス + クエリ
    pub uri: String,
    /// "https" / "http"
    pub scheme: String,
    /// ポートを除いた小文字ホスト名
    pub host: String,
    /// クライアントプロトコル ("HTTP/2.0" など)
    pub proto: &'static str,
    /// 通常ヘッダー (名前は小文字)
    pub headers: Vec<HeaderField>,
    pub body: Vec<u8>,

    /// 直接の対向アドレス
    pub peer_ip: IpAddr,
    pub peer_port: u16,
    /// 信頼プロキシ経由の場合の実クライアント
    pub client_ip: IpAddr,
    pub client_port: u16,
    /// 対向が信頼プロキシ集合に含まれるか
    pub cip_trusted: bool,

    /// 終端したコネクションの宛先 (VIP)
    pub vip: Option<IpAddr>,
    pub vip_port: u16,

    pub route: RouteInfo,
    /// 選択済みバックエンド
    pub backend: Option<Arc<Backend>>,
    /// 総リトライ回数 (クラスタ内 + クラスタ跨ぎ)
    pub retry_count: u32,

    pub stat: RequestStat,
    pub err_code: Option<ReqErr>,
    pub err_msg: String,
    pub log_id: u64,
}

impl GatewayRequest {
    pub fn new(
        method: String,
        uri: String,
        scheme: String,
        host: String,
        proto: &'static str,
        headers: Vec<HeaderField>,
        body: Vec<u8>,
        peer_ip: IpAddr,
        peer_port: u16,
    ) -> Self {
        Self {
            method,
            uri,
            scheme,
            host: normalize_host(&host),
            proto,
            headers,
            body,
            peer_ip,
            peer_port,
            client_ip: peer_ip,
            client_port: peer_port,
            cip_trusted: false,
            vip: None,
            vip_port: 0,
            route: RouteInfo::default(),
            backend: None,
            retry_count: 0,
            stat: RequestStat::default(),
            err_code: None,
            err_msg: String::new(),
            log_id: NEXT_LOG_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// クエリを除いたパス
    pub fn path(&self) -> &str {
        match self.uri.find('?') {
            Some(i) => &self.uri[..i],
            None => &self.uri,
        }
    }

    /// クエリ文字列 ('?' を除く)
    pub fn query(&self) -> &str {
        match self.uri.find('?') {
            Some(i) => &self.uri[i + 1..],
            None => "",
        }
    }

    /// クエリを key=value 組へ分解する
    pub fn query_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.query().split('&').filter(|kv| !kv.is_empty()).map(|kv| {
            match kv.find('=') {
                Some(i) => (&kv[..i], &kv[i + 1..]),
                None => (kv, ""),
            }
        })
    }

    /// ヘッダー値を取得 (名前は小文字で照合)
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        let lower = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|h| h.name == lower.as_bytes())
            .map(|h| h.value.as_slice())
    }

    /// Cookie 値を取得
    pub fn cookie(&self, key: &str) -> Option<&str> {
        let cookies = self.header("cookie")?;
        let cookies = std::str::from_utf8(cookies).ok()?;
        for part in cookies.split(';') {
            let part = part.trim();
            if let Some(i) = part.find('=') {
                if &part[..i] == key {
                    return Some(&part[i + 1..]);
                }
            }
        }
        None
    }

    /// エラーコードとメッセージを記録する
    pub fn set_error(&mut self, code: ReqErr, msg: impl Into<String>) {
        self.err_code = Some(code);
        self.err_msg = msg.into();
    }

    /// リトライで成功した場合に以前のエラーを消す
    pub fn clear_error(&mut self) {
        self.err_code = None;
        self.err_msg.clear();
    }
}

/// ホスト名の正規化: ":port" を除去して小文字へ
pub fn normalize_host(host: &str) -> String {
    let stripped = match host.rfind(':') {
        // IPv6 リテラル "[::1]:443" は ']' より後のコロンのみポート区切り
        Some(i) if !host[i..].contains(']') => &host[..i],
        _ => host,
    };
    stripped.to_ascii_lowercase()
}
