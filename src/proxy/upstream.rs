//! # バックエンドトランスポート (HTTP/1.1)
//!
//! バックエンドへの接続・リクエスト送信・レスポンスヘッダー読み取り・ボディの
//! ストリーム読み出しを担います。エラーはリトライ判定のために発生段階で
//! 分類されます。
//!
//! コネクションはスレッドローカルのプールで再利用します。monoio は
//! thread-per-core なのでプールに同期は不要です。

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::TcpStream;
use monoio::time::timeout;

use crate::proxy::request::ReqErr;

/// レスポンスヘッダーの最大サイズ
const MAX_RESP_HEADER_SIZE: usize = 65536;
/// ボディ読み出しの単位
const BODY_CHUNK_SIZE: usize = 65536;
/// プール内アイドル接続の寿命
const POOL_IDLE_TIMEOUT_SECS: u64 = 30;

/// 転送エラーの分類
#[derive(Debug)]
pub enum UpstreamError {
    /// 接続失敗 (常にリトライ可)
    Connect(String),
    /// リクエスト書き込み失敗
    WriteRequest(String),
    /// レスポンスヘッダー読み取り失敗
    ReadRespHeader(String),
    /// レスポンスヘッダータイムアウト
    RespHeaderTimeout,
    /// ボディ転送中の切断
    TransportBroken(String),
}

impl UpstreamError {
    pub fn req_err(&self) -> ReqErr {
        match self {
            Self::Connect(_) => ReqErr::ConnectBackend,
            Self::WriteRequest(_) => ReqErr::WriteRequest,
            Self::ReadRespHeader(_) => ReqErr::ReadRespHeader,
            Self::RespHeaderTimeout => ReqErr::RespHeaderTimeout,
            Self::TransportBroken(_) => ReqErr::TransportBroken,
        }
    }

    /// 接続段階の失敗か (接続失敗はバックエンドにバイトが届いていない)
    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Connect(_))
    }
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(e) => write!(f, "connect backend: {}", e),
            Self::WriteRequest(e) => write!(f, "write request: {}", e),
            Self::ReadRespHeader(e) => write!(f, "read response header: {}", e),
            Self::RespHeaderTimeout => f.write_str("response header timeout"),
            Self::TransportBroken(e) => write!(f, "transport broken: {}", e),
        }
    }
}

impl std::error::Error for UpstreamError {}

// ====================
// コネクションプール
// ====================

struct PooledConn {
    stream: TcpStream,
    pooled_at: Instant,
}

thread_local! {
    static POOL: RefCell<HashMap<String, VecDeque<PooledConn>>> =
        RefCell::new(HashMap::new());
}

fn pool_get(key: &str) -> Option<TcpStream> {
    POOL.with(|p| {
        let mut pool = p.borrow_mut();
        let queue = pool.get_mut(key)?;
        while let Some(entry) = queue.pop_front() {
            if entry.pooled_at.elapsed().as_secs() < POOL_IDLE_TIMEOUT_SECS {
                return Some(entry.stream);
            }
        }
        None
    })
}

fn pool_put(key: &str, stream: TcpStream, max_idle: usize) {
    if max_idle == 0 {
        return;
    }
    POOL.with(|p| {
        let mut pool = p.borrow_mut();
        let queue = pool.entry(key.to_string()).or_default();
        while queue.len() >= max_idle {
            queue.pop_front();
        }
        queue.push_back(PooledConn {
            stream,
            pooled_at: Instant::now(),
        });
    });
}

// ====================
// ラウンドトリップ
// ====================

/// バックエンドレスポンスのボディ形式
enum Framing {
    /// content-length 指定。残りバイト数を保持。
    Sized(u64),
    /// chunked 転送
    Chunked,
    /// 終端まで読む (コネクションは再利用不可)
    Eof,
}

/// バックエンドレスポンス
///
/// ヘッダーは読み取り済み。ボディは `next_chunk` で順に取り出します。
pub struct BackendResponse {
    pub status: u16,
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
    stream: TcpStream,
    /// ヘッダー読み取り時に先読みした分
    buffered: Vec<u8>,
    framing: Framing,
    keep_alive: bool,
    /// プール返却用のキーと上限
    pool_key: String,
    max_idle: usize,
    done: bool,
    /// 最終レスポンスの前に受信した 1xx ステータス列
    interim_statuses: Vec<u16>,
}

impl BackendResponse {
    /// ボディの次のチャンクを読む。終端で None。
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, UpstreamError> {
        if self.done {
            return Ok(None);
        }
        match self.framing {
            Framing::Sized(0) => {
                self.finish();
                Ok(None)
            }
            Framing::Sized(remaining) => {
                let chunk = self.read_some(remaining.min(BODY_CHUNK_SIZE as u64) as usize).await?;
                match chunk {
                    Some(data) => {
                        let rest = remaining - data.len() as u64;
                        self.framing = Framing::Sized(rest);
                        if rest == 0 {
                            self.finish();
                        }
                        Ok(Some(data))
                    }
                    None => Err(UpstreamError::TransportBroken(
                        "backend closed before content-length".into(),
                    )),
                }
            }
            Framing::Chunked => self.next_chunked().await,
            Framing::Eof => {
                let chunk = self.read_some(BODY_CHUNK_SIZE).await?;
                if chunk.is_none() {
                    self.keep_alive = false;
                    self.done = true;
                }
                Ok(chunk)
            }
        }
    }

    /// chunked ボディのデコード
    async fn next_chunked(&mut self) -> Result<Option<Vec<u8>>, UpstreamError> {
        // チャンクサイズ行を読む
        let line = self.read_line().await?;
        let size_str = match line.iter().position(|&b| b == b';') {
            Some(i) => &line[..i],
            None => &line[..],
        };
        let size = usize::from_str_radix(
            std::str::from_utf8(size_str).unwrap_or("").trim(),
            16,
        )
        .map_err(|_| UpstreamError::TransportBroken("invalid chunk size".into()))?;

        if size == 0 {
            // 終端チャンク: トレーラー行を CRLF まで読み捨てる
            loop {
                let trailer = self.read_line().await?;
                if trailer.is_empty() {
                    break;
                }
            }
            self.finish();
            return Ok(None);
        }

        let mut data = Vec::with_capacity(size);
        while data.len() < size {
            let want = size - data.len();
            match self.read_some(want.min(BODY_CHUNK_SIZE)).await? {
                Some(mut part) => data.append(&mut part),
                None => {
                    return Err(UpstreamError::TransportBroken(
                        "backend closed mid-chunk".into(),
                    ))
                }
            }
        }
        // チャンク末尾の CRLF
        let crlf = self.read_line().await?;
        if !crlf.is_empty() {
            return Err(UpstreamError::TransportBroken("missing chunk CRLF".into()));
        }
        Ok(Some(data))
    }

    /// 先読みバッファまたはソケットから最大 want バイト読む
    async fn read_some(&mut self, want: usize) -> Result<Option<Vec<u8>>, UpstreamError> {
        if !self.buffered.is_empty() {
            let take = want.min(self.buffered.len());
            let rest = self.buffered.split_off(take);
            let head = std::mem::replace(&mut self.buffered, rest);
            return Ok(Some(head));
        }

        let buf = vec![0u8; want.min(BODY_CHUNK_SIZE)];
        let (result, buf) = self.stream.read(buf).await;
        match result {
            Ok(0) => Ok(None),
            Ok(n) => Ok(Some(buf[..n].to_vec())),
            Err(e) => Err(UpstreamError::TransportBroken(e.to_string())),
        }
    }

    /// CRLF 終端の 1 行を読む (終端の CRLF は含まない)
    async fn read_line(&mut self) -> Result<Vec<u8>, UpstreamError> {
        let mut line = Vec::new();
        loop {
            if let Some(i) = self.buffered.iter().position(|&b| b == b'\n') {
                line.extend_from_slice(&self.buffered[..i]);
                self.buffered.drain(..=i);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(line);
            }
            if self.buffered.len() > MAX_RESP_HEADER_SIZE {
                return Err(UpstreamError::TransportBroken("chunk line too long".into()));
            }

            let buf = vec![0u8; 4096];
            let (result, buf) = self.stream.read(buf).await;
            match result {
                Ok(0) => {
                    return Err(UpstreamError::TransportBroken(
                        "backend closed mid-line".into(),
                    ))
                }
                Ok(n) => self.buffered.extend_from_slice(&buf[..n]),
                Err(e) => return Err(UpstreamError::TransportBroken(e.to_string())),
            }
        }
    }

    fn finish(&mut self) {
        self.done = true;
    }

    /// ボディを最後まで読み終えた接続をプールへ返す
    ///
    /// クライアント切断などで中断した場合は呼ばずに破棄すること。
    pub fn release(self) {
        if self.done && self.keep_alive && self.buffered.is_empty() {
            pool_put(&self.pool_key, self.stream, self.max_idle);
        }
    }

    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    /// 最終レスポンスの前に受信した 1xx ステータス列
    pub fn interim_statuses(&self) -> &[u16] {
        &self.interim_statuses
    }
}

/// ラウンドトリップのパラメータ
pub struct RoundTripArgs<'a> {
    pub addr: String,
    /// 組み立て済みのリクエストヘッダー部 + ボディ
    pub request_bytes: Vec<u8>,
    pub method: &'a str,
    pub connect_timeout: Duration,
    pub response_header_timeout: Duration,
    pub max_idle_conns: usize,
}

/// バックエンドへの 1 往復を実行する
///
/// 成功時はヘッダー読み取りまで完了した `BackendResponse` を返します。
pub async fn round_trip(args: RoundTripArgs<'_>) -> Result<BackendResponse, UpstreamError> {
    let reused = pool_get(&args.addr);
    let from_pool = reused.is_some();

    let mut stream = match reused {
        Some(stream) => stream,
        None => {
            let connected = timeout(args.connect_timeout, TcpStream::connect(&args.addr)).await;
            match connected {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    stream
                }
                Ok(Err(e)) => return Err(UpstreamError::Connect(e.to_string())),
                Err(_) => return Err(UpstreamError::Connect("connect timeout".into())),
            }
        }
    };

    // リクエスト送信
    let (result, _) = stream.write_all(args.request_bytes).await;
    if let Err(e) = result {
        // プール再利用の接続が腐っていた場合も書き込み失敗として分類される
        return Err(if from_pool {
            UpstreamError::Connect(format!("pooled connection dead: {}", e))
        } else {
            UpstreamError::WriteRequest(e.to_string())
        });
    }

    // レスポンスヘッダー受信。1xx 中間レスポンス (101 を除く) は控えて
    // 最終レスポンスまで読み進める (RFC 7231 Section 6.2)。
    let mut interim_statuses = Vec::new();
    let mut carry: Vec<u8> = Vec::new();
    let (status, headers, buffered) = loop {
        let head = match timeout(
            args.response_header_timeout,
            read_response_head(&mut stream, std::mem::take(&mut carry)),
        )
        .await
        {
            Ok(Ok(head)) => head,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(UpstreamError::RespHeaderTimeout),
        };

        if (100..200).contains(&head.0) && head.0 != 101 {
            interim_statuses.push(head.0);
            carry = head.2;
            continue;
        }
        break head;
    };

    // ボディ形式の決定 (RFC 7230 Section 3.3.3)
    let no_body = args.method == "HEAD"
        || status / 100 == 1
        || status == 204
        || status == 304;
    let framing = if no_body {
        Framing::Sized(0)
    } else if header_value(&headers, b"transfer-encoding")
        .map(|v| v.to_ascii_lowercase().windows(7).any(|w| w == b"chunked"))
        .unwrap_or(false)
    {
        Framing::Chunked
    } else if let Some(len) = header_value(&headers, b"content-length")
        .and_then(|v| std::str::from_utf8(v).ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
    {
        Framing::Sized(len)
    } else {
        Framing::Eof
    };

    let keep_alive = header_value(&headers, b"connection")
        .map(|v| !v.eq_ignore_ascii_case(b"close"))
        .unwrap_or(true)
        && !matches!(framing, Framing::Eof);

    let done = matches!(framing, Framing::Sized(0));

    Ok(BackendResponse {
        status,
        headers,
        stream,
        buffered,
        framing,
        keep_alive,
        pool_key: args.addr,
        max_idle: args.max_idle_conns,
        done,
        interim_statuses,
    })
}

/// レスポンスヘッダーを読み取り (status, headers, 先読み分) を返す
async fn read_response_head(
    stream: &mut TcpStream,
    carry: Vec<u8>,
) -> Result<(u16, Vec<(Vec<u8>, Vec<u8>)>, Vec<u8>), UpstreamError> {
    // 1xx の読み越し分 (carry) に完全なレスポンスが含まれていることがある
    let mut acc: Vec<u8> = carry;
    let mut try_parse_first = !acc.is_empty();

    loop {
        if !try_parse_first {
            let buf = vec![0u8; 4096];
            let (result, buf) = stream.read(buf).await;
            match result {
                Ok(0) => {
                    return Err(UpstreamError::ReadRespHeader(
                        "backend closed before response header".into(),
                    ))
                }
                Ok(n) => acc.extend_from_slice(&buf[..n]),
                Err(e) => return Err(UpstreamError::ReadRespHeader(e.to_string())),
            }
        }
        try_parse_first = false;

        let mut header_storage = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Response::new(&mut header_storage);
        match parsed.parse(&acc) {
            Ok(httparse::Status::Complete(used)) => {
                let status = parsed.code.unwrap_or(502);
                let headers: Vec<(Vec<u8>, Vec<u8>)> = parsed
                    .headers
                    .iter()
                    .map(|h| (h.name.as_bytes().to_ascii_lowercase(), h.value.to_vec()))
                    .collect();
                let rest = acc[used..].to_vec();
                return Ok((status, headers, rest));
            }
            Ok(httparse::Status::Partial) => {
                if acc.len() > MAX_RESP_HEADER_SIZE {
                    return Err(UpstreamError::ReadRespHeader(
                        "response header too large".into(),
                    ));
                }
            }
            Err(e) => return Err(UpstreamError::ReadRespHeader(e.to_string())),
        }
    }
}

fn header_value<'a>(headers: &'a [(Vec<u8>, Vec<u8>)], name: &[u8]) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|(n, _)| n.as_slice() == name)
        .map(|(_, v)| v.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(
            UpstreamError::Connect("x".into()).req_err(),
            ReqErr::ConnectBackend
        );
        assert_eq!(
            UpstreamError::WriteRequest("x".into()).req_err(),
            ReqErr::WriteRequest
        );
        assert_eq!(
            UpstreamError::ReadRespHeader("x".into()).req_err(),
            ReqErr::ReadRespHeader
        );
        assert_eq!(
            UpstreamError::RespHeaderTimeout.req_err(),
            ReqErr::RespHeaderTimeout
        );
        assert_eq!(
            UpstreamError::TransportBroken("x".into()).req_err(),
            ReqErr::TransportBroken
        );
        assert!(UpstreamError::Connect("x".into()).is_connect());
        assert!(!UpstreamError::RespHeaderTimeout.is_connect());
    }
}
