//! # HTTP/1.1 クライアントエッジ
//!
//! ALPN で h2 にならなかったコネクションを処理します。パースは httparse に
//! 任せ、組み立てたリクエストは HTTP/2 と同じパイプラインへ流します。
//! keep-alive 時の次リクエスト待ちにはクラスタ設定の
//! timeout_read_client_again を使います。

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::http2::hpack::HeaderField;
use crate::net::AsyncStream;
use crate::proxy::pipeline::{self, Gateway, Reply};
use crate::proxy::request::{GatewayRequest, ReqErr};
use crate::proxy::response::GatewayResponse;

/// 最初のリクエストヘッダー待ちと読み取りの上限
const FIRST_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// リクエストヘッダーの最大サイズ
const MAX_HEADER_SIZE: usize = 65536;
/// リクエストボディの最大サイズ
const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// HTTP/1.1 コネクションを駆動する
///
/// `initial` はプロトコル判定で先読みされたバイト列。
pub async fn serve<S: AsyncStream>(
    mut stream: S,
    gw: Arc<Gateway>,
    peer_ip: IpAddr,
    peer_port: u16,
    vip: Option<IpAddr>,
    vip_port: u16,
    scheme: &'static str,
    initial: Vec<u8>,
) {
    let mut carry: Vec<u8> = initial;
    let mut read_timeout = FIRST_READ_TIMEOUT;

    loop {
        let parsed = match monoio::time::timeout(
            read_timeout,
            read_request(&mut stream, std::mem::take(&mut carry)),
        )
        .await
        {
            Ok(Ok(Some(parsed))) => parsed,
            // ピアが静かに閉じた / タイムアウト: そのまま終了
            Ok(Ok(None)) | Err(_) => return,
            Ok(Err(status)) => {
                let res = GatewayResponse::new(status);
                let _ = write_response(&mut stream, &res, true).await;
                return;
            }
        };

        let ParsedRequest {
            method,
            uri,
            headers,
            body,
            rest,
            wants_close,
        } = parsed;
        carry = rest;

        let host = headers
            .iter()
            .find(|h| h.name == b"host")
            .map(|h| String::from_utf8_lossy(&h.value).into_owned())
            .unwrap_or_default();

        let mut req = GatewayRequest::new(
            method, uri, scheme.to_string(), host, "HTTP/1.1", headers, body, peer_ip,
            peer_port,
        );
        req.vip = vip;
        req.vip_port = vip_port;

        let output = pipeline::run(&gw, &mut req).await;
        req.stat.response_start = Some(std::time::Instant::now());

        let write_timeout = output
            .cluster
            .as_ref()
            .map(|c| c.params.timeout_write_client)
            .unwrap_or(FIRST_READ_TIMEOUT);
        // 次のリクエストの読み取り猶予
        read_timeout = output
            .cluster
            .as_ref()
            .map(|c| c.params.timeout_read_client_again)
            .unwrap_or(FIRST_READ_TIMEOUT);

        let close_after = output.close_after || wants_close;

        match output.reply {
            Reply::None => {
                pipeline::finish(&gw, &mut req, &mut GatewayResponse::new(0));
                return;
            }
            Reply::Full(mut res) => {
                let write = write_response(&mut stream, &res, close_after);
                let ok = matches!(monoio::time::timeout(write_timeout, write).await, Ok(Ok(())));
                if !ok {
                    req.set_error(ReqErr::ClientWrite, "write response to client failed");
                }
                pipeline::finish(&gw, &mut req, &mut res);
                if !ok || close_after {
                    return;
                }
            }
            Reply::Streamed(mut head, mut body) => {
                let result = monoio::time::timeout(
                    write_timeout,
                    stream_response(&mut stream, &mut head, &mut body, close_after),
                )
                .await;

                match result {
                    Ok(Ok(())) => {
                        body.release();
                        pipeline::finish(&gw, &mut req, &mut head);
                        if close_after {
                            return;
                        }
                    }
                    _ => {
                        req.set_error(ReqErr::ClientWrite, "write response body failed");
                        pipeline::finish(&gw, &mut req, &mut head);
                        return;
                    }
                }
            }
        }
    }
}

struct ParsedRequest {
    method: String,
    uri: String,
    headers: Vec<HeaderField>,
    body: Vec<u8>,
    /// 次のリクエストの読み越し分
    rest: Vec<u8>,
    wants_close: bool,
}

/// リクエストを 1 件読み取る
///
/// 戻り値: Ok(Some) 成功 / Ok(None) ピアのクローズ / Err(status) 4xx で拒否
async fn read_request<S: AsyncStream>(
    stream: &mut S,
    carry: Vec<u8>,
) -> Result<Option<ParsedRequest>, u16> {
    let mut acc = carry;
    let mut try_parse_first = !acc.is_empty();

    let (method, uri, headers, used, wants_close, content_length, chunked) = loop {
        if !try_parse_first {
            let buf = vec![0u8; 8192];
            let (result, buf) = stream.read_buf(buf).await;
            match result {
                Ok(0) => {
                    if acc.is_empty() {
                        return Ok(None);
                    }
                    return Err(400);
                }
                Ok(n) => acc.extend_from_slice(&buf[..n]),
                Err(_) => return Ok(None),
            }
        }
        try_parse_first = false;

        let mut header_storage = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Request::new(&mut header_storage);
        match parsed.parse(&acc) {
            Ok(httparse::Status::Complete(used)) => {
                let method = parsed.method.unwrap_or("GET").to_string();
                let uri = parsed.path.unwrap_or("/").to_string();

                let mut wants_close = parsed.version == Some(0);
                let mut content_length = 0usize;
                let mut chunked = false;
                let mut headers = Vec::with_capacity(parsed.headers.len());
                for h in parsed.headers.iter() {
                    let name = h.name.as_bytes().to_ascii_lowercase();
                    match name.as_slice() {
                        b"connection" => {
                            if h.value.eq_ignore_ascii_case(b"close") {
                                wants_close = true;
                            }
                        }
                        b"content-length" => {
                            content_length = std::str::from_utf8(h.value)
                                .ok()
                                .and_then(|s| s.trim().parse().ok())
                                .ok_or(400u16)?;
                        }
                        b"transfer-encoding" => {
                            chunked = true;
                        }
                        _ => {}
                    }
                    headers.push(HeaderField::new(name, h.value.to_vec()));
                }

                break (method, uri, headers, used, wants_close, content_length, chunked);
            }
            Ok(httparse::Status::Partial) => {
                if acc.len() > MAX_HEADER_SIZE {
                    return Err(431);
                }
            }
            Err(_) => return Err(400),
        }
    };

    // chunked リクエストボディは受けない (上流へは常に content-length で送るため)
    if chunked {
        return Err(411);
    }
    if content_length > MAX_BODY_SIZE {
        return Err(413);
    }

    let mut body = acc[used..].to_vec();
    while body.len() < content_length {
        let buf = vec![0u8; 16384];
        let (result, buf) = stream.read_buf(buf).await;
        match result {
            Ok(0) => return Err(400),
            Ok(n) => body.extend_from_slice(&buf[..n]),
            Err(_) => return Err(400),
        }
    }
    let rest = body.split_off(content_length.min(body.len()));

    Ok(Some(ParsedRequest {
        method,
        uri,
        headers,
        body,
        rest,
        wants_close,
    }))
}

/// ステータスコードの標準句
fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        411 => "Length Required",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

/// ヘッダー部を組み立てる
fn encode_head(res: &GatewayResponse, close: bool, body_len: Option<usize>) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    let mut int_buf = itoa::Buffer::new();

    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(int_buf.format(res.status).as_bytes());
    out.push(b' ');
    out.extend_from_slice(reason_phrase(res.status).as_bytes());
    out.extend_from_slice(b"\r\n");

    for (name, value) in &res.headers {
        // 接続管理とボディ長はこちらで決める
        if name.as_slice() == b"connection" || name.as_slice() == b"content-length" {
            continue;
        }
        out.extend_from_slice(name);
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }

    match body_len {
        Some(len) => {
            out.extend_from_slice(b"Content-Length: ");
            out.extend_from_slice(itoa::Buffer::new().format(len).as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        None => {
            out.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
    }

    if close {
        out.extend_from_slice(b"Connection: close\r\n");
    } else {
        out.extend_from_slice(b"Connection: keep-alive\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// 完結レスポンスを書く
async fn write_response<S: AsyncStream>(
    stream: &mut S,
    res: &GatewayResponse,
    close: bool,
) -> Result<(), ()> {
    let mut bytes = encode_head(res, close, Some(res.body.len()));
    bytes.extend_from_slice(&res.body);
    let (result, _) = stream.write_all_buf(bytes).await;
    result.map(|_| ()).map_err(|_| ())
}

/// バックエンドボディをストリーム中継する
///
/// content-length が分かればそのまま、無ければ chunked で送ります。
async fn stream_response<S: AsyncStream>(
    stream: &mut S,
    head: &GatewayResponse,
    body: &mut crate::proxy::upstream::BackendResponse,
    close: bool,
) -> Result<(), ()> {
    let sized: Option<usize> = head
        .header(b"content-length")
        .and_then(|v| std::str::from_utf8(v).ok())
        .and_then(|s| s.trim().parse().ok());

    let head_bytes = encode_head(head, close, sized);
    let (result, _) = stream.write_all_buf(head_bytes).await;
    if result.is_err() {
        return Err(());
    }

    let chunked = sized.is_none();
    loop {
        let chunk = match body.next_chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(_) => return Err(()),
        };
        if chunk.is_empty() {
            continue;
        }

        let bytes = if chunked {
            let mut framed = Vec::with_capacity(chunk.len() + 16);
            framed.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            framed.extend_from_slice(&chunk);
            framed.extend_from_slice(b"\r\n");
            framed
        } else {
            chunk
        };
        let (result, _) = stream.write_all_buf(bytes).await;
        if result.is_err() {
            return Err(());
        }
    }

    if chunked {
        let (result, _) = stream.write_all_buf(b"0\r\n\r\n".to_vec()).await;
        if result.is_err() {
            return Err(());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::testing::{block_on, MemoryStream};

    #[test]
    fn test_read_simple_request() {
        let mut stream = MemoryStream::new(
            b"GET /api/x?q=1 HTTP/1.1\r\nHost: news.example.com\r\nAccept: */*\r\n\r\n".to_vec(),
        );
        let parsed = block_on(read_request(&mut stream, Vec::new()))
            .unwrap()
            .unwrap();
        assert_eq!(parsed.method, "GET");
        assert_eq!(parsed.uri, "/api/x?q=1");
        assert!(!parsed.wants_close);
        assert!(parsed.body.is_empty());
        assert!(parsed
            .headers
            .iter()
            .any(|h| h.name == b"host" && h.value == b"news.example.com"));
    }

    #[test]
    fn test_read_request_with_body_and_pipelined_next() {
        let mut stream = MemoryStream::new(
            b"POST /u HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\n\r\nabcdGET / HTTP/1.1\r\n"
                .to_vec(),
        );
        let parsed = block_on(read_request(&mut stream, Vec::new()))
            .unwrap()
            .unwrap();
        assert_eq!(parsed.body, b"abcd");
        // 読み越した次のリクエストが carry に残る
        assert_eq!(parsed.rest, b"GET / HTTP/1.1\r\n");
    }

    #[test]
    fn test_chunked_request_rejected() {
        let mut stream = MemoryStream::new(
            b"POST /u HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec(),
        );
        assert!(matches!(
            block_on(read_request(&mut stream, Vec::new())),
            Err(411)
        ));
    }

    #[test]
    fn test_connection_close_detected() {
        let mut stream = MemoryStream::new(
            b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n".to_vec(),
        );
        let parsed = block_on(read_request(&mut stream, Vec::new()))
            .unwrap()
            .unwrap();
        assert!(parsed.wants_close);
    }

    #[test]
    fn test_encode_head_full_response() {
        let mut res = GatewayResponse::new(404);
        res.headers
            .push((b"content-type".to_vec(), b"text/plain".to_vec()));
        let head = encode_head(&res, true, Some(9));
        let text = String::from_utf8(head).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("content-type: text/plain\r\n"));
        assert!(text.contains("Content-Length: 9\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_encode_head_chunked() {
        let res = GatewayResponse::new(200);
        let head = encode_head(&res, false, None);
        let text = String::from_utf8(head).unwrap();
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(!text.contains("Content-Length"));
    }
}
