//! # 転送パイプライン
//!
//! 受理済みリクエストのライフサイクル全体を駆動します:
//! クライアントアドレスの確定 → 各フェーズのフィルタ → プロダクト解決 →
//! クラスタ解決 → バランス → 転送とリトライ → レスポンス中継 → 完了処理。
//! フィルタの判定 (GoOn / Finish / Redirect / Response / Close) はそのまま
//! 制御フローに写像されます。

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::config::{ClusterRuntime, RetryLevel, Snapshot, SnapshotHolder};
use crate::http2::connection::{ConnAction, Http2Connection, Http2Handler};
use crate::http2::hpack::HeaderField;
use crate::http2::settings::Http2Settings;
use crate::module::{CallbackTable, Phase, Verdict};
use crate::net::AsyncStream;
use crate::proxy::request::{
    GatewayRequest, ReqErr, HEADER_BFE_IP, HEADER_BFE_LOG_ID, HEADER_FORWARDED_FOR,
    HEADER_FORWARDED_PORT, HEADER_REAL_IP, HEADER_REAL_PORT,
};
use crate::proxy::response::GatewayResponse;
use crate::proxy::upstream::{self, BackendResponse, RoundTripArgs, UpstreamError};

/// 設定値に依存しない暴走防止の試行上限
const HARD_RETRY_CAP: u32 = 20;

/// ホップバイホップヘッダー (バックエンドへ中継しない)
const HOP_HEADERS: &[&[u8]] = &[
    b"connection",
    b"keep-alive",
    b"proxy-authenticate",
    b"proxy-authorization",
    b"te",
    b"trailer",
    b"transfer-encoding",
    b"upgrade",
];

// ====================
// プロキシ統計
// ====================

/// プロキシ全体の統計カウンタ
#[derive(Default)]
pub struct ProxyState {
    pub total_requests: AtomicU64,
    pub err_bk_find_product: AtomicU64,
    pub err_bk_find_location: AtomicU64,
    pub err_bk_no_cluster: AtomicU64,
    pub err_bk_no_balance: AtomicU64,
    pub err_bk_connect_backend: AtomicU64,
    pub err_bk_write_request: AtomicU64,
    pub err_bk_read_resp_header: AtomicU64,
    pub err_bk_resp_header_timeout: AtomicU64,
    pub err_bk_transport_broken: AtomicU64,
    pub err_client_write: AtomicU64,
    pub req_with_retry: AtomicU64,
    pub req_with_cross_retry: AtomicU64,
    pub req_fail_no_retry: AtomicU64,
    /// クラスタ別のリクエスト数
    pub cluster_requests: DashMap<String, AtomicU64>,
}

pub static PROXY_STATE: Lazy<ProxyState> = Lazy::new(ProxyState::default);

impl ProxyState {
    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_cluster(&self, name: &str) {
        self.cluster_requests
            .entry(name.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }
}

// ====================
// ゲートウェイ
// ====================

/// ゲートウェイ本体。全コネクションで共有される。
pub struct Gateway {
    pub snapshot: Arc<SnapshotHolder>,
    pub callbacks: CallbackTable,
    pub http2_settings: Http2Settings,
}

impl Gateway {
    pub fn new(snapshot: Arc<SnapshotHolder>, http2_settings: Http2Settings) -> Self {
        Self {
            snapshot,
            callbacks: CallbackTable::new(),
            http2_settings,
        }
    }
}

/// パイプラインの出力
pub enum Reply {
    /// 何も送らずに切断する
    None,
    /// 完結したレスポンス
    Full(GatewayResponse),
    /// ヘッダー部 + バックエンドからのストリームボディ
    Streamed(GatewayResponse, BackendResponse),
}

pub struct PipelineOutput {
    pub reply: Reply,
    /// 応答後にコネクションを閉じるか
    pub close_after: bool,
    /// 転送が成立した場合のクラスタ実行時情報 (タイムアウト等)
    pub cluster: Option<Arc<ClusterRuntime>>,
}

impl PipelineOutput {
    fn full(res: GatewayResponse, close_after: bool) -> Self {
        Self {
            reply: Reply::Full(res),
            close_after,
            cluster: None,
        }
    }

    fn close_now() -> Self {
        Self {
            reply: Reply::None,
            close_after: true,
            cluster: None,
        }
    }
}

/// フィルタ判定を共通処理する
///
/// GoOn 以外の判定を PipelineOutput へ写像します。GoOn は None。
fn apply_verdict(verdict: Verdict, req: &mut GatewayRequest) -> Option<PipelineOutput> {
    match verdict {
        Verdict::GoOn => None,
        Verdict::Finish => {
            // 応答せずにコネクションを閉じる (ステータスは記録のみ)
            Some(PipelineOutput {
                reply: Reply::Full(GatewayResponse::internal_error()),
                close_after: true,
                cluster: None,
            })
        }
        Verdict::Redirect { code, url } => Some(PipelineOutput {
            reply: Reply::Full(GatewayResponse::redirect(code, &url)),
            close_after: false,
            cluster: None,
        }),
        Verdict::Response(res) => Some(PipelineOutput {
            reply: Reply::Full(res),
            close_after: false,
            cluster: None,
        }),
        Verdict::Close => {
            req.set_error(ReqErr::ClientWrite, "closed by filter");
            Some(PipelineOutput::close_now())
        }
    }
}

/// リクエスト 1 件を処理して応答内容を決める
pub async fn run(gw: &Gateway, req: &mut GatewayRequest) -> PipelineOutput {
    let snapshot = gw.snapshot.load();
    ProxyState::inc(&PROXY_STATE.total_requests);

    // 1. クライアントアドレスの確定 (信頼プロキシのみ XFF を信用する)
    resolve_client_addr(&snapshot, req);

    // 2. BeforeLocation
    if let Some(out) = apply_verdict(
        gw.callbacks.dispatch_request(Phase::BeforeLocation, req),
        req,
    ) {
        return out;
    }

    // 3. プロダクト解決
    if let Err(e) = snapshot.host_table.lookup_host_tag_and_product(req) {
        req.set_error(ReqErr::NoProduct, e.to_string());
        ProxyState::inc(&PROXY_STATE.err_bk_find_product);
        ftlog::info!(
            "[pipeline] find product failed: host={} vip={:?} cip={} err={}",
            req.host,
            req.vip,
            req.client_ip,
            e
        );
        return PipelineOutput::full(GatewayResponse::internal_error(), true);
    }

    // 4. AfterProduct
    if let Some(out) = apply_verdict(
        gw.callbacks.dispatch_request(Phase::AfterProduct, req),
        req,
    ) {
        return out;
    }

    // 5. クラスタ解決 (条件式の先勝ち評価)
    if let Err(e) = snapshot.host_table.lookup_cluster(req) {
        let code = match e {
            crate::route::RouteError::NoProductRule => ReqErr::NoProductRule,
            _ => ReqErr::NoRuleMatch,
        };
        req.set_error(code, e.to_string());
        ProxyState::inc(&PROXY_STATE.err_bk_find_location);
        ftlog::info!(
            "[pipeline] find cluster failed: host={} product={} err={}",
            req.host,
            req.route.product,
            e
        );
        return PipelineOutput::full(GatewayResponse::internal_error(), true);
    }

    let cluster = match snapshot.clusters.get(&req.route.cluster_name) {
        Some(cluster) => Arc::clone(cluster),
        None => {
            req.set_error(
                ReqErr::NoCluster,
                format!("no cluster {}", req.route.cluster_name),
            );
            ProxyState::inc(&PROXY_STATE.err_bk_no_cluster);
            return PipelineOutput::full(GatewayResponse::internal_error(), true);
        }
    };
    PROXY_STATE.inc_cluster(&req.route.cluster_name);

    // 6. AfterLocation
    if let Some(out) = apply_verdict(
        gw.callbacks.dispatch_request(Phase::AfterLocation, req),
        req,
    ) {
        return out;
    }

    // 7-10. バックエンド転送 (リトライ込み)
    let backend_res = match invoke_cluster(gw, &cluster, req).await {
        Ok(res) => res,
        Err(out) => return out,
    };

    // 11. OnResponse
    let mut head = response_head(&backend_res);
    match gw
        .callbacks
        .dispatch_response(Phase::OnResponse, req, &mut head)
    {
        Verdict::GoOn => {}
        Verdict::Finish | Verdict::Close => {
            return PipelineOutput::close_now();
        }
        Verdict::Redirect { code, url } => {
            return PipelineOutput {
                reply: Reply::Full(GatewayResponse::redirect(code, &url)),
                close_after: false,
                cluster: Some(cluster),
            };
        }
        Verdict::Response(res) => {
            return PipelineOutput {
                reply: Reply::Full(res),
                close_after: false,
                cluster: Some(cluster),
            };
        }
    }

    PipelineOutput {
        reply: Reply::Streamed(head, backend_res),
        close_after: false,
        cluster: Some(cluster),
    }
}

/// リクエスト完了時の処理 (OnFinish + バックエンド接続数の返却)
pub fn finish(gw: &Gateway, req: &mut GatewayRequest, res: &mut GatewayResponse) {
    let _ = gw.callbacks.dispatch_response(Phase::OnFinish, req, res);

    if let Some(backend) = req.backend.take() {
        backend.dec_conn();
    }

    if let Some(code) = req.err_code {
        ftlog::info!(
            "[pipeline] request finished with error: log_id={} host={} uri={} err={} msg={}",
            req.log_id,
            req.host,
            req.uri,
            code,
            req.err_msg
        );
    }
}

/// 信頼プロキシ経由の場合のみ X-Forwarded-For / X-Real-Ip を信用する
fn resolve_client_addr(snapshot: &Snapshot, req: &mut GatewayRequest) {
    req.cip_trusted = snapshot.trusted_proxies.contains(req.peer_ip);
    if !req.cip_trusted {
        return;
    }

    let forwarded: Option<IpAddr> = req
        .header("x-real-ip")
        .and_then(|v| std::str::from_utf8(v).ok())
        .and_then(|s| s.trim().parse().ok())
        .or_else(|| {
            req.header("x-forwarded-for")
                .and_then(|v| std::str::from_utf8(v).ok())
                .and_then(|s| s.split(',').next())
                .and_then(|s| s.trim().parse().ok())
        });

    if let Some(ip) = forwarded {
        req.client_ip = ip;
        req.client_port = req
            .header("x-real-port")
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);
    }
}

/// バックエンドの選択と転送をリトライポリシーに従って実行する
async fn invoke_cluster(
    gw: &Gateway,
    cluster: &Arc<ClusterRuntime>,
    req: &mut GatewayRequest,
) -> Result<BackendResponse, PipelineOutput> {
    let request_bytes = build_outbound(req);

    let mut last_err: Option<UpstreamError> = None;

    for attempt in 0..HARD_RETRY_CAP {
        let backend = match cluster.balancer.balance(req) {
            Ok(backend) => backend,
            Err(e) => {
                req.set_error(ReqErr::NoBalance, e.to_string());
                ProxyState::inc(&PROXY_STATE.err_bk_no_balance);
                ftlog::warn!(
                    "[pipeline] cluster {} balance failed at attempt {}: {}",
                    cluster.balancer.cluster_name,
                    attempt,
                    e
                );
                break;
            }
        };

        // 旧バックエンドの接続数を返し、新しい選択を記録する
        if let Some(old) = req.backend.take() {
            old.dec_conn();
        }
        backend.inc_conn();
        req.backend = Some(Arc::clone(&backend));

        // BeforeForward フィルタ
        match gw.callbacks.dispatch_request(Phase::BeforeForward, req) {
            Verdict::GoOn => {}
            verdict => {
                if let Some(out) = apply_verdict(verdict, req) {
                    return Err(out);
                }
            }
        }

        let now = Instant::now();
        if req.stat.backend_first.is_none() {
            req.stat.backend_first = Some(now);
        }

        let result = upstream::round_trip(RoundTripArgs {
            addr: backend.addr_info(),
            request_bytes: request_bytes.clone(),
            method: &req.method,
            connect_timeout: cluster.params.timeout_conn_srv,
            response_header_timeout: cluster.params.timeout_response_header,
            max_idle_conns: cluster.params.max_idle_conns_per_host,
        })
        .await;

        req.stat.backend_end = Some(Instant::now());

        match result {
            Ok(res) => {
                backend.on_success();
                // リトライを経て成功した場合は途中のエラーを消す
                req.clear_error();
                return Ok(res);
            }
            Err(e) => {
                ftlog::info!(
                    "[pipeline] [{}] [{}] roundtrip failed: {}",
                    cluster.balancer.cluster_name,
                    backend.addr_info(),
                    e
                );
                req.set_error(e.req_err(), e.to_string());
                count_upstream_error(&e);

                let allow_retry = match &e {
                    // 接続段階の失敗は常にリトライ可能
                    UpstreamError::Connect(_) => {
                        backend.on_fail(&cluster.balancer.cluster_name);
                        true
                    }
                    UpstreamError::WriteRequest(_)
                    | UpstreamError::ReadRespHeader(_)
                    | UpstreamError::RespHeaderTimeout => {
                        backend.on_fail(&cluster.balancer.cluster_name);
                        allow_non_connect_retry(cluster.params.retry_level, req)
                    }
                    UpstreamError::TransportBroken(_) => {
                        allow_non_connect_retry(cluster.params.retry_level, req)
                    }
                };
                last_err = Some(e);

                if !allow_retry {
                    ProxyState::inc(&PROXY_STATE.req_fail_no_retry);
                    break;
                }
                req.retry_count += 1;
            }
        }
    }

    if req.retry_count > 0 {
        ProxyState::inc(&PROXY_STATE.req_with_retry);
    }
    if req.stat.cross_cluster {
        ProxyState::inc(&PROXY_STATE.req_with_cross_retry);
    }

    let res = match last_err {
        Some(UpstreamError::RespHeaderTimeout) => GatewayResponse::gateway_timeout(),
        Some(_) => GatewayResponse::bad_gateway(),
        None => GatewayResponse::internal_error(),
    };
    Err(PipelineOutput::full(res, true))
}

/// 非接続系エラーのリトライ可否
///
/// RetryLevel が ConnectOrGetBody で、メソッドが GET、かつボディが空の
/// 場合のみリトライします。
fn allow_non_connect_retry(level: RetryLevel, req: &GatewayRequest) -> bool {
    level == RetryLevel::ConnectOrGetBody && req.method == "GET" && req.body.is_empty()
}

fn count_upstream_error(e: &UpstreamError) {
    let counter = match e {
        UpstreamError::Connect(_) => &PROXY_STATE.err_bk_connect_backend,
        UpstreamError::WriteRequest(_) => &PROXY_STATE.err_bk_write_request,
        UpstreamError::ReadRespHeader(_) => &PROXY_STATE.err_bk_read_resp_header,
        UpstreamError::RespHeaderTimeout => &PROXY_STATE.err_bk_resp_header_timeout,
        UpstreamError::TransportBroken(_) => &PROXY_STATE.err_bk_transport_broken,
    };
    ProxyState::inc(counter);
}

/// バックエンドへ送る HTTP/1.1 リクエストを組み立てる
///
/// 強制的に HTTP/1.1 の keep-alive とし、ホップバイホップヘッダーを
/// 取り除いて転送系ヘッダーを付与します。
pub fn build_outbound(req: &GatewayRequest) -> Vec<u8> {
    let mut out = Vec::with_capacity(512 + req.body.len());

    out.extend_from_slice(req.method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(req.uri.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\nHost: ");
    out.extend_from_slice(req.host.as_bytes());
    out.extend_from_slice(b"\r\n");

    // 元のヘッダー (ホップバイホップと host は除く)
    for h in &req.headers {
        if h.name == b"host" || HOP_HEADERS.contains(&h.name.as_slice()) {
            continue;
        }
        // 転送系ヘッダーは後で付け直すため元の値は除く
        if h.name == b"x-real-ip"
            || h.name == b"x-real-port"
            || h.name == b"x-forwarded-port"
        {
            continue;
        }
        if h.name == b"x-forwarded-for" {
            continue;
        }
        out.extend_from_slice(&h.name);
        out.extend_from_slice(b": ");
        out.extend_from_slice(&h.value);
        out.extend_from_slice(b"\r\n");
    }

    let mut int_buf = itoa::Buffer::new();

    // X-Forwarded-For は既存値に追記する
    let mut xff = match req.header("x-forwarded-for") {
        Some(prev) if req.cip_trusted => {
            let mut v = prev.to_vec();
            v.extend_from_slice(b", ");
            v
        }
        _ => Vec::new(),
    };
    xff.extend_from_slice(req.peer_ip.to_string().as_bytes());

    let forwarded: &[(&str, Vec<u8>)] = &[
        (HEADER_FORWARDED_FOR, xff),
        (
            HEADER_FORWARDED_PORT,
            int_buf.format(req.peer_port).as_bytes().to_vec(),
        ),
        (HEADER_REAL_IP, req.client_ip.to_string().into_bytes()),
        (
            HEADER_REAL_PORT,
            itoa::Buffer::new().format(req.client_port).as_bytes().to_vec(),
        ),
        (
            HEADER_BFE_IP,
            req.vip
                .map(|v| v.to_string())
                .unwrap_or_default()
                .into_bytes(),
        ),
        (
            HEADER_BFE_LOG_ID,
            itoa::Buffer::new().format(req.log_id).as_bytes().to_vec(),
        ),
    ];
    for (name, value) in forwarded {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }

    if !req.body.is_empty() || req.method == "POST" || req.method == "PUT" {
        out.extend_from_slice(b"Content-Length: ");
        out.extend_from_slice(itoa::Buffer::new().format(req.body.len()).as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"Connection: keep-alive\r\n\r\n");
    out.extend_from_slice(&req.body);
    out
}

/// バックエンドレスポンスからクライアント向けヘッダー部を作る
///
/// HTTP/1.1 固有のホップバイホップヘッダーは中継しません。
fn response_head(res: &BackendResponse) -> GatewayResponse {
    let mut head = GatewayResponse::new(res.status);
    head.headers.clear();
    for (name, value) in &res.headers {
        if HOP_HEADERS.contains(&name.as_slice()) {
            continue;
        }
        head.headers.push((name.clone(), value.clone()));
    }
    head
}

// ====================
// HTTP/2 ハンドラ
// ====================

/// コネクション 1 本分のハンドラ文脈
pub struct GatewayConn {
    pub gw: Arc<Gateway>,
    pub peer_ip: IpAddr,
    pub peer_port: u16,
    pub vip: Option<IpAddr>,
    pub vip_port: u16,
}

impl GatewayConn {
    /// HTTP/2 ストリームからゲートウェイリクエストを組み立てる
    fn build_request(&self, headers: Vec<HeaderField>, body: Vec<u8>) -> GatewayRequest {
        let mut method = String::new();
        let mut uri = String::new();
        let mut scheme = String::from("https");
        let mut authority = String::new();
        let mut regular = Vec::with_capacity(headers.len());

        for h in headers {
            match h.name.as_slice() {
                b":method" => method = String::from_utf8_lossy(&h.value).into_owned(),
                b":path" => uri = String::from_utf8_lossy(&h.value).into_owned(),
                b":scheme" => scheme = String::from_utf8_lossy(&h.value).into_owned(),
                b":authority" => authority = String::from_utf8_lossy(&h.value).into_owned(),
                _ => regular.push(h),
            }
        }

        // :authority が無ければ host ヘッダーへフォールバック
        if authority.is_empty() {
            if let Some(host) = regular
                .iter()
                .find(|h| h.name == b"host")
                .map(|h| String::from_utf8_lossy(&h.value).into_owned())
            {
                authority = host;
            }
        }

        let mut req = GatewayRequest::new(
            method,
            uri,
            scheme,
            authority,
            "HTTP/2.0",
            regular,
            body,
            self.peer_ip,
            self.peer_port,
        );
        req.vip = self.vip;
        req.vip_port = self.vip_port;
        req
    }
}

impl Http2Handler for GatewayConn {
    async fn handle<S: AsyncStream>(
        &mut self,
        conn: &mut Http2Connection<S>,
        stream_id: u32,
    ) -> ConnAction {
        let Some((headers, body)) = conn.take_request(stream_id) else {
            return ConnAction::KeepServing;
        };
        let mut req = self.build_request(headers, body);

        let gw = Arc::clone(&self.gw);
        let output = run(&gw, &mut req).await;

        req.stat.response_start = Some(Instant::now());
        let write_timeout = Duration::from_secs(conn.stream_write_timeout_secs());

        let action = match output.reply {
            Reply::None => {
                finish(&gw, &mut req, &mut GatewayResponse::new(0));
                return ConnAction::CloseNow;
            }
            Reply::Full(mut res) => {
                let write = conn.send_response(stream_id, res.status, &res.headers, &res.body);
                let sent = monoio::time::timeout(write_timeout, write).await;
                if !matches!(sent, Ok(Ok(()))) {
                    req.set_error(ReqErr::ClientWrite, "write response to client failed");
                    ProxyState::inc(&PROXY_STATE.err_client_write);
                }
                finish(&gw, &mut req, &mut res);
                if output.close_after {
                    ConnAction::CloseAfterReply
                } else {
                    ConnAction::KeepServing
                }
            }
            Reply::Streamed(mut head, mut body) => {
                // 書き込みタイムアウトはクラスタ設定を優先する
                let write_timeout = output
                    .cluster
                    .as_ref()
                    .map(|c| c.params.timeout_write_client)
                    .unwrap_or(write_timeout);

                // 1xx 中間レスポンスを先に送る
                for interim in body.interim_statuses().to_vec() {
                    let _ = conn.send_informational(stream_id, interim).await;
                }

                let result = stream_body(conn, stream_id, &mut head, &mut body, write_timeout)
                    .await;
                match result {
                    Ok(()) => {
                        body.release();
                        finish(&gw, &mut req, &mut head);
                        ConnAction::KeepServing
                    }
                    Err(e) => {
                        // バックエンド接続は再利用せず破棄する
                        req.set_error(ReqErr::ClientWrite, e);
                        ProxyState::inc(&PROXY_STATE.err_client_write);
                        finish(&gw, &mut req, &mut head);
                        ConnAction::CloseAfterReply
                    }
                }
            }
        };
        action
    }
}

/// バックエンドボディをクライアントストリームへ中継する
async fn stream_body<S: AsyncStream>(
    conn: &mut Http2Connection<S>,
    stream_id: u32,
    head: &GatewayResponse,
    body: &mut BackendResponse,
    write_timeout: Duration,
) -> Result<(), String> {
    let deadline = Instant::now() + write_timeout;
    let remaining = |deadline: Instant| {
        deadline
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::ZERO)
    };

    let headers_done = conn.send_response_headers(stream_id, head.status, &head.headers, false);
    match monoio::time::timeout(remaining(deadline), headers_done).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e.to_string()),
        Err(_) => return Err("write timeout on response headers".into()),
    }

    loop {
        let chunk = match body.next_chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                // ボディ途中のバックエンド断: ストリームを abort する
                let _ = conn
                    .send_rst_stream(stream_id, crate::http2::ErrorCode::InternalError)
                    .await;
                return Err(e.to_string());
            }
        };

        let write = conn.send_data(stream_id, &chunk, false);
        match monoio::time::timeout(remaining(deadline), write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => return Err("write timeout on response body".into()),
        }
    }

    conn.send_data(stream_id, &[], true)
        .await
        .map_err(|e| e.to_string())
}
