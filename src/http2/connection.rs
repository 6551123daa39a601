//! # HTTP/2 コネクション (RFC 7540)
//!
//! コネクション単位の状態機械。フレームの読み取り・検証・多重化、二段の
//! フロー制御、HPACK テーブル、GOAWAY / RST_STREAM によるエラー処理を
//! 担います。
//!
//! コネクションは単一タスクで駆動されます。そのタスクがトランスポートの
//! 読み書き両方と streams マップ・HPACK テーブルの唯一の所有者であるため、
//! 送信フレームの直列化はロックなしで成立します。送信ウィンドウ待ちは
//! 受信フレームの処理をインラインで進めることで解決します。

use std::collections::VecDeque;
use std::time::Instant;

use crate::http2::error::{ErrorCode, Http2Error, Http2Result};
use crate::http2::frame::{Frame, FrameDecoder, FrameEncoder, FrameHeader};
use crate::http2::hpack::{HeaderField, HpackDecoder, HpackEncoder};
use crate::http2::settings::{defaults, Http2Settings, PeerSettings, SettingId};
use crate::http2::stream::{StreamState, StreamTable};
use crate::net::AsyncStream;

/// 受信バッファの読み込み単位
const READ_CHUNK: usize = 16384;

/// ハンドラがリクエスト処理後にコネクションへ指示するアクション
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnAction {
    /// 次のリクエストを受け付ける
    KeepServing,
    /// 応答済み。GOAWAY を送って閉じる
    CloseAfterReply,
    /// 何も送らず直ちに切断する
    CloseNow,
}

/// リクエスト完了時に呼び出されるハンドラ
pub trait Http2Handler {
    async fn handle<S: AsyncStream>(
        &mut self,
        conn: &mut Http2Connection<S>,
        stream_id: u32,
    ) -> ConnAction;
}

/// HTTP/2 コネクション (サーバー側)
pub struct Http2Connection<S> {
    stream: S,
    local: Http2Settings,
    peer: PeerSettings,
    pub(crate) streams: StreamTable,
    hpack_dec: HpackDecoder,
    hpack_enc: HpackEncoder,
    frame_dec: FrameDecoder,
    frame_enc: FrameEncoder,

    /// コネクションレベル送信ウィンドウ
    conn_send_window: i32,
    /// コネクションレベル受信ウィンドウ
    conn_recv_window: i32,
    /// 受信ウィンドウの目標値 (補充先)
    conn_recv_target: i32,

    goaway_sent: bool,
    goaway_received: bool,
    settings_ack_pending: bool,

    /// 処理可能になったリクエスト (ストリーム ID)
    ready: VecDeque<u32>,

    /// 受信バッファと未消費位置
    buf: Vec<u8>,
    pos: usize,

    // 過負荷防御
    rst_count: u32,
    rst_window_start: Instant,
    control_count: u32,
    control_window_start: Instant,
    continuation_count: u32,
}

impl<S: AsyncStream> Http2Connection<S> {
    pub fn new(stream: S, settings: Http2Settings) -> Self {
        let hpack_dec = HpackDecoder::new(
            settings.header_table_size as usize,
            settings.max_header_list_size as usize,
        );
        let hpack_enc = HpackEncoder::new(defaults::HEADER_TABLE_SIZE as usize);
        let frame_dec = FrameDecoder::new(settings.max_frame_size);
        let frame_enc = FrameEncoder::new(defaults::MAX_FRAME_SIZE);
        let streams = StreamTable::new(
            settings.max_concurrent_streams,
            settings.initial_window_size as i32,
        );
        let conn_target = settings.connection_window_size.max(65535) as i32;
        let now = Instant::now();

        Self {
            stream,
            local: settings,
            peer: PeerSettings::default(),
            streams,
            hpack_dec,
            hpack_enc,
            frame_dec,
            frame_enc,
            conn_send_window: defaults::INITIAL_WINDOW_SIZE as i32,
            conn_recv_window: defaults::CONNECTION_WINDOW_SIZE as i32,
            conn_recv_target: conn_target,
            goaway_sent: false,
            goaway_received: false,
            settings_ack_pending: false,
            ready: VecDeque::new(),
            buf: Vec::with_capacity(READ_CHUNK),
            pos: 0,
            rst_count: 0,
            rst_window_start: now,
            control_count: 0,
            control_window_start: now,
            continuation_count: 0,
        }
    }

    /// プロトコル判定などで先読みされたバイト列を受信バッファへ戻す
    pub fn preload(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// ハンドシェイク: プリフェース受信 → SETTINGS 送信 → ウィンドウ拡張
    pub async fn handshake(&mut self) -> Http2Result<()> {
        self.expect_preface().await?;

        let frame = self.frame_enc.settings(&self.local.advertised());
        self.write_all(frame).await?;
        self.settings_ack_pending = true;

        // コネクション受信ウィンドウをデフォルトの 65535 から目標値へ拡張
        let grow = self.conn_recv_target - self.conn_recv_window;
        if grow > 0 {
            let frame = self.frame_enc.window_update(0, grow as u32);
            self.write_all(frame).await?;
            self.conn_recv_window = self.conn_recv_target;
        }

        Ok(())
    }

    async fn expect_preface(&mut self) -> Http2Result<()> {
        let preface_len = defaults::CONNECTION_PREFACE.len();
        while self.buf.len() - self.pos < preface_len {
            self.fill().await?;
        }

        let got = &self.buf[self.pos..self.pos + preface_len];
        if got != defaults::CONNECTION_PREFACE {
            ftlog::warn!("[HTTP/2] invalid connection preface: {:?}", got);
            return Err(Http2Error::BadPreface);
        }
        self.pos += preface_len;
        Ok(())
    }

    /// 追加データを受信バッファへ読み込む
    async fn fill(&mut self) -> Http2Result<()> {
        let chunk = vec![0u8; READ_CHUNK];
        let (result, chunk) = self.stream.read_buf(chunk).await;
        match result {
            Ok(0) => Err(Http2Error::ConnectionClosed),
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                Ok(())
            }
            Err(e) => Err(Http2Error::Io(e)),
        }
    }

    async fn write_all(&mut self, frame: Vec<u8>) -> Http2Result<()> {
        let (result, _) = self.stream.write_all_buf(frame).await;
        result.map(|_| ()).map_err(Http2Error::Io)
    }

    /// フレームを 1 つ読み取る
    pub async fn read_frame(&mut self) -> Http2Result<Frame> {
        while self.buf.len() - self.pos < FrameHeader::SIZE {
            self.fill().await?;
        }

        let head: [u8; 9] = self.buf[self.pos..self.pos + 9].try_into().unwrap();
        let header = self.frame_dec.decode_header(&head)?;
        let total = FrameHeader::SIZE + header.length as usize;

        while self.buf.len() - self.pos < total {
            self.fill().await?;
        }

        let payload = &self.buf[self.pos + FrameHeader::SIZE..self.pos + total];
        let frame = self.frame_dec.decode(&header, payload)?;
        self.pos += total;

        if self.pos > 32768 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }

        Ok(frame)
    }

    /// 受信フレームを処理する
    ///
    /// リクエストが完成した場合は ready キューへ積まれ、`next_ready()` で
    /// 取り出せます。
    pub async fn process_frame(&mut self, frame: Frame) -> Http2Result<()> {
        // ヘッダーブロック受信中は同一ストリームの CONTINUATION 以外を禁止
        // (RFC 7540 Section 4.3)
        if let Some(pending) = self.streams.receiving_headers() {
            match &frame {
                Frame::Continuation { stream_id, .. } if *stream_id == pending => {}
                other => {
                    return Err(Http2Error::protocol(format!(
                        "{} frame interleaved in header block of stream {}",
                        other.name(),
                        pending
                    )));
                }
            }
        }

        match frame {
            Frame::Settings { ack, settings } => self.on_settings(ack, &settings).await,
            Frame::Headers {
                stream_id,
                end_stream,
                end_headers,
                priority,
                fragment,
                ..
            } => {
                if let Some(p) = priority {
                    if p.dependency == stream_id {
                        return Err(Http2Error::stream(
                            stream_id,
                            ErrorCode::ProtocolError,
                            "stream depends on itself",
                        ));
                    }
                }
                self.on_headers(stream_id, end_stream, end_headers, &fragment)
                    .await
            }
            Frame::Continuation {
                stream_id,
                end_headers,
                fragment,
            } => self.on_continuation(stream_id, end_headers, &fragment).await,
            Frame::Data {
                stream_id,
                end_stream,
                data,
                pad_len,
            } => self.on_data(stream_id, end_stream, &data, pad_len).await,
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => self.on_window_update(stream_id, increment),
            Frame::RstStream {
                stream_id,
                error_code,
            } => self.on_rst_stream(stream_id, error_code),
            Frame::Ping { ack, data } => self.on_ping(ack, &data).await,
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                self.on_goaway(last_stream_id, error_code, &debug_data);
                Ok(())
            }
            Frame::Priority {
                stream_id,
                priority,
            } => {
                if priority.dependency == stream_id {
                    return Err(Http2Error::stream(
                        stream_id,
                        ErrorCode::ProtocolError,
                        "stream depends on itself",
                    ));
                }
                Ok(())
            }
            Frame::PushPromise { .. } => {
                Err(Http2Error::protocol("PUSH_PROMISE received from client"))
            }
            // 未知のフレームタイプは黙って破棄 (RFC 7540 Section 4.1)
            Frame::Unknown { .. } => Ok(()),
        }
    }

    /// 完成したリクエストのストリーム ID を取り出す
    pub fn next_ready(&mut self) -> Option<u32> {
        self.ready.pop_front()
    }

    // ====================
    // 受信処理
    // ====================

    async fn on_settings(&mut self, ack: bool, settings: &[(u16, u32)]) -> Http2Result<()> {
        if ack {
            self.settings_ack_pending = false;
            return Ok(());
        }

        self.bump_control_frame()?;

        for &(id, value) in settings {
            match SettingId::from_u16(id) {
                Some(SettingId::HeaderTableSize) => {
                    // ピアのデコーダが許すサイズ。こちらのエンコーダに適用する。
                    self.peer.header_table_size = value;
                    self.hpack_enc.set_max_table_size(value as usize);
                }
                Some(SettingId::EnablePush) => {
                    if value > 1 {
                        return Err(Http2Error::protocol("ENABLE_PUSH must be 0 or 1"));
                    }
                    self.peer.enable_push = value == 1;
                }
                Some(SettingId::MaxConcurrentStreams) => {
                    self.peer.max_concurrent_streams = Some(value);
                }
                Some(SettingId::InitialWindowSize) => {
                    if value > defaults::MAX_WINDOW_SIZE {
                        return Err(Http2Error::flow_control(
                            "INITIAL_WINDOW_SIZE exceeds 2^31-1",
                        ));
                    }
                    self.streams.apply_peer_initial_window(value)?;
                    self.peer.initial_window_size = value;
                }
                Some(SettingId::MaxFrameSize) => {
                    if !(defaults::MAX_FRAME_SIZE..=defaults::MAX_FRAME_SIZE_CEIL)
                        .contains(&value)
                    {
                        return Err(Http2Error::protocol(format!(
                            "MAX_FRAME_SIZE {} out of range",
                            value
                        )));
                    }
                    self.peer.max_frame_size = value;
                    self.frame_enc.set_max_frame_size(value);
                }
                Some(SettingId::MaxHeaderListSize) => {
                    self.peer.max_header_list_size = Some(value);
                }
                // 未知の設定は無視 (RFC 7540 Section 6.5.2)
                None => {}
            }
        }

        let ack_frame = self.frame_enc.settings_ack();
        self.write_all(ack_frame).await
    }

    async fn on_headers(
        &mut self,
        stream_id: u32,
        end_stream: bool,
        end_headers: bool,
        fragment: &[u8],
    ) -> Http2Result<()> {
        self.continuation_count = 0;

        if fragment.len() > self.local.max_header_block_size {
            return Err(Http2Error::stream(
                stream_id,
                ErrorCode::EnhanceYourCalm,
                "header block size limit exceeded",
            ));
        }

        // 既存ストリームへの 2 つ目の HEADERS はトレーラー (END_STREAM 必須)
        let is_trailer = match self.streams.get_ref(stream_id) {
            Some(s) if matches!(s.state, StreamState::Open | StreamState::HalfClosedLocal) => {
                if !end_stream {
                    return Err(Http2Error::stream(
                        stream_id,
                        ErrorCode::ProtocolError,
                        "second HEADERS without END_STREAM",
                    ));
                }
                true
            }
            _ => false,
        };

        let stream = self.streams.open_peer_stream(stream_id)?;
        stream.recv_headers(end_stream)?;
        stream.in_trailer_block = is_trailer;
        stream.push_fragment(fragment, end_headers);

        if end_headers {
            self.streams.set_receiving_headers(None);
            self.finish_header_block(stream_id, is_trailer, end_stream)
                .await
        } else {
            self.streams.set_receiving_headers(Some(stream_id));
            Ok(())
        }
    }

    async fn on_continuation(
        &mut self,
        stream_id: u32,
        end_headers: bool,
        fragment: &[u8],
    ) -> Http2Result<()> {
        let pending = self
            .streams
            .receiving_headers()
            .ok_or_else(|| Http2Error::protocol("CONTINUATION outside header block"))?;
        if pending != stream_id {
            return Err(Http2Error::protocol("CONTINUATION for wrong stream"));
        }

        self.continuation_count += 1;
        if self.continuation_count > self.local.max_continuation_frames {
            ftlog::warn!(
                "[HTTP/2] CONTINUATION flood: {} frames on stream {}",
                self.continuation_count,
                stream_id
            );
            return Err(Http2Error::conn(
                ErrorCode::EnhanceYourCalm,
                "CONTINUATION frame limit exceeded",
            ));
        }

        let max_block = self.local.max_header_block_size;
        let stream = self
            .streams
            .get(stream_id)
            .ok_or_else(|| Http2Error::protocol("stream vanished during CONTINUATION"))?;

        if stream.pending_fragment_len() + fragment.len() > max_block {
            return Err(Http2Error::stream(
                stream_id,
                ErrorCode::EnhanceYourCalm,
                "cumulative header block size limit exceeded",
            ));
        }

        // END_STREAM は先行する HEADERS のフラグで決まっている
        let end_stream = matches!(
            stream.state,
            StreamState::HalfClosedRemote | StreamState::Closed
        );
        let is_trailer = stream.in_trailer_block;
        stream.push_fragment(fragment, end_headers);

        if end_headers {
            self.streams.set_receiving_headers(None);
            self.continuation_count = 0;
            self.finish_header_block(stream_id, is_trailer, end_stream)
                .await
        } else {
            Ok(())
        }
    }

    /// 再組立て完了したヘッダーブロックをデコード・検証して取り込む
    async fn finish_header_block(
        &mut self,
        stream_id: u32,
        is_trailer: bool,
        end_stream: bool,
    ) -> Http2Result<()> {
        let block = match self.streams.get(stream_id) {
            Some(s) => s.take_fragment(),
            None => return Ok(()),
        };

        let headers = self.hpack_dec.decode(&block).map_err(|e| {
            ftlog::warn!("[HTTP/2] HPACK decode failed on stream {}: {}", stream_id, e);
            Http2Error::compression(e.to_string())
        })?;

        validate_header_list(&headers, stream_id, is_trailer)?;

        let stream = match self.streams.get(stream_id) {
            Some(s) => s,
            None => return Ok(()),
        };

        if is_trailer {
            stream.absorb_trailers(headers);
            stream.check_content_length()?;
        } else {
            stream.absorb_request_headers(headers);
        }

        if end_stream {
            self.flush_window_updates(stream_id).await?;
            self.ready.push_back(stream_id);
        }
        Ok(())
    }

    async fn on_data(
        &mut self,
        stream_id: u32,
        end_stream: bool,
        data: &[u8],
        pad_len: u32,
    ) -> Http2Result<()> {
        // コネクションレベルのウィンドウはストリームの生死に関係なく消費される
        let cost = data.len() as i64 + pad_len as i64;
        if cost > self.conn_recv_window as i64 {
            return Err(Http2Error::flow_control(
                "connection flow control window exceeded",
            ));
        }
        self.conn_recv_window -= cost as i32;

        if self.streams.is_idle(stream_id) {
            return Err(Http2Error::protocol(format!(
                "DATA frame on idle stream {}",
                stream_id
            )));
        }

        match self.streams.get(stream_id) {
            Some(stream) => {
                if stream.state == StreamState::Closed {
                    // RST 送信直後の追い越しフレームは限度付きで黙認する
                    if stream.tolerate_after_rst() {
                        return self.maybe_replenish_conn_window().await;
                    }
                    return Err(Http2Error::stream(
                        stream_id,
                        ErrorCode::StreamClosed,
                        "DATA on closed stream",
                    ));
                }
                stream.recv_data(data, pad_len, end_stream)?;
            }
            // クローズ後に回収済みのストリーム: ウィンドウのみ消費して無視
            None => return self.maybe_replenish_conn_window().await,
        }

        if end_stream {
            // content-length の照合。不一致は 400 を返した上でストリームを落とす。
            // ここは send_data の再帰先になり得るため、ボディ無しの HEADERS
            // のみで応答する。
            if let Some(stream) = self.streams.get_ref(stream_id) {
                if let Err(e) = stream.check_content_length() {
                    let headers = [(b"content-length".to_vec(), b"0".to_vec())];
                    let _ = self
                        .send_response_headers(stream_id, 400, &headers, true)
                        .await;
                    return Err(e);
                }
            }
            self.flush_window_updates(stream_id).await?;
            self.ready.push_back(stream_id);
        } else {
            self.maybe_send_window_updates(stream_id).await?;
        }
        Ok(())
    }

    fn on_window_update(&mut self, stream_id: u32, increment: u32) -> Http2Result<()> {
        if stream_id == 0 {
            match self.conn_send_window.checked_add(increment as i32) {
                Some(w) if w as i64 <= defaults::MAX_WINDOW_SIZE as i64 => {
                    self.conn_send_window = w;
                    Ok(())
                }
                _ => Err(Http2Error::flow_control("connection send window overflow")),
            }
        } else if self.streams.is_idle(stream_id) {
            Err(Http2Error::protocol(format!(
                "WINDOW_UPDATE on idle stream {}",
                stream_id
            )))
        } else {
            match self.streams.get(stream_id) {
                Some(stream) => stream.recv_window_update(increment),
                None => Ok(()),
            }
        }
    }

    fn on_rst_stream(&mut self, stream_id: u32, error_code: u32) -> Http2Result<()> {
        // Rapid Reset 対策のレート制限
        let now = Instant::now();
        if now.duration_since(self.rst_window_start).as_secs() >= 1 {
            self.rst_count = 1;
            self.rst_window_start = now;
        } else {
            self.rst_count += 1;
            if self.rst_count > self.local.max_rst_stream_per_second {
                ftlog::warn!(
                    "[HTTP/2] RST_STREAM flood: {} frames within 1s",
                    self.rst_count
                );
                return Err(Http2Error::conn(
                    ErrorCode::EnhanceYourCalm,
                    "RST_STREAM rate limit exceeded",
                ));
            }
        }

        if self.streams.is_idle(stream_id) {
            return Err(Http2Error::protocol(format!(
                "RST_STREAM on idle stream {}",
                stream_id
            )));
        }

        if let Some(stream) = self.streams.get(stream_id) {
            ftlog::debug!(
                "[HTTP/2] stream {} reset by peer: {}",
                stream_id,
                ErrorCode::from_u32(error_code)
            );
            stream.recv_rst();
            // 処理前にキャンセルされたリクエストは捨てる
            self.ready.retain(|&id| id != stream_id);
        }
        Ok(())
    }

    async fn on_ping(&mut self, ack: bool, data: &[u8; 8]) -> Http2Result<()> {
        if !ack {
            self.bump_control_frame()?;
            let frame = self.frame_enc.ping(data, true);
            self.write_all(frame).await?;
        }
        Ok(())
    }

    fn on_goaway(&mut self, last_stream_id: u32, error_code: u32, debug_data: &[u8]) {
        self.goaway_received = true;
        self.streams.set_goaway_last_stream_id(last_stream_id);

        if error_code != 0 {
            ftlog::warn!(
                "[HTTP/2] GOAWAY received: code={} last_stream_id={} debug={}",
                ErrorCode::from_u32(error_code),
                last_stream_id,
                String::from_utf8_lossy(debug_data)
            );
        }
    }

    /// 制御フレームのレート制限 (PING / SETTINGS)
    fn bump_control_frame(&mut self) -> Http2Result<()> {
        let now = Instant::now();
        if now.duration_since(self.control_window_start).as_secs() >= 1 {
            self.control_count = 1;
            self.control_window_start = now;
            return Ok(());
        }
        self.control_count += 1;
        if self.control_count > self.local.max_control_frames_per_second {
            ftlog::warn!(
                "[HTTP/2] control frame flood: {} frames within 1s",
                self.control_count
            );
            return Err(Http2Error::conn(
                ErrorCode::EnhanceYourCalm,
                "control frame rate limit exceeded",
            ));
        }
        Ok(())
    }

    // ====================
    // 受信ウィンドウ補充
    // ====================

    /// 消費量が目標値の半分を超えたらまとめて WINDOW_UPDATE を送る
    async fn maybe_send_window_updates(&mut self, stream_id: u32) -> Http2Result<()> {
        self.maybe_replenish_conn_window().await?;

        let initial = self.streams.local_initial_window();
        let increment = match self.streams.get_ref(stream_id) {
            Some(s) => initial - s.recv_window,
            None => return Ok(()),
        };
        if increment > initial / 2 {
            let frame = self.frame_enc.window_update(stream_id, increment as u32);
            self.write_all(frame).await?;
            if let Some(s) = self.streams.get(stream_id) {
                s.recv_window += increment;
            }
        }
        Ok(())
    }

    async fn maybe_replenish_conn_window(&mut self) -> Http2Result<()> {
        let consumed = self.conn_recv_target - self.conn_recv_window;
        if consumed > self.conn_recv_target / 2 {
            let frame = self.frame_enc.window_update(0, consumed as u32);
            self.write_all(frame).await?;
            self.conn_recv_window = self.conn_recv_target;
        }
        Ok(())
    }

    /// リクエスト完了時に未補充分をすべて返す
    ///
    /// ハンドラはボディ全体を消費するため、受信分に相当する WINDOW_UPDATE を
    /// コネクション・ストリーム両レベルで送出します。
    async fn flush_window_updates(&mut self, stream_id: u32) -> Http2Result<()> {
        let consumed = self.conn_recv_target - self.conn_recv_window;
        if consumed > 0 {
            let frame = self.frame_enc.window_update(0, consumed as u32);
            self.write_all(frame).await?;
            self.conn_recv_window = self.conn_recv_target;
        }

        let initial = self.streams.local_initial_window();
        let increment = match self.streams.get_ref(stream_id) {
            Some(s) => initial - s.recv_window,
            None => return Ok(()),
        };
        if increment > 0 {
            let frame = self.frame_enc.window_update(stream_id, increment as u32);
            self.write_all(frame).await?;
            if let Some(s) = self.streams.get(stream_id) {
                s.recv_window += increment;
            }
        }
        Ok(())
    }

    // ====================
    // 送信
    // ====================

    /// レスポンスヘッダーを送信する
    ///
    /// ヘッダー名は小文字へ変換されます (RFC 7540 Section 8.1.2)。ブロックが
    /// ピアの MAX_FRAME_SIZE を超える場合は CONTINUATION に分割されます。
    pub async fn send_response_headers(
        &mut self,
        stream_id: u32,
        status: u16,
        headers: &[(Vec<u8>, Vec<u8>)],
        end_stream: bool,
    ) -> Http2Result<()> {
        let mut status_buf = itoa::Buffer::new();
        let status_str = status_buf.format(status).as_bytes().to_vec();

        let mut lowered: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(headers.len());
        for (name, value) in headers {
            lowered.push((name.to_ascii_lowercase(), value.clone()));
        }

        let mut list: Vec<(&[u8], &[u8], bool)> = Vec::with_capacity(lowered.len() + 1);
        list.push((b":status", &status_str, false));
        for (name, value) in &lowered {
            list.push((name, value, false));
        }

        let block = self
            .hpack_enc
            .encode(&list)
            .map_err(|e| Http2Error::conn(ErrorCode::InternalError, e.to_string()))?;
        self.write_header_block(stream_id, &block, end_stream).await?;

        if status >= 200 {
            if let Some(stream) = self.streams.get(stream_id) {
                stream.send_headers(end_stream)?;
            }
        }
        Ok(())
    }

    /// 1xx 中間レスポンス (END_STREAM なし、状態遷移なし)
    pub async fn send_informational(&mut self, stream_id: u32, status: u16) -> Http2Result<()> {
        debug_assert!((100..200).contains(&status));
        self.send_response_headers(stream_id, status, &[], false).await
    }

    /// ヘッダーブロックを HEADERS + CONTINUATION 列として書き出す
    async fn write_header_block(
        &mut self,
        stream_id: u32,
        block: &[u8],
        end_stream: bool,
    ) -> Http2Result<()> {
        let max = self.peer.max_frame_size as usize;

        if block.len() <= max {
            let frame = self.frame_enc.headers(stream_id, block, end_stream, true);
            return self.write_all(frame).await;
        }

        let mut chunks = block.chunks(max);
        let first = chunks.next().unwrap();
        let frame = self.frame_enc.headers(stream_id, first, end_stream, false);
        self.write_all(frame).await?;

        let mut rest = chunks.peekable();
        while let Some(chunk) = rest.next() {
            let last = rest.peek().is_none();
            let frame = self.frame_enc.continuation(stream_id, chunk, last);
            self.write_all(frame).await?;
        }
        Ok(())
    }

    /// トレーラーを送信する (END_STREAM 付き HEADERS)
    pub async fn send_trailers(
        &mut self,
        stream_id: u32,
        trailers: &[(Vec<u8>, Vec<u8>)],
    ) -> Http2Result<()> {
        let mut list: Vec<(&[u8], &[u8], bool)> = Vec::with_capacity(trailers.len());
        let lowered: Vec<(Vec<u8>, Vec<u8>)> = trailers
            .iter()
            .map(|(n, v)| (n.to_ascii_lowercase(), v.clone()))
            .collect();
        for (name, value) in &lowered {
            list.push((name, value, false));
        }

        let block = self
            .hpack_enc
            .encode(&list)
            .map_err(|e| Http2Error::conn(ErrorCode::InternalError, e.to_string()))?;
        self.write_header_block(stream_id, &block, true).await?;

        if let Some(stream) = self.streams.get(stream_id) {
            stream.send_end_stream()?;
        }
        Ok(())
    }

    /// DATA を送信する
    ///
    /// ピアの MAX_FRAME_SIZE とコネクション・ストリーム両方の送信ウィンドウを
    /// 尊重して分割送信します。ウィンドウが尽きた場合は受信フレームを処理
    /// しながら WINDOW_UPDATE を待ちます。
    pub async fn send_data(
        &mut self,
        stream_id: u32,
        data: &[u8],
        end_stream: bool,
    ) -> Http2Result<()> {
        let mut offset = 0;

        // 空ボディで END_STREAM のみ送るケース
        if data.is_empty() {
            if end_stream {
                let frame = self.frame_enc.data(stream_id, &[], true);
                self.write_all(frame).await?;
                if let Some(stream) = self.streams.get(stream_id) {
                    stream.send_end_stream()?;
                }
            }
            return Ok(());
        }

        while offset < data.len() {
            let stream_window = self
                .streams
                .get_ref(stream_id)
                .map(|s| s.send_window)
                .unwrap_or(0);
            let window = self.conn_send_window.min(stream_window).max(0) as usize;

            if window == 0 {
                // WINDOW_UPDATE 待ち: 受信処理をインラインで進める
                let frame = self.read_frame().await?;
                self.process_frame(frame).await?;
                if self
                    .streams
                    .get_ref(stream_id)
                    .map(|s| s.state == StreamState::Closed)
                    .unwrap_or(true)
                {
                    return Err(Http2Error::stream(
                        stream_id,
                        ErrorCode::Cancel,
                        "stream reset while awaiting window",
                    ));
                }
                continue;
            }

            let chunk_len = (data.len() - offset)
                .min(self.peer.max_frame_size as usize)
                .min(window);
            let last = offset + chunk_len == data.len();
            let chunk = &data[offset..offset + chunk_len];

            self.conn_send_window -= chunk_len as i32;
            if let Some(stream) = self.streams.get(stream_id) {
                stream.send_window -= chunk_len as i32;
            }

            let frame = self.frame_enc.data(stream_id, chunk, end_stream && last);
            self.write_all(frame).await?;
            offset += chunk_len;
        }

        if end_stream {
            if let Some(stream) = self.streams.get(stream_id) {
                stream.send_end_stream()?;
            }
        }
        Ok(())
    }

    /// 完結したレスポンスを送信する
    ///
    /// content-type が無ければ `text/plain; charset=utf-8` を、content-length が
    /// 無ければボディ長を補います。
    pub async fn send_response(
        &mut self,
        stream_id: u32,
        status: u16,
        headers: &[(Vec<u8>, Vec<u8>)],
        body: &[u8],
    ) -> Http2Result<()> {
        let mut full: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(headers.len() + 2);
        let mut has_type = false;
        let mut has_len = false;
        for (name, value) in headers {
            let lower = name.to_ascii_lowercase();
            has_type |= lower == b"content-type";
            has_len |= lower == b"content-length";
            full.push((lower, value.clone()));
        }
        if !has_type {
            full.push((b"content-type".to_vec(), b"text/plain; charset=utf-8".to_vec()));
        }
        if !has_len {
            let mut buf = itoa::Buffer::new();
            full.push((
                b"content-length".to_vec(),
                buf.format(body.len()).as_bytes().to_vec(),
            ));
        }

        let end_on_headers = body.is_empty();
        self.send_response_headers(stream_id, status, &full, end_on_headers)
            .await?;
        if !end_on_headers {
            self.send_data(stream_id, body, true).await?;
        }
        Ok(())
    }

    pub async fn send_rst_stream(&mut self, stream_id: u32, code: ErrorCode) -> Http2Result<()> {
        let frame = self.frame_enc.rst_stream(stream_id, code as u32);
        self.write_all(frame).await?;
        if let Some(stream) = self.streams.get(stream_id) {
            stream.sent_rst();
        }
        self.ready.retain(|&id| id != stream_id);
        Ok(())
    }

    pub async fn send_goaway(&mut self, code: ErrorCode, debug: &[u8]) -> Http2Result<()> {
        if self.goaway_sent {
            return Ok(());
        }
        let last = self.streams.max_peer_stream_id();
        let frame = self.frame_enc.goaway(last, code as u32, debug);
        self.write_all(frame).await?;
        self.goaway_sent = true;
        Ok(())
    }

    /// エラーに応じて RST_STREAM または GOAWAY を送る
    pub async fn react_to_error(&mut self, err: &Http2Error) {
        if let Some(id) = err.rst_stream_id() {
            let _ = self.send_rst_stream(id, err.error_code()).await;
        } else if err.is_connection_error() {
            let _ = self.send_goaway(err.error_code(), err.to_string().as_bytes()).await;
        }
    }

    // ====================
    // サーブループ
    // ====================

    /// コネクションを駆動する
    ///
    /// フレームを読み取り・処理し、完成したリクエストごとにハンドラを呼び
    /// 出します。アイドルタイムアウトで受信待ちを打ち切り、読み取りが滞った
    /// ストリームへは RST_STREAM (CANCEL) を送ります。
    pub async fn serve<H: Http2Handler>(&mut self, handler: &mut H) -> Http2Result<()> {
        use std::time::Duration;

        let idle = Duration::from_secs(self.local.connection_idle_timeout_secs);

        loop {
            while let Some(stream_id) = self.next_ready() {
                match handler.handle(self, stream_id).await {
                    ConnAction::KeepServing => {}
                    ConnAction::CloseAfterReply => {
                        self.send_goaway(ErrorCode::NoError, b"").await?;
                        return Ok(());
                    }
                    ConnAction::CloseNow => return Ok(()),
                }
                self.streams.sweep_closed();
            }

            if self.goaway_received {
                // 新規ストリームを受け付けず、処理中のものが無ければ閉じる
                self.send_goaway(ErrorCode::NoError, b"").await?;
                return Ok(());
            }

            let frame = match monoio::time::timeout(idle, self.read_frame()).await {
                Ok(Ok(frame)) => frame,
                Ok(Err(Http2Error::ConnectionClosed)) => return Ok(()),
                Ok(Err(e)) => {
                    self.react_to_error(&e).await;
                    return Err(e);
                }
                Err(_) => {
                    // 受信が途絶えた: 読みかけストリームを落とし、全て無活動なら閉じる
                    let stalled = self
                        .streams
                        .read_timed_out(self.local.stream_read_timeout_secs);
                    if stalled.is_empty() {
                        self.send_goaway(ErrorCode::NoError, b"idle timeout").await?;
                        return Ok(());
                    }
                    for id in stalled {
                        let _ = self.send_rst_stream(id, ErrorCode::Cancel).await;
                    }
                    continue;
                }
            };

            if let Err(e) = self.process_frame(frame).await {
                self.react_to_error(&e).await;
                if e.is_connection_error() {
                    return Err(e);
                }
            }
        }
    }

    // ====================
    // ハンドラ向けアクセサ
    // ====================

    /// リクエストのヘッダーとボディを取り出す
    pub fn take_request(&mut self, stream_id: u32) -> Option<(Vec<HeaderField>, Vec<u8>)> {
        self.streams.get(stream_id).map(|s| {
            (
                std::mem::take(&mut s.headers),
                std::mem::take(&mut s.body),
            )
        })
    }

    pub fn stream_state(&self, stream_id: u32) -> Option<StreamState> {
        self.streams.get_ref(stream_id).map(|s| s.state)
    }

    /// 書き込みタイムアウト設定 (秒)
    pub fn stream_write_timeout_secs(&self) -> u64 {
        self.local.stream_write_timeout_secs
    }
}

/// リクエストヘッダーリストの検証 (RFC 7540 Section 8.1.2)
fn validate_header_list(
    headers: &[HeaderField],
    stream_id: u32,
    is_trailer: bool,
) -> Http2Result<()> {
    let mut seen_regular = false;
    let mut method = 0u8;
    let mut scheme = 0u8;
    let mut path = 0u8;
    let mut authority = 0u8;

    for h in headers {
        validate_field_name(&h.name, stream_id)?;
        validate_field_value(&h.value, stream_id)?;

        if h.is_pseudo() {
            if is_trailer {
                return Err(Http2Error::stream(
                    stream_id,
                    ErrorCode::ProtocolError,
                    "pseudo-header in trailers",
                ));
            }
            if seen_regular {
                return Err(Http2Error::stream(
                    stream_id,
                    ErrorCode::ProtocolError,
                    "pseudo-header after regular header",
                ));
            }
            match h.name.as_slice() {
                b":method" => method += 1,
                b":scheme" => scheme += 1,
                b":path" => {
                    path += 1;
                    if h.value.is_empty() {
                        return Err(Http2Error::stream(
                            stream_id,
                            ErrorCode::ProtocolError,
                            "empty :path pseudo-header",
                        ));
                    }
                }
                b":authority" => authority += 1,
                _ => {
                    // :status およびその他の擬似ヘッダーはリクエストで禁止
                    return Err(Http2Error::stream(
                        stream_id,
                        ErrorCode::ProtocolError,
                        format!(
                            "invalid request pseudo-header {}",
                            String::from_utf8_lossy(&h.name)
                        ),
                    ));
                }
            }
        } else {
            seen_regular = true;

            // ホップバイホップヘッダーの禁止 (RFC 7540 Section 8.1.2.2)
            match h.name.as_slice() {
                b"connection" | b"keep-alive" | b"proxy-connection" | b"proxy-authenticate"
                | b"proxy-authorization" | b"transfer-encoding" | b"upgrade" => {
                    return Err(Http2Error::stream(
                        stream_id,
                        ErrorCode::ProtocolError,
                        format!(
                            "connection-specific header {}",
                            String::from_utf8_lossy(&h.name)
                        ),
                    ));
                }
                b"te" => {
                    if h.value.to_ascii_lowercase() != b"trailers" {
                        return Err(Http2Error::stream(
                            stream_id,
                            ErrorCode::ProtocolError,
                            "TE header must be 'trailers'",
                        ));
                    }
                }
                _ => {}
            }
        }
    }

    if !is_trailer {
        for (count, name) in [(method, ":method"), (scheme, ":scheme"), (path, ":path")] {
            if count != 1 {
                return Err(Http2Error::stream(
                    stream_id,
                    ErrorCode::ProtocolError,
                    format!(
                        "{} pseudo-header {}",
                        if count == 0 { "missing" } else { "duplicate" },
                        name
                    ),
                ));
            }
        }
        if authority > 1 {
            return Err(Http2Error::stream(
                stream_id,
                ErrorCode::ProtocolError,
                "duplicate :authority pseudo-header",
            ));
        }
    }

    Ok(())
}

/// ヘッダー名の検証: 小文字かつ有効な token であること
fn validate_field_name(name: &[u8], stream_id: u32) -> Http2Result<()> {
    let body = if name.first() == Some(&b':') {
        &name[1..]
    } else {
        &name[..]
    };
    if body.is_empty() {
        return Err(Http2Error::stream(
            stream_id,
            ErrorCode::ProtocolError,
            "empty header name",
        ));
    }
    for &b in body {
        if b.is_ascii_uppercase() {
            return Err(Http2Error::stream(
                stream_id,
                ErrorCode::ProtocolError,
                "uppercase character in header name",
            ));
        }
        if !is_token_byte(b) {
            return Err(Http2Error::stream(
                stream_id,
                ErrorCode::ProtocolError,
                format!("invalid byte 0x{:02x} in header name", b),
            ));
        }
    }
    Ok(())
}

/// ヘッダー値の検証: NUL / CR / LF を禁止
fn validate_field_value(value: &[u8], stream_id: u32) -> Http2Result<()> {
    if value.iter().any(|&b| b == 0 || b == b'\r' || b == b'\n') {
        return Err(Http2Error::stream(
            stream_id,
            ErrorCode::ProtocolError,
            "invalid byte in header value",
        ));
    }
    Ok(())
}

/// RFC 7230 token 構成文字か
#[inline]
fn is_token_byte(b: u8) -> bool {
    matches!(b,
        b'a'..=b'z' | b'0'..=b'9'
        | b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*'
        | b'+' | b'-' | b'.' | b'^' | b'_' | b'`' | b'|' | b'~')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::testing::{block_on, MemoryStream};

    fn client_settings_frame() -> Vec<u8> {
        FrameEncoder::new(16384).settings(&[])
    }

    fn client_headers(
        enc: &mut HpackEncoder,
        stream_id: u32,
        fields: &[(&[u8], &[u8])],
        end_stream: bool,
    ) -> Vec<u8> {
        let list: Vec<(&[u8], &[u8], bool)> =
            fields.iter().map(|&(n, v)| (n, v, false)).collect();
        let block = enc.encode(&list).unwrap();
        FrameEncoder::new(16384).headers(stream_id, &block, end_stream, true)
    }

    /// 書き込まれたバイト列をフレーム列へ分解する
    fn parse_frames(bytes: &[u8]) -> Vec<(FrameHeader, Vec<u8>)> {
        let mut frames = Vec::new();
        let mut pos = 0;
        while pos + 9 <= bytes.len() {
            let header = FrameHeader::parse(bytes[pos..pos + 9].try_into().unwrap());
            let end = pos + 9 + header.length as usize;
            frames.push((header, bytes[pos + 9..end].to_vec()));
            pos = end;
        }
        frames
    }

    fn run_until_ready<S: AsyncStream>(conn: &mut Http2Connection<S>) -> u32 {
        block_on(async {
            loop {
                if let Some(id) = conn.next_ready() {
                    return id;
                }
                let frame = conn.read_frame().await.unwrap();
                conn.process_frame(frame).await.unwrap();
            }
        })
    }

    /// エラーが出るまでフレームを処理し続ける
    async fn drive<S: AsyncStream>(conn: &mut Http2Connection<S>) -> Http2Result<()> {
        loop {
            let frame = conn.read_frame().await?;
            conn.process_frame(frame).await?;
        }
    }

    #[test]
    fn test_scenario_get_request_200() {
        // プリフェース + SETTINGS + HEADERS(GET, END_STREAM)
        let mut enc = HpackEncoder::new(4096);
        let mut input = defaults::CONNECTION_PREFACE.to_vec();
        input.extend(client_settings_frame());
        input.extend(client_headers(
            &mut enc,
            1,
            &[
                (b":method", b"GET"),
                (b":path", b"/"),
                (b":scheme", b"https"),
            ],
            true,
        ));

        let mut conn = Http2Connection::new(MemoryStream::new(input), Http2Settings::default());
        block_on(conn.handshake()).unwrap();

        let stream_id = run_until_ready(&mut conn);
        assert_eq!(stream_id, 1);

        block_on(conn.send_response(1, 200, &[(b"Foo".to_vec(), b"Bar".to_vec())], b""))
            .unwrap();

        let frames = parse_frames(&conn.stream_written());
        // サーバー SETTINGS → SETTINGS ACK → HEADERS
        assert_eq!(frames[0].0.frame_type, 0x4);
        assert!(frames.iter().any(|(h, _)| h.frame_type == 0x4 && h.is_ack()));

        let (head, block) = frames
            .iter()
            .find(|(h, _)| h.frame_type == 0x1)
            .expect("response HEADERS");
        assert!(head.is_end_stream());
        assert!(head.is_end_headers());

        let mut dec = HpackDecoder::new(4096, 65536);
        let fields = dec.decode(block).unwrap();
        let get = |name: &[u8]| {
            fields
                .iter()
                .find(|f| f.name == name)
                .map(|f| f.value.clone())
                .unwrap_or_default()
        };
        assert_eq!(get(b":status"), b"200");
        assert_eq!(get(b"foo"), b"Bar");
        assert_eq!(get(b"content-type"), b"text/plain; charset=utf-8");
        assert_eq!(get(b"content-length"), b"0");
    }

    #[test]
    fn test_scenario_post_body_window_updates() {
        let mut enc = HpackEncoder::new(4096);
        let fenc = FrameEncoder::new(16384);

        let mut input = defaults::CONNECTION_PREFACE.to_vec();
        input.extend(client_settings_frame());
        input.extend(client_headers(
            &mut enc,
            1,
            &[
                (b":method", b"POST"),
                (b":path", b"/echo"),
                (b":scheme", b"https"),
            ],
            false,
        ));
        input.extend(fenc.data(1, b"Some content", true));

        let mut conn = Http2Connection::new(MemoryStream::new(input), Http2Settings::default());
        block_on(conn.handshake()).unwrap();
        let stream_id = run_until_ready(&mut conn);

        let (headers, body) = conn.take_request(stream_id).unwrap();
        assert_eq!(body, b"Some content");
        assert!(headers.iter().any(|h| h.name == b":method" && h.value == b"POST"));

        // 消費 12 バイト分の WINDOW_UPDATE が両レベルで送られる
        // (デフォルト設定ではハンドシェイク時のウィンドウ拡張は発生しない)
        let frames = parse_frames(&conn.stream_written());
        let conn_wu: u32 = frames
            .iter()
            .filter(|(h, _)| h.frame_type == 0x8 && h.stream_id == 0)
            .map(|(_, p)| u32::from_be_bytes(p[..4].try_into().unwrap()))
            .sum();
        let stream_wu: u32 = frames
            .iter()
            .filter(|(h, _)| h.frame_type == 0x8 && h.stream_id == 1)
            .map(|(_, p)| u32::from_be_bytes(p[..4].try_into().unwrap()))
            .sum();
        assert_eq!(conn_wu, 12);
        assert_eq!(stream_wu, 12);
    }

    #[test]
    fn test_scenario_content_length_mismatch() {
        let mut enc = HpackEncoder::new(4096);
        let fenc = FrameEncoder::new(16384);

        let mut input = defaults::CONNECTION_PREFACE.to_vec();
        input.extend(client_settings_frame());
        input.extend(client_headers(
            &mut enc,
            1,
            &[
                (b":method", b"POST"),
                (b":path", b"/"),
                (b":scheme", b"https"),
                (b"content-length", b"3"),
            ],
            false,
        ));
        input.extend(fenc.data(1, b"hi", true));

        let mut conn = Http2Connection::new(MemoryStream::new(input), Http2Settings::default());
        block_on(conn.handshake()).unwrap();

        let err = block_on(drive(&mut conn)).unwrap_err();

        assert_eq!(err.rst_stream_id(), Some(1));
        assert!(err
            .to_string()
            .contains("request declared a Content-Length of 3 but only wrote 2 bytes"));
    }

    #[test]
    fn test_scenario_connection_window_overflow_goaway() {
        let fenc = FrameEncoder::new(16384);

        let mut input = defaults::CONNECTION_PREFACE.to_vec();
        input.extend(client_settings_frame());
        input.extend(fenc.window_update(0, 0x7FFF_FFFF));

        let mut conn = Http2Connection::new(MemoryStream::new(input), Http2Settings::default());
        block_on(conn.handshake()).unwrap();

        let err = block_on(drive(&mut conn)).unwrap_err();

        assert_eq!(err.error_code(), ErrorCode::FlowControlError);
        block_on(conn.react_to_error(&err));

        let frames = parse_frames(&conn.stream_written());
        let (head, payload) = frames
            .iter()
            .find(|(h, _)| h.frame_type == 0x7)
            .expect("GOAWAY");
        assert_eq!(head.stream_id, 0);
        let last_stream_id = u32::from_be_bytes(payload[..4].try_into().unwrap());
        let code = u32::from_be_bytes(payload[4..8].try_into().unwrap());
        assert_eq!(last_stream_id, 0);
        assert_eq!(code, ErrorCode::FlowControlError as u32);
    }

    #[test]
    fn test_uppercase_header_name_rejected() {
        // リテラルヘッダー名に大文字を含むブロックを手組みする
        let mut enc = HpackEncoder::new(4096);
        let list: Vec<(&[u8], &[u8], bool)> = vec![
            (b":method", b"GET", false),
            (b":path", b"/", false),
            (b":scheme", b"https", false),
            (b"X-Custom", b"v", false),
        ];
        let block = enc.encode(&list).unwrap();
        let frame = FrameEncoder::new(16384).headers(1, &block, true, true);

        let mut input = defaults::CONNECTION_PREFACE.to_vec();
        input.extend(client_settings_frame());
        input.extend(frame);

        let mut conn = Http2Connection::new(MemoryStream::new(input), Http2Settings::default());
        block_on(conn.handshake()).unwrap();

        let err = block_on(drive(&mut conn)).unwrap_err();

        assert_eq!(err.error_code(), ErrorCode::ProtocolError);
        assert_eq!(err.rst_stream_id(), Some(1));
    }

    #[test]
    fn test_interleaved_frame_during_header_block() {
        let mut enc = HpackEncoder::new(4096);
        let fenc = FrameEncoder::new(16384);

        let list: Vec<(&[u8], &[u8], bool)> = vec![
            (b":method", b"GET", false),
            (b":path", b"/", false),
            (b":scheme", b"https", false),
        ];
        let block = enc.encode(&list).unwrap();

        let mut input = defaults::CONNECTION_PREFACE.to_vec();
        input.extend(client_settings_frame());
        // END_HEADERS を立てずに HEADERS を送り、PING を割り込ませる
        input.extend(fenc.headers(1, &block, false, false));
        input.extend(fenc.ping(&[0; 8], false));

        let mut conn = Http2Connection::new(MemoryStream::new(input), Http2Settings::default());
        block_on(conn.handshake()).unwrap();

        let err = block_on(drive(&mut conn)).unwrap_err();

        assert!(err.is_connection_error());
        assert_eq!(err.error_code(), ErrorCode::ProtocolError);
    }

    #[test]
    fn test_bad_preface_rejected() {
        let input = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n".to_vec();
        let mut conn = Http2Connection::new(MemoryStream::new(input), Http2Settings::default());
        let err = block_on(conn.handshake()).unwrap_err();
        assert!(matches!(err, Http2Error::BadPreface));
    }

    #[test]
    fn test_trailers_delivered_and_filtered() {
        let mut enc = HpackEncoder::new(4096);
        let fenc = FrameEncoder::new(16384);

        let mut input = defaults::CONNECTION_PREFACE.to_vec();
        input.extend(client_settings_frame());
        input.extend(client_headers(
            &mut enc,
            1,
            &[
                (b":method", b"POST"),
                (b":path", b"/upload"),
                (b":scheme", b"https"),
                (b"trailer", b"x-checksum"),
            ],
            false,
        ));
        input.extend(fenc.data(1, b"payload", false));
        // トレーラー: 宣言済み 1 つ + 未宣言 1 つ
        let trailer_list: Vec<(&[u8], &[u8], bool)> = vec![
            (b"x-checksum", b"abc123", false),
            (b"x-secret", b"nope", false),
        ];
        let trailer_block = enc.encode(&trailer_list).unwrap();
        input.extend(fenc.headers(1, &trailer_block, true, true));

        let mut conn = Http2Connection::new(MemoryStream::new(input), Http2Settings::default());
        block_on(conn.handshake()).unwrap();
        let stream_id = run_until_ready(&mut conn);

        let stream = conn.streams.get_ref(stream_id).unwrap();
        assert_eq!(stream.trailers.len(), 1);
        assert_eq!(stream.trailers[0].name, b"x-checksum");
        assert_eq!(stream.body, b"payload");
    }

    #[test]
    fn test_informational_then_body_and_trailers() {
        let mut enc = HpackEncoder::new(4096);
        let mut input = defaults::CONNECTION_PREFACE.to_vec();
        input.extend(client_settings_frame());
        input.extend(client_headers(
            &mut enc,
            1,
            &[
                (b":method", b"GET"),
                (b":path", b"/slow"),
                (b":scheme", b"https"),
            ],
            true,
        ));

        let mut conn = Http2Connection::new(MemoryStream::new(input), Http2Settings::default());
        block_on(conn.handshake()).unwrap();
        let stream_id = run_until_ready(&mut conn);

        block_on(async {
            conn.send_informational(stream_id, 103).await?;
            conn.send_response_headers(stream_id, 200, &[], false).await?;
            conn.send_data(stream_id, b"partial", false).await?;
            conn.send_trailers(
                stream_id,
                &[(b"X-Checksum".to_vec(), b"abc".to_vec())],
            )
            .await
        })
        .unwrap();

        assert_eq!(conn.stream_state(stream_id), Some(StreamState::Closed));

        let frames = parse_frames(&conn.stream_written());
        let headers: Vec<_> = frames.iter().filter(|(h, _)| h.frame_type == 0x1).collect();
        // 103 / 200 / トレーラーの 3 つの HEADERS
        assert_eq!(headers.len(), 3);
        assert!(!headers[0].0.is_end_stream());
        assert!(!headers[1].0.is_end_stream());
        assert!(headers[2].0.is_end_stream());

        let mut dec = HpackDecoder::new(4096, 65536);
        let interim = dec.decode(&headers[0].1).unwrap();
        assert_eq!(interim[0].value, b"103");
        let final_head = dec.decode(&headers[1].1).unwrap();
        assert_eq!(final_head[0].value, b"200");
        let trailers = dec.decode(&headers[2].1).unwrap();
        assert_eq!(trailers[0].name, b"x-checksum");

        let data: Vec<_> = frames.iter().filter(|(h, _)| h.frame_type == 0x0).collect();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].1, b"partial");
        assert!(!data[0].0.is_end_stream());
    }

    #[test]
    fn test_large_header_block_split_into_continuation() {
        let mut input = defaults::CONNECTION_PREFACE.to_vec();
        input.extend(client_settings_frame());

        let mut enc = HpackEncoder::new(4096);
        input.extend(client_headers(
            &mut enc,
            1,
            &[
                (b":method", b"GET"),
                (b":path", b"/"),
                (b":scheme", b"https"),
            ],
            true,
        ));

        let mut conn = Http2Connection::new(MemoryStream::new(input), Http2Settings::default());
        block_on(conn.handshake()).unwrap();
        let stream_id = run_until_ready(&mut conn);

        // ピアの MAX_FRAME_SIZE を超えるヘッダーブロックを送らせる
        let big_value = vec![b'v'; 40000];
        conn.peer.max_frame_size = 16384;
        block_on(conn.send_response_headers(
            stream_id,
            200,
            &[(b"x-big".to_vec(), big_value)],
            true,
        ))
        .unwrap();

        let frames = parse_frames(&conn.stream_written());
        let headers_at = frames
            .iter()
            .position(|(h, _)| h.frame_type == 0x1)
            .unwrap();
        let (head, _) = &frames[headers_at];
        assert!(!head.is_end_headers());
        assert!(head.is_end_stream());

        let continuations: Vec<_> = frames[headers_at + 1..]
            .iter()
            .filter(|(h, _)| h.frame_type == 0x9)
            .collect();
        assert!(!continuations.is_empty());
        assert!(continuations.last().unwrap().0.is_end_headers());
        assert!(continuations[..continuations.len() - 1]
            .iter()
            .all(|(h, _)| !h.is_end_headers()));
    }

    impl Http2Connection<MemoryStream> {
        fn stream_written(&self) -> Vec<u8> {
            self.stream.written.clone()
        }
    }
}
