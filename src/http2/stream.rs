//! # HTTP/2 ストリーム管理 (RFC 7540 Section 5)
//!
//! ストリームの状態遷移・ストリームレベルのフロー制御・ヘッダーブロックの
//! 再組立てを実装します。コネクションレベルのウィンドウは connection 側が
//! 管理します。

use std::collections::HashMap;
use std::time::Instant;

use crate::http2::error::{ErrorCode, Http2Error, Http2Result};
use crate::http2::hpack::HeaderField;
use crate::http2::settings::defaults;

/// ストリーム状態 (RFC 7540 Section 5.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    ReservedLocal,
    ReservedRemote,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::ReservedLocal => "reserved (local)",
            Self::ReservedRemote => "reserved (remote)",
            Self::Open => "open",
            Self::HalfClosedLocal => "half-closed (local)",
            Self::HalfClosedRemote => "half-closed (remote)",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// HTTP/2 ストリーム
#[derive(Debug)]
pub struct Stream {
    pub id: u32,
    pub state: StreamState,
    /// 送信ウィンドウ (ピアの INITIAL_WINDOW_SIZE 基準)
    pub send_window: i32,
    /// 受信ウィンドウ (自分の INITIAL_WINDOW_SIZE 基準)
    pub recv_window: i32,
    /// デコード済みリクエストヘッダー
    pub headers: Vec<HeaderField>,
    /// 受信済みリクエストボディ
    pub body: Vec<u8>,
    /// `trailer` ヘッダーで宣言されたトレーラー名 (小文字)
    pub declared_trailers: Vec<Vec<u8>>,
    /// 受信したトレーラー (宣言済みの名前のみ)
    pub trailers: Vec<HeaderField>,
    /// content-length ヘッダーの値
    pub content_length: Option<u64>,
    /// DATA で受信した累計バイト数 (パディング除く)
    pub received_body_len: u64,
    /// 再組立て中のヘッダーブロック
    pending_fragment: Vec<u8>,
    /// ヘッダーブロック受信中か
    receiving_headers: bool,
    /// このストリームのヘッダーブロックがトレーラーか
    pub in_trailer_block: bool,
    /// RST_STREAM 送信済みか
    rst_sent: bool,
    /// RST 送信後に黙認したフレーム数
    grace_frames: u32,
    /// 最終受信時刻 (読み取りタイムアウト用)
    pub last_recv: Instant,
}

impl Stream {
    pub fn new(id: u32, send_window: i32, recv_window: i32) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            send_window,
            recv_window,
            headers: Vec::new(),
            body: Vec::new(),
            declared_trailers: Vec::new(),
            trailers: Vec::new(),
            content_length: None,
            received_body_len: 0,
            pending_fragment: Vec::new(),
            receiving_headers: false,
            in_trailer_block: false,
            rst_sent: false,
            grace_frames: 0,
            last_recv: Instant::now(),
        }
    }

    /// HEADERS 受信による状態遷移
    pub fn recv_headers(&mut self, end_stream: bool) -> Http2Result<()> {
        self.last_recv = Instant::now();
        match self.state {
            StreamState::Idle => {
                self.state = if end_stream {
                    StreamState::HalfClosedRemote
                } else {
                    StreamState::Open
                };
                Ok(())
            }
            // Open / HalfClosedLocal での 2 つ目の HEADERS はトレーラー。
            // END_STREAM 必須の検証はコネクション層で行う。
            StreamState::Open => {
                if end_stream {
                    self.state = StreamState::HalfClosedRemote;
                }
                Ok(())
            }
            StreamState::HalfClosedLocal => {
                if end_stream {
                    self.state = StreamState::Closed;
                }
                Ok(())
            }
            _ => Err(Http2Error::stream(
                self.id,
                ErrorCode::StreamClosed,
                format!("HEADERS received in state {}", self.state),
            )),
        }
    }

    /// DATA 受信: ストリームウィンドウを消費しボディへ追記
    ///
    /// `pad_len` はパディング消費分 (パディング + 長さバイト)。
    /// ウィンドウはデータとパディングの両方を消費します (RFC 7540 Section 6.9.1)。
    pub fn recv_data(&mut self, data: &[u8], pad_len: u32, end_stream: bool) -> Http2Result<()> {
        self.last_recv = Instant::now();
        match self.state {
            StreamState::Open | StreamState::HalfClosedLocal => {}
            _ => {
                return Err(Http2Error::stream(
                    self.id,
                    ErrorCode::StreamClosed,
                    format!("DATA received in state {}", self.state),
                ))
            }
        }

        let cost = data.len() as i64 + pad_len as i64;
        if cost > self.recv_window as i64 {
            return Err(Http2Error::stream(
                self.id,
                ErrorCode::FlowControlError,
                "stream flow control window exceeded",
            ));
        }
        self.recv_window -= cost as i32;

        self.body.extend_from_slice(data);
        self.received_body_len += data.len() as u64;

        if end_stream {
            // content-length の照合は遷移後にコネクション層が行う
            self.state = match self.state {
                StreamState::Open => StreamState::HalfClosedRemote,
                StreamState::HalfClosedLocal => StreamState::Closed,
                s => s,
            };
        }
        Ok(())
    }

    /// END_STREAM 時の content-length 検証 (RFC 7540 Section 8.1.2.6)
    pub fn check_content_length(&self) -> Http2Result<()> {
        if let Some(declared) = self.content_length {
            if declared != self.received_body_len {
                return Err(Http2Error::stream(
                    self.id,
                    ErrorCode::ProtocolError,
                    format!(
                        "request declared a Content-Length of {} but only wrote {} bytes",
                        declared, self.received_body_len
                    ),
                ));
            }
        }
        Ok(())
    }

    /// HEADERS 送信による状態遷移
    pub fn send_headers(&mut self, end_stream: bool) -> Http2Result<()> {
        match self.state {
            StreamState::Open | StreamState::HalfClosedRemote => {
                if end_stream {
                    self.state = match self.state {
                        StreamState::Open => StreamState::HalfClosedLocal,
                        StreamState::HalfClosedRemote => StreamState::Closed,
                        s => s,
                    };
                }
                Ok(())
            }
            _ => Err(Http2Error::stream(
                self.id,
                ErrorCode::StreamClosed,
                format!("cannot send HEADERS in state {}", self.state),
            )),
        }
    }

    /// END_STREAM 送信による状態遷移
    pub fn send_end_stream(&mut self) -> Http2Result<()> {
        match self.state {
            StreamState::Open => {
                self.state = StreamState::HalfClosedLocal;
                Ok(())
            }
            StreamState::HalfClosedRemote => {
                self.state = StreamState::Closed;
                Ok(())
            }
            _ => Err(Http2Error::stream(
                self.id,
                ErrorCode::StreamClosed,
                format!("cannot end stream in state {}", self.state),
            )),
        }
    }

    pub fn recv_rst(&mut self) {
        self.state = StreamState::Closed;
    }

    pub fn sent_rst(&mut self) {
        self.state = StreamState::Closed;
        self.rst_sent = true;
    }

    /// RST_STREAM 送信後のフレーム受信を黙認するか
    ///
    /// 送信した RST がピアに届くまでの in-flight フレームを限度付きで無視し、
    /// 限度超過で STREAM_CLOSED を返します。
    pub fn tolerate_after_rst(&mut self) -> bool {
        if !self.rst_sent {
            return false;
        }
        self.grace_frames += 1;
        self.grace_frames <= defaults::CLOSED_STREAM_GRACE_FRAMES
    }

    /// WINDOW_UPDATE 受信: 送信ウィンドウを拡大
    pub fn recv_window_update(&mut self, increment: u32) -> Http2Result<()> {
        match self.send_window.checked_add(increment as i32) {
            Some(w) if w as i64 <= defaults::MAX_WINDOW_SIZE as i64 => {
                self.send_window = w;
                Ok(())
            }
            _ => Err(Http2Error::stream(
                self.id,
                ErrorCode::FlowControlError,
                "stream send window overflow",
            )),
        }
    }

    /// ヘッダーブロック断片を追記
    pub fn push_fragment(&mut self, fragment: &[u8], end_headers: bool) {
        self.pending_fragment.extend_from_slice(fragment);
        self.receiving_headers = !end_headers;
    }

    /// 再組立て済みヘッダーブロックを取り出す
    pub fn take_fragment(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending_fragment)
    }

    pub fn pending_fragment_len(&self) -> usize {
        self.pending_fragment.len()
    }

    pub fn is_receiving_headers(&self) -> bool {
        self.receiving_headers
    }

    /// ヘッダーデコード後の後処理: 擬似ヘッダーと content-length, trailer を控える
    pub fn absorb_request_headers(&mut self, headers: Vec<HeaderField>) {
        for h in &headers {
            match h.name.as_slice() {
                b"content-length" => {
                    self.content_length = std::str::from_utf8(&h.value)
                        .ok()
                        .and_then(|s| s.parse::<u64>().ok());
                }
                b"trailer" => {
                    for name in h.value.split(|&b| b == b',') {
                        let trimmed: Vec<u8> = name
                            .iter()
                            .copied()
                            .skip_while(|b| *b == b' ')
                            .take_while(|b| *b != b' ')
                            .map(|b| b.to_ascii_lowercase())
                            .collect();
                        if !trimmed.is_empty() {
                            self.declared_trailers.push(trimmed);
                        }
                    }
                }
                _ => {}
            }
        }
        self.headers = headers;
    }

    /// トレーラーを取り込む。宣言されていない名前は黙って捨てる。
    pub fn absorb_trailers(&mut self, trailers: Vec<HeaderField>) {
        for t in trailers {
            if self.declared_trailers.iter().any(|d| d[..] == t.name[..]) {
                self.trailers.push(t);
            }
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.state, StreamState::Idle | StreamState::Closed)
    }
}

/// コネクション内の全ストリーム
pub struct StreamTable {
    streams: HashMap<u32, Stream>,
    /// ピア (クライアント) が開いた最大ストリーム ID
    max_peer_stream_id: u32,
    max_concurrent: u32,
    /// 自分の INITIAL_WINDOW_SIZE (新規ストリームの受信ウィンドウ)
    local_initial_window: i32,
    /// ピアの INITIAL_WINDOW_SIZE (新規ストリームの送信ウィンドウ)
    peer_initial_window: i32,
    /// ヘッダーブロック受信中のストリーム ID
    receiving_headers: Option<u32>,
    /// GOAWAY 送受信後の上限ストリーム ID
    goaway_last_stream_id: Option<u32>,
}

impl StreamTable {
    pub fn new(max_concurrent: u32, local_initial_window: i32) -> Self {
        Self {
            streams: HashMap::new(),
            max_peer_stream_id: 0,
            max_concurrent,
            local_initial_window,
            peer_initial_window: defaults::INITIAL_WINDOW_SIZE as i32,
            receiving_headers: None,
            goaway_last_stream_id: None,
        }
    }

    /// ピア開始ストリームを取得または作成
    ///
    /// RFC 7540 Section 5.1.1: ピア開始ストリーム ID は奇数かつ単調増加。
    /// 既知の最大 ID 以下の未知 ID は閉じたストリームとみなします。
    pub fn open_peer_stream(&mut self, id: u32) -> Http2Result<&mut Stream> {
        if id % 2 == 0 {
            return Err(Http2Error::protocol(format!(
                "peer-initiated stream id {} is not odd",
                id
            )));
        }

        if self.streams.contains_key(&id) {
            return Ok(self.streams.get_mut(&id).unwrap());
        }

        if id <= self.max_peer_stream_id {
            return Err(Http2Error::conn(
                ErrorCode::ProtocolError,
                format!(
                    "stream id {} not greater than previously opened {}",
                    id, self.max_peer_stream_id
                ),
            ));
        }

        if let Some(limit) = self.goaway_last_stream_id {
            if id > limit {
                return Err(Http2Error::stream(
                    id,
                    ErrorCode::RefusedStream,
                    "stream id exceeds GOAWAY last-stream-id",
                ));
            }
        }

        if self.active_count() >= self.max_concurrent as usize {
            return Err(Http2Error::stream(
                id,
                ErrorCode::RefusedStream,
                "too many concurrent streams",
            ));
        }

        self.max_peer_stream_id = id;
        self.streams.insert(
            id,
            Stream::new(id, self.peer_initial_window, self.local_initial_window),
        );
        Ok(self.streams.get_mut(&id).unwrap())
    }

    pub fn get(&mut self, id: u32) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub fn get_ref(&self, id: u32) -> Option<&Stream> {
        self.streams.get(&id)
    }

    /// ID が idle (未使用) かどうか
    pub fn is_idle(&self, id: u32) -> bool {
        !self.streams.contains_key(&id) && id > self.max_peer_stream_id
    }

    pub fn active_count(&self) -> usize {
        self.streams.values().filter(|s| s.is_active()).count()
    }

    pub fn max_peer_stream_id(&self) -> u32 {
        self.max_peer_stream_id
    }

    /// クローズ済みストリームを回収
    pub fn sweep_closed(&mut self) {
        self.streams
            .retain(|_, s| s.state != StreamState::Closed || s.is_receiving_headers());
    }

    /// ピアの INITIAL_WINDOW_SIZE 変更を既存ストリームへ適用
    ///
    /// RFC 7540 Section 6.9.2: 差分適用でウィンドウが 2^31-1 を超えるのは
    /// コネクションエラー FLOW_CONTROL_ERROR。
    pub fn apply_peer_initial_window(&mut self, new_size: u32) -> Http2Result<()> {
        let delta = new_size as i64 - self.peer_initial_window as i64;
        self.peer_initial_window = new_size as i32;

        for stream in self.streams.values_mut() {
            let updated = stream.send_window as i64 + delta;
            if updated > defaults::MAX_WINDOW_SIZE as i64 {
                return Err(Http2Error::flow_control(
                    "INITIAL_WINDOW_SIZE change overflows stream window",
                ));
            }
            stream.send_window = updated as i32;
        }
        Ok(())
    }

    pub fn local_initial_window(&self) -> i32 {
        self.local_initial_window
    }

    pub fn set_receiving_headers(&mut self, id: Option<u32>) {
        self.receiving_headers = id;
    }

    pub fn receiving_headers(&self) -> Option<u32> {
        self.receiving_headers
    }

    pub fn set_goaway_last_stream_id(&mut self, id: u32) {
        self.goaway_last_stream_id = Some(id);
    }

    /// 読み取りタイムアウトを超過した受信中ストリームを列挙
    pub fn read_timed_out(&self, timeout_secs: u64) -> Vec<u32> {
        self.streams
            .iter()
            .filter(|(_, s)| {
                matches!(s.state, StreamState::Open | StreamState::HalfClosedLocal)
                    && s.last_recv.elapsed().as_secs() >= timeout_secs
            })
            .map(|(id, _)| *id)
            .collect()
    }
}
