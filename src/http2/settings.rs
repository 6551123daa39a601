//! # HTTP/2 SETTINGS (RFC 7540 Section 6.5)

/// SETTINGS パラメータ ID (RFC 7540 Section 6.5.2)
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingId {
    HeaderTableSize = 0x1,
    EnablePush = 0x2,
    MaxConcurrentStreams = 0x3,
    InitialWindowSize = 0x4,
    MaxFrameSize = 0x5,
    MaxHeaderListSize = 0x6,
}

impl SettingId {
    pub fn from_u16(val: u16) -> Option<Self> {
        match val {
            0x1 => Some(Self::HeaderTableSize),
            0x2 => Some(Self::EnablePush),
            0x3 => Some(Self::MaxConcurrentStreams),
            0x4 => Some(Self::InitialWindowSize),
            0x5 => Some(Self::MaxFrameSize),
            0x6 => Some(Self::MaxHeaderListSize),
            // 未知の ID は無視する (RFC 7540 Section 6.5.2)
            _ => None,
        }
    }
}

/// プロトコル定数とデフォルト値
pub mod defaults {
    /// コネクションプリフェース (24 オクテット)
    pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

    pub const HEADER_TABLE_SIZE: u32 = 4096;
    pub const MAX_CONCURRENT_STREAMS: u32 = 200;
    pub const INITIAL_WINDOW_SIZE: u32 = 65535;
    /// MAX_FRAME_SIZE の下限 (2^14)
    pub const MAX_FRAME_SIZE: u32 = 16384;
    /// MAX_FRAME_SIZE の上限 (2^24 - 1)
    pub const MAX_FRAME_SIZE_CEIL: u32 = 16_777_215;
    pub const MAX_HEADER_LIST_SIZE: u32 = 16384;
    /// フロー制御ウィンドウの上限 (2^31 - 1)
    pub const MAX_WINDOW_SIZE: u32 = 0x7FFF_FFFF;
    /// コネクション受信ウィンドウの初期値
    pub const CONNECTION_WINDOW_SIZE: u32 = 65535;
    /// 大容量ウィンドウモード時のコネクション受信ウィンドウ (2^30)
    pub const LARGE_CONNECTION_WINDOW_SIZE: u32 = 1 << 30;

    // 過負荷防御の既定値
    pub const MAX_RST_STREAM_PER_SECOND: u32 = 100;
    pub const MAX_CONTROL_FRAMES_PER_SECOND: u32 = 500;
    pub const MAX_CONTINUATION_FRAMES: u32 = 10;
    pub const MAX_HEADER_BLOCK_SIZE: usize = 65536;
    /// RST_STREAM 送信後に黙認する追い越しフレーム数
    pub const CLOSED_STREAM_GRACE_FRAMES: u32 = 8;

    pub const CONNECTION_IDLE_TIMEOUT_SECS: u64 = 60;
    pub const STREAM_READ_TIMEOUT_SECS: u64 = 30;
    pub const STREAM_WRITE_TIMEOUT_SECS: u64 = 30;
}

/// サーバー側の HTTP/2 設定
#[derive(Debug, Clone)]
pub struct Http2Settings {
    pub header_table_size: u32,
    pub max_concurrent_streams: u32,
    /// ストリームごとの受信ウィンドウ初期値
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
    /// コネクション受信ウィンドウの目標値
    pub connection_window_size: u32,

    // 過負荷防御
    pub max_rst_stream_per_second: u32,
    pub max_control_frames_per_second: u32,
    pub max_continuation_frames: u32,
    pub max_header_block_size: usize,

    // タイムアウト (秒)
    pub connection_idle_timeout_secs: u64,
    pub stream_read_timeout_secs: u64,
    pub stream_write_timeout_secs: u64,
}

impl Default for Http2Settings {
    fn default() -> Self {
        Self {
            header_table_size: defaults::HEADER_TABLE_SIZE,
            max_concurrent_streams: defaults::MAX_CONCURRENT_STREAMS,
            initial_window_size: defaults::INITIAL_WINDOW_SIZE,
            max_frame_size: defaults::MAX_FRAME_SIZE,
            max_header_list_size: defaults::MAX_HEADER_LIST_SIZE,
            connection_window_size: defaults::CONNECTION_WINDOW_SIZE,
            max_rst_stream_per_second: defaults::MAX_RST_STREAM_PER_SECOND,
            max_control_frames_per_second: defaults::MAX_CONTROL_FRAMES_PER_SECOND,
            max_continuation_frames: defaults::MAX_CONTINUATION_FRAMES,
            max_header_block_size: defaults::MAX_HEADER_BLOCK_SIZE,
            connection_idle_timeout_secs: defaults::CONNECTION_IDLE_TIMEOUT_SECS,
            stream_read_timeout_secs: defaults::STREAM_READ_TIMEOUT_SECS,
            stream_write_timeout_secs: defaults::STREAM_WRITE_TIMEOUT_SECS,
        }
    }
}

impl Http2Settings {
    /// 大容量ウィンドウモードを適用 (コネクション受信ウィンドウを 2^30 へ)
    pub fn with_large_window(mut self) -> Self {
        self.connection_window_size = defaults::LARGE_CONNECTION_WINDOW_SIZE;
        self
    }

    /// 初回 SETTINGS フレームで広告するパラメータ列
    ///
    /// ENABLE_PUSH はサーバーでは常に 0 を広告します。
    pub fn advertised(&self) -> Vec<(u16, u32)> {
        vec![
            (SettingId::HeaderTableSize as u16, self.header_table_size),
            (SettingId::EnablePush as u16, 0),
            (
                SettingId::MaxConcurrentStreams as u16,
                self.max_concurrent_streams,
            ),
            (SettingId::InitialWindowSize as u16, self.initial_window_size),
            (SettingId::MaxFrameSize as u16, self.max_frame_size),
            (SettingId::MaxHeaderListSize as u16, self.max_header_list_size),
        ]
    }
}

/// ピアから受信した設定値 (送信側パラメータのみ保持)
#[derive(Debug, Clone)]
pub struct PeerSettings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: Option<u32>,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            header_table_size: defaults::HEADER_TABLE_SIZE,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: defaults::INITIAL_WINDOW_SIZE,
            max_frame_size: defaults::MAX_FRAME_SIZE,
            max_header_list_size: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preface_constant() {
        assert_eq!(defaults::CONNECTION_PREFACE.len(), 24);
        assert_eq!(
            defaults::CONNECTION_PREFACE,
            b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
        );
    }

    #[test]
    fn test_default_bounds() {
        let settings = Http2Settings::default();
        assert!(settings.max_frame_size >= defaults::MAX_FRAME_SIZE);
        assert!(settings.max_frame_size <= defaults::MAX_FRAME_SIZE_CEIL);
        assert!(settings.initial_window_size <= defaults::MAX_WINDOW_SIZE);
        assert!(settings.max_concurrent_streams > 0);
    }

    #[test]
    fn test_advertised_push_disabled() {
        let settings = Http2Settings::default();
        let advertised = settings.advertised();
        let push = advertised
            .iter()
            .find(|(id, _)| *id == SettingId::EnablePush as u16)
            .unwrap();
        assert_eq!(push.1, 0);
    }

    #[test]
    fn test_large_window_mode() {
        let settings = Http2Settings::default().with_large_window();
        assert_eq!(settings.connection_window_size, 1 << 30);
        assert!(settings.connection_window_size <= defaults::MAX_WINDOW_SIZE);
    }

    #[test]
    fn test_setting_id_mapping() {
        assert_eq!(SettingId::from_u16(0x1), Some(SettingId::HeaderTableSize));
        assert_eq!(SettingId::from_u16(0x6), Some(SettingId::MaxHeaderListSize));
        assert_eq!(SettingId::from_u16(0x7), None);
    }
}
