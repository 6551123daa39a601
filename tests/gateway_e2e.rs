//! ゲートウェイの E2E テスト
//!
//! ビルド済みバイナリを実際に起動し、テストプロセス内に立てたバックエンドへ
//! HTTP/1.1 リクエストをプロキシさせて動作を確認します。TLS は使わず
//! 平文リスナで駆動します。

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command};
use std::thread;
use std::time::{Duration, Instant};

/// 空きポートを確保する
fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// 固定レスポンスを返す素朴なバックエンド
struct Backend {
    port: u16,
}

impl Backend {
    fn start(body: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let body = body;
                thread::spawn(move || {
                    let mut buf = [0u8; 8192];
                    loop {
                        // ヘッダー終端まで読む (ボディ無し前提の素朴な実装)
                        let mut acc: Vec<u8> = Vec::new();
                        loop {
                            match stream.read(&mut buf) {
                                Ok(0) => return,
                                Ok(n) => {
                                    acc.extend_from_slice(&buf[..n]);
                                    if acc.windows(4).any(|w| w == b"\r\n\r\n") {
                                        break;
                                    }
                                }
                                Err(_) => return,
                            }
                        }

                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nX-Backend: e2e\r\n\r\n{}",
                            body.len(),
                            body
                        );
                        if stream.write_all(response.as_bytes()).is_err() {
                            return;
                        }
                    }
                });
            }
        });

        Self { port }
    }
}

struct GatewayProc {
    child: Child,
    port: u16,
    _config_dir: tempdir::TempDir,
}

// 外部クレート無しの最小 tempdir
mod tempdir {
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU32, Ordering};

    static SEQ: AtomicU32 = AtomicU32::new(0);

    pub struct TempDir(PathBuf);

    impl TempDir {
        pub fn new(prefix: &str) -> std::io::Result<Self> {
            let dir = std::env::temp_dir().join(format!(
                "{}-{}-{}",
                prefix,
                std::process::id(),
                SEQ.fetch_add(1, Ordering::Relaxed)
            ));
            std::fs::create_dir_all(&dir)?;
            Ok(Self(dir))
        }

        pub fn path(&self) -> &Path {
            &self.0
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }
}

impl GatewayProc {
    fn start(backend_port: u16) -> Self {
        let port = free_port();
        let dir = tempdir::TempDir::new("sekisho-e2e").unwrap();

        let config = format!(
            r#"
[server]
listen = "127.0.0.1:{port}"
worker_threads = 1

[routing]
version = "e2e-v1"
default_product = ""

[[routing.host_rules]]
hostname = "news.example.com"
tag = "news"

[[routing.tag_rules]]
tag = "news"
product = "portal"

[[routing.products.portal]]
cond = "default_t"
cluster = "web"

[clusters.web]
timeout_conn_srv = 2000
timeout_response_header = 5000
timeout_read_client = 10000
timeout_read_client_again = 10000
timeout_write_client = 10000
retry_max = 1
cross_retry = 0

[clusters.web.check]
schem = "tcp"
fail_num = 3
check_interval = 3000

[[clusters.web.subclusters]]
name = "local"
backends = [
    {{ name = "b0", addr = "127.0.0.1", port = {backend_port} }},
]
"#
        );

        let config_path = dir.path().join("sekisho.toml");
        std::fs::write(&config_path, config).unwrap();

        let child = Command::new(env!("CARGO_BIN_EXE_sekisho"))
            .arg(&config_path)
            .spawn()
            .expect("failed to spawn gateway");

        let gw = Self {
            child,
            port,
            _config_dir: dir,
        };
        gw.wait_ready();
        gw
    }

    /// リスナが上がるまで待つ
    fn wait_ready(&self) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if TcpStream::connect(("127.0.0.1", self.port)).is_ok() {
                return;
            }
            thread::sleep(Duration::from_millis(50));
        }
        panic!("gateway did not start listening");
    }

    fn request(&self, raw: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", self.port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        stream.write_all(raw.as_bytes()).unwrap();

        let mut response = Vec::new();
        let _ = stream.read_to_end(&mut response);
        String::from_utf8_lossy(&response).into_owned()
    }
}

impl Drop for GatewayProc {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[test]
fn test_proxies_request_to_backend() {
    let backend = Backend::start("hello from backend");
    let gw = GatewayProc::start(backend.port);

    let response = gw.request(
        "GET /index.html HTTP/1.1\r\nHost: news.example.com\r\nConnection: close\r\n\r\n",
    );

    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.contains("x-backend: e2e"), "got: {}", response);
    assert!(response.contains("hello from backend"), "got: {}", response);
    // ゲートウェイ付与の転送系ヘッダーはバックエンド側で付くものなので
    // クライアント向けレスポンスには現れない
    assert!(!response.contains("X-Bfe-Log-Id"));
}

#[test]
fn test_unknown_host_is_rejected() {
    let backend = Backend::start("unused");
    let gw = GatewayProc::start(backend.port);

    let response = gw.request(
        "GET / HTTP/1.1\r\nHost: nobody.example.net\r\nConnection: close\r\n\r\n",
    );

    assert!(response.starts_with("HTTP/1.1 500"), "got: {}", response);
}

#[test]
fn test_status_endpoint() {
    let backend = Backend::start("unused");
    let gw = GatewayProc::start(backend.port);

    let response = gw.request(
        "GET /sekisho/status HTTP/1.1\r\nHost: news.example.com\r\nConnection: close\r\n\r\n",
    );

    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.contains("\"version\": \"e2e-v1\""), "got: {}", response);
}

#[test]
fn test_keep_alive_serves_sequential_requests() {
    let backend = Backend::start("ok");
    let gw = GatewayProc::start(backend.port);

    let mut stream = TcpStream::connect(("127.0.0.1", gw.port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    for _ in 0..2 {
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: news.example.com\r\n\r\n")
            .unwrap();

        // ヘッダー + ボディ "ok" を読み切る
        let mut acc = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    acc.extend_from_slice(&buf[..n]);
                    let text = String::from_utf8_lossy(&acc);
                    if text.contains("\r\n\r\nok") {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        let text = String::from_utf8_lossy(&acc);
        assert!(text.starts_with("HTTP/1.1 200"), "got: {}", text);
        assert!(text.contains("Connection: keep-alive"), "got: {}", text);
    }
}
