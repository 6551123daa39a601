//! # sekisho
//!
//! レイヤ 7 HTTP リバースプロキシ / ゲートウェイ。
//!
//! クライアントの HTTP/1.1 / HTTP/2 を終端し、ホスト名 → プロダクト →
//! クラスタの順にルーティングして、健全性とリトライを考慮したバランシングで
//! バックエンドへ転送します。CPU コアごとに monoio ランタイムを 1 つ立て、
//! SO_REUSEPORT でリスナを共有します。

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod balance;
mod condition;
mod config;
mod http2;
mod ipdict;
mod module;
mod net;
mod proxy;
mod route;

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ftlog::{error, info, warn};
use monoio::net::{TcpListener, TcpStream};
use monoio::time::timeout;
use rustls::crypto::CryptoProvider;
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};

use config::{build_snapshot, FileConfig, SnapshotHolder};
use http2::settings::defaults;
use http2::{Http2Connection, Http2Settings};
use net::AsyncStream;
use proxy::pipeline::{Gateway, GatewayConn};
use proxy::{http1, status};

// ====================
// 定数
// ====================

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// シャットダウンフラグの確認間隔
const ACCEPT_TICK: Duration = Duration::from_secs(1);

static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);

fn main() {
    // rustls 0.23+: プロセスレベルで暗号プロバイダーをインストール (ring)
    CryptoProvider::install_default(rustls::crypto::ring::default_provider())
        .expect("failed to install rustls crypto provider");

    let _guard = ftlog::Builder::new().try_init().unwrap();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("sekisho.toml"));

    let file_config = match FileConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("config load error: {:#}", e);
            std::process::exit(1);
        }
    };
    let snapshot = match build_snapshot(&file_config) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            eprintln!("config build error: {:#}", e);
            std::process::exit(1);
        }
    };

    let holder = Arc::new(SnapshotHolder::new(snapshot));

    let mut h2_settings = Http2Settings {
        max_concurrent_streams: file_config.http2.max_concurrent_streams,
        initial_window_size: file_config
            .http2
            .initial_window_size
            .min(defaults::MAX_WINDOW_SIZE),
        max_frame_size: file_config
            .http2
            .max_frame_size
            .clamp(defaults::MAX_FRAME_SIZE, defaults::MAX_FRAME_SIZE_CEIL),
        ..Http2Settings::default()
    };
    if file_config.http2.large_window {
        h2_settings = h2_settings.with_large_window();
    }

    let mut gateway = Gateway::new(Arc::clone(&holder), h2_settings);
    status::register(&mut gateway.callbacks, Arc::clone(&holder));
    status::register_reload(
        &mut gateway.callbacks,
        Arc::clone(&holder),
        config_path.clone(),
    );
    let gateway = Arc::new(gateway);

    let tls_acceptor = match &file_config.tls {
        Some(tls) => match load_tls_acceptor(tls) {
            Ok(acceptor) => Some(acceptor),
            Err(e) => {
                eprintln!("tls config error: {}", e);
                std::process::exit(1);
            }
        },
        None => None,
    };

    let listen_addr: SocketAddr = file_config
        .server
        .listen
        .parse()
        .expect("listen address validated at load");

    let worker_threads = if file_config.server.worker_threads == 0 {
        num_cpus::get()
    } else {
        file_config.server.worker_threads
    };

    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());

    info!("============================================");
    info!("sekisho gateway");
    info!("Hostname: {}", hostname);
    info!("Listen: {} (tls={})", listen_addr, tls_acceptor.is_some());
    info!("Workers: {}", worker_threads);
    info!("Snapshot: {}", holder.load().version);
    info!("============================================");

    setup_signal_handler();

    let mut handles = Vec::with_capacity(worker_threads);
    for thread_id in 0..worker_threads {
        let gateway = Arc::clone(&gateway);
        let tls_acceptor = tls_acceptor.clone();

        let handle = thread::spawn(move || {
            let mut rt = monoio::RuntimeBuilder::<monoio::FusionDriver>::new()
                .enable_timer()
                .build()
                .expect("failed to create monoio runtime");

            rt.block_on(async move {
                let listener = match create_listener(listen_addr) {
                    Ok(listener) => listener,
                    Err(e) => {
                        error!("[Thread {}] bind error: {}", thread_id, e);
                        return;
                    }
                };
                info!("[Thread {}] worker started", thread_id);

                loop {
                    if SHUTDOWN_FLAG.load(Ordering::Relaxed) {
                        info!("[Thread {}] shutting down", thread_id);
                        break;
                    }

                    let accepted = timeout(ACCEPT_TICK, listener.accept()).await;
                    let (stream, peer_addr) = match accepted {
                        Ok(Ok(pair)) => pair,
                        Ok(Err(e)) => {
                            error!("[Thread {}] accept error: {}", thread_id, e);
                            continue;
                        }
                        // tick: シャットダウン確認へ戻る
                        Err(_) => continue,
                    };
                    let _ = stream.set_nodelay(true);

                    let gateway = Arc::clone(&gateway);
                    let tls_acceptor = tls_acceptor.clone();
                    monoio::spawn(async move {
                        handle_connection(stream, tls_acceptor, gateway, peer_addr).await;
                    });
                }
            });
        });
        handles.push(handle);
    }

    for handle in handles {
        let _ = handle.join();
    }
    info!("sekisho stopped");
}

fn setup_signal_handler() {
    ctrlc::set_handler(move || {
        info!("received shutdown signal");
        SHUTDOWN_FLAG.store(true, Ordering::SeqCst);
    })
    .expect("failed to set signal handler");
}

fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let config = monoio::net::ListenerConfig::default()
        .reuse_port(true)
        .backlog(8192);
    TcpListener::bind_with_config(addr, &config)
}

fn load_tls_acceptor(tls: &config::TlsSection) -> io::Result<monoio_rustls::TlsAcceptor> {
    let cert_file = std::fs::File::open(&tls.cert_path)?;
    let key_file = std::fs::File::open(&tls.key_path)?;

    let mut cert_reader = io::BufReader::new(cert_file);
    let cert_chain = certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;

    let mut key_reader = io::BufReader::new(key_file);
    let key = private_key(&mut key_reader)?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "private key not found"))?;

    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    // ALPN: h2 優先、設定により http/1.1 フォールバック
    server_config.alpn_protocols = if tls.http2_only {
        vec![b"h2".to_vec()]
    } else {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    };

    Ok(monoio_rustls::TlsAcceptor::from(Arc::new(server_config)))
}

async fn handle_connection(
    stream: TcpStream,
    tls_acceptor: Option<monoio_rustls::TlsAcceptor>,
    gateway: Arc<Gateway>,
    peer_addr: SocketAddr,
) {
    // 終端コネクションの宛先 (VIP)
    let (vip, vip_port) = match stream.local_addr() {
        Ok(local) => (Some(local.ip()), local.port()),
        Err(_) => (None, 0),
    };

    match tls_acceptor {
        Some(acceptor) => {
            let tls_stream = match timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => tls,
                Ok(Err(e)) => {
                    warn!("tls handshake error from {}: {}", peer_addr, e);
                    return;
                }
                Err(_) => {
                    warn!("tls handshake timeout from {}", peer_addr);
                    return;
                }
            };
            dispatch(tls_stream, gateway, peer_addr, vip, vip_port, "https").await;
        }
        None => {
            dispatch(stream, gateway, peer_addr, vip, vip_port, "http").await;
        }
    }
}

/// 先頭バイトで HTTP/2 プリフェースか判定し、プロトコル別の処理へ渡す
async fn dispatch<S: AsyncStream>(
    mut stream: S,
    gateway: Arc<Gateway>,
    peer_addr: SocketAddr,
    vip: Option<std::net::IpAddr>,
    vip_port: u16,
    scheme: &'static str,
) {
    let preface = defaults::CONNECTION_PREFACE;
    let mut sniffed: Vec<u8> = Vec::with_capacity(preface.len());

    let is_h2 = loop {
        if !preface.starts_with(&sniffed[..sniffed.len().min(preface.len())]) {
            break false;
        }
        if sniffed.len() >= preface.len() {
            break true;
        }

        let buf = vec![0u8; 1024];
        let read = timeout(TLS_HANDSHAKE_TIMEOUT, stream.read_buf(buf)).await;
        match read {
            Ok((Ok(0), _)) | Err(_) => return,
            Ok((Ok(n), buf)) => sniffed.extend_from_slice(&buf[..n]),
            Ok((Err(_), _)) => return,
        }
    };

    if is_h2 {
        let mut conn = Http2Connection::new(stream, gateway.http2_settings.clone());
        conn.preload(&sniffed);
        if let Err(e) = conn.handshake().await {
            warn!("h2 handshake failed from {}: {}", peer_addr, e);
            return;
        }

        let mut handler = GatewayConn {
            gw: gateway,
            peer_ip: peer_addr.ip(),
            peer_port: peer_addr.port(),
            vip,
            vip_port,
        };
        if let Err(e) = conn.serve(&mut handler).await {
            ftlog::debug!("h2 connection from {} ended: {}", peer_addr, e);
        }
    } else {
        http1::serve(
            stream,
            gateway,
            peer_addr.ip(),
            peer_addr.port(),
            vip,
            vip_port,
            scheme,
            sniffed,
        )
        .await;
    }
}
