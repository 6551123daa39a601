//! # トランスポート抽象
//!
//! monoio の rent 型 I/O を単一トレイトに包み、平文 TCP と TLS 終端後の
//! ストリームを同じコードパスで扱えるようにします。テストでは同じトレイトを
//! インメモリ実装で差し替えます。

use std::io;

use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::TcpStream;
use monoio_rustls::ServerTlsStream;

/// 読み書き両方向のバイトストリーム
///
/// `write_all_buf` は成功時に全バイトの書き込みを保証します。
pub trait AsyncStream {
    async fn read_buf(&mut self, buf: Vec<u8>) -> (io::Result<usize>, Vec<u8>);
    async fn write_all_buf(&mut self, buf: Vec<u8>) -> (io::Result<usize>, Vec<u8>);
}

impl AsyncStream for TcpStream {
    async fn read_buf(&mut self, buf: Vec<u8>) -> (io::Result<usize>, Vec<u8>) {
        self.read(buf).await
    }

    async fn write_all_buf(&mut self, buf: Vec<u8>) -> (io::Result<usize>, Vec<u8>) {
        self.write_all(buf).await
    }
}

impl AsyncStream for ServerTlsStream<TcpStream> {
    async fn read_buf(&mut self, buf: Vec<u8>) -> (io::Result<usize>, Vec<u8>) {
        self.read(buf).await
    }

    async fn write_all_buf(&mut self, buf: Vec<u8>) -> (io::Result<usize>, Vec<u8>) {
        self.write_all(buf).await
    }
}
