use std::{fmt, net::SocketAddr};

use bytes::{BufMut, BytesMut};
use rustls::ProtocolVersion;
use tlstask_core::{
    Received, SecureTransport, Target, TransportFailure, TransportReader, TransportWriter,
    async_trait,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    net::TcpStream,
};
use tokio_rustls::client::TlsStream;
use tracing::debug;

use crate::error;

type Stream = TlsStream<TcpStream>;

/// 握手协商出的连接参数。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Negotiated {
    pub peer_addr: Option<SocketAddr>,
    pub protocol_version: Option<ProtocolVersion>,
    pub alpn_protocol: Option<Vec<u8>>,
}

impl fmt::Display for Negotiated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer_addr {
            Some(addr) => write!(f, "{addr}")?,
            None => f.write_str("unknown")?,
        }
        if let Some(version) = self.protocol_version {
            write!(f, ", {version:?}")?;
        }
        if let Some(alpn) = &self.alpn_protocol {
            write!(f, ", alpn={}", String::from_utf8_lossy(alpn))?;
        }
        Ok(())
    }
}

/// 握手完成的 `rustls` 连接。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 核心按读、写两个方向分别驱动连接，这里用 `tokio::io::split` 把 `TlsStream` 拆成两半，
///   两个泵任务各持一半，互不阻塞；
/// - 协商出的版本与 ALPN 只用于日志标签，构造时一次性读取。
///
/// ## 契约（What）
/// - `receive`：缓冲区大小即 `max_len`，读到 0 字节视为对端 `close_notify`；
///   缺失 `close_notify` 的截断以 I/O 失败返回；
/// - `close_send`：发送 `close_notify` 并关闭 TCP 写方向；
/// - `abort`：直接丢弃连接，不发送任何收尾记录。
pub struct RustlsTransport {
    stream: Stream,
    label: String,
    negotiated: Negotiated,
}

impl RustlsTransport {
    pub(crate) fn new(stream: Stream, target: &Target) -> Self {
        let (tcp, connection) = stream.get_ref();
        let negotiated = Negotiated {
            peer_addr: tcp.peer_addr().ok(),
            protocol_version: connection.protocol_version(),
            alpn_protocol: connection.alpn_protocol().map(<[u8]>::to_vec),
        };
        let label = format!("{target} [{negotiated}]");
        Self {
            stream,
            label,
            negotiated,
        }
    }

    pub fn negotiated(&self) -> &Negotiated {
        &self.negotiated
    }
}

#[async_trait]
impl SecureTransport for RustlsTransport {
    type Reader = RustlsReader;
    type Writer = RustlsWriter;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (read, write) = tokio::io::split(self.stream);
        (RustlsReader { half: read }, RustlsWriter { half: write })
    }

    async fn abort(self) {
        debug!(peer = %self.label, "aborting tls connection");
        drop(self.stream);
    }

    fn peer_label(&self) -> String {
        self.label.clone()
    }
}

pub struct RustlsReader {
    half: ReadHalf<Stream>,
}

#[async_trait]
impl TransportReader for RustlsReader {
    async fn receive(&mut self, max_len: usize) -> Result<Received, TransportFailure> {
        let mut buffer = BytesMut::with_capacity(max_len);
        let mut limited = (&mut buffer).limit(max_len);
        let read = match self.half.read_buf(&mut limited).await {
            Ok(read) => read,
            Err(err) => {
                if error::is_truncation(&err) {
                    debug!(error = %err, "peer closed without close_notify");
                }
                return Err(error::stream_failure(err));
            }
        };
        if read == 0 {
            return Ok(Received::Eof);
        }
        Ok(Received::Data(buffer.freeze()))
    }

    /// TLS 没有只关闭接收方向的记录，读泵随后丢弃 `ReadHalf` 即为关闭；
    /// 对端继续发送的数据由 `rustls` 解密后丢弃，直到写半部也被释放。
    async fn close_receive(&mut self) {
        debug!("tls read direction released");
    }
}

pub struct RustlsWriter {
    half: WriteHalf<Stream>,
}

#[async_trait]
impl TransportWriter for RustlsWriter {
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportFailure> {
        self.half.write_all(data).await.map_err(error::stream_failure)?;
        self.half.flush().await.map_err(error::stream_failure)
    }

    async fn close_send(&mut self) -> Result<(), TransportFailure> {
        self.half.shutdown().await.map_err(error::stream_failure)
    }
}
