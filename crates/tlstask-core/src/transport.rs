//! 安全传输契约：握手、拆分读写半部与半关闭。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - TLS 记录层与握手协议由外部实现（见 `tlstask-rustls`），本模块只约定连接任务需要的
//!   最小能力：完成握手、按上限读取解密后的字节、按序写入、各方向独立关闭与放弃连接；
//! - 握手期间对端证书通过 [`ValidationGate`] 交还给管理器做信任决策，传输实现本身不持有
//!   任何信任策略。
//!
//! ## 逻辑（How）
//! - [`SecureConnector`] 负责建连 + 握手，握手成功后产出 [`SecureTransport`]；
//! - [`SecureTransport::split`] 把连接拆成 [`TransportReader`] 与 [`TransportWriter`]，分别交给
//!   连接任务的读泵与写泵独占持有；
//! - 所有失败以 [`TransportFailure`] 表达，由核心映射为 [`TaskError`](crate::TaskError)。
//!
//! ## 契约（What）
//! - `receive` 必须可安全取消：在 `close_read` 时读泵会丢弃正在等待的 `receive` Future；
//! - `close_send` 只会被调用一次，且只在全部排队写入完成之后；
//! - 任务进入 `Failed` 后不会再触碰任何半部，直接丢弃以释放资源。

use std::{error::Error as StdError, fmt};

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

use crate::{
    error::{self, SharedCause, TaskError},
    validation::ValidationGate,
};

/// 传输实现返回的装箱错误。
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// 握手目标：已校验的主机名与端口。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    host: String,
    port: u16,
}

impl Target {
    /// 校验并构造目标；主机名不可为空，端口不可为 0。
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, TaskError> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(error::invalid_target("host must not be empty"));
        }
        if port == 0 {
            return Err(error::invalid_target("port must be within 1..=65535"));
        }
        Ok(Self { host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// 握手期间由传输层上报的对端叶子证书（DER 编码）。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerCertificate {
    der: Bytes,
}

impl PeerCertificate {
    pub fn from_der(der: impl Into<Bytes>) -> Self {
        Self { der: der.into() }
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }
}

/// 一次 `receive` 的结果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Received {
    /// 至少一个字节的明文。
    Data(Bytes),
    /// 对端已干净地结束写方向。
    Eof,
}

/// 传输层失败。
///
/// 变体决定映射后的 [`ErrorKind`](crate::ErrorKind)：`Unreachable` → `HostUnreachable`，
/// `Handshake` → `HandshakeFailed`，`Io` → `TransportError`。
#[derive(Debug, Error)]
pub enum TransportFailure {
    /// 解析或建连失败，握手尚未开始。
    #[error("peer unreachable: {source}")]
    Unreachable { source: BoxError },
    /// 协议层握手失败。
    #[error("handshake failed: {source}")]
    Handshake { source: BoxError },
    /// 加密通道上的 I/O 失败。
    #[error("transport i/o failed: {source}")]
    Io { source: BoxError },
}

impl TransportFailure {
    pub fn unreachable(source: impl Into<BoxError>) -> Self {
        Self::Unreachable {
            source: source.into(),
        }
    }

    pub fn handshake(source: impl Into<BoxError>) -> Self {
        Self::Handshake {
            source: source.into(),
        }
    }

    pub fn io(source: impl Into<BoxError>) -> Self {
        Self::Io {
            source: source.into(),
        }
    }

    pub(crate) fn into_cause(self) -> SharedCause {
        match self {
            Self::Unreachable { source } | Self::Handshake { source } | Self::Io { source } => {
                SharedCause::from(source)
            }
        }
    }
}

/// 建连与握手入口。
///
/// 实现必须在握手过程中恰好一次地把对端叶子证书交给 `gate.evaluate`，并在其返回
/// [`Verdict::Reject`](crate::Verdict::Reject) 时中止握手、关闭底层连接后返回错误。
#[async_trait]
pub trait SecureConnector: Send + Sync + 'static {
    type Transport: SecureTransport;

    async fn handshake(
        &self,
        target: &Target,
        gate: Arc<ValidationGate>,
    ) -> Result<Self::Transport, TransportFailure>;
}

/// 握手完成的加密连接。
#[async_trait]
pub trait SecureTransport: Send + 'static {
    type Reader: TransportReader;
    type Writer: TransportWriter;

    /// 拆分为独立的读写半部。
    fn split(self) -> (Self::Reader, Self::Writer);

    /// 立即放弃连接，不发送任何收尾数据。
    async fn abort(self);

    /// 对端描述，仅用于日志。
    fn peer_label(&self) -> String {
        String::from("unknown")
    }
}

/// 读半部。
#[async_trait]
pub trait TransportReader: Send + 'static {
    /// 读取至多 `max_len` 字节；至少拿到一个字节或到达 EOF 即返回。
    ///
    /// 返回空的 `Data` 不会完成调用方的读请求，连接任务会再次调用 `receive`。
    async fn receive(&mut self, max_len: usize) -> Result<Received, TransportFailure>;

    /// 关闭读方向。
    async fn close_receive(&mut self);
}

/// 写半部。
#[async_trait]
pub trait TransportWriter: Send + 'static {
    /// 完整写出 `data`。
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportFailure>;

    /// 关闭写方向并通知对端 EOF。
    async fn close_send(&mut self) -> Result<(), TransportFailure>;
}
