use std::{borrow::Cow, error::Error as StdError, fmt, sync::Arc};

use thiserror::Error;

use crate::transport::TransportFailure;

/// 错误来源的共享句柄。
///
/// 同一次传输失败需要扇出给在途读请求与整条写队列，因此来源以 `Arc` 持有，
/// 使 [`TaskError`] 可以廉价克隆。
pub type SharedCause = Arc<dyn StdError + Send + Sync + 'static>;

/// 连接任务错误分类。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将握手、信任策略与流式 I/O 中的失败收敛为少量稳定分类，调用方据此区分“网络不可达”、
///   “协议失败”与“信任策略拒绝”，而无需理解 `rustls` 或 Tokio 的具体错误类型。
///
/// ## 契约（What）
/// - `HostUnreachable`：解析或建连失败，握手尚未开始；
/// - `HandshakeFailed`：协议层失败（无共同套件、版本不支持、证书无法解析等）；
/// - `CertificateRejected`：校验钩子拒绝了对端证书；
/// - `TransportError`：握手期间或建立后的 I/O 失败、超时，以及任务进入 `Failed` 之后的所有操作；
/// - `ReadClosed` / `WriteClosed`：对应方向已被调用方关闭；
/// - `ConcurrentReadNotAllowed`：已有读请求在途；
/// - `InvalidTarget`：主机名为空或端口为 0，不会触发任何网络活动。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidTarget,
    HostUnreachable,
    HandshakeFailed,
    CertificateRejected,
    TransportError,
    ReadClosed,
    WriteClosed,
    ConcurrentReadNotAllowed,
}

impl ErrorKind {
    /// 返回稳定的蛇形命名标识，便于日志与指标聚合。
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidTarget => "invalid_target",
            ErrorKind::HostUnreachable => "host_unreachable",
            ErrorKind::HandshakeFailed => "handshake_failed",
            ErrorKind::CertificateRejected => "certificate_rejected",
            ErrorKind::TransportError => "transport_error",
            ErrorKind::ReadClosed => "read_closed",
            ErrorKind::WriteClosed => "write_closed",
            ErrorKind::ConcurrentReadNotAllowed => "concurrent_read_not_allowed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 连接任务对外暴露的唯一错误类型。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 与成功结果走同一条完成通道交付，调用方永远不会遇到 panic 式的失败；
/// - 同时携带分类、稳定错误码与底层原因，满足“可区分网络、协议、信任策略”的诊断需求。
///
/// ## 逻辑（How）
/// - `kind` 决定调用方的分支逻辑；`code` 形如 `tlstask.<area>.<what>`，在版本之间保持稳定；
/// - `source` 以 [`SharedCause`] 保存底层错误，克隆时只增加引用计数。
///
/// ## 契约（What）
/// - `Display` 输出 `[code] message`，`Error::source` 返回底层原因（若有）；
/// - 实例不可变，构造后只能通过 `with_source` 追加原因。
#[derive(Clone, Debug, Error)]
#[error("[{code}] {message}")]
pub struct TaskError {
    kind: ErrorKind,
    code: &'static str,
    message: Cow<'static, str>,
    #[source]
    source: Option<SharedCause>,
}

impl TaskError {
    /// 以分类、错误码与文案构造错误。
    pub fn new(kind: ErrorKind, code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            source: None,
        }
    }

    /// 附加底层原因。
    pub fn with_source(mut self, source: SharedCause) -> Self {
        self.source = Some(source);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// 判断错误是否属于给定分类。
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

/// 描述一次操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "tlstask.connect.unreachable",
    message: "tls connect",
};

pub(crate) const HANDSHAKE: OperationKind = OperationKind {
    code: "tlstask.handshake.failed",
    message: "tls handshake",
};

pub(crate) const HANDSHAKE_IO: OperationKind = OperationKind {
    code: "tlstask.handshake.io_failed",
    message: "tls handshake i/o",
};

pub(crate) const READ: OperationKind = OperationKind {
    code: "tlstask.io.read_failed",
    message: "tls read",
};

pub(crate) const WRITE: OperationKind = OperationKind {
    code: "tlstask.io.write_failed",
    message: "tls write",
};

pub(crate) const SHUTDOWN: OperationKind = OperationKind {
    code: "tlstask.io.shutdown_failed",
    message: "tls write half-close",
};

const INVALID_TARGET_CODE: &str = "tlstask.target.invalid";
const REJECTED_CODE: &str = "tlstask.handshake.certificate_rejected";
const UNVALIDATED_CODE: &str = "tlstask.handshake.certificate_unvalidated";
const MALFORMED_CODE: &str = "tlstask.handshake.certificate_malformed";
const TIMEOUT_CODE: &str = "tlstask.io.timeout";
const READ_CLOSED_CODE: &str = "tlstask.read.closed";
const WRITE_CLOSED_CODE: &str = "tlstask.write.closed";
const CONCURRENT_READ_CODE: &str = "tlstask.read.concurrent";
const ABANDONED_CODE: &str = "tlstask.task.abandoned";

/// 将传输层失败映射为任务错误。
///
/// `Unreachable` 与 `Handshake` 的分类与所处操作无关；`Io` 失败沿用操作自身的错误码并归入
/// `TransportError`。
pub(crate) fn map_failure(kind: OperationKind, failure: TransportFailure) -> TaskError {
    let (error_kind, code) = match &failure {
        TransportFailure::Unreachable { .. } => (ErrorKind::HostUnreachable, CONNECT.code),
        TransportFailure::Handshake { .. } => (ErrorKind::HandshakeFailed, HANDSHAKE.code),
        TransportFailure::Io { .. } => (ErrorKind::TransportError, kind.code),
    };
    let message = format!("{}: {}", kind.message, failure);
    TaskError::new(error_kind, code, message).with_source(failure.into_cause())
}

/// 已建立连接上的失败一律归入 `TransportError`，不论传输层如何分类。
pub(crate) fn stream_failure(kind: OperationKind, failure: TransportFailure) -> TaskError {
    let message = format!("{}: {}", kind.message, failure);
    TaskError::new(ErrorKind::TransportError, kind.code, message).with_source(failure.into_cause())
}

pub(crate) fn invalid_target(reason: &'static str) -> TaskError {
    TaskError::new(ErrorKind::InvalidTarget, INVALID_TARGET_CODE, reason)
}

pub(crate) fn certificate_rejected(host: &str) -> TaskError {
    TaskError::new(
        ErrorKind::CertificateRejected,
        REJECTED_CODE,
        format!("peer certificate for {host} rejected by validation hook"),
    )
}

pub(crate) fn certificate_unvalidated() -> TaskError {
    TaskError::new(
        ErrorKind::HandshakeFailed,
        UNVALIDATED_CODE,
        "handshake completed without consulting the validation hook",
    )
}

pub(crate) fn certificate_malformed(source: SharedCause) -> TaskError {
    TaskError::new(
        ErrorKind::HandshakeFailed,
        MALFORMED_CODE,
        format!("peer certificate could not be parsed: {source}"),
    )
    .with_source(source)
}

/// 构造超时错误；超时统一归入 `TransportError`。
pub(crate) fn timeout_error(kind: OperationKind) -> TaskError {
    let message = format!("{} timed out", kind.message);
    TaskError::new(ErrorKind::TransportError, TIMEOUT_CODE, message)
}

pub(crate) fn read_closed() -> TaskError {
    TaskError::new(
        ErrorKind::ReadClosed,
        READ_CLOSED_CODE,
        "read direction closed by caller",
    )
}

pub(crate) fn write_closed() -> TaskError {
    TaskError::new(
        ErrorKind::WriteClosed,
        WRITE_CLOSED_CODE,
        "write direction closed by caller",
    )
}

pub(crate) fn concurrent_read() -> TaskError {
    TaskError::new(
        ErrorKind::ConcurrentReadNotAllowed,
        CONCURRENT_READ_CODE,
        "a read request is already pending",
    )
}

/// 完成端在交付前被丢弃；仅在泵任务异常退出时出现。
pub(crate) fn abandoned() -> TaskError {
    TaskError::new(
        ErrorKind::TransportError,
        ABANDONED_CODE,
        "connection task dropped the request before completing it",
    )
}
