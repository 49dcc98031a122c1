use std::io;

use tlstask_core::TransportFailure;

/// TLS 传输层错误归类工具。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - `tokio-rustls` 把协议错误包装在 `io::Error` 中返回；核心需要据此区分“协议失败”与
///   “网络 I/O 失败”，因此在传输边界处集中拆包，而不是让核心理解 `rustls` 的错误类型。
///
/// ## 逻辑（How）
/// - `connect_failure`：建连阶段的所有错误（拒绝、超时、解析失败）归入 `Unreachable`；
/// - `handshake_failure`：若 `io::Error` 内部携带 `rustls::Error`，归入 `Handshake`，
///   否则视为握手期间的 I/O 失败；
/// - `stream_failure`：握手之后的一切错误都归入 `Io`，包括缺失 `close_notify` 的截断。
///
/// ## 契约（What）
/// - 不丢弃原始错误：返回值的 `source` 链保留完整的 `io::Error`。
pub(crate) fn connect_failure(error: io::Error) -> TransportFailure {
    TransportFailure::unreachable(error)
}

pub(crate) fn handshake_failure(error: io::Error) -> TransportFailure {
    if carries_tls_error(&error) {
        TransportFailure::handshake(error)
    } else {
        TransportFailure::io(error)
    }
}

pub(crate) fn stream_failure(error: io::Error) -> TransportFailure {
    TransportFailure::io(error)
}

/// 协议层错误在 `tokio-rustls` 中以 `InvalidData` 携带 `rustls::Error`。
pub(crate) fn carries_tls_error(error: &io::Error) -> bool {
    error
        .get_ref()
        .is_some_and(|inner| inner.downcast_ref::<rustls::Error>().is_some())
}

/// 判断错误是否源于对端未发送 `close_notify` 就断开连接。
pub(crate) fn is_truncation(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::UnexpectedEof
}
