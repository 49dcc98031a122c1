#![doc = r#"
# tlstask-core

## 设计动机（Why）
- **可注入的信任策略**：调用方在每次建连时传入一个校验钩子（指纹固定、主机名 + 有效期或任意组合），
  握手在钩子给出结论之前不会完成，拒绝时不会有任何应用数据被发送；
- **可推理的连接生命周期**：以显式状态机 `Handshaking → Open → ReadClosed/WriteClosed → Closed`
  与终态 `Failed` 取代回调式的会话管理，每个读写请求都恰好完成一次；
- **与 TLS 实现解耦**：记录层与握手协议由 [`SecureConnector`] 的实现提供（见 `tlstask-rustls`），
  核心只负责信任决策、请求调度与错误分类，因此可以用内存传输完整测试全部不变量。

## 核心契约（What）
- [`ConnectionManager::open_connection`]：建连、握手并经钩子校验，成功返回处于 `Open` 的 [`ConnectionTask`]；
- [`ConnectionTask::read`]：至多一个在途读请求，EOF 之后恒返回 `(empty, true)`；
- [`ConnectionTask::write`]：按提交顺序完成，失败时在途与排队写入依次以同一错误完成；
- [`ConnectionTask::close_read`] / [`ConnectionTask::close_write`]：幂等的半关闭，互不影响；
- 错误统一为 [`TaskError`]，以 [`ErrorKind`] 区分网络不可达、协议失败、策略拒绝与流式 I/O 失败。

## 实现策略（How）
- 每条连接拆成读、写两个半部，分别由一个 Tokio 任务独占驱动；调用方请求在一把
  `parking_lot::Mutex` 保护的状态中同步登记，再由 `Notify` 唤醒对应的泵；
- 状态变化经 `tokio::sync::watch` 广播，泵据此放弃被取消的 I/O，调用方据此等待关闭确认；
- 握手期间由 [`ValidationGate`] 解析叶子证书、调用钩子并记录结论，管理器据此区分
  `CertificateRejected` 与普通握手失败。

## 风险与考量（Trade-offs）
- 任务必须在 Tokio 运行时内创建；丢弃句柄会触发双向关闭，已排队的写入仍会尽力发出；
- 读取超时只失败当前请求，写入超时使连接进入 `Failed`，因为无法得知已写出多少字节。
"#]

mod certificate;
mod config;
mod error;
mod manager;
mod state;
mod task;
mod transport;
mod validation;

pub use certificate::{
    CertificateDescriptor, CertificateParseError, FINGERPRINT_LEN, sha256_fingerprint,
};
pub use config::{ConfigError, DEFAULT_MAX_READ_LEN, ManagerConfig};
pub use error::{ErrorKind, SharedCause, TaskError};
pub use manager::ConnectionManager;
pub use state::ConnectionState;
pub use task::{Completion, ConnectionTask, ReadOutcome};
pub use transport::{
    BoxError, PeerCertificate, Received, SecureConnector, SecureTransport, Target,
    TransportFailure, TransportReader, TransportWriter,
};
pub use validation::{
    Clock, FixedClock, GateOutcome, HostnameAndValidity, PinnedFingerprint, SystemClock,
    ValidationGate, ValidationHook, Verdict, all_of,
};

/// 供传输实现使用的 `async_trait` 重导出，保证 trait 签名与核心一致。
pub use async_trait::async_trait;
