use std::sync::Arc;

use tracing::{Instrument, debug, debug_span, info, warn};

use crate::{
    config::ManagerConfig,
    error::{self, TaskError},
    task::ConnectionTask,
    transport::{SecureConnector, SecureTransport, Target, TransportFailure},
    validation::{Clock, GateOutcome, SystemClock, ValidationGate, ValidationHook},
};

/// 连接管理器：唯一的连接创建入口。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 调用方只需给出主机、端口与一个校验钩子，就能拿到可读写的 [`ConnectionTask`]；
///   建连、握手与信任决策的细节留在管理器与传输实现之间；
/// - 管理器不持有任何全局状态，连接之间互不影响，同一实例可被多个任务并发调用。
///
/// ## 逻辑（How）
/// 1. 校验目标，非法输入直接返回 `InvalidTarget`；
/// 2. 为本次尝试构造 [`ValidationGate`]，交给 [`SecureConnector::handshake`]；
/// 3. 握手结束后结合闸门记录的结论与握手结果决定错误分类：
///    钩子拒绝优先归为 `CertificateRejected`，其次才看传输层的失败；
/// 4. 握手成功但闸门未给出接受结论时放弃连接，绝不交出未经校验的任务。
///
/// ## 契约（What）
/// - 成功返回的任务处于 `Open`；失败时不会产生任何任务，也不会有应用数据被发送；
/// - 钩子在每次尝试中至多调用一次（建连失败时不调用）。
///
/// ## 风险与权衡（Trade-offs）
/// - `handshake_timeout` 覆盖建连 + 握手 + 校验整体，超时归入 `TransportError`；
///   钩子本身应当快速返回，否则会占用握手时间。
pub struct ConnectionManager<C> {
    connector: C,
    config: ManagerConfig,
    clock: Arc<dyn Clock>,
}

impl<C: SecureConnector> ConnectionManager<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            config: ManagerConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// 替换提供给钩子的时钟。
    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// 建立一条经 `hook` 校验的 TLS 连接。
    pub async fn open_connection<H: ValidationHook>(
        &self,
        host: &str,
        port: u16,
        hook: H,
    ) -> Result<ConnectionTask, TaskError> {
        let target = Target::new(host, port)?;
        let span = debug_span!("open_connection", host = %target.host(), port = target.port());
        self.attempt(&target, hook).instrument(span).await
    }

    async fn attempt<H: ValidationHook>(
        &self,
        target: &Target,
        hook: H,
    ) -> Result<ConnectionTask, TaskError> {
        let gate = Arc::new(ValidationGate::new(hook, Arc::clone(&self.clock)));
        debug!(target = %target, "opening tls connection");

        let handshake = self.connector.handshake(target, Arc::clone(&gate));
        let result = match self.config.handshake_timeout() {
            Some(limit) => match tokio::time::timeout(limit, handshake).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(target = %target, ?limit, "tls handshake timed out");
                    return Err(error::timeout_error(error::HANDSHAKE_IO));
                }
            },
            None => handshake.await,
        };

        match result {
            Ok(transport) => self.admit(target, &gate, transport).await,
            Err(failure) => Err(self.classify_failure(target, &gate, failure)),
        }
    }

    async fn admit<T: SecureTransport>(
        &self,
        target: &Target,
        gate: &ValidationGate,
        transport: T,
    ) -> Result<ConnectionTask, TaskError> {
        let rejection = match gate.outcome() {
            GateOutcome::Accepted => {
                let task = ConnectionTask::spawn(transport, &self.config);
                info!(target = %target, task.id = task.id(), "tls connection established");
                return Ok(task);
            }
            GateOutcome::Rejected => error::certificate_rejected(target.host()),
            GateOutcome::Malformed(cause) => error::certificate_malformed(cause),
            GateOutcome::Pending => error::certificate_unvalidated(),
        };
        warn!(target = %target, error = %rejection, "discarding unverified tls connection");
        transport.abort().await;
        Err(rejection)
    }

    fn classify_failure(
        &self,
        target: &Target,
        gate: &ValidationGate,
        failure: TransportFailure,
    ) -> TaskError {
        let mapped = match gate.outcome() {
            GateOutcome::Rejected => error::certificate_rejected(target.host()),
            GateOutcome::Malformed(cause) => error::certificate_malformed(cause),
            GateOutcome::Pending | GateOutcome::Accepted => {
                error::map_failure(error::HANDSHAKE_IO, failure)
            }
        };
        warn!(target = %target, kind = %mapped.kind(), error = %mapped, "tls connection attempt failed");
        mapped
    }
}

impl<C> std::fmt::Debug for ConnectionManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
