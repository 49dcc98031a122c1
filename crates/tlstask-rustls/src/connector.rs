use std::{io, sync::Arc, time::Duration};

use rustls::{ClientConfig, crypto::CryptoProvider, pki_types::ServerName};
use serde::Deserialize;
use tlstask_core::{
    ConfigError, SecureConnector, Target, TransportFailure, ValidationGate, async_trait,
};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::{error, stream::RustlsTransport, verifier::GateVerifier};

/// `rustls` 连接器配置。
///
/// ## TOML 形态
/// ```toml
/// alpn_protocols = ["h2", "http/1.1"]
/// enable_sni = true
/// connect_timeout_ms = 3000
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RustlsConnectorConfig {
    alpn_protocols: Vec<Vec<u8>>,
    enable_sni: bool,
    connect_timeout: Option<Duration>,
}

impl Default for RustlsConnectorConfig {
    fn default() -> Self {
        Self {
            alpn_protocols: Vec::new(),
            enable_sni: true,
            connect_timeout: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConnectorConfig {
    #[serde(default)]
    alpn_protocols: Vec<String>,
    enable_sni: Option<bool>,
    connect_timeout_ms: Option<u64>,
}

impl RustlsConnectorConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConnectorConfig = toml::from_str(text)?;
        let connect_timeout = match raw.connect_timeout_ms {
            Some(0) => {
                return Err(ConfigError::Zero {
                    field: "connect_timeout_ms",
                });
            }
            Some(ms) => Some(Duration::from_millis(ms)),
            None => None,
        };
        Ok(Self {
            alpn_protocols: raw.alpn_protocols.into_iter().map(String::into_bytes).collect(),
            enable_sni: raw.enable_sni.unwrap_or(true),
            connect_timeout,
        })
    }

    /// 追加一个 ALPN 协议标识，按添加顺序协商。
    pub fn with_alpn_protocol(mut self, protocol: impl Into<Vec<u8>>) -> Self {
        self.alpn_protocols.push(protocol.into());
        self
    }

    pub fn with_sni(mut self, enable: bool) -> Self {
        self.enable_sni = enable;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn alpn_protocols(&self) -> &[Vec<u8>] {
        &self.alpn_protocols
    }

    pub fn enable_sni(&self) -> bool {
        self.enable_sni
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }
}

/// 基于 TCP + `rustls` 的 [`SecureConnector`]。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把核心的“建连 + 握手 + 钩子校验”契约落到真实网络上，信任决策通过 [`GateVerifier`]
///   回到调用方注入的钩子；
/// - 每次握手单独构造 `ClientConfig`，因为验证器持有的是本次尝试专属的闸门。
///
/// ## 逻辑（How）
/// 1. 先把主机名转换为 `ServerName`，非法名称视为不可达，不触发网络活动；
/// 2. `TcpStream::connect` 解析并建连，可选 `connect_timeout`，失败统一归入 `Unreachable`；
/// 3. `TlsConnector::connect` 驱动握手，期间 `rustls` 回调验证器；
/// 4. 握手错误按是否携带 `rustls::Error` 区分协议失败与 I/O 失败。
///
/// ## 风险与权衡（Trade-offs）
/// - 不加载根证书，也不做 WebPKI 主机名校验：若需要这些检查，应在钩子中组合
///   `HostnameAndValidity` 等策略；
/// - 每次握手构造配置有少量开销，但避免了跨连接共享可变验证状态。
pub struct RustlsConnector {
    config: RustlsConnectorConfig,
    provider: Arc<CryptoProvider>,
}

impl RustlsConnector {
    pub fn new(config: RustlsConnectorConfig) -> Self {
        Self {
            config,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }

    pub fn config(&self) -> &RustlsConnectorConfig {
        &self.config
    }

    fn client_config(&self, gate: Arc<ValidationGate>) -> Result<ClientConfig, rustls::Error> {
        let verifier = GateVerifier::new(gate, self.provider.signature_verification_algorithms);
        let mut config = ClientConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();
        config.alpn_protocols = self.config.alpn_protocols.clone();
        config.enable_sni = self.config.enable_sni;
        Ok(config)
    }

    async fn connect_tcp(&self, target: &Target) -> Result<TcpStream, TransportFailure> {
        let connect = TcpStream::connect((target.host(), target.port()));
        let tcp = match self.config.connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, connect).await {
                Ok(result) => result.map_err(error::connect_failure)?,
                Err(_) => {
                    return Err(error::connect_failure(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("tcp connect to {target} timed out after {limit:?}"),
                    )));
                }
            },
            None => connect.await.map_err(error::connect_failure)?,
        };
        if let Err(err) = tcp.set_nodelay(true) {
            debug!(error = %err, "failed to disable nagle on tls socket");
        }
        Ok(tcp)
    }
}

impl Default for RustlsConnector {
    fn default() -> Self {
        Self::new(RustlsConnectorConfig::default())
    }
}

#[async_trait]
impl SecureConnector for RustlsConnector {
    type Transport = RustlsTransport;

    async fn handshake(
        &self,
        target: &Target,
        gate: Arc<ValidationGate>,
    ) -> Result<RustlsTransport, TransportFailure> {
        let server_name =
            ServerName::try_from(target.host().to_string()).map_err(TransportFailure::unreachable)?;
        let client_config = self
            .client_config(gate)
            .map_err(TransportFailure::handshake)?;

        let tcp = self.connect_tcp(target).await?;
        debug!(target = %target, "tcp connected, starting tls handshake");

        let stream = TlsConnector::from(Arc::new(client_config))
            .connect(server_name, tcp)
            .await
            .map_err(error::handshake_failure)?;
        let transport = RustlsTransport::new(stream, target);
        debug!(target = %target, negotiated = %transport.negotiated(), "tls handshake completed");
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_and_toml() {
        let defaults = RustlsConnectorConfig::from_toml_str("").expect("空文档合法");
        assert_eq!(defaults, RustlsConnectorConfig::default());
        assert!(defaults.enable_sni());

        let config = RustlsConnectorConfig::from_toml_str(
            r#"
            alpn_protocols = ["h2", "http/1.1"]
            enable_sni = false
            connect_timeout_ms = 1500
            "#,
        )
        .expect("配置合法");
        assert_eq!(config.alpn_protocols(), [b"h2".to_vec(), b"http/1.1".to_vec()]);
        assert!(!config.enable_sni());
        assert_eq!(config.connect_timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn config_rejects_zero_timeout_and_unknown_keys() {
        assert!(matches!(
            RustlsConnectorConfig::from_toml_str("connect_timeout_ms = 0"),
            Err(ConfigError::Zero { .. })
        ));
        assert!(matches!(
            RustlsConnectorConfig::from_toml_str("roots = []"),
            Err(ConfigError::Syntax(_))
        ));
    }

    #[test]
    fn client_config_carries_alpn_and_sni() {
        let connector = RustlsConnector::new(
            RustlsConnectorConfig::default()
                .with_alpn_protocol("tlstask")
                .with_sni(false),
        );
        let gate = Arc::new(ValidationGate::new(
            |_: &tlstask_core::CertificateDescriptor, _: std::time::SystemTime| true,
            Arc::new(tlstask_core::SystemClock),
        ));
        let config = connector.client_config(gate).expect("默认协议版本可用");
        assert_eq!(config.alpn_protocols, [b"tlstask".to_vec()]);
        assert!(!config.enable_sni);
    }
}
