use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// 单次读取的默认上限：64 KiB。
pub const DEFAULT_MAX_READ_LEN: usize = 64 * 1024;

/// 连接管理器配置。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 核心状态机本身不强制任何超时；需要超时的部署通过配置叠加，超时一律以
///   `TransportError` 交付，仍遵守“每个请求恰好完成一次”；
/// - `max_read_len` 限制单次读取分配的缓冲，防止调用方传入过大的 `max_len`。
///
/// ## 契约（What）
/// - `handshake_timeout`：建连 + 握手 + 校验的总时限；
/// - `read_timeout`：单个读请求等待数据的时限，超时只失败该请求，任务保持可用；
/// - `write_timeout`：单个写请求发送的时限，超时视为连接失败（字节可能已部分写出）；
/// - `max_read_len`：必须大于 0。
///
/// ## TOML 形态
/// ```toml
/// handshake_timeout_ms = 5000
/// read_timeout_ms = 30000
/// write_timeout_ms = 10000
/// max_read_len = 16384
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagerConfig {
    handshake_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    max_read_len: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: None,
            read_timeout: None,
            write_timeout: None,
            max_read_len: DEFAULT_MAX_READ_LEN,
        }
    }
}

/// 配置解析或校验失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration syntax: {0}")]
    Syntax(#[from] toml::de::Error),
    #[error("`{field}` must be greater than zero")]
    Zero { field: &'static str },
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManagerConfig {
    handshake_timeout_ms: Option<u64>,
    read_timeout_ms: Option<u64>,
    write_timeout_ms: Option<u64>,
    max_read_len: Option<usize>,
}

impl ManagerConfig {
    /// 从 TOML 文本加载配置，缺省字段取默认值。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawManagerConfig = toml::from_str(text)?;
        let max_read_len = match raw.max_read_len {
            Some(0) => {
                return Err(ConfigError::Zero {
                    field: "max_read_len",
                });
            }
            Some(len) => len,
            None => DEFAULT_MAX_READ_LEN,
        };
        let config = ManagerConfig {
            handshake_timeout: positive_millis(raw.handshake_timeout_ms, "handshake_timeout_ms")?,
            read_timeout: positive_millis(raw.read_timeout_ms, "read_timeout_ms")?,
            write_timeout: positive_millis(raw.write_timeout_ms, "write_timeout_ms")?,
            max_read_len,
        };
        Ok(config)
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// 设置单次读取上限；0 会被提升为 1。
    pub fn with_max_read_len(mut self, max_read_len: usize) -> Self {
        self.max_read_len = max_read_len.max(1);
        self
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout
    }

    pub fn max_read_len(&self) -> usize {
        self.max_read_len
    }
}

fn positive_millis(value: Option<u64>, field: &'static str) -> Result<Option<Duration>, ConfigError> {
    match value {
        None => Ok(None),
        Some(0) => Err(ConfigError::Zero { field }),
        Some(ms) => Ok(Some(Duration::from_millis(ms))),
    }
}
