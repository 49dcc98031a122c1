use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_parser::{extensions::GeneralName, prelude::X509Certificate};

/// 证书指纹长度（SHA-256）。
pub const FINGERPRINT_LEN: usize = 32;

/// 对端证书描述。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 校验钩子只需要做“指纹固定”或“主机名 + 有效期”两类判断，不应接触完整的 X.509 结构；
///   因此握手时从叶子证书提取最小必要字段，构造一个不可变值交给钩子。
///
/// ## 逻辑（How）
/// - `fingerprint`：对 DER 编码整体做 SHA-256，作为内容寻址的证书身份；
/// - `hostnames`：按证书顺序收集 subjectAltName 中的 DNS 名称与 IP 地址；
/// - 有效期取自 `validity`，以 [`SystemTime`] 表达，早于 1970 的时间同样可表示。
///
/// ## 契约（What）
/// - 每次握手只构造一次，构造后不可变；
/// - 证书无法解析时返回 [`CertificateParseError`]，钩子不会被调用。
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateDescriptor {
    fingerprint: [u8; FINGERPRINT_LEN],
    hostnames: Vec<String>,
    valid_not_before: SystemTime,
    valid_not_after: SystemTime,
}

/// 证书解析失败。
#[derive(Debug, Error)]
pub enum CertificateParseError {
    #[error("malformed certificate DER: {0}")]
    Der(String),
    #[error("malformed subjectAltName extension: {0}")]
    SubjectAltName(String),
}

impl CertificateDescriptor {
    /// 直接以字段构造描述，主要供测试与自定义传输实现使用。
    pub fn new(
        fingerprint: [u8; FINGERPRINT_LEN],
        hostnames: Vec<String>,
        valid_not_before: SystemTime,
        valid_not_after: SystemTime,
    ) -> Self {
        Self {
            fingerprint,
            hostnames,
            valid_not_before,
            valid_not_after,
        }
    }

    /// 从叶子证书的 DER 编码构造描述。
    pub fn from_der(der: &[u8]) -> Result<Self, CertificateParseError> {
        let (_, cert) = x509_parser::parse_x509_certificate(der)
            .map_err(|err| CertificateParseError::Der(err.to_string()))?;
        let hostnames = subject_alt_names(&cert)?;
        let validity = cert.validity();
        Ok(Self {
            fingerprint: sha256_fingerprint(der),
            hostnames,
            valid_not_before: from_unix(validity.not_before.timestamp()),
            valid_not_after: from_unix(validity.not_after.timestamp()),
        })
    }

    pub fn fingerprint(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.fingerprint
    }

    /// 小写十六进制指纹，便于配置文件中的固定值比对。
    pub fn fingerprint_hex(&self) -> String {
        hex::encode(self.fingerprint)
    }

    pub fn hostnames(&self) -> &[String] {
        &self.hostnames
    }

    pub fn valid_not_before(&self) -> SystemTime {
        self.valid_not_before
    }

    pub fn valid_not_after(&self) -> SystemTime {
        self.valid_not_after
    }

    /// 有效期起点，单位为 Unix 秒。
    pub fn not_before_unix(&self) -> i64 {
        to_unix(self.valid_not_before)
    }

    /// 有效期终点，单位为 Unix 秒。
    pub fn not_after_unix(&self) -> i64 {
        to_unix(self.valid_not_after)
    }

    /// `time` 是否落在 `[not_before, not_after]` 闭区间内。
    pub fn is_valid_at(&self, time: SystemTime) -> bool {
        self.valid_not_before <= time && time <= self.valid_not_after
    }

    /// 证书是否声明了 `name`。
    ///
    /// 比较忽略大小写与末尾的 `.`；仅支持最左侧整段 `*.` 通配，且通配只匹配一个标签。
    pub fn matches_hostname(&self, name: &str) -> bool {
        let wanted = normalize(name);
        if wanted.is_empty() {
            return false;
        }
        self.hostnames
            .iter()
            .any(|declared| hostname_matches(&normalize(declared), &wanted))
    }
}

impl fmt::Debug for CertificateDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateDescriptor")
            .field("fingerprint", &self.fingerprint_hex())
            .field("hostnames", &self.hostnames)
            .field("not_before", &self.not_before_unix())
            .field("not_after", &self.not_after_unix())
            .finish()
    }
}

/// 计算 DER 编码的 SHA-256 指纹。
pub fn sha256_fingerprint(der: &[u8]) -> [u8; FINGERPRINT_LEN] {
    Sha256::digest(der).into()
}

fn subject_alt_names(cert: &X509Certificate<'_>) -> Result<Vec<String>, CertificateParseError> {
    let extension = cert
        .subject_alternative_name()
        .map_err(|err| CertificateParseError::SubjectAltName(err.to_string()))?;
    let Some(extension) = extension else {
        return Ok(Vec::new());
    };
    let names = extension
        .value
        .general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::DNSName(dns) => Some((*dns).to_string()),
            GeneralName::IPAddress(raw) => ip_from_octets(raw).map(|ip| ip.to_string()),
            _ => None,
        })
        .collect();
    Ok(names)
}

fn ip_from_octets(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        4 => {
            let octets: [u8; 4] = raw.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = raw.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

fn from_unix(seconds: i64) -> SystemTime {
    let magnitude = Duration::from_secs(seconds.unsigned_abs());
    if seconds >= 0 {
        UNIX_EPOCH + magnitude
    } else {
        UNIX_EPOCH - magnitude
    }
}

fn to_unix(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_secs()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_secs())
            .map(|secs| -secs)
            .unwrap_or(i64::MIN),
    }
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

fn hostname_matches(declared: &str, wanted: &str) -> bool {
    if declared == wanted {
        return true;
    }
    let Some(suffix) = declared.strip_prefix("*.") else {
        return false;
    };
    match wanted.split_once('.') {
        Some((label, rest)) => !label.is_empty() && rest == suffix,
        None => false,
    }
}
