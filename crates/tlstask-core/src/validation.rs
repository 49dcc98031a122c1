//! 证书校验钩子、时钟与单次握手的校验闸门。

use std::{collections::BTreeSet, fmt, sync::Arc, time::SystemTime};

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    certificate::{CertificateDescriptor, FINGERPRINT_LEN},
    error::SharedCause,
    transport::PeerCertificate,
};

/// 校验结论。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject,
}

impl From<bool> for Verdict {
    fn from(accept: bool) -> Self {
        if accept {
            Verdict::Accept
        } else {
            Verdict::Reject
        }
    }
}

/// 调用方注入的信任策略。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 以单个函数值替代“委托对象”式的回调注册：钩子只在一次 `open_connection` 调用期间被
///   管理器持有，不做持久注册；
/// - 钩子只看到证书描述与当前时间，无法触碰连接状态。
///
/// ## 契约（What）
/// - 每次连接尝试恰好调用一次，调用发生在握手内部，握手在得到结论之前不会继续；
/// - 应当无副作用（可以读取外部时钟或配置）；
/// - 任何 `Fn(&CertificateDescriptor, SystemTime) -> Verdict` 或 `-> bool` 闭包都是钩子。
pub trait ValidationHook: Send + Sync + 'static {
    fn evaluate(&self, descriptor: &CertificateDescriptor, now: SystemTime) -> Verdict;
}

impl<F, R> ValidationHook for F
where
    F: Fn(&CertificateDescriptor, SystemTime) -> R + Send + Sync + 'static,
    R: Into<Verdict>,
{
    fn evaluate(&self, descriptor: &CertificateDescriptor, now: SystemTime) -> Verdict {
        self(descriptor, now).into()
    }
}

/// 提供“当前时间”的时钟。
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> SystemTime;
}

/// 系统墙上时钟。
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// 固定时间点的时钟，用于让有效期判断可复现。
#[derive(Clone, Copy, Debug)]
pub struct FixedClock(pub SystemTime);

impl Clock for FixedClock {
    fn now(&self) -> SystemTime {
        self.0
    }
}

/// 校验闸门记录的结果。
#[derive(Clone, Debug)]
pub enum GateOutcome {
    /// 传输层尚未上报证书。
    Pending,
    Accepted,
    Rejected,
    /// 证书无法解析，钩子未被调用。
    Malformed(SharedCause),
}

/// 单次连接尝试的校验闸门。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 传输层在握手内部同步地拿到对端证书，而信任决策属于管理器；闸门是两者之间唯一的桥，
///   它构造 [`CertificateDescriptor`]、调用钩子并记录结论，让管理器在握手结束后能准确区分
///   “被策略拒绝”与“协议失败”。
///
/// ## 逻辑（How）
/// - 结论存放在互斥锁中；钩子在持锁期间调用，重复的 `evaluate` 直接返回首个结论，
///   从而保证钩子“恰好一次”；
/// - 证书解析失败记为 `Malformed` 并返回 `Reject`，不调用钩子。
///
/// ## 契约（What）
/// - `evaluate`：供传输实现在握手中调用，返回是否继续握手；
/// - `outcome`：供管理器在握手结束后读取结论。
pub struct ValidationGate {
    hook: Box<dyn ValidationHook>,
    clock: Arc<dyn Clock>,
    outcome: Mutex<GateOutcome>,
}

impl ValidationGate {
    pub fn new(hook: impl ValidationHook, clock: Arc<dyn Clock>) -> Self {
        Self {
            hook: Box::new(hook),
            clock,
            outcome: Mutex::new(GateOutcome::Pending),
        }
    }

    /// 对传输层上报的叶子证书做出结论。
    pub fn evaluate(&self, certificate: &PeerCertificate) -> Verdict {
        let mut outcome = self.outcome.lock();
        match &*outcome {
            GateOutcome::Accepted => return Verdict::Accept,
            GateOutcome::Rejected | GateOutcome::Malformed(_) => return Verdict::Reject,
            GateOutcome::Pending => {}
        }

        let descriptor = match CertificateDescriptor::from_der(certificate.der()) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                debug!(error = %err, "peer certificate could not be parsed");
                *outcome = GateOutcome::Malformed(Arc::new(err));
                return Verdict::Reject;
            }
        };

        let verdict = self.hook.evaluate(&descriptor, self.clock.now());
        debug!(
            fingerprint = %descriptor.fingerprint_hex(),
            hostnames = ?descriptor.hostnames(),
            ?verdict,
            "validation hook evaluated"
        );
        *outcome = match verdict {
            Verdict::Accept => GateOutcome::Accepted,
            Verdict::Reject => GateOutcome::Rejected,
        };
        verdict
    }

    pub fn outcome(&self) -> GateOutcome {
        self.outcome.lock().clone()
    }
}

impl fmt::Debug for ValidationGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationGate")
            .field("outcome", &*self.outcome.lock())
            .finish_non_exhaustive()
    }
}

/// 指纹固定策略：指纹在集合内即接受。
#[derive(Clone, Debug, Default)]
pub struct PinnedFingerprint {
    pins: BTreeSet<[u8; FINGERPRINT_LEN]>,
}

impl PinnedFingerprint {
    pub fn new(pins: impl IntoIterator<Item = [u8; FINGERPRINT_LEN]>) -> Self {
        Self {
            pins: pins.into_iter().collect(),
        }
    }

    /// 从十六进制字符串构造（允许 `:` 分隔与大小写混用）。
    pub fn from_hex<I, S>(pins: I) -> Result<Self, hex::FromHexError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = BTreeSet::new();
        for pin in pins {
            let cleaned: String = pin.as_ref().chars().filter(|c| *c != ':').collect();
            let mut digest = [0u8; FINGERPRINT_LEN];
            hex::decode_to_slice(cleaned, &mut digest)?;
            parsed.insert(digest);
        }
        Ok(Self { pins: parsed })
    }

    pub fn contains(&self, fingerprint: &[u8; FINGERPRINT_LEN]) -> bool {
        self.pins.contains(fingerprint)
    }
}

impl ValidationHook for PinnedFingerprint {
    fn evaluate(&self, descriptor: &CertificateDescriptor, _now: SystemTime) -> Verdict {
        self.contains(descriptor.fingerprint()).into()
    }
}

/// 主机名 + 有效期策略。
#[derive(Clone, Debug)]
pub struct HostnameAndValidity {
    hostname: String,
}

impl HostnameAndValidity {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }
}

impl ValidationHook for HostnameAndValidity {
    fn evaluate(&self, descriptor: &CertificateDescriptor, now: SystemTime) -> Verdict {
        (descriptor.matches_hostname(&self.hostname) && descriptor.is_valid_at(now)).into()
    }
}

/// 所有子策略均接受才接受；空集合视为拒绝。
pub fn all_of(hooks: Vec<Box<dyn ValidationHook>>) -> impl ValidationHook {
    move |descriptor: &CertificateDescriptor, now: SystemTime| {
        !hooks.is_empty()
            && hooks
                .iter()
                .all(|hook| hook.evaluate(descriptor, now) == Verdict::Accept)
    }
}
