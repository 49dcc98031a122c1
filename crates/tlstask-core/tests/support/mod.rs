//! 集成测试共享设施：可编排的内存传输。
//!
//! # 模块目的（Why）
//! - 连接任务的全部不变量都与 TLS 记录层无关，用内存传输即可确定性地注入数据、EOF、
//!   I/O 失败与发送阻塞；
//! - 连接器在握手中以真实的 rcgen 证书调用校验闸门，覆盖“钩子恰好一次”的路径。
//!
//! # 结构概览（What）
//! - [`MockConnector`]：按 [`HandshakePlan`] 模拟握手结果，只产出一条连接；
//! - [`MockPeer`]：测试侧句柄，向任务推送入站数据并观察出站记录与关闭次数。

#![allow(dead_code)]

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime},
};

use bytes::Bytes;
use parking_lot::Mutex;
use tlstask_core::{
    CertificateDescriptor, ConnectionManager, ConnectionTask, ManagerConfig, PeerCertificate,
    Received, SecureConnector, SecureTransport, Target, TransportFailure, TransportReader,
    TransportWriter, ValidationGate, ValidationHook, Verdict, async_trait,
};
use tokio::sync::{Semaphore, mpsc};

/// 安装测试日志订阅者，`RUST_LOG` 控制输出级别；重复调用无副作用。
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// 生成带有给定 SAN 的自签名证书 DER。
pub fn certificate_der(names: &[&str]) -> Vec<u8> {
    let names: Vec<String> = names.iter().map(|name| name.to_string()).collect();
    rcgen::generate_simple_self_signed(names)
        .expect("生成自签名证书")
        .cert
        .der()
        .to_vec()
}

pub fn accept_all() -> impl ValidationHook {
    |_: &CertificateDescriptor, _: SystemTime| Verdict::Accept
}

pub fn reject_all() -> impl ValidationHook {
    |_: &CertificateDescriptor, _: SystemTime| Verdict::Reject
}

/// 统计调用次数的钩子。
pub fn counting(verdict: Verdict, calls: Arc<AtomicUsize>) -> impl ValidationHook {
    move |_: &CertificateDescriptor, _: SystemTime| {
        calls.fetch_add(1, Ordering::SeqCst);
        verdict
    }
}

/// 模拟握手的走向。
#[derive(Clone, Debug)]
pub enum HandshakePlan {
    /// 出示证书并遵守闸门结论。
    Present(Vec<u8>),
    /// 出示证书但无视闸门结论，直接完成握手。
    PresentIgnoringVerdict(Vec<u8>),
    /// 不经闸门直接完成握手。
    SkipValidation,
    Unreachable,
    ProtocolFailure,
    /// 握手永不完成。
    Hang,
}

enum Inbound {
    Data(Bytes),
    Eof,
    Fail(String),
}

#[derive(Default)]
struct Record {
    sent: Mutex<Vec<Bytes>>,
    close_send: AtomicUsize,
    close_receive: AtomicUsize,
    aborted: AtomicBool,
    gated: AtomicBool,
    fail_sends: AtomicBool,
}

/// 测试侧的对端句柄。
pub struct MockPeer {
    inbound: mpsc::UnboundedSender<Inbound>,
    record: Arc<Record>,
    permits: Arc<Semaphore>,
}

impl MockPeer {
    pub fn push(&self, data: impl Into<Bytes>) {
        let _ = self.inbound.send(Inbound::Data(data.into()));
    }

    /// 对端干净地结束写方向。
    pub fn finish(&self) {
        let _ = self.inbound.send(Inbound::Eof);
    }

    /// 下一次读取以 I/O 错误失败。
    pub fn break_reads(&self, reason: &str) {
        let _ = self.inbound.send(Inbound::Fail(reason.to_string()));
    }

    /// 之后的每次发送都需要 [`MockPeer::allow_sends`] 放行。
    pub fn stall_sends(&self) {
        self.record.gated.store(true, Ordering::SeqCst);
    }

    pub fn allow_sends(&self, count: usize) {
        self.permits.add_permits(count);
    }

    pub fn resume_sends(&self) {
        self.record.gated.store(false, Ordering::SeqCst);
        self.permits.add_permits(1 << 16);
    }

    /// 之后（包括正在阻塞）的发送都以 I/O 错误失败。
    pub fn fail_sends(&self) {
        self.record.fail_sends.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.record.sent.lock().clone()
    }

    pub fn sent_bytes(&self) -> Vec<u8> {
        self.record
            .sent
            .lock()
            .iter()
            .flat_map(|chunk| chunk.iter().copied())
            .collect()
    }

    pub fn close_send_count(&self) -> usize {
        self.record.close_send.load(Ordering::SeqCst)
    }

    pub fn close_receive_count(&self) -> usize {
        self.record.close_receive.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> bool {
        self.record.aborted.load(Ordering::SeqCst)
    }
}

pub struct MockTransport {
    label: String,
    reader: MockReader,
    writer: MockWriter,
}

pub struct MockReader {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    leftover: Bytes,
    record: Arc<Record>,
}

pub struct MockWriter {
    record: Arc<Record>,
    permits: Arc<Semaphore>,
}

fn pair() -> (MockTransport, MockPeer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let record = Arc::new(Record::default());
    let permits = Arc::new(Semaphore::new(0));
    let transport = MockTransport {
        label: String::from("mock"),
        reader: MockReader {
            inbound: rx,
            leftover: Bytes::new(),
            record: Arc::clone(&record),
        },
        writer: MockWriter {
            record: Arc::clone(&record),
            permits: Arc::clone(&permits),
        },
    };
    let peer = MockPeer {
        inbound: tx,
        record,
        permits,
    };
    (transport, peer)
}

#[async_trait]
impl SecureTransport for MockTransport {
    type Reader = MockReader;
    type Writer = MockWriter;

    fn split(self) -> (Self::Reader, Self::Writer) {
        (self.reader, self.writer)
    }

    async fn abort(self) {
        self.reader.record.aborted.store(true, Ordering::SeqCst);
    }

    fn peer_label(&self) -> String {
        self.label.clone()
    }
}

#[async_trait]
impl TransportReader for MockReader {
    async fn receive(&mut self, max_len: usize) -> Result<Received, TransportFailure> {
        if self.leftover.is_empty() {
            match self.inbound.recv().await {
                Some(Inbound::Data(data)) => self.leftover = data,
                Some(Inbound::Eof) | None => return Ok(Received::Eof),
                Some(Inbound::Fail(reason)) => {
                    return Err(TransportFailure::io(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        reason,
                    )));
                }
            }
        }
        let take = max_len.min(self.leftover.len());
        Ok(Received::Data(self.leftover.split_to(take)))
    }

    async fn close_receive(&mut self) {
        self.record.close_receive.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportWriter for MockWriter {
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportFailure> {
        if self.record.gated.load(Ordering::SeqCst) {
            match self.permits.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(TransportFailure::io(io::Error::other("permits closed"))),
            }
        }
        if self.record.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportFailure::io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock peer reset",
            )));
        }
        self.record.sent.lock().push(Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn close_send(&mut self) -> Result<(), TransportFailure> {
        self.record.close_send.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// 只产出一条连接的模拟连接器。
pub struct MockConnector {
    plan: HandshakePlan,
    pending: Mutex<Option<MockTransport>>,
    handshakes: AtomicUsize,
}

impl MockConnector {
    pub fn new(plan: HandshakePlan) -> (Self, MockPeer) {
        init_tracing();
        let (transport, peer) = pair();
        let connector = Self {
            plan,
            pending: Mutex::new(Some(transport)),
            handshakes: AtomicUsize::new(0),
        };
        (connector, peer)
    }

    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecureConnector for MockConnector {
    type Transport = MockTransport;

    async fn handshake(
        &self,
        target: &Target,
        gate: Arc<ValidationGate>,
    ) -> Result<MockTransport, TransportFailure> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        match &self.plan {
            HandshakePlan::Unreachable => {
                return Err(TransportFailure::unreachable(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )));
            }
            HandshakePlan::ProtocolFailure => {
                return Err(TransportFailure::handshake(io::Error::other(
                    "no shared protocol version",
                )));
            }
            HandshakePlan::Hang => {
                return std::future::pending().await;
            }
            HandshakePlan::SkipValidation => {}
            HandshakePlan::Present(der) => {
                let verdict = gate.evaluate(&PeerCertificate::from_der(der.clone()));
                if verdict == Verdict::Reject {
                    return Err(TransportFailure::handshake(io::Error::other("bad certificate")));
                }
            }
            HandshakePlan::PresentIgnoringVerdict(der) => {
                let _ = gate.evaluate(&PeerCertificate::from_der(der.clone()));
            }
        }
        let mut transport = self
            .pending
            .lock()
            .take()
            .ok_or_else(|| TransportFailure::unreachable(io::Error::other("mock peer already used")))?;
        transport.label = format!("mock://{target}");
        Ok(transport)
    }
}

/// 以“接受一切”的钩子打开一条模拟连接。
pub async fn open(config: ManagerConfig) -> (ConnectionTask, MockPeer) {
    let (connector, peer) = MockConnector::new(HandshakePlan::Present(certificate_der(&[
        "mock.test",
    ])));
    let manager = ConnectionManager::new(connector).with_config(config);
    let task = manager
        .open_connection("mock.test", 443, accept_all())
        .await
        .expect("模拟握手应成功");
    (task, peer)
}

/// 轮询条件直到成立，超过一秒视为失败。
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("条件应在限定时间内成立");
}
