use std::{
    collections::VecDeque,
    future::Future,
    mem,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot, watch};
use tracing::{Instrument, debug, debug_span, warn};

use crate::{
    config::ManagerConfig,
    error::{self, OperationKind, TaskError},
    state::ConnectionState,
    transport::{Received, SecureTransport, TransportFailure, TransportReader, TransportWriter},
};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// 一次读取的结果。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadOutcome {
    /// 解密后的明文，可能为空。
    pub data: Bytes,
    /// 读方向是否已无更多数据。
    pub at_eof: bool,
}

impl ReadOutcome {
    fn data(data: Bytes) -> Self {
        Self {
            data,
            at_eof: false,
        }
    }

    fn eof() -> Self {
        Self {
            data: Bytes::new(),
            at_eof: true,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, TaskError>>;

/// 单个请求的完成端。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 以单次通道代替回调：发送端被消费即代表完成，天然满足“每个请求恰好完成一次”；
/// - 请求在调用 `read`/`write` 时同步登记，Future 只负责等待结果，因此“第二个读请求”
///   的判定与调用方何时 `.await` 无关。
///
/// ## 契约（What）
/// - 立即可判定的结果（已关闭、并发读、空写入等）以 `Ready` 形态返回，首次轮询即完成；
/// - 若连接任务在交付前被异常丢弃，返回 `TransportError`；
/// - 完成之后再次轮询同样返回 `TransportError`，不会 panic。
#[must_use = "completions do nothing unless awaited"]
pub struct Completion<T> {
    state: CompletionState<T>,
}

enum CompletionState<T> {
    Ready(Option<Result<T, TaskError>>),
    Waiting(oneshot::Receiver<Result<T, TaskError>>),
}

impl<T> Completion<T> {
    fn ready(result: Result<T, TaskError>) -> Self {
        Self {
            state: CompletionState::Ready(Some(result)),
        }
    }

    fn waiting(receiver: oneshot::Receiver<Result<T, TaskError>>) -> Self {
        Self {
            state: CompletionState::Waiting(receiver),
        }
    }
}

impl<T> Unpin for Completion<T> {}

impl<T> Future for Completion<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            CompletionState::Ready(slot) => {
                Poll::Ready(slot.take().unwrap_or_else(|| Err(error::abandoned())))
            }
            CompletionState::Waiting(receiver) => match Pin::new(receiver).poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(received) => {
                    this.state = CompletionState::Ready(None);
                    Poll::Ready(received.unwrap_or_else(|_| Err(error::abandoned())))
                }
            },
        }
    }
}

struct PendingRead {
    max_len: usize,
    reply: Reply<ReadOutcome>,
}

struct PendingWrite {
    ticket: u64,
    data: Bytes,
    reply: Reply<()>,
}

#[derive(Default)]
struct ReadSide {
    pending: Option<PendingRead>,
    eof: bool,
}

#[derive(Default)]
struct WriteSide {
    /// 队首即在途写入，完成后才出队，保证失败时仍按提交顺序交付。
    queue: VecDeque<PendingWrite>,
    close_requested: bool,
    next_ticket: u64,
}

struct TaskState {
    phase: ConnectionState,
    read: ReadSide,
    write: WriteSide,
}

enum ReadStep {
    Serve(usize),
    Idle,
    Release,
    Stop,
}

enum WriteStep {
    Send { ticket: u64, data: Bytes },
    Shutdown,
    Idle,
    Stop,
}

enum IoFault {
    Timeout,
    Failure(TransportFailure),
}

/// 任务与两个泵之间共享的状态。
struct Shared {
    id: u64,
    peer: String,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    max_read_len: usize,
    state: Mutex<TaskState>,
    read_wake: Notify,
    write_wake: Notify,
    status: watch::Sender<ConnectionState>,
}

impl Shared {
    fn transition(&self, st: &mut TaskState, step: impl FnOnce(ConnectionState) -> ConnectionState) {
        let previous = mem::take(&mut st.phase);
        st.phase = step(previous);
        self.status.send_replace(st.phase.clone());
    }

    /// 进入 `Failed`：在途读请求与整条写队列按顺序以同一错误完成。
    fn fail_locked(&self, st: &mut TaskState, error: TaskError) {
        if st.phase.is_terminal() {
            return;
        }
        warn!(task.id = self.id, peer = %self.peer, error = %error, "connection task failed");
        if let Some(pending) = st.read.pending.take() {
            let _ = pending.reply.send(Err(error.clone()));
        }
        for pending in st.write.queue.drain(..) {
            let _ = pending.reply.send(Err(error.clone()));
        }
        self.transition(st, |phase| phase.fail(error));
    }

    fn next_read(&self) -> ReadStep {
        let st = self.state.lock();
        if st.phase.is_failed() {
            return ReadStep::Stop;
        }
        if st.phase.is_read_closed() {
            return ReadStep::Release;
        }
        match &st.read.pending {
            Some(pending) => ReadStep::Serve(pending.max_len),
            None => ReadStep::Idle,
        }
    }

    fn complete_read(&self, outcome: Result<Received, IoFault>) -> bool {
        let mut st = self.state.lock();
        match outcome {
            Ok(Received::Data(data)) if data.is_empty() => {
                // 空数据既非进展也非 EOF，请求保持在途，由读泵重新读取。
                debug!(task.id = self.id, "transport returned an empty chunk");
                true
            }
            Ok(Received::Data(data)) => {
                if let Some(pending) = st.read.pending.take() {
                    let _ = pending.reply.send(Ok(ReadOutcome::data(data)));
                }
                true
            }
            Ok(Received::Eof) => {
                debug!(task.id = self.id, "peer finished its write direction");
                st.read.eof = true;
                if let Some(pending) = st.read.pending.take() {
                    let _ = pending.reply.send(Ok(ReadOutcome::eof()));
                }
                true
            }
            Err(IoFault::Timeout) => {
                if let Some(pending) = st.read.pending.take() {
                    let _ = pending.reply.send(Err(error::timeout_error(error::READ)));
                }
                true
            }
            Err(IoFault::Failure(failure)) => {
                self.fail_locked(&mut st, error::stream_failure(error::READ, failure));
                false
            }
        }
    }

    fn next_write(&self) -> WriteStep {
        let st = self.state.lock();
        if st.phase.is_write_closed() {
            return WriteStep::Stop;
        }
        if let Some(front) = st.write.queue.front() {
            return WriteStep::Send {
                ticket: front.ticket,
                data: front.data.clone(),
            };
        }
        if st.write.close_requested {
            WriteStep::Shutdown
        } else {
            WriteStep::Idle
        }
    }

    fn complete_write(&self, ticket: u64, result: Result<(), IoFault>) -> bool {
        let mut st = self.state.lock();
        match result {
            Ok(()) => {
                if st.write.queue.front().map(|front| front.ticket) == Some(ticket)
                    && let Some(done) = st.write.queue.pop_front()
                {
                    let _ = done.reply.send(Ok(()));
                }
                true
            }
            Err(fault) => {
                let error = fault_to_error(error::WRITE, fault);
                self.fail_locked(&mut st, error);
                false
            }
        }
    }

    fn finish_write_close(&self, result: Result<(), IoFault>) {
        if let Err(fault) = result {
            let error = fault_to_error(error::SHUTDOWN, fault);
            warn!(task.id = self.id, error = %error, "write half-close did not complete cleanly");
        }
        let mut st = self.state.lock();
        if st.phase.is_failed() {
            return;
        }
        self.transition(&mut st, ConnectionState::close_write);
        debug!(task.id = self.id, state = %st.phase, "write direction closed");
    }
}

fn fault_to_error(kind: OperationKind, fault: IoFault) -> TaskError {
    match fault {
        IoFault::Timeout => error::timeout_error(kind),
        IoFault::Failure(failure) => error::stream_failure(kind, failure),
    }
}

/// 一条已完成握手与校验的 TLS 连接。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把“至多一个在途读”“写入 FIFO”“两个方向独立半关闭”“失败压倒一切”这些不变量集中
///   在一把互斥锁保护的状态里，而不是分散在回调机制中；
/// - 调用方拿到的是同步登记、异步完成的 [`Completion`]，可在任意执行器上等待。
///
/// ## 逻辑（How）
/// - 构造时把传输拆成读、写两个半部，分别交给两个 Tokio 任务（读泵/写泵）独占；
/// - 调用方的 `read`/`write` 在锁内登记请求后用 [`Notify`] 唤醒对应泵；
/// - 状态每次变化都经 `watch` 通道广播，泵据此感知 `close_read` 与失败并放弃在途的 I/O；
/// - 所有完成都在锁内交付，`close_read` 交付 EOF 之后迟到的数据只会被丢弃。
///
/// ## 契约（What）
/// - `read`：并发读立即失败且不影响在途请求；EOF 之后恒返回 `(empty, true)`；
/// - `write`：严格按提交顺序完成；失败时在途与排队写入依次以同一错误完成；
/// - `close_read`/`close_write`：幂等、不失败，确认需要时可等待 [`ConnectionTask::closed`]；
/// - 丢弃句柄等价于依次调用 `close_read` 与 `close_write`，已排队的写入仍会发出。
///
/// ## 风险与权衡（Trade-offs）
/// - 读取超时只失败当前请求；写入超时视为连接失败，因为无法得知已写出多少字节。
pub struct ConnectionTask {
    shared: Arc<Shared>,
}

impl ConnectionTask {
    /// 接管一条握手已完成的传输并启动读写泵；必须在 Tokio 运行时内调用。
    pub(crate) fn spawn<T: SecureTransport>(transport: T, config: &ManagerConfig) -> Self {
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        let peer = transport.peer_label();
        let phase = ConnectionState::default().established();
        let (status, _) = watch::channel(phase.clone());
        let shared = Arc::new(Shared {
            id,
            peer,
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
            max_read_len: config.max_read_len(),
            state: Mutex::new(TaskState {
                phase,
                read: ReadSide::default(),
                write: WriteSide::default(),
            }),
            read_wake: Notify::new(),
            write_wake: Notify::new(),
            status,
        });

        let (reader, writer) = transport.split();
        let span = debug_span!("tls_task", task.id = id, peer = %shared.peer);
        tokio::spawn(run_reader(Arc::clone(&shared), reader).instrument(span.clone()));
        tokio::spawn(run_writer(Arc::clone(&shared), writer).instrument(span));
        debug!(task.id = id, peer = %shared.peer, "connection task open");

        Self { shared }
    }

    /// 进程内唯一的任务编号。
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// 对端描述。
    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    /// 当前状态快照。
    pub fn state(&self) -> ConnectionState {
        self.shared.state.lock().phase.clone()
    }

    /// 请求至多 `max_len` 字节。
    pub fn read(&self, max_len: usize) -> Completion<ReadOutcome> {
        let mut st = self.shared.state.lock();
        if let Some(failure) = st.phase.failure() {
            return Completion::ready(Err(failure.clone()));
        }
        if st.phase.is_read_closed() {
            return Completion::ready(Err(error::read_closed()));
        }
        if st.read.pending.is_some() {
            return Completion::ready(Err(error::concurrent_read()));
        }
        if st.read.eof {
            return Completion::ready(Ok(ReadOutcome::eof()));
        }
        if max_len == 0 {
            return Completion::ready(Ok(ReadOutcome::default()));
        }

        let (reply, receiver) = oneshot::channel();
        st.read.pending = Some(PendingRead {
            max_len: max_len.min(self.shared.max_read_len),
            reply,
        });
        drop(st);
        self.shared.read_wake.notify_one();
        Completion::waiting(receiver)
    }

    /// 提交一段待发送数据。
    pub fn write(&self, data: impl Into<Bytes>) -> Completion<()> {
        let data = data.into();
        let mut st = self.shared.state.lock();
        if let Some(failure) = st.phase.failure() {
            return Completion::ready(Err(failure.clone()));
        }
        if st.write.close_requested || st.phase.is_write_closed() {
            return Completion::ready(Err(error::write_closed()));
        }
        if data.is_empty() && st.write.queue.is_empty() {
            return Completion::ready(Ok(()));
        }

        let (reply, receiver) = oneshot::channel();
        let ticket = st.write.next_ticket;
        st.write.next_ticket += 1;
        st.write.queue.push_back(PendingWrite {
            ticket,
            data,
            reply,
        });
        drop(st);
        self.shared.write_wake.notify_one();
        Completion::waiting(receiver)
    }

    /// 关闭读方向；在途读请求立即以 `(empty, true)` 完成。
    pub fn close_read(&self) {
        let mut st = self.shared.state.lock();
        if st.phase.is_read_closed() {
            return;
        }
        if let Some(pending) = st.read.pending.take() {
            let _ = pending.reply.send(Ok(ReadOutcome::eof()));
        }
        self.shared.transition(&mut st, ConnectionState::close_read);
        debug!(task.id = self.shared.id, state = %st.phase, "read direction closed");
    }

    /// 请求关闭写方向：拒绝后续写入，已排队的写入发送完毕后向对端发出 EOF。
    pub fn close_write(&self) {
        let mut st = self.shared.state.lock();
        if st.write.close_requested || st.phase.is_write_closed() {
            return;
        }
        st.write.close_requested = true;
        drop(st);
        debug!(task.id = self.shared.id, "write half-close requested");
        self.shared.write_wake.notify_one();
    }

    /// 等待状态满足 `predicate`，返回满足时的状态。
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&ConnectionState) -> bool,
    ) -> ConnectionState {
        let mut status = self.shared.status.subscribe();
        match status.wait_for(predicate).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        }
    }

    /// 等待任务进入 `Closed` 或 `Failed`。
    pub async fn closed(&self) -> ConnectionState {
        self.wait_for(ConnectionState::is_terminal).await
    }
}

impl Drop for ConnectionTask {
    fn drop(&mut self) {
        self.close_read();
        self.close_write();
    }
}

impl std::fmt::Debug for ConnectionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTask")
            .field("id", &self.shared.id)
            .field("peer", &self.shared.peer)
            .field("state", &self.state())
            .finish()
    }
}

async fn run_reader<R: TransportReader>(shared: Arc<Shared>, mut reader: R) {
    let mut status = shared.status.subscribe();
    loop {
        let max_len = match shared.next_read() {
            ReadStep::Serve(max_len) => max_len,
            ReadStep::Idle => {
                tokio::select! {
                    _ = shared.read_wake.notified() => {}
                    changed = status.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
                continue;
            }
            ReadStep::Release => {
                reader.close_receive().await;
                debug!("reader released");
                return;
            }
            ReadStep::Stop => {
                debug!("reader stopped after failure");
                return;
            }
        };

        let outcome = tokio::select! {
            outcome = receive(&mut reader, max_len, shared.read_timeout) => outcome,
            _ = read_released(&mut status) => continue,
        };
        if !shared.complete_read(outcome) {
            return;
        }
    }
}

async fn run_writer<W: TransportWriter>(shared: Arc<Shared>, mut writer: W) {
    let mut status = shared.status.subscribe();
    loop {
        match shared.next_write() {
            WriteStep::Send { ticket, data } => {
                let result = if data.is_empty() {
                    Ok(())
                } else {
                    tokio::select! {
                        result = send(&mut writer, &data, shared.write_timeout) => result,
                        _ = failed(&mut status) => return,
                    }
                };
                if !shared.complete_write(ticket, result) {
                    return;
                }
            }
            WriteStep::Shutdown => {
                let result = tokio::select! {
                    result = close_send(&mut writer, shared.write_timeout) => result,
                    _ = failed(&mut status) => return,
                };
                shared.finish_write_close(result);
                debug!("writer released");
                return;
            }
            WriteStep::Idle => {
                tokio::select! {
                    _ = shared.write_wake.notified() => {}
                    changed = status.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
            WriteStep::Stop => return,
        }
    }
}

async fn read_released(status: &mut watch::Receiver<ConnectionState>) {
    let _ = status.wait_for(ConnectionState::is_read_closed).await;
}

async fn failed(status: &mut watch::Receiver<ConnectionState>) {
    let _ = status.wait_for(ConnectionState::is_failed).await;
}

async fn receive<R: TransportReader>(
    reader: &mut R,
    max_len: usize,
    limit: Option<Duration>,
) -> Result<Received, IoFault> {
    with_limit(limit, reader.receive(max_len)).await
}

async fn send<W: TransportWriter>(
    writer: &mut W,
    data: &[u8],
    limit: Option<Duration>,
) -> Result<(), IoFault> {
    with_limit(limit, writer.send(data)).await
}

async fn close_send<W: TransportWriter>(writer: &mut W, limit: Option<Duration>) -> Result<(), IoFault> {
    with_limit(limit, writer.close_send()).await
}

async fn with_limit<F, T>(limit: Option<Duration>, future: F) -> Result<T, IoFault>
where
    F: Future<Output = Result<T, TransportFailure>>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, future).await {
            Ok(result) => result.map_err(IoFault::Failure),
            Err(_) => Err(IoFault::Timeout),
        },
        None => future.await.map_err(IoFault::Failure),
    }
}
