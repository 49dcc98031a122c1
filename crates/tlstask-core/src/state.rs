use std::fmt;

use crate::error::TaskError;

/// 连接任务的显式状态集合。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 读、写两个方向的关闭是相互独立的，但“失败压倒一切”的规则要求任何判断都先看是否
///   已失败；把两面标志与终态合并为一个枚举，使这条规则只在转换函数中出现一次。
///
/// ## 逻辑（How）
/// - 所有转换都是纯函数 `self -> Self`，由连接任务在互斥锁内调用；
/// - `Closed` 与 `Failed` 为终态，终态上的任何转换都保持原值；
/// - `Failed` 可以从任意非终态进入，并携带导致失败的 [`TaskError`]。
///
/// ## 契约（What）
/// - `Handshaking --established--> Open`；
/// - `Open --close_read--> ReadClosed --close_write--> Closed`；
/// - `Open --close_write--> WriteClosed --close_read--> Closed`；
/// - 重复关闭同一方向是幂等的。
#[derive(Clone, Debug, Default)]
pub enum ConnectionState {
    #[default]
    Handshaking,
    Open,
    ReadClosed,
    WriteClosed,
    Closed,
    Failed(TaskError),
}

impl ConnectionState {
    /// 握手与校验通过。
    pub fn established(self) -> Self {
        match self {
            ConnectionState::Handshaking => ConnectionState::Open,
            other => other,
        }
    }

    pub fn close_read(self) -> Self {
        match self {
            ConnectionState::Open => ConnectionState::ReadClosed,
            ConnectionState::WriteClosed => ConnectionState::Closed,
            other => other,
        }
    }

    pub fn close_write(self) -> Self {
        match self {
            ConnectionState::Open => ConnectionState::WriteClosed,
            ConnectionState::ReadClosed => ConnectionState::Closed,
            other => other,
        }
    }

    /// 进入 `Failed`；已关闭或已失败时保持原状态。
    pub fn fail(self, error: TaskError) -> Self {
        match self {
            ConnectionState::Closed | ConnectionState::Failed(_) => self,
            _ => ConnectionState::Failed(error),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ConnectionState::Failed(_))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed(_))
    }

    /// 读方向是否不再接受请求（调用方关闭或连接已终止）。
    pub fn is_read_closed(&self) -> bool {
        matches!(
            self,
            ConnectionState::ReadClosed | ConnectionState::Closed | ConnectionState::Failed(_)
        )
    }

    /// 写方向是否已完成半关闭（或连接已终止）。
    pub fn is_write_closed(&self) -> bool {
        matches!(
            self,
            ConnectionState::WriteClosed | ConnectionState::Closed | ConnectionState::Failed(_)
        )
    }

    /// 失败原因。
    pub fn failure(&self) -> Option<&TaskError> {
        match self {
            ConnectionState::Failed(error) => Some(error),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Open => "open",
            ConnectionState::ReadClosed => "read_closed",
            ConnectionState::WriteClosed => "write_closed",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Failed(error) => write!(f, "failed({error})"),
            other => f.write_str(other.name()),
        }
    }
}
