//! 连接任务的读写调度、半关闭与失败传播。

mod support;

use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;
use tlstask_core::{ConnectionState, ErrorKind, ManagerConfig, ReadOutcome};

use support::{eventually, open};

fn data(bytes: &'static [u8]) -> ReadOutcome {
    ReadOutcome {
        data: Bytes::from_static(bytes),
        at_eof: false,
    }
}

fn eof() -> ReadOutcome {
    ReadOutcome {
        data: Bytes::new(),
        at_eof: true,
    }
}

#[tokio::test]
async fn writes_reach_peer_in_submission_order() -> anyhow::Result<()> {
    let (task, peer) = open(ManagerConfig::default()).await;
    let first = task.write("alpha");
    let second = task.write(b"beta".to_vec());
    let third = task.write(Bytes::from_static(b"gamma"));
    first.await?;
    second.await?;
    third.await?;
    assert_eq!(peer.sent(), ["alpha", "beta", "gamma"]);
    Ok(())
}

#[tokio::test]
async fn later_write_waits_for_earlier_one() -> anyhow::Result<()> {
    let (task, peer) = open(ManagerConfig::default()).await;
    peer.stall_sends();
    let mut first = task.write("one");
    let mut second = task.write("two");

    peer.allow_sends(1);
    (&mut first).await?;
    assert!(
        tokio::time::timeout(Duration::from_millis(20), &mut second)
            .await
            .is_err(),
        "第二个写入不能先于放行完成"
    );

    peer.allow_sends(1);
    second.await?;
    assert_eq!(peer.sent(), ["one", "two"]);
    Ok(())
}

#[tokio::test]
async fn second_read_fails_without_disturbing_first() -> anyhow::Result<()> {
    let (task, peer) = open(ManagerConfig::default()).await;
    let first = task.read(16);
    let err = task.read(16).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConcurrentReadNotAllowed);

    peer.push("hello");
    assert_eq!(first.await?, data(b"hello"));
    assert!(task.state().is_open());
    Ok(())
}

#[tokio::test]
async fn close_read_resolves_pending_read_with_eof() -> anyhow::Result<()> {
    let (task, peer) = open(ManagerConfig::default()).await;
    let pending = task.read(32);
    task.close_read();
    assert_eq!(pending.await?, eof());

    peer.push("too late");
    let err = task.read(1).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReadClosed);
    assert!(matches!(task.state(), ConnectionState::ReadClosed));

    task.close_read();
    eventually(|| peer.close_receive_count() == 1).await;
    Ok(())
}

#[tokio::test]
async fn reads_after_close_read_report_read_closed_even_after_eof() -> anyhow::Result<()> {
    let (task, peer) = open(ManagerConfig::default()).await;
    peer.finish();
    assert_eq!(task.read(8).await?, eof());
    task.close_read();
    assert_eq!(task.read(8).await.unwrap_err().kind(), ErrorKind::ReadClosed);
    Ok(())
}

#[tokio::test]
async fn close_write_flushes_queue_then_half_closes_once() -> anyhow::Result<()> {
    let (task, peer) = open(ManagerConfig::default()).await;
    peer.stall_sends();
    let first = task.write("queued-1");
    let second = task.write("queued-2");

    task.close_write();
    task.close_write();
    let rejected = task.write("after close").await.unwrap_err();
    assert_eq!(rejected.kind(), ErrorKind::WriteClosed);
    assert_eq!(peer.close_send_count(), 0, "排队写入未完成前不能半关闭");

    peer.resume_sends();
    first.await?;
    second.await?;
    let state = task.wait_for(ConnectionState::is_write_closed).await;
    assert!(matches!(state, ConnectionState::WriteClosed));
    assert_eq!(peer.close_send_count(), 1);
    assert_eq!(peer.sent(), ["queued-1", "queued-2"]);

    peer.push("still readable");
    assert_eq!(task.read(64).await?, data(b"still readable"));
    task.close_write();
    assert_eq!(peer.close_send_count(), 1);
    Ok(())
}

#[tokio::test]
async fn closing_both_directions_reaches_closed() -> anyhow::Result<()> {
    let (task, peer) = open(ManagerConfig::default()).await;
    task.close_write();
    task.close_read();
    let state = task.closed().await;
    assert!(matches!(state, ConnectionState::Closed));
    assert_eq!(task.write("x").await.unwrap_err().kind(), ErrorKind::WriteClosed);
    assert_eq!(task.read(1).await.unwrap_err().kind(), ErrorKind::ReadClosed);
    eventually(|| peer.close_send_count() == 1 && peer.close_receive_count() == 1).await;
    Ok(())
}

#[tokio::test]
async fn zero_length_read_reports_eof_flag() -> anyhow::Result<()> {
    let (task, peer) = open(ManagerConfig::default()).await;
    assert_eq!(task.read(0).await?, ReadOutcome::default());

    peer.finish();
    assert_eq!(task.read(4).await?, eof());
    assert_eq!(task.read(0).await?, eof());
    Ok(())
}

#[tokio::test]
async fn empty_chunks_do_not_complete_a_read() -> anyhow::Result<()> {
    let (task, peer) = open(ManagerConfig::default()).await;
    peer.push(Bytes::new());
    peer.push(Bytes::new());
    peer.push("payload");
    assert_eq!(task.read(64).await?, data(b"payload"));

    let mut pending = task.read(64);
    peer.push(Bytes::new());
    assert!(
        tokio::time::timeout(Duration::from_millis(20), &mut pending)
            .await
            .is_err(),
        "空数据块既不是数据也不是 EOF"
    );
    peer.finish();
    assert_eq!(pending.await?, eof());
    Ok(())
}

#[tokio::test]
async fn eof_is_sticky_and_leaves_task_open() -> anyhow::Result<()> {
    let (task, peer) = open(ManagerConfig::default()).await;
    peer.push("x");
    peer.finish();
    assert_eq!(task.read(8).await?, data(b"x"));
    assert_eq!(task.read(8).await?, eof());
    assert_eq!(task.read(8).await?, eof());
    assert!(task.state().is_open());
    task.write("reply").await?;
    assert_eq!(peer.sent(), ["reply"]);
    Ok(())
}

#[tokio::test]
async fn reads_are_clamped_to_configured_limit() -> anyhow::Result<()> {
    let (task, peer) = open(ManagerConfig::default().with_max_read_len(4)).await;
    peer.push("abcdefgh");
    assert_eq!(task.read(100).await?, data(b"abcd"));
    assert_eq!(task.read(2).await?, data(b"ef"));
    assert_eq!(task.read(100).await?, data(b"gh"));
    Ok(())
}

#[tokio::test]
async fn empty_write_is_ordered_behind_queued_writes() -> anyhow::Result<()> {
    let (task, peer) = open(ManagerConfig::default()).await;
    task.write(Bytes::new()).await?;

    peer.stall_sends();
    let first = task.write("payload");
    let mut empty = task.write(Bytes::new());
    assert!(
        tokio::time::timeout(Duration::from_millis(20), &mut empty)
            .await
            .is_err(),
        "空写入必须排在在途写入之后"
    );
    peer.resume_sends();
    first.await?;
    empty.await?;
    assert_eq!(peer.sent(), ["payload"]);
    Ok(())
}

#[tokio::test]
async fn transport_failure_fails_pending_and_queued_requests() -> anyhow::Result<()> {
    let (task, peer) = open(ManagerConfig::default()).await;
    peer.stall_sends();
    let writes = [task.write("a"), task.write("b"), task.write("c")];
    let read = task.read(16);

    peer.break_reads("connection reset by peer");
    assert_eq!(read.await.unwrap_err().kind(), ErrorKind::TransportError);
    for write in writes {
        assert_eq!(write.await.unwrap_err().kind(), ErrorKind::TransportError);
    }

    let state = task.closed().await;
    let failure = state.failure().expect("任务应处于 Failed");
    assert_eq!(failure.kind(), ErrorKind::TransportError);
    assert_eq!(task.read(1).await.unwrap_err().kind(), ErrorKind::TransportError);
    assert_eq!(task.write("d").await.unwrap_err().kind(), ErrorKind::TransportError);

    task.close_read();
    task.close_write();
    assert!(task.state().is_failed());
    assert_eq!(peer.close_send_count(), 0);
    Ok(())
}

#[tokio::test]
async fn write_failure_fails_the_task() -> anyhow::Result<()> {
    let (task, peer) = open(ManagerConfig::default()).await;
    peer.fail_sends();
    let err = task.write("doomed").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransportError);
    assert!(std::error::Error::source(&err).is_some());
    assert!(task.closed().await.is_failed());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn read_timeout_fails_only_the_pending_read() -> anyhow::Result<()> {
    let config = ManagerConfig::default().with_read_timeout(Duration::from_millis(50));
    let (task, peer) = open(config).await;

    let err = task.read(8).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransportError);
    assert_eq!(err.code(), "tlstask.io.timeout");
    assert!(task.state().is_open());

    peer.push("late data");
    assert_eq!(task.read(64).await?, data(b"late data"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn write_timeout_fails_the_task() -> anyhow::Result<()> {
    let config = ManagerConfig::default().with_write_timeout(Duration::from_millis(50));
    let (task, peer) = open(config).await;
    peer.stall_sends();

    let err = task.write("stuck").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransportError);
    assert!(task.closed().await.is_failed());
    Ok(())
}

#[tokio::test]
async fn dropping_the_task_flushes_then_closes_both_directions() -> anyhow::Result<()> {
    let (task, peer) = open(ManagerConfig::default()).await;
    peer.stall_sends();
    let pending = task.write("goodbye");
    drop(task);

    peer.resume_sends();
    pending.await?;
    eventually(|| peer.close_send_count() == 1 && peer.close_receive_count() == 1).await;
    assert_eq!(peer.sent(), ["goodbye"]);
    Ok(())
}

#[tokio::test]
async fn task_reports_identity() {
    let (first, _peer_a) = open(ManagerConfig::default()).await;
    let (second, _peer_b) = open(ManagerConfig::default()).await;
    assert_ne!(first.id(), second.id());
    assert_eq!(first.peer(), "mock://mock.test:443");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// 任意写入序列（含空写入）按提交顺序到达对端。
    #[test]
    fn arbitrary_write_sequences_arrive_in_order(
        chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..24), 1..12)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("构建运行时");
        let delivered = runtime.block_on(async {
            let (task, peer) = open(ManagerConfig::default()).await;
            let completions: Vec<_> = chunks.iter().cloned().map(|chunk| task.write(chunk)).collect();
            for completion in completions {
                completion.await.expect("写入应成功");
            }
            peer.sent_bytes()
        });
        let expected: Vec<u8> = chunks.concat();
        prop_assert_eq!(delivered, expected);
    }
}
