use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;

use super::test_framework::*;
use crate::channels::{ChannelCore, ChannelHandler, ClientChannel};
use crate::parsing::{ChannelMessage, ChannelType};
use crate::session::Config;
use crate::{ChannelOpenFailure, Error};

async fn open_channel(server: &MockServer) -> ClientChannel {
    let channel = ClientChannel::new(&server.session, NoopHandler);
    channel.open(ChannelType::Session).await.unwrap();
    assert!(channel.is_open());
    channel
}

#[tokio::test]
async fn close_sends_eof_and_close_once() {
    let server = MockServer::cooperative(Config::default());
    let channel = open_channel(&server).await;
    let closed = Arc::new(AtomicUsize::new(0));
    let c = closed.clone();
    channel.on_closed(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    });

    tokio::join!(channel.close(), channel.close());
    channel.close().await;

    assert!(!channel.is_open());
    assert_eq!(server.count(is_eof), 1);
    assert_eq!(server.count(is_close), 1);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn close_without_reply_times_out() {
    let config = Config {
        channel_close_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let server = MockServer::start(config, |msg| match *msg {
        ChannelMessage::Open { sender_channel, .. } => {
            vec![confirmation(sender_channel, SERVER_WINDOW, SERVER_PACKET)]
        }
        _ => Vec::new(),
    });
    let channel = open_channel(&server).await;
    let start = tokio::time::Instant::now();
    channel.close().await;
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert!(!channel.is_open());
    assert_eq!(server.count(is_close), 1);
}

#[tokio::test]
async fn peer_close_is_answered_once() {
    let server = MockServer::cooperative(Config::default());
    let channel = open_channel(&server).await;
    let closed = Arc::new(AtomicUsize::new(0));
    let c = closed.clone();
    channel.on_closed(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    });

    server
        .session
        .dispatch(ChannelMessage::Close {
            recipient_channel: channel.id().into(),
        })
        .await;
    assert!(!channel.is_open());
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    channel.close().await;
    server.settle().await;
    assert_eq!(server.count(is_close), 1);
    assert_eq!(server.count(is_eof), 0);
}

#[tokio::test]
async fn sends_never_exceed_the_remote_window() {
    let server = MockServer::start(Config::default(), |msg| match *msg {
        ChannelMessage::Open { sender_channel, .. } => vec![confirmation(sender_channel, 10, 4)],
        _ => Vec::new(),
    });
    let channel = open_channel(&server).await;
    let core = channel.core().clone();
    let mut sender = tokio::spawn(async move { core.send_data(&[7u8; 25]).await });

    server.settle().await;
    let sent: usize = server.sent().iter().map(data_len).sum();
    assert_eq!(sent, 10);
    assert!(server.sent().iter().all(|m| data_len(m) <= 4));
    assert_eq!(channel.remote_window_size(), 0);
    assert!((&mut sender).now_or_never().is_none());

    server
        .session
        .dispatch(ChannelMessage::WindowAdjust {
            recipient_channel: channel.id().into(),
            bytes_to_add: 15,
        })
        .await;
    sender.await.unwrap().unwrap();
    server.settle().await;

    let sent: usize = server.sent().iter().map(data_len).sum();
    assert_eq!(sent, 25);
    assert_eq!(channel.remote_window_size(), 0);
}

#[tokio::test]
async fn blocked_send_fails_when_channel_closes() {
    let server = MockServer::start(Config::default(), |msg| match *msg {
        ChannelMessage::Open { sender_channel, .. } => vec![confirmation(sender_channel, 0, 4)],
        _ => Vec::new(),
    });
    let channel = open_channel(&server).await;
    let core = channel.core().clone();
    let sender = tokio::spawn(async move { core.send_data(b"blocked").await });
    server.settle().await;

    server
        .session
        .dispatch(ChannelMessage::Close {
            recipient_channel: channel.id().into(),
        })
        .await;
    let result = tokio::time::timeout(Duration::from_secs(1), sender)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(Error::WrongChannel)));
}

fn refuse(sender_channel: u32) -> ChannelMessage {
    ChannelMessage::OpenFailure {
        recipient_channel: sender_channel,
        reason: ChannelOpenFailure::ResourceShortage,
        description: "busy".to_string(),
        language_tag: "en".to_string(),
    }
}

#[tokio::test]
async fn open_gives_up_after_retry_attempts() {
    let config = Config {
        retry_attempts: 3,
        ..Default::default()
    };
    let server = MockServer::start(config, |msg| match *msg {
        ChannelMessage::Open { sender_channel, .. } => vec![refuse(sender_channel)],
        _ => Vec::new(),
    });
    let permits = server.session.open_semaphore().available_permits();

    let channel = ClientChannel::new(&server.session, NoopHandler);
    let err = channel.open(ChannelType::Session).await.unwrap_err();

    assert_eq!(err.to_string(), "Failed to open a channel after 3 attempts.");
    assert!(matches!(
        err,
        Error::ChannelOpenFailed {
            attempts: 3,
            reason: ChannelOpenFailure::ResourceShortage,
            ..
        }
    ));
    assert_eq!(server.count(is_open), 3);
    assert!(!channel.is_open());
    assert_eq!(server.session.open_semaphore().available_permits(), permits);
}

#[tokio::test]
async fn open_succeeds_on_second_attempt() {
    let mut refused = false;
    let server = MockServer::start(Config::default(), move |msg| match *msg {
        ChannelMessage::Open { sender_channel, .. } if !refused => {
            refused = true;
            vec![refuse(sender_channel)]
        }
        _ => cooperative(msg),
    });
    let permits = server.session.open_semaphore().available_permits();

    let channel = open_channel(&server).await;
    assert_eq!(server.count(is_open), 2);
    let numbers: Vec<_> = server
        .sent()
        .iter()
        .filter_map(|m| match m {
            ChannelMessage::Open { sender_channel, .. } => Some(*sender_channel),
            _ => None,
        })
        .collect();
    assert_eq!(numbers, vec![u32::from(channel.id()); 2]);
    assert_eq!(channel.remote_id(), Some(remote(channel.id())));
    assert_eq!(
        server.session.open_semaphore().available_permits(),
        permits - 1
    );

    channel.close().await;
    assert_eq!(server.session.open_semaphore().available_permits(), permits);
}

#[tokio::test]
async fn open_waits_for_a_free_slot() {
    let config = Config {
        max_sessions: 1,
        ..Default::default()
    };
    let server = MockServer::cooperative(config);
    let first = open_channel(&server).await;

    let second = ClientChannel::new(&server.session, NoopHandler);
    let opening = tokio::spawn(async move {
        second.open(ChannelType::Session).await.unwrap();
        second
    });
    server.settle().await;
    assert_eq!(server.count(is_open), 1);
    assert!(!opening.is_finished());

    first.close().await;
    let second = tokio::time::timeout(Duration::from_secs(1), opening)
        .await
        .unwrap()
        .unwrap();
    assert!(second.is_open());
    assert_eq!(server.count(is_open), 2);
}

#[tokio::test]
async fn open_fails_when_session_disconnects() {
    let server = MockServer::start(Config::default(), |_| Vec::new());
    let permits = server.session.open_semaphore().available_permits();
    let session = server.session.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.disconnect();
    });

    let channel = ClientChannel::new(&server.session, NoopHandler);
    let err = channel.open(ChannelType::Session).await.unwrap_err();
    assert!(matches!(err, Error::Disconnect));
    assert!(!channel.is_open());
    assert_eq!(server.count(is_open), 1);
    assert_eq!(server.session.open_semaphore().available_permits(), permits);
}

#[tokio::test]
async fn open_times_out() {
    let config = Config {
        timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let server = MockServer::start(config, |_| Vec::new());
    let channel = ClientChannel::new(&server.session, NoopHandler);
    let err = channel.open(ChannelType::Session).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionTimeout));
    assert!(!channel.is_open());
}

#[tokio::test]
async fn late_confirmation_does_not_open_an_abandoned_channel() {
    let config = Config {
        timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let server = MockServer::start(config, |_| Vec::new());
    let permits = server.session.open_semaphore().available_permits();
    let channel = ClientChannel::new(&server.session, NoopHandler);
    let err = channel.open(ChannelType::Session).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionTimeout));

    server
        .session
        .dispatch(confirmation(channel.id().into(), 1000, 100))
        .await;
    assert!(!channel.is_open());
    assert_eq!(server.session.open_semaphore().available_permits(), permits);
    let close = server.wait_for(is_close).await;
    assert_eq!(
        close,
        ChannelMessage::Close {
            recipient_channel: remote(channel.id()),
        }
    );

    // The server's answering CLOSE is not answered again.
    server
        .session
        .dispatch(ChannelMessage::Close {
            recipient_channel: channel.id().into(),
        })
        .await;
    server.settle().await;
    assert_eq!(server.count(is_close), 1);
    assert!(matches!(
        channel.send_data(b"x").await,
        Err(Error::WrongChannel)
    ));
    assert!(matches!(
        channel.open(ChannelType::Session).await,
        Err(Error::Inconsistent)
    ));
}

#[tokio::test]
async fn zero_packet_size_still_sends() {
    let server = MockServer::start(Config::default(), |msg| match *msg {
        ChannelMessage::Open { sender_channel, .. } => vec![confirmation(sender_channel, 1000, 0)],
        _ => Vec::new(),
    });
    let channel = open_channel(&server).await;
    assert_eq!(channel.remote_packet_size(), Some(1));

    tokio::time::timeout(Duration::from_secs(1), channel.send_data(b"abc"))
        .await
        .unwrap()
        .unwrap();
    server.settle().await;
    let sizes: Vec<_> = server.sent().iter().map(data_len).filter(|n| *n > 0).collect();
    assert_eq!(sizes, vec![1, 1, 1]);
    assert_eq!(channel.remote_window_size(), 997);
}

#[tokio::test]
async fn channel_can_be_dropped_from_its_closed_listener() {
    let server = MockServer::cooperative(Config::default());
    let channel = open_channel(&server).await;
    let id = channel.id();
    let slot = Arc::new(Mutex::new(None::<ClientChannel>));
    let fired = Arc::new(AtomicBool::new(false));
    let (s, f) = (slot.clone(), fired.clone());
    channel.on_closed(move |_| {
        drop(s.lock().unwrap().take());
        f.store(true, Ordering::SeqCst);
    });
    *slot.lock().unwrap() = Some(channel);

    tokio::time::timeout(
        Duration::from_secs(1),
        server.session.dispatch(ChannelMessage::Close {
            recipient_channel: id.into(),
        }),
    )
    .await
    .unwrap();

    assert!(fired.load(Ordering::SeqCst));
    assert!(slot.lock().unwrap().is_none());
    assert_eq!(server.session.channel_count(), 0);
    server.settle().await;
    assert_eq!(server.count(is_close), 1);
    assert_eq!(server.count(is_eof), 0);
}

#[tokio::test]
async fn nothing_is_sent_once_disconnected() {
    let server = MockServer::cooperative(Config::default());
    let channel = open_channel(&server).await;
    let closed = Arc::new(AtomicBool::new(false));
    let c = closed.clone();
    channel.on_closed(move |_| c.store(true, Ordering::SeqCst));
    let before = server.sent().len();

    server.session.disconnect();
    assert!(!server.session.is_connected());
    assert!(!channel.is_open());
    assert!(closed.load(Ordering::SeqCst));

    channel.close().await;
    assert!(channel.send_eof().is_err());
    drop(channel);
    server.settle().await;
    assert_eq!(server.sent().len(), before);
}

#[tokio::test]
async fn dropping_an_open_channel_closes_it() {
    let server = MockServer::cooperative(Config::default());
    let channel = open_channel(&server).await;
    let permits = server.session.open_semaphore().available_permits();
    drop(channel);

    server.wait_for(is_close).await;
    assert_eq!(server.count(is_eof), 1);
    assert_eq!(server.session.channel_count(), 0);
    assert_eq!(
        server.session.open_semaphore().available_permits(),
        permits + 1
    );
}

struct FailingHandler;

#[async_trait]
impl ChannelHandler for FailingHandler {
    async fn data(&self, _channel: &ChannelCore, _data: &[u8]) -> Result<(), Error> {
        Err(Error::Inconsistent)
    }
}

#[tokio::test]
async fn hook_errors_are_reported_as_exceptions() {
    let server = MockServer::cooperative(Config::default());
    let channel = ClientChannel::new(&server.session, FailingHandler);
    channel.open(ChannelType::Session).await.unwrap();
    let exceptions = Arc::new(AtomicUsize::new(0));
    let e = exceptions.clone();
    channel.on_exception(move |err| {
        assert!(matches!(err, Error::Inconsistent));
        e.fetch_add(1, Ordering::SeqCst);
    });

    server
        .session
        .dispatch(ChannelMessage::Data {
            recipient_channel: channel.id().into(),
            data: Bytes::from_static(b"boom"),
        })
        .await;

    assert_eq!(exceptions.load(Ordering::SeqCst), 1);
    assert!(channel.is_open());
}

#[tokio::test]
async fn local_window_is_replenished() {
    let config = Config {
        window_size: 100,
        ..Default::default()
    };
    let server = MockServer::cooperative(config);
    let channel = open_channel(&server).await;
    let data = |n: usize| ChannelMessage::Data {
        recipient_channel: channel.id().into(),
        data: Bytes::from(vec![0u8; n]),
    };

    server.session.dispatch(data(40)).await;
    assert_eq!(channel.local_window_size(), 60);

    server.session.dispatch(data(20)).await;
    assert_eq!(channel.local_window_size(), 100);
    let adjust = server
        .wait_for(|m| matches!(m, ChannelMessage::WindowAdjust { .. }))
        .await;
    assert_eq!(
        adjust,
        ChannelMessage::WindowAdjust {
            recipient_channel: remote(channel.id()),
            bytes_to_add: 60,
        }
    );
}

#[tokio::test]
async fn channel_numbers_are_not_reused_while_registered() {
    let server = MockServer::cooperative(Config::default());
    let a = ClientChannel::new(&server.session, NoopHandler);
    let b = ClientChannel::new(&server.session, NoopHandler);
    assert_ne!(a.id(), b.id());
    assert_eq!(server.session.channel_count(), 2);
    drop(a);
    assert_eq!(server.session.channel_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drop_from_closed_listener_races_peer_close() {
    let server = MockServer::cooperative(Config::default());
    let channel = open_channel(&server).await;
    let id = channel.id();
    let core = channel.core().clone();
    let slot = Arc::new(Mutex::new(None::<ClientChannel>));
    let fired = Arc::new(AtomicUsize::new(0));
    let (s, f) = (slot.clone(), fired.clone());
    channel.on_closed(move |_| {
        drop(s.lock().unwrap().take());
        f.fetch_add(1, Ordering::SeqCst);
    });
    *slot.lock().unwrap() = Some(channel);

    let session = server.session.clone();
    let peer = tokio::spawn(async move {
        session
            .dispatch(ChannelMessage::Close {
                recipient_channel: id.into(),
            })
            .await;
    });
    let local = tokio::spawn(async move { core.close().await });
    tokio::time::timeout(Duration::from_secs(2), async {
        peer.await.unwrap();
        local.await.unwrap();
    })
    .await
    .unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(slot.lock().unwrap().is_none());
    server.settle().await;
    assert_eq!(server.session.channel_count(), 0);
    assert_eq!(server.count(is_close), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_waits_for_a_running_closed_listener() {
    let server = MockServer::cooperative(Config::default());
    let channel = open_channel(&server).await;
    let id = channel.id();
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let (s, f) = (started.clone(), finished.clone());
    channel.on_closed(move |_| {
        s.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(200));
        f.store(true, Ordering::SeqCst);
    });

    let session = server.session.clone();
    let peer = tokio::spawn(async move {
        session
            .dispatch(ChannelMessage::Close {
                recipient_channel: id.into(),
            })
            .await;
    });
    while !started.load(Ordering::SeqCst) {
        tokio::task::yield_now().await;
    }
    channel.close().await;
    assert!(finished.load(Ordering::SeqCst));
    peer.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_close_races_drop() {
    let server = MockServer::cooperative(Config::default());
    let channel = open_channel(&server).await;
    let id = channel.id();
    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    channel.on_closed(move |_| {
        f.fetch_add(1, Ordering::SeqCst);
    });

    let session = server.session.clone();
    let peer = tokio::spawn(async move {
        session
            .dispatch(ChannelMessage::Close {
                recipient_channel: id.into(),
            })
            .await;
    });
    drop(channel);
    tokio::time::timeout(Duration::from_secs(2), peer)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(server.session.channel_count(), 0);
    server.settle().await;
    assert_eq!(server.count(is_close), 1);
}
