// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! The multiplexer shared by every channel of one connection.
//!
//! A [Session] does not own a socket. The transport that does (key
//! exchange, encryption, packet framing) drains the outbound queue
//! returned by [Session::new], and feeds every decrypted
//! connection-protocol message to [Session::dispatch]. Messages for one
//! channel must be dispatched one at a time, in arrival order; the
//! simplest transport awaits each `dispatch` call before reading the
//! next packet.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::num::Wrapping;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, trace, warn};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch, Semaphore};

use crate::channels::ChannelCore;
use crate::helpers::lock;
use crate::parsing::{ChannelMessage, ChannelType, GlobalRequest, TcpChannelInfo};
use crate::{ChannelId, ChannelOpenFailure, Error};

/// The configuration of a connection, as far as channels are concerned.
#[derive(Debug, Clone)]
pub struct Config {
    /// How many times a channel open is attempted before giving up.
    pub retry_attempts: usize,
    /// How long closing a channel waits for the server's CLOSE.
    pub channel_close_timeout: Duration,
    /// How long to wait for any server response (channel open
    /// confirmation, request replies).
    pub timeout: Duration,
    /// The initial size of a channel (used for flow control).
    pub window_size: u32,
    /// The maximal size of a single packet.
    pub maximum_packet_size: u32,
    /// Maximal number of client channels open at the same time.
    pub max_sessions: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            retry_attempts: 10,
            channel_close_timeout: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
            window_size: 2097152,
            maximum_packet_size: 32768,
            max_sessions: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Connected,
    Disconnected,
    /// The transport reported an error; carries its description.
    Failed(String),
}

impl SessionStatus {
    fn to_error(&self) -> Error {
        match self {
            SessionStatus::Failed(description) => Error::Session(description.clone()),
            _ => Error::Disconnect,
        }
    }
}

/// Outcome of [Session::try_wait].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Success,
    TimedOut,
    /// The session disconnected or failed while waiting.
    Failed,
}

/// Parameters of a channel the server asked to open.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IncomingChannel {
    pub sender_channel: u32,
    pub initial_window_size: u32,
    pub maximum_packet_size: u32,
}

/// Receives server-initiated `forwarded-tcpip` channels.
pub(crate) trait ForwardedTcpipHandler: Send + Sync {
    /// Returns `false` if the connection was not made to an address
    /// this handler forwards.
    fn accept(&self, session: &Session, channel: IncomingChannel, info: &TcpChannelInfo) -> bool;
}

struct Registry {
    channels: HashMap<ChannelId, Weak<ChannelCore>>,
    last_channel_id: Wrapping<u32>,
}

struct SessionInner {
    config: Arc<Config>,
    sender: UnboundedSender<ChannelMessage>,
    status: watch::Sender<SessionStatus>,
    registry: Mutex<Registry>,
    open_semaphore: Arc<Semaphore>,
    forwarded: Mutex<HashMap<u64, Arc<dyn ForwardedTcpipHandler>>>,
    last_forwarded_id: Mutex<u64>,
    global_replies: Mutex<VecDeque<oneshot::Sender<Option<Bytes>>>>,
}

/// Handle to the multiplexer. Cloning it is cheap, and every clone
/// refers to the same connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("status", &*self.inner.status.borrow())
            .field("channels", &self.channel_count())
            .finish()
    }
}

impl Session {
    /// Creates a session, and returns the queue of messages the
    /// transport must send to the server.
    pub fn new(config: Arc<Config>) -> (Session, UnboundedReceiver<ChannelMessage>) {
        let (sender, receiver) = unbounded_channel();
        let (status, _) = watch::channel(SessionStatus::Connected);
        let open_semaphore = Arc::new(Semaphore::new(config.max_sessions));
        let session = Session {
            inner: Arc::new(SessionInner {
                config,
                sender,
                status,
                registry: Mutex::new(Registry {
                    channels: HashMap::new(),
                    last_channel_id: Wrapping(0),
                }),
                open_semaphore,
                forwarded: Mutex::new(HashMap::new()),
                last_forwarded_id: Mutex::new(0),
                global_replies: Mutex::new(VecDeque::new()),
            }),
        };
        (session, receiver)
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.inner.config
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.status.borrow().clone()
    }

    /// Subscribe to status changes, which are the session's
    /// `Disconnected` and `ErrorOccurred` events.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.status.borrow() == SessionStatus::Connected && !self.inner.sender.is_closed()
    }

    /// Bounds the number of client channels being opened or open at
    /// the same time.
    pub fn open_semaphore(&self) -> &Arc<Semaphore> {
        &self.inner.open_semaphore
    }

    /// Queue a message for the transport.
    pub fn send_message(&self, msg: ChannelMessage) -> Result<(), Error> {
        if *self.inner.status.borrow() != SessionStatus::Connected {
            return Err(self.inner.status.borrow().to_error());
        }
        trace!("send {:?}", msg);
        self.inner.sender.send(msg).map_err(|_| Error::SendError)
    }

    /// Like [Session::send_message], but reports failure instead of
    /// returning an error. Used where the server may already be gone.
    pub fn try_send_message(&self, msg: ChannelMessage) -> bool {
        match self.send_message(msg) {
            Ok(()) => true,
            Err(e) => {
                debug!("could not send message: {:?}", e);
                false
            }
        }
    }

    /// Wait for `fut`, giving up if the session disconnects, fails, or
    /// [Config::timeout] elapses.
    pub async fn wait_on_handle<F: Future>(&self, fut: F) -> Result<F::Output, Error> {
        let timeout = self.inner.config.timeout;
        tokio::select! {
            biased;
            r = tokio::time::timeout(timeout, fut) => r.map_err(|_| Error::ConnectionTimeout),
            e = self.failed() => Err(e),
        }
    }

    /// Wait at most `timeout` for `fut`.
    pub async fn try_wait<F: Future>(&self, fut: F, timeout: Duration) -> WaitResult {
        tokio::select! {
            biased;
            r = tokio::time::timeout(timeout, fut) => match r {
                Ok(_) => WaitResult::Success,
                Err(_) => WaitResult::TimedOut,
            },
            _ = self.failed() => WaitResult::Failed,
        }
    }

    /// Resolves once the session is no longer usable.
    pub(crate) async fn failed(&self) -> Error {
        let mut status = self.inner.status.subscribe();
        tokio::select! {
            s = status.wait_for(|s| *s != SessionStatus::Connected) => match s {
                Ok(s) => s.to_error(),
                Err(_) => Error::Disconnect,
            },
            _ = self.inner.sender.closed() => Error::Disconnect,
        }
    }

    /// The transport lost its connection. Every channel is closed
    /// locally, without sending anything.
    pub fn disconnect(&self) {
        if self.set_status(SessionStatus::Disconnected) {
            debug!("session disconnected");
            for channel in self.channels() {
                channel.session_disconnected();
            }
        }
    }

    /// The transport hit an error. Channels bridged to sockets shut
    /// them down; pending waits fail with [Error::Session].
    pub fn raise_error<D: Into<String>>(&self, description: D) {
        let description = description.into();
        if self.set_status(SessionStatus::Failed(description.clone())) {
            error!("session error: {}", description);
            for channel in self.channels() {
                channel.session_error(&description);
            }
        }
    }

    fn set_status(&self, status: SessionStatus) -> bool {
        let changed = self.inner.status.send_if_modified(|s| {
            if *s == SessionStatus::Connected {
                *s = status;
                true
            } else {
                false
            }
        });
        if changed {
            // Dropping the senders fails the pending global requests.
            lock(&self.inner.global_replies).clear();
        }
        changed
    }

    /// Route one inbound message.
    pub async fn dispatch(&self, msg: ChannelMessage) {
        trace!("dispatch {:?}", msg);
        match msg {
            ChannelMessage::Open {
                typ,
                sender_channel,
                initial_window_size,
                maximum_packet_size,
            } => self.channel_open_received(
                typ,
                IncomingChannel {
                    sender_channel,
                    initial_window_size,
                    maximum_packet_size,
                },
            ),
            ChannelMessage::GlobalRequest {
                want_reply,
                request,
            } => {
                debug!("global request {:?}", request.name());
                if want_reply {
                    self.try_send_message(ChannelMessage::RequestFailure);
                }
            }
            ChannelMessage::RequestSuccess { data } => self.global_reply(Some(data)),
            ChannelMessage::RequestFailure => self.global_reply(None),
            msg => {
                let Some(id) = msg.recipient() else {
                    return;
                };
                match self.channel(id) {
                    Some(channel) => channel.dispatch(msg).await,
                    None => debug!("no channel for id {:?}", id),
                }
            }
        }
    }

    /// Parse then [dispatch](Session::dispatch) one message payload.
    pub async fn dispatch_packet(&self, buf: &[u8]) -> Result<(), Error> {
        let msg = ChannelMessage::parse(buf)?;
        self.dispatch(msg).await;
        Ok(())
    }

    fn channel_open_received(&self, typ: ChannelType, incoming: IncomingChannel) {
        let (reason, description) = match typ {
            ChannelType::ForwardedTcpip(info) => {
                let handlers: Vec<_> = lock(&self.inner.forwarded).values().cloned().collect();
                if handlers.iter().any(|h| h.accept(self, incoming, &info)) {
                    return;
                }
                warn!(
                    "no forwarding for {}:{}",
                    info.host_to_connect, info.port_to_connect
                );
                (
                    ChannelOpenFailure::AdministrativelyProhibited,
                    "Port forwarding not requested",
                )
            }
            typ => {
                debug!("refusing channel of type {:?}", typ.name());
                (
                    ChannelOpenFailure::UnknownChannelType,
                    "Unknown channel type",
                )
            }
        };
        self.try_send_message(ChannelMessage::OpenFailure {
            recipient_channel: incoming.sender_channel,
            reason,
            description: description.to_string(),
            language_tag: "en".to_string(),
        });
    }

    /// Send a global request and wait for the reply. Returns the reply
    /// data on success, `None` if the server refused.
    pub async fn send_global_request(
        &self,
        request: GlobalRequest,
    ) -> Result<Option<Bytes>, Error> {
        let (sender, receiver) = oneshot::channel();
        {
            let mut replies = lock(&self.inner.global_replies);
            self.send_message(ChannelMessage::GlobalRequest {
                want_reply: true,
                request,
            })?;
            replies.push_back(sender);
        }
        self.wait_on_handle(receiver)
            .await?
            .map_err(|_| Error::Disconnect)
    }

    /// Send a global request for which no reply is expected.
    pub fn send_global_request_no_reply(&self, request: GlobalRequest) -> Result<(), Error> {
        self.send_message(ChannelMessage::GlobalRequest {
            want_reply: false,
            request,
        })
    }

    fn global_reply(&self, reply: Option<Bytes>) {
        match lock(&self.inner.global_replies).pop_front() {
            Some(sender) => {
                let _ = sender.send(reply);
            }
            None => warn!("global request reply without a request"),
        }
    }

    pub(crate) fn add_forwarded_tcpip_handler(&self, handler: Arc<dyn ForwardedTcpipHandler>) -> u64 {
        let id = {
            let mut last = lock(&self.inner.last_forwarded_id);
            *last += 1;
            *last
        };
        lock(&self.inner.forwarded).insert(id, handler);
        id
    }

    pub(crate) fn remove_forwarded_tcpip_handler(&self, id: u64) {
        lock(&self.inner.forwarded).remove(&id);
    }

    /// Allocate a channel number and register the channel built with
    /// it. A number stays taken until the channel is dropped.
    pub(crate) fn register_channel<F>(&self, make: F) -> Arc<ChannelCore>
    where
        F: FnOnce(ChannelId) -> ChannelCore,
    {
        let mut registry = lock(&self.inner.registry);
        let id = loop {
            let id = ChannelId(registry.last_channel_id.0);
            registry.last_channel_id += Wrapping(1);
            if !registry.channels.contains_key(&id) {
                break id;
            }
        };
        let channel = Arc::new(make(id));
        registry.channels.insert(id, Arc::downgrade(&channel));
        debug!("registered channel {:?}", id);
        channel
    }

    pub(crate) fn deregister_channel(&self, id: ChannelId) {
        lock(&self.inner.registry).channels.remove(&id);
    }

    pub(crate) fn channel(&self, id: ChannelId) -> Option<Arc<ChannelCore>> {
        lock(&self.inner.registry)
            .channels
            .get(&id)
            .and_then(Weak::upgrade)
    }

    fn channels(&self) -> Vec<Arc<ChannelCore>> {
        lock(&self.inner.registry)
            .channels
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Number of channels currently registered.
    pub fn channel_count(&self) -> usize {
        lock(&self.inner.registry).channels.len()
    }
}
