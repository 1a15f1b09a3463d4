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
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error, trace, warn};
use once_cell::sync::OnceCell;
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit};

use crate::helpers::lock;
use crate::parsing::{ChannelMessage, ChannelRequest};
use crate::session::{Config, Session, WaitResult};
use crate::signal::{Busy, Signal};
use crate::{ChannelId, ChannelOpenFailure, Error, Sig};

mod client;
mod direct_tcpip;
mod forwarded_tcpip;
mod session;
mod tcpip;

pub use client::ClientChannel;
pub use direct_tcpip::ChannelDirectTcpip;
pub use forwarded_tcpip::ChannelForwardedTcpip;
pub use session::ChannelSession;

#[derive(Debug, Clone)]
#[non_exhaustive]
/// Possible messages that [ChannelSession::wait] can receive.
pub enum ChannelMsg {
    Data {
        data: Bytes,
    },
    ExtendedData {
        data: Bytes,
        ext: u32,
    },
    Eof,
    XonXoff {
        client_can_do: bool,
    },
    ExitStatus {
        exit_status: u32,
    },
    ExitSignal {
        signal_name: Sig,
        core_dumped: bool,
        error_message: String,
        lang_tag: String,
    },
    WindowAdjusted {
        new_size: u32,
    },
    Close,
}

/// Hooks run by the session's dispatcher, one per inbound message
/// type. The default methods are the behaviour every channel kind
/// shares; a kind overrides the ones it cares about.
///
/// Returning an error from a hook does not stop dispatch: the error is
/// logged and passed to the channel's exception listeners.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    #[allow(unused_variables)]
    async fn data(&self, channel: &ChannelCore, data: &[u8]) -> Result<(), Error> {
        Ok(())
    }

    #[allow(unused_variables)]
    async fn extended_data(
        &self,
        channel: &ChannelCore,
        ext: u32,
        data: &[u8],
    ) -> Result<(), Error> {
        Ok(())
    }

    #[allow(unused_variables)]
    async fn eof(&self, channel: &ChannelCore) -> Result<(), Error> {
        Ok(())
    }

    /// The server closed the channel. The CLOSE reply is sent after
    /// this returns.
    #[allow(unused_variables)]
    async fn close(&self, channel: &ChannelCore) -> Result<(), Error> {
        Ok(())
    }

    /// Returns `true` if the request was handled. Unhandled requests
    /// are answered with a failure when the server wants a reply.
    #[allow(unused_variables)]
    async fn request(&self, channel: &ChannelCore, request: &ChannelRequest) -> Result<bool, Error> {
        debug!("unhandled request {:?} on channel {}", request.name(), channel.id());
        Ok(false)
    }

    #[allow(unused_variables)]
    async fn window_adjusted(&self, channel: &ChannelCore, new_size: u32) -> Result<(), Error> {
        Ok(())
    }

    #[allow(unused_variables)]
    async fn success(&self, channel: &ChannelCore) -> Result<(), Error> {
        Ok(())
    }

    #[allow(unused_variables)]
    async fn failure(&self, channel: &ChannelCore) -> Result<(), Error> {
        Ok(())
    }

    /// Called before the channel is closed locally because the
    /// connection was lost.
    #[allow(unused_variables)]
    fn disconnected(&self, channel: &ChannelCore) {}

    #[allow(unused_variables)]
    fn error_occurred(&self, channel: &ChannelCore, description: &str) {}
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RemoteParams {
    pub id: u32,
    pub packet_size: u32,
}

#[derive(Debug)]
pub(crate) enum Reply {
    OpenConfirmed,
    OpenFailed {
        reason: ChannelOpenFailure,
        description: String,
    },
    Success,
    Failure,
}

const INITIAL: u8 = 0;
const OPEN: u8 = 1;
const CLOSED: u8 = 2;

type ClosedListener = Box<dyn FnOnce(ChannelId) + Send>;
type ExceptionListener = Arc<dyn Fn(&Error) + Send + Sync>;

/// The state shared by every channel kind: numbers, windows, the open
/// state and the close protocol.
///
/// A core is registered with its session under its local number for
/// as long as it lives. Dropping the last handle to it closes the
/// channel without waiting for the server.
pub struct ChannelCore {
    id: ChannelId,
    session: Session,
    config: Arc<Config>,
    handler: Box<dyn ChannelHandler>,
    remote: OnceCell<RemoteParams>,

    local_window_target: u32,
    local_packet_size: u32,
    local_window: Mutex<u32>,
    remote_window: Mutex<u32>,
    window_notify: Notify,

    state: AtomicU8,
    eof_sent: AtomicBool,
    eof_received: AtomicBool,
    close_sent: AtomicBool,
    close_received: Signal,
    closed: Signal,
    busy: Busy,

    pending: Mutex<VecDeque<oneshot::Sender<Reply>>>,
    pub(crate) permit: Mutex<Option<OwnedSemaphorePermit>>,
    closed_listeners: Mutex<Vec<ClosedListener>>,
    exception_listeners: Mutex<Vec<ExceptionListener>>,
}

impl std::fmt::Debug for ChannelCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelCore")
            .field("id", &self.id)
            .field("remote", &self.remote.get().map(|r| r.id))
            .field("state", &self.state.load(Ordering::Acquire))
            .finish()
    }
}

impl ChannelCore {
    pub(crate) fn new(
        session: &Session,
        id: ChannelId,
        remote: Option<(RemoteParams, u32)>,
        handler: Box<dyn ChannelHandler>,
    ) -> ChannelCore {
        let config = session.config().clone();
        let remote_params = OnceCell::new();
        let mut remote_window = 0;
        if let Some((params, window)) = remote {
            let _ = remote_params.set(params);
            remote_window = window;
        }
        ChannelCore {
            id,
            session: session.clone(),
            handler,
            remote: remote_params,
            local_window_target: config.window_size,
            local_packet_size: config.maximum_packet_size,
            local_window: Mutex::new(config.window_size),
            remote_window: Mutex::new(remote_window),
            window_notify: Notify::new(),
            state: AtomicU8::new(INITIAL),
            eof_sent: AtomicBool::new(false),
            eof_received: AtomicBool::new(false),
            close_sent: AtomicBool::new(false),
            close_received: Signal::new(),
            closed: Signal::new(),
            busy: Busy::default(),
            pending: Mutex::new(VecDeque::new()),
            permit: Mutex::new(None),
            closed_listeners: Mutex::new(Vec::new()),
            exception_listeners: Mutex::new(Vec::new()),
            config,
        }
    }

    /// Our number for this channel.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// The server's number for this channel, once known.
    pub fn remote_id(&self) -> Option<u32> {
        self.remote.get().map(|r| r.id)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == OPEN
    }

    /// Bytes the server may still send before we adjust the window.
    pub fn local_window_size(&self) -> u32 {
        *lock(&self.local_window)
    }

    pub fn local_packet_size(&self) -> u32 {
        self.local_packet_size
    }

    /// Bytes we may still send.
    pub fn remote_window_size(&self) -> u32 {
        *lock(&self.remote_window)
    }

    pub fn remote_packet_size(&self) -> Option<u32> {
        self.remote.get().map(|r| r.packet_size)
    }

    /// Register a callback run once, when the channel becomes closed.
    /// It runs on the task that closed the channel, and may drop the
    /// channel.
    pub fn on_closed<F: FnOnce(ChannelId) + Send + 'static>(&self, f: F) {
        lock(&self.closed_listeners).push(Box::new(f));
    }

    /// Register a callback run for every error raised while handling
    /// an inbound message.
    pub fn on_exception<F: Fn(&Error) + Send + Sync + 'static>(&self, f: F) {
        lock(&self.exception_listeners).push(Arc::new(f));
    }

    /// Resolves once the channel is closed, by either side.
    pub async fn closed(&self) {
        self.closed.wait().await
    }

    /// Resolves once the server sent CLOSE.
    pub(crate) async fn close_received(&self) {
        self.close_received.wait().await
    }

    fn remote(&self) -> Result<RemoteParams, Error> {
        match self.remote.get() {
            Some(r) if self.is_open() => Ok(*r),
            _ => Err(Error::WrongChannel),
        }
    }

    /// Tell the server we will not send any more data. The channel
    /// stays open.
    pub fn send_eof(&self) -> Result<(), Error> {
        let remote = self.remote()?;
        if !self.eof_sent.swap(true, Ordering::AcqRel) {
            self.session.send_message(ChannelMessage::Eof {
                recipient_channel: remote.id,
            })?;
        }
        Ok(())
    }

    /// Send data, waiting for the server to adjust the window when it
    /// is exhausted.
    pub async fn send_data(&self, data: &[u8]) -> Result<(), Error> {
        self.send_chunks(None, data).await
    }

    /// Send data on an extended stream (`1` is stderr).
    pub async fn send_extended_data(&self, ext: u32, data: &[u8]) -> Result<(), Error> {
        self.send_chunks(Some(ext), data).await
    }

    async fn send_chunks(&self, ext: Option<u32>, mut data: &[u8]) -> Result<(), Error> {
        let remote = self.remote()?;
        while !data.is_empty() {
            let n = self.reserve_window(data.len(), remote.packet_size).await?;
            let (chunk, rest) = data.split_at(n);
            let chunk = Bytes::copy_from_slice(chunk);
            trace!("channel {}: sending {} bytes", self.id, n);
            self.session.send_message(match ext {
                Some(data_type_code) => ChannelMessage::ExtendedData {
                    recipient_channel: remote.id,
                    data_type_code,
                    data: chunk,
                },
                None => ChannelMessage::Data {
                    recipient_channel: remote.id,
                    data: chunk,
                },
            })?;
            data = rest;
        }
        Ok(())
    }

    /// Take up to `len` bytes from the remote window, waiting while it
    /// is empty.
    async fn reserve_window(&self, len: usize, packet_size: u32) -> Result<usize, Error> {
        let len = u32::try_from(len).unwrap_or(u32::MAX);
        loop {
            let notified = self.window_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut window = lock(&self.remote_window);
                let writable = (*window).min(packet_size).min(len);
                if writable > 0 {
                    *window -= writable;
                    return Ok(writable as usize);
                }
            }
            debug!("channel {}: remote window exhausted", self.id);
            tokio::select! {
                _ = &mut notified => {}
                _ = self.closed.wait() => return Err(Error::WrongChannel),
                e = self.session.failed() => return Err(e),
            }
        }
    }

    /// Send a channel request. With `want_reply`, wait for the server's
    /// answer and fail with [Error::RequestDenied] if it refused.
    pub async fn send_request(&self, want_reply: bool, request: ChannelRequest) -> Result<(), Error> {
        let remote = self.remote()?;
        let name = request.name().to_string();
        let msg = ChannelMessage::Request {
            recipient_channel: remote.id,
            want_reply,
            request,
        };
        if !want_reply {
            return self.session.send_message(msg);
        }
        let reply = self.send_expecting_reply(msg)?;
        let reply = match self.session.wait_on_handle(reply).await {
            Ok(reply) => reply,
            Err(e) => {
                self.cancel_replies();
                return Err(e);
            }
        };
        match reply {
            Ok(Reply::Success) => Ok(()),
            Ok(reply) => {
                debug!("channel {}: {:?} answered with {:?}", self.id, name, reply);
                Err(Error::RequestDenied { request: name })
            }
            Err(_) => Err(Error::Disconnect),
        }
    }

    /// Queue `msg`, and return the receiver of the next reply addressed
    /// to this channel.
    pub(crate) fn send_expecting_reply(
        &self,
        msg: ChannelMessage,
    ) -> Result<oneshot::Receiver<Reply>, Error> {
        let mut pending = lock(&self.pending);
        self.session.send_message(msg)?;
        let (sender, receiver) = oneshot::channel();
        pending.push_back(sender);
        Ok(receiver)
    }

    /// Forget the replies we are waiting for, after giving up on them.
    pub(crate) fn cancel_replies(&self) {
        lock(&self.pending).clear();
    }

    fn reply(&self, reply: Reply) {
        match lock(&self.pending).pop_front() {
            Some(sender) => {
                let _ = sender.send(reply);
            }
            None => warn!("channel {}: unexpected {:?}", self.id, reply),
        }
    }

    /// Close the channel: send EOF and CLOSE if needed, then wait at
    /// most [Config::channel_close_timeout] for the server's CLOSE.
    /// Closing a channel that is not open does nothing.
    pub async fn close(&self) {
        if self.is_open() {
            if self.send_close_messages() && self.session.is_connected() {
                match self
                    .session
                    .try_wait(
                        self.close_received.wait(),
                        self.config.channel_close_timeout,
                    )
                    .await
                {
                    WaitResult::Success => {}
                    WaitResult::TimedOut => {
                        warn!("channel {}: no CLOSE from the server", self.id)
                    }
                    WaitResult::Failed => {
                        debug!("channel {}: session lost while closing", self.id)
                    }
                }
            }
            self.mark_closed();
        }
        self.busy.idle().await;
    }

    /// Send EOF and CLOSE, each at most once. Returns `true` if the
    /// server's CLOSE is still outstanding.
    fn send_close_messages(&self) -> bool {
        let Some(remote) = self.remote.get() else {
            return false;
        };
        if !self.session.is_connected() {
            return false;
        }
        let peer_done =
            self.eof_received.load(Ordering::Acquire) || self.close_received.is_set();
        if !peer_done && !self.eof_sent.swap(true, Ordering::AcqRel) {
            self.session.try_send_message(ChannelMessage::Eof {
                recipient_channel: remote.id,
            });
        }
        if !self.close_sent.swap(true, Ordering::AcqRel) {
            debug!("channel {}: sending CLOSE", self.id);
            self.session.try_send_message(ChannelMessage::Close {
                recipient_channel: remote.id,
            });
        }
        !self.close_received.is_set()
    }

    /// Give up on an open attempt: the channel will not open, even if
    /// the server's confirmation is still on its way.
    pub(crate) fn abandon(&self) {
        self.cancel_replies();
        if self
            .state
            .compare_exchange(INITIAL, CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!("channel {} abandoned", self.id);
            lock(&self.permit).take();
            self.closed.set();
        } else if self.is_open() {
            // Confirmed in the meantime.
            self.send_close_messages();
            self.mark_closed();
        }
    }

    pub(crate) fn mark_open(&self) -> bool {
        self.state
            .compare_exchange(INITIAL, OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to the closed state. Only the first caller runs the closed
    /// listeners.
    fn mark_closed(&self) -> bool {
        let _busy = self.busy.enter();
        if self
            .state
            .compare_exchange(OPEN, CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        debug!("channel {} closed", self.id);
        self.closed.set();
        lock(&self.permit).take();
        lock(&self.pending).clear();
        let listeners = std::mem::take(&mut *lock(&self.closed_listeners));
        for listener in listeners {
            listener(self.id);
        }
        true
    }

    fn raise_exception(&self, e: &Error) {
        error!("channel {}: {}", self.id, e);
        let listeners: Vec<_> = lock(&self.exception_listeners).clone();
        for listener in listeners {
            listener(e);
        }
    }

    /// Handle one inbound message addressed to this channel.
    pub(crate) async fn dispatch(&self, msg: ChannelMessage) {
        if let Err(e) = self.dispatch_inner(msg).await {
            self.raise_exception(&e);
        }
    }

    async fn dispatch_inner(&self, msg: ChannelMessage) -> Result<(), Error> {
        match msg {
            ChannelMessage::OpenConfirmation {
                sender_channel,
                initial_window_size,
                maximum_packet_size,
                ..
            } => {
                let params = RemoteParams {
                    id: sender_channel,
                    packet_size: maximum_packet_size.max(1),
                };
                if self.remote.set(params).is_err() {
                    return Err(Error::Inconsistent);
                }
                *lock(&self.remote_window) = initial_window_size;
                if !self.mark_open() {
                    // The opener gave up before the server answered.
                    debug!(
                        "channel {}: late confirmation, closing {}",
                        self.id, sender_channel
                    );
                    if !self.close_sent.swap(true, Ordering::AcqRel) {
                        self.session.try_send_message(ChannelMessage::Close {
                            recipient_channel: sender_channel,
                        });
                    }
                    return Ok(());
                }
                debug!(
                    "channel {} confirmed as {}, window {}",
                    self.id, sender_channel, initial_window_size
                );
                self.reply(Reply::OpenConfirmed);
                Ok(())
            }
            ChannelMessage::OpenFailure {
                reason,
                description,
                ..
            } => {
                self.reply(Reply::OpenFailed {
                    reason,
                    description,
                });
                Ok(())
            }
            ChannelMessage::WindowAdjust { bytes_to_add, .. } => {
                let new_size = {
                    let mut window = lock(&self.remote_window);
                    *window = window.saturating_add(bytes_to_add);
                    *window
                };
                trace!("channel {}: window adjusted to {}", self.id, new_size);
                self.window_notify.notify_waiters();
                self.handler.window_adjusted(self, new_size).await
            }
            ChannelMessage::Data { data, .. } => {
                self.consume_local_window(data.len());
                self.handler.data(self, &data).await
            }
            ChannelMessage::ExtendedData {
                data_type_code,
                data,
                ..
            } => {
                self.consume_local_window(data.len());
                self.handler.extended_data(self, data_type_code, &data).await
            }
            ChannelMessage::Eof { .. } => {
                self.eof_received.store(true, Ordering::Release);
                self.handler.eof(self).await
            }
            ChannelMessage::Close { .. } => {
                self.close_received.set();
                let result = self.handler.close(self).await;
                if let Some(remote) = self.remote.get() {
                    if self.session.is_connected() && !self.close_sent.swap(true, Ordering::AcqRel)
                    {
                        self.session.try_send_message(ChannelMessage::Close {
                            recipient_channel: remote.id,
                        });
                    }
                }
                self.mark_closed();
                result
            }
            ChannelMessage::Request {
                want_reply,
                request,
                ..
            } => {
                let handled = self.handler.request(self, &request).await;
                if want_reply {
                    if let Some(remote) = self.remote.get() {
                        let recipient_channel = remote.id;
                        self.session.try_send_message(match handled {
                            Ok(true) => ChannelMessage::Success { recipient_channel },
                            _ => ChannelMessage::Failure { recipient_channel },
                        });
                    }
                }
                handled.map(|_| ())
            }
            ChannelMessage::Success { .. } => {
                self.reply(Reply::Success);
                self.handler.success(self).await
            }
            ChannelMessage::Failure { .. } => {
                self.reply(Reply::Failure);
                self.handler.failure(self).await
            }
            msg => {
                debug!("channel {}: ignoring {:?}", self.id, msg);
                Ok(())
            }
        }
    }

    /// Account for `len` received bytes, and give the server a new
    /// window when less than half of it is left.
    fn consume_local_window(&self, len: usize) {
        let len = u32::try_from(len).unwrap_or(u32::MAX);
        let adjust = {
            let mut window = lock(&self.local_window);
            *window = window.saturating_sub(len);
            if *window < self.local_window_target / 2 {
                let adjust = self.local_window_target - *window;
                *window = self.local_window_target;
                Some(adjust)
            } else {
                None
            }
        };
        if let (Some(bytes_to_add), Some(remote)) = (adjust, self.remote.get()) {
            debug!("channel {}: adjusting window by {}", self.id, bytes_to_add);
            self.session.try_send_message(ChannelMessage::WindowAdjust {
                recipient_channel: remote.id,
                bytes_to_add,
            });
        }
    }

    /// The connection is gone: close locally without sending anything,
    /// and release every wait.
    pub(crate) fn session_disconnected(&self) {
        self.handler.disconnected(self);
        lock(&self.pending).clear();
        self.mark_closed();
        self.window_notify.notify_waiters();
    }

    pub(crate) fn session_error(&self, description: &str) {
        self.handler.error_occurred(self, description);
        self.window_notify.notify_waiters();
    }
}

impl Drop for ChannelCore {
    fn drop(&mut self) {
        if self.is_open() {
            self.send_close_messages();
            self.mark_closed();
        }
        self.session.deregister_channel(self.id);
        debug!("drop channel {}", self.id);
    }
}
