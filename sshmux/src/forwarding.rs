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

//! Port forwarding on top of the tcpip channels.
//!
//! [ForwardedPortLocal] listens on a local address and opens a
//! `direct-tcpip` channel for every connection it accepts.
//! [ForwardedPortRemote] asks the server to listen, and connects every
//! `forwarded-tcpip` channel the server opens to a fixed target.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use ssh_encoding::Decode;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::channels::{ChannelDirectTcpip, ChannelForwardedTcpip};
use crate::helpers::lock;
use crate::parsing::{GlobalRequest, TcpChannelInfo};
use crate::session::{ForwardedTcpipHandler, IncomingChannel, Session};
use crate::{ChannelId, Error};

/// What a tcpip channel needs from the forwarding that created it.
pub trait ForwardedPort: Send + Sync {
    /// Raised when the forwarding stops; channels bound to it close.
    fn closing(&self) -> watch::Receiver<bool>;

    #[allow(unused_variables)]
    fn connection_opened(&self, channel: ChannelId) {}

    #[allow(unused_variables)]
    fn connection_closed(&self, channel: ChannelId) {}
}

/// Closing flag and connection count shared by both kinds of
/// forwarding.
struct PortState {
    closing: watch::Sender<bool>,
    connections: watch::Sender<usize>,
}

impl PortState {
    fn new() -> Self {
        PortState {
            closing: watch::channel(false).0,
            connections: watch::channel(0).0,
        }
    }

    fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// Raise `closing`, then wait at most `timeout` for the open
    /// connections to finish. Returns `false` on timeout.
    async fn drain(&self, timeout: Duration) -> bool {
        self.closing.send_replace(true);
        let mut connections = self.connections.subscribe();
        let drained = tokio::time::timeout(timeout, async move {
            let _ = connections.wait_for(|n| *n == 0).await;
        })
        .await
        .is_ok();
        if !drained {
            warn!(
                "{} forwarded connections still open",
                *self.connections.borrow()
            );
        }
        drained
    }
}

impl ForwardedPort for PortState {
    fn closing(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }

    fn connection_opened(&self, channel: ChannelId) {
        debug!("forwarded connection opened on channel {}", channel);
        self.connections.send_modify(|n| *n += 1);
    }

    fn connection_closed(&self, channel: ChannelId) {
        debug!("forwarded connection closed on channel {}", channel);
        self.connections.send_modify(|n| *n = n.saturating_sub(1));
    }
}

struct LocalInner {
    session: Session,
    host: String,
    port: u32,
    state: PortState,
}

/// Local port forwarding: connections accepted on a local address are
/// carried to `host:port` as seen from the server.
pub struct ForwardedPortLocal {
    inner: Arc<LocalInner>,
    local_addr: SocketAddr,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ForwardedPortLocal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardedPortLocal")
            .field("local_addr", &self.local_addr)
            .field("host", &self.inner.host)
            .field("port", &self.inner.port)
            .finish()
    }
}

impl ForwardedPortLocal {
    /// Listen on `bind_addr` and start accepting connections.
    pub async fn start<A: ToSocketAddrs, H: Into<String>>(
        session: &Session,
        bind_addr: A,
        host: H,
        port: u32,
    ) -> Result<ForwardedPortLocal, Error> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let inner = Arc::new(LocalInner {
            session: session.clone(),
            host: host.into(),
            port,
            state: PortState::new(),
        });
        info!(
            "forwarding {} to {}:{}",
            local_addr, inner.host, inner.port
        );
        let accept_task = tokio::spawn(accept_loop(inner.clone(), listener));
        Ok(ForwardedPortLocal {
            inner,
            local_addr,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections, close the open ones and wait at
    /// most `timeout` for them to finish.
    pub async fn stop(&self, timeout: Duration) -> bool {
        self.inner.state.closing.send_replace(true);
        let accept_task = lock(&self.accept_task).take();
        if let Some(accept_task) = accept_task {
            if let Err(e) = accept_task.await {
                debug!("accept task: {:?}", e);
            }
        }
        self.inner.state.drain(timeout).await
    }
}

impl ForwardedPort for ForwardedPortLocal {
    fn closing(&self) -> watch::Receiver<bool> {
        self.inner.state.closing()
    }
}

impl Drop for ForwardedPortLocal {
    fn drop(&mut self) {
        self.inner.state.closing.send_replace(true);
    }
}

async fn accept_loop(inner: Arc<LocalInner>, listener: TcpListener) {
    let mut closing = inner.state.closing();
    loop {
        if *closing.borrow_and_update() {
            break;
        }
        tokio::select! {
            r = listener.accept() => match r {
                Ok((socket, peer)) => {
                    debug!("accepted connection from {}", peer);
                    tokio::spawn(forward_local(inner.clone(), socket));
                }
                Err(e) => {
                    error!("accept: {}", e);
                    break;
                }
            },
            r = closing.changed() => {
                if r.is_err() {
                    break;
                }
            }
        }
    }
}

async fn forward_local(inner: Arc<LocalInner>, socket: TcpStream) {
    let channel = ChannelDirectTcpip::new(&inner.session);
    if let Err(e) = channel.open(&inner.host, inner.port, socket).await {
        warn!("could not open direct-tcpip channel: {}", e);
        return;
    }
    if let Err(e) = channel.bind(&inner.state).await {
        debug!("direct-tcpip channel {} ended: {}", channel.id(), e);
    }
}

struct RemoteInner {
    session: Session,
    bound_host: String,
    bound_port: u32,
    target_host: String,
    target_port: u16,
    state: PortState,
}

/// Accepts the server's `forwarded-tcpip` channels for one forwarding.
struct RemoteForwarder(Arc<RemoteInner>);

impl ForwardedTcpipHandler for RemoteForwarder {
    fn accept(&self, session: &Session, channel: IncomingChannel, info: &TcpChannelInfo) -> bool {
        let inner = &self.0;
        if info.host_to_connect != inner.bound_host
            || info.port_to_connect != inner.bound_port
            || inner.state.is_closing()
        {
            return false;
        }
        debug!(
            "forwarded connection from {}:{}",
            info.originator_address, info.originator_port
        );
        let channel = ChannelForwardedTcpip::new(session, channel);
        let inner = inner.clone();
        tokio::spawn(async move {
            let target = (inner.target_host.clone(), inner.target_port);
            if let Err(e) = channel.bind(target, &inner.state).await {
                debug!("forwarded-tcpip channel {} ended: {}", channel.id(), e);
            }
        });
        true
    }
}

/// Remote port forwarding: the server listens on `bound_host:bound_port`
/// and each connection it accepts is carried to a local target.
pub struct ForwardedPortRemote {
    inner: Arc<RemoteInner>,
    handler_id: Mutex<Option<u64>>,
}

impl std::fmt::Debug for ForwardedPortRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardedPortRemote")
            .field("bound_host", &self.inner.bound_host)
            .field("bound_port", &self.inner.bound_port)
            .field("target_host", &self.inner.target_host)
            .field("target_port", &self.inner.target_port)
            .finish()
    }
}

impl ForwardedPortRemote {
    /// Ask the server to listen on `bound_host:bound_port` (port `0`
    /// lets the server choose), forwarding to `target_host:target_port`.
    pub async fn start<B: Into<String>, T: Into<String>>(
        session: &Session,
        bound_host: B,
        bound_port: u32,
        target_host: T,
        target_port: u16,
    ) -> Result<ForwardedPortRemote, Error> {
        let bound_host = bound_host.into();
        let reply = session
            .send_global_request(GlobalRequest::TcpipForward {
                address: bound_host.clone(),
                port: bound_port,
            })
            .await?;
        let Some(reply) = reply else {
            return Err(Error::RequestDenied {
                request: "tcpip-forward".to_string(),
            });
        };
        let bound_port = if bound_port == 0 {
            let mut r: &[u8] = reply.as_ref();
            u32::decode(&mut r)?
        } else {
            bound_port
        };
        let inner = Arc::new(RemoteInner {
            session: session.clone(),
            bound_host,
            bound_port,
            target_host: target_host.into(),
            target_port,
            state: PortState::new(),
        });
        info!(
            "server forwarding {}:{} to {}:{}",
            inner.bound_host, inner.bound_port, inner.target_host, inner.target_port
        );
        let handler_id = session.add_forwarded_tcpip_handler(Arc::new(RemoteForwarder(inner.clone())));
        Ok(ForwardedPortRemote {
            inner,
            handler_id: Mutex::new(Some(handler_id)),
        })
    }

    /// The port the server listens on.
    pub fn bound_port(&self) -> u32 {
        self.inner.bound_port
    }

    /// Cancel the forwarding on the server, close the open connections
    /// and wait at most `timeout` for them to finish.
    pub async fn stop(&self, timeout: Duration) -> bool {
        let handler_id = lock(&self.handler_id).take();
        if let Some(handler_id) = handler_id {
            let session = &self.inner.session;
            session.remove_forwarded_tcpip_handler(handler_id);
            if session.is_connected() {
                let cancel = GlobalRequest::CancelTcpipForward {
                    address: self.inner.bound_host.clone(),
                    port: self.inner.bound_port,
                };
                match session.send_global_request(cancel).await {
                    Ok(Some(_)) => {}
                    Ok(None) => warn!("server refused to cancel forwarding"),
                    Err(e) => debug!("cancel-tcpip-forward: {}", e),
                }
            }
        }
        self.inner.state.drain(timeout).await
    }
}

impl ForwardedPort for ForwardedPortRemote {
    fn closing(&self) -> watch::Receiver<bool> {
        self.inner.state.closing()
    }
}

impl Drop for ForwardedPortRemote {
    fn drop(&mut self) {
        if let Some(handler_id) = lock(&self.handler_id).take() {
            self.inner.session.remove_forwarded_tcpip_handler(handler_id);
        }
        self.inner.state.closing.send_replace(true);
    }
}
