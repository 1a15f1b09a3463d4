use std::ops::Deref;
use std::sync::Arc;

use log::{debug, warn};
use tokio::net::{TcpStream, ToSocketAddrs};

use super::tcpip::{self, TcpBridge, TcpHandler};
use super::{ChannelCore, RemoteParams};
use crate::forwarding::ForwardedPort;
use crate::parsing::ChannelMessage;
use crate::session::{IncomingChannel, Session};
use crate::{ChannelOpenFailure, Error};

/// A `forwarded-tcpip` channel, opened by the server for a connection
/// to a port it listens on for us.
pub struct ChannelForwardedTcpip {
    core: Arc<ChannelCore>,
    bridge: Arc<TcpBridge>,
}

impl std::fmt::Debug for ChannelForwardedTcpip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelForwardedTcpip")
            .field("core", &self.core)
            .finish()
    }
}

impl Deref for ChannelForwardedTcpip {
    type Target = ChannelCore;
    fn deref(&self) -> &ChannelCore {
        &self.core
    }
}

impl ChannelForwardedTcpip {
    pub(crate) fn new(session: &Session, incoming: IncomingChannel) -> ChannelForwardedTcpip {
        let bridge = Arc::new(TcpBridge::default());
        let remote = RemoteParams {
            id: incoming.sender_channel,
            packet_size: incoming.maximum_packet_size.max(1),
        };
        let handler = TcpHandler(bridge.clone());
        let core = session.register_channel(|id| {
            ChannelCore::new(
                session,
                id,
                Some((remote, incoming.initial_window_size)),
                Box::new(handler),
            )
        });
        ChannelForwardedTcpip { core, bridge }
    }

    /// Connect to `remote_endpoint`, confirm the channel to the server
    /// and pump the connection. If the connection cannot be made, the
    /// channel open is refused with `ConnectFailed`.
    pub async fn bind<A: ToSocketAddrs>(
        &self,
        remote_endpoint: A,
        forwarded_port: &dyn ForwardedPort,
    ) -> Result<(), Error> {
        let Some(recipient_channel) = self.core.remote_id() else {
            return Err(Error::Inconsistent);
        };
        let socket = match TcpStream::connect(remote_endpoint).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("forwarded-tcpip connect failed: {}", e);
                self.core
                    .session()
                    .try_send_message(ChannelMessage::OpenFailure {
                        recipient_channel,
                        reason: ChannelOpenFailure::ConnectFailed,
                        description: e.to_string(),
                        language_tag: "en".to_string(),
                    });
                return Err(e.into());
            }
        };
        self.bridge.attach(socket).await;
        if let Err(e) = self
            .core
            .session()
            .send_message(ChannelMessage::OpenConfirmation {
                recipient_channel,
                sender_channel: self.core.id().into(),
                initial_window_size: self.core.local_window_size(),
                maximum_packet_size: self.core.local_packet_size(),
            })
        {
            self.bridge.close_socket().await;
            return Err(e);
        }
        self.core.mark_open();
        debug!("forwarded-tcpip channel {} confirmed", self.core.id());
        tcpip::run(&self.core, &self.bridge, forwarded_port).await
    }
}
