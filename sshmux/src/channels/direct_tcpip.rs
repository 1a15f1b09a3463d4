use std::ops::Deref;
use std::sync::Arc;

use log::debug;
use tokio::net::TcpStream;

use super::tcpip::{self, TcpBridge, TcpHandler};
use super::ClientChannel;
use crate::forwarding::ForwardedPort;
use crate::parsing::{ChannelType, TcpChannelInfo};
use crate::session::Session;
use crate::Error;

/// A `direct-tcpip` channel: the server connects to a host and port on
/// our behalf, and the channel carries that connection to a local
/// socket.
pub struct ChannelDirectTcpip {
    channel: ClientChannel,
    bridge: Arc<TcpBridge>,
}

impl std::fmt::Debug for ChannelDirectTcpip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelDirectTcpip")
            .field("channel", &self.channel)
            .finish()
    }
}

impl Deref for ChannelDirectTcpip {
    type Target = ClientChannel;
    fn deref(&self) -> &ClientChannel {
        &self.channel
    }
}

impl ChannelDirectTcpip {
    pub fn new(session: &Session) -> ChannelDirectTcpip {
        let bridge = Arc::new(TcpBridge::default());
        ChannelDirectTcpip {
            channel: ClientChannel::new(session, TcpHandler(bridge.clone())),
            bridge,
        }
    }

    /// Open the channel to `host:port`, for the connection accepted on
    /// `socket`. The socket's peer is reported as the originator. The
    /// socket is closed if the channel cannot be opened.
    pub async fn open(&self, host: &str, port: u32, socket: TcpStream) -> Result<(), Error> {
        let originator = socket.peer_addr()?;
        self.bridge.attach(socket).await;
        let info = TcpChannelInfo {
            host_to_connect: host.to_string(),
            port_to_connect: port,
            originator_address: originator.ip().to_string(),
            originator_port: u32::from(originator.port()),
        };
        if let Err(e) = self.channel.open(ChannelType::DirectTcpip(info)).await {
            debug!("direct-tcpip to {}:{} failed: {:?}", host, port, e);
            self.bridge.close_socket().await;
            return Err(e);
        }
        Ok(())
    }

    /// Pump the socket into the channel until the socket closes, the
    /// server closes the channel, the session fails or
    /// `forwarded_port` starts closing. The socket is shut down and
    /// the channel closed on return.
    pub async fn bind(&self, forwarded_port: &dyn ForwardedPort) -> Result<(), Error> {
        tcpip::run(&self.channel, &self.bridge, forwarded_port).await
    }
}
