//! Bridge between a TCP socket and a channel, shared by
//! `direct-tcpip` and `forwarded-tcpip` channels.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;

use super::{ChannelCore, ChannelHandler};
use crate::forwarding::ForwardedPort;
use crate::helpers::lock;
use crate::signal::Signal;
use crate::Error;

/// The two halves of the socket: the pump reads, the dispatcher
/// writes.
#[derive(Default)]
pub(crate) struct TcpBridge {
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    shutdown: Signal,
}

impl TcpBridge {
    pub async fn attach(&self, socket: TcpStream) {
        let (reader, writer) = socket.into_split();
        *lock(&self.reader) = Some(reader);
        *self.writer.lock().await = Some(writer);
    }

    /// Shut down and drop the socket.
    pub async fn close_socket(&self) {
        lock(&self.reader).take();
        self.shutdown_write().await;
    }

    async fn shutdown_write(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("socket shutdown: {:?}", e);
            }
        }
    }
}

pub(crate) struct TcpHandler(pub Arc<TcpBridge>);

#[async_trait]
impl ChannelHandler for TcpHandler {
    async fn data(&self, _channel: &ChannelCore, data: &[u8]) -> Result<(), Error> {
        if let Some(writer) = self.0.writer.lock().await.as_mut() {
            writer.write_all(data).await?;
        }
        Ok(())
    }

    async fn eof(&self, _channel: &ChannelCore) -> Result<(), Error> {
        self.0.shutdown_write().await;
        Ok(())
    }

    async fn close(&self, _channel: &ChannelCore) -> Result<(), Error> {
        self.0.shutdown.set();
        Ok(())
    }

    fn disconnected(&self, _channel: &ChannelCore) {
        self.0.shutdown.set();
    }

    fn error_occurred(&self, channel: &ChannelCore, description: &str) {
        warn!("channel {}: closing socket after session error: {}", channel.id(), description);
        self.0.shutdown.set();
    }
}

/// Resolves once `closing` is raised or its sender is gone.
async fn raised(mut closing: watch::Receiver<bool>) {
    loop {
        if *closing.borrow_and_update() {
            return;
        }
        if closing.changed().await.is_err() {
            return;
        }
    }
}

enum Event {
    Read(std::io::Result<usize>),
    Stop,
    Failed(Error),
}

/// Copy the socket to the channel until either side stops, then shut
/// the socket down and close the channel.
pub(crate) async fn run(
    channel: &ChannelCore,
    bridge: &TcpBridge,
    forwarded_port: &dyn ForwardedPort,
) -> Result<(), Error> {
    let Some(mut reader) = lock(&bridge.reader).take() else {
        return Err(Error::WrongChannel);
    };
    forwarded_port.connection_opened(channel.id());
    let closing = forwarded_port.closing();
    let packet_size = channel
        .remote_packet_size()
        .unwrap_or(channel.local_packet_size())
        .max(1) as usize;
    let mut buf = vec![0; packet_size];

    let result = loop {
        let event = tokio::select! {
            r = reader.read(&mut buf) => Event::Read(r),
            _ = raised(closing.clone()) => Event::Stop,
            _ = channel.close_received() => Event::Stop,
            _ = bridge.shutdown.wait() => Event::Stop,
            e = channel.session().failed() => Event::Failed(e),
        };
        match event {
            Event::Read(Ok(0)) => {
                debug!("channel {}: socket closed", channel.id());
                if let Err(e) = channel.send_eof() {
                    debug!("channel {}: {:?}", channel.id(), e);
                }
                break Ok(());
            }
            Event::Read(Ok(n)) => {
                if let Err(e) = channel.send_data(buf.get(..n).unwrap_or_default()).await {
                    break Err(e);
                }
            }
            Event::Read(Err(e)) => break Err(e.into()),
            Event::Stop => break Ok(()),
            Event::Failed(e) => break Err(e),
        }
    };

    drop(reader);
    bridge.close_socket().await;
    channel.close().await;
    forwarded_port.connection_closed(channel.id());
    result
}
