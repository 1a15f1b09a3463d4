use std::ops::Deref;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use super::{ChannelCore, ChannelHandler, ChannelMsg, ClientChannel};
use crate::parsing::{ChannelRequest, ChannelType};
use crate::session::Session;
use crate::{Error, Sig};

/// Forwards what the server sends to [ChannelSession::wait].
struct SessionHandler {
    sender: UnboundedSender<ChannelMsg>,
}

impl SessionHandler {
    fn send(&self, msg: ChannelMsg) {
        // The receiver is gone once the channel is dropped.
        let _ = self.sender.send(msg);
    }
}

#[async_trait]
impl ChannelHandler for SessionHandler {
    async fn data(&self, _channel: &ChannelCore, data: &[u8]) -> Result<(), Error> {
        self.send(ChannelMsg::Data {
            data: Bytes::copy_from_slice(data),
        });
        Ok(())
    }

    async fn extended_data(&self, _channel: &ChannelCore, ext: u32, data: &[u8]) -> Result<(), Error> {
        self.send(ChannelMsg::ExtendedData {
            data: Bytes::copy_from_slice(data),
            ext,
        });
        Ok(())
    }

    async fn eof(&self, _channel: &ChannelCore) -> Result<(), Error> {
        self.send(ChannelMsg::Eof);
        Ok(())
    }

    async fn close(&self, _channel: &ChannelCore) -> Result<(), Error> {
        self.send(ChannelMsg::Close);
        Ok(())
    }

    async fn request(&self, _channel: &ChannelCore, request: &ChannelRequest) -> Result<bool, Error> {
        match request {
            ChannelRequest::ExitStatus { exit_status } => self.send(ChannelMsg::ExitStatus {
                exit_status: *exit_status,
            }),
            ChannelRequest::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                lang_tag,
            } => self.send(ChannelMsg::ExitSignal {
                signal_name: signal_name.clone(),
                core_dumped: *core_dumped,
                error_message: error_message.clone(),
                lang_tag: lang_tag.clone(),
            }),
            ChannelRequest::XonXoff { client_can_do } => self.send(ChannelMsg::XonXoff {
                client_can_do: *client_can_do,
            }),
            _ => return Ok(false),
        }
        Ok(true)
    }

    async fn window_adjusted(&self, _channel: &ChannelCore, new_size: u32) -> Result<(), Error> {
        self.send(ChannelMsg::WindowAdjusted { new_size });
        Ok(())
    }
}

/// A `session` channel, used to run shells, commands and subsystems.
#[derive(Debug)]
pub struct ChannelSession {
    channel: ClientChannel,
    receiver: UnboundedReceiver<ChannelMsg>,
}

impl Deref for ChannelSession {
    type Target = ClientChannel;
    fn deref(&self) -> &ClientChannel {
        &self.channel
    }
}

impl ChannelSession {
    pub fn new(session: &Session) -> ChannelSession {
        let (sender, receiver) = unbounded_channel();
        ChannelSession {
            channel: ClientChannel::new(session, SessionHandler { sender }),
            receiver,
        }
    }

    pub async fn open(&self) -> Result<(), Error> {
        self.channel.open(ChannelType::Session).await
    }

    /// Request a pseudo-terminal with the given characteristics.
    #[allow(clippy::too_many_arguments)] // length checked
    pub async fn request_pty(
        &self,
        want_reply: bool,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        terminal_modes: &[(u8, u32)],
    ) -> Result<(), Error> {
        self.send_request(
            want_reply,
            ChannelRequest::Pty {
                term: term.to_string(),
                col_width,
                row_height,
                pix_width,
                pix_height,
                terminal_modes: terminal_modes.to_vec(),
            },
        )
        .await
    }

    /// Request a remote shell.
    pub async fn request_shell(&self, want_reply: bool) -> Result<(), Error> {
        self.send_request(want_reply, ChannelRequest::Shell).await
    }

    /// Execute a remote program (will be passed to a shell).
    pub async fn exec<A: Into<Vec<u8>>>(&self, want_reply: bool, command: A) -> Result<(), Error> {
        self.send_request(
            want_reply,
            ChannelRequest::Exec {
                command: command.into(),
            },
        )
        .await
    }

    /// Signal a remote process.
    pub async fn signal(&self, signal: Sig) -> Result<(), Error> {
        self.send_request(false, ChannelRequest::Signal { signal })
            .await
    }

    /// Request the start of a subsystem with the given name.
    pub async fn request_subsystem<A: Into<String>>(
        &self,
        want_reply: bool,
        name: A,
    ) -> Result<(), Error> {
        self.send_request(want_reply, ChannelRequest::Subsystem { name: name.into() })
            .await
    }

    /// Request X11 forwarding. See
    /// [RFC4254](https://tools.ietf.org/html/rfc4254#section-6.3.1)
    /// for security issues related to cookies.
    pub async fn request_x11<A: Into<String>, B: Into<String>>(
        &self,
        want_reply: bool,
        single_connection: bool,
        x11_authentication_protocol: A,
        x11_authentication_cookie: B,
        x11_screen_number: u32,
    ) -> Result<(), Error> {
        self.send_request(
            want_reply,
            ChannelRequest::X11 {
                single_connection,
                x11_authentication_protocol: x11_authentication_protocol.into(),
                x11_authentication_cookie: x11_authentication_cookie.into(),
                x11_screen_number,
            },
        )
        .await
    }

    /// Set a remote environment variable.
    pub async fn set_env<A: Into<String>, B: Into<String>>(
        &self,
        want_reply: bool,
        variable_name: A,
        variable_value: B,
    ) -> Result<(), Error> {
        self.send_request(
            want_reply,
            ChannelRequest::Env {
                variable_name: variable_name.into(),
                variable_value: variable_value.into(),
            },
        )
        .await
    }

    /// Inform the server that our window size has changed.
    pub async fn window_change(
        &self,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    ) -> Result<(), Error> {
        self.send_request(
            false,
            ChannelRequest::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            },
        )
        .await
    }

    /// Inform the server that we will accept agent forwarding channels
    pub async fn agent_forward(&self, want_reply: bool) -> Result<(), Error> {
        self.send_request(want_reply, ChannelRequest::AgentForward)
            .await
    }

    /// Send data to the remote process.
    pub async fn data(&self, data: &[u8]) -> Result<(), Error> {
        self.send_data(data).await
    }

    pub async fn extended_data(&self, ext: u32, data: &[u8]) -> Result<(), Error> {
        self.send_extended_data(ext, data).await
    }

    pub fn eof(&self) -> Result<(), Error> {
        self.send_eof()
    }

    /// Wait for the next message from the server. Returns `None` once
    /// the channel is closed and everything it received was returned.
    pub async fn wait(&mut self) -> Option<ChannelMsg> {
        tokio::select! {
            biased;
            msg = self.receiver.recv() => return msg,
            _ = self.channel.closed() => {}
        }
        self.receiver.try_recv().ok()
    }
}
