#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
#![allow(clippy::single_match, clippy::upper_case_acronyms)]
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

//! Channel layer of an SSH client, based on tokio.
//!
//! An SSH connection carries any number of *channels*: flow-controlled,
//! bidirectional streams identified by a pair of 32-bit numbers, one
//! chosen by each side. This crate implements everything above the
//! encrypted transport: opening channels (with retries), the data
//! windows, EOF and the close handshake, session requests, and the two
//! TCP/IP channel kinds used for port forwarding.
//!
//! * [Session] is the multiplexer. Its outbound side is a queue of
//!   [ChannelMessage]s that the transport writer drains; its inbound
//!   side is [Session::dispatch], called by the transport reader for
//!   each decrypted message.
//! * [ChannelSession] runs shells, commands and subsystems.
//! * [ChannelDirectTcpip] and [ChannelForwardedTcpip] bridge a TCP
//!   socket to a channel, and are driven by [ForwardedPortLocal] and
//!   [ForwardedPortRemote].
//!
//! ```no_run
//! use std::sync::Arc;
//! use sshmux::{ChannelMsg, ChannelSession, Config, Session};
//!
//! # async fn run() -> Result<(), sshmux::Error> {
//! let (session, mut outbound) = Session::new(Arc::new(Config::default()));
//! // Hand `outbound` to the transport writer, and call
//! // `session.dispatch(..)` from the transport reader.
//! # tokio::spawn(async move { while outbound.recv().await.is_some() {} });
//! let mut channel = ChannelSession::new(&session);
//! channel.open().await?;
//! channel.exec(true, "uname -a").await?;
//! while let Some(msg) = channel.wait().await {
//!     if let ChannelMsg::Data { data } = msg {
//!         println!("{}", String::from_utf8_lossy(&data));
//!     }
//! }
//! channel.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Closing channels
//!
//! [ChannelCore::close] sends EOF and CLOSE (at most once each, and
//! only while the session is connected), then waits at most
//! [Config::channel_close_timeout] for the server's CLOSE. Dropping a
//! channel performs the same teardown without waiting, which makes it
//! safe to drop a channel from inside its own `closed` listener.

use std::fmt::{Display, Formatter};

use thiserror::Error;

#[cfg(test)]
mod tests;

mod helpers;
mod msg;
mod parsing;
mod signal;

pub mod channels;
pub mod forwarding;
pub mod session;

pub use channels::{
    ChannelCore, ChannelDirectTcpip, ChannelForwardedTcpip, ChannelHandler, ChannelMsg,
    ChannelSession, ClientChannel,
};
pub use forwarding::{ForwardedPort, ForwardedPortLocal, ForwardedPortRemote};
pub use parsing::{ChannelMessage, ChannelRequest, ChannelType, GlobalRequest, TcpChannelInfo};
pub use session::{Config, Session, SessionStatus, WaitResult};

#[derive(Debug, Error)]
pub enum Error {
    /// The server refused every attempt to open a channel.
    #[error("Failed to open a channel after {attempts} attempts.")]
    ChannelOpenFailed {
        attempts: usize,
        reason: ChannelOpenFailure,
        description: String,
    },

    /// The server answered a request with a failure.
    #[error("The request {request:?} was rejected by the other party")]
    RequestDenied { request: String },

    /// Message received/sent on unopened channel.
    #[error("Channel not open")]
    WrongChannel,

    /// Disconnected
    #[error("Disconnected")]
    Disconnect,

    /// Timed out waiting for the server.
    #[error("Connection timeout")]
    ConnectionTimeout,

    /// The transport stopped draining outbound messages.
    #[error("Channel send error")]
    SendError,

    /// The session reported an error.
    #[error("Session error: {0}")]
    Session(String),

    /// The protocol is in an inconsistent state.
    #[error("Inconsistent state of the protocol")]
    Inconsistent,

    #[error("Unknown message number {0}")]
    UnknownMessage(u8),

    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error("SshEncoding: {0}")]
    SshEncoding(#[from] ssh_encoding::Error),
}

/// The type of signals that can be sent to a remote process. If you
/// plan to use custom signals, read [the
/// RFC](https://tools.ietf.org/html/rfc4254#section-6.10) to
/// understand the encoding.
#[allow(missing_docs)]
// This should be relatively self-explanatory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sig {
    ABRT,
    ALRM,
    FPE,
    HUP,
    ILL,
    INT,
    KILL,
    PIPE,
    QUIT,
    SEGV,
    TERM,
    USR1,
    Custom(String),
}

impl Sig {
    pub fn name(&self) -> &str {
        match *self {
            Sig::ABRT => "ABRT",
            Sig::ALRM => "ALRM",
            Sig::FPE => "FPE",
            Sig::HUP => "HUP",
            Sig::ILL => "ILL",
            Sig::INT => "INT",
            Sig::KILL => "KILL",
            Sig::PIPE => "PIPE",
            Sig::QUIT => "QUIT",
            Sig::SEGV => "SEGV",
            Sig::TERM => "TERM",
            Sig::USR1 => "USR1",
            Sig::Custom(ref c) => c,
        }
    }

    pub fn from_name(name: &str) -> Sig {
        match name {
            "ABRT" => Sig::ABRT,
            "ALRM" => Sig::ALRM,
            "FPE" => Sig::FPE,
            "HUP" => Sig::HUP,
            "ILL" => Sig::ILL,
            "INT" => Sig::INT,
            "KILL" => Sig::KILL,
            "PIPE" => Sig::PIPE,
            "QUIT" => Sig::QUIT,
            "SEGV" => Sig::SEGV,
            "TERM" => Sig::TERM,
            "USR1" => Sig::USR1,
            x => Sig::Custom(x.to_string()),
        }
    }
}

/// Reason for not being able to open a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ChannelOpenFailure {
    AdministrativelyProhibited = 1,
    ConnectFailed = 2,
    UnknownChannelType = 3,
    ResourceShortage = 4,
    Unknown = 0,
}

impl ChannelOpenFailure {
    pub(crate) fn from_u32(x: u32) -> ChannelOpenFailure {
        match x {
            1 => ChannelOpenFailure::AdministrativelyProhibited,
            2 => ChannelOpenFailure::ConnectFailed,
            3 => ChannelOpenFailure::UnknownChannelType,
            4 => ChannelOpenFailure::ResourceShortage,
            _ => ChannelOpenFailure::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
/// The identifier of a channel.
pub struct ChannelId(pub(crate) u32);

impl From<ChannelId> for u32 {
    fn from(c: ChannelId) -> u32 {
        c.0
    }
}

impl From<u32> for ChannelId {
    fn from(c: u32) -> ChannelId {
        ChannelId(c)
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
