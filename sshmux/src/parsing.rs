use bytes::Bytes;
use ssh_encoding::{Decode, Encode};

use crate::{msg, ChannelId, ChannelOpenFailure, Error, Sig};

/// Terminal mode opcode ending the encoded mode list.
const TTY_OP_END: u8 = 0;

/// A connection-protocol message, as carried in the payload of one
/// SSH packet. See
/// [RFC4254](https://tools.ietf.org/html/rfc4254#section-5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Open {
        typ: ChannelType,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    },
    OpenConfirmation {
        recipient_channel: u32,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    },
    OpenFailure {
        recipient_channel: u32,
        reason: ChannelOpenFailure,
        description: String,
        language_tag: String,
    },
    WindowAdjust {
        recipient_channel: u32,
        bytes_to_add: u32,
    },
    Data {
        recipient_channel: u32,
        data: Bytes,
    },
    ExtendedData {
        recipient_channel: u32,
        data_type_code: u32,
        data: Bytes,
    },
    Eof {
        recipient_channel: u32,
    },
    Close {
        recipient_channel: u32,
    },
    Request {
        recipient_channel: u32,
        want_reply: bool,
        request: ChannelRequest,
    },
    Success {
        recipient_channel: u32,
    },
    Failure {
        recipient_channel: u32,
    },
    GlobalRequest {
        want_reply: bool,
        request: GlobalRequest,
    },
    RequestSuccess {
        data: Bytes,
    },
    RequestFailure,
}

/// Channel type and type-specific data of a CHANNEL_OPEN message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelType {
    Session,
    X11 {
        originator_address: String,
        originator_port: u32,
    },
    DirectTcpip(TcpChannelInfo),
    ForwardedTcpip(TcpChannelInfo),
    Unknown {
        typ: String,
    },
}

/// For `direct-tcpip` the host/port fields are the target to connect
/// to; for `forwarded-tcpip` they are the address that was connected
/// on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpChannelInfo {
    pub host_to_connect: String,
    pub port_to_connect: u32,
    pub originator_address: String,
    pub originator_port: u32,
}

/// Channel-specific requests, see
/// [RFC4254](https://tools.ietf.org/html/rfc4254#section-6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequest {
    Pty {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        terminal_modes: Vec<(u8, u32)>,
    },
    X11 {
        single_connection: bool,
        x11_authentication_protocol: String,
        x11_authentication_cookie: String,
        x11_screen_number: u32,
    },
    Env {
        variable_name: String,
        variable_value: String,
    },
    Shell,
    Exec {
        command: Vec<u8>,
    },
    Subsystem {
        name: String,
    },
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    XonXoff {
        client_can_do: bool,
    },
    Signal {
        signal: Sig,
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
    AgentForward,
    Unknown {
        name: String,
        data: Bytes,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalRequest {
    TcpipForward { address: String, port: u32 },
    CancelTcpipForward { address: String, port: u32 },
    Unknown { name: String, data: Bytes },
}

impl ChannelMessage {
    /// The channel this message is addressed to, for messages that
    /// concern an existing channel.
    pub fn recipient(&self) -> Option<ChannelId> {
        match *self {
            ChannelMessage::OpenConfirmation {
                recipient_channel, ..
            }
            | ChannelMessage::OpenFailure {
                recipient_channel, ..
            }
            | ChannelMessage::WindowAdjust {
                recipient_channel, ..
            }
            | ChannelMessage::Data {
                recipient_channel, ..
            }
            | ChannelMessage::ExtendedData {
                recipient_channel, ..
            }
            | ChannelMessage::Eof { recipient_channel }
            | ChannelMessage::Close { recipient_channel }
            | ChannelMessage::Request {
                recipient_channel, ..
            }
            | ChannelMessage::Success { recipient_channel }
            | ChannelMessage::Failure { recipient_channel } => Some(ChannelId(recipient_channel)),
            ChannelMessage::Open { .. }
            | ChannelMessage::GlobalRequest { .. }
            | ChannelMessage::RequestSuccess { .. }
            | ChannelMessage::RequestFailure => None,
        }
    }

    /// Appends the message payload (message number included, packet
    /// framing excluded) to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), Error> {
        match self {
            ChannelMessage::Open {
                typ,
                sender_channel,
                initial_window_size,
                maximum_packet_size,
            } => {
                msg::CHANNEL_OPEN.encode(buf)?;
                typ.name().encode(buf)?;
                sender_channel.encode(buf)?;
                initial_window_size.encode(buf)?;
                maximum_packet_size.encode(buf)?;
                typ.encode_info(buf)?;
            }
            ChannelMessage::OpenConfirmation {
                recipient_channel,
                sender_channel,
                initial_window_size,
                maximum_packet_size,
            } => {
                msg::CHANNEL_OPEN_CONFIRMATION.encode(buf)?;
                recipient_channel.encode(buf)?;
                sender_channel.encode(buf)?;
                initial_window_size.encode(buf)?;
                maximum_packet_size.encode(buf)?;
            }
            ChannelMessage::OpenFailure {
                recipient_channel,
                reason,
                description,
                language_tag,
            } => {
                msg::CHANNEL_OPEN_FAILURE.encode(buf)?;
                recipient_channel.encode(buf)?;
                (*reason as u32).encode(buf)?;
                description.encode(buf)?;
                language_tag.encode(buf)?;
            }
            ChannelMessage::WindowAdjust {
                recipient_channel,
                bytes_to_add,
            } => {
                msg::CHANNEL_WINDOW_ADJUST.encode(buf)?;
                recipient_channel.encode(buf)?;
                bytes_to_add.encode(buf)?;
            }
            ChannelMessage::Data {
                recipient_channel,
                data,
            } => {
                msg::CHANNEL_DATA.encode(buf)?;
                recipient_channel.encode(buf)?;
                data.as_ref().encode(buf)?;
            }
            ChannelMessage::ExtendedData {
                recipient_channel,
                data_type_code,
                data,
            } => {
                msg::CHANNEL_EXTENDED_DATA.encode(buf)?;
                recipient_channel.encode(buf)?;
                data_type_code.encode(buf)?;
                data.as_ref().encode(buf)?;
            }
            ChannelMessage::Eof { recipient_channel } => {
                msg::CHANNEL_EOF.encode(buf)?;
                recipient_channel.encode(buf)?;
            }
            ChannelMessage::Close { recipient_channel } => {
                msg::CHANNEL_CLOSE.encode(buf)?;
                recipient_channel.encode(buf)?;
            }
            ChannelMessage::Request {
                recipient_channel,
                want_reply,
                request,
            } => {
                msg::CHANNEL_REQUEST.encode(buf)?;
                recipient_channel.encode(buf)?;
                request.name().encode(buf)?;
                (*want_reply as u8).encode(buf)?;
                request.encode_data(buf)?;
            }
            ChannelMessage::Success { recipient_channel } => {
                msg::CHANNEL_SUCCESS.encode(buf)?;
                recipient_channel.encode(buf)?;
            }
            ChannelMessage::Failure { recipient_channel } => {
                msg::CHANNEL_FAILURE.encode(buf)?;
                recipient_channel.encode(buf)?;
            }
            ChannelMessage::GlobalRequest {
                want_reply,
                request,
            } => {
                msg::GLOBAL_REQUEST.encode(buf)?;
                request.name().encode(buf)?;
                (*want_reply as u8).encode(buf)?;
                match request {
                    GlobalRequest::TcpipForward { address, port }
                    | GlobalRequest::CancelTcpipForward { address, port } => {
                        address.encode(buf)?;
                        port.encode(buf)?;
                    }
                    GlobalRequest::Unknown { data, .. } => buf.extend_from_slice(data),
                }
            }
            ChannelMessage::RequestSuccess { data } => {
                msg::REQUEST_SUCCESS.encode(buf)?;
                buf.extend_from_slice(data);
            }
            ChannelMessage::RequestFailure => {
                msg::REQUEST_FAILURE.encode(buf)?;
            }
        }
        Ok(())
    }

    /// Parses one message payload, starting with its message number.
    pub fn parse(mut r: &[u8]) -> Result<Self, Error> {
        let r = &mut r;
        let number = u8::decode(r)?;
        Ok(match number {
            msg::CHANNEL_OPEN => {
                let typ = String::decode(r)?;
                let sender_channel = u32::decode(r)?;
                let initial_window_size = u32::decode(r)?;
                let maximum_packet_size = u32::decode(r)?;
                ChannelMessage::Open {
                    typ: ChannelType::parse_info(&typ, r)?,
                    sender_channel,
                    initial_window_size,
                    maximum_packet_size,
                }
            }
            msg::CHANNEL_OPEN_CONFIRMATION => ChannelMessage::OpenConfirmation {
                recipient_channel: u32::decode(r)?,
                sender_channel: u32::decode(r)?,
                initial_window_size: u32::decode(r)?,
                maximum_packet_size: u32::decode(r)?,
            },
            msg::CHANNEL_OPEN_FAILURE => {
                let recipient_channel = u32::decode(r)?;
                let reason = ChannelOpenFailure::from_u32(u32::decode(r)?);
                // Some servers omit the description and language tag.
                let description = if r.is_empty() {
                    String::new()
                } else {
                    String::decode(r)?
                };
                let language_tag = if r.is_empty() {
                    String::new()
                } else {
                    String::decode(r)?
                };
                ChannelMessage::OpenFailure {
                    recipient_channel,
                    reason,
                    description,
                    language_tag,
                }
            }
            msg::CHANNEL_WINDOW_ADJUST => ChannelMessage::WindowAdjust {
                recipient_channel: u32::decode(r)?,
                bytes_to_add: u32::decode(r)?,
            },
            msg::CHANNEL_DATA => ChannelMessage::Data {
                recipient_channel: u32::decode(r)?,
                data: Vec::<u8>::decode(r)?.into(),
            },
            msg::CHANNEL_EXTENDED_DATA => ChannelMessage::ExtendedData {
                recipient_channel: u32::decode(r)?,
                data_type_code: u32::decode(r)?,
                data: Vec::<u8>::decode(r)?.into(),
            },
            msg::CHANNEL_EOF => ChannelMessage::Eof {
                recipient_channel: u32::decode(r)?,
            },
            msg::CHANNEL_CLOSE => ChannelMessage::Close {
                recipient_channel: u32::decode(r)?,
            },
            msg::CHANNEL_REQUEST => {
                let recipient_channel = u32::decode(r)?;
                let name = String::decode(r)?;
                let want_reply = u8::decode(r)? != 0;
                ChannelMessage::Request {
                    recipient_channel,
                    want_reply,
                    request: ChannelRequest::parse_data(name, r)?,
                }
            }
            msg::CHANNEL_SUCCESS => ChannelMessage::Success {
                recipient_channel: u32::decode(r)?,
            },
            msg::CHANNEL_FAILURE => ChannelMessage::Failure {
                recipient_channel: u32::decode(r)?,
            },
            msg::GLOBAL_REQUEST => {
                let name = String::decode(r)?;
                let want_reply = u8::decode(r)? != 0;
                let request = match name.as_str() {
                    "tcpip-forward" => GlobalRequest::TcpipForward {
                        address: String::decode(r)?,
                        port: u32::decode(r)?,
                    },
                    "cancel-tcpip-forward" => GlobalRequest::CancelTcpipForward {
                        address: String::decode(r)?,
                        port: u32::decode(r)?,
                    },
                    _ => GlobalRequest::Unknown {
                        name,
                        data: Bytes::copy_from_slice(r),
                    },
                };
                ChannelMessage::GlobalRequest {
                    want_reply,
                    request,
                }
            }
            msg::REQUEST_SUCCESS => ChannelMessage::RequestSuccess {
                data: Bytes::copy_from_slice(r),
            },
            msg::REQUEST_FAILURE => ChannelMessage::RequestFailure,
            n => return Err(Error::UnknownMessage(n)),
        })
    }
}

impl ChannelType {
    pub fn name(&self) -> &str {
        match self {
            ChannelType::Session => "session",
            ChannelType::X11 { .. } => "x11",
            ChannelType::DirectTcpip(_) => "direct-tcpip",
            ChannelType::ForwardedTcpip(_) => "forwarded-tcpip",
            ChannelType::Unknown { typ } => typ,
        }
    }

    fn encode_info(&self, buf: &mut Vec<u8>) -> Result<(), Error> {
        match self {
            ChannelType::Session | ChannelType::Unknown { .. } => {}
            ChannelType::X11 {
                originator_address,
                originator_port,
            } => {
                originator_address.encode(buf)?;
                originator_port.encode(buf)?;
            }
            ChannelType::DirectTcpip(info) | ChannelType::ForwardedTcpip(info) => {
                info.host_to_connect.encode(buf)?;
                info.port_to_connect.encode(buf)?;
                info.originator_address.encode(buf)?;
                info.originator_port.encode(buf)?;
            }
        }
        Ok(())
    }

    fn parse_info(typ: &str, r: &mut &[u8]) -> Result<Self, Error> {
        Ok(match typ {
            "session" => ChannelType::Session,
            "x11" => ChannelType::X11 {
                originator_address: String::decode(r)?,
                originator_port: u32::decode(r)?,
            },
            "direct-tcpip" => ChannelType::DirectTcpip(TcpChannelInfo::parse(r)?),
            "forwarded-tcpip" => ChannelType::ForwardedTcpip(TcpChannelInfo::parse(r)?),
            t => ChannelType::Unknown { typ: t.to_string() },
        })
    }
}

impl TcpChannelInfo {
    fn parse(r: &mut &[u8]) -> Result<Self, Error> {
        Ok(Self {
            host_to_connect: String::decode(r)?,
            port_to_connect: u32::decode(r)?,
            originator_address: String::decode(r)?,
            originator_port: u32::decode(r)?,
        })
    }
}

impl ChannelRequest {
    /// The request type string sent on the wire.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequest::Pty { .. } => "pty-req",
            ChannelRequest::X11 { .. } => "x11-req",
            ChannelRequest::Env { .. } => "env",
            ChannelRequest::Shell => "shell",
            ChannelRequest::Exec { .. } => "exec",
            ChannelRequest::Subsystem { .. } => "subsystem",
            ChannelRequest::WindowChange { .. } => "window-change",
            ChannelRequest::XonXoff { .. } => "xon-xoff",
            ChannelRequest::Signal { .. } => "signal",
            ChannelRequest::ExitStatus { .. } => "exit-status",
            ChannelRequest::ExitSignal { .. } => "exit-signal",
            ChannelRequest::AgentForward => "auth-agent-req@openssh.com",
            ChannelRequest::Unknown { name, .. } => name,
        }
    }

    fn encode_data(&self, buf: &mut Vec<u8>) -> Result<(), Error> {
        match self {
            ChannelRequest::Pty {
                term,
                col_width,
                row_height,
                pix_width,
                pix_height,
                terminal_modes,
            } => {
                term.encode(buf)?;
                col_width.encode(buf)?;
                row_height.encode(buf)?;
                pix_width.encode(buf)?;
                pix_height.encode(buf)?;
                let mut modes = Vec::with_capacity(terminal_modes.len() * 5 + 1);
                for (code, value) in terminal_modes {
                    if *code == TTY_OP_END || *code >= 160 {
                        continue;
                    }
                    code.encode(&mut modes)?;
                    value.encode(&mut modes)?;
                }
                TTY_OP_END.encode(&mut modes)?;
                modes.encode(buf)?;
            }
            ChannelRequest::X11 {
                single_connection,
                x11_authentication_protocol,
                x11_authentication_cookie,
                x11_screen_number,
            } => {
                (*single_connection as u8).encode(buf)?;
                x11_authentication_protocol.encode(buf)?;
                x11_authentication_cookie.encode(buf)?;
                x11_screen_number.encode(buf)?;
            }
            ChannelRequest::Env {
                variable_name,
                variable_value,
            } => {
                variable_name.encode(buf)?;
                variable_value.encode(buf)?;
            }
            ChannelRequest::Shell | ChannelRequest::AgentForward => {}
            ChannelRequest::Exec { command } => command.encode(buf)?,
            ChannelRequest::Subsystem { name } => name.encode(buf)?,
            ChannelRequest::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            } => {
                col_width.encode(buf)?;
                row_height.encode(buf)?;
                pix_width.encode(buf)?;
                pix_height.encode(buf)?;
            }
            ChannelRequest::XonXoff { client_can_do } => (*client_can_do as u8).encode(buf)?,
            ChannelRequest::Signal { signal } => signal.name().encode(buf)?,
            ChannelRequest::ExitStatus { exit_status } => exit_status.encode(buf)?,
            ChannelRequest::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                lang_tag,
            } => {
                signal_name.name().encode(buf)?;
                (*core_dumped as u8).encode(buf)?;
                error_message.encode(buf)?;
                lang_tag.encode(buf)?;
            }
            ChannelRequest::Unknown { data, .. } => buf.extend_from_slice(data),
        }
        Ok(())
    }

    fn parse_data(name: String, r: &mut &[u8]) -> Result<Self, Error> {
        Ok(match name.as_str() {
            "pty-req" => {
                let term = String::decode(r)?;
                let col_width = u32::decode(r)?;
                let row_height = u32::decode(r)?;
                let pix_width = u32::decode(r)?;
                let pix_height = u32::decode(r)?;
                let encoded = Vec::<u8>::decode(r)?;
                let mut modes = encoded.as_slice();
                let mut terminal_modes = Vec::new();
                while !modes.is_empty() {
                    let code = u8::decode(&mut modes)?;
                    if code == TTY_OP_END || code >= 160 {
                        break;
                    }
                    terminal_modes.push((code, u32::decode(&mut modes)?));
                }
                ChannelRequest::Pty {
                    term,
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                    terminal_modes,
                }
            }
            "x11-req" => ChannelRequest::X11 {
                single_connection: u8::decode(r)? != 0,
                x11_authentication_protocol: String::decode(r)?,
                x11_authentication_cookie: String::decode(r)?,
                x11_screen_number: u32::decode(r)?,
            },
            "env" => ChannelRequest::Env {
                variable_name: String::decode(r)?,
                variable_value: String::decode(r)?,
            },
            "shell" => ChannelRequest::Shell,
            "exec" => ChannelRequest::Exec {
                command: Vec::<u8>::decode(r)?,
            },
            "subsystem" => ChannelRequest::Subsystem {
                name: String::decode(r)?,
            },
            "window-change" => ChannelRequest::WindowChange {
                col_width: u32::decode(r)?,
                row_height: u32::decode(r)?,
                pix_width: u32::decode(r)?,
                pix_height: u32::decode(r)?,
            },
            "xon-xoff" => ChannelRequest::XonXoff {
                client_can_do: u8::decode(r)? != 0,
            },
            "signal" => ChannelRequest::Signal {
                signal: Sig::from_name(&String::decode(r)?),
            },
            "exit-status" => ChannelRequest::ExitStatus {
                exit_status: u32::decode(r)?,
            },
            "exit-signal" => ChannelRequest::ExitSignal {
                signal_name: Sig::from_name(&String::decode(r)?),
                core_dumped: u8::decode(r)? != 0,
                error_message: String::decode(r)?,
                lang_tag: String::decode(r)?,
            },
            "auth-agent-req@openssh.com" => ChannelRequest::AgentForward,
            _ => ChannelRequest::Unknown {
                data: Bytes::copy_from_slice(r),
                name,
            },
        })
    }
}

impl GlobalRequest {
    pub fn name(&self) -> &str {
        match self {
            GlobalRequest::TcpipForward { .. } => "tcpip-forward",
            GlobalRequest::CancelTcpipForward { .. } => "cancel-tcpip-forward",
            GlobalRequest::Unknown { name, .. } => name,
        }
    }
}
