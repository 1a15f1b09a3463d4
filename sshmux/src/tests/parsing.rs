use bytes::Bytes;

use crate::parsing::{ChannelMessage, ChannelRequest, ChannelType, GlobalRequest, TcpChannelInfo};
use crate::{ChannelOpenFailure, Error, Sig};

fn encode(msg: &ChannelMessage) -> Vec<u8> {
    let mut buf = Vec::new();
    msg.encode(&mut buf).unwrap();
    buf
}

#[test]
fn channel_data_layout() {
    let msg = ChannelMessage::Data {
        recipient_channel: 3,
        data: Bytes::from_static(b"hi"),
    };
    assert_eq!(encode(&msg), vec![94, 0, 0, 0, 3, 0, 0, 0, 2, b'h', b'i']);
}

#[test]
fn direct_tcpip_open_layout() {
    let msg = ChannelMessage::Open {
        typ: ChannelType::DirectTcpip(TcpChannelInfo {
            host_to_connect: "db".to_string(),
            port_to_connect: 5432,
            originator_address: "::1".to_string(),
            originator_port: 40000,
        }),
        sender_channel: 1,
        initial_window_size: 2097152,
        maximum_packet_size: 32768,
    };
    let buf = encode(&msg);
    let mut expected = vec![90, 0, 0, 0, 12];
    expected.extend_from_slice(b"direct-tcpip");
    expected.extend_from_slice(&[0, 0, 0, 1, 0, 0x20, 0, 0, 0, 0, 0x80, 0]);
    expected.extend_from_slice(&[0, 0, 0, 2, b'd', b'b', 0, 0, 0x15, 0x38]);
    expected.extend_from_slice(&[0, 0, 0, 3, b':', b':', b'1', 0, 0, 0x9c, 0x40]);
    assert_eq!(buf, expected);
    assert_eq!(ChannelMessage::parse(&buf).unwrap(), msg);
}

#[test]
fn open_failure_without_description() {
    let buf = [92, 0, 0, 0, 7, 0, 0, 0, 2];
    assert_eq!(
        ChannelMessage::parse(&buf).unwrap(),
        ChannelMessage::OpenFailure {
            recipient_channel: 7,
            reason: ChannelOpenFailure::ConnectFailed,
            description: String::new(),
            language_tag: String::new(),
        }
    );
}

#[test]
fn exit_signal_request() {
    let msg = ChannelMessage::Request {
        recipient_channel: 0,
        want_reply: false,
        request: ChannelRequest::ExitSignal {
            signal_name: Sig::Custom("WINCH".to_string()),
            core_dumped: true,
            error_message: "gone".to_string(),
            lang_tag: String::new(),
        },
    };
    assert_eq!(ChannelMessage::parse(&encode(&msg)).unwrap(), msg);
}

#[test]
fn pty_modes_skip_reserved_opcodes() {
    let msg = ChannelMessage::Request {
        recipient_channel: 0,
        want_reply: true,
        request: ChannelRequest::Pty {
            term: "vt100".to_string(),
            col_width: 80,
            row_height: 24,
            pix_width: 0,
            pix_height: 0,
            terminal_modes: vec![(0, 9), (53, 1), (200, 1)],
        },
    };
    let parsed = ChannelMessage::parse(&encode(&msg)).unwrap();
    match parsed {
        ChannelMessage::Request {
            request: ChannelRequest::Pty { terminal_modes, .. },
            ..
        } => assert_eq!(terminal_modes, vec![(53, 1)]),
        m => panic!("unexpected {:?}", m),
    }
}

#[test]
fn unknown_requests_keep_their_payload() {
    let mut buf = vec![98, 0, 0, 0, 1, 0, 0, 0, 5];
    buf.extend_from_slice(b"hello");
    buf.push(1);
    buf.extend_from_slice(&[1, 2, 3]);
    assert_eq!(
        ChannelMessage::parse(&buf).unwrap(),
        ChannelMessage::Request {
            recipient_channel: 1,
            want_reply: true,
            request: ChannelRequest::Unknown {
                name: "hello".to_string(),
                data: Bytes::from_static(&[1, 2, 3]),
            },
        }
    );
}

#[test]
fn tcpip_forward_reply_carries_port() {
    let msg = ChannelMessage::GlobalRequest {
        want_reply: true,
        request: GlobalRequest::TcpipForward {
            address: "0.0.0.0".to_string(),
            port: 0,
        },
    };
    assert_eq!(ChannelMessage::parse(&encode(&msg)).unwrap(), msg);
    assert_eq!(
        ChannelMessage::parse(&[81, 0, 0, 0x1f, 0x90]).unwrap(),
        ChannelMessage::RequestSuccess {
            data: Bytes::from_static(&[0, 0, 0x1f, 0x90]),
        }
    );
}

#[test]
fn malformed_payloads_are_errors() {
    assert!(matches!(
        ChannelMessage::parse(&[42, 0]),
        Err(Error::UnknownMessage(42))
    ));
    assert!(matches!(
        ChannelMessage::parse(&[93, 0, 0]),
        Err(Error::SshEncoding(_))
    ));
    assert!(ChannelMessage::parse(&[]).is_err());
}

#[test]
fn booleans_are_single_bytes() {
    let msg = ChannelMessage::Request {
        recipient_channel: 2,
        want_reply: true,
        request: ChannelRequest::XonXoff {
            client_can_do: false,
        },
    };
    let buf = encode(&msg);
    let mut expected = vec![98, 0, 0, 0, 2, 0, 0, 0, 8];
    expected.extend_from_slice(b"xon-xoff");
    expected.extend_from_slice(&[1, 0]);
    assert_eq!(buf, expected);
    assert_eq!(ChannelMessage::parse(&buf).unwrap(), msg);
}
