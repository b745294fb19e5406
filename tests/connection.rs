//! Connection scenarios against an in-process fake server: dialect
//! negotiation, demultiplexing, signing and encryption, failure fan-out.

use std::io::{Cursor, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use binrw::prelude::*;

use smb_conn::connection::preauth_hash::PreauthIntegrity;
use smb_conn::connection::transformer::{MessageEncryptor, MessageSigner};
use smb_conn::crypto::{make_encrypting_algo, make_signing_algo, SigningAlgorithm};
use smb_conn::packets::binrw_util::prelude::FileTime;
use smb_conn::packets::guid::Guid;
use smb_conn::packets::smb1::Smb1NegotiateMessage;
use smb_conn::packets::smb2::*;
use smb_conn::{Connection, ConnectionConfig, Error, Session};

// -- fake server plumbing ---------------------------------------------------

fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).unwrap();
    assert_eq!(prefix[0], 0);
    let length = u32::from_be_bytes([0, prefix[1], prefix[2], prefix[3]]) as usize;
    let mut content = vec![0u8; length];
    stream.read_exact(&mut content).unwrap();
    content
}

fn write_frame(stream: &mut TcpStream, content: &[u8]) {
    let length = (content.len() as u32).to_be_bytes();
    stream
        .write_all(&[0, length[1], length[2], length[3]])
        .unwrap();
    stream.write_all(content).unwrap();
}

fn response_header(command: Command, message_id: u64) -> Header {
    Header {
        credit_charge: 1,
        status: Status::U32_SUCCESS,
        command,
        credit_request: 1,
        flags: HeaderFlags::new().with_server_to_redir(true),
        next_command: 0,
        message_id,
        tree_id: Some(0),
        async_id: None,
        session_id: 0,
        signature: 0,
    }
}

/// Packs a negotiate response frame; body offsets are relative to the
/// header start, so both are written into one stream.
fn negotiate_response_frame(message_id: u64, response: &NegotiateResponse) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    response_header(Command::Negotiate, message_id)
        .write(&mut cursor)
        .unwrap();
    response.write(&mut cursor).unwrap();
    cursor.into_inner()
}

fn base_negotiate_response(dialect: NegotiateDialect) -> NegotiateResponse {
    NegotiateResponse {
        security_mode: NegotiateSecurityMode::new().with_signing_enabled(true),
        dialect_revision: dialect,
        server_guid: Guid::from([0xA5; 16]),
        capabilities: GlobalCapabilities::new(),
        max_transact_size: 0x800000,
        max_read_size: 0x800000,
        max_write_size: 0x800000,
        system_time: FileTime::from(133818609802776324),
        server_start_time: FileTime::default(),
        buffer: b"gss-negotiate-token".to_vec(),
        negotiate_context_list: None,
    }
}

/// Spawns a fake server for one connection and runs `script` over the
/// accepted socket. Returns the address to connect to and the script's
/// join handle.
fn server_with<F, R>(script: F) -> (ConnectionConfig, JoinHandle<R>)
where
    F: FnOnce(TcpStream) -> R + Send + 'static,
    R: Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        script(stream)
    });
    let config = ConnectionConfig {
        port: Some(port),
        ..Default::default()
    };
    (config, handle)
}

fn connect(config: ConnectionConfig) -> Connection {
    let mut connection = Connection::build(config).unwrap();
    connection.connect("127.0.0.1").unwrap();
    connection
}

/// Answers the SMB1 negotiate with the given response and returns the
/// parsed SMB1 message.
fn serve_smb1_negotiate(
    stream: &mut TcpStream,
    response: &NegotiateResponse,
) -> Smb1NegotiateMessage {
    let frame = read_frame(stream);
    assert_eq!(&frame[..4], b"\xffSMB");
    let message = Smb1NegotiateMessage::read(&mut Cursor::new(&frame)).unwrap();
    write_frame(stream, &negotiate_response_frame(0, response));
    message
}

/// Runs a pinned-2.0.2 negotiation on the server side (the SMB1 round is
/// answered directly, no wildcard round).
fn serve_pinned_202(stream: &mut TcpStream) {
    serve_smb1_negotiate(stream, &base_negotiate_response(NegotiateDialect::Smb0202));
}

/// Serves the wildcard SMB1 round plus the SMB2 negotiate, answering with
/// the given response. Returns the SMB2 negotiate request message.
fn serve_wildcard_negotiate(
    stream: &mut TcpStream,
    response: &NegotiateResponse,
) -> PlainMessage {
    serve_smb1_negotiate(
        stream,
        &base_negotiate_response(NegotiateDialect::Smb02Wildcard),
    );
    let request_frame = read_frame(stream);
    let request = PlainMessage::read(&mut Cursor::new(&request_frame)).unwrap();
    assert_eq!(request.header.command, Command::Negotiate);
    write_frame(
        stream,
        &negotiate_response_frame(request.header.message_id, response),
    );
    request
}

// -- scenarios --------------------------------------------------------------

#[test_log::test]
fn test_connect_pinned_202() {
    let (config, server) = server_with(|mut stream| {
        let smb1 = serve_smb1_negotiate(
            &mut stream,
            &base_negotiate_response(NegotiateDialect::Smb0202),
        );
        // Pinned to 2.0.2: the wildcard dialect string is absent.
        assert_eq!(smb1.negotiate.dialects.len(), 1);
        assert_eq!(smb1.negotiate.dialects[0].name.to_string(), "SMB 2.002");
    });

    let connection = connect(ConnectionConfig {
        dialect: Some(Dialect::Smb0202),
        ..config
    });

    {
        let info = connection.conn_info().unwrap();
        assert_eq!(info.negotiation.dialect, Dialect::Smb0202);
        assert_eq!(info.negotiation.supports_file_leasing, None);
        assert_eq!(info.negotiation.cipher_id, None);
        assert_eq!(info.negotiation.supports_encryption, None);
        assert_eq!(
            info.negotiation.gss_negotiate_token,
            b"gss-negotiate-token".to_vec()
        );
    }
    // No pre-auth integrity below 3.1.1.
    assert!(connection.preauth_hash().is_none());

    // Negotiation is one-shot: a connected connection cannot reconnect.
    let mut connection = connection;
    assert!(matches!(
        connection.connect("127.0.0.1"),
        Err(Error::InvalidState(_))
    ));

    connection.disconnect().unwrap();
    server.join().unwrap();
}

#[test_log::test]
fn test_311_server_with_no_common_cipher() {
    let (config, server) = server_with(|mut stream| {
        let mut response = base_negotiate_response(NegotiateDialect::Smb0311);
        response.negotiate_context_list = Some(vec![
            NegotiateContext::preauth_integrity(PreauthIntegrityCapabilities {
                hash_algorithms: vec![HashAlgorithm::Sha512],
                salt: vec![0x11; 32],
            }),
            // Cipher id 0: the server supports the context, but no cipher.
            NegotiateContext::encryption(EncryptionCapabilities {
                ciphers: vec![EncryptionCipher::None],
            }),
        ]);
        serve_wildcard_negotiate(&mut stream, &response);
    });

    let connection = connect(config);

    let info = connection.conn_info().unwrap();
    assert_eq!(info.negotiation.dialect, Dialect::Smb0311);
    assert_eq!(info.negotiation.cipher_id, Some(EncryptionCipher::None));
    assert_eq!(info.negotiation.supports_encryption, Some(false));

    connection.disconnect().unwrap();
    server.join().unwrap();
}

#[test_log::test]
fn test_connect_wildcard_to_311() {
    let server_salt = [0x5C; 32];
    let (config, server) = server_with(move |mut stream| {
        let smb1 = serve_smb1_negotiate(
            &mut stream,
            &base_negotiate_response(NegotiateDialect::Smb02Wildcard),
        );
        assert_eq!(smb1.negotiate.dialects.len(), 2);
        assert_eq!(smb1.negotiate.dialects[1].name.to_string(), "SMB 2.???");

        // The SMB2 negotiate arrives through the regular send path with
        // message id 1 (the SMB1 round consumed id 0).
        let request_frame = read_frame(&mut stream);
        let request_message = PlainMessage::read(&mut Cursor::new(&request_frame)).unwrap();
        assert_eq!(request_message.header.command, Command::Negotiate);
        assert_eq!(request_message.header.message_id, 1);

        let request: NegotiateRequest = decode_body(&request_frame).unwrap();
        assert_eq!(request.dialects, Dialect::ALL.to_vec());
        assert!(request.capabilities.encryption());
        assert_ne!(request.client_guid, Guid::default());

        let contexts = request.negotiate_context_list.as_ref().unwrap();
        assert_eq!(contexts.len(), 2);
        match &contexts[0].data {
            NegotiateContextValue::PreauthIntegrityCapabilities(caps) => {
                assert_eq!(caps.hash_algorithms, vec![HashAlgorithm::Sha512]);
                assert_eq!(caps.salt.len(), 32);
            }
            other => panic!("expected preauth context first, got {other:?}"),
        }
        match &contexts[1].data {
            NegotiateContextValue::EncryptionCapabilities(caps) => {
                assert_eq!(
                    caps.ciphers,
                    vec![EncryptionCipher::Aes128Gcm, EncryptionCipher::Aes128Ccm]
                );
            }
            other => panic!("expected encryption context second, got {other:?}"),
        }

        let mut response = base_negotiate_response(NegotiateDialect::Smb0311);
        response.capabilities = GlobalCapabilities::new()
            .with_leasing(true)
            .with_large_mtu(true)
            .with_directory_leasing(true)
            .with_multi_channel(true);
        response.negotiate_context_list = Some(vec![
            NegotiateContext::preauth_integrity(PreauthIntegrityCapabilities {
                hash_algorithms: vec![HashAlgorithm::Sha512],
                salt: server_salt.to_vec(),
            }),
            NegotiateContext::encryption(EncryptionCapabilities {
                ciphers: vec![EncryptionCipher::Aes128Gcm],
            }),
        ]);
        let response_frame = negotiate_response_frame(1, &response);
        write_frame(&mut stream, &response_frame);

        // The transcript binds exactly [request, response], in order.
        let mut expected = PreauthIntegrity::default();
        expected.record(&request_frame);
        expected.record(&response_frame);
        expected.hash()
    });

    let connection = connect(config);

    {
        let info = connection.conn_info().unwrap();
        assert_eq!(info.negotiation.dialect, Dialect::Smb0311);
        assert_eq!(info.negotiation.cipher_id, Some(EncryptionCipher::Aes128Gcm));
        assert_eq!(
            info.negotiation.preauth_integrity_hash_id,
            Some(HashAlgorithm::Sha512)
        );
        assert_eq!(info.negotiation.supports_encryption, Some(true));
        assert_eq!(info.negotiation.supports_file_leasing, Some(true));
        assert_eq!(info.negotiation.supports_multi_credit, Some(true));
        assert_eq!(info.negotiation.supports_directory_leasing, Some(true));
        assert_eq!(info.negotiation.supports_multi_channel, Some(true));
        assert_eq!(info.negotiation.supports_persistent_handles, Some(false));
    }

    let expected_hash = server.join().unwrap();
    assert_eq!(connection.preauth_hash().unwrap(), expected_hash);

    connection.disconnect().unwrap();
}

#[test_log::test]
fn test_out_of_order_responses() {
    let (config, server) = server_with(|mut stream| {
        serve_pinned_202(&mut stream);

        // Collect both requests, answer them in reverse order.
        let first = PlainMessage::read(&mut Cursor::new(&read_frame(&mut stream))).unwrap();
        let second = PlainMessage::read(&mut Cursor::new(&read_frame(&mut stream))).unwrap();
        assert!(first.header.message_id < second.header.message_id);

        for request in [second, first] {
            let response = PlainMessage {
                header: response_header(Command::Echo, request.header.message_id),
                data: request.data,
            };
            write_frame(&mut stream, &response.to_bytes().unwrap());
        }
    });

    let connection = connect(ConnectionConfig {
        dialect: Some(Dialect::Smb0202),
        ..config
    });

    let first = connection
        .send(Command::Echo, b"first request".to_vec(), None, None)
        .unwrap();
    let second = connection
        .send(Command::Echo, b"second request".to_vec(), None, None)
        .unwrap();
    assert!(first.message_id < second.message_id);

    // The first receive completes correctly even though its response
    // arrived last.
    let first_response = connection.receive(first.message_id).unwrap();
    assert_eq!(first_response.message.data, b"first request".to_vec());
    let second_response = connection.receive(second.message_id).unwrap();
    assert_eq!(second_response.message.data, b"second request".to_vec());

    assert_eq!(connection.outstanding_request_count(), 0);
    connection.disconnect().unwrap();
    server.join().unwrap();
}

#[test_log::test]
fn test_pending_then_success() {
    let (config, server) = server_with(|mut stream| {
        serve_pinned_202(&mut stream);

        let request = PlainMessage::read(&mut Cursor::new(&read_frame(&mut stream))).unwrap();

        // Interim response: STATUS_PENDING, async header.
        let pending = PlainMessage {
            header: Header {
                status: Status::U32_PENDING,
                flags: HeaderFlags::new()
                    .with_server_to_redir(true)
                    .with_async_command(true),
                tree_id: None,
                async_id: Some(0x1234),
                ..response_header(Command::Echo, request.header.message_id)
            },
            data: vec![0; 8],
        };
        write_frame(&mut stream, &pending.to_bytes().unwrap());

        let done = PlainMessage {
            header: response_header(Command::Echo, request.header.message_id),
            data: request.data,
        };
        write_frame(&mut stream, &done.to_bytes().unwrap());
    });

    let connection = connect(ConnectionConfig {
        dialect: Some(Dialect::Smb0202),
        ..config
    });

    let header = connection
        .send(Command::Echo, b"slow operation".to_vec(), None, None)
        .unwrap();

    // The pending interim never surfaces; the terminal success does.
    let response = connection.receive(header.message_id).unwrap();
    assert_eq!(response.message.header.status, Status::U32_SUCCESS);
    assert_eq!(response.message.data, b"slow operation".to_vec());

    // The request is gone: success is returned exactly once.
    assert_eq!(connection.outstanding_request_count(), 0);
    assert!(matches!(
        connection.receive(header.message_id),
        Err(Error::InvalidState(_))
    ));

    connection.disconnect().unwrap();
    server.join().unwrap();
}

#[test_log::test]
fn test_concurrent_sends_reach_the_wire_in_id_order() {
    const SENDERS: usize = 8;

    let (config, server) = server_with(|mut stream| {
        serve_pinned_202(&mut stream);

        let mut observed = Vec::new();
        let mut requests = Vec::new();
        for _ in 0..SENDERS {
            let request = PlainMessage::read(&mut Cursor::new(&read_frame(&mut stream))).unwrap();
            observed.push(request.header.message_id);
            requests.push(request);
        }
        for request in requests {
            let response = PlainMessage {
                header: response_header(Command::Echo, request.header.message_id),
                data: request.data,
            };
            write_frame(&mut stream, &response.to_bytes().unwrap());
        }
        observed
    });

    let connection = Arc::new(connect(ConnectionConfig {
        dialect: Some(Dialect::Smb0202),
        ..config
    }));

    let mut workers = Vec::new();
    for i in 0..SENDERS {
        let connection = connection.clone();
        workers.push(std::thread::spawn(move || {
            let header = connection
                .send(Command::Echo, vec![i as u8; 16], None, None)
                .unwrap();
            let response = connection.receive(header.message_id).unwrap();
            assert_eq!(response.message.data, vec![i as u8; 16]);
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    // Ids hit the transport strictly increasing, without gaps (the SMB1
    // round consumed id 0).
    let observed = server.join().unwrap();
    assert_eq!(observed, (1..=SENDERS as u64).collect::<Vec<_>>());
    assert_eq!(connection.outstanding_request_count(), 0);
    connection.disconnect().unwrap();
}

#[test_log::test]
fn test_signed_echo_roundtrip() {
    const SIGNING_KEY: [u8; 16] = [0x7E; 16];
    const SESSION_ID: u64 = 0x0000300024000055;

    let (config, server) = server_with(|mut stream| {
        serve_wildcard_negotiate(
            &mut stream,
            &base_negotiate_response(NegotiateDialect::Smb0302),
        );

        // The echo request must carry a valid AES-CMAC signature over the
        // frame with the signature field zeroed.
        let frame = read_frame(&mut stream);
        let request = PlainMessage::read(&mut Cursor::new(&frame)).unwrap();
        assert!(request.header.flags.signed());
        assert_eq!(request.header.session_id, SESSION_ID);
        let mut zeroed = frame.clone();
        zeroed[48..64].fill(0);
        let mut mac = make_signing_algo(SigningAlgorithm::AesCmac, &SIGNING_KEY).unwrap();
        mac.update(&zeroed);
        assert_eq!(mac.finalize(), request.header.signature);

        // Sign the response the same way; the client verifies it.
        let mut response = PlainMessage {
            header: Header {
                session_id: SESSION_ID,
                flags: HeaderFlags::new()
                    .with_server_to_redir(true)
                    .with_signed(true),
                ..response_header(Command::Echo, request.header.message_id)
            },
            data: request.data,
        };
        let mut response_bytes = response.to_bytes().unwrap();
        let mut signer = MessageSigner::new(
            make_signing_algo(SigningAlgorithm::AesCmac, &SIGNING_KEY).unwrap(),
        );
        signer
            .sign_message(&mut response.header, &mut response_bytes)
            .unwrap();
        write_frame(&mut stream, &response_bytes);
    });

    let connection = connect(ConnectionConfig {
        dialect: Some(Dialect::Smb0302),
        ..config
    });

    let session = Arc::new(Session::new(SESSION_ID, SIGNING_KEY, true));
    connection.session_started(session.clone()).unwrap();

    let header = connection
        .send(Command::Echo, vec![0xEC; 64], Some(&session), None)
        .unwrap();
    let response = connection.receive(header.message_id).unwrap();
    assert!(response.form.signed);
    assert!(!response.form.encrypted);
    assert_eq!(response.message.data, vec![0xEC; 64]);

    connection.disconnect().unwrap();
    server.join().unwrap();
}

#[test_log::test]
fn test_encrypted_echo_roundtrip() {
    const SIGNING_KEY: [u8; 16] = [0x7E; 16];
    const C2S_KEY: [u8; 16] = [0xC2; 16];
    const S2C_KEY: [u8; 16] = [0x2C; 16];
    const SESSION_ID: u64 = 0x0000300024000055;

    let (config, server) = server_with(|mut stream| {
        let mut response = base_negotiate_response(NegotiateDialect::Smb030);
        response.capabilities = GlobalCapabilities::new().with_encryption(true);
        serve_wildcard_negotiate(&mut stream, &response);

        // The echo request arrives wrapped in a transform header: CCM on
        // 3.0.x, 11 effective nonce bytes, the tag in the signature field.
        let frame = read_frame(&mut stream);
        assert_eq!(&frame[..4], b"\xfdSMB");
        let encrypted = EncryptedMessage::read(&mut Cursor::new(&frame)).unwrap();
        assert_eq!(encrypted.header.session_id, SESSION_ID);
        assert_eq!(&encrypted.header.nonce[11..], &[0u8; 5]);

        let mut plaintext = encrypted.encrypted_message.clone();
        let mut cipher = make_encrypting_algo(EncryptionCipher::Aes128Ccm, &C2S_KEY).unwrap();
        cipher
            .decrypt(
                &mut plaintext,
                &encrypted.header.aead_bytes(),
                &encrypted.header.nonce,
                encrypted.header.signature,
            )
            .unwrap();
        assert_eq!(encrypted.header.original_message_size as usize, plaintext.len());

        let request = PlainMessage::read(&mut Cursor::new(&plaintext)).unwrap();
        assert_eq!(request.header.command, Command::Echo);
        // Encrypted, not signed.
        assert!(!request.header.flags.signed());

        // Encrypt the response with the server-to-client key.
        let response = PlainMessage {
            header: Header {
                session_id: SESSION_ID,
                ..response_header(Command::Echo, request.header.message_id)
            },
            data: request.data,
        };
        let mut encryptor = MessageEncryptor::new(
            make_encrypting_algo(EncryptionCipher::Aes128Ccm, &S2C_KEY).unwrap(),
        );
        let wrapped = encryptor
            .encrypt_message(response.to_bytes().unwrap(), SESSION_ID)
            .unwrap();
        let mut cursor = Cursor::new(Vec::new());
        wrapped.write(&mut cursor).unwrap();
        write_frame(&mut stream, &cursor.into_inner());
    });

    let connection = connect(ConnectionConfig {
        dialect: Some(Dialect::Smb030),
        ..config
    });
    assert_eq!(
        connection.conn_info().unwrap().negotiation.supports_encryption,
        Some(true)
    );

    let session = Arc::new(
        Session::new(SESSION_ID, SIGNING_KEY, true).with_encryption(C2S_KEY, S2C_KEY),
    );
    connection.session_started(session.clone()).unwrap();

    let header = connection
        .send(Command::Echo, vec![0xE0; 48], Some(&session), None)
        .unwrap();
    let response = connection.receive(header.message_id).unwrap();
    assert!(response.form.encrypted);
    assert_eq!(response.message.data, vec![0xE0; 48]);

    connection.disconnect().unwrap();
    server.join().unwrap();
}

#[test_log::test]
fn test_receive_timeout_leaves_request_routable() {
    let (config, server) = server_with(|mut stream| {
        serve_pinned_202(&mut stream);

        let request = PlainMessage::read(&mut Cursor::new(&read_frame(&mut stream))).unwrap();
        std::thread::sleep(Duration::from_millis(400));
        let response = PlainMessage {
            header: response_header(Command::Echo, request.header.message_id),
            data: request.data,
        };
        write_frame(&mut stream, &response.to_bytes().unwrap());
    });

    let connection = connect(ConnectionConfig {
        dialect: Some(Dialect::Smb0202),
        timeout: Some(Duration::from_millis(250)),
        ..config
    });

    let header = connection
        .send(Command::Echo, b"slow".to_vec(), None, None)
        .unwrap();
    assert!(matches!(
        connection.receive(header.message_id),
        Err(Error::OperationTimeout(_, _))
    ));
    // The request survived the timeout; the late response completes it.
    let response = connection.receive(header.message_id).unwrap();
    assert_eq!(response.message.data, b"slow".to_vec());

    connection.disconnect().unwrap();
    server.join().unwrap();
}

#[test_log::test]
fn test_server_error_status_surfaces_and_completes_request() {
    let (config, server) = server_with(|mut stream| {
        serve_pinned_202(&mut stream);

        let request = PlainMessage::read(&mut Cursor::new(&read_frame(&mut stream))).unwrap();
        let response = PlainMessage {
            header: Header {
                status: Status::AccessDenied as u32,
                ..response_header(Command::Echo, request.header.message_id)
            },
            data: vec![],
        };
        write_frame(&mut stream, &response.to_bytes().unwrap());
    });

    let connection = connect(ConnectionConfig {
        dialect: Some(Dialect::Smb0202),
        ..config
    });

    let header = connection
        .send(Command::Echo, b"denied".to_vec(), None, None)
        .unwrap();
    match connection.receive(header.message_id).unwrap_err() {
        Error::ServerError {
            message_id,
            status,
            header: response_header,
        } => {
            assert_eq!(message_id, header.message_id);
            assert_eq!(status, Status::AccessDenied as u32);
            assert_eq!(response_header.command, Command::Echo);
        }
        other => panic!("expected a server error, got {other:?}"),
    }
    // A terminal error removes the request from the table too.
    assert_eq!(connection.outstanding_request_count(), 0);

    connection.disconnect().unwrap();
    server.join().unwrap();
}

#[test_log::test]
fn test_unknown_message_id_poisons_connection() {
    let (config, server) = server_with(|mut stream| {
        serve_pinned_202(&mut stream);

        let request = PlainMessage::read(&mut Cursor::new(&read_frame(&mut stream))).unwrap();
        // Respond under an id nobody asked for.
        let response = PlainMessage {
            header: response_header(Command::Echo, request.header.message_id + 100),
            data: vec![],
        };
        write_frame(&mut stream, &response.to_bytes().unwrap());
    });

    let connection = connect(ConnectionConfig {
        dialect: Some(Dialect::Smb0202),
        ..config
    });

    let header = connection
        .send(Command::Echo, b"who answers".to_vec(), None, None)
        .unwrap();
    assert!(matches!(
        connection.receive(header.message_id),
        Err(Error::ConnectionFailed(_))
    ));

    // The failure is latched for every later receive as well.
    assert!(matches!(
        connection.receive(header.message_id),
        Err(Error::ConnectionFailed(_))
    ));

    server.join().unwrap();
}
