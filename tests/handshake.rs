//! Handshake trust policy and connection result tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use secure_transport::{ConnectionResult, Role, SecureConfiguration, SecureConnection, TlsProtocol};
use tokio::net::TcpListener;

mod common;
use common::{client_configuration, dial, eventually, server_configuration, start_container, FrameEngine, Pki};

#[tokio::test]
async fn untrusted_allowed_accepts_self_signed_server() {
    let pki = Pki::new();
    let (engine, _frames) = FrameEngine::new();
    let (container, addr) = start_container(server_configuration(&pki.self_signed("server.pem")), engine).await;

    let client = Arc::new(client_configuration());
    assert!(client.allow_untrusted_certificates);

    // Name mismatch is ignored as well.
    let mut mismatched = client_configuration();
    mismatched.target_host = "elsewhere.test".to_string();
    let mismatched = Arc::new(mismatched);

    let (first, _) = dial(addr, &client).await.unwrap();
    let (second, _) = dial(addr, &mismatched).await.unwrap();
    assert!(first.is_alive());
    assert_eq!(first.role(), Role::Client);
    assert!(second.is_alive());
    assert!(eventually(|| container.count() == 2).await);
}

#[tokio::test]
async fn untrusted_rejected_without_trust_anchor() {
    let pki = Pki::new();
    let (engine, _frames) = FrameEngine::new();
    let (container, addr) = start_container(server_configuration(&pki.self_signed("server.pem")), engine).await;

    let mut client = client_configuration();
    client.allow_untrusted_certificates = false;
    let result = dial(addr, &Arc::new(client)).await;

    assert_eq!(ConnectionResult::of(&result), ConnectionResult::CertificateError);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(container.count(), 0);
}

#[tokio::test]
async fn trusted_ca_accepts_matching_name_only() {
    let pki = Pki::new();
    let (engine, _frames) = FrameEngine::new();
    let (container, addr) = start_container(server_configuration(&pki.server("server.pem")), engine).await;

    let mut trusted = client_configuration();
    trusted.allow_untrusted_certificates = false;
    trusted.add_trust_anchor(pki.ca_path()).unwrap();
    let (connection, _) = dial(addr, &Arc::new(trusted.clone())).await.unwrap();
    assert!(connection.is_alive());

    trusted.target_host = "elsewhere.test".to_string();
    let result = dial(addr, &Arc::new(trusted)).await;
    assert_eq!(ConnectionResult::of(&result), ConnectionResult::CertificateError);

    assert!(eventually(|| container.count() == 1).await);
}

#[tokio::test]
async fn protocol_mismatch_is_reported() {
    let pki = Pki::new();
    let mut server = server_configuration(&pki.server("server.pem"));
    server.protocol = TlsProtocol::Tls13;
    let (engine, _frames) = FrameEngine::new();
    let (container, addr) = start_container(server, engine).await;

    let mut client = client_configuration();
    client.protocol = TlsProtocol::Tls12;
    let result = dial(addr, &Arc::new(client)).await;

    assert_eq!(ConnectionResult::of(&result), ConnectionResult::ProtocolMismatch);
    assert_eq!(container.count(), 0);
}

#[tokio::test]
async fn handshake_timeout_is_reported() {
    // Accepts TCP but never speaks TLS.
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = silent.local_addr().unwrap();
    let _holder = tokio::spawn(async move {
        let (_socket, _) = silent.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
    });

    let mut client = client_configuration();
    client.handshake_timeout = Duration::from_millis(200);
    let result = dial(addr, &Arc::new(client)).await;

    assert_eq!(ConnectionResult::of(&result), ConnectionResult::HandshakeTimeout);
}

#[tokio::test]
async fn tcp_connect_is_bounded_by_handshake_timeout() {
    let mut client = client_configuration();
    client.handshake_timeout = Duration::from_millis(200);
    let (engine, _frames) = FrameEngine::new();

    // Non-routable: the SYN is either dropped or refused, never answered.
    let started = Instant::now();
    let result = SecureConnection::connect("10.255.255.1", 4433, Arc::new(client), engine).await;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(matches!(
        ConnectionResult::of(&result),
        ConnectionResult::HandshakeTimeout | ConnectionResult::TcpConnectionNotAlive
    ));
}

#[tokio::test]
async fn pkcs12_server_credential_completes_handshake() {
    let pki = Pki::new();
    let mut server = SecureConfiguration::create(Role::Server);
    server
        .load_server_credential(pki.server_archive("certificate.pfx", "psw"), Some("psw"), false)
        .unwrap();
    assert!(server.server_credential().unwrap().subject().contains("localhost"));
    let (engine, _frames) = FrameEngine::new();
    let (container, addr) = start_container(server, engine).await;

    let mut client = client_configuration();
    client.allow_untrusted_certificates = false;
    client.add_trust_anchor(pki.ca_path()).unwrap();
    let (connection, _) = dial(addr, &Arc::new(client)).await.unwrap();
    assert!(connection.is_alive());
    assert!(eventually(|| container.count() == 1).await);
}

#[tokio::test]
async fn unreachable_peer_means_tcp_not_alive() {
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = unused.local_addr().unwrap();
    drop(unused);

    let result = dial(addr, &Arc::new(client_configuration())).await;
    assert_eq!(ConnectionResult::of(&result), ConnectionResult::TcpConnectionNotAlive);
}

#[tokio::test]
async fn client_configuration_errors_come_before_dialing() {
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = unused.local_addr().unwrap();
    drop(unused);

    let mut client = client_configuration();
    client.target_host = "not a host".to_string();
    let result = dial(addr, &Arc::new(client)).await;
    assert_eq!(ConnectionResult::of(&result), ConnectionResult::ConfigurationError);
}

#[tokio::test]
async fn server_without_credential_drops_every_socket() {
    let (engine, _frames) = FrameEngine::new();
    let (container, addr) = start_container(SecureConfiguration::create(Role::Server), engine).await;

    let result = dial(addr, &Arc::new(client_configuration())).await;
    assert!(result.is_err());
    assert_ne!(ConnectionResult::of(&result), ConnectionResult::Connected);
    assert_eq!(container.count(), 0);
}

#[tokio::test]
async fn required_client_certificate_is_enforced() {
    let pki = Pki::new();
    let mut server = server_configuration(&pki.server("server.pem"));
    server.add_trust_anchor(pki.ca_path()).unwrap();
    server.require_client_certificate = true;
    let (engine, _frames) = FrameEngine::new();
    let (container, addr) = start_container(server, engine).await;

    let anonymous = dial(addr, &Arc::new(client_configuration())).await;
    assert!(anonymous.is_err());

    let mut client = client_configuration();
    client
        .load_client_credential(pki.client("client.pem", 20), None, false)
        .unwrap();
    assert!(!client.public_key_hint().is_empty());
    let (connection, _) = dial(addr, &Arc::new(client)).await.unwrap();
    assert!(connection.is_alive());

    assert!(eventually(|| container.count() == 1).await);
}

#[tokio::test]
async fn revoked_client_certificate_is_rejected_when_checking() {
    let pki = Pki::new();
    let server_credential = pki.server("server.pem");
    let revoked = pki.client("revoked.pem", 42);
    let crl = pki.revocation_list("ca.crl", &[42]);

    let mut client = client_configuration();
    client.load_client_credential(&revoked, None, false).unwrap();
    let client = Arc::new(client);

    let mut checking = server_configuration(&server_credential);
    checking.add_trust_anchor(pki.ca_path()).unwrap();
    checking.add_revocation_list(&crl).unwrap();
    checking.require_client_certificate = true;
    let (engine, _frames) = FrameEngine::new();
    let (checking_container, checking_addr) = start_container(checking.clone(), engine).await;

    assert!(dial(checking_addr, &client).await.is_err());
    assert_eq!(checking_container.count(), 0);

    checking.check_client_revocation = false;
    let (engine, _frames) = FrameEngine::new();
    let (lenient_container, lenient_addr) = start_container(checking, engine).await;

    let (connection, _) = dial(lenient_addr, &client).await.unwrap();
    assert!(connection.is_alive());
    assert!(eventually(|| lenient_container.count() == 1).await);
}
