//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rcgen::{
    date_time_ymd, BasicConstraints, CertificateParams, CertificateRevocationListParams, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyIdMethod, KeyPair, KeyUsagePurpose, RevocationReason,
    RevokedCertParams, SerialNumber,
};
use tempfile::TempDir;
use tokio::sync::mpsc;

use secure_transport::net::connection::ConnectionId;
use secure_transport::{
    Dispatch, Packet, PacketEngine, Role, SecureConfiguration, SecureConnection,
    SecureConnectionContainer, SecureReader, TransportError,
};

/// First payload byte that the test engine refuses to dispatch.
pub const UNROUTABLE: u8 = 0xFF;

/// A test PKI: one CA plus leaves and revocation lists written to a temp dir.
pub struct Pki {
    dir: TempDir,
    ca: rcgen::Certificate,
    ca_key: KeyPair,
}

impl Pki {
    pub fn new() -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, "Secure Transport Test CA");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca_key = KeyPair::generate().unwrap();
        let ca = params.self_signed(&ca_key).unwrap();
        Self {
            dir: TempDir::new().unwrap(),
            ca,
            ca_key,
        }
    }

    /// PEM file holding the CA certificate.
    pub fn ca_path(&self) -> PathBuf {
        let path = self.dir.path().join("ca.pem");
        std::fs::write(&path, self.ca.pem()).unwrap();
        path
    }

    /// Server bundle for `localhost`, issued by the CA.
    pub fn server(&self, file: &str) -> PathBuf {
        self.leaf(file, "localhost", 1, ExtendedKeyUsagePurpose::ServerAuth)
    }

    /// Client bundle issued by the CA with the given serial.
    pub fn client(&self, file: &str, serial: u64) -> PathBuf {
        self.leaf(file, "client", serial, ExtendedKeyUsagePurpose::ClientAuth)
    }

    /// Server credential for `localhost` as a PKCS#12 archive protected by `password`.
    pub fn server_archive(&self, file: &str, password: &str) -> PathBuf {
        let (certificate, key) = self.issue("localhost", 2, ExtendedKeyUsagePurpose::ServerAuth);
        let chain = p12_keystore::PrivateKeyChain::new(
            key.serialize_der(),
            [7u8; 8],
            [
                p12_keystore::Certificate::from_der(certificate.der()).unwrap(),
                p12_keystore::Certificate::from_der(self.ca.der()).unwrap(),
            ],
        );
        let mut store = p12_keystore::KeyStore::new();
        store.add_entry("localhost", p12_keystore::KeyStoreEntry::PrivateKeyChain(chain));
        let archive = store.writer(password).write().unwrap();

        let path = self.dir.path().join(file);
        std::fs::write(&path, archive).unwrap();
        path
    }

    fn leaf(&self, file: &str, name: &str, serial: u64, usage: ExtendedKeyUsagePurpose) -> PathBuf {
        let (certificate, key) = self.issue(name, serial, usage);
        let path = self.dir.path().join(file);
        std::fs::write(&path, format!("{}{}", certificate.pem(), key.serialize_pem())).unwrap();
        path
    }

    fn issue(&self, name: &str, serial: u64, usage: ExtendedKeyUsagePurpose) -> (rcgen::Certificate, KeyPair) {
        let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        params.serial_number = Some(SerialNumber::from(serial));
        params.extended_key_usages = vec![usage];
        let key = KeyPair::generate().unwrap();
        let certificate = params.signed_by(&key, &self.ca, &self.ca_key).unwrap();
        (certificate, key)
    }

    /// Self-signed `localhost` bundle, trusted by nobody.
    pub fn self_signed(&self, file: &str) -> PathBuf {
        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, "localhost");
        let key = KeyPair::generate().unwrap();
        let certificate = params.self_signed(&key).unwrap();

        let path = self.dir.path().join(file);
        std::fs::write(&path, format!("{}{}", certificate.pem(), key.serialize_pem())).unwrap();
        path
    }

    /// CRL signed by the CA revoking `serials`.
    pub fn revocation_list(&self, file: &str, serials: &[u64]) -> PathBuf {
        let params = CertificateRevocationListParams {
            this_update: date_time_ymd(2024, 1, 1),
            next_update: date_time_ymd(2099, 1, 1),
            crl_number: SerialNumber::from(1u64),
            issuing_distribution_point: None,
            revoked_certs: serials
                .iter()
                .map(|serial| RevokedCertParams {
                    serial_number: SerialNumber::from(*serial),
                    revocation_time: date_time_ymd(2024, 1, 1),
                    reason_code: Some(RevocationReason::KeyCompromise),
                    invalidity_date: None,
                })
                .collect(),
            key_identifier_method: KeyIdMethod::Sha256,
        };
        let crl = params.signed_by(&self.ca, &self.ca_key).unwrap();

        let path = self.dir.path().join(file);
        std::fs::write(&path, crl.pem().unwrap()).unwrap();
        path
    }
}

/// A length-prefixed frame: u32 big-endian length, then payload.
pub struct Frame(pub Vec<u8>);

impl Packet for Frame {
    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = (self.0.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(&self.0);
        bytes
    }
}

/// Packet engine reading [`Frame`]s and forwarding their payloads to a channel.
///
/// A payload starting with [`UNROUTABLE`] is reported as unknown.
pub struct FrameEngine {
    frames: mpsc::UnboundedSender<(ConnectionId, Vec<u8>)>,
}

impl FrameEngine {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(ConnectionId, Vec<u8>)>) {
        let (frames, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { frames }), rx)
    }
}

#[async_trait]
impl PacketEngine for FrameEngine {
    async fn receive(
        &self,
        connection: &SecureConnection,
        reader: &mut SecureReader,
    ) -> Result<Dispatch, TransportError> {
        let header = reader.read_bytes(4).await?;
        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let payload = reader.read_bytes(length).await?;
        if payload.first() == Some(&UNROUTABLE) {
            return Ok(Dispatch::Unknown);
        }
        let _ = self.frames.send((connection.id(), payload));
        Ok(Dispatch::Handled)
    }
}

pub fn localhost() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

/// Server configuration presenting the bundle at `credential`.
pub fn server_configuration(credential: &PathBuf) -> SecureConfiguration {
    let mut configuration = SecureConfiguration::create(Role::Server);
    configuration
        .load_server_credential(credential, None, false)
        .unwrap();
    configuration.read_timeout = Duration::from_secs(30);
    configuration
}

/// Client configuration with short timeouts and no trust material.
pub fn client_configuration() -> SecureConfiguration {
    let mut configuration = SecureConfiguration::create(Role::Client);
    configuration.read_timeout = Duration::from_secs(30);
    configuration.handshake_timeout = Duration::from_secs(5);
    configuration
}

/// Start a container on an ephemeral localhost port.
pub async fn start_container(
    configuration: SecureConfiguration,
    engine: Arc<dyn PacketEngine>,
) -> (SecureConnectionContainer, SocketAddr) {
    let container =
        SecureConnectionContainer::create(localhost(), 0, Arc::new(configuration), engine, true)
            .await
            .unwrap();
    let addr = container.local_addr().unwrap();
    (container, addr)
}

/// Dial `addr` with `configuration`, using a fresh client-side engine.
pub async fn dial(
    addr: SocketAddr,
    configuration: &Arc<SecureConfiguration>,
) -> Result<
    (SecureConnection, mpsc::UnboundedReceiver<(ConnectionId, Vec<u8>)>),
    secure_transport::ConnectError,
> {
    let (engine, frames) = FrameEngine::new();
    let connection =
        SecureConnection::connect("127.0.0.1", addr.port(), Arc::clone(configuration), engine)
            .await?;
    Ok((connection, frames))
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Await `future` with a five second limit.
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}
