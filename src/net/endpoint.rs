// Replica calls between processes run over QUIC, one bidirectional stream per
// call. The caller writes `varint(len) | endpoint | frame` and finishes its
// side; the host answers with `u16 status (big endian) | body` and finishes.
// Connections are kept per host and reopened when they die.

use std::{
    io::{BufReader, Cursor},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use byteorder::{BigEndian, ByteOrder};
use futures::future::{BoxFuture, FutureExt};
use hashbrown::HashMap;
use quinn::{Connection, ReadToEndError};
use rustls::{Certificate, PrivateKey, RootCertStore};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, warn, Instrument};

use super::{
    error::TransportError,
    transport::{Reply, ReplicaService, ReplicaTransport},
    wire,
};
use crate::config::TransportConfig;
use crate::partition::Host;

/// Room for the status line and the endpoint name on top of a frame.
const ENVELOPE_OVERHEAD: usize = 1024;

/// A certificate chain and its private key.
#[derive(Clone)]
pub struct TlsMaterial {
    pub chain: Vec<Certificate>,
    pub key: PrivateKey,
}

impl TlsMaterial {
    /// Loads a PEM certificate chain and a PKCS#8 or RSA private key.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TransportError> {
        let chain: Vec<Certificate> =
            rustls_pemfile::certs(&mut BufReader::new(Cursor::new(cert_pem)))?
                .into_iter()
                .map(Certificate)
                .collect();
        if chain.is_empty() {
            return Err(TransportError::Tls("no certificate in PEM".into()));
        }
        let mut keys =
            rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(Cursor::new(key_pem)))?;
        if keys.is_empty() {
            keys = rustls_pemfile::rsa_private_keys(&mut BufReader::new(Cursor::new(key_pem)))?;
        }
        let key = keys
            .into_iter()
            .next()
            .map(PrivateKey)
            .ok_or_else(|| TransportError::Tls("no private key in PEM".into()))?;
        Ok(Self { chain, key })
    }

    /// A fresh self-signed certificate for the given names.
    pub fn self_signed(names: Vec<String>) -> Result<Self, TransportError> {
        let cert = rcgen::generate_simple_self_signed(names)
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        let der = cert
            .serialize_der()
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        Ok(Self {
            chain: vec![Certificate(der)],
            key: PrivateKey(cert.serialize_private_key_der()),
        })
    }

    /// A root store trusting this chain, for clusters on self-signed
    /// certificates.
    pub fn roots(&self) -> Result<RootCertStore, TransportError> {
        let mut roots = RootCertStore::empty();
        for cert in &self.chain {
            roots
                .add(cert)
                .map_err(|e| TransportError::Tls(e.to_string()))?;
        }
        Ok(roots)
    }
}

/// Shared by both sides: BBR congestion control and keep-alives so idle
/// cached connections survive NAT timeouts.
fn quic_transport_config() -> Arc<quinn::TransportConfig> {
    let mut transport_config = quinn::TransportConfig::default();
    let bbr_config = quinn::congestion::BbrConfig::default();
    transport_config.congestion_controller_factory(Arc::new(bbr_config));
    transport_config.keep_alive_interval(Some(Duration::from_secs(5)));
    Arc::new(transport_config)
}

pub fn encode_call(endpoint: &str, frame: &[u8]) -> Vec<u8> {
    let mut call = Vec::with_capacity(frame.len() + endpoint.len() + 4);
    wire::put_section(&mut call, endpoint.as_bytes());
    call.extend_from_slice(frame);
    call
}

pub fn decode_call(call: &[u8]) -> Result<(&str, &[u8]), wire::WireError> {
    let mut rest = call;
    let endpoint = wire::take_section(&mut rest)?;
    let endpoint = std::str::from_utf8(endpoint)
        .map_err(|_| wire::WireError::Malformed("endpoint is not utf-8"))?;
    Ok((endpoint, rest))
}

pub fn encode_reply(reply: &Reply) -> Vec<u8> {
    let mut bytes = vec![0; 2 + reply.body.len()];
    BigEndian::write_u16(&mut bytes[..2], reply.status);
    bytes[2..].copy_from_slice(&reply.body);
    bytes
}

pub fn decode_reply(mut bytes: Vec<u8>) -> Option<Reply> {
    if bytes.len() < 2 {
        return None;
    }
    let status = BigEndian::read_u16(&bytes[..2]);
    let body = bytes.split_off(2);
    Some(Reply { status, body })
}

/// Accepts replica calls and hands them to a service.
pub struct QuicServer {
    endpoint: quinn::Endpoint,
    acceptor: JoinHandle<()>,
}

impl QuicServer {
    /// Binds `addr` and serves until `cancel` fires.
    pub fn bind(
        addr: SocketAddr,
        tls: &TlsMaterial,
        service: Arc<dyn ReplicaService>,
        config: &TransportConfig,
        cancel: CancellationToken,
    ) -> Result<Self, TransportError> {
        let mut server_config =
            quinn::ServerConfig::with_single_cert(tls.chain.clone(), tls.key.clone())
                .map_err(|e| TransportError::Tls(e.to_string()))?;
        server_config.transport_config(quic_transport_config());
        let endpoint = quinn::Endpoint::server(server_config, addr)?;
        let acceptor = tokio::spawn(Self::accept(
            endpoint.clone(),
            service,
            config.max_frame_bytes + ENVELOPE_OVERHEAD,
            cancel,
        ));
        Ok(Self { endpoint, acceptor })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.endpoint.local_addr()?)
    }

    pub async fn shutdown(self) {
        self.endpoint.close(0u32.into(), b"shutdown");
        self.acceptor.abort();
        self.endpoint.wait_idle().await;
    }

    /// Accepts connections until the endpoint closes or `cancel` fires.
    async fn accept(
        endpoint: quinn::Endpoint,
        service: Arc<dyn ReplicaService>,
        max_call: usize,
        cancel: CancellationToken,
    ) {
        loop {
            let connecting = tokio::select! {
                _ = cancel.cancelled() => break,
                connecting = endpoint.accept() => match connecting {
                    Some(connecting) => connecting,
                    None => break,
                },
            };
            let service = service.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                match connecting.await {
                    Ok(connection) => {
                        let span = debug_span!("connection", remote = %connection.remote_address());
                        Self::serve(connection, service, max_call, cancel)
                            .instrument(span)
                            .await
                    }
                    Err(e) => debug!(error = %e, "handshake failed"),
                }
            });
        }
        endpoint.close(0u32.into(), b"shutdown");
    }

    /// One task per stream, so a slow query never holds up the next.
    async fn serve(
        connection: Connection,
        service: Arc<dyn ReplicaService>,
        max_call: usize,
        cancel: CancellationToken,
    ) {
        loop {
            let (mut send, mut recv) = tokio::select! {
                _ = cancel.cancelled() => break,
                stream = connection.accept_bi() => match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!(error = %e, "connection closed");
                        break;
                    }
                },
            };
            let service = service.clone();
            tokio::spawn(
                async move {
                    let reply = match recv.read_to_end(max_call).await {
                        Ok(call) => match decode_call(&call) {
                            Ok((endpoint, frame)) => {
                                service.handle(endpoint, frame.to_vec()).await
                            }
                            Err(e) => Reply::error(super::transport::status::BAD_REQUEST, e.to_string()),
                        },
                        Err(ReadToEndError::TooLong) => Reply::error(
                            super::transport::status::BAD_REQUEST,
                            "call exceeds the frame limit",
                        ),
                        Err(e) => {
                            debug!(error = %e, "could not read call");
                            return;
                        }
                    };
                    debug!(status = reply.status, bytes = reply.body.len(), "replying");
                    if let Err(e) = send.write_all(&encode_reply(&reply)).await {
                        debug!(error = %e, "could not write reply");
                        return;
                    }
                    if let Err(e) = send.finish().await {
                        debug!(error = %e, "could not finish reply");
                    }
                }
                .in_current_span(),
            );
        }
    }
}

/// Client side: one cached connection per host.
pub struct QuicTransport {
    endpoint: quinn::Endpoint,
    server_name: String,
    max_reply: usize,
    connections: RwLock<HashMap<Host, Connection>>,
}

impl QuicTransport {
    /// Binds an ephemeral local port; peers are verified against `roots`.
    pub fn new(roots: RootCertStore, config: &TransportConfig) -> Result<Self, TransportError> {
        let tls = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let mut client_config = quinn::ClientConfig::new(Arc::new(tls));
        client_config.transport_config(quic_transport_config());

        let unspecified = SocketAddr::from(([0, 0, 0, 0], 0));
        let mut endpoint = quinn::Endpoint::client(unspecified)?;
        endpoint.set_default_client_config(client_config);
        Ok(Self {
            endpoint,
            server_name: config.server_name.clone(),
            max_reply: config.max_frame_bytes + ENVELOPE_OVERHEAD,
            connections: RwLock::new(HashMap::new()),
        })
    }

    async fn connection(&self, host: &Host) -> Result<Connection, TransportError> {
        if let Some(connection) = self.connections.read().await.get(host) {
            if connection.close_reason().is_none() {
                return Ok(connection.clone());
            }
        }

        let addr = tokio::net::lookup_host((host.name.as_str(), host.port))
            .await?
            .next()
            .ok_or_else(|| TransportError::NoRoute {
                host: host.to_string(),
            })?;
        let connect_error = |e: &dyn std::fmt::Display| TransportError::Connect {
            host: host.to_string(),
            reason: e.to_string(),
        };
        let connection = self
            .endpoint
            .connect(addr, &self.server_name)
            .map_err(|e| connect_error(&e))?
            .await
            .map_err(|e| connect_error(&e))?;
        debug!(%host, %addr, "connected");
        self.connections
            .write()
            .await
            .insert(host.clone(), connection.clone());
        Ok(connection)
    }

    async fn forget(&self, host: &Host) {
        self.connections.write().await.remove(host);
    }

    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"closing");
    }
}

impl ReplicaTransport for QuicTransport {
    fn call<'a>(
        &'a self,
        host: &'a Host,
        endpoint: &'a str,
        frame: Vec<u8>,
    ) -> BoxFuture<'a, Result<Reply, TransportError>> {
        let span = debug_span!("quic_call", %host, endpoint);
        async move {
            let connection = self.connection(host).await?;
            let (mut send, mut recv) = match connection.open_bi().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "connection lost");
                    self.forget(host).await;
                    return Err(TransportError::ConnectionLost {
                        host: host.to_string(),
                        reason: e.to_string(),
                    });
                }
            };
            let stream_error = |e: &dyn std::fmt::Display| TransportError::Stream {
                host: host.to_string(),
                reason: e.to_string(),
            };
            send.write_all(&encode_call(endpoint, &frame))
                .await
                .map_err(|e| stream_error(&e))?;
            send.finish().await.map_err(|e| stream_error(&e))?;

            let bytes = match recv.read_to_end(self.max_reply).await {
                Ok(bytes) => bytes,
                Err(ReadToEndError::TooLong) => {
                    return Err(TransportError::TooLarge {
                        size: self.max_reply,
                    })
                }
                Err(e) => return Err(stream_error(&e)),
            };
            decode_reply(bytes).ok_or_else(|| TransportError::NoStatus {
                host: host.to_string(),
            })
        }
        .instrument(span)
        .boxed()
    }
}
