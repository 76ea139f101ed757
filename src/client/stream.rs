//! Production connector: an XMPP client stream over TCP + TLS.
//!
//! Per login, one task resolves the server, connects (STARTTLS or direct
//! TLS), optionally registers the account, authenticates, binds a resource
//! and then shuttles stanzas between the socket and the session until either
//! side ends.

use super::dns::{resolve_endpoints, ConnectionMode, XmppEndpoint};
use super::framing::{next_fragment, Fragment};
use super::{BoundJid, ClientCommand, ClientEnd, ClientEvent, ClientHandle, Connector};
use crate::credentials::{Credentials, SaslMechanism};
use crate::error::ClientError;
use crate::jid::Jid;
use crate::stanza::Element;
use base64::prelude::*;
use socket2::{SockRef, TcpKeepalive};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

const NS_TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
const NS_BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
const NS_SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
const NS_REGISTER: &str = "jabber:iq:register";

/// STARTTLS negotiation has its own deadline on top of the TCP connect timeout.
const STARTTLS_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for bytes buffered while waiting for a stanza to complete.
///
/// A server that never closes an element would otherwise grow the buffer
/// without limit. Legitimate stanzas (vCard avatars, MAM pages) stay far below.
const MAX_STANZA_BUFFER_SIZE: usize = 1_024 * 1_024;

type TlsStream = tokio_rustls::client::TlsStream<TcpStream>;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// TCP keep-alive probe interval.
    pub keepalive: Duration,
    pub connect_timeout: Duration,
    /// Skip TLS certificate verification. Development only.
    pub insecure_tls: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(15),
            insecure_tls: false,
        }
    }
}

/// Connector that opens real XMPP client streams.
#[derive(Debug, Clone, Default)]
pub struct StreamConnector {
    options: ClientOptions,
}

impl StreamConnector {
    pub fn new(options: ClientOptions) -> Self {
        init_crypto_provider();
        if options.insecure_tls {
            warn!("TLS certificate verification DISABLED (--dangerous-insecure-tls)");
        }
        Self { options }
    }
}

impl Connector for StreamConnector {
    fn connect(&mut self, credentials: Credentials) -> ClientHandle {
        let (handle, end) = ClientHandle::pair();
        tokio::spawn(run_client(credentials, self.options.clone(), end));
        handle
    }
}

/// Initialize the rustls crypto provider once per process.
fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Accepts every server certificate. Only reachable through `insecure_tls`.
#[derive(Debug)]
struct InsecureCertVerifier(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn create_tls_connector(insecure: bool) -> Result<TlsConnector, ClientError> {
    if insecure {
        let provider = rustls::crypto::ring::default_provider();
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier(Arc::new(provider))))
            .with_no_client_auth();
        return Ok(TlsConnector::from(Arc::new(config)));
    }

    let native_certs = rustls_native_certs::load_native_certs();
    if native_certs.certs.is_empty() {
        return Err(ClientError::Tls(
            "No system root certificates found; install CA certificates".to_string(),
        ));
    }
    let mut root_store = RootCertStore::empty();
    for cert in native_certs.certs {
        root_store
            .add(cert)
            .map_err(|e| ClientError::Tls(format!("Failed to add cert: {}", e)))?;
    }
    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

async fn upgrade_to_tls(tcp: TcpStream, tls_name: &str, insecure: bool) -> Result<TlsStream, ClientError> {
    let connector = create_tls_connector(insecure)?;
    let server_name = ServerName::try_from(tls_name.to_string())
        .map_err(|e| ClientError::Tls(format!("Invalid server name {}: {}", tls_name, e)))?;
    connector.connect(server_name, tcp).await.map_err(|e| {
        error!(tls_name, error = %e, "TLS handshake failed");
        ClientError::Tls(format!("TLS handshake failed with {}: {}", tls_name, e))
    })
}

/// Keep-alive probes replace an idle read timeout: a dead peer is detected by
/// the kernel, a quiet one is left alone.
fn enable_keepalive(tcp: &TcpStream, interval: Duration) {
    let keepalive = TcpKeepalive::new().with_time(interval).with_interval(interval);
    if let Err(e) = SockRef::from(tcp).set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "Failed to enable TCP keep-alive");
    }
}

/// XML stream on top of any byte transport.
struct XmppStream<S> {
    io: S,
    buffer: Vec<u8>,
    domain: String,
}

impl<S: AsyncRead + AsyncWrite + Unpin> XmppStream<S> {
    fn new(io: S, domain: &str) -> Self {
        Self {
            io,
            buffer: Vec::new(),
            domain: domain.to_string(),
        }
    }

    fn into_inner(self) -> S {
        self.io
    }

    async fn write_str(&mut self, data: &str) -> Result<(), ClientError> {
        self.io.write_all(data.as_bytes()).await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn send(&mut self, stanza: &Element) -> Result<(), ClientError> {
        debug!(stanza = %stanza, "Sending stanza");
        self.write_str(&stanza.to_string()).await
    }

    async fn read_fragment(&mut self) -> Result<Fragment, ClientError> {
        let mut read_buf = [0u8; 8192];
        loop {
            let parsed = next_fragment(&self.buffer).map_err(|e| ClientError::Stream {
                condition: "not-well-formed".to_string(),
                text: Some(e.to_string()),
            })?;
            if let Some((fragment, consumed)) = parsed {
                self.buffer.drain(..consumed);
                return Ok(fragment);
            }
            if self.buffer.len() > MAX_STANZA_BUFFER_SIZE {
                return Err(ClientError::Stream {
                    condition: "policy-violation".to_string(),
                    text: Some(format!("Incomplete stanza exceeds {} bytes", MAX_STANZA_BUFFER_SIZE)),
                });
            }
            let n = self.io.read(&mut read_buf).await?;
            if n == 0 {
                return Err(ClientError::Closed("server closed the connection".to_string()));
            }
            self.buffer.extend_from_slice(&read_buf[..n]);
        }
    }

    /// Next stanza. A stream error or the closing tag ends the stream.
    async fn next_element(&mut self) -> Result<Element, ClientError> {
        loop {
            match self.read_fragment().await? {
                Fragment::StreamOpen(_) => debug!("Ignoring repeated stream header"),
                Fragment::StreamClose => {
                    return Err(ClientError::Closed("server closed the stream".to_string()))
                }
                Fragment::Stanza(xml) => {
                    let element = Element::parse(&xml).map_err(|e| ClientError::Stream {
                        condition: "not-well-formed".to_string(),
                        text: Some(e.to_string()),
                    })?;
                    if element.name() == "stream:error" {
                        return Err(stream_error(&element));
                    }
                    return Ok(element);
                }
            }
        }
    }

    /// Open (or restart) the stream and return the server's features.
    async fn open(&mut self) -> Result<Element, ClientError> {
        let header = format!(
            "<?xml version='1.0'?><stream:stream to='{}' version='1.0' xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>",
            self.domain
        );
        self.write_str(&header).await?;
        loop {
            match self.read_fragment().await? {
                Fragment::StreamOpen(_) => break,
                Fragment::StreamClose => {
                    return Err(ClientError::Closed("server closed the stream".to_string()))
                }
                Fragment::Stanza(xml) => debug!(stanza = %xml, "Ignoring data before stream header"),
            }
        }
        let features = self.next_element().await?;
        if features.local_name() != "features" {
            return Err(ClientError::Unexpected {
                stage: "stream features",
                stanza: features,
            });
        }
        Ok(features)
    }

    async fn close(&mut self) {
        if let Err(e) = self.write_str("</stream:stream>").await {
            debug!(error = %e, "Failed to send stream close");
        }
        let _ = self.io.shutdown().await;
    }
}

fn stream_error(element: &Element) -> ClientError {
    let condition = element
        .children()
        .find(|c| c.local_name() != "text")
        .map(|c| c.local_name().to_string())
        .unwrap_or_else(|| "undefined-condition".to_string());
    ClientError::Stream {
        condition,
        text: element.child_text("text"),
    }
}

/// Defined condition of an `<error/>` child, e.g. `conflict`.
fn stanza_error_condition(stanza: &Element) -> String {
    stanza
        .get_child("error", None)
        .and_then(|e| e.children().find(|c| c.local_name() != "text"))
        .map(|c| c.local_name().to_string())
        .unwrap_or_else(|| "undefined-condition".to_string())
}

async fn starttls(tcp: TcpStream, tls_name: &str, insecure: bool) -> Result<TlsStream, ClientError> {
    let mut stream = XmppStream::new(tcp, tls_name);
    let features = stream.open().await?;
    if features.get_child("starttls", Some(NS_TLS)).is_none() {
        return Err(ClientError::Tls(format!(
            "Server does not offer STARTTLS: {}",
            features
        )));
    }
    stream
        .send(&Element::new("starttls").with_attr("xmlns", NS_TLS))
        .await?;
    let reply = stream.next_element().await?;
    match reply.local_name() {
        "proceed" => {}
        "failure" => return Err(ClientError::Tls("Server rejected STARTTLS".to_string())),
        _ => {
            return Err(ClientError::Unexpected {
                stage: "starttls",
                stanza: reply,
            })
        }
    }
    debug!(tls_name, "STARTTLS: received <proceed/>, upgrading");
    upgrade_to_tls(stream.into_inner(), tls_name, insecure).await
}

async fn connect_endpoint(endpoint: &XmppEndpoint, options: &ClientOptions) -> Result<TlsStream, ClientError> {
    let addr = format!("{}:{}", endpoint.host, endpoint.port);
    let tcp = tokio::time::timeout(options.connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| {
            ClientError::Connect(format!(
                "TCP connect timed out after {}s to {}",
                options.connect_timeout.as_secs(),
                addr
            ))
        })?
        .map_err(|e| ClientError::Connect(format!("Failed to connect to {}: {}", addr, e)))?;
    enable_keepalive(&tcp, options.keepalive);

    match endpoint.mode {
        ConnectionMode::Tcp => {
            tokio::time::timeout(STARTTLS_TIMEOUT, starttls(tcp, endpoint.tls_name(), options.insecure_tls))
                .await
                .map_err(|_| {
                    ClientError::Tls(format!(
                        "STARTTLS timed out after {}s",
                        STARTTLS_TIMEOUT.as_secs()
                    ))
                })?
        }
        ConnectionMode::DirectTls => upgrade_to_tls(tcp, endpoint.tls_name(), options.insecure_tls).await,
    }
}

/// Try each endpoint in order; the last failure is reported.
async fn connect_any(endpoints: &[XmppEndpoint], options: &ClientOptions) -> Result<TlsStream, ClientError> {
    let mut last_error = ClientError::Connect("No server endpoints".to_string());
    for (index, endpoint) in endpoints.iter().enumerate() {
        match connect_endpoint(endpoint, options).await {
            Ok(stream) => {
                info!(host = %endpoint.host, port = endpoint.port, mode = ?endpoint.mode,
                    tls_name = endpoint.tls_name(), "Connected to XMPP server");
                return Ok(stream);
            }
            Err(err) => {
                warn!(attempt = index + 1, total = endpoints.len(), host = %endpoint.host,
                    port = endpoint.port, error = %err, "Endpoint failed");
                last_error = err;
            }
        }
    }
    Err(last_error)
}

/// In-band registration (XEP-0077) of `jid` before authenticating.
async fn register<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut XmppStream<S>,
    jid: &Jid,
    password: Option<&str>,
) -> Result<(), ClientError> {
    let query = Element::new("query")
        .with_attr("xmlns", NS_REGISTER)
        .with_child(Element::new("username").with_text(jid.local().unwrap_or_default()))
        .with_child(Element::new("password").with_text(password.unwrap_or_default()));
    stream
        .send(
            &Element::new("iq")
                .with_attr("type", "set")
                .with_attr("id", "reg_1")
                .with_child(query),
        )
        .await?;

    let reply = stream.next_element().await?;
    match (reply.name(), reply.attr("type")) {
        ("iq", Some("result")) => {
            info!(jid = %jid.to_bare(), "Account registered");
            Ok(())
        }
        ("iq", Some("error")) => Err(ClientError::Registration {
            condition: stanza_error_condition(&reply),
        }),
        _ => Err(ClientError::Unexpected {
            stage: "registration",
            stanza: reply,
        }),
    }
}

/// Single-step SASL with the preferred mechanism, PLAIN otherwise.
async fn authenticate<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut XmppStream<S>,
    features: &Element,
    credentials: &Credentials,
    jid: &Jid,
) -> Result<(), ClientError> {
    let offered: Vec<String> = features
        .get_child("mechanisms", Some(NS_SASL))
        .map(|m| m.children().map(|c| c.text().trim().to_string()).collect())
        .unwrap_or_default();
    let mechanism = credentials.preferred_mechanism.unwrap_or(SaslMechanism::Plain);
    if !offered.iter().any(|m| m == mechanism.as_str()) {
        return Err(ClientError::Auth {
            condition: "invalid-mechanism".to_string(),
            text: Some(format!(
                "{} not offered (server offers: {})",
                mechanism.as_str(),
                offered.join(", ")
            )),
        });
    }

    let initial_response = match mechanism {
        SaslMechanism::Plain => {
            let user = jid.local().ok_or_else(|| ClientError::Auth {
                condition: "not-authorized".to_string(),
                text: Some("PLAIN requires a local part".to_string()),
            })?;
            let password = credentials.password.as_deref().unwrap_or_default();
            BASE64_STANDARD.encode(format!("\0{}\0{}", user, password))
        }
        // Empty initial response (RFC 6120 §6.4.2)
        SaslMechanism::Anonymous => "=".to_string(),
    };
    stream
        .send(
            &Element::new("auth")
                .with_attr("xmlns", NS_SASL)
                .with_attr("mechanism", mechanism.as_str())
                .with_text(initial_response),
        )
        .await?;

    let reply = stream.next_element().await?;
    match reply.local_name() {
        "success" => {
            debug!(mechanism = mechanism.as_str(), "SASL authentication succeeded");
            Ok(())
        }
        "failure" => Err(ClientError::Auth {
            condition: reply
                .children()
                .find(|c| c.local_name() != "text")
                .map(|c| c.local_name().to_string())
                .unwrap_or_else(|| "not-authorized".to_string()),
            text: reply.child_text("text"),
        }),
        _ => Err(ClientError::Unexpected {
            stage: "authentication",
            stanza: reply,
        }),
    }
}

/// Wait for the iq answering `id`, skipping anything else the server sends.
async fn await_iq<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut XmppStream<S>,
    id: &str,
) -> Result<Element, ClientError> {
    loop {
        let reply = stream.next_element().await?;
        if reply.name() == "iq" && reply.id() == Some(id) {
            return Ok(reply);
        }
        debug!(stanza = %reply, "Skipping stanza while waiting for {}", id);
    }
}

async fn bind<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut XmppStream<S>,
    features: &Element,
    resource: Option<&str>,
) -> Result<BoundJid, ClientError> {
    if features.get_child("bind", Some(NS_BIND)).is_none() {
        return Err(ClientError::Bind(
            "Server does not offer resource binding".to_string(),
        ));
    }
    let mut request = Element::new("bind").with_attr("xmlns", NS_BIND);
    if let Some(resource) = resource {
        request.push_child(Element::new("resource").with_text(resource));
    }
    stream
        .send(
            &Element::new("iq")
                .with_attr("type", "set")
                .with_attr("id", "bind_1")
                .with_child(request),
        )
        .await?;

    let reply = await_iq(stream, "bind_1").await?;
    if reply.attr("type") == Some("error") {
        return Err(ClientError::Bind(stanza_error_condition(&reply)));
    }
    let jid: Jid = reply
        .get_child("bind", Some(NS_BIND))
        .and_then(|b| b.child_text("jid"))
        .ok_or_else(|| ClientError::Bind("Bind result without jid".to_string()))?
        .parse::<Jid>()
        .map_err(|e| ClientError::Bind(format!("{}", e)))?;

    // Legacy session establishment (RFC 3921), unless the server marks it optional.
    if let Some(session) = features.get_child("session", Some(NS_SESSION)) {
        if session.get_child("optional", None).is_none() {
            stream
                .send(
                    &Element::new("iq")
                        .with_attr("type", "set")
                        .with_attr("id", "sess_1")
                        .with_child(Element::new("session").with_attr("xmlns", NS_SESSION)),
                )
                .await?;
            let reply = await_iq(stream, "sess_1").await?;
            if reply.attr("type") == Some("error") {
                return Err(ClientError::Bind(stanza_error_condition(&reply)));
            }
        }
    }

    Ok(BoundJid {
        user: jid.local().unwrap_or_default().to_string(),
        domain: jid.domain().to_string(),
        resource: jid.resource().unwrap_or_default().to_string(),
    })
}

async fn establish(
    credentials: &Credentials,
    options: &ClientOptions,
) -> Result<(XmppStream<TlsStream>, BoundJid), ClientError> {
    let jid: Jid = credentials
        .jid
        .parse::<Jid>()
        .map_err(|e| ClientError::Connect(format!("{}", e)))?;
    let endpoints = resolve_endpoints(credentials.host.as_deref(), jid.domain()).await;
    let tls = connect_any(&endpoints, options).await?;

    let mut stream = XmppStream::new(tls, jid.domain());
    let features = stream.open().await?;
    if credentials.register {
        register(&mut stream, &jid, credentials.password.as_deref()).await?;
    }
    authenticate(&mut stream, &features, credentials, &jid).await?;
    let features = stream.open().await?;
    let bound = bind(&mut stream, &features, credentials.resource.as_deref()).await?;
    Ok((stream, bound))
}

/// Park outbound stanzas until the stream is up. Returns when the session
/// ends the client.
async fn hold_until_end(commands: &mut UnboundedReceiver<ClientCommand>, queued: &mut Vec<Element>) {
    while let Some(ClientCommand::Send(stanza)) = commands.recv().await {
        queued.push(stanza);
    }
}

async fn run_client(credentials: Credentials, options: ClientOptions, mut end: ClientEnd) {
    let mut queued = Vec::new();
    let setup = tokio::select! {
        result = establish(&credentials, &options) => Some(result),
        () = hold_until_end(&mut end.commands, &mut queued) => None,
    };
    let (mut stream, bound) = match setup {
        None => {
            info!(jid = %credentials.jid, "Client ended before the stream was established");
            return;
        }
        Some(Err(err)) => {
            warn!(jid = %credentials.jid, error = %err, "XMPP connection failed");
            end.emit(ClientEvent::Error(err));
            return;
        }
        Some(Ok(ready)) => ready,
    };

    if !end.emit(ClientEvent::Online(bound)) {
        stream.close().await;
        return;
    }
    for stanza in queued {
        if let Err(err) = stream.send(&stanza).await {
            end.emit(ClientEvent::Error(err));
            return;
        }
    }

    loop {
        tokio::select! {
            read = stream.next_element() => match read {
                Ok(stanza) => {
                    if !end.emit(ClientEvent::Stanza(stanza)) {
                        stream.close().await;
                        break;
                    }
                }
                Err(err) => {
                    end.emit(ClientEvent::Error(err));
                    break;
                }
            },
            command = end.commands.recv() => match command {
                Some(ClientCommand::Send(stanza)) => {
                    if let Err(err) = stream.send(&stanza).await {
                        end.emit(ClientEvent::Error(err));
                        break;
                    }
                }
                Some(ClientCommand::End) | None => {
                    stream.close().await;
                    debug!("Client stream closed");
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    const SERVER_HEADER: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' id='s1' from='example.com' version='1.0'>";

    fn credentials(jid: &str, password: Option<&str>, mechanism: Option<SaslMechanism>) -> Credentials {
        Credentials {
            jid: jid.to_string(),
            password: password.map(str::to_string),
            resource: Some("laptop".to_string()),
            host: None,
            preferred_mechanism: mechanism,
            register: false,
        }
    }

    /// Scripted server end: expects a stream header, then answers with `reply`.
    async fn serve_open(server: &mut XmppStream<DuplexStream>, features: &str) {
        assert!(matches!(server.read_fragment().await.unwrap(), Fragment::StreamOpen(_)));
        server
            .write_str(&format!("{}<stream:features>{}</stream:features>", SERVER_HEADER, features))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_plain_auth_and_bind() {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let server = tokio::spawn(async move {
            let mut server = XmppStream::new(server_io, "example.com");
            serve_open(
                &mut server,
                "<mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>SCRAM-SHA-1</mechanism><mechanism>PLAIN</mechanism></mechanisms>",
            )
            .await;
            let auth = server.next_element().await.unwrap();
            assert_eq!(auth.attr("mechanism"), Some("PLAIN"));
            let decoded = BASE64_STANDARD.decode(auth.text()).unwrap();
            assert_eq!(decoded, b"\0bob\0secret");
            server
                .write_str("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>")
                .await
                .unwrap();

            serve_open(&mut server, "<bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>").await;
            let iq = server.next_element().await.unwrap();
            let bind = iq.get_child("bind", Some(NS_BIND)).unwrap();
            assert_eq!(bind.child_text("resource").as_deref(), Some("laptop"));
            server
                .write_str(
                    "<iq type='result' id='bind_1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>bob@example.com/laptop</jid></bind></iq>",
                )
                .await
                .unwrap();
        });

        let creds = credentials("bob@example.com/laptop", Some("secret"), None);
        let jid: Jid = creds.jid.parse().unwrap();
        let mut stream = XmppStream::new(client_io, "example.com");
        let features = stream.open().await.unwrap();
        authenticate(&mut stream, &features, &creds, &jid).await.unwrap();
        let features = stream.open().await.unwrap();
        let bound = bind(&mut stream, &features, creds.resource.as_deref()).await.unwrap();
        assert_eq!(
            bound,
            BoundJid {
                user: "bob".to_string(),
                domain: "example.com".to_string(),
                resource: "laptop".to_string(),
            }
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_auth_failure_reports_condition() {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let server = tokio::spawn(async move {
            let mut server = XmppStream::new(server_io, "example.com");
            serve_open(
                &mut server,
                "<mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms>",
            )
            .await;
            server.next_element().await.unwrap();
            server
                .write_str("<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/><text>Bad password</text></failure>")
                .await
                .unwrap();
        });

        let creds = credentials("bob@example.com", Some("wrong"), None);
        let jid: Jid = creds.jid.parse().unwrap();
        let mut stream = XmppStream::new(client_io, "example.com");
        let features = stream.open().await.unwrap();
        match authenticate(&mut stream, &features, &creds, &jid).await {
            Err(ClientError::Auth { condition, text }) => {
                assert_eq!(condition, "not-authorized");
                assert_eq!(text.as_deref(), Some("Bad password"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_anonymous_requires_offered_mechanism() {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let server = tokio::spawn(async move {
            let mut server = XmppStream::new(server_io, "example.com");
            serve_open(
                &mut server,
                "<mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms>",
            )
            .await;
        });

        let creds = credentials("@example.com", None, Some(SaslMechanism::Anonymous));
        let jid: Jid = creds.jid.parse().unwrap();
        let mut stream = XmppStream::new(client_io, "example.com");
        let features = stream.open().await.unwrap();
        match authenticate(&mut stream, &features, &creds, &jid).await {
            Err(ClientError::Auth { condition, .. }) => assert_eq!(condition, "invalid-mechanism"),
            other => panic!("unexpected result: {:?}", other),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_registration_conflict() {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let server = tokio::spawn(async move {
            let mut server = XmppStream::new(server_io, "example.com");
            let iq = server.next_element().await.unwrap();
            let query = iq.get_child("query", Some(NS_REGISTER)).unwrap();
            assert_eq!(query.child_text("username").as_deref(), Some("bob"));
            server
                .write_str("<iq type='error' id='reg_1'><error type='cancel'><conflict xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>")
                .await
                .unwrap();
        });

        let jid: Jid = "bob@example.com".parse().unwrap();
        let mut stream = XmppStream::new(client_io, "example.com");
        let err = register(&mut stream, &jid, Some("x")).await.unwrap_err();
        assert!(err.is_registration_cancelled());
        assert_eq!(err.to_string(), "Registration error");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_error_ends_stream() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let mut server = XmppStream::new(server_io, "example.com");
        server
            .write_str("<message><body>hi</body></message><stream:error><conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>")
            .await
            .unwrap();

        let mut stream = XmppStream::new(client_io, "example.com");
        assert_eq!(stream.next_element().await.unwrap().name(), "message");
        match stream.next_element().await {
            Err(ClientError::Stream { condition, .. }) => assert_eq!(condition, "conflict"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_close_is_reported() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let mut server = XmppStream::new(server_io, "example.com");
        server.write_str("</stream:stream>").await.unwrap();

        let mut stream = XmppStream::new(client_io, "example.com");
        assert!(matches!(
            stream.next_element().await,
            Err(ClientError::Closed(_))
        ));
    }

    #[test]
    fn test_insecure_tls_connector_needs_no_roots() {
        init_crypto_provider();
        assert!(create_tls_connector(true).is_ok());
    }
}
