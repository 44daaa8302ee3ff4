//! SMTP relay sessions over rustls.
//!
//! A session is: TCP connect, TLS (implicit on 465, STARTTLS otherwise),
//! EHLO, AUTH, then any number of MAIL/RCPT/DATA transactions. Plaintext
//! submission is never used.

use std::fmt;
use std::fs::File;
use std::io::BufReader as StdBufReader;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rustls::pki_types::ServerName;
use secrecy::ExposeSecret;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use super::{LaneSettings, RelayConnection, RelayConnector, SendAck};
use crate::config::{TlsConfig, TlsMode, TlsVersion};
use crate::errors::{
    DeliveryError, DeliveryResult, EnhancedStatusCode, TransportError, TransportErrorKind, TransportResult,
};
use crate::message::Envelope;
use crate::registry::{Credentials, ProviderDescriptor, ProviderId};

/// A parsed server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpReply {
    /// Three-digit reply code.
    pub code: u16,
    /// Enhanced status code from the first line, if present.
    pub enhanced: Option<EnhancedStatusCode>,
    /// Reply text, one entry per line, without code or enhanced code.
    pub lines: Vec<String>,
}

impl SmtpReply {
    /// Parses the raw lines of a single (possibly multiline) reply.
    pub fn parse(lines: &[String]) -> TransportResult<Self> {
        let mut code = None;
        let mut enhanced = None;
        let mut text = Vec::with_capacity(lines.len());

        for (i, line) in lines.iter().enumerate() {
            let parsed = line
                .get(..3)
                .filter(|c| c.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|c| c.parse::<u16>().ok())
                .ok_or_else(|| {
                    TransportError::new(TransportErrorKind::Protocol, format!("malformed reply line {:?}", line))
                })?;

            match code {
                None => code = Some(parsed),
                Some(c) if c != parsed => {
                    return Err(TransportError::new(
                        TransportErrorKind::Protocol,
                        "inconsistent codes in multiline reply",
                    ))
                }
                Some(_) => {}
            }

            let mut rest = line.get(4..).unwrap_or("").trim_end();
            if i == 0 {
                if let Some((first, tail)) = rest.split_once(' ') {
                    if let Some(esc) = EnhancedStatusCode::parse(first) {
                        enhanced = Some(esc);
                        rest = tail;
                    }
                } else if let Some(esc) = EnhancedStatusCode::parse(rest) {
                    enhanced = Some(esc);
                    rest = "";
                }
            }
            text.push(rest.to_string());
        }

        let code = code.ok_or_else(|| TransportError::new(TransportErrorKind::Protocol, "empty reply"))?;
        Ok(Self { code, enhanced, lines: text })
    }

    /// 2xx.
    pub fn is_positive(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Reply text joined on one line.
    pub fn text(&self) -> String {
        self.lines.join(" ")
    }

    /// Converts a refusal into a transport error.
    pub fn to_error(&self, context: &str) -> TransportError {
        TransportError::from_reply(
            self.code,
            self.enhanced,
            format!("{} refused: {}", context, self.text()),
        )
    }
}

impl fmt::Display for SmtpReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(esc) = &self.enhanced {
            write!(f, " {}", esc)?;
        }
        write!(f, " {}", self.text())
    }
}

/// Extensions advertised in the EHLO reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// STARTTLS offered.
    pub starttls: bool,
    /// AUTH mechanisms, upper-cased.
    pub auth: Vec<String>,
    /// SIZE limit in bytes, 0 or absent meaning none.
    pub size: Option<usize>,
}

impl Capabilities {
    fn from_reply(reply: &SmtpReply) -> Self {
        let mut caps = Self::default();
        for line in reply.lines.iter().skip(1) {
            let mut words = line.split_whitespace();
            let Some(keyword) = words.next() else { continue };
            match keyword.to_ascii_uppercase().as_str() {
                "STARTTLS" => caps.starttls = true,
                "AUTH" => caps.auth.extend(words.map(|w| w.to_ascii_uppercase())),
                "SIZE" => caps.size = words.next().and_then(|n| n.parse().ok()).filter(|n| *n > 0),
                _ => {}
            }
        }
        caps
    }

    fn supports_auth(&self, mechanism: &str) -> bool {
        self.auth.iter().any(|m| m == mechanism)
    }
}

/// Line-oriented SMTP I/O over any byte stream.
pub(crate) struct Session<S> {
    stream: BufReader<S>,
    socket_timeout: Duration,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub(crate) fn new(stream: S, socket_timeout: Duration) -> Self {
        Self {
            stream: BufReader::new(stream),
            socket_timeout,
        }
    }

    async fn read_reply(&mut self, context: &str) -> TransportResult<SmtpReply> {
        let mut lines = Vec::new();
        loop {
            let mut buf = Vec::new();
            let n = timeout(self.socket_timeout, self.stream.read_until(b'\n', &mut buf))
                .await
                .map_err(|_| {
                    TransportError::new(
                        TransportErrorKind::ReadTimeout,
                        format!("{}: reply timed out after {:?}", context, self.socket_timeout),
                    )
                })?
                .map_err(|e| TransportError::from_io(e, context))?;

            if n == 0 {
                return Err(TransportError::new(
                    TransportErrorKind::ConnectionReset,
                    format!("{}: server closed the connection", context),
                ));
            }

            let line = String::from_utf8_lossy(&buf).trim_end().to_string();
            let more = line.as_bytes().get(3) == Some(&b'-');
            lines.push(line);
            if !more {
                break;
            }
        }

        let reply = SmtpReply::parse(&lines)?;
        tracing::trace!(context, code = reply.code, "SMTP reply");
        Ok(reply)
    }

    async fn write_all(&mut self, data: &[u8], context: &str) -> TransportResult<()> {
        let stream = self.stream.get_mut();
        timeout(self.socket_timeout, async {
            stream.write_all(data).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| {
            TransportError::new(
                TransportErrorKind::WriteTimeout,
                format!("{}: write timed out after {:?}", context, self.socket_timeout),
            )
        })?
        .map_err(|e| TransportError::from_io(e, context))
    }

    async fn command(&mut self, line: &str, context: &str) -> TransportResult<SmtpReply> {
        self.write_all(format!("{}\r\n", line).as_bytes(), context).await?;
        self.read_reply(context).await
    }

    async fn expect(&mut self, line: &str, context: &str, code: u16) -> TransportResult<SmtpReply> {
        let reply = self.command(line, context).await?;
        if reply.code == code || (code == 250 && reply.is_positive()) {
            Ok(reply)
        } else {
            Err(reply.to_error(context))
        }
    }

    pub(crate) async fn greeting(&mut self, limit: Duration) -> TransportResult<()> {
        let reply = timeout(limit, self.read_reply("greeting"))
            .await
            .map_err(|_| {
                TransportError::new(
                    TransportErrorKind::GreetingTimeout,
                    format!("greeting never received within {}ms", limit.as_millis()),
                )
            })??;

        if reply.code == 220 {
            Ok(())
        } else {
            Err(reply.to_error("greeting"))
        }
    }

    pub(crate) async fn ehlo(&mut self, client_id: &str) -> TransportResult<Capabilities> {
        let reply = self.expect(&format!("EHLO {}", client_id), "EHLO", 250).await?;
        Ok(Capabilities::from_reply(&reply))
    }

    async fn authenticate(&mut self, caps: &Capabilities, credentials: &Credentials) -> TransportResult<()> {
        let password = credentials.password.expose_secret();

        if caps.supports_auth("LOGIN") && !caps.supports_auth("PLAIN") {
            self.expect("AUTH LOGIN", "AUTH", 334).await?;
            self.expect(&BASE64.encode(credentials.username.as_bytes()), "AUTH", 334)
                .await?;
            self.expect(&BASE64.encode(password.as_bytes()), "AUTH", 235).await?;
        } else {
            let token = BASE64.encode(format!("\0{}\0{}", credentials.username, password));
            self.expect(&format!("AUTH PLAIN {}", token), "AUTH", 235).await?;
        }
        Ok(())
    }

    // The server must not have sent anything past the STARTTLS reply.
    fn into_inner(self) -> TransportResult<S> {
        if !self.stream.buffer().is_empty() {
            return Err(TransportError::new(
                TransportErrorKind::Protocol,
                "unexpected data after STARTTLS reply",
            ));
        }
        Ok(self.stream.into_inner())
    }
}

/// An authenticated SMTP session.
pub struct SmtpConnection<S = TlsStream<TcpStream>> {
    session: Session<S>,
    provider: ProviderId,
    capabilities: Capabilities,
}

impl<S> fmt::Debug for SmtpConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConnection")
            .field("provider", &self.provider)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

impl<S> SmtpConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub(crate) async fn open(
        mut session: Session<S>,
        capabilities: Capabilities,
        provider: &ProviderDescriptor,
    ) -> TransportResult<Self> {
        session.authenticate(&capabilities, &provider.credentials).await?;
        tracing::debug!(provider = %provider.id, "SMTP session authenticated");
        Ok(Self {
            session,
            provider: provider.id.clone(),
            capabilities,
        })
    }

    async fn transaction(&mut self, envelope: &Envelope, data: &[u8]) -> TransportResult<SendAck> {
        self.session
            .expect(&format!("MAIL FROM:{}", envelope.envelope_from.to_smtp()), "MAIL FROM", 250)
            .await?;

        let mut accepted = Vec::with_capacity(envelope.recipients.len());
        let mut rejected = Vec::new();
        let mut last_refusal = None;
        for rcpt in &envelope.recipients {
            let reply = self.session.command(&format!("RCPT TO:{}", rcpt.to_smtp()), "RCPT TO").await?;
            if reply.is_positive() {
                accepted.push(rcpt.clone());
            } else {
                rejected.push((rcpt.clone(), reply.text()));
                last_refusal = Some(reply);
            }
        }

        if accepted.is_empty() {
            return Err(match last_refusal {
                Some(reply) => reply.to_error("RCPT TO"),
                None => TransportError::new(TransportErrorKind::Protocol, "no recipients"),
            });
        }

        self.session.expect("DATA", "DATA", 354).await?;
        self.session.write_all(&dot_stuff(data), "DATA").await?;
        let reply = self.session.read_reply("DATA").await?;
        if !reply.is_positive() {
            return Err(reply.to_error("DATA"));
        }

        Ok(SendAck {
            response: reply.to_string(),
            accepted,
            rejected,
        })
    }
}

#[async_trait]
impl<S> RelayConnection for SmtpConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, envelope: &Envelope) -> TransportResult<SendAck> {
        let data = envelope.render();
        if let Some(limit) = self.capabilities.size {
            if data.len() > limit {
                return Err(TransportError::from_reply(
                    552,
                    None,
                    format!("message of {} bytes exceeds server limit of {}", data.len(), limit),
                ));
            }
        }

        let result = self.transaction(envelope, &data).await;
        if let Err(e) = &result {
            if !e.kind().is_connection_level() {
                // Leave the session reusable after a refusal.
                if let Err(rset) = self.session.expect("RSET", "RSET", 250).await {
                    tracing::debug!(provider = %self.provider, error = %rset, "RSET failed");
                }
            }
        }
        result
    }

    async fn health_check(&mut self) -> TransportResult<()> {
        self.session.expect("NOOP", "NOOP", 250).await.map(|_| ())
    }
}

/// Dot-stuffs a CRLF message and appends the end-of-data marker.
pub fn dot_stuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 8);
    let mut line_start = true;
    for &b in data {
        if line_start && b == b'.' {
            out.push(b'.');
        }
        out.push(b);
        line_start = b == b'\n';
    }
    if !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

/// Opens SMTP sessions secured with rustls.
pub struct SmtpConnector {
    tls: TlsConnector,
    client_id: String,
}

impl fmt::Debug for SmtpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConnector").field("client_id", &self.client_id).finish()
    }
}

impl SmtpConnector {
    /// Builds a connector from the TLS policy.
    pub fn new(tls: &TlsConfig, client_id: impl Into<String>) -> DeliveryResult<Self> {
        let config = build_tls_config(tls)?;
        Ok(Self {
            tls: TlsConnector::from(Arc::new(config)),
            client_id: client_id.into(),
        })
    }

    async fn handshake(
        &self,
        tcp: TcpStream,
        host: &str,
        settings: &LaneSettings,
    ) -> TransportResult<TlsStream<TcpStream>> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| TransportError::new(TransportErrorKind::Tls, format!("invalid server name {:?}", host)))?;

        timeout(settings.socket_timeout, self.tls.connect(server_name, tcp))
            .await
            .map_err(|_| TransportError::new(TransportErrorKind::Tls, "TLS handshake timed out"))?
            .map_err(|e| {
                TransportError::new(TransportErrorKind::Tls, format!("TLS handshake failed: {}", e)).with_cause(e)
            })
    }
}

#[async_trait]
impl RelayConnector for SmtpConnector {
    async fn connect(
        &self,
        provider: &ProviderDescriptor,
        settings: &LaneSettings,
    ) -> TransportResult<Box<dyn RelayConnection>> {
        let endpoint = &provider.endpoint;
        let address = endpoint.address();

        let tcp = timeout(settings.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                TransportError::new(
                    TransportErrorKind::ConnectTimeout,
                    format!("connect to {} timed out after {}ms", address, settings.connect_timeout.as_millis()),
                )
            })?
            .map_err(|e| TransportError::from_io(e, &format!("connect to {}", address)))?;
        tcp.set_nodelay(true).ok();

        let connection = match endpoint.tls_mode {
            TlsMode::Implicit => {
                let tls = self.handshake(tcp, &endpoint.host, settings).await?;
                let mut session = Session::new(tls, settings.socket_timeout);
                session.greeting(settings.connect_timeout).await?;
                let caps = session.ehlo(&self.client_id).await?;
                SmtpConnection::open(session, caps, provider).await?
            }
            TlsMode::StartTls => {
                let mut session = Session::new(tcp, settings.socket_timeout);
                session.greeting(settings.connect_timeout).await?;
                let caps = session.ehlo(&self.client_id).await?;
                if !caps.starttls {
                    return Err(TransportError::new(
                        TransportErrorKind::Tls,
                        format!("{} does not offer STARTTLS", address),
                    ));
                }
                session.expect("STARTTLS", "STARTTLS", 220).await?;

                let tls = self.handshake(session.into_inner()?, &endpoint.host, settings).await?;
                let mut session = Session::new(tls, settings.socket_timeout);
                let caps = session.ehlo(&self.client_id).await?;
                SmtpConnection::open(session, caps, provider).await?
            }
        };

        Ok(Box::new(connection))
    }
}

fn build_tls_config(config: &TlsConfig) -> DeliveryResult<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = &config.ca_cert_path {
        let file = File::open(path).map_err(|e| {
            DeliveryError::Configuration(format!("cannot open CA bundle {}: {}", path.display(), e))
        })?;
        for cert in rustls_pemfile::certs(&mut StdBufReader::new(file)) {
            let cert = cert.map_err(|e| {
                DeliveryError::Configuration(format!("invalid CA bundle {}: {}", path.display(), e))
            })?;
            roots.add(cert).map_err(|e| {
                DeliveryError::Configuration(format!("rejected CA certificate in {}: {}", path.display(), e))
            })?;
        }
    }

    let versions: &[&'static rustls::SupportedProtocolVersion] = match config.min_version {
        TlsVersion::Tls12 => &[&rustls::version::TLS13, &rustls::version::TLS12],
        TlsVersion::Tls13 => &[&rustls::version::TLS13],
    };

    Ok(rustls::ClientConfig::builder_with_protocol_versions(versions)
        .with_root_certificates(roots)
        .with_no_client_auth())
}
