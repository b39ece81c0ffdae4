//! Streaming-XML transport to the hub.
//!
//! One [`XmppTransport`] is one connection: open the stream, authenticate
//! with SASL PLAIN, bind a named resource, then exchange stanzas.  The hub
//! speaks just enough XMPP to carry its own command channel, with two quirks
//! this layer absorbs:
//!
//! - an `<iq>` with no `type` attribute (the hub's acknowledgement stanzas)
//!   is treated as an empty result instead of failing the stream;
//! - an outbound stanza carrying a `service-unavailable` error is dropped
//!   instead of sent, so those acknowledgements are never echoed back.
//!
//! The socket comes from a [`Connector`], so tests can run the whole
//! negotiation against an in-memory peer.

pub mod xml;

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::net::{Connection, Connector};
use xml::{XmlElement, XmlEvent, XmlParser};

/// The XMPP domain the hub's stream is addressed to.
pub const XMPP_DOMAIN: &str = "harmonyhub";

const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
const NS_BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";

/// Upper bound on each step of the stream negotiation.
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Error type for the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The TCP (or scripted) connection could not be opened.
    #[error("failed to connect to hub at {host}:{port}: {source}")]
    ConnectFailed {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    /// An I/O error occurred on the established connection.
    #[error("connection I/O error: {0}")]
    Io(#[from] io::Error),

    /// The inbound bytes are not the stream dialect this client speaks.
    #[error("stream error: {0}")]
    Stream(String),

    /// The hub rejected the SASL credentials or the resource bind.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// No stanza arrived within the caller's deadline.
    #[error("timed out waiting for the hub")]
    Timeout,

    /// The hub closed the stream or the connection.
    #[error("connection closed by the hub")]
    Closed,
}

/// Monotonic stanza ids, unique per process.
static STANZA_SEQ: AtomicU64 = AtomicU64::new(0);

pub(crate) fn next_stanza_id() -> String {
    format!("stanza-{}", STANZA_SEQ.fetch_add(1, Ordering::Relaxed))
}

/// Builds the SASL PLAIN initial response: authzid empty, then the
/// authentication identity and password, NUL-separated, base64-encoded.
fn plain_credentials(user: &str, password: &str) -> String {
    BASE64.encode(format!("\0{user}\0{password}"))
}

/// Prefixes a localpart onto a JID the hub returned without one.
fn normalize_jid(jid: &str) -> String {
    if jid.contains('@') {
        jid.to_string()
    } else {
        format!("client@{jid}")
    }
}

/// One streaming-XML connection to the hub.
pub struct XmppTransport {
    conn: Box<dyn Connection>,
    parser: XmlParser,
    local_jid: Option<String>,
    closed: bool,
}

impl XmppTransport {
    /// Connects and opens the XML stream (no authentication yet).
    ///
    /// # Errors
    ///
    /// [`TransportError::ConnectFailed`] when the socket cannot be opened;
    /// stream-level errors when the hub's greeting is not understood.
    pub async fn connect(
        connector: &dyn Connector,
        host: &str,
        port: u16,
    ) -> Result<Self, TransportError> {
        let conn = connector
            .connect(host, port)
            .await
            .map_err(|source| TransportError::ConnectFailed {
                host: host.to_string(),
                port,
                source,
            })?;
        let mut transport = Self {
            conn,
            parser: XmlParser::new(),
            local_jid: None,
            closed: false,
        };
        transport.open_stream().await?;
        Ok(transport)
    }

    /// Authenticates with SASL PLAIN and binds `resource`.
    ///
    /// `user` is the full identity (`name@domain`); the hub uses it verbatim
    /// as the authentication id.  After a successful bind the connection is
    /// ready for stanza exchange and [`XmppTransport::local_jid`] is set.
    pub async fn login(
        &mut self,
        user: &str,
        password: &str,
        resource: &str,
    ) -> Result<(), TransportError> {
        let auth = XmlElement::new("auth")
            .with_attr("xmlns", NS_SASL)
            .with_attr("mechanism", "PLAIN")
            .with_text(plain_credentials(user, password));
        self.send_stanza(&auth).await?;

        let reply = self.receive_next(NEGOTIATION_TIMEOUT).await?;
        match reply.local_name() {
            "success" => {}
            "failure" => {
                let reason = reply
                    .children
                    .first()
                    .map(|c| c.local_name().to_string())
                    .unwrap_or_else(|| "no reason given".to_string());
                return Err(TransportError::AuthRejected(reason));
            }
            other => {
                return Err(TransportError::Stream(format!(
                    "expected SASL result, got <{other}>"
                )))
            }
        }

        // Stream restarts from scratch after authentication.
        self.open_stream().await?;
        self.bind(resource).await
    }

    /// Opens (or re-opens) the stream and consumes the greeting + features.
    async fn open_stream(&mut self) -> Result<(), TransportError> {
        let header = format!(
            "<stream:stream to='{XMPP_DOMAIN}' xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>"
        );
        self.send_raw(&header).await?;

        let greeting = self.next_event(NEGOTIATION_TIMEOUT).await?;
        let XmlEvent::StreamOpen(_) = greeting else {
            return Err(TransportError::Stream(format!(
                "expected stream open, got {greeting:?}"
            )));
        };

        let features = self.receive_next(NEGOTIATION_TIMEOUT).await?;
        if features.local_name() != "features" {
            return Err(TransportError::Stream(format!(
                "expected stream features, got <{}>",
                features.name
            )));
        }
        if let Some(mechanisms) = features.child("mechanisms") {
            let plain_offered = mechanisms
                .children
                .iter()
                .any(|m| m.local_name() == "mechanism" && m.text.trim() == "PLAIN");
            if !plain_offered {
                return Err(TransportError::AuthRejected(
                    "hub does not offer PLAIN".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Binds the named resource and records the assigned JID.
    async fn bind(&mut self, resource: &str) -> Result<(), TransportError> {
        let id = next_stanza_id();
        let iq = XmlElement::new("iq")
            .with_attr("type", "set")
            .with_attr("id", &id)
            .with_child(
                XmlElement::new("bind")
                    .with_attr("xmlns", NS_BIND)
                    .with_child(XmlElement::new("resource").with_text(resource)),
            );
        self.send_stanza(&iq).await?;

        let deadline = Instant::now() + NEGOTIATION_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let reply = self.receive_next(remaining).await?;
            if reply.local_name() != "iq" || reply.attr("id") != Some(id.as_str()) {
                debug!("ignoring stanza while awaiting bind result: <{}>", reply.name);
                continue;
            }
            if reply.attr("type") == Some("error") {
                return Err(TransportError::AuthRejected(format!(
                    "resource bind for '{resource}' failed"
                )));
            }
            let jid = reply
                .child("bind")
                .and_then(|b| b.child("jid"))
                .map(|j| j.text.trim().to_string())
                .ok_or_else(|| {
                    TransportError::Stream("bind result without a jid".to_string())
                })?;
            // The hub returns a JID without a localpart.
            self.local_jid = Some(normalize_jid(&jid));
            debug!("bound as {}", self.local_jid.as_deref().unwrap_or_default());
            return Ok(());
        }
    }

    /// Sends one stanza, unless it carries a `service-unavailable` error —
    /// the hub's own acknowledgements round-trip with that condition and must
    /// not be echoed back.
    pub async fn send_stanza(&mut self, stanza: &XmlElement) -> Result<(), TransportError> {
        let unavailable = stanza
            .child("error")
            .is_some_and(|e| e.children.iter().any(|c| c.local_name() == "service-unavailable"));
        if unavailable {
            debug!("suppressing outbound service-unavailable stanza <{}>", stanza.name);
            return Ok(());
        }
        self.send_raw(&stanza.to_xml()).await
    }

    /// Returns the next stanza addressed to this connection, waiting at most
    /// `timeout`.
    ///
    /// # Errors
    ///
    /// [`TransportError::Timeout`] when nothing arrives in time and
    /// [`TransportError::Closed`] once the hub closes the stream.
    pub async fn receive_next(&mut self, timeout: Duration) -> Result<XmlElement, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.next_event(remaining).await? {
                XmlEvent::Stanza(mut stanza) => {
                    if stanza.local_name() == "iq" && stanza.attr("type").is_none() {
                        // Hub acknowledgement without a declared type.
                        stanza.set_attr("type", "result");
                    }
                    return Ok(stanza);
                }
                XmlEvent::StreamClose => return Err(TransportError::Closed),
                XmlEvent::StreamOpen(_) => {
                    warn!("unexpected stream open mid-session; ignoring");
                }
            }
        }
    }

    /// Pulls the next framing event, reading more bytes as needed.
    async fn next_event(&mut self, timeout: Duration) -> Result<XmlEvent, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self
                .parser
                .next_event()
                .map_err(|e| TransportError::Stream(e.to_string()))?
            {
                return Ok(event);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout);
            }
            let mut buf = [0u8; 4096];
            let read = tokio::time::timeout(remaining, self.conn.read(&mut buf))
                .await
                .map_err(|_| TransportError::Timeout)?;
            match read {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => self.parser.push_bytes(&buf[..n]),
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }

    async fn send_raw(&mut self, text: &str) -> Result<(), TransportError> {
        self.conn.write_all(text.as_bytes()).await?;
        self.conn.flush().await?;
        Ok(())
    }

    /// Closes the stream and the socket.  Idempotent; errors during teardown
    /// are logged and swallowed so cleanup can run on every exit path.
    pub async fn disconnect(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.send_raw("</stream:stream>").await {
            debug!("stream close not sent: {e}");
        }
        if let Err(e) = self.conn.shutdown().await {
            debug!("socket shutdown failed: {e}");
        }
        debug!("transport disconnected");
    }

    /// The JID assigned at bind time, if authentication completed.
    pub fn local_jid(&self) -> Option<&str> {
        self.local_jid.as_deref()
    }

    /// The bare (resourceless) form of the bound JID.
    pub fn local_bare_jid(&self) -> Option<&str> {
        self.local_jid().map(|j| j.split('/').next().unwrap_or(j))
    }

    /// The server identity stanzas may use as a sender.
    pub fn server(&self) -> &str {
        XMPP_DOMAIN
    }

    #[cfg(test)]
    pub(crate) fn from_stream(conn: Box<dyn Connection>) -> Self {
        Self {
            conn,
            parser: XmlParser::new(),
            local_jid: None,
            closed: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn set_local_jid(&mut self, jid: &str) {
        self.local_jid = Some(jid.to_string());
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
