//! The OA request/reply channel over one transport connection.
//!
//! Wraps an [`OaRequest`] in the generic IQ envelope, sends it, and waits for
//! the correlated reply on the multiplexed inbound stream.  Correlation is
//! what makes this layer non-trivial: the hub answers on envelope types
//! `error` and `get` (never the conventional `result`), interleaves
//! unrelated stanzas, sends intermediate continuation replies that must be
//! skipped, and could in principle be spoofed by another device on the LAN —
//! so candidate replies are checked by type, id, and sender before they are
//! parsed.
//!
//! The channel owns its transport behind a mutex held for the whole
//! send/receive span: one in-flight exchange per connection, because reply
//! correlation is only reliable when exchanges are strictly serialized.

use std::time::Duration;

use harmony_core::oa::{OaReply, OaRequest, ProtocolError};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::transport::xml::XmlElement;
use crate::transport::{next_stanza_id, TransportError, XmppTransport};

/// Namespace of the OA envelope child element.
pub const OA_NAMESPACE: &str = "connect.logitech.com";

/// Reply deadline for ordinary exchanges.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Reply deadline for start-activity: the hub walks every device in the
/// activity before answering, which can take tens of seconds.
pub const START_ACTIVITY_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Error type for OA exchanges.
#[derive(Debug, Error)]
pub enum OaError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// No acceptable reply arrived within the exchange deadline.
    #[error("no reply from the hub within {0:?}")]
    Timeout(Duration),
}

/// An OA command channel over one authenticated transport.
pub struct OaChannel {
    transport: Mutex<XmppTransport>,
}

impl OaChannel {
    pub fn new(transport: XmppTransport) -> Self {
        Self {
            transport: Mutex::new(transport),
        }
    }

    /// Authenticates the underlying transport.  See [`XmppTransport::login`].
    pub async fn login(
        &self,
        user: &str,
        password: &str,
        resource: &str,
    ) -> Result<(), TransportError> {
        self.transport.lock().await.login(user, password, resource).await
    }

    /// Sends `request` and waits for its reply, skipping continuations.
    ///
    /// # Errors
    ///
    /// [`OaError::Timeout`] when no acceptable reply arrives in `timeout`;
    /// [`OaError::Protocol`] for an error status, unknown mime, or malformed
    /// body; transport errors pass through.
    pub async fn exchange(
        &self,
        request: &OaRequest,
        timeout: Duration,
    ) -> Result<OaReply, OaError> {
        let mut transport = self.transport.lock().await;

        let id = next_stanza_id();
        let envelope = XmlElement::new("iq")
            .with_attr("type", "get")
            .with_attr("id", &id)
            .with_child(
                XmlElement::new("oa")
                    .with_attr("xmlns", OA_NAMESPACE)
                    .with_attr("mime", request.mime)
                    .with_text(request.body()),
            );
        let filter = ReplyFilter {
            id,
            to: None,
            local_bare: transport.local_bare_jid().map(str::to_string),
            server: transport.server().to_string(),
        };
        transport.send_stanza(&envelope).await.map_err(OaError::Transport)?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(OaError::Timeout(timeout));
            }
            let stanza = match transport.receive_next(remaining).await {
                Ok(stanza) => stanza,
                Err(TransportError::Timeout) => return Err(OaError::Timeout(timeout)),
                Err(e) => return Err(e.into()),
            };
            if !filter.accepts(&stanza) {
                continue;
            }
            let oa = stanza.child("oa").ok_or(ProtocolError::MissingOaElement)?;
            let reply = OaReply::parse(
                oa.attr("mime").unwrap_or_default(),
                oa.attr("errorcode"),
                oa.attr("errorstring"),
                oa.text.trim(),
            )?;
            if reply.is_continue() {
                debug!("skipping continuation reply for {}", filter.id);
                continue;
            }
            return Ok(reply);
        }
    }

    /// Disconnects the underlying transport.
    pub async fn disconnect(&self) {
        self.transport.lock().await.disconnect().await;
    }
}

/// Decides whether an inbound stanza is the reply to one outstanding request.
struct ReplyFilter {
    id: String,
    /// The explicit recipient of the request, when one was set.
    to: Option<String>,
    local_bare: Option<String>,
    server: String,
}

impl ReplyFilter {
    fn accepts(&self, stanza: &XmlElement) -> bool {
        if stanza.local_name() != "iq" {
            return false;
        }
        // The hub never answers with type "result" on this channel.
        if !matches!(stanza.attr("type"), Some("error") | Some("get")) {
            return false;
        }
        if stanza.attr("id") != Some(self.id.as_str()) {
            return false;
        }
        let from = stanza.attr("from");
        if self.sender_allowed(from) {
            true
        } else {
            warn!(
                "reply to {} from unexpected sender {from:?}; possible spoofing attempt, ignoring",
                self.id
            );
            false
        }
    }

    fn sender_allowed(&self, from: Option<&str>) -> bool {
        // The request's explicit recipient always matches (both absent
        // counts: the hub often omits `from` entirely).
        if from == self.to.as_deref() {
            return true;
        }
        match &self.to {
            None => from.is_some_and(|f| {
                self.local_bare.as_deref() == Some(bare(f)) || f == self.server
            }),
            // When we addressed our own bare identity, the hub relays from
            // arbitrary resources; accept any sender.
            Some(to) => self.local_bare.as_deref() == Some(to.as_str()),
        }
    }
}

fn bare(jid: &str) -> &str {
    jid.split('/').next().unwrap_or(jid)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_net::{socket_pair, VirtualPeer};
    use harmony_core::oa::mime;
    use tokio::io::AsyncReadExt;

    fn filter(to: Option<&str>) -> ReplyFilter {
        ReplyFilter {
            id: "stanza-77".to_string(),
            to: to.map(str::to_string),
            local_bare: Some("client@1111".to_string()),
            server: "harmonyhub".to_string(),
        }
    }

    fn reply_stanza(id: &str, ty: &str, from: Option<&str>) -> XmlElement {
        let mut el = XmlElement::new("iq").with_attr("type", ty).with_attr("id", id);
        if let Some(f) = from {
            el = el.with_attr("from", f);
        }
        el
    }

    #[test]
    fn test_filter_accepts_get_and_error_types_only() {
        let f = filter(None);
        assert!(f.accepts(&reply_stanza("stanza-77", "get", None)));
        assert!(f.accepts(&reply_stanza("stanza-77", "error", None)));
        assert!(!f.accepts(&reply_stanza("stanza-77", "result", None)));
        assert!(!f.accepts(&reply_stanza("stanza-77", "set", None)));
    }

    #[test]
    fn test_filter_requires_matching_id() {
        let f = filter(None);
        assert!(!f.accepts(&reply_stanza("stanza-78", "get", None)));
    }

    #[test]
    fn test_filter_sender_rules_without_explicit_recipient() {
        let f = filter(None);
        // No sender at all: the hub's usual shape.
        assert!(f.accepts(&reply_stanza("stanza-77", "get", None)));
        // Our own bare identity, any resource.
        assert!(f.accepts(&reply_stanza("stanza-77", "get", Some("client@1111/other"))));
        // The server identity.
        assert!(f.accepts(&reply_stanza("stanza-77", "get", Some("harmonyhub"))));
        // Anyone else is a spoof candidate.
        assert!(!f.accepts(&reply_stanza("stanza-77", "get", Some("mallory@evil/x"))));
    }

    #[test]
    fn test_filter_explicit_recipient_must_match_sender() {
        let f = filter(Some("hub@harmonyhub/main"));
        assert!(f.accepts(&reply_stanza("stanza-77", "get", Some("hub@harmonyhub/main"))));
        assert!(!f.accepts(&reply_stanza("stanza-77", "get", Some("other@harmonyhub/main"))));
    }

    #[test]
    fn test_filter_accepts_any_sender_when_recipient_is_own_bare_jid() {
        let f = filter(Some("client@1111"));
        assert!(f.accepts(&reply_stanza("stanza-77", "get", Some("anything@anywhere/x"))));
        assert!(f.accepts(&reply_stanza("stanza-77", "get", None)));
    }

    /// Reads the client's outbound request off the peer and returns its
    /// stanza id.
    async fn read_request_id(peer: &mut VirtualPeer) -> String {
        let mut seen = String::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = peer.read(&mut buf).await.expect("request bytes");
            assert!(n > 0, "client closed before sending a request");
            seen.push_str(&String::from_utf8_lossy(&buf[..n]));
            if seen.contains("</iq>") {
                break;
            }
        }
        let start = seen.find("id=\"").expect("id attribute") + 4;
        let end = seen[start..].find('"').expect("id terminator") + start;
        seen[start..end].to_string()
    }

    fn channel_over(peer_jid: &str) -> (OaChannel, VirtualPeer) {
        let (socket, peer) = socket_pair();
        let mut transport = XmppTransport::from_stream(Box::new(socket));
        transport.set_local_jid(peer_jid);
        (OaChannel::new(transport), peer)
    }

    #[tokio::test]
    async fn test_exchange_skips_wrong_id_spoofed_and_continuation_replies() {
        let (channel, mut peer) = channel_over("client@1111/auth");

        let hub = async move {
            let id = read_request_id(&mut peer).await;
            // Wrong id: ignored.
            peer.write_str(
                "<iq type=\"get\" id=\"stanza-9999\">\
                 <oa xmlns='connect.logitech.com' mime='vnd.logitech.connect/vnd.logitech.pair' \
                 errorcode='200'>identity=wrong</oa></iq>",
            );
            // Matching id but foreign sender: ignored as a spoof.
            peer.write_str(&format!(
                "<iq type=\"get\" id=\"{id}\" from=\"mallory@evil/x\">\
                 <oa xmlns='connect.logitech.com' mime='vnd.logitech.connect/vnd.logitech.pair' \
                 errorcode='200'>identity=forged</oa></iq>"
            ));
            // Continuation: skipped.
            peer.write_str(&format!(
                "<iq type=\"get\" id=\"{id}\">\
                 <oa xmlns='connect.logitech.com' mime='vnd.logitech.connect/vnd.logitech.pair' \
                 errorcode='100'></oa></iq>"
            ));
            // The real reply.
            peer.write_str(&format!(
                "<iq type=\"get\" id=\"{id}\">\
                 <oa xmlns='connect.logitech.com' mime='vnd.logitech.connect/vnd.logitech.pair' \
                 errorcode='200' errorstring='OK'>identity=tok42:status=succeeded</oa></iq>"
            ));
        };

        let (reply, ()) = tokio::join!(
            async {
                channel
                    .exchange(&OaRequest::pair(), Duration::from_secs(5))
                    .await
                    .expect("exchange")
            },
            hub
        );
        assert_eq!(reply.session_token().as_deref(), Some("tok42"));
    }

    #[tokio::test]
    async fn test_exchange_times_out_without_reply() {
        let (channel, _peer) = channel_over("client@1111/auth");
        let err = channel
            .exchange(&OaRequest::pair(), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, OaError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_exchange_surfaces_error_status() {
        let (channel, mut peer) = channel_over("client@1111/auth");

        let hub = async move {
            let id = read_request_id(&mut peer).await;
            peer.write_str(&format!(
                "<iq type=\"error\" id=\"{id}\">\
                 <oa xmlns='connect.logitech.com' mime='vnd.logitech.connect/vnd.logitech.pair' \
                 errorcode='403' errorstring='forbidden'></oa></iq>"
            ));
        };

        let req = OaRequest::pair();
        let (result, ()) = tokio::join!(
            channel.exchange(&req, Duration::from_secs(5)),
            hub
        );
        let err = result.unwrap_err();
        assert!(matches!(
            err,
            OaError::Protocol(ProtocolError::ErrorResponse { code, .. }) if code == "403"
        ));
    }

    #[tokio::test]
    async fn test_exchange_rejects_unknown_reply_mime() {
        let (channel, mut peer) = channel_over("client@1111/auth");

        let hub = async move {
            let id = read_request_id(&mut peer).await;
            peer.write_str(&format!(
                "<iq type=\"get\" id=\"{id}\">\
                 <oa xmlns='connect.logitech.com' mime='vnd.logitech.mystery' \
                 errorcode='200'></oa></iq>"
            ));
        };

        let req = OaRequest::start_activity(-1);
        let (result, ()) = tokio::join!(
            channel.exchange(&req, Duration::from_secs(5)),
            hub
        );
        assert!(matches!(
            result.unwrap_err(),
            OaError::Protocol(ProtocolError::UnhandledReplyType(_))
        ));
    }

    #[tokio::test]
    async fn test_start_activity_not_configured_reply_is_accepted() {
        let (channel, mut peer) = channel_over("client@1111/main");

        let hub = async move {
            let id = read_request_id(&mut peer).await;
            peer.write_str(&format!(
                "<iq type=\"get\" id=\"{id}\">\
                 <oa xmlns='connect.logitech.com' \
                 mime='vnd.logitech.harmony/vnd.logitech.harmony.engine?startactivity' \
                 errorcode='401' errorstring='not configured'></oa></iq>"
            ));
        };

        let req = OaRequest::start_activity(-1);
        let (result, ()) = tokio::join!(
            channel.exchange(&req, Duration::from_secs(5)),
            hub
        );
        let reply = result.expect("401 must be tolerated for start-activity");
        assert_eq!(reply.mime, mime::START_ACTIVITY);
    }
}
