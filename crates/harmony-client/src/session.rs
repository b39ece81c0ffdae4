//! The power-off session: discovery, pairing, command, teardown.
//!
//! One [`PowerOffSession`] run walks the step sequence in
//! [`ProgressStep`]: resolve a hub address (explicit host or LAN
//! discovery), pair anonymously on a first connection to obtain a session
//! token, then reconnect with that token and tell the hub to stop the
//! current activity.  A dry run stops after pairing — connectivity proven,
//! nothing switched off.
//!
//! Cancellation is cooperative: the token is checked at every transition
//! and around every blocking operation, and a cancelled run unwinds through
//! the same guaranteed-disconnect paths as a successful one, reporting
//! [`Outcome::Stopped`] instead of an error.

use std::sync::Arc;
use std::time::Duration;

use harmony_core::oa::OaRequest;
use harmony_core::{ProgressStep, ProtocolError, STOP_CURRENT_ACTIVITY};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::discovery::{self, DiscoveryError};
use crate::net::{Connector, TcpConnector};
use crate::oa_channel::{
    OaChannel, OaError, DEFAULT_REPLY_TIMEOUT, START_ACTIVITY_REPLY_TIMEOUT,
};
use crate::transport::{TransportError, XmppTransport};

/// Default XMPP port a hub listens on.
pub const DEFAULT_HUB_PORT: u16 = 5222;

/// Overall deadline for resolving a hub address via discovery.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Fixed anonymous identity for the pairing connection.
const GUEST_NAME: &str = "guest";
const GUEST_PASSWORD: &str = "gatorade.";
const USER_DOMAIN: &str = "connect.logitech.com/gatorade";

const RESOURCE_AUTH: &str = "auth";
const RESOURCE_MAIN: &str = "main";

/// Immutable per-run configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Hub host or IP.  `None` means discover on the LAN.
    pub target_host: Option<String>,
    /// Restrict discovery to the hub with this uuid.
    pub hub_uuid: Option<String>,
    /// Hub XMPP port.
    pub port: u16,
    /// Stop after pairing instead of sending the command.
    pub dry_run: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target_host: None,
            hub_uuid: None,
            port: DEFAULT_HUB_PORT,
            dry_run: false,
        }
    }
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The run reached its final step (command sent, or pairing verified on
    /// a dry run).
    Completed,
    /// The run was cancelled at a safe point.  Not a failure.
    Stopped,
}

/// Error type for a failed run.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No explicit host and discovery produced nothing within the deadline.
    #[error("no hub found: {0}")]
    UnresolvedHost(String),

    /// Pairing completed at the transport level but yielded no token.
    #[error("hub pairing did not yield a session token")]
    AuthFailed,

    /// A reply deadline expired.
    #[error("no {phase} reply from the hub in time")]
    Timeout { phase: &'static str },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

/// Progress callback: `(step, last step for this run)`.
pub type ProgressFn = dyn Fn(ProgressStep, ProgressStep) + Send + Sync;

/// Internal control flow: a run either fails or is deliberately stopped.
enum Interrupt {
    Stopped,
    Failed(SessionError),
}

impl From<SessionError> for Interrupt {
    fn from(e: SessionError) -> Self {
        Interrupt::Failed(e)
    }
}

/// One power-off run against one hub.
pub struct PowerOffSession {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    progress: Option<Box<ProgressFn>>,
}

impl PowerOffSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            connector: Arc::new(TcpConnector),
            progress: None,
        }
    }

    /// Replaces the socket factory; tests inject a scripted connector here.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Registers a progress callback, invoked before each transition.
    pub fn with_progress(
        mut self,
        progress: impl Fn(ProgressStep, ProgressStep) + Send + Sync + 'static,
    ) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    /// Runs the session to completion, failure, or cooperative stop.
    ///
    /// # Errors
    ///
    /// [`SessionError`] for failures.  Cancellation is not an error: it
    /// yields `Ok(`[`Outcome::Stopped`]`)`.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<Outcome, SessionError> {
        match self.run_inner(cancel).await {
            Ok(()) => Ok(Outcome::Completed),
            Err(Interrupt::Stopped) => {
                info!("power-off run stopped on request");
                Ok(Outcome::Stopped)
            }
            Err(Interrupt::Failed(e)) => Err(e),
        }
    }

    async fn run_inner(&self, cancel: &CancellationToken) -> Result<(), Interrupt> {
        self.ensure_active(cancel)?;
        self.report(ProgressStep::Started);

        let host = self.resolve_target(cancel).await?;
        info!("connecting to hub at {host}:{}", self.config.port);
        self.report(ProgressStep::Resolved);

        self.ensure_active(cancel)?;
        let token = self.pairing_phase(cancel, &host).await?;
        self.report(ProgressStep::AuthDone);
        if self.config.dry_run {
            info!("dry run: connectivity verified, not sending the command");
            return Ok(());
        }

        self.ensure_active(cancel)?;
        self.command_phase(cancel, &host, &token).await?;
        self.report(ProgressStep::Done);
        Ok(())
    }

    /// Resolves the hub address: the configured host, or the first
    /// discovered hub (optionally filtered by uuid) within the deadline.
    async fn resolve_target(&self, cancel: &CancellationToken) -> Result<String, Interrupt> {
        if let Some(host) = &self.config.target_host {
            return Ok(host.clone());
        }

        // Child token: discovery must not outlive this resolution.
        let discovery_cancel = cancel.child_token();
        let mut discovery = discovery::start(discovery_cancel.clone())
            .await
            .map_err(SessionError::from)?;
        let result = self.await_matching_hub(cancel, &mut discovery).await;
        discovery_cancel.cancel();
        result
    }

    async fn await_matching_hub(
        &self,
        cancel: &CancellationToken,
        discovery: &mut discovery::Discovery,
    ) -> Result<String, Interrupt> {
        let deadline = tokio::time::sleep(RESOLVE_TIMEOUT);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Interrupt::Stopped),
                _ = &mut deadline => {
                    return Err(SessionError::UnresolvedHost(
                        "discovery deadline elapsed".to_string(),
                    )
                    .into());
                }
                hub = discovery.next() => {
                    let Some(hub) = hub else {
                        return Err(SessionError::UnresolvedHost(
                            "discovery ended without a match".to_string(),
                        )
                        .into());
                    };
                    match &self.config.hub_uuid {
                        Some(wanted) if *wanted != hub.uuid => {
                            info!("ignoring hub {} (looking for {wanted})", hub.uuid);
                        }
                        _ => return Ok(hub.ip),
                    }
                }
            }
        }
    }

    /// Connects anonymously, pairs, and returns the session token.  The
    /// auth transport is disconnected on every path out of here.
    async fn pairing_phase(
        &self,
        cancel: &CancellationToken,
        host: &str,
    ) -> Result<String, Interrupt> {
        let transport = self.connect(host).await?;
        self.report(ProgressStep::AuthConnected);

        let channel = OaChannel::new(transport);
        let result = self.obtain_token(cancel, &channel).await;
        channel.disconnect().await;
        result
    }

    async fn obtain_token(
        &self,
        cancel: &CancellationToken,
        channel: &OaChannel,
    ) -> Result<String, Interrupt> {
        self.ensure_active(cancel)?;
        channel
            .login(
                &format!("{GUEST_NAME}@{USER_DOMAIN}"),
                GUEST_PASSWORD,
                RESOURCE_AUTH,
            )
            .await
            .map_err(SessionError::from)?;

        self.ensure_active(cancel)?;
        let reply = channel
            .exchange(&OaRequest::pair(), DEFAULT_REPLY_TIMEOUT)
            .await
            .map_err(oa_error("pairing"))?;
        self.ensure_active(cancel)?;

        reply
            .session_token()
            .ok_or_else(|| SessionError::AuthFailed.into())
    }

    /// Connects with the session token and sends the stop-activity command.
    /// The main transport is disconnected on every path out of here.
    async fn command_phase(
        &self,
        cancel: &CancellationToken,
        host: &str,
        token: &str,
    ) -> Result<(), Interrupt> {
        let transport = self.connect(host).await?;
        self.report(ProgressStep::MainConnected);

        let channel = OaChannel::new(transport);
        let result = self.send_power_off(cancel, &channel, token).await;
        channel.disconnect().await;
        result
    }

    async fn send_power_off(
        &self,
        cancel: &CancellationToken,
        channel: &OaChannel,
        token: &str,
    ) -> Result<(), Interrupt> {
        self.ensure_active(cancel)?;
        channel
            .login(&format!("{token}@{USER_DOMAIN}"), token, RESOURCE_MAIN)
            .await
            .map_err(SessionError::from)?;

        self.ensure_active(cancel)?;
        let reply = channel
            .exchange(
                &OaRequest::start_activity(STOP_CURRENT_ACTIVITY),
                START_ACTIVITY_REPLY_TIMEOUT,
            )
            .await
            .map_err(oa_error("power-off"))?;
        if let Some(code) = &reply.status_code {
            info!("hub acknowledged power-off with status {code}");
        }
        Ok(())
    }

    async fn connect(&self, host: &str) -> Result<XmppTransport, Interrupt> {
        XmppTransport::connect(self.connector.as_ref(), host, self.config.port)
            .await
            .map_err(|e| SessionError::from(e).into())
    }

    fn ensure_active(&self, cancel: &CancellationToken) -> Result<(), Interrupt> {
        if cancel.is_cancelled() {
            Err(Interrupt::Stopped)
        } else {
            Ok(())
        }
    }

    fn report(&self, step: ProgressStep) {
        let last = ProgressStep::last(self.config.dry_run);
        if let Some(progress) = &self.progress {
            progress(step, last);
        }
        info!("power-off progress: {}/{}", step.as_u8(), last.as_u8());
    }
}

fn oa_error(phase: &'static str) -> impl Fn(OaError) -> Interrupt {
    move |e| match e {
        OaError::Timeout(_) => {
            warn!("{phase} exchange timed out");
            SessionError::Timeout { phase }.into()
        }
        OaError::Protocol(p) => SessionError::Protocol(p).into(),
        OaError::Transport(t) => SessionError::Transport(t).into(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
