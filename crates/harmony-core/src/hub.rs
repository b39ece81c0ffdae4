//! The discovery record a hub sends back over the callback TCP connection.

use std::fmt;

use tracing::debug;

/// A hub found on the local network.
///
/// Parsed from the semicolon-delimited attribute string the hub writes to the
/// caller's discovery listener.  Transient: rediscovered on every run; callers
/// that want to remember a hub keep the uuid and pass it back as a filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredHub {
    /// Human-readable name, when the hub advertises one.
    pub friendly_name: Option<String>,
    /// Stable hub identifier.
    pub uuid: String,
    /// IPv4 address the hub can be reached at.
    pub ip: String,
}

impl DiscoveredHub {
    /// Parses a `key:value;key:value` attribute string.
    ///
    /// Returns `None` when the entry does not carry both `ip` and `uuid`;
    /// such replies are useless for connecting and are discarded.
    pub fn parse(text: &str) -> Option<Self> {
        let mut friendly_name = None;
        let mut uuid = None;
        let mut ip = None;
        for attr in text.split(';') {
            let Some((key, value)) = attr.split_once(':') else {
                continue;
            };
            match key {
                "friendlyName" => friendly_name = Some(value.to_string()),
                "uuid" => uuid = Some(value.to_string()),
                "ip" => ip = Some(value.to_string()),
                _ => {}
            }
        }
        match (ip, uuid) {
            (Some(ip), Some(uuid)) => Some(Self {
                friendly_name,
                uuid,
                ip,
            }),
            _ => {
                debug!("discarding discovery reply without ip/uuid: {text}");
                None
            }
        }
    }
}

impl fmt::Display for DiscoveredHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ip:{};uuid:{}", self.ip, self.uuid)?;
        if let Some(name) = &self.friendly_name {
            write!(f, ";friendlyName:{name}")?;
        }
        Ok(())
    }
}
