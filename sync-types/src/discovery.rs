//! Discovery metadata advertised on the local network.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Service name both roles advertise and browse under.
///
/// Trust is scoped to this name: any peer that finds us under it and passes
/// the role policy is connected without user interaction.
pub const SERVICE_TYPE: &str = "memoread-sync";

/// Protocol version carried in discovery metadata.
pub const PROTOCOL_VERSION: &str = "1.0";

const VERSION_KEY: &str = "version";
const ROLE_KEY: &str = "platform";

/// Which side of the pairing a process plays.
///
/// Servers advertise and accept invitations; clients browse and invite.
/// Only complementary roles pair, which rules out symmetric invitation loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Advertising side (desktop).
    Server,
    /// Browsing side (handheld).
    Client,
}

impl Role {
    /// The role this role pairs with.
    pub fn complement(self) -> Self {
        match self {
            Role::Server => Role::Client,
            Role::Client => Role::Server,
        }
    }

    /// Tag written into discovery metadata.
    pub fn as_tag(self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
        }
    }

    /// Parse a discovery tag, accepting the platform names older builds used.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "server" | "macos" => Some(Role::Server),
            "client" | "ios" | "ipados" => Some(Role::Client),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// Metadata attached to an advertisement or an invitation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryInfo {
    /// Protocol version string ("1.0").
    pub protocol_version: String,
    /// Advertised role; absent for legacy peers.
    pub role: Option<Role>,
}

impl DiscoveryInfo {
    /// Metadata for a current-version peer playing `role`.
    pub fn new(role: Role) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            role: Some(role),
        }
    }

    /// Metadata as a legacy peer sends it: a version and nothing else.
    pub fn legacy() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            role: None,
        }
    }

    /// Flatten into the key/value form the discovery layer carries.
    pub fn to_txt(&self) -> BTreeMap<String, String> {
        let mut txt = BTreeMap::new();
        txt.insert(VERSION_KEY.to_string(), self.protocol_version.clone());
        if let Some(role) = self.role {
            txt.insert(ROLE_KEY.to_string(), role.as_tag().to_string());
        }
        txt
    }

    /// Parse the key/value form. Unknown keys are ignored.
    pub fn from_txt(txt: &BTreeMap<String, String>) -> Self {
        Self {
            protocol_version: txt
                .get(VERSION_KEY)
                .cloned()
                .unwrap_or_else(|| PROTOCOL_VERSION.to_string()),
            role: txt.get(ROLE_KEY).and_then(|tag| Role::from_tag(tag)),
        }
    }

    /// Major component of the protocol version.
    pub fn major_version(&self) -> Option<u32> {
        self.protocol_version.split('.').next()?.trim().parse().ok()
    }

    /// Whether this peer speaks a protocol we can decode.
    pub fn is_compatible(&self) -> bool {
        let ours = PROTOCOL_VERSION
            .split('.')
            .next()
            .and_then(|major| major.parse::<u32>().ok());
        self.major_version().is_some() && self.major_version() == ours
    }
}
