//! Agent roles and ring layers.

use super::error::AuthorityError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Wildcard permission held by the commander.
pub const WILDCARD_PERMISSION: &str = "*";

/// Hierarchical agent role, in decreasing order of default privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// Full authority; the only role that may modify other agents.
    Commander,
    /// Layer 0-1 access.
    Supervisor,
    /// Layer 1-2 access.
    Operator,
    /// Read-only, layer 2.
    Observer,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Commander => "commander",
            Self::Supervisor => "supervisor",
            Self::Operator => "operator",
            Self::Observer => "observer",
        }
    }

    /// Permission set granted on registration.
    pub fn default_permissions(&self) -> &'static [&'static str] {
        match self {
            Self::Commander => &[WILDCARD_PERMISSION],
            Self::Supervisor => &["read", "write", "execute", "mcp:layer0", "mcp:layer1"],
            Self::Operator => &["read", "write", "mcp:layer1", "mcp:layer2"],
            Self::Observer => &["read", "mcp:layer2"],
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = AuthorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "commander" => Ok(Self::Commander),
            "supervisor" => Ok(Self::Supervisor),
            "operator" => Ok(Self::Operator),
            "observer" => Ok(Self::Observer),
            _ => Err(AuthorityError::InvalidRole(s.to_string())),
        }
    }
}

/// Privilege tier. Layer 0 is the most privileged.
///
/// The derived ordering follows the numeric value, so an agent at layer `a`
/// may perform an operation requiring layer `r` iff `a <= r`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum RingLayer {
    /// Primitives: filesystem, memory.
    Layer0 = 0,
    /// Foundation: git, github, search.
    Layer1 = 1,
    /// Advanced and custom back-ends.
    #[default]
    Layer2 = 2,
}

impl RingLayer {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether an agent at this layer may act at `required`.
    pub fn permits(self, required: RingLayer) -> bool {
        self <= required
    }

    /// Layer required to call a tool back-end.
    ///
    /// Unknown back-ends are treated as custom servers.
    pub fn for_backend(backend: &str) -> RingLayer {
        match backend {
            "filesystem" | "memory" => RingLayer::Layer0,
            "git" | "github" | "brave-search" => RingLayer::Layer1,
            _ => RingLayer::Layer2,
        }
    }
}

impl TryFrom<u8> for RingLayer {
    type Error = AuthorityError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Layer0),
            1 => Ok(Self::Layer1),
            2 => Ok(Self::Layer2),
            other => Err(AuthorityError::InvalidRingLayer(other)),
        }
    }
}

impl From<RingLayer> for u8 {
    fn from(layer: RingLayer) -> Self {
        layer.as_u8()
    }
}

impl fmt::Display for RingLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_ordering_is_numeric() {
        assert!(RingLayer::Layer0 < RingLayer::Layer1);
        assert!(RingLayer::Layer0.permits(RingLayer::Layer2));
        assert!(RingLayer::Layer1.permits(RingLayer::Layer1));
        assert!(!RingLayer::Layer2.permits(RingLayer::Layer1));
    }

    #[test]
    fn layer_parses_only_known_values() {
        assert_eq!(RingLayer::try_from(1).unwrap(), RingLayer::Layer1);
        assert!(matches!(
            RingLayer::try_from(3),
            Err(AuthorityError::InvalidRingLayer(3))
        ));
        let layer: RingLayer = serde_json::from_str("0").unwrap();
        assert_eq!(layer, RingLayer::Layer0);
        assert!(serde_json::from_str::<RingLayer>("7").is_err());
        assert_eq!(serde_json::to_string(&RingLayer::Layer2).unwrap(), "2");
    }

    #[test]
    fn role_parsing_is_case_insensitive() {
        assert_eq!("Commander".parse::<AgentRole>().unwrap(), AgentRole::Commander);
        assert_eq!(" observer ".parse::<AgentRole>().unwrap(), AgentRole::Observer);
        assert!("admiral".parse::<AgentRole>().is_err());
    }

    #[test]
    fn backends_map_to_layers() {
        assert_eq!(RingLayer::for_backend("filesystem"), RingLayer::Layer0);
        assert_eq!(RingLayer::for_backend("github"), RingLayer::Layer1);
        assert_eq!(RingLayer::for_backend("postgres"), RingLayer::Layer2);
    }
}
