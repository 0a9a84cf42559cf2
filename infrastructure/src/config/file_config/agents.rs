//! Agents registered at startup (`[[agents]]` array)

use relay_domain::{AgentRole, AuthorityError, RingLayer};
use serde::{Deserialize, Serialize};

/// One `[[agents]]` entry.
///
/// Role and layer stay raw so validation can report bad values instead of
/// failing deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAgentEntry {
    pub id: String,
    pub role: String,
    #[serde(default = "default_ring_layer")]
    pub ring_layer: u8,
}

fn default_ring_layer() -> u8 {
    RingLayer::Layer2.as_u8()
}

impl FileAgentEntry {
    pub fn parse_role(&self) -> Result<AgentRole, AuthorityError> {
        self.role.parse()
    }

    pub fn parse_ring_layer(&self) -> Result<RingLayer, AuthorityError> {
        RingLayer::try_from(self.ring_layer)
    }

    /// Parsed `(id, role, layer)`.
    pub fn resolve(&self) -> Result<(String, AgentRole, RingLayer), AuthorityError> {
        Ok((
            self.id.clone(),
            self.parse_role()?,
            self.parse_ring_layer()?,
        ))
    }
}
