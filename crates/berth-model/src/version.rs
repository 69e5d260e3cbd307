use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::id::ResourceProviderId;
use crate::resources::Resources;

/// Opaque marker bumped whenever a resource pool changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceVersion(Uuid);

impl ResourceVersion {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<Uuid> for ResourceVersion {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Version of one pool: the agent's own resources when `provider` is
/// absent, otherwise the named provider's.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceVersionEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ResourceProviderId>,
    pub version: ResourceVersion,
}

/// Published state of an attached resource provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderState {
    pub provider: ResourceProviderId,
    pub version: ResourceVersion,
    pub total: Resources,
}
