use serde::{Deserialize, Serialize};

use crate::id::FrameworkId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameworkCapability {
    /// Accepts `GONE`/`DROPPED` instead of `LOST`.
    PartitionAware,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameworkInfo {
    pub id: FrameworkId,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
    /// Whether this framework's state survives an agent restart.
    #[serde(default)]
    pub checkpoint: bool,
    #[serde(default)]
    pub capabilities: Vec<FrameworkCapability>,
}

impl FrameworkInfo {
    pub fn new(id: impl Into<FrameworkId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            user: None,
            principal: None,
            checkpoint: false,
            capabilities: Vec::new(),
        }
    }

    pub fn partition_aware(mut self) -> Self {
        if !self.is_partition_aware() {
            self.capabilities.push(FrameworkCapability::PartitionAware);
        }
        self
    }

    pub fn checkpointing(mut self) -> Self {
        self.checkpoint = true;
        self
    }

    #[inline]
    pub fn is_partition_aware(&self) -> bool {
        self.capabilities.contains(&FrameworkCapability::PartitionAware)
    }
}
