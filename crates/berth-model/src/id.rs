use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            #[inline]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identity of a workload owner registered with the controller.
    FrameworkId
);
string_id!(
    /// Identity of an executor, unique within its framework.
    ExecutorId
);
string_id!(
    /// Identity of a task, unique within its framework.
    TaskId
);
string_id!(
    /// Identity the controller assigned to this agent.
    AgentId
);
string_id!(
    /// Identity of an attached resource provider.
    ResourceProviderId
);
string_id!(
    /// Address of a controller process, e.g. `controller@10.0.0.1:5050`.
    ///
    /// Every controller message carries the endpoint it was sent from; the
    /// agent compares it against the leader it currently believes in.
    Endpoint
);

/// Identity of an isolation boundary.
///
/// Boundaries may be nested: a child keeps a link to its parent so the full
/// chain can be walked from any level.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerId {
    value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<Box<ContainerId>>,
}

impl ContainerId {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            parent: None,
        }
    }

    /// Fresh top-level identity.
    pub fn random() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    /// Child boundary living inside `self`.
    pub fn child(&self, value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            parent: Some(Box::new(self.clone())),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn parent(&self) -> Option<&ContainerId> {
        self.parent.as_deref()
    }

    /// Outermost ancestor (or `self` for a top-level boundary).
    pub fn root(&self) -> &ContainerId {
        let mut current = self;
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    /// Values from the outermost ancestor down to `self`.
    pub fn lineage(&self) -> Vec<&str> {
        let mut chain = vec![self.value.as_str()];
        let mut current = self;
        while let Some(parent) = current.parent() {
            chain.push(parent.value.as_str());
            current = parent;
        }
        chain.reverse();
        chain
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.lineage().join("."))
    }
}

/// Identifier stamped on every status update.
///
/// Retransmissions reuse the identifier, so the controller can deduplicate
/// and acknowledge any copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpdateUuid(Uuid);

impl UpdateUuid {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for UpdateUuid {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for UpdateUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lineage_walks_from_root() {
        let root = ContainerId::new("a9dd");
        let nested = root.child("4e3a").child("77f0");

        assert_eq!(nested.lineage(), vec!["a9dd", "4e3a", "77f0"]);
        assert_eq!(nested.root(), &root);
        assert_eq!(nested.to_string(), "a9dd.4e3a.77f0");
        assert_eq!(root.lineage(), vec!["a9dd"]);
    }

    #[test]
    fn nested_identity_roundtrips_through_json() {
        let nested = ContainerId::new("outer").child("inner");
        let json = serde_json::to_string(&nested).unwrap();
        let back: ContainerId = serde_json::from_str(&json).unwrap();

        assert_eq!(back, nested);
        assert_eq!(back.parent().map(ContainerId::value), Some("outer"));
    }

    #[test]
    fn string_ids_are_transparent() {
        let id = TaskId::from("task-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""task-1""#);
        assert_eq!(id.to_string(), "task-1");
    }
}
