use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Opaque key/value tags a framework attaches to tasks and executors.
/// The agent carries them through to snapshots and checkpoints untouched.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Later values win on duplicate keys.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Labels {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TaskInfo;

    #[test]
    fn labels_ride_along_on_task_json() {
        let task: TaskInfo = serde_json::from_value(serde_json::json!({
            "taskId": "t1",
            "labels": { "team": "storage", "tier": "batch" }
        }))
        .unwrap();
        assert_eq!(task.labels.len(), 2);
        assert_eq!(task.labels.get("team"), Some("storage"));

        let unlabeled = serde_json::to_value(TaskInfo { labels: Labels::default(), ..task }).unwrap();
        assert!(unlabeled.get("labels").is_none());
    }

    #[test]
    fn later_values_win() {
        let labels: Labels = [("k", "a")].into_iter().collect();
        assert_eq!(labels.with("k", "b").get("k"), Some("b"));
    }
}
