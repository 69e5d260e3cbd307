use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};
use crate::id::ResourceProviderId;

/// One scalar resource, optionally owned by a resource provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub name: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ResourceProviderId>,
}

impl Resource {
    pub fn scalar(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            provider: None,
        }
    }

    pub fn with_provider(mut self, provider: ResourceProviderId) -> Self {
        self.provider = Some(provider);
        self
    }

    fn same_pool(&self, other: &Resource) -> bool {
        self.name == other.name && self.provider == other.provider
    }
}

/// Bag of scalar resources.
///
/// Entries with the same name and provider are folded together, so the
/// order of additions does not matter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resources(Vec<Resource>);

impl Resources {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.0.iter()
    }

    /// Adds one resource, folding it into an existing entry of the same pool.
    pub fn push(&mut self, resource: Resource) {
        match self.0.iter_mut().find(|r| r.same_pool(&resource)) {
            Some(existing) => existing.value += resource.value,
            None => self.0.push(resource),
        }
    }

    pub fn add(&mut self, other: &Resources) {
        for r in other.iter() {
            self.push(r.clone());
        }
    }

    pub fn sum<'a>(items: impl IntoIterator<Item = &'a Resources>) -> Resources {
        let mut total = Resources::new();
        for item in items {
            total.add(item);
        }
        total
    }

    /// Total amount of `name` across all pools.
    pub fn get(&self, name: &str) -> f64 {
        self.0
            .iter()
            .filter(|r| r.name == name)
            .map(|r| r.value)
            .sum()
    }

    /// Providers referenced by any entry.
    pub fn providers(&self) -> BTreeSet<ResourceProviderId> {
        self.0.iter().filter_map(|r| r.provider.clone()).collect()
    }

    /// Parses the `name:value;name:value` shorthand used in configuration.
    pub fn parse(input: &str) -> ModelResult<Self> {
        let mut out = Resources::new();
        for entry in input.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let (name, value) = entry.split_once(':').ok_or_else(|| invalid(input, "expected name:value"))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(invalid(input, "empty resource name"));
            }
            let value: f64 = value
                .trim()
                .parse()
                .map_err(|_| invalid(input, "value is not a number"))?;
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(input, "value must be a non-negative number"));
            }
            out.push(Resource::scalar(name, value));
        }
        Ok(out)
    }
}

fn invalid(input: &str, reason: &str) -> ModelError {
    ModelError::InvalidResources {
        input: input.to_string(),
        reason: reason.to_string(),
    }
}

impl FromStr for Resources {
    type Err = ModelError;
    fn from_str(s: &str) -> ModelResult<Self> {
        Resources::parse(s)
    }
}

impl FromIterator<Resource> for Resources {
    fn from_iter<I: IntoIterator<Item = Resource>>(iter: I) -> Self {
        let mut out = Resources::new();
        for r in iter {
            out.push(r);
        }
        out
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            match &r.provider {
                Some(p) => write!(f, "{}({}):{}", r.name, p, r.value)?,
                None => write!(f, "{}:{}", r.name, r.value)?,
            }
        }
        Ok(())
    }
}
