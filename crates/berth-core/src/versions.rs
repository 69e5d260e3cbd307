use std::collections::BTreeMap;

use berth_model::{ProviderState, ResourceProviderId, ResourceVersion, ResourceVersionEntry, Resources};

/// Resource version bookkeeping: one version for the agent's own resources
/// and one per attached resource provider.
#[derive(Debug, Clone)]
pub struct ResourceVersionBook {
    agent: ResourceVersion,
    providers: BTreeMap<ResourceProviderId, ProviderState>,
}

impl Default for ResourceVersionBook {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceVersionBook {
    pub fn new() -> Self {
        Self {
            agent: ResourceVersion::random(),
            providers: BTreeMap::new(),
        }
    }

    pub fn agent_version(&self) -> ResourceVersion {
        self.agent
    }

    /// Versions as advertised to the controller, agent entry first.
    pub fn entries(&self) -> Vec<ResourceVersionEntry> {
        let mut entries = vec![ResourceVersionEntry {
            provider: None,
            version: self.agent,
        }];
        entries.extend(self.providers.values().map(|p| ResourceVersionEntry {
            provider: Some(p.provider.clone()),
            version: p.version,
        }));
        entries
    }

    pub fn providers(&self) -> Vec<ProviderState> {
        self.providers.values().cloned().collect()
    }

    /// Checks that every provider backing `resources` is still at the
    /// version the controller saw. Agent-owned resources are not checked.
    pub fn validate(&self, resources: &Resources, claimed: &[ResourceVersionEntry]) -> Result<(), String> {
        for provider in resources.providers() {
            let Some(current) = self.providers.get(&provider) else {
                return Err(format!("unknown resource provider {provider}"));
            };
            let seen = claimed
                .iter()
                .find(|e| e.provider.as_ref() == Some(&provider))
                .map(|e| e.version);
            match seen {
                Some(version) if version == current.version => {}
                Some(version) => {
                    return Err(format!(
                        "resource provider {provider} is at version {}, operation expected {version}",
                        current.version
                    ));
                }
                None => {
                    return Err(format!("no resource version given for provider {provider}"));
                }
            }
        }
        Ok(())
    }

    /// Records a provider's state; `true` when anything changed.
    pub fn update_provider(&mut self, state: ProviderState) -> bool {
        if self.providers.get(&state.provider) == Some(&state) {
            return false;
        }
        self.providers.insert(state.provider.clone(), state);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_model::Resource;

    fn disk(provider: &str) -> Resources {
        let mut r = Resources::new();
        r.push(Resource::scalar("disk", 100.0).with_provider(ResourceProviderId::from(provider)));
        r
    }

    fn provider(id: &str, version: ResourceVersion) -> ProviderState {
        ProviderState {
            provider: ResourceProviderId::from(id),
            version,
            total: disk(id),
        }
    }

    #[test]
    fn agent_resources_need_no_version() {
        let book = ResourceVersionBook::new();
        let cpus: Resources = "cpus:1".parse().unwrap();
        assert!(book.validate(&cpus, &[]).is_ok());
        assert_eq!(book.entries().len(), 1);
    }

    #[test]
    fn stale_provider_version_is_rejected() {
        let mut book = ResourceVersionBook::new();
        let v1 = ResourceVersion::random();
        assert!(book.update_provider(provider("rp", v1)));
        assert!(!book.update_provider(provider("rp", v1)));

        let claimed = book.entries();
        assert!(book.validate(&disk("rp"), &claimed).is_ok());

        assert!(book.update_provider(provider("rp", ResourceVersion::random())));
        let err = book.validate(&disk("rp"), &claimed).unwrap_err();
        assert!(err.contains("rp"));

        assert!(book.validate(&disk("rp"), &[]).is_err());
        assert!(book.validate(&disk("other"), &book.entries()).is_err());
    }
}
