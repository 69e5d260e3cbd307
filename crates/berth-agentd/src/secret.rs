use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;

use berth_core::collab::{Principal, Secret, SecretGenerator};
use berth_core::error::CoreError;

const TOKEN_BYTES: usize = 32;

/// Opaque random bearer tokens, one per executor launch.
#[derive(Debug, Default)]
pub struct RandomTokens;

#[async_trait]
impl SecretGenerator for RandomTokens {
    async fn generate(&self, _principal: &Principal) -> Result<Secret, CoreError> {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        Ok(Secret::Value(URL_SAFE_NO_PAD.encode(bytes).into_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use berth_core::collab::secret_value;

    use super::*;

    #[tokio::test]
    async fn tokens_are_distinct_and_printable() {
        let principal = Principal {
            value: "fw/exec".into(),
            claims: BTreeMap::new(),
        };
        let a = secret_value(RandomTokens.generate(&principal).await.unwrap()).unwrap();
        let b = secret_value(RandomTokens.generate(&principal).await.unwrap()).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a.iter().all(|c| c.is_ascii_alphanumeric() || *c == b'-' || *c == b'_'));
    }
}
