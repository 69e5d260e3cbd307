use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::CoreError;

/// Environment variable through which executors receive their token.
pub const AUTHENTICATION_TOKEN_ENV: &str = "BERTH_EXECUTOR_AUTHENTICATION_TOKEN";

/// Identity a token is minted for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub value: String,
    pub claims: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Secret {
    Value(Vec<u8>),
    Reference { name: String, key: Option<String> },
}

#[async_trait]
pub trait SecretGenerator: Send + Sync + 'static {
    async fn generate(&self, principal: &Principal) -> Result<Secret, CoreError>;
}

/// Extracts an inline token, rejecting references and empty values.
pub fn secret_value(secret: Secret) -> Result<Vec<u8>, String> {
    match secret {
        Secret::Reference { .. } => Err(
            "Expecting generated secret to be of VALUE type instead of REFERENCE type".to_string(),
        ),
        Secret::Value(bytes) if bytes.is_empty() => {
            Err("Generated secret has an empty value".to_string())
        }
        Secret::Value(bytes) => Ok(bytes),
    }
}
