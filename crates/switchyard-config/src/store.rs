use secrecy::SecretString;
use serde::Deserialize;

/// Durable record store backend
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum StoreConfig {
    /// Process-local store, lost on restart
    #[default]
    Memory,
    /// Redis-backed store
    Redis(RedisStoreConfig),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisStoreConfig {
    /// Connection URL, may carry credentials
    pub url: SecretString,
    /// Prefix applied to every key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_key_prefix() -> String {
    "switchyard".to_string()
}
