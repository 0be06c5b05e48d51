/// cache client configuration
///
use serde::{Deserialize, Serialize};

/// Recognized options for a cache client instance.  All fields have
/// defaults so a config file only needs to override what it cares about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// broker host
    pub host: String,
    /// broker port
    pub port: u16,
    /// broker credentials
    pub username: String,
    pub password: String,
    /// broker virtual host
    pub virtual_host: String,
    /// name of the topic exchange used for store/load/clear requests
    pub object_request_exchange: String,
    /// name of the fanout exchange used for ping/pong liveness messages
    pub heartbeat_exchange: String,
    /// how often the reconciler snapshots the node set and sweeps
    /// expired load registrations, in milliseconds
    pub heartbeat_interval_ms: u64,
    /// how many sender and response-monitor tasks to run per queue
    pub max_workers: usize,
    /// how long a load registration waits before it times out, in milliseconds
    pub load_timeout_ms: u64,
    /// this instance's id; doubles as the private response queue name
    pub instance_id: String,
}

impl Default for CacheConfig {
    fn default() -> CacheConfig {
        CacheConfig {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            virtual_host: "/".to_string(),
            object_request_exchange: "amq.topic".to_string(),
            heartbeat_exchange: "amq.fanout".to_string(),
            heartbeat_interval_ms: 3_000,
            max_workers: 3,
            load_timeout_ms: 3_000,
            instance_id: generate_instance_id(),
        }
    }
}

impl CacheConfig {
    /// parse a config from a json string; missing fields get defaults
    pub fn from_json(json: &str) -> anyhow::Result<CacheConfig> {
        let config = serde_json::from_str(json)?;
        Ok(config)
    }
}

/// generate a random hex instance id, e.g. `cache-9f41c02a77b3d6e8`
pub fn generate_instance_id() -> String {
    format!("cache-{:08x}{:08x}", fastrand::u32(..), fastrand::u32(..))
}
