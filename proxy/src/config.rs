use serde::Deserialize;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

fn default_true() -> bool {
    true
}

fn default_sync_interval() -> u64 {
    1
}

fn default_force_sync_interval() -> u64 {
    30
}

fn default_external_name_interval() -> u64 {
    5
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    pub listener: Listener,
    pub admin_listener: Listener,
    /// Base URL of the controller's configuration publisher.
    pub publisher_url: String,
    /// Gates the dynamic virtual-host router; when off every request
    /// falls through to the static 404 fallback.
    #[serde(default = "default_true")]
    pub enable_dynamic_servers: bool,
    /// Cheap delta cadence: the publisher stamp is polled this often.
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    /// Hard refresh cadence: tables are re-fetched even without a stamp
    /// change.
    #[serde(default = "default_force_sync_interval")]
    pub force_sync_interval_secs: u64,
    /// Separate cadence for ExternalName re-resolution so DNS never sits
    /// on the polling path.
    #[serde(default = "default_external_name_interval")]
    pub external_name_sync_interval_secs: u64,
}
