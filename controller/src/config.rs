use serde::Deserialize;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum SourceConfig {
    /// Cluster snapshot read from a YAML file (development and tests).
    #[serde(rename = "file")]
    File { path: String },
}

fn default_sync_interval() -> u64 {
    3
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    pub listener: Listener,
    pub source: SourceConfig,
    /// How often the snapshot is re-read and the tables rebuilt.
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
}
