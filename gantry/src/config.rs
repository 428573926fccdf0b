use controller::config::Config as ControllerConfig;
use proxy::config::Config as ProxyConfig;
use serde::Deserialize;
use std::fs::File;

#[derive(Debug, Deserialize)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub sentry_dsn: String,
}

#[derive(Debug, Deserialize)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub controller: Option<ControllerConfig>,
    pub proxy: Option<ProxyConfig>,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    Load(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp_file(contents: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(contents.as_bytes()).expect("write temp file");
        tmp
    }

    #[test]
    fn full_config_parses() {
        let tmp = write_tmp_file(
            r#"
metrics:
  statsd_host: 127.0.0.1
  statsd_port: 8125
controller:
  listener: { host: 127.0.0.1, port: 18080 }
  source:
    type: file
    path: /etc/gantry/snapshot.yaml
proxy:
  listener: { host: 0.0.0.0, port: 8080 }
  admin_listener: { host: 127.0.0.1, port: 8081 }
  publisher_url: http://127.0.0.1:18080
  sync_interval_secs: 1
"#,
        );

        let config = Config::from_file(tmp.path()).unwrap();
        assert!(config.common.metrics.is_some());
        assert!(config.common.logging.is_none());

        let controller = config.controller.unwrap();
        assert_eq!(controller.listener.port, 18080);

        let proxy = config.proxy.unwrap();
        assert_eq!(proxy.publisher_url, "http://127.0.0.1:18080");
        assert!(proxy.enable_dynamic_servers);
        assert_eq!(proxy.force_sync_interval_secs, 30);
    }

    #[test]
    fn sections_are_optional() {
        let tmp = write_tmp_file(
            r#"
controller:
  listener: { host: 127.0.0.1, port: 18080 }
  source:
    type: file
    path: /tmp/snapshot.yaml
"#,
        );
        let config = Config::from_file(tmp.path()).unwrap();
        assert!(config.proxy.is_none());
        assert!(config.controller.is_some());
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let tmp = write_tmp_file("{{{{");
        assert!(matches!(
            Config::from_file(tmp.path()),
            Err(ConfigError::Parse(_))
        ));
    }
}
