use clap::{Args, Parser};
use metrics_exporter_statsd::StatsdBuilder;
use std::future::Future;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod config;
use config::{Config, MetricsConfig};

#[derive(Parser)]
enum CliCommand {
    /// Run the control plane: table builder plus configuration publisher.
    Controller(ControllerArgs),
    /// Run one data-plane worker.
    Proxy(ProxyArgs),
    /// Show all metrics definitions as markdown table
    ShowMetrics,
    /// Sync METRICS.md with current metric definitions
    SyncMetrics,
}

#[derive(Args, Debug, Clone)]
struct BaseArgs {
    #[arg(long)]
    config_file_path: PathBuf,
}

#[derive(Args, Debug, Clone)]
struct ControllerArgs {
    #[command(flatten)]
    base: BaseArgs,
}

#[derive(Args, Debug, Clone)]
struct ProxyArgs {
    #[command(flatten)]
    base: BaseArgs,
    /// Enables the dynamic virtual-host router; overrides the config
    /// file when given.
    #[arg(long)]
    enable_dynamic_servers: Option<bool>,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("Failed to load config file: {0}")]
    ConfigLoad(#[from] config::ConfigError),
    #[error("Invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("Failed to create runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

fn main() {
    init_tracing();

    if let Err(e) = cli() {
        tracing::error!(error = %e, "Startup error");
        std::process::exit(1);
    }
}

fn cli() -> Result<(), CliError> {
    let cmd = CliCommand::parse();

    match &cmd {
        CliCommand::Controller(args) => {
            let config = Config::from_file(&args.base.config_file_path)?;
            let _sentry_guard = init_sentry(config.common.logging);
            init_statsd_recorder("gantry.controller", config.common.metrics);

            let controller_config = config
                .controller
                .ok_or(CliError::InvalidConfig("Missing controller config"))?;

            run_async(controller::run(controller_config))
        }
        CliCommand::Proxy(args) => {
            let config = Config::from_file(&args.base.config_file_path)?;
            let _sentry_guard = init_sentry(config.common.logging);
            init_statsd_recorder("gantry.proxy", config.common.metrics);

            let mut proxy_config = config
                .proxy
                .ok_or(CliError::InvalidConfig("Missing proxy config"))?;
            if let Some(enabled) = args.enable_dynamic_servers {
                proxy_config.enable_dynamic_servers = enabled;
            }

            run_async(proxy::run(proxy_config))
        }
        CliCommand::ShowMetrics => {
            println!("{}", generate_metrics_table());
            Ok(())
        }
        CliCommand::SyncMetrics => {
            let path = "METRICS.md";
            let mut content = std::fs::read_to_string(path).expect("Failed to read METRICS.md");
            content = sync_section(&content, "GANTRY_METRICS", &generate_metrics_table());
            std::fs::write(path, content).expect("Failed to write METRICS.md");
            println!("Synced METRICS.md");
            Ok(())
        }
    }
}

fn sync_section(content: &str, name: &str, table: &str) -> String {
    let start_marker = format!("<!-- {}:START -->", name);
    let end_marker = format!("<!-- {}:END -->", name);

    let start_idx = content
        .find(&start_marker)
        .unwrap_or_else(|| panic!("Missing {} marker", start_marker));
    let end_idx = content
        .find(&end_marker)
        .unwrap_or_else(|| panic!("Missing {} marker", end_marker));

    format!(
        "{}{}\n{}\n{}{}",
        &content[..start_idx],
        start_marker,
        table,
        end_marker,
        &content[end_idx + end_marker.len()..]
    )
}

fn generate_metrics_table() -> String {
    let mut lines = vec![
        "| Metric | Type | Description |".to_string(),
        "|--------|------|-------------|".to_string(),
    ];
    for m in controller::metrics_defs::ALL_METRICS
        .iter()
        .chain(proxy::metrics_defs::ALL_METRICS)
    {
        lines.push(format!(
            "| `{}` | {} | {} |",
            m.name,
            m.metric_type.as_str(),
            m.description
        ));
    }
    lines.join("\n")
}

pub fn init_statsd_recorder(prefix: &str, metrics_config: Option<MetricsConfig>) {
    if let Some(MetricsConfig {
        statsd_host,
        statsd_port,
    }) = metrics_config
    {
        let recorder = StatsdBuilder::from(statsd_host, statsd_port)
            .build(Some(prefix))
            .expect("Could not create StatsdRecorder");

        metrics::set_global_recorder(recorder).expect("Could not set global metrics recorder")
    }
}

fn run_async(fut: impl Future<Output = Result<(), impl std::error::Error>>) -> Result<(), CliError> {
    // One worker per process; the data plane relies on the cooperative
    // single-threaded model.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    if let Err(e) = rt.block_on(fut) {
        tracing::error!(error = %e, "Runtime error");
        process::exit(1);
    }
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(sentry::integrations::tracing::layer())
        .init();
}

fn init_sentry(logging_config: Option<config::LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    // The tracing layer set up in main starts shipping events once this
    // client exists.
    logging_config.map(|cfg| {
        sentry::init((
            cfg.sentry_dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_table_lists_every_definition() {
        let table = generate_metrics_table();
        for def in controller::metrics_defs::ALL_METRICS
            .iter()
            .chain(proxy::metrics_defs::ALL_METRICS)
        {
            assert!(table.contains(def.name), "missing {}", def.name);
        }
    }

    #[test]
    fn sync_section_replaces_between_markers() {
        let content = "head\n<!-- GANTRY_METRICS:START -->\nold\n<!-- GANTRY_METRICS:END -->\ntail";
        let updated = sync_section(content, "GANTRY_METRICS", "new-table");
        assert!(updated.contains("new-table"));
        assert!(!updated.contains("\nold\n"));
        assert!(updated.starts_with("head\n"));
        assert!(updated.ends_with("\ntail"));
    }
}
