use std::{path::PathBuf, time::Duration};

use clap::Parser;
use vigil_alert::EvaluatorConfig;
use vigil_metrics::WindowConfig;

#[derive(Debug, Parser)]
#[command(name = "vigil", about = "Embedded metrics aggregation and alerting engine")]
pub struct Cli {
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, default_value = "9464")]
    pub port: u16,

    /// Width of one aggregation bucket.
    #[arg(long, default_value_t = 10)]
    pub bucket_secs: u64,

    /// Number of buckets retained per series.
    #[arg(long, default_value_t = 60)]
    pub buckets: usize,

    #[arg(long, default_value_t = 15)]
    pub eval_interval_secs: u64,

    #[arg(long, default_value_t = 300)]
    pub staleness_secs: u64,

    /// Re-send firing notifications at this cadence. Off when unset.
    #[arg(long)]
    pub repeat_interval_secs: Option<u64>,

    /// Registry-wide ceiling on labeled series.
    #[arg(long)]
    pub max_series: Option<usize>,

    /// JSON file with alert rules.
    #[arg(long)]
    pub rules: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub window: WindowConfig,
    pub evaluator: EvaluatorConfig,
    pub max_series: Option<usize>,
    pub rules_file: Option<PathBuf>,
}

impl ServerConfig {
    /// Command-line values win; `VIGIL_RULES_FILE` and `VIGIL_MAX_SERIES`
    /// fill in what the command line leaves unset.
    pub fn from_cli(cli: Cli) -> Self {
        let rules_file = cli.rules.or_else(|| {
            env_value("VIGIL_RULES_FILE").map(PathBuf::from)
        });
        let max_series = cli.max_series.or_else(|| {
            env_value("VIGIL_MAX_SERIES").and_then(|value| value.parse().ok())
        });

        Self {
            host: cli.host,
            port: cli.port,
            window: WindowConfig {
                bucket_width: Duration::from_secs(cli.bucket_secs.max(1)),
                bucket_count: cli.buckets.max(1),
            },
            evaluator: EvaluatorConfig {
                interval: Duration::from_secs(cli.eval_interval_secs.max(1)),
                staleness_threshold: Duration::from_secs(cli.staleness_secs),
                repeat_interval: cli
                    .repeat_interval_secs
                    .filter(|secs| *secs > 0)
                    .map(Duration::from_secs),
            },
            max_series,
            rules_file,
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9464,
            window: WindowConfig::default(),
            evaluator: EvaluatorConfig::default(),
            max_series: None,
            rules_file: None,
        }
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
