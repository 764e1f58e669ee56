// Command line and environment configuration

use clap::{Parser, ValueEnum};
use k6hook_common::config::{
    LaunchConfig, DEFAULT_K6_BINARY, DEFAULT_LISTEN_PORT, DEFAULT_MAX_CONCURRENT_TESTS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Where Kubernetes secrets are read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KubernetesClient {
    /// Secret references in payloads are rejected
    None,
    /// Use the pod's service account
    InCluster,
}

#[derive(Debug, Parser)]
#[command(
    name = "k6hook-server",
    version,
    about = "Launches k6 load tests on behalf of Flagger webhooks"
)]
pub struct Cli {
    /// k6 cloud token used for `--out cloud` runs
    #[arg(long, env = "K6_CLOUD_TOKEN", hide_env_values = true)]
    pub cloud_token: Option<String>,

    #[arg(long, env = "LISTEN_PORT", default_value_t = DEFAULT_LISTEN_PORT)]
    pub listen_port: u16,

    /// Ignored when RUST_LOG is set
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Without a token, notifications are only logged
    #[arg(long, env = "SLACK_TOKEN", hide_env_values = true)]
    pub slack_token: Option<String>,

    #[arg(long, env = "KUBERNETES_CLIENT", value_enum, default_value_t = KubernetesClient::None)]
    pub kubernetes_client: KubernetesClient,

    /// Requests beyond this many tracked runs get a 429
    #[arg(
        long,
        env = "MAX_CONCURRENT_TESTS",
        default_value_t = DEFAULT_MAX_CONCURRENT_TESTS,
        value_parser = parse_capacity
    )]
    pub max_concurrent_tests: usize,

    #[arg(long, env = "K6_BINARY", default_value = DEFAULT_K6_BINARY)]
    pub k6_binary: String,
}

fn parse_capacity(raw: &str) -> Result<usize, String> {
    let value: usize = raw
        .parse()
        .map_err(|e| format!("invalid number {raw:?}: {e}"))?;
    if value == 0 {
        return Err("must be at least 1".to_string());
    }
    Ok(value)
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|value| !value.is_empty())
}

impl Cli {
    pub fn cloud_token(&self) -> Option<&str> {
        non_empty(&self.cloud_token)
    }

    pub fn slack_token(&self) -> Option<&str> {
        non_empty(&self.slack_token)
    }

    pub fn launch_config(&self) -> LaunchConfig {
        LaunchConfig::new(self.max_concurrent_tests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_explicit_flags() {
        let cli = Cli::try_parse_from([
            "k6hook-server",
            "--listen-port",
            "9000",
            "--log-format",
            "json",
            "--kubernetes-client",
            "in-cluster",
            "--max-concurrent-tests",
            "3",
            "--slack-token",
            "",
            "--cloud-token",
            "abc",
            "--k6-binary",
            "/usr/local/bin/k6",
        ])
        .unwrap();

        assert_eq!(cli.listen_port, 9000);
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.kubernetes_client, KubernetesClient::InCluster);
        assert_eq!(cli.launch_config().max_concurrent_tests, 3);
        assert_eq!(cli.slack_token(), None);
        assert_eq!(cli.cloud_token(), Some("abc"));
        assert_eq!(cli.k6_binary, "/usr/local/bin/k6");
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        assert!(Cli::try_parse_from(["k6hook-server", "--max-concurrent-tests", "0"]).is_err());
        assert!(Cli::try_parse_from(["k6hook-server", "--max-concurrent-tests", "lots"]).is_err());
    }
}
