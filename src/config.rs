use std::{path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use color_eyre::eyre::{Context, eyre};

// CLI configuration for porthole.
#[doc(hidden)]
#[derive(Debug, Parser, PartialEq)]
#[command(version, about, long_about = None)]
pub struct ApplicationConfig {
    /// The public apex domain of the application.
    /// Tunnels are served under `<subdomain>.<domain>`.
    #[arg(long, env = "DOMAIN", default_value = "localhost", value_parser = validate_domain)]
    pub domain: String,

    /// Shared password required for SSH authentication.
    /// An empty value disables authentication entirely.
    #[arg(long, env = "PASSWORD", default_value = "", hide_env_values = true)]
    pub password: String,

    /// File containing the server's private host key.
    #[arg(long, default_value_os = "id_rsa", value_name = "FILE")]
    pub private_key_file: PathBuf,

    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0", value_name = "ADDRESS")]
    pub listen_address: String,

    /// Port to listen on for SSH control connections.
    #[arg(long, default_value_t = 2222, value_name = "PORT")]
    pub ssh_port: u16,

    /// Port to listen on for public HTTP traffic.
    #[arg(long, default_value_t = 2280, value_name = "PORT")]
    pub http_port: u16,

    /// Time until an outgoing HTTP request is automatically canceled.
    ///
    /// By default, outgoing requests are not terminated by porthole.
    #[arg(long, value_parser = validate_duration, value_name = "DURATION")]
    pub http_request_timeout: Option<Duration>,

    /// How long in-flight HTTP requests are given to finish on shutdown.
    #[arg(
        long,
        default_value = "30s",
        value_parser = validate_duration,
        value_name = "DURATION"
    )]
    pub graceful_shutdown_timeout: Duration,
}

fn validate_domain(value: &str) -> color_eyre::Result<String> {
    if value.is_empty()
        || value.starts_with('.')
        || value.ends_with('.')
        || value.contains(|c: char| c.is_whitespace() || c == ':' || c == '/')
    {
        return Err(eyre!("invalid domain"));
    }
    Ok(value.to_string())
}

fn validate_duration(value: &str) -> color_eyre::Result<Duration> {
    Ok(humantime::Duration::from_str(value)
        .with_context(|| "invalid duration")?
        .into())
}

#[cfg(test)]
mod application_config_tests {
    use std::time::Duration;

    use clap::Parser;

    use super::ApplicationConfig;

    #[test]
    fn parses_defaults() {
        let config = ApplicationConfig::try_parse_from(["porthole"]).unwrap();
        assert_eq!(
            config,
            ApplicationConfig {
                domain: "localhost".into(),
                password: "".into(),
                private_key_file: "id_rsa".into(),
                listen_address: "0.0.0.0".into(),
                ssh_port: 2222,
                http_port: 2280,
                http_request_timeout: None,
                graceful_shutdown_timeout: Duration::from_secs(30),
            }
        );
    }

    #[test]
    fn parses_all_options() {
        let config = ApplicationConfig::try_parse_from([
            "porthole",
            "--domain=tunnel.example.com",
            "--password=hunter2",
            "--private-key-file=/etc/porthole/host_key",
            "--listen-address=127.0.0.1",
            "--ssh-port=18022",
            "--http-port=18080",
            "--http-request-timeout=15s",
            "--graceful-shutdown-timeout=5s",
        ])
        .unwrap();
        assert_eq!(
            config,
            ApplicationConfig {
                domain: "tunnel.example.com".into(),
                password: "hunter2".into(),
                private_key_file: "/etc/porthole/host_key".into(),
                listen_address: "127.0.0.1".into(),
                ssh_port: 18022,
                http_port: 18080,
                http_request_timeout: Some(Duration::from_secs(15)),
                graceful_shutdown_timeout: Duration::from_secs(5),
            }
        );
    }

    #[test]
    fn fails_to_parse_if_invalid_domain() {
        assert!(ApplicationConfig::try_parse_from(["porthole", "--domain=.example.com"]).is_err());
    }

    #[test]
    fn fails_to_parse_if_invalid_duration() {
        assert!(
            ApplicationConfig::try_parse_from(["porthole", "--http-request-timeout=42"]).is_err()
        );
    }
}
