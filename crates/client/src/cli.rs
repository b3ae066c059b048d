use std::path::PathBuf;

use anyhow::Context;
use duet_protocol::DuetConfig;

#[derive(Debug)]
pub(crate) struct Args {
    pub config_path: PathBuf,
    pub session_id: String,
    pub partner_id: Option<String>,
    pub token: Option<String>,
    pub signaling_url: Option<String>,
    pub tls_cert_path: Option<String>,
    pub ice_provider: Option<String>,
    pub metrics_endpoint: Option<String>,
    pub no_audio: bool,
    pub no_video: bool,
    pub no_metrics: bool,
    /// Offer right away instead of waiting for room-ready.
    pub call_now: bool,
}

impl Args {
    /// Apply command-line overrides on top of the file configuration.
    pub fn apply(&self, config: &mut DuetConfig) {
        if let Some(url) = &self.signaling_url {
            config.signaling.url = url.clone();
        }
        if let Some(cert) = &self.tls_cert_path {
            config.signaling.tls_cert = Some(cert.clone());
        }
        if let Some(url) = &self.ice_provider {
            config.ice.provider_url = Some(url.clone());
        }
        if let Some(url) = &self.metrics_endpoint {
            config.metrics.endpoint = Some(url.clone());
        }
        if self.no_audio {
            config.media.audio = false;
        }
        if self.no_video {
            config.media.video = false;
        }
        if self.no_metrics {
            config.metrics.enabled = false;
        }
    }
}

fn print_help() {
    println!("duet-client - peer-to-peer video call client");
    println!();
    println!("USAGE:");
    println!("    duet-client --session-id <ID> [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <PATH>          Config file [default: ./config/duet.toml]");
    println!("    --session-id <ID>            Paired call session identifier (required)");
    println!("    --partner-id <ID>            Partner identity, for logging");
    println!("    --token <TOKEN>              Access token (prefer DUET_TOKEN env)");
    println!("    --signaling-url <URL>        Relay WebSocket URL (ws:// or wss://)");
    println!("    --tls-cert <PATH>            TLS certificate to pin for the relay connection");
    println!("    --ice-provider <URL>         HTTP endpoint serving ICE servers");
    println!("    --metrics-endpoint <URL>     Metrics collection endpoint");
    println!("    --no-audio                   Do not send audio");
    println!("    --no-video                   Do not send video");
    println!("    --no-metrics                 Disable connection metrics");
    println!("    --call-now                   Offer immediately instead of waiting for the partner");
    println!("    -V, --version                Print version and exit");
    println!("    -h, --help                   Print this help and exit");
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    parse_from(std::env::args().collect(), std::env::var("DUET_TOKEN").ok())
}

fn parse_from(args: Vec<String>, env_token: Option<String>) -> anyhow::Result<Args> {
    let mut config_path = PathBuf::from("./config/duet.toml");
    let mut session_id = None;
    let mut partner_id = None;
    let mut token = env_token.filter(|t| !t.is_empty());
    let mut signaling_url = None;
    let mut tls_cert_path = None;
    let mut ice_provider = None;
    let mut metrics_endpoint = None;
    let mut no_audio = false;
    let mut no_video = false;
    let mut no_metrics = false;
    let mut call_now = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("duet-client {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-c" | "--config" => {
                i += 1;
                config_path = PathBuf::from(args.get(i).context("Missing --config value")?);
            }
            "--session-id" => {
                i += 1;
                let id = args.get(i).context("Missing --session-id value")?;
                anyhow::ensure!(!id.trim().is_empty(), "Empty --session-id value");
                session_id = Some(id.clone());
            }
            "--partner-id" => {
                i += 1;
                partner_id = Some(args.get(i).context("Missing --partner-id value")?.clone());
            }
            "--token" => {
                i += 1;
                token = Some(args.get(i).context("Missing --token value")?.clone());
            }
            "--signaling-url" => {
                i += 1;
                signaling_url = Some(args.get(i).context("Missing --signaling-url value")?.clone());
            }
            "--tls-cert" => {
                i += 1;
                tls_cert_path = Some(args.get(i).context("Missing --tls-cert value")?.clone());
            }
            "--ice-provider" => {
                i += 1;
                ice_provider = Some(args.get(i).context("Missing --ice-provider value")?.clone());
            }
            "--metrics-endpoint" => {
                i += 1;
                metrics_endpoint = Some(
                    args.get(i)
                        .context("Missing --metrics-endpoint value")?
                        .clone(),
                );
            }
            "--no-audio" => no_audio = true,
            "--no-video" => no_video = true,
            "--no-metrics" => no_metrics = true,
            "--call-now" => call_now = true,
            other => anyhow::bail!("Unknown argument: {other} (see --help)"),
        }
        i += 1;
    }

    Ok(Args {
        config_path,
        session_id: session_id.context("--session-id is required")?,
        partner_id,
        token,
        signaling_url,
        tls_cert_path,
        ice_provider,
        metrics_endpoint,
        no_audio,
        no_video,
        no_metrics,
        call_now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("duet-client")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn session_id_is_required() {
        let err = parse_from(argv(&["--no-video"]), None).unwrap_err();
        assert!(err.to_string().contains("--session-id"));
    }

    #[test]
    fn flag_token_overrides_environment() {
        let args = parse_from(argv(&["--session-id", "s1"]), Some("env".into())).unwrap();
        assert_eq!(args.token.as_deref(), Some("env"));

        let args = parse_from(
            argv(&["--session-id", "s1", "--token", "flag"]),
            Some("env".into()),
        )
        .unwrap();
        assert_eq!(args.token.as_deref(), Some("flag"));
    }

    #[test]
    fn overrides_apply_to_config() {
        let args = parse_from(
            argv(&[
                "--session-id",
                "s1",
                "--signaling-url",
                "wss://relay.example/ws",
                "--no-video",
                "--no-metrics",
            ]),
            None,
        )
        .unwrap();
        let mut config = DuetConfig::default();
        args.apply(&mut config);
        assert_eq!(config.signaling.url, "wss://relay.example/ws");
        assert!(!config.media.video);
        assert!(config.media.audio);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn missing_value_and_unknown_flag_are_errors() {
        assert!(parse_from(argv(&["--session-id"]), None).is_err());
        assert!(parse_from(argv(&["--session-id", "s1", "--bogus"]), None).is_err());
    }
}
