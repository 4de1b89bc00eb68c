//! surveyord: the surveyor daemon.
//!
//! Connects to the broker, surveys every server on each scrape, and serves
//! the result as Prometheus metrics.
//!
//! # Usage
//!
//! ```text
//! surveyord run --config surveyor.toml --port 7777
//! surveyord default-config > surveyor.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::info;

use surveyor_api::Surveyor;
use surveyor_core::SurveyorConfig;
use surveyor_core::config::{SystemAccountConfig, TlsConfig};
use surveyor_transport::{MqttSettings, MqttTransport};

#[derive(Parser)]
#[command(name = "surveyord", about = "Cluster surveyor daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Survey the cluster and serve metrics until interrupted.
    Run(RunArgs),

    /// Print the default configuration as TOML.
    DefaultConfig,
}

/// Flags override values from the config file.
#[derive(Args, Default)]
struct RunArgs {
    /// Path to surveyor.toml.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long)]
    addr: Option<String>,

    /// Port to listen on.
    #[arg(long, short)]
    port: Option<u16>,

    /// Broker host.
    #[arg(long)]
    broker_host: Option<String>,

    /// Broker port.
    #[arg(long)]
    broker_port: Option<u16>,

    /// System account user; enables core stats.
    #[arg(long, requires = "system_password")]
    system_user: Option<String>,

    /// System account password.
    #[arg(long, requires = "system_user")]
    system_password: Option<String>,

    /// How long each survey waits for replies, e.g. "3s".
    #[arg(long)]
    timeout: Option<String>,

    /// Stop a survey early once this many servers answered.
    #[arg(long, short = 'n')]
    expected: Option<usize>,

    /// Metric name prefix.
    #[arg(long)]
    namespace: Option<String>,

    /// Basic-auth user for /metrics.
    #[arg(long)]
    http_user: Option<String>,

    /// Basic-auth password for /metrics.
    #[arg(long)]
    http_password: Option<String>,

    /// TLS certificate for the listener.
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// TLS private key for the listener.
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// CA for client certificates.
    #[arg(long, requires = "tls_cert")]
    tls_ca: Option<PathBuf>,
}

impl RunArgs {
    fn apply(self, config: &mut SurveyorConfig) {
        if let Some(addr) = self.addr {
            config.listen_address = addr;
        }
        if let Some(port) = self.port {
            config.listen_port = port;
        }
        if let Some(host) = self.broker_host {
            config.transport.host = host;
        }
        if let Some(port) = self.broker_port {
            config.transport.port = port;
        }
        if let (Some(user), Some(password)) = (self.system_user, self.system_password) {
            config.system_account = Some(SystemAccountConfig { user, password });
        }
        if let Some(timeout) = self.timeout {
            config.survey.timeout = timeout;
        }
        if let Some(expected) = self.expected {
            config.survey.expected_servers = Some(expected);
        }
        if let Some(namespace) = self.namespace {
            config.namespace = namespace;
        }
        if self.http_user.is_some() {
            config.http.user = self.http_user;
        }
        if self.http_password.is_some() {
            config.http.password = self.http_password;
        }
        if let (Some(cert_file), Some(key_file)) = (self.tls_cert, self.tls_key) {
            config.http.tls = Some(TlsConfig {
                cert_file,
                key_file,
                ca_file: self.tls_ca,
            });
        }
    }
}

fn mqtt_settings(config: &SurveyorConfig) -> anyhow::Result<MqttSettings> {
    Ok(MqttSettings {
        host: config.transport.host.clone(),
        port: config.transport.port,
        client_id: config.transport.client_id.clone(),
        credentials: config
            .system_account
            .as_ref()
            .map(|a| (a.user.clone(), a.password.clone())),
        connect_timeout: config.transport.connect_timeout()?,
        inbox_prefix: config.transport.inbox_prefix.clone(),
        ..MqttSettings::default()
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,surveyord=debug,surveyor=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::DefaultConfig => {
            print!("{}", SurveyorConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => SurveyorConfig::from_file(path)?,
        None => SurveyorConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    info!(
        broker = %format!("{}:{}", config.transport.host, config.transport.port),
        system_account = config.system_account.is_some(),
        "surveyor starting"
    );

    let transport = MqttTransport::connect(mqtt_settings(&config)?)
        .await
        .context("cannot reach the broker")?;

    let mut surveyor = Surveyor::new(config, Arc::new(transport))?;
    let addr = surveyor.start().await?;
    info!(%addr, "surveyor running");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    surveyor.stop().await;
    Ok(())
}
