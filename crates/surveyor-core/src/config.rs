//! surveyor.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::report::NodeIdentity;

/// Result type alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SurveyorConfig {
    /// Prefix for every exported metric and label name.
    pub namespace: String,
    pub listen_address: String,
    pub listen_port: u16,
    pub transport: TransportConfig,
    /// Privileged identity for the system subject. Absent means the survey
    /// runs in basic scope and core stats are not exported.
    pub system_account: Option<SystemAccountConfig>,
    pub survey: SurveyConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub connect_timeout: String,
    pub inbox_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemAccountConfig {
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SurveyConfig {
    /// How long a survey collects replies.
    pub timeout: String,
    /// Scrapes inside this window reuse the last survey.
    pub min_interval: String,
    /// How long a scrape waits on an in-flight survey.
    pub scrape_timeout: String,
    /// Stop collecting early once this many servers answered.
    pub expected_servers: Option<usize>,
    /// Servers that should always be reported, even before they first answer.
    pub expected_members: Vec<NodeIdentity>,
    pub full_subject: String,
    pub basic_subject: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub user: Option<String>,
    pub password: Option<String>,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// Client CA; when set, clients must present a certificate it signed.
    pub ca_file: Option<PathBuf>,
}

impl Default for SurveyorConfig {
    fn default() -> Self {
        Self {
            namespace: "nats".to_string(),
            listen_address: "0.0.0.0".to_string(),
            listen_port: 7777,
            transport: TransportConfig::default(),
            system_account: None,
            survey: SurveyConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "surveyor".to_string(),
            connect_timeout: "5s".to_string(),
            inbox_prefix: "surveyor/_INBOX/".to_string(),
        }
    }
}

impl Default for SurveyConfig {
    fn default() -> Self {
        Self {
            timeout: "3s".to_string(),
            min_interval: "1s".to_string(),
            scrape_timeout: "10s".to_string(),
            expected_servers: None,
            expected_members: Vec::new(),
            full_subject: "surveyor/sys/req/server/ping".to_string(),
            basic_subject: "surveyor/req/server/ping".to_string(),
        }
    }
}

impl SurveyorConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: SurveyorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.namespace.is_empty()
            || !self
                .namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
            || self.namespace.starts_with(|c: char| c.is_ascii_digit())
        {
            return Err(ConfigError::Invalid {
                field: "namespace",
                reason: format!("{:?} is not a valid metric prefix", self.namespace),
            });
        }

        if self.survey.timeout()?.is_zero() {
            return Err(ConfigError::Invalid {
                field: "survey.timeout",
                reason: "must be greater than zero".to_string(),
            });
        }
        self.survey.min_interval()?;
        self.survey.scrape_timeout()?;
        self.transport.connect_timeout()?;

        if self.survey.expected_servers == Some(0) {
            return Err(ConfigError::Invalid {
                field: "survey.expected_servers",
                reason: "must be at least 1 when set".to_string(),
            });
        }

        if self.http.user.is_some() != self.http.password.is_some() {
            return Err(ConfigError::Invalid {
                field: "http",
                reason: "user and password must be set together".to_string(),
            });
        }

        Ok(())
    }

    /// The subject surveys are sent on, given whether a privileged identity
    /// is configured.
    pub fn survey_subject(&self) -> &str {
        if self.system_account.is_some() {
            &self.survey.full_subject
        } else {
            &self.survey.basic_subject
        }
    }

    /// Basic-auth credentials for the metrics endpoint, if configured.
    pub fn http_credentials(&self) -> Option<(&str, &str)> {
        match (&self.http.user, &self.http.password) {
            (Some(user), Some(password)) => Some((user, password)),
            _ => None,
        }
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

impl SurveyConfig {
    pub fn timeout(&self) -> ConfigResult<Duration> {
        duration_field("survey.timeout", &self.timeout)
    }

    pub fn min_interval(&self) -> ConfigResult<Duration> {
        duration_field("survey.min_interval", &self.min_interval)
    }

    pub fn scrape_timeout(&self) -> ConfigResult<Duration> {
        duration_field("survey.scrape_timeout", &self.scrape_timeout)
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> ConfigResult<Duration> {
        duration_field("transport.connect_timeout", &self.connect_timeout)
    }
}

fn duration_field(field: &'static str, value: &str) -> ConfigResult<Duration> {
    parse_duration(value).ok_or_else(|| ConfigError::Invalid {
        field,
        reason: format!("{value:?} is not a duration"),
    })
}

/// Parse a duration string like "5s", "500ms", "1m". A bare number is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SurveyorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.namespace, "nats");
        assert_eq!(config.listen_port, 7777);
        assert_eq!(config.survey.timeout().unwrap(), Duration::from_secs(3));
        assert_eq!(config.survey_subject(), "surveyor/req/server/ping");
        assert!(config.http_credentials().is_none());
    }

    #[test]
    fn parse_minimal() {
        let config = SurveyorConfig::from_toml_str("").unwrap();
        assert_eq!(config.listen_address, "0.0.0.0");
    }

    #[test]
    fn parse_full() {
        let toml_str = r#"
namespace = "mq"
listen_port = 9000

[transport]
host = "broker.local"
port = 8883

[system_account]
user = "sys"
password = "pw"

[survey]
timeout = "500ms"
min_interval = "2s"
expected_servers = 3

[[survey.expected_members]]
server_id = "NSRV1"
server_name = "n1"
cluster = "c1"
host = "10.0.0.1"

[http]
user = "colin"
password = "secret"

[http.tls]
cert_file = "server-cert.pem"
key_file = "server-key.pem"
ca_file = "ca.pem"
"#;
        let config = SurveyorConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.namespace, "mq");
        assert_eq!(config.transport.host, "broker.local");
        assert_eq!(config.survey.timeout().unwrap(), Duration::from_millis(500));
        assert_eq!(config.survey.expected_servers, Some(3));
        assert_eq!(config.survey.expected_members.len(), 1);
        assert_eq!(config.survey_subject(), "surveyor/sys/req/server/ping");
        assert_eq!(config.http_credentials(), Some(("colin", "secret")));
        assert!(config.http.tls.unwrap().ca_file.is_some());
    }

    #[test]
    fn rejects_half_configured_basic_auth() {
        let err = SurveyorConfig::from_toml_str("[http]\nuser = \"colin\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "http", .. }));
    }

    #[test]
    fn rejects_bad_namespace() {
        let mut config = SurveyorConfig::default();
        config.namespace = "my-ns".to_string();
        assert!(config.validate().is_err());

        config.namespace = "9lives".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_durations() {
        let err = SurveyorConfig::from_toml_str("[survey]\ntimeout = \"soon\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "survey.timeout", .. }));

        let err = SurveyorConfig::from_toml_str("[survey]\ntimeout = \"0s\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "survey.timeout", .. }));

        let err = SurveyorConfig::from_toml_str("[survey]\nmin_interval = \"307445734561825861m\"\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "survey.min_interval", .. }));
    }

    #[test]
    fn config_written_out_loads_back() {
        let config = SurveyorConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        let parsed = SurveyorConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(parsed.survey.full_subject, config.survey.full_subject);
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("fast"), None);
    }
}
