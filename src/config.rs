use crate::error::{MeterError, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub exporter: ExporterConfig,
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub zookeeper: ZookeeperConfig,
    #[serde(default)]
    pub filters: FilterConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ExporterConfig {
    #[serde(default = "default_http_host")]
    pub http_host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Constant labels attached to every metric, as `k1=v1,k2=v2`.
    #[serde(default)]
    pub labels: String,
    #[serde(with = "humantime_serde", default = "default_metadata_refresh")]
    pub metadata_refresh_interval: Duration,
    #[serde(default = "default_true")]
    pub offset_show_all: bool,
    #[serde(default = "default_topic_workers")]
    pub topic_workers: usize,
    #[serde(default)]
    pub allow_concurrent: bool,
    /// Samples retained per (group, topic, partition) in the offset timeline.
    #[serde(default = "default_max_offsets")]
    pub max_offsets: usize,
    #[serde(with = "humantime_serde", default = "default_prune_interval")]
    pub prune_interval: Duration,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct KafkaConfig {
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,
    #[serde(default = "default_kafka_version")]
    pub version: String,
    #[serde(default)]
    pub allow_auto_topic_creation: bool,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub sasl: SaslConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub ca_file: Option<String>,
    #[serde(default)]
    pub cert_file: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct SaslConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sasl_mechanism")]
    pub mechanism: String,
    #[serde(default = "default_true")]
    pub handshake: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub disable_pafx_fast: bool,
    #[serde(default)]
    pub kerberos: KerberosConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct KerberosConfig {
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub realm: String,
    #[serde(default)]
    pub config_path: String,
    #[serde(default)]
    pub keytab_path: String,
    #[serde(default = "default_kerberos_auth_type")]
    pub auth_type: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct ZookeeperConfig {
    /// Enables the legacy Zookeeper consumer-group lag metric.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub servers: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    #[serde(default = "default_include")]
    pub topic_include: String,
    #[serde(default = "default_exclude")]
    pub topic_exclude: String,
    #[serde(default = "default_include")]
    pub group_include: String,
    #[serde(default = "default_exclude")]
    pub group_exclude: String,
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    9308
}

fn default_metadata_refresh() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

fn default_topic_workers() -> usize {
    100
}

fn default_max_offsets() -> usize {
    1000
}

fn default_prune_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

fn default_kafka_version() -> String {
    "2.0.0".to_string()
}

fn default_sasl_mechanism() -> String {
    "plain".to_string()
}

fn default_kerberos_auth_type() -> String {
    "user".to_string()
}

fn default_include() -> String {
    ".*".to_string()
}

// Matches nothing, so an unset exclude admits everything the include admits.
fn default_exclude() -> String {
    "^$".to_string()
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            http_host: default_http_host(),
            http_port: default_http_port(),
            labels: String::new(),
            metadata_refresh_interval: default_metadata_refresh(),
            offset_show_all: true,
            topic_workers: default_topic_workers(),
            allow_concurrent: false,
            max_offsets: default_max_offsets(),
            prune_interval: default_prune_interval(),
        }
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            version: default_kafka_version(),
            allow_auto_topic_creation: false,
            tls: TlsConfig::default(),
            sasl: SaslConfig::default(),
        }
    }
}

impl Default for SaslConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mechanism: default_sasl_mechanism(),
            handshake: true,
            username: String::new(),
            password: String::new(),
            disable_pafx_fast: false,
            kerberos: KerberosConfig::default(),
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            topic_include: default_include(),
            topic_exclude: default_exclude(),
            group_include: default_include(),
            group_exclude: default_exclude(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    Plain,
    ScramSha256,
    ScramSha512,
    Gssapi,
}

impl SaslMechanism {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "plain" => Ok(SaslMechanism::Plain),
            "scram-sha256" => Ok(SaslMechanism::ScramSha256),
            "scram-sha512" => Ok(SaslMechanism::ScramSha512),
            "gssapi" => Ok(SaslMechanism::Gssapi),
            other => Err(MeterError::Config(format!(
                "invalid sasl mechanism {other:?}: must be one of \"plain\", \"scram-sha256\", \"scram-sha512\", \"gssapi\""
            ))),
        }
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
            SaslMechanism::Gssapi => "GSSAPI",
        }
    }
}

impl Config {
    pub fn load(path: Option<&str>) -> Result<Config> {
        let config_path = path.unwrap_or("config.toml");

        if !Path::new(config_path).exists() {
            return Err(MeterError::Config(format!(
                "configuration file not found: {config_path}"
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        let content = Self::substitute_env_vars(&content);

        let config: Config = toml::from_str(&content)
            .map_err(|e| MeterError::Config(format!("TOML parse error: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    fn substitute_env_vars(content: &str) -> String {
        let re = Regex::new(r"\$\{([^}]+)\}").expect("valid substitution pattern");
        re.replace_all(content, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .to_string()
    }

    pub fn validate(&self) -> Result<()> {
        if self.kafka.brokers.is_empty() {
            return Err(MeterError::Config("kafka.brokers cannot be empty".to_string()));
        }

        validate_kafka_version(&self.kafka.version)?;

        if self.exporter.topic_workers == 0 {
            return Err(MeterError::Config(
                "exporter.topic_workers must be at least 1".to_string(),
            ));
        }

        if self.exporter.max_offsets == 0 {
            return Err(MeterError::Config(
                "exporter.max_offsets must be at least 1".to_string(),
            ));
        }

        if self.kafka.sasl.enabled {
            SaslMechanism::parse(&self.kafka.sasl.mechanism)?;
        }

        if self.kafka.tls.enabled {
            cert_and_key_pair(
                self.kafka.tls.cert_file.as_deref(),
                self.kafka.tls.key_file.as_deref(),
            )?;
        }

        if self.zookeeper.enabled && self.zookeeper.servers.is_empty() {
            return Err(MeterError::Config(
                "zookeeper.servers cannot be empty when zookeeper.enabled is set".to_string(),
            ));
        }

        self.filters.compile()?;
        Ok(())
    }
}

pub fn validate_kafka_version(version: &str) -> Result<()> {
    let parts: Vec<&str> = version.split('.').collect();
    let well_formed = (2..=4).contains(&parts.len())
        && parts.iter().all(|p| !p.is_empty() && p.parse::<u32>().is_ok());
    if !well_formed {
        return Err(MeterError::Config(format!(
            "cannot parse Kafka version {version:?}"
        )));
    }
    Ok(())
}

/// Returns true when both a certificate and key are configured and readable.
/// Configuring only one of the pair is an error.
pub fn cert_and_key_pair(cert: Option<&str>, key: Option<&str>) -> Result<bool> {
    let cert_readable = cert.is_some_and(readable);
    let key_readable = key.is_some_and(readable);

    match (cert_readable, key_readable) {
        (true, true) => Ok(true),
        (false, false) => Ok(false),
        (false, true) => Err(MeterError::Config(format!(
            "error reading {:?}: certificate and key must be supplied as a pair",
            cert.unwrap_or_default()
        ))),
        (true, false) => Err(MeterError::Config(format!(
            "error reading {:?}: certificate and key must be supplied as a pair",
            key.unwrap_or_default()
        ))),
    }
}

fn readable(path: &str) -> bool {
    std::fs::File::open(path).is_ok()
}

impl FilterConfig {
    pub fn compile(&self) -> Result<ScrapeFilters> {
        Ok(ScrapeFilters {
            topic_include: Regex::new(&self.topic_include)?,
            topic_exclude: Regex::new(&self.topic_exclude)?,
            group_include: Regex::new(&self.group_include)?,
            group_exclude: Regex::new(&self.group_exclude)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ScrapeFilters {
    pub topic_include: Regex,
    pub topic_exclude: Regex,
    pub group_include: Regex,
    pub group_exclude: Regex,
}

impl ScrapeFilters {
    pub fn admits_topic(&self, topic: &str) -> bool {
        self.topic_include.is_match(topic) && !self.topic_exclude.is_match(topic)
    }

    pub fn admits_group(&self, group: &str) -> bool {
        self.group_include.is_match(group) && !self.group_exclude.is_match(group)
    }
}
