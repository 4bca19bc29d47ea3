use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::message::{MAX_PRIORITY, MessageDefaults, TransportKind};

pub const CONFIG_VERSION: u32 = 1;

// ── Raw TOML input ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CommlinkConfigInput {
    pub version: u32,
    pub buffers: BuffersInput,
    pub defaults: DefaultsInput,
    pub health: HealthInput,
    pub transmitter: TransmitterInput,
    pub files: FilesInput,
    pub contacts: BTreeMap<String, ContactConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BuffersInput {
    pub transmission: Option<usize>,
    pub reception: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DefaultsInput {
    pub sender: Option<String>,
    pub text: KindDefaultsInput,
    pub file: KindDefaultsInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KindDefaultsInput {
    pub priority: Option<u32>,
    pub timeout_s: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HealthInput {
    pub poll_interval_ms: Option<u64>,
    pub probe_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransmitterInput {
    pub send_timeout_ms: Option<u64>,
    pub dequeue_wait_ms: Option<u64>,
    pub fallback_order: Option<Vec<String>>,
    pub preferred_policy: Option<PreferredPolicy>,
    pub max_passes: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FilesInput {
    pub root: Option<PathBuf>,
}

/// Addresses of one contact, one per transport family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ContactConfig {
    pub number: Option<String>,
    pub email: Option<String>,
    pub ip: Option<String>,
    pub mac: Option<String>,
}

// ── Resolved configuration ──────────────────────────────────────────

/// What to do when a message names a preferred transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferredPolicy {
    /// Try the preferred transport first, then the fixed fallback order.
    #[default]
    Fallback,
    /// Try only the preferred transport; discard if it is unavailable or fails.
    PreferredOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthConfig {
    pub poll_interval: Duration,
    /// Upper bound a single adapter probe is expected to honour.
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransmitterConfig {
    /// Upper bound a single adapter send is expected to honour, measured
    /// from the moment the modem lease is granted. The lease wait itself is
    /// unbounded.
    pub send_timeout: Duration,
    /// Slice of the blocking dequeue after which the loop re-checks stop.
    pub dequeue_wait: Duration,
    pub fallback_order: Vec<TransportKind>,
    pub preferred_policy: PreferredPolicy,
    /// Fallback passes per dequeued message before it is discarded.
    pub max_passes: u32,
}

impl Default for TransmitterConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(10),
            dequeue_wait: Duration::from_millis(250),
            fallback_order: default_fallback_order(),
            preferred_policy: PreferredPolicy::Fallback,
            max_passes: 1,
        }
    }
}

pub fn default_fallback_order() -> Vec<TransportKind> {
    vec![
        TransportKind::Network,
        TransportKind::Radio,
        TransportKind::Email,
        TransportKind::Sms,
    ]
}

#[derive(Debug, Clone)]
pub struct CommlinkConfig {
    pub version: u32,
    pub transmission_capacity: usize,
    pub reception_capacity: usize,
    pub default_sender: String,
    pub text_defaults: MessageDefaults,
    pub file_defaults: MessageDefaults,
    pub health: HealthConfig,
    pub transmitter: TransmitterConfig,
    /// Base directory for relative file payload references.
    pub file_root: PathBuf,
    pub contacts: BTreeMap<String, ContactConfig>,
}

impl CommlinkConfigInput {
    pub fn resolve(self) -> Result<CommlinkConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        let transmission_capacity =
            positive("buffers.transmission", self.buffers.transmission)?;
        let reception_capacity = positive("buffers.reception", self.buffers.reception)?;

        let default_sender = self
            .defaults
            .sender
            .map(|s| s.trim().to_string())
            .ok_or(ConfigError::Missing("defaults.sender"))?;
        if default_sender.is_empty() {
            return Err(ConfigError::Invalid {
                field: "defaults.sender",
                reason: "must not be empty".into(),
            });
        }

        let text_defaults = kind_defaults(
            self.defaults.text,
            "defaults.text.priority",
            "defaults.text.timeout_s",
        )?;
        let file_defaults = kind_defaults(
            self.defaults.file,
            "defaults.file.priority",
            "defaults.file.timeout_s",
        )?;

        let poll_ms = positive("health.poll_interval_ms", self.health.poll_interval_ms)?;
        let health = HealthConfig {
            poll_interval: Duration::from_millis(poll_ms),
            probe_timeout: optional_millis(
                "health.probe_timeout_ms",
                self.health.probe_timeout_ms,
                HealthConfig::default().probe_timeout,
            )?,
        };

        let defaults = TransmitterConfig::default();
        let fallback_order = match self.transmitter.fallback_order {
            Some(names) => parse_fallback_order(&names)?,
            None => defaults.fallback_order,
        };
        let max_passes = self.transmitter.max_passes.unwrap_or(defaults.max_passes);
        if max_passes == 0 {
            return Err(ConfigError::Invalid {
                field: "transmitter.max_passes",
                reason: "must be at least 1".into(),
            });
        }
        let transmitter = TransmitterConfig {
            send_timeout: optional_millis(
                "transmitter.send_timeout_ms",
                self.transmitter.send_timeout_ms,
                defaults.send_timeout,
            )?,
            dequeue_wait: optional_millis(
                "transmitter.dequeue_wait_ms",
                self.transmitter.dequeue_wait_ms,
                defaults.dequeue_wait,
            )?,
            fallback_order,
            preferred_policy: self
                .transmitter
                .preferred_policy
                .unwrap_or(defaults.preferred_policy),
            max_passes,
        };

        let file_root = self.files.root.ok_or(ConfigError::Missing("files.root"))?;

        let contacts = self
            .contacts
            .into_iter()
            .map(|(name, c)| (name.trim().to_string(), c))
            .filter(|(name, _)| !name.is_empty())
            .collect();

        Ok(CommlinkConfig {
            version,
            transmission_capacity,
            reception_capacity,
            default_sender,
            text_defaults,
            file_defaults,
            health,
            transmitter,
            file_root,
            contacts,
        })
    }
}

impl CommlinkConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let parsed: CommlinkConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

fn positive<T>(field: &'static str, value: Option<T>) -> Result<T, ConfigError>
where
    T: Copy + PartialOrd + Default,
{
    let v = value.ok_or(ConfigError::Missing(field))?;
    if v <= T::default() {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be greater than zero".into(),
        });
    }
    Ok(v)
}

fn optional_millis(
    field: &'static str,
    value: Option<u64>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        Some(0) => Err(ConfigError::Invalid {
            field,
            reason: "must be greater than zero".into(),
        }),
        Some(ms) => Ok(Duration::from_millis(ms)),
        None => Ok(default),
    }
}

fn kind_defaults(
    input: KindDefaultsInput,
    priority_field: &'static str,
    timeout_field: &'static str,
) -> Result<MessageDefaults, ConfigError> {
    let priority = input.priority.ok_or(ConfigError::Missing(priority_field))?;
    let timeout_s = positive(timeout_field, input.timeout_s)?;
    Ok(MessageDefaults {
        priority: priority.min(MAX_PRIORITY as u32) as u8,
        timeout: Duration::from_secs(timeout_s),
    })
}

fn parse_fallback_order(names: &[String]) -> Result<Vec<TransportKind>, ConfigError> {
    let mut seen = HashSet::new();
    let mut order = Vec::with_capacity(names.len());
    for name in names {
        let kind = name
            .parse::<TransportKind>()
            .map_err(|reason| ConfigError::Invalid {
                field: "transmitter.fallback_order",
                reason,
            })?;
        if !seen.insert(kind) {
            return Err(ConfigError::Invalid {
                field: "transmitter.fallback_order",
                reason: format!("'{kind}' listed more than once"),
            });
        }
        order.push(kind);
    }
    if order.is_empty() {
        return Err(ConfigError::Invalid {
            field: "transmitter.fallback_order",
            reason: "must name at least one transport".into(),
        });
    }
    Ok(order)
}
