use std::collections::HashMap;
use std::str::FromStr;

use chrono::Duration;
use serde::Deserialize;

use crate::types::{NotificationKind, NotificationStatus};

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Resend API key for email delivery
    pub resend_api_key: Option<String>,

    /// Email sender address
    pub email_from: Option<String>,

    /// Static bearer token for the admin routes. Unset disables them.
    pub admin_api_token: Option<String>,

    pub dispatch: DispatchConfig,
    pub retention: RetentionConfig,
    pub encryption: EncryptionConfig,
    pub resend: ResendConfig,
    pub auto_resend: AutoResendConfig,
    pub dedupe: DedupeConfig,
    pub transport: TransportConfig,
}

/// Dispatch worker tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Poll tick in milliseconds; the fallback when a transport signal is missed.
    pub poll_interval_ms: u64,
    /// Tries per attempt burst before dead-lettering.
    pub max_attempts: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            max_attempts: 3,
        }
    }
}

/// Scrub and delete windows for one terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetentionWindow {
    pub scrub_after_days: i64,
    pub delete_after_days: i64,
}

impl RetentionWindow {
    pub fn scrub_after(&self) -> Duration {
        Duration::days(self.scrub_after_days)
    }

    pub fn delete_after(&self) -> Duration {
        Duration::days(self.delete_after_days)
    }
}

/// Which fields the retention sweep clears when scrubbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ScrubFields {
    pub to_name: bool,
    pub subject: bool,
    pub body_html: bool,
    pub body_text: bool,
    /// Replaces the address with a placeholder rather than nulling it.
    pub to_email: bool,
    /// Replaces the renderer payload with `{}`.
    pub data: bool,
}

impl Default for ScrubFields {
    fn default() -> Self {
        Self {
            to_name: true,
            subject: true,
            body_html: true,
            body_text: true,
            to_email: true,
            data: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    pub sent: RetentionWindow,
    pub failed: RetentionWindow,
    pub dead_letter: RetentionWindow,
    pub scrub_fields: ScrubFields,
    pub sweep_interval_secs: u64,
    /// Opt-in: move Sending rows leased longer ago than this back to Queued.
    pub lease_reclaim_after_secs: Option<u64>,
}

impl RetentionConfig {
    /// Window for a terminal status; `None` for Queued/Sending, which are never swept.
    pub fn window_for(&self, status: NotificationStatus) -> Option<RetentionWindow> {
        match status {
            NotificationStatus::Sent => Some(self.sent),
            NotificationStatus::Failed => Some(self.failed),
            NotificationStatus::DeadLetter => Some(self.dead_letter),
            NotificationStatus::Queued | NotificationStatus::Sending => None,
        }
    }

    /// Each window must be non-negative and scrub strictly before it deletes.
    pub fn validate(&self) -> anyhow::Result<()> {
        let windows = [
            ("SCRUB_SENT_DAYS", "RETENTION_SENT_DAYS", self.sent),
            ("SCRUB_FAILED_DAYS", "RETENTION_FAILED_DAYS", self.failed),
            (
                "SCRUB_DEAD_LETTER_DAYS",
                "RETENTION_DEAD_LETTER_DAYS",
                self.dead_letter,
            ),
        ];
        for (scrub_var, delete_var, window) in windows {
            if window.scrub_after_days < 0 || window.delete_after_days < 0 {
                anyhow::bail!(
                    "{} and {} must not be negative, got {} and {}",
                    scrub_var,
                    delete_var,
                    window.scrub_after_days,
                    window.delete_after_days
                );
            }
            if window.scrub_after_days >= window.delete_after_days {
                anyhow::bail!(
                    "{} ({}) must be less than {} ({})",
                    scrub_var,
                    window.scrub_after_days,
                    delete_var,
                    window.delete_after_days
                );
            }
        }
        Ok(())
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            sent: RetentionWindow {
                scrub_after_days: 30,
                delete_after_days: 90,
            },
            failed: RetentionWindow {
                scrub_after_days: 30,
                delete_after_days: 90,
            },
            dead_letter: RetentionWindow {
                scrub_after_days: 60,
                delete_after_days: 180,
            },
            scrub_fields: ScrubFields::default(),
            sweep_interval_secs: 3600,
            lease_reclaim_after_secs: None,
        }
    }
}

/// Per-field encryption toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct EncryptedFields {
    pub to_name: bool,
    pub subject: bool,
    pub body_html: bool,
    pub body_text: bool,
}

impl Default for EncryptedFields {
    fn default() -> Self {
        Self {
            to_name: true,
            subject: true,
            body_html: true,
            body_text: true,
        }
    }
}

#[derive(Clone, Default, Deserialize)]
pub struct EncryptionConfig {
    pub enabled: bool,
    /// Base64 encoded 32-byte AES-256 key.
    pub key: Option<String>,
    pub fields: EncryptedFields,
}

impl std::fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("enabled", &self.enabled)
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("fields", &self.fields)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResendConfig {
    /// Minimum gap between notifications for the same recipient and kind.
    pub throttle_secs: i64,
}

impl ResendConfig {
    pub fn throttle_window(&self) -> Duration {
        Duration::seconds(self.throttle_secs)
    }
}

impl Default for ResendConfig {
    fn default() -> Self {
        Self { throttle_secs: 60 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutoResendConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// How long a Sent notification may go without delivery/open before it is resent.
    pub no_action_hours: i64,
    pub daily_cap_per_tenant: i64,
    pub max_per_scan: i64,
    pub kinds: Vec<NotificationKind>,
}

impl AutoResendConfig {
    pub fn no_action_window(&self) -> Duration {
        Duration::hours(self.no_action_hours)
    }
}

impl Default for AutoResendConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 300,
            no_action_hours: 24,
            daily_cap_per_tenant: 50,
            max_per_scan: 100,
            kinds: vec![NotificationKind::Verification, NotificationKind::Invite],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DedupeConfig {
    /// Lifetime of a durable creation claim.
    pub claim_ttl_secs: i64,
    /// Lifetime of an entry in the process-local suppression map.
    pub local_ttl_secs: u64,
}

impl DedupeConfig {
    pub fn claim_ttl(&self) -> Duration {
        Duration::seconds(self.claim_ttl_secs)
    }
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            claim_ttl_secs: 86_400,
            local_ttl_secs: 600,
        }
    }
}

/// How "item queued" wakeups reach the dispatch worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// In-process broadcast channel; producers and the worker share a process.
    InProcess,
    /// Redis pub/sub; producers and workers may run anywhere.
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    pub mode: TransportMode,
    pub channel: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::InProcess,
            channel: "courier:notifications:queued".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from a map of variables. Used by tests.
    pub fn from_map(vars: &HashMap<String, String>) -> anyhow::Result<Self> {
        Self::from_lookup(|name| vars.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let env = Env { lookup: &lookup };

        let defaults = RetentionConfig::default();
        let retention = RetentionConfig {
            sent: RetentionWindow {
                scrub_after_days: env.parse("SCRUB_SENT_DAYS", defaults.sent.scrub_after_days)?,
                delete_after_days: env
                    .parse("RETENTION_SENT_DAYS", defaults.sent.delete_after_days)?,
            },
            failed: RetentionWindow {
                scrub_after_days: env
                    .parse("SCRUB_FAILED_DAYS", defaults.failed.scrub_after_days)?,
                delete_after_days: env
                    .parse("RETENTION_FAILED_DAYS", defaults.failed.delete_after_days)?,
            },
            dead_letter: RetentionWindow {
                scrub_after_days: env.parse(
                    "SCRUB_DEAD_LETTER_DAYS",
                    defaults.dead_letter.scrub_after_days,
                )?,
                delete_after_days: env.parse(
                    "RETENTION_DEAD_LETTER_DAYS",
                    defaults.dead_letter.delete_after_days,
                )?,
            },
            scrub_fields: ScrubFields {
                to_name: env.flag("SCRUB_TO_NAME", true)?,
                subject: env.flag("SCRUB_SUBJECT", true)?,
                body_html: env.flag("SCRUB_BODY_HTML", true)?,
                body_text: env.flag("SCRUB_BODY_TEXT", true)?,
                to_email: env.flag("SCRUB_TO_EMAIL", true)?,
                data: env.flag("SCRUB_DATA", false)?,
            },
            sweep_interval_secs: env
                .parse("RETENTION_SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs)?,
            lease_reclaim_after_secs: env.optional("LEASE_RECLAIM_AFTER_SECS")?,
        };
        retention.validate()?;

        let encryption = EncryptionConfig {
            enabled: env.flag("NOTIFICATION_ENCRYPTION_ENABLED", false)?,
            key: env.get("NOTIFICATION_ENCRYPTION_KEY"),
            fields: EncryptedFields {
                to_name: env.flag("ENCRYPT_TO_NAME", true)?,
                subject: env.flag("ENCRYPT_SUBJECT", true)?,
                body_html: env.flag("ENCRYPT_BODY_HTML", true)?,
                body_text: env.flag("ENCRYPT_BODY_TEXT", true)?,
            },
        };
        if encryption.enabled && encryption.key.is_none() {
            anyhow::bail!(
                "NOTIFICATION_ENCRYPTION_KEY is required when NOTIFICATION_ENCRYPTION_ENABLED is set"
            );
        }

        let auto_defaults = AutoResendConfig::default();
        let auto_resend = AutoResendConfig {
            enabled: env.flag("AUTO_RESEND_ENABLED", false)?,
            interval_secs: env.parse("AUTO_RESEND_INTERVAL_SECS", auto_defaults.interval_secs)?,
            no_action_hours: env
                .parse("AUTO_RESEND_NO_ACTION_HOURS", auto_defaults.no_action_hours)?,
            daily_cap_per_tenant: env.parse(
                "AUTO_RESEND_DAILY_CAP_PER_TENANT",
                auto_defaults.daily_cap_per_tenant,
            )?,
            max_per_scan: env.parse("AUTO_RESEND_MAX_PER_SCAN", auto_defaults.max_per_scan)?,
            kinds: match env.get("AUTO_RESEND_KINDS") {
                Some(raw) => parse_kinds(&raw)?,
                None => auto_defaults.kinds,
            },
        };

        let transport = TransportConfig {
            mode: match env.get("NOTIFICATION_TRANSPORT").as_deref() {
                None | Some("inprocess") => TransportMode::InProcess,
                Some("redis") => TransportMode::Redis,
                Some(other) => anyhow::bail!(
                    "NOTIFICATION_TRANSPORT must be 'inprocess' or 'redis', got '{}'",
                    other
                ),
            },
            channel: env
                .get("NOTIFICATION_CHANNEL")
                .unwrap_or_else(|| TransportConfig::default().channel),
        };

        Ok(Self {
            database_url: env
                .get("DATABASE_URL")
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: env
                .get("REDIS_URL")
                .unwrap_or_else(|| "redis://localhost:6379".to_string()),
            db_max_connections: env.parse("DB_MAX_CONNECTIONS", 20)?,
            resend_api_key: env.get("RESEND_API_KEY"),
            email_from: env.get("EMAIL_FROM"),
            admin_api_token: env.get("ADMIN_API_TOKEN"),
            dispatch: DispatchConfig {
                poll_interval_ms: env.parse("DISPATCH_POLL_INTERVAL_MS", 2000)?,
                max_attempts: env.parse("DISPATCH_MAX_ATTEMPTS", 3)?,
            },
            retention,
            encryption,
            resend: ResendConfig {
                throttle_secs: env.parse("RESEND_THROTTLE_SECS", 60)?,
            },
            auto_resend,
            dedupe: DedupeConfig {
                claim_ttl_secs: env.parse("DEDUPE_CLAIM_TTL_SECS", 86_400)?,
                local_ttl_secs: env.parse("LOCAL_DEDUPE_TTL_SECS", 600)?,
            },
            transport,
        })
    }
}

/// Variable lookup with typed parsing. Blank values count as unset.
struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, name: &str, default: T) -> anyhow::Result<T> {
        Ok(self.optional(name)?.unwrap_or(default))
    }

    fn optional<T: FromStr>(&self, name: &str) -> anyhow::Result<Option<T>> {
        self.get(name)
            .map(|raw| {
                raw.parse()
                    .map_err(|_| anyhow::anyhow!("{} has an invalid value '{}'", name, raw))
            })
            .transpose()
    }

    fn flag(&self, name: &str, default: bool) -> anyhow::Result<bool> {
        match self.get(name) {
            None => Ok(default),
            Some(raw) => parse_bool(&raw)
                .ok_or_else(|| anyhow::anyhow!("{} must be a boolean, got '{}'", name, raw)),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_kinds(raw: &str) -> anyhow::Result<Vec<NotificationKind>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<NotificationKind>().map_err(anyhow::Error::from))
        .collect()
}
