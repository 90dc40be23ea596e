//! Configuration types.
//!
//! A `DispatchConfig` is built once per run (CLI flags over `BULKSEND_*`
//! environment variables over defaults) and never changes while the run is
//! in progress. The credential is resolved up front through
//! [`resolve_credential`] so nothing reaches for a default mid-run.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::template::Dialect;

/// Default number of successful sends per account per day before the run
/// asks whether to continue.
pub const DEFAULT_DAILY_CAP: u64 = 1000;

/// Default number of history records written per batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default number of processed rows between progress notifications.
pub const DEFAULT_PROGRESS_EVERY: usize = 100;

/// Which kind of delivery a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// SMS through an HTTP gateway.
    Sms,
    /// Email through SMTP.
    Email,
}

impl ChannelKind {
    /// Column holding the recipient address.
    pub fn recipient_field(&self) -> &'static str {
        match self {
            Self::Sms => "phone",
            Self::Email => "email",
        }
    }

    /// Canonical fields filled positionally when the header lacks them.
    pub fn canonical_fields(&self) -> &'static [(&'static str, usize)] {
        match self {
            Self::Sms => &[("first_name", 0), ("last_name", 1), ("phone", 2)],
            Self::Email => &[("email", 0)],
        }
    }

    /// Template dialect used for this kind of message.
    pub fn dialect(&self) -> Dialect {
        match self {
            Self::Sms => Dialect::Safe,
            Self::Email => Dialect::Escaped,
        }
    }

    fn default_timeout(&self) -> Duration {
        match self {
            Self::Sms => Duration::from_secs(10),
            Self::Email => Duration::from_secs(60),
        }
    }

    fn default_output(&self) -> PathBuf {
        match self {
            Self::Sms => PathBuf::from("sms_send_log.csv"),
            Self::Email => PathBuf::from("email_send_log.csv"),
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sms => write!(f, "sms"),
            Self::Email => write!(f, "email"),
        }
    }
}

/// Exponential backoff between failed attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay after the first failed attempt.
    pub base: Duration,
    /// Upper bound for any single delay.
    pub cap: Duration,
}

impl Backoff {
    /// Delay to wait after the `failed_attempt`-th failure (1-based):
    /// `min(cap, base * 2^(failed_attempt - 1))`.
    pub fn delay(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(63) as i32;
        let secs = self.base.as_secs_f64() * 2f64.powi(exponent);
        let capped = secs.min(self.cap.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(5),
        }
    }
}

/// Identity of the sending account, as known to the history store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRef {
    pub id: i64,
    pub name: String,
}

/// Immutable per-run dispatch settings.
#[derive(Debug)]
pub struct DispatchConfig {
    /// What is being sent.
    pub channel: ChannelKind,
    /// Account the run sends through (rate cap and history are keyed on it).
    pub account: AccountRef,
    /// Gateway URL or SMTP host, for logging and the completion summary.
    pub endpoint: String,
    /// Gateway token or SMTP password.
    pub credential: SecretString,
    /// Extra attempts after the first one fails.
    pub retries: u32,
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Pause after each dry-run or sent row.
    pub delay: Duration,
    /// Maximum rows to process; 0 means unlimited.
    pub limit: usize,
    /// 1-based data row to start from.
    pub start_row: usize,
    /// Prefix prepended to local numbers, e.g. `+254`.
    pub recipient_prefix: Option<String>,
    /// Ensure normalized recipients start with `+`.
    pub force_plus: bool,
    /// Skip recipients that already got a successful message today.
    pub skip_duplicates: bool,
    /// Render and log without transmitting.
    pub dry_run: bool,
    /// Output log path (overwritten each run).
    pub output: PathBuf,
    /// Column holding the recipient address.
    pub recipient_field: String,
    /// Template dialect.
    pub dialect: Dialect,
    /// Successful sends per account per day before asking to continue;
    /// 0 disables the check.
    pub daily_cap: u64,
    /// History records per `record_batch` call.
    pub batch_size: usize,
    /// Processed rows between progress notifications.
    pub progress_every: usize,
    /// Delay policy between failed attempts.
    pub backoff: Backoff,
}

impl DispatchConfig {
    /// Defaults for the given channel kind.
    pub fn for_channel(channel: ChannelKind) -> Self {
        Self {
            channel,
            account: AccountRef {
                id: 0,
                name: "default".to_string(),
            },
            endpoint: String::new(),
            credential: SecretString::from(String::new()),
            retries: 2,
            timeout: channel.default_timeout(),
            delay: Duration::from_millis(200),
            limit: 0,
            start_row: 1,
            recipient_prefix: None,
            force_plus: false,
            skip_duplicates: false,
            dry_run: false,
            output: channel.default_output(),
            recipient_field: channel.recipient_field().to_string(),
            dialect: channel.dialect(),
            daily_cap: DEFAULT_DAILY_CAP,
            batch_size: DEFAULT_BATCH_SIZE,
            progress_every: DEFAULT_PROGRESS_EVERY,
            backoff: Backoff::default(),
        }
    }

    /// Total attempts per row.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Row limit, or `None` when unlimited.
    pub fn row_limit(&self) -> Option<usize> {
        (self.limit > 0).then_some(self.limit)
    }

    /// Check values that would otherwise fail mid-run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.recipient_field.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "recipient_field".into(),
                message: "must not be empty".into(),
            });
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "timeout".into(),
                message: "must be greater than zero".into(),
            });
        }
        if self.channel == ChannelKind::Sms && self.endpoint.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "endpoint".into(),
                hint: "Pass --gateway or --account".into(),
            });
        }
        Ok(())
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::for_channel(ChannelKind::Sms)
    }
}

/// SMTP session settings, built from environment variables.
#[derive(Debug)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub from_name: Option<String>,
    /// Upgrade the session with STARTTLS.
    pub use_tls: bool,
    /// Connection and command timeout.
    pub timeout: Duration,
}

impl SmtpSettings {
    /// Build settings from `BULKSEND_SMTP_*` environment variables.
    ///
    /// The password is not read here; it goes through [`resolve_credential`].
    pub fn from_env() -> Self {
        let host =
            std::env::var("BULKSEND_SMTP_HOST").unwrap_or_else(|_| "smtp.gmail.com".to_string());

        let port: u16 = std::env::var("BULKSEND_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("BULKSEND_SMTP_USERNAME").unwrap_or_default();

        let from_address =
            std::env::var("BULKSEND_SMTP_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        let from_name = std::env::var("BULKSEND_SMTP_FROM_NAME")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let use_tls = std::env::var("BULKSEND_SMTP_TLS")
            .map(|v| !matches!(v.to_lowercase().as_str(), "0" | "false" | "no" | "off"))
            .unwrap_or(true);

        Self {
            host,
            port,
            username,
            password: SecretString::from(String::new()),
            from_address,
            from_name,
            use_tls,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Resolve a credential: explicit value, then the named environment
/// variable, then the interactive prompt.
///
/// Empty values count as absent at every step except the prompt, whose
/// answer is taken as-is.
pub fn resolve_credential<F>(
    explicit: Option<String>,
    env_var: Option<&str>,
    prompt: F,
) -> Result<SecretString, ConfigError>
where
    F: FnOnce() -> std::io::Result<String>,
{
    if let Some(value) = explicit.filter(|v| !v.is_empty()) {
        return Ok(SecretString::from(value));
    }

    if let Some(name) = env_var {
        match std::env::var(name) {
            Ok(value) if !value.is_empty() => return Ok(SecretString::from(value)),
            Ok(_) | Err(std::env::VarError::NotPresent) => {}
            Err(std::env::VarError::NotUnicode(_)) => {
                return Err(ConfigError::InvalidValue {
                    key: name.to_string(),
                    message: "not valid unicode".into(),
                });
            }
        }
    }

    let answer = prompt()?;
    Ok(SecretString::from(answer.trim_end_matches(['\r', '\n']).to_string()))
}
