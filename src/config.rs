use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::FixedOffset;

use crate::limits::{HOUR_MS, MAX_HOLD_TTL_MINUTES};
use crate::model::Ms;
use crate::payment::CredentialSource;
use crate::reconcile::OrphanPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Runtime settings, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub catalog_path: PathBuf,
    pub credentials_path: Option<PathBuf>,
    pub hold_ttl_minutes: u32,
    pub sweep_interval: Duration,
    pub compact_threshold: u64,
    pub intent_retention: Ms,
    /// Offset the installation's dates and times are written in.
    pub utc_offset: FixedOffset,
    pub processor_url: String,
    pub processor_timeout: Duration,
    pub env_token: Option<String>,
    pub credential_order: Vec<CredentialSource>,
    pub public_url: Option<String>,
    pub orphan_policy: OrphanPolicy,
    pub metrics_port: Option<u16>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Malformed numbers fall back to defaults;
    /// malformed enumerations are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let num = |key: &str| get(key).and_then(|v| v.parse::<i64>().ok());

        let hold_ttl_minutes = num("HOLD_TTL_MINUTES")
            .filter(|m| (1..=MAX_HOLD_TTL_MINUTES as i64).contains(m))
            .unwrap_or(10) as u32;
        let sweep_secs = num("SWEEP_INTERVAL_SECS").filter(|s| *s > 0).unwrap_or(60);
        let compact_threshold = num("TURNERO_COMPACT_THRESHOLD").filter(|n| *n > 0).unwrap_or(1000);
        let retention_hours = num("TURNERO_INTENT_RETENTION_HOURS")
            .filter(|h| *h > 0)
            .unwrap_or(168);
        let utc_offset = num("TURNERO_UTC_OFFSET_MINUTES")
            .and_then(|m| i32::try_from(m).ok())
            .and_then(|m| FixedOffset::east_opt(m * 60))
            .or_else(|| FixedOffset::west_opt(3 * 3600))
            .ok_or(ConfigError::Invalid {
                var: "TURNERO_UTC_OFFSET_MINUTES",
                reason: "no usable offset".into(),
            })?;
        let timeout_secs = num("TURNERO_PROCESSOR_TIMEOUT_SECS")
            .filter(|s| *s > 0)
            .unwrap_or(15);

        let credential_order = match get("TURNERO_CREDENTIAL_ORDER") {
            Some(raw) => CredentialSource::parse_order(&raw).map_err(|e| ConfigError::Invalid {
                var: "TURNERO_CREDENTIAL_ORDER",
                reason: e.to_string(),
            })?,
            None => CredentialSource::DEFAULT_ORDER.to_vec(),
        };
        if credential_order.is_empty() {
            return Err(ConfigError::Invalid {
                var: "TURNERO_CREDENTIAL_ORDER",
                reason: "at least one source is required".into(),
            });
        }
        let orphan_policy = match get("TURNERO_ORPHAN_APPROVAL") {
            Some(raw) => OrphanPolicy::from_str(&raw).map_err(|reason| ConfigError::Invalid {
                var: "TURNERO_ORPHAN_APPROVAL",
                reason,
            })?,
            None => OrphanPolicy::Materialize,
        };

        Ok(Self {
            bind: get("TURNERO_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: get("TURNERO_PORT").and_then(|p| p.parse().ok()).unwrap_or(3000),
            data_dir: get("TURNERO_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            catalog_path: get("TURNERO_CATALOG_PATH")
                .unwrap_or_else(|| "./complexes.json".into())
                .into(),
            credentials_path: get("TURNERO_CREDENTIALS_PATH").map(PathBuf::from),
            hold_ttl_minutes,
            sweep_interval: Duration::from_secs(sweep_secs as u64),
            compact_threshold: compact_threshold as u64,
            intent_retention: retention_hours * HOUR_MS,
            utc_offset,
            processor_url: get("TURNERO_PROCESSOR_URL").unwrap_or_else(|| "https://api.mercadopago.com".into()),
            processor_timeout: Duration::from_secs(timeout_secs as u64),
            env_token: get("MP_ACCESS_TOKEN"),
            credential_order,
            public_url: get("PUBLIC_URL").map(|u| u.trim_end_matches('/').to_string()),
            orphan_policy,
            metrics_port: get("TURNERO_METRICS_PORT").and_then(|p| p.parse().ok()),
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("turnero.wal")
    }

    /// Where the processor should post payment notifications.
    pub fn notification_url(&self) -> Option<String> {
        self.public_url
            .as_ref()
            .map(|base| format!("{base}/v1/webhooks/payments"))
    }
}
