use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::observability::CREDENTIAL_REFRESH_TOTAL;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credentials io: {0}")]
    Io(#[from] io::Error),
    #[error("credentials json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unknown credential source {0:?}")]
    UnknownSource(String),
    #[error("no credential for complex {0:?}")]
    Missing(String),
}

/// Where a processor token comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialSource {
    /// Per-complex token obtained through the processor's OAuth flow.
    OAuth,
    /// Per-complex token pasted in by hand before OAuth existed.
    Legacy,
    /// The installation-wide token from `MP_ACCESS_TOKEN`.
    Env,
}

impl CredentialSource {
    pub const DEFAULT_ORDER: [CredentialSource; 3] =
        [CredentialSource::OAuth, CredentialSource::Legacy, CredentialSource::Env];

    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialSource::OAuth => "oauth",
            CredentialSource::Legacy => "legacy",
            CredentialSource::Env => "env",
        }
    }

    /// Parse a comma-separated order such as `"oauth,env"`.
    pub fn parse_order(raw: &str) -> Result<Vec<CredentialSource>, CredentialError> {
        let mut order = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let source: CredentialSource = part.parse()?;
            if !order.contains(&source) {
                order.push(source);
            }
        }
        Ok(order)
    }
}

impl FromStr for CredentialSource {
    type Err = CredentialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "oauth" => Ok(CredentialSource::OAuth),
            "legacy" => Ok(CredentialSource::Legacy),
            "env" => Ok(CredentialSource::Env),
            _ => Err(CredentialError::UnknownSource(s.to_string())),
        }
    }
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One usable token and where it came from.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub source: CredentialSource,
    /// `None` for installation-wide tokens.
    pub complex_id: Option<String>,
    pub access_token: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("source", &self.source)
            .field("complex_id", &self.complex_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Every token currently known, by source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialSet {
    pub oauth: BTreeMap<String, String>,
    pub legacy: BTreeMap<String, String>,
    pub env: Option<String>,
}

impl CredentialSet {
    fn lookup(&self, source: CredentialSource, complex_id: &str) -> Option<Credential> {
        let (complex, token) = match source {
            CredentialSource::OAuth => (Some(complex_id), self.oauth.get(complex_id)?),
            CredentialSource::Legacy => (Some(complex_id), self.legacy.get(complex_id)?),
            CredentialSource::Env => (None, self.env.as_ref()?),
        };
        Some(Credential {
            source,
            complex_id: complex.map(str::to_string),
            access_token: token.clone(),
        })
    }

    fn all(&self, source: CredentialSource) -> Vec<Credential> {
        let per_complex = |map: &BTreeMap<String, String>| -> Vec<Credential> {
            map.iter()
                .map(|(complex, token)| Credential {
                    source,
                    complex_id: Some(complex.clone()),
                    access_token: token.clone(),
                })
                .collect()
        };
        match source {
            CredentialSource::OAuth => per_complex(&self.oauth),
            CredentialSource::Legacy => per_complex(&self.legacy),
            CredentialSource::Env => self
                .env
                .iter()
                .map(|token| Credential {
                    source,
                    complex_id: None,
                    access_token: token.clone(),
                })
                .collect(),
        }
    }
}

/// Produces the current [`CredentialSet`]. Acquiring or refreshing OAuth
/// tokens happens elsewhere; a reload just picks up what was stored.
#[async_trait]
pub trait CredentialLoader: Send + Sync {
    async fn load(&self) -> Result<CredentialSet, CredentialError>;
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct CredentialsFile {
    oauth: BTreeMap<String, TokenEntry>,
    legacy: BTreeMap<String, TokenEntry>,
}

#[derive(Deserialize)]
struct TokenEntry {
    access_token: String,
}

/// Tokens from a JSON file plus the environment token.
///
/// ```json
/// {"oauth": {"la-loma": {"access_token": "APP_USR-..."}},
///  "legacy": {"el-potrero": {"access_token": "APP_USR-..."}}}
/// ```
pub struct FileCredentialLoader {
    path: Option<PathBuf>,
    env_token: Option<String>,
}

impl FileCredentialLoader {
    pub fn new(path: Option<PathBuf>, env_token: Option<String>) -> Self {
        Self {
            path,
            env_token: env_token.filter(|t| !t.trim().is_empty()),
        }
    }
}

#[async_trait]
impl CredentialLoader for FileCredentialLoader {
    async fn load(&self) -> Result<CredentialSet, CredentialError> {
        let file = match &self.path {
            Some(path) => match tokio::fs::read(path).await {
                Ok(bytes) => serde_json::from_slice(&bytes)?,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!("credentials file {} not found", path.display());
                    CredentialsFile::default()
                }
                Err(e) => return Err(e.into()),
            },
            None => CredentialsFile::default(),
        };
        let tokens = |map: BTreeMap<String, TokenEntry>| -> BTreeMap<String, String> {
            map.into_iter()
                .filter(|(_, entry)| !entry.access_token.trim().is_empty())
                .map(|(complex, entry)| (complex, entry.access_token))
                .collect()
        };
        Ok(CredentialSet {
            oauth: tokens(file.oauth),
            legacy: tokens(file.legacy),
            env: self.env_token.clone(),
        })
    }
}

/// Fixed credential sets handed out in sequence; the last one repeats.
pub struct StaticCredentials {
    sets: Mutex<Vec<CredentialSet>>,
}

impl StaticCredentials {
    pub fn new(set: CredentialSet) -> Self {
        Self::sequence(vec![set])
    }

    pub fn sequence(sets: Vec<CredentialSet>) -> Self {
        Self {
            sets: Mutex::new(sets),
        }
    }
}

#[async_trait]
impl CredentialLoader for StaticCredentials {
    async fn load(&self) -> Result<CredentialSet, CredentialError> {
        let mut sets = self.sets.lock().await;
        if sets.len() > 1 {
            return Ok(sets.remove(0));
        }
        Ok(sets.first().cloned().unwrap_or_default())
    }
}

/// Ordered list of credential sources consulted for every processor call.
pub struct CredentialChain {
    order: Vec<CredentialSource>,
    loader: Arc<dyn CredentialLoader>,
    current: RwLock<CredentialSet>,
}

impl CredentialChain {
    pub async fn load(
        order: Vec<CredentialSource>,
        loader: Arc<dyn CredentialLoader>,
    ) -> Result<Self, CredentialError> {
        let current = loader.load().await?;
        info!(
            "credentials: {} oauth, {} legacy, env {}; order {}",
            current.oauth.len(),
            current.legacy.len(),
            if current.env.is_some() { "set" } else { "unset" },
            order.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(",")
        );
        Ok(Self {
            order,
            loader,
            current: RwLock::new(current),
        })
    }

    /// First credential in chain order that can act for `complex_id`.
    pub async fn for_complex(&self, complex_id: &str) -> Result<Credential, CredentialError> {
        let current = self.current.read().await;
        self.order
            .iter()
            .find_map(|source| current.lookup(*source, complex_id))
            .ok_or_else(|| CredentialError::Missing(complex_id.to_string()))
    }

    /// Every known credential in chain order, each token once. Used when
    /// the owning complex is not known yet.
    pub async fn candidates(&self) -> Vec<Credential> {
        let current = self.current.read().await;
        let mut seen = HashSet::new();
        self.order
            .iter()
            .flat_map(|source| current.all(*source))
            .filter(|c| seen.insert(c.access_token.clone()))
            .collect()
    }

    /// Reload the stored tokens.
    pub async fn refresh(&self) -> Result<(), CredentialError> {
        metrics::counter!(CREDENTIAL_REFRESH_TOTAL).increment(1);
        let fresh = self.loader.load().await?;
        *self.current.write().await = fresh;
        Ok(())
    }
}
