use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::limits::{MAX_COMPLEX_ID_LEN, MAX_FIELD_NAME_LEN};
use crate::slot::slugify;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog io: {0}")]
    Io(#[from] io::Error),
    #[error("catalog json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid catalog: {0}")]
    Invalid(String),
}

/// `"HH:MM"` on the wire. Longer inputs such as `"18:00:00"` are cut to the
/// first five characters.
pub(crate) mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        let trimmed = raw.get(..5).unwrap_or(&raw);
        NaiveTime::parse_from_str(trimmed, "%H:%M").map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpeningHours {
    #[serde(with = "hhmm")]
    pub open: NaiveTime,
    #[serde(with = "hhmm")]
    pub close: NaiveTime,
}

impl OpeningHours {
    /// `close < open` means the range runs past midnight.
    pub fn is_overnight(&self) -> bool {
        self.close < self.open
    }

    /// Whether a slot starting at `t` on this range's own day is inside it.
    /// `open == close` is open all day.
    pub fn admits_same_day(&self, t: NaiveTime) -> bool {
        if self.open == self.close {
            return true;
        }
        if self.is_overnight() {
            t >= self.open
        } else {
            self.open <= t && t < self.close
        }
    }

    /// Whether a slot at `t` on the following day is still inside an
    /// overnight range.
    pub fn admits_next_day(&self, t: NaiveTime) -> bool {
        self.is_overnight() && t < self.close
    }
}

/// Hours per weekday. A missing day is closed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeeklySchedule {
    pub monday: Option<OpeningHours>,
    pub tuesday: Option<OpeningHours>,
    pub wednesday: Option<OpeningHours>,
    pub thursday: Option<OpeningHours>,
    pub friday: Option<OpeningHours>,
    pub saturday: Option<OpeningHours>,
    pub sunday: Option<OpeningHours>,
}

impl WeeklySchedule {
    pub fn for_day(&self, day: Weekday) -> Option<&OpeningHours> {
        match day {
            Weekday::Mon => self.monday.as_ref(),
            Weekday::Tue => self.tuesday.as_ref(),
            Weekday::Wed => self.wednesday.as_ref(),
            Weekday::Thu => self.thursday.as_ref(),
            Weekday::Fri => self.friday.as_ref(),
            Weekday::Sat => self.saturday.as_ref(),
            Weekday::Sun => self.sunday.as_ref(),
        }
    }

    /// Friday 22:00–02:00 admits Friday 23:00 and Saturday 01:00, but not
    /// Friday 01:00.
    pub fn is_open(&self, date: NaiveDate, time: NaiveTime) -> bool {
        if self
            .for_day(date.weekday())
            .is_some_and(|h| h.admits_same_day(time))
        {
            return true;
        }
        self.for_day(date.weekday().pred())
            .is_some_and(|h| h.admits_next_day(time))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    /// Players per side, e.g. 5 for "fútbol 5".
    #[serde(default)]
    pub players: u32,
    /// Deposit charged to hold a slot on this field.
    #[serde(default)]
    pub deposit_cents: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Complex {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default)]
    pub hours: WeeklySchedule,
}

impl Complex {
    /// Find a field by exact name, then by slug, then by player count when
    /// the input is a bare number.
    pub fn field(&self, name: &str) -> Option<&Field> {
        let name = name.trim();
        if let Some(f) = self.fields.iter().find(|f| f.name == name) {
            return Some(f);
        }
        let slug = slugify(name);
        if !slug.is_empty()
            && let Some(f) = self.fields.iter().find(|f| slugify(&f.name) == slug)
        {
            return Some(f);
        }
        let players: u32 = name.parse().ok()?;
        self.fields.iter().find(|f| f.players == players)
    }
}

/// Complexes by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    complexes: HashMap<String, Complex>,
}

#[derive(Deserialize)]
struct CatalogFile {
    complexes: Vec<Complex>,
}

impl Catalog {
    pub fn new(complexes: Vec<Complex>) -> Result<Self, CatalogError> {
        let mut map = HashMap::with_capacity(complexes.len());
        for complex in complexes {
            validate_complex(&complex)?;
            let id = complex.id.clone();
            if map.insert(id.clone(), complex).is_some() {
                return Err(CatalogError::Invalid(format!("duplicate complex id {id:?}")));
            }
        }
        Ok(Self { complexes: map })
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_slice(bytes)?;
        Self::new(file.complexes)
    }

    pub fn complex(&self, id: &str) -> Option<&Complex> {
        self.complexes.get(id)
    }

    pub fn len(&self) -> usize {
        self.complexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.complexes.is_empty()
    }
}

fn validate_complex(complex: &Complex) -> Result<(), CatalogError> {
    let id = complex.id.trim();
    if id.is_empty() || id.len() > MAX_COMPLEX_ID_LEN || id != complex.id {
        return Err(CatalogError::Invalid(format!("bad complex id {:?}", complex.id)));
    }
    let mut seen = Vec::with_capacity(complex.fields.len());
    for field in &complex.fields {
        let slug = slugify(&field.name);
        if slug.is_empty() || field.name.len() > MAX_FIELD_NAME_LEN {
            return Err(CatalogError::Invalid(format!(
                "bad field name {:?} in {id}",
                field.name
            )));
        }
        if seen.contains(&slug) {
            return Err(CatalogError::Invalid(format!(
                "fields of {id} collide on slug {slug:?}"
            )));
        }
        seen.push(slug);
    }
    Ok(())
}

/// Where complex metadata comes from. Storing and editing it is somebody
/// else's job; we only read.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Changes whenever the content may have changed.
    async fn revision(&self) -> Result<u64, CatalogError>;
    async fn load(&self) -> Result<Catalog, CatalogError>;
}

/// Catalog read from a JSON file; the revision is the file's mtime.
pub struct JsonFileCatalog {
    path: PathBuf,
}

impl JsonFileCatalog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl CatalogSource for JsonFileCatalog {
    async fn revision(&self) -> Result<u64, CatalogError> {
        let modified = tokio::fs::metadata(&self.path).await?.modified()?;
        let nanos = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Ok(nanos)
    }

    async fn load(&self) -> Result<Catalog, CatalogError> {
        let bytes = tokio::fs::read(&self.path).await?;
        let catalog = Catalog::from_json(&bytes)?;
        info!("loaded {} complexes from {}", catalog.len(), self.path.display());
        Ok(catalog)
    }
}

/// In-memory catalog, mainly for tests and embedding.
pub struct StaticCatalog {
    catalog: RwLock<Catalog>,
    revision: AtomicU64,
}

impl StaticCatalog {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog: RwLock::new(catalog),
            revision: AtomicU64::new(1),
        }
    }

    pub async fn replace(&self, catalog: Catalog) {
        *self.catalog.write().await = catalog;
        self.revision.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CatalogSource for StaticCatalog {
    async fn revision(&self) -> Result<u64, CatalogError> {
        Ok(self.revision.load(Ordering::SeqCst))
    }

    async fn load(&self) -> Result<Catalog, CatalogError> {
        Ok(self.catalog.read().await.clone())
    }
}

/// Refresh-on-read copy of a [`CatalogSource`]. Used for validation only;
/// it never decides whether a slot is taken.
pub struct CatalogCache {
    source: Arc<dyn CatalogSource>,
    cached: RwLock<Option<(u64, Arc<Catalog>)>>,
}

impl CatalogCache {
    pub fn new(source: Arc<dyn CatalogSource>) -> Self {
        Self {
            source,
            cached: RwLock::new(None),
        }
    }

    /// Current catalog, reloaded if the source's revision moved.
    pub async fn get(&self) -> Result<Arc<Catalog>, CatalogError> {
        let revision = self.source.revision().await?;
        if let Some((rev, catalog)) = self.cached.read().await.as_ref()
            && *rev == revision
        {
            return Ok(catalog.clone());
        }

        let mut cached = self.cached.write().await;
        // another task may have reloaded while we waited
        if let Some((rev, catalog)) = cached.as_ref()
            && *rev == revision
        {
            return Ok(catalog.clone());
        }
        debug!("catalog revision {revision}, reloading");
        let catalog = Arc::new(self.source.load().await?);
        *cached = Some((revision, catalog.clone()));
        Ok(catalog)
    }

    /// Drop the cached copy; the next read reloads.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }
}
