use std::fmt;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

/// Width of the `YYYY-MM-DD-HH:MM` suffix every slot key ends with.
const SUFFIX_LEN: usize = 16;

/// Normalize a free-text field name into the slug used inside slot keys.
///
/// Lower-cases, folds Latin letters to their ASCII spelling and drops every
/// character that is not an ASCII letter or digit. `"Cancha 5 - B"`,
/// `"cancha5-b"` and `"CANCHA 5 B"` all become `"cancha5b"`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars().flat_map(char::to_lowercase) {
        match fold_latin(c) {
            Some(folded) => slug.push_str(folded),
            None if c.is_ascii_alphanumeric() => slug.push(c),
            None => {}
        }
    }
    slug
}

/// ASCII spelling of a lower-case Latin letter outside ASCII. Ligatures and
/// letters without a base form spell out as two letters.
fn fold_latin(c: char) -> Option<&'static str> {
    let folded = match c {
        'á' | 'à' | 'â' | 'ä' | 'ã' | 'å' | 'ā' | 'ă' | 'ą' => "a",
        'ç' | 'ć' | 'č' | 'ĉ' | 'ċ' => "c",
        'ď' | 'đ' | 'ð' => "d",
        'é' | 'è' | 'ê' | 'ë' | 'ē' | 'ĕ' | 'ė' | 'ę' | 'ě' => "e",
        'ĝ' | 'ğ' | 'ġ' | 'ģ' => "g",
        'ĥ' | 'ħ' => "h",
        'í' | 'ì' | 'î' | 'ï' | 'ī' | 'ĭ' | 'į' | 'ı' => "i",
        'ĵ' => "j",
        'ķ' => "k",
        'ĺ' | 'ļ' | 'ľ' | 'ŀ' | 'ł' => "l",
        'ñ' | 'ń' | 'ņ' | 'ň' => "n",
        'ó' | 'ò' | 'ô' | 'ö' | 'õ' | 'ō' | 'ŏ' | 'ő' | 'ø' => "o",
        'ŕ' | 'ŗ' | 'ř' => "r",
        'ś' | 'ŝ' | 'ş' | 'š' | 'ș' => "s",
        'ţ' | 'ť' | 'ŧ' | 'ț' => "t",
        'ú' | 'ù' | 'û' | 'ü' | 'ū' | 'ŭ' | 'ů' | 'ű' | 'ų' => "u",
        'ŵ' => "w",
        'ý' | 'ÿ' | 'ŷ' => "y",
        'ź' | 'ż' | 'ž' => "z",
        'æ' => "ae",
        'œ' => "oe",
        'ß' => "ss",
        'þ' => "th",
        _ => return None,
    };
    Some(folded)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlotKeyError {
    #[error("slot key too short: {0:?}")]
    TooShort(String),
    #[error("slot key has no YYYY-MM-DD-HH:MM suffix: {0:?}")]
    BadSuffix(String),
    #[error("slot key has no field segment: {0:?}")]
    MissingField(String),
    #[error("slot key has an empty complex id: {0:?}")]
    MissingComplex(String),
}

/// A bookable unit: one field of one complex at one date and start time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Slot {
    pub complex_id: String,
    /// Already slugified field name.
    pub field: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
}

impl Slot {
    /// Build a slot from a raw field name; the name is slugified.
    pub fn new(complex_id: &str, field_name: &str, date: NaiveDate, time: NaiveTime) -> Self {
        Self {
            complex_id: complex_id.trim().to_string(),
            field: slugify(field_name),
            date,
            time,
        }
    }

    pub fn key(&self) -> SlotKey {
        SlotKey(format!(
            "{}-{}-{}-{}",
            self.complex_id,
            self.field,
            self.date.format("%Y-%m-%d"),
            self.time.format("%H:%M")
        ))
    }
}

/// Canonical string form of a [`Slot`]: `{complex}-{field}-{YYYY-MM-DD}-{HH:MM}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotKey(String);

impl SlotKey {
    /// Validate and wrap an externally supplied key.
    pub fn parse(raw: &str) -> Result<Self, SlotKeyError> {
        parse_components(raw)?;
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recover the slot components. Keys built by [`Slot::key`] always parse.
    pub fn slot(&self) -> Result<Slot, SlotKeyError> {
        parse_components(&self.0)
    }

    /// Complex id prefix, or the whole key if it does not parse.
    pub fn complex_id(&self) -> &str {
        match split_prefix(&self.0) {
            Ok((complex, _, _)) => complex,
            Err(_) => &self.0,
        }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&Slot> for SlotKey {
    fn from(slot: &Slot) -> Self {
        slot.key()
    }
}

/// Split `raw` into (complex, field, suffix), anchoring on the fixed-width
/// date/time suffix. Complex ids may contain `-`; field slugs never do.
fn split_prefix(raw: &str) -> Result<(&str, &str, &str), SlotKeyError> {
    // the shortest valid key is "c-f-" followed by the suffix
    if raw.len() < SUFFIX_LEN + 4 {
        return Err(SlotKeyError::TooShort(raw.to_string()));
    }
    let cut = raw.len() - SUFFIX_LEN;
    if !raw.is_char_boundary(cut) || !raw[cut..].is_ascii() {
        return Err(SlotKeyError::BadSuffix(raw.to_string()));
    }
    let (head, suffix) = raw.split_at(cut);
    let head = head
        .strip_suffix('-')
        .ok_or_else(|| SlotKeyError::BadSuffix(raw.to_string()))?;
    let (complex, field) = head
        .rsplit_once('-')
        .ok_or_else(|| SlotKeyError::MissingField(raw.to_string()))?;
    if field.is_empty() || !field.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
        return Err(SlotKeyError::MissingField(raw.to_string()));
    }
    if complex.is_empty() {
        return Err(SlotKeyError::MissingComplex(raw.to_string()));
    }
    Ok((complex, field, suffix))
}

fn parse_components(raw: &str) -> Result<Slot, SlotKeyError> {
    let (complex, field, suffix) = split_prefix(raw)?;
    let bad = || SlotKeyError::BadSuffix(raw.to_string());

    let (date, time) = suffix.split_at(10);
    let time = time.strip_prefix('-').ok_or_else(bad)?;
    // chrono accepts single-digit fields; the grammar does not
    let shape_ok = date.bytes().enumerate().all(|(i, b)| match i {
        4 | 7 => b == b'-',
        _ => b.is_ascii_digit(),
    }) && time.len() == 5
        && time.bytes().enumerate().all(|(i, b)| match i {
            2 => b == b':',
            _ => b.is_ascii_digit(),
        });
    if !shape_ok {
        return Err(bad());
    }
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| bad())?;
    let time = NaiveTime::parse_from_str(time, "%H:%M").map_err(|_| bad())?;

    Ok(Slot {
        complex_id: complex.to_string(),
        field: field.to_string(),
        date,
        time,
    })
}
