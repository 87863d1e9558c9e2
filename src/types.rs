//! Shared types written to and read from the generated index.
//!
//! The index is a JSON array of [`AssetRecord`]s. Field names are camelCase on
//! disk because the site renderer consumes the file directly. Every struct that
//! a human may edit carries a flattened `extra` map so keys this crate does not
//! know about (e.g. `rights`) survive a rebuild untouched.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// One of the four fixed output size classes.
///
/// Declaration order is the cover preference order: small before large,
/// 1x before 2x.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    S,
    S2x,
    L,
    L2x,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::S, Tier::S2x, Tier::L, Tier::L2x];

    /// Directory name under the output root, also the key in `sizes`.
    pub fn dir_name(self) -> &'static str {
        match self {
            Tier::S => "s",
            Tier::S2x => "s2x",
            Tier::L => "l",
            Tier::L2x => "l2x",
        }
    }

    pub fn is_small(self) -> bool {
        matches!(self, Tier::S | Tier::S2x)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Encoded output format. Declaration order is the cover preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Avif,
    Webp,
    Jpeg,
    Png,
}

impl Format {
    pub fn extension(self) -> &'static str {
        match self {
            Format::Avif => "avif",
            Format::Webp => "webp",
            Format::Jpeg => "jpeg",
            Format::Png => "png",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Format::Avif => "image/avif",
            Format::Webp => "image/webp",
            Format::Jpeg => "image/jpeg",
            Format::Png => "image/png",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "avif" => Ok(Format::Avif),
            "webp" => Ok(Format::Webp),
            "jpeg" | "jpg" => Ok(Format::Jpeg),
            "png" => Ok(Format::Png),
            other => Err(format!("unsupported output format: {other}")),
        }
    }
}

/// Public URLs of every variant: tier → format → URL.
pub type SizeMap = BTreeMap<Tier, BTreeMap<Format, String>>;

/// First URL in preference order (tier order, then format order).
pub fn preferred_src(sizes: &SizeMap) -> Option<&str> {
    sizes
        .values()
        .flat_map(|formats| formats.values())
        .map(String::as_str)
        .find(|url| !url.is_empty())
}

fn default_kind() -> String {
    "image".to_string()
}

fn null_as_image_kind<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_else(default_kind))
}

/// Hand-edited indexes write `null` for "nothing here"; treat it like a
/// missing key.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn is_image_kind(kind: &str) -> bool {
    kind == "image"
}

/// Related links. Entries are free-form objects authored by hand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Links {
    #[serde(default, deserialize_with = "null_as_default")]
    pub products: Vec<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub related: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Representative variant for a record.
///
/// Every field is optional because covers may be partially hand-authored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cover {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lqip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sizes: Option<SizeMap>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One underlying variant bundle of a record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetBundle {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(default = "default_kind", deserialize_with = "null_as_image_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lqip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sizes: Option<SizeMap>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The unit of the generated index.
///
/// `title`, `alt`, `series`, `characters`, `tags`, `caption` and `links` are
/// human-curated: the pipeline never computes them and only carries them
/// forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRecord {
    pub id: String,
    #[serde(default = "default_kind", deserialize_with = "null_as_image_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub alt: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub series: Vec<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub characters: Vec<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_key: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lqip: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub sizes: SizeMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover: Option<Cover>,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub assets: Vec<AssetBundle>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub caption: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub links: Links,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AssetRecord {
    /// An empty image record with the given id; every other field defaulted.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: default_kind(),
            source: None,
            title: String::new(),
            alt: String::new(),
            series: Vec::new(),
            characters: Vec::new(),
            tags: Vec::new(),
            created_at: None,
            sort_key: None,
            w: None,
            h: None,
            lqip: None,
            sizes: SizeMap::new(),
            cover: None,
            assets: Vec::new(),
            caption: String::new(),
            links: Links::default(),
            extra: Map::new(),
        }
    }

    pub fn is_image(&self) -> bool {
        is_image_kind(&self.kind)
    }

    /// Sort key with a fallback to the parsed `createdAt` for legacy records.
    pub fn effective_sort_key(&self) -> i64 {
        self.sort_key
            .or_else(|| {
                self.created_at
                    .as_deref()
                    .and_then(crate::naming::parse_timestamp_millis)
            })
            .unwrap_or(0)
    }
}

/// Reduced projection of a record for the public client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlimIndexEntry {
    pub id: String,
    pub alt: String,
    pub src: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h: Option<u32>,
    pub tags: Vec<Value>,
    pub has_products: bool,
    pub has_related: bool,
}

impl SlimIndexEntry {
    pub fn from_record(record: &AssetRecord) -> Self {
        let cover = record.cover.as_ref();
        let src = cover
            .and_then(|c| c.src.clone())
            .or_else(|| preferred_src(&record.sizes).map(String::from))
            .unwrap_or_default();
        Self {
            id: record.id.clone(),
            alt: record.alt.clone(),
            src,
            w: cover.and_then(|c| c.w).or(record.w),
            h: cover.and_then(|c| c.h).or(record.h),
            tags: record.tags.clone(),
            has_products: !record.links.products.is_empty(),
            has_related: !record.links.related.is_empty(),
        }
    }
}
