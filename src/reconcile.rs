//! Metadata reconciliation.
//!
//! Every run recomputes the technical half of each record (dimensions, URLs,
//! placeholder) and must splice it onto the human half (title, alt, tags,
//! links...) of whatever record described the same source last time.
//!
//! ## Prior records
//!
//! Two files describe earlier runs:
//!
//! - the **canonical** index, hand-curated and read-only, and
//! - the last **generated** index.
//!
//! A record present in the canonical file wins as a whole; generated records
//! whose id the canonical file does not know are appended after it. The
//! generated copy of a record is still consulted for one thing: it holds the
//! `createdAt` the current `sortKey` was computed from.
//!
//! ## Identity resolution
//!
//! The [`Matcher`]s run in a fixed order and the first hit wins:
//!
//! 1. [`Matcher::Source`]: `source` equals the relative path.
//! 2. [`Matcher::StemId`]: `id` equals the (whitespace-normalized) filename stem.
//! 3. [`Matcher::LegacyUrl`]: a small-tier URL contains `/{stem}.`, for
//!    records written before `source` existed.
//!
//! A record claimed by one source is invisible to later sources, so two files
//! never share a record. The legacy matcher can still hit several records when
//! two directories hold the same stem; the first one in prior order is taken
//! and a warning names the others.
//!
//! ## Field precedence
//!
//! | Field | Rule |
//! |---|---|
//! | `id` | prior → adopted stem token → minted from `createdAt` |
//! | `createdAt` | prior → source mtime |
//! | `sortKey` | frozen while `createdAt` is unchanged, else recomputed |
//! | human fields, unknown keys | prior, verbatim |
//! | `w`, `h`, `lqip`, `sizes` | computed |
//! | `cover` | see [`merge_cover`] |
//! | `assets` | see [`merge_assets`] |

use crate::naming::{
    file_stem, is_time_sortable_token, iso_timestamp, mint_token, parse_timestamp_millis,
};
use crate::sources::SourceImage;
use crate::types::{AssetBundle, AssetRecord, Cover, SizeMap, Tier, preferred_src};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, warn};

/// Identity matching strategy, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Matcher {
    Source,
    StemId,
    LegacyUrl,
}

impl Matcher {
    pub const ORDER: [Matcher; 3] = [Matcher::Source, Matcher::StemId, Matcher::LegacyUrl];

    pub fn matches(self, record: &AssetRecord, relative: &str, stem: &str) -> bool {
        match self {
            Matcher::Source => record.source.as_deref() == Some(relative),
            Matcher::StemId => !stem.is_empty() && record.id == stem,
            Matcher::LegacyUrl => {
                let needle = format!("/{stem}.");
                !stem.is_empty()
                    && record
                        .sizes
                        .get(&Tier::S)
                        .is_some_and(|formats| formats.values().any(|url| url.contains(&needle)))
            }
        }
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Matcher::Source => "source",
            Matcher::StemId => "stem-id",
            Matcher::LegacyUrl => "legacy-url",
        })
    }
}

/// Resolved identity of one source, decided before its variants are rendered.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub id: String,
    pub created_at: String,
    pub sort_key: i64,
    pub matched_by: Option<Matcher>,
    prior: Option<usize>,
}

impl Identity {
    pub fn is_new(&self) -> bool {
        self.prior.is_none()
    }
}

/// Technical fields measured for one source this run.
#[derive(Debug, Clone, PartialEq)]
pub struct Computed {
    pub relative: String,
    pub width: u32,
    pub height: u32,
    pub lqip: Option<String>,
    pub sizes: SizeMap,
}

/// `sortKey` for a record whose `createdAt` resolved to `created_at`.
///
/// `last_generated` is the record as the previous run wrote it; its
/// `createdAt` is what the stored key was derived from. Without it the prior
/// record itself is the basis.
pub fn resolve_sort_key(
    prior: Option<&AssetRecord>,
    last_generated: Option<&AssetRecord>,
    created_at: &str,
) -> i64 {
    let epoch = parse_timestamp_millis(created_at).unwrap_or_else(|| {
        warn!(created_at, "unparseable createdAt, sorting at epoch 0");
        0
    });
    let Some(prior) = prior else {
        return epoch;
    };
    let basis = last_generated.unwrap_or(prior);
    match (basis.sort_key, basis.created_at.as_deref()) {
        (Some(key), Some(previous)) if previous == created_at => key,
        _ => epoch,
    }
}

/// Merge the computed cover onto a prior one.
///
/// Image records always get fresh `sizes` and `lqip`; every other field, and
/// every field of non-image records, is only filled when absent.
pub fn merge_cover(is_image: bool, prior: Option<&Cover>, computed: Cover) -> Cover {
    let Some(prior) = prior else {
        return computed;
    };
    let mut cover = prior.clone();
    fill_text(&mut cover.kind, computed.kind);
    fill_text(&mut cover.asset_id, computed.asset_id);
    fill_text(&mut cover.src, computed.src);
    fill(&mut cover.w, computed.w);
    fill(&mut cover.h, computed.h);
    if is_image {
        cover.sizes = computed.sizes;
        cover.lqip = computed.lqip;
    } else {
        fill(&mut cover.sizes, computed.sizes);
        fill_text(&mut cover.lqip, computed.lqip);
    }
    cover
}

fn fill<T>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        *slot = value;
    }
}

/// Like [`fill`], but an empty string also counts as absent.
fn fill_text(slot: &mut Option<String>, value: Option<String>) {
    if slot.as_deref().is_none_or(str::is_empty) {
        *slot = value.filter(|v| !v.is_empty()).or(slot.take());
    }
}

/// Merge the computed image bundle into the prior `assets` list.
///
/// For image records the bundle matching by id or source is refreshed in
/// place (keeping its own id and any extra keys) or appended. Non-image
/// records keep their hand-authored list when they have one.
pub fn merge_assets(is_image: bool, prior: &[AssetBundle], computed: AssetBundle) -> Vec<AssetBundle> {
    if !is_image {
        return if prior.is_empty() {
            vec![computed]
        } else {
            prior.to_vec()
        };
    }
    let mut assets = prior.to_vec();
    match assets.iter_mut().find(|a| bundle_matches(a, &computed)) {
        Some(existing) => {
            existing.kind = computed.kind;
            existing.source = computed.source;
            existing.w = computed.w;
            existing.h = computed.h;
            existing.lqip = computed.lqip;
            existing.sizes = computed.sizes;
        }
        None => assets.push(computed),
    }
    assets
}

fn bundle_matches(bundle: &AssetBundle, computed: &AssetBundle) -> bool {
    (!bundle.id.is_empty() && bundle.id == computed.id)
        || (bundle.source.is_some() && bundle.source == computed.source)
}

/// Stateful reconciler for one run.
pub struct Reconciler {
    prior: Vec<AssetRecord>,
    generated: HashMap<String, AssetRecord>,
    claimed: Vec<bool>,
    used_ids: HashSet<String>,
}

impl Reconciler {
    /// Build from the canonical records and the last generated index.
    pub fn new(canonical: Vec<AssetRecord>, generated: Vec<AssetRecord>) -> Self {
        let known: HashSet<String> = canonical.iter().map(|r| r.id.clone()).collect();
        let mut prior = canonical;
        let mut last = HashMap::new();
        for record in generated {
            if !known.contains(&record.id) {
                prior.push(record.clone());
            }
            last.insert(record.id.clone(), record);
        }
        let used_ids = prior.iter().map(|r| r.id.clone()).collect();
        Self {
            claimed: vec![false; prior.len()],
            prior,
            generated: last,
            used_ids,
        }
    }

    pub fn prior_len(&self) -> usize {
        self.prior.len()
    }

    /// First unclaimed prior record for `relative`, with the matcher that hit.
    fn find(&self, relative: &str) -> Option<(usize, Matcher)> {
        let stem = file_stem(relative);
        for matcher in Matcher::ORDER {
            let hits: Vec<usize> = self
                .prior
                .iter()
                .enumerate()
                .filter(|&(i, r)| !self.claimed[i] && matcher.matches(r, relative, &stem))
                .map(|(i, _)| i)
                .collect();
            if let Some(&first) = hits.first() {
                if hits.len() > 1 {
                    let ids: Vec<&str> = hits.iter().map(|&i| self.prior[i].id.as_str()).collect();
                    warn!(
                        source = relative,
                        %matcher,
                        candidates = ?ids,
                        "ambiguous identity match, taking the first"
                    );
                }
                return Some((first, matcher));
            }
        }
        None
    }

    /// Resolve id, `createdAt` and `sortKey` for a source, claiming its prior record.
    pub fn identify(&mut self, source: &SourceImage) -> Identity {
        let found = self.find(&source.relative);
        let prior = found.map(|(i, _)| &self.prior[i]);

        let created_at = prior
            .and_then(|r| r.created_at.clone())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| iso_timestamp(source.modified));
        let last_generated = prior.and_then(|r| self.generated.get(&r.id));
        let sort_key = resolve_sort_key(prior, last_generated, &created_at);

        let id = match prior {
            Some(record) => record.id.clone(),
            None => self.new_id(&source.relative, &created_at),
        };

        if let Some((index, matcher)) = found {
            self.claimed[index] = true;
            debug!(source = %source.relative, %id, %matcher, "matched prior record");
        }
        self.used_ids.insert(id.clone());
        Identity {
            id,
            created_at,
            sort_key,
            matched_by: found.map(|(_, m)| m),
            prior: found.map(|(i, _)| i),
        }
    }

    fn new_id(&self, relative: &str, created_at: &str) -> String {
        let stem = file_stem(relative);
        if is_time_sortable_token(&stem) && !self.used_ids.contains(&stem) {
            return stem;
        }
        let millis = parse_timestamp_millis(created_at).unwrap_or(0);
        mint_token(millis, relative)
    }

    /// The prior record an identity was matched to, unchanged.
    pub fn prior_record(&self, identity: &Identity) -> Option<&AssetRecord> {
        identity.prior.map(|i| &self.prior[i])
    }

    /// Produce the updated record for an identified source.
    pub fn build_record(&self, identity: &Identity, computed: Computed) -> AssetRecord {
        let prior = identity.prior.map(|i| &self.prior[i]);
        let mut record = prior
            .cloned()
            .unwrap_or_else(|| AssetRecord::new(identity.id.as_str()));
        if record.kind.is_empty() {
            record.kind = "image".to_string();
        }
        let is_image = record.is_image();

        let bundle = AssetBundle {
            id: record
                .assets
                .iter()
                .find(|a| a.source.as_deref() == Some(computed.relative.as_str()) && !a.id.is_empty())
                .map(|a| a.id.clone())
                .unwrap_or_else(|| identity.id.clone()),
            kind: "image".to_string(),
            source: Some(computed.relative.clone()),
            w: Some(computed.width),
            h: Some(computed.height),
            lqip: computed.lqip.clone(),
            sizes: Some(computed.sizes.clone()),
            extra: Default::default(),
        };
        let default_cover = Cover {
            kind: Some("image".to_string()),
            asset_id: Some(bundle.id.clone()),
            src: preferred_src(&computed.sizes).map(String::from),
            w: Some(computed.width),
            h: Some(computed.height),
            lqip: computed.lqip.clone(),
            sizes: Some(computed.sizes.clone()),
            extra: Default::default(),
        };

        record.id = identity.id.clone();
        record.source = Some(computed.relative);
        record.created_at = Some(identity.created_at.clone());
        record.sort_key = Some(identity.sort_key);
        record.w = Some(computed.width);
        record.h = Some(computed.height);
        record.lqip = computed.lqip;
        record.sizes = computed.sizes;
        record.cover = Some(merge_cover(is_image, record.cover.as_ref(), default_cover));
        record.assets = merge_assets(is_image, &record.assets, bundle);
        record
    }

    /// Prior records no source claimed this run.
    ///
    /// With `prune_missing_sources`, records that name a `source` are dropped;
    /// records without one (hand-authored or legacy) are always kept.
    pub fn into_orphans(self, prune_missing_sources: bool) -> Vec<AssetRecord> {
        self.prior
            .into_iter()
            .zip(self.claimed)
            .filter(|(_, claimed)| !claimed)
            .map(|(record, _)| record)
            .filter(|record| {
                let keep = !prune_missing_sources || record.source.is_none();
                if !keep {
                    debug!(id = %record.id, "pruning record with missing source");
                }
                keep
            })
            .collect()
    }
}
