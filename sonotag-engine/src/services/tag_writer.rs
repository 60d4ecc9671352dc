//! Tag namespace and file tag application
//!
//! Every key sonotag writes lives under one namespace prefix: numeric
//! per-label scores, the three array-valued mood tiers, and a
//! tagger-version marker. The byte-level framing per container type
//! (ID3/MP4/Vorbis) is lofty's concern; this module only builds the
//! key/value map and hands lofty an already-filtered view of it.

use crate::types::{HeadOutput, MoodTagSet};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

use lofty::config::{ParseOptions, WriteOptions};
use lofty::file::TaggedFileExt;
use lofty::prelude::TagExt;
use lofty::probe::Probe;
use lofty::tag::{ItemKey, ItemValue, Tag, TagItem};

/// Namespace prefix for every written key
pub const TAG_NAMESPACE: &str = "sonotag:";
/// Tagger-version marker key
pub const TAGGER_VERSION_KEY: &str = "sonotag:tagger-version";

/// One tag value
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Text(String),
    Number(f64),
    List(Vec<String>),
}

/// An already-filtered map of namespaced keys to values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagMap {
    values: BTreeMap<String, TagValue>,
}

impl TagMap {
    pub fn insert(&mut self, key: String, value: TagValue) {
        debug_assert!(key.starts_with(TAG_NAMESPACE));
        self.values.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&TagValue> {
        self.values.get(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TagValue)> {
        self.values.iter()
    }
}

/// Build the tag map for one file: per-label scores, mood tier
/// arrays (empty tiers omitted), and the version marker.
pub fn build_tag_map(outputs: &[HeadOutput], mood: &MoodTagSet, tagger_version: &str) -> TagMap {
    let mut tags = TagMap::default();

    for output in outputs {
        let key = score_key(&output.head_name, &output.label);
        tags.insert(key, TagValue::Number(output.value() as f64));
    }

    for (tier_key, labels) in mood.as_map() {
        tags.insert(
            format!("{}{}", TAG_NAMESPACE, tier_key),
            TagValue::List(labels.iter().cloned().collect()),
        );
    }

    tags.insert(
        TAGGER_VERSION_KEY.to_string(),
        TagValue::Text(tagger_version.to_string()),
    );

    tags
}

/// `sonotag:{head}:{label}`
pub fn score_key(head_name: &str, label: &str) -> String {
    format!("{}{}:{}", TAG_NAMESPACE, head_name, label)
}

/// Apply a tag map to an audio file in place.
///
/// Existing sonotag-namespaced items are replaced; everything else in
/// the file's primary tag survives untouched. Intended as the
/// `write_fn` given to the safe writer — it must never run against a
/// library original directly.
pub fn apply_tags(path: &Path, tags: &TagMap) -> Result<()> {
    let mut tagged = Probe::open(path)
        .with_context(|| format!("open for tagging: {}", path.display()))?
        .options(ParseOptions::new())
        .read()
        .with_context(|| format!("read tags: {}", path.display()))?;

    let tag_type = tagged.primary_tag_type();
    let tag = match tagged.primary_tag_mut() {
        Some(tag) => tag,
        None => {
            tagged.insert_tag(Tag::new(tag_type));
            tagged
                .primary_tag_mut()
                .context("freshly inserted tag missing")?
        }
    };

    apply_to_tag(tag, tags);

    tag.save_to_path(path, WriteOptions::default())
        .with_context(|| format!("save tags: {}", path.display()))?;

    debug!(path = %path.display(), keys = tags.len(), "Tags applied");
    Ok(())
}

/// Replace the sonotag namespace in a tag wholesale; foreign items
/// survive untouched.
pub fn apply_to_tag(tag: &mut Tag, tags: &TagMap) {
    tag.retain(|item| match item.key() {
        ItemKey::Unknown(key) => !key.starts_with(TAG_NAMESPACE),
        _ => true,
    });

    for (key, value) in tags.iter() {
        match value {
            TagValue::Text(text) => {
                tag.push(TagItem::new(
                    ItemKey::Unknown(key.clone()),
                    ItemValue::Text(text.clone()),
                ));
            }
            TagValue::Number(n) => {
                tag.push(TagItem::new(
                    ItemKey::Unknown(key.clone()),
                    ItemValue::Text(format!("{:.6}", n)),
                ));
            }
            TagValue::List(items) => {
                for item in items {
                    tag.push(TagItem::new(
                        ItemKey::Unknown(key.clone()),
                        ItemValue::Text(item.clone()),
                    ));
                }
            }
        }
    }
}

/// Adapt a tag map into the safe writer's `write_fn` shape.
pub fn tag_write_fn(tags: TagMap) -> impl FnOnce(&Path) -> Result<()> {
    move |path: &Path| apply_tags(path, &tags)
}
