//! Core data types shared by the backends, the tools, and the assistant.
//!
//! - [`SearchHit`] — one raw object returned by a backend search.
//! - [`Fragment`] — a hit mapped onto the fragment schema.
//! - [`FileRecord`] — metadata of one source document.
//! - [`PagePosition`] — page number or unknown.

use serde::Serialize;
use serde_json::{Map, Value};
use std::cmp::Ordering;

use crate::config::{FileFields, FragmentFields};

/// A raw object returned by a backend search, before schema mapping.
///
/// Serializes to the tool wire shape: `{uuid, properties, bm25_score, distance}`.
/// `bm25_score` carries whatever score the search mode produced (BM25 for
/// keyword search, fused score for hybrid search).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchHit {
    pub uuid: String,
    pub properties: Map<String, Value>,
    #[serde(rename = "bm25_score")]
    pub score: Option<f64>,
    pub distance: Option<f64>,
}

/// Page of a fragment inside its source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PagePosition {
    Known(u32),
    Unknown,
}

impl PagePosition {
    /// Missing, `null`, negative, and non-numeric values are unknown.
    pub fn from_value(value: Option<&Value>) -> Self {
        match value {
            Some(Value::Number(n)) => match n.as_i64() {
                Some(p) if p >= 0 => PagePosition::Known(p as u32),
                Some(_) => PagePosition::Unknown,
                None => n
                    .as_f64()
                    .filter(|p| *p >= 0.0)
                    .map(|p| PagePosition::Known(p as u32))
                    .unwrap_or(PagePosition::Unknown),
            },
            Some(Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .ok()
                .filter(|p| *p >= 0)
                .map(|p| PagePosition::Known(p as u32))
                .unwrap_or(PagePosition::Unknown),
            _ => PagePosition::Unknown,
        }
    }

    pub fn page(&self) -> Option<u32> {
        match self {
            PagePosition::Known(p) => Some(*p),
            PagePosition::Unknown => None,
        }
    }
}

impl PartialOrd for PagePosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PagePosition {
    /// Known pages ascend; unknown pages sort last.
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (PagePosition::Known(a), PagePosition::Known(b)) => a.cmp(b),
            (PagePosition::Known(_), PagePosition::Unknown) => Ordering::Less,
            (PagePosition::Unknown, PagePosition::Known(_)) => Ordering::Greater,
            (PagePosition::Unknown, PagePosition::Unknown) => Ordering::Equal,
        }
    }
}

/// A segment of document text tagged with file, page and order.
#[derive(Debug, Clone, Serialize)]
pub struct Fragment {
    pub uuid: String,
    pub text: String,
    pub name: Option<String>,
    pub file_id: String,
    pub file_name: String,
    pub media_type: Option<String>,
    pub page: PagePosition,
    pub order: Option<i64>,
    pub source_url: Option<String>,
    pub score: Option<f64>,
    pub distance: Option<f64>,
    /// Raw properties as returned by the backend.
    #[serde(skip)]
    pub properties: Map<String, Value>,
}

impl Fragment {
    /// Map a raw hit onto the fragment schema.
    ///
    /// The file id falls back to the file name, and the file name falls back
    /// to the object name, so every fragment can be grouped.
    pub fn from_hit(hit: &SearchHit, fields: &FragmentFields) -> Self {
        let props = &hit.properties;
        let name = string_prop(props, &fields.name);
        let file_name = string_prop(props, &fields.file)
            .or_else(|| name.clone())
            .unwrap_or_else(|| hit.uuid.clone());
        let file_id = fields
            .file_id
            .as_deref()
            .and_then(|key| string_prop(props, key))
            .unwrap_or_else(|| file_name.clone());
        let order = fields
            .order
            .as_deref()
            .and_then(|key| props.get(key))
            .and_then(|v| v.as_i64().or_else(|| v.as_str()?.trim().parse().ok()));

        Self {
            uuid: hit.uuid.clone(),
            text: string_prop(props, &fields.text).unwrap_or_default(),
            name,
            file_id,
            file_name,
            media_type: string_prop(props, &fields.media_type),
            page: PagePosition::from_value(props.get(&fields.page)),
            order,
            source_url: fields
                .url
                .as_deref()
                .and_then(|key| string_prop(props, key)),
            score: hit.score,
            distance: hit.distance,
            properties: props.clone(),
        }
    }

    /// Ordering inside a document: page, then order index, then uuid.
    pub fn position_cmp(&self, other: &Self) -> Ordering {
        self.page
            .cmp(&other.page)
            .then_with(|| match (self.order, other.order) {
                (Some(a), Some(b)) => a.cmp(&b),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .then_with(|| self.uuid.cmp(&other.uuid))
    }
}

/// Metadata describing one source document.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FileRecord {
    pub id: String,
    pub name: String,
    pub path: Option<String>,
    pub url: Option<String>,
    pub file_type: Option<String>,
    pub modified_at: Option<String>,
    pub indexed_at: Option<String>,
    pub deleted: bool,
    pub note: Option<String>,
}

impl FileRecord {
    pub fn from_hit(hit: &SearchHit, fields: &FileFields) -> Self {
        let props = &hit.properties;
        let id = string_prop(props, &fields.id).unwrap_or_else(|| hit.uuid.clone());
        Self {
            name: string_prop(props, &fields.name).unwrap_or_else(|| id.clone()),
            id,
            path: string_prop(props, &fields.path),
            url: string_prop(props, &fields.url),
            file_type: string_prop(props, &fields.file_type),
            modified_at: string_prop(props, &fields.modified_at),
            indexed_at: string_prop(props, &fields.indexed_at),
            deleted: props
                .get(&fields.deleted)
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            note: string_prop(props, &fields.note),
        }
    }
}

fn string_prop(props: &Map<String, Value>, key: &str) -> Option<String> {
    match props.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
