//! Result aggregation: fragments into per-document passages.
//!
//! Search hits arrive in rank order and belong to many files. This module
//! regroups them by file, restores reading order inside each file, ranks the
//! documents, and judges whether the evidence is good enough to answer from.

use regex::Regex;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::config::RetrievalConfig;
use crate::models::{FileRecord, Fragment, PagePosition};
use crate::query::QuerySignals;

/// Coarse document category, in citation preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Manual,
    Other,
    Spreadsheet,
}

const MANUAL_MARKERS: &[&str] = &[
    "manual",
    "manuale",
    "istruzioni",
    "instructions",
    "user guide",
    "bedienungsanleitung",
    "-ba-",
    "_ba_",
    "_ba-",
    "-ba_",
];

const SPREADSHEET_EXTENSIONS: &[&str] = &[".xlsx", ".xls", ".xlsm", ".ods", ".csv"];

impl DocumentKind {
    /// Classify a document from its file name and media type.
    pub fn classify(file_name: &str, media_type: Option<&str>) -> Self {
        let name = file_name.to_lowercase();
        let media = media_type.unwrap_or_default().to_lowercase();

        if SPREADSHEET_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
            || media.contains("spreadsheet")
            || media.contains("excel")
            || media.contains("csv")
        {
            return DocumentKind::Spreadsheet;
        }
        if MANUAL_MARKERS.iter().any(|m| name.contains(m)) {
            return DocumentKind::Manual;
        }
        DocumentKind::Other
    }
}

/// All retrieved fragments of one source document, in reading order.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentGroup {
    pub file_id: String,
    pub file_name: String,
    pub kind: DocumentKind,
    pub media_type: Option<String>,
    pub url: Option<String>,
    /// Highest score among the fragments, `0.0` when none carried one.
    pub best_score: f64,
    pub fragments: Vec<Fragment>,
    /// Fragment texts joined in (page, order) order.
    pub passage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileRecord>,
}

impl DocumentGroup {
    /// First known page of the passage.
    pub fn first_page(&self) -> Option<u32> {
        self.fragments.iter().find_map(|f| f.page.page())
    }

    /// Page of the first fragment whose text satisfies `pred`, if known.
    pub fn page_where(&self, pred: impl Fn(&str) -> bool) -> Option<u32> {
        self.fragments
            .iter()
            .find(|f| pred(&f.text))
            .and_then(|f| match f.page {
                PagePosition::Known(p) => Some(p),
                PagePosition::Unknown => None,
            })
    }

    /// Whether the document, its name, or its fragment metadata names `model`.
    pub fn mentions_model(&self, model: &str) -> bool {
        let keys = model_keys(model);
        let mut haystacks = vec![normalize_model(&self.file_name), normalize_model(&self.passage)];
        for fragment in &self.fragments {
            for value in fragment.properties.values() {
                if let Some(s) = value.as_str() {
                    haystacks.push(normalize_model(s));
                }
            }
        }
        haystacks
            .iter()
            .any(|h| keys.iter().any(|k| h.contains(k.as_str())))
    }
}

/// Lower-case and strip everything but letters and digits: `PLB 620-3M` → `plb6203m`.
pub fn normalize_model(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Normalized keys for a model: the full identifier and, when it has a
/// suffix, the base without it (`plb6203m`, `plb620`).
fn model_keys(model: &str) -> Vec<String> {
    let full = normalize_model(model);
    let mut keys = vec![full.clone()];
    if let Some((base, _)) = model.rsplit_once('-') {
        let base = normalize_model(base);
        if !base.is_empty() && base != full {
            keys.push(base);
        }
    }
    keys
}

/// Group fragments by file and rank the groups.
///
/// Fragments whose file record is flagged deleted are dropped. Within a
/// group fragments follow [`Fragment::position_cmp`]. Groups are ordered by
/// kind (manuals first, spreadsheets last), then best score descending,
/// then file name.
pub fn group_fragments(
    fragments: Vec<Fragment>,
    files: &HashMap<String, FileRecord>,
) -> Vec<DocumentGroup> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<DocumentGroup> = Vec::new();

    for fragment in fragments {
        let record = files.get(&fragment.file_id);
        if record.map(|r| r.deleted).unwrap_or(false) {
            tracing::debug!(file_id = %fragment.file_id, "skipping fragment of deleted file");
            continue;
        }

        let slot = match index.get(&fragment.file_id).copied() {
            Some(i) => i,
            None => {
                let file_name = record
                    .map(|r| r.name.clone())
                    .unwrap_or_else(|| fragment.file_name.clone());
                let media_type = fragment
                    .media_type
                    .clone()
                    .or_else(|| record.and_then(|r| r.file_type.clone()));
                groups.push(DocumentGroup {
                    file_id: fragment.file_id.clone(),
                    kind: DocumentKind::classify(&file_name, media_type.as_deref()),
                    file_name,
                    media_type,
                    url: record.and_then(|r| r.url.clone()),
                    best_score: 0.0,
                    fragments: Vec::new(),
                    passage: String::new(),
                    file: record.cloned(),
                });
                index.insert(fragment.file_id.clone(), groups.len() - 1);
                groups.len() - 1
            }
        };
        groups[slot].fragments.push(fragment);
    }

    for group in &mut groups {
        group.fragments.sort_by(|a, b| a.position_cmp(b));
        group.best_score = group
            .fragments
            .iter()
            .filter_map(fragment_score)
            .fold(0.0, f64::max);
        group.passage = group
            .fragments
            .iter()
            .map(|f| f.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        if group.url.is_none() {
            group.url = group.fragments.iter().find_map(|f| f.source_url.clone());
        }
    }

    groups.sort_by(|a, b| {
        a.kind
            .cmp(&b.kind)
            .then_with(|| {
                b.best_score
                    .partial_cmp(&a.best_score)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.file_name.cmp(&b.file_name))
    });
    groups
}

fn fragment_score(f: &Fragment) -> Option<f64> {
    f.score.or_else(|| f.distance.map(|d| (1.0 - d).max(0.0)))
}

/// How well the retrieved documents support an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strength {
    Strong,
    Weak,
    Empty,
}

/// Groups an answer may rest on: those naming the requested model, or all
/// groups when no model was named. Rank order is preserved.
pub fn relevant_groups<'a>(
    groups: &'a [DocumentGroup],
    signals: &QuerySignals,
) -> Vec<&'a DocumentGroup> {
    match &signals.model {
        Some(model) => groups.iter().filter(|g| g.mentions_model(model)).collect(),
        None => groups.iter().collect(),
    }
}

/// Judge the aggregated evidence for a request.
///
/// Fused hybrid scores are relative to the result set, so the top hit scores
/// high whatever it says. Besides `min_score`, the evidence must therefore
/// name the model, define the asked error code, and cover at least
/// `min_keyword_coverage` of the request's content words in one document.
pub fn assess(
    groups: &[DocumentGroup],
    signals: &QuerySignals,
    retrieval: &RetrievalConfig,
) -> Strength {
    if groups.is_empty() {
        return Strength::Empty;
    }
    let best = groups.iter().map(|g| g.best_score).fold(0.0, f64::max);
    if best < retrieval.min_score {
        return Strength::Weak;
    }

    let mut candidates = relevant_groups(groups, signals);
    if candidates.is_empty() {
        tracing::debug!(model = ?signals.model, "no document names the model");
        return Strength::Weak;
    }
    if let Some(code) = signals.error_code.as_deref() {
        let Some(pattern) = error_code_pattern(code) else {
            return Strength::Weak;
        };
        candidates.retain(|g| pattern.is_match(&g.passage));
        if candidates.is_empty() {
            tracing::debug!(code, "no document defines the error code");
            return Strength::Weak;
        }
    }

    let keywords = signals.content_keywords();
    if !keywords.is_empty() {
        let coverage = candidates
            .iter()
            .map(|g| keyword_coverage(&g.passage, &keywords))
            .fold(0.0, f64::max);
        if coverage < retrieval.min_keyword_coverage {
            tracing::debug!(coverage, "documents miss most of the request");
            return Strength::Weak;
        }
    }
    Strength::Strong
}

/// Share of `keywords` found in `passage`.
///
/// Words are compared on their first five letters so that Italian
/// inflections match (`sostituire` ≡ `sostituzione`).
pub fn keyword_coverage(passage: &str, keywords: &[String]) -> f64 {
    if keywords.is_empty() {
        return 1.0;
    }
    let words: Vec<String> = passage
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    let found = keywords
        .iter()
        .filter(|k| {
            let stem: String = k.to_lowercase().chars().take(5).collect();
            words.iter().any(|w| w.starts_with(&stem))
        })
        .count();
    found as f64 / keywords.len() as f64
}

/// Two official manuals disagreeing on what an error code means.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conflict {
    pub code: String,
    /// `(file name, definition)` per disagreeing manual.
    pub definitions: Vec<(String, String)>,
}

/// Compare the definitions of the asked error code across manual groups.
///
/// Only manuals that actually define the code take part, and only those
/// naming the requested model when one was given: different models may
/// reuse a code for different faults. Definitions are compared after
/// normalization; one containing the other is agreement.
pub fn detect_conflict(groups: &[DocumentGroup], signals: &QuerySignals) -> Option<Conflict> {
    let code = signals.error_code.as_deref()?;
    let pattern = error_code_pattern(code)?;
    let mut definitions: Vec<(String, String)> = Vec::new();

    for group in relevant_groups(groups, signals)
        .into_iter()
        .filter(|g| g.kind == DocumentKind::Manual)
    {
        if let Some(def) = definition_in(&pattern, &group.passage) {
            definitions.push((group.file_name.clone(), def));
        }
    }

    let first = definitions.first()?;
    let base = normalize_definition(&first.1);
    let disagreeing = definitions.iter().skip(1).any(|(_, d)| {
        let other = normalize_definition(d);
        !(base.contains(&other) || other.contains(&base))
    });
    if disagreeing {
        Some(Conflict {
            code: code.to_string(),
            definitions,
        })
    } else {
        None
    }
}

/// Regex matching any spelling of an error code, `Err 04` ≡ `E-4` ≡ `errore 04`.
pub fn error_code_pattern(code: &str) -> Option<Regex> {
    let digits: String = code.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let value = digits.trim_start_matches('0');
    let value = if value.is_empty() { "0" } else { value };
    Regex::new(&format!(
        r"(?i)\b(?:(?:codice\s+(?:di\s+)?errore|error\s+code|errore|error|err)\s*[-:.]?\s*|e[-:]?)0*{}\b",
        value
    ))
    .ok()
}

/// Definition given for `code` in `passage`: the text following the code on
/// its line, up to the end of the sentence.
pub fn definition_of(passage: &str, code: &str) -> Option<String> {
    definition_in(&error_code_pattern(code)?, passage)
}

fn definition_in(pattern: &Regex, passage: &str) -> Option<String> {
    for line in passage.lines() {
        if let Some(m) = pattern.find(line) {
            let rest = line[m.end()..]
                .trim_start_matches(|c: char| c.is_whitespace() || ":-=–>".contains(c));
            let def = rest
                .split(['.', ';'])
                .next()
                .unwrap_or_default()
                .trim();
            if !def.is_empty() {
                return Some(def.to_string());
            }
        }
    }
    None
}

fn normalize_definition(s: &str) -> String {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value};

    fn fragment(uuid: &str, file: &str, page: Option<u32>, text: &str, score: f64) -> Fragment {
        Fragment {
            uuid: uuid.to_string(),
            text: text.to_string(),
            name: None,
            file_id: file.to_string(),
            file_name: file.to_string(),
            media_type: Some("application/pdf".to_string()),
            page: page.map(PagePosition::Known).unwrap_or(PagePosition::Unknown),
            order: None,
            source_url: None,
            score: Some(score),
            distance: None,
            properties: Map::new(),
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(DocumentKind::classify("PLB-BA-it-2211.pdf", None), DocumentKind::Manual);
        assert_eq!(DocumentKind::classify("Manuale_EW.pdf", None), DocumentKind::Manual);
        assert_eq!(DocumentKind::classify("listino.xlsx", None), DocumentKind::Spreadsheet);
        assert_eq!(
            DocumentKind::classify("export", Some("text/csv")),
            DocumentKind::Spreadsheet
        );
        assert_eq!(DocumentKind::classify("PLB-TD-en.pdf", None), DocumentKind::Other);
    }

    #[test]
    fn test_grouping_restores_reading_order() {
        let frags = vec![
            fragment("c", "PLB-BA-it.pdf", Some(14), "3. Riaccendere.", 0.9),
            fragment("a", "PLB-BA-it.pdf", Some(12), "1. Scaricare il piatto.", 0.7),
            fragment("x", "listino.xlsx", Some(1), "PLB 620-3M", 0.95),
            fragment("b", "PLB-BA-it.pdf", None, "Nota finale", 0.2),
        ];
        let groups = group_fragments(frags, &HashMap::new());
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].file_name, "PLB-BA-it.pdf");
        assert_eq!(groups[1].kind, DocumentKind::Spreadsheet);
        let ids: Vec<&str> = groups[0].fragments.iter().map(|f| f.uuid.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
        assert_eq!(
            groups[0].passage,
            "1. Scaricare il piatto.\n3. Riaccendere.\nNota finale"
        );
        assert!((groups[0].best_score - 0.9).abs() < 1e-9);
        assert_eq!(groups[0].first_page(), Some(12));
    }

    #[test]
    fn test_groups_rank_by_score_within_kind() {
        let frags = vec![
            fragment("a", "B-manual.pdf", Some(1), "x", 0.4),
            fragment("b", "A-manual.pdf", Some(1), "y", 0.8),
            fragment("c", "C-manual.pdf", Some(1), "z", 0.8),
        ];
        let names: Vec<String> = group_fragments(frags, &HashMap::new())
            .into_iter()
            .map(|g| g.file_name)
            .collect();
        assert_eq!(names, vec!["A-manual.pdf", "C-manual.pdf", "B-manual.pdf"]);
    }

    #[test]
    fn test_deleted_files_are_dropped() {
        let mut files = HashMap::new();
        files.insert(
            "old.pdf".to_string(),
            FileRecord {
                id: "old.pdf".to_string(),
                name: "old.pdf".to_string(),
                path: None,
                url: None,
                file_type: None,
                modified_at: None,
                indexed_at: None,
                deleted: true,
                note: None,
            },
        );
        let frags = vec![
            fragment("a", "old.pdf", Some(1), "vecchio", 0.9),
            fragment("b", "new-manual.pdf", Some(1), "nuovo", 0.5),
        ];
        let groups = group_fragments(frags, &files);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].file_name, "new-manual.pdf");
    }

    #[test]
    fn test_model_mention_is_normalized() {
        let mut f = fragment("a", "BA-it.pdf", Some(1), "Bilancia plb620-3m", 0.9);
        let groups = group_fragments(vec![f.clone()], &HashMap::new());
        assert!(groups[0].mentions_model("PLB 620-3M"));
        assert!(!groups[0].mentions_model("EW 4200-2NM"));

        f.text = "testo".to_string();
        let mut props = Map::new();
        props.insert("model".to_string(), Value::String("PLB 620".to_string()));
        f.properties = props;
        let groups = group_fragments(vec![f], &HashMap::new());
        assert!(groups[0].mentions_model("PLB 620-3M"));
    }

    fn retrieval() -> RetrievalConfig {
        RetrievalConfig::default()
    }

    #[test]
    fn test_assess() {
        let signals = QuerySignals::extract("Err 04 sulla PLB 620-3M");
        assert_eq!(assess(&[], &signals, &retrieval()), Strength::Empty);

        let low = group_fragments(
            vec![fragment("a", "PLB-manual.pdf", Some(1), "PLB 620-3M Err 04", 0.1)],
            &HashMap::new(),
        );
        assert_eq!(assess(&low, &signals, &retrieval()), Strength::Weak);

        let other_model = group_fragments(
            vec![fragment("a", "EW-manual.pdf", Some(1), "EW 4200 Err 04", 0.9)],
            &HashMap::new(),
        );
        assert_eq!(assess(&other_model, &signals, &retrieval()), Strength::Weak);

        let good = group_fragments(
            vec![fragment("a", "PLB-manual.pdf", Some(1), "PLB 620-3M Err 04", 0.9)],
            &HashMap::new(),
        );
        assert_eq!(assess(&good, &signals, &retrieval()), Strength::Strong);
    }

    #[test]
    fn test_undefined_error_code_is_weak() {
        let signals = QuerySignals::extract("Err 99 sulla PLB 620-3M, cosa significa?");
        let groups = group_fragments(
            vec![
                fragment("a", "PLB-BA-it.pdf", Some(12), "PLB 620-3M Err 04: sovraccarico.", 0.9),
                fragment("b", "PLB-BA-it.pdf", Some(13), "1. Rimuovere il carico dal piatto.", 0.8),
            ],
            &HashMap::new(),
        );
        assert_eq!(assess(&groups, &signals, &retrieval()), Strength::Weak);
    }

    #[test]
    fn test_code_must_be_defined_for_the_named_model() {
        let signals = QuerySignals::extract("Err 04 sulla PLB 620-3M");
        let groups = group_fragments(
            vec![
                fragment("a", "EW-BA-it.pdf", Some(5), "EW 4200-2NM Err 04: batteria scarica.", 0.9),
                fragment("b", "PLB-TD-it.pdf", Some(1), "PLB 620-3M dati tecnici", 0.7),
            ],
            &HashMap::new(),
        );
        assert_eq!(assess(&groups, &signals, &retrieval()), Strength::Weak);
    }

    #[test]
    fn test_unrelated_top_passage_is_weak() {
        let signals = QuerySignals::extract("manuale: come sostituire la cella di carico");
        let groups = group_fragments(
            vec![fragment(
                "a",
                "PLB-BA-it.pdf",
                Some(20),
                "Pulizia del paravento con panno morbido, togliere il carico.",
                1.0,
            )],
            &HashMap::new(),
        );
        assert_eq!(assess(&groups, &signals, &retrieval()), Strength::Weak);

        let covering = group_fragments(
            vec![fragment(
                "a",
                "PLB-BA-it.pdf",
                Some(31),
                "Sostituzione della cella di carico: scollegare il cavo.",
                1.0,
            )],
            &HashMap::new(),
        );
        assert_eq!(assess(&covering, &signals, &retrieval()), Strength::Strong);
    }

    #[test]
    fn test_keyword_coverage_matches_inflections() {
        let keywords = vec!["sostituire".to_string(), "batteria".to_string()];
        assert_eq!(keyword_coverage("Sostituzione delle batterie", &keywords), 1.0);
        assert_eq!(keyword_coverage("Pulizia del piatto", &keywords), 0.0);
        assert_eq!(keyword_coverage("qualsiasi", &[]), 1.0);
    }

    #[test]
    fn test_conflicting_definitions() {
        let frags = vec![
            fragment("a", "PLB-manual-2019.pdf", Some(3), "Err 04: sovraccarico del piatto.", 0.9),
            fragment("b", "PLB-manual-2023.pdf", Some(5), "E-4 = batteria scarica.", 0.8),
        ];
        let groups = group_fragments(frags, &HashMap::new());
        let signals = QuerySignals::extract("cosa indica Err 04?");
        let conflict = detect_conflict(&groups, &signals).unwrap();
        assert_eq!(conflict.definitions.len(), 2);
        assert_eq!(conflict.definitions[0].1, "sovraccarico del piatto");
    }

    #[test]
    fn test_other_models_reusing_a_code_do_not_conflict() {
        let frags = vec![
            fragment("a", "PLB-BA-it.pdf", Some(12), "PLB 620-3M Err 04: sovraccarico.", 0.9),
            fragment("b", "EW-BA-it.pdf", Some(7), "EW 4200-2NM Err 04: batteria scarica.", 0.9),
        ];
        let groups = group_fragments(frags, &HashMap::new());
        let signals = QuerySignals::extract("Err 04 sulla PLB 620-3M");
        assert_eq!(detect_conflict(&groups, &signals), None);

        let unscoped = QuerySignals::extract("cosa indica Err 04?");
        assert!(detect_conflict(&groups, &unscoped).is_some());
    }

    #[test]
    fn test_agreeing_definitions_are_not_a_conflict() {
        let frags = vec![
            fragment("a", "PLB-manual-it.pdf", Some(3), "Err 04: Sovraccarico.", 0.9),
            fragment("b", "PLB-manual-v2.pdf", Some(5), "Err04 - sovraccarico del piatto", 0.8),
            fragment("c", "listino.xlsx", Some(1), "Err 04: ricambio 123", 0.8),
        ];
        let groups = group_fragments(frags, &HashMap::new());
        let signals = QuerySignals::extract("cosa indica Err 04?");
        assert_eq!(detect_conflict(&groups, &signals), None);
    }

    #[test]
    fn test_error_pattern_ignores_other_codes() {
        let re = error_code_pattern("Err 04").unwrap();
        assert!(re.is_match("errore 4"));
        assert!(re.is_match("ERR04"));
        assert!(!re.is_match("Err 40"));
        assert!(!re.is_match("Err 14"));
        assert!(!re.is_match("piatto e 4 viti"));
    }
}
