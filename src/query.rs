//! Query formulation from a free-text support request.
//!
//! [`QuerySignals::extract`] pulls out the model identifier, series, error
//! code, and document type. [`formulate`] turns them into the search string,
//! [`reformulate`] produces the broader query for the single retry, and
//! [`clarification`] decides whether the assistant must ask first.

use patterns::{DOC_TYPE_TERMS, ERROR_RE, MODEL_RE, STOPWORDS};
use serde::Serialize;

/// Kind of document the user is asking about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Manual,
    Datasheet,
    Certificate,
    SpareParts,
}

impl DocumentType {
    /// Term added to the search query for this document type.
    pub fn query_term(&self) -> &'static str {
        match self {
            DocumentType::Manual => "manuale",
            DocumentType::Datasheet => "scheda tecnica",
            DocumentType::Certificate => "certificato",
            DocumentType::SpareParts => "ricambi",
        }
    }
}

/// Signals extracted from a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QuerySignals {
    /// Canonical model identifier, e.g. `PLB 620-3M`.
    pub model: Option<String>,
    /// Letter prefix of the model, e.g. `PLB`.
    pub series: Option<String>,
    /// Every distinct model named, in order of appearance.
    pub models: Vec<String>,
    /// Canonical error code, e.g. `Err 04`.
    pub error_code: Option<String>,
    pub document_type: Option<DocumentType>,
    /// Remaining content words, lower-cased, in order.
    pub keywords: Vec<String>,
}

impl QuerySignals {
    pub fn extract(request: &str) -> Self {
        let mut signals = QuerySignals::default();
        let mut consumed: Vec<(usize, usize)> = Vec::new();

        for caps in ERROR_RE.captures_iter(request) {
            let whole = caps.get(0).map(|m| (m.start(), m.end()));
            if let (Some(span), Some(digits)) = (whole, caps.name("code")) {
                consumed.push(span);
                if signals.error_code.is_none() {
                    signals.error_code = Some(format!("Err {}", digits.as_str()));
                }
            }
        }

        for caps in MODEL_RE.captures_iter(request) {
            let Some(m) = caps.get(0) else { continue };
            if consumed.iter().any(|(s, e)| m.start() < *e && *s < m.end()) {
                continue;
            }
            let prefix = &caps["prefix"];
            if is_error_prefix(prefix) {
                continue;
            }
            let suffix = caps.name("suffix").map(|s| s.as_str());
            // lower-case prefixes without a suffix are usually ordinary words
            if suffix.is_none() && prefix.chars().any(|c| c.is_lowercase()) {
                continue;
            }
            let model = match suffix {
                Some(sfx) => format!(
                    "{} {}-{}",
                    prefix.to_uppercase(),
                    &caps["number"],
                    sfx.to_uppercase()
                ),
                None => format!("{} {}", prefix.to_uppercase(), &caps["number"]),
            };
            consumed.push((m.start(), m.end()));
            if !signals.models.contains(&model) {
                signals.models.push(model);
            }
        }
        if let Some(first) = signals.models.first() {
            signals.series = first.split(' ').next().map(str::to_string);
            signals.model = Some(first.clone());
        }

        let lower = request.to_lowercase();
        signals.document_type = DOC_TYPE_TERMS
            .iter()
            .find(|(term, _)| lower.contains(term))
            .map(|(_, dt)| *dt);

        let mut rest = String::with_capacity(request.len());
        let mut last = 0;
        consumed.sort();
        for (s, e) in &consumed {
            if *s >= last {
                rest.push_str(&request[last..*s]);
                rest.push(' ');
                last = *e;
            }
        }
        rest.push_str(&request[last.min(request.len())..]);

        for word in rest
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.chars().count() > 2)
            .map(str::to_lowercase)
        {
            if !STOPWORDS.contains(&word.as_str()) && !signals.keywords.contains(&word) {
                signals.keywords.push(word);
            }
        }

        signals
    }

    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    /// Keywords that say what the request is about. Document-type words
    /// (`manuale`, `scheda`) are left out since passages rarely repeat them.
    pub fn content_keywords(&self) -> Vec<String> {
        self.keywords
            .iter()
            .filter(|k| {
                !DOC_TYPE_TERMS
                    .iter()
                    .any(|(term, _)| term.split(' ').any(|w| w == k.as_str()))
            })
            .cloned()
            .collect()
    }
}

fn is_error_prefix(prefix: &str) -> bool {
    matches!(
        prefix.to_lowercase().as_str(),
        "e" | "er" | "err" | "erro" | "error" | "errore" | "code" | "cod"
    )
}

/// Build the search string: model, error code, document type, then keywords.
pub fn formulate(signals: &QuerySignals) -> String {
    let mut parts: Vec<String> = Vec::new();
    parts.extend(signals.model.clone());
    parts.extend(signals.error_code.clone());
    if let Some(dt) = signals.document_type {
        parts.push(dt.query_term().to_string());
    }
    parts.extend(signals.keywords.iter().cloned());
    dedup_words(&parts.join(" "))
}

/// The broader query used for the single retry.
///
/// Swaps the full model for its series, keeps the error code and document
/// type, and drops free keywords. Returns `None` when that would repeat
/// `previous` or produce an empty query.
pub fn reformulate(signals: &QuerySignals, previous: &str) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    parts.extend(signals.series.clone());
    parts.extend(signals.error_code.clone());
    if let Some(dt) = signals.document_type {
        parts.push(dt.query_term().to_string());
    }
    if parts.len() < 2 {
        // too thin on its own: keep the two most specific keywords
        parts.extend(signals.keywords.iter().take(2).cloned());
    }
    let candidate = dedup_words(&parts.join(" "));
    if candidate.is_empty() || candidate.eq_ignore_ascii_case(previous.trim()) {
        None
    } else {
        Some(candidate)
    }
}

fn dedup_words(s: &str) -> String {
    let mut seen: Vec<String> = Vec::new();
    let mut out: Vec<&str> = Vec::new();
    for w in s.split_whitespace() {
        let key = w.to_lowercase();
        if !seen.contains(&key) {
            seen.push(key);
            out.push(w);
        }
    }
    out.join(" ")
}

/// Why a clarifying question is needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Ambiguity {
    /// Neither a model nor a document type was named.
    MissingModel,
    /// Several different models were named.
    MultipleModels(Vec<String>),
}

/// Decide whether the request needs one clarifying question before retrieval.
pub fn clarification(signals: &QuerySignals) -> Option<Ambiguity> {
    if signals.models.len() > 1 {
        return Some(Ambiguity::MultipleModels(signals.models.clone()));
    }
    if signals.model.is_none() && signals.document_type.is_none() {
        return Some(Ambiguity::MissingModel);
    }
    None
}

/// The single question asked for an ambiguity.
pub fn clarifying_question(ambiguity: &Ambiguity) -> String {
    match ambiguity {
        Ambiguity::MissingModel => "Per aiutarti con precisione: a quale modello (o serie) di bilancia ti riferisci, e cerchi il manuale d'uso, la scheda tecnica o un altro documento?".to_string(),
        Ambiguity::MultipleModels(models) => format!(
            "Hai citato più modelli ({}): a quale di questi si riferisce la tua domanda?",
            models.join(", ")
        ),
    }
}

mod patterns {
    use regex::Regex;
    use std::sync::LazyLock;

    use super::DocumentType;

    pub static MODEL_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\b(?P<prefix>[A-Za-z]{2,4})[ ]?(?P<number>\d{2,5})(?:[- ]?(?P<suffix>\d{1,2}[A-Za-z]{1,4}))?\b")
            .expect("model regex")
    });

    pub static ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\b(?:(?i:codice\s+(?:di\s+)?errore|error\s+code|errore|error|err)\s*[-:.]?\s*|E[-:]?)(?P<code>\d{1,3})\b")
            .expect("error regex")
    });

    pub static DOC_TYPE_TERMS: &[(&str, DocumentType)] = &[
        ("manuale", DocumentType::Manual),
        ("manual", DocumentType::Manual),
        ("istruzioni", DocumentType::Manual),
        ("scheda tecnica", DocumentType::Datasheet),
        ("datasheet", DocumentType::Datasheet),
        ("data sheet", DocumentType::Datasheet),
        ("certificato", DocumentType::Certificate),
        ("certificate", DocumentType::Certificate),
        ("ricambi", DocumentType::SpareParts),
        ("spare part", DocumentType::SpareParts),
    ];

    pub static STOPWORDS: &[&str] = &[
        "the", "and", "for", "what", "does", "how", "with", "mean", "means", "che", "cosa",
        "come", "per", "con", "una", "uno", "gli", "del", "della", "delle", "dei", "sulla",
        "sul", "sullo", "nella", "nel", "alla", "allo", "dalla", "mia", "mio", "questa",
        "questo", "quale", "quali", "significa", "vuol", "dire", "posso", "devo", "fare",
        "sono", "ho", "non", "mi", "di", "la", "il", "lo", "le", "un", "my", "can", "is",
        "on", "of", "to", "in", "it", "an",
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_request() {
        let s = QuerySignals::extract("Err 04 sulla PLB 620-3M, cosa significa?");
        assert_eq!(s.model.as_deref(), Some("PLB 620-3M"));
        assert_eq!(s.series.as_deref(), Some("PLB"));
        assert_eq!(s.error_code.as_deref(), Some("Err 04"));
        assert!(s.keywords.is_empty(), "keywords: {:?}", s.keywords);
        assert_eq!(formulate(&s), "PLB 620-3M Err 04");
        assert_eq!(clarification(&s), None);
    }

    #[test]
    fn test_model_variants() {
        assert_eq!(
            QuerySignals::extract("manuale KB360-3N").model.as_deref(),
            Some("KB 360-3N")
        );
        assert_eq!(
            QuerySignals::extract("la plb 620-3m non si accende").model.as_deref(),
            Some("PLB 620-3M")
        );
        assert_eq!(
            QuerySignals::extract("EW 4200 calibration").model.as_deref(),
            Some("EW 4200")
        );
    }

    #[test]
    fn test_error_code_variants() {
        for (text, code) in [
            ("Err04 on my scale", "Err 04"),
            ("errore 4 sulla KB 360-3N", "Err 4"),
            ("error code 12 EW 4200-2NM", "Err 12"),
            ("codice errore 7", "Err 7"),
            ("display shows E-05", "Err 05"),
        ] {
            let s = QuerySignals::extract(text);
            assert_eq!(s.error_code.as_deref(), Some(code), "{}", text);
            assert!(
                s.models.iter().all(|m| !m.starts_with("ERR") && !m.starts_with("E ")),
                "{}: {:?}",
                text,
                s.models
            );
        }
    }

    #[test]
    fn test_ordinary_words_are_not_models() {
        let s = QuerySignals::extract("come pulire per 100 volte il piatto");
        assert!(s.model.is_none());
    }

    #[test]
    fn test_missing_model_needs_clarification() {
        let s = QuerySignals::extract("come si calibra la bilancia?");
        assert_eq!(clarification(&s), Some(Ambiguity::MissingModel));
        assert!(clarifying_question(&Ambiguity::MissingModel).ends_with('?'));
    }

    #[test]
    fn test_document_type_alone_is_enough() {
        let s = QuerySignals::extract("mi serve il manuale della serie per laboratorio");
        assert_eq!(s.document_type, Some(DocumentType::Manual));
        assert_eq!(clarification(&s), None);
    }

    #[test]
    fn test_multiple_models_need_clarification() {
        let s = QuerySignals::extract("differenza tra PLB 620-3M e EW 4200-2NM");
        match clarification(&s) {
            Some(Ambiguity::MultipleModels(models)) => assert_eq!(models.len(), 2),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_reformulate_broadens_and_never_repeats() {
        let s = QuerySignals::extract("Err 04 sulla PLB 620-3M, cosa significa?");
        let first = formulate(&s);
        let retry = reformulate(&s, &first).unwrap();
        assert_eq!(retry, "PLB Err 04");
        assert_eq!(reformulate(&s, &retry), None);
    }

    #[test]
    fn test_keywords_skip_stopwords() {
        let s = QuerySignals::extract("come sostituire la batteria della PLB 620-3M");
        assert_eq!(s.keywords, vec!["sostituire".to_string(), "batteria".to_string()]);
    }

    #[test]
    fn test_content_keywords_drop_document_type_words() {
        let s = QuerySignals::extract("manuale: come sostituire la cella di carico");
        assert_eq!(s.keywords[0], "manuale");
        assert_eq!(s.content_keywords(), vec!["sostituire", "cella", "carico"]);
    }
}
