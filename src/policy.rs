//! Safety, legal-metrology and sealing rules.
//!
//! Requests in these areas are never answered with a procedure unless the
//! documentation is strong, and even then carry a support reminder.
//! Individual steps that touch risky operations are flagged critical.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

/// Sensitive area touched by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensitiveTopic {
    Safety,
    LegalMetrology,
    Sealing,
}

const SAFETY_TERMS: &[&str] = &[
    "sicurezza",
    "scossa",
    "folgorazione",
    "incendio",
    "fumo",
    "bruciato",
    "safety",
    "electric shock",
    "fire",
    "smoke",
];

const METROLOGY_TERMS: &[&str] = &[
    "metrologia legale",
    "metrologico",
    "metrologica",
    "omologat*",
    "verificazione",
    "verifica periodica",
    "uso legale",
    "legale per il commercio",
    "m-marking",
    "marcatura m",
    "legal metrology",
    "legal for trade",
    "verified scale",
    "conformity assessment",
];

const SEALING_TERMS: &[&str] = &[
    "sigillo",
    "sigilli",
    "sigillat*",
    "piombatura",
    "piombino",
    "seal",
    "sealed",
    "tamper*",
];

/// Terms that mark a procedure step as critical. A trailing `*` matches any
/// word ending; other terms match whole words only.
const RISKY_STEP_TERMS: &[&str] = &[
    "aprire l'alloggiamento",
    "aprire la bilancia",
    "aprire il coperchio",
    "rimuovere il coperchio",
    "smontare",
    "alimentazione di rete",
    "rete elettrica",
    "alta tensione",
    "230 v",
    "calibrazione",
    "calibrare",
    "tarare",
    "taratura",
    "regolazione",
    "reset",
    "ripristino",
    "impostazioni di fabbrica",
    "sigill*",
    "open the housing",
    "remove the cover",
    "mains power",
    "mains supply",
    "calibrat*",
    "adjustment",
    "factory settings",
    "seal*",
];

static SAFETY_RE: LazyLock<Regex> = LazyLock::new(|| term_regex(SAFETY_TERMS));
static METROLOGY_RE: LazyLock<Regex> = LazyLock::new(|| term_regex(METROLOGY_TERMS));
static SEALING_RE: LazyLock<Regex> = LazyLock::new(|| term_regex(SEALING_TERMS));
static RISKY_STEP_RE: LazyLock<Regex> = LazyLock::new(|| term_regex(RISKY_STEP_TERMS));

/// One case-insensitive alternation over `terms`, anchored on word boundaries.
fn term_regex(terms: &[&str]) -> Regex {
    let alternatives: Vec<String> = terms
        .iter()
        .map(|t| match t.strip_suffix('*') {
            Some(stem) => format!(r"{}\w*", regex::escape(stem)),
            None => format!(r"{}\b", regex::escape(t)),
        })
        .collect();
    Regex::new(&format!(r"(?i)\b(?:{})", alternatives.join("|"))).expect("term regex")
}

/// Sensitive topics mentioned by the request, in a fixed order.
pub fn sensitive_topics(request: &str) -> Vec<SensitiveTopic> {
    [
        (SensitiveTopic::Safety, &*SAFETY_RE),
        (SensitiveTopic::LegalMetrology, &*METROLOGY_RE),
        (SensitiveTopic::Sealing, &*SEALING_RE),
    ]
    .into_iter()
    .filter(|(_, re)| re.is_match(request))
    .map(|(topic, _)| topic)
    .collect()
}

/// Whether a step describes an operation that needs a warning.
pub fn is_critical_step(text: &str) -> bool {
    RISKY_STEP_RE.is_match(text)
}

impl SensitiveTopic {
    /// Italian label used in rendered answers.
    pub fn label(&self) -> &'static str {
        match self {
            SensitiveTopic::Safety => "sicurezza",
            SensitiveTopic::LegalMetrology => "metrologia legale",
            SensitiveTopic::Sealing => "componenti sigillati o verificati",
        }
    }
}
