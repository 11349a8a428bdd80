//! Answer synthesis.
//!
//! Every exchange ends in an [`Answer`]: a kind, the rendered Italian text,
//! the citations it rests on, and the numbered steps (if any). Builders here
//! encode the transparency rules: nothing is asserted without a citation,
//! and every dead end points to official support.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

use crate::aggregate::{self, Conflict, DocumentGroup, Strength};
use crate::config::SupportConfig;
use crate::policy::{self, SensitiveTopic};
use crate::query::QuerySignals;

const MAX_CITATIONS: usize = 3;
const MAX_STEPS: usize = 10;
const EXCERPT_CHARS: usize = 400;

static NUMBERED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\s)(\d{1,2})[.)]\s+").expect("numbered step regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerKind {
    Answer,
    Clarification,
    NotDocumented,
    Escalation,
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    pub file_name: String,
    /// Approximate page; `None` when the index did not record one.
    pub page: Option<u32>,
    pub url: Option<String>,
}

impl Citation {
    fn render(&self) -> String {
        let mut line = self.file_name.clone();
        if let Some(page) = self.page {
            line.push_str(&format!(", pag. {}", page));
        }
        if let Some(url) = &self.url {
            line.push_str(&format!(" ({})", url));
        }
        line
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Step {
    pub number: usize,
    pub text: String,
    pub critical: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub kind: AnswerKind,
    pub text: String,
    pub citations: Vec<Citation>,
    pub steps: Vec<Step>,
    /// Searches performed for this exchange (0, 1 or 2).
    pub attempts: usize,
    pub queries: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<SensitiveTopic>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strength: Option<Strength>,
}

impl Answer {
    fn bare(kind: AnswerKind, text: String) -> Self {
        Self {
            kind,
            text,
            citations: Vec::new(),
            steps: Vec::new(),
            attempts: 0,
            queries: Vec::new(),
            topics: Vec::new(),
            strength: None,
        }
    }

    pub fn clarification(question: String) -> Self {
        Self::bare(AnswerKind::Clarification, question)
    }

    /// Nothing usable was found, or the backend could not be reached.
    pub fn not_documented(support: &SupportConfig) -> Self {
        let text = format!(
            "Non ho trovato questa informazione nella documentazione disponibile, \
             quindi non posso indicarti una procedura. {}",
            support_line(support)
        );
        Self::bare(AnswerKind::NotDocumented, text)
    }

    /// Sensitive request without strong documentation: redirect, no procedure.
    pub fn escalation(
        topics: &[SensitiveTopic],
        groups: &[DocumentGroup],
        support: &SupportConfig,
    ) -> Self {
        let mut text = format!(
            "La tua richiesta riguarda {}. La documentazione che ho trovato non è \
             abbastanza chiara per indicarti una procedura in sicurezza, quindi non \
             ne fornisco una. {}",
            topic_list(topics),
            support_line(support)
        );
        let citations = citations_for(groups, None);
        append_sources(&mut text, &citations);
        Self {
            citations,
            topics: topics.to_vec(),
            ..Self::bare(AnswerKind::Escalation, text)
        }
    }

    /// Manuals disagree: disclose both versions and redirect.
    pub fn conflict(conflict: &Conflict, groups: &[DocumentGroup], support: &SupportConfig) -> Self {
        let mut text = format!(
            "Ho trovato indicazioni discordanti su {} nei manuali disponibili:\n",
            conflict.code
        );
        for (file, definition) in &conflict.definitions {
            text.push_str(&format!("- {}: {}\n", file, definition));
        }
        text.push_str(&format!(
            "Non posso stabilire quale sia corretta per la tua bilancia. {}",
            support_line(support)
        ));
        let citations = groups
            .iter()
            .filter(|g| conflict.definitions.iter().any(|(f, _)| f == &g.file_name))
            .map(|g| citation(g, Some(conflict.code.as_str())))
            .collect::<Vec<_>>();
        append_sources(&mut text, &citations);
        Self {
            citations,
            ..Self::bare(AnswerKind::Conflict, text)
        }
    }

    /// Answer from strong documentation.
    ///
    /// Only documents naming the requested model are used. The lead text and
    /// the steps come from the best of them that mentions the asked error
    /// code; without such a document there is nothing to answer from.
    /// Sensitive topics add a mandatory support reminder.
    pub fn documented(
        groups: &[DocumentGroup],
        signals: &QuerySignals,
        topics: &[SensitiveTopic],
        support: &SupportConfig,
    ) -> Self {
        let relevant = aggregate::relevant_groups(groups, signals);
        let code = signals.error_code.as_deref();
        let code_re = code.and_then(aggregate::error_code_pattern);
        let top = match (code, &code_re) {
            (None, _) => relevant.first().copied(),
            (Some(_), Some(re)) => relevant.iter().copied().find(|g| re.is_match(&g.passage)),
            (Some(_), None) => None,
        };
        let Some(top) = top else {
            return Self::not_documented(support);
        };

        let mut text = match &signals.model {
            Some(model) => format!(
                "Secondo la documentazione di {} ({}):\n",
                model, top.file_name
            ),
            None => format!("Secondo la documentazione disponibile ({}):\n", top.file_name),
        };

        match code.and_then(|c| aggregate::definition_of(&top.passage, c).map(|d| (c, d))) {
            Some((c, d)) => text.push_str(&format!("{}: {}.\n", c, d)),
            None => {
                if let Some(line) = lead_excerpt(&top.passage) {
                    text.push_str(&line);
                    text.push('\n');
                }
            }
        }

        let steps = extract_steps(&top.passage, code);
        if !steps.is_empty() {
            text.push_str("\nProcedura:\n");
            for step in &steps {
                text.push_str(&format!("{}. {}", step.number, step.text));
                if step.critical {
                    text.push_str(
                        " (ATTENZIONE: operazione delicata, eseguila solo se sei \
                         autorizzato e seguendo il manuale)",
                    );
                }
                text.push('\n');
            }
        }

        if !topics.is_empty() {
            text.push_str(&format!(
                "\nQuesta operazione riguarda {}: prima di procedere confrontati con il \
                 supporto ufficiale. {}\n",
                topic_list(topics),
                support_line(support)
            ));
        }

        let citations = citations_for(
            std::iter::once(top).chain(relevant.into_iter().filter(|g| g.file_id != top.file_id)),
            code,
        );
        append_sources(&mut text, &citations);

        Self {
            citations,
            steps,
            topics: topics.to_vec(),
            strength: Some(Strength::Strong),
            ..Self::bare(AnswerKind::Answer, text)
        }
    }
}

fn support_line(support: &SupportConfig) -> String {
    let mut line = format!("Per assistenza contatta {}", support.name);
    let contacts: Vec<&str> = [support.url.as_deref(), support.email.as_deref()]
        .into_iter()
        .flatten()
        .collect();
    if !contacts.is_empty() {
        line.push_str(&format!(" ({})", contacts.join(", ")));
    }
    line.push('.');
    line
}

fn topic_list(topics: &[SensitiveTopic]) -> String {
    topics
        .iter()
        .map(|t| t.label())
        .collect::<Vec<_>>()
        .join(" e ")
}

fn append_sources(text: &mut String, citations: &[Citation]) {
    if citations.is_empty() {
        return;
    }
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str("\nFonti:\n");
    for c in citations {
        text.push_str(&format!("- {}\n", c.render()));
    }
}

fn citation(group: &DocumentGroup, code: Option<&str>) -> Citation {
    let page = code
        .and_then(aggregate::error_code_pattern)
        .and_then(|re| group.page_where(|t| re.is_match(t)))
        .or_else(|| group.first_page());
    Citation {
        file_name: group.file_name.clone(),
        page,
        url: group.url.clone(),
    }
}

/// Citations for the leading documents, pointing at the page that mentions
/// `code` when there is one.
pub fn citations_for<'a>(
    groups: impl IntoIterator<Item = &'a DocumentGroup>,
    code: Option<&str>,
) -> Vec<Citation> {
    groups
        .into_iter()
        .take(MAX_CITATIONS)
        .map(|g| citation(g, code))
        .collect()
}

/// Extract ordered steps from a passage.
///
/// Numbered items (`1.`, `2)`) win, in passage order and renumbered from 1.
/// Without numbering, each sentence of three or more words becomes a step.
/// Lines that merely define `code` are skipped in the fallback.
pub fn extract_steps(passage: &str, code: Option<&str>) -> Vec<Step> {
    let mut texts: Vec<String> = Vec::new();

    for line in passage.lines() {
        let marks: Vec<(usize, usize)> = NUMBERED_RE
            .find_iter(line)
            .map(|m| (m.start(), m.end()))
            .collect();
        for (i, (_, end)) in marks.iter().enumerate() {
            let stop = marks.get(i + 1).map(|(s, _)| *s).unwrap_or(line.len());
            let text = line[*end..stop].trim();
            if !text.is_empty() {
                texts.push(text.to_string());
            }
        }
    }

    if texts.is_empty() {
        let code_re = code.and_then(aggregate::error_code_pattern);
        for line in passage.lines() {
            if code_re.as_ref().map(|re| re.is_match(line)).unwrap_or(false) {
                continue;
            }
            for sentence in line.split_inclusive(['.', '!', '?']) {
                let sentence = sentence.trim();
                if sentence.split_whitespace().count() >= 3 {
                    texts.push(sentence.to_string());
                }
            }
        }
    }

    texts
        .into_iter()
        .take(MAX_STEPS)
        .enumerate()
        .map(|(i, text)| Step {
            number: i + 1,
            critical: policy::is_critical_step(&text),
            text,
        })
        .collect()
}

fn lead_excerpt(passage: &str) -> Option<String> {
    let first = passage
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !NUMBERED_RE.is_match(l))?;
    if first.chars().count() <= EXCERPT_CHARS {
        Some(first.to_string())
    } else {
        let cut: String = first.chars().take(EXCERPT_CHARS).collect();
        Some(format!("{}…", cut.trim_end()))
    }
}
