//! The support assistant: one linear request cycle.
//!
//! ```text
//! request ─▶ signals ─▶ clarify? ─▶ search ─▶ aggregate ─▶ assess
//!                                     ▲                      │ weak / empty
//!                                     └──── reformulate ◀────┘ (once)
//!                                                            ▼
//!                              conflict / escalation / answer / not documented
//! ```
//!
//! [`Assistant::ask`] never fails: backend errors degrade to a
//! "not documented, contact support" answer.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;

use crate::aggregate::{self, DocumentGroup, Strength};
use crate::answer::Answer;
use crate::config::Config;
use crate::models::{FileRecord, Fragment};
use crate::policy;
use crate::query::{self, QuerySignals};
use crate::store::{SearchBackend, SearchMode, SearchRequest};

pub struct Assistant {
    config: Arc<Config>,
    backend: Arc<dyn SearchBackend>,
}

/// Outcome of one search attempt.
struct Retrieval {
    groups: Vec<DocumentGroup>,
    strength: Strength,
}

impl Assistant {
    pub fn new(config: Arc<Config>, backend: Arc<dyn SearchBackend>) -> Self {
        Self { config, backend }
    }

    /// Answer one request.
    ///
    /// `clarified` is set when a clarifying question was already asked in
    /// this exchange; the assistant then searches with whatever it has.
    pub async fn ask(&self, request: &str, clarified: bool) -> Answer {
        let signals = QuerySignals::extract(request);
        let topics = policy::sensitive_topics(request);
        let support = &self.config.support;

        if !clarified {
            if let Some(ambiguity) = query::clarification(&signals) {
                tracing::info!(?ambiguity, "asking for clarification");
                return Answer::clarification(query::clarifying_question(&ambiguity));
            }
        }

        let mut queries = Vec::new();
        let first_query = match query::formulate(&signals) {
            q if q.is_empty() => request.trim().to_string(),
            q => q,
        };
        queries.push(first_query.clone());

        let mut current = match self.retrieve(&first_query, &signals).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "search failed");
                return with_trace(Answer::not_documented(support), queries);
            }
        };

        if current.strength != Strength::Strong {
            if let Some(retry_query) = query::reformulate(&signals, &first_query) {
                queries.push(retry_query.clone());
                match self.retrieve(&retry_query, &signals).await {
                    Ok(retry) if better(&retry, &current) => current = retry,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %format!("{:#}", e), "retry search failed");
                    }
                }
            }
        }

        let answer = match current.strength {
            Strength::Strong => {
                match aggregate::detect_conflict(&current.groups, &signals) {
                    Some(conflict) => Answer::conflict(&conflict, &current.groups, support),
                    None => Answer::documented(&current.groups, &signals, &topics, support),
                }
            }
            Strength::Weak | Strength::Empty if !topics.is_empty() => {
                Answer::escalation(&topics, &current.groups, support)
            }
            Strength::Weak | Strength::Empty => Answer::not_documented(support),
        };

        tracing::info!(
            kind = ?answer.kind,
            strength = ?current.strength,
            attempts = queries.len(),
            "answered"
        );
        Answer {
            strength: Some(current.strength),
            ..with_trace(answer, queries)
        }
    }

    async fn retrieve(&self, query_text: &str, signals: &QuerySignals) -> Result<Retrieval> {
        let cfg = &self.config;
        let return_properties = cfg.fragments.return_properties();
        let req = SearchRequest {
            query: query_text,
            mode: SearchMode::Hybrid,
            limit: cfg.retrieval.clamp_limit(None),
            alpha: cfg.retrieval.alpha,
            query_properties: &cfg.retrieval.query_properties,
            return_properties: &return_properties,
        };
        let hits = self.backend.search(&cfg.weaviate.collection, &req).await?;
        tracing::debug!(query = query_text, hits = hits.len(), "retrieved");

        let fragments: Vec<Fragment> = hits
            .iter()
            .map(|h| Fragment::from_hit(h, &cfg.fragments))
            .collect();
        let files = self.file_records(&fragments).await;
        let groups = aggregate::group_fragments(fragments, &files);
        let strength = aggregate::assess(&groups, signals, &cfg.retrieval);
        Ok(Retrieval { groups, strength })
    }

    /// File metadata for the fragments' files, when a files collection is
    /// configured. Lookup failures only cost the metadata.
    async fn file_records(&self, fragments: &[Fragment]) -> HashMap<String, FileRecord> {
        let mut records = HashMap::new();
        let Some(collection) = &self.config.weaviate.files_collection else {
            return records;
        };
        let fields = &self.config.files;
        let key = if self.config.fragments.file_id.is_some() {
            &fields.id
        } else {
            &fields.name
        };
        let return_properties = fields.return_properties();

        for fragment in fragments {
            if records.contains_key(&fragment.file_id) {
                continue;
            }
            match self
                .backend
                .find_by_property(collection, key, &fragment.file_id, &return_properties)
                .await
            {
                Ok(Some(hit)) => {
                    records.insert(fragment.file_id.clone(), FileRecord::from_hit(&hit, fields));
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(file_id = %fragment.file_id, error = %e, "file lookup failed");
                }
            }
        }
        records
    }
}

fn rank(strength: Strength) -> u8 {
    match strength {
        Strength::Strong => 2,
        Strength::Weak => 1,
        Strength::Empty => 0,
    }
}

fn better(candidate: &Retrieval, current: &Retrieval) -> bool {
    rank(candidate.strength) > rank(current.strength)
}

fn with_trace(answer: Answer, queries: Vec<String>) -> Answer {
    Answer {
        attempts: queries.len(),
        queries,
        ..answer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::answer::AnswerKind;
    use crate::models::SearchHit;
    use crate::store::memory::MemoryBackend;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fixture() -> Value {
        json!({
            "collections": {
                "WindBilance": [
                    {"id": "f1", "properties": {
                        "caption": "PLB 620-3M messaggi di errore. Err 04: sovraccarico del piatto di pesata.",
                        "name": "plb_p12", "source_pdf": "PLB-BA-it.pdf", "page_index": 12,
                        "mediaType": "application/pdf"}},
                    {"id": "f2", "properties": {
                        "caption": "Rimedio Err 04 PLB: 1. Rimuovere il carico dal piatto. 2. Spegnere e riaccendere la bilancia.",
                        "name": "plb_p13", "source_pdf": "PLB-BA-it.pdf", "page_index": 13,
                        "mediaType": "application/pdf"}},
                    {"id": "f3", "properties": {
                        "caption": "EW 4200-2NM dati tecnici portata 4200 g",
                        "name": "ew_td", "source_pdf": "EW-TD-it.pdf", "page_index": 1,
                        "mediaType": "application/pdf"}}
                ]
            }
        })
    }

    fn assistant() -> Assistant {
        let backend = MemoryBackend::from_json(&fixture().to_string()).unwrap();
        Assistant::new(Arc::new(Config::default()), Arc::new(backend))
    }

    fn assistant_over(objects: Value) -> Assistant {
        let corpus = json!({ "collections": { "WindBilance": objects } });
        let backend = MemoryBackend::from_json(&corpus.to_string()).unwrap();
        Assistant::new(Arc::new(Config::default()), Arc::new(backend))
    }

    fn object(id: &str, caption: &str, file: &str, page: i64) -> Value {
        json!({"id": id, "properties": {
            "caption": caption, "name": id, "source_pdf": file, "page_index": page,
            "mediaType": "application/pdf"}})
    }

    struct CountingBackend {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl SearchBackend for CountingBackend {
        fn kind(&self) -> &str {
            "counting"
        }
        async fn is_ready(&self) -> Result<bool> {
            Ok(true)
        }
        async fn list_collections(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn collection_schema(&self, _collection: &str) -> Result<Option<Value>> {
            Ok(None)
        }
        async fn search(&self, _c: &str, _req: &SearchRequest<'_>) -> Result<Vec<SearchHit>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("connection refused");
            }
            Ok(vec![])
        }
        async fn find_by_property(
            &self,
            _c: &str,
            _p: &str,
            _v: &str,
            _r: &[String],
        ) -> Result<Option<SearchHit>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_error_code_scenario() {
        let answer = assistant()
            .ask("Err 04 sulla PLB 620-3M, cosa significa?", false)
            .await;
        assert_eq!(answer.kind, AnswerKind::Answer, "{}", answer.text);
        assert_eq!(answer.attempts, 1);
        assert_eq!(answer.citations[0].file_name, "PLB-BA-it.pdf");
        assert_eq!(answer.citations[0].page, Some(12));
        let steps: Vec<&str> = answer.steps.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(
            steps,
            vec![
                "Rimuovere il carico dal piatto.",
                "Spegnere e riaccendere la bilancia."
            ]
        );
    }

    #[tokio::test]
    async fn test_ambiguous_request_does_not_search() {
        let backend = Arc::new(CountingBackend {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let assistant = Assistant::new(Arc::new(Config::default()), backend.clone());
        let answer = assistant.ask("come si pulisce?", false).await;
        assert_eq!(answer.kind, AnswerKind::Clarification);
        assert_eq!(answer.attempts, 0);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_results_retry_once() {
        let backend = Arc::new(CountingBackend {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let assistant = Assistant::new(Arc::new(Config::default()), backend.clone());
        let answer = assistant.ask("Err 07 sulla KB 360-3N", false).await;
        assert_eq!(answer.kind, AnswerKind::NotDocumented);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert_eq!(answer.queries, vec!["KB 360-3N Err 07", "KB Err 07"]);
    }

    #[tokio::test]
    async fn test_backend_failure_degrades() {
        let backend = Arc::new(CountingBackend {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let assistant = Assistant::new(Arc::new(Config::default()), backend);
        let answer = assistant.ask("manuale PLB 620-3M", false).await;
        assert_eq!(answer.kind, AnswerKind::NotDocumented);
        assert_eq!(answer.attempts, 1);
    }

    #[tokio::test]
    async fn test_sealed_request_without_documentation_escalates() {
        let answer = assistant()
            .ask("Come rimuovo il sigillo metrologico della KB 360-3N?", false)
            .await;
        assert_eq!(answer.kind, AnswerKind::Escalation);
        assert!(answer.steps.is_empty());
    }

    #[tokio::test]
    async fn test_same_question_same_citations() {
        let a = assistant();
        let first = a.ask("Err 04 sulla PLB 620-3M, cosa significa?", false).await;
        let second = a.ask("Err 04 sulla PLB 620-3M, cosa significa?", false).await;
        assert_eq!(first.citations, second.citations);
    }

    #[tokio::test]
    async fn test_undocumented_error_code_gets_no_procedure() {
        let answer = assistant()
            .ask("Err 99 sulla PLB 620-3M, cosa significa?", false)
            .await;
        assert_eq!(answer.kind, AnswerKind::NotDocumented, "{}", answer.text);
        assert_eq!(answer.attempts, 2);
        assert!(answer.steps.is_empty());
        assert!(!answer.text.contains("Rimuovere"));
    }

    #[tokio::test]
    async fn test_other_model_manual_is_not_used() {
        let answer = assistant_over(json!([
            object(
                "e1",
                "EW 4200-2NM Err 04: batteria scarica. 1. Collegare l'alimentatore.",
                "EW-BA-it.pdf",
                5
            ),
            object("t1", "PLB 620-3M dati tecnici: portata 620 g.", "PLB-TD-it.pdf", 1),
        ]))
        .ask("Err 04 sulla PLB 620-3M, cosa significa?", false)
        .await;
        assert_eq!(answer.kind, AnswerKind::NotDocumented, "{}", answer.text);
        assert!(!answer.text.contains("Collegare"));
        assert!(answer.citations.is_empty());
    }

    #[tokio::test]
    async fn test_code_reused_by_another_model_is_not_a_conflict() {
        let answer = assistant_over(json!([
            object("p1", "PLB 620-3M Err 04: sovraccarico.", "PLB-BA-it.pdf", 12),
            object("e1", "EW 4200-2NM Err 04: batteria scarica.", "EW-BA-it.pdf", 7),
        ]))
        .ask("Err 04 sulla PLB 620-3M, cosa significa?", false)
        .await;
        assert_eq!(answer.kind, AnswerKind::Answer, "{}", answer.text);
        assert!(answer.text.contains("Err 04: sovraccarico."), "{}", answer.text);
        assert!(!answer.text.contains("batteria"), "{}", answer.text);
        let files: Vec<&str> = answer.citations.iter().map(|c| c.file_name.as_str()).collect();
        assert_eq!(files, vec!["PLB-BA-it.pdf"]);
    }

    #[tokio::test]
    async fn test_passage_sharing_one_word_is_weak() {
        let answer = assistant_over(json!([object(
            "c1",
            "Pulizia del paravento con panno morbido, togliere il carico.",
            "PLB-BA-it.pdf",
            20
        )]))
        .ask("manuale: come sostituire la cella di carico", false)
        .await;
        assert_eq!(answer.kind, AnswerKind::NotDocumented, "{}", answer.text);
        assert_eq!(answer.strength, Some(Strength::Weak));
        assert_eq!(answer.attempts, 2);
        assert!(answer.steps.is_empty());
    }
}
