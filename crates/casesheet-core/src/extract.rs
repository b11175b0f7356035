//! Extract stage: fill the technical sheet from retrieved evidence.
//!
//! For every field the stage embeds the field's query, retrieves the top-k
//! chunks among the case's indexed documents and asks the reasoning
//! provider for a value, one call per source document. Each answer that
//! cites one of the chunks it was shown becomes an observation with a
//! full provenance triple. Answers citing nothing, or a chunk that was
//! not in their context, are unsourced: dropped unless the deployment
//! allows unsourced values, and then stored with no provenance at all.
//! A provenance pointer is never guessed.
//!
//! The winning observation per field is the one from the document type
//! with the highest precedence for the field's domain, ties broken by
//! retrieval score. Fields, and the case's full observation set, are
//! committed in one versioned write.

use std::collections::HashMap;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::embedding::{embed_one, Embedder};
use crate::models::{
    Confidence, DocLabel, Document, FieldKey, FieldObservation, FieldOrigin, FieldRecord,
    RiskLevel,
};
use crate::precedence::{rank, HIGH_CONFIDENCE_RANK};
use crate::providers::{ContextChunk, Reasoner};
use crate::store::{validate_provenance, ChunkHit, SheetUpdate, Store};
use crate::values::coerce;

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Chunks retrieved per field.
    pub top_k: usize,
    /// Keep values the provider could not tie to a retrieved chunk.
    pub allow_unsourced: bool,
    /// Currency assigned to money values.
    pub currency: String,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            top_k: 6,
            allow_unsourced: false,
            currency: "MXN".to_string(),
        }
    }
}

/// How a field ended up after extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldStatus {
    Found,
    Unsourced,
    Missing,
    /// A reviewer set the value; extraction left it alone.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldOutcome {
    pub field: FieldKey,
    pub status: FieldStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    pub observations: usize,
}

/// Summary of an extract run, stored as the task result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractReport {
    pub case_id: String,
    /// The indexed documents this run read from.
    pub documents: Vec<String>,
    pub fields: Vec<FieldOutcome>,
    pub version: i64,
}

pub struct FieldExtractor<'a> {
    pub store: &'a dyn Store,
    pub embedder: &'a dyn Embedder,
    pub reasoner: &'a dyn Reasoner,
    pub options: ExtractOptions,
}

impl FieldExtractor<'_> {
    /// Extract every field of `case_id` from the documents in `snapshot`.
    pub async fn run(&self, case_id: &str, snapshot: &[String]) -> Result<ExtractReport> {
        let sheet = self.store.load_sheet(case_id).await?;
        let documents: HashMap<String, Document> = self
            .store
            .case_documents(case_id)
            .await?
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();
        let snapshot: Vec<String> = snapshot
            .iter()
            .filter(|id| documents.contains_key(*id))
            .cloned()
            .collect();
        let contract_on_file = documents
            .values()
            .any(|d| d.label == Some(DocLabel::Contract));

        let mut fields = Vec::new();
        let mut observations = Vec::new();
        let mut outcomes = Vec::new();

        for key in FieldKey::ALL {
            if sheet.field(key).is_manual() {
                outcomes.push(FieldOutcome {
                    field: key,
                    status: FieldStatus::Manual,
                    value: sheet.field(key).value.map(|v| v.canonical()),
                    document_id: None,
                    observations: 0,
                });
                continue;
            }

            let found = self
                .observe(case_id, key, &snapshot, &documents, contract_on_file)
                .await?;
            let winner = found
                .iter()
                .max_by(|a, b| {
                    (a.rank, a.provenance.is_some())
                        .cmp(&(b.rank, b.provenance.is_some()))
                        .then(a.score.total_cmp(&b.score))
                })
                .cloned();

            let (record, status) = match winner {
                Some(obs) => {
                    let sourced = obs.provenance.is_some();
                    let record = FieldRecord {
                        value: Some(obs.value.clone()),
                        provenance: obs.provenance.clone(),
                        origin: FieldOrigin::Derived,
                        risk: if sourced {
                            RiskLevel::Low
                        } else {
                            RiskLevel::Medium
                        },
                        confidence: if sourced && obs.rank >= HIGH_CONFIDENCE_RANK {
                            Confidence::High
                        } else {
                            Confidence::Medium
                        },
                        excerpt: obs.excerpt.clone(),
                    };
                    let status = if sourced {
                        FieldStatus::Found
                    } else {
                        FieldStatus::Unsourced
                    };
                    (record, status)
                }
                None => (FieldRecord::missing(), FieldStatus::Missing),
            };

            debug!(case_id, field = %key, ?status, observations = found.len(), "field extracted");
            outcomes.push(FieldOutcome {
                field: key,
                status,
                value: record.value.as_ref().map(|v| v.canonical()),
                document_id: record.provenance.as_ref().map(|p| p.document_id.clone()),
                observations: found.len(),
            });
            fields.push((key, record));
            observations.extend(found);
        }

        let version = self
            .store
            .commit_sheet(
                case_id,
                sheet.version,
                &SheetUpdate {
                    fields,
                    observations: Some(observations),
                    flags: None,
                },
            )
            .await?;

        let found = outcomes
            .iter()
            .filter(|o| o.status == FieldStatus::Found)
            .count();
        info!(
            case_id,
            documents = snapshot.len(),
            found,
            total = outcomes.len(),
            version,
            "extracted technical sheet"
        );
        Ok(ExtractReport {
            case_id: case_id.to_string(),
            documents: snapshot,
            fields: outcomes,
            version,
        })
    }

    /// Every usable reading of `key` among the snapshot documents.
    async fn observe(
        &self,
        case_id: &str,
        key: FieldKey,
        snapshot: &[String],
        documents: &HashMap<String, Document>,
        contract_on_file: bool,
    ) -> Result<Vec<FieldObservation>> {
        if snapshot.is_empty() {
            return Ok(Vec::new());
        }
        let query = embed_one(self.embedder, key.query()).await?;
        let hits = self
            .store
            .vector_search(&query, snapshot, self.options.top_k)
            .await?;

        let mut order: Vec<&str> = Vec::new();
        let mut by_doc: HashMap<&str, Vec<&ChunkHit>> = HashMap::new();
        for hit in &hits {
            if !by_doc.contains_key(hit.document_id.as_str()) {
                order.push(&hit.document_id);
            }
            by_doc.entry(&hit.document_id).or_default().push(hit);
        }

        let mut found = Vec::new();
        for doc_id in order {
            let group = &by_doc[doc_id];
            let context: Vec<ContextChunk> = group
                .iter()
                .map(|h| ContextChunk {
                    chunk_id: h.chunk_id.clone(),
                    page: h.page,
                    text: h.text.clone(),
                })
                .collect();
            let answer = self.reasoner.extract_field(key, &context).await?;
            let Some(raw) = answer.value else {
                continue;
            };
            let Some(value) = coerce(key.kind(), &raw, &self.options.currency) else {
                debug!(case_id, field = %key, document_id = doc_id, raw = %raw, "unparseable answer");
                continue;
            };

            let cited = answer
                .chunk_id
                .as_deref()
                .and_then(|id| group.iter().find(|h| h.chunk_id == id));
            let (provenance, score, excerpt) = match cited {
                Some(hit) => (Some(hit.provenance()), hit.score, Some(hit.text.clone())),
                None if self.options.allow_unsourced => {
                    warn!(case_id, field = %key, document_id = doc_id, cited = ?answer.chunk_id, "keeping unsourced value");
                    (None, group.first().map(|h| h.score).unwrap_or(0.0), None)
                }
                None => {
                    warn!(case_id, field = %key, document_id = doc_id, cited = ?answer.chunk_id, "dropping value without a retrieved citation");
                    continue;
                }
            };

            let doc = documents.get(doc_id);
            if let Some(p) = &provenance {
                if let Err(e) = validate_provenance(key, p, case_id, doc) {
                    warn!(case_id, field = %key, error = %e, "discarding observation");
                    continue;
                }
            }
            let label = doc.and_then(|d| d.label).unwrap_or(DocLabel::Unknown);
            found.push(FieldObservation {
                case_id: case_id.to_string(),
                field: key,
                document_id: doc_id.to_string(),
                value,
                provenance,
                score,
                rank: rank(label, key, contract_on_file),
                excerpt,
            });
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashedEmbedder;
    use crate::error::{classify_error, ErrorClass};
    use crate::models::FieldValue;
    use crate::store::memory::InMemoryStore;
    use crate::store::{ChunkIndex, SheetStore};
    use crate::testing::{seed_document, MockAnswer, MockReasoner, MockReasonerCall};
    use chrono::NaiveDate;

    const PAYSLIP: &str = "RECIBO DE NÓMINA\nSalario diario: $450.00\nPercepciones quincenales";
    const CONTRACT: &str = "CONTRATO INDIVIDUAL DE TRABAJO\nFecha de ingreso: 15 de marzo de 2019\nSalario diario $400.00";

    async fn case_store() -> InMemoryStore {
        let store = InMemoryStore::new();
        seed_document(&store, "pay", "C1", DocLabel::Payslip, PAYSLIP)
            .await
            .unwrap();
        seed_document(&store, "con", "C1", DocLabel::Contract, CONTRACT)
            .await
            .unwrap();
        seed_document(&store, "other", "C2", DocLabel::Payslip, "RECIBO DE NÓMINA\nSalario diario: $999.00")
            .await
            .unwrap();
        store
    }

    fn snapshot() -> Vec<String> {
        vec!["pay".to_string(), "con".to_string()]
    }

    async fn extract(
        store: &InMemoryStore,
        reasoner: &MockReasoner,
        options: ExtractOptions,
    ) -> Result<ExtractReport> {
        FieldExtractor {
            store,
            embedder: &HashedEmbedder,
            reasoner,
            options,
        }
        .run("C1", &snapshot())
        .await
    }

    #[tokio::test]
    async fn test_precedence_and_provenance() {
        let store = case_store().await;
        let reasoner = MockReasoner::new();
        let report = extract(&store, &reasoner, ExtractOptions::default())
            .await
            .unwrap();
        assert_eq!(report.documents, snapshot());

        let sheet = store.load_sheet("C1").await.unwrap();
        let salary = sheet.field(FieldKey::DailySalary);
        assert_eq!(
            salary.value,
            Some(FieldValue::Money {
                cents: 45_000,
                currency: "MXN".into()
            })
        );
        let prov = salary.provenance.unwrap();
        assert_eq!(prov.document_id, "pay");
        assert_eq!(prov.page, 1);
        assert_eq!(salary.risk, RiskLevel::Low);

        let start = sheet.field(FieldKey::StartDate);
        assert_eq!(
            start.value.unwrap().as_date(),
            NaiveDate::from_ymd_opt(2019, 3, 15)
        );
        assert_eq!(start.provenance.unwrap().document_id, "con");

        let observations = store.observations("C1").await.unwrap();
        assert_eq!(
            observations
                .iter()
                .filter(|o| o.field == FieldKey::DailySalary)
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_retrieval_stays_within_case() {
        let store = case_store().await;
        let reasoner = MockReasoner::new();
        extract(&store, &reasoner, ExtractOptions::default())
            .await
            .unwrap();
        let other: Vec<String> = store
            .document_chunks("other")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        for call in reasoner.calls() {
            if let MockReasonerCall::Extract { chunk_ids, .. } = call {
                assert!(chunk_ids.iter().all(|id| !other.contains(id)));
            }
        }
        assert!(store
            .observations("C1")
            .await
            .unwrap()
            .iter()
            .all(|o| o.document_id != "other"));
    }

    #[tokio::test]
    async fn test_missing_has_no_provenance() {
        let store = case_store().await;
        let reasoner = MockReasoner::new().with_answer(FieldKey::TerminationCause, MockAnswer::Missing);
        let report = extract(&store, &reasoner, ExtractOptions::default())
            .await
            .unwrap();
        let outcome = report
            .fields
            .iter()
            .find(|o| o.field == FieldKey::TerminationCause)
            .unwrap();
        assert_eq!(outcome.status, FieldStatus::Missing);

        let record = store
            .load_sheet("C1")
            .await
            .unwrap()
            .field(FieldKey::TerminationCause);
        assert!(record.value.is_none());
        assert!(record.provenance.is_none());
        assert_eq!(record.risk, RiskLevel::Medium);
    }

    #[tokio::test]
    async fn test_uncited_values_are_dropped_by_default() {
        let store = case_store().await;
        let reasoner = MockReasoner::new()
            .with_answer(FieldKey::EndDate, MockAnswer::Uncited("2023-01-31".into()))
            .with_answer(
                FieldKey::TerminationCause,
                MockAnswer::CiteUnknown("despido".into()),
            );
        extract(&store, &reasoner, ExtractOptions::default())
            .await
            .unwrap();
        let sheet = store.load_sheet("C1").await.unwrap();
        assert!(sheet.field(FieldKey::EndDate).is_missing());
        assert!(sheet.field(FieldKey::TerminationCause).is_missing());
    }

    #[tokio::test]
    async fn test_unsourced_values_kept_when_allowed() {
        let store = case_store().await;
        let reasoner = MockReasoner::new().with_answer(
            FieldKey::TerminationCause,
            MockAnswer::CiteUnknown("despido".into()),
        );
        let options = ExtractOptions {
            allow_unsourced: true,
            ..ExtractOptions::default()
        };
        let report = extract(&store, &reasoner, options).await.unwrap();
        let record = store
            .load_sheet("C1")
            .await
            .unwrap()
            .field(FieldKey::TerminationCause);
        assert!(record.value.is_some());
        assert!(record.provenance.is_none());
        assert_eq!(record.risk, RiskLevel::Medium);
        assert!(report
            .fields
            .iter()
            .any(|o| o.field == FieldKey::TerminationCause && o.status == FieldStatus::Unsourced));
    }

    #[tokio::test]
    async fn test_manual_field_is_not_overwritten() {
        let store = case_store().await;
        let manual = FieldValue::Money {
            cents: 50_000,
            currency: "MXN".into(),
        };
        store
            .set_manual_field("C1", FieldKey::DailySalary, &manual)
            .await
            .unwrap();
        let reasoner = MockReasoner::new();
        extract(&store, &reasoner, ExtractOptions::default())
            .await
            .unwrap();
        let record = store
            .load_sheet("C1")
            .await
            .unwrap()
            .field(FieldKey::DailySalary);
        assert_eq!(record.value, Some(manual));
        assert!(record.is_manual());
        assert!(!reasoner.calls().iter().any(|c| matches!(
            c,
            MockReasonerCall::Extract {
                field: FieldKey::DailySalary,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_rerun_overwrites_and_bumps_version() {
        let store = case_store().await;
        let reasoner = MockReasoner::new();
        let first = extract(&store, &reasoner, ExtractOptions::default())
            .await
            .unwrap();
        let before = store.load_sheet("C1").await.unwrap();
        let second = extract(&store, &reasoner, ExtractOptions::default())
            .await
            .unwrap();
        let after = store.load_sheet("C1").await.unwrap();
        assert_eq!(second.version, first.version + 1);
        assert_eq!(before.fields, after.fields);
    }

    #[tokio::test]
    async fn test_provider_outage_is_transient() {
        let store = case_store().await;
        let reasoner = MockReasoner::new().with_transient_failures(1);
        let err = extract(&store, &reasoner, ExtractOptions::default())
            .await
            .unwrap_err();
        assert_eq!(classify_error(&err), ErrorClass::Transient);
        assert_eq!(store.load_sheet("C1").await.unwrap().version, 0);
    }
}
