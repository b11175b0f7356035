//! Offline reasoning provider.
//!
//! Reads values straight out of the context with the same parsers the
//! extract stage uses to coerce answers. Dates are only taken from lines
//! carrying a cue for the field (`fecha de ingreso` for the start date,
//! `baja` or `despido` for the end date) so one date is never reported as
//! both. Useful for deployments without a model server and in tests.

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{FieldKey, FieldKind};
use crate::providers::{Answer, ContextChunk, FieldAnswer, Reasoner};
use crate::values::{find_date, find_in_text};

const START_CUES: &[&str] = &[
    "ingreso",
    "inicio",
    "alta",
    "comenzó",
    "desde",
    "start date",
    "hired",
];

const END_CUES: &[&str] = &[
    "baja",
    "terminación",
    "terminacion",
    "separación",
    "despid",
    "renuncia",
    "rescisión",
    "hasta",
    "último día",
    "end date",
];

pub struct HeuristicReasoner {
    pub currency: String,
}

impl Default for HeuristicReasoner {
    fn default() -> Self {
        Self {
            currency: "MXN".to_string(),
        }
    }
}

fn cues(field: FieldKey) -> &'static [&'static str] {
    match field {
        FieldKey::StartDate => START_CUES,
        FieldKey::EndDate => END_CUES,
        _ => &[],
    }
}

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 3)
        .map(str::to_string)
        .collect()
}

impl HeuristicReasoner {
    fn read(&self, field: FieldKey, chunk: &ContextChunk) -> Option<String> {
        if field.kind() != FieldKind::Date {
            return find_in_text(field.kind(), &chunk.text, &self.currency).map(|(_, m)| m);
        }
        chunk
            .text
            .lines()
            .filter(|line| {
                let lower = line.to_lowercase();
                cues(field).iter().any(|c| lower.contains(c))
            })
            .find_map(|line| find_date(line).map(|(_, m)| m))
    }
}

#[async_trait]
impl Reasoner for HeuristicReasoner {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn extract_field(&self, field: FieldKey, context: &[ContextChunk]) -> Result<FieldAnswer> {
        Ok(context
            .iter()
            .find_map(|chunk| {
                self.read(field, chunk).map(|value| FieldAnswer {
                    value: Some(value),
                    chunk_id: Some(chunk.chunk_id.clone()),
                })
            })
            .unwrap_or_default())
    }

    async fn answer(&self, question: &str, context: &[ContextChunk]) -> Result<Answer> {
        let terms = words(question);
        let best = context
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                let overlap = words(&chunk.text)
                    .iter()
                    .filter(|w| terms.contains(w))
                    .count();
                (overlap, std::cmp::Reverse(i), chunk)
            })
            .max_by_key(|(overlap, rev, _)| (*overlap, *rev));

        Ok(match best {
            Some((overlap, _, chunk)) if overlap > 0 => {
                let line = chunk
                    .text
                    .lines()
                    .max_by_key(|l| {
                        words(l).iter().filter(|w| terms.contains(w)).count()
                    })
                    .unwrap_or(&chunk.text);
                Answer {
                    text: format!("{} (p. {})", line.trim(), chunk.page),
                    cited_chunk_ids: vec![chunk.chunk_id.clone()],
                }
            }
            _ => Answer {
                text: "No passage in the case documents addresses the question.".to_string(),
                cited_chunk_ids: Vec::new(),
            },
        })
    }
}
