//! Document classifiers available to the ingest stage.
//!
//! `keyword` is the offline [`KeywordClassifier`]; `reasoning` asks the
//! chat model configured for the `classify` purpose. Either way ingest
//! applies `classifier.min_confidence` afterwards.

use anyhow::{bail, Result};
use async_trait::async_trait;
use casesheet_core::classify::KeywordClassifier;
use casesheet_core::models::DocLabel;
use casesheet_core::providers::{Classification, DocumentClassifier};
use serde::Deserialize;
use tracing::debug;

use crate::config::{Config, ReasoningPurpose};
use crate::reasoning::ChatClient;

/// Characters of document text sent to the model.
const CLASSIFY_TEXT_LIMIT: usize = 6000;

#[derive(Debug, Deserialize)]
struct LabelReply {
    label: String,
    #[serde(default)]
    confidence: f64,
}

pub struct ReasoningClassifier {
    client: ChatClient,
}

impl ReasoningClassifier {
    pub fn new(client: ChatClient) -> Self {
        Self { client }
    }
}

fn system_prompt() -> String {
    let labels: Vec<&str> = DocLabel::KNOWN.iter().map(|l| l.as_str()).collect();
    format!(
        "You classify documents filed in a Mexican labor case. \
         Reply with a JSON object {{\"label\": string, \"confidence\": number between 0 and 1}}. \
         label is one of: {}, or \"unknown\" when none fits.",
        labels.join(", ")
    )
}

/// Map a model reply onto a label; anything unrecognised is `unknown`.
fn to_classification(reply: LabelReply) -> Classification {
    match reply.label.trim().to_lowercase().parse::<DocLabel>() {
        Ok(label) if label != DocLabel::Unknown => Classification {
            label,
            confidence: reply.confidence.clamp(0.0, 1.0),
        },
        _ => Classification {
            label: DocLabel::Unknown,
            confidence: 0.0,
        },
    }
}

#[async_trait]
impl DocumentClassifier for ReasoningClassifier {
    fn name(&self) -> &str {
        "reasoning"
    }

    async fn classify(&self, text: &str, filename: &str) -> Result<Classification> {
        let excerpt: String = text.chars().take(CLASSIFY_TEXT_LIMIT).collect();
        let user = format!("Filename: {}\n\n{}", filename, excerpt);
        let reply: LabelReply = self.client.complete_json(&system_prompt(), &user).await?;
        debug!(filename, label = %reply.label, confidence = reply.confidence, "model classification");
        Ok(to_classification(reply))
    }
}

/// Create the [`DocumentClassifier`] named by `classifier.provider`.
pub fn create_classifier(config: &Config) -> Result<Box<dyn DocumentClassifier>> {
    match config.classifier.provider.as_str() {
        "keyword" => Ok(Box::new(KeywordClassifier)),
        "reasoning" => {
            let (provider, _) = config.reasoning.resolve(ReasoningPurpose::Classify);
            if provider == "heuristic" {
                bail!("classifier.provider = \"reasoning\" needs a chat model for reasoning.classify");
            }
            Ok(Box::new(ReasoningClassifier::new(ChatClient::for_purpose(
                config,
                ReasoningPurpose::Classify,
            )?)))
        }
        other => bail!("Unknown classifier provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_label_keeps_confidence() {
        let c = to_classification(LabelReply {
            label: "Payslip".into(),
            confidence: 0.92,
        });
        assert_eq!(c.label, DocLabel::Payslip);
        assert!((c.confidence - 0.92).abs() < 1e-9);
    }

    #[test]
    fn test_unrecognised_label_is_unknown() {
        let c = to_classification(LabelReply {
            label: "invoice".into(),
            confidence: 0.99,
        });
        assert_eq!(c.label, DocLabel::Unknown);
        assert_eq!(c.confidence, 0.0);
    }

    #[test]
    fn test_confidence_clamped() {
        let c = to_classification(LabelReply {
            label: "contract".into(),
            confidence: 7.0,
        });
        assert_eq!(c.confidence, 1.0);
    }

    #[test]
    fn test_prompt_lists_labels() {
        let prompt = system_prompt();
        for label in DocLabel::KNOWN {
            assert!(prompt.contains(label.as_str()));
        }
    }
}
