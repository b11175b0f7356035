//! Keyword document classifier.
//!
//! Scores each label by how many of its Spanish/English cue phrases occur
//! in the document text. When the text carries no cue at all, the filename
//! is consulted (`nomina_marzo.pdf` → payslip). Confidence grows with the
//! number of hits for the winning label and shrinks when other labels also
//! matched.
//!
//! The ingest stage compares the confidence against the configured
//! threshold and persists `unknown` below it.

use anyhow::Result;
use async_trait::async_trait;

use crate::models::DocLabel;
use crate::providers::{Classification, DocumentClassifier};

const CUES: [(DocLabel, &[&str]); 7] = [
    (
        DocLabel::Contract,
        &[
            "contrato individual de trabajo",
            "contrato de trabajo",
            "cláusula",
            "clausula",
            "las partes",
            "employment agreement",
        ],
    ),
    (
        DocLabel::Payslip,
        &[
            "recibo de nómina",
            "recibo de nomina",
            "percepciones",
            "deducciones",
            "neto a pagar",
            "cfdi",
            "payslip",
        ],
    ),
    (
        DocLabel::TerminationLetter,
        &[
            "aviso de rescisión",
            "aviso de rescision",
            "se le notifica",
            "terminación de la relación",
            "despido",
            "termination letter",
        ],
    ),
    (
        DocLabel::ResignationLetter,
        &[
            "renuncia voluntaria",
            "por mi propia voluntad",
            "renuncia",
            "resignation",
        ],
    ),
    (
        DocLabel::Complaint,
        &[
            "demanda",
            "tribunal laboral",
            "junta de conciliación",
            "prestaciones reclamadas",
            "parte actora",
        ],
    ),
    (
        DocLabel::SocialSecurityRegistration,
        &[
            "imss",
            "aviso de alta",
            "seguro social",
            "número de seguridad social",
        ],
    ),
    (
        DocLabel::AttendanceRecord,
        &[
            "lista de asistencia",
            "hora de entrada",
            "hora de salida",
            "checador",
        ],
    ),
];

const FILENAME_HINTS: [(&str, DocLabel); 9] = [
    ("nomina", DocLabel::Payslip),
    ("cfdi", DocLabel::Payslip),
    ("contrato", DocLabel::Contract),
    ("demanda", DocLabel::Complaint),
    ("renuncia", DocLabel::ResignationLetter),
    ("rescision", DocLabel::TerminationLetter),
    ("despido", DocLabel::TerminationLetter),
    ("asistencia", DocLabel::AttendanceRecord),
    ("imss", DocLabel::SocialSecurityRegistration),
];

/// Confidence assigned to a label inferred from the filename alone.
const FILENAME_CONFIDENCE: f64 = 0.6;

/// Rule-based classifier over cue phrases and filename hints.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    /// Classify synchronously.
    pub fn classify_text(text: &str, filename: &str) -> Classification {
        let lower = text.to_lowercase();
        let scores: Vec<(DocLabel, usize)> = CUES
            .iter()
            .map(|(label, cues)| (*label, cues.iter().filter(|c| lower.contains(*c)).count()))
            .collect();
        let total: usize = scores.iter().map(|(_, n)| n).sum();

        if total == 0 {
            let name = filename.to_lowercase();
            return FILENAME_HINTS
                .iter()
                .find(|(hint, _)| name.contains(hint))
                .map(|(_, label)| Classification {
                    label: *label,
                    confidence: FILENAME_CONFIDENCE,
                })
                .unwrap_or(Classification {
                    label: DocLabel::Unknown,
                    confidence: 0.0,
                });
        }

        // First label wins ties, following cue table order.
        let (label, best) = scores
            .iter()
            .fold((DocLabel::Unknown, 0usize), |acc, (l, n)| {
                if *n > acc.1 {
                    (*l, *n)
                } else {
                    acc
                }
            });
        let share = best as f64 / total as f64;
        let saturation = 1.0 - 0.5f64.powi(best as i32);
        Classification {
            label,
            confidence: share * saturation,
        }
    }
}

#[async_trait]
impl DocumentClassifier for KeywordClassifier {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn classify(&self, text: &str, filename: &str) -> Result<Classification> {
        Ok(Self::classify_text(text, filename))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payslip_text() {
        let c = KeywordClassifier::classify_text(
            "RECIBO DE NÓMINA\nPercepciones\nDeducciones\nSalario Diario: $ 250.00",
            "scan001.pdf",
        );
        assert_eq!(c.label, DocLabel::Payslip);
        assert!(c.confidence > 0.8);
    }

    #[test]
    fn test_filename_fallback() {
        let c = KeywordClassifier::classify_text("sin texto reconocible", "nomina_marzo.pdf");
        assert_eq!(c.label, DocLabel::Payslip);
        assert_eq!(c.confidence, FILENAME_CONFIDENCE);
    }

    #[test]
    fn test_nothing_matches() {
        let c = KeywordClassifier::classify_text("lorem ipsum", "scan.pdf");
        assert_eq!(c.label, DocLabel::Unknown);
        assert_eq!(c.confidence, 0.0);
    }

    #[test]
    fn test_mixed_cues_lower_confidence() {
        let clean = KeywordClassifier::classify_text("demanda ante el tribunal laboral", "");
        let mixed = KeywordClassifier::classify_text(
            "demanda ante el tribunal laboral; anexo recibo de nómina",
            "",
        );
        assert_eq!(mixed.label, DocLabel::Complaint);
        assert!(mixed.confidence < clean.confidence);
    }
}
