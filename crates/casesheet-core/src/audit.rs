//! Audit stage: consistency checks over the extracted sheet.
//!
//! | Check | Flag | Severity |
//! |-------|------|----------|
//! | field has no value | `missing` | medium |
//! | derived value without provenance | `unsourced` | medium |
//! | source document type outside the field's domain | `domain_mismatch` | medium |
//! | documents disagree on a field | `conflict` | high |
//! | end date before start date | `date_order` | high |
//! | complaint on file without a termination notice | `termination_compliance` | high |
//! | no social security registration or attendance record | `missing_document` | high |
//!
//! Each field's risk is the highest severity among the flags touching it,
//! and its confidence follows from the flags and from the precedence rank
//! of its source. The last two checks concern the case file as a whole and
//! carry no field.
//!
//! Findings are also scored per dimension: economic fields, documental
//! fields (identity and employment conditions), and compliance, which
//! takes the case-level findings. Every dimension starts at 100 and loses
//! points per finding. Conflicts are only settled automatically when the
//! deployment enables it; the flag stays either way so a reviewer sees it.
//! Manual values are never replaced.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::models::{
    AuditFlag, CaseSheet, Confidence, DocLabel, FieldDomain, FieldKey, FieldObservation,
    FieldRecord, FlagCode, RiskLevel,
};
use crate::precedence::{label_fits, HIGH_CONFIDENCE_RANK};
use crate::store::{SheetUpdate, Store};

/// Summary of an audit run, stored as the task result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditReport {
    pub case_id: String,
    pub risk: RiskLevel,
    pub flags: Vec<AuditFlag>,
    pub scores: DimensionScores,
    /// Fields whose value was replaced by the highest-precedence reading.
    pub resolved: Vec<FieldKey>,
    pub version: i64,
}

/// Document types every case file is expected to hold.
pub const REQUIRED_DOCUMENTS: [DocLabel; 2] =
    [DocLabel::SocialSecurityRegistration, DocLabel::AttendanceRecord];

/// Score out of 100 for one dimension; 100 means nothing was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DimensionScore {
    pub score: u32,
    pub level: RiskLevel,
}

impl DimensionScore {
    fn from_penalty(penalty: u32) -> Self {
        let score = 100u32.saturating_sub(penalty);
        let level = if score >= 80 {
            RiskLevel::Low
        } else if score >= 50 {
            RiskLevel::Medium
        } else {
            RiskLevel::High
        };
        Self { score, level }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DimensionScores {
    pub economic: DimensionScore,
    pub documental: DimensionScore,
    pub compliance: DimensionScore,
}

pub struct Auditor<'a> {
    pub store: &'a dyn Store,
    /// Replace conflicting derived values with the highest-precedence one.
    pub auto_resolve: bool,
}

impl Auditor<'_> {
    pub async fn run(&self, case_id: &str) -> Result<AuditReport> {
        let sheet = self.store.load_sheet(case_id).await?;
        let observations = self.store.observations(case_id).await?;
        let labels: HashMap<String, DocLabel> = self
            .store
            .case_documents(case_id)
            .await?
            .into_iter()
            .map(|d| (d.id, d.label.unwrap_or(DocLabel::Unknown)))
            .collect();

        let mut fields: BTreeMap<FieldKey, FieldRecord> =
            FieldKey::ALL.iter().map(|k| (*k, sheet.field(*k))).collect();
        let mut flags = Vec::new();
        let mut resolved = Vec::new();

        for key in FieldKey::ALL {
            let seen: Vec<&FieldObservation> =
                observations.iter().filter(|o| o.field == key).collect();
            if let Some(flag) = conflict(key, &seen) {
                if self.auto_resolve {
                    if let Some(record) = fields.get_mut(&key) {
                        if resolve(record, &seen) {
                            info!(case_id, field = %key, "conflict resolved by precedence");
                            resolved.push(key);
                        }
                    }
                }
                flags.push(flag);
            }
        }

        for key in FieldKey::ALL {
            let record = &fields[&key];
            flags.extend(record_flags(key, record, &labels));
        }
        flags.extend(date_order(&fields));
        flags.extend(document_flags(&labels));

        for (key, record) in fields.iter_mut() {
            let touching: Vec<&AuditFlag> = flags.iter().filter(|f| touches(f, *key)).collect();
            record.risk = touching
                .iter()
                .map(|f| f.severity)
                .max()
                .unwrap_or(RiskLevel::Low);
            record.confidence = confidence(*key, record, &touching, &observations);
        }

        let risk = flags
            .iter()
            .map(|f| f.severity)
            .max()
            .unwrap_or(RiskLevel::Low);
        let scores = dimension_scores(&CaseSheet {
            case_id: case_id.to_string(),
            version: sheet.version,
            fields: fields.clone(),
            flags: flags.clone(),
        });
        let version = self
            .store
            .commit_sheet(
                case_id,
                sheet.version,
                &SheetUpdate {
                    fields: fields.into_iter().collect(),
                    observations: None,
                    flags: Some(flags.clone()),
                },
            )
            .await?;

        if risk == RiskLevel::High {
            warn!(case_id, flags = flags.len(), "case sheet has high-risk findings");
        }
        info!(
            case_id,
            %risk,
            flags = flags.len(),
            economic = scores.economic.score,
            documental = scores.documental.score,
            compliance = scores.compliance.score,
            version,
            "audited technical sheet"
        );
        Ok(AuditReport {
            case_id: case_id.to_string(),
            risk,
            flags,
            scores,
            resolved,
            version,
        })
    }
}

/// Overall risk of a sheet: the highest field risk or case-level finding.
pub fn case_risk(sheet: &CaseSheet) -> RiskLevel {
    let case_level = sheet
        .flags
        .iter()
        .filter(|f| f.field.is_none())
        .map(|f| f.severity);
    FieldKey::ALL
        .iter()
        .map(|k| sheet.field(*k).risk)
        .chain(case_level)
        .max()
        .unwrap_or(RiskLevel::Low)
}

/// Per-dimension scores of an audited sheet.
///
/// A field loses 20 points at high risk and 10 at medium, 15 more when
/// missing, 20 more when in conflict and 5 more at low confidence. Each
/// high case-level finding costs compliance 15 points. Levels: 80 and up
/// is low, 50 and up medium, below that high.
pub fn dimension_scores(sheet: &CaseSheet) -> DimensionScores {
    let (mut economic, mut documental, mut compliance) = (0u32, 0u32, 0u32);
    for key in FieldKey::ALL {
        let record = sheet.field(key);
        let mut penalty = match record.risk {
            RiskLevel::High => 20,
            RiskLevel::Medium => 10,
            RiskLevel::Low => 0,
        };
        if record.is_missing() {
            penalty += 15;
        }
        if sheet
            .flags
            .iter()
            .any(|f| f.field == Some(key) && f.code == FlagCode::Conflict)
        {
            penalty += 20;
        }
        if record.confidence == Confidence::Low {
            penalty += 5;
        }
        match key.domain() {
            FieldDomain::Economic => economic += penalty,
            FieldDomain::Identity | FieldDomain::Conditions => documental += penalty,
        }
    }
    for flag in sheet.flags.iter().filter(|f| f.field.is_none()) {
        if flag.severity == RiskLevel::High {
            compliance += 15;
        }
    }
    DimensionScores {
        economic: DimensionScore::from_penalty(economic),
        documental: DimensionScore::from_penalty(documental),
        compliance: DimensionScore::from_penalty(compliance),
    }
}

fn touches(flag: &AuditFlag, key: FieldKey) -> bool {
    flag.field == Some(key)
        || (flag.code == FlagCode::DateOrder
            && matches!(key, FieldKey::StartDate | FieldKey::EndDate))
}

fn record_flags(
    key: FieldKey,
    record: &FieldRecord,
    labels: &HashMap<String, DocLabel>,
) -> Vec<AuditFlag> {
    let mut flags = Vec::new();
    if record.is_missing() {
        flags.push(AuditFlag {
            field: Some(key),
            code: FlagCode::Missing,
            severity: RiskLevel::Medium,
            message: format!("no document states the {}", key.description()),
            document_ids: Vec::new(),
        });
        return flags;
    }
    match &record.provenance {
        None if !record.is_manual() => flags.push(AuditFlag {
            field: Some(key),
            code: FlagCode::Unsourced,
            severity: RiskLevel::Medium,
            message: format!("{} has a value but no source chunk", key),
            document_ids: Vec::new(),
        }),
        None => {}
        Some(p) => {
            let label = labels
                .get(&p.document_id)
                .copied()
                .unwrap_or(DocLabel::Unknown);
            if !label_fits(label, key) {
                flags.push(AuditFlag {
                    field: Some(key),
                    code: FlagCode::DomainMismatch,
                    severity: RiskLevel::Medium,
                    message: format!(
                        "{} was read from a {} document, which is not a {} source",
                        key,
                        label,
                        key.domain()
                    ),
                    document_ids: vec![p.document_id.clone()],
                });
            }
        }
    }
    flags
}

/// A conflict flag when the observations hold more than one value.
fn conflict(key: FieldKey, seen: &[&FieldObservation]) -> Option<AuditFlag> {
    let mut values: Vec<String> = seen.iter().map(|o| o.value.canonical()).collect();
    values.sort();
    values.dedup();
    if values.len() < 2 {
        return None;
    }
    let mut document_ids: Vec<String> = Vec::new();
    for o in seen {
        if !document_ids.contains(&o.document_id) {
            document_ids.push(o.document_id.clone());
        }
    }
    let readings: Vec<String> = seen
        .iter()
        .map(|o| format!("{} in {}", o.value.canonical(), o.document_id))
        .collect();
    Some(AuditFlag {
        field: Some(key),
        code: FlagCode::Conflict,
        severity: RiskLevel::High,
        message: format!("documents disagree on {}: {}", key, readings.join(", ")),
        document_ids,
    })
}

/// Set `record` to the highest-precedence sourced observation.
///
/// Returns whether the value changed. Manual records are left alone.
fn resolve(record: &mut FieldRecord, seen: &[&FieldObservation]) -> bool {
    if record.is_manual() {
        return false;
    }
    let Some(best) = seen
        .iter()
        .filter(|o| o.provenance.is_some())
        .max_by(|a, b| a.rank.cmp(&b.rank).then(a.score.total_cmp(&b.score)))
    else {
        return false;
    };
    if record.value.as_ref() == Some(&best.value) && record.provenance == best.provenance {
        return false;
    }
    record.value = Some(best.value.clone());
    record.provenance = best.provenance.clone();
    record.excerpt = best.excerpt.clone();
    true
}

/// Case-level findings about which document types are on file.
fn document_flags(labels: &HashMap<String, DocLabel>) -> Vec<AuditFlag> {
    let ids_of = |label: DocLabel| {
        let mut ids: Vec<String> = labels
            .iter()
            .filter(|(_, l)| **l == label)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    };

    let mut flags = Vec::new();
    let complaints = ids_of(DocLabel::Complaint);
    if !complaints.is_empty() && ids_of(DocLabel::TerminationLetter).is_empty() {
        flags.push(AuditFlag {
            field: None,
            code: FlagCode::TerminationCompliance,
            severity: RiskLevel::High,
            message: "the worker alleges a dismissal but no termination notice is on file"
                .to_string(),
            document_ids: complaints,
        });
    }
    for label in REQUIRED_DOCUMENTS {
        if ids_of(label).is_empty() {
            flags.push(AuditFlag {
                field: None,
                code: FlagCode::MissingDocument,
                severity: RiskLevel::High,
                message: format!("no {} document on file", label),
                document_ids: Vec::new(),
            });
        }
    }
    flags
}

fn date_order(fields: &BTreeMap<FieldKey, FieldRecord>) -> Option<AuditFlag> {
    let start = fields.get(&FieldKey::StartDate)?;
    let end = fields.get(&FieldKey::EndDate)?;
    let (s, e) = (start.value.as_ref()?.as_date()?, end.value.as_ref()?.as_date()?);
    if e >= s {
        return None;
    }
    let document_ids = [start, end]
        .iter()
        .filter_map(|r| r.provenance.as_ref().map(|p| p.document_id.clone()))
        .fold(Vec::new(), |mut ids, id| {
            if !ids.contains(&id) {
                ids.push(id);
            }
            ids
        });
    Some(AuditFlag {
        field: Some(FieldKey::EndDate),
        code: FlagCode::DateOrder,
        severity: RiskLevel::High,
        message: format!("end date {} is before start date {}", e, s),
        document_ids,
    })
}

fn confidence(
    key: FieldKey,
    record: &FieldRecord,
    touching: &[&AuditFlag],
    observations: &[FieldObservation],
) -> Confidence {
    if record.is_missing() {
        return Confidence::Low;
    }
    match touching.iter().map(|f| f.severity).max() {
        Some(RiskLevel::High) => Confidence::Low,
        Some(_) => Confidence::Medium,
        None if record.is_manual() => Confidence::High,
        None => {
            let source_rank = record.provenance.as_ref().and_then(|p| {
                observations
                    .iter()
                    .filter(|o| o.field == key && o.document_id == p.document_id)
                    .map(|o| o.rank)
                    .max()
            });
            match source_rank {
                Some(rank) if rank >= HIGH_CONFIDENCE_RANK => Confidence::High,
                _ => Confidence::Medium,
            }
        }
    }
}
