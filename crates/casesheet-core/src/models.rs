//! Core data models used throughout casesheet.
//!
//! These types represent the documents, spans, chunks, pipeline tasks and
//! technical-sheet fields that flow through the stage pipeline. Timestamps
//! are Unix seconds; identifiers are UUID strings.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// A rectangular region in page space.
///
/// Coordinates are normalized to `[0.0, 1.0]` with the origin at the top
/// left corner of the page: `x0 <= x1` and `y0 <= y1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl BBox {
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Smallest box covering both `self` and `other`.
    pub fn union(&self, other: &BBox) -> BBox {
        BBox {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    /// True when all bounds are finite and ordered.
    pub fn is_valid(&self) -> bool {
        [self.x0, self.y0, self.x1, self.y1]
            .iter()
            .all(|v| v.is_finite())
            && self.x0 <= self.x1
            && self.y0 <= self.y1
    }
}

/// A run of text read from one page, with the region it occupies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSpan {
    /// 1-indexed page number.
    pub page: u32,
    pub text: String,
    pub bbox: BBox,
}

/// Output of a layout extractor: spans in reading order plus page count.
#[derive(Debug, Clone, Default)]
pub struct ExtractedLayout {
    pub page_count: u32,
    pub spans: Vec<TextSpan>,
}

impl ExtractedLayout {
    /// All span text joined in reading order.
    pub fn full_text(&self) -> String {
        self.spans
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $s,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = PipelineError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($name::$variant),)+
                    other => Err(PipelineError::PermanentInput(format!(
                        "unknown {}: '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

/// Closed set of document type labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocLabel {
    Contract,
    Payslip,
    TerminationLetter,
    ResignationLetter,
    Complaint,
    SocialSecurityRegistration,
    AttendanceRecord,
    Unknown,
}

str_enum!(DocLabel {
    Contract => "contract",
    Payslip => "payslip",
    TerminationLetter => "termination_letter",
    ResignationLetter => "resignation_letter",
    Complaint => "complaint",
    SocialSecurityRegistration => "social_security_registration",
    AttendanceRecord => "attendance_record",
    Unknown => "unknown",
});

impl DocLabel {
    /// Every label a classifier may choose, excluding [`DocLabel::Unknown`].
    pub const KNOWN: [DocLabel; 7] = [
        DocLabel::Contract,
        DocLabel::Payslip,
        DocLabel::TerminationLetter,
        DocLabel::ResignationLetter,
        DocLabel::Complaint,
        DocLabel::SocialSecurityRegistration,
        DocLabel::AttendanceRecord,
    ];
}

/// How far a document has progressed through the per-document stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStage {
    Uploaded,
    Ingested,
    Indexed,
}

str_enum!(DocumentStage {
    Uploaded => "uploaded",
    Ingested => "ingested",
    Indexed => "indexed",
});

/// A source document belonging to a case.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub case_id: String,
    /// Handle of the original bytes in object storage.
    pub file_handle: String,
    pub filename: String,
    pub content_type: String,
    /// `None` until the ingest stage has run.
    pub label: Option<DocLabel>,
    pub label_confidence: Option<f64>,
    pub page_count: u32,
    pub stage: DocumentStage,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A chunk before its embedding has been computed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDraft {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    /// 1-indexed page the chunk lies on. Chunks never span pages.
    pub page: u32,
    pub bbox: BBox,
    pub text: String,
    pub hash: String,
}

impl ChunkDraft {
    pub fn with_embedding(self, embedding: Vec<f32>) -> Chunk {
        Chunk {
            id: self.id,
            document_id: self.document_id,
            chunk_index: self.chunk_index,
            page: self.page,
            bbox: self.bbox,
            text: self.text,
            hash: self.hash,
            embedding,
        }
    }
}

/// An indexed retrieval unit: page-bounded text plus its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub page: u32,
    pub bbox: BBox,
    pub text: String,
    pub hash: String,
    pub embedding: Vec<f32>,
}

// ============ Pipeline ============

/// A pipeline phase with declared dependencies on earlier phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ingest,
    Index,
    Extract,
    Audit,
}

str_enum!(Stage {
    Ingest => "ingest",
    Index => "index",
    Extract => "extract",
    Audit => "audit",
});

/// What a stage's subject id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectKind {
    Document,
    Case,
}

impl Stage {
    pub fn subject_kind(&self) -> SubjectKind {
        match self {
            Stage::Ingest | Stage::Index => SubjectKind::Document,
            Stage::Extract | Stage::Audit => SubjectKind::Case,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

str_enum!(TaskStatus {
    Pending => "pending",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl TaskStatus {
    /// Pending and running tasks count against the one-active-task rule.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

/// Durable record of one stage execution for one subject.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineTask {
    pub id: String,
    /// Document id for ingest/index, case id for extract/audit.
    pub subject_id: String,
    pub stage: Stage,
    pub status: TaskStatus,
    /// Number of failed attempts so far.
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
    /// Earliest time a pending task may be claimed.
    pub run_after: i64,
    pub lease_expires_at: Option<i64>,
    pub worker_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl PipelineTask {
    pub fn new(subject_id: &str, stage: Stage, max_attempts: u32, now: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            subject_id: subject_id.to_string(),
            stage,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts,
            last_error: None,
            result: None,
            run_after: now,
            lease_expires_at: None,
            worker_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A running task whose lease has lapsed may be claimed again.
    pub fn lease_expired(&self, now: i64) -> bool {
        self.status == TaskStatus::Running && self.lease_expires_at.is_some_and(|t| t <= now)
    }

    pub fn is_claimable(&self, now: i64) -> bool {
        (self.status == TaskStatus::Pending && self.run_after <= now) || self.lease_expired(now)
    }
}

// ============ Technical sheet ============

/// The fixed set of fields on a case's technical sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKey {
    StartDate,
    EndDate,
    DailySalary,
    TerminationCause,
}

str_enum!(FieldKey {
    StartDate => "start_date",
    EndDate => "end_date",
    DailySalary => "daily_salary",
    TerminationCause => "termination_cause",
});

/// The value type a field holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Date,
    Money,
    Cause,
}

/// The semantic domain a field belongs to, used for source precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldDomain {
    Economic,
    Identity,
    Conditions,
}

str_enum!(FieldDomain {
    Economic => "economic",
    Identity => "identity",
    Conditions => "conditions",
});

impl FieldKey {
    pub const ALL: [FieldKey; 4] = [
        FieldKey::StartDate,
        FieldKey::EndDate,
        FieldKey::DailySalary,
        FieldKey::TerminationCause,
    ];

    pub fn kind(&self) -> FieldKind {
        match self {
            FieldKey::StartDate | FieldKey::EndDate => FieldKind::Date,
            FieldKey::DailySalary => FieldKind::Money,
            FieldKey::TerminationCause => FieldKind::Cause,
        }
    }

    pub fn domain(&self) -> FieldDomain {
        match self {
            FieldKey::DailySalary => FieldDomain::Economic,
            FieldKey::StartDate => FieldDomain::Identity,
            FieldKey::EndDate | FieldKey::TerminationCause => FieldDomain::Conditions,
        }
    }

    /// Retrieval query used to rank chunks for this field.
    pub fn query(&self) -> &'static str {
        match self {
            FieldKey::StartDate => "fecha de ingreso inicio de labores comenzó a trabajar",
            FieldKey::EndDate => "fecha de despido terminación de la relación laboral baja",
            FieldKey::DailySalary => "salario diario cuota diaria sueldo base",
            FieldKey::TerminationCause => "causa de terminación despido renuncia rescisión",
        }
    }

    /// Human-readable description handed to reasoning providers.
    pub fn description(&self) -> &'static str {
        match self {
            FieldKey::StartDate => "the date the employment relationship started",
            FieldKey::EndDate => "the date the employment relationship ended",
            FieldKey::DailySalary => "the worker's daily salary as a currency amount",
            FieldKey::TerminationCause => {
                "why the employment ended: dismissal, resignation, mutual_agreement or contract_end"
            }
        }
    }
}

/// Why an employment relationship ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationCause {
    Dismissal,
    Resignation,
    MutualAgreement,
    ContractEnd,
}

str_enum!(TerminationCause {
    Dismissal => "dismissal",
    Resignation => "resignation",
    MutualAgreement => "mutual_agreement",
    ContractEnd => "contract_end",
});

/// A typed field value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldValue {
    Date { date: NaiveDate },
    Money { cents: i64, currency: String },
    Cause { cause: TerminationCause },
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Date { .. } => FieldKind::Date,
            FieldValue::Money { .. } => FieldKind::Money,
            FieldValue::Cause { .. } => FieldKind::Cause,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            FieldValue::Date { date } => Some(*date),
            _ => None,
        }
    }

    /// Stable text form used for storage and equality across documents.
    pub fn canonical(&self) -> String {
        match self {
            FieldValue::Date { date } => date.format("%Y-%m-%d").to_string(),
            FieldValue::Money { cents, currency } => {
                format!("{}.{:02} {}", cents / 100, (cents % 100).abs(), currency)
            }
            FieldValue::Cause { cause } => cause.as_str().to_string(),
        }
    }

    /// Parse the output of [`canonical`](Self::canonical) for a field kind.
    pub fn parse_canonical(kind: FieldKind, s: &str) -> Result<FieldValue, PipelineError> {
        let bad = || PipelineError::PermanentInput(format!("malformed stored value: '{}'", s));
        match kind {
            FieldKind::Date => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(|date| FieldValue::Date { date })
                .map_err(|_| bad()),
            FieldKind::Money => {
                let (amount, currency) = s.split_once(' ').ok_or_else(bad)?;
                let (whole, frac) = amount.split_once('.').ok_or_else(bad)?;
                let whole: i64 = whole.parse().map_err(|_| bad())?;
                let frac: i64 = frac.parse().map_err(|_| bad())?;
                Ok(FieldValue::Money {
                    cents: whole * 100 + frac,
                    currency: currency.to_string(),
                })
            }
            FieldKind::Cause => s
                .parse::<TerminationCause>()
                .map(|cause| FieldValue::Cause { cause }),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Exactly where a fact was read: document, page and region.
///
/// The triple is a single value so a field can never carry a partial
/// pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub document_id: String,
    /// 1-indexed page.
    pub page: u32,
    pub bbox: BBox,
}

/// Who set a field's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FieldOrigin {
    #[default]
    Derived,
    Manual,
}

str_enum!(FieldOrigin {
    Derived => "derived",
    Manual => "manual",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

str_enum!(RiskLevel {
    Low => "low",
    Medium => "medium",
    High => "high",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    #[default]
    Low,
    Medium,
    High,
}

str_enum!(Confidence {
    Low => "low",
    Medium => "medium",
    High => "high",
});

/// One field of the technical sheet.
///
/// `value: None` is the `MISSING` state. A derived value with
/// `provenance: None` is present-but-unsourced.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct FieldRecord {
    pub value: Option<FieldValue>,
    pub provenance: Option<Provenance>,
    pub origin: FieldOrigin,
    pub risk: RiskLevel,
    pub confidence: Confidence,
    /// Text of the chunk the value was read from.
    pub excerpt: Option<String>,
}

impl FieldRecord {
    pub fn missing() -> Self {
        Self {
            risk: RiskLevel::Medium,
            ..Self::default()
        }
    }

    pub fn is_missing(&self) -> bool {
        self.value.is_none()
    }

    pub fn is_manual(&self) -> bool {
        self.origin == FieldOrigin::Manual
    }
}

/// A reading of one field from one document, kept for cross-document audit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldObservation {
    pub case_id: String,
    pub field: FieldKey,
    pub document_id: String,
    pub value: FieldValue,
    /// `None` when the provider could not name a supporting chunk.
    pub provenance: Option<Provenance>,
    /// Similarity score of the cited chunk.
    pub score: f32,
    /// Source precedence rank of the document for this field's domain.
    pub rank: u32,
    pub excerpt: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagCode {
    Missing,
    Unsourced,
    DateOrder,
    DomainMismatch,
    Conflict,
    /// The worker alleges a dismissal and no termination notice is on file.
    TerminationCompliance,
    /// A document type every case file should hold is absent.
    MissingDocument,
}

str_enum!(FlagCode {
    Missing => "missing",
    Unsourced => "unsourced",
    DateOrder => "date_order",
    DomainMismatch => "domain_mismatch",
    Conflict => "conflict",
    TerminationCompliance => "termination_compliance",
    MissingDocument => "missing_document",
});

/// A specific inconsistency detected by the audit stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditFlag {
    pub field: Option<FieldKey>,
    pub code: FlagCode,
    pub severity: RiskLevel,
    pub message: String,
    /// Source documents involved, e.g. both sides of a conflict.
    pub document_ids: Vec<String>,
}

/// The technical sheet for one case.
#[derive(Debug, Clone, Serialize)]
pub struct CaseSheet {
    pub case_id: String,
    /// Optimistic concurrency token, bumped on every write.
    pub version: i64,
    pub fields: BTreeMap<FieldKey, FieldRecord>,
    pub flags: Vec<AuditFlag>,
}

impl CaseSheet {
    pub fn empty(case_id: &str) -> Self {
        Self {
            case_id: case_id.to_string(),
            version: 0,
            fields: BTreeMap::new(),
            flags: Vec::new(),
        }
    }

    /// The record for `key`, or a missing record if never written.
    pub fn field(&self, key: FieldKey) -> FieldRecord {
        self.fields
            .get(&key)
            .cloned()
            .unwrap_or_else(FieldRecord::missing)
    }
}
