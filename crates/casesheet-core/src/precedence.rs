//! Source precedence between document types.
//!
//! When several documents report the same fact, the one whose type is the
//! most authoritative for the field's domain wins. Ranks run from 100 down
//! in steps of 10 along each domain's ordered list; labels off the list
//! rank 40. Without a contract on file the burden of proof shifts and the
//! worker's complaint ranks 85.

use crate::models::{DocLabel, FieldDomain, FieldKey};

/// Rank at or above which a winning source gives high confidence.
pub const HIGH_CONFIDENCE_RANK: u32 = 80;

fn order(domain: FieldDomain) -> &'static [DocLabel] {
    match domain {
        FieldDomain::Economic => &[DocLabel::Payslip, DocLabel::Contract, DocLabel::Complaint],
        FieldDomain::Identity => &[
            DocLabel::SocialSecurityRegistration,
            DocLabel::Contract,
            DocLabel::Complaint,
        ],
        FieldDomain::Conditions => &[
            DocLabel::Contract,
            DocLabel::AttendanceRecord,
            DocLabel::Complaint,
            DocLabel::TerminationLetter,
            DocLabel::ResignationLetter,
        ],
    }
}

/// Precedence rank of a document label for a field.
pub fn rank(label: DocLabel, field: FieldKey, contract_on_file: bool) -> u32 {
    if !contract_on_file && label == DocLabel::Complaint {
        return 85;
    }
    match order(field.domain()).iter().position(|l| *l == label) {
        Some(idx) => 100 - (idx as u32 * 10),
        None => 40,
    }
}

/// Whether a label is an expected source for a field's domain.
///
/// `unknown` is never judged inconsistent.
pub fn label_fits(label: DocLabel, field: FieldKey) -> bool {
    label == DocLabel::Unknown || order(field.domain()).contains(&label)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payslip_beats_contract_for_salary() {
        assert_eq!(rank(DocLabel::Payslip, FieldKey::DailySalary, true), 100);
        assert_eq!(rank(DocLabel::Contract, FieldKey::DailySalary, true), 90);
        assert_eq!(rank(DocLabel::AttendanceRecord, FieldKey::DailySalary, true), 40);
    }

    #[test]
    fn test_complaint_without_contract() {
        assert_eq!(rank(DocLabel::Complaint, FieldKey::StartDate, true), 80);
        assert_eq!(rank(DocLabel::Complaint, FieldKey::StartDate, false), 85);
    }

    #[test]
    fn test_conditions_order() {
        let at = |label| rank(label, FieldKey::EndDate, true);
        assert_eq!(at(DocLabel::Contract), 100);
        assert_eq!(at(DocLabel::AttendanceRecord), 90);
        assert_eq!(at(DocLabel::Complaint), 80);
        assert_eq!(at(DocLabel::TerminationLetter), 70);
        assert_eq!(at(DocLabel::ResignationLetter), 60);
    }

    #[test]
    fn test_label_fits() {
        assert!(label_fits(DocLabel::Payslip, FieldKey::DailySalary));
        assert!(!label_fits(DocLabel::AttendanceRecord, FieldKey::DailySalary));
        assert!(label_fits(DocLabel::Unknown, FieldKey::DailySalary));
    }
}
