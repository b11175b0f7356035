//! Typed value parsing for sheet fields.
//!
//! Reasoning providers return raw strings; [`coerce`] turns them into a
//! [`FieldValue`] of the field's kind or rejects them. [`find_in_text`]
//! scans free text for the first plausible value and backs the heuristic
//! reasoner.
//!
//! Recognized forms:
//!
//! | Kind | Forms |
//! |------|-------|
//! | date | `2023-03-15`, `15/03/2023`, `15-03-23`, `15 de marzo de 2023` |
//! | money | `$ 1,234.56`, `1234.56`, `$250` |
//! | cause | canonical names plus Spanish/English keywords |

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{FieldKind, FieldValue, TerminationCause};

static DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?P<iy>\d{4})-(?P<im>\d{1,2})-(?P<id>\d{1,2})|(?P<ld>\d{1,2})\s+(?:de\s+)?(?P<lm>enero|febrero|marzo|abril|mayo|junio|julio|agosto|septiembre|setiembre|octubre|noviembre|diciembre)\s+(?:de\s+|del\s+)?(?P<ly>\d{4})|(?P<nd>\d{1,2})[/-](?P<nm>\d{1,2})[/-](?P<ny>\d{2,4})",
    )
    .expect("date pattern is valid")
});

static MONEY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\s*(\d{1,3}(?:,\d{3})+(?:\.\d{1,2})?|\d+(?:\.\d{1,2})?)")
        .expect("money pattern is valid")
});

static BARE_AMOUNT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d{1,3}(?:,\d{3})+(?:\.\d{1,2})?|\d{2,}(?:\.\d{1,2})?)\b")
        .expect("amount pattern is valid")
});

/// Lines mentioning these words are preferred when looking for a salary.
const SALARY_HINTS: [&str; 6] = ["salario", "sueldo", "cuota", "sdi", "neto", "salary"];

fn month_number(name: &str) -> Option<u32> {
    let m = match name.to_lowercase().as_str() {
        "enero" => 1,
        "febrero" => 2,
        "marzo" => 3,
        "abril" => 4,
        "mayo" => 5,
        "junio" => 6,
        "julio" => 7,
        "agosto" => 8,
        "septiembre" | "setiembre" => 9,
        "octubre" => 10,
        "noviembre" => 11,
        "diciembre" => 12,
        _ => return None,
    };
    Some(m)
}

/// Find the first date in `text`, returning it with the matched slice.
pub fn find_date(text: &str) -> Option<(NaiveDate, String)> {
    for caps in DATE_RE.captures_iter(text) {
        let num = |name: &str| caps.name(name).and_then(|m| m.as_str().parse::<i32>().ok());
        let date = if let (Some(y), Some(m), Some(d)) = (num("iy"), num("im"), num("id")) {
            NaiveDate::from_ymd_opt(y, m as u32, d as u32)
        } else if let (Some(d), Some(m), Some(y)) = (
            num("ld"),
            caps.name("lm").and_then(|m| month_number(m.as_str())),
            num("ly"),
        ) {
            NaiveDate::from_ymd_opt(y, m, d as u32)
        } else if let (Some(d), Some(m), Some(y)) = (num("nd"), num("nm"), caps.name("ny")) {
            let year = if y.as_str().len() == 2 {
                y.as_str().parse::<i32>().ok().map(|v| 2000 + v)
            } else {
                y.as_str().parse::<i32>().ok()
            };
            year.and_then(|y| NaiveDate::from_ymd_opt(y, m as u32, d as u32))
        } else {
            None
        };
        if let (Some(date), Some(whole)) = (date, caps.get(0)) {
            return Some((date, whole.as_str().to_string()));
        }
    }
    None
}

/// Parse `"1,234.56"` into cents.
fn amount_to_cents(raw: &str) -> Option<i64> {
    let clean = raw.replace(',', "");
    let (whole, frac) = match clean.split_once('.') {
        Some((w, f)) => (w, f),
        None => (clean.as_str(), ""),
    };
    let whole: i64 = whole.parse().ok()?;
    let frac: i64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>().ok()? * 10,
        2 => frac.parse().ok()?,
        _ => return None,
    };
    whole.checked_mul(100)?.checked_add(frac)
}

/// Find a money amount in `text`, preferring lines that mention a salary.
///
/// Order: `$` amount on a salary line, any `$` amount, bare amount on a
/// salary line.
pub fn find_money(text: &str) -> Option<(i64, String)> {
    let salary_lines: Vec<&str> = text
        .lines()
        .filter(|l| {
            let lower = l.to_lowercase();
            SALARY_HINTS.iter().any(|h| lower.contains(h))
        })
        .collect();

    let first = |re: &Regex, s: &str| {
        re.captures(s).and_then(|c| {
            let raw = c.get(1)?.as_str();
            let whole = c.get(0)?.as_str().to_string();
            amount_to_cents(raw).map(|cents| (cents, whole))
        })
    };

    salary_lines
        .iter()
        .find_map(|l| first(&MONEY_RE, l))
        .or_else(|| first(&MONEY_RE, text))
        .or_else(|| salary_lines.iter().find_map(|l| first(&BARE_AMOUNT_RE, l)))
}

/// Find a termination cause keyword in `text`.
pub fn find_cause(text: &str) -> Option<(TerminationCause, String)> {
    const KEYWORDS: [(&str, TerminationCause); 13] = [
        ("mutuo acuerdo", TerminationCause::MutualAgreement),
        ("mutual agreement", TerminationCause::MutualAgreement),
        ("convenio de terminación", TerminationCause::MutualAgreement),
        ("renuncia", TerminationCause::Resignation),
        ("renunció", TerminationCause::Resignation),
        ("resignation", TerminationCause::Resignation),
        ("despido", TerminationCause::Dismissal),
        ("despidió", TerminationCause::Dismissal),
        ("rescisión", TerminationCause::Dismissal),
        ("dismissal", TerminationCause::Dismissal),
        ("vencimiento del contrato", TerminationCause::ContractEnd),
        ("término del contrato", TerminationCause::ContractEnd),
        ("contract end", TerminationCause::ContractEnd),
    ];
    let lower = text.to_lowercase();
    KEYWORDS
        .iter()
        .filter_map(|(kw, cause)| lower.find(kw).map(|pos| (pos, *kw, *cause)))
        .min_by_key(|(pos, _, _)| *pos)
        .map(|(_, kw, cause)| (cause, kw.to_string()))
}

/// Find the first value of `kind` in free text.
pub fn find_in_text(kind: FieldKind, text: &str, currency: &str) -> Option<(FieldValue, String)> {
    match kind {
        FieldKind::Date => find_date(text).map(|(date, m)| (FieldValue::Date { date }, m)),
        FieldKind::Money => find_money(text).map(|(cents, m)| {
            (
                FieldValue::Money {
                    cents,
                    currency: currency.to_string(),
                },
                m,
            )
        }),
        FieldKind::Cause => find_cause(text).map(|(cause, m)| (FieldValue::Cause { cause }, m)),
    }
}

/// Coerce a provider's raw answer into a typed value.
///
/// Returns `None` when the string does not hold a value of `kind`; callers
/// treat that as `MISSING`.
pub fn coerce(kind: FieldKind, raw: &str, currency: &str) -> Option<FieldValue> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match kind {
        FieldKind::Date => find_date(raw).map(|(date, _)| FieldValue::Date { date }),
        FieldKind::Money => {
            let stripped = raw
                .trim_start_matches('$')
                .trim()
                .split_whitespace()
                .next()
                .unwrap_or("");
            amount_to_cents(stripped)
                .or_else(|| find_money(raw).map(|(c, _)| c))
                .map(|cents| FieldValue::Money {
                    cents,
                    currency: currency.to_string(),
                })
        }
        FieldKind::Cause => raw
            .to_lowercase()
            .parse::<TerminationCause>()
            .ok()
            .or_else(|| find_cause(raw).map(|(c, _)| c))
            .map(|cause| FieldValue::Cause { cause }),
    }
}
