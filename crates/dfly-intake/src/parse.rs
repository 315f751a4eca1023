//! Field parsing for intake rows.
//!
//! Amounts must parse or the row fails validation; dates are best-effort
//! and fall back to NULL, because a judgment with an unknown entry date is
//! still collectible while one with an unparseable amount is not.

use std::fmt;

use chrono::NaiveDate;

/// Trim a value to `Some(non-empty)` or `None`.
pub fn clean_text(value: Option<&str>) -> Option<String> {
    let s = value?.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// A monetary value that could not be interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmountParseError {
    pub raw: String,
}

impl fmt::Display for AmountParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "could not parse amount '{}'", self.raw)
    }
}

impl std::error::Error for AmountParseError {}

/// Parse a monetary amount.
///
/// Accepts `$` and thousands separators, and accounting-style parentheses
/// for negatives: `"(1,203.50)"` is `-1203.50`. Empty/missing is `None`;
/// anything else non-numeric is an error.
pub fn parse_amount(value: Option<&str>) -> Result<Option<f64>, AmountParseError> {
    let Some(raw) = value else { return Ok(None) };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let mut s = trimmed.to_string();
    let negated = s.starts_with('(') && s.ends_with(')');
    if negated {
        s = s[1..s.len() - 1].to_string();
    }
    let cleaned: String = s.chars().filter(|c| *c != '$' && *c != ',').collect();
    let cleaned = cleaned.trim();

    match cleaned.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(Some(if negated { -v } else { v })),
        _ => Err(AmountParseError {
            raw: trimmed.to_string(),
        }),
    }
}

/// Date formats tried in order.
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%m/%d/%Y",
    "%m-%d-%Y",
    "%d/%m/%Y",
    "%Y/%m/%d",
    "%m/%d/%y",
];

/// Parse a date, trying the known source formats in order.
///
/// Unparseable values yield `None`, not an error.
pub fn parse_date(value: Option<&str>) -> Option<NaiveDate> {
    let s = value?.trim();
    if s.is_empty() {
        return None;
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }
    tracing::warn!(value = s, "could not parse date");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_text_trims_and_drops_empty() {
        assert_eq!(clean_text(Some("  Acme  ")).as_deref(), Some("Acme"));
        assert_eq!(clean_text(Some("   ")), None);
        assert_eq!(clean_text(Some("")), None);
        assert_eq!(clean_text(None), None);
    }

    #[test]
    fn amount_plain_and_decorated() {
        assert_eq!(parse_amount(Some("1234.5")).unwrap(), Some(1234.5));
        assert_eq!(parse_amount(Some("$1,234.50")).unwrap(), Some(1234.5));
        assert_eq!(parse_amount(Some(" $12,000 ")).unwrap(), Some(12000.0));
        assert_eq!(parse_amount(Some("0")).unwrap(), Some(0.0));
    }

    #[test]
    fn amount_parentheses_negate() {
        assert_eq!(parse_amount(Some("(1,203.50)")).unwrap(), Some(-1203.5));
        assert_eq!(parse_amount(Some("($5)")).unwrap(), Some(-5.0));
    }

    #[test]
    fn amount_missing_is_none() {
        assert_eq!(parse_amount(None).unwrap(), None);
        assert_eq!(parse_amount(Some("")).unwrap(), None);
        assert_eq!(parse_amount(Some("   ")).unwrap(), None);
    }

    #[test]
    fn amount_non_numeric_is_error() {
        for bad in ["abc", "12x", "$", "(oops)", "1.2.3"] {
            let err = parse_amount(Some(bad)).unwrap_err();
            assert!(err.to_string().contains("could not parse amount"), "{bad}");
        }
    }

    #[test]
    fn date_formats_in_order() {
        let expect = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert_eq!(parse_date(Some("2024-03-05")), Some(expect));
        assert_eq!(parse_date(Some("03/05/2024")), Some(expect));
        assert_eq!(parse_date(Some("03-05-2024")), Some(expect));
        assert_eq!(parse_date(Some("2024/03/05")), Some(expect));
        assert_eq!(parse_date(Some("03/05/24")), Some(expect));
    }

    #[test]
    fn date_day_month_order_falls_through() {
        // 25 cannot be a month, so the %d/%m/%Y branch picks it up.
        let expect = NaiveDate::from_ymd_opt(2023, 12, 25).unwrap();
        assert_eq!(parse_date(Some("25/12/2023")), Some(expect));
    }

    #[test]
    fn date_unparseable_is_none() {
        assert_eq!(parse_date(Some("not a date")), None);
        assert_eq!(parse_date(Some("2024-13-40")), None);
        assert_eq!(parse_date(Some("")), None);
        assert_eq!(parse_date(None), None);
    }
}
