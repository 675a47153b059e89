//! Number rendering for substituted values.

use serde::{Deserialize, Serialize};

/// Decimal/grouping convention for human-facing lookup results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumberLocale {
    /// `1 234,5` with a no-break space between groups.
    #[default]
    Fi,
    /// `1,234.5`
    En,
}

impl NumberLocale {
    pub fn from_tag(tag: &str) -> Option<NumberLocale> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "fi" | "fi-fi" | "sv-fi" => Some(NumberLocale::Fi),
            "en" | "en-us" | "en-gb" => Some(NumberLocale::En),
            _ => None,
        }
    }

    fn separators(self) -> (char, char) {
        match self {
            NumberLocale::Fi => (',', '\u{a0}'),
            NumberLocale::En => ('.', ','),
        }
    }
}

/// Machine form used for substitution into formula text and plain results.
///
/// Integers print without a fraction; everything else keeps up to ten
/// decimals with trailing zeros trimmed.
pub fn format_general(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        return format!("{}", n as i64);
    }
    let s = format!("{:.10}", n);
    let trimmed = s.trim_end_matches('0').trim_end_matches('.');
    if trimmed == "-0" {
        return "0".to_string();
    }
    trimmed.to_string()
}

/// Human form: at most two decimals, grouped thousands, optional unit suffix.
pub fn format_localized(n: f64, locale: NumberLocale, unit: Option<&str>) -> String {
    let (decimal_sep, group_sep) = locale.separators();
    let rounded = (n * 100.0).round() / 100.0;
    let negative = rounded < 0.0;

    let fixed = format!("{:.2}", rounded.abs());
    let (int_part, frac_part) = fixed.split_once('.').unwrap_or((fixed.as_str(), ""));
    let frac_part = frac_part.trim_end_matches('0');

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    let digits = int_part.len();
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (digits - i) % 3 == 0 {
            out.push(group_sep);
        }
        out.push(c);
    }
    if !frac_part.is_empty() {
        out.push(decimal_sep);
        out.push_str(frac_part);
    }

    if let Some(unit) = unit.map(str::trim).filter(|u| !u.is_empty()) {
        out.push(' ');
        out.push_str(unit);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_general() {
        assert_eq!(format_general(7.0), "7");
        assert_eq!(format_general(-12.0), "-12");
        assert_eq!(format_general(2.5), "2.5");
        assert_eq!(format_general(0.1 + 0.2), "0.3");
        assert_eq!(format_general(1.0 / 3.0), "0.3333333333");
    }

    #[test]
    fn test_localized_fi() {
        assert_eq!(format_localized(1234.5, NumberLocale::Fi, Some("kWh")), "1\u{a0}234,5 kWh");
        assert_eq!(format_localized(1234567.891, NumberLocale::Fi, None), "1\u{a0}234\u{a0}567,89");
        assert_eq!(format_localized(12.0, NumberLocale::Fi, Some("")), "12");
    }

    #[test]
    fn test_localized_en() {
        assert_eq!(format_localized(-9876.5, NumberLocale::En, Some("€")), "-9,876.5 €");
        assert_eq!(format_localized(999.999, NumberLocale::En, None), "1,000");
    }

    #[test]
    fn test_locale_tags() {
        assert_eq!(NumberLocale::from_tag("FI-fi"), Some(NumberLocale::Fi));
        assert_eq!(NumberLocale::from_tag("en"), Some(NumberLocale::En));
        assert_eq!(NumberLocale::from_tag("de"), None);
    }
}
