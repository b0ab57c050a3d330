//! Field-level parse helpers shared by the source adapters. County sources
//! disagree on date and money formats, so everything here is tolerant and
//! returns `None` instead of erroring.

use chrono::NaiveDate;

const DATE_FORMATS: &[&str] = &["%m/%d/%Y", "%Y-%m-%d", "%B %d, %Y", "%b %d, %Y", "%m-%d-%Y"];

/// Parse a date in any of the formats seen on county pages.
pub fn parse_date_multi(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
}

/// Parse a dollar amount like `$12,345.67`, `12345` or `Minimum bid: $500`.
pub fn parse_currency(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

/// Split a one-line address like `123 Main St, Dallas, TX 75201` into
/// (street, city, zip). Sources that provide separate fields skip this.
pub fn split_address(raw: &str) -> (String, Option<String>, Option<String>) {
    let zip = extract_zip(raw);
    let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
    match parts.as_slice() {
        [] | [_] => (raw.trim().to_string(), None, zip),
        [street, rest @ ..] => {
            // The city is the first comma part that is not a state/zip tail.
            let city = rest
                .iter()
                .find(|p| !looks_like_state_zip(p))
                .map(|p| p.to_string());
            (street.trim().to_string(), city, zip)
        }
    }
}

pub fn extract_zip(raw: &str) -> Option<String> {
    let mut digits = String::new();
    let mut best = None;
    for ch in raw.chars().chain(std::iter::once(' ')) {
        if ch.is_ascii_digit() {
            digits.push(ch);
        } else {
            if digits.len() == 5 {
                best = Some(digits.clone());
            }
            digits.clear();
        }
    }
    best
}

fn looks_like_state_zip(part: &str) -> bool {
    let token = part.split_whitespace().next().unwrap_or("");
    token.len() == 2 && token.chars().all(|c| c.is_ascii_uppercase())
}

/// Empty and whitespace-only strings collapse to `None`.
pub fn text_or_none(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dates_parse_in_all_county_formats() {
        let expected = NaiveDate::from_ymd_opt(2025, 9, 2).unwrap();
        for raw in [
            "09/02/2025",
            "2025-09-02",
            "September 2, 2025",
            "Sep 2, 2025",
            "09-02-2025",
            "  09/02/2025  ",
        ] {
            assert_eq!(parse_date_multi(raw), Some(expected), "failed on {raw}");
        }
        assert_eq!(parse_date_multi("first Tuesday"), None);
    }

    #[test]
    fn currency_strips_symbols_and_labels() {
        assert_eq!(parse_currency("$12,345.67"), Some(12345.67));
        assert_eq!(parse_currency("Minimum bid: $500"), Some(500.0));
        assert_eq!(parse_currency("1000"), Some(1000.0));
        assert_eq!(parse_currency("TBD"), None);
        assert_eq!(parse_currency(""), None);
    }

    #[test]
    fn addresses_split_into_street_city_zip() {
        let (street, city, zip) = split_address("123 Main St, Dallas, TX 75201");
        assert_eq!(street, "123 Main St");
        assert_eq!(city.as_deref(), Some("Dallas"));
        assert_eq!(zip.as_deref(), Some("75201"));

        let (street, city, zip) = split_address("456 Oak Ave");
        assert_eq!(street, "456 Oak Ave");
        assert_eq!(city, None);
        assert_eq!(zip, None);
    }

    #[test]
    fn zip_ignores_shorter_digit_runs() {
        assert_eq!(extract_zip("Suite 1200, TX 75069"), Some("75069".into()));
        assert_eq!(extract_zip("Suite 1200"), None);
    }
}
