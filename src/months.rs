//! Month label normalization and ordering
//! ---------------------------------------
//! The warehouse stores month partitions as free-form strings in two
//! encodings. Instar rows carry a full Spanish month name plus year
//! (`"Marzo/2024"`), used verbatim as the display label. Admedia rows carry
//! a compact sortable form (`"2024 03 Mar"`), displayed as `"Mar/2024"`.
//! Every partition-scoped operation (list, delete, append filter, export
//! filter) funnels user-supplied labels and already-stored values through
//! this module so filter parameters and listings agree on one spelling.
//!
//! All functions here are total: values that do not parse degrade to
//! [`MonthKey::UNKNOWN`] (which sorts last) or pass through trimmed, so one
//! malformed month can never abort a batch operation.

use std::collections::HashSet;

/// Full Spanish month names, canonical capitalization, January first.
pub const MONTHS_FULL: [&str; 12] = [
    "Enero",
    "Febrero",
    "Marzo",
    "Abril",
    "Mayo",
    "Junio",
    "Julio",
    "Agosto",
    "Septiembre",
    "Octubre",
    "Noviembre",
    "Diciembre",
];

/// Three-letter Spanish month abbreviations, canonical capitalization.
pub const MONTHS_ABBR: [&str; 12] = [
    "Ene", "Feb", "Mar", "Abr", "May", "Jun", "Jul", "Ago", "Sep", "Oct", "Nov", "Dic",
];

/// Chronological sort key for a month partition: year, then month number.
///
/// Derived `Ord` compares `year` first, so a plain `sort_by_key` yields
/// calendar order with [`MonthKey::UNKNOWN`] at the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonthKey {
    pub year: i32,
    pub month: u32,
}

impl MonthKey {
    /// Sentinel for values that do not parse; sorts after every real month.
    pub const UNKNOWN: MonthKey = MonthKey { year: 9999, month: 99 };

    pub fn is_unknown(self) -> bool {
        self == MonthKey::UNKNOWN
    }
}

fn month_from_full_name(name: &str) -> Option<u32> {
    MONTHS_FULL.iter().position(|m| *m == name).map(|i| (i + 1) as u32)
}

fn month_from_abbr(abbr: &str) -> Option<u32> {
    MONTHS_ABBR.iter().position(|m| *m == abbr).map(|i| (i + 1) as u32)
}

fn abbr_for_month(num: i64) -> Option<&'static str> {
    if (1..=12).contains(&num) {
        Some(MONTHS_ABBR[(num - 1) as usize])
    } else {
        None
    }
}

/// First character uppercased, remainder lowercased ("mARZO" -> "Marzo").
fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(|c| c.to_lowercase()))
            .collect(),
        None => String::new(),
    }
}

/// Drop repeated values, keeping the first occurrence of each. Equality is
/// exact string equality; order of first appearance is preserved.
pub fn dedupe_preserve_order<I>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen: HashSet<String> = HashSet::new();
    let mut ordered = Vec::new();
    for value in values {
        if seen.insert(value.clone()) {
            ordered.push(value);
        }
    }
    ordered
}

/// Parse an instar label `"<FullMonthName>/<Year>"` into its sort key.
///
/// The month name is matched case-insensitively against [`MONTHS_FULL`] and
/// both sides of the `/` are trimmed. Any other input yields
/// [`MonthKey::UNKNOWN`].
pub fn parse_instar_label(label: &str) -> MonthKey {
    let parts: Vec<&str> = label.split('/').collect();
    if parts.len() != 2 {
        return MonthKey::UNKNOWN;
    }
    let Some(month) = month_from_full_name(&capitalize(parts[0].trim())) else {
        return MonthKey::UNKNOWN;
    };
    match parts[1].trim().parse::<i32>() {
        Ok(year) => MonthKey { year, month },
        Err(_) => MonthKey::UNKNOWN,
    }
}

/// Dedupe (first seen wins), then stable-sort chronologically. Labels that
/// do not parse keep their relative order at the end of the list.
pub fn sort_instar_months<I, S>(months: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = dedupe_preserve_order(months.into_iter().map(|m| m.as_ref().to_string()));
    out.sort_by_key(|m| parse_instar_label(m));
    out
}

/// Canonicalize a raw admedia stored value into `"<year> <month:02> <abbr>"`.
///
/// Accepts dash or whitespace separators and an optional abbreviation
/// segment: `"2024-3"`, `"2024 3"`, and `"2024 03 Mar"` all canonicalize to
/// `"2024 03 Mar"`. The year token is kept verbatim (it is not re-validated
/// here); a missing or unparseable month number becomes 0; a missing
/// abbreviation is looked up from the month number, falling back to the
/// zero-padded number itself. Input with no tokens at all passes through
/// trimmed.
pub fn format_admedia_stored(value: &str) -> String {
    let trimmed = value.trim();
    let spaced = trimmed.replace('-', " ");
    let parts: Vec<&str> = spaced.split_whitespace().collect();
    let Some(year) = parts.first() else {
        return trimmed.to_string();
    };
    let month_num: i64 = parts.get(1).and_then(|p| p.parse().ok()).unwrap_or(0);
    let abbr = match parts.get(2) {
        Some(p) => (*p).to_string(),
        None => match abbr_for_month(month_num) {
            Some(a) => a.to_string(),
            None => format!("{:02}", month_num),
        },
    };
    format!("{} {:02} {}", year, month_num, abbr)
}

/// Sort key for an admedia stored value: canonicalize, then read year and
/// month back out of the canonical form. [`MonthKey::UNKNOWN`] when either
/// token is not an integer.
pub fn parse_admedia_stored(value: &str) -> MonthKey {
    let formatted = format_admedia_stored(value);
    let mut parts = formatted.split_whitespace();
    let (Some(year_tok), Some(month_tok)) = (parts.next(), parts.next()) else {
        return MonthKey::UNKNOWN;
    };
    match (year_tok.parse::<i32>(), month_tok.parse::<u32>()) {
        (Ok(year), Ok(month)) => MonthKey { year, month },
        _ => MonthKey::UNKNOWN,
    }
}

/// Canonicalize every value, dedupe the canonical forms (first seen wins),
/// then stable-sort chronologically.
pub fn sort_admedia_months<I, S>(months: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let formatted = months.into_iter().map(|m| format_admedia_stored(m.as_ref()));
    let mut out = dedupe_preserve_order(formatted);
    out.sort_by_key(|m| parse_admedia_stored(m));
    out
}

/// Convert a display label `"<Abbr>/<Year>"` into the stored form.
///
/// The abbreviation is matched case-insensitively against [`MONTHS_ABBR`].
/// Input without exactly one `/`, or with an unknown abbreviation, is
/// handed to [`format_admedia_stored`] instead, so already-stored values
/// survive a round through this function.
pub fn admedia_label_to_stored(label: &str) -> String {
    let raw = label.trim();
    if !raw.contains('/') {
        return format_admedia_stored(raw);
    }
    let parts: Vec<&str> = raw.split('/').collect();
    if parts.len() != 2 {
        return format_admedia_stored(raw);
    }
    let abbr = capitalize(parts[0].trim());
    match month_from_abbr(&abbr) {
        Some(month) => format!("{} {:02} {}", parts[1].trim(), month, abbr),
        None => format_admedia_stored(raw),
    }
}

/// Convert a stored value into its display label `"<Abbr>/<Year>"`.
///
/// Unlike the sort-key functions this falls back to the trimmed original
/// input when the canonical form cannot be read back, so unparseable values
/// display literally instead of collapsing into a sentinel.
pub fn admedia_stored_to_label(value: &str) -> String {
    let formatted = format_admedia_stored(value);
    let parts: Vec<&str> = formatted.split_whitespace().collect();
    let (Some(year), Some(month_tok)) = (parts.first(), parts.get(1)) else {
        return value.trim().to_string();
    };
    let Ok(month_num) = month_tok.parse::<i64>() else {
        return value.trim().to_string();
    };
    let abbr = match parts.get(2) {
        Some(p) => (*p).to_string(),
        None => abbr_for_month(month_num)
            .map(|a| a.to_string())
            .unwrap_or_else(|| (*month_tok).to_string()),
    };
    format!("{}/{}", abbr, year)
}

/// Normalize a user-supplied admedia month set into stored form: trim, skip
/// empties, convert labels (anything containing `/`) via
/// [`admedia_label_to_stored`], canonicalize bare stored values, then dedupe
/// the final forms preserving first-seen order. Labels and stored spellings
/// of the same month collapse to one entry.
pub fn normalize_admedia_months<I, S>(months: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut normalized = Vec::new();
    for value in months {
        let raw = value.as_ref().trim();
        if raw.is_empty() {
            continue;
        }
        if raw.contains('/') {
            normalized.push(admedia_label_to_stored(raw));
        } else {
            normalized.push(format_admedia_stored(raw));
        }
    }
    dedupe_preserve_order(normalized)
}

/// Normalize an instar month set: trim, skip empties, dedupe preserving
/// first-seen order. Instar stored and display forms are identical, so no
/// reformatting happens.
pub fn normalize_instar_months<I, S>(months: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut normalized = Vec::new();
    for value in months {
        let raw = value.as_ref().trim();
        if !raw.is_empty() {
            normalized.push(raw.to_string());
        }
    }
    dedupe_preserve_order(normalized)
}
