//! Recipient normalization: canonical phone numbers from messy input.
//!
//! Only formatting is cleaned up: separators and invisible bidi marks are
//! removed, `00` becomes `+`, and an optional country prefix is applied to
//! local numbers. No numbering-plan validation happens here.

/// Characters removed anywhere in the value.
const STRIPPED: [char; 7] = [' ', '-', '(', ')', '.', '\u{200e}', '\u{200f}'];

/// Normalize a raw recipient field.
///
/// Pure and idempotent: normalizing an already-normalized value with the
/// same `prefix` and `force_plus` returns it unchanged. Empty input stays
/// empty and is never prefixed.
pub fn normalize(raw: Option<&str>, prefix: Option<&str>, force_plus: bool) -> String {
    let Some(raw) = raw else {
        return String::new();
    };

    let mut s = clean(raw);
    if s.is_empty() {
        return s;
    }

    if !s.starts_with('+')
        && let Some(prefix) = prefix.map(clean).filter(|p| !p.is_empty())
    {
        let prefix_digits = prefix.trim_start_matches('+');
        if !s.starts_with(prefix_digits) {
            s = format!("{prefix}{}", s.trim_start_matches('0'));
        }
    }

    if force_plus && !s.starts_with('+') {
        s.insert(0, '+');
    }

    s
}

/// Strip separators, trim, and turn an international `00` into `+`.
fn clean(raw: &str) -> String {
    let stripped: String = raw.chars().filter(|c| !STRIPPED.contains(c)).collect();
    let trimmed = stripped.trim();
    match trimmed.strip_prefix("00") {
        Some(rest) => format!("+{rest}"),
        None => trimmed.to_string(),
    }
}
