//! Kubernetes quantity validation.
//!
//! `Quantity` on the wire is an opaque string; the API server rejects
//! malformed values long after the operator has committed to a shape.
//! Storage sizes from the Specification are validated here instead, so a
//! bad value fails the pass as user error rather than store error.

/// Binary (power-of-two) and decimal SI suffixes accepted by the API
/// server, plus scientific notation.
const BINARY_SUFFIXES: &[&str] = &["Ki", "Mi", "Gi", "Ti", "Pi", "Ei"];
const DECIMAL_SUFFIXES: &[&str] = &["n", "u", "m", "k", "M", "G", "T", "P", "E"];

/// Check that `s` is a well-formed quantity such as "10Gi", "500m" or
/// "1.5G". Returns the reason on failure.
pub fn validate(s: &str) -> Result<(), String> {
    if s.is_empty() {
        return Err("empty quantity".to_string());
    }
    let (number, suffix) = split_number(s);
    if number.is_empty() {
        return Err(format!("{s:?} has no numeric part"));
    }
    let mut dots = 0;
    for c in number.chars() {
        match c {
            '0'..='9' => {}
            '.' => dots += 1,
            _ => return Err(format!("{s:?} has invalid character {c:?} in numeric part")),
        }
    }
    if dots > 1 || number == "." {
        return Err(format!("{s:?} has a malformed numeric part"));
    }
    if suffix.is_empty()
        || BINARY_SUFFIXES.contains(&suffix)
        || DECIMAL_SUFFIXES.contains(&suffix)
        || is_exponent(suffix)
    {
        Ok(())
    } else {
        Err(format!("{s:?} has unknown suffix {suffix:?}"))
    }
}

fn split_number(s: &str) -> (&str, &str) {
    let end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    (&s[..end], &s[end..])
}

fn is_exponent(suffix: &str) -> bool {
    let mut chars = suffix.chars();
    match chars.next() {
        Some('e') | Some('E') => {}
        _ => return false,
    }
    let rest = chars.as_str();
    !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_common_forms() {
        for q in ["10Gi", "1Ti", "500m", "128Ki", "2", "1.5G", "3e2", "100M"] {
            assert!(validate(q).is_ok(), "{q} should be valid");
        }
    }

    #[test]
    fn rejects_malformed_forms() {
        for q in ["", "Gi", "10Gb", "1..5", "ten", "10 Gi", "1.5e", "."] {
            assert!(validate(q).is_err(), "{q} should be invalid");
        }
    }
}
