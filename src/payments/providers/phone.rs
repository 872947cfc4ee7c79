use regex::Regex;
use std::sync::OnceLock;

fn separators() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\s\-().]").expect("static regex"))
}

/// Reduce a subscriber number to its 9-digit national form
///
/// Accepts `+<dial_code>...`, `<dial_code>...`, `0...` and bare national numbers,
/// with spaces, dashes, dots or brackets in between.
pub fn national_number(phone: &str, dial_code: &str) -> Option<String> {
    let cleaned = separators().replace_all(phone.trim(), "");
    let digits = cleaned.strip_prefix('+').unwrap_or(&cleaned);

    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let national = if let Some(rest) = digits.strip_prefix(dial_code) {
        rest
    } else if let Some(rest) = digits.strip_prefix('0') {
        rest
    } else {
        digits
    };

    if national.len() == 9 && !national.starts_with('0') {
        Some(national.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_national_number_formats() {
        for input in [
            "+254712345678",
            "254712345678",
            "0712345678",
            "712345678",
            "+254 712 345 678",
            "0712-345-678",
        ] {
            assert_eq!(
                national_number(input, "254").as_deref(),
                Some("712345678"),
                "input {}",
                input
            );
        }
    }

    #[test]
    fn test_national_number_rejects_garbage() {
        assert_eq!(national_number("07123", "254"), None);
        assert_eq!(national_number("+2547123456789", "254"), None);
        assert_eq!(national_number("07l2345678", "254"), None);
        assert_eq!(national_number("", "254"), None);
    }

    #[test]
    fn test_national_number_other_country() {
        assert_eq!(
            national_number("+256 752 123456", "256").as_deref(),
            Some("752123456")
        );
    }
}
