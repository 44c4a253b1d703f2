use once_cell::sync::Lazy;
use regex::Regex;

static EMAIL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("valid email pattern")
});

static USERNAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9._-]{3,50}$").expect("valid username pattern"));

pub fn is_email(value: &str) -> bool {
    EMAIL_PATTERN.is_match(value)
}

/// Accepts an email address or a 3-50 character username.
pub fn validate_identity(value: &str) -> bool {
    if value.chars().count() < 3 {
        return false;
    }
    is_email(value) || USERNAME_PATTERN.is_match(value)
}

/// Trims surrounding whitespace and drops control characters other than tab and newlines.
pub fn sanitize_input(value: &str) -> String {
    value
        .trim()
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identities_accept_emails_and_usernames() {
        assert!(validate_identity("a@b.com"));
        assert!(validate_identity("movie_fan-01"));
        assert!(!validate_identity("ab"));
        assert!(!validate_identity("has spaces"));
        assert!(!validate_identity(&"x".repeat(51)));
    }

    #[test]
    fn sanitize_strips_control_characters() {
        assert_eq!(sanitize_input("  alice\u{0007}  "), "alice");
        assert_eq!(sanitize_input("a\tb"), "a\tb");
        assert_eq!(sanitize_input(""), "");
    }

    #[test]
    fn email_detection() {
        assert!(is_email("someone@example.org"));
        assert!(!is_email("someone"));
    }
}
