use std::sync::LazyLock;

use regex::Regex;

use llmgate_common::PiiAction;

/// PII categories detected by the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiKind {
    Ssn,
    CreditCard,
    Email,
    Phone,
    Ipv4,
}

impl PiiKind {
    fn placeholder(self) -> &'static str {
        match self {
            PiiKind::Ssn => "[REDACTED_SSN]",
            PiiKind::CreditCard => "[REDACTED_CC]",
            PiiKind::Email => "[REDACTED_EMAIL]",
            PiiKind::Phone => "[REDACTED_PHONE]",
            PiiKind::Ipv4 => "[REDACTED_IP]",
        }
    }
}

static SSN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap());
static CREDIT_CARD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:\d[ -]?){13,19}\b").unwrap());
static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap()
});
static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{3}[-.\s]\d{3}[-.\s]\d{4}\b").unwrap());
static IPV4_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:(?:25[0-5]|2[0-4]\d|1?\d?\d)\.){3}(?:25[0-5]|2[0-4]\d|1?\d?\d)\b").unwrap()
});

/// Luhn checksum used to keep the credit-card pattern from flagging every
/// run of 13-19 digits.
fn luhn_valid(raw: &str) -> bool {
    let digits: Vec<u32> = raw.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 13 || digits.len() > 19 {
        return false;
    }
    let mut sum = 0u32;
    for (i, &d) in digits.iter().rev().enumerate() {
        if i % 2 == 1 {
            let doubled = d * 2;
            sum += if doubled > 9 { doubled - 9 } else { doubled };
        } else {
            sum += d;
        }
    }
    sum % 10 == 0
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PiiFinding {
    pub kind: PiiKind,
    /// Number of matches of this kind. Never carries the matched text
    /// itself — findings must be safe to log.
    pub count: u32,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PiiScanOutcome {
    pub findings: Vec<PiiFinding>,
    /// `text` with accepted matches replaced by placeholders under
    /// [`PiiAction::Redact`]; identical to the input under the other modes.
    pub redacted_text: String,
    pub blocked: bool,
}

impl PiiScanOutcome {
    pub fn has_findings(&self) -> bool {
        !self.findings.is_empty()
    }
}

/// Scan `text` for one PII kind, counting accepted matches and, under
/// `Redact`, replacing them with `placeholder`. Runs in a single left-to-right
/// pass so later stages in [`scan`] never re-examine an inserted placeholder.
fn stage(
    text: &str,
    re: &Regex,
    placeholder: &str,
    mode: PiiAction,
    mut accept: impl FnMut(&str) -> bool,
) -> (String, u32) {
    if !matches!(mode, PiiAction::Redact) {
        let count = re.find_iter(text).filter(|m| accept(m.as_str())).count() as u32;
        return (text.to_string(), count);
    }

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut count = 0u32;
    for m in re.find_iter(text) {
        if accept(m.as_str()) {
            out.push_str(&text[last..m.start()]);
            out.push_str(placeholder);
            last = m.end();
            count += 1;
        }
    }
    out.push_str(&text[last..]);
    (out, count)
}

/// Detect (and, in `Redact` mode, replace) PII in a fixed order: SSN, credit
/// card, email, phone, IPv4.
pub fn scan(text: &str, mode: PiiAction) -> PiiScanOutcome {
    let mut findings = Vec::new();
    let mut current = text.to_string();

    let (next, count) = stage(&current, &SSN_RE, PiiKind::Ssn.placeholder(), mode, |_| true);
    if count > 0 {
        findings.push(PiiFinding { kind: PiiKind::Ssn, count });
    }
    current = next;

    let (next, count) = stage(&current, &CREDIT_CARD_RE, PiiKind::CreditCard.placeholder(), mode, |m| {
        luhn_valid(m)
    });
    if count > 0 {
        findings.push(PiiFinding { kind: PiiKind::CreditCard, count });
    }
    current = next;

    let (next, count) = stage(&current, &EMAIL_RE, PiiKind::Email.placeholder(), mode, |_| true);
    if count > 0 {
        findings.push(PiiFinding { kind: PiiKind::Email, count });
    }
    current = next;

    let (next, count) = stage(&current, &PHONE_RE, PiiKind::Phone.placeholder(), mode, |_| true);
    if count > 0 {
        findings.push(PiiFinding { kind: PiiKind::Phone, count });
    }
    current = next;

    let (next, count) = stage(&current, &IPV4_RE, PiiKind::Ipv4.placeholder(), mode, |_| true);
    if count > 0 {
        findings.push(PiiFinding { kind: PiiKind::Ipv4, count });
    }
    current = next;

    let blocked = matches!(mode, PiiAction::Block) && !findings.is_empty();
    PiiScanOutcome {
        findings,
        redacted_text: current,
        blocked,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_ssn() {
        let outcome = scan("my ssn is 123-45-6789 ok", PiiAction::Redact);
        assert_eq!(outcome.redacted_text, "my ssn is [REDACTED_SSN] ok");
        assert_eq!(outcome.findings.len(), 1);
        assert_eq!(outcome.findings[0].kind, PiiKind::Ssn);
    }

    #[test]
    fn redacts_valid_credit_card_but_not_luhn_failure() {
        let outcome = scan("card 4111 1111 1111 1111 here", PiiAction::Redact);
        assert!(outcome.redacted_text.contains("[REDACTED_CC]"));

        let outcome = scan("card 1234 5678 9012 3456 here", PiiAction::Redact);
        assert!(!outcome.redacted_text.contains("[REDACTED_CC]"));
    }

    #[test]
    fn redacts_email_and_phone_and_ip() {
        let outcome = scan(
            "reach me at jane.doe@example.com or 555-123-4567, server is 10.0.0.1",
            PiiAction::Redact,
        );
        assert!(outcome.redacted_text.contains("[REDACTED_EMAIL]"));
        assert!(outcome.redacted_text.contains("[REDACTED_PHONE]"));
        assert!(outcome.redacted_text.contains("[REDACTED_IP]"));
        assert_eq!(outcome.findings.len(), 3);
    }

    #[test]
    fn block_mode_leaves_text_untouched_but_flags_blocked() {
        let outcome = scan("ssn 123-45-6789", PiiAction::Block);
        assert_eq!(outcome.redacted_text, "ssn 123-45-6789");
        assert!(outcome.blocked);
        assert!(outcome.has_findings());
    }

    #[test]
    fn log_only_mode_leaves_text_untouched_and_does_not_block() {
        let outcome = scan("ssn 123-45-6789", PiiAction::LogOnly);
        assert_eq!(outcome.redacted_text, "ssn 123-45-6789");
        assert!(!outcome.blocked);
        assert!(outcome.has_findings());
    }

    #[test]
    fn clean_text_has_no_findings() {
        let outcome = scan("the quarterly revenue grew by twelve percent", PiiAction::Redact);
        assert!(!outcome.has_findings());
        assert_eq!(outcome.redacted_text, "the quarterly revenue grew by twelve percent");
    }

    #[test]
    fn redaction_is_idempotent() {
        let once = scan("ssn 123-45-6789 email a@b.com", PiiAction::Redact);
        let twice = scan(&once.redacted_text, PiiAction::Redact);
        assert!(!twice.has_findings());
        assert_eq!(twice.redacted_text, once.redacted_text);
    }
}
