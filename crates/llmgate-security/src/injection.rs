use std::sync::LazyLock;

use regex::Regex;

/// Pattern families scored by the prompt-injection heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionCategory {
    InstructionOverride,
    RoleManipulation,
    DelimiterInjection,
    ContextManipulation,
}

struct Pattern {
    id: &'static str,
    category: InjectionCategory,
    weight: f64,
    regex: LazyLock<Regex>,
}

macro_rules! pattern {
    ($id:expr, $category:expr, $weight:expr, $re:expr) => {
        Pattern {
            id: $id,
            category: $category,
            weight: $weight,
            regex: LazyLock::new(|| Regex::new($re).expect("static injection pattern is valid")),
        }
    };
}

// Each pattern fires at most once per scan regardless of how many times it
// matches the text.
static PATTERNS: &[Pattern] = &[
    pattern!(
        "io-ignore-previous",
        InjectionCategory::InstructionOverride,
        0.4,
        r"(?i)ignore\s+(all\s+)?(the\s+)?previous\s+instructions"
    ),
    pattern!(
        "io-disregard-above",
        InjectionCategory::InstructionOverride,
        0.35,
        r"(?i)disregard\s+(the\s+)?(above|previous)"
    ),
    pattern!(
        "io-forget-rules",
        InjectionCategory::InstructionOverride,
        0.4,
        r"(?i)forget\s+(your|all|the)\s+(rules|instructions)"
    ),
    pattern!(
        "io-ignore-system-prompt",
        InjectionCategory::InstructionOverride,
        0.45,
        r"(?i)ignore\s+(the\s+)?system\s+prompt"
    ),
    pattern!(
        "io-pretend-no-restrictions",
        InjectionCategory::InstructionOverride,
        0.3,
        r"(?i)pretend\s+(you\s+have\s+no|there\s+are\s+no)\s+(restrictions|rules)"
    ),
    pattern!(
        "rm-you-are-now",
        InjectionCategory::RoleManipulation,
        0.4,
        r"(?i)you\s+are\s+now\s+"
    ),
    pattern!(
        "rm-jailbreak",
        InjectionCategory::RoleManipulation,
        0.6,
        r"(?i)\bjailbreak\b"
    ),
    pattern!(
        "rm-act-as-unrestricted",
        InjectionCategory::RoleManipulation,
        0.5,
        r"(?i)act\s+as\s+(a|an)\s+.*\s+without\s+(any\s+)?restrictions"
    ),
    pattern!(
        "rm-dan-persona",
        InjectionCategory::RoleManipulation,
        0.7,
        r"(?i)\bDAN\b"
    ),
    pattern!(
        "rm-developer-mode",
        InjectionCategory::RoleManipulation,
        0.45,
        r"(?i)developer\s+mode"
    ),
    pattern!(
        "di-im-start",
        InjectionCategory::DelimiterInjection,
        0.5,
        r"<\|im_start\|>"
    ),
    pattern!(
        "di-system-bracket",
        InjectionCategory::DelimiterInjection,
        0.4,
        r"(?i)\[system\]"
    ),
    pattern!(
        "di-hash-system",
        InjectionCategory::DelimiterInjection,
        0.35,
        r"(?i)###\s*system"
    ),
    pattern!(
        "di-sys-tag",
        InjectionCategory::DelimiterInjection,
        0.45,
        r"(?i)<<\s*sys\s*>>"
    ),
    pattern!(
        "di-inst-tag",
        InjectionCategory::DelimiterInjection,
        0.6,
        r"(?i)\[/?inst\]"
    ),
    pattern!(
        "cm-bypass-restrictions",
        InjectionCategory::ContextManipulation,
        0.55,
        r"(?i)bypass\s+(your|all)\s+restrictions"
    ),
    pattern!(
        "cm-no-ethical-guidelines",
        InjectionCategory::ContextManipulation,
        0.5,
        r"(?i)no\s+ethical\s+guidelines"
    ),
    pattern!(
        "cm-without-moral-constraints",
        InjectionCategory::ContextManipulation,
        0.6,
        r"(?i)without\s+(any\s+)?(ethical|moral)\s+(constraints|guidelines)"
    ),
    pattern!(
        "cm-disable-safety",
        InjectionCategory::ContextManipulation,
        0.55,
        r"(?i)disable\s+(your\s+)?safety\s+(filters|features)"
    ),
    pattern!(
        "cm-unrestricted-ai",
        InjectionCategory::ContextManipulation,
        0.5,
        r"(?i)unrestricted\s+ai\b"
    ),
];

#[derive(Debug, Clone, serde::Serialize)]
pub struct MatchedPattern {
    pub id: &'static str,
    pub category: InjectionCategory,
    pub weight: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct InjectionScanResult {
    /// Cumulative weighted score, capped at 1.0.
    pub score: f64,
    pub matched: Vec<MatchedPattern>,
}

impl InjectionScanResult {
    pub fn categories(&self) -> Vec<InjectionCategory> {
        let mut seen = Vec::new();
        for m in &self.matched {
            if !seen.contains(&m.category) {
                seen.push(m.category);
            }
        }
        seen
    }

    pub fn exceeds(&self, threshold: f64) -> bool {
        self.score >= threshold
    }
}

/// Score `text` against the fixed pattern table, summing each distinct
/// pattern's weight once and capping the total at 1.0.
pub fn scan(text: &str) -> InjectionScanResult {
    let mut score = 0.0f64;
    let mut matched = Vec::new();
    for pattern in PATTERNS {
        if pattern.regex.is_match(text) {
            score += pattern.weight;
            matched.push(MatchedPattern {
                id: pattern.id,
                category: pattern.category,
                weight: pattern.weight,
            });
        }
    }
    InjectionScanResult {
        score: score.min(1.0),
        matched,
    }
}
