use regex::RegexSet;
use serde::Serialize;
use serde_json::Value;

/// Family a suspicious pattern belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionFamily {
    /// "ignore previous instructions" and friends.
    InstructionOverride,
    /// Attempts to assign the system a new persona.
    RolePlay,
    /// Chat-template control tokens.
    EscapeToken,
    /// Requests to reveal prompts or rules.
    Exfiltration,
    /// Known jailbreak phrases.
    Jailbreak,
    /// Script or query fragments.
    CodeInjection,
    /// Operator-supplied pattern.
    Custom,
}

/// A single match found in a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InspectionFinding {
    /// JSON path of the offending string (`$` for plain text).
    pub path: String,
    /// Family of the matched pattern.
    pub family: InjectionFamily,
}

const PATTERNS: &[(InjectionFamily, &str)] = &[
    (
        InjectionFamily::InstructionOverride,
        r"ignore\s+(?:all\s+|the\s+)?(?:previous|above|prior|all|your)\s+(?:instructions?|prompts?|rules?|commands?)",
    ),
    (
        InjectionFamily::InstructionOverride,
        r"disregard\s+(?:all\s+|the\s+)?(?:previous|above|prior|all|your)\s+(?:instructions?|prompts?|rules?)",
    ),
    (
        InjectionFamily::InstructionOverride,
        r"forget\s+(?:everything|all\s+previous|your\s+instructions?)",
    ),
    (InjectionFamily::InstructionOverride, r"new\s+instructions?\s*:"),
    (InjectionFamily::InstructionOverride, r"(?m)^\s*system\s*:"),
    (InjectionFamily::InstructionOverride, r"\b(?:admin|developer|debug)\s+mode\b"),
    (InjectionFamily::RolePlay, r"\byou\s+are\s+now\b"),
    (InjectionFamily::RolePlay, r"\bact\s+as\s+(?:a|an|the)\s+\w+"),
    (InjectionFamily::RolePlay, r"\bpretend\s+(?:to\s+be|you\s+are)\b"),
    (InjectionFamily::RolePlay, r"\brole-?play\s+as\b"),
    (InjectionFamily::EscapeToken, r"<\s*\|[^|]*\|\s*>"),
    (InjectionFamily::EscapeToken, r"\[/?inst\]"),
    (InjectionFamily::EscapeToken, r"```[\s\S]*?system[\s\S]*?```"),
    (
        InjectionFamily::Exfiltration,
        r"\b(?:show|tell)\s+me\s+(?:your|the)\s+(?:prompt|instructions?|system)",
    ),
    (
        InjectionFamily::Exfiltration,
        r"\bwhat\s+(?:are|is)\s+your\s+(?:instructions?|prompt|rules?)",
    ),
    (
        InjectionFamily::Exfiltration,
        r"\brepeat\s+(?:your|the)\s+(?:instructions?|prompt)",
    ),
    (InjectionFamily::Jailbreak, r"\bdan\s+mode\b"),
    (InjectionFamily::Jailbreak, r"\bjailbreak"),
    (InjectionFamily::Jailbreak, r"\bunrestricted\s+(?:mode|access|ai)\b"),
];

const CODE_KEYWORDS: &[&str] = &[
    "<script",
    "javascript:",
    "__import__",
    "exec(",
    "eval(",
    "drop table",
    "union select",
];

/// Case-insensitive injection scanner over free text and JSON payloads.
#[derive(Debug, Clone)]
pub struct InjectionScanner {
    set: RegexSet,
    families: Vec<InjectionFamily>,
}

impl InjectionScanner {
    /// Built-in pattern families plus operator-supplied extras.
    pub fn new(extra_patterns: &[String]) -> Result<Self, regex::Error> {
        let mut families = Vec::with_capacity(PATTERNS.len() + extra_patterns.len());
        let mut sources = Vec::with_capacity(families.capacity());
        for (family, pattern) in PATTERNS {
            families.push(*family);
            sources.push(format!("(?i){pattern}"));
        }
        for pattern in extra_patterns {
            families.push(InjectionFamily::Custom);
            sources.push(format!("(?i){pattern}"));
        }
        Ok(Self {
            set: RegexSet::new(sources)?,
            families,
        })
    }

    /// Built-in patterns only.
    pub fn standard() -> Result<Self, regex::Error> {
        Self::new(&[])
    }

    /// Families matched by `text`, deduplicated in detection order.
    #[must_use]
    pub fn scan_text(&self, text: &str) -> Vec<InjectionFamily> {
        let mut found: Vec<InjectionFamily> = Vec::new();
        for index in self.set.matches(text).iter() {
            let family = self.families[index];
            if !found.contains(&family) {
                found.push(family);
            }
        }
        let lowered = text.to_ascii_lowercase();
        if CODE_KEYWORDS.iter().any(|kw| lowered.contains(kw))
            && !found.contains(&InjectionFamily::CodeInjection)
        {
            found.push(InjectionFamily::CodeInjection);
        }
        found
    }

    /// Scans every string (keys included) reachable from `value`.
    #[must_use]
    pub fn scan_value(&self, value: &Value) -> Vec<InspectionFinding> {
        let mut findings = Vec::new();
        self.walk(value, "$".to_string(), &mut findings);
        findings
    }

    fn walk(&self, value: &Value, path: String, findings: &mut Vec<InspectionFinding>) {
        match value {
            Value::String(text) => findings.extend(
                self.scan_text(text)
                    .into_iter()
                    .map(|family| InspectionFinding {
                        path: path.clone(),
                        family,
                    }),
            ),
            Value::Array(items) => {
                for (index, item) in items.iter().enumerate() {
                    self.walk(item, format!("{path}[{index}]"), findings);
                }
            }
            Value::Object(map) => {
                for (key, item) in map {
                    let child = format!("{path}.{key}");
                    findings.extend(self.scan_text(key).into_iter().map(|family| {
                        InspectionFinding {
                            path: child.clone(),
                            family,
                        }
                    }));
                    self.walk(item, child, findings);
                }
            }
            Value::Null | Value::Bool(_) | Value::Number(_) => {}
        }
    }
}
