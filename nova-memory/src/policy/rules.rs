//! Constitutional rule set.
//!
//! Eight categories of case-insensitive patterns. Each category knows how
//! many matches make it a violation, whether a violation blocks writes, and
//! which principles it penalises.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{MemoryError, MemoryResult};

/// Version tag recorded alongside every evaluation
pub const RULESET_VERSION: &str = "2024.1";

/// Default constitutional principles, in policy order
pub const PRINCIPLES: [&str; 8] = [
    "truth",
    "wisdom",
    "alignment",
    "transparency",
    "accountability",
    "fairness",
    "respect",
    "beneficence",
];

struct CategoryDef {
    name: &'static str,
    patterns: &'static [&'static str],
    threshold: usize,
    blocking: bool,
    penalty: f32,
    penalizes: &'static [&'static str],
}

const BLOCKING_PENALTY: f32 = 0.6;
const WARNING_PENALTY: f32 = 0.2;

const CATEGORIES: &[CategoryDef] = &[
    CategoryDef {
        name: "violence",
        patterns: &[
            r"\b(kill|murder|harm|attack|hurt)\s+(people|someone|users|them|him|her)\b",
            r"\b(build|make)\s+(a\s+)?(bomb|weapon)s?\b",
        ],
        threshold: 1,
        blocking: true,
        penalty: BLOCKING_PENALTY,
        penalizes: &["beneficence", "respect", "alignment"],
    },
    CategoryDef {
        name: "cybercrime",
        patterns: &[
            r"\b(steal|hack|break\s+into)\b.*\b(data|information|accounts?|passwords?)\b",
            r"\b(create|make|build|write)\s+(a\s+)?(virus|malware|exploit|ransomware)\b",
        ],
        threshold: 1,
        blocking: true,
        penalty: BLOCKING_PENALTY,
        penalizes: &["beneficence", "accountability", "alignment"],
    },
    CategoryDef {
        name: "illegal_activity",
        patterns: &[
            r"\b(illegal|unlawful)\s+(activity|activities|action|actions)\b",
            r"\blaunder(ing)?\s+money\b",
        ],
        threshold: 1,
        blocking: true,
        penalty: BLOCKING_PENALTY,
        penalizes: &["accountability", "alignment", "wisdom"],
    },
    CategoryDef {
        name: "privacy_violation",
        patterns: &[
            r"\bdoxx?(ing)?\b",
            r"\b(leak|expose|publish)\s+(their|his|her|someone'?s|users'?)\s+(address|phone|personal|private)\b",
            r"\b(track|spy\s+on|stalk)\s+(someone|people|users|him|her)\b",
        ],
        threshold: 1,
        blocking: true,
        penalty: BLOCKING_PENALTY,
        penalizes: &["respect", "accountability"],
    },
    CategoryDef {
        name: "deception",
        patterns: &[
            r"\b(lie|deceive|manipulate|mislead)\s+(to\s+)?(users?|people|customers?)\b",
            r"\b(fake|fabricate)\s+(evidence|reviews?|data)\b",
        ],
        threshold: 2,
        blocking: false,
        penalty: WARNING_PENALTY,
        penalizes: &["truth", "transparency"],
    },
    CategoryDef {
        name: "discrimination",
        patterns: &[
            r"\b(discriminate|bias)\s+against\b",
            r"\b(exclude|reject)\s+\w+\s+because\s+of\s+(their\s+)?(race|gender|religion|age)\b",
        ],
        threshold: 2,
        blocking: false,
        penalty: WARNING_PENALTY,
        penalizes: &["fairness", "respect"],
    },
    CategoryDef {
        name: "exploitation",
        patterns: &[
            r"\b(exploit|take\s+advantage)\s+of\b",
            r"\b(scam|defraud)\s+(users?|people|customers?|the\s+elderly)\b",
        ],
        threshold: 2,
        blocking: false,
        penalty: WARNING_PENALTY,
        penalizes: &["fairness", "beneficence"],
    },
    CategoryDef {
        name: "consent_violation",
        patterns: &[
            r"\bwithout\s+(their\s+|his\s+|her\s+)?(consent|permission)\b",
            r"\b(secretly|covertly)\s+(record|recording|film|filming|monitor|monitoring)\b",
        ],
        threshold: 1,
        blocking: true,
        penalty: BLOCKING_PENALTY,
        penalizes: &["respect", "transparency"],
    },
];

/// One compiled rule category
#[derive(Debug)]
pub struct RuleCategory {
    pub name: &'static str,
    patterns: Vec<(Regex, &'static str)>,
    /// Matches needed before the category counts as a violation
    pub threshold: usize,
    /// Violations reject content outright in strict mode
    pub blocking: bool,
    /// Penalty per matched pattern, applied to each penalised principle
    pub penalty: f32,
    pub penalizes: &'static [&'static str],
}

/// Matches of one category against a text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryMatch {
    pub category: String,
    pub patterns: Vec<String>,
    pub violation: bool,
    pub blocking: bool,
}

/// Result of running the rule set over a text
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleEvaluation {
    pub matches: Vec<CategoryMatch>,
    /// principle -> accumulated penalty
    pub penalties: BTreeMap<String, f32>,
}

impl RuleEvaluation {
    pub fn violations(&self) -> impl Iterator<Item = &CategoryMatch> {
        self.matches.iter().filter(|m| m.violation)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &CategoryMatch> {
        self.matches.iter().filter(|m| !m.violation)
    }
}

/// Versioned, compiled rule set
#[derive(Debug)]
pub struct RuleSet {
    version: &'static str,
    categories: Vec<RuleCategory>,
}

impl RuleSet {
    /// Compile the standard eight-category rule set
    pub fn standard() -> MemoryResult<Self> {
        let categories = CATEGORIES
            .iter()
            .map(|def| {
                let patterns = def
                    .patterns
                    .iter()
                    .map(|pattern| {
                        Regex::new(&format!("(?i){}", pattern))
                            .map(|regex| (regex, *pattern))
                            .map_err(|e| MemoryError::policy(format!("invalid pattern in {}: {}", def.name, e)))
                    })
                    .collect::<MemoryResult<Vec<_>>>()?;

                Ok(RuleCategory {
                    name: def.name,
                    patterns,
                    threshold: def.threshold,
                    blocking: def.blocking,
                    penalty: def.penalty,
                    penalizes: def.penalizes,
                })
            })
            .collect::<MemoryResult<Vec<_>>>()?;

        Ok(Self {
            version: RULESET_VERSION,
            categories,
        })
    }

    pub fn version(&self) -> &str {
        self.version
    }

    pub fn categories(&self) -> &[RuleCategory] {
        &self.categories
    }

    /// Match every category against `text`
    pub fn evaluate(&self, text: &str) -> RuleEvaluation {
        let mut evaluation = RuleEvaluation::default();

        for category in &self.categories {
            let matched: Vec<String> = category
                .patterns
                .iter()
                .filter(|(regex, _)| regex.is_match(text))
                .map(|(_, source)| source.to_string())
                .collect();
            if matched.is_empty() {
                continue;
            }

            for principle in category.penalizes {
                *evaluation.penalties.entry(principle.to_string()).or_default() +=
                    category.penalty * matched.len() as f32;
            }

            evaluation.matches.push(CategoryMatch {
                category: category.name.to_string(),
                violation: matched.len() >= category.threshold,
                blocking: category.blocking,
                patterns: matched,
            });
        }

        evaluation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_rules_compile() {
        let rules = RuleSet::standard().unwrap();
        assert_eq!(rules.categories().len(), 8);
        assert_eq!(rules.version(), RULESET_VERSION);
    }

    #[test]
    fn test_clean_text_has_no_matches() {
        let rules = RuleSet::standard().unwrap();
        let eval = rules.evaluate("I will never give up on learning Rust");
        assert!(eval.matches.is_empty());
        assert!(eval.penalties.is_empty());
    }

    #[test]
    fn test_violence_is_blocking_violation() {
        let rules = RuleSet::standard().unwrap();
        let eval = rules.evaluate("I want to ATTACK PEOPLE downtown");
        let violation = eval.violations().next().unwrap();
        assert_eq!(violation.category, "violence");
        assert!(violation.blocking);
        assert!((eval.penalties["beneficence"] - BLOCKING_PENALTY).abs() < 1e-6);
    }

    #[test]
    fn test_cybercrime_pattern() {
        let rules = RuleSet::standard().unwrap();
        let eval = rules.evaluate("how to hack into the bank and steal account data");
        assert!(eval.violations().any(|m| m.category == "cybercrime"));
    }

    #[test]
    fn test_single_deception_match_is_warning() {
        let rules = RuleSet::standard().unwrap();
        let eval = rules.evaluate("we could mislead customers here");
        assert_eq!(eval.violations().count(), 0);
        assert_eq!(eval.warnings().next().unwrap().category, "deception");

        let eval = rules.evaluate("mislead customers and fabricate reviews");
        assert!(eval.violations().any(|m| m.category == "deception" && !m.blocking));
    }

    #[test]
    fn test_consent_violation() {
        let rules = RuleSet::standard().unwrap();
        let eval = rules.evaluate("share the photos without their consent");
        assert!(eval.violations().any(|m| m.category == "consent_violation"));
    }
}
