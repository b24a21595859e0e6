//! Rule table for the response classifier, compiled once from
//! configuration. No business strings are hardcoded here; the defaults
//! live in `ClassifierConfig` and any list can be overridden or emptied.

use regex::{Regex, RegexBuilder};

use cartridge_core::config::ClassifierConfig;
use cartridge_core::error::{EngineError, EngineResult};

/// One compiled pattern group. All patterns in a group detect the same
/// label; matching any of them is a hit.
#[derive(Debug)]
pub struct PatternGroup {
    patterns: Vec<Regex>,
}

impl PatternGroup {
    fn compile(raw: &[String]) -> EngineResult<Self> {
        let mut patterns = Vec::with_capacity(raw.len());
        for p in raw {
            let regex = RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .map_err(|e| EngineError::Config(format!("bad classifier pattern {p:?}: {e}")))?;
            patterns.push(regex);
        }
        Ok(Self { patterns })
    }

    pub fn matches(&self, text: &str) -> bool {
        self.patterns.iter().any(|r| r.is_match(text))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// The full compiled rule set, in detection priority order.
#[derive(Debug)]
pub struct RuleSet {
    pub opt_out: PatternGroup,
    pub do_not_contact: PatternGroup,
    pub noise: PatternGroup,
    pub wants_call: PatternGroup,
    pub needs_help: PatternGroup,
    pub high_intent: PatternGroup,
    pub meeting_booked: PatternGroup,
    pub email: Regex,
    pub phone: Regex,
}

impl RuleSet {
    pub fn from_config(cfg: &ClassifierConfig) -> EngineResult<Self> {
        Ok(Self {
            opt_out: PatternGroup::compile(&cfg.opt_out_patterns)?,
            do_not_contact: PatternGroup::compile(&cfg.do_not_contact_patterns)?,
            noise: PatternGroup::compile(&cfg.noise_patterns)?,
            wants_call: PatternGroup::compile(&cfg.wants_call_patterns)?,
            needs_help: PatternGroup::compile(&cfg.needs_help_patterns)?,
            high_intent: PatternGroup::compile(&cfg.high_intent_patterns)?,
            meeting_booked: PatternGroup::compile(&cfg.meeting_booked_patterns)?,
            email: Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}")
                .expect("email pattern is valid"),
            phone: Regex::new(r"(?:\+?1[-.\s]?)?\(?[2-9]\d{2}\)?[-.\s]?\d{3}[-.\s]?\d{4}")
                .expect("phone pattern is valid"),
        })
    }

    pub fn default_rules() -> Self {
        Self::from_config(&ClassifierConfig::default()).expect("default patterns compile")
    }

    /// Extract the first email address, lowercased.
    pub fn extract_email(&self, text: &str) -> Option<String> {
        self.email.find(text).map(|m| m.as_str().to_lowercase())
    }

    /// Extract the first US phone number, normalized to its last 10 digits.
    pub fn extract_phone(&self, text: &str) -> Option<String> {
        let m = self.phone.find(text)?;
        let digits: String = m.as_str().chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.len() < 10 {
            return None;
        }
        Some(digits[digits.len() - 10..].to_string())
    }
}
