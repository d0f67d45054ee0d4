//! Synthesis strategies.
//!
//! A [`Strategy`] is a closed set of tier variants plus an optional
//! free-text override directive. It decides what the synthesizer is told
//! ([`system_directive`](Strategy::system_directive),
//! [`user_directive`](Strategy::user_directive)) and how its raw output is
//! cleaned up ([`postprocess`](Strategy::postprocess)).
//!
//! [`StrategyTable`] is the level → tier policy used by the builder:
//!
//! | Level | Default tier |
//! |-------|--------------|
//! | 0 | `actionable` |
//! | 1.. | `structural` |
//! | root | `essential` (always) |
//!
//! Non-root levels can be overridden per level.

use std::collections::BTreeMap;

use crate::models::Tier;

/// Maximum sentences kept for an essential synthesis.
pub const ESSENTIAL_MAX_SENTENCES: usize = 3;

/// Input handed to [`Strategy::user_directive`].
#[derive(Debug, Clone, Copy)]
pub struct SynthesisContext<'a> {
    /// Constituent texts in child order.
    pub texts: &'a [String],
}

impl<'a> SynthesisContext<'a> {
    pub fn new(texts: &'a [String]) -> Self {
        Self { texts }
    }
}

/// How a group's texts are turned into one node text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Strategy {
    pub tier: Tier,
    /// Extra instruction that takes precedence over the tier's defaults.
    pub directive_override: Option<String>,
}

impl Strategy {
    pub fn new(tier: Tier) -> Self {
        Self {
            tier,
            directive_override: None,
        }
    }

    /// Same tier, decorated with an explicit instruction.
    pub fn with_override(mut self, instruction: impl Into<String>) -> Self {
        self.directive_override = Some(instruction.into());
        self
    }

    pub fn system_directive(&self) -> String {
        let base = match self.tier {
            Tier::Raw => {
                "You tidy source passages. Reproduce their content faithfully, \
                 fixing only broken whitespace and obvious extraction noise."
            }
            Tier::Actionable => {
                "You summarise source passages into concrete, actionable statements. \
                 Keep specific facts, steps, names and figures a reader could act on. \
                 Do not speculate beyond the passages."
            }
            Tier::Structural => {
                "You explain how a set of summaries fit together. Describe the \
                 relationships, mechanisms and dependencies that connect them, \
                 rather than restating each one."
            }
            Tier::Essential => {
                "You distil material to its essential point. Answer in at most \
                 three sentences of plain prose, with maximal abstraction."
            }
        };
        match &self.directive_override {
            Some(_) => format!(
                "{} When the user gives an explicit instruction, it overrides these defaults.",
                base
            ),
            None => base.to_string(),
        }
    }

    pub fn user_directive(&self, ctx: &SynthesisContext<'_>) -> String {
        let task = match self.tier {
            Tier::Raw => "Clean up the following passages:",
            Tier::Actionable => "Summarise the following passages:",
            Tier::Structural => "Explain how the following summaries relate:",
            Tier::Essential => "State the essential point of the following material:",
        };
        let mut out = String::from(task);
        for (i, text) in ctx.texts.iter().enumerate() {
            out.push_str(&format!("\n\n[{}]\n{}", i + 1, text.trim()));
        }
        if let Some(instruction) = &self.directive_override {
            out.push_str("\n\nInstruction (takes precedence): ");
            out.push_str(instruction.trim());
        }
        out
    }

    /// Clean raw synthesizer output: trim, unwrap a fenced block and
    /// enforce the essential sentence cap.
    pub fn postprocess(&self, raw: &str) -> String {
        let text = strip_fence(raw.trim()).trim();
        let text = collapse_blank_lines(text);
        match self.tier {
            Tier::Essential => sentences(&text)
                .into_iter()
                .take(ESSENTIAL_MAX_SENTENCES)
                .collect::<Vec<_>>()
                .join(" "),
            _ => text,
        }
    }
}

fn strip_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return text;
    };
    // Drop an info string such as ```text
    match body.find('\n') {
        Some(nl) if !body[..nl].contains(' ') => &body[nl + 1..],
        _ => body,
    }
}

fn collapse_blank_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(line.trim_end());
    }
    out
}

/// Split text into sentences ending in `.`, `!` or `?` followed by
/// whitespace (the last sentence may lack a terminator).
pub fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            let boundary = chars.peek().map(|(_, n)| n.is_whitespace()).unwrap_or(true);
            if boundary {
                let end = i + c.len_utf8();
                let s = text[start..end].trim();
                if !s.is_empty() {
                    out.push(s);
                }
                start = end;
            }
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

/// Level → tier policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StrategyTable {
    overrides: BTreeMap<u32, Tier>,
}

impl StrategyTable {
    pub fn new(overrides: BTreeMap<u32, Tier>) -> Self {
        Self { overrides }
    }

    /// Tier for a synthesis round at `level`. The root round is always
    /// [`Tier::Essential`].
    pub fn tier_for(&self, level: u32, is_root: bool) -> Tier {
        if is_root {
            return Tier::Essential;
        }
        if let Some(tier) = self.overrides.get(&level) {
            return *tier;
        }
        match level {
            0 => Tier::Actionable,
            _ => Tier::Structural,
        }
    }

    pub fn strategy_for(&self, level: u32, is_root: bool) -> Strategy {
        Strategy::new(self.tier_for(level, is_root))
    }
}
