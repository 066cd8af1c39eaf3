//! Auxiliary phrase markers.
//!
//! String-level heuristics that support the trust-violation rule set. They
//! populate flags and violation candidates only; the neutrosophic T/I/F
//! signal always comes from evaluator models, never from these patterns.

use regex::Regex;
use std::sync::LazyLock;

static AUTHORITY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(ignore (all |your |the |any )?(previous |prior |earlier )?(instructions|rules|restrictions|guidelines)|forget (all |your )?(restrictions|instructions|rules)|you must (now )?(comply|obey|answer)|as your (administrator|developer|creator|operator)|i am your (administrator|developer|creator|operator)|override (your|the) (safety|system)|disregard (your|the|all) )",
    )
    .expect("authority pattern must compile")
});

static POLITE_FRAMING_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(kindly|please|i appreciate|thanks? (you )?(so much |for )|would you be so|so (helpful|cooperative))")
        .expect("polite framing pattern must compile")
});

static PRIOR_TURN_CLAIM_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(turn \d+|as (we|you) (discussed|agreed|established)|earlier you (said|told|agreed|mentioned)|previously you|last time (we|you)|in our (previous|prior|earlier) (conversation|exchange|session)|you already (agreed|promised|confirmed))",
    )
    .expect("prior turn claim pattern must compile")
});

static ROLE_REVERSAL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(how (may|can) i (assist|help) you|what can i do for you|i'm here to help you)")
        .expect("role reversal pattern must compile")
});

static HTML_ENTITY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&#x?[0-9a-fA-F]{2,6};").expect("html entity pattern must compile")
});

static BASE64_RUN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9+/]{24,}={0,2}").expect("base64 run pattern must compile")
});

static REFUSAL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(i('m| am) sorry|i can('no|')t|i cannot|i won('t|t)|i am (unable|not able)|as an ai|i must decline|i do not feel comfortable)",
    )
    .expect("refusal pattern must compile")
});

/// Phrasing-coded authority claim ("ignore your instructions", "as your
/// administrator"). Auxiliary input to the AUTHORITY_CLAIM rule.
pub fn has_authority_marker(text: &str) -> bool {
    AUTHORITY_PATTERN.is_match(text)
}

/// Courteous framing that can mask an extractive request.
pub fn has_polite_framing(text: &str) -> bool {
    POLITE_FRAMING_PATTERN.is_match(text)
}

/// Text that asserts conversational history ("as we discussed", "Turn 4").
pub fn claims_prior_turns(text: &str) -> bool {
    PRIOR_TURN_CLAIM_PATTERN.is_match(text)
}

/// User adopting the assistant's voice.
pub fn has_role_reversal_marker(text: &str) -> bool {
    ROLE_REVERSAL_PATTERN.is_match(text)
}

/// Detect encoding-based obfuscation: homoglyph substitution, RTLO control
/// characters, HTML entities, or long base64 runs.
pub fn has_encoding_obfuscation(text: &str) -> bool {
    if text.chars().any(is_suspicious_codepoint) {
        return true;
    }
    HTML_ENTITY_PATTERN.is_match(text) || BASE64_RUN_PATTERN.is_match(text)
}

/// Cyrillic/Greek lookalikes embedded in otherwise-Latin text, directional
/// overrides, and mathematical alphanumeric variants.
fn is_suspicious_codepoint(c: char) -> bool {
    matches!(c,
        // Bidi overrides (RTLO attacks)
        '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}'
        // Cyrillic homoglyphs for latin letters
        | '\u{0430}' | '\u{0435}' | '\u{043E}' | '\u{0440}' | '\u{0441}' | '\u{0443}'
        | '\u{0445}' | '\u{0456}' | '\u{0458}' | '\u{04BB}' | '\u{0501}' | '\u{051B}'
        // Greek homoglyphs
        | '\u{03BF}' | '\u{03B1}' | '\u{03B5}'
        // Mathematical alphanumeric symbols (styled letters)
        | '\u{1D400}'..='\u{1D7FF}'
        // Zero-width characters
        | '\u{200B}'..='\u{200D}' | '\u{FEFF}')
}

/// Leading refusal phrasing in a model reply. Only consulted when the reply
/// contains no parseable JSON; a refusal that still scores is kept as data.
pub fn is_refusal(text: &str) -> bool {
    REFUSAL_PATTERN.is_match(text)
}
