//! Fingerprint & Similarity (C1, spec §4.1).
//!
//! `fingerprint` keys the Orchestrator's review cache; `similarity` feeds
//! the Completion Evaluator's stagnation check. Both are deterministic,
//! dependency-free, and O(n+m).

use std::collections::HashSet;

use crate::session::ConfigOverride;

/// FNV-1a 64-bit, chosen for determinism across processes with no extra
/// dependency (spec §4.1 only requires determinism, not cryptographic
/// strength — this is a dedup key, not a security boundary).
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

fn normalize(thought: &str) -> String {
    thought.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Deterministic hash of a submission's judge-affecting content: the
/// normalized `thought` plus the judge-affecting config subset (timeout,
/// threshold). Independent of wall clock, session id, and iteration
/// number (spec §4.1).
pub fn fingerprint(thought: &str, judge_affecting_config: &ConfigOverride) -> String {
    let mut buf = normalize(thought).into_bytes();
    buf.push(0);
    if let Some(threshold) = judge_affecting_config.threshold {
        buf.extend_from_slice(&threshold.to_le_bytes());
    }
    buf.push(0);
    if let Some(max_cycles) = judge_affecting_config.max_cycles {
        buf.extend_from_slice(&max_cycles.to_le_bytes());
    }
    buf.push(0);
    if let Some(scope) = &judge_affecting_config.scope {
        buf.extend_from_slice(format!("{scope:?}").as_bytes());
    }
    format!("{:016x}", fnv1a(&buf))
}

fn tokenize(text: &str) -> HashSet<&str> {
    text.split_whitespace().collect()
}

/// Normalized token-set Jaccard similarity, symmetric and reflexive, in
/// `[0, 1]` (spec §4.1).
pub fn similarity(a: &str, b: &str) -> f64 {
    let ta = tokenize(a);
    let tb = tokenize(b);
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    if union == 0 {
        return 1.0;
    }
    intersection as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic() {
        let cfg = ConfigOverride::default();
        assert_eq!(fingerprint("hello world", &cfg), fingerprint("hello world", &cfg));
    }

    #[test]
    fn fingerprint_ignores_whitespace_variance() {
        let cfg = ConfigOverride::default();
        assert_eq!(fingerprint("hello   world", &cfg), fingerprint("hello world", &cfg));
    }

    #[test]
    fn fingerprint_differs_on_threshold_change() {
        let mut cfg = ConfigOverride::default();
        cfg.threshold = Some(80);
        let cfg2 = ConfigOverride { threshold: Some(90), ..ConfigOverride::default() };
        assert_ne!(fingerprint("same thought", &cfg), fingerprint("same thought", &cfg2));
    }

    #[test]
    fn similarity_reflexive() {
        assert_eq!(similarity("foo bar baz", "foo bar baz"), 1.0);
    }

    #[test]
    fn similarity_symmetric() {
        assert_eq!(similarity("foo bar", "bar baz"), similarity("bar baz", "foo bar"));
    }

    #[test]
    fn similarity_monotone_in_shared_content() {
        let low = similarity("foo", "bar baz qux");
        let high = similarity("foo bar", "foo bar qux");
        assert!(high > low);
    }

    #[test]
    fn identical_thoughts_hit_stagnation_threshold() {
        assert!(similarity("identical text here", "identical text here") >= 0.95);
    }
}
