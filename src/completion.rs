//! Completion Evaluator (C5, spec §4.5).
//!
//! A pure function over a `Session`'s current state. No I/O, no mutation.

use crate::fingerprint::similarity;
use crate::session::{CompletionReason, Session};

/// Result of evaluating a session for completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub complete: bool,
    pub reason: Option<CompletionReason>,
}

impl Decision {
    fn incomplete() -> Self {
        Self { complete: false, reason: None }
    }

    fn done(reason: CompletionReason) -> Self {
        Self { complete: true, reason: Some(reason) }
    }
}

/// Evaluate a session's decision rules in order (spec §4.5). Ship tiers
/// are checked before kill switches, so a session that simultaneously
/// qualifies for a ship tier and a hard stop ships.
pub fn evaluate(session: &Session) -> Decision {
    let cfg = &session.config;
    let current_loop = session.current_loop;
    let Some(score) = session.last_score() else {
        return Decision::incomplete();
    };

    // 1. Ship tiers — first match wins, checked tier1 -> tier2 -> tier3.
    if score >= cfg.tier1_score && current_loop >= cfg.tier1_min_loops {
        return Decision::done(CompletionReason::Tier1);
    }
    if score >= cfg.tier2_score && current_loop >= cfg.tier2_min_loops {
        return Decision::done(CompletionReason::Tier2);
    }
    if score >= cfg.tier3_score && current_loop >= cfg.tier3_min_loops {
        return Decision::done(CompletionReason::Tier3);
    }

    // 2. Hard stop.
    if current_loop >= cfg.hard_stop_loops {
        return Decision::done(CompletionReason::HardStop);
    }

    // 3. Stagnation — compares successive *thoughts*, not reviews
    // (spec §9 open question, fixed by this spec).
    if current_loop >= cfg.stagnation_start_loop
        && let (Some(last), Some(prev)) = (session.last_thought(), session.previous_thought())
    {
        let sim = similarity(last, prev);
        if sim >= cfg.stagnation_threshold {
            return Decision::done(CompletionReason::Stagnation);
        }
    }

    // 4. Critical-issue persistence (optional kill switch).
    if current_loop >= cfg.critical_persist_loops
        && let Some(last_iteration) = session.history.last()
        && last_iteration.review.has_critical_comment()
    {
        return Decision::done(CompletionReason::CriticalPersist);
    }

    Decision::incomplete()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::ThresholdConfig;
    use crate::session::{Iteration, Review, Session, Verdict};

    fn push(session: &mut Session, thought: &str, score: u8) {
        let n = session.current_loop + 1;
        session
            .append(Iteration {
                thought_number: n,
                total_thoughts: n,
                fingerprint: format!("fp{n}"),
                submitted_at: chrono::Utc::now(),
                review: Review {
                    verdict: Verdict::Revise,
                    overall_score: score,
                    dimensions: HashMap::new(),
                    inline_comments: Vec::new(),
                    summary: String::new(),
                    proposed_diff: None,
                    timed_out: false,
                    partial: false,
                },
                duration_ms: 1,
                thought: thought.to_string(),
            })
            .unwrap();
    }

    #[test]
    fn quick_pass_tier1_at_loop_10() {
        let mut s = Session::new("s".into(), None, ThresholdConfig::default());
        for i in 1..=9 {
            push(&mut s, &format!("thought {i}"), 97);
            assert!(!evaluate(&s).complete, "should not complete before loop 10");
        }
        push(&mut s, "thought 10", 97);
        let d = evaluate(&s);
        assert!(d.complete);
        assert_eq!(d.reason, Some(CompletionReason::Tier1));
    }

    #[test]
    fn tier2_completion_at_loop_15() {
        let scores = [70u8, 72, 78, 82, 86, 88, 90, 91, 91, 92, 93, 93, 92, 93, 93];
        let mut s = Session::new("s".into(), None, ThresholdConfig::default());
        let mut last = Decision::incomplete();
        for (i, score) in scores.iter().enumerate() {
            push(&mut s, &format!("thought {i}"), *score);
            last = evaluate(&s);
        }
        assert!(last.complete);
        assert_eq!(last.reason, Some(CompletionReason::Tier2));
        assert_eq!(s.current_loop, 15);
    }

    #[test]
    fn hard_stop_at_loop_25_regardless_of_score() {
        let mut s = Session::new("s".into(), None, ThresholdConfig::default());
        let mut last = Decision::incomplete();
        for i in 1..=25 {
            push(&mut s, &format!("distinct thought number {i}"), 80);
            last = evaluate(&s);
        }
        assert!(last.complete);
        assert_eq!(last.reason, Some(CompletionReason::HardStop));
    }

    #[test]
    fn stagnation_fires_at_loop_11_not_10() {
        let mut s = Session::new("s".into(), None, ThresholdConfig::default());
        for i in 1..=9 {
            push(&mut s, &format!("distinct thought {i}"), 60);
        }
        push(&mut s, "identical thought body", 60);
        assert!(
            !evaluate(&s).complete,
            "loop 10 has only one prior distinct thought, no stagnation yet"
        );
        push(&mut s, "identical thought body", 60);
        let d = evaluate(&s);
        assert!(d.complete);
        assert_eq!(d.reason, Some(CompletionReason::Stagnation));
    }

    #[test]
    fn ship_tier_wins_over_hard_stop_when_both_match() {
        let mut cfg = ThresholdConfig::default();
        cfg.tier1_min_loops = 5;
        cfg.hard_stop_loops = 5;
        let mut s = Session::new("s".into(), None, cfg);
        for i in 1..=5 {
            push(&mut s, &format!("thought {i}"), 96);
        }
        let d = evaluate(&s);
        assert_eq!(d.reason, Some(CompletionReason::Tier1));
    }
}
