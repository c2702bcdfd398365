//! Builds monitor conditions from checkpoints and parses verdicts back.
//!
//! The monitoring service caps concurrently running jobs, so all of a task's
//! unverified checkpoints share one job: their prompts are numbered into a
//! single combined condition and the verdict is split back out per checkpoint.
//! A checkpoint whose numbered verdict cannot be found is never treated as
//! passed.

use regex::Regex;
use std::sync::LazyLock;
use uuid::Uuid;

use crate::store::Checkpoint;

/// Confidence assumed for a YES verdict without an explicit value.
const DEFAULT_PASS_CONFIDENCE: f64 = 0.85;
/// Confidence assumed for a NO verdict without an explicit value.
const DEFAULT_FAIL_CONFIDENCE: f64 = 0.1;

const UNPARSEABLE_EXPLANATION: &str = "Could not parse verification response for this checkpoint";

static YES_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\byes\b").expect("static regex"));

static CONFIDENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)confidence:\s*([\d.]+)").expect("static regex"));

static CHECKPOINT_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"CHECKPOINT (\d+) \[([0-9a-fA-F-]{36})\]:").expect("static regex")
});

/// Parsed verdict for one checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointResult {
    pub checkpoint_id: Uuid,
    pub passed: bool,
    /// Always within [0, 1].
    pub confidence: f64,
    pub explanation: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EvaluatorError {
    #[error("At least one checkpoint is required to build a condition")]
    NoCheckpoints,
}

/// Build the monitor condition for a set of checkpoints.
///
/// A single checkpoint uses its own prompt. Several checkpoints are numbered
/// (1-based, in the given order) and tagged with their ids so the verdict can
/// be attributed.
pub fn build_condition(checkpoints: &[Checkpoint]) -> Result<String, EvaluatorError> {
    match checkpoints {
        [] => Err(EvaluatorError::NoCheckpoints),
        [single] => Ok(single.kind.prompt_for(&single.target)),
        many => {
            let numbered = many
                .iter()
                .enumerate()
                .map(|(i, cp)| {
                    format!(
                        "CHECKPOINT {} [{}]: {}",
                        i + 1,
                        cp.id,
                        cp.kind.prompt_for(&cp.target)
                    )
                })
                .collect::<Vec<_>>()
                .join("\n\n");

            Ok(format!(
                "You are verifying task completion. Check ALL of the following checkpoints \
                 and report the status of EACH one individually.\n\n\
                 {numbered}\n\n\
                 For each checkpoint, respond with:\n\
                 - CHECKPOINT <number>: YES (confidence: 0.0-1.0) - <brief explanation>\n\
                 - CHECKPOINT <number>: NO - <brief explanation>\n\n\
                 Respond YES for a checkpoint ONLY if you have clear visual evidence. \
                 Be precise about what you see."
            ))
        }
    }
}

/// Checkpoint ids tagged in a combined condition, in numbering order.
///
/// Returns an empty list for a single-checkpoint condition.
pub fn condition_checkpoint_ids(condition: &str) -> Vec<Uuid> {
    let mut tagged: Vec<(usize, Uuid)> = CHECKPOINT_TAG
        .captures_iter(condition)
        .filter_map(|caps| {
            let number = caps.get(1)?.as_str().parse::<usize>().ok()?;
            let id = Uuid::parse_str(caps.get(2)?.as_str()).ok()?;
            Some((number, id))
        })
        .collect();
    tagged.sort_by_key(|(number, _)| *number);
    tagged.dedup_by_key(|(number, _)| *number);
    tagged.into_iter().map(|(_, id)| id).collect()
}

/// Split a monitor verdict into per-checkpoint results.
///
/// `checkpoints` must be in the same order that was used to build the
/// condition. Results are returned in that order, one per checkpoint.
pub fn parse_response(explanation: &str, checkpoints: &[Checkpoint]) -> Vec<CheckpointResult> {
    match checkpoints {
        [] => Vec::new(),
        [single] => vec![parse_single(explanation, single.id)],
        many => many
            .iter()
            .enumerate()
            .map(|(i, cp)| parse_numbered(explanation, i + 1, cp.id))
            .collect(),
    }
}

fn parse_single(explanation: &str, checkpoint_id: Uuid) -> CheckpointResult {
    let passed = YES_WORD.is_match(explanation);
    let explicit = CONFIDENCE
        .captures(explanation)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok());

    CheckpointResult {
        checkpoint_id,
        passed,
        confidence: clamp_confidence(explicit.unwrap_or_else(|| default_confidence(passed))),
        explanation: explanation.trim().to_string(),
    }
}

fn parse_numbered(explanation: &str, number: usize, checkpoint_id: Uuid) -> CheckpointResult {
    let pattern = format!(
        r"(?i)CHECKPOINT\s+{number}\s*:\s*(YES|NO)\b(?:\s*\(?\s*confidence:\s*([\d.]+)\s*\)?)?\s*[-–]?\s*(.*)"
    );
    let captures = Regex::new(&pattern)
        .ok()
        .and_then(|re| re.captures(explanation).map(|caps| {
            let passed = caps
                .get(1)
                .map(|m| m.as_str().eq_ignore_ascii_case("yes"))
                .unwrap_or(false);
            let explicit = caps.get(2).and_then(|m| m.as_str().parse::<f64>().ok());
            let detail = caps
                .get(3)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default();
            (passed, explicit, detail)
        }));

    match captures {
        Some((passed, explicit, detail)) => CheckpointResult {
            checkpoint_id,
            passed,
            confidence: clamp_confidence(explicit.unwrap_or_else(|| default_confidence(passed))),
            explanation: detail,
        },
        None => CheckpointResult {
            checkpoint_id,
            passed: false,
            confidence: 0.0,
            explanation: UNPARSEABLE_EXPLANATION.to_string(),
        },
    }
}

fn default_confidence(passed: bool) -> f64 {
    if passed {
        DEFAULT_PASS_CONFIDENCE
    } else {
        DEFAULT_FAIL_CONFIDENCE
    }
}

fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoints::CheckpointType;

    fn checkpoint(kind: CheckpointType, target: &str, ordering: i64) -> Checkpoint {
        Checkpoint {
            id: Uuid::new_v4(),
            task_id: Uuid::nil(),
            kind,
            target: target.to_string(),
            description: None,
            confidence_threshold: 0.8,
            required: true,
            ordering,
            verified: false,
            verified_at: None,
            confidence: None,
            explanation: None,
            evidence_frame: None,
        }
    }

    #[test]
    fn single_checkpoint_condition_is_its_own_prompt() {
        let cp = checkpoint(CheckpointType::Location, "the Ferry Building", 0);
        let condition = build_condition(std::slice::from_ref(&cp)).unwrap();
        assert_eq!(condition, CheckpointType::Location.prompt_for("the Ferry Building"));
    }

    #[test]
    fn combined_condition_numbers_and_tags_each_checkpoint() {
        let a = checkpoint(CheckpointType::Location, "the Ferry Building", 0);
        let b = checkpoint(CheckpointType::Document, "a signed receipt", 1);
        let condition = build_condition(&[a.clone(), b.clone()]).unwrap();

        assert!(condition.contains(&format!("CHECKPOINT 1 [{}]:", a.id)));
        assert!(condition.contains(&format!("CHECKPOINT 2 [{}]:", b.id)));
        assert!(condition.contains("report the status of EACH one individually"));
        assert!(condition.contains("CHECKPOINT <number>: YES (confidence: 0.0-1.0)"));
    }

    #[test]
    fn tagged_ids_are_recovered_from_combined_condition() {
        let cps = vec![
            checkpoint(CheckpointType::Location, "the Ferry Building", 0),
            checkpoint(CheckpointType::Object, "a parcel", 1),
            checkpoint(CheckpointType::Document, "a receipt", 2),
        ];
        let condition = build_condition(&cps).unwrap();
        let ids: Vec<Uuid> = cps.iter().map(|cp| cp.id).collect();
        assert_eq!(condition_checkpoint_ids(&condition), ids);

        let single = build_condition(&cps[..1]).unwrap();
        assert!(condition_checkpoint_ids(&single).is_empty());
    }

    #[test]
    fn empty_checkpoint_list_is_rejected() {
        assert_eq!(build_condition(&[]), Err(EvaluatorError::NoCheckpoints));
    }

    #[test]
    fn single_yes_with_explicit_confidence() {
        let cp = checkpoint(CheckpointType::Object, "a parcel", 0);
        let results = parse_response(
            "  Yes, a parcel is on the desk. Confidence: 0.93  ",
            std::slice::from_ref(&cp),
        );
        assert_eq!(results.len(), 1);
        assert!(results[0].passed);
        assert!((results[0].confidence - 0.93).abs() < f64::EPSILON);
        assert_eq!(results[0].explanation, "Yes, a parcel is on the desk. Confidence: 0.93");
    }

    #[test]
    fn single_defaults_confidence_from_verdict() {
        let cp = checkpoint(CheckpointType::Object, "a parcel", 0);
        let passed = parse_response("YES", std::slice::from_ref(&cp));
        assert!((passed[0].confidence - 0.85).abs() < f64::EPSILON);

        let failed = parse_response("No parcel in view", std::slice::from_ref(&cp));
        assert!(!failed[0].passed);
        assert!((failed[0].confidence - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn single_yes_must_be_a_whole_word() {
        let cp = checkpoint(CheckpointType::Object, "a parcel", 0);
        let results = parse_response("The eyes of the clerk are closed", std::slice::from_ref(&cp));
        assert!(!results[0].passed);
    }

    #[test]
    fn confidence_is_clamped() {
        let cp = checkpoint(CheckpointType::Object, "a parcel", 0);
        let results = parse_response("yes confidence: 7.5", std::slice::from_ref(&cp));
        assert_eq!(results[0].confidence, 1.0);
    }

    #[test]
    fn multi_parses_each_numbered_block() {
        let cps = vec![
            checkpoint(CheckpointType::Location, "the Ferry Building", 0),
            checkpoint(CheckpointType::Object, "a parcel", 1),
            checkpoint(CheckpointType::Document, "a receipt", 2),
        ];
        let response = "CHECKPOINT 1: YES (confidence: 0.92) - clock tower visible\n\
                        CHECKPOINT 2: NO - desk is empty\n\
                        checkpoint 3: yes confidence: 0.7 receipt held up";
        let results = parse_response(response, &cps);

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].checkpoint_id, cps[0].id);
        assert!(results[0].passed);
        assert!((results[0].confidence - 0.92).abs() < f64::EPSILON);
        assert_eq!(results[0].explanation, "clock tower visible");

        assert!(!results[1].passed);
        assert!((results[1].confidence - 0.1).abs() < f64::EPSILON);
        assert_eq!(results[1].explanation, "desk is empty");

        assert!(results[2].passed);
        assert!((results[2].confidence - 0.7).abs() < f64::EPSILON);
        assert_eq!(results[2].explanation, "receipt held up");
    }

    #[test]
    fn missing_block_is_not_passed_with_zero_confidence() {
        let cps = vec![
            checkpoint(CheckpointType::Location, "the Ferry Building", 0),
            checkpoint(CheckpointType::Object, "a parcel", 1),
            checkpoint(CheckpointType::Document, "a receipt", 2),
        ];
        let response = "CHECKPOINT 1: YES - tower\nCHECKPOINT 3: YES - receipt";
        let results = parse_response(response, &cps);

        let unparsed: Vec<_> = results
            .iter()
            .filter(|r| !r.passed && r.confidence == 0.0)
            .collect();
        assert_eq!(unparsed.len(), 1);
        assert_eq!(unparsed[0].checkpoint_id, cps[1].id);
        assert_eq!(unparsed[0].explanation, UNPARSEABLE_EXPLANATION);
        assert!(results[0].passed);
        assert!(results[2].passed);
    }

    #[test]
    fn checkpoint_one_does_not_match_checkpoint_ten() {
        let cps: Vec<_> = (0..10)
            .map(|i| checkpoint(CheckpointType::Object, "thing", i))
            .collect();
        let results = parse_response("CHECKPOINT 10: YES - found", &cps);
        assert!(!results[0].passed);
        assert_eq!(results[0].confidence, 0.0);
        assert!(results[9].passed);
    }

    #[test]
    fn overall_yes_does_not_leak_into_multi_results() {
        let cps = vec![
            checkpoint(CheckpointType::Location, "the Ferry Building", 0),
            checkpoint(CheckpointType::Object, "a parcel", 1),
        ];
        let results = parse_response("YES, everything looks good", &cps);
        assert!(results.iter().all(|r| !r.passed && r.confidence == 0.0));
    }
}
