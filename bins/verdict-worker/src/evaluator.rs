// Basic evaluator: all-or-nothing test groups plus a configurable
// penalty for programs finishing close to their timeout.
use crate::error::{JudgeError, Result};
use crate::registry::Evaluator;
use serde::Deserialize;
use serde_json::Value;
use verdict_common::types::TestReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum PenaltyScale {
    /// Subtraction grows proportionally to how far past the threshold the
    /// runtime falls, up to 100% of the penalty at the timeout itself.
    Linear,
    /// Fixed subtraction once the threshold is crossed.
    Constant,
}

#[derive(Debug, Clone, Deserialize)]
struct BasicEvaluatorConfig {
    /// Fraction of the timeout past which the slow-program penalty kicks
    /// in, e.g. 0.8.
    slow_program_threshold: f64,
    /// Linear: fraction of max_points subtracted at full lateness.
    /// Constant: absolute points subtracted.
    slow_program_penalty: f64,
    slow_program_scale: PenaltyScale,
}

fn parse_conf(conf: &Value) -> Result<BasicEvaluatorConfig> {
    serde_json::from_value(conf.clone()).map_err(|e| {
        JudgeError::Configuration(format!("invalid basic evaluator configuration: {e}"))
    })
}

/// `gr1-test1` puts the test into group `gr1`; a name without a dash has
/// no group.
fn extract_group(full_name: &str) -> Option<&str> {
    full_name.split_once('-').map(|(group, _)| group)
}

/// Points subtracted for a run finishing past the slow threshold. Zero
/// when the runtime stayed under it.
fn slow_penalty(conf: &BasicEvaluatorConfig, report: &TestReport) -> f64 {
    let threshold_val = report.timeout_ms as f64 * conf.slow_program_threshold;
    if report.time_ms as f64 <= threshold_val {
        return 0.0;
    }

    match conf.slow_program_scale {
        PenaltyScale::Linear => {
            let past_threshold = report.time_ms as f64 - threshold_val;
            let threshold_span = report.timeout_ms as f64 - threshold_val;
            let ratio = if threshold_span > 0.0 {
                (past_threshold / threshold_span).min(1.0)
            } else {
                1.0
            };
            report.max_points * ratio * conf.slow_program_penalty
        }
        PenaltyScale::Constant => conf.slow_program_penalty,
    }
}

pub struct BasicEvaluator;

impl Evaluator for BasicEvaluator {
    fn process_results(
        &self,
        conf: &Value,
        mut results: Vec<TestReport>,
    ) -> Result<(u32, Vec<TestReport>)> {
        let conf = parse_conf(conf)?;

        // 1st pass: a group passes only if every member scored.
        let mut failed_groups: Vec<&str> = Vec::new();
        for report in &results {
            if let Some(group) = extract_group(&report.name) {
                if report.points <= 0.0 && !failed_groups.contains(&group) {
                    failed_groups.push(group);
                }
            }
        }
        let failed_groups: Vec<String> = failed_groups.into_iter().map(String::from).collect();

        // 2nd pass: zero failed groups, penalize slow runs, clamp.
        let mut total_points = 0.0;
        let mut max_points = 0.0;

        for report in &mut results {
            max_points += report.max_points;

            let zeroed = extract_group(&report.name)
                .is_some_and(|group| failed_groups.iter().any(|failed| failed == group));

            if zeroed {
                report.points = 0.0;
            } else {
                report.points -= slow_penalty(&conf, report);
            }

            report.points = report.points.clamp(0.0, report.max_points);
            total_points += report.points;
        }

        let score = if max_points > 0.0 {
            (total_points * 100.0 / max_points).round() as u32
        } else {
            0
        };

        Ok((score, results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use verdict_common::types::TestVerdict;

    fn conf() -> Value {
        json!({
            "slow_program_threshold": 0.8,
            "slow_program_penalty": 0.5,
            "slow_program_scale": "linear"
        })
    }

    fn report(name: &str, status: TestVerdict, time_ms: u64, points: f64, max: f64) -> TestReport {
        TestReport {
            name: name.to_string(),
            status,
            time_ms,
            timeout_ms: 1000,
            memory_bytes: None,
            points,
            max_points: max,
        }
    }

    fn evaluate(results: Vec<TestReport>) -> (u32, Vec<TestReport>) {
        BasicEvaluator.process_results(&conf(), results).unwrap()
    }

    #[test]
    fn mixed_outcomes_score_one_of_four() {
        let (score, _) = evaluate(vec![
            report("t1", TestVerdict::Ok, 100, 1.0, 1.0),
            report("t2", TestVerdict::BadAnswer, 100, 0.0, 1.0),
            report("t3", TestVerdict::HardTimeout, 1500, 0.0, 1.0),
            report("t4", TestVerdict::SoftTimeout, 1100, 0.0, 1.0),
        ]);
        assert_eq!(score, 25);
    }

    #[test]
    fn passing_group_keeps_full_score() {
        let (score, _) = evaluate(vec![
            report("gr1-t1", TestVerdict::Ok, 100, 6.0, 6.0),
            report("gr1-t2", TestVerdict::Ok, 100, 6.0, 6.0),
        ]);
        assert_eq!(score, 100);
    }

    #[test]
    fn one_failure_zeroes_the_whole_group() {
        let (score, results) = evaluate(vec![
            report("gr1-t1", TestVerdict::Ok, 100, 1.0, 1.0),
            report("gr1-t2", TestVerdict::BadAnswer, 100, 0.0, 1.0),
            report("gr2-t1", TestVerdict::Ok, 100, 1.0, 1.0),
        ]);
        assert_eq!(results[0].points, 0.0);
        assert_eq!(results[1].points, 0.0);
        assert_eq!(results[2].points, 1.0);
        assert_eq!(score, 33);
    }

    #[test]
    fn late_answer_loses_points_but_stays_positive() {
        let (_, results) = evaluate(vec![report("t1", TestVerdict::Ok, 950, 1.0, 1.0)]);
        assert!(results[0].points < 1.0);
        assert!(results[0].points > 0.0);
        // 150ms past the 800ms threshold out of a 200ms span, times the
        // 0.5 penalty: 0.375 off.
        assert!((results[0].points - 0.625).abs() < 1e-9);
    }

    #[test]
    fn constant_scale_subtracts_fixed_amount() {
        let conf = json!({
            "slow_program_threshold": 0.8,
            "slow_program_penalty": 0.25,
            "slow_program_scale": "constant"
        });
        let (_, results) = BasicEvaluator
            .process_results(&conf, vec![report("t1", TestVerdict::Ok, 900, 1.0, 1.0)])
            .unwrap();
        assert!((results[0].points - 0.75).abs() < 1e-9);
    }

    #[test]
    fn points_stay_within_bounds() {
        let (_, results) = evaluate(vec![
            report("t1", TestVerdict::Ok, 999, 1.0, 1.0),
            report("t2", TestVerdict::Ok, 1200, 5.0, 5.0),
            report("gr1-t1", TestVerdict::BadAnswer, 100, 0.0, 2.0),
            report("gr1-t2", TestVerdict::Ok, 100, 2.0, 2.0),
        ]);
        for r in &results {
            assert!(r.points >= 0.0, "{} went negative", r.name);
            assert!(r.points <= r.max_points, "{} exceeded its maximum", r.name);
        }
    }

    #[test]
    fn partial_credit_slow_test_is_penalized() {
        let conf = json!({
            "slow_program_threshold": 0.8,
            "slow_program_penalty": 0.5,
            "slow_program_scale": "constant"
        });
        let (_, results) = BasicEvaluator
            .process_results(&conf, vec![report("t1", TestVerdict::Ok, 900, 3.0, 10.0)])
            .unwrap();
        // The penalty subtracts from the current points, so a test that
        // already lost credit still loses more for being slow.
        assert!((results[0].points - 2.5).abs() < 1e-9);
    }

    #[test]
    fn reevaluation_of_clamped_groups_is_a_fixed_point() {
        let (score_a, results) = evaluate(vec![
            report("t1", TestVerdict::Ok, 100, 1.0, 1.0),
            report("gr1-t1", TestVerdict::Ok, 100, 1.0, 1.0),
            report("gr1-t2", TestVerdict::BadAnswer, 100, 0.0, 1.0),
        ]);
        let (score_b, reresults) = evaluate(results.clone());
        assert_eq!(score_a, score_b);
        for (a, b) in results.iter().zip(&reresults) {
            assert_eq!(a.points, b.points);
        }
    }

    #[test]
    fn score_rounds_to_nearest() {
        let (score, _) = evaluate(vec![
            report("t1", TestVerdict::Ok, 100, 1.0, 1.0),
            report("t2", TestVerdict::Ok, 100, 1.0, 1.0),
            report("t3", TestVerdict::BadAnswer, 100, 0.0, 1.0),
        ]);
        // 200/3 = 66.66…, rounded rather than truncated.
        assert_eq!(score, 67);
    }

    #[test]
    fn empty_result_set_scores_zero() {
        let (score, results) = evaluate(Vec::new());
        assert_eq!(score, 0);
        assert!(results.is_empty());
    }

    #[test]
    fn unknown_scale_is_a_configuration_error() {
        let conf = json!({
            "slow_program_threshold": 0.8,
            "slow_program_penalty": 0.5,
            "slow_program_scale": "exponential"
        });
        assert!(matches!(
            BasicEvaluator.process_results(&conf, Vec::new()),
            Err(JudgeError::Configuration(_))
        ));
    }
}
