//! Property-based tests for the numeric components.
//!
//! Invariants covered:
//! - Kalman: convergence to a constant measurement, non-increasing uncertainty
//! - HMM: stochastic rows after Baum-Welch, Viterbi path length
//! - Bayesian: monotone and bounded mastery
//! - PID: integral bounds, dead-zone hold
//! - Q-learning: non-increasing exploration rate
//! - IRT: monotone response probability, 2PL midpoint
//! - SPI: component ranges

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

use spi_analytics::analytics::decision::{
    Experience, PidDifficultyController, QLearningPolicy, TutorAction,
};
use spi_analytics::analytics::modeling::{
    BayesianMasteryTracker, HiddenMarkovModel, IrtCalibrator, IrtConfig, IrtModel, ItemParameters,
    KalmanSmoother,
};
use spi_analytics::analytics::SpiComposer;

// ============================================================================
// Generators
// ============================================================================

fn arb_score() -> impl Strategy<Value = f64> {
    (0u32..=1000u32).prop_map(|v| v as f64 / 10.0)
}

fn arb_item() -> impl Strategy<Value = ItemParameters> {
    (-2.5f64..=2.5, 0.5f64..=2.5, 0.0f64..=0.3)
        .prop_map(|(b, a, c)| ItemParameters::new(b, a, c))
}

fn arb_symbols() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(0usize..3, 2..40)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_kalman_converges_to_constant(z in arb_score()) {
        let kalman = KalmanSmoother::default();
        let mut state = kalman.initial_state();
        let mut previous = f64::INFINITY;
        for _ in 0..30 {
            kalman.update(&mut state, z);
            let u = kalman.uncertainty(&state);
            prop_assert!(u >= 0.0);
            prop_assert!(u <= previous + 1e-12);
            previous = u;
        }
        prop_assert!((state.estimate - z).abs() < 1.0);
        let floor = kalman.steady_state_uncertainty();
        prop_assert!((previous - floor).abs() <= 0.1 * floor);
    }

    #[test]
    fn prop_baum_welch_rows_are_stochastic(symbols in arb_symbols()) {
        let hmm = HiddenMarkovModel::default();
        let state = hmm.initial_state();
        let report = hmm.baum_welch(&state.parameters, &symbols).unwrap();
        let params = &report.parameters;

        let rows = std::iter::once(&params.initial)
            .chain(params.transition.iter())
            .chain(params.emission.iter());
        for row in rows {
            let total: f64 = row.iter().sum();
            prop_assert!((total - 1.0).abs() < 1e-9);
            prop_assert!(row.iter().all(|p| *p >= 0.0));
        }

        let path = HiddenMarkovModel::viterbi(params, &symbols);
        prop_assert_eq!(path.len(), symbols.len());
    }

    #[test]
    fn prop_mastery_monotone_and_bounded(steps in 1usize..60, start in 0.05f64..=0.95) {
        let tracker = BayesianMasteryTracker::default();
        let (lo, hi) = (tracker.config().min_mastery, tracker.config().max_mastery);

        let mut up = start;
        let mut down = start;
        for _ in 0..steps {
            let next_up = tracker.update_mastery(up, true);
            let next_down = tracker.update_mastery(down, false);
            prop_assert!(next_up >= up && next_up <= hi);
            prop_assert!(next_down <= down && next_down >= lo);
            if up < hi {
                prop_assert!(next_up > up || next_up == hi);
            }
            if down > lo {
                prop_assert!(next_down < down || next_down == lo);
            }
            up = next_up;
            down = next_down;
        }
    }

    #[test]
    fn prop_pid_integral_stays_bounded(scores in prop::collection::vec(arb_score(), 1..80)) {
        let pid = PidDifficultyController::default();
        let config = pid.config().clone();
        let mut state = pid.initial_state();
        for score in scores {
            let before = state.output;
            let out = pid.update(&mut state, score);
            prop_assert!(state.integral >= config.integral_min);
            prop_assert!(state.integral <= config.integral_max);
            prop_assert!(out.multiplier >= config.output_min && out.multiplier <= config.output_max);
            if out.held {
                prop_assert_eq!(out.multiplier, before);
            }
        }
    }

    #[test]
    fn prop_epsilon_never_increases(rewards in prop::collection::vec(-2.0f64..2.0, 1..60), seed in any::<u64>()) {
        let policy = QLearningPolicy::default();
        let mut q = policy.initial_state();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut previous = q.epsilon;
        for (i, reward) in rewards.into_iter().enumerate() {
            let experience = Experience {
                state: format!("s{}", i % 3),
                action: TutorAction::ALL[i % TutorAction::ALL.len()],
                reward,
                next_state: format!("s{}", (i + 1) % 3),
            };
            let out = policy.learn(&mut q, experience, &mut rng);
            prop_assert!(out.epsilon <= previous);
            previous = out.epsilon;
        }
    }

    #[test]
    fn prop_irt_probability_monotone(item in arb_item(), t1 in -3.0f64..3.0, dt in 0.0f64..3.0) {
        for model in [IrtModel::OneParameter, IrtModel::TwoParameter, IrtModel::ThreeParameter] {
            let irt = IrtCalibrator::new(IrtConfig { model, ..IrtConfig::default() });
            let p1 = irt.probability(t1, &item);
            let p2 = irt.probability(t1 + dt, &item);
            prop_assert!(p1 <= p2);
            prop_assert!((0.0..=1.0).contains(&p1));
        }
    }

    #[test]
    fn prop_two_pl_midpoint(item in arb_item()) {
        let irt = IrtCalibrator::new(IrtConfig { model: IrtModel::TwoParameter, ..IrtConfig::default() });
        prop_assert_eq!(irt.probability(item.difficulty, &item), 0.5);
    }

    #[test]
    fn prop_spi_components_in_range(scores in prop::collection::vec(arb_score(), 1..50)) {
        let composer = SpiComposer::default();
        let c = composer.components(&scores).unwrap();
        prop_assert!((0.0..=100.0).contains(&c.accuracy));
        prop_assert!((0.0..=100.0).contains(&c.consistency));
        prop_assert!(c.improvement.abs() <= 50.0);
        let raw = composer.raw_index(&c);
        prop_assert!((-7.5..=75.0).contains(&raw));
    }
}

#[test]
fn test_single_observation_viterbi_is_argmax() {
    let hmm = HiddenMarkovModel::default();
    let params = hmm.initial_state().parameters;
    for symbol in 0..3 {
        let expected = (0..params.state_count())
            .fold(0, |best, s| {
                let score = params.initial[s] * params.emission[s][symbol];
                if score > params.initial[best] * params.emission[best][symbol] {
                    s
                } else {
                    best
                }
            });
        assert_eq!(HiddenMarkovModel::viterbi(&params, &[symbol]), vec![expected]);
    }
}
