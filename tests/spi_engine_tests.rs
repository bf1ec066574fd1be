//! End-to-end tests for the analytics engine over in-memory and faulty stores.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{evaluate, memory_engine, observation, FailingModelStore, SlowModelStore};
use spi_analytics::analytics::modeling::{ItemBankEntry, ItemParameters, KalmanSmoother, ScoredResponse};
use spi_analytics::analytics::spi::NO_DATA_STATE;
use spi_analytics::analytics::{
    AnalyticsConfig, AnalyticsEngine, AnalyticsError, InMemoryAssessmentStore, InMemoryModelStore,
    LearningState,
};

fn rank(label: &str) -> usize {
    LearningState::parse(label).map(|s| s.index()).unwrap()
}

#[tokio::test]
async fn test_no_assessments_yields_no_data() {
    let (engine, _) = memory_engine();
    let result = engine.compose_spi("fresh").await.unwrap();

    assert_eq!(result.spi, 0.0);
    assert_eq!(result.learning_state, NO_DATA_STATE);
    assert!(result.concept_mastery.is_empty());
    assert!(!engine.kalman_statistics("fresh").await.unwrap().is_initialized());
    assert!(engine.spi_history("fresh", None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_ascending_scores_raise_learning_state() {
    let (engine, assessments) = memory_engine();
    let mut results = Vec::new();
    for (i, score) in (50..=95).step_by(5).enumerate() {
        let obs = observation("s1", i as i64 * 10, score as f64);
        results.push(evaluate(&engine, &assessments, obs).await);
    }

    let first = results.first().unwrap();
    let last = results.last().unwrap();
    assert!(rank(&last.learning_state) > rank(&first.learning_state));
    assert!(last.components.unwrap().improvement > 0.0);
    assert_eq!(last.assessment_count, 10);
    assert!(last.concept_mastery["algebra"] > 0.3);
}

#[tokio::test]
async fn test_constant_scores_settle_kalman() {
    let (engine, assessments) = memory_engine();
    let mut last = None;
    for i in 0..25 {
        last = Some(evaluate(&engine, &assessments, observation("s1", i, 70.0)).await);
    }
    let last = last.unwrap();

    assert!((last.spi - last.raw_index).abs() < 1.0);
    let floor = KalmanSmoother::new(engine.config().kalman.clone()).steady_state_uncertainty();
    assert!((last.uncertainty - floor).abs() <= 0.1 * floor);

    let stats = engine.kalman_statistics("s1").await.unwrap();
    assert_eq!(stats.ready().unwrap().update_count, 25);
}

#[tokio::test]
async fn test_unavailable_store_degrades_instead_of_failing() {
    let assessments = Arc::new(InMemoryAssessmentStore::new());
    let engine = AnalyticsEngine::new(
        AnalyticsConfig::default(),
        Arc::clone(&assessments),
        Arc::new(FailingModelStore),
    )
    .unwrap();

    let result = evaluate(&engine, &assessments, observation("s1", 0, 80.0)).await;
    assert_eq!(result.spi, result.raw_index);
    assert_eq!(result.learning_state, "learning");
    assert!(result.concept_mastery.is_empty());
    for name in ["kalman", "hmm", "belief", "spi_history"] {
        assert!(result.degraded.iter().any(|d| d == name), "missing {name}");
    }

    let rec = engine.recommend_difficulty("s1", 70.0).await.unwrap();
    assert!(!rec.persisted);

    let err = engine.kalman_statistics("s1").await.unwrap_err();
    assert!(err.is_store());

    let store = engine
        .metrics()
        .into_iter()
        .find(|s| s.id == "io_store")
        .unwrap();
    assert!(store.error_count > 0);
}

#[tokio::test]
async fn test_slow_store_times_out() {
    let config = AnalyticsConfig {
        store_timeout_ms: 20,
        ..AnalyticsConfig::default()
    };
    let assessments = Arc::new(InMemoryAssessmentStore::new());
    let engine = AnalyticsEngine::new(
        config,
        Arc::clone(&assessments),
        Arc::new(SlowModelStore {
            inner: InMemoryModelStore::new(),
            delay: Duration::from_millis(300),
        }),
    )
    .unwrap();

    let result = evaluate(&engine, &assessments, observation("s1", 0, 65.0)).await;
    assert!(result.degraded.iter().any(|d| d == "kalman"));

    let err = engine.hmm_statistics("s1").await.unwrap_err();
    assert!(matches!(
        err,
        AnalyticsError::Store(spi_analytics::analytics::StoreError::Timeout(20))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_for_one_student_are_serialized() {
    let (engine, assessments) = memory_engine();
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for i in 0..12 {
        let obs = observation("s1", i, 60.0 + i as f64);
        assessments.insert(obs.clone());
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            engine.on_assessment_evaluated(&obs).await
        }));
    }
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert!(result.degraded.is_empty(), "degraded: {:?}", result.degraded);
    }

    let kalman = engine.kalman_statistics("s1").await.unwrap();
    assert_eq!(kalman.ready().unwrap().update_count, 12);
    let beliefs = engine.belief_statistics("s1").await.unwrap();
    assert_eq!(beliefs.ready().unwrap().concepts["algebra"].attempts, 12);
    assert_eq!(engine.spi_history("s1", None).await.unwrap().len(), 12);
}

#[tokio::test]
async fn test_students_are_independent() {
    let (engine, assessments) = memory_engine();
    evaluate(&engine, &assessments, observation("a", 0, 90.0)).await;
    evaluate(&engine, &assessments, observation("b", 0, 20.0)).await;

    let a = engine.belief_statistics("a").await.unwrap().into_ready().unwrap();
    let b = engine.belief_statistics("b").await.unwrap().into_ready().unwrap();
    assert!(a.concepts["algebra"].mastery > b.concepts["algebra"].mastery);
    assert_eq!(engine.spi_history("a", None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_queries_report_not_initialized() {
    let (engine, _) = memory_engine();
    let id = "nobody";
    assert!(!engine.kalman_statistics(id).await.unwrap().is_initialized());
    assert!(!engine.hmm_statistics(id).await.unwrap().is_initialized());
    assert!(!engine.belief_statistics(id).await.unwrap().is_initialized());
    assert!(!engine.mastery_distribution(id).await.unwrap().is_initialized());
    assert!(!engine.difficulty_statistics(id).await.unwrap().is_initialized());
    assert!(!engine.policy_statistics(id).await.unwrap().is_initialized());
    assert!(!engine.ability_statistics(id).await.unwrap().is_initialized());
    assert!(!engine.attention_statistics(id).await.unwrap().is_initialized());
    assert!(!engine.meta_statistics(id).await.unwrap().is_initialized());
    assert!(engine.competency_states(id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_competencies_tracked_separately() {
    let (engine, assessments) = memory_engine();
    let obs = observation("s1", 0, 85.0).with_competencies(["algebra", "geometry"]);
    let result = evaluate(&engine, &assessments, obs).await;
    assert_eq!(result.concept_mastery.len(), 2);

    let states = engine.competency_states("s1").await.unwrap();
    let names: Vec<&str> = states.keys().map(String::as_str).collect();
    assert_eq!(names, vec!["algebra", "geometry"]);

    let summaries = engine.mastery_distribution("s1").await.unwrap().into_ready().unwrap();
    assert_eq!(summaries.len(), 2);
}

#[tokio::test]
async fn test_difficulty_follows_miss_rate() {
    let (engine, _) = memory_engine();
    let mut last = None;
    for _ in 0..5 {
        last = Some(engine.recommend_difficulty("s1", 100.0).await.unwrap());
    }
    let harder = last.unwrap();
    assert!(harder.multiplier > 1.0);

    engine.reset_difficulty_controller("s1").await.unwrap();
    let stats = engine.difficulty_statistics("s1").await.unwrap().into_ready().unwrap();
    assert_eq!(stats.update_count, 0);
    assert_eq!(stats.output, 1.0);
}

#[tokio::test]
async fn test_next_item_uses_recorded_ability() {
    let (engine, _) = memory_engine();
    let easy = ItemParameters::new(-1.0, 1.0, 0.0);
    let responses: Vec<ScoredResponse> = [100.0, 100.0, 100.0, 0.0]
        .iter()
        .map(|s| ScoredResponse::from_score(easy, *s))
        .collect();
    let estimate = engine.estimate_ability("s1", &responses).await.unwrap();
    assert!(estimate.theta > -1.0);

    let bank: Vec<ItemBankEntry> = [-2.0, 0.0, 2.0]
        .iter()
        .enumerate()
        .map(|(i, b)| ItemBankEntry {
            id: format!("item-{i}"),
            parameters: ItemParameters::new(*b, 1.2, 0.0),
        })
        .collect();
    let mut administered = HashSet::new();
    let first = engine
        .next_item("s1", &bank, &administered)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.id, "item-1");

    administered.insert(first.id);
    let second = engine.next_item("s1", &bank, &administered).await.unwrap();
    assert!(second.is_some());
}

#[tokio::test]
async fn test_calibration_without_enough_responses_errors() {
    let (engine, _) = memory_engine();
    let err = engine
        .calibrate_items(&std::collections::BTreeMap::new())
        .unwrap_err();
    assert!(matches!(err, AnalyticsError::InsufficientData { .. }));
}

#[tokio::test]
async fn test_action_recommendation_and_feedback() {
    let (engine, assessments) = memory_engine();
    for (minute, score) in [(0, 45.0), (120, 55.0)] {
        evaluate(&engine, &assessments, observation("s1", minute, score)).await;
    }
    let choice = engine.recommend_action("s1").await.unwrap();
    assert!(choice.state.starts_with("developing|"));

    let outcome = observation("s1", 240, 75.0);
    assessments.insert(outcome.clone());
    let feedback = engine
        .learn_from_outcome("s1", choice.action, &outcome)
        .await
        .unwrap();
    assert_eq!(feedback.state, choice.state);
    assert!(feedback.learned.q_value > 0.0);
}
