//! JSON-lines replay of evaluated assessments through the trigger hook.
//!
//! Students replay concurrently; each student's observations are applied in
//! timestamp order.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tokio::io::AsyncReadExt;

use crate::analytics::{
    AnalyticsConfig, AnalyticsEngine, AnalyticsError, AssessmentObservation,
    InMemoryAssessmentStore, InMemoryModelStore, ModelStore, SpiResult,
};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("failed to read replay input: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Engine(#[from] AnalyticsError),
}

/// Blank lines and `#` comments are skipped.
pub fn parse_observations(input: &str) -> Result<Vec<AssessmentObservation>, ReplayError> {
    input
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(idx, line)| {
            serde_json::from_str(line).map_err(|source| ReplayError::Parse {
                line: idx + 1,
                source,
            })
        })
        .collect()
}

pub async fn load_observations(path: Option<&Path>) -> Result<Vec<AssessmentObservation>, ReplayError> {
    let input = match path {
        Some(path) => tokio::fs::read_to_string(path).await?,
        None => {
            let mut buf = String::new();
            tokio::io::stdin().read_to_string(&mut buf).await?;
            buf
        }
    };
    parse_observations(&input)
}

/// Final SPI per student. Observations the engine rejects are logged and skipped.
pub async fn replay<M: ModelStore>(
    engine: &AnalyticsEngine<InMemoryAssessmentStore, M>,
    assessments: &InMemoryAssessmentStore,
    observations: Vec<AssessmentObservation>,
) -> BTreeMap<String, SpiResult> {
    let mut by_student: BTreeMap<String, Vec<AssessmentObservation>> = BTreeMap::new();
    for observation in observations {
        by_student
            .entry(observation.student_id.clone())
            .or_default()
            .push(observation);
    }

    let runs = by_student.into_iter().map(|(student_id, mut list)| async move {
        list.sort_by_key(|o| o.timestamp);
        let mut last = None;
        for observation in list {
            assessments.insert(observation.clone());
            match engine.on_assessment_evaluated(&observation).await {
                Ok(result) => last = Some(result),
                Err(err) => {
                    tracing::warn!(student_id = %student_id, error = %err, "observation skipped");
                }
            }
        }
        last.map(|result| (student_id, result))
    });

    join_all(runs).await.into_iter().flatten().collect()
}

pub async fn run(input: Option<&Path>) -> Result<BTreeMap<String, SpiResult>, ReplayError> {
    let assessments = Arc::new(InMemoryAssessmentStore::new());
    let engine = AnalyticsEngine::new(
        AnalyticsConfig::from_env(),
        Arc::clone(&assessments),
        Arc::new(InMemoryModelStore::new()),
    )?;

    let observations = load_observations(input).await?;
    tracing::info!(observations = observations.len(), "replaying assessments");
    let results = replay(&engine, &assessments, observations).await;
    tracing::info!(students = results.len(), "replay complete");
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_skips_blank_and_comment_lines() {
        let input = r#"
# seeded
{"studentId":"s1","score":70,"timestamp":"2026-01-01T09:00:00Z"}

{"studentId":"s2","score":55,"timestamp":"2026-01-01T09:05:00Z"}
"#;
        let parsed = parse_observations(input).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].student_id, "s2");
    }

    #[test]
    fn test_parse_reports_line_number() {
        let input = "{\"studentId\":\"s1\",\"score\":70,\"timestamp\":\"2026-01-01T09:00:00Z\"}\nnot json";
        let err = parse_observations(input).unwrap_err();
        assert!(matches!(err, ReplayError::Parse { line: 2, .. }));
    }
}
