use std::collections::BTreeMap;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONCEPT: &str = "general";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentObservation {
    pub student_id: String,
    pub score: f64,
    #[serde(default)]
    pub competencies: Vec<String>,
    #[serde(default = "default_difficulty_tag")]
    pub difficulty_tag: String,
    /// Seconds spent on the assessment.
    #[serde(default)]
    pub time_taken: f64,
    pub timestamp: DateTime<Utc>,
}

fn default_difficulty_tag() -> String {
    DifficultyLevel::Medium.as_str().to_string()
}

impl AssessmentObservation {
    pub fn new(student_id: impl Into<String>, score: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            student_id: student_id.into(),
            score,
            competencies: Vec::new(),
            difficulty_tag: default_difficulty_tag(),
            time_taken: 0.0,
            timestamp,
        }
    }

    pub fn with_competencies<I, S>(mut self, competencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.competencies = competencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_difficulty(mut self, difficulty: DifficultyLevel) -> Self {
        self.difficulty_tag = difficulty.as_str().to_string();
        self
    }

    pub fn with_time_taken(mut self, seconds: f64) -> Self {
        self.time_taken = seconds;
        self
    }

    pub fn clamped_score(&self) -> f64 {
        if self.score.is_finite() {
            self.score.clamp(0.0, 100.0)
        } else {
            0.0
        }
    }

    pub fn difficulty(&self) -> DifficultyLevel {
        DifficultyLevel::parse(&self.difficulty_tag)
    }

    pub fn hour_of_day(&self) -> u32 {
        self.timestamp.hour()
    }

    /// Concepts this observation is evidence for; falls back to `general`.
    pub fn concepts(&self) -> Vec<String> {
        let concepts: Vec<String> = self
            .competencies
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        if concepts.is_empty() {
            vec![DEFAULT_CONCEPT.to_string()]
        } else {
            concepts
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Default)]
pub enum DifficultyLevel {
    VeryEasy,
    Easy,
    #[default]
    Medium,
    Hard,
    VeryHard,
}

impl DifficultyLevel {
    pub const ALL: [DifficultyLevel; 5] = [
        Self::VeryEasy,
        Self::Easy,
        Self::Medium,
        Self::Hard,
        Self::VeryHard,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VeryEasy => "very_easy",
            Self::Easy => "easy",
            Self::Medium => "medium",
            Self::Hard => "hard",
            Self::VeryHard => "very_hard",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "very_easy" | "veryeasy" => Self::VeryEasy,
            "easy" | "beginner" => Self::Easy,
            "hard" | "advanced" => Self::Hard,
            "very_hard" | "veryhard" | "expert" => Self::VeryHard,
            _ => Self::Medium,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Self::VeryEasy => 0,
            Self::Easy => 1,
            Self::Medium => 2,
            Self::Hard => 3,
            Self::VeryHard => 4,
        }
    }

    /// Difficulty multiplier this level stands for in the PID output space.
    pub fn nominal_multiplier(&self) -> f64 {
        match self {
            Self::VeryEasy => 0.6,
            Self::Easy => 0.8,
            Self::Medium => 1.0,
            Self::Hard => 1.2,
            Self::VeryHard => 1.4,
        }
    }

    pub fn harder(&self) -> Self {
        Self::ALL[(self.index() + 1).min(Self::ALL.len() - 1)]
    }

    pub fn easier(&self) -> Self {
        Self::ALL[self.index().saturating_sub(1)]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningState {
    Struggling,
    Learning,
    Proficient,
    Mastery,
}

impl LearningState {
    pub const ALL: [LearningState; 4] = [
        Self::Struggling,
        Self::Learning,
        Self::Proficient,
        Self::Mastery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Struggling => "struggling",
            Self::Learning => "learning",
            Self::Proficient => "proficient",
            Self::Mastery => "mastery",
        }
    }

    pub fn from_index(idx: usize) -> Option<Self> {
        Self::ALL.get(idx).copied()
    }

    pub fn index(&self) -> usize {
        match self {
            Self::Struggling => 0,
            Self::Learning => 1,
            Self::Proficient => 2,
            Self::Mastery => 3,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == s)
    }
}

/// Result of a statistics query: absent state is a normal answer, not an error.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum ModelStatus<T> {
    NotInitialized,
    Ready(T),
}

impl<T> ModelStatus<T> {
    pub fn is_initialized(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn ready(&self) -> Option<&T> {
        match self {
            Self::Ready(value) => Some(value),
            Self::NotInitialized => None,
        }
    }

    pub fn into_ready(self) -> Option<T> {
        match self {
            Self::Ready(value) => Some(value),
            Self::NotInitialized => None,
        }
    }
}

impl<T> From<Option<T>> for ModelStatus<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::NotInitialized, Self::Ready)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpiHistoryEntry {
    pub id: String,
    pub student_id: String,
    pub spi: f64,
    pub raw_index: f64,
    pub uncertainty: f64,
    pub learning_state: String,
    pub concept_mastery: BTreeMap<String, f64>,
    pub assessment_count: usize,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_difficulty_parse_aliases() {
        assert_eq!(DifficultyLevel::parse("Very-Easy"), DifficultyLevel::VeryEasy);
        assert_eq!(DifficultyLevel::parse("hard"), DifficultyLevel::Hard);
        assert_eq!(DifficultyLevel::parse("mid"), DifficultyLevel::Medium);
        assert_eq!(DifficultyLevel::parse("???"), DifficultyLevel::Medium);
    }

    #[test]
    fn test_difficulty_neighbours_saturate() {
        assert_eq!(DifficultyLevel::VeryHard.harder(), DifficultyLevel::VeryHard);
        assert_eq!(DifficultyLevel::VeryEasy.easier(), DifficultyLevel::VeryEasy);
        assert_eq!(DifficultyLevel::Medium.harder(), DifficultyLevel::Hard);
    }

    #[test]
    fn test_concepts_fall_back_to_general() {
        let obs = AssessmentObservation::new("s1", 80.0, Utc::now()).with_competencies(["  "]);
        assert_eq!(obs.concepts(), vec![DEFAULT_CONCEPT.to_string()]);
    }

    #[test]
    fn test_observation_json_uses_camel_case() {
        let json = serde_json::json!({
            "studentId": "s1",
            "score": 72.5,
            "competencies": ["algebra"],
            "difficultyTag": "hard",
            "timeTaken": 300.0,
            "timestamp": "2026-01-01T10:00:00Z"
        });
        let obs: AssessmentObservation = serde_json::from_value(json).unwrap();
        assert_eq!(obs.student_id, "s1");
        assert_eq!(obs.difficulty(), DifficultyLevel::Hard);
        assert_eq!(obs.hour_of_day(), 10);
    }
}
