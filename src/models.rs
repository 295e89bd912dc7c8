use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;
use validator::Validate;

/// Separator used for multi-valued answers at the storage edge and in raw submissions.
pub const ANSWER_DELIMITER: char = '|';

/// Split a delimiter-joined answer into its trimmed, non-empty tokens.
pub fn split_answer_tokens(raw: &str) -> BTreeSet<String> {
    raw.split(ANSWER_DELIMITER)
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuestionType {
    MultipleChoice,
    MultiSelect,
    TrueFalse,
    FillInBlank,
}

impl QuestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionType::MultipleChoice => "MULTIPLE_CHOICE",
            QuestionType::MultiSelect => "MULTI_SELECT",
            QuestionType::TrueFalse => "TRUE_FALSE",
            QuestionType::FillInBlank => "FILL_IN_BLANK",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "MULTIPLE_CHOICE" => Some(QuestionType::MultipleChoice),
            "MULTI_SELECT" => Some(QuestionType::MultiSelect),
            "TRUE_FALSE" => Some(QuestionType::TrueFalse),
            "FILL_IN_BLANK" => Some(QuestionType::FillInBlank),
            _ => None,
        }
    }

    /// Whether the correct answer must be drawn from the option list
    pub fn uses_options(&self) -> bool {
        !matches!(self, QuestionType::FillInBlank)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DifficultyLevel {
    Easy,
    #[default]
    Medium,
    Hard,
}

impl DifficultyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DifficultyLevel::Easy => "EASY",
            DifficultyLevel::Medium => "MEDIUM",
            DifficultyLevel::Hard => "HARD",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "EASY" => Some(DifficultyLevel::Easy),
            "MEDIUM" => Some(DifficultyLevel::Medium),
            "HARD" => Some(DifficultyLevel::Hard),
            _ => None,
        }
    }
}

/// The correct answer of a question.
///
/// Single-valued question types carry one expected string; multi-select
/// questions carry the full set of correct options. In JSON a key is either a
/// string or an array of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerKey {
    Single(String),
    Multiple(BTreeSet<String>),
}

impl AnswerKey {
    /// Coerce a key into the shape required by `question_type`.
    /// A `"A|C"` string given for a multi-select question becomes a set.
    pub fn normalized_for(self, question_type: QuestionType) -> Self {
        match (question_type, self) {
            (QuestionType::MultiSelect, AnswerKey::Single(raw)) => {
                AnswerKey::Multiple(split_answer_tokens(&raw))
            }
            (QuestionType::MultiSelect, AnswerKey::Multiple(set)) => AnswerKey::Multiple(
                set.iter()
                    .map(|token| token.trim())
                    .filter(|token| !token.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            (_, AnswerKey::Multiple(set)) if set.len() == 1 => {
                AnswerKey::Single(set.into_iter().next().unwrap_or_default())
            }
            (_, key) => key,
        }
    }

    /// Every token of the key, in set order for multi-valued keys.
    pub fn tokens(&self) -> Vec<&str> {
        match self {
            AnswerKey::Single(value) => vec![value.as_str()],
            AnswerKey::Multiple(set) => set.iter().map(String::as_str).collect(),
        }
    }

    pub fn token_set(&self) -> BTreeSet<String> {
        match self {
            AnswerKey::Single(value) => split_answer_tokens(value),
            AnswerKey::Multiple(set) => set.clone(),
        }
    }

    pub fn to_storage(&self) -> String {
        match self {
            AnswerKey::Single(value) => value.clone(),
            AnswerKey::Multiple(set) => set
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(&ANSWER_DELIMITER.to_string()),
        }
    }

    pub fn from_storage(question_type: QuestionType, raw: &str) -> Self {
        match question_type {
            QuestionType::MultiSelect => AnswerKey::Multiple(split_answer_tokens(raw)),
            _ => AnswerKey::Single(raw.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    pub question_type: QuestionType,
    pub options: Vec<String>,
    pub correct_answer: AnswerKey,
    pub explanation: Option<String>,
    pub difficulty: DifficultyLevel,
    pub points: f64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quiz {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub difficulty: DifficultyLevel,
    pub time_limit_minutes: Option<i64>,
    pub max_attempts: Option<i64>,
    pub negative_marking: bool,
    pub negative_points: Option<f64>,
    pub random_order: bool,
    pub show_answers: bool,
    pub check_answer_enabled: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub creator_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Quiz {
    /// Penalty applied to a wrong answer, if negative marking is on
    pub fn penalty(&self) -> Option<f64> {
        if self.negative_marking {
            Some(self.negative_points.unwrap_or(0.0))
        } else {
            None
        }
    }

    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        let started = self.start_time.is_none_or(|start| now >= start);
        let not_ended = self.end_time.is_none_or(|end| now <= end);
        started && not_ended
    }

    pub fn deadline_for(&self, started_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.time_limit_minutes
            .map(|minutes| started_at + Duration::minutes(minutes))
    }
}

/// A question's placement inside a quiz
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizQuestion {
    pub id: Uuid,
    pub quiz_id: Uuid,
    pub question_id: Uuid,
    pub order_index: i64,
    pub points: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizQuestionDetail {
    pub order_index: i64,
    pub points: f64,
    pub question: Question,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizWithQuestions {
    #[serde(flatten)]
    pub quiz: Quiz,
    pub questions: Vec<QuizQuestionDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub quiz_id: Uuid,
    pub user_id: String,
    pub enrolled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    NotStarted,
    InProgress,
    Submitted,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::NotStarted => "NOT_STARTED",
            AttemptStatus::InProgress => "IN_PROGRESS",
            AttemptStatus::Submitted => "SUBMITTED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "NOT_STARTED" => Some(AttemptStatus::NotStarted),
            "IN_PROGRESS" => Some(AttemptStatus::InProgress),
            "SUBMITTED" => Some(AttemptStatus::Submitted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub id: Uuid,
    pub user_id: String,
    pub quiz_id: Uuid,
    pub status: AttemptStatus,
    pub score: Option<f64>,
    pub total_points: Option<f64>,
    pub time_taken_seconds: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub id: Uuid,
    pub attempt_id: Uuid,
    pub question_id: Uuid,
    pub user_answer: String,
    pub is_correct: bool,
    pub points_earned: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub site_title: String,
    pub maintenance_mode: bool,
    pub updated_at: DateTime<Utc>,
}

// ----------------------------------------------------------------------------
// Requests
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateQuestionRequest {
    #[validate(length(min = 1, message = "Title is required"))]
    pub title: String,
    #[validate(length(min = 1, message = "Content is required"))]
    pub content: String,
    pub question_type: QuestionType,
    #[serde(default)]
    pub options: Vec<String>,
    pub correct_answer: AnswerKey,
    pub explanation: Option<String>,
    pub difficulty: Option<DifficultyLevel>,
    #[validate(range(exclusive_min = 0.0, message = "Points must be positive"))]
    pub points: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UpdateQuestionRequest {
    #[validate(length(min = 1, message = "Title cannot be empty"))]
    pub title: Option<String>,
    #[validate(length(min = 1, message = "Content cannot be empty"))]
    pub content: Option<String>,
    pub question_type: Option<QuestionType>,
    pub options: Option<Vec<String>>,
    pub correct_answer: Option<AnswerKey>,
    pub explanation: Option<String>,
    pub difficulty: Option<DifficultyLevel>,
    #[validate(range(exclusive_min = 0.0, message = "Points must be positive"))]
    pub points: Option<f64>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct CreateQuizRequest {
    #[validate(length(min = 1, message = "Title is required"))]
    pub title: String,
    pub description: Option<String>,
    pub difficulty: Option<DifficultyLevel>,
    #[validate(range(min = 1, message = "Time limit must be positive"))]
    pub time_limit_minutes: Option<i64>,
    #[validate(range(min = 1, message = "Max attempts must be positive"))]
    pub max_attempts: Option<i64>,
    #[serde(default)]
    pub negative_marking: bool,
    #[validate(range(min = 0.0, message = "Penalty cannot be negative"))]
    pub negative_points: Option<f64>,
    #[serde(default)]
    pub random_order: bool,
    #[serde(default)]
    pub show_answers: bool,
    #[serde(default)]
    pub check_answer_enabled: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UpdateQuizRequest {
    #[validate(length(min = 1, message = "Title cannot be empty"))]
    pub title: Option<String>,
    pub description: Option<String>,
    pub difficulty: Option<DifficultyLevel>,
    #[validate(range(min = 1, message = "Time limit must be positive"))]
    pub time_limit_minutes: Option<i64>,
    #[validate(range(min = 1, message = "Max attempts must be positive"))]
    pub max_attempts: Option<i64>,
    pub negative_marking: Option<bool>,
    #[validate(range(min = 0.0, message = "Penalty cannot be negative"))]
    pub negative_points: Option<f64>,
    pub random_order: Option<bool>,
    pub show_answers: Option<bool>,
    pub check_answer_enabled: Option<bool>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AssignQuestionRequest {
    pub question_id: Uuid,
    #[validate(range(exclusive_min = 0.0, message = "Points must be positive"))]
    pub points: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct UpdateAssignmentRequest {
    #[validate(range(exclusive_min = 0.0, message = "Points must be positive"))]
    pub points: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReorderQuestionsRequest {
    pub question_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EnrollUsersRequest {
    #[validate(length(min = 1, message = "At least one user is required"))]
    pub user_ids: Vec<String>,
}

/// A submitted answer as the client sends it: plain text, or a list of
/// selected options for multi-select questions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubmittedAnswer {
    Text(String),
    Choices(Vec<String>),
}

impl SubmittedAnswer {
    /// The raw string stored with the answer
    pub fn into_raw(self) -> String {
        match self {
            SubmittedAnswer::Text(text) => text,
            SubmittedAnswer::Choices(choices) => choices.join(&ANSWER_DELIMITER.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SubmitAnswerRequest {
    #[validate(required(message = "question_id is required"))]
    pub question_id: Option<Uuid>,
    pub answer: Option<SubmittedAnswer>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UpdateSettingsRequest {
    #[validate(length(min = 1, message = "Site title cannot be empty"))]
    pub site_title: Option<String>,
    pub maintenance_mode: Option<bool>,
}

// ----------------------------------------------------------------------------
// Responses
// ----------------------------------------------------------------------------

/// A question as shown to a quiz taker, without its answer key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresentedQuestion {
    pub question_id: Uuid,
    pub title: String,
    pub content: String,
    pub question_type: QuestionType,
    pub options: Vec<String>,
    pub points: f64,
}

impl From<&QuizQuestionDetail> for PresentedQuestion {
    fn from(detail: &QuizQuestionDetail) -> Self {
        Self {
            question_id: detail.question.id,
            title: detail.question.title.clone(),
            content: detail.question.content.clone(),
            question_type: detail.question.question_type,
            options: detail.question.options.clone(),
            points: detail.points,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartedAttempt {
    pub attempt: Attempt,
    pub deadline: Option<DateTime<Utc>>,
    pub questions: Vec<PresentedQuestion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedAnswer {
    pub question_id: Uuid,
    pub user_answer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptView {
    pub attempt: Attempt,
    pub deadline: Option<DateTime<Utc>>,
    pub questions: Vec<PresentedQuestion>,
    pub answers: Vec<SavedAnswer>,
}

/// Acknowledgement of a saved answer. Correctness is only revealed when the
/// quiz allows checking answers immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerReceipt {
    pub attempt_id: Uuid,
    pub question_id: Uuid,
    pub is_correct: Option<bool>,
    pub points_earned: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerReview {
    pub question_id: Uuid,
    pub title: String,
    pub content: String,
    pub options: Vec<String>,
    pub user_answer: Option<String>,
    pub correct_answer: AnswerKey,
    pub is_correct: bool,
    pub points_earned: f64,
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizResult {
    pub attempt_id: Uuid,
    pub quiz_id: Uuid,
    pub quiz_title: String,
    pub score: f64,
    pub total_points: f64,
    pub percentage: f64,
    pub time_taken_seconds: Option<i64>,
    pub time_exceeded: bool,
    pub submitted_at: Option<DateTime<Utc>>,
    pub answers: Option<Vec<AnswerReview>>,
}

pub fn percentage(score: f64, total_points: f64) -> f64 {
    if total_points > 0.0 {
        score / total_points * 100.0
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserQuizSummary {
    pub quiz_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub difficulty: DifficultyLevel,
    pub time_limit_minutes: Option<i64>,
    pub max_attempts: Option<i64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub question_count: usize,
    pub attempts: usize,
    pub best_score: Option<f64>,
    pub last_attempt_date: Option<DateTime<Utc>>,
    pub has_in_progress: bool,
    pub can_attempt: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentOutcome {
    pub enrolled: Vec<String>,
    pub already_enrolled: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub attempt_id: Uuid,
    pub user_id: String,
    pub score: f64,
    pub total_points: f64,
    pub time_taken_seconds: i64,
    pub submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMatrixRow {
    pub attempt_id: Uuid,
    pub user_id: String,
    pub status: AttemptStatus,
    pub score: f64,
    pub time_taken_seconds: i64,
    pub errors: i64,
    pub submitted_at: Option<DateTime<Utc>>,
}
