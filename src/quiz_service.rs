use chrono::Utc;
use std::collections::HashSet;
use uuid::Uuid;
use validator::Validate;

use crate::database::Database;
use crate::errors::{classify_database_error, ApiError};
use crate::models::*;
use crate::{log_service_start, log_service_success, log_service_warn, log_validation};

const SERVICE: &str = "quiz_service";

/// Administration of the question bank, quizzes, enrollment and site settings
#[derive(Clone)]
pub struct QuizService {
    db: Database,
}

impl QuizService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // Question bank

    pub async fn create_question(&self, request: CreateQuestionRequest) -> Result<Question, ApiError> {
        request.validate()?;

        let options = normalize_options(request.question_type, request.options);
        let correct_answer = request.correct_answer.normalized_for(request.question_type);
        validate_question_shape(request.question_type, &options, &correct_answer)?;

        let now = Utc::now();
        let question = Question {
            id: Uuid::new_v4(),
            title: request.title.trim().to_string(),
            content: request.content,
            question_type: request.question_type,
            options,
            correct_answer,
            explanation: request.explanation,
            difficulty: request.difficulty.unwrap_or_default(),
            points: request.points.unwrap_or(1.0),
            is_active: true,
            created_at: now,
            updated_at: now,
        };

        self.db.insert_question(&question).await?;
        log_service_success!(SERVICE, "create_question", format!("question {} created", question.id));
        Ok(question)
    }

    pub async fn get_question(&self, id: Uuid) -> Result<Question, ApiError> {
        self.db
            .get_question(id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("Question with id '{}' not found", id)))
    }

    pub async fn list_questions(&self, active: Option<bool>) -> Result<Vec<Question>, ApiError> {
        Ok(self.db.list_questions(active).await?)
    }

    /// Apply a partial update, then re-check the question's invariants as a whole
    pub async fn update_question(
        &self,
        id: Uuid,
        request: UpdateQuestionRequest,
    ) -> Result<Question, ApiError> {
        request.validate()?;
        let mut question = self.get_question(id).await?;

        if let Some(title) = request.title {
            question.title = title.trim().to_string();
        }
        if let Some(content) = request.content {
            question.content = content;
        }
        if let Some(question_type) = request.question_type {
            question.question_type = question_type;
        }
        if let Some(options) = request.options {
            question.options = options;
        }
        if let Some(correct_answer) = request.correct_answer {
            question.correct_answer = correct_answer;
        }
        if request.explanation.is_some() {
            question.explanation = request.explanation;
        }
        if let Some(difficulty) = request.difficulty {
            question.difficulty = difficulty;
        }
        if let Some(points) = request.points {
            question.points = points;
        }
        if let Some(is_active) = request.is_active {
            question.is_active = is_active;
        }

        question.options = normalize_options(question.question_type, question.options);
        question.correct_answer = question.correct_answer.normalized_for(question.question_type);
        validate_question_shape(question.question_type, &question.options, &question.correct_answer)?;

        question.updated_at = Utc::now();
        self.db.update_question(&question).await?;
        Ok(question)
    }

    pub async fn delete_question(&self, id: Uuid) -> Result<(), ApiError> {
        if !self.db.delete_question(id).await? {
            return Err(ApiError::NotFound(format!("Question with id '{}' not found", id)));
        }
        Ok(())
    }

    // Quizzes

    pub async fn create_quiz(
        &self,
        creator_id: &str,
        request: CreateQuizRequest,
    ) -> Result<Quiz, ApiError> {
        request.validate()?;

        let now = Utc::now();
        let quiz = Quiz {
            id: Uuid::new_v4(),
            title: request.title.trim().to_string(),
            description: request.description,
            difficulty: request.difficulty.unwrap_or_default(),
            time_limit_minutes: request.time_limit_minutes,
            max_attempts: request.max_attempts,
            negative_marking: request.negative_marking,
            negative_points: request.negative_points,
            random_order: request.random_order,
            show_answers: request.show_answers,
            check_answer_enabled: request.check_answer_enabled,
            start_time: request.start_time,
            end_time: request.end_time,
            creator_id: creator_id.to_string(),
            created_at: now,
            updated_at: now,
        };
        validate_quiz_window(&quiz)?;

        self.db.insert_quiz(&quiz).await?;
        log_service_success!(SERVICE, "create_quiz", format!("quiz {} created", quiz.id));
        Ok(quiz)
    }

    pub async fn get_quiz(&self, id: Uuid) -> Result<Quiz, ApiError> {
        self.db
            .get_quiz(id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("Quiz with id '{}' not found", id)))
    }

    pub async fn get_quiz_with_questions(&self, id: Uuid) -> Result<QuizWithQuestions, ApiError> {
        let quiz = self.get_quiz(id).await?;
        let questions = self.db.get_quiz_questions(id).await?;
        Ok(QuizWithQuestions { quiz, questions })
    }

    pub async fn list_quizzes(&self) -> Result<Vec<Quiz>, ApiError> {
        Ok(self.db.list_quizzes().await?)
    }

    pub async fn update_quiz(&self, id: Uuid, request: UpdateQuizRequest) -> Result<Quiz, ApiError> {
        request.validate()?;
        let mut quiz = self.get_quiz(id).await?;

        if let Some(title) = request.title {
            quiz.title = title.trim().to_string();
        }
        if request.description.is_some() {
            quiz.description = request.description;
        }
        if let Some(difficulty) = request.difficulty {
            quiz.difficulty = difficulty;
        }
        if request.time_limit_minutes.is_some() {
            quiz.time_limit_minutes = request.time_limit_minutes;
        }
        if request.max_attempts.is_some() {
            quiz.max_attempts = request.max_attempts;
        }
        if let Some(negative_marking) = request.negative_marking {
            quiz.negative_marking = negative_marking;
        }
        if request.negative_points.is_some() {
            quiz.negative_points = request.negative_points;
        }
        if let Some(random_order) = request.random_order {
            quiz.random_order = random_order;
        }
        if let Some(show_answers) = request.show_answers {
            quiz.show_answers = show_answers;
        }
        if let Some(check_answer_enabled) = request.check_answer_enabled {
            quiz.check_answer_enabled = check_answer_enabled;
        }
        if request.start_time.is_some() {
            quiz.start_time = request.start_time;
        }
        if request.end_time.is_some() {
            quiz.end_time = request.end_time;
        }
        validate_quiz_window(&quiz)?;

        quiz.updated_at = Utc::now();
        self.db.update_quiz(&quiz).await?;
        Ok(quiz)
    }

    pub async fn delete_quiz(&self, id: Uuid) -> Result<(), ApiError> {
        if !self.db.delete_quiz(id).await? {
            return Err(ApiError::NotFound(format!("Quiz with id '{}' not found", id)));
        }
        log_service_success!(SERVICE, "delete_quiz", format!("quiz {} deleted", id));
        Ok(())
    }

    // Question assignments

    pub async fn assign_question(
        &self,
        quiz_id: Uuid,
        request: AssignQuestionRequest,
    ) -> Result<QuizQuestion, ApiError> {
        request.validate()?;
        self.get_quiz(quiz_id).await?;
        let question = self.get_question(request.question_id).await?;

        if !question.is_active {
            return Err(ApiError::ValidationError(format!(
                "Question '{}' is inactive and cannot be assigned",
                question.id
            )));
        }

        if self.db.get_quiz_question(quiz_id, question.id).await?.is_some() {
            return Err(ApiError::Conflict(format!(
                "Question '{}' is already assigned to this quiz",
                question.id
            )));
        }

        let points = request.points.unwrap_or(question.points);
        self.db
            .add_quiz_question(quiz_id, question.id, points)
            .await
            .map_err(|e| classify_database_error(&e))
    }

    pub async fn update_assignment_points(
        &self,
        quiz_id: Uuid,
        question_id: Uuid,
        request: UpdateAssignmentRequest,
    ) -> Result<QuizQuestionDetail, ApiError> {
        request.validate()?;

        if !self
            .db
            .update_quiz_question_points(quiz_id, question_id, request.points)
            .await?
        {
            return Err(assignment_not_found(quiz_id, question_id));
        }

        self.db
            .get_quiz_question(quiz_id, question_id)
            .await?
            .ok_or_else(|| assignment_not_found(quiz_id, question_id))
    }

    pub async fn remove_question(&self, quiz_id: Uuid, question_id: Uuid) -> Result<(), ApiError> {
        if !self.db.remove_quiz_question(quiz_id, question_id).await? {
            return Err(assignment_not_found(quiz_id, question_id));
        }
        Ok(())
    }

    /// The new order must name every assigned question exactly once
    pub async fn reorder_questions(
        &self,
        quiz_id: Uuid,
        request: ReorderQuestionsRequest,
    ) -> Result<Vec<QuizQuestionDetail>, ApiError> {
        self.get_quiz(quiz_id).await?;
        let current = self.db.get_quiz_questions(quiz_id).await?;

        let assigned: HashSet<Uuid> = current.iter().map(|d| d.question.id).collect();
        let requested: HashSet<Uuid> = request.question_ids.iter().copied().collect();

        if requested.len() != request.question_ids.len() || requested != assigned {
            log_validation!(failure, "reorder_questions", error = "not a permutation of assigned questions");
            return Err(ApiError::ValidationError(
                "Question order must list every assigned question exactly once".to_string(),
            ));
        }

        self.db
            .reorder_quiz_questions(quiz_id, &request.question_ids)
            .await?;
        Ok(self.db.get_quiz_questions(quiz_id).await?)
    }

    pub async fn available_questions(&self, quiz_id: Uuid) -> Result<Vec<Question>, ApiError> {
        self.get_quiz(quiz_id).await?;
        Ok(self.db.list_available_questions(quiz_id).await?)
    }

    // Enrollment

    pub async fn enroll_users(
        &self,
        quiz_id: Uuid,
        request: EnrollUsersRequest,
    ) -> Result<EnrollmentOutcome, ApiError> {
        request.validate()?;
        self.get_quiz(quiz_id).await?;
        log_service_start!(SERVICE, "enroll_users");

        let mut seen = HashSet::new();
        let user_ids: Vec<String> = request
            .user_ids
            .iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .filter(|id| seen.insert(id.clone()))
            .collect();

        if user_ids.is_empty() {
            return Err(ApiError::ValidationError(
                "At least one user is required".to_string(),
            ));
        }

        let enrolled = self.db.enroll_users(quiz_id, &user_ids).await?;
        let already_enrolled: Vec<String> = user_ids
            .into_iter()
            .filter(|id| !enrolled.contains(id))
            .collect();

        if enrolled.is_empty() {
            log_service_warn!(SERVICE, "enroll_users", "all users were already enrolled");
            return Err(ApiError::ValidationError(
                "All selected users are already enrolled in this quiz".to_string(),
            ));
        }

        log_service_success!(
            SERVICE,
            "enroll_users",
            format!("{} users enrolled in quiz {}", enrolled.len(), quiz_id)
        );
        Ok(EnrollmentOutcome {
            enrolled,
            already_enrolled,
        })
    }

    pub async fn list_enrollments(&self, quiz_id: Uuid) -> Result<Vec<Enrollment>, ApiError> {
        self.get_quiz(quiz_id).await?;
        Ok(self.db.list_enrollments(quiz_id).await?)
    }

    pub async fn unenroll_user(&self, quiz_id: Uuid, user_id: &str) -> Result<(), ApiError> {
        if !self.db.unenroll_user(quiz_id, user_id).await? {
            return Err(ApiError::NotFound(format!(
                "User '{}' is not enrolled in quiz '{}'",
                user_id, quiz_id
            )));
        }
        Ok(())
    }

    // Analysis

    pub async fn leaderboard(&self, quiz_id: Uuid) -> Result<Vec<LeaderboardEntry>, ApiError> {
        self.get_quiz(quiz_id).await?;
        let attempts = self.db.leaderboard(quiz_id).await?;

        Ok(attempts
            .into_iter()
            .enumerate()
            .map(|(index, attempt)| LeaderboardEntry {
                rank: index + 1,
                attempt_id: attempt.id,
                user_id: attempt.user_id,
                score: attempt.score.unwrap_or(0.0),
                total_points: attempt.total_points.unwrap_or(0.0),
                time_taken_seconds: attempt.time_taken_seconds.unwrap_or(0),
                submitted_at: attempt.submitted_at,
            })
            .collect())
    }

    pub async fn result_matrix(&self, quiz_id: Uuid) -> Result<Vec<ResultMatrixRow>, ApiError> {
        self.get_quiz(quiz_id).await?;
        let rows = self.db.result_matrix(quiz_id).await?;

        Ok(rows
            .into_iter()
            .map(|(attempt, answered, correct)| ResultMatrixRow {
                attempt_id: attempt.id,
                user_id: attempt.user_id,
                status: attempt.status,
                score: attempt.score.unwrap_or(0.0),
                time_taken_seconds: attempt.time_taken_seconds.unwrap_or(0),
                errors: answered - correct,
                submitted_at: attempt.submitted_at,
            })
            .collect())
    }

    // Settings

    pub async fn get_settings(&self) -> Result<Settings, ApiError> {
        Ok(self.db.get_settings().await?)
    }

    pub async fn update_settings(&self, request: UpdateSettingsRequest) -> Result<Settings, ApiError> {
        request.validate()?;
        let mut settings = self.db.get_settings().await?;

        if let Some(site_title) = request.site_title {
            settings.site_title = site_title.trim().to_string();
        }
        if let Some(maintenance_mode) = request.maintenance_mode {
            settings.maintenance_mode = maintenance_mode;
        }
        settings.updated_at = Utc::now();

        self.db.update_settings(&settings).await?;
        log_service_success!(
            SERVICE,
            "update_settings",
            format!("maintenance mode {}", if settings.maintenance_mode { "on" } else { "off" })
        );
        Ok(settings)
    }
}

fn assignment_not_found(quiz_id: Uuid, question_id: Uuid) -> ApiError {
    ApiError::NotFound(format!(
        "Question '{}' is not assigned to quiz '{}'",
        question_id, quiz_id
    ))
}

/// Trim options; true/false questions get the canonical pair when none are
/// given, and fill-in-blank questions carry none.
fn normalize_options(question_type: QuestionType, options: Vec<String>) -> Vec<String> {
    let options: Vec<String> = options
        .into_iter()
        .map(|option| option.trim().to_string())
        .collect();

    match question_type {
        QuestionType::FillInBlank => Vec::new(),
        QuestionType::TrueFalse if options.is_empty() => {
            vec!["True".to_string(), "False".to_string()]
        }
        _ => options,
    }
}

fn validate_question_shape(
    question_type: QuestionType,
    options: &[String],
    key: &AnswerKey,
) -> Result<(), ApiError> {
    if options.iter().any(|option| option.is_empty()) {
        return Err(invalid_question("Options cannot be empty".to_string()));
    }
    let distinct: HashSet<&str> = options.iter().map(String::as_str).collect();
    if distinct.len() != options.len() {
        return Err(invalid_question("Options must be unique".to_string()));
    }

    let required = match question_type {
        QuestionType::MultipleChoice => Some((2, "at least 2")),
        QuestionType::MultiSelect => Some((3, "at least 3")),
        QuestionType::TrueFalse => Some((2, "exactly 2")),
        QuestionType::FillInBlank => None,
    };
    if let Some((min, label)) = required {
        let count_ok = match question_type {
            QuestionType::TrueFalse => options.len() == min,
            _ => options.len() >= min,
        };
        if !count_ok {
            return Err(invalid_question(format!(
                "{} questions need {} options",
                question_type.as_str(),
                label
            )));
        }
    }

    match (question_type, key) {
        (QuestionType::MultiSelect, AnswerKey::Multiple(set)) if set.is_empty() => {
            return Err(invalid_question("Multi-select questions need at least one correct option".to_string()));
        }
        (QuestionType::MultiSelect, AnswerKey::Single(_)) => {
            return Err(invalid_question("Multi-select questions need a set of correct options".to_string()));
        }
        (QuestionType::MultiSelect, _) => {}
        (_, AnswerKey::Single(value)) if value.trim().is_empty() => {
            return Err(invalid_question("Correct answer is required".to_string()));
        }
        (_, AnswerKey::Multiple(_)) => {
            return Err(invalid_question(format!(
                "{} questions take exactly one correct answer",
                question_type.as_str()
            )));
        }
        _ => {}
    }

    // Multi-select keys and answers are stored joined by the delimiter
    if question_type == QuestionType::MultiSelect {
        let joined = options.iter().map(String::as_str).chain(key.tokens());
        for value in joined {
            if value.contains(ANSWER_DELIMITER) {
                return Err(invalid_question(format!(
                    "Multi-select options cannot contain '{}': '{}'",
                    ANSWER_DELIMITER, value
                )));
            }
        }
    }

    if question_type.uses_options() {
        for token in key.tokens() {
            let present = match question_type {
                QuestionType::MultiSelect => options.iter().any(|option| option == token.trim()),
                _ => options
                    .iter()
                    .any(|option| option.eq_ignore_ascii_case(token.trim())),
            };
            if !present {
                return Err(invalid_question(format!("Correct answer '{}' is not one of the options", token)));
            }
        }
    }

    Ok(())
}

fn invalid_question(message: String) -> ApiError {
    log_validation!(failure, "question", error = message);
    ApiError::ValidationError(message)
}

fn validate_quiz_window(quiz: &Quiz) -> Result<(), ApiError> {
    if let (Some(start), Some(end)) = (quiz.start_time, quiz.end_time) {
        if start >= end {
            return Err(ApiError::ValidationError(
                "Quiz end time must be after its start time".to_string(),
            ));
        }
    }
    Ok(())
}
