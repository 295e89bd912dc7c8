use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashMap;
use std::time::Instant;
use uuid::Uuid;
use validator::Validate;

use crate::database::Database;
use crate::errors::{classify_database_error, ApiError};
use crate::grading::{grade, Marking};
use crate::models::*;
use crate::{log_service_error, log_service_start, log_service_success, log_service_warn};

const SERVICE: &str = "attempt_service";

/// Drives a quiz attempt through NOT_STARTED -> IN_PROGRESS -> SUBMITTED.
///
/// Every state change is a single conditional write in the database, so
/// concurrent requests for the same attempt cannot both win.
#[derive(Clone)]
pub struct AttemptService {
    db: Database,
}

impl AttemptService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn start(&self, user_id: &str, quiz_id: Uuid) -> Result<StartedAttempt, ApiError> {
        self.start_at(user_id, quiz_id, Utc::now()).await
    }

    pub async fn start_at(
        &self,
        user_id: &str,
        quiz_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<StartedAttempt, ApiError> {
        log_service_start!(SERVICE, "start", quiz_id = quiz_id, user_id = user_id);

        let quiz = self.load_quiz(quiz_id).await?;

        if self.db.find_in_progress_attempt(user_id, quiz_id).await?.is_some() {
            return Err(ApiError::Conflict(
                "An attempt for this quiz is already in progress".to_string(),
            ));
        }

        if !quiz.is_open_at(now) {
            return Err(ApiError::Conflict(
                "Quiz is not available at this time".to_string(),
            ));
        }

        if let Some(max_attempts) = quiz.max_attempts {
            let submitted = self.db.count_submitted_attempts(user_id, quiz_id).await?;
            if submitted >= max_attempts {
                return Err(ApiError::Conflict(format!(
                    "Maximum number of attempts ({}) reached",
                    max_attempts
                )));
            }
        }

        // Losing a race against a concurrent start trips the in-progress index
        let attempt = self
            .db
            .begin_attempt(user_id, quiz_id, now)
            .await
            .map_err(|e| match classify_database_error(&e) {
                ApiError::Conflict(_) => ApiError::Conflict(
                    "An attempt for this quiz is already in progress".to_string(),
                ),
                other => other,
            })?;

        let details = self.db.get_quiz_questions(quiz_id).await?;
        let questions = present_questions(&quiz, attempt.id, &details);
        let deadline = attempt.started_at.and_then(|started| quiz.deadline_for(started));

        log_service_success!(
            SERVICE,
            "start",
            format!("attempt {} started with {} questions", attempt.id, questions.len())
        );

        Ok(StartedAttempt {
            attempt,
            deadline,
            questions,
        })
    }

    pub async fn answer(
        &self,
        user_id: &str,
        attempt_id: Uuid,
        request: SubmitAnswerRequest,
    ) -> Result<AnswerReceipt, ApiError> {
        self.answer_at(user_id, attempt_id, request, Utc::now()).await
    }

    /// Grade and store one answer. Re-answering a question overwrites the
    /// previous answer.
    pub async fn answer_at(
        &self,
        user_id: &str,
        attempt_id: Uuid,
        request: SubmitAnswerRequest,
        now: DateTime<Utc>,
    ) -> Result<AnswerReceipt, ApiError> {
        request.validate()?;
        let question_id = request
            .question_id
            .ok_or_else(|| ApiError::ValidationError("question_id is required".to_string()))?;
        let submitted = request
            .answer
            .map(SubmittedAnswer::into_raw)
            .filter(|raw| !raw.trim().is_empty())
            .ok_or_else(|| ApiError::ValidationError("answer is required".to_string()))?;

        let attempt = self
            .db
            .get_attempt(attempt_id)
            .await?
            .filter(|attempt| attempt.user_id == user_id && attempt.status == AttemptStatus::InProgress)
            .ok_or_else(|| {
                ApiError::NotFound(format!("No in-progress attempt with id '{}'", attempt_id))
            })?;

        let quiz = self.load_quiz(attempt.quiz_id).await?;

        if let Some(deadline) = attempt.started_at.and_then(|started| quiz.deadline_for(started)) {
            if now > deadline {
                log_service_warn!(SERVICE, "answer", format!("late answer for attempt {}", attempt_id));
                return Err(ApiError::InvalidState(
                    "The time limit for this attempt has expired".to_string(),
                ));
            }
        }

        let detail = self
            .db
            .get_quiz_question(quiz.id, question_id)
            .await?
            .ok_or_else(|| {
                ApiError::NotFound(format!(
                    "Question '{}' is not part of this quiz",
                    question_id
                ))
            })?;

        let result = grade(&detail.question, &submitted, Marking::for_quiz(&quiz, detail.points));

        // A submit that lands between the status check and this write wins
        let stored = self
            .db
            .upsert_answer(attempt_id, question_id, &submitted, result, now)
            .await?;
        if stored.is_none() {
            return Err(ApiError::InvalidState(
                "Attempt is no longer in progress".to_string(),
            ));
        }

        let reveal = quiz.check_answer_enabled;
        Ok(AnswerReceipt {
            attempt_id,
            question_id,
            is_correct: reveal.then_some(result.is_correct),
            points_earned: reveal.then_some(result.points_earned),
        })
    }

    pub async fn submit(&self, user_id: &str, attempt_id: Uuid) -> Result<QuizResult, ApiError> {
        self.submit_at(user_id, attempt_id, Utc::now()).await
    }

    /// Finalize an attempt. Submission is accepted even after the time limit;
    /// the result then reports `time_exceeded`. Answers are re-scored against
    /// the quiz's current point overrides, so admin edits made during the
    /// attempt are reflected in both the score and the total.
    pub async fn submit_at(
        &self,
        user_id: &str,
        attempt_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<QuizResult, ApiError> {
        let timer = Instant::now();
        log_service_start!(SERVICE, "submit", attempt_id = attempt_id);

        let attempt = self.owned_attempt(user_id, attempt_id).await?;
        if attempt.status != AttemptStatus::InProgress {
            return Err(ApiError::InvalidState(format!(
                "Attempt is {} and cannot be submitted",
                attempt.status.as_str()
            )));
        }

        let quiz = self.load_quiz(attempt.quiz_id).await?;
        let started_at = attempt.started_at.ok_or_else(|| {
            ApiError::InternalError(format!("Attempt {} is in progress without a start time", attempt_id))
        })?;
        let time_taken = (now - started_at).num_seconds().max(0);

        let submitted = match self.db.submit_attempt(attempt_id, time_taken, now).await
        {
            Ok(Some(attempt)) => attempt,
            Ok(None) => {
                return Err(ApiError::InvalidState(
                    "Attempt has already been submitted".to_string(),
                ))
            }
            Err(e) => {
                log_service_error!(SERVICE, "submit", attempt_id = attempt_id, error = e);
                return Err(ApiError::DatabaseError(e));
            }
        };

        let result = self.build_result(&quiz, &submitted).await?;
        log_service_success!(
            SERVICE,
            "submit",
            attempt_id = attempt_id,
            duration_ms = timer.elapsed().as_millis() as u64
        );
        Ok(result)
    }

    pub async fn get_result(&self, user_id: &str, attempt_id: Uuid) -> Result<QuizResult, ApiError> {
        let attempt = self.owned_attempt(user_id, attempt_id).await?;
        if attempt.status != AttemptStatus::Submitted {
            return Err(ApiError::InvalidState(
                "Results are available after the attempt is submitted".to_string(),
            ));
        }

        let quiz = self.load_quiz(attempt.quiz_id).await?;
        self.build_result(&quiz, &attempt).await
    }

    /// Everything needed to resume an attempt: questions in the attempt's
    /// order and the answers saved so far
    pub async fn get_attempt_view(
        &self,
        user_id: &str,
        attempt_id: Uuid,
    ) -> Result<AttemptView, ApiError> {
        let attempt = self.owned_attempt(user_id, attempt_id).await?;
        let quiz = self.load_quiz(attempt.quiz_id).await?;

        let details = self.db.get_quiz_questions(quiz.id).await?;
        let questions = present_questions(&quiz, attempt.id, &details);
        let answers = self
            .db
            .get_answers(attempt.id)
            .await?
            .into_iter()
            .map(|answer| SavedAnswer {
                question_id: answer.question_id,
                user_answer: answer.user_answer,
            })
            .collect();
        let deadline = attempt.started_at.and_then(|started| quiz.deadline_for(started));

        Ok(AttemptView {
            attempt,
            deadline,
            questions,
            answers,
        })
    }

    pub async fn list_user_quizzes(&self, user_id: &str) -> Result<Vec<UserQuizSummary>, ApiError> {
        self.list_user_quizzes_at(user_id, Utc::now()).await
    }

    pub async fn list_user_quizzes_at(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<UserQuizSummary>, ApiError> {
        let quizzes = self.db.list_enrolled_quizzes(user_id).await?;
        let mut summaries = Vec::with_capacity(quizzes.len());

        for quiz in quizzes {
            let attempts = self.db.find_attempts(user_id, quiz.id).await?;
            let question_count = self.db.get_quiz_questions(quiz.id).await?.len();

            let submitted: Vec<&Attempt> = attempts
                .iter()
                .filter(|a| a.status == AttemptStatus::Submitted)
                .collect();
            let has_in_progress = attempts.iter().any(|a| a.status == AttemptStatus::InProgress);
            let best_score = submitted
                .iter()
                .filter_map(|a| a.score)
                .fold(None, |best: Option<f64>, score| {
                    Some(best.map_or(score, |b| b.max(score)))
                });
            let last_attempt_date = submitted.iter().filter_map(|a| a.submitted_at).max();
            let under_limit = quiz
                .max_attempts
                .is_none_or(|max| (submitted.len() as i64) < max);

            summaries.push(UserQuizSummary {
                quiz_id: quiz.id,
                title: quiz.title.clone(),
                description: quiz.description.clone(),
                difficulty: quiz.difficulty,
                time_limit_minutes: quiz.time_limit_minutes,
                max_attempts: quiz.max_attempts,
                start_time: quiz.start_time,
                end_time: quiz.end_time,
                question_count,
                attempts: submitted.len(),
                best_score,
                last_attempt_date,
                has_in_progress,
                can_attempt: quiz.is_open_at(now) && !has_in_progress && under_limit,
            });
        }

        Ok(summaries)
    }

    async fn load_quiz(&self, quiz_id: Uuid) -> Result<Quiz, ApiError> {
        self.db
            .get_quiz(quiz_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("Quiz with id '{}' not found", quiz_id)))
    }

    /// Attempts belonging to someone else are reported as missing
    async fn owned_attempt(&self, user_id: &str, attempt_id: Uuid) -> Result<Attempt, ApiError> {
        self.db
            .get_attempt(attempt_id)
            .await?
            .filter(|attempt| attempt.user_id == user_id)
            .ok_or_else(|| ApiError::NotFound(format!("Attempt with id '{}' not found", attempt_id)))
    }

    async fn build_result(&self, quiz: &Quiz, attempt: &Attempt) -> Result<QuizResult, ApiError> {
        let score = attempt.score.unwrap_or(0.0);
        let total_points = attempt.total_points.unwrap_or(0.0);
        let time_exceeded = match (quiz.time_limit_minutes, attempt.time_taken_seconds) {
            (Some(limit), Some(taken)) => taken > limit * 60,
            _ => false,
        };

        let answers = if quiz.show_answers {
            let details = self.db.get_quiz_questions(quiz.id).await?;
            let mut saved: HashMap<Uuid, Answer> = self
                .db
                .get_answers(attempt.id)
                .await?
                .into_iter()
                .map(|answer| (answer.question_id, answer))
                .collect();

            Some(
                details
                    .into_iter()
                    .map(|detail| {
                        let answer = saved.remove(&detail.question.id);
                        AnswerReview {
                            question_id: detail.question.id,
                            title: detail.question.title,
                            content: detail.question.content,
                            options: detail.question.options,
                            is_correct: answer.as_ref().is_some_and(|a| a.is_correct),
                            points_earned: answer.as_ref().map_or(0.0, |a| a.points_earned),
                            user_answer: answer.map(|a| a.user_answer),
                            correct_answer: detail.question.correct_answer,
                            explanation: detail.question.explanation,
                        }
                    })
                    .collect(),
            )
        } else {
            None
        };

        Ok(QuizResult {
            attempt_id: attempt.id,
            quiz_id: quiz.id,
            quiz_title: quiz.title.clone(),
            score,
            total_points,
            percentage: percentage(score, total_points),
            time_taken_seconds: attempt.time_taken_seconds,
            time_exceeded,
            submitted_at: attempt.submitted_at,
            answers,
        })
    }
}

/// Questions in presentation order. Random-order quizzes are shuffled with a
/// generator seeded from the attempt id, so a resumed attempt sees the same
/// order it started with.
fn present_questions(
    quiz: &Quiz,
    attempt_id: Uuid,
    details: &[QuizQuestionDetail],
) -> Vec<PresentedQuestion> {
    let mut questions: Vec<PresentedQuestion> = details.iter().map(PresentedQuestion::from).collect();

    if quiz.random_order {
        let mut rng = StdRng::seed_from_u64(attempt_id.as_u64_pair().0);
        questions.shuffle(&mut rng);
    }

    questions
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn quiz(random_order: bool) -> Quiz {
        let now = Utc::now();
        Quiz {
            id: Uuid::new_v4(),
            title: "Ordering".to_string(),
            description: None,
            difficulty: DifficultyLevel::Easy,
            time_limit_minutes: None,
            max_attempts: None,
            negative_marking: false,
            negative_points: None,
            random_order,
            show_answers: false,
            check_answer_enabled: false,
            start_time: None,
            end_time: None,
            creator_id: "admin".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    fn details(count: usize) -> Vec<QuizQuestionDetail> {
        let now = Utc::now() - Duration::minutes(1);
        (0..count)
            .map(|i| QuizQuestionDetail {
                order_index: i as i64,
                points: 1.0,
                question: Question {
                    id: Uuid::new_v4(),
                    title: format!("Q{}", i),
                    content: format!("Question {}", i),
                    question_type: QuestionType::FillInBlank,
                    options: vec![],
                    correct_answer: AnswerKey::Single(i.to_string()),
                    explanation: None,
                    difficulty: DifficultyLevel::Easy,
                    points: 1.0,
                    is_active: true,
                    created_at: now,
                    updated_at: now,
                },
            })
            .collect()
    }

    fn ids(questions: &[PresentedQuestion]) -> Vec<Uuid> {
        questions.iter().map(|q| q.question_id).collect()
    }

    #[test]
    fn fixed_order_follows_assignment_order() {
        let details = details(5);
        let expected: Vec<Uuid> = details.iter().map(|d| d.question.id).collect();
        assert_eq!(ids(&present_questions(&quiz(false), Uuid::new_v4(), &details)), expected);
    }

    #[test]
    fn random_order_is_stable_per_attempt() {
        let details = details(12);
        let quiz = quiz(true);
        let attempt_id = Uuid::new_v4();

        let first = ids(&present_questions(&quiz, attempt_id, &details));
        let second = ids(&present_questions(&quiz, attempt_id, &details));
        assert_eq!(first, second);

        let mut sorted = first.clone();
        sorted.sort();
        let mut expected: Vec<Uuid> = details.iter().map(|d| d.question.id).collect();
        expected.sort();
        assert_eq!(sorted, expected);
    }
}
