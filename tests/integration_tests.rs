use chrono::{Duration, Utc};
use quiz_platform::*;
use uuid::Uuid;

async fn setup() -> (QuizService, AttemptService) {
    let db = Database::new("sqlite::memory:").await.unwrap();
    (QuizService::new(db.clone()), AttemptService::new(db))
}

async fn choice_question(
    quizzes: &QuizService,
    options: &[&str],
    correct: &str,
    points: f64,
) -> Question {
    quizzes
        .create_question(CreateQuestionRequest {
            title: format!("Pick {}", correct),
            content: "Choose the right option".to_string(),
            question_type: QuestionType::MultipleChoice,
            options: options.iter().map(|o| o.to_string()).collect(),
            correct_answer: AnswerKey::Single(correct.to_string()),
            explanation: Some(format!("The answer is {}", correct)),
            difficulty: None,
            points: Some(points),
        })
        .await
        .unwrap()
}

async fn quiz_with(
    quizzes: &QuizService,
    request: CreateQuizRequest,
    questions: &[&Question],
) -> Quiz {
    let quiz = quizzes.create_quiz("admin-1", request).await.unwrap();
    for question in questions {
        quizzes
            .assign_question(
                quiz.id,
                AssignQuestionRequest {
                    question_id: question.id,
                    points: None,
                },
            )
            .await
            .unwrap();
    }
    quiz
}

fn titled(title: &str) -> CreateQuizRequest {
    CreateQuizRequest {
        title: title.to_string(),
        ..Default::default()
    }
}

fn answer(question_id: Uuid, value: &str) -> SubmitAnswerRequest {
    SubmitAnswerRequest {
        question_id: Some(question_id),
        answer: Some(SubmittedAnswer::Text(value.to_string())),
    }
}

#[tokio::test]
async fn test_full_attempt_lifecycle() {
    let (quizzes, attempts) = setup().await;
    let q1 = choice_question(&quizzes, &["3", "4"], "4", 1.0).await;
    let q2 = choice_question(&quizzes, &["Rome", "Paris"], "Paris", 2.0).await;
    let quiz = quiz_with(&quizzes, titled("Basics"), &[&q1, &q2]).await;

    let started = attempts.start("learner-1", quiz.id).await.unwrap();
    assert_eq!(started.attempt.status, AttemptStatus::InProgress);
    assert!(started.attempt.started_at.is_some());
    assert!(started.deadline.is_none());
    let order: Vec<Uuid> = started.questions.iter().map(|q| q.question_id).collect();
    assert_eq!(order, vec![q1.id, q2.id]);

    let attempt_id = started.attempt.id;
    let receipt = attempts
        .answer("learner-1", attempt_id, answer(q1.id, "4"))
        .await
        .unwrap();
    // Correctness stays hidden unless the quiz reveals it
    assert_eq!(receipt.is_correct, None);
    attempts
        .answer("learner-1", attempt_id, answer(q2.id, " paris "))
        .await
        .unwrap();

    let result = attempts.submit("learner-1", attempt_id).await.unwrap();
    assert_eq!(result.score, 3.0);
    assert_eq!(result.total_points, 3.0);
    assert_eq!(result.percentage, 100.0);
    assert!(!result.time_exceeded);
    assert!(result.answers.is_none());

    let fetched = attempts.get_result("learner-1", attempt_id).await.unwrap();
    assert_eq!(fetched.score, 3.0);
    assert_eq!(fetched.submitted_at, result.submitted_at);
}

#[tokio::test]
async fn test_second_start_without_submit_conflicts() {
    let (quizzes, attempts) = setup().await;
    let q = choice_question(&quizzes, &["A", "B"], "A", 1.0).await;
    let quiz = quiz_with(&quizzes, titled("Once"), &[&q]).await;

    attempts.start("learner-1", quiz.id).await.unwrap();
    let second = attempts.start("learner-1", quiz.id).await;
    assert!(matches!(second, Err(ApiError::Conflict(_))));

    // Another user is unaffected
    assert!(attempts.start("learner-2", quiz.id).await.is_ok());
}

#[tokio::test]
async fn test_submit_without_answers_scores_zero() {
    let (quizzes, attempts) = setup().await;
    let q1 = choice_question(&quizzes, &["A", "B"], "A", 2.5).await;
    let q2 = choice_question(&quizzes, &["C", "D"], "D", 4.0).await;
    let quiz = quiz_with(&quizzes, titled("Empty"), &[&q1, &q2]).await;

    let started = attempts.start("learner-1", quiz.id).await.unwrap();
    let result = attempts.submit("learner-1", started.attempt.id).await.unwrap();

    assert_eq!(result.score, 0.0);
    assert_eq!(result.total_points, 6.5);
    assert_eq!(result.percentage, 0.0);
}

#[tokio::test]
async fn test_second_submit_is_rejected_and_keeps_first_score() {
    let (quizzes, attempts) = setup().await;
    let q = choice_question(&quizzes, &["A", "B"], "A", 5.0).await;
    let quiz = quiz_with(&quizzes, titled("Twice"), &[&q]).await;

    let attempt_id = attempts.start("learner-1", quiz.id).await.unwrap().attempt.id;
    attempts
        .answer("learner-1", attempt_id, answer(q.id, "A"))
        .await
        .unwrap();
    let first = attempts.submit("learner-1", attempt_id).await.unwrap();
    assert_eq!(first.score, 5.0);

    let second = attempts.submit("learner-1", attempt_id).await;
    assert!(matches!(second, Err(ApiError::InvalidState(_))));

    let stored = attempts.get_result("learner-1", attempt_id).await.unwrap();
    assert_eq!(stored.score, 5.0);
    assert_eq!(stored.submitted_at, first.submitted_at);
}

#[tokio::test]
async fn test_negative_marking_scores() {
    let (quizzes, attempts) = setup().await;
    let q1 = choice_question(&quizzes, &["1", "2"], "1", 5.0).await;
    let q2 = choice_question(&quizzes, &["3", "4"], "3", 10.0).await;
    let quiz = quiz_with(
        &quizzes,
        CreateQuizRequest {
            title: "Penalised".to_string(),
            negative_marking: true,
            negative_points: Some(2.0),
            ..Default::default()
        },
        &[&q1, &q2],
    )
    .await;

    let attempt_id = attempts.start("learner-1", quiz.id).await.unwrap().attempt.id;
    attempts
        .answer("learner-1", attempt_id, answer(q1.id, "1"))
        .await
        .unwrap();
    attempts
        .answer("learner-1", attempt_id, answer(q2.id, "4"))
        .await
        .unwrap();

    let result = attempts.submit("learner-1", attempt_id).await.unwrap();
    assert_eq!(result.score, 3.0);
    assert_eq!(result.total_points, 15.0);
}

#[tokio::test]
async fn test_scores_may_go_negative() {
    let (quizzes, attempts) = setup().await;
    let q = choice_question(&quizzes, &["1", "2"], "1", 1.0).await;
    let quiz = quiz_with(
        &quizzes,
        CreateQuizRequest {
            title: "Harsh".to_string(),
            negative_marking: true,
            negative_points: Some(3.0),
            ..Default::default()
        },
        &[&q],
    )
    .await;

    let attempt_id = attempts.start("learner-1", quiz.id).await.unwrap().attempt.id;
    attempts
        .answer("learner-1", attempt_id, answer(q.id, "2"))
        .await
        .unwrap();
    let result = attempts.submit("learner-1", attempt_id).await.unwrap();
    assert_eq!(result.score, -3.0);
}

#[tokio::test]
async fn test_multi_select_grading_through_orchestrator() {
    let (quizzes, attempts) = setup().await;
    let q = quizzes
        .create_question(CreateQuestionRequest {
            title: "Primes".to_string(),
            content: "Select the primes".to_string(),
            question_type: QuestionType::MultiSelect,
            options: vec!["A".into(), "B".into(), "C".into()],
            correct_answer: AnswerKey::Single("A|C".to_string()),
            explanation: None,
            difficulty: Some(DifficultyLevel::Hard),
            points: Some(2.0),
        })
        .await
        .unwrap();
    assert_eq!(q.correct_answer.tokens(), vec!["A", "C"]);

    let quiz = quiz_with(
        &quizzes,
        CreateQuizRequest {
            title: "Selections".to_string(),
            check_answer_enabled: true,
            ..Default::default()
        },
        &[&q],
    )
    .await;
    let attempt_id = attempts.start("learner-1", quiz.id).await.unwrap().attempt.id;

    let right = attempts
        .answer("learner-1", attempt_id, answer(q.id, "C|A"))
        .await
        .unwrap();
    assert_eq!(right.is_correct, Some(true));
    assert_eq!(right.points_earned, Some(2.0));

    let choices = SubmitAnswerRequest {
        question_id: Some(q.id),
        answer: Some(SubmittedAnswer::Choices(vec!["A".to_string()])),
    };
    let partial = attempts.answer("learner-1", attempt_id, choices).await.unwrap();
    assert_eq!(partial.is_correct, Some(false));
    assert_eq!(partial.points_earned, Some(0.0));
}

#[tokio::test]
async fn test_reanswering_overwrites_previous_answer() {
    let (quizzes, attempts) = setup().await;
    let q = choice_question(&quizzes, &["A", "B"], "A", 1.0).await;
    let quiz = quiz_with(&quizzes, titled("Change of mind"), &[&q]).await;
    let attempt_id = attempts.start("learner-1", quiz.id).await.unwrap().attempt.id;

    attempts
        .answer("learner-1", attempt_id, answer(q.id, "B"))
        .await
        .unwrap();
    attempts
        .answer("learner-1", attempt_id, answer(q.id, "A"))
        .await
        .unwrap();

    let view = attempts.get_attempt_view("learner-1", attempt_id).await.unwrap();
    assert_eq!(view.answers.len(), 1);
    assert_eq!(view.answers[0].user_answer, "A");

    let result = attempts.submit("learner-1", attempt_id).await.unwrap();
    assert_eq!(result.score, 1.0);
}

#[tokio::test]
async fn test_answer_request_validation_and_lookup() {
    let (quizzes, attempts) = setup().await;
    let q = choice_question(&quizzes, &["A", "B"], "A", 1.0).await;
    let stray = choice_question(&quizzes, &["C", "D"], "C", 1.0).await;
    let quiz = quiz_with(&quizzes, titled("Lookups"), &[&q]).await;
    let attempt_id = attempts.start("learner-1", quiz.id).await.unwrap().attempt.id;

    let missing_question = SubmitAnswerRequest {
        question_id: None,
        answer: Some(SubmittedAnswer::Text("A".into())),
    };
    assert!(matches!(
        attempts.answer("learner-1", attempt_id, missing_question).await,
        Err(ApiError::ValidationError(_))
    ));

    assert!(matches!(
        attempts.answer("learner-1", attempt_id, answer(q.id, "   ")).await,
        Err(ApiError::ValidationError(_))
    ));

    assert!(matches!(
        attempts.answer("learner-1", attempt_id, answer(stray.id, "C")).await,
        Err(ApiError::NotFound(_))
    ));

    // Someone else's attempt looks like it does not exist
    assert!(matches!(
        attempts.answer("learner-2", attempt_id, answer(q.id, "A")).await,
        Err(ApiError::NotFound(_))
    ));
    assert!(matches!(
        attempts.submit("learner-2", attempt_id).await,
        Err(ApiError::NotFound(_))
    ));

    assert!(matches!(
        attempts.submit("learner-1", Uuid::new_v4()).await,
        Err(ApiError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_answers_after_submit_are_rejected() {
    let (quizzes, attempts) = setup().await;
    let q = choice_question(&quizzes, &["A", "B"], "A", 1.0).await;
    let quiz = quiz_with(&quizzes, titled("Closed"), &[&q]).await;
    let attempt_id = attempts.start("learner-1", quiz.id).await.unwrap().attempt.id;
    attempts.submit("learner-1", attempt_id).await.unwrap();

    assert!(matches!(
        attempts.answer("learner-1", attempt_id, answer(q.id, "A")).await,
        Err(ApiError::NotFound(_))
    ));
    let result = attempts.get_result("learner-1", attempt_id).await.unwrap();
    assert_eq!(result.score, 0.0);
}

#[tokio::test]
async fn test_start_policy_checks() {
    let (quizzes, attempts) = setup().await;
    let q = choice_question(&quizzes, &["A", "B"], "A", 1.0).await;

    assert!(matches!(
        attempts.start("learner-1", Uuid::new_v4()).await,
        Err(ApiError::NotFound(_))
    ));

    let limited = quiz_with(
        &quizzes,
        CreateQuizRequest {
            title: "One shot".to_string(),
            max_attempts: Some(1),
            ..Default::default()
        },
        &[&q],
    )
    .await;
    let attempt_id = attempts.start("learner-1", limited.id).await.unwrap().attempt.id;
    attempts.submit("learner-1", attempt_id).await.unwrap();
    assert!(matches!(
        attempts.start("learner-1", limited.id).await,
        Err(ApiError::Conflict(_))
    ));

    let now = Utc::now();
    let windowed = quiz_with(
        &quizzes,
        CreateQuizRequest {
            title: "Next week".to_string(),
            start_time: Some(now + Duration::days(7)),
            end_time: Some(now + Duration::days(8)),
            ..Default::default()
        },
        &[&q],
    )
    .await;
    assert!(matches!(
        attempts.start("learner-1", windowed.id).await,
        Err(ApiError::Conflict(_))
    ));
    assert!(attempts
        .start_at("learner-1", windowed.id, now + Duration::days(7) + Duration::hours(1))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_time_limit_rejects_late_answers_but_accepts_submit() {
    let (quizzes, attempts) = setup().await;
    let q = choice_question(&quizzes, &["A", "B"], "A", 1.0).await;
    let quiz = quiz_with(
        &quizzes,
        CreateQuizRequest {
            title: "Timed".to_string(),
            time_limit_minutes: Some(10),
            ..Default::default()
        },
        &[&q],
    )
    .await;

    let started_at = Utc::now();
    let started = attempts.start_at("learner-1", quiz.id, started_at).await.unwrap();
    let attempt_id = started.attempt.id;
    assert!(started.deadline.is_some());

    attempts
        .answer_at("learner-1", attempt_id, answer(q.id, "A"), started_at + Duration::minutes(5))
        .await
        .unwrap();

    let late = attempts
        .answer_at("learner-1", attempt_id, answer(q.id, "B"), started_at + Duration::minutes(11))
        .await;
    assert!(matches!(late, Err(ApiError::InvalidState(_))));

    let result = attempts
        .submit_at("learner-1", attempt_id, started_at + Duration::minutes(12))
        .await
        .unwrap();
    assert!(result.time_exceeded);
    assert_eq!(result.score, 1.0);
    assert!(result.time_taken_seconds.unwrap() >= 12 * 60 - 1);
}

#[tokio::test]
async fn test_enrollment_creates_pending_attempt_that_start_promotes() {
    let (quizzes, attempts) = setup().await;
    let q = choice_question(&quizzes, &["A", "B"], "A", 1.0).await;
    let quiz = quiz_with(&quizzes, titled("Enrolled"), &[&q]).await;

    let outcome = quizzes
        .enroll_users(
            quiz.id,
            EnrollUsersRequest {
                user_ids: vec!["learner-1".into(), "learner-2".into(), "learner-1".into()],
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.enrolled, vec!["learner-1", "learner-2"]);
    assert!(outcome.already_enrolled.is_empty());

    let matrix = quizzes.result_matrix(quiz.id).await.unwrap();
    assert_eq!(matrix.len(), 2);
    assert!(matrix.iter().all(|row| row.status == AttemptStatus::NotStarted));
    let pending = matrix
        .iter()
        .find(|row| row.user_id == "learner-1")
        .unwrap()
        .attempt_id;

    let started = attempts.start("learner-1", quiz.id).await.unwrap();
    assert_eq!(started.attempt.id, pending);

    let again = quizzes
        .enroll_users(
            quiz.id,
            EnrollUsersRequest {
                user_ids: vec!["learner-1".into(), "learner-2".into()],
            },
        )
        .await;
    assert!(matches!(again, Err(ApiError::ValidationError(_))));

    let mixed = quizzes
        .enroll_users(
            quiz.id,
            EnrollUsersRequest {
                user_ids: vec!["learner-2".into(), "learner-3".into()],
            },
        )
        .await
        .unwrap();
    assert_eq!(mixed.enrolled, vec!["learner-3"]);
    assert_eq!(mixed.already_enrolled, vec!["learner-2"]);

    let empty = quizzes
        .enroll_users(quiz.id, EnrollUsersRequest { user_ids: vec![] })
        .await;
    assert!(matches!(empty, Err(ApiError::ValidationError(_))));
}

#[tokio::test]
async fn test_unenroll_removes_pending_attempts_only() {
    let (quizzes, attempts) = setup().await;
    let q = choice_question(&quizzes, &["A", "B"], "A", 1.0).await;
    let quiz = quiz_with(&quizzes, titled("Roster"), &[&q]).await;

    quizzes
        .enroll_users(
            quiz.id,
            EnrollUsersRequest {
                user_ids: vec!["learner-1".into(), "learner-2".into()],
            },
        )
        .await
        .unwrap();
    let attempt_id = attempts.start("learner-1", quiz.id).await.unwrap().attempt.id;
    attempts.submit("learner-1", attempt_id).await.unwrap();

    quizzes.unenroll_user(quiz.id, "learner-1").await.unwrap();
    quizzes.unenroll_user(quiz.id, "learner-2").await.unwrap();

    let enrolled = quizzes.list_enrollments(quiz.id).await.unwrap();
    assert!(enrolled.is_empty());

    let matrix = quizzes.result_matrix(quiz.id).await.unwrap();
    assert_eq!(matrix.len(), 1);
    assert_eq!(matrix[0].status, AttemptStatus::Submitted);

    assert!(matches!(
        quizzes.unenroll_user(quiz.id, "learner-2").await,
        Err(ApiError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_leaderboard_and_result_matrix() {
    let (quizzes, attempts) = setup().await;
    let q1 = choice_question(&quizzes, &["A", "B"], "A", 2.0).await;
    let q2 = choice_question(&quizzes, &["C", "D"], "C", 3.0).await;
    let quiz = quiz_with(&quizzes, titled("Ranked"), &[&q1, &q2]).await;
    let now = Utc::now();

    // learner-1: 5 points, submitted second
    let a1 = attempts.start_at("learner-1", quiz.id, now).await.unwrap().attempt.id;
    attempts.answer_at("learner-1", a1, answer(q1.id, "A"), now).await.unwrap();
    attempts.answer_at("learner-1", a1, answer(q2.id, "C"), now).await.unwrap();

    // learner-2: 2 points, one wrong answer
    let a2 = attempts.start_at("learner-2", quiz.id, now).await.unwrap().attempt.id;
    attempts.answer_at("learner-2", a2, answer(q1.id, "A"), now).await.unwrap();
    attempts.answer_at("learner-2", a2, answer(q2.id, "D"), now).await.unwrap();

    // learner-3: 5 points, submitted first
    let a3 = attempts.start_at("learner-3", quiz.id, now).await.unwrap().attempt.id;
    attempts.answer_at("learner-3", a3, answer(q1.id, "A"), now).await.unwrap();
    attempts.answer_at("learner-3", a3, answer(q2.id, "C"), now).await.unwrap();

    attempts.submit_at("learner-3", a3, now + Duration::seconds(30)).await.unwrap();
    attempts.submit_at("learner-1", a1, now + Duration::seconds(60)).await.unwrap();
    attempts.submit_at("learner-2", a2, now + Duration::seconds(90)).await.unwrap();

    let board = quizzes.leaderboard(quiz.id).await.unwrap();
    let ranking: Vec<(usize, &str, f64)> = board
        .iter()
        .map(|e| (e.rank, e.user_id.as_str(), e.score))
        .collect();
    assert_eq!(
        ranking,
        vec![(1, "learner-3", 5.0), (2, "learner-1", 5.0), (3, "learner-2", 2.0)]
    );
    assert_eq!(board[0].time_taken_seconds, 30);

    let matrix = quizzes.result_matrix(quiz.id).await.unwrap();
    let learner_2 = matrix.iter().find(|row| row.user_id == "learner-2").unwrap();
    assert_eq!(learner_2.errors, 1);
    assert_eq!(learner_2.score, 2.0);
    let learner_3 = matrix.iter().find(|row| row.user_id == "learner-3").unwrap();
    assert_eq!(learner_3.errors, 0);
}

#[tokio::test]
async fn test_show_answers_includes_review() {
    let (quizzes, attempts) = setup().await;
    let q1 = choice_question(&quizzes, &["A", "B"], "A", 1.0).await;
    let q2 = choice_question(&quizzes, &["C", "D"], "C", 1.0).await;
    let quiz = quiz_with(
        &quizzes,
        CreateQuizRequest {
            title: "Review".to_string(),
            show_answers: true,
            ..Default::default()
        },
        &[&q1, &q2],
    )
    .await;

    let attempt_id = attempts.start("learner-1", quiz.id).await.unwrap().attempt.id;
    attempts
        .answer("learner-1", attempt_id, answer(q1.id, "B"))
        .await
        .unwrap();
    let result = attempts.submit("learner-1", attempt_id).await.unwrap();

    let review = result.answers.unwrap();
    assert_eq!(review.len(), 2);
    assert_eq!(review[0].question_id, q1.id);
    assert_eq!(review[0].user_answer.as_deref(), Some("B"));
    assert!(!review[0].is_correct);
    assert_eq!(review[0].correct_answer, AnswerKey::Single("A".into()));
    assert_eq!(review[0].explanation.as_deref(), Some("The answer is A"));
    assert_eq!(review[1].user_answer, None);
}

#[tokio::test]
async fn test_submit_scores_against_current_assignments() {
    let (quizzes, attempts) = setup().await;
    let q1 = choice_question(&quizzes, &["A", "B"], "A", 1.0).await;
    let q2 = choice_question(&quizzes, &["C", "D"], "C", 2.0).await;
    let q3 = choice_question(&quizzes, &["E", "F"], "E", 3.0).await;
    let quiz = quiz_with(
        &quizzes,
        CreateQuizRequest {
            title: "Edited mid-attempt".to_string(),
            show_answers: true,
            ..Default::default()
        },
        &[&q1, &q2, &q3],
    )
    .await;

    let attempt_id = attempts.start("learner-1", quiz.id).await.unwrap().attempt.id;
    for (question, value) in [(&q1, "A"), (&q2, "C"), (&q3, "E")] {
        attempts
            .answer("learner-1", attempt_id, answer(question.id, value))
            .await
            .unwrap();
    }

    quizzes
        .update_assignment_points(quiz.id, q2.id, UpdateAssignmentRequest { points: 5.0 })
        .await
        .unwrap();
    quizzes.remove_question(quiz.id, q3.id).await.unwrap();

    let result = attempts.submit("learner-1", attempt_id).await.unwrap();
    assert_eq!(result.total_points, 6.0);
    assert_eq!(result.score, 6.0);
    assert_eq!(result.percentage, 100.0);

    let review = result.answers.unwrap();
    assert_eq!(review.len(), 2);
    assert_eq!(review[1].question_id, q2.id);
    assert_eq!(review[1].points_earned, 5.0);
    let earned: f64 = review.iter().map(|r| r.points_earned).sum();
    assert_eq!(earned, result.score);

    let board = quizzes.leaderboard(quiz.id).await.unwrap();
    assert_eq!(board[0].score, 6.0);
}

#[tokio::test]
async fn test_results_require_submission() {
    let (quizzes, attempts) = setup().await;
    let q = choice_question(&quizzes, &["A", "B"], "A", 1.0).await;
    let quiz = quiz_with(&quizzes, titled("Pending"), &[&q]).await;
    let attempt_id = attempts.start("learner-1", quiz.id).await.unwrap().attempt.id;

    assert!(matches!(
        attempts.get_result("learner-1", attempt_id).await,
        Err(ApiError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_random_order_survives_resume() {
    let (quizzes, attempts) = setup().await;
    let mut questions = Vec::new();
    for i in 0..8 {
        let correct = format!("{}", i);
        let other = format!("{}", i + 100);
        questions.push(choice_question(&quizzes, &[correct.as_str(), other.as_str()], &correct, 1.0).await);
    }
    let refs: Vec<&Question> = questions.iter().collect();
    let quiz = quiz_with(
        &quizzes,
        CreateQuizRequest {
            title: "Shuffled".to_string(),
            random_order: true,
            ..Default::default()
        },
        &refs,
    )
    .await;

    let started = attempts.start("learner-1", quiz.id).await.unwrap();
    let view = attempts
        .get_attempt_view("learner-1", started.attempt.id)
        .await
        .unwrap();

    let started_order: Vec<Uuid> = started.questions.iter().map(|q| q.question_id).collect();
    let resumed_order: Vec<Uuid> = view.questions.iter().map(|q| q.question_id).collect();
    assert_eq!(started_order, resumed_order);
    assert_eq!(started_order.len(), 8);
}

#[tokio::test]
async fn test_question_assignment_rules() {
    let (quizzes, _) = setup().await;
    let q1 = choice_question(&quizzes, &["A", "B"], "A", 1.0).await;
    let q2 = choice_question(&quizzes, &["C", "D"], "C", 2.0).await;
    let q3 = choice_question(&quizzes, &["E", "F"], "E", 3.0).await;
    let quiz = quiz_with(&quizzes, titled("Assignments"), &[&q1, &q2, &q3]).await;

    let duplicate = quizzes
        .assign_question(
            quiz.id,
            AssignQuestionRequest {
                question_id: q1.id,
                points: None,
            },
        )
        .await;
    assert!(matches!(duplicate, Err(ApiError::Conflict(_))));

    let inactive = choice_question(&quizzes, &["G", "H"], "G", 1.0).await;
    quizzes
        .update_question(
            inactive.id,
            UpdateQuestionRequest {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let rejected = quizzes
        .assign_question(
            quiz.id,
            AssignQuestionRequest {
                question_id: inactive.id,
                points: None,
            },
        )
        .await;
    assert!(matches!(rejected, Err(ApiError::ValidationError(_))));

    let updated = quizzes
        .update_assignment_points(quiz.id, q2.id, UpdateAssignmentRequest { points: 7.0 })
        .await
        .unwrap();
    assert_eq!(updated.points, 7.0);

    quizzes.remove_question(quiz.id, q1.id).await.unwrap();
    let remaining = quizzes.get_quiz_with_questions(quiz.id).await.unwrap().questions;
    let indices: Vec<i64> = remaining.iter().map(|d| d.order_index).collect();
    assert_eq!(indices, vec![0, 1]);
    assert_eq!(remaining[0].question.id, q2.id);

    let bad_order = quizzes
        .reorder_questions(
            quiz.id,
            ReorderQuestionsRequest {
                question_ids: vec![q3.id, q3.id],
            },
        )
        .await;
    assert!(matches!(bad_order, Err(ApiError::ValidationError(_))));

    let reordered = quizzes
        .reorder_questions(
            quiz.id,
            ReorderQuestionsRequest {
                question_ids: vec![q3.id, q2.id],
            },
        )
        .await
        .unwrap();
    assert_eq!(reordered[0].question.id, q3.id);
    assert_eq!(reordered[1].question.id, q2.id);

    let available = quizzes.available_questions(quiz.id).await.unwrap();
    let ids: Vec<Uuid> = available.iter().map(|q| q.id).collect();
    assert_eq!(ids, vec![q1.id]);
}

#[tokio::test]
async fn test_question_invariants_are_enforced() {
    let (quizzes, _) = setup().await;

    let too_few = quizzes
        .create_question(CreateQuestionRequest {
            title: "Too few".to_string(),
            content: "Pick".to_string(),
            question_type: QuestionType::MultiSelect,
            options: vec!["A".into(), "B".into()],
            correct_answer: AnswerKey::Single("A".into()),
            explanation: None,
            difficulty: None,
            points: None,
        })
        .await;
    assert!(matches!(too_few, Err(ApiError::ValidationError(_))));

    let not_an_option = quizzes
        .create_question(CreateQuestionRequest {
            title: "Missing".to_string(),
            content: "Pick".to_string(),
            question_type: QuestionType::MultipleChoice,
            options: vec!["A".into(), "B".into()],
            correct_answer: AnswerKey::Single("Z".into()),
            explanation: None,
            difficulty: None,
            points: None,
        })
        .await;
    assert!(matches!(not_an_option, Err(ApiError::ValidationError(_))));

    let zero_points = quizzes
        .create_question(CreateQuestionRequest {
            title: "Free".to_string(),
            content: "Pick".to_string(),
            question_type: QuestionType::TrueFalse,
            options: vec![],
            correct_answer: AnswerKey::Single("True".into()),
            explanation: None,
            difficulty: None,
            points: Some(0.0),
        })
        .await;
    assert!(matches!(zero_points, Err(ApiError::ValidationError(_))));

    let true_false = quizzes
        .create_question(CreateQuestionRequest {
            title: "Sky".to_string(),
            content: "The sky is blue".to_string(),
            question_type: QuestionType::TrueFalse,
            options: vec![],
            correct_answer: AnswerKey::Single("True".into()),
            explanation: None,
            difficulty: None,
            points: None,
        })
        .await
        .unwrap();
    assert_eq!(true_false.options, vec!["True", "False"]);
    assert_eq!(true_false.points, 1.0);

    // A partial update is checked against the merged question
    let broken = quizzes
        .update_question(
            true_false.id,
            UpdateQuestionRequest {
                correct_answer: Some(AnswerKey::Single("Maybe".into())),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(broken, Err(ApiError::ValidationError(_))));

    let stored = quizzes.get_question(true_false.id).await.unwrap();
    assert_eq!(stored.correct_answer, AnswerKey::Single("True".into()));
}

#[tokio::test]
async fn test_multi_select_options_cannot_hold_the_delimiter() {
    let (quizzes, _) = setup().await;

    let rejected = quizzes
        .create_question(CreateQuestionRequest {
            title: "Piped".to_string(),
            content: "Pick all".to_string(),
            question_type: QuestionType::MultiSelect,
            options: vec!["A|B".into(), "C".into(), "D".into()],
            correct_answer: AnswerKey::Multiple(["A|B".to_string(), "C".to_string()].into()),
            explanation: None,
            difficulty: None,
            points: None,
        })
        .await;
    assert!(matches!(rejected, Err(ApiError::ValidationError(_))));

    let question = quizzes
        .create_question(CreateQuestionRequest {
            title: "Plain".to_string(),
            content: "Pick all".to_string(),
            question_type: QuestionType::MultiSelect,
            options: vec!["A".into(), "C".into(), "D".into()],
            correct_answer: AnswerKey::Multiple(["A".to_string(), "C".to_string()].into()),
            explanation: None,
            difficulty: None,
            points: None,
        })
        .await
        .unwrap();

    let renamed = quizzes
        .update_question(
            question.id,
            UpdateQuestionRequest {
                options: Some(vec!["A|B".into(), "C".into(), "D".into()]),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(renamed, Err(ApiError::ValidationError(_))));

    let stored = quizzes.get_question(question.id).await.unwrap();
    assert_eq!(stored.options, vec!["A", "C", "D"]);
}

#[tokio::test]
async fn test_learner_quiz_summaries() {
    let (quizzes, attempts) = setup().await;
    let q = choice_question(&quizzes, &["A", "B"], "A", 4.0).await;
    let quiz = quiz_with(
        &quizzes,
        CreateQuizRequest {
            title: "Summary".to_string(),
            max_attempts: Some(2),
            ..Default::default()
        },
        &[&q],
    )
    .await;
    let other = quiz_with(&quizzes, titled("Not enrolled"), &[&q]).await;

    quizzes
        .enroll_users(
            quiz.id,
            EnrollUsersRequest {
                user_ids: vec!["learner-1".into()],
            },
        )
        .await
        .unwrap();

    let before = attempts.list_user_quizzes("learner-1").await.unwrap();
    assert_eq!(before.len(), 1);
    assert_eq!(before[0].quiz_id, quiz.id);
    assert_eq!(before[0].attempts, 0);
    assert!(before[0].can_attempt);
    assert!(before.iter().all(|s| s.quiz_id != other.id));

    let first = attempts.start("learner-1", quiz.id).await.unwrap().attempt.id;
    let during = attempts.list_user_quizzes("learner-1").await.unwrap();
    assert!(during[0].has_in_progress);
    assert!(!during[0].can_attempt);

    attempts
        .answer("learner-1", first, answer(q.id, "A"))
        .await
        .unwrap();
    attempts.submit("learner-1", first).await.unwrap();
    let second = attempts.start("learner-1", quiz.id).await.unwrap().attempt.id;
    attempts.submit("learner-1", second).await.unwrap();

    let after = attempts.list_user_quizzes("learner-1").await.unwrap();
    assert_eq!(after[0].attempts, 2);
    assert_eq!(after[0].best_score, Some(4.0));
    assert_eq!(after[0].question_count, 1);
    assert!(after[0].last_attempt_date.is_some());
    assert!(!after[0].can_attempt);
}

#[tokio::test]
async fn test_settings_round_trip() {
    let (quizzes, _) = setup().await;

    let defaults = quizzes.get_settings().await.unwrap();
    assert_eq!(defaults.site_title, "Quiz Platform");
    assert!(!defaults.maintenance_mode);

    let updated = quizzes
        .update_settings(UpdateSettingsRequest {
            site_title: Some("Exam Hall".to_string()),
            maintenance_mode: Some(true),
        })
        .await
        .unwrap();
    assert_eq!(updated.site_title, "Exam Hall");
    assert!(updated.maintenance_mode);
    assert!(quizzes.get_settings().await.unwrap().maintenance_mode);
}

#[tokio::test]
async fn test_deleting_quiz_cascades() {
    let (quizzes, attempts) = setup().await;
    let q = choice_question(&quizzes, &["A", "B"], "A", 1.0).await;
    let quiz = quiz_with(&quizzes, titled("Doomed"), &[&q]).await;
    let attempt_id = attempts.start("learner-1", quiz.id).await.unwrap().attempt.id;

    quizzes.delete_quiz(quiz.id).await.unwrap();

    assert!(matches!(quizzes.get_quiz(quiz.id).await, Err(ApiError::NotFound(_))));
    assert!(matches!(
        attempts.get_attempt_view("learner-1", attempt_id).await,
        Err(ApiError::NotFound(_))
    ));
    // The question bank entry survives
    assert!(quizzes.get_question(q.id).await.is_ok());
}
