use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::Json,
    routing::{delete, get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    attempt_service::AttemptService,
    auth::{maintenance_gate, AdminUser, LearnerUser},
    errors::{ApiError, ErrorContext},
    models::*,
    quiz_service::QuizService,
};

use crate::{log_api_error, log_api_start, log_api_success, log_api_warn};

#[derive(Clone)]
pub struct AppState {
    pub quiz_service: QuizService,
    pub attempt_service: AttemptService,
}

#[derive(Deserialize)]
pub struct QuestionFilter {
    pub active: Option<bool>,
}

#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            code: None,
        }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, (StatusCode, Json<ApiResponse<()>>)>;

fn fail(
    error: ApiError,
    operation: &str,
    resource_type: &str,
    id: impl ToString,
) -> (StatusCode, Json<ApiResponse<()>>) {
    error.to_response_with_context(
        ErrorContext::new(operation, resource_type).with_id(&id.to_string()),
    )
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// Question bank

pub async fn create_question(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Json(request): Json<CreateQuestionRequest>,
) -> ApiResult<Question> {
    log_api_start!("create_question");

    match state.quiz_service.create_question(request).await {
        Ok(question) => {
            log_api_success!("create_question", question_id = question.id, "question created");
            Ok(Json(ApiResponse::success(question)))
        }
        Err(e) => Err(e.to_response_with_context(ErrorContext::new("create_question", "question"))),
    }
}

pub async fn list_questions(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Query(filter): Query<QuestionFilter>,
) -> ApiResult<Vec<Question>> {
    match state.quiz_service.list_questions(filter.active).await {
        Ok(questions) => {
            log_api_success!("list_questions", count = questions.len(), "questions listed");
            Ok(Json(ApiResponse::success(questions)))
        }
        Err(e) => Err(e.to_response_with_context(ErrorContext::new("list_questions", "question"))),
    }
}

pub async fn get_question(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Question> {
    log_api_start!("get_question", question_id = id);

    state
        .quiz_service
        .get_question(id)
        .await
        .map(|question| Json(ApiResponse::success(question)))
        .map_err(|e| fail(e, "get_question", "question", id))
}

pub async fn update_question(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateQuestionRequest>,
) -> ApiResult<Question> {
    log_api_start!("update_question", question_id = id);

    match state.quiz_service.update_question(id, request).await {
        Ok(question) => {
            log_api_success!("update_question", question_id = id, "question updated");
            Ok(Json(ApiResponse::success(question)))
        }
        Err(e) => Err(fail(e, "update_question", "question", id)),
    }
}

pub async fn delete_question(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Value> {
    log_api_start!("delete_question", question_id = id);

    match state.quiz_service.delete_question(id).await {
        Ok(()) => {
            log_api_success!("delete_question", question_id = id, "question deleted");
            Ok(Json(ApiResponse::success(json!({ "deleted": id }))))
        }
        Err(e) => Err(fail(e, "delete_question", "question", id)),
    }
}

// Quizzes

pub async fn create_quiz(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Json(request): Json<CreateQuizRequest>,
) -> ApiResult<Quiz> {
    log_api_start!("create_quiz");

    match state.quiz_service.create_quiz(&admin.id, request).await {
        Ok(quiz) => {
            log_api_success!("create_quiz", quiz_id = quiz.id, "quiz created");
            Ok(Json(ApiResponse::success(quiz)))
        }
        Err(e) => Err(e.to_response_with_context(ErrorContext::new("create_quiz", "quiz"))),
    }
}

pub async fn list_quizzes(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
) -> ApiResult<Vec<Quiz>> {
    match state.quiz_service.list_quizzes().await {
        Ok(quizzes) => {
            log_api_success!("list_quizzes", count = quizzes.len(), "quizzes listed");
            Ok(Json(ApiResponse::success(quizzes)))
        }
        Err(e) => Err(e.to_response_with_context(ErrorContext::new("list_quizzes", "quiz"))),
    }
}

pub async fn get_quiz(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<Uuid>,
) -> ApiResult<QuizWithQuestions> {
    log_api_start!("get_quiz", quiz_id = id);

    state
        .quiz_service
        .get_quiz_with_questions(id)
        .await
        .map(|quiz| Json(ApiResponse::success(quiz)))
        .map_err(|e| fail(e, "get_quiz", "quiz", id))
}

pub async fn update_quiz(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateQuizRequest>,
) -> ApiResult<Quiz> {
    log_api_start!("update_quiz", quiz_id = id);

    match state.quiz_service.update_quiz(id, request).await {
        Ok(quiz) => {
            log_api_success!("update_quiz", quiz_id = id, "quiz updated");
            Ok(Json(ApiResponse::success(quiz)))
        }
        Err(e) => Err(fail(e, "update_quiz", "quiz", id)),
    }
}

pub async fn delete_quiz(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Value> {
    log_api_start!("delete_quiz", quiz_id = id);

    match state.quiz_service.delete_quiz(id).await {
        Ok(()) => Ok(Json(ApiResponse::success(json!({ "deleted": id })))),
        Err(e) => Err(fail(e, "delete_quiz", "quiz", id)),
    }
}

// Quiz question assignments

pub async fn assign_question(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(quiz_id): Path<Uuid>,
    Json(request): Json<AssignQuestionRequest>,
) -> ApiResult<QuizQuestion> {
    log_api_start!("assign_question", quiz_id = quiz_id);

    match state.quiz_service.assign_question(quiz_id, request).await {
        Ok(assignment) => {
            log_api_success!("assign_question", question_id = assignment.question_id, "question assigned");
            Ok(Json(ApiResponse::success(assignment)))
        }
        Err(e) => Err(fail(e, "assign_question", "quiz", quiz_id)),
    }
}

pub async fn update_assignment(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path((quiz_id, question_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<UpdateAssignmentRequest>,
) -> ApiResult<QuizQuestionDetail> {
    log_api_start!("update_assignment", question_id = question_id);

    state
        .quiz_service
        .update_assignment_points(quiz_id, question_id, request)
        .await
        .map(|detail| Json(ApiResponse::success(detail)))
        .map_err(|e| fail(e, "update_assignment", "quiz_question", question_id))
}

pub async fn remove_question(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path((quiz_id, question_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Value> {
    log_api_start!("remove_question", question_id = question_id);

    match state.quiz_service.remove_question(quiz_id, question_id).await {
        Ok(()) => Ok(Json(ApiResponse::success(json!({ "removed": question_id })))),
        Err(e) => Err(fail(e, "remove_question", "quiz_question", question_id)),
    }
}

pub async fn reorder_questions(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(quiz_id): Path<Uuid>,
    Json(request): Json<ReorderQuestionsRequest>,
) -> ApiResult<Vec<QuizQuestionDetail>> {
    log_api_start!("reorder_questions", quiz_id = quiz_id);

    state
        .quiz_service
        .reorder_questions(quiz_id, request)
        .await
        .map(|details| Json(ApiResponse::success(details)))
        .map_err(|e| fail(e, "reorder_questions", "quiz", quiz_id))
}

pub async fn available_questions(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(quiz_id): Path<Uuid>,
) -> ApiResult<Vec<Question>> {
    state
        .quiz_service
        .available_questions(quiz_id)
        .await
        .map(|questions| Json(ApiResponse::success(questions)))
        .map_err(|e| fail(e, "available_questions", "quiz", quiz_id))
}

// Enrollment

pub async fn enroll_users(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(quiz_id): Path<Uuid>,
    Json(request): Json<EnrollUsersRequest>,
) -> ApiResult<EnrollmentOutcome> {
    log_api_start!("enroll_users", quiz_id = quiz_id);

    match state.quiz_service.enroll_users(quiz_id, request).await {
        Ok(outcome) => {
            log_api_success!("enroll_users", count = outcome.enrolled.len(), "users enrolled");
            Ok(Json(ApiResponse::success(outcome)))
        }
        Err(e) => Err(fail(e, "enroll_users", "quiz", quiz_id)),
    }
}

pub async fn list_enrollments(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(quiz_id): Path<Uuid>,
) -> ApiResult<Vec<Enrollment>> {
    state
        .quiz_service
        .list_enrollments(quiz_id)
        .await
        .map(|enrollments| Json(ApiResponse::success(enrollments)))
        .map_err(|e| fail(e, "list_enrollments", "quiz", quiz_id))
}

pub async fn unenroll_user(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path((quiz_id, user_id)): Path<(Uuid, String)>,
) -> ApiResult<Value> {
    log_api_start!("unenroll_user", quiz_id = quiz_id);

    match state.quiz_service.unenroll_user(quiz_id, &user_id).await {
        Ok(()) => Ok(Json(ApiResponse::success(json!({ "unenrolled": user_id })))),
        Err(e) => Err(fail(e, "unenroll_user", "enrollment", user_id)),
    }
}

// Analysis

pub async fn leaderboard(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(quiz_id): Path<Uuid>,
) -> ApiResult<Vec<LeaderboardEntry>> {
    state
        .quiz_service
        .leaderboard(quiz_id)
        .await
        .map(|entries| Json(ApiResponse::success(entries)))
        .map_err(|e| fail(e, "leaderboard", "quiz", quiz_id))
}

pub async fn result_matrix(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(quiz_id): Path<Uuid>,
) -> ApiResult<Vec<ResultMatrixRow>> {
    state
        .quiz_service
        .result_matrix(quiz_id)
        .await
        .map(|rows| Json(ApiResponse::success(rows)))
        .map_err(|e| fail(e, "result_matrix", "quiz", quiz_id))
}

// Settings

pub async fn get_settings(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
) -> ApiResult<Settings> {
    state
        .quiz_service
        .get_settings()
        .await
        .map(|settings| Json(ApiResponse::success(settings)))
        .map_err(|e| e.to_response_with_context(ErrorContext::new("get_settings", "settings")))
}

pub async fn update_settings(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Json(request): Json<UpdateSettingsRequest>,
) -> ApiResult<Settings> {
    log_api_start!("update_settings");

    match state.quiz_service.update_settings(request).await {
        Ok(settings) => {
            log_api_success!("update_settings", "settings updated");
            Ok(Json(ApiResponse::success(settings)))
        }
        Err(e) => Err(e.to_response_with_context(ErrorContext::new("update_settings", "settings"))),
    }
}

// Quiz taking

pub async fn list_my_quizzes(
    State(state): State<AppState>,
    LearnerUser(user): LearnerUser,
) -> ApiResult<Vec<UserQuizSummary>> {
    match state.attempt_service.list_user_quizzes(&user.id).await {
        Ok(quizzes) => {
            log_api_success!("list_my_quizzes", count = quizzes.len(), "enrolled quizzes listed");
            Ok(Json(ApiResponse::success(quizzes)))
        }
        Err(e) => Err(fail(e, "list_my_quizzes", "user", &user.id)),
    }
}

pub async fn start_attempt(
    State(state): State<AppState>,
    LearnerUser(user): LearnerUser,
    Path(quiz_id): Path<Uuid>,
) -> ApiResult<StartedAttempt> {
    log_api_start!("start_attempt", quiz_id = quiz_id);

    match state.attempt_service.start(&user.id, quiz_id).await {
        Ok(started) => {
            log_api_success!("start_attempt", attempt_id = started.attempt.id, "attempt started");
            Ok(Json(ApiResponse::success(started)))
        }
        Err(e) => Err(fail(e, "start_attempt", "quiz", quiz_id)),
    }
}

pub async fn get_attempt(
    State(state): State<AppState>,
    LearnerUser(user): LearnerUser,
    Path(attempt_id): Path<Uuid>,
) -> ApiResult<AttemptView> {
    log_api_start!("get_attempt", attempt_id = attempt_id);

    state
        .attempt_service
        .get_attempt_view(&user.id, attempt_id)
        .await
        .map(|view| Json(ApiResponse::success(view)))
        .map_err(|e| fail(e, "get_attempt", "attempt", attempt_id))
}

pub async fn submit_answer(
    State(state): State<AppState>,
    LearnerUser(user): LearnerUser,
    Path(attempt_id): Path<Uuid>,
    Json(request): Json<SubmitAnswerRequest>,
) -> ApiResult<AnswerReceipt> {
    log_api_start!("submit_answer", attempt_id = attempt_id);

    match state.attempt_service.answer(&user.id, attempt_id, request).await {
        Ok(receipt) => {
            log_api_success!("submit_answer", question_id = receipt.question_id, "answer saved");
            Ok(Json(ApiResponse::success(receipt)))
        }
        Err(e) => {
            if let ApiError::InvalidState(reason) = &e {
                log_api_warn!("submit_answer", attempt_id = attempt_id, reason);
            }
            Err(fail(e, "submit_answer", "attempt", attempt_id))
        }
    }
}

pub async fn submit_attempt(
    State(state): State<AppState>,
    LearnerUser(user): LearnerUser,
    Path(attempt_id): Path<Uuid>,
) -> ApiResult<QuizResult> {
    log_api_start!("submit_attempt", attempt_id = attempt_id);

    match state.attempt_service.submit(&user.id, attempt_id).await {
        Ok(result) => {
            log_api_success!(
                "submit_attempt",
                attempt_id = attempt_id,
                format!("scored {} of {}", result.score, result.total_points)
            );
            Ok(Json(ApiResponse::success(result)))
        }
        Err(e) => {
            if let ApiError::DatabaseError(inner) = &e {
                log_api_error!("submit_attempt", attempt_id = attempt_id, error = inner, "submission failed");
            }
            Err(fail(e, "submit_attempt", "attempt", attempt_id))
        }
    }
}

pub async fn get_result(
    State(state): State<AppState>,
    LearnerUser(user): LearnerUser,
    Path(attempt_id): Path<Uuid>,
) -> ApiResult<QuizResult> {
    state
        .attempt_service
        .get_result(&user.id, attempt_id)
        .await
        .map(|result| Json(ApiResponse::success(result)))
        .map_err(|e| fail(e, "get_result", "attempt", attempt_id))
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Question bank
        .route("/api/admin/questions", get(list_questions).post(create_question))
        .route(
            "/api/admin/questions/:id",
            get(get_question).put(update_question).delete(delete_question),
        )
        // Quizzes
        .route("/api/admin/quizzes", get(list_quizzes).post(create_quiz))
        .route(
            "/api/admin/quizzes/:id",
            get(get_quiz).put(update_quiz).delete(delete_quiz),
        )
        .route("/api/admin/quizzes/:id/questions", post(assign_question))
        .route(
            "/api/admin/quizzes/:id/questions/:question_id",
            put(update_assignment).delete(remove_question),
        )
        .route("/api/admin/quizzes/:id/order", put(reorder_questions))
        .route("/api/admin/quizzes/:id/available-questions", get(available_questions))
        // Enrollment
        .route(
            "/api/admin/quizzes/:id/users",
            get(list_enrollments).post(enroll_users),
        )
        .route("/api/admin/quizzes/:id/users/:user_id", delete(unenroll_user))
        // Analysis
        .route("/api/admin/quizzes/:id/leaderboard", get(leaderboard))
        .route("/api/admin/quizzes/:id/results", get(result_matrix))
        .route("/api/admin/settings", get(get_settings).put(update_settings))
        // Quiz taking
        .route("/api/quizzes", get(list_my_quizzes))
        .route("/api/quizzes/:id/attempts", post(start_attempt))
        .route("/api/attempts/:id", get(get_attempt))
        .route("/api/attempts/:id/answers", post(submit_answer))
        .route("/api/attempts/:id/submit", post(submit_attempt))
        .route("/api/attempts/:id/result", get(get_result))
        .layer(middleware::from_fn_with_state(state.clone(), maintenance_gate))
        .with_state(state)
}
