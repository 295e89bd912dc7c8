// Macros file - tracing macros are imported within the macro definitions

/// Standardized logging macros for consistent field names and message patterns across the application
///
/// These macros ensure:
/// - Consistent field naming (`operation`, `quiz_id`, `attempt_id`, `question_id`)
/// - Appropriate logging levels for different scenarios
/// - Structured logging with context

// ============================================================================
// API Operation Logging Macros
// ============================================================================

/// Log the start of an API operation with consistent fields
#[macro_export]
macro_rules! log_api_start {
    ($operation:expr, quiz_id = $quiz_id:expr) => {
        tracing::debug!(
            operation = $operation,
            quiz_id = %$quiz_id,
            "API operation started"
        );
    };
    ($operation:expr, attempt_id = $attempt_id:expr) => {
        tracing::debug!(
            operation = $operation,
            attempt_id = %$attempt_id,
            "API operation started"
        );
    };
    ($operation:expr, question_id = $question_id:expr) => {
        tracing::debug!(
            operation = $operation,
            question_id = %$question_id,
            "API operation started"
        );
    };
    ($operation:expr) => {
        tracing::debug!(
            operation = $operation,
            "API operation started"
        );
    };
}

/// Log successful completion of an API operation
#[macro_export]
macro_rules! log_api_success {
    ($operation:expr, quiz_id = $quiz_id:expr, $msg:expr) => {
        tracing::info!(
            operation = $operation,
            quiz_id = %$quiz_id,
            "API operation completed: {}", $msg
        );
    };
    ($operation:expr, attempt_id = $attempt_id:expr, $msg:expr) => {
        tracing::info!(
            operation = $operation,
            attempt_id = %$attempt_id,
            "API operation completed: {}", $msg
        );
    };
    ($operation:expr, question_id = $question_id:expr, $msg:expr) => {
        tracing::info!(
            operation = $operation,
            question_id = %$question_id,
            "API operation completed: {}", $msg
        );
    };
    ($operation:expr, count = $count:expr, $msg:expr) => {
        tracing::info!(
            operation = $operation,
            count = $count,
            "API operation completed: {}", $msg
        );
    };
    ($operation:expr, $msg:expr) => {
        tracing::info!(
            operation = $operation,
            "API operation completed: {}", $msg
        );
    };
}

/// Log API operation errors with consistent structure
#[macro_export]
macro_rules! log_api_error {
    ($operation:expr, attempt_id = $attempt_id:expr, error = $error:expr, $msg:expr) => {
        tracing::error!(
            operation = $operation,
            attempt_id = %$attempt_id,
            error = %$error,
            "API operation failed: {}", $msg
        );
    };
    ($operation:expr, quiz_id = $quiz_id:expr, error = $error:expr, $msg:expr) => {
        tracing::error!(
            operation = $operation,
            quiz_id = %$quiz_id,
            error = %$error,
            "API operation failed: {}", $msg
        );
    };
    ($operation:expr, error = $error:expr, $msg:expr) => {
        tracing::error!(
            operation = $operation,
            error = %$error,
            "API operation failed: {}", $msg
        );
    };
}

/// Log API warnings with context
#[macro_export]
macro_rules! log_api_warn {
    ($operation:expr, attempt_id = $attempt_id:expr, $msg:expr) => {
        tracing::warn!(
            operation = $operation,
            attempt_id = %$attempt_id,
            "API operation warning: {}", $msg
        );
    };
    ($operation:expr, $msg:expr) => {
        tracing::warn!(
            operation = $operation,
            "API operation warning: {}", $msg
        );
    };
}

// ============================================================================
// Service Layer Logging Macros
// ============================================================================

/// Log service operation start with context
#[macro_export]
macro_rules! log_service_start {
    ($service:expr, $operation:expr, quiz_id = $quiz_id:expr, user_id = $user_id:expr) => {
        tracing::info!(
            service = $service,
            operation = $operation,
            quiz_id = %$quiz_id,
            user_id = %$user_id,
            "Service operation started"
        );
    };
    ($service:expr, $operation:expr, attempt_id = $attempt_id:expr) => {
        tracing::info!(
            service = $service,
            operation = $operation,
            attempt_id = %$attempt_id,
            "Service operation started"
        );
    };
    ($service:expr, $operation:expr) => {
        tracing::info!(
            service = $service,
            operation = $operation,
            "Service operation started"
        );
    };
}

/// Log service operation success
#[macro_export]
macro_rules! log_service_success {
    ($service:expr, $operation:expr, attempt_id = $attempt_id:expr, duration_ms = $duration:expr) => {
        tracing::info!(
            service = $service,
            operation = $operation,
            attempt_id = %$attempt_id,
            duration_ms = $duration,
            "Service operation completed successfully"
        );
    };
    ($service:expr, $operation:expr, $msg:expr) => {
        tracing::info!(
            service = $service,
            operation = $operation,
            "Service operation completed: {}", $msg
        );
    };
}

/// Log service operation errors
#[macro_export]
macro_rules! log_service_error {
    ($service:expr, $operation:expr, attempt_id = $attempt_id:expr, error = $error:expr) => {
        tracing::error!(
            service = $service,
            operation = $operation,
            attempt_id = %$attempt_id,
            error = %$error,
            "Service operation failed"
        );
    };
    ($service:expr, $operation:expr, error = $error:expr) => {
        tracing::error!(
            service = $service,
            operation = $operation,
            error = %$error,
            "Service operation failed"
        );
    };
}

/// Log service warnings
#[macro_export]
macro_rules! log_service_warn {
    ($service:expr, $operation:expr, $msg:expr) => {
        tracing::warn!(
            service = $service,
            operation = $operation,
            "Service warning: {}",
            $msg
        );
    };
}

// ============================================================================
// Database Operation Logging Macros
// ============================================================================

/// Log database operation performance and results
#[macro_export]
macro_rules! log_db_operation {
    (debug, $operation:expr, attempt_id = $attempt_id:expr, rows = $rows:expr) => {
        tracing::debug!(
            component = "database",
            operation = $operation,
            attempt_id = %$attempt_id,
            rows_affected = $rows,
            "Database operation completed"
        );
    };
    (debug, $operation:expr, count = $count:expr) => {
        tracing::debug!(
            component = "database",
            operation = $operation,
            result_count = $count,
            "Database operation completed"
        );
    };
    (info, $operation:expr, $msg:expr) => {
        tracing::info!(
            component = "database",
            operation = $operation,
            "Database operation: {}", $msg
        );
    };
}

// ============================================================================
// System Event Logging Macros
// ============================================================================

/// Log system startup and shutdown events
#[macro_export]
macro_rules! log_system_event {
    (startup, component = $component:expr, $msg:expr) => {
        tracing::info!(
            event_type = "startup",
            component = $component,
            "System event: {}",
            $msg
        );
    };
    (config, $msg:expr) => {
        tracing::info!(event_type = "configuration", "System event: {}", $msg);
    };
}

// ============================================================================
// Validation Logging Macros
// ============================================================================

/// Log validation results consistently
#[macro_export]
macro_rules! log_validation {
    (success, $component:expr, $msg:expr) => {
        tracing::debug!(
            event_type = "validation",
            component = $component,
            result = "success",
            "Validation completed: {}", $msg
        );
    };
    (failure, $component:expr, error = $error:expr) => {
        tracing::warn!(
            event_type = "validation",
            component = $component,
            result = "failure",
            error = %$error,
            "Validation failed"
        );
    };
}
