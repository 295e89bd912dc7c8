pub mod api;
pub mod attempt_service;
pub mod auth;
pub mod config;
pub mod database;
pub mod errors;
pub mod grading;
pub mod logging;
pub mod models;
pub mod quiz_service;

pub use attempt_service::AttemptService;
pub use database::Database;
pub use errors::*;
pub use grading::{grade, Grade, Marking};
pub use models::*;
pub use quiz_service::QuizService;
