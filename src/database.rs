use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::grading::Grade;
use crate::log_db_operation;
use crate::models::*;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Timestamps are stored as fixed-precision RFC 3339 text so that they sort
/// lexicographically.
fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn parse_opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_ts).transpose()
}

fn parse_uuid(row: &SqliteRow, column: &str) -> Result<Uuid> {
    Ok(Uuid::parse_str(&row.get::<String, _>(column))?)
}

const ATTEMPT_COLUMNS: &str = "id, user_id, quiz_id, status, score, total_points, time_taken, \
     started_at, submitted_at, created_at, updated_at";

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        if !database_url.starts_with("sqlite:") {
            bail!("Unsupported database URL: {}", database_url);
        }

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        // An in-memory database lives and dies with its single connection
        let pool = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?
        };

        let db = Database { pool };
        db.migrate().await?;
        log_db_operation!(info, "migrate", "database initialized");
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS questions (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                question_type TEXT NOT NULL,
                options TEXT NOT NULL,
                correct_answer TEXT NOT NULL,
                explanation TEXT,
                difficulty TEXT NOT NULL DEFAULT 'MEDIUM',
                points REAL NOT NULL DEFAULT 1.0,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quizzes (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT,
                difficulty TEXT NOT NULL DEFAULT 'MEDIUM',
                time_limit_minutes INTEGER,
                max_attempts INTEGER,
                negative_marking INTEGER NOT NULL DEFAULT 0,
                negative_points REAL,
                random_order INTEGER NOT NULL DEFAULT 0,
                show_answers INTEGER NOT NULL DEFAULT 0,
                check_answer_enabled INTEGER NOT NULL DEFAULT 0,
                start_time TEXT,
                end_time TEXT,
                creator_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quiz_questions (
                id TEXT PRIMARY KEY,
                quiz_id TEXT NOT NULL,
                question_id TEXT NOT NULL,
                order_index INTEGER NOT NULL,
                points REAL NOT NULL,
                UNIQUE (quiz_id, question_id),
                FOREIGN KEY (quiz_id) REFERENCES quizzes(id) ON DELETE CASCADE,
                FOREIGN KEY (question_id) REFERENCES questions(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quiz_users (
                id TEXT PRIMARY KEY,
                quiz_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                enrolled_at TEXT NOT NULL,
                UNIQUE (quiz_id, user_id),
                FOREIGN KEY (quiz_id) REFERENCES quizzes(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quiz_attempts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                quiz_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'NOT_STARTED',
                score REAL,
                total_points REAL,
                time_taken INTEGER,
                started_at TEXT,
                submitted_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (quiz_id) REFERENCES quizzes(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        // At most one IN_PROGRESS attempt per (user, quiz)
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_quiz_attempts_one_in_progress
            ON quiz_attempts (user_id, quiz_id)
            WHERE status = 'IN_PROGRESS';
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_quiz_attempts_user_quiz ON quiz_attempts (user_id, quiz_id);",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quiz_answers (
                id TEXT PRIMARY KEY,
                attempt_id TEXT NOT NULL,
                question_id TEXT NOT NULL,
                user_answer TEXT NOT NULL,
                is_correct INTEGER NOT NULL,
                points_earned REAL NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (attempt_id, question_id),
                FOREIGN KEY (attempt_id) REFERENCES quiz_attempts(id) ON DELETE CASCADE,
                FOREIGN KEY (question_id) REFERENCES questions(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                site_title TEXT NOT NULL,
                maintenance_mode INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "INSERT OR IGNORE INTO settings (id, site_title, maintenance_mode, updated_at) VALUES (1, ?1, 0, ?2)",
        )
        .bind("Quiz Platform")
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Question operations
    // ------------------------------------------------------------------

    pub async fn insert_question(&self, question: &Question) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO questions (id, title, content, question_type, options, correct_answer,
                                   explanation, difficulty, points, is_active, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(question.id.to_string())
        .bind(&question.title)
        .bind(&question.content)
        .bind(question.question_type.as_str())
        .bind(serde_json::to_string(&question.options)?)
        .bind(question.correct_answer.to_storage())
        .bind(&question.explanation)
        .bind(question.difficulty.as_str())
        .bind(question.points)
        .bind(question.is_active)
        .bind(ts(question.created_at))
        .bind(ts(question.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_question(&self, id: Uuid) -> Result<Option<Question>> {
        let row = sqlx::query("SELECT * FROM questions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| row_to_question(&row)).transpose()
    }

    pub async fn list_questions(&self, active: Option<bool>) -> Result<Vec<Question>> {
        let rows = match active {
            Some(active) => {
                sqlx::query("SELECT * FROM questions WHERE is_active = ?1 ORDER BY created_at DESC")
                    .bind(active)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM questions ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(row_to_question).collect()
    }

    pub async fn update_question(&self, question: &Question) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE questions
            SET title = ?1, content = ?2, question_type = ?3, options = ?4, correct_answer = ?5,
                explanation = ?6, difficulty = ?7, points = ?8, is_active = ?9, updated_at = ?10
            WHERE id = ?11
            "#,
        )
        .bind(&question.title)
        .bind(&question.content)
        .bind(question.question_type.as_str())
        .bind(serde_json::to_string(&question.options)?)
        .bind(question.correct_answer.to_storage())
        .bind(&question.explanation)
        .bind(question.difficulty.as_str())
        .bind(question.points)
        .bind(question.is_active)
        .bind(ts(question.updated_at))
        .bind(question.id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete_question(&self, id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        // Write first so the transaction holds the write lock from the start
        let quiz_ids: Vec<String> =
            sqlx::query_scalar("DELETE FROM quiz_questions WHERE question_id = ?1 RETURNING quiz_id")
                .bind(id.to_string())
                .fetch_all(&mut *tx)
                .await?;

        let result = sqlx::query("DELETE FROM questions WHERE id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        for quiz_id in quiz_ids {
            compact_order(&mut tx, &quiz_id).await?;
        }

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    // ------------------------------------------------------------------
    // Quiz operations
    // ------------------------------------------------------------------

    pub async fn insert_quiz(&self, quiz: &Quiz) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO quizzes (id, title, description, difficulty, time_limit_minutes, max_attempts,
                                 negative_marking, negative_points, random_order, show_answers,
                                 check_answer_enabled, start_time, end_time, creator_id,
                                 created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            "#,
        )
        .bind(quiz.id.to_string())
        .bind(&quiz.title)
        .bind(&quiz.description)
        .bind(quiz.difficulty.as_str())
        .bind(quiz.time_limit_minutes)
        .bind(quiz.max_attempts)
        .bind(quiz.negative_marking)
        .bind(quiz.negative_points)
        .bind(quiz.random_order)
        .bind(quiz.show_answers)
        .bind(quiz.check_answer_enabled)
        .bind(quiz.start_time.map(ts))
        .bind(quiz.end_time.map(ts))
        .bind(&quiz.creator_id)
        .bind(ts(quiz.created_at))
        .bind(ts(quiz.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_quiz(&self, id: Uuid) -> Result<Option<Quiz>> {
        let row = sqlx::query("SELECT * FROM quizzes WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| row_to_quiz(&row)).transpose()
    }

    pub async fn list_quizzes(&self) -> Result<Vec<Quiz>> {
        let rows = sqlx::query("SELECT * FROM quizzes ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_quiz).collect()
    }

    pub async fn update_quiz(&self, quiz: &Quiz) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE quizzes
            SET title = ?1, description = ?2, difficulty = ?3, time_limit_minutes = ?4,
                max_attempts = ?5, negative_marking = ?6, negative_points = ?7, random_order = ?8,
                show_answers = ?9, check_answer_enabled = ?10, start_time = ?11, end_time = ?12,
                updated_at = ?13
            WHERE id = ?14
            "#,
        )
        .bind(&quiz.title)
        .bind(&quiz.description)
        .bind(quiz.difficulty.as_str())
        .bind(quiz.time_limit_minutes)
        .bind(quiz.max_attempts)
        .bind(quiz.negative_marking)
        .bind(quiz.negative_points)
        .bind(quiz.random_order)
        .bind(quiz.show_answers)
        .bind(quiz.check_answer_enabled)
        .bind(quiz.start_time.map(ts))
        .bind(quiz.end_time.map(ts))
        .bind(ts(quiz.updated_at))
        .bind(quiz.id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete_quiz(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM quizzes WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // ------------------------------------------------------------------
    // Quiz question assignments
    // ------------------------------------------------------------------

    pub async fn get_quiz_questions(&self, quiz_id: Uuid) -> Result<Vec<QuizQuestionDetail>> {
        let rows = sqlx::query(
            r#"
            SELECT q.*, qq.order_index AS qq_order_index, qq.points AS qq_points
            FROM quiz_questions qq
            JOIN questions q ON q.id = qq.question_id
            WHERE qq.quiz_id = ?1
            ORDER BY qq.order_index ASC
            "#,
        )
        .bind(quiz_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_quiz_question_detail).collect()
    }

    pub async fn get_quiz_question(
        &self,
        quiz_id: Uuid,
        question_id: Uuid,
    ) -> Result<Option<QuizQuestionDetail>> {
        let row = sqlx::query(
            r#"
            SELECT q.*, qq.order_index AS qq_order_index, qq.points AS qq_points
            FROM quiz_questions qq
            JOIN questions q ON q.id = qq.question_id
            WHERE qq.quiz_id = ?1 AND qq.question_id = ?2
            "#,
        )
        .bind(quiz_id.to_string())
        .bind(question_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| row_to_quiz_question_detail(&row)).transpose()
    }

    /// Append a question to the end of a quiz
    pub async fn add_quiz_question(
        &self,
        quiz_id: Uuid,
        question_id: Uuid,
        points: f64,
    ) -> Result<QuizQuestion> {
        let id = Uuid::new_v4();

        let order_index: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO quiz_questions (id, quiz_id, question_id, order_index, points)
            SELECT ?1, ?2, ?3, COALESCE(MAX(order_index) + 1, 0), ?4
            FROM quiz_questions WHERE quiz_id = ?2
            RETURNING order_index
            "#,
        )
        .bind(id.to_string())
        .bind(quiz_id.to_string())
        .bind(question_id.to_string())
        .bind(points)
        .fetch_one(&self.pool)
        .await?;

        Ok(QuizQuestion {
            id,
            quiz_id,
            question_id,
            order_index,
            points,
        })
    }

    pub async fn update_quiz_question_points(
        &self,
        quiz_id: Uuid,
        question_id: Uuid,
        points: f64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE quiz_questions SET points = ?1 WHERE quiz_id = ?2 AND question_id = ?3",
        )
        .bind(points)
        .bind(quiz_id.to_string())
        .bind(question_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove a question from a quiz, closing the gap in the ordering
    pub async fn remove_quiz_question(&self, quiz_id: Uuid, question_id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM quiz_questions WHERE quiz_id = ?1 AND question_id = ?2")
            .bind(quiz_id.to_string())
            .bind(question_id.to_string())
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        compact_order(&mut tx, &quiz_id.to_string()).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Persist a new question order. `question_ids` must be exactly the
    /// quiz's current assignments.
    pub async fn reorder_quiz_questions(&self, quiz_id: Uuid, question_ids: &[Uuid]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for (index, question_id) in question_ids.iter().enumerate() {
            let result = sqlx::query(
                "UPDATE quiz_questions SET order_index = ?1 WHERE quiz_id = ?2 AND question_id = ?3",
            )
            .bind(index as i64)
            .bind(quiz_id.to_string())
            .bind(question_id.to_string())
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() != 1 {
                tx.rollback().await?;
                return Err(anyhow!("Question {} is not assigned to quiz {}", question_id, quiz_id));
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Active questions not yet assigned to the quiz
    pub async fn list_available_questions(&self, quiz_id: Uuid) -> Result<Vec<Question>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM questions
            WHERE is_active = 1
              AND id NOT IN (SELECT question_id FROM quiz_questions WHERE quiz_id = ?1)
            ORDER BY created_at DESC
            "#,
        )
        .bind(quiz_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_question).collect()
    }

    // ------------------------------------------------------------------
    // Enrollment
    // ------------------------------------------------------------------

    /// Enroll users, skipping those already enrolled. Each new enrollment
    /// gets a NOT_STARTED attempt. Returns the newly enrolled user ids.
    pub async fn enroll_users(&self, quiz_id: Uuid, user_ids: &[String]) -> Result<Vec<String>> {
        let now = ts(Utc::now());
        let mut tx = self.pool.begin().await?;
        let mut enrolled = Vec::new();

        for user_id in user_ids {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO quiz_users (id, quiz_id, user_id, enrolled_at) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(quiz_id.to_string())
            .bind(user_id)
            .bind(&now)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                continue;
            }

            sqlx::query(
                r#"
                INSERT INTO quiz_attempts (id, user_id, quiz_id, status, created_at, updated_at)
                VALUES (?1, ?2, ?3, 'NOT_STARTED', ?4, ?4)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(user_id)
            .bind(quiz_id.to_string())
            .bind(&now)
            .execute(&mut *tx)
            .await?;

            enrolled.push(user_id.clone());
        }

        tx.commit().await?;
        Ok(enrolled)
    }

    pub async fn list_enrollments(&self, quiz_id: Uuid) -> Result<Vec<Enrollment>> {
        let rows = sqlx::query("SELECT * FROM quiz_users WHERE quiz_id = ?1 ORDER BY enrolled_at ASC")
            .bind(quiz_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(Enrollment {
                    id: parse_uuid(row, "id")?,
                    quiz_id: parse_uuid(row, "quiz_id")?,
                    user_id: row.get("user_id"),
                    enrolled_at: parse_ts(&row.get::<String, _>("enrolled_at"))?,
                })
            })
            .collect()
    }

    /// Drop an enrollment together with any attempt that never started
    pub async fn unenroll_user(&self, quiz_id: Uuid, user_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM quiz_users WHERE quiz_id = ?1 AND user_id = ?2")
            .bind(quiz_id.to_string())
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "DELETE FROM quiz_attempts WHERE quiz_id = ?1 AND user_id = ?2 AND status = 'NOT_STARTED'",
        )
        .bind(quiz_id.to_string())
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_enrolled_quizzes(&self, user_id: &str) -> Result<Vec<Quiz>> {
        let rows = sqlx::query(
            r#"
            SELECT q.* FROM quizzes q
            JOIN quiz_users qu ON qu.quiz_id = q.id
            WHERE qu.user_id = ?1
            ORDER BY q.created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_quiz).collect()
    }

    // ------------------------------------------------------------------
    // Attempts
    // ------------------------------------------------------------------

    pub async fn get_attempt(&self, id: Uuid) -> Result<Option<Attempt>> {
        let row = sqlx::query(&format!("SELECT {ATTEMPT_COLUMNS} FROM quiz_attempts WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| row_to_attempt(&row)).transpose()
    }

    pub async fn find_attempts(&self, user_id: &str, quiz_id: Uuid) -> Result<Vec<Attempt>> {
        let rows = sqlx::query(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM quiz_attempts WHERE user_id = ?1 AND quiz_id = ?2 ORDER BY created_at ASC"
        ))
        .bind(user_id)
        .bind(quiz_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_attempt).collect()
    }

    pub async fn find_in_progress_attempt(
        &self,
        user_id: &str,
        quiz_id: Uuid,
    ) -> Result<Option<Attempt>> {
        let row = sqlx::query(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM quiz_attempts WHERE user_id = ?1 AND quiz_id = ?2 AND status = 'IN_PROGRESS'"
        ))
        .bind(user_id)
        .bind(quiz_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| row_to_attempt(&row)).transpose()
    }

    pub async fn count_submitted_attempts(&self, user_id: &str, quiz_id: Uuid) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM quiz_attempts WHERE user_id = ?1 AND quiz_id = ?2 AND status = 'SUBMITTED'",
        )
        .bind(user_id)
        .bind(quiz_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Move the user's NOT_STARTED attempt (or a fresh one) to IN_PROGRESS.
    ///
    /// Both paths are single autocommit statements so that SQLite takes the
    /// write lock up front. A concurrent second start trips the partial
    /// unique index and fails with a unique constraint error.
    pub async fn begin_attempt(
        &self,
        user_id: &str,
        quiz_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Attempt> {
        let now_str = ts(now);

        let promoted = sqlx::query(&format!(
            r#"
            UPDATE quiz_attempts
            SET status = 'IN_PROGRESS', started_at = ?1, updated_at = ?1
            WHERE status = 'NOT_STARTED'
              AND id = (
                SELECT id FROM quiz_attempts
                WHERE user_id = ?2 AND quiz_id = ?3 AND status = 'NOT_STARTED'
                ORDER BY created_at ASC
                LIMIT 1
              )
            RETURNING {ATTEMPT_COLUMNS}
            "#
        ))
        .bind(&now_str)
        .bind(user_id)
        .bind(quiz_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = promoted {
            return row_to_attempt(&row);
        }

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO quiz_attempts (id, user_id, quiz_id, status, started_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, 'IN_PROGRESS', ?4, ?4, ?4)
            RETURNING {ATTEMPT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(quiz_id.to_string())
        .bind(&now_str)
        .fetch_one(&self.pool)
        .await?;

        row_to_attempt(&row)
    }

    /// Insert or overwrite the answer for (attempt, question). Nothing is
    /// written unless the attempt is still IN_PROGRESS, in which case `None`
    /// is returned.
    pub async fn upsert_answer(
        &self,
        attempt_id: Uuid,
        question_id: Uuid,
        user_answer: &str,
        grade: Grade,
        now: DateTime<Utc>,
    ) -> Result<Option<Answer>> {
        let result = sqlx::query(
            r#"
            INSERT INTO quiz_answers (id, attempt_id, question_id, user_answer, is_correct,
                                      points_earned, created_at, updated_at)
            SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7
            WHERE EXISTS (
                SELECT 1 FROM quiz_attempts WHERE id = ?2 AND status = 'IN_PROGRESS'
            )
            ON CONFLICT (attempt_id, question_id) DO UPDATE SET
                user_answer = excluded.user_answer,
                is_correct = excluded.is_correct,
                points_earned = excluded.points_earned,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(attempt_id.to_string())
        .bind(question_id.to_string())
        .bind(user_answer)
        .bind(grade.is_correct)
        .bind(grade.points_earned)
        .bind(ts(now))
        .execute(&self.pool)
        .await?;

        log_db_operation!(debug, "upsert_answer", attempt_id = attempt_id, rows = result.rows_affected());

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        self.get_answer(attempt_id, question_id).await
    }

    pub async fn get_answer(&self, attempt_id: Uuid, question_id: Uuid) -> Result<Option<Answer>> {
        let row = sqlx::query("SELECT * FROM quiz_answers WHERE attempt_id = ?1 AND question_id = ?2")
            .bind(attempt_id.to_string())
            .bind(question_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| row_to_answer(&row)).transpose()
    }

    pub async fn get_answers(&self, attempt_id: Uuid) -> Result<Vec<Answer>> {
        let rows = sqlx::query("SELECT * FROM quiz_answers WHERE attempt_id = ?1 ORDER BY created_at ASC")
            .bind(attempt_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_answer).collect()
    }

    /// Finalize an attempt. The status compare-and-swap is the first write,
    /// so nothing else changes unless the attempt was still IN_PROGRESS, in
    /// which case `None` is returned.
    ///
    /// Answers are re-scored against the quiz as it stands at submission:
    /// current point overrides and penalty apply, and answers to questions no
    /// longer assigned are dropped. Score and total therefore always describe
    /// the same set of questions.
    pub async fn submit_attempt(
        &self,
        attempt_id: Uuid,
        time_taken_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Attempt>> {
        let id = attempt_id.to_string();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE quiz_attempts
            SET status = 'SUBMITTED',
                total_points = (
                    SELECT COALESCE(SUM(points), 0.0) FROM quiz_questions
                    WHERE quiz_id = quiz_attempts.quiz_id
                ),
                time_taken = ?2,
                submitted_at = ?3,
                updated_at = ?3
            WHERE id = ?1 AND status = 'IN_PROGRESS'
            "#,
        )
        .bind(&id)
        .bind(time_taken_seconds)
        .bind(ts(now))
        .execute(&mut *tx)
        .await?;

        log_db_operation!(debug, "submit_attempt", attempt_id = attempt_id, rows = result.rows_affected());

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        sqlx::query(
            r#"
            DELETE FROM quiz_answers
            WHERE attempt_id = ?1
              AND question_id NOT IN (
                SELECT qq.question_id FROM quiz_questions qq
                JOIN quiz_attempts a ON a.quiz_id = qq.quiz_id
                WHERE a.id = ?1
              )
            "#,
        )
        .bind(&id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE quiz_answers
            SET points_earned = CASE
                WHEN is_correct = 1 THEN (
                    SELECT qq.points FROM quiz_questions qq
                    JOIN quiz_attempts a ON a.quiz_id = qq.quiz_id
                    WHERE a.id = ?1 AND qq.question_id = quiz_answers.question_id
                )
                ELSE (
                    SELECT CASE WHEN z.negative_marking = 1
                                THEN -COALESCE(z.negative_points, 0.0)
                                ELSE 0.0 END
                    FROM quizzes z
                    JOIN quiz_attempts a ON a.quiz_id = z.id
                    WHERE a.id = ?1
                )
            END
            WHERE attempt_id = ?1
            "#,
        )
        .bind(&id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE quiz_attempts
            SET score = (SELECT COALESCE(SUM(points_earned), 0.0) FROM quiz_answers WHERE attempt_id = ?1)
            WHERE id = ?1
            "#,
        )
        .bind(&id)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(&format!("SELECT {ATTEMPT_COLUMNS} FROM quiz_attempts WHERE id = ?1"))
            .bind(&id)
            .fetch_one(&mut *tx)
            .await?;
        let attempt = row_to_attempt(&row)?;

        tx.commit().await?;
        Ok(Some(attempt))
    }

    // ------------------------------------------------------------------
    // Analysis
    // ------------------------------------------------------------------

    /// Submitted attempts, best score first, earlier submission breaking ties
    pub async fn leaderboard(&self, quiz_id: Uuid) -> Result<Vec<Attempt>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ATTEMPT_COLUMNS} FROM quiz_attempts
            WHERE quiz_id = ?1 AND status = 'SUBMITTED'
            ORDER BY score DESC, submitted_at ASC
            "#
        ))
        .bind(quiz_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_attempt).collect()
    }

    /// Every attempt of a quiz with its answered and correct counts
    pub async fn result_matrix(&self, quiz_id: Uuid) -> Result<Vec<(Attempt, i64, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT a.id, a.user_id, a.quiz_id, a.status, a.score, a.total_points, a.time_taken,
                   a.started_at, a.submitted_at, a.created_at, a.updated_at,
                   COUNT(ans.id) AS answered,
                   COALESCE(SUM(CASE WHEN ans.is_correct = 1 THEN 1 ELSE 0 END), 0) AS correct
            FROM quiz_attempts a
            LEFT JOIN quiz_answers ans ON ans.attempt_id = a.id
            WHERE a.quiz_id = ?1
            GROUP BY a.id
            ORDER BY a.submitted_at DESC
            "#,
        )
        .bind(quiz_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let attempt = row_to_attempt(row)?;
                Ok((attempt, row.get::<i64, _>("answered"), row.get::<i64, _>("correct")))
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub async fn get_settings(&self) -> Result<Settings> {
        let row = sqlx::query("SELECT site_title, maintenance_mode, updated_at FROM settings WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;

        Ok(Settings {
            site_title: row.get("site_title"),
            maintenance_mode: row.get("maintenance_mode"),
            updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
        })
    }

    pub async fn update_settings(&self, settings: &Settings) -> Result<()> {
        sqlx::query(
            "UPDATE settings SET site_title = ?1, maintenance_mode = ?2, updated_at = ?3 WHERE id = 1",
        )
        .bind(&settings.site_title)
        .bind(settings.maintenance_mode)
        .bind(ts(settings.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Renumber a quiz's assignments 0..n in their current order
async fn compact_order(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    quiz_id: &str,
) -> Result<()> {
    let remaining: Vec<String> = sqlx::query_scalar(
        "SELECT id FROM quiz_questions WHERE quiz_id = ?1 ORDER BY order_index ASC",
    )
    .bind(quiz_id)
    .fetch_all(&mut **tx)
    .await?;

    for (index, id) in remaining.iter().enumerate() {
        sqlx::query("UPDATE quiz_questions SET order_index = ?1 WHERE id = ?2")
            .bind(index as i64)
            .bind(id)
            .execute(&mut **tx)
            .await?;
    }

    Ok(())
}

fn row_to_question(row: &SqliteRow) -> Result<Question> {
    let type_str: String = row.get("question_type");
    let question_type = QuestionType::parse(&type_str)
        .ok_or_else(|| anyhow!("Unknown question type '{}'", type_str))?;
    let difficulty_str: String = row.get("difficulty");
    let difficulty = DifficultyLevel::parse(&difficulty_str)
        .ok_or_else(|| anyhow!("Unknown difficulty '{}'", difficulty_str))?;
    let options: Vec<String> = serde_json::from_str(&row.get::<String, _>("options"))?;
    let correct_answer: String = row.get("correct_answer");

    Ok(Question {
        id: parse_uuid(row, "id")?,
        title: row.get("title"),
        content: row.get("content"),
        question_type,
        options,
        correct_answer: AnswerKey::from_storage(question_type, &correct_answer),
        explanation: row.get("explanation"),
        difficulty,
        points: row.get("points"),
        is_active: row.get("is_active"),
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
    })
}

fn row_to_quiz_question_detail(row: &SqliteRow) -> Result<QuizQuestionDetail> {
    Ok(QuizQuestionDetail {
        order_index: row.get("qq_order_index"),
        points: row.get("qq_points"),
        question: row_to_question(row)?,
    })
}

fn row_to_quiz(row: &SqliteRow) -> Result<Quiz> {
    let difficulty_str: String = row.get("difficulty");

    Ok(Quiz {
        id: parse_uuid(row, "id")?,
        title: row.get("title"),
        description: row.get("description"),
        difficulty: DifficultyLevel::parse(&difficulty_str)
            .ok_or_else(|| anyhow!("Unknown difficulty '{}'", difficulty_str))?,
        time_limit_minutes: row.get("time_limit_minutes"),
        max_attempts: row.get("max_attempts"),
        negative_marking: row.get("negative_marking"),
        negative_points: row.get("negative_points"),
        random_order: row.get("random_order"),
        show_answers: row.get("show_answers"),
        check_answer_enabled: row.get("check_answer_enabled"),
        start_time: parse_opt_ts(row.get("start_time"))?,
        end_time: parse_opt_ts(row.get("end_time"))?,
        creator_id: row.get("creator_id"),
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
    })
}

fn row_to_attempt(row: &SqliteRow) -> Result<Attempt> {
    let status_str: String = row.get("status");

    Ok(Attempt {
        id: parse_uuid(row, "id")?,
        user_id: row.get("user_id"),
        quiz_id: parse_uuid(row, "quiz_id")?,
        status: AttemptStatus::parse(&status_str)
            .ok_or_else(|| anyhow!("Unknown attempt status '{}'", status_str))?,
        score: row.get("score"),
        total_points: row.get("total_points"),
        time_taken_seconds: row.get("time_taken"),
        started_at: parse_opt_ts(row.get("started_at"))?,
        submitted_at: parse_opt_ts(row.get("submitted_at"))?,
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
    })
}

fn row_to_answer(row: &SqliteRow) -> Result<Answer> {
    Ok(Answer {
        id: parse_uuid(row, "id")?,
        attempt_id: parse_uuid(row, "attempt_id")?,
        question_id: parse_uuid(row, "question_id")?,
        user_answer: row.get("user_answer"),
        is_correct: row.get("is_correct"),
        points_earned: row.get("points_earned"),
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
    })
}
