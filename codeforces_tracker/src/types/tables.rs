use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Student {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub handle: String,
    pub rating: Option<i32>,
    pub max_rating: Option<i32>,
    pub active: bool,
    pub reminder_count: i32,
    pub email_notifications: bool,
    pub last_submission_at: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// 生徒が解いた問題1件分のレコード
///
/// (student_id, problem_key)が自然キー。一度挿入したら更新しない。
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SolvedProblem {
    pub student_id: i64,
    pub problem_key: String,
    pub name: String,
    pub rating: Option<i32>,
    pub tags: Vec<String>,
    pub solved_at: DateTime<Utc>,
    pub verdict: String,
    pub programming_language: String,
}

/// 生徒が参加したコンテスト1件分のレコード
///
/// (student_id, contest_id)が自然キー。一度挿入したら更新しない。
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ContestResult {
    pub student_id: i64,
    pub contest_id: i64,
    pub contest_name: String,
    pub ranked_at: DateTime<Utc>,
    pub new_rating: i32,
    pub rating_delta: i32,
    pub rank: i32,
}
