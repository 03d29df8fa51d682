use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, TimestampSeconds};

/// Codeforces APIのすべてのエンドポイントが返す共通のレスポンス形式
///
/// `status`が`"OK"`のとき`result`にペイロードが入り、
/// それ以外のとき`comment`にエラーの内容が入る。
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub status: String,
    pub comment: Option<String>,
    pub result: Option<T>,
}

/// `user.info`が返すユーザプロフィール
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub handle: String,
    pub rating: Option<i32>,
    pub max_rating: Option<i32>,
    pub rank: Option<String>,
    pub max_rank: Option<String>,
}

/// `user.status`が返す提出1件分の情報
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: i64,
    pub contest_id: Option<i64>,
    #[serde_as(as = "TimestampSeconds<i64>")]
    #[serde(rename = "creationTimeSeconds")]
    pub creation_time: DateTime<Utc>,
    pub problem: ApiProblem,
    pub programming_language: String,
    pub verdict: Option<String>,
}

/// 提出に紐づく問題情報
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiProblem {
    pub contest_id: Option<i64>,
    pub index: String,
    pub name: String,
    pub rating: Option<i32>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// `user.rating`が返すレート変動1件分の情報
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingChange {
    pub contest_id: i64,
    pub contest_name: String,
    pub handle: String,
    pub rank: i32,
    #[serde_as(as = "TimestampSeconds<i64>")]
    #[serde(rename = "ratingUpdateTimeSeconds")]
    pub rating_update_time: DateTime<Utc>,
    pub old_rating: i32,
    pub new_rating: i32,
}

pub const VERDICT_ACCEPTED: &str = "OK";

impl Submission {
    pub fn is_accepted(&self) -> bool {
        self.verdict.as_deref() == Some(VERDICT_ACCEPTED)
    }
}

impl ApiProblem {
    /// コンテストIDと問題インデックスを連結した問題の自然キーを返すメソッド
    ///
    /// コンテストIDを持たない問題(gym等)はキーを構成できないためNoneを返す。
    pub fn problem_key(&self) -> Option<String> {
        self.contest_id
            .map(|contest_id| format!("{}{}", contest_id, self.index))
    }
}

impl RatingChange {
    pub fn delta(&self) -> i32 {
        self.new_rating - self.old_rating
    }
}
