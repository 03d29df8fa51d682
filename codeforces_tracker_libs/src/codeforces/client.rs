use crate::codeforces::model::{ApiResponse, RatingChange, Submission, UserInfo};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::time::{self, Duration};

type Result<T> = std::result::Result<T, CodeforcesError>;

/// Codeforcesのハンドルとして許容する文字種のパターン
///
/// 外部リクエストのクエリに埋め込む前に必ずこのパターンで検証する。
pub static HANDLE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]{1,24}$").unwrap());

pub const CODEFORCES_API_URL: &str = "https://codeforces.com/api/";

#[derive(Debug, Error)]
pub enum CodeforcesError {
    #[error("invalid handle [{0}]")]
    InvalidHandle(String),
    #[error("failed to request to Codeforces API")]
    RequestError(#[from] reqwest::Error),
    #[error("invalid Codeforces url given")]
    InvalidUrlError(#[from] url::ParseError),
    #[error("requested resource not found: {0}")]
    NotFound(String),
    #[error("retries exhausted after {attempts} attempts cause [{message}]")]
    RetriesExhausted { attempts: u32, message: String },
}

pub fn validate_handle(handle: &str) -> Result<()> {
    if HANDLE_PATTERN.is_match(handle) {
        Ok(())
    } else {
        Err(CodeforcesError::InvalidHandle(handle.to_string()))
    }
}

/// 外部プラットフォームからユーザの成績情報を取得する読み取り専用のアダプタ
#[async_trait]
pub trait RatingSource {
    /// ユーザのプロフィールを取得する。ハンドルが存在しないときはNoneを返す。
    async fn user_info(&self, handle: &str) -> Result<Option<UserInfo>>;
    /// ユーザの直近の提出を新しい順に最大`count`件取得する。
    async fn recent_submissions(&self, handle: &str, count: u32) -> Result<Vec<Submission>>;
    /// ユーザのレート変動履歴を古い順にすべて取得する。
    async fn rating_history(&self, handle: &str) -> Result<Vec<RatingChange>>;
}

pub struct CodeforcesClient {
    base_url: Url,
    client: Client,
    max_attempts: u32,
    backoff: Duration,
}

impl CodeforcesClient {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_retry(base_url, 3, Duration::from_millis(500))
    }

    /// リトライ回数と初回バックオフを指定してクライアントを作成するメソッド
    pub fn with_retry(base_url: &str, max_attempts: u32, backoff: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)?;
        let client = Client::builder()
            .gzip(true)
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(CodeforcesClient {
            base_url,
            client,
            max_attempts,
            backoff,
        })
    }

    /// APIのメソッドを1つ呼び出し、リトライと指数バックオフを行うメソッド
    ///
    /// HTTPステータスが2xx以外、またはレスポンスボディのstatusが"OK"以外の
    /// 場合はリトライ対象とする。ハンドルが存在しない場合のみ即座に
    /// NotFoundを返す。
    async fn call<T: DeserializeOwned>(&self, method: &str, query: &[(&str, String)]) -> Result<T> {
        let url = self.base_url.join(method)?;

        let mut wait = self.backoff;
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                time::sleep(wait).await;
                wait = wait * 2;
            }

            let res = match self.client.get(url.clone()).query(query).send().await {
                Ok(res) => res,
                Err(e) => {
                    tracing::warn!("request to {} failed at attempt {}: {:?}", method, attempt, e);
                    last_error = e.to_string();
                    continue;
                }
            };

            if let Err(e) = res.error_for_status_ref() {
                tracing::warn!(
                    "error response returned from {} at attempt {}: {:?}",
                    method,
                    attempt,
                    e
                );
                last_error = e.to_string();
                continue;
            }

            let body: ApiResponse<T> = match res.json().await {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(
                        "failed to deserialize response from {} at attempt {}: {:?}",
                        method,
                        attempt,
                        e
                    );
                    last_error = e.to_string();
                    continue;
                }
            };

            if body.status != "OK" {
                let comment = body.comment.unwrap_or_default();
                if comment.contains("not found") {
                    return Err(CodeforcesError::NotFound(comment));
                }
                tracing::warn!(
                    "Codeforces API returned status {} from {} at attempt {}: {}",
                    body.status,
                    method,
                    attempt,
                    comment
                );
                last_error = comment;
                continue;
            }

            match body.result {
                Some(result) => return Ok(result),
                None => {
                    last_error = String::from("OK response without result payload");
                    continue;
                }
            }
        }

        Err(CodeforcesError::RetriesExhausted {
            attempts: self.max_attempts,
            message: last_error,
        })
    }
}

#[async_trait]
impl RatingSource for CodeforcesClient {
    async fn user_info(&self, handle: &str) -> Result<Option<UserInfo>> {
        validate_handle(handle)?;

        match self
            .call::<Vec<UserInfo>>("user.info", &[("handles", handle.to_string())])
            .await
        {
            Ok(users) => Ok(users.into_iter().next()),
            Err(CodeforcesError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn recent_submissions(&self, handle: &str, count: u32) -> Result<Vec<Submission>> {
        validate_handle(handle)?;

        self.call(
            "user.status",
            &[
                ("handle", handle.to_string()),
                ("from", String::from("1")),
                ("count", count.to_string()),
            ],
        )
        .await
    }

    async fn rating_history(&self, handle: &str) -> Result<Vec<RatingChange>> {
        validate_handle(handle)?;

        self.call("user.rating", &[("handle", handle.to_string())])
            .await
    }
}
