use crate::modules::students::{
    store::PgSyncStore,
    syncer::{BulkSyncOutcome, StudentSyncOutcome, StudentSyncer, SyncPolicy},
};
use axum::{extract::Extension, http::StatusCode, Json};
use codeforces_tracker_libs::codeforces::client::{
    CodeforcesClient, CODEFORCES_API_URL, HANDLE_PATTERN,
};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::Postgres, Pool};
use std::sync::Arc;
use validator::Validate;

pub struct AppState {
    pub pool: Pool<Postgres>,
}

/// 同期トリガのリクエストボディ
///
/// `{"studentId": 1, "codeforcesHandle": "tourist"}`で1人、
/// `{"syncAll": true}`で全アクティブ生徒を同期する。
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub student_id: Option<i64>,
    #[validate(regex = "HANDLE_PATTERN")]
    pub codeforces_handle: Option<String>,
    #[serde(default)]
    pub sync_all: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<StudentSyncOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<BulkSyncOutcome>,
}

pub async fn sync(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, (StatusCode, String)> {
    // 不正なハンドルはアダプタを呼ぶ前にここで弾く
    if let Err(e) = payload.validate() {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("invalid sync request: {}", e),
        ));
    }

    let client = CodeforcesClient::new(CODEFORCES_API_URL).map_err(|e| {
        tracing::error!("failed to create Codeforces client: {:?}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            String::from("failed to create Codeforces client"),
        )
    })?;
    let syncer = StudentSyncer::new(
        client,
        PgSyncStore::new(state.pool.clone()),
        SyncPolicy::default(),
    );

    if payload.sync_all {
        let summary = syncer.sync_all().await.map_err(|e| {
            tracing::error!("bulk sync failed: {:?}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("bulk sync failed: {}", e),
            )
        })?;

        return Ok(Json(SyncResponse {
            success: summary.failed == 0,
            message: format!(
                "synced {} students: {} succeeded, {} failed",
                summary.total_students, summary.successful, summary.failed
            ),
            outcome: None,
            summary: Some(summary),
        }));
    }

    let (student_id, handle) = match (payload.student_id, payload.codeforces_handle.as_deref()) {
        (Some(student_id), Some(handle)) => (student_id, handle),
        _ => {
            return Err((
                StatusCode::BAD_REQUEST,
                String::from("studentId and codeforcesHandle are required unless syncAll is set"),
            ));
        }
    };

    let outcome = syncer.sync_student(student_id, handle).await;

    Ok(Json(SyncResponse {
        success: outcome.success,
        message: outcome.message.clone(),
        outcome: Some(outcome),
        summary: None,
    }))
}

pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

pub async fn readiness(Extension(state): Extension<Arc<AppState>>) -> StatusCode {
    match sqlx::query("SELECT 1;").execute(&state.pool).await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
