use crate::modules::students::store::{
    LastSyncMarker, NewSyncLog, ProfileUpdate, SyncScope, SyncStatus, SyncStore,
};
use crate::types::tables::{ContestResult, SolvedProblem};
use anyhow::{Context, Result};
use chrono::Utc;
use codeforces_tracker_libs::codeforces::{
    client::RatingSource,
    model::{RatingChange, Submission},
};
use serde::Serialize;
use tokio::time::{self, Duration};

/// 同期処理の取得上限と待機時間のポリシー
///
/// 既定値は取得元APIのレートリミットを考慮した保守的な値。
#[derive(Debug, Clone)]
pub struct SyncPolicy {
    /// user.statusから取得する提出の最大件数
    pub submission_fetch_count: u32,
    /// 1回の同期で処理するAC提出の上限
    pub max_new_problems: usize,
    /// 1回の同期で処理するレート変動の上限(新しい方から)
    pub max_rating_changes: usize,
    /// 一括同期で生徒間に挟む待機時間
    pub student_delay: Duration,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy {
            submission_fetch_count: 1000,
            max_new_problems: 100,
            max_rating_changes: 50,
            student_delay: Duration::from_secs(1),
        }
    }
}

/// 生徒1人分の同期の結果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentSyncOutcome {
    pub student_id: i64,
    pub handle: String,
    pub success: bool,
    pub problems_fetched: u64,
    pub contests_fetched: u64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 一括同期の集計結果
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkSyncOutcome {
    pub total_students: usize,
    pub successful: usize,
    pub failed: usize,
    pub outcomes: Vec<StudentSyncOutcome>,
}

pub struct StudentSyncer<C, S> {
    source: C,
    store: S,
    policy: SyncPolicy,
}

impl<C, S> StudentSyncer<C, S>
where
    C: RatingSource + Send + Sync,
    S: SyncStore + Send + Sync,
{
    pub fn new(source: C, store: S, policy: SyncPolicy) -> Self {
        StudentSyncer {
            source,
            store,
            policy,
        }
    }

    /// 生徒1人を同期するメソッド
    ///
    /// プロフィール→提出→レート履歴の順に処理し、途中で失敗しても
    /// 残りのステップは継続する。最後に必ずlast_updatedを書き込み、
    /// 結果は例外ではなく常にStudentSyncOutcomeで返す。
    pub async fn sync_student(&self, student_id: i64, handle: &str) -> StudentSyncOutcome {
        tracing::info!("Start to sync student {} ({}).", student_id, handle);

        let mut problems_fetched = 0u64;
        let mut contests_fetched = 0u64;
        let mut errors: Vec<String> = Vec::new();
        let mut problems_ok = false;
        let mut contests_ok = false;
        let mut last_submission_at = None;

        match self.source.user_info(handle).await {
            Ok(Some(info)) => {
                let update = ProfileUpdate {
                    rating: info.rating,
                    max_rating: info.max_rating,
                };
                if let Err(e) = self.store.update_student_profile(student_id, &update).await {
                    errors.push(format!("failed to update profile: {:?}", e));
                }
            }
            Ok(None) => {
                tracing::warn!(
                    "handle {} was not found, marking student {} inactive",
                    handle,
                    student_id
                );
                if let Err(e) = self.store.set_student_active(student_id, false).await {
                    errors.push(format!("failed to mark student inactive: {:?}", e));
                }
            }
            Err(e) => {
                errors.push(format!("profile fetch failed: {}", e));
            }
        }

        match self
            .source
            .recent_submissions(handle, self.policy.submission_fetch_count)
            .await
        {
            Ok(submissions) => {
                let accepted: Vec<&Submission> = submissions
                    .iter()
                    .filter(|submission| submission.is_accepted())
                    .take(self.policy.max_new_problems)
                    .collect();
                last_submission_at = accepted.iter().map(|s| s.creation_time).max();

                let problems: Vec<SolvedProblem> = accepted
                    .iter()
                    .filter_map(|submission| solved_problem(student_id, *submission))
                    .collect();

                match self.store.insert_problems(&problems).await {
                    Ok(count) => {
                        problems_fetched = count;
                        problems_ok = true;
                    }
                    Err(e) => errors.push(format!("failed to save problems: {:?}", e)),
                }
            }
            Err(e) => {
                errors.push(format!("submissions fetch failed: {}", e));
            }
        }

        match self.source.rating_history(handle).await {
            Ok(mut changes) => {
                // APIは古い順に返すので、新しい方から上限まで処理する
                changes.reverse();
                changes.truncate(self.policy.max_rating_changes);

                let contests: Vec<ContestResult> = changes
                    .iter()
                    .map(|change| contest_result(student_id, change))
                    .collect();

                match self.store.insert_contests(&contests).await {
                    Ok(count) => {
                        contests_fetched = count;
                        contests_ok = true;
                    }
                    Err(e) => errors.push(format!("failed to save contests: {:?}", e)),
                }
            }
            Err(e) => {
                errors.push(format!("rating history fetch failed: {}", e));
            }
        }

        // 部分的に失敗していても同期を試みた時刻は必ず記録する
        if let Err(e) = self
            .store
            .mark_student_synced(student_id, Utc::now(), last_submission_at)
            .await
        {
            errors.push(format!("failed to write last-updated timestamp: {:?}", e));
        }

        let success = errors.is_empty();
        let status = if success {
            SyncStatus::Success
        } else if problems_ok || contests_ok {
            SyncStatus::Partial
        } else {
            SyncStatus::Error
        };
        let message = if success {
            format!(
                "synced {}: {} new problems, {} new contests",
                handle, problems_fetched, contests_fetched
            )
        } else {
            format!("sync of {} finished with errors: {}", handle, errors.join("; "))
        };

        let log = NewSyncLog {
            scope: SyncScope::Student,
            status,
            message: message.clone(),
            contests_fetched,
            problems_fetched,
        };
        if let Err(e) = self.store.append_sync_log(&log).await {
            tracing::error!("failed to append sync log for student {}: {:?}", student_id, e);
        }

        if success {
            tracing::info!("Student {} ({}) successfully synced.", student_id, handle);
        } else {
            tracing::error!("{}", message);
        }

        StudentSyncOutcome {
            student_id,
            handle: handle.to_string(),
            success,
            problems_fetched,
            contests_fetched,
            message,
            error: if errors.is_empty() {
                None
            } else {
                Some(errors.join("; "))
            },
        }
    }

    /// アクティブな全生徒を順番に同期するメソッド
    ///
    /// 取得元のレートリミットを考慮して並列化はせず、生徒間に待機時間を挟む。
    /// 個々の生徒の失敗ではループを止めない。
    pub async fn sync_all(&self) -> Result<BulkSyncOutcome> {
        let students = self
            .store
            .list_active_students()
            .await
            .context("failed to list students for bulk sync")?;
        let total_students = students.len();
        tracing::info!("Start to sync {} active students.", total_students);

        let mut outcomes = Vec::with_capacity(total_students);
        for (i, student) in students.iter().enumerate() {
            outcomes.push(self.sync_student(student.id, &student.handle).await);

            if i + 1 < total_students {
                time::sleep(self.policy.student_delay).await;
            }
        }

        let successful = outcomes.iter().filter(|outcome| outcome.success).count();
        let failed = total_students - successful;
        let problems_fetched: u64 = outcomes.iter().map(|o| o.problems_fetched).sum();
        let contests_fetched: u64 = outcomes.iter().map(|o| o.contests_fetched).sum();

        let marker = LastSyncMarker {
            synced_at: Utc::now(),
            total_students,
            successful,
            failed,
        };
        if let Err(e) = self.store.save_last_sync(&marker).await {
            tracing::error!("failed to save last-sync marker: {:?}", e);
        }

        let status = if failed == 0 {
            SyncStatus::Success
        } else if successful > 0 {
            SyncStatus::Partial
        } else {
            SyncStatus::Error
        };
        let message = format!(
            "synced {} students: {} succeeded, {} failed",
            total_students, successful, failed
        );
        let log = NewSyncLog {
            scope: SyncScope::All,
            status,
            message,
            contests_fetched,
            problems_fetched,
        };
        if let Err(e) = self.store.append_sync_log(&log).await {
            tracing::error!("failed to append bulk sync log: {:?}", e);
        }

        tracing::info!(
            "Bulk sync finished: {}/{} students succeeded.",
            successful,
            total_students
        );

        Ok(BulkSyncOutcome {
            total_students,
            successful,
            failed,
            outcomes,
        })
    }
}

/// AC提出から問題レコードを組み立てる関数
///
/// コンテストIDを持たない提出は自然キーを構成できないため読み飛ばす。
fn solved_problem(student_id: i64, submission: &Submission) -> Option<SolvedProblem> {
    let problem_key = submission.problem.problem_key()?;

    Some(SolvedProblem {
        student_id,
        problem_key,
        name: submission.problem.name.clone(),
        rating: submission.problem.rating,
        tags: submission.problem.tags.clone(),
        solved_at: submission.creation_time,
        verdict: submission
            .verdict
            .clone()
            .unwrap_or(String::from(codeforces_tracker_libs::codeforces::model::VERDICT_ACCEPTED)),
        programming_language: submission.programming_language.clone(),
    })
}

fn contest_result(student_id: i64, change: &RatingChange) -> ContestResult {
    ContestResult {
        student_id,
        contest_id: change.contest_id,
        contest_name: change.contest_name.clone(),
        ranked_at: change.rating_update_time,
        new_rating: change.new_rating,
        rating_delta: change.delta(),
        rank: change.rank,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::modules::schedule::ScheduleSettings;
    use crate::types::tables::Student;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use codeforces_tracker_libs::codeforces::client::CodeforcesError;
    use codeforces_tracker_libs::codeforces::model::{ApiProblem, UserInfo};
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn policy_without_delay() -> SyncPolicy {
        SyncPolicy {
            student_delay: Duration::from_millis(0),
            ..SyncPolicy::default()
        }
    }

    fn user_info(handle: &str) -> UserInfo {
        UserInfo {
            handle: handle.to_string(),
            rating: Some(1500),
            max_rating: Some(1600),
            rank: Some(String::from("specialist")),
            max_rank: Some(String::from("expert")),
        }
    }

    fn accepted_submission(id: i64, contest_id: i64, index: &str) -> Submission {
        Submission {
            id,
            contest_id: Some(contest_id),
            creation_time: Utc.timestamp_opt(1690040700 + id, 0).unwrap(),
            problem: ApiProblem {
                contest_id: Some(contest_id),
                index: index.to_string(),
                name: format!("Problem {}", index),
                rating: Some(800),
                tags: vec![String::from("implementation")],
            },
            programming_language: String::from("Rust"),
            verdict: Some(String::from("OK")),
        }
    }

    fn rejected_submission(id: i64) -> Submission {
        Submission {
            verdict: Some(String::from("WRONG_ANSWER")),
            ..accepted_submission(id, 9999, "X")
        }
    }

    fn rating_change(contest_id: i64, old_rating: i32, new_rating: i32) -> RatingChange {
        RatingChange {
            contest_id,
            contest_name: format!("Round {}", contest_id),
            handle: String::from("someone"),
            rank: 1234,
            rating_update_time: Utc.timestamp_opt(1690049100 + contest_id, 0).unwrap(),
            old_rating,
            new_rating,
        }
    }

    fn student(id: i64, handle: &str) -> Student {
        Student {
            id,
            name: format!("student {}", id),
            email: format!("{}@example.com", handle),
            handle: handle.to_string(),
            rating: None,
            max_rating: None,
            active: true,
            reminder_count: 0,
            email_notifications: true,
            last_submission_at: None,
            last_updated: None,
        }
    }

    /// Stub rating source with per-handle failure injection.
    struct StubSource {
        known: bool,
        submissions: Vec<Submission>,
        rating_changes: Vec<RatingChange>,
        failing_handles: HashSet<String>,
        fail_rating_history: bool,
    }

    impl StubSource {
        fn new(submissions: Vec<Submission>, rating_changes: Vec<RatingChange>) -> Self {
            StubSource {
                known: true,
                submissions,
                rating_changes,
                failing_handles: HashSet::new(),
                fail_rating_history: false,
            }
        }

        fn fetch_failed() -> CodeforcesError {
            CodeforcesError::RetriesExhausted {
                attempts: 3,
                message: String::from("stub failure"),
            }
        }

        fn check(&self, handle: &str) -> Result<(), CodeforcesError> {
            if self.failing_handles.contains(handle) {
                Err(Self::fetch_failed())
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl RatingSource for StubSource {
        async fn user_info(
            &self,
            handle: &str,
        ) -> Result<Option<UserInfo>, CodeforcesError> {
            self.check(handle)?;
            if self.known {
                Ok(Some(user_info(handle)))
            } else {
                Ok(None)
            }
        }

        async fn recent_submissions(
            &self,
            handle: &str,
            _count: u32,
        ) -> Result<Vec<Submission>, CodeforcesError> {
            self.check(handle)?;
            Ok(self.submissions.clone())
        }

        async fn rating_history(
            &self,
            handle: &str,
        ) -> Result<Vec<RatingChange>, CodeforcesError> {
            self.check(handle)?;
            if self.fail_rating_history {
                Err(Self::fetch_failed())
            } else {
                Ok(self.rating_changes.clone())
            }
        }
    }

    /// In-memory store mirroring the natural-key dedup of the Postgres store.
    #[derive(Default)]
    struct MemoryStore {
        students: Mutex<Vec<Student>>,
        problems: Mutex<Vec<SolvedProblem>>,
        contests: Mutex<Vec<ContestResult>>,
        logs: Mutex<Vec<NewSyncLog>>,
        last_sync: Mutex<Option<LastSyncMarker>>,
    }

    impl MemoryStore {
        fn with_students(students: Vec<Student>) -> Self {
            let store = MemoryStore::default();
            *store.students.lock().unwrap() = students;
            store
        }

        fn student(&self, student_id: i64) -> Student {
            self.students
                .lock()
                .unwrap()
                .iter()
                .find(|s| s.id == student_id)
                .cloned()
                .unwrap()
        }
    }

    #[async_trait]
    impl SyncStore for MemoryStore {
        async fn list_active_students(&self) -> anyhow::Result<Vec<Student>> {
            Ok(self
                .students
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.active)
                .cloned()
                .collect())
        }

        async fn get_student(&self, student_id: i64) -> anyhow::Result<Option<Student>> {
            Ok(self
                .students
                .lock()
                .unwrap()
                .iter()
                .find(|s| s.id == student_id)
                .cloned())
        }

        async fn update_student_profile(
            &self,
            student_id: i64,
            update: &ProfileUpdate,
        ) -> anyhow::Result<()> {
            let mut students = self.students.lock().unwrap();
            if let Some(student) = students.iter_mut().find(|s| s.id == student_id) {
                student.rating = update.rating;
                student.max_rating = update.max_rating;
                student.active = true;
            }
            Ok(())
        }

        async fn set_student_active(&self, student_id: i64, active: bool) -> anyhow::Result<()> {
            let mut students = self.students.lock().unwrap();
            if let Some(student) = students.iter_mut().find(|s| s.id == student_id) {
                student.active = active;
            }
            Ok(())
        }

        async fn mark_student_synced(
            &self,
            student_id: i64,
            synced_at: DateTime<Utc>,
            last_submission_at: Option<DateTime<Utc>>,
        ) -> anyhow::Result<()> {
            let mut students = self.students.lock().unwrap();
            if let Some(student) = students.iter_mut().find(|s| s.id == student_id) {
                student.last_updated = Some(synced_at);
                if last_submission_at.is_some() {
                    student.last_submission_at = last_submission_at;
                }
            }
            Ok(())
        }

        async fn insert_problems(&self, problems: &[SolvedProblem]) -> anyhow::Result<u64> {
            let mut stored = self.problems.lock().unwrap();
            let mut inserted = 0u64;
            for problem in problems {
                let exists = stored.iter().any(|p| {
                    p.student_id == problem.student_id && p.problem_key == problem.problem_key
                });
                if !exists {
                    stored.push(problem.clone());
                    inserted += 1;
                }
            }
            Ok(inserted)
        }

        async fn insert_contests(&self, contests: &[ContestResult]) -> anyhow::Result<u64> {
            let mut stored = self.contests.lock().unwrap();
            let mut inserted = 0u64;
            for contest in contests {
                let exists = stored.iter().any(|c| {
                    c.student_id == contest.student_id && c.contest_id == contest.contest_id
                });
                if !exists {
                    stored.push(contest.clone());
                    inserted += 1;
                }
            }
            Ok(inserted)
        }

        async fn append_sync_log(&self, log: &NewSyncLog) -> anyhow::Result<()> {
            self.logs.lock().unwrap().push(log.clone());
            Ok(())
        }

        async fn load_schedule_settings(&self) -> anyhow::Result<Option<ScheduleSettings>> {
            Ok(None)
        }

        async fn save_schedule_settings(
            &self,
            _settings: &ScheduleSettings,
            _cron_expression: &str,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn load_last_sync(&self) -> anyhow::Result<Option<LastSyncMarker>> {
            Ok(self.last_sync.lock().unwrap().clone())
        }

        async fn save_last_sync(&self, marker: &LastSyncMarker) -> anyhow::Result<()> {
            *self.last_sync.lock().unwrap() = Some(marker.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn repeated_sync_inserts_nothing_new() {
        let source = StubSource::new(
            vec![
                accepted_submission(1, 1850, "A"),
                rejected_submission(2),
                accepted_submission(3, 1850, "B"),
            ],
            vec![rating_change(1850, 1400, 1450)],
        );
        let syncer = StudentSyncer::new(
            source,
            MemoryStore::with_students(vec![student(1, "tourist")]),
            policy_without_delay(),
        );

        let first = syncer.sync_student(1, "tourist").await;
        assert!(first.success);
        assert_eq!(first.problems_fetched, 2);
        assert_eq!(first.contests_fetched, 1);

        let second = syncer.sync_student(1, "tourist").await;
        assert!(second.success);
        assert_eq!(second.problems_fetched, 0);
        assert_eq!(second.contests_fetched, 0);
    }

    #[tokio::test]
    async fn rating_history_failure_does_not_abort_problem_import() {
        let mut source = StubSource::new(
            vec![accepted_submission(1, 1850, "A")],
            vec![rating_change(1850, 1400, 1450)],
        );
        source.fail_rating_history = true;

        let syncer = StudentSyncer::new(
            source,
            MemoryStore::with_students(vec![student(1, "alice")]),
            policy_without_delay(),
        );

        let outcome = syncer.sync_student(1, "alice").await;

        assert!(!outcome.success);
        assert_eq!(outcome.problems_fetched, 1);
        assert_eq!(outcome.contests_fetched, 0);
        assert!(outcome.error.unwrap().contains("rating history fetch failed"));

        // the last-updated timestamp is written even after a partial failure
        let synced = syncer.store.student(1);
        assert!(synced.last_updated.is_some());
        assert!(synced.last_submission_at.is_some());
    }

    #[tokio::test]
    async fn unknown_handle_marks_student_inactive() {
        let mut source = StubSource::new(vec![], vec![]);
        source.known = false;

        let syncer = StudentSyncer::new(
            source,
            MemoryStore::with_students(vec![student(1, "ghost")]),
            policy_without_delay(),
        );

        let outcome = syncer.sync_student(1, "ghost").await;
        assert!(outcome.success);

        let synced = syncer.store.student(1);
        assert!(!synced.active);
        assert!(synced.last_updated.is_some());
    }

    #[tokio::test]
    async fn profile_update_applies_fetched_ratings() {
        let source = StubSource::new(vec![], vec![]);
        let syncer = StudentSyncer::new(
            source,
            MemoryStore::with_students(vec![student(1, "alice")]),
            policy_without_delay(),
        );

        syncer.sync_student(1, "alice").await;

        let synced = syncer.store.student(1);
        assert_eq!(synced.rating, Some(1500));
        assert_eq!(synced.max_rating, Some(1600));
        assert!(synced.active);
    }

    #[tokio::test]
    async fn bulk_sync_reports_every_student() {
        let mut source = StubSource::new(
            vec![accepted_submission(1, 1850, "A")],
            vec![rating_change(1850, 1400, 1450)],
        );
        source.failing_handles.insert(String::from("broken"));

        let students = vec![
            student(1, "alice"),
            student(2, "broken"),
            student(3, "carol"),
        ];
        let syncer = StudentSyncer::new(
            source,
            MemoryStore::with_students(students),
            policy_without_delay(),
        );

        let outcome = syncer.sync_all().await.unwrap();

        assert_eq!(outcome.total_students, 3);
        assert_eq!(outcome.outcomes.len(), 3);
        assert_eq!(outcome.successful, 2);
        assert_eq!(outcome.failed, 1);
        assert!(!outcome.outcomes[1].success);
        assert_eq!(outcome.outcomes[1].handle, "broken");

        // bulk runs record the last-sync marker and an aggregate log entry
        let marker = syncer.store.last_sync.lock().unwrap().clone().unwrap();
        assert_eq!(marker.total_students, 3);
        assert_eq!(marker.failed, 1);

        let logs = syncer.store.logs.lock().unwrap();
        let bulk_logs: Vec<_> = logs
            .iter()
            .filter(|log| log.scope == SyncScope::All)
            .collect();
        assert_eq!(bulk_logs.len(), 1);
        assert_eq!(bulk_logs[0].status, SyncStatus::Partial);
    }

    #[tokio::test]
    async fn dedup_is_scoped_per_student() {
        let source = StubSource::new(vec![accepted_submission(1, 1850, "A")], vec![]);
        let students = vec![student(1, "alice"), student(2, "bob")];
        let syncer = StudentSyncer::new(
            source,
            MemoryStore::with_students(students),
            policy_without_delay(),
        );

        let first = syncer.sync_student(1, "alice").await;
        let second = syncer.sync_student(2, "bob").await;

        // both students get their own record for the same platform problem
        assert_eq!(first.problems_fetched, 1);
        assert_eq!(second.problems_fetched, 1);
        assert_eq!(syncer.store.problems.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rating_changes_are_capped_from_the_newest() {
        let changes: Vec<RatingChange> = (1..=60)
            .map(|i| rating_change(i, 1400, 1400 + i as i32))
            .collect();
        let source = StubSource::new(vec![], changes);
        let syncer = StudentSyncer::new(
            source,
            MemoryStore::with_students(vec![student(1, "alice")]),
            policy_without_delay(),
        );

        let outcome = syncer.sync_student(1, "alice").await;
        assert_eq!(outcome.contests_fetched, 50);

        // the newest 50 changes survive the cap, the oldest 10 are dropped
        let contests = syncer.store.contests.lock().unwrap();
        assert!(contests.iter().all(|c| c.contest_id > 10));
    }

    #[tokio::test]
    async fn every_run_appends_a_sync_log() {
        let source = StubSource::new(vec![], vec![]);
        let syncer = StudentSyncer::new(
            source,
            MemoryStore::with_students(vec![student(1, "alice")]),
            policy_without_delay(),
        );

        syncer.sync_student(1, "alice").await;
        syncer.sync_student(1, "alice").await;

        let logs = syncer.store.logs.lock().unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|log| log.status == SyncStatus::Success));
    }
}
