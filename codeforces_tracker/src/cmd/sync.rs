use crate::modules::{
    migration::MIGRATOR,
    students::{
        store::{PgSyncStore, SyncStore},
        syncer::{StudentSyncer, SyncPolicy},
    },
};
use anyhow::{bail, Context, Result};
use clap::Args;
use codeforces_tracker_libs::codeforces::client::{CodeforcesClient, CODEFORCES_API_URL};

#[derive(Debug, Args)]
pub struct SyncArgs {
    /// アクティブな全生徒を同期する
    #[arg(long)]
    all: bool,
    /// 同期する生徒のID
    #[arg(long)]
    student_id: Option<i64>,
    /// 生徒のCodeforcesハンドル(省略時はデータベースから引く)
    #[arg(long)]
    handle: Option<String>,
}

pub async fn run(args: SyncArgs) -> Result<()> {
    let pool = super::connect_pool().await?;

    MIGRATOR.run(&pool).await?;

    let store = PgSyncStore::new(pool.clone());
    let syncer = StudentSyncer::new(
        CodeforcesClient::new(CODEFORCES_API_URL)?,
        PgSyncStore::new(pool),
        SyncPolicy::default(),
    );

    if args.all {
        let summary = syncer.sync_all().await?;
        tracing::info!(
            "synced {} students: {} succeeded, {} failed",
            summary.total_students,
            summary.successful,
            summary.failed
        );
        if summary.failed > 0 {
            bail!("{} students failed to sync", summary.failed);
        }
        return Ok(());
    }

    let student_id = args
        .student_id
        .context("--student-id is required unless --all is given")?;
    let handle = match args.handle {
        Some(handle) => handle,
        None => {
            store
                .get_student(student_id)
                .await?
                .with_context(|| format!("student {} not found", student_id))?
                .handle
        }
    };

    let outcome = syncer.sync_student(student_id, &handle).await;
    if outcome.success {
        tracing::info!("{}", outcome.message);
        Ok(())
    } else {
        bail!(outcome.message)
    }
}
