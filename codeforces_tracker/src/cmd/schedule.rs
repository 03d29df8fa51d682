use crate::modules::{
    migration::MIGRATOR,
    schedule::{generate_cron_expression, next_run_after, Frequency, ScheduleSettings},
    students::{
        store::{PgSyncStore, SyncStore},
        syncer::{StudentSyncer, SyncPolicy},
    },
};
use anyhow::Result;
use chrono::Utc;
use clap::Args;
use codeforces_tracker_libs::codeforces::client::{CodeforcesClient, CODEFORCES_API_URL};
use tokio::time::{self, Duration};

/// スケジューラのポーリング間隔
const CHECK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Args)]
pub struct ScheduleArgs {
    /// 同期の頻度を設定する(設定フラグのいずれかを指定すると保存して終了する)
    #[arg(long)]
    frequency: Option<Frequency>,
    /// 実行時刻(時)
    #[arg(long)]
    hour: Option<u32>,
    /// 実行時刻(分)
    #[arg(long)]
    minute: Option<u32>,
    /// スケジュール実行の有効・無効
    #[arg(long)]
    enabled: Option<bool>,
}

impl ScheduleArgs {
    fn is_update(&self) -> bool {
        self.frequency.is_some()
            || self.hour.is_some()
            || self.minute.is_some()
            || self.enabled.is_some()
    }
}

pub async fn run(args: ScheduleArgs) -> Result<()> {
    let pool = super::connect_pool().await?;

    MIGRATOR.run(&pool).await?;

    let store = PgSyncStore::new(pool.clone());

    if args.is_update() {
        let current = store.load_schedule_settings().await?.unwrap_or_default();
        let settings = ScheduleSettings {
            enabled: args.enabled.unwrap_or(current.enabled),
            frequency: args.frequency.unwrap_or(current.frequency),
            hour: args.hour.unwrap_or(current.hour),
            minute: args.minute.unwrap_or(current.minute),
        };
        let expression = generate_cron_expression(&settings);
        store.save_schedule_settings(&settings, &expression).await?;
        tracing::info!("Schedule settings saved: {:?} (cron: {})", settings, expression);
        return Ok(());
    }

    let syncer = StudentSyncer::new(
        CodeforcesClient::new(CODEFORCES_API_URL)?,
        PgSyncStore::new(pool),
        SyncPolicy::default(),
    );

    tracing::info!("Start schedule polling loop.");

    // 次回実行時刻。設定が無効になったらリセットする。
    let mut next_sync = None;
    loop {
        let settings = match store.load_schedule_settings().await {
            Ok(settings) => settings,
            Err(e) => {
                tracing::error!("failed to load schedule settings: {:?}", e);
                None
            }
        };

        match settings {
            Some(settings) if settings.enabled => {
                let now = Utc::now();
                match next_sync {
                    None => {
                        let at = next_run_after(now, &settings);
                        tracing::info!("Next sync scheduled at {}.", at);
                        next_sync = Some(at);
                    }
                    Some(at) if now >= at => {
                        tracing::info!("Scheduled sync triggered.");
                        match syncer.sync_all().await {
                            Ok(summary) => {
                                tracing::info!(
                                    "Scheduled sync finished: {}/{} students succeeded.",
                                    summary.successful,
                                    summary.total_students
                                );
                            }
                            Err(e) => {
                                tracing::error!("scheduled sync failed: {:?}", e);
                            }
                        }
                        next_sync = Some(Utc::now() + settings.frequency.interval());
                    }
                    Some(_) => {}
                }
            }
            _ => {
                next_sync = None;
            }
        }

        time::sleep(CHECK_INTERVAL).await;
    }
}
