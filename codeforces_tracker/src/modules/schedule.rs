use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
}

impl Frequency {
    /// ポーリング型スケジューラが次回実行時刻を進めるときに使う間隔
    pub fn interval(&self) -> Duration {
        match self {
            Frequency::Hourly => Duration::hours(1),
            Frequency::Daily => Duration::hours(24),
            Frequency::Weekly => Duration::days(7),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSettings {
    pub enabled: bool,
    pub frequency: Frequency,
    pub hour: u32,
    pub minute: u32,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        ScheduleSettings {
            enabled: false,
            frequency: Frequency::Daily,
            hour: 2,
            minute: 0,
        }
    }
}

/// 設定から5フィールドのcron式を組み立てる純粋関数
///
/// weeklyの曜日は日曜(0)固定。
pub fn generate_cron_expression(settings: &ScheduleSettings) -> String {
    let minute = settings.minute.min(59);
    let hour = settings.hour.min(23);

    match settings.frequency {
        Frequency::Hourly => format!("{} * * * *", minute),
        Frequency::Daily => format!("{} {} * * *", minute, hour),
        Frequency::Weekly => format!("{} {} * * 0", minute, hour),
    }
}

/// `now`より後で設定に合致する最初の実行時刻を返す関数
pub fn next_run_after(now: DateTime<Utc>, settings: &ScheduleSettings) -> DateTime<Utc> {
    let minute = settings.minute.min(59);
    let hour = settings.hour.min(23);

    // 秒以下を切り捨てて分単位の候補を作る
    let base = now
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .and_then(|t| t.with_minute(minute))
        .unwrap();

    match settings.frequency {
        Frequency::Hourly => {
            let mut candidate = base;
            while candidate <= now {
                candidate = candidate + Duration::hours(1);
            }
            candidate
        }
        Frequency::Daily => {
            let mut candidate = base.with_hour(hour).unwrap();
            while candidate <= now {
                candidate = candidate + Duration::hours(24);
            }
            candidate
        }
        Frequency::Weekly => {
            let mut candidate = base.with_hour(hour).unwrap();
            while candidate <= now || candidate.weekday() != Weekday::Sun {
                candidate = candidate + Duration::days(1);
            }
            candidate
        }
    }
}
