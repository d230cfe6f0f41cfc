use chrono::{DateTime, Days, NaiveTime, Utc};
use tracing::{error, info};

use crate::error::{ConfigError, Result};
use crate::orchestrator::Orchestrator;
use crate::prefix::DateSelection;

/// Next instant strictly after `now` whose UTC hour is `hour_utc` on the hour.
pub fn next_fire(now: DateTime<Utc>, hour_utc: u32) -> Result<DateTime<Utc>> {
    let time = NaiveTime::from_hms_opt(hour_utc, 0, 0).ok_or_else(|| ConfigError::Invalid {
        field: "schedule.hour_utc",
        reason: format!("{hour_utc} is not an hour of the day"),
    })?;
    let today = now.date_naive().and_time(time).and_utc();
    if today > now {
        return Ok(today);
    }
    now.date_naive()
        .checked_add_days(Days::new(1))
        .map(|tomorrow| tomorrow.and_time(time).and_utc())
        .ok_or_else(|| ConfigError::Invalid {
            field: "schedule.hour_utc",
            reason: format!("no day after {now}"),
        })
}

/// Fires the age-based run once a day at `hour_utc`. A failed run is logged
/// and the loop waits for the next day; only scheduling errors end it.
pub async fn run_daily(orchestrator: &Orchestrator, hour_utc: u32, num_days_age: u32) -> Result<()> {
    loop {
        let now = Utc::now();
        let fire_at = next_fire(now, hour_utc)?;
        info!(%fire_at, "waiting for next scheduled run");
        let wait = (fire_at - now).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;

        let today = Utc::now().date_naive();
        match orchestrator.run(DateSelection::DaysAgo(num_days_age), today).await {
            Ok(report) => info!(run_id = %report.run_id, prefix = %report.prefix, "scheduled run finished"),
            Err(err) => error!(error = %err, "scheduled run failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn fires_later_today_before_the_hour() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 22, 30, 0).unwrap();
        assert_eq!(
            next_fire(now, 23).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 15, 23, 0, 0).unwrap()
        );
    }

    #[test]
    fn fires_tomorrow_once_the_hour_passed() {
        let now = Utc.with_ymd_and_hms(2024, 1, 31, 23, 0, 0).unwrap();
        assert_eq!(
            next_fire(now, 23).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 1, 23, 0, 0).unwrap()
        );
    }

    #[test]
    fn rejects_impossible_hour() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        assert!(next_fire(now, 24).is_err());
    }
}
