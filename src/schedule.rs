//! Run-on-start plus once-a-day trigger for the analytics aggregator.

use std::future::Future;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeDelta, Utc};
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info};

use crate::aggregator::TenantBatchAggregator;

pub const DEFAULT_SCHEDULE_HOUR: u32 = 0;

/// Manila has no DST, so a fixed +08:00 offset stands in for the zone.
pub const DEFAULT_UTC_OFFSET_HOURS: i32 = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("schedule hour must be within 0..=23, got {0}")]
    InvalidHour(u32),
    #[error("utc offset must be within -23..=23 hours, got {0}")]
    InvalidOffset(i32),
}

/// A fixed wall-clock hour in a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailySchedule {
    at: NaiveTime,
    offset: FixedOffset,
}

impl DailySchedule {
    pub fn new(hour: u32, utc_offset_hours: i32) -> Result<Self, ScheduleError> {
        let at = NaiveTime::from_hms_opt(hour, 0, 0).ok_or(ScheduleError::InvalidHour(hour))?;
        let offset = (-23..=23)
            .contains(&utc_offset_hours)
            .then(|| FixedOffset::east_opt(utc_offset_hours * 3600))
            .flatten()
            .ok_or(ScheduleError::InvalidOffset(utc_offset_hours))?;
        Ok(Self { at, offset })
    }

    /// Calendar date at `now` in the schedule's offset.
    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset).date_naive()
    }

    /// First occurrence strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = now.with_timezone(&self.offset);
        let shift = TimeDelta::seconds(i64::from(self.offset.local_minus_utc()));
        let mut next = (local.date_naive().and_time(self.at) - shift).and_utc();
        if next <= now {
            next += TimeDelta::days(1);
        }
        next
    }
}

/// Calls `job` once right away and then at every occurrence of `schedule`,
/// until `shutdown` flips or its sender goes away. A job in progress is never
/// interrupted; shutdown is only observed between runs.
pub async fn run_daily<F, Fut>(
    schedule: DailySchedule,
    mut shutdown: watch::Receiver<bool>,
    mut job: F,
) where
    F: FnMut(NaiveDate) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        if *shutdown.borrow() {
            break;
        }

        job(schedule.today(Utc::now())).await;

        let now = Utc::now();
        let next = schedule.next_after(now);
        let wait = (next - now).to_std().unwrap_or_default();
        info!(next_run = %next.with_timezone(&schedule.offset), "next analytics run scheduled");

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => {
                debug!("scheduler received shutdown");
                break;
            }
        }
    }
    info!("analytics scheduler stopped");
}

/// Drives `aggregator` on `schedule` in a background task.
pub fn spawn_analytics_schedule(
    aggregator: TenantBatchAggregator,
    schedule: DailySchedule,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run_daily(schedule, shutdown, move |today| {
        let aggregator = aggregator.clone();
        async move {
            let range = aggregator.date_range_for(today);
            let summary = aggregator.run_batch(range).await;
            info!(
                total = summary.total,
                succeeded = summary.succeeded,
                failed = summary.failed,
                "analytics run complete"
            );
        }
    }))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tokio::sync::mpsc;

    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn rejects_out_of_range_settings() {
        assert_eq!(
            DailySchedule::new(24, 8),
            Err(ScheduleError::InvalidHour(24))
        );
        assert_eq!(
            DailySchedule::new(0, 30),
            Err(ScheduleError::InvalidOffset(30))
        );
        assert!(DailySchedule::new(23, -5).is_ok());
    }

    #[test]
    fn midnight_in_plus_eight() {
        let schedule = DailySchedule::new(0, 8).unwrap();

        // 2024-06-01 10:00 local.
        let now = utc(2024, 6, 1, 2, 0);
        assert_eq!(schedule.next_after(now), utc(2024, 6, 1, 16, 0));
        assert_eq!(schedule.today(now), NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());

        // 2024-06-02 01:30 local, still June 1st in UTC.
        let late = utc(2024, 6, 1, 17, 30);
        assert_eq!(schedule.today(late), NaiveDate::from_ymd_opt(2024, 6, 2).unwrap());
        assert_eq!(schedule.next_after(late), utc(2024, 6, 2, 16, 0));
    }

    #[test]
    fn next_occurrence_is_strictly_after_now() {
        let schedule = DailySchedule::new(0, 8).unwrap();
        let exactly = utc(2024, 6, 1, 16, 0);
        assert_eq!(schedule.next_after(exactly), utc(2024, 6, 2, 16, 0));

        let negative = DailySchedule::new(6, -5).unwrap();
        assert_eq!(
            negative.next_after(utc(2024, 6, 1, 10, 0)),
            utc(2024, 6, 1, 11, 0)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn runs_immediately_then_repeats_until_shutdown() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (runs_tx, mut runs_rx) = mpsc::unbounded_channel();
        let schedule = DailySchedule::new(0, 8).unwrap();

        let handle = tokio::spawn(run_daily(schedule, shutdown_rx, move |today| {
            let runs_tx = runs_tx.clone();
            async move {
                let _ = runs_tx.send(today);
            }
        }));

        assert!(runs_rx.recv().await.is_some());
        // Paused time auto-advances to the next occurrence.
        assert!(runs_rx.recv().await.is_some());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_sender_stops_the_loop() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let schedule = DailySchedule::new(0, 8).unwrap();
        let handle = tokio::spawn(run_daily(schedule, shutdown_rx, |_| async {}));
        drop(shutdown_tx);
        handle.await.unwrap();
    }
}
