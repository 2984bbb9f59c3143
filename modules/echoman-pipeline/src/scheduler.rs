//! Fixed Asia/Shanghai schedule: ingestion on even hours 8–22, stage one at
//! :05 after each period closes, stage two 15 minutes later. Next-fire
//! computation is pure; the loop just sleeps until the next instant.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
use tracing::{error, info};

use echoman_common::period::now_cn;
use echoman_common::{Period, PeriodKey};

use crate::deps::PipelineDeps;
use crate::{event_merge, global_merge, ingest};

const INGEST_HOURS: [u32; 8] = [8, 10, 12, 14, 16, 18, 20, 22];
/// Merge runs fire just after a period closes: the MORN window at 08:05,
/// AM at 12:05, PM at 18:05, EVE at 22:05.
const MERGE_FIRES: [(u32, Period); 4] = [
    (8, Period::Morn),
    (12, Period::Am),
    (18, Period::Pm),
    (22, Period::Eve),
];
const EVENT_MERGE_MINUTE: u32 = 5;
const GLOBAL_MERGE_MINUTE: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    Ingest,
    EventMerge(PeriodKey),
    GlobalMerge(PeriodKey),
}

/// All fire instants for one local date, sorted.
pub fn fires_for_date(date: NaiveDate) -> Vec<(NaiveDateTime, Job)> {
    let at = |hour: u32, minute: u32| {
        date.and_hms_opt(hour, minute, 0)
            .expect("schedule hours are valid")
    };

    let mut fires = Vec::with_capacity(INGEST_HOURS.len() + MERGE_FIRES.len() * 2);
    for hour in INGEST_HOURS {
        fires.push((at(hour, 0), Job::Ingest));
    }
    for (hour, period) in MERGE_FIRES {
        let key = PeriodKey::new(date, period);
        fires.push((at(hour, EVENT_MERGE_MINUTE), Job::EventMerge(key)));
        fires.push((at(hour, GLOBAL_MERGE_MINUTE), Job::GlobalMerge(key)));
    }
    fires.sort_by_key(|(instant, _)| *instant);
    fires
}

/// The first fire strictly after `now` (local Asia/Shanghai time).
pub fn next_fire(now: NaiveDateTime) -> (NaiveDateTime, Job) {
    for (instant, job) in fires_for_date(now.date()) {
        if instant > now {
            return (instant, job);
        }
    }
    // Past the last fire of the day: tomorrow's first.
    let tomorrow = now.date() + ChronoDuration::days(1);
    fires_for_date(tomorrow)[0]
}

/// Run the scheduler loop forever. Job failures are logged and the loop
/// continues; state transitions make every stage safe to re-fire.
pub async fn run_scheduler(deps: PipelineDeps) -> Result<()> {
    info!("Scheduler started (Asia/Shanghai)");
    loop {
        let now = now_cn().naive_local();
        let (fire_at, job) = next_fire(now);
        let wait = (fire_at - now).to_std().unwrap_or_default();
        info!(fire_at = %fire_at, job = ?job, wait_secs = wait.as_secs(), "Scheduler sleeping");
        tokio::time::sleep(wait).await;

        match job {
            Job::Ingest => {
                if let Err(e) = ingest::run_scheduled_ingest(&deps).await {
                    error!(error = %e, "scheduled ingestion failed");
                }
            }
            Job::EventMerge(period) => {
                if let Err(e) = event_merge::run_event_merge(&deps, period).await {
                    error!(error = %e, period = %period, "stage one failed");
                }
            }
            Job::GlobalMerge(period) => {
                if let Err(e) = global_merge::run_global_merge(&deps, period).await {
                    error!(error = %e, period = %period, "stage two failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 11, 7).unwrap()
    }

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        date().and_hms_opt(hour, minute, 0).unwrap()
    }

    #[test]
    fn full_day_has_sixteen_fires() {
        let fires = fires_for_date(date());
        assert_eq!(fires.len(), 16);
        assert!(fires.windows(2).all(|w| w[0].0 <= w[1].0), "fires sorted");
    }

    #[test]
    fn morning_sequence() {
        let (t, job) = next_fire(at(7, 59));
        assert_eq!(t, at(8, 0));
        assert_eq!(job, Job::Ingest);

        let (t, job) = next_fire(at(8, 1));
        assert_eq!(t, at(8, 5));
        assert_eq!(job, Job::EventMerge(PeriodKey::new(date(), Period::Morn)));

        let (t, job) = next_fire(at(8, 6));
        assert_eq!(t, at(8, 20));
        assert_eq!(job, Job::GlobalMerge(PeriodKey::new(date(), Period::Morn)));
    }

    #[test]
    fn stage_two_trails_stage_one_by_fifteen_minutes() {
        for (hour, period) in MERGE_FIRES {
            let (t1, j1) = next_fire(at(hour, 4));
            let (t2, j2) = next_fire(at(hour, 6));
            assert_eq!(j1, Job::EventMerge(PeriodKey::new(date(), period)));
            assert_eq!(j2, Job::GlobalMerge(PeriodKey::new(date(), period)));
            assert_eq!(t2 - t1, ChronoDuration::minutes(15));
        }
    }

    #[test]
    fn fire_instants_are_strictly_after_now() {
        // Exactly at a fire instant, that fire is done — move to the next.
        let (t, job) = next_fire(at(8, 5));
        assert_eq!(t, at(8, 20));
        assert_eq!(job, Job::GlobalMerge(PeriodKey::new(date(), Period::Morn)));
    }

    #[test]
    fn wraps_to_next_day() {
        let (t, job) = next_fire(at(22, 30));
        assert_eq!(
            t,
            (date() + ChronoDuration::days(1)).and_hms_opt(8, 0, 0).unwrap()
        );
        assert_eq!(job, Job::Ingest);
    }

    #[test]
    fn merge_periods_match_their_hours() {
        // The 12:05 run merges the AM window that just closed.
        let (_, job) = next_fire(at(12, 1));
        assert_eq!(job, Job::EventMerge(PeriodKey::new(date(), Period::Am)));
        let (_, job) = next_fire(at(22, 1));
        assert_eq!(job, Job::EventMerge(PeriodKey::new(date(), Period::Eve)));
    }
}
