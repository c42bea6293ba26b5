//! Timing resolver — converts a matched rule plus context into either an
//! immediate action or a concrete fire timestamp.
//!
//! Everything here is a pure function of its arguments; all clock reads
//! happen in the caller so passes stay replayable.

use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::automation::model::DelaySpec;
use crate::campaign::model::DripCampaignEmail;

/// Outcome of timing resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Fire within the same evaluation pass; no due-item is persisted.
    Immediate,
    /// Persist a due-item and fire at (or after) this time.
    At(DateTime<Utc>),
}

/// Resolve a communication delay against the trigger time.
///
/// `fire_at = trigger + days + hours + minutes`; a pinned clock time
/// replaces the resolved time-of-day and pushes *forward* to the next
/// occurrence of that clock time if the pin would move the fire time
/// backward.
pub fn resolve_communication(delay: &DelaySpec, trigger_time: DateTime<Utc>) -> Resolution {
    if delay.is_immediate() {
        return Resolution::Immediate;
    }

    let base = trigger_time
        + Duration::days(delay.days)
        + Duration::hours(delay.hours)
        + Duration::minutes(delay.minutes);

    let fire_at = match &delay.send_at {
        None => base,
        // An out-of-range pin (possible only for rules that bypassed
        // validation) is ignored rather than panicking mid-batch.
        Some(clock) => match base.date_naive().and_hms_opt(clock.hour, clock.minute, 0) {
            Some(t) => {
                let pinned = t.and_utc();
                if pinned < base {
                    pinned + Duration::days(1)
                } else {
                    pinned
                }
            }
            None => base,
        },
    };

    Resolution::At(fire_at)
}

/// Resolve a countdown automation for one subject.
///
/// `fire_at = anchor_date - days_before` clamped to the tenant send hour.
/// Returns `None` when the fire time is already past the grace window —
/// countdowns are never backfilled.
pub fn resolve_countdown(
    anchor_date: NaiveDate,
    days_before: i64,
    send_hour: u32,
    now: DateTime<Utc>,
    grace_days: i64,
) -> Option<DateTime<Utc>> {
    let fire_date = anchor_date - Duration::days(days_before);
    let fire_at = fire_date.and_hms_opt(send_hour, 0, 0)?.and_utc();

    if fire_at < now - Duration::days(grace_days) {
        return None;
    }
    Some(fire_at)
}

/// Cumulative offset of email `index` from subscription start: the sum of
/// each step's day/week offset up to and including that step.
pub fn cumulative_offset(emails: &[DripCampaignEmail], index: u32) -> Option<Duration> {
    let index = index as usize;
    if index >= emails.len() {
        return None;
    }
    Some(
        emails[..=index]
            .iter()
            .fold(Duration::zero(), |acc, email| {
                acc + email.offset.as_duration()
            }),
    )
}

/// When email `index` of a subscription is due, or `None` if the sequence
/// is exhausted. `emails` must be ordered by `email_index`.
pub fn resolve_step_time(
    started_at: DateTime<Utc>,
    emails: &[DripCampaignEmail],
    index: u32,
) -> Option<DateTime<Utc>> {
    cumulative_offset(emails, index).map(|offset| started_at + offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::model::{EmailApproval, StepOffset};
    use chrono::TimeZone;
    use uuid::Uuid;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn email(index: u32, offset: StepOffset) -> DripCampaignEmail {
        DripCampaignEmail {
            id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
            email_index: index,
            subject: format!("email {index}"),
            body: String::new(),
            offset,
            approval: EmailApproval::Approved,
        }
    }

    #[test]
    fn zero_delay_resolves_immediate() {
        let resolution = resolve_communication(&DelaySpec::default(), Utc::now());
        assert_eq!(resolution, Resolution::Immediate);
    }

    #[test]
    fn delay_math_adds_components() {
        let delay = DelaySpec {
            days: 2,
            hours: 3,
            minutes: 15,
            send_at: None,
        };
        let trigger = utc(2025, 6, 1, 9, 0);
        assert_eq!(
            resolve_communication(&delay, trigger),
            Resolution::At(utc(2025, 6, 3, 12, 15))
        );
    }

    #[test]
    fn pin_to_hour_keeps_same_day_when_forward() {
        // Base lands at 09:00; pin to 17:00 → same day.
        let delay = DelaySpec {
            days: 1,
            hours: 0,
            minutes: 0,
            send_at: Some(crate::automation::model::ClockTime {
                hour: 17,
                minute: 0,
            }),
        };
        let trigger = utc(2025, 6, 1, 9, 0);
        assert_eq!(
            resolve_communication(&delay, trigger),
            Resolution::At(utc(2025, 6, 2, 17, 0))
        );
    }

    #[test]
    fn pin_to_hour_pushes_forward_not_backward() {
        // Base lands at 18:30; pin to 08:00 → next day 08:00, never earlier.
        let delay = DelaySpec {
            days: 1,
            hours: 0,
            minutes: 0,
            send_at: Some(crate::automation::model::ClockTime { hour: 8, minute: 0 }),
        };
        let trigger = utc(2025, 6, 1, 18, 30);
        assert_eq!(
            resolve_communication(&delay, trigger),
            Resolution::At(utc(2025, 6, 3, 8, 0))
        );
    }

    #[test]
    fn pin_only_delay_is_not_immediate() {
        let delay = DelaySpec {
            send_at: Some(crate::automation::model::ClockTime {
                hour: 10,
                minute: 30,
            }),
            ..Default::default()
        };
        let trigger = utc(2025, 6, 1, 9, 0);
        assert_eq!(
            resolve_communication(&delay, trigger),
            Resolution::At(utc(2025, 6, 1, 10, 30))
        );
    }

    #[test]
    fn countdown_fires_days_before_anchor_at_send_hour() {
        // Wedding on 2025-06-14, 7 days before, send hour 10.
        let anchor = NaiveDate::from_ymd_opt(2025, 6, 14).unwrap();
        let now = utc(2025, 6, 1, 0, 0);
        let fire_at = resolve_countdown(anchor, 7, 10, now, 1).unwrap();
        assert_eq!(fire_at, utc(2025, 6, 7, 10, 0));
    }

    #[test]
    fn countdown_past_grace_window_is_skipped() {
        let anchor = NaiveDate::from_ymd_opt(2025, 6, 14).unwrap();
        // Fire date would be 2025-06-07; it's now the 12th.
        let now = utc(2025, 6, 12, 0, 0);
        assert!(resolve_countdown(anchor, 7, 10, now, 1).is_none());
    }

    #[test]
    fn countdown_within_grace_window_still_fires() {
        let anchor = NaiveDate::from_ymd_opt(2025, 6, 14).unwrap();
        // Fire time 2025-06-07T10:00; now late on the 7th.
        let now = utc(2025, 6, 7, 23, 0);
        assert!(resolve_countdown(anchor, 7, 10, now, 1).is_some());
    }

    #[test]
    fn negative_days_before_fires_after_anchor() {
        let anchor = NaiveDate::from_ymd_opt(2025, 6, 14).unwrap();
        let now = utc(2025, 6, 1, 0, 0);
        let fire_at = resolve_countdown(anchor, -3, 9, now, 1).unwrap();
        assert_eq!(fire_at, utc(2025, 6, 17, 9, 0));
    }

    #[test]
    fn cumulative_offsets_sum_inclusively() {
        let emails = vec![
            email(0, StepOffset::Days(0)),
            email(1, StepOffset::Days(9)),
            email(2, StepOffset::Weeks(2)),
        ];
        assert_eq!(cumulative_offset(&emails, 0), Some(Duration::days(0)));
        assert_eq!(cumulative_offset(&emails, 1), Some(Duration::days(9)));
        assert_eq!(cumulative_offset(&emails, 2), Some(Duration::days(23)));
        assert_eq!(cumulative_offset(&emails, 3), None);
    }

    #[test]
    fn step_time_from_subscription_start() {
        let emails = vec![email(0, StepOffset::Days(0)), email(1, StepOffset::Days(9))];
        let start = utc(2025, 1, 1, 10, 0);
        assert_eq!(
            resolve_step_time(start, &emails, 1),
            Some(utc(2025, 1, 10, 10, 0))
        );
        assert_eq!(resolve_step_time(start, &emails, 2), None);
    }
}
