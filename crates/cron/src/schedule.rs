//! Next-fire computation for all schedule kinds.

use {
    chrono::{DateTime, Utc},
    chrono_tz::Tz,
    cron::Schedule,
};

use crate::{
    error::{Error, Result},
    types::CronSchedule,
};

/// Parse a cron expression. Five-field expressions get a leading `0` seconds
/// field; six and seven fields are passed through.
pub fn parse_cron(expr: &str) -> Result<Schedule> {
    let fields = expr.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {}", expr.trim()),
        6 | 7 => expr.trim().to_string(),
        n => {
            return Err(Error::invalid_expression(
                expr,
                format!("expected 5 to 7 fields, found {n}"),
            ));
        },
    };
    normalized
        .parse::<Schedule>()
        .map_err(|e| Error::invalid_expression(expr, e))
}

pub fn parse_timezone(tz: &str) -> Result<Tz> {
    tz.parse::<Tz>().map_err(|_| Error::unknown_timezone(tz))
}

/// Check that a schedule is computable at all.
pub fn validate_schedule(schedule: &CronSchedule, tz: Option<&str>) -> Result<()> {
    if let Some(tz) = tz {
        parse_timezone(tz)?;
    }
    match schedule {
        CronSchedule::Cron { expr } => parse_cron(expr).map(|_| ()),
        CronSchedule::Every { every_ms: 0, .. } => {
            Err(Error::invalid_schedule("interval must be greater than zero"))
        },
        CronSchedule::Every { .. } | CronSchedule::At { .. } => Ok(()),
    }
}

/// Next fire time in epoch millis.
///
/// Recurring schedules return the first point strictly after `now_ms`; missed
/// points are skipped. A one-shot always returns its timestamp so an overdue
/// one fires once. `None` means the schedule has no future occurrence.
pub fn compute_next_fire(
    schedule: &CronSchedule,
    tz: Option<&str>,
    now_ms: u64,
) -> Result<Option<u64>> {
    match schedule {
        CronSchedule::At { at_ms } => Ok(Some(*at_ms)),
        CronSchedule::Every {
            every_ms,
            anchor_ms,
        } => {
            if *every_ms == 0 {
                return Err(Error::invalid_schedule("interval must be greater than zero"));
            }
            let k = if now_ms < *anchor_ms {
                1
            } else {
                (now_ms - anchor_ms) / every_ms + 1
            };
            Ok(k.checked_mul(*every_ms)
                .and_then(|offset| anchor_ms.checked_add(offset)))
        },
        CronSchedule::Cron { expr } => {
            let schedule = parse_cron(expr)?;
            let Some(now) = i64::try_from(now_ms)
                .ok()
                .and_then(DateTime::<Utc>::from_timestamp_millis)
            else {
                return Ok(None);
            };
            let next = match tz {
                Some(tz) => {
                    let tz = parse_timezone(tz)?;
                    schedule
                        .after(&now.with_timezone(&tz))
                        .next()
                        .map(|dt| dt.timestamp_millis())
                },
                None => schedule.after(&now).next().map(|dt| dt.timestamp_millis()),
            };
            Ok(next.and_then(|ms| u64::try_from(ms).ok()))
        },
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    // 2024-02-01T00:00:00Z
    const FEB_1: u64 = 1_706_745_600_000;

    fn hh_mm(ms: u64) -> String {
        DateTime::<Utc>::from_timestamp_millis(ms as i64)
            .unwrap()
            .format("%H:%M")
            .to_string()
    }

    #[test]
    fn one_shot_returns_its_timestamp_even_when_overdue() {
        let s = CronSchedule::At { at_ms: 500 };
        assert_eq!(compute_next_fire(&s, None, 1_000).unwrap(), Some(500));
    }

    #[rstest]
    #[case(0, 60_000)]
    #[case(59_999, 60_000)]
    #[case(60_000, 120_000)]
    #[case(61_500, 120_000)]
    #[case(600_001, 660_000)]
    fn interval_stays_on_anchor_grid(#[case] elapsed: u64, #[case] expected_offset: u64) {
        let t0 = 1_000_000;
        let s = CronSchedule::Every {
            every_ms: 60_000,
            anchor_ms: t0,
        };
        assert_eq!(
            compute_next_fire(&s, None, t0 + elapsed).unwrap(),
            Some(t0 + expected_offset)
        );
    }

    #[test]
    fn interval_before_anchor_fires_one_interval_after_it() {
        let s = CronSchedule::Every {
            every_ms: 1_000,
            anchor_ms: 10_000,
        };
        assert_eq!(compute_next_fire(&s, None, 5_000).unwrap(), Some(11_000));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let s = CronSchedule::Every {
            every_ms: 0,
            anchor_ms: 0,
        };
        assert!(matches!(
            compute_next_fire(&s, None, 1),
            Err(Error::InvalidSchedule { .. })
        ));
    }

    #[test]
    fn five_field_expression_in_utc() {
        let s = CronSchedule::Cron {
            expr: "0 9 * * *".into(),
        };
        let next = compute_next_fire(&s, None, FEB_1).unwrap().unwrap();
        assert_eq!(hh_mm(next), "09:00");
    }

    #[test]
    fn expression_evaluates_in_job_timezone() {
        let s = CronSchedule::Cron {
            expr: "0 9 * * *".into(),
        };
        let next = compute_next_fire(&s, Some("Europe/Paris"), FEB_1)
            .unwrap()
            .unwrap();
        // 09:00 CET is 08:00 UTC in winter.
        assert_eq!(hh_mm(next), "08:00");
    }

    #[test]
    fn six_field_expression_with_seconds() {
        let s = CronSchedule::Cron {
            expr: "30 * * * * *".into(),
        };
        let next = compute_next_fire(&s, None, FEB_1).unwrap().unwrap();
        assert_eq!(next, FEB_1 + 30_000);
    }

    #[rstest]
    #[case("not valid")]
    #[case("* * * *")]
    #[case("99 * * * *")]
    fn bad_expressions(#[case] expr: &str) {
        assert!(matches!(
            parse_cron(expr),
            Err(Error::InvalidExpression { .. })
        ));
    }

    #[test]
    fn unknown_timezone() {
        let s = CronSchedule::Cron {
            expr: "0 9 * * *".into(),
        };
        assert!(matches!(
            validate_schedule(&s, Some("Mars/Olympus")),
            Err(Error::UnknownTimezone { .. })
        ));
    }
}
