use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use cron::Schedule;

/// How far ahead `next_after` searches before declaring an expression
/// permanently inactive.
const HORIZON_DAYS: i64 = 366;

/// A parsed 6-field cron expression (second, minute, hour, day-of-month,
/// month, day-of-week). Supports `*`, ranges, steps and lists.
///
/// Evaluation is pure: the ticking task that actually sleeps until the next
/// fire lives in the supervisor, not here.
#[derive(Debug, Clone)]
pub struct CronExpr {
    expr: String,
    schedule: Schedule,
}

impl CronExpr {
    /// Parse an expression. Standard 5-field input ("m h dom mon dow") is
    /// accepted by prepending a zero seconds field.
    pub fn parse(expr: &str) -> Result<Self> {
        let normalized = normalize(expr);
        let schedule = Schedule::from_str(&normalized)
            .map_err(|err| anyhow!("unparseable cron expression {expr:?}: {err}"))?;
        Ok(Self {
            expr: expr.to_string(),
            schedule,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// The smallest instant strictly greater than `from` matching the
    /// expression, or `None` if no match exists within a year of `from`.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&from)
            .next()
            .filter(|at| *at <= from + Duration::days(HORIZON_DAYS))
    }
}

fn normalize(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {}", expr.trim())
    } else {
        expr.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::CronExpr;

    #[test]
    fn every_second_fires_on_the_next_second() {
        let expr = CronExpr::parse("* * * * * *").expect("expected expression to parse");
        let from = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let next = expr.next_after(from).expect("expected a next fire instant");
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 1).unwrap());
    }

    #[test]
    fn next_is_strictly_greater_than_from() {
        let expr = CronExpr::parse("0 * * * * *").expect("expected expression to parse");
        // `from` is itself a matching instant; next must move past it.
        let from = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let next = expr.next_after(from).expect("expected a next fire instant");
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 12, 1, 0).unwrap());
    }

    #[test]
    fn steps_ranges_and_lists_are_supported() {
        let step = CronExpr::parse("*/15 * * * * *").expect("step expression should parse");
        let from = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 16).unwrap();
        assert_eq!(
            step.next_after(from).expect("expected step fire"),
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 30).unwrap()
        );

        let range = CronExpr::parse("0 10-12 * * * *").expect("range expression should parse");
        let from = Utc.with_ymd_and_hms(2024, 5, 1, 12, 12, 30).unwrap();
        assert_eq!(
            range.next_after(from).expect("expected range fire"),
            Utc.with_ymd_and_hms(2024, 5, 1, 13, 10, 0).unwrap()
        );

        let list = CronExpr::parse("0 0 6,18 * * *").expect("list expression should parse");
        let from = Utc.with_ymd_and_hms(2024, 5, 1, 7, 0, 0).unwrap();
        assert_eq!(
            list.next_after(from).expect("expected list fire"),
            Utc.with_ymd_and_hms(2024, 5, 1, 18, 0, 0).unwrap()
        );
    }

    #[test]
    fn day_of_month_and_month_fields_roll_over_the_year() {
        let expr = CronExpr::parse("0 0 0 1 1 *").expect("expected expression to parse");
        let from = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        assert_eq!(
            expr.next_after(from).expect("expected new-year fire"),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn five_field_expressions_get_a_zero_seconds_field() {
        let expr = CronExpr::parse("30 4 * * *").expect("5-field expression should parse");
        let from = Utc.with_ymd_and_hms(2024, 5, 1, 4, 30, 0).unwrap();
        assert_eq!(
            expr.next_after(from).expect("expected daily fire"),
            Utc.with_ymd_and_hms(2024, 5, 2, 4, 30, 0).unwrap()
        );
    }

    #[test]
    fn unsatisfiable_expression_yields_none() {
        // February 30th never exists.
        let expr = CronExpr::parse("0 0 0 30 2 *").expect("expected expression to parse");
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(expr.next_after(from).is_none());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(CronExpr::parse("not a cron").is_err());
        assert!(CronExpr::parse("* * *").is_err());
    }
}
