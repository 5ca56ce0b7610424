//! Cron expression handling for recurring jobs.
//!
//! Both the classic five field syntax (`minute hour day-of-month month day-of-week`) and the six
//! or seven field syntax of the [`cron`] crate (with a leading seconds field and optional trailing
//! year) are accepted. A five field expression fires on second zero of each matching minute.
//!
//! All times are UTC.
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::JobkeeperError;

/// Parses `expression` into a [`Schedule`].
///
/// ```
/// assert!(jobkeeper::cron::parse("*/5 * * * *").is_ok());
/// assert!(jobkeeper::cron::parse("0 15 */4 * * *").is_ok());
/// assert!(jobkeeper::cron::parse("every tuesday").is_err());
/// ```
pub fn parse(expression: &str) -> Result<Schedule, JobkeeperError> {
    let normalized = normalize(expression);
    Schedule::from_str(&normalized).map_err(|source| JobkeeperError::InvalidCron {
        expression: expression.to_owned(),
        source,
    })
}

/// The smallest time on the grid of `expression` which is strictly after `now`.
///
/// Fails when the expression can't be parsed or will never fire again, rather than silently
/// scheduling a job for never.
pub fn next_fire_time(
    expression: &str,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, JobkeeperError> {
    parse(expression)?
        .after(&now)
        .next()
        .ok_or_else(|| {
            JobkeeperError::InvalidArgument(format!(
                "cron expression {expression} has no upcoming time after {now}"
            ))
        })
}

fn normalize(expression: &str) -> String {
    let expression = expression.trim();
    if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_owned()
    }
}
