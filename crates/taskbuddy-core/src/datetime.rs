use std::fs;
use std::path::{
  Path,
  PathBuf
};
use std::sync::OnceLock;

use anyhow::{
  Context,
  anyhow
};
use chrono::{
  DateTime,
  Datelike,
  Duration,
  NaiveDate,
  NaiveDateTime,
  SecondsFormat,
  Utc,
  Weekday
};
use chrono_tz::Tz;
use regex::Regex;
use serde::Deserialize;

const TIMEZONE_CONFIG_FILE: &str =
  "taskbuddy-time.toml";
const TIMEZONE_ENV_VAR: &str =
  "TASKBUDDY_TIMEZONE";
const TIMEZONE_CONFIG_ENV_VAR: &str =
  "TASKBUDDY_TIME_CONFIG";

const DUE_DISPLAY_FORMAT: &str =
  "%d %b, %Y";
const ACTIVITY_DISPLAY_FORMAT: &str =
  "%d %b %Y, %H:%M";

#[derive(Debug, Deserialize)]
struct TimezoneFile {
  timezone: String
}

pub fn display_timezone() -> &'static Tz
{
  static DISPLAY_TZ: OnceLock<Tz> =
    OnceLock::new();
  DISPLAY_TZ.get_or_init(
    resolve_display_timezone
  )
}

#[must_use]
pub fn local_today(
  now: DateTime<Utc>
) -> NaiveDate {
  now.with_timezone(display_timezone())
    .date_naive()
}

/// Timestamp text in the shape the
/// store keeps: UTC, millisecond
/// precision, `Z` suffix.
#[must_use]
pub fn iso_timestamp(
  dt: DateTime<Utc>
) -> String {
  dt.to_rfc3339_opts(
    SecondsFormat::Millis,
    true
  )
}

#[must_use]
pub fn due_date_to_iso(
  date: NaiveDate
) -> String {
  let midnight = date
    .and_hms_opt(0, 0, 0)
    .unwrap_or_default();
  iso_timestamp(
    DateTime::<Utc>::from_naive_utc_and_offset(
      midnight, Utc
    )
  )
}

/// Parses a stored due date. `None`
/// means the value is unusable for
/// ordering.
pub fn parse_due_timestamp(
  raw: &str
) -> Option<DateTime<Utc>> {
  let token = raw.trim();
  if token.is_empty() {
    return None;
  }

  if let Ok(dt) =
    DateTime::parse_from_rfc3339(token)
  {
    return Some(dt.with_timezone(&Utc));
  }

  for fmt in [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M"
  ] {
    if let Ok(naive) =
      NaiveDateTime::parse_from_str(
        token, fmt
      )
    {
      return Some(
        DateTime::<Utc>::from_naive_utc_and_offset(
          naive, Utc
        )
      );
    }
  }

  NaiveDate::parse_from_str(
    token, "%Y-%m-%d"
  )
  .ok()
  .and_then(|date| {
    date.and_hms_opt(0, 0, 0)
  })
  .map(|naive| {
    DateTime::<Utc>::from_naive_utc_and_offset(
      naive, Utc
    )
  })
}

/// `Today`, `01 Jun, 2024`, or
/// `Invalid Date`.
#[must_use]
pub fn format_due_display(
  raw: &str,
  now: DateTime<Utc>
) -> String {
  let Some(due) =
    parse_due_timestamp(raw)
  else {
    return "Invalid Date".to_string();
  };

  let date = due.date_naive();
  if date == local_today(now) {
    "Today".to_string()
  } else {
    date
      .format(DUE_DISPLAY_FORMAT)
      .to_string()
  }
}

#[must_use]
pub fn format_activity_time(
  raw: &str
) -> String {
  match DateTime::parse_from_rfc3339(
    raw.trim()
  ) {
    | Ok(dt) => {
      dt.with_timezone(
        display_timezone()
      )
      .format(ACTIVITY_DISPLAY_FORMAT)
      .to_string()
    }
    | Err(_) => raw.to_string()
  }
}

#[tracing::instrument(skip(now))]
pub fn parse_due_expr(
  input: &str,
  now: DateTime<Utc>
) -> anyhow::Result<String> {
  let token = input.trim();
  if token.is_empty() {
    return Err(anyhow!(
      "due date cannot be empty"
    ));
  }
  let lower =
    token.to_ascii_lowercase();
  let today = local_today(now);

  match lower.as_str() {
    | "today" => {
      return Ok(due_date_to_iso(today));
    }
    | "tomorrow" => {
      return Ok(due_date_to_iso(
        today + Duration::days(1)
      ));
    }
    | "yesterday" => {
      return Ok(due_date_to_iso(
        today - Duration::days(1)
      ));
    }
    | _ => {}
  }

  if let Some(days) =
    parse_day_offset(&lower)?
  {
    return Ok(due_date_to_iso(
      today + Duration::days(days)
    ));
  }

  if let Some(target_weekday) =
    parse_weekday_name(&lower)
  {
    return Ok(due_date_to_iso(
      next_weekday_date(
        today,
        target_weekday
      )
    ));
  }

  if let Ok(date) =
    NaiveDate::parse_from_str(
      token, "%d/%m/%Y"
    )
  {
    return Ok(due_date_to_iso(date));
  }

  if let Some(due) =
    parse_due_timestamp(token)
  {
    return Ok(iso_timestamp(due));
  }

  Err(anyhow!(
    "unrecognized due date '{input}'. \
     Supported: today, tomorrow, \
     yesterday, weekday names (e.g. \
     friday), +Nd, DD/MM/YYYY, \
     YYYY-MM-DD, RFC3339"
  ))
}

fn parse_day_offset(
  token: &str
) -> anyhow::Result<Option<i64>> {
  static OFFSET_RE: OnceLock<
    Option<Regex>
  > = OnceLock::new();
  let Some(offset_re) = OFFSET_RE
    .get_or_init(|| {
      Regex::new(
        r"^(?P<sign>[+-])(?P<days>\d{1,4})d$"
      )
      .ok()
    })
  else {
    return Ok(None);
  };

  let Some(captures) =
    offset_re.captures(token)
  else {
    return Ok(None);
  };

  let days: i64 = captures["days"]
    .parse()
    .context("invalid day offset")?;
  if &captures["sign"] == "-" {
    Ok(Some(-days))
  } else {
    Ok(Some(days))
  }
}

fn parse_weekday_name(
  token: &str
) -> Option<Weekday> {
  match token.trim() {
    | "monday" | "mon" => {
      Some(Weekday::Mon)
    }
    | "tuesday" | "tue" | "tues" => {
      Some(Weekday::Tue)
    }
    | "wednesday" | "wed" => {
      Some(Weekday::Wed)
    }
    | "thursday" | "thu" | "thur"
    | "thurs" => Some(Weekday::Thu),
    | "friday" | "fri" => {
      Some(Weekday::Fri)
    }
    | "saturday" | "sat" => {
      Some(Weekday::Sat)
    }
    | "sunday" | "sun" => {
      Some(Weekday::Sun)
    }
    | _ => None
  }
}

fn next_weekday_date(
  from: NaiveDate,
  target: Weekday
) -> NaiveDate {
  let from_idx = from
    .weekday()
    .num_days_from_monday()
    as i64;
  let target_idx = target
    .num_days_from_monday()
    as i64;
  let mut delta =
    (7 + target_idx - from_idx) % 7;
  if delta == 0 {
    delta = 7;
  }
  from
    .checked_add_signed(Duration::days(
      delta
    ))
    .unwrap_or(from)
}

/// `TASKBUDDY_TIMEZONE`, then the
/// `timezone` key of the time config
/// file, then UTC. Bad values are
/// logged and skipped.
fn resolve_display_timezone() -> Tz {
  let from_env = std::env::var(
    TIMEZONE_ENV_VAR
  )
  .ok()
  .filter(|raw| !raw.trim().is_empty());

  let configured = from_env.or_else(|| {
    let path = timezone_config_path();
    if !path.exists() {
      return None;
    }
    read_timezone_file(&path)
      .map_err(|err| {
        tracing::warn!(error = %format!("{err:#}"), "ignoring timezone file");
      })
      .ok()
  });

  let Some(name) = configured else {
    return chrono_tz::UTC;
  };
  name.trim().parse::<Tz>().unwrap_or_else(
    |err| {
      tracing::warn!(timezone = %name, error = %err, "unknown timezone; using UTC");
      chrono_tz::UTC
    }
  )
}

fn timezone_config_path() -> PathBuf {
  std::env::var_os(
    TIMEZONE_CONFIG_ENV_VAR
  )
  .map(PathBuf::from)
  .unwrap_or_else(|| {
    PathBuf::from(TIMEZONE_CONFIG_FILE)
  })
}

fn read_timezone_file(
  path: &Path
) -> anyhow::Result<String> {
  let raw = fs::read_to_string(path)
    .with_context(|| {
      format!(
        "failed to read {}",
        path.display()
      )
    })?;
  let file: TimezoneFile =
    toml::from_str(&raw).with_context(
      || {
        format!(
          "failed to parse {}",
          path.display()
        )
      }
    )?;
  Ok(file.timezone)
}

#[cfg(test)]
mod tests {
  use chrono::{
    TimeZone,
    Utc
  };

  use super::{
    format_due_display,
    iso_timestamp,
    parse_due_expr,
    parse_due_timestamp,
    read_timezone_file
  };

  #[test]
  fn iso_timestamp_matches_store_shape()
  {
    let now = Utc
      .with_ymd_and_hms(
        2024, 6, 1, 0, 0, 0
      )
      .unwrap();
    assert_eq!(
      iso_timestamp(now),
      "2024-06-01T00:00:00.000Z"
    );
  }

  #[test]
  fn parses_stored_shapes() {
    assert!(
      parse_due_timestamp(
        "2024-06-01T00:00:00.000Z"
      )
      .is_some()
    );
    assert!(
      parse_due_timestamp("2024-06-01")
        .is_some()
    );
    assert!(
      parse_due_timestamp("soon")
        .is_none()
    );
    assert!(
      parse_due_timestamp("").is_none()
    );
  }

  #[test]
  fn parses_calendar_input() {
    let now = Utc
      .with_ymd_and_hms(
        2026, 2, 16, 12, 0, 0
      )
      .unwrap();

    assert_eq!(
      parse_due_expr("2024-06-01", now)
        .unwrap(),
      "2024-06-01T00:00:00.000Z"
    );
    assert_eq!(
      parse_due_expr("01/06/2024", now)
        .unwrap(),
      "2024-06-01T00:00:00.000Z"
    );
    assert!(
      parse_due_expr("whenever", now)
        .is_err()
    );
  }

  #[test]
  fn parses_day_offsets() {
    let now = Utc
      .with_ymd_and_hms(
        2026, 2, 16, 12, 0, 0
      )
      .unwrap();
    let parsed =
      parse_due_expr("+3d", now)
        .unwrap();
    let base =
      parse_due_expr("today", now)
        .unwrap();
    let base_day =
      parse_due_timestamp(&base)
        .unwrap()
        .date_naive();
    let parsed_day =
      parse_due_timestamp(&parsed)
        .unwrap()
        .date_naive();
    assert_eq!(
      (parsed_day - base_day)
        .num_days(),
      3
    );
  }

  #[test]
  fn formats_due_dates_for_display() {
    let now = Utc
      .with_ymd_and_hms(
        2026, 2, 16, 12, 0, 0
      )
      .unwrap();
    assert_eq!(
      format_due_display(
        "2024-06-01T00:00:00.000Z",
        now
      ),
      "01 Jun, 2024"
    );
    assert_eq!(
      format_due_display("nope", now),
      "Invalid Date"
    );
    let today =
      parse_due_expr("today", now)
        .unwrap();
    assert_eq!(
      format_due_display(&today, now),
      "Today"
    );
  }

  #[test]
  fn reads_timezone_file() {
    let temp = tempfile::tempdir()
      .expect("tempdir");
    let path =
      temp.path().join("time.toml");
    std::fs::write(
      &path,
      "timezone = \"Europe/Paris\"\n"
    )
    .expect("write");
    assert_eq!(
      read_timezone_file(&path).unwrap(),
      "Europe/Paris"
    );

    std::fs::write(&path, "zone = 1\n")
      .expect("write");
    assert!(
      read_timezone_file(&path).is_err()
    );
  }
}
