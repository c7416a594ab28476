use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Date, Month};

/// Days between 0000-03-01 and 1970-01-01.
const EPOCH_SHIFT: i64 = 719_468;
const DAYS_PER_ERA: i64 = 146_097;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DayKey {
    year: i64,
    month: u8,
    day: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseDayKeyError {
    #[error("day key '{0}' is not of the form YYYY-MM-DD")]
    Malformed(String),
    #[error("day key '{0}' does not name a calendar day")]
    OutOfRange(String),
    #[error("day key '{input}' is not canonical (expected '{canonical}')")]
    NotCanonical { input: String, canonical: String },
}

impl DayKey {
    /// `month` is zero-based; out-of-range months and days roll over.
    pub fn from_parts(year: i32, month: i32, day: i32) -> Self {
        let month = i64::from(month);
        let year = i64::from(year) + month.div_euclid(12);
        let first_of_month = days_from_civil(year, month.rem_euclid(12) + 1, 1);
        Self::from_epoch_days(first_of_month + i64::from(day) - 1)
    }

    pub fn from_date(date: Date) -> Self {
        Self {
            year: i64::from(date.year()),
            month: u8::from(date.month()),
            day: date.day(),
        }
    }

    /// Returns `None` when the year lies outside what `time::Date` can hold.
    pub fn to_date(&self) -> Option<Date> {
        let year = i32::try_from(self.year).ok()?;
        let month = Month::try_from(self.month).ok()?;
        Date::from_calendar_date(year, month, self.day).ok()
    }

    pub fn year(&self) -> i64 {
        self.year
    }

    pub fn month(&self) -> u8 {
        self.month
    }

    pub fn day(&self) -> u8 {
        self.day
    }

    pub fn days_in_month(year: i32, month: i32) -> u8 {
        Self::month_bounds(year, month).1.day
    }

    /// First and last day of the zero-based `month` of `year`, after rollover.
    pub fn month_bounds(year: i32, month: i32) -> (Self, Self) {
        let first = Self::from_parts(year, month, 1);
        let last = Self {
            day: days_in_civil_month(first.year, first.month),
            ..first
        };
        (first, last)
    }

    /// `DD/MM/YYYY`
    pub fn display_short(&self) -> String {
        format!("{:02}/{:02}/{}", self.day, self.month, self.year)
    }

    fn from_epoch_days(days: i64) -> Self {
        let (year, month, day) = civil_from_days(days);
        Self { year, month, day }
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if (0..=9999).contains(&self.year) {
            write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
        } else {
            write!(f, "{:+07}-{:02}-{:02}", self.year, self.month, self.day)
        }
    }
}

impl FromStr for DayKey {
    type Err = ParseDayKeyError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let malformed = || ParseDayKeyError::Malformed(input.to_string());
        let (sign, rest) = match input.as_bytes().first() {
            Some(b'+') => (1, &input[1..]),
            Some(b'-') => (-1, &input[1..]),
            _ => (1, input),
        };
        let mut parts = rest.splitn(3, '-');
        let (Some(year), Some(month), Some(day)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };
        let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        if !all_digits(year) || !all_digits(month) || !all_digits(day) {
            return Err(malformed());
        }
        let year: i64 = year.parse().map_err(|_| malformed())?;
        let month: u8 = month.parse().map_err(|_| malformed())?;
        let day: u8 = day.parse().map_err(|_| malformed())?;

        if !(1..=12).contains(&month) || day == 0 || day > days_in_civil_month(sign * year, month)
        {
            return Err(ParseDayKeyError::OutOfRange(input.to_string()));
        }
        let key = Self {
            year: sign * year,
            month,
            day,
        };
        let canonical = key.to_string();
        if canonical != input {
            return Err(ParseDayKeyError::NotCanonical {
                input: input.to_string(),
                canonical,
            });
        }
        Ok(key)
    }
}

impl From<(i32, i32, i32)> for DayKey {
    fn from((year, month, day): (i32, i32, i32)) -> Self {
        Self::from_parts(year, month, day)
    }
}

impl From<Date> for DayKey {
    fn from(date: Date) -> Self {
        Self::from_date(date)
    }
}

impl TryFrom<String> for DayKey {
    type Error = ParseDayKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DayKey> for String {
    fn from(key: DayKey) -> Self {
        key.to_string()
    }
}

fn is_leap_year(year: i64) -> bool {
    year.rem_euclid(4) == 0 && (year.rem_euclid(100) != 0 || year.rem_euclid(400) == 0)
}

fn days_in_civil_month(year: i64, month: u8) -> u8 {
    match month {
        2 if is_leap_year(year) => 29,
        2 => 28,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

/// Days since 1970-01-01 for a one-based month.
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let year = if month <= 2 { year - 1 } else { year };
    let era = year.div_euclid(400);
    let year_of_era = year - era * 400;
    let shifted_month = if month > 2 { month - 3 } else { month + 9 };
    let day_of_year = (153 * shifted_month + 2) / 5 + day - 1;
    let day_of_era = year_of_era * 365 + year_of_era / 4 - year_of_era / 100 + day_of_year;
    era * DAYS_PER_ERA + day_of_era - EPOCH_SHIFT
}

fn civil_from_days(days: i64) -> (i64, u8, u8) {
    let shifted = days + EPOCH_SHIFT;
    let era = shifted.div_euclid(DAYS_PER_ERA);
    let day_of_era = shifted - era * DAYS_PER_ERA;
    let year_of_era =
        (day_of_era - day_of_era / 1460 + day_of_era / 36_524 - day_of_era / 146_096) / 365;
    let day_of_year = day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100);
    let shifted_month = (5 * day_of_year + 2) / 153;
    let day = day_of_year - (153 * shifted_month + 2) / 5 + 1;
    let month = if shifted_month < 10 {
        shifted_month + 3
    } else {
        shifted_month - 9
    };
    let year = year_of_era + era * 400 + i64::from(month <= 2);
    (year, month as u8, day as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use time::macros::{date, format_description};

    #[test]
    fn formats_plain_dates() {
        assert_eq!(DayKey::from_parts(2024, 2, 15).to_string(), "2024-03-15");
        assert_eq!(DayKey::from_parts(1999, 11, 31).to_string(), "1999-12-31");
        assert_eq!(DayKey::from_parts(5, 0, 1).to_string(), "0005-01-01");
    }

    #[test]
    fn month_and_day_roll_over() {
        assert_eq!(DayKey::from_parts(2024, 12, 1).to_string(), "2025-01-01");
        assert_eq!(DayKey::from_parts(2024, -1, 1).to_string(), "2023-12-01");
        assert_eq!(DayKey::from_parts(2024, 2, 0).to_string(), "2024-02-29");
        assert_eq!(DayKey::from_parts(2023, 2, 0).to_string(), "2023-02-28");
        assert_eq!(DayKey::from_parts(2024, 0, 32).to_string(), "2024-02-01");
        assert_eq!(DayKey::from_parts(2024, 0, -30).to_string(), "2023-12-01");
        assert_eq!(DayKey::from_parts(2024, 25, 1).to_string(), "2026-02-01");
        assert_eq!(DayKey::from_parts(2024, -13, 1).to_string(), "2022-12-01");
    }

    #[test]
    fn rolled_over_inputs_share_a_key_with_their_normal_form() {
        assert_eq!(DayKey::from_parts(2024, -1, 1), DayKey::from_parts(2023, 11, 1));
        assert_eq!(DayKey::from_parts(2024, 1, 30), DayKey::from_parts(2024, 2, 1));
    }

    #[test]
    fn agrees_with_time_across_two_centuries() {
        let fmt = format_description!("[year]-[month]-[day]");
        let mut date = date!(1924 - 01 - 01);
        let end = date!(2124 - 12 - 31);
        let mut seen = HashSet::new();
        while date <= end {
            let key = DayKey::from_parts(
                date.year(),
                i32::from(u8::from(date.month())) - 1,
                i32::from(date.day()),
            );
            assert_eq!(key, DayKey::from_date(date));
            assert_eq!(key.to_string(), date.format(fmt).expect("formattable date"));
            assert_eq!(key.to_date(), Some(date));
            assert!(seen.insert(key.to_string()), "duplicate key for {date}");
            date = match date.next_day() {
                Some(next) => next,
                None => break,
            };
        }
    }

    #[test]
    fn days_in_month_handles_leap_years() {
        assert_eq!(DayKey::days_in_month(2024, 1), 29);
        assert_eq!(DayKey::days_in_month(1900, 1), 28);
        assert_eq!(DayKey::days_in_month(2000, 1), 29);
        assert_eq!(DayKey::days_in_month(2024, 3), 30);
        assert_eq!(DayKey::days_in_month(2024, 11), 31);
        assert_eq!(DayKey::days_in_month(-4, 1), 29);
        assert_eq!(DayKey::days_in_month(2024, i32::MAX), 31);
        assert_eq!(DayKey::days_in_month(2024, i32::MIN), 31);
    }

    #[test]
    fn expanded_years_stay_distinct() {
        let far = DayKey::from_parts(12_345, 0, 1);
        let before_zero = DayKey::from_parts(-1, 11, 31);
        assert_eq!(far.to_string(), "+012345-01-01");
        assert_eq!(before_zero.to_string(), "-000001-12-31");
        assert_eq!(DayKey::from_parts(-1, 12, 1).to_string(), "0000-01-01");
        assert_eq!("+012345-01-01".parse::<DayKey>(), Ok(far));
        assert_eq!("-000001-12-31".parse::<DayKey>(), Ok(before_zero));
    }

    #[test]
    fn parses_canonical_keys_only() {
        let key: DayKey = "2024-03-15".parse().expect("valid key");
        assert_eq!((key.year(), key.month(), key.day()), (2024, 3, 15));
        assert!(matches!(
            "2024-3-15".parse::<DayKey>(),
            Err(ParseDayKeyError::NotCanonical { .. })
        ));
        assert!(matches!(
            "2023-02-29".parse::<DayKey>(),
            Err(ParseDayKeyError::OutOfRange(_))
        ));
        assert!(matches!(
            "2024-13-01".parse::<DayKey>(),
            Err(ParseDayKeyError::OutOfRange(_))
        ));
        assert!(matches!(
            "hello".parse::<DayKey>(),
            Err(ParseDayKeyError::Malformed(_))
        ));
        assert!(matches!(
            "2024-03-1x".parse::<DayKey>(),
            Err(ParseDayKeyError::Malformed(_))
        ));
    }

    #[test]
    fn keys_order_chronologically() {
        let mut keys = vec![
            DayKey::from_parts(2024, 2, 1),
            DayKey::from_parts(2023, 11, 31),
            DayKey::from_parts(2024, 0, 15),
        ];
        keys.sort();
        let rendered: Vec<String> = keys.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, ["2023-12-31", "2024-01-15", "2024-03-01"]);
    }

    #[test]
    fn short_label_is_day_first() {
        assert_eq!(DayKey::from_parts(2024, 2, 5).display_short(), "05/03/2024");
    }
}
