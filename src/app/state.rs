use time::{Month, OffsetDateTime};

use crate::calendar::DayKey;
use crate::store::{MessageRecord, MessageStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Navigation {
    year: i32,
    /// Zero-based.
    month: i32,
}

impl Navigation {
    pub fn current() -> Self {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        Self::at(now.year(), i32::from(u8::from(now.month())) - 1)
    }

    /// `month` is zero-based and rolls over into neighbouring years.
    pub fn at(year: i32, month: i32) -> Self {
        let mut nav = Self { year, month: 0 };
        nav.shift(month);
        nav
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u8 {
        (self.month + 1) as u8
    }

    pub fn month_index(&self) -> i32 {
        self.month
    }

    pub fn next(&mut self) {
        self.shift(1);
    }

    pub fn previous(&mut self) {
        self.shift(-1);
    }

    pub fn jump(&mut self, year: i32, month: i32) {
        *self = Self::at(year, month);
    }

    pub fn shift(&mut self, months: i32) {
        let total = i64::from(self.year) * 12 + i64::from(self.month) + i64::from(months);
        let year = total.div_euclid(12).clamp(i64::from(i32::MIN), i64::from(i32::MAX));
        self.year = year as i32;
        self.month = total.rem_euclid(12) as i32;
    }

    pub fn days(&self) -> u8 {
        DayKey::days_in_month(self.year, self.month)
    }

    pub fn first_day(&self) -> DayKey {
        DayKey::from_parts(self.year, self.month, 1)
    }

    pub fn label(&self) -> String {
        match Month::try_from(self.month()) {
            Ok(month) => format!("{month} {}", self.year),
            Err(_) => format!("{:02}/{}", self.month(), self.year),
        }
    }

    /// Empty cells before the 1st in a Sunday-first week grid.
    pub fn leading_blanks(&self) -> u8 {
        self.first_day()
            .to_date()
            .map_or(0, |date| date.weekday().number_days_from_sunday())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayCell {
    pub key: DayKey,
    pub day: u8,
    pub message: Option<MessageRecord>,
    pub own: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthView {
    pub label: String,
    pub leading_blanks: u8,
    pub days: Vec<DayCell>,
}

impl MonthView {
    pub fn build(nav: &Navigation, store: &MessageStore, user_id: &str) -> Self {
        let days = (1..=nav.days())
            .map(|day| {
                let key = DayKey::from_parts(nav.year(), nav.month_index(), i32::from(day));
                let message = store.get_message(key).cloned();
                let own = message
                    .as_ref()
                    .is_some_and(|record| record.is_authored_by(user_id));
                DayCell {
                    key,
                    day,
                    message,
                    own,
                }
            })
            .collect();
        Self {
            label: nav.label(),
            leading_blanks: nav.leading_blanks(),
            days,
        }
    }

    pub fn filled(&self) -> impl Iterator<Item = &DayCell> {
        self.days.iter().filter(|cell| cell.message.is_some())
    }
}
