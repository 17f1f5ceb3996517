use chrono::{Datelike, Duration, NaiveDate, Weekday};
use std::collections::BTreeSet;

pub trait CalendarService: Send + Sync {
    fn is_business_day(&self, date: NaiveDate) -> bool;

    /// Move `days` business days away from `date`; negative values walk backwards.
    /// The starting date itself is never counted.
    fn business_day_offset(&self, date: NaiveDate, days: i32) -> NaiveDate {
        let step = if days < 0 { -1 } else { 1 };
        let mut remaining = days.unsigned_abs();
        let mut current = date;
        while remaining > 0 {
            current += Duration::days(step);
            if self.is_business_day(current) {
                remaining -= 1;
            }
        }
        current
    }
}

/// Monday-Friday calendar minus an explicit holiday list.
#[derive(Debug, Clone, Default)]
pub struct BusinessCalendar {
    holidays: BTreeSet<NaiveDate>,
}

impl BusinessCalendar {
    pub fn new<I: IntoIterator<Item = NaiveDate>>(holidays: I) -> Self {
        Self {
            holidays: holidays.into_iter().collect(),
        }
    }

    pub fn holidays(&self) -> impl Iterator<Item = &NaiveDate> {
        self.holidays.iter()
    }
}

impl CalendarService for BusinessCalendar {
    fn is_business_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }
}
