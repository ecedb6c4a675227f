use chrono::{DateTime, Datelike, Duration, FixedOffset, TimeZone, Timelike, Weekday};
use serde::{Deserialize, Serialize};

use crate::types::PresetMode;

pub const MINUTES_PER_DAY: u16 = 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DayOfWeek {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl DayOfWeek {
    pub const ALL: [DayOfWeek; 7] = [
        Self::Mon,
        Self::Tue,
        Self::Wed,
        Self::Thu,
        Self::Fri,
        Self::Sat,
        Self::Sun,
    ];

    pub fn index(self) -> usize {
        match self {
            Self::Mon => 0,
            Self::Tue => 1,
            Self::Wed => 2,
            Self::Thu => 3,
            Self::Fri => 4,
            Self::Sat => 5,
            Self::Sun => 6,
        }
    }

    pub fn from_index(index: usize) -> Self {
        Self::ALL[index % 7]
    }

    pub fn from_chrono(weekday: Weekday) -> Self {
        match weekday {
            Weekday::Mon => Self::Mon,
            Weekday::Tue => Self::Tue,
            Weekday::Wed => Self::Wed,
            Weekday::Thu => Self::Thu,
            Weekday::Fri => Self::Fri,
            Weekday::Sat => Self::Sat,
            Weekday::Sun => Self::Sun,
        }
    }

    pub fn previous(self) -> Self {
        Self::from_index(self.index() + 6)
    }
}

pub fn minute_of_day(now: DateTime<FixedOffset>) -> u16 {
    now.hour() as u16 * 60 + now.minute() as u16
}

/// Daily window `[start, end)`; a start after the end crosses midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(rename = "startMinutes")]
    pub start_minutes: u16,
    #[serde(rename = "endMinutes")]
    pub end_minutes: u16,
}

impl TimeWindow {
    pub fn new(start_minutes: u16, end_minutes: u16) -> Self {
        Self {
            start_minutes,
            end_minutes,
        }
    }

    pub fn crosses_midnight(&self) -> bool {
        self.start_minutes > self.end_minutes
    }

    pub fn is_valid(&self) -> bool {
        self.start_minutes < MINUTES_PER_DAY
            && self.end_minutes < MINUTES_PER_DAY
            && self.start_minutes != self.end_minutes
    }

    pub fn contains(&self, minute: u16) -> bool {
        if self.crosses_midnight() {
            minute >= self.start_minutes || minute < self.end_minutes
        } else {
            minute >= self.start_minutes && minute < self.end_minutes
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleEntry {
    pub days: Vec<DayOfWeek>,
    #[serde(flatten)]
    pub window: TimeWindow,
    #[serde(rename = "targetTemp", default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub preset: Option<PresetMode>,
}

impl ScheduleEntry {
    pub fn validate(&self) -> bool {
        self.window.is_valid()
            && !self.days.is_empty()
            && (self.temperature.is_some() || self.preset.is_some())
            && self.temperature.map(f32::is_finite).unwrap_or(true)
    }

    /// The part of a midnight-crossing entry after 00:00 belongs to the day
    /// after the listed day.
    pub fn is_active(&self, now: DateTime<FixedOffset>) -> bool {
        let day = DayOfWeek::from_chrono(now.weekday());
        let minute = minute_of_day(now);
        let window = self.window;

        if !window.contains(minute) {
            return false;
        }
        if window.crosses_midnight() && minute < window.end_minutes {
            self.days.contains(&day.previous())
        } else {
            self.days.contains(&day)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScheduleSet {
    pub enabled: bool,
    pub entries: Vec<ScheduleEntry>,
}

impl Default for ScheduleSet {
    fn default() -> Self {
        Self {
            enabled: true,
            entries: Vec::new(),
        }
    }
}

impl ScheduleSet {
    pub fn normalize(&mut self) {
        self.entries.retain(ScheduleEntry::validate);
        for entry in &mut self.entries {
            entry.days.sort();
            entry.days.dedup();
        }
        self.entries.sort_by_key(|entry| {
            (
                entry.days.first().map(|day| day.index()).unwrap_or(0),
                entry.window.start_minutes,
            )
        });
    }

    pub fn active_entry(&self, now: DateTime<FixedOffset>) -> Option<&ScheduleEntry> {
        if !self.enabled {
            return None;
        }
        // Later entries win on overlap.
        self.entries.iter().rev().find(|entry| entry.is_active(now))
    }

    /// Next time an entry starts strictly after `now`, within a week.
    pub fn next_start(
        &self,
        now: DateTime<FixedOffset>,
    ) -> Option<(DateTime<FixedOffset>, &ScheduleEntry)> {
        if !self.enabled || self.entries.is_empty() {
            return None;
        }

        let now_day = DayOfWeek::from_chrono(now.weekday());
        let now_minute = minute_of_day(now);

        let mut best: Option<(DateTime<FixedOffset>, &ScheduleEntry)> = None;

        for day_offset in 0..=7i64 {
            let day = DayOfWeek::from_index(now_day.index() + day_offset as usize);
            for entry in self.entries.iter().filter(|entry| entry.days.contains(&day)) {
                if day_offset == 0 && entry.window.start_minutes <= now_minute {
                    continue;
                }

                let date = now.date_naive() + Duration::days(day_offset);
                let hour = (entry.window.start_minutes / 60) as u32;
                let minute = (entry.window.start_minutes % 60) as u32;

                let Some(naive) = date.and_hms_opt(hour, minute, 0) else {
                    continue;
                };

                let Some(candidate) = now.offset().from_local_datetime(&naive).single() else {
                    continue;
                };

                if best.map(|(current, _)| candidate < current).unwrap_or(true) {
                    best = Some((candidate, entry));
                }
            }
            if best.is_some() {
                break;
            }
        }

        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_time(day: u32, hour: u32, minute: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2026, 1, day, hour, minute, 0)
            .unwrap()
    }

    fn entry(days: Vec<DayOfWeek>, start: u16, end: u16, temperature: f32) -> ScheduleEntry {
        ScheduleEntry {
            days,
            window: TimeWindow::new(start, end),
            temperature: Some(temperature),
            preset: None,
        }
    }

    #[test]
    fn midnight_crossing_entry_is_active_on_both_sides() {
        let schedule = ScheduleSet {
            enabled: true,
            entries: vec![entry(DayOfWeek::ALL.to_vec(), 22 * 60, 6 * 60, 19.0)],
        };

        // Jan 5, 2026 is Monday.
        assert!(schedule.active_entry(fixed_time(5, 23, 30)).is_some());
        assert!(schedule.active_entry(fixed_time(6, 5, 30)).is_some());
        assert!(schedule.active_entry(fixed_time(5, 12, 0)).is_none());
    }

    #[test]
    fn crossing_tail_belongs_to_listed_day() {
        let schedule = ScheduleSet {
            enabled: true,
            entries: vec![entry(vec![DayOfWeek::Fri], 22 * 60, 6 * 60, 19.0)],
        };

        // Saturday 05:30 is the tail of Friday night.
        assert!(schedule.active_entry(fixed_time(10, 5, 30)).is_some());
        // Friday 05:30 would be Thursday's tail.
        assert!(schedule.active_entry(fixed_time(9, 5, 30)).is_none());
        assert!(schedule.active_entry(fixed_time(9, 23, 0)).is_some());
    }

    #[test]
    fn same_day_range_end_is_exclusive() {
        let schedule = ScheduleSet {
            enabled: true,
            entries: vec![entry(vec![DayOfWeek::Mon], 7 * 60, 9 * 60, 21.0)],
        };

        assert!(schedule.active_entry(fixed_time(5, 7, 0)).is_some());
        assert!(schedule.active_entry(fixed_time(5, 8, 59)).is_some());
        assert!(schedule.active_entry(fixed_time(5, 9, 0)).is_none());
    }

    #[test]
    fn disabled_set_never_matches() {
        let schedule = ScheduleSet {
            enabled: false,
            entries: vec![entry(DayOfWeek::ALL.to_vec(), 0, 23 * 60, 21.0)],
        };
        assert!(schedule.active_entry(fixed_time(5, 12, 0)).is_none());
    }

    #[test]
    fn normalize_drops_invalid_entries() {
        let mut schedule = ScheduleSet {
            enabled: true,
            entries: vec![
                entry(vec![DayOfWeek::Mon], 7 * 60, 7 * 60, 21.0),
                entry(vec![], 7 * 60, 9 * 60, 21.0),
                entry(vec![DayOfWeek::Tue, DayOfWeek::Tue], 7 * 60, 9 * 60, 21.0),
            ],
        };
        schedule.normalize();

        assert_eq!(schedule.entries.len(), 1);
        assert_eq!(schedule.entries[0].days, vec![DayOfWeek::Tue]);
    }

    #[test]
    fn finds_next_start_in_current_week() {
        let schedule = ScheduleSet {
            enabled: true,
            entries: vec![
                entry(vec![DayOfWeek::Mon], 9 * 60, 12 * 60, 21.0),
                entry(vec![DayOfWeek::Mon], 18 * 60, 22 * 60, 20.0),
            ],
        };

        let (next, next_entry) = schedule.next_start(fixed_time(5, 9, 1)).unwrap();
        assert_eq!(next, fixed_time(5, 18, 0));
        assert_eq!(next_entry.temperature, Some(20.0));
    }

    #[test]
    fn next_start_wraps_to_next_week() {
        let schedule = ScheduleSet {
            enabled: true,
            entries: vec![entry(vec![DayOfWeek::Mon], 6 * 60, 8 * 60, 21.0)],
        };

        let (next, _) = schedule.next_start(fixed_time(5, 7, 0)).unwrap();
        assert_eq!(next, fixed_time(12, 6, 0));
    }
}
