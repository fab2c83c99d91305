use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Weekday};
use serde::{Serialize, Serializer};

/// Date column format (`2024-05-01`).
pub const DATE_FORMAT: &str = "%Y-%m-%d";
/// Time column format (`09:00:00`).
pub const TIME_FORMAT: &str = "%H:%M:%S";

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// One attendance event: a self-reported name seen on a given day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceRecord {
    pub name: String,
    pub date: NaiveDate,
    #[serde(serialize_with = "serialize_weekday")]
    pub day: Weekday,
    pub time: NaiveTime,
}

impl AttendanceRecord {
    /// Build a record for `name` at `at`; the weekday is derived from the
    /// date and the time is truncated to whole seconds.
    pub fn new(name: impl Into<String>, at: NaiveDateTime) -> Self {
        let time = at.time();
        let time = NaiveTime::from_hms_opt(time.hour(), time.minute(), time.second())
            .unwrap_or(time);
        Self {
            name: name.into(),
            date: at.date(),
            day: at.date().weekday(),
            time,
        }
    }

    pub fn date_field(&self) -> String {
        self.date.format(DATE_FORMAT).to_string()
    }

    pub fn day_field(&self) -> &'static str {
        weekday_name(self.day)
    }

    pub fn time_field(&self) -> String {
        self.time.format(TIME_FORMAT).to_string()
    }
}

/// Result of an append-if-absent against the store.
///
/// `AlreadyPresent` is an ordinary outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    AlreadyPresent,
    Failed(String),
}

/// Full English weekday name, as written to the `Day` column.
pub fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

fn serialize_weekday<S: Serializer>(day: &Weekday, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(weekday_name(*day))
}
