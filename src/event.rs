//! Event records and timestamp normalization.
//!
//! Collaborators hand over [`RawEvent`]s with textual timestamps. A raw event
//! becomes an [`Event`] only once its timestamp parses; otherwise it is turned
//! into a [`MalformedEventError`] that the run reports instead of aborting.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DATE_TIME_FORMATS: [&str; 5] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
];
const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%Y/%m/%d"];
const TIME_OF_DAY_FORMATS: [&str; 2] = ["%H:%M:%S", "%H:%M"];

/// Scalar attribute value. Missing values are modelled as `Option::None`
/// by the containers, never as a variant here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

pub type Attributes = BTreeMap<String, Option<AttrValue>>;

/// Which collection a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    Target,
    History,
}

impl EventOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Target => "target",
            Self::History => "history",
        }
    }
}

impl fmt::Display for EventOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("malformed {origin} event #{position} (entity '{entity_key}'): {reason}")]
pub struct MalformedEventError {
    pub origin: EventOrigin,
    pub position: usize,
    pub entity_key: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimestampError {
    #[error("timestamp is missing")]
    Missing,
    #[error("unparseable timestamp '{0}'")]
    Unparseable(String),
    #[error("unparseable time of day '{0}'")]
    UnparseableTimeOfDay(String),
    #[error("time of day supplied for full date-time '{0}'")]
    TimeOfDayWithDateTime(String),
}

/// Event as delivered by an acquisition collaborator, before validation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawEvent {
    pub entity_key: String,
    pub timestamp: Option<String>,
    /// Separate start time for sources that carry the date on its own.
    pub time_of_day: Option<String>,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub entity_key: String,
    pub timestamp: NaiveDateTime,
    pub attributes: Attributes,
}

impl Event {
    pub fn new(
        entity_key: impl Into<String>,
        timestamp: NaiveDateTime,
        attributes: Attributes,
    ) -> Self {
        Self {
            entity_key: entity_key.into(),
            timestamp,
            attributes,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&AttrValue> {
        self.attributes.get(name).and_then(Option::as_ref)
    }

    pub fn from_raw(
        raw: RawEvent,
        origin: EventOrigin,
        position: usize,
    ) -> Result<Self, MalformedEventError> {
        let RawEvent {
            entity_key,
            timestamp,
            time_of_day,
            attributes,
        } = raw;

        let parsed = match timestamp.as_deref() {
            Some(ts) => parse_timestamp(ts, time_of_day.as_deref()),
            None => Err(TimestampError::Missing),
        };

        match parsed {
            Ok(timestamp) => Ok(Self {
                entity_key,
                timestamp,
                attributes,
            }),
            Err(err) => Err(MalformedEventError {
                origin,
                position,
                entity_key,
                reason: err.to_string(),
            }),
        }
    }
}

/// Parses a timestamp, combining a date-only value with `time_of_day` when
/// one is supplied. Date-only values without a time resolve to midnight.
pub fn parse_timestamp(
    raw: &str,
    time_of_day: Option<&str>,
) -> Result<NaiveDateTime, TimestampError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(TimestampError::Missing);
    }
    let time_of_day = time_of_day.map(str::trim).filter(|t| !t.is_empty());

    if let Some(date_time) = parse_date_time(raw) {
        return match time_of_day {
            Some(_) => Err(TimestampError::TimeOfDayWithDateTime(raw.to_string())),
            None => Ok(date_time),
        };
    }

    let date = DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
        .ok_or_else(|| TimestampError::Unparseable(raw.to_string()))?;
    let time = match time_of_day {
        Some(tod) => TIME_OF_DAY_FORMATS
            .iter()
            .find_map(|format| NaiveTime::parse_from_str(tod, format).ok())
            .ok_or_else(|| TimestampError::UnparseableTimeOfDay(tod.to_string()))?,
        None => NaiveTime::MIN,
    };

    Ok(date.and_time(time))
}

/// Splits a raw collection into parsed events and per-record rejections.
/// Accepted events keep their relative input order.
pub fn parse_events(
    raw: Vec<RawEvent>,
    origin: EventOrigin,
) -> (Vec<Event>, Vec<MalformedEventError>) {
    let mut events = Vec::with_capacity(raw.len());
    let mut rejected = Vec::new();
    for (position, record) in raw.into_iter().enumerate() {
        match Event::from_raw(record, origin, position) {
            Ok(event) => events.push(event),
            Err(err) => rejected.push(err),
        }
    }
    (events, rejected)
}

/// Union of attribute names seen on any record.
pub fn observed_attributes<'a, I>(records: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a RawEvent>,
{
    records
        .into_iter()
        .flat_map(|record| record.attributes.keys().cloned())
        .collect()
}

fn parse_date_time(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(with_offset) = DateTime::parse_from_rfc3339(raw) {
        return Some(with_offset.naive_utc());
    }
    DATE_TIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd_hms(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    #[test]
    fn parses_common_date_time_layouts() {
        let expected = ymd_hms(2022, 6, 23, 15, 40, 0);
        assert_eq!(parse_timestamp("2022-06-23 15:40:00", None).unwrap(), expected);
        assert_eq!(parse_timestamp("2022-06-23T15:40:00", None).unwrap(), expected);
        assert_eq!(parse_timestamp("2022-06-23 15:40", None).unwrap(), expected);
        assert_eq!(parse_timestamp("2022/06/23 15:40", None).unwrap(), expected);
        assert_eq!(parse_timestamp("2022-06-23T15:40:00Z", None).unwrap(), expected);
        assert_eq!(
            parse_timestamp("2022-06-23T17:40:00+02:00", None).unwrap(),
            expected
        );
    }

    #[test]
    fn combines_date_with_separate_time_of_day() {
        assert_eq!(
            parse_timestamp("2022/06/23", Some("15:40")).unwrap(),
            ymd_hms(2022, 6, 23, 15, 40, 0)
        );
        assert_eq!(
            parse_timestamp("2022-06-23", None).unwrap(),
            ymd_hms(2022, 6, 23, 0, 0, 0)
        );
        assert_eq!(
            parse_timestamp("2022-06-23", Some("  ")).unwrap(),
            ymd_hms(2022, 6, 23, 0, 0, 0)
        );
    }

    #[test]
    fn rejects_bad_timestamps() {
        assert_eq!(parse_timestamp("  ", None), Err(TimestampError::Missing));
        assert!(matches!(
            parse_timestamp("23rd of June", None),
            Err(TimestampError::Unparseable(_))
        ));
        assert!(matches!(
            parse_timestamp("2022-06-23", Some("late")),
            Err(TimestampError::UnparseableTimeOfDay(_))
        ));
        assert!(matches!(
            parse_timestamp("2022-06-23 10:00", Some("11:00")),
            Err(TimestampError::TimeOfDayWithDateTime(_))
        ));
    }

    #[test]
    fn from_raw_reports_origin_and_position() {
        let raw = RawEvent {
            entity_key: "A".to_string(),
            timestamp: Some("not a time".to_string()),
            ..RawEvent::default()
        };
        let err = Event::from_raw(raw, EventOrigin::History, 7).unwrap_err();
        assert_eq!(err.origin, EventOrigin::History);
        assert_eq!(err.position, 7);
        assert_eq!(err.entity_key, "A");
        assert!(err.to_string().contains("malformed history event #7"));
    }

    #[test]
    fn parse_events_keeps_order_and_collects_rejections() {
        let raw = vec![
            RawEvent {
                entity_key: "A".to_string(),
                timestamp: Some("2022-01-01 10:00".to_string()),
                ..RawEvent::default()
            },
            RawEvent {
                entity_key: "B".to_string(),
                timestamp: None,
                ..RawEvent::default()
            },
            RawEvent {
                entity_key: "C".to_string(),
                timestamp: Some("2022-01-02 10:00".to_string()),
                ..RawEvent::default()
            },
        ];

        let (events, rejected) = parse_events(raw, EventOrigin::Target);
        let keys: Vec<&str> = events.iter().map(|e| e.entity_key.as_str()).collect();
        assert_eq!(keys, vec!["A", "C"]);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].position, 1);
        assert_eq!(rejected[0].reason, "timestamp is missing");
    }
}
