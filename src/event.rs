//! Event records, event types and the fixed column catalogue.

use crate::value::Value;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Serve,
    Impression,
    Click,
    Purchase,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::Serve,
        EventType::Impression,
        EventType::Click,
        EventType::Purchase,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Serve => "serve",
            EventType::Impression => "impression",
            EventType::Click => "click",
            EventType::Purchase => "purchase",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown event type '{}'", s))
    }
}

/// Value domain of a column, used for literal coercion and rollup schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Int,
    Float,
    Str,
    Date,
    DateTime,
}

/// Every column of the event table, in physical schema order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Column {
    Ts,
    Type,
    AuctionId,
    AdvertiserId,
    PublisherId,
    BidPrice,
    UserId,
    TotalPrice,
    Country,
    Day,
    Week,
    Hour,
    Minute,
}

impl Column {
    pub const ALL: [Column; 13] = [
        Column::Ts,
        Column::Type,
        Column::AuctionId,
        Column::AdvertiserId,
        Column::PublisherId,
        Column::BidPrice,
        Column::UserId,
        Column::TotalPrice,
        Column::Country,
        Column::Day,
        Column::Week,
        Column::Hour,
        Column::Minute,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Column::Ts => "ts",
            Column::Type => "type",
            Column::AuctionId => "auction_id",
            Column::AdvertiserId => "advertiser_id",
            Column::PublisherId => "publisher_id",
            Column::BidPrice => "bid_price",
            Column::UserId => "user_id",
            Column::TotalPrice => "total_price",
            Column::Country => "country",
            Column::Day => "day",
            Column::Week => "week",
            Column::Hour => "hour",
            Column::Minute => "minute",
        }
    }

    pub fn from_name(name: &str) -> Option<Column> {
        Column::ALL.into_iter().find(|c| c.name() == name)
    }

    pub fn kind(&self) -> ColumnKind {
        match self {
            Column::Ts | Column::AdvertiserId | Column::PublisherId | Column::UserId => {
                ColumnKind::Int
            }
            Column::BidPrice | Column::TotalPrice => ColumnKind::Float,
            Column::Type | Column::AuctionId | Column::Country | Column::Minute => ColumnKind::Str,
            Column::Day | Column::Week => ColumnKind::Date,
            Column::Hour => ColumnKind::DateTime,
        }
    }

    /// Columns that SUM/AVG/MIN/MAX may be applied to.
    pub fn is_numeric(&self) -> bool {
        matches!(self.kind(), ColumnKind::Int | ColumnKind::Float)
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Calendar buckets of an event, derived in the configured timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalTime {
    pub day: NaiveDate,
    /// Monday of the local week.
    pub week: NaiveDate,
    pub hour: NaiveDateTime,
    pub minute: NaiveDateTime,
}

impl LocalTime {
    /// Convert a UTC epoch-millisecond timestamp into local buckets.
    /// Returns `None` for timestamps chrono cannot represent.
    pub fn derive(ts_ms: i64, tz: Tz) -> Option<Self> {
        let utc = DateTime::<Utc>::from_timestamp_millis(ts_ms)?;
        let local = utc.with_timezone(&tz).naive_local();
        let day = local.date();
        let week = day - Duration::days(i64::from(day.weekday().num_days_from_monday()));
        let hour = day.and_hms_opt(local.hour(), 0, 0)?;
        let minute = day.and_hms_opt(local.hour(), local.minute(), 0)?;
        Some(Self {
            day,
            week,
            hour,
            minute,
        })
    }

    pub fn minute_label(&self) -> String {
        self.minute.format("%Y-%m-%d %H:%M").to_string()
    }
}

/// A typed, immutable ad-serving event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub ts_ms: i64,
    pub event_type: EventType,
    pub auction_id: Option<String>,
    pub advertiser_id: Option<i32>,
    pub publisher_id: Option<i32>,
    pub bid_price: Option<f64>,
    pub user_id: Option<i64>,
    pub total_price: Option<f64>,
    pub country: String,
    pub local: LocalTime,
}

impl Event {
    /// Value of one column, matching what is stored in the partition files.
    pub fn value(&self, column: Column) -> Value {
        match column {
            Column::Ts => Value::Int(self.ts_ms),
            Column::Type => Value::Str(self.event_type.as_str().to_string()),
            Column::AuctionId => self
                .auction_id
                .as_ref()
                .map_or(Value::Null, |s| Value::Str(s.clone())),
            Column::AdvertiserId => self
                .advertiser_id
                .map_or(Value::Null, |v| Value::Int(i64::from(v))),
            Column::PublisherId => self
                .publisher_id
                .map_or(Value::Null, |v| Value::Int(i64::from(v))),
            Column::BidPrice => self.bid_price.map_or(Value::Null, Value::Float),
            Column::UserId => self.user_id.map_or(Value::Null, Value::Int),
            Column::TotalPrice => self.total_price.map_or(Value::Null, Value::Float),
            Column::Country => Value::Str(self.country.clone()),
            Column::Day => Value::Date(self.local.day),
            Column::Week => Value::Date(self.local.week),
            Column::Hour => Value::DateTime(self.local.hour),
            Column::Minute => Value::Str(self.local.minute_label()),
        }
    }
}
