//! Turns raw Sympla records into validated, typed events.
//!
//! Validation never panics and never halts a batch: every problem comes back as a
//! [`ValidationFailure`] naming the offending field and, when known, the record id.

use crate::error::{ValidationFailure, ValidationReason};
use crate::types::{Event, EventType, RawEventData};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Offset-aware layouts, tried after RFC 3339 and RFC 2822
const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
];

/// Layouts without an offset; read as UTC
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y"];

/// A category as Sympla sends it: a bare string or an object carrying `name`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CategoryField {
    Plain(String),
    Named(Option<String>),
}

impl CategoryField {
    pub fn decode(value: &Value) -> Result<Self, ValidationReason> {
        match value {
            Value::String(s) => Ok(CategoryField::Plain(s.clone())),
            Value::Object(map) => match map.get("name") {
                None | Some(Value::Null) => Ok(CategoryField::Named(None)),
                Some(Value::String(name)) => Ok(CategoryField::Named(Some(name.clone()))),
                Some(_) => Err(ValidationReason::WrongType {
                    expected: "string category name",
                }),
            },
            _ => Err(ValidationReason::WrongType {
                expected: "string or object with a name",
            }),
        }
    }

    /// The usable category name, if any
    pub fn name(&self) -> Option<String> {
        let raw = match self {
            CategoryField::Plain(s) => Some(s.as_str()),
            CategoryField::Named(name) => name.as_deref(),
        };
        raw.filter(|s| !s.is_empty()).map(str::to_string)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Address {
    pub name: Option<String>,
    pub city: Option<String>,
}

impl Address {
    fn decode(value: &Value) -> Result<Option<Self>, (&'static str, ValidationReason)> {
        match value {
            Value::Null => Ok(None),
            Value::Object(map) => Ok(Some(Address {
                name: optional_string(map, "name").map_err(|r| ("address.name", r))?,
                city: optional_string(map, "city").map_err(|r| ("address.city", r))?,
            })),
            _ => Err((
                "address",
                ValidationReason::WrongType {
                    expected: "object or null",
                },
            )),
        }
    }
}

/// A record that passed validation; categories may still be unusable
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedEvent {
    pub event_id: String,
    pub name: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub event_type: EventType,
    pub venue_name: Option<String>,
    pub city: Option<String>,
    pub category: Option<String>,
    pub sub_category: Option<String>,
}

impl ValidatedEvent {
    /// Build the persistable event stamped with the batch that writes it.
    ///
    /// Both categories are required columns, so a missing name fails here.
    pub fn into_event(self, load_batch: Uuid) -> Result<Event, ValidationFailure> {
        let event_id = self.event_id;
        let category = self.category.ok_or_else(|| {
            ValidationFailure::new(Some(event_id.clone()), "category_prim", ValidationReason::NoUsableName)
        })?;
        let sub_category = self.sub_category.ok_or_else(|| {
            ValidationFailure::new(Some(event_id.clone()), "category_sec", ValidationReason::NoUsableName)
        })?;

        Ok(Event {
            id: None,
            event_id,
            name: self.name,
            start_date: self.start_date,
            end_date: Some(self.end_date),
            venue_name: self.venue_name,
            city: self.city,
            category,
            sub_category,
            load_batch,
            event_type: self.event_type,
        })
    }
}

/// Validate one raw record.
pub fn validate(raw: &RawEventData) -> Result<ValidatedEvent, ValidationFailure> {
    let record = raw.as_object().ok_or_else(|| {
        ValidationFailure::new(None, "record", ValidationReason::WrongType { expected: "object" })
    })?;

    let event_id = extract_id(record)?;
    let fail = |field: &'static str, reason: ValidationReason| {
        ValidationFailure::new(Some(event_id.clone()), field, reason)
    };

    let name = required_string(record, "name").map_err(|r| fail("name", r))?;
    let start_date = required_timestamp(record, "start_date").map_err(|r| fail("start_date", r))?;
    let end_date = required_timestamp(record, "end_date").map_err(|r| fail("end_date", r))?;

    let address = match record.get("address") {
        None => None,
        Some(value) => Address::decode(value).map_err(|(field, r)| fail(field, r))?,
    };
    let (event_type, venue_name, city) = derive_location(address.as_ref());

    let category = required_category(record, "category_prim").map_err(|r| fail("category_prim", r))?;
    let sub_category = required_category(record, "category_sec").map_err(|r| fail("category_sec", r))?;

    Ok(ValidatedEvent {
        event_id,
        name,
        start_date,
        end_date,
        event_type,
        venue_name,
        city,
        category: category.name(),
        sub_category: sub_category.name(),
    })
}

/// PRESENTIAL when the address carries a venue name or a city, ONLINE otherwise.
pub fn derive_location(address: Option<&Address>) -> (EventType, Option<String>, Option<String>) {
    let non_empty = |v: &Option<String>| {
        v.as_deref()
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let venue_name = address.and_then(|a| non_empty(&a.name));
    let city = address.and_then(|a| non_empty(&a.city));

    if venue_name.is_none() && city.is_none() {
        (EventType::Online, None, None)
    } else {
        (EventType::Presential, venue_name, city)
    }
}

/// Parse the textual timestamp layouts Sympla is known to emit.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(value, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return date.and_hms_opt(0, 0, 0).map(|naive| Utc.from_utc_datetime(&naive));
        }
    }
    None
}

fn extract_id(record: &Map<String, Value>) -> Result<String, ValidationFailure> {
    let fail = |reason| ValidationFailure::new(None, "id", reason);
    match record.get("id") {
        None | Some(Value::Null) => Err(fail(ValidationReason::Missing)),
        Some(Value::String(s)) if s.is_empty() => Err(fail(ValidationReason::Empty)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
        Some(_) => Err(fail(ValidationReason::WrongType {
            expected: "string or integer",
        })),
    }
}

fn required_string(record: &Map<String, Value>, key: &str) -> Result<String, ValidationReason> {
    match record.get(key) {
        None | Some(Value::Null) => Err(ValidationReason::Missing),
        Some(Value::String(s)) if s.is_empty() => Err(ValidationReason::Empty),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(ValidationReason::WrongType { expected: "string" }),
    }
}

fn optional_string(record: &Map<String, Value>, key: &str) -> Result<Option<String>, ValidationReason> {
    match record.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ValidationReason::WrongType { expected: "string" }),
    }
}

fn required_timestamp(record: &Map<String, Value>, key: &str) -> Result<DateTime<Utc>, ValidationReason> {
    let raw = required_string(record, key)?;
    parse_timestamp(&raw).ok_or(ValidationReason::UnparseableDate { value: raw })
}

fn required_category(record: &Map<String, Value>, key: &str) -> Result<CategoryField, ValidationReason> {
    match record.get(key) {
        None | Some(Value::Null) => Err(ValidationReason::Missing),
        Some(value) => CategoryField::decode(value),
    }
}
