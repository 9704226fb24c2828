//! A module to parse ICal files

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use ical::parser::ical::component::IcalEvent;
use ical::property::Property;


/// The few properties of a VEVENT the sync engine relies on
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedEvent {
    pub uid: String,
    pub summary: String,
    /// `DTSTART` value, exactly as provided (not normalised to UTC)
    pub start: String,
    /// `LAST-MODIFIED`, or `DTSTAMP` when the former is missing
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParseError {
    /// Valid iCalendar data that holds no VEVENT (e.g. a VTODO living in the same collection)
    NotAnEvent,
    /// Anything that is not valid iCalendar data
    Malformed(String),
}


/// Parse a VCALENDAR object that wraps a VEVENT (possibly with its recurrence overrides)
pub fn parse(content: &str) -> Result<ParsedEvent, ParseError> {
    if content.trim_start().starts_with("BEGIN:VCALENDAR") == false {
        return Err(ParseError::Malformed("missing BEGIN:VCALENDAR".to_string()));
    }

    let mut reader = ical::IcalParser::new(content.as_bytes());
    let calendar = match reader.next() {
        None => return Err(ParseError::Malformed("no calendar object".to_string())),
        Some(Err(err)) => return Err(ParseError::Malformed(format!("unable to parse iCal data: {}", err))),
        Some(Ok(calendar)) => calendar,
    };

    // What to do with multiple items?
    if reader.next().map(|r| r.is_ok()) == Some(true) {
        return Err(ParseError::Malformed("multiple VCALENDAR objects in a single resource".to_string()));
    }

    if calendar.events.is_empty() {
        return Err(ParseError::NotAnEvent);
    }

    let master = calendar.events.iter()
        .find(|ev| find_property(ev, "RECURRENCE-ID").is_none())
        .unwrap_or(&calendar.events[0]);

    let uid = match find_value(master, "UID") {
        Some(uid) if uid.trim().is_empty() == false => uid.trim().to_string(),
        _ => return Err(ParseError::Malformed("missing UID".to_string())),
    };

    for other in &calendar.events {
        if find_value(other, "UID").map(|u| u.trim()) != Some(uid.as_str()) {
            return Err(ParseError::Malformed("VEVENTs with different UIDs in a single resource".to_string()));
        }
    }

    let summary = find_value(master, "SUMMARY").map(unescape_text).unwrap_or_default();
    let start = find_value(master, "DTSTART").unwrap_or_default().to_string();
    let last_modified = find_value(master, "LAST-MODIFIED")
        .or_else(|| find_value(master, "DTSTAMP"))
        .and_then(parse_date_time);

    Ok(ParsedEvent { uid, summary, start, last_modified })
}

fn find_property<'a>(event: &'a IcalEvent, name: &str) -> Option<&'a Property> {
    event.properties.iter().find(|prop| prop.name == name)
}

fn find_value<'a>(event: &'a IcalEvent, name: &str) -> Option<&'a str> {
    find_property(event, name).and_then(|prop| prop.value.as_deref())
}

/// Parse a `DATE-TIME` value (UTC or floating) into a UTC timestamp
pub fn parse_date_time(value: &str) -> Option<DateTime<Utc>> {
    let naive = value.trim().trim_end_matches('Z');
    NaiveDateTime::parse_from_str(naive, "%Y%m%dT%H%M%S")
        .ok()
        .map(|dt| Utc.from_utc_datetime(&dt))
}

/// Undo the RFC 5545 TEXT escaping
fn unescape_text(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => result.push('\n'),
            Some(other) => result.push(other),
            None => result.push('\\'),
        }
    }
    result
}
