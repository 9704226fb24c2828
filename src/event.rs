//! Calendar events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CalDavError;
use crate::ical::ParseError;


/// One calendar object (a VEVENT wrapped in a VCALENDAR), as stored on a server
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    path: String,
    etag: String,
    data: String,

    uid: String,
    summary: String,
    start_time: String,
    last_modified: Option<DateTime<Utc>>,
}

impl Event {
    /// Build an event from a raw server resource.
    ///
    /// Returns `MalformedContent` if the data is not a valid calendar event.
    /// Valid iCalendar data that holds no VEVENT is reported as `Ok(None)`.
    pub fn from_resource<S: ToString, T: ToString>(path: S, etag: T, data: String) -> Result<Option<Self>, CalDavError> {
        match crate::ical::parse(&data) {
            Err(ParseError::NotAnEvent) => Ok(None),
            Err(ParseError::Malformed(msg)) => Err(CalDavError::MalformedContent(msg)),
            Ok(parsed) => Ok(Some(Self {
                path: path.to_string(),
                etag: etag.to_string(),
                data,
                uid: parsed.uid,
                summary: parsed.summary,
                start_time: parsed.start,
                last_modified: parsed.last_modified,
            })),
        }
    }

    pub fn path(&self) -> &str { &self.path }
    pub fn etag(&self) -> &str { &self.etag }
    pub fn data(&self) -> &str { &self.data }
    pub fn uid(&self) -> &str { &self.uid }
    pub fn summary(&self) -> &str { &self.summary }
    pub fn start_time(&self) -> &str { &self.start_time }
    pub fn last_modified(&self) -> Option<DateTime<Utc>> { self.last_modified }

    /// Heuristic identity of this event, used to spot the same event imported under another UID
    pub fn dedupe_key(&self) -> String {
        dedupe_key(&self.summary, &self.start_time)
    }
}

/// `summary|start`, empty fields included
pub fn dedupe_key(summary: &str, start_time: &str) -> String {
    format!("{}|{}", summary, start_time)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mock::ical_event;

    #[test]
    fn test_dedupe_key() {
        let cases = [
            ("Team Meeting", "20240115T140000Z", "Team Meeting|20240115T140000Z"),
            ("", "20240115T140000Z", "|20240115T140000Z"),
            ("Team Meeting", "", "Team Meeting|"),
            ("", "", "|"),
            ("Meeting: Q1 Review & Planning", "20240115T140000Z", "Meeting: Q1 Review & Planning|20240115T140000Z"),
            ("", "X", "|X"),
        ];
        for (summary, start, expected) in cases.iter() {
            assert_eq!(dedupe_key(summary, start), *expected);
        }
    }

    #[test]
    fn test_event_from_resource() {
        let data = ical_event("unique-id@example.com", "Test Event", "20240115T140000Z");
        let event = Event::from_resource("/calendar/event.ics", "etag-123", data.clone()).unwrap().unwrap();

        assert_eq!(event.path(), "/calendar/event.ics");
        assert_eq!(event.etag(), "etag-123");
        assert_eq!(event.data(), data);
        assert_eq!(event.uid(), "unique-id@example.com");
        assert_eq!(event.summary(), "Test Event");
        assert_eq!(event.start_time(), "20240115T140000Z");
        assert_eq!(event.dedupe_key(), "Test Event|20240115T140000Z");
    }

    #[test]
    fn test_empty_summary_takes_part_in_the_key() {
        let data = "BEGIN:VCALENDAR\nBEGIN:VEVENT\nUID:u\nDTSTART:X\nEND:VEVENT\nEND:VCALENDAR\n".to_string();
        let event = Event::from_resource("/c/u.ics", "e", data).unwrap().unwrap();
        assert_eq!(event.dedupe_key(), "|X");
    }

    #[test]
    fn test_malformed_resource() {
        let res = Event::from_resource("/calendar/bad.ics", "e", "garbage".to_string());
        assert!(matches!(res, Err(CalDavError::MalformedContent(_))));
    }
}
