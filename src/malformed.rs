//! Collects the resources that could not be parsed during a run

use serde::{Deserialize, Serialize};

/// A resource that is not valid iCalendar data
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MalformedEventInfo {
    pub path: String,
    pub error_message: String,
}

impl MalformedEventInfo {
    pub fn new<S: ToString, T: ToString>(path: S, error_message: T) -> Self {
        Self { path: path.to_string(), error_message: error_message.to_string() }
    }
}


/// An append-only list of malformed resources, scoped to one run.
///
/// This is only meant for operators. Nothing in the sync decides anything from its content.
#[derive(Clone, Debug, Default)]
pub struct MalformedEventCollector {
    events: Vec<MalformedEventInfo>,
}

impl MalformedEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<S: ToString, T: ToString>(&mut self, path: S, error_message: T) {
        let info = MalformedEventInfo::new(path, error_message);
        log::warn!("Malformed calendar object {}: {}", info.path, info.error_message);
        self.events.push(info);
    }

    pub fn extend<I: IntoIterator<Item = MalformedEventInfo>>(&mut self, infos: I) {
        for info in infos {
            self.add(info.path, info.error_message);
        }
    }

    pub fn count(&self) -> usize {
        self.events.len()
    }

    pub fn events(&self) -> &[MalformedEventInfo] {
        &self.events
    }

    pub fn into_events(self) -> Vec<MalformedEventInfo> {
        self.events
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_empty_collector() {
        let collector = MalformedEventCollector::new();
        assert_eq!(collector.count(), 0);
        assert!(collector.events().is_empty());
    }

    #[test]
    fn test_add_and_retrieve() {
        let mut collector = MalformedEventCollector::new();
        collector.add("/calendar/event1.ics", "Invalid VCALENDAR format");
        collector.add("/calendar/event2.ics", "Missing DTSTART");

        assert_eq!(collector.count(), 2);
        let events = collector.events();
        assert_eq!(events[0], MalformedEventInfo::new("/calendar/event1.ics", "Invalid VCALENDAR format"));
        assert_eq!(events[1].path, "/calendar/event2.ics");
        assert_eq!(events[1].error_message, "Missing DTSTART");
    }

    #[test]
    fn test_insertion_order_is_kept() {
        let mut collector = MalformedEventCollector::new();
        let paths = ["/first.ics", "/second.ics", "/third.ics", "/second.ics"];
        for (i, path) in paths.iter().enumerate() {
            collector.add(path, format!("error {}", i));
        }
        collector.extend(vec![MalformedEventInfo::new("/fifth.ics", "error 4")]);

        assert_eq!(collector.count(), paths.len() + 1);
        let got: Vec<&str> = collector.events().iter().map(|info| info.path.as_str()).collect();
        assert_eq!(got, vec!["/first.ics", "/second.ics", "/third.ics", "/second.ics", "/fifth.ics"]);
        assert_eq!(collector.into_events()[3].error_message, "error 3");
    }
}
