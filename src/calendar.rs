//! Calendar collections, as discovered on a CalDAV server

use std::convert::TryFrom;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    #[derive(Default, Serialize, Deserialize)]
    pub struct SupportedComponents: u8 {
        /// An event, such as a calendar meeting
        const EVENT = 1;
        /// A to-do item, such as a reminder
        const TODO = 2;
    }
}

impl TryFrom<&minidom::Element> for SupportedComponents {
    type Error = String;

    /// Create an instance from an XML <supported-calendar-component-set> element
    fn try_from(element: &minidom::Element) -> Result<Self, Self::Error> {
        if element.name() != "supported-calendar-component-set" {
            return Err("Element must be a <supported-calendar-component-set>".into());
        }

        let mut flags = Self::empty();
        for child in element.children() {
            match child.attr("name") {
                None => continue,
                Some("VEVENT") => flags.insert(Self::EVENT),
                Some("VTODO") => flags.insert(Self::TODO),
                Some(other) => {
                    log::trace!("Unimplemented supported component type: {:?}. Ignoring it", other);
                    continue
                },
            };
        }

        Ok(flags)
    }
}


/// One calendar collection on a server.
///
/// `sync_token` and `ctag` are the cursor of this collection. When returned by a discovery they hold the
/// current server values; before a [`sync`](crate::traits::CalDavSource::sync) they are replaced by the
/// values persisted after the previous run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calendar {
    /// Path of the collection on its server (e.g. `/dav/calendars/alice/work/`)
    pub path: String,
    pub name: String,
    pub description: String,
    /// Normalised `#rrggbb` (or `#rrggbbaa`) color, if the server advertises one
    pub color: Option<String>,
    pub sync_token: Option<String>,
    pub ctag: Option<String>,
    pub supported_components: SupportedComponents,
}

impl Calendar {
    pub fn new<S: ToString, T: ToString>(path: S, name: T) -> Self {
        Self {
            path: path.to_string(),
            name: name.to_string(),
            description: String::new(),
            color: None,
            sync_token: None,
            ctag: None,
            supported_components: SupportedComponents::EVENT,
        }
    }

    /// A copy of this calendar, carrying the given cursor instead of the discovered one
    pub fn with_cursor(&self, sync_token: Option<String>, ctag: Option<String>) -> Self {
        Self { sync_token, ctag, ..self.clone() }
    }

    /// Whether `path` designates a member of this collection
    pub fn contains(&self, path: &str) -> bool {
        path.starts_with(&self.path) && path.len() > self.path.len()
    }
}

/// Parse a CSS-like color, as advertised by `calendar-color` properties
pub fn normalize_color(raw: &str) -> Option<String> {
    match csscolorparser::parse(raw.trim()) {
        Ok(color) => Some(color.to_hex_string()),
        Err(err) => {
            log::debug!("Ignoring invalid calendar color {:?}: {}", raw, err);
            None
        },
    }
}
