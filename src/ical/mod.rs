//! This module handles conversion between iCal files and internal representations
//!
//! The sync engine never rewrites calendar data: resources are copied verbatim from one server to another.
//! Parsing is only needed to extract the identity of an event (its UID, title and start time).

mod parser;
pub use parser::{parse, parse_date_time, ParseError, ParsedEvent};
