//! An in-memory CalDAV server, used to test the sync without any network
//!
//! Sync tokens are `rev-N`, where `N` is the revision of the server when the token was issued.
//! Calling [`MockCalDav::invalidate_tokens`] makes every previously issued token rejected, the way a server
//! that lost its change history would.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use url::Url;

use crate::calendar::Calendar;
use crate::deadline::Deadline;
use crate::error::{CalDavError, CalDavResult};
use crate::event::Event;
use crate::malformed::MalformedEventInfo;
use crate::mock_behaviour::MockBehaviour;
use crate::resource::Credentials;
use crate::traits::{CalDavConnector, CalDavSource, Listing, PutCondition, SyncDelta};

/// Builds a minimal calendar object, as a CalDAV client would upload it
pub fn ical_event(uid: &str, summary: &str, start: &str) -> String {
    ical_event_modified(uid, summary, start, "20240101T000000Z")
}

/// Same as [`ical_event`], with a given `LAST-MODIFIED` date
pub fn ical_event_modified(uid: &str, summary: &str, start: &str, last_modified: &str) -> String {
    format!(
        "BEGIN:VCALENDAR\r\n\
         VERSION:2.0\r\n\
         PRODID:-//calbridge//mock//EN\r\n\
         BEGIN:VEVENT\r\n\
         UID:{}\r\n\
         DTSTAMP:20240101T000000Z\r\n\
         LAST-MODIFIED:{}\r\n\
         DTSTART:{}\r\n\
         SUMMARY:{}\r\n\
         END:VEVENT\r\n\
         END:VCALENDAR\r\n",
        uid, last_modified, start, summary
    )
}


#[derive(Clone, Debug)]
struct MockResource {
    etag: String,
    data: String,
}

#[derive(Clone, Debug, Default)]
struct MockCalendar {
    name: String,
    resources: BTreeMap<String, MockResource>,
    /// (revision, path) of every change
    changes: Vec<(u64, String)>,
    ctag: u64,
}

#[derive(Debug)]
struct ServerState {
    home: String,
    calendars: BTreeMap<String, MockCalendar>,
    revision: u64,
    oldest_valid_revision: u64,
    supports_sync: bool,
    behaviour: MockBehaviour,

    put_count: usize,
    delete_count: usize,
    create_calendar_count: usize,
    list_count: usize,
}

impl ServerState {
    fn calendar(&self, path: &str) -> CalDavResult<&MockCalendar> {
        self.calendars.get(path).ok_or(CalDavError::NotFound)
    }

    fn calendar_mut(&mut self, path: &str) -> CalDavResult<&mut MockCalendar> {
        self.calendars.get_mut(path).ok_or(CalDavError::NotFound)
    }

    /// The calendar a resource path belongs to
    fn parent_of(&self, resource_path: &str) -> CalDavResult<String> {
        self.calendars.keys()
            .find(|cal| resource_path.starts_with(cal.as_str()))
            .cloned()
            .ok_or(CalDavError::NotFound)
    }

    fn record_change(&mut self, calendar_path: &str, resource_path: &str) -> CalDavResult<()> {
        self.revision += 1;
        let revision = self.revision;
        let calendar = self.calendar_mut(calendar_path)?;
        calendar.changes.push((revision, resource_path.to_string()));
        calendar.ctag = revision;
        Ok(())
    }

    fn token(&self) -> Option<String> {
        match self.supports_sync {
            true => Some(format!("rev-{}", self.revision)),
            false => None,
        }
    }

    /// Returns the revision of a token, if it is still valid
    fn revision_of(&self, token: &str) -> Option<u64> {
        let rev = token.strip_prefix("rev-")?.parse::<u64>().ok()?;
        if self.supports_sync && rev >= self.oldest_valid_revision && rev <= self.revision {
            Some(rev)
        } else {
            None
        }
    }
}

fn collect(path: &str, resource: &MockResource, events: &mut Vec<Event>, malformed: &mut Vec<MalformedEventInfo>) {
    match Event::from_resource(path, &resource.etag, resource.data.clone()) {
        Ok(Some(event)) => events.push(event),
        Ok(None) => {},
        Err(err) => malformed.push(MalformedEventInfo::new(path, err)),
    }
}


/// A mocked CalDAV server
#[derive(Debug)]
pub struct MockCalDav {
    state: Mutex<ServerState>,
}

impl Default for MockCalDav {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCalDav {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServerState {
                home: "/calendars/".to_string(),
                calendars: BTreeMap::new(),
                revision: 1,
                oldest_valid_revision: 0,
                supports_sync: true,
                behaviour: MockBehaviour::default(),
                put_count: 0,
                delete_count: 0,
                create_calendar_count: 0,
                list_count: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds an empty calendar collection. `path` must end with a slash
    pub fn add_calendar(&self, path: &str, name: &str) {
        let mut state = self.state();
        state.revision += 1;
        let revision = state.revision;
        state.calendars.insert(path.to_string(), MockCalendar {
            name: name.to_string(),
            ctag: revision,
            ..MockCalendar::default()
        });
    }

    /// Removes a calendar collection and everything it holds, as another client would
    pub fn remove_calendar(&self, path: &str) {
        let mut state = self.state();
        state.revision += 1;
        state.calendars.remove(path);
    }

    /// Stores raw data at `path`, as another client would, and returns its new ETag
    pub fn insert_resource(&self, calendar_path: &str, path: &str, data: &str) -> CalDavResult<String> {
        let mut state = self.state();
        state.record_change(calendar_path, path)?;
        let etag = format!("\"{}\"", state.revision);
        state.calendar_mut(calendar_path)?.resources.insert(
            path.to_string(),
            MockResource { etag: etag.clone(), data: data.to_string() },
        );
        Ok(etag)
    }

    /// Removes a resource, as another client would
    pub fn remove_resource(&self, calendar_path: &str, path: &str) -> CalDavResult<()> {
        let mut state = self.state();
        if state.calendar_mut(calendar_path)?.resources.remove(path).is_some() {
            state.record_change(calendar_path, path)?;
        }
        Ok(())
    }

    /// The raw data stored at a path
    pub fn resource(&self, path: &str) -> Option<String> {
        let state = self.state();
        state.calendars.values()
            .find_map(|cal| cal.resources.get(path))
            .map(|res| res.data.clone())
    }

    pub fn resource_paths(&self, calendar_path: &str) -> Vec<String> {
        self.state().calendars.get(calendar_path)
            .map(|cal| cal.resources.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// The path of the calendar with this display name
    pub fn calendar_named(&self, name: &str) -> Option<String> {
        self.state().calendars.iter()
            .find(|(_, cal)| cal.name == name)
            .map(|(path, _)| path.clone())
    }

    /// Every token issued so far is rejected from now on
    pub fn invalidate_tokens(&self) {
        let mut state = self.state();
        state.revision += 1;
        state.oldest_valid_revision = state.revision;
    }

    /// Whether this server implements sync-collection (otherwise, only CTags are available)
    pub fn set_supports_sync(&self, supports_sync: bool) {
        self.state().supports_sync = supports_sync;
    }

    pub fn set_behaviour(&self, behaviour: MockBehaviour) {
        self.state().behaviour = behaviour;
    }

    pub fn put_count(&self) -> usize { self.state().put_count }
    pub fn delete_count(&self) -> usize { self.state().delete_count }
    pub fn create_calendar_count(&self) -> usize { self.state().create_calendar_count }
    pub fn list_count(&self) -> usize { self.state().list_count }

    /// Honours the deadline and the mocked behaviour before serving a call
    async fn enter<F>(&self, deadline: &Deadline, check: F) -> CalDavResult<()>
    where
        F: FnOnce(&mut MockBehaviour) -> CalDavResult<()>,
    {
        deadline.run(async { Ok(()) }).await?;
        let hangs = {
            let mut state = self.state();
            check(&mut state.behaviour)?;
            state.behaviour.hangs
        };
        if hangs {
            deadline.run(std::future::pending::<CalDavResult<()>>()).await?;
        }
        Ok(())
    }

    fn full_listing(&self, calendar_path: &str) -> CalDavResult<Listing> {
        let mut state = self.state();
        state.list_count += 1;
        let calendar = state.calendar(calendar_path)?;

        let mut listing = Listing::default();
        for (path, resource) in &calendar.resources {
            listing.paths.insert(path.clone());
            collect(path, resource, &mut listing.events, &mut listing.malformed);
        }
        Ok(listing)
    }
}

#[async_trait]
impl CalDavSource for MockCalDav {
    async fn discover(&self, deadline: &Deadline) -> CalDavResult<Vec<Calendar>> {
        self.enter(deadline, |b| b.can_discover()).await?;
        let state = self.state();
        Ok(state.calendars.iter()
            .map(|(path, cal)| {
                Calendar::new(path, &cal.name).with_cursor(state.token(), Some(format!("ctag-{}", cal.ctag)))
            })
            .collect())
    }

    async fn sync(&self, calendar: &mut Calendar, deadline: &Deadline) -> CalDavResult<SyncDelta> {
        self.enter(deadline, |b| b.can_sync()).await?;

        {
            let state = self.state();
            let cal = state.calendar(&calendar.path)?;
            let ctag = Some(format!("ctag-{}", cal.ctag));

            match calendar.sync_token.as_deref().map(|token| state.revision_of(token)) {
                Some(Some(since)) => {
                    let mut delta = SyncDelta { new_token: state.token(), ctag, ..SyncDelta::default() };
                    let mut seen = BTreeSet::new();
                    for (_, path) in cal.changes.iter().filter(|(rev, _)| *rev > since) {
                        if seen.insert(path.clone()) == false {
                            continue;
                        }
                        match cal.resources.get(path) {
                            Some(resource) => collect(path, resource, &mut delta.changed, &mut delta.malformed),
                            None => delta.deleted.push(path.clone()),
                        }
                    }
                    calendar.sync_token = delta.new_token.clone();
                    calendar.ctag = delta.ctag.clone();
                    return Ok(delta);
                },
                Some(None) => {
                    log::info!("Mock server rejects the sync token of {}", calendar.path);
                    calendar.sync_token = None;
                },
                None => {
                    if state.supports_sync == false && calendar.ctag.is_some() && calendar.ctag == ctag {
                        return Ok(SyncDelta { ctag, ..SyncDelta::default() });
                    }
                },
            }
        }

        let listing = self.full_listing(&calendar.path)?;
        let state = self.state();
        calendar.sync_token = state.token();
        calendar.ctag = Some(format!("ctag-{}", state.calendar(&calendar.path)?.ctag));
        Ok(SyncDelta {
            changed: listing.events,
            deleted: Vec::new(),
            new_token: calendar.sync_token.clone(),
            ctag: calendar.ctag.clone(),
            full_resync: true,
            listed_paths: Some(listing.paths),
            malformed: listing.malformed,
        })
    }

    async fn list_events(&self, calendar: &Calendar, deadline: &Deadline) -> CalDavResult<Listing> {
        self.enter(deadline, |b| b.can_list_events()).await?;
        self.full_listing(&calendar.path)
    }

    async fn fetch_event(&self, calendar: &Calendar, path: &str, deadline: &Deadline) -> CalDavResult<Event> {
        self.enter(deadline, |b| b.can_fetch_event()).await?;
        let resource = self.state().calendar(&calendar.path)?
            .resources.get(path)
            .cloned()
            .ok_or(CalDavError::NotFound)?;
        Event::from_resource(path, resource.etag, resource.data)?
            .ok_or_else(|| CalDavError::MalformedContent("the resource holds no VEVENT".to_string()))
    }

    async fn put_event(&self, calendar: &Calendar, path: &str, data: &str, condition: PutCondition, deadline: &Deadline) -> CalDavResult<Option<String>> {
        self.enter(deadline, |b| b.can_put_event()).await?;
        let mut state = self.state();
        let calendar_path = state.parent_of(path).unwrap_or_else(|_| calendar.path.clone());

        let current = state.calendar(&calendar_path)?.resources.get(path).map(|res| res.etag.clone());
        match (&condition, current) {
            (PutCondition::CreateOnly, Some(_)) => return Err(CalDavError::PreconditionFailed),
            (PutCondition::IfMatch(_), None) => return Err(CalDavError::PreconditionFailed),
            (PutCondition::IfMatch(expected), Some(etag)) if *expected != etag => return Err(CalDavError::PreconditionFailed),
            _ => {},
        }

        state.put_count += 1;
        state.record_change(&calendar_path, path)?;
        let etag = format!("\"{}\"", state.revision);
        state.calendar_mut(&calendar_path)?.resources.insert(
            path.to_string(),
            MockResource { etag: etag.clone(), data: data.to_string() },
        );
        Ok(Some(etag))
    }

    async fn delete_event(&self, calendar: &Calendar, path: &str, deadline: &Deadline) -> CalDavResult<()> {
        self.enter(deadline, |b| b.can_delete_event()).await?;
        let mut state = self.state();
        state.delete_count += 1;
        let calendar_path = state.parent_of(path).unwrap_or_else(|_| calendar.path.clone());
        if state.calendar_mut(&calendar_path)?.resources.remove(path).is_some() {
            state.record_change(&calendar_path, path)?;
        }
        Ok(())
    }

    async fn create_calendar(&self, name: &str, deadline: &Deadline) -> CalDavResult<Calendar> {
        self.enter(deadline, |b| b.can_create_calendar()).await?;
        let path = {
            let state = self.state();
            let slug = sanitize_filename::sanitize(name).replace(' ', "-");
            let path = format!("{}{}/", state.home, slug);
            if slug.is_empty() || state.calendars.contains_key(&path) {
                format!("{}{}/", state.home, uuid::Uuid::new_v4().to_hyphenated())
            } else {
                path
            }
        };
        self.add_calendar(&path, name);
        self.state().create_calendar_count += 1;
        Ok(Calendar::new(path, name))
    }
}


/// Maps endpoints to mocked servers
#[derive(Clone, Debug, Default)]
pub struct MockConnector {
    servers: HashMap<String, Arc<MockCalDav>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Any connection to `endpoint` will reach `server`
    pub fn register(&mut self, endpoint: &str, server: Arc<MockCalDav>) {
        self.servers.insert(endpoint.to_string(), server);
    }
}

impl CalDavConnector for MockConnector {
    fn connect(&self, endpoint: &Url, _credentials: &Credentials) -> CalDavResult<Arc<dyn CalDavSource>> {
        match self.servers.get(endpoint.as_str()) {
            Some(server) => Ok(server.clone()),
            None => Err(CalDavError::ConnectionFailed(format!("no mocked server at {}", endpoint))),
        }
    }
}
