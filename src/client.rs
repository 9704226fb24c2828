//! This module provides a client to connect to a CalDAV server

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use minidom::Element;
use once_cell::sync::Lazy;
use reqwest::header::{CONTENT_TYPE, ETAG, IF_MATCH, IF_NONE_MATCH};
use reqwest::{Method, RequestBuilder, StatusCode};
use url::Url;

use crate::calendar::{normalize_color, Calendar, SupportedComponents};
use crate::deadline::Deadline;
use crate::error::{CalDavError, CalDavResult};
use crate::event::Event;
use crate::malformed::MalformedEventInfo;
use crate::resource::{Credentials, Resource};
use crate::traits::{CalDavConnector, CalDavSource, Listing, PutCondition, SyncDelta};
use crate::utils::{escape_xml, find_child, find_elem, find_elems, parse_status_line};

static PROPFIND: Lazy<Method> = Lazy::new(|| Method::from_bytes(b"PROPFIND").expect("cannot create PROPFIND method."));
static REPORT: Lazy<Method> = Lazy::new(|| Method::from_bytes(b"REPORT").expect("cannot create REPORT method."));
static MKCALENDAR: Lazy<Method> = Lazy::new(|| Method::from_bytes(b"MKCALENDAR").expect("cannot create MKCALENDAR method."));

static USER_AGENT: &str = concat!("calbridge/", env!("CARGO_PKG_VERSION"));

/// How many times a truncated (507) sync-collection reply is followed before giving up for this run
const MAX_SYNC_ROUNDS: usize = 16;

static DAVCLIENT_BODY: &str = r#"
    <d:propfind xmlns:d="DAV:">
       <d:prop>
           <d:current-user-principal />
       </d:prop>
    </d:propfind>
"#;

static HOMESET_BODY: &str = r#"
    <d:propfind xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav" >
      <d:self/>
      <d:prop>
        <c:calendar-home-set />
      </d:prop>
    </d:propfind>
"#;

static CAL_BODY: &str = r#"
    <d:propfind xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav" xmlns:cs="http://calendarserver.org/ns/" xmlns:ic="http://apple.com/ns/ical/" >
       <d:prop>
         <d:displayname />
         <d:resourcetype />
         <d:sync-token />
         <cs:getctag />
         <c:supported-calendar-component-set />
         <c:calendar-description />
         <ic:calendar-color />
       </d:prop>
    </d:propfind>
"#;

static CURSOR_BODY: &str = r#"
    <d:propfind xmlns:d="DAV:" xmlns:cs="http://calendarserver.org/ns/" >
       <d:prop>
         <d:sync-token />
         <cs:getctag />
       </d:prop>
    </d:propfind>
"#;

static EVENTS_BODY: &str = r#"
    <c:calendar-query xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
        <d:prop>
            <d:getetag />
            <c:calendar-data />
        </d:prop>
        <c:filter>
            <c:comp-filter name="VCALENDAR">
                <c:comp-filter name="VEVENT" />
            </c:comp-filter>
        </c:filter>
    </c:calendar-query>
"#;

fn sync_collection_body(token: &str) -> String {
    format!(r#"
    <d:sync-collection xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
        <d:sync-token>{}</d:sync-token>
        <d:sync-level>1</d:sync-level>
        <d:prop>
            <d:getetag />
            <c:calendar-data />
        </d:prop>
    </d:sync-collection>
"#, escape_xml(token))
}

fn mkcalendar_body(name: &str) -> String {
    format!(r#"
    <c:mkcalendar xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
        <d:set>
            <d:prop>
                <d:displayname>{}</d:displayname>
                <c:supported-calendar-component-set>
                    <c:comp name="VEVENT" />
                </c:supported-calendar-component-set>
            </d:prop>
        </d:set>
    </c:mkcalendar>
"#, escape_xml(name))
}


/// A raw HTTP reply
struct Reply {
    status: StatusCode,
    etag: Option<String>,
    text: String,
}

/// Map a HTTP status to our error taxonomy
fn check_status(status: StatusCode) -> CalDavResult<()> {
    if status.is_success() {
        return Ok(());
    }
    match status.as_u16() {
        401 | 403 => Err(CalDavError::AuthFailed),
        404 | 410 => Err(CalDavError::NotFound),
        412 => Err(CalDavError::PreconditionFailed),
        code if code >= 500 => Err(CalDavError::ConnectionFailed(format!("server error {}", status))),
        _ => Err(CalDavError::InvalidResponse(format!("unexpected HTTP status code {}", status))),
    }
}

fn parse_xml(text: &str) -> CalDavResult<Element> {
    Ok(text.parse::<Element>()?)
}

/// Returns the trimmed text of the first element with this name, if it is not empty
fn prop_text(root: &Element, name: &str) -> Option<String> {
    find_elem(root, name)
        .map(|el| el.text().trim().to_string())
        .filter(|text| text.is_empty() == false)
}

/// Returns the `<prop>` of the successful `<propstat>` of a `<response>`
fn successful_prop(response: &Element) -> Option<&Element> {
    response.children()
        .filter(|el| el.name() == "propstat")
        .find(|propstat| {
            find_child(propstat, "status")
                .and_then(|status| parse_status_line(&status.text()))
                .map(|code| (200..300).contains(&code))
                .unwrap_or(true)
        })
        .and_then(|propstat| find_child(propstat, "prop"))
}


/// Accumulates the resources found in a multistatus reply
#[derive(Default)]
struct Collected {
    events: Vec<Event>,
    paths: BTreeSet<String>,
    deleted: Vec<String>,
    malformed: Vec<MalformedEventInfo>,
    /// Resources the server listed without their calendar data
    missing_data: Vec<String>,
}

impl Collected {
    fn add_resource(&mut self, path: String, etag: String, data: Option<String>) {
        self.paths.insert(path.clone());
        let data = match data {
            None => {
                self.missing_data.push(path);
                return;
            },
            Some(data) => data,
        };

        match Event::from_resource(&path, &etag, data) {
            Ok(Some(event)) => self.events.push(event),
            Ok(None) => log::trace!("{} is not an event, ignoring it", path),
            Err(err) => self.malformed.push(MalformedEventInfo::new(path, err)),
        }
    }
}


/// A CalDAV source that fetches its data from a CalDAV server
pub struct Client {
    resource: Resource,
    http: reqwest::Client,
}

impl Client {
    /// Create a client. This does not start a connection
    pub fn new(url: Url, credentials: Credentials) -> CalDavResult<Self> {
        let http = reqwest::Client::builder()
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            resource: Resource::new(url, credentials),
            http,
        })
    }

    pub fn url(&self) -> &Url {
        self.resource.url()
    }

    fn calendar_url(&self, calendar: &Calendar) -> Url {
        self.resource.combine(&calendar.path).url().clone()
    }

    fn resource_url(&self, path: &str) -> CalDavResult<Url> {
        self.resource.join(path)
            .ok_or_else(|| CalDavError::InvalidResponse(format!("invalid resource path {}", path)))
    }

    /// Turn a `href` into a path on this server
    fn path_of(&self, href: &str) -> CalDavResult<String> {
        self.resource_url(href.trim()).map(|url| url.path().to_string())
    }

    fn request(&self, method: Method, url: &Url) -> RequestBuilder {
        self.http
            .request(method, url.as_str())
            .basic_auth(self.resource.username(), Some(self.resource.password()))
    }

    async fn send(&self, request: RequestBuilder, deadline: &Deadline) -> CalDavResult<Reply> {
        let request = request.timeout(deadline.remaining());
        deadline.run(async move {
            let response = request.send().await?;
            let status = response.status();
            let etag = response.headers()
                .get(ETAG)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.to_string());
            let text = response.text().await?;
            Ok(Reply { status, etag, text })
        }).await
    }

    async fn dav_request(&self, method: Method, url: &Url, depth: u32, body: String, deadline: &Deadline) -> CalDavResult<Reply> {
        let request = self.request(method, url)
            .header("Depth", depth)
            .header(CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(body);
        self.send(request, deadline).await
    }

    async fn propfind(&self, url: &Url, body: &str, depth: u32, deadline: &Deadline) -> CalDavResult<Element> {
        let reply = self.dav_request(PROPFIND.clone(), url, depth, body.to_string(), deadline).await?;
        check_status(reply.status)?;
        parse_xml(&reply.text)
    }

    /// Return the Principal URL (or the endpoint itself if the server does not tell it)
    async fn get_principal(&self, deadline: &Deadline) -> CalDavResult<Url> {
        let root = self.propfind(self.resource.url(), DAVCLIENT_BODY, 0, deadline).await?;
        let href = find_elem(&root, "current-user-principal")
            .and_then(|el| prop_text(el, "href"));

        match href {
            None => {
                log::debug!("No principal advertised by {}, using it as the principal", self.resource.url());
                Ok(self.resource.url().clone())
            },
            Some(href) => {
                let principal_url = self.resource_url(&href)?;
                log::debug!("Principal URL is {}", principal_url);
                Ok(principal_url)
            },
        }
    }

    /// Return the Homeset URL (or the principal URL if the server does not tell it)
    async fn get_cal_home_set(&self, deadline: &Deadline) -> CalDavResult<Url> {
        let principal_url = self.get_principal(deadline).await?;
        let root = self.propfind(&principal_url, HOMESET_BODY, 0, deadline).await?;
        let href = find_elem(&root, "calendar-home-set")
            .and_then(|el| prop_text(el, "href"));

        match href {
            None => {
                log::debug!("No calendar home set advertised, using the principal URL");
                Ok(principal_url)
            },
            Some(href) => {
                let chs_url = self.resource_url(&href)?;
                log::debug!("Calendar home set URL is {:?}", chs_url.path());
                Ok(chs_url)
            },
        }
    }

    /// Returns the current sync-token and CTag of a collection
    async fn collection_cursor(&self, calendar: &Calendar, deadline: &Deadline) -> CalDavResult<(Option<String>, Option<String>)> {
        let root = self.propfind(&self.calendar_url(calendar), CURSOR_BODY, 0, deadline).await?;
        Ok((prop_text(&root, "sync-token"), prop_text(&root, "getctag")))
    }

    /// Parse the `<response>`s of a multistatus listing of `calendar`
    fn collect_responses(&self, root: &Element, calendar: &Calendar, collected: &mut Collected) -> bool {
        let mut truncated = false;

        for response in find_elems(root, "response") {
            let path = match find_child(response, "href").map(|href| self.path_of(&href.text())) {
                Some(Ok(path)) => path,
                _ => {
                    log::warn!("Unable to extract HREF from a response about {}", calendar.path);
                    continue;
                },
            };

            let status = find_child(response, "status")
                .and_then(|status| parse_status_line(&status.text()));

            if calendar.contains(&path) == false {
                // This is about the collection itself
                if status == Some(507) {
                    truncated = true;
                }
                continue;
            }

            match status {
                Some(404) => {
                    collected.deleted.push(path);
                    continue;
                },
                Some(507) => {
                    truncated = true;
                    continue;
                },
                _ => {},
            }

            let prop = match successful_prop(response) {
                None => {
                    log::warn!("No properties for {}, ignoring it", path);
                    continue;
                },
                Some(prop) => prop,
            };
            let etag = prop_text(prop, "getetag").unwrap_or_default();
            let data = find_elem(prop, "calendar-data")
                .map(|el| el.text())
                .filter(|text| text.trim().is_empty() == false);
            collected.add_resource(path, etag, data);
        }

        truncated
    }

    /// Download the resources that were listed without their calendar data
    async fn fetch_missing_data(&self, calendar: &Calendar, collected: &mut Collected, deadline: &Deadline) -> CalDavResult<()> {
        for path in std::mem::take(&mut collected.missing_data) {
            match self.get_resource(&path, deadline).await {
                Ok((etag, data)) => collected.add_resource(path, etag, Some(data)),
                Err(CalDavError::NotFound) => {
                    log::debug!("{} vanished from {} while listing it", path, calendar.path);
                    collected.paths.remove(&path);
                    collected.deleted.push(path);
                },
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn get_resource(&self, path: &str, deadline: &Deadline) -> CalDavResult<(String, String)> {
        let url = self.resource_url(path)?;
        let reply = self.send(self.request(Method::GET, &url), deadline).await?;
        check_status(reply.status)?;
        Ok((reply.etag.unwrap_or_default(), reply.text))
    }

    /// Issues sync-collection REPORTs from `token`.
    ///
    /// Returns `None` if the server does not accept this token anymore.
    async fn sync_collection(&self, calendar: &Calendar, token: &str, deadline: &Deadline) -> CalDavResult<Option<SyncDelta>> {
        let url = self.calendar_url(calendar);
        let mut collected = Collected::default();
        let mut token = token.to_string();

        for round in 0..MAX_SYNC_ROUNDS {
            let reply = self.dav_request(REPORT.clone(), &url, 0, sync_collection_body(&token), deadline).await?;
            let code = reply.status.as_u16();
            if code == 403 || code == 409 || (reply.status.is_client_error() && reply.text.contains("valid-sync-token")) {
                return Ok(None);
            }
            check_status(reply.status)?;

            let root = parse_xml(&reply.text)?;
            let truncated = self.collect_responses(&root, calendar, &mut collected);
            token = find_child(&root, "sync-token")
                .map(|el| el.text().trim().to_string())
                .filter(|t| t.is_empty() == false)
                .ok_or_else(|| CalDavError::InvalidResponse("no sync-token in a sync-collection reply".to_string()))?;

            if truncated == false {
                break;
            }
            if round + 1 == MAX_SYNC_ROUNDS {
                log::warn!("Changes of {} are still truncated after {} rounds, the rest will be fetched next time", calendar.path, MAX_SYNC_ROUNDS);
            } else {
                log::debug!("Changes of {} were truncated by the server, asking for more", calendar.path);
            }
        }

        self.fetch_missing_data(calendar, &mut collected, deadline).await?;

        Ok(Some(SyncDelta {
            changed: collected.events,
            deleted: collected.deleted,
            new_token: Some(token),
            ctag: None,
            full_resync: false,
            listed_paths: None,
            malformed: collected.malformed,
        }))
    }

    /// Return the list of calendars
    pub async fn get_calendars(&self, deadline: &Deadline) -> CalDavResult<Vec<Calendar>> {
        let cal_home_set = self.get_cal_home_set(deadline).await?;
        let root = self.propfind(&cal_home_set, CAL_BODY, 1, deadline).await?;

        let mut calendars = Vec::new();
        for rep in find_elems(&root, "response") {
            // We filter out non-calendar items
            let is_calendar = find_elem(rep, "resourcetype")
                .map(|rt| rt.children().any(|child| child.name() == "calendar"))
                .unwrap_or(false);
            if is_calendar == false {
                continue;
            }

            let path = match find_child(rep, "href").map(|href| self.path_of(&href.text())) {
                Some(Ok(path)) => path,
                _ => {
                    log::warn!("Calendar has no URL! Ignoring it.");
                    continue;
                },
            };

            let supported_components = match find_elem(rep, "supported-calendar-component-set") {
                Some(el) if el.children().count() > 0 => match SupportedComponents::try_from(el) {
                    Err(err) => {
                        log::warn!("Calendar {} has invalid supported components ({})! Ignoring it.", path, err);
                        continue;
                    },
                    Ok(sc) => sc,
                },
                _ => SupportedComponents::EVENT,
            };
            if supported_components.contains(SupportedComponents::EVENT) == false {
                log::debug!("Calendar {} cannot hold events, ignoring it", path);
                continue;
            }

            let name = prop_text(rep, "displayname").unwrap_or_else(|| {
                path.trim_end_matches('/').rsplit('/').next().unwrap_or_default().to_string()
            });
            let calendar = Calendar {
                name,
                description: prop_text(rep, "calendar-description").unwrap_or_default(),
                color: prop_text(rep, "calendar-color").and_then(|c| normalize_color(&c)),
                sync_token: prop_text(rep, "sync-token"),
                ctag: prop_text(rep, "getctag"),
                supported_components,
                path,
            };
            log::info!("Found calendar {} ({})", calendar.name, calendar.path);
            calendars.push(calendar);
        }

        Ok(calendars)
    }
}

#[async_trait]
impl CalDavSource for Client {
    async fn discover(&self, deadline: &Deadline) -> CalDavResult<Vec<Calendar>> {
        self.get_calendars(deadline).await
    }

    async fn sync(&self, calendar: &mut Calendar, deadline: &Deadline) -> CalDavResult<SyncDelta> {
        let mut token_rejected = false;
        if let Some(token) = calendar.sync_token.clone() {
            match self.sync_collection(calendar, &token, deadline).await? {
                Some(delta) => {
                    calendar.sync_token = delta.new_token.clone();
                    return Ok(delta);
                },
                None => {
                    log::info!("Sync token of {} is not valid anymore, falling back to a full resync", calendar.path);
                    calendar.sync_token = None;
                    token_rejected = true;
                },
            }
        }

        let (token, ctag) = self.collection_cursor(calendar, deadline).await?;
        if token_rejected == false && token.is_none() && ctag.is_some() && calendar.ctag == ctag {
            log::debug!("CTag of {} did not change, nothing to sync", calendar.path);
            return Ok(SyncDelta { ctag, ..SyncDelta::default() });
        }

        let listing = self.list_events(calendar, deadline).await?;
        calendar.sync_token = token.clone();
        calendar.ctag = ctag.clone();

        Ok(SyncDelta {
            changed: listing.events,
            deleted: Vec::new(),
            new_token: token,
            ctag,
            full_resync: true,
            listed_paths: Some(listing.paths),
            malformed: listing.malformed,
        })
    }

    async fn list_events(&self, calendar: &Calendar, deadline: &Deadline) -> CalDavResult<Listing> {
        let url = self.calendar_url(calendar);
        let reply = self.dav_request(REPORT.clone(), &url, 1, EVENTS_BODY.to_string(), deadline).await?;
        check_status(reply.status)?;
        let root = parse_xml(&reply.text)?;

        let mut collected = Collected::default();
        self.collect_responses(&root, calendar, &mut collected);
        self.fetch_missing_data(calendar, &mut collected, deadline).await?;

        Ok(Listing {
            events: collected.events,
            paths: collected.paths,
            malformed: collected.malformed,
        })
    }

    async fn fetch_event(&self, _calendar: &Calendar, path: &str, deadline: &Deadline) -> CalDavResult<Event> {
        let (etag, data) = self.get_resource(path, deadline).await?;
        Event::from_resource(path, etag, data)?
            .ok_or_else(|| CalDavError::MalformedContent("the resource holds no VEVENT".to_string()))
    }

    async fn put_event(&self, _calendar: &Calendar, path: &str, data: &str, condition: PutCondition, deadline: &Deadline) -> CalDavResult<Option<String>> {
        let url = self.resource_url(path)?;
        let mut request = self.request(Method::PUT, &url)
            .header(CONTENT_TYPE, "text/calendar; charset=utf-8")
            .body(data.to_string());
        request = match &condition {
            PutCondition::CreateOnly => request.header(IF_NONE_MATCH, "*"),
            PutCondition::IfMatch(etag) => request.header(IF_MATCH, etag.as_str()),
            PutCondition::Overwrite => request,
        };

        let reply = self.send(request, deadline).await?;
        check_status(reply.status)?;
        if reply.etag.is_some() {
            return Ok(reply.etag);
        }

        // Some servers do not return the ETag of a resource they have altered
        let head = self.send(self.request(Method::HEAD, &url), deadline).await?;
        if head.status.is_success() == false {
            log::debug!("Unable to get the ETag of {} ({})", path, head.status);
        }
        Ok(head.etag)
    }

    async fn delete_event(&self, _calendar: &Calendar, path: &str, deadline: &Deadline) -> CalDavResult<()> {
        let url = self.resource_url(path)?;
        let reply = self.send(self.request(Method::DELETE, &url), deadline).await?;
        match check_status(reply.status) {
            Err(CalDavError::NotFound) => {
                log::debug!("{} was already deleted", path);
                Ok(())
            },
            other => other,
        }
    }

    async fn create_calendar(&self, name: &str, deadline: &Deadline) -> CalDavResult<Calendar> {
        let home = self.get_cal_home_set(deadline).await?;
        let mut slug = sanitize_filename::sanitize(name).replace(' ', "-");
        if slug.is_empty() {
            slug = uuid::Uuid::new_v4().to_hyphenated().to_string();
        }
        let url = home.join(&format!("{}/", slug))
            .map_err(|err| CalDavError::InvalidResponse(format!("invalid calendar home set: {}", err)))?;

        let request = self.request(MKCALENDAR.clone(), &url)
            .header(CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(mkcalendar_body(name));
        let reply = self.send(request, deadline).await?;
        if reply.status == StatusCode::METHOD_NOT_ALLOWED {
            return Err(CalDavError::InvalidResponse(format!("a collection already exists at {}", url.path())));
        }
        check_status(reply.status)?;

        log::info!("Created calendar {} at {}", name, url.path());
        Ok(Calendar::new(url.path(), name))
    }
}


/// Builds [`Client`]s
#[derive(Clone, Debug, Default)]
pub struct HttpConnector;

impl CalDavConnector for HttpConnector {
    fn connect(&self, endpoint: &Url, credentials: &Credentials) -> CalDavResult<Arc<dyn CalDavSource>> {
        let client = Client::new(endpoint.clone(), credentials.clone())?;
        Ok(Arc::new(client))
    }
}
