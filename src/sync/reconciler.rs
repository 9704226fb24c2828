//! Reconciles the calendars of a source with their destination calendars
//!
//! A run pairs every source calendar with a destination calendar, then runs one pass per direction:
//! source to destination, and for two-way sources destination to source. Both passes share the UID map
//! of the pair, and a per-run record of which side won each event, so that a change applied by the
//! first pass is not seen as a conflict by the second one.

use std::collections::{BTreeMap, BTreeSet};

use crate::calendar::Calendar;
use crate::config::SyncSettings;
use crate::deadline::Deadline;
use crate::error::{CalDavError, CalDavResult, SyncError, SyncResult};
use crate::event::Event;
use crate::source::{ConflictStrategy, Side, Source, SyncDirection};
use crate::sync::state::{Cursor, MappedEvent, PairState, ResourceRef, SourceState};
use crate::sync::sync_progress::{SyncEvent, SyncProgress};
use crate::traits::{CalDavSource, PutCondition, SyncDelta};

/// Which side won each event during the current run
type Decisions = BTreeMap<String, Side>;

/// The current content of the target calendar of a pass, downloaded only when an unmapped event needs it
enum TargetView {
    NotLoaded,
    Unavailable,
    Loaded(TargetListing),
}

#[derive(Default)]
struct TargetListing {
    events: Vec<Event>,
    /// Paths that cannot be used for a new resource
    taken: BTreeSet<String>,
    /// Target events adopted during this pass
    adopted: BTreeSet<String>,
}

impl TargetListing {
    /// Finds an unmapped target event equivalent to `event`: first by UID, then by dedupe key.
    ///
    /// A target event whose UID belongs to another origin event of the delta is never taken by dedupe key.
    fn find_adoptable(&self, event: &Event, mapped: &BTreeSet<String>, delta_uids: &BTreeSet<String>) -> Option<Event> {
        let is_free = |candidate: &&Event| {
            mapped.contains(candidate.path()) == false && self.adopted.contains(candidate.path()) == false
        };

        self.events.iter()
            .filter(is_free)
            .find(|candidate| candidate.uid() == event.uid())
            .or_else(|| {
                let key = event.dedupe_key();
                self.events.iter()
                    .filter(is_free)
                    .filter(|candidate| delta_uids.contains(candidate.uid()) == false)
                    .find(|candidate| candidate.dedupe_key() == key)
            })
            .cloned()
    }

    /// The path a new resource for `uid` will be written to
    fn new_resource_path(&self, calendar: &Calendar, uid: &str, mapped: &BTreeSet<String>) -> String {
        let name = resource_name(uid);
        if name.is_empty() == false {
            let path = format!("{}{}.ics", collection_prefix(calendar), name);
            if self.taken.contains(&path) == false && mapped.contains(&path) == false {
                return path;
            }
        }
        random_resource_path(calendar)
    }
}

/// The sanitized UID, restricted to characters that need no escaping in a URL path
fn resource_name(uid: &str) -> String {
    sanitize_filename::sanitize(uid)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '-' })
        .collect::<String>()
        .trim_matches('.')
        .to_string()
}

fn collection_prefix(calendar: &Calendar) -> String {
    match calendar.path.ends_with('/') {
        true => calendar.path.clone(),
        false => format!("{}/", calendar.path),
    }
}

fn random_resource_path(calendar: &Calendar) -> String {
    format!("{}{}.ics", collection_prefix(calendar), uuid::Uuid::new_v4().to_hyphenated())
}


/// Syncs every calendar of one source, for one run
pub struct Reconciler<'a> {
    source: &'a Source,
    src: &'a dyn CalDavSource,
    dst: &'a dyn CalDavSource,
    settings: &'a SyncSettings,
    deadline: &'a Deadline,
    progress: &'a mut SyncProgress,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        source: &'a Source,
        src: &'a dyn CalDavSource,
        dst: &'a dyn CalDavSource,
        settings: &'a SyncSettings,
        deadline: &'a Deadline,
        progress: &'a mut SyncProgress,
    ) -> Self {
        Self { source, src, dst, settings, deadline, progress }
    }

    fn server(&self, side: Side) -> &'a dyn CalDavSource {
        match side {
            Side::Source => self.src,
            Side::Destination => self.dst,
        }
    }

    /// Whether an error must terminate the whole run
    fn must_abort(&self, err: &CalDavError) -> bool {
        err.is_fatal() || self.deadline.is_expired() || self.deadline.is_cancelled()
    }

    fn abort(side: Side, err: CalDavError) -> SyncError {
        SyncError::Aborted { side: side.name(), source: err }
    }

    /// Run the sync. `state` is updated along the way, so that it reflects what has been written even if the run is aborted
    pub async fn run(&mut self, state: &mut SourceState) -> SyncResult<()> {
        self.progress.info(&format!("Starting a sync of {}", self.source.name));
        self.progress.feedback(SyncEvent::Started);

        // Failing to list calendars is always fatal: this is the first operation on each side
        let source_calendars = self.src.discover(self.deadline).await
            .map_err(|err| Self::abort(Side::Source, err))?;
        let mut destination_calendars = self.dst.discover(self.deadline).await
            .map_err(|err| Self::abort(Side::Destination, err))?;

        for src_cal in source_calendars {
            // The previous pair stays in the state until a destination calendar is found
            let previous = state.pairs.get(&src_cal.path).map(|pair| pair.destination_path.clone());
            let vanished = previous.as_ref()
                .map(|path| destination_calendars.iter().all(|cal| cal.path != *path))
                .unwrap_or(false);
            let taken: BTreeSet<String> = state.pairs.iter()
                .filter(|(path, _)| **path != src_cal.path)
                .map(|(_, pair)| pair.destination_path.clone())
                .collect();

            let dst_cal = match self.pair_calendar(&src_cal, previous.as_deref(), &mut destination_calendars, &taken).await? {
                Some(dst_cal) => dst_cal,
                None => continue,
            };
            let mut pair = match state.pairs.remove(&src_cal.path) {
                Some(pair) if vanished == false => pair,
                _ => PairState::new(&dst_cal.path),
            };

            let result = self.reconcile_pair(&src_cal, &dst_cal, &mut pair).await;
            state.pairs.insert(src_cal.path.clone(), pair);
            result?;
        }

        let success = self.progress.is_success();
        self.progress.feedback(SyncEvent::Finished { success });
        Ok(())
    }

    /// Find (or create) the destination calendar of a source calendar
    async fn pair_calendar(&mut self, src_cal: &Calendar, previous: Option<&str>, dst_cals: &mut Vec<Calendar>, taken: &BTreeSet<String>)
        -> SyncResult<Option<Calendar>>
    {
        if let Some(previous) = previous {
            if let Some(dst_cal) = dst_cals.iter().find(|cal| cal.path == previous) {
                return Ok(Some(dst_cal.clone()));
            }
            self.progress.warn(&format!("Destination calendar {} of {} has vanished, pairing it again", previous, src_cal.name));
        }

        if let Some(dst_cal) = dst_cals.iter().find(|cal| cal.name == src_cal.name && taken.contains(&cal.path) == false) {
            self.progress.info(&format!("Pairing calendar {} with {}", src_cal.path, dst_cal.path));
            return Ok(Some(dst_cal.clone()));
        }

        match self.dst.create_calendar(&src_cal.name, self.deadline).await {
            Ok(dst_cal) => {
                self.progress.info(&format!("Created destination calendar {} for {}", dst_cal.path, src_cal.path));
                dst_cals.push(dst_cal.clone());
                Ok(Some(dst_cal))
            },
            Err(err) if self.must_abort(&err) => Err(Self::abort(Side::Destination, err)),
            Err(err) => {
                self.progress.error(&format!("Unable to create a destination calendar for {}: {}", src_cal.name, err));
                Ok(None)
            },
        }
    }

    async fn reconcile_pair(&mut self, src_cal: &Calendar, dst_cal: &Calendar, pair: &mut PairState) -> SyncResult<()> {
        let mut src_cal = src_cal.with_cursor(pair.source_cursor.sync_token.clone(), pair.source_cursor.ctag.clone());
        let mut dst_cal = dst_cal.with_cursor(pair.destination_cursor.sync_token.clone(), pair.destination_cursor.ctag.clone());

        let src_delta = match self.fetch_delta(Side::Source, &mut src_cal).await? {
            Some(delta) => delta,
            None => return Ok(()),
        };
        let dst_delta = match self.source.direction {
            SyncDirection::OneWay => None,
            SyncDirection::TwoWay => self.fetch_delta(Side::Destination, &mut dst_cal).await?,
        };

        let mut decisions = Decisions::new();
        self.pass(Side::Source, &src_cal, &dst_cal, src_delta, pair, &mut decisions).await?;
        if let Some(dst_delta) = dst_delta {
            self.pass(Side::Destination, &dst_cal, &src_cal, dst_delta, pair, &mut decisions).await?;
        }
        Ok(())
    }

    /// Returns `None` if the changes of this calendar cannot be known for this run
    async fn fetch_delta(&mut self, side: Side, calendar: &mut Calendar) -> SyncResult<Option<SyncDelta>> {
        self.progress.feedback(SyncEvent::InProgress {
            calendar: calendar.name.clone(),
            details: format!("fetching {} changes", side.name()),
        });

        match self.server(side).sync(calendar, self.deadline).await {
            Ok(delta) => {
                self.progress.debug(&format!(
                    "{} {}: {} changed, {} deleted, full resync: {}",
                    side.name(), calendar.path, delta.changed.len(), delta.deleted.len(), delta.full_resync,
                ));
                Ok(Some(delta))
            },
            Err(err) if self.must_abort(&err) => Err(Self::abort(side, err)),
            Err(err) => {
                self.progress.error(&format!("Unable to get the changes of {} calendar {}: {}", side.name(), calendar.path, err));
                Ok(None)
            },
        }
    }

    /// Apply the changes of the `origin` side onto the other side
    async fn pass(&mut self, origin: Side, origin_cal: &Calendar, target_cal: &Calendar, delta: SyncDelta, pair: &mut PairState, decisions: &mut Decisions)
        -> SyncResult<()>
    {
        let failed_before = self.progress.counts().failed;
        self.progress.malformed_mut().extend(delta.malformed.iter().cloned());

        let changed_uids: BTreeSet<String> = delta.changed.iter().map(|ev| ev.uid().to_string()).collect();

        self.confirm_pending_deletions(origin, origin_cal, target_cal, &delta, &changed_uids, pair, decisions).await?;

        for (key, inferred) in deletions(origin, &delta, &changed_uids, pair) {
            if decisions.get(&key) == Some(&origin.other()) {
                self.progress.skipped(&format!("Not deleting {}, its {} version already won during this run", key, origin.other().name()));
                continue;
            }
            if inferred && self.settings.defer_full_resync_deletions {
                if pair.pending_deletions.insert(key.clone(), origin).is_none() {
                    self.progress.info(&format!("{} is missing from a full listing of the {}, it will be deleted if it is still missing next time", key, origin.name()));
                }
                continue;
            }
            self.delete_mapped(origin, target_cal, &key, pair, decisions).await?;
        }

        let mut view = TargetView::NotLoaded;
        for event in &delta.changed {
            let key = pair.key_by_uid(origin, event.uid())
                .or_else(|| pair.key_by_path(origin, event.path()));
            match key {
                Some(key) => self.update(origin, event, &key, target_cal, pair, decisions).await?,
                None => self.adopt_or_create(origin, event, target_cal, &changed_uids, &mut view, pair, decisions).await?,
            }
        }

        if self.progress.counts().failed == failed_before {
            *pair.cursor_mut(origin) = Cursor::from_calendar(origin_cal);
        } else {
            self.progress.warn(&format!("Some items of {} failed, its cursor is kept so that they are retried", origin_cal.path));
        }
        Ok(())
    }

    /// Deletes the target resources whose origin was missing from a previous full listing, if it is really gone
    #[allow(clippy::too_many_arguments)]
    async fn confirm_pending_deletions(&mut self, origin: Side, origin_cal: &Calendar, target_cal: &Calendar, delta: &SyncDelta,
        changed_uids: &BTreeSet<String>, pair: &mut PairState, decisions: &mut Decisions) -> SyncResult<()>
    {
        let pending: Vec<String> = pair.pending_deletions.iter()
            .filter(|(_, side)| **side == origin)
            .map(|(key, _)| key.clone())
            .collect();

        for key in pending {
            let origin_ref = match pair.events.get(&key) {
                Some(mapped) => mapped.side(origin).clone(),
                None => {
                    pair.pending_deletions.remove(&key);
                    continue;
                },
            };

            let listed = delta.listed_paths.as_ref().map(|paths| paths.contains(&origin_ref.path)).unwrap_or(false);
            if listed || changed_uids.contains(&origin_ref.uid) {
                self.progress.debug(&format!("{} is back, it will not be deleted", origin_ref.path));
                pair.pending_deletions.remove(&key);
                continue;
            }

            match self.server(origin).fetch_event(origin_cal, &origin_ref.path, self.deadline).await {
                Err(CalDavError::NotFound) => {
                    self.progress.debug(&format!("{} is confirmed deleted", origin_ref.path));
                    self.delete_mapped(origin, target_cal, &key, pair, decisions).await?;
                },
                Ok(_) | Err(CalDavError::MalformedContent(_)) => {
                    self.progress.debug(&format!("{} still exists, it will not be deleted", origin_ref.path));
                    pair.pending_deletions.remove(&key);
                },
                Err(err) if self.must_abort(&err) => return Err(Self::abort(origin, err)),
                Err(err) => {
                    self.progress.warn(&format!("Unable to check whether {} still exists: {}", origin_ref.path, err));
                },
            }
        }
        Ok(())
    }

    async fn delete_mapped(&mut self, origin: Side, target_cal: &Calendar, key: &str, pair: &mut PairState, decisions: &mut Decisions) -> SyncResult<()> {
        let target = origin.other();
        let target_path = match pair.events.get(key) {
            Some(mapped) => mapped.side(target).path.clone(),
            None => return Ok(()),
        };

        match self.server(target).delete_event(target_cal, &target_path, self.deadline).await {
            Ok(()) => {
                pair.remove(key);
                decisions.insert(key.to_string(), origin);
                self.progress.deleted(&format!("Deleted {} on the {}", target_path, target.name()));
            },
            Err(err) if self.must_abort(&err) => return Err(Self::abort(target, err)),
            Err(err) => self.progress.item_failed(&format!("Unable to delete {} on the {}: {}", target_path, target.name(), err)),
        }
        Ok(())
    }

    async fn put(&self, side: Side, calendar: &Calendar, path: &str, event: &Event, condition: PutCondition) -> CalDavResult<Option<String>> {
        self.server(side).put_event(calendar, path, event.data(), condition, self.deadline).await
    }

    fn record_write(origin: Side, key: &str, event: &Event, target_path: &str, etag: Option<String>, pair: &mut PairState, decisions: &mut Decisions) {
        let mapped = MappedEvent::new(origin, ResourceRef::from_event(event), ResourceRef::written(target_path, etag, event));
        pair.events.insert(key.to_string(), mapped);
        decisions.insert(key.to_string(), origin);
    }

    /// Propagate a change of an event that is already mapped
    async fn update(&mut self, origin: Side, event: &Event, key: &str, target_cal: &Calendar, pair: &mut PairState, decisions: &mut Decisions)
        -> SyncResult<()>
    {
        let target = origin.other();
        pair.pending_deletions.remove(key);
        let mapped = match pair.events.get_mut(key) {
            Some(mapped) => mapped,
            None => return Ok(()),
        };

        let origin_ref = mapped.side_mut(origin);
        if event.etag().is_empty() == false && event.etag() == origin_ref.etag {
            origin_ref.path = event.path().to_string();
            self.progress.skipped(&format!("{} is unchanged", event.path()));
            return Ok(());
        }

        let target_ref = mapped.side(target).clone();
        let condition = match decisions.get(key) {
            Some(winner) if *winner == target => {
                // The mapping already holds what the winning write left on this side
                self.progress.skipped(&format!("Not updating {}, its {} version already won during this run", target_ref.path, target.name()));
                return Ok(());
            },
            Some(_) => PutCondition::Overwrite,
            None if target_ref.etag.is_empty() => PutCondition::Overwrite,
            None => PutCondition::IfMatch(target_ref.etag.clone()),
        };

        match self.put(target, target_cal, &target_ref.path, event, condition).await {
            Ok(etag) => {
                Self::record_write(origin, key, event, &target_ref.path, etag, pair, decisions);
                self.progress.updated(&format!("Updated {} on the {}", target_ref.path, target.name()));
            },
            Err(CalDavError::PreconditionFailed) => {
                self.resolve_conflict(origin, event, key, &target_ref.path, target_cal, pair, decisions).await?;
            },
            Err(err) if self.must_abort(&err) => return Err(Self::abort(target, err)),
            Err(err) => self.progress.item_failed(&format!("Unable to update {} on the {}: {}", target_ref.path, target.name(), err)),
        }
        Ok(())
    }

    /// Both sides changed the same event
    #[allow(clippy::too_many_arguments)]
    async fn resolve_conflict(&mut self, origin: Side, event: &Event, key: &str, target_path: &str, target_cal: &Calendar,
        pair: &mut PairState, decisions: &mut Decisions) -> SyncResult<()>
    {
        let target = origin.other();
        let strategy = self.source.conflict_strategy;

        let target_modified = match strategy {
            ConflictStrategy::NewestWins => {
                match self.server(target).fetch_event(target_cal, target_path, self.deadline).await {
                    Ok(target_event) => target_event.last_modified(),
                    Err(CalDavError::NotFound) | Err(CalDavError::MalformedContent(_)) => None,
                    Err(err) if self.must_abort(&err) => return Err(Self::abort(target, err)),
                    Err(err) => {
                        self.progress.item_failed(&format!("Unable to fetch {} to resolve a conflict: {}", target_path, err));
                        return Ok(());
                    },
                }
            },
            _ => None,
        };
        let (source_modified, destination_modified) = match origin {
            Side::Source => (event.last_modified(), target_modified),
            Side::Destination => (target_modified, event.last_modified()),
        };
        let winner = strategy.winner(source_modified, destination_modified);

        if winner == target {
            self.progress.conflict(&format!("{} changed on both sides, keeping the {} version", event.uid(), target.name()));
            if let Some(mapped) = pair.events.get_mut(key) {
                *mapped.side_mut(origin) = ResourceRef::from_event(event);
            }
            decisions.insert(key.to_string(), target);
            return Ok(());
        }

        self.progress.conflict(&format!("{} changed on both sides, keeping the {} version", event.uid(), origin.name()));
        match self.put(target, target_cal, target_path, event, PutCondition::Overwrite).await {
            Ok(etag) => {
                Self::record_write(origin, key, event, target_path, etag, pair, decisions);
                self.progress.updated(&format!("Overwrote {} on the {}", target_path, target.name()));
            },
            Err(err) if self.must_abort(&err) => return Err(Self::abort(target, err)),
            Err(err) => self.progress.item_failed(&format!("Unable to overwrite {} on the {}: {}", target_path, target.name(), err)),
        }
        Ok(())
    }

    /// Propagate an event that is not mapped yet: adopt an equivalent target event, or create a new one
    #[allow(clippy::too_many_arguments)]
    async fn adopt_or_create(&mut self, origin: Side, event: &Event, target_cal: &Calendar, delta_uids: &BTreeSet<String>,
        view: &mut TargetView, pair: &mut PairState, decisions: &mut Decisions) -> SyncResult<()>
    {
        let target = origin.other();

        if pair.key_by_uid(target, event.uid()).is_some() {
            self.progress.skipped(&format!("{} is already mapped to another {} event", event.uid(), target.name()));
            return Ok(());
        }

        if let TargetView::NotLoaded = view {
            *view = match self.server(target).list_events(target_cal, self.deadline).await {
                Ok(listing) => TargetView::Loaded(TargetListing {
                    events: listing.events,
                    taken: listing.paths,
                    adopted: BTreeSet::new(),
                }),
                Err(err) if self.must_abort(&err) => return Err(Self::abort(target, err)),
                Err(err) => {
                    self.progress.error(&format!("Unable to list {} on the {}: {}", target_cal.path, target.name(), err));
                    TargetView::Unavailable
                },
            };
        }
        let listing = match view {
            TargetView::Loaded(listing) => listing,
            _ => {
                self.progress.item_failed(&format!("Not creating {}, the {} calendar could not be listed", event.uid(), target.name()));
                return Ok(());
            },
        };

        let mapped_paths = pair.paths(target);
        if let Some(found) = listing.find_adoptable(event, &mapped_paths, delta_uids) {
            let key = match origin {
                Side::Source => event.uid().to_string(),
                Side::Destination => found.uid().to_string(),
            };
            listing.adopted.insert(found.path().to_string());
            pair.events.insert(key, MappedEvent::new(origin, ResourceRef::from_event(event), ResourceRef::from_event(&found)));
            self.progress.skipped(&format!("Adopting {} on the {} for {}", found.path(), target.name(), event.uid()));
            return Ok(());
        }

        let mut path = listing.new_resource_path(target_cal, event.uid(), &mapped_paths);
        let mut result = self.put(target, target_cal, &path, event, PutCondition::CreateOnly).await;
        if result == Err(CalDavError::PreconditionFailed) {
            // Something we did not list lives at this path
            listing.taken.insert(path);
            path = random_resource_path(target_cal);
            result = self.put(target, target_cal, &path, event, PutCondition::CreateOnly).await;
        }

        match result {
            Ok(etag) => {
                listing.taken.insert(path.clone());
                Self::record_write(origin, event.uid(), event, &path, etag, pair, decisions);
                self.progress.created(&format!("Created {} on the {}", path, target.name()));
            },
            Err(err) if self.must_abort(&err) => return Err(Self::abort(target, err)),
            Err(err) => self.progress.item_failed(&format!("Unable to create {} on the {}: {}", path, target.name(), err)),
        }
        Ok(())
    }
}

/// Mapped events deleted on `origin`: reported deleted (`false`), or missing from a full listing (`true`)
fn deletions(origin: Side, delta: &SyncDelta, changed_uids: &BTreeSet<String>, pair: &PairState) -> Vec<(String, bool)> {
    let mut deletions = Vec::new();
    for path in &delta.deleted {
        let mapped = pair.events.iter().find(|(_, mapped)| mapped.side(origin).path == *path);
        match mapped {
            // It moved to another path of the same calendar, and will be updated in place
            Some((_, mapped)) if changed_uids.contains(&mapped.side(origin).uid) => {
                log::trace!("{} was deleted, but {} is still there under another path", path, mapped.side(origin).uid);
            },
            Some((key, _)) => deletions.push((key.clone(), false)),
            None => log::trace!("{} was deleted, but it is not mapped", path),
        }
    }

    if delta.full_resync {
        if let Some(listed) = &delta.listed_paths {
            for (key, mapped) in &pair.events {
                let origin_ref = mapped.side(origin);
                if listed.contains(&origin_ref.path) == false && changed_uids.contains(&origin_ref.uid) == false {
                    deletions.push((key.clone(), true));
                }
            }
        }
    }
    deletions
}
