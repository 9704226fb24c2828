mod scenarii;

use std::time::Duration;

use calbridge::config::SyncSettings;
use calbridge::mock::{ical_event, ical_event_modified};
use calbridge::mock_behaviour::MockBehaviour;
use calbridge::source::{ConflictStrategy, SyncDirection};
use calbridge::sync_log::{RunStatus, RunTrigger};
use calbridge::traits::SyncStore;
use calbridge::Deadline;

use scenarii::{Bench, CAL_NAME, SOURCE_ID, SRC_CAL};

const START: &str = "20240115T090000Z";

#[tokio::test]
async fn test_first_sync_then_nothing_to_do() {
    let bench = Bench::one_way();
    bench.add_source_event("u1", "Standup", START);

    let run = bench.run().await;
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.counts.created, 1);
    assert_eq!(bench.dst.create_calendar_count(), 1);
    assert_eq!(bench.dst_paths(), vec![format!("{}u1.ics", bench.dst_cal())]);
    assert_eq!(bench.dst.resource(&bench.dst_paths()[0]), Some(ical_event("u1", "Standup", START)));

    let run = bench.run().await;
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.counts.writes(), 0);
    assert_eq!(bench.dst.put_count(), 1);
    assert_eq!(bench.dst.create_calendar_count(), 1);
}

#[tokio::test]
async fn test_changes_are_propagated() {
    let bench = Bench::one_way();
    let u1 = bench.add_source_event("u1", "Standup", START);
    bench.add_source_event("u2", "Retro", START);
    bench.run().await;

    bench.add_source_event("u1", "Standup (moved)", "20240115T100000Z");
    bench.src.remove_resource(SRC_CAL, &format!("{}u2.ics", SRC_CAL)).unwrap();
    bench.add_source_event("u3", "Planning", START);

    let run = bench.run().await;
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!((run.counts.created, run.counts.updated, run.counts.deleted), (1, 1, 1));

    let dst_cal = bench.dst_cal();
    assert_eq!(bench.dst_paths(), vec![format!("{}u1.ics", dst_cal), format!("{}u3.ics", dst_cal)]);
    assert_eq!(bench.dst.resource(&format!("{}u1.ics", dst_cal)), bench.src.resource(&u1));
}

#[tokio::test]
async fn test_existing_event_is_adopted() {
    let bench = Bench::one_way();
    bench.dst.add_calendar("/calendars/work-copy/", CAL_NAME);
    let legacy = "/calendars/work-copy/legacy-1.ics";
    bench.dst.insert_resource("/calendars/work-copy/", legacy, &ical_event("legacy-1", "Standup", START)).unwrap();
    bench.add_source_event("u1", "Standup", START);

    let run = bench.run().await;
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.counts.created, 0);
    assert_eq!(run.counts.skipped, 1);
    assert_eq!(bench.dst.put_count(), 0);
    assert_eq!(bench.dst.create_calendar_count(), 0);

    // From now on, the adopted event follows its source
    bench.add_source_event("u1", "Standup (moved)", START);
    let run = bench.run().await;
    assert_eq!(run.counts.updated, 1);
    assert_eq!(bench.dst.resource_paths("/calendars/work-copy/"), vec![legacy.to_string()]);
    assert!(bench.dst.resource(legacy).unwrap().contains("SUMMARY:Standup (moved)"));
}

#[tokio::test]
async fn test_malformed_event_does_not_block_the_others() {
    let bench = Bench::one_way();
    bench.add_source_event("u1", "Standup", START);
    let bad = format!("{}bad.ics", SRC_CAL);
    bench.src.insert_resource(SRC_CAL, &bad, "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VEVENT\r\nSUMMARY:No UID\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n").unwrap();

    let run = bench.run().await;
    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.counts.created, 1);
    assert_eq!(run.counts.failed, 0);
    assert_eq!(run.malformed_events.len(), 1);
    assert_eq!(run.malformed_events[0].path, bad);
    assert!(run.malformed_events[0].error_message.contains("missing UID"));
    assert_eq!(bench.dst_paths().len(), 1);

    // The malformed event did not change since, so it is not reported again
    let run = bench.run().await;
    assert_eq!(run.status, RunStatus::Success);
    assert!(run.malformed_events.is_empty());
}

#[tokio::test]
async fn test_invalidated_token_changes_nothing() {
    let bench = Bench::one_way();
    bench.add_source_event("u1", "Standup", START);
    bench.add_source_event("u2", "Retro", START);
    bench.run().await;

    bench.src.invalidate_tokens();
    let run = bench.run().await;
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.counts.writes(), 0);
    assert_eq!(run.counts.skipped, 2);
    assert_eq!(bench.dst.put_count(), 2);
    assert_eq!(bench.dst_paths().len(), 2);
}

#[tokio::test]
async fn test_ctag_only_server() {
    let bench = Bench::one_way();
    bench.src.set_supports_sync(false);
    bench.add_source_event("u1", "Standup", START);
    bench.run().await;

    let run = bench.run().await;
    assert_eq!(run.counts.writes(), 0);
    assert_eq!(bench.src.list_count(), 1);

    bench.add_source_event("u2", "Retro", START);
    let run = bench.run().await;
    assert_eq!(run.counts.created, 1);
    assert_eq!(run.counts.skipped, 1);
    assert_eq!(bench.src.list_count(), 2);
}

#[tokio::test]
async fn test_deletions_after_full_resync_are_deferred() {
    let bench = Bench::one_way();
    bench.add_source_event("u1", "Standup", START);
    let u2 = bench.add_source_event("u2", "Retro", START);
    bench.run().await;

    bench.src.remove_resource(SRC_CAL, &u2).unwrap();
    bench.src.invalidate_tokens();
    let run = bench.run().await;
    assert_eq!(run.counts.deleted, 0);
    assert_eq!(bench.dst_paths().len(), 2);

    // Still gone on the next run: now it is deleted
    let run = bench.run().await;
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.counts.deleted, 1);
    assert_eq!(bench.dst_paths(), vec![format!("{}u1.ics", bench.dst_cal())]);
}

#[tokio::test]
async fn test_deferred_deletion_is_cancelled_when_the_event_is_back() {
    let bench = Bench::one_way();
    let u1 = bench.add_source_event("u1", "Standup", START);
    bench.run().await;

    bench.src.remove_resource(SRC_CAL, &u1).unwrap();
    bench.src.invalidate_tokens();
    bench.run().await;

    bench.src.insert_resource(SRC_CAL, &u1, &ical_event("u1", "Standup", START)).unwrap();
    let run = bench.run().await;
    assert_eq!(run.counts.deleted, 0);
    assert_eq!(bench.dst_paths().len(), 1);
}

#[tokio::test]
async fn test_immediate_deletions_after_full_resync() {
    let settings = SyncSettings { defer_full_resync_deletions: false, ..SyncSettings::default() };
    let bench = Bench::new(scenarii::source(SyncDirection::OneWay, ConflictStrategy::SourceWins), settings);
    bench.add_source_event("u1", "Standup", START);
    let u2 = bench.add_source_event("u2", "Retro", START);
    bench.run().await;

    bench.src.remove_resource(SRC_CAL, &u2).unwrap();
    bench.src.invalidate_tokens();
    let run = bench.run().await;
    assert_eq!(run.counts.deleted, 1);
    assert_eq!(bench.dst_paths().len(), 1);
}

#[tokio::test]
async fn test_two_way() {
    let bench = Bench::two_way(ConflictStrategy::SourceWins);
    bench.add_source_event("u1", "Standup", START);
    bench.run().await;

    let dst_cal = bench.dst_cal();
    bench.dst.insert_resource(&dst_cal, &format!("{}d1.ics", dst_cal), &ical_event("d1", "Lunch", "20240115T120000Z")).unwrap();
    let run = bench.run().await;
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.counts.created, 1);
    assert_eq!(bench.src_paths(), vec![format!("{}d1.ics", SRC_CAL), format!("{}u1.ics", SRC_CAL)]);

    // Our own writes do not bounce back
    let run = bench.run().await;
    assert_eq!(run.counts.writes(), 0);
    assert_eq!(bench.src.put_count(), 1);
    assert_eq!(bench.dst.put_count(), 1);

    // Deletions work both ways too
    bench.dst.remove_resource(&dst_cal, &format!("{}d1.ics", dst_cal)).unwrap();
    let run = bench.run().await;
    assert_eq!(run.counts.deleted, 1);
    assert_eq!(bench.src_paths(), vec![format!("{}u1.ics", SRC_CAL)]);
}

#[tokio::test]
async fn test_conflict_source_wins() {
    let bench = Bench::two_way(ConflictStrategy::SourceWins);
    bench.add_source_event("u1", "Standup", START);
    bench.run().await;

    let dst_path = bench.dst_paths()[0].clone();
    bench.add_source_event("u1", "Source edit", START);
    bench.dst.insert_resource(&bench.dst_cal(), &dst_path, &ical_event("u1", "Destination edit", START)).unwrap();

    let run = bench.run().await;
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.counts.conflicts, 1);
    assert_eq!(run.counts.updated, 1);
    assert!(bench.dst.resource(&dst_path).unwrap().contains("SUMMARY:Source edit"));
    assert!(bench.src.resource(&format!("{}u1.ics", SRC_CAL)).unwrap().contains("SUMMARY:Source edit"));

    let run = bench.run().await;
    assert_eq!(run.counts.writes(), 0);
    assert_eq!(run.counts.conflicts, 0);
}

#[tokio::test]
async fn test_conflict_newest_wins() {
    let bench = Bench::two_way(ConflictStrategy::NewestWins);
    bench.add_source_event("u1", "Standup", START);
    bench.run().await;

    let src_path = format!("{}u1.ics", SRC_CAL);
    let dst_path = bench.dst_paths()[0].clone();
    bench.src.insert_resource(SRC_CAL, &src_path, &ical_event_modified("u1", "Source edit", START, "20240301T000000Z")).unwrap();
    bench.dst.insert_resource(&bench.dst_cal(), &dst_path, &ical_event_modified("u1", "Destination edit", START, "20240601T000000Z")).unwrap();

    let run = bench.run().await;
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.counts.conflicts, 1);
    assert_eq!(run.counts.updated, 1);
    assert!(bench.src.resource(&src_path).unwrap().contains("SUMMARY:Destination edit"));
    assert!(bench.dst.resource(&dst_path).unwrap().contains("SUMMARY:Destination edit"));

    let run = bench.run().await;
    assert_eq!(run.counts.writes(), 0);
}

#[tokio::test]
async fn test_conflict_destination_wins() {
    let bench = Bench::new(scenarii::source(SyncDirection::OneWay, ConflictStrategy::DestinationWins), SyncSettings::default());
    let src_path = bench.add_source_event("u1", "Standup", START);
    bench.run().await;

    let dst_path = bench.dst_paths()[0].clone();
    bench.add_source_event("u1", "Source edit", START);
    bench.dst.insert_resource(&bench.dst_cal(), &dst_path, &ical_event("u1", "Destination edit", START)).unwrap();

    let run = bench.run().await;
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.counts.conflicts, 1);
    assert_eq!(run.counts.updated, 0);
    assert_eq!(bench.dst.put_count(), 1);
    assert!(bench.dst.resource(&dst_path).unwrap().contains("SUMMARY:Destination edit"));
    assert!(bench.src.resource(&src_path).unwrap().contains("SUMMARY:Source edit"));

    let run = bench.run().await;
    assert_eq!(run.counts.writes(), 0);
    assert_eq!(run.counts.conflicts, 0);
}

#[tokio::test]
async fn test_conflict_destination_wins_two_way() {
    let bench = Bench::two_way(ConflictStrategy::DestinationWins);
    let src_path = bench.add_source_event("u1", "Standup", START);
    bench.run().await;

    let dst_path = bench.dst_paths()[0].clone();
    bench.add_source_event("u1", "Source edit", START);
    bench.dst.insert_resource(&bench.dst_cal(), &dst_path, &ical_event("u1", "Destination edit", START)).unwrap();

    let run = bench.run().await;
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.counts.conflicts, 1);
    // The destination version is written back to the source
    assert_eq!(run.counts.updated, 1);
    assert_eq!(bench.dst.put_count(), 1);
    assert_eq!(bench.src.put_count(), 1);
    assert!(bench.dst.resource(&dst_path).unwrap().contains("SUMMARY:Destination edit"));
    assert!(bench.src.resource(&src_path).unwrap().contains("SUMMARY:Destination edit"));

    let run = bench.run().await;
    assert_eq!(run.counts.writes(), 0);
    assert_eq!(run.counts.conflicts, 0);
}

#[tokio::test]
async fn test_moved_event_is_updated_in_place() {
    let bench = Bench::one_way();
    let old_path = bench.add_source_event("u1", "Standup", START);
    bench.run().await;
    let dst_path = bench.dst_paths()[0].clone();

    let new_path = format!("{}moved.ics", SRC_CAL);
    bench.src.remove_resource(SRC_CAL, &old_path).unwrap();
    bench.src.insert_resource(SRC_CAL, &new_path, &ical_event("u1", "Standup", START)).unwrap();

    let run = bench.run().await;
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!((run.counts.created, run.counts.updated, run.counts.deleted), (0, 1, 0));
    assert_eq!(bench.dst.delete_count(), 0);
    assert_eq!(bench.dst_paths(), vec![dst_path]);

    // The mapping follows the new path
    bench.src.remove_resource(SRC_CAL, &new_path).unwrap();
    let run = bench.run().await;
    assert_eq!(run.counts.deleted, 1);
    assert!(bench.dst_paths().is_empty());
}

#[tokio::test]
async fn test_moved_event_is_updated_in_place_two_way() {
    let bench = Bench::two_way(ConflictStrategy::SourceWins);
    let src_path = bench.add_source_event("u1", "Standup", START);
    bench.run().await;

    let dst_cal = bench.dst_cal();
    let old_path = bench.dst_paths()[0].clone();
    let new_path = format!("{}renamed.ics", dst_cal);
    bench.dst.remove_resource(&dst_cal, &old_path).unwrap();
    bench.dst.insert_resource(&dst_cal, &new_path, &ical_event("u1", "Standup", START)).unwrap();

    let run = bench.run().await;
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!((run.counts.created, run.counts.updated, run.counts.deleted), (0, 1, 0));
    assert_eq!(bench.src.delete_count(), 0);
    assert_eq!(bench.src_paths(), vec![src_path.clone()]);

    let run = bench.run().await;
    assert_eq!(run.counts.writes(), 0);

    bench.dst.remove_resource(&dst_cal, &new_path).unwrap();
    let run = bench.run().await;
    assert_eq!(run.counts.deleted, 1);
    assert!(bench.src_paths().is_empty());
}

#[tokio::test]
async fn test_mapping_survives_a_failed_calendar_creation() {
    let bench = Bench::one_way();
    bench.add_source_event("u1", "Standup", START);
    bench.run().await;

    bench.dst.remove_calendar(&bench.dst_cal());
    bench.dst.set_behaviour(MockBehaviour { create_calendar_behaviour: (0, 1), ..MockBehaviour::default() });

    let run = bench.run().await;
    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.counts.writes(), 0);
    let state = bench.store.load_state(SOURCE_ID).await.unwrap();
    assert_eq!(state.mapped_event_count(), 1);
    assert!(state.pairs[SRC_CAL].events.contains_key("u1"));

    // Once the calendar can be created again, it is filled from scratch
    let run = bench.run().await;
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.counts.created, 1);
    assert_eq!(bench.dst_paths().len(), 1);
}

#[tokio::test]
async fn test_failed_items_are_retried() {
    let bench = Bench::one_way();
    bench.add_source_event("u1", "Standup", START);
    bench.add_source_event("u2", "Retro", START);
    bench.dst.set_behaviour(MockBehaviour { put_event_behaviour: (0, 1), ..MockBehaviour::default() });

    let run = bench.run().await;
    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.counts.created, 1);
    assert_eq!(run.counts.failed, 1);

    let run = bench.run().await;
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.counts.created, 1);
    assert_eq!(bench.dst_paths().len(), 2);
}

#[tokio::test]
async fn test_rejected_credentials_abort_the_run() {
    let bench = Bench::one_way();
    bench.add_source_event("u1", "Standup", START);
    bench.dst.set_behaviour(MockBehaviour::reject_credentials());

    let run = bench.run().await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.message.unwrap().contains("authentication failed"));
    assert_eq!(run.counts.writes(), 0);

    bench.dst.set_behaviour(MockBehaviour::default());
    let run = bench.run().await;
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.counts.created, 1);
}

#[tokio::test]
async fn test_rejected_endpoint_is_never_contacted() {
    let mut source = scenarii::source(SyncDirection::OneWay, ConflictStrategy::SourceWins);
    source.destination_url = "https://127.0.0.1/dav/".parse().unwrap();
    let bench = Bench::new(source, SyncSettings::default());
    bench.add_source_event("u1", "Standup", START);

    let run = bench.run().await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.message.unwrap().contains("rejected"));
    assert_eq!(bench.src.list_count(), 0);
}

#[tokio::test]
async fn test_unknown_source() {
    let bench = Bench::one_way();
    let deadline = Deadline::after(Duration::from_secs(60));
    let run = bench.engine.sync_source("nope", RunTrigger::Scheduled, &deadline).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.message.unwrap().contains("does not exist"));
}

#[tokio::test(start_paused = true)]
async fn test_hung_server_times_out() {
    let bench = Bench::one_way();
    bench.add_source_event("u1", "Standup", START);
    bench.src.set_behaviour(MockBehaviour { hangs: true, ..MockBehaviour::default() });

    let deadline = Deadline::after(Duration::from_secs(30));
    let run = bench.engine.sync_source(scenarii::SOURCE_ID, RunTrigger::Scheduled, &deadline).await;
    assert_eq!(run.status, RunStatus::TimedOut);
    assert!(bench.dst.calendar_named(CAL_NAME).is_none());
}
