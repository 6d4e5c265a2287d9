//! Integration tests for the sync scheduler
//!
//! Time is paused in every test so debounce, cooldown and resync delays run
//! instantly and deterministically.

mod common;

use common::{harness, library, Call, ScriptedHandler};
use core_sync::{
    ConflictPrompt, ConflictResolution, LibraryId, LibraryScope, ObjectType, SchedulerConfig,
    SyncError, SyncRequest, SyncScheduler, SyncType,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

fn three_libraries() -> ScriptedHandler {
    ScriptedHandler::with_libraries(vec![
        library(LibraryId::User, "My Library"),
        library(LibraryId::Group(1), "Lab"),
        library(LibraryId::Group(2), "Seminar"),
    ])
}

/// Local group 5 is gone remotely, so every pass stops at a conflict prompt.
fn suspending() -> ScriptedHandler {
    let handler = ScriptedHandler::with_libraries(vec![
        library(LibraryId::User, "My Library"),
        library(LibraryId::Group(5), "Old Project"),
    ]);
    *handler.group_ids.lock().unwrap() = Some(Ok(vec![]));
    handler
}

fn scheduler(handler: Arc<ScriptedHandler>) -> (SyncScheduler, mpsc::Receiver<ConflictPrompt>) {
    let h = harness(handler);
    let scheduler = SyncScheduler::new(h.controller, h.signals, SchedulerConfig::default());
    (scheduler, h.prompts)
}

fn starts(handler: &ScriptedHandler) -> Vec<SyncType> {
    handler
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::Versions(LibraryId::User, ObjectType::Group, sync_type) => Some(sync_type),
            _ => None,
        })
        .collect()
}

fn synced(handler: &ScriptedHandler, library: LibraryId) -> bool {
    handler
        .calls()
        .contains(&Call::Versions(library, ObjectType::Collection, SyncType::Normal))
}

#[tokio::test(start_paused = true)]
async fn test_library_requests_are_coalesced() {
    let handler = Arc::new(three_libraries());
    let (scheduler, _prompts) = scheduler(Arc::clone(&handler));

    scheduler
        .request(SyncType::Normal, LibraryScope::specific([LibraryId::Group(1)]))
        .await;
    sleep(Duration::from_secs(1)).await;
    scheduler
        .request(SyncType::Normal, LibraryScope::specific([LibraryId::Group(2)]))
        .await;

    // The second request restarted the debounce
    sleep(Duration::from_millis(2500)).await;
    assert!(starts(&handler).is_empty());
    assert_eq!(
        scheduler.pending().await,
        Some(SyncRequest::new(
            SyncType::Normal,
            LibraryScope::specific([LibraryId::Group(1), LibraryId::Group(2)])
        ))
    );

    sleep(Duration::from_secs(1)).await;
    assert_eq!(starts(&handler), vec![SyncType::Normal]);
    assert!(synced(&handler, LibraryId::Group(1)));
    assert!(synced(&handler, LibraryId::Group(2)));
    assert!(!synced(&handler, LibraryId::User));
    assert!(!scheduler.is_in_progress());
}

#[tokio::test(start_paused = true)]
async fn test_all_libraries_dispatch_immediately() {
    let handler = Arc::new(three_libraries());
    let (scheduler, _prompts) = scheduler(Arc::clone(&handler));

    scheduler.request(SyncType::Normal, LibraryScope::All).await;
    sleep(Duration::from_millis(10)).await;

    assert_eq!(starts(&handler), vec![SyncType::Normal]);
    assert!(synced(&handler, LibraryId::User));
}

#[tokio::test(start_paused = true)]
async fn test_full_request_escalates_pending_scope() {
    let handler = Arc::new(three_libraries());
    let (scheduler, _prompts) = scheduler(Arc::clone(&handler));

    scheduler
        .request(SyncType::Normal, LibraryScope::specific([LibraryId::Group(1)]))
        .await;
    scheduler
        .request(SyncType::Full, LibraryScope::specific([LibraryId::Group(2)]))
        .await;
    sleep(Duration::from_secs(10)).await;

    // One pass, full, over every library; the debounce timer never fired
    assert_eq!(starts(&handler), vec![SyncType::Full]);
    assert!(handler
        .calls()
        .contains(&Call::Versions(LibraryId::User, ObjectType::Collection, SyncType::Full)));
    assert_eq!(scheduler.pending().await, None);
}

#[tokio::test(start_paused = true)]
async fn test_full_sync_cooldown() {
    let handler = Arc::new(three_libraries());
    let (scheduler, _prompts) = scheduler(Arc::clone(&handler));

    scheduler.request(SyncType::Full, LibraryScope::All).await;
    sleep(Duration::from_secs(1)).await;
    scheduler.request(SyncType::Full, LibraryScope::All).await;
    sleep(Duration::from_secs(5)).await;

    assert_eq!(starts(&handler), vec![SyncType::Full]);

    sleep(Duration::from_secs(60 * 60)).await;
    scheduler.request(SyncType::Full, LibraryScope::All).await;
    sleep(Duration::from_secs(1)).await;

    assert_eq!(starts(&handler), vec![SyncType::Full, SyncType::Full]);
}

#[tokio::test(start_paused = true)]
async fn test_pending_request_runs_after_completion() {
    let handler = Arc::new(suspending());
    let (scheduler, mut prompts) = scheduler(Arc::clone(&handler));

    scheduler.request(SyncType::Normal, LibraryScope::All).await;
    let prompt = prompts.recv().await.unwrap();
    assert!(scheduler.is_in_progress());

    scheduler
        .request(SyncType::IgnoreIndividualDelays, LibraryScope::specific([LibraryId::User]))
        .await;
    sleep(Duration::from_secs(10)).await;
    assert_eq!(starts(&handler), vec![SyncType::Normal]);

    // The follow-up pass only covers the user library, so it runs through
    prompt.respond(ConflictResolution::MarkGroupAsLocalOnly(5));
    sleep(Duration::from_secs(5)).await;

    assert!(!scheduler.is_in_progress());
    assert_eq!(
        starts(&handler),
        vec![SyncType::Normal, SyncType::IgnoreIndividualDelays]
    );
    assert!(handler.calls().contains(&Call::LocalOnly(5)));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_sync_clears_everything() {
    let handler = Arc::new(suspending());
    let (scheduler, mut prompts) = scheduler(Arc::clone(&handler));
    let mut busy = scheduler.subscribe_in_progress();

    scheduler.request(SyncType::Normal, LibraryScope::All).await;
    let _prompt = prompts.recv().await.unwrap();
    assert!(*busy.borrow_and_update());

    scheduler
        .request(SyncType::Normal, LibraryScope::specific([LibraryId::User]))
        .await;
    scheduler.cancel_sync().await;

    assert!(!scheduler.is_in_progress());
    assert!(busy.has_changed().unwrap());
    assert!(!*busy.borrow_and_update());
    assert_eq!(scheduler.pending().await, None);

    // Neither the debounced request nor a resync starts another pass
    sleep(Duration::from_secs(60)).await;
    assert_eq!(starts(&handler), vec![SyncType::Normal]);
}

#[tokio::test(start_paused = true)]
async fn test_aborted_pass_is_retried_as_full_sync() {
    let handler = Arc::new(three_libraries());
    handler.script_versions(LibraryId::User, ObjectType::Collection, Err(SyncError::NoConnection));
    let (scheduler, _prompts) = scheduler(Arc::clone(&handler));

    scheduler.request(SyncType::Normal, LibraryScope::All).await;
    sleep(Duration::from_secs(10)).await;
    assert_eq!(starts(&handler), vec![SyncType::Normal]);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(starts(&handler), vec![SyncType::Normal, SyncType::Full]);
}

#[tokio::test(start_paused = true)]
async fn test_abort_retry_ignores_full_sync_cooldown() {
    let handler = Arc::new(three_libraries());
    let (scheduler, _prompts) = scheduler(Arc::clone(&handler));

    scheduler.request(SyncType::Full, LibraryScope::All).await;
    sleep(Duration::from_secs(1)).await;
    assert_eq!(starts(&handler), vec![SyncType::Full]);
    assert!(!scheduler.is_in_progress());

    handler.script_versions(LibraryId::User, ObjectType::Collection, Err(SyncError::NoConnection));
    scheduler.request(SyncType::Normal, LibraryScope::All).await;
    sleep(Duration::from_secs(1)).await;
    assert_eq!(starts(&handler), vec![SyncType::Full, SyncType::Normal]);
    assert!(!scheduler.is_in_progress());

    // Connection is back before the retry fires
    handler.versions.lock().unwrap().clear();
    sleep(Duration::from_secs(15)).await;
    assert_eq!(
        starts(&handler),
        vec![SyncType::Full, SyncType::Normal, SyncType::Full]
    );

    // A requested full sync is still throttled
    scheduler.request(SyncType::Full, LibraryScope::All).await;
    sleep(Duration::from_secs(5)).await;
    assert_eq!(starts(&handler).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_remote_change_notification_is_debounced() {
    let handler = Arc::new(three_libraries());
    let (scheduler, _prompts) = scheduler(Arc::clone(&handler));

    scheduler.notify_remote_change(LibraryId::Group(2)).await;
    sleep(Duration::from_secs(1)).await;
    assert!(starts(&handler).is_empty());

    sleep(Duration::from_secs(3)).await;
    assert_eq!(starts(&handler), vec![SyncType::Normal]);
    assert!(synced(&handler, LibraryId::Group(2)));
    assert!(!synced(&handler, LibraryId::Group(1)));
}
