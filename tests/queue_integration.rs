//! Integration tests for the download queue
//!
//! Each test drives the public `DownloadQueue` API against a local
//! range-capable HTTP fixture server, covering the end-to-end properties:
//! completion, pause/resume byte accounting, the 200-fallback when a server
//! ignores Range, the concurrency bound, failure backfill, downgrade
//! propagation, inactivity timeout, duplicate suppression, cancel semantics
//! and restart recovery.

mod common;

use common::{
    mp3_body, test_config, wait_until, FixtureServer, RouteOptions, StaticEntry, StaticResolver,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

use melodown::storage::{Database, MemoryStateStore, SqliteStateStore, StateStore};
use melodown::{
    DownloadQueue, Progress, Quality, QueueEvent, Task, TaskStatus, TrackMeta,
};

fn track(resource_id: &str, title: &str) -> TrackMeta {
    TrackMeta {
        resource_id: resource_id.to_string(),
        title: title.to_string(),
        artist: "Fixture Band".to_string(),
        duration_secs: 180,
    }
}

fn entry(server: &FixtureServer, path: &str, size: u64) -> StaticEntry {
    StaticEntry {
        url: server.url(path),
        quality: Quality::High,
        size,
        downgraded: false,
    }
}

async fn open_queue(
    config: melodown::DownloadConfig,
    resolver: Arc<StaticResolver>,
) -> Arc<DownloadQueue> {
    DownloadQueue::builder(config, resolver, Arc::new(MemoryStateStore::new()))
        .open()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_basic_completion() {
    let dir = tempfile::tempdir().unwrap();
    let server = FixtureServer::start().await;
    let body = mp3_body(200_000);
    server.add_route("/song-a", body.clone(), RouteOptions::default());

    let resolver = Arc::new(StaticResolver::new());
    resolver.insert("song-a", entry(&server, "/song-a", body.len() as u64));

    let queue = open_queue(test_config(dir.path()), resolver).await;
    let id = queue
        .add_task(track("song-a", "First Song"), Quality::High)
        .await
        .unwrap();

    wait_until("completion", Duration::from_secs(10), || {
        queue
            .task(&id)
            .map(|t| t.status == TaskStatus::Completed)
            .unwrap_or(false)
    })
    .await;

    let task = queue.task(&id).unwrap();
    assert_eq!(task.total_bytes, body.len() as u64);
    assert!(task.completed_at.is_some());
    assert!(task.error.is_none());

    // Progress records do not outlive completion
    assert!(queue.progress(&id).is_none());

    // Sniffed as mp3 (ID3 header), named from the template
    let artifact = dir.path().join("music").join("Fixture Band - First Song.mp3");
    assert_eq!(std::fs::read(&artifact).unwrap(), body);

    // Staging file is gone
    assert!(!test_config(dir.path()).part_path(&id).exists());
}

#[tokio::test]
async fn test_pause_resume_resumes_with_range() {
    let dir = tempfile::tempdir().unwrap();
    let server = FixtureServer::start().await;
    let body = mp3_body(320_000);
    server.add_route(
        "/song-b",
        body.clone(),
        RouteOptions {
            chunk_delay: Duration::from_millis(25),
            ..Default::default()
        },
    );

    let resolver = Arc::new(StaticResolver::new());
    resolver.insert("song-b", entry(&server, "/song-b", body.len() as u64));

    let queue = open_queue(test_config(dir.path()), resolver).await;
    let id = queue
        .add_task(track("song-b", "Paused Song"), Quality::High)
        .await
        .unwrap();

    let midpoint = body.len() as u64 / 2;
    wait_until("mid-transfer progress", Duration::from_secs(10), || {
        let downloading = queue
            .task(&id)
            .map(|t| t.status == TaskStatus::Downloading)
            .unwrap_or(false);
        let bytes = queue.progress(&id).map(|p| p.bytes_loaded).unwrap_or(0);
        downloading && bytes > 0 && bytes < midpoint
    })
    .await;

    queue.pause_task(&id).await.unwrap();
    assert_eq!(queue.task(&id).unwrap().status, TaskStatus::Paused);

    // Let the aborted engine settle its final progress write
    tokio::time::sleep(Duration::from_millis(300)).await;
    let paused = queue.progress(&id).unwrap();
    assert!(paused.bytes_loaded > 0);
    assert!(paused.bytes_loaded < body.len() as u64);

    queue.resume_task(&id).await.unwrap();
    wait_until("completion after resume", Duration::from_secs(20), || {
        queue
            .task(&id)
            .map(|t| t.status == TaskStatus::Completed)
            .unwrap_or(false)
    })
    .await;

    // Resumed request asked for exactly the remaining bytes
    let requests = server.requests_for("/song-b");
    assert!(requests.len() >= 2, "expected a resume request");
    let resumed = requests.last().unwrap();
    assert_eq!(
        resumed.range.as_deref(),
        Some(format!("bytes={}-", paused.bytes_loaded).as_str())
    );

    // Byte-for-byte identical to a from-scratch download
    let artifact = dir.path().join("music").join("Fixture Band - Paused Song.mp3");
    assert_eq!(std::fs::read(&artifact).unwrap(), body);
}

#[tokio::test]
async fn test_fallback_when_server_ignores_range() {
    let dir = tempfile::tempdir().unwrap();
    let server = FixtureServer::start().await;
    let body = mp3_body(320_000);
    server.add_route(
        "/song-c",
        body.clone(),
        RouteOptions {
            support_range: false,
            chunk_delay: Duration::from_millis(25),
            ..Default::default()
        },
    );

    let resolver = Arc::new(StaticResolver::new());
    resolver.insert("song-c", entry(&server, "/song-c", body.len() as u64));

    let queue = open_queue(test_config(dir.path()), resolver).await;
    let id = queue
        .add_task(track("song-c", "Stubborn Song"), Quality::High)
        .await
        .unwrap();

    wait_until("mid-transfer progress", Duration::from_secs(10), || {
        let downloading = queue
            .task(&id)
            .map(|t| t.status == TaskStatus::Downloading)
            .unwrap_or(false);
        let bytes = queue.progress(&id).map(|p| p.bytes_loaded).unwrap_or(0);
        downloading && bytes > 0 && bytes < body.len() as u64 / 2
    })
    .await;

    queue.pause_task(&id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(queue.progress(&id).unwrap().bytes_loaded > 0);

    queue.resume_task(&id).await.unwrap();
    wait_until("completion after fallback", Duration::from_secs(20), || {
        queue
            .task(&id)
            .map(|t| t.status == TaskStatus::Completed)
            .unwrap_or(false)
    })
    .await;

    // The engine did ask for a range; the server refused with a 200 and the
    // transfer restarted from zero without corrupting the artifact.
    let requests = server.requests_for("/song-c");
    let asked_for_range = requests.iter().any(|r| r.range.is_some());
    assert!(asked_for_range, "resume should have sent a Range header");

    let artifact = dir
        .path()
        .join("music")
        .join("Fixture Band - Stubborn Song.mp3");
    assert_eq!(std::fs::read(&artifact).unwrap(), body);
}

#[tokio::test]
async fn test_concurrency_bound_holds() {
    let dir = tempfile::tempdir().unwrap();
    let server = FixtureServer::start().await;
    let body = mp3_body(120_000);
    server.add_route(
        "/shared",
        body.clone(),
        RouteOptions {
            chunk_delay: Duration::from_millis(15),
            ..Default::default()
        },
    );

    let resolver = Arc::new(StaticResolver::new());
    for i in 0..5 {
        resolver.insert(
            &format!("res-{i}"),
            entry(&server, "/shared", body.len() as u64),
        );
    }

    let config = test_config(dir.path()); // max_concurrent = 2
    let queue = open_queue(config, resolver).await;

    let mut ids = Vec::new();
    for i in 0..5 {
        let id = queue
            .add_task(track(&format!("res-{i}"), &format!("Track {i}")), Quality::High)
            .await
            .unwrap();
        ids.push(id);
    }

    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        assert!(
            queue.downloading_count() <= 2,
            "more than 2 tasks downloading at once"
        );
        let all_done = ids.iter().all(|id| {
            queue
                .task(id)
                .map(|t| t.status == TaskStatus::Completed)
                .unwrap_or(false)
        });
        if all_done {
            break;
        }
        assert!(Instant::now() < deadline, "queue did not drain in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(
        server.peak_concurrency() <= 2,
        "server saw {} concurrent bodies",
        server.peak_concurrency()
    );
}

#[tokio::test]
async fn test_failed_task_backfills_next() {
    let dir = tempfile::tempdir().unwrap();
    let server = FixtureServer::start().await;
    let body = mp3_body(64_000);
    server.add_route(
        "/forbidden",
        Vec::new(),
        RouteOptions {
            status: 403,
            ..Default::default()
        },
    );
    server.add_route("/fine", body.clone(), RouteOptions::default());

    let resolver = Arc::new(StaticResolver::new());
    resolver.insert("res-bad", entry(&server, "/forbidden", 0));
    resolver.insert("res-good", entry(&server, "/fine", body.len() as u64));

    let mut config = test_config(dir.path());
    config.max_concurrent = 1;
    let queue = open_queue(config, resolver).await;

    let bad = queue
        .add_task(track("res-bad", "Doomed"), Quality::High)
        .await
        .unwrap();
    let good = queue
        .add_task(track("res-good", "Survivor"), Quality::High)
        .await
        .unwrap();

    wait_until("first task failure", Duration::from_secs(10), || {
        queue
            .task(&bad)
            .map(|t| t.status == TaskStatus::Error)
            .unwrap_or(false)
    })
    .await;
    assert!(queue.task(&bad).unwrap().error.is_some());

    // The freed slot refills without outside intervention
    wait_until("backfilled completion", Duration::from_secs(10), || {
        queue
            .task(&good)
            .map(|t| t.status == TaskStatus::Completed)
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn test_quality_downgrade_event_precedes_transfer() {
    let dir = tempfile::tempdir().unwrap();
    let server = FixtureServer::start().await;
    let body = mp3_body(100_000);
    server.add_route("/song-d", body.clone(), RouteOptions::default());

    let resolver = Arc::new(StaticResolver::new());
    resolver.insert(
        "song-d",
        StaticEntry {
            url: server.url("/song-d"),
            quality: Quality::High, // server substitutes 320 for flac
            size: body.len() as u64,
            downgraded: true,
        },
    );

    let queue = open_queue(test_config(dir.path()), resolver).await;
    let mut events = queue.subscribe();

    let id = queue
        .add_task(track("song-d", "Entitled Song"), Quality::Lossless)
        .await
        .unwrap();

    let mut seen = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        assert!(!remaining.is_zero(), "never saw completion event");
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(event)) => {
                let done = matches!(
                    &event,
                    QueueEvent::StatusChanged {
                        status: TaskStatus::Completed,
                        ..
                    }
                );
                seen.push(event);
                if done {
                    break;
                }
            }
            _ => panic!("event channel closed or timed out"),
        }
    }

    let downgrade_at = seen
        .iter()
        .position(|e| matches!(e, QueueEvent::QualityDowngraded { .. }))
        .expect("no downgrade event fired");
    let first_progress_at = seen
        .iter()
        .position(|e| matches!(e, QueueEvent::ProgressUpdated { .. }))
        .expect("no progress event fired");
    assert!(
        downgrade_at < first_progress_at,
        "downgrade must be announced before bytes move"
    );

    let task = queue.task(&id).unwrap();
    assert_eq!(task.actual_quality, Some(Quality::High));
    assert!(task.was_downgraded);
}

#[tokio::test]
async fn test_inactivity_timeout_fails_task() {
    let dir = tempfile::tempdir().unwrap();
    let server = FixtureServer::start().await;
    let body = mp3_body(32_768); // 4 chunks of 8KB
    server.add_route(
        "/stall",
        body.clone(),
        RouteOptions {
            chunk_delay: Duration::from_secs(5),
            ..Default::default()
        },
    );

    let resolver = Arc::new(StaticResolver::new());
    resolver.insert("res-stall", entry(&server, "/stall", body.len() as u64));

    let mut config = test_config(dir.path());
    config.standard_inactivity_timeout = Duration::from_millis(800);
    let queue = open_queue(config, resolver).await;

    let id = queue
        .add_task(track("res-stall", "Stalled Song"), Quality::High)
        .await
        .unwrap();

    wait_until("timeout failure", Duration::from_secs(15), || {
        queue
            .task(&id)
            .map(|t| t.status == TaskStatus::Error)
            .unwrap_or(false)
    })
    .await;

    let task = queue.task(&id).unwrap();
    assert!(
        task.error.as_deref().unwrap_or("").contains("stalled"),
        "unexpected error: {:?}",
        task.error
    );
}

#[tokio::test]
async fn test_duplicate_add_then_rerun_after_completion() {
    let dir = tempfile::tempdir().unwrap();
    let server = FixtureServer::start().await;
    let body = mp3_body(96_000);
    server.add_route(
        "/song-e",
        body.clone(),
        RouteOptions {
            chunk_delay: Duration::from_millis(20),
            ..Default::default()
        },
    );

    let resolver = Arc::new(StaticResolver::new());
    resolver.insert("song-e", entry(&server, "/song-e", body.len() as u64));

    let queue = open_queue(test_config(dir.path()), resolver).await;
    let first = queue
        .add_task(track("song-e", "Encore"), Quality::High)
        .await
        .unwrap();
    let second = queue
        .add_task(track("song-e", "Encore"), Quality::High)
        .await
        .unwrap();

    // Same (resource, quality) while non-terminal: one task, same id
    assert_eq!(first, second);
    assert_eq!(queue.snapshot().len(), 1);

    wait_until("first completion", Duration::from_secs(10), || {
        queue
            .task(&first)
            .map(|t| t.status == TaskStatus::Completed)
            .unwrap_or(false)
    })
    .await;

    // Re-adding a completed task restarts it instead of duplicating
    let third = queue
        .add_task(track("song-e", "Encore"), Quality::High)
        .await
        .unwrap();
    assert_eq!(third, first);
    assert_eq!(queue.snapshot().len(), 1);

    wait_until("re-run completion", Duration::from_secs(10), || {
        queue
            .task(&first)
            .map(|t| t.status == TaskStatus::Completed && t.completed_at.is_some())
            .unwrap_or(false)
            && queue.progress(&first).is_none()
    })
    .await;

    // Both runs produced artifacts; the second avoided the collision
    let music = dir.path().join("music");
    assert!(music.join("Fixture Band - Encore.mp3").exists());
    assert!(music.join("Fixture Band - Encore (1).mp3").exists());
}

#[tokio::test]
async fn test_cancel_discards_partial_state() {
    let dir = tempfile::tempdir().unwrap();
    let server = FixtureServer::start().await;
    let body = mp3_body(320_000);
    server.add_route(
        "/song-f",
        body.clone(),
        RouteOptions {
            chunk_delay: Duration::from_millis(25),
            ..Default::default()
        },
    );

    let resolver = Arc::new(StaticResolver::new());
    resolver.insert("song-f", entry(&server, "/song-f", body.len() as u64));

    let config = test_config(dir.path());
    let queue = open_queue(config.clone(), resolver).await;
    let id = queue
        .add_task(track("song-f", "Abandoned Song"), Quality::High)
        .await
        .unwrap();

    wait_until("mid-transfer progress", Duration::from_secs(10), || {
        queue.progress(&id).map(|p| p.bytes_loaded > 0).unwrap_or(false)
    })
    .await;

    queue.cancel_task(&id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let task = queue.task(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Error);
    assert_eq!(task.error.as_deref(), Some("cancelled by user"));

    // Cancel forces a restart from byte zero: no progress, no staging file
    assert!(queue.progress(&id).is_none());
    assert!(!config.part_path(&id).exists());

    // Retry starts clean and completes
    queue.retry_task(&id).await.unwrap();
    wait_until("completion after retry", Duration::from_secs(20), || {
        queue
            .task(&id)
            .map(|t| t.status == TaskStatus::Completed)
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn test_recovery_resumes_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let server = FixtureServer::start().await;
    let body = mp3_body(300_000);
    server.add_route("/song-r", body.clone(), RouteOptions::default());

    let config = test_config(dir.path());

    // Seed the durable store the way a dead process would have left it:
    // a task frozen in `downloading` with a partial staging file.
    let database = Database::new(dir.path().join("queue.db")).await.unwrap();
    let state = Arc::new(SqliteStateStore::new(database.pool().clone()));

    let frozen_at: u64 = 120_000;
    let meta = track("song-r", "Recovered Song");
    let mut task = Task::new(&meta, Quality::High, 0);
    task.status = TaskStatus::Downloading;
    task.total_bytes = body.len() as u64;
    let task_id = task.id.clone();

    state.upsert_task(&task).await.unwrap();
    state
        .upsert_progress(&task_id, &Progress::new(frozen_at, body.len() as u64))
        .await
        .unwrap();

    std::fs::create_dir_all(&config.staging_directory).unwrap();
    std::fs::write(config.part_path(&task_id), &body[..frozen_at as usize]).unwrap();

    let resolver = Arc::new(StaticResolver::new());
    resolver.insert("song-r", entry(&server, "/song-r", body.len() as u64));

    let queue = DownloadQueue::builder(config.clone(), resolver, state)
        .open()
        .await
        .unwrap();

    // Recovery: zero downloading, the frozen task paused, progress intact
    assert_eq!(queue.downloading_count(), 0);
    let recovered = queue.task(&task_id).unwrap();
    assert_eq!(recovered.status, TaskStatus::Paused);
    assert!(recovered.error.is_none());
    assert_eq!(queue.progress(&task_id).unwrap().bytes_loaded, frozen_at);

    // Resume picks up exactly where the dead process stopped
    queue.resume_task(&task_id).await.unwrap();
    wait_until("completion after recovery", Duration::from_secs(15), || {
        queue
            .task(&task_id)
            .map(|t| t.status == TaskStatus::Completed)
            .unwrap_or(false)
    })
    .await;

    let requests = server.requests_for("/song-r");
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].range.as_deref(),
        Some(format!("bytes={frozen_at}-").as_str())
    );

    let artifact = dir
        .path()
        .join("music")
        .join("Fixture Band - Recovered Song.mp3");
    assert_eq!(std::fs::read(&artifact).unwrap(), body);
}
