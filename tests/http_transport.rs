use std::{
    fs,
    io::{Read, Write},
    net::TcpListener,
    path::Path,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use model_depot::{
    models::{
        DownloadError, DownloadFinished, DownloadManager, DownloadProgress, DownloadRequest,
        DownloadState, FinishOutcome, HttpConfig, KnownModel, ManagerConfig, ModelCatalog,
    },
    storage::{CacheConfig, FileStatCache, TransferError},
};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tempfile::tempdir;
use tokio::runtime::Runtime;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn serve(runtime: &Runtime, route: &str, response: ResponseTemplate) -> MockServer {
    runtime.block_on(async {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(response)
            .mount(&server)
            .await;
        server
    })
}

/// First request answers after `delay`, later ones at once.
fn serve_slow_then_fast(runtime: &Runtime, route: &str, payload: &[u8], delay: Duration) -> MockServer {
    runtime.block_on(async {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(payload.to_vec())
                    .set_delay(delay),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.to_vec()))
            .mount(&server)
            .await;
        server
    })
}

/// Answers one request with a body ended by closing the connection.
fn serve_without_length(payload: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut request = Vec::new();
        let mut byte = [0u8; 1];
        while !request.ends_with(b"\r\n\r\n") {
            if stream.read(&mut byte).unwrap() == 0 {
                break;
            }
            request.push(byte[0]);
        }
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n")
            .unwrap();
        stream.write_all(&payload).unwrap();
    });
    format!("http://{addr}")
}

fn manager(models_dir: &Path, model: KnownModel) -> DownloadManager {
    let mut catalog = ModelCatalog::empty();
    catalog.register(model);
    DownloadManager::with_http(
        ManagerConfig::new(models_dir),
        catalog,
        HttpConfig::default(),
        Arc::new(FileStatCache::new(CacheConfig::default())),
    )
}

fn wait_finished(manager: &mut DownloadManager) -> DownloadFinished {
    for _ in 0..300 {
        if let Some(done) = manager.wait_for_events(Duration::from_millis(100)).pop() {
            return done;
        }
    }
    panic!("download did not finish in time");
}

fn pump_until(manager: &mut DownloadManager, mut done: impl FnMut(&DownloadManager) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done(&*manager) {
        assert!(Instant::now() < deadline, "condition not reached in time");
        let finished = manager.wait_for_events(Duration::from_millis(50));
        assert!(finished.is_empty(), "unexpected finish {finished:?}");
    }
}

#[test]
fn downloads_and_finalizes_from_http() {
    let runtime = Runtime::new().unwrap();
    let payload = body(3 * 1024 * 1024 + 17);
    let server = serve(
        &runtime,
        "/models/tiny.bin",
        ResponseTemplate::new(200).set_body_bytes(payload.clone()),
    );

    let dir = tempdir().unwrap();
    let models_dir = dir.path().join("models");
    let checksum = format!("{:x}", Sha256::digest(&payload));
    let mut manager = manager(
        &models_dir,
        KnownModel {
            size_bytes: Some(payload.len() as u64),
            checksum: Some(checksum),
            ..KnownModel::new("tiny.bin", format!("{}/models/tiny.bin", server.uri()))
        },
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let id = manager
        .start(
            DownloadRequest::model("tiny.bin")
                .on_progress(move |progress: &DownloadProgress| sink.lock().push(progress.percentage())),
        )
        .unwrap();

    let done = wait_finished(&mut manager);
    assert_eq!(done.id, id);
    let final_path = models_dir.join("tiny.bin");
    match done.outcome {
        FinishOutcome::Completed { path, size } => {
            assert_eq!(path, final_path);
            assert_eq!(size, payload.len() as u64);
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    assert_eq!(fs::read(&final_path).unwrap(), payload);
    assert!(!models_dir.join("tiny.bin.temp").exists());
    assert!(manager.active_downloads().is_empty());
    assert!(manager.cache().exists(&final_path));

    let seen = seen.lock().clone();
    assert_eq!(seen.last().copied(), Some(100.0));
    assert_eq!(seen.iter().filter(|pct| **pct == 100.0).count(), 1);
    assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]), "{seen:?}");
}

#[test]
fn http_error_status_fails_without_files() {
    let runtime = Runtime::new().unwrap();
    let server = serve(&runtime, "/models/gone.bin", ResponseTemplate::new(404));

    let dir = tempdir().unwrap();
    let models_dir = dir.path().join("models");
    let mut manager = manager(
        &models_dir,
        KnownModel::new("gone.bin", format!("{}/models/gone.bin", server.uri())),
    );
    manager.start(DownloadRequest::model("gone.bin")).unwrap();

    let done = wait_finished(&mut manager);
    assert!(matches!(
        done.outcome,
        FinishOutcome::Failed {
            error: DownloadError::NetworkFailure(_)
        }
    ));
    assert!(!models_dir.join("gone.bin").exists());
    assert!(!models_dir.join("gone.bin.temp").exists());
}

#[test]
fn checksum_mismatch_discards_download() {
    let runtime = Runtime::new().unwrap();
    let payload = body(64 * 1024);
    let server = serve(
        &runtime,
        "/models/bad.bin",
        ResponseTemplate::new(200).set_body_bytes(payload),
    );

    let dir = tempdir().unwrap();
    let models_dir = dir.path().join("models");
    let mut manager = manager(
        &models_dir,
        KnownModel {
            checksum: Some("00".repeat(32)),
            ..KnownModel::new("bad.bin", format!("{}/models/bad.bin", server.uri()))
        },
    );
    manager.start(DownloadRequest::model("bad.bin")).unwrap();

    let done = wait_finished(&mut manager);
    assert!(matches!(
        done.outcome,
        FinishOutcome::Failed {
            error: DownloadError::Finalize(TransferError::ChecksumMismatch { .. })
        }
    ));
    assert!(!models_dir.join("bad.bin").exists());
    assert!(!models_dir.join("bad.bin.temp").exists());
}

#[test]
fn cancel_stops_the_worker_and_leaves_no_files() {
    let runtime = Runtime::new().unwrap();
    let payload = body(512 * 1024);
    let server = serve_slow_then_fast(
        &runtime,
        "/models/c.bin",
        &payload,
        Duration::from_millis(500),
    );

    let dir = tempdir().unwrap();
    let models_dir = dir.path().join("models");
    let mut manager = manager(
        &models_dir,
        KnownModel::new("c.bin", format!("{}/models/c.bin", server.uri())),
    );
    let id = manager.start(DownloadRequest::model("c.bin")).unwrap();
    assert!(manager.cancel(id));
    assert!(manager.active_downloads().is_empty());

    pump_until(&mut manager, |manager| !manager.is_reserved("c.bin"));
    assert!(!models_dir.join("c.bin").exists());
    assert!(!models_dir.join("c.bin.temp").exists());
}

#[test]
fn restart_after_cancel_is_not_disturbed_by_the_old_worker() {
    let runtime = Runtime::new().unwrap();
    let payload = body(1024 * 1024 + 5);
    let server = serve_slow_then_fast(&runtime, "/models/m.bin", &payload, Duration::from_secs(1));

    let dir = tempdir().unwrap();
    let models_dir = dir.path().join("models");
    let mut manager = manager(
        &models_dir,
        KnownModel::new("m.bin", format!("{}/models/m.bin", server.uri())),
    );

    let first = manager.start(DownloadRequest::model("m.bin")).unwrap();
    assert!(manager.cancel(first));
    assert!(matches!(
        manager.start(DownloadRequest::model("m.bin")),
        Err(DownloadError::AlreadyActive(_))
    ));

    pump_until(&mut manager, |manager| !manager.is_reserved("m.bin"));
    let second = manager.start(DownloadRequest::model("m.bin")).unwrap();

    let done = wait_finished(&mut manager);
    assert_eq!(done.id, second);
    assert!(
        matches!(done.outcome, FinishOutcome::Completed { size, .. } if size == payload.len() as u64),
        "{:?}",
        done.outcome
    );
    assert_eq!(fs::read(models_dir.join("m.bin")).unwrap(), payload);
    assert!(!models_dir.join("m.bin.temp").exists());
}

#[test]
fn pause_parks_the_worker_and_resume_finishes_under_the_same_id() {
    let runtime = Runtime::new().unwrap();
    let payload = body(256 * 1024 + 9);
    let server = serve_slow_then_fast(
        &runtime,
        "/models/p.bin",
        &payload,
        Duration::from_millis(300),
    );

    let dir = tempdir().unwrap();
    let models_dir = dir.path().join("models");
    let temp = models_dir.join("p.bin.temp");
    let mut manager = manager(
        &models_dir,
        KnownModel::new("p.bin", format!("{}/models/p.bin", server.uri())),
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let id = manager
        .start(
            DownloadRequest::model("p.bin")
                .on_progress(move |progress: &DownloadProgress| sink.lock().push(progress.percentage())),
        )
        .unwrap();
    manager.pause(id).unwrap();

    // the worker opens the temp file, then stops at its first checkpoint
    pump_until(&mut manager, |_| temp.exists());
    thread::sleep(Duration::from_millis(200));
    assert!(manager.wait_for_events(Duration::from_millis(100)).is_empty());
    assert_eq!(manager.get(id).unwrap().state, DownloadState::Paused);
    assert!(!models_dir.join("p.bin").exists());

    manager.resume(id).unwrap();
    let done = wait_finished(&mut manager);
    assert_eq!(done.id, id);
    assert!(matches!(done.outcome, FinishOutcome::Completed { .. }));
    assert_eq!(fs::read(models_dir.join("p.bin")).unwrap(), payload);
    assert!(!temp.exists());
    assert_eq!(seen.lock().iter().filter(|pct| **pct == 100.0).count(), 1);
}

#[test]
fn cancel_while_paused_removes_the_partial_file() {
    let runtime = Runtime::new().unwrap();
    let payload = body(64 * 1024);
    let server = serve_slow_then_fast(
        &runtime,
        "/models/q.bin",
        &payload,
        Duration::from_millis(200),
    );

    let dir = tempdir().unwrap();
    let models_dir = dir.path().join("models");
    let temp = models_dir.join("q.bin.temp");
    let mut manager = manager(
        &models_dir,
        KnownModel::new("q.bin", format!("{}/models/q.bin", server.uri())),
    );

    let id = manager.start(DownloadRequest::model("q.bin")).unwrap();
    manager.pause(id).unwrap();
    pump_until(&mut manager, |_| temp.exists());
    thread::sleep(Duration::from_millis(100));

    assert!(manager.cancel(id));
    pump_until(&mut manager, |manager| !manager.is_reserved("q.bin"));
    assert!(!temp.exists());
    assert!(!models_dir.join("q.bin").exists());
}

#[test]
fn body_without_length_is_not_held_to_the_size_label() {
    let payload = body(999_000);
    let base = serve_without_length(payload.clone());

    let dir = tempdir().unwrap();
    let models_dir = dir.path().join("models");
    let mut manager = manager(
        &models_dir,
        KnownModel {
            size_label: Some("1 MB".into()),
            ..KnownModel::new("chunked.bin", format!("{base}/models/chunked.bin"))
        },
    );
    let id = manager.start(DownloadRequest::model("chunked.bin")).unwrap();

    let done = wait_finished(&mut manager);
    assert_eq!(done.id, id);
    match done.outcome {
        FinishOutcome::Completed { size, .. } => assert_eq!(size, payload.len() as u64),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(fs::read(models_dir.join("chunked.bin")).unwrap(), payload);
}

#[test]
fn body_without_length_short_of_exact_size_fails() {
    let payload = body(4096);
    let base = serve_without_length(payload);

    let dir = tempdir().unwrap();
    let models_dir = dir.path().join("models");
    let mut manager = manager(
        &models_dir,
        KnownModel {
            size_bytes: Some(8192),
            ..KnownModel::new("short.bin", format!("{base}/models/short.bin"))
        },
    );
    manager.start(DownloadRequest::model("short.bin")).unwrap();

    let done = wait_finished(&mut manager);
    assert!(matches!(
        done.outcome,
        FinishOutcome::Failed {
            error: DownloadError::NetworkFailure(_)
        }
    ));
    assert!(!models_dir.join("short.bin").exists());
    assert!(!models_dir.join("short.bin.temp").exists());
}
