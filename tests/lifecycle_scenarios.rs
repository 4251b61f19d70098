use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use upload_engine::events::ProgressReport;
use upload_engine::plugins::{MockUploader, MockUploaderOptions, ProcessorRef};
use upload_engine::state::UploadResponse;
use upload_engine::{
    EventKind, FileDescriptor, Phase, PhaseContext, UploadError, UploadEvent, Uploader,
    UploaderOptions,
};

fn counter(uploader: &Uploader, kind: EventKind) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    uploader.on(kind, move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    });
    count
}

/// Transfer that reports full progress and succeeds for every file
fn instant_transfer() -> ProcessorRef {
    Arc::new(|ctx: PhaseContext| async move {
        ctx.uploader.emit(UploadEvent::UploadStart {
            file_ids: ctx.file_ids.clone(),
        });
        for id in &ctx.file_ids {
            let size = ctx.uploader.get_file(id).and_then(|f| f.size).unwrap_or(0);
            ctx.uploader.emit(UploadEvent::UploadProgress {
                file_id: id.clone(),
                progress: ProgressReport {
                    bytes_uploaded: size,
                    bytes_total: Some(size),
                },
            });
            ctx.uploader.emit(UploadEvent::UploadSuccess {
                file_id: id.clone(),
                response: UploadResponse {
                    status: Some(200),
                    ..Default::default()
                },
            });
        }
        Ok::<(), UploadError>(())
    })
}

fn fast_mock(options: MockUploaderOptions) -> Arc<MockUploader> {
    Arc::new(MockUploader::new(MockUploaderOptions {
        step_delay: Duration::from_millis(2),
        ..options
    }))
}

#[tokio::test]
async fn single_file_upload_completes() {
    let uploader = Uploader::default();
    uploader.register_processor(Phase::Transfer, instant_transfer());
    let successes = counter(&uploader, EventKind::UploadSuccess);
    let completes = counter(&uploader, EventKind::Complete);

    let id = uploader
        .add_file(FileDescriptor::from_bytes("data.bin", vec![7u8; 1000]))
        .unwrap();
    let result = uploader.upload().await.unwrap();

    assert_eq!(successes.load(Ordering::SeqCst), 1);
    assert_eq!(completes.load(Ordering::SeqCst), 1);
    assert_eq!(result.successful.len(), 1);
    assert_eq!(result.successful[0].id, id);
    assert!(result.failed.is_empty());

    let state = uploader.get_state();
    assert_eq!(state.total_progress, 100);
    assert!(state.current_uploads.is_empty());
    assert_eq!(state.files[&id].progress.bytes_uploaded, Some(1000));
}

#[tokio::test]
async fn failed_upload_can_be_retried() {
    let uploader = Uploader::default();
    let mock = fast_mock(MockUploaderOptions {
        should_succeed: false,
        ..Default::default()
    });
    uploader.use_plugin(mock.clone()).unwrap();
    let errors = counter(&uploader, EventKind::UploadError);

    let id = uploader
        .add_file(FileDescriptor::from_bytes("a.txt", "hello"))
        .unwrap();
    let result = uploader.upload().await.unwrap();

    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert!(result.successful.is_empty());
    assert_eq!(result.failed.len(), 1);
    let failed = uploader.get_file(&id).unwrap();
    assert_eq!(failed.error.as_deref(), Some("Upload failed"));
    assert_eq!(failed.response.as_ref().and_then(|r| r.status), Some(500));
    assert_eq!(
        uploader.get_state().error.as_deref(),
        Some("Failed to upload a.txt Upload failed")
    );
    assert!(uploader.get_state().allow_new_upload);

    mock.set_should_succeed(true);
    let retried = uploader.retry_upload(&id).await.unwrap();
    assert_eq!(retried.successful.len(), 1);
    let file = uploader.get_file(&id).unwrap();
    assert!(file.error.is_none());
    assert!(file.progress.upload_complete);
}

#[tokio::test]
async fn upload_retries_errored_files_first() {
    let uploader = Uploader::default();
    let mock = fast_mock(MockUploaderOptions {
        should_succeed: false,
        ..Default::default()
    });
    uploader.use_plugin(mock.clone()).unwrap();
    uploader
        .add_file(FileDescriptor::from_bytes("a.txt", "hello"))
        .unwrap();
    uploader.upload().await.unwrap();

    let retries = counter(&uploader, EventKind::RetryAll);
    mock.set_should_succeed(true);
    let result = uploader.upload().await.unwrap();

    assert_eq!(retries.load(Ordering::SeqCst), 1);
    assert_eq!(result.successful.len(), 1);
    assert!(uploader.get_state().error.is_none());
}

#[tokio::test]
async fn pause_and_resume_mid_transfer() {
    let uploader = Uploader::default();
    uploader
        .use_plugin(Arc::new(MockUploader::new(MockUploaderOptions {
            step_delay: Duration::from_millis(20),
            resumable: true,
            ..Default::default()
        })))
        .unwrap();
    let toggles = Arc::new(Mutex::new(Vec::new()));
    let t = Arc::clone(&toggles);
    uploader.on(EventKind::UploadPause, move |event| {
        if let UploadEvent::UploadPause { is_paused, .. } = event {
            t.lock().unwrap().push(*is_paused);
        }
    });
    let successes = counter(&uploader, EventKind::UploadSuccess);

    let id = uploader
        .add_file(FileDescriptor::from_bytes("video.mp4", vec![0u8; 500]))
        .unwrap();
    let running = {
        let uploader = uploader.clone();
        tokio::spawn(async move { uploader.upload().await })
    };

    while uploader
        .get_file(&id)
        .is_some_and(|f| f.progress.upload_started.is_none())
    {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(!uploader.get_file(&id).unwrap().is_paused);
    assert_eq!(uploader.pause_resume(&id), Some(true));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(successes.load(Ordering::SeqCst), 0);
    assert!(uploader.get_file(&id).unwrap().is_paused);

    assert_eq!(uploader.pause_resume(&id), Some(false));
    let result = running.await.unwrap().unwrap();

    assert_eq!(*toggles.lock().unwrap(), vec![true, false]);
    assert_eq!(successes.load(Ordering::SeqCst), 1);
    assert_eq!(result.successful.len(), 1);
}

#[tokio::test]
async fn second_upload_without_new_files_is_empty() {
    let uploader = Uploader::default();
    uploader.register_processor(Phase::Transfer, instant_transfer());
    let uploads = counter(&uploader, EventKind::UploadSuccess);
    uploader
        .add_files(vec![
            FileDescriptor::from_bytes("a.txt", "a"),
            FileDescriptor::from_bytes("b.txt", "bb"),
        ])
        .unwrap();

    let first = uploader.upload().await.unwrap();
    let second = uploader.upload().await.unwrap();

    assert_eq!(first.successful.len(), 2);
    assert!(second.successful.is_empty());
    assert!(second.failed.is_empty());
    assert_eq!(uploads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn finished_batch_partitions_every_file() {
    let uploader = Uploader::default();
    uploader
        .use_plugin(fast_mock(MockUploaderOptions {
            fail_names: vec!["b.txt".into(), "d.txt".into()],
            ..Default::default()
        }))
        .unwrap();
    let ids = uploader
        .add_files(
            ["a.txt", "b.txt", "c.txt", "d.txt"]
                .into_iter()
                .map(|name| FileDescriptor::from_bytes(name, name.as_bytes().to_vec()))
                .collect(),
        )
        .unwrap();

    let result = uploader.upload().await.unwrap();

    assert_eq!(result.successful.len() + result.failed.len(), ids.len());
    assert_eq!(result.failed.len(), 2);
}

#[tokio::test]
async fn pipeline_runs_phases_in_order() {
    let uploader = Uploader::default();
    let order = Arc::new(Mutex::new(Vec::new()));
    for phase in [Phase::Post, Phase::Transfer, Phase::Pre] {
        let order = Arc::clone(&order);
        let processor: ProcessorRef = Arc::new(move |ctx: PhaseContext| {
            let order = Arc::clone(&order);
            async move {
                order.lock().unwrap().push(ctx.phase);
                Ok::<(), UploadError>(())
            }
        });
        uploader.register_processor(phase, processor);
    }
    uploader
        .add_file(FileDescriptor::from_bytes("a.txt", "a"))
        .unwrap();

    uploader.upload().await.unwrap();
    assert_eq!(
        *order.lock().unwrap(),
        vec![Phase::Pre, Phase::Transfer, Phase::Post]
    );
}

#[tokio::test]
async fn cancel_all_tears_down_running_batch() {
    let uploader = Uploader::default();
    uploader
        .use_plugin(Arc::new(MockUploader::new(MockUploaderOptions {
            step_delay: Duration::from_millis(50),
            ..Default::default()
        })))
        .unwrap();
    let successes = counter(&uploader, EventKind::UploadSuccess);
    let cancels = counter(&uploader, EventKind::CancelAll);
    uploader
        .add_file(FileDescriptor::from_bytes("a.txt", "abc"))
        .unwrap();

    let running = {
        let uploader = uploader.clone();
        tokio::spawn(async move { uploader.upload().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    uploader.cancel_all();

    let result = running.await.unwrap().unwrap();
    assert!(result.successful.is_empty());
    assert_eq!(successes.load(Ordering::SeqCst), 0);
    assert_eq!(cancels.load(Ordering::SeqCst), 1);

    let state = uploader.get_state();
    assert!(state.files.is_empty());
    assert!(state.current_uploads.is_empty());
    assert_eq!(state.total_progress, 0);
}

#[tokio::test]
async fn auto_proceed_uploads_added_files() {
    let uploader = Uploader::new(UploaderOptions {
        auto_proceed: true,
        ..Default::default()
    });
    uploader.register_processor(Phase::Transfer, instant_transfer());
    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = Mutex::new(Some(tx));
    uploader.on(EventKind::Complete, move |event| {
        if let (UploadEvent::Complete { result }, Some(tx)) = (event, tx.lock().unwrap().take()) {
            let _ = tx.send(result.successful.len());
        }
    });

    uploader
        .add_files(vec![
            FileDescriptor::from_bytes("a.txt", "a"),
            FileDescriptor::from_bytes("b.txt", "b"),
        ])
        .unwrap();

    let uploaded = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(uploaded, 2);
}

#[tokio::test]
async fn restored_batch_resumes_from_its_step() {
    let uploader = Uploader::default();
    let runs = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&runs);
    let pre: ProcessorRef = Arc::new(move |_ctx: PhaseContext| {
        r.fetch_add(1, Ordering::SeqCst);
        async { Ok::<(), UploadError>(()) }
    });
    uploader.register_processor(Phase::Pre, pre);
    uploader.register_processor(Phase::Transfer, instant_transfer());

    let id = uploader
        .add_file(FileDescriptor::from_bytes("a.txt", "abc"))
        .unwrap();
    let upload_id = uploader.create_batch(vec![id.clone()], false).unwrap();

    // Pretend the pre-processing step already ran before an interruption
    let mut uploads = uploader.get_state().current_uploads.clone();
    uploads[&upload_id].step = 1;
    uploader.set_state(upload_engine::StatePatch::new().current_uploads(uploads));

    let result = uploader.restore(&upload_id).await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(result.successful.len(), 1);
    assert!(uploader.get_state().current_uploads.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_uploads_never_share_a_file() {
    for _ in 0..50 {
        let uploader = Uploader::default();
        let slow: ProcessorRef = Arc::new(|ctx: PhaseContext| async move {
            ctx.uploader.emit(UploadEvent::UploadStart {
                file_ids: ctx.file_ids.clone(),
            });
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok::<(), UploadError>(())
        });
        uploader.register_processor(Phase::Transfer, slow);
        let claimed = Arc::new(Mutex::new(Vec::<String>::new()));
        let c = Arc::clone(&claimed);
        uploader.on(EventKind::Upload, move |event| {
            if let UploadEvent::Upload { file_ids, .. } = event {
                c.lock().unwrap().extend(file_ids.iter().cloned());
            }
        });
        uploader
            .add_files(vec![
                FileDescriptor::from_bytes("a.txt", "a"),
                FileDescriptor::from_bytes("b.txt", "b"),
            ])
            .unwrap();

        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let runs: Vec<_> = (0..2)
            .map(|_| {
                let uploader = uploader.clone();
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    uploader.upload().await
                })
            })
            .collect();
        for run in runs {
            run.await.unwrap().unwrap();
        }

        let mut claimed = claimed.lock().unwrap().clone();
        claimed.sort();
        let total = claimed.len();
        claimed.dedup();
        assert_eq!(claimed.len(), total);
        assert_eq!(total, 2);
    }
}
