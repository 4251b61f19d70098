use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use upload_engine::config::Hooks;
use upload_engine::files::FileAddDecision;
use upload_engine::restrictions::Restrictions;
use upload_engine::state::{Capabilities, FileMap, RecoveredState};
use upload_engine::{
    EventKind, FileDescriptor, FileRecord, RestrictionKind, UploadError, UploadEvent, Uploader,
    UploaderOptions,
};

fn with_restrictions(restrictions: Restrictions) -> Uploader {
    Uploader::new(UploaderOptions {
        restrictions,
        ..Default::default()
    })
}

#[test]
fn aggregate_violation_admits_nothing() {
    let uploader = with_restrictions(Restrictions {
        max_number_of_files: Some(1),
        ..Default::default()
    });
    let failures = Arc::new(AtomicUsize::new(0));
    let f = Arc::clone(&failures);
    uploader.on(EventKind::RestrictionFailed, move |event| {
        if let UploadEvent::RestrictionFailed { error, .. } = event {
            assert_eq!(error.kind, RestrictionKind::MaxNumberOfFiles);
        }
        f.fetch_add(1, Ordering::SeqCst);
    });
    let before = uploader.get_state();

    let ids = uploader
        .add_files(vec![
            FileDescriptor::from_bytes("a.txt", "a"),
            FileDescriptor::from_bytes("b.txt", "b"),
        ])
        .unwrap();

    assert!(ids.is_empty());
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    let after = uploader.get_state();
    assert_eq!(after.files, before.files);
    assert!(after.files.is_empty());
}

#[test]
fn duplicate_file_is_rejected() {
    let uploader = Uploader::default();
    uploader
        .add_file(FileDescriptor::from_bytes("a.txt", "a"))
        .unwrap();

    let err = uploader
        .add_file(FileDescriptor::from_bytes("a.txt", "a"))
        .unwrap_err();
    let restriction = err.restriction().unwrap();
    assert_eq!(restriction.kind, RestrictionKind::Duplicate);
    assert_eq!(
        restriction.message,
        "Cannot add the duplicate file 'a.txt', it already exists"
    );
    assert_eq!(uploader.get_files().len(), 1);
}

#[test]
fn per_file_failures_only_drop_that_file() {
    let uploader = with_restrictions(Restrictions {
        max_file_size: Some(4),
        ..Default::default()
    });

    let ids = uploader
        .add_files(vec![
            FileDescriptor::from_bytes("small.txt", "abc"),
            FileDescriptor::from_bytes("big.txt", "abcdefgh"),
        ])
        .unwrap();

    assert_eq!(ids.len(), 1);
    assert_eq!(uploader.get_file(&ids[0]).unwrap().name, "small.txt");
    assert_eq!(uploader.get_state().info.len(), 1);
    assert!(uploader.get_state().info[0]
        .message
        .starts_with("big.txt exceeds maximum allowed size"));
}

#[test]
fn veto_hook_is_silent() {
    let uploader = Uploader::with_hooks(
        UploaderOptions::default(),
        Hooks {
            on_before_file_added: Some(Arc::new(|file: &FileRecord, _files: &FileMap| {
                if file.name.ends_with(".exe") {
                    FileAddDecision::Veto
                } else {
                    FileAddDecision::Allow
                }
            })),
            ..Default::default()
        },
    );

    let ids = uploader
        .add_files(vec![
            FileDescriptor::from_bytes("setup.exe", "MZ"),
            FileDescriptor::from_bytes("notes.txt", "hi"),
        ])
        .unwrap();

    assert_eq!(ids.len(), 1);
    assert!(uploader.get_state().info.is_empty());
}

#[test]
fn readding_ghost_keeps_its_id() {
    let uploader = Uploader::default();
    let descriptor = FileDescriptor::from_bytes("photo.jpg", vec![1u8; 32]);
    let id = uploader.add_file(descriptor.clone()).unwrap();

    let mut ghost = uploader.get_file(&id).unwrap();
    ghost.data = None;
    uploader.cancel_all();
    let mut snapshot = RecoveredState::default();
    snapshot.files.insert(id.clone(), ghost);
    uploader.restore_state(snapshot, serde_json::Value::Null);
    assert!(uploader.get_file(&id).unwrap().is_ghost);

    let readded = uploader.add_file(descriptor).unwrap();
    assert_eq!(readded, id);
    let file = uploader.get_file(&id).unwrap();
    assert!(!file.is_ghost);
    assert!(file.data.is_some());
    assert_eq!(uploader.get_files().len(), 1);
}

#[test]
fn removing_whole_batch_drops_it() {
    let uploader = Uploader::default();
    let ids = uploader
        .add_files(vec![
            FileDescriptor::from_bytes("a.txt", "a"),
            FileDescriptor::from_bytes("b.txt", "b"),
        ])
        .unwrap();
    uploader.create_batch(ids.clone(), false).unwrap();

    uploader.remove_files(&ids).unwrap();
    assert!(uploader.get_state().current_uploads.is_empty());
}

#[test]
fn partial_removal_needs_individual_cancellation() {
    let uploader = Uploader::default();
    uploader.set_capabilities(Capabilities {
        individual_cancellation: false,
        ..Default::default()
    });
    let ids = uploader
        .add_files(vec![
            FileDescriptor::from_bytes("a.txt", "a"),
            FileDescriptor::from_bytes("b.txt", "b"),
        ])
        .unwrap();
    uploader.create_batch(ids.clone(), false).unwrap();
    let before = uploader.get_state();

    let err = uploader.remove_file(&ids[0]).unwrap_err();
    assert!(matches!(err, UploadError::Policy(_)));
    assert_eq!(uploader.get_state().files, before.files);
    assert_eq!(
        uploader.get_state().current_uploads,
        before.current_uploads
    );

    // Removing every file of the batch is still allowed
    uploader.remove_files(&ids).unwrap();
    assert!(uploader.get_files().is_empty());
}

#[tokio::test]
async fn min_files_blocks_upload() {
    let uploader = with_restrictions(Restrictions {
        min_number_of_files: Some(2),
        ..Default::default()
    });
    uploader
        .add_file(FileDescriptor::from_bytes("a.txt", "a"))
        .unwrap();

    let err = uploader.upload().await.unwrap_err();
    assert_eq!(err.to_string(), "You have to select at least 2 files");
    assert!(uploader.get_state().current_uploads.is_empty());
}

#[test]
fn adding_blocked_when_new_uploads_disallowed() {
    let uploader = Uploader::new(UploaderOptions {
        allow_multiple_upload_batches: false,
        ..Default::default()
    });
    let id = uploader
        .add_file(FileDescriptor::from_bytes("a.txt", "a"))
        .unwrap();
    uploader.create_batch(vec![id], false).unwrap();

    let err = uploader
        .add_file(FileDescriptor::from_bytes("b.txt", "b"))
        .unwrap_err();
    assert_eq!(err.to_string(), "Cannot add more files");
}
