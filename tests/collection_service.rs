use cardsync::app::{CollectionService, SyncService};
use cardsync::notes::{NewNote, NoteUpdate};
use cardsync::schema::{NoteTypeDefinition, TemplateDefinition};
use cardsync::sync::{
    Direction, FullSyncStatus, Grave, GraveKind, ServerVerdict, SyncAuth, SyncCredentials,
    SyncMeta, SyncOrchestrator, SyncTransport,
};
use cardsync::{Collection, CollectionError, PendingChanges, SyncError, SyncStatus};

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::{TempDir, tempdir};

// In-memory stand-in for a sync server
#[derive(Default)]
struct FakeServer {
    required: i64,
    server_message: Option<String>,
    usn: i64,
    reject_login: bool,
    fail_upload: bool,
    refuse_changes: bool,
    download: Vec<u8>,
    pushed: RefCell<Vec<PendingChanges>>,
    uploaded: RefCell<Option<Vec<u8>>>,
    seen_meta: RefCell<Vec<SyncMeta>>,
}

impl SyncTransport for &FakeServer {
    fn login(&self, endpoint: &str, username: &str, _password: &str) -> Result<SyncAuth, SyncError> {
        if self.reject_login {
            return Err(SyncError::AuthenticationFailed);
        }
        Ok(SyncAuth {
            hkey: format!("key-for-{username}"),
            endpoint: endpoint.to_string(),
        })
    }

    fn meta(&self, _auth: &SyncAuth, local: &SyncMeta) -> Result<ServerVerdict, SyncError> {
        self.seen_meta.borrow_mut().push(local.clone());
        Ok(ServerVerdict {
            required: self.required,
            server_message: self.server_message.clone(),
            usn: self.usn,
        })
    }

    fn push_changes(&self, _auth: &SyncAuth, changes: &PendingChanges) -> Result<(), SyncError> {
        if self.refuse_changes {
            return Err(SyncError::Protocol("HTTP 409 Conflict: stale usn".to_string()));
        }
        self.pushed.borrow_mut().push(changes.clone());
        Ok(())
    }

    fn upload(&self, _auth: &SyncAuth, collection: Vec<u8>) -> Result<(), SyncError> {
        if self.fail_upload {
            return Err(SyncError::NetworkError("connection reset".to_string()));
        }
        *self.uploaded.borrow_mut() = Some(collection);
        Ok(())
    }

    fn download(&self, _auth: &SyncAuth) -> Result<Vec<u8>, SyncError> {
        Ok(self.download.clone())
    }
}

fn credentials() -> SyncCredentials {
    SyncCredentials {
        username: "learner".to_string(),
        password: "hunter2".to_string(),
        endpoint: "http://sync.invalid".to_string(),
    }
}

fn basic(fields: &[&str]) -> NoteTypeDefinition {
    NoteTypeDefinition {
        name: "Basic".to_string(),
        fields: fields.iter().map(ToString::to_string).collect(),
        css: None,
        templates: Some(vec![TemplateDefinition {
            name: "Card 1".to_string(),
            qfmt: "{{Front}}".to_string(),
            afmt: "{{Back}}".to_string(),
        }]),
    }
}

fn new_note(front: &str, back: &str, deck: &str) -> NewNote {
    NewNote {
        model_name: "Basic".to_string(),
        deck_name: deck.to_string(),
        fields: BTreeMap::from([
            ("Front".to_string(), front.to_string()),
            ("Back".to_string(), back.to_string()),
        ]),
        tags: vec!["spanish".to_string()],
    }
}

// A collection holding the Basic note type and one note
fn populated() -> (TempDir, CollectionService) {
    let dir = tempdir().unwrap();
    let service = CollectionService::new(dir.path().join("collection.db"));
    service.init().unwrap();
    service.ensure_model(&basic(&["Front", "Back"])).unwrap();
    service.add_note(&new_note("hola", "hello", "Spanish")).unwrap();
    (dir, service)
}

fn deck_names(service: &CollectionService) -> Vec<String> {
    service
        .list_decks()
        .unwrap()
        .into_iter()
        .map(|d| d.name)
        .collect()
}

fn staging_file(path: &Path) -> PathBuf {
    path.with_file_name("collection.db.download")
}

#[test]
fn schema_and_notes_round_trip_through_the_service() {
    let (_dir, service) = populated();

    let id = service.ensure_model(&basic(&["Front", "Back"])).unwrap();
    assert_eq!(service.ensure_model(&basic(&["Front", "Back", "Extra"])).unwrap(), id);

    let models = service.list_models().unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].fields, 3);
    assert_eq!(models[0].templates, 1);
    assert_eq!(models[0].notes, 1);

    let found = service.find_notes("hola").unwrap();
    assert_eq!(found.len(), 1);
    let note_id = found[0];

    service
        .update_note(&NoteUpdate {
            id: note_id,
            fields: BTreeMap::from([("Extra".to_string(), "greeting".to_string())]),
            tags: vec!["reviewed".to_string()],
            deck_name: Some("Spanish::Basics".to_string()),
        })
        .unwrap();

    let view = service.get_note(note_id).unwrap();
    assert_eq!(view.fields["Front"], "hola");
    assert_eq!(view.fields["Extra"], "greeting");
    assert_eq!(view.tags, ["reviewed"]);
    assert_eq!(view.deck_name.as_deref(), Some("Spanish::Basics"));
    assert_eq!(service.find_notes("deck:Spanish").unwrap(), [note_id]);

    service.delete_note(note_id).unwrap();
    assert!(service.find_notes("").unwrap().is_empty());
    assert!(matches!(
        service.get_note(note_id),
        Err(CollectionError::NoteNotFound(_))
    ));
}

#[test]
fn opening_a_missing_collection_fails() {
    let dir = tempdir().unwrap();
    let service = CollectionService::new(dir.path().join("nowhere.db"));
    assert!(matches!(
        service.list_decks(),
        Err(CollectionError::StorageUnavailable { .. })
    ));
}

#[test]
fn incremental_sync_records_the_server_usn() {
    let (_dir, service) = populated();
    let server = FakeServer {
        required: 1,
        server_message: Some("   ".to_string()),
        usn: 7,
        ..FakeServer::default()
    };
    let sync = SyncService::new(service.path(), &server);

    let outcome = sync.sync(&credentials()).unwrap();
    assert_eq!(outcome.status, SyncStatus::NormalSync);
    assert_eq!(outcome.server_message, None);

    let seen = server.seen_meta.borrow();
    assert_eq!(seen.len(), 1);
    assert!(!seen[0].empty);
    assert_eq!(seen[0].usn, 0);

    let col = Collection::open(service.path()).unwrap();
    assert_eq!(col.sync_meta().unwrap().usn, 7);
    col.close().unwrap();
}

fn pending_graves(service: &CollectionService) -> Vec<Grave> {
    let col = Collection::open(service.path()).unwrap();
    let graves = col.pending_changes().unwrap().graves;
    col.close().unwrap();
    graves
}

#[test]
fn normal_sync_sends_deletions_before_forgetting_them() {
    let (_dir, service) = populated();
    let note_id = service.find_notes("hola").unwrap()[0];
    service.delete_note(note_id).unwrap();
    let server = FakeServer {
        required: 1,
        usn: 4,
        ..FakeServer::default()
    };

    SyncService::new(service.path(), &server)
        .sync(&credentials())
        .unwrap();

    let pushed = server.pushed.borrow();
    assert_eq!(pushed.len(), 1);
    assert!(pushed[0].graves.contains(&Grave {
        oid: note_id,
        kind: GraveKind::Note
    }));
    assert!(pushed[0].graves.iter().any(|g| g.kind == GraveKind::Card));
    assert_eq!(pushed[0].notetypes.len(), 1);
    assert_eq!(pushed[0].decks.len(), 1);
    assert!(pending_graves(&service).is_empty());

    // Nothing left to send the second time round
    SyncService::new(service.path(), &server)
        .sync(&credentials())
        .unwrap();
    assert_eq!(server.pushed.borrow().len(), 1);
}

#[test]
fn refused_changes_stay_pending() {
    let (_dir, service) = populated();
    let note_id = service.find_notes("hola").unwrap()[0];
    service.delete_note(note_id).unwrap();
    let server = FakeServer {
        required: 1,
        usn: 4,
        refuse_changes: true,
        ..FakeServer::default()
    };

    let err = SyncService::new(service.path(), &server)
        .sync(&credentials())
        .unwrap_err();
    assert!(matches!(err, CollectionError::Sync(SyncError::Protocol(_))));

    assert!(pending_graves(&service).contains(&Grave {
        oid: note_id,
        kind: GraveKind::Note
    }));
    let col = Collection::open(service.path()).unwrap();
    assert_eq!(col.sync_meta().unwrap().usn, 0);
    col.close().unwrap();
}

#[test]
fn full_sync_verdicts_leave_the_collection_alone() {
    let (_dir, service) = populated();
    let server = FakeServer {
        required: 2,
        server_message: Some("Choose a direction".to_string()),
        usn: 9,
        ..FakeServer::default()
    };
    let sync = SyncService::new(service.path(), &server);

    let outcome = sync.sync(&credentials()).unwrap();
    assert_eq!(outcome.status, SyncStatus::FullSync);
    assert!(outcome.status.needs_direction());
    assert_eq!(outcome.server_message.as_deref(), Some("Choose a direction"));

    let col = Collection::open(service.path()).unwrap();
    assert_eq!(col.sync_meta().unwrap().usn, 0);
    assert!(!col.pending_changes().unwrap().is_empty());
    col.close().unwrap();
    assert!(server.pushed.borrow().is_empty());
}

#[test]
fn unknown_sync_codes_are_passed_through() {
    let (_dir, service) = populated();
    let server = FakeServer {
        required: 42,
        ..FakeServer::default()
    };
    let outcome = SyncService::new(service.path(), &server)
        .sync(&credentials())
        .unwrap();

    assert_eq!(outcome.status, SyncStatus::Unknown(42));
    assert_eq!(outcome.status.to_string(), "unknown_42");
    assert_eq!(
        serde_json::to_value(&outcome).unwrap()["status"],
        "unknown_42"
    );
}

#[test]
fn rejected_login_stops_before_anything_happens() {
    let (_dir, service) = populated();
    let server = FakeServer {
        reject_login: true,
        ..FakeServer::default()
    };
    let sync = SyncService::new(service.path(), &server);

    assert!(matches!(
        sync.login(&credentials()),
        Err(CollectionError::Sync(SyncError::AuthenticationFailed))
    ));
    assert!(matches!(
        sync.full_upload(&credentials()),
        Err(CollectionError::Sync(SyncError::AuthenticationFailed))
    ));
    assert!(server.uploaded.borrow().is_none());
    assert!(server.seen_meta.borrow().is_empty());
}

#[test]
fn login_returns_the_session() {
    let dir = tempdir().unwrap();
    let server = FakeServer::default();
    // No collection is needed to log in
    let sync = SyncService::new(dir.path().join("absent.db"), &server);

    let auth = sync.login(&credentials()).unwrap();
    assert_eq!(auth.hkey, "key-for-learner");
    assert_eq!(auth.endpoint, "http://sync.invalid");
}

#[test]
fn full_upload_sends_the_collection_file() {
    let (_dir, service) = populated();
    let server = FakeServer::default();

    let outcome = SyncService::new(service.path(), &server)
        .full_upload(&credentials())
        .unwrap();
    assert_eq!(outcome.status, FullSyncStatus::Uploaded);

    let uploaded = server.uploaded.borrow();
    let bytes = uploaded.as_deref().unwrap();
    assert!(bytes.starts_with(b"SQLite format 3\0"));
    assert_eq!(bytes, fs::read(service.path()).unwrap().as_slice());
}

#[test]
fn interrupted_upload_leaves_the_handle_usable() {
    let (_dir, service) = populated();
    let server = FakeServer {
        fail_upload: true,
        ..FakeServer::default()
    };
    let orchestrator = SyncOrchestrator::new(&server);

    let mut col = Collection::open(service.path()).unwrap();
    let err = orchestrator.full_upload(&mut col, &credentials()).unwrap_err();
    assert!(matches!(
        err,
        CollectionError::Sync(SyncError::FullSyncInterrupted {
            direction: Direction::Upload,
            ..
        })
    ));

    // Same handle, still connected
    assert_eq!(col.decks().unwrap().len(), 2);
    col.close().unwrap();
    assert_eq!(deck_names(&service), ["Default", "Spanish"]);
}

#[test]
fn full_download_replaces_the_local_collection() {
    let (_dir, service) = populated();

    let remote_dir = tempdir().unwrap();
    let remote = CollectionService::new(remote_dir.path().join("remote.db"));
    remote.init().unwrap();
    remote.ensure_deck("Remote").unwrap();
    let server = FakeServer {
        download: fs::read(remote.path()).unwrap(),
        ..FakeServer::default()
    };

    let outcome = SyncService::new(service.path(), &server)
        .full_download(&credentials())
        .unwrap();
    assert_eq!(outcome.status, FullSyncStatus::Downloaded);

    assert_eq!(deck_names(&service), ["Default", "Remote"]);
    assert!(service.find_notes("").unwrap().is_empty());
    assert!(!staging_file(service.path()).exists());
}

#[test]
fn unusable_download_keeps_the_local_collection() {
    let (_dir, service) = populated();
    let server = FakeServer {
        download: b"SQLite format 3\0 but not really".to_vec(),
        ..FakeServer::default()
    };

    let err = SyncService::new(service.path(), &server)
        .full_download(&credentials())
        .unwrap_err();
    assert!(matches!(
        err,
        CollectionError::Sync(SyncError::FullSyncInterrupted {
            direction: Direction::Download,
            ..
        })
    ));

    assert_eq!(deck_names(&service), ["Default", "Spanish"]);
    assert_eq!(service.find_notes("hola").unwrap().len(), 1);
    assert!(!staging_file(service.path()).exists());
}
