use std::sync::Arc;

use lockbox::entry::encrypt_entry;
use lockbox::envelope::{open_envelope, EnvelopeBytes};
use lockbox::keys::derive_capability;
use lockbox::sync::spawn;
use lockbox::{
    AuditAction, AuditLog, EntryKey, ExposeSecret, KeyValueStore, Masterkey, MemoryRemote, MemoryStore, SecretEntry,
    SecretString, VaultConfig, VaultError, VaultHandle,
};

const USER: &str = "alice";

fn password() -> SecretString {
    SecretString::from("hunter2".to_string())
}

fn secret(s: &str) -> SecretString {
    SecretString::from(s.to_string())
}

fn example_key() -> EntryKey {
    EntryKey::new("example.com", "alice")
}

fn start(remote: &Arc<MemoryRemote>, store: &Arc<MemoryStore>) -> VaultHandle {
    spawn(VaultConfig::insecure_fast(), remote.clone(), store.clone()).unwrap()
}

async fn reveal(handle: &VaultHandle, key: EntryKey) -> String {
    handle
        .reveal_secret(key, AuditAction::Decrypt)
        .await
        .unwrap()
        .done()
        .expect("capability loaded")
        .expose_secret()
        .to_string()
}

/// Fresh device with one secret already stored under "correct-horse".
async fn seeded() -> (Arc<MemoryRemote>, Arc<MemoryStore>) {
    let remote = Arc::new(MemoryRemote::new());
    let store = Arc::new(MemoryStore::new());
    let handle = start(&remote, &store);
    handle.login(USER, password(), Masterkey::from("correct-horse")).await.unwrap();
    assert!(handle.add_secret("example.com", "alice", secret("p@ss!")).await.unwrap().is_done());
    handle.logout().await.unwrap();
    (remote, store)
}

#[tokio::test]
async fn test_add_reveal_rotate() {
    // 1. Sign in and store one secret.
    let remote = Arc::new(MemoryRemote::new());
    let store = Arc::new(MemoryStore::new());
    let handle = start(&remote, &store);
    handle.login(USER, password(), Masterkey::from("correct-horse")).await.unwrap();

    let added = handle.add_secret("example.com", "alice", secret("p@ss!")).await.unwrap();
    assert!(added.is_done());
    assert_eq!(handle.state().entries().len(), 1);
    assert_eq!(handle.state().audit()[0].action, AuditAction::Add);

    // 2. The server only ever sees ciphertext.
    let file_id = handle.state().entries()[0].archive_file_id.clone();
    let blob = remote.raw_blob(USER, &file_id).unwrap();
    assert!(!blob.windows(5).any(|w| w == b"p@ss!"));

    // 3. Reveal, then check the audit window after the next command.
    assert_eq!(reveal(&handle, example_key()).await, "p@ss!");
    handle.refresh().await.unwrap();
    assert_eq!(handle.state().audit()[0].action, AuditAction::Decrypt);
    assert_eq!(handle.state().audit().len(), 1);

    // 4. Rotate to a new Masterkey; the secret still opens.
    let report = handle
        .rotate_masterkey(Masterkey::from("correct-horse"), Masterkey::from("new-horse"))
        .await
        .unwrap();
    assert_eq!(report.reencrypted, 1);
    assert!(report.envelope_persisted);
    assert!(report.archive_refreshed);
    assert_eq!(reveal(&handle, example_key()).await, "p@ss!");

    // 5. The old Masterkey is no longer the current one.
    let stale = handle
        .rotate_masterkey(Masterkey::from("wrong-horse"), Masterkey::from("newer-horse"))
        .await;
    assert!(matches!(stale, Err(VaultError::InvalidOldMasterkey)));
    let stale = handle
        .rotate_masterkey(Masterkey::from("correct-horse"), Masterkey::from("newer-horse"))
        .await;
    assert!(matches!(stale, Err(VaultError::InvalidOldMasterkey)));
    assert_eq!(reveal(&handle, example_key()).await, "p@ss!");
}

#[tokio::test]
async fn test_restore_from_envelope() {
    let (remote, store) = seeded().await;

    let handle = start(&remote, &store);
    let restored = handle.restore_session(USER, password()).await.unwrap();

    assert!(restored);
    assert_eq!(reveal(&handle, example_key()).await, "p@ss!");
}

#[tokio::test]
async fn test_restore_with_wrong_password_fails_integrity() {
    let (remote, store) = seeded().await;

    let handle = start(&remote, &store);
    let result = handle.restore_session(USER, secret("not-my-password")).await;

    assert!(matches!(result, Err(VaultError::Integrity)));
    assert_eq!(handle.state().user_id(), None);
}

#[tokio::test]
async fn test_recovery_prompts_once_and_retries() {
    // 1. Same account, new device: no Envelope here.
    let (remote, _) = seeded().await;
    let store = Arc::new(MemoryStore::new());
    let handle = start(&remote, &store);
    assert!(!handle.restore_session(USER, password()).await.unwrap());
    assert!(!handle.state().has_capability());

    // 2. Reveal needs the Masterkey; a wrong one fails for good.
    let pending = handle.reveal_secret(example_key(), AuditAction::Copy).await.unwrap();
    let recovery = pending.into_recovery().expect("masterkey requested");
    let wrong = recovery.resume(Masterkey::from("wrong-horse")).await;
    assert!(matches!(wrong, Err(VaultError::Decryption)));
    assert!(!handle.state().has_capability());

    // 3. A new attempt with the right Masterkey completes the reveal.
    let pending = handle.reveal_secret(example_key(), AuditAction::Copy).await.unwrap();
    let revealed = pending
        .into_recovery()
        .expect("masterkey requested")
        .resume(Masterkey::from("correct-horse"))
        .await
        .unwrap();
    assert_eq!(revealed.expose_secret(), "p@ss!");
    assert!(handle.state().has_capability());

    // 4. Recovery reseals an Envelope for this device.
    let envelope_key = lockbox::store::envelope_key("default", USER);
    assert!(store.get(&envelope_key).unwrap().is_some());
}

#[tokio::test]
async fn test_add_resumes_after_recovery() {
    let (remote, _) = seeded().await;
    let store = Arc::new(MemoryStore::new());
    let handle = start(&remote, &store);
    handle.restore_session(USER, password()).await.unwrap();

    let pending = handle.add_secret("b.org", "bob", secret("s3cret")).await.unwrap();
    assert!(!pending.is_done());
    pending
        .into_recovery()
        .unwrap()
        .resume(Masterkey::from("correct-horse"))
        .await
        .unwrap();

    assert_eq!(handle.state().entries().len(), 2);
    assert_eq!(reveal(&handle, EntryKey::new("b.org", "bob")).await, "s3cret");
}

#[tokio::test]
async fn test_login_with_wrong_masterkey_is_rejected() {
    let (remote, store) = seeded().await;

    let handle = start(&remote, &store);
    let result = handle.login(USER, password(), Masterkey::from("wrong-horse")).await;

    assert!(matches!(result, Err(VaultError::Decryption)));
    assert!(!handle.state().has_capability());
}

#[tokio::test]
async fn test_update_and_delete() {
    let (remote, store) = seeded().await;
    let handle = start(&remote, &store);
    handle.restore_session(USER, password()).await.unwrap();
    let old_file = handle.state().entries()[0].archive_file_id.clone();

    // 1. Duplicate add and unknown update are refused.
    let dup = handle.add_secret("example.com", "alice", secret("other")).await;
    assert!(matches!(dup, Err(VaultError::DuplicateEntry { .. })));
    let unknown = handle.update_secret("nowhere.io", "alice", secret("x")).await;
    assert!(matches!(unknown, Err(VaultError::UnknownEntry { .. })));

    // 2. Update replaces the blob.
    let updated = handle.update_secret("example.com", "alice", secret("n3w-p@ss")).await.unwrap();
    assert!(updated.is_done());
    assert_ne!(handle.state().entries()[0].archive_file_id, old_file);
    assert_eq!(remote.raw_blob(USER, &old_file), None);
    assert_eq!(reveal(&handle, example_key()).await, "n3w-p@ss");

    // 3. Delete removes the entry and its audit history.
    handle.delete_secret("example.com", "alice").await.unwrap();
    let state = handle.state();
    assert!(state.entries().is_empty());
    assert!(state.audit().iter().all(|e| !e.is_for(&example_key())));
    let gone = handle.delete_secret("example.com", "alice").await;
    assert!(matches!(gone, Err(VaultError::UnknownEntry { .. })));
}

#[tokio::test]
async fn test_failed_write_changes_nothing() {
    let (remote, store) = seeded().await;
    let handle = start(&remote, &store);
    handle.restore_session(USER, password()).await.unwrap();
    let before = handle.state().generation();

    remote.set_fail_writes(true);
    let result = handle.add_secret("b.org", "bob", secret("s3cret")).await;
    remote.set_fail_writes(false);

    let err = result.unwrap_err();
    assert!(matches!(err, VaultError::Remote(_)));
    assert_eq!(err.class(), lockbox::FailureClass::Retry);
    assert_eq!(handle.state().generation(), before);
    assert_eq!(handle.state().entries().len(), 1);
}

#[tokio::test]
async fn test_logout_persists_audit_and_clears_secrets() {
    let (remote, store) = seeded().await;
    let handle = start(&remote, &store);
    handle.restore_session(USER, password()).await.unwrap();
    reveal(&handle, example_key()).await;

    handle.logout().await.unwrap();

    let state = handle.state();
    assert_eq!(state.user_id(), None);
    assert!(!state.has_capability());
    assert!(state.entries().is_empty());

    // Add from the seeding session, then this reveal.
    let log = AuditLog::load(&*store, USER, 500).unwrap();
    let actions: Vec<_> = log.iter().map(|e| e.action).collect();
    assert_eq!(actions, [AuditAction::Add, AuditAction::Decrypt]);

    // Signed-out operations are refused.
    let result = handle.reveal_secret(example_key(), AuditAction::Decrypt).await;
    assert!(matches!(result, Err(VaultError::NoSession)));
    assert!(matches!(handle.logout().await, Err(VaultError::NoSession)));
}

#[tokio::test]
async fn test_concurrent_reveals() {
    let (remote, store) = seeded().await;
    let handle = start(&remote, &store);
    handle.restore_session(USER, password()).await.unwrap();

    let reveals = (0..8).map(|_| reveal(&handle, example_key()));
    let secrets = futures::future::join_all(reveals).await;

    assert!(secrets.iter().all(|s| s == "p@ss!"));
}

#[tokio::test]
async fn test_legacy_text_record_is_readable() {
    // An archive written by an older client stores base64(ct):base64(iv).
    let remote = Arc::new(MemoryRemote::new());
    let store = Arc::new(MemoryStore::new());
    let config = VaultConfig::insecure_fast();
    let cap = derive_capability(&Masterkey::from("correct-horse"), &config.kdf_params().unwrap()).unwrap();
    let record = encrypt_entry(&secret("legacy-p@ss"), &cap).unwrap();
    remote.put_raw(
        USER,
        SecretEntry {
            platform: "old.example".into(),
            login: "alice".into(),
            archive_file_id: "legacy-file".into(),
        },
        record.to_legacy_text().into_bytes(),
    );

    let handle = start(&remote, &store);
    handle.login(USER, password(), Masterkey::from("correct-horse")).await.unwrap();

    assert_eq!(reveal(&handle, EntryKey::new("old.example", "alice")).await, "legacy-p@ss");
}

#[tokio::test]
async fn test_subscribers_see_transitions() {
    let remote = Arc::new(MemoryRemote::new());
    let store = Arc::new(MemoryStore::new());
    let handle = start(&remote, &store);
    let mut updates = handle.subscribe();

    handle.login(USER, password(), Masterkey::from("correct-horse")).await.unwrap();

    assert!(updates.has_changed().unwrap());
    assert_eq!(updates.borrow_and_update().user_id(), Some(USER));
}

#[tokio::test]
async fn test_write_after_rotation_elsewhere_asks_for_new_masterkey() {
    // 1. Device A holds the Capability for "correct-horse".
    let (remote, store_a) = seeded().await;
    let a = start(&remote, &store_a);
    a.login(USER, password(), Masterkey::from("correct-horse")).await.unwrap();

    // 2. Device B rotates to "new-horse".
    let store_b = Arc::new(MemoryStore::new());
    let b = start(&remote, &store_b);
    b.login(USER, password(), Masterkey::from("correct-horse")).await.unwrap();
    b.rotate_masterkey(Masterkey::from("correct-horse"), Masterkey::from("new-horse"))
        .await
        .unwrap();
    let generation = remote.generation(USER);

    // 3. A's write is refused before anything reaches the remote.
    let result = a.add_secret("b.org", "bob", secret("s3cret")).await;
    assert!(matches!(result, Err(VaultError::Decryption)));
    assert_eq!(remote.generation(USER), generation);
    assert!(!a.state().has_capability());
    assert_eq!(a.state().generation(), Some(generation));

    // 4. The next attempt asks for the Masterkey and completes under the new one.
    let pending = a.add_secret("b.org", "bob", secret("s3cret")).await.unwrap();
    pending
        .into_recovery()
        .expect("masterkey requested")
        .resume(Masterkey::from("new-horse"))
        .await
        .unwrap();
    assert_eq!(reveal(&a, EntryKey::new("b.org", "bob")).await, "s3cret");
    assert_eq!(reveal(&a, example_key()).await, "p@ss!");
    b.refresh().await.unwrap();
    assert_eq!(reveal(&b, EntryKey::new("b.org", "bob")).await, "s3cret");
}

#[tokio::test]
async fn test_update_after_rotation_elsewhere_is_refused() {
    let (remote, store_a) = seeded().await;
    let a = start(&remote, &store_a);
    a.login(USER, password(), Masterkey::from("correct-horse")).await.unwrap();

    let b = start(&remote, &Arc::new(MemoryStore::new()));
    b.login(USER, password(), Masterkey::from("correct-horse")).await.unwrap();
    b.rotate_masterkey(Masterkey::from("correct-horse"), Masterkey::from("new-horse"))
        .await
        .unwrap();

    let result = a.update_secret("example.com", "alice", secret("n3w-p@ss")).await;

    assert!(matches!(result, Err(VaultError::Decryption)));
    assert_eq!(reveal(&b, example_key()).await, "p@ss!");
}

#[tokio::test]
async fn test_stale_envelope_is_removed_on_restore() {
    // 1. This device sealed an Envelope for "correct-horse".
    let (remote, store_a) = seeded().await;
    let envelope_key = lockbox::store::envelope_key("default", USER);
    assert!(store_a.get(&envelope_key).unwrap().is_some());

    // 2. Another device rotates to "new-horse".
    let b = start(&remote, &Arc::new(MemoryStore::new()));
    b.login(USER, password(), Masterkey::from("correct-horse")).await.unwrap();
    b.rotate_masterkey(Masterkey::from("correct-horse"), Masterkey::from("new-horse"))
        .await
        .unwrap();
    b.logout().await.unwrap();

    // 3. Restore finds the Envelope stale and drops it.
    let a = start(&remote, &store_a);
    assert!(!a.restore_session(USER, password()).await.unwrap());
    assert_eq!(store_a.get(&envelope_key).unwrap(), None);

    // 4. Rotating from the current key works on this device.
    let report = a
        .rotate_masterkey(Masterkey::from("new-horse"), Masterkey::from("newest-horse"))
        .await
        .unwrap();
    assert_eq!(report.reencrypted, 1);
    assert!(report.envelope_persisted);
    assert_eq!(reveal(&a, example_key()).await, "p@ss!");
}

#[tokio::test]
async fn test_missing_blob_leaves_rest_of_vault_usable() {
    // 1. The server lists an entry whose blob is gone.
    let (remote, store) = seeded().await;
    remote.put_raw(
        USER,
        SecretEntry {
            platform: "gone.io".into(),
            login: "alice".into(),
            archive_file_id: "f-missing".into(),
        },
        b"placeholder".to_vec(),
    );
    remote.drop_blob(USER, "f-missing");
    let gone = EntryKey::new("gone.io", "alice");

    // 2. Login and restore both succeed.
    let handle = start(&remote, &store);
    handle.login(USER, password(), Masterkey::from("correct-horse")).await.unwrap();
    assert_eq!(handle.state().entries().len(), 1);
    assert_eq!(handle.state().dangling().len(), 1);
    handle.logout().await.unwrap();

    let handle = start(&remote, &store);
    assert!(handle.restore_session(USER, password()).await.unwrap());

    // 3. The intact secret reveals; the dangling one names its blob.
    assert_eq!(reveal(&handle, example_key()).await, "p@ss!");
    let missing = handle.reveal_secret(gone.clone(), AuditAction::Decrypt).await;
    assert!(matches!(missing, Err(VaultError::MissingBlob(id)) if id == "f-missing"));

    // 4. Overwriting the entry repairs it.
    assert!(handle.update_secret("gone.io", "alice", secret("fixed")).await.unwrap().is_done());
    assert!(handle.state().dangling().is_empty());
    assert_eq!(reveal(&handle, gone).await, "fixed");
}

#[tokio::test]
async fn test_unreadable_first_blob_does_not_block_login() {
    // 1. The first entry holds garbage, the second a real secret.
    let remote = Arc::new(MemoryRemote::new());
    let store = Arc::new(MemoryStore::new());
    remote.put_raw(
        USER,
        SecretEntry {
            platform: "aaa.example".into(),
            login: "alice".into(),
            archive_file_id: "f-garbage".into(),
        },
        b"garbage".to_vec(),
    );
    let handle = start(&remote, &store);
    handle.login(USER, password(), Masterkey::from("correct-horse")).await.unwrap();
    handle.add_secret("example.com", "alice", secret("p@ss!")).await.unwrap();
    handle.logout().await.unwrap();

    // 2. The readable entry still rejects a wrong Masterkey.
    let handle = start(&remote, &store);
    let wrong = handle.login(USER, password(), Masterkey::from("wrong-horse")).await;
    assert!(matches!(wrong, Err(VaultError::Decryption)));

    // 3. The right one signs in; the broken entry can be deleted.
    handle.login(USER, password(), Masterkey::from("correct-horse")).await.unwrap();
    let broken = handle
        .reveal_secret(EntryKey::new("aaa.example", "alice"), AuditAction::Decrypt)
        .await;
    assert!(broken.is_err());
    handle.delete_secret("aaa.example", "alice").await.unwrap();
    assert_eq!(handle.state().entries().len(), 1);
    assert_eq!(reveal(&handle, example_key()).await, "p@ss!");
}

#[tokio::test]
async fn test_rejected_rotation_keeps_current_key() {
    // 1. Rotation fails at the remote commit.
    let (remote, store) = seeded().await;
    let handle = start(&remote, &store);
    handle.restore_session(USER, password()).await.unwrap();
    let generation = remote.generation(USER);

    remote.set_fail_writes(true);
    let result = handle
        .rotate_masterkey(Masterkey::from("correct-horse"), Masterkey::from("new-horse"))
        .await;
    remote.set_fail_writes(false);
    assert!(matches!(result, Err(VaultError::Remote(_))));

    // 2. The loaded Capability is still the old one and the remote is unchanged.
    let config = VaultConfig::insecure_fast();
    let current = derive_capability(&Masterkey::from("correct-horse"), &config.kdf_params().unwrap()).unwrap();
    assert_eq!(**handle.state().capability().unwrap(), current);
    assert_eq!(remote.generation(USER), generation);
    assert_eq!(reveal(&handle, example_key()).await, "p@ss!");

    // 3. The Envelope still opens to the old Masterkey.
    let bytes = store.get(&lockbox::store::envelope_key("default", USER)).unwrap().unwrap();
    let sealed = open_envelope(&EnvelopeBytes::from_vec(bytes), &password()).unwrap();
    assert!(sealed.matches(&Masterkey::from("correct-horse")));
}
