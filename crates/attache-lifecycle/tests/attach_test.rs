//! Attach, replace, and detach behavior of single-blob slots.

mod common;

use attache_core::{Attachable, Error};
use attache_lifecycle::SlotState;
use serde_json::json;

use common::{harness, User};

#[tokio::test]
async fn test_attach_existing_blob() {
    let h = harness();
    let blob = h.create_blob("funky.jpg", b"funky").await;
    let user = User::persisted("DHH");

    let outcome = h
        .manager
        .attach(&user, "avatar", Some(Attachable::Blob(blob.clone())))
        .await
        .unwrap();

    assert_eq!(outcome.transitions.len(), 1);
    let attached = h.manager.blob_for(&user, "avatar").await.unwrap().unwrap();
    assert_eq!(attached, blob);
    assert_eq!(attached.filename, "funky.jpg");
    assert_eq!(h.store.put_count(), 1);
}

#[tokio::test]
async fn test_attach_by_signed_id_matches_direct_attach() {
    let h = harness();
    let blob = h.create_blob("funky.jpg", b"funky").await;
    let token = h.manager.registry().signed_id(&blob);

    let direct = User::persisted("direct");
    let signed = User::persisted("signed");
    h.manager
        .attach(&direct, "avatar", Some(Attachable::Blob(blob.clone())))
        .await
        .unwrap();
    h.manager
        .attach(&signed, "avatar", Some(Attachable::SignedId(token)))
        .await
        .unwrap();

    let a = h.manager.slot_state(&direct, "avatar").await.unwrap();
    let b = h.manager.slot_state(&signed, "avatar").await.unwrap();
    assert_eq!(a, b);
    assert_eq!(a, SlotState::Bound(blob.id));
    assert_eq!(h.references(&blob).await, 2);
}

#[tokio::test]
async fn test_attach_tampered_signed_id_is_rejected() {
    let h = harness();
    let blob = h.create_blob("funky.jpg", b"funky").await;
    let mut token = h.manager.registry().signed_id(&blob);
    token.push('x');
    let user = User::persisted("DHH");

    let err = h
        .manager
        .attach(&user, "avatar", Some(Attachable::SignedId(token)))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InvalidSignedId(_)));
    assert!(!h.manager.is_attached(&user, "avatar").await.unwrap());
}

#[tokio::test]
async fn test_upload_on_new_owner_waits_for_save() {
    let h = harness();
    let mut user = User::new("Jason");

    let mut tx = h.manager.begin(&user);
    let blob = tx
        .attach(
            "avatar",
            Some(Attachable::upload("racecar.jpg", "image/jpeg", b"racecar".to_vec())),
        )
        .await
        .unwrap();

    // Uploaded and registered before the owner exists, but not bound.
    assert_eq!(h.blobs.len().await, 1);
    assert_eq!(h.store.put_count(), 1);
    assert!(h.stored(&blob).await);
    assert!(h.slots.is_empty().await);
    assert!(tx.is_dirty());

    user.save();
    let outcome = tx.commit(&user).await.unwrap();

    assert_eq!(outcome.transitions.len(), 1);
    assert_eq!(h.slots.len().await, 1);
    assert_eq!(
        h.manager.bound_blob_id(&user, "avatar").await.unwrap(),
        Some(blob.id)
    );
    assert_eq!(h.store.put_count(), 1);
}

#[tokio::test]
async fn test_commit_without_owner_id_is_rejected() {
    let h = harness();
    let user = User::new("Jason");

    let mut tx = h.manager.begin(&user);
    tx.attach(
        "avatar",
        Some(Attachable::upload("racecar.jpg", "image/jpeg", b"racecar".to_vec())),
    )
    .await
    .unwrap();
    let err = tx.commit(&user).await.unwrap_err();

    assert!(matches!(err, Error::OwnerNotPersisted(_)));
    assert!(h.slots.is_empty().await);

    let err = h.manager.detach(&user, "avatar").await.unwrap_err();
    assert!(matches!(err, Error::OwnerNotPersisted(_)));
}

#[tokio::test]
async fn test_reattach_same_blob_writes_nothing() {
    let h = harness();
    let blob = h.create_blob("funky.jpg", b"funky").await;
    let user = h.user_with("avatar", &blob).await;
    let writes = h.slots.write_count();

    let outcome = h
        .manager
        .attach(&user, "avatar", Some(Attachable::Blob(blob.clone())))
        .await
        .unwrap();

    assert!(outcome.is_noop());
    assert_eq!(h.slots.write_count(), writes);
    assert!(h.queue.tasks().await.is_empty());
    assert!(h.stored(&blob).await);
}

#[tokio::test]
async fn test_replace_dependent_purges_old_blob_later() {
    let h = harness();
    let old = h.create_blob("funky.jpg", b"funky").await;
    let user = h.user_with("avatar", &old).await;
    let new = h.create_blob("town.jpg", b"town").await;

    let outcome = h
        .manager
        .attach(&user, "avatar", Some(Attachable::Blob(new.clone())))
        .await
        .unwrap();

    assert_eq!(outcome.enqueued.len(), 1);
    let pending = h.queue.pending().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].blob_id, old.id);
    assert_eq!(pending[0].storage_key, old.storage_key);

    // Deferred: still present until the task runs.
    assert!(h.stored(&old).await);

    assert_eq!(h.perform_enqueued_jobs().await, 1);
    assert!(!h.stored(&old).await);
    assert!(!h.registered(&old).await);
    assert_eq!(
        h.manager.bound_blob_id(&user, "avatar").await.unwrap(),
        Some(new.id)
    );
    assert!(h.stored(&new).await);
}

#[tokio::test]
async fn test_replace_independent_keeps_old_blob() {
    let h = harness();
    let old = h.create_blob("funky.jpg", b"funky").await;
    let user = h.user_with("cover_photo", &old).await;
    let new = h.create_blob("town.jpg", b"town").await;

    let outcome = h
        .manager
        .attach(&user, "cover_photo", Some(Attachable::Blob(new.clone())))
        .await
        .unwrap();

    assert!(outcome.enqueued.is_empty());
    assert_eq!(outcome.retained, vec![old.id]);
    assert!(h.queue.tasks().await.is_empty());
    assert!(h.stored(&old).await);
    assert!(h.registered(&old).await);
}

#[tokio::test]
async fn test_replace_shared_blob_is_not_purged() {
    let h = harness();
    let shared = h.create_blob("funky.jpg", b"funky").await;
    let first = h.user_with("avatar", &shared).await;
    let second = h.user_with("avatar", &shared).await;
    let new = h.create_blob("town.jpg", b"town").await;

    let outcome = h
        .manager
        .attach(&first, "avatar", Some(Attachable::Blob(new)))
        .await
        .unwrap();

    assert!(outcome.enqueued.is_empty());
    assert_eq!(outcome.retained, vec![shared.id]);
    assert!(h.stored(&shared).await);
    assert_eq!(
        h.manager.bound_blob_id(&second, "avatar").await.unwrap(),
        Some(shared.id)
    );
}

#[tokio::test]
async fn test_failed_owner_validation_keeps_original_attachment() {
    let h = harness();
    let old = h.create_blob("funky.jpg", b"funky").await;
    let mut user = h.user_with("avatar", &old).await;
    let writes = h.slots.write_count();

    user.name = String::new();
    let err = h
        .manager
        .replace_via_owner_update(
            &user,
            "avatar",
            Some(Attachable::upload("town.jpg", "image/jpeg", b"town".to_vec())),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(h.slots.write_count(), writes);
    assert_eq!(
        h.manager.bound_blob_id(&user, "avatar").await.unwrap(),
        Some(old.id)
    );
    assert!(h.queue.tasks().await.is_empty());
    assert!(h.stored(&old).await);
    assert!(h.registered(&old).await);
    // The new upload happened but is left unreferenced.
    assert_eq!(h.blobs.len().await, 2);
}

#[tokio::test]
async fn test_owner_update_with_nothing_detaches() {
    let h = harness();
    let old = h.create_blob("funky.jpg", b"funky").await;
    let user = h.user_with("avatar", &old).await;

    let outcome = h
        .manager
        .replace_via_owner_update(&user, "avatar", None)
        .await
        .unwrap();

    assert_eq!(outcome.enqueued.len(), 1);
    assert!(!h.manager.is_attached(&user, "avatar").await.unwrap());
}

#[tokio::test]
async fn test_attach_nothing_is_rejected() {
    let h = harness();
    let blob = h.create_blob("funky.jpg", b"funky").await;
    let user = h.user_with("avatar", &blob).await;

    let err = h.manager.attach(&user, "avatar", None).await.unwrap_err();

    assert!(matches!(err, Error::Unattachable(ref slot) if slot == "User.avatar"));
    assert_eq!(
        h.manager.bound_blob_id(&user, "avatar").await.unwrap(),
        Some(blob.id)
    );
    assert!(h.stored(&blob).await);
}

#[tokio::test]
async fn test_attach_unrecognized_input_is_rejected() {
    let h = harness();
    let blob = h.create_blob("funky.jpg", b"funky").await;
    let user = h.user_with("avatar", &blob).await;

    let err = Attachable::from_json(&json!(42)).unwrap_err();
    assert!(matches!(err, Error::InvalidAttachable(ref v) if v == "42"));

    // Blank input parses to nothing, which the slot rejects.
    let nothing = Attachable::from_json(&json!("")).unwrap();
    let err = h.manager.attach(&user, "avatar", nothing).await.unwrap_err();
    assert!(matches!(err, Error::Unattachable(_)));

    assert_eq!(
        h.manager.bound_blob_id(&user, "avatar").await.unwrap(),
        Some(blob.id)
    );
    assert!(h.queue.tasks().await.is_empty());
}

#[tokio::test]
async fn test_unknown_slot_is_rejected_before_upload() {
    let h = harness();
    let user = User::persisted("DHH");

    let err = h
        .manager
        .attach(
            &user,
            "banner",
            Some(Attachable::upload("town.jpg", "image/jpeg", b"town".to_vec())),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::UnknownSlot(ref s) if s == "User.banner"));
    assert_eq!(h.store.put_count(), 0);
    assert!(h.blobs.is_empty().await);
}

#[tokio::test]
async fn test_store_outage_on_upload_leaves_slot_unchanged() {
    let h = harness();
    let old = h.create_blob("funky.jpg", b"funky").await;
    let user = h.user_with("avatar", &old).await;

    h.store.set_unavailable(true);
    let err = h
        .manager
        .attach(
            &user,
            "avatar",
            Some(Attachable::upload("town.jpg", "image/jpeg", b"town".to_vec())),
        )
        .await
        .unwrap_err();
    h.store.set_unavailable(false);

    assert!(matches!(err, Error::Storage(_)));
    assert_eq!(h.blobs.len().await, 1);
    assert_eq!(
        h.manager.bound_blob_id(&user, "avatar").await.unwrap(),
        Some(old.id)
    );
    assert!(h.queue.tasks().await.is_empty());
}

#[tokio::test]
async fn test_detach_keeps_blob_of_dependent_slot() {
    let h = harness();
    let blob = h.create_blob("funky.jpg", b"funky").await;
    let user = h.user_with("avatar", &blob).await;

    let outcome = h.manager.detach(&user, "avatar").await.unwrap();

    assert_eq!(outcome.retained, vec![blob.id]);
    assert!(!h.manager.is_attached(&user, "avatar").await.unwrap());
    assert!(h.queue.tasks().await.is_empty());
    assert!(h.stored(&blob).await);
    assert!(h.registered(&blob).await);
}

#[tokio::test]
async fn test_detach_empty_slot_is_noop() {
    let h = harness();
    let user = User::persisted("DHH");
    let writes = h.slots.write_count();

    let outcome = h.manager.detach_and_maybe_purge(&user, "avatar").await.unwrap();

    assert!(outcome.is_noop());
    assert_eq!(h.slots.write_count(), writes);
}
