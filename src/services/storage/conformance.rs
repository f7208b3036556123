//! Behaviour every [`Storage`] backend must share.
//!
//! Each backend's test module calls [`run`] on a fresh instance. The suite
//! removes everything it writes.

use super::{Storage, StorageError, body_from_bytes};
use crate::models::resource::generate_token;

pub(crate) async fn run(storage: &dyn Storage) {
    round_trip(storage).await;
    head_reports_size_and_type(storage).await;
    overwrite_replaces_content(storage).await;
    missing_objects_are_not_found(storage).await;
    delete_is_safe_to_repeat(storage).await;
    length_mismatch_is_rejected(storage).await;
    unsafe_keys_are_rejected(storage).await;
}

async fn round_trip(storage: &dyn Storage) {
    let token = generate_token();
    storage
        .put(&token, "a.txt", body_from_bytes("hello"), "text/plain", 5)
        .await
        .expect("put");

    let object = storage.get(&token, "a.txt").await.expect("get");
    assert_eq!(object.content_length, 5);
    assert_eq!(object.content_type, "text/plain");
    let data = object.into_bytes().await.expect("read body");
    assert_eq!(&data[..], b"hello");

    storage.delete(&token, "a.txt").await.expect("delete");
    let err = storage.get(&token, "a.txt").await.err().expect("get after delete");
    assert!(storage.is_not_exist(&err), "{} after delete: {err}", storage.kind());
}

async fn head_reports_size_and_type(storage: &dyn Storage) {
    let token = generate_token();
    let payload = vec![7u8; 4096];
    storage
        .put(
            &token,
            "blob.bin",
            body_from_bytes(payload.clone()),
            "application/x-test",
            payload.len() as u64,
        )
        .await
        .expect("put");

    let info = storage.head(&token, "blob.bin").await.expect("head");
    assert_eq!(info.content_length, 4096);
    assert_eq!(info.content_type, "application/x-test");

    storage.delete(&token, "blob.bin").await.expect("delete");
}

async fn overwrite_replaces_content(storage: &dyn Storage) {
    let token = generate_token();
    storage
        .put(&token, "v.txt", body_from_bytes("first"), "text/plain", 5)
        .await
        .expect("first put");
    storage
        .put(&token, "v.txt", body_from_bytes("second!"), "text/markdown", 7)
        .await
        .expect("second put");

    let object = storage.get(&token, "v.txt").await.expect("get");
    assert_eq!(object.content_length, 7);
    assert_eq!(object.content_type, "text/markdown");
    assert_eq!(&object.into_bytes().await.expect("read")[..], b"second!");

    storage.delete(&token, "v.txt").await.expect("delete");
}

async fn missing_objects_are_not_found(storage: &dyn Storage) {
    let token = generate_token();
    let err = storage.get(&token, "nope.txt").await.err().expect("get");
    assert!(storage.is_not_exist(&err));
    let err = storage.head(&token, "nope.txt").await.err().expect("head");
    assert!(storage.is_not_exist(&err));
}

async fn delete_is_safe_to_repeat(storage: &dyn Storage) {
    let token = generate_token();
    storage
        .put(&token, "d.txt", body_from_bytes("x"), "text/plain", 1)
        .await
        .expect("put");
    storage.delete(&token, "d.txt").await.expect("first delete");

    match storage.delete(&token, "d.txt").await {
        Ok(()) => {}
        Err(err) => assert!(storage.is_not_exist(&err), "second delete failed: {err}"),
    }
}

async fn length_mismatch_is_rejected(storage: &dyn Storage) {
    let token = generate_token();
    let err = storage
        .put(&token, "short.txt", body_from_bytes("hello"), "text/plain", 10)
        .await
        .expect_err("declared length larger than body");
    assert!(matches!(err, StorageError::LengthMismatch { .. }));

    let err = storage.head(&token, "short.txt").await.err().expect("head");
    assert!(storage.is_not_exist(&err));
}

async fn unsafe_keys_are_rejected(storage: &dyn Storage) {
    let err = storage
        .put("..", "x.txt", body_from_bytes("x"), "text/plain", 1)
        .await
        .expect_err("traversal token");
    assert!(matches!(err, StorageError::InvalidKey));
    assert!(!storage.is_not_exist(&err));
}
