//! OpenPGP pipeline scenarios: keyring preconditions fail before any side
//! effect, and signed + encrypted backups round-trip byte-identically.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use common::{backup_options, backup_payload, file_destination, job, restore_options, send_stream, snapshot};
use sequoia_openpgp::cert::CertBuilder;
use sequoia_openpgp::serialize::Serialize as _;
use sequoia_openpgp::Cert;
use std::path::PathBuf;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use zbak::cli::globals::GlobalArgs;
use zbak::compress::Compressor;
use zbak::restore::{RestoreCrypto, run_restore};

struct TestKeys {
    _dir: TempDir,
    cert: Cert,
    public_ring: PathBuf,
    secret_ring: PathBuf,
}

fn generate_keys(uid: &str) -> TestKeys {
    let (cert, _revocation) = CertBuilder::new()
        .add_userid(uid)
        .add_signing_subkey()
        .add_transport_encryption_subkey()
        .generate()
        .unwrap();

    let dir = TempDir::new().unwrap();
    let public_ring = dir.path().join("public.pgp");
    let secret_ring = dir.path().join("private.pgp");

    let mut public = Vec::new();
    cert.serialize(&mut public).unwrap();
    std::fs::write(&public_ring, &public).unwrap();

    let mut secret = Vec::new();
    cert.as_tsk().serialize(&mut secret).unwrap();
    std::fs::write(&secret_ring, &secret).unwrap();

    TestKeys {
        _dir: dir,
        cert,
        public_ring,
        secret_ring,
    }
}

#[test]
fn test_encrypt_requires_the_public_ring() {
    let keys = generate_keys("user <user@example.com>");

    // only the secret ring: encryption has nothing to encrypt to
    let wrong = GlobalArgs {
        encrypt_to: Some("user@example.com".to_string()),
        secret_keyring: Some(keys.secret_ring.clone()),
        ..Default::default()
    };
    assert!(wrong.seal_crypto().is_err());

    // the public ring makes it valid
    let right = GlobalArgs {
        encrypt_to: Some("user@example.com".to_string()),
        public_keyring: Some(keys.public_ring.clone()),
        ..Default::default()
    };
    let crypto = right.seal_crypto().unwrap().unwrap();
    assert_eq!(crypto.recipients.len(), 1);
    assert!(crypto.signer.is_none());
}

#[test]
fn test_sign_requires_the_secret_ring() {
    let keys = generate_keys("user <user@example.com>");

    let wrong = GlobalArgs {
        sign_from: Some("user@example.com".to_string()),
        public_keyring: Some(keys.public_ring.clone()),
        ..Default::default()
    };
    assert!(wrong.seal_crypto().is_err());

    let right = GlobalArgs {
        sign_from: Some("user@example.com".to_string()),
        secret_keyring: Some(keys.secret_ring.clone()),
        ..Default::default()
    };
    let crypto = right.seal_crypto().unwrap().unwrap();
    assert!(crypto.signer.is_some());
    assert!(crypto.recipients.is_empty());
}

#[tokio::test]
async fn test_signed_and_encrypted_round_trip() {
    let keys = generate_keys("user <user@example.com>");
    let work = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    let dests = vec![file_destination(&store)];

    let globals = GlobalArgs {
        encrypt_to: Some("user@example.com".to_string()),
        sign_from: Some("user@example.com".to_string()),
        public_keyring: Some(keys.public_ring.clone()),
        secret_keyring: Some(keys.secret_ring.clone()),
        ..Default::default()
    };
    let seal = globals.seal_crypto().unwrap();

    let payload = send_stream(400 * 1024);
    let mut info = job(
        "tank/data",
        None,
        snapshot("tank/data", "a", 1),
        Compressor::Zstd,
        128 * 1024,
    );
    info.encrypt_to = Some("user@example.com".to_string());
    info.sign_from = Some("user@example.com".to_string());

    let options = backup_options(&work, 128 * 1024, Compressor::Zstd, seal);
    let outcome = backup_payload(&payload, info, &dests, &options).await.unwrap();

    // the sealed payload is neither the raw nor merely-compressed stream
    for volume in &outcome.job.volumes {
        assert_eq!(volume.extension, "zst.pgp");
    }
    let key = outcome.job.volume_key('|', &outcome.job.volumes[0]);
    let sealed = std::fs::read(store.path().join(&key)).unwrap();
    assert_ne!(sealed.get(..16), payload.get(..16));

    // decrypting with the wrong key fails
    let mallory = generate_keys("mallory <mallory@example.com>");
    let mut stolen: Vec<u8> = Vec::new();
    let wrong = run_restore(
        &outcome.job,
        &dests[0],
        &mut stolen,
        &restore_options(
            &work,
            Some(RestoreCrypto {
                secrets: vec![mallory.cert.clone()],
                verifiers: Vec::new(),
                require_signature: false,
            }),
        ),
        &CancellationToken::new(),
    )
    .await;
    assert!(wrong.is_err());

    // the rightful keys round-trip byte-identically, signature verified
    let mut restored: Vec<u8> = Vec::new();
    run_restore(
        &outcome.job,
        &dests[0],
        &mut restored,
        &restore_options(
            &work,
            Some(RestoreCrypto {
                secrets: vec![keys.cert.clone()],
                verifiers: vec![keys.cert.clone()],
                require_signature: true,
            }),
        ),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(restored, payload);
}

#[tokio::test]
async fn test_encrypted_restore_without_keys_is_rejected() {
    let keys = generate_keys("user <user@example.com>");
    let work = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    let dests = vec![file_destination(&store)];

    let globals = GlobalArgs {
        encrypt_to: Some("user@example.com".to_string()),
        public_keyring: Some(keys.public_ring.clone()),
        ..Default::default()
    };

    let payload = send_stream(64 * 1024);
    let mut info = job(
        "tank/data",
        None,
        snapshot("tank/data", "a", 1),
        Compressor::None,
        64 * 1024,
    );
    info.encrypt_to = Some("user@example.com".to_string());

    let options = backup_options(&work, 64 * 1024, Compressor::None, globals.seal_crypto().unwrap());
    let outcome = backup_payload(&payload, info, &dests, &options).await.unwrap();

    let mut restored: Vec<u8> = Vec::new();
    let result = run_restore(
        &outcome.job,
        &dests[0],
        &mut restored,
        &restore_options(&work, None),
        &CancellationToken::new(),
    )
    .await;

    let err = result.unwrap_err().to_string();
    assert!(err.contains("encrypted"), "{err}");
}
