//! End-to-end scenarios against the public façade: a request carrying raw
//! bytes in, ciphertext and metadata out, and back.

use std::io::Cursor;

use rand::RngCore;
use s3ep_core::config::{EncryptionConfig, IntegrityMode, OptimizationsConfig, ProviderConfig};
use s3ep_core::metadata::MetadataCodec;
use s3ep_core::providers::{ProviderRegistry, StaticKeyProvider};
use s3ep_core::{EncryptionManager, Error, Metadata};
use tokio_util::sync::CancellationToken;

fn manager(kek: [u8; 32], integrity: IntegrityMode) -> EncryptionManager {
    let provider = StaticKeyProvider::new(kek);
    let fingerprint = provider.fingerprint();
    let providers = ProviderRegistry::new(
        vec![("primary".to_string(), fingerprint, Box::new(provider))],
        "primary",
    )
    .unwrap();
    let encryption = EncryptionConfig {
        encryption_method_alias: "primary".to_string(),
        providers: vec![ProviderConfig {
            alias: "primary".to_string(),
            kind: "static".to_string(),
            config: serde_json::Value::Null,
        }],
        metadata_key_prefix: "s3ep-".to_string(),
        integrity_verification: integrity,
    };
    let optimizations = OptimizationsConfig {
        streaming_threshold: 5 * 1024 * 1024,
        streaming_segment_size: 1024,
    };
    EncryptionManager::new(providers, &encryption, &optimizations)
}

fn b64_decode(s: &str) -> Vec<u8> {
    base64::Engine::decode(&base64::engine::general_purpose::STANDARD, s).unwrap()
}

async fn drain_decrypt<R: tokio::io::AsyncRead + Unpin>(
    stream: &mut s3ep_core::stream::DecryptingStream<R>,
) -> (Vec<u8>, s3ep_core::Result<()>) {
    let mut out = Vec::new();
    let mut buf = [0u8; 128];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => return (out, Ok(())),
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) => return (out, Err(e)),
        }
    }
}

async fn drain_encrypt<R: tokio::io::AsyncRead + Unpin>(
    stream: &mut s3ep_core::stream::EncryptingStream<R>,
) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 128];
    loop {
        let n = stream.read(&mut buf).await.unwrap();
        if n == 0 {
            return out;
        }
        out.extend_from_slice(&buf[..n]);
    }
}

#[test]
fn scenario_a_literal_whole_object() {
    let mgr = manager([1u8; 32], IntegrityMode::Off);
    let plaintext = b"Hello, World!";
    let result = mgr
        .encrypt_buffer(plaintext, "objects/a.txt", None, &Metadata::new())
        .unwrap();

    assert_eq!(
        result.metadata.get("s3ep-dek-algorithm").map(String::as_str),
        Some("aes-256-gcm")
    );
    let iv = b64_decode(result.metadata.get("s3ep-aes-iv").unwrap());
    assert_eq!(iv.len(), 12);
    let wrapped = b64_decode(result.metadata.get("s3ep-encrypted-dek").unwrap());
    assert_eq!(wrapped, result.wrapped_dek);
    assert_eq!(result.ciphertext.len(), plaintext.len() + 16);

    let recovered = mgr
        .decrypt_buffer(&result.ciphertext, &result.wrapped_dek, &result.metadata, "objects/a.txt")
        .unwrap();
    assert_eq!(recovered, plaintext.to_vec());
}

#[tokio::test]
async fn scenario_b_streaming_strict_round_trip() {
    let mgr = manager([2u8; 32], IntegrityMode::Strict);
    let mut plaintext = vec![0u8; 3 * 1024];
    rand::rngs::OsRng.fill_bytes(&mut plaintext);

    let (mut stream, rx, wrapped_dek, mut metadata) = mgr
        .encrypt_stream(Cursor::new(plaintext.clone()), "objects/b.bin", &Metadata::new())
        .unwrap();
    let ciphertext = drain_encrypt(&mut stream).await;
    let tag = rx.await.unwrap();
    let codec = MetadataCodec::new("s3ep-");
    codec.set_hmac(&mut metadata, &tag.unwrap());
    assert!(metadata.contains_key("s3ep-hmac"));

    let mut reader = mgr
        .decrypt_stream(Cursor::new(ciphertext), &wrapped_dek, &metadata, "objects/b.bin")
        .unwrap();
    let (recovered, result) = drain_decrypt(&mut reader).await;
    result.unwrap();
    assert_eq!(recovered, plaintext);
}

#[tokio::test]
async fn scenario_c_bitflip_detected_before_final_segment_release() {
    let mgr = manager([2u8; 32], IntegrityMode::Strict);
    let mut plaintext = vec![0u8; 3 * 1024];
    rand::rngs::OsRng.fill_bytes(&mut plaintext);

    let (mut stream, rx, wrapped_dek, mut metadata) = mgr
        .encrypt_stream(Cursor::new(plaintext.clone()), "objects/c.bin", &Metadata::new())
        .unwrap();
    let mut ciphertext = drain_encrypt(&mut stream).await;
    let tag = rx.await.unwrap().unwrap();
    let codec = MetadataCodec::new("s3ep-");
    codec.set_hmac(&mut metadata, &tag);

    let mid = ciphertext.len() / 2;
    ciphertext[mid] ^= 0x01;

    let mut reader = mgr
        .decrypt_stream(Cursor::new(ciphertext), &wrapped_dek, &metadata, "objects/c.bin")
        .unwrap();
    let (partial, result) = drain_decrypt(&mut reader).await;
    assert!(matches!(result.unwrap_err(), Error::HmacMismatch));
    assert!(partial.len() < plaintext.len());
}

#[tokio::test]
async fn scenario_d_multipart_assembles_to_original() {
    let mgr = manager([3u8; 32], IntegrityMode::Hybrid);
    let part1 = vec![1u8; 1024 * 1024];
    let part2 = vec![2u8; 1024 * 1024];
    let part3 = vec![3u8; 500 * 1024];
    let mut whole = Vec::new();
    whole.extend_from_slice(&part1);
    whole.extend_from_slice(&part2);
    whole.extend_from_slice(&part3);

    let cancel = CancellationToken::new();
    mgr.initiate_multipart("upload-d", "objects/d.bin", "bucket").unwrap();
    let mut ct1 = Vec::new();
    let mut ct2 = Vec::new();
    let mut ct3 = Vec::new();
    mgr.upload_part("upload-d", 1, Cursor::new(part1), &mut ct1, &cancel)
        .await
        .unwrap();
    mgr.store_part_etag("upload-d", 1, "etag-1").unwrap();
    mgr.upload_part("upload-d", 2, Cursor::new(part2), &mut ct2, &cancel)
        .await
        .unwrap();
    mgr.store_part_etag("upload-d", 2, "etag-2").unwrap();
    mgr.upload_part("upload-d", 3, Cursor::new(part3), &mut ct3, &cancel)
        .await
        .unwrap();
    mgr.store_part_etag("upload-d", 3, "etag-3").unwrap();

    let parts = vec![
        (1, "etag-1".to_string()),
        (2, "etag-2".to_string()),
        (3, "etag-3".to_string()),
    ];
    let metadata = mgr
        .complete_multipart("upload-d", &parts, &Metadata::new())
        .unwrap();

    let mut combined = Vec::new();
    combined.extend_from_slice(&ct1);
    combined.extend_from_slice(&ct2);
    combined.extend_from_slice(&ct3);
    let wrapped_dek = b64_decode(metadata.get("s3ep-encrypted-dek").unwrap());

    let mut reader = mgr
        .decrypt_stream(Cursor::new(combined), &wrapped_dek, &metadata, "objects/d.bin")
        .unwrap();
    let (recovered, result) = drain_decrypt(&mut reader).await;
    result.unwrap();
    assert_eq!(recovered, whole);
}

#[tokio::test]
async fn scenario_e_out_of_order_part_rejected() {
    let mgr = manager([4u8; 32], IntegrityMode::Off);
    let cancel = CancellationToken::new();
    mgr.initiate_multipart("upload-e", "objects/e.bin", "bucket").unwrap();
    let mut out = Vec::new();
    let err = mgr
        .upload_part("upload-e", 2, Cursor::new(vec![0u8; 16]), &mut out, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::OutOfOrderPart {
            expected: 1,
            got: 2
        }
    ));
}

#[test]
fn scenario_f_hybrid_accepts_object_without_hmac() {
    let write_mgr = manager([5u8; 32], IntegrityMode::Off);
    let plaintext = b"back-compat object, no hmac recorded";
    let result = write_mgr
        .encrypt_buffer(plaintext, "objects/f.txt", None, &Metadata::new())
        .unwrap();
    assert!(!result.metadata.contains_key("s3ep-hmac"));

    let read_mgr = manager([5u8; 32], IntegrityMode::Hybrid);
    let recovered = read_mgr
        .decrypt_buffer(&result.ciphertext, &result.wrapped_dek, &result.metadata, "objects/f.txt")
        .unwrap();
    assert_eq!(recovered, plaintext.to_vec());
}
