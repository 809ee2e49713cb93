use std::io::Cursor;

use rand::RngCore;
use s3ep_core::config::{EncryptionConfig, IntegrityMode, OptimizationsConfig, ProviderConfig};
use s3ep_core::metadata::MetadataCodec;
use s3ep_core::providers::{ProviderRegistry, StaticKeyProvider};
use s3ep_core::{EncryptionManager, Metadata};
use tokio_util::sync::CancellationToken;

fn registry_with_kek(kek: [u8; 32]) -> anyhow::Result<ProviderRegistry> {
    let provider = StaticKeyProvider::new(kek);
    let fingerprint = provider.fingerprint();
    Ok(ProviderRegistry::new(
        vec![("primary".to_string(), fingerprint, Box::new(provider))],
        "primary",
    )?)
}

fn manager(kek: [u8; 32], integrity: IntegrityMode) -> anyhow::Result<EncryptionManager> {
    let providers = registry_with_kek(kek)?;
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
    Ok(EncryptionManager::new(providers, &encryption, &optimizations))
}

async fn drain<R: tokio::io::AsyncRead + Unpin>(
    stream: &mut s3ep_core::stream::DecryptingStream<R>,
) -> (Vec<u8>, s3ep_core::Result<()>) {
    let mut out = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => return (out, Ok(())),
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) => return (out, Err(e)),
        }
    }
}

async fn drain_ok<R: tokio::io::AsyncRead + Unpin>(
    stream: &mut s3ep_core::stream::EncryptingStream<R>,
) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..n]);
    }
}

/// Encrypt `"Hello, World!"` through the whole-object buffer path and check
/// the literal metadata and length invariants.
fn scenario_a() -> anyhow::Result<()> {
    let mgr = manager([1u8; 32], IntegrityMode::Off)?;
    let plaintext = b"Hello, World!";
    let result = mgr.encrypt_buffer(plaintext, "objects/a.txt", None, &Metadata::new())?;

    if result.metadata.get("s3ep-dek-algorithm").map(String::as_str) != Some("aes-256-gcm") {
        anyhow::bail!("scenario A: expected aes-256-gcm algorithm");
    }
    let iv = base64::Engine::decode(
        &base64::engine::general_purpose::STANDARD,
        result.metadata.get("s3ep-aes-iv").unwrap(),
    )?;
    if iv.len() != 12 {
        anyhow::bail!("scenario A: expected 12-byte GCM nonce, got {}", iv.len());
    }
    let wrapped = base64::Engine::decode(
        &base64::engine::general_purpose::STANDARD,
        result.metadata.get("s3ep-encrypted-dek").unwrap(),
    )?;
    if wrapped != result.wrapped_dek {
        anyhow::bail!("scenario A: metadata wrapped-dek does not match returned wrapped_dek");
    }
    if result.ciphertext.len() != plaintext.len() + 16 {
        anyhow::bail!(
            "scenario A: expected ciphertext length {}, got {}",
            plaintext.len() + 16,
            result.ciphertext.len()
        );
    }

    let recovered = mgr.decrypt_buffer(
        &result.ciphertext,
        &result.wrapped_dek,
        &result.metadata,
        "objects/a.txt",
    )?;
    if recovered != plaintext.to_vec() {
        anyhow::bail!("scenario A: round trip mismatch");
    }
    println!("scenario A OK");
    Ok(())
}

/// Encrypt a 3 KiB random buffer through the streaming path under strict
/// integrity verification, confirm the tag is present, and round-trip it.
async fn scenario_b() -> anyhow::Result<(EncryptionManager, Vec<u8>, Vec<u8>, Metadata, Vec<u8>)> {
    let mgr = manager([2u8; 32], IntegrityMode::Strict)?;
    let mut plaintext = vec![0u8; 3 * 1024];
    rand::rngs::OsRng.fill_bytes(&mut plaintext);

    let (mut stream, rx, wrapped_dek, mut metadata) =
        mgr.encrypt_stream(Cursor::new(plaintext.clone()), "objects/b.bin", &Metadata::new())?;
    let ciphertext = drain_ok(&mut stream).await?;
    let tag = rx.await.unwrap();
    let codec = MetadataCodec::new("s3ep-");
    if let Some(tag) = &tag {
        codec.set_hmac(&mut metadata, tag);
    }
    if !metadata.contains_key("s3ep-hmac") {
        anyhow::bail!("scenario B: expected s3ep-hmac in metadata");
    }

    let mut reader = mgr.decrypt_stream(
        Cursor::new(ciphertext.clone()),
        &wrapped_dek,
        &metadata,
        "objects/b.bin",
    )?;
    let (recovered, result) = drain(&mut reader).await;
    result?;
    if recovered != plaintext {
        anyhow::bail!("scenario B: round trip mismatch");
    }
    println!("scenario B OK");
    Ok((mgr, plaintext, ciphertext, metadata, wrapped_dek))
}

/// Flip the middle byte of (B)'s ciphertext; the final read must fail with
/// an HMAC mismatch and must not have released the final segment's bytes.
async fn scenario_c(
    mgr: &EncryptionManager,
    ciphertext: &[u8],
    metadata: &Metadata,
    wrapped_dek: &[u8],
) -> anyhow::Result<()> {
    let mut tampered = ciphertext.to_vec();
    let mid = tampered.len() / 2;
    tampered[mid] ^= 0x01;

    let mut reader =
        mgr.decrypt_stream(Cursor::new(tampered), wrapped_dek, metadata, "objects/b.bin")?;
    let (_partial, result) = drain(&mut reader).await;
    match result {
        Err(e) if matches!(e, s3ep_core::Error::HmacMismatch) => {}
        Err(e) => anyhow::bail!("scenario C: expected HmacMismatch, got {e}"),
        Ok(()) => anyhow::bail!("scenario C: tampered ciphertext was not rejected"),
    }
    println!("scenario C OK");
    Ok(())
}

/// Multipart upload with parts [1 MiB, 1 MiB, 500 KiB], submitted in order.
async fn scenario_d() -> anyhow::Result<()> {
    let mgr = manager([3u8; 32], IntegrityMode::Hybrid)?;
    let part1 = vec![1u8; 1024 * 1024];
    let part2 = vec![2u8; 1024 * 1024];
    let part3 = vec![3u8; 500 * 1024];
    let mut whole = Vec::new();
    whole.extend_from_slice(&part1);
    whole.extend_from_slice(&part2);
    whole.extend_from_slice(&part3);

    let cancel = CancellationToken::new();
    mgr.initiate_multipart("upload-d", "objects/d.bin", "bucket")?;
    let mut ct1 = Vec::new();
    let mut ct2 = Vec::new();
    let mut ct3 = Vec::new();
    mgr.upload_part("upload-d", 1, Cursor::new(part1), &mut ct1, &cancel)
        .await?;
    mgr.store_part_etag("upload-d", 1, "etag-1")?;
    mgr.upload_part("upload-d", 2, Cursor::new(part2), &mut ct2, &cancel)
        .await?;
    mgr.store_part_etag("upload-d", 2, "etag-2")?;
    mgr.upload_part("upload-d", 3, Cursor::new(part3), &mut ct3, &cancel)
        .await?;
    mgr.store_part_etag("upload-d", 3, "etag-3")?;
    let parts = vec![
        (1, "etag-1".to_string()),
        (2, "etag-2".to_string()),
        (3, "etag-3".to_string()),
    ];
    let metadata = mgr.complete_multipart("upload-d", &parts, &Metadata::new())?;

    let mut combined = Vec::new();
    combined.extend_from_slice(&ct1);
    combined.extend_from_slice(&ct2);
    combined.extend_from_slice(&ct3);
    let wrapped_dek = base64::Engine::decode(
        &base64::engine::general_purpose::STANDARD,
        metadata.get("s3ep-encrypted-dek").unwrap(),
    )?;

    let mut reader = mgr.decrypt_stream(
        Cursor::new(combined),
        &wrapped_dek,
        &metadata,
        "objects/d.bin",
    )?;
    let (recovered, result) = drain(&mut reader).await;
    result?;
    if recovered != whole {
        anyhow::bail!("scenario D: round trip mismatch");
    }
    println!("scenario D OK");
    Ok(())
}

/// Submitting part 2 before part 1 must fail with `OutOfOrderPart`.
async fn scenario_e() -> anyhow::Result<()> {
    let mgr = manager([4u8; 32], IntegrityMode::Off)?;
    let cancel = CancellationToken::new();
    mgr.initiate_multipart("upload-e", "objects/e.bin", "bucket")?;
    let mut out = Vec::new();
    let err = mgr
        .upload_part("upload-e", 2, Cursor::new(vec![0u8; 16]), &mut out, &cancel)
        .await
        .unwrap_err();
    match err {
        s3ep_core::Error::OutOfOrderPart { expected: 1, got: 2 } => {}
        other => anyhow::bail!("scenario E: expected OutOfOrderPart, got {other}"),
    }
    println!("scenario E OK");
    Ok(())
}

/// Under `hybrid`, an object whose metadata lacks `s3ep-hmac` still decrypts.
fn scenario_f() -> anyhow::Result<()> {
    let write_mgr = manager([5u8; 32], IntegrityMode::Off)?;
    let plaintext = b"back-compat object, no hmac recorded";
    let result = write_mgr.encrypt_buffer(plaintext, "objects/f.txt", None, &Metadata::new())?;
    if result.metadata.contains_key("s3ep-hmac") {
        anyhow::bail!("scenario F: setup should not have recorded an hmac tag");
    }

    let read_mgr = manager([5u8; 32], IntegrityMode::Hybrid)?;
    let recovered = read_mgr.decrypt_buffer(
        &result.ciphertext,
        &result.wrapped_dek,
        &result.metadata,
        "objects/f.txt",
    )?;
    if recovered != plaintext.to_vec() {
        anyhow::bail!("scenario F: round trip mismatch");
    }
    println!("scenario F OK");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    scenario_a()?;
    let (mgr, _plaintext, ciphertext, metadata, wrapped_dek) = scenario_b().await?;
    scenario_c(&mgr, &ciphertext, &metadata, &wrapped_dek).await?;
    scenario_d().await?;
    scenario_e().await?;
    scenario_f()?;
    println!("ALL SCENARIOS OK");
    Ok(())
}
