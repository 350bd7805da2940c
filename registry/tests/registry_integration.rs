//! End-to-end tests of save, sync, listing and removal against embedded
//! registries on localhost. No external network access is needed.

mod common;

use std::time::Duration;

use common::{memory_registry, seed_list, start_upstream};
use sealreg_core::config::{SaverConfig, StorageConfig, SyncConfig};
use sealreg_core::error::RegistryError;
use sealreg_registry::auth::CredentialMap;
use sealreg_registry::filter::Filter;
use sealreg_registry::images::{list_images, remove_image};
use sealreg_registry::manifest::Platform;
use sealreg_registry::remote::RemoteClient;
use sealreg_registry::saver::ImageSaver;
use sealreg_registry::storage::{DriverFactory, LocalRegistry};
use sealreg_registry::sync::RegistrySync;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn amd64() -> Platform {
    Platform::new("linux", "amd64")
}

fn saver(max_pull_procs: usize) -> ImageSaver {
    ImageSaver::new(
        SaverConfig {
            max_pull_procs,
            ..Default::default()
        },
        CredentialMap::new(),
        DriverFactory::with_defaults(),
        StorageConfig::default(),
    )
    .with_probe_timeout(Duration::from_secs(5))
}

fn open_target(dir: &TempDir) -> LocalRegistry {
    LocalRegistry::open(dir.path(), &DriverFactory::with_defaults(), &StorageConfig::default()).unwrap()
}

#[tokio::test]
async fn test_save_nginx_to_directory() {
    let upstream_local = memory_registry();
    let nginx = seed_list(&upstream_local, "library/nginx", "latest", 2).await;
    let upstream = start_upstream(upstream_local, Duration::ZERO).await;
    let dir = TempDir::new().unwrap();
    let image = format!("{}/library/nginx:latest", upstream.host());

    let saved = saver(5)
        .save_images(&[image.clone()], dir.path(), &amd64())
        .await
        .unwrap();
    assert_eq!(saved, vec![image]);

    let target = open_target(&dir);
    for blob in &nginx.amd64.blobs {
        assert!(target.has_blob("library/nginx", blob).await.unwrap(), "missing {}", blob);
    }
    for blob in &nginx.arm64.blobs {
        assert!(target.blob_size(blob).await.unwrap().is_none());
    }
    assert_eq!(
        target.tag_digest("library/nginx", "latest").await.unwrap(),
        Some(nginx.list.clone())
    );
    assert!(target
        .get_manifest("library/nginx", &nginx.amd64.manifest)
        .await
        .unwrap()
        .is_some());
    assert!(dir
        .path()
        .join("docker/registry/v2/repositories/library/nginx/_manifests")
        .is_dir());
}

#[tokio::test]
async fn test_second_save_transfers_nothing() {
    let upstream_local = memory_registry();
    let nginx = seed_list(&upstream_local, "library/nginx", "latest", 3).await;
    let upstream = start_upstream(upstream_local, Duration::ZERO).await;
    let dir = TempDir::new().unwrap();
    let images = vec![format!("{}/library/nginx:latest", upstream.host())];
    let mut saver = saver(5);

    saver.save_images(&images, dir.path(), &amd64()).await.unwrap();
    let first = saver.stats().snapshot();
    let gets_after_first = upstream.counters.blob_gets();
    assert_eq!(first.blobs_committed, nginx.amd64.blobs.len() as u64);
    assert_eq!(gets_after_first, nginx.amd64.blobs.len());

    saver.save_images(&images, dir.path(), &amd64()).await.unwrap();
    let second = saver.stats().snapshot();
    assert_eq!(second.blobs_committed, first.blobs_committed);
    assert_eq!(second.bytes_written, first.bytes_written);
    assert_eq!(
        second.blobs_skipped - first.blobs_skipped,
        nginx.amd64.blobs.len() as u64
    );
    assert_eq!(upstream.counters.blob_gets(), gets_after_first);
}

#[tokio::test]
async fn test_save_concurrency_is_bounded() {
    let upstream_local = memory_registry();
    let repos = ["library/nginx", "library/redis", "team/api", "team/web"];
    for repo in repos {
        seed_list(&upstream_local, repo, "v1", 4).await;
    }
    let upstream = start_upstream(upstream_local, Duration::from_millis(20)).await;
    let dir = TempDir::new().unwrap();
    let images: Vec<String> = repos
        .iter()
        .map(|repo| format!("{}/{}:v1", upstream.host(), repo))
        .collect();

    let saved = saver(2)
        .save_images(&images, dir.path(), &amd64())
        .await
        .unwrap();

    assert_eq!(saved, images);
    assert!(upstream.counters.peak() >= 1);
    assert!(
        upstream.counters.peak() <= 2,
        "peak {} exceeds the limit",
        upstream.counters.peak()
    );
}

#[tokio::test]
async fn test_failed_group_does_not_void_others() {
    let upstream_local = memory_registry();
    let nginx = seed_list(&upstream_local, "library/nginx", "latest", 1).await;
    let upstream = start_upstream(upstream_local, Duration::ZERO).await;
    let dir = TempDir::new().unwrap();
    let images = vec![
        format!("{}/library/missing:latest", upstream.host()),
        format!("{}/library/nginx:latest", upstream.host()),
    ];

    let result = saver(5).save_images(&images, dir.path(), &amd64()).await;
    match result {
        Err(RegistryError::BlobTransfer { image, .. }) => assert!(image.contains("library/missing")),
        other => panic!("unexpected result {:?}", other),
    }

    let target = open_target(&dir);
    assert_eq!(
        target.tag_digest("library/nginx", "latest").await.unwrap(),
        Some(nginx.list)
    );
}

#[tokio::test]
async fn test_sync_between_registries() {
    let src_local = memory_registry();
    let nginx = seed_list(&src_local, "library/nginx", "latest", 2).await;
    let src = start_upstream(src_local, Duration::ZERO).await;
    let dst = start_upstream(memory_registry(), Duration::ZERO).await;

    let synced = RegistrySync::new(SyncConfig::default(), CredentialMap::new())
        .with_platform(amd64())
        .sync_hosts(&src.host(), &dst.host(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(synced, vec!["library/nginx:latest"]);
    assert_eq!(
        dst.local.tag_digest("library/nginx", "latest").await.unwrap(),
        Some(nginx.amd64.manifest.clone())
    );
    for blob in &nginx.amd64.blobs {
        assert!(dst.local.has_blob("library/nginx", blob).await.unwrap());
    }
}

#[tokio::test]
async fn test_sync_concurrency_is_bounded() {
    let src_local = memory_registry();
    let repos = ["library/nginx", "library/redis", "team/api", "team/web"];
    for repo in repos {
        seed_list(&src_local, repo, "v1", 4).await;
    }
    let src = start_upstream(src_local, Duration::from_millis(20)).await;
    let dst = start_upstream(memory_registry(), Duration::ZERO).await;
    let config = SyncConfig {
        max_procs: 2,
        ..Default::default()
    };

    let synced = RegistrySync::new(config, CredentialMap::new())
        .with_platform(amd64())
        .sync_hosts(&src.host(), &dst.host(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(synced.len(), repos.len());
    // 4 repos x (config + 4 layers)
    assert_eq!(src.counters.blob_gets(), 20);
    assert!(
        src.counters.peak() <= 2,
        "peak {} exceeds the limit",
        src.counters.peak()
    );
}

#[tokio::test]
async fn test_copy_image_rewrites_host() {
    let src_local = memory_registry();
    let nginx = seed_list(&src_local, "library/nginx", "latest", 1).await;
    let src = start_upstream(src_local, Duration::ZERO).await;
    let dst = start_upstream(memory_registry(), Duration::ZERO).await;

    let copied = RegistrySync::new(SyncConfig::default(), CredentialMap::new())
        .with_platform(Platform::new("linux", "arm64"))
        .copy_image(
            &format!("{}/library/nginx:latest", src.host()),
            &format!("http://{}", dst.host()),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(copied, format!("{}/library/nginx:latest", dst.host()));
    assert_eq!(
        dst.local.tag_digest("library/nginx", "latest").await.unwrap(),
        Some(nginx.arm64.manifest)
    );
}

#[tokio::test]
async fn test_sync_saved_directory() {
    let upstream_local = memory_registry();
    let nginx = seed_list(&upstream_local, "library/nginx", "latest", 1).await;
    let upstream = start_upstream(upstream_local, Duration::ZERO).await;
    let dir = TempDir::new().unwrap();
    saver(5)
        .save_images(
            &[format!("{}/library/nginx:latest", upstream.host())],
            dir.path(),
            &amd64(),
        )
        .await
        .unwrap();

    let dst = start_upstream(memory_registry(), Duration::ZERO).await;
    let synced = RegistrySync::new(SyncConfig::default(), CredentialMap::new())
        .with_platform(amd64())
        .sync_local_dir(
            dir.path(),
            &[dst.host()],
            &DriverFactory::with_defaults(),
            &StorageConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(synced, vec![format!("{}/library/nginx:latest", dst.host())]);
    assert_eq!(
        dst.local.tag_digest("library/nginx", "latest").await.unwrap(),
        Some(nginx.amd64.manifest)
    );
}

#[tokio::test]
async fn test_sync_from_unreachable_source_copies_nothing() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);
    let dst = start_upstream(memory_registry(), Duration::ZERO).await;

    let result = RegistrySync::new(
        SyncConfig {
            probe_timeout_secs: 1,
            ..Default::default()
        },
        CredentialMap::new(),
    )
    .copy_image(
        &format!("{}/library/nginx:latest", dead),
        &dst.host(),
        &CancellationToken::new(),
    )
    .await;

    assert!(matches!(result, Err(RegistryError::ProbeFailure { .. })));
    assert_eq!(dst.counters.peak(), 0);
    assert!(dst.local.repositories().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_list_and_remove_over_http() {
    let upstream_local = memory_registry();
    seed_list(&upstream_local, "library/nginx", "latest", 1).await;
    let list = seed_list(&upstream_local, "library/nginx", "1.25", 1).await;
    seed_list(&upstream_local, "team/api", "v1", 1).await;
    let upstream = start_upstream(upstream_local, Duration::ZERO).await;
    let client = RemoteClient::connect(&upstream.server.url(), None, None, None)
        .await
        .unwrap();

    let images = list_images(&client, &Filter::validate("name=*nginx*").unwrap())
        .await
        .unwrap();
    assert_eq!(images, vec!["library/nginx:1.25", "library/nginx:latest"]);

    let removed = remove_image(&client, &format!("{}/library/nginx:1.25", upstream.host()))
        .await
        .unwrap();
    assert_eq!(removed, list.list);

    let images = list_images(&client, &Filter::default()).await.unwrap();
    assert_eq!(images, vec!["library/nginx:latest", "team/api:v1"]);
}
