#[cfg(test)]
mod tests {
    use std::{path::Path, sync::Arc, time::Duration};

    use anyhow::Result;
    use async_trait::async_trait;
    use blob_store::{
        memory::{Fault, MemoryBlobStore},
        BlobStorage,
        BlobStorageConfig,
        BlobStore,
        BlobStoreError,
        DiskStorageConfig,
        ObjectEntry,
        ObjectStream,
    };
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    use crate::{
        test_support::decode_archive_sorted,
        ArchiveConfig,
        ArchiveError,
        ArchiveSession,
        SessionState,
    };

    fn config(dir: &TempDir, max_concurrent_fetches: usize) -> ArchiveConfig {
        ArchiveConfig {
            temp_dir: dir.path().to_path_buf(),
            max_concurrent_fetches,
            max_concurrent_listings: 2,
            compression_level: 3,
        }
    }

    fn files_in(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..500 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    fn entry(path: &str, content: &str) -> (String, Vec<u8>) {
        (path.to_string(), content.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_archive_strips_root_prefix() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(MemoryBlobStore::new());
        store.insert("docs/a.txt", "hi");
        store.insert("docs/sub/b.txt", "yo");
        store.insert("other/c.txt", "not included");

        let session = ArchiveSession::new(store.clone(), config(&dir, 4));
        let state = session.subscribe();
        let artifact = session.run("docs/").await?;

        assert_eq!(*state.borrow(), SessionState::Done);
        assert_eq!(artifact.entry_count(), 2);
        let bytes = std::fs::read(artifact.path())?;
        assert_eq!(bytes.len() as u64, artifact.size());
        assert_eq!(
            decode_archive_sorted(&bytes),
            vec![entry("a.txt", "hi"), entry("sub/b.txt", "yo")]
        );
        assert_eq!(store.open_streams(), 0);

        let path = artifact.path().to_path_buf();
        drop(artifact);
        assert!(!path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_folder_makes_empty_archive() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(MemoryBlobStore::new());
        store.insert_folder("empty/");
        store.insert_folder("empty/nested/");
        store.insert_folder("empty/nested/deeper/");

        let artifact = ArchiveSession::new(store, config(&dir, 4))
            .run("empty/")
            .await?;
        assert_eq!(artifact.entry_count(), 0);
        assert!(decode_archive_sorted(&std::fs::read(artifact.path())?).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_prefix_fails_without_leftovers() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(MemoryBlobStore::new());
        store.insert("docs/a.txt", "hi");

        let session = ArchiveSession::new(store.clone(), config(&dir, 4));
        let state = session.subscribe();
        let err = session.run("missing/").await.unwrap_err();

        assert!(matches!(err, ArchiveError::NotFound(p) if p == "missing/"));
        assert_eq!(*state.borrow(), SessionState::Failed);
        assert_eq!(files_in(dir.path()), 0);
        assert_eq!(store.opened_streams(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_every_leaf_appears_exactly_once() -> Result<()> {
        let dir = tempfile::tempdir()?;
        // tiny chunks so every copy spans many reads
        let store = Arc::new(MemoryBlobStore::with_chunk_size(7));
        let mut expected = Vec::new();
        for i in 0..40 {
            let path = format!("{}/{}/file-{i}.bin", i % 3, i % 5);
            let content = format!("content of file {i} ").repeat(i + 1);
            store.insert(format!("root/{path}"), content.clone());
            expected.push((path, content.into_bytes()));
        }
        expected.sort();

        let artifact = ArchiveSession::new(store.clone(), config(&dir, 3))
            .run("root/")
            .await?;
        assert_eq!(artifact.entry_count(), 40);
        assert_eq!(
            decode_archive_sorted(&std::fs::read(artifact.path())?),
            expected
        );
        assert_eq!(store.opened_streams(), 40);
        assert_eq!(store.open_streams(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_fetch_cleans_up_everything() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(MemoryBlobStore::new());
        for i in 0..10 {
            store.insert(format!("docs/{i}.txt"), format!("file {i}"));
        }
        store.inject("docs/6.txt", Fault::Get);

        let session = ArchiveSession::new(store.clone(), config(&dir, 2));
        let state = session.subscribe();
        let err = session.run("docs/").await.unwrap_err();

        assert!(matches!(err, ArchiveError::Transport { key, .. } if key == "docs/6.txt"));
        assert_eq!(*state.borrow(), SessionState::Failed);
        assert_eq!(store.open_streams(), 0);
        assert_eq!(files_in(dir.path()), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_destroys_stalled_streams() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(MemoryBlobStore::with_chunk_size(1));
        store.insert("docs/a.bin", vec![1u8; 16]);
        store.insert("docs/b.bin", vec![2u8; 16]);
        store.insert("docs/c.bin", vec![3u8; 16]);
        store.inject("docs/a.bin", Fault::Stall);
        store.inject("docs/c.bin", Fault::Get);

        let err = ArchiveSession::new(store.clone(), config(&dir, 4))
            .run("docs/")
            .await
            .unwrap_err();

        assert!(matches!(err, ArchiveError::Transport { key, .. } if key == "docs/c.bin"));
        assert_eq!(store.open_streams(), 0);
        assert_eq!(files_in(dir.path()), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_read_failure_is_attributed_to_the_object() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(MemoryBlobStore::with_chunk_size(2));
        store.insert("docs/a.txt", "hello world");
        store.inject("docs/a.txt", Fault::Read);

        let err = ArchiveSession::new(store.clone(), config(&dir, 4))
            .run("docs/")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ArchiveError::Transport { ref key, source: BlobStoreError::Transport(_) } if key == "docs/a.txt"
        ));
        assert_eq!(store.open_streams(), 0);
        assert_eq!(files_in(dir.path()), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_caller_cancellation() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(MemoryBlobStore::with_chunk_size(1));
        store.insert("docs/slow.bin", vec![0u8; 32]);
        store.inject("docs/slow.bin", Fault::Stall);

        let cancel = CancellationToken::new();
        let session = ArchiveSession::new(store.clone(), config(&dir, 4));
        let mut state = session.subscribe();
        let running = tokio::spawn(session.run_with_cancellation("docs/", cancel.clone()));

        state
            .wait_for(|s| *s == SessionState::FetchingAndAssembling)
            .await?;
        cancel.cancel();

        let err = running.await?.unwrap_err();
        assert!(matches!(err, ArchiveError::Cancelled));
        assert_eq!(store.open_streams(), 0);
        assert_eq!(files_in(dir.path()), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_dropped_session_releases_everything() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(MemoryBlobStore::with_chunk_size(1));
        store.insert("docs/a.txt", "hi");
        store.insert("docs/slow.bin", vec![0u8; 32]);
        store.inject("docs/slow.bin", Fault::Stall);

        let session = ArchiveSession::new(store.clone(), config(&dir, 4));
        let mut state = session.subscribe();
        let running = tokio::spawn(session.run("docs/"));

        state
            .wait_for(|s| *s == SessionState::FetchingAndAssembling)
            .await?;
        assert!(eventually(|| store.open_streams() > 0).await);

        // the client went away
        running.abort();
        assert!(running.await.unwrap_err().is_cancelled());

        assert!(eventually(|| store.open_streams() == 0).await);
        assert!(eventually(|| files_in(dir.path()) == 0).await);
        Ok(())
    }

    #[tokio::test]
    async fn test_keys_naming_the_same_entry_fail_as_duplicates() -> Result<()> {
        for (first, second) in [
            ("docs/sub/b.txt", "docs/sub//b.txt"),
            ("docs/a.txt", "docs//a.txt"),
        ] {
            let dir = tempfile::tempdir()?;
            let store = Arc::new(MemoryBlobStore::new());
            store.insert(first, "yo");
            store.insert(second, "XX");

            let err = ArchiveSession::new(store.clone(), config(&dir, 4))
                .run("docs/")
                .await
                .unwrap_err();

            let expected = &first["docs/".len()..];
            assert!(
                matches!(&err, ArchiveError::DuplicateEntry(name) if name == expected),
                "{err:?}"
            );
            assert_eq!(store.open_streams(), 0);
            assert_eq!(files_in(dir.path()), 0);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_keys_tar_cannot_store_are_renamed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(MemoryBlobStore::new());
        store.insert("docs/a.txt", "hi");
        store.insert("docs/./a.txt", "XX");
        store.insert("docs//x.txt", "x");
        store.insert("docs/../up.txt", "up");

        let artifact = ArchiveSession::new(store.clone(), config(&dir, 4))
            .run("docs/")
            .await?;
        assert_eq!(artifact.entry_count(), 4);
        assert_eq!(
            decode_archive_sorted(&std::fs::read(artifact.path())?),
            vec![
                entry("%2E%2E/up.txt", "up"),
                entry("%2E/a.txt", "XX"),
                entry("a.txt", "hi"),
                entry("x.txt", "x"),
            ]
        );
        Ok(())
    }

    /// Lists an object that is gone by the time it is fetched.
    struct VanishingStore {
        inner: MemoryBlobStore,
    }

    #[async_trait]
    impl BlobStore for VanishingStore {
        async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectEntry>, BlobStoreError> {
            let mut entries = self.inner.list_objects(prefix).await?;
            if prefix == "docs/" {
                entries.push(ObjectEntry::object("docs/ghost.txt", 5));
            }
            Ok(entries)
        }

        async fn get_object_stream(&self, key: &str) -> Result<ObjectStream, BlobStoreError> {
            self.inner.get_object_stream(key).await
        }
    }

    #[tokio::test]
    async fn test_vanished_object_is_left_out() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let inner = MemoryBlobStore::new();
        inner.insert("docs/a.txt", "hi");

        let artifact = ArchiveSession::new(Arc::new(VanishingStore { inner }), config(&dir, 4))
            .run("docs/")
            .await?;
        assert_eq!(
            decode_archive_sorted(&std::fs::read(artifact.path())?),
            vec![entry("a.txt", "hi")]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_archive_from_disk_storage() -> Result<()> {
        let blobs = tempfile::tempdir()?;
        std::fs::create_dir_all(blobs.path().join("docs/sub"))?;
        std::fs::write(blobs.path().join("docs/a.txt"), "hi")?;
        std::fs::write(blobs.path().join("docs/sub/b.txt"), "yo")?;
        let storage = BlobStorage::new(&BlobStorageConfig {
            s3: None,
            disk: Some(DiskStorageConfig {
                path: blobs.path().to_string_lossy().to_string(),
            }),
        })?;

        let dir = tempfile::tempdir()?;
        let artifact = ArchiveSession::new(Arc::new(storage), config(&dir, 4))
            .run("docs/")
            .await?;
        assert_eq!(
            decode_archive_sorted(&std::fs::read(artifact.path())?),
            vec![entry("a.txt", "hi"), entry("sub/b.txt", "yo")]
        );
        Ok(())
    }
}
