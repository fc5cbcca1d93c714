//! Carve Manager Tests
//!
//! ## Test Scopes
//! - **Scheduling & init**: idempotent scheduling, node-scoped session minting.
//! - **Block accounting**: out-of-order, duplicate and concurrent blocks.
//! - **Archival**: local concatenation, zstd detection, S3 multipart copy.
//! - **Failure handling**: storage errors, archive errors and the TTL reaper.
//! - **S3 client**: SigV4 presigning and response parsing.

#[cfg(test)]
mod tests {
    use crate::carves::blocks::{BlockStore, DbBlockStore};
    use crate::carves::manager::{is_zstd, CarveManager};
    use crate::carves::s3::{
        archive_key, block_key, canonical_query, extract_tag, uri_encode, CompletedPart,
        ObjectStore, S3Client, S3Config,
    };
    use crate::carves::types::*;
    use crate::config::CarverKind;
    use crate::environments::types::EnvironmentId;
    use crate::error::{FleetError, FleetResult};
    use crate::nodes::types::{Node, NodeId};

    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    // ============================================================
    // Helpers
    // ============================================================

    /// In-memory object store recording every multipart call.
    #[derive(Default)]
    struct FakeObjectStore {
        objects: Mutex<HashMap<String, Vec<u8>>>,
        uploads: Mutex<HashMap<String, String>>,
        completed: Mutex<Vec<(String, Vec<CompletedPart>)>>,
        next_upload: AtomicU64,
        aborted: AtomicU64,
        fail_puts: AtomicBool,
        fail_copies: AtomicBool,
    }

    #[async_trait]
    impl ObjectStore for FakeObjectStore {
        fn bucket(&self) -> &str {
            "carves-bucket"
        }

        async fn put_object(&self, key: &str, body: Vec<u8>) -> FleetResult<()> {
            if self.fail_puts.load(Ordering::SeqCst) {
                return Err(FleetError::ObjectStore("put refused".to_string()));
            }
            self.objects.lock().await.insert(key.to_string(), body);
            Ok(())
        }

        async fn delete_object(&self, key: &str) -> FleetResult<()> {
            self.objects.lock().await.remove(key);
            Ok(())
        }

        async fn create_multipart_upload(&self, key: &str) -> FleetResult<String> {
            let id = format!("upload-{}", self.next_upload.fetch_add(1, Ordering::SeqCst));
            self.uploads.lock().await.insert(id.clone(), key.to_string());
            Ok(id)
        }

        async fn upload_part_copy(
            &self,
            _key: &str,
            upload_id: &str,
            part_number: u32,
            source_key: &str,
        ) -> FleetResult<String> {
            if self.fail_copies.load(Ordering::SeqCst) {
                return Err(FleetError::ObjectStore("copy refused".to_string()));
            }
            if !self.uploads.lock().await.contains_key(upload_id) {
                return Err(FleetError::ObjectStore("NoSuchUpload".to_string()));
            }
            if !self.objects.lock().await.contains_key(source_key) {
                return Err(FleetError::ObjectStore("NoSuchKey".to_string()));
            }
            Ok(format!("\"etag-{}\"", part_number))
        }

        async fn complete_multipart_upload(
            &self,
            key: &str,
            upload_id: &str,
            parts: &[CompletedPart],
        ) -> FleetResult<()> {
            self.uploads.lock().await.remove(upload_id);
            self.completed.lock().await.push((key.to_string(), parts.to_vec()));
            Ok(())
        }

        async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> FleetResult<()> {
            self.uploads.lock().await.remove(upload_id);
            self.aborted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn presign_get(&self, key: &str, expires: Duration) -> FleetResult<String> {
            Ok(format!("https://fake/{}?expires={}", key, expires.as_secs()))
        }
    }

    fn node(id: u64, uuid: &str) -> Node {
        Node {
            id: NodeId(id),
            uuid: uuid.to_string(),
            node_key: format!("key-{}", id),
            hostname: format!("host-{}", id),
            platform: "darwin".to_string(),
            environment: "prod".to_string(),
            environment_id: EnvironmentId(1),
            ip_address: "10.0.0.1".to_string(),
            osquery_version: "5.10.2".to_string(),
            enrolled_at: 0,
            last_seen: 0,
        }
    }

    fn carve_row(guid: &str, request: &str, path: &str) -> ScheduledCarve {
        ScheduledCarve {
            path: path.to_string(),
            carve_guid: guid.to_string(),
            request_id: request.to_string(),
            carve: "1".to_string(),
            size: "12".to_string(),
            ..Default::default()
        }
    }

    fn init(request: &str, blocks: u32) -> CarveInit {
        CarveInit {
            carve_id: String::new(),
            request_id: request.to_string(),
            block_count: blocks,
            block_size: 4,
            carve_size: 4 * blocks as u64,
        }
    }

    fn b64(bytes: &[u8]) -> String {
        STANDARD.encode(bytes)
    }

    /// Schedules and initialises one carve, returning its session id.
    fn started(manager: &CarveManager, blocks: u32) -> String {
        let n = node(1, "ABC");
        manager
            .schedule(&carve_row("guid-1", "carve_q", "/etc/passwd"), &n, "carve_q")
            .unwrap();
        manager.init_carve(&n, &init("carve_q", blocks)).unwrap()
    }

    fn db_manager(dir: &std::path::Path) -> CarveManager {
        CarveManager::new(CarverKind::Db, dir, None).unwrap()
    }

    // ============================================================
    // TEST 1: Scheduling and init
    // ============================================================

    #[test]
    fn test_schedule_is_idempotent_on_carve_guid() {
        let dir = tempfile::tempdir().unwrap();
        let manager = db_manager(dir.path());
        let n = node(1, "ABC");

        let first = manager.schedule(&carve_row("g", "carve_q", "/etc/hosts"), &n, "carve_q").unwrap();
        let second = manager.schedule(&carve_row("g", "carve_q", "/etc/hosts"), &n, "carve_q").unwrap();

        assert_eq!(first.carve_id, second.carve_id);
        assert_eq!(first.status, CarveStatus::Scheduled);
        assert_eq!(first.carve_size, 12);
        assert_eq!(manager.list_by_query("carve_q").len(), 1);
    }

    #[test]
    fn test_schedule_rejects_rows_that_are_not_carves() {
        let dir = tempfile::tempdir().unwrap();
        let manager = db_manager(dir.path());
        let mut row = carve_row("g", "carve_q", "/etc/hosts");
        row.carve = "0".to_string();

        let result = manager.schedule(&row, &node(1, "ABC"), "carve_q");

        assert!(matches!(result, Err(FleetError::Malformed(_))));
        assert!(manager.list().is_empty());
    }

    #[test]
    fn test_init_requires_matching_request_and_owning_node() {
        // ARRANGE
        let dir = tempfile::tempdir().unwrap();
        let manager = db_manager(dir.path());
        let owner = node(1, "ABC");
        manager
            .schedule(&carve_row("g", "carve_q", "/etc/hosts"), &owner, "carve_q")
            .unwrap();

        // ACT / ASSERT: wrong request, wrong node, empty carve
        assert!(manager.init_carve(&owner, &init("other", 2)).unwrap_err().is_not_found());
        assert!(manager
            .init_carve(&node(2, "XYZ"), &init("carve_q", 2))
            .unwrap_err()
            .is_not_found());
        assert!(matches!(
            manager.init_carve(&owner, &init("carve_q", 0)),
            Err(FleetError::Malformed(_))
        ));

        // ACT / ASSERT: the owner gets a session
        let session = manager.init_carve(&owner, &init(" carve_q ", 2)).unwrap();
        let carve = manager.get_by_session(&session).unwrap();
        assert_eq!(carve.total_blocks, 2);
        assert_eq!(carve.status, CarveStatus::Scheduled);
        assert!(!manager.completed(&session).unwrap());
    }

    // ============================================================
    // TEST 2: Block accounting
    // ============================================================

    #[tokio::test]
    async fn test_completion_after_all_distinct_blocks_in_any_order() {
        // ARRANGE
        let dir = tempfile::tempdir().unwrap();
        let manager = db_manager(dir.path());
        let session = started(&manager, 3);

        // ACT: out of order with a retried block
        let first = manager.ingest_block(&session, "carve_q", 2, &b64(b"ccc")).await.unwrap();
        assert_eq!(manager.get_by_session(&session).unwrap().status, CarveStatus::InProgress);
        let retry = manager.ingest_block(&session, "carve_q", 2, &b64(b"ccc")).await.unwrap();
        let middle = manager.ingest_block(&session, "carve_q", 0, &b64(b"aaa")).await.unwrap();
        assert!(!manager.completed(&session).unwrap());
        let last = manager.ingest_block(&session, "carve_q", 1, &b64(b"bbb")).await.unwrap();

        // ASSERT
        assert!(!first.completed && !first.transitioned);
        assert!(retry.duplicate && !retry.transitioned);
        assert!(!middle.completed);
        assert!(last.completed && last.transitioned);
        let carve = manager.get_by_session(&session).unwrap();
        assert_eq!(carve.completed_blocks, 3);
        assert_eq!(carve.status, CarveStatus::Completed);
        assert!(carve.completed_at.is_some());
        assert!(manager.completed(&session).unwrap());

        // Blocks after completion are refused rather than re-counted
        let late = manager.ingest_block(&session, "carve_q", 1, &b64(b"bbb")).await;
        assert!(matches!(late, Err(FleetError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_block_with_mismatched_request_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = db_manager(dir.path());
        let session = started(&manager, 2);

        let wrong = manager.ingest_block(&session, "carve_other", 0, &b64(b"x")).await;
        let unknown = manager.ingest_block("no-such-session", "carve_q", 0, &b64(b"x")).await;
        let padded = manager.ingest_block(&session, "  carve_q\n", 0, &b64(b"x")).await;

        assert!(wrong.unwrap_err().is_not_found());
        assert!(unknown.unwrap_err().is_not_found());
        assert!(padded.is_ok());
    }

    #[tokio::test]
    async fn test_out_of_range_or_undecodable_block_zero_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = db_manager(dir.path());
        let session = started(&manager, 2);

        let out_of_range = manager.ingest_block(&session, "carve_q", 2, &b64(b"x")).await;
        let garbage = manager.ingest_block(&session, "carve_q", 0, "%%not base64%%").await;

        assert!(matches!(out_of_range, Err(FleetError::Malformed(_))));
        assert!(matches!(garbage, Err(FleetError::Malformed(_))));
        assert_eq!(manager.get_by_session(&session).unwrap().completed_blocks, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_blocks_transition_exactly_once() {
        // ARRANGE
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(db_manager(dir.path()));
        let session = started(&manager, 64);

        // ACT
        let mut handles = Vec::new();
        for block_id in 0..64u32 {
            let manager = manager.clone();
            let session = session.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .ingest_block(&session, "carve_q", block_id, &b64(&[block_id as u8; 4]))
                    .await
                    .unwrap()
            }));
        }
        let mut transitions = 0;
        for handle in handles {
            if handle.await.unwrap().transitioned {
                transitions += 1;
            }
        }

        // ASSERT
        assert_eq!(transitions, 1);
        assert_eq!(manager.get_by_session(&session).unwrap().completed_blocks, 64);
    }

    // ============================================================
    // TEST 3: Local archival
    // ============================================================

    #[test]
    fn test_zstd_detection() {
        assert!(is_zstd(&b64(&[0x28, 0xB5, 0x2F, 0xFD, 0x00])).unwrap());
        assert!(!is_zstd(&b64(b"ustar")).unwrap());
        assert!(!is_zstd(&b64(&[0x28, 0xB5])).unwrap());
    }

    #[tokio::test]
    async fn test_archive_concatenates_in_block_order_as_tar() {
        // ARRANGE
        let dir = tempfile::tempdir().unwrap();
        let manager = db_manager(dir.path());
        let session = started(&manager, 3);
        for (id, chunk) in [(1u32, b"BBBB"), (2, b"CCCC"), (0, b"AAAA")] {
            manager.ingest_block(&session, "carve_q", id, &b64(chunk)).await.unwrap();
        }

        // ACT
        let result = manager.archive(&session).await.unwrap();

        // ASSERT
        let expected_path = dir.path().join(format!("{}.tar", session));
        assert_eq!(result.location, expected_path.to_string_lossy());
        assert_eq!(result.size, 12);
        assert_eq!(std::fs::read(&expected_path).unwrap(), b"AAAABBBBCCCC");
        let carve = manager.get_by_session(&session).unwrap();
        assert!(carve.archived);
        assert_eq!(carve.status, CarveStatus::Completed);
        assert_eq!(
            manager.download(&session).await.unwrap(),
            DownloadTarget::Local(expected_path)
        );
    }

    #[tokio::test]
    async fn test_zstd_block_zero_selects_tar_zst_extension() {
        let dir = tempfile::tempdir().unwrap();
        let manager = db_manager(dir.path());
        let session = started(&manager, 2);
        manager
            .ingest_block(&session, "carve_q", 0, &b64(&[0x28, 0xB5, 0x2F, 0xFD, 1, 2]))
            .await
            .unwrap();
        manager.ingest_block(&session, "carve_q", 1, &b64(&[3, 4])).await.unwrap();

        let result = manager.archive(&session).await.unwrap();

        assert!(result.location.ends_with(&format!("{}.tar.zst", session)));
        assert!(manager.get_by_session(&session).unwrap().compressed);
    }

    #[tokio::test]
    async fn test_archive_before_completion_leaves_status_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let manager = db_manager(dir.path());
        let session = started(&manager, 2);
        manager.ingest_block(&session, "carve_q", 0, &b64(b"AA")).await.unwrap();

        let result = manager.archive(&session).await;

        assert!(matches!(result, Err(FleetError::InvalidState(_))));
        let carve = manager.get_by_session(&session).unwrap();
        assert_eq!(carve.status, CarveStatus::InProgress);
        assert!(!carve.archived);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_archive_and_download_share_one_artifact() {
        // ARRANGE
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(db_manager(dir.path()));
        let session = started(&manager, 4);
        for id in 0..4u32 {
            manager
                .ingest_block(&session, "carve_q", id, &b64(&[b'a' + id as u8; 1024]))
                .await
                .unwrap();
        }

        // ACT: operators hitting archive and download at the same time
        let mut handles = Vec::new();
        for i in 0..16 {
            let manager = manager.clone();
            let session = session.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    manager.archive(&session).await.map(|r| r.size)
                } else {
                    manager.download(&session).await.map(|_| 4096)
                }
            }));
        }
        let mut sizes = Vec::new();
        for handle in handles {
            sizes.push(handle.await.unwrap().unwrap());
        }

        // ASSERT: every caller succeeded and no temporary file is left behind
        assert!(sizes.iter().all(|size| *size == 4096));
        let archive = dir.path().join(format!("{}.tar", session));
        assert_eq!(std::fs::metadata(&archive).unwrap().len(), 4096);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("partial"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_local_carver_stores_blocks_on_disk_and_delete_removes_them() {
        // ARRANGE
        let dir = tempfile::tempdir().unwrap();
        let manager = CarveManager::new(CarverKind::Local, dir.path(), None).unwrap();
        let session = started(&manager, 2);

        // ACT
        manager.ingest_block(&session, "carve_q", 0, &b64(b"hello ")).await.unwrap();
        manager.ingest_block(&session, "carve_q", 1, &b64(b"world")).await.unwrap();
        let block_dir = dir.path().join("blocks").join(&session);
        assert!(block_dir.join("0").exists());
        let result = manager.archive(&session).await.unwrap();

        // ASSERT
        assert_eq!(std::fs::read(&result.location).unwrap(), b"hello world");
        manager.delete("guid-1").await.unwrap();
        assert!(!block_dir.exists());
        assert!(manager.get_by_session(&session).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_db_block_store_replaces_retried_block() {
        let store = DbBlockStore::new();
        let dir = tempfile::tempdir().unwrap();
        let manager = db_manager(dir.path());
        let session = started(&manager, 1);
        let carve = manager.get_by_session(&session).unwrap();
        let block = |data: &str| CarvedBlock {
            session_id: session.clone(),
            request_id: "carve_q".to_string(),
            environment: "prod".to_string(),
            block_id: 0,
            data: data.to_string(),
            size: data.len(),
            object_key: None,
        };

        store.store(&carve, block("first")).await.unwrap();
        store.store(&carve, block("second")).await.unwrap();

        let loaded = store.load(&session).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].data, "second");
    }

    // ============================================================
    // TEST 4: S3 carver
    // ============================================================

    #[tokio::test]
    async fn test_s3_carver_uploads_blocks_and_archives_with_part_copy() {
        // ARRANGE
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeObjectStore::default());
        let manager = CarveManager::new(CarverKind::S3, dir.path(), Some(fake.clone())).unwrap();
        let session = started(&manager, 2);

        // ACT
        manager.ingest_block(&session, "carve_q", 1, &b64(b"tail")).await.unwrap();
        let done = manager.ingest_block(&session, "carve_q", 0, &b64(b"head")).await.unwrap();

        // ASSERT: blocks as objects
        assert!(done.transitioned);
        let objects = fake.objects.lock().await;
        assert_eq!(objects.get(&block_key("prod", "ABC", &session, 0)).unwrap(), b"head");
        assert_eq!(objects.get(&block_key("prod", "ABC", &session, 1)).unwrap(), b"tail");
        drop(objects);

        // ASSERT: archived automatically on completion
        let completed = fake.completed.lock().await;
        let expected_key = archive_key("prod", "ABC", &session, "/etc/passwd", ".tar");
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].0, format!("prod:ABC:{}:/etc/passwd.tar", session));
        assert_eq!(completed[0].0, expected_key);
        let numbers: Vec<u32> = completed[0].1.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2]);
        drop(completed);

        let carve = manager.get_by_session(&session).unwrap();
        assert!(carve.archived);
        assert_eq!(
            carve.archive_path.as_deref(),
            Some(format!("s3://carves-bucket/{}", expected_key).as_str())
        );
        assert_eq!(
            manager.download(&session).await.unwrap(),
            DownloadTarget::Redirect(format!("https://fake/{}?expires=300", expected_key))
        );
    }

    #[tokio::test]
    async fn test_s3_archive_failure_aborts_upload_and_keeps_status() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeObjectStore::default());
        fake.fail_copies.store(true, Ordering::SeqCst);
        let manager = CarveManager::new(CarverKind::S3, dir.path(), Some(fake.clone())).unwrap();
        let session = started(&manager, 1);

        let outcome = manager.ingest_block(&session, "carve_q", 0, &b64(b"only")).await.unwrap();

        assert!(outcome.transitioned);
        assert_eq!(fake.aborted.load(Ordering::SeqCst), 1);
        let carve = manager.get_by_session(&session).unwrap();
        assert_eq!(carve.status, CarveStatus::Completed);
        assert!(!carve.archived);
        assert!(manager.archive(&session).await.is_err());
    }

    #[tokio::test]
    async fn test_block_storage_failure_is_counted_but_not_stored() {
        // ARRANGE
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeObjectStore::default());
        let manager = CarveManager::new(CarverKind::S3, dir.path(), Some(fake.clone())).unwrap();
        let session = started(&manager, 2);

        // ACT
        fake.fail_puts.store(true, Ordering::SeqCst);
        manager.ingest_block(&session, "carve_q", 0, &b64(b"lost")).await.unwrap();
        fake.fail_puts.store(false, Ordering::SeqCst);
        let done = manager.ingest_block(&session, "carve_q", 1, &b64(b"kept")).await.unwrap();

        // ASSERT: the transfer completes; the archive only holds what was stored
        assert!(done.completed);
        let completed = fake.completed.lock().await;
        let numbers: Vec<u32> = completed[0].1.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![2]);
    }

    #[test]
    fn test_s3_carver_requires_object_store() {
        let dir = tempfile::tempdir().unwrap();

        assert!(CarveManager::new(CarverKind::S3, dir.path(), None).is_err());
    }

    // ============================================================
    // TEST 5: Reaper
    // ============================================================

    #[tokio::test]
    async fn test_reaper_fails_stalled_sessions_and_blocks_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let manager = db_manager(dir.path());
        let session = started(&manager, 2);
        manager.ingest_block(&session, "carve_q", 0, &b64(b"AA")).await.unwrap();

        assert!(manager.reap_stalled(Duration::from_secs(3600)).is_empty());
        std::thread::sleep(Duration::from_millis(5));
        let failed = manager.reap_stalled(Duration::ZERO);

        assert_eq!(failed, vec!["guid-1".to_string()]);
        assert_eq!(manager.get_by_session(&session).unwrap().status, CarveStatus::Failed);
        let late = manager.ingest_block(&session, "carve_q", 1, &b64(b"BB")).await;
        assert!(matches!(late, Err(FleetError::InvalidState(_))));
        // Terminal: a second sweep reports nothing new
        assert!(manager.reap_stalled(Duration::ZERO).is_empty());
    }

    // ============================================================
    // TEST 6: S3 REST client
    // ============================================================

    fn s3_client(endpoint: &str) -> S3Client {
        S3Client::new(S3Config {
            bucket: "carves".to_string(),
            region: "us-east-1".to_string(),
            endpoint: Some(endpoint.to_string()),
            access_key: "AKIDEXAMPLE".to_string(),
            secret_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_uri_encode_and_canonical_query() {
        assert_eq!(uri_encode("prod:ABC:s/etc/passwd.tar", false), "prod%3AABC%3As/etc/passwd.tar");
        assert_eq!(uri_encode("a/b c", true), "a%2Fb%20c");
        assert_eq!(
            canonical_query(&[("uploadId", "x y"), ("partNumber", "2")]),
            "partNumber=2&uploadId=x%20y"
        );
        assert_eq!(canonical_query(&[("uploads", "")]), "uploads=");
    }

    #[test]
    fn test_presigned_url_shape() {
        let client = s3_client("https://s3.example.com");
        let now = chrono::DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);

        let url = client.presign_at("prod:ABC:sess:/etc/passwd.tar", Duration::from_secs(300), now);

        assert!(url.starts_with("https://s3.example.com/carves/prod%3AABC%3Asess%3A/etc/passwd.tar?"));
        assert!(url.contains("X-Amz-Algorithm=AWS4-HMAC-SHA256"));
        assert!(url.contains("X-Amz-Credential=AKIDEXAMPLE%2F20240501%2Fus-east-1%2Fs3%2Faws4_request"));
        assert!(url.contains("X-Amz-Date=20240501T120000Z"));
        assert!(url.contains("X-Amz-Expires=300"));
        assert!(url.contains("X-Amz-SignedHeaders=host"));
        let signature = url.rsplit("X-Amz-Signature=").next().unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));

        // Deterministic for the same instant
        assert_eq!(url, client.presign_at("prod:ABC:sess:/etc/passwd.tar", Duration::from_secs(300), now));
    }

    #[test]
    fn test_extract_tag_unescapes_etag() {
        let xml = "<CopyPartResult><LastModified>x</LastModified><ETag>&quot;abc123&quot;</ETag></CopyPartResult>";

        assert_eq!(extract_tag(xml, "ETag").as_deref(), Some("\"abc123\""));
        assert_eq!(extract_tag(xml, "UploadId"), None);
    }

    #[tokio::test]
    async fn test_create_multipart_upload_parses_upload_id() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // ARRANGE: one-shot HTTP responder
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let mut request = Vec::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                if n == 0 || request.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let body = "<InitiateMultipartUploadResult><Bucket>carves</Bucket><UploadId>VXBsb2FkSUQ</UploadId></InitiateMultipartUploadResult>";
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });
        let client = s3_client(&format!("http://{}", addr));

        // ACT
        let upload_id = client.create_multipart_upload("prod:ABC:s:/tmp/x.tar").await.unwrap();

        // ASSERT
        assert_eq!(upload_id, "VXBsb2FkSUQ");
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /carves/prod%3AABC%3As%3A/tmp/x.tar?uploads= HTTP/1.1"));
        assert!(request.to_ascii_lowercase().contains("authorization: aws4-hmac-sha256 credential=akidexample/"));
    }
}
