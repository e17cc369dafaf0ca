//! Upload ingestion over the real gRPC stream: acceptance, rejection, and
//! the job records and sandbox launches that must (or must not) follow.


use std::sync::Arc;
use std::time::Duration;

use test_harness::{
    assert_eventually, download, shared_store, spawn_img_server, upload_bytes, upload_chunks,
    FakeRunner, PNG_SIGNATURE,
};

use imgflow::proto::TransferState;
use imgflow::store::{JobStatus, MetadataStore};

#[tokio::test]
async fn valid_png_upload_creates_owned_processing_record() {
    let store = shared_store();
    let node = spawn_img_server(18310, store.clone(), Arc::new(FakeRunner::with_running_polls(2))).await;

    let mut payload = PNG_SIGNATURE.to_vec();
    payload.extend_from_slice(b"image body bytes");
    let reply = upload_bytes(node.port, &payload).await;

    assert_ne!(reply.request_id, "ERROR");
    assert_eq!(reply.message, "RECEIVED");

    let record = store.get(&reply.request_id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Processing);
    assert_eq!(record.owner_address, node.address);
    assert_eq!(record.owner_port, node.port);
    assert_eq!(record.input_path, format!("input/in-{}.png", reply.request_id));
    assert_eq!(record.output_path, format!("output/out-{}.png", reply.request_id));
    assert!(record.sandbox_handle.is_some());

    // Uploaded bytes staged verbatim
    let staged = tokio::fs::read(node.volume.resolve(&record.input_path))
        .await
        .unwrap();
    assert_eq!(staged, payload);
}

#[tokio::test]
async fn invalid_upload_returns_sentinel_and_no_record() {
    let store = shared_store();
    let runner = Arc::new(FakeRunner::new());
    let node = spawn_img_server(18311, store.clone(), runner.clone()).await;

    let reply = upload_bytes(node.port, b"not an image at all").await;
    assert_eq!(reply.request_id, "ERROR");
    assert!(reply.message.contains("PNG/JPEG"));

    // No sandbox was launched and no watcher exists
    assert_eq!(runner.next_handle.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(node.watchers.is_empty().await);
}

#[tokio::test]
async fn short_stream_is_rejected_for_insufficient_data() {
    let store = shared_store();
    let node = spawn_img_server(18312, store.clone(), Arc::new(FakeRunner::new())).await;

    let reply = upload_bytes(node.port, &PNG_SIGNATURE[..5]).await;
    assert_eq!(reply.request_id, "ERROR");
    assert!(reply.message.contains("Insufficient data"));
}

#[tokio::test]
async fn chunked_upload_preserves_bytes_in_order() {
    let store = shared_store();
    let node = spawn_img_server(18313, store.clone(), Arc::new(FakeRunner::new())).await;

    // JPEG magic split across the first two chunks
    let chunks = vec![
        vec![0xFF],
        vec![0xD8, 0xFF, 0xE0],
        vec![0x00, 0x10, 0x4A, 0x46, 0x49, 0x46],
        b"trailing payload".to_vec(),
    ];
    let expected: Vec<u8> = chunks.iter().flatten().copied().collect();

    let reply = upload_chunks(node.port, chunks).await;
    assert_ne!(reply.request_id, "ERROR");

    let record = store.get(&reply.request_id).await.unwrap().unwrap();
    assert_eq!(record.input_path, format!("input/in-{}.jpg", reply.request_id));
    let staged = tokio::fs::read(node.volume.resolve(&record.input_path))
        .await
        .unwrap();
    assert_eq!(staged, expected);
}

#[tokio::test]
async fn failed_launch_marks_record_error_but_returns_id() {
    let store = shared_store();

    struct FailingRunner;
    #[tonic::async_trait]
    impl imgflow::sandbox::SandboxRunner for FailingRunner {
        async fn launch(
            &self,
            _spec: &imgflow::sandbox::LaunchSpec,
        ) -> imgflow::error::Result<String> {
            Err(imgflow::error::ImgflowError::Sandbox("engine down".to_string()))
        }
        async fn is_running(&self, _handle: &str) -> imgflow::error::Result<bool> {
            Ok(false)
        }
        async fn remove(&self, _handle: &str) -> imgflow::error::Result<()> {
            Ok(())
        }
    }

    let node = {
        // Local spawn with the failing runner
        use imgflow::config::SandboxConfig;
        use imgflow::imgserver::{ImageServiceImpl, Volume, WatcherSet};
        use imgflow::proto::image_service_server::ImageServiceServer;

        let dir = tempfile::tempdir().unwrap();
        let volume = Volume::new(dir.path());
        volume.ensure_dirs().await.unwrap();
        let service = ImageServiceImpl::new(
            "127.0.0.1".to_string(),
            18314,
            volume,
            store.clone(),
            Arc::new(FailingRunner),
            Arc::new(WatcherSet::new()),
            SandboxConfig::default(),
        );
        let addr = "127.0.0.1:18314".parse().unwrap();
        let handle = tokio::spawn(async move {
            let _ = tonic::transport::Server::builder()
                .add_service(ImageServiceServer::new(service))
                .serve(addr)
                .await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Keep the tempdir and task alive for the test body
        (dir, handle)
    };

    let reply = upload_bytes(18314, &PNG_SIGNATURE).await;
    assert_ne!(reply.request_id, "ERROR");
    assert!(reply.message.contains("Processing failed to start"));

    let record = store.get(&reply.request_id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Error);

    // Polling the job reports the terminal error
    let (data, status) = download(18314, &reply.request_id).await;
    assert!(data.is_empty());
    assert_eq!(status.state, TransferState::Error as i32);

    drop(node);
}

#[tokio::test]
async fn upload_then_completion_flips_status_within_poll_interval() {
    let store = shared_store();
    let node = spawn_img_server(18315, store.clone(), Arc::new(FakeRunner::new())).await;

    let reply = upload_bytes(node.port, &PNG_SIGNATURE).await;
    assert_ne!(reply.request_id, "ERROR");

    let store_for_wait = store.clone();
    let id = reply.request_id.clone();
    assert_eventually(
        || {
            let store = store_for_wait.clone();
            let id = id.clone();
            async move {
                store.get(&id).await.unwrap().map(|r| r.status) == Some(JobStatus::Done)
            }
        },
        Duration::from_secs(2),
        "completion watcher should mark the job done",
    )
    .await;
}
