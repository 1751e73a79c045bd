//! Redis-backed queue integration tests. Run with `--ignored` against a
//! live Redis.

use std::sync::Arc;
use std::time::Duration;

use vdoc_models::UploadId;
use vdoc_queue::{JobQueue, OcrBatchJob, ProcessUploadJob, StatusChannel, WorkerJob};

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_connection() {
    dotenvy::dotenv().ok();

    let queue = JobQueue::from_env().expect("Failed to create queue");
    queue.init().await.expect("Failed to initialize queue");

    let len = queue.len().await.expect("Failed to get queue length");
    println!("Queue length: {}", len);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_job_enqueue_dequeue() {
    dotenvy::dotenv().ok();

    let queue = JobQueue::from_env().expect("Failed to create queue");
    queue.init().await.expect("Failed to initialize queue");

    let job = ProcessUploadJob::new(UploadId::new(), "test_user_123", "uploads/test.mp4");
    let job_id = job.job_id.clone();

    let message_id = queue.enqueue_process(job).await.expect("Failed to enqueue");
    println!("Enqueued job {} with message ID {}", job_id, message_id);

    let jobs = queue
        .consume("test-consumer", 1000, 1)
        .await
        .expect("Failed to consume");

    assert_eq!(jobs.len(), 1);
    let (msg_id, consumed_job) = &jobs[0];
    assert_eq!(consumed_job.job_id(), &job_id);

    queue.ack(msg_id).await.expect("Failed to ack");
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_duplicate_enqueue_rejected() {
    dotenvy::dotenv().ok();

    let queue = JobQueue::from_env().expect("Failed to create queue");
    queue.init().await.expect("Failed to initialize queue");

    let upload_id = UploadId::new();
    let first = ProcessUploadJob::new(upload_id.clone(), "dedup_user", "uploads/dup.mp4");
    let second = ProcessUploadJob::new(upload_id, "dedup_user", "uploads/dup.mp4");

    queue
        .enqueue_process(first)
        .await
        .expect("First enqueue should succeed");
    let err = queue
        .enqueue_process(second)
        .await
        .expect_err("Second enqueue should be rejected");
    assert!(err.is_duplicate());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_dlq() {
    dotenvy::dotenv().ok();

    let queue = JobQueue::from_env().expect("Failed to create queue");
    queue.init().await.expect("Failed to initialize queue");

    let job = OcrBatchJob::new(UploadId::new(), "test_dlq_user", 0, 1);
    let message_id = queue
        .enqueue_ocr_batch(job.clone())
        .await
        .expect("Failed to enqueue");

    let jobs = queue
        .consume("test-dlq-consumer", 1000, 1)
        .await
        .expect("Failed to consume");
    assert!(!jobs.is_empty());

    let worker_job = WorkerJob::OcrBatch(job);
    queue
        .dlq(&message_id, &worker_job, "Test error")
        .await
        .expect("Failed to move to DLQ");

    let dlq_len = queue.dlq_len().await.expect("Failed to get DLQ length");
    assert!(dlq_len > 0);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_scheduled_promotion() {
    dotenvy::dotenv().ok();

    let queue = JobQueue::from_env().expect("Failed to create queue");
    queue.init().await.expect("Failed to initialize queue");

    let job = WorkerJob::OcrBatch(OcrBatchJob::new(UploadId::new(), "sched_user", 0, 2));
    queue
        .enqueue_delayed(job, Duration::from_millis(50))
        .await
        .expect("Failed to schedule");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let promoted = queue.promote_due().await.expect("Failed to promote");
    assert!(promoted >= 1);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_status_channel_pubsub() {
    use futures_util::StreamExt;

    dotenvy::dotenv().ok();

    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let status = Arc::new(StatusChannel::new(&redis_url).expect("Failed to create status channel"));

    let upload_id = UploadId::new();

    let subscriber_status = Arc::clone(&status);
    let subscriber_upload = upload_id.clone();
    let subscriber = tokio::spawn(async move {
        let mut stream = subscriber_status
            .subscribe(&subscriber_upload)
            .await
            .expect("Failed to subscribe");
        let mut updates = Vec::new();

        let timeout = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(update) = stream.next().await {
                updates.push(update);
                if updates.len() >= 2 {
                    break;
                }
            }
        });
        let _ = timeout.await;
        updates
    });

    // Give the subscriber time to connect.
    tokio::time::sleep(Duration::from_millis(100)).await;

    status
        .publish(&vdoc_queue::ProgressUpdate {
            upload_id: upload_id.clone(),
            percent: 50,
            stage: "ocr".to_string(),
            message: None,
        })
        .await
        .ok();
    status.done(&upload_id).await.ok();

    let updates = subscriber.await.expect("Subscriber task failed");
    println!("Received {} updates", updates.len());
}
