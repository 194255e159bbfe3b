mod common;

use common::{config_with_token, StubProvider};
use medgemma_worker::config::RuntimeSettings;
use medgemma_worker::job::{Job, MISSING_PROMPT};
use medgemma_worker::worker::{
    select_source, HttpJobQueue, HttpQueueConfig, JobPoll, LocalJobSource, WorkerStats,
};
use medgemma_worker::{Error, InferenceService, JobResult, JobSource, Worker};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn service(token_env: &str) -> Arc<InferenceService> {
    Arc::new(InferenceService::new(
        Arc::new(StubProvider::new()),
        &config_with_token(token_env),
    ))
}

#[tokio::test]
async fn test_local_job_runs_once_and_stops() {
    let source = LocalJobSource::new(Job {
        id: "local_test".to_string(),
        input: json!({"prompt": "headache causes"}),
    })
    .quiet();
    let worker = Worker::new(
        service("MEDGEMMA_TEST_TOKEN_WORKER_LOCAL"),
        Box::new(source),
        Duration::from_millis(10),
    );

    let stats = worker.run(std::future::pending()).await;

    assert_eq!(
        stats,
        WorkerStats {
            jobs_processed: 1,
            jobs_failed: 0
        }
    );
}

#[tokio::test]
async fn test_failed_job_is_counted() {
    let source = LocalJobSource::from_json(r#"{"input": {}}"#).unwrap().quiet();
    let worker = Worker::new(
        service("MEDGEMMA_TEST_TOKEN_WORKER_FAILED"),
        Box::new(source),
        Duration::from_millis(10),
    );

    let stats = worker.run(std::future::pending()).await;
    assert_eq!(stats.jobs_processed, 1);
    assert_eq!(stats.jobs_failed, 1);
}

#[test]
fn test_select_source_prefers_test_input() {
    let source = select_source(Some(r#"{"input": {"prompt": "p"}}"#), &RuntimeSettings::default());
    assert!(source.is_ok());

    let err = select_source(Some(r#"{"prompt": "p"}"#), &RuntimeSettings::default())
        .err()
        .unwrap();
    assert!(matches!(err, Error::ValidationError(_)));
}

#[test]
fn test_select_source_without_any_source() {
    if std::env::var("RUNPOD_WEBHOOK_GET_JOB").is_ok() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let settings = RuntimeSettings {
        test_input_path: dir.path().join("test_input.json"),
        ..RuntimeSettings::default()
    };

    let err = select_source(None, &settings).err().unwrap();
    assert!(matches!(err, Error::ConfigurationError(_)));
}

#[test]
fn test_select_source_reads_test_input_file() {
    if std::env::var("RUNPOD_WEBHOOK_GET_JOB").is_ok() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test_input.json");
    std::fs::write(&path, r#"{"input": {"prompt": "What is hypertension?"}}"#).unwrap();
    let settings = RuntimeSettings {
        test_input_path: path,
        ..RuntimeSettings::default()
    };

    assert!(select_source(None, &settings).is_ok());
}

/// A request seen by the fake queue
#[derive(Debug, Clone)]
struct Recorded {
    method: String,
    path: String,
    authorization: Option<String>,
    body: Vec<u8>,
}

/// Minimal HTTP/1.1 queue: answers job-take requests from a script, then 204
struct FakeQueue {
    jobs: Mutex<VecDeque<Value>>,
    requests: Mutex<Vec<Recorded>>,
}

impl FakeQueue {
    async fn start(jobs: Vec<Value>) -> (Arc<Self>, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());
        let queue = Arc::new(Self {
            jobs: Mutex::new(jobs.into()),
            requests: Mutex::new(Vec::new()),
        });

        let server = Arc::clone(&queue);
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let server = Arc::clone(&server);
                tokio::spawn(async move { server.serve(stream).await });
            }
        });

        (queue, address)
    }

    async fn serve(&self, mut stream: TcpStream) {
        loop {
            let request = match read_request(&mut stream).await {
                Some(request) => request,
                None => return,
            };
            self.requests.lock().push(request.clone());

            let response = if request.method == "GET" && request.path.starts_with("/job-take/") {
                match self.jobs.lock().pop_front() {
                    Some(job) => {
                        let body = job.to_string();
                        format!(
                            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    }
                    None => "HTTP/1.1 204 No Content\r\n\r\n".to_string(),
                }
            } else if request.method == "POST" && request.path.starts_with("/job-done/") {
                "HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n".to_string()
            } else {
                "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n".to_string()
            };

            if stream.write_all(response.as_bytes()).await.is_err() {
                return;
            }
        }
    }

    fn posted(&self) -> Vec<Recorded> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.method == "POST")
            .cloned()
            .collect()
    }
}

async fn read_request(stream: &mut TcpStream) -> Option<Recorded> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buffer.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();

    let mut content_length = 0;
    let mut authorization = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            match name.trim().to_ascii_lowercase().as_str() {
                "content-length" => content_length = value.trim().parse().unwrap_or(0),
                "authorization" => authorization = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }

    let mut body = buffer[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    Some(Recorded {
        method,
        path,
        authorization,
        body,
    })
}

fn queue_config(address: &str) -> HttpQueueConfig {
    HttpQueueConfig {
        get_job_url: format!("{}/job-take/$ID", address),
        post_output_url: format!("{}/job-done/pod-7/$ID", address),
        ping_url: None,
        api_key: Some("queue-secret".to_string()),
        pod_id: Some("pod-7".to_string()),
        ping_interval: Duration::from_secs(10),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_http_queue_round_trip() {
    let (queue, address) = FakeQueue::start(vec![
        json!({"id": "job-1", "input": {"prompt": "headache causes"}}),
        json!({"id": "job-2", "input": {"prompt": ""}}),
    ])
    .await;

    let source = HttpJobQueue::new(queue_config(&address)).unwrap();
    let worker = Worker::new(
        service("MEDGEMMA_TEST_TOKEN_WORKER_HTTP"),
        Box::new(source),
        Duration::from_millis(20),
    );

    let waiter = Arc::clone(&queue);
    let shutdown = async move {
        while waiter.posted().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    let stats = tokio::time::timeout(Duration::from_secs(10), worker.run(shutdown))
        .await
        .expect("worker did not stop");

    assert_eq!(stats.jobs_processed, 2);
    assert_eq!(stats.jobs_failed, 1);

    let posted = queue.posted();
    assert_eq!(posted.len(), 2);

    assert_eq!(posted[0].path, "/job-done/pod-7/job-1");
    let body: Value = serde_json::from_slice(&posted[0].body).unwrap();
    assert_eq!(body, json!({"output": {"status": "success", "output": "[gen]"}}));

    assert_eq!(posted[1].path, "/job-done/pod-7/job-2");
    let body: Value = serde_json::from_slice(&posted[1].body).unwrap();
    assert_eq!(
        body,
        json!({"output": {"status": "error", "error": MISSING_PROMPT}, "error": MISSING_PROMPT})
    );

    let requests = queue.requests.lock().clone();
    assert!(requests
        .iter()
        .filter(|r| r.method == "GET")
        .all(|r| r.path == "/job-take/pod-7"));
    assert!(requests
        .iter()
        .all(|r| r.authorization.as_deref() == Some("queue-secret")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_idle_queue_stops_on_shutdown() {
    let (queue, address) = FakeQueue::start(Vec::new()).await;
    let source = HttpJobQueue::new(queue_config(&address)).unwrap();
    let worker = Worker::new(
        service("MEDGEMMA_TEST_TOKEN_WORKER_IDLE"),
        Box::new(source),
        Duration::from_millis(10),
    );

    let stats = tokio::time::timeout(
        Duration::from_secs(10),
        worker.run(tokio::time::sleep(Duration::from_millis(100))),
    )
    .await
    .expect("worker did not stop");

    assert_eq!(stats, WorkerStats::default());
    assert!(queue.posted().is_empty());
    assert!(!queue.requests.lock().is_empty());
}

#[tokio::test]
async fn test_unreachable_queue_is_retried_until_shutdown() {
    // Bind then drop to get a port nothing listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let source = HttpJobQueue::new(queue_config(&address)).unwrap();
    let worker = Worker::new(
        service("MEDGEMMA_TEST_TOKEN_WORKER_UNREACHABLE"),
        Box::new(source),
        Duration::from_millis(10),
    );

    let stats = tokio::time::timeout(
        Duration::from_secs(10),
        worker.run(tokio::time::sleep(Duration::from_millis(100))),
    )
    .await
    .expect("worker did not stop");
    assert_eq!(stats.jobs_processed, 0);
}

#[tokio::test]
async fn test_local_result_matches_queue_format() {
    let source = Arc::new(
        LocalJobSource::from_json(r#"{"input": {"prompt": "headache causes"}}"#)
            .unwrap()
            .quiet(),
    );
    let service = service("MEDGEMMA_TEST_TOKEN_WORKER_FORMAT");

    let job = Job {
        id: "local_test".to_string(),
        input: json!({"prompt": "headache causes"}),
    };
    let result = service.handle(&job.input).await;
    source.complete(&job, &result)
        .await
        .unwrap();

    assert_eq!(source.results(), vec![("local_test".to_string(), JobResult::success("[gen]"))]);
}

/// Source whose single job request takes `delay` to answer
struct SlowSource {
    job: Mutex<Option<Job>>,
    delay: Duration,
    delivered: Mutex<Vec<(String, JobResult)>>,
}

impl SlowSource {
    fn new(delay: Duration) -> Self {
        Self {
            job: Mutex::new(Some(Job {
                id: "in-flight".to_string(),
                input: json!({"prompt": "headache causes"}),
            })),
            delay,
            delivered: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl JobSource for SlowSource {
    async fn next_job(&self) -> medgemma_worker::Result<JobPoll> {
        tokio::time::sleep(self.delay).await;
        Ok(match self.job.lock().take() {
            Some(job) => JobPoll::Ready(job),
            None => JobPoll::Idle,
        })
    }

    async fn complete(&self, job: &Job, result: &JobResult) -> medgemma_worker::Result<()> {
        self.delivered.lock().push((job.id.clone(), result.clone()));
        Ok(())
    }
}

/// Delegates to a shared source so the test can inspect it after the worker is gone
struct Shared(Arc<SlowSource>);

#[async_trait::async_trait]
impl JobSource for Shared {
    async fn next_job(&self) -> medgemma_worker::Result<JobPoll> {
        self.0.next_job().await
    }

    async fn complete(&self, job: &Job, result: &JobResult) -> medgemma_worker::Result<()> {
        self.0.complete(job, result).await
    }
}

#[tokio::test]
async fn test_job_taken_during_shutdown_is_still_delivered() {
    let source = Arc::new(SlowSource::new(Duration::from_millis(100)));
    let worker = Worker::new(
        service("MEDGEMMA_TEST_TOKEN_WORKER_GRACE"),
        Box::new(Shared(Arc::clone(&source))),
        Duration::from_millis(10),
    )
    .with_shutdown_grace(Duration::from_secs(5));

    let stats = tokio::time::timeout(Duration::from_secs(10), worker.run(std::future::ready(())))
        .await
        .expect("worker did not stop");

    assert_eq!(stats.jobs_processed, 1);
    assert_eq!(
        source.delivered.lock().clone(),
        vec![("in-flight".to_string(), JobResult::success("[gen]"))]
    );
}

#[tokio::test]
async fn test_job_request_abandoned_after_grace_period() {
    let source = Arc::new(SlowSource::new(Duration::from_secs(5)));
    let worker = Worker::new(
        service("MEDGEMMA_TEST_TOKEN_WORKER_NO_GRACE"),
        Box::new(Shared(Arc::clone(&source))),
        Duration::from_millis(10),
    )
    .with_shutdown_grace(Duration::from_millis(20));

    let stats = tokio::time::timeout(Duration::from_secs(2), worker.run(std::future::ready(())))
        .await
        .expect("worker did not stop");

    assert_eq!(stats, WorkerStats::default());
    assert!(source.delivered.lock().is_empty());
}
