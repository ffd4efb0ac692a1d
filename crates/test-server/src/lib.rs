use key_dispenser_core::{Config, DeliveryResponse, Eligibility};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use tokio::time::sleep;

pub use key_dispenser_core::api::ACCESS_KEY_HEADER;

pub const ENTRY_PATH: &str = "/example";
pub const PAYLOAD_PATH: &str = "/script";
pub const PAYLOAD: &str = "print('hello from the protected payload')\n";

/// Knobs for one test server. Every server gets its own workspace, so tests
/// never share a key pool.
#[derive(Debug, Clone)]
pub struct TestOptions {
    pub keys: Vec<String>,
    pub eligibility: Eligibility,
    pub trust_forwarded_for: bool,
    pub token_ttl_secs: u64,
    pub key_retention_secs: u64,
    /// `None` leaves the payload file missing
    pub payload: Option<String>,
    pub webhook_url: Option<String>,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            keys: ["K1", "K2", "K3"].map(String::from).to_vec(),
            eligibility: Eligibility::Address,
            trust_forwarded_for: true,
            token_ttl_secs: 300,
            key_retention_secs: 600,
            payload: Some(PAYLOAD.to_string()),
            webhook_url: None,
        }
    }
}

/// Test harness that runs the service on its own thread and runtime
pub struct TestServer {
    _handle: JoinHandle<()>,
    shutdown: Option<oneshot::Sender<()>>,
    e_port: u16,
    i_port: u16,
    workspace: PathBuf,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(TestOptions::default()).await
    }

    pub async fn start_with(options: TestOptions) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();

        // Find an available port
        let e_port = portpicker::pick_unused_port().expect("No available port");
        let i_port = portpicker::pick_unused_port().expect("No available port");

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis();
        let workspace = PathBuf::from(format!("/tmp/key-dispenser-test-{now}-{e_port}"));

        let _ = tokio::fs::remove_dir_all(&workspace).await;
        tokio::fs::create_dir_all(&workspace).await.unwrap();
        tokio::fs::write(workspace.join("keys.txt"), options.keys.join("\n"))
            .await
            .unwrap();
        if let Some(payload) = &options.payload {
            tokio::fs::write(workspace.join("payload.txt"), payload)
                .await
                .unwrap();
        }

        let config = Config {
            listen_on_port: e_port,
            internal_port: i_port,
            workspace: workspace.display().to_string(),
            entry_path: ENTRY_PATH.to_string(),
            payload_path: PAYLOAD_PATH.to_string(),
            token_ttl_secs: options.token_ttl_secs,
            key_retention_secs: options.key_retention_secs,
            eligibility: options.eligibility,
            trust_forwarded_for: options.trust_forwarded_for,
            webhook_url: options.webhook_url.clone(),
            ..Default::default()
        };
        config.validate().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        // Spawn the server in a separate thread with its own runtime
        let handle = std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async move {
                let shutdown = async {
                    let _ = shutdown_rx.await;
                };
                if let Err(error) = key_dispenser_core::run_until(config, shutdown).await {
                    eprintln!("test server exited with error: {error:?}");
                }
            });
        });

        let server = TestServer {
            _handle: handle,
            shutdown: Some(shutdown_tx),
            e_port,
            i_port,
            workspace,
        };

        // Poll until server is ready
        let client = server.client();
        for _ in 0..200 {
            if let Ok(response) = client
                .get(format!("{}/stats", server.int_url()))
                .send()
                .await
                && response.status().is_success()
            {
                break;
            }

            sleep(Duration::from_millis(10)).await;
        }

        server
    }

    pub fn int_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.i_port)
    }

    pub fn ext_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.e_port)
    }

    pub fn workspace(&self) -> &Path {
        self.workspace.as_path()
    }

    /// Client that never follows redirects, so tests can inspect them.
    pub fn client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap()
    }

    /// Hit the entry point as `client_ip`.
    pub async fn request_key(&self, client: &reqwest::Client, client_ip: &str) -> reqwest::Response {
        client
            .get(format!("{}{ENTRY_PATH}", self.ext_url()))
            .header("X-Forwarded-For", client_ip)
            .send()
            .await
            .unwrap()
    }

    /// GET a server-relative location, such as a delivery link.
    pub async fn get(&self, client: &reqwest::Client, location: &str) -> reqwest::Response {
        client
            .get(format!("{}{location}", self.ext_url()))
            .send()
            .await
            .unwrap()
    }

    /// Request a key as `client_ip` and return the delivery location.
    pub async fn issue_link(&self, client: &reqwest::Client, client_ip: &str) -> String {
        let response = self.request_key(client, client_ip).await;
        assert_eq!(response.status(), 302, "entry point did not redirect");
        response
            .headers()
            .get("location")
            .expect("redirect without location")
            .to_str()
            .unwrap()
            .to_string()
    }

    /// Request a key as `client_ip`, open its link, and return the delivery.
    pub async fn claim_key(&self, client: &reqwest::Client, client_ip: &str) -> DeliveryResponse {
        let location = self.issue_link(client, client_ip).await;
        let response = self.get(client, &location).await;
        assert_eq!(response.status(), 200, "delivery link failed");
        response.json().await.unwrap()
    }

    pub async fn consume(
        &self,
        client: &reqwest::Client,
        consume_url: &str,
        nonce: &str,
    ) -> reqwest::Response {
        client
            .post(format!("{}{consume_url}", self.ext_url()))
            .json(&serde_json::json!({ "nonce": nonce }))
            .send()
            .await
            .unwrap()
    }

    /// Fetch the payload with `key` in the query, as `client_ip`.
    pub async fn get_payload(
        &self,
        client: &reqwest::Client,
        key: Option<&str>,
        client_ip: &str,
    ) -> reqwest::Response {
        let mut request = client
            .get(format!("{}{PAYLOAD_PATH}", self.ext_url()))
            .header("X-Forwarded-For", client_ip);
        if let Some(key) = key {
            request = request.query(&[("key", key)]);
        }
        request.send().await.unwrap()
    }

    pub async fn stats(&self, client: &reqwest::Client) -> serde_json::Value {
        client
            .get(format!("{}/stats", self.int_url()))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Extract the nonce from a `/k/<slug>?t=<nonce>` location.
pub fn nonce_of(location: &str) -> &str {
    location
        .split_once("?t=")
        .map(|(_, nonce)| nonce)
        .expect("location without nonce")
}

/// Mock webhook server for testing webhook callbacks
pub struct MockWebhook {
    server_handle: tokio::task::JoinHandle<()>,
    pub port: u16,
    pub received_calls: std::sync::Arc<tokio::sync::Mutex<Vec<serde_json::Value>>>,
}

impl MockWebhook {
    pub async fn start() -> Self {
        let port = portpicker::pick_unused_port().expect("No available port for webhook");
        let received_calls = std::sync::Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let received_calls_clone = received_calls.clone();

        let server_handle = tokio::spawn(async move {
            use warp::Filter;

            let webhook = warp::path("webhook")
                .and(warp::post())
                .and(warp::body::json())
                .then(move |body: serde_json::Value| {
                    let received_calls = received_calls_clone.clone();
                    async move {
                        received_calls.lock().await.push(body);
                        warp::reply::with_status("OK", warp::http::StatusCode::OK)
                    }
                });

            warp::serve(webhook).run(([127, 0, 0, 1], port)).await;
        });

        // Wait a bit for server to start
        sleep(Duration::from_millis(100)).await;

        MockWebhook {
            server_handle,
            port,
            received_calls,
        }
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}/webhook", self.port)
    }

    pub async fn get_calls(&self) -> Vec<serde_json::Value> {
        self.received_calls.lock().await.clone()
    }

    pub async fn wait_for_calls(&self, expected_count: usize, timeout_secs: u64) -> bool {
        let start = std::time::Instant::now();

        while start.elapsed() < Duration::from_secs(timeout_secs) {
            if self.received_calls.lock().await.len() >= expected_count {
                return true;
            }
            sleep(Duration::from_millis(50)).await;
        }
        false
    }
}

impl Drop for MockWebhook {
    fn drop(&mut self) {
        self.server_handle.abort();
    }
}
