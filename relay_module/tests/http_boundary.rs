mod test_support;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use relay_module::service::{
    serve, ServiceConfig, DEFAULT_BODY_MAX_BYTES, DEFAULT_MESSAGE_MAX_BYTES, DEFAULT_RELAY_NAME,
};
use relay_module::{RateSettings, TimeZoneSetting};
use send_notifications_module::{EmailAddress, OversizePolicy, SmtpSettings};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use test_support::{RecordingTransport, RelayBuilder, OWNER_ADDRESS, RELAY_ADDRESS};

fn config() -> ServiceConfig {
    ServiceConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        debug: true,
        name: DEFAULT_RELAY_NAME.to_string(),
        web_url: String::new(),
        allowed_origins: vec!["https://example.com".to_string()],
        trust_proxy_headers: false,
        inbound_token: None,
        body_max_bytes: DEFAULT_BODY_MAX_BYTES,
        message_max_bytes: DEFAULT_MESSAGE_MAX_BYTES,
        webhook_url: None,
        webhook_upload_url: None,
        webhook_oversize: OversizePolicy::File,
        smtp: SmtpSettings {
            address: String::new(),
            user: String::new(),
            password: String::new(),
            helo: String::new(),
            timeout: Duration::from_secs(5),
        },
        notice_list: vec![EmailAddress::bare(OWNER_ADDRESS)],
        recipient_list: vec![EmailAddress::bare(RELAY_ADDRESS)],
        sqlite_path: None,
        time_zone: TimeZoneSetting::Utc,
        rate: RateSettings::default(),
        rate_sweep_interval: Duration::from_secs(60),
        mailbox_poll_interval: Duration::from_millis(50),
        mailbox_idle_interval: Duration::from_millis(200),
        shutdown_grace: Duration::from_secs(5),
    }
}

struct Running {
    base: String,
    transport: Arc<RecordingTransport>,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<()>,
}

impl Running {
    async fn start() -> Self {
        Self::start_with(config()).await
    }

    async fn start_with(config: ServiceConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr: SocketAddr = listener.local_addr().expect("local addr");
        let transport = Arc::new(RecordingTransport::default());
        let relay = RelayBuilder::new().transport(transport.clone()).build();
        let (shutdown, signal) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            serve(listener, Arc::new(config), relay, async move {
                let _ = signal.await;
            })
            .await
            .expect("serve");
        });
        Self {
            base: format!("http://{}", addr),
            transport,
            shutdown,
            server,
        }
    }

    async fn stop(self) -> Arc<RecordingTransport> {
        let _ = self.shutdown.send(());
        self.server.await.expect("server task");
        self.transport
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn accepts_submission_from_allowed_origin() {
    let running = Running::start().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/message", running.base))
        .header("Origin", "https://example.com")
        .json(&serde_json::json!({ "name": "小明", "message": "你好世界" }))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["code"], 1);
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "留言成功！");
    assert!(body.get("event_id").is_none());

    let transport = running.stop().await;
    assert_eq!(transport.count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn refuses_missing_or_unknown_origin() {
    let running = Running::start().await;
    let client = reqwest::Client::new();

    let missing = client
        .post(format!("{}/", running.base))
        .body(r#"{"message":"hi"}"#)
        .send()
        .await
        .expect("request");
    assert_eq!(missing.status(), 403);

    let unknown = client
        .post(format!("{}/message/", running.base))
        .header("Origin", "https://evil.example")
        .body(r#"{"message":"hi"}"#)
        .send()
        .await
        .expect("request");
    assert_eq!(unknown.status(), 403);

    let transport = running.stop().await;
    assert_eq!(transport.count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_body_reports_bad_request_code() {
    let running = Running::start().await;
    let response = reqwest::Client::new()
        .post(format!("{}/message", running.base))
        .header("Origin", "https://example.com")
        .body("not json")
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["code"], -1);
    assert_eq!(body["success"], false);
    assert!(body["error"].is_string());
    running.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn preflight_mirrors_origin() {
    let running = Running::start().await;
    let response = reqwest::Client::new()
        .request(reqwest::Method::OPTIONS, format!("{}/message", running.base))
        .header("Origin", "https://example.com")
        .header("Access-Control-Request-Method", "POST")
        .header("Access-Control-Request-Headers", "content-type")
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 200);
    let headers = response.headers();
    assert_eq!(
        headers
            .get("access-control-allow-origin")
            .and_then(|value| value.to_str().ok()),
        Some("https://example.com")
    );
    assert_eq!(
        headers
            .get("access-control-allow-credentials")
            .and_then(|value| value.to_str().ok()),
        Some("true")
    );
    running.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn health_and_hello() {
    let running = Running::start().await;
    let client = reqwest::Client::new();

    let health = client
        .get(format!("{}/health", running.base))
        .send()
        .await
        .expect("request");
    assert_eq!(health.status(), 200);
    assert_eq!(health.text().await.expect("text"), "ok");

    let hello = client
        .get(format!("{}/hello", running.base))
        .send()
        .await
        .expect("request");
    assert_eq!(hello.text().await.expect("text"), "Hello, world!");
    running.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn inbound_endpoint_feeds_mailbox_loop() {
    let running = Running::start().await;
    let response = reqwest::Client::new()
        .post(format!("{}/inbound/email", running.base))
        .json(&serde_json::json!({
            "message_id": "<http1@example.com>",
            "sender": "小红 <hong@example.com>",
            "to": RELAY_ADDRESS,
            "subject": "问候",
            "body": "你好",
        }))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 202);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["queued"], true);

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while running.transport.count() < 2 && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let transport = running.stop().await;
    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent
        .iter()
        .any(|mail| mail.recipients[0].address == "hong@example.com" && mail.subject == "Re: 问候"));
}

#[tokio::test(flavor = "multi_thread")]
async fn inbound_endpoint_requires_configured_token() {
    let running = Running::start_with(ServiceConfig {
        inbound_token: Some("s3cret".to_string()),
        ..config()
    })
    .await;
    let client = reqwest::Client::new();
    let document = serde_json::json!({
        "message_id": "<http2@example.com>",
        "sender": "小红 <hong@example.com>",
        "to": RELAY_ADDRESS,
        "subject": "问候",
        "body": "你好",
    });

    let missing = client
        .post(format!("{}/inbound/email", running.base))
        .json(&document)
        .send()
        .await
        .expect("request");
    assert_eq!(missing.status(), 401);

    let wrong = client
        .post(format!("{}/inbound/email", running.base))
        .bearer_auth("guess")
        .json(&document)
        .send()
        .await
        .expect("request");
    assert_eq!(wrong.status(), 401);

    let accepted = client
        .post(format!("{}/inbound/email", running.base))
        .bearer_auth("s3cret")
        .json(&document)
        .send()
        .await
        .expect("request");
    assert_eq!(accepted.status(), 202);

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while running.transport.count() < 2 && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let transport = running.stop().await;
    assert_eq!(transport.count(), 2);
}
