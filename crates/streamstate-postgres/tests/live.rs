use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use streamstate::{Publisher, SetOptions, Subscriber, message_callback, normalize_channel};
use streamstate_postgres::{
    PostgresConfig, PostgresPublisher, PostgresStoreClient, PostgresSubscriber, TableName,
    create_adapters,
};
use tokio::sync::{Barrier, mpsc};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

fn live_tests_enabled() -> bool {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::dotenv();
    match std::env::var("RUN_LIVE_POSTGRES_TESTS") {
        Ok(value) => {
            let normalized = value.trim().to_ascii_lowercase();
            normalized == "1" || normalized == "true" || normalized == "yes"
        }
        Err(_) => false,
    }
}

fn unique_table() -> TableName {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    TableName::parse(&format!("streamstate_live_{}_{nanos}", std::process::id()))
        .expect("generated table name should be valid")
}

struct LiveFixture {
    config: PostgresConfig,
    client: Arc<PostgresStoreClient>,
    table: TableName,
    publisher: PostgresPublisher,
    subscriber: PostgresSubscriber,
}

impl LiveFixture {
    async fn start() -> Self {
        let config = PostgresConfig::from_env()
            .expect("postgres config should load")
            .with_table(unique_table());
        let client = Arc::new(
            PostgresStoreClient::connect_with_config(&config)
                .await
                .expect("postgres should accept connections"),
        );
        client
            .create_table_if_missing(&config.table)
            .await
            .expect("table should be created");
        let (publisher, subscriber) = create_adapters(Arc::clone(&client), config.table.clone());
        Self {
            client,
            table: config.table.clone(),
            config,
            publisher,
            subscriber,
        }
    }

    /// A publisher on its own connection, so its statements run in a separate session.
    async fn connected_publisher(&self) -> PostgresPublisher {
        let client = PostgresStoreClient::connect_with_config(&self.config)
            .await
            .expect("postgres should accept connections");
        PostgresPublisher::new(Arc::new(client), self.table.clone())
    }

    async fn finish(self) {
        self.client
            .drop_table(&self.table)
            .await
            .expect("table should be dropped");
    }
}

async fn next_message(receiver: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(DELIVERY_TIMEOUT, receiver.recv())
        .await
        .expect("notification should arrive before timeout")
        .expect("callback sender should still be alive")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires RUN_LIVE_POSTGRES_TESTS=1 and a reachable Postgres (env or .env)"]
async fn postgres_live_key_value_expected_set_get_expiry_semantics() {
    if !live_tests_enabled() {
        return;
    }
    let fixture = LiveFixture::start().await;
    let publisher = &fixture.publisher;

    publisher
        .set("k", "v", SetOptions::default())
        .await
        .expect("set should succeed");
    assert_eq!(
        publisher.get("k").await.expect("get should succeed"),
        Some("v".to_string())
    );

    publisher
        .set("gone", "v", SetOptions::expire_in(0))
        .await
        .expect("set should succeed");
    assert_eq!(publisher.get("gone").await.expect("get should succeed"), None);
    assert_eq!(
        publisher
            .purge_expired()
            .await
            .expect("purge should succeed"),
        1
    );

    fixture.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires RUN_LIVE_POSTGRES_TESTS=1 and a reachable Postgres (env or .env)"]
async fn postgres_live_incr_expected_atomic_counts_and_sentinel_error() {
    if !live_tests_enabled() {
        return;
    }
    const CALLERS: i64 = 16;
    let fixture = LiveFixture::start().await;

    let barrier = Arc::new(Barrier::new(CALLERS as usize));
    let mut tasks = Vec::new();
    for _ in 0..CALLERS {
        let publisher = fixture.connected_publisher().await;
        let barrier = Arc::clone(&barrier);
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            publisher.incr("race").await
        }));
    }
    let mut seen = BTreeSet::new();
    for task in tasks {
        let value = task
            .await
            .expect("task should join")
            .expect("incr should succeed");
        assert!(seen.insert(value), "count {value} produced twice");
    }
    assert_eq!(seen, (1..=CALLERS).collect::<BTreeSet<_>>());

    fixture
        .publisher
        .set("race", "DONE", SetOptions::default())
        .await
        .expect("set should succeed");
    let err = fixture
        .publisher
        .incr("race")
        .await
        .expect_err("incr should fail on sentinel");
    assert!(err.is_not_an_integer());

    fixture.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires RUN_LIVE_POSTGRES_TESTS=1 and a reachable Postgres (env or .env)"]
async fn postgres_live_notifications_expected_subscribe_replace_unsubscribe() {
    if !live_tests_enabled() {
        return;
    }
    let fixture = LiveFixture::start().await;
    let channel = format!("resumable-stream:live:{}", "c".repeat(80));
    let (first_sender, mut first_receiver) = mpsc::unbounded_channel();
    let (second_sender, mut second_receiver) = mpsc::unbounded_channel();

    fixture
        .subscriber
        .subscribe(
            &channel,
            message_callback(move |payload| {
                let _ = first_sender.send(payload);
            }),
        )
        .await
        .expect("subscribe should succeed");
    assert_eq!(
        fixture.client.router().channels(),
        vec![normalize_channel(&channel)]
    );

    fixture
        .publisher
        .publish(&channel, "hello")
        .await
        .expect("publish should succeed");
    assert_eq!(next_message(&mut first_receiver).await, "hello");

    fixture
        .subscriber
        .subscribe(
            &channel,
            message_callback(move |payload| {
                let _ = second_sender.send(payload);
            }),
        )
        .await
        .expect("resubscribe should succeed");
    fixture
        .publisher
        .publish(&channel, "replaced")
        .await
        .expect("publish should succeed");
    assert_eq!(next_message(&mut second_receiver).await, "replaced");

    fixture
        .subscriber
        .unsubscribe(&channel)
        .await
        .expect("unsubscribe should succeed");
    fixture
        .publisher
        .publish(&channel, "after")
        .await
        .expect("publish should succeed");
    let late = tokio::time::timeout(Duration::from_millis(300), second_receiver.recv()).await;
    assert!(
        matches!(late, Err(_) | Ok(None)),
        "unexpected delivery after unsubscribe: {late:?}"
    );
    assert!(first_receiver.try_recv().is_err());

    fixture.finish().await;
}
