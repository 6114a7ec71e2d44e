//! Integration tests for the sync engine
//!
//! End-to-end scenarios driving the executor and scheduler against
//! scripted sources and in-memory repositories, plus property tests for
//! the engine's quantified invariants.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use datahub::connector::{Connector, ConnectorRegistry, ScriptedConnector, ScriptedPage, StreamStep};
use datahub::domain::{
    CleanseAction, CleansingRule, ConnectionConfig, DataSource, DataType, ExecutionStatus, ExecutionType, Field,
    IncrementalState, Interface, Library, LibraryKind, LibraryStatus, MergeConfig, SyncTask, SyncTaskInterface,
    TaskType, TransportType, TriggerType,
};
use datahub::events::{EventBus, create_event_bus};
use datahub::executor::SyncExecutor;
use datahub::repo::{MemorySink, Repos, StoreBackend};
use datahub::scheduler::{Scheduler, SchedulerConfig};
use syncstore::MemoryStore;

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    repos: Repos,
    sink: Arc<MemorySink>,
    bus: Arc<EventBus>,
}

fn harness() -> Harness {
    let backend = Arc::new(StoreBackend::new(MemoryStore::new()));
    let sink = Arc::new(MemorySink::new());
    let repos = Repos::new(
        backend.clone(),
        backend.clone(),
        backend.clone(),
        backend.clone(),
        backend.clone(),
        backend.clone(),
        backend,
        sink.clone(),
    );
    Harness {
        repos,
        sink,
        bus: create_event_bus(),
    }
}

impl Harness {
    fn executor_with<F>(&self, factory: F) -> Arc<SyncExecutor>
    where
        F: Fn(&DataSource, &Interface) -> Option<Box<dyn Connector>> + Send + Sync + 'static,
    {
        let registry = Arc::new(ConnectorRegistry::new().with_custom_factory(factory));
        Arc::new(SyncExecutor::new(self.repos.clone(), registry, self.bus.clone()))
    }

    async fn seed_basic(&self, fields: Vec<Field>) -> (Library, Interface, DataSource) {
        let mut library = Library::new(LibraryKind::Basic, "landing", "u-1");
        library.set_status(LibraryStatus::Active);
        self.repos.catalog.put_library(&library).await.unwrap();

        let mut interface = Interface::new(&library.id, "orders", TransportType::Batch);
        interface.fields = fields;

        let source = DataSource::new(
            &library.id,
            "orders-src",
            ConnectionConfig::File {
                dir: "/var/lib/datahub/in".to_string(),
                suffix: None,
                newest_first: true,
            },
        );
        interface.source_id = Some(source.id.clone());
        self.repos.catalog.put_interface(&interface).await.unwrap();
        self.repos.catalog.put_source(&source).await.unwrap();
        (library, interface, source)
    }

    async fn seed_task(&self, interface: &Interface, library: &Library, task_type: TaskType) -> SyncTask {
        let mut task = SyncTask::new("orders-sync", LibraryKind::Basic, &library.id, task_type, TriggerType::Interval);
        task.interval_seconds = Some(60);
        task.interfaces.push(SyncTaskInterface::new(&interface.id));
        self.repos.tasks.put(&task).await.unwrap();
        task
    }
}

fn order_fields() -> Vec<Field> {
    vec![
        Field::new("id", DataType::Integer).primary_key(),
        Field::new("updated_at", DataType::Timestamp).increment(),
        Field::new("amount", DataType::Float),
    ]
}

fn order_row(id: i64, ts: &str) -> Value {
    json!({"id": id, "updated_at": ts, "amount": (id as f64) * 1.5})
}

async fn wait_until(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// =============================================================================
// Scenario: interval task over a paged source
// =============================================================================

#[tokio::test]
async fn test_interval_task_two_ticks() {
    let h = harness();
    let (library, interface, _source) = h.seed_basic(order_fields()).await;
    let task = h.seed_task(&interface, &library, TaskType::Incremental).await;

    // Each tick sees a fresh page of 100 rows, like new data arriving
    // between runs
    let tick = Arc::new(AtomicUsize::new(0));
    let tick_for_factory = tick.clone();
    let executor = h.executor_with(move |_, _| {
        let tick = tick_for_factory.fetch_add(1, Ordering::SeqCst);
        let rows: Vec<Value> = (0..100)
            .map(|i| {
                let id = (tick * 100 + i) as i64;
                order_row(id, &format!("2025-06-0{}T00:00:{:02}Z", tick + 1, i % 60))
            })
            .collect();
        Some(Box::new(ScriptedConnector::batches(vec![ScriptedPage::of(rows)])))
    });

    let first = executor
        .execute(&task.id, ExecutionType::Scheduled, CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    let second = executor
        .execute(&task.id, ExecutionType::Scheduled, CancellationToken::new())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(first.status, ExecutionStatus::Success);
    assert_eq!(second.status, ExecutionStatus::Success);
    assert_eq!(first.counters.processed + second.counters.processed, 200);
    assert_eq!(h.sink.row_count(&interface.id), 200);

    // Watermark holds the max updated_at observed across both ticks
    let config_id = IncrementalState::config_id(&task.id, &interface.id);
    let state = h.repos.watermarks.get(&config_id).await.unwrap().unwrap();
    assert_eq!(state.last_sync_value.as_deref(), Some("2025-06-02T00:00:59Z"));

    // Two executions on record, newest first
    let executions = h.repos.executions.list_for_task(&task.id).await.unwrap();
    assert_eq!(executions.len(), 2);
}

// =============================================================================
// Scenario: incremental sync with watermark ties (real SQL source)
// =============================================================================

#[tokio::test]
async fn test_incremental_with_ties_over_sqlite() {
    use sqlx::any::{AnyPoolOptions, install_default_drivers};

    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("src.db");
    let url = format!("sqlite:{}?mode=rwc", db_path.display());

    install_default_drivers();
    let pool = AnyPoolOptions::new().max_connections(1).connect(&url).await.unwrap();
    sqlx::query("CREATE TABLE orders (id INTEGER PRIMARY KEY, updated_at TEXT, amount REAL)")
        .execute(&pool)
        .await
        .unwrap();
    // Three rows share t1; tie-breaking must still visit each exactly once
    for (id, ts) in [
        (1, "2025-06-01T00:00:00Z"),
        (2, "2025-06-01T00:00:00Z"),
        (3, "2025-06-01T00:00:00Z"),
        (4, "2025-06-02T00:00:00Z"),
    ] {
        sqlx::query("INSERT INTO orders (id, updated_at, amount) VALUES (?, ?, 1.0)")
            .bind(id)
            .bind(ts)
            .execute(&pool)
            .await
            .unwrap();
    }
    pool.close().await;

    let h = harness();
    let mut library = Library::new(LibraryKind::Basic, "landing", "u-1");
    library.set_status(LibraryStatus::Active);
    h.repos.catalog.put_library(&library).await.unwrap();

    let mut interface = Interface::new(&library.id, "orders", TransportType::Batch);
    interface.fields = order_fields();
    let source = DataSource::new(
        &library.id,
        "orders-db",
        ConnectionConfig::Database {
            url,
            table: "orders".to_string(),
        },
    );
    interface.source_id = Some(source.id.clone());
    h.repos.catalog.put_interface(&interface).await.unwrap();
    h.repos.catalog.put_source(&source).await.unwrap();
    let task = h.seed_task(&interface, &library, TaskType::Incremental).await;

    let registry = Arc::new(ConnectorRegistry::new());
    let executor = Arc::new(SyncExecutor::new(h.repos.clone(), registry, h.bus.clone()));

    let first = executor
        .execute(&task.id, ExecutionType::Scheduled, CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.status, ExecutionStatus::Success);
    assert_eq!(first.counters.processed, 4);
    assert_eq!(h.sink.row_count(&interface.id), 4);

    let config_id = IncrementalState::config_id(&task.id, &interface.id);
    let state = h.repos.watermarks.get(&config_id).await.unwrap().unwrap();
    assert_eq!(state.last_sync_value.as_deref(), Some("2025-06-02T00:00:00Z"));

    // Replaying from the new watermark finds nothing
    let second = executor
        .execute(&task.id, ExecutionType::Scheduled, CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.status, ExecutionStatus::Success);
    assert_eq!(second.counters.processed, 0);
    assert_eq!(h.sink.row_count(&interface.id), 4);
}

// =============================================================================
// Scenario: realtime stream with reconnect
// =============================================================================

#[tokio::test]
async fn test_realtime_reconnect_delivers_in_order() {
    let h = harness();
    let (library, mut interface, _source) = h.seed_basic(order_fields()).await;
    interface.transport = TransportType::Realtime;
    h.repos.catalog.put_interface(&interface).await.unwrap();

    let mut task = h.seed_task(&interface, &library, TaskType::Realtime).await;
    task.config.buffer_size = 64;
    h.repos.tasks.put(&task).await.unwrap();

    let mut steps = Vec::new();
    for i in 0..10 {
        steps.push(StreamStep::Record {
            payload: order_row(i, "2025-06-01T00:00:00Z"),
            channel: "x:0".to_string(),
        });
    }
    steps.push(StreamStep::Disconnect);
    for i in 10..20 {
        steps.push(StreamStep::Record {
            payload: order_row(i, "2025-06-01T00:00:00Z"),
            channel: "x:0".to_string(),
        });
    }

    let mut events = h.bus.subscribe();
    let executor = h.executor_with(move |_, _| Some(Box::new(ScriptedConnector::streaming(steps.clone(), true))));

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let task_id = task.id.clone();
    let run = tokio::spawn(async move {
        executor
            .execute(&task_id, ExecutionType::Scheduled, run_cancel)
            .await
    });

    let sink = h.sink.clone();
    let interface_id = interface.id.clone();
    assert!(wait_until(move || sink.row_count(&interface_id) == 20, Duration::from_secs(5)).await);
    cancel.cancel();

    let execution = run.await.unwrap().unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert_eq!(execution.counters.processed, 20);
    assert_eq!(execution.interface_results[0].reconnect_count, 1);

    // Partition order survived end to end
    let rows = h.sink.sample(&interface.id, 20).await.unwrap();
    let ids: Vec<i64> = rows.iter().map(|r| r["id"].as_i64().unwrap()).collect();
    assert_eq!(ids, (0..20).collect::<Vec<_>>());

    // Lost and restored both made it onto the bus
    let mut kinds = Vec::new();
    while let Some(event) = events.try_recv() {
        kinds.push(event.kind().to_string());
    }
    assert!(kinds.iter().any(|k| k == "connection_lost"));
    assert!(kinds.iter().any(|k| k == "connection_restored"));
}

// =============================================================================
// Scenario: cleansing chain with stop_on_failure
// =============================================================================

#[tokio::test]
async fn test_cleansing_stop_on_failure_aborts_batch() {
    let h = harness();
    let mut fields = vec![
        Field::new("id", DataType::Integer).primary_key(),
        Field::new("code", DataType::String),
    ];
    fields[1].nullable = true;
    let (library, mut interface, _source) = h.seed_basic(fields).await;

    let mut table = std::collections::HashMap::new();
    table.insert("A".to_string(), json!("Alpha"));
    interface.cleansing_rules = vec![
        CleansingRule::new("trim", CleanseAction::Trim, vec!["code".to_string()]).with_order(1),
        CleansingRule::new("to_upper", CleanseAction::Uppercase, vec!["code".to_string()]).with_order(2),
        CleansingRule::new("lookup", CleanseAction::Lookup { table }, vec!["code".to_string()])
            .with_order(3)
            .with_stop_on_failure(),
    ];
    h.repos.catalog.put_interface(&interface).await.unwrap();
    let task = h.seed_task(&interface, &library, TaskType::Full).await;

    // Page 1 cleanses fine; page 2 contains a lookup miss
    let executor = h.executor_with(move |_, _| {
        Some(Box::new(ScriptedConnector::batches(vec![
            ScriptedPage::of(vec![json!({"id": 1, "code": " a "})]),
            ScriptedPage::of(vec![json!({"id": 2, "code": "z"})]),
        ])))
    });

    let execution = executor
        .execute(&task.id, ExecutionType::Manual, CancellationToken::new())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    // The first batch stays committed, cleansed through the whole chain
    assert_eq!(h.sink.row_count(&interface.id), 1);
    assert_eq!(h.sink.get_row(&interface.id, "1").unwrap()["code"], json!("Alpha"));

    // The failed row landed in the issue stream under the lookup rule
    let issues = h.repos.issues.list_for_execution(&execution.id).await.unwrap();
    let lookup_issue = issues.iter().find(|i| i.rule_name == "lookup").unwrap();
    assert_eq!(lookup_issue.row_id.as_deref(), Some("2"));
}

// =============================================================================
// Scenario: worker-pool concurrency cap
// =============================================================================

#[tokio::test]
async fn test_concurrency_cap_with_ten_due_tasks() {
    let h = harness();
    let (library, interface, _source) = h.seed_basic(order_fields()).await;

    for i in 0..10 {
        let mut task = SyncTask::new(
            format!("bulk-{i}"),
            LibraryKind::Basic,
            &library.id,
            TaskType::Full,
            TriggerType::Interval,
        );
        task.interval_seconds = Some(3600);
        task.interfaces.push(SyncTaskInterface::new(&interface.id));
        h.repos.tasks.put(&task).await.unwrap();
    }

    let executor = h.executor_with(move |_, _| {
        Some(Box::new(
            ScriptedConnector::batches(vec![ScriptedPage::of(vec![order_row(1, "2025-06-01T00:00:00Z")])])
                .with_delay(Duration::from_millis(120)),
        ))
    });

    let config = SchedulerConfig {
        check_interval: Duration::from_millis(25),
        max_workers: 3,
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::new(config, h.repos.clone(), executor);
    scheduler.start().await.unwrap();

    // Watch the running set the whole time the queue drains
    let mut peak_running = 0usize;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let running = h.repos.executions.list_running().await.unwrap().len();
        peak_running = peak_running.max(running);
        assert!(running <= 3, "running executions exceeded the worker cap: {running}");

        let done: usize = count_terminal(&h).await;
        if done == 10 || tokio::time::Instant::now() > deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    scheduler.stop().await;

    assert_eq!(count_terminal(&h).await, 10, "all ten tasks drained");
    assert!(peak_running >= 1);
}

async fn count_terminal(h: &Harness) -> usize {
    let mut done = 0;
    for task in h.repos.tasks.list().await.unwrap() {
        for execution in h.repos.executions.list_for_task(&task.id).await.unwrap() {
            if execution.status.is_terminal() {
                done += 1;
            }
        }
    }
    done
}

// =============================================================================
// Scenario: cancellation mid-run
// =============================================================================

#[tokio::test]
async fn test_cancel_long_sync_keeps_committed_batches() {
    let h = harness();
    let (library, interface, _source) = h.seed_basic(vec![
        Field::new("id", DataType::Integer).primary_key(),
        Field::new("seq", DataType::Integer).increment(),
    ])
    .await;
    let mut task = h.seed_task(&interface, &library, TaskType::Incremental).await;
    task.config.batch_size = 500;
    h.repos.tasks.put(&task).await.unwrap();

    // 20 pages x 500 rows with per-page latency so the cancel lands mid-run
    let pages: Vec<ScriptedPage> = (0..20)
        .map(|p| {
            ScriptedPage::of(
                (0..500)
                    .map(|i| {
                        let id = (p * 500 + i) as i64;
                        json!({"id": id, "seq": id})
                    })
                    .collect(),
            )
        })
        .collect();
    let executor =
        h.executor_with(move |_, _| Some(Box::new(ScriptedConnector::batches(pages.clone()).with_delay(Duration::from_millis(20)))));

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let task_id = task.id.clone();
    let run = tokio::spawn(async move {
        executor
            .execute(&task_id, ExecutionType::Scheduled, run_cancel)
            .await
    });

    let sink = h.sink.clone();
    let interface_id = interface.id.clone();
    assert!(
        wait_until(
            move || sink.row_count(&interface_id) >= 4000,
            Duration::from_secs(10)
        )
        .await
    );
    cancel.cancel();

    let execution = run.await.unwrap().unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);

    // Counter identity holds at the terminal state
    let c = execution.counters;
    assert_eq!(c.processed, c.success + c.error + c.skipped);
    assert_eq!(c.success as usize, h.sink.row_count(&interface.id));

    // Watermark sits exactly at the last committed batch boundary
    let config_id = IncrementalState::config_id(&task.id, &interface.id);
    let state = h.repos.watermarks.get(&config_id).await.unwrap().unwrap();
    let committed_max: i64 = h
        .sink
        .sample(&interface.id, 20_000)
        .await
        .unwrap()
        .iter()
        .map(|r| r["seq"].as_i64().unwrap())
        .max()
        .unwrap();
    assert_eq!(state.last_sync_value.as_deref(), Some(committed_max.to_string().as_str()));
}

// =============================================================================
// Auth refresh and thematic merge
// =============================================================================

#[tokio::test]
async fn test_auth_failure_heals_with_one_refresh() {
    let h = harness();
    let (library, interface, _source) = h.seed_basic(order_fields()).await;
    let task = h.seed_task(&interface, &library, TaskType::Full).await;

    let executor = h.executor_with(move |_, _| {
        Some(Box::new(
            ScriptedConnector::batches(vec![ScriptedPage::of(vec![order_row(1, "2025-06-01T00:00:00Z")])])
                .with_broken_auth(),
        ))
    });

    let execution = executor
        .execute(&task.id, ExecutionType::Manual, CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(execution.counters.processed, 1);
}

#[tokio::test]
async fn test_thematic_merge_across_interfaces() {
    let h = harness();
    let mut thematic = Library::new(LibraryKind::Thematic, "customer_360", "u-1");
    thematic.set_status(LibraryStatus::Active);
    h.repos.catalog.put_library(&thematic).await.unwrap();

    let mut basic = Library::new(LibraryKind::Basic, "landing", "u-1");
    basic.set_status(LibraryStatus::Active);
    h.repos.catalog.put_library(&basic).await.unwrap();

    let mut crm = Interface::new(&basic.id, "crm_customers", TransportType::Batch);
    crm.fields = vec![
        Field::new("customer_id", DataType::Integer).primary_key(),
        Field::new("name", DataType::String),
    ];
    let crm_src = DataSource::new(
        &basic.id,
        "crm",
        ConnectionConfig::File {
            dir: "/in/crm".to_string(),
            suffix: None,
            newest_first: true,
        },
    );
    crm.source_id = Some(crm_src.id.clone());

    let mut billing = Interface::new(&basic.id, "billing_balances", TransportType::Batch);
    billing.fields = vec![
        Field::new("customer_id", DataType::Integer).primary_key(),
        Field::new("balance", DataType::Float),
    ];
    let billing_src = DataSource::new(
        &basic.id,
        "billing",
        ConnectionConfig::File {
            dir: "/in/billing".to_string(),
            suffix: None,
            newest_first: true,
        },
    );
    billing.source_id = Some(billing_src.id.clone());

    let mut target = Interface::new(&thematic.id, "customer_view", TransportType::Batch);
    target.fields = vec![
        Field::new("customer_id", DataType::Integer).primary_key(),
        Field::new("name", DataType::String),
        Field::new("balance", DataType::Float),
    ];

    for interface in [&crm, &billing, &target] {
        h.repos.catalog.put_interface(interface).await.unwrap();
    }
    for source in [&crm_src, &billing_src] {
        h.repos.catalog.put_source(source).await.unwrap();
    }

    let mut task = SyncTask::new("customer-360", LibraryKind::Thematic, &thematic.id, TaskType::Full, TriggerType::Manual);
    task.interfaces.push(SyncTaskInterface::new(&crm.id));
    task.interfaces.push(SyncTaskInterface::new(&billing.id));
    task.target_interface_id = Some(target.id.clone());
    task.config.merge = Some(MergeConfig {
        keys: vec!["customer_id".to_string()],
        conflict_policy: datahub::domain::ConflictPolicy::PreferLatest,
        source_rank: vec![],
    });
    h.repos.tasks.put(&task).await.unwrap();

    let executor = h.executor_with(move |source, _| {
        let page = if source.name == "crm" {
            ScriptedPage::of(vec![
                json!({"customer_id": 1, "name": "Ada"}),
                json!({"customer_id": 2, "name": "Grace"}),
            ])
        } else {
            ScriptedPage::of(vec![
                json!({"customer_id": 1, "balance": 42.0}),
                json!({"customer_id": 2, "balance": 7.5}),
            ])
        };
        Some(Box::new(ScriptedConnector::batches(vec![page])))
    });

    let execution = executor
        .execute(&task.id, ExecutionType::Manual, CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Success);

    // Merged rows carry fields from both sources, keyed by customer_id
    assert_eq!(h.sink.row_count(&target.id), 2);
    let merged = h.sink.get_row(&target.id, "1").unwrap();
    assert_eq!(merged["name"], json!("Ada"));
    assert_eq!(merged["balance"], json!(42.0));

    // Lineage ties merged records back to both source interfaces
    let lineage = h.repos.lineage.list_for_execution(&execution.id).await.unwrap();
    assert_eq!(lineage.len(), 4);
    assert!(lineage.iter().any(|l| l.source_interface_id == crm.id));
    assert!(lineage.iter().any(|l| l.source_interface_id == billing.id));
}

// =============================================================================
// Standalone quality task
// =============================================================================

#[tokio::test]
async fn test_standalone_quality_task_scores_sink_sample() {
    use datahub::domain::{QualityRule, QualityRuleSpec, QualityRuleTemplate, QualityTask};

    let h = harness();
    let (library, interface, _source) = h.seed_basic(order_fields()).await;
    let sync_task = h.seed_task(&interface, &library, TaskType::Full).await;

    // Land three rows, one with a null amount
    let executor = h.executor_with(move |_, _| {
        Some(Box::new(ScriptedConnector::batches(vec![ScriptedPage::of(vec![
            json!({"id": 1, "updated_at": "2025-06-01T00:00:00Z", "amount": 10.0}),
            json!({"id": 2, "updated_at": "2025-06-01T00:00:00Z", "amount": null}),
            json!({"id": 3, "updated_at": "2025-06-01T00:00:00Z", "amount": 30.0}),
        ])])))
    });
    executor
        .execute(&sync_task.id, ExecutionType::Manual, CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.sink.row_count(&interface.id), 3);

    // Template-bound completeness rule over the amount column
    let template = QualityRuleTemplate::new(
        "amount-complete",
        datahub::domain::QualityDimension::Completeness,
        0.9,
        1.0,
    );
    h.repos.quality.put_template(&template).await.unwrap();
    let templates = h.repos.quality.list_templates().await.unwrap();
    assert_eq!(templates.len(), 1);

    let rule = QualityRule::from_template(
        &templates[0],
        QualityRuleSpec::Completeness {
            fields: vec!["amount".to_string()],
        },
    )
    .unwrap();

    let mut quality_task = QualityTask::new("orders-quality", &library.id, &interface.id, TriggerType::Interval);
    quality_task.interval_seconds = Some(300);
    quality_task.threshold = 0.9;
    quality_task.rules.push(rule);
    h.repos.quality.put_task(&quality_task).await.unwrap();

    let execution = executor.execute_quality(&quality_task.id).await.unwrap();
    assert!((execution.overall_score - 2.0 / 3.0).abs() < 1e-9);
    assert!(!execution.passed);
    assert_eq!(execution.dimension_results.len(), 1);

    // The offending row is identified in the issue stream
    let issues = h.repos.issues.list_for_execution(&execution.id).await.unwrap();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].row_id.as_deref(), Some("2"));
    assert_eq!(issues[0].field.as_deref(), Some("amount"));
}

// =============================================================================
// Lease exclusivity
// =============================================================================

#[tokio::test]
async fn test_at_most_one_running_execution_per_task() {
    let h = harness();
    let (library, interface, _source) = h.seed_basic(order_fields()).await;
    let task = h.seed_task(&interface, &library, TaskType::Full).await;

    let executor = h.executor_with(move |_, _| {
        Some(Box::new(
            ScriptedConnector::batches(vec![ScriptedPage::of(vec![order_row(1, "2025-06-01T00:00:00Z")])])
                .with_delay(Duration::from_millis(200)),
        ))
    });

    let first_executor = executor.clone();
    let first_id = task.id.clone();
    let first = tokio::spawn(async move {
        first_executor
            .execute(&first_id, ExecutionType::Scheduled, CancellationToken::new())
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Second dispatch while the first holds the lease: a no-op
    let second = executor
        .execute(&task.id, ExecutionType::Scheduled, CancellationToken::new())
        .await
        .unwrap();
    assert!(second.is_none());

    let first = first.await.unwrap().unwrap().unwrap();
    assert_eq!(first.status, ExecutionStatus::Success);
}

// =============================================================================
// Property tests
// =============================================================================

mod properties {
    use super::*;
    use datahub::domain::{ExecutionCounters, IncrementalKind, compare_values};
    use datahub::retry::RetryPolicy;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_backoff_within_jitter_bound(attempt in 0u32..32) {
            let policy = RetryPolicy::default();
            let bound = policy.backoff_bound(attempt);
            let delay = policy.backoff_delay(attempt);
            prop_assert!(delay <= bound);
            prop_assert!(bound <= policy.max_backoff);
        }

        #[test]
        fn prop_watermark_never_regresses(values in proptest::collection::vec(0i64..1_000_000, 1..64)) {
            let mut state = IncrementalState::new("t-1", "if-1", IncrementalKind::IdRange);
            let mut high: Option<String> = None;
            for (i, value) in values.iter().enumerate() {
                state.advance(&value.to_string(), &format!("e-{i}"));
                let current = state.last_sync_value.clone().unwrap();
                if let Some(previous) = &high {
                    prop_assert_ne!(
                        compare_values(&current, previous),
                        std::cmp::Ordering::Less,
                        "watermark regressed from {} to {}", previous, current
                    );
                }
                high = Some(current);
            }
        }

        #[test]
        fn prop_counter_identity(batches in proptest::collection::vec((0u64..500, 0u64..50, 0u64..50), 0..32)) {
            let mut counters = ExecutionCounters::default();
            for (ok, err, skip) in batches {
                counters.record_batch(ok, err, skip);
            }
            prop_assert!(counters.is_consistent());
        }

        #[test]
        fn prop_cron_fire_times_strictly_increase(minute in 0u32..60, hour in 0u32..24) {
            use chrono::TimeZone;
            let expr = format!("{minute} {hour} * * *");
            let t0 = chrono::Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
            let t1 = datahub::trigger::next_cron_after(&expr, chrono_tz::UTC, t0).unwrap().unwrap();
            let t2 = datahub::trigger::next_cron_after(&expr, chrono_tz::UTC, t1).unwrap().unwrap();
            prop_assert!(t1 > t0);
            prop_assert!(t2 > t1);
            // Daily cadence: successive fires are exactly 24h apart
            prop_assert_eq!((t2 - t1).num_hours(), 24);
        }
    }
}
