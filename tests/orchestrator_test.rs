//! 工具编排器集成测试：顺序、隔离、重试、超时、依赖与取消

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use helios::tools::{
    Action, ErrorKind, InvocationId, OrchestrationError, OrchestratorConfig, ParamType, RetryPolicy,
    Tool, ToolContext, ToolContract, ToolError, ToolOrchestrator, ToolOutput, ToolParameter,
    ToolRegistry,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5))
}

fn orchestrator(registry: ToolRegistry) -> ToolOrchestrator {
    ToolOrchestrator::new(
        Arc::new(registry),
        OrchestratorConfig {
            max_concurrency: 8,
            default_timeout: Duration::from_secs(5),
            default_retry: fast_retry(),
        },
    )
}

fn action(id: &str, tool: &str, args: Value) -> Action {
    Action::with_id(InvocationId::new(id), tool, args)
}

/// 睡眠 `ms` 毫秒后返回 label
struct SleepTool;

#[async_trait]
impl Tool for SleepTool {
    fn contract(&self) -> ToolContract {
        ToolContract::new("sleep", "Sleep, then echo the label")
            .parameter(ToolParameter::required("ms", ParamType::Integer, "delay"))
            .parameter(ToolParameter::required("label", ParamType::String, "label"))
    }

    async fn invoke(&self, input: Value, _ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        let ms = input["ms"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(ToolOutput::text(input["label"].as_str().unwrap_or_default()))
    }
}

#[derive(Default)]
struct Tracker {
    in_flight: AtomicUsize,
    exclusive_active: AtomicBool,
    violations: AtomicUsize,
}

struct SharedTool(Arc<Tracker>);

#[async_trait]
impl Tool for SharedTool {
    fn contract(&self) -> ToolContract {
        ToolContract::new("reader", "Concurrency-safe read")
    }

    async fn invoke(&self, _input: Value, _ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        self.0.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.0.exclusive_active.load(Ordering::SeqCst) {
            self.0.violations.fetch_add(1, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(ToolOutput::text("read"))
    }
}

struct ExclusiveTool(Arc<Tracker>);

#[async_trait]
impl Tool for ExclusiveTool {
    fn contract(&self) -> ToolContract {
        ToolContract::new("writer", "Must run alone").concurrency_unsafe()
    }

    async fn invoke(&self, _input: Value, _ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        self.0.exclusive_active.store(true, Ordering::SeqCst);
        if self.0.in_flight.load(Ordering::SeqCst) > 0 {
            self.0.violations.fetch_add(1, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.0.exclusive_active.store(false, Ordering::SeqCst);
        Ok(ToolOutput::text("wrote"))
    }
}

/// 前 `failures` 次返回可重试错误
struct FlakyTool {
    failures: u32,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Tool for FlakyTool {
    fn contract(&self) -> ToolContract {
        ToolContract::new("flaky", "Fails a few times").retry(fast_retry())
    }

    async fn invoke(&self, _input: Value, ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if ctx.attempt <= self.failures {
            Err(ToolError::Retryable(format!("attempt {} failed", ctx.attempt)))
        } else {
            Ok(ToolOutput::text(format!("ok on attempt {}", ctx.attempt)))
        }
    }
}

struct ProducerTool;

#[async_trait]
impl Tool for ProducerTool {
    fn contract(&self) -> ToolContract {
        ToolContract::new("producer", "Produces a value")
    }

    async fn invoke(&self, _input: Value, _ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(ToolOutput::text("42"))
    }
}

struct ConsumerTool;

#[async_trait]
impl Tool for ConsumerTool {
    fn contract(&self) -> ToolContract {
        ToolContract::new("consumer", "Reads the producer's output").depends_on("producer")
    }

    async fn invoke(&self, _input: Value, ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        match ctx.upstream_of("producer") {
            Some(obs) => Ok(ToolOutput::text(format!("saw {}", obs.to_message_content()))),
            None => Err(ToolError::Fatal("producer did not run first".into())),
        }
    }
}

/// 记录同时在途调用数的峰值
#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

struct GaugeTool(Arc<Gauge>);

#[async_trait]
impl Tool for GaugeTool {
    fn contract(&self) -> ToolContract {
        ToolContract::new("gauge", "Counts overlapping calls")
    }

    async fn invoke(&self, _input: Value, _ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        let now = self.0.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.0.current.fetch_sub(1, Ordering::SeqCst);
        Ok(ToolOutput::text("measured"))
    }
}

struct CyclicTool(&'static str, &'static str);

#[async_trait]
impl Tool for CyclicTool {
    fn contract(&self) -> ToolContract {
        ToolContract::new(self.0, "cyclic").depends_on(self.1)
    }

    async fn invoke(&self, _input: Value, _ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        Ok(ToolOutput::text(self.0))
    }
}

#[tokio::test]
async fn test_observations_follow_request_order() {
    let mut registry = ToolRegistry::new();
    registry.register(SleepTool).unwrap();
    let orch = orchestrator(registry);

    let actions = vec![
        action("a", "sleep", json!({"ms": 60, "label": "slow"})),
        action("b", "sleep", json!({"ms": 1, "label": "fast"})),
        action("c", "sleep", json!({"ms": 30, "label": "medium"})),
    ];
    let observations = orch
        .execute_batch(&actions, &CancellationToken::new())
        .await
        .unwrap();

    let ids: Vec<&str> = observations.iter().map(|o| o.invocation_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert!(observations.iter().all(|o| o.is_success() && o.attempts == 1));
    assert!(observations[0].to_message_content().ends_with("slow"));
}

#[tokio::test]
async fn test_safe_calls_run_in_parallel() {
    let mut registry = ToolRegistry::new();
    registry.register(SleepTool).unwrap();
    let orch = orchestrator(registry);

    let actions: Vec<Action> = (0..4)
        .map(|i| action(&format!("s{i}"), "sleep", json!({"ms": 100, "label": "x"})))
        .collect();
    let start = std::time::Instant::now();
    orch.execute_batch(&actions, &CancellationToken::new())
        .await
        .unwrap();
    assert!(start.elapsed() < Duration::from_millis(350));
}

#[tokio::test]
async fn test_max_concurrency_bounds_in_flight_calls() {
    let gauge = Arc::new(Gauge::default());
    let mut registry = ToolRegistry::new();
    registry.register(GaugeTool(Arc::clone(&gauge))).unwrap();
    let orch = Arc::new(ToolOrchestrator::new(
        Arc::new(registry),
        OrchestratorConfig {
            max_concurrency: 2,
            default_timeout: Duration::from_secs(5),
            default_retry: fast_retry(),
        },
    ));

    let batch: Vec<Action> = (0..6)
        .map(|i| action(&format!("g{i}"), "gauge", json!({})))
        .collect();
    let observations = orch
        .execute_batch(&batch, &CancellationToken::new())
        .await
        .unwrap();
    assert!(observations.iter().all(|o| o.is_success()));
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);

    // 上限由同一编排器上的所有批次共享
    let left: Vec<Action> = (0..3)
        .map(|i| action(&format!("l{i}"), "gauge", json!({})))
        .collect();
    let right: Vec<Action> = (0..3)
        .map(|i| action(&format!("r{i}"), "gauge", json!({})))
        .collect();
    let token = CancellationToken::new();
    let (a, b) = tokio::join!(
        orch.execute_batch(&left, &token),
        orch.execute_batch(&right, &token)
    );
    assert!(a.unwrap().iter().chain(b.unwrap().iter()).all(|o| o.is_success()));
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unsafe_tool_never_overlaps_across_batches() {
    let tracker = Arc::new(Tracker::default());
    let mut registry = ToolRegistry::new();
    registry.register(SharedTool(Arc::clone(&tracker))).unwrap();
    registry.register(ExclusiveTool(Arc::clone(&tracker))).unwrap();
    let orch = Arc::new(orchestrator(registry));

    let mixed = vec![
        action("r1", "reader", json!({})),
        action("w1", "writer", json!({})),
        action("r2", "reader", json!({})),
    ];
    let readers = vec![
        action("r3", "reader", json!({})),
        action("r4", "reader", json!({})),
        action("w2", "writer", json!({})),
    ];
    let token = CancellationToken::new();
    let (a, b) = tokio::join!(
        orch.execute_batch(&mixed, &token),
        orch.execute_batch(&readers, &token)
    );

    assert!(a.unwrap().iter().all(|o| o.is_success()));
    assert!(b.unwrap().iter().all(|o| o.is_success()));
    assert_eq!(tracker.violations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_retryable_failure_then_success() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = ToolRegistry::new();
    registry
        .register(FlakyTool {
            failures: 2,
            calls: Arc::clone(&calls),
        })
        .unwrap();
    let orch = orchestrator(registry);

    let obs = orch
        .execute_batch(&[action("f", "flaky", json!({}))], &CancellationToken::new())
        .await
        .unwrap();
    assert!(obs[0].is_success());
    assert_eq!(obs[0].attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_exhaustion_is_tool_failed() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = ToolRegistry::new();
    registry
        .register(FlakyTool {
            failures: u32::MAX,
            calls: Arc::clone(&calls),
        })
        .unwrap();
    let orch = orchestrator(registry);

    let obs = orch
        .execute_batch(&[action("f", "flaky", json!({}))], &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(obs[0].error_kind(), Some(ErrorKind::ToolFailed));
    assert_eq!(obs[0].attempts, fast_retry().max_attempts());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_timeout_is_not_retried() {
    struct Stuck(Arc<AtomicU32>);

    #[async_trait]
    impl Tool for Stuck {
        fn contract(&self) -> ToolContract {
            ToolContract::new("stuck", "Never finishes in time")
                .timeout(Duration::from_millis(20))
                .retry(fast_retry())
        }

        async fn invoke(&self, _input: Value, _ctx: ToolContext) -> Result<ToolOutput, ToolError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ToolOutput::text("late"))
        }
    }

    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = ToolRegistry::new();
    registry.register(Stuck(Arc::clone(&calls))).unwrap();
    let orch = orchestrator(registry);

    let obs = orch
        .execute_batch(&[action("t", "stuck", json!({}))], &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(obs[0].error_kind(), Some(ErrorKind::Timeout));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unknown_tool_and_invalid_input_do_not_abort_batch() {
    let mut registry = ToolRegistry::new();
    helios::tools::register_builtin_tools(&mut registry).unwrap();
    let orch = orchestrator(registry);

    let actions = vec![
        action("u", "teleport", json!({"to": "mars"})),
        action("i", "echo", json!({})),
        action("ok", "echo", json!({"text": "hello"})),
    ];
    let obs = orch
        .execute_batch(&actions, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(obs[0].error_kind(), Some(ErrorKind::UnknownTool));
    assert_eq!(obs[0].attempts, 0);
    assert!(obs[0].to_message_content().contains("echo"));
    assert_eq!(obs[1].error_kind(), Some(ErrorKind::InvalidInput));
    assert!(obs[2].is_success());
}

#[tokio::test]
async fn test_dependency_runs_first_and_passes_upstream() {
    let mut registry = ToolRegistry::new();
    registry.register(ProducerTool).unwrap();
    registry.register(ConsumerTool).unwrap();
    let orch = orchestrator(registry);

    // consumer 排在前面，仍须等 producer 完成
    let actions = vec![
        action("c", "consumer", json!({})),
        action("p", "producer", json!({})),
    ];
    let obs = orch
        .execute_batch(&actions, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(obs[0].invocation_id.as_str(), "c");
    assert!(obs[0].is_success(), "{:?}", obs[0]);
    assert!(obs[0].to_message_content().contains("producer: 42"));
}

#[tokio::test]
async fn test_dependency_absent_from_batch_is_ignored() {
    let mut registry = ToolRegistry::new();
    registry.register(ConsumerTool).unwrap();
    let orch = orchestrator(registry);

    let obs = orch
        .execute_batch(&[action("c", "consumer", json!({}))], &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(obs[0].error_kind(), Some(ErrorKind::ToolFailed));
}

#[tokio::test]
async fn test_cycle_fails_whole_batch() {
    let mut registry = ToolRegistry::new();
    registry.register(CyclicTool("a", "b")).unwrap();
    registry.register(CyclicTool("b", "a")).unwrap();
    let orch = orchestrator(registry);

    let err = orch
        .execute_batch(
            &[action("1", "a", json!({})), action("2", "b", json!({}))],
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(
        err,
        OrchestrationError::CyclicDependency(vec!["a".to_string(), "b".to_string()])
    );
}

#[tokio::test]
async fn test_duplicate_ids_rejected() {
    let mut registry = ToolRegistry::new();
    helios::tools::register_builtin_tools(&mut registry).unwrap();
    let orch = orchestrator(registry);

    let err = orch
        .execute_batch(
            &[
                action("same", "echo", json!({"text": "a"})),
                action("same", "echo", json!({"text": "b"})),
            ],
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::DuplicateInvocation(_)));
}

#[tokio::test]
async fn test_cancellation_yields_cancelled_observations() {
    struct SlowProducer;

    #[async_trait]
    impl Tool for SlowProducer {
        fn contract(&self) -> ToolContract {
            ToolContract::new("producer", "Slow producer")
        }

        async fn invoke(&self, _input: Value, _ctx: ToolContext) -> Result<ToolOutput, ToolError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ToolOutput::text("too late"))
        }
    }

    let mut registry = ToolRegistry::new();
    registry.register(SlowProducer).unwrap();
    registry.register(ConsumerTool).unwrap();
    let orch = orchestrator(registry);

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        canceller.cancel();
    });

    let start = std::time::Instant::now();
    let obs = orch
        .execute_batch(
            &[action("p", "producer", json!({})), action("c", "consumer", json!({}))],
            &token,
        )
        .await
        .unwrap();
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(obs.len(), 2);
    assert!(obs.iter().all(|o| o.error_kind() == Some(ErrorKind::Cancelled)));
}
