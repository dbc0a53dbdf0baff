//! Router 集成测试

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use triage::llm::{CompletionResponse, LlmError, MockCompletion};
use triage::router::{Router, RouterConfig};
use triage::store::Strategy;

fn router(completion: MockCompletion) -> (Router, Arc<MockCompletion>) {
    let completion = Arc::new(completion);
    let config = RouterConfig {
        trigger_terms: vec!["full".into(), "comprehensive".into(), "audit".into(), "triage".into()],
        classify_timeout: Duration::from_millis(100),
    };
    (Router::new(completion.clone(), config), completion)
}

#[tokio::test]
async fn test_no_target_always_lookup() {
    let (router, completion) = router(MockCompletion::text("deep"));
    assert_eq!(router.classify("comprehensive audit", false, None).await, Strategy::Lookup);
    assert_eq!(completion.calls(), 0);
}

#[tokio::test]
async fn test_explicit_strategy_wins() {
    let (router, completion) = router(MockCompletion::text("deep"));
    assert_eq!(router.classify("full audit", true, Some(Strategy::Direct)).await, Strategy::Direct);
    assert_eq!(router.classify("hello", false, Some(Strategy::Deep)).await, Strategy::Deep);
    assert_eq!(completion.calls(), 0);
}

#[tokio::test]
async fn test_trigger_term_skips_classifier() {
    let (router, completion) = router(MockCompletion::text("direct"));
    assert_eq!(router.classify("Comprehensive check please", true, None).await, Strategy::Deep);
    // 单词边界：fully 不命中 full
    assert_eq!(router.classify("is it fully replicated?", true, None).await, Strategy::Direct);
    assert_eq!(completion.calls(), 1);
}

#[tokio::test]
async fn test_classifier_verdict_used() {
    let (router, _) = router(MockCompletion::new(|_| {
        Ok(CompletionResponse::Structured(json!({ "strategy": "deep" })))
    }));
    assert_eq!(router.classify("something is off with the primary", true, None).await, Strategy::Deep);
}

#[tokio::test]
async fn test_classifier_failure_falls_back_to_direct() {
    let (failing, _) = router(MockCompletion::new(|_| Err(LlmError::Transport("connection reset".into()))));
    assert_eq!(failing.classify("why are clients disconnecting?", true, None).await, Strategy::Direct);

    let (slow, _) = router(MockCompletion::text("deep").with_delay(Duration::from_secs(5)));
    assert_eq!(slow.classify("why are clients disconnecting?", true, None).await, Strategy::Direct);
}
