// ABOUTME: Tests for the MockHarness scripted playback.
// ABOUTME: Validates expectation matching, recordings and query option capture.

use harnex_agent::backends::mock::{MockHarness, MockStep};
use harnex_agent::{Envelope, EnvelopeBody, ErrorCode, Harness, QueryMode, QueryOptions};

async fn drain(mock: &MockHarness, prompt: &str, options: &QueryOptions) -> Vec<Envelope> {
    let mut handle = mock.query(prompt, options).unwrap();
    let mut out = Vec::new();
    while let Some(envelope) = handle.events.recv().await {
        out.push(envelope);
    }
    out
}

#[tokio::test]
async fn test_mock_respond_error() {
    let mock = MockHarness::new()
        .on_prompt("fail")
        .respond_error(ErrorCode::RateLimited, "slow down");
    let events = drain(&mock, "please fail", &QueryOptions::default()).await;

    assert_eq!(events.len(), 1);
    match &events[0].body {
        EnvelopeBody::Error { code, message } => {
            assert_eq!(*code, ErrorCode::RateLimited);
            assert_eq!(message, "slow down");
        }
        other => panic!("Expected Error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_mock_verbatim_envelopes_keep_ids() {
    let fixed = Envelope::with_id("fixed-1", EnvelopeBody::SessionStarted {
        session_id: "abc123".to_string(),
    });
    let mock = MockHarness::new()
        .on_prompt("ids")
        .respond_with(vec![MockStep::Envelope(fixed.clone()), MockStep::complete()]);
    let events = drain(&mock, "ids", &QueryOptions::default()).await;
    assert_eq!(events[0], fixed);
}

#[tokio::test]
async fn test_mock_expectations_consumed_once() {
    let mock = MockHarness::new().on_prompt("hello").respond_text("first");
    let first = drain(&mock, "hello", &QueryOptions::default()).await;
    let second = drain(&mock, "hello", &QueryOptions::default()).await;

    match (&first[0].body, &second[0].body) {
        (
            EnvelopeBody::RawMessage { message: a, .. },
            EnvelopeBody::RawMessage { message: b, .. },
        ) => {
            assert_eq!(a["text"], "first");
            assert_eq!(b["text"], "Mock: no expectation for 'hello'");
        }
        other => panic!("Unexpected events: {:?}", other),
    }
}

#[tokio::test]
async fn test_mock_records_query_options() {
    let mock = MockHarness::new();
    let mut options = QueryOptions::new("/srv/project");
    options.mode = QueryMode::Plan;
    options.model = Some("mock-model".to_string());
    drain(&mock, "plan it", &options).await;

    let queries = mock.queries();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].0, "plan it");
    assert_eq!(queries[0].1.mode, QueryMode::Plan);
    assert_eq!(queries[0].1.cwd.to_str(), Some("/srv/project"));
}

#[tokio::test(start_paused = true)]
async fn test_mock_delay_then_complete() {
    let mock = MockHarness::new().on_prompt("wait").respond_with(vec![
        MockStep::Delay(std::time::Duration::from_secs(30)),
        MockStep::complete(),
    ]);
    let events = drain(&mock, "wait", &QueryOptions::default()).await;
    assert_eq!(events.len(), 1);
    assert!(events[0].is_terminal());
}
