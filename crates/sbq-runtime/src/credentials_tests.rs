//! Tests for credential sources.

use super::*;

#[tokio::test]
async fn test_static_token_source_returns_token() {
    let source = StaticTokenSource::new("token-123");

    let token = source.bearer_token().await.unwrap();

    assert_eq!(token, "token-123");
    assert_eq!(source.kind(), "static");
}

#[tokio::test]
async fn test_empty_static_token_is_an_authentication_failure() {
    let source = StaticTokenSource::new("");

    let result = source.bearer_token().await;

    assert!(matches!(
        result,
        Err(QueueError::AuthenticationFailed { .. })
    ));
}

#[test]
fn test_static_token_debug_is_redacted() {
    let source = StaticTokenSource::new("super-secret");
    let rendered = format!("{:?}", source);
    assert!(!rendered.contains("super-secret"));
    assert!(rendered.contains("redacted"));
}

#[test]
fn test_identity_failure_classification() {
    assert!(matches!(
        classify_identity_failure("request Timeout while contacting IMDS"),
        QueueError::ConnectionFailed { .. }
    ));
    assert!(matches!(
        classify_identity_failure("403 Forbidden"),
        QueueError::PermissionDenied { .. }
    ));
    assert!(matches!(
        classify_identity_failure("no credential sources available"),
        QueueError::AuthenticationFailed { .. }
    ));
}
