use super::error::SessionError;
use super::logging;
use crate::topic::TopicType;
use crate::transport::message::ErrorReport;

#[test]
fn logging_init_accepts_levels() {
    logging::init("info");
    logging::init("debug");
    logging::init("nonsense");
}

#[test]
fn test_parse_level() {
    assert_eq!(logging::parse_level("WARNING"), Some(tracing::Level::WARN));
    assert_eq!(logging::parse_level(" trace "), Some(tracing::Level::TRACE));
    assert_eq!(logging::parse_level("loud"), None);
}

#[test]
fn test_error_report_conversion() {
    let err: SessionError = ErrorReport::TypeMismatch {
        path: "random/Double".to_string(),
        expected: TopicType::Double,
        actual: TopicType::String,
    }
    .into();
    assert_eq!(
        err.to_string(),
        "topic 'random/Double' holds double values, got string"
    );

    let err: SessionError = ErrorReport::NoHandler {
        path: ">echo".to_string(),
    }
    .into();
    assert!(matches!(err, SessionError::RequestFailed(_)));
}

#[test]
fn test_transient_errors() {
    assert!(SessionError::ConnectionLost.is_transient());
    assert!(SessionError::connection("refused").is_transient());
    assert!(!SessionError::Timeout.is_transient());
    assert!(!SessionError::TopicNotFound("a".into()).is_transient());
}

#[test]
fn test_check_value() {
    assert!(SessionError::check_value("t", &crate::topic::TopicValue::Double(1.5)).is_ok());
    assert_eq!(
        SessionError::check_value("t", &crate::topic::TopicValue::Double(f64::NAN)),
        Err(SessionError::InvalidValue {
            path: "t".to_string(),
            reason: "NaN is not a finite double".to_string(),
        })
    );
}

#[test]
fn test_new_error_reports_convert() {
    let err: SessionError = ErrorReport::IncompatibleTopic {
        path: "views/a".to_string(),
        reason: "maintained by topic view 'a'".to_string(),
    }
    .into();
    assert!(matches!(err, SessionError::IncompatibleTopic { .. }));

    let err: SessionError = ErrorReport::InvalidTopicView {
        view: "v".to_string(),
        reason: "expected 'map'".to_string(),
    }
    .into();
    assert_eq!(err.to_string(), "invalid topic view 'v': expected 'map'");
}
