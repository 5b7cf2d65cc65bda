//! Tests for error types

use aa_shrinkage::Error;

#[test]
fn test_invalid_parameter_error() {
    let error = Error::InvalidParameter("correlation must lie strictly between -1 and 1".into());
    let error_str = format!("{error}");
    assert!(error_str.contains("Invalid parameter"));
    assert!(error_str.contains("between -1 and 1"));
}

#[test]
fn test_insufficient_data_error() {
    let error = Error::InsufficientData {
        experiment: 17,
        condition: "treatment".to_string(),
        metric: "metric_b".to_string(),
        observations: 1,
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("experiment 17"));
    assert!(error_str.contains("treatment"));
    assert!(error_str.contains("metric_b"));
    assert!(error_str.contains("1 observation"));
    assert!(error_str.contains("larger population"));
}

#[test]
fn test_shape_mismatch_error() {
    let error = Error::ShapeMismatch {
        estimates: (1000, 2),
        standard_errors: (999, 2),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("Shape mismatch"));
    assert!(error_str.contains("1000x2"));
    assert!(error_str.contains("999x2"));
}

#[test]
fn test_external_procedure_failure_error() {
    let error = Error::ExternalProcedureFailure {
        stage: "fit",
        message: "covariance not positive definite".to_string(),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("during fit"));
    assert!(error_str.contains("positive definite"));
}

#[test]
fn test_io_error_conversion() {
    let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "config.json");
    let error: Error = io_error.into();
    assert!(format!("{error}").contains("IO error"));
}

#[test]
fn test_json_error_conversion() {
    let json_error = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
    let error: Error = json_error.into();
    assert!(format!("{error}").contains("JSON error"));
}

#[test]
fn test_error_debug_format() {
    let error = Error::InvalidParameter("experiment_count".to_string());
    let debug_str = format!("{error:?}");
    assert!(debug_str.contains("InvalidParameter"));
}
