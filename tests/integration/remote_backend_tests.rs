//! Remote backend against a mock Piston-compatible server

use assert_matches::assert_matches;
use coderun_common::{ExecutionRequest, Outcome};
use coderun_sandbox::{
    build_backend, BackendKind, EngineSection, ExecutionBackend, RemoteBackend, RemoteConfig,
    SandboxError, ToolchainRegistry,
};
use coderun_tests::{setup_test_logging, test_config, test_pipeline};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn remote_config(server: &MockServer, api_key: Option<&str>) -> RemoteConfig {
    RemoteConfig {
        url: server.uri(),
        api_key: api_key.map(str::to_string),
        request_timeout: Duration::from_secs(5),
    }
}

fn backend(server: &MockServer, api_key: Option<&str>) -> RemoteBackend {
    setup_test_logging();
    RemoteBackend::new(
        remote_config(server, api_key),
        EngineSection::default(),
        Arc::new(ToolchainRegistry::builtin()),
    )
    .unwrap()
}

#[tokio::test]
async fn test_remote_run_is_mapped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/execute"))
        .and(header("Authorization", "judge-key"))
        .and(body_partial_json(json!({
            "language": "c++",
            "stdin": "2 3\n",
            "run_timeout": 5000
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "language": "c++",
            "version": "10.2.0",
            "compile": { "stdout": "", "stderr": "", "output": "", "code": 0, "signal": null },
            "run": { "stdout": "5\n", "stderr": "", "output": "5\n", "code": 0, "signal": null }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let result = backend(&server, Some("judge-key"))
        .execute(ExecutionRequest::new("cpp", "int main(){}").with_stdin("2 3\n"))
        .await
        .unwrap();

    assert_eq!(result.outcome, Outcome::Completed);
    assert_eq!(result.stdout, "5\n");
    assert_eq!(result.exit_code, 0);
}

#[tokio::test]
async fn test_remote_compile_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/execute"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "language": "java",
            "version": "15.0.2",
            "compile": {
                "stdout": "",
                "stderr": "Main.java:1: error: ';' expected",
                "output": "Main.java:1: error: ';' expected",
                "code": 1,
                "signal": null
            }
        })))
        .mount(&server)
        .await;

    let result = backend(&server, None)
        .execute(ExecutionRequest::new("java", "class Main {"))
        .await
        .unwrap();

    assert_eq!(result.outcome, Outcome::CompileFailed);
    assert!(result.compile_output.contains("';' expected"));
}

#[tokio::test]
async fn test_remote_rejection_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/execute"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(json!({ "message": "bash-* runtime is unknown" })),
        )
        .mount(&server)
        .await;

    let err = backend(&server, None)
        .execute(ExecutionRequest::new("sh", "echo hi"))
        .await
        .unwrap_err();

    assert_matches!(err, SandboxError::Remote(ref message) if message.contains("runtime is unknown"));
}

#[tokio::test]
async fn test_unsupported_language_never_reaches_server() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let err = backend(&server, None)
        .execute(ExecutionRequest::new("cobol", "DISPLAY 'HI'."))
        .await
        .unwrap_err();
    assert_matches!(err, SandboxError::UnsupportedLanguage(_));
}

#[tokio::test]
async fn test_backend_selected_by_config() {
    let server = MockServer::start().await;
    let root = tempfile::tempdir().unwrap();

    let mut config = test_config(root.path());
    config.backend.kind = BackendKind::Remote;
    config.backend.remote = Some(remote_config(&server, None));
    let backend = build_backend(&test_pipeline(config)).unwrap();
    assert_eq!(backend.name(), "remote");

    let local = build_backend(&test_pipeline(test_config(root.path()))).unwrap();
    assert_eq!(local.name(), "local");
}

#[tokio::test]
async fn test_remote_kind_without_settings_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(root.path());
    config.backend.kind = BackendKind::Remote;
    config.backend.remote = None;

    let err = coderun_sandbox::ExecutionPipeline::new(config).err().unwrap();
    assert_matches!(err, SandboxError::Config(_));
}
