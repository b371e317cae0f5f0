//! The configured stack: config file → App → HTTP backends (mocked with
//! wiremock) → a stand-in converter script.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use docscribe::config::load_config_from_str;
use docscribe::db::Database;
use docscribe::{App, ArtifactKind, JobStatus, RunOutcome, Stage};

fn converter_script(dir: &Path) -> String {
    let script = dir.join("fake-pandoc.sh");
    std::fs::write(&script, "#!/bin/sh\ncp \"$1\" \"$3\"\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    script.display().to_string()
}

fn app(dir: &Path, asr: &MockServer, llm: &MockServer, control: &MockServer) -> App {
    let config = json!({
        "version": "1.0",
        "storage": { "artifact_directory": dir.join("artifacts") },
        "inference": {
            "submit_url": format!("{}/transcribe", asr.uri()),
            "result_url": format!("{}/result", asr.uri()),
            "api_key": { "value": "asr-key" },
            "poll_interval_ms": 5,
            "submit_retry": { "max_attempts": 2, "backoff": { "kind": "fixed", "delay_ms": 1 } }
        },
        "lease": {
            "enabled": true,
            "start_url": format!("{}/start", control.uri()),
            "stop_url": format!("{}/stop", control.uri()),
            "resource_id": "gpu-1",
            "credentials": { "value": "cloud-token" },
            "warm_up_secs": 0,
            "start_retry": { "max_attempts": 3, "backoff": { "kind": "fixed", "delay_ms": 1 } }
        },
        "proofreading": {
            "provider": "openai",
            "base_url": llm.uri(),
            "model": "local-model"
        },
        "conversion": { "pandoc_path": converter_script(dir) }
    });
    let config = load_config_from_str(&config.to_string()).unwrap();
    let app = App::with_database(&config, Database::open_in_memory().unwrap()).unwrap();

    for stage in [Stage::Transcribe, Stage::Proofread] {
        let prompt = app.store.add_prompt(stage, "Be accurate.").unwrap();
        app.store.activate_prompt(stage, prompt.id).unwrap();
    }
    app
}

async fn control_server() -> MockServer {
    let server = MockServer::start().await;
    for endpoint in ["/start", "/stop"] {
        Mock::given(method("POST"))
            .and(path(endpoint))
            .and(body_partial_json(json!({ "resource_id": "gpu-1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
            .expect(1)
            .mount(&server)
            .await;
    }
    server
}

#[tokio::test]
async fn audio_becomes_a_document_through_http_backends() {
    let dir = tempfile::tempdir().unwrap();
    let audio = dir.path().join("meeting.mp3");
    std::fs::write(&audio, b"ID3 fake audio").unwrap();

    let asr = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/transcribe"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "message": "queued" })))
        .expect(1)
        .mount(&asr)
        .await;
    Mock::given(method("POST"))
        .and(path("/result"))
        .respond_with(ResponseTemplate::new(200).set_body_string("teh meeting started late"))
        .mount(&asr)
        .await;

    let llm = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({ "model": "local-model" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "role": "assistant", "content": "The meeting started late." } }]
        })))
        .expect(1)
        .mount(&llm)
        .await;

    let control = control_server().await;
    let app = app(dir.path(), &asr, &llm, &control);

    let (job, handle) = app
        .service
        .submit_tracked("alice", &audio.display().to_string())
        .unwrap();
    let outcome = handle.await.unwrap();
    app.runner.wait().await;
    assert!(outcome.is_completed(), "{:?}", outcome);

    let job = app.service.status("alice", &job.id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let transcript = app
        .service
        .artifact("alice", &job.id, ArtifactKind::Transcript)
        .unwrap();
    assert_eq!(transcript.content, b"teh meeting started late");

    let document = app
        .service
        .artifact("alice", &job.id, ArtifactKind::Document)
        .unwrap();
    assert_eq!(document.content, b"The meeting started late.");
    assert!(document.path.ends_with("meeting.docx"));

    assert!(!app.store.resource_running().unwrap());
}

#[tokio::test]
async fn backend_rejection_is_recorded_once() {
    let dir = tempfile::tempdir().unwrap();
    let audio = dir.path().join("noise.wav");
    std::fs::write(&audio, b"RIFF").unwrap();

    let asr = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/transcribe"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({ "error": "bad audio" })))
        .expect(1)
        .mount(&asr)
        .await;
    Mock::given(method("POST"))
        .and(path("/result"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&asr)
        .await;

    let llm = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&llm)
        .await;

    // The resource is started for the attempt and released after the failure.
    let control = control_server().await;
    let app = app(dir.path(), &asr, &llm, &control);

    let (job, handle) = app
        .service
        .submit_tracked("bob", &audio.display().to_string())
        .unwrap();
    assert!(matches!(handle.await.unwrap(), RunOutcome::Failed { .. }));
    app.runner.wait().await;

    let logs = app.service.error_logs(10).unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].job_id, job.id);
    assert_eq!(logs[0].message, "Inference API Error: bad audio");
    assert_eq!(
        app.service.status("bob", &job.id).unwrap().status,
        JobStatus::Error
    );
    assert!(!app.store.resource_running().unwrap());
}
