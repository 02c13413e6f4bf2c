//! Model hot-reload while requests are in flight

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use vuln_inference_server::admin::{execute_reload, handle_admin_payload, ReloadCommand};
use vuln_inference_server::metrics::PipelineMetrics;
use vuln_inference_server::orchestrator::Analyzer;
use vuln_inference_server::types::{InferenceRequest, Language};

/// Version "1.0" is slow and confident, any later version is fast and less confident
fn versioned_factory() -> FakeFactory {
    FakeFactory::new().with("line", |model| {
        if model.version == "1.0" {
            Ok(Box::new(
                KeywordDetector::new(&[("strcpy", 1, 0.9)]).with_delay(Duration::from_millis(300)),
            ))
        } else {
            Ok(Box::new(KeywordDetector::new(&[("strcpy", 1, 0.6)])))
        }
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_in_flight_request_finishes_on_old_version() {
    let mut config = app_config(vec![detection_model("line")]);
    config.registry.models[0].warmup = false;
    let registry = registry(&config, versioned_factory()).await;
    let analyzer = Arc::new(Analyzer::new(
        registry.clone(),
        &config.detection,
        Arc::new(PipelineMetrics::new()),
    ));

    let in_flight = {
        let analyzer = analyzer.clone();
        tokio::spawn(async move {
            analyzer
                .analyze(InferenceRequest::new("strcpy(buf, input);", Language::C))
                .await
        })
    };

    // Let the request capture the v1 handle and reach the worker
    tokio::time::sleep(Duration::from_millis(50)).await;

    let reply = execute_reload(
        &registry,
        ReloadCommand {
            model_id: "line".to_string(),
            path: None,
            version: Some("2.0".to_string()),
        },
    )
    .await;
    assert!(reply.ok, "reload failed: {:?}", reply.error);
    assert_eq!(reply.version.as_deref(), Some("2.0"));
    assert_eq!(reply.loaded_at, Some(registry.get("line").unwrap().loaded_at()));
    assert_eq!(registry.get("line").unwrap().version(), "2.0");

    let old = in_flight.await.unwrap().unwrap();
    assert_eq!(old.model_versions_used["line"], "1.0");
    assert!((old.findings[0].confidence - 0.9).abs() < 1e-6);

    let new = analyzer
        .analyze(InferenceRequest::new("strcpy(buf, input);", Language::C))
        .await
        .unwrap();
    assert_eq!(new.model_versions_used["line"], "2.0");
    assert!((new.findings[0].confidence - 0.6).abs() < 1e-6);
}

#[tokio::test]
async fn test_concurrent_reloads_each_publish() {
    let config = app_config(vec![detection_model("line")]);
    let factory = FakeFactory::new().with("line", |_| Ok(Box::new(KeywordDetector::standard())));
    let registry = registry(&config, factory).await;

    let reload = |version: &str| {
        execute_reload(
            &registry,
            ReloadCommand {
                model_id: "line".to_string(),
                path: None,
                version: Some(version.to_string()),
            },
        )
    };
    let (a, b) = tokio::join!(reload("2.0"), reload("3.0"));
    assert!(a.ok && b.ok);

    // Serialized: the last one to run is what stays published
    let published = registry.get("line").unwrap().version().to_string();
    assert!(published == "2.0" || published == "3.0");
}

#[tokio::test]
async fn test_reload_errors_are_reported() {
    let config = app_config(vec![detection_model("line")]);
    let factory = FakeFactory::new().with("line", |model| {
        if model.path.contains("corrupt") {
            anyhow::bail!("invalid protobuf in {}", model.path)
        }
        Ok(Box::new(KeywordDetector::standard()))
    });
    let registry = registry(&config, factory).await;

    let reply = handle_admin_payload(&registry, br#"{"model_id":"line","path":"models/corrupt.onnx"}"#).await;
    assert!(!reply.ok);
    assert!(reply.error.unwrap().contains("invalid protobuf"));
    assert_eq!(registry.get("line").unwrap().version(), "1.0");

    let reply = handle_admin_payload(&registry, br#"{"model_id":"ghost"}"#).await;
    assert!(!reply.ok);
    assert!(reply.error.unwrap().contains("unknown model"));

    let reply = handle_admin_payload(&registry, b"{").await;
    assert!(!reply.ok);
    assert!(reply.error.unwrap().contains("invalid reload command"));
}
