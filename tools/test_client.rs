//! Test Analysis Client
//!
//! Sends sample code snippets to the inference server over NATS and prints the replies.
//!
//! Usage: test-client [nats_url] [subject] [count] [patch_rate] [delay_ms]

use rand::Rng;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use vuln_inference_server::{
    types::AnalysisOptions, AnalyzeReply, InferenceRequest, Language,
};

/// Sample snippets, vulnerable and clean
const SAMPLES: &[(Language, &str)] = &[
    (Language::C, "strcpy(buf, input);"),
    (
        Language::C,
        "void greet(char *name) {\n  char buf[16];\n  sprintf(buf, \"hi %s\", name);\n  puts(buf);\n}",
    ),
    (
        Language::C,
        "int read_line(void) {\n  char line[64];\n  gets(line);\n  return line[0];\n}",
    ),
    (
        Language::Cpp,
        "void copy(const char *src) {\n  char dst[8];\n  memcpy(dst, src, strlen(src));\n}",
    ),
    (
        Language::C,
        "size_t len(const char *s) {\n  size_t n = 0;\n  while (s[n] != '\\0') n++;\n  return n;\n}",
    ),
    (
        Language::Python,
        "import os\ndef run(cmd):\n    os.system(\"ls \" + cmd)\n",
    ),
];

/// Request generator for testing
struct RequestGenerator {
    rng: rand::rngs::ThreadRng,
    patch_rate: f64,
}

impl RequestGenerator {
    fn new(patch_rate: f64) -> Self {
        Self {
            rng: rand::thread_rng(),
            patch_rate,
        }
    }

    fn generate(&mut self) -> InferenceRequest {
        let (language, code) = SAMPLES[self.rng.gen_range(0..SAMPLES.len())];
        let options = AnalysisOptions {
            include_patch_suggestion: self.rng.gen_bool(self.patch_rate),
            max_results: Some(self.rng.gen_range(1..=5)),
            ..Default::default()
        };

        InferenceRequest::new(code, language)
            .with_request_id(uuid::Uuid::new_v4().to_string())
            .with_options(options)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("test_client=info".parse()?),
        )
        .init();

    info!("Starting Test Analysis Client");

    // Parse arguments
    let args: Vec<String> = std::env::args().collect();
    let nats_url = args.get(1).map(|s| s.as_str()).unwrap_or("nats://localhost:4222");
    let subject = args.get(2).map(|s| s.as_str()).unwrap_or("vuln.analyze");
    let count: u64 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(10);
    let patch_rate: f64 = args
        .get(4)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.2_f64)
        .clamp(0.0, 1.0);
    let delay_ms: u64 = args.get(5).and_then(|s| s.parse().ok()).unwrap_or(100);

    info!(
        nats_url = %nats_url,
        subject = %subject,
        count = count,
        patch_rate = patch_rate,
        delay_ms = delay_ms,
        "Configuration loaded"
    );

    // Connect to NATS
    let client = match async_nats::connect(nats_url).await {
        Ok(c) => {
            info!("Connected to NATS");
            c
        }
        Err(e) => {
            warn!(error = %e, "Failed to connect to NATS. Running in dry-run mode.");
            return run_dry_mode(count, patch_rate, delay_ms).await;
        }
    };

    let mut generator = RequestGenerator::new(patch_rate);
    let mut completed = 0u64;
    let mut errored = 0u64;
    let mut findings = 0usize;

    info!("Sending {} requests...", count);

    for i in 0..count {
        let request = generator.generate();
        let payload = serde_json::to_vec(&request)?;
        let started = Instant::now();

        let message = match client.request(subject.to_string(), payload.into()).await {
            Ok(message) => message,
            Err(e) => {
                warn!(request_id = ?request.request_id, error = %e, "Request failed");
                errored += 1;
                continue;
            }
        };
        let latency = started.elapsed();

        match serde_json::from_slice::<AnalyzeReply>(&message.payload) {
            Ok(AnalyzeReply::Completed(response)) => {
                completed += 1;
                findings += response.findings.len();
                info!(
                    request_id = ?response.request_id,
                    findings = response.findings.len(),
                    models = ?response.model_versions_used,
                    latency_ms = latency.as_millis() as u64,
                    "Completed"
                );
                for finding in &response.findings {
                    info!(
                        "  lines {}-{} {} ({:.2}) by {}{}",
                        finding.line_range.start,
                        finding.line_range.end,
                        finding.category,
                        finding.confidence,
                        finding.model_id,
                        finding
                            .patch_suggestion
                            .as_deref()
                            .map(|p| format!(" -> {p}"))
                            .unwrap_or_default()
                    );
                }
            }
            Ok(AnalyzeReply::Errored { error }) => {
                errored += 1;
                warn!(
                    request_id = ?error.request_id,
                    kind = %error.kind,
                    retryable = error.retryable,
                    "Errored: {}",
                    error.message
                );
            }
            Err(e) => {
                errored += 1;
                warn!(error = %e, "Unreadable reply");
            }
        }

        if (i + 1) % 10 == 0 {
            info!("Sent {}/{} requests ({} completed, {} errored)", i + 1, count, completed, errored);
        }

        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    info!(
        "Done! {} completed, {} errored, {} findings",
        completed, errored, findings
    );

    Ok(())
}

async fn run_dry_mode(count: u64, patch_rate: f64, delay_ms: u64) -> anyhow::Result<()> {
    info!("Running in dry-run mode (no NATS connection)");

    let mut generator = RequestGenerator::new(patch_rate);

    for i in 0..count {
        let request = generator.generate();
        let json = serde_json::to_string_pretty(&request)?;

        if (i + 1) % 10 == 0 || i == 0 {
            info!("Sample request {}:\n{}", i + 1, json);
        }

        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    Ok(())
}
