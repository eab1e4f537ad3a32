mod common;

use common::{FakeSurface, ScriptedBackend, config, sample_report};
use report_forge::{
    AttemptError, GenerateError, GenerationOutcome, ReportGenerator, Stage,
    cancel::CancelToken,
    config::RetryPolicy,
    retry::{Backoff, WaitOutcome},
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[test]
fn delay_grows_exponentially() {
    let backoff = Backoff::new(RetryPolicy {
        max_retries: 4,
        retry_delay_ms: 100,
        backoff_multiplier: 2.0,
    });
    assert_eq!(backoff.max_attempts(), 5);
    assert_eq!(backoff.delay(0), Duration::from_millis(100));
    assert_eq!(backoff.delay(1), Duration::from_millis(200));
    assert_eq!(backoff.delay(3), Duration::from_millis(800));

    let flat = Backoff::new(RetryPolicy {
        max_retries: 1,
        retry_delay_ms: 250,
        backoff_multiplier: 1.0,
    });
    assert_eq!(flat.delay(5), Duration::from_millis(250));
}

#[tokio::test(start_paused = true)]
async fn wait_returns_early_when_cancelled() {
    let backoff = Backoff::new(RetryPolicy {
        max_retries: 1,
        retry_delay_ms: 10_000,
        backoff_multiplier: 1.0,
    });
    let cancel = CancelToken::new();
    let started = tokio::time::Instant::now();
    let (outcome, _) = tokio::join!(backoff.wait(0, &cancel), async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
    });
    assert_eq!(outcome, WaitOutcome::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn every_attempt_failing_exhausts_retries() {
    for max_retries in [0u32, 1, 3] {
        let dir = tempfile::tempdir().expect("tempdir");
        let generator = ReportGenerator::new(
            ScriptedBackend::always_failing(),
            &config(max_retries, 10, 2.0),
        )
        .expect("generator")
        .with_out_dir(dir.path());

        let err = generator
            .generate(&sample_report(), &FakeSurface::new(200, 100))
            .await
            .expect_err("must fail");

        assert_eq!(generator.backend().calls(), max_retries + 1);
        match err {
            GenerateError::ExhaustedRetries { attempts, last } => {
                assert_eq!(attempts, max_retries + 1);
                assert!(matches!(last, AttemptError::RenderCapture(_)));
            }
            other => panic!("unexpected error {other:?}"),
        }
        let status = generator.status();
        assert!(!status.is_generating);
        assert!(!status.completed);
        assert_eq!(status.stage, Stage::Failed);
        let message = status.error.expect("terminal error message");
        assert!(message.contains(&format!("boom {}", max_retries + 1)));
        assert_eq!(std::fs::read_dir(dir.path()).expect("read dir").count(), 0);
    }
}

#[tokio::test(start_paused = true)]
async fn waits_follow_backoff_schedule_then_succeed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let generator = ReportGenerator::new(ScriptedBackend::failing_first(2), &config(2, 100, 2.0))
        .expect("generator")
        .with_out_dir(dir.path());
    let retries = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&retries);
    generator.on_retry(move |attempt, msg| seen.lock().unwrap().push((attempt, msg.to_string())));

    let outcome = generator
        .generate(&sample_report(), &FakeSurface::new(200, 100))
        .await
        .expect("generate");

    let times = generator.backend().times();
    assert_eq!(times.len(), 3);
    assert_eq!(times[1] - times[0], Duration::from_millis(100));
    assert_eq!(times[2] - times[1], Duration::from_millis(200));

    let retries = retries.lock().unwrap().clone();
    assert_eq!(retries.len(), 2);
    assert_eq!(retries[0].0, 1);
    assert!(retries[0].1.contains("boom 1"));
    assert_eq!(retries[1].0, 2);

    let status = generator.status();
    assert!(status.completed);
    assert!(status.error.is_none());
    match outcome {
        GenerationOutcome::Completed(summary) => {
            assert_eq!(summary.attempts, 3);
            assert!(summary.path.exists());
        }
        GenerationOutcome::Cancelled => panic!("unexpected cancellation"),
    }
}

#[tokio::test]
async fn non_transient_failure_skips_retries() {
    let backend = ScriptedBackend::succeeding();
    backend.push_failure(AttemptError::UnsupportedEnvironment("no canvas".into()));
    let dir = tempfile::tempdir().expect("tempdir");
    let generator = ReportGenerator::new(backend, &config(5, 0, 1.0))
        .expect("generator")
        .with_out_dir(dir.path());

    let err = generator
        .generate(&sample_report(), &FakeSurface::new(200, 100))
        .await
        .expect_err("fatal");
    assert!(matches!(err, GenerateError::UnsupportedEnvironment(_)));
    assert_eq!(err.to_string(), "unsupported environment: no canvas");
    assert_eq!(generator.backend().calls(), 1);
    assert_eq!(
        generator.status().error.as_deref(),
        Some("unsupported environment: no canvas")
    );
}
