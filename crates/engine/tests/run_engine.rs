//! Run engine integration tests
//!
//! Exercises the full start -> step loop -> finalize path against an
//! in-memory store and a scripted browser.

mod support;

use qaflow_common::{Browser, RunStatus, StepStatus};
use qaflow_engine::{CancelOutcome, EngineError, RunEvent, RunOptions, MAX_STEP_TIMEOUT};
use std::path::Path;
use std::time::Duration;
use support::*;

#[tokio::test]
async fn test_expectation_timeout_is_recorded_with_screenshot() {
    let h = harness_with(
        ScriptedInstaller::installed(),
        RunOptions {
            continue_on_failure: false,
            step_timeout: Duration::from_millis(100),
        },
    );
    h.driver.on("dashboard is visible", Behavior::Hang);
    let tc = seed(&h.engine, &[r#"Click "Login""#, "Expect dashboard is visible"]);

    let run = h.engine.execute(&tc.id, Browser::Chromium).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.ended_at.is_some());
    assert!(run.error.is_none());

    let results = h.engine.step_results(&run.id).unwrap();
    let statuses: Vec<_> = results.iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![StepStatus::Passed, StepStatus::Failed]);
    assert!(results[0].error_text.is_none());
    assert_eq!(results[1].error_text.as_deref(), Some("Step timed out after 0.1s"));
    for result in &results {
        let path = result.screenshot_path.as_deref().unwrap();
        assert!(Path::new(path).exists());
        assert!(result.ended_at.is_some());
    }
}

#[tokio::test]
async fn test_failed_action_error_is_recorded() {
    let h = harness();
    h.driver.on(
        "dashboard is visible",
        Behavior::Fail("Expectation not met: visible \"dashboard\"".into()),
    );
    let tc = seed(&h.engine, &[r#"Go to "/login""#, "Expect dashboard is visible"]);

    let run = h.engine.execute(&tc.id, Browser::Chromium).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    let results = h.engine.step_results(&run.id).unwrap();
    assert_eq!(
        results[1].error_text.as_deref(),
        Some("Expectation not met: visible \"dashboard\"")
    );
    assert!(results[1].screenshot_path.is_some());
}

#[tokio::test]
async fn test_stop_on_first_failure() {
    let h = harness();
    h.driver.on("Pay", Behavior::Fail("Element not found: Pay".into()));
    let tc = seed(
        &h.engine,
        &[r#"Go to "/cart""#, r#"Click "Pay""#, r#"Click "Confirm""#, "Expect receipt is visible"],
    );

    let run = h.engine.execute(&tc.id, Browser::Chromium).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    let results = h.engine.step_results(&run.id).unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[1].order, 2);
    assert_eq!(h.driver.executed().len(), 2);
}

#[tokio::test]
async fn test_continue_on_failure_runs_every_step() {
    let h = harness_with(ScriptedInstaller::installed(), options(true));
    h.driver.on("Pay", Behavior::Fail("Element not found: Pay".into()));
    let tc = seed(
        &h.engine,
        &[r#"Go to "/cart""#, r#"Click "Pay""#, r#"Click "Confirm""#, "Expect receipt is visible"],
    );

    let run = h.engine.execute(&tc.id, Browser::Chromium).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    let statuses: Vec<_> = h
        .engine
        .step_results(&run.id)
        .unwrap()
        .iter()
        .map(|r| r.status)
        .collect();
    assert_eq!(
        statuses,
        vec![StepStatus::Passed, StepStatus::Failed, StepStatus::Passed, StepStatus::Passed]
    );
}

#[tokio::test]
async fn test_all_steps_pass() {
    let h = harness();
    let tc = seed(
        &h.engine,
        &[r#"Go to "/login""#, r#"Enter "bob" in "Username" field"#, r#"Click "Login""#],
    );

    let run = h.engine.execute(&tc.id, Browser::Firefox).await.unwrap();
    assert_eq!(run.status, RunStatus::Passed);
    assert_eq!(run.browser, Browser::Firefox);
    assert_eq!(h.engine.step_results(&run.id).unwrap().len(), 3);
    assert!(h.engine.active_context().is_none());
}

#[tokio::test]
async fn test_step_timeout_fails_step() {
    let h = harness_with(
        ScriptedInstaller::installed(),
        RunOptions {
            continue_on_failure: false,
            step_timeout: Duration::from_millis(100),
        },
    );
    h.driver.on("Spinner", Behavior::Hang);
    let tc = seed(&h.engine, &[r#"Click "Spinner""#, r#"Click "Next""#]);

    let run = h.engine.execute(&tc.id, Browser::Chromium).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    let results = h.engine.step_results(&run.id).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].error_text.as_deref(), Some("Step timed out after 0.1s"));
}

#[tokio::test]
async fn test_screenshot_failure_leaves_path_empty() {
    let h = harness();
    h.driver.fail_screenshots();
    let tc = seed(&h.engine, &[r#"Go to "/""#]);

    let run = h.engine.execute(&tc.id, Browser::Chromium).await.unwrap();
    assert_eq!(run.status, RunStatus::Passed);
    let results = h.engine.step_results(&run.id).unwrap();
    assert_eq!(results[0].status, StepStatus::Passed);
    assert!(results[0].screenshot_path.is_none());
}

#[tokio::test]
async fn test_second_start_is_rejected_while_running() {
    let h = harness();
    h.driver.on("/slow", Behavior::Delay(Duration::from_millis(300)));
    let tc = seed(&h.engine, &[r#"Go to "/slow""#]);
    let project = h.engine.create_project("Other").unwrap();
    let (other, _) = h
        .engine
        .create_test_case(&project.id, "Other", &[r#"Go to "/""#.to_string()])
        .unwrap();

    let handle = h.engine.start(&tc.id, Browser::Chromium).await.unwrap();
    assert_eq!(handle.run().status, RunStatus::Running);
    assert_eq!(h.engine.active_context().unwrap().run_id, handle.run_id());

    let err = h.engine.start(&tc.id, Browser::Chromium).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyRunning { run_id: Some(ref id) } if id == handle.run_id()));
    let err = h.engine.start(&other.id, Browser::Webkit).await.unwrap_err();
    assert_eq!(err.to_string(), "A run is already active.");

    handle.wait().await.unwrap();
    assert_eq!(h.engine.history(&tc.id).unwrap().len(), 1);
    assert!(h.engine.history(&other.id).unwrap().is_empty());

    // The slot is free again
    let run = h.engine.execute(&other.id, Browser::Webkit).await.unwrap();
    assert_eq!(run.status, RunStatus::Passed);
}

#[tokio::test]
async fn test_concurrent_starts_admit_one_run() {
    let h = harness();
    h.driver.on("/slow", Behavior::Delay(Duration::from_millis(200)));
    let tc = seed(&h.engine, &[r#"Go to "/slow""#]);

    let starts: Vec<_> = (0..6)
        .map(|_| {
            let engine = h.engine.clone();
            let id = tc.id.clone();
            tokio::spawn(async move { engine.start(&id, Browser::Chromium).await })
        })
        .collect();

    let mut handles = Vec::new();
    let mut rejected = 0;
    for start in starts {
        match start.await.unwrap() {
            Ok(handle) => handles.push(handle),
            Err(EngineError::AlreadyRunning { .. }) => rejected += 1,
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
    assert_eq!(handles.len(), 1);
    assert_eq!(rejected, 5);
    for handle in handles {
        handle.wait().await.unwrap();
    }
    assert_eq!(h.engine.history(&tc.id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_cancel_mid_run() {
    let h = harness();
    for path in ["/a", "/b", "/c"] {
        h.driver.on(path, Behavior::Delay(Duration::from_millis(200)));
    }
    let tc = seed(&h.engine, &[r#"Go to "/a""#, r#"Go to "/b""#, r#"Go to "/c""#]);
    let mut events = h.engine.subscribe();

    let handle = h.engine.start(&tc.id, Browser::Chromium).await.unwrap();
    let run_id = handle.run_id().to_string();
    loop {
        if let RunEvent::StepStarted { order: 1, .. } = events.recv().await.unwrap() {
            break;
        }
    }
    assert_eq!(h.engine.cancel("some-other-run"), CancelOutcome::NoActiveRun);
    assert_eq!(h.engine.cancel(&run_id), CancelOutcome::Accepted);

    let run = handle.wait().await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(run.ended_at.is_some());
    assert!(run.error.is_none());

    let results = h.engine.step_results(&run_id).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, StepStatus::Cancelled);
    assert!(results[0].error_text.is_none());

    // Cancel after finish never touches the run
    assert_eq!(h.engine.cancel(&run_id), CancelOutcome::NoActiveRun);
    assert_eq!(h.engine.get_run(&run_id).unwrap().status, RunStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_wins_over_continue_on_failure() {
    let h = harness_with(ScriptedInstaller::installed(), options(true));
    h.driver.on("Pay", Behavior::Fail("Element not found: Pay".into()));
    h.driver.on("/receipt", Behavior::Delay(Duration::from_millis(300)));
    let tc = seed(
        &h.engine,
        &[r#"Click "Pay""#, r#"Go to "/receipt""#, r#"Click "Done""#, r#"Go to "/""#],
    );
    let mut events = h.engine.subscribe();

    let handle = h.engine.start(&tc.id, Browser::Chromium).await.unwrap();
    let run_id = handle.run_id().to_string();
    loop {
        if let RunEvent::StepStarted { order: 2, .. } = events.recv().await.unwrap() {
            break;
        }
    }
    assert_eq!(h.engine.cancel(&run_id), CancelOutcome::Accepted);

    let run = handle.wait().await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);

    let results = h.engine.step_results(&run_id).unwrap();
    let statuses: Vec<_> = results.iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![StepStatus::Failed, StepStatus::Cancelled]);
    assert_eq!(h.driver.executed().len(), 2);
}

#[tokio::test]
async fn test_out_of_range_step_timeout_is_rejected() {
    let h = harness();
    let tc = seed(&h.engine, &[r#"Click "Save" after 1s"#]);

    for step_timeout in [Duration::ZERO, Duration::from_secs(u64::MAX)] {
        let err = h
            .engine
            .start_with(
                &tc.id,
                Browser::Chromium,
                RunOptions {
                    continue_on_failure: false,
                    step_timeout,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
    assert!(h.engine.history(&tc.id).unwrap().is_empty());
    assert!(h.engine.active_context().is_none());

    // The longest accepted timeout plus a requested wait still finishes
    let handle = h
        .engine
        .start_with(
            &tc.id,
            Browser::Chromium,
            RunOptions {
                continue_on_failure: false,
                step_timeout: MAX_STEP_TIMEOUT,
            },
        )
        .await
        .unwrap();
    assert_eq!(handle.wait().await.unwrap().status, RunStatus::Passed);
}

#[tokio::test]
async fn test_install_failure_writes_no_run() {
    let h = harness_with(ScriptedInstaller::broken("network unreachable"), options(false));
    let tc = seed(&h.engine, &[r#"Go to "/""#]);

    let err = h.engine.start(&tc.id, Browser::Webkit).await.unwrap_err();
    assert!(matches!(err, EngineError::Environment(ref msg) if msg == "network unreachable"));
    assert!(h.engine.history(&tc.id).unwrap().is_empty());
    assert!(h.engine.active_context().is_none());
    assert_eq!(h.driver.launches(), 0);

    let state = h.engine.browsers().state(Browser::Webkit);
    assert_eq!(state.last_error.as_deref(), Some("network unreachable"));

    // A later start makes a fresh attempt
    assert!(h.engine.start(&tc.id, Browser::Webkit).await.is_err());
    assert_eq!(h.installer.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_start_installs_missing_engine_first() {
    let h = harness_with(ScriptedInstaller::missing(Duration::from_millis(20)), options(false));
    let tc = seed(&h.engine, &[r#"Go to "/""#]);

    let run = h.engine.execute(&tc.id, Browser::Firefox).await.unwrap();
    assert_eq!(run.status, RunStatus::Passed);
    assert!(h.engine.browsers().state(Browser::Firefox).installed);
    assert_eq!(h.installer.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_launch_failure_fails_run_without_steps() {
    let h = harness();
    h.driver.fail_launch("browser executable missing");
    let tc = seed(&h.engine, &[r#"Go to "/""#]);

    let run = h.engine.execute(&tc.id, Browser::Chromium).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.as_deref().unwrap().contains("browser executable missing"));
    assert!(h.engine.step_results(&run.id).unwrap().is_empty());
    assert!(h.engine.active_context().is_none());
}

#[tokio::test]
async fn test_rejects_invalid_starts() {
    let h = harness();
    let err = h.engine.start("missing", Browser::Chromium).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));

    let tc = seed(&h.engine, &[]);
    let err = h.engine.start(&tc.id, Browser::Chromium).await.unwrap_err();
    assert_eq!(err.to_string(), "Test case has no steps.");
    assert!(h.engine.history(&tc.id).unwrap().is_empty());
}

#[tokio::test]
async fn test_events_follow_the_store() {
    let h = harness();
    let tc = seed(&h.engine, &[r#"Go to "/""#, r#"Click "Start""#]);
    let mut rx = h.engine.subscribe();

    let handle = h.engine.start(&tc.id, Browser::Chromium).await.unwrap();
    let run_id = handle.run_id().to_string();
    let events = collect_until_finished(&mut rx).await;

    let names: Vec<_> = events
        .iter()
        .map(|e| serde_json::to_value(e).unwrap()["event"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(
        names,
        vec![
            "run-started",
            "step-started",
            "step-finished",
            "step-started",
            "step-finished",
            "run-finished"
        ]
    );
    assert!(events.iter().all(|e| e.run_id() == run_id));

    // Once run-finished is seen the store and the slot agree
    assert!(h.engine.active_context().is_none());
    let status = h.engine.status(&run_id).unwrap();
    assert_eq!(status.run.status, RunStatus::Passed);
    assert_eq!(status.steps.len(), 2);
    handle.wait().await.unwrap();
}

#[tokio::test]
async fn test_deletes_are_refused_during_run() {
    let h = harness();
    h.driver.on("/slow", Behavior::Delay(Duration::from_millis(300)));
    let tc = seed(&h.engine, &[r#"Go to "/slow""#]);
    let project_id = tc.project_id.clone();

    let handle = h.engine.start(&tc.id, Browser::Chromium).await.unwrap();
    assert!(matches!(
        h.engine.delete_test_case(&tc.id),
        Err(EngineError::RunInProgress { .. })
    ));
    assert!(matches!(
        h.engine.delete_project(&project_id),
        Err(EngineError::RunInProgress { .. })
    ));

    let run = handle.wait().await.unwrap();
    let screenshot = h.engine.step_results(&run.id).unwrap()[0]
        .screenshot_path
        .clone()
        .unwrap();
    assert!(Path::new(&screenshot).exists());

    h.engine.delete_project(&project_id).unwrap();
    assert!(!Path::new(&screenshot).exists());
    assert!(matches!(
        h.engine.get_test_case(&tc.id),
        Err(EngineError::NotFound { .. })
    ));
    assert!(matches!(
        h.engine.delete_project(&project_id),
        Err(EngineError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_report_includes_step_text_and_digests() {
    let h = harness();
    h.driver.on("Login", Behavior::Fail("Element not found: Login".into()));
    let tc = seed(&h.engine, &[r#"Go to "/login""#, r#"Click "Login""#]);

    let run = h.engine.execute(&tc.id, Browser::Chromium).await.unwrap();
    let report = h.engine.report(&run.id).unwrap();

    assert_eq!(report.test_case.id, tc.id);
    assert_eq!(report.steps.len(), 2);
    assert_eq!(report.steps[1].raw_text.as_deref(), Some(r#"Click "Login""#));
    assert_eq!(report.steps[1].action.as_deref(), Some("click Login"));
    assert_eq!(report.steps[1].status, StepStatus::Failed);
    assert_eq!(report.steps[1].screenshot_sha256.as_ref().unwrap().len(), 64);
}
