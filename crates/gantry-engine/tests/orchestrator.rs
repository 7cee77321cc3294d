//! End-to-end runs driven through `sh`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use gantry_engine::cancel::SUPERSEDED;
use gantry_engine::config::parser::parse_pipeline_str;
use gantry_engine::config::types::PipelineConfig;
use gantry_engine::{create_state_backend, Orchestrator, StageState};
use gantry_types::coverage::CombinedReport;
use gantry_types::state::{PipelineId, RefName, RunStatus, TriggerEvent};

fn pipeline(root: &Path, yaml: &str) -> PipelineConfig {
    let mut config = parse_pipeline_str(yaml).unwrap();
    let workspace = root.join("ws");
    std::fs::create_dir_all(&workspace).unwrap();
    config.workspace = workspace;
    config.output.dir = root.join("out");
    config
}

fn orchestrator(config: &PipelineConfig) -> Arc<Orchestrator> {
    Arc::new(Orchestrator::new(create_state_backend(config).unwrap()))
}

async fn wait_for(path: &Path) {
    for _ in 0..200 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("{} never appeared", path.display());
}

#[tokio::test]
async fn external_clone_failure_fails_only_its_instance() {
    let dir = tempfile::tempdir().unwrap();
    let config = pipeline(
        dir.path(),
        r#"
version: "1.0"
pipeline: integration
matrix:
  axes:
    - { name: sim, values: [good, bad] }
stages:
  - name: simulator
    external:
      repository: "https://example.invalid/sim.git"
      revision: v1
      path: sim
      clone: "test {{ matrix.sim }} = good && mkdir -p {{ path }}"
      build: "mkdir -p bin"
      bin_dirs: [bin]
  - name: tests
    test:
      suites:
        - { name: integration, command: "touch ran-{{ matrix.sim }}" }
"#,
    );
    let outcome = orchestrator(&config)
        .run(&config, &TriggerEvent::new("pr-1", "abc", false))
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.exit_code(), 1);

    let bad = outcome.instance("sim=bad").unwrap();
    assert_eq!(bad.status, RunStatus::Failed);
    assert_eq!(bad.error_kind.as_deref(), Some("external_build"));
    assert!(bad.error.as_deref().unwrap().contains("clone"));
    assert_eq!(bad.stage("tests").unwrap().state, StageState::Skipped);
    assert!(!config.workspace.join("ran-bad").exists());

    let good = outcome.instance("sim=good").unwrap();
    assert_eq!(good.status, RunStatus::Succeeded);
    assert!(config.workspace.join("ran-good").exists());
}

#[tokio::test]
async fn failing_suite_is_enumerated_and_coverage_still_combined() {
    let dir = tempfile::tempdir().unwrap();
    let config = pipeline(
        dir.path(),
        r#"
version: "1.0"
pipeline: unit
stages:
  - name: tests
    test:
      coverage: combined
      suites:
        - name: s1
          command: "echo '{\"files\":{\"a.py\":{\"1\":1}}}' > $GANTRY_COVERAGE_FILE"
        - name: s2
          command: "echo '{\"files\":{\"a.py\":{\"2\":1}}}' > $GANTRY_COVERAGE_FILE; exit 1"
        - name: s3
          command: "echo '{\"files\":{\"a.py\":{\"3\":1}}}' > $GANTRY_COVERAGE_FILE"
  - name: coverage
    report: {}
"#,
    );
    let outcome = orchestrator(&config)
        .run(&config, &TriggerEvent::new("pr-2", "abc", false))
        .await
        .unwrap();

    let instance = &outcome.instances[0];
    assert_eq!(instance.status, RunStatus::Failed);
    assert_eq!(instance.failing_suites, vec!["s2".to_string()]);
    assert!(instance.error_kind.is_none());
    let suites = &instance.stage("tests").unwrap().suites;
    assert_eq!(suites.len(), 3);
    assert_eq!(instance.stage("coverage").unwrap().state, StageState::Succeeded);

    let report: CombinedReport = serde_json::from_slice(
        &std::fs::read(instance.dir.join("combined-coverage.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(report.sources.len(), 3);
    assert_eq!(report.data.files["a.py"].len(), 3);
    // Combined mode leaves no per-invocation files behind.
    assert_eq!(std::fs::read_dir(instance.dir.join("coverage")).unwrap().count(), 0);
}

#[tokio::test]
async fn timeout_is_fatal_and_stops_later_stages() {
    let dir = tempfile::tempdir().unwrap();
    let config = pipeline(
        dir.path(),
        r#"
version: "1.0"
pipeline: unit
defaults:
  kill_grace_seconds: 1
stages:
  - name: install
    timeout_seconds: 1
    run: { command: "sleep 30" }
  - name: tests
    run: { command: "touch tests-ran" }
"#,
    );
    let outcome = orchestrator(&config)
        .run(&config, &TriggerEvent::new("pr-3", "abc", false))
        .await
        .unwrap();
    let instance = &outcome.instances[0];
    assert_eq!(instance.status, RunStatus::Failed);
    assert_eq!(instance.error_kind.as_deref(), Some("timeout"));
    assert_eq!(instance.stage("tests").unwrap().state, StageState::Skipped);
    assert!(!config.workspace.join("tests-ran").exists());
}

#[tokio::test]
async fn new_trigger_supersedes_running_pull_request_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = pipeline(
        dir.path(),
        r#"
version: "1.0"
pipeline: unit
stages:
  - name: build
    run: { command: "touch started-{{ git.commit }}; sleep 30" }
  - name: tests
    run: { command: "true" }
"#,
    );
    let fast = pipeline(
        dir.path(),
        r#"
version: "1.0"
pipeline: unit
stages:
  - name: build
    run: { command: "touch started-{{ git.commit }}" }
  - name: tests
    run: { command: "true" }
"#,
    );
    let orch = orchestrator(&config);

    let first = {
        let orch = Arc::clone(&orch);
        let config = config.clone();
        tokio::spawn(async move {
            orch.run(&config, &TriggerEvent::new("pr-7", "old", false))
                .await
        })
    };
    wait_for(&config.workspace.join("started-old")).await;

    let second = orch
        .run(&fast, &TriggerEvent::new("pr-7", "new", false))
        .await
        .unwrap();
    let first = tokio::time::timeout(Duration::from_secs(20), first)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(first.status, RunStatus::Cancelled);
    assert_eq!(first.exit_code(), 130);
    let stages = &first.instances[0];
    assert_eq!(stages.stage("build").unwrap().state, StageState::Cancelled);
    assert_eq!(stages.stage("tests").unwrap().state, StageState::Cancelled);

    assert_eq!(second.status, RunStatus::Succeeded);
    assert!(config.workspace.join("started-new").exists());

    let state = orch.controller().state();
    let record = state.get_run(first.run_id).unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Cancelled);
}

#[tokio::test]
async fn protected_branch_runs_are_never_preempted() {
    let dir = tempfile::tempdir().unwrap();
    let config = pipeline(
        dir.path(),
        r#"
version: "1.0"
pipeline: unit
protected_branch: main
stages:
  - name: build
    run: { command: "touch started-{{ git.commit }}; sleep 1" }
"#,
    );
    let orch = orchestrator(&config);
    let first = {
        let orch = Arc::clone(&orch);
        let config = config.clone();
        tokio::spawn(async move {
            orch.run(&config, &TriggerEvent::new("main", "c1", false))
                .await
        })
    };
    wait_for(&config.workspace.join("started-c1")).await;
    let second = orch
        .run(&config, &TriggerEvent::new("main", "c2", false))
        .await
        .unwrap();
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.status, RunStatus::Succeeded);
    assert_eq!(second.status, RunStatus::Succeeded);
}

#[tokio::test]
async fn cancelling_a_finished_run_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let config = pipeline(
        dir.path(),
        r#"
version: "1.0"
pipeline: unit
stages:
  - name: build
    run: { command: "true" }
"#,
    );
    let orch = orchestrator(&config);
    let outcome = orch
        .run(&config, &TriggerEvent::new("pr-9", "abc", false))
        .await
        .unwrap();
    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert!(!orch.cancel(outcome.run_id).unwrap());
    assert!(!orch.cancel(outcome.run_id).unwrap());
    let record = orch.controller().state().get_run(outcome.run_id).unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Succeeded);
}

#[tokio::test]
async fn run_directory_holds_results_and_logs() {
    let dir = tempfile::tempdir().unwrap();
    let config = pipeline(
        dir.path(),
        r#"
version: "1.0"
pipeline: unit
matrix:
  axes:
    - { name: python, values: ["3.8", "3.9"] }
  max_parallel: 1
stages:
  - name: hello
    run: { command: "echo python {{ matrix.python }}" }
"#,
    );
    let orch = orchestrator(&config);
    let outcome = orch
        .run(&config, &TriggerEvent::new("pr-10", "abc", false))
        .await
        .unwrap();
    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert!(outcome.dir.join("run.json").is_file());
    assert_eq!(outcome.instances.len(), 2);
    for (instance, version) in outcome.instances.iter().zip(["3.8", "3.9"]) {
        assert!(instance.dir.join("results.json").is_file());
        let log = std::fs::read_to_string(instance.dir.join("logs/hello.log")).unwrap();
        assert!(log.contains(&format!("python {version}")), "{log}");
    }
    let instances = orch
        .controller()
        .state()
        .list_instances(outcome.run_id)
        .unwrap();
    assert!(instances.iter().all(|i| i.status == RunStatus::Succeeded));
}

#[tokio::test]
async fn external_supersede_cancels_only_the_marked_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let unit = pipeline(
        dir.path(),
        r#"
version: "1.0"
pipeline: unit
stages:
  - name: build
    run: { command: "touch started-unit; sleep 30" }
"#,
    );
    let integration = pipeline(
        dir.path(),
        r#"
version: "1.0"
pipeline: integration
stages:
  - name: build
    run: { command: "touch started-integration; sleep 1" }
"#,
    );
    // One process, one orchestrator per pipeline, one shared state DB.
    let unit_orch = orchestrator(&unit);
    let integration_orch = orchestrator(&integration);
    let trigger = TriggerEvent::new("pr-7", "aaa", false);

    let unit_run = {
        let (orch, config, trigger) = (Arc::clone(&unit_orch), unit.clone(), trigger.clone());
        tokio::spawn(async move { orch.run(&config, &trigger).await })
    };
    let integration_run = {
        let (orch, config, trigger) =
            (Arc::clone(&integration_orch), integration.clone(), trigger.clone());
        tokio::spawn(async move { orch.run(&config, &trigger).await })
    };
    wait_for(&unit.workspace.join("started-unit")).await;
    wait_for(&unit.workspace.join("started-integration")).await;

    // Another process superseded the unit run: it is marked in the shared
    // store, then this process re-reads its runs on SIGTERM.
    let state = create_state_backend(&unit).unwrap();
    let active = state
        .active_runs(&PipelineId::new("unit"), &RefName::new("pr-7"))
        .unwrap();
    assert_eq!(active.len(), 1);
    assert!(state
        .finish_run(active[0].id, RunStatus::Cancelled, Some(SUPERSEDED))
        .unwrap());
    assert_eq!(unit_orch.cancel_marked().unwrap(), 1);
    assert_eq!(integration_orch.cancel_marked().unwrap(), 0);

    let unit_outcome = tokio::time::timeout(Duration::from_secs(20), unit_run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let integration_outcome = integration_run.await.unwrap().unwrap();
    assert_eq!(unit_outcome.status, RunStatus::Cancelled);
    assert_eq!(integration_outcome.status, RunStatus::Succeeded);
    let record = state.get_run(integration_outcome.run_id).unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Succeeded);
}
