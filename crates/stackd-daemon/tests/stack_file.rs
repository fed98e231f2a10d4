//! A stack file on disk driven end to end with scripted collaborators.

#![allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use stackd_core::load_stack;
use stackd_daemon::lifecycle::{InstanceState, Orchestrator};
use stackd_daemon::testing::{ScriptedProber, ScriptedRunner};

const STACK: &str = r#"
[orchestrator]
stop_grace_secs = 1
history = 4

[capacity]
gpu = 1

[restart]
initial_delay_ms = 10
max_delay_ms = 50
max_restarts = 2

[services.db]
image = "/opt/db/server"
ports = [5432]

[services.db.health_check]
kind = "tcp"
target = "5432"
interval_ms = 10

[services.llm]
image = "/opt/llm/serve"
args = ["--port", "11434"]
ports = [11434]
depends_on = ["db"]
env = { MODEL_DIR = "${STACKD_TEST_MODEL_DIR_UNSET:-/models}" }

[services.llm.resources]
gpu = 1

[services.llm.health_check]
kind = "http"
target = "/health"
interval_ms = 10
"#;

#[tokio::test]
async fn loaded_stack_starts_in_dependency_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stack.toml");
    std::fs::write(&path, STACK).unwrap();

    let stack = load_stack(&path).unwrap();
    assert_eq!(stack.graph.levels(), vec![vec!["db"], vec!["llm"]]);
    assert_eq!(stack.graph.dependents_of("db"), vec!["llm"]);

    let runner = Arc::new(ScriptedRunner::new());
    let handle = Orchestrator::from_stack(&stack, runner.clone(), Arc::new(ScriptedProber::new()))
        .start();
    tokio::time::timeout(Duration::from_secs(3), handle.board().wait_settled())
        .await
        .unwrap();

    assert_eq!(handle.board().state("db"), Some(InstanceState::Healthy));
    assert_eq!(handle.board().state("llm"), Some(InstanceState::Healthy));

    let env = runner.last_env("llm").unwrap();
    assert_eq!(env.get("MODEL_DIR").map(String::as_str), Some("/models"));
    assert_eq!(env.get("CUDA_VISIBLE_DEVICES").map(String::as_str), Some("0"));

    let report = handle.shutdown().await;
    assert_eq!(report.stopped, vec!["llm".to_string(), "db".to_string()]);
}

#[test]
fn cyclic_stack_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stack.toml");
    std::fs::write(
        &path,
        r#"
[services.a]
image = "/bin/a"
depends_on = ["b"]

[services.b]
image = "/bin/b"
depends_on = ["a"]
"#,
    )
    .unwrap();

    let err = load_stack(&path).unwrap_err();
    assert!(matches!(err, stackd_core::Error::CyclicDependency { .. }), "{err}");
}
