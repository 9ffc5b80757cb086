//! Container runner integration tests.
//!
//! These drive the real runner against a fake runtime script that speaks
//! just enough of the `docker run` CLI surface: it swallows stdin, emits
//! scripted stdout, and accepts `stop`/`kill` invocations. No Docker
//! required.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use futures::future::BoxFuture;
use jsclaw_core::container::{ContainerInput, ContainerOutput, ContainerStatus};
use jsclaw_core::group::RegisteredGroup;
use jsclawd::container::runner::{ProcessHandle, RunnerConfig, RunnerEvents, run_agent};

fn write_fake_runtime(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-runtime.sh");
    let script = format!(
        "#!/bin/sh\n\
         if [ \"$1\" = \"stop\" ] || [ \"$1\" = \"kill\" ]; then exit 0; fi\n\
         cat >/dev/null\n\
         {body}\n"
    );
    fs::write(&path, script).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

fn runner_config(root: &Path, script: &Path, timeout_ms: u64) -> RunnerConfig {
    RunnerConfig {
        runtime_bin: script.to_string_lossy().to_string(),
        image: "jsclaw-agent:test".to_string(),
        groups_dir: root.join("groups"),
        data_dir: root.join("data"),
        container_timeout_ms: timeout_ms,
        max_output_size: 1_048_576,
        env: BTreeMap::new(),
        allowlist_path: None,
    }
}

fn test_input() -> ContainerInput {
    ContainerInput {
        prompt: "hi".to_string(),
        session_id: None,
        group_folder: "g1".to_string(),
        chat_jid: "c1".to_string(),
        is_main: true,
        is_scheduled_task: None,
    }
}

#[derive(Default)]
struct RecordingEvents {
    outputs: Mutex<Vec<ContainerOutput>>,
    names: Mutex<Vec<String>>,
}

impl RunnerEvents for RecordingEvents {
    fn on_process<'a>(
        &'a self,
        _process: ProcessHandle,
        container_name: &'a str,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.names.lock().unwrap().push(container_name.to_string());
        })
    }

    fn on_output<'a>(&'a self, output: ContainerOutput) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.outputs.lock().unwrap().push(output);
            Ok(())
        })
    }
}

#[tokio::test]
async fn happy_path_returns_final_output_and_streams_it() {
    let tmp = tempfile::tempdir().unwrap();
    let script = write_fake_runtime(
        tmp.path(),
        "printf -- '---JSCLAW_OUTPUT_START---\\n'\n\
         printf -- '{\"status\":\"success\",\"result\":\"ok\",\"newSessionId\":\"s1\"}\\n'\n\
         printf -- '---JSCLAW_OUTPUT_END---\\n'\n\
         exit 0",
    );
    let config = runner_config(tmp.path(), &script, 5000);
    let group = RegisteredGroup::new("c1", "Group One", "g1");
    let events = RecordingEvents::default();

    let output = run_agent(&group, &test_input(), &events, &config)
        .await
        .unwrap();

    assert_eq!(output.status, ContainerStatus::Success);
    assert_eq!(output.result.as_deref(), Some("ok"));
    assert_eq!(output.new_session_id.as_deref(), Some("s1"));

    let streamed = events.outputs.lock().unwrap();
    assert_eq!(streamed.len(), 1);
    assert_eq!(streamed[0].result.as_deref(), Some("ok"));

    let names = events.names.lock().unwrap();
    assert_eq!(names.len(), 1);
    assert!(names[0].starts_with("jsclaw-g1-"));

    // The group workspace and mailbox tree were created for the run.
    for sub in ["messages", "tasks", "input"] {
        assert!(tmp.path().join("data/ipc/g1").join(sub).is_dir());
    }
    assert!(tmp.path().join("groups/g1").is_dir());
}

#[tokio::test]
async fn frames_split_mid_marker_still_parse_once() {
    let tmp = tempfile::tempdir().unwrap();
    let script = write_fake_runtime(
        tmp.path(),
        "printf -- '---JSCLAW_OUT'\n\
         sleep 0.2\n\
         printf -- 'PUT_START---\\n{\"status\":\"success\",\"result\":\"ok\"}\\n---JSCLAW_OUTPUT'\n\
         sleep 0.2\n\
         printf -- '_END---\\n'\n\
         exit 0",
    );
    let config = runner_config(tmp.path(), &script, 5000);
    let group = RegisteredGroup::new("c1", "Group One", "g1");
    let events = RecordingEvents::default();

    let output = run_agent(&group, &test_input(), &events, &config)
        .await
        .unwrap();

    assert_eq!(output.status, ContainerStatus::Success);
    assert_eq!(output.result.as_deref(), Some("ok"));
    assert_eq!(events.outputs.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn silent_container_times_out() {
    let tmp = tempfile::tempdir().unwrap();
    let script = write_fake_runtime(tmp.path(), "sleep 2\nexit 0");
    let config = runner_config(tmp.path(), &script, 200);
    let group = RegisteredGroup::new("c1", "Group One", "g1");

    let output = run_agent(&group, &test_input(), &jsclawd::container::NullEvents, &config)
        .await
        .unwrap();

    assert_eq!(output.status, ContainerStatus::Error);
    assert_eq!(
        output.error.as_deref(),
        Some("Container timed out after 200ms")
    );
}

#[tokio::test]
async fn timeout_preserves_last_result_and_session() {
    let tmp = tempfile::tempdir().unwrap();
    let script = write_fake_runtime(
        tmp.path(),
        "printf -- '---JSCLAW_OUTPUT_START---\\n'\n\
         printf -- '{\"status\":\"success\",\"result\":\"partial\",\"newSessionId\":\"s9\"}\\n'\n\
         printf -- '---JSCLAW_OUTPUT_END---\\n'\n\
         sleep 2\n\
         exit 0",
    );
    let config = runner_config(tmp.path(), &script, 300);
    let group = RegisteredGroup::new("c1", "Group One", "g1");

    let output = run_agent(&group, &test_input(), &jsclawd::container::NullEvents, &config)
        .await
        .unwrap();

    assert_eq!(output.status, ContainerStatus::Error);
    assert!(output.error.unwrap().contains("timed out after 300ms"));
    assert_eq!(output.result.as_deref(), Some("partial"));
    assert_eq!(output.new_session_id.as_deref(), Some("s9"));
}

#[tokio::test]
async fn malformed_frame_synthesizes_parse_error() {
    let tmp = tempfile::tempdir().unwrap();
    let script = write_fake_runtime(
        tmp.path(),
        "printf -- '---JSCLAW_OUTPUT_START---\\n'\n\
         printf -- 'this is not json\\n'\n\
         printf -- '---JSCLAW_OUTPUT_END---\\n'\n\
         exit 0",
    );
    let config = runner_config(tmp.path(), &script, 5000);
    let group = RegisteredGroup::new("c1", "Group One", "g1");
    let events = RecordingEvents::default();

    let output = run_agent(&group, &test_input(), &events, &config)
        .await
        .unwrap();

    assert_eq!(output.status, ContainerStatus::Error);
    assert!(
        output
            .error
            .as_deref()
            .unwrap()
            .starts_with("Failed to parse output: this is not json")
    );
    assert_eq!(events.outputs.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn clean_exit_without_output_is_success() {
    let tmp = tempfile::tempdir().unwrap();
    let script = write_fake_runtime(tmp.path(), "exit 0");
    let config = runner_config(tmp.path(), &script, 5000);
    let group = RegisteredGroup::new("c1", "Group One", "g1");

    let output = run_agent(&group, &test_input(), &jsclawd::container::NullEvents, &config)
        .await
        .unwrap();

    assert_eq!(output.status, ContainerStatus::Success);
    assert!(output.result.is_none());
}

#[tokio::test]
async fn nonzero_exit_reports_code_and_stderr_tail() {
    let tmp = tempfile::tempdir().unwrap();
    let script = write_fake_runtime(tmp.path(), "echo 'image pull failed' >&2\nexit 3");
    let config = runner_config(tmp.path(), &script, 5000);
    let group = RegisteredGroup::new("c1", "Group One", "g1");

    let output = run_agent(&group, &test_input(), &jsclawd::container::NullEvents, &config)
        .await
        .unwrap();

    assert_eq!(output.status, ContainerStatus::Error);
    let err = output.error.unwrap();
    assert!(err.contains("Container exited with code 3"), "err: {err}");
    assert!(err.contains("image pull failed"), "err: {err}");
}

#[tokio::test]
async fn output_ceiling_kills_the_run() {
    let tmp = tempfile::tempdir().unwrap();
    let script = write_fake_runtime(
        tmp.path(),
        "i=0\n\
         while [ $i -lt 200 ]; do\n\
           printf -- 'noise-%04d 0123456789012345678901234567890123456789\\n' $i\n\
           i=$((i+1))\n\
         done\n\
         exit 0",
    );
    let mut config = runner_config(tmp.path(), &script, 5000);
    config.max_output_size = 4096;
    let group = RegisteredGroup::new("c1", "Group One", "g1");

    let output = run_agent(&group, &test_input(), &jsclawd::container::NullEvents, &config)
        .await
        .unwrap();

    assert_eq!(output.status, ContainerStatus::Error);
    assert!(output.error.unwrap().contains("exceeded 4096 bytes"));
}

#[tokio::test]
async fn spawn_failure_is_the_one_rejection() {
    let tmp = tempfile::tempdir().unwrap();
    let config = runner_config(tmp.path(), Path::new("/nonexistent/runtime"), 5000);
    let group = RegisteredGroup::new("c1", "Group One", "g1");

    let result = run_agent(
        &group,
        &test_input(),
        &jsclawd::container::NullEvents,
        &config,
    )
    .await;

    let err = result.unwrap_err().to_string();
    assert!(err.contains("unable to spawn"), "err: {err}");
}

#[tokio::test]
async fn group_timeout_override_wins() {
    let tmp = tempfile::tempdir().unwrap();
    let script = write_fake_runtime(tmp.path(), "sleep 2\nexit 0");
    // Global timeout is generous; the group clamps it down.
    let config = runner_config(tmp.path(), &script, 60_000);
    let mut group = RegisteredGroup::new("c1", "Group One", "g1");
    group.container = Some(jsclaw_core::group::GroupContainerConfig {
        additional_mounts: vec![],
        timeout_ms: Some(200),
    });

    let output = run_agent(&group, &test_input(), &jsclawd::container::NullEvents, &config)
        .await
        .unwrap();

    assert_eq!(output.status, ContainerStatus::Error);
    assert!(output.error.unwrap().contains("timed out after 200ms"));
}
