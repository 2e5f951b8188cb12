#![cfg(unix)]

use docsmith::config::Settings;
use docsmith::executor;
use docsmith::queue::{self, EventKind, InboundEvent, OutboundMessage, QueuePaths};
use docsmith::router::Router;
use docsmith::runtime::{bootstrap_state_root, StatePaths};
use docsmith::store::TaskStore;
use docsmith::workflow::TaskState;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

struct Harness {
    _dir: TempDir,
    state_root: PathBuf,
    staging: PathBuf,
    settings: Settings,
    store: TaskStore,
}

impl Harness {
    fn new() -> Self {
        let dir = tempdir().expect("tempdir");
        let state_root = dir.path().join(".docsmith");
        bootstrap_state_root(&StatePaths::new(&state_root)).expect("bootstrap");
        let staging = dir.path().join("staging");
        fs::create_dir_all(&staging).expect("staging dir");

        let mut settings = Settings::default();
        settings.retry.backoff_seconds = 0;
        settings.tools.ghostscript.binary = write_script(
            dir.path(),
            "fake-gs",
            r#"#!/bin/sh
out=""
inputs=""
for arg in "$@"; do
  case "$arg" in
    -sOutputFile=*) out="${arg#-sOutputFile=}" ;;
    -*) ;;
    *) inputs="$inputs $arg" ;;
  esac
done
cat $inputs > "$out"
"#,
        );
        settings.tools.pdfinfo.binary = write_script(
            dir.path(),
            "fake-pdfinfo",
            "#!/bin/sh\necho 'Pages:          3'\n",
        );

        let store = TaskStore::open(&state_root).expect("store");
        Self {
            _dir: dir,
            state_root,
            staging,
            settings,
            store,
        }
    }

    fn router(&self) -> Router {
        Router::new(&self.state_root, self.settings.clone(), self.store.clone())
    }

    fn command(&self, message_id: &str, text: &str) -> Vec<String> {
        self.router()
            .route(
                &InboundEvent {
                    sender_id: "u1".to_string(),
                    event_type: EventKind::Command,
                    message_id: message_id.to_string(),
                    text: Some(text.to_string()),
                    file_name: None,
                    file_path: None,
                },
                100,
            )
            .expect("route command")
    }

    fn upload(&self, message_id: &str, name: &str, content: &[u8]) -> Vec<String> {
        let staged = self.staging.join(message_id);
        fs::write(&staged, content).expect("stage file");
        self.router()
            .route(
                &InboundEvent {
                    sender_id: "u1".to_string(),
                    event_type: EventKind::File,
                    message_id: message_id.to_string(),
                    text: None,
                    file_name: Some(name.to_string()),
                    file_path: Some(staged.display().to_string()),
                },
                100,
            )
            .expect("route file")
    }

    fn run_pending_job(&self) {
        let paths = QueuePaths::from_state_root(&self.state_root);
        let claimed = queue::claim_oldest_job(&paths)
            .expect("claim job")
            .expect("job present");
        executor::execute_job(&self.state_root, &self.settings, &self.store, &claimed.payload)
            .expect("execute job");
        queue::complete_claim(&claimed).expect("complete claim");
    }

    fn outbound_messages(&self) -> Vec<OutboundMessage> {
        let paths = QueuePaths::from_state_root(&self.state_root);
        let mut messages = Vec::new();
        for entry in fs::read_dir(&paths.outgoing).expect("outgoing dir") {
            let path = entry.expect("entry").path();
            let raw = fs::read_to_string(&path).expect("read outbound");
            messages.push(serde_json::from_str(&raw).expect("parse outbound"));
        }
        messages.sort_by_key(|m: &OutboundMessage| m.timestamp);
        messages
    }
}

fn write_script(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    fs::write(&path, body).expect("write script");
    let mut perms = fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod");
    path.display().to_string()
}

#[test]
fn merge_flow_runs_created_to_completed_and_orders_inputs() {
    let h = Harness::new();

    let replies = h.command("m1", "merge pdf");
    assert!(replies[0].contains("Started PDF merge"));
    let record = h.store.load("u1").expect("load").expect("task exists");
    assert_eq!(record.state, TaskState::Created);

    h.upload("m2", "first.pdf", b"AAA\n");
    h.upload("m3", "second.pdf", b"BBB\n");
    let record = h.store.load("u1").expect("load").expect("task exists");
    assert_eq!(record.state, TaskState::CollectingInput);
    assert_eq!(record.files.len(), 2);

    let replies = h.command("m4", "done");
    assert!(replies[0].contains("Processing started"));
    let record = h.store.load("u1").expect("load").expect("task exists");
    assert_eq!(record.state, TaskState::Processing);

    h.run_pending_job();

    // Terminal task is reclaimed as one unit: record and directory are gone.
    assert!(h.store.load("u1").expect("load").is_none());

    let messages = h.outbound_messages();
    let completed = messages
        .iter()
        .find(|m| !m.files.is_empty())
        .expect("completion message with attachment");
    let delivered = fs::read_to_string(&completed.files[0]).expect("read delivered");
    let a = delivered.find("AAA").expect("first input present");
    let b = delivered.find("BBB").expect("second input present");
    assert!(a < b, "arrival order must be preserved");
}

#[test]
fn duplicate_message_ids_do_not_repeat_side_effects() {
    let h = Harness::new();
    h.command("m1", "merge pdf");
    h.upload("m2", "first.pdf", b"AAA");
    h.upload("m2", "first.pdf", b"AAA");

    let record = h.store.load("u1").expect("load").expect("task exists");
    assert_eq!(record.files.len(), 1);
}

#[test]
fn second_start_command_is_rejected_while_a_task_is_active() {
    let h = Harness::new();
    h.command("m1", "merge pdf");
    let replies = h.command("m2", "split pdf");
    assert!(replies[0].contains("already have a task"));

    let record = h.store.load("u1").expect("load").expect("task exists");
    assert_eq!(record.workflow.as_str(), "merge");
}

#[test]
fn unknown_commands_leave_the_state_unchanged() {
    let h = Harness::new();
    h.command("m1", "merge pdf");
    let before = h.store.load("u1").expect("load").expect("task");

    let replies = h.command("m2", "frobnicate");
    assert!(replies[0].contains("didn't understand"));
    let after = h.store.load("u1").expect("load").expect("task");
    assert_eq!(before.state, after.state);
}

#[test]
fn cancel_before_processing_reclaims_everything() {
    let h = Harness::new();
    h.command("m1", "merge pdf");
    h.upload("m2", "first.pdf", b"AAA");

    let record = h.store.load("u1").expect("load").expect("task");
    let task_dir = executor::task_dir(&h.state_root, &record);
    assert!(task_dir.is_dir());

    let replies = h.command("m3", "cancel");
    assert!(replies[0].contains("cancelled"));
    assert!(h.store.load("u1").expect("load").is_none());
    assert!(!task_dir.exists());
}

#[test]
fn split_rejects_inverted_range_and_enqueues_nothing() {
    let h = Harness::new();
    h.command("m1", "split pdf");

    // The expected input count is one file, so intake advances straight to
    // Configuring with the probed page count in the prompt.
    let replies = h.upload("m2", "doc.pdf", b"%PDF");
    assert!(
        replies[0].contains("3 page(s)"),
        "page count probe should inform the prompt: {replies:?}"
    );
    let record = h.store.load("u1").expect("load").expect("task");
    assert_eq!(record.state, TaskState::Configuring);

    let replies = h.command("m4", "10-5");
    assert!(replies[0].contains("Invalid range"));

    // State unchanged and no queue job enqueued.
    let record = h.store.load("u1").expect("load").expect("task");
    assert_eq!(record.state, TaskState::Configuring);
    let paths = QueuePaths::from_state_root(&h.state_root);
    assert!(queue::claim_oldest_job(&paths).expect("claim").is_none());
}

#[test]
fn split_rejects_a_second_file() {
    let h = Harness::new();
    h.command("m1", "split pdf");
    h.upload("m2", "doc.pdf", b"%PDF");
    let replies = h.upload("m3", "other.pdf", b"%PDF");
    assert!(replies[0].contains("Files can't be added"));

    let record = h.store.load("u1").expect("load").expect("task");
    assert_eq!(record.files.len(), 1);
}

#[test]
fn merge_needs_two_files_before_done() {
    let h = Harness::new();
    h.command("m1", "merge pdf");
    h.upload("m2", "only.pdf", b"AAA");

    let replies = h.command("m3", "done");
    assert!(replies[0].contains("at least 2"));
    let record = h.store.load("u1").expect("load").expect("task");
    assert_eq!(record.state, TaskState::CollectingInput);
}

#[test]
fn wrong_file_type_is_reported_without_a_state_change() {
    let h = Harness::new();
    h.command("m1", "merge pdf");
    let replies = h.upload("m2", "notes.docx", b"word bytes");
    assert!(replies[0].contains("not supported"));

    let record = h.store.load("u1").expect("load").expect("task");
    assert_eq!(record.state, TaskState::Created);
    assert!(record.files.is_empty());
}

#[test]
fn markdown_fragments_accumulate_in_order_and_convert_via_chain() {
    let h = Harness::new();
    let dir = h.staging.parent().expect("root").to_path_buf();
    let mut settings = h.settings.clone();
    settings.tools.markdown_chain = vec![docsmith::config::ToolSpec {
        binary: write_script(
            &dir,
            "fake-pandoc",
            "#!/bin/sh\ncp \"$1\" \"$3\"\n",
        ),
        timeout_seconds: 30,
    }];
    // pandoc-style args: input -o output; name the script accordingly
    let pandoc_named = dir.join("pandoc");
    fs::rename(&settings.tools.markdown_chain[0].binary, &pandoc_named).expect("rename");
    settings.tools.markdown_chain[0].binary = pandoc_named.display().to_string();

    let router = Router::new(&h.state_root, settings.clone(), h.store.clone());
    let text_event = |id: &str, text: &str| InboundEvent {
        sender_id: "u1".to_string(),
        event_type: EventKind::Text,
        message_id: id.to_string(),
        text: Some(text.to_string()),
        file_name: None,
        file_path: None,
    };

    router
        .route(&text_event("m1", "markdown to pdf"), 100)
        .expect("start");
    router
        .route(&text_event("m2", "# Title"), 100)
        .expect("fragment 1");
    router
        .route(&text_event("m3", "Second paragraph"), 100)
        .expect("fragment 2");
    router.route(&text_event("m4", "done"), 100).expect("done");

    let paths = QueuePaths::from_state_root(&h.state_root);
    let claimed = queue::claim_oldest_job(&paths)
        .expect("claim")
        .expect("job");
    executor::execute_job(&h.state_root, &settings, &h.store, &claimed.payload)
        .expect("execute");

    let messages = h.outbound_messages();
    let completed = messages
        .iter()
        .find(|m| !m.files.is_empty())
        .expect("completion message");
    let pdf = fs::read_to_string(&completed.files[0]).expect("read output");
    let title = pdf.find("# Title").expect("first fragment");
    let second = pdf.find("Second paragraph").expect("second fragment");
    assert!(title < second);
}

#[test]
fn unreachable_job_queue_falls_back_to_synchronous_execution() {
    let h = Harness::new();
    h.command("m1", "merge pdf");
    h.upload("m2", "first.pdf", b"AAA\n");
    h.upload("m3", "second.pdf", b"BBB\n");

    // With the jobs directory gone, enqueueing fails and the router runs the
    // step in-process with identical semantics.
    let paths = QueuePaths::from_state_root(&h.state_root);
    fs::remove_dir_all(&paths.jobs).expect("remove jobs dir");

    h.command("m4", "done");

    assert!(h.store.load("u1").expect("load").is_none(), "task completed");
    let messages = h.outbound_messages();
    assert!(
        messages.iter().any(|m| !m.files.is_empty()),
        "result delivered without a worker"
    );
}

#[test]
fn events_after_completion_get_start_new_guidance() {
    let h = Harness::new();
    h.command("m1", "merge pdf");
    h.upload("m2", "a.pdf", b"AAA");
    h.upload("m3", "b.pdf", b"BBB");
    h.command("m4", "done");
    h.run_pending_job();

    let replies = h.command("m5", "done");
    assert!(replies[0].contains("Nothing in progress"));
}
