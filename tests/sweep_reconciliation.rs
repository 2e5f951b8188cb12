use docsmith::queue::QueuePaths;
use docsmith::runtime::{bootstrap_state_root, run_sweep_once, StatePaths};
use docsmith::store::{TaskRecord, TaskStore};
use docsmith::workflow::{TaskState, WorkflowKind};
use std::fs;
use std::path::PathBuf;
use tempfile::tempdir;

fn setup(root: &PathBuf) -> TaskStore {
    bootstrap_state_root(&StatePaths::new(root)).expect("bootstrap");
    TaskStore::open(root).expect("store")
}

fn task_dir_with_file(state_root: &PathBuf, record: &TaskRecord) -> PathBuf {
    let dir = docsmith::executor::task_dir(state_root, record);
    fs::create_dir_all(&dir).expect("task dir");
    fs::write(dir.join("input.pdf"), b"%PDF").expect("input");
    dir
}

#[test]
fn stuck_processing_tasks_are_failed_and_reclaimed() {
    let tmp = tempdir().expect("tempdir");
    let state_root = tmp.path().join(".docsmith");
    let store = setup(&state_root);

    let mut record = TaskRecord::new("task-1-aaaa", "u1", WorkflowKind::Merge, 100, 86_400);
    record.state = TaskState::Processing;
    record.processing_deadline = Some(docsmith::shared::now_secs() - 60);
    store.insert(&record).expect("insert");
    let dir = task_dir_with_file(&state_root, &record);

    let report = run_sweep_once(&state_root, &store).expect("sweep");
    assert_eq!(report.timed_out, 1);
    assert!(store.load("u1").expect("load").is_none(), "record removed");
    assert!(!dir.exists(), "directory removed");

    let paths = QueuePaths::from_state_root(&state_root);
    let outgoing: Vec<_> = fs::read_dir(&paths.outgoing)
        .expect("outgoing")
        .collect();
    assert_eq!(outgoing.len(), 1, "one timeout notice for the user");
    let raw = fs::read_to_string(outgoing[0].as_ref().expect("entry").path()).expect("read");
    assert!(raw.contains("timed out"));
}

#[test]
fn tasks_past_their_ttl_are_reclaimed() {
    let tmp = tempdir().expect("tempdir");
    let state_root = tmp.path().join(".docsmith");
    let store = setup(&state_root);

    let mut record = TaskRecord::new("task-2-bbbb", "idle", WorkflowKind::Compress, 100, 86_400);
    record.state = TaskState::CollectingInput;
    record.ttl_deadline = docsmith::shared::now_secs() - 1;
    store.insert(&record).expect("insert");
    let dir = task_dir_with_file(&state_root, &record);

    let report = run_sweep_once(&state_root, &store).expect("sweep");
    assert_eq!(report.reclaimed, 1);
    assert!(store.load("idle").expect("load").is_none());
    assert!(!dir.exists());
}

#[test]
fn healthy_tasks_are_left_alone() {
    let tmp = tempdir().expect("tempdir");
    let state_root = tmp.path().join(".docsmith");
    let store = setup(&state_root);

    let now = docsmith::shared::now_secs();
    let mut record = TaskRecord::new("task-3-cccc", "busy", WorkflowKind::Merge, now, 86_400);
    record.state = TaskState::Processing;
    record.processing_deadline = Some(now + 600);
    store.insert(&record).expect("insert");

    let report = run_sweep_once(&state_root, &store).expect("sweep");
    assert_eq!(report.timed_out, 0);
    assert_eq!(report.reclaimed, 0);
    assert!(store.load("busy").expect("load").is_some());
}
