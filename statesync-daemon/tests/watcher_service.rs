use std::fs;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

use statesync_core::{ChangeOperation, ChangeRecord, DocumentPath, StoreConfig, WriterId};
use statesync_daemon::StateService;

const WAIT: Duration = Duration::from_secs(5);

fn start(tmp: &TempDir) -> (StateService, mpsc::UnboundedReceiver<ChangeRecord>) {
    let config = StoreConfig::at(tmp.path()).with_debounce(Duration::from_millis(50));
    let service = StateService::start(config).unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    service.fanout().subscribe(move |change: &ChangeRecord| {
        let _ = tx.send(change.clone());
    });
    (service, rx)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn external_write_reaches_subscribers() {
    let tmp = TempDir::new().unwrap();
    // Directories created before start are covered by the initial watch.
    fs::create_dir_all(tmp.path().join("sessions/s1")).unwrap();
    let (service, mut rx) = start(&tmp);

    let file = service.store().root().join("sessions").join("s1").join("tasks.json");
    fs::write(&file, br#"{"task": "external"}"#).unwrap();

    let change = timeout(WAIT, rx.recv()).await.expect("no change observed").unwrap();
    assert_eq!(change.document_path, DocumentPath::new("sessions/s1/tasks").unwrap());
    assert_eq!(change.source, WriterId::external());
    assert_eq!(change.operation, ChangeOperation::Create);
    assert_eq!(change.new_value, json!({"task": "external"}));

    let cached = service.store().cached(&change.document_path);
    assert_eq!(cached, Some(json!({"task": "external"})));

    service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn store_write_is_not_echoed_by_watcher() {
    let tmp = TempDir::new().unwrap();
    let (service, mut rx) = start(&tmp);

    let path = DocumentPath::new("queue").unwrap();
    service
        .store()
        .write(&path, json!({"n": 1}), &WriterId::from("api"))
        .unwrap();

    let first = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.source, WriterId::from("api"));

    let echo = timeout(Duration::from_millis(500), rx.recv()).await;
    assert!(echo.is_err(), "watcher re-announced the store's own write");

    service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn artifacts_and_history_are_not_ingested() {
    let tmp = TempDir::new().unwrap();
    let (service, mut rx) = start(&tmp);
    let root = service.store().root().to_path_buf();

    fs::write(root.join("queue.json.lock"), "{}").unwrap();
    fs::write(root.join("queue.json.statesync.tmp"), "{}").unwrap();
    fs::write(root.join(".hidden.json"), "{}").unwrap();
    fs::write(root.join("notes.txt"), "hello").unwrap();
    fs::create_dir_all(root.join("state/history/queue")).unwrap();
    fs::write(root.join("state/history/queue/1.json"), "{}").unwrap();

    let nothing = timeout(Duration::from_millis(500), rx.recv()).await;
    assert!(nothing.is_err());

    service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_closes_change_log() {
    let tmp = TempDir::new().unwrap();
    let config = StoreConfig::at(tmp.path()).with_change_log("logs/changes.jsonl");
    let service = StateService::start(config).unwrap();

    service
        .store()
        .write(&DocumentPath::new("queue").unwrap(), json!([1]), &WriterId::from("api"))
        .unwrap();
    let log = service.store().root().join("logs/changes.jsonl");
    service.shutdown().await.unwrap();

    let contents = fs::read_to_string(log).unwrap();
    let line: ChangeRecord = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
    assert_eq!(line.new_value, json!([1]));
}
