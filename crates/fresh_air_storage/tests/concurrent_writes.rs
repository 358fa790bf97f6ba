use fresh_air_storage::{
    PrimitiveKind, Record, Resource, ResourceFactory, ResourcePath, ResourceSpec, SchemaField,
    Settings,
};
use serde_json::json;
use std::env;
use std::path::Path;
use std::process::{Child, Command};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

const ROLE_ENV: &str = "FRESH_AIR_WRITE_ROLE";
const BASE_ENV: &str = "FRESH_AIR_WRITE_BASE";
const FORMAT_ENV: &str = "FRESH_AIR_WRITE_FORMAT";
const START_ENV: &str = "FRESH_AIR_WRITE_START";

const BATCHES: usize = 20;
const BATCH_SIZE: usize = 25;

fn factory(base: &Path, format: &str) -> ResourceFactory {
    let mut settings = Settings::default();
    settings.storage.local.base_dir = base.to_string_lossy().into_owned();
    settings.storage.local.format = format.to_string();
    ResourceFactory::from_settings(&settings).expect("factory")
}

fn open(base: &Path, format: &str) -> Box<dyn Resource> {
    let spec = ResourceSpec::new(
        ResourcePath::parse("shared.measurements").unwrap(),
        vec![
            SchemaField::new("writer", PrimitiveKind::String).required(),
            SchemaField::new("seq", PrimitiveKind::Integer).required(),
            SchemaField::new("payload", PrimitiveKind::String),
        ],
    );
    factory(base, format).open(spec).expect("open resource")
}

fn batch(writer: &str, batch_no: usize) -> Vec<Record> {
    (0..BATCH_SIZE)
        .map(|i| {
            json!({
                "writer": writer,
                "seq": (batch_no * BATCH_SIZE + i) as i64,
                // Long enough that a torn write would split a record
                "payload": "x".repeat(512),
            })
            .as_object()
            .cloned()
            .unwrap()
        })
        .collect()
}

fn append_all(resource: &dyn Resource, writer: &str) {
    for batch_no in 0..BATCHES {
        resource
            .write(batch(writer, batch_no), true)
            .expect("append batch");
    }
}

/// Every record decodes and each writer contributed a full, ordered run.
fn assert_complete(resource: &dyn Resource, writers: &[&str]) {
    let records = resource.read_all().expect("read back");
    assert_eq!(records.len(), writers.len() * BATCHES * BATCH_SIZE);
    for writer in writers {
        let seqs: Vec<i64> = records
            .iter()
            .filter(|r| r["writer"] == json!(writer))
            .map(|r| r["seq"].as_i64().unwrap())
            .collect();
        let expected: Vec<i64> = (0..(BATCHES * BATCH_SIZE) as i64).collect();
        assert_eq!(seqs, expected, "writer {}", writer);
    }
}

fn maybe_run_child() {
    let role = match env::var(ROLE_ENV) {
        Ok(role) => role,
        Err(_) => return,
    };
    let base = env::var(BASE_ENV).expect("child missing base dir");
    let format = env::var(FORMAT_ENV).expect("child missing format");
    let start = env::var(START_ENV).expect("child missing start file");

    // Both writers start together
    let deadline = Instant::now() + Duration::from_secs(20);
    while !Path::new(&start).exists() {
        if Instant::now() > deadline {
            eprintln!("start signal never came");
            std::process::exit(3);
        }
        thread::sleep(Duration::from_millis(10));
    }

    let resource = open(Path::new(&base), &format);
    append_all(resource.as_ref(), &role);
    std::process::exit(0);
}

fn wait_for_exit(child: &mut Child, timeout: Duration) {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().expect("failed to poll child") {
            assert!(status.success(), "writer exited with failure: {status}");
            return;
        }
        if start.elapsed() > timeout {
            let _ = child.kill();
            panic!("timed out waiting for writer to exit");
        }
        thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn concurrent_thread_appends() {
    for format in ["json", "avro"] {
        let temp = tempfile::TempDir::new().expect("tempdir");
        let writers = ["t0", "t1", "t2", "t3"];
        let barrier = Arc::new(Barrier::new(writers.len()));

        let handles: Vec<_> = writers
            .iter()
            .map(|writer| {
                let base = temp.path().to_path_buf();
                let barrier = Arc::clone(&barrier);
                let writer = writer.to_string();
                let format = format.to_string();
                thread::spawn(move || {
                    let resource = open(&base, &format);
                    barrier.wait();
                    append_all(resource.as_ref(), &writer);
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread panicked");
        }

        assert_complete(open(temp.path(), format).as_ref(), &writers);
    }
}

#[test]
fn concurrent_process_appends() {
    maybe_run_child();

    for format in ["json", "avro"] {
        let temp = tempfile::TempDir::new().expect("tempdir");
        let start = temp.path().join("start");
        let exe = env::current_exe().expect("test executable");

        let mut children: Vec<Child> = ["p0", "p1"]
            .iter()
            .map(|role| {
                Command::new(&exe)
                    .args(["--exact", "concurrent_process_appends", "--nocapture"])
                    .env(ROLE_ENV, role)
                    .env(BASE_ENV, temp.path())
                    .env(FORMAT_ENV, format)
                    .env(START_ENV, &start)
                    .spawn()
                    .expect("failed to spawn writer")
            })
            .collect();

        std::fs::write(&start, "go").expect("failed to signal writers");
        for child in &mut children {
            wait_for_exit(child, Duration::from_secs(60));
        }

        assert_complete(open(temp.path(), format).as_ref(), &["p0", "p1"]);
    }
}
