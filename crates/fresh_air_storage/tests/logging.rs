use fresh_air_logging::{init_logging, LogConfig};
use fresh_air_storage::{
    PrimitiveKind, ResourceFactory, ResourcePath, ResourceSpec, SchemaField, Settings,
};
use serde_json::json;

#[test]
fn save_and_read_are_logged_to_file() {
    let logs = tempfile::TempDir::new().expect("log dir");
    let data = tempfile::TempDir::new().expect("data dir");
    init_logging(LogConfig::new("storage_test").quiet().with_log_dir(logs.path()))
        .expect("install subscriber");

    let mut settings = Settings::default();
    settings.storage.local.base_dir = data.path().to_string_lossy().into_owned();
    let resource = ResourceFactory::from_settings(&settings)
        .expect("factory")
        .open(ResourceSpec::new(
            ResourcePath::parse("gfs.forecasts").unwrap(),
            vec![SchemaField::new("v", PrimitiveKind::Integer)],
        ))
        .expect("open");
    let record = json!({"v": 1}).as_object().cloned().unwrap();
    resource.write(vec![record], false).expect("write");
    resource.read_all().expect("read");

    let log = std::fs::read_to_string(logs.path().join("storage_test.log")).expect("log file");
    assert!(log.contains("Saving gfs.forecasts"), "log was: {}", log);
    assert!(log.contains("Reading gfs.forecasts"), "log was: {}", log);

    // Only one global subscriber per process
    assert!(init_logging(LogConfig::new("again").with_log_dir(logs.path())).is_err());
}
