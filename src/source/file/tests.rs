use super::*;
use serde_json::json;
use tempfile::TempDir;

fn write_projects(dir: &TempDir, value: &serde_json::Value) -> PathBuf {
    let path = dir.path().join("projects.json");
    std::fs::write(&path, value.to_string()).expect("should write projects file");
    path
}

#[tokio::test]
async fn lists_records_from_file() {
    let dir = TempDir::new().expect("should create temp dir");
    let path = write_projects(
        &dir,
        &json!([
            {"id": "1", "amenidades": ["pool", "gym"]},
            {"id": "2", "amenidades": "rooftop garden", "ciudad": "Bogotá"}
        ]),
    );

    let source = FileDataSource::new(&path);
    assert_eq!(source.path(), path.as_path());

    let records = source.list_records().await.expect("listing succeeds");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].text, "Amenities: pool, gym");
    assert_eq!(records[1].text, "Bogotá. Amenities: rooftop garden");
}

#[tokio::test]
async fn get_record_by_id() {
    let dir = TempDir::new().expect("should create temp dir");
    let path = write_projects(&dir, &json!([{"id": "7", "descripcion_general": "Lofts"}]));
    let source = FileDataSource::new(path);

    let record = source.get_record("7").await.expect("lookup succeeds");
    assert_eq!(record.map(|r| r.text), Some("Lofts".to_string()));
    assert_eq!(source.get_record("8").await, Ok(None));
}

#[tokio::test]
async fn missing_file_is_a_data_source_error() {
    let dir = TempDir::new().expect("should create temp dir");
    let source = FileDataSource::new(dir.path().join("absent.json"));
    assert!(matches!(
        source.list_records().await,
        Err(IndexError::DataSource(_))
    ));
}

#[tokio::test]
async fn invalid_json_is_a_data_source_error() {
    let dir = TempDir::new().expect("should create temp dir");
    let path = dir.path().join("projects.json");
    std::fs::write(&path, "[{").expect("should write file");
    let source = FileDataSource::new(path);
    assert!(matches!(
        source.list_records().await,
        Err(IndexError::DataSource(_))
    ));
}
