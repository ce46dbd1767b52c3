use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn csvs_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_csvs"))
}

const ITEMS: &str = "\
id,title,color,lat,lng
1,red bicycle,red,35.5,139.25
2,blue bicycle,blue,34.5,135.5
3,green car,green,,
4,fast red car,red,43.0,141.25
";

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();
    fs::write(root.join("data/items.csv"), ITEMS).unwrap();

    // relative paths resolve against the config directory
    let config_content = r#"default_dataset = "items"

[db]
path = "../data/app.db"

[embedding]
provider = "hash"
dims = 64

[search]
default_top_k = 3

[datasets.items]
csv = "../data/items.csv"
batch_size = 2
text_columns = ["title"]
lat_column = "lat"
lng_column = "lng"
"#;

    let config_path = config_dir.join("csvs.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_csvs(config_path: &Path, args: &[&str]) -> (String, String, Option<i32>) {
    let binary = csvs_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path)
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run csvs binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.code())
}

fn json(stdout: &str) -> serde_json::Value {
    serde_json::from_str(stdout).unwrap_or_else(|e| panic!("not JSON ({}): {}", e, stdout))
}

#[test]
fn test_init_creates_database_and_is_idempotent() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, code) = run_csvs(&config_path, &["init"]);
    assert_eq!(code, Some(0), "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/app.db").exists());

    let (_, _, code) = run_csvs(&config_path, &["init"]);
    assert_eq!(code, Some(0), "second init failed (not idempotent)");
}

#[test]
fn test_ingest_reports_summary_and_skips_unchanged_rows() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, code) = run_csvs(&config_path, &["ingest"]);
    assert_eq!(code, Some(0), "ingest failed: stdout={}, stderr={}", stdout, stderr);
    let summary = json(&stdout);
    assert_eq!(summary["namespace"], "items");
    assert_eq!(summary["rows_read"], 4);
    assert_eq!(summary["rows_written"], 4);
    assert_eq!(summary["embeddings_written"], 4);
    assert_eq!(summary["batches_committed"], 2);

    let (stdout, _, code) = run_csvs(&config_path, &["ingest"]);
    assert_eq!(code, Some(0));
    let summary = json(&stdout);
    assert_eq!(summary["rows_skipped"], 4);
    assert_eq!(summary["rows_written"], 0);
}

#[test]
fn test_search_ranks_and_filters() {
    let (_tmp, config_path) = setup_test_env();
    run_csvs(&config_path, &["ingest"]);

    let (stdout, stderr, code) = run_csvs(&config_path, &["search", "--query", "red bicycle"]);
    assert_eq!(code, Some(0), "search failed: stderr={}", stderr);
    let hits = json(&stdout);
    let hits = hits.as_array().unwrap();
    assert_eq!(hits.len(), 3, "default_top_k from config");
    assert_eq!(hits[0]["id"], "1");
    assert_eq!(hits[0]["dataset"], "items");

    let (stdout, _, code) = run_csvs(
        &config_path,
        &["search", "--query", "car", "--filter", "color=red", "--topk", "10"],
    );
    assert_eq!(code, Some(0));
    let hits = json(&stdout);
    let ids: Vec<&str> = hits
        .as_array()
        .unwrap()
        .iter()
        .map(|h| h["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&"1") && ids.contains(&"4"));
}

#[test]
fn test_get_shows_derived_entries() {
    let (_tmp, config_path) = setup_test_env();
    run_csvs(&config_path, &["ingest"]);

    let (stdout, stderr, code) = run_csvs(&config_path, &["get", "1"]);
    assert_eq!(code, Some(0), "get failed: stderr={}", stderr);
    let view = json(&stdout);
    assert_eq!(view["fields"]["color"], "red");
    assert_eq!(view["embedding_dims"], 64);
    assert_eq!(view["spatial"]["min_lat"], 35.5);

    let (stdout, _, _) = run_csvs(&config_path, &["get", "3"]);
    assert!(json(&stdout)["spatial"].is_null());

    let (_, stderr, code) = run_csvs(&config_path, &["get", "999"]);
    assert_eq!(code, Some(1));
    assert!(stderr.contains("not found"));
}

#[test]
fn test_changed_csv_updates_only_changed_rows() {
    let (tmp, config_path) = setup_test_env();
    run_csvs(&config_path, &["ingest"]);

    let changed = ITEMS.replace("3,green car,green,,", "3,green car,green,40.0,140.0");
    fs::write(tmp.path().join("data/items.csv"), changed).unwrap();

    let (stdout, _, code) = run_csvs(&config_path, &["ingest"]);
    assert_eq!(code, Some(0));
    let summary = json(&stdout);
    assert_eq!(summary["rows_written"], 1);
    assert_eq!(summary["rows_skipped"], 3);

    let (stdout, _, _) = run_csvs(&config_path, &["get", "3"]);
    assert_eq!(json(&stdout)["spatial"]["max_lng"], 140.0);
}

#[test]
fn test_unknown_column_exits_with_configuration_code() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, code) = run_csvs(&config_path, &["ingest", "--text-cols", "title,missing"]);
    assert_eq!(code, Some(2), "stderr={}", stderr);
    assert!(stderr.contains("missing"));
}

#[test]
fn test_malformed_row_stops_run_and_names_row() {
    let (tmp, config_path) = setup_test_env();
    let csv = tmp.path().join("bad.csv");
    fs::write(
        &csv,
        "id,title,lat,lng\n1,ok,1.0,2.0\n2,ok,1.0,2.0\n3,bad,north,2.0\n",
    )
    .unwrap();

    let (_, stderr, code) = run_csvs(
        &config_path,
        &["ingest", "--csv", csv.to_str().unwrap(), "--table", "bad"],
    );
    assert_eq!(code, Some(1), "stderr={}", stderr);
    assert!(stderr.contains("row 4"), "stderr={}", stderr);
    assert!(stderr.contains("2 committed row"), "stderr={}", stderr);
}

#[test]
fn test_missing_explicit_config_is_configuration_error() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, code) = run_csvs(&tmp.path().join("nope.toml"), &["init"]);
    assert_eq!(code, Some(2));
    assert!(stderr.contains("config"));
}

#[test]
fn test_blank_query_is_rejected() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, code) = run_csvs(&config_path, &["search", "--query", "  "]);
    assert_eq!(code, Some(1));
    assert!(stderr.contains("query must not be empty"));
}
