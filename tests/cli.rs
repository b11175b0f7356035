use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let docs_dir = root.join("docs");
    fs::create_dir_all(&docs_dir).unwrap();
    fs::write(
        docs_dir.join("contrato.txt"),
        "CONTRATO INDIVIDUAL DE TRABAJO\nLas partes celebran el presente contrato.\nCláusula primera. Fecha de ingreso: 01/03/2021\nCláusula segunda. Salario diario: $450.00\n",
    )
    .unwrap();
    fs::write(docs_dir.join("foto.png"), [0x89, b'P', b'N', b'G']).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/sheet.sqlite"

[storage]
root = "{}/files"

[chunking]
max_tokens = 256

[logging]
level = "warn"
"#,
        root.display(),
        root.display()
    );

    let config_path = config_dir.join("sheet.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_sheet(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = env!("CARGO_BIN_EXE_sheet");
    let output = Command::new(binary)
        .arg("--config")
        .arg(config_path)
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run sheet binary at {}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

/// Value following `prefix` on the first stdout line that starts with it.
fn line_value(stdout: &str, prefix: &str) -> String {
    stdout
        .lines()
        .find_map(|l| l.strip_prefix(prefix))
        .unwrap_or_else(|| panic!("no line starting with {:?} in {:?}", prefix, stdout))
        .trim()
        .to_string()
}

#[test]
fn test_init_is_idempotent() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, ok) = run_sheet(&config, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    assert!(stdout.contains("Database initialized successfully."));

    let (_, stderr, ok) = run_sheet(&config, &["init"]);
    assert!(ok, "second init failed: {}", stderr);
}

#[test]
fn test_upload_work_and_sheet() {
    let (tmp, config) = setup_test_env();
    let (_, stderr, ok) = run_sheet(&config, &["init"]);
    assert!(ok, "init failed: {}", stderr);

    let contract = tmp.path().join("docs/contrato.txt");
    let (stdout, stderr, ok) =
        run_sheet(&config, &["upload", "CASE-1", contract.to_str().unwrap()]);
    assert!(ok, "upload failed: {}", stderr);
    let document_id = line_value(&stdout, "document ");
    let task_id = line_value(&stdout, "task ");

    let (stdout, stderr, ok) = run_sheet(&config, &["work", "--once"]);
    assert!(ok, "work failed: {}", stderr);
    assert!(stdout.contains("tasks processed"));

    let (stdout, _, ok) = run_sheet(&config, &["status", &task_id]);
    assert!(ok);
    assert!(stdout.contains("state: succeeded"), "{}", stdout);

    let (stdout, stderr, ok) = run_sheet(&config, &["sheet", "CASE-1"]);
    assert!(ok, "sheet failed: {}", stderr);
    let json: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(json["case_id"], "CASE-1");
    assert!(stdout.contains("2021-03-01"));
    assert!(stdout.contains(&document_id));

    let (stdout, _, ok) = run_sheet(&config, &["tasks", "CASE-1"]);
    assert!(ok);
    assert!(stdout.contains("extract"));
    assert!(stdout.contains("audit"));

    let out = tmp.path().join("copia.txt");
    let (_, stderr, ok) = run_sheet(
        &config,
        &["file", &document_id, "--out", out.to_str().unwrap()],
    );
    assert!(ok, "file failed: {}", stderr);
    assert_eq!(
        fs::read(&out).unwrap(),
        fs::read(&contract).unwrap()
    );

    let (stdout, _, ok) = run_sheet(&config, &["delete-document", &document_id]);
    assert!(ok);
    assert!(stdout.contains("deleted"));
}

#[test]
fn test_set_field_rejects_unknown_field() {
    let (_tmp, config) = setup_test_env();
    run_sheet(&config, &["init"]);

    let (stdout, _, ok) = run_sheet(&config, &["set-field", "CASE-2", "daily_salary", "512.30"]);
    assert!(ok);
    assert!(stdout.contains("version 1"), "{}", stdout);

    let (_, stderr, ok) = run_sheet(&config, &["set-field", "CASE-2", "salario", "512.30"]);
    assert!(!ok);
    assert!(stderr.contains("unknown"));
}

#[test]
fn test_upload_rejects_unsupported_type() {
    let (tmp, config) = setup_test_env();
    run_sheet(&config, &["init"]);

    let image = tmp.path().join("docs/foto.png");
    let (_, stderr, ok) = run_sheet(&config, &["upload", "CASE-3", image.to_str().unwrap()]);
    assert!(!ok);
    assert!(stderr.contains("unsupported"), "{}", stderr);
}

#[test]
fn test_extract_without_documents_fails() {
    let (_tmp, config) = setup_test_env();
    run_sheet(&config, &["init"]);

    let (_, stderr, ok) = run_sheet(&config, &["extract", "EMPTY"]);
    assert!(!ok);
    assert!(stderr.contains("not ready"), "{}", stderr);
}
