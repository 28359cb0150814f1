use assert_cmd::Command;

const SCRIPT: &str = r#"{
  "pages": [
    {
      "surface": { "left": 0.0, "top": 0.0, "width": 200.0, "height": 300.0 },
      "fragments": [
        { "content": "Net", "rect": { "left": 0.0, "top": 20.0, "width": 10.0, "height": 12.0 } },
        { "content": "revenue", "rect": { "left": 10.0, "top": 20.0, "width": 10.0, "height": 12.0 } },
        { "content": "increased", "rect": { "left": 20.0, "top": 20.0, "width": 10.0, "height": 12.0 } }
      ]
    }
  ]
}"#;

fn write_script(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let path = dir.path().join("doc.json");
    std::fs::write(&path, SCRIPT).unwrap();
    path
}

#[test]
fn resolves_a_citation_and_scrolls_once() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir);

    let output = Command::cargo_bin("sourcemark-cli")
        .unwrap()
        .args([
            "--script",
            script.to_str().unwrap(),
            "--page",
            "1",
            "--text",
            "net revenue increased",
            "--scroll-key",
            "1",
        ])
        .output()
        .unwrap();

    assert!(output.status.success());
    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout is a JSON report");
    assert_eq!(report["highlight"]["page"], 1);
    assert_eq!(report["highlight"]["rect"]["width"], 30.0);
    assert_eq!(report["navigations"][0], "page 1");
}

#[test]
fn unmatched_citation_reports_no_highlight() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir);

    let output = Command::cargo_bin("sourcemark-cli")
        .unwrap()
        .args([
            "--script",
            script.to_str().unwrap(),
            "--page",
            "1",
            "--text",
            "zebra quantum flux",
        ])
        .output()
        .unwrap();

    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(report["highlight"].is_null());
}
