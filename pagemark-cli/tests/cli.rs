use std::fs;
use std::path::Path;

use assert_cmd::Command;
use tempfile::{tempdir, TempDir};

const IMPORT: &str = r##"{
  "pages": {
    "1": {
      "objects": [
        {"type": "path", "points": [{"x": 1, "y": 2}, {"x": 30, "y": 40}], "stroke": "#FF0000", "strokeWidth": 4},
        {"type": "i-text", "left": 10, "top": 20, "text": "Notes", "fontSize": 16}
      ]
    },
    "3": {
      "objects": [{"type": "rect", "left": 5, "top": 5, "width": 20, "height": 10, "stroke": "#0000FF"}]
    }
  }
}"##;

/// A command isolated from the user's real config, data and log directories.
fn pagemark(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("pagemark").unwrap();
    cmd.env("HOME", home.path())
        .env("XDG_CONFIG_HOME", home.path().join("config"))
        .env("XDG_DATA_HOME", home.path().join("data"))
        .env_remove("RUST_LOG")
        .arg("--data-dir")
        .arg(home.path().join("annotations"));
    cmd
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.assert().success().get_output().stdout.clone();
    String::from_utf8(output).unwrap()
}

fn write_import(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("import.json");
    fs::write(&path, IMPORT).unwrap();
    path
}

#[test]
fn import_then_show_summarizes_pages() {
    let home = tempdir().unwrap();
    let input = write_import(home.path());

    let imported = stdout_of(pagemark(&home).arg("import").arg("paper.pdf").arg(&input));
    assert!(imported.contains("imported 2 page(s) for paper.pdf"), "{imported}");

    // Only the file name identifies the document.
    let shown = stdout_of(pagemark(&home).args(["show", "/some/other/dir/paper.pdf"]));
    assert_eq!(
        shown,
        "paper.pdf: 2 page(s), 3 object(s)\n  page 1: 1 stroke(s), 1 text, 0 rect(s)\n  page 3: 0 stroke(s), 0 text, 1 rect(s)\n"
    );
}

#[test]
fn export_writes_pages_keyed_by_number() {
    let home = tempdir().unwrap();
    let input = write_import(home.path());
    pagemark(&home)
        .arg("import")
        .arg("paper.pdf")
        .arg(&input)
        .assert()
        .success();

    let target = home.path().join("out.json");
    pagemark(&home)
        .arg("export")
        .arg("paper.pdf")
        .arg("--output")
        .arg(&target)
        .assert()
        .success();

    let exported: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&target).unwrap()).unwrap();
    let pages = exported["pages"].as_object().unwrap();
    assert_eq!(pages.len(), 2);
    assert_eq!(pages["1"]["objects"][1]["text"], "Notes");
    assert_eq!(pages["3"]["objects"][0]["type"], "rect");
}

#[test]
fn export_defaults_to_the_document_file_name() {
    let home = tempdir().unwrap();
    let work = tempdir().unwrap();
    pagemark(&home)
        .current_dir(work.path())
        .args(["export", "empty.pdf"])
        .assert()
        .success();

    let written = fs::read_to_string(work.path().join("empty.pdf_annotations.json")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&written).unwrap();
    assert!(value["pages"].as_object().unwrap().is_empty());
}

#[test]
fn malformed_import_fails_and_keeps_existing_annotations() {
    let home = tempdir().unwrap();
    let input = write_import(home.path());
    pagemark(&home)
        .arg("import")
        .arg("paper.pdf")
        .arg(&input)
        .assert()
        .success();

    let broken = home.path().join("broken.json");
    fs::write(&broken, "{ this is not json").unwrap();
    pagemark(&home)
        .arg("import")
        .arg("paper.pdf")
        .arg(&broken)
        .assert()
        .failure();

    let shown = stdout_of(pagemark(&home).args(["show", "paper.pdf"]));
    assert!(shown.starts_with("paper.pdf: 2 page(s), 3 object(s)"), "{shown}");
}

#[test]
fn purge_removes_stored_annotations() {
    let home = tempdir().unwrap();
    let input = write_import(home.path());
    pagemark(&home)
        .arg("import")
        .arg("paper.pdf")
        .arg(&input)
        .assert()
        .success();

    let purged = stdout_of(pagemark(&home).args(["purge", "paper.pdf"]));
    assert!(purged.contains("removed annotations for paper.pdf"), "{purged}");

    let again = stdout_of(pagemark(&home).args(["purge", "paper.pdf"]));
    assert!(again.contains("no annotations stored for paper.pdf"), "{again}");

    let shown = stdout_of(pagemark(&home).args(["show", "paper.pdf"]));
    assert_eq!(shown, "paper.pdf: 0 page(s), 0 object(s)\n");
}

#[test]
fn import_fails_when_the_server_is_unreachable() {
    let home = tempdir().unwrap();
    let input = write_import(home.path());
    let output = pagemark(&home)
        .args(["--server", "http://127.0.0.1:1"])
        .arg("import")
        .arg("paper.pdf")
        .arg(&input)
        .assert()
        .failure()
        .get_output()
        .clone();

    let stdout = String::from_utf8(output.stdout).unwrap();
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(!stdout.contains("imported"), "{stdout}");
    assert!(stderr.contains("transport failed"), "{stderr}");
}

#[test]
fn unknown_object_types_survive_import_and_export() {
    let home = tempdir().unwrap();
    let input = home.path().join("shapes.json");
    fs::write(
        &input,
        r##"{"2": {"objects": [
            {"type": "circle", "left": 4, "top": 4, "radius": 9, "fill": "#00FF00"},
            {"type": "rect", "left": 5, "top": 5, "width": 20, "height": 10, "stroke": "#0000FF"}
        ]}}"##,
    )
    .unwrap();
    pagemark(&home)
        .arg("import")
        .arg("paper.pdf")
        .arg(&input)
        .assert()
        .success();

    let shown = stdout_of(pagemark(&home).args(["show", "paper.pdf"]));
    assert!(
        shown.contains("page 2: 0 stroke(s), 0 text, 1 rect(s), 1 other"),
        "{shown}"
    );

    let exported = stdout_of(pagemark(&home).args(["export", "paper.pdf", "-o", "-"]));
    let value: serde_json::Value = serde_json::from_str(&exported).unwrap();
    let circle = &value["pages"]["2"]["objects"][0];
    assert_eq!(circle["type"], "circle");
    assert_eq!(circle["radius"], 9);
}
