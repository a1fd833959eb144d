#![allow(missing_docs)]

use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

fn loaded_tree(name: &str, count: u64) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join(format!("{name}.gbt"));
    cargo_bin_cmd!("gbtree")
        .args(["load", "--count", &count.to_string(), "--seed", "7"])
        .arg(&path)
        .assert()
        .success();
    (dir, path)
}

#[test]
fn create_then_info_reports_clean_empty_tree() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("empty.gbt");
    cargo_bin_cmd!("gbtree").arg("create").arg(&path).assert().success();
    assert!(path.exists());

    let output = cargo_bin_cmd!("gbtree")
        .args(["--format", "json", "info"])
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["page_size"].as_u64(), Some(8192));
    assert_eq!(json["clean_shutdown"].as_bool(), Some(true));
    assert_eq!(json["key_size"].as_u64(), Some(8));
    assert_eq!(json["value_size"].as_u64(), Some(8));
    assert!(json["root"].is_number());
}

#[test]
fn load_then_verify_json_is_consistent() {
    let (_dir, path) = loaded_tree("verify", 5_000);
    let output = cargo_bin_cmd!("gbtree")
        .args(["--format", "json", "verify"])
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["errors"].as_array().map(Vec::len), Some(0));
    assert!(json["height"].as_u64().unwrap_or(0) >= 2);
    let entries = json["entries"].as_u64().unwrap_or(0);
    assert!(entries > 0 && entries <= 5_000);
}

#[test]
fn dump_prints_bounded_range_in_order() {
    let (_dir, path) = loaded_tree("dump", 2_000);
    let output = cargo_bin_cmd!("gbtree")
        .args(["dump", "--from", "100", "--to", "900"])
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8 output");
    let mut last = None;
    let mut lines = 0;
    for line in text.lines() {
        let (key, value) = line.split_once('\t').expect("tab separated entry");
        let key: u64 = key.parse().expect("numeric key");
        let value: u64 = value.parse().expect("numeric value");
        assert!((100..=900).contains(&key));
        assert_eq!(value, key.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        assert!(last.map_or(true, |last| last < key));
        last = Some(key);
        lines += 1;
    }
    assert!(lines > 0);
}

#[test]
fn load_json_reports_splits() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("load.gbt");
    let output = cargo_bin_cmd!("gbtree")
        .args(["--format", "json", "load", "--count", "3000"])
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["inserted"].as_u64(), Some(3_000));
    assert!(json["stats"]["leaf_splits"].as_u64().unwrap_or(0) > 0);
}

#[test]
fn mismatched_layout_is_rejected() {
    let (_dir, path) = loaded_tree("mismatch", 100);
    cargo_bin_cmd!("gbtree")
        .args(["--key-padding", "16", "verify"])
        .arg(&path)
        .assert()
        .failure();
}

#[test]
fn verify_missing_file_fails() {
    let dir = TempDir::new().expect("tempdir");
    cargo_bin_cmd!("gbtree")
        .arg("verify")
        .arg(dir.path().join("absent.gbt"))
        .assert()
        .failure();
}
