//! Integration tests for manifest capture and serialization.

mod helpers;

use helpers::{assert_file_contains, assert_file_exists, TestEnv};
use rootstrap::manifest::{Manifest, PackageRecord};

fn record(name: &str, version: &str) -> PackageRecord {
    PackageRecord {
        name: name.to_string(),
        arch: "intel_x86_64".to_string(),
        version: version.to_string(),
        filename: format!("{name}-{version}-r0.intel_x86_64.rpm"),
        deps: Vec::new(),
        recs: Vec::new(),
        provs: Vec::new(),
    }
}

#[test]
fn test_json_round_trip() {
    let env = TestEnv::new();
    let path = env.workdir.join("packages.json");

    let mut bash = record("bash", "5.2");
    bash.deps = vec!["glibc".to_string(), "ncurses".to_string()];
    bash.provs = vec!["/bin/sh".to_string()];
    let manifest = Manifest::new([bash, record("zlib", "1.3")]);

    manifest.save_json(&path).unwrap();
    assert_file_exists(&path);

    let loaded = Manifest::load_json(&path).unwrap();
    assert_eq!(loaded.len(), 2);
    let bash = loaded.get("bash").unwrap();
    assert_eq!(bash.version, "5.2");
    assert_eq!(bash.deps, ["glibc", "ncurses"]);
    assert_eq!(bash.provs, ["/bin/sh"]);
}

#[test]
fn test_json_uses_ver_key_and_omits_empty_lists() {
    let env = TestEnv::new();
    let path = env.workdir.join("packages.json");

    Manifest::new([record("zlib", "1.3")])
        .save_json(&path)
        .unwrap();

    assert_file_contains(&path, "\"ver\": \"1.3\"");
    let content = std::fs::read_to_string(&path).unwrap();
    assert!(!content.contains("\"deps\""));
    assert!(!content.contains("\"provs\""));
}

#[test]
fn test_image_manifest_is_sorted_name_arch_version() {
    let env = TestEnv::new();
    let path = env.workdir.join("image.manifest");

    let manifest = Manifest::new([record("zlib", "1.3"), record("bash", "5.2")]);
    manifest.save_image_manifest(&path).unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(
        content,
        "bash intel_x86_64 5.2\nzlib intel_x86_64 1.3\n"
    );
}

#[test]
fn test_provided_names_cover_virtual_provides() {
    let mut bash = record("bash", "5.2");
    bash.provs = vec!["/bin/sh".to_string(), "shell".to_string()];
    let manifest = Manifest::new([bash, record("zlib", "1.3")]);

    // Names arrive only through provides entries; zlib provides nothing.
    let provided = manifest.provided_names();
    assert!(provided.contains("shell"));
    assert!(provided.contains("/bin/sh"));
    assert!(!provided.contains("zlib"));
    assert_eq!(provided.len(), 2);
}

#[test]
fn test_contains_and_get() {
    let manifest = Manifest::new([record("bash", "5.2")]);

    assert!(manifest.contains("bash"));
    assert!(!manifest.contains("zsh"));
    assert!(manifest.get("zsh").is_none());
    assert_eq!(manifest.names().collect::<Vec<_>>(), ["bash"]);
}
