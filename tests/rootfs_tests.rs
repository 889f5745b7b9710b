//! End-to-end rootfs assembly against a scripted backend.
//!
//! These tests drive `RootfsBuilder` through its whole sequence with a
//! backend that fakes package installation by writing files into the
//! target, so the orchestration is exercised without dnf or apt.

mod helpers;

use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{bail, Result};
use helpers::{assert_file_contains, assert_file_exists, TestEnv};
use rootstrap::backend::{BackendKind, PackageBackend};
use rootstrap::config::{BuildConfig, Feed, PackageSelection};
use rootstrap::manifest::{Manifest, PackageRecord};
use rootstrap::rootfs::{self, BuildStage, RootfsBuilder};

// =============================================================================
// Scripted backend
// =============================================================================

#[derive(Default)]
struct ScriptedBackend {
    target: PathBuf,
    exclusions: Vec<String>,
    installed: Vec<PackageRecord>,
    events: Rc<RefCell<Vec<String>>>,
    /// Step name whose call should fail, for error-path tests.
    fail_on: Option<&'static str>,
}

impl ScriptedBackend {
    fn new(target: PathBuf, events: Rc<RefCell<Vec<String>>>) -> Self {
        Self {
            target,
            events,
            ..Default::default()
        }
    }

    fn log(&self, event: String) {
        self.events.borrow_mut().push(event);
    }

    fn step(&self, name: &'static str) -> Result<()> {
        if self.fail_on == Some(name) {
            bail!("scripted {name} failure");
        }
        self.log(name.to_string());
        Ok(())
    }
}

impl PackageBackend for ScriptedBackend {
    fn configure(&mut self) -> Result<()> {
        fs::create_dir_all(&self.target)?;
        let saw_pre_hook = self.target.join("pre-hook-ran").exists();
        self.log(format!("configure(pre-hook-seen={saw_pre_hook})"));
        Ok(())
    }

    fn register_feeds(&mut self, feeds: &[Feed], persist: bool) -> Result<()> {
        self.log(format!("register_feeds({}, persist={persist})", feeds.len()));
        Ok(())
    }

    fn set_exclusions(&mut self, names: &[String]) -> Result<()> {
        self.exclusions = names.to_vec();
        self.log(format!("set_exclusions({})", names.join(",")));
        Ok(())
    }

    fn exclusions(&self) -> &[String] {
        &self.exclusions
    }

    fn refresh_index(&mut self) -> Result<()> {
        self.step("refresh_index")
    }

    fn install(&mut self, names: &[String], _attempt_only: bool) -> Result<()> {
        if self.fail_on == Some("install") {
            bail!("scripted install failure");
        }
        let share = self.target.join("usr/share");
        fs::create_dir_all(&share)?;
        for name in names {
            fs::write(share.join(name), "installed\n")?;
            self.installed.push(PackageRecord {
                name: name.clone(),
                arch: "intel_x86_64".to_string(),
                version: "1.0".to_string(),
                ..Default::default()
            });
        }
        self.log(format!("install({})", names.join(",")));
        Ok(())
    }

    fn remove(&mut self, _names: &[String], _with_dependencies: bool) -> Result<()> {
        self.step("remove")
    }

    fn list_installed(&mut self) -> Result<Manifest> {
        self.log("list_installed".to_string());
        Ok(Manifest::new(self.installed.clone()))
    }

    fn run_intercepts(&mut self) -> Result<()> {
        self.step("run_intercepts")
    }

    fn handle_intercept_failure(&mut self, _packages: &[String]) -> Result<()> {
        self.step("handle_intercept_failure")
    }

    fn post_install(&mut self) -> Result<()> {
        self.step("post_install")
    }

    fn install_complementary(&mut self, globs: &[String]) -> Result<()> {
        self.log(format!("install_complementary({})", globs.join(",")));
        Ok(())
    }
}

fn build_config(env: &TestEnv) -> BuildConfig {
    BuildConfig {
        machine: "intel-x86-64".to_string(),
        image_name: "core-image".to_string(),
        backend: BackendKind::Rpm,
        workdir: env.workdir.clone(),
        target_rootfs: env.target_rootfs.clone(),
        package_archs: vec!["intel_x86_64".to_string()],
        feeds: vec![Feed {
            uri: "file:///srv/feed".to_string(),
            extra: Vec::new(),
        }],
        selection: PackageSelection {
            packages: vec!["base-files".to_string(), "bash".to_string()],
            external: vec!["debug-tools".to_string()],
            excluded: vec!["docs".to_string()],
        },
        pkg_globs: vec!["*-dev".to_string()],
        install_recommends: true,
        no_clean: false,
        data_dir: None,
        native_root: None,
        rootfs_pre_scripts: Vec::new(),
        rootfs_post_scripts: Vec::new(),
        bootstrap: None,
    }
}

// =============================================================================
// Full builds
// =============================================================================

#[test]
fn test_full_build_populates_rootfs_and_manifests() {
    let env = TestEnv::new();
    let config = build_config(&env);
    let events = Rc::new(RefCell::new(Vec::new()));
    let backend = ScriptedBackend::new(config.target_rootfs.clone(), Rc::clone(&events));

    let mut builder = RootfsBuilder::with_backend(config, Box::new(backend));
    builder.create().unwrap();

    assert_eq!(builder.stage(), BuildStage::Done);
    assert_file_exists(&env.target_rootfs.join("usr/share/base-files"));
    assert_file_exists(&env.target_rootfs.join("usr/share/debug-tools"));

    // Both manifest flavors land in the workdir.
    assert_file_exists(&env.workdir.join("packages.json"));
    let image_manifest = env.workdir.join("core-image-intel-x86-64.manifest");
    assert_file_contains(&image_manifest, "base-files intel_x86_64 1.0");
    assert_file_contains(&image_manifest, "debug-tools intel_x86_64 1.0");

    let events = events.borrow();
    assert_eq!(events[0], "configure(pre-hook-seen=false)");
    assert!(events.contains(&"register_feeds(1, persist=false)".to_string()));
    assert!(events.contains(&"set_exclusions(docs)".to_string()));
    assert!(events.contains(&"install_complementary(*-dev)".to_string()));
    assert!(events.contains(&"install(debug-tools)".to_string()));
}

#[test]
fn test_hooks_run_around_the_package_steps() {
    let env = TestEnv::new();
    let mut config = build_config(&env);
    config.rootfs_pre_scripts = vec![
        "mkdir -p \"$IMAGE_ROOTFS\" && touch \"$IMAGE_ROOTFS/pre-hook-ran\"".to_string(),
    ];
    config.rootfs_post_scripts =
        vec!["printf '%s' \"$MACHINE\" > \"$IMAGE_ROOTFS/etc/built-for\"".to_string()];
    let events = Rc::new(RefCell::new(Vec::new()));
    let backend = ScriptedBackend::new(config.target_rootfs.clone(), Rc::clone(&events));

    let mut builder = RootfsBuilder::with_backend(config, Box::new(backend));

    // The post hook needs etc/ in place; the scripted install does not
    // create it, so seed it the way a base package would.
    fs::create_dir_all(env.target_rootfs.join("etc")).unwrap();
    builder.create().unwrap();

    // Pre hook ran before the backend configured the target.
    assert_eq!(events.borrow()[0], "configure(pre-hook-seen=true)");
    assert_file_contains(&env.target_rootfs.join("etc/built-for"), "intel-x86-64");
}

#[test]
fn test_feeds_persist_when_image_installs_its_package_manager() {
    let env = TestEnv::new();
    let mut config = build_config(&env);
    config.selection.packages.push("dnf".to_string());
    let events = Rc::new(RefCell::new(Vec::new()));
    let backend = ScriptedBackend::new(config.target_rootfs.clone(), Rc::clone(&events));

    let mut builder = RootfsBuilder::with_backend(config, Box::new(backend));
    builder.create().unwrap();

    assert!(events
        .borrow()
        .contains(&"register_feeds(1, persist=true)".to_string()));
}

// =============================================================================
// Failure handling
// =============================================================================

#[test]
fn test_failed_step_stops_the_build_at_its_stage() {
    let env = TestEnv::new();
    let config = build_config(&env);
    let events = Rc::new(RefCell::new(Vec::new()));
    let mut backend = ScriptedBackend::new(config.target_rootfs.clone(), Rc::clone(&events));
    backend.fail_on = Some("refresh_index");

    let mut builder = RootfsBuilder::with_backend(config, Box::new(backend));
    let err = builder.create().unwrap_err();

    assert!(err.to_string().contains("refresh_index"));
    // Exclusions were applied, nothing was installed.
    assert_eq!(builder.stage(), BuildStage::Excluded);
    assert!(!env.target_rootfs.join("usr/share/base-files").exists());
}

#[test]
fn test_failed_intercepts_fail_the_build_after_manifests() {
    let env = TestEnv::new();
    let config = build_config(&env);
    let events = Rc::new(RefCell::new(Vec::new()));
    let mut backend = ScriptedBackend::new(config.target_rootfs.clone(), Rc::clone(&events));
    backend.fail_on = Some("run_intercepts");

    let mut builder = RootfsBuilder::with_backend(config, Box::new(backend));
    let err = builder.create().unwrap_err();

    assert!(err.to_string().contains("run_intercepts"));
    assert_eq!(builder.stage(), BuildStage::PostInstalled);
    // The manifest was already captured before intercepts ran.
    assert_file_exists(&env.workdir.join("packages.json"));
}

// =============================================================================
// Workspace preparation
// =============================================================================

#[test]
fn test_prepare_workspace_round_trip_with_builder() {
    let env = TestEnv::new();
    let mut config = build_config(&env);

    fs::create_dir_all(&env.target_rootfs).unwrap();
    fs::write(env.target_rootfs.join("stale-file"), "old build").unwrap();

    // A cleaning prepare drops the old tree.
    rootfs::prepare_workspace(&config).unwrap();
    assert!(!env.target_rootfs.exists());

    // With no_clean the tree survives for a resumed build.
    fs::create_dir_all(&env.target_rootfs).unwrap();
    fs::write(env.target_rootfs.join("stale-file"), "old build").unwrap();
    config.no_clean = true;
    rootfs::prepare_workspace(&config).unwrap();
    assert_file_exists(&env.target_rootfs.join("stale-file"));
}
