//! Integration tests for profile resolution and merging
//!
//! Profiles are laid out on disk in a temporary catalog the way a real
//! profile tree is: `config.ini`, `scripts/` and an optional `rootfs/`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use image_builder::config::REQUIRED_VARIABLES;
use image_builder::{
    BuildError, BuilderOptions, ChrootManager, LoopDevice, PreflightReport, ProcessGuard,
    ProfileResolver, ScriptExecutor, ScriptSlot, Step, load_config,
};
use tempfile::TempDir;

fn write_profile(root: &Path, name: &str, config: &str, scripts: &[&str], rootfs: bool) -> PathBuf {
    let dir = root.join(name);
    fs::create_dir_all(dir.join("scripts")).unwrap();
    fs::write(dir.join("config.ini"), config).unwrap();
    for script in scripts {
        fs::write(dir.join("scripts").join(script), "#!/bin/sh\n").unwrap();
    }
    if rootfs {
        fs::create_dir_all(dir.join("rootfs/etc")).unwrap();
    }
    dir
}

const BASE: &str = "[build]\n\
    image_mounts=/boot/firmware,/\n\
    image_size=2G\n\
    image_url=https://cdimage.example.com/focal/base-arm64.img.xz\n\
    output_filename=focal-rt.img\n\
    qemu_user_static_path=/usr/bin/qemu-aarch64-static\n\
    pause_after=prepare_chroot\n\
    [env]\n\
    TARGET_USER=ubuntu\n";

const RT: &str = "[build]\n\
    image_size=4G\n\
    [env]\n\
    KERNEL_FLAVOR=rt\n";

struct Catalog {
    dir: TempDir,
}

impl Catalog {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        write_profile(
            dir.path(),
            "focal",
            BASE,
            &["extract-image", "loop-device-setup", "phase1-host", "phase1-target"],
            true,
        );
        write_profile(dir.path(), "focal-rt", RT, &["phase1-target", "phase2-target"], true);
        Self { dir }
    }

    fn options(&self) -> BuilderOptions {
        BuilderOptions {
            catalog_dir: self.dir.path().to_path_buf(),
            ..BuilderOptions::default()
        }
        .absolutized()
        .unwrap()
    }
}

#[test]
fn test_later_profile_overrides_image_size() {
    let catalog = Catalog::new();
    let config = load_config(&["focal", "focal-rt"], &catalog.options()).unwrap();

    assert_eq!(config.build_var("image_size"), Some("4G"));
    assert_eq!(config.build_var("output_filename"), Some("focal-rt.img"));
    assert_eq!(config.env_vars()["TARGET_USER"], "ubuntu");
    assert_eq!(config.env_vars()["KERNEL_FLAVOR"], "rt");
    assert_eq!(config.pause_step(), Some(Step::PrepareChroot));
}

#[test]
fn test_scripts_and_overlays_follow_profile_order() {
    let catalog = Catalog::new();
    let root = catalog.dir.path();
    let config = load_config(&["focal", "focal-rt"], &catalog.options()).unwrap();

    assert_eq!(
        config.scripts(ScriptSlot::Phase1Target),
        &[
            root.join("focal/scripts/phase1-target"),
            root.join("focal-rt/scripts/phase1-target"),
        ]
    );
    assert_eq!(config.scripts(ScriptSlot::Phase1Host).len(), 1);
    assert!(config.scripts(ScriptSlot::Phase2Host).is_empty());
    assert_eq!(
        config.rootfs_overlays(),
        &[root.join("focal/rootfs"), root.join("focal-rt/rootfs")]
    );
    assert_eq!(
        config.extract_image(),
        Some(root.join("focal/scripts/extract-image").as_path())
    );
}

#[test]
fn test_merged_profiles_pass_config_checks() {
    let catalog = Catalog::new();
    let config = load_config(&["focal", "focal-rt"], &catalog.options()).unwrap();

    let mut report = PreflightReport::default();
    report.check_config(&config);
    assert!(report.is_ok(), "{:?}", report.violations());

    let settings = config.image_settings().unwrap();
    assert_eq!(settings.mounts, vec!["/boot/firmware", "/"]);
    assert_eq!(settings.download_name().unwrap(), "base-arm64.img.xz");
}

#[test]
fn test_overlay_profile_alone_misses_requirements() {
    let catalog = Catalog::new();
    let config = load_config(&["focal-rt"], &catalog.options()).unwrap();

    let mut report = PreflightReport::default();
    report.check_config(&config);

    // extract-image, loop-device-setup and every required variable but image_size
    assert_eq!(report.violations().len(), 2 + REQUIRED_VARIABLES.len() - 1);
}

#[test]
fn test_literal_path_and_catalog_name_mix() {
    let catalog = Catalog::new();
    let elsewhere = TempDir::new().unwrap();
    let local = write_profile(
        elsewhere.path(),
        "site",
        "[build]\nimage_size=8G\n[env]\n",
        &[],
        false,
    );

    let config = load_config(
        &["focal", "focal-rt", local.to_str().unwrap()],
        &catalog.options(),
    )
    .unwrap();
    assert_eq!(config.build_var("image_size"), Some("8G"));
    assert_eq!(config.profile_dirs().last(), Some(&local));
}

#[test]
fn test_unknown_profile_is_reported_by_name() {
    let catalog = Catalog::new();
    let err = load_config(&["focal", "jammy"], &catalog.options()).unwrap_err();

    match err {
        BuildError::ProfileNotFound { name, .. } => assert_eq!(name, "jammy"),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_catalog_lists_profiles() {
    let catalog = Catalog::new();
    let resolver = ProfileResolver::new(catalog.dir.path());
    assert_eq!(resolver.catalog().unwrap(), vec!["focal", "focal-rt"]);
}

#[test]
fn test_third_mount_entry_gets_third_partition() {
    let catalog = Catalog::new();
    let elsewhere = TempDir::new().unwrap();
    let local = write_profile(
        elsewhere.path(),
        "three-parts",
        "[build]\nimage_mounts = /boot/firmware, /data, /\n",
        &[],
        false,
    );

    let config = load_config(&["focal", local.to_str().unwrap()], &catalog.options()).unwrap();
    let settings = config.image_settings().unwrap();

    let guard = ProcessGuard::new();
    let exec = ScriptExecutor::new(BTreeMap::new(), "/tmp/c", "systemd-nspawn", guard.registry());
    let chroot = ChrootManager::new(&exec, "/tmp/c", &settings.mounts, &settings.emulator_binary);
    let plan = chroot.mount_plan(&LoopDevice::new("/dev/loop0"));

    assert_eq!(plan[0].device, PathBuf::from("/dev/loop0p3"));
    assert_eq!(plan[0].target, PathBuf::from("/tmp/c/"));
    assert_eq!(plan[2].device, PathBuf::from("/dev/loop0p1"));
}

#[test]
fn test_blank_mount_entry_fails_instead_of_shifting_partitions() {
    let catalog = Catalog::new();
    let elsewhere = TempDir::new().unwrap();
    let local = write_profile(
        elsewhere.path(),
        "gap",
        "[build]\nimage_mounts = boot,,/\n",
        &[],
        false,
    );

    let config = load_config(&["focal", local.to_str().unwrap()], &catalog.options()).unwrap();
    assert!(matches!(config.image_settings(), Err(BuildError::Config(_))));

    let mut report = PreflightReport::default();
    report.check_config(&config);
    assert!(!report.is_ok());
}
