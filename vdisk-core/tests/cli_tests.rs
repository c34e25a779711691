use clap::Parser;
use std::sync::Arc;
use tempfile::tempdir;
use vdisk_core::cli::Cli;
use vdisk_core::commands;
use vdisk_core::errors::exit_code;
use vdisk_core::{Config, DiskManager, OutputMode};
use vdisk_hal::FakeHal;

fn run(manager: &DiskManager, args: &[&str]) -> anyhow::Result<String> {
    let cli = Cli::try_parse_from(args).expect("valid args");
    let mut out = Vec::new();
    commands::run(manager, &cli.command, &mut out)?;
    Ok(String::from_utf8(out).expect("utf8"))
}

#[test]
fn json_output_is_one_object_per_line() {
    let dir = tempdir().unwrap();
    let config = Config::default()
        .with_tracking_file(dir.path().join("tracking.json"))
        .with_output(OutputMode::Json);
    let manager = DiskManager::new(Arc::new(FakeHal::new()), config);

    let img = dir.path().join("a.img");
    let mnt = dir.path().join("mnt");
    let img_arg = img.to_string_lossy().into_owned();
    let mnt_arg = mnt.to_string_lossy().into_owned();

    let created = run(
        &manager,
        &["vdisk", "create", "--path", &img_arg, "--size", "64M", "--mount-point", &mnt_arg],
    )
    .expect("create");
    let value: serde_json::Value = serde_json::from_str(created.trim()).unwrap();
    assert_eq!(value["operation"], "create");
    assert_eq!(value["state"], "mounted");
    assert_eq!(value["device"], "sdd");

    let again = run(&manager, &["vdisk", "mount", "--path", &img_arg, "--mount-point", &mnt_arg])
        .expect("mount");
    let value: serde_json::Value = serde_json::from_str(again.trim()).unwrap();
    assert_eq!(value["result"], "already-in-state");

    let all = run(&manager, &["vdisk", "status", "--all"]).expect("status");
    assert_eq!(all.lines().count(), 1);
    let value: serde_json::Value = serde_json::from_str(all.trim()).unwrap();
    assert_eq!(value["mountPoints"][0], mnt_arg.as_str());
}

#[test]
fn failures_map_to_exit_codes() {
    let dir = tempdir().unwrap();
    let config = Config::default().with_tracking_file(dir.path().join("tracking.json"));
    let manager = DiskManager::new(Arc::new(FakeHal::new()), config);

    let missing = dir.path().join("missing.img").to_string_lossy().into_owned();
    let err = run(&manager, &["vdisk", "attach", "--path", &missing]).unwrap_err();
    assert_eq!(exit_code(&err), 2);

    let err = run(&manager, &["vdisk", "attach"]).unwrap_err();
    assert_eq!(exit_code(&err), 4);

    let out = run(&manager, &["vdisk", "status", "--all"]).expect("status");
    assert_eq!(out, "no disks\n");
}

#[test]
fn effective_config_layers_file_then_flags() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("config.toml");
    std::fs::write(&file, "verbose = true\nmount_options = \"noatime\"\ndefault_fs_type = \"xfs\"\n")
        .unwrap();
    let file_arg = file.to_string_lossy().into_owned();
    let track = dir.path().join("flag.json");
    let track_arg = track.to_string_lossy().into_owned();

    let cli = Cli::try_parse_from([
        "vdisk",
        "--config",
        file_arg.as_str(),
        "--tracking-file",
        track_arg.as_str(),
        "--json",
        "status",
        "--all",
    ])
    .unwrap();
    let config = commands::effective_config(&cli).unwrap();
    assert!(config.verbose);
    assert_eq!(config.default_fs_type, "xfs");
    assert_eq!(config.mount_options.as_deref(), Some("noatime"));
    assert_eq!(config.tracking_file, track);
    assert_eq!(config.output, OutputMode::Json);

    let quiet = dir.path().join("quiet.toml");
    std::fs::write(&quiet, "verbose = false\n").unwrap();
    let quiet_arg = quiet.to_string_lossy().into_owned();
    let cli = Cli::try_parse_from(["vdisk", "--config", quiet_arg.as_str(), "--verbose", "status"])
        .unwrap();
    assert!(commands::effective_config(&cli).unwrap().verbose);
}
