//! End-to-end tests of the pkgfs binary.

use std::process::{Command, Output};

use pkgfs_config::testing::TestEnvironment;

fn pkgfs(env: &TestEnvironment, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_pkgfs"))
        .args(args)
        .envs(env.env_vars())
        .current_dir(&env.scratch_root)
        .output()
        .expect("Failed to execute pkgfs")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn packed_env() -> TestEnvironment {
    let env = TestEnvironment::new().unwrap();
    env.create_file("src/file1", b"abcd").unwrap();
    env.create_file("src/index/file2", b"12345").unwrap();
    let src = env.scratch_root.join("src");
    let output = pkgfs(&env, &["pack", src.to_str().unwrap(), "/seg/package_file"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout(&output).contains("Files:          2"));
    env
}

#[test]
fn test_pack_then_list() {
    let env = packed_env();
    assert!(env.storage_root.join("seg/package_file.__meta__").exists());
    assert!(env.storage_root.join("seg/package_file.__data__0").exists());

    let output = pkgfs(&env, &["ls", "/seg", "-r"]);
    assert!(output.status.success());
    let lines: Vec<String> = stdout(&output).lines().map(String::from).collect();
    assert_eq!(lines, vec!["file1", "index/", "index/file2"]);

    let output = pkgfs(&env, &["ls", "/seg", "--physical"]);
    let lines: Vec<String> = stdout(&output).lines().map(String::from).collect();
    assert_eq!(lines, vec!["package_file.__data__0", "package_file.__meta__"]);
}

#[test]
fn test_inspect_prints_meta() {
    let env = packed_env();
    let output = pkgfs(&env, &["inspect", "/seg/package_file"]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("index/file2"));
    assert!(text.contains("Payload bytes:  9"));

    let output = pkgfs(&env, &["inspect", "/seg/package_file", "--json"]);
    assert!(stdout(&output).contains("\"inner_files\""));

    let output = pkgfs(&env, &["inspect", "/seg/missing"]);
    assert!(!output.status.success());
}

#[test]
fn test_rm_deletes_physical_files_with_their_directory() {
    let env = packed_env();

    let output = pkgfs(&env, &["rm", "/seg/file1"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    // index/file2 still references the data file
    assert!(env.storage_root.join("seg/package_file.__data__0").exists());

    // Each run mounts from the meta again, so file1 is back and keeps the data
    let output = pkgfs(&env, &["rm", "/seg/index"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(env.storage_root.join("seg/package_file.__data__0").exists());

    let output = pkgfs(&env, &["rm", "/seg"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(!env.storage_root.join("seg/package_file.__data__0").exists());
    assert!(!env.storage_root.join("seg/package_file.__meta__").exists());

    let output = pkgfs(&env, &["rm", "/seg/nothing"]);
    assert!(!output.status.success());
}

#[test]
fn test_config_commands() {
    let env = TestEnvironment::new().unwrap();
    let output = pkgfs(&env, &["config", "path"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Project:"));

    let output = pkgfs(&env, &["config", "show"]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("[storage]"));
    assert!(text.contains("[load]"));
    assert!(text.contains(env.storage_root.to_str().unwrap()));
}
