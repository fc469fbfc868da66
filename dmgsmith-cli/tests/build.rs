use predicates::prelude::*;

mod common;

#[test]
fn test_help_lists_commands() {
    let mut ctx = common::dmgsmith();
    ctx.cmd
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("build"))
        .stdout(predicate::str::contains("list"))
        .stdout(predicate::str::contains("download"));
}

#[test]
fn test_unknown_command_is_usage_error() {
    let mut ctx = common::dmgsmith();
    ctx.cmd.arg("frobnicate").assert().code(64);
}

#[test]
fn test_build_requires_source() {
    let mut ctx = common::dmgsmith();
    ctx.cmd.arg("build").assert().code(64);
}

#[test]
fn test_build_rejects_missing_source() {
    let mut ctx = common::dmgsmith();
    ctx.cmd
        .args(["build", "/nonexistent/Install OS X El Capitan.app", "-o", "/tmp/out.dmg"])
        .assert()
        .code(65)
        .stderr(predicate::str::contains("is not a valid installer"));
}

#[test]
fn test_build_without_output() {
    let mut ctx = common::dmgsmith();
    let installer = ctx.home().join("Install OS X El Capitan.app");
    std::fs::create_dir_all(&installer).unwrap();

    ctx.cmd
        .arg("build")
        .arg(&installer)
        .assert()
        .code(64)
        .stderr(predicate::str::contains("No output path"));
}

#[test]
fn test_build_template_without_source() {
    let mut ctx = common::dmgsmith();
    let template = ctx.write(
        "build.adtmpl",
        r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict>
<key>TemplateFormat</key><string>1.0</string>
<key>VolumeName</key><string>Macintosh HD</string>
</dict></plist>"#,
    );

    ctx.cmd
        .arg("build")
        .arg(template)
        .assert()
        .code(64)
        .stderr(predicate::str::contains("No source path"));
}

#[test]
fn test_build_recursive_template() {
    let mut ctx = common::dmgsmith();
    let path = ctx.home().join("loop.adtmpl");
    ctx.write(
        "loop.adtmpl",
        &format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict>
<key>IncludeTemplates</key><array><string>{}</string></array>
</dict></plist>"#,
            path.display()
        ),
    );

    ctx.cmd
        .arg("build")
        .arg(&path)
        .assert()
        .code(65)
        .stderr(predicate::str::contains("included recursively"));
}

#[test]
fn test_build_rejects_missing_package() {
    let mut ctx = common::dmgsmith();
    let installer = ctx.home().join("Install OS X El Capitan.app");
    std::fs::create_dir_all(&installer).unwrap();

    ctx.cmd
        .arg("build")
        .arg(&installer)
        .args(["-o", "/tmp/out.dmg", "/nonexistent/Extra.pkg"])
        .assert()
        .code(65)
        .stderr(predicate::str::contains("Additional packages failed verification"));
}

#[test]
fn test_download_without_profiles() {
    let mut ctx = common::dmgsmith();
    ctx.cmd
        .args(["download", "10.11.6", "15G31"])
        .assert()
        .code(65)
        .stderr(predicate::str::contains("No update profiles found"));
}

#[test]
fn test_download_with_everything_cached() {
    let mut ctx = common::dmgsmith().with_profiles().with_cached_update();
    ctx.cmd
        .args(["download", "10.11.6", "15G31"])
        .assert()
        .success()
        .stdout(predicate::str::contains("All updates for 10.11.6 15G31 downloaded"));
}
