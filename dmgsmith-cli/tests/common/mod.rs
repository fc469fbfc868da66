#![allow(dead_code)]

use assert_cmd::Command;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

pub const SEC_SHA1: &str = "0123456789abcdef0123456789abcdef01234567";

/// Profiles with one update for 10.11.6 15G31 and a deprecated 10.12.1 build.
pub const PROFILES: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict>
<key>PublicationDate</key><date>2016-10-24T16:00:00Z</date>
<key>Profiles</key><dict>
  <key>10.11.6-15G31</key><array><string>sec1</string></array>
  <key>10.12.1-16B2555</key><array/>
</dict>
<key>Updates</key><dict>
  <key>sec1</key><dict>
    <key>name</key><string>Security Update 2016-002</string>
    <key>url</key><string>https://updates.example.com/SecUpd2016-002ElCapitan.dmg</string>
    <key>sha1</key><string>0123456789abcdef0123456789abcdef01234567</string>
    <key>size</key><integer>734003200</integer>
  </dict>
</dict>
<key>DeprecatedInstallers</key><dict>
  <key>10.12.1-16B2555</key><array><string>16B2553a</string></array>
</dict>
</dict></plist>"#;

pub struct TestContext {
    pub cmd: Command,
    pub home: TempDir,
}

impl TestContext {
    /// Another command sharing this context's home directory.
    pub fn new_cmd(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_dmgsmith"));
        cmd.timeout(Duration::from_secs(30));
        cmd.env_remove("DMGSMITH_HOME");
        cmd.arg("--home").arg(self.home.path());
        cmd
    }

    pub fn home(&self) -> &Path {
        self.home.path()
    }

    pub fn with_profiles(self) -> Self {
        std::fs::write(self.home.path().join("UpdateProfiles.plist"), PROFILES)
            .expect("Failed to write profiles");
        self
    }

    /// Pretend the security update was downloaded earlier.
    pub fn with_cached_update(self) -> Self {
        let updates = self.home.path().join("Updates");
        std::fs::create_dir_all(&updates).expect("Failed to create cache");
        std::fs::write(updates.join(SEC_SHA1), b"payload").expect("Failed to write payload");
        self
    }

    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.home.path().join(name);
        std::fs::write(&path, contents).expect("Failed to write file");
        path
    }
}

pub fn dmgsmith() -> TestContext {
    let home = TempDir::new().expect("Failed to create home dir");
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_dmgsmith"));
    cmd.timeout(Duration::from_secs(30));
    cmd.env_remove("DMGSMITH_HOME");
    cmd.arg("--home").arg(home.path());

    TestContext { cmd, home }
}
