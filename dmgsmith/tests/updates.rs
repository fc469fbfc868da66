//! Update profiles feeding the download queue and the cache.

use std::sync::Arc;

use dmgsmith::cache::{DownloadEvent, UpdateCache, download_all};
use dmgsmith::{Package, UpdateProfiles};
use dmgsmith_test_utils::MemoryFetcher;
use sha1::{Digest, Sha1};
use tempfile::TempDir;

// ============================================================================
// TEST FIXTURES
// ============================================================================

const SEC_URL: &str = "https://updates.example.com/SecUpd2016-002ElCapitan.dmg";
const COMBO_URL: &str = "https://updates.example.com/OSXUpdCombo10.11.6.dmg";

struct TestContext {
    _temp_dir: TempDir,
    cache: Arc<UpdateCache>,
    fetcher: Arc<MemoryFetcher>,
    profiles: UpdateProfiles,
}

fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

impl TestContext {
    /// Profiles for 10.11.5 (two updates) served with `sec_body` and
    /// `combo_body`. The profile digests always describe the intended
    /// payloads, so a differing body fails verification.
    fn new(sec_body: &[u8], combo_body: &[u8]) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let cache = Arc::new(UpdateCache::new(temp_dir.path().join("Updates")).unwrap());

        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.serve(SEC_URL, 200, sec_body);
        fetcher.serve(COMBO_URL, 200, combo_body);

        let xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict>
<key>PublicationDate</key><date>2016-10-24T16:00:00Z</date>
<key>Profiles</key><dict>
  <key>10.11.5-15F34</key><array><string>sec</string><string>combo</string></array>
</dict>
<key>Updates</key><dict>
  <key>sec</key><dict>
    <key>name</key><string>Security Update 2016-002</string>
    <key>url</key><string>{}</string>
    <key>sha1</key><string>{}</string>
    <key>size</key><integer>{}</integer>
  </dict>
  <key>combo</key><dict>
    <key>name</key><string>Combo Update 10.11.6</string>
    <key>url</key><string>{}</string>
    <key>sha1</key><string>{}</string>
    <key>size</key><integer>{}</integer>
  </dict>
</dict>
</dict></plist>"#,
            SEC_URL,
            sha1_hex(b"security update payload"),
            sec_body.len(),
            COMBO_URL,
            sha1_hex(b"combo update payload"),
            combo_body.len(),
        );
        let profiles = UpdateProfiles::from_bytes(xml.as_bytes()).unwrap();

        Self {
            _temp_dir: temp_dir,
            cache,
            fetcher,
            profiles,
        }
    }

    fn packages(&self) -> Vec<Package> {
        self.profiles
            .profile_for("10.11.5", "15F34")
            .unwrap()
            .iter()
            .map(|u| {
                Package::update(
                    u.name.clone(),
                    self.cache.cache_path(&u.sha1),
                    u.size,
                    u.url.clone(),
                    u.sha1.clone(),
                )
            })
            .collect()
    }

    async fn download(&self) -> Vec<DownloadEvent> {
        let mut rx = download_all(
            Arc::clone(&self.cache),
            self.packages(),
            Arc::clone(&self.fetcher) as _,
        );
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }
}

// ============================================================================
// DOWNLOADS
// ============================================================================

#[tokio::test]
async fn profile_updates_download_in_order_and_link_friendly_names() {
    let ctx = TestContext::new(b"security update payload", b"combo update payload");

    let events = ctx.download().await;

    let verified: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            DownloadEvent::ChecksumOk { package, .. } => Some(package.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(verified, ["Security Update 2016-002", "Combo Update 10.11.6"]);
    assert_eq!(events.last(), Some(&DownloadEvent::AllDone));
    assert_eq!(ctx.fetcher.requests(), [SEC_URL, COMBO_URL]);

    for package in ctx.packages() {
        assert!(ctx.cache.is_cached(package.sha1().unwrap()));
        assert!(package.path().is_file());
    }

    ctx.cache.prune_and_link(&ctx.profiles.update_paths()).unwrap();
    let link = ctx
        .cache
        .link_path(&format!("SecUpd2016-002ElCapitan({}).dmg", &sha1_hex(b"security update payload")[..7]));
    assert_eq!(std::fs::read(link).unwrap(), b"security update payload");
}

#[tokio::test]
async fn corrupted_update_stops_the_queue() {
    let ctx = TestContext::new(b"truncated", b"combo update payload");

    let events = ctx.download().await;

    let failed = events.iter().find_map(|e| match e {
        DownloadEvent::Failed { package, message } => Some((package.clone(), message.clone())),
        _ => None,
    });
    let (package, message) = failed.expect("download should fail");
    assert_eq!(package, "Security Update 2016-002");
    assert!(message.contains("Expected sha1 checksum"), "{}", message);

    assert_eq!(events.last(), Some(&DownloadEvent::AllDone));
    assert_eq!(ctx.fetcher.requests(), [SEC_URL]);
    assert!(!ctx.packages().iter().any(|p| ctx.cache.is_cached(p.sha1().unwrap())));
}

#[tokio::test]
async fn cached_payload_survives_a_second_pass() {
    let ctx = TestContext::new(b"security update payload", b"combo update payload");
    ctx.download().await;

    ctx.cache.prune_and_link(&ctx.profiles.update_paths()).unwrap();
    ctx.cache.prune_and_link(&ctx.profiles.update_paths()).unwrap();

    let entries = std::fs::read_dir(ctx.cache.dir()).unwrap().count();
    assert_eq!(entries, 4);
}
