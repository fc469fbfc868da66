//! Parsing of `hdiutil ... -plist` output.

use std::path::{Path, PathBuf};

use dmgsmith_shared::errors::{BuildError, BuildResult};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct SystemEntity {
    #[serde(rename = "mount-point")]
    mount_point: Option<PathBuf>,
    #[serde(rename = "potentially-mountable")]
    potentially_mountable: Option<plist::Value>,
}

impl SystemEntity {
    fn is_mountable(&self) -> bool {
        match &self.potentially_mountable {
            Some(plist::Value::Boolean(b)) => *b,
            Some(value) => value.as_signed_integer() == Some(1),
            None => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AttachOutput {
    #[serde(rename = "system-entities", default)]
    system_entities: Vec<SystemEntity>,
}

#[derive(Debug, Deserialize)]
struct AttachedImage {
    #[serde(rename = "image-path")]
    image_path: Option<PathBuf>,
    #[serde(rename = "system-entities", default)]
    system_entities: Vec<SystemEntity>,
}

#[derive(Debug, Deserialize)]
struct InfoOutput {
    #[serde(default)]
    images: Vec<AttachedImage>,
}

/// hdiutil may print license text or warnings ahead of the plist.
fn strip_preamble(output: &[u8]) -> &[u8] {
    const XML_START: &[u8] = b"<?xml";
    output
        .windows(XML_START.len())
        .position(|w| w == XML_START)
        .map(|start| &output[start..])
        .unwrap_or(output)
}

/// Mount point of the first mountable partition in an attach result.
pub(crate) fn parse_attach(output: &[u8], image: &Path) -> BuildResult<PathBuf> {
    let parsed: AttachOutput = plist::from_bytes(strip_preamble(output)).map_err(|e| {
        BuildError::Mount(format!(
            "Failed to parse hdiutil output for {}: {}",
            image.display(),
            e
        ))
    })?;

    parsed
        .system_entities
        .into_iter()
        .filter(|entity| entity.is_mountable())
        .find_map(|entity| entity.mount_point)
        .ok_or_else(|| BuildError::Mount(format!("No mounted filesystem in {}", image.display())))
}

/// `(image path, mount point)` for every attached image that has a mounted
/// volume.
pub(crate) fn parse_info(output: &[u8]) -> BuildResult<Vec<(PathBuf, PathBuf)>> {
    let parsed: InfoOutput = plist::from_bytes(strip_preamble(output))
        .map_err(|e| BuildError::Mount(format!("Failed to parse hdiutil info: {}", e)))?;

    Ok(parsed
        .images
        .into_iter()
        .filter_map(|image| {
            let path = image.image_path?;
            let mount_point = image
                .system_entities
                .into_iter()
                .find_map(|entity| entity.mount_point)?;
            Some((path, mount_point))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ATTACH: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
	<key>system-entities</key>
	<array>
		<dict>
			<key>content-hint</key><string>GUID_partition_scheme</string>
			<key>dev-entry</key><string>/dev/disk4</string>
			<key>potentially-mountable</key><false/>
		</dict>
		<dict>
			<key>content-hint</key><string>EFI</string>
			<key>dev-entry</key><string>/dev/disk4s1</string>
			<key>potentially-mountable</key><true/>
		</dict>
		<dict>
			<key>content-hint</key><string>Apple_HFS</string>
			<key>dev-entry</key><string>/dev/disk4s2</string>
			<key>mount-point</key><string>/tmp/dmg.Xy12ab</string>
			<key>potentially-mountable</key><true/>
		</dict>
	</array>
</dict>
</plist>
"#;

    #[test]
    fn attach_picks_first_mounted_partition() {
        let mp = parse_attach(ATTACH.as_bytes(), Path::new("/x.dmg")).unwrap();
        assert_eq!(mp, PathBuf::from("/tmp/dmg.Xy12ab"));
    }

    #[test]
    fn attach_tolerates_license_preamble() {
        let output = format!("Agree Y/N? {}", ATTACH);
        let mp = parse_attach(output.as_bytes(), Path::new("/x.dmg")).unwrap();
        assert_eq!(mp, PathBuf::from("/tmp/dmg.Xy12ab"));
    }

    #[test]
    fn attach_without_mount_point_names_the_image() {
        let output = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict><key>system-entities</key><array>
<dict><key>potentially-mountable</key><true/></dict>
</array></dict></plist>"#;
        let err = parse_attach(output.as_bytes(), Path::new("/x/Empty.dmg")).unwrap_err();
        assert_eq!(err.to_string(), "No mounted filesystem in /x/Empty.dmg");
    }

    #[test]
    fn info_maps_images_to_mount_points() {
        let output = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict>
<key>framework</key><string>480</string>
<key>images</key><array>
  <dict>
    <key>image-path</key><string>/Users/me/Install.dmg</string>
    <key>system-entities</key><array>
      <dict><key>dev-entry</key><string>/dev/disk5</string></dict>
      <dict><key>mount-point</key><string>/tmp/dmg.AAAA</string></dict>
    </array>
  </dict>
  <dict>
    <key>image-path</key><string>/Users/me/Unmounted.dmg</string>
    <key>system-entities</key><array>
      <dict><key>dev-entry</key><string>/dev/disk6</string></dict>
    </array>
  </dict>
</array></dict></plist>"#;
        let images = parse_info(output.as_bytes()).unwrap();
        assert_eq!(
            images,
            vec![(
                PathBuf::from("/Users/me/Install.dmg"),
                PathBuf::from("/tmp/dmg.AAAA")
            )]
        );
    }
}
