//! Device information collected during bring-up

use crate::error::{Error, Result};

/// Firmware version parsed from the revision string
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
#[display("{major}.{minor}.{build}")]
pub struct FirmwareVersion {
    /// Major version
    pub major: u8,
    /// Minor version
    pub minor: u8,
    /// Build number, 0 when the string carries none
    pub build: u16,
}

impl FirmwareVersion {
    /// Parse a revision string such as `SpringCore 1.52 [r4251]` or `v2.10-r118`
    ///
    /// The first `major.minor` pair is the version; the first run of digits right after
    /// an `r` that follows it is the build.
    pub fn parse(revision: &str) -> Result<Self> {
        let invalid = || Error::DummyDevice(format!("Incorrect firmware revision: {revision}"));
        let bytes = revision.as_bytes();

        let dot = (1..bytes.len().saturating_sub(1))
            .find(|&at| {
                bytes[at] == b'.' && bytes[at - 1].is_ascii_digit() && bytes[at + 1].is_ascii_digit()
            })
            .ok_or_else(invalid)?;
        let major_start = bytes[..dot]
            .iter()
            .rposition(|b| !b.is_ascii_digit())
            .map_or(0, |p| p + 1);
        let minor_end = bytes[dot + 1..]
            .iter()
            .position(|b| !b.is_ascii_digit())
            .map_or(bytes.len(), |p| dot + 1 + p);

        let major = revision[major_start..dot].parse().map_err(|_| invalid())?;
        let minor = revision[dot + 1..minor_end].parse().map_err(|_| invalid())?;

        let build = revision[minor_end..]
            .split('r')
            .skip(1)
            .find_map(|rest| {
                let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
                digits.parse().ok()
            })
            .unwrap_or(0);

        Ok(Self {
            major,
            minor,
            build,
        })
    }
}

/// What the device told us about itself
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Raw firmware revision string
    pub firmware_revision: Option<String>,
    /// Parsed firmware version
    pub version: Option<FirmwareVersion>,
    /// Slot names in slot order
    pub slot_names: Vec<String>,
}

impl DeviceInfo {
    /// Record the firmware revision string
    pub(crate) fn set_revision(&mut self, revision: String) -> Result<()> {
        self.version = Some(FirmwareVersion::parse(&revision)?);
        self.firmware_revision = Some(revision);
        Ok(())
    }

    /// Record a slot name once
    pub(crate) fn add_slot_name(&mut self, name: &str) {
        if !self.slot_names.iter().any(|known| known == name) {
            self.slot_names.push(name.to_owned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_versions() {
        assert_eq!(
            FirmwareVersion::parse("SpringCore 1.52 [r4251]").unwrap(),
            FirmwareVersion {
                major: 1,
                minor: 52,
                build: 4251
            }
        );
        assert_eq!(
            FirmwareVersion::parse("Puck v2.10-r118").unwrap(),
            FirmwareVersion {
                major: 2,
                minor: 10,
                build: 118
            }
        );
        assert_eq!(
            FirmwareVersion::parse("12.3").unwrap(),
            FirmwareVersion {
                major: 12,
                minor: 3,
                build: 0
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            FirmwareVersion::parse("no version here"),
            Err(Error::DummyDevice(_))
        ));
        assert!(FirmwareVersion::parse("300.1").is_err());
    }

    #[test]
    fn test_revision_recorded() {
        let mut info = DeviceInfo::default();
        info.set_revision("SpringCore 1.52 [r4251]".into()).unwrap();
        assert_eq!(info.version.map(|v| v.to_string()), Some("1.52.4251".into()));

        info.add_slot_name("Contactless");
        info.add_slot_name("Contactless");
        assert_eq!(info.slot_names, vec!["Contactless".to_owned()]);
    }
}
