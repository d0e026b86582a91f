// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stable application identities for live audio streams.
//!
//! Stream and process ids change every launch, so an application is
//! recognised by its display name and binary instead. Both strings go through
//! the quirks table first, then into a 16-byte SHAKE128 digest. The digest
//! is the one the existing front-ends compute, so their save files and
//! ignore lists keep matching.

use crate::quirks::QuirksTable;
use crate::{ApplicationIdentity, PROP_APPLICATION_BINARY, PROP_APPLICATION_NAME};
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::Shake128;
use thiserror::Error;

/// Number of digest bytes kept in an identity.
const IDENTITY_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("stream metadata is missing {0}")]
    MetadataIncomplete(&'static str),
}

/// Application metadata as reported for a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamMetadata {
    pub name: Option<String>,
    pub binary: Option<String>,
}

impl StreamMetadata {
    pub fn new(name: impl Into<String>, binary: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            binary: Some(binary.into()),
        }
    }

    /// Display name for log lines, whatever is available.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.binary.as_deref())
            .unwrap_or("Unknown")
    }
}

/// A stream's application after quirks correction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedApplication {
    pub identity: ApplicationIdentity,
    pub name: String,
    pub binary: String,
}

/// SHAKE128 over the corrected name followed directly by the binary.
pub fn fingerprint(name: &str, binary: &str) -> ApplicationIdentity {
    let mut hasher = Shake128::default();
    hasher.update(name.as_bytes());
    hasher.update(binary.as_bytes());
    let mut digest = [0u8; IDENTITY_LEN];
    hasher.finalize_xof().read(&mut digest);
    ApplicationIdentity::from_digest(&digest)
}

/// Maps stream metadata to application identities.
#[derive(Debug, Default)]
pub struct IdentityResolver {
    quirks: QuirksTable,
}

impl IdentityResolver {
    pub fn new(quirks: QuirksTable) -> Self {
        Self { quirks }
    }

    pub fn quirks(&self) -> &QuirksTable {
        &self.quirks
    }

    /// Resolve a stream's application, applying quirks before hashing.
    pub fn resolve(&self, metadata: &StreamMetadata) -> Result<ResolvedApplication, IdentityError> {
        let corrected = self.quirks.correct(metadata);
        let name = corrected
            .name
            .ok_or(IdentityError::MetadataIncomplete(PROP_APPLICATION_NAME))?;
        let binary = corrected
            .binary
            .ok_or(IdentityError::MetadataIncomplete(PROP_APPLICATION_BINARY))?;

        Ok(ResolvedApplication {
            identity: fingerprint(&name, &binary),
            name,
            binary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_32_hex_chars() {
        let id = fingerprint("Firefox", "firefox");
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        assert_eq!(fingerprint("mpv", "/usr/bin/mpv"), fingerprint("mpv", "/usr/bin/mpv"));
        assert_ne!(fingerprint("mpv", "/usr/bin/mpv"), fingerprint("mpv", "mpv"));
    }

    #[test]
    fn test_fingerprint_matches_existing_save_files() {
        assert_eq!(fingerprint("Firefox", "firefox").as_str(), "ee2ca59be6f26884c674126e7305d47f");
        assert_eq!(fingerprint("mpv", "mpv").as_str(), "6dc5d9f27abd6ae16cd69461f2ccb881");
    }

    #[test]
    fn test_resolve_ignores_everything_but_name_and_binary() {
        let resolver = IdentityResolver::default();
        let a = resolver.resolve(&StreamMetadata::new("Spotify", "spotify")).unwrap();
        let b = resolver.resolve(&StreamMetadata::new("Spotify", "spotify")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.identity, fingerprint("Spotify", "spotify"));
    }

    #[test]
    fn test_incomplete_metadata() {
        let resolver = IdentityResolver::default();
        let no_binary = StreamMetadata {
            name: Some("Game".to_string()),
            binary: None,
        };
        assert_eq!(
            resolver.resolve(&no_binary),
            Err(IdentityError::MetadataIncomplete(PROP_APPLICATION_BINARY))
        );
        assert_eq!(
            resolver.resolve(&StreamMetadata::default()),
            Err(IdentityError::MetadataIncomplete(PROP_APPLICATION_NAME))
        );
    }

    #[test]
    fn test_quirks_apply_before_hashing() {
        let quirks = QuirksTable::from_toml(
            r#"
            [[quirk]]
            match_binary = { type = "Glob", pattern = "chromium*" }
            binary = "chromium"
            "#,
        )
        .unwrap();
        let resolver = IdentityResolver::new(quirks);

        let a = resolver.resolve(&StreamMetadata::new("Chromium", "chromium-browser")).unwrap();
        let b = resolver.resolve(&StreamMetadata::new("Chromium", "chromium")).unwrap();
        assert_eq!(a.identity, b.identity);
        assert_eq!(a.binary, "chromium");
    }

    #[test]
    fn test_quirk_can_complete_metadata() {
        let quirks = QuirksTable::from_toml(
            r#"
            [[quirk]]
            match_name = { type = "Exact", pattern = "WEBRTC VoiceEngine" }
            binary = "webrtc"
            "#,
        )
        .unwrap();
        let resolver = IdentityResolver::new(quirks);
        let meta = StreamMetadata {
            name: Some("WEBRTC VoiceEngine".to_string()),
            binary: None,
        };
        let resolved = resolver.resolve(&meta).unwrap();
        assert_eq!(resolved.binary, "webrtc");
    }
}
