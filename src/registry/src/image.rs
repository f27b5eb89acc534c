//! Image request parsing.
//!
//! The packages contained in an image are encoded in the image name
//! itself: a pull of `shell/git/htop` yields an image containing those
//! packages. Leading meta-segments select the target architecture
//! (`arm64`) and expand convenience package sets (`shell`).

use serde::Serialize;

/// Packages expanded from the `shell` convenience name. These make an
/// image usable as an interactive environment.
const SHELL_PACKAGES: &[&str] = &["bashInteractive", "coreutils", "moreutils", "nano"];

/// Packages included in every image. Without CA certificates and protocol
/// databases most network-facing programs are useless.
const BASE_PACKAGES: &[&str] = &["cacert", "iana-etc"];

/// CPU architecture for which an image is built.
///
/// The default architecture is amd64; ARM support is toggled through the
/// `arm64` meta-segment in the image name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Amd64,
    Arm64,
}

impl Architecture {
    /// System tuple passed to the resolver.
    pub fn nix_system(&self) -> &'static str {
        match self {
            Architecture::Amd64 => "x86_64-linux",
            Architecture::Arm64 => "aarch64-linux",
        }
    }

    /// Architecture name as used in OCI manifests.
    pub fn image_arch(&self) -> &'static str {
        match self {
            Architecture::Amd64 => "amd64",
            Architecture::Arm64 => "arm64",
        }
    }
}

/// A parsed image request.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    /// Canonical image name: the requested segments, sorted. Sorting
    /// avoids cache-busting images when only the segment order differs.
    pub name: String,

    /// Image tag
    pub tag: String,

    /// Packages to include, sorted and deduplicated. These correspond to
    /// top-level attribute names in the package set.
    pub packages: Vec<String>,

    /// Architecture for which to build the image
    pub arch: Architecture,
}

impl Image {
    /// Parse an image name into the corresponding request structure.
    ///
    /// Meta-segments are consumed from the front of the name: `arm64`
    /// switches the target architecture, and `shell` pulls in a set of
    /// common interactive tools. Every image additionally receives the
    /// base packages.
    pub fn from_name(name: &str, tag: &str) -> Image {
        let segments: Vec<&str> = name.split('/').filter(|s| !s.is_empty()).collect();

        let mut rest: &[&str] = &segments;
        let mut arch = Architecture::Amd64;
        if rest.first() == Some(&"arm64") {
            arch = Architecture::Arm64;
            rest = &rest[1..];
        }

        let mut packages: Vec<String> = match rest.first() {
            Some(&"shell") => rest[1..]
                .iter()
                .map(|s| s.to_string())
                .chain(SHELL_PACKAGES.iter().map(|s| s.to_string()))
                .collect(),
            _ => rest.iter().map(|s| s.to_string()).collect(),
        };

        packages.extend(BASE_PACKAGES.iter().map(|s| s.to_string()));
        packages.sort();
        packages.dedup();

        let mut sorted = segments;
        sorted.sort_unstable();

        Image {
            name: sorted.join("/"),
            tag: tag.to_string(),
            packages,
            arch,
        }
    }
}
