// Copyright 2016 Mozilla Foundation
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The catalog of shippable compile environments declared in
//! `$ICECC_VERSION`.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use fs_err as fs;
use log::{error, warn};

use crate::errors::*;

/// `(platform, value)` pairs; the value is an archive path after parsing and
/// a version identifier after [`rip_out_paths`].
pub type Environments = Vec<(String, String)>;

/// Archive suffixes accepted for a compile environment, in match order.
const ARCHIVE_SUFFIXES: &[&str] = &[".tar.bz2", ".tar.gz", ".tar", ".tgz"];

/// An environment entry smaller than this cannot be a usable toolchain
/// archive and is rejected outright.
const MIN_ARCHIVE_SIZE: u64 = 500;

/// Parse the `$ICECC_VERSION` value for the current target platform and
/// selection prefix.
///
/// The string is a comma-delimited list of `plat:archive[=prefix]` items.
/// A missing `plat:` defaults to `target_platform`. If any item carries an
/// `=prefix` tag the whole catalog is in tagged mode: untagged items are
/// dropped whenever `prefix` is non-empty, and tagged items survive only when
/// their tag equals `prefix`. Unreadable, non-regular (by a stat that does
/// not follow symlinks) or undersized archives are rejected with a logged
/// error; for duplicate platforms the first accepted entry wins.
pub fn parse_icecc_version(raw: &str, target_platform: &str, prefix: &str) -> Environments {
    let mut envs = Environments::new();
    let def_targets = raw.contains('=');

    for couple in raw.split(',') {
        if couple.is_empty() {
            continue;
        }

        let (platform, mut version) = match couple.split_once(':') {
            Some((p, v)) => (p.to_owned(), v.to_owned()),
            None => (target_platform.to_owned(), couple.to_owned()),
        };

        if def_targets {
            match version.split_once('=') {
                Some((v, tag)) => {
                    if tag != prefix {
                        continue;
                    }
                    version = v.to_owned();
                }
                None => {
                    if !prefix.is_empty() {
                        continue;
                    }
                }
            }
        }

        if envs.iter().any(|(p, _)| *p == platform) {
            error!(
                "there are two environments for platform {} - ignoring {}",
                platform, version
            );
            continue;
        }

        if fs::File::open(&version).is_err() {
            error!(
                "$ICECC_VERSION has to point to an existing file to be installed {}",
                version
            );
            continue;
        }

        match fs::symlink_metadata(&version) {
            Ok(st) if st.is_file() && st.len() >= MIN_ARCHIVE_SIZE => {}
            _ => {
                error!(
                    "$ICECC_VERSION has to point to an existing file to be installed {}",
                    version
                );
                continue;
            }
        }

        envs.push((platform, version));
    }

    envs
}

/// Parse the catalog from the `ICECC_VERSION` environment variable.
pub fn environments_from_env(target_platform: &str, prefix: &str) -> Result<Environments> {
    let raw = env::var("ICECC_VERSION").context("missing $ICECC_VERSION")?;
    Ok(parse_icecc_version(&raw, target_platform, prefix))
}

/// The catalog after archive suffixes have been ripped: the filtered
/// `(platform, version-id)` list sent to the scheduler, plus the two lookup
/// maps derived from it. All three share the same platform key set.
#[derive(Debug, Default)]
pub struct EnvCatalog {
    /// `(platform, version-id)` in acceptance order; this is the wire form.
    pub envs: Environments,
    version: HashMap<String, String>,
    versionfile: HashMap<String, PathBuf>,
}

impl EnvCatalog {
    pub fn is_empty(&self) -> bool {
        self.envs.is_empty()
    }

    /// The stable version identifier exchanged over the wire for `platform`.
    pub fn version(&self, platform: &str) -> Option<&str> {
        self.version.get(platform).map(|s| s.as_str())
    }

    /// The on-disk archive for `platform`.
    pub fn version_file(&self, platform: &str) -> Option<&Path> {
        self.versionfile.get(platform).map(|p| p.as_path())
    }
}

/// Strip the archive suffix from every entry, producing the version-id
/// catalog and its lookup maps. Entries whose path ends in no recognized
/// suffix are silently dropped.
pub fn rip_out_paths(envs: &Environments) -> EnvCatalog {
    let mut catalog = EnvCatalog::default();

    for (platform, path) in envs {
        let Some(stripped) = ARCHIVE_SUFFIXES
            .iter()
            .find_map(|suff| path.strip_suffix(suff))
        else {
            continue;
        };
        let version = Path::new(stripped)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        catalog
            .versionfile
            .insert(platform.clone(), PathBuf::from(path));
        catalog.version.insert(platform.clone(), version.clone());
        catalog.envs.push((platform.clone(), version));
    }

    catalog
}

/// Rip the catalog, failing with the no-environments error if nothing
/// survives.
pub fn usable_catalog(envs: &Environments) -> Result<EnvCatalog> {
    let catalog = rip_out_paths(envs);
    if catalog.is_empty() {
        warn!("$ICECC_VERSION needs to point to .tar files");
        bail!("$ICECC_VERSION needs to point to .tar files");
    }
    Ok(catalog)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn mk_archive(dir: &TempDir, name: &str, size: usize) -> String {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&vec![0u8; size]).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_parse_two_platforms() {
        let dir = TempDir::new().unwrap();
        let a = mk_archive(&dir, "a.tar.gz", 600);
        let b = mk_archive(&dir, "b.tar.bz2", 600);
        let raw = format!("i386:{},x86_64:{}", a, b);
        let envs = parse_icecc_version(&raw, "x86_64", "");
        assert_eq!(
            envs,
            vec![("i386".to_owned(), a), ("x86_64".to_owned(), b)]
        );
    }

    #[test]
    fn test_parse_default_platform() {
        let dir = TempDir::new().unwrap();
        let a = mk_archive(&dir, "a.tar.gz", 600);
        let envs = parse_icecc_version(&a, "x86_64", "");
        assert_eq!(envs, vec![("x86_64".to_owned(), a)]);
    }

    #[test]
    fn test_parse_duplicate_platform_keeps_first() {
        let dir = TempDir::new().unwrap();
        let a = mk_archive(&dir, "a.tar.gz", 600);
        let b = mk_archive(&dir, "b.tar.gz", 600);
        let raw = format!("x86_64:{},x86_64:{}", a, b);
        let envs = parse_icecc_version(&raw, "x86_64", "");
        assert_eq!(envs, vec![("x86_64".to_owned(), a)]);
    }

    #[test]
    fn test_parse_rejects_small_and_missing() {
        let dir = TempDir::new().unwrap();
        let small = mk_archive(&dir, "small.tar.gz", 100);
        let raw = format!("{},/nonexistent/x.tar.gz", small);
        assert!(parse_icecc_version(&raw, "x86_64", "").is_empty());
    }

    #[test]
    fn test_parse_skips_empty_items() {
        let dir = TempDir::new().unwrap();
        let a = mk_archive(&dir, "a.tar.gz", 600);
        let raw = format!(",{},,", a);
        assert_eq!(parse_icecc_version(&raw, "x86_64", "").len(), 1);
    }

    #[test]
    fn test_tagged_mode_empty_prefix_drops_tagged() {
        let dir = TempDir::new().unwrap();
        let a = mk_archive(&dir, "a.tar.gz", 600);
        let raw = format!("x86_64:{}=alt", a);
        assert!(parse_icecc_version(&raw, "x86_64", "").is_empty());
    }

    #[test]
    fn test_tagged_mode_matching_prefix_strips_tag() {
        let dir = TempDir::new().unwrap();
        let a = mk_archive(&dir, "a.tar.gz", 600);
        let b = mk_archive(&dir, "b.tar.gz", 600);
        // In tagged mode the untagged `b` entry is dropped because a
        // non-empty prefix was selected.
        let raw = format!("x86_64:{}=alt,i386:{}", a, b);
        let envs = parse_icecc_version(&raw, "x86_64", "alt");
        assert_eq!(envs, vec![("x86_64".to_owned(), a)]);
    }

    #[test]
    fn test_rip_out_paths_versions_and_maps() {
        let dir = TempDir::new().unwrap();
        let a = mk_archive(&dir, "gcc-13.tar.gz", 600);
        let b = mk_archive(&dir, "clang.tar.bz2", 600);
        let envs = vec![
            ("i386".to_owned(), a.clone()),
            ("x86_64".to_owned(), b.clone()),
            ("arm".to_owned(), "/tmp/not-an-archive.zip".to_owned()),
        ];
        let catalog = rip_out_paths(&envs);
        assert_eq!(
            catalog.envs,
            vec![
                ("i386".to_owned(), "gcc-13".to_owned()),
                ("x86_64".to_owned(), "clang".to_owned()),
            ]
        );
        assert_eq!(catalog.version("i386"), Some("gcc-13"));
        assert_eq!(catalog.version_file("i386"), Some(Path::new(a.as_str())));
        assert_eq!(catalog.version("x86_64"), Some("clang"));
        assert_eq!(catalog.version_file("x86_64"), Some(Path::new(b.as_str())));
        assert_eq!(catalog.version("arm"), None);
        assert_eq!(catalog.version_file("arm"), None);
    }

    #[test]
    fn test_rip_out_paths_suffix_order() {
        // `.tar.gz` must match before the bare `.tar` suffix.
        let envs = vec![("p".to_owned(), "/x/base.tar.gz".to_owned())];
        let dirless = rip_out_paths(&envs);
        assert_eq!(dirless.version("p"), Some("base"));
    }

    #[test]
    fn test_usable_catalog_empty_is_fatal() {
        let envs = vec![("p".to_owned(), "/x/base.zip".to_owned())];
        assert!(usable_catalog(&envs).is_err());
    }
}
