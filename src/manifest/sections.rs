// SPDX-License-Identifier: MPL-2.0
/*
 * replicar: trace R computations into a reproducible container manifest
 * Copyright (C) 2024-2026 The replicar authors
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

#![forbid(unsafe_code)]

//! Codecs between the typed [`Manifest`] and the sections of its text form.
//!
//! Only the `copy` section is consumed when a reviewed manifest is read
//! back; the package and symlink sections are regenerated from the typed
//! manifest each time.

use crate::{
    error::Error,
    manifest::{
        format::{ManifestFormat, Section},
        FileStatus, Manifest,
    },
    rpkg::Repository,
};

use std::fmt::Write;
use std::path::PathBuf;

use itertools::Itertools;
use tracing::{debug, warn};

pub(crate) const COPY_SECTION: &str = "copy";
const DEB_SECTION: &str = "deb";
const RPKG_SECTION: &str = "rpkg";
const SYMLINK_SECTION: &str = "symlink";

fn copy_section(manifest: &Manifest) -> Option<Section> {
    if manifest.copy_files.is_empty() {
        return None;
    }

    let preamble = format!(
        "The following {} files have not been resolved.\n\
         # - ignores the file.\n\
         C - marks the file to be copied into the image.\n\
         R - marks the file as a result file.",
        manifest.copy_files.len()
    );

    let mut content = String::new();
    for (path, status) in manifest.copy_files.iter().sorted_by(|a, b| a.0.cmp(b.0)) {
        match status {
            FileStatus::Copy => writeln!(content, "C {}", path.display()),
            FileStatus::Result => writeln!(content, "R {}", path.display()),
            // Nothing we can do about those.
            FileStatus::IgnoreNoLongerExist => Ok(()),
            status => writeln!(content, "# {} # {}", path.display(), status),
        }
        .expect("writing to a String cannot fail");
    }

    Some(Section {
        name: COPY_SECTION.to_string(),
        content,
        preamble,
    })
}

/// Re-read the (possibly user-edited) copy section. `C`/`R` lines replace
/// the previous copy set; anything else warns and is dropped.
fn load_copy_section(content: &str, manifest: &mut Manifest) {
    manifest.copy_files.clear();

    for line in content.lines() {
        let status = if line.starts_with('C') {
            FileStatus::Copy
        } else if line.starts_with('R') {
            FileStatus::Result
        } else {
            warn!(line, "invalid manifest line");
            continue;
        };

        let mut path = line[1..].trim();
        if path.starts_with('"') {
            match path.strip_prefix('"').and_then(|p| p.strip_suffix('"')) {
                Some(stripped) => path = stripped,
                None => {
                    warn!(line, "invalid path in manifest line");
                    continue;
                }
            }
        }

        manifest.copy_files.insert(PathBuf::from(path), status);
    }
}

fn deb_section(manifest: &Manifest) -> Option<Section> {
    if manifest.deb_packages.is_empty() {
        return None;
    }
    let content = manifest
        .deb_packages
        .values()
        .map(|pkg| format!("I {} {}", pkg.full_name(), pkg.version))
        .join("\n");
    Some(Section {
        name: DEB_SECTION.to_string(),
        content,
        preamble: "System packages installed into the image.".to_string(),
    })
}

fn rpkg_section(manifest: &Manifest) -> Option<Section> {
    // Base packages ship with the interpreter itself.
    let lines: Vec<String> = manifest
        .r_packages
        .values()
        .filter(|pkg| !pkg.is_base)
        .map(|pkg| match &pkg.repository {
            Repository::Cran => format!("I cran {}", pkg.name),
            Repository::GitHub { org, repo, reference } => {
                format!("I github {org}/{repo}@{reference}")
            }
        })
        .sorted()
        .collect();
    if lines.is_empty() {
        return None;
    }
    Some(Section {
        name: RPKG_SECTION.to_string(),
        content: lines.join("\n"),
        preamble: "R packages installed into the image.".to_string(),
    })
}

fn symlink_section(manifest: &Manifest) -> Option<Section> {
    if manifest.symlinks.is_empty() {
        return None;
    }
    let content = manifest
        .symlinks
        .iter()
        .map(|(link, target)| format!("L {} -> {}", link.display(), target.display()))
        .join("\n");
    Some(Section {
        name: SYMLINK_SECTION.to_string(),
        content,
        preamble: "Symlinks recreated in the image.".to_string(),
    })
}

/// Serialize `manifest` to its reviewable text form.
pub fn save_manifest(manifest: &Manifest) -> Result<String, Error> {
    let mut format = ManifestFormat::new();
    format.set_preamble(
        "This is the manifest file generated by replicar.\n\
         You can update its content by either adding or removing/commenting\n\
         lines in the corresponding sections.",
    );

    for section in [
        copy_section(manifest),
        deb_section(manifest),
        rpkg_section(manifest),
        symlink_section(manifest),
    ]
    .into_iter()
    .flatten()
    {
        format.add_section(section)?;
    }

    Ok(format.to_string())
}

/// Parse a manifest file and fold the reviewable sections back into
/// `manifest`. Unknown sections are left alone.
pub fn load_manifest(manifest: &mut Manifest, input: &str) -> Result<(), Error> {
    let format = ManifestFormat::parse(input)?;
    for section in format.sections() {
        match section.name.as_str() {
            COPY_SECTION => load_copy_section(&section.content, manifest),
            name => debug!(section = name, "section is not re-read"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dpkg::DebPackage;
    use crate::rpkg::RPackage;

    use std::sync::Arc;

    use anyhow::Error;
    use pretty_assertions::assert_eq;

    fn manifest_with_files(files: &[(&str, FileStatus)]) -> Manifest {
        let mut manifest = Manifest::default();
        for (path, status) in files {
            manifest.copy_files.insert(PathBuf::from(path), *status);
        }
        manifest
    }

    fn rpkg(name: &str, is_base: bool, repository: Repository) -> Arc<RPackage> {
        Arc::new(RPackage {
            name: name.to_string(),
            lib_path: PathBuf::from("/usr/lib/R/library"),
            version: "1.0".to_string(),
            depends: Vec::new(),
            imports: Vec::new(),
            linking_to: Vec::new(),
            is_base,
            needs_compilation: false,
            repository,
        })
    }

    #[test]
    fn copy_section_renders_sorted_statuses() {
        let manifest = manifest_with_files(&[
            ("/path/copy", FileStatus::Copy),
            ("/path/result", FileStatus::Result),
            ("/path/gone", FileStatus::IgnoreNoLongerExist),
            ("/path/dir", FileStatus::IgnoreIsDirectory),
        ]);

        let section = copy_section(&manifest).expect("non-empty copy section");
        let lines: Vec<&str> = section.content.lines().collect();
        assert_eq!(
            lines,
            vec![
                "C /path/copy",
                "# /path/dir # Ignore, it is a directory",
                "R /path/result",
            ],
            "sorted; no-longer-existing files are omitted entirely"
        );
    }

    #[test]
    fn copy_section_loads_valid_lines() {
        let mut manifest = manifest_with_files(&[("/stale", FileStatus::Copy)]);
        load_copy_section("C /path/one\nR /path/two", &mut manifest);

        assert_eq!(manifest.copy_files.len(), 2, "previous content is replaced");
        assert_eq!(
            manifest.copy_files[&PathBuf::from("/path/one")],
            FileStatus::Copy
        );
        assert_eq!(
            manifest.copy_files[&PathBuf::from("/path/two")],
            FileStatus::Result
        );
    }

    #[test]
    fn copy_section_loads_quoted_paths() {
        let mut manifest = Manifest::default();
        load_copy_section("C \" /path/with spaces \"", &mut manifest);
        assert_eq!(
            manifest.copy_files[&PathBuf::from(" /path/with spaces ")],
            FileStatus::Copy
        );
    }

    #[test]
    fn copy_section_drops_invalid_lines() {
        let mut manifest = Manifest::default();
        load_copy_section("XYZ /path/ignored\nC \"/missing/closing", &mut manifest);
        assert!(manifest.copy_files.is_empty());
    }

    #[test]
    fn round_trip_is_fixed_point_for_copy_lines() -> Result<(), Error> {
        let mut manifest = manifest_with_files(&[
            ("/path/copy", FileStatus::Copy),
            ("/path/result", FileStatus::Result),
        ]);

        let first = save_manifest(&manifest)?;
        load_manifest(&mut manifest, &first)?;
        let second = save_manifest(&manifest)?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn deb_section_lines() {
        let mut manifest = Manifest::default();
        manifest.deb_packages.insert(
            "libjson-c5:amd64".to_string(),
            Arc::new(DebPackage {
                name: "libjson-c5".to_string(),
                version: "0.17-1build1".to_string(),
                arch: Some("amd64".to_string()),
                in_source_list: true,
            }),
        );

        let section = deb_section(&manifest).expect("non-empty deb section");
        assert_eq!(section.content, "I libjson-c5:amd64 0.17-1build1");
    }

    #[test]
    fn rpkg_section_lines() {
        let mut manifest = Manifest::default();
        manifest
            .r_packages
            .insert("testpkg".to_string(), rpkg("testpkg", false, Repository::Cran));
        manifest.r_packages.insert(
            "rlang".to_string(),
            rpkg(
                "rlang",
                false,
                Repository::GitHub {
                    org: "org".to_string(),
                    repo: "name".to_string(),
                    reference: "ref".to_string(),
                },
            ),
        );
        manifest
            .r_packages
            .insert("tools".to_string(), rpkg("tools", true, Repository::Cran));

        let section = rpkg_section(&manifest).expect("non-empty rpkg section");
        let lines: Vec<&str> = section.content.lines().collect();
        assert_eq!(
            lines,
            vec!["I cran testpkg", "I github org/name@ref"],
            "base packages are not listed"
        );
    }

    #[test]
    fn symlink_section_lines() {
        let mut manifest = Manifest::default();
        manifest
            .symlinks
            .insert(PathBuf::from("/lib"), PathBuf::from("/usr/lib"));
        let section = symlink_section(&manifest).expect("non-empty symlink section");
        assert_eq!(section.content, "L /lib -> /usr/lib");
    }

    #[test]
    fn empty_manifest_has_no_sections() -> Result<(), Error> {
        let text = save_manifest(&Manifest::default())?;
        let format = ManifestFormat::parse(&text)?;
        assert_eq!(format.sections().count(), 0);
        Ok(())
    }
}
