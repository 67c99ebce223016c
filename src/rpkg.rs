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

//! The R package database.
//!
//! The database is built by asking the R interpreter itself to dump
//! `installed.packages()`. Rows are delimited with U+00A0 (a non-breaking
//! space): commas, spaces and parentheses all appear inside dependency
//! fields, so an ASCII delimiter would be ambiguous. The same stream format
//! doubles as the on-disk cache format.

use crate::{
    error::{Error, ErrorExt, ErrorImpl},
    process,
    trie::PathTrie,
};

use std::{
    collections::{HashMap, HashSet},
    fmt,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use itertools::Itertools;
use static_assertions::const_assert;
use tracing::{debug, warn};

/// Field delimiter of the interpreter dump and the cache file.
pub(crate) const FIELD_DELIM: char = '\u{a0}';
// The whole point of the delimiter is to never collide with the ASCII
// characters that occur inside dependency fields.
const_assert!(!FIELD_DELIM.is_ascii());

/// Columns requested from `installed.packages()`, in order.
const FIELD_COUNT: usize = 12;

/// The one-shot expression handed to `R -s -q -e`. Newlines inside fields
/// are squashed so each package stays on one line.
const R_DUMP_EXPR: &str = "write.table(gsub(\"\\n\", \" \", installed.packages()[, \
     c(\"Package\", \"LibPath\", \"Version\", \"Depends\", \"Imports\", \"LinkingTo\", \
     \"Priority\", \"NeedsCompilation\", \"RemoteType\", \"RemoteUsername\", \"RemoteRepo\", \
     \"RemoteRef\")]), sep=\"\\u00a0\", quote=FALSE, row.names=FALSE, col.names=FALSE)";

/// Where an R package can be re-fetched from when replaying.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Repository {
    /// The default registry (CRAN or a CRAN-like mirror).
    Cran,
    /// Installed from source control, e.g. via `remotes::install_github`.
    GitHub {
        org: String,
        repo: String,
        reference: String,
    },
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cran => write!(f, "cran"),
            Self::GitHub { org, repo, reference } => {
                write!(f, "github {org}/{repo}@{reference}")
            }
        }
    }
}

/// One installed R package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RPackage {
    pub name: String,
    /// The library directory the package is installed under; files below
    /// `lib_path/name` belong to it.
    pub lib_path: PathBuf,
    pub version: String,
    pub depends: Vec<String>,
    pub imports: Vec<String>,
    pub linking_to: Vec<String>,
    /// Base packages ship with the interpreter and are never reinstalled.
    pub is_base: bool,
    pub needs_compilation: bool,
    pub repository: Repository,
}

impl RPackage {
    /// All declared dependencies, in declaration order.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.depends
            .iter()
            .chain(&self.imports)
            .chain(&self.linking_to)
            .map(String::as_str)
    }

    /// The directory holding the package's installed files.
    pub fn install_dir(&self) -> PathBuf {
        self.lib_path.join(&self.name)
    }
}

/// Parse one comma-separated dependency field, stripping version constraints
/// (`"sys (>= 2.1)"` -> `"sys"`) and dropping the pseudo-dependency on the
/// language itself.
fn parse_dependency_field(field: &str) -> Vec<String> {
    if field == "NA" {
        return Vec::new();
    }
    field
        .split(',')
        .map(|item| {
            item.trim()
                .chars()
                .take_while(|c| *c != '(' && !c.is_whitespace())
                .collect::<String>()
        })
        .filter(|name| !name.is_empty() && name != "R")
        .collect()
}

fn non_na(field: &str) -> Option<&str> {
    (field != "NA" && !field.is_empty()).then_some(field)
}

fn parse_package_line(line: &str) -> Option<RPackage> {
    let fields: Vec<&str> = line.split(FIELD_DELIM).map(str::trim).collect();
    if fields.len() != FIELD_COUNT {
        warn!(line, "unable to parse installed.packages() output line");
        return None;
    }

    let repository = match non_na(fields[8]) {
        Some("github") => Repository::GitHub {
            org: non_na(fields[9]).unwrap_or_default().to_string(),
            repo: non_na(fields[10]).unwrap_or_default().to_string(),
            reference: non_na(fields[11]).unwrap_or_default().to_string(),
        },
        _ => Repository::Cran,
    };

    Some(RPackage {
        name: fields[0].to_string(),
        lib_path: PathBuf::from(fields[1]),
        version: fields[2].to_string(),
        depends: parse_dependency_field(fields[3]),
        imports: parse_dependency_field(fields[4]),
        linking_to: parse_dependency_field(fields[5]),
        is_base: fields[6] == "base",
        needs_compilation: fields[7] == "yes",
        repository,
    })
}

/// Installed R packages, indexed by name and by library path.
#[derive(Debug)]
pub struct RpkgDatabase {
    packages: HashMap<String, Arc<RPackage>>,
    files: PathTrie<Arc<RPackage>>,
}

impl RpkgDatabase {
    /// Build the database by running the interpreter at `r_bin`.
    pub fn from_interpreter(r_bin: &Path) -> Result<Self, Error> {
        let output = process::capture_stdout(r_bin, ["-s", "-q", "-e", R_DUMP_EXPR])
            .wrap("load the R package database")?;
        Ok(Self::from_str(&output))
    }

    /// Parse a database from the U+00A0-delimited stream format (the
    /// interpreter dump, or a cache written by [`Self::save_cache`]).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(input: &str) -> Self {
        let mut packages = HashMap::new();
        for line in input.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(pkg) = parse_package_line(line) {
                packages.insert(pkg.name.clone(), Arc::new(pkg));
            }
        }

        let mut files = PathTrie::new();
        for pkg in packages.values() {
            files.insert(pkg.install_dir(), Arc::clone(pkg));
        }

        debug!(packages = packages.len(), "loaded R package database");
        Self { packages, files }
    }

    /// Write the database back out in the stream format it was parsed from.
    pub fn save_cache(&self, mut out: impl Write) -> Result<(), Error> {
        let fmt_deps = |deps: &[String]| -> String {
            if deps.is_empty() {
                "NA".to_string()
            } else {
                deps.join(", ")
            }
        };

        for pkg in self.packages.values().sorted_by(|a, b| a.name.cmp(&b.name)) {
            let (remote_type, org, repo, reference) = match &pkg.repository {
                Repository::Cran => ("NA", "NA", "NA", "NA"),
                Repository::GitHub { org, repo, reference } => {
                    ("github", org.as_str(), repo.as_str(), reference.as_str())
                }
            };
            let lib_path = pkg.lib_path.to_string_lossy();
            let (depends, imports, linking_to) = (
                fmt_deps(&pkg.depends),
                fmt_deps(&pkg.imports),
                fmt_deps(&pkg.linking_to),
            );
            let fields: [&str; FIELD_COUNT] = [
                &pkg.name,
                &lib_path,
                &pkg.version,
                &depends,
                &imports,
                &linking_to,
                if pkg.is_base { "base" } else { "NA" },
                if pkg.needs_compilation { "yes" } else { "NA" },
                remote_type,
                org,
                repo,
                reference,
            ];
            let line = fields.iter().join(&FIELD_DELIM.to_string());
            writeln!(out, "{line}").map_err(|err| ErrorImpl::OsError {
                operation: "write R package cache".into(),
                source: err,
            })?;
        }
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<&Arc<RPackage>> {
        self.packages.get(name)
    }

    /// The package owning `path`: the deepest package install directory that
    /// is a prefix of `path`.
    pub fn lookup_by_path(&self, path: &Path) -> Option<&Arc<RPackage>> {
        self.files.find_longest_prefix(path)
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// All transitive dependencies of `seeds` (the seeds included), in a
    /// topological order: every package comes after its dependencies. Names
    /// absent from the database are skipped; a dependency cycle fails the
    /// query with [`crate::error::ErrorKind::CycleDetected`].
    pub fn topo_order<'a>(
        &self,
        seeds: impl IntoIterator<Item = &'a str>,
    ) -> Result<Vec<Arc<RPackage>>, Error> {
        let mut visited = HashSet::new();
        let mut in_stack = HashSet::new();
        let mut ordered = Vec::new();

        for seed in seeds {
            if !visited.contains(seed) {
                self.visit(seed, &mut visited, &mut in_stack, &mut ordered)?;
            }
        }
        Ok(ordered)
    }

    // Post-order DFS; a node already on the current stack is a cycle.
    fn visit(
        &self,
        name: &str,
        visited: &mut HashSet<String>,
        in_stack: &mut HashSet<String>,
        ordered: &mut Vec<Arc<RPackage>>,
    ) -> Result<(), Error> {
        visited.insert(name.to_string());
        let Some(pkg) = self.packages.get(name) else {
            return Ok(());
        };
        in_stack.insert(name.to_string());

        for dep in pkg.dependencies() {
            if !visited.contains(dep) {
                self.visit(dep, visited, in_stack, ordered)?;
            } else if in_stack.contains(dep) {
                return Err(ErrorImpl::CycleDetected {
                    name: dep.to_string(),
                }
                .into());
            }
        }

        in_stack.remove(name);
        ordered.push(Arc::clone(pkg));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    use anyhow::Error;
    use pretty_assertions::assert_eq;

    // Build one NBSP-delimited row in the installed.packages() dump format.
    pub(crate) fn dump_row(fields: [&str; FIELD_COUNT]) -> String {
        fields.iter().join(&FIELD_DELIM.to_string())
    }

    fn simple_row(name: &str, lib: &str, version: &str, depends: &str) -> String {
        dump_row([
            name, lib, version, depends, "NA", "NA", "NA", "NA", "NA", "NA", "NA", "NA",
        ])
    }

    fn basic_db() -> RpkgDatabase {
        let lib = "/home/user/R/library/4.1";
        let input = [
            dump_row([
                "askpass", lib, "1.1", "NA", "sys (>= 2.1)", "NA", "NA", "yes", "NA", "NA",
                "NA", "NA",
            ]),
            dump_row([
                "backports", lib, "1.4.1", "R (>= 3.0.0)", "NA", "NA", "NA", "NA", "NA", "NA",
                "NA", "NA",
            ]),
            dump_row([
                "bslib",
                lib,
                "0.4.2",
                "R (>= 2.10)",
                "htmltools (>= 0.5.4), jsonlite, sass (>= 0.4.0),jquerylib (>= 0.1.3)",
                "NA",
                "NA",
                "NA",
                "NA",
                "NA",
                "NA",
                "NA",
            ]),
            dump_row([
                "tools", "/usr/lib/R/library", "4.1.2", "NA", "NA", "NA", "base", "NA", "NA",
                "NA", "NA", "NA",
            ]),
            dump_row([
                "rlang", "/usr/lib/R/library", "0.0.1", "NA", "NA", "NA", "NA", "yes",
                "github", "r-lib", "rlang", "123",
            ]),
        ]
        .join("\n");
        RpkgDatabase::from_str(&input)
    }

    #[test]
    fn basic_parsing() {
        let db = basic_db();
        assert_eq!(db.len(), 5);

        let askpass = db.find("askpass").expect("askpass parsed");
        assert_eq!(askpass.name, "askpass");
        assert_eq!(askpass.lib_path, PathBuf::from("/home/user/R/library/4.1"));
        assert_eq!(askpass.version, "1.1");
        assert_eq!(askpass.imports, vec!["sys"]);
        assert!(askpass.depends.is_empty());
        assert!(!askpass.is_base);
        assert!(askpass.needs_compilation);
        assert_eq!(askpass.repository, Repository::Cran);

        // "R (>= 3.0.0)" names the language, not a package.
        let backports = db.find("backports").expect("backports parsed");
        assert_eq!(backports.dependencies().count(), 0);

        let bslib = db.find("bslib").expect("bslib parsed");
        assert_eq!(
            bslib.imports,
            vec!["htmltools", "jsonlite", "sass", "jquerylib"]
        );

        let tools = db.find("tools").expect("tools parsed");
        assert!(tools.is_base);

        let rlang = db.find("rlang").expect("rlang parsed");
        assert_eq!(
            rlang.repository,
            Repository::GitHub {
                org: "r-lib".to_string(),
                repo: "rlang".to_string(),
                reference: "123".to_string(),
            }
        );
    }

    #[test]
    fn dependency_field_grammar() {
        assert_eq!(
            parse_dependency_field("R (>= 3.0.0), sys, htmltools (>= 0.5)"),
            vec!["sys", "htmltools"]
        );
        assert_eq!(parse_dependency_field("NA"), Vec::<String>::new());
        assert_eq!(parse_dependency_field(""), Vec::<String>::new());
        assert_eq!(parse_dependency_field("sys(>=2.1),  methods "), vec!["sys", "methods"]);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let input = format!(
            "garbage-line-without-delimiters\n{}\n",
            simple_row("ok", "/lib/R", "1.0", "NA")
        );
        let db = RpkgDatabase::from_str(&input);
        assert_eq!(db.len(), 1);
        assert!(db.find("ok").is_some());
    }

    #[test]
    fn path_lookup_uses_longest_prefix() {
        let db = basic_db();
        let hit = db
            .lookup_by_path(Path::new("/home/user/R/library/4.1/bslib/R/bslib.rdb"))
            .expect("file under the package dir resolves");
        assert_eq!(hit.name, "bslib");
        assert_eq!(
            db.lookup_by_path(Path::new("/home/user/R/library/4.1")),
            None,
            "the library dir itself belongs to no package"
        );
        assert_eq!(db.lookup_by_path(Path::new("/usr/share/doc/x")), None);
    }

    #[test]
    fn topological_order() -> Result<(), Error> {
        // A depends on B, B depends on C, D has no dependencies.
        let lib = "/home/user/R/library/4.1";
        let input = [
            simple_row("A", lib, "1.0", "B"),
            simple_row("B", lib, "1.1", "C"),
            simple_row("C", lib, "1.2", "NA"),
            simple_row("D", lib, "1.2", "NA"),
        ]
        .join("\n");
        let db = RpkgDatabase::from_str(&input);

        let names = |pkgs: Vec<Arc<RPackage>>| -> Vec<String> {
            pkgs.into_iter().map(|pkg| pkg.name.clone()).collect()
        };

        assert_eq!(names(db.topo_order(["A"])?), vec!["C", "B", "A"]);
        assert_eq!(names(db.topo_order(["D"])?), vec!["D"]);

        let both = names(db.topo_order(["A", "D"])?);
        assert_eq!(both.len(), 4);
        let pos = |name: &str| both.iter().position(|n| n == name).expect("present");
        assert!(pos("C") < pos("B"));
        assert!(pos("B") < pos("A"));
        Ok(())
    }

    #[test]
    fn unknown_names_are_skipped() -> Result<(), Error> {
        let db = RpkgDatabase::from_str(&simple_row(
            "A",
            "/home/user/R/library/4.1",
            "1.0",
            "missing-dep",
        ));
        let order = db.topo_order(["A", "not-installed"])?;
        assert_eq!(order.len(), 1);
        assert_eq!(order[0].name, "A");
        Ok(())
    }

    #[test]
    fn cycles_are_fatal_for_the_query() {
        let lib = "/home/user/R/library/4.1";
        let input = [
            simple_row("A", lib, "1.0", "B"),
            simple_row("B", lib, "1.0", "A"),
        ]
        .join("\n");
        let db = RpkgDatabase::from_str(&input);

        let err = db.topo_order(["A"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CycleDetected);
    }

    #[test]
    fn cache_round_trip() -> Result<(), Error> {
        let db = basic_db();
        let mut cache = Vec::new();
        db.save_cache(&mut cache)?;

        let reloaded = RpkgDatabase::from_str(std::str::from_utf8(&cache)?);
        assert_eq!(reloaded.len(), db.len());
        for (name, pkg) in &db.packages {
            let other = reloaded.find(name).expect("package survives the round trip");
            assert_eq!(other.as_ref(), pkg.as_ref());
        }
        Ok(())
    }
}
