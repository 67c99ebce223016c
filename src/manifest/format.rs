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

//! The line-oriented named-section format the manifest file is written in.
//!
//! ```text
//! # free-form preamble
//!
//! section_name:
//!   content line
//!   content line  # inline comment
//! ```
//!
//! Section names start with a letter or underscore and continue with
//! alphanumerics/underscores; bodies are indented by two spaces on output
//! and comments start with `#`. Parsing strips comments and indentation, so
//! serialize -> parse -> serialize is a fixed point for the content lines.

use crate::error::{Error, ErrorImpl};

use std::fmt;

/// The comment marker.
pub const COMMENT: char = '#';

/// One named section with its (unindented) content lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub content: String,
    /// Free-form text emitted as a comment block right above the section
    /// header. Never read back.
    pub preamble: String,
}

/// An ordered collection of uniquely-named sections.
#[derive(Debug, Clone, Default)]
pub struct ManifestFormat {
    preamble: String,
    sections: Vec<Section>,
}

fn is_valid_section_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn section_header(line: &str) -> Option<&str> {
    let name = line.strip_suffix(':')?;
    is_valid_section_name(name).then_some(name)
}

fn write_prefixed(f: &mut fmt::Formatter<'_>, prefix: &str, text: &str) -> fmt::Result {
    for line in text.lines() {
        writeln!(f, "{prefix}{line}")?;
    }
    Ok(())
}

impl ManifestFormat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_preamble(&mut self, preamble: impl Into<String>) {
        self.preamble = preamble.into();
    }

    /// Append a section. The name must be valid and not taken yet.
    pub fn add_section(&mut self, section: Section) -> Result<&mut Section, Error> {
        if !is_valid_section_name(&section.name) {
            return Err(ErrorImpl::InvalidManifest {
                description: format!("invalid section name: {:?}", section.name).into(),
            }
            .into());
        }
        if self.section(&section.name).is_some() {
            return Err(ErrorImpl::InvalidManifest {
                description: format!("section {:?} already exists", section.name).into(),
            }
            .into());
        }
        self.sections.push(section);
        Ok(self.sections.last_mut().expect("just pushed"))
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|section| section.name == name)
    }

    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter()
    }

    /// Parse the format back from text. Comments and blank lines vanish;
    /// content before any section header is an error.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let mut format = Self::new();
        let mut current: Option<usize> = None;

        for raw_line in input.lines() {
            let line = match raw_line.find(COMMENT) {
                Some(pos) => &raw_line[..pos],
                None => raw_line,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(name) = section_header(line) {
                format.add_section(Section {
                    name: name.to_string(),
                    ..Section::default()
                })?;
                current = Some(format.sections.len() - 1);
                continue;
            }

            let Some(index) = current else {
                return Err(ErrorImpl::InvalidManifest {
                    description: format!("content line before any section header: {line:?}")
                        .into(),
                }
                .into());
            };
            let content = &mut format.sections[index].content;
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str(line);
        }

        Ok(format)
    }
}

impl fmt::Display for ManifestFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.preamble.is_empty() {
            write_prefixed(f, "# ", &self.preamble)?;
            writeln!(f)?;
        }

        for section in &self.sections {
            if !section.preamble.is_empty() {
                write_prefixed(f, "# ", &section.preamble)?;
            }
            writeln!(f, "{}:", section.name)?;
            write_prefixed(f, "  ", &section.content)?;
            writeln!(f)?;
        }
        Ok(())
    }
}
