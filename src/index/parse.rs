// SPDX-FileCopyrightText: Copyright © 2024 ReaPack Authors
//
// SPDX-License-Identifier: MPL-2.0

//! Parses the `<index>` XML document a remote serves. Unknown elements and
//! attributes are ignored; an unknown `platform` value disqualifies just
//! that one `<source>`, not the whole version.

use std::str::FromStr;

use quick_xml::events::Event;
use quick_xml::reader::Reader;
use thiserror::Error;
use url::Url;

use super::{Category, Index, Package, PackageType, Platform, Source, Version};
use crate::path::RelPath;
use crate::version::VersionName;

pub fn parse(xml: &[u8]) -> Result<Index, Error> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut index_name = String::new();
    let mut categories = Vec::new();

    let mut category: Option<Category> = None;
    let mut package: Option<Package> = None;
    let mut version: Option<Version> = None;
    let mut source: Option<PartialSource> = None;
    let mut in_changelog = false;

    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf).map_err(Error::Xml)? {
            Event::Eof => break,

            // An empty element can't carry a source URL or hold children,
            // so only real start tags build structure.
            Event::Start(tag) => {
                let name = tag.name();
                let name = std::str::from_utf8(name.as_ref()).map_err(|_| Error::InvalidUtf8)?.to_owned();

                match name.as_str() {
                    "index" => {
                        index_name = attr(&tag, "name").unwrap_or_default();
                    }
                    "category" => {
                        category = Some(Category { name: attr(&tag, "name").ok_or(Error::MissingAttribute("category", "name"))?, packages: Vec::new() });
                    }
                    "reapack" => {
                        let kind_attr = attr(&tag, "type").ok_or(Error::MissingAttribute("reapack", "type"))?;
                        package = Some(Package {
                            name: attr(&tag, "name").ok_or(Error::MissingAttribute("reapack", "name"))?,
                            kind: PackageType::from_str(&kind_attr).map_err(Error::UnknownPackageType)?,
                            versions: Vec::new(),
                        });
                    }
                    "version" => {
                        version = Some(Version {
                            name: VersionName::parse(attr(&tag, "name").ok_or(Error::MissingAttribute("version", "name"))?),
                            author: attr(&tag, "author").unwrap_or_default(),
                            changelog: String::new(),
                            sources: Vec::new(),
                        });
                    }
                    "changelog" => in_changelog = true,
                    "source" => {
                        let platform = attr(&tag, "platform").unwrap_or_else(|| "generic".to_owned());

                        match Platform::from_str(&platform) {
                            Ok(platform) => {
                                source = Some(PartialSource {
                                    platform,
                                    file: attr(&tag, "file").map(RelPath::from),
                                    main: attr(&tag, "main").map(|v| v == "true" || v == "1").unwrap_or(false),
                                    url: String::new(),
                                });
                            }
                            Err(_) => {
                                // Unknown platform: this source is skipped but
                                // its body must still be consumed so the
                                // reader stays in sync.
                                source = None;
                            }
                        }
                    }
                    _ => {}
                }
            }

            Event::End(tag) => {
                let tag_name = tag.name();
                let name = std::str::from_utf8(tag_name.as_ref()).map_err(|_| Error::InvalidUtf8)?;

                match name {
                    "category" => {
                        if let Some(category) = category.take() {
                            categories.push(category);
                        }
                    }
                    "reapack" => {
                        if let (Some(mut pkg), Some(cat)) = (package.take(), category.as_mut()) {
                            pkg.versions.sort_by(|a, b| b.name.cmp(&a.name));
                            cat.packages.push(pkg);
                        }
                    }
                    "version" => {
                        if let (Some(version), Some(pkg)) = (version.take(), package.as_mut()) {
                            if pkg.versions.iter().any(|v| v.name == version.name) {
                                return Err(Error::DuplicateVersion(pkg.name.clone(), version.name.to_string()));
                            }
                            pkg.versions.push(version);
                        }
                    }
                    "changelog" => in_changelog = false,
                    "source" => {
                        if let (Some(partial), Some(version)) = (source.take(), version.as_mut()) {
                            let url = Url::parse(partial.url.trim()).map_err(Error::InvalidUrl)?;
                            version.sources.push(Source { url, platform: partial.platform, file: partial.file, main: partial.main });
                        }
                    }
                    _ => {}
                }
            }

            Event::CData(cdata) => {
                let decoded = std::str::from_utf8(&cdata).map_err(|_| Error::InvalidUtf8)?;

                if in_changelog {
                    if let Some(version) = version.as_mut() {
                        version.changelog.push_str(decoded);
                    }
                } else if let Some(partial) = source.as_mut() {
                    partial.url.push_str(decoded);
                }
            }

            Event::Text(text) => {
                let decoded = text.unescape().map_err(Error::Xml)?;

                if in_changelog {
                    if let Some(version) = version.as_mut() {
                        version.changelog.push_str(&decoded);
                    }
                } else if let Some(partial) = source.as_mut() {
                    partial.url.push_str(&decoded);
                }
            }

            _ => {}
        }

        buf.clear();
    }

    Ok(Index { name: index_name, categories })
}

struct PartialSource {
    platform: Platform,
    file: Option<RelPath>,
    main: bool,
    url: String,
}

fn attr(tag: &quick_xml::events::BytesStart<'_>, key: &str) -> Option<String> {
    tag.attributes().flatten().find(|a| a.key.as_ref() == key.as_bytes()).map(|a| a.unescape_value().unwrap_or_default().into_owned())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("xml: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("invalid utf-8 in document")]
    InvalidUtf8,
    #[error("<{0}> missing required attribute `{1}`")]
    MissingAttribute(&'static str, &'static str),
    #[error("unknown package type: {0}")]
    UnknownPackageType(#[source] super::UnknownPackageType),
    #[error("invalid source url: {0}")]
    InvalidUrl(#[source] url::ParseError),
    #[error("duplicate version `{1}` in package `{0}`")]
    DuplicateVersion(String, String),
}
