//! METS/PREMIS extraction.
//!
//! [`parse_mets`] turns an Archivematica AIP METS document into the AIP
//! header, the original and preservation file entries with their PREMIS
//! object and events, and the agents those events reference. It does no I/O.

pub mod dates;
pub mod xml;

use crate::error::{AggregatorError, Result};
use chrono::NaiveDateTime;
use dates::normalize_date;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::warn;
use xml::Element;

pub const PREMIS_V3_NAMESPACE: &str = "http://www.loc.gov/premis/v3";

/// `originalName` values with this prefix describe directories, not the AIP.
const TRANSFER_DIRECTORY_PREFIX: &str = "%transferDirectory%";

/// `-` plus a 36-character UUID appended to the transfer name.
const TRANSFER_UUID_SUFFIX_LEN: usize = 37;

const ISO_DISK_IMAGE_FORMAT: &str = "ISO Disk Image File";
const ISO_DISK_IMAGE_PUID: &str = "fmt/468";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileUse {
    Original,
    Preservation,
    Other,
}

impl FileUse {
    pub fn from_use(value: &str) -> Self {
        match value {
            "original" => FileUse::Original,
            "preservation" => FileUse::Preservation,
            _ => FileUse::Other,
        }
    }
}

/// Structural fields of a PREMIS object. Missing fields are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PremisObject {
    pub size: Option<i64>,
    pub puid: Option<String>,
    pub format_name: Option<String>,
    pub format_version: Option<String>,
    pub checksum_type: Option<String>,
    pub checksum_value: Option<String>,
    /// UUID of the paired original or preservation file.
    pub related_uuid: Option<String>,
    pub date_created_by_application: Option<NaiveDateTime>,
}

impl PremisObject {
    /// Used when an entry has no readable PREMIS object, which in practice
    /// means an ISO disk image.
    pub fn disk_image_fallback() -> Self {
        Self {
            puid: Some(ISO_DISK_IMAGE_PUID.to_string()),
            format_name: Some(ISO_DISK_IMAGE_FORMAT.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PremisEvent {
    pub event_type: Option<String>,
    pub uuid: Option<String>,
    pub date: Option<NaiveDateTime>,
    pub detail: Option<String>,
    pub outcome: Option<String>,
    pub outcome_detail: Option<String>,
    /// `linking_type_value` of every agent this event names.
    pub linking_agents: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct AgentRecord {
    /// `"{identifier type}-{identifier value}"`.
    pub linking_type_value: String,
    pub agent_type: Option<String>,
    pub agent_value: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub file_use: FileUse,
    pub uuid: String,
    pub label: String,
    pub filepath: Option<String>,
    pub premis: PremisObject,
    /// The PREMIS object as XML, when one was found.
    pub premis_xml: Option<String>,
    pub events: Vec<PremisEvent>,
}

impl FileEntry {
    /// Preservation copies take the date of their `creation` event; originals
    /// keep the date recorded by the creating application.
    pub fn date_created(&self) -> Option<NaiveDateTime> {
        match self.file_use {
            FileUse::Preservation => self
                .events
                .iter()
                .find(|e| e.event_type.as_deref() == Some("creation"))
                .and_then(|e| e.date),
            _ => self.premis.date_created_by_application,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParsedMets {
    /// `None` when no usable `originalName` exists; see [`original_name`].
    pub transfer_name: Option<String>,
    pub create_date: NaiveDateTime,
    pub files: Vec<FileEntry>,
    pub agents: Vec<AgentRecord>,
}

impl ParsedMets {
    pub fn originals(&self) -> impl Iterator<Item = &FileEntry> {
        self.files.iter().filter(|f| f.file_use == FileUse::Original)
    }

    pub fn preservation_files(&self) -> impl Iterator<Item = &FileEntry> {
        self.files.iter().filter(|f| f.file_use == FileUse::Preservation)
    }
}

/// Parse a METS document.
pub fn parse_mets(bytes: &[u8]) -> Result<ParsedMets> {
    let root = xml::parse_document(bytes)?;
    if !root.is("mets") {
        return Err(AggregatorError::mets(format!(
            "root element is '{}', expected 'mets'",
            root.local_name()
        )));
    }

    let create_date = root
        .child("metsHdr")
        .and_then(|hdr| hdr.attr("CREATEDATE"))
        .map(normalize_date)
        .unwrap_or_else(dates::unparseable_date);

    let amd_secs: HashMap<&str, &Element> = root
        .descendants("amdSec")
        .into_iter()
        .filter_map(|sec| sec.attr("ID").map(|id| (id, sec)))
        .collect();

    let labels = struct_map_labels(&root);

    let mut files = Vec::new();
    let mut agents = Vec::new();
    let mut seen_agents = HashSet::new();

    for file_sec in root.descendants("fileSec") {
        for (file, group_use) in file_elements(file_sec, None) {
            let file_use = FileUse::from_use(file.attr("USE").or(group_use).unwrap_or_default());
            if file_use == FileUse::Other {
                continue;
            }

            let sections: Vec<&Element> = file
                .attr("ADMID")
                .unwrap_or_default()
                .split_whitespace()
                .filter_map(|id| amd_secs.get(id).copied())
                .collect();

            let entry = file_entry(file, file_use, &sections, &labels);

            for agent in sections.iter().flat_map(|sec| premis_agents(sec)) {
                if seen_agents.insert(agent.clone()) {
                    agents.push(agent);
                }
            }
            files.push(entry);
        }
    }

    Ok(ParsedMets {
        transfer_name: original_name(&root).ok(),
        create_date,
        files,
        agents,
    })
}

/// Transfer name from the PREMIS v3 `originalName` of the AIP's dmdSecs.
///
/// Directory entries are skipped. When several candidates remain the last
/// one wins.
pub fn original_name(root: &Element) -> Result<String> {
    let mut name = None;

    for dmd_sec in root.descendants("dmdSec") {
        for candidate in dmd_sec.descendants("originalName") {
            if candidate.namespace.as_deref() != Some(PREMIS_V3_NAMESPACE) {
                continue;
            }
            let value = candidate.text();
            let value = value.trim();
            if value.starts_with(TRANSFER_DIRECTORY_PREFIX) {
                continue;
            }
            name = Some(strip_transfer_uuid(value));
        }
    }

    name.filter(|n| !n.is_empty())
        .ok_or_else(|| AggregatorError::mets("no PREMIS originalName for the AIP"))
}

fn strip_transfer_uuid(value: &str) -> String {
    let keep = value.chars().count().saturating_sub(TRANSFER_UUID_SUFFIX_LEN);
    value.chars().take(keep).collect()
}

/// `fileGrp` nesting carries `USE` down to the files it contains.
fn file_elements<'a>(
    parent: &'a Element,
    inherited_use: Option<&'a str>,
) -> Vec<(&'a Element, Option<&'a str>)> {
    let mut found = Vec::new();
    for el in parent.elements() {
        if el.is("file") {
            found.push((el, inherited_use));
        } else if el.is("fileGrp") {
            found.extend(file_elements(el, el.attr("USE").or(inherited_use)));
        }
    }
    found
}

/// `FILEID` to `LABEL` from structMap divs; the first map that names a file wins.
fn struct_map_labels(root: &Element) -> HashMap<&str, &str> {
    let mut labels = HashMap::new();
    for struct_map in root.descendants("structMap") {
        for div in struct_map.descendants("div") {
            let Some(label) = div.attr("LABEL") else {
                continue;
            };
            for fptr in div.elements().filter(|el| el.is("fptr")) {
                if let Some(file_id) = fptr.attr("FILEID") {
                    labels.entry(file_id).or_insert(label);
                }
            }
        }
    }
    labels
}

fn file_entry(
    file: &Element,
    file_use: FileUse,
    sections: &[&Element],
    labels: &HashMap<&str, &str>,
) -> FileEntry {
    let object = sections.iter().find_map(|sec| premis_object_element(sec));
    let premis = object.map(premis_object).transpose();

    let filepath = file
        .child("FLocat")
        .and_then(|loc| loc.attr("href"))
        .map(str::to_string);

    let id = file.attr("ID").unwrap_or_default();
    let uuid = match id.strip_prefix("file-") {
        Some(uuid) => uuid.to_string(),
        None => object
            .and_then(|o| o.descendant_text("objectIdentifierValue"))
            .unwrap_or_else(|| id.to_string()),
    };

    let label = labels
        .get(id)
        .map(|l| l.to_string())
        .or_else(|| {
            filepath
                .as_deref()
                .and_then(|p| p.rsplit('/').next())
                .map(str::to_string)
        })
        .unwrap_or_default();

    // A malformed object is not kept as the file's PREMIS blob.
    let (premis, premis_xml) = match premis {
        Ok(Some(parsed)) => (parsed, object.map(Element::to_xml)),
        Ok(None) => (PremisObject::disk_image_fallback(), None),
        Err(e) => {
            warn!(file_uuid = %uuid, error = %e, "Unreadable PREMIS object, using disk image defaults");
            (PremisObject::disk_image_fallback(), None)
        },
    };

    let events = sections
        .iter()
        .flat_map(|sec| premis_events(sec))
        .collect();

    FileEntry {
        file_use,
        uuid,
        label,
        filepath,
        premis,
        premis_xml,
        events,
    }
}

/// Metadata wrappers of a given `MDTYPE` inside one amdSec.
fn wrapped<'a>(amd_sec: &'a Element, section: &str, md_type: &str) -> Vec<&'a Element> {
    amd_sec
        .elements()
        .filter(|el| el.is(section))
        .flat_map(|el| el.descendants("mdWrap"))
        .filter(|wrap| wrap.attr("MDTYPE") == Some(md_type))
        .collect()
}

fn premis_object_element(amd_sec: &Element) -> Option<&Element> {
    wrapped(amd_sec, "techMD", "PREMIS:OBJECT")
        .into_iter()
        .find_map(|wrap| wrap.first_descendant("object"))
}

fn premis_object(object: &Element) -> Result<PremisObject> {
    let size = match object.descendant_text("size") {
        Some(raw) => Some(raw.parse::<i64>().map_err(|_| {
            AggregatorError::mets(format!("PREMIS object size '{}' is not an integer", raw))
        })?),
        None => None,
    };

    let fixity = object.first_descendant("fixity");
    let relationship = object.first_descendant("relationship");

    Ok(PremisObject {
        size,
        puid: object.descendant_text("formatRegistryKey"),
        format_name: object.descendant_text("formatName"),
        format_version: object.descendant_text("formatVersion"),
        checksum_type: fixity.and_then(|f| f.descendant_text("messageDigestAlgorithm")),
        checksum_value: fixity.and_then(|f| f.descendant_text("messageDigest")),
        related_uuid: relationship.and_then(|r| r.descendant_text("relatedObjectIdentifierValue")),
        date_created_by_application: object
            .descendant_text("dateCreatedByApplication")
            .map(|d| normalize_date(&d)),
    })
}

fn premis_events(amd_sec: &Element) -> Vec<PremisEvent> {
    wrapped(amd_sec, "digiprovMD", "PREMIS:EVENT")
        .into_iter()
        .filter_map(|wrap| wrap.first_descendant("event"))
        .map(|event| PremisEvent {
            event_type: event.descendant_text("eventType"),
            uuid: event.descendant_text("eventIdentifierValue"),
            date: event
                .descendant_text("eventDateTime")
                .map(|d| normalize_date(&d)),
            detail: event.descendant_text("eventDetail"),
            outcome: event.descendant_text("eventOutcome"),
            outcome_detail: event.descendant_text("eventOutcomeDetailNote"),
            linking_agents: event
                .descendants("linkingAgentIdentifier")
                .into_iter()
                .filter_map(|link| {
                    linking_type_value(
                        link.descendant_text("linkingAgentIdentifierType"),
                        link.descendant_text("linkingAgentIdentifierValue"),
                    )
                })
                .collect(),
        })
        .collect()
}

fn premis_agents(amd_sec: &Element) -> Vec<AgentRecord> {
    wrapped(amd_sec, "digiprovMD", "PREMIS:AGENT")
        .into_iter()
        .filter_map(|wrap| wrap.first_descendant("agent"))
        .filter_map(|agent| {
            let linking_type_value = linking_type_value(
                agent.descendant_text("agentIdentifierType"),
                agent.descendant_text("agentIdentifierValue"),
            )?;
            Some(AgentRecord {
                linking_type_value,
                agent_type: agent.descendant_text("agentType"),
                agent_value: agent.descendant_text("agentName"),
            })
        })
        .collect()
}

fn linking_type_value(kind: Option<String>, value: Option<String>) -> Option<String> {
    match (kind, value) {
        (Some(kind), Some(value)) => Some(format!("{}-{}", kind, value)),
        _ => None,
    }
}
