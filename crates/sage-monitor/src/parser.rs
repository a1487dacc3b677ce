//! XML change-payload decoding.
//!
//! A payload is one XML document whose root tag names the source table and
//! whose child elements each describe one changed row through attributes:
//!
//! ```text
//! <F_DOCENTETE>
//!   <row OperationType="INSERT" RecordID="FA00042"
//!        ModificationTime="2024-01-01T00:00:00"
//!        Domaine="0" Type="6" TotalHT="150.00"/>
//! </F_DOCENTETE>
//! ```
//!
//! Elements are decoded independently: a bad element is dropped and
//! reported, its siblings are still decoded.

use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDateTime};
use thiserror::Error;
use tracing::{debug, warn};

use sage_core::{EntityKind, Error, OperationKind, RawChangeRecord, RecordDetail, Result};

/// Root tag of commercial document header payloads.
pub const DOCUMENT_ROOT_TAG: &str = "F_DOCENTETE";
/// Root tag of third party payloads.
pub const PARTY_ROOT_TAG: &str = "F_COMPTET";

const ATTR_OPERATION: &str = "OperationType";
const ATTR_RECORD_ID: &str = "RecordID";
const ATTR_MODIFIED: &str = "ModificationTime";
const ATTR_DOMAIN: &str = "Domaine";
const ATTR_TYPE: &str = "Type";
const ATTR_TOTAL: &str = "TotalHT";

/// Accepted naive timestamp layouts, tried in order.
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    // Upstream server locale (fr-FR).
    "%d/%m/%Y %H:%M:%S",
];

/// Why a single element was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("missing required attribute {0}")]
    MissingAttribute(&'static str),

    #[error("attribute {attribute} is not an integer: {value:?}")]
    InvalidInteger {
        attribute: &'static str,
        value: String,
    },

    #[error("attribute {attribute} is not a decimal: {value:?}")]
    InvalidDecimal {
        attribute: &'static str,
        value: String,
    },

    #[error("attribute {attribute} is not a timestamp: {value:?}")]
    InvalidTimestamp {
        attribute: &'static str,
        value: String,
    },
}

/// A dropped element and its position among the root's child elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedRecord {
    pub index: usize,
    pub reason: RecordError,
}

/// Result of decoding one payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPayload {
    /// `None` when the root tag is not monitored.
    pub kind: Option<EntityKind>,
    /// Decoded records, in document order.
    pub records: Vec<RawChangeRecord>,
    pub rejected: Vec<MalformedRecord>,
}

impl ParsedPayload {
    pub fn is_recognized(&self) -> bool {
        self.kind.is_some()
    }
}

/// Decoder for change payloads.
#[derive(Debug, Clone, Default)]
pub struct PayloadParser {
    table_tags: Vec<String>,
}

impl PayloadParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parser that also decodes the given root tags as generic table changes.
    pub fn with_table_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            table_tags: tags.into_iter().map(Into::into).collect(),
        }
    }

    /// Entity kind selected by a root tag's local name.
    pub fn kind_for_tag(&self, tag: &str) -> Option<EntityKind> {
        match tag {
            DOCUMENT_ROOT_TAG => Some(EntityKind::Document),
            PARTY_ROOT_TAG => Some(EntityKind::Party),
            other if self.table_tags.iter().any(|t| t == other) => Some(EntityKind::GenericTable),
            _ => None,
        }
    }

    /// Decode a payload.
    ///
    /// Fails only when the payload is not well-formed XML.
    pub fn parse(&self, payload: &str) -> Result<ParsedPayload> {
        let doc = roxmltree::Document::parse(payload)
            .map_err(|e| Error::Payload(format!("malformed XML payload: {}", e)))?;
        let root = doc.root_element();
        let tag = root.tag_name().name();

        let Some(kind) = self.kind_for_tag(tag) else {
            debug!(
                subsystem = "monitor",
                component = "parser",
                root_tag = tag,
                "Ignoring payload with unmonitored root tag"
            );
            return Ok(ParsedPayload::default());
        };

        let mut parsed = ParsedPayload {
            kind: Some(kind),
            ..ParsedPayload::default()
        };

        for (index, element) in root.children().filter(|n| n.is_element()).enumerate() {
            match decode_element(kind, &element) {
                Ok(record) => parsed.records.push(record),
                Err(reason) => {
                    warn!(
                        subsystem = "monitor",
                        component = "parser",
                        entity_kind = %kind,
                        record_index = index,
                        error = %reason,
                        "Dropping malformed change record"
                    );
                    parsed.rejected.push(MalformedRecord { index, reason });
                }
            }
        }

        Ok(parsed)
    }
}

fn decode_element(
    kind: EntityKind,
    element: &roxmltree::Node<'_, '_>,
) -> std::result::Result<RawChangeRecord, RecordError> {
    let operation = non_empty(element, ATTR_OPERATION)?;
    let entity_id = non_empty(element, ATTR_RECORD_ID)?;
    let modified = required(element, ATTR_MODIFIED)?;
    let occurred_at =
        parse_timestamp(modified).ok_or_else(|| RecordError::InvalidTimestamp {
            attribute: ATTR_MODIFIED,
            value: modified.to_string(),
        })?;

    let detail = match kind {
        EntityKind::Document => RecordDetail::Document {
            domain: int_attr(element, ATTR_DOMAIN)?,
            subtype: int_attr(element, ATTR_TYPE)?,
            total_amount: decimal_attr(element, ATTR_TOTAL)?,
        },
        EntityKind::Party => RecordDetail::Party {
            party_type: int_attr(element, ATTR_TYPE)?,
        },
        EntityKind::GenericTable => RecordDetail::Table {
            domain: int_attr(element, ATTR_DOMAIN)?,
            subtype: int_attr(element, ATTR_TYPE)?,
        },
    };

    Ok(RawChangeRecord {
        operation: OperationKind::from_wire(operation),
        entity_id: entity_id.to_string(),
        occurred_at,
        detail,
    })
}

fn required<'a>(
    element: &roxmltree::Node<'a, '_>,
    name: &'static str,
) -> std::result::Result<&'a str, RecordError> {
    element
        .attribute(name)
        .ok_or(RecordError::MissingAttribute(name))
}

fn non_empty<'a>(
    element: &roxmltree::Node<'a, '_>,
    name: &'static str,
) -> std::result::Result<&'a str, RecordError> {
    match required(element, name)? {
        "" => Err(RecordError::MissingAttribute(name)),
        value => Ok(value),
    }
}

fn int_attr(
    element: &roxmltree::Node<'_, '_>,
    name: &'static str,
) -> std::result::Result<i32, RecordError> {
    let value = required(element, name)?;
    value
        .trim()
        .parse::<i32>()
        .map_err(|_| RecordError::InvalidInteger {
            attribute: name,
            value: value.to_string(),
        })
}

fn decimal_attr(
    element: &roxmltree::Node<'_, '_>,
    name: &'static str,
) -> std::result::Result<BigDecimal, RecordError> {
    let value = required(element, name)?;
    invariant_decimal(value).ok_or_else(|| RecordError::InvalidDecimal {
        attribute: name,
        value: value.to_string(),
    })
}

/// Parse an amount in the invariant number format: optional sign, `,`
/// thousands grouping in threes, `.` fraction. Exponents are rejected.
fn invariant_decimal(raw: &str) -> Option<BigDecimal> {
    let raw = raw.trim();
    let (negative, body) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw.strip_prefix('+').unwrap_or(raw)),
    };
    let (int_part, frac_part) = body.split_once('.').unwrap_or((body, ""));

    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(frac_part) || (int_part.is_empty() && frac_part.is_empty()) {
        return None;
    }

    let mut groups = int_part.split(',');
    let first = groups.next().unwrap_or_default();
    let mut digits = String::with_capacity(int_part.len());
    if !all_digits(first) || (int_part.contains(',') && !(1..=3).contains(&first.len())) {
        return None;
    }
    digits.push_str(first);
    for group in groups {
        if group.len() != 3 || !all_digits(group) {
            return None;
        }
        digits.push_str(group);
    }

    let mut normalized = String::with_capacity(digits.len() + frac_part.len() + 3);
    if negative {
        normalized.push('-');
    }
    normalized.push_str(if digits.is_empty() { "0" } else { &digits });
    if !frac_part.is_empty() {
        normalized.push('.');
        normalized.push_str(frac_part);
    }
    BigDecimal::from_str(&normalized).ok()
}

/// Parse a source timestamp, keeping its local wall time.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.naive_local())
        })
}
