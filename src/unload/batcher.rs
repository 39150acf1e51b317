//! Message batching and the record wire format
//!
//! A message body is a header line naming the kind and version, followed by
//! one block per record. A block is `Key: Value` lines terminated by `%%`:
//!
//! ```text
//! usage-detail-message: v1.0
//! EntityId: vm-1
//! Site: Site1
//! ...
//! %%
//! EntityId: vm-2
//! ...
//! %%
//! ```
//!
//! Absent optional fields are omitted rather than written empty.
//!
//! Detail records can instead travel as XML usage records, see
//! [`super::usage_record`].

use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::usage_record;
use crate::error::UnloadError;
use crate::models::{ConsolidatedRecord, SummaryRecord, SyncRecord, TableKind, UnloadRow};

pub const RECORD_TERMINATOR: &str = "%%";
pub const FORMAT_VERSION: &str = "v1.0";

/// Kind of payload carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Detail,
    Summary,
    Sync,
}

impl MessageKind {
    pub fn for_table(kind: TableKind) -> Self {
        match kind {
            TableKind::DetailRecords => Self::Detail,
            TableKind::SummaryRecords => Self::Summary,
        }
    }

    pub fn header_name(&self) -> &'static str {
        match self {
            Self::Detail => "usage-detail-message",
            Self::Summary => "usage-summary-message",
            Self::Sync => "usage-sync-message",
        }
    }

    fn from_header_name(name: &str) -> Option<Self> {
        [Self::Detail, Self::Summary, Self::Sync]
            .into_iter()
            .find(|k| k.header_name() == name)
    }
}

/// Encoding of a message body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// `Key: Value` blocks
    #[default]
    Blocks,
    /// XML usage record document, detail records only
    UsageRecord,
}

impl WireFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Blocks => "text/plain",
            Self::UsageRecord => "text/xml",
        }
    }
}

/// Anything that can be written as one record block.
pub trait WireRecord {
    /// Ordered (key, value) pairs; `None` values are skipped.
    fn fields(&self) -> Vec<(&'static str, Option<String>)>;

    fn encode_block(&self) -> String {
        let mut block = String::new();
        for (key, value) in self.fields() {
            if let Some(value) = value {
                block.push_str(key);
                block.push_str(": ");
                block.push_str(&sanitise(&value));
                block.push('\n');
            }
        }
        block.push_str(RECORD_TERMINATOR);
        block.push('\n');
        block
    }
}

/// Values must stay on one line or they would break block framing.
fn sanitise(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

impl WireRecord for ConsolidatedRecord {
    fn fields(&self) -> Vec<(&'static str, Option<String>)> {
        vec![
            ("EntityId", Some(self.entity_id.clone())),
            ("Site", Some(self.site.clone())),
            ("Status", Some(self.status.clone())),
            ("Year", Some(self.period.year.to_string())),
            ("Month", Some(self.period.month.to_string())),
            ("StartTime", Some(self.start_time.timestamp().to_string())),
            ("MeasurementTime", Some(self.measurement_time.timestamp().to_string())),
            ("WallDuration", Some(self.wall_duration.to_string())),
            ("CpuDuration", Some(self.cpu_duration.to_string())),
            ("VO", self.vo.clone()),
            ("VOGroup", self.vo_group.clone()),
            ("VORole", self.vo_role.clone()),
            ("GlobalUserName", self.global_user_name.clone()),
            ("ServiceLevelType", self.spec_type.clone()),
            ("ServiceLevel", self.spec_value.map(|v| v.to_string())),
        ]
    }
}

impl WireRecord for SummaryRecord {
    fn fields(&self) -> Vec<(&'static str, Option<String>)> {
        vec![
            ("Site", Some(self.site.clone())),
            ("Year", Some(self.period.year.to_string())),
            ("Month", Some(self.period.month.to_string())),
            ("VO", self.vo.clone()),
            ("VOGroup", self.vo_group.clone()),
            ("VORole", self.vo_role.clone()),
            ("GlobalUserName", self.global_user_name.clone()),
            ("NumberOfRecords", Some(self.number_of_records.to_string())),
            ("WallDuration", Some(self.wall_duration.to_string())),
            ("CpuDuration", Some(self.cpu_duration.to_string())),
            (
                "EarliestEndTime",
                Some(self.earliest_measurement.timestamp().to_string()),
            ),
            (
                "LatestEndTime",
                Some(self.latest_measurement.timestamp().to_string()),
            ),
        ]
    }
}

impl WireRecord for SyncRecord {
    fn fields(&self) -> Vec<(&'static str, Option<String>)> {
        vec![
            ("Site", Some(self.site.clone())),
            ("Year", Some(self.period.year.to_string())),
            ("Month", Some(self.period.month.to_string())),
            ("NumberOfRecords", Some(self.record_count.to_string())),
        ]
    }
}

impl WireRecord for UnloadRow {
    fn fields(&self) -> Vec<(&'static str, Option<String>)> {
        match self {
            Self::Detail(r) => r.fields(),
            Self::Summary(r) => r.fields(),
        }
    }
}

/// One staged block of serialized records. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    id: String,
    kind: MessageKind,
    source: String,
    sequence: u32,
    record_count: usize,
    #[serde(default)]
    format: WireFormat,
    body: String,
}

impl OutboundMessage {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Position within the batch it was emitted in (0-based)
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Hex SHA-256 of the body, sent alongside so the collector can
    /// recognise a re-delivery.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.body.as_bytes()))
    }

    /// Decode the body back into (key, value) blocks. `None` for usage
    /// record bodies, or if the header does not match the message kind or a
    /// block is malformed.
    pub fn decode(&self) -> Option<Vec<Vec<(String, String)>>> {
        if self.format != WireFormat::Blocks {
            return None;
        }
        let (kind, blocks) = decode_body(&self.body)?;
        (kind == self.kind).then_some(blocks)
    }
}

/// Parse a message body into its kind and record blocks.
pub fn decode_body(body: &str) -> Option<(MessageKind, Vec<Vec<(String, String)>>)> {
    let mut lines = body.lines();
    let header = lines.next()?;
    let (name, version) = header.split_once(": ")?;
    if version != FORMAT_VERSION {
        return None;
    }
    let kind = MessageKind::from_header_name(name)?;

    let mut blocks = Vec::new();
    let mut current = Vec::new();
    for line in lines {
        if line == RECORD_TERMINATOR {
            blocks.push(std::mem::take(&mut current));
            continue;
        }
        let (key, value) = line.split_once(": ")?;
        current.push((key.to_string(), value.to_string()));
    }
    // A trailing unterminated block means the body was truncated.
    if !current.is_empty() {
        return None;
    }
    Some((kind, blocks))
}

/// Splits records into bounded messages, preserving order.
#[derive(Debug, Clone)]
pub struct MessageBatcher {
    source: String,
    max_records: NonZeroUsize,
    max_bytes: Option<usize>,
}

impl MessageBatcher {
    pub fn new(source: impl Into<String>, max_records: NonZeroUsize, max_bytes: Option<usize>) -> Self {
        Self {
            source: source.into(),
            max_records,
            max_bytes,
        }
    }

    /// Serialize `records` into as few messages as the bounds allow.
    ///
    /// A message closes when it holds `max_records` records, or when adding
    /// the next record would push the body past `max_bytes`. A record that
    /// alone exceeds `max_bytes` is still sent, in a message of its own.
    pub fn batch<R: WireRecord>(&self, kind: MessageKind, records: &[R]) -> Vec<OutboundMessage> {
        let header = format!("{}: {}\n", kind.header_name(), FORMAT_VERSION);
        let blocks = records.iter().map(|r| r.encode_block());
        self.pack(kind, WireFormat::Blocks, &header, "", blocks)
    }

    /// Serialize detail records as XML usage record documents, under the
    /// same bounds as [`MessageBatcher::batch`].
    pub fn batch_usage_records(
        &self,
        records: &[ConsolidatedRecord],
    ) -> Result<Vec<OutboundMessage>, UnloadError> {
        let elements = records
            .iter()
            .map(usage_record::encode)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.pack(
            MessageKind::Detail,
            WireFormat::UsageRecord,
            usage_record::DOCUMENT_OPEN,
            usage_record::DOCUMENT_CLOSE,
            elements.into_iter(),
        ))
    }

    fn pack(
        &self,
        kind: MessageKind,
        format: WireFormat,
        header: &str,
        footer: &str,
        blocks: impl Iterator<Item = String>,
    ) -> Vec<OutboundMessage> {
        let mut messages = Vec::new();
        let mut body = header.to_string();
        let mut count = 0usize;

        for block in blocks {
            let full_by_count = count == self.max_records.get();
            let full_by_size = self.max_bytes.is_some_and(|max| {
                count > 0 && body.len() + block.len() + footer.len() > max
            });

            if full_by_count || full_by_size {
                body.push_str(footer);
                messages.push(self.seal(kind, format, messages.len(), count, body));
                body = header.to_string();
                count = 0;
            }

            body.push_str(&block);
            count += 1;
        }

        if count > 0 {
            body.push_str(footer);
            messages.push(self.seal(kind, format, messages.len(), count, body));
        }

        messages
    }

    fn seal(
        &self,
        kind: MessageKind,
        format: WireFormat,
        sequence: usize,
        count: usize,
        body: String,
    ) -> OutboundMessage {
        OutboundMessage {
            id: Uuid::new_v4().simple().to_string(),
            kind,
            source: self.source.clone(),
            sequence: sequence as u32,
            record_count: count,
            format,
            body,
        }
    }
}
