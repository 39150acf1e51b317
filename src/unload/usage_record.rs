//! XML usage record encoding for detail records
//!
//! One `urf:UsageRecord` element per consolidated record, wrapped in a
//! `urf:UsageRecords` document per message. Durations are ISO 8601
//! (`PT3600S`), times RFC 3339 in UTC.

use std::fmt::Display;

use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::error::UnloadError;
use crate::models::ConsolidatedRecord;

pub const DOCUMENT_OPEN: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
<urf:UsageRecords xmlns:urf=\"http://schema.ogf.org/urf/2003/09/urf\">\n";
pub const DOCUMENT_CLOSE: &str = "</urf:UsageRecords>\n";

type XmlWriter = Writer<Vec<u8>>;

fn encode_err(e: impl Display) -> UnloadError {
    UnloadError::Encode(e.to_string())
}

fn start(w: &mut XmlWriter, name: &str) -> Result<(), UnloadError> {
    w.write_event(Event::Start(BytesStart::new(name)))
        .map_err(encode_err)
}

fn end(w: &mut XmlWriter, name: &str) -> Result<(), UnloadError> {
    w.write_event(Event::End(BytesEnd::new(name))).map_err(encode_err)
}

fn text(w: &mut XmlWriter, name: &str, value: &str) -> Result<(), UnloadError> {
    w.create_element(name)
        .write_text_content(BytesText::new(value))
        .map_err(encode_err)?;
    Ok(())
}

fn typed_text(w: &mut XmlWriter, name: &str, kind: &str, value: &str) -> Result<(), UnloadError> {
    w.create_element(name)
        .with_attribute(("urf:type", kind))
        .write_text_content(BytesText::new(value))
        .map_err(encode_err)?;
    Ok(())
}

fn duration(secs: i64) -> String {
    format!("PT{}S", secs)
}

fn timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// One `urf:UsageRecord` element, newline terminated.
pub fn encode(record: &ConsolidatedRecord) -> Result<String, UnloadError> {
    let mut w = Writer::new_with_indent(Vec::new(), b' ', 2);

    start(&mut w, "urf:UsageRecord")?;

    let record_id = format!("{}/{}/{}", record.site, record.entity_id, record.period);
    let created = timestamp(&record.measurement_time);
    w.create_element("urf:RecordIdentity")
        .with_attribute(("urf:recordId", record_id.as_str()))
        .with_attribute(("urf:createTime", created.as_str()))
        .write_empty()
        .map_err(encode_err)?;

    start(&mut w, "urf:JobIdentity")?;
    text(&mut w, "urf:LocalJobId", &record.entity_id)?;
    end(&mut w, "urf:JobIdentity")?;

    let has_identity = record.global_user_name.is_some()
        || record.vo.is_some()
        || record.vo_group.is_some()
        || record.vo_role.is_some();
    if has_identity {
        start(&mut w, "urf:UserIdentity")?;
        if let Some(dn) = &record.global_user_name {
            text(&mut w, "urf:GlobalUserName", dn)?;
        }
        if let Some(vo) = &record.vo {
            text(&mut w, "urf:Group", vo)?;
        }
        if let Some(group) = &record.vo_group {
            typed_text(&mut w, "urf:GroupAttribute", "vo-group", group)?;
        }
        if let Some(role) = &record.vo_role {
            typed_text(&mut w, "urf:GroupAttribute", "vo-role", role)?;
        }
        end(&mut w, "urf:UserIdentity")?;
    }

    text(&mut w, "urf:Status", &record.status)?;
    text(&mut w, "urf:WallDuration", &duration(record.wall_duration))?;
    w.create_element("urf:CpuDuration")
        .with_attribute(("urf:usageType", "all"))
        .write_text_content(BytesText::new(&duration(record.cpu_duration)))
        .map_err(encode_err)?;
    text(&mut w, "urf:StartTime", &timestamp(&record.start_time))?;
    text(&mut w, "urf:EndTime", &created)?;
    text(&mut w, "urf:Site", &record.site)?;
    if let (Some(kind), Some(value)) = (&record.spec_type, record.spec_value) {
        typed_text(&mut w, "urf:ServiceLevel", kind, &value.to_string())?;
    }

    end(&mut w, "urf:UsageRecord")?;

    let mut xml = String::from_utf8(w.into_inner()).map_err(encode_err)?;
    xml.push('\n');
    Ok(xml)
}
