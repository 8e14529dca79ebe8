//! Wire format for taskstats over generic netlink.
//!
//! Every function here works on byte slices and never reads past a declared
//! length without checking it first, so a truncated or hostile reply becomes
//! a `DecodeError` rather than a panic.

use super::{AccountingRecord, MIN_TASKSTATS_LEN, MIN_TASKSTATS_VERSION};
use thiserror::Error;

pub const NLMSG_HDRLEN: usize = 16;
pub const GENL_HDRLEN: usize = 4;
pub const NLA_HDRLEN: usize = 4;
const NLA_ALIGNTO: usize = 4;
const NLA_TYPE_MASK: u16 = 0x3fff;

pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;
pub const NLM_F_REQUEST: u16 = 1;

pub const GENL_ID_CTRL: u16 = 0x10;
pub const CTRL_CMD_GETFAMILY: u8 = 3;
pub const CTRL_ATTR_FAMILY_ID: u16 = 1;
pub const CTRL_ATTR_FAMILY_NAME: u16 = 2;

pub const TASKSTATS_GENL_NAME: &str = "TASKSTATS";
pub const TASKSTATS_GENL_VERSION: u8 = 1;
pub const TASKSTATS_CMD_GET: u8 = 1;
pub const TASKSTATS_CMD_ATTR_PID: u16 = 1;
pub const TASKSTATS_TYPE_PID: u16 = 1;
pub const TASKSTATS_TYPE_STATS: u16 = 3;
pub const TASKSTATS_TYPE_AGGR_PID: u16 = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("reply carries no per-pid aggregate attribute")]
    NoAggregateAttr,

    #[error("aggregate attribute carries no stats attribute")]
    NoStatsAttr,

    #[error("stats payload is {0} bytes, need at least {MIN_TASKSTATS_LEN}")]
    ShortPayload(usize),

    #[error("taskstats version {0} is older than {MIN_TASKSTATS_VERSION}")]
    UnsupportedVersion(u16),

    #[error("controller reply carries no family id")]
    NoFamilyId,

    #[error("malformed message: {0}")]
    Malformed(String),
}

impl DecodeError {
    /// Whether the error means "nothing usable for this task this time"
    /// rather than a broken kernel contract.
    pub fn is_no_data(&self) -> bool {
        matches!(
            self,
            DecodeError::NoAggregateAttr | DecodeError::NoStatsAttr | DecodeError::ShortPayload(_)
        )
    }
}

/// One netlink message borrowed from a receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NlMessage<'a> {
    pub msg_type: u16,
    pub flags: u16,
    pub seq: u32,
    pub port: u32,
    pub payload: &'a [u8],
}

fn align(len: usize) -> usize {
    (len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1)
}

fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    buf.get(at..at + 2)
        .map(|b| u16::from_ne_bytes([b[0], b[1]]))
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    buf.get(at..at + 4)
        .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u64(buf: &[u8], at: usize) -> Option<u64> {
    let b = buf.get(at..at + 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(b);
    Some(u64::from_ne_bytes(raw))
}

fn push_attr(out: &mut Vec<u8>, attr_type: u16, value: &[u8]) {
    let len = NLA_HDRLEN + value.len();
    out.extend_from_slice(&(len as u16).to_ne_bytes());
    out.extend_from_slice(&attr_type.to_ne_bytes());
    out.extend_from_slice(value);
    out.resize(out.len() + (align(len) - len), 0);
}

/// Builds a complete generic netlink request message.
pub fn encode_genl_request(
    msg_type: u16,
    seq: u32,
    cmd: u8,
    version: u8,
    attrs: &[(u16, &[u8])],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(64);
    body.extend_from_slice(&[cmd, version, 0, 0]);
    for (attr_type, value) in attrs {
        push_attr(&mut body, *attr_type, value);
    }

    let total = NLMSG_HDRLEN + body.len();
    let mut msg = Vec::with_capacity(total);
    msg.extend_from_slice(&(total as u32).to_ne_bytes());
    msg.extend_from_slice(&msg_type.to_ne_bytes());
    msg.extend_from_slice(&NLM_F_REQUEST.to_ne_bytes());
    msg.extend_from_slice(&seq.to_ne_bytes());
    // Port id 0 addresses the kernel.
    msg.extend_from_slice(&0u32.to_ne_bytes());
    msg.extend_from_slice(&body);
    msg
}

/// `CTRL_CMD_GETFAMILY` request resolving a family name to its id.
pub fn encode_family_request(seq: u32, family_name: &str) -> Vec<u8> {
    let mut name = family_name.as_bytes().to_vec();
    name.push(0);
    encode_genl_request(
        GENL_ID_CTRL,
        seq,
        CTRL_CMD_GETFAMILY,
        1,
        &[(CTRL_ATTR_FAMILY_NAME, &name)],
    )
}

/// `TASKSTATS_CMD_GET` request for a single task.
pub fn encode_taskstats_request(family_id: u16, seq: u32, tid: u32) -> Vec<u8> {
    encode_genl_request(
        family_id,
        seq,
        TASKSTATS_CMD_GET,
        TASKSTATS_GENL_VERSION,
        &[(TASKSTATS_CMD_ATTR_PID, &tid.to_ne_bytes())],
    )
}

/// Splits a receive buffer into its netlink messages.
pub fn parse_messages(buf: &[u8]) -> Result<Vec<NlMessage<'_>>, DecodeError> {
    let mut messages = Vec::new();
    let mut offset = 0;
    while offset + NLMSG_HDRLEN <= buf.len() {
        let len = read_u32(buf, offset).unwrap_or(0) as usize;
        if len < NLMSG_HDRLEN || offset + len > buf.len() {
            return Err(DecodeError::Malformed(format!(
                "netlink message length {} at offset {} exceeds buffer of {}",
                len,
                offset,
                buf.len()
            )));
        }
        messages.push(NlMessage {
            msg_type: read_u16(buf, offset + 4).unwrap_or(0),
            flags: read_u16(buf, offset + 6).unwrap_or(0),
            seq: read_u32(buf, offset + 8).unwrap_or(0),
            port: read_u32(buf, offset + 12).unwrap_or(0),
            payload: &buf[offset + NLMSG_HDRLEN..offset + len],
        });
        offset += align(len);
    }
    Ok(messages)
}

/// Walks a flat run of netlink attributes.
pub fn parse_attributes(buf: &[u8]) -> Result<Vec<(u16, &[u8])>, DecodeError> {
    let mut attrs = Vec::new();
    let mut offset = 0;
    while offset + NLA_HDRLEN <= buf.len() {
        let len = read_u16(buf, offset).unwrap_or(0) as usize;
        let attr_type = read_u16(buf, offset + 2).unwrap_or(0) & NLA_TYPE_MASK;
        if len < NLA_HDRLEN || offset + len > buf.len() {
            return Err(DecodeError::Malformed(format!(
                "attribute type {} declares length {} past end of {} byte buffer",
                attr_type,
                len,
                buf.len()
            )));
        }
        attrs.push((attr_type, &buf[offset + NLA_HDRLEN..offset + len]));
        offset += align(len);
    }
    Ok(attrs)
}

fn find_attr<'a>(attrs: &[(u16, &'a [u8])], wanted: u16) -> Option<&'a [u8]> {
    attrs
        .iter()
        .find(|(attr_type, _)| *attr_type == wanted)
        .map(|(_, value)| *value)
}

/// Strips the generic netlink header from a message payload.
pub fn genl_attributes(payload: &[u8]) -> Result<&[u8], DecodeError> {
    payload.get(GENL_HDRLEN..).ok_or_else(|| {
        DecodeError::Malformed(format!(
            "generic netlink payload of {} bytes has no room for its header",
            payload.len()
        ))
    })
}

/// Reads the (negative errno) code from an `NLMSG_ERROR` payload.
/// Zero is an acknowledgement.
pub fn decode_error_code(payload: &[u8]) -> Result<i32, DecodeError> {
    read_u32(payload, 0)
        .map(|raw| raw as i32)
        .ok_or_else(|| DecodeError::Malformed("truncated NLMSG_ERROR payload".into()))
}

/// Extracts the family id from a `CTRL_CMD_GETFAMILY` reply payload.
pub fn decode_family_id(payload: &[u8]) -> Result<u16, DecodeError> {
    let attrs = parse_attributes(genl_attributes(payload)?)?;
    find_attr(&attrs, CTRL_ATTR_FAMILY_ID)
        .and_then(|value| read_u16(value, 0))
        .ok_or(DecodeError::NoFamilyId)
}

/// Decodes a `TASKSTATS_CMD_NEW` reply payload (generic netlink header
/// included) into an accounting record.
pub fn decode_taskstats_reply(payload: &[u8]) -> Result<AccountingRecord, DecodeError> {
    let attrs = parse_attributes(genl_attributes(payload)?)?;
    let aggregate = find_attr(&attrs, TASKSTATS_TYPE_AGGR_PID).ok_or(DecodeError::NoAggregateAttr)?;
    let nested = parse_attributes(aggregate)?;
    let stats = find_attr(&nested, TASKSTATS_TYPE_STATS).ok_or(DecodeError::NoStatsAttr)?;
    decode_record(stats)
}

/// Decodes the fixed-offset counters out of a raw `struct taskstats`.
pub fn decode_record(stats: &[u8]) -> Result<AccountingRecord, DecodeError> {
    if stats.len() < MIN_TASKSTATS_LEN {
        return Err(DecodeError::ShortPayload(stats.len()));
    }
    let version = read_u16(stats, 0).unwrap_or(0);
    if version < MIN_TASKSTATS_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    // Length was checked above; every offset + 8 is within MIN_TASKSTATS_LEN.
    let field = |offset: usize| read_u64(stats, offset).unwrap_or(0);
    let [blkio, swapin, read, write, cancelled] = AccountingRecord::FIELD_OFFSETS.map(|(_, o)| field(o));
    Ok(AccountingRecord {
        blkio_delay_total: blkio,
        swapin_delay_total: swapin,
        read_bytes: read,
        write_bytes: write,
        cancelled_write_bytes: cancelled,
    })
}

/// Builders for synthetic kernel replies.
#[cfg(any(test, feature = "test-utils"))]
pub mod fixtures {
    use super::*;

    /// A `struct taskstats` blob of `len` bytes with `version` and `record`
    /// written at their documented offsets.
    pub fn stats_blob(version: u16, record: &AccountingRecord, len: usize) -> Vec<u8> {
        let mut blob = vec![0u8; len];
        let version_bytes = version.to_ne_bytes();
        let n = version_bytes.len().min(len);
        blob[..n].copy_from_slice(&version_bytes[..n]);
        let values = [
            record.blkio_delay_total,
            record.swapin_delay_total,
            record.read_bytes,
            record.write_bytes,
            record.cancelled_write_bytes,
        ];
        for ((_, offset), value) in AccountingRecord::FIELD_OFFSETS.iter().zip(values) {
            if offset + 8 <= len {
                blob[*offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
            }
        }
        blob
    }

    /// A full `TASKSTATS_CMD_NEW` reply payload (generic header included)
    /// carrying `stats` for `tid` inside an aggregate-per-pid attribute.
    pub fn taskstats_reply_payload(tid: u32, stats: &[u8]) -> Vec<u8> {
        let mut nested = Vec::new();
        push_attr(&mut nested, TASKSTATS_TYPE_PID, &tid.to_ne_bytes());
        push_attr(&mut nested, TASKSTATS_TYPE_STATS, stats);

        let mut payload = vec![2, TASKSTATS_GENL_VERSION, 0, 0];
        push_attr(&mut payload, TASKSTATS_TYPE_AGGR_PID, &nested);
        payload
    }

    /// Wraps a payload in a netlink header.
    pub fn nl_message(msg_type: u16, seq: u32, payload: &[u8]) -> Vec<u8> {
        let total = NLMSG_HDRLEN + payload.len();
        let mut msg = Vec::with_capacity(align(total));
        msg.extend_from_slice(&(total as u32).to_ne_bytes());
        msg.extend_from_slice(&msg_type.to_ne_bytes());
        msg.extend_from_slice(&0u16.to_ne_bytes());
        msg.extend_from_slice(&seq.to_ne_bytes());
        msg.extend_from_slice(&0u32.to_ne_bytes());
        msg.extend_from_slice(payload);
        msg.resize(align(total), 0);
        msg
    }
}
