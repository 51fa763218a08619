//! Wire codec for consensus messages.
//!
//! Every frame is `api_key u8 | version u16 | payload`, little-endian.
//! Requests and replies of one RPC share its API key. Each payload type
//! declares its key and the newest version it understands; frames with an
//! unknown key or an unsupported version are rejected before the payload is
//! touched.
//!
//! Optional offsets and terms are a presence byte followed by a `u64` when
//! present. Batches travel in their storage encoding.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use keel_core::{GroupId, IoBuf, IoBufParser, NodeId, Offset, RecordBatch, TermId};

use crate::error::CodecError;
use crate::limits::APPEND_BATCH_COUNT_MAX;
use crate::message::{
    AppendEntriesReply, AppendEntriesRequest, InstallSnapshotReply, InstallSnapshotRequest,
    RaftReply, RaftRequest, VoteReply, VoteRequest,
};

/// Frame prefix size.
const FRAME_HEADER_SIZE: usize = 1 + 2;

/// RPC type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ApiKey {
    /// Vote request and reply.
    Vote = 1,
    /// Append-entries request and reply.
    AppendEntries = 2,
    /// Install-snapshot request and reply.
    InstallSnapshot = 3,
}

impl ApiKey {
    /// Parses a key byte.
    #[must_use]
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Vote),
            2 => Some(Self::AppendEntries),
            3 => Some(Self::InstallSnapshot),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Payload contract
// ----------------------------------------------------------------------------

/// A message body with a stable type code and version range.
trait Payload: Sized {
    const API_KEY: ApiKey;
    const MIN_VERSION: u16 = 1;
    const MAX_VERSION: u16 = 1;

    fn write(&self, buf: &mut BytesMut);
    fn read(reader: &mut FrameReader, version: u16) -> Result<Self, CodecError>;
}

fn frame<T: Payload>(payload: &T) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(T::API_KEY as u8);
    buf.put_u16_le(T::MAX_VERSION);
    payload.write(&mut buf);
    buf.freeze()
}

fn unframe<T: Payload>(mut reader: FrameReader, version: u16) -> Result<T, CodecError> {
    if !(T::MIN_VERSION..=T::MAX_VERSION).contains(&version) {
        return Err(CodecError::UnsupportedVersion {
            api_key: T::API_KEY as u8,
            version,
        });
    }
    let payload = T::read(&mut reader, version)?;
    reader.finish()?;
    Ok(payload)
}

/// Encodes a request frame.
#[must_use]
pub fn encode_request(request: &RaftRequest) -> Bytes {
    match request {
        RaftRequest::Vote(r) => frame(r),
        RaftRequest::AppendEntries(r) => frame(r),
        RaftRequest::InstallSnapshot(r) => frame(r),
    }
}

/// Decodes a request frame.
///
/// # Errors
/// Returns an error for unknown keys, unsupported versions and malformed
/// payloads.
pub fn decode_request(frame: Bytes) -> Result<RaftRequest, CodecError> {
    let (key, version, reader) = FrameReader::open(frame)?;
    Ok(match key {
        ApiKey::Vote => RaftRequest::Vote(unframe(reader, version)?),
        ApiKey::AppendEntries => RaftRequest::AppendEntries(unframe(reader, version)?),
        ApiKey::InstallSnapshot => RaftRequest::InstallSnapshot(unframe(reader, version)?),
    })
}

/// Encodes a reply frame.
#[must_use]
pub fn encode_reply(reply: &RaftReply) -> Bytes {
    match reply {
        RaftReply::Vote(r) => frame(r),
        RaftReply::AppendEntries(r) => frame(r),
        RaftReply::InstallSnapshot(r) => frame(r),
    }
}

/// Decodes a reply frame.
///
/// # Errors
/// Returns an error for unknown keys, unsupported versions and malformed
/// payloads.
pub fn decode_reply(frame: Bytes) -> Result<RaftReply, CodecError> {
    let (key, version, reader) = FrameReader::open(frame)?;
    Ok(match key {
        ApiKey::Vote => RaftReply::Vote(unframe(reader, version)?),
        ApiKey::AppendEntries => RaftReply::AppendEntries(unframe(reader, version)?),
        ApiKey::InstallSnapshot => RaftReply::InstallSnapshot(unframe(reader, version)?),
    })
}

// ----------------------------------------------------------------------------
// Reading
// ----------------------------------------------------------------------------

struct FrameReader {
    parser: IoBufParser,
}

impl FrameReader {
    fn open(frame: Bytes) -> Result<(ApiKey, u16, Self), CodecError> {
        let mut reader = Self {
            parser: IoBuf::from(frame).into_parser(),
        };
        reader.need(FRAME_HEADER_SIZE)?;
        let key = reader.parser.get_u8();
        let version = reader.parser.get_u16_le();
        let key = ApiKey::from_byte(key).ok_or(CodecError::UnknownApiKey { key })?;
        Ok((key, version, reader))
    }

    fn need(&self, needed: usize) -> Result<(), CodecError> {
        let available = self.parser.remaining();
        if available < needed {
            return Err(CodecError::Truncated { needed, available });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        self.need(1)?;
        Ok(self.parser.get_u8())
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        self.need(4)?;
        Ok(self.parser.get_u32_le())
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        self.need(8)?;
        Ok(self.parser.get_u64_le())
    }

    fn bool(&mut self) -> Result<bool, CodecError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(CodecError::InvalidField {
                field: "bool",
                reason: "must be 0 or 1",
            }),
        }
    }

    fn opt_u64(&mut self) -> Result<Option<u64>, CodecError> {
        if self.bool()? {
            self.u64().map(Some)
        } else {
            Ok(None)
        }
    }

    fn group(&mut self) -> Result<GroupId, CodecError> {
        self.u64().map(GroupId::new)
    }

    fn term(&mut self) -> Result<TermId, CodecError> {
        self.u64().map(TermId::new)
    }

    fn node(&mut self) -> Result<NodeId, CodecError> {
        self.u64().map(NodeId::new)
    }

    fn offset(&mut self) -> Result<Offset, CodecError> {
        self.u64().map(Offset::new)
    }

    fn opt_offset(&mut self) -> Result<Option<Offset>, CodecError> {
        Ok(self.opt_u64()?.map(Offset::new))
    }

    fn opt_term(&mut self) -> Result<Option<TermId>, CodecError> {
        Ok(self.opt_u64()?.map(TermId::new))
    }

    fn batch(&mut self) -> Result<RecordBatch, CodecError> {
        Ok(RecordBatch::decode(&mut self.parser)?)
    }

    fn finish(self) -> Result<(), CodecError> {
        match self.parser.remaining() {
            0 => Ok(()),
            remaining => Err(CodecError::TrailingBytes { remaining }),
        }
    }
}

// ----------------------------------------------------------------------------
// Writing
// ----------------------------------------------------------------------------

fn put_opt(buf: &mut BytesMut, value: Option<u64>) {
    match value {
        Some(v) => {
            buf.put_u8(1);
            buf.put_u64_le(v);
        }
        None => buf.put_u8(0),
    }
}

fn put_opt_offset(buf: &mut BytesMut, offset: Option<Offset>) {
    put_opt(buf, offset.map(Offset::get));
}

fn put_opt_term(buf: &mut BytesMut, term: Option<TermId>) {
    put_opt(buf, term.map(TermId::get));
}

// ----------------------------------------------------------------------------
// Payloads
// ----------------------------------------------------------------------------

impl Payload for VoteRequest {
    const API_KEY: ApiKey = ApiKey::Vote;

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.group.get());
        buf.put_u64_le(self.term.get());
        buf.put_u64_le(self.candidate.get());
        put_opt_offset(buf, self.last_offset);
        put_opt_term(buf, self.last_term);
    }

    fn read(r: &mut FrameReader, _version: u16) -> Result<Self, CodecError> {
        Ok(Self {
            group: r.group()?,
            term: r.term()?,
            candidate: r.node()?,
            last_offset: r.opt_offset()?,
            last_term: r.opt_term()?,
        })
    }
}

impl Payload for VoteReply {
    const API_KEY: ApiKey = ApiKey::Vote;

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.group.get());
        buf.put_u64_le(self.term.get());
        buf.put_u64_le(self.node.get());
        buf.put_u8(u8::from(self.granted));
    }

    fn read(r: &mut FrameReader, _version: u16) -> Result<Self, CodecError> {
        Ok(Self {
            group: r.group()?,
            term: r.term()?,
            node: r.node()?,
            granted: r.bool()?,
        })
    }
}

impl Payload for AppendEntriesRequest {
    const API_KEY: ApiKey = ApiKey::AppendEntries;

    #[allow(clippy::cast_possible_truncation)] // Batch count bounded by APPEND_BATCH_COUNT_MAX.
    fn write(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.group.get());
        buf.put_u64_le(self.term.get());
        buf.put_u64_le(self.leader.get());
        put_opt_offset(buf, self.prev_offset);
        put_opt_term(buf, self.prev_term);
        put_opt_offset(buf, self.leader_commit);
        buf.put_u32_le(self.batches.len() as u32);
        for batch in &self.batches {
            batch.encode(buf);
        }
    }

    fn read(r: &mut FrameReader, _version: u16) -> Result<Self, CodecError> {
        let group = r.group()?;
        let term = r.term()?;
        let leader = r.node()?;
        let prev_offset = r.opt_offset()?;
        let prev_term = r.opt_term()?;
        let leader_commit = r.opt_offset()?;
        let count = r.u32()?;
        if count > APPEND_BATCH_COUNT_MAX {
            return Err(CodecError::InvalidField {
                field: "batch_count",
                reason: "exceeds maximum",
            });
        }
        let mut batches = Vec::with_capacity(count as usize);
        for _ in 0..count {
            batches.push(r.batch()?);
        }
        Ok(Self {
            group,
            term,
            leader,
            prev_offset,
            prev_term,
            leader_commit,
            batches,
        })
    }
}

impl Payload for AppendEntriesReply {
    const API_KEY: ApiKey = ApiKey::AppendEntries;

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.group.get());
        buf.put_u64_le(self.term.get());
        buf.put_u64_le(self.node.get());
        buf.put_u8(u8::from(self.success));
        put_opt_offset(buf, self.match_offset);
        put_opt_offset(buf, self.last_offset);
    }

    fn read(r: &mut FrameReader, _version: u16) -> Result<Self, CodecError> {
        Ok(Self {
            group: r.group()?,
            term: r.term()?,
            node: r.node()?,
            success: r.bool()?,
            match_offset: r.opt_offset()?,
            last_offset: r.opt_offset()?,
        })
    }
}

impl Payload for InstallSnapshotRequest {
    const API_KEY: ApiKey = ApiKey::InstallSnapshot;

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.group.get());
        buf.put_u64_le(self.term.get());
        buf.put_u64_le(self.leader.get());
        buf.put_u64_le(self.last_included_offset.get());
        buf.put_u64_le(self.last_included_term.get());
    }

    fn read(r: &mut FrameReader, _version: u16) -> Result<Self, CodecError> {
        Ok(Self {
            group: r.group()?,
            term: r.term()?,
            leader: r.node()?,
            last_included_offset: r.offset()?,
            last_included_term: r.term()?,
        })
    }
}

impl Payload for InstallSnapshotReply {
    const API_KEY: ApiKey = ApiKey::InstallSnapshot;

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.group.get());
        buf.put_u64_le(self.term.get());
        buf.put_u64_le(self.node.get());
        buf.put_u8(u8::from(self.success));
        buf.put_u64_le(self.match_offset.get());
    }

    fn read(r: &mut FrameReader, _version: u16) -> Result<Self, CodecError> {
        Ok(Self {
            group: r.group()?,
            term: r.term()?,
            node: r.node()?,
            success: r.bool()?,
            match_offset: r.offset()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{BatchType, RecordBatchBuilder};

    fn batch(base: u64, term: u64) -> RecordBatch {
        let mut batch = RecordBatchBuilder::new(BatchType::RaftData)
            .add_record(Some(IoBuf::from("k")), "v")
            .add_record(None, "w")
            .build()
            .unwrap();
        batch.assign(Offset::new(base), TermId::new(term));
        batch
    }

    #[test]
    fn test_append_entries_carries_batches() {
        let request = RaftRequest::AppendEntries(AppendEntriesRequest {
            group: GroupId::new(7),
            term: TermId::new(3),
            leader: NodeId::new(1),
            prev_offset: Some(Offset::new(9)),
            prev_term: Some(TermId::new(2)),
            leader_commit: None,
            batches: vec![batch(10, 3), batch(12, 3)],
        });
        let decoded = decode_request(encode_request(&request)).unwrap();
        let RaftRequest::AppendEntries(decoded) = decoded else {
            panic!("wrong variant");
        };
        assert_eq!(decoded.group, GroupId::new(7));
        assert_eq!(decoded.prev_offset, Some(Offset::new(9)));
        assert_eq!(decoded.leader_commit, None);
        assert_eq!(decoded.batches.len(), 2);
        assert_eq!(decoded.batches[1].base_offset(), Offset::new(12));
        assert_eq!(decoded.batches[1].body(), batch(12, 3).body());
    }

    #[test]
    fn test_replies_decode() {
        let replies = [
            RaftReply::Vote(VoteReply {
                group: GroupId::new(1),
                term: TermId::new(5),
                node: NodeId::new(2),
                granted: true,
            }),
            RaftReply::AppendEntries(AppendEntriesReply {
                group: GroupId::new(1),
                term: TermId::new(5),
                node: NodeId::new(2),
                success: false,
                match_offset: None,
                last_offset: Some(Offset::new(40)),
            }),
            RaftReply::InstallSnapshot(InstallSnapshotReply {
                group: GroupId::new(1),
                term: TermId::new(5),
                node: NodeId::new(3),
                success: true,
                match_offset: Offset::new(99),
            }),
        ];
        for reply in replies {
            assert_eq!(decode_reply(encode_reply(&reply)).unwrap(), reply);
        }
    }

    #[test]
    fn test_rejects_unknown_key_and_version() {
        let frame = Bytes::from_static(&[9, 1, 0]);
        assert_eq!(
            decode_request(frame).unwrap_err(),
            CodecError::UnknownApiKey { key: 9 }
        );

        let vote = RaftRequest::Vote(VoteRequest {
            group: GroupId::new(1),
            term: TermId::new(1),
            candidate: NodeId::new(1),
            last_offset: None,
            last_term: None,
        });
        let mut bytes = encode_request(&vote).to_vec();
        bytes[1] = 2;
        assert_eq!(
            decode_request(Bytes::from(bytes)).unwrap_err(),
            CodecError::UnsupportedVersion {
                api_key: 1,
                version: 2
            }
        );
    }

    #[test]
    fn test_rejects_truncated_and_trailing() {
        let vote = RaftRequest::Vote(VoteRequest {
            group: GroupId::new(1),
            term: TermId::new(1),
            candidate: NodeId::new(1),
            last_offset: Some(Offset::new(4)),
            last_term: Some(TermId::new(1)),
        });
        let bytes = encode_request(&vote);
        assert!(matches!(
            decode_request(bytes.slice(..bytes.len() - 1)),
            Err(CodecError::Truncated { .. })
        ));
        let mut long = bytes.to_vec();
        long.push(0);
        assert_eq!(
            decode_request(Bytes::from(long)).unwrap_err(),
            CodecError::TrailingBytes { remaining: 1 }
        );
    }

    #[test]
    fn test_damaged_batch_is_rejected() {
        let request = RaftRequest::AppendEntries(AppendEntriesRequest {
            group: GroupId::new(1),
            term: TermId::new(1),
            leader: NodeId::new(1),
            prev_offset: None,
            prev_term: None,
            leader_commit: None,
            batches: vec![batch(0, 1)],
        });
        let mut bytes = encode_request(&request).to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            decode_request(Bytes::from(bytes)),
            Err(CodecError::Batch(_))
        ));
    }
}
