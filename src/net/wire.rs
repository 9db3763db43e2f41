use rkyv::{
    ser::serializers::AllocSerializer, validation::validators::DefaultValidator,
    de::deserializers::SharedDeserializeMap, AlignedVec, Archive, CheckBytes,
    Deserialize, Serialize,
};
use std::io::Read;

use thiserror::Error;

use crate::partition::{PartitionId, TenantId};

/// Scratch space handed to the rkyv serializer before it spills to the heap.
const SCRATCH: usize = 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("could not encode {0}")]
    Encode(&'static str),
    #[error("could not decode {0}")]
    Decode(&'static str),
    #[error("could not decompress frame body: {0}")]
    Decompress(String),
    #[error("could not compress frame body: {0}")]
    Compress(String),
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("frame body of {0} bytes exceeds the limit")]
    TooLarge(usize),
}

/// Anything that can travel inside a frame section. Implemented for every
/// type that archives with validation through rkyv, which is what
/// `#[derive(Archive, Serialize, Deserialize)]` plus `#[archive(check_bytes)]`
/// produces.
pub trait Wire: Sized {
    fn to_wire(&self) -> Result<AlignedVec, WireError>;
    fn from_wire(bytes: &[u8]) -> Result<Self, WireError>;
}

impl<T> Wire for T
where
    T: Archive + Serialize<AllocSerializer<SCRATCH>>,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>>
        + Deserialize<T, SharedDeserializeMap>,
{
    fn to_wire(&self) -> Result<AlignedVec, WireError> {
        rkyv::to_bytes::<_, SCRATCH>(self)
            .map_err(|_| WireError::Encode(std::any::type_name::<T>()))
    }

    fn from_wire(bytes: &[u8]) -> Result<Self, WireError> {
        // sections sit at arbitrary offsets, archives need alignment
        let mut aligned = AlignedVec::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<T>(&aligned)
            .map_err(|_| WireError::Decode(std::any::type_name::<T>()))
    }
}

/// The first byte of every frame. The first bit says whether the body is
/// zstd-compressed, the second whether a report section follows the payload.
/// The last 6 bits hold the frame kind.
///
/// - `compressed && has_report` => body must be inflated, last section is
///   the report
/// - `compressed && !has_report` => body must be inflated, no report
/// - `!compressed && has_report` => raw sections, last one is the report
/// - `!compressed && !has_report` => raw sections only
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FramePrefix(u8);

impl FramePrefix {
    pub fn new(compressed: bool, has_report: bool, kind: FrameKind) -> Self {
        let mut prefix = 0b0000_0000;
        if compressed {
            prefix |= 0b1000_0000;
        }
        if has_report {
            prefix |= 0b0100_0000;
        }
        prefix |= kind as u8;
        Self(prefix)
    }

    pub fn compressed(&self) -> bool {
        self.0 & 0b1000_0000 != 0
    }

    pub fn has_report(&self) -> bool {
        self.0 & 0b0100_0000 != 0
    }

    pub fn kind(&self) -> Result<FrameKind, WireError> {
        FrameKind::try_from(self.0 & 0b0011_1111)
    }

    pub fn byte(&self) -> u8 {
        self.0
    }
}

impl From<u8> for FramePrefix {
    fn from(byte: u8) -> Self {
        Self(byte)
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// header | request | report?
    Request = 1,
    /// answer | report?
    Response = 2,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameKind::Request),
            2 => Ok(FrameKind::Response),
            _ => Err(WireError::Malformed("unknown frame kind")),
        }
    }
}

/// Routing facts that travel with every remote read.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct RequestHeader {
    pub tenant: String,
    pub partition: u64,
    /// Opaque authorization expression, evaluated by the host's index.
    pub authorization: String,
}

impl RequestHeader {
    pub fn new(
        tenant: &TenantId,
        partition: PartitionId,
        authorization: &str,
    ) -> Self {
        Self {
            tenant: tenant.as_str().to_owned(),
            partition: partition.0,
            authorization: authorization.to_owned(),
        }
    }

    pub fn tenant(&self) -> TenantId {
        TenantId::new(self.tenant.clone())
    }

    pub fn partition(&self) -> PartitionId {
        PartitionId(self.partition)
    }
}

/// Compression applied to frame bodies after serialization.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Zstd(i32),
}

impl Compression {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Compression::None)
    }
}

/// A fully decoded request frame.
pub struct RequestFrame<Q, R> {
    pub compressed: bool,
    pub header: RequestHeader,
    pub request: Q,
    pub report: Option<R>,
}

pub fn encode_request<Q: Wire, R: Wire>(
    header: &RequestHeader,
    request: &Q,
    report: Option<&R>,
    compression: Compression,
) -> Result<Vec<u8>, WireError> {
    let mut body = Vec::new();
    put_section(&mut body, &header.to_wire()?);
    put_section(&mut body, &request.to_wire()?);
    if let Some(report) = report {
        put_section(&mut body, &report.to_wire()?);
    }
    seal(FrameKind::Request, report.is_some(), body, compression)
}

/// Decodes a request frame whose body, once inflated, is at most `limit`
/// bytes.
pub fn decode_request<Q: Wire, R: Wire>(
    frame: &[u8],
    limit: usize,
) -> Result<RequestFrame<Q, R>, WireError> {
    let (prefix, body) = open(frame, FrameKind::Request, limit)?;
    let mut rest = body.as_slice();
    let header = RequestHeader::from_wire(take_section(&mut rest)?)?;
    let request = Q::from_wire(take_section(&mut rest)?)?;
    let report = if prefix.has_report() {
        Some(R::from_wire(take_section(&mut rest)?)?)
    } else {
        None
    };
    if !rest.is_empty() {
        return Err(WireError::Malformed("trailing bytes after request"));
    }
    Ok(RequestFrame {
        compressed: prefix.compressed(),
        header,
        request,
        report,
    })
}

pub fn encode_response<A: Wire, R: Wire>(
    answer: &A,
    report: Option<&R>,
    compression: Compression,
) -> Result<Vec<u8>, WireError> {
    let mut body = Vec::new();
    put_section(&mut body, &answer.to_wire()?);
    if let Some(report) = report {
        put_section(&mut body, &report.to_wire()?);
    }
    seal(FrameKind::Response, report.is_some(), body, compression)
}

pub fn decode_response<A: Wire, R: Wire>(
    frame: &[u8],
    limit: usize,
) -> Result<(A, Option<R>), WireError> {
    let (prefix, body) = open(frame, FrameKind::Response, limit)?;
    let mut rest = body.as_slice();
    let answer = A::from_wire(take_section(&mut rest)?)?;
    let report = if prefix.has_report() {
        Some(R::from_wire(take_section(&mut rest)?)?)
    } else {
        None
    };
    if !rest.is_empty() {
        return Err(WireError::Malformed("trailing bytes after response"));
    }
    Ok((answer, report))
}

/// Writes `varint(len) | bytes`.
pub fn put_section(buf: &mut Vec<u8>, bytes: &[u8]) {
    let mut len = unsigned_varint::encode::usize_buffer();
    buf.extend_from_slice(unsigned_varint::encode::usize(bytes.len(), &mut len));
    buf.extend_from_slice(bytes);
}

/// Splits one `varint(len) | bytes` section off the front of `buf`.
pub fn take_section<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], WireError> {
    let current: &'a [u8] = *buf;
    let (len, rest) = unsigned_varint::decode::usize(current)
        .map_err(|_| WireError::Malformed("bad section length"))?;
    if rest.len() < len {
        return Err(WireError::Malformed("truncated section"));
    }
    let (section, rest) = rest.split_at(len);
    *buf = rest;
    Ok(section)
}

fn seal(
    kind: FrameKind,
    has_report: bool,
    body: Vec<u8>,
    compression: Compression,
) -> Result<Vec<u8>, WireError> {
    let body = match compression {
        Compression::None => body,
        Compression::Zstd(level) => zstd::bulk::compress(&body, level)
            .map_err(|e| WireError::Compress(e.to_string()))?,
    };
    let prefix = FramePrefix::new(compression.is_enabled(), has_report, kind);
    let mut frame = Vec::with_capacity(body.len() + 1);
    frame.push(prefix.byte());
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn open(
    frame: &[u8],
    expected: FrameKind,
    limit: usize,
) -> Result<(FramePrefix, Vec<u8>), WireError> {
    let (&first, body) = frame
        .split_first()
        .ok_or(WireError::Malformed("empty frame"))?;
    let prefix = FramePrefix::from(first);
    if prefix.kind()? != expected {
        return Err(WireError::Malformed("unexpected frame kind"));
    }
    let body = if prefix.compressed() {
        inflate(body, limit)?
    } else if body.len() > limit {
        return Err(WireError::TooLarge(body.len()));
    } else {
        body.to_vec()
    };
    Ok((prefix, body))
}

/// Inflates a zstd body, stopping one byte past `limit`.
fn inflate(body: &[u8], limit: usize) -> Result<Vec<u8>, WireError> {
    let decoder = zstd::stream::read::Decoder::new(body)
        .map_err(|e| WireError::Decompress(e.to_string()))?;
    let mut inflated = Vec::new();
    decoder
        .take(limit as u64 + 1)
        .read_to_end(&mut inflated)
        .map_err(|e| WireError::Decompress(e.to_string()))?;
    if inflated.len() > limit {
        return Err(WireError::TooLarge(inflated.len()));
    }
    Ok(inflated)
}
