//! Wire format for the single framed command channel shared by both peers.
//!
//! Every frame looks like `[8-byte LE total size][1-byte opcode][payload]`.
//! `total size` counts the header itself, so a frame with an empty payload
//! still declares a size of [`HEADER_SIZE`]. Two opcodes (`IndexFolder` and
//! `SyncComplete`/`SyncDone`/`Message`-style control frames) carry small
//! payloads entirely inside that declared size; `IndexPayload` carries only
//! its deletion-log header inside the frame and then streams two whole
//! index files directly over the socket as a nested sub-protocol, outside
//! the declared size. `PushFile`/`FetchFileRequest` use the same nested
//! file-stream format for the single file they move.

use anyhow::{bail, Context, Result};

use crate::buffer::GrowingBuffer;

/// Bytes occupied by the size field plus the opcode byte.
pub const HEADER_SIZE: u64 = 9;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCode {
    IndexFolder,
    IndexPayload,
    MkdirRequest,
    RmRequest,
    FetchFileRequest,
    PushFile,
    RemoteLocalCopy,
    Message,
    RmdirRequest,
    SyncComplete,
    SyncDone,
}

impl OpCode {
    pub fn wire_value(self) -> u8 {
        match self {
            OpCode::IndexFolder => 0,
            OpCode::IndexPayload => 1,
            OpCode::MkdirRequest => 2,
            OpCode::RmRequest => 3,
            OpCode::FetchFileRequest => 4,
            OpCode::PushFile => 5,
            OpCode::RemoteLocalCopy => 6,
            OpCode::Message => 7,
            OpCode::RmdirRequest => 8,
            OpCode::SyncComplete => 9,
            OpCode::SyncDone => 10,
        }
    }

    pub fn from_wire(value: u8) -> Result<Self> {
        Ok(match value {
            0 => OpCode::IndexFolder,
            1 => OpCode::IndexPayload,
            2 => OpCode::MkdirRequest,
            3 => OpCode::RmRequest,
            4 => OpCode::FetchFileRequest,
            5 => OpCode::PushFile,
            6 => OpCode::RemoteLocalCopy,
            7 => OpCode::Message,
            8 => OpCode::RmdirRequest,
            9 => OpCode::SyncComplete,
            10 => OpCode::SyncDone,
            other => bail!("unknown opcode byte {other}"),
        })
    }

    /// True for opcodes that mutate the receiving side's filesystem and so
    /// are only ever legal to receive while acting as Listener.
    pub fn is_mutation_request(self) -> bool {
        matches!(
            self,
            OpCode::MkdirRequest
                | OpCode::RmRequest
                | OpCode::RmdirRequest
                | OpCode::FetchFileRequest
                | OpCode::PushFile
                | OpCode::RemoteLocalCopy
        )
    }
}

/// Frame-size and string-length ceilings, configurable per session rather
/// than hard process-wide constants.
#[derive(Clone, Copy, Debug)]
pub struct ProtocolLimits {
    pub max_payload_size: u64,
    pub max_string_size: u64,
    pub max_file_size: u64,
}

impl Default for ProtocolLimits {
    fn default() -> Self {
        Self {
            max_payload_size: 64 * 1024 * 1024,
            max_string_size: 256 * 1024,
            max_file_size: 64 * 1024 * 1024 * 1024 - 1,
        }
    }
}

/// A fully-buffered control frame. The bulk bytes of a file stream never
/// live in here; those are read and written directly against the socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn empty(opcode: OpCode) -> Self {
        Self { opcode, payload: Vec::new() }
    }

    pub fn with_payload(opcode: OpCode, payload: Vec<u8>) -> Self {
        Self { opcode, payload }
    }

    pub fn total_size(&self) -> u64 {
        HEADER_SIZE + self.payload.len() as u64
    }

    /// Serializes header and payload into one contiguous buffer, ready to
    /// hand to the socket in `ProtocolLimits::max_payload_size`-sized chunks.
    pub fn encode(&self, limits: &ProtocolLimits) -> Result<Vec<u8>> {
        if self.payload.len() as u64 > limits.max_payload_size {
            bail!(
                "payload of {} bytes exceeds max_payload_size {}",
                self.payload.len(),
                limits.max_payload_size
            );
        }
        let mut buf = GrowingBuffer::new();
        buf.write_u64(self.total_size())?;
        buf.write_u8(self.opcode.wire_value())?;
        buf.write(&self.payload)?;
        Ok(buf.to_vec())
    }

    /// Reassembles a frame from an already-split header (size, opcode) and
    /// the payload bytes that followed it on the wire.
    pub fn from_parts(total_size: u64, opcode: OpCode, payload: Vec<u8>) -> Result<Self> {
        if HEADER_SIZE + payload.len() as u64 != total_size {
            bail!(
                "frame declared size {total_size} does not match header ({HEADER_SIZE}) plus payload ({})",
                payload.len()
            );
        }
        Ok(Self { opcode, payload })
    }
}

fn write_string(buf: &mut GrowingBuffer, s: &str) -> Result<()> {
    buf.write_u64(s.len() as u64)?;
    buf.write(s.as_bytes())?;
    Ok(())
}

fn read_string(buf: &mut GrowingBuffer, limits: &ProtocolLimits) -> Result<String> {
    let len = buf.read_u64()?;
    if len > limits.max_string_size {
        bail!("string length {len} exceeds max_string_size {}", limits.max_string_size);
    }
    let bytes = buf.read_vec(len as usize)?;
    String::from_utf8(bytes).context("frame payload contained non-utf8 string")
}

/// Builds a frame whose payload is a single path string: used for
/// `MkdirRequest`, `RmRequest`, `RmdirRequest` and `FetchFileRequest`.
pub fn encode_path_frame(opcode: OpCode, path: &str) -> Result<Frame> {
    let mut buf = GrowingBuffer::new();
    write_string(&mut buf, path)?;
    Ok(Frame::with_payload(opcode, buf.to_vec()))
}

pub fn decode_path_frame(frame: &Frame, limits: &ProtocolLimits) -> Result<String> {
    let mut buf = GrowingBuffer::from_bytes(&frame.payload)?;
    read_string(&mut buf, limits)
}

/// Builds a `RemoteLocalCopy` frame: source path then destination path,
/// both relative to the shared root.
pub fn encode_copy_frame(src: &str, dst: &str) -> Result<Frame> {
    let mut buf = GrowingBuffer::new();
    write_string(&mut buf, src)?;
    write_string(&mut buf, dst)?;
    Ok(Frame::with_payload(OpCode::RemoteLocalCopy, buf.to_vec()))
}

pub fn decode_copy_frame(frame: &Frame, limits: &ProtocolLimits) -> Result<(String, String)> {
    let mut buf = GrowingBuffer::from_bytes(&frame.payload)?;
    let src = read_string(&mut buf, limits)?;
    let dst = read_string(&mut buf, limits)?;
    Ok((src, dst))
}

/// Builds a `Message` frame carrying free text, used for diagnostics that
/// ride the same channel as the sync traffic.
pub fn encode_message_frame(text: &str) -> Result<Frame> {
    let mut buf = GrowingBuffer::new();
    write_string(&mut buf, text)?;
    Ok(Frame::with_payload(OpCode::Message, buf.to_vec()))
}

pub fn decode_message_frame(frame: &Frame, limits: &ProtocolLimits) -> Result<String> {
    let mut buf = GrowingBuffer::from_bytes(&frame.payload)?;
    read_string(&mut buf, limits)
}

/// Builds the `IndexPayload` header frame: the sender's folder path and its
/// deletion log. The two index files themselves are NOT part of this
/// payload; they follow immediately afterward as two raw file-stream
/// transfers layered directly on the socket.
pub fn encode_index_payload_header(remote_root: &str, deletions: &[String]) -> Result<Frame> {
    let mut buf = GrowingBuffer::new();
    write_string(&mut buf, remote_root)?;
    buf.write_u64(deletions.len() as u64)?;
    for path in deletions {
        write_string(&mut buf, path)?;
    }
    Ok(Frame::with_payload(OpCode::IndexPayload, buf.to_vec()))
}

pub fn decode_index_payload_header(
    frame: &Frame,
    limits: &ProtocolLimits,
) -> Result<(String, Vec<String>)> {
    let mut buf = GrowingBuffer::from_bytes(&frame.payload)?;
    let remote_root = read_string(&mut buf, limits)?;
    let count = buf.read_u64()?;
    let mut deletions = Vec::with_capacity(count as usize);
    for _ in 0..count {
        deletions.push(read_string(&mut buf, limits)?);
    }
    Ok((remote_root, deletions))
}

/// Header of the file-stream sub-protocol:
/// `path_len||path||mtime_len||mtime||file_size`, immediately followed by
/// `file_size` raw bytes. This sub-protocol is used standalone for
/// `PushFile`/`FetchFileRequest` and twice in a row after an
/// `IndexPayload` header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileStreamHeader {
    pub path: String,
    pub mtime: String,
    pub file_size: u64,
}

impl FileStreamHeader {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = GrowingBuffer::new();
        write_string(&mut buf, &self.path)?;
        write_string(&mut buf, &self.mtime)?;
        buf.write_u64(self.file_size)?;
        Ok(buf.to_vec())
    }

    pub fn decode(bytes: Vec<u8>, limits: &ProtocolLimits) -> Result<Self> {
        let mut buf = GrowingBuffer::from_bytes(&bytes)?;
        let path = read_string(&mut buf, limits)?;
        let mtime = read_string(&mut buf, limits)?;
        let file_size = buf.read_u64()?;
        if file_size > limits.max_file_size {
            bail!("file size {file_size} exceeds max_file_size {}", limits.max_file_size);
        }
        Ok(Self { path, mtime, file_size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_wire_values_round_trip() {
        for raw in 0u8..=10 {
            let op = OpCode::from_wire(raw).unwrap();
            assert_eq!(op.wire_value(), raw);
        }
        assert!(OpCode::from_wire(11).is_err());
    }

    #[test]
    fn empty_frame_round_trips_through_parts() {
        let limits = ProtocolLimits::default();
        let frame = Frame::empty(OpCode::SyncComplete);
        let encoded = frame.encode(&limits).unwrap();
        assert_eq!(encoded.len(), HEADER_SIZE as usize);
        let size = u64::from_le_bytes(encoded[0..8].try_into().unwrap());
        let opcode = OpCode::from_wire(encoded[8]).unwrap();
        let rebuilt = Frame::from_parts(size, opcode, Vec::new()).unwrap();
        assert_eq!(rebuilt, frame);
    }

    #[test]
    fn path_frame_round_trips() {
        let limits = ProtocolLimits::default();
        let frame = encode_path_frame(OpCode::RmRequest, "some/nested/path.txt").unwrap();
        let decoded = decode_path_frame(&frame, &limits).unwrap();
        assert_eq!(decoded, "some/nested/path.txt");
    }

    #[test]
    fn copy_frame_round_trips() {
        let limits = ProtocolLimits::default();
        let frame = encode_copy_frame("a/b.txt", "c/d.txt").unwrap();
        let (src, dst) = decode_copy_frame(&frame, &limits).unwrap();
        assert_eq!(src, "a/b.txt");
        assert_eq!(dst, "c/d.txt");
    }

    #[test]
    fn message_frame_round_trips() {
        let limits = ProtocolLimits::default();
        let frame = encode_message_frame("hello peer").unwrap();
        assert_eq!(decode_message_frame(&frame, &limits).unwrap(), "hello peer");
    }

    #[test]
    fn index_payload_header_round_trips_with_deletions() {
        let limits = ProtocolLimits::default();
        let deletions = vec!["gone.txt".to_string(), "also/gone.txt".to_string()];
        let frame = encode_index_payload_header("/home/user/shared", &deletions).unwrap();
        let (root, decoded_deletions) = decode_index_payload_header(&frame, &limits).unwrap();
        assert_eq!(root, "/home/user/shared");
        assert_eq!(decoded_deletions, deletions);
    }

    #[test]
    fn index_payload_header_round_trips_with_no_deletions() {
        let limits = ProtocolLimits::default();
        let frame = encode_index_payload_header("/root", &[]).unwrap();
        let (root, decoded_deletions) = decode_index_payload_header(&frame, &limits).unwrap();
        assert_eq!(root, "/root");
        assert!(decoded_deletions.is_empty());
    }

    #[test]
    fn file_stream_header_round_trips() {
        let limits = ProtocolLimits::default();
        let header = FileStreamHeader {
            path: "dir/file.bin".to_string(),
            mtime: "2026-07-28_10:30.00.000".to_string(),
            file_size: 4096,
        };
        let encoded = header.encode().unwrap();
        let decoded = FileStreamHeader::decode(encoded, &limits).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn oversized_string_is_rejected() {
        let limits = ProtocolLimits { max_string_size: 4, ..ProtocolLimits::default() };
        let frame = encode_path_frame(OpCode::RmRequest, "too long").unwrap();
        assert!(decode_path_frame(&frame, &limits).is_err());
    }

    #[test]
    fn oversized_file_size_is_rejected() {
        let limits = ProtocolLimits { max_file_size: 10, ..ProtocolLimits::default() };
        let header = FileStreamHeader {
            path: "big.bin".to_string(),
            mtime: "2026-07-28_10:30.00.000".to_string(),
            file_size: 4096,
        };
        let encoded = header.encode().unwrap();
        assert!(FileStreamHeader::decode(encoded, &limits).is_err());
    }

    #[test]
    fn file_size_exactly_at_max_is_accepted_one_over_is_rejected() {
        let limits = ProtocolLimits { max_file_size: 10, ..ProtocolLimits::default() };
        let at_max = FileStreamHeader {
            path: "exact.bin".to_string(),
            mtime: "2026-07-28_10:30.00.000".to_string(),
            file_size: 10,
        };
        assert!(FileStreamHeader::decode(at_max.encode().unwrap(), &limits).is_ok());

        let over_max = FileStreamHeader { file_size: 11, ..at_max };
        assert!(FileStreamHeader::decode(over_max.encode().unwrap(), &limits).is_err());
    }
}
