use thiserror::Error;

/// Magic prefix shared by every kestrel device snapshot blob.
const MAGIC: [u8; 4] = *b"KSTR";

/// Version of the outer TLV container itself (not of any device payload).
const FORMAT_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

/// Fixed header length: magic, format version, device id, device version.
const HEADER_LEN: usize = 4 + 4 + 4 + 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot blob does not start with the kestrel magic")]
    BadMagic,
    #[error("snapshot device id mismatch: expected {expected:?}, found {found:?}")]
    DeviceIdMismatch { expected: [u8; 4], found: [u8; 4] },
    #[error("unsupported snapshot major version {found} (supported: {supported})")]
    UnsupportedVersion { found: u16, supported: u16 },
    #[error("snapshot blob truncated")]
    Truncated,
    #[error("invalid snapshot field encoding: {0}")]
    InvalidFieldEncoding(&'static str),
    #[error("snapshot field has trailing bytes")]
    TrailingBytes,
}

pub type SnapshotResult<T> = Result<T, SnapshotError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotVersion {
    pub major: u16,
    pub minor: u16,
}

impl SnapshotVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

/// Serializes one device snapshot: a fixed header followed by TLV fields
/// (`tag: u16`, `len: u32`, payload bytes; all integers little-endian).
pub struct SnapshotWriter {
    buf: Vec<u8>,
}

impl SnapshotWriter {
    pub fn new(device_id: [u8; 4], device_version: SnapshotVersion) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&FORMAT_VERSION.major.to_le_bytes());
        buf.extend_from_slice(&FORMAT_VERSION.minor.to_le_bytes());
        buf.extend_from_slice(&device_id);
        buf.extend_from_slice(&device_version.major.to_le_bytes());
        buf.extend_from_slice(&device_version.minor.to_le_bytes());
        Self { buf }
    }

    pub fn field_bytes(&mut self, tag: u16, bytes: impl AsRef<[u8]>) {
        let bytes = bytes.as_ref();
        self.buf.extend_from_slice(&tag.to_le_bytes());
        self.buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(bytes);
    }

    pub fn field_u8(&mut self, tag: u16, value: u8) {
        self.field_bytes(tag, [value]);
    }

    pub fn field_u16(&mut self, tag: u16, value: u16) {
        self.field_bytes(tag, value.to_le_bytes());
    }

    pub fn field_u32(&mut self, tag: u16, value: u32) {
        self.field_bytes(tag, value.to_le_bytes());
    }

    pub fn field_u64(&mut self, tag: u16, value: u64) {
        self.field_bytes(tag, value.to_le_bytes());
    }

    pub fn field_i32(&mut self, tag: u16, value: i32) {
        self.field_bytes(tag, value.to_le_bytes());
    }

    pub fn field_bool(&mut self, tag: u16, value: bool) {
        self.field_u8(tag, value as u8);
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Parses a snapshot blob produced by [`SnapshotWriter`].
///
/// Unknown tags are retained and ignorable, so newer writers remain readable
/// by older devices within the same major version.
#[derive(Debug)]
pub struct SnapshotReader<'a> {
    device_version: SnapshotVersion,
    fields: Vec<(u16, &'a [u8])>,
}

impl<'a> SnapshotReader<'a> {
    pub fn parse(bytes: &'a [u8], expected_id: [u8; 4]) -> SnapshotResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(SnapshotError::Truncated);
        }
        if bytes[0..4] != MAGIC {
            return Err(SnapshotError::BadMagic);
        }
        let format_major = u16::from_le_bytes([bytes[4], bytes[5]]);
        if format_major != FORMAT_VERSION.major {
            return Err(SnapshotError::UnsupportedVersion {
                found: format_major,
                supported: FORMAT_VERSION.major,
            });
        }
        let found_id = [bytes[8], bytes[9], bytes[10], bytes[11]];
        if found_id != expected_id {
            return Err(SnapshotError::DeviceIdMismatch {
                expected: expected_id,
                found: found_id,
            });
        }
        let device_version = SnapshotVersion::new(
            u16::from_le_bytes([bytes[12], bytes[13]]),
            u16::from_le_bytes([bytes[14], bytes[15]]),
        );

        let mut fields = Vec::new();
        let mut rest = &bytes[HEADER_LEN..];
        while !rest.is_empty() {
            if rest.len() < 6 {
                return Err(SnapshotError::Truncated);
            }
            let tag = u16::from_le_bytes([rest[0], rest[1]]);
            let len = u32::from_le_bytes([rest[2], rest[3], rest[4], rest[5]]) as usize;
            rest = &rest[6..];
            if rest.len() < len {
                return Err(SnapshotError::Truncated);
            }
            fields.push((tag, &rest[..len]));
            rest = &rest[len..];
        }

        Ok(Self {
            device_version,
            fields,
        })
    }

    pub fn device_version(&self) -> SnapshotVersion {
        self.device_version
    }

    pub fn ensure_device_major(&self, supported: u16) -> SnapshotResult<()> {
        if self.device_version.major != supported {
            return Err(SnapshotError::UnsupportedVersion {
                found: self.device_version.major,
                supported,
            });
        }
        Ok(())
    }

    pub fn iter_fields(&self) -> impl Iterator<Item = (u16, &'a [u8])> + '_ {
        self.fields.iter().copied()
    }

    /// Returns the raw payload of the first field carrying `tag`, if present.
    pub fn bytes(&self, tag: u16) -> Option<&'a [u8]> {
        self.fields
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, payload)| *payload)
    }

    fn fixed<const N: usize>(&self, tag: u16, what: &'static str) -> SnapshotResult<Option<[u8; N]>> {
        match self.bytes(tag) {
            None => Ok(None),
            Some(payload) => {
                let arr: [u8; N] = payload
                    .try_into()
                    .map_err(|_| SnapshotError::InvalidFieldEncoding(what))?;
                Ok(Some(arr))
            }
        }
    }

    pub fn u8(&self, tag: u16) -> SnapshotResult<Option<u8>> {
        Ok(self.fixed::<1>(tag, "u8 field")?.map(|b| b[0]))
    }

    pub fn u16(&self, tag: u16) -> SnapshotResult<Option<u16>> {
        Ok(self.fixed::<2>(tag, "u16 field")?.map(u16::from_le_bytes))
    }

    pub fn u32(&self, tag: u16) -> SnapshotResult<Option<u32>> {
        Ok(self.fixed::<4>(tag, "u32 field")?.map(u32::from_le_bytes))
    }

    pub fn u64(&self, tag: u16) -> SnapshotResult<Option<u64>> {
        Ok(self.fixed::<8>(tag, "u64 field")?.map(u64::from_le_bytes))
    }

    pub fn i32(&self, tag: u16) -> SnapshotResult<Option<i32>> {
        Ok(self.fixed::<4>(tag, "i32 field")?.map(i32::from_le_bytes))
    }

    pub fn bool(&self, tag: u16) -> SnapshotResult<Option<bool>> {
        match self.u8(tag)? {
            None => Ok(None),
            Some(0) => Ok(Some(false)),
            Some(1) => Ok(Some(true)),
            Some(_) => Err(SnapshotError::InvalidFieldEncoding("bool field")),
        }
    }
}

/// Plain little-endian encode/decode helpers for nested field payloads.
pub mod codec {
    use super::{SnapshotError, SnapshotResult};

    /// Builder-style encoder for a single field payload.
    #[derive(Default)]
    pub struct Encoder {
        buf: Vec<u8>,
    }

    impl Encoder {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn u8(mut self, value: u8) -> Self {
            self.buf.push(value);
            self
        }

        pub fn u16(mut self, value: u16) -> Self {
            self.buf.extend_from_slice(&value.to_le_bytes());
            self
        }

        pub fn u32(mut self, value: u32) -> Self {
            self.buf.extend_from_slice(&value.to_le_bytes());
            self
        }

        pub fn u64(mut self, value: u64) -> Self {
            self.buf.extend_from_slice(&value.to_le_bytes());
            self
        }

        pub fn bool(self, value: bool) -> Self {
            self.u8(value as u8)
        }

        pub fn bytes(mut self, value: &[u8]) -> Self {
            self.buf.extend_from_slice(value);
            self
        }

        pub fn finish(self) -> Vec<u8> {
            self.buf
        }
    }

    /// Cursor-style decoder over a field payload.
    pub struct Decoder<'a> {
        rest: &'a [u8],
    }

    impl<'a> Decoder<'a> {
        pub fn new(payload: &'a [u8]) -> Self {
            Self { rest: payload }
        }

        pub fn bytes(&mut self, len: usize) -> SnapshotResult<&'a [u8]> {
            if self.rest.len() < len {
                return Err(SnapshotError::Truncated);
            }
            let (head, tail) = self.rest.split_at(len);
            self.rest = tail;
            Ok(head)
        }

        pub fn u8(&mut self) -> SnapshotResult<u8> {
            Ok(self.bytes(1)?[0])
        }

        pub fn u16(&mut self) -> SnapshotResult<u16> {
            let b = self.bytes(2)?;
            Ok(u16::from_le_bytes([b[0], b[1]]))
        }

        pub fn u32(&mut self) -> SnapshotResult<u32> {
            let b = self.bytes(4)?;
            Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        }

        pub fn u64(&mut self) -> SnapshotResult<u64> {
            let b = self.bytes(8)?;
            let mut arr = [0u8; 8];
            arr.copy_from_slice(b);
            Ok(u64::from_le_bytes(arr))
        }

        pub fn bool(&mut self) -> SnapshotResult<bool> {
            match self.u8()? {
                0 => Ok(false),
                1 => Ok(true),
                _ => Err(SnapshotError::InvalidFieldEncoding("bool")),
            }
        }

        /// Asserts the payload was fully consumed.
        pub fn finish(self) -> SnapshotResult<()> {
            if self.rest.is_empty() {
                Ok(())
            } else {
                Err(SnapshotError::TrailingBytes)
            }
        }
    }
}
