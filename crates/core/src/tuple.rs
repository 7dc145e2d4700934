//! Order-preserving tuple encoding.
//!
//! Keys in every index subspace are tuples: ordered sequences of typed
//! elements packed into bytes such that lexicographic comparison of the
//! packed form matches the logical ordering of the elements. The encoding
//! follows the well-known type-code convention of tuple-layer stores:
//!
//! | code | element |
//! |------|---------|
//! | 0x00 | null |
//! | 0x01 | byte string (0x00 escaped as 0x00 0xFF, 0x00 terminated) |
//! | 0x02 | utf-8 string (same escaping) |
//! | 0x05 | nested tuple (0x00 terminated, nested null as 0x00 0xFF) |
//! | 0x0c..=0x1c | integers, variable length, centered on 0x14 = zero |
//! | 0x20 | f32, sign-flipped IEEE bits |
//! | 0x21 | f64, sign-flipped IEEE bits |
//! | 0x26 / 0x27 | false / true |
//! | 0x30 | uuid, 16 raw bytes |
//! | 0x33 | versionstamp, 10 raw bytes |
//!
//! All multi-byte integers are big-endian so that numeric order equals byte
//! order, the same discipline the rest of the workspace applies to raw keys.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Key;

const NIL: u8 = 0x00;
const BYTES: u8 = 0x01;
const STRING: u8 = 0x02;
const NESTED: u8 = 0x05;
const INT_ZERO: u8 = 0x14;
const FLOAT: u8 = 0x20;
const DOUBLE: u8 = 0x21;
const FALSE: u8 = 0x26;
const TRUE: u8 = 0x27;
const UUID: u8 = 0x30;
const VERSIONSTAMP: u8 = 0x33;

const ESCAPE: u8 = 0xFF;

/// Size of a packed versionstamp
pub const VERSIONSTAMP_SIZE: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum TupleError {
    #[error("unexpected end of encoded tuple at offset {0}")]
    UnexpectedEnd(usize),

    #[error("key does not carry the expected subspace prefix")]
    PrefixMismatch,

    #[error("unknown type code {code:#04x} at offset {offset}")]
    UnknownTypeCode { code: u8, offset: usize },

    #[error("invalid utf-8 in string element at offset {0}")]
    InvalidUtf8(usize),

    #[error("integer element exceeds 64 bits")]
    IntegerOverflow,

    #[error("key carries no incomplete versionstamp")]
    MissingIncompleteVersionstamp,

    #[error("key carries more than one incomplete versionstamp")]
    MultipleIncompleteVersionstamps,
}

/// A 10-byte commit-time unique value: 8-byte big-endian commit version
/// followed by a 2-byte big-endian batch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Versionstamp([u8; VERSIONSTAMP_SIZE]);

impl Versionstamp {
    /// The placeholder substituted by the KVS at commit time.
    pub fn incomplete() -> Self {
        Self([0xFF; VERSIONSTAMP_SIZE])
    }

    pub fn complete(commit_version: u64, batch_order: u16) -> Self {
        let mut bytes = [0u8; VERSIONSTAMP_SIZE];
        bytes[..8].copy_from_slice(&commit_version.to_be_bytes());
        bytes[8..].copy_from_slice(&batch_order.to_be_bytes());
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; VERSIONSTAMP_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn try_from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; VERSIONSTAMP_SIZE] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn is_incomplete(&self) -> bool {
        self.0 == [0xFF; VERSIONSTAMP_SIZE]
    }

    pub fn commit_version(&self) -> u64 {
        u64::from_be_bytes(self.0[..8].try_into().unwrap())
    }

    pub fn batch_order(&self) -> u16 {
        u16::from_be_bytes(self.0[8..].try_into().unwrap())
    }

    pub fn as_bytes(&self) -> &[u8; VERSIONSTAMP_SIZE] {
        &self.0
    }
}

impl std::fmt::Display for Versionstamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A single element of a tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TupleElement {
    Null,
    Bytes(Vec<u8>),
    String(String),
    Int(i64),
    Float(f32),
    Double(f64),
    Bool(bool),
    Uuid(Uuid),
    Nested(Tuple),
    Versionstamp(Versionstamp),
}

impl From<i64> for TupleElement {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for TupleElement {
    fn from(value: i32) -> Self {
        Self::Int(value as i64)
    }
}

impl From<u32> for TupleElement {
    fn from(value: u32) -> Self {
        Self::Int(value as i64)
    }
}

impl From<&str> for TupleElement {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for TupleElement {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<u8>> for TupleElement {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<&[u8]> for TupleElement {
    fn from(value: &[u8]) -> Self {
        Self::Bytes(value.to_vec())
    }
}

impl From<bool> for TupleElement {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f32> for TupleElement {
    fn from(value: f32) -> Self {
        Self::Float(value)
    }
}

impl From<f64> for TupleElement {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<Uuid> for TupleElement {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl From<Versionstamp> for TupleElement {
    fn from(value: Versionstamp) -> Self {
        Self::Versionstamp(value)
    }
}

impl From<Tuple> for TupleElement {
    fn from(value: Tuple) -> Self {
        Self::Nested(value)
    }
}

impl TupleElement {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }
}

/// An ordered sequence of typed elements.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Tuple(Vec<TupleElement>);

impl Tuple {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_elements(elements: Vec<TupleElement>) -> Self {
        Self(elements)
    }

    pub fn single(element: impl Into<TupleElement>) -> Self {
        Self(vec![element.into()])
    }

    pub fn push(&mut self, element: impl Into<TupleElement>) {
        self.0.push(element.into());
    }

    /// Returns a new tuple with `element` appended.
    pub fn with(mut self, element: impl Into<TupleElement>) -> Self {
        self.push(element);
        self
    }

    /// Returns a new tuple with all elements of `other` appended.
    pub fn concat(mut self, other: &Tuple) -> Self {
        self.0.extend(other.0.iter().cloned());
        self
    }

    pub fn elements(&self) -> &[TupleElement] {
        &self.0
    }

    pub fn into_elements(self) -> Vec<TupleElement> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TupleElement> {
        self.0.get(index)
    }

    /// The first `n` elements as a new tuple.
    pub fn prefix(&self, n: usize) -> Tuple {
        Tuple(self.0.iter().take(n).cloned().collect())
    }

    /// The elements from position `n` onward as a new tuple.
    pub fn suffix(&self, n: usize) -> Tuple {
        Tuple(self.0.iter().skip(n).cloned().collect())
    }

    /// Pack into the order-preserving byte encoding.
    ///
    /// Incomplete versionstamps are packed as their literal 0xFF bytes; use
    /// [`Tuple::pack_with_versionstamp`] when the key is destined for a
    /// versionstamped mutation.
    pub fn pack(&self) -> Key {
        let mut out = Vec::new();
        for element in &self.0 {
            encode_element(element, &mut out, false);
        }
        out
    }

    /// Pack a key that carries exactly one incomplete versionstamp and
    /// append the 4-byte little-endian offset trailer the KVS consumes.
    pub fn pack_with_versionstamp(&self, prefix: &[u8]) -> Result<Key, TupleError> {
        let mut out = prefix.to_vec();
        let mut stamp_offset = None;

        for element in &self.0 {
            let at = find_incomplete(element, out.len());
            encode_element(element, &mut out, false);

            if let Some(at) = at {
                if stamp_offset.replace(at).is_some() {
                    return Err(TupleError::MultipleIncompleteVersionstamps);
                }
            }
        }

        let offset = stamp_offset.ok_or(TupleError::MissingIncompleteVersionstamp)?;
        out.extend_from_slice(&(offset as u32).to_le_bytes());
        Ok(out)
    }

    /// Decode a packed tuple.
    pub fn unpack(bytes: &[u8]) -> Result<Self, TupleError> {
        let mut elements = Vec::new();
        let mut pos = 0;

        while pos < bytes.len() {
            let (element, next) = decode_element(bytes, pos, false)?;
            elements.push(element);
            pos = next;
        }

        Ok(Self(elements))
    }
}

impl FromIterator<TupleElement> for Tuple {
    fn from_iter<I: IntoIterator<Item = TupleElement>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl std::fmt::Display for Tuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, element) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match element {
                TupleElement::Null => write!(f, "null")?,
                TupleElement::Bytes(b) => write!(f, "0x{}", hex::encode(b))?,
                TupleElement::String(s) => write!(f, "{s:?}")?,
                TupleElement::Int(v) => write!(f, "{v}")?,
                TupleElement::Float(v) => write!(f, "{v}f")?,
                TupleElement::Double(v) => write!(f, "{v}")?,
                TupleElement::Bool(v) => write!(f, "{v}")?,
                TupleElement::Uuid(v) => write!(f, "{v}")?,
                TupleElement::Nested(t) => write!(f, "{t}")?,
                TupleElement::Versionstamp(v) => write!(f, "@{v}")?,
            }
        }
        write!(f, ")")
    }
}

/// Byte offset of the incomplete versionstamp payload if `element` is one,
/// given that the element starts encoding at `base`.
fn find_incomplete(element: &TupleElement, base: usize) -> Option<usize> {
    match element {
        TupleElement::Versionstamp(stamp) if stamp.is_incomplete() => Some(base + 1),
        _ => None,
    }
}

fn encode_element(element: &TupleElement, out: &mut Vec<u8>, nested: bool) {
    match element {
        TupleElement::Null => {
            out.push(NIL);
            // inside a nested tuple the null byte would terminate the
            // tuple, so it carries the escape marker
            if nested {
                out.push(ESCAPE);
            }
        }
        TupleElement::Bytes(bytes) => {
            out.push(BYTES);
            encode_escaped(bytes, out);
        }
        TupleElement::String(string) => {
            out.push(STRING);
            encode_escaped(string.as_bytes(), out);
        }
        TupleElement::Int(value) => encode_int(*value, out),
        TupleElement::Float(value) => {
            out.push(FLOAT);
            let mut bits = value.to_bits();
            if bits >> 31 == 1 {
                bits = !bits;
            } else {
                bits ^= 1 << 31;
            }
            out.extend_from_slice(&bits.to_be_bytes());
        }
        TupleElement::Double(value) => {
            out.push(DOUBLE);
            let mut bits = value.to_bits();
            if bits >> 63 == 1 {
                bits = !bits;
            } else {
                bits ^= 1 << 63;
            }
            out.extend_from_slice(&bits.to_be_bytes());
        }
        TupleElement::Bool(value) => out.push(if *value { TRUE } else { FALSE }),
        TupleElement::Uuid(value) => {
            out.push(UUID);
            out.extend_from_slice(value.as_bytes());
        }
        TupleElement::Nested(tuple) => {
            out.push(NESTED);
            for child in tuple.elements() {
                encode_element(child, out, true);
            }
            out.push(NIL);
        }
        TupleElement::Versionstamp(stamp) => {
            out.push(VERSIONSTAMP);
            out.extend_from_slice(stamp.as_bytes());
        }
    }
}

fn encode_escaped(bytes: &[u8], out: &mut Vec<u8>) {
    for byte in bytes {
        out.push(*byte);
        if *byte == 0x00 {
            out.push(ESCAPE);
        }
    }
    out.push(0x00);
}

fn encode_int(value: i64, out: &mut Vec<u8>) {
    if value == 0 {
        out.push(INT_ZERO);
        return;
    }

    if value > 0 {
        let magnitude = value as u64;
        let len = byte_len(magnitude);
        out.push(INT_ZERO + len as u8);
        out.extend_from_slice(&magnitude.to_be_bytes()[8 - len..]);
    } else {
        // negatives are offset so that byte order matches numeric order:
        // encoded = value + (2^(8*len) - 1)
        let magnitude = (value as i128).unsigned_abs() as u64;
        let len = byte_len(magnitude);
        let offset = (1i128 << (8 * len)) - 1;
        let encoded = (value as i128 + offset) as u64;
        out.push(INT_ZERO - len as u8);
        out.extend_from_slice(&encoded.to_be_bytes()[8 - len..]);
    }
}

fn byte_len(magnitude: u64) -> usize {
    ((64 - magnitude.leading_zeros() as usize) + 7) / 8
}

fn decode_element(
    bytes: &[u8],
    pos: usize,
    nested: bool,
) -> Result<(TupleElement, usize), TupleError> {
    let code = *bytes.get(pos).ok_or(TupleError::UnexpectedEnd(pos))?;
    let pos = pos + 1;

    match code {
        NIL => Ok((TupleElement::Null, if nested { pos + 1 } else { pos })),
        BYTES => {
            let (data, next) = decode_escaped(bytes, pos)?;
            Ok((TupleElement::Bytes(data), next))
        }
        STRING => {
            let (data, next) = decode_escaped(bytes, pos)?;
            let string =
                String::from_utf8(data).map_err(|_| TupleError::InvalidUtf8(pos))?;
            Ok((TupleElement::String(string), next))
        }
        NESTED => {
            let mut children = Vec::new();
            let mut cursor = pos;

            loop {
                match bytes.get(cursor) {
                    None => return Err(TupleError::UnexpectedEnd(cursor)),
                    // 0x00 0xFF is an escaped nested null, plain 0x00 ends
                    // the nested tuple
                    Some(&NIL) if bytes.get(cursor + 1) != Some(&ESCAPE) => {
                        return Ok((
                            TupleElement::Nested(Tuple(children)),
                            cursor + 1,
                        ));
                    }
                    Some(_) => {
                        let (child, next) = decode_element(bytes, cursor, true)?;
                        children.push(child);
                        cursor = next;
                    }
                }
            }
        }
        code if (0x0c..=0x1c).contains(&code) => {
            let (value, next) = decode_int(bytes, pos, code)?;
            Ok((TupleElement::Int(value), next))
        }
        FLOAT => {
            let raw = bytes
                .get(pos..pos + 4)
                .ok_or(TupleError::UnexpectedEnd(pos))?;
            let mut bits = u32::from_be_bytes(raw.try_into().unwrap());
            if bits >> 31 == 1 {
                bits ^= 1 << 31;
            } else {
                bits = !bits;
            }
            Ok((TupleElement::Float(f32::from_bits(bits)), pos + 4))
        }
        DOUBLE => {
            let raw = bytes
                .get(pos..pos + 8)
                .ok_or(TupleError::UnexpectedEnd(pos))?;
            let mut bits = u64::from_be_bytes(raw.try_into().unwrap());
            if bits >> 63 == 1 {
                bits ^= 1 << 63;
            } else {
                bits = !bits;
            }
            Ok((TupleElement::Double(f64::from_bits(bits)), pos + 8))
        }
        FALSE => Ok((TupleElement::Bool(false), pos)),
        TRUE => Ok((TupleElement::Bool(true), pos)),
        UUID => {
            let raw = bytes
                .get(pos..pos + 16)
                .ok_or(TupleError::UnexpectedEnd(pos))?;
            let uuid = Uuid::from_bytes(raw.try_into().unwrap());
            Ok((TupleElement::Uuid(uuid), pos + 16))
        }
        VERSIONSTAMP => {
            let raw = bytes
                .get(pos..pos + VERSIONSTAMP_SIZE)
                .ok_or(TupleError::UnexpectedEnd(pos))?;
            let stamp = Versionstamp::try_from_slice(raw).unwrap();
            Ok((
                TupleElement::Versionstamp(stamp),
                pos + VERSIONSTAMP_SIZE,
            ))
        }
        code => Err(TupleError::UnknownTypeCode {
            code,
            offset: pos - 1,
        }),
    }
}

fn decode_escaped(bytes: &[u8], pos: usize) -> Result<(Vec<u8>, usize), TupleError> {
    let mut out = Vec::new();
    let mut cursor = pos;

    loop {
        match bytes.get(cursor) {
            None => return Err(TupleError::UnexpectedEnd(cursor)),
            Some(&0x00) => {
                if bytes.get(cursor + 1) == Some(&ESCAPE) {
                    out.push(0x00);
                    cursor += 2;
                } else {
                    return Ok((out, cursor + 1));
                }
            }
            Some(byte) => {
                out.push(*byte);
                cursor += 1;
            }
        }
    }
}

fn decode_int(bytes: &[u8], pos: usize, code: u8) -> Result<(i64, usize), TupleError> {
    if code == INT_ZERO {
        return Ok((0, pos));
    }

    let positive = code > INT_ZERO;
    let len = if positive {
        (code - INT_ZERO) as usize
    } else {
        (INT_ZERO - code) as usize
    };

    let raw = bytes
        .get(pos..pos + len)
        .ok_or(TupleError::UnexpectedEnd(pos))?;

    let mut magnitude = [0u8; 8];
    magnitude[8 - len..].copy_from_slice(raw);
    let magnitude = u64::from_be_bytes(magnitude);

    let value = if positive {
        i64::try_from(magnitude).map_err(|_| TupleError::IntegerOverflow)?
    } else {
        let offset = (1i128 << (8 * len)) - 1;
        let value = magnitude as i128 - offset;
        i64::try_from(value).map_err(|_| TupleError::IntegerOverflow)?
    };

    Ok((value, pos + len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(tuple: Tuple) {
        let packed = tuple.pack();
        let unpacked = Tuple::unpack(&packed).unwrap();
        assert_eq!(tuple, unpacked);
    }

    #[test]
    fn test_scalar_roundtrips() {
        roundtrip(Tuple::new().with(0i64));
        roundtrip(Tuple::new().with(1i64).with(-1i64).with(255i64).with(-255i64));
        roundtrip(Tuple::new().with(i64::MAX).with(i64::MIN));
        roundtrip(Tuple::new().with("hello").with(""));
        roundtrip(Tuple::new().with(b"\x00\x01\xff".as_slice()));
        roundtrip(Tuple::new().with(true).with(false));
        roundtrip(Tuple::new().with(3.5f64).with(-0.25f64).with(2.5f32));
        roundtrip(Tuple::new().with(TupleElement::Null));
        roundtrip(Tuple::new().with(Uuid::from_bytes([7u8; 16])));
        roundtrip(Tuple::new().with(Versionstamp::complete(42, 3)));
    }

    #[test]
    fn test_nested_roundtrip() {
        let inner = Tuple::new()
            .with(TupleElement::Null)
            .with("x")
            .with(-7i64);
        roundtrip(Tuple::new().with(inner).with(9i64));
    }

    #[test]
    fn test_int_order_matches_byte_order() {
        let values = [
            i64::MIN,
            -65536,
            -256,
            -255,
            -2,
            -1,
            0,
            1,
            2,
            255,
            256,
            65535,
            i64::MAX,
        ];

        let packed: Vec<_> = values
            .iter()
            .map(|v| Tuple::new().with(*v).pack())
            .collect();

        for window in packed.windows(2) {
            assert!(window[0] < window[1], "{:?} !< {:?}", window[0], window[1]);
        }
    }

    #[test]
    fn test_double_order_matches_byte_order() {
        let values = [f64::NEG_INFINITY, -2.5, -0.0, 0.0, 1e-9, 3.25, f64::INFINITY];

        let packed: Vec<_> = values
            .iter()
            .map(|v| Tuple::new().with(*v).pack())
            .collect();

        for window in packed.windows(2) {
            assert!(window[0] <= window[1]);
        }
    }

    #[test]
    fn test_string_order_matches_byte_order() {
        let a = Tuple::new().with("alpha").pack();
        let b = Tuple::new().with("beta").pack();
        assert!(a < b);
    }

    #[test]
    fn test_escaped_zero_preserves_prefix_order() {
        let a = Tuple::new().with(b"a\x00b".as_slice()).pack();
        let b = Tuple::new().with(b"a\x00c".as_slice()).pack();
        assert!(a < b);
    }

    #[test]
    fn test_versionstamp_placeholder_offset() {
        let tuple = Tuple::new()
            .with("history")
            .with(Versionstamp::incomplete());

        let packed = tuple.pack_with_versionstamp(b"PF").unwrap();

        let trailer = &packed[packed.len() - 4..];
        let offset = u32::from_le_bytes(trailer.try_into().unwrap()) as usize;

        assert_eq!(
            &packed[offset..offset + VERSIONSTAMP_SIZE],
            [0xFF; VERSIONSTAMP_SIZE]
        );
    }

    #[test]
    fn test_versionstamp_placeholder_required() {
        let tuple = Tuple::new().with("history");
        assert!(matches!(
            tuple.pack_with_versionstamp(b""),
            Err(TupleError::MissingIncompleteVersionstamp)
        ));

        let tuple = Tuple::new()
            .with(Versionstamp::incomplete())
            .with(Versionstamp::incomplete());
        assert!(matches!(
            tuple.pack_with_versionstamp(b""),
            Err(TupleError::MultipleIncompleteVersionstamps)
        ));
    }

    #[test]
    fn test_versionstamp_ordering() {
        let a = Versionstamp::complete(1, 0);
        let b = Versionstamp::complete(1, 1);
        let c = Versionstamp::complete(2, 0);
        assert!(a < b && b < c);
        assert!(c < Versionstamp::incomplete());
    }
}
