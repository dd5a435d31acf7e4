// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! OPC UA binary encoding primitives.
//!
//! All integers are little-endian. Strings and byte strings carry an `Int32`
//! length prefix where `-1` encodes null. Arrays use the same prefix for
//! their element count.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};

use crate::error::CodecError;

/// Offset between the OPC UA epoch (1601-01-01) and the Unix epoch in 100ns ticks.
pub const EPOCH_OFFSET: i64 = 116_444_736_000_000_000;

// =============================================================================
// Traits
// =============================================================================

/// A value that can be written in OPC UA binary form.
pub trait BinaryEncodable {
    /// Number of bytes [`encode`](Self::encode) will write.
    fn length_in_bytes(&self) -> usize;

    /// Appends the encoded value to `buf`.
    fn encode(&self, buf: &mut BytesMut);

    /// Encodes into a fresh buffer.
    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.length_in_bytes());
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// A value that can be read from OPC UA binary form.
pub trait BinaryDecodable: Sized {
    /// Reads a value, advancing `buf` past it.
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError>;

    /// Decodes a value from a byte slice.
    fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut buf = Bytes::copy_from_slice(bytes);
        Self::decode(&mut buf)
    }
}

/// Fails unless `needed` bytes remain.
#[inline]
pub(crate) fn ensure(buf: &Bytes, needed: usize, field: &'static str) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::eof(field, needed, buf.remaining()));
    }
    Ok(())
}

/// Reads an `Int32` length prefix; `None` for null.
fn read_length(buf: &mut Bytes, field: &'static str) -> Result<Option<usize>, CodecError> {
    ensure(buf, 4, field)?;
    let length = buf.get_i32_le();
    match length {
        -1 => Ok(None),
        n if n < -1 => Err(CodecError::invalid_value(field, format!("negative length {}", n))),
        n => {
            let n = n as usize;
            ensure(buf, n, field)?;
            Ok(Some(n))
        }
    }
}

// =============================================================================
// Primitives
// =============================================================================

macro_rules! impl_primitive {
    ($ty:ty, $size:expr, $put:ident, $get:ident) => {
        impl BinaryEncodable for $ty {
            #[inline]
            fn length_in_bytes(&self) -> usize {
                $size
            }

            #[inline]
            fn encode(&self, buf: &mut BytesMut) {
                buf.$put(*self);
            }
        }

        impl BinaryDecodable for $ty {
            #[inline]
            fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
                ensure(buf, $size, stringify!($ty))?;
                Ok(buf.$get())
            }
        }
    };
}

impl_primitive!(u8, 1, put_u8, get_u8);
impl_primitive!(u16, 2, put_u16_le, get_u16_le);
impl_primitive!(u32, 4, put_u32_le, get_u32_le);
impl_primitive!(i32, 4, put_i32_le, get_i32_le);
impl_primitive!(i64, 8, put_i64_le, get_i64_le);
impl_primitive!(f64, 8, put_f64_le, get_f64_le);

impl BinaryEncodable for bool {
    fn length_in_bytes(&self) -> usize {
        1
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(*self));
    }
}

impl BinaryDecodable for bool {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(u8::decode(buf)? != 0)
    }
}

// =============================================================================
// Strings and byte strings
// =============================================================================

impl BinaryEncodable for Option<String> {
    fn length_in_bytes(&self) -> usize {
        4 + self.as_ref().map_or(0, String::len)
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Some(s) => {
                buf.put_i32_le(s.len() as i32);
                buf.put_slice(s.as_bytes());
            }
            None => buf.put_i32_le(-1),
        }
    }
}

impl BinaryDecodable for Option<String> {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        match read_length(buf, "String")? {
            None => Ok(None),
            Some(n) => {
                let raw = buf.split_to(n);
                String::from_utf8(raw.to_vec())
                    .map(Some)
                    .map_err(|e| CodecError::invalid_value("String", e.to_string()))
            }
        }
    }
}

impl BinaryEncodable for String {
    fn length_in_bytes(&self) -> usize {
        4 + self.len()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.len() as i32);
        buf.put_slice(self.as_bytes());
    }
}

impl BinaryDecodable for String {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Option::<String>::decode(buf)?.unwrap_or_default())
    }
}

impl BinaryEncodable for Option<Bytes> {
    fn length_in_bytes(&self) -> usize {
        4 + self.as_ref().map_or(0, Bytes::len)
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Some(b) => {
                buf.put_i32_le(b.len() as i32);
                buf.put_slice(b);
            }
            None => buf.put_i32_le(-1),
        }
    }
}

impl BinaryDecodable for Option<Bytes> {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(read_length(buf, "ByteString")?.map(|n| buf.split_to(n)))
    }
}

// =============================================================================
// Arrays
// =============================================================================

impl<T: BinaryEncodable> BinaryEncodable for Vec<T> {
    fn length_in_bytes(&self) -> usize {
        4 + self.iter().map(BinaryEncodable::length_in_bytes).sum::<usize>()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.len() as i32);
        for item in self {
            item.encode(buf);
        }
    }
}

impl<T: BinaryDecodable> BinaryDecodable for Vec<T> {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        ensure(buf, 4, "Array")?;
        let count = buf.get_i32_le();
        if count <= 0 {
            return Ok(Vec::new());
        }
        let count = count as usize;
        // every element occupies at least one byte
        ensure(buf, count, "Array")?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(T::decode(buf)?);
        }
        Ok(items)
    }
}

// =============================================================================
// DateTime
// =============================================================================

/// Converts a UTC timestamp to OPC UA ticks.
pub fn to_ua_datetime(time: DateTime<Utc>) -> i64 {
    time.timestamp_nanos_opt()
        .map(|nanos| nanos / 100 + EPOCH_OFFSET)
        .unwrap_or(0)
}

/// Converts OPC UA ticks to a UTC timestamp.
pub fn from_ua_datetime(ticks: i64) -> Option<DateTime<Utc>> {
    if ticks <= 0 {
        return None;
    }
    let unix_ticks = ticks - EPOCH_OFFSET;
    Utc.timestamp_opt(
        unix_ticks.div_euclid(10_000_000),
        (unix_ticks.rem_euclid(10_000_000) * 100) as u32,
    )
    .single()
}

/// Current time in OPC UA ticks.
pub fn ua_now() -> i64 {
    to_ua_datetime(Utc::now())
}

// =============================================================================
// NodeId
// =============================================================================

/// Identifier part of a [`NodeId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    /// Numeric identifier.
    Numeric(u32),
    /// String identifier.
    String(String),
    /// GUID identifier.
    Guid([u8; 16]),
    /// Opaque identifier.
    Opaque(Bytes),
}

/// An OPC UA node identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId {
    /// Namespace index.
    pub namespace: u16,
    /// Identifier.
    pub identifier: Identifier,
}

impl NodeId {
    /// Creates a numeric node id.
    pub const fn numeric(namespace: u16, value: u32) -> Self {
        Self {
            namespace,
            identifier: Identifier::Numeric(value),
        }
    }

    /// Creates an opaque node id.
    pub fn opaque(namespace: u16, value: impl Into<Bytes>) -> Self {
        Self {
            namespace,
            identifier: Identifier::Opaque(value.into()),
        }
    }

    /// The null node id `ns=0;i=0`.
    pub const fn null() -> Self {
        Self::numeric(0, 0)
    }

    /// Returns `true` for the null node id.
    pub fn is_null(&self) -> bool {
        self.namespace == 0 && self.identifier == Identifier::Numeric(0)
    }

    /// Returns the numeric value in namespace 0, if any.
    pub fn as_ns0_numeric(&self) -> Option<u32> {
        match self.identifier {
            Identifier::Numeric(value) if self.namespace == 0 => Some(value),
            _ => None,
        }
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ns={};", self.namespace)?;
        match &self.identifier {
            Identifier::Numeric(v) => write!(f, "i={}", v),
            Identifier::String(v) => write!(f, "s={}", v),
            Identifier::Guid(v) => {
                write!(f, "g=")?;
                for b in v {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
            Identifier::Opaque(v) => write!(f, "b=<{} bytes>", v.len()),
        }
    }
}

impl BinaryEncodable for NodeId {
    fn length_in_bytes(&self) -> usize {
        match &self.identifier {
            Identifier::Numeric(v) if self.namespace == 0 && *v <= 0xFF => 2,
            Identifier::Numeric(v) if self.namespace <= 0xFF && *v <= 0xFFFF => 4,
            Identifier::Numeric(_) => 7,
            Identifier::String(s) => 3 + s.length_in_bytes(),
            Identifier::Guid(_) => 3 + 16,
            Identifier::Opaque(b) => 3 + 4 + b.len(),
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        match &self.identifier {
            Identifier::Numeric(v) if self.namespace == 0 && *v <= 0xFF => {
                buf.put_u8(0x00);
                buf.put_u8(*v as u8);
            }
            Identifier::Numeric(v) if self.namespace <= 0xFF && *v <= 0xFFFF => {
                buf.put_u8(0x01);
                buf.put_u8(self.namespace as u8);
                buf.put_u16_le(*v as u16);
            }
            Identifier::Numeric(v) => {
                buf.put_u8(0x02);
                buf.put_u16_le(self.namespace);
                buf.put_u32_le(*v);
            }
            Identifier::String(s) => {
                buf.put_u8(0x03);
                buf.put_u16_le(self.namespace);
                s.encode(buf);
            }
            Identifier::Guid(g) => {
                buf.put_u8(0x04);
                buf.put_u16_le(self.namespace);
                buf.put_slice(g);
            }
            Identifier::Opaque(b) => {
                buf.put_u8(0x05);
                buf.put_u16_le(self.namespace);
                Some(b.clone()).encode(buf);
            }
        }
    }
}

impl BinaryDecodable for NodeId {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let mask = u8::decode(buf)?;
        let node_id = match mask & 0x0F {
            0x00 => NodeId::numeric(0, u32::from(u8::decode(buf)?)),
            0x01 => {
                let namespace = u16::from(u8::decode(buf)?);
                NodeId::numeric(namespace, u32::from(u16::decode(buf)?))
            }
            0x02 => {
                let namespace = u16::decode(buf)?;
                NodeId::numeric(namespace, u32::decode(buf)?)
            }
            0x03 => {
                let namespace = u16::decode(buf)?;
                NodeId {
                    namespace,
                    identifier: Identifier::String(String::decode(buf)?),
                }
            }
            0x04 => {
                let namespace = u16::decode(buf)?;
                ensure(buf, 16, "Guid")?;
                let mut guid = [0u8; 16];
                buf.copy_to_slice(&mut guid);
                NodeId {
                    namespace,
                    identifier: Identifier::Guid(guid),
                }
            }
            0x05 => {
                let namespace = u16::decode(buf)?;
                NodeId::opaque(namespace, Option::<Bytes>::decode(buf)?.unwrap_or_default())
            }
            other => {
                return Err(CodecError::invalid_value(
                    "NodeId",
                    format!("unknown encoding 0x{:02X}", other),
                ))
            }
        };
        // expanded node id extras are accepted and dropped
        if mask & 0x80 != 0 {
            Option::<String>::decode(buf)?;
        }
        if mask & 0x40 != 0 {
            u32::decode(buf)?;
        }
        Ok(node_id)
    }
}

// =============================================================================
// ExtensionObject
// =============================================================================

/// An encoded structure wrapped with its type id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExtensionObject {
    /// Binary encoding id of the body.
    pub type_id: NodeId,
    /// Encoded body; `None` for an empty extension object.
    pub body: Option<Bytes>,
}

impl ExtensionObject {
    /// The null extension object.
    pub fn null() -> Self {
        Self::default()
    }

    /// Wraps an encodable structure.
    pub fn from_encodable<T: BinaryEncodable>(type_id: u32, value: &T) -> Self {
        Self {
            type_id: NodeId::numeric(0, type_id),
            body: Some(value.to_bytes()),
        }
    }

    /// Decodes the body as `T`.
    pub fn decode_body<T: BinaryDecodable>(&self) -> Result<Option<T>, CodecError> {
        match &self.body {
            Some(body) => {
                let mut body = body.clone();
                T::decode(&mut body).map(Some)
            }
            None => Ok(None),
        }
    }
}

impl BinaryEncodable for ExtensionObject {
    fn length_in_bytes(&self) -> usize {
        self.type_id.length_in_bytes() + 1 + self.body.as_ref().map_or(0, |b| 4 + b.len())
    }

    fn encode(&self, buf: &mut BytesMut) {
        self.type_id.encode(buf);
        match &self.body {
            Some(body) => {
                buf.put_u8(0x01);
                buf.put_i32_le(body.len() as i32);
                buf.put_slice(body);
            }
            None => buf.put_u8(0x00),
        }
    }
}

impl BinaryDecodable for ExtensionObject {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let type_id = NodeId::decode(buf)?;
        let body = match u8::decode(buf)? {
            0x00 => None,
            0x01 | 0x02 => Option::<Bytes>::decode(buf)?,
            other => {
                return Err(CodecError::invalid_value(
                    "ExtensionObject",
                    format!("unknown encoding 0x{:02X}", other),
                ))
            }
        };
        Ok(Self { type_id, body })
    }
}

// =============================================================================
// LocalizedText
// =============================================================================

/// Text with an optional locale.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LocalizedText {
    /// Locale, e.g. "en".
    pub locale: Option<String>,
    /// Text.
    pub text: Option<String>,
}

impl LocalizedText {
    /// Creates an English text.
    pub fn english(text: impl Into<String>) -> Self {
        Self {
            locale: Some("en".to_string()),
            text: Some(text.into()),
        }
    }
}

impl BinaryEncodable for LocalizedText {
    fn length_in_bytes(&self) -> usize {
        1 + self.locale.as_ref().map_or(0, |l| 4 + l.len())
            + self.text.as_ref().map_or(0, |t| 4 + t.len())
    }

    fn encode(&self, buf: &mut BytesMut) {
        let mut mask = 0u8;
        if self.locale.is_some() {
            mask |= 0x01;
        }
        if self.text.is_some() {
            mask |= 0x02;
        }
        buf.put_u8(mask);
        if let Some(locale) = &self.locale {
            locale.encode(buf);
        }
        if let Some(text) = &self.text {
            text.encode(buf);
        }
    }
}

impl BinaryDecodable for LocalizedText {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let mask = u8::decode(buf)?;
        let locale = if mask & 0x01 != 0 {
            Option::<String>::decode(buf)?
        } else {
            None
        };
        let text = if mask & 0x02 != 0 {
            Option::<String>::decode(buf)?
        } else {
            None
        };
        Ok(Self { locale, text })
    }
}

// =============================================================================
// DiagnosticInfo
// =============================================================================

/// Vendor diagnostic information attached to a response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiagnosticInfo {
    /// Index into the string table for the symbolic id.
    pub symbolic_id: Option<i32>,
    /// Index into the string table for the namespace URI.
    pub namespace_uri: Option<i32>,
    /// Index into the string table for the localized text.
    pub localized_text: Option<i32>,
    /// Index into the string table for the locale.
    pub locale: Option<i32>,
    /// Free-form additional information.
    pub additional_info: Option<String>,
    /// Inner status code.
    pub inner_status_code: Option<u32>,
    /// Nested diagnostics.
    pub inner_diagnostic_info: Option<Box<DiagnosticInfo>>,
}

impl DiagnosticInfo {
    fn mask(&self) -> u8 {
        let mut mask = 0u8;
        if self.symbolic_id.is_some() {
            mask |= 0x01;
        }
        if self.namespace_uri.is_some() {
            mask |= 0x02;
        }
        if self.localized_text.is_some() {
            mask |= 0x04;
        }
        if self.locale.is_some() {
            mask |= 0x08;
        }
        if self.additional_info.is_some() {
            mask |= 0x10;
        }
        if self.inner_status_code.is_some() {
            mask |= 0x20;
        }
        if self.inner_diagnostic_info.is_some() {
            mask |= 0x40;
        }
        mask
    }
}

impl BinaryEncodable for DiagnosticInfo {
    fn length_in_bytes(&self) -> usize {
        1 + [
            self.symbolic_id,
            self.namespace_uri,
            self.localized_text,
            self.locale,
        ]
        .iter()
        .filter(|v| v.is_some())
        .count()
            * 4
            + self.additional_info.as_ref().map_or(0, |s| 4 + s.len())
            + self.inner_status_code.map_or(0, |_| 4)
            + self
                .inner_diagnostic_info
                .as_ref()
                .map_or(0, |inner| inner.length_in_bytes())
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.mask());
        for value in [
            self.symbolic_id,
            self.namespace_uri,
            self.localized_text,
            self.locale,
        ]
        .into_iter()
        .flatten()
        {
            buf.put_i32_le(value);
        }
        if let Some(info) = &self.additional_info {
            info.encode(buf);
        }
        if let Some(code) = self.inner_status_code {
            buf.put_u32_le(code);
        }
        if let Some(inner) = &self.inner_diagnostic_info {
            inner.encode(buf);
        }
    }
}

impl BinaryDecodable for DiagnosticInfo {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let mask = u8::decode(buf)?;
        let read_i32 = |bit: u8, buf: &mut Bytes| -> Result<Option<i32>, CodecError> {
            if mask & bit != 0 {
                i32::decode(buf).map(Some)
            } else {
                Ok(None)
            }
        };
        let symbolic_id = read_i32(0x01, buf)?;
        let namespace_uri = read_i32(0x02, buf)?;
        let localized_text = read_i32(0x04, buf)?;
        let locale = read_i32(0x08, buf)?;
        let additional_info = if mask & 0x10 != 0 {
            Option::<String>::decode(buf)?
        } else {
            None
        };
        let inner_status_code = if mask & 0x20 != 0 {
            Some(u32::decode(buf)?)
        } else {
            None
        };
        let inner_diagnostic_info = if mask & 0x40 != 0 {
            Some(Box::new(DiagnosticInfo::decode(buf)?))
        } else {
            None
        };
        Ok(Self {
            symbolic_id,
            namespace_uri,
            localized_text,
            locale,
            additional_info,
            inner_status_code,
            inner_diagnostic_info,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
