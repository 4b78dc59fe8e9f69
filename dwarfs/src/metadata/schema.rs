//! The schema descriptor and its wire codec.
//!
//! The schema describes the frozen layout of [`Metadata`][super::Metadata]:
//! which fields are materialized, how many bits each occupies, and at which
//! bit offset within its parent. It is stored in its own section using a
//! compact thrift-flavored encoding (varints, zigzag integers, field-id
//! deltas).
//!
//! <https://github.com/apache/thrift/blob/master/doc/specs/thrift-compact-protocol.md>
use std::fmt;

use super::Error as MetadataError;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
pub(crate) enum Error {
    Eof,
    VarintTooLong,
    Overflow,
    InvalidFieldTag,
    UnexpectedType,
    InvalidUtf8,
    UnknownField(i16),
    MissingField(&'static str),
    Invalid(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Eof => f.pad("unexpected end of input"),
            Error::VarintTooLong => f.pad("varint is too long"),
            Error::Overflow => f.pad("integer overflow"),
            Error::InvalidFieldTag => f.pad("invalid field tag"),
            Error::UnexpectedType => f.pad("unexpected field type"),
            Error::InvalidUtf8 => f.pad("string is not valid UTF-8"),
            Error::UnknownField(id) => write!(f, "unknown field id {id}"),
            Error::MissingField(name) => write!(f, "missing field {name}"),
            Error::Invalid(msg) => f.pad(msg),
        }
    }
}

/// The schema of a frozen [`Metadata`][super::Metadata] buffer.
///
/// Users should treat this type as opaque and only pass it between
/// [`Schema::parse`], [`Schema::to_bytes`] and
/// [`Metadata::parse`][super::Metadata::parse].
#[derive(Default, Clone, PartialEq, Eq)]
pub struct Schema {
    pub(crate) relax_type_checks: bool,
    /// Layouts keyed by dense layout id.
    pub(crate) layouts: Vec<Option<SchemaLayout>>,
    pub(crate) root_layout: u16,
    pub(crate) file_version: i32,
}

/// One layout node of a [`Schema`]: either a primitive of `bits` bits, or an
/// aggregate with `fields`.
#[derive(Default, Clone, PartialEq, Eq, Hash)]
pub struct SchemaLayout {
    /// In-line byte size of the root struct; informative only.
    pub(crate) size: i32,
    /// The number of bits an instance of this layout occupies in-line.
    pub(crate) bits: u16,
    /// Fields keyed by dense field id, starting at 1.
    pub(crate) fields: Vec<Option<SchemaField>>,
    /// Original type name; informative only and may be empty.
    pub(crate) type_name: String,
}

/// A field of an aggregate [`SchemaLayout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchemaField {
    pub(crate) layout_id: u16,
    /// Non-negative values are byte offsets; negative values are bit
    /// offsets, negated.
    pub(crate) offset: i16,
}

impl SchemaField {
    pub(crate) fn offset_bits(self) -> u64 {
        let o = self.offset;
        if o >= 0 {
            o as u64 * 8
        } else {
            -o as u64
        }
    }
}

struct DebugDenseMap<'a, T>(&'a [Option<T>]);

impl<T: fmt::Debug> fmt::Debug for DebugDenseMap<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.0
                    .iter()
                    .enumerate()
                    .filter_map(|(id, slot)| Some((id, slot.as_ref()?))),
            )
            .finish()
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("relax_type_checks", &self.relax_type_checks)
            .field("layouts", &DebugDenseMap(&self.layouts))
            .field("root_layout", &self.root_layout)
            .field("file_version", &self.file_version)
            .finish()
    }
}

impl fmt::Debug for SchemaLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaLayout")
            .field("size", &self.size)
            .field("bits", &self.bits)
            .field("fields", &DebugDenseMap(&self.fields))
            .field("type_name", &self.type_name)
            .finish()
    }
}

impl Schema {
    pub(crate) const FILE_VERSION: i32 = 1;

    pub(crate) fn get_layout(&self, id: u16) -> Option<&SchemaLayout> {
        self.layouts.get(usize::from(id))?.as_ref()
    }

    /// Parse the schema from its on-disk serialized form
    /// ([`SectionType::METADATA_V2_SCHEMA`](crate::section::SectionType::METADATA_V2_SCHEMA))
    /// and validate its internal consistency.
    pub fn parse(input: &[u8]) -> Result<Self, MetadataError> {
        let map_err = |err| MetadataError::new(format_args!("failed to parse schema: {err}"));
        let mut de = Decoder { rest: input };
        let schema = de_schema(&mut de).map_err(map_err)?;
        schema.validate().map_err(map_err)?;
        Ok(schema)
    }

    /// Serialize the schema to on-disk bytes, the reverse of
    /// [`Schema::parse`].
    ///
    /// The encoding is not canonical (`parse(bytes).to_bytes()` may differ
    /// from `bytes`), but it is deterministic and revertible:
    /// `parse(schema.to_bytes()) == schema`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder { out: Vec::with_capacity(256) };
        ser_schema(&mut enc, self);
        enc.out
    }

    fn validate(&self) -> Result<()> {
        if self.file_version != Self::FILE_VERSION {
            return Err(Error::Invalid("unsupported schema file version"));
        }
        if self.get_layout(self.root_layout).is_none() {
            return Err(Error::Invalid("missing root layout"));
        }
        for layout in self.layouts.iter().flatten() {
            if layout.fields.is_empty() && layout.bits > 64 {
                return Err(Error::Invalid("primitive layout wider than 64 bits"));
            }
            for field in layout.fields.iter().flatten() {
                let field_layout = self
                    .get_layout(field.layout_id)
                    .ok_or(Error::Invalid("field layout id out of range"))?;
                // The end position must be representable.
                field
                    .offset_bits()
                    .checked_add(u64::from(field_layout.bits))
                    .ok_or(Error::Invalid("field offset overflow"))?;
            }
        }
        Ok(())
    }
}

//// Wire types ////

#[derive(Debug, Clone, Copy, PartialEq)]
enum Tag {
    Bool(bool),
    Int,
    Binary,
    Map,
    Struct,
}

impl Tag {
    fn of(typ: u8) -> Result<Self> {
        Ok(match typ {
            1 => Tag::Bool(true),
            2 => Tag::Bool(false),
            4..=6 => Tag::Int,
            8 => Tag::Binary,
            11 => Tag::Map,
            12 => Tag::Struct,
            _ => return Err(Error::InvalidFieldTag),
        })
    }

    fn type_nibble(self) -> u8 {
        match self {
            Tag::Bool(true) => 1,
            Tag::Bool(false) => 2,
            Tag::Int => 4,
            Tag::Binary => 8,
            Tag::Map => 11,
            Tag::Struct => 12,
        }
    }
}

//// Decoding ////

struct Decoder<'a> {
    rest: &'a [u8],
}

impl<'a> Decoder<'a> {
    fn next_byte(&mut self) -> Result<u8> {
        let (&fst, rest) = self.rest.split_first().ok_or(Error::Eof)?;
        self.rest = rest;
        Ok(fst)
    }

    fn next_take(&mut self, len: usize) -> Result<&'a [u8]> {
        let (fst, rest) = self.rest.split_at_checked(len).ok_or(Error::Eof)?;
        self.rest = rest;
        Ok(fst)
    }

    fn decode_varint(&mut self) -> Result<u64> {
        let mut x = 0u64;
        for i in 0..10 {
            let b = self.next_byte()?;
            x += u64::from(b & 0x7F) << (i * 7);
            if b & 0x80 == 0 {
                return Ok(x);
            }
        }
        Err(Error::VarintTooLong)
    }

    fn decode_uint<T: TryFrom<u64>>(&mut self) -> Result<T> {
        self.decode_varint()?.try_into().map_err(|_| Error::Overflow)
    }

    fn decode_sint<T: TryFrom<i64>>(&mut self) -> Result<T> {
        let x = self.decode_varint()?;
        let x = (x >> 1) as i64 ^ -(x as i64 & 1);
        x.try_into().map_err(|_| Error::Overflow)
    }

    fn decode_string(&mut self) -> Result<String> {
        let size = self.decode_uint::<usize>()?;
        let s = std::str::from_utf8(self.next_take(size)?)
            .ok()
            .ok_or(Error::InvalidUtf8)?;
        Ok(s.to_owned())
    }

    fn decode_field_header(&mut self, field_id: &mut i16) -> Result<Option<(i16, Tag)>> {
        let b = self.next_byte()?;
        if b == 0 {
            return Ok(None);
        }
        let id_delta = i16::from(b >> 4);
        *field_id = if id_delta != 0 {
            field_id.checked_add(id_delta).ok_or(Error::Overflow)?
        } else {
            self.decode_sint::<i16>()?
        };
        let tag = Tag::of(b & 0xF)?;
        Ok(Some((*field_id, tag)))
    }

    /// Decode a `map<int, struct>` into a dense vec keyed by the int.
    fn decode_dense_map<V, F>(&mut self, mut de_value: F) -> Result<Vec<Option<V>>>
    where
        F: FnMut(&mut Self) -> Result<V>,
    {
        let size = self.decode_uint::<usize>()?;
        if size == 0 {
            return Ok(Vec::new());
        }

        let b = self.next_byte()?;
        let (ktag, vtag) = (Tag::of(b >> 4)?, Tag::of(b & 0xF)?);
        if !(matches!(ktag, Tag::Int) && matches!(vtag, Tag::Struct)) {
            return Err(Error::UnexpectedType);
        }

        // Bound the initial capacity by the remaining input length so a
        // corrupted size cannot blow up the allocation.
        let mut elems = Vec::with_capacity(size.min(self.rest.len() + 1));
        for _ in 0..size {
            let k = self.decode_sint::<i64>()?;
            let k = usize::try_from(k).map_err(|_| Error::Overflow)?;
            let v = de_value(self)?;
            if k >= elems.len() {
                elems.resize_with(k + 1, || None);
            }
            elems[k] = Some(v);
        }
        Ok(elems)
    }
}

fn de_schema(de: &mut Decoder) -> Result<Schema> {
    let mut id = 0i16;
    let mut relax_type_checks = false;
    let mut layouts = None;
    let mut root_layout = 0u16;
    let mut file_version = 0i32;
    while let Some((id, tag)) = de.decode_field_header(&mut id)? {
        match (id, tag) {
            (1, Tag::Bool(x)) => relax_type_checks = x,
            (2, Tag::Map) => layouts = Some(de.decode_dense_map(de_layout)?),
            (3, Tag::Int) => root_layout = de.decode_sint::<i16>()? as u16,
            (4, Tag::Int) => file_version = de.decode_sint()?,
            (id, _) => return Err(Error::UnknownField(id)),
        }
    }
    Ok(Schema {
        relax_type_checks,
        layouts: layouts.ok_or(Error::MissingField("layouts"))?,
        root_layout,
        file_version,
    })
}

fn de_layout(de: &mut Decoder) -> Result<SchemaLayout> {
    let mut id = 0i16;
    let mut size = 0i32;
    let mut bits = 0u16;
    let mut fields = None;
    let mut type_name = None;
    while let Some((id, tag)) = de.decode_field_header(&mut id)? {
        match (id, tag) {
            (1, Tag::Int) => size = de.decode_sint()?,
            (2, Tag::Int) => bits = de.decode_sint::<i16>()? as u16,
            (3, Tag::Map) => fields = Some(de.decode_dense_map(de_field)?),
            (4, Tag::Binary) => type_name = Some(de.decode_string()?),
            (id, _) => return Err(Error::UnknownField(id)),
        }
    }
    Ok(SchemaLayout {
        size,
        bits,
        fields: fields.ok_or(Error::MissingField("fields"))?,
        type_name: type_name.ok_or(Error::MissingField("type_name"))?,
    })
}

fn de_field(de: &mut Decoder) -> Result<SchemaField> {
    let mut id = 0i16;
    let mut layout_id = None;
    let mut offset = 0i16;
    while let Some((id, tag)) = de.decode_field_header(&mut id)? {
        match (id, tag) {
            (1, Tag::Int) => layout_id = Some(de.decode_sint::<i16>()? as u16),
            (2, Tag::Int) => offset = de.decode_sint()?,
            (id, _) => return Err(Error::UnknownField(id)),
        }
    }
    Ok(SchemaField {
        layout_id: layout_id.ok_or(Error::MissingField("layout_id"))?,
        offset,
    })
}

//// Encoding ////

struct Encoder {
    out: Vec<u8>,
}

impl Encoder {
    fn encode_varint(&mut self, mut x: u64) {
        loop {
            let b = (x & 0x7F) as u8;
            x >>= 7;
            if x == 0 {
                self.out.push(b);
                break;
            }
            self.out.push(b | 0x80);
        }
    }

    fn encode_sint(&mut self, x: i64) {
        self.encode_varint(((x << 1) ^ (x >> 63)) as u64);
    }

    fn encode_string(&mut self, s: &str) {
        self.encode_varint(s.len() as u64);
        self.out.extend_from_slice(s.as_bytes());
    }

    /// Encode a field header. `last_id` must be the previously written field
    /// id; fields must be written in ascending id order with gaps < 16.
    fn encode_field_header(&mut self, last_id: &mut i16, id: i16, tag: Tag) {
        let delta = id - *last_id;
        debug_assert!((1..=15).contains(&delta), "field ids must ascend");
        self.out.push(((delta as u8) << 4) | tag.type_nibble());
        *last_id = id;
    }

    fn encode_stop(&mut self) {
        self.out.push(0);
    }

    fn encode_dense_map<V>(
        &mut self,
        elems: &[Option<V>],
        mut ser_value: impl FnMut(&mut Self, &V),
    ) {
        let size = elems.iter().flatten().count();
        self.encode_varint(size as u64);
        if size == 0 {
            return;
        }
        self.out.push((Tag::Int.type_nibble() << 4) | Tag::Struct.type_nibble());
        for (k, v) in elems.iter().enumerate() {
            if let Some(v) = v {
                self.encode_sint(k as i64);
                ser_value(self, v);
            }
        }
    }
}

fn ser_schema(enc: &mut Encoder, schema: &Schema) {
    let mut id = 0i16;
    enc.encode_field_header(&mut id, 1, Tag::Bool(schema.relax_type_checks));
    enc.encode_field_header(&mut id, 2, Tag::Map);
    enc.encode_dense_map(&schema.layouts, ser_layout);
    enc.encode_field_header(&mut id, 3, Tag::Int);
    enc.encode_sint(schema.root_layout as i16 as i64);
    enc.encode_field_header(&mut id, 4, Tag::Int);
    enc.encode_sint(schema.file_version.into());
    enc.encode_stop();
}

fn ser_layout(enc: &mut Encoder, layout: &SchemaLayout) {
    let mut id = 0i16;
    enc.encode_field_header(&mut id, 1, Tag::Int);
    enc.encode_sint(layout.size.into());
    enc.encode_field_header(&mut id, 2, Tag::Int);
    enc.encode_sint(layout.bits as i16 as i64);
    enc.encode_field_header(&mut id, 3, Tag::Map);
    enc.encode_dense_map(&layout.fields, ser_field);
    enc.encode_field_header(&mut id, 4, Tag::Binary);
    enc.encode_string(&layout.type_name);
    enc.encode_stop();
}

fn ser_field(enc: &mut Encoder, field: &SchemaField) {
    let mut id = 0i16;
    enc.encode_field_header(&mut id, 1, Tag::Int);
    enc.encode_sint(field.layout_id as i16 as i64);
    enc.encode_field_header(&mut id, 2, Tag::Int);
    enc.encode_sint(field.offset.into());
    enc.encode_stop();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let schema = Schema {
            relax_type_checks: true,
            layouts: vec![
                Some(SchemaLayout {
                    size: 4,
                    bits: 32,
                    fields: vec![
                        None,
                        Some(SchemaField { layout_id: 1, offset: 0 }),
                        Some(SchemaField { layout_id: 1, offset: -17 }),
                    ],
                    type_name: String::new(),
                }),
                Some(SchemaLayout {
                    size: 0,
                    bits: 17,
                    fields: Vec::new(),
                    type_name: "u32".into(),
                }),
            ],
            root_layout: 0,
            file_version: Schema::FILE_VERSION,
        };
        let bytes = schema.to_bytes();
        let parsed = Schema::parse(&bytes).unwrap();
        assert_eq!(parsed, schema);
    }

    #[test]
    fn rejects_bad_root() {
        let schema = Schema {
            relax_type_checks: false,
            layouts: Vec::new(),
            root_layout: 0,
            file_version: Schema::FILE_VERSION,
        };
        // No layouts at all: the root layout cannot resolve.
        assert!(Schema::parse(&schema.to_bytes()).is_err());
    }

    #[test]
    fn zigzag() {
        let mut enc = Encoder { out: Vec::new() };
        for v in [0i64, -1, 1, -2, 63, -64, 1 << 20, -(1 << 20)] {
            enc.out.clear();
            enc.encode_sint(v);
            let mut de = Decoder { rest: &enc.out };
            assert_eq!(de.decode_sint::<i64>().unwrap(), v);
            assert!(de.rest.is_empty());
        }
    }
}
