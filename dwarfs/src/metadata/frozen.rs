//! The schema-directed "frozen" binary codec for [`Metadata`][super::Metadata].
//!
//! The frozen form is position independent: aggregates store their fields
//! in-line at bit offsets recorded in the [`Schema`], while variable-sized
//! data (collections, byte strings) is outlined and addressed by a
//! `(distance, count)` pair relative to its enclosing storage region.
//! Fields whose value is zero in every instance are omitted from the layout
//! entirely and read back as zero.
//!
//! Writing always produces byte-aligned layouts (every materialized field
//! occupies whole bytes). Reading accepts any layout the schema describes,
//! including bit-packed ones produced by other implementations.
//!
//! Serde drives both directions, so the set of supported shapes is exactly
//! what the metadata structures need: `bool`, `u32`, `u64`, byte strings,
//! options, sequences and structs.
use indexmap::IndexSet;
use serde::{de, forward_to_deserialize_any, ser, ser::Serialize};

use super::{Schema, SchemaField, SchemaLayout};

type Error = serde::de::value::Error;
type Result<T, E = Error> = std::result::Result<T, E>;

/// Offsets of inline struct fields are encoded in bits in an `i16`, which
/// bounds the inline size of any single struct.
const MAX_STRUCT_BYTE_SIZE: u16 = i16::MAX as u16 / 8;

//// Freezing ////

pub(crate) fn freeze<T: ser::Serialize>(value: &T) -> Result<(Schema, Vec<u8>)> {
    // First pass: walk the value and plan which fields are materialized and
    // how many bytes each occupies.
    let mut plan = Plan::None;
    value.serialize(&mut plan)?;
    plan.finish()
        .ok_or_else(|| ser::Error::custom("struct is too large"))?;

    // Convert the plan into a schema, deduplicating identical layouts.
    let schema = {
        let mut set = IndexSet::new();
        let Some(root_id) = plan_to_schema(&plan, &mut set)? else {
            return Err(ser::Error::custom("root struct must not be empty"));
        };
        let mut schema = Schema {
            relax_type_checks: true,
            layouts: set.into_iter().map(Some).collect(),
            root_layout: root_id,
            file_version: Schema::FILE_VERSION,
        };
        let root = schema.layouts[usize::from(root_id)].as_mut().expect("just inserted");
        root.size = (i32::from(root.bits) + 7) / 8;
        schema
    };

    // Second pass: write the actual bytes following the plan.
    let mut buf = vec![0u8; usize::from(plan.byte_size())];
    value.serialize(Serializer {
        plan: &plan,
        w: &mut buf,
        base: 0,
        inline_pos: 0,
    })?;

    Ok((schema, buf))
}

fn plan_to_schema(plan: &Plan, set: &mut IndexSet<SchemaLayout>) -> Result<Option<u16>> {
    let idx = match plan {
        Plan::None => return Ok(None),
        Plan::Primitive { byte_size } => {
            set.insert_full(SchemaLayout {
                size: 0,
                bits: byte_size * 8,
                fields: Vec::new(),
                type_name: String::new(),
            })
            .0
        }
        Plan::Struct { fields, .. } => {
            // Field ids start at 1, so slot 0 stays empty.
            let mut out_fields = vec![None; 1 + fields.len()];
            let mut offset = 0i16;
            for (field, id) in fields.iter().zip(1..) {
                if let Some(layout_id) = plan_to_schema(field, set)? {
                    out_fields[id] = Some(SchemaField { layout_id, offset });
                    // Negative values encode bit offsets. Bounded by
                    // `MAX_STRUCT_BYTE_SIZE`, so this cannot overflow.
                    offset -= field.byte_size() as i16 * 8;
                }
            }
            set.insert_full(SchemaLayout {
                size: 0,
                bits: (-offset) as u16,
                fields: out_fields,
                type_name: String::new(),
            })
            .0
        }
        Plan::Collection { .. } => unreachable!("normalized by Plan::finish"),
    };
    u16::try_from(idx)
        .ok()
        .filter(|&id| i16::try_from(id).is_ok())
        .map(Some)
        .ok_or_else(|| ser::Error::custom("layout count overflows"))
}

/// The planned layout of one value position, merged over all instances that
/// were serialized into it.
#[derive(Default, Debug, PartialEq)]
enum Plan {
    #[default]
    None,
    Primitive {
        byte_size: u16,
    },
    Struct {
        byte_size: u16,
        fields: Vec<Plan>,
    },
    /// Normalized into `Struct { [distance, count, element] }` by `finish`.
    Collection {
        count_size: u16,
        element: Box<Plan>,
    },
}

impl Plan {
    fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    fn byte_size(&self) -> u16 {
        match self {
            Plan::None => 0,
            Plan::Primitive { byte_size } | Plan::Struct { byte_size, .. } => *byte_size,
            Plan::Collection { .. } => unreachable!("normalized by Plan::finish"),
        }
    }

    fn primitive(byte_size: u16) -> Self {
        if byte_size == 0 {
            Self::None
        } else {
            Self::Primitive { byte_size }
        }
    }

    /// Finalize the plan: drop empty structs, normalize collections into
    /// `(distance, count, element)` structs, and fill in aggregate sizes.
    /// Returns `None` if some struct exceeds the inline size bound.
    fn finish(&mut self) -> Option<u16> {
        match self {
            Plan::None => Some(0),
            Plan::Primitive { byte_size } => Some(*byte_size),
            Plan::Struct { byte_size, fields } => {
                *byte_size = fields.iter_mut().try_fold(0u16, |size, field| {
                    let size = size + field.finish()?;
                    (size <= MAX_STRUCT_BYTE_SIZE).then_some(size)
                })?;
                if *byte_size == 0 {
                    *self = Plan::None;
                }
                Some(self.byte_size())
            }
            Plan::Collection { count_size, element } => {
                if *count_size == 0 {
                    *self = Plan::None;
                    return Some(0);
                }
                // The distance field is only needed if elements are
                // materialized at all.
                let distance_size = if element.finish()? == 0 { 0 } else { 4 };
                let byte_size = distance_size + *count_size;
                *self = Plan::Struct {
                    byte_size,
                    fields: vec![
                        Plan::primitive(distance_size),
                        Plan::primitive(*count_size),
                        std::mem::take(&mut **element),
                    ],
                };
                Some(byte_size)
            }
        }
    }

    fn put_primitive_opt(&mut self, byte_size: u16, present: bool) -> Result<()> {
        match (self, present) {
            (Plan::None | Plan::Primitive { .. }, false) => Ok(()),
            (this @ Plan::None, true) => {
                *this = Self::primitive(byte_size);
                Ok(())
            }
            (Plan::Primitive { byte_size: prev }, true) => {
                *prev = (*prev).max(byte_size);
                Ok(())
            }
            (Plan::Struct { .. } | Plan::Collection { .. }, _) => Err(ser::Error::custom(
                "cannot merge a primitive with an aggregate layout",
            )),
        }
    }

    fn put_struct(&mut self, field_cnt: usize) -> Result<&mut [Plan]> {
        match self {
            this @ Plan::None => {
                *this = Plan::Struct {
                    byte_size: 0,
                    fields: std::iter::repeat_with(|| Plan::None).take(field_cnt).collect(),
                };
                let Plan::Struct { fields, .. } = this else {
                    unreachable!()
                };
                Ok(fields)
            }
            Plan::Struct { fields, .. } if fields.len() == field_cnt => Ok(fields),
            _ => Err(ser::Error::custom("layout type mismatch")),
        }
    }

    fn put_collection(&mut self, len: usize) -> Result<&mut Plan> {
        u32::try_from(len).map_err(|_| ser::Error::custom("collection length overflow"))?;
        let len_size = if len != 0 { 4 } else { 0 };
        match self {
            this @ Plan::None => {
                *this = Plan::Collection {
                    count_size: len_size,
                    element: Box::new(Plan::None),
                };
                let Plan::Collection { element, .. } = this else {
                    unreachable!()
                };
                Ok(element)
            }
            Plan::Collection { count_size, element } => {
                *count_size = (*count_size).max(len_size);
                Ok(element)
            }
            _ => Err(ser::Error::custom("layout type mismatch")),
        }
    }
}

macro_rules! unsupported_ser {
    ($($fn:ident($($ty:ty),*);)*) => {
        $(fn $fn(self, $(_: $ty),*) -> Result<Self::Ok> {
            Err(ser::Error::custom(concat!(
                "unsupported shape for frozen serialization: ",
                stringify!($fn),
            )))
        })*
    };
}

macro_rules! impl_unsupported_ser {
    () => {
        unsupported_ser! {
            serialize_i8(i8);
            serialize_i16(i16);
            serialize_i32(i32);
            serialize_i64(i64);
            serialize_u8(u8);
            serialize_u16(u16);
            serialize_f32(f32);
            serialize_f64(f64);
            serialize_char(char);
            serialize_str(&str);
            serialize_unit();
            serialize_unit_struct(&'static str);
            serialize_unit_variant(&'static str, u32, &'static str);
        }

        fn serialize_newtype_struct<T>(self, _: &'static str, value: &T) -> Result<Self::Ok>
        where
            T: ?Sized + ser::Serialize,
        {
            value.serialize(self)
        }

        fn serialize_newtype_variant<T>(
            self,
            _: &'static str,
            _: u32,
            _: &'static str,
            _: &T,
        ) -> Result<Self::Ok>
        where
            T: ?Sized + ser::Serialize,
        {
            Err(ser::Error::custom("unsupported shape for frozen serialization"))
        }

        fn serialize_tuple(self, _: usize) -> Result<Self::SerializeTuple> {
            Err(ser::Error::custom("unsupported shape for frozen serialization"))
        }

        fn serialize_tuple_struct(
            self,
            _: &'static str,
            _: usize,
        ) -> Result<Self::SerializeTupleStruct> {
            Err(ser::Error::custom("unsupported shape for frozen serialization"))
        }

        fn serialize_tuple_variant(
            self,
            _: &'static str,
            _: u32,
            _: &'static str,
            _: usize,
        ) -> Result<Self::SerializeTupleVariant> {
            Err(ser::Error::custom("unsupported shape for frozen serialization"))
        }

        fn serialize_struct_variant(
            self,
            _: &'static str,
            _: u32,
            _: &'static str,
            _: usize,
        ) -> Result<Self::SerializeStructVariant> {
            Err(ser::Error::custom("unsupported shape for frozen serialization"))
        }

        fn serialize_map(self, _: Option<usize>) -> Result<Self::SerializeMap> {
            Err(ser::Error::custom("unsupported shape for frozen serialization"))
        }
    };
}

impl<'a> ser::Serializer for &'a mut Plan {
    type Ok = ();
    type Error = Error;
    type SerializeSeq = Self;
    type SerializeTuple = ser::Impossible<Self::Ok, Self::Error>;
    type SerializeTupleStruct = ser::Impossible<Self::Ok, Self::Error>;
    type SerializeTupleVariant = ser::Impossible<Self::Ok, Self::Error>;
    type SerializeMap = ser::Impossible<Self::Ok, Self::Error>;
    type SerializeStruct = StructPlanner<'a>;
    type SerializeStructVariant = ser::Impossible<Self::Ok, Self::Error>;

    fn serialize_bool(self, v: bool) -> Result<Self::Ok> {
        self.put_primitive_opt(1, v)
    }

    fn serialize_u32(self, v: u32) -> Result<Self::Ok> {
        self.put_primitive_opt(4, v != 0)
    }

    fn serialize_u64(self, v: u64) -> Result<Self::Ok> {
        self.put_primitive_opt(8, v != 0)
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<Self::Ok> {
        u32::try_from(v.len()).map_err(|_| ser::Error::custom("bytes length overflow"))?;
        let present = !v.is_empty();
        // Byte strings are special-cased: a (distance, count) struct with the
        // content outlined, no per-element layout.
        let fields = self.put_struct(2)?;
        fields[0].put_primitive_opt(4, present)?; // distance
        fields[1].put_primitive_opt(4, present) // count
    }

    fn serialize_none(self) -> Result<Self::Ok> {
        let fields = self.put_struct(2)?;
        fields[0].serialize_bool(false)
    }

    fn serialize_some<T>(self, value: &T) -> Result<Self::Ok>
    where
        T: ?Sized + ser::Serialize,
    {
        let [is_some, inner] = self.put_struct(2)? else {
            unreachable!()
        };
        is_some.serialize_bool(true)?;
        value.serialize(inner)
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<Self::SerializeSeq> {
        let len = len.ok_or_else(|| ser::Error::custom("collection must have a known length"))?;
        self.put_collection(len)
    }

    fn serialize_struct(self, _name: &'static str, len: usize) -> Result<Self::SerializeStruct> {
        Ok(StructPlanner(self.put_struct(len)?))
    }

    impl_unsupported_ser!();
}

struct StructPlanner<'a>(&'a mut [Plan]);

impl ser::SerializeStruct for StructPlanner<'_> {
    type Ok = ();
    type Error = Error;

    fn skip_field(&mut self, _key: &'static str) -> Result<()> {
        self.0 = &mut std::mem::take(&mut self.0)[1..];
        Ok(())
    }

    fn serialize_field<T>(&mut self, key: &'static str, value: &T) -> Result<()>
    where
        T: ?Sized + ser::Serialize,
    {
        value.serialize(&mut self.0[0])?;
        self.skip_field(key)
    }

    fn end(self) -> Result<Self::Ok> {
        Ok(())
    }
}

impl ser::SerializeSeq for &mut Plan {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T>(&mut self, value: &T) -> Result<()>
    where
        T: ?Sized + ser::Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<Self::Ok> {
        Ok(())
    }
}

/// The second pass: writes values into the buffer at positions the plan
/// dictates.
///
/// Buffer layout during serialization:
///
/// ```text
/// | ..earlier data.. | inline fields of the current aggregate | ..outlined data.. |
///                    ^ base                     ^ inline_pos              w.len() ^
/// ```
struct Serializer<'a, 'w> {
    plan: &'a Plan,
    w: &'w mut Vec<u8>,
    /// The storage base that `distance` values are relative to.
    base: u32,
    /// The absolute position the next inline field is written at.
    inline_pos: u32,
}

impl<'a> Serializer<'a, '_> {
    fn distance(&self) -> u32 {
        self.w.len() as u32 - self.base
    }

    fn reborrow(&mut self) -> Serializer<'a, '_> {
        Serializer {
            plan: self.plan,
            w: self.w,
            base: self.base,
            inline_pos: self.inline_pos,
        }
    }

    fn put_primitive<const N: usize>(self, v: [u8; N]) {
        match self.plan {
            Plan::None => {}
            Plan::Primitive { byte_size } => {
                debug_assert_eq!(usize::from(*byte_size), N, "layout type mismatch");
                self.w[self.inline_pos as usize..][..N].copy_from_slice(&v);
            }
            _ => unreachable!("layout type mismatch"),
        }
    }

    fn as_struct(&self, field_cnt: usize) -> Option<&'a [Plan]> {
        match self.plan {
            Plan::None => None,
            Plan::Struct { fields, .. } => {
                debug_assert_eq!(fields.len(), field_cnt, "layout type mismatch");
                Some(fields)
            }
            _ => unreachable!("layout type mismatch"),
        }
    }
}

impl<'a, 'w> ser::Serializer for Serializer<'a, 'w> {
    type Ok = ();
    type Error = Error;
    type SerializeSeq = ser::Impossible<Self::Ok, Self::Error>;
    type SerializeTuple = ser::Impossible<Self::Ok, Self::Error>;
    type SerializeTupleStruct = ser::Impossible<Self::Ok, Self::Error>;
    type SerializeTupleVariant = ser::Impossible<Self::Ok, Self::Error>;
    type SerializeMap = ser::Impossible<Self::Ok, Self::Error>;
    type SerializeStruct = StructSerializer<'a, 'w>;
    type SerializeStructVariant = ser::Impossible<Self::Ok, Self::Error>;

    fn serialize_bool(self, v: bool) -> Result<Self::Ok> {
        self.put_primitive([v.into()]);
        Ok(())
    }

    fn serialize_u32(self, v: u32) -> Result<Self::Ok> {
        self.put_primitive(v.to_le_bytes());
        Ok(())
    }

    fn serialize_u64(self, v: u64) -> Result<Self::Ok> {
        self.put_primitive(v.to_le_bytes());
        Ok(())
    }

    fn serialize_bytes(mut self, v: &[u8]) -> Result<Self::Ok> {
        use ser::SerializeStruct as _;

        if self.plan.is_none() {
            return Ok(());
        }
        let distance = self.distance();
        let mut s = self.reborrow().serialize_struct("bytes", 2)?;
        let omit_content = s.fields.first().is_none_or(Plan::is_none);
        s.serialize_field("distance", &distance)?;
        s.serialize_field("count", &(v.len() as u32))?;
        s.end()?;
        if !omit_content {
            self.w.extend_from_slice(v);
        }
        Ok(())
    }

    fn serialize_none(self) -> Result<Self::Ok> {
        use ser::SerializeStruct as _;

        let mut s = self.serialize_struct("optional", 2)?;
        s.serialize_field("is_some", &false)?;
        s.skip_field("inner")?;
        s.end()
    }

    fn serialize_some<T>(self, value: &T) -> Result<Self::Ok>
    where
        T: ?Sized + ser::Serialize,
    {
        use ser::SerializeStruct as _;

        let mut s = self.serialize_struct("optional", 2)?;
        s.serialize_field("is_some", &true)?;
        s.serialize_field("inner", value)?;
        s.end()
    }

    fn serialize_struct(self, _name: &'static str, len: usize) -> Result<Self::SerializeStruct> {
        let fields = self.as_struct(len).unwrap_or_default();
        Ok(StructSerializer { fields, ser: self })
    }

    fn collect_seq<I>(mut self, iter: I) -> Result<Self::Ok>
    where
        I: IntoIterator,
        <I as IntoIterator>::Item: ser::Serialize,
    {
        use ser::SerializeStruct as _;

        let iter = iter.into_iter();
        let len = iter.size_hint().0 as u32;
        if self.plan.is_none() {
            debug_assert_eq!(len, 0);
            return Ok(());
        }

        let distance = self.distance();
        let mut s = self.reborrow().serialize_struct("seq", 3)?;
        let elem_plan = s.fields.get(2).unwrap_or(&Plan::None);
        s.serialize_field("distance", &distance)?;
        s.serialize_field("count", &len)?;
        s.end()?;

        if !elem_plan.is_none() {
            let elem_size = elem_plan.byte_size();
            let new_base = self.w.len();
            self.w.resize(new_base + len as usize * usize::from(elem_size), 0);
            u32::try_from(self.w.len())
                .map_err(|_| ser::Error::custom("serialized size overflows u32"))?;
            let mut elem_ser = Serializer {
                plan: elem_plan,
                w: self.w,
                base: new_base as u32,
                inline_pos: new_base as u32,
            };
            for elem in iter {
                elem.serialize(elem_ser.reborrow())?;
                elem_ser.inline_pos += u32::from(elem_size);
            }
        }
        Ok(())
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq> {
        // Sequences are handled in `collect_seq`; element-at-a-time
        // serialization cannot preallocate the outlined storage.
        Err(ser::Error::custom("unsupported sequence shape"))
    }

    impl_unsupported_ser!();
}

struct StructSerializer<'a, 'w> {
    ser: Serializer<'a, 'w>,
    fields: &'a [Plan],
}

impl ser::SerializeStruct for StructSerializer<'_, '_> {
    type Ok = ();
    type Error = Error;

    fn skip_field(&mut self, _key: &'static str) -> Result<()> {
        if let Some((fst, rest)) = self.fields.split_first() {
            self.fields = rest;
            // Bounded by `MAX_STRUCT_BYTE_SIZE`, cannot overflow.
            self.ser.inline_pos += u32::from(fst.byte_size());
        }
        Ok(())
    }

    fn serialize_field<T>(&mut self, _key: &'static str, value: &T) -> Result<()>
    where
        T: ?Sized + ser::Serialize,
    {
        let Some((fst, rest)) = self.fields.split_first() else {
            return Ok(());
        };
        self.fields = rest;
        if !fst.is_none() {
            self.ser.plan = fst;
            value.serialize(self.ser.reborrow())?;
        }
        self.ser.inline_pos += u32::from(fst.byte_size());
        Ok(())
    }

    fn end(self) -> Result<Self::Ok> {
        Ok(())
    }
}

//// Thawing ////

pub(crate) fn thaw<T: de::DeserializeOwned>(schema: &Schema, bytes: &[u8]) -> Result<T> {
    let root_layout = schema
        .get_layout(schema.root_layout)
        .ok_or_else(|| de::Error::custom("missing root layout"))?;
    T::deserialize(Deserializer {
        src: &Source { schema, bytes },
        layout: Some(root_layout),
        bit_offset: 0,
        storage_start: 0,
    })
}

/// The input raw bytes with the attached schema.
#[derive(Clone, Copy)]
struct Source<'de> {
    schema: &'de Schema,
    bytes: &'de [u8],
}

impl Source<'_> {
    /// Load one bit at the absolute bit position `base_bit`.
    fn load_bit(&self, base_bit: u64) -> Result<bool> {
        let byte = usize::try_from(base_bit / 8).ok();
        let b = *byte
            .and_then(|i| self.bytes.get(i))
            .ok_or_else(|| de::Error::custom("bit location out of range"))?;
        Ok((b >> (base_bit % 8)) & 1 != 0)
    }

    /// Load `bits` bits starting at the absolute bit position `base_bit`,
    /// little-endian, upper bits zero.
    fn load_bits(&self, base_bit: u64, bits: u16) -> Result<u64> {
        debug_assert!(0 < bits && bits <= 64);
        let first = base_bit / 8;
        let last = (base_bit + u64::from(bits) - 1) / 8;
        let span = self
            .bytes
            .get(usize::try_from(first).ok().ok_or_else(bits_oor)?..)
            .filter(|_| last < self.bytes.len() as u64)
            .ok_or_else(bits_oor)?;

        // The span covers at most 9 bytes (64 bits + up to 7 bits of shift).
        let mut acc = 0u128;
        for (i, &b) in span.iter().take(9).enumerate() {
            acc |= u128::from(b) << (8 * i);
        }
        let shifted = acc >> (base_bit % 8);
        Ok((shifted & ((1u128 << bits) - 1)) as u64)
    }
}

#[cold]
fn bits_oor() -> Error {
    de::Error::custom("bits location out of range")
}

#[derive(Clone, Copy)]
struct Deserializer<'a, 'de> {
    src: &'a Source<'de>,
    layout: Option<&'de SchemaLayout>,
    /// Bit offset relative to `storage_start`.
    bit_offset: u64,
    /// Byte offset of the enclosing storage region; `distance` values are
    /// relative to it.
    storage_start: u64,
}

impl<'de> Deserializer<'_, 'de> {
    fn field(&self, id: u16) -> Self {
        let (layout, offset_bits) = match self
            .layout
            .and_then(|l| *l.fields.get(usize::from(id))?)
        {
            Some(field) => (self.src.schema.get_layout(field.layout_id), field.offset_bits()),
            None => (None, 0),
        };
        Self {
            src: self.src,
            layout,
            bit_offset: self.bit_offset + offset_bits,
            storage_start: self.storage_start,
        }
    }

    fn read_field<T: de::Deserialize<'de>>(&self, id: u16) -> Result<T> {
        de::Deserialize::deserialize(self.field(id))
    }

    fn abs_bit(&self) -> u64 {
        self.storage_start * 8 + self.bit_offset
    }
}

impl<'de> de::Deserializer<'de> for Deserializer<'_, 'de> {
    type Error = Error;

    fn is_human_readable(&self) -> bool {
        false
    }

    fn deserialize_any<V>(self, _visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        Err(de::Error::custom("frozen data is not self-describing"))
    }

    fn deserialize_bool<V>(self, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        let b = self.layout.is_some() && self.src.load_bit(self.abs_bit())?;
        visitor.visit_bool(b)
    }

    fn deserialize_u32<V>(self, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        self.deserialize_u64(visitor)
    }

    fn deserialize_u64<V>(self, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        let Some(layout) = self.layout else {
            return visitor.visit_u64(0);
        };
        if !layout.fields.is_empty() {
            return Err(de::Error::invalid_type(
                de::Unexpected::Other("an aggregate layout"),
                &"an unsigned integer",
            ));
        }
        if layout.bits == 0 {
            return visitor.visit_u64(0);
        }
        if layout.bits > 64 {
            return Err(de::Error::custom("too many bits for an unsigned integer"));
        }
        visitor.visit_u64(self.src.load_bits(self.abs_bit(), layout.bits)?)
    }

    fn deserialize_byte_buf<V>(self, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        self.deserialize_bytes(visitor)
    }

    fn deserialize_bytes<V>(self, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        let distance = self.read_field::<u32>(1)?;
        let len = self.read_field::<u32>(2)?;
        let content = (|| {
            let start = self.storage_start.checked_add(distance.into())?;
            let end = start.checked_add(len.into())?;
            self.src
                .bytes
                .get(usize::try_from(start).ok()?..usize::try_from(end).ok()?)
        })()
        .ok_or_else(|| <Error as de::Error>::custom("byte string out of range"))?;
        visitor.visit_borrowed_bytes(content)
    }

    fn deserialize_seq<V>(self, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        let distance = self.read_field::<u32>(1)?;
        let len = self.read_field::<u32>(2)?;
        let elem_layout = self.layout.and_then(|l| {
            let field = (*l.fields.get(3)?)?;
            self.src.schema.get_layout(field.layout_id)
        });
        visitor.visit_seq(SeqDeserializer {
            elem_de: Deserializer {
                src: self.src,
                layout: elem_layout,
                bit_offset: 0,
                storage_start: self.storage_start + u64::from(distance),
            },
            len,
        })
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        if self.read_field::<bool>(1)? {
            visitor.visit_some(self.field(2))
        } else {
            visitor.visit_none()
        }
    }

    fn deserialize_struct<V>(
        self,
        _name: &'static str,
        _fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        // Field ids start at 1; slot 0 is never populated.
        visitor.visit_map(StructDeserializer { de: self, field_id: 1 })
    }

    fn deserialize_ignored_any<V>(self, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_unit()
    }

    forward_to_deserialize_any! {
        i8 i16 i32 i64 i128 u8 u16 u128 f32 f64 char str string
        unit unit_struct newtype_struct tuple map
        tuple_struct enum identifier
    }
}

struct StructDeserializer<'a, 'de> {
    de: Deserializer<'a, 'de>,
    field_id: usize,
}

impl<'de> de::MapAccess<'de> for StructDeserializer<'_, 'de> {
    type Error = Error;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>>
    where
        K: de::DeserializeSeed<'de>,
    {
        let Some(layout) = self.de.layout else {
            return Ok(None);
        };
        while self.field_id < layout.fields.len() {
            if layout.fields[self.field_id].is_some() {
                // Wire field ids start at 1; serde indices at 0.
                let serde_id = self.field_id as u64 - 1;
                return seed
                    .deserialize(de::value::U64Deserializer::new(serde_id))
                    .map(Some);
            }
            self.field_id += 1;
        }
        Ok(None)
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value>
    where
        V: de::DeserializeSeed<'de>,
    {
        let id = self.field_id as u16;
        self.field_id += 1;
        seed.deserialize(self.de.field(id))
    }
}

struct SeqDeserializer<'a, 'de> {
    elem_de: Deserializer<'a, 'de>,
    len: u32,
}

impl<'de> de::SeqAccess<'de> for SeqDeserializer<'_, 'de> {
    type Error = Error;

    fn size_hint(&self) -> Option<usize> {
        self.len.try_into().ok()
    }

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>>
    where
        T: de::DeserializeSeed<'de>,
    {
        if self.len == 0 {
            return Ok(None);
        }
        let ret = seed.deserialize(self.elem_de);
        self.len -= 1;
        if let Some(layout) = self.elem_de.layout {
            self.elem_de.bit_offset += u64::from(layout.bits);
        }
        ret.map(Some)
    }
}
