//! Stable type tags for shared payloads
//!
//! Records carry a numeric tag instead of a compiler-generated type identity,
//! which would differ between builds. Every process that shares a variable
//! must register the same tag for the same payload type; the table also holds
//! the text renderers used by `Display` and the monitor CLI.

use crate::error::{ShmError, ShmResult};
use crate::placement::ShmValue;
use parking_lot::RwLock;
use std::any::{TypeId, type_name};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64};

/// Numeric payload type identifier recorded in the segment
pub type TypeTag = u32;

/// Render a payload as text
pub type Formatter = fn(&[u8]) -> String;

/// Parse text into payload bytes, `None` if the text is not a valid value
pub type Parser = fn(&str) -> Option<Vec<u8>>;

/// Tags of the built-in payload types
pub mod tags {
    use super::TypeTag;

    pub const BOOL: TypeTag = 1;
    pub const I8: TypeTag = 2;
    pub const U8: TypeTag = 3;
    pub const I16: TypeTag = 4;
    pub const U16: TypeTag = 5;
    pub const I32: TypeTag = 6;
    pub const U32: TypeTag = 7;
    pub const I64: TypeTag = 8;
    pub const U64: TypeTag = 9;
    pub const F32: TypeTag = 10;
    pub const F64: TypeTag = 11;
    pub const ATOMIC_BOOL: TypeTag = 20;
    pub const ATOMIC_I32: TypeTag = 21;
    pub const ATOMIC_U32: TypeTag = 22;
    pub const ATOMIC_I64: TypeTag = 23;
    pub const ATOMIC_U64: TypeTag = 24;

    /// First tag free for application types
    pub const FIRST_USER: TypeTag = 1000;
}

/// One registered payload type
#[derive(Debug, Clone, Copy)]
pub struct TypeEntry {
    /// Tag recorded in the segment
    pub tag: TypeTag,
    /// Human-readable type name
    pub name: &'static str,
    /// Payload size in bytes
    pub size: usize,
    /// Text renderer
    pub formatter: Option<Formatter>,
    /// Text parser
    pub parser: Option<Parser>,
}

#[derive(Default)]
struct Tables {
    by_type: HashMap<TypeId, TypeEntry>,
    by_tag: HashMap<TypeTag, (TypeId, TypeEntry)>,
}

/// Process-local mapping between Rust types and stable tags
#[derive(Default)]
pub struct TypeTable {
    inner: RwLock<Tables>,
}

impl std::fmt::Debug for TypeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.entries()).finish()
    }
}

macro_rules! numeric {
    ($table:expr, $t:ty, $repr:ty, $tag:expr) => {
        $table.insert::<$t>(
            $tag,
            stringify!($t),
            Some(|bytes: &[u8]| match <[u8; size_of::<$repr>()]>::try_from(bytes) {
                Ok(raw) => <$repr>::from_ne_bytes(raw).to_string(),
                Err(_) => hex_dump(bytes),
            }),
            Some(|text: &str| {
                text.trim()
                    .parse::<$repr>()
                    .ok()
                    .map(|value| value.to_ne_bytes().to_vec())
            }),
        )
    };
}

impl TypeTable {
    /// Table without any registrations
    pub fn new() -> Self {
        Self::default()
    }

    /// Table preloaded with the primitive and atomic types
    pub fn with_builtins() -> Self {
        let table = Self::new();
        let mut t = table.inner.write();

        t.insert::<bool>(tags::BOOL, "bool", Some(format_bool), Some(parse_bool));
        numeric!(t, i8, i8, tags::I8);
        numeric!(t, u8, u8, tags::U8);
        numeric!(t, i16, i16, tags::I16);
        numeric!(t, u16, u16, tags::U16);
        numeric!(t, i32, i32, tags::I32);
        numeric!(t, u32, u32, tags::U32);
        numeric!(t, i64, i64, tags::I64);
        numeric!(t, u64, u64, tags::U64);
        numeric!(t, f32, f32, tags::F32);
        numeric!(t, f64, f64, tags::F64);
        t.insert::<AtomicBool>(
            tags::ATOMIC_BOOL,
            "AtomicBool",
            Some(format_bool),
            Some(parse_bool),
        );
        numeric!(t, AtomicI32, i32, tags::ATOMIC_I32);
        numeric!(t, AtomicU32, u32, tags::ATOMIC_U32);
        numeric!(t, AtomicI64, i64, tags::ATOMIC_I64);
        numeric!(t, AtomicU64, u64, tags::ATOMIC_U64);

        drop(t);
        table
    }

    /// Bind `T` to `tag` without text support.
    pub fn register<T: ShmValue>(&self, tag: TypeTag, name: &'static str) -> ShmResult<()> {
        self.register_with::<T>(tag, name, None, None)
    }

    /// Bind `T` to `tag`.
    ///
    /// Registering the same type under the same tag again is a no-op.
    pub fn register_with<T: ShmValue>(
        &self,
        tag: TypeTag,
        name: &'static str,
        formatter: Option<Formatter>,
        parser: Option<Parser>,
    ) -> ShmResult<()> {
        if tag == 0 {
            return Err(ShmError::InvalidTypeTag { tag });
        }

        let mut t = self.inner.write();
        if let Some((id, existing)) = t.by_tag.get(&tag) {
            if *id == TypeId::of::<T>() {
                return Ok(());
            }
            return Err(ShmError::DuplicateTypeTag {
                tag,
                existing: existing.name,
            });
        }
        if let Some(existing) = t.by_type.get(&TypeId::of::<T>()) {
            return Err(ShmError::DuplicateTypeTag {
                tag: existing.tag,
                existing: existing.name,
            });
        }

        t.insert::<T>(tag, name, formatter, parser);
        tracing::debug!("Registered type tag {} for {}", tag, type_name::<T>());
        Ok(())
    }

    /// Tag registered for `T`
    pub fn tag_of<T: 'static>(&self) -> Option<TypeTag> {
        self.inner
            .read()
            .by_type
            .get(&TypeId::of::<T>())
            .map(|entry| entry.tag)
    }

    /// Registration of `tag`
    pub fn entry(&self, tag: TypeTag) -> Option<TypeEntry> {
        self.inner.read().by_tag.get(&tag).map(|(_, entry)| *entry)
    }

    /// All registrations, ordered by tag
    pub fn entries(&self) -> Vec<TypeEntry> {
        let mut entries: Vec<_> = self.inner.read().by_type.values().copied().collect();
        entries.sort_by_key(|entry| entry.tag);
        entries
    }

    /// Render a payload recorded under `tag`, hex dump as fallback.
    pub fn render(&self, tag: TypeTag, bytes: &[u8]) -> String {
        match self.entry(tag) {
            Some(TypeEntry {
                formatter: Some(format),
                size,
                ..
            }) if size == bytes.len() => format(bytes),
            _ => hex_dump(bytes),
        }
    }

    /// Render a payload of type `T`, hex dump as fallback.
    pub fn render_type<T: 'static>(&self, bytes: &[u8]) -> String {
        match self.tag_of::<T>() {
            Some(tag) => self.render(tag, bytes),
            None => hex_dump(bytes),
        }
    }

    /// Parse text into a payload recorded under `tag`.
    pub fn parse(&self, tag: TypeTag, text: &str) -> Option<Vec<u8>> {
        let entry = self.entry(tag)?;
        entry
            .parser
            .and_then(|parse| parse(text))
            .filter(|bytes| bytes.len() == entry.size)
    }
}

impl Tables {
    fn insert<T: 'static>(
        &mut self,
        tag: TypeTag,
        name: &'static str,
        formatter: Option<Formatter>,
        parser: Option<Parser>,
    ) {
        let entry = TypeEntry {
            tag,
            name,
            size: size_of::<T>(),
            formatter,
            parser,
        };
        self.by_type.insert(TypeId::of::<T>(), entry);
        self.by_tag.insert(tag, (TypeId::of::<T>(), entry));
    }
}

fn format_bool(bytes: &[u8]) -> String {
    match bytes {
        [0] => "false".to_string(),
        [_] => "true".to_string(),
        _ => hex_dump(bytes),
    }
}

fn parse_bool(text: &str) -> Option<Vec<u8>> {
    match text.trim() {
        "true" | "1" | "on" => Some(vec![1]),
        "false" | "0" | "off" => Some(vec![0]),
        _ => None,
    }
}

/// Up to 16 bytes as uppercase hex, `...` when truncated
pub fn hex_dump(bytes: &[u8]) -> String {
    const SHOWN: usize = 16;

    let mut out = String::with_capacity(SHOWN * 3 + 3);
    for (i, byte) in bytes.iter().take(SHOWN).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{byte:02X}");
    }
    if bytes.len() > SHOWN {
        out.push_str(" ...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Pose {
        _x: f32,
        _y: f32,
    }

    unsafe impl ShmValue for Pose {}

    #[test]
    fn test_builtins_render_and_parse() {
        let table = TypeTable::with_builtins();

        assert_eq!(table.tag_of::<i32>(), Some(tags::I32));
        assert_eq!(table.render(tags::I32, &(-42i32).to_ne_bytes()), "-42");
        assert_eq!(table.render(tags::F64, &1.5f64.to_ne_bytes()), "1.5");
        assert_eq!(table.render(tags::ATOMIC_BOOL, &[1]), "true");
        assert_eq!(table.render_type::<u16>(&513u16.to_ne_bytes()), "513");

        assert_eq!(table.parse(tags::U64, " 7 "), Some(7u64.to_ne_bytes().to_vec()));
        assert_eq!(table.parse(tags::BOOL, "off"), Some(vec![0]));
        assert_eq!(table.parse(tags::I8, "300"), None);
    }

    #[test]
    fn test_render_falls_back_to_hex() {
        let table = TypeTable::with_builtins();
        assert_eq!(table.render(tags::I32, &[1, 2]), "01 02");
        assert_eq!(table.render(9999, &[0xAB, 0xCD]), "AB CD");
        assert_eq!(table.render_type::<Pose>(&[0; 4]), "00 00 00 00");
    }

    #[test]
    fn test_hex_dump_truncates_after_sixteen_bytes() {
        assert_eq!(hex_dump(&[]), "");
        let long: Vec<u8> = (0..20).collect();
        assert_eq!(
            hex_dump(&long),
            "00 01 02 03 04 05 06 07 08 09 0A 0B 0C 0D 0E 0F ..."
        );
    }

    #[test]
    fn test_register_application_type() {
        let table = TypeTable::with_builtins();
        table.register::<Pose>(tags::FIRST_USER, "Pose").unwrap();
        table.register::<Pose>(tags::FIRST_USER, "Pose").unwrap();

        let entry = table.entry(tags::FIRST_USER).unwrap();
        assert_eq!(entry.name, "Pose");
        assert_eq!(entry.size, 8);
        assert!(table.parse(tags::FIRST_USER, "1").is_none());
    }

    #[test]
    fn test_register_conflicts() {
        let table = TypeTable::with_builtins();

        assert!(matches!(
            table.register::<Pose>(0, "Pose"),
            Err(ShmError::InvalidTypeTag { tag: 0 })
        ));
        assert!(matches!(
            table.register::<Pose>(tags::U8, "Pose"),
            Err(ShmError::DuplicateTypeTag { tag: tags::U8, existing: "u8" })
        ));
        assert!(matches!(
            table.register::<u8>(tags::FIRST_USER, "byte"),
            Err(ShmError::DuplicateTypeTag { tag: tags::U8, .. })
        ));
    }

    #[test]
    fn test_entries_are_sorted() {
        let table = TypeTable::with_builtins();
        let tags: Vec<_> = table.entries().iter().map(|e| e.tag).collect();
        let mut sorted = tags.clone();
        sorted.sort_unstable();
        assert_eq!(tags, sorted);
        assert_eq!(tags.len(), 16);
    }
}
