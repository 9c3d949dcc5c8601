//! The symbol/section/size-info data model (C7 core types, §3).

use std::collections::BTreeMap;
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// One of the four section families a symbol can belong to. Collapsed from
/// the full section name (`.text.foo` -> `Text`, any `.data*` -> `Data`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SectionTag {
    Text,
    Rodata,
    Data,
    Bss,
}

impl SectionTag {
    /// The one-letter tag used throughout the design (`t|r|d|b`).
    pub fn as_char(self) -> char {
        match self {
            SectionTag::Text => 't',
            SectionTag::Rodata => 'r',
            SectionTag::Data => 'd',
            SectionTag::Bss => 'b',
        }
    }

    /// Classifies a raw section name (e.g. `.text.unlikely`) into its tag, or
    /// `None` for sections that carry no attributable symbols (`.rel.dyn` and
    /// the like — tracked only in `section_sizes`).
    pub fn classify(section_name: &str) -> Option<SectionTag> {
        if section_name.starts_with(".text") {
            Some(SectionTag::Text)
        } else if section_name.starts_with(".rodata") {
            Some(SectionTag::Rodata)
        } else if section_name.starts_with(".data") {
            Some(SectionTag::Data)
        } else if section_name.starts_with(".bss") {
            Some(SectionTag::Bss)
        } else {
            None
        }
    }
}

bitflags! {
    /// Per-symbol flags (§3 Symbol.flags).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SymbolFlags: u8 {
        /// Name had a `startup.` linker prefix.
        const STARTUP   = 0b0000_0001;
        /// Name had an `unlikely.` linker prefix.
        const UNLIKELY  = 0b0000_0010;
        /// Name had a `rel.` linker prefix.
        const REL       = 0b0000_0100;
        /// Name had a `rel.local.` linker prefix.
        const REL_LOCAL = 0b0000_1000;
        /// Name carried a `[clone ...]` suffix.
        const CLONE     = 0b0001_0000;
        /// Name contained `(anonymous namespace)::`.
        const ANONYMOUS = 0b0010_0000;
    }
}

/// Opaque handle into [`SizeInfo::alias_groups`]. Two symbols share an alias
/// group iff their `alias_group` fields compare equal — an arena index rather
/// than a shared pointer, per the "never a copy per symbol" guidance in the
/// design notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AliasGroupId(pub u32);

/// An alias group: symbols occupying the same address under different names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliasGroup {
    /// Number of symbols that reference this group. Kept denormalized so PSS
    /// computation doesn't need to scan the whole symbol list.
    pub member_count: u32,
}

mod arc_str {
    use std::sync::Arc;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error> {
        value.as_ref().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Arc<str>, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s))
    }
}

/// The central entity: one contribution to the binary's size (§3 Symbol).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symbol {
    /// Original section name, e.g. `.text.foo`.
    #[serde(with = "arc_str")]
    pub section_name: Arc<str>,
    pub section: Option<SectionTag>,
    /// `0` means "no address" (common symbols, padding placeholders).
    pub address: u64,
    /// Bytes occupied, including any padding folded in during C6 stage 6.
    pub size: u64,
    /// Bytes of gap before this symbol within its section.
    pub padding: u64,
    #[serde(with = "arc_str")]
    pub full_name: Arc<str>,
    #[serde(with = "arc_str")]
    pub template_name: Arc<str>,
    #[serde(with = "arc_str")]
    pub name: Arc<str>,
    pub object_path: Option<String>,
    pub source_path: Option<String>,
    pub generated_source: bool,
    pub flags: SymbolFlags,
    pub alias_group: Option<AliasGroupId>,
}

impl Symbol {
    /// `size` minus the padding folded into it — the byte count this symbol
    /// would occupy if it started immediately after its predecessor.
    pub fn size_without_padding(&self) -> u64 {
        self.size.saturating_sub(self.padding)
    }

    /// The address immediately after this symbol's own bytes (excluding
    /// padding, since padding belongs to whatever comes after).
    pub fn end_address(&self) -> u64 {
        self.address + self.size_without_padding()
    }

    /// True for the synthetic gap/fill/merge placeholders C5 emits (`full_name`
    /// starting with `**`).
    pub fn is_padding_only(&self) -> bool {
        self.full_name.starts_with("**")
    }
}

/// Free-form run metadata: git revision, architecture, ELF mtime, build-id,
/// tool prefix, `gn` args, file names (§3 Lifecycle).
pub type Metadata = BTreeMap<String, String>;

/// Owns the whole symbol graph produced by one archive run (§3 Lifecycle).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizeInfo {
    pub symbols: Vec<Symbol>,
    pub section_sizes: BTreeMap<String, u64>,
    pub alias_groups: Vec<AliasGroup>,
    pub metadata: Metadata,
}

impl SizeInfo {
    pub fn new() -> Self {
        SizeInfo {
            symbols: Vec::new(),
            section_sizes: BTreeMap::new(),
            alias_groups: Vec::new(),
            metadata: Metadata::new(),
        }
    }

    /// Proportional size of one symbol: `size / |aliases|` if aliased, else
    /// `size` (§3 invariant 3, GLOSSARY "PSS").
    pub fn pss(&self, symbol: &Symbol) -> f64 {
        match symbol.alias_group {
            Some(id) => {
                let count = self.alias_groups[id.0 as usize].member_count.max(1);
                symbol.size as f64 / count as f64
            }
            None => symbol.size as f64,
        }
    }

    /// Proportional padding of one symbol, the same alias-splitting `pss`
    /// applies to `size` (§3 invariant 3 applies equally to `padding`, since
    /// alias-group members share an identical `padding` value).
    pub fn padding_pss(&self, symbol: &Symbol) -> f64 {
        match symbol.alias_group {
            Some(id) => {
                let count = self.alias_groups[id.0 as usize].member_count.max(1);
                symbol.padding as f64 / count as f64
            }
            None => symbol.padding as f64,
        }
    }
}

impl Default for SizeInfo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(name: &str, size: u64, alias_group: Option<AliasGroupId>) -> Symbol {
        Symbol {
            section_name: Arc::from(".text"),
            section: Some(SectionTag::Text),
            address: 0x1000,
            size,
            padding: 0,
            full_name: Arc::from(name),
            template_name: Arc::from(name),
            name: Arc::from(name),
            object_path: None,
            source_path: None,
            generated_source: false,
            flags: SymbolFlags::empty(),
            alias_group,
        }
    }

    #[test]
    fn pss_splits_across_alias_group() {
        let mut info = SizeInfo::new();
        info.alias_groups.push(AliasGroup { member_count: 2 });
        let group = Some(AliasGroupId(0));
        let a = sym("foo", 0x20, group);
        let b = sym("foo_alias", 0x20, group);
        assert_eq!(info.pss(&a), 0x10 as f64);
        assert_eq!(info.pss(&b), 0x10 as f64);
    }

    #[test]
    fn pss_is_size_without_aliases() {
        let info = SizeInfo::new();
        let a = sym("foo", 0x20, None);
        assert_eq!(info.pss(&a), 0x20 as f64);
    }

    #[test]
    fn padding_pss_splits_across_alias_group() {
        let mut info = SizeInfo::new();
        info.alias_groups.push(AliasGroup { member_count: 2 });
        let group = Some(AliasGroupId(0));
        let mut a = sym("foo", 0x20, group);
        a.padding = 4;
        assert_eq!(info.padding_pss(&a), 2.0);
    }

    #[test]
    fn section_classification() {
        assert_eq!(SectionTag::classify(".text.foo"), Some(SectionTag::Text));
        assert_eq!(SectionTag::classify(".data.rel.ro"), Some(SectionTag::Data));
        assert_eq!(SectionTag::classify(".rodata"), Some(SectionTag::Rodata));
        assert_eq!(SectionTag::classify(".bss"), Some(SectionTag::Bss));
        assert_eq!(SectionTag::classify(".rel.dyn"), None);
    }
}
