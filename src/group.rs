//! The symbol/group query model (C7, §4.7).
//!
//! `SymbolGroup` is a lazy view: every filter/sort method returns a new
//! group over a (possibly reordered) subset of indices into the same
//! `SizeInfo`, so chaining operators never copies symbol data.

use std::collections::BTreeMap;
use std::sync::Arc;

use regex::Regex;

use crate::model::{SectionTag, SizeInfo, Symbol};

/// A composable view over a subset of `info.symbols`, identified by index.
#[derive(Clone)]
pub struct SymbolGroup<'a> {
    info: &'a SizeInfo,
    indices: Vec<usize>,
}

impl<'a> SymbolGroup<'a> {
    /// The full symbol list as a group.
    pub fn all(info: &'a SizeInfo) -> Self {
        SymbolGroup {
            info,
            indices: (0..info.symbols.len()).collect(),
        }
    }

    fn from_indices(info: &'a SizeInfo, indices: Vec<usize>) -> Self {
        SymbolGroup { info, indices }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &'a Symbol> + '_ {
        self.indices.iter().map(move |&i| &self.info.symbols[i])
    }

    /// Sum of proportional size over every symbol in the group.
    pub fn pss(&self) -> f64 {
        self.symbols().map(|s| self.info.pss(s)).sum()
    }

    /// Number of distinct alias groups represented, counting un-aliased
    /// symbols individually (§4.7 PSS/`count_unique_symbols`).
    pub fn count_unique_symbols(&self) -> usize {
        let mut seen_groups = std::collections::HashSet::new();
        let mut count = 0;
        for symbol in self.symbols() {
            match symbol.alias_group {
                Some(group) => {
                    if seen_groups.insert(group) {
                        count += 1;
                    }
                }
                None => count += 1,
            }
        }
        count
    }

    /// Generic predicate filter; every named `where_*` method below is
    /// expressed in terms of this.
    pub fn filter(&self, predicate: impl Fn(&Symbol) -> bool) -> Self {
        let indices = self
            .indices
            .iter()
            .copied()
            .filter(|&i| predicate(&self.info.symbols[i]))
            .collect();
        SymbolGroup::from_indices(self.info, indices)
    }

    pub fn where_section(&self, tag: SectionTag) -> Self {
        self.filter(|s| s.section == Some(tag))
    }

    pub fn where_in_section(&self, tag: SectionTag) -> Self {
        self.where_section(tag)
    }

    pub fn where_name_matches(&self, regex: &Regex) -> Self {
        self.filter(|s| regex.is_match(&s.name))
    }

    pub fn where_full_name_matches(&self, regex: &Regex) -> Self {
        self.filter(|s| regex.is_match(&s.full_name))
    }

    pub fn where_source_path_matches(&self, regex: &Regex) -> Self {
        self.filter(|s| s.source_path.as_deref().is_some_and(|p| regex.is_match(p)))
    }

    pub fn where_object_path_matches(&self, regex: &Regex) -> Self {
        self.filter(|s| s.object_path.as_deref().is_some_and(|p| regex.is_match(p)))
    }

    pub fn where_pss_above(&self, n: f64) -> Self {
        self.filter(|s| self.info.pss(s) > n)
    }

    pub fn where_is_template(&self) -> Self {
        self.filter(|s| s.full_name.as_ref() != s.template_name.as_ref())
    }

    pub fn where_source_is_generated(&self) -> Self {
        self.filter(|s| s.generated_source)
    }

    pub fn where_has_any_attribution(&self) -> Self {
        self.filter(|s| s.object_path.is_some() || s.source_path.is_some())
    }

    /// The complement of this group within the full symbol list.
    pub fn inverted(&self) -> Self {
        let current: std::collections::HashSet<usize> = self.indices.iter().copied().collect();
        let indices = (0..self.info.symbols.len())
            .filter(|i| !current.contains(i))
            .collect();
        SymbolGroup::from_indices(self.info, indices)
    }

    /// Sorted by `|pss|` descending, then by name (§4.7).
    pub fn sorted(&self) -> Self {
        let mut indices = self.indices.clone();
        indices.sort_by(|&a, &b| {
            let sa = &self.info.symbols[a];
            let sb = &self.info.symbols[b];
            self.info
                .pss(sb)
                .abs()
                .partial_cmp(&self.info.pss(sa).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| sa.name.cmp(&sb.name))
        });
        SymbolGroup::from_indices(self.info, indices)
    }

    fn group_by(&self, key_fn: impl Fn(&Symbol) -> Arc<str>) -> BTreeMap<Arc<str>, Vec<usize>> {
        let mut groups: BTreeMap<Arc<str>, Vec<usize>> = BTreeMap::new();
        for &i in &self.indices {
            let key = key_fn(&self.info.symbols[i]);
            groups.entry(key).or_default().push(i);
        }
        groups
    }

    /// Groups by `name` truncated to the first `depth` path-like components
    /// (depth 0 = no truncation) — used for rollups by namespace prefix.
    pub fn grouped_by_name(&self, depth: usize) -> Vec<(Arc<str>, Self)> {
        let key_fn = |s: &Symbol| -> Arc<str> {
            if depth == 0 {
                return s.name.clone();
            }
            let truncated: String = s
                .name
                .split("::")
                .take(depth)
                .collect::<Vec<_>>()
                .join("::");
            Arc::from(truncated.as_str())
        };
        self.group_by(key_fn)
            .into_iter()
            .map(|(key, indices)| (key, SymbolGroup::from_indices(self.info, indices)))
            .collect()
    }

    pub fn grouped_by_full_name(&self) -> Vec<(Arc<str>, Self)> {
        self.group_by(|s| s.full_name.clone())
            .into_iter()
            .map(|(key, indices)| (key, SymbolGroup::from_indices(self.info, indices)))
            .collect()
    }

    pub fn grouped_by_section(&self) -> Vec<(Option<SectionTag>, Self)> {
        let mut groups: BTreeMap<Option<u8>, Vec<usize>> = BTreeMap::new();
        for &i in &self.indices {
            let tag = self.info.symbols[i].section.map(SectionTag::as_char).map(|c| c as u8);
            groups.entry(tag).or_default().push(i);
        }
        groups
            .into_iter()
            .map(|(tag, indices)| {
                let section = tag.map(|c| match c as char {
                    't' => SectionTag::Text,
                    'r' => SectionTag::Rodata,
                    'd' => SectionTag::Data,
                    'b' => SectionTag::Bss,
                    _ => unreachable!(),
                });
                (section, SymbolGroup::from_indices(self.info, indices))
            })
            .collect()
    }

    /// Set difference: symbols in `self` but not `other`, by index identity.
    pub fn subtract(&self, other: &Self) -> Self {
        let other_indices: std::collections::HashSet<usize> = other.indices.iter().copied().collect();
        let indices = self
            .indices
            .iter()
            .copied()
            .filter(|i| !other_indices.contains(i))
            .collect();
        SymbolGroup::from_indices(self.info, indices)
    }

    /// Set union: symbols present in either group, deduplicated by index.
    pub fn union(&self, other: &Self) -> Self {
        let mut seen: std::collections::HashSet<usize> = self.indices.iter().copied().collect();
        let mut indices = self.indices.clone();
        for &i in &other.indices {
            if seen.insert(i) {
                indices.push(i);
            }
        }
        SymbolGroup::from_indices(self.info, indices)
    }

    pub fn is_subset_of(&self, other: &Self) -> bool {
        let other_indices: std::collections::HashSet<usize> = other.indices.iter().copied().collect();
        self.indices.iter().all(|i| other_indices.contains(i))
    }
}

impl<'a> std::ops::Sub for SymbolGroup<'a> {
    type Output = SymbolGroup<'a>;
    fn sub(self, rhs: Self) -> Self::Output {
        self.subtract(&rhs)
    }
}

impl<'a> std::ops::Add for SymbolGroup<'a> {
    type Output = SymbolGroup<'a>;
    fn add(self, rhs: Self) -> Self::Output {
        self.union(&rhs)
    }
}

impl<'a> PartialEq for SymbolGroup<'a> {
    fn eq(&self, other: &Self) -> bool {
        let a: std::collections::HashSet<usize> = self.indices.iter().copied().collect();
        let b: std::collections::HashSet<usize> = other.indices.iter().copied().collect();
        a == b
    }
}
