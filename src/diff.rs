//! Symbol-group diffing (C7 diff, §4.7).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::model::{SectionTag, SizeInfo, Symbol, SymbolFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaStatus {
    Unchanged,
    Changed,
    Added,
    Removed,
}

/// A paired `(before?, after?)` symbol, at least one side present.
#[derive(Debug, Clone)]
pub struct DeltaSymbol {
    pub before: Option<Symbol>,
    pub after: Option<Symbol>,
    pub status: DeltaStatus,
}

impl DeltaSymbol {
    /// `after.pss - before.pss`, treating a missing side as zero.
    pub fn pss_delta(&self, before_info: &SizeInfo, after_info: &SizeInfo) -> f64 {
        let after_pss = self.after.as_ref().map(|s| after_info.pss(s)).unwrap_or(0.0);
        let before_pss = self.before.as_ref().map(|s| before_info.pss(s)).unwrap_or(0.0);
        after_pss - before_pss
    }
}

pub struct DeltaSizeInfo {
    pub section_sizes_diff: BTreeMap<String, i64>,
    pub symbols: Vec<DeltaSymbol>,
    pub before_metadata: crate::model::Metadata,
    pub after_metadata: crate::model::Metadata,
}

/// Computes a symbol's diff key, robust to nondeterministic numeric suffixes
/// on compiler-generated names (§4.7 diff step 1).
fn symbol_key(symbol: &Symbol) -> String {
    if symbol.full_name.starts_with("** symbol gap") {
        return "** symbol gaps".to_string();
    }
    if symbol.full_name.contains('.') {
        let stripped: String = symbol
            .full_name
            .chars()
            .filter(|c| !c.is_ascii_digit() && *c != '.')
            .collect();
        let object_path = symbol.object_path.as_deref().unwrap_or("");
        return format!("{stripped}\u{0}{object_path}");
    }
    let tag = symbol.section.map(SectionTag::as_char).unwrap_or('?');
    format!("{tag}\u{0}{}", symbol.full_name)
}

/// Buckets `before` symbols by key, then for each `after` symbol pops the
/// first matching `before` (appearance order) to form a pair; leftovers
/// become one-sided deltas (§4.7 diff step 2).
pub fn diff(before_info: &SizeInfo, after_info: &SizeInfo) -> DeltaSizeInfo {
    let mut before_buckets: HashMap<String, std::collections::VecDeque<usize>> = HashMap::new();
    for (i, symbol) in before_info.symbols.iter().enumerate() {
        before_buckets.entry(symbol_key(symbol)).or_default().push_back(i);
    }

    let mut deltas = Vec::new();
    let mut padding_aggregate: BTreeMap<Arc<str>, f64> = BTreeMap::new();
    let mut matched_before: std::collections::HashSet<usize> = std::collections::HashSet::new();

    for after_symbol in &after_info.symbols {
        let key = symbol_key(after_symbol);
        let before_index = before_buckets
            .get_mut(&key)
            .and_then(|queue| queue.pop_front());

        match before_index {
            Some(idx) => {
                matched_before.insert(idx);
                let before_symbol = before_info.symbols[idx].clone();
                let mut after_clone = after_symbol.clone();

                // Step 3: matched pairs with real bytes don't carry their
                // padding delta individually — it is rolled into a signed,
                // alias-split per-section aggregate instead (a decrease in
                // padding is as real a delta as an increase).
                if after_clone.size_without_padding() > 0 {
                    let padding_delta = after_info.padding_pss(&after_clone)
                        - before_info.padding_pss(&before_symbol);
                    if padding_delta != 0.0 {
                        *padding_aggregate
                            .entry(after_clone.section_name.clone())
                            .or_insert(0.0) += padding_delta;
                    }
                    after_clone.padding = before_symbol.padding;
                    after_clone.size = after_clone.size_without_padding() + before_symbol.padding;
                }

                let status = if before_symbol.size == after_clone.size
                    && before_symbol.padding == after_clone.padding
                {
                    DeltaStatus::Unchanged
                } else {
                    DeltaStatus::Changed
                };
                deltas.push(DeltaSymbol {
                    before: Some(before_symbol),
                    after: Some(after_clone),
                    status,
                });
            }
            None => {
                deltas.push(DeltaSymbol {
                    before: None,
                    after: Some(after_symbol.clone()),
                    status: DeltaStatus::Added,
                });
            }
        }
    }

    for (i, before_symbol) in before_info.symbols.iter().enumerate() {
        if !matched_before.contains(&i) {
            deltas.push(DeltaSymbol {
                before: Some(before_symbol.clone()),
                after: None,
                status: DeltaStatus::Removed,
            });
        }
    }

    for (section_name, padding_delta) in padding_aggregate {
        if padding_delta == 0.0 {
            continue;
        }
        let magnitude = padding_delta.abs().round() as u64;
        let synthetic = aggregate_padding_symbol(&section_name, magnitude);
        if padding_delta > 0.0 {
            deltas.push(DeltaSymbol {
                before: None,
                after: Some(synthetic),
                status: DeltaStatus::Added,
            });
        } else {
            deltas.push(DeltaSymbol {
                before: Some(synthetic),
                after: None,
                status: DeltaStatus::Removed,
            });
        }
    }

    let mut section_sizes_diff = BTreeMap::new();
    let mut names: std::collections::BTreeSet<&String> = before_info.section_sizes.keys().collect();
    names.extend(after_info.section_sizes.keys());
    for name in names {
        let before = *before_info.section_sizes.get(name).unwrap_or(&0) as i64;
        let after = *after_info.section_sizes.get(name).unwrap_or(&0) as i64;
        section_sizes_diff.insert(name.clone(), after - before);
    }

    DeltaSizeInfo {
        section_sizes_diff,
        symbols: deltas,
        before_metadata: before_info.metadata.clone(),
        after_metadata: after_info.metadata.clone(),
    }
}

fn aggregate_padding_symbol(section_name: &str, padding: u64) -> Symbol {
    Symbol {
        section_name: Arc::from(section_name),
        section: SectionTag::classify(section_name),
        address: 0,
        size: padding,
        padding,
        full_name: Arc::from("** aggregate padding of diff'ed symbols"),
        template_name: Arc::from("** aggregate padding of diff'ed symbols"),
        name: Arc::from("** aggregate padding of diff'ed symbols"),
        object_path: None,
        source_path: None,
        generated_source: false,
        flags: SymbolFlags::empty(),
        alias_group: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AliasGroup, AliasGroupId};

    fn sym(name: &str, size: u64, padding: u64) -> Symbol {
        Symbol {
            section_name: Arc::from(".text"),
            section: Some(SectionTag::Text),
            address: 0x1000,
            size,
            padding,
            full_name: Arc::from(name),
            template_name: Arc::from(name),
            name: Arc::from(name),
            object_path: Some("a.o".to_string()),
            source_path: None,
            generated_source: false,
            flags: SymbolFlags::empty(),
            alias_group: None,
        }
    }

    #[test]
    fn scenario_f_padding_aggregation() {
        let mut before = SizeInfo::new();
        before.symbols.push(sym("foo", 10, 0));
        let mut after = SizeInfo::new();
        after.symbols.push(sym("foo", 14, 4));

        let delta = diff(&before, &after);
        let matched = delta
            .symbols
            .iter()
            .find(|d| d.before.is_some() && d.after.is_some())
            .unwrap();
        assert_eq!(matched.after.as_ref().unwrap().padding, 0);

        let aggregate = delta
            .symbols
            .iter()
            .find(|d| {
                d.after
                    .as_ref()
                    .is_some_and(|s| s.full_name.starts_with("** aggregate padding"))
            })
            .unwrap();
        assert_eq!(aggregate.after.as_ref().unwrap().padding, 4);
    }

    #[test]
    fn digit_bearing_names_do_not_collide() {
        let mut before = SizeInfo::new();
        before.symbols.push(sym("sha256_init", 10, 0));
        before.symbols.push(sym("sha512_init", 20, 0));
        let after = before.clone();

        let delta = diff(&before, &after);
        assert!(delta
            .symbols
            .iter()
            .all(|d| d.status == DeltaStatus::Unchanged));
    }

    #[test]
    fn padding_decrease_on_aliased_symbol_yields_negative_pss_delta() {
        let mut before = SizeInfo::new();
        before.alias_groups.push(AliasGroup { member_count: 2 });
        let group = Some(AliasGroupId(0));
        let mut before_a = sym("foo", 24, 8);
        before_a.alias_group = group;
        let mut before_b = sym("foo_alias", 24, 8);
        before_b.alias_group = group;
        before.symbols.push(before_a);
        before.symbols.push(before_b);

        let mut after = SizeInfo::new();
        after.alias_groups.push(AliasGroup { member_count: 2 });
        let mut after_a = sym("foo", 16, 0);
        after_a.alias_group = group;
        let mut after_b = sym("foo_alias", 16, 0);
        after_b.alias_group = group;
        after.symbols.push(after_a);
        after.symbols.push(after_b);

        let delta = diff(&before, &after);
        let aggregate = delta
            .symbols
            .iter()
            .find(|d| {
                d.before
                    .as_ref()
                    .is_some_and(|s| s.full_name.starts_with("** aggregate padding"))
            })
            .unwrap();
        assert_eq!(aggregate.status, DeltaStatus::Removed);
        // before padding_pss = 8/2 = 4 per member, after = 0; two members ->
        // -4 each, -8 total.
        assert_eq!(aggregate.pss_delta(&before, &after), -8.0);
    }

    #[test]
    fn diff_idempotence_has_zero_pss_delta() {
        let mut info = SizeInfo::new();
        info.symbols.push(sym("foo", 10, 0));
        info.symbols.push(sym("bar", 20, 0));

        let delta = diff(&info, &info);
        assert!(delta
            .symbols
            .iter()
            .all(|d| d.status != DeltaStatus::Added && d.status != DeltaStatus::Removed));
        let total: f64 = delta.symbols.iter().map(|d| d.pss_delta(&info, &info)).sum();
        assert_eq!(total, 0.0);
    }

    #[test]
    fn unmatched_symbols_become_added_or_removed() {
        let mut before = SizeInfo::new();
        before.symbols.push(sym("only_before", 10, 0));
        let mut after = SizeInfo::new();
        after.symbols.push(sym("only_after", 10, 0));

        let delta = diff(&before, &after);
        assert!(delta.symbols.iter().any(|d| d.status == DeltaStatus::Removed));
        assert!(delta.symbols.iter().any(|d| d.status == DeltaStatus::Added));
    }

    #[test]
    fn section_size_diff_is_after_minus_before() {
        let mut before = SizeInfo::new();
        before.section_sizes.insert(".text".to_string(), 100);
        let mut after = SizeInfo::new();
        after.section_sizes.insert(".text".to_string(), 150);

        let delta = diff(&before, &after);
        assert_eq!(delta.section_sizes_diff[".text"], 50);
    }
}
