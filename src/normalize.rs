//! Symbol normalizer (C6, §4.6): the barrier that turns C3/C4/C5's raw,
//! mutually-inconsistent output into the final symbol list. Runs the six
//! stages in order; each stage is a free function operating on the whole
//! symbol list so that they stay independently testable.

use std::collections::{BTreeMap, HashMap};
use std::io::Write as _;
use std::process::{Command, Stdio};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{DiagnosticKind, Diagnostics, Error, Result};
use crate::model::{AliasGroup, AliasGroupId, SectionTag, Symbol, SymbolFlags};
use crate::ninja::SourceMapper;
use crate::nm::ObjectNameMap;
use crate::pathutil::{common_ancestor, normalize_object_path, normalize_source_path};

/// Stage (1): strips a `startup.`/`unlikely.`/`rel.local.`/`rel.` linker
/// prefix from `full_name`, setting the matching flag. `rel.local.` is
/// checked before `rel.` since it is the longer prefix.
pub fn strip_linker_prefixes(symbols: &mut [Symbol]) {
    const PREFIXES: &[(&str, SymbolFlags)] = &[
        ("startup.", SymbolFlags::STARTUP),
        ("unlikely.", SymbolFlags::UNLIKELY),
        ("rel.local.", SymbolFlags::REL_LOCAL),
        ("rel.", SymbolFlags::REL),
    ];
    for symbol in symbols.iter_mut() {
        for (prefix, flag) in PREFIXES {
            if let Some(rest) = symbol.full_name.strip_prefix(prefix) {
                symbol.full_name = std::sync::Arc::from(rest);
                symbol.flags |= *flag;
                break;
            }
        }
    }
}

/// Stage (2): pipes every symbol whose `full_name` still starts with `_Z`
/// through `<prefix>c++filt`, one name per line, and replaces names
/// positionally with the demangled output.
pub fn demangle_residuals(symbols: &mut [Symbol], tool_prefix: &str) -> Result<()> {
    let indices: Vec<usize> = symbols
        .iter()
        .enumerate()
        .filter(|(_, s)| s.full_name.starts_with("_Z"))
        .map(|(i, _)| i)
        .collect();
    if indices.is_empty() {
        return Ok(());
    }

    let input: String = indices
        .iter()
        .map(|&i| symbols[i].full_name.as_ref())
        .collect::<Vec<_>>()
        .join("\n");

    let cfilt = format!("{tool_prefix}c++filt");
    let mut child = Command::new(&cfilt)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    child
        .stdin
        .take()
        .expect("piped stdin")
        .write_all(input.as_bytes())?;
    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Err(Error::ToolFailure {
            command: cfilt,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    let demangled = String::from_utf8(output.stdout)?;
    let lines: Vec<&str> = demangled.lines().collect();
    if lines.len() != indices.len() {
        return Err(Error::integrity(format!(
            "c++filt returned {} lines for {} inputs",
            lines.len(),
            indices.len()
        )));
    }
    for (&i, line) in indices.iter().zip(lines.iter()) {
        symbols[i].full_name = std::sync::Arc::from(*line);
    }
    Ok(())
}

static CLONE_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\s*\[clone[^\]]*\])+$").unwrap());
static TRAILING_DIGIT_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.*)\.[0-9]+$").unwrap());
static FOR_TO_REWRITE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.{1,30}?) (for|to) (.*)$").unwrap());

/// Finds the first depth-0 `(` in `s`, where depth is tracked over
/// `(`/`)`/`<`/`>`/`[`/`]`.
fn first_top_level(s: &str, open: char) -> Option<usize> {
    let mut depth: i32 = 0;
    for (idx, c) in s.char_indices() {
        match c {
            '(' | '<' | '[' => {
                if c == open && depth == 0 {
                    return Some(idx);
                }
                depth += 1;
            }
            ')' | '>' | ']' => depth -= 1,
            _ => {}
        }
    }
    None
}

/// Strips a leading return type: the text up to and including the last
/// depth-0 space before the function's parameter list, if any.
fn strip_return_type(s: &str) -> &str {
    let Some(paren_pos) = first_top_level(s, '(') else {
        return s;
    };
    let prefix = &s[..paren_pos];
    let mut depth: i32 = 0;
    let mut last_space = None;
    for (idx, c) in prefix.char_indices() {
        match c {
            '<' | '[' => depth += 1,
            '>' | ']' => depth -= 1,
            ' ' if depth == 0 => last_space = Some(idx),
            _ => {}
        }
    }
    match last_space {
        Some(idx) => &s[idx + 1..],
        None => s,
    }
}

/// Removes every depth-tracked `<...>` group, producing the template-free
/// form (keeps argument parens).
fn strip_angle_brackets(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut depth: i32 = 0;
    for c in s.chars() {
        match c {
            '<' => depth += 1,
            '>' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

/// Strips the final depth-0 `(...)` argument list, if the string ends with
/// one. Scans from the end rather than the start, so an unrelated top-level
/// paren earlier in the name (e.g. `(anonymous namespace)::`) is not
/// mistaken for the argument list.
fn strip_argument_parens(s: &str) -> String {
    if !s.ends_with(')') {
        return s.to_string();
    }
    let bytes: Vec<(usize, char)> = s.char_indices().collect();
    let mut depth: i32 = 0;
    for &(idx, c) in bytes.iter().rev() {
        match c {
            ')' => depth += 1,
            '(' => {
                depth -= 1;
                if depth == 0 {
                    return s[..idx].trim_end().to_string();
                }
            }
            _ => {}
        }
    }
    s.to_string()
}

fn parse_name_fields(raw: &str) -> (String, String, String) {
    let full_name = strip_return_type(raw).to_string();
    let template_name = strip_angle_brackets(&full_name);
    let name = strip_argument_parens(&template_name);
    (full_name, template_name, name)
}

const ANONYMOUS_NAMESPACE: &str = "(anonymous namespace)::";

/// Stage (3): clone-suffix stripping, trailing-digit stripping for C symbols,
/// `for`/`to` rewriting, return-type/template/argument splitting, and
/// anonymous-namespace removal.
pub fn normalize_names(symbols: &mut [Symbol]) {
    for symbol in symbols.iter_mut() {
        let mut raw = symbol.full_name.to_string();

        if CLONE_SUFFIX.is_match(&raw) {
            raw = CLONE_SUFFIX.replace(&raw, "").into_owned();
            symbol.flags |= SymbolFlags::CLONE;
        }

        if symbol.section == Some(SectionTag::Text)
            && !raw.contains("::")
            && raw != "__tcf_0"
            && raw != "startup"
        {
            if let Some(caps) = TRAILING_DIGIT_SUFFIX.captures(&raw) {
                raw = caps[1].to_string();
            }
        }

        if let Some(caps) = FOR_TO_REWRITE.captures(&raw) {
            raw = format!("{} [{}]", &caps[3], &caps[1]);
        }

        let (mut full_name, mut template_name, mut name) = parse_name_fields(&raw);

        if name.contains(ANONYMOUS_NAMESPACE) {
            symbol.flags |= SymbolFlags::ANONYMOUS;
        }
        full_name = full_name.replace(ANONYMOUS_NAMESPACE, "");
        template_name = template_name.replace(ANONYMOUS_NAMESPACE, "");
        name = name.replace(ANONYMOUS_NAMESPACE, "");

        symbol.full_name = std::sync::Arc::from(full_name.as_str());
        symbol.template_name = std::sync::Arc::from(template_name.as_str());
        symbol.name = std::sync::Arc::from(name.as_str());
    }
}

/// Expected alias density for gcc-style output; falling far short of it is
/// worth a single warning rather than one per address (§4.6 stage 4, §9).
const EXPECTED_ALIAS_RATIO: f64 = 0.25;
const ALIAS_RATIO_WARN_THRESHOLD: f64 = 0.05;

/// Stage (4): for each aliased address, locates the existing symbol and
/// splices in one new symbol per alternate name, all sharing a freshly
/// allocated alias group.
pub fn inject_aliases(
    symbols: &mut Vec<Symbol>,
    alias_map: &HashMap<u64, Vec<String>>,
    alias_groups: &mut Vec<AliasGroup>,
    diagnostics: &Diagnostics,
) {
    let original_count = symbols.len();
    if original_count == 0 || alias_map.is_empty() {
        return;
    }

    let mut addresses: Vec<&u64> = alias_map.keys().collect();
    addresses.sort();

    let mut added = 0usize;
    for &address in addresses {
        let names = &alias_map[address];
        let Some(pos) = symbols
            .iter()
            .position(|s| s.address == *address && !s.is_padding_only())
        else {
            continue;
        };

        if !names.iter().any(|n| n.as_str() == symbols[pos].full_name.as_ref()) {
            diagnostics.warn(
                DiagnosticKind::UnmatchedName,
                format!(
                    "nm reported {names:?} at address {address:#x} but the map's symbol there is {:?}",
                    symbols[pos].full_name
                ),
            );
            continue;
        }

        let extra_names: Vec<&String> = names
            .iter()
            .filter(|n| n.as_str() != symbols[pos].full_name.as_ref())
            .collect();
        if extra_names.is_empty() {
            continue;
        }

        let group_id = AliasGroupId(alias_groups.len() as u32);
        alias_groups.push(AliasGroup {
            member_count: (extra_names.len() + 1) as u32,
        });
        symbols[pos].alias_group = Some(group_id);

        let template = symbols[pos].clone();
        let mut insert_at = pos + 1;
        for extra_name in extra_names {
            let (full_name, template_name, name) = parse_name_fields(extra_name);
            let mut alias_symbol = template.clone();
            alias_symbol.full_name = std::sync::Arc::from(full_name.as_str());
            alias_symbol.template_name = std::sync::Arc::from(template_name.as_str());
            alias_symbol.name = std::sync::Arc::from(name.as_str());
            alias_symbol.alias_group = Some(group_id);
            symbols.insert(insert_at, alias_symbol);
            insert_at += 1;
            added += 1;
        }
    }

    let ratio = added as f64 / original_count as f64;
    if added > 0 && ratio < EXPECTED_ALIAS_RATIO * ALIAS_RATIO_WARN_THRESHOLD {
        diagnostics.warn(
            DiagnosticKind::TooFewAliases,
            format!(
                "alias injection added {added} symbols for {original_count} originals \
                 ({:.1}% of expected ~{:.0}%)",
                ratio * 100.0,
                EXPECTED_ALIAS_RATIO * 100.0
            ),
        );
    }
}

/// Stage (5): resolves object/source paths for each symbol via the C4 name
/// map and the C3 source mapper, collapsing multi-path matches to their
/// common ancestor.
pub fn normalize_paths(
    symbols: &mut [Symbol],
    object_name_map: &ObjectNameMap,
    source_mapper: &SourceMapper,
    diagnostics: &Diagnostics,
) {
    for symbol in symbols.iter_mut() {
        if symbol.is_padding_only() {
            continue;
        }

        let raw_paths: Vec<String> = match object_name_map.get(symbol.full_name.as_ref()) {
            Some(paths) => paths.clone(),
            None => match &symbol.object_path {
                Some(existing) => vec![existing.clone()],
                None => {
                    diagnostics.warn(
                        DiagnosticKind::UnmatchedName,
                        format!("{} has no object-file match", symbol.full_name),
                    );
                    continue;
                }
            },
        };

        let normalized_object_paths: Vec<String> =
            raw_paths.iter().map(|p| normalize_object_path(p)).collect();
        symbol.object_path = Some(common_ancestor(
            normalized_object_paths.iter().map(String::as_str),
        ));

        let mut normalized_sources = Vec::new();
        let mut any_generated = false;
        for raw_path in &raw_paths {
            if let Some(source) = source_mapper.find_source(raw_path, diagnostics) {
                let (normalized, generated) = normalize_source_path(&source);
                any_generated |= generated;
                normalized_sources.push(normalized);
            }
        }
        if !normalized_sources.is_empty() {
            symbol.source_path = Some(common_ancestor(
                normalized_sources.iter().map(String::as_str),
            ));
            symbol.generated_source = any_generated;
        }
    }
}

const IMPLAUSIBLE_PADDING_TEXT: u64 = 64;
const IMPLAUSIBLE_PADDING_OTHER: u64 = 256;

/// Stage (6): walks the sorted symbol list per-section, computing each
/// symbol's `padding` and folding it into `size`. Alias-group members at the
/// same address inherit their leader's values rather than recomputing.
pub fn compute_padding(symbols: &mut [Symbol], diagnostics: &Diagnostics) {
    let mut prev_end: Option<(std::sync::Arc<str>, u64)> = None;
    let mut prev_address: Option<(u64, Option<AliasGroupId>)> = None;

    for i in 0..symbols.len() {
        let address = symbols[i].address;
        let section_name = symbols[i].section_name.clone();
        let section = symbols[i].section;

        let same_section = prev_end
            .as_ref()
            .is_some_and(|(name, _)| name.as_ref() == section_name.as_ref());

        if let Some((prev_addr, prev_group)) = prev_address {
            if same_section
                && address == prev_addr
                && symbols[i].alias_group.is_some()
                && symbols[i].alias_group == prev_group
            {
                let (padding, size) = (symbols[i - 1].padding, symbols[i - 1].size);
                symbols[i].padding = padding;
                symbols[i].size = size;
                prev_address = Some((address, symbols[i].alias_group));
                continue;
            }
        }

        if address > 0 {
            if let Some((name, end)) = &prev_end {
                if same_section && name.as_ref() == section_name.as_ref() {
                    let padding = address.saturating_sub(*end);
                    symbols[i].padding = padding;
                    symbols[i].size += padding;

                    if padding > 0 && !symbols[i].is_padding_only() {
                        let limit = match section {
                            Some(SectionTag::Text) => IMPLAUSIBLE_PADDING_TEXT,
                            _ => IMPLAUSIBLE_PADDING_OTHER,
                        };
                        if padding >= limit {
                            diagnostics.warn(
                                DiagnosticKind::ImplausiblePadding,
                                format!(
                                    "{} bytes of padding before {} in {}",
                                    padding, symbols[i].full_name, section_name
                                ),
                            );
                        }
                    }
                }
            }
        }

        let end = symbols[i].end_address();
        prev_end = Some((section_name, end));
        prev_address = Some((address, symbols[i].alias_group));
    }
}

/// §7 `DataGap`: warns once per section that carries bytes in `section_sizes`
/// but to which no attributable symbol (excluding C5's synthetic gap/fill/merge
/// placeholders) was ever assigned.
pub fn check_section_coverage(
    section_sizes: &BTreeMap<String, u64>,
    symbols: &[Symbol],
    diagnostics: &Diagnostics,
) {
    let covered: std::collections::HashSet<&str> = symbols
        .iter()
        .filter(|s| !s.is_padding_only())
        .map(|s| s.section_name.as_ref())
        .collect();
    for (section_name, size) in section_sizes {
        if *size > 0 && !covered.contains(section_name.as_str()) {
            diagnostics.warn(
                DiagnosticKind::SectionCoverageGap,
                format!("section {section_name} ({size} bytes) has no symbol coverage"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn sym(section: SectionTag, full_name: &str, address: u64, size: u64) -> Symbol {
        Symbol {
            section_name: Arc::from(match section {
                SectionTag::Text => ".text",
                SectionTag::Rodata => ".rodata",
                SectionTag::Data => ".data",
                SectionTag::Bss => ".bss",
            }),
            section: Some(section),
            address,
            size,
            padding: 0,
            full_name: Arc::from(full_name),
            template_name: Arc::from(full_name),
            name: Arc::from(full_name),
            object_path: None,
            source_path: None,
            generated_source: false,
            flags: SymbolFlags::empty(),
            alias_group: None,
        }
    }

    #[test]
    fn strips_linker_prefixes() {
        let mut symbols = vec![sym(SectionTag::Text, "startup.foo", 0x1000, 0x10)];
        strip_linker_prefixes(&mut symbols);
        assert_eq!(&*symbols[0].full_name, "foo");
        assert!(symbols[0].flags.contains(SymbolFlags::STARTUP));
    }

    #[test]
    fn rel_local_checked_before_rel() {
        let mut symbols = vec![sym(SectionTag::Text, "rel.local.foo", 0x1000, 0x10)];
        strip_linker_prefixes(&mut symbols);
        assert_eq!(&*symbols[0].full_name, "foo");
        assert!(symbols[0].flags.contains(SymbolFlags::REL_LOCAL));
        assert!(!symbols[0].flags.contains(SymbolFlags::REL));
    }

    #[test]
    fn scenario_c_clone_and_template_split() {
        let mut symbols = vec![sym(
            SectionTag::Text,
            "int ns::C<T>::m(int, int) [clone .isra.1] [clone .2]",
            0x1000,
            0x10,
        )];
        normalize_names(&mut symbols);
        assert_eq!(&*symbols[0].full_name, "ns::C<T>::m(int, int)");
        assert_eq!(&*symbols[0].template_name, "ns::C::m(int, int)");
        assert_eq!(&*symbols[0].name, "ns::C::m");
        assert!(symbols[0].flags.contains(SymbolFlags::CLONE));
    }

    #[test]
    fn scenario_d_vtable_rewrite() {
        let mut symbols = vec![sym(SectionTag::Data, "vtable for blink::Foo", 0x2000, 0x10)];
        normalize_names(&mut symbols);
        assert_eq!(&*symbols[0].full_name, "blink::Foo [vtable]");
    }

    #[test]
    fn thunk_rewrite() {
        let mut symbols = vec![sym(
            SectionTag::Text,
            "non-virtual thunk to blink::Foo::bar()",
            0x2000,
            0x10,
        )];
        normalize_names(&mut symbols);
        assert_eq!(&*symbols[0].full_name, "blink::Foo::bar() [non-virtual thunk]");
    }

    #[test]
    fn anonymous_namespace_flag_and_strip() {
        let mut symbols = vec![sym(
            SectionTag::Text,
            "(anonymous namespace)::helper()",
            0x2000,
            0x10,
        )];
        normalize_names(&mut symbols);
        assert_eq!(&*symbols[0].name, "helper");
        assert!(symbols[0].flags.contains(SymbolFlags::ANONYMOUS));
    }

    #[test]
    fn trailing_digit_suffix_stripped_for_c_symbols() {
        let mut symbols = vec![sym(SectionTag::Text, "foo.123", 0x1000, 0x10)];
        normalize_names(&mut symbols);
        assert_eq!(&*symbols[0].full_name, "foo");
    }

    #[test]
    fn tcf_0_is_excluded_from_digit_stripping() {
        let mut symbols = vec![sym(SectionTag::Text, "__tcf_0", 0x1000, 0x10)];
        normalize_names(&mut symbols);
        assert_eq!(&*symbols[0].full_name, "__tcf_0");
    }

    #[test]
    fn scenario_b_alias_injection() {
        let mut symbols = vec![sym(SectionTag::Text, "foo", 0x2000, 0x20)];
        let alias_map = crate::testutil::scenario_b_alias_map();
        let mut groups = Vec::new();
        let diag = Diagnostics::new();
        inject_aliases(&mut symbols, &alias_map, &mut groups, &diag);

        assert_eq!(symbols.len(), 2);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].member_count, 2);
        assert!(symbols.iter().all(|s| s.address == 0x2000 && s.size == 0x20));
        let names: Vec<&str> = symbols.iter().map(|s| &*s.full_name).collect();
        assert!(names.contains(&"foo"));
        assert!(names.contains(&"foo_alias"));
    }

    #[test]
    fn alias_skipped_and_warned_when_map_name_not_in_nm_names() {
        let mut symbols = vec![sym(SectionTag::Text, "unrelated", 0x2000, 0x20)];
        let mut alias_map = HashMap::new();
        alias_map.insert(0x2000u64, vec!["foo".to_string(), "foo_alias".to_string()]);
        let mut groups = Vec::new();
        let diag = Diagnostics::new();
        inject_aliases(&mut symbols, &alias_map, &mut groups, &diag);

        assert_eq!(symbols.len(), 1);
        assert!(groups.is_empty());
        assert_eq!(diag.count(DiagnosticKind::UnmatchedName), 1);
    }

    #[test]
    fn padding_computed_between_consecutive_symbols() {
        let mut symbols = vec![
            sym(SectionTag::Text, "foo", 0x1000, 0x10),
            sym(SectionTag::Text, "bar", 0x1018, 0x8),
        ];
        let diag = Diagnostics::new();
        compute_padding(&mut symbols, &diag);
        assert_eq!(symbols[0].padding, 0);
        assert_eq!(symbols[1].padding, 8);
        assert_eq!(symbols[1].size, 0x10);
    }

    #[test]
    fn alias_group_members_inherit_padding_and_size() {
        let mut a = sym(SectionTag::Text, "foo", 0x2000, 0x20);
        let mut b = sym(SectionTag::Text, "foo_alias", 0x2000, 0x20);
        a.alias_group = Some(AliasGroupId(0));
        b.alias_group = Some(AliasGroupId(0));
        a.padding = 4;
        a.size = 0x24;
        let mut symbols = vec![a, b];
        let diag = Diagnostics::new();
        compute_padding(&mut symbols, &diag);
        assert_eq!(symbols[1].padding, 4);
        assert_eq!(symbols[1].size, 0x24);
    }

    #[test]
    fn implausible_text_padding_warns() {
        let mut symbols = vec![
            sym(SectionTag::Text, "foo", 0x1000, 0x10),
            sym(SectionTag::Text, "bar", 0x1000 + 0x10 + 100, 0x8),
        ];
        let diag = Diagnostics::new();
        compute_padding(&mut symbols, &diag);
        assert_eq!(diag.count(DiagnosticKind::ImplausiblePadding), 1);
    }

    #[test]
    fn section_with_no_symbols_warns_coverage_gap() {
        let mut section_sizes = BTreeMap::new();
        section_sizes.insert(".text".to_string(), 0x20);
        section_sizes.insert(".bss".to_string(), 0x10);
        let symbols = vec![sym(SectionTag::Text, "foo", 0x1000, 0x20)];
        let diag = Diagnostics::new();
        check_section_coverage(&section_sizes, &symbols, &diag);
        assert_eq!(diag.count(DiagnosticKind::SectionCoverageGap), 1);
    }

    #[test]
    fn covered_sections_do_not_warn() {
        let mut section_sizes = BTreeMap::new();
        section_sizes.insert(".text".to_string(), 0x20);
        let symbols = vec![sym(SectionTag::Text, "foo", 0x1000, 0x20)];
        let diag = Diagnostics::new();
        check_section_coverage(&section_sizes, &symbols, &diag);
        assert_eq!(diag.count(DiagnosticKind::SectionCoverageGap), 0);
    }

    #[test]
    fn scenario_e_ancestor_path_resolution() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("build.ninja"),
            crate::testutil::scenario_e_ninja(),
        )
        .unwrap();
        let mapper = crate::ninja::parse(dir.path(), "build.ninja", None).unwrap();

        let mut symbols = vec![sym(SectionTag::Text, "sym", 0x3000, 0x10)];
        let object_name_map = crate::testutil::scenario_e_object_names();
        let diagnostics = Diagnostics::new();
        normalize_paths(&mut symbols, &object_name_map, &mapper, &diagnostics);

        assert_eq!(symbols[0].object_path.as_deref(), Some("a"));
        assert_eq!(symbols[0].source_path.as_deref(), Some("a"));
    }

    #[test]
    fn strip_return_type_examples() {
        assert_eq!(strip_return_type("int ns::C::m(int, int)"), "ns::C::m(int, int)");
        assert_eq!(strip_return_type("ns::Foo::kConstant"), "ns::Foo::kConstant");
    }

    #[test]
    fn strip_angle_brackets_handles_nesting() {
        assert_eq!(
            strip_angle_brackets("std::vector<std::pair<int, int>>::push_back"),
            "std::vector::push_back"
        );
    }
}
