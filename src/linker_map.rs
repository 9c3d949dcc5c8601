//! Linker-map parser (C5, §4.5).
//!
//! A line-oriented state machine over a gold-linker map file. Ported from the
//! `MapFileParser` in the original tool's `linker_map_parser.py`: the control
//! flow (skip-to-prefix, wrapped-parts rejoining, the three parsing states) is
//! kept intact; the representation is `Result`-based instead of raising and
//! logging from inside the parse loop.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::model::{SectionTag, Symbol, SymbolFlags};

/// Reads a linker map file, transparently gunzipping it if its name ends in
/// `.gz` (§6 "sniffed by `.gz` suffix").
pub fn read_map_file(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    if path.extension().is_some_and(|ext| ext == "gz") {
        let mut decoder = flate2::read::GzDecoder::new(file);
        let mut text = String::new();
        decoder.read_to_string(&mut text)?;
        Ok(text)
    } else {
        let mut file = file;
        let mut text = String::new();
        file.read_to_string(&mut text)?;
        Ok(text)
    }
}

/// Parses a linker map file already loaded into memory, returning per-section
/// totals and the raw (pre-normalization) symbol list.
pub fn parse(text: &str) -> Result<(BTreeMap<String, u64>, Vec<Symbol>)> {
    let mut parser = MapParser::new(text);
    parser.run()
}

/// A line cursor over the map file, tracking a 1-based line number for error
/// messages. Lines are materialized as owned `String`s so parsing logic never
/// has to fight borrow lifetimes while rejoining wrapped fields.
struct Lines {
    lines: Vec<String>,
    pos: usize,
}

impl Lines {
    fn new(text: &str) -> Self {
        Lines {
            lines: text.lines().map(str::to_string).collect(),
            pos: 0,
        }
    }

    fn next(&mut self) -> Option<String> {
        let line = self.lines.get(self.pos).cloned();
        if line.is_some() {
            self.pos += 1;
        }
        line
    }

    fn line_no(&self) -> usize {
        self.pos
    }
}

struct MapParser {
    lines: Lines,
    common_symbols: Vec<Symbol>,
    symbols: Vec<Symbol>,
    section_sizes: BTreeMap<String, u64>,
}

fn parse_hex(s: &str, line_no: usize) -> Result<u64> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16).map_err(|_| Error::MapParse {
        line: line_no,
        message: format!("not a hex integer: {s:?}"),
    })
}

fn make_symbol(
    section_name: &str,
    size: u64,
    address: u64,
    full_name: &str,
    object_path: Option<String>,
) -> Symbol {
    let name: Arc<str> = Arc::from(full_name);
    Symbol {
        section_name: Arc::from(section_name),
        section: SectionTag::classify(section_name),
        address,
        size,
        padding: 0,
        full_name: name.clone(),
        template_name: name.clone(),
        name,
        object_path,
        source_path: None,
        generated_source: false,
        flags: SymbolFlags::empty(),
        alias_group: None,
    }
}

/// Splits on arbitrary whitespace, stopping after `limit - 1` splits so the
/// final element retains any embedded whitespace verbatim (mirrors Python's
/// `str.split(None, count - 1)`). Only the boundaries between the first
/// `limit - 1` fields collapse whitespace runs; the trailing field is never
/// touched beyond stripping the whitespace that precedes it.
fn splitn_whitespace(line: &str, limit: usize) -> Vec<String> {
    let mut parts = Vec::new();
    let mut rest = line;
    for _ in 1..limit {
        let trimmed = rest.trim_start();
        if trimmed.is_empty() {
            return parts;
        }
        match trimmed.find(char::is_whitespace) {
            Some(idx) => {
                parts.push(trimmed[..idx].to_string());
                rest = &trimmed[idx..];
            }
            None => {
                parts.push(trimmed.to_string());
                return parts;
            }
        }
    }
    let remainder = rest.trim_start();
    if !remainder.is_empty() {
        parts.push(remainder.to_string());
    }
    parts
}

impl MapParser {
    fn new(text: &str) -> Self {
        MapParser {
            lines: Lines::new(text),
            common_symbols: Vec::new(),
            symbols: Vec::new(),
            section_sizes: BTreeMap::new(),
        }
    }

    fn run(&mut self) -> Result<(BTreeMap<String, u64>, Vec<Symbol>)> {
        loop {
            let line = match self.skip_to_prefix(&["Common symbol", "Memory map"]) {
                Some(l) => l,
                None => break,
            };
            if line.starts_with("Common symbol") {
                self.parse_common_symbols()?;
                continue;
            } else if line.starts_with("Memory map") {
                self.parse_sections()?;
            }
            break;
        }
        Ok((
            std::mem::take(&mut self.section_sizes),
            std::mem::take(&mut self.symbols),
        ))
    }

    fn skip_to_prefix(&mut self, prefixes: &[&str]) -> Option<String> {
        while let Some(line) = self.lines.next() {
            if prefixes.iter().any(|p| line.starts_with(p)) {
                return Some(line);
            }
        }
        None
    }

    /// Splits `line` into exactly `count` whitespace-separated parts, pulling
    /// one more physical line if the current one doesn't have enough fields
    /// (the overflow-to-next-line rejoining described in §4.5).
    fn parse_wrapped_parts(&mut self, line: &str, count: usize) -> Result<Option<Vec<String>>> {
        let mut parts = splitn_whitespace(line, count);
        if parts.is_empty() {
            return Ok(None);
        }
        if parts.len() != count {
            let line_no = self.lines.line_no();
            let next_line = self.lines.next().ok_or_else(|| Error::MapParse {
                line: line_no,
                message: "unexpected end of file while rejoining wrapped fields".to_string(),
            })?;
            let remaining = count - parts.len();
            parts.extend(splitn_whitespace(&next_line, remaining));
            if parts.len() != count {
                return Err(Error::MapParse {
                    line: line_no,
                    message: format!("expected {count} fields, got {}: {parts:?}", parts.len()),
                });
            }
        }
        if let Some(last) = parts.last_mut() {
            *last = last.trim_end().to_string();
        }
        Ok(Some(parts))
    }

    fn parse_common_symbols(&mut self) -> Result<()> {
        self.lines.next(); // blank line after the "Common symbol" header
        loop {
            let line_no = self.lines.line_no();
            let line = match self.lines.next() {
                Some(l) => l,
                None => break,
            };
            let parts = match self.parse_wrapped_parts(&line, 3)? {
                Some(p) => p,
                None => break,
            };
            let (name, size_str, path) = (&parts[0], &parts[1], &parts[2]);
            let size = parse_hex(size_str, line_no)?;
            self.common_symbols
                .push(make_symbol(".bss", size, 0, name, Some(path.clone())));
        }
        Ok(())
    }

    fn parse_sections(&mut self) -> Result<()> {
        loop {
            let line_no = self.lines.line_no();
            let line = match self.skip_to_top_level_section() {
                Some(l) => l,
                None => break,
            };
            let parts = match self.parse_wrapped_parts(&line, 3)? {
                Some(p) => p,
                None => break,
            };
            let section_name = parts[0].clone();
            let section_address = parse_hex(&parts[1], line_no)?;
            let section_size = parse_hex(&parts[2], line_no)?;
            self.section_sizes
                .insert(section_name.clone(), section_size);

            let parses_contents = section_name == ".bss"
                || section_name == ".rodata"
                || section_name == ".text"
                || section_name.starts_with(".data");
            if parses_contents {
                self.parse_section_contents(&section_name, section_address)?;
            }
        }
        Ok(())
    }

    /// Top-level section headers start at column 0 with `.`; subsection
    /// entries are indented with a leading space, so a plain prefix search
    /// for `.` at the start of the (unindented) line distinguishes them.
    fn skip_to_top_level_section(&mut self) -> Option<String> {
        while let Some(line) = self.lines.next() {
            if line.starts_with('.') {
                return Some(line);
            }
        }
        None
    }

    fn parse_section_contents(&mut self, section_name: &str, section_address: u64) -> Result<()> {
        if section_name == ".bss" {
            let mut common = std::mem::take(&mut self.common_symbols);
            self.symbols.append(&mut common);
        }
        let prefix_len = section_name.len() + 1;
        let mut symbol_gap_count = 0u32;
        let mut merge_symbol_start_address = section_address;

        let mut line = match self.lines.next() {
            Some(l) => l,
            None => return Ok(()),
        };

        loop {
            if line.trim().is_empty() {
                break;
            }
            if line.starts_with(" **") {
                line = self.parse_anonymous_subsection(&line, section_name, &mut merge_symbol_start_address)?;
            } else {
                line = self.parse_normal_subsection(
                    &line,
                    section_name,
                    prefix_len,
                    &mut merge_symbol_start_address,
                    &mut symbol_gap_count,
                )?;
            }
            if line.trim().is_empty() {
                break;
            }
        }

        let section_size = *self.section_sizes.get(section_name).unwrap_or(&0);
        let section_end_address = section_address + section_size;
        if section_name != ".bss" {
            let needs_gap = match self.symbols.last() {
                Some(last) => last.address + last.size < section_end_address,
                None => false,
            };
            if needs_gap {
                self.symbols.push(make_symbol(
                    section_name,
                    0,
                    section_end_address,
                    &format!("** symbol gap {symbol_gap_count} (end of section)"),
                    None,
                ));
            }
        }
        Ok(())
    }

    /// Handles a `** merge strings` / `** merge constants` / `** common` /
    /// `** fill` top-level subsection entry. Returns the next unread line.
    fn parse_anonymous_subsection(
        &mut self,
        line: &str,
        section_name: &str,
        merge_symbol_start_address: &mut u64,
    ) -> Result<String> {
        let line_no = self.lines.line_no();
        let (name, rest) = match line.find('0') {
            Some(idx) => (line[..idx].trim().to_string(), line[idx..].to_string()),
            None => {
                let name = line.trim().to_string();
                let next = self.lines.next().ok_or_else(|| Error::MapParse {
                    line: line_no,
                    message: "unexpected end of file after anonymous subsection name".to_string(),
                })?;
                (name, next)
            }
        };
        let parts = self
            .parse_wrapped_parts(&rest, 2)?
            .ok_or_else(|| Error::MapParse {
                line: line_no,
                message: "expected address/size pair".to_string(),
            })?;
        let address = parse_hex(&parts[0], line_no)?;
        let size = parse_hex(&parts[1], line_no)?;
        let next_line = self.lines.next().unwrap_or_default();

        if name != "** common" {
            self.symbols
                .push(make_symbol(section_name, size, address, &name, None));
            if *merge_symbol_start_address > 0 {
                *merge_symbol_start_address += size;
            }
        }
        Ok(next_line)
    }

    /// Handles a normal `<section>.<mangled> <addr> <size> <path>` subsection
    /// entry, including its follow-up demangled-name line(s) and the
    /// `0xffffffffffffffff` merge-section sentinel.
    fn parse_normal_subsection(
        &mut self,
        line: &str,
        section_name: &str,
        prefix_len: usize,
        merge_symbol_start_address: &mut u64,
        symbol_gap_count: &mut u32,
    ) -> Result<String> {
        let line_no = self.lines.line_no();
        let parts = self
            .parse_wrapped_parts(line, 4)?
            .ok_or_else(|| Error::MapParse {
                line: line_no,
                message: "expected subsection/address/size/path".to_string(),
            })?;
        let (subsection_name, address_str, size_str, path) =
            (&parts[0], &parts[1], &parts[2], &parts[3]);
        if !subsection_name.starts_with(section_name) {
            return Err(Error::MapParse {
                line: line_no,
                message: format!("subsection name was: {subsection_name}"),
            });
        }
        let size = parse_hex(size_str, line_no)?;
        let mangled_name = subsection_name[prefix_len.min(subsection_name.len())..].to_string();

        let mut name: Option<String> = None;
        let mut address_str2: Option<String> = None;
        let mut next_line = self.lines.next().unwrap_or_default();
        loop {
            let trimmed = next_line.trim_end().to_string();
            if trimmed.is_empty() || trimmed.starts_with(" .") {
                break;
            }
            if trimmed.starts_with(" ** fill") {
                next_line = self.lines.next().unwrap_or_default();
                continue;
            }
            if trimmed.starts_with(" **") {
                break;
            }
            if name.is_none() {
                let line_no2 = self.lines.line_no();
                let parsed = self
                    .parse_wrapped_parts(&trimmed, 2)?
                    .ok_or_else(|| Error::MapParse {
                        line: line_no2,
                        message: "expected address/name pair".to_string(),
                    })?;
                address_str2 = Some(parsed[0].clone());
                name = Some(parsed[1].clone());
            }
            next_line = self.lines.next().unwrap_or_default();
        }

        let address;
        if address_str == "0xffffffffffffffff" {
            address = if let Some(addr2) = &address_str2 {
                parse_hex(addr2, line_no)? - 1
            } else if let Some(last) = self.symbols.last() {
                if last.address > 0 {
                    last.address + last.size
                } else {
                    0
                }
            } else {
                0
            };
            *merge_symbol_start_address = address + size;
        } else {
            address = parse_hex(address_str, line_no)?;
            if *merge_symbol_start_address > 0 {
                let merge_size = address.saturating_sub(*merge_symbol_start_address);
                *merge_symbol_start_address = 0;
                if merge_size > 0 {
                    self.symbols.push(make_symbol(
                        section_name,
                        0,
                        address,
                        &format!("** symbol gap {symbol_gap_count}"),
                        None,
                    ));
                    *symbol_gap_count += 1;
                }
            }
        }

        let full_name = name.unwrap_or(mangled_name);
        self.symbols.push(make_symbol(
            section_name,
            size,
            address,
            &full_name,
            Some(path.clone()),
        ));

        Ok(next_line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_a_basic_text_section() {
        let (sizes, symbols) = parse(crate::testutil::scenario_a_map()).unwrap();
        assert_eq!(sizes[".text"], 0x20);
        assert_eq!(symbols.len(), 2);
        assert_eq!(&*symbols[0].full_name, "foo");
        assert_eq!(symbols[0].address, 0x1000);
        assert_eq!(symbols[0].size, 0x10);
        assert_eq!(&*symbols[1].full_name, "bar");
        assert_eq!(symbols[1].address, 0x1018);
        assert_eq!(symbols[1].size, 0x8);
    }

    #[test]
    fn common_symbols_become_bss_entries() {
        let map = "\
Common symbol       size              file

ff_cos_131072       0x40000           obj/third_party/a.o
ff_cos_131072_fixed
                    0x20000           obj/third_party/b.o
Memory map

.bss            0x00002000       0x60000
";
        let (sizes, symbols) = parse(map).unwrap();
        assert_eq!(sizes[".bss"], 0x60000);
        assert_eq!(symbols.len(), 2);
        assert!(symbols.iter().all(|s| s.address == 0));
        assert_eq!(&*symbols[0].full_name, "ff_cos_131072");
        assert_eq!(symbols[0].size, 0x40000);
        assert_eq!(&*symbols[1].full_name, "ff_cos_131072_fixed");
        assert_eq!(symbols[1].size, 0x20000);
    }

    #[test]
    fn merge_sentinel_inserts_gap_placeholder() {
        let map = "\
Memory map

.data.rel.ro    0x00003000       0x30
 .data.rel.ro._ZTV1A
                0xffffffffffffffff       0x10 obj/a.o
                0x00003010                vtable for A
 .data.rel.ro._ZTV1B
                0x00003020       0x10 obj/b.o
                0x00003020                vtable for B
";
        let (_sizes, symbols) = parse(map).unwrap();
        let names: Vec<&str> = symbols.iter().map(|s| &*s.full_name).collect();
        assert!(names.contains(&"vtable for A"));
        assert!(names.contains(&"vtable for B"));
        assert!(names.iter().any(|n| n.starts_with("** symbol gap")));
    }

    #[test]
    fn splitn_whitespace_preserves_embedded_whitespace_in_last_field() {
        let parts = splitn_whitespace("foo   0x1000   0x10   obj/weird  path.o", 4);
        assert_eq!(parts, vec!["foo", "0x1000", "0x10", "obj/weird  path.o"]);
    }

    #[test]
    fn empty_map_file_has_no_symbols() {
        let (sizes, symbols) = parse("").unwrap();
        assert!(sizes.is_empty());
        assert!(symbols.is_empty());
    }

    #[test]
    fn end_of_section_gap_is_synthesized() {
        let map = "\
Memory map

.text           0x00001000       0x30
 .text.foo     0x00001000       0x10 obj/a.o
                0x00001000                foo
";
        let (_sizes, symbols) = parse(map).unwrap();
        assert_eq!(symbols.len(), 2);
        assert!(symbols[1].full_name.contains("end of section"));
        assert_eq!(symbols[1].address, 0x1030);
    }
}
