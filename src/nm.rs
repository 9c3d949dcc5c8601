//! `nm` driver (C4, §4.4).
//!
//! Two jobs: alias discovery on the final ELF (multiple text-section names
//! sharing one address), and per-object-file symbol→path discovery used by
//! C6 stage 5 to attribute symbols to object files. Both shell out to `nm`
//! and parse its textual output; there is no in-process ELF symbol-table
//! reader here, by design (§1: the system consumes `nm`/`readelf`, it does
//! not reimplement them).

use std::collections::HashMap;
use std::path::Path;
use std::process::{Command, Stdio};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::concurrency;
use crate::error::{Error, Result};
use crate::pathutil::split_archive_qualifier;

/// Object files are batched this many at a time per `nm` invocation (§4.4).
const OBJECT_BATCH_SIZE: usize = 50;

/// Compiler-generated names that collide across translation units and should
/// not be treated as meaningful alias/attribution candidates (§4.4 "Name
/// relevance").
static IRRELEVANT_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:startup$|__tcf_0$|\._\d+$|\.L|CSWTCH\.|lock\.|__compound_literal\.|__func__\.|table\.)",
    )
    .unwrap()
});

/// True if `name` should be considered for alias grouping / attribution
/// (§4.4 "Name relevance").
pub fn is_relevant_name(name: &str) -> bool {
    !IRRELEVANT_NAME.is_match(name)
}

fn run_tool(command: &mut Command, label: &str) -> Result<Vec<u8>> {
    let output = command.output()?;
    if !output.status.success() {
        return Err(Error::ToolFailure {
            command: label.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(output.stdout)
}

/// Runs `<prefix>nm --no-sort --defined-only --demangle <elf>` and groups
/// text-section symbols by address, keeping only addresses shared by two or
/// more distinct, relevant names (§4.4 "Alias discovery").
pub fn discover_aliases(nm_path: &str, elf_path: &Path) -> Result<HashMap<u64, Vec<String>>> {
    let mut command = Command::new(nm_path);
    command
        .arg("--no-sort")
        .arg("--defined-only")
        .arg("--demangle")
        .arg(elf_path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let stdout = run_tool(&mut command, "nm (alias discovery)")?;
    let text = String::from_utf8_lossy(&stdout);

    let mut by_address: HashMap<u64, Vec<String>> = HashMap::new();
    for line in text.lines() {
        if let Some((address, section_letter, name)) = parse_nm_line(line) {
            if !matches!(section_letter, 't' | 'T') {
                continue;
            }
            if address == 0 || !is_relevant_name(name) {
                continue;
            }
            let names = by_address.entry(address).or_default();
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }

    by_address.retain(|_, names| names.len() >= 2);
    Ok(by_address)
}

fn parse_nm_line(line: &str) -> Option<(u64, char, &str)> {
    let mut parts = line.splitn(3, ' ');
    let address_str = parts.next()?.trim();
    let rest = parts.next()?;
    let name = parts.next()?.trim();
    if address_str.is_empty() || rest.is_empty() || name.is_empty() {
        return None;
    }
    let address = u64::from_str_radix(address_str, 16).ok()?;
    let section_letter = rest.trim().chars().next()?;
    Some((address, section_letter, name))
}

/// Result of object-file name discovery: `name -> [object_paths]`, archive
/// members qualified as `archive(member)`.
pub type ObjectNameMap = HashMap<String, Vec<String>>;

/// Runs `nm` over every entry of `object_paths` (`.o` files batched
/// [`OBJECT_BATCH_SIZE`] at a time, `.a` archives one per invocation) and
/// merges the per-file symbol tables into a single `name -> [object_paths]`
/// map (§4.4 "Object-file name discovery").
pub fn discover_object_names(nm_path: &str, object_paths: &[String]) -> Result<ObjectNameMap> {
    let mut plain = Vec::new();
    let mut archives = Vec::new();
    for path in object_paths {
        if path.ends_with(".a") {
            archives.push(path.clone());
        } else {
            plain.push(path.clone());
        }
    }

    let mut batches: Vec<Vec<String>> = plain
        .chunks(OBJECT_BATCH_SIZE)
        .map(|chunk| chunk.to_vec())
        .collect();
    for archive in archives {
        batches.push(vec![archive]);
    }

    let nm_path = nm_path.to_string();
    let results: Vec<Result<Vec<(String, String)>>> = concurrency::bulk(batches, move |batch| {
        run_nm_batch(&nm_path, &batch)
    });

    let mut merged: ObjectNameMap = HashMap::new();
    for result in results {
        for (name, path) in result? {
            let entry = merged.entry(name).or_default();
            if !entry.iter().any(|p| p == &path) {
                entry.push(path);
            }
        }
    }
    Ok(merged)
}

/// Runs one `nm` invocation over a batch of paths and returns `(name, path)`
/// pairs, with archive members already qualified as `archive(member)`.
fn run_nm_batch(nm_path: &str, batch: &[String]) -> Result<Vec<(String, String)>> {
    let mut command = Command::new(nm_path);
    command
        .arg("--defined-only")
        .args(batch)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let stdout = run_tool(&mut command, "nm (object discovery)")?;
    let text = String::from_utf8_lossy(&stdout);

    let is_archive = batch.len() == 1 && batch[0].ends_with(".a");
    let archive_path = if is_archive { Some(batch[0].clone()) } else { None };

    let mut out = Vec::new();
    let mut current_path = batch.first().cloned().unwrap_or_default();

    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        if let Some(header) = line.strip_suffix(':') {
            if !header.contains(' ') {
                current_path = match &archive_path {
                    Some(archive) => format!("{archive}({header})"),
                    None => header.to_string(),
                };
                continue;
            }
        }
        if let Some((_, section_letter, name)) = parse_nm_line(line) {
            if section_letter == 'U' {
                continue;
            }
            if is_relevant_name(name) {
                out.push((name.to_string(), current_path.clone()));
            }
        }
    }
    Ok(out)
}

/// Resolves a `name` to its object path(s) using the merged map from
/// [`discover_object_names`], splitting `archive(member)` qualifiers back out
/// when a caller needs the bare archive path (used by C6 stage 5's ninja
/// lookup, which indexes by archive + member basename rather than the
/// qualified form).
pub fn resolve_archive_member(path: &str) -> Option<(&str, &str)> {
    split_archive_qualifier(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_irrelevant_names() {
        assert!(!is_relevant_name("startup"));
        assert!(!is_relevant_name("__tcf_0"));
        assert!(!is_relevant_name("._123"));
        assert!(!is_relevant_name(".L.str"));
        assert!(!is_relevant_name("CSWTCH.12"));
        assert!(!is_relevant_name("lock.123"));
        assert!(!is_relevant_name("__compound_literal.4"));
        assert!(!is_relevant_name("__func__.main"));
        assert!(!is_relevant_name("table.42"));
        assert!(is_relevant_name("foo::bar()"));
    }

    #[test]
    fn parses_nm_line() {
        let parsed = parse_nm_line("0000000000002000 T foo::bar(int, int)");
        assert_eq!(parsed, Some((0x2000, 'T', "foo::bar(int, int)")));
    }

    #[test]
    fn parses_nm_line_with_no_address() {
        assert_eq!(parse_nm_line("                 U foo"), None);
    }
}
