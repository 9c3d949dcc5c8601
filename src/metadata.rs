//! Metadata & ELF introspection (C8, §4.8).
//!
//! Everything here shells out to `readelf` and reads small `key=value`/`key =
//! value` text files. None of it reimplements an ELF or `gn` parser; it is
//! the textual glue the normalizer and the path resolver need.

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};

/// Architecture tags recognized from `readelf -h`'s `Machine:` line (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86,
    X64,
    Arm,
    Arm64,
    Mips,
    Other,
}

#[derive(Debug, Clone)]
pub struct ElfSummary {
    pub arch: Arch,
    pub build_id: Option<String>,
}

fn run_readelf(readelf_path: &str, args: &[&str], elf_path: &Path) -> Result<String> {
    let output = Command::new(readelf_path)
        .args(args)
        .arg(elf_path)
        .output()?;
    if !output.status.success() {
        return Err(Error::ToolFailure {
            command: format!("{readelf_path} {}", args.join(" ")),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn classify_machine(machine_line: &str) -> Arch {
    let lower = machine_line.to_lowercase();
    if lower.contains("x86-64") || lower.contains("x86_64") {
        Arch::X64
    } else if lower.contains("80386") || lower.contains("i386") {
        Arch::X86
    } else if lower.contains("aarch64") {
        Arch::Arm64
    } else if lower.contains("arm") {
        Arch::Arm
    } else if lower.contains("mips") {
        Arch::Mips
    } else {
        Arch::Other
    }
}

static BUILD_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Build ID: ([0-9a-f]+)").unwrap());

/// Runs `readelf -h` and `readelf -n` and extracts architecture + build id
/// (§4.8, §6).
pub fn read_elf_header(readelf_path: &str, elf_path: &Path) -> Result<ElfSummary> {
    let header = run_readelf(readelf_path, &["-h"], elf_path)?;
    let arch = header
        .lines()
        .find(|l| l.trim_start().starts_with("Machine:"))
        .map(classify_machine)
        .unwrap_or(Arch::Other);

    let notes = run_readelf(readelf_path, &["-n"], elf_path)?;
    let build_id = BUILD_ID_RE
        .captures(&notes)
        .map(|caps| caps[1].to_string());

    Ok(ElfSummary { arch, build_id })
}

/// Runs `readelf -S --wide` and returns `section_name -> size` (§4.8), used
/// as the fatal cross-check against the map file's section totals.
pub fn read_elf_sections(readelf_path: &str, elf_path: &Path) -> Result<HashMap<String, u64>> {
    let text = run_readelf(readelf_path, &["-S", "--wide"], elf_path)?;
    let mut sections = HashMap::new();
    for line in text.lines() {
        let line = line.trim_start();
        if !line.starts_with('[') {
            continue;
        }
        let Some(close) = line.find(']') else { continue };
        let rest = line[close + 1..].trim();
        let mut fields = rest.split_whitespace();
        let Some(name) = fields.next() else { continue };
        let Some(_ty) = fields.next() else { continue };
        let Some(_addr) = fields.next() else { continue };
        let Some(_off) = fields.next() else { continue };
        let Some(size_str) = fields.next() else { continue };
        if let Ok(size) = u64::from_str_radix(size_str, 16) {
            sections.insert(name.to_string(), size);
        }
    }
    Ok(sections)
}

/// Cross-checks the map file's section totals against `readelf -S`'s, per
/// §4.6 stage and §7: disagreement on a shared section is fatal.
pub fn verify_section_sizes(
    map_sizes: &std::collections::BTreeMap<String, u64>,
    elf_sizes: &HashMap<String, u64>,
) -> Result<()> {
    for (name, map_size) in map_sizes {
        if let Some(elf_size) = elf_sizes.get(name) {
            if elf_size != map_size {
                return Err(Error::integrity(format!(
                    "section {name} size mismatch: map says {map_size}, readelf says {elf_size}"
                )));
            }
        }
    }
    Ok(())
}

/// Parses `args.gn`: `#`-comment-stripped `key = value` lines, returned
/// sorted as `"key=value"` (§4.8, §6).
pub fn parse_gn_args(text: &str) -> Vec<String> {
    let mut args = Vec::new();
    for raw_line in text.lines() {
        let line = match raw_line.find('#') {
            Some(idx) => &raw_line[..idx],
            None => raw_line,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            args.push(format!("{}={}", key.trim(), value.trim()));
        }
    }
    args.sort();
    args
}

/// Parses `build_vars.txt`: plain `key=value` lines (§4.8, §6), used by C2
/// for `android_tool_prefix` lookup.
pub fn parse_build_vars(text: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            vars.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    vars
}
