//! Ninja build-graph parser (C3, §4.3).
//!
//! Walks `build.ninja` and everything it transitively `subninja`'s, looking
//! only for `build <outputs>: <rule> <inputs>` lines. Nothing else in the
//! ninja grammar (variables, pools, rule bodies) is needed to recover
//! object/archive/source relationships, so nothing else is parsed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{DiagnosticKind, Diagnostics, Result};

/// Unescapes ninja's `\ ` (escaped space) within a single path token.
fn unescape_path(token: &str) -> String {
    token.replace("\\ ", " ")
}

/// Splits a ninja path list on unescaped spaces.
fn split_paths(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' && chars.peek() == Some(&' ') {
            current.push(' ');
            chars.next();
        } else if c == ' ' {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

struct RawBuildEdge {
    outputs: Vec<String>,
    inputs: Vec<String>,
}

/// Parses one `build` statement's `outputs: rule inputs[ | implicit][ || order-only]`
/// tail, already past the `build ` keyword.
fn parse_build_line(rest: &str) -> Option<RawBuildEdge> {
    let colon = find_unescaped_colon(rest)?;
    let outputs = split_paths(rest[..colon].trim())
        .into_iter()
        .map(|p| unescape_path(&p))
        .collect();

    let tail = rest[colon + 1..].trim();
    let mut rule_and_inputs = tail.splitn(2, ' ');
    let _rule = rule_and_inputs.next();
    let inputs_part = rule_and_inputs.next().unwrap_or("");

    // Strip implicit (`| a b`) and order-only (`|| a b`) dependency groups;
    // both contribute to the source set the same as explicit inputs do.
    let inputs_part = inputs_part.split(" | ").next().unwrap_or(inputs_part);
    let inputs_part = inputs_part.split(" || ").next().unwrap_or(inputs_part);

    let inputs = split_paths(inputs_part.trim())
        .into_iter()
        .map(|p| unescape_path(&p))
        .collect();

    Some(RawBuildEdge { outputs, inputs })
}

fn find_unescaped_colon(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if bytes[i] == b':' {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// One `.ninja` file's `build` edges, plus any `subninja`s it references.
struct ParsedFile {
    edges: Vec<RawBuildEdge>,
    subninjas: Vec<String>,
}

fn parse_ninja_text(text: &str) -> ParsedFile {
    let mut edges = Vec::new();
    let mut subninjas = Vec::new();

    // Ninja allows a trailing `$` to continue a logical line onto the next
    // physical one; join those before splitting into statements.
    let mut logical_lines: Vec<String> = Vec::new();
    let mut pending = String::new();
    for line in text.lines() {
        if let Some(joined) = line.strip_suffix('$') {
            pending.push_str(joined);
            pending.push(' ');
        } else {
            pending.push_str(line);
            logical_lines.push(std::mem::take(&mut pending));
        }
    }
    if !pending.is_empty() {
        logical_lines.push(pending);
    }

    for line in &logical_lines {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("build ") {
            if let Some(edge) = parse_build_line(rest) {
                edges.push(edge);
            }
        } else if let Some(rest) = trimmed.strip_prefix("subninja ") {
            subninjas.push(rest.trim().to_string());
        }
    }

    ParsedFile { edges, subninjas }
}

/// `object_path -> source_path` and `archive_path -> {basename -> object_path}`
/// maps, plus the list of inputs to the final linked ELF if it was found
/// among the parsed outputs.
pub struct SourceMapper {
    object_to_source: HashMap<String, String>,
    archive_members: HashMap<String, HashMap<String, String>>,
    final_elf_inputs: Option<Vec<String>>,
    parsed_file_count: usize,
    unmatched: std::sync::atomic::AtomicUsize,
}

impl SourceMapper {
    /// Resolves an object path (plain `.o`, or `archive(member)` notation) to
    /// its source path, reporting (and rate-limiting) unresolved lookups
    /// through `diagnostics` (§4.3).
    pub fn find_source(&self, object_path: &str, diagnostics: &Diagnostics) -> Option<String> {
        let result = self.find_source_inner(object_path);
        if result.is_none() {
            self.unmatched.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            diagnostics.warn(
                DiagnosticKind::UnresolvedSourcePath,
                format!("no ninja source mapping for {object_path}"),
            );
        }
        result
    }

    fn find_source_inner(&self, object_path: &str) -> Option<String> {
        if let Some(direct) = self.object_to_source.get(object_path) {
            return Some(direct.clone());
        }
        if let Some((archive, member)) = crate::pathutil::split_archive_qualifier(object_path) {
            let members = self.archive_members.get(archive)?;
            let object_in_archive = members.get(member)?;
            return self.object_to_source.get(object_in_archive).cloned();
        }
        None
    }

    pub fn final_elf_inputs(&self) -> Option<&[String]> {
        self.final_elf_inputs.as_deref()
    }

    pub fn parsed_file_count(&self) -> usize {
        self.parsed_file_count
    }

    pub fn unmatched_paths_count(&self) -> usize {
        self.unmatched.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Parses `root` and every file it transitively `subninja`'s, resolving
/// `subninja` paths relative to `output_dir`. `final_elf_name`, if given, is
/// matched by basename against parsed outputs to recover the final link
/// step's input list (§4.3).
pub fn parse(
    output_dir: &Path,
    root: &str,
    final_elf_name: Option<&str>,
) -> Result<SourceMapper> {
    let mut object_to_source: HashMap<String, String> = HashMap::new();
    let mut archive_members: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut final_elf_inputs = None;
    let mut parsed_file_count = 0usize;

    let mut queue: Vec<String> = vec![root.to_string()];
    let mut visited = std::collections::HashSet::new();

    while let Some(relative) = queue.pop() {
        if !visited.insert(relative.clone()) {
            continue;
        }
        let full_path: PathBuf = output_dir.join(&relative);
        let text = match std::fs::read_to_string(&full_path) {
            Ok(t) => t,
            Err(_) => continue,
        };
        parsed_file_count += 1;
        let parsed = parse_ninja_text(&text);

        for edge in parsed.edges {
            for output in &edge.outputs {
                if output.ends_with(".o") {
                    if let Some(source) = edge.inputs.first() {
                        if let Some(existing) = object_to_source.get(output) {
                            if existing != source {
                                return Err(crate::error::Error::integrity(format!(
                                    "ninja output {output} has conflicting inputs: {existing} vs {source}"
                                )));
                            }
                        } else {
                            object_to_source.insert(output.clone(), source.clone());
                        }
                    }
                } else if output.ends_with(".a") {
                    let members = archive_members.entry(output.clone()).or_default();
                    for input in &edge.inputs {
                        members.insert(basename(input), input.clone());
                    }
                } else if let Some(elf_name) = final_elf_name {
                    if basename(output) == elf_name {
                        final_elf_inputs = Some(edge.inputs.clone());
                    }
                }
            }
        }

        for subninja in parsed.subninjas {
            queue.push(subninja);
        }
    }

    Ok(SourceMapper {
        object_to_source,
        archive_members,
        final_elf_inputs,
        parsed_file_count,
        unmatched: std::sync::atomic::AtomicUsize::new(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, contents: &str) {
        std::fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn maps_object_to_source() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "build.ninja",
            "build obj/a/x.o: cxx ../../a/x.cc\n",
        );
        let mapper = parse(dir.path(), "build.ninja", None).unwrap();
        let diag = Diagnostics::new();
        assert_eq!(
            mapper.find_source("obj/a/x.o", &diag),
            Some("../../a/x.cc".to_string())
        );
        assert_eq!(diag.count(DiagnosticKind::UnresolvedSourcePath), 0);
    }

    #[test]
    fn resolves_archive_member_qualified_path() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "build.ninja",
            "build obj/a/x.o: cxx ../../a/x.cc\n\
             build obj/a/liba.a: alink obj/a/x.o\n",
        );
        let mapper = parse(dir.path(), "build.ninja", None).unwrap();
        let diag = Diagnostics::new();
        assert_eq!(
            mapper.find_source("obj/a/liba.a(x.o)", &diag),
            Some("../../a/x.cc".to_string())
        );
    }

    #[test]
    fn follows_subninja() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "build.ninja", "subninja toolchain.ninja\n");
        write(
            dir.path(),
            "toolchain.ninja",
            "build obj/b/y.o: cxx ../../b/y.cc\n",
        );
        let mapper = parse(dir.path(), "build.ninja", None).unwrap();
        assert_eq!(mapper.parsed_file_count(), 2);
        let diag = Diagnostics::new();
        assert_eq!(
            mapper.find_source("obj/b/y.o", &diag),
            Some("../../b/y.cc".to_string())
        );
    }

    #[test]
    fn unresolved_path_is_counted_and_warned() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "build.ninja", "");
        let mapper = parse(dir.path(), "build.ninja", None).unwrap();
        let diag = Diagnostics::new();
        assert_eq!(mapper.find_source("obj/missing.o", &diag), None);
        assert_eq!(mapper.unmatched_paths_count(), 1);
        assert_eq!(diag.count(DiagnosticKind::UnresolvedSourcePath), 1);
    }

    #[test]
    fn duplicate_output_with_different_inputs_is_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "build.ninja",
            "build obj/a/x.o: cxx ../../a/x.cc\n\
             build obj/a/x.o: cxx ../../a/other.cc\n",
        );
        let result = parse(dir.path(), "build.ninja", None);
        assert!(result.is_err());
    }

    #[test]
    fn final_elf_inputs_matched_by_basename() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "build.ninja",
            "build ./libmonochrome.so: link obj/a/x.o obj/b/y.o\n",
        );
        let mapper = parse(dir.path(), "build.ninja", Some("libmonochrome.so")).unwrap();
        assert_eq!(
            mapper.final_elf_inputs(),
            Some(&["obj/a/x.o".to_string(), "obj/b/y.o".to_string()][..])
        );
    }

    #[test]
    fn escaped_space_in_path_is_preserved() {
        assert_eq!(split_paths("foo\\ bar.o baz.o"), vec!["foo bar.o", "baz.o"]);
    }
}
