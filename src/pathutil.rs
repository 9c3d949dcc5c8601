//! Path normalization and common-ancestor computation (part of C6 stage 5).
//!
//! Grounded on `symbolic-common`'s `path.rs`, which provides cross-platform
//! path-string utilities for a library that never touches the filesystem for
//! these operations. The primitives needed here are narrower — splitting on
//! `/`, stripping fixed prefixes, and finding the common directory prefix of a
//! set of paths — so this module keeps that file's "operate on `&str`, return
//! `Cow`/`String`, no `Path` round-trip" style rather than importing it whole.

use std::borrow::Cow;

/// Strips a leading `obj/` or `../../` from an object path, and rewrites
/// `foo/bar.a(baz.o)` archive-member notation to `foo/bar.a/baz.o`.
pub fn normalize_object_path(path: &str) -> String {
    let path = strip_prefix_component(path);
    rewrite_archive_member(&path).into_owned()
}

/// Strips a leading `gen/` (marking the source as generated) or `../../`
/// (marking it as not generated) from a source path. Any other path is
/// treated as generated, per §4.6 stage 5.
pub fn normalize_source_path(path: &str) -> (String, bool) {
    if let Some(rest) = path.strip_prefix("gen/") {
        (rest.to_string(), true)
    } else if let Some(rest) = strip_dotdot_prefix(path) {
        (rest.to_string(), false)
    } else {
        (path.to_string(), true)
    }
}

fn strip_prefix_component(path: &str) -> Cow<'_, str> {
    if let Some(rest) = path.strip_prefix("obj/") {
        Cow::Borrowed(rest)
    } else if let Some(rest) = strip_dotdot_prefix(path) {
        Cow::Owned(rest)
    } else {
        Cow::Borrowed(path)
    }
}

/// Strips a leading run of `../` components, returning `None` if there was
/// none to strip.
fn strip_dotdot_prefix(path: &str) -> Option<String> {
    let mut rest = path;
    let mut stripped = false;
    while let Some(tail) = rest.strip_prefix("../") {
        rest = tail;
        stripped = true;
    }
    if stripped {
        Some(rest.to_string())
    } else {
        None
    }
}

/// Rewrites `foo/bar.a(baz.o)` to `foo/bar.a/baz.o`.
fn rewrite_archive_member(path: &str) -> Cow<'_, str> {
    if let Some(open) = path.find('(') {
        if let Some(close) = path.rfind(')') {
            if close == path.len() - 1 && close > open {
                let archive = &path[..open];
                let member = &path[open + 1..close];
                return Cow::Owned(format!("{archive}/{member}"));
            }
        }
    }
    Cow::Borrowed(path)
}

/// Splits `archive(member)` notation used by `nm`'s multi-file output for
/// static library members, returning `(archive_path, member_name)`.
pub fn split_archive_qualifier(path: &str) -> Option<(&str, &str)> {
    let open = path.find('(')?;
    let close = path.rfind(')')?;
    if close == path.len() - 1 && close > open {
        Some((&path[..open], &path[open + 1..close]))
    } else {
        None
    }
}

fn dir_components(path: &str) -> Vec<&str> {
    match path.rfind('/') {
        Some(idx) => path[..idx].split('/').collect(),
        None => Vec::new(),
    }
}

/// Computes the common-ancestor directory of a set of paths (§4.6 stage 5,
/// §9 "common-ancestor placeholder").
///
/// If every path shares a non-empty leading sequence of directory components,
/// that shared prefix (joined with `/`) is the ancestor. Otherwise there is no
/// usable directory to roll the set up under, and the ancestor is the
/// load-bearing placeholder `{shared}/<N>` for `N` the number of distinct
/// paths — this is the form exercised by the worked example in §8 scenario E,
/// and is treated here as authoritative over the more general
/// `<dir>/{shared}/<N>` phrasing in the prose (see DESIGN.md).
pub fn common_ancestor<'a>(paths: impl IntoIterator<Item = &'a str>) -> String {
    let mut unique: Vec<&str> = Vec::new();
    for p in paths {
        if !unique.contains(&p) {
            unique.push(p);
        }
    }

    if unique.len() == 1 {
        return unique[0].to_string();
    }
    if unique.is_empty() {
        return String::new();
    }

    let mut prefix = dir_components(unique[0]);
    for path in &unique[1..] {
        let components = dir_components(path);
        let common_len = prefix
            .iter()
            .zip(components.iter())
            .take_while(|(a, b)| a == b)
            .count();
        prefix.truncate(common_len);
        if prefix.is_empty() {
            break;
        }
    }

    if prefix.is_empty() {
        format!("{{shared}}/{}", unique.len())
    } else {
        prefix.join("/")
    }
}
