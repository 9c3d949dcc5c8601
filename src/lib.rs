//! A binary size attribution engine: given a linker map, an optional
//! unstripped ELF, and an optional ninja build output directory, produces a
//! normalized, queryable [`SizeInfo`] attributing every symbol to a source
//! file, an object file, and its alias group.
//!
//! The top-level entry point is [`archive`]. Everything else (`SymbolGroup`
//! queries, diffing, persistence) operates on the [`SizeInfo`] it returns.

pub mod concurrency;
pub mod diff;
pub mod error;
pub mod group;
pub mod linker_map;
pub mod metadata;
pub mod model;
pub mod ninja;
pub mod nm;
pub mod normalize;
pub mod pathutil;
pub mod persist;
pub mod resolve;
#[cfg(test)]
mod testutil;

use std::path::{Path, PathBuf};

pub use diff::{diff, DeltaSizeInfo, DeltaStatus, DeltaSymbol};
pub use error::{Diagnostics, Error, Result};
pub use group::SymbolGroup;
pub use model::{AliasGroup, AliasGroupId, SectionTag, SizeInfo, Symbol, SymbolFlags};

/// Inputs and knobs for one [`archive`] run, mirroring the `archive`
/// subcommand's flags (§6) minus the CLI-layer-owned output path.
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub map_file: PathBuf,
    pub elf_file: Option<PathBuf>,
    pub output_directory: Option<PathBuf>,
    pub tool_prefix: Option<String>,
    /// When true, skips C3 ninja parsing and C6 stage 5's source-path
    /// resolution (`--no-source-paths`).
    pub no_source_paths: bool,
}

impl ArchiveOptions {
    pub fn new(map_file: impl Into<PathBuf>) -> Self {
        ArchiveOptions {
            map_file: map_file.into(),
            elf_file: None,
            output_directory: None,
            tool_prefix: None,
            no_source_paths: false,
        }
    }
}

/// Runs the full C2 → (C3 ∥ C5 ∥ C4) → C6 → C7 pipeline and returns the
/// resulting [`SizeInfo`] (§2, §5).
pub fn archive(options: &ArchiveOptions) -> Result<SizeInfo> {
    let diagnostics = Diagnostics::new();
    let result = archive_inner(options, &diagnostics);
    diagnostics.log_summary();
    if result.is_err() {
        concurrency::kill_outstanding_workers();
    }
    result
}

fn archive_inner(options: &ArchiveOptions, diagnostics: &Diagnostics) -> Result<SizeInfo> {
    let output_directory = if options.no_source_paths {
        None
    } else {
        Some(resolve::resolve_output_directory(
            &options.map_file,
            options.output_directory.as_deref(),
        )?)
    };

    let tool_prefix = match &output_directory {
        Some(dir) => resolve::resolve_tool_prefix(dir, options.tool_prefix.as_deref())?,
        None => options.tool_prefix.clone().unwrap_or_default(),
    };

    let map_text = linker_map::read_map_file(&options.map_file)?;

    let ninja_task = {
        let output_directory = output_directory.clone();
        let elf_name = options
            .elf_file
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned());
        concurrency::run_async(move || -> Result<Option<ninja::SourceMapper>> {
            match &output_directory {
                Some(dir) => Ok(Some(ninja::parse(dir, "build.ninja", elf_name.as_deref())?)),
                None => Ok(None),
            }
        })
    };

    let elf_tasks = options.elf_file.clone().map(|elf_path| {
        let tool_prefix = tool_prefix.clone();
        let nm_path = format!("{tool_prefix}nm");
        let readelf_path = format!("{tool_prefix}readelf");
        concurrency::run_async(move || -> Result<(metadata::ElfSummary, std::collections::HashMap<String, u64>, std::collections::HashMap<u64, Vec<String>>)> {
            let summary = metadata::read_elf_header(&readelf_path, &elf_path)?;
            let sections = metadata::read_elf_sections(&readelf_path, &elf_path)?;
            let aliases = nm::discover_aliases(&nm_path, &elf_path)?;
            Ok((summary, sections, aliases))
        })
    });

    let (section_sizes, mut symbols) = linker_map::parse(&map_text)?;

    let source_mapper = ninja_task.get()?;

    let object_paths: Vec<String> = symbols
        .iter()
        .filter_map(|s| s.object_path.clone())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();
    let object_name_map = if object_paths.is_empty() {
        nm::ObjectNameMap::new()
    } else {
        let nm_path = format!("{tool_prefix}nm");
        nm::discover_object_names(&nm_path, &object_paths)?
    };

    let mut metadata_map = model::Metadata::new();
    let mut alias_map = std::collections::HashMap::new();
    if let Some(task) = elf_tasks {
        let (summary, elf_sections, aliases) = task.get()?;
        metadata::verify_section_sizes(&section_sizes, &elf_sections)?;
        metadata_map.insert("arch".to_string(), format!("{:?}", summary.arch));
        if let Some(build_id) = summary.build_id {
            metadata_map.insert("build_id".to_string(), build_id);
        }
        alias_map = aliases;
    }
    metadata_map.insert("tool_prefix".to_string(), tool_prefix.clone());

    normalize::strip_linker_prefixes(&mut symbols);
    if symbols.iter().any(|s| s.full_name.starts_with("_Z")) {
        normalize::demangle_residuals(&mut symbols, &tool_prefix)?;
    }
    normalize::normalize_names(&mut symbols);

    let mut alias_groups = Vec::new();
    normalize::inject_aliases(&mut symbols, &alias_map, &mut alias_groups, diagnostics);

    if let Some(mapper) = &source_mapper {
        normalize::normalize_paths(&mut symbols, &object_name_map, mapper, diagnostics);
    }

    normalize::compute_padding(&mut symbols, diagnostics);
    normalize::check_section_coverage(&section_sizes, &symbols, diagnostics);

    Ok(SizeInfo {
        symbols,
        section_sizes,
        alias_groups,
        metadata: metadata_map,
    })
}

/// Loads a `.size` document previously written by [`persist::save`].
pub fn load(r: impl std::io::Read) -> Result<SizeInfo> {
    persist::load(r)
}

/// Writes `info` as a `.size` document.
pub fn save(info: &SizeInfo, w: impl std::io::Write) -> Result<()> {
    persist::save(info, w)
}

/// Re-exported for callers that want to drive `SourceMapper` resolution
/// manually (e.g. a CLI layer implementing `--no-source-paths` differently).
pub fn output_directory_for(map_file: &Path) -> Result<PathBuf> {
    resolve::resolve_output_directory(map_file, None)
}
