//! Fixture builders shared by unit and integration tests (C12, §4.12).
//!
//! Modeled on the teacher's fixture-path helper: small, in-memory corpora
//! matching the end-to-end scenarios in §8, built programmatically instead
//! of loaded from files so the pipeline's components can be exercised
//! without a real toolchain on the test machine.

#![cfg(test)]

use std::collections::HashMap;

/// Scenario A's map text: a `.text` section with two symbols, one of them
/// padded.
pub fn scenario_a_map() -> &'static str {
    "\
Memory map

.text           0x00001000       0x20
 .text.foo     0x00001000       0x10 obj/a.o
                0x00001000                foo
 .text.bar     0x00001018        0x8 obj/b.o
                0x00001018                bar
"
}

/// Scenario B's alias map: one address with two demangled names.
pub fn scenario_b_alias_map() -> HashMap<u64, Vec<String>> {
    let mut map = HashMap::new();
    map.insert(0x2000, vec!["foo".to_string(), "foo_alias".to_string()]);
    map
}

/// A minimal `build.ninja` mapping two object files to two source files
/// under a shared directory, for scenario E's ancestor-path test.
pub fn scenario_e_ninja() -> &'static str {
    "\
build obj/a/x.o: cxx ../../a/x.cc
build obj/a/sub/y.o: cxx ../../a/sub/y.cc
"
}

/// Scenario E's object-name map: a single symbol found in both object
/// files.
pub fn scenario_e_object_names() -> HashMap<String, Vec<String>> {
    let mut map = HashMap::new();
    map.insert(
        "sym".to_string(),
        vec!["obj/a/x.o".to_string(), "obj/a/sub/y.o".to_string()],
    );
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixtures_are_well_formed() {
        assert!(scenario_a_map().contains("Memory map"));
        assert_eq!(scenario_b_alias_map().len(), 1);
        assert!(!scenario_e_ninja().contains("subninja"));
        assert_eq!(scenario_e_object_names()["sym"].len(), 2);
    }
}
