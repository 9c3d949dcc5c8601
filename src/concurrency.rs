//! Worker-thread runtime (C1).
//!
//! The original tool forks helper *processes* because its host runtime has no
//! usable threads for CPU-bound work. A Rust port has cheap native threads, so
//! that is the vehicle here; the contract in the design's concurrency section
//! (two primitives, an env-var escape hatch to force synchronous execution, and
//! a teardown hook that reaps outstanding workers on abnormal exit) is what is
//! preserved, not the process boundary.

use std::process::Child;
use std::sync::{Mutex, OnceLock};
use std::thread::JoinHandle;

/// Forces every [`run_async`] / [`bulk`] call onto the calling thread. Used by
/// tests that need deterministic ordering, and available to callers for the
/// same reason the original tool exposed it.
pub const DISABLE_ASYNC_ENV: &str = "SUPERSIZE_DISABLE_ASYNC";

fn async_disabled() -> bool {
    std::env::var_os(DISABLE_ASYNC_ENV).is_some_and(|v| v == "1")
}

/// A handle to work dispatched via [`run_async`].
///
/// Mirrors the original's `future.get()`: the caller can do other work between
/// receiving the handle and calling [`Task::get`], and `get` blocks until the
/// worker is done.
pub enum Task<T> {
    Spawned(JoinHandle<T>),
    Ready(T),
}

impl<T: Send + 'static> Task<T> {
    /// Blocks until the worker finishes and returns its result.
    ///
    /// Panics (the worker equivalent of a subprocess crashing) are propagated
    /// by resuming the unwind on the calling thread, so a panicking worker
    /// still surfaces as a panic to the caller rather than silently vanishing.
    pub fn get(self) -> T {
        match self {
            Task::Ready(value) => value,
            Task::Spawned(handle) => match handle.join() {
                Ok(value) => value,
                Err(payload) => std::panic::resume_unwind(payload),
            },
        }
    }
}

/// Fork-and-call: runs `f` on a worker thread (or inline, under
/// [`DISABLE_ASYNC_ENV`]) and returns a handle the caller can `get()` later.
pub fn run_async<F, T>(f: F) -> Task<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    if async_disabled() {
        Task::Ready(f())
    } else {
        Task::Spawned(std::thread::spawn(f))
    }
}

/// Bulk parallel map: runs `f` over every element of `args`, across a thread
/// pool sized to the machine, with no ordering guarantee between results.
///
/// Parallelism is provided by `rayon`'s global pool; under
/// [`DISABLE_ASYNC_ENV`] this degrades to a plain sequential map.
pub fn bulk<A, T, F>(args: Vec<A>, f: F) -> Vec<T>
where
    A: Send,
    T: Send,
    F: Fn(A) -> T + Sync,
{
    if async_disabled() {
        args.into_iter().map(f).collect()
    } else {
        use rayon::prelude::*;
        args.into_par_iter().map(f).collect()
    }
}

/// Process-wide registry of subprocess children spawned by C4/C8, so a
/// teardown hook can reap them if the master exits abnormally.
static CHILD_REGISTRY: OnceLock<Mutex<Vec<Child>>> = OnceLock::new();

fn registry() -> &'static Mutex<Vec<Child>> {
    CHILD_REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

/// Registers a spawned child so [`kill_outstanding_workers`] can reap it.
pub fn register_child(child: Child) {
    registry().lock().unwrap().push(child);
}

/// Kills every still-registered child process. Called by the top-level
/// `archive` entry point on any fatal error, and installable as a panic hook
/// via [`install_teardown_hook`].
pub fn kill_outstanding_workers() {
    let mut children = registry().lock().unwrap();
    for mut child in children.drain(..) {
        let _ = child.kill();
        let _ = child.wait();
    }
}

/// Chains a panic hook that reaps outstanding worker processes before handing
/// off to whatever hook was previously installed. Idempotent only in the sense
/// that calling it twice chains twice; callers should call it once at process
/// start.
pub fn install_teardown_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        kill_outstanding_workers();
        previous(info);
    }));
}

/// Compact marshalling for `name -> [paths]` maps (§4.1).
///
/// Encodes a dictionary of `String -> Vec<String>` as three parts: a single
/// string of keys joined by `\n`, a single string of path components joined by
/// `\n`, and an index table of `(key_len_in_entries)` so the reader can walk
/// both streams in one pass without per-entry allocation for the lengths.
/// This is the representation C4's helper-process mode would put on the wire;
/// it is equally useful for handing large maps between worker threads without
/// cloning a `HashMap<String, Vec<String>>` node by node.
pub mod marshal {
    use std::collections::HashMap;

    const SEP: char = '\n';

    /// The wire form of a `name -> [paths]` map.
    pub struct Encoded {
        pub keys: String,
        pub paths: String,
        /// Number of paths contributed by each key, in key order.
        pub counts: Vec<u32>,
    }

    pub fn encode(map: &HashMap<String, Vec<String>>) -> Encoded {
        let mut keys = String::new();
        let mut paths = String::new();
        let mut counts = Vec::with_capacity(map.len());

        // Deterministic order so encode/decode round-trips are reproducible
        // in tests regardless of hash map iteration order.
        let mut entries: Vec<_> = map.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        for (key, values) in entries {
            if !keys.is_empty() {
                keys.push(SEP);
            }
            keys.push_str(key);
            counts.push(values.len() as u32);
            for value in values {
                if !paths.is_empty() {
                    paths.push(SEP);
                }
                paths.push_str(value);
            }
        }

        Encoded {
            keys,
            paths,
            counts,
        }
    }

    pub fn decode(encoded: &Encoded) -> HashMap<String, Vec<String>> {
        let keys: Vec<&str> = if encoded.keys.is_empty() {
            Vec::new()
        } else {
            encoded.keys.split(SEP).collect()
        };
        let mut path_iter = if encoded.paths.is_empty() {
            Vec::new().into_iter()
        } else {
            encoded.paths.split(SEP).collect::<Vec<_>>().into_iter()
        };

        let mut out = HashMap::with_capacity(keys.len());
        for (key, count) in keys.into_iter().zip(encoded.counts.iter()) {
            let values: Vec<String> = (0..*count)
                .filter_map(|_| path_iter.next().map(str::to_owned))
                .collect();
            out.insert(key.to_owned(), values);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn run_async_roundtrips() {
        let task = run_async(|| 1 + 1);
        assert_eq!(task.get(), 2);
    }

    #[test]
    fn bulk_preserves_all_results_unordered() {
        let mut results = bulk(vec![1, 2, 3, 4], |x| x * x);
        results.sort_unstable();
        assert_eq!(results, vec![1, 4, 9, 16]);
    }

    #[test]
    fn marshal_roundtrips_dict_of_lists() {
        let mut map = HashMap::new();
        map.insert("foo".to_string(), vec!["a.o".to_string(), "b.o".to_string()]);
        map.insert("bar".to_string(), vec![]);
        map.insert("baz".to_string(), vec!["c.o".to_string()]);

        let encoded = marshal::encode(&map);
        let decoded = marshal::decode(&encoded);
        assert_eq!(decoded, map);
    }
}
