//! Frozen execution policy: which modules a code action may import and which
//! binaries `run_command` may launch.
//!
//! Both lists are policy, not configuration. They are compiled in and shared
//! by the static validator (pre-execution) and the runtime import hook, so
//! the two defense layers can never disagree about what is permitted.

/// Root packages a code action is allowed to import.
///
/// The set covers what the tool primitives need plus typical data wrangling.
/// Matching is an exact string comparison on the root segment of the dotted
/// module name, so `xml.etree.ElementTree` is admitted through `xml` while
/// `socket` has no entry at all.
pub const ALLOWED_IMPORT_ROOTS: &[&str] = &[
    "os",
    "subprocess",
    "pathlib",
    "json",
    "re",
    "shutil",
    "difflib",
    "textwrap",
    "xml",
    "collections",
    "itertools",
    "functools",
    "tempfile",
    "typing",
];

/// Binaries `run_command` is allowed to spawn, matched against `argv[0]`.
///
/// Deliberately short: the build/test tools the agent needs and nothing else.
pub const ALLOWED_COMMANDS: &[&str] = &["mvn", "./gradlew", "java", "git", "rg"];

/// Returns the root segment of a dotted module name.
///
/// `"xml.etree.ElementTree"` yields `"xml"`; a name without dots is returned
/// unchanged.
pub fn module_root(module_name: &str) -> &str {
    module_name.split('.').next().unwrap_or(module_name)
}

/// Whether an import of `module_name` is permitted.
pub fn import_allowed(module_name: &str) -> bool {
    ALLOWED_IMPORT_ROOTS.contains(&module_root(module_name))
}

/// Whether `run_command` may execute `command` (compared as `argv[0]`).
pub fn command_allowed(command: &str) -> bool {
    ALLOWED_COMMANDS.contains(&command)
}
