//! Worker-side merge entry
//!
//! `list <modules-dir>` prints one `ORDER:<name>` line per module.
//! `merge <modules-dir> <output> [skip,csv]` merges and prints diagnostics.

use super::modules::ModuleSet;
use crate::error::MergeError;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;

/// Entry name selecting the merge worker
pub const MERGE_ENTRY: &str = "merge";

/// Action printing the merge order
pub const ACTION_LIST: &str = "list";

/// Action performing the merge
pub const ACTION_MERGE: &str = "merge";

/// Prefix of merge-order lines on stdout
pub const ORDER_PREFIX: &str = "ORDER:";

/// Run the merge entry with its arguments; returns the process exit code
pub fn run_merge_entry(args: &[String], out: &mut dyn Write) -> i32 {
    match dispatch(args, out) {
        Ok(()) => 0,
        Err(err) => {
            let _ = writeln!(out, "merge failed: {err}");
            1
        }
    }
}

fn dispatch(args: &[String], out: &mut dyn Write) -> Result<(), MergeError> {
    let mut log = |line: &str| {
        let _ = writeln!(out, "{line}");
    };
    match args {
        [action, dir] if action == ACTION_LIST => {
            let modules = ModuleSet::load(Path::new(dir), &mut |_| {})?;
            for name in modules.order() {
                log(&format!("{ORDER_PREFIX}{name}"));
            }
            Ok(())
        }
        [action, dir, output, rest @ ..] if action == ACTION_MERGE && rest.len() <= 1 => {
            let skip: BTreeSet<String> = rest
                .first()
                .map(|csv| {
                    csv.split(',')
                        .map(str::trim)
                        .filter(|name| !name.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default();
            let modules = ModuleSet::load(Path::new(dir), &mut log)?;
            modules.merge(Path::new(output), &skip, &mut log)?;
            Ok(())
        }
        _ => Err(MergeError::Failed(format!(
            "usage: {ACTION_LIST} <modules-dir> | {ACTION_MERGE} <modules-dir> <output> [skip,csv] (got {args:?})"
        ))),
    }
}
