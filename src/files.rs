//! Discovering the files each tag works on.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use regex::Regex;
use tokio::process::Command;

use crate::error::{Result, RunemError};
pub use crate::scheduler::FileListLookup;

/// List the files git tracks under `root` and bucket them by tag.
///
/// Called once per run, before any phase starts.
pub async fn find_files(root: &Path, filters: &BTreeMap<String, Regex>) -> Result<FileListLookup> {
    let output = Command::new("git")
        .arg("ls-files")
        .current_dir(root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| RunemError::FileDiscovery(format!("failed to run git ls-files: {}", e)))?;

    if !output.status.success() {
        return Err(RunemError::FileDiscovery(format!(
            "git ls-files in {} exited with {}: {}",
            root.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let listing = String::from_utf8_lossy(&output.stdout);
    let lookup = bucket_files(listing.lines(), filters);
    tracing::debug!(
        root = %root.display(),
        tags = lookup.len(),
        "Bucketed tracked files"
    );
    Ok(lookup)
}

/// Put each path into every tag whose regex matches somewhere in it.
///
/// Tags with no matching files are absent from the result. Each bucket is
/// sorted so runs are deterministic.
pub fn bucket_files<'a>(
    paths: impl IntoIterator<Item = &'a str>,
    filters: &BTreeMap<String, Regex>,
) -> FileListLookup {
    let mut lookup = FileListLookup::new();
    for path in paths {
        for (tag, regex) in filters {
            if regex.is_match(path) {
                lookup.entry(tag.clone()).or_default().push(path.to_string());
            }
        }
    }
    for files in lookup.values_mut() {
        files.sort();
    }
    lookup
}

/// `found 2 batches, 3 'py' files, 1 'yaml' files`
pub fn summary_line(lookup: &FileListLookup) -> String {
    let mut tags: Vec<&String> = lookup.keys().collect();
    tags.sort();
    let mut line = format!("found {} batches", lookup.len());
    for tag in tags {
        line.push_str(&format!(", {} '{}' files", lookup[tag].len(), tag));
    }
    line
}
