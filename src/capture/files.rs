use crate::error::ScanError;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Data files found below a scan directory, each list sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataFiles {
    pub xml: Vec<PathBuf>,
    pub captures: Vec<PathBuf>,
}

impl DataFiles {
    pub fn is_empty(&self) -> bool {
        self.xml.is_empty() && self.captures.is_empty()
    }
}

/// Directory argument as typed by a user, without surrounding whitespace or quotes.
pub fn clean_data_dir(dir: &str) -> PathBuf {
    PathBuf::from(dir.trim().trim_matches('"').trim_matches('\''))
}

pub fn find_data_files(dir: &str) -> Result<DataFiles, ScanError> {
    let root = clean_data_dir(dir);
    let metadata = match std::fs::metadata(&root) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ScanError::DataDirectory(format!(
                "directory does not exist: {}",
                root.display()
            )))
        }
        Err(e) => {
            return Err(ScanError::DataDirectory(format!(
                "could not access directory {}: {}",
                root.display(),
                e
            )))
        }
    };
    if !metadata.is_dir() {
        return Err(ScanError::DataDirectory(format!(
            "path is not a directory: {}",
            root.display()
        )));
    }

    let mut files = DataFiles::default();
    walk(&root, &mut files)?;
    files.xml.sort();
    files.captures.sort();
    debug!(
        "Found {} XML and {} capture file(s) in {}",
        files.xml.len(),
        files.captures.len(),
        root.display()
    );
    Ok(files)
}

fn walk(dir: &Path, files: &mut DataFiles) -> Result<(), ScanError> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        ScanError::DataDirectory(format!("error walking directory {}: {}", dir.display(), e))
    })?;
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry in {}: {}", dir.display(), e);
                continue;
            }
        };
        let path = entry.path();
        if path.is_dir() {
            walk(&path, files)?;
            continue;
        }
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase());
        match extension.as_deref() {
            Some("xml") => files.xml.push(path),
            Some("pcap") | Some("pcapng") => files.captures.push(path),
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("snailshell-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_find_data_files_recursive_and_sorted() {
        let dir = scratch_dir("files");
        std::fs::create_dir_all(dir.join("day2")).unwrap();
        for name in ["b.xml", "a.XML", "day2/c.pcapng", "a.pcap", "notes.txt"] {
            std::fs::write(dir.join(name), b"").unwrap();
        }

        let quoted = format!("  \"{}\" ", dir.display());
        let files = find_data_files(&quoted).unwrap();
        assert_eq!(files.xml, vec![dir.join("a.XML"), dir.join("b.xml")]);
        assert_eq!(files.captures, vec![dir.join("a.pcap"), dir.join("day2/c.pcapng")]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_find_data_files_errors() {
        let missing = std::env::temp_dir().join("snailshell-definitely-missing-dir");
        let err = find_data_files(&missing.display().to_string()).unwrap_err();
        assert!(err.to_string().contains("does not exist"), "got {}", err);

        let dir = scratch_dir("notadir");
        let file = dir.join("plain.txt");
        std::fs::write(&file, b"x").unwrap();
        let err = find_data_files(&file.display().to_string()).unwrap_err();
        assert!(err.to_string().contains("not a directory"), "got {}", err);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_empty_directory_has_no_files() {
        let dir = scratch_dir("empty");
        assert!(find_data_files(&dir.display().to_string()).unwrap().is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
