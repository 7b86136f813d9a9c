//! Scratch directories (spec.md section 6): a per-test/app temp directory
//! under the OS temp root, deleted and recreated fresh on every acquisition.

use std::env;
use std::fs;
use std::io;
use std::path::PathBuf;

const ROOT: &str = "arcana-nexus";
const MAX_NAME_LEN: usize = 31;

fn sanitize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphabetic())
        .take(MAX_NAME_LEN)
        .collect()
}

/// Acquires `<OS-temp>/arcana-nexus/tmpdata_<sanitized-name>/`, recursively
/// deleting it first if it already exists.
pub fn acquire(name: &str) -> io::Result<PathBuf> {
    let mut dir = env::temp_dir();
    dir.push(ROOT);
    dir.push(format!("tmpdata_{}", sanitize(name)));

    if dir.exists() {
        fs::remove_dir_all(&dir)?;
    }
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_and_truncates_the_name() {
        let s = sanitize("abc-123_XYZ!!extra-characters-that-push-well-past-the-limit");
        assert!(s.chars().all(|c| c.is_ascii_alphabetic()));
        assert!(s.len() <= MAX_NAME_LEN);
    }

    #[test]
    fn acquire_creates_a_fresh_empty_directory() {
        let dir = acquire("scratch_test_fixture").unwrap();
        assert!(dir.is_dir());
        fs::write(dir.join("marker"), b"x").unwrap();
        let dir2 = acquire("scratch_test_fixture").unwrap();
        assert_eq!(dir, dir2);
        assert!(!dir2.join("marker").exists());
    }
}
