//! Checks that a Greenplum installation is usable on this host.

use camino::{Utf8Path, Utf8PathBuf};

/// Files every installation taking part in an upgrade must have.
const INSTALLATION_FILES: &[&str] = &["greenplum_path.sh", "bin/postgres", "bin/pg_ctl"];

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("{gphome} is not a Greenplum installation: missing {}", .missing.join(", "))]
pub struct InvalidGphomeError {
    pub gphome: Utf8PathBuf,
    pub missing: Vec<String>,
}

pub fn check_gphome(gphome: &Utf8Path) -> Result<(), InvalidGphomeError> {
    let missing: Vec<String> = INSTALLATION_FILES
        .iter()
        .filter(|f| !gphome.join(f).is_file())
        .map(|f| f.to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(InvalidGphomeError {
            gphome: gphome.to_owned(),
            missing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_what_is_missing() {
        let dir = camino_tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("bin")).unwrap();
        std::fs::write(dir.path().join("greenplum_path.sh"), b"").unwrap();
        std::fs::write(dir.path().join("bin/postgres"), b"").unwrap();

        let err = check_gphome(dir.path()).unwrap_err();
        assert_eq!(err.missing, vec!["bin/pg_ctl"]);
        assert!(err.to_string().ends_with("missing bin/pg_ctl"), "{err}");

        std::fs::write(dir.path().join("bin/pg_ctl"), b"").unwrap();
        check_gphome(dir.path()).unwrap();
    }
}
