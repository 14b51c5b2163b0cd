//! Host-local operations on segment data directories: deleting the intermediate cluster,
//! restoring link-mode damage, staging the upgraded coordinator onto primaries, and
//! rewriting configuration files.

use std::io;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use tracing::info;

use utils::crashsafe;
use utils::exec::OutputSink;
use utils::rsync::{self, RsyncOption};

/// Files that every data directory must contain.
const DATA_DIR_MARKERS: &[&str] = &["PG_VERSION", "postgresql.conf"];

/// Per-segment files that must survive staging the upgraded coordinator onto a primary.
pub const SEGMENT_LOCAL_FILES: &[&str] = &[
    "internal.auto.conf",
    "postgresql.conf",
    "pg_hba.conf",
    "postmaster.opts",
    "postgresql.auto.conf",
    "gp_dbid",
    "gpssh.conf",
    "gpperfmon",
];

/// Prefix of the per-version directory inside each tablespace location.
const TABLESPACE_DIR_PREFIX: &str = "GPDB_";

/// Checks that `dir` looks like a data directory before anything deletes it.
pub fn verify_data_directory(dir: &Utf8Path) -> anyhow::Result<()> {
    let missing: Vec<&str> = DATA_DIR_MARKERS
        .iter()
        .copied()
        .filter(|f| !dir.join(f).exists())
        .collect();
    if !missing.is_empty() {
        anyhow::bail!(
            "{dir} does not look like a data directory: missing {}",
            missing.join(", ")
        );
    }
    Ok(())
}

/// Deletes data directories. Directories that are already gone are skipped, so a failed
/// revert can be rerun.
pub fn delete_data_directories(dirs: &[Utf8PathBuf]) -> anyhow::Result<()> {
    for dir in dirs {
        if !dir.exists() {
            info!("data directory {dir} is already deleted");
            continue;
        }
        verify_data_directory(dir)?;
        info!("deleting data directory {dir}");
        utils::fs_ext::remove_dir_all(dir).with_context(|| format!("delete {dir}"))?;
    }
    Ok(())
}

/// Deletes `<location>/<dbid>/GPDB_<major>_<catver>` directories, then their `<dbid>`
/// parent when nothing else is left in it.
pub fn delete_tablespace_directories(dirs: &[Utf8PathBuf]) -> anyhow::Result<()> {
    for dir in dirs {
        let name = dir.file_name().unwrap_or_default();
        if !name.starts_with(TABLESPACE_DIR_PREFIX) {
            anyhow::bail!("refusing to delete {dir}: not a {TABLESPACE_DIR_PREFIX} tablespace directory");
        }

        info!("deleting tablespace directory {dir}");
        utils::fs_ext::remove_dir_all(dir).with_context(|| format!("delete {dir}"))?;

        if let Some(db_id_dir) = dir.parent() {
            match std::fs::remove_dir(db_id_dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                // still holds the source's tablespace
                Err(e) if e.raw_os_error() == Some(nix::libc::ENOTEMPTY) => {}
                Err(e) => return Err(e).with_context(|| format!("delete {db_id_dir}")),
            }
        }
    }
    Ok(())
}

/// Undoes pg_upgrade's link mode renaming of `global/pg_control` in a source data
/// directory, which makes the source startable again.
pub fn restore_pg_control(data_dir: &Utf8Path) -> anyhow::Result<()> {
    let global = data_dir.join("global");
    let renamed = global.join("pg_control.old");
    let original = global.join("pg_control");

    if !renamed.exists() {
        if original.exists() {
            info!("{original} is already in place");
            return Ok(());
        }
        anyhow::bail!("neither {renamed} nor {original} exists");
    }

    info!("restoring {original}");
    std::fs::rename(&renamed, &original)
        .with_context(|| format!("rename {renamed} to {original}"))?;
    crashsafe::fsync(&global)
}

/// Replaces `data_dir`'s contents with the upgraded coordinator copied to this host,
/// keeping the files that make the data directory a particular segment.
pub async fn restore_upgraded_coordinator(
    post_upgrade_coordinator: &Utf8Path,
    data_dir: &Utf8Path,
    sink: &dyn OutputSink,
) -> anyhow::Result<()> {
    let opts = rsync::Options::new(
        vec![rsync::contents_of(post_upgrade_coordinator)],
        rsync::contents_of(data_dir),
    )
    .with_options(&[RsyncOption::Archive, RsyncOption::Delete])
    .with_excludes(SEGMENT_LOCAL_FILES.iter().copied());
    rsync::rsync(&opts, sink).await?;
    Ok(())
}

/// A regular expression substitution applied to every line of a configuration file.
#[derive(Debug, Clone)]
pub struct LineRewrite {
    pub pattern: Regex,
    pub replacement: String,
}

impl LineRewrite {
    pub fn new(pattern: &str, replacement: impl Into<String>) -> anyhow::Result<LineRewrite> {
        Ok(LineRewrite {
            pattern: Regex::new(pattern).with_context(|| format!("invalid pattern {pattern:?}"))?,
            replacement: replacement.into(),
        })
    }

    /// Rewrites an uncommented `port=` line, as found in postgresql.conf.
    pub fn port(old: u16, new: u16) -> LineRewrite {
        LineRewrite {
            pattern: port_pattern(r"^(\s*port\s*=\s*)", old, r"(\b.*)$"),
            replacement: format!("${{1}}{new}${{2}}"),
        }
    }

    /// Rewrites the port inside `primary_conninfo`, as found in recovery.conf and
    /// postgresql.auto.conf of mirrors and standbys.
    pub fn primary_conninfo_port(old: u16, new: u16) -> LineRewrite {
        LineRewrite {
            pattern: port_pattern(r"^(\s*primary_conninfo\s*=.*\bport=)", old, r"(\b.*)$"),
            replacement: format!("${{1}}{new}${{2}}"),
        }
    }

    pub fn apply(&self, contents: &str) -> String {
        let mut out = String::with_capacity(contents.len());
        for line in contents.split_inclusive('\n') {
            let (body, newline) = match line.strip_suffix('\n') {
                Some(body) => (body, "\n"),
                None => (line, ""),
            };
            out.push_str(&self.pattern.replace(body, self.replacement.as_str()));
            out.push_str(newline);
        }
        out
    }
}

fn port_pattern(prefix: &str, port: u16, suffix: &str) -> Regex {
    // The pieces are fixed apart from a number, so the pattern is always valid.
    Regex::new(&format!("{prefix}{port}{suffix}")).unwrap()
}

/// Applies `rewrites` to `path`, replacing it atomically.
pub fn rewrite_file(path: &Utf8Path, rewrites: &[LineRewrite]) -> anyhow::Result<()> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("read {path}"))?;
    let rewritten = rewrites
        .iter()
        .fold(contents.clone(), |acc, rewrite| rewrite.apply(&acc));
    if rewritten == contents {
        return Ok(());
    }
    info!("rewriting {path}");
    crashsafe::overwrite(path, rewritten.as_bytes()).with_context(|| format!("write {path}"))
}

/// Appends the `host all all <hostname> trust` lines missing from `pg_hba.conf`.
pub fn append_hba_entries(hba: &Utf8Path, hostnames: &[String]) -> anyhow::Result<()> {
    let contents = std::fs::read_to_string(hba).with_context(|| format!("read {hba}"))?;
    let mut updated = contents.clone();
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }

    for host in hostnames {
        let entry = format!("host all all {host} trust");
        let present = contents
            .lines()
            .any(|l| l.split_whitespace().collect::<Vec<_>>().join(" ") == entry);
        if !present {
            updated.push_str(&entry);
            updated.push('\n');
        }
    }

    if updated == contents {
        return Ok(());
    }
    crashsafe::overwrite(hba, updated.as_bytes()).with_context(|| format!("write {hba}"))
}

#[cfg(test)]
mod tests {
    use camino_tempfile::Utf8TempDir;

    use super::*;

    fn data_dir(tmp: &Utf8TempDir, name: &str) -> Utf8PathBuf {
        let dir = tmp.path().join(name);
        std::fs::create_dir_all(dir.join("global")).unwrap();
        std::fs::write(dir.join("PG_VERSION"), "9.4\n").unwrap();
        std::fs::write(dir.join("postgresql.conf"), "port=50432\n").unwrap();
        dir
    }

    #[test]
    fn deletes_only_data_directories() {
        let tmp = camino_tempfile::tempdir().unwrap();
        let dir = data_dir(&tmp, "demoDataDir.AAAAAAAAAAA.0");
        let missing = tmp.path().join("demoDataDir.AAAAAAAAAAA.1");

        delete_data_directories(&[dir.clone(), missing.clone()]).unwrap();
        assert!(!dir.exists());

        let home = tmp.path().join("home");
        std::fs::create_dir(&home).unwrap();
        let err = delete_data_directories(&[home.clone()]).unwrap_err();
        assert!(err.to_string().contains("PG_VERSION, postgresql.conf"), "{err}");
        assert!(home.exists());
    }

    #[test]
    fn deletes_tablespace_directories_and_empty_parents() {
        let tmp = camino_tempfile::tempdir().unwrap();
        let location = tmp.path().join("ts");
        let target = location.join("3").join("GPDB_6_301908232");
        std::fs::create_dir_all(target.join("16386")).unwrap();
        let shared = location.join("4").join("GPDB_6_301908232");
        std::fs::create_dir_all(&shared).unwrap();
        std::fs::create_dir_all(location.join("4").join("GPDB_5_301607301")).unwrap();

        delete_tablespace_directories(&[target.clone(), shared.clone()]).unwrap();
        assert!(!location.join("3").exists());
        assert!(!shared.exists());
        assert!(location.join("4").join("GPDB_5_301607301").exists());

        // a rerun finds nothing left to do
        delete_tablespace_directories(&[target]).unwrap();

        let err = delete_tablespace_directories(&[location.join("4")]).unwrap_err();
        assert!(err.to_string().contains("refusing"), "{err}");
    }

    #[test]
    fn restores_pg_control() {
        let tmp = camino_tempfile::tempdir().unwrap();
        let dir = data_dir(&tmp, "demoDataDir0");
        std::fs::write(dir.join("global/pg_control.old"), b"control").unwrap();

        restore_pg_control(&dir).unwrap();
        assert_eq!(std::fs::read(dir.join("global/pg_control")).unwrap(), b"control");
        restore_pg_control(&dir).unwrap();

        std::fs::remove_file(dir.join("global/pg_control")).unwrap();
        assert!(restore_pg_control(&dir).is_err());
    }

    #[test]
    fn rewrites_ports() {
        let conf = "#port=5432\nport=50432 # set by gpinitsystem\nport = 504321\nmax_connections=750\n";
        assert_eq!(
            LineRewrite::port(50432, 5432).apply(conf),
            "#port=5432\nport=5432 # set by gpinitsystem\nport = 504321\nmax_connections=750\n"
        );

        let recovery = "standby_mode = 'on'\nprimary_conninfo = 'user=gpadmin host=sdw1 port=50434 sslmode=prefer application_name=gp_walreceiver'\n";
        assert_eq!(
            LineRewrite::primary_conninfo_port(50434, 25432).apply(recovery),
            "standby_mode = 'on'\nprimary_conninfo = 'user=gpadmin host=sdw1 port=25432 sslmode=prefer application_name=gp_walreceiver'\n"
        );
    }

    #[test]
    fn rewrite_file_is_atomic_and_idempotent() {
        let tmp = camino_tempfile::tempdir().unwrap();
        let dir = data_dir(&tmp, "demoDataDir-1");
        let conf = dir.join("postgresql.conf");
        let rewrites = [LineRewrite::port(50432, 5432)];

        rewrite_file(&conf, &rewrites).unwrap();
        rewrite_file(&conf, &rewrites).unwrap();
        assert_eq!(std::fs::read_to_string(&conf).unwrap(), "port=5432\n");
    }

    #[test]
    fn appends_missing_hba_entries() {
        let tmp = camino_tempfile::tempdir().unwrap();
        let hba = tmp.path().join("pg_hba.conf");
        std::fs::write(&hba, "local all gpadmin ident\nhost  all  all  sdw1  trust").unwrap();

        let hosts = vec!["sdw1".to_string(), "sdw2".to_string()];
        append_hba_entries(&hba, &hosts).unwrap();
        append_hba_entries(&hba, &hosts).unwrap();
        assert_eq!(
            std::fs::read_to_string(&hba).unwrap(),
            "local all gpadmin ident\nhost  all  all  sdw1  trust\nhost all all sdw2 trust\n"
        );
    }
}
