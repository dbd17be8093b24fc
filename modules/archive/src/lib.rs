//! Archive collaborator: agent-bundle extraction and packing, atomic
//! entry injection into the web archive, and scoped guards for the staging
//! directory and the secret-bearing config file.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use iastkit_core::{ASOC_CONFIG_FILENAME, WAR_NAME};
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

/// Working directory for bundle assembly. The tree is removed when the
/// guard drops, on success and failure paths alike.
pub struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        fs::create_dir_all(&path)
            .with_context(|| format!("creating staging directory {}", path.display()))?;
        Ok(StagingDir { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            warn!(
                "failed to remove staging directory {}: {e}",
                self.path.display()
            );
        }
    }
}

/// A file holding credential material. Exists on disk only while the guard
/// lives; removal runs on every exit path.
pub struct SecretFile {
    path: PathBuf,
}

impl SecretFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SecretFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("failed to remove {}: {e}", self.path.display());
        }
    }
}

/// Writes the config artifact carrying the agent key into `dir`.
pub fn write_agent_config(dir: &Path, agent_key: &str, host: Option<&str>) -> Result<SecretFile> {
    let path = dir.join(ASOC_CONFIG_FILENAME);
    let config = match host {
        Some(host) => serde_json::json!({ "accessToken": agent_key, "host": host }),
        None => serde_json::json!({ "accessToken": agent_key }),
    };
    fs::write(&path, serde_json::to_vec(&config)?)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(SecretFile { path })
}

/// Unpacks a zip archive into `dest`.
pub fn extract(archive: &Path, dest: &Path) -> Result<()> {
    let file =
        File::open(archive).with_context(|| format!("opening {}", archive.display()))?;
    let mut zip = ZipArchive::new(file)
        .with_context(|| format!("reading archive {}", archive.display()))?;
    zip.extract(dest)
        .with_context(|| format!("extracting {}", archive.display()))?;
    Ok(())
}

/// Adds or replaces the archive entry named after `file` — the atomic
/// add/update-entry operation. The archive is rewritten to a sibling temp
/// file and swapped in with a rename.
pub fn add_file_to_archive(archive: &Path, file: &Path) -> Result<()> {
    let entry_name = file
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("invalid entry file name: {}", file.display()))?;
    let data = fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let src =
        File::open(archive).with_context(|| format!("opening {}", archive.display()))?;
    let zin = ZipArchive::new(src)
        .with_context(|| format!("reading archive {}", archive.display()))?;
    let tmp = tmp_sibling(archive);
    let out =
        File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
    if let Err(e) = rewrite_with_entry(zin, out, &entry_name, &data) {
        let _ = fs::remove_file(&tmp);
        return Err(e.context(format!("updating {} in {}", entry_name, archive.display())));
    }
    fs::rename(&tmp, archive)
        .with_context(|| format!("replacing {}", archive.display()))?;
    debug!("updated {} in {}", entry_name, archive.display());
    Ok(())
}

fn rewrite_with_entry(
    mut zin: ZipArchive<File>,
    out: File,
    entry_name: &str,
    data: &[u8],
) -> Result<()> {
    let mut zout = ZipWriter::new(out);
    for i in 0..zin.len() {
        let entry = zin.by_index_raw(i)?;
        if entry.name() != entry_name {
            zout.raw_copy_file(entry)?;
        }
    }
    zout.start_file(entry_name, SimpleFileOptions::default())?;
    zout.write_all(data)?;
    zout.finish()?;
    Ok(())
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Zips every file under `dir` into `output`, skipping zip files already
/// present so bundles do not nest.
pub fn pack_dir(dir: &Path, output: &Path) -> Result<()> {
    let out =
        File::create(output).with_context(|| format!("creating {}", output.display()))?;
    let mut zip = ZipWriter::new(out);
    add_dir_entries(&mut zip, dir, dir)?;
    zip.finish()
        .with_context(|| format!("finishing {}", output.display()))?;
    Ok(())
}

fn add_dir_entries(zip: &mut ZipWriter<File>, root: &Path, dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            add_dir_entries(zip, root, &path)?;
            continue;
        }
        if path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("zip"))
        {
            continue;
        }
        let rel = path.strip_prefix(root)?;
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        zip.start_file(name, SimpleFileOptions::default())?;
        let mut f = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
        std::io::copy(&mut f, zip)?;
    }
    Ok(())
}

/// Injects an agent key into an existing web archive. `war` may point at
/// the archive itself or at its containing directory.
pub fn inject_key_into_war(war: &Path, agent_key: &str, host: &str) -> Result<PathBuf> {
    let war_path = if war.file_name().map_or(false, |n| n == WAR_NAME) {
        war.to_path_buf()
    } else {
        war.join(WAR_NAME)
    };
    if !war_path.exists() {
        bail!("web archive not found: {}", war_path.display());
    }
    let dir = war_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let config = write_agent_config(&dir, agent_key, Some(host))?;
    add_file_to_archive(&war_path, config.path())?;
    drop(config);
    info!("copied {} to {}", ASOC_CONFIG_FILENAME, war_path.display());
    Ok(war_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn make_zip(path: &Path, entries: &[(&str, &str)]) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        for (name, content) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    fn entry_names(path: &Path) -> Vec<String> {
        let zip = ZipArchive::new(File::open(path).unwrap()).unwrap();
        zip.file_names().map(str::to_string).collect()
    }

    fn read_entry(path: &Path, name: &str) -> String {
        let mut zip = ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut entry = zip.by_name(name).unwrap();
        let mut s = String::new();
        entry.read_to_string(&mut s).unwrap();
        s
    }

    #[test]
    fn staging_dir_removed_on_drop() {
        let base = tempfile::tempdir().unwrap();
        let staging_path = base.path().join("temp");
        {
            let staging = StagingDir::create(&staging_path).unwrap();
            fs::write(staging.path().join("leftover.txt"), "x").unwrap();
            assert!(staging_path.exists());
        }
        assert!(!staging_path.exists());
    }

    #[test]
    fn secret_file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path;
        {
            let secret = write_agent_config(dir.path(), "key-1", None).unwrap();
            path = secret.path().to_path_buf();
            let written: serde_json::Value =
                serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
            assert_eq!(written["accessToken"], "key-1");
        }
        assert!(!path.exists());
    }

    #[test]
    fn extract_unpacks_all_entries() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("bundle.zip");
        make_zip(&zip_path, &[("readme.txt", "hello"), ("sub/inner.txt", "nested")]);
        let dest = dir.path().join("out");
        extract(&zip_path, &dest).unwrap();
        assert_eq!(fs::read_to_string(dest.join("readme.txt")).unwrap(), "hello");
        assert_eq!(
            fs::read_to_string(dest.join("sub/inner.txt")).unwrap(),
            "nested"
        );
    }

    #[test]
    fn add_entry_replaces_and_preserves() {
        let dir = tempfile::tempdir().unwrap();
        let war = dir.path().join(WAR_NAME);
        make_zip(&war, &[(ASOC_CONFIG_FILENAME, "stale"), ("web.xml", "<web/>")]);
        let fresh = dir.path().join(ASOC_CONFIG_FILENAME);
        fs::write(&fresh, r#"{"accessToken":"new-key"}"#).unwrap();
        add_file_to_archive(&war, &fresh).unwrap();
        let mut names = entry_names(&war);
        names.sort();
        assert_eq!(names, vec![ASOC_CONFIG_FILENAME.to_string(), "web.xml".to_string()]);
        assert_eq!(read_entry(&war, ASOC_CONFIG_FILENAME), r#"{"accessToken":"new-key"}"#);
        assert_eq!(read_entry(&war, "web.xml"), "<web/>");
    }

    #[test]
    fn pack_dir_skips_zip_files() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        fs::create_dir_all(tree.join("sub")).unwrap();
        fs::write(tree.join("a.txt"), "a").unwrap();
        fs::write(tree.join("sub/b.txt"), "b").unwrap();
        fs::write(tree.join("stale.zip"), "not really a zip").unwrap();
        let output = dir.path().join("packed.zip");
        pack_dir(&tree, &output).unwrap();
        let mut names = entry_names(&output);
        names.sort();
        assert_eq!(names, vec!["a.txt".to_string(), "sub/b.txt".to_string()]);
    }

    #[test]
    fn inject_key_accepts_directory_path() {
        let dir = tempfile::tempdir().unwrap();
        let war = dir.path().join(WAR_NAME);
        make_zip(&war, &[("web.xml", "<web/>")]);
        let injected = inject_key_into_war(dir.path(), "key-9", "https://example.test").unwrap();
        assert_eq!(injected, war);
        let config: serde_json::Value =
            serde_json::from_str(&read_entry(&war, ASOC_CONFIG_FILENAME)).unwrap();
        assert_eq!(config["accessToken"], "key-9");
        assert_eq!(config["host"], "https://example.test");
        // loose secret file is gone once embedded
        assert!(!dir.path().join(ASOC_CONFIG_FILENAME).exists());
    }

    #[test]
    fn inject_key_missing_war_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = inject_key_into_war(dir.path(), "key", "host").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
