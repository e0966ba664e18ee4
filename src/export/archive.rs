use super::{ChapterExport, Exporter};
use crate::Result;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Pages stored in a zip container (`.zip` or `.cbz`, same content).
///
/// New pages go to a temporary sibling that starts as a copy of the existing
/// archive; `close` renames it over the original, so the archive on disk is
/// always a complete zip.
pub struct ArchiveExporter {
    export: ChapterExport,
    path: PathBuf,
    tmp_path: PathBuf,
    pages: BTreeMap<String, u64>,
    /// Whether `path` holds a readable archive whose entries must be carried over.
    carry_over: bool,
    writer: Option<ZipWriter<File>>,
}

impl ArchiveExporter {
    pub fn new(export: ChapterExport) -> Result<Self> {
        let path = export.path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".part");
        let tmp_path = PathBuf::from(tmp_name);

        let (pages, carry_over) = match read_entries(&path) {
            Ok(Some(pages)) => (pages, true),
            Ok(None) => (BTreeMap::new(), false),
            Err(e) => {
                warn!("existing archive {} is unreadable, rebuilding: {e}", path.display());
                (BTreeMap::new(), false)
            }
        };
        debug!(path = %path.display(), existing = pages.len(), "opened archive");

        Ok(Self {
            export,
            path,
            tmp_path,
            pages,
            carry_over,
            writer: None,
        })
    }

    fn start_writer(&self) -> Result<ZipWriter<File>> {
        let mut writer = ZipWriter::new(File::create(&self.tmp_path)?);
        if self.carry_over {
            let mut archive = ZipArchive::new(File::open(&self.path)?)?;
            for i in 0..archive.len() {
                let entry = archive.by_index_raw(i)?;
                // Empty entries get rewritten, so don't carry a duplicate name.
                if entry.size() == 0 {
                    continue;
                }
                writer.raw_copy_file(entry)?;
            }
        }
        Ok(writer)
    }

    fn writer(&mut self) -> Result<&mut ZipWriter<File>> {
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => self.start_writer()?,
        };
        Ok(self.writer.insert(writer))
    }
}

/// Entry names and sizes of an existing archive, `None` when there is no file.
fn read_entries(path: &Path) -> Result<Option<BTreeMap<String, u64>>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut archive = ZipArchive::new(file)?;
    let mut pages = BTreeMap::new();
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        if entry.is_file() && entry.size() > 0 {
            pages.insert(entry.name().to_string(), entry.size());
        }
    }
    Ok(Some(pages))
}

impl Exporter for ArchiveExporter {
    fn export(&self) -> &ChapterExport {
        &self.export
    }

    fn stored(&self) -> &BTreeMap<String, u64> {
        &self.pages
    }

    #[instrument(level = "trace", skip(self, bytes), fields(len = bytes.len()))]
    fn add_image(
        &mut self,
        index: usize,
        ext: &str,
        bytes: &[u8],
        orig_name: &str,
    ) -> Result<bool> {
        let name = self.export.page_name(index, ext);
        if self.pages.get(&name).is_some_and(|&size| size > 0) {
            return Ok(false);
        }
        // Pages are already compressed images.
        let options = FileOptions::default().compression_method(CompressionMethod::Stored);
        let writer = self.writer()?;
        writer.start_file(name.as_str(), options)?;
        writer.write_all(bytes)?;
        self.pages.insert(name, bytes.len() as u64);
        Ok(true)
    }

    fn close(mut self: Box<Self>) -> Result<PathBuf> {
        if let Some(mut writer) = self.writer.take() {
            writer.finish()?;
            drop(writer);
            fs::rename(&self.tmp_path, &self.path)?;
            debug!(path = %self.path.display(), pages = self.pages.len(), "archive written");
        }
        Ok(self.path)
    }

    fn discard(mut self: Box<Self>) -> Result<()> {
        drop(self.writer.take());
        for path in [&self.tmp_path, &self.path] {
            match fs::remove_file(path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ArchiveFormat;
    use crate::export::test::export;

    #[test]
    fn test_add_close_reopen() {
        let tmpdir = tempfile::tempdir().unwrap();
        let mut exporter: Box<dyn Exporter> =
            Box::new(ArchiveExporter::new(export(tmpdir.path(), ArchiveFormat::Zip)).unwrap());
        assert!(exporter.add_image(2, "png", b"two", "b.png").unwrap());
        assert!(exporter.add_image(1, "jpg", b"one", "a.jpg").unwrap());
        assert!(!exporter.add_image(1, "jpg", b"one", "a.jpg").unwrap());
        assert!(exporter.exists(1, "jpg"));
        assert!(!exporter.exists(1, "png"));
        let path = exporter.close().unwrap();
        assert!(path.to_string_lossy().ends_with(".zip"));
        assert!(!tmpdir.path().join("Some Title").read_dir().unwrap().any(|e| {
            e.unwrap().file_name().to_string_lossy().ends_with(".part")
        }));

        let mut reopened =
            Box::new(ArchiveExporter::new(export(tmpdir.path(), ArchiveFormat::Zip)).unwrap());
        assert!(reopened.exists_all_pages(&["a.jpg".to_string(), "b.png".to_string()]));
        assert!(reopened.exists_page_count(2));
        assert!(!reopened.exists_page_count(3));
        assert!(reopened.add_image(3, "jpg", b"three", "c.jpg").unwrap());
        let path = (reopened as Box<dyn Exporter>).close().unwrap();

        let archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        assert_eq!(archive.len(), 3);
    }

    #[test]
    fn test_untouched_archive_is_not_rewritten() {
        let tmpdir = tempfile::tempdir().unwrap();
        let chapter = export(tmpdir.path(), ArchiveFormat::Cbz);
        let exporter = Box::new(ArchiveExporter::new(chapter).unwrap());
        let path = exporter.close().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_discard_removes_everything() {
        let tmpdir = tempfile::tempdir().unwrap();
        let chapter = export(tmpdir.path(), ArchiveFormat::Cbz);
        let mut exporter = Box::new(ArchiveExporter::new(chapter).unwrap());
        exporter.add_image(1, "jpg", b"one", "a.jpg").unwrap();
        let path = exporter.path.clone();
        let tmp = exporter.tmp_path.clone();
        exporter.discard().unwrap();
        assert!(!path.exists());
        assert!(!tmp.exists());
    }
}
