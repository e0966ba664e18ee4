use super::{ChapterExport, Exporter};
use crate::Result;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, instrument};

/// Pages stored as loose files in a per-chapter directory.
pub struct FolderExporter {
    export: ChapterExport,
    dir: PathBuf,
    pages: BTreeMap<String, u64>,
}

impl FolderExporter {
    pub fn new(export: ChapterExport) -> Result<Self> {
        let dir = export.path();
        fs::create_dir_all(&dir)?;
        let mut pages = BTreeMap::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if metadata.is_file() && metadata.len() > 0 && !name.ends_with(".part") {
                pages.insert(name, metadata.len());
            }
        }
        debug!(dir = %dir.display(), existing = pages.len(), "opened folder");
        Ok(Self { export, dir, pages })
    }
}

impl Exporter for FolderExporter {
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
        let path = self.dir.join(&name);
        let tmp = self.dir.join(format!("{name}.part"));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        self.pages.insert(name, bytes.len() as u64);
        Ok(true)
    }

    fn close(self: Box<Self>) -> Result<PathBuf> {
        Ok(self.dir)
    }

    fn discard(self: Box<Self>) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ArchiveFormat;
    use crate::export::test::export;

    #[test]
    fn test_folder_pages_and_rescan() {
        let tmpdir = tempfile::tempdir().unwrap();
        let chapter = export(tmpdir.path(), ArchiveFormat::Folder);
        let mut exporter = Box::new(FolderExporter::new(chapter).unwrap());
        assert!(exporter.add_image(1, "jpg", b"one", "a.jpg").unwrap());
        assert!(!exporter.add_image(1, "jpg", b"other", "a.jpg").unwrap());
        let page = exporter.dir.join(exporter.export.page_name(1, "jpg"));
        assert_eq!(fs::read(&page).unwrap(), b"one");

        // An empty leftover does not count as downloaded.
        fs::write(exporter.dir.join(exporter.export.page_name(2, "jpg")), b"").unwrap();
        let dir = exporter.close().unwrap();
        assert!(dir.is_dir());

        let reopened = FolderExporter::new(export(tmpdir.path(), ArchiveFormat::Folder)).unwrap();
        assert_eq!(reopened.list_pages().len(), 1);
        assert!(reopened.has_page(1));
        assert!(!reopened.has_page(2));
    }

    #[test]
    fn test_folder_discard() {
        let tmpdir = tempfile::tempdir().unwrap();
        let chapter = export(tmpdir.path(), ArchiveFormat::Folder);
        let exporter = Box::new(FolderExporter::new(chapter).unwrap());
        let dir = exporter.dir.clone();
        exporter.discard().unwrap();
        assert!(!dir.exists());
    }
}
