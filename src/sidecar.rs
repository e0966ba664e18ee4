use crate::export::ChapterExport;
use crate::model::Chapter;
use crate::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const SIDECAR_FILE: &str = "info.json";

/// Notified by the engine when a chapter is complete on disk, whether it was
/// just fetched or already there.
pub trait ChapterObserver: Send + Sync {
    fn chapter_completed(&self, chapter: &Chapter, export: &ChapterExport);
}

#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitleInfo {
    pub manga: Option<String>,
    pub title: String,
    pub language: String,
    pub chapters: BTreeSet<String>,
}

/// Keeps `{title}/info.json` listing every completed chapter of the title.
#[derive(Debug, Default)]
pub struct JsonSidecar {
    lock: Mutex<()>,
}

impl JsonSidecar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(export: &ChapterExport) -> PathBuf {
        export.title_dir().join(SIDECAR_FILE)
    }

    pub fn read(path: &Path) -> Option<TitleInfo> {
        let json = fs::read(path).ok()?;
        serde_json::from_slice(&json).ok()
    }

    fn record(&self, chapter: &Chapter, export: &ChapterExport) -> Result<()> {
        let _guard = self.lock.lock();
        let path = Self::path(export);
        let mut info = Self::read(&path).unwrap_or_default();
        info.title = export.title.clone();
        info.language = chapter.language().to_string();
        if let Some(manga) = chapter.manga_id() {
            info.manga = Some(manga.to_string());
        }
        if !info.chapters.insert(chapter.id.clone()) && path.exists() {
            return Ok(());
        }
        fs::create_dir_all(export.title_dir())?;
        let tmp = path.with_extension("json.part");
        fs::write(&tmp, serde_json::to_vec_pretty(&info)?)?;
        fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), chapters = info.chapters.len(), "sidecar updated");
        Ok(())
    }
}

impl ChapterObserver for JsonSidecar {
    fn chapter_completed(&self, chapter: &Chapter, export: &ChapterExport) {
        if let Err(e) = self.record(chapter, export) {
            warn!("could not write metadata for chapter {}: {e}", chapter.id);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ArchiveFormat;
    use crate::export::test::export;
    use serde_json::json;

    fn chapter(id: &str) -> Chapter {
        serde_json::from_value(json!({
            "id": id,
            "attributes": {"chapter": "1", "translatedLanguage": "en"},
            "relationships": [{"id": "m1", "type": "manga"}]
        }))
        .unwrap()
    }

    #[test]
    fn test_sidecar_accumulates_chapters() {
        let tmpdir = tempfile::tempdir().unwrap();
        let export = export(tmpdir.path(), ArchiveFormat::Zip);
        let sidecar = JsonSidecar::new();
        sidecar.chapter_completed(&chapter("c2"), &export);
        sidecar.chapter_completed(&chapter("c1"), &export);
        sidecar.chapter_completed(&chapter("c2"), &export);

        let info = JsonSidecar::read(&JsonSidecar::path(&export)).unwrap();
        assert_eq!(info.manga.as_deref(), Some("m1"));
        assert_eq!(info.title, "Some Title");
        assert_eq!(
            info.chapters.into_iter().collect::<Vec<_>>(),
            vec!["c1".to_string(), "c2".to_string()]
        );
    }
}
