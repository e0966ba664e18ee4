mod archive;
mod folder;

pub use archive::ArchiveExporter;
pub use folder::FolderExporter;

use crate::config::{ArchiveFormat, RunConfig};
use crate::model::Chapter;
use crate::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

static NUMERIC_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)(\.\d+)?$").expect("valid label pattern"));

const ILLEGAL_CHARS: [char; 9] = ['\\', '/', ':', '*', '?', '"', '<', '>', '|'];
const DEFAULT_EXTENSION: &str = "jpg";

/// Replaces characters that are not allowed in file names with `_`.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if ILLEGAL_CHARS.contains(&c) { '_' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

/// `"5"` → `"005"`, `"5.2"` → `"005.2"`; anything non-numeric is kept as is.
pub fn pad_chapter(label: &str) -> String {
    pad_numeric(label, 3)
}

/// Two-digit padding for numeric volume labels.
pub fn pad_volume(label: &str) -> String {
    pad_numeric(label, 2)
}

fn pad_numeric(label: &str, width: usize) -> String {
    match NUMERIC_LABEL.captures(label) {
        Some(caps) => format!(
            "{:0>width$}{}",
            &caps[1],
            caps.get(2).map_or("", |m| m.as_str()),
        ),
        None => label.to_string(),
    }
}

/// Extension of a page file name, `jpg` when it has none.
pub fn extension_of(filename: &str) -> &str {
    let name = filename.split(['?', '#']).next().unwrap_or(filename);
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .unwrap_or(DEFAULT_EXTENSION)
}

/// Everything needed to name one chapter's artifact and its pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterExport {
    pub title: String,
    pub volume: String,
    pub chapter: String,
    pub prefix: char,
    pub language: String,
    pub default_language: String,
    pub groups: Vec<String>,
    pub root: PathBuf,
    pub format: ArchiveFormat,
}

impl ChapterExport {
    pub fn new(
        chapter: &Chapter,
        title: &str,
        prefix: char,
        groups: Vec<String>,
        config: &RunConfig,
    ) -> Self {
        Self {
            title: sanitize(title),
            volume: chapter.volume().to_string(),
            chapter: chapter.label().to_string(),
            prefix,
            language: chapter.language().to_string(),
            default_language: config.default_language().clone(),
            groups,
            root: config.download_root().clone(),
            format: config.format(),
        }
    }

    fn head(&self) -> String {
        let mut head = self.title.clone();
        if !self.language.is_empty() && self.language != self.default_language {
            head.push_str(&format!(" [{}]", self.language));
        }
        head.push_str(&format!(" - {}{}", self.prefix, pad_chapter(&self.chapter)));
        if !self.volume.is_empty() {
            head.push_str(&format!(" (v{})", pad_volume(&self.volume)));
        }
        head
    }

    fn group_suffix(&self) -> String {
        if self.groups.is_empty() {
            return String::new();
        }
        format!(" [{}]", sanitize(&self.groups.join(", ")))
    }

    /// `"{title} [{L}] - {P}{C} (v{V}) [{G}]"`
    pub fn base_name(&self) -> String {
        format!("{}{}", self.head(), self.group_suffix())
    }

    /// Page name without its extension; `index` starts at 1.
    pub fn page_stem(&self, index: usize) -> String {
        format!("{} - p{:03}{}", self.head(), index, self.group_suffix())
    }

    pub fn page_name(&self, index: usize, ext: &str) -> String {
        format!("{}.{}", self.page_stem(index), ext)
    }

    /// Directory holding every chapter of the title.
    pub fn title_dir(&self) -> PathBuf {
        self.root.join(&self.title)
    }

    /// Archive file or chapter folder.
    pub fn path(&self) -> PathBuf {
        let base = self.base_name();
        let name = match self.format.extension() {
            Some(ext) => format!("{base}.{ext}"),
            None => base,
        };
        self.title_dir().join(name)
    }
}

/// Per-chapter page sink. Archive and folder flavours share only the naming.
///
/// Pages are keyed by canonical name; storing a name that is already present
/// with a non-empty body is a no-op, so re-running a chapter is safe.
pub trait Exporter: Send {
    fn export(&self) -> &ChapterExport;

    /// Canonical page names currently stored, with their sizes.
    fn stored(&self) -> &BTreeMap<String, u64>;

    /// Returns `false` when the page was already present.
    fn add_image(&mut self, index: usize, ext: &str, bytes: &[u8], orig_name: &str) -> Result<bool>;

    /// Finalizes the artifact and returns its path.
    fn close(self: Box<Self>) -> Result<PathBuf>;

    /// Removes the artifact entirely.
    fn discard(self: Box<Self>) -> Result<()>;

    fn exists(&self, index: usize, ext: &str) -> bool {
        let name = self.export().page_name(index, ext);
        self.stored().get(&name).is_some_and(|&size| size > 0)
    }

    /// Like [`Exporter::exists`] but for any extension.
    fn has_page(&self, index: usize) -> bool {
        let stem = self.export().page_stem(index);
        self.stored().iter().any(|(name, &size)| {
            size > 0 && name.rsplit_once('.').is_some_and(|(s, _)| s == stem)
        })
    }

    fn list_pages(&self) -> BTreeSet<String> {
        self.stored()
            .iter()
            .filter(|(_, &size)| size > 0)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// True when every manifest page is stored under its canonical name.
    fn exists_all_pages(&self, filenames: &[String]) -> bool {
        filenames
            .iter()
            .enumerate()
            .all(|(i, name)| self.exists(i + 1, extension_of(name)))
    }

    /// Pre-flight check when only the page count is known.
    fn exists_page_count(&self, count: usize) -> bool {
        count > 0 && (1..=count).all(|index| self.has_page(index))
    }
}

/// Opens the exporter matching the export's format, picking up what is already on disk.
pub fn open(export: ChapterExport) -> Result<Box<dyn Exporter>> {
    Ok(match export.format {
        ArchiveFormat::Folder => Box::new(FolderExporter::new(export)?),
        ArchiveFormat::Zip | ArchiveFormat::Cbz => Box::new(ArchiveExporter::new(export)?),
    })
}
