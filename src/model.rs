use crate::config::Quality;
use getset::Getters;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<serde_json::Value>,
}

impl Relationship {
    /// Name carried by an expanded relationship (`includes[]=...`).
    pub fn name(&self) -> Option<&str> {
        self.attributes.as_ref()?.get("name")?.as_str()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MangaAttributes {
    pub title: HashMap<String, String>,
    #[serde(default)]
    pub alt_titles: Vec<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manga {
    pub id: String,
    pub attributes: MangaAttributes,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

impl Manga {
    /// Primary title, falling back to `en` and then to whatever the catalog has.
    pub fn title(&self, language: &str) -> String {
        let titles = &self.attributes.title;
        titles
            .get(language)
            .or_else(|| titles.get("en"))
            .or_else(|| self.alt_title(language))
            .or_else(|| titles.values().next())
            .cloned()
            .unwrap_or_else(|| self.id.clone())
    }

    pub fn alt_title(&self, language: &str) -> Option<&String> {
        self.attributes
            .alt_titles
            .iter()
            .find_map(|titles| titles.get(language))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterAttributes {
    #[serde(default)]
    pub volume: Option<String>,
    #[serde(default)]
    pub chapter: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    pub translated_language: String,
    #[serde(default)]
    pub external_url: Option<String>,
    #[serde(default)]
    pub pages: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub id: String,
    pub attributes: ChapterAttributes,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

impl Chapter {
    pub fn volume(&self) -> &str {
        self.attributes.volume.as_deref().unwrap_or_default()
    }

    pub fn label(&self) -> &str {
        self.attributes.chapter.as_deref().unwrap_or_default()
    }

    pub fn title(&self) -> &str {
        self.attributes.title.as_deref().unwrap_or_default()
    }

    pub fn language(&self) -> &str {
        &self.attributes.translated_language
    }

    pub fn external_url(&self) -> Option<&str> {
        self.attributes
            .external_url
            .as_deref()
            .filter(|url| !url.is_empty())
    }

    pub fn pages(&self) -> u32 {
        self.attributes.pages
    }

    pub fn manga_id(&self) -> Option<&str> {
        self.related("manga").next().map(|r| r.id.as_str())
    }

    pub fn uploader_id(&self) -> Option<&str> {
        self.related("user").next().map(|r| r.id.as_str())
    }

    pub fn groups(&self) -> impl Iterator<Item = &Relationship> {
        self.related("scanlation_group")
    }

    fn related<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Relationship> {
        self.relationships.iter().filter(move |r| r.kind == kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct ScanlatorGroup {
    id: String,
    name: String,
}

impl ScanlatorGroup {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

impl<'de> Deserialize<'de> for ScanlatorGroup {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            id: String,
            attributes: RawAttributes,
        }

        #[derive(Deserialize)]
        struct RawAttributes {
            name: String,
        }

        let raw = Raw::deserialize(deserializer)?;
        Ok(ScanlatorGroup::new(raw.id, raw.attributes.name))
    }
}

/// Same `{id, attributes: {name}}` shape the catalog sends, so cached groups read back.
impl Serialize for ScanlatorGroup {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        #[derive(Serialize)]
        struct Raw<'a> {
            id: &'a str,
            attributes: RawAttributes<'a>,
        }

        #[derive(Serialize)]
        struct RawAttributes<'a> {
            name: &'a str,
        }

        Raw {
            id: &self.id,
            attributes: RawAttributes { name: &self.name },
        }
        .serialize(serializer)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverAttributes {
    #[serde(default)]
    pub volume: Option<String>,
    pub file_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cover {
    pub id: String,
    pub attributes: CoverAttributes,
}

/// Routing record handed out by `/at-home/server/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
#[serde(rename_all = "camelCase")]
#[getset(get = "pub")]
pub struct AtHomeManifest {
    base_url: String,
    chapter: AtHomeChapter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtHomeChapter {
    hash: String,
    data: Vec<String>,
    data_saver: Vec<String>,
}

impl AtHomeManifest {
    pub fn new(
        base_url: impl Into<String>,
        hash: impl Into<String>,
        data: Vec<String>,
        data_saver: Vec<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            chapter: AtHomeChapter {
                hash: hash.into(),
                data,
                data_saver,
            },
        }
    }

    pub fn hash(&self) -> &str {
        &self.chapter.hash
    }

    pub fn pages(&self, quality: Quality) -> &[String] {
        match quality {
            Quality::Data => &self.chapter.data,
            Quality::DataSaver => &self.chapter.data_saver,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct EntityResponse<T> {
    pub(crate) data: T,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CollectionResponse<T> {
    pub(crate) data: Vec<T>,
    #[serde(default)]
    pub(crate) total: u32,
}
