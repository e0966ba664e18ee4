use crate::{MangadexError, Result};
use getset::{CopyGetters, Getters};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;
use url::Url;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentifierKind {
    Chapter,
    Manga,
    Group,
    User,
    List,
}

impl IdentifierKind {
    /// Maps a `mangadex.org/{segment}/...` path segment to a kind.
    fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "chapter" => Some(IdentifierKind::Chapter),
            "title" | "manga" => Some(IdentifierKind::Manga),
            "group" => Some(IdentifierKind::Group),
            "user" => Some(IdentifierKind::User),
            "list" => Some(IdentifierKind::List),
            _ => None,
        }
    }
}

impl FromStr for IdentifierKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_segment(&s.to_ascii_lowercase())
            .ok_or_else(|| format!("unknown identifier type '{s}'"))
    }
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IdentifierKind::Chapter => "chapter",
            IdentifierKind::Manga => "manga",
            IdentifierKind::Group => "group",
            IdentifierKind::User => "user",
            IdentifierKind::List => "list",
        })
    }
}

/// Something the driver can expand into chapters.
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct Identifier {
    #[getset(get_copy = "pub")]
    kind: IdentifierKind,
    #[getset(get = "pub")]
    id: String,
}

impl Identifier {
    pub fn new(kind: IdentifierKind, id: impl ToString) -> Self {
        Self {
            kind,
            id: id.to_string(),
        }
    }

    /// A bare UUID (a title unless `kind` says otherwise) or a catalog URL.
    pub fn parse(input: &str, kind: Option<IdentifierKind>) -> Result<Self> {
        let input = input.trim();
        if let Ok(uuid) = Uuid::parse_str(input) {
            return Ok(Self::new(kind.unwrap_or(IdentifierKind::Manga), uuid));
        }
        let parsed = Self::from_url(input)?;
        Ok(match kind {
            Some(kind) => Self::new(kind, parsed.id),
            None => parsed,
        })
    }

    pub fn from_url(url: &str) -> Result<Self> {
        let error = || MangadexError::UrlParseError(url.to_string());
        let parsed = Url::parse(url).map_err(|_| error())?;
        if !parsed
            .domain()
            .is_some_and(|domain| domain == "mangadex.org" || domain.ends_with(".mangadex.org"))
        {
            return Err(error());
        }
        let mut segments = parsed.path_segments().ok_or_else(error)?;
        let kind = segments
            .next()
            .and_then(IdentifierKind::from_segment)
            .ok_or_else(error)?;
        let id = segments
            .next()
            .and_then(|id| Uuid::parse_str(id).ok())
            .ok_or_else(error)?;
        Ok(Self::new(kind, id))
    }

    /// Reads `input` as a list file when such a file exists, otherwise parses it as one identifier.
    ///
    /// List files hold one identifier per line; blank lines and `#` comments are ignored.
    pub fn resolve(input: &str, kind: Option<IdentifierKind>) -> Result<Vec<Self>> {
        let path = Path::new(input);
        if !path.is_file() {
            return Ok(vec![Self::parse(input, kind)?]);
        }
        let content = fs::read_to_string(path)?;
        let identifiers = content
            .lines()
            .map(|line| line.split('#').next().unwrap_or_default().trim())
            .filter(|line| !line.is_empty())
            .map(|line| Self::parse(line, kind))
            .collect::<Result<Vec<_>>>()?;
        debug!(file = %path.display(), count = identifiers.len(), "read identifier list");
        Ok(identifiers)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    const ID: &str = "99b8eaeb-9041-4bfd-8eb7-d72addc88eb7";

    #[test]
    fn test_url_parse() {
        let title = Identifier::from_url(&format!(
            "https://mangadex.org/title/{ID}/the-cafe-terrace-and-its-goddesses"
        ))
        .unwrap();
        assert_eq!(title, Identifier::new(IdentifierKind::Manga, ID));
        let chapter = Identifier::from_url(&format!("https://mangadex.org/chapter/{ID}")).unwrap();
        assert_eq!(chapter.kind(), IdentifierKind::Chapter);
        let group = Identifier::from_url(&format!("https://mangadex.org/group/{ID}/team")).unwrap();
        assert_eq!(group.kind(), IdentifierKind::Group);

        assert!(Identifier::from_url(&format!(
            "https://mangapark.com/title/{ID}/the-cafe-terrace-and-its-goddesses"
        ))
        .is_err());
        assert!(Identifier::from_url(&format!("https://mangadex.org/author/{ID}")).is_err());
        assert!(Identifier::from_url("https://mangadex.org/title/not-a-uuid").is_err());
    }

    #[test]
    fn test_bare_uuid_and_override() {
        let id = Identifier::parse(ID, None).unwrap();
        assert_eq!(id.kind(), IdentifierKind::Manga);
        let id = Identifier::parse(ID, Some(IdentifierKind::Chapter)).unwrap();
        assert_eq!(id.kind(), IdentifierKind::Chapter);
        let id = Identifier::parse(
            &format!("https://mangadex.org/title/{ID}"),
            Some(IdentifierKind::List),
        )
        .unwrap();
        assert_eq!(id.kind(), IdentifierKind::List);
        assert_eq!(id.id(), ID);
        assert!(Identifier::parse("hello", None).is_err());
    }

    #[test]
    fn test_list_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# my list").unwrap();
        writeln!(file, "{ID}").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "https://mangadex.org/chapter/{ID}  # one chapter").unwrap();
        let ids = Identifier::resolve(file.path().to_str().unwrap(), None).unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0].kind(), IdentifierKind::Manga);
        assert_eq!(ids[1].kind(), IdentifierKind::Chapter);
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("title".parse(), Ok(IdentifierKind::Manga));
        assert_eq!("User".parse(), Ok(IdentifierKind::User));
        assert!("author".parse::<IdentifierKind>().is_err());
    }
}
