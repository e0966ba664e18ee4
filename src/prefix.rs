use crate::model::Chapter;
use std::collections::{HashMap, HashSet};

pub const DEFAULT_PREFIX: char = 'c';
const FIRST_SIDE_PREFIX: u8 = b'b';

/// Volume label → one-letter chapter prefix.
///
/// Side-story volumes reuse chapter numbers of the main run; giving them their
/// own letter keeps a lexical sort of the file names chronological.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixMap(HashMap<String, char>);

impl PrefixMap {
    /// Unknown and empty volumes get the default prefix.
    pub fn prefix(&self, volume: &str) -> char {
        self.0.get(volume).copied().unwrap_or(DEFAULT_PREFIX)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Computes the prefix map from volumes in descending order, each with its chapter labels.
pub fn prefix_map(volumes: &[(String, Vec<String>)]) -> PrefixMap {
    let walk: Vec<(&str, HashSet<&str>)> = volumes
        .iter()
        .rev()
        .filter(|(volume, _)| !volume.is_empty())
        .map(|(volume, labels)| {
            let labels = labels
                .iter()
                .map(String::as_str)
                .filter(|label| !label.is_empty())
                .collect();
            (volume.as_str(), labels)
        })
        .collect();

    let mut map = HashMap::new();
    let mut next = FIRST_SIDE_PREFIX;
    for (i, (volume, labels)) in walk.iter().enumerate() {
        // Successor in walk order; the last volume only has a predecessor.
        let neighbour = walk
            .get(i + 1)
            .or_else(|| i.checked_sub(1).and_then(|j| walk.get(j)));
        let collides = neighbour.is_some_and(|(_, other)| !labels.is_disjoint(other));
        let prefix = if collides {
            let prefix = next as char;
            if next < b'z' {
                next += 1;
            }
            prefix
        } else {
            DEFAULT_PREFIX
        };
        map.insert(volume.to_string(), prefix);
    }
    PrefixMap(map)
}

/// Groups chapters by volume, keeping the order in which volumes first appear.
pub fn volume_listing<'a>(
    chapters: impl IntoIterator<Item = &'a Chapter>,
) -> Vec<(String, Vec<String>)> {
    let mut listing: Vec<(String, Vec<String>)> = Vec::new();
    for chapter in chapters {
        let volume = chapter.volume();
        match listing.iter_mut().find(|(v, _)| v == volume) {
            Some((_, labels)) => labels.push(chapter.label().to_string()),
            None => listing.push((volume.to_string(), vec![chapter.label().to_string()])),
        }
    }
    listing
}

#[cfg(test)]
mod test {
    use super::*;

    fn volumes(listing: &[(&str, &[&str])]) -> Vec<(String, Vec<String>)> {
        listing
            .iter()
            .map(|(v, labels)| (v.to_string(), labels.iter().map(|l| l.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_side_story_gets_b() {
        let input = volumes(&[
            ("2", &["10", "9"]),
            ("1", &["5", "4"]),
            ("SP", &["5"]),
            ("0", &["1"]),
        ]);
        let map = prefix_map(&input);
        assert_eq!(map.prefix("2"), 'c');
        assert_eq!(map.prefix("1"), 'c');
        assert_eq!(map.prefix("SP"), 'b');
        assert_eq!(map.prefix("0"), 'c');
        assert_eq!(map.len(), 4);
    }

    #[test]
    fn test_pure_and_default() {
        let input = volumes(&[("3", &["3"]), ("2", &["2"]), ("", &["2"]), ("1", &["1"])]);
        let first = prefix_map(&input);
        assert_eq!(first, prefix_map(&input));
        assert!(["3", "2", "1"].iter().all(|v| first.prefix(v) == 'c'));
        assert_eq!(first.prefix(""), 'c');
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn test_collisions_advance_letter() {
        let input = volumes(&[("B", &["1"]), ("A", &["1"]), ("1", &["1"])]);
        let map = prefix_map(&input);
        // Walk order: 1, A, B.
        assert_eq!(map.prefix("1"), 'b');
        assert_eq!(map.prefix("A"), 'c');
        assert_eq!(map.prefix("B"), 'd');
    }

    #[test]
    fn test_volume_listing_keeps_first_appearance() {
        let chapter = |v: &str, c: &str| -> Chapter {
            serde_json::from_value(serde_json::json!({
                "id": format!("{v}-{c}"),
                "attributes": {"volume": v, "chapter": c, "translatedLanguage": "en"}
            }))
            .unwrap()
        };
        let chapters = vec![chapter("2", "4"), chapter("1", "2"), chapter("2", "3")];
        let listing = volume_listing(&chapters);
        assert_eq!(listing[0], ("2".to_string(), vec!["4".to_string(), "3".to_string()]));
        assert_eq!(listing[1].0, "1");
    }
}
