//! Legacy sync manifest
//!
//! Before the CRDT document, devices exchanged one JSON manifest holding the
//! whole library and merged it field by field. The manifest is still used by
//! the legacy file-store provider and by export/import, so this module
//! converts between the shared document and the manifest and implements the
//! field-level merge.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::containers::{names, ContainerRegistry};
use crate::document::{DocumentError, SharedDocument};
use crate::models::{
    now_ms, Annotation, BookSummary, LexiconRule, ReadingListEntry, ReadingProgress, Record,
    TtsPosition,
};

/// Manifest format version
pub const MANIFEST_VERSION: u32 = 1;

/// Key of the TTS position map inside a device's preferences container
pub const TTS_POSITIONS_KEY: &str = "ttsPositions";

/// The full legacy manifest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncManifest {
    pub version: u32,
    pub last_updated: i64,
    pub device_id: String,
    #[serde(default)]
    pub books: BTreeMap<String, BookEntry>,
    #[serde(default)]
    pub lexicon: Vec<LexiconRule>,
    #[serde(default)]
    pub reading_list: BTreeMap<String, ReadingListEntry>,
    #[serde(default)]
    pub transient_state: TransientState,
    #[serde(default)]
    pub device_registry: BTreeMap<String, Value>,
}

/// One book with its reading history and annotations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BookEntry {
    pub metadata: BookSummary,
    #[serde(default)]
    pub history: ReadingHistory,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReadingHistory {
    /// Union of read CFI ranges across devices
    #[serde(default)]
    pub read_ranges: Vec<String>,
    /// Progress keyed by device id
    #[serde(default)]
    pub progress: BTreeMap<String, ReadingProgress>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TransientState {
    #[serde(default)]
    pub tts_positions: BTreeMap<String, TtsPosition>,
}

impl SyncManifest {
    /// Build a manifest from the current document state
    pub fn from_document(doc: &SharedDocument, device_id: &str) -> Result<Self, DocumentError> {
        let mut books: BTreeMap<String, BookEntry> = doc
            .records::<BookSummary>()?
            .into_iter()
            .map(|metadata| {
                (
                    metadata.id.clone(),
                    BookEntry {
                        metadata,
                        history: ReadingHistory::default(),
                        annotations: Vec::new(),
                    },
                )
            })
            .collect();

        for (book_id, per_device) in doc.entries(names::PROGRESS)? {
            let Some(entry) = books.get_mut(&book_id) else {
                debug!(book_id = %book_id, "Skipping progress for unknown book");
                continue;
            };
            let Value::Object(devices) = per_device else {
                continue;
            };
            for (device, value) in devices {
                match serde_json::from_value::<ReadingProgress>(value) {
                    Ok(progress) => {
                        entry.history.read_ranges.extend(progress.read_ranges.iter().cloned());
                        entry.history.progress.insert(device, progress);
                    }
                    Err(e) => warn!(book_id = %book_id, device = %device, "Skipping invalid progress: {}", e),
                }
            }
            dedup_sorted(&mut entry.history.read_ranges);
        }

        for annotation in doc.records::<Annotation>()? {
            match books.get_mut(&annotation.book_id) {
                Some(entry) => entry.annotations.push(annotation),
                None => debug!(id = %annotation.id, "Skipping annotation for unknown book"),
            }
        }

        let mut lexicon = doc.records::<LexiconRule>()?;
        lexicon.sort_by_key(|rule| (rule.order.unwrap_or(i64::MAX), rule.created));

        let reading_list = doc
            .records::<ReadingListEntry>()?
            .into_iter()
            .map(|entry| (entry.filename.clone(), entry))
            .collect();

        let mut tts_positions = BTreeMap::new();
        let prefs = ContainerRegistry::preferences_for(device_id);
        if let Some(Value::Object(positions)) = doc.get(&prefs, TTS_POSITIONS_KEY)? {
            for (book_id, value) in positions {
                if let Ok(position) = serde_json::from_value::<TtsPosition>(value) {
                    tts_positions.insert(book_id, position);
                }
            }
        }

        let mut device_registry = BTreeMap::new();
        device_registry.insert(device_id.to_string(), json!({ "lastSeen": now_ms() }));

        Ok(Self {
            version: MANIFEST_VERSION,
            last_updated: now_ms(),
            device_id: device_id.to_string(),
            books,
            lexicon,
            reading_list,
            transient_state: TransientState { tts_positions },
            device_registry,
        })
    }

    /// Write the manifest's content into the document in one transaction
    ///
    /// Existing entries not mentioned in the manifest are left alone.
    pub fn apply_to(&self, doc: &mut SharedDocument, device_id: &str) -> Result<(), DocumentError> {
        let prefs = ContainerRegistry::preferences_for(device_id);

        doc.transact(|tx| {
            for entry in self.books.values() {
                tx.put_record(&entry.metadata)?;
                for (device, progress) in &entry.history.progress {
                    tx.set_field(
                        names::PROGRESS,
                        &entry.metadata.id,
                        device,
                        &serde_json::to_value(progress)?,
                    )?;
                }
                for annotation in &entry.annotations {
                    tx.put_record(annotation)?;
                }
            }
            for rule in &self.lexicon {
                tx.put_record(rule)?;
            }
            for entry in self.reading_list.values() {
                tx.put_record(entry)?;
            }
            for (book_id, position) in &self.transient_state.tts_positions {
                tx.set_field(&prefs, TTS_POSITIONS_KEY, book_id, &serde_json::to_value(position)?)?;
            }
            Ok(())
        })
    }
}

/// Field-level merge of two manifests
///
/// Newer data wins per record; collections are unioned. Ties keep `local`.
pub fn merge_manifests(local: &SyncManifest, remote: &SyncManifest) -> SyncManifest {
    let mut merged = local.clone();
    merged.version = local.version.max(remote.version);
    merged.last_updated = local.last_updated.max(remote.last_updated);

    for (id, remote_book) in &remote.books {
        match merged.books.get_mut(id) {
            Some(book) => merge_book(book, remote_book),
            None => {
                merged.books.insert(id.clone(), remote_book.clone());
            }
        }
    }

    let mut rules: BTreeMap<String, LexiconRule> =
        merged.lexicon.drain(..).map(|rule| (rule.key(), rule)).collect();
    for rule in &remote.lexicon {
        keep_newer(&mut rules, rule.key(), rule, |r| r.created);
    }
    merged.lexicon = rules.into_values().collect();
    merged
        .lexicon
        .sort_by_key(|rule| (rule.order.unwrap_or(i64::MAX), rule.created));

    for (filename, entry) in &remote.reading_list {
        keep_newer(&mut merged.reading_list, filename.clone(), entry, |e| e.last_updated);
    }

    for (book_id, position) in &remote.transient_state.tts_positions {
        keep_newer(
            &mut merged.transient_state.tts_positions,
            book_id.clone(),
            position,
            |p| p.updated_at,
        );
    }

    for (device, info) in &remote.device_registry {
        merged
            .device_registry
            .entry(device.clone())
            .or_insert_with(|| info.clone());
    }

    merged
}

fn merge_book(local: &mut BookEntry, remote: &BookEntry) {
    if remote.metadata.activity() > local.metadata.activity() {
        local.metadata = remote.metadata.clone();
    }

    local
        .history
        .read_ranges
        .extend(remote.history.read_ranges.iter().cloned());
    dedup_sorted(&mut local.history.read_ranges);

    for (device, progress) in &remote.history.progress {
        keep_newer(&mut local.history.progress, device.clone(), progress, |p| p.updated_at);
    }

    let known: BTreeSet<String> = local.annotations.iter().map(|a| a.id.clone()).collect();
    local.annotations.extend(
        remote
            .annotations
            .iter()
            .filter(|a| !known.contains(&a.id))
            .cloned(),
    );
}

fn keep_newer<T: Clone>(map: &mut BTreeMap<String, T>, key: String, candidate: &T, stamp: impl Fn(&T) -> i64) {
    match map.get(&key) {
        Some(existing) if stamp(existing) >= stamp(candidate) => {}
        _ => {
            map.insert(key, candidate.clone());
        }
    }
}

fn dedup_sorted(items: &mut Vec<String>) {
    items.sort();
    items.dedup();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book(id: &str, title: &str, added_at: i64) -> BookSummary {
        let mut book = BookSummary::new(id, title);
        book.added_at = added_at;
        book
    }

    fn manifest_with(books: Vec<BookSummary>) -> SyncManifest {
        SyncManifest {
            version: MANIFEST_VERSION,
            last_updated: 0,
            device_id: "dev".to_string(),
            books: books
                .into_iter()
                .map(|b| {
                    (
                        b.id.clone(),
                        BookEntry {
                            metadata: b,
                            history: ReadingHistory::default(),
                            annotations: Vec::new(),
                        },
                    )
                })
                .collect(),
            ..SyncManifest::default()
        }
    }

    #[test]
    fn test_manifest_json_shape() {
        let manifest = manifest_with(vec![book("b1", "Moby Dick", 1)]);
        let value = serde_json::to_value(&manifest).unwrap();

        for key in [
            "version",
            "lastUpdated",
            "deviceId",
            "books",
            "lexicon",
            "readingList",
            "transientState",
            "deviceRegistry",
        ] {
            assert!(value.get(key).is_some(), "missing {}", key);
        }
        assert!(value["transientState"].get("ttsPositions").is_some());
        assert_eq!(value["books"]["b1"]["metadata"]["title"], "Moby Dick");
    }

    #[test]
    fn test_merge_unions_books() {
        let local = manifest_with(vec![book("a", "Alpha", 1)]);
        let remote = manifest_with(vec![book("b", "Beta", 1)]);

        let merged = merge_manifests(&local, &remote);
        assert_eq!(merged.books.len(), 2);
    }

    #[test]
    fn test_merge_newer_metadata_wins() {
        let local = manifest_with(vec![book("a", "Old Title", 1)]);
        let mut newer = book("a", "New Title", 1);
        newer.last_read = Some(100);
        let remote = manifest_with(vec![newer]);

        assert_eq!(merge_manifests(&local, &remote).books["a"].metadata.title, "New Title");
        assert_eq!(merge_manifests(&remote, &local).books["a"].metadata.title, "New Title");
    }

    #[test]
    fn test_merge_history_and_annotations() {
        let mut local = manifest_with(vec![book("a", "A", 1)]);
        let mut remote = local.clone();

        let shared = Annotation::new("a", "epubcfi(/6/2)", "call me");
        local.books.get_mut("a").unwrap().annotations.push(shared.clone());
        local.books.get_mut("a").unwrap().history.read_ranges = vec!["r1".into(), "r2".into()];

        let remote_entry = remote.books.get_mut("a").unwrap();
        remote_entry.annotations.push(shared);
        remote_entry.annotations.push(Annotation::new("a", "epubcfi(/6/8)", "ishmael"));
        remote_entry.history.read_ranges = vec!["r2".into(), "r3".into()];
        let mut progress = ReadingProgress::new("a", "phone", 0.4);
        progress.updated_at = 10;
        remote_entry.history.progress.insert("phone".into(), progress);

        let merged = merge_manifests(&local, &remote);
        let entry = &merged.books["a"];
        assert_eq!(entry.annotations.len(), 2);
        assert_eq!(entry.history.read_ranges, vec!["r1", "r2", "r3"]);
        assert_eq!(entry.history.progress["phone"].percentage, 0.4);
    }

    #[test]
    fn test_merge_lexicon_and_reading_list() {
        let mut local = SyncManifest::default();
        let mut remote = SyncManifest::default();

        let mut rule = LexiconRule::new("colour", "color");
        rule.created = 1;
        let mut updated = rule.clone();
        updated.replacement = "kuh-ler".to_string();
        updated.created = 2;
        local.lexicon.push(rule);
        remote.lexicon.push(updated);
        remote.lexicon.push(LexiconRule::new("Hermione", "Her-my-oh-nee"));

        let mut entry = ReadingListEntry::new("moby.epub", "Moby Dick");
        entry.last_updated = 5;
        let mut newer_entry = entry.clone();
        newer_entry.percentage = 0.9;
        newer_entry.last_updated = 6;
        local.reading_list.insert("moby.epub".into(), newer_entry);
        remote.reading_list.insert("moby.epub".into(), entry);

        let merged = merge_manifests(&local, &remote);
        assert_eq!(merged.lexicon.len(), 2);
        assert!(merged.lexicon.iter().any(|r| r.replacement == "kuh-ler"));
        assert_eq!(merged.reading_list["moby.epub"].percentage, 0.9);
    }

    #[test]
    fn test_document_round_trip() {
        let mut doc = SharedDocument::new();
        let moby = BookSummary::new("moby", "Moby Dick");
        let note = Annotation::new("moby", "epubcfi(/6/2)", "Call me Ishmael");
        let rule = LexiconRule::new("Ishmael", "ish-may-el");
        let mut progress = ReadingProgress::new("moby", "dev-a", 0.25);
        progress.read_ranges = vec!["epubcfi(/6/2,/1:0,/1:10)".into()];

        doc.transact(|tx| {
            tx.put_record(&moby)?;
            tx.put_record(&note)?;
            tx.put_record(&rule)?;
            tx.set_field("progress", "moby", "dev-a", &serde_json::to_value(&progress)?)?;
            tx.set_field(
                "preferences/dev-a",
                TTS_POSITIONS_KEY,
                "moby",
                &json!({ "bookId": "moby", "queueIndex": 3, "updatedAt": 7 }),
            )
        })
        .unwrap();

        let manifest = SyncManifest::from_document(&doc, "dev-a").unwrap();
        assert_eq!(manifest.books["moby"].metadata, moby);
        assert_eq!(manifest.books["moby"].annotations, vec![note.clone()]);
        assert_eq!(manifest.books["moby"].history.read_ranges.len(), 1);
        assert_eq!(manifest.lexicon, vec![rule.clone()]);
        assert_eq!(manifest.transient_state.tts_positions["moby"].queue_index, 3);
        assert!(manifest.device_registry.contains_key("dev-a"));

        let mut fresh = SharedDocument::new();
        manifest.apply_to(&mut fresh, "dev-a").unwrap();
        assert_eq!(fresh.get_record::<BookSummary>("moby").unwrap(), Some(moby));
        assert_eq!(fresh.get_record::<Annotation>(&note.id).unwrap(), Some(note));
        assert_eq!(fresh.get_record::<LexiconRule>(&rule.id).unwrap(), Some(rule));
        assert_eq!(
            SyncManifest::from_document(&fresh, "dev-a").unwrap().books,
            manifest.books
        );
    }
}
