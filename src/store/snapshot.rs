//! Crash-safe snapshots of a [`MemoryStore`].
//!
//! The image is an rkyv archive behind a fixed header carrying a version,
//! the payload length and its crc32. Writes go to a temp file that is then
//! renamed over the previous snapshot.

use super::{
    BlockRow, DocumentRow, ExternalId, IdStrategy, InlineRow, MarkRow, MemoryStore, Row, Table,
};
use crc32fast::Hasher;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const SNAPSHOT_FILE: &str = "rows.snapshot";
const TEMP_FILE: &str = "rows.snapshot.tmp";
const MAGIC: &[u8; 4] = b"FKRS";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 4 + 8;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt snapshot: {0}")]
    Corrupt(&'static str),
    #[error("missing snapshot")]
    Missing,
}

#[derive(Debug, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
struct Image {
    sequential: bool,
    counters: Vec<(u8, u64)>,
    rows: Vec<ImageRow>,
}

#[derive(Debug, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
enum ImageRow {
    Block {
        id: String,
        document_id: String,
        kind: String,
        attrs: Vec<(String, String)>,
        text: String,
        order: u64,
    },
    Inline {
        id: String,
        block_id: String,
        content: String,
        order: u64,
    },
    Mark {
        id: String,
        inline_id: String,
        kind: String,
        attrs: Vec<(String, String)>,
    },
    Document {
        id: String,
        document_id: String,
        title: String,
    },
}

#[derive(Debug)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn path(&self) -> PathBuf {
        self.root.join(SNAPSHOT_FILE)
    }

    pub fn save(&self, store: &MemoryStore) -> Result<(), SnapshotError> {
        let image = to_image(store);
        let payload = rkyv::to_bytes::<rkyv::rancor::Error>(&image)
            .map_err(|_| SnapshotError::Corrupt("encode"))?;

        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&VERSION.to_le_bytes());
        bytes.extend_from_slice(&checksum_bytes(&payload).to_le_bytes());
        bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&payload);

        let temp_path = self.root.join(TEMP_FILE);
        fs::write(&temp_path, &bytes)?;
        fs::rename(&temp_path, self.path())?;
        tracing::debug!(rows = image.rows.len(), bytes = bytes.len(), "snapshot saved");
        Ok(())
    }

    pub fn load(&self) -> Result<MemoryStore, SnapshotError> {
        let bytes = match fs::read(self.path()) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(SnapshotError::Missing);
            }
            Err(err) => return Err(SnapshotError::Io(err)),
        };
        if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
            return Err(SnapshotError::Corrupt("header"));
        }
        if read_u32(&bytes[4..8]) != VERSION {
            return Err(SnapshotError::Corrupt("version"));
        }
        let checksum = read_u32(&bytes[8..12]);
        let len = u64::from_le_bytes(
            bytes[12..20]
                .try_into()
                .map_err(|_| SnapshotError::Corrupt("header"))?,
        );
        let payload = &bytes[HEADER_LEN..];
        if payload.len() as u64 != len {
            return Err(SnapshotError::Corrupt("length mismatch"));
        }
        if checksum_bytes(payload) != checksum {
            return Err(SnapshotError::Corrupt("checksum mismatch"));
        }

        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(payload.len());
        aligned.extend_from_slice(payload);
        let image = rkyv::from_bytes::<Image, rkyv::rancor::Error>(&aligned)
            .map_err(|_| SnapshotError::Corrupt("decode"))?;
        Ok(from_image(image))
    }
}

fn to_image(store: &MemoryStore) -> Image {
    let mut rows = Vec::new();
    for entries in store.tables.values() {
        for (id, row) in entries {
            let id = id.as_str().to_string();
            rows.push(match row {
                Row::Document(document) => ImageRow::Document {
                    id,
                    document_id: document.document_id.clone(),
                    title: document.title.clone(),
                },
                Row::Block(block) => ImageRow::Block {
                    id,
                    document_id: block.document_id.clone(),
                    kind: block.kind.clone(),
                    attrs: pairs(&block.attrs),
                    text: block.text.clone(),
                    order: block.order,
                },
                Row::Inline(inline) => ImageRow::Inline {
                    id,
                    block_id: inline.block_id.as_str().to_string(),
                    content: inline.content.clone(),
                    order: inline.order,
                },
                Row::Mark(mark) => ImageRow::Mark {
                    id,
                    inline_id: mark.inline_id.as_str().to_string(),
                    kind: mark.kind.clone(),
                    attrs: pairs(&mark.attrs),
                },
            });
        }
    }
    Image {
        sequential: store.strategy() == IdStrategy::Sequential,
        counters: store
            .counters()
            .iter()
            .map(|(table, counter)| (table_tag(*table), *counter))
            .collect(),
        rows,
    }
}

fn from_image(image: Image) -> MemoryStore {
    let mut tables: BTreeMap<Table, BTreeMap<ExternalId, Row>> = BTreeMap::new();
    for row in image.rows {
        let (id, row) = match row {
            ImageRow::Block {
                id,
                document_id,
                kind,
                attrs,
                text,
                order,
            } => (
                id,
                Row::Block(BlockRow {
                    document_id,
                    kind,
                    attrs: attrs.into_iter().collect(),
                    text,
                    order,
                }),
            ),
            ImageRow::Inline {
                id,
                block_id,
                content,
                order,
            } => (
                id,
                Row::Inline(InlineRow {
                    block_id: ExternalId::new(block_id),
                    content,
                    order,
                }),
            ),
            ImageRow::Document {
                id,
                document_id,
                title,
            } => (id, Row::Document(DocumentRow { document_id, title })),
            ImageRow::Mark {
                id,
                inline_id,
                kind,
                attrs,
            } => (
                id,
                Row::Mark(MarkRow {
                    inline_id: ExternalId::new(inline_id),
                    kind,
                    attrs: attrs.into_iter().collect(),
                }),
            ),
        };
        tables
            .entry(row.table())
            .or_default()
            .insert(ExternalId::new(id), row);
    }
    let counters = image
        .counters
        .into_iter()
        .filter_map(|(tag, counter)| tag_table(tag).map(|table| (table, counter)))
        .collect();
    let strategy = if image.sequential {
        IdStrategy::Sequential
    } else {
        IdStrategy::Uuid
    };
    MemoryStore::restore(strategy, tables, counters)
}

fn pairs(attrs: &BTreeMap<String, String>) -> Vec<(String, String)> {
    attrs
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn table_tag(table: Table) -> u8 {
    match table {
        Table::Blocks => 0,
        Table::Inlines => 1,
        Table::Marks => 2,
        Table::Documents => 3,
    }
}

fn tag_table(tag: u8) -> Option<Table> {
    match tag {
        0 => Some(Table::Blocks),
        1 => Some(Table::Inlines),
        2 => Some(Table::Marks),
        3 => Some(Table::Documents),
        _ => None,
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

fn checksum_bytes(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}
