//! Automerge-backed notebook document shared between relay and peers.
//!
//! Wraps an Automerge `AutoCommit` document with index-addressed accessors
//! for notebook cells. The room host holds the canonical copy; the relay and
//! every other editor hold replicas that converge via the Automerge sync
//! protocol.
//!
//! ## Document schema
//!
//! ```text
//! ROOT/
//!   notebook_id: Str
//!   cells/                        ← List of Map
//!     [i]/
//!       id: Str                   ← cell UUID
//!       cell_type: Str            ← "code" | "markdown" | "raw"
//!       source: Text              ← Automerge Text CRDT
//!       execution_count: Str      ← JSON-encoded i64 or "null"
//!       outputs/                  ← List of Str, code cells only
//!         [j]: Str                ← JSON-encoded nbformat output
//! ```

use std::path::Path;

use automerge::sync;
use automerge::sync::SyncDoc;
use automerge::transaction::Transactable;
use automerge::{AutoCommit, AutomergeError, ObjId, ObjType, ReadDoc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

/// Snapshot of a single cell's state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CellSnapshot {
    pub id: String,
    /// "code", "markdown", or "raw"
    pub cell_type: String,
    pub source: String,
    /// JSON-encoded execution count: a number string like "5" or "null"
    pub execution_count: String,
    /// JSON-encoded outputs; `None` when the cell has no output list
    pub outputs: Option<Vec<String>>,
}

/// Wrapper around an Automerge document storing a notebook.
pub struct NotebookDoc {
    doc: AutoCommit,
}

impl NotebookDoc {
    /// Create a new empty notebook document with the given ID.
    pub fn new(notebook_id: &str) -> Self {
        let mut doc = AutoCommit::new();
        let _ = doc.put(automerge::ROOT, "notebook_id", notebook_id);
        let _ = doc.put_object(automerge::ROOT, "cells", ObjType::List);
        Self { doc }
    }

    /// An empty replica that receives its content through sync.
    pub fn replica() -> Self {
        Self {
            doc: AutoCommit::new(),
        }
    }

    /// Load a notebook document from saved bytes.
    pub fn load(data: &[u8]) -> Result<Self, AutomergeError> {
        let doc = AutoCommit::load(data)?;
        Ok(Self { doc })
    }

    /// Load the room document saved at `path`, or start a fresh one.
    ///
    /// A file that cannot be read or decoded is moved aside to
    /// `*.automerge.corrupt` so the next save does not overwrite it.
    pub fn load_or_create(path: &Path, notebook_id: &str) -> Self {
        if !path.exists() {
            info!(
                "[notebook-doc] No saved room for {} at {:?}, starting empty",
                notebook_id, path
            );
            return Self::new(notebook_id);
        }

        let loaded = std::fs::read(path)
            .map_err(|e| e.to_string())
            .and_then(|data| AutoCommit::load(&data).map_err(|e| e.to_string()));
        match loaded {
            Ok(doc) => {
                info!("[notebook-doc] Loaded room {} from {:?}", notebook_id, path);
                Self { doc }
            }
            Err(reason) => {
                warn!(
                    "[notebook-doc] Unusable room file {:?} for {}: {}",
                    path, notebook_id, reason
                );
                Self::set_aside(path);
                Self::new(notebook_id)
            }
        }
    }

    fn set_aside(path: &Path) {
        let corrupt_path = path.with_extension("automerge.corrupt");
        match std::fs::rename(path, &corrupt_path) {
            Ok(()) => warn!("[notebook-doc] Kept unusable room file at {:?}", corrupt_path),
            Err(e) => warn!(
                "[notebook-doc] Could not move {:?} aside: {}",
                path, e
            ),
        }
    }

    /// Serialize the document to bytes.
    pub fn save(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    /// Save the document to a file.
    pub fn save_to_file(&mut self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = self.save();
        std::fs::write(path, data)
    }

    pub fn notebook_id(&self) -> Option<String> {
        read_str(&self.doc, automerge::ROOT, "notebook_id")
    }

    // ── Cells ───────────────────────────────────────────────────────

    /// Number of cells in the notebook.
    pub fn cell_count(&self) -> usize {
        self.cells_list_id()
            .map_or(0, |cells_id| self.doc.length(&cells_id))
    }

    /// Get all cells as snapshots, in order.
    pub fn get_cells(&self) -> Vec<CellSnapshot> {
        (0..self.cell_count())
            .filter_map(|index| self.get_cell(index))
            .collect()
    }

    /// Get the cell at `index`.
    pub fn get_cell(&self, index: usize) -> Option<CellSnapshot> {
        let cell_obj = self.cell_obj(index)?;
        self.read_cell(&cell_obj)
    }

    /// Outputs of the cell at `index`; `None` if the cell or its list is missing.
    pub fn cell_outputs(&self, index: usize) -> Option<Vec<String>> {
        let cell_obj = self.cell_obj(index)?;
        self.read_outputs(&cell_obj)
    }

    /// Insert a new cell at `index` (clamped to the list length).
    ///
    /// Code cells get an empty output list; other cell types get none.
    pub fn insert_cell(
        &mut self,
        index: usize,
        cell_id: &str,
        cell_type: &str,
        source: &str,
    ) -> Result<(), AutomergeError> {
        let cells_id = match self.cells_list_id() {
            Some(id) => id,
            None => self
                .doc
                .put_object(automerge::ROOT, "cells", ObjType::List)?,
        };

        let index = index.min(self.doc.length(&cells_id));

        let cell_map = self.doc.insert_object(&cells_id, index, ObjType::Map)?;
        self.doc.put(&cell_map, "id", cell_id)?;
        self.doc.put(&cell_map, "cell_type", cell_type)?;
        let source_id = self.doc.put_object(&cell_map, "source", ObjType::Text)?;
        if !source.is_empty() {
            self.doc.update_text(&source_id, source)?;
        }
        self.doc.put(&cell_map, "execution_count", "null")?;
        if cell_type == "code" {
            self.doc.put_object(&cell_map, "outputs", ObjType::List)?;
        }
        Ok(())
    }

    /// Delete the cell at `index`. Returns `false` if there is no such cell.
    pub fn delete_cell(&mut self, index: usize) -> Result<bool, AutomergeError> {
        match self.cells_list_id() {
            Some(cells_id) if index < self.doc.length(&cells_id) => {
                self.doc.delete(&cells_id, index)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Replace a cell's source text.
    ///
    /// `update_text` diffs internally, so concurrent edits from other peers
    /// merge at character granularity.
    pub fn update_source(&mut self, index: usize, new_source: &str) -> Result<bool, AutomergeError> {
        let Some(cell_obj) = self.cell_obj(index) else {
            return Ok(false);
        };
        let source_id = match self.typed_child(&cell_obj, "source", ObjType::Text) {
            Some(id) => id,
            None => self.doc.put_object(&cell_obj, "source", ObjType::Text)?,
        };
        self.doc.update_text(&source_id, new_source)?;
        Ok(true)
    }

    // ── Outputs ─────────────────────────────────────────────────────

    /// Replace all outputs for a cell, creating the list if needed.
    pub fn set_outputs(&mut self, index: usize, outputs: &[String]) -> Result<bool, AutomergeError> {
        let Some(cell_obj) = self.cell_obj(index) else {
            return Ok(false);
        };

        let _ = self.doc.delete(&cell_obj, "outputs");
        let list_id = self.doc.put_object(&cell_obj, "outputs", ObjType::List)?;
        for (i, output) in outputs.iter().enumerate() {
            self.doc.insert(&list_id, i, output.as_str())?;
        }
        Ok(true)
    }

    /// Append a single output to a cell's output list.
    pub fn append_output(&mut self, index: usize, output: &str) -> Result<bool, AutomergeError> {
        let Some(cell_obj) = self.cell_obj(index) else {
            return Ok(false);
        };
        let outputs_id = match self.typed_child(&cell_obj, "outputs", ObjType::List) {
            Some(id) => id,
            None => self.doc.put_object(&cell_obj, "outputs", ObjType::List)?,
        };

        let len = self.doc.length(&outputs_id);
        self.doc.insert(&outputs_id, len, output)?;
        Ok(true)
    }

    pub fn clear_outputs(&mut self, index: usize) -> Result<bool, AutomergeError> {
        self.set_outputs(index, &[])
    }

    /// Set the execution count for a cell. Pass "null" or a number string like "5".
    pub fn set_execution_count(&mut self, index: usize, count: &str) -> Result<bool, AutomergeError> {
        let Some(cell_obj) = self.cell_obj(index) else {
            return Ok(false);
        };
        self.doc.put(&cell_obj, "execution_count", count)?;
        Ok(true)
    }

    // ── Sync protocol ───────────────────────────────────────────────

    /// Generate a sync message to send to a peer.
    pub fn generate_sync_message(&mut self, peer_state: &mut sync::State) -> Option<sync::Message> {
        self.doc.sync().generate_sync_message(peer_state)
    }

    /// Receive and apply a sync message from a peer.
    pub fn receive_sync_message(
        &mut self,
        peer_state: &mut sync::State,
        message: sync::Message,
    ) -> Result<(), AutomergeError> {
        self.doc.sync().receive_sync_message(peer_state, message)
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn cells_list_id(&self) -> Option<ObjId> {
        self.typed_child(&automerge::ROOT, "cells", ObjType::List)
    }

    /// The map object of the cell at `index`.
    fn cell_obj(&self, index: usize) -> Option<ObjId> {
        let cells_id = self.cells_list_id()?;
        self.doc
            .get(&cells_id, index)
            .ok()
            .flatten()
            .and_then(|(value, id)| match value {
                automerge::Value::Object(ObjType::Map) => Some(id),
                _ => None,
            })
    }

    fn typed_child(&self, parent: &ObjId, key: &str, expected: ObjType) -> Option<ObjId> {
        self.doc
            .get(parent, key)
            .ok()
            .flatten()
            .and_then(|(value, id)| match value {
                automerge::Value::Object(obj_type) if obj_type == expected => Some(id),
                _ => None,
            })
    }

    fn read_outputs(&self, cell_obj: &ObjId) -> Option<Vec<String>> {
        let list_id = self.typed_child(cell_obj, "outputs", ObjType::List)?;
        let len = self.doc.length(&list_id);
        Some(
            (0..len)
                .filter_map(|i| read_str(&self.doc, &list_id, i))
                .collect(),
        )
    }

    fn read_cell(&self, cell_obj: &ObjId) -> Option<CellSnapshot> {
        let id = read_str(&self.doc, cell_obj, "id")?;
        let cell_type = read_str(&self.doc, cell_obj, "cell_type").unwrap_or_default();
        let execution_count =
            read_str(&self.doc, cell_obj, "execution_count").unwrap_or_else(|| "null".to_string());

        let source = self
            .typed_child(cell_obj, "source", ObjType::Text)
            .and_then(|text_id| self.doc.text(&text_id).ok())
            .unwrap_or_default();

        Some(CellSnapshot {
            id,
            cell_type,
            source,
            execution_count,
            outputs: self.read_outputs(cell_obj),
        })
    }
}

/// Read a scalar string from any Automerge object by key.
fn read_str<O: AsRef<automerge::ObjId>, P: Into<automerge::Prop>>(
    doc: &AutoCommit,
    obj: O,
    prop: P,
) -> Option<String> {
    doc.get(obj, prop)
        .ok()
        .flatten()
        .and_then(|(value, _)| match value {
            automerge::Value::Scalar(s) => match s.as_ref() {
                automerge::ScalarValue::Str(s) => Some(s.to_string()),
                _ => None,
            },
            _ => None,
        })
}

/// Compute a safe filename for persisting a notebook document.
///
/// The notebook path may contain separators and other special characters, so
/// it is hashed with SHA-256 into a deterministic filename.
pub fn notebook_doc_filename(notebook_id: &str) -> String {
    use sha2::{Digest, Sha256};
    let hash = hex::encode(Sha256::digest(notebook_id.as_bytes()));
    format!("{}.automerge", hash)
}
