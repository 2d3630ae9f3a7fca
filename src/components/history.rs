use tracing::{debug, info, warn};

use crate::canvas::RasterImage;
use crate::error::{EditError, EditResult};
use crate::store::{PersistedSession, SessionStore, StoreResult};

// ============================================================================
// HISTORY ENTRY
// ============================================================================

/// One snapshot in the edit history: the full raster plus a short label for
/// the history panel ("Crop", "Watermark", "Inpaint: remove the lamp" …).
#[derive(Clone, Debug, PartialEq)]
pub struct HistoryEntry {
    pub raster: RasterImage,
    pub label: String,
}

impl HistoryEntry {
    pub fn new(raster: RasterImage, label: impl Into<String>) -> Self {
        Self {
            raster,
            label: label.into(),
        }
    }
}

// ============================================================================
// EDIT HISTORY STORE - truncatable snapshot list backed by a SessionStore
// ============================================================================

/// Ordered raster snapshots with a current pointer.
///
/// Invariants: `pointer < entries.len()` whenever the history is non-empty,
/// and `pointer == entries.len() - 1` after every commit. Entry `i` in
/// memory is always the entry persisted at index `i`, and the stored
/// descriptor's length always matches `entries.len()` after a commit.
pub struct EditHistoryStore {
    entries: Vec<HistoryEntry>,
    pointer: usize,
    store: Box<dyn SessionStore>,
    /// Tool and prompt written with every descriptor.
    active_tool: String,
    prompt: String,
}

impl EditHistoryStore {
    pub fn new(store: Box<dyn SessionStore>) -> Self {
        Self {
            entries: Vec::new(),
            pointer: 0,
            store,
            active_tool: String::new(),
            prompt: String::new(),
        }
    }

    /// Append `raster` after the current pointer, discarding the redo branch.
    ///
    /// The raster and the new descriptor are persisted before anything in
    /// memory changes; if the store rejects either, the store is rolled back
    /// and the history is left exactly as it was. Returns the new pointer.
    pub fn commit(&mut self, raster: RasterImage, label: impl Into<String>) -> StoreResult<usize> {
        let new_index = if self.entries.is_empty() { 0 } else { self.pointer + 1 };
        self.commit_at(new_index, HistoryEntry::new(raster, label))
    }

    /// Replace the whole history with a single new original (new upload).
    ///
    /// Same guarantees as [`Self::commit`]: on failure the previous history
    /// stays intact in memory and in the store.
    pub fn start_over(&mut self, raster: RasterImage, label: impl Into<String>) -> StoreResult<usize> {
        self.commit_at(0, HistoryEntry::new(raster, label))
    }

    fn commit_at(&mut self, new_index: usize, entry: HistoryEntry) -> StoreResult<usize> {
        if let Err(e) = self.store.put(new_index, &entry) {
            warn!(index = new_index, error = %e, "commit aborted, history unchanged");
            return Err(e);
        }

        let descriptor = PersistedSession {
            history_length: new_index + 1,
            history_index: new_index,
            active_tool: self.active_tool.clone(),
            prompt: self.prompt.clone(),
        };
        if let Err(e) = self.store.save_descriptor(&descriptor) {
            warn!(index = new_index, error = %e, "descriptor write failed, rolling back commit");
            self.rollback_put(new_index);
            return Err(e);
        }

        // Entries past the new tail are never read back (restore only reads
        // up to the descriptor length), so a failure here is not fatal.
        if let Err(e) = self.store.remove_from(new_index + 1) {
            warn!(from = new_index + 1, error = %e, "failed to delete discarded redo entries");
        }

        let discarded = self.entries.len().saturating_sub(new_index);
        self.entries.truncate(new_index);
        self.entries.push(entry);
        self.pointer = new_index;

        info!(
            index = new_index,
            label = %self.entries[new_index].label,
            discarded,
            "history commit"
        );
        Ok(new_index)
    }

    /// Put back whatever was stored at `index` before a failed commit.
    fn rollback_put(&mut self, index: usize) {
        let restored = match self.entries.get(index) {
            Some(previous) => self.store.put(index, previous),
            None => self.store.remove_from(index),
        };
        if let Err(e) = restored {
            warn!(index, error = %e, "failed to roll back stored entry");
        }
    }

    /// Step back one entry. No-op (returns false) at the start.
    pub fn undo(&mut self) -> bool {
        if !self.can_undo() {
            return false;
        }
        self.pointer -= 1;
        debug!(pointer = self.pointer, "undo");
        true
    }

    /// Step forward one entry. No-op (returns false) at the end.
    pub fn redo(&mut self) -> bool {
        if !self.can_redo() {
            return false;
        }
        self.pointer += 1;
        debug!(pointer = self.pointer, "redo");
        true
    }

    /// Jump directly to entry `index` without discarding anything.
    pub fn select_index(&mut self, index: usize) -> EditResult<()> {
        if index >= self.entries.len() {
            return Err(EditError::InvalidIndex {
                index,
                len: self.entries.len(),
            });
        }
        self.pointer = index;
        debug!(pointer = index, "select history entry");
        Ok(())
    }

    /// Show the original upload again. Later entries stay reachable via redo.
    pub fn reset_to_original(&mut self) -> bool {
        if self.entries.is_empty() || self.pointer == 0 {
            return false;
        }
        self.pointer = 0;
        debug!("reset to original");
        true
    }

    /// Drop every entry, in memory and in the store (new upload).
    pub fn clear(&mut self) -> StoreResult<()> {
        self.store.clear()?;
        self.entries.clear();
        self.pointer = 0;
        Ok(())
    }

    pub fn current(&self) -> Option<&RasterImage> {
        self.entries.get(self.pointer).map(|e| &e.raster)
    }

    pub fn current_entry(&self) -> Option<&HistoryEntry> {
        self.entries.get(self.pointer)
    }

    pub fn original(&self) -> Option<&RasterImage> {
        self.entries.first().map(|e| &e.raster)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pointer(&self) -> usize {
        self.pointer
    }

    pub fn can_undo(&self) -> bool {
        !self.entries.is_empty() && self.pointer > 0
    }

    pub fn can_redo(&self) -> bool {
        self.pointer + 1 < self.entries.len()
    }

    pub fn labels(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.label.as_str()).collect()
    }

    /// Pixel bytes held by the history. Entries sharing a buffer count once.
    pub fn memory_bytes(&self) -> usize {
        let mut total = 0;
        for (i, entry) in self.entries.iter().enumerate() {
            let shared = self.entries[..i]
                .iter()
                .any(|earlier| earlier.raster.shares_pixels_with(&entry.raster));
            if !shared {
                total += entry.raster.memory_bytes();
            }
        }
        total
    }

    // ========================================================================
    // SESSION PERSISTENCE
    // ========================================================================

    pub fn descriptor(&self, active_tool: &str, prompt: &str) -> PersistedSession {
        PersistedSession {
            history_length: self.entries.len(),
            history_index: self.pointer,
            active_tool: active_tool.to_string(),
            prompt: prompt.to_string(),
        }
    }

    /// Tool and prompt recorded in descriptors written by later commits.
    pub fn set_session_meta(&mut self, active_tool: &str, prompt: &str) {
        self.active_tool = active_tool.to_string();
        self.prompt = prompt.to_string();
    }

    /// Remember the tool and prompt, then write the descriptor.
    pub fn save_session_descriptor(&mut self, active_tool: &str, prompt: &str) -> StoreResult<()> {
        self.set_session_meta(active_tool, prompt);
        let descriptor = self.descriptor(active_tool, prompt);
        self.store.save_descriptor(&descriptor)
    }

    pub fn load_session_descriptor(&self) -> StoreResult<Option<PersistedSession>> {
        self.store.load_descriptor()
    }

    /// Rebuild the history from the store.
    ///
    /// Either every entry `0..history_length` is read back, or nothing is:
    /// on a count mismatch (or an unreadable store) the persisted session is
    /// wiped, the history is left empty and `CorruptSession` is returned.
    pub fn restore_session(&mut self, descriptor: &PersistedSession) -> EditResult<()> {
        let expected = descriptor.history_length;
        self.entries.clear();
        self.pointer = 0;
        if expected == 0 {
            return Ok(());
        }

        let restored = match self.store.get_range(0..expected) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "failed to read stored history");
                Vec::new()
            }
        };

        if restored.len() != expected {
            let found = restored.len();
            warn!(expected, found, "stored session is corrupt, discarding it");
            if let Err(e) = self.store.clear() {
                warn!(error = %e, "failed to clear corrupt session");
            }
            return Err(EditError::CorruptSession { expected, found });
        }

        self.entries = restored;
        self.pointer = descriptor.history_index.min(expected - 1);
        self.active_tool = descriptor.active_tool.clone();
        self.prompt = descriptor.prompt.clone();
        if self.pointer != descriptor.history_index {
            warn!(
                stored = descriptor.history_index,
                clamped = self.pointer,
                "history index out of range, clamped"
            );
        }
        info!(entries = expected, pointer = self.pointer, "session restored");
        Ok(())
    }
}
