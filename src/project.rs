use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::CoreResult;
use crate::history::{OperationKind, UndoHistory};
use crate::io::{self, FileError};
use crate::settings::CoreSettings;
use crate::stack::LayerStack;

/// Single open document: a layer stack with its own history.
pub struct Project {
    pub id: Uuid,
    pub stack: LayerStack,
    pub history: UndoHistory,
    /// `None` for unsaved/untitled files.
    pub path: Option<PathBuf>,
    pub is_dirty: bool,

    /// Display name (derived from path or "Untitled-X")
    pub name: String,
}

impl Project {
    pub fn new_untitled(untitled_counter: usize, settings: &CoreSettings) -> CoreResult<Self> {
        let stack = LayerStack::with_background(
            settings.default_canvas_width,
            settings.default_canvas_height,
            image::Rgba([255, 255, 255, 255]),
        )?;
        Ok(Self::with_stack(format!("Untitled-{untitled_counter}"), None, stack, settings))
    }

    /// Open a `.pfs` project or a raster image.
    pub fn open(path: &Path, settings: &CoreSettings) -> Result<Self, FileError> {
        let stack = io::load_image(path)?;
        Ok(Self::with_stack(file_name(path), Some(path.to_path_buf()), stack, settings))
    }

    fn with_stack(name: String, path: Option<PathBuf>, stack: LayerStack, settings: &CoreSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            stack,
            history: UndoHistory::from_settings(settings),
            path,
            is_dirty: false,
            name,
        }
    }

    /// Run a stack mutation as one undoable step. The step is only recorded
    /// when `f` succeeds.
    pub fn apply<T>(
        &mut self,
        kind: OperationKind,
        description: impl Into<String>,
        f: impl FnOnce(&mut LayerStack) -> CoreResult<T>,
    ) -> CoreResult<T> {
        self.history.begin(kind, description, &self.stack);
        match f(&mut self.stack) {
            Ok(v) => {
                self.history.commit(&self.stack);
                self.is_dirty = true;
                Ok(v)
            }
            Err(e) => {
                self.history.abort();
                Err(e)
            }
        }
    }

    pub fn undo(&mut self) -> Option<String> {
        let desc = self.history.undo(&mut self.stack);
        if desc.is_some() {
            self.is_dirty = true;
        }
        desc
    }

    pub fn redo(&mut self) -> Option<String> {
        let desc = self.history.redo(&mut self.stack);
        if desc.is_some() {
            self.is_dirty = true;
        }
        desc
    }

    /// Save to the current path as a `.pfs` project.
    pub fn save(&mut self) -> Result<(), FileError> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| FileError::InvalidFormat("project has no file path".to_string()))?;
        self.save_as(&path)
    }

    pub fn save_as(&mut self, path: &Path) -> Result<(), FileError> {
        io::save_pfs(&self.stack, path)?;
        self.path = Some(path.to_path_buf());
        self.update_name_from_path();
        self.mark_clean();
        Ok(())
    }

    pub fn mark_dirty(&mut self) {
        self.is_dirty = true;
    }

    pub fn mark_clean(&mut self) {
        self.is_dirty = false;
    }

    pub fn update_name_from_path(&mut self) {
        if let Some(ref path) = self.path {
            self.name = file_name(path);
        }
    }

    /// Get the display title (name with dirty indicator)
    pub fn display_title(&self) -> String {
        if self.is_dirty {
            format!("{}*", self.name)
        } else {
            self.name.clone()
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}
