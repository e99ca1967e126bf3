//! Persistent kanban store for the arkaledge engine.
//!
//! A single JSON document per project directory, mutated under an advisory
//! file lock. See [`kanban::KanbanStore`] for the operation surface.

pub mod kanban;
pub mod lock;
pub mod models;

pub use kanban::{Actor, KanbanError, KanbanStore, NewTask, TaskPatch, STATE_DIR, STATE_FILE};
pub use models::{
    Artifact, ArtifactKind, HistoryAction, KanbanState, Task, TaskHistoryEvent, TaskPriority,
    TaskStatus,
};
