//! RetouchFE: image composition and edit-history engine.
//!
//! Every edit produces a new immutable [`canvas::RasterImage`] that is
//! committed to the [`components::history::EditHistoryStore`]; the
//! [`project::Project`] drives tools, the busy lock and persistence.

#![allow(clippy::too_many_arguments)]
#![allow(clippy::large_enum_variant)]

pub mod canvas;
pub mod cli;
pub mod components;
pub mod error;
pub mod io;
pub mod logger;
pub mod ops;
pub mod project;
pub mod settings;
pub mod store;
pub mod viewport;

pub use canvas::RasterImage;
pub use error::{EditError, EditResult};
pub use project::{Project, SessionCommand};
