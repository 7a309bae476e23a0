//! Annotation records consumed by the identity pipeline.
//!
//! An [`Annotation`] is one detected animal instance in one frame. Records
//! are produced upstream and never change once loaded; the
//! [`AnnotationStore`] owns them for the lifetime of a run and answers the
//! two questions the rest of the pipeline asks: "which annotations are
//! identifiable enough to cluster" and "which annotations share a track".

mod error;
mod store;
mod types;

pub use error::AnnotationError;
pub use store::{AnnotationStore, IdentifiabilitySplit, Track};
pub use types::{Annotation, Location, Viewpoint};
