//! Engine error types

use thiserror::Error;

/// Result type for scene construction and path computation
pub type SceneResult<T> = Result<T, SceneError>;

/// Errors raised while building or querying a scene
#[derive(Error, Debug)]
pub enum SceneError {
    /// A sound source carries a geometry kind the engine cannot model
    #[error("unsupported source geometry: {0}")]
    UnsupportedSourceGeometry(&'static str),

    /// A building footprint with fewer than 3 distinct vertices
    #[error("degenerate footprint: a polygon needs at least 3 distinct vertices")]
    DegenerateFootprint,

    /// Terrain points could not be triangulated
    #[error("terrain triangulation failed: {0}")]
    Triangulation(String),
}

impl SceneError {
    /// True when the error invalidates the whole run rather than one call
    pub fn is_fatal(&self) -> bool {
        matches!(self, SceneError::Triangulation(_))
    }
}
