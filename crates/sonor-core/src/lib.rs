//! # Outdoor sound propagation path engine
//!
//! This crate computes how sound travels from sources to receivers over
//! terrain and around buildings: it models the scene, derives cut
//! profiles along sight lines, and constructs direct, diffracted and
//! reflected propagation paths, evaluated concurrently across the
//! receiver set.
//!
//! ## Overview
//!
//! - **Scene**: buildings, walls, ground effect regions and a
//!   triangulated terrain, spatially indexed once and then shared
//!   read-only by every worker ([`scene`])
//! - **Cut profiles**: everything the straight line between two points
//!   crosses, ordered source to receiver ([`profile`])
//! - **Path construction**: free field, diffraction over roof edges and
//!   around corners, recursive wall reflections by the image-source
//!   method ([`pathfinder`], [`mirror`])
//! - **Scheduling**: contiguous receiver batches on a worker pool with
//!   cooperative cancellation ([`scheduler`])
//! - **Results**: paths flow into a caller-supplied [`sink::PathSink`];
//!   attenuation and storage stay on the caller's side of that trait
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use sonor_core::config::EngineConfig;
//! use sonor_core::geometry::Coord;
//! use sonor_core::pathfinder::PathFinder;
//! use sonor_core::scene::{Geometry, SceneBuilder};
//! use sonor_core::scheduler::CancellationToken;
//! use sonor_core::sink::MemorySink;
//!
//! let mut builder = SceneBuilder::new();
//! builder.add_source(
//!     Geometry::Point(Coord::new(0.0, 0.0, 1.0)),
//!     vec![90.0; 8],
//!     None,
//! ).unwrap();
//! builder.add_receiver(Coord::new(100.0, 0.0, 2.0));
//! let scene = builder.finish().unwrap();
//!
//! let finder = PathFinder::new(Arc::new(scene), EngineConfig::default());
//! let sink = Arc::new(MemorySink::new(vec![vec![90.0; 8]]));
//! finder.run(sink.clone(), &CancellationToken::new());
//! assert_eq!(sink.finalize_count(0), 1);
//! assert!(sink.receiver_level(0).is_some());
//! ```

pub mod config;
pub mod delaunay;
pub mod error;
pub mod geometry;
pub mod mirror;
pub mod observe;
pub mod path;
pub mod pathfinder;
pub mod power;
pub mod profile;
pub mod rtree;
pub mod scene;
pub mod scheduler;
pub mod sink;

pub use config::EngineConfig;
pub use error::{SceneError, SceneResult};
pub use geometry::{Coord, Envelope, Pt2};
pub use path::{Orientation, PathPoint, PathPointKind, PropagationPath, SegmentPath};
pub use pathfinder::PathFinder;
pub use profile::{CutKind, CutPoint, CutProfile};
pub use scene::{Geometry, Scene, SceneBuilder};
pub use scheduler::CancellationToken;
pub use sink::{MemorySink, OutputQueue, PathSink};
