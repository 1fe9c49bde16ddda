#![deny(missing_docs)]
#![deny(clippy::all)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

pub mod bundle;
pub mod error;
pub mod geometry;
pub mod graph;
pub mod imax;
pub mod resolve;
pub mod system;
pub mod transforms;
pub mod units;
pub mod wcs;

/// The image bundle and its channel type, re-exported for convenience; see [`mod@bundle`].
pub use bundle::{Bundle, Cube, Metadata, MetadataValue};
/// The crate's single error type; see [`mod@error`].
pub use error::Error;
/// The dispatch entry point; see [`mod@resolve`].
pub use resolve::{resolve, ResolveOptions};
/// The polarization-system taxonomy and its classifier; see [`mod@system`].
pub use system::{classify, System};
/// The world-coordinate descriptor; see [`mod@wcs`].
pub use wcs::Wcs;
