//! The error type returned from every fallible operation in this crate.

use thiserror::Error;

use crate::system::System;

/// The single error type returned from every fallible public function in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The input data was malformed for the operation being attempted: a shape mismatch, a
    /// missing required channel, non-2-D data where 2-D data is required, a singular matrix
    /// inversion, or an unrecognized `POLAR` header.
    #[error("invalid data: {reason}")]
    InvalidData {
        /// A human-readable description of what was wrong with the data.
        reason: String,
    },
    /// A planned transform path requires the `alpha` position-angle field, the input bundle did
    /// not carry one, and the caller suppressed automatic generation.
    #[error("transform path requires `alpha` but none was supplied or generated")]
    MissingAlpha,
    /// No path exists between the classified source system and the requested target system, or
    /// the IMAX correction was requested for a source system that is not `mzpsolar`/`mzpinstru`.
    #[error("no transform path from {src} to {dst}")]
    UnsupportedTransformation {
        /// The classified source system, printed as its canonical lowercase name.
        src: String,
        /// The requested target system, printed as its canonical lowercase name.
        dst: String,
    },
    /// An ingest collaborator encountered an instrument it does not recognize. This variant
    /// exists for callers that implement the `load` seam; the core engine never returns it.
    #[error("unsupported instrument: {name}")]
    UnsupportedInstrument {
        /// The unrecognized instrument name.
        name: String,
    },
    /// The caller's arguments to `resolve` were incomplete or unparseable: a missing
    /// `out_angles` list for an edge that requires one, or an unknown target system name.
    #[error("invalid arguments: {reason}")]
    InvalidArguments {
        /// A human-readable description of the invalid argument.
        reason: String,
    },
}

impl Error {
    pub(crate) fn unsupported(src: System, dst: System) -> Self {
        Error::UnsupportedTransformation {
            src: src.name().to_owned(),
            dst: dst.name().to_owned(),
        }
    }

    pub(crate) fn invalid_data(reason: impl Into<String>) -> Self {
        Error::InvalidData {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_args(reason: impl Into<String>) -> Self {
        Error::InvalidArguments {
            reason: reason.into(),
        }
    }
}
