#![deny(missing_docs)]
#![doc = "Binning, distribution and error types shared by the iterative Bayesian unfolding crates."]

pub mod axis;
pub mod distribution;
pub mod errors;
pub mod layout;
pub mod provenance;
pub mod rng;

pub use axis::Axis;
pub use distribution::{Distribution, NORMALIZATION_TOLERANCE};
pub use errors::{ErrorInfo, UnfoldError};
pub use layout::{BinLayout, StackedBinGroup};
pub use provenance::{RunProvenance, SchemaVersion};
pub use rng::{derive_substream_seed, RngHandle};
