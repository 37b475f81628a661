//! Search parameter extraction and persistence.
//!
//! - [`registry`] - definitions of the parameters to index
//! - [`extractor`] - path-based extraction of values from payloads
//! - [`converters`] - conversion of JSON values to typed index values
//! - [`hash`] - the parameter hash stored on every logical resource
//! - [`dictionary`] - dictionary id resolution for names, systems, tokens and canonicals
//! - [`batch`] - batched row inserts
//! - [`persist`] - full replacement of a resource's parameter rows
//! - [`reindex`] - claim-based rebuilding of parameter rows
//! - [`tables`] - parameter table names and column lists
//!
//! # Write path
//!
//! ```text
//! payload ──extract──> Vec<ExtractedParameterValue>
//!         ──flatten──> composites expanded, components numbered
//!         ──hash─────> stored on logical_resources.parameter_hash
//!         ──persist──> delete old rows, resolve dictionary ids, batch insert
//! ```

pub mod batch;
pub mod converters;
pub mod dictionary;
pub mod errors;
pub mod extractor;
pub mod hash;
pub mod persist;
pub mod registry;
pub mod reindex;
pub mod tables;

pub use batch::ParameterBatcher;
pub use converters::ValueConverter;
pub use dictionary::{DEFAULT_TOKEN_SYSTEM, DictionaryResolver};
pub use errors::ExtractionError;
pub use extractor::{ParameterExtractor, PathExtractor};
pub use hash::parameter_hash;
pub use persist::{IndexingUnit, ParameterPersister};
pub use registry::{SearchParameterDefinition, SearchParameterRegistry};
pub use reindex::{ReindexClaim, ReindexProgress, ReindexQueue, ReindexResult, ReindexSweep};
pub use tables::{ParameterTable, TableTarget, WholeSystemTable};
