pub mod callbacks;
pub mod collection;
pub mod config;
pub mod entity;
pub mod error;
pub mod filter;
pub mod range_var;
pub mod reporter;
pub mod traits;
pub mod uri_template;
pub mod value;

#[cfg(test)]
pub(crate) mod testutil;

pub use callbacks::{Callback, CallbackContext, CallbackRegistry, NamedCallback};
pub use collection::{EntityCollection, ExportSchema};
pub use config::{ChainedRequest, EntityConfiguration, InputParameter};
pub use entity::{Entity, RetrievalOutcome};
pub use error::AppError;
pub use filter::{FilterPath, FilterStep};
pub use range_var::RangeVar;
pub use reporter::{RetrievalEvent, RetrievalReporter, TracingReporter};
pub use traits::Fetcher;
pub use uri_template::UriTemplate;
pub use value::{OutputValue, Record};
