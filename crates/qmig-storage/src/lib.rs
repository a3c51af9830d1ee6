//! Source API fetching and target store persistence for the migration engine.

mod memory;
mod postgres;
mod retry;
mod source;
mod store;

pub use memory::{MemoryMappingStore, MemoryTargetStore, RowPredicate};
pub use postgres::PgTargetStore;
pub use retry::{RetryDisposition, RetryPolicy, Retried};
pub use source::{
    classify_reqwest_error, classify_status, FetchError, HttpRecordSource, HttpSourceConfig,
    MinIntervalLimiter, PageCursor, PaginatorError, RecordSource, SourceEndpoint, SourcePage,
    SourcePaginator,
};
pub use store::{MappingStore, StoreError, TargetStore};

pub const CRATE_NAME: &str = "qmig-storage";
