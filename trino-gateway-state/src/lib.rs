use enum_dispatch::enum_dispatch;
use snafu::Snafu;

pub mod binding;
pub mod history;

pub use binding::{BindOutcome, BindingRegistry};
pub use history::{InMemoryHistory, QueryHistoryRecord};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("In-memory history error"), context(false))]
    InMemoryHistory { source: history::Error },
}

/// Append-only sink for the query history. The gateway records every query it hands over to
/// a backend and treats sink failures as non-fatal (they are logged, never surfaced to the
/// client), so implementations are free to talk to slow external stores.
#[enum_dispatch(HistorySinkImplementation)]
// According to https://blog.rust-lang.org/2023/12/21/async-fn-rpit-in-traits.html
#[trait_variant::make(SendQueryHistorySink: Send)]
pub trait QueryHistorySink {
    async fn record(&self, record: QueryHistoryRecord) -> Result<(), Error>;

    /// The most recent records, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<QueryHistoryRecord>, Error>;
}

#[enum_dispatch]
pub enum HistorySinkImplementation {
    InMemory(InMemoryHistory),
}
