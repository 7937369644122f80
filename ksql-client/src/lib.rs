//! Dispatch layer for a remote ksqlDB server.
//!
//! Every request is classified as an administrative statement, a bounded
//! query or a streaming query. Each mode owns one cached connection that is
//! reused across calls and rebuilt once it fails. Replies are normalized into
//! [`OutputRecord`]s and handed to an [`OutputSink`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use ksql_client::{DispatchConfig, Dispatcher, Request};
//!
//! # async fn example() -> ksql_client::Result<()> {
//! let config = DispatchConfig::default();
//! let dispatcher = Dispatcher::http(&config);
//! let request = Request::new("SELECT * FROM users LIMIT 5;");
//! dispatcher
//!     .dispatch(&request, &config.endpoint, Duration::from_secs(15))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod classify;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod model;
pub mod render;
pub mod sink;
mod slot;
mod timing;
pub mod transport;

pub use classify::{classify, Mode};
pub use config::DispatchConfig;
pub use dispatcher::{Dispatcher, DispatcherState, StreamExit, StreamHandle, StreamOutcome};
pub use error::{ClassificationError, DispatchError, Result, TransportError};
pub use http::HttpTransportFactory;
pub use model::{ReplyEntry, Request, Row, RowEvent, StreamInfo, TableInfo, TopicInfo};
pub use render::{OutputRecord, RenderedValue, ValueKind};
pub use sink::{CollectingSink, LogSink, OutputSink};
pub use slot::SlotState;
pub use transport::{CancelHandle, ConnectionScope, Connected, EngineConnection, TransportFactory};
