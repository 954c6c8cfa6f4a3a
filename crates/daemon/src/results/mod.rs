//! Asynchronous result buffer
//!
//! Pool tasks record side-channel results into a [`ResultBuffer`] without
//! touching storage. A [`ResultFlusher`] drains the buffer on a timer into a
//! [`LocalResultStore`].

mod buffer;
mod flusher;
mod local_store;

pub use buffer::{ResultBuffer, ResultEntry};
pub use flusher::{flush_once, ResultFlusher};
pub use local_store::{LocalResultStore, ResultStoreError};
