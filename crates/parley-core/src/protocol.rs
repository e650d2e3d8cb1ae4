use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Capacity of the channel between the LLM producer task and the aggregator.
pub const FRAGMENT_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the channel between the aggregator and the transport.
pub const CHUNK_CHANNEL_CAPACITY: usize = 32;

/// A single fragment emitted by a streaming model provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// A piece of generated text. Size and timing are provider-controlled.
    Token(String),
    /// Generation completed normally.
    Done,
    /// Generation terminated due to a provider error. Terminal.
    Error(String),
}

/// A handle to a streaming completion.
///
/// The receiver yields [`Fragment`] items as the provider produces them and
/// ends with [`Fragment::Done`] or [`Fragment::Error`]. Dropping the receiver
/// signals the producer to stop.
pub type FragmentStream = mpsc::Receiver<Fragment>;

/// A client-visible unit of output, tied to the session it belongs to.
///
/// Only exists on the wire; serialises as `{"session_id": 42, "content": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub session_id: i64,
    pub content: String,
}

/// Build a [`FragmentStream`] pre-loaded with `fragments`.
///
/// Convenient for replaying a known response through the pipeline.
pub fn fragment_stream<I>(fragments: I) -> FragmentStream
where
    I: IntoIterator<Item = Fragment>,
{
    let fragments: Vec<Fragment> = fragments.into_iter().collect();
    let (tx, rx) = mpsc::channel(fragments.len().max(1));
    for fragment in fragments {
        // Capacity is at least the number of items, so this never fails.
        let _ = tx.try_send(fragment);
    }
    rx
}
