pub mod accumulator;
pub mod citations;
pub mod decoder;
pub mod events;
pub mod normalize;
pub mod render;

use std::fmt::Display;
use std::pin::pin;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use accumulator::{Accumulator, AnswerState, FinishedAnswer, Outcome};
pub use citations::{Citation, KeyScheme};
pub use decoder::StreamError;
pub use events::{merge_followups, Followup, Phase, Role};

/// Drive one answer stream to completion.
///
/// Reads `bytes` until the stream ends, a terminal event arrives, or `cancel`
/// fires. `on_update` sees the state after every event that changed it.
/// Cancellation drops the transport read and aborts the accumulator; nothing
/// read after that point is applied.
pub async fn stream_answer<S, B, E>(
    bytes: S,
    accumulator: &mut Accumulator,
    cancel: &CancellationToken,
    mut on_update: impl FnMut(&AnswerState),
) where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut events = pin!(decoder::decode(bytes));
    let mut applied = 0usize;

    while !accumulator.is_finished() {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                accumulator.abort();
                on_update(accumulator.state());
                break;
            }
            next = events.next() => next,
        };

        match next {
            Some(Ok(event)) => {
                if accumulator.apply(event) {
                    applied += 1;
                    on_update(accumulator.state());
                }
            }
            Some(Err(err)) => {
                accumulator.fail_stream(&err);
                on_update(accumulator.state());
            }
            None => break,
        }
    }
    debug!(applied, phase = %accumulator.state().phase, "answer stream closed");
}
