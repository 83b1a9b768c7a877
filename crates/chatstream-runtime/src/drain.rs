use futures::{Stream, StreamExt as _};

/// Result of fully consuming a stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// Number of items pulled before exhaustion.
    pub items: u64,
}

/// Pulls `stream` until it is exhausted, discarding items.
///
/// Items are only pulled so that whatever side effects are attached to the
/// stream run to completion. The stream is dropped before this returns on
/// every path; an `Err` item is reported only after that release. A missing
/// body completes immediately.
pub async fn drain_stream<S, T, E>(stream: Option<S>) -> Result<DrainSummary, E>
where
    S: Stream<Item = Result<T, E>> + Unpin,
{
    let Some(mut stream) = stream else {
        return Ok(DrainSummary::default());
    };

    let mut summary = DrainSummary::default();
    let outcome = loop {
        match stream.next().await {
            Some(Ok(_)) => summary.items += 1,
            Some(Err(err)) => break Err(err),
            None => break Ok(summary),
        }
    };
    drop(stream);
    outcome
}
