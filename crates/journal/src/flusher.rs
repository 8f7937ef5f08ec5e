use std::{
    cmp,
    time::Duration,
};

use errors::ErrorMetadataAnyhowExt;
use metadata::{
    Codec,
    MetadataServerError,
    Signer,
};
use runtime::Runtime;
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::Backoff,
    journal::{
        MdServerConnection,
        MetadataJournal,
    },
};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Drive `flush_one` until the journal drains. Returns the number of steps
/// that made progress; a fork conversion counts as one step even though it
/// consumes nothing.
///
/// Throttle and lock errors are retried after a delay, taking the larger of
/// the server's advisory and our own jittered backoff. Everything else
/// (conflicts already recovered inside `flush_one` aside) propagates.
pub async fn flush_all<RT: Runtime, C: Codec>(
    ctx: &CancellationToken,
    rt: &RT,
    journal: &MetadataJournal<RT, C>,
    signer: &dyn Signer,
    server: &dyn MdServerConnection,
) -> anyhow::Result<u64> {
    let mut backoff = Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF);
    let mut flushed = 0;
    loop {
        match journal.flush_one(ctx, signer, server).await {
            Ok(false) => return Ok(flushed),
            Ok(true) => {
                flushed += 1;
                backoff.reset();
            },
            Err(error) if error.is_retriable() => {
                let advisory = match error.downcast_ref::<MetadataServerError>() {
                    Some(MetadataServerError::Throttle { suggested_retry }) => *suggested_retry,
                    _ => Duration::ZERO,
                };
                let delay = cmp::max(advisory, rt.with_rng(|rng| backoff.fail(rng)));
                tracing::warn!(
                    "metadata server pushed back while flushing {}; retrying in {delay:?}",
                    journal.tlf_id(),
                );
                rt.wait(delay).await;
            },
            Err(error) => return Err(error),
        }
    }
}
