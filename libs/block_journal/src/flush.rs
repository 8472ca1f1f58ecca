//! Applies journal batches to the block server.
//!
//! The journal itself spawns no background work: an external scheduler pulls
//! batches through the functions here at whatever cadence it likes. Every
//! operation in a batch is idempotent, so each server call is retried with
//! exponential backoff while the error looks transient; cancellation is
//! honored between I/O operations, and the on-disk journal state is only
//! advanced after a batch has fully reached the server.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::entry::{JournalOp, MdRevision};
use crate::error::JournalError;
use crate::id::FolderId;
use crate::journal::{BlockEntriesToFlush, BlockJournal};
use crate::reporter::Reporter;
use crate::server::{BlockServer, BlockServerError};

/// Upper bound on entries per flush batch. Keeps the amount of block data
/// buffered in memory for the puts of one batch bounded.
pub const MAX_FLUSH_BATCH_SIZE: usize = 25;

// Transient server errors are retried for a good while before the error is
// surfaced to the scheduler; riding out a flaky server is the whole point of
// the journal. Permanent errors (bad request, unknown block) fail the flush
// immediately.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(3);
const MAX_RETRIES_PER_OP: u32 = 10;

/// Calls one server operation, retrying transient failures with exponential
/// backoff until `MAX_RETRIES_PER_OP` is exhausted or `cancel` fires.
async fn call_server<T, O, F>(
    mut op: O,
    what: &str,
    cancel: &CancellationToken,
) -> Result<T, JournalError>
where
    O: FnMut() -> F,
    F: std::future::Future<Output = Result<T, BlockServerError>>,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(JournalError::Cancelled);
        }

        let err = match op().await {
            Ok(v) => {
                if attempt > 0 {
                    info!("{what} succeeded after {attempt} retries");
                }
                return Ok(v);
            }
            Err(e) if e.is_permanent() => return Err(e.into()),
            Err(e) if attempt >= MAX_RETRIES_PER_OP => {
                warn!("{what} still failing after {attempt} retries, giving up: {e}");
                return Err(e.into());
            }
            Err(e) => e,
        };
        warn!("{what} failed, will retry (attempt {attempt}): {err}");

        let delay = RETRY_BASE_DELAY
            .saturating_mul(1u32 << attempt.min(10))
            .min(RETRY_MAX_DELAY);
        attempt += 1;
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return Err(JournalError::Cancelled),
        }
    }
}

/// Applies one batch to the server: puts first, then reference adds, then
/// archives and removes in log order. Ignored entries and markers carry no
/// server work. Does not touch the journal; callers follow up with
/// [`BlockJournal::remove_flushed_entries`].
pub async fn flush_block_entries<S: BlockServer>(
    server: &S,
    folder: FolderId,
    entries: &BlockEntriesToFlush,
    cancel: &CancellationToken,
) -> Result<(), JournalError> {
    for put in entries.puts() {
        call_server(
            || server.put_block(folder, put.id, &put.context, &put.data, &put.server_half),
            "flushing block put",
            cancel,
        )
        .await?;
        debug!("flushed put of block {}", put.id);
    }

    for (id, context) in entries.adds() {
        call_server(
            || server.add_block_reference(folder, *id, context),
            "flushing block reference",
            cancel,
        )
        .await?;
    }

    for entry in entries.other() {
        if entry.ignored {
            continue;
        }
        match entry.op {
            JournalOp::Archive => {
                call_server(
                    || server.archive_block_references(folder, &entry.contexts),
                    "flushing reference archival",
                    cancel,
                )
                .await?;
            }
            JournalOp::Remove => {
                // The server reports how many references remain per block;
                // its own refcounting is authoritative, so the counts are
                // not needed here.
                call_server(
                    || server.remove_block_references(folder, &entry.contexts),
                    "flushing reference removal",
                    cancel,
                )
                .await
                .map(drop)?;
            }
            JournalOp::MdRevMarker => {}
            op => {
                return Err(JournalError::Corrupt(format!(
                    "unflushable {op} entry classified as other"
                )));
            }
        }
    }

    Ok(())
}

#[derive(Debug, Default, PartialEq)]
pub struct FlushOutcome {
    pub entries_flushed: usize,
    /// Metadata revisions whose markers were crossed, in order. The caller
    /// relays these to the metadata layer so it can persist them remotely in
    /// lockstep.
    pub revisions: Vec<MdRevision>,
}

/// Drains the journal: repeatedly pulls a batch, applies it to the server,
/// and removes it from the log, never crossing an unignored md-revision
/// marker within one batch.
pub async fn flush_journal<S: BlockServer, R: Reporter>(
    journal: &mut BlockJournal,
    server: &S,
    reporter: &R,
    folder: FolderId,
    cancel: &CancellationToken,
) -> Result<FlushOutcome, JournalError> {
    let mut outcome = FlushOutcome::default();
    loop {
        if cancel.is_cancelled() {
            return Err(JournalError::Cancelled);
        }
        let Some(end) = journal.end()? else {
            break;
        };
        let (entries, revision) = journal.get_next_entries_to_flush(end, MAX_FLUSH_BATCH_SIZE)?;
        if entries.is_empty() {
            break;
        }

        flush_block_entries(server, folder, &entries, cancel).await?;
        journal.remove_flushed_entries(&entries, folder, reporter)?;
        outcome.entries_flushed += entries.len();

        if !revision.is_uninitialized() {
            reporter.notify_md_revision_flushed(folder, revision);
            outcome.revisions.push(revision);
        }
    }
    Ok(outcome)
}
