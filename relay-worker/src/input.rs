//! Feed newline-delimited JSON records into a pipeline.
//!
//! A bad line is logged and skipped. Only a failure of the reader itself ends the feed.
use relay_common::record::{Record, Schema};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::pipeline::Pipeline;

/// Counts of what happened to the lines read by `feed_records`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FeedSummary {
    pub queued: usize,
    pub skipped: usize,
}

/// Read records from `reader` until end of input and hand each one to `pipeline`.
pub async fn feed_records<R>(
    reader: R,
    schema: &Schema,
    pipeline: &Pipeline,
) -> std::io::Result<FeedSummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut summary = FeedSummary::default();
    let mut lines = reader.split(b'\n');

    while let Some(bytes) = lines.next_segment().await? {
        let line = match String::from_utf8(bytes) {
            Ok(line) => line,
            Err(error) => {
                tracing::warn!("skipping line that is not valid UTF-8: {}", error);
                summary.skipped += 1;
                continue;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record = match Record::from_json(line, schema) {
            Ok(record) => record,
            Err(error) => {
                tracing::warn!("skipping malformed record: {}", error);
                summary.skipped += 1;
                continue;
            }
        };

        match pipeline.on_record(record) {
            Ok(()) => summary.queued += 1,
            Err(error) => {
                tracing::warn!("record not queued: {}", error);
                summary.skipped += 1;
            }
        }
    }

    Ok(summary)
}
