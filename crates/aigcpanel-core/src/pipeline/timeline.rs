//! Timeline layout and per-segment duration alignment.

use std::path::Path;

use tracing::debug;

use super::job::Segment;
use crate::error::Result;
use crate::media::{self, MediaTool};

/// One entry of the combined track, in playback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Piece {
    /// Filler between `start` and `end` ms.
    Silence { start: i64, end: i64 },
    /// Segment `index` of the record list.
    Segment { index: usize, start: i64, end: i64 },
}

impl Piece {
    pub fn start(&self) -> i64 {
        match *self {
            Piece::Silence { start, .. } | Piece::Segment { start, .. } => start,
        }
    }

    pub fn end(&self) -> i64 {
        match *self {
            Piece::Silence { end, .. } | Piece::Segment { end, .. } => end,
        }
    }
}

/// Lay `records` out on a timeline of `total_ms`, inserting silence before
/// each gap and after the last segment up to `total_ms`.
pub fn plan_timeline(records: &[Segment], total_ms: i64) -> Vec<Piece> {
    let mut pieces = Vec::with_capacity(records.len() * 2 + 1);
    let mut cursor = 0;
    for (index, rec) in records.iter().enumerate() {
        if rec.start > cursor {
            pieces.push(Piece::Silence { start: cursor, end: rec.start });
        }
        pieces.push(Piece::Segment { index, start: rec.start, end: rec.end });
        cursor = cursor.max(rec.end);
    }
    if total_ms > cursor {
        pieces.push(Piece::Silence { start: cursor, end: total_ms });
    }
    pieces
}

/// Make `output` exactly `target_ms` long: trim when longer, pad with silence
/// when shorter, plain copy when already right.
pub async fn align(tool: &dyn MediaTool, input: &Path, output: &Path, target_ms: i64) -> Result<()> {
    let actual = tool.probe_duration_ms(input).await?;
    debug!(input = %input.display(), actual, target_ms, "aligning clip");
    if actual == target_ms {
        tokio::fs::copy(input, output).await?;
        return Ok(());
    }
    let args = if actual > target_ms {
        media::trim_args(input, output, target_ms)
    } else {
        media::pad_args(input, output, target_ms)
    };
    tool.run(args).await
}

/// Write `duration_ms` of silence to `output`; non-positive lengths become 1 ms.
pub async fn silence(tool: &dyn MediaTool, output: &Path, duration_ms: i64) -> Result<()> {
    tool.run(media::silence_args(output, duration_ms.max(1))).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FailingMedia, RecordingMedia};

    #[test]
    fn timeline_covers_source_without_overlap() {
        let records = vec![
            Segment::new("a", 500, 2_000),
            Segment::new("b", 2_000, 4_500),
            Segment::new("c", 6_000, 9_000),
        ];
        let pieces = plan_timeline(&records, 10_000);

        assert_eq!(pieces.first().map(Piece::start), Some(0));
        assert_eq!(pieces.last().map(Piece::end), Some(10_000));
        for pair in pieces.windows(2) {
            assert_eq!(pair[0].end(), pair[1].start(), "{pieces:?}");
        }
        assert_eq!(pieces.iter().map(|p| p.end() - p.start()).sum::<i64>(), 10_000);
        let segments: Vec<usize> = pieces
            .iter()
            .filter_map(|p| match p {
                Piece::Segment { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(segments, vec![0, 1, 2]);
    }

    #[test]
    fn no_trailing_filler_past_last_segment() {
        let pieces = plan_timeline(&[Segment::new("a", 0, 3_000)], 2_000);
        assert_eq!(pieces, vec![Piece::Segment { index: 0, start: 0, end: 3_000 }]);
    }

    #[test]
    fn nested_segment_does_not_rewind_the_cursor() {
        let records = vec![Segment::new("outer", 0, 3_000), Segment::new("inner", 500, 1_000)];
        let pieces = plan_timeline(&records, 4_000);
        assert_eq!(
            pieces,
            vec![
                Piece::Segment { index: 0, start: 0, end: 3_000 },
                Piece::Segment { index: 1, start: 500, end: 1_000 },
                Piece::Silence { start: 3_000, end: 4_000 },
            ]
        );
    }

    #[tokio::test]
    async fn aligning_exact_duration_copies() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("raw.wav");
        let output = dir.path().join("aligned.wav");
        std::fs::write(&input, b"RIFF").unwrap();

        let tool = RecordingMedia::with_default_duration(1_500);
        align(&tool, &input, &output, 1_500).await.unwrap();

        assert!(tool.runs().is_empty());
        assert_eq!(std::fs::read(&output).unwrap(), b"RIFF");
    }

    #[tokio::test]
    async fn aligning_trims_or_pads() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("raw.wav");
        let output = dir.path().join("aligned.wav");

        let tool = RecordingMedia::with_default_duration(3_000);
        align(&tool, &input, &output, 2_000).await.unwrap();
        tool.set_duration("raw.wav", 1_000);
        align(&tool, &input, &output, 2_000).await.unwrap();

        let runs = tool.runs();
        assert_eq!(runs[0], media::trim_args(&input, &output, 2_000));
        assert_eq!(runs[1], media::pad_args(&input, &output, 2_000));
    }

    #[tokio::test]
    async fn silence_clamps_and_propagates() {
        let tool = RecordingMedia::default();
        silence(&tool, Path::new("s.wav"), 0).await.unwrap();
        assert_eq!(tool.runs()[0], media::silence_args(Path::new("s.wav"), 1));

        assert!(silence(&FailingMedia, Path::new("s.wav"), 10).await.is_err());
        assert!(align(&FailingMedia, Path::new("a"), Path::new("b"), 10).await.is_err());
    }
}
