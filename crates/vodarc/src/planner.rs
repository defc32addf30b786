use crate::models::MediaPlaylist;

/// Inclusive segment index range for a requested time window, plus the
/// absolute media-time offset of the first selected segment. The offset later
/// becomes the archive's start-of-window timestamp for chat alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentPlan {
    pub start_index: usize,
    pub end_index: usize,
    pub start_position_ms: u64,
    pub duration_ms: u64,
}

impl SegmentPlan {
    pub fn segment_count(&self) -> usize {
        self.end_index - self.start_index + 1
    }
}

/// Compute which segments cover `[from_ms, to_ms]`.
///
/// A segment may legitimately start up to one target duration before the
/// requested start, so the start search accepts any start time within
/// `[from_ms - target, from_ms]`; the end search is symmetric over
/// `[to_ms, to_ms + target]`. On no structural match the insertion point is
/// taken as the nearest segment within the slack window.
///
/// Returns `None` for an empty manifest; the caller treats that as nothing to
/// fetch, not an error.
pub fn plan(playlist: &MediaPlaylist, from_ms: u64, to_ms: u64) -> Option<SegmentPlan> {
    let segments = playlist.segments();
    if segments.is_empty() {
        return None;
    }
    let target = *playlist.target_duration_ms();
    let starts: Vec<u64> = segments.iter().map(|s| *s.relative_start_ms()).collect();
    let last = starts.len() - 1;

    let start_index = if from_ms == 0 {
        0
    } else {
        let min = from_ms.saturating_sub(target);
        window_search(&starts, min, from_ms)
    };
    // to_ms may be u64::MAX for an open-ended window
    let end_index = if to_ms >= starts[last] {
        last
    } else {
        window_search(&starts, to_ms, to_ms.saturating_add(target))
    };
    let end_index = end_index.max(start_index);

    let start_position_ms = starts[start_index];
    let duration_ms = starts[end_index] + segments[end_index].duration_ms() - start_position_ms;
    Some(SegmentPlan {
        start_index,
        end_index,
        start_position_ms,
        duration_ms,
    })
}

/// Binary search for any start time in `[lo, hi]`; without an exact match the
/// insertion point is the first segment at or after `lo`, clamped to the last
/// index.
fn window_search(starts: &[u64], lo: u64, hi: u64) -> usize {
    use std::cmp::Ordering;
    match starts.binary_search_by(|&time| {
        if time > hi {
            Ordering::Greater
        } else if time < lo {
            Ordering::Less
        } else {
            Ordering::Equal
        }
    }) {
        Ok(i) => i,
        Err(i) => i.min(starts.len() - 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MediaSegment;

    fn uniform_playlist(count: usize, duration_ms: u64) -> MediaPlaylist {
        let segments = (0..count)
            .map(|i| MediaSegment::new(i as u64 * duration_ms, duration_ms, format!("{}.ts", i)))
            .collect();
        MediaPlaylist::new(duration_ms, segments)
    }

    #[test]
    fn full_window_selects_all() {
        let playlist = uniform_playlist(10, 2000);
        let plan = plan(&playlist, 0, 19999).unwrap();
        assert_eq!(plan.start_index, 0);
        assert_eq!(plan.end_index, 9);
        assert_eq!(plan.start_position_ms, 0);
        assert_eq!(plan.segment_count(), 10);
    }

    #[test]
    fn mid_window_uses_slack_bounds() {
        // start times 0,2000,..,18000; from=5000 accepts [3000,5000] -> 4000 (idx 2),
        // to=9999 accepts [9999,11999] -> 10000 (idx 5)
        let playlist = uniform_playlist(10, 2000);
        let plan = plan(&playlist, 5000, 9999).unwrap();
        assert_eq!(plan.start_index, 2);
        assert_eq!(plan.end_index, 5);
        assert_eq!(plan.start_position_ms, 4000);
        assert_eq!(plan.duration_ms, 8000);
    }

    #[test]
    fn empty_manifest_is_no_work() {
        let playlist = MediaPlaylist::new(2000, vec![]);
        assert!(plan(&playlist, 0, 1000).is_none());
    }

    #[test]
    fn end_past_last_start_takes_last_segment() {
        let playlist = uniform_playlist(10, 2000);
        let plan = plan(&playlist, 0, 18500).unwrap();
        assert_eq!(plan.end_index, 9);
    }

    #[test]
    fn end_beyond_total_duration_clamps_to_last() {
        let playlist = uniform_playlist(10, 2000);
        let plan = plan(&playlist, 0, 50_000).unwrap();
        assert_eq!(plan.end_index, 9);
    }

    #[test]
    fn open_ended_window_selects_through_last_segment() {
        let playlist = uniform_playlist(10, 2000);
        let plan = plan(&playlist, 0, u64::MAX).unwrap();
        assert_eq!(plan.start_index, 0);
        assert_eq!(plan.end_index, 9);
        assert_eq!(plan.duration_ms, 20_000);
    }

    #[test]
    fn start_without_exact_match_lands_in_window() {
        // from=4500 -> window [2500,4500]; 4000 matches (idx 2)
        let playlist = uniform_playlist(10, 2000);
        let plan = plan(&playlist, 4500, 9000).unwrap();
        assert_eq!(plan.start_index, 2);
    }

    #[test]
    fn start_never_exceeds_end() {
        let playlist = uniform_playlist(10, 2000);
        for from in (0..20000).step_by(700) {
            for to in (from..20000).step_by(900) {
                let plan = plan(&playlist, from, to).unwrap();
                assert!(plan.start_index <= plan.end_index);
                // selected window overlaps [from - target, to + target]
                assert!(plan.start_position_ms + plan.duration_ms >= from.saturating_sub(2000));
                assert!(plan.start_position_ms <= to + 2000);
            }
        }
    }

    #[test]
    fn single_segment_manifest() {
        let playlist = uniform_playlist(1, 2000);
        let plan = plan(&playlist, 0, 1500).unwrap();
        assert_eq!(plan.start_index, 0);
        assert_eq!(plan.end_index, 0);
        assert_eq!(plan.duration_ms, 2000);
    }
}
