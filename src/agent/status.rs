// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use crate::{agent::upgrade::segment_record, state::StateDir, state::Status};

/// How far one segment's upgrade on this host has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentStatus {
    pub content: i32,
    pub dbid: i32,
    pub status: Status,
}

/// Reads the upgrade record of each `(content, dbid)`. Segments that were never upgraded on this
/// host are pending.
pub fn check_conversion_status(state: &StateDir, segments: &[(i32, i32)]) -> Vec<SegmentStatus> {
    segments
        .iter()
        .map(|&(content, dbid)| SegmentStatus {
            content,
            dbid,
            status: segment_record(state, content).status(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_env::test_dir;

    #[test]
    fn reports_each_segment_record() {
        let state = StateDir::new(test_dir("agent_conversion_status"));
        segment_record(&state, 0).mark_complete().unwrap();
        segment_record(&state, 1).mark_in_progress().unwrap();

        let statuses = check_conversion_status(&state, &[(0, 2), (1, 3), (2, 4)]);
        let summary: Vec<(i32, Status)> = statuses.iter().map(|s| (s.content, s.status)).collect();
        assert_eq!(
            summary,
            vec![(0, Status::Complete), (1, Status::Running), (2, Status::Pending)]
        );
        assert_eq!(statuses[2].dbid, 4);
    }
}
