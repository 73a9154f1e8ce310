// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, fs, os::unix::fs::symlink, path::PathBuf};

    use {
        futures::future::{FutureExt, LocalBoxFuture},
        tokio_util::sync::CancellationToken,
    };

    use gpupgrade_lib::{
        cluster::{Cluster, ClusterError, Role, Segment},
        error::{Error, Result},
        state::{StateDir, Status, COMPLETED, FAILED, IN_PROGRESS},
        step::{run_steps, Step, Substep},
        stream::MultiplexedStream,
        test_env::{block_on, step_sentinels, test_dir, RecordingSender},
    };

    #[derive(Default)]
    struct Recorder {
        ran: RefCell<Vec<&'static str>>,
    }

    fn first<'a>(ctx: &'a Recorder, _: &'a MultiplexedStream) -> LocalBoxFuture<'a, Result<()>> {
        async move {
            ctx.ran.borrow_mut().push("first");
            Ok(())
        }
        .boxed_local()
    }

    fn second<'a>(ctx: &'a Recorder, _: &'a MultiplexedStream) -> LocalBoxFuture<'a, Result<()>> {
        async move {
            ctx.ran.borrow_mut().push("second");
            Err(Error::Internal("second step broke".to_string()))
        }
        .boxed_local()
    }

    fn third<'a>(ctx: &'a Recorder, _: &'a MultiplexedStream) -> LocalBoxFuture<'a, Result<()>> {
        async move {
            ctx.ran.borrow_mut().push("third");
            Ok(())
        }
        .boxed_local()
    }

    const STEPS: &[Step<Recorder>] = &[
        Step {
            substep: Substep::Config,
            run: first,
        },
        Step {
            substep: Substep::StartAgents,
            run: second,
        },
        Step {
            substep: Substep::GenerateTargetConfig,
            run: third,
        },
    ];

    #[test]
    fn sentinel_transitions() {
        let state = StateDir::new(test_dir("state_sentinel_transitions"));
        let step = state.step("config");

        assert_eq!(step.status(), Status::Pending);

        step.mark_in_progress().unwrap();
        assert_eq!(step.status(), Status::Running);
        assert_eq!(step_sentinels(&state, Substep::Config), vec![IN_PROGRESS]);

        step.mark_complete().unwrap();
        step.mark_complete().unwrap();
        assert_eq!(step.status(), Status::Complete);
        assert_eq!(step_sentinels(&state, Substep::Config), vec![COMPLETED]);

        step.mark_failed().unwrap();
        assert_eq!(step_sentinels(&state, Substep::Config), vec![FAILED]);

        step.reset_state_dir().unwrap();
        assert_eq!(step.status(), Status::Pending);
        assert!(step_sentinels(&state, Substep::Config).is_empty());
    }

    #[test]
    fn two_sentinels_read_as_pending() {
        let state = StateDir::new(test_dir("state_corrupt_sentinels"));
        let step = state.step("config");
        step.mark_complete().unwrap();
        fs::write(step.path().join(FAILED), "").unwrap();

        assert_eq!(step.status(), Status::Pending);

        // The next transition cleans up.
        step.mark_in_progress().unwrap();
        assert_eq!(step_sentinels(&state, Substep::Config), vec![IN_PROGRESS]);
    }

    #[test]
    fn failing_step_stops_the_sequence() {
        let root = test_dir("state_failing_step_stops");
        let state = StateDir::new(root.join("state"));
        let sender = RecordingSender::new();
        let stream =
            MultiplexedStream::open(&root.join("run.log"), "Test", Some(Box::new(sender.clone())))
                .unwrap();
        let recorder = Recorder::default();

        let err = block_on(run_steps(
            &recorder,
            &state,
            &stream,
            STEPS,
            &CancellationToken::new(),
        ))
        .unwrap_err();

        assert_eq!(
            err.to_string(),
            "substep \"start-agents\": second step broke"
        );
        assert_eq!(*recorder.ran.borrow(), vec!["first", "second"]);

        assert_eq!(step_sentinels(&state, Substep::Config), vec![COMPLETED]);
        assert_eq!(step_sentinels(&state, Substep::StartAgents), vec![FAILED]);
        assert_eq!(state.step("generate-target-config").status(), Status::Pending);

        assert_eq!(
            sender.statuses(),
            vec![
                (Substep::Config, Status::Running),
                (Substep::Config, Status::Complete),
                (Substep::StartAgents, Status::Running),
                (Substep::StartAgents, Status::Failed),
            ]
        );
    }

    /// Leaves the step's sentinels so that `completed` cannot be written.
    struct Clobber {
        state_root: PathBuf,
    }

    fn clobber_sentinels<'a>(
        ctx: &'a Clobber,
        _: &'a MultiplexedStream,
    ) -> LocalBoxFuture<'a, Result<()>> {
        async move {
            let step = ctx.state_root.join("config");
            fs::remove_file(step.join(IN_PROGRESS)).unwrap();
            fs::create_dir_all(step.join(IN_PROGRESS).join("inner")).unwrap();
            symlink("nowhere", step.join(COMPLETED)).unwrap();
            Ok(())
        }
        .boxed_local()
    }

    #[test]
    fn unrecordable_completion_fails_the_step() {
        let root = test_dir("state_unrecordable_completion");
        let state = StateDir::new(root.join("state"));
        let sender = RecordingSender::new();
        let stream =
            MultiplexedStream::open(&root.join("run.log"), "Test", Some(Box::new(sender.clone())))
                .unwrap();
        let ctx = Clobber {
            state_root: state.root().to_path_buf(),
        };
        let steps = [Step {
            substep: Substep::Config,
            run: clobber_sentinels,
        }];

        let err = block_on(run_steps(&ctx, &state, &stream, &steps, &CancellationToken::new()))
            .unwrap_err();

        assert!(err.to_string().starts_with("substep \"config\": "), "{err}");
        assert_eq!(
            sender.statuses(),
            vec![
                (Substep::Config, Status::Running),
                (Substep::Config, Status::Failed),
            ]
        );
        assert_eq!(state.step("config").status(), Status::Failed);
        assert!(!state.step("config").path().join(IN_PROGRESS).exists());
    }

    #[test]
    fn rerun_resets_previous_outcome() {
        let root = test_dir("state_rerun_resets");
        let state = StateDir::new(root.join("state"));
        let stream = MultiplexedStream::open(&root.join("run.log"), "Test", None).unwrap();
        let recorder = Recorder::default();

        block_on(run_steps(&recorder, &state, &stream, &STEPS[..1], &CancellationToken::new()))
            .unwrap();
        state.step("config").mark_failed().unwrap();

        block_on(run_steps(&recorder, &state, &stream, &STEPS[..1], &CancellationToken::new()))
            .unwrap();
        assert_eq!(step_sentinels(&state, Substep::Config), vec![COMPLETED]);
        assert_eq!(recorder.ran.borrow().len(), 2);
    }

    #[test]
    fn cancelled_request_starts_nothing() {
        let root = test_dir("state_cancelled_request");
        let state = StateDir::new(root.join("state"));
        let stream = MultiplexedStream::open(&root.join("run.log"), "Test", None).unwrap();
        let recorder = Recorder::default();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = block_on(run_steps(&recorder, &state, &stream, STEPS, &cancel)).unwrap_err();
        assert!(matches!(err, Error::Cancelled("config")), "{err}");
        assert!(recorder.ran.borrow().is_empty());
        assert!(step_sentinels(&state, Substep::Config).is_empty());
    }

    #[test]
    fn cluster_file_round_trip() {
        let dir = test_dir("state_cluster_round_trip");
        let segment = |dbid: i32, content: i32, port: u16| Segment {
            dbid,
            content,
            role: Role::Primary,
            port,
            host: "mdw".to_string(),
            datadir: PathBuf::from(format!("/data/gpseg{content}")),
        };
        let cluster = Cluster::new(
            vec![segment(1, -1, 5432), segment(2, 0, 6000), segment(3, 1, 6001)],
            "/usr/local/gpdb6/bin",
        )
        .unwrap();

        let path = dir.join("source_cluster.json");
        cluster.commit(&path).unwrap();
        assert_eq!(Cluster::load(&path).unwrap(), cluster);

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert_eq!(entries.len(), 1, "no temporary files may be left behind");
    }

    fn segment_json(dbid: i32, content: i32, host: &str, port: u16) -> String {
        format!(
            r#"{{"dbid": {dbid}, "content": {content}, "role": "primary", "port": {port}, "host": "{host}", "datadir": "/data/gpseg{dbid}"}}"#
        )
    }

    fn write_cluster(dir: &std::path::Path, segments: &[String]) -> PathBuf {
        let path = dir.join("source_cluster.json");
        fs::write(
            &path,
            format!(r#"{{"segments": [{}], "binDir": "/usr/local/gpdb6/bin"}}"#, segments.join(", ")),
        )
        .unwrap();
        path
    }

    #[test]
    fn loading_a_missing_cluster_file() {
        let path = test_dir("state_cluster_missing").join("source_cluster.json");
        let err = Cluster::load(&path).unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(ref p) if *p == path), "{err}");
    }

    #[test]
    fn loading_a_malformed_cluster_file() {
        let path = test_dir("state_cluster_malformed").join("source_cluster.json");
        fs::write(&path, r#"{"segments": [{"dbid": 1,"#).unwrap();

        let err = Cluster::load(&path).unwrap_err();
        assert!(matches!(err, ClusterError::Malformed { .. }), "{err}");
        assert!(err.to_string().contains("source_cluster.json"), "{err}");
    }

    #[test]
    fn loading_a_file_with_two_coordinators() {
        let dir = test_dir("state_cluster_two_coordinators");
        let path = write_cluster(
            &dir,
            &[
                segment_json(1, -1, "mdw", 5432),
                segment_json(2, -1, "smdw", 5432),
                segment_json(3, 0, "sdw1", 6000),
            ],
        );

        let err = Cluster::load(&path).unwrap_err();
        assert!(matches!(err, ClusterError::InvariantViolation(_)), "{err}");
        assert!(err.to_string().contains("found 2"), "{err}");
    }

    #[test]
    fn loading_a_file_with_a_shared_port() {
        let dir = test_dir("state_cluster_shared_port");
        let path = write_cluster(
            &dir,
            &[
                segment_json(1, -1, "mdw", 5432),
                segment_json(2, 0, "sdw1", 6000),
                segment_json(3, 1, "sdw1", 6000),
            ],
        );

        let err = Cluster::load(&path).unwrap_err();
        assert!(matches!(err, ClusterError::InvariantViolation(_)), "{err}");
        assert!(err.to_string().contains("port 6000 on host sdw1"), "{err}");
    }
}
