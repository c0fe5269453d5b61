
    use super::*;
    use cadence_core::{ExecutionOutcome, Job, TriggerState};
    use tokio_test::{assert_err, assert_ok};

    fn trigger_spec(name: &str) -> TriggerSpec {
        TriggerSpec {
            name: name.to_string(),
            group: None,
            interval_ms: 1000,
            max_concurrents: None,
            max_occurrences: None,
            rate_limit_ms: None,
            fire_if_exists: None,
        }
    }

    fn job_spec(name: &str, kind: JobKind) -> JobSpec {
        JobSpec {
            name: name.to_string(),
            group: None,
            kind,
            message: None,
            command: None,
            args: Vec::new(),
            timeout_ms: None,
            max_concurrents: None,
            rate_limit_ms: None,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_log_job_succeeds() {
        let job = LogJob::new("log", Some("hello".to_string()));
        let context = ExecutionContext::builder().insert("k", "v").build();
        assert_ok!(job.handle(Some(context), CancellationToken::new()).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_job_exit_status() {
        let ok = CommandJob::new("ok", "sh", vec!["-c".into(), "exit 0".into()], None);
        assert_ok!(ok.handle(None, CancellationToken::new()).await);

        let failing = CommandJob::new(
            "failing",
            "sh",
            vec!["-c".into(), "echo broken >&2; exit 3".into()],
            None,
        );
        let err = failing
            .handle(None, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_job_timeout_and_cancel() {
        let slow = CommandJob::new(
            "slow",
            "sleep",
            vec!["5".into()],
            Some(Duration::from_millis(50)),
        );
        let err = slow
            .handle(None, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));

        let slow = CommandJob::new("slow", "sleep", vec!["5".into()], None);
        let token = CancellationToken::new();
        token.cancel();
        let err = slow.handle(None, token).await.unwrap_err();
        assert!(err.to_string().contains("canceled"));
    }

    #[tokio::test]
    async fn test_missing_program_is_a_failure() {
        let job = CommandJob::new("missing", "/nonexistent/cadence-binary", Vec::new(), None);
        assert_err!(job.handle(None, CancellationToken::new()).await);
    }

    #[test]
    fn test_build_trigger_applies_overrides_and_defaults() {
        let mut config = AppConfig::default();
        config.scheduler.trigger.max_concurrents = 2;

        let mut spec = trigger_spec("t");
        spec.max_occurrences = Some(4);
        let trigger = assert_ok!(build_trigger(&spec, &config));

        assert_eq!(trigger.state(), TriggerState::Configured);
        assert_eq!(trigger.max_concurrents(), 2);
        assert_eq!(trigger.max_occurrences(), Some(4));
    }

    #[test]
    fn test_build_job_variants() {
        let config = AppConfig::default();

        let mut disabled = job_spec("log", JobKind::Log);
        disabled.enabled = false;
        let job = assert_ok!(build_job(&disabled, &config));
        assert!(!job.is_enabled());

        let mut limited = job_spec("cmd", JobKind::Command);
        limited.command = Some("true".to_string());
        limited.rate_limit_ms = Some(250);
        let job = assert_ok!(build_job(&limited, &config));
        assert_eq!(job.rate_limit(), Some(Duration::from_millis(250)));

        assert_err!(build_job(&job_spec("empty", JobKind::Command), &config));
    }

    #[tokio::test]
    async fn test_fire_condition_tracks_path() {
        let dir = tempfile::tempdir().unwrap();
        let flag = dir.path().join("flag");
        let condition = fire_condition(Some(flag.clone()));

        assert!(!condition(None).await.unwrap());
        std::fs::write(&flag, b"").unwrap();
        assert!(condition(None).await.unwrap());
        assert!(fire_condition(None)(None).await.unwrap());
    }

    #[tokio::test]
    async fn test_build_orchestrator_wires_everything() {
        let mut config = AppConfig::default();
        config.triggers = vec![trigger_spec("a"), trigger_spec("b")];
        config.jobs = vec![job_spec("log", JobKind::Log)];

        let (orchestrator, triggers) = assert_ok!(build_orchestrator(&config));
        assert_eq!(triggers.len(), 2);
        assert_eq!(orchestrator.triggers().len(), 2);
        assert_eq!(orchestrator.jobs().len(), 1);
        assert!(triggers.iter().all(|t| t.listener_count() == 1));

        let jobs = orchestrator.jobs();
        assert_eq!(
            jobs[0].execute(None, CancellationToken::new()).await,
            ExecutionOutcome::Completed
        );
    }
