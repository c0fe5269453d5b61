
    use super::*;
    use crate::job::{ExecutionOutcome, MockJob};
    use crate::trigger::MockTrigger;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    type Slot = Arc<Mutex<Option<Listener>>>;

    fn slot() -> Slot {
        Arc::new(Mutex::new(None))
    }

    fn capturing_trigger(slot: &Slot) -> MockTrigger {
        let mut trigger = MockTrigger::new();
        let s = Arc::clone(slot);
        trigger.expect_subscribe().times(1).returning(move |l| {
            *s.lock().unwrap() = Some(l);
            SubscriptionId::from(1)
        });
        trigger
    }

    fn capturing_job(slot: &Slot, enabled: bool) -> MockJob {
        let mut job = MockJob::new();
        let s = Arc::clone(slot);
        job.expect_subscribe().times(1).returning(move |l| {
            *s.lock().unwrap() = Some(l);
            SubscriptionId::from(7)
        });
        job.expect_is_enabled().return_const(enabled);
        job
    }

    fn quiet_job() -> MockJob {
        let mut job = MockJob::new();
        job.expect_subscribe().returning(|_| SubscriptionId::from(1));
        job.expect_is_enabled().return_const(true);
        job
    }

    fn quiet_trigger() -> MockTrigger {
        let mut trigger = MockTrigger::new();
        trigger.expect_subscribe().returning(|_| SubscriptionId::from(1));
        trigger
    }

    fn raise(slot: &Slot, event: LifecycleEvent) {
        let listener = slot.lock().unwrap().clone().unwrap();
        listener(&event).unwrap();
    }

    fn trigger_source() -> EventSource {
        EventSource::Trigger("test".to_string())
    }

    fn kinds_of(orchestrator: &Orchestrator) -> Arc<Mutex<Vec<&'static str>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        orchestrator.subscribe(listener(move |event| {
            s.lock().unwrap().push(event.kind.label());
            Ok(())
        }));
        seen
    }

    async fn settle(counter: &AtomicUsize, expected: usize) {
        for _ in 0..100 {
            if counter.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_add_trigger_subscribes_immediately() {
        let mut trigger = MockTrigger::new();
        trigger
            .expect_subscribe()
            .times(1)
            .returning(|_| SubscriptionId::from(1));
        trigger.expect_activate().never();

        let orchestrator = Orchestrator::new();
        orchestrator.add_trigger(Arc::new(trigger)).unwrap();
        assert_eq!(orchestrator.triggers().len(), 1);
    }

    #[test]
    fn test_add_job_subscribes_immediately() {
        let mut job = MockJob::new();
        job.expect_subscribe()
            .times(1)
            .returning(|_| SubscriptionId::from(1));
        job.expect_execute().never();

        let orchestrator = Orchestrator::new();
        orchestrator.add_job(Arc::new(job)).unwrap();
        assert_eq!(orchestrator.jobs().len(), 1);
    }

    #[test]
    fn test_start_without_jobs() {
        let mut trigger = quiet_trigger();
        trigger.expect_activate().never();

        let orchestrator = Orchestrator::new();
        orchestrator.add_trigger(Arc::new(trigger)).unwrap();

        let result = orchestrator.start(None, CancellationToken::new());
        assert!(matches!(result, Err(Error::NoJobs)));
        assert!(!orchestrator.is_started());
    }

    #[test]
    fn test_start_without_triggers() {
        let orchestrator = Orchestrator::new();
        orchestrator.add_job(Arc::new(quiet_job())).unwrap();

        let result = orchestrator.start(None, CancellationToken::new());
        assert!(matches!(result, Err(Error::NoTriggers)));
    }

    #[test]
    fn test_start_activates_every_trigger_once() {
        let orchestrator = Orchestrator::new();
        orchestrator.add_job(Arc::new(quiet_job())).unwrap();

        for _ in 0..2 {
            let mut trigger = quiet_trigger();
            trigger
                .expect_activate()
                .times(1)
                .withf(|context, _| {
                    context.as_ref().and_then(|c| c.get_str("tenant")) == Some("acme")
                })
                .returning(|_, _| Ok(()));
            orchestrator.add_trigger(Arc::new(trigger)).unwrap();
        }

        let context = ExecutionContext::builder().insert("tenant", "acme").build();
        orchestrator
            .start(Some(context.clone()), CancellationToken::new())
            .unwrap();
        assert!(orchestrator.is_started());

        assert!(matches!(
            orchestrator.start(Some(context), CancellationToken::new()),
            Err(Error::AlreadyStarted)
        ));
        assert!(matches!(
            orchestrator.add_job(Arc::new(MockJob::new())),
            Err(Error::AlreadyStarted)
        ));
        assert!(matches!(
            orchestrator.add_trigger(Arc::new(MockTrigger::new())),
            Err(Error::AlreadyStarted)
        ));
    }

    #[test]
    fn test_start_aborts_when_a_trigger_refuses() {
        let orchestrator = Orchestrator::new();
        orchestrator.add_job(Arc::new(quiet_job())).unwrap();

        let mut first = quiet_trigger();
        first.expect_activate().times(2).returning(|_, _| Ok(()));
        first.expect_deactivate().times(1).return_const(());
        orchestrator.add_trigger(Arc::new(first)).unwrap();

        let refuse = Arc::new(AtomicBool::new(true));
        let mut second = quiet_trigger();
        let r = Arc::clone(&refuse);
        second.expect_activate().times(2).returning(move |_, _| {
            if r.swap(false, Ordering::SeqCst) {
                Err(Error::NotConfigured)
            } else {
                Ok(())
            }
        });
        orchestrator.add_trigger(Arc::new(second)).unwrap();

        let result = orchestrator.start(None, CancellationToken::new());
        assert!(matches!(result, Err(Error::NotConfigured)));
        assert!(!orchestrator.is_started());

        // A failed start leaves the orchestrator startable
        orchestrator.start(None, CancellationToken::new()).unwrap();
        assert!(orchestrator.is_started());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle_tracks_fanned_out_jobs() {
        let orchestrator = Orchestrator::new();
        let trigger_slot = slot();
        orchestrator
            .add_trigger(Arc::new(capturing_trigger(&trigger_slot)))
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let mut job = capturing_job(&slot(), true);
        let c = Arc::clone(&calls);
        job.expect_execute().times(1).returning(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
            ExecutionOutcome::Completed
        });
        orchestrator.add_job(Arc::new(job)).unwrap();
        assert_eq!(orchestrator.running_jobs(), 0);

        raise(&trigger_slot, LifecycleEvent::triggered(trigger_source(), None));
        // Spawned but not polled yet
        assert_eq!(orchestrator.running_jobs(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::timeout(Duration::from_secs(1), orchestrator.wait_idle())
            .await
            .unwrap();
        assert_eq!(orchestrator.running_jobs(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_triggered_fans_out_to_enabled_jobs() {
        let orchestrator = Orchestrator::new();
        let trigger_slot = slot();
        orchestrator
            .add_trigger(Arc::new(capturing_trigger(&trigger_slot)))
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let mut enabled = capturing_job(&slot(), true);
        let c = Arc::clone(&calls);
        enabled
            .expect_execute()
            .times(1)
            .withf(|context, _| context.as_ref().and_then(|c| c.get_str("run")) == Some("42"))
            .returning(move |_, _| {
                c.fetch_add(1, Ordering::SeqCst);
                ExecutionOutcome::Completed
            });
        let mut disabled = capturing_job(&slot(), false);
        disabled.expect_execute().never();

        orchestrator.add_job(Arc::new(enabled)).unwrap();
        orchestrator.add_job(Arc::new(disabled)).unwrap();
        let kinds = kinds_of(&orchestrator);

        let context = ExecutionContext::builder().insert("run", "42").build();
        raise(
            &trigger_slot,
            LifecycleEvent::triggered(trigger_source(), Some(context)),
        );
        settle(&calls, 1).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*kinds.lock().unwrap(), vec!["triggered"]);
        assert_eq!(orchestrator.stats().triggered, 1);
    }

    #[tokio::test]
    async fn test_jobs_receive_child_of_start_token() {
        let orchestrator = Orchestrator::new();
        let trigger_slot = slot();
        let mut trigger = capturing_trigger(&trigger_slot);
        trigger.expect_activate().returning(|_, _| Ok(()));
        orchestrator.add_trigger(Arc::new(trigger)).unwrap();

        let received = Arc::new(Mutex::new(None::<CancellationToken>));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut job = capturing_job(&slot(), true);
        let (r, c) = (Arc::clone(&received), Arc::clone(&calls));
        job.expect_execute().returning(move |_, cancel| {
            *r.lock().unwrap() = Some(cancel);
            c.fetch_add(1, Ordering::SeqCst);
            ExecutionOutcome::Completed
        });
        orchestrator.add_job(Arc::new(job)).unwrap();

        let token = CancellationToken::new();
        orchestrator.start(None, token.clone()).unwrap();
        raise(&trigger_slot, LifecycleEvent::triggered(trigger_source(), None));
        settle(&calls, 1).await;

        let child = received.lock().unwrap().clone().unwrap();
        assert!(!child.is_cancelled());
        token.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_job_fault_bubbles_up() {
        let orchestrator = Orchestrator::new();
        let job_slot = slot();
        orchestrator
            .add_job(Arc::new(capturing_job(&job_slot, true)))
            .unwrap();
        let kinds = kinds_of(&orchestrator);
        let mut events = orchestrator.events();

        raise(
            &job_slot,
            LifecycleEvent::faulted(
                EventSource::Job("report".to_string()),
                None,
                Error::Execution {
                    job: "report".to_string(),
                    message: "boom".to_string(),
                },
            ),
        );

        assert_eq!(*kinds.lock().unwrap(), vec!["faulted"]);
        assert_eq!(orchestrator.stats().faulted, 1);
        match events.recv().await.unwrap() {
            SchedulerEvent::Faulted { source, error, .. } => {
                assert_eq!(source, "job:report");
                assert!(error.contains("boom"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_terminal_events_are_re_raised() {
        let orchestrator = Orchestrator::new();
        let trigger_slot = slot();
        orchestrator
            .add_trigger(Arc::new(capturing_trigger(&trigger_slot)))
            .unwrap();
        let kinds = kinds_of(&orchestrator);

        raise(&trigger_slot, LifecycleEvent::canceled(trigger_source()));
        raise(&trigger_slot, LifecycleEvent::completed(trigger_source()));

        assert_eq!(*kinds.lock().unwrap(), vec!["canceled", "completed"]);
        assert_eq!(
            orchestrator.stats(),
            OrchestratorStats {
                triggered: 0,
                faulted: 0,
                canceled: 1,
                completed: 1,
            }
        );
    }

    #[test]
    fn test_failing_listener_raises_one_fault() {
        let orchestrator = Orchestrator::new();
        let trigger_slot = slot();
        orchestrator
            .add_trigger(Arc::new(capturing_trigger(&trigger_slot)))
            .unwrap();

        orchestrator.subscribe(listener(|event| {
            if matches!(event.kind, EventKind::Completed) {
                anyhow::bail!("completed handler failed");
            }
            Ok(())
        }));
        let kinds = kinds_of(&orchestrator);

        raise(&trigger_slot, LifecycleEvent::completed(trigger_source()));

        // The listener registered after the failing one still ran
        assert_eq!(*kinds.lock().unwrap(), vec!["completed", "faulted"]);
        assert_eq!(orchestrator.stats().completed, 1);
        assert_eq!(orchestrator.stats().faulted, 1);
    }

    #[test]
    fn test_failing_fault_listener_counts_once() {
        let orchestrator = Orchestrator::new();
        let trigger_slot = slot();
        orchestrator
            .add_trigger(Arc::new(capturing_trigger(&trigger_slot)))
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        orchestrator.subscribe(listener(move |event| {
            if event.is_fault() {
                c.fetch_add(1, Ordering::SeqCst);
                panic!("fault handler exploded");
            }
            Ok(())
        }));

        raise(
            &trigger_slot,
            LifecycleEvent::faulted(trigger_source(), None, Error::FireAction("x".into())),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(orchestrator.stats().faulted, 1);
    }

    #[test]
    fn test_remove_trigger_and_job() {
        let orchestrator = Orchestrator::new();

        let mut trigger = quiet_trigger();
        trigger.expect_unsubscribe().times(1).return_const(true);
        let trigger: Arc<dyn Trigger> = Arc::new(trigger);
        orchestrator.add_trigger(Arc::clone(&trigger)).unwrap();

        let mut job = quiet_job();
        job.expect_unsubscribe().times(1).return_const(true);
        let job: Arc<dyn Job> = Arc::new(job);
        orchestrator.add_job(Arc::clone(&job)).unwrap();

        assert!(orchestrator.remove_trigger(&trigger));
        assert!(!orchestrator.remove_trigger(&trigger));
        assert!(orchestrator.remove_job(&job));
        assert!(orchestrator.jobs().is_empty());
        assert!(orchestrator.triggers().is_empty());
    }

    #[test]
    fn test_stop_deactivates_every_trigger() {
        let orchestrator = Orchestrator::new();
        for _ in 0..3 {
            let mut trigger = quiet_trigger();
            trigger.expect_deactivate().times(1).return_const(());
            orchestrator.add_trigger(Arc::new(trigger)).unwrap();
        }
        orchestrator.stop("shutdown");
    }

    #[test]
    fn test_unsubscribe_aggregate_listener() {
        let orchestrator = Orchestrator::new();
        let trigger_slot = slot();
        orchestrator
            .add_trigger(Arc::new(capturing_trigger(&trigger_slot)))
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let id = orchestrator.subscribe(listener(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        raise(&trigger_slot, LifecycleEvent::completed(trigger_source()));
        assert!(orchestrator.unsubscribe(id));
        raise(&trigger_slot, LifecycleEvent::completed(trigger_source()));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(orchestrator.stats().completed, 2);
    }
