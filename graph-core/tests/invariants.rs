//! Testable properties from spec §8: invariants the engine must uphold
//! regardless of which scenario drives it.

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use graph_core::automation::{Action, ActionValue, AutomationDefinition, Trigger, TriggerEvent};
use graph_core::query::{Filter, PropertyOp, QueryDefinition};
use graph_core::store::CreateNodeOptions;
use graph_core::value::Value;

#[tokio::test]
async fn every_successful_mutation_emits_exactly_one_event() {
    let (engine, _fetch) = common::test_engine().await;
    let count = Arc::new(AtomicU64::new(0));
    let count_clone = count.clone();
    engine.bus().subscribe(move |_event| {
        count_clone.fetch_add(1, Ordering::SeqCst);
    });

    let before = count.load(Ordering::SeqCst);
    let node = engine.create_node(CreateNodeOptions::default()).await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), before + 1);

    engine.set_property(node.id, "field:supertag", 0, Value::String("ignored".to_string())).await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), before + 2);

    // A failed mutation (unknown field) must not emit.
    let failure = engine.set_property(node.id, "field:does-not-exist", 0, Value::Bool(true)).await;
    assert!(failure.is_err());
    assert_eq!(count.load(Ordering::SeqCst), before + 2, "a rejected mutation must not emit an event");
}

#[tokio::test]
async fn subscription_callback_never_fires_for_initial_results() {
    let (engine, _fetch) = common::test_engine().await;
    let _pre_existing = engine.create_node(CreateNodeOptions::default()).await.unwrap();

    let fired = Arc::new(Mutex::new(false));
    let fired_clone = fired.clone();
    let handle = engine.subscribe(QueryDefinition::default(), move |_delta| *fired_clone.lock().unwrap() = true).await.unwrap();

    assert!(!handle.get_last_results().is_empty());
    assert!(!*fired.lock().unwrap(), "the callback must not run for the subscription's initial evaluation");
}

#[tokio::test]
async fn soft_deleted_nodes_are_excluded_from_assembly_and_queries() {
    let (engine, _fetch) = common::test_engine().await;
    let node = engine.create_node(CreateNodeOptions { content: Some("temp".to_string()), ..Default::default() }).await.unwrap();

    assert!(engine.get(node.id).await.unwrap().is_some());
    engine.soft_delete(node.id).await.unwrap();
    assert!(engine.get(node.id).await.unwrap().is_none());

    let result = engine.query(&QueryDefinition::default()).await.unwrap();
    assert!(!result.ids().contains(&node.id));
}

#[tokio::test]
async fn smart_invalidation_skips_subscriptions_with_disjoint_fingerprints() {
    let (engine, _fetch) = common::test_engine().await;
    engine.store().create_node(CreateNodeOptions { system_id: Some("field:a".to_string()), ..Default::default() }).await.unwrap();
    engine.store().create_node(CreateNodeOptions { system_id: Some("field:b".to_string()), ..Default::default() }).await.unwrap();

    let node = engine.create_node(CreateNodeOptions::default()).await.unwrap();
    // Subscribing on field:a narrows the fingerprint to that field alone.
    let _handle = engine
        .subscribe(QueryDefinition::new(vec![Filter::Property { field_system_id: "field:a".to_string(), op: PropertyOp::IsNotEmpty, value: None }]), |_| {})
        .await
        .unwrap();

    let skipped_before = engine.registry.skipped_evaluations();
    engine.set_property(node.id, "field:b", 0, Value::String("irrelevant".to_string())).await.unwrap();
    let skipped_after = engine.registry.skipped_evaluations();

    assert!(skipped_after > skipped_before, "a mutation on an unrelated field should be skipped by the smart-invalidation fingerprint check");
}

#[tokio::test]
async fn batching_with_debounce_converges_to_the_same_result_as_synchronous_delivery() {
    let (sync_engine, _f1) = common::test_engine().await;
    let sync_deliveries = Arc::new(Mutex::new(Vec::new()));
    let sync_clone = sync_deliveries.clone();
    sync_engine.subscribe(QueryDefinition::default(), move |delta| sync_clone.lock().unwrap().push(delta)).await.unwrap();
    for i in 0..20 {
        sync_engine.create_node(CreateNodeOptions { content: Some(format!("n{i}")), ..Default::default() }).await.unwrap();
    }
    let sync_total_added: usize = sync_deliveries.lock().unwrap().iter().map(|d| d.added.len()).sum();

    let (debounced_engine, _f2) = common::test_engine().await;
    let debounced_deliveries = Arc::new(Mutex::new(Vec::new()));
    let debounced_clone = debounced_deliveries.clone();
    let handle = debounced_engine.subscribe(QueryDefinition::default(), move |delta| debounced_clone.lock().unwrap().push(delta)).await.unwrap();
    debounced_engine.registry.set_debounce_ms(handle.id, 50);
    for i in 0..20 {
        debounced_engine.create_node(CreateNodeOptions { content: Some(format!("n{i}")), ..Default::default() }).await.unwrap();
    }
    debounced_engine.registry.flush_pending_mutations().await.unwrap();
    let debounced_total_added: usize = debounced_deliveries.lock().unwrap().iter().map(|d| d.added.len()).sum();

    assert_eq!(sync_total_added, 20);
    assert_eq!(debounced_total_added, 20, "debounced delivery must converge to the same total membership change as synchronous delivery");
    assert!(debounced_deliveries.lock().unwrap().len() <= sync_deliveries.lock().unwrap().len(), "debouncing should coalesce, never multiply, deliveries");
}

#[tokio::test]
async fn automation_cycle_chain_terminates_at_the_configured_depth() {
    let (engine, _fetch) = common::test_engine().await;
    engine.store().create_node(CreateNodeOptions { system_id: Some("field:flag".to_string()), ..Default::default() }).await.unwrap();

    let is_a = QueryDefinition::new(vec![Filter::Property { field_system_id: "field:flag".to_string(), op: PropertyOp::Eq, value: Some(Value::String("a".to_string())) }]);
    let is_b = QueryDefinition::new(vec![Filter::Property { field_system_id: "field:flag".to_string(), op: PropertyOp::Eq, value: Some(Value::String("b".to_string())) }]);

    engine
        .register_automation(AutomationDefinition {
            name: "flip-to-b".to_string(),
            enabled: true,
            trigger: Trigger { query_definition: is_a, event: TriggerEvent::OnEnter },
            action: Action::SetProperty { field_system_id: "field:flag".to_string(), value: ActionValue::Literal(Value::String("b".to_string())) },
        })
        .await
        .unwrap();
    engine
        .register_automation(AutomationDefinition {
            name: "flip-to-a".to_string(),
            enabled: true,
            trigger: Trigger { query_definition: is_b, event: TriggerEvent::OnEnter },
            action: Action::SetProperty { field_system_id: "field:flag".to_string(), value: ActionValue::Literal(Value::String("a".to_string())) },
        })
        .await
        .unwrap();

    let node = engine.create_node(CreateNodeOptions::default()).await.unwrap();

    // Without the cycle limit this ping-pongs forever; it must return.
    engine.set_property(node.id, "field:flag", 0, Value::String("a".to_string())).await.unwrap();

    let assembled = engine.get(node.id).await.unwrap().unwrap();
    assert_eq!(assembled.value("field:flag"), Some(Value::String("a".to_string())), "with an 8-deep cycle limit the chain settles back on 'a'");
}

#[tokio::test]
async fn webhook_retries_a_transient_failure_then_succeeds() {
    let fetch = common::MockFetch::new();
    fetch.fail_times(1);
    let queue = graph_core::webhook::WebhookQueue::new(fetch.clone()).with_retry_policy(3, 10, 200);

    let job_id = queue
        .enqueue(0, "https://example.invalid/hook".to_string(), graph_core::automation::HttpMethod::Post, Default::default(), None, serde_json::json!({}))
        .await;

    queue.process_queue().await;
    let job = queue.get_job(job_id).unwrap();
    assert_eq!(job.status, graph_core::webhook::JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert!(job.next_retry_at.is_some(), "a transient failure should schedule a retry rather than fail outright");

    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    queue.process_queue().await;
    let job = queue.get_job(job_id).unwrap();
    assert_eq!(job.status, graph_core::webhook::JobStatus::Completed);
    assert_eq!(job.attempts, 2);
}

#[tokio::test]
async fn supertag_inheritance_walk_terminates_under_a_cycle() {
    let (engine, _fetch) = common::test_engine().await;
    // A extends B extends C extends A: a 3-cycle the evaluator must not loop on.
    for sid in ["supertag:a", "supertag:b", "supertag:c"] {
        engine.store().create_node(CreateNodeOptions { system_id: Some(sid.to_string()), ..Default::default() }).await.unwrap();
    }
    let a = engine.store().get_node_by_system_id("supertag:a", false).await.unwrap().unwrap();
    let b = engine.store().get_node_by_system_id("supertag:b", false).await.unwrap().unwrap();
    let c = engine.store().get_node_by_system_id("supertag:c", false).await.unwrap().unwrap();
    engine.set_property(a.id, graph_core::ids::well_known::FIELD_EXTENDS, 0, Value::String("supertag:b".to_string())).await.unwrap();
    engine.set_property(b.id, graph_core::ids::well_known::FIELD_EXTENDS, 0, Value::String("supertag:c".to_string())).await.unwrap();
    engine.set_property(c.id, graph_core::ids::well_known::FIELD_EXTENDS, 0, Value::String("supertag:a".to_string())).await.unwrap();

    let node = engine.create_node(CreateNodeOptions { supertag_system_id: Some("supertag:a".to_string()), ..Default::default() }).await.unwrap();

    // This must return promptly (the test itself is the timeout guard via
    // #[tokio::test]'s default single-threaded runtime) rather than hang
    // walking the cycle forever.
    let result = engine
        .query(&QueryDefinition::new(vec![Filter::Supertag { id: "supertag:c".to_string(), include_inherited: true }]))
        .await
        .unwrap();
    assert!(result.ids().contains(&node.id), "a node tagged #A should satisfy an inherited query for #C despite the cycle");
}

#[tokio::test]
async fn webhook_job_fails_after_exhausting_max_attempts() {
    let fetch = common::MockFetch::new();
    fetch.fail_times(10);
    let queue = graph_core::webhook::WebhookQueue::new(fetch.clone()).with_retry_policy(3, 5, 20);

    let job_id = queue
        .enqueue(0, "https://example.invalid/hook".to_string(), graph_core::automation::HttpMethod::Post, Default::default(), None, serde_json::json!({}))
        .await;

    for _ in 0..3 {
        queue.process_queue().await;
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }

    let job = queue.get_job(job_id).unwrap();
    assert_eq!(job.attempts, 3);
    assert_eq!(job.status, graph_core::webhook::JobStatus::Failed);
}
