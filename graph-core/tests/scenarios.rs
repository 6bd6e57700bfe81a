//! End-to-end scenarios from spec §8, each exercising the engine facade
//! end to end rather than a single component in isolation (teacher
//! convention: `core/tests/reactor.rs` drives whole scenarios through
//! `Node`, not through `Reactor` directly).

mod common;

use chrono::{DateTime, Utc};
use graph_core::automation::{Action, ActionValue, AutomationDefinition, HttpMethod, Trigger, TriggerEvent};
use graph_core::computed::{Aggregation, ComputedFieldDefinition};
use graph_core::ids::well_known;
use graph_core::query::{Filter, PropertyOp, QueryDefinition};
use graph_core::store::CreateNodeOptions;
use graph_core::value::Value;
use serde_json::json;

async fn seed_field(engine: &graph_core::Engine, system_id: &str, label: &str) {
    engine.store().create_node(CreateNodeOptions { system_id: Some(system_id.to_string()), content: Some(label.to_string()), ..Default::default() }).await.unwrap();
}

#[tokio::test]
async fn scenario_1_auto_complete_timestamp() {
    let (engine, _fetch) = common::test_engine().await;
    seed_field(&engine, "field:status", "Status").await;
    seed_field(&engine, "field:completed_at", "Completed At").await;
    seed_field(&engine, "supertag:task", "Task").await;

    let trigger_query = QueryDefinition::new(vec![
        Filter::Supertag { id: "supertag:task".to_string(), include_inherited: false },
        Filter::Property { field_system_id: "field:status".to_string(), op: PropertyOp::Eq, value: Some(Value::String("done".to_string())) },
    ]);

    engine
        .register_automation(AutomationDefinition {
            name: "complete-on-done".to_string(),
            enabled: true,
            trigger: Trigger { query_definition: trigger_query.clone(), event: TriggerEvent::OnEnter },
            action: Action::SetProperty { field_system_id: "field:completed_at".to_string(), value: ActionValue::Now },
        })
        .await
        .unwrap();
    engine
        .register_automation(AutomationDefinition {
            name: "clear-on-undone".to_string(),
            enabled: true,
            trigger: Trigger { query_definition: trigger_query, event: TriggerEvent::OnExit },
            action: Action::ClearProperty { field_system_id: "field:completed_at".to_string() },
        })
        .await
        .unwrap();

    let task = engine.create_node(CreateNodeOptions { content: Some("Write tests".to_string()), supertag_system_id: Some("supertag:task".to_string()), ..Default::default() }).await.unwrap();

    let before = Utc::now();
    engine.set_property(task.id, "field:status", 0, Value::String("done".to_string())).await.unwrap();
    let after = Utc::now();

    let assembled = engine.get(task.id).await.unwrap().unwrap();
    let completed = assembled.value("field:completed_at").expect("completed_at should be set");
    let Value::String(raw) = completed else { panic!("expected string timestamp") };
    let parsed: DateTime<Utc> = DateTime::parse_from_rfc3339(&raw).unwrap().with_timezone(&Utc);
    assert!(parsed >= before && parsed <= after, "completed_at {parsed} not within [{before}, {after}]");

    engine.set_property(task.id, "field:status", 0, Value::String("pending".to_string())).await.unwrap();
    let assembled = engine.get(task.id).await.unwrap().unwrap();
    assert!(assembled.value("field:completed_at").is_none(), "completed_at should be cleared once the task exits the query");
}

#[tokio::test]
async fn scenario_2_supertag_inheritance_query() {
    let (engine, _fetch) = common::test_engine().await;
    // supertag:item is seeded by bootstrap; #Task extends #Item.
    seed_field(&engine, "supertag:task", "Task").await;
    let task_stag = engine.store().get_node_by_system_id("supertag:task", false).await.unwrap().unwrap();
    engine.set_property(task_stag.id, well_known::FIELD_EXTENDS, 0, Value::String("supertag:item".to_string())).await.unwrap();

    let node = engine.create_node(CreateNodeOptions { content: Some("a task".to_string()), supertag_system_id: Some("supertag:task".to_string()), ..Default::default() }).await.unwrap();

    let handle = engine
        .subscribe(QueryDefinition::new(vec![Filter::Supertag { id: "supertag:item".to_string(), include_inherited: true }]), |_| {})
        .await
        .unwrap();
    let results = handle.get_last_results();
    assert!(results.iter().any(|n| n.id == node.id), "inherited query should include the #Task node");

    let handle_exact = engine
        .subscribe(QueryDefinition::new(vec![Filter::Supertag { id: "supertag:item".to_string(), include_inherited: false }]), |_| {})
        .await
        .unwrap();
    let exact_results = handle_exact.get_last_results();
    assert!(!exact_results.iter().any(|n| n.id == node.id), "non-inherited query should not include the #Task node");
}

#[tokio::test]
async fn scenario_3_and_or_logical_filter() {
    let (engine, _fetch) = common::test_engine().await;
    seed_field(&engine, "field:status", "Status").await;
    seed_field(&engine, "field:priority", "Priority").await;

    async fn make(engine: &graph_core::Engine, status: &str, priority: &str) -> graph_core::ids::NodeId {
        let node = engine.create_node(CreateNodeOptions { content: Some(format!("{status}/{priority}")), ..Default::default() }).await.unwrap();
        engine.set_property(node.id, "field:status", 0, Value::String(status.to_string())).await.unwrap();
        engine.set_property(node.id, "field:priority", 0, Value::String(priority.to_string())).await.unwrap();
        node.id
    }

    let done_high = make(&engine, "done", "high").await;
    let done_low = make(&engine, "done", "low").await;
    let pending_high = make(&engine, "pending", "high").await;

    let status_done = Filter::Property { field_system_id: "field:status".to_string(), op: PropertyOp::Eq, value: Some(Value::String("done".to_string())) };
    let priority_high = Filter::Property { field_system_id: "field:priority".to_string(), op: PropertyOp::Eq, value: Some(Value::String("high".to_string())) };

    let and_result = engine.query(&QueryDefinition::new(vec![Filter::And(vec![status_done.clone(), priority_high.clone()])])).await.unwrap();
    assert_eq!(and_result.ids(), vec![done_high]);

    let or_result = engine.query(&QueryDefinition::new(vec![Filter::Or(vec![status_done, priority_high])])).await.unwrap();
    let mut or_ids = or_result.ids();
    or_ids.sort();
    let mut expected = vec![done_high, done_low, pending_high];
    expected.sort();
    assert_eq!(or_ids, expected);
}

#[tokio::test]
async fn scenario_4_computed_sum() {
    let (engine, _fetch) = common::test_engine().await;
    seed_field(&engine, "field:price", "Price").await;

    async fn make(engine: &graph_core::Engine, price: f64) -> graph_core::ids::NodeId {
        let node = engine.create_node(CreateNodeOptions::default()).await.unwrap();
        engine.set_property(node.id, "field:price", 0, Value::Number(price)).await.unwrap();
        node.id
    }

    let _a = make(&engine, 10.0).await;
    let b = make(&engine, 25.0).await;
    let _c = make(&engine, 15.0).await;

    let id = engine
        .create_computed_field(ComputedFieldDefinition {
            name: "total-price".to_string(),
            aggregation: Aggregation::Sum,
            query: QueryDefinition::new(vec![Filter::HasField { field_system_id: "field:price".to_string(), negate: false }]),
            field_system_id: Some("field:price".to_string()),
        })
        .await
        .unwrap();

    assert_eq!(engine.computed_fields.get_value(id), Some(Some(50.0)));

    let changes = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let changes_clone = changes.clone();
    engine.computed_fields.on_value_change(id, move |change| changes_clone.lock().unwrap().push(change));

    engine.set_property(b, "field:price", 0, Value::Number(5.0)).await.unwrap();

    assert_eq!(engine.computed_fields.get_value(id), Some(Some(30.0)));
    let recorded = changes.lock().unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].previous_value, Some(50.0));
    assert_eq!(recorded[0].current_value, Some(30.0));
}

#[tokio::test]
async fn scenario_5_webhook_template() {
    let (engine, fetch) = common::test_engine().await;

    let context = json!({
        "automation": {"name": "Alert"},
        "computedField": {"value": 42},
    });
    let body = json!({"event": "{{ automation.name }}", "value": "{{ computedField.value }}"});

    let job_id = engine.webhooks.enqueue(1, "https://example.invalid/hook".to_string(), HttpMethod::Post, Default::default(), Some(body), context).await;

    let processed = engine.process_webhooks().await;
    assert_eq!(processed, 1);

    let requests = fetch.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].body, Some(json!({"event": "Alert", "value": "42"})));
    assert_eq!(requests[0].headers.get("Content-Type").map(String::as_str), Some("application/json"));

    let job = engine.webhooks.get_job(job_id).unwrap();
    assert_eq!(job.status, graph_core::webhook::JobStatus::Completed);
}

#[tokio::test]
async fn scenario_6_batching_coalesces_a_burst() {
    let (engine, _fetch) = common::test_engine().await;
    seed_field(&engine, "supertag:task", "Task").await;

    let deliveries = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let deliveries_clone = deliveries.clone();
    let handle = engine
        .subscribe(QueryDefinition::new(vec![Filter::Supertag { id: "supertag:task".to_string(), include_inherited: false }]), move |delta| {
            deliveries_clone.lock().unwrap().push(delta);
        })
        .await
        .unwrap();
    engine.registry.set_debounce_ms(handle.id, 50);

    for i in 0..100 {
        engine.create_node(CreateNodeOptions { content: Some(format!("task {i}")), supertag_system_id: Some("supertag:task".to_string()), ..Default::default() }).await.unwrap();
    }

    tokio::time::sleep(std::time::Duration::from_millis(150)).await;

    let delivered = deliveries.lock().unwrap();
    assert_eq!(delivered.len(), 1, "expected exactly one coalesced delivery, got {}", delivered.len());
    assert_eq!(delivered[0].added.len(), 100);
}
