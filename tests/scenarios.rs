//! End-to-end scenarios spanning multiple modules, mirroring the narrative
//! scenarios used to validate the kernel's behavior as a whole rather than
//! one subsystem in isolation.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use eventkernel::broadcast::{InMemoryBroadcastAdapter, InMemoryBroadcastHub};
use eventkernel::dispatcher::SliceMode;
use eventkernel::store::InMemoryStore;
use eventkernel::task::HandlerFn;
use eventkernel::{
    BroadcastOptions, DependencyDispatcher, DispatcherConfig, EventBus, EventBusConfig,
    EventContext, TaskOptions,
};

/// S5: a broadcast published with `exclude_self=true` is delivered exactly
/// once on the remote node and not at all back on the originating node.
#[tokio::test]
async fn s5_broadcast_excludes_origin_and_reaches_peer() {
    let hub = InMemoryBroadcastHub::new();

    let bus_a = Arc::new(EventBus::new(
        Arc::new(InMemoryStore::new()),
        EventBusConfig {
            node_id: Some("node-a".to_string()),
            ..Default::default()
        },
    ));
    let bus_b = Arc::new(EventBus::new(
        Arc::new(InMemoryStore::new()),
        EventBusConfig {
            node_id: Some("node-b".to_string()),
            ..Default::default()
        },
    ));

    bus_a.add_broadcast_adapter(Arc::new(InMemoryBroadcastAdapter::new(hub.clone())));
    bus_b.add_broadcast_adapter(Arc::new(InMemoryBroadcastAdapter::new(hub.clone())));

    let a_local_calls = Arc::new(AtomicU32::new(0));
    let a_local_calls2 = a_local_calls.clone();
    bus_a
        .on(
            "order.created",
            Arc::new(move |_ctx, _sig| {
                let calls = a_local_calls2.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(serde_json::json!("local"))
                })
            }),
            1,
        )
        .unwrap();

    let b_remote_calls = Arc::new(AtomicU32::new(0));
    let b_remote_calls2 = b_remote_calls.clone();
    bus_b
        .on(
            "order.created",
            Arc::new(move |_ctx, _sig| {
                let calls = b_remote_calls2.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(serde_json::json!("remote"))
                })
            }),
            1,
        )
        .unwrap();

    bus_b
        .subscribe_broadcast(&["orders".to_string()])
        .await
        .unwrap();
    // Let the spawned forwarding task register its hub subscription.
    tokio::task::yield_now().await;

    let ctx = EventContext::new("order.created", serde_json::json!({"sku": "widget"}));
    let opts = BroadcastOptions {
        channels: vec!["orders".to_string()],
        exclude_self: true,
    };
    bus_a
        .broadcast("order.created", ctx, Some(opts), None, None)
        .await
        .unwrap();

    // Give bus_b's forwarding task a chance to drain the inbound message.
    for _ in 0..20 {
        if b_remote_calls.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::task::yield_now().await;
    }

    assert_eq!(a_local_calls.load(Ordering::SeqCst), 1);
    assert_eq!(b_remote_calls.load(Ordering::SeqCst), 1);
}

/// S6: a diamond-shaped dependency graph executes ancestors before
/// descendants and resolves every node's result through one `run_all`.
#[tokio::test]
async fn s6_dag_diamond_resolves_all_nodes() {
    let dispatcher = DependencyDispatcher::new(DispatcherConfig::default());
    dispatcher.add("fetch_user", vec![]);
    dispatcher.add("fetch_orders", vec!["fetch_user".to_string()]);
    dispatcher.add("fetch_invoices", vec!["fetch_user".to_string()]);
    dispatcher.add(
        "summarize",
        vec!["fetch_orders".to_string(), "fetch_invoices".to_string()],
    );

    dispatcher.handle(
        "fetch_user",
        Arc::new(|_p, _sig| Box::pin(async move { Ok(serde_json::json!({"id": 7})) })),
        TaskOptions::default(),
    );
    dispatcher.handle(
        "fetch_orders",
        Arc::new(|payload, _sig| {
            Box::pin(async move {
                let user = payload.get("fetch_user").cloned().unwrap_or_default();
                Ok(serde_json::json!({"orders_for": user}))
            })
        }),
        TaskOptions::default(),
    );
    dispatcher.handle(
        "fetch_invoices",
        Arc::new(|payload, _sig| {
            Box::pin(async move {
                let user = payload.get("fetch_user").cloned().unwrap_or_default();
                Ok(serde_json::json!({"invoices_for": user}))
            })
        }),
        TaskOptions::default(),
    );
    dispatcher.handle(
        "summarize",
        Arc::new(|payload, _sig| {
            Box::pin(async move {
                let has_orders = payload.get("fetch_orders").is_some();
                let has_invoices = payload.get("fetch_invoices").is_some();
                Ok(serde_json::json!({"ready": has_orders && has_invoices}))
            })
        }),
        TaskOptions::default(),
    );

    let results = dispatcher.run_all(None, SliceMode::Upstream).await.unwrap();
    assert_eq!(results.len(), 4);
    assert_eq!(results["summarize"], serde_json::json!({"ready": true}));
}

/// S7: a non-retryable handler failure lands in the dead-letter queue; once
/// requeued against a now-healthy handler, the DLQ clears.
#[tokio::test]
async fn s7_dlq_requeue_end_to_end() {
    let store = Arc::new(InMemoryStore::new());
    let bus = Arc::new(EventBus::new(store.clone(), EventBusConfig::default()));

    let healthy = Arc::new(AtomicBool::new(false));
    let healthy2 = healthy.clone();
    let handler: HandlerFn<EventContext, serde_json::Value> = Arc::new(move |_ctx, _sig| {
        let healthy = healthy2.clone();
        Box::pin(async move {
            if healthy.load(Ordering::SeqCst) {
                Ok(serde_json::json!({"charged": true}))
            } else {
                Err("payment gateway unreachable".to_string())
            }
        })
    });
    bus.on("payment.requested", handler, 1).unwrap();

    let mut opts = TaskOptions::default();
    opts.is_retryable = Arc::new(|_| false);

    let ctx = EventContext::new("payment.requested", serde_json::json!({"amount": 4200}));
    let trace_id = ctx.trace_id.clone();

    let results = bus
        .emit("payment.requested", ctx.clone(), Some(opts), None)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].error.is_some());

    let dlq_records = eventkernel::dlq::list_dlq(store.as_ref(), Some(&trace_id))
        .await
        .unwrap();
    assert_eq!(dlq_records.len(), 1);

    healthy.store(true, Ordering::SeqCst);

    let bus_for_emitter = bus.clone();
    let emitter: eventkernel::dlq::Emitter = Box::new(move |name, ctx| {
        let bus = bus_for_emitter.clone();
        Box::pin(async move { bus.emit(&name, ctx, None, None).await.map_err(|e| e.to_string()) })
    });

    let requeued = eventkernel::dlq::requeue_dlq(
        store.as_ref(),
        &trace_id,
        &dlq_records[0].id,
        ctx,
        &emitter,
    )
    .await
    .unwrap();
    assert_eq!(requeued.len(), 1);
    assert!(requeued[0].error.is_none());

    let remaining = eventkernel::dlq::list_dlq(store.as_ref(), Some(&trace_id))
        .await
        .unwrap();
    assert!(remaining.is_empty());
}

/// Invariant 1: under default `EmitOptions`, N registered handlers always
/// produce exactly N results, each tagged with its registration index.
#[tokio::test]
async fn invariant1_handler_count_matches_result_count() {
    let bus = EventBus::new(Arc::new(InMemoryStore::new()), EventBusConfig::default());
    for i in 0..5 {
        bus.on(
            "fanout",
            Arc::new(move |_ctx, _sig| Box::pin(async move { Ok(serde_json::json!(i)) })),
            1,
        )
        .unwrap();
    }
    let ctx = EventContext::new("fanout", serde_json::json!({}));
    let results = bus.emit("fanout", ctx, None, None).await.unwrap();
    assert_eq!(results.len(), 5);
    for (i, r) in results.iter().enumerate() {
        assert_eq!(r.handler_index, i);
    }
}
