// tests/queue_test.rs
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use emit::config::{ConfigManager, MapConfigManager, QUEUE_KEY, RouterConfig, STRATEGY_KEY};
use emit::node::{NodeError, NodeSpec, Output};
use emit::router::queue::{JobStatus, QueueInvoker, QueueOptions};
use emit::router::Router;
use emit::{Message, tuple};
use serde_json::json;

fn word_graph(router: &Router) -> Arc<DashMap<String, u64>> {
    let counts = Arc::new(DashMap::new());
    router
        .register(NodeSpec::new("graph.words", ["word"]).entry_point(), |msg| {
            let words: Vec<String> = msg
                .get_str("document")?
                .split_whitespace()
                .map(str::to_string)
                .collect();
            Ok(Output::yielding(words))
        })
        .unwrap();

    let sink = counts.clone();
    router
        .register(
            NodeSpec::new("graph.count_word", ["word", "count"]).subscribe("graph.words"),
            move |msg| {
                let word = msg.get_str("word")?.to_string();
                let mut count = sink.entry(word.clone()).or_insert(0u64);
                *count += 1;
                Ok(tuple!(word, *count).into())
            },
        )
        .unwrap();
    counts
}

#[tokio::test(flavor = "multi_thread")]
async fn test_queue_runs_the_whole_graph() {
    let invoker = Arc::new(QueueInvoker::new(QueueOptions::default()));
    let worker = invoker.worker("default");
    let router = Arc::new(Router::builder().invoker(invoker.clone()).build());
    let counts = word_graph(&router);

    let handle = tokio::spawn(worker.run(router.clone()));

    router
        .call(Message::from_pairs([("document", json!("got two words got"))]))
        .unwrap();
    assert!(invoker.wait_idle(Duration::from_secs(5)).await);

    assert_eq!(counts.get("got").map(|c| *c), Some(2));
    assert_eq!(counts.get("two").map(|c| *c), Some(1));

    let jobs = invoker.jobs();
    // one job for the entry point, one per word
    assert_eq!(jobs.len(), 5);
    assert!(jobs.iter().all(|j| j.status == JobStatus::Finished));
    assert_eq!(jobs[0].destination, "graph.words");
    assert_eq!(jobs[0].origin, "__entry_point");
    assert_eq!(jobs[0].produced.len(), 4);

    invoker.close("default");
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_job_is_recorded() {
    let invoker = Arc::new(QueueInvoker::new(QueueOptions::default()));
    let worker = invoker.worker("default");
    let router = Arc::new(Router::builder().invoker(invoker.clone()).build());
    router
        .register(NodeSpec::new("broken", ["x"]).entry_point(), |_| {
            Err(NodeError::ExecutionFailed("no luck".into()))
        })
        .unwrap();

    let handle = tokio::spawn(worker.run(router.clone()));

    // enqueueing succeeds, the failure belongs to the job
    router.call(Message::empty()).unwrap();
    assert!(invoker.wait_idle(Duration::from_secs(5)).await);

    let jobs = invoker.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert!(jobs[0].error.as_deref().unwrap_or_default().contains("no luck"));

    invoker.close("default");
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_job_timeout() {
    let invoker = Arc::new(QueueInvoker::new(QueueOptions::default()));
    invoker.set_options(
        "slow",
        QueueOptions::default().timeout(Duration::from_millis(50)),
    );
    let worker = invoker.worker("default");
    let router = Arc::new(Router::builder().invoker(invoker.clone()).build());
    router
        .register(NodeSpec::new("slow", ["x"]).entry_point(), |_| {
            std::thread::sleep(Duration::from_millis(500));
            Ok(Output::no_result())
        })
        .unwrap();

    let handle = tokio::spawn(worker.run(router.clone()));
    router.call(Message::empty()).unwrap();
    assert!(invoker.wait_idle(Duration::from_secs(5)).await);

    let jobs = invoker.jobs();
    assert_eq!(jobs[0].status, JobStatus::TimedOut);

    invoker.close("default");
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timed_out_job_still_dispatches_but_keeps_its_status() {
    let invoker = Arc::new(QueueInvoker::new(QueueOptions::default()));
    invoker.set_options(
        "slow",
        QueueOptions::default().timeout(Duration::from_millis(50)),
    );
    let worker = invoker.worker("default");
    let router = Arc::new(Router::builder().invoker(invoker.clone()).build());
    router
        .register(NodeSpec::new("slow", ["x"]).entry_point(), |_| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(Output::value(1))
        })
        .unwrap();
    router
        .register(NodeSpec::new("after", ["y"]).subscribe("^slow$"), |_| {
            Ok(Output::no_result())
        })
        .unwrap();

    let handle = tokio::spawn(worker.run(router.clone()));
    router.call(Message::empty()).unwrap();
    assert!(invoker.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(invoker.jobs().len(), 1);

    // the body finishes after the worker gave up on it
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(invoker.wait_idle(Duration::from_secs(5)).await);

    let jobs = invoker.jobs();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].destination, "slow");
    assert_eq!(jobs[0].status, JobStatus::TimedOut);
    assert!(jobs[0].produced.is_empty());
    assert_eq!(jobs[1].destination, "after");
    assert_eq!(jobs[1].origin, "slow");
    assert_eq!(jobs[1].status, JobStatus::Finished);

    invoker.close("default");
    handle.await.unwrap();
}

#[tokio::test]
async fn test_nodes_can_be_pinned_to_other_queues() {
    let invoker = Arc::new(QueueInvoker::new(QueueOptions::default()));
    invoker.set_options("pinned", QueueOptions::default().queue("side"));
    let _default = invoker.worker("default");
    let router = Router::builder().invoker(invoker.clone()).build();
    router
        .register(NodeSpec::new("pinned", ["x"]).entry_point(), |_| Ok(Output::no_result()))
        .unwrap();

    let err = router.call(Message::empty()).unwrap_err();
    assert!(err.to_string().contains("\"side\""));

    let _side = invoker.worker("side");
    router.call(Message::empty()).unwrap();
    assert_eq!(invoker.jobs()[0].queue, "side");
    assert_eq!(invoker.pending(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_router_from_config_with_queue_strategy() {
    let config = ConfigManager(MapConfigManager::from_pairs([
        (STRATEGY_KEY, "queue"),
        (QUEUE_KEY, "words"),
    ]));
    let parts = RouterConfig::load(&config).await.unwrap().build();
    let counts = word_graph(&parts.router);
    let queue = parts.queue.unwrap();
    let handle = tokio::spawn(parts.worker.unwrap().run(parts.router.clone()));

    parts
        .router
        .call(Message::from_pairs([("document", json!("a b a"))]))
        .unwrap();
    assert!(queue.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(counts.get("a").map(|c| *c), Some(2));

    queue.close("words");
    handle.await.unwrap();
}
