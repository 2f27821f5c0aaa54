use anyhow::Result;
use mq_exchange::{
    cli::Scenario,
    results::ResultsManager,
    scenario::{RuleConfig, ScenarioConfig, ScenarioRunner},
    ConnectionDescriptor, Deadline, DrainError, ExchangeClient, ExchangeConfig,
    LoopbackQueueManager,
};
use std::sync::Arc;
use std::time::Duration;

const REQUESTS: &str = "DEV.QUEUE.1";
const REPLIES: &str = "DEV.QUEUE.2";
const DRAIN: &str = "DEV.QUEUE.3";

async fn client_for(qm: &LoopbackQueueManager) -> Result<Arc<ExchangeClient>> {
    let client = ExchangeClient::connect(
        Arc::new(qm.clone()),
        ConnectionDescriptor::new("QM1", "localhost", 1414, "DEV.APP.SVRCONN"),
        ExchangeConfig {
            wait_interval: Duration::from_millis(250),
            ..Default::default()
        },
        Deadline::none(),
    )
    .await?;
    Ok(Arc::new(client))
}

/// A concurrent round-trip run with simulated replies matches every
/// exchange and writes a results file.
#[tokio::test]
async fn round_trip_scenario_writes_results() -> Result<()> {
    let qm = LoopbackQueueManager::with_queues("QM1", [REQUESTS, REPLIES]);
    let client = client_for(&qm).await?;

    let mut config = ScenarioConfig::round_trip(REQUESTS, REPLIES, "<Ping/>");
    config.simulate_reply = true;
    config.expected_reply = "Reply Message".to_string();
    config.iterations = Some(10);
    config.concurrency = 3;

    let results = ScenarioRunner::new(Arc::clone(&client), config).run().await?;
    client.shutdown().await;

    let metrics = results.metrics.as_ref().expect("round trip records metrics");
    assert_eq!(metrics.outcomes.matched, 30);
    assert_eq!(metrics.outcomes.errors(), 0);
    assert_eq!(results.total_processed(), 30);
    assert!(results.drain.is_none());
    assert_eq!(qm.opens_for(REQUESTS, mq_exchange::transport::OpenMode::Output), 1);

    let output = tempfile::NamedTempFile::new()?;
    let mut manager = ResultsManager::new(output.path())?;
    manager.add_results(results);
    manager.finalize()?;

    let written: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(output.path())?)?;
    assert_eq!(written["metadata"]["total_runs"], 1);
    assert_eq!(written["summary"]["total_processed"], 30);
    assert_eq!(written["summary"]["total_matched"], 30);
    assert_eq!(written["results"][0]["scenario"], "round-trip");
    assert_eq!(written["results"][0]["system_info"]["transport"], "loopback");
    Ok(())
}

/// Without a simulated reply every exchange times out, which is still a
/// successful run.
#[tokio::test]
async fn unanswered_round_trips_time_out() -> Result<()> {
    let qm = LoopbackQueueManager::with_queues("QM1", [REQUESTS, REPLIES]);
    let client = client_for(&qm).await?;

    let mut config = ScenarioConfig::round_trip(REQUESTS, REPLIES, "<Ping/>");
    config.iterations = Some(3);

    let results = ScenarioRunner::new(client, config).run().await?;
    let metrics = results.metrics.expect("metrics");
    assert_eq!(metrics.outcomes.timed_out, 3);
    assert_eq!(metrics.outcomes.matched, 0);
    assert_eq!(qm.depth(REQUESTS), 3);
    Ok(())
}

/// A mismatched reply stops the run unless errors are tolerated.
#[tokio::test]
async fn mismatch_fails_run_unless_tolerated() -> Result<()> {
    let qm = LoopbackQueueManager::with_queues("QM1", [REQUESTS, REPLIES]);
    let client = client_for(&qm).await?;

    let mut config = ScenarioConfig::round_trip(REQUESTS, REPLIES, "<Ping/>");
    config.simulate_reply = true;
    config.expected_reply = "Something Else".to_string();
    config.iterations = Some(4);

    let err = ScenarioRunner::new(Arc::clone(&client), config.clone())
        .run()
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("unexpected reply content"));

    config.continue_on_error = true;
    let results = ScenarioRunner::new(client, config).run().await?;
    let metrics = results.metrics.as_ref().expect("metrics");
    assert_eq!(metrics.outcomes.mismatched, 4);
    assert_eq!(results.error_count(), 4);
    Ok(())
}

/// A validate run preloads its queue, then judges every message.
#[tokio::test]
async fn validate_scenario_tallies_preloaded_messages() -> Result<()> {
    let qm = LoopbackQueueManager::with_queues("QM1", [DRAIN, REPLIES]);
    let client = client_for(&qm).await?;

    let rule = RuleConfig {
        filter_xpath: String::new(),
        filter_value: String::new(),
        xpath: "/Message/Id".to_string(),
        value: "1".to_string(),
    };
    let mut config = ScenarioConfig::drain(DRAIN, Some(rule));
    config.preload = 7;
    assert_eq!(config.scenario, Scenario::Validate);

    let results = ScenarioRunner::new(client, config).run().await?;
    assert_eq!(results.preloaded, 7);
    let tally = results.drain.expect("drain tally");
    assert_eq!(tally.consumed, 7);
    assert_eq!(tally.matched, 7);
    assert_eq!(tally.unmatched, 0);
    assert_eq!(qm.depth(DRAIN), 0);
    Ok(())
}

/// A failing drain scenario exposes the partial tally through the error.
#[tokio::test]
async fn drain_scenario_error_keeps_tally() -> Result<()> {
    let qm = LoopbackQueueManager::with_queues("QM1", [DRAIN, REPLIES]);
    let client = client_for(&qm).await?;
    qm.inject(DRAIN, Default::default(), "first");
    qm.inject(DRAIN, Default::default(), vec![b'x'; 128 * 1024]);

    let err = ScenarioRunner::new(client, ScenarioConfig::drain(DRAIN, None))
        .run()
        .await
        .unwrap_err();
    let drain_error = err
        .downcast_ref::<DrainError>()
        .expect("drain failures keep their tally");
    assert_eq!(drain_error.tally.consumed, 1);
    Ok(())
}
