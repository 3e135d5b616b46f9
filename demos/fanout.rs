//! Distribute one record's updates between a round-robin worker pair and a
//! broadcast viewer group.
//!
//! Run with `cargo run --example fanout`; set `RUST_LOG=debug` to watch the
//! distributor's lifecycle decisions.

use std::time::Duration;

use pvadist::{DistributorRegistry, FieldValue, Record};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let registry = DistributorRegistry::new();
    let record = Record::new(
        "DET:FRAME",
        &[("value", 0i64.into()), ("timeStamp", "t0".into())],
    );

    // Each frame goes to exactly one worker, alternating between them
    for worker in ["worker-1", "worker-2"] {
        let mut sub = record.subscribe_distributed(
            &registry,
            "distributorId:det;groupId:workers;updateMode:0;nUpdatesPerConsumer:1",
        );
        tokio::spawn(async move {
            while let Some(update) = sub.next().await {
                println!("{worker} <- {update:?}");
            }
        });
    }

    // Viewers share a broadcast group: both see the frames their group wins
    for viewer in ["viewer-1", "viewer-2"] {
        let mut sub =
            record.subscribe_distributed(&registry, "distributorId:det;groupId:viewers");
        tokio::spawn(async move {
            while let Some(update) = sub.next().await {
                println!("{viewer} <- {update:?}");
            }
        });
    }

    for frame in 1..=8i64 {
        record.post(&[
            ("value", frame.into()),
            ("timeStamp", format!("t{frame}").into()),
        ]);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
