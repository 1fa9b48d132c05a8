//! Embedded pub/sub example with multi-destination fan-out
//!
//! Run with: cargo run --example embedded_pubsub
//!
//! Launches the in-process driver, creates a manual multi-destination
//! publication fanning out to two endpoints, and drives 100 messages through
//! both subscriptions.

use std::time::Duration;

use logbus::{Client, ClientConfig, DriverConfig, MediaDriver, OfferError};

const STREAM_ID: i32 = 1001;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("logbus=debug".parse()?),
        )
        .init();

    let driver = MediaDriver::launch(DriverConfig::default());
    let client = Client::connect(ClientConfig::default(), driver.add_client());

    let sub1_reg = client.add_subscription("bus:mem?endpoint=alpha", STREAM_ID)?;
    let sub2_reg = client.add_subscription("bus:mem?endpoint=beta", STREAM_ID)?;
    let pub_reg = client.add_publication("bus:mem?control-mode=manual|tags=1,2", STREAM_ID)?;

    let sub1 = loop {
        if let Some(sub) = client.find_subscription(sub1_reg)? {
            break sub;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    };
    let sub2 = loop {
        if let Some(sub) = client.find_subscription(sub2_reg)? {
            break sub;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    };
    let publication = loop {
        if let Some(publication) = client.find_publication(pub_reg)? {
            break publication;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    };

    // fan out to both endpoints
    for channel in ["bus:mem?endpoint=alpha", "bus:mem?endpoint=beta"] {
        let correlation_id = publication.add_destination(channel)?;
        loop {
            match publication.find_destination_response(correlation_id)? {
                Some(()) => break,
                None => tokio::time::sleep(Duration::from_millis(1)).await,
            }
        }
        println!("destination attached: {}", channel);
    }

    while !(sub1.is_connected() && sub2.is_connected()) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let mut sent = 0u32;
    while sent < 100 {
        let payload = format!("message {}", sent);
        match publication.offer(payload.as_bytes()) {
            Ok(_) => sent += 1,
            Err(OfferError::BackPressured) | Err(OfferError::AdminAction) => {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            Err(e) => return Err(Box::new(e) as Box<dyn std::error::Error>),
        }
    }
    println!("offered {} messages at position {}", sent, publication.position());

    let mut received = [0usize; 2];
    while received[0] < 100 || received[1] < 100 {
        received[0] += sub1.poll(&mut |_payload, _header| {}, 16);
        received[1] += sub2.poll(&mut |_payload, _header| {}, 16);
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    println!(
        "alpha received {} messages, beta received {}",
        received[0], received[1]
    );

    Ok(())
}
