//! CLI for PullSub
//!
//! Each invocation opens the broker from its snapshot store, runs one
//! command and writes the snapshot back before exiting, so topics,
//! subscriptions and unacknowledged messages carry over between runs.

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use pullsub::broker::OutgoingMessage;
use pullsub::config::load_config;
use pullsub::utils::logging;
use pullsub::Broker;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "pullsub", about = "Topics, subscriptions and pull delivery")]
enum Command {
    /// List all topics
    ListTopics,
    /// Create a new topic
    CreateTopic { topic: String },
    /// Delete an existing topic
    DeleteTopic {
        topic: String,
        /// Also delete the topic's subscriptions
        #[arg(long)]
        cascade: bool,
    },
    /// List subscriptions, optionally only those attached to one topic
    ListSubscriptions {
        #[arg(long)]
        topic: Option<String>,
    },
    /// Create a new pull subscription on a topic
    CreateSubscription {
        subscription: String,
        topic: String,
        /// Ack deadline in seconds (defaults to broker.ack_deadline_secs)
        #[arg(long)]
        ack_deadline: Option<u64>,
    },
    /// Delete an existing subscription
    DeleteSubscription { subscription: String },
    /// Publish one message per MESSAGE argument
    Publish {
        topic: String,
        #[arg(required = true)]
        messages: Vec<String>,
        /// Attribute attached to every message, as key=value (repeatable)
        #[arg(long = "attr", value_parser = parse_attribute)]
        attributes: Vec<(String, String)>,
    },
    /// Receive messages, print them and acknowledge them
    Receive {
        subscription: String,
        /// Upper bound per pull
        #[arg(long, default_value_t = 10)]
        max_messages: usize,
        /// Seconds to keep listening
        #[arg(long, default_value_t = 30)]
        timeout: u64,
        /// Leave messages unacknowledged so they are redelivered
        #[arg(long)]
        no_ack: bool,
    },
    /// Show queue counters for a subscription
    Stats { subscription: String },
}

fn parse_attribute(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got {raw:?}")),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cmd = Command::parse();
    dotenvy::dotenv().ok();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    logging::init(&settings.logging.level);

    let broker = match Broker::from_settings(&settings) {
        Ok(broker) => Arc::new(broker),
        Err(e) => {
            error!("Failed to open broker: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let sweeper = broker.spawn_lease_sweeper();

    let result = run(&broker, cmd).await;

    if let Err(e) = broker.shutdown() {
        error!("Shutdown failed: {}", e);
    }
    let _ = sweeper.await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Command failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(broker: &Broker, cmd: Command) -> Result<(), Box<dyn std::error::Error>> {
    match cmd {
        Command::ListTopics => {
            for topic in broker.list_topics() {
                println!("{topic}");
            }
        }
        Command::CreateTopic { topic } => {
            broker.create_topic(&topic)?;
            println!("Created topic: {topic}");
        }
        Command::DeleteTopic { topic, cascade } => {
            broker.delete_topic(&topic, cascade)?;
            println!("Topic deleted: {topic}");
        }
        Command::ListSubscriptions { topic } => {
            let names = match topic {
                Some(topic) => broker.list_topic_subscriptions(&topic)?,
                None => broker.list_subscriptions(),
            };
            for name in names {
                println!("{name}");
            }
        }
        Command::CreateSubscription {
            subscription,
            topic,
            ack_deadline,
        } => {
            let ack_deadline = ack_deadline
                .map(Duration::from_secs)
                .unwrap_or_else(|| broker.settings().ack_deadline());
            broker.create_subscription(&subscription, &topic, ack_deadline)?;
            println!("Subscription created: {subscription}");
        }
        Command::DeleteSubscription { subscription } => {
            broker.delete_subscription(&subscription)?;
            println!("Subscription deleted: {subscription}");
        }
        Command::Publish {
            topic,
            messages,
            attributes,
        } => {
            let attributes: HashMap<String, String> = attributes.into_iter().collect();
            let batch = messages
                .into_iter()
                .map(|payload| OutgoingMessage {
                    payload: payload.into_bytes(),
                    attributes: attributes.clone(),
                })
                .collect();
            let ids = broker.publish_batch(&topic, batch)?;
            for id in &ids {
                println!("Published message ID: {id}");
            }
            println!("Published {} message(s) to {topic}.", ids.len());
        }
        Command::Receive {
            subscription,
            max_messages,
            timeout,
            no_ack,
        } => {
            receive(broker, &subscription, max_messages, Duration::from_secs(timeout), no_ack)
                .await?;
        }
        Command::Stats { subscription } => {
            let stats = broker.subscription_stats(&subscription)?;
            println!("pending: {}", stats.pending);
            println!("outstanding messages: {}", stats.outstanding_messages);
            println!("outstanding bytes: {}", stats.outstanding_bytes);
            println!("dead-lettered: {}", stats.dead_lettered);
        }
    }
    Ok(())
}

async fn receive(
    broker: &Broker,
    subscription: &str,
    max_messages: usize,
    timeout: Duration,
    no_ack: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    info!(subscription, timeout_secs = timeout.as_secs(), "listening for messages");
    let deadline = Instant::now() + timeout;
    let mut received = 0usize;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() || cancel.is_cancelled() {
            break;
        }
        let batch = broker
            .pull_wait(subscription, max_messages, remaining, &cancel)
            .await?;
        for msg in batch {
            println!(
                "Received message {} (delivery {}): {}",
                msg.message_id(),
                msg.delivery_count,
                msg.message.payload_str()
            );
            if !msg.attributes().is_empty() {
                println!("Attributes:");
                let mut attrs: Vec<_> = msg.attributes().iter().collect();
                attrs.sort();
                for (key, value) in attrs {
                    println!("  {key}: {value}");
                }
            }
            if !no_ack {
                broker.ack(subscription, &msg.lease_id)?;
            }
            received += 1;
        }
    }
    println!("Received {received} message(s) from {subscription}.");
    Ok(())
}
