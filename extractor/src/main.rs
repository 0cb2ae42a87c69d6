mod gate;
mod persist;
mod pipeline;

use frame_extract_common::config::{Config, KafkaConfig, Transport};
use frame_extract_common::frame::ImageFrame;
use futures_util::StreamExt;
use gate::FrameGate;
use persist::Persister;
use pipeline::{Extractor, StopReason};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::ClientConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const DEFAULT_IMAGE_TOPIC: &str = "image";

#[tokio::main]
async fn main() {
    // Usage: extract-images [config.toml] [raw|compressed]
    let mut args = std::env::args().skip(1);
    let config_path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let mut config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    if let Some(arg) = args.next() {
        match arg.parse::<Transport>() {
            Ok(t) => config.kafka.transport = t,
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(1);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        brokers = %config.kafka.brokers,
        image_topic = %config.kafka.image_topic,
        unlock_topic = %config.kafka.unlock_topic,
        transport = ?config.kafka.transport,
        filename_format = %config.extract.filename_format,
        output = ?config.extract.output,
        "starting extract-images"
    );

    if config.kafka.image_topic == DEFAULT_IMAGE_TOPIC {
        warn!(
            "image topic has not been remapped; set kafka.image_topic to the camera's topic \
             (usage: extract-images <config.toml> [transport])"
        );
    }

    let persister = match Persister::from_config(&config.extract) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "invalid output configuration");
            std::process::exit(1);
        }
    };
    match &persister {
        Persister::Images(writer) => {
            info!(template = %writer.template(), "writing admitted frames as image files");
        }
        Persister::Video(video) => {
            persist::video::check_ffmpeg_available().await;
            info!(
                path = %config.extract.video_path.display(),
                fps = video.fps(),
                "writing admitted frames to video"
            );
        }
    }

    let gate = Arc::new(
        FrameGate::new(config.extract.min_interval(), config.extract.key_lock)
            .requiring_rgb(persister.needs_rgb()),
    );
    info!(
        sec_per_frame = gate.min_interval().as_secs_f64(),
        key_lock = gate.key_lock(),
        require_rgb = persister.needs_rgb(),
        "initialized frame gate"
    );

    let image_consumer =
        match create_consumer(&config.kafka, &config.kafka.group_id, &config.kafka.image_topic) {
            Ok(c) => c,
            Err(e) => {
                error!(
                    error = %e,
                    topic = %config.kafka.image_topic,
                    "failed to subscribe to image topic"
                );
                std::process::exit(1);
            }
        };
    let unlock_group = format!("{}-unlock", config.kafka.group_id);
    let unlock_consumer =
        match create_consumer(&config.kafka, &unlock_group, &config.kafka.unlock_topic) {
            Ok(c) => c,
            Err(e) => {
                error!(
                    error = %e,
                    topic = %config.kafka.unlock_topic,
                    "failed to subscribe to unlock topic"
                );
                std::process::exit(1);
            }
        };

    let mut extractor = Extractor::new(gate, Arc::new(persister));

    let unlock_gate = Arc::clone(extractor.gate());
    tokio::spawn(async move {
        run_unlock_loop(unlock_consumer, unlock_gate).await;
    });
    let transport = config.kafka.transport;

    let frames = image_consumer
        .stream()
        .filter_map(|result| std::future::ready(decode_message(result, transport)));
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
        }
    };

    info!("entering main consumption loop");
    match extractor.run(frames, shutdown).await {
        StopReason::Shutdown => info!("shutdown requested"),
        StopReason::StreamEnded => warn!("image stream ended"),
    }

    extractor.shutdown().await;
}

fn create_consumer(
    kafka: &KafkaConfig,
    group_id: &str,
    topic: &str,
) -> Result<StreamConsumer, KafkaError> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &kafka.brokers)
        .set("group.id", group_id)
        .set("auto.offset.reset", "latest")
        .set("enable.auto.commit", "true")
        .set("auto.commit.interval.ms", "1000")
        .set("max.partition.fetch.bytes", "10485760")
        .create()?;
    consumer.subscribe(&[topic])?;
    info!(topic, group_id, "subscribed to Kafka topic");
    Ok(consumer)
}

/// Turn one Kafka delivery into a frame, logging and dropping anything that
/// does not decode.
fn decode_message(
    result: Result<BorrowedMessage<'_>, KafkaError>,
    transport: Transport,
) -> Option<ImageFrame> {
    let msg = match result {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, "Kafka consume error");
            return None;
        }
    };
    let Some(payload) = msg.payload() else {
        debug!("empty Kafka message, skipping");
        return None;
    };
    match ImageFrame::from_payload(payload, transport) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(error = %e, offset = msg.offset(), "failed to decode frame, skipping");
            None
        }
    }
}

/// Every message on the unlock topic reopens the gate; the payload is ignored.
async fn run_unlock_loop(consumer: StreamConsumer, gate: Arc<FrameGate>) {
    let mut stream = consumer.stream();

    while let Some(result) = stream.next().await {
        match result {
            Ok(_) => {
                let was_locked = gate.on_unlock();
                debug!(was_locked, "unlock received");
            }
            Err(e) => {
                warn!(error = %e, "Kafka consume error on unlock topic");
            }
        }
    }
    warn!("unlock stream ended");
}
