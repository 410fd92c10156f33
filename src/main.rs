use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

use clinic_automation::AppState;
use clinic_automation::clock::SystemClock;
use clinic_automation::config::AppConfig;
use clinic_automation::dispatch;
use clinic_automation::llm::OpenAiClient;
use clinic_automation::models::payloads::IncomingEvent;
use clinic_automation::queue::RedisJobQueue;
use clinic_automation::store::PgStore;
use clinic_automation::sweeper;
use clinic_automation::webhook::HttpWebhookSink;

const PROMOTE_EVERY: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting clinic automation worker...");

    let config = AppConfig::from_env().context("DATABASE_URL must be set")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to Postgres")?;
    info!("Connected to Postgres.");

    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let redis_conn = redis_client.get_multiplexed_async_connection().await?;
    info!("Connected to Redis.");

    let jobs = Arc::new(RedisJobQueue::new(
        redis_conn.clone(),
        &config.jobs_stream,
        &config.delayed_jobs_key,
    ));

    let state = Arc::new(AppState {
        store: Arc::new(PgStore::new(pool)),
        queue: jobs.clone(),
        llm: Arc::new(OpenAiClient::new(
            &config.llm_api_url,
            config.llm_api_key.clone(),
            config.http_timeout,
        )?),
        webhooks: Arc::new(HttpWebhookSink::new(config.http_timeout)?),
        clock: Arc::new(SystemClock),
        settings: config.engine.clone(),
    });

    // Attempt to create the consumer group, ignore if it already exists
    let _ = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(&config.incoming_stream)
        .arg(&config.consumer_group)
        .arg("$")
        .arg("MKSTREAM")
        .query_async::<()>(&mut redis_conn.clone())
        .await;

    tokio::spawn(sweeper::run(state.clone(), config.sweep_interval));
    tokio::spawn(promote_delayed_jobs(jobs));

    info!(
        stream = config.incoming_stream,
        group = config.consumer_group,
        "Listening for incoming events on Redis stream"
    );

    consume(state, redis_conn, &config).await
}

async fn promote_delayed_jobs(jobs: Arc<RedisJobQueue>) {
    loop {
        tokio::time::sleep(PROMOTE_EVERY).await;
        if let Err(e) = jobs.promote_due_jobs(Utc::now()).await {
            error!(error = %e, "Failed to promote delayed jobs");
        }
    }
}

async fn consume(
    state: Arc<AppState>,
    mut redis: MultiplexedConnection,
    config: &AppConfig,
) -> Result<()> {
    let opts = StreamReadOptions::default()
        .group(&config.consumer_group, &config.consumer_name)
        .block(5000)
        .count(10);

    loop {
        let result: redis::RedisResult<StreamReadReply> = redis
            .xread_options(&[&config.incoming_stream], &[">"], &opts)
            .await;

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                error!(error = %e, "Error reading from Redis Stream");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        for stream in reply.keys {
            for message in stream.ids {
                match parse_event(&message.map) {
                    Some(event) => {
                        let spawn_state = state.clone();
                        tokio::spawn(async move {
                            if let Err(e) = dispatch::handle_event(spawn_state, event).await {
                                error!(error = %e, "Failed to handle incoming event");
                            }
                        });
                    }
                    None => warn!(stream_id = %message.id, "Dropping unreadable event"),
                }

                // ACK even unreadable entries to avoid a poison pill
                let _: redis::RedisResult<()> = redis
                    .xack(&stream.key, &config.consumer_group, &[&message.id])
                    .await;
            }
        }
    }
}

fn parse_event(map: &std::collections::HashMap<String, redis::Value>) -> Option<IncomingEvent> {
    let raw = map.get("payload")?;
    let payload = redis::from_redis_value::<String>(raw).ok()?;
    match serde_json::from_str::<IncomingEvent>(&payload) {
        Ok(event) => Some(event),
        Err(e) => {
            error!(payload, error = %e, "Failed to parse payload");
            None
        }
    }
}
