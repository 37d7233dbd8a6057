mod cache;
mod config;
mod ingest;
mod message;
mod store;
mod subscriber;
mod util;
mod web;

use crate::{cache::LatestReading, config::Config, ingest::Pipeline, web::AppState};

use anyhow::Context;
use clap::{App, Arg};
use futures::future::try_join;
use indoc::indoc;
use log::{info, warn};
use tokio::{
    sync,
    time::{sleep, Duration, Instant},
};

fn main() -> anyhow::Result<()> {
    let cmd = App::new("lixo-telemetry")
        .version("0.1")
        .about("Collect waste-bin fill levels from MQTT and serve them over HTTP")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .help("Sets custom config file location")
                .long_help(indoc!(
                    "Sets custom config file location, default to read config.yaml if present
                    The custom config must be a file of YAML 1.2 format.
                    The following configuration sections are supported:
                    http: optional, bind address, port (3000) and history_limit (50)
                    broker: required, MQTT host, port (8883), tls, username, password,
                        topic (esp32/sensores/cacambas), qos, keep_alive, reconnect_delay
                    store: optional, either Memory or Postgres with the connection settings
                    Environment variables PORT, HIVEMQ_URL, HIVEMQ_USER, HIVEMQ_PASS, TOPIC,
                    PGHOST, PGPORT, PGUSER, PGPASSWORD and PGDATABASE override the file.
                    "
                ))
                .value_name("FILE")
                .takes_value(true),
        )
        .get_matches();
    env_logger::init();

    let config = match cmd.value_of("config") {
        Some(path) => Config::load(path, true)?,
        None => Config::load("config.yaml", false)?,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build async runtime")?;

    let (termination_sender, mut termination_receiver) = sync::broadcast::channel(1);
    let subscriber_termination = termination_sender.subscribe();
    let web_termination = termination_sender.subscribe();
    ctrlc::set_handler(move || {
        info!("signal received, terminating...");
        let _ = termination_sender.send(());
    })
    .context("failed to set up signal handlers")?;

    let result = runtime.block_on(async move {
        let store = config.store.into_store().await;
        let cache = LatestReading::new();
        let pipeline = Pipeline::new(cache.clone(), store.clone());
        let state = AppState {
            cache,
            store,
            history_limit: config.http.history_limit,
        };

        let task_handle = try_join(
            subscriber::run(config.broker, pipeline, subscriber_termination),
            web::serve(config.http, state, web_termination),
        );
        let deadline = sleep(Duration::from_secs(30));
        let mut terminated = false;
        tokio::pin!(task_handle);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = termination_receiver.recv(), if !terminated => {
                    terminated = true;
                    deadline.as_mut().reset(Instant::now() + Duration::from_secs(5));
                },
                _ = &mut deadline, if terminated => {
                    warn!("tasks didn't terminate in time, force exit");
                    return Ok(());
                },
                r = &mut task_handle => {
                    return r.map(|_| ());
                },
            }
        }
    });
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}
