#[macro_use]
extern crate lazy_static;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::Local;
use config::{Config, Environment, File};
use resources::config::recommender::RecommenderConfig;
use routines::recommender::{Recommender, RecommenderClients};
use target::controller_fetcher::ApiControllerFetcher;
use tracing_subscriber::EnvFilter;

use crate::{
    clients::api::ApiClient,
    input::{feeder::FeederClients, oom},
    target::selector_fetcher::ScaleSelectorFetcher,
};

mod checkpoint;
mod clients;
mod error;
mod input;
mod logic;
mod model;
mod routines;
mod target;
#[cfg(test)]
mod testing;

lazy_static! {
    pub static ref CONFIG: RecommenderConfig = {
        dotenv::from_path("/etc/rminik8s/node.env").ok();
        Config::builder()
            .add_source(File::with_name("/etc/rminik8s/mpa-recommender.yaml").required(false))
            .add_source(Environment::default())
            .build()
            .unwrap_or_default()
            .try_deserialize::<RecommenderConfig>()
            .with_context(|| "Failed to parse config".to_string())
            .unwrap_or_default()
    };
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    CONFIG.validate().with_context(|| "Invalid recommender config")?;
    tracing::info!("MPA recommender {} started", CONFIG.recommender_name);

    let api = Arc::new(ApiClient::new(&CONFIG.cluster));
    let controller_fetcher = Arc::new(ApiControllerFetcher::new(api.clone(), api.clone(), &CONFIG));
    tokio::spawn(
        controller_fetcher
            .clone()
            .run_cache_refresh_loop(Duration::from_secs(CONFIG.scale_cache_loop_period)),
    );

    let (oom_tx, oom_rx) = oom::channel(CONFIG.oom_channel_capacity);
    let observer = oom::OomObserver::new(oom_tx, api.clone(), &CONFIG.cluster.api_server_watch_url);
    tokio::spawn(observer.run());

    let clients = RecommenderClients {
        feeder: FeederClients {
            mpas: api.clone(),
            pods: api.clone(),
            metrics: api.clone(),
            checkpoints: api.clone(),
            selectors: Arc::new(ScaleSelectorFetcher::new(api.clone())),
            controllers: controller_fetcher,
        },
        scales: api.clone(),
        events: api,
    };
    let mut recommender = Recommender::new(clients, oom_rx, &CONFIG, Local::now().naive_utc());
    recommender
        .init_from_checkpoints(Local::now().naive_utc())
        .await;

    let mut interval = tokio::time::interval(Duration::from_secs(CONFIG.recommender_interval));
    loop {
        interval.tick().await;
        recommender.run_once(Local::now().naive_utc()).await;
    }
}
