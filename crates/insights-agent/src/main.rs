// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use insights_gather::{
    cluster::{http::KubeClient, ClusterClient},
    config,
    engine::Engine,
    gatherers::{register_all, GatherContext, ImageCache},
    recorder::DiskRecorder,
};

/// Initial image cache size, resized by the workload task on every run.
const INITIAL_IMAGE_CACHE_SIZE: usize = 1000;

#[tokio::main]
pub async fn main() {
    let log_level = env::var("INSIGHTS_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,reqwest=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match config::Config::new() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Error creating config on insights agent startup: {e}");
            return;
        }
    };

    let client: Arc<dyn ClusterClient> = match KubeClient::new(&config.kube_client_config()) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Unable to create the cluster client: {e}");
            return;
        }
    };

    let image_cache = Arc::new(ImageCache::new(INITIAL_IMAGE_CACHE_SIZE));
    let context = GatherContext::new(client, Arc::clone(&image_cache))
        .with_metrics_url(config.metrics_url.clone());
    let engine = Engine::new(register_all(context), image_cache);
    info!(
        "registered {} gathering functions, running {:?}",
        engine.registry().len(),
        config.gatherers
    );

    let recorder = Arc::new(DiskRecorder::new(
        config.storage_path.clone(),
        config.gather_interval,
        config.flush_size,
    ));

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Unable to listen for the shutdown signal: {e}");
                return;
            }
            info!("Received shutdown signal, stopping insights agent");
            shutdown.cancel();
        }
    });

    let flusher = tokio::spawn(Arc::clone(&recorder).periodically_flush(shutdown.child_token()));
    // nothing is uploaded by this process, so only the max age bounds pruning
    let pruner = tokio::spawn(
        Arc::clone(&recorder).periodically_prune(shutdown.child_token(), || DateTime::<Utc>::MIN_UTC),
    );

    let mut gather_interval = interval(config.gather_interval);
    gather_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = gather_interval.tick() => {}
        }

        // a run never outlives its interval
        let run = shutdown.child_token();
        let deadline = tokio::spawn({
            let run = run.clone();
            let period = config.gather_interval;
            async move {
                tokio::time::sleep(period).await;
                run.cancel();
            }
        });

        info!("Starting gather run");
        if let Err(e) = engine.gather(&run, &config.gatherers, &recorder).await {
            warn!("Gather run finished with errors: {e}");
        }
        deadline.abort();

        if shutdown.is_cancelled() {
            break;
        }
        match recorder.flush(&shutdown).await {
            Ok(Some(path)) => info!("Wrote archive {}", path.display()),
            Ok(None) => debug!("Nothing new to write after gather run"),
            Err(e) => error!("Unable to flush records after gather run: {e}"),
        }
    }

    shutdown.cancel();
    if let Err(e) = flusher.await {
        error!("Periodic flush did not stop cleanly: {e}");
    }
    if let Err(e) = pruner.await {
        error!("Periodic prune did not stop cleanly: {e}");
    }
    info!("Insights agent stopped");
}
