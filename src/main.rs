use std::sync::Arc;

use clap::Parser;

use scorebook::Engine;
use scorebook::config::Config;
use scorebook::raft::transport::{HttpPeers, Peers};
use scorebook::server;

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    log::info!("shutdown signal received");
}

#[tokio::main]
async fn main() {
    let cfg = Config::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        if cfg.debug { "debug" } else { "info" },
    ))
    .init();

    let engine = if cfg.raft {
        let peers = Arc::new(Peers::Http(HttpPeers::new(cfg.raft_secret.clone())));
        Engine::clustered(cfg.clone(), peers)
    } else {
        Engine::standalone(cfg.clone())
    };
    let engine = match engine {
        Ok(engine) => engine,
        Err(e) => {
            log::error!("engine startup failed: {e}");
            std::process::exit(1);
        }
    };

    if let Some(join_addr) = &cfg.cluster_join {
        let mut attempts = 0;
        while let Err(e) = engine.join_cluster(join_addr).await {
            attempts += 1;
            if attempts >= 10 {
                log::error!("could not join the cluster through {join_addr}: {e}");
                std::process::exit(1);
            }
            log::warn!("cluster join attempt {attempts} failed ({e}), retrying");
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        }
    }

    engine.spawn_background_tasks();
    let app = server::router(Arc::clone(&engine));

    // Cluster-internal endpoints share the router; when a separate cluster
    // address is configured they get their own listener.
    let cluster_addr = cfg.cluster_listen_addr().to_string();
    if cluster_addr != cfg.addr {
        let cluster_app = app.clone();
        tokio::spawn(async move {
            match tokio::net::TcpListener::bind(&cluster_addr).await {
                Ok(listener) => {
                    log::info!("cluster surface listening on {cluster_addr}");
                    if let Err(e) = axum::serve(listener, cluster_app).await {
                        log::error!("cluster listener failed: {e}");
                    }
                }
                Err(e) => log::error!("binding cluster address {cluster_addr} failed: {e}"),
            }
        });
    }

    let listener = match tokio::net::TcpListener::bind(&cfg.addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("binding {} failed: {e}", cfg.addr);
            std::process::exit(1);
        }
    };
    log::info!(
        "scorebook node {} listening on {} ({})",
        engine.node.node_id,
        cfg.addr,
        if cfg.raft { "clustered" } else { "standalone" }
    );
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        log::error!("server failed: {e}");
    }
    engine.shutdown();
}
