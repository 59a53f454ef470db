// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cadenza Echo Worker - minimal worker process.
//!
//! Connects to the sidecar proxy, registers the `Echo` workflow, polls
//! `CADENZA_TASK_LIST` (default "default") in `CADENZA_DOMAIN`, and serves
//! proxy messages until Ctrl-C.
//!
//! Run with: cargo run -p cadenza-worker --bin cadenza-echo-worker

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use cadenza_worker::{
    MethodMapBuilder, WorkerClient, Workflow, WorkflowContext, WorkflowError, WorkflowExit,
    listener,
};

/// Returns its arguments. Answers the `last` query with them while running.
#[derive(Default)]
struct Echo {
    last: Mutex<Vec<u8>>,
}

#[async_trait]
impl Workflow for Echo {
    fn register_methods(methods: &mut MethodMapBuilder<Self>) {
        methods.query("last", |wf: Arc<Echo>, _, _| async move {
            Ok(wf.last.lock().unwrap_or_else(|e| e.into_inner()).clone())
        });
    }

    async fn run(&self, ctx: &WorkflowContext, args: Vec<u8>) -> Result<WorkflowExit, WorkflowError> {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = args.clone();
        let started = ctx.utc_now().await?;
        info!(workflow_id = %ctx.info().workflow_id, %started, "Echoing");
        Ok(WorkflowExit::Completed(args))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cadenza_worker=info".parse()?),
        )
        .init();

    let client = WorkerClient::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    let domain = client
        .config()
        .domain
        .clone()
        .unwrap_or_else(|| "default-domain".to_string());
    let task_list = std::env::var("CADENZA_TASK_LIST").unwrap_or_else(|_| "default".to_string());

    info!(
        proxy_url = %client.config().proxy_url,
        listen_addr = %client.config().listen_addr,
        client_id = client.client_id(),
        "Starting cadenza echo worker"
    );

    // Listener first: replies to our calls arrive through it.
    let shutdown = CancellationToken::new();
    let listener_handle = tokio::spawn(listener::serve(
        client.config().listen_addr,
        client.dispatcher(),
        shutdown.clone(),
    ));

    client.connect().await.context("connecting to proxy")?;
    client
        .register_workflow::<Echo>("Echo", Some(&domain))
        .await
        .context("registering Echo")?;
    let worker_id = client
        .start_worker(&domain, &task_list)
        .await
        .context("starting worker")?;

    info!(worker_id, %domain, %task_list, "Worker polling, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    if let Err(e) = client.stop_worker(worker_id).await {
        error!(error = %e, "Failed to stop worker");
    }
    client.shutdown().await;
    shutdown.cancel();

    match listener_handle.await {
        Ok(result) => result?,
        Err(e) => error!(error = %e, "Listener task failed"),
    }

    info!("Echo worker stopped");
    Ok(())
}
