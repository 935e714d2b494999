//! valgraph server binary.
//!
//! Boots the engine against the configured stores and serves the
//! streaming API. The graph topology is fixed per deployment: this binary
//! wires the valuation pipeline's stage nodes around the engine; the
//! stage bodies themselves (model calls, data fetchers) are plugged in
//! where `deployment()` builds the graph.

use clap::Parser;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use valgraph_core::{
    GraphBuilder, InterruptPayload, NodeContext, NodeFuture, NodeOutput, StateSchema, ValueType,
};
use valgraph_server::{create_router, Engine, EngineConfig, FieldProjection, GraphDeployment,
    MapperRegistry};

#[derive(Parser, Debug)]
#[command(name = "valgraph-server", about = "Durable streaming graph engine")]
struct Args {
    /// Bind address
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    host: String,

    /// Bind port
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,
}

/// The deployment's topology: intake → gatekeeper → report.
///
/// Stage bodies here are the wiring points for the deployment's agents;
/// the gatekeeper shows the human-in-the-loop contract end to end.
fn deployment() -> GraphDeployment {
    let schema = StateSchema::new()
        .overwrite("message", ValueType::Any)
        .overwrite("request", ValueType::Object)
        .overwrite("approval", ValueType::Any)
        .overwrite("report", ValueType::Object)
        .append("log", ValueType::String);

    let graph = GraphBuilder::new(schema)
        .add_node("intake", |state: HashMap<String, serde_json::Value>, _ctx: NodeContext| {
            Box::pin(async move {
                let message = state.get("message").cloned().unwrap_or_default();
                let mut update = HashMap::new();
                update.insert(
                    "request".to_string(),
                    json!({ "raw": message, "received": true }),
                );
                update.insert("log".to_string(), json!("intake accepted request"));
                Ok(NodeOutput::Update(update))
            }) as NodeFuture
        })
        .add_node("gatekeeper", |state: HashMap<String, serde_json::Value>, ctx: NodeContext| {
            Box::pin(async move {
                let request = state.get("request").cloned().unwrap_or_default();
                let approved = ctx.interrupt(
                    InterruptPayload::new("approval")
                        .with_title("Approve analysis request")
                        .with_schema(json!({ "type": "boolean" }))
                        .with_field("request", request)
                        .into_value(),
                    "approval",
                )?;
                let mut update = HashMap::new();
                update.insert(
                    "log".to_string(),
                    json!(format!("gatekeeper decision: {}", approved)),
                );
                Ok(NodeOutput::Update(update))
            }) as NodeFuture
        })
        .add_node("report", |state: HashMap<String, serde_json::Value>, _ctx: NodeContext| {
            Box::pin(async move {
                let approved = state
                    .get("approval")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let mut update = HashMap::new();
                update.insert(
                    "report".to_string(),
                    json!({ "status": if approved { "completed" } else { "declined" } }),
                );
                Ok(NodeOutput::Update(update))
            }) as NodeFuture
        })
        .add_edge("intake", "gatekeeper")
        .add_edge("gatekeeper", "report")
        .set_entry("intake")
        .compile()
        .expect("deployment topology is static and valid");

    GraphDeployment::new(graph).with_mappers(
        MapperRegistry::new().register("report", FieldProjection::required(["status"])),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(rust_log).init();

    let args = Args::parse();
    let config = EngineConfig::from_env()?;
    tracing::info!(
        database_url = %config.database_url,
        blob_store_url = %config.blob_store_url,
        protocol_version = %config.protocol_version,
        "starting valgraph engine"
    );

    let engine = Engine::new(config, deployment()).await?;
    let router = create_router(engine);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;
    Ok(())
}
