use college_form_bot::{ServiceConfig, build_router, create_app_state, spawn_idle_purge};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize structured tracing; `LOG_FORMAT=pretty` switches to human-readable output
fn init_tracing(log_format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "college_form_bot=debug,form_flow=debug,tower_http=debug".into()
    });

    match log_format {
        "pretty" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_level(true),
                )
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env()?;
    init_tracing(&config.log_format);

    let app_state = create_app_state(&config).await?;

    if let Some(ttl) = config.session_ttl {
        info!(
            ttl_secs = ttl.as_secs(),
            every_secs = config.purge_interval.as_secs(),
            "Idle session purge enabled"
        );
        spawn_idle_purge(app_state.engine.clone(), config.purge_interval);
    }

    let app = build_router(app_state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    let addr = listener.local_addr()?;

    info!("College form bot running on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
