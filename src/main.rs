use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use boxcar_ci::config::Settings;
use boxcar_ci::executor::{Executor, HttpContainerLauncher};
use boxcar_ci::runner::FsLogSink;
use boxcar_ci::server::{build_router, AppState};
use boxcar_ci::store::{BuildStore, FragmentStore, MemoryStore};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "boxcar_ci=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env();
    let addr = settings.bind_addr;
    let stack = settings.stack.clone();

    let store = Arc::new(MemoryStore::new());
    let log_sink = Arc::new(FsLogSink::new(settings.log_dir.clone()));
    let launcher = Arc::new(HttpContainerLauncher::new(settings.runner_url.clone()));
    let executor = Executor::new(
        settings,
        Arc::clone(&store) as Arc<dyn BuildStore>,
        log_sink,
        launcher,
    );

    let app = build_router(AppState::new(executor, store as Arc<dyn FragmentStore>));

    tracing::info!(%stack, "listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
