use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use flagsnap::config::Config;
use flagsnap::queue::consumers::{
    run_ingestion_consumer, run_snapshot_consumer, ControlPlaneClient, HttpEventSink,
};
use flagsnap::queue::PgQueue;
use flagsnap::routes;
use flagsnap::state::AppState;
use flagsnap::store::PgKv;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();

    let db = PgPool::connect(&config.database_url)
        .await
        .expect("Error connecting DB");

    sqlx::migrate!()
        .run(&db)
        .await
        .expect("Error running migrations");

    let kv: Arc<dyn flagsnap::store::KvStore> = Arc::new(PgKv::new(db.clone()));
    let queue: Arc<dyn flagsnap::queue::JobQueue> = Arc::new(PgQueue::new(db));
    let snapshot_source: Arc<dyn flagsnap::queue::consumers::SnapshotSource> =
        Arc::new(ControlPlaneClient::new(config.control_plane_url.clone()));
    let event_sink = Arc::new(HttpEventSink::new(config.event_sink_url.clone()));

    tokio::spawn(run_snapshot_consumer(
        queue.clone(),
        kv.clone(),
        snapshot_source.clone(),
        Duration::from_secs(2),
    ));
    tokio::spawn(run_ingestion_consumer(
        queue.clone(),
        event_sink,
        Duration::from_secs(2),
    ));

    let state = AppState {
        kv,
        queue,
        snapshot_source,
        admin_secret: config.admin_secret.clone(),
    };

    let app = routes::routes().with_state(state);

    let listener = tokio::net::TcpListener::bind(config.addr())
        .await
        .expect("Error binding listener");

    tracing::info!("server is chilling at http://{}", config.addr());

    axum::serve(listener, app).await.expect("server error");
}
