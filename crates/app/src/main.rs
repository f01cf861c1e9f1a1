mod auth;
mod contacts;
mod contractors;
mod customers;
mod customization;
mod events;
mod maintenance;
mod manufacturers;
mod notifications;
mod problem;
mod proposals;
mod router;
mod taxes;
mod telemetry;
mod users;

use std::net::SocketAddr;

use tracing::{info, warn};

use cabinet_portal_core::types::Role;
use cabinet_portal_storage::{Database, NewUser};
use cabinet_portal_util::{load_env_file, AppConfig, BootstrapAdmin};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;
    if let Some(admin) = &config.bootstrap_admin {
        bootstrap_admin(&database, admin).await?;
    }

    tokio::fs::create_dir_all(&config.upload_dir).await?;

    let events = events::EventHub::new();
    maintenance::MaintenanceWorker::new(database.clone(), events.clone(), config.maintenance)
        .spawn();

    let state = router::AppState::new(metrics, database, events, &config);

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}

/// Creates the first administrator when the user table is still empty.
async fn bootstrap_admin(
    database: &Database,
    admin: &BootstrapAdmin,
) -> Result<(), Box<dyn std::error::Error>> {
    let users = database.users();
    if users.count_active().await? > 0 {
        return Ok(());
    }
    let hash = auth::hash_password(&admin.password);
    let user = users
        .create(NewUser {
            name: &admin.name,
            email: &admin.email,
            password_hash: &hash,
            role: Role::SuperAdmin,
            group_id: None,
            created_at: chrono::Utc::now(),
        })
        .await?;
    warn!(stage = "auth", user_id = user.id, email = %user.email, "bootstrap administrator created");
    Ok(())
}
