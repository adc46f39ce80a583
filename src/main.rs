use log::{error, info, warn};
use statuspage::{
    aggregate::resolve_affected_services,
    backend::{BackendError, IncidentPatch, RestBackend, StatusBackend},
    config::{ConfigError, StatusPageConfig},
    mutation::{IncidentInput, MutationController, ServiceInput},
    normalize::normalize_organizations,
    notify::Notification,
    realtime::{ChannelClient, ChannelError, HttpPublisher, Hub, SseTransport, server},
    view::{Snapshot, ViewRegistry},
};
use std::{process::ExitCode, sync::Arc};

use cli::{AdminAction, Command};

mod cli;
mod signals;

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    // Initialize the logger
    env_logger::init();

    let args = cli::get_cli_args();
    let config = match StatusPageConfig::try_init(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Unable to read {}: {e}", args.config.display());
            return ExitCode::FAILURE;
        }
    };

    let result = match &args.command {
        Command::Serve => serve(&config).await,
        Command::Watch { slug } => watch(&config, slug).await,
        Command::Organizations => organizations(&config).await,
        Command::Admin {
            org,
            organization_id,
            quiet,
            action,
        } => admin(&config, org, organization_id.as_deref(), *quiet, action).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn serve(config: &StatusPageConfig) -> Result<ExitCode, AppError> {
    let shutdown = signals::handle_shutdown()?;
    let hub = Arc::new(Hub::new(config.channel.capacity));
    let listener = tokio::net::TcpListener::bind(config.channel.listen).await?;

    signals::notify_ready();
    server::serve(
        listener,
        server::router(hub, &config.channel),
        shutdown.wait(),
    )
    .await?;
    Ok(ExitCode::SUCCESS)
}

fn log_snapshot(slug: &str, snapshot: &Snapshot) {
    info!(
        "{slug} v{}: {} ({} services, {} active incidents)",
        snapshot.version,
        snapshot.derived.aggregate.headline(),
        snapshot.services.len(),
        snapshot.derived.active_incidents.len()
    );
    for incident in &snapshot.derived.active_incidents {
        let affected: Vec<String> = resolve_affected_services(incident, &snapshot.services)
            .into_iter()
            .map(|(_, name)| name)
            .collect();
        info!(
            "  [{}] {} affecting {}",
            incident.status(),
            incident.title,
            affected.join(", ")
        );
    }
}

async fn watch(config: &StatusPageConfig, slug: &str) -> Result<ExitCode, AppError> {
    let shutdown = signals::handle_shutdown()?;
    let backend: Arc<dyn StatusBackend> = Arc::new(RestBackend::new(&config.api)?);
    let registry = Arc::new(ViewRegistry::new(backend, &config.view));
    signals::handle_reload(registry.clone(), tokio::runtime::Handle::current())?;

    match HttpPublisher::new(&config.channel)?.probe(slug, "ping").await {
        Ok(reply) => info!("Channel hub at {} answered {reply:?}", config.channel.base_url),
        Err(e) => warn!("Channel hub at {} is not reachable yet: {e}", config.channel.base_url),
    }

    let view = registry.open(slug).await;
    let transport = Arc::new(SseTransport::new(&config.channel)?);
    let (mut connection, mut client) =
        ChannelClient::new(view.clone(), transport, config.reconnect.clone()).spawn();
    let mut snapshots = view.subscribe();
    signals::notify_ready();

    let stop = shutdown.wait();
    tokio::pin!(stop);
    let code = loop {
        tokio::select! {
            _ = &mut stop => break ExitCode::SUCCESS,
            result = &mut client => {
                break match result {
                    Ok(Ok(())) => ExitCode::SUCCESS,
                    Ok(Err(e)) => {
                        error!("Lost the channel for {slug}: {e}");
                        ExitCode::FAILURE
                    }
                    Err(e) => {
                        error!("Channel client for {slug} panicked: {e}");
                        ExitCode::FAILURE
                    }
                };
            }
            Ok(()) = connection.changed() => {
                info!("Channel for {slug} is {}", *connection.borrow_and_update());
            }
            Ok(()) = snapshots.changed() => {
                let snapshot = snapshots.borrow_and_update().clone();
                log_snapshot(slug, &snapshot);
            }
        }
    };

    registry.close_all().await;
    Ok(code)
}

async fn organizations(config: &StatusPageConfig) -> Result<ExitCode, AppError> {
    let backend = RestBackend::new(&config.api)?;
    for organization in normalize_organizations(&backend.list_organizations().await?) {
        println!("{}\t{}\t{}", organization.id, organization.slug, organization.name);
    }
    Ok(ExitCode::SUCCESS)
}

async fn admin(
    config: &StatusPageConfig,
    slug: &str,
    organization_id: Option<&str>,
    quiet: bool,
    action: &AdminAction,
) -> Result<ExitCode, AppError> {
    let backend: Arc<dyn StatusBackend> = Arc::new(RestBackend::new(&config.api)?);
    let registry = ViewRegistry::new(backend.clone(), &config.view);
    let view = registry.open(slug).await;
    if let Err(e) = view.sync().await {
        // An explicit organization id is enough to go on.
        warn!("Unable to load {slug}: {e}");
    }

    let mut controller = MutationController::new(backend, view.clone());
    if let Some(id) = organization_id {
        controller = controller.with_organization_id(id);
    }
    if !quiet {
        controller = controller.with_publisher(Arc::new(HttpPublisher::new(&config.channel)?));
    }

    let notification = match action {
        AdminAction::CreateService {
            name,
            description,
            status,
        } => Notification::from_result(
            &controller
                .create_service(ServiceInput {
                    name: name.clone(),
                    description: description.clone(),
                    status: *status,
                })
                .await,
            |service| {
                (
                    "Service created".into(),
                    format!("{} ({})", service.name, service.id),
                )
            },
        ),
        AdminAction::UpdateService {
            id,
            name,
            description,
            status,
        } => Notification::from_result(
            &controller
                .update_service(
                    id,
                    ServiceInput {
                        name: name.clone(),
                        description: description.clone(),
                        status: *status,
                    },
                )
                .await,
            |service| {
                (
                    "Service updated".into(),
                    format!("{} is {}", service.name, service.status),
                )
            },
        ),
        AdminAction::DeleteService { id } => Notification::from_result(
            &controller.delete_service(id).await,
            |_| ("Service deleted".into(), id.clone()),
        ),
        AdminAction::CreateIncident {
            title,
            description,
            status,
            severity,
            services,
        } => Notification::from_result(
            &controller
                .create_incident(IncidentInput {
                    title: title.clone(),
                    description: description.clone(),
                    status: *status,
                    severity: severity.clone(),
                    affected_services: services.iter().cloned().collect(),
                })
                .await,
            |incident| {
                (
                    "Incident created".into(),
                    format!("{} ({})", incident.title, incident.id),
                )
            },
        ),
        AdminAction::UpdateIncident {
            id,
            title,
            description,
            status,
        } => Notification::from_result(
            &controller
                .update_incident(
                    id,
                    IncidentPatch {
                        title: title.clone(),
                        description: description.clone(),
                        status: *status,
                        update: None,
                    },
                )
                .await,
            |incident| {
                (
                    "Incident updated".into(),
                    format!("{} is {}", incident.title, incident.status()),
                )
            },
        ),
        AdminAction::AddUpdate {
            id,
            message,
            status,
        } => Notification::from_result(
            &controller.add_incident_update(id, message, *status).await,
            |incident| {
                (
                    "Update posted".into(),
                    format!("{} is {}", incident.title, incident.status()),
                )
            },
        ),
        AdminAction::DeleteIncident { id } => Notification::from_result(
            &controller.delete_incident(id).await,
            |_| ("Incident deleted".into(), id.clone()),
        ),
    };

    registry.close_all().await;
    println!("{notification}");
    Ok(if notification.is_error() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
