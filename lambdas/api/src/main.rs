use std::sync::Arc;

use aws_config::BehaviorVersion;
use domain::devices::{self, DeviceCommandChannel, DeviceRegistry, SimulatedHub};
use domain::dispenses::DispenseOrchestrator;
use domain::inventory::{
    dynamo, InMemoryCatalog, InMemorySlotRepository, Medicine, MedicineCatalog, SlotInventoryManager, SlotRepository,
};

mod config;
mod routes;

use config::{DeviceHub, SlotStore};
use routes::AppState;

#[tokio::main]
async fn main() -> Result<(), lambda_http::Error> {
    dotenvy::dotenv().ok();

    let settings = config::init()?;

    tracing_subscriber::fmt()
        .with_max_level(settings.log_level)
        .with_target(false)
        .without_time()
        .init();

    let (slots, catalog): (Arc<dyn SlotRepository>, Arc<dyn MedicineCatalog>) = match settings.slot_store {
        SlotStore::Dynamo => {
            let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
            let dynamodb_client = aws_sdk_dynamodb::Client::new(&config);
            (
                dynamo::init_repo(dynamodb_client.clone()),
                dynamo::init_catalog(dynamodb_client),
            )
        }
        SlotStore::Memory => {
            let slots: Arc<dyn SlotRepository> = Arc::new(InMemorySlotRepository::new());
            (slots, seeded_catalog().await)
        }
    };

    let (registry, channel): (Arc<dyn DeviceRegistry>, Arc<dyn DeviceCommandChannel>) = match settings.device_hub {
        DeviceHub::IotHub => {
            let hub = Arc::new(devices::hub::init()?);
            let registry: Arc<dyn DeviceRegistry> = hub.clone();
            (registry, hub as Arc<dyn DeviceCommandChannel>)
        }
        DeviceHub::Simulated => {
            let hub = Arc::new(SimulatedHub::new());
            spawn_heartbeat(hub.clone(), "1");
            let registry: Arc<dyn DeviceRegistry> = hub.clone();
            (registry, hub as Arc<dyn DeviceCommandChannel>)
        }
    };

    let inventory = Arc::new(SlotInventoryManager::new(slots, catalog));
    let orchestrator = Arc::new(DispenseOrchestrator::new(registry, channel, inventory.clone()));

    let app = routes::router(AppState {
        orchestrator,
        inventory,
    });

    match settings.bind_address {
        Some(address) => {
            let listener = tokio::net::TcpListener::bind(&address).await?;
            tracing::info!("Listening on {}", address);
            axum::serve(listener, app).await?;
        }
        None => {
            let app = tower::ServiceBuilder::new()
                .layer(axum_aws_lambda::LambdaLayer::default())
                .service(app);

            lambda_http::run(app).await?;
        }
    }

    Ok(())
}

/// Machine 1 and a few medicines, so a local run has something to stock.
async fn seeded_catalog() -> Arc<dyn MedicineCatalog> {
    let catalog = InMemoryCatalog::new();
    catalog.add_machine(1).await;
    for (medicine_id, name) in [(1, "Paracetamol"), (2, "Ibuprofen"), (3, "Cetirizine")] {
        catalog
            .add_medicine(Medicine {
                medicine_id,
                name: name.to_string(),
                stock: 50,
            })
            .await;
    }
    Arc::new(catalog)
}

/// Keeps a simulated device inside the liveness window.
fn spawn_heartbeat(hub: Arc<SimulatedHub>, device_id: &'static str) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            hub.touch(device_id).await;
        }
    });
}
