pub mod archive;
pub mod channels;
pub mod config;
pub mod coordinator;
pub mod database;
pub mod datalog_writer;
pub mod error;
pub mod export;
pub mod mqtt;
pub mod options;
pub mod prelude;
pub mod registry;
pub mod scheduler;
pub mod sma;

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::coordinator::plant::Cycle;
use crate::coordinator::Coordinator;
use crate::database::Database;
use crate::datalog_writer::DatalogWriter;
use crate::export::Exporter;
use crate::mqtt::Mqtt;
use crate::prelude::*;
use crate::scheduler::Scheduler;

use std::sync::Arc;
use tokio::task::JoinHandle;

/// Long-running parts of the bridge, stopped in dependency order.
pub struct Components {
    pub coordinator: Coordinator,
    pub mqtt: Option<Mqtt>,
    pub databases: Vec<Database>,
    pub channels: Channels,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    exporters: Vec<JoinHandle<()>>,
    mqtt_task: Option<JoinHandle<()>>,
}

impl Components {
    /// The shutdown sequence is:
    /// 1. Coordinator and scheduler, after the cycle in flight
    /// 2. Exporters, once everything already published is written
    /// 3. MQTT and databases
    pub async fn stop(self) {
        info!("Stopping all components...");

        self.coordinator.stop();
        for (name, handle) in self.tasks {
            if let Err(e) = handle.await {
                error!("Error waiting for {} task: {}", name, e);
            }
        }

        let _ = self.channels.to_exporters.send(export::ChannelData::Shutdown);
        for handle in self.exporters {
            if let Err(e) = handle.await {
                error!("Error waiting for exporter task: {}", e);
            }
        }

        if let Some(mqtt) = &self.mqtt {
            mqtt.stop();
        }
        if let Some(handle) = self.mqtt_task {
            if let Err(e) = handle.await {
                error!("Error waiting for mqtt task: {}", e);
            }
        }
        for database in &self.databases {
            database.stop().await;
        }

        if let Ok(stats) = self.coordinator.stats.lock() {
            stats.print_summary();
        }
        info!("Shutdown complete");
    }
}

pub fn init_logging(level: &str) {
    let result = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init();

    if let Err(e) = result {
        eprintln!("logger already initialized: {}", e);
    }
}

// subscribes before returning so nothing published afterwards is missed
fn spawn_exporter(exporter: Arc<dyn Exporter>, channels: &Channels) -> JoinHandle<()> {
    let receiver = channels.to_exporters.subscribe();
    tokio::spawn(async move {
        let name = exporter.name();
        if let Err(e) = export::run(exporter, receiver).await {
            error!("{} exporter task failed: {}", name, e);
        }
    })
}

pub async fn app(mut shutdown_rx: broadcast::Receiver<()>, options: Options) -> Result<()> {
    let config = match ConfigWrapper::new(options.config_file.clone()) {
        Ok(config) => config,
        Err(err) => {
            init_logging("info");
            error!("Failed to load config {}: {:#}", options.config_file, err);
            return Err(err);
        }
    };

    init_logging(&config.loglevel());
    info!(
        "sma-bridge {} starting with config file {}",
        CARGO_PKG_VERSION, options.config_file
    );
    config.log_summary();

    let channels = Channels::new();
    let coordinator = Coordinator::new(config.clone(), channels.clone());

    info!("Initializing exporters...");
    let mut exporters = Vec::new();

    if let Some(datalog) = config.datalog() {
        let writer = DatalogWriter::new(&datalog)?;
        exporters.push(spawn_exporter(Arc::new(writer), &channels));
    }

    let mqtt = config
        .mqtt()
        .map(|c| Mqtt::new(c, channels.clone(), coordinator.stats.clone()));
    let mut mqtt_task = None;
    if let Some(mqtt) = &mqtt {
        let runner = mqtt.clone();
        mqtt_task = Some(tokio::spawn(async move {
            if let Err(e) = runner.start().await {
                error!("MQTT task failed: {:#}", e);
            }
        }));
        exporters.push(spawn_exporter(Arc::new(mqtt.clone()), &channels));
    }

    let databases: Vec<Database> = config
        .enabled_databases()
        .into_iter()
        .map(|db| Database::new(db, coordinator.stats.clone()))
        .collect();
    for database in &databases {
        // a database that is down now is connected on first write
        if let Err(e) = database.start().await {
            error!("Database failed to start: {:#}", e);
        }
        exporters.push(spawn_exporter(Arc::new(database.clone()), &channels));
    }
    info!("  {} exporters running", exporters.len());

    let mut tasks = Vec::new();

    if options.once {
        if let Err(e) = coordinator.cycle(Cycle::Full).await {
            error!("Cycle failed: {:#}", e);
        }
    } else {
        let runner = coordinator.clone();
        tasks.push((
            "coordinator",
            tokio::spawn(async move {
                if let Err(e) = runner.start().await {
                    error!("Coordinator task failed: {:#}", e);
                }
            }),
        ));

        let scheduler = Scheduler::new(config.clone(), channels.clone());
        tasks.push((
            "scheduler",
            tokio::spawn(async move {
                if let Err(e) = scheduler.start().await {
                    error!("Scheduler task failed: {:#}", e);
                }
            }),
        ));

        let runtime = async {
            match options.runtime {
                Some(secs) => tokio::time::sleep(std::time::Duration::from_secs(secs)).await,
                None => futures::future::pending::<()>().await,
            }
        };

        info!("Waiting for shutdown signal...");
        tokio::select! {
            _ = shutdown_rx.recv() => info!("Shutdown signal received"),
            _ = runtime => info!("Runtime limit reached"),
        }
    }

    let components = Components {
        coordinator,
        mqtt,
        databases,
        channels,
        tasks,
        exporters,
        mqtt_task,
    };
    components.stop().await;

    Ok(())
}
