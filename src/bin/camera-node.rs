//! Camera node: WiFi bring-up followed by the frame pipeline and MJPEG stream.
//!
//! Runs on both ESP32 and host platforms:
//! - **Host**: `cargo run --bin camera-node`
//! - **ESP32**: `cargo espflash flash --bin camera-node --features esp32 --release`
//!
//! On the host the camera is replaced by the JPEG files in `frames_dir`
//! (or by a synthetic sensor), the station by the OS network, and
//! provisioning by `CAMSTREAM_PROVISION_SSID`/`CAMSTREAM_PROVISION_PASSWORD`.
//!
//! ## Endpoints
//!
//! - Stream: http://<device>/stream
//! - Stats: http://<device>/stats

use camstream_esp32::camera::{
    CaptureTask, DirFileStore, DirectFeed, EncodePolicy, FrameSource, ModeFeed, Pipeline,
    PersistenceConsumer, SlotFeed,
};
use camstream_esp32::config::{AppConfig, StreamMode};
use camstream_esp32::network::{LinkEvent, StreamServer};
use camstream_esp32::store::SharedStore;
use camstream_esp32::wifi::{
    bring_online, ConnectSettings, Connectivity, ConnectivityError, ConnectivityHandle,
    ProvisioningListener,
};
use log::{error, info, warn};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ESP32: Initialize ESP-IDF before anything else
#[cfg(feature = "esp32")]
fn platform_init() {
    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();
    info!("ESP-IDF initialized");
}

// Host: Just initialize env_logger
#[cfg(not(feature = "esp32"))]
fn platform_init() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

/// Log a startup failure and exit. Nothing can run without it.
fn fatal(msg: &str) -> ! {
    error!("{}", msg);
    // Give the serial console a moment to drain
    thread::sleep(std::time::Duration::from_millis(500));
    std::process::exit(1);
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    platform_init();

    info!("=== Camera node starting ===");

    #[cfg(feature = "esp32")]
    let config = AppConfig::from_build_env().unwrap_or_else(|e| fatal(&format!("Bad configuration: {}", e)));
    #[cfg(not(feature = "esp32"))]
    let config = AppConfig::from_env().unwrap_or_else(|e| fatal(&format!("Bad configuration: {}", e)));

    if let Err(e) = config.validate() {
        fatal(&format!("Bad configuration: {}", e));
    }

    let cancel = CancellationToken::new();

    #[cfg(not(feature = "esp32"))]
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl+C received, shutting down");
                cancel.cancel();
            }
        });
    }

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let platform = Platform::init(&config, events_tx)
        .unwrap_or_else(|e| fatal(&format!("Platform init failed: {}", e)));
    let store = platform.store;

    let conn = Connectivity::new(
        platform.driver,
        events_rx,
        store.clone(),
        ConnectSettings::from_config(&config),
    );
    let listener = ProvisioningListener::new(platform.provisioning, store.clone(), conn.handle());

    let online = match bring_online(conn, &listener, &cancel).await {
        Ok(online) => online,
        Err(ConnectivityError::Cancelled) => {
            info!("Cancelled before the station came online");
            return;
        }
        Err(e) => fatal(&format!("WiFi bring-up failed: {}", e)),
    };
    info!("Online via {:?}", online.path);

    if let Some(provisioning) = online.provisioning {
        tokio::spawn(async move {
            let summary = provisioning.join().await;
            info!(
                "Provisioning finished (ssid: {:?}, acknowledged: {})",
                summary.ssid, summary.acknowledged
            );
        });
    }

    #[cfg(feature = "esp32")]
    let node = CameraNode::start(platform.camera, &config, &store, online.handle.clone(), &cancel);

    #[cfg(not(feature = "esp32"))]
    let node = match &config.frames_dir {
        Some(dir) => match camstream_esp32::camera::DirFrameSource::open(dir) {
            Ok(source) => CameraNode::start(source, &config, &store, online.handle.clone(), &cancel),
            Err(e) => fatal(&format!("Cannot replay frames from {}: {}", dir.display(), e)),
        },
        None => {
            info!("No frames_dir set, using the synthetic sensor");
            let source = camstream_esp32::sim::SyntheticCamera::jpeg(16 * 1024);
            CameraNode::start(source, &config, &store, online.handle.clone(), &cancel)
        }
    };
    let node = node.unwrap_or_else(|e| fatal(&format!("Camera pipeline failed: {}", e)));

    cancel.cancelled().await;

    node.shutdown();
    match online.task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Connectivity task ended with: {}", e),
        Err(e) => warn!("Connectivity task panicked: {}", e),
    }
    info!("=== Camera node stopped ===");
}

/// Platform services needed before the station comes up.
struct Platform<D, T> {
    store: SharedStore,
    driver: D,
    provisioning: T,
    #[cfg(feature = "esp32")]
    camera: camstream_esp32::camera::EspCamera,
}

#[cfg(feature = "esp32")]
impl
    Platform<
        camstream_esp32::network::EspLink,
        camstream_esp32::wifi::SmartConfig,
    >
{
    fn init(
        config: &AppConfig,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        use camstream_esp32::camera::{mount_spiffs, CameraSettings, EspCamera};
        use camstream_esp32::persistence::NvsStore;
        use esp_idf_hal::peripherals::Peripherals;
        use esp_idf_svc::eventloop::EspSystemEventLoop;
        use esp_idf_svc::nvs::EspDefaultNvsPartition;

        let peripherals = Peripherals::take()?;
        let sysloop = EspSystemEventLoop::take()?;
        let partition = EspDefaultNvsPartition::take()?;

        let store = camstream_esp32::store::shared(NvsStore::new(partition.clone())?);
        let driver =
            camstream_esp32::network::EspLink::new(peripherals.modem, sysloop, partition, events)?;

        if config.persist_frames {
            let base = config.storage_dir.to_string_lossy();
            mount_spiffs(&base)?;
            info!("SPIFFS mounted at {}", base);
        }

        let camera = EspCamera::init(CameraSettings::default())?;

        Ok(Self {
            store,
            driver,
            provisioning: camstream_esp32::wifi::SmartConfig::new(),
            camera,
        })
    }
}

#[cfg(not(feature = "esp32"))]
impl Platform<camstream_esp32::network::HostLink, camstream_esp32::wifi::HostProvisioning> {
    fn init(
        config: &AppConfig,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        use camstream_esp32::persistence_host::FileKvStore;

        let store = camstream_esp32::store::shared(FileKvStore::open(&config.store_dir)?);
        Ok(Self {
            store,
            driver: camstream_esp32::network::HostLink::new(events),
            provisioning: camstream_esp32::wifi::HostProvisioning::from_env(),
        })
    }
}

/// The running camera side: worker threads plus the HTTP server.
struct CameraNode {
    server: StreamServer,
    workers: Vec<thread::JoinHandle<()>>,
}

impl CameraNode {
    fn start<S>(
        source: S,
        config: &AppConfig,
        store: &SharedStore,
        connectivity: ConnectivityHandle,
        cancel: &CancellationToken,
    ) -> std::io::Result<Self>
    where
        S: FrameSource + 'static,
    {
        let policy = EncodePolicy {
            min_transcode_width: config.min_transcode_width,
            jpeg_quality: config.jpeg_quality,
        };
        let pipeline = Pipeline::new();
        let mut workers = Vec::new();

        let feed = match config.stream_mode {
            StreamMode::Direct => {
                // Clients pull from the camera themselves; no capture task
                info!("Stream mode: direct");
                ModeFeed::Direct(DirectFeed::new(Arc::new(Mutex::new(source)), policy))
            }
            StreamMode::Slot => {
                info!("Stream mode: slot");
                let capture = CaptureTask::new(source, pipeline.clone(), policy)
                    .with_interval(config.capture_interval());
                let capture_cancel = cancel.clone();
                workers.push(
                    thread::Builder::new()
                        .name("capture".to_string())
                        .spawn(move || {
                            capture.run(capture_cancel);
                        })?,
                );

                if config.persist_frames {
                    match Self::spawn_persistence(&pipeline, config, store, cancel) {
                        Ok(worker) => workers.push(worker),
                        Err(e) => warn!("Frames will not be saved: {}", e),
                    }
                }

                ModeFeed::Slot(SlotFeed::new(pipeline.slot.clone()))
            }
        };

        let server = StreamServer::start(
            None,
            config.stream_port,
            feed,
            pipeline.stats.clone(),
            Some(connectivity),
            config.max_stream_clients,
        )?;

        Ok(Self { server, workers })
    }

    fn spawn_persistence<B>(
        pipeline: &Pipeline<B>,
        config: &AppConfig,
        store: &SharedStore,
        cancel: &CancellationToken,
    ) -> Result<thread::JoinHandle<()>, Box<dyn std::error::Error>>
    where
        B: camstream_esp32::camera::FrameBuffer + 'static,
    {
        let files = DirFileStore::new(&config.storage_dir)?;
        let consumer = PersistenceConsumer::new(pipeline.clone(), files, store.clone())?;
        let consumer_cancel = cancel.clone();
        let worker = thread::Builder::new()
            .name("persist".to_string())
            .spawn(move || consumer.run(consumer_cancel))?;
        Ok(worker)
    }

    fn shutdown(self) {
        let Self { mut server, workers } = self;
        server.stop();
        for worker in workers {
            let _ = worker.join();
        }
    }
}
