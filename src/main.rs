mod cli;
mod domain;
mod infrastructure;
mod presentation;

use crate::cli::{Cli, Command, ProvisionArgs};
use crate::domain::models::{AppEvent, ProvisioningOutcome};
use crate::domain::settings::SettingsService;
use crate::infrastructure::logging::{init_logger, verbosity_level};
use crate::infrastructure::usb::chooser::{AutoChooser, DeviceChooser, TerminalChooser};
use crate::infrastructure::usb::protocol::default_filters;
use crate::infrastructure::usb::rusb_backend::RusbBus;
use crate::infrastructure::usb::service::ControllerConfig;
use crate::infrastructure::usb::{DeviceRegistry, ProvisioningController, UsbRegistry};
use crate::presentation::console::{format_outcome, spawn_event_printer};
use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

type Registry = UsbRegistry<RusbBus, Box<dyn DeviceChooser>>;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let settings_service = match cli.settings.clone() {
        Some(path) => SettingsService::load(path),
        None => SettingsService::new()?,
    };

    // Keep the guard alive so buffered file logs are flushed on exit
    let _logging_guard = match init_logger(
        &settings_service.get().log_settings,
        verbosity_level(cli.verbose),
    ) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            None
        }
    };

    info!("Starting Sensor Provisioner");
    if let Some(path) = settings_service.path() {
        debug!("Using settings file {}", path.display());
    }
    let settings = Arc::new(Mutex::new(settings_service));

    match cli.command {
        Command::Forget => {
            let removed = lock(&settings)?.forget_all()?;
            println!("Forgot {} paired device(s)", removed);
            Ok(ExitCode::SUCCESS)
        }
        Command::List => {
            let (registry, printer) = build_registry(&settings, false)?;
            let devices = registry.list_authorized().await;
            drop(registry);
            let _ = printer.await;

            if devices.is_empty() {
                println!("No paired device is attached");
            }
            for device in devices {
                println!("{}", device.label());
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Pair { yes } => {
            let (registry, printer) = build_registry(&settings, yes)?;
            let paired = registry.request_new(&default_filters()).await;
            drop(registry);
            let _ = printer.await;

            match paired? {
                Some(descriptor) => {
                    println!("Paired {}", descriptor.label());
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    println!("No device selected");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Command::Provision(args) => provision(args, settings).await,
    }
}

fn lock(settings: &Arc<Mutex<SettingsService>>) -> Result<MutexGuard<'_, SettingsService>> {
    settings
        .lock()
        .map_err(|_| anyhow::anyhow!("Settings lock poisoned"))
}

fn build_registry(
    settings: &Arc<Mutex<SettingsService>>,
    auto_select: bool,
) -> Result<(Registry, tokio::task::JoinHandle<()>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let printer = spawn_event_printer(rx);
    let registry = registry_with_sender(settings, auto_select, Duration::ZERO, tx)?;
    Ok((registry, printer))
}

fn registry_with_sender(
    settings: &Arc<Mutex<SettingsService>>,
    auto_select: bool,
    min_transfer_timeout: Duration,
    tx: mpsc::UnboundedSender<AppEvent>,
) -> Result<Registry> {
    let configured = Duration::from_millis(lock(settings)?.get().usb.transfer_timeout_ms);
    let transfer_timeout = transfer_timeout_for(configured, min_transfer_timeout);
    let bus = RusbBus::new(transfer_timeout).context("Failed to open the USB context")?;

    let chooser: Box<dyn DeviceChooser> = if auto_select {
        Box::new(AutoChooser)
    } else {
        Box::new(TerminalChooser)
    };

    Ok(UsbRegistry::new(bus, chooser, settings.clone(), tx))
}

/// The configured libusb timeout, raised to at least `floor`.
fn transfer_timeout_for(configured: Duration, floor: Duration) -> Duration {
    configured.max(floor)
}

async fn provision(
    args: ProvisionArgs,
    settings: Arc<Mutex<SettingsService>>,
) -> Result<ExitCode> {
    let (record, receive_timeout) = {
        let service = lock(&settings)?;
        let record = args.to_record(&service.get().defaults)?;
        let timeout = args
            .receive_timeout
            .unwrap_or_else(|| Duration::from_millis(service.get().usb.receive_timeout_ms));
        (record, timeout)
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let printer = spawn_event_printer(rx);
    // libusb must not give up on the answer before the controller does
    let registry = registry_with_sender(&settings, args.yes, receive_timeout, tx.clone())?;

    let config = ControllerConfig {
        receive_timeout,
        ..Default::default()
    };
    let mut controller = ProvisioningController::new(registry, config, tx);

    // Silent reconnect first, pairing prompt only when that finds nothing
    let connected = controller.mount().await? || controller.connect_manually().await?;

    if !connected {
        drop(controller);
        let _ = printer.await;
        eprintln!("No device selected");
        return Ok(ExitCode::FAILURE);
    }

    if let Some(label) = controller.device_label() {
        info!("Provisioning {}", label);
    }

    let status = controller.subscribe();
    let result = tokio::select! {
        result = controller.submit(&record) => Some(result),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted while {}", *status.borrow());
            None
        }
    };

    controller.disconnect_manually().await;
    drop(controller);
    let _ = printer.await;

    match result {
        Some(Ok(outcome)) => {
            println!("{}", format_outcome(outcome));
            Ok(if outcome == ProvisioningOutcome::Success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Some(Err(e)) => Err(e.into()),
        None => {
            info!("Connection closed after interrupt");
            Ok(ExitCode::from(130))
        }
    }
}
