//! `fleetup device {list|status|validate|metrics|discover|export}`.

use anyhow::{Context as _, Result, bail};
use clap::Subcommand;

use fleetup_core::console::ConsoleClient;
use fleetup_core::device_api::http::HttpConnector;
use fleetup_core::device_api::DeviceConnector;
use fleetup_core::fsio;
use fleetup_core::inventory::Inventory;
use fleetup_core::status::DeviceStatus;
use fleetup_core::validate::Validator;

use crate::Context;

/// Device inspection and discovery.
#[derive(Subcommand, Debug)]
pub enum DeviceAction {
    /// List the inventory.
    List,
    /// Show a device's workflow status file.
    Status {
        /// Device serial.
        serial: String,
    },
    /// Collect a pre-flight baseline from the device right now.
    Validate {
        /// Device serial.
        serial: String,
    },
    /// Print the device's live health metrics as JSON.
    Metrics {
        /// Device serial.
        serial: String,
    },
    /// Query the management console and rewrite the inventory.
    Discover,
    /// Export the inventory as CSV.
    Export,
}

/// Entry point.
pub async fn run(ctx: &Context, action: DeviceAction) -> Result<()> {
    match action {
        DeviceAction::List => list(ctx),
        DeviceAction::Status { serial } => status(ctx, &serial),
        DeviceAction::Validate { serial } => validate(ctx, &serial).await,
        DeviceAction::Metrics { serial } => metrics(ctx, &serial).await,
        DeviceAction::Discover => discover(ctx).await,
        DeviceAction::Export => export(ctx),
    }
}

fn inventory(ctx: &Context) -> Result<Inventory> {
    Inventory::load(&ctx.workdir.inventory_file()).context("could not load inventory")
}

fn list(ctx: &Context) -> Result<()> {
    let inventory = inventory(ctx)?;
    if inventory.is_empty() {
        println!("Inventory is empty; run `fleetup device discover` first");
        return Ok(());
    }
    println!(
        "{:<16} {:<20} {:<16} {:<12} {:<10} {}",
        "SERIAL", "HOSTNAME", "MGMT IP", "VERSION", "HA", "MODEL"
    );
    for device in inventory.devices() {
        println!(
            "{:<16} {:<20} {:<16} {:<12} {:<10} {}",
            device.serial,
            device.hostname,
            device.mgmt_ip,
            device.current_version,
            device.ha_state,
            device.model
        );
    }
    Ok(())
}

fn status(ctx: &Context, serial: &str) -> Result<()> {
    let record: Option<DeviceStatus> = fsio::read_json(&ctx.workdir.device_status_file(serial))?;
    let Some(st) = record else {
        println!("No workflow status for {serial}");
        return Ok(());
    };

    println!("Device {serial} ({}):", st.hostname);
    println!("  Status:    {} ({}%)", st.upgrade_status, st.progress);
    println!("  Phase:     {}", st.current_phase);
    println!("  Message:   {}", st.upgrade_message);
    println!("  Starting:  {}", st.starting_version);
    println!("  Current:   {}", st.current_version);
    println!("  Target:    {}", st.target_version);
    if !st.upgrade_path.is_empty() {
        println!(
            "  Path:      {} (at step {}/{})",
            st.upgrade_path.join(" -> "),
            st.current_path_index,
            st.upgrade_path.len()
        );
    }
    if let Some(disk) = st.disk_space {
        println!(
            "  Disk:      {:.2} GB free / {:.2} GB required ({})",
            disk.available_gb,
            disk.required_gb,
            if disk.check_passed { "ok" } else { "insufficient" }
        );
    }
    if !st.skip_reason.is_empty() {
        println!("  Skipped:   {}", st.skip_reason);
    }
    for err in &st.errors {
        println!("  Error [{}] {}: {}", err.timestamp.to_rfc3339(), err.phase, err.message);
    }
    Ok(())
}

fn connect(ctx: &Context, serial: &str) -> Result<std::sync::Arc<dyn fleetup_core::device_api::DeviceApi>> {
    let inventory = inventory(ctx)?;
    let device = inventory.require(serial)?;
    let connector = HttpConnector::new(ctx.config.device.clone());
    Ok(connector.connect(device)?)
}

async fn validate(ctx: &Context, serial: &str) -> Result<()> {
    let api = connect(ctx, serial)?;
    let validator = Validator::new(ctx.workdir.clone(), ctx.config.validation.clone());

    println!("Collecting baseline from {serial}...");
    let metrics = validator.pre_flight(serial, api.as_ref()).await?;

    println!("Baseline captured:");
    println!("  TCP sessions: {}", metrics.tcp_sessions);
    println!("  Routes:       {}", metrics.route_count);
    println!("  ARP entries:  {}", metrics.arp_count);
    println!("  Disk free:    {:.2} GB", metrics.disk_available_gb);
    let required = ctx.config.validation.min_disk_gb;
    if metrics.disk_available_gb < required {
        bail!(
            "device below the {required:.2} GB disk requirement ({:.2} GB free)",
            metrics.disk_available_gb
        );
    }
    Ok(())
}

async fn metrics(ctx: &Context, serial: &str) -> Result<()> {
    let api = connect(ctx, serial)?;
    let validator = Validator::new(ctx.workdir.clone(), ctx.config.validation.clone());
    let sample = validator.pre_flight(serial, api.as_ref()).await?;
    println!("{}", serde_json::to_string_pretty(&sample)?);
    Ok(())
}

async fn discover(ctx: &Context) -> Result<()> {
    let client = ConsoleClient::new(&ctx.config.console, &ctx.config.discovery)
        .context("console is not configured; set console.host and console.api_key")?;

    println!("Discovering devices from {}...", ctx.config.console.host);
    let doc = client.discover().await?;

    fsio::atomic_write_json(&ctx.workdir.inventory_file(), &doc)
        .context("could not write inventory")?;
    println!(
        "Discovery complete: {} devices -> {}",
        doc.device_count,
        ctx.workdir.inventory_file().display()
    );
    Ok(())
}

fn export(ctx: &Context) -> Result<()> {
    let inventory = inventory(ctx)?;
    let mut writer = csv::Writer::from_writer(std::io::stdout());
    writer.write_record([
        "serial",
        "hostname",
        "mgmt_ip",
        "model",
        "current_version",
        "device_type",
        "peer_serial",
        "ha_state",
    ])?;
    for device in inventory.devices() {
        writer.write_record([
            device.serial.as_str(),
            device.hostname.as_str(),
            device.mgmt_ip.as_str(),
            device.model.as_str(),
            device.current_version.as_str(),
            &device.device_type.to_string(),
            device.peer_serial.as_str(),
            &device.ha_state.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
