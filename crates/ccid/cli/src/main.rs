use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use pcsclike_ccid::{KeyIndex, SecureParameters};
use pcsclike_device::sim::{self, SimCard, SimulatedReader};
use pcsclike_device::{BlockingDevice, Device, DeviceConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// ATR of the cards inserted in the simulated slots
const SIM_ATR: [u8; 11] = [0x3B, 0x8A, 0x80, 0x01, 0x00, 0x31, 0xC1, 0x73, 0xC8, 0x40, 0x00];

#[derive(Parser)]
#[command(version, about = "Drive a simulated CCID reader through the device stack")]
struct Cli {
    /// Number of slots on the simulated reader
    #[arg(long, default_value_t = 1)]
    slots: u8,

    /// Slots left without a card
    #[arg(long = "empty", value_name = "SLOT")]
    empty: Vec<u8>,

    /// Secure channel key in hex, enables the secure channel
    #[arg(long)]
    key: Option<String>,

    /// Key slot used for the authentication
    #[arg(long, default_value_t = 0, requires = "key")]
    key_index: u8,

    /// Give the simulated reader a different key, so the authentication fails
    #[arg(long, requires = "key")]
    wrong_key: bool,

    /// Trace level output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the reader up and show what it reported
    Info,

    /// Send an APDU to the card in a slot
    Transmit {
        /// APDU as a hex string
        #[arg(required = true)]
        apdu: String,

        /// Slot holding the card
        #[arg(long, default_value_t = 0)]
        slot: u8,
    },

    /// Send an escape command to the reader
    Control {
        /// Payload as a hex string
        #[arg(required = true)]
        payload: String,
    },

    /// Wait for a card to be inserted, then removed
    Watch {
        /// Slot to watch
        #[arg(long, default_value_t = 0)]
        slot: u8,

        /// How long to wait for each change, in seconds
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let mut config = DeviceConfig::new()
        .with_slot_count(cli.slots)
        .with_firmware_revision_probe();
    let mut reader = SimulatedReader::new();
    for slot in 0..cli.slots {
        config = config.with_slot_name_probe(slot);
        reader = reader.with_slot(format!("Slot {slot}"));
        if !cli.empty.contains(&slot) {
            reader = reader.with_card(SimCard::new(SIM_ATR.to_vec()));
        }
    }

    if let Some(key) = &cli.key {
        let index = KeyIndex::from(cli.key_index);
        let params = SecureParameters::from_hex(index, key).context("invalid --key")?;
        let reader_params = if cli.wrong_key {
            let mut key = *params.key();
            key[0] ^= 0xFF;
            SecureParameters::new(index, key)
        } else {
            params.clone()
        };
        config = config.with_secure(params);
        reader = reader.with_key(reader_params);
    }

    let (transport, handle, link) = sim::link(reader);
    let device = BlockingDevice::new(Device::new("sim", transport, config), link);
    device.create().context("bring-up failed")?;
    info!("device created");

    match cli.command {
        Commands::Info => {
            let device = device.device();
            let info = device.info();
            println!("Secure channel: {}", device.is_secure());
            if let Some(revision) = &info.firmware_revision {
                println!("Firmware revision: {revision}");
            }
            if let Some(version) = info.version {
                println!("Firmware version: {version}");
            }
            for slot in device.slots().iter() {
                println!(
                    "Slot {}: {} (card present: {})",
                    slot.index(),
                    slot.name(),
                    slot.card_present()
                );
            }
        }
        Commands::Transmit { apdu, slot } => {
            let apdu = hex::decode(apdu.trim()).context("APDU is not valid hex")?;
            let atr = device.connect_card(slot)?;
            info!(slot, atr = %hex::encode(&atr), "card connected");
            let response = device.transmit(slot, apdu)?;
            println!("{}", hex::encode_upper(&response));
            device.disconnect_card(slot)?;
        }
        Commands::Control { payload } => {
            let payload = hex::decode(payload.trim()).context("payload is not valid hex")?;
            let response = device.control(payload)?;
            println!("{}", hex::encode_upper(&response));
        }
        Commands::Watch { slot, timeout } => {
            let timeout = Duration::from_secs(timeout);
            // the simulated reader has nobody to move cards around, so do it here
            handle.remove_card(slot);
            device.wait_for_card_absent(slot, timeout)?;
            println!("Slot {slot}: empty");
            handle.insert_card(slot, SimCard::new(SIM_ATR.to_vec()));
            device.wait_for_card_present(slot, timeout)?;
            println!("Slot {slot}: card inserted");
        }
    }

    device.close()?;
    Ok(())
}

fn setup_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(true)
        .init();
}
