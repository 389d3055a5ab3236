use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use viper_rust::handler::{CgCallEventCallback, CgCallback, ConnectionHandler, TunnelMode};
use viper_rust::types::{
    CallType, FsmKey, LogicalAddress, MediaRequest, ReleaseCause, StatusChange, UnitCapability,
    UnitKey,
};
use viper_rust::{CmgError, ConnectionParams, ModeFlags, UreqHttpClient};

// Demo client: connects to a gateway, optionally dials an address and
// prints call events until interrupted.
//
// Usage:
//   cargo run -- --host gw.local --code ABCD-1234
//   cargo run -- --host gw.local --port 5060 --code ABCD-1234 --dial 00010002
//   cargo run -- --host gw.local --code ABCD-1234 --dial 00010002 --video

#[derive(Debug, Parser)]
#[command(name = "viper-cli", about = "Intercom call engine demo client")]
struct Args {
    /// Gateway hostname or address.
    #[arg(long)]
    host: String,

    #[arg(long, default_value_t = 5060)]
    port: u16,

    /// Activation code of this installation.
    #[arg(short, long)]
    code: String,

    /// Logical address to call once connected.
    #[arg(short, long)]
    dial: Option<String>,

    /// Request audio and video instead of audio only.
    #[arg(long)]
    video: bool,

    /// Decode video in software.
    #[arg(long)]
    software_decode: bool,

    #[arg(long)]
    debug: bool,
}

struct Printer;

impl CgCallback for Printer {
    fn on_connected(&self) {
        info!("Connected");
    }

    fn on_disconnected(&self) {
        info!("Disconnected");
    }

    fn on_error(&self, error: CmgError) {
        error!("Connection error: {error}");
    }
}

impl CgCallEventCallback for Printer {
    fn on_status_change(&self, call: FsmKey, change: &StatusChange) {
        info!("{call}: {:?} -> {:?}", change.previous, change.status);
    }

    fn on_incoming_call(&self, call: FsmKey, change: &StatusChange) {
        info!("{call}: incoming {:?} call from {}", change.call_type, change.main_address);
    }

    fn on_capabilities(&self, call: FsmKey, capabilities: UnitCapability) {
        info!("{call}: peer capabilities {capabilities:?}");
    }

    fn on_release(&self, call: FsmKey, cause: ReleaseCause) {
        info!("{call}: released ({cause:?})");
    }

    fn on_media_request(&self, unit: UnitKey, request: MediaRequest) {
        info!("{unit}: media request {request:?}");
    }
}

fn main() {
    let args = Args::parse();

    let default_filter = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let params = match ConnectionParams::builder()
        .hostname(&args.host)
        .port(args.port)
        .activation_code(&args.code)
        .mode(ModeFlags {
            with_ui: true,
            debug: args.debug,
            software_decode: args.software_decode,
        })
        .build()
    {
        Ok(params) => params,
        Err(e) => {
            error!("Invalid parameters: {e}");
            return;
        }
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    rt.block_on(async move {
        let printer = Arc::new(Printer);
        let handler = ConnectionHandler::new(Arc::new(UreqHttpClient::new()));
        handler.set_callback(&printer);
        handler.set_call_event_callback(&printer);

        if handler.connect(params, TunnelMode::Direct).await.is_err() {
            return;
        }

        if let Some(address) = args.dial {
            let call_type = if args.video {
                CallType::AudioVideo
            } else {
                CallType::Audio
            };
            match handler.dial(LogicalAddress::new(address), call_type) {
                Ok(call) => info!("Dialing {call}"),
                Err(e) => warn!("Dial rejected: {e}"),
            }
        }

        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = ticker.tick() => {
                    if !handler.is_connected() {
                        break;
                    }
                }
            }
        }
        handler.disconnect();
    });
}
